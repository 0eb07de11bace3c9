//! Interactive client shell.
//!
//! Reads `put <k> <v>` / `get <k>` / `delete <k>` / `quit` lines from
//! stdin and runs them against the cluster. Keys and values here are
//! whitespace-delimited tokens; the wire protocol underneath is binary
//! safe, the shell is just a convenience surface.

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;

use helm_raft::ClientError;

use crate::client::{ClientFailure, KvClient};

/// Runs the shell until `quit` or EOF.
pub fn run(server: SocketAddr) -> io::Result<()> {
    let mut client = KvClient::new(server);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    println!("helm shell connected to {server}");
    println!("commands: put <key> <value> | get <key> | delete <key> | status | quit");

    loop {
        print!("helm> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }

        match run_line(&mut client, &line) {
            Outcome::Continue => {}
            Outcome::Quit => break,
        }
    }

    Ok(())
}

enum Outcome {
    Continue,
    Quit,
}

/// Parses and executes one shell line.
fn run_line(client: &mut KvClient, line: &str) -> Outcome {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Outcome::Continue;
    };

    match command {
        "quit" | "exit" => return Outcome::Quit,
        "put" => match (parts.next(), parts.next()) {
            (Some(key), Some(value)) => {
                report(client.put(key.as_bytes().to_vec(), value.as_bytes().to_vec()), || {
                    "OK".to_string()
                });
            }
            _ => println!("usage: put <key> <value>"),
        },
        "get" => match parts.next() {
            Some(key) => match client.get(key.as_bytes().to_vec()) {
                Ok(Some(value)) => println!("{}", String::from_utf8_lossy(&value)),
                Ok(None) => println!("(not found)"),
                Err(e) => print_error(&e),
            },
            None => println!("usage: get <key>"),
        },
        "delete" | "del" => match parts.next() {
            Some(key) => {
                report(client.delete(key.as_bytes().to_vec()), || "OK".to_string());
            }
            None => println!("usage: delete <key>"),
        },
        "status" => match client.status() {
            Ok(info) => {
                println!(
                    "replica {} is {} at {} (commit {}, applied {}, {} keys)",
                    info.id, info.role, info.term, info.commit_index, info.last_applied, info.keys
                );
                match info.leader {
                    Some(leader) => println!("leader: {leader}"),
                    None => println!("leader: unknown"),
                }
            }
            Err(e) => print_error(&e),
        },
        other => println!("unknown command '{other}'"),
    }

    Outcome::Continue
}

fn report(result: Result<(), ClientFailure>, ok: impl FnOnce() -> String) {
    match result {
        Ok(()) => println!("{}", ok()),
        Err(e) => print_error(&e),
    }
}

fn print_error(error: &ClientFailure) {
    match error {
        ClientFailure::Cluster(ClientError::NotFound) => println!("(not found)"),
        ClientFailure::Cluster(ClientError::NoLeader) => {
            println!("error: no leader yet, retry shortly");
        }
        other => println!("error: {other}"),
    }
}
