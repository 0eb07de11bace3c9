//! The replica's RPC server.
//!
//! One listener accepts both peer traffic (`RequestVote`, `AppendEntries`)
//! and client traffic (`Put`, `Get`, `Delete`) over the framed protocol.
//! Each connection gets its own thread; requests on a connection are
//! handled in order. Consensus handlers answer from the node directly;
//! client operations go through the façade.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use helm_raft::{read_frame, write_frame, ReplicatedStore, Request, Response, StatusInfo};

use crate::ServerError;

/// How often the accept loop checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// A running RPC server for one replica.
pub struct Server {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds the replica's address and starts accepting connections.
    pub fn start(store: ReplicatedStore) -> Result<Self, ServerError> {
        let bind = store.node().addr();
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        info!(node = %store.node().id(), addr = %addr, "rpc server listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_handle = thread::Builder::new()
            .name(format!("accept-{}", store.node().id()))
            .spawn(move || accept_loop(listener, store, accept_shutdown))
            .map_err(ServerError::Io)?;

        Ok(Self {
            addr,
            shutdown,
            accept_handle: Some(accept_handle),
        })
    }

    /// Returns the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting connections and waits for the accept loop.
    ///
    /// In-flight connections finish their current request and close when
    /// the client disconnects.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }

    /// Blocks until the server is shut down.
    pub fn join(&mut self) {
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Accepts connections until shutdown.
fn accept_loop(listener: TcpListener, store: ReplicatedStore, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                trace!(peer = %peer, "connection accepted");
                let store = store.clone();
                let spawned = thread::Builder::new()
                    .name(format!("conn-{peer}"))
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, &store) {
                            debug!(peer = %peer, error = %e, "connection closed");
                        }
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "failed to spawn connection thread");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Serves framed requests on one connection until EOF.
fn serve_connection(mut stream: TcpStream, store: &ReplicatedStore) -> Result<(), ServerError> {
    stream.set_nodelay(true)?;

    loop {
        let request = match read_frame::<Request, _>(&mut stream)? {
            Some(request) => request,
            None => return Ok(()), // clean EOF
        };

        let response = dispatch(store, request);
        write_frame(&mut stream, &response)?;
    }
}

/// Routes one request to the node or the façade.
fn dispatch(store: &ReplicatedStore, request: Request) -> Response {
    match request {
        Request::RequestVote(vote) => {
            Response::RequestVote(store.node().handle_request_vote(vote))
        }
        Request::AppendEntries(append) => {
            Response::AppendEntries(store.node().handle_append_entries(append))
        }
        Request::Put { key, value } => match store.put(key, value) {
            Ok(()) => Response::Put {
                success: true,
                error: None,
            },
            Err(e) => Response::Put {
                success: false,
                error: Some(e.to_client_error()),
            },
        },
        Request::Get { key } => match store.get(&key) {
            Ok(value) => Response::Get {
                found: value.is_some(),
                value,
                error: None,
            },
            Err(e) => Response::Get {
                value: None,
                found: false,
                error: Some(e.to_client_error()),
            },
        },
        Request::Delete { key } => match store.delete(key) {
            Ok(()) => Response::Delete {
                success: true,
                error: None,
            },
            Err(e) => Response::Delete {
                success: false,
                error: Some(e.to_client_error()),
            },
        },
        Request::Status => {
            let node = store.node();
            let status = node.status();
            Response::Status(StatusInfo {
                id: node.id().clone(),
                role: status.role.to_string(),
                term: status.term,
                commit_index: status.commit_index,
                last_applied: status.last_applied,
                leader: node.leader_addr().map(|a| a.to_string()),
                keys: node.local_size(),
            })
        }
    }
}
