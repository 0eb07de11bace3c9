//! End-to-end tests over real TCP sockets.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::tempdir;

use helm_raft::{ClientError, RaftConfig};
use helm_store::EngineKind;

use crate::{bootstrap, ClientFailure, KvClient, Server, ServerConfig};

fn eventually(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("test addr")
}

#[test]
fn single_replica_round_trip_over_tcp() {
    let dir = tempdir().unwrap();
    let config = ServerConfig::single("s1", addr(21801), dir.path()).with_engine(EngineKind::Tree);

    let replica = bootstrap(&config, RaftConfig::fast()).unwrap();
    let node = replica.store.node().clone();
    let mut server = Server::start(replica.store).unwrap();

    assert!(
        eventually(Duration::from_secs(1), || node.is_leader()),
        "single replica did not elect itself"
    );

    let mut client = KvClient::new(server.addr()).with_timeout(Duration::from_secs(2));

    client.put(&b"hello"[..], &b"world"[..]).unwrap();
    assert_eq!(client.get(&b"hello"[..]).unwrap(), Some(Bytes::from("world")));

    let status = client.status().unwrap();
    assert_eq!(status.role, "leader");
    assert_eq!(status.keys, 1);

    client.delete(&b"hello"[..]).unwrap();
    assert_eq!(client.get(&b"hello"[..]).unwrap(), None);

    // Delete of a missing key surfaces NotFound over the wire.
    assert!(matches!(
        client.delete(&b"hello"[..]),
        Err(ClientFailure::Cluster(ClientError::NotFound))
    ));

    server.shutdown();
    node.shutdown();
    replica.registry.stop_monitor();
}

#[test]
fn index_survives_replica_restart() {
    let dir = tempdir().unwrap();
    let bind = addr(21811);

    {
        let config =
            ServerConfig::single("s1", bind, dir.path()).with_engine(EngineKind::Tree);
        let replica = bootstrap(&config, RaftConfig::fast()).unwrap();
        let node = replica.store.node().clone();
        let mut server = Server::start(replica.store).unwrap();
        assert!(eventually(Duration::from_secs(1), || node.is_leader()));

        let mut client = KvClient::new(server.addr()).with_timeout(Duration::from_secs(2));
        client.put(&b"persistent"[..], &b"bit"[..]).unwrap();

        server.shutdown();
        node.shutdown();
    }

    // A fresh process over the same data directory serves the old key.
    // The log is not persisted, but the applied index is.
    let config = ServerConfig::single("s1", bind, dir.path()).with_engine(EngineKind::Tree);
    let replica = bootstrap(&config, RaftConfig::fast()).unwrap();
    let node = replica.store.node().clone();

    assert_eq!(
        node.local_get(b"persistent").unwrap(),
        Some(Bytes::from("bit"))
    );
    node.shutdown();
}

#[test]
fn three_replicas_over_tcp_with_redirects() {
    let dirs: Vec<_> = (0..3).map(|_| tempdir().unwrap()).collect();
    let addrs = [addr(21821), addr(21822), addr(21823)];
    let ids = ["t1", "t2", "t3"];

    let mut replicas = Vec::new();
    let mut servers = Vec::new();
    for i in 0..3 {
        let mut config = ServerConfig::single(ids[i], addrs[i], dirs[i].path())
            .with_engine(EngineKind::Memory);
        for j in 0..3 {
            if i != j {
                config = config.with_peer(ids[j], addrs[j]);
            }
        }

        let replica = bootstrap(&config, RaftConfig::fast()).unwrap();
        servers.push(Server::start(replica.store.clone()).unwrap());
        replicas.push(replica);
    }

    let nodes: Vec<_> = replicas.iter().map(|r| r.store.node().clone()).collect();
    assert!(
        eventually(Duration::from_secs(3), || {
            nodes.iter().filter(|n| n.is_leader()).count() == 1
        }),
        "no leader over TCP"
    );

    // Talk to a follower on purpose; the client follows the redirect.
    let follower_addr = nodes
        .iter()
        .find(|n| !n.is_leader())
        .map(|n| n.addr())
        .expect("a follower exists");
    let mut client = KvClient::new(follower_addr).with_timeout(Duration::from_secs(2));

    client.put(&b"routed"[..], &b"value"[..]).unwrap();
    assert_eq!(client.get(&b"routed"[..]).unwrap(), Some(Bytes::from("value")));

    // Every replica converges on the applied write.
    assert!(
        eventually(Duration::from_secs(2), || {
            nodes.iter().all(|n| {
                n.local_get(b"routed").ok().flatten() == Some(Bytes::from("value"))
            })
        }),
        "replicas did not converge"
    );

    for mut server in servers {
        server.shutdown();
    }
    for node in nodes {
        node.shutdown();
    }
    for replica in &replicas {
        replica.registry.stop_monitor();
    }
}
