//! Client for the replica RPC protocol.
//!
//! Keeps one connection to a replica, reconnecting as needed. Writes must
//! land on the leader; on a `NotLeader` answer carrying the leader's
//! address the client re-targets and retries a bounded number of times.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use helm_raft::{read_frame, write_frame, ClientError, FramingError, Request, Response, StatusInfo};

/// Redirect hops a single operation will follow.
const MAX_REDIRECTS: usize = 4;

/// Bound on handing a request to a replica (dial + write).
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for the reply; sits above the replica's 10s commit
/// wait so server-side timeouts surface as protocol errors, not socket
/// errors.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors surfaced by [`KvClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientFailure {
    /// Socket or framing trouble talking to the replica.
    #[error("connection to {addr}: {reason}")]
    Connection { addr: SocketAddr, reason: String },

    /// The cluster answered with an error.
    #[error(transparent)]
    Cluster(#[from] ClientError),

    /// The replica answered with the wrong response type.
    #[error("protocol violation: expected {expected}, got {actual}")]
    Protocol {
        expected: &'static str,
        actual: &'static str,
    },

    /// Redirected more than [`MAX_REDIRECTS`] times without reaching a
    /// leader.
    #[error("too many leader redirects")]
    TooManyRedirects,
}

/// A connection-holding client for one cluster.
pub struct KvClient {
    addr: SocketAddr,
    submit_timeout: Duration,
    response_timeout: Duration,
    stream: Option<TcpStream>,
}

impl KvClient {
    /// Creates a client targeting the given replica.
    ///
    /// Connection is lazy; the first call dials.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            submit_timeout: SUBMIT_TIMEOUT,
            response_timeout: RESPONSE_TIMEOUT,
            stream: None,
        }
    }

    /// Overrides both timeouts (tests use short bounds).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self.response_timeout = timeout;
        self
    }

    /// Returns the replica currently targeted.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stores a key/value pair.
    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<(), ClientFailure> {
        let key = key.into();
        let value = value.into();

        self.with_redirects(|client| {
            let response = client.call(Request::Put {
                key: key.clone(),
                value: value.clone(),
            })?;
            match response {
                Response::Put { success: true, .. } => Ok(()),
                Response::Put {
                    error: Some(error), ..
                } => Err(error.into()),
                Response::Put { .. } => Err(ClientError::Internal("put failed".into()).into()),
                other => Err(ClientFailure::Protocol {
                    expected: "Put",
                    actual: other.name(),
                }),
            }
        })
    }

    /// Reads a key from the leader.
    pub fn get(&mut self, key: impl Into<Bytes>) -> Result<Option<Bytes>, ClientFailure> {
        let key = key.into();

        self.with_redirects(|client| {
            let response = client.call(Request::Get { key: key.clone() })?;
            match response {
                Response::Get { error: Some(error), .. } => Err(error.into()),
                Response::Get { value, found, .. } => {
                    debug_assert_eq!(found, value.is_some());
                    Ok(value)
                }
                other => Err(ClientFailure::Protocol {
                    expected: "Get",
                    actual: other.name(),
                }),
            }
        })
    }

    /// Removes a key.
    pub fn delete(&mut self, key: impl Into<Bytes>) -> Result<(), ClientFailure> {
        let key = key.into();

        self.with_redirects(|client| {
            let response = client.call(Request::Delete { key: key.clone() })?;
            match response {
                Response::Delete { success: true, .. } => Ok(()),
                Response::Delete {
                    error: Some(error), ..
                } => Err(error.into()),
                Response::Delete { .. } => {
                    Err(ClientError::Internal("delete failed".into()).into())
                }
                other => Err(ClientFailure::Protocol {
                    expected: "Delete",
                    actual: other.name(),
                }),
            }
        })
    }

    /// Reports the targeted replica's consensus state.
    pub fn status(&mut self) -> Result<StatusInfo, ClientFailure> {
        match self.call(Request::Status)? {
            Response::Status(info) => Ok(info),
            other => Err(ClientFailure::Protocol {
                expected: "Status",
                actual: other.name(),
            }),
        }
    }

    /// Runs an operation, following leader redirects.
    fn with_redirects<T>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> Result<T, ClientFailure>,
    ) -> Result<T, ClientFailure> {
        for _ in 0..MAX_REDIRECTS {
            match op(self) {
                Err(ClientFailure::Cluster(ClientError::NotLeader {
                    leader: Some(leader),
                })) => {
                    let Ok(addr) = leader.parse::<SocketAddr>() else {
                        return Err(ClientError::NotLeader {
                            leader: Some(leader),
                        }
                        .into());
                    };
                    debug!(from = %self.addr, to = %addr, "following leader redirect");
                    self.retarget(addr);
                }
                other => return other,
            }
        }
        Err(ClientFailure::TooManyRedirects)
    }

    /// Points the client at a different replica.
    pub fn retarget(&mut self, addr: SocketAddr) {
        self.addr = addr;
        self.stream = None;
    }

    /// One framed request/response exchange, reconnecting once on a stale
    /// connection.
    fn call(&mut self, request: Request) -> Result<Response, ClientFailure> {
        match self.try_call(&request) {
            Err(ClientFailure::Connection { .. }) if self.stream.is_none() => {
                // The cached connection had gone away; one fresh dial.
                self.try_call(&request)
            }
            other => other,
        }
    }

    fn try_call(&mut self, request: &Request) -> Result<Response, ClientFailure> {
        let connection_error = |addr: SocketAddr, reason: String| ClientFailure::Connection {
            addr,
            reason,
        };

        if self.stream.is_none() {
            let stream = TcpStream::connect_timeout(&self.addr, self.submit_timeout)
                .map_err(|e| connection_error(self.addr, e.to_string()))?;
            stream
                .set_read_timeout(Some(self.response_timeout))
                .map_err(|e| connection_error(self.addr, e.to_string()))?;
            stream
                .set_write_timeout(Some(self.submit_timeout))
                .map_err(|e| connection_error(self.addr, e.to_string()))?;
            stream
                .set_nodelay(true)
                .map_err(|e| connection_error(self.addr, e.to_string()))?;
            self.stream = Some(stream);
        }

        let stream = self.stream.as_mut().expect("stream just connected");
        let result: Result<Option<Response>, FramingError> =
            match write_frame(&mut *stream, request) {
                Ok(()) => read_frame(&mut *stream),
                Err(e) => Err(e),
            };

        match result {
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                self.stream = None;
                Err(connection_error(
                    self.addr,
                    "connection closed before reply".into(),
                ))
            }
            Err(e) => {
                self.stream = None;
                let reason = match e {
                    FramingError::Io(ref io_err)
                        if io_err.kind() == io::ErrorKind::WouldBlock
                            || io_err.kind() == io::ErrorKind::TimedOut =>
                    {
                        "request timed out".into()
                    }
                    other => other.to_string(),
                };
                Err(connection_error(self.addr, reason))
            }
        }
    }
}

impl std::fmt::Debug for KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvClient")
            .field("addr", &self.addr)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}
