//! TCP transport for peer RPCs.
//!
//! Each call opens a connection to the peer's RPC server, writes one
//! framed request, and reads one framed response. Connections are
//! deliberately per-call: peer failures then cost one failed dial instead
//! of a wedged pool, and the leader's retry cadence (heartbeat interval)
//! bounds the reconnect rate. Blocking I/O is fine here — calls are always
//! made from replicator or election threads with no raft lock held.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use helm_types::NodeId;

use crate::framing::{read_frame, write_frame};
use crate::message::{AppendRequest, AppendResponse, Request, Response, VoteRequest, VoteResponse};
use crate::registry::ClusterRegistry;
use crate::transport::{Transport, TransportError};

/// Default per-call socket timeout.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Peer RPC transport over framed, blocking TCP.
#[derive(Debug)]
pub struct TcpTransport {
    registry: Arc<ClusterRegistry>,
    call_timeout: Duration,
}

impl TcpTransport {
    /// Creates a transport resolving peers through the registry.
    pub fn new(registry: Arc<ClusterRegistry>) -> Self {
        Self {
            registry,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Overrides the per-call socket timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Performs one framed request/response exchange with a peer.
    fn call(&self, to: &NodeId, request: Request) -> Result<Response, TransportError> {
        let addr = self
            .registry
            .address_of(to)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;

        trace!(peer = %to, addr = %addr, rpc = request.name(), "outbound call");

        let mut stream = TcpStream::connect_timeout(&addr, self.call_timeout)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        stream
            .set_read_timeout(Some(self.call_timeout))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        stream
            .set_write_timeout(Some(self.call_timeout))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Io(e.to_string()))?;

        write_frame(&mut stream, &request).map_err(|e| TransportError::Io(e.to_string()))?;

        match read_frame::<Response, _>(&mut stream) {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(TransportError::Io("connection closed before reply".into())),
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }
}

impl Transport for TcpTransport {
    fn request_vote(
        &self,
        to: &NodeId,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        match self.call(to, Request::RequestVote(request))? {
            Response::RequestVote(response) => Ok(response),
            other => Err(TransportError::Protocol(format!(
                "expected RequestVote reply, got {}",
                other.name()
            ))),
        }
    }

    fn append_entries(
        &self,
        to: &NodeId,
        request: AppendRequest,
    ) -> Result<AppendResponse, TransportError> {
        match self.call(to, Request::AppendEntries(request))? {
            Response::AppendEntries(response) => Ok(response),
            other => Err(TransportError::Protocol(format!(
                "expected AppendEntries reply, got {}",
                other.name()
            ))),
        }
    }
}
