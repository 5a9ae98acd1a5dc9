//! The minimal "connection endpoint" interface this subsystem requires from
//! its hosting runtime (§6). The dial-back and witness services are written
//! against this trait rather than against a concrete transport, so they can
//! be exercised in tests without a real libp2p swarm.

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use libp2p::PeerId;

/// A bidirectional byte stream opened on a single protocol, scoped to one
/// request/response (dial-back) or report/ack (witness) exchange.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// What the dial-back helper side needs in order to prove it can really
/// reach a candidate address: a full identity-authenticating handshake,
/// not a bare transport connect (§4.2.4, §9).
#[async_trait]
pub trait HandshakeVerifier: Send + Sync {
    /// Dials `addr` and performs the peer protocol's full handshake,
    /// returning the remote peer id the handshake authenticated as.
    /// Implementations must fail if the authenticated peer id does not
    /// match `expected_peer`.
    async fn verify_handshake(
        &self,
        addr: &crate::address::Address,
        expected_peer: PeerId,
    ) -> std::io::Result<()>;
}

/// The connection-layer operations the reachability subsystem consumes.
/// Implemented by the hosting runtime; this crate never owns a transport.
#[async_trait]
pub trait ConnectionEndpoint: Send + Sync {
    type Stream: Stream;

    /// Opens (or reuses) a connection to `peer`. The subsystem never closes
    /// connections it opens this way — only streams (§9 connection lifecycle
    /// discipline).
    async fn open_connection(&self, peer: PeerId) -> std::io::Result<()>;

    /// Opens a new stream to `peer` on the given protocol id.
    async fn open_stream(&self, peer: PeerId, protocol: &'static str) -> std::io::Result<Self::Stream>;

    /// Registers a handler for inbound streams opened on `protocol`.
    /// Removing a handler is done by registering a no-op handler for the
    /// same protocol id; there is no separate unregister call because the
    /// subsystem only ever registers for its own lifetime.
    fn register_protocol_handler(&self, protocol: &'static str);

    /// Local node id, used to populate `target_id` in witness reports.
    fn local_peer_id(&self) -> PeerId;
}
