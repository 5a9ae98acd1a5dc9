//! Dial-back verification service (§4.2): wire protocol, requester side,
//! helper-pool aggregation, and helper side.
//!
//! Frame format mirrors `stream_protocol.rs`'s length-prefixed framing:
//! a 4-byte big-endian length prefix followed by a JSON payload.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::io::{AsyncReadExt, AsyncWriteExt};
use libp2p::PeerId;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::connection::{ConnectionEndpoint, HandshakeVerifier};
use crate::coordinator::Coordinator;
use crate::error::DialBackError;

pub const DIAL_BACK_PROTOCOL_ID: &str = "/reach/dial-back/1.0.0";
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialResult {
    pub addr: String,
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialBackRequest {
    pub addrs: Vec<String>,
    #[serde(with = "hex_nonce")]
    pub nonce: [u8; 16],
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialBackResponse {
    #[serde(with = "hex_nonce")]
    pub nonce: [u8; 16],
    pub reachable: Vec<String>,
    pub dial_results: Vec<DialResult>,
    pub error: Option<String>,
}

mod hex_nonce {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(n: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(n))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("nonce must be 16 bytes"))
    }
}

/// Writes a length-prefixed frame: `[len: u32 BE][payload]`.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), DialBackError> {
    if payload.is_empty() || payload.len() > MAX_FRAME_SIZE {
        return Err(DialBackError::InvalidFrame(format!(
            "payload length {} out of bounds",
            payload.len()
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Reads a length-prefixed frame, rejecting zero-length and over-size frames.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, DialBackError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(DialBackError::InvalidFrame(format!(
            "frame length {} out of bounds",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Generates a fresh 16-byte nonce from a cryptographically strong source.
pub fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Requester side of the dial-back protocol (§4.2.2).
pub struct DialBackRequester<C: ConnectionEndpoint> {
    endpoint: Arc<C>,
    request_timeout: Duration,
    max_addrs_per_request: usize,
}

impl<C: ConnectionEndpoint> DialBackRequester<C> {
    pub fn new(endpoint: Arc<C>, request_timeout: Duration, max_addrs_per_request: usize) -> Self {
        Self {
            endpoint,
            request_timeout,
            max_addrs_per_request,
        }
    }

    /// Asks `helper` to dial back every address in `candidates` (trimmed to
    /// `max_addrs_per_request`), returning the subset confirmed reachable.
    /// Does not close the connection to `helper` — only the stream it opens.
    pub async fn verify_with_helper(
        &self,
        helper: PeerId,
        candidates: &[Address],
    ) -> Result<Vec<Address>, DialBackError> {
        let trimmed: Vec<Address> = candidates
            .iter()
            .take(self.max_addrs_per_request)
            .cloned()
            .collect();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let nonce = generate_nonce();
        let request = DialBackRequest {
            addrs: trimmed.iter().map(|a| a.to_string()).collect(),
            nonce,
            timeout_ms: self.request_timeout.as_millis() as u64,
        };

        self.endpoint.open_connection(helper).await?;
        let mut stream = self.endpoint.open_stream(helper, DIAL_BACK_PROTOCOL_ID).await?;

        let payload = serde_json::to_vec(&request)?;
        async_std::future::timeout(self.request_timeout, write_frame(&mut stream, &payload))
            .await
            .map_err(|_| DialBackError::Timeout)??;

        let response_bytes =
            async_std::future::timeout(self.request_timeout, read_frame(&mut stream))
                .await
                .map_err(|_| DialBackError::Timeout)??;
        let response: DialBackResponse = serde_json::from_slice(&response_bytes)?;

        if response.nonce != nonce {
            return Err(DialBackError::NonceMismatch);
        }
        if let Some(err) = response.error {
            return Err(DialBackError::HelperError(err));
        }

        let requested: HashSet<String> = request.addrs.into_iter().collect();
        let survivors: Vec<Address> = response
            .reachable
            .into_iter()
            .filter(|a| requested.contains(a))
            .filter_map(|a| a.parse::<Address>().ok())
            .collect();
        Ok(survivors)
    }
}

/// Helper-pool aggregation (§4.2.3): ask every known helper concurrently,
/// tally per-candidate reachability, and accept candidates that reach
/// `min_verifications`.
pub async fn verify_with_helper_pool<C: ConnectionEndpoint>(
    requester: &DialBackRequester<C>,
    configured_helpers: &[PeerId],
    connected_peers: &[PeerId],
    candidates: &[Address],
    min_verifications: usize,
    fan_out: usize,
) -> Result<Vec<Address>, DialBackError> {
    let mut helpers: Vec<PeerId> = Vec::new();
    let mut seen = HashSet::new();
    for p in configured_helpers.iter().chain(connected_peers.iter()) {
        if seen.insert(*p) {
            helpers.push(*p);
        }
    }
    if helpers.is_empty() {
        return Err(DialBackError::NoHelper);
    }

    let mut tally: HashMap<String, usize> = HashMap::new();
    let mut first_error: Option<DialBackError> = None;
    let mut chunks = helpers.chunks(fan_out.max(1));

    while let Some(batch) = chunks.next() {
        let futs = batch
            .iter()
            .map(|helper| requester.verify_with_helper(*helper, candidates));
        let results = futures::future::join_all(futs).await;
        for result in results {
            match result {
                Ok(reachable) => {
                    for addr in reachable {
                        *tally.entry(addr.to_string()).or_insert(0) += 1;
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
    }

    let accepted: Vec<Address> = candidates
        .iter()
        .filter(|addr| tally.get(&addr.to_string()).copied().unwrap_or(0) >= min_verifications)
        .cloned()
        .collect();

    if accepted.is_empty() {
        if let Some(e) = first_error {
            return Err(e);
        }
    }
    Ok(accepted)
}

/// Helper side of the dial-back protocol (§4.2.4): verify a request's
/// candidates with a full handshake and reply with those that succeeded.
pub async fn handle_dial_back_request<V: HandshakeVerifier>(
    verifier: &V,
    requester: PeerId,
    request_bytes: &[u8],
    max_addrs_per_request: usize,
    max_concurrent_dial_backs: usize,
    local_dial_back_timeout: Duration,
) -> Result<Vec<u8>, DialBackError> {
    let request: DialBackRequest = serde_json::from_slice(request_bytes)?;
    let addrs: Vec<Address> = request
        .addrs
        .iter()
        .take(max_addrs_per_request)
        .filter_map(|a| a.parse::<Address>().ok())
        .collect();

    let per_dial_timeout = Duration::from_millis(request.timeout_ms).min(local_dial_back_timeout);

    let mut results = Vec::with_capacity(addrs.len());
    for batch in addrs.chunks(max_concurrent_dial_backs.max(1)) {
        let futs = batch.iter().map(|addr| async {
            let started = Instant::now();
            let outcome =
                async_std::future::timeout(per_dial_timeout, verifier.verify_handshake(addr, requester))
                    .await;
            let latency_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(Ok(())) => DialResult {
                    addr: addr.to_string(),
                    success: true,
                    latency_ms,
                    error: None,
                },
                Ok(Err(e)) => DialResult {
                    addr: addr.to_string(),
                    success: false,
                    latency_ms,
                    error: Some(e.to_string()),
                },
                Err(_) => DialResult {
                    addr: addr.to_string(),
                    success: false,
                    latency_ms,
                    error: Some("timed out".to_string()),
                },
            }
        });
        results.extend(futures::future::join_all(futs).await);
    }

    let reachable: Vec<String> = results
        .iter()
        .filter(|r| r.success)
        .map(|r| r.addr.clone())
        .collect();

    let response = DialBackResponse {
        nonce: request.nonce,
        reachable,
        dial_results: results,
        error: None,
    };
    Ok(serde_json::to_vec(&response)?)
}

/// Called after a successful requester-side round: credits every survivor to
/// the coordinator as a verified direct address (§4.2.2 step 7).
pub fn credit_survivors(coordinator: &Coordinator, survivors: &[Address]) {
    for addr in survivors {
        coordinator.on_direct_address_verified(
            addr.clone(),
            "dial-back",
            crate::address::AddressPriority::VerifiedDirect,
        );
    }
}
