//! Witness service (§4.3): a zero-external-dependency upgrade path from
//! candidate to `VerifiedDirect`, based on inbound peers attesting they
//! reached us at a given address.
//!
//! Distinct protocol id and frame caps from the dial-back service; frames
//! are raw JSON bodies (no length prefix) capped at a fixed size, read with
//! a bounded buffer rather than trusting a length field from the peer.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};

use crate::address::{ip_component, parse_address, Address};
use crate::connection::ConnectionEndpoint;
use crate::coordinator::Coordinator;
use crate::error::WitnessError;

pub const WITNESS_PROTOCOL_ID: &str = "/reach/witness/1.0.0";
pub const MAX_REPORT_SIZE: usize = 4 * 1024;
pub const MAX_ACK_SIZE: usize = 1024;
const REPORT_READ_DEADLINE: Duration = Duration::from_secs(10);
const SENDER_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessReport {
    pub dialed_addr: String,
    #[serde(with = "hex_bytes")]
    pub target_id: Vec<u8>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessAck {
    pub accepted: bool,
    pub reason: Option<String>,
    pub observed_remote_addr: Option<String>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(b: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(b))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

async fn read_capped<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    cap: usize,
) -> Result<Vec<u8>, WitnessError> {
    let mut buf = vec![0u8; cap];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Err(WitnessError::InvalidFrame("empty read".to_string()));
    }
    buf.truncate(n);
    Ok(buf)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sender behavior (§4.3.2): run after a successful outbound connection,
/// entirely asynchronously and without affecting the business connection.
pub async fn send_witness_report<C: ConnectionEndpoint>(
    endpoint: &C,
    peer: PeerId,
    dialed_addr: &Address,
) -> Result<Option<Address>, WitnessError> {
    async_std::future::timeout(SENDER_DEADLINE, send_witness_report_inner(endpoint, peer, dialed_addr))
        .await
        .unwrap_or(Ok(None))
}

async fn send_witness_report_inner<C: ConnectionEndpoint>(
    endpoint: &C,
    peer: PeerId,
    dialed_addr: &Address,
) -> Result<Option<Address>, WitnessError> {
    let mut stream = endpoint.open_stream(peer, WITNESS_PROTOCOL_ID).await?;

    let report = WitnessReport {
        dialed_addr: dialed_addr.to_string(),
        target_id: endpoint.local_peer_id().to_bytes(),
        timestamp: unix_now(),
    };
    let payload = serde_json::to_vec(&report)?;
    if payload.len() > MAX_REPORT_SIZE {
        return Err(WitnessError::InvalidFrame("report too large".to_string()));
    }
    stream.write_all(&payload).await?;

    let ack_bytes = read_capped(&mut stream, MAX_ACK_SIZE).await?;
    let ack: WitnessAck = serde_json::from_slice(&ack_bytes)?;

    if ack.accepted {
        if let Some(observed) = ack.observed_remote_addr.filter(|a| !a.is_empty()) {
            return Ok(parse_address(&observed));
        }
    }
    Ok(None)
}

/// Binds a concrete endpoint and coordinator into the closure expected by
/// `Coordinator::set_witness_sender`: runs the sender path on every outbound
/// connection and, on an accepted ack carrying an observed address, registers
/// it as a fresh `Unverified` candidate (§4.3.2 step 4).
pub fn witness_sender_fn<C: ConnectionEndpoint + 'static>(
    endpoint: Arc<C>,
    coordinator: Coordinator,
) -> impl Fn(PeerId, Address) -> BoxFuture<'static, ()> + Send + Sync {
    move |peer, dialed| {
        let endpoint = endpoint.clone();
        let coordinator = coordinator.clone();
        Box::pin(async move {
            match send_witness_report(endpoint.as_ref(), peer, &dialed).await {
                Ok(Some(observed)) => {
                    coordinator.on_direct_address_candidate(
                        observed,
                        "observed-remote",
                        crate::address::AddressPriority::Unverified,
                    );
                }
                Ok(None) => {}
                Err(e) => log::debug!("witness sender to {} failed: {}", peer, e),
            }
        })
    }
}

/// Receiver behavior (§4.3.3): handle an inbound witness stream.
pub async fn handle_witness_stream<R: AsyncReadExt + AsyncWriteExt + Unpin>(
    stream: &mut R,
    local_peer_id: PeerId,
    remote_peer_id: PeerId,
    remote_addr_for_observation: &Address,
    candidate_known: impl Fn(&Address) -> bool,
    coordinator: &Coordinator,
) -> Result<(), WitnessError> {
    let report_bytes =
        async_std::future::timeout(REPORT_READ_DEADLINE, read_capped(stream, MAX_REPORT_SIZE))
            .await
            .map_err(|_| WitnessError::InvalidFrame("read timed out".to_string()))??;

    let report: WitnessReport = match serde_json::from_slice(&report_bytes) {
        Ok(r) => r,
        Err(_) => {
            return reply(stream, WitnessAck {
                accepted: false,
                reason: Some("malformed report".to_string()),
                observed_remote_addr: None,
            })
            .await;
        }
    };

    if report.target_id != local_peer_id.to_bytes() {
        return reply(stream, WitnessAck {
            accepted: false,
            reason: Some("target mismatch".to_string()),
            observed_remote_addr: None,
        })
        .await;
    }

    let dialed_addr = match parse_address(&report.dialed_addr) {
        Some(a) => a,
        None => {
            return reply(stream, WitnessAck {
                accepted: false,
                reason: Some("unparseable address".to_string()),
                observed_remote_addr: None,
            })
            .await;
        }
    };

    if candidate_known(&dialed_addr) {
        if let Some(remote_ip) = ip_component(remote_addr_for_observation) {
            coordinator.on_inbound_witness(dialed_addr, remote_peer_id, remote_ip);
        }
    }

    reply(stream, WitnessAck {
        accepted: true,
        reason: None,
        observed_remote_addr: Some(remote_addr_for_observation.to_string()),
    })
    .await
}

async fn reply<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    ack: WitnessAck,
) -> Result<(), WitnessError> {
    let payload = serde_json::to_vec(&ack)?;
    if payload.len() > MAX_ACK_SIZE {
        return Err(WitnessError::InvalidFrame("ack too large".to_string()));
    }
    writer.write_all(&payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[test]
    fn ack_roundtrips_through_json() {
        let ack = WitnessAck {
            accepted: true,
            reason: None,
            observed_remote_addr: Some("/ip4/1.2.3.4/udp/4001/quic-v1".to_string()),
        };
        let json = serde_json::to_vec(&ack).unwrap();
        let back: WitnessAck = serde_json::from_slice(&json).unwrap();
        assert!(back.accepted);
    }

    #[test]
    fn empty_read_is_invalid_frame() {
        async_std::task::block_on(async {
            let mut cursor = Cursor::new(Vec::<u8>::new());
            let result = read_capped(&mut cursor, MAX_REPORT_SIZE).await;
            assert!(matches!(result, Err(WitnessError::InvalidFrame(_))));
        });
    }
}
