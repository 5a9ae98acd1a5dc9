//! Error taxonomy (§7, §10.2). One enum per service, mirroring the
//! `RelayError` / `DiscoveryError` / `MeshError` pattern used throughout
//! this codebase's mesh crate.

use thiserror::Error;

/// Errors surfaced by the dial-back service.
#[derive(Debug, Error)]
pub enum DialBackError {
    #[error("no helper available")]
    NoHelper,

    #[error("response nonce did not match")]
    NonceMismatch,

    #[error("verification timed out")]
    Timeout,

    #[error("service is stopped")]
    ServiceStopped,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("helper reported error: {0}")]
    HelperError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors surfaced by the witness service.
#[derive(Debug, Error)]
pub enum WitnessError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("service is stopped")]
    ServiceStopped,

    #[error("target id mismatch")]
    TargetMismatch,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors surfaced by the persistent direct-address store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Internal error attached to the `Failed` terminal state of the
/// discover→validate→publish state machine.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("dial-back error: {0}")]
    DialBack(#[from] DialBackError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("state machine retries exhausted")]
    RetriesExhausted,

    #[error("state machine cancelled")]
    Cancelled,
}
