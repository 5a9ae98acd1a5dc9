//! Plain-data configuration for the reachability subsystem (§10.3).
//!
//! The core never loads this itself — files, flags, and fx-style wiring are
//! the embedding application's job (§1). This type only carries the values
//! and their defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub enable_dial_back: bool,
    pub enable_as_helper: bool,
    pub trusted_helpers: Vec<String>,

    #[serde(with = "duration_millis")]
    pub dial_back_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub verification_interval: Duration,

    pub max_concurrent_dial_backs: usize,
    pub min_verifications: usize,
    pub max_addrs_per_request: usize,
    pub max_verified_direct_addrs: usize,

    pub min_witnesses: usize,
    pub witness_ipv4_prefix: u8,
    pub witness_ipv6_prefix: u8,
    #[serde(with = "duration_millis")]
    pub witness_ttl: Duration,

    pub direct_addr_store_path: PathBuf,
    #[serde(with = "duration_millis")]
    pub candidate_ttl: Duration,
    #[serde(with = "duration_millis")]
    pub verified_ttl: Duration,
    pub max_store_entries: usize,
    #[serde(with = "duration_millis")]
    pub flush_debounce: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enable_dial_back: true,
            enable_as_helper: true,
            trusted_helpers: Vec::new(),

            dial_back_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            verification_interval: Duration::from_secs(5 * 60),

            max_concurrent_dial_backs: 3,
            min_verifications: 1,
            max_addrs_per_request: 10,
            max_verified_direct_addrs: 3,

            min_witnesses: 2,
            witness_ipv4_prefix: 24,
            witness_ipv6_prefix: 48,
            witness_ttl: Duration::from_secs(30 * 60),

            direct_addr_store_path: default_store_path(),
            candidate_ttl: Duration::from_secs(2 * 60 * 60),
            verified_ttl: Duration::from_secs(24 * 60 * 60),
            max_store_entries: 1000,
            flush_debounce: Duration::from_secs(1),
        }
    }
}

fn default_store_path() -> PathBuf {
    dirs_home().join(".dep2p").join("direct_addrs.json")
}

/// Minimal `$HOME` lookup; embedding applications are expected to override
/// `direct_addr_store_path` explicitly in most deployments.
fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.max_verified_direct_addrs, 3);
        assert_eq!(cfg.min_witnesses, 2);
        assert_eq!(cfg.witness_ipv4_prefix, 24);
        assert_eq!(cfg.witness_ipv6_prefix, 48);
        assert_eq!(cfg.max_concurrent_dial_backs, 3);
        assert_eq!(cfg.max_addrs_per_request, 10);
        assert_eq!(cfg.max_store_entries, 1000);
        assert_eq!(cfg.flush_debounce, Duration::from_secs(1));
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = CoordinatorConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CoordinatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.min_witnesses, cfg.min_witnesses);
    }
}
