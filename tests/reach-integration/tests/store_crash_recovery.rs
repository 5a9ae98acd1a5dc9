//! End-to-end scenario 6 (§8): a crash between writing the temp file and
//! renaming it over the real path must never corrupt or lose the prior
//! coherent version, even with a realistically large table.

use std::time::Duration;

use core_reach::address::AddressPriority;
use core_reach::store::{unix_now, PersistentStore, StoredEntry};

fn entry(i: usize) -> StoredEntry {
    StoredEntry {
        addr: format!("/ip4/10.0.{}.{}/udp/4001/quic-v1", i / 256, i % 256),
        priority: AddressPriority::Unverified,
        source: "stun".to_string(),
        sources: vec!["stun".to_string()],
        verified: false,
        verified_at: None,
        last_seen: unix_now(),
    }
}

#[async_std::test]
async fn crash_between_tmp_write_and_rename_preserves_the_prior_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("direct_addrs.json");

    let (store, _) = PersistentStore::open(
        &path,
        1000,
        Duration::from_secs(7200),
        Duration::from_secs(86400),
    )
    .unwrap();
    for i in 0..500 {
        store.put_candidate(&format!("seed-{}", i), entry(i));
    }
    store.flush(unix_now()).unwrap();

    // Simulate a later update that crashes after the temp file is written
    // but before the rename (§4.4.2 step 3 vs. step 4): write a fresh temp
    // file directly, leaving the real path exactly as the prior flush left it.
    let tmp_path = {
        let mut p = path.clone().into_os_string();
        p.push(".tmp");
        std::path::PathBuf::from(p)
    };
    std::fs::write(&tmp_path, b"{\"version\":1,\"updated_at\":0,\"candidates\":{\"truncated").unwrap();

    let (_reopened, loaded) = PersistentStore::open(
        &path,
        1000,
        Duration::from_secs(7200),
        Duration::from_secs(86400),
    )
    .unwrap();

    assert_eq!(loaded.candidates.len(), 500);
    for i in 0..500 {
        assert!(loaded.candidates.contains_key(&format!("seed-{}", i)));
    }
}
