//! End-to-end scenarios 1-4 (§8), exercised through the crate's public API
//! only, the way an embedding application would drive it.

use std::sync::{Arc, Mutex};

use core_reach::{Address, AddressPriority, Coordinator, CoordinatorConfig};
use libp2p::PeerId;

fn count_changes(c: &Coordinator) -> Arc<Mutex<usize>> {
    let count = Arc::new(Mutex::new(0));
    let count2 = count.clone();
    c.set_on_address_changed(move |_addrs| {
        *count2.lock().unwrap() += 1;
    });
    count
}

#[async_std::test]
async fn relay_only_node_advertises_the_relay_and_fires_once() {
    let c = Coordinator::new(CoordinatorConfig::default());
    let changes = count_changes(&c);

    let relay: Address = "/ip4/10.0.0.1/tcp/4001/p2p-circuit".parse().unwrap();
    c.on_relay_reserved(vec![relay.clone()]);
    async_std::task::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(c.advertised_addrs(), vec![relay]);
    assert!(!c.has_verified_direct());
    assert!(c.has_relay());
    assert_eq!(*changes.lock().unwrap(), 1);
}

#[async_std::test]
async fn candidate_promotes_to_verified_and_outranks_relay() {
    let c = Coordinator::new(CoordinatorConfig::default());
    let relay: Address = "/ip4/10.0.0.1/tcp/4001/p2p-circuit".parse().unwrap();
    c.on_relay_reserved(vec![relay.clone()]);

    let addr: Address = "/ip4/1.2.3.4/udp/4001/quic-v1".parse().unwrap();
    c.on_direct_address_candidate(addr.clone(), "stun", AddressPriority::Unverified);
    assert!(!c.advertised_addrs().contains(&addr));

    c.on_direct_address_verified(addr.clone(), "dial-back", AddressPriority::VerifiedDirect);
    let advertised = c.advertised_addrs();
    assert!(!c.candidate_direct_addresses().contains(&addr));
    assert_eq!(advertised[0], addr);
    assert!(advertised.contains(&relay));
}

#[async_std::test]
async fn listen_port_prune_keeps_only_the_bound_port() {
    let c = Coordinator::new(CoordinatorConfig::default());
    let keep: Address = "/ip4/5.6.7.8/udp/9001/quic-v1".parse().unwrap();
    let drop_addr: Address = "/ip4/5.6.7.8/udp/9000/quic-v1".parse().unwrap();

    c.on_direct_address_verified(drop_addr, "stun", AddressPriority::VerifiedDirect);
    c.on_direct_address_verified(keep.clone(), "stun", AddressPriority::VerifiedDirect);

    let mut ports = std::collections::HashSet::new();
    ports.insert(9001u16);
    c.set_listen_ports(ports);

    assert_eq!(c.advertised_addrs(), vec![keep]);
}

#[async_std::test]
async fn witness_threshold_requires_distinct_ip_prefixes() {
    let mut config = CoordinatorConfig::default();
    config.min_witnesses = 2;
    let c = Coordinator::new(config);
    let addr: Address = "/ip4/11.22.33.44/udp/4001/quic-v1".parse().unwrap();
    c.on_direct_address_candidate(addr.clone(), "stun", AddressPriority::Unverified);

    let peer_a = PeerId::random();
    let peer_b = PeerId::random();
    let peer_c = PeerId::random();

    c.on_inbound_witness(addr.clone(), peer_a, "192.168.1.10".parse().unwrap());
    c.on_inbound_witness(addr.clone(), peer_b, "192.168.1.11".parse().unwrap());
    assert!(!c.advertised_addrs().contains(&addr));

    c.on_inbound_witness(addr.clone(), peer_c, "10.0.0.5".parse().unwrap());
    assert!(c.advertised_addrs().contains(&addr));
}
