//! End-to-end scenario 5 (§8): a requester asks a real (loopback) helper to
//! dial back a candidate address; the helper proves reachability by
//! connecting to it, and the requester credits the survivor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_std::net::{TcpListener, TcpStream};
use async_trait::async_trait;
use core_reach::address::{ip_component, port_component};
use core_reach::connection::{ConnectionEndpoint, HandshakeVerifier};
use core_reach::{dial_back, Address, Coordinator, CoordinatorConfig};
use libp2p::PeerId;

struct TcpEndpoint {
    local_peer_id: PeerId,
    routes: HashMap<PeerId, SocketAddr>,
}

#[async_trait]
impl ConnectionEndpoint for TcpEndpoint {
    type Stream = TcpStream;

    async fn open_connection(&self, _peer: PeerId) -> std::io::Result<()> {
        Ok(())
    }

    async fn open_stream(&self, peer: PeerId, _protocol: &'static str) -> std::io::Result<Self::Stream> {
        let addr = *self
            .routes
            .get(&peer)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no route to peer"))?;
        TcpStream::connect(addr).await
    }

    fn register_protocol_handler(&self, _protocol: &'static str) {}

    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}

/// Proves reachability the same way a real transport handshake would: by
/// actually connecting to the candidate address.
struct DialsBackByConnecting;

#[async_trait]
impl HandshakeVerifier for DialsBackByConnecting {
    async fn verify_handshake(&self, addr: &Address, _expected_peer: PeerId) -> std::io::Result<()> {
        let ip = ip_component(addr)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no ip component"))?;
        let port = port_component(addr)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no port component"))?;
        TcpStream::connect((ip, port)).await?;
        Ok(())
    }
}

#[async_std::test]
async fn dial_back_round_trip_credits_the_requester() {
    let helper_peer = PeerId::random();
    let requester_peer = PeerId::random();

    // The address under verification: a real loopback listener the helper
    // will dial back to.
    let candidate_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let candidate_port = candidate_listener.local_addr().unwrap().port();
    async_std::task::spawn(async move {
        while candidate_listener.accept().await.is_ok() {}
    });
    let candidate_addr: Address = format!("/ip4/127.0.0.1/tcp/{}", candidate_port)
        .parse()
        .unwrap();

    // The helper's dial-back protocol listener.
    let helper_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let helper_addr = helper_listener.local_addr().unwrap();
    async_std::task::spawn(async move {
        loop {
            let (mut stream, _) = match helper_listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            async_std::task::spawn(async move {
                let request_bytes = dial_back::read_frame(&mut stream).await.unwrap();
                let response_bytes = dial_back::handle_dial_back_request(
                    &DialsBackByConnecting,
                    requester_peer,
                    &request_bytes,
                    10,
                    3,
                    Duration::from_secs(10),
                )
                .await
                .unwrap();
                dial_back::write_frame(&mut stream, &response_bytes).await.unwrap();
            });
        }
    });

    let mut routes = HashMap::new();
    routes.insert(helper_peer, helper_addr);
    let requester_endpoint = Arc::new(TcpEndpoint {
        local_peer_id: requester_peer,
        routes,
    });
    let requester = dial_back::DialBackRequester::new(requester_endpoint, Duration::from_secs(10), 10);

    let accepted = dial_back::verify_with_helper_pool(
        &requester,
        &[helper_peer],
        &[],
        &[candidate_addr.clone()],
        1,
        1,
    )
    .await
    .unwrap();
    assert_eq!(accepted, vec![candidate_addr.clone()]);

    let coordinator = Coordinator::new(CoordinatorConfig::default());
    let notified = Arc::new(Mutex::new(0));
    let notified2 = notified.clone();
    coordinator.set_on_address_changed(move |_| {
        *notified2.lock().unwrap() += 1;
    });
    dial_back::credit_survivors(&coordinator, &accepted);
    async_std::task::sleep(Duration::from_millis(30)).await;

    assert!(coordinator.advertised_addrs().contains(&candidate_addr));
    assert_eq!(*notified.lock().unwrap(), 1);
}
