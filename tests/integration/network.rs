//! tests/integration/network.rs
//!
//! Full end-to-end integration test for the overlay hub. Spins up two real
//! hubs over real QUIC connections and verifies a SIP INVITE/response round
//! trip through the signaling adapters on both ends (property: Call-ID
//! response fidelity, SPEC_FULL §8 property #7).

use crate::common::harness::{sip_invite, sip_ok_response, SignalingClient, TestNode};
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_sip_invite_and_response_round_trip_across_two_hubs() {
    let test_timeout = Duration::from_secs(10);
    let result = tokio::time::timeout(test_timeout, async {
        // Hub A is the bootstrap; hub B dials it at startup.
        let hub_a = TestNode::spawn(vec![]).await.expect("failed to spawn hub A");
        let hub_b = TestNode::spawn(vec![hub_a.p2p_addr]).await.expect("failed to spawn hub B");

        // Give B's bootstrap dial time to complete the handshake.
        tokio::time::sleep(Duration::from_millis(300)).await;

        // A "local SIP phone" at hub A, registered by sending a throwaway
        // datagram so the adapter learns its address as the delivery target
        // for inbound requests.
        let phone_a = SignalingClient::connect(hub_a.signaling_addr).await.unwrap();
        phone_a.send(b"keepalive").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The caller's local SIP phone, talking to hub B.
        let phone_b = SignalingClient::connect(hub_b.signaling_addr).await.unwrap();

        let call_id = "call-1@test";
        let invite = sip_invite(call_id, &hub_b.peer_id_hex, &hub_a.peer_id_hex);
        phone_b.send(&invite).await.unwrap();

        // Hub A's signaling adapter should deliver the (From-rewritten) INVITE
        // to phone_a.
        let delivered = phone_a.recv(Duration::from_secs(5)).await.expect("INVITE never arrived at hub A");
        let delivered_text = String::from_utf8(delivered).unwrap();
        assert!(delivered_text.starts_with("INVITE"));
        assert!(delivered_text.contains(call_id));
        assert!(!delivered_text.contains(&hub_b.peer_id_hex), "From host should have been rewritten to a sentinel");

        // phone_a answers; hub A should route the response back to hub B by
        // call-id, and hub B should deliver it to phone_b unchanged.
        let response = sip_ok_response(call_id, &hub_b.peer_id_hex, &hub_a.peer_id_hex);
        phone_a.send(&response).await.unwrap();

        let delivered_response = phone_b.recv(Duration::from_secs(5)).await.expect("response never arrived back at hub B");
        let response_text = String::from_utf8(delivered_response).unwrap();
        assert!(response_text.starts_with("SIP/2.0 200 OK"));
        assert!(response_text.contains(call_id));

        hub_a.shutdown();
        hub_b.shutdown();
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}
