//! tests/integration/topology.rs
//!
//! E2E tests for star-shaped topologies and unreachable recipients.

use crate::common::harness::{sip_invite, sip_ok_response, SignalingClient, TestNode};
use std::time::Duration;
use test_log::test;

/// Two spoke hubs (A, C) both bootstrap to a hub hub (B). Verifies B can
/// carry two concurrent calls, one from each spoke, without the `caller_map`
/// entries for distinct call-ids colliding.
#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_hub_carries_two_concurrent_calls_from_distinct_spokes() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let hub_b = TestNode::spawn(vec![]).await.expect("failed to spawn hub B");
        let hub_a = TestNode::spawn(vec![hub_b.p2p_addr]).await.expect("failed to spawn hub A");
        let hub_c = TestNode::spawn(vec![hub_b.p2p_addr]).await.expect("failed to spawn hub C");

        tokio::time::sleep(Duration::from_millis(300)).await;

        let phone_b = SignalingClient::connect(hub_b.signaling_addr).await.unwrap();
        phone_b.send(b"keepalive").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let phone_a = SignalingClient::connect(hub_a.signaling_addr).await.unwrap();
        let phone_c = SignalingClient::connect(hub_c.signaling_addr).await.unwrap();

        let call_from_a = "call-a@test";
        let call_from_c = "call-c@test";

        phone_a
            .send(&sip_invite(call_from_a, &hub_a.peer_id_hex, &hub_b.peer_id_hex))
            .await
            .unwrap();
        phone_c
            .send(&sip_invite(call_from_c, &hub_c.peer_id_hex, &hub_b.peer_id_hex))
            .await
            .unwrap();

        // Hub B's single local phone should see both INVITEs (order not
        // guaranteed), each carrying its own call-id.
        let first = phone_b.recv(Duration::from_secs(5)).await.unwrap();
        let second = phone_b.recv(Duration::from_secs(5)).await.unwrap();
        let texts = [String::from_utf8(first).unwrap(), String::from_utf8(second).unwrap()];
        assert!(texts.iter().any(|t| t.contains(call_from_a)));
        assert!(texts.iter().any(|t| t.contains(call_from_c)));

        // Answer each call-id; each spoke should get back exactly its own response.
        phone_b
            .send(&sip_ok_response(call_from_a, &hub_a.peer_id_hex, &hub_b.peer_id_hex))
            .await
            .unwrap();
        let response_a = phone_a.recv(Duration::from_secs(5)).await.unwrap();
        assert!(String::from_utf8(response_a).unwrap().contains(call_from_a));

        phone_b
            .send(&sip_ok_response(call_from_c, &hub_c.peer_id_hex, &hub_b.peer_id_hex))
            .await
            .unwrap();
        let response_c = phone_c.recv(Duration::from_secs(5)).await.unwrap();
        assert!(String::from_utf8(response_c).unwrap().contains(call_from_c));

        hub_a.shutdown();
        hub_b.shutdown();
        hub_c.shutdown();
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}

/// A hub with no connection, cookie, or directory entry for the called
/// party must not crash or hang the caller's request; the message is
/// store-and-forward enqueued and no response is ever synthesized.
#[test(tokio::test)]
async fn test_call_to_unreachable_peer_is_silently_enqueued_not_rejected() {
    let test_timeout = Duration::from_secs(8);
    let result = tokio::time::timeout(test_timeout, async {
        let hub_a = TestNode::spawn(vec![]).await.expect("failed to spawn hub A");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let phone_a = SignalingClient::connect(hub_a.signaling_addr).await.unwrap();

        let unknown_peer_hex = "f".repeat(40);
        phone_a
            .send(&sip_invite("call-unreachable@test", &hub_a.peer_id_hex, &unknown_peer_hex))
            .await
            .unwrap();

        // No route exists and no directory resolves it, so the message sits
        // enqueued; nothing should ever arrive back on this socket.
        let outcome = phone_a.recv(Duration::from_millis(500)).await;
        assert!(outcome.is_err(), "unreachable recipient must not produce any reply");

        hub_a.shutdown();
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}
