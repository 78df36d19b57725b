//! tests/integration/adversarial.rs
//!
//! E2E tests for malformed/hostile input at the network edges. A hub must
//! keep serving well-formed traffic after ingesting garbage.

use crate::common::harness::{sip_invite, sip_ok_response, SignalingClient, TestNode};
use std::time::Duration;
use test_log::test;

/// A non-UTF8, non-SIP datagram on the signaling port must be dropped, not
/// crash the adapter or wedge the hub for subsequent well-formed calls.
#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_garbage_signaling_datagram_does_not_wedge_the_hub() {
    let test_timeout = Duration::from_secs(10);
    let result = tokio::time::timeout(test_timeout, async {
        let hub_a = TestNode::spawn(vec![]).await.expect("failed to spawn hub A");
        let hub_b = TestNode::spawn(vec![hub_a.p2p_addr]).await.expect("failed to spawn hub B");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let phone_a = SignalingClient::connect(hub_a.signaling_addr).await.unwrap();
        phone_a.send(b"keepalive").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let phone_b = SignalingClient::connect(hub_b.signaling_addr).await.unwrap();

        // Garbage first: invalid UTF-8 bytes straight at hub B's signaling port.
        phone_b.send(&[0xff, 0xfe, 0x00, 0x01, 0x02]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A well-formed call placed immediately after must still succeed.
        let call_id = "call-after-garbage@test";
        phone_b
            .send(&sip_invite(call_id, &hub_b.peer_id_hex, &hub_a.peer_id_hex))
            .await
            .unwrap();

        let delivered = phone_a.recv(Duration::from_secs(5)).await.expect("call after garbage datagram never arrived");
        assert!(String::from_utf8(delivered).unwrap().contains(call_id));

        phone_a
            .send(&sip_ok_response(call_id, &hub_b.peer_id_hex, &hub_a.peer_id_hex))
            .await
            .unwrap();
        let response = phone_b.recv(Duration::from_secs(5)).await.expect("response after garbage datagram never arrived");
        assert!(String::from_utf8(response).unwrap().contains(call_id));

        hub_a.shutdown();
        hub_b.shutdown();
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}
