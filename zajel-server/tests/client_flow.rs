//! Handler-level flows: the frame pipeline, pairing, device links,
//! channels, relays, and disconnect cleanup.

mod common;

use common::{TestClient, test_state};
use serde_json::json;
use zajel_server::connection::run_cleanup;

// ── pipeline ───────────────────────────────────────────────────────

#[tokio::test]
async fn malformed_frames_report_and_preserve_the_connection() {
    let state = test_state();
    let mut client = TestClient::connect("pipeline");

    client.send_raw(&state, "this is not json").await;
    assert_eq!(client.recv()["reason"], "parse_error");

    client.send_raw(&state, "[1, 2, 3]").await;
    assert_eq!(client.recv()["reason"], "parse_error");

    client.send(&state, json!({"type": "pair_request"})).await;
    let reply = client.recv();
    assert_eq!(reply["reason"], "invalid_message");
    assert!(reply["detail"].as_str().unwrap().contains("targetCode"));

    // The connection still works after every rejection.
    client.send(&state, json!({"type": "ping"})).await;
    assert_eq!(client.recv()["type"], "pong");
}

#[tokio::test]
async fn rate_limit_reports_without_disconnecting() {
    let state = test_state();
    let mut client = TestClient::connect("limiter");

    // Burst capacity is 60; the 61st frame in the same instant trips it.
    let mut limited = 0;
    for _ in 0..61 {
        client.send(&state, json!({"type": "ping"})).await;
    }
    while let Some(frame) = client.try_recv() {
        if frame["reason"] == "rate_limited" {
            limited += 1;
        }
    }
    assert_eq!(limited, 1);
}

#[tokio::test]
async fn embedded_peer_id_must_match() {
    let state = test_state();
    let mut client = TestClient::connect("consistency");
    let (peer_id, _) = client.register(&state, "AAAAAA", "pk-a").await;

    client
        .send(&state, json!({"type": "heartbeat", "peerId": "IMPOST"}))
        .await;
    let reply = client.recv();
    assert_eq!(reply["reason"], "invalid_message");
    assert_eq!(reply["detail"], "peerId mismatch");

    client
        .send(&state, json!({"type": "heartbeat", "peerId": peer_id}))
        .await;
    assert!(client.try_recv().is_none(), "valid heartbeat is silent");
}

#[tokio::test]
async fn unregistered_operations_are_rejected() {
    let state = test_state();
    let mut client = TestClient::connect("unregistered");
    client
        .send(&state, json!({"type": "get_relays"}))
        .await;
    assert_eq!(client.recv()["reason"], "not_registered");
}

// ── pairing ────────────────────────────────────────────────────────

#[tokio::test]
async fn pair_via_code_round_trip() {
    let state = test_state();
    let mut alice = TestClient::connect("alice");
    let mut bob = TestClient::connect("bob");

    let (alice_id, code) = alice.register(&state, "K3YB7Q", "pk-alice").await;
    assert_eq!(code, "K3YB7Q");
    let (bob_id, _) = bob.register(&state, "BQQQQ2", "pk-bob").await;

    bob.send(&state, json!({"type": "pair_request", "targetCode": "K3YB7Q"}))
        .await;

    // Alice sees the request with Bob's identity.
    let request = alice.recv();
    assert_eq!(request["type"], "pair_request");
    assert_eq!(request["peerId"], bob_id);
    assert_eq!(request["publicKey"], "pk-bob");

    alice
        .send(
            &state,
            json!({"type": "pair_response", "targetCode": "K3YB7Q", "accepted": true}),
        )
        .await;

    // Bob sees acceptance with Alice's key.
    let response = bob.recv();
    assert_eq!(response["type"], "pair_response");
    assert_eq!(response["accepted"], true);
    assert_eq!(response["peerId"], alice_id);
    assert_eq!(response["publicKey"], "pk-alice");
}

#[tokio::test]
async fn rejection_tombstones_the_request_not_the_code() {
    let state = test_state();
    let mut alice = TestClient::connect("alice");
    let mut bob = TestClient::connect("bob");
    let mut carol = TestClient::connect("carol");

    alice.register(&state, "K3YB7Q", "pk-alice").await;
    bob.register(&state, "BQQQQ2", "pk-bob").await;
    carol.register(&state, "CQQQQ2", "pk-carol").await;

    bob.send(&state, json!({"type": "pair_request", "targetCode": "K3YB7Q"}))
        .await;
    alice.recv();
    alice
        .send(
            &state,
            json!({"type": "pair_response", "targetCode": "K3YB7Q", "accepted": false}),
        )
        .await;
    assert_eq!(bob.recv()["accepted"], false);

    // The code is still live for other requesters.
    carol
        .send(&state, json!({"type": "pair_request", "targetCode": "K3YB7Q"}))
        .await;
    assert_eq!(alice.recv()["type"], "pair_request");
}

#[tokio::test]
async fn pairing_code_collision_yields_a_fresh_code() {
    let state = test_state();
    let mut first = TestClient::connect("first");
    let mut second = TestClient::connect("second");

    let (_, code_one) = first.register(&state, "K3YB7Q", "pk-1").await;
    let (_, code_two) = second.register(&state, "K3YB7Q", "pk-2").await;

    assert_eq!(code_one, "K3YB7Q");
    assert_ne!(code_two, "K3YB7Q", "collision must yield a fresh code");
    assert_ne!(code_one, code_two);

    // Both codes resolve to their own peer.
    let codes = state.pairing_codes.lock();
    assert_ne!(
        codes.get(&code_one).unwrap().peer_id,
        codes.get(&code_two).unwrap().peer_id
    );
}

#[tokio::test]
async fn disconnect_reclaims_the_pairing_code() {
    let state = test_state();
    let mut alice = TestClient::connect("alice");
    let mut bob = TestClient::connect("bob");

    alice.register(&state, "K3YB7Q", "pk-alice").await;
    bob.register(&state, "BQQQQ2", "pk-bob").await;

    run_cleanup(&mut alice.conn, &state);

    bob.send(&state, json!({"type": "pair_request", "targetCode": "K3YB7Q"}))
        .await;
    assert_eq!(bob.recv()["reason"], "unknown_peer");
}

// ── device links ───────────────────────────────────────────────────

#[tokio::test]
async fn link_exchange_carries_keys_both_ways() {
    let state = test_state();
    let mut phone = TestClient::connect("phone");
    let mut laptop = TestClient::connect("laptop");

    let (phone_id, _) = phone.register(&state, "PHONE2", "pk-phone").await;
    let (laptop_id, _) = laptop.register(&state, "LAPTP2", "pk-laptop").await;

    phone
        .send(
            &state,
            json!({"type": "link_request", "linkCode": "L1NKC0", "publicKey": "pk-phone"}),
        )
        .await;
    laptop
        .send(
            &state,
            json!({"type": "link_response", "linkCode": "L1NKC0", "accepted": true}),
        )
        .await;

    let to_phone = phone.recv();
    assert_eq!(to_phone["type"], "link_response");
    assert_eq!(to_phone["peerId"], laptop_id);
    assert_eq!(to_phone["publicKey"], "pk-laptop");

    let to_laptop = laptop.recv();
    assert_eq!(to_laptop["type"], "link_request");
    assert_eq!(to_laptop["peerId"], phone_id);
    assert_eq!(to_laptop["publicKey"], "pk-phone");

    // The code is single-use.
    laptop
        .send(
            &state,
            json!({"type": "link_response", "linkCode": "L1NKC0", "accepted": true}),
        )
        .await;
    assert_eq!(laptop.recv()["reason"], "unknown_peer");
}

// ── signaling relay ────────────────────────────────────────────────

#[tokio::test]
async fn offers_relay_opaquely_with_sender_stamp() {
    let state = test_state();
    let mut alice = TestClient::connect("alice");
    let mut bob = TestClient::connect("bob");

    let (alice_id, _) = alice.register(&state, "AAAAAA", "pk-a").await;
    let (bob_id, _) = bob.register(&state, "BBBBBB", "pk-b").await;

    alice
        .send(
            &state,
            json!({"type": "offer", "target": bob_id, "sdp": "v=0 custom blob"}),
        )
        .await;
    let offer = bob.recv();
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["sdp"], "v=0 custom blob");
    assert_eq!(offer["from"], alice_id);

    alice
        .send(&state, json!({"type": "call_offer", "target": "GH0ST1"}))
        .await;
    assert_eq!(alice.recv()["reason"], "unknown_peer");
}

// ── channels ───────────────────────────────────────────────────────

#[tokio::test]
async fn upstream_queues_while_owner_is_away_and_flushes_in_order() {
    let state = test_state();
    let mut owner = TestClient::connect("owner");
    let mut sender = TestClient::connect("sender");

    let (_, _) = owner.register(&state, "OWNER2", "pk-owner").await;
    sender.register(&state, "SENDR2", "pk-sender").await;

    for i in 0..3 {
        sender
            .send(
                &state,
                json!({
                    "type": "upstream-message",
                    "channelId": "news",
                    "ephemeralPublicKey": "epk",
                    "n": i,
                }),
            )
            .await;
    }

    owner
        .send(&state, json!({"type": "channel-owner-register", "channelId": "news"}))
        .await;
    for i in 0..3 {
        let frame = owner.recv();
        assert_eq!(frame["type"], "upstream");
        assert_eq!(frame["n"], i);
    }
    assert!(owner.try_recv().is_none(), "and then nothing");

    // With the owner registered, upstream flows directly.
    sender
        .send(
            &state,
            json!({
                "type": "upstream-message",
                "channelId": "news",
                "ephemeralPublicKey": "epk",
                "n": 99,
            }),
        )
        .await;
    assert_eq!(owner.recv()["n"], 99);
}

#[tokio::test]
async fn stream_frames_fan_to_subscribers_from_join_point_onward() {
    let state = test_state();
    let mut speaker = TestClient::connect("speaker");
    let mut early = TestClient::connect("early");
    let mut late = TestClient::connect("late");

    let (speaker_id, _) = speaker.register(&state, "SPEAK2", "pk-s").await;
    early.register(&state, "EARLY2", "pk-e").await;
    late.register(&state, "LATEE2", "pk-l").await;

    early
        .send(&state, json!({"type": "channel-subscribe", "channelId": "radio"}))
        .await;

    speaker
        .send(
            &state,
            json!({"type": "stream-start", "streamId": "s1", "channelId": "radio"}),
        )
        .await;
    speaker
        .send(
            &state,
            json!({"type": "stream-frame", "streamId": "s1", "channelId": "radio", "seq": 1}),
        )
        .await;

    assert_eq!(early.recv()["type"], "stream-start");
    assert_eq!(early.recv()["seq"], 1);

    // A late subscriber learns of the live stream but missed frame 1.
    late.send(&state, json!({"type": "channel-subscribe", "channelId": "radio"}))
        .await;
    let announced = late.recv();
    assert_eq!(announced["type"], "stream-start");
    assert_eq!(announced["from"], speaker_id);
    assert!(late.try_recv().is_none());

    speaker
        .send(
            &state,
            json!({"type": "stream-frame", "streamId": "s1", "channelId": "radio", "seq": 2}),
        )
        .await;
    assert_eq!(early.recv()["seq"], 2);
    assert_eq!(late.recv()["seq"], 2);

    speaker
        .send(
            &state,
            json!({"type": "stream-end", "streamId": "s1", "channelId": "radio"}),
        )
        .await;
    assert_eq!(early.recv()["type"], "stream-end");
    assert_eq!(late.recv()["type"], "stream-end");
}

// ── relays and chunks ──────────────────────────────────────────────

#[tokio::test]
async fn relay_listing_excludes_loaded_and_self() {
    let state = test_state();
    let mut host = TestClient::connect("host");
    let mut busy = TestClient::connect("busy");
    let mut asker = TestClient::connect("asker");

    let (host_id, _) = host.register(&state, "HOSTA2", "pk-host").await;
    let (busy_id, _) = busy.register(&state, "BUSYA2", "pk-busy").await;
    asker.register(&state, "ASKER2", "pk-asker").await;

    host.send(
        &state,
        json!({"type": "register_rendezvous", "peerId": host_id, "relayId": "r-1"}),
    )
    .await;
    busy.send(
        &state,
        json!({"type": "register_rendezvous", "peerId": busy_id, "relayId": "r-2"}),
    )
    .await;
    busy.send(
        &state,
        json!({"type": "update_load", "peerId": busy_id, "connectedCount": 19}),
    )
    .await;

    asker.send(&state, json!({"type": "get_relays"})).await;
    let reply = asker.recv();
    assert_eq!(reply["type"], "relays");
    let relays = reply["relays"].as_array().unwrap();
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0]["peerId"], host_id);
    assert_eq!(relays[0]["publicKey"], "pk-host");
}

#[tokio::test]
async fn chunk_request_routes_to_an_announcer() {
    let state = test_state();
    let mut seeder = TestClient::connect("seeder");
    let mut leecher = TestClient::connect("leecher");

    let (seeder_id, _) = seeder.register(&state, "SEEDA2", "pk-seed").await;
    let (leecher_id, _) = leecher.register(&state, "LEECH2", "pk-leech").await;

    seeder
        .send(
            &state,
            json!({"type": "chunk_announce", "peerId": seeder_id, "chunks": ["c-9"]}),
        )
        .await;
    leecher
        .send(
            &state,
            json!({"type": "chunk_request", "chunkId": "c-9", "channelId": "files"}),
        )
        .await;
    let request = seeder.recv();
    assert_eq!(request["type"], "chunk_request");
    assert_eq!(request["from"], leecher_id);

    seeder
        .send(
            &state,
            json!({
                "type": "chunk_push",
                "chunkId": "c-9",
                "channelId": "files",
                "target": leecher_id,
                "data": "b64-ciphertext",
            }),
        )
        .await;
    let push = leecher.recv();
    assert_eq!(push["type"], "chunk_push");
    assert_eq!(push["data"], "b64-ciphertext");
}

// ── attestation ────────────────────────────────────────────────────

#[tokio::test]
async fn attestation_challenge_response() {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let state = test_state();
    let mut device = TestClient::connect("device");

    device
        .send(
            &state,
            json!({"type": "attest_request", "build_token": "tok-123", "device_id": "dev-1"}),
        )
        .await;
    let challenge = device.recv();
    assert_eq!(challenge["type"], "attest_challenge");
    let nonce = challenge["nonce"].as_str().unwrap().to_string();

    let mut mac = Hmac::<Sha256>::new_from_slice(b"tok-123").unwrap();
    mac.update(nonce.as_bytes());
    let response = hex::encode(mac.finalize().into_bytes());

    device
        .send(
            &state,
            json!({"type": "attest_response", "nonce": nonce, "responses": response}),
        )
        .await;
    let result = device.recv();
    assert_eq!(result["type"], "attest_result");
    assert_eq!(result["ok"], true);
}

#[tokio::test]
async fn attestation_rejects_a_wrong_response() {
    let state = test_state();
    let mut device = TestClient::connect("device");

    device
        .send(
            &state,
            json!({"type": "attest_request", "build_token": "tok-123", "device_id": "dev-1"}),
        )
        .await;
    let nonce = device.recv()["nonce"].as_str().unwrap().to_string();

    device
        .send(
            &state,
            json!({"type": "attest_response", "nonce": nonce, "responses": "deadbeef"}),
        )
        .await;
    assert_eq!(device.recv()["reason"], "crypto_auth_failed");
}

// ── disconnect cleanup ─────────────────────────────────────────────

#[tokio::test]
async fn disconnect_releases_ownership_but_keeps_the_queue() {
    let state = test_state();
    let mut owner = TestClient::connect("owner");
    let mut sender = TestClient::connect("sender");
    let mut next_owner = TestClient::connect("next");

    owner.register(&state, "OWNER2", "pk-o").await;
    sender.register(&state, "SENDR2", "pk-s").await;
    next_owner.register(&state, "NEXTO2", "pk-n").await;

    owner
        .send(&state, json!({"type": "channel-owner-register", "channelId": "news"}))
        .await;
    run_cleanup(&mut owner.conn, &state);

    sender
        .send(
            &state,
            json!({
                "type": "upstream-message",
                "channelId": "news",
                "ephemeralPublicKey": "epk",
                "n": 7,
            }),
        )
        .await;

    next_owner
        .send(&state, json!({"type": "channel-owner-register", "channelId": "news"}))
        .await;
    assert_eq!(next_owner.recv()["n"], 7);
}

#[tokio::test]
async fn disconnect_notifies_paired_peers() {
    let state = test_state();
    let mut alice = TestClient::connect("alice");
    let mut bob = TestClient::connect("bob");

    let (alice_id, _) = alice.register(&state, "AAAAAA", "pk-a").await;
    bob.register(&state, "BBBBBB", "pk-b").await;

    bob.send(&state, json!({"type": "pair_request", "targetCode": "AAAAAA"}))
        .await;
    alice.recv();
    alice
        .send(
            &state,
            json!({"type": "pair_response", "targetCode": "AAAAAA", "accepted": true}),
        )
        .await;
    bob.recv();

    run_cleanup(&mut alice.conn, &state);
    let offline = bob.recv();
    assert_eq!(offline["type"], "peer_offline");
    assert_eq!(offline["peerId"], alice_id);
}
