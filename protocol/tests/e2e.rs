//! End-to-end integration tests for the PULSE protocol.
//!
//! These tests stand up two complete engines — crypto, link manager,
//! delivery, discovery, payments — over the in-memory radio and drive
//! real payment exchanges through them. They prove the components compose:
//! key agreement, envelope encryption, fragmentation, ACK/retry, and the
//! payment state machine all running together exactly as they would
//! between two phones.
//!
//! Each test stands alone with its own radio hub and engines. No shared
//! state, no test ordering dependencies, no flaky failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use pulse_protocol::crypto::session::SessionCrypto;
use pulse_protocol::crypto::signer::SoftwareSigner;
use pulse_protocol::identity::PeerIdentity;
use pulse_protocol::link::manager::LinkConfig;
use pulse_protocol::link::radio::MemoryHub;
use pulse_protocol::payment::{Currency, PaymentEvent, PaymentStatus};
use pulse_protocol::payment::PaymentError;
use pulse_protocol::store::MemoryTrustStore;
use pulse_protocol::{PulseConfig, PulseEngine};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// Build an engine on the hub with its real identity (agreement key
/// included) registered for discovery and dialing.
fn engine_on(hub: &MemoryHub, name: &str, config: PulseConfig) -> Arc<PulseEngine> {
    let signer = SoftwareSigner::generate();
    let crypto = Arc::new(SessionCrypto::new(signer.clone(), config.session_ttl));
    let identity = PeerIdentity::new(
        crypto.sign_public_key(),
        crypto.agree_public_bytes(),
        name.into(),
    );
    let radio = hub.join(identity, -40);
    let engine = PulseEngine::with_crypto(
        signer,
        crypto,
        radio,
        Arc::new(MemoryTrustStore::new()),
        config,
    );
    engine.start();
    engine
}

fn test_config(name: &str) -> PulseConfig {
    PulseConfig {
        display_name: name.into(),
        ..PulseConfig::default()
    }
}

/// Two engines, connected and authenticated in both directions.
async fn connected_pair(hub: &MemoryHub) -> (Arc<PulseEngine>, Arc<PulseEngine>) {
    let a = engine_on(hub, "alice", test_config("alice"));
    let b = engine_on(hub, "bob", test_config("bob"));

    a.connect(b.identity()).await.expect("connect");
    // Give bob's accept loop a beat to register the inbound session.
    for _ in 0..50 {
        if b.link().is_authenticated(a.device_id()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(a.link().is_authenticated(b.device_id()));
    assert!(b.link().is_authenticated(a.device_id()));
    (a, b)
}

/// Wait (bounded) for the next event matching `pred`.
async fn wait_for<F>(rx: &mut broadcast::Receiver<PaymentEvent>, mut pred: F) -> PaymentEvent
where
    F: FnMut(&PaymentEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for payment event")
}

// ---------------------------------------------------------------------------
// Happy Path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_payment_settles_on_both_sides() {
    let hub = MemoryHub::new();
    let (alice, bob) = connected_pair(&hub).await;

    alice.payments().wallet().credit(&Currency::BRL, 5_000);

    let mut alice_events = alice.payments().subscribe();
    let mut bob_events = bob.payments().subscribe();

    let request_id = alice
        .payments()
        .request_payment(bob.device_id(), 1_200, Currency::BRL, "lunch".into())
        .await
        .expect("request");

    // Bob sees the request and accepts it.
    let event = wait_for(&mut bob_events, |e| {
        matches!(e, PaymentEvent::RequestReceived { .. })
    })
    .await;
    let PaymentEvent::RequestReceived {
        request_id: seen_id,
        amount,
        currency,
        memo,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(seen_id, request_id);
    assert_eq!(amount, 1_200);
    assert_eq!(currency, Currency::BRL);
    assert_eq!(memo, "lunch");

    bob.payments()
        .respond(&request_id, true, None)
        .await
        .expect("respond");

    // Acceptance triggers the transfer; both sides settle.
    wait_for(&mut alice_events, |e| {
        matches!(e, PaymentEvent::Completed { .. })
    })
    .await;
    wait_for(&mut bob_events, |e| {
        matches!(e, PaymentEvent::Completed { .. })
    })
    .await;

    // The money moved exactly once.
    assert_eq!(alice.payments().wallet().balance(&Currency::BRL), 3_800);
    assert_eq!(bob.payments().wallet().balance(&Currency::BRL), 1_200);

    // Both session records are terminal, retained, and matched.
    let alice_session = alice.payments().session(&request_id).unwrap();
    let bob_session = bob.payments().session(&request_id).unwrap();
    assert_eq!(alice_session.status, PaymentStatus::Completed);
    assert_eq!(bob_session.status, PaymentStatus::Completed);
    assert_eq!(alice_session.transaction_id, bob_session.transaction_id);
}

#[tokio::test]
async fn payment_with_long_memo_crosses_a_small_mtu() {
    // A 450-byte MTU forces the request (and everything after it) through
    // the fragmentation path; the exchange must not notice.
    let hub = MemoryHub::new();
    let alice = engine_on(
        &hub,
        "alice",
        PulseConfig {
            mtu: 450,
            ..test_config("alice")
        },
    );
    let bob = engine_on(
        &hub,
        "bob",
        PulseConfig {
            mtu: 450,
            ..test_config("bob")
        },
    );
    alice.connect(bob.identity()).await.unwrap();
    for _ in 0..50 {
        if bob.link().is_authenticated(alice.device_id()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    alice.payments().wallet().credit(&Currency::USD, 100_000);
    let mut bob_events = bob.payments().subscribe();
    let mut alice_events = alice.payments().subscribe();

    let memo = "m".repeat(500);
    let request_id = alice
        .payments()
        .request_payment(bob.device_id(), 9_999, Currency::USD, memo.clone())
        .await
        .expect("request");

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, PaymentEvent::RequestReceived { .. })
    })
    .await;
    if let PaymentEvent::RequestReceived { memo: seen, .. } = event {
        assert_eq!(seen, memo);
    }

    bob.payments().respond(&request_id, true, None).await.unwrap();
    wait_for(&mut alice_events, |e| {
        matches!(e, PaymentEvent::Completed { .. })
    })
    .await;
    assert_eq!(bob.payments().wallet().balance(&Currency::USD), 9_999);
}

// ---------------------------------------------------------------------------
// Rejection, Cancellation, Failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_request_is_terminal_and_costs_nothing() {
    let hub = MemoryHub::new();
    let (alice, bob) = connected_pair(&hub).await;
    alice.payments().wallet().credit(&Currency::BRL, 5_000);

    let mut alice_events = alice.payments().subscribe();
    let mut bob_events = bob.payments().subscribe();

    let request_id = alice
        .payments()
        .request_payment(bob.device_id(), 1_200, Currency::BRL, "no thanks".into())
        .await
        .unwrap();

    wait_for(&mut bob_events, |e| {
        matches!(e, PaymentEvent::RequestReceived { .. })
    })
    .await;
    bob.payments()
        .respond(&request_id, false, Some("wrong amount".into()))
        .await
        .unwrap();

    let event = wait_for(&mut alice_events, |e| {
        matches!(e, PaymentEvent::Rejected { .. })
    })
    .await;
    if let PaymentEvent::Rejected { reason, .. } = event {
        assert_eq!(reason.as_deref(), Some("wrong amount"));
    }

    assert_eq!(
        alice.payments().session(&request_id).unwrap().status,
        PaymentStatus::Rejected
    );
    assert_eq!(
        bob.payments().session(&request_id).unwrap().status,
        PaymentStatus::Rejected
    );
    // No money moved anywhere.
    assert_eq!(alice.payments().wallet().balance(&Currency::BRL), 5_000);
    assert_eq!(bob.payments().wallet().balance(&Currency::BRL), 0);
}

#[tokio::test]
async fn cancellation_terminates_both_sides() {
    let hub = MemoryHub::new();
    let (alice, bob) = connected_pair(&hub).await;
    let mut bob_events = bob.payments().subscribe();

    let request_id = alice
        .payments()
        .request_payment(bob.device_id(), 500, Currency::PULSE, "oops".into())
        .await
        .unwrap();
    wait_for(&mut bob_events, |e| {
        matches!(e, PaymentEvent::RequestReceived { .. })
    })
    .await;

    alice
        .payments()
        .cancel(&request_id, "fat-fingered the amount")
        .await
        .unwrap();

    wait_for(&mut bob_events, |e| matches!(e, PaymentEvent::Failed { .. })).await;
    assert_eq!(
        alice.payments().session(&request_id).unwrap().status,
        PaymentStatus::Failed
    );
    assert_eq!(
        bob.payments().session(&request_id).unwrap().status,
        PaymentStatus::Failed
    );
}

#[tokio::test]
async fn insufficient_funds_fails_the_session_cleanly() {
    let hub = MemoryHub::new();
    let (alice, bob) = connected_pair(&hub).await;
    // Alice's wallet is empty; the request goes out anyway and dies at
    // the transfer step.
    let mut alice_events = alice.payments().subscribe();
    let mut bob_events = bob.payments().subscribe();

    let request_id = alice
        .payments()
        .request_payment(bob.device_id(), 9_999, Currency::EUR, "broke".into())
        .await
        .unwrap();

    wait_for(&mut bob_events, |e| {
        matches!(e, PaymentEvent::RequestReceived { .. })
    })
    .await;
    bob.payments().respond(&request_id, true, None).await.unwrap();

    wait_for(&mut alice_events, |e| matches!(e, PaymentEvent::Failed { .. })).await;
    // Bob learns about it through the cancellation notice.
    wait_for(&mut bob_events, |e| matches!(e, PaymentEvent::Failed { .. })).await;

    assert_eq!(
        alice.payments().session(&request_id).unwrap().status,
        PaymentStatus::Failed
    );
    assert_eq!(bob.payments().wallet().balance(&Currency::EUR), 0);
}

#[tokio::test]
async fn zero_amount_requests_are_refused_locally() {
    let hub = MemoryHub::new();
    let (alice, bob) = connected_pair(&hub).await;
    assert!(matches!(
        alice
            .payments()
            .request_payment(bob.device_id(), 0, Currency::BRL, "free lunch".into())
            .await,
        Err(PaymentError::InvalidAmount)
    ));
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unanswered_request_expires_and_blocks_late_transfers() {
    let hub = MemoryHub::new();
    let alice = engine_on(
        &hub,
        "alice",
        PulseConfig {
            payment_request_ttl: Duration::from_millis(200),
            ..test_config("alice")
        },
    );
    let bob = engine_on(&hub, "bob", test_config("bob"));
    alice.connect(bob.identity()).await.unwrap();
    for _ in 0..50 {
        if bob.link().is_authenticated(alice.device_id()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    alice.payments().wallet().credit(&Currency::BRL, 5_000);
    let mut alice_events = alice.payments().subscribe();

    let request_id = alice
        .payments()
        .request_payment(bob.device_id(), 100, Currency::BRL, "hello?".into())
        .await
        .unwrap();

    // Nobody answers; the timer is the only way out.
    wait_for(&mut alice_events, |e| {
        matches!(e, PaymentEvent::Expired { .. })
    })
    .await;
    assert_eq!(
        alice.payments().session(&request_id).unwrap().status,
        PaymentStatus::Expired
    );

    // Driving a transfer against the expired session is refused.
    assert!(matches!(
        alice.payments().send_transfer(&request_id).await,
        Err(PaymentError::SessionExpired(_))
    ));

    // And the wallet never moved.
    assert_eq!(alice.payments().wallet().balance(&Currency::BRL), 5_000);
}

// ---------------------------------------------------------------------------
// Trust Enforcement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blocking_a_connected_peer_tears_the_session_down() {
    let hub = MemoryHub::new();
    let (alice, bob) = connected_pair(&hub).await;

    alice.registry().block(bob.device_id());

    // The trust event loop reacts asynchronously.
    for _ in 0..50 {
        if !alice.link().is_authenticated(bob.device_id()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!alice.link().is_authenticated(bob.device_id()));

    // And dialing again is refused outright.
    assert!(alice.connect(bob.identity()).await.is_err());
}

// ---------------------------------------------------------------------------
// Link Policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_ceiling_holds_across_full_engines() {
    let hub = MemoryHub::new();
    let alice = engine_on(
        &hub,
        "alice",
        PulseConfig {
            link: LinkConfig {
                max_connections: 2,
                ..LinkConfig::default()
            },
            ..test_config("alice")
        },
    );
    let peers: Vec<Arc<PulseEngine>> = (0..3)
        .map(|i| engine_on(&hub, &format!("peer-{i}"), test_config("peer")))
        .collect();

    alice.connect(peers[0].identity()).await.unwrap();
    alice.connect(peers[1].identity()).await.unwrap();
    assert!(alice.connect(peers[2].identity()).await.is_err());

    // The evictable peer is deterministic; freeing it makes room.
    let victim = alice.link().find_peer_to_disconnect().unwrap();
    alice.disconnect(&victim).await;
    alice.connect(peers[2].identity()).await.unwrap();
}
