//! E2E tests for outbound delivery retries and the persisted queue

mod common;

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use common::{RecordingInbox, TestServer, unreachable_inbox};
use notefed::data::{DeliveryJob, RelationshipStore};
use notefed::federation::{OutboundKind, factory};

const BASE_DELAY: Duration = Duration::from_millis(100);

#[tokio::test]
async fn test_unreachable_inboxes_get_three_attempts() {
    let server = TestServer::with_retry_delay(BASE_DELAY).await;
    let alice = server.register("alice").await;

    let reachable = RecordingInbox::start(StatusCode::ACCEPTED).await;
    let failing = RecordingInbox::start(StatusCode::SERVICE_UNAVAILABLE).await;
    let dead_one = unreachable_inbox().await;
    let dead_two = unreachable_inbox().await;

    let activity = factory::follow(
        factory::activity_iri(&alice.iri, OutboundKind::Follow),
        &alice.iri,
        "https://remote.example/users/bob",
    );

    let started = Instant::now();
    let results = server
        .state
        .delivery
        .deliver_to_inboxes(
            &activity,
            &alice,
            vec![
                dead_one.clone(),
                reachable.url.clone(),
                failing.url.clone(),
                dead_two.clone(),
                // Duplicate targets collapse to one delivery.
                reachable.url.clone(),
            ],
        )
        .await;
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 4);
    for result in &results {
        if result.inbox_uri == reachable.url {
            assert!(result.success);
            assert_eq!(result.attempts, 1);
            assert_eq!(result.status_code, Some(202));
        } else {
            assert!(!result.success, "{} should fail", result.inbox_uri);
            assert_eq!(result.attempts, 3, "{}", result.inbox_uri);
            assert!(result.error.is_some());
        }
    }
    assert_eq!(
        results
            .iter()
            .find(|r| r.inbox_uri == failing.url)
            .unwrap()
            .status_code,
        Some(503)
    );

    // Delays of 1x and 2x the base between attempts.
    assert!(elapsed >= BASE_DELAY * 3);
    assert_eq!(reachable.hits().len(), 1);

    let hits = failing.hits();
    assert_eq!(hits.len(), 3);
    let first_gap = hits[1] - hits[0];
    let second_gap = hits[2] - hits[1];
    assert!(first_gap >= BASE_DELAY, "first gap {:?}", first_gap);
    assert!(second_gap >= BASE_DELAY * 2, "second gap {:?}", second_gap);
    assert!(second_gap > first_gap);

    // Nothing is left waiting; exhausted jobs are parked, delivered ones removed.
    assert!(server.state.db.pending_deliveries(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreadable_signing_key_is_retried_then_abandoned() {
    let server = TestServer::with_retry_delay(BASE_DELAY).await;
    let mut alice = server.register("alice").await;
    alice.encrypted_private_key = "bm90IGEga2V5".to_string();
    let inbox = RecordingInbox::start(StatusCode::ACCEPTED).await;

    let activity = factory::follow(
        factory::activity_iri(&alice.iri, OutboundKind::Follow),
        &alice.iri,
        "https://remote.example/users/bob",
    );
    let results = server
        .state
        .delivery
        .deliver_to_inboxes(&activity, &alice, vec![inbox.url.clone()])
        .await;

    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert_eq!(results[0].attempts, 3);
    assert!(
        results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("Cannot unlock signing key")
    );
    // Nothing unsigned ever leaves.
    assert!(inbox.hits().is_empty());

    assert!(server.state.db.pending_deliveries(100).await.unwrap().is_empty());
    assert_eq!(server.state.db.count_abandoned_deliveries().await.unwrap(), 1);
}

#[tokio::test]
async fn test_delivery_is_signed() {
    let receiver = TestServer::new().await;
    let sender = TestServer::new().await;
    receiver.register("bob").await;
    let alice = sender.register("alice").await;

    let activity = factory::follow(
        factory::activity_iri(&alice.iri, OutboundKind::Follow),
        &alice.iri,
        &receiver.actor_iri("bob"),
    );
    let results = sender
        .state
        .delivery
        .deliver_to_actor(&activity, &alice, &receiver.actor_iri("bob"))
        .await;

    assert_eq!(results.len(), 1);
    assert!(results[0].success, "{:?}", results[0].error);
    assert_eq!(results[0].attempts, 1);
    assert_eq!(
        receiver
            .state
            .db
            .count_followers(&receiver.actor_iri("bob"))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_resume_pending_retries_persisted_job() {
    let server = TestServer::with_retry_delay(BASE_DELAY).await;
    let alice = server.register("alice").await;
    let inbox = RecordingInbox::start(StatusCode::OK).await;

    let activity = factory::follow(
        factory::activity_iri(&alice.iri, OutboundKind::Follow),
        &alice.iri,
        "https://remote.example/users/bob",
    );
    let job = DeliveryJob::new(
        inbox.url.clone(),
        alice.iri.clone(),
        serde_json::to_string(&activity).unwrap(),
    );
    server.state.db.enqueue_delivery(&job).await.unwrap();

    let resumed = server.state.delivery.resume_pending().await.unwrap();
    assert_eq!(resumed, 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while inbox.hits().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(inbox.hits().len(), 1);

    while server.state.db.get_delivery(&job.id).await.unwrap().is_some()
        && Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(server.state.db.get_delivery(&job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_resume_abandons_job_without_signer() {
    let server = TestServer::new().await;
    let job = DeliveryJob::new(
        "http://127.0.0.1:9/inbox".to_string(),
        server.actor_iri("ghost"),
        "{}".to_string(),
    );
    server.state.db.enqueue_delivery(&job).await.unwrap();

    assert_eq!(server.state.delivery.resume_pending().await.unwrap(), 0);

    let stored = server.state.db.get_delivery(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, "abandoned");
}
