//! Background processing: retry backoff, exhaustion, handler faults, shutdown

mod common;

use std::time::Duration;

use chrono::TimeZone;
use hg_broadcast::ROOM_WEBHOOK_EVENTS;
use hg_common::{AuditAction, ErrorKind, HealthState};
use hg_config::CoordinatorSettings;
use hg_coordinator::{HandlerError, IngestResponse, Processing};

use common::{fast_retries, harness, provider, signed, wait_for, SpyHandler, T0};

fn transient(message: &str) -> Result<(), HandlerError> {
    Err(HandlerError::Transient(message.to_string()))
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_then_success() {
    let h = harness(
        vec![provider("alpha")],
        fast_retries(),
        SpyHandler::scripted(vec![transient("upstream 503")]),
    );

    h.coordinator.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();

    let coordinator = h.coordinator.clone();
    wait_for(|| coordinator.outcomes("alpha", "evt_1").len() == 2 && coordinator.in_pipeline_count() == 0).await;

    let trail = h.coordinator.outcomes("alpha", "evt_1");
    assert!(!trail[0].success);
    assert_eq!(trail[0].retry_count, 0);
    assert_eq!(trail[0].next_retry_at, Some(chrono::Utc.timestamp_opt(T0 + 1, 0).unwrap()));
    assert!(trail[1].success);
    assert_eq!(trail[1].retry_count, 1);

    assert_eq!(h.handler.calls(), 2);
    assert_eq!(h.audit.count(AuditAction::RetryScheduled), 1);
    assert_eq!(h.audit.count(AuditAction::EventCompleted), 1);
    assert_eq!(h.audit.count(AuditAction::EventFailed), 0);
    assert_eq!(h.coordinator.pending_retries(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_after_max_attempts() {
    let h = harness(
        vec![provider("alpha")],
        fast_retries(),
        SpyHandler::scripted(vec![transient("a"), transient("b"), transient("c"), transient("d")]),
    );

    h.coordinator.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();

    let coordinator = h.coordinator.clone();
    wait_for(|| coordinator.outcomes("alpha", "evt_1").len() == 3 && coordinator.in_pipeline_count() == 0).await;

    let trail = h.coordinator.outcomes("alpha", "evt_1");
    assert!(trail.iter().all(|o| !o.success));
    assert!(!trail[0].is_exhausted());
    assert!(!trail[1].is_exhausted());
    assert!(trail[2].is_exhausted());
    assert_eq!(trail[2].retry_count, 2);
    assert_eq!(trail[2].error.as_deref(), Some("transient failure: c"));

    assert_eq!(h.handler.calls(), 3);
    assert_eq!(h.audit.count(AuditAction::RetryScheduled), 2);
    assert_eq!(h.audit.count(AuditAction::EventFailed), 1);

    let status = h.health.status("alpha").await.unwrap();
    assert_eq!(status.status, HealthState::Degraded);

    let last = h.hub.buffered(ROOM_WEBHOOK_EVENTS).last().cloned().unwrap();
    assert_eq!(last.message_type, "webhook_failed");
    assert_eq!(last.payload["attempts"], 3);

    // No fourth attempt, however long we wait
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.handler.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_not_retried() {
    let h = harness(
        vec![provider("alpha")],
        fast_retries(),
        SpyHandler::scripted(vec![Err(HandlerError::Permanent("unknown customer".to_string()))]),
    );

    h.coordinator.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();

    let coordinator = h.coordinator.clone();
    wait_for(|| coordinator.outcomes("alpha", "evt_1").len() == 1 && coordinator.in_pipeline_count() == 0).await;

    let trail = h.coordinator.outcomes("alpha", "evt_1");
    assert!(trail[0].is_exhausted());
    assert_eq!(h.audit.count(AuditAction::RetryScheduled), 0);
    assert_eq!(h.audit.count(AuditAction::EventFailed), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.handler.calls(), 1);
}

#[tokio::test]
async fn test_handler_panic_is_a_permanent_failure() {
    let h = harness(vec![provider("alpha")], fast_retries(), SpyHandler::panicking());

    h.coordinator.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();

    let coordinator = h.coordinator.clone();
    wait_for(|| coordinator.outcomes("alpha", "evt_1").len() == 1 && coordinator.in_pipeline_count() == 0).await;

    let outcome = &h.coordinator.outcomes("alpha", "evt_1")[0];
    assert!(outcome.is_exhausted());
    assert!(outcome.error.as_deref().unwrap_or_default().contains("panicked"));
    assert_eq!(h.handler.calls(), 1);
    assert!(h.coordinator.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_handler_timeout_is_enforced() {
    let settings = CoordinatorSettings {
        max_attempts: 1,
        ..fast_retries()
    };
    let h = harness(vec![provider("alpha")], settings, SpyHandler::slow(Duration::from_secs(30)));

    h.coordinator.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();

    let coordinator = h.coordinator.clone();
    wait_for(|| coordinator.outcomes("alpha", "evt_1").len() == 1 && coordinator.in_pipeline_count() == 0).await;

    let outcome = &h.coordinator.outcomes("alpha", "evt_1")[0];
    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("timed out after 2000ms"));
    assert!(outcome.processing_time_ms >= 2000);
}

#[tokio::test(start_paused = true)]
async fn test_critical_failure_returns_immediately_then_retries() {
    let h = harness(
        vec![provider("payments").with_critical_event_types(["payment.failed"])],
        fast_retries(),
        SpyHandler::scripted(vec![transient("ledger busy")]),
    );

    let response = h
        .coordinator
        .ingest(signed("payments", r#"{"id":"pay_1","type":"payment.failed"}"#))
        .await
        .unwrap();
    match response {
        IngestResponse::Accepted {
            processing: Processing::Immediate(outcome),
            ..
        } => {
            assert!(!outcome.success);
            assert!(outcome.next_retry_at.is_some());
        }
        other => panic!("expected immediate processing, got {:?}", other),
    }

    let coordinator = h.coordinator.clone();
    wait_for(|| coordinator.outcomes("payments", "pay_1").len() == 2 && coordinator.in_pipeline_count() == 0).await;
    assert!(h.coordinator.outcomes("payments", "pay_1")[1].success);
    assert_eq!(h.handler.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_retry_and_stops_intake() {
    let h = harness(
        vec![provider("alpha")],
        fast_retries(),
        SpyHandler::scripted(vec![transient("upstream 503")]),
    );

    h.coordinator.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();

    let coordinator = h.coordinator.clone();
    wait_for(|| coordinator.pending_retries() == 1).await;

    h.coordinator.shutdown().await;

    assert!(!h.coordinator.is_running());
    assert!(h.coordinator.all_pools_drained());
    assert_eq!(h.coordinator.pending_retries(), 0);
    assert_eq!(h.coordinator.in_pipeline_count(), 0);

    // The trail ends on the scheduled retry that never ran
    let trail = h.coordinator.outcomes("alpha", "evt_1");
    assert_eq!(trail.len(), 1);
    assert!(trail[0].next_retry_at.is_some());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.handler.calls(), 1);

    let err = h.coordinator.ingest(signed("alpha", r#"{"id":"evt_2"}"#)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InfrastructureDegradation);
}

#[tokio::test(start_paused = true)]
async fn test_failure_during_drain_stays_resumable() {
    let h = harness(
        vec![provider("alpha")],
        fast_retries(),
        SpyHandler::scripted_slow(vec![transient("upstream 503")], Duration::from_millis(500)),
    );

    h.coordinator.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();

    let handler = h.handler.clone();
    wait_for(|| handler.calls() == 1).await;

    // The in-flight attempt fails while the pools drain
    h.coordinator.shutdown().await;

    assert_eq!(h.coordinator.pending_retries(), 0);
    assert_eq!(h.coordinator.in_pipeline_count(), 0);

    let trail = h.coordinator.outcomes("alpha", "evt_1");
    assert_eq!(trail.len(), 1);
    assert!(!trail[0].success);
    assert!(!trail[0].is_exhausted());
    assert!(trail[0].next_retry_at.is_some());
    assert_eq!(h.audit.count(AuditAction::EventFailed), 0);
    assert_eq!(h.audit.count(AuditAction::RetryScheduled), 0);
    assert!(h
        .hub
        .buffered(ROOM_WEBHOOK_EVENTS)
        .iter()
        .all(|d| d.message_type != "webhook_failed"));

    // A restarted instance picks the redelivery up at the next attempt
    let restarted = h.sibling();
    let response = restarted.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();
    assert!(!response.is_duplicate());

    let handler = h.handler.clone();
    wait_for(|| handler.calls() == 2 && restarted.in_pipeline_count() == 0).await;

    let latest = restarted.latest_outcome("alpha", "evt_1").await.unwrap();
    assert!(latest.success);
    assert_eq!(latest.retry_count, 1);
    assert_eq!(h.audit.count(AuditAction::EventCompleted), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_cancelled_by_shutdown_resumes_on_redelivery() {
    let h = harness(
        vec![provider("alpha")],
        fast_retries(),
        SpyHandler::scripted(vec![transient("upstream 503")]),
    );

    h.coordinator.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();
    let coordinator = h.coordinator.clone();
    wait_for(|| coordinator.pending_retries() == 1).await;
    h.coordinator.shutdown().await;

    let restarted = h.sibling();
    let response = restarted.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();
    assert!(!response.is_duplicate());

    wait_for(|| restarted.in_pipeline_count() == 0 && restarted.outcomes("alpha", "evt_1").len() == 1).await;
    let latest = restarted.latest_outcome("alpha", "evt_1").await.unwrap();
    assert!(latest.success);
    assert_eq!(latest.retry_count, 1);
    assert_eq!(h.handler.calls(), 2);

    // Terminal now: further redeliveries are duplicates
    let again = restarted.ingest(signed("alpha", r#"{"id":"evt_1"}"#)).await.unwrap();
    assert!(again.is_duplicate());
}
