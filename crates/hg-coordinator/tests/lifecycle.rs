//! Background lifecycle tasks wired to a live coordinator

mod common;

use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hg_broadcast::{MessagePriority, ROOM_API_STATUS};
use hg_common::HealthState;
use hg_config::CoordinatorSettings;
use hg_coordinator::{LifecycleConfig, LifecycleManager};

use common::{harness, provider, wait_for, SpyHandler};

#[tokio::test]
async fn test_health_changes_reach_status_room() {
    let h = harness(vec![provider("alpha")], CoordinatorSettings::default(), SpyHandler::new());
    let lifecycle = LifecycleManager::start(
        h.coordinator.clone(),
        h.store.clone(),
        h.audit.clone(),
        LifecycleConfig::default(),
    );

    let status = h.health.disable("alpha", "ops").await.unwrap();
    assert_eq!(status.status, HealthState::Disabled);

    let hub = h.hub.clone();
    wait_for(|| !hub.buffered(ROOM_API_STATUS).is_empty()).await;

    let message = h.hub.buffered(ROOM_API_STATUS)[0].clone();
    assert_eq!(message.message_type, "health_transition");
    assert_eq!(message.priority, MessagePriority::Normal);
    assert_eq!(message.payload["provider_id"], "alpha");
    assert_eq!(message.payload["to"], "disabled");

    lifecycle.shutdown();
}

#[tokio::test]
async fn test_probe_task_started_for_probed_providers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut probed = provider("probed");
    probed.probe_url = Some(format!("{}/health", server.uri()));
    let h = harness(
        vec![probed, provider("quiet")],
        CoordinatorSettings::default(),
        SpyHandler::new(),
    );

    let lifecycle = LifecycleManager::start(
        h.coordinator.clone(),
        h.store.clone(),
        h.audit.clone(),
        LifecycleConfig::default(),
    );
    assert_eq!(lifecycle.probing(), vec!["probed".to_string()]);

    // The first tick fires immediately
    let mut degraded = false;
    for _ in 0..200 {
        if h.health.status("probed").await.unwrap().status == HealthState::Degraded {
            degraded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(degraded);
    assert!(!server.received_requests().await.unwrap_or_default().is_empty());

    lifecycle.shutdown();
    let lifecycle_probing = || lifecycle.probing().is_empty();
    wait_for(lifecycle_probing).await;
}
