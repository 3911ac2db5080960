//! Outbound HTTP probes feeding the registry

use std::sync::Arc;
use std::time::Duration;

use hg_common::{HealthState, ManualClock, MemoryAuditSink, ProviderConfig, SignatureScheme};
use hg_config::{ConfigStore, GuardConfig};
use hg_health::{run_probe, HttpProbe, ServiceHealthRegistry};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registry() -> ServiceHealthRegistry {
    let config = GuardConfig::default().with_provider(ProviderConfig::new(
        "telematics",
        SignatureScheme::HmacSha256Hex,
        "k",
    ));
    ServiceHealthRegistry::new(
        Arc::new(ConfigStore::new(config).unwrap()),
        Arc::new(MemoryAuditSink::new()),
        Arc::new(ManualClock::at_unix(1_700_000_000)),
    )
}

#[tokio::test]
async fn test_http_probe_status_classification() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/not-found"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let timeout = Duration::from_secs(2);

    let ok = run_probe(Arc::new(HttpProbe::new(client.clone(), format!("{}/ok", server.uri()))), timeout).await;
    assert!(ok.success);

    // Client errors mean the provider answered
    let not_found = run_probe(
        Arc::new(HttpProbe::new(client.clone(), format!("{}/not-found", server.uri()))),
        timeout,
    )
    .await;
    assert!(not_found.success);

    let broken = run_probe(Arc::new(HttpProbe::new(client, format!("{}/broken", server.uri()))), timeout).await;
    assert!(!broken.success);
    assert_eq!(broken.error.as_deref(), Some("status 503"));
}

#[tokio::test]
async fn test_slow_provider_times_out_into_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let probe = HttpProbe::new(reqwest::Client::new(), server.uri());
    let observation = run_probe(Arc::new(probe), Duration::from_millis(50)).await;
    assert!(!observation.success);
    assert!(observation.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_registry_probe_records_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let registry = registry();
    let probe = Arc::new(HttpProbe::new(reqwest::Client::new(), server.uri()));
    for _ in 0..3 {
        registry.probe("telematics", probe.clone()).await.unwrap();
    }
    let status = registry.status("telematics").await.unwrap();
    assert_eq!(status.status, HealthState::Unhealthy);
    assert_eq!(status.consecutive_failures, 3);
}
