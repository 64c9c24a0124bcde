//! End-to-end scenarios exercising the pipeline against a mock ingest server.

use analytics_pipeline::circuit_breaker::BreakerState;
use analytics_pipeline::config::OverflowStrategy;
use analytics_pipeline::event::{AlwaysOnline, Event, NetworkStatus, NoopContextProvider};
use analytics_pipeline::keystore::InMemoryKeyStore;
use analytics_pipeline::{Configuration, Observer, Pipeline, PipelineDeps};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dsn_for(server: &MockServer, project_id: &str) -> String {
    let uri = server.uri();
    let without_scheme = uri.trim_start_matches("http://");
    format!("http://pub123@{without_scheme}/v1/{project_id}")
}

fn deps() -> PipelineDeps {
    PipelineDeps {
        key_store: Arc::new(InMemoryKeyStore::default()),
        context_provider: Arc::new(NoopContextProvider),
        network_status: Arc::new(AlwaysOnline),
    }
}

#[derive(Default)]
struct DropCounter {
    dropped: AtomicUsize,
}

impl Observer for DropCounter {
    fn events_dropped(&self, count: usize, _reason: &str) {
        self.dropped.fetch_add(count, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn happy_path_delivers_queued_events() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = Configuration::builder(&dsn_for(&server, "proj1"))
        .unwrap()
        .auto_flush(false)
        .build();
    let pipeline = Pipeline::new(config, deps()).unwrap();

    pipeline.track(Event::new("app_opened")).unwrap();
    pipeline.track(Event::new("screen_viewed")).unwrap();

    let delivered = pipeline.flush().await;
    assert_eq!(delivered, 2);
    assert_eq!(pipeline.stats().total, 0);
}

#[tokio::test]
async fn transient_failure_then_recovery_drains_queue() {
    let server = MockServer::start().await;
    // First attempt fails with a retryable 503; the retry (after backoff) succeeds.
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(2)
        .mount(&server)
        .await;

    let config = Configuration::builder(&dsn_for(&server, "proj2"))
        .unwrap()
        .auto_flush(false)
        .max_retries(3)
        .build();
    let pipeline = Pipeline::new(config, deps()).unwrap();

    pipeline.track(Event::new("purchase")).unwrap();

    // First flush hits the 503 and stops at the first failed batch.
    let delivered = pipeline.flush().await;
    assert_eq!(delivered, 0);
    assert_eq!(pipeline.stats().total, 1);

    // Wait out the retry-backoff window, then the retry succeeds.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let delivered = pipeline.flush().await;
    assert_eq!(delivered, 1);
    assert_eq!(pipeline.stats().total, 0);
}

#[tokio::test]
async fn repeated_failures_open_the_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = Configuration::builder(&dsn_for(&server, "proj3"))
        .unwrap()
        .auto_flush(false)
        .max_retries(5)
        .circuit_breaker_threshold(2)
        .circuit_breaker_cooldown(Duration::from_secs(60))
        .build();
    let pipeline = Pipeline::new(config, deps()).unwrap();

    pipeline.track(Event::new("a")).unwrap();
    assert_eq!(pipeline.flush().await, 0);
    assert_eq!(pipeline.circuit_breaker_state(), BreakerState::Closed);

    pipeline.track(Event::new("b")).unwrap();
    assert_eq!(pipeline.flush().await, 0);
    assert_eq!(pipeline.circuit_breaker_state(), BreakerState::Open);

    // Third flush should fail fast without hitting the server at all.
    pipeline.track(Event::new("c")).unwrap();
    let requests_before = server.received_requests().await.unwrap().len();
    assert_eq!(pipeline.flush().await, 0);
    let requests_after = server.received_requests().await.unwrap().len();
    assert_eq!(requests_before, requests_after);
    assert_eq!(pipeline.circuit_breaker_state(), BreakerState::Open);
}

#[tokio::test]
async fn overflow_drops_oldest_event_first() {
    let server = MockServer::start().await;
    let config = Configuration::builder(&dsn_for(&server, "proj4"))
        .unwrap()
        .auto_flush(false)
        .max_queue_hard(2)
        .overflow_strategy(OverflowStrategy::DropOldest)
        .build();
    let pipeline = Pipeline::new(config, deps()).unwrap();
    let counter = Arc::new(DropCounter::default());
    pipeline.register_observer(counter.clone());

    pipeline.track(Event::new("first")).unwrap();
    pipeline.track(Event::new("second")).unwrap();
    pipeline.track(Event::new("third")).unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(counter.dropped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ttl_expiry_prunes_stale_events_before_flush() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = Configuration::builder(&dsn_for(&server, "proj5"))
        .unwrap()
        .auto_flush(false)
        .event_ttl(Duration::from_millis(50))
        .build();
    let pipeline = Pipeline::new(config, deps()).unwrap();

    pipeline.track(Event::new("will_expire")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.track(Event::new("fresh")).unwrap();
    assert_eq!(pipeline.stats().total, 2);

    // flush() sweeps expired events before batching what remains.
    let delivered = pipeline.flush().await;
    assert_eq!(delivered, 1);
    assert_eq!(pipeline.stats().total, 0);
}

#[tokio::test]
async fn pii_in_event_metadata_is_scrubbed_before_flush() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = Configuration::builder(&dsn_for(&server, "proj6"))
        .unwrap()
        .auto_flush(false)
        .redact_pii(true)
        .build();
    let pipeline = Pipeline::new(config, deps()).unwrap();

    pipeline
        .track(Event::new("signup").with_metadata("email", "jane.doe@example.com"))
        .unwrap();
    let delivered = pipeline.flush().await;
    assert_eq!(delivered, 1);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(!body.contains("jane.doe@example.com"));
    assert!(body.contains("[EMAIL]"));
}

#[tokio::test]
async fn disabled_pipeline_rejects_tracking_end_to_end() {
    let server = MockServer::start().await;
    let config = Configuration::builder(&dsn_for(&server, "proj7"))
        .unwrap()
        .auto_flush(false)
        .enabled(false)
        .build();
    let pipeline = Pipeline::new(config, deps()).unwrap();

    let result = pipeline.track(Event::new("ignored"));
    assert!(matches!(result, Err(analytics_pipeline::PipelineError::AnalyticsDisabled)));
    assert_eq!(pipeline.stats().total, 0);
}

#[tokio::test]
async fn max_queue_soft_triggers_immediate_flush() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = Configuration::builder(&dsn_for(&server, "proj8"))
        .unwrap()
        .auto_flush(false)
        .max_queue_soft(2)
        .max_queue_hard(100)
        .build();
    let pipeline = Pipeline::new(config, deps()).unwrap();

    pipeline.track(Event::new("a")).unwrap();
    pipeline.track(Event::new("b")).unwrap();

    // The soft-threshold flush is spawned in the background; give it a
    // moment to run rather than relying on an explicit pipeline.flush().
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.stats().total, 0);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
}
