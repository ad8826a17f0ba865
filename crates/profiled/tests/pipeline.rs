//! Integration tests for the profile pipeline.
//!
//! Tests the full flow: HTTP ingest -> store -> rotation -> uploader -> collector

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    routing::post,
    Json, Router,
};
use parking_lot::Mutex;
use rstest::{fixture, rstest};
use tower::ServiceExt;

use profiled::config::{ProfileConfig, Secret};
use profiled::ingest::{ingest_router, IngestState, API_KEY_HEADER};
use profiled::rotation::rotate_and_submit;
use profiled::{
    FeatureValue, HttpPublisher, ProfileStore, PublishError, Publisher, RetryPolicy,
    RotatedProfile, Uploader, WindowKey,
};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct CollectingPublisher {
    received: Mutex<Vec<RotatedProfile>>,
}

#[async_trait]
impl Publisher for CollectingPublisher {
    async fn publish(&self, profile: &RotatedProfile) -> Result<(), PublishError> {
        self.received.lock().push(profile.clone());
        Ok(())
    }
}

#[fixture]
fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

#[fixture]
fn profile_config() -> ProfileConfig {
    ProfileConfig {
        org_id: "org-1".to_owned(),
        api_key: Some(Secret::new("secret-key")),
        ..ProfileConfig::default()
    }
}

#[fixture]
fn collecting() -> Arc<CollectingPublisher> {
    Arc::new(CollectingPublisher::default())
}

/// Fake collector answering with scripted statuses, then 200.
#[derive(Clone, Default)]
struct Collector {
    statuses: Arc<Mutex<Vec<StatusCode>>>,
    calls: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>,
}

async fn handle_profiles(
    State(collector): State<Collector>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    collector.calls.fetch_add(1, Ordering::SeqCst);
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    collector.bodies.lock().push((auth, body));

    let mut statuses = collector.statuses.lock();
    if statuses.is_empty() {
        StatusCode::OK
    } else {
        statuses.remove(0)
    }
}

async fn spawn_collector(statuses: Vec<StatusCode>) -> (String, Collector) {
    let collector = Collector {
        statuses: Arc::new(Mutex::new(statuses)),
        ..Collector::default()
    };
    let router = Router::new()
        .route("/v1/profiles", post(handle_profiles))
        .with_state(collector.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}"), collector)
}

fn rotated(dataset: &str) -> RotatedProfile {
    let store = ProfileStore::new();
    let key = WindowKey::builder("org-1", dataset)
        .tag("segment.region", "eu")
        .build();
    store
        .with_current(&key, |p| p.record("latency", &FeatureValue::Number(12.5)))
        .unwrap();
    store.rotate_all().remove(0)
}

// ============================================================================
// Store consistency
// ============================================================================

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_and_rotations_count_each_observation_once() {
    let store = Arc::new(ProfileStore::new());
    let writers = 8;
    let per_writer = 2_000;
    let keys: Vec<WindowKey> = (0..4)
        .map(|i| WindowKey::new("org-1", format!("m{i}")))
        .collect();

    let mut handles = Vec::new();
    for w in 0..writers {
        let store = store.clone();
        let keys = keys.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..per_writer {
                let key = &keys[(w + i) % keys.len()];
                store
                    .with_current(key, |p| p.record("f", &FeatureValue::Bool(true)))
                    .unwrap();
                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    let rotator = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut total = 0u64;
            for _ in 0..20 {
                total += store
                    .rotate_all()
                    .iter()
                    .map(|r| r.snapshot.observations)
                    .sum::<u64>();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            total
        })
    };

    for handle in handles {
        handle.await.unwrap();
    }
    let mut total = rotator.await.unwrap();
    total += store
        .rotate_all()
        .iter()
        .map(|r| r.snapshot.observations)
        .sum::<u64>();

    assert_eq!(total, (writers * per_writer) as u64);
    assert!(store.is_empty());
}

// ============================================================================
// Ingest to publisher
// ============================================================================

#[rstest]
#[tokio::test]
async fn ingested_observations_reach_the_publisher(
    profile_config: ProfileConfig,
    collecting: Arc<CollectingPublisher>,
    fast_policy: RetryPolicy,
) {
    let store = Arc::new(ProfileStore::new());
    let uploader = Arc::new(Uploader::new(collecting.clone(), fast_policy, 4));
    let state = IngestState {
        store: store.clone(),
        uploader: uploader.clone(),
        profile: Arc::new(profile_config),
    };

    for body in [
        r#"{"datasetId": "m1", "tags": {"region": "eu"}, "single": {"f1": "x", "f2": 1}}"#,
        r#"{"datasetId": "m1", "tags": {"region": "eu"}, "multiple": {"columns": ["f1"], "data": [["y"], ["z"]]}}"#,
        r#"{"datasetId": "m2", "single": {"f3": [1, 2]}}"#,
    ] {
        let request = Request::builder()
            .method("POST")
            .uri("/logs")
            .header(API_KEY_HEADER, "secret-key")
            .body(Body::from(body))
            .unwrap();
        let response = ingest_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(rotate_and_submit(&store, &uploader), 2);
    assert_eq!(uploader.shutdown(Duration::from_secs(5)).await, 0);

    let received = collecting.received.lock();
    assert_eq!(received.len(), 2);

    let m1 = received
        .iter()
        .find(|r| r.key.dataset_id() == "m1")
        .unwrap();
    assert_eq!(m1.key.tag("segment.region"), Some("eu"));
    assert_eq!(m1.snapshot.feature("f1").unwrap().count, 3);
    assert_eq!(m1.snapshot.feature("f1").unwrap().distinct_count, 3);
    assert_eq!(m1.snapshot.feature("f2").unwrap().count, 1);

    let m2 = received
        .iter()
        .find(|r| r.key.dataset_id() == "m2")
        .unwrap();
    assert_eq!(m2.snapshot.feature("f3").unwrap().unsupported_count, 1);
}

// ============================================================================
// HTTP publisher
// ============================================================================

#[rstest]
#[tokio::test]
async fn http_publisher_posts_profile_with_token() {
    let (endpoint, collector) = spawn_collector(vec![]).await;
    let publisher = HttpPublisher::new(
        &endpoint,
        Some(Secret::new("upload-token")),
        Duration::from_secs(5),
    )
    .unwrap();

    publisher.publish(&rotated("m1")).await.unwrap();

    let bodies = collector.bodies.lock();
    assert_eq!(bodies.len(), 1);
    let (auth, body) = &bodies[0];
    assert_eq!(auth.as_deref(), Some("Bearer upload-token"));
    assert_eq!(body["orgId"], "org-1");
    assert_eq!(body["datasetId"], "m1");
    assert_eq!(body["tags"]["segment.region"], "eu");
    assert_eq!(body["profile"]["features"]["latency"]["max"], 12.5);
}

#[rstest]
#[case::server_error_then_ok(vec![StatusCode::SERVICE_UNAVAILABLE], 2, 1)]
#[case::throttled_twice_then_ok(vec![StatusCode::TOO_MANY_REQUESTS, StatusCode::TOO_MANY_REQUESTS], 3, 1)]
#[case::exhausted(vec![StatusCode::BAD_GATEWAY; 5], 3, 0)]
#[case::rejected(vec![StatusCode::BAD_REQUEST], 1, 0)]
#[tokio::test]
async fn uploader_retries_against_collector(
    fast_policy: RetryPolicy,
    #[case] statuses: Vec<StatusCode>,
    #[case] expected_calls: usize,
    #[case] expected_delivered: u64,
) {
    let (endpoint, collector) = spawn_collector(statuses).await;
    let publisher = HttpPublisher::new(&endpoint, None, Duration::from_secs(5)).unwrap();
    let uploader = Uploader::new(Arc::new(publisher), fast_policy, 2);

    uploader.submit(rotated("m1"));
    assert_eq!(uploader.shutdown(Duration::from_secs(10)).await, 0);

    assert_eq!(collector.calls.load(Ordering::SeqCst), expected_calls);
    assert_eq!(uploader.stats().delivered(), expected_delivered);
}

#[rstest]
#[tokio::test]
async fn unreachable_collector_is_retried(fast_policy: RetryPolicy) {
    // Bind then drop to obtain a port with nothing listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let publisher =
        HttpPublisher::new(&format!("http://{addr}"), None, Duration::from_secs(2)).unwrap();
    let result = publisher.publish(&rotated("m1")).await;
    assert!(matches!(result, Err(PublishError::Retryable(_))));

    let uploader = Uploader::new(Arc::new(publisher), fast_policy, 1);
    uploader.submit(rotated("m1"));
    uploader.shutdown(Duration::from_secs(10)).await;
    assert_eq!(uploader.stats().exhausted(), 1);
}
