//! Common test utilities for API testing with mocks.
//!
//! This module provides a test fixture that creates an in-process router
//! with the engine wired to mock collaborators, so batches run end to end
//! without network access or a browser.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use cartpilot_core::{
    create_event_pipeline,
    config::{DatabaseConfig, ServerConfig},
    testing::{MockAccountApi, MockOrderSite},
    AccountApi, AccountStore, BatchController, Config, DriverBackends, EventBroadcaster,
    OrderSite, ResultRecorder, RetryPolicy, RunStore, SqliteRunStore, WorkflowConfig,
};

/// Re-export fixtures for test convenience
pub use cartpilot_core::testing::fixtures;

/// Test fixture for API testing with mock dependencies.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_start_batch() {
///     let fixture = TestFixture::new();
///
///     let response = fixture.post("/api/v1/batches", json!({
///         "range_start": 1,
///         "range_end": 3,
///         "task": { "mode": "checkpoint" }
///     })).await;
///
///     assert_eq!(response.status, 201);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    pub controller: Arc<BatchController>,
    pub broadcaster: EventBroadcaster,
    /// Mock account API - configure points and failures
    pub account_api: Arc<MockAccountApi>,
    /// Mock order site - script step failures
    pub order_site: Arc<MockOrderSite>,
    /// Temporary directory for the test database
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Create a new test fixture with default mocks.
    pub fn new() -> Self {
        Self::with_mocks(MockAccountApi::new(), MockOrderSite::new())
    }

    /// Create a test fixture around the given mocks.
    pub fn with_mocks(account_api: MockAccountApi, order_site: MockOrderSite) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let config = Config {
            server: ServerConfig {
                host: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                port: 0, // Not used for in-process testing
            },
            database: DatabaseConfig {
                path: db_path.clone(),
            },
            ..Default::default()
        };

        let run_store: Arc<dyn RunStore> =
            Arc::new(SqliteRunStore::new(&db_path).expect("Failed to create run store"));
        let recorder = Arc::new(ResultRecorder::new(
            Arc::clone(&run_store),
            config.engine.persistence_retries,
            Duration::from_millis(1),
        ));

        let broadcaster = EventBroadcaster::new(256);
        let (emitter, dispatcher) =
            create_event_pipeline(Arc::clone(&recorder), broadcaster.clone(), 256);
        tokio::spawn(dispatcher.run());

        let account_api = Arc::new(account_api);
        let order_site = Arc::new(order_site);
        let backends = DriverBackends::new(fast_workflow())
            .with_account_api(Arc::clone(&account_api) as Arc<dyn AccountApi>)
            .with_order_site(Arc::clone(&order_site) as Arc<dyn OrderSite>);

        let accounts: Arc<dyn AccountStore> = Arc::new(fixtures::account_store(1..=20));
        let controller = Arc::new(BatchController::new(
            config.engine.clone(),
            recorder,
            accounts,
            emitter,
            backends,
        ));

        let state = Arc::new(cartpilot_server::state::AppState::new(
            config,
            Arc::clone(&controller),
            broadcaster.clone(),
            run_store,
        ));
        let router = cartpilot_server::api::create_router(state);

        Self {
            router,
            controller,
            broadcaster,
            account_api,
            order_site,
            temp_dir,
        }
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a POST request with raw string body (for testing malformed JSON).
    pub async fn post_raw(&self, path: &str, body: &str) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// GET an endpoint that answers with plain text.
    pub async fn get_text(&self, path: &str) -> String {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("Response was not UTF-8")
    }

    /// Poll the status endpoint until the batch is terminal.
    pub async fn wait_for_batch(&self, batch_id: &str) -> TestResponse {
        let path = format!("/api/v1/batches/{}", batch_id);
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let response = self.get(&path).await;
                let state = response.body["state"].as_str().unwrap_or_default();
                if state == "completed" || state == "stopped" {
                    return response;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("batch did not finish in time")
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        self.send(request_builder.body(body).unwrap()).await
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}

/// Workflow whose steps retry without delay.
pub fn fast_workflow() -> WorkflowConfig {
    let mut workflow = WorkflowConfig::default();
    workflow.init.retry = RetryPolicy::immediate(3);
    workflow.address_select.retry = RetryPolicy::immediate(3);
    workflow.cart_populate.retry = RetryPolicy::immediate(3);
    workflow.checkout.retry = RetryPolicy::immediate(3);
    workflow
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}
