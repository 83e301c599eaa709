//! HTTP API integration tests.
//!
//! Boot the full router over a real listener and drive it with reqwest,
//! with the broker mocked behind wiremock and the hypervisor behind the
//! in-memory supervisor.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tempfile::TempDir;
use tokio::net::TcpListener;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vmlab_hostd::api::{self, AppState};
use vmlab_hostd::broker::{BrokerClient, BrokerConfig};
use vmlab_hostd::images::{ImageStore, MockImageStore};
use vmlab_hostd::process::{MockSupervisor, ProcessSupervisor};
use vmlab_hostd::registry::NodeRegistry;
use vmlab_hostd::state::StateStore;

const CLIENT_BASE_URL: &str = "http://lab.example/guacamole";

struct ApiTestHarness {
    base_url: String,
    client: reqwest::Client,
    supervisor: Arc<MockSupervisor>,
    images: Arc<MockImageStore>,
    _data_dir: TempDir,
}

impl ApiTestHarness {
    async fn new() -> Self {
        let broker_server = Box::leak(Box::new(MockServer::start().await));
        Mock::given(method("POST"))
            .and(path("/api/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authToken": "tok",
            })))
            .mount(broker_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/session/data/postgresql/connections"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "identifier": "conn-1",
            })))
            .mount(broker_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/api/session/data/postgresql/connections/.+$"))
            .respond_with(ResponseTemplate::new(204))
            .mount(broker_server)
            .await;

        let data_dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(MockSupervisor::new());
        let images = Arc::new(MockImageStore::new(data_dir.path()));
        let broker = BrokerClient::new(BrokerConfig {
            base_url: broker_server.uri(),
            username: "guacadmin".to_string(),
            password: "guacadmin".to_string(),
            data_source: "postgresql".to_string(),
            vnc_host: "127.0.0.1".to_string(),
        })
        .with_auth_retry_delay(Duration::ZERO);

        let registry = NodeRegistry::recover(
            StateStore::new(data_dir.path().join("state.json")),
            5900..=5901,
            Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
            Arc::clone(&images) as Arc<dyn ImageStore>,
            Arc::new(broker),
        )
        .unwrap();

        let state = AppState::new(
            registry,
            CLIENT_BASE_URL.to_string(),
            "postgresql".to_string(),
        );
        let app = api::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            supervisor,
            images,
            _data_dir: data_dir,
        }
    }

    async fn create_node(&self) -> serde_json::Value {
        let response = self
            .client
            .post(format!("{}/nodes", self.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        response.json().await.unwrap()
    }

    async fn list_nodes(&self) -> Vec<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}/nodes", self.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.unwrap()
    }
}

#[tokio::test]
async fn healthz_reports_ok() {
    let harness = ApiTestHarness::new().await;
    let response = harness
        .client
        .get(format!("{}/healthz", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "hostd");
}

#[tokio::test]
async fn create_then_list_shows_a_stopped_node() {
    let harness = ApiTestHarness::new().await;
    let created = harness.create_node().await;
    assert_eq!(created["status"], "stopped");
    assert!(created["display_port"].is_null());
    assert!(created["broker_url"].is_null());

    let nodes = harness.list_nodes().await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["id"], created["id"]);
}

#[tokio::test]
async fn run_reports_port_connection_and_broker_url() {
    let harness = ApiTestHarness::new().await;
    let created = harness.create_node().await;
    let id = created["id"].as_str().unwrap();

    let response = harness
        .client
        .post(format!("{}/nodes/{id}/run", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let node: serde_json::Value = response.json().await.unwrap();
    assert_eq!(node["status"], "running");
    assert_eq!(node["display_port"], 5900);
    assert_eq!(node["connection_id"], "conn-1");

    let expected_segment = STANDARD.encode(b"conn-1\0c\0postgresql");
    assert_eq!(
        node["broker_url"],
        format!("{CLIENT_BASE_URL}/#/client/{expected_segment}")
    );
}

#[tokio::test]
async fn run_twice_is_a_bad_request() {
    let harness = ApiTestHarness::new().await;
    let created = harness.create_node().await;
    let id = created["id"].as_str().unwrap();
    let run_url = format!("{}/nodes/{id}/run", harness.base_url);

    harness.client.post(&run_url).send().await.unwrap();
    let response = harness.client.post(&run_url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let problem: serde_json::Value = response.json().await.unwrap();
    assert_eq!(problem["code"], "node-already-running");
}

#[tokio::test]
async fn operations_on_unknown_ids_are_not_found() {
    let harness = ApiTestHarness::new().await;

    for op_url in [
        format!("{}/nodes/node_01HV4Z2WQXKJNM8GPQY6VBKC3D/run", harness.base_url),
        format!("{}/nodes/not-even-an-id/run", harness.base_url),
        format!("{}/nodes/node_01HV4Z2WQXKJNM8GPQY6VBKC3D/stop", harness.base_url),
        format!("{}/nodes/node_01HV4Z2WQXKJNM8GPQY6VBKC3D/wipe", harness.base_url),
    ] {
        let response = harness.client.post(&op_url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND, "{op_url}");
    }

    let response = harness
        .client
        .delete(format!(
            "{}/nodes/node_01HV4Z2WQXKJNM8GPQY6VBKC3D",
            harness.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stop_clears_the_view_fields() {
    let harness = ApiTestHarness::new().await;
    let created = harness.create_node().await;
    let id = created["id"].as_str().unwrap();

    harness
        .client
        .post(format!("{}/nodes/{id}/run", harness.base_url))
        .send()
        .await
        .unwrap();

    let response = harness
        .client
        .post(format!("{}/nodes/{id}/stop", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let node: serde_json::Value = response.json().await.unwrap();
    assert_eq!(node["status"], "stopped");
    assert!(node["display_port"].is_null());
    assert!(node["connection_id"].is_null());
}

#[tokio::test]
async fn listing_demotes_a_node_whose_process_died() {
    let harness = ApiTestHarness::new().await;
    let created = harness.create_node().await;
    let id = created["id"].as_str().unwrap();

    harness
        .client
        .post(format!("{}/nodes/{id}/run", harness.base_url))
        .send()
        .await
        .unwrap();

    let listed = harness.list_nodes().await;
    assert_eq!(listed[0]["status"], "running");

    // Kill the process behind the registry's back.
    harness.supervisor.kill_all();

    let listed = harness.list_nodes().await;
    assert_eq!(listed[0]["status"], "stopped");
    assert!(listed[0]["display_port"].is_null());
}

#[tokio::test]
async fn wipe_returns_the_stopped_node() {
    let harness = ApiTestHarness::new().await;
    let created = harness.create_node().await;
    let id = created["id"].as_str().unwrap();

    let response = harness
        .client
        .post(format!("{}/nodes/{id}/wipe", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(harness.images.resets().len(), 1);
}

#[tokio::test]
async fn delete_returns_no_content_and_removes_the_node() {
    let harness = ApiTestHarness::new().await;
    let created = harness.create_node().await;
    let id = created["id"].as_str().unwrap();

    let response = harness
        .client
        .delete(format!("{}/nodes/{id}", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    assert!(harness.list_nodes().await.is_empty());
}

#[tokio::test]
async fn provision_failure_is_an_internal_error() {
    let harness = ApiTestHarness::new().await;
    harness.images.set_fail_overlay(true);

    let response = harness
        .client
        .post(format!("{}/nodes", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.status(),
        reqwest::StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/problem+json")
    );

    let problem: serde_json::Value = response.json().await.unwrap();
    assert_eq!(problem["code"], "provision-failed");
}
