// Common test utilities and fixtures
#![allow(dead_code)]

use axum::Router;
use axum_test::TestServer;
use hostplane_api::app::{create_cors, AppState};
use hostplane_api::routes::create_router;
use hostplane_host::mock::MockHost;
use hostplane_orchestrator::store::MemoryStore;
use hostplane_orchestrator::{assemble, OrchestratorConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A running test server plus the pieces tests poke at directly.
pub struct TestApp {
    pub server: TestServer,
    pub host: Arc<MockHost>,
    pub config: OrchestratorConfig,
    pub dir: TempDir,
}

/// Same router as main.rs, over an in-memory store and the mock host.
pub fn create_test_app_service(config: &OrchestratorConfig, host: Arc<MockHost>) -> Router {
    let store = Arc::new(MemoryStore::new());
    let runtime = assemble(store, host, config.clone(), None).expect("assemble orchestrator");
    let state = AppState::new(runtime.orchestrator);
    create_router().layer(create_cors()).with_state(state)
}

pub fn test_app() -> TestApp {
    test_app_with(|_| {})
}

pub fn test_app_with(tweak: impl FnOnce(&mut OrchestratorConfig)) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = OrchestratorConfig::under(dir.path());
    tweak(&mut config);
    let host = Arc::new(MockHost::new());
    let server = TestServer::new(create_test_app_service(&config, host.clone()))
        .expect("test server");
    TestApp {
        server,
        host,
        config,
        dir,
    }
}

pub fn vm_body(name: &str) -> Value {
    json!({
        "name": name,
        "cpu_cores": 2,
        "ram_mb": 1024,
        "disk_size_gb": 10,
        "disk_format": "qcow2",
        "network_mode": "nat",
        "display_protocol": "spice"
    })
}

/// POST /vms and return the created VM's `data`.
pub async fn create_vm(app: &TestApp, name: &str) -> Value {
    let response = app.server.post("/vms").json(&vm_body(name)).await;
    assert_eq!(response.status_code(), 201, "{}", response.text());
    response.json::<Value>()["data"].clone()
}

/// Poll GET /backups/{id}/status until the job leaves creating/restoring.
pub async fn wait_for_job(app: &TestApp, job_id: &str) -> String {
    for _ in 0..500 {
        let body: Value = app
            .server
            .get(&format!("/backups/{}/status", job_id))
            .await
            .json();
        let status = body["data"]["status"].as_str().unwrap_or_default().to_string();
        if status != "creating" && status != "restoring" {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} never finished", job_id);
}
