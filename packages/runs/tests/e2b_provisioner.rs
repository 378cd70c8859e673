// ABOUTME: E2B provisioner tests against a mock HTTP server
// ABOUTME: Request shape, auth header and status-code to error mapping

use sandkeep_runs::{
    E2bProvisioner, ProvisioningError, RunLimits, SandboxHandle, SandboxProvisioner,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provisioner(server: &MockServer) -> E2bProvisioner {
    E2bProvisioner::new("test-key".to_string(), Some(server.uri())).unwrap()
}

#[tokio::test]
async fn create_posts_template_and_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .and(header("X-API-Key", "test-key"))
        .and(body_json(json!({"templateID": "base", "timeout": 90})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "sandboxID": "sbx-123",
            "templateID": "base",
            "clientID": "c1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let limits = RunLimits {
        max_duration_ms: Some(90_000),
        idle_timeout_ms: None,
    };
    let sandbox = provisioner(&server).create("base", &limits).await.unwrap();

    assert_eq!(sandbox.external_id, "sbx-123");
}

#[tokio::test]
async fn create_maps_rate_limit_to_quota() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let err = provisioner(&server)
        .create("base", &RunLimits::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::QuotaExceeded(_)));
}

#[tokio::test]
async fn create_maps_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = provisioner(&server)
        .create("base", &RunLimits::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::PermissionDenied(_)));
}

#[tokio::test]
async fn connect_to_missing_sandbox_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sandboxes/sbx-gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = provisioner(&server).connect("sbx-gone").await.unwrap_err();

    assert!(err.is_gone());
}

#[tokio::test]
async fn kill_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/sandboxes/sbx-live"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/sandboxes/sbx-gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let provisioner = provisioner(&server);
    for id in ["sbx-live", "sbx-gone"] {
        provisioner
            .kill(&SandboxHandle {
                external_id: id.to_string(),
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn kill_server_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/sandboxes/sbx-1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&server)
        .await;

    let err = provisioner(&server)
        .kill(&SandboxHandle {
            external_id: "sbx-1".to_string(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::Other(_)));
}
