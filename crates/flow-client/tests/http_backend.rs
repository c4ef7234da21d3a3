//! Request/response tests for the HTTP backend against a mock orchestrator

use flow_client::{HttpBackend, HttpBackendConfig, TEAM_HEADER};
use flow_core::{
    ExecutionSearchRequest, ExecutionStatus, FlowError, StartRequest, Task, WorkflowBackend,
    WorkflowVersion,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// HELPERS
// =============================================================================

fn backend(server: &MockServer) -> HttpBackend {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = HttpBackendConfig::new(server.uri())
        .with_token("secret")
        .with_team("team-1");
    HttpBackend::new(config).unwrap()
}

fn envelope(data: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"code": 200, "data": data}))
}

// =============================================================================
// EXECUTIONS
// =============================================================================

#[tokio::test]
async fn test_start_execution_sends_auth_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/workflow/executions/wf-1/start"))
        .and(header("authorization", "Bearer secret"))
        .and(header(TEAM_HEADER, "team-1"))
        .and(body_json(json!({"inputData": {"topic": "rust"}, "version": 2})))
        .respond_with(envelope(json!({"workflowInstanceId": "inst-9"})))
        .expect(1)
        .mount(&server)
        .await;

    let started = backend(&server)
        .start_execution("wf-1", &StartRequest::new(2).with_input("topic", json!("rust")))
        .await
        .unwrap();
    assert_eq!(started.workflow_instance_id, "inst-9");
}

#[tokio::test]
async fn test_get_execution_decodes_record() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/workflow/executions/inst-1"))
        .respond_with(envelope(json!({
            "workflowId": "inst-1",
            "status": "RUNNING",
            "tasks": [{"referenceTaskName": "b", "status": "IN_PROGRESS"}]
        })))
        .mount(&server)
        .await;

    let record = backend(&server).get_execution("inst-1").await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);
    assert_eq!(record.tasks[0].reference_name(), Some("b"));
}

#[tokio::test]
async fn test_control_calls_accept_empty_bodies() {
    let server = MockServer::start().await;

    for action in ["terminate", "pause", "resume"] {
        Mock::given(method("POST"))
            .and(path(format!("/api/workflow/executions/inst-1/{}", action)))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
    }

    let backend = backend(&server);
    backend.terminate_execution("inst-1").await.unwrap();
    backend.pause_execution("inst-1").await.unwrap();
    backend.resume_execution("inst-1").await.unwrap();
}

#[tokio::test]
async fn test_search_returns_page_with_definitions() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/workflow/executions/search"))
        .and(body_json(json!({"workflowId": ["wf"], "pagination": {"page": 1, "limit": 10}})))
        .respond_with(envelope(json!({
            "page": 1,
            "limit": 10,
            "total": 1,
            "definitions": [{"workflowId": "wf", "version": 3, "tasks": []}],
            "data": [{"workflowId": "inst-1", "status": "COMPLETED"}]
        })))
        .mount(&server)
        .await;

    let page = backend(&server)
        .search_executions(&ExecutionSearchRequest::for_workflow("wf"))
        .await
        .unwrap();
    assert_eq!(page.executions.len(), 1);
    assert_eq!(page.definition("wf").map(|d| d.version), Some(3));
    assert!(!page.has_more());
}

// =============================================================================
// WORKFLOWS
// =============================================================================

#[tokio::test]
async fn test_get_workflow_passes_version() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/workflow/metadata/wf"))
        .and(query_param("version", "2"))
        .respond_with(envelope(json!({
            "workflowId": "wf",
            "version": 2,
            "isLatest": false,
            "tasks": [{"name": "a", "taskReferenceName": "a", "type": "SIMPLE", "retryCount": 1}]
        })))
        .mount(&server)
        .await;

    let workflow = backend(&server).get_workflow("wf", Some(2)).await.unwrap();
    assert!(!workflow.is_latest);
    assert_eq!(workflow.tasks[0].extra["retryCount"], json!(1));
}

#[tokio::test]
async fn test_save_workflow_puts_tasks() {
    let server = MockServer::start().await;
    let workflow = WorkflowVersion::new("wf", 4).with_tasks(vec![Task::simple("a")]);

    Mock::given(method("PUT"))
        .and(path("/api/workflow/metadata/wf"))
        .and(body_json(serde_json::to_value(&workflow).unwrap()))
        .respond_with(envelope(json!(true)))
        .expect(1)
        .mount(&server)
        .await;

    backend(&server).save_workflow(&workflow).await.unwrap();
}

#[tokio::test]
async fn test_list_tools() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/workflow/tools"))
        .respond_with(envelope(json!([
            {"name": "llm", "displayName": "LLM", "type": "SIMPLE",
             "output": [{"name": "text", "displayName": "Text", "type": "string"}]}
        ])))
        .mount(&server)
        .await;

    let tools = backend(&server).list_tools().await.unwrap();
    assert_eq!(tools[0].name, "llm");
    assert_eq!(tools[0].output[0].name, "text");
}

// =============================================================================
// ERRORS
// =============================================================================

#[tokio::test]
async fn test_error_status_maps_to_backend_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/workflow/executions/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;

    match backend(&server).get_execution("missing").await {
        Err(FlowError::Backend(message)) => {
            assert!(message.contains("404"), "unexpected message: {}", message);
            assert!(message.contains("not found"));
        }
        other => panic!("Expected Backend error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_body_maps_to_backend_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/workflow/executions/inst-1"))
        .respond_with(envelope(json!({"unexpected": true})))
        .mount(&server)
        .await;

    let result = backend(&server).get_execution("inst-1").await;
    assert!(matches!(result, Err(FlowError::Backend(_))));
}
