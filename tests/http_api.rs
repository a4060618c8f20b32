use agentbox::adapter::AdapterRegistry;
use agentbox::batch::BatchScheduler;
use agentbox::container::{ContainerDriver, MockContainerDriver};
use agentbox::eventbus::EventBus;
use agentbox::http::{build_router, AppState};
use agentbox::model::*;
use agentbox::session::SessionManager;
use agentbox::store::Store;
use agentbox::task::TaskScheduler;
use axum::http::StatusCode;
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

async fn test_state() -> (AppState, Uuid) {
    let store = Store::in_memory();
    let provider = Provider {
        id: Uuid::new_v4(),
        name: "anthropic".to_string(),
        category: "llm".to_string(),
        base_url: None,
        api_key: Some("sk-test".to_string()),
        is_configured: true,
        default_models: vec![],
        supported_adapters: vec![AdapterTag::ClaudeCode],
        is_builtin: true,
    };
    let runtime = Runtime {
        id: Uuid::new_v4(),
        image: "agentbox/workspace:latest".to_string(),
        cpu_cores: 1.0,
        memory_mb: 512,
        network_mode: "bridge".to_string(),
        default_command: None,
        is_default: true,
    };
    let agent = Agent {
        id: Uuid::new_v4(),
        adapter: AdapterTag::ClaudeCode,
        provider_id: provider.id,
        runtime_id: runtime.id,
        model: Some("sonnet".to_string()),
        base_url_override: None,
        skill_ids: Vec::new(),
        mcp_server_ids: Vec::new(),
        system_prompt: None,
        permission: PermissionConfig {
            full_auto: true,
            ..Default::default()
        },
        env: HashMap::new(),
        status: AgentStatus::Active,
    };
    store.providers.insert(provider).await.unwrap();
    store.runtimes.insert(runtime).await.unwrap();
    store.agents.insert(agent.clone()).await.unwrap();

    let driver: Arc<dyn ContainerDriver> = Arc::new(MockContainerDriver::new());
    let adapters = Arc::new(AdapterRegistry::with_defaults());
    let bus = EventBus::new();
    let workspace_root = std::env::temp_dir().join(format!("agentbox-http-test-{}", Uuid::new_v4()));
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        driver,
        adapters,
        bus.clone(),
        workspace_root,
    ));
    let tasks = TaskScheduler::new(store.clone(), Arc::clone(&sessions), bus.clone(), 4);
    let batches = BatchScheduler::new(store.clone(), Arc::clone(&sessions), bus.clone());

    (
        AppState {
            store,
            sessions,
            tasks,
            batches,
            bus,
        },
        agent.id,
    )
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post_json(app: axum::Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn create_session_then_exec() {
    let (state, agent_id) = test_state().await;
    let router = build_router(state);

    let (status, body) = post_json(
        router.clone(),
        "/api/sessions",
        serde_json::json!({ "agent_id": agent_id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    let session_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = post_json(
        router,
        &format!("/api/sessions/{session_id}/exec"),
        serde_json::json!({ "prompt": "hello" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["session_id"], session_id);
}

#[tokio::test]
async fn exec_against_unknown_session_is_404() {
    let (state, _agent_id) = test_state().await;
    let router = build_router(state);
    let (status, _body) = post_json(
        router,
        &format!("/api/sessions/{}/exec", Uuid::new_v4()),
        serde_json::json!({ "prompt": "hi" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_task_runs_to_completion() {
    let (state, agent_id) = test_state().await;
    let tasks = Arc::clone(&state.tasks);
    let router = build_router(state);

    let (status, body) = post_json(
        router,
        "/api/tasks",
        serde_json::json!({ "agent_id": agent_id, "prompt": "hello" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id: Uuid = body["data"]["id"].as_str().unwrap().parse().unwrap();

    for _ in 0..50 {
        let task = tasks.get(task_id).await.unwrap();
        if task.status.is_terminal() {
            assert_eq!(task.status, TaskStatus::Completed);
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("task did not complete in time");
}

#[tokio::test]
async fn create_batch_then_read_stats() {
    let (state, agent_id) = test_state().await;
    let batches = Arc::clone(&state.batches);
    let router = build_router(state);

    let (status, body) = post_json(
        router.clone(),
        "/api/batches",
        serde_json::json!({
            "agent_id": agent_id,
            "name": "greeting-batch",
            "prompt_template": "say {{x}}",
            "inputs": [{"x": "a"}, {"x": "b"}],
            "concurrency": 2,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let batch_id: Uuid = body["data"]["id"].as_str().unwrap().parse().unwrap();

    for _ in 0..100 {
        let batch = batches.get(batch_id).await.unwrap();
        if matches!(batch.status, BatchStatus::Completed | BatchStatus::Failed) {
            assert_eq!(batch.status, BatchStatus::Completed);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let (status, body) = get(router, &format!("/api/batches/{batch_id}/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["completed"], 2);
}

#[tokio::test]
async fn agent_crud_round_trips() {
    let (state, _agent_id) = test_state().await;
    let router = build_router(state);
    let (status, body) = get(router, "/api/agents").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().len() >= 1);
}
