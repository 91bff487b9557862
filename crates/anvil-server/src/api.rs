//! REST API for templates, hardware, workflows and workers

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use anvil_crd::{
    ActionStatusReport, DataMetadata, DataUpload, Hardware, HardwareTarget, Template,
    WorkflowAction, WorkflowContext, WorkflowData,
};
use anvil_workflow::WorkflowDetails;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/templates", get(list_templates).post(put_template))
        .route("/templates/{name}", get(get_template).delete(delete_template))
        .route("/hardware", get(list_hardware).post(put_hardware))
        .route("/hardware/{name}", get(get_hardware).delete(delete_hardware))
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route("/workflows/{id}", get(get_workflow).delete(delete_workflow))
        .route("/workflows/{id}/actions", get(get_workflow_actions))
        .route("/workflows/{id}/context", get(get_workflow_context))
        .route("/workflows/{id}/events", get(get_workflow_events))
        .route("/workflows/{id}/report", post(report_action_status))
        .route(
            "/workflows/{id}/data",
            get(get_workflow_data).put(update_workflow_data),
        )
        .route("/workflows/{id}/data/metadata", get(get_workflow_metadata))
        .route("/workflows/{id}/data/version", get(get_workflow_data_version))
        .route("/workers/{worker_id}/contexts", get(get_workflow_contexts))
        .route("/workers/{worker_id}/contexts/stream", get(stream_workflow_contexts))
}

// === Templates ===

async fn put_template(
    State(state): State<AppState>,
    Json(template): Json<Template>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    let stored = state.orchestrator.put_template(template).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Template>> {
    Ok(Json(state.orchestrator.get_template(&name).await?))
}

async fn list_templates(State(state): State<AppState>) -> ApiResult<Json<Vec<Template>>> {
    Ok(Json(state.orchestrator.list_templates().await?))
}

async fn delete_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_template(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Hardware ===

async fn put_hardware(
    State(state): State<AppState>,
    Json(hardware): Json<Hardware>,
) -> ApiResult<(StatusCode, Json<Hardware>)> {
    let stored = state.orchestrator.put_hardware(hardware).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_hardware(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Hardware>> {
    Ok(Json(state.orchestrator.get_hardware(&name).await?))
}

async fn list_hardware(State(state): State<AppState>) -> ApiResult<Json<Vec<Hardware>>> {
    Ok(Json(state.orchestrator.list_hardware().await?))
}

async fn delete_hardware(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_hardware(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Workflows ===

/// Body of `POST /workflows`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowRequest {
    pub template_ref: String,
    pub hardware: HardwareTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowResponse {
    pub workflow_id: String,
}

async fn create_workflow(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<CreateWorkflowResponse>)> {
    let workflow_id = state
        .orchestrator
        .create_workflow(&request.template_ref, request.hardware)
        .await?;
    Ok((StatusCode::CREATED, Json(CreateWorkflowResponse { workflow_id })))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowDetails>> {
    Ok(Json(state.orchestrator.get_workflow(&id).await?))
}

async fn list_workflows(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkflowDetails>>> {
    Ok(Json(state.orchestrator.list_workflows().await?))
}

async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_workflow(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_workflow_actions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<WorkflowAction>>> {
    Ok(Json(state.orchestrator.get_workflow_actions(&id).await?))
}

async fn get_workflow_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowContext>> {
    Ok(Json(state.orchestrator.get_workflow_context(&id).await?))
}

async fn get_workflow_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ActionStatusReport>>> {
    Ok(Json(state.orchestrator.get_workflow_events(&id).await?))
}

async fn report_action_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut report): Json<ActionStatusReport>,
) -> ApiResult<Json<WorkflowContext>> {
    if report.workflow_id.is_empty() {
        report.workflow_id = id;
    } else if report.workflow_id != id {
        return Err(ApiError::invalid(format!(
            "report for workflow {} posted to workflow {}",
            report.workflow_id, id
        )));
    }
    Ok(Json(state.orchestrator.report_action_status(report).await?))
}

// === Data ===

#[derive(Debug, Default, Deserialize)]
struct VersionQuery {
    #[serde(default)]
    version: u32,
}

#[derive(Debug, Serialize)]
struct DataVersion {
    version: u32,
}

async fn get_workflow_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<Json<WorkflowData>> {
    Ok(Json(
        state
            .orchestrator
            .get_workflow_data(&id, query.version)
            .await?,
    ))
}

async fn update_workflow_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(upload): Json<DataUpload>,
) -> ApiResult<Json<DataMetadata>> {
    let metadata = upload.metadata.into_value()?;
    Ok(Json(
        state
            .orchestrator
            .update_workflow_data(&id, metadata, upload.data)
            .await?,
    ))
}

async fn get_workflow_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<Json<DataMetadata>> {
    Ok(Json(
        state
            .orchestrator
            .get_workflow_metadata(&id, query.version)
            .await?,
    ))
}

async fn get_workflow_data_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DataVersion>> {
    let version = state.orchestrator.get_workflow_data_version(&id).await?;
    Ok(Json(DataVersion { version }))
}

// === Workers ===

async fn get_workflow_contexts(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<Vec<WorkflowContext>>> {
    Ok(Json(
        state.orchestrator.get_workflow_contexts(&worker_id).await?,
    ))
}

/// Server-sent events carrying every context change for a worker
///
/// The watch stops when the client disconnects or the server shuts down.
async fn stream_workflow_contexts(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let contexts = state
        .orchestrator
        .watch_contexts(&worker_id, state.shutdown.child_token())?;
    debug!(worker = %worker_id, "Context stream opened");

    let events = contexts.map(|context| Event::default().event("context").json_data(context));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_workflow::{MemoryStore, Orchestrator};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    const TEMPLATE: &str = r#"
version: "0.1"
name: install
tasks:
  - name: provision
    worker: "{{.device_1}}"
    actions:
      - name: wipe
        image: alpine
      - name: stream
        image: alpine
"#;

    fn router() -> Router {
        let state = AppState::new(
            Arc::new(Orchestrator::new(Arc::new(MemoryStore::new()))),
            CancellationToken::new(),
        );
        crate::router(state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("Content-Type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create(app: &Router) -> String {
        let (status, _) = call(
            app,
            "POST",
            "/api/v1/templates",
            Some(json!({
                "apiVersion": "anvil.metal/v1",
                "kind": "Template",
                "metadata": {"name": "install"},
                "spec": {"data": TEMPLATE}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(
            app,
            "POST",
            "/api/v1/workflows",
            Some(json!({"templateRef": "install", "hardware": {"device_1": "W1"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["workflowId"].as_str().unwrap().to_string()
    }

    fn report(id: &str, action: &str, state: &str) -> Value {
        json!({
            "workflowId": id,
            "taskName": "provision",
            "actionName": action,
            "workerId": "W1",
            "actionState": state,
        })
    }

    #[tokio::test]
    async fn test_report_protocol_over_http() {
        let app = router();
        let id = create(&app).await;
        let uri = format!("/api/v1/workflows/{}/report", id);

        for (action, state) in [
            ("wipe", "STATE_RUNNING"),
            ("wipe", "STATE_SUCCESS"),
            ("stream", "STATE_RUNNING"),
            ("stream", "STATE_SUCCESS"),
        ] {
            let (status, body) = call(&app, "POST", &uri, Some(report(&id, action, state))).await;
            assert_eq!(status, StatusCode::OK, "{}", body);
        }

        let (status, body) = call(&app, "GET", &format!("/api/v1/workflows/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["context"]["currentActionIndex"], 1);
        assert_eq!(body["context"]["currentActionState"], "STATE_SUCCESS");
        assert_eq!(body["progressPercent"], 100);

        let (_, events) = call(&app, "GET", &format!("/api/v1/workflows/{}/events", id), None).await;
        assert_eq!(events.as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_rejections_carry_codes() {
        let app = router();
        let id = create(&app).await;
        let uri = format!("/api/v1/workflows/{}/report", id);

        let (status, body) = call(&app, "POST", &uri, Some(report(&id, "stream", "STATE_RUNNING"))).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(body["code"], "FAILED_PRECONDITION");

        let (status, body) = call(
            &app,
            "POST",
            &uri,
            Some(report("another", "wipe", "STATE_RUNNING")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_ARGUMENT");

        let (status, body) = call(&app, "GET", "/api/v1/workflows/missing/context", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_worker_contexts_and_actions() {
        let app = router();
        let id = create(&app).await;

        let (status, contexts) = call(&app, "GET", "/api/v1/workers/W1/contexts", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(contexts[0]["workflowId"], id.as_str());
        assert_eq!(contexts[0]["currentActionState"], "STATE_PENDING");

        let (_, others) = call(&app, "GET", "/api/v1/workers/W2/contexts", None).await;
        assert!(others.as_array().unwrap().is_empty());

        let (_, actions) = call(&app, "GET", &format!("/api/v1/workflows/{}/actions", id), None).await;
        assert_eq!(actions[1]["name"], "stream");
        assert_eq!(actions[1]["workerId"], "W1");
    }

    #[tokio::test]
    async fn test_data_endpoints() {
        let app = router();
        let id = create(&app).await;
        let base = format!("/api/v1/workflows/{}/data", id);

        // Metadata double-encoded as a string
        let (status, meta) = call(
            &app,
            "PUT",
            &base,
            Some(json!({"metadata": "{\"disk\": \"sda\"}", "data": "aGVsbG8="})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(meta["version"], 1);
        assert_eq!(meta["sizeBytes"], 5);

        let (_, data) = call(&app, "GET", &format!("{}?version=1", base), None).await;
        assert_eq!(data["data"], "aGVsbG8=");
        assert_eq!(data["metadata"]["disk"], "sda");

        let (_, version) = call(&app, "GET", &format!("{}/version", base), None).await;
        assert_eq!(version["version"], 1);

        let (status, _) = call(&app, "GET", &format!("{}/metadata?version=7", base), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_registry_crud() {
        let app = router();
        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/hardware",
            Some(json!({
                "apiVersion": "anvil.metal/v1",
                "kind": "Hardware",
                "metadata": {"name": "node1"},
                "spec": {"interfaces": [{"dhcp": {"mac": "00:11:22:33:44:55"}}]}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, listed) = call(&app, "GET", "/api/v1/hardware", None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "DELETE", "/api/v1/hardware/node1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", "/api/v1/hardware/node1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/templates",
            Some(json!({
                "apiVersion": "anvil.metal/v1",
                "kind": "Template",
                "metadata": {"name": "bad"},
                "spec": {"data": "name: x\ntasks: []\n"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_delete_workflow() {
        let app = router();
        let id = create(&app).await;
        let uri = format!("/api/v1/workflows/{}", id);

        let (status, _) = call(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, listed) = call(&app, "GET", "/api/v1/workflows", None).await;
        assert!(listed.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_context_stream() {
        let app = router();
        let id = create(&app).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/workers/W1/contexts/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body();
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.starts_with("event: context"));
        assert!(text.contains(&id));
    }
}
