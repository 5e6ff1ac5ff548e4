//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST /v1/chat`: Send a message, get the final answer
//! - `POST /v1/chat/stream`: Send a message, get the progress tree as SSE
//! - `POST /v1/actions/confirm`: Execute a parked operation
//! - `POST /v1/actions/{handle}/cancel`: Drop a parked operation
//! - `GET  /v1/operations`: Operations available to the caller
//! - `GET  /v1/conversations/{id}/turns`: Stored turns of a conversation
//! - `GET  /v1/flows/{request_id}`: Flow steps recorded for one request
//! - `GET  /v1/logic-versions`: Known logic versions
//! - `GET  /v1/events`: SSE stream of domain events (operations, confirmations, runs)

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use opsclaw_agent::{Assistant, AssistantRequest, AssistantResponse, PageContext, StreamItem};
use opsclaw_catalog::{DefinitionFilter, OperationSummary};
use opsclaw_core::error::Error;
use opsclaw_core::message::Message;
use opsclaw_core::operation::{Caller, ErrorCode, OperationOutcome};
use opsclaw_core::{FlowStepRecord, LogicVersion};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLES_HEADER: &str = "x-user-roles";
pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiState {
    pub assistant: Arc<Assistant>,
}

impl ApiState {
    pub fn shared(assistant: Arc<Assistant>) -> SharedApiState {
        Arc::new(Self { assistant })
    }
}

pub type SharedApiState = Arc<ApiState>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route("/actions/confirm", post(confirm_handler))
        .route("/actions/{handle}/cancel", post(cancel_handler))
        .route("/operations", get(list_operations_handler))
        .route("/conversations/{id}/turns", get(list_turns_handler))
        .route("/flows/{request_id}", get(get_flow_handler))
        .route("/logic-versions", get(list_logic_versions_handler))
        .route("/events", get(event_stream_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatRequest {
    /// Existing conversation ID (omit to start a new one).
    #[serde(default)]
    conversation_id: Option<String>,
    message: String,
    /// Response style: "technical", "casual", "brief", "verbose".
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    page: Option<PageContext>,
    #[serde(default)]
    bundle_key: Option<String>,
}

impl ChatRequest {
    fn into_request(self, caller: Caller) -> AssistantRequest {
        AssistantRequest {
            conversation_id: self.conversation_id,
            message: self.message,
            caller,
            mode: self.mode,
            page: self.page,
            bundle_key: self.bundle_key,
        }
    }
}

#[derive(Deserialize)]
struct ConfirmRequest {
    confirmation_id: String,
}

#[derive(Serialize, Deserialize)]
struct CancelResponse {
    confirmation_id: String,
    cancelled: bool,
}

#[derive(Serialize, Deserialize)]
struct OperationListResponse {
    operations: Vec<OperationSummary>,
    count: usize,
}

#[derive(Serialize, Deserialize)]
struct TurnListResponse {
    conversation_id: String,
    turns: Vec<Message>,
}

#[derive(Serialize, Deserialize)]
struct FlowResponse {
    request_id: String,
    steps: Vec<FlowStepRecord>,
}

#[derive(Serialize, Deserialize)]
struct LogicVersionListResponse {
    active: Option<String>,
    versions: Vec<LogicVersion>,
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: message.into() }))
}

fn internal_error(error: &Error) -> ApiError {
    let status = match error {
        Error::Provider(_) => StatusCode::BAD_GATEWAY,
        Error::Config { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, error.to_string())
}

/// Caller identity from `x-user-id` and comma-separated `x-user-roles`.
pub fn caller_from_headers(headers: &HeaderMap) -> Caller {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let roles: Vec<String> = header(USER_ROLES_HEADER)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    match header(USER_ID_HEADER) {
        Some(user_id) => Caller::user(user_id).with_roles(roles),
        None => Caller::anonymous().with_roles(roles),
    }
}

// ── Chat ──────────────────────────────────────────────────────────────────

/// `POST /v1/chat`: run one request to completion.
async fn chat_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<AssistantResponse>, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message must not be empty"));
    }
    let request = payload.into_request(caller_from_headers(&headers));
    info!(conversation_id = ?request.conversation_id, "v1/chat request");

    state.assistant.handle(request).await.map(Json).map_err(|e| {
        warn!(error = %e, "Chat request failed");
        internal_error(&e)
    })
}

/// `POST /v1/chat/stream`: run one request and stream its progress tree.
///
/// Each progress event becomes one SSE event named after its kind
/// (`start`, `update`, `done`, `error`, `chunk`, `done-final`). Idle
/// periods are filled with `: keepalive` comments.
async fn chat_stream_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message must not be empty"));
    }
    let request = payload.into_request(caller_from_headers(&headers));

    let (conversation_id, receiver) = state.assistant.stream(request);
    info!(conversation_id = %conversation_id, "v1/chat/stream SSE request");

    let stream = receiver.into_stream().map(|item| {
        let event = match item {
            StreamItem::Event(event) => {
                let data = serde_json::to_string(&event).unwrap_or_default();
                SseEvent::default().event(event.event_type()).data(data)
            }
            StreamItem::KeepAlive => SseEvent::default().comment("keepalive"),
        };
        Ok::<_, Infallible>(event)
    });

    let mut response = Sse::new(stream).into_response();
    if let Ok(value) = HeaderValue::from_str(&conversation_id) {
        response.headers_mut().insert(CONVERSATION_ID_HEADER, value);
    }
    Ok(response)
}

// ── Confirmations ─────────────────────────────────────────────────────────

fn outcome_status(outcome: &OperationOutcome) -> StatusCode {
    match outcome.error_code {
        None => StatusCode::OK,
        Some(ErrorCode::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorCode::PermissionDenied) => StatusCode::FORBIDDEN,
        Some(ErrorCode::ExecutionError) => StatusCode::INTERNAL_SERVER_ERROR,
        Some(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// `POST /v1/actions/confirm`: execute a parked operation exactly once.
async fn confirm_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    Json(payload): Json<ConfirmRequest>,
) -> (StatusCode, Json<OperationOutcome>) {
    let caller = caller_from_headers(&headers);
    let outcome = state.assistant.confirm(&payload.confirmation_id, &caller).await;
    (outcome_status(&outcome), Json(outcome))
}

/// `POST /v1/actions/{handle}/cancel`
async fn cancel_handler(
    State(state): State<SharedApiState>,
    Path(handle): Path<String>,
) -> (StatusCode, Json<CancelResponse>) {
    let cancelled = state.assistant.cancel(&handle);
    let status = if cancelled { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (
        status,
        Json(CancelResponse {
            confirmation_id: handle,
            cancelled,
        }),
    )
}

// ── Catalog and audit queries ─────────────────────────────────────────────

async fn list_operations_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
) -> Json<OperationListResponse> {
    let caller = caller_from_headers(&headers);
    let operations = state
        .assistant
        .catalog()
        .summaries_for(&caller.roles, &DefinitionFilter::default());
    Json(OperationListResponse {
        count: operations.len(),
        operations,
    })
}

async fn list_turns_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<TurnListResponse>, ApiError> {
    let turns = state
        .assistant
        .store()
        .list_turns(&id)
        .await
        .map_err(|e| internal_error(&Error::from(e)))?;
    Ok(Json(TurnListResponse {
        conversation_id: id,
        turns,
    }))
}

async fn get_flow_handler(
    State(state): State<SharedApiState>,
    Path(request_id): Path<String>,
) -> Result<Json<FlowResponse>, ApiError> {
    let steps = state
        .assistant
        .store()
        .list_flow_steps(&request_id)
        .await
        .map_err(|e| internal_error(&Error::from(e)))?;
    if steps.is_empty() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No flow recorded for request '{request_id}'"),
        ));
    }
    Ok(Json(FlowResponse { request_id, steps }))
}

async fn list_logic_versions_handler(
    State(state): State<SharedApiState>,
) -> Result<Json<LogicVersionListResponse>, ApiError> {
    let versions = state
        .assistant
        .versions()
        .list()
        .await
        .map_err(|e| internal_error(&Error::from(e)))?;
    let active = versions.iter().find(|v| v.is_active).map(|v| v.version.clone());
    Ok(Json(LogicVersionListResponse { active, versions }))
}

// ── Domain event stream ───────────────────────────────────────────────────

/// `GET /v1/events`: SSE stream of domain events, one SSE event per
/// [`DomainEvent`](opsclaw_core::event::DomainEvent) named by its type.
async fn event_stream_handler(
    State(state): State<SharedApiState>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let bus = state
        .assistant
        .event_bus()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "Event bus is not enabled"))?;

    let stream = BroadcastStream::new(bus.subscribe())
        .filter_map(|result| match result {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "Event subscriber lagged");
                None
            }
        })
        .map(|event| {
            let data = serde_json::to_string(event.as_ref()).unwrap_or_default();
            Ok::<_, Infallible>(SseEvent::default().event(event.event_type()).data(data))
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use opsclaw_agent::{AssistantSettings, ReferenceLibrary};
    use opsclaw_catalog::{InvokeOptions, OperationCatalog, OperationDefinition, builtin};
    use opsclaw_core::event::EventBus;
    use opsclaw_core::operation::{OperationKind, OperationOutput, executor_fn};
    use opsclaw_core::provider::ProviderResponse;
    use opsclaw_providers::MockProvider;
    use opsclaw_store::InMemoryStore;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn test_api_state(responses: Vec<ProviderResponse>, deletes: Arc<AtomicUsize>) -> SharedApiState {
        let bus = Arc::new(EventBus::default());
        let catalog = OperationCatalog::new().with_event_bus(bus.clone());
        builtin::register_defaults(&catalog).unwrap();
        catalog
            .register(
                OperationDefinition::new(
                    "delete_host",
                    OperationKind::Delete,
                    executor_fn(move |_, _| {
                        let deletes = deletes.clone();
                        async move {
                            deletes.fetch_add(1, Ordering::SeqCst);
                            Ok(OperationOutput::message("Host deleted"))
                        }
                    }),
                )
                .with_description("Delete a host")
                .with_confirmation()
                .with_roles(["admin"]),
            )
            .unwrap();

        ApiState::shared(Arc::new(Assistant::new(
            Arc::new(MockProvider::scripted(responses)),
            Arc::new(catalog),
            Arc::new(InMemoryStore::new()),
            Arc::new(ReferenceLibrary::with_defaults()),
            AssistantSettings::default(),
        )
        .with_event_bus(bus)))
    }

    fn plain_state() -> SharedApiState {
        test_api_state(Vec::new(), Arc::new(AtomicUsize::new(0)))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header(USER_ID_HEADER, "alice")
            .header(USER_ROLES_HEADER, "admin, ops")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn caller_is_read_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("alice"));
        headers.insert(USER_ROLES_HEADER, HeaderValue::from_static("admin, ,ops"));
        let caller = caller_from_headers(&headers);
        assert_eq!(caller.user_id.as_deref(), Some("alice"));
        assert_eq!(caller.roles, vec!["admin", "ops"]);

        let anonymous = caller_from_headers(&HeaderMap::new());
        assert!(anonymous.user_id.is_none());
        assert!(anonymous.roles.is_empty());
    }

    #[tokio::test]
    async fn chat_returns_answer() {
        let app = v1_router(plain_state());

        let response = app
            .oneshot(post_json("/chat", json!({"message": "hello", "conversation_id": "c1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["conversation_id"], "c1");
        assert_eq!(json["content"], "I'm a mock assistant. How can I help?");
        assert_eq!(json["status"], "completed");
    }

    #[tokio::test]
    async fn chat_rejects_empty_message() {
        let app = v1_router(plain_state());

        let response = app.oneshot(post_json("/chat", json!({"message": "  "}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_stream_emits_sse_until_done_final() {
        let app = v1_router(plain_state());

        let response = app
            .oneshot(post_json("/chat/stream", json!({"message": "hello", "conversation_id": "s1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONVERSATION_ID_HEADER], "s1");
        assert!(
            response.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let start = text.find("event: start").unwrap();
        let chunk = text.find("event: chunk").unwrap();
        let last = text.find("event: done-final").unwrap();
        assert!(start < chunk && chunk < last);
        assert!(text.contains("\"conversationId\":\"s1\""));
    }

    #[tokio::test]
    async fn confirm_executes_once_then_reports_not_found() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let state = test_api_state(
            vec![
                MockProvider::tool_call("call_1", "delete_host", json!({})),
                MockProvider::text("Confirm to delete the host."),
            ],
            deletes.clone(),
        );

        let response = v1_router(state.clone())
            .oneshot(post_json("/chat", json!({"message": "delete host"})))
            .await
            .unwrap();
        let json = json_body(response).await;
        let handle = json["pending_confirmations"][0]["confirmation_id"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(deletes.load(Ordering::SeqCst), 0);

        let response = v1_router(state.clone())
            .oneshot(post_json("/actions/confirm", json!({"confirmation_id": handle})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["message"], "Host deleted");
        assert_eq!(deletes.load(Ordering::SeqCst), 1);

        let response = v1_router(state)
            .oneshot(post_json("/actions/confirm", json!({"confirmation_id": handle})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_unknown_handle_is_not_found() {
        let app = v1_router(plain_state());

        let response = app
            .oneshot(post_json("/actions/nope/cancel", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["cancelled"], false);
    }

    #[tokio::test]
    async fn operations_are_filtered_by_role() {
        let state = plain_state();

        let req = Request::builder().uri("/operations").body(Body::empty()).unwrap();
        let response = v1_router(state.clone()).oneshot(req).await.unwrap();
        let list: OperationListResponse = serde_json::from_slice(
            &response.into_body().collect().await.unwrap().to_bytes(),
        )
        .unwrap();
        assert!(list.operations.iter().any(|o| o.name == "ping"));
        assert!(!list.operations.iter().any(|o| o.name == "delete_host"));

        let req = Request::builder()
            .uri("/operations")
            .header(USER_ROLES_HEADER, "admin")
            .body(Body::empty())
            .unwrap();
        let response = v1_router(state).oneshot(req).await.unwrap();
        let list: OperationListResponse = serde_json::from_slice(
            &response.into_body().collect().await.unwrap().to_bytes(),
        )
        .unwrap();
        assert_eq!(list.count, 3);
        assert!(list.operations.iter().any(|o| o.name == "delete_host" && o.requires_confirmation));
    }

    #[tokio::test]
    async fn turns_flows_and_versions_are_queryable() {
        let state = plain_state();

        let response = v1_router(state.clone())
            .oneshot(post_json("/chat", json!({"message": "hello", "conversation_id": "c9"})))
            .await
            .unwrap();
        let chat = json_body(response).await;
        let request_id = chat["request_id"].as_str().unwrap().to_string();

        let req = Request::builder().uri("/conversations/c9/turns").body(Body::empty()).unwrap();
        let turns = json_body(v1_router(state.clone()).oneshot(req).await.unwrap()).await;
        assert_eq!(turns["turns"].as_array().unwrap().len(), 2);
        assert_eq!(turns["turns"][0]["role"], "user");

        let req = Request::builder()
            .uri(format!("/flows/{request_id}"))
            .body(Body::empty())
            .unwrap();
        let response = v1_router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let flow = json_body(response).await;
        assert_eq!(flow["steps"][0]["step_type"], "flow_start");

        let req = Request::builder().uri("/flows/unknown").body(Body::empty()).unwrap();
        let response = v1_router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let req = Request::builder().uri("/logic-versions").body(Body::empty()).unwrap();
        let versions = json_body(v1_router(state).oneshot(req).await.unwrap()).await;
        assert_eq!(versions["active"], "v1.0.0");
    }

    #[tokio::test]
    async fn events_stream_domain_events() {
        let state = plain_state();

        let req = Request::builder().uri("/events").body(Body::empty()).unwrap();
        let response = v1_router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();

        state
            .assistant
            .catalog()
            .invoke("ping", json!({}), &Caller::anonymous(), InvokeOptions::default())
            .await;

        let frame = body.frame().await.unwrap().unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.contains("event: operation_invoked"));
        assert!(text.contains("\"operation\":\"ping\""));
    }

    #[tokio::test]
    async fn events_unavailable_without_bus() {
        let state = ApiState::shared(Arc::new(Assistant::new(
            Arc::new(MockProvider::new()),
            Arc::new(OperationCatalog::new()),
            Arc::new(InMemoryStore::new()),
            Arc::new(ReferenceLibrary::with_defaults()),
            AssistantSettings::default(),
        )));

        let req = Request::builder().uri("/events").body(Body::empty()).unwrap();
        let response = v1_router(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
