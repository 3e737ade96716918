use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bloodgas_flow::{
    AnalysisPipeline, AnalysisRequest, AutoSaver, Document, ErrorCode, FlowError, PipelineFailure,
    TracingProgressSink, WorkflowMachine, WorkflowPersistence, extraction::detect_container,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::{
    models::{
        InterpretRequest, NavigateRequest, RecoverableSession, SessionResponse,
        StartAnalysisRequest, StartedResponse,
    },
    sessions::{SessionHandle, SessionRegistry},
    workflow::{create_pipeline, create_snapshot_storage, load_config},
};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

type ApiResult<T> = Result<(StatusCode, Json<T>), ApiError>;

/// `{ "error": { "code", "message" } }` with a status derived from the code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    failure: PipelineFailure,
}

impl ApiError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        PipelineFailure::new(code, message).into()
    }

    fn not_found(session_id: &str) -> Self {
        FlowError::SessionNotFound(session_id.to_string()).into()
    }

    fn busy(session_id: &str) -> Self {
        Self::new(
            ErrorCode::InvalidTransition,
            format!("Session {session_id} is already processing"),
        )
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorCode::ValidationFailed => StatusCode::BAD_REQUEST,
        ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidTransition | ErrorCode::Cancelled => StatusCode::CONFLICT,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::ProviderUnavailable => StatusCode::BAD_GATEWAY,
        ErrorCode::ExtractionFailed | ErrorCode::InterpretationFailed => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorCode::StorageFailed | ErrorCode::ConfigInvalid => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<PipelineFailure> for ApiError {
    fn from(failure: PipelineFailure) -> Self {
        Self {
            status: status_for(failure.code),
            failure,
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(error: FlowError) -> Self {
        if matches!(error, FlowError::Storage(_)) {
            error!("Storage failure while serving request: {}", error);
        }
        PipelineFailure::from(error).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "code": self.failure.code,
                    "message": self.failure.message,
                }
            })),
        )
            .into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AnalysisPipeline>,
    pub persistence: Arc<WorkflowPersistence>,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(pipeline: AnalysisPipeline, persistence: Arc<WorkflowPersistence>) -> Self {
        Self {
            pipeline: Arc::new(pipeline.with_persistence(persistence.clone())),
            persistence,
            sessions: SessionRegistry::new(),
        }
    }
}

pub async fn create_app() -> anyhow::Result<Router> {
    let config = load_config().await?;
    let storage = create_snapshot_storage().await;
    let persistence = Arc::new(WorkflowPersistence::new(storage, config.persistence.clone()));
    match persistence.evict().await {
        Ok(evicted) => info!(evicted, "Startup snapshot eviction finished"),
        Err(e) => warn!("Startup snapshot eviction failed: {}", e),
    }
    let pipeline = create_pipeline(config)?;
    Ok(build_router(AppState::new(pipeline, persistence)))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/analyses", post(start_analysis))
        .route("/analyses/{session_id}", get(get_session_status))
        .route("/analyses/{session_id}/cancel", post(cancel_analysis))
        .route("/analyses/{session_id}/interpret", post(reinterpret))
        .route("/analyses/{session_id}/navigate", post(navigate))
        .route("/recoverable", get(list_recoverable))
        .route(
            "/recoverable/{session_id}",
            axum::routing::delete(discard_recoverable),
        )
        .route("/recoverable/{session_id}/resume", post(resume_recoverable))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Tag each request with a correlation id (the caller's, or a fresh one) and
/// echo it on the response.
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header = HeaderValue::from_str(&correlation_id).ok();
    if let Some(value) = &header {
        request.headers_mut().insert(CORRELATION_HEADER, value.clone());
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    let mut response = next.run(request).instrument(span).await;
    if let Some(value) = header {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Blood Gas Analysis Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Blood gas report reading, clinical interpretation and action plans",
        "endpoints": {
            "POST /analyses": "Upload a report and start an analysis",
            "GET /analyses/{session_id}": "Get the workflow state of a session",
            "POST /analyses/{session_id}/cancel": "Cancel the running analysis",
            "POST /analyses/{session_id}/interpret": "Re-interpret edited report text",
            "POST /analyses/{session_id}/navigate": "Move the session to another step",
            "GET /recoverable": "List interrupted sessions",
            "POST /recoverable/{session_id}/resume": "Resume an interrupted session",
            "DELETE /recoverable/{session_id}": "Discard an interrupted session",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn start_analysis(
    State(state): State<AppState>,
    Json(request): Json<StartAnalysisRequest>,
) -> ApiResult<StartedResponse> {
    let bytes = STANDARD
        .decode(request.document_base64.trim())
        .map_err(|_| ApiError::new(ErrorCode::ValidationFailed, "documentBase64 is not valid base64"))?;
    if bytes.is_empty() {
        return Err(ApiError::new(ErrorCode::ValidationFailed, "The uploaded file is empty."));
    }

    let mut document = Document::new(bytes, request.document_kind);
    if let Some(mime_type) = request.mime_type {
        document = document.with_mime_type(mime_type);
    }
    if let Some(file_name) = request.file_name {
        document = document.with_file_name(file_name);
    }
    detect_container(&document)?;

    let descriptor = document.descriptor();
    let machine = WorkflowMachine::new(state.pipeline.config().canonical_progress);
    let session_id = state.sessions.insert(SessionHandle {
        machine,
        descriptor: Some(descriptor),
    });
    info!(session_id = %session_id, kind = request.document_kind.as_str(), "Analysis requested");

    let mut analysis = AnalysisRequest::new(document);
    if let Some(context) = request.case_context {
        analysis = analysis.with_case_context(context);
    }
    start_run(&state, &session_id, Run::Analyze(analysis))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartedResponse::new(session_id, "started", "Analysis started")),
    ))
}

async fn get_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionResponse> {
    let handle = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| ApiError::not_found(&session_id))?;
    Ok((
        StatusCode::OK,
        Json(SessionResponse {
            running: state.sessions.is_running(&session_id),
            state: handle.machine.snapshot(),
            session_id,
        }),
    ))
}

async fn cancel_analysis(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StartedResponse> {
    if state.sessions.get(&session_id).is_none() {
        return Err(ApiError::not_found(&session_id));
    }
    if !state.sessions.cancel(&session_id) {
        return Err(ApiError::new(
            ErrorCode::InvalidTransition,
            "No analysis is running for this session",
        ));
    }
    info!(session_id = %session_id, "Cancellation requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(StartedResponse::new(session_id, "cancelling", "Cancellation requested")),
    ))
}

async fn reinterpret(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<InterpretRequest>,
) -> ApiResult<StartedResponse> {
    if state.sessions.get(&session_id).is_none() {
        return Err(ApiError::not_found(&session_id));
    }
    if request.text.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::ValidationFailed,
            "Extracted text is empty. Enter the report values before interpreting.",
        ));
    }
    start_run(
        &state,
        &session_id,
        Run::Reinterpret {
            text: request.text,
            case_context: request.case_context,
        },
    )?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartedResponse::new(session_id, "interpreting", "Interpretation restarted")),
    ))
}

async fn navigate(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<NavigateRequest>,
) -> ApiResult<SessionResponse> {
    let handle = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| ApiError::not_found(&session_id))?;
    if state.sessions.is_running(&session_id) {
        return Err(ApiError::busy(&session_id));
    }
    handle.machine.navigate_to(request.step, None)?;
    Ok((
        StatusCode::OK,
        Json(SessionResponse {
            running: false,
            state: handle.machine.snapshot(),
            session_id,
        }),
    ))
}

async fn list_recoverable(State(state): State<AppState>) -> ApiResult<Vec<RecoverableSession>> {
    let snapshots = state.persistence.list_recoverable().await?;
    Ok((
        StatusCode::OK,
        Json(snapshots.iter().map(RecoverableSession::from).collect()),
    ))
}

async fn resume_recoverable(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StartedResponse> {
    // Claim before loading so a rejected resume does not count as a recovery.
    let token = state
        .sessions
        .begin_run(&session_id)
        .ok_or_else(|| ApiError::busy(&session_id))?;
    let snapshot = match state.persistence.load(&session_id).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            state.sessions.end_run(&session_id);
            return Err(ApiError::not_found(&session_id));
        }
        Err(e) => {
            state.sessions.end_run(&session_id);
            return Err(e.into());
        }
    };
    info!(
        session_id = %session_id,
        recovery_count = snapshot.metadata.recovery_count,
        "Recovering session"
    );

    let machine = WorkflowMachine::from_state(
        snapshot.workflow,
        state.pipeline.config().canonical_progress,
    );
    state.sessions.insert(SessionHandle {
        machine,
        descriptor: snapshot.metadata.file_descriptor,
    });
    spawn_run(&state, &session_id, Run::Resume, token)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartedResponse::new(session_id, "resumed", "Recovered session resumed")),
    ))
}

async fn discard_recoverable(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.remove(&session_id);
    state.persistence.discard(&session_id).await?;
    info!(session_id = %session_id, "Recoverable session discarded");
    Ok(StatusCode::NO_CONTENT)
}

enum Run {
    Analyze(AnalysisRequest),
    Reinterpret {
        text: String,
        case_context: Option<String>,
    },
    Resume,
}

/// Claim the session and drive the pipeline in a background task. The
/// auto-saver follows the machine for the duration of the run.
fn start_run(state: &AppState, session_id: &str, run: Run) -> Result<(), ApiError> {
    if state.sessions.get(session_id).is_none() {
        return Err(ApiError::not_found(session_id));
    }
    let token = state
        .sessions
        .begin_run(session_id)
        .ok_or_else(|| ApiError::busy(session_id))?;
    spawn_run(state, session_id, run, token)
}

/// Drive an already claimed session. The claim is released when the run ends.
fn spawn_run(
    state: &AppState,
    session_id: &str,
    run: Run,
    token: CancellationToken,
) -> Result<(), ApiError> {
    let Some(handle) = state.sessions.get(session_id) else {
        state.sessions.end_run(session_id);
        return Err(ApiError::not_found(session_id));
    };

    let state = state.clone();
    let session_id = session_id.to_string();
    let span = tracing::info_span!("pipeline_run", session_id = %session_id);
    tokio::spawn(
        async move {
            let saver = AutoSaver::spawn(
                state.persistence.clone(),
                handle.machine.subscribe(),
                handle.descriptor.clone(),
            );
            let outcome = drive(&state.pipeline, &handle, &session_id, run, &token).await;
            saver.abort();
            state.sessions.end_run(&session_id);

            match outcome {
                Ok(workflow) => info!(step = ?workflow.current_step, "Pipeline run finished"),
                Err(failure) => warn!(code = failure.code.as_str(), "Pipeline run failed: {}", failure.message),
            }
        }
        .instrument(span),
    );
    Ok(())
}

async fn drive(
    pipeline: &AnalysisPipeline,
    handle: &SessionHandle,
    session_id: &str,
    run: Run,
    token: &CancellationToken,
) -> Result<bloodgas_flow::WorkflowState, PipelineFailure> {
    let sink = TracingProgressSink {
        session_id: session_id.to_string(),
    };
    match run {
        Run::Analyze(request) => pipeline.run(&handle.machine, request, &sink, token).await,
        Run::Reinterpret { text, case_context } => {
            pipeline
                .reinterpret(&handle.machine, &text, case_context, &sink, token)
                .await
        }
        Run::Resume => pipeline.resume(&handle.machine, &sink, token).await,
    }
}
