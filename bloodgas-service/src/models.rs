use bloodgas_flow::{DocumentKind, PersistedSnapshot, WorkflowState, WorkflowStep};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAnalysisRequest {
    pub document_base64: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    #[serde(default)]
    pub document_kind: DocumentKind,
    pub case_context: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretRequest {
    pub text: String,
    pub case_context: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateRequest {
    pub step: WorkflowStep,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedResponse {
    pub session_id: String,
    pub status: String,
    pub message: String,
}

impl StartedResponse {
    pub fn new(session_id: impl Into<String>, status: &str, message: &str) -> Self {
        Self {
            session_id: session_id.into(),
            status: status.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_id: String,
    /// True while a pipeline run is in flight for this session.
    pub running: bool,
    pub state: WorkflowState,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverableSession {
    pub session_id: String,
    pub saved_at: i64,
    pub current_step: WorkflowStep,
    pub progress: u8,
    pub recovery_count: u32,
    pub file_name: Option<String>,
}

impl From<&PersistedSnapshot> for RecoverableSession {
    fn from(snapshot: &PersistedSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id.clone(),
            saved_at: snapshot.timestamp,
            current_step: snapshot.workflow.current_step,
            progress: snapshot.workflow.progress,
            recovery_count: snapshot.metadata.recovery_count,
            file_name: snapshot
                .metadata
                .file_descriptor
                .as_ref()
                .and_then(|d| d.name.clone()),
        }
    }
}
