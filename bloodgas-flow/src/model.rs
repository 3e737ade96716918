use serde::{Deserialize, Serialize};

/// Declared report type. Used for labelling prompts and results only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    #[default]
    Arterial,
    Venous,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Arterial => "arterial",
            DocumentKind::Venous => "venous",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DocumentKind::Arterial => "arterial blood gas (ABG)",
            DocumentKind::Venous => "venous blood gas (VBG)",
        }
    }
}

/// An uploaded report, image or PDF.
#[derive(Debug, Clone)]
pub struct Document {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub kind: DocumentKind,
}

impl Document {
    pub fn new(bytes: Vec<u8>, kind: DocumentKind) -> Self {
        Self {
            bytes,
            mime_type: None,
            file_name: None,
            kind,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn descriptor(&self) -> FileDescriptor {
        FileDescriptor {
            name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
            size_bytes: self.bytes.len() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
}

/// One clinical problem identified by the interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "clinical_question", alias = "question")]
    pub clinical_question: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionMethod {
    FreeOcr,
    Vision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub method: ExtractionMethod,
    pub text: String,
    pub confidence: f32,
    pub quality_score: f32,
    pub escalated: bool,
    #[serde(default)]
    pub quality_issues: Vec<String>,
    pub document_kind: DocumentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretationResult {
    pub interpretation_text: String,
    #[serde(default)]
    pub issues: Vec<Issue>,
    pub document_kind: DocumentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPlanOutcome {
    pub issue: Issue,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processing_time_ms: u64,
}

impl ActionPlanOutcome {
    pub fn pending(issue: Issue) -> Self {
        Self {
            issue,
            status: PlanStatus::Pending,
            plan_text: None,
            error_message: None,
            processing_time_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PlanStatus::Success
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, PlanStatus::Success | PlanStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPlanResult {
    pub batch_id: String,
    pub outcomes: Vec<ActionPlanOutcome>,
    pub combined_plan: String,
    pub successful_plans: usize,
    pub failed_plans: usize,
    pub total_issues: usize,
    /// True when no issues were parsed and one whole-case plan was requested.
    pub comprehensive: bool,
}

impl ActionPlanResult {
    /// A batch whose requests have not started yet.
    pub fn pending(batch_id: impl Into<String>, issues: Vec<Issue>, comprehensive: bool) -> Self {
        let outcomes: Vec<ActionPlanOutcome> =
            issues.into_iter().map(ActionPlanOutcome::pending).collect();
        Self {
            batch_id: batch_id.into(),
            total_issues: outcomes.len(),
            outcomes,
            combined_plan: String::new(),
            successful_plans: 0,
            failed_plans: 0,
            comprehensive,
        }
    }

    /// True once every request has succeeded or failed.
    pub fn is_settled(&self) -> bool {
        self.outcomes.iter().all(ActionPlanOutcome::is_settled)
    }
}
