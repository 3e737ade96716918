//! The analysis pipeline: extraction, quality gate, vision fallback,
//! interpretation, issue parsing and action-plan fan-out, driving a
//! [`WorkflowMachine`] and checkpointing it after every phase transition.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{ErrorCode, FlowError, PipelineFailure, Result};
use crate::extraction::{QualityValidator, TextExtractor, detect_container};
use crate::fanout::ActionPlanFanOut;
use crate::model::{
    ActionPlanResult, AnalysisResult, Document, DocumentKind, ExtractionMethod, FileDescriptor,
    Issue,
};
use crate::progress::{PipelinePhase, ProgressAggregator, ProgressSink};
use crate::providers::{
    ActionPlanProvider, InterpretationClient, InterpretationProvider, ProviderError,
    VisionProvider,
};
use crate::recovery::WorkflowPersistence;
use crate::workflow::{ProcessingStatus, WorkflowMachine, WorkflowState, WorkflowStep};

/// An uploaded report plus optional free-text clinical context.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub document: Document,
    pub case_context: Option<String>,
}

impl AnalysisRequest {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            case_context: None,
        }
    }

    pub fn with_case_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.case_context = (!context.trim().is_empty()).then_some(context);
        self
    }
}

/// Feeds phase sub-progress to the aggregator, the machine and the sink.
struct ProgressReporter<'a> {
    sink: &'a dyn ProgressSink,
    aggregator: ProgressAggregator,
    machine: &'a WorkflowMachine,
}

impl<'a> ProgressReporter<'a> {
    fn new(config: &PipelineConfig, machine: &'a WorkflowMachine, sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            aggregator: ProgressAggregator::new(config.phase_weights),
            machine,
        }
    }

    fn report(&self, phase: PipelinePhase, stage: &str, sub_progress: u8) {
        let overall = self.aggregator.advance(phase, sub_progress);
        self.machine.update_progress(overall);
        self.sink.on_progress(phase, stage, overall);
    }

    fn current(&self) -> u8 {
        self.aggregator.current()
    }
}

pub struct AnalysisPipeline {
    config: PipelineConfig,
    extractor: Arc<dyn TextExtractor>,
    validator: QualityValidator,
    vision: Arc<dyn VisionProvider>,
    interpretation: InterpretationClient,
    fanout: ActionPlanFanOut,
    persistence: Option<Arc<WorkflowPersistence>>,
}

impl AnalysisPipeline {
    pub fn new(
        config: PipelineConfig,
        extractor: Arc<dyn TextExtractor>,
        vision: Arc<dyn VisionProvider>,
        interpreter: Arc<dyn InterpretationProvider>,
        planner: Arc<dyn ActionPlanProvider>,
    ) -> Self {
        Self {
            validator: QualityValidator::new(config.quality.clone()),
            interpretation: InterpretationClient::new(interpreter, config.interpretation_timeout),
            fanout: ActionPlanFanOut::new(planner, config.action_plan_timeout),
            extractor,
            vision,
            persistence: None,
            config,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<WorkflowPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn persistence(&self) -> Option<&Arc<WorkflowPersistence>> {
        self.persistence.as_ref()
    }

    /// Run the whole pipeline for a freshly uploaded document.
    pub async fn run(
        &self,
        machine: &WorkflowMachine,
        request: AnalysisRequest,
        sink: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> std::result::Result<WorkflowState, PipelineFailure> {
        let descriptor = request.document.descriptor();
        let reporter = ProgressReporter::new(&self.config, machine, sink);
        info!(
            session_id = %machine.session_id(),
            kind = request.document.kind.as_str(),
            bytes = descriptor.size_bytes,
            "Starting blood gas analysis"
        );

        let outcome = async {
            let analysis = self
                .extraction_phase(machine, &request.document, &descriptor, &reporter, token)
                .await?;
            self.downstream(
                machine,
                &analysis.text,
                analysis.document_kind,
                request.case_context,
                &reporter,
                token,
            )
            .await
        }
        .await;

        self.finish(machine, outcome, Some(&descriptor)).await
    }

    /// Re-run interpretation and action plans on user-edited text.
    ///
    /// Empty text is rejected before any provider is called.
    pub async fn reinterpret(
        &self,
        machine: &WorkflowMachine,
        text: &str,
        case_context: Option<String>,
        sink: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> std::result::Result<WorkflowState, PipelineFailure> {
        if text.trim().is_empty() {
            return Err(PipelineFailure::from(FlowError::Validation(
                "Extracted text is empty. Enter the report values before interpreting.".to_string(),
            )));
        }

        let state = machine.snapshot();
        let kind = state
            .analysis_result
            .as_ref()
            .map(|a| a.document_kind)
            .or_else(|| state.interpretation_result.as_ref().map(|i| i.document_kind))
            .unwrap_or_default();
        let reporter = ProgressReporter::new(&self.config, machine, sink);
        info!(session_id = %state.session_id, "Re-interpreting edited text");

        let outcome = async {
            unlock_interpretation(machine, &reporter)?;
            self.downstream(machine, text, kind, case_context, &reporter, token)
                .await
        }
        .await;
        self.finish(machine, outcome, None).await
    }

    /// Continue a recovered session from its first missing payload.
    pub async fn resume(
        &self,
        machine: &WorkflowMachine,
        sink: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> std::result::Result<WorkflowState, PipelineFailure> {
        let state = machine.snapshot();
        let reporter = ProgressReporter::new(&self.config, machine, sink);
        info!(
            session_id = %state.session_id,
            step = ?state.current_step,
            "Resuming recovered session"
        );

        let outcome = match (state.analysis_result.clone(), state.interpretation_result.clone()) {
            (None, _) => Err(FlowError::Validation(
                "The original document is not kept between sessions. Please upload it again."
                    .to_string(),
            )),
            (Some(analysis), None) => {
                let downstream = async {
                    unlock_interpretation(machine, &reporter)?;
                    self.downstream(
                        machine,
                        &analysis.text,
                        analysis.document_kind,
                        None,
                        &reporter,
                        token,
                    )
                    .await
                };
                downstream.await
            }
            (Some(_), Some(interpretation)) => {
                reporter.report(PipelinePhase::Interpretation, "Interpretation restored", 100);
                if state.current_step <= WorkflowStep::Interpretation {
                    machine.set_can_proceed(true);
                }
                self.plan_phase(
                    machine,
                    &interpretation.issues,
                    &interpretation.interpretation_text,
                    interpretation.document_kind,
                    &reporter,
                    token,
                )
                .await
            }
        };
        self.finish(machine, outcome, None).await
    }

    async fn extraction_phase(
        &self,
        machine: &WorkflowMachine,
        document: &Document,
        descriptor: &FileDescriptor,
        reporter: &ProgressReporter<'_>,
        token: &CancellationToken,
    ) -> Result<AnalysisResult> {
        machine.set_status(ProcessingStatus::Uploading);
        if document.bytes.is_empty() {
            return Err(FlowError::Validation("The uploaded file is empty.".to_string()));
        }
        detect_container(document)?;
        machine.set_can_proceed(true);

        machine.navigate_to(WorkflowStep::Analysis, Some(reporter.current()))?;
        machine.set_status(ProcessingStatus::Analyzing);
        self.checkpoint(machine, Some(descriptor)).await;

        reporter.report(PipelinePhase::Extraction, "Reading the report", 10);
        let free = self.extractor.extract(document).await?;
        ensure_active(token)?;

        let quality = free
            .success
            .then(|| self.validator.evaluate(&free.text));
        let escalate = quality.as_ref().is_none_or(|q| q.should_escalate);
        let mut quality_issues = quality
            .as_ref()
            .map(|q| q.issues.clone())
            .unwrap_or_else(|| free.error_message.clone().into_iter().collect());

        let result = if !escalate {
            let quality_score = quality.as_ref().map(|q| q.quality_score).unwrap_or(0.0);
            info!(quality_score, "Free text extraction accepted");
            AnalysisResult {
                method: ExtractionMethod::FreeOcr,
                text: free.text,
                confidence: free.confidence,
                quality_score,
                escalated: false,
                quality_issues,
                document_kind: document.kind,
            }
        } else {
            reporter.report(PipelinePhase::Extraction, "Escalating to AI vision", 40);
            warn!(
                free_success = free.success,
                quality_score = quality.as_ref().map(|q| q.quality_score),
                "Free extraction rejected, falling back to vision"
            );
            match self.vision.extract(document, token).await {
                Ok(vision) if !vision.text.trim().is_empty() => {
                    let score = self.validator.evaluate(&vision.text).quality_score;
                    AnalysisResult {
                        method: ExtractionMethod::Vision,
                        text: vision.text,
                        confidence: vision.confidence,
                        quality_score: score,
                        escalated: true,
                        quality_issues,
                        document_kind: document.kind,
                    }
                }
                Err(ProviderError::Cancelled) => return Err(FlowError::Cancelled),
                outcome => {
                    let reason = match &outcome {
                        Err(e) => e.user_message(),
                        Ok(_) => "AI vision returned no text".to_string(),
                    };
                    if free.text.trim().is_empty() {
                        error!("Both extraction methods failed: {}", reason);
                        return Err(match outcome {
                            Err(e) if e.is_rate_limited() => FlowError::Provider(e),
                            _ => FlowError::ExtractionFailed(reason),
                        });
                    }
                    warn!("Vision fallback failed, keeping free text: {}", reason);
                    quality_issues.push(format!("AI vision fallback failed: {reason}"));
                    AnalysisResult {
                        method: ExtractionMethod::FreeOcr,
                        text: free.text,
                        confidence: free.confidence,
                        quality_score: quality.as_ref().map(|q| q.quality_score).unwrap_or(0.0),
                        escalated: true,
                        quality_issues,
                        document_kind: document.kind,
                    }
                }
            }
        };

        ensure_active(token)?;
        reporter.report(PipelinePhase::Extraction, "Text extracted", 100);
        machine.attach_analysis(result.clone());
        self.checkpoint(machine, Some(descriptor)).await;
        Ok(result)
    }

    /// Interpretation, then action plans (when enabled), then completion.
    async fn downstream(
        &self,
        machine: &WorkflowMachine,
        text: &str,
        kind: DocumentKind,
        case_context: Option<String>,
        reporter: &ProgressReporter<'_>,
        token: &CancellationToken,
    ) -> Result<()> {
        ensure_active(token)?;
        machine.navigate_to(WorkflowStep::Interpretation, Some(reporter.current()))?;
        machine.set_status(ProcessingStatus::Interpreting);
        self.checkpoint(machine, None).await;

        reporter.report(PipelinePhase::Interpretation, "Requesting clinical interpretation", 10);
        let interpretation = self
            .interpretation
            .interpret(text, kind, case_context, token)
            .await
            .map_err(interpretation_error)?;
        ensure_active(token)?;

        reporter.report(PipelinePhase::Interpretation, "Interpretation ready", 100);
        machine.attach_interpretation(interpretation.clone());
        self.checkpoint(machine, None).await;

        self.plan_phase(
            machine,
            &interpretation.issues,
            &interpretation.interpretation_text,
            kind,
            reporter,
            token,
        )
        .await
    }

    async fn plan_phase(
        &self,
        machine: &WorkflowMachine,
        issues: &[Issue],
        interpretation_text: &str,
        kind: DocumentKind,
        reporter: &ProgressReporter<'_>,
        token: &CancellationToken,
    ) -> Result<()> {
        ensure_active(token)?;
        if !self.config.action_plans_enabled {
            info!("Action plans disabled, completing after interpretation");
            return self.complete(machine, reporter).await;
        }

        machine.navigate_to(WorkflowStep::ActionPlan, Some(reporter.current()))?;
        machine.set_status(ProcessingStatus::GeneratingPlan);
        self.checkpoint(machine, None).await;
        reporter.report(PipelinePhase::ActionPlan, "Generating action plans", 0);

        let on_update = |batch: &ActionPlanResult, done: usize| {
            machine.attach_action_plan(batch.clone());
            if done > 0 {
                let total = batch.total_issues;
                let sub = (done * 100 / total.max(1)).min(100) as u8;
                reporter.report(
                    PipelinePhase::ActionPlan,
                    &format!("Action plan {done} of {total} ready"),
                    sub,
                );
            }
        };
        let plans = self
            .fanout
            .run(issues, interpretation_text, kind, &on_update, token)
            .await;

        machine.attach_action_plan(plans);
        if token.is_cancelled() {
            self.checkpoint(machine, None).await;
            return Err(FlowError::Cancelled);
        }
        self.complete(machine, reporter).await
    }

    async fn complete(&self, machine: &WorkflowMachine, reporter: &ProgressReporter<'_>) -> Result<()> {
        machine.complete()?;
        reporter.report(PipelinePhase::ActionPlan, "Analysis complete", 100);
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.discard(&machine.session_id()).await {
                warn!("Failed to remove snapshot of completed session: {}", e);
            }
        }
        info!(session_id = %machine.session_id(), "Analysis completed");
        Ok(())
    }

    async fn finish(
        &self,
        machine: &WorkflowMachine,
        outcome: Result<()>,
        descriptor: Option<&FileDescriptor>,
    ) -> std::result::Result<WorkflowState, PipelineFailure> {
        match outcome {
            Ok(()) => Ok(machine.snapshot()),
            Err(e) => {
                let failure = normalize(&e);
                error!(
                    session_id = %machine.session_id(),
                    code = failure.code.as_str(),
                    "Analysis failed: {}",
                    e
                );
                machine.fail(failure.message.clone());
                self.checkpoint(machine, descriptor).await;
                Err(failure)
            }
        }
    }

    /// Best-effort snapshot. Storage problems never fail the analysis.
    async fn checkpoint(&self, machine: &WorkflowMachine, descriptor: Option<&FileDescriptor>) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence
                .save(&machine.snapshot(), descriptor.cloned())
                .await
            {
                warn!(session_id = %machine.session_id(), "Snapshot failed: {}", e);
            }
        }
    }
}

/// Let a session that never finished extraction move on to interpretation with
/// text supplied by the caller.
fn unlock_interpretation(machine: &WorkflowMachine, reporter: &ProgressReporter<'_>) -> Result<()> {
    if machine.current_step() == WorkflowStep::Upload {
        machine.set_can_proceed(true);
        machine.navigate_to(WorkflowStep::Analysis, Some(reporter.current()))?;
    }
    if machine.current_step() == WorkflowStep::Analysis {
        machine.set_can_proceed(true);
    }
    Ok(())
}

fn ensure_active(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(FlowError::Cancelled)
    } else {
        Ok(())
    }
}

fn interpretation_error(error: ProviderError) -> FlowError {
    match error {
        ProviderError::Cancelled => FlowError::Cancelled,
        e if e.is_rate_limited() => FlowError::Provider(e),
        e => FlowError::InterpretationFailed(e.to_string()),
    }
}

fn normalize(error: &FlowError) -> PipelineFailure {
    let failure = PipelineFailure::from(error);
    if failure.code == ErrorCode::Cancelled {
        PipelineFailure::cancelled()
    } else {
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::model::PlanStatus;
    use crate::progress::NoopProgressSink;
    use crate::storage::{InMemorySnapshotStorage, SnapshotStorage};
    use crate::testing::*;
    use crate::workflow::CanonicalProgress;
    use std::sync::Mutex;
    use std::time::Duration;

    const INTERPRETATION: &str = "Acute respiratory acidosis with mild hypoxaemia.\n```json\n[{\"title\": \"Hypercapnia\", \"description\": \"pCO2 52\", \"clinicalQuestion\": \"NIV?\"}, {\"title\": \"Hypoxaemia\", \"description\": \"pO2 68\", \"clinicalQuestion\": \"Oxygen target?\"}, {\"title\": \"Monitoring\", \"description\": \"Repeat gas\", \"clinicalQuestion\": \"When?\"}]\n```";

    struct Harness {
        pipeline: AnalysisPipeline,
        vision: Arc<ScriptedVision>,
        interpreter: Arc<ScriptedInterpreter>,
        planner: Arc<ScriptedPlanner>,
        storage: Arc<InMemorySnapshotStorage>,
    }

    fn harness(
        extractor: ScriptedExtractor,
        vision: ScriptedVision,
        interpreter: ScriptedInterpreter,
        planner: ScriptedPlanner,
    ) -> Harness {
        let vision = Arc::new(vision);
        let interpreter = Arc::new(interpreter);
        let planner = Arc::new(planner);
        let storage = Arc::new(InMemorySnapshotStorage::new());
        let persistence = Arc::new(WorkflowPersistence::new(
            storage.clone(),
            PersistenceConfig::default(),
        ));
        let pipeline = AnalysisPipeline::new(
            PipelineConfig::default(),
            Arc::new(extractor),
            vision.clone(),
            interpreter.clone(),
            planner.clone(),
        )
        .with_persistence(persistence);
        Harness {
            pipeline,
            vision,
            interpreter,
            planner,
            storage,
        }
    }

    fn machine() -> WorkflowMachine {
        WorkflowMachine::new(CanonicalProgress::default())
    }

    #[tokio::test]
    async fn clean_report_runs_to_completion_without_vision() {
        let h = harness(
            ScriptedExtractor::text(CLEAN_REPORT, 0.92),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply(INTERPRETATION),
            ScriptedPlanner::failing_for(&["Hypoxaemia"]),
        );
        let machine = machine();
        let reports = Mutex::new(Vec::new());
        let sink = |phase: PipelinePhase, _stage: &str, pct: u8| {
            reports.lock().unwrap().push((phase, pct));
        };

        let state = h
            .pipeline
            .run(
                &machine,
                AnalysisRequest::new(png_document()).with_case_context("COPD, on home oxygen"),
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(state.current_step, WorkflowStep::Completed);
        assert_eq!(state.processing_status, ProcessingStatus::Completed);
        assert_eq!(state.progress, 100);
        assert_eq!(h.vision.calls(), 0);
        assert_eq!(h.planner.calls(), 3);

        let analysis = state.analysis_result.unwrap();
        assert_eq!(analysis.method, ExtractionMethod::FreeOcr);
        assert!(!analysis.escalated);

        let interpretation = state.interpretation_result.unwrap();
        assert_eq!(interpretation.issues.len(), 3);
        assert!(!interpretation.interpretation_text.contains("```"));
        assert_eq!(
            h.interpreter.requests()[0].case_context.as_deref(),
            Some("COPD, on home oxygen")
        );

        let plans = state.action_plan_result.unwrap();
        assert_eq!(plans.successful_plans, 2);
        assert_eq!(plans.failed_plans, 1);

        let reports = reports.lock().unwrap();
        assert!(reports.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(reports.last().map(|r| r.1), Some(100));

        // Completed sessions leave no snapshot behind.
        assert!(h.storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn plan_statuses_are_visible_while_requests_run() {
        let h = harness(
            ScriptedExtractor::text(CLEAN_REPORT, 0.92),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply(INTERPRETATION),
            ScriptedPlanner::new().with_delay(Duration::from_millis(100)),
        );
        let machine = machine();
        let mut updates = machine.subscribe();

        let watch_plans = async {
            loop {
                let plans = updates.borrow_and_update().action_plan_result.clone();
                if let Some(plans) = plans.filter(|p| !p.is_settled()) {
                    return Some((plans, updates.borrow().can_proceed));
                }
                if updates.changed().await.is_err() {
                    return None;
                }
            }
        };
        let cancel = CancellationToken::new();
        let run = h.pipeline.run(
            &machine,
            AnalysisRequest::new(png_document()),
            &NoopProgressSink,
            &cancel,
        );
        let (state, seen) = tokio::join!(run, tokio::time::timeout(Duration::from_secs(5), watch_plans));

        let (in_flight, can_proceed) = seen.unwrap().unwrap();
        assert_eq!(in_flight.total_issues, 3);
        assert!(
            in_flight
                .outcomes
                .iter()
                .all(|o| matches!(o.status, PlanStatus::Pending | PlanStatus::Loading))
        );
        assert!(!can_proceed);

        let plans = state.unwrap().action_plan_result.unwrap();
        assert!(plans.outcomes.iter().all(|o| o.status == PlanStatus::Success));
        assert_eq!(plans.batch_id, in_flight.batch_id);
    }

    #[tokio::test]
    async fn poor_ocr_escalates_to_vision() {
        let h = harness(
            ScriptedExtractor::text("~~ ## ..", 0.3),
            ScriptedVision::text(CLEAN_REPORT),
            ScriptedInterpreter::reply("Normal study."),
            ScriptedPlanner::new(),
        );
        let state = h
            .pipeline
            .run(&machine(), AnalysisRequest::new(png_document()), &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.vision.calls(), 1);
        let analysis = state.analysis_result.unwrap();
        assert_eq!(analysis.method, ExtractionMethod::Vision);
        assert!(analysis.escalated);
        // No issues: one comprehensive plan.
        assert_eq!(h.planner.calls(), 1);
        assert!(state.action_plan_result.unwrap().comprehensive);
    }

    #[tokio::test]
    async fn vision_failure_keeps_free_text() {
        let h = harness(
            ScriptedExtractor::text("pH 7.2", 0.4),
            ScriptedVision::error(ProviderError::Http { status: 400, body: "bad".into() }),
            ScriptedInterpreter::reply("Acidaemia."),
            ScriptedPlanner::new(),
        );
        let state = h
            .pipeline
            .run(&machine(), AnalysisRequest::new(png_document()), &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap();
        let analysis = state.analysis_result.unwrap();
        assert_eq!(analysis.method, ExtractionMethod::FreeOcr);
        assert_eq!(analysis.text, "pH 7.2");
        assert!(analysis.quality_issues.iter().any(|i| i.contains("vision fallback failed")));
    }

    #[tokio::test]
    async fn both_extractions_failing_is_terminal() {
        let h = harness(
            ScriptedExtractor::failing("tesseract missing"),
            ScriptedVision::error(ProviderError::Network("reset".into())),
            ScriptedInterpreter::reply("unused"),
            ScriptedPlanner::new(),
        );
        let machine = machine();
        let failure = h
            .pipeline
            .run(&machine, AnalysisRequest::new(png_document()), &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.code, ErrorCode::ExtractionFailed);
        assert!(failure.message.contains("retake"));
        let state = machine.snapshot();
        assert_eq!(state.processing_status, ProcessingStatus::Error);
        assert_eq!(state.current_step, WorkflowStep::Analysis);
        assert!(h.interpreter.requests().is_empty());
    }

    #[tokio::test]
    async fn unsupported_upload_is_rejected_before_providers() {
        let h = harness(
            ScriptedExtractor::text(CLEAN_REPORT, 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply("unused"),
            ScriptedPlanner::new(),
        );
        let doc = Document::new(b"PK\x03\x04".to_vec(), DocumentKind::Arterial)
            .with_mime_type("application/zip");
        let failure = h
            .pipeline
            .run(&machine(), AnalysisRequest::new(doc), &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.code, ErrorCode::UnsupportedFormat);
        assert_eq!(h.vision.calls(), 0);
    }

    #[tokio::test]
    async fn interpretation_failure_stops_at_interpretation() {
        let h = harness(
            ScriptedExtractor::text(CLEAN_REPORT, 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::error(ProviderError::Http { status: 500, body: "trace".into() }),
            ScriptedPlanner::new(),
        );
        let machine = machine();
        let failure = h
            .pipeline
            .run(&machine, AnalysisRequest::new(png_document()), &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.code, ErrorCode::InterpretationFailed);
        assert!(!failure.message.contains("trace"));
        let state = machine.snapshot();
        assert_eq!(state.current_step, WorkflowStep::Interpretation);
        assert!(state.analysis_result.is_some());
        assert_eq!(h.planner.calls(), 0);
    }

    #[tokio::test]
    async fn rate_limit_message_reaches_the_user() {
        let h = harness(
            ScriptedExtractor::text(CLEAN_REPORT, 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::error(ProviderError::Http { status: 429, body: "quota".into() }),
            ScriptedPlanner::new(),
        );
        let failure = h
            .pipeline
            .run(&machine(), AnalysisRequest::new(png_document()), &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.code, ErrorCode::RateLimited);
        assert!(failure.message.contains("rate limit"));
    }

    #[tokio::test]
    async fn cancellation_during_interpretation() {
        let h = harness(
            ScriptedExtractor::text(CLEAN_REPORT, 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply("late").with_delay(Duration::from_secs(30)),
            ScriptedPlanner::new(),
        );
        let machine = machine();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let failure = h
            .pipeline
            .run(&machine, AnalysisRequest::new(png_document()), &NoopProgressSink, &token)
            .await
            .unwrap_err();
        assert_eq!(failure, PipelineFailure::cancelled());
        assert_eq!(
            machine.snapshot().error.as_deref(),
            Some(crate::error::CANCELLED_MESSAGE)
        );
    }

    #[tokio::test]
    async fn reinterpret_rejects_empty_text_without_calls() {
        let h = harness(
            ScriptedExtractor::text(CLEAN_REPORT, 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply("unused"),
            ScriptedPlanner::new(),
        );
        let failure = h
            .pipeline
            .reinterpret(&machine(), "   ", None, &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.code, ErrorCode::ValidationFailed);
        assert!(h.interpreter.requests().is_empty());
    }

    #[tokio::test]
    async fn reinterpret_after_failure_reuses_analysis() {
        let h = harness(
            ScriptedExtractor::text(CLEAN_REPORT, 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply("Corrected interpretation."),
            ScriptedPlanner::new(),
        );
        let machine = machine();
        machine.set_can_proceed(true);
        machine.navigate_to(WorkflowStep::Analysis, None).unwrap();
        machine.attach_analysis(AnalysisResult {
            method: ExtractionMethod::FreeOcr,
            text: CLEAN_REPORT.to_string(),
            confidence: 0.9,
            quality_score: 1.0,
            escalated: false,
            quality_issues: vec![],
            document_kind: DocumentKind::Venous,
        });

        let state = h
            .pipeline
            .reinterpret(&machine, "pH 7.25 pCO2 60", Some("post-op".into()), &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.current_step, WorkflowStep::Completed);
        let request = &h.interpreter.requests()[0];
        assert_eq!(request.text, "pH 7.25 pCO2 60");
        assert_eq!(request.document_kind, DocumentKind::Venous);
    }

    #[tokio::test]
    async fn resume_continues_from_missing_interpretation() {
        let h = harness(
            ScriptedExtractor::text("unused", 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply(INTERPRETATION),
            ScriptedPlanner::new(),
        );
        let mut state = WorkflowState::new("recovered");
        state.current_step = WorkflowStep::Analysis;
        state.processing_status = ProcessingStatus::Analyzing;
        state.progress = 25;
        state.analysis_result = Some(AnalysisResult {
            method: ExtractionMethod::Vision,
            text: CLEAN_REPORT.to_string(),
            confidence: 0.8,
            quality_score: 0.9,
            escalated: true,
            quality_issues: vec![],
            document_kind: DocumentKind::Arterial,
        });
        let machine = WorkflowMachine::from_state(state, CanonicalProgress::default());

        let state = h
            .pipeline
            .resume(&machine, &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.current_step, WorkflowStep::Completed);
        assert_eq!(state.session_id, "recovered");
        assert_eq!(h.planner.calls(), 3);
    }

    #[tokio::test]
    async fn resume_without_analysis_needs_reupload() {
        let h = harness(
            ScriptedExtractor::text("unused", 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply("unused"),
            ScriptedPlanner::new(),
        );
        let failure = h
            .pipeline
            .resume(&machine(), &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.code, ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn disabled_action_plans_complete_after_interpretation() {
        let mut h = harness(
            ScriptedExtractor::text(CLEAN_REPORT, 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply(INTERPRETATION),
            ScriptedPlanner::new(),
        );
        h.pipeline.config.action_plans_enabled = false;
        let state = h
            .pipeline
            .run(&machine(), AnalysisRequest::new(png_document()), &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.current_step, WorkflowStep::Completed);
        assert!(state.action_plan_result.is_none());
        assert_eq!(h.planner.calls(), 0);
    }

    #[tokio::test]
    async fn interrupted_session_is_recoverable() {
        let h = harness(
            ScriptedExtractor::text(CLEAN_REPORT, 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply("late").with_delay(Duration::from_secs(30)),
            ScriptedPlanner::new(),
        );
        let machine = machine();
        let session_id = machine.session_id();
        let token = CancellationToken::new();

        let run = h.pipeline.run(&machine, AnalysisRequest::new(png_document()), &NoopProgressSink, &token);
        let snapshot_taken = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let snapshot = h.storage.get(&session_id).await.unwrap().unwrap();
            token.cancel();
            snapshot
        };
        let (_, snapshot) = tokio::join!(run, snapshot_taken);

        assert_eq!(snapshot.workflow.current_step, WorkflowStep::Interpretation);
        assert!(snapshot.workflow.analysis_result.is_some());
        assert_eq!(snapshot.metadata.file_descriptor.unwrap().name.as_deref(), Some("abg.png"));

        let recoverable = h.pipeline.persistence().unwrap().list_recoverable().await.unwrap();
        assert!(recoverable.is_empty(), "cancelled sessions end in the error state");
    }

    #[tokio::test]
    async fn reinterpret_after_failed_extraction_uses_typed_text() {
        let h = harness(
            ScriptedExtractor::text("unused", 0.9),
            ScriptedVision::text("unused"),
            ScriptedInterpreter::reply("Metabolic acidosis."),
            ScriptedPlanner::new(),
        );
        let machine = machine();
        machine.set_can_proceed(true);
        machine.navigate_to(WorkflowStep::Analysis, None).unwrap();
        machine.fail("We could not read the report.");

        let state = h
            .pipeline
            .reinterpret(&machine, "pH 7.21 HCO3 14", None, &NoopProgressSink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.current_step, WorkflowStep::Completed);
        assert!(state.error.is_none());
    }
}
