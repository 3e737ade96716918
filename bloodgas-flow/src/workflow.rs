use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{FlowError, Result},
    model::{ActionPlanResult, AnalysisResult, InterpretationResult},
};

/// Steps of an analysis session. Declaration order is the navigation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkflowStep {
    Upload,
    Analysis,
    Interpretation,
    ActionPlan,
    Completed,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; 5] = [
        WorkflowStep::Upload,
        WorkflowStep::Analysis,
        WorkflowStep::Interpretation,
        WorkflowStep::ActionPlan,
        WorkflowStep::Completed,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<WorkflowStep> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Idle,
    Uploading,
    Analyzing,
    Interpreting,
    GeneratingPlan,
    Completed,
    Error,
}

/// Single source of truth for one analysis session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub session_id: String,
    pub current_step: WorkflowStep,
    pub processing_status: ProcessingStatus,
    pub progress: u8,
    pub can_proceed: bool,
    /// Bumped on every change; orders snapshots of the same session.
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_result: Option<AnalysisResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpretation_result: Option<InterpretationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_plan_result: Option<ActionPlanResult>,
}

impl WorkflowState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            current_step: WorkflowStep::Upload,
            processing_status: ProcessingStatus::Idle,
            progress: 0,
            can_proceed: false,
            revision: 0,
            error: None,
            analysis_result: None,
            interpretation_result: None,
            action_plan_result: None,
        }
    }

    /// True while the session can still be resumed.
    pub fn is_recoverable(&self) -> bool {
        self.current_step != WorkflowStep::Completed
            && !matches!(
                self.processing_status,
                ProcessingStatus::Completed | ProcessingStatus::Error
            )
    }

    /// Whether the payload produced by `step` is already attached.
    fn step_satisfied(&self, step: WorkflowStep) -> bool {
        match step {
            WorkflowStep::Upload | WorkflowStep::Analysis => self.analysis_result.is_some(),
            WorkflowStep::Interpretation => self.interpretation_result.is_some(),
            WorkflowStep::ActionPlan => self
                .action_plan_result
                .as_ref()
                .is_some_and(ActionPlanResult::is_settled),
            WorkflowStep::Completed => false,
        }
    }
}

/// Authorization gate for every step change.
///
/// Backward and same-step moves are always legal. Forward moves go one step at a
/// time and need `can_proceed`; the only skip allowed is
/// `Interpretation -> Completed`, since action plans are optional.
pub fn can_navigate_to(current: WorkflowStep, target: WorkflowStep, can_proceed: bool) -> bool {
    if target.index() <= current.index() {
        return true;
    }
    if !can_proceed {
        return false;
    }
    target.index() == current.index() + 1
        || (current == WorkflowStep::Interpretation && target == WorkflowStep::Completed)
}

/// Default progress assigned when a step is entered without a measured value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalProgress {
    pub upload: u8,
    pub analysis: u8,
    pub interpretation: u8,
    pub action_plan: u8,
    pub completed: u8,
}

impl Default for CanonicalProgress {
    fn default() -> Self {
        Self {
            upload: 0,
            analysis: 25,
            interpretation: 90,
            action_plan: 75,
            completed: 100,
        }
    }
}

impl CanonicalProgress {
    pub fn for_step(&self, step: WorkflowStep) -> u8 {
        match step {
            WorkflowStep::Upload => self.upload,
            WorkflowStep::Analysis => self.analysis,
            WorkflowStep::Interpretation => self.interpretation,
            WorkflowStep::ActionPlan => self.action_plan,
            WorkflowStep::Completed => self.completed,
        }
    }
}

/// Owns a [`WorkflowState`] and mutates it only through named transitions.
///
/// The state lives inside a `watch` channel, so observers (the UI bridge, the
/// auto-saver) call [`WorkflowMachine::subscribe`] and always see the latest value.
#[derive(Clone)]
pub struct WorkflowMachine {
    state: Arc<watch::Sender<WorkflowState>>,
    canonical: CanonicalProgress,
}

impl WorkflowMachine {
    pub fn new(canonical: CanonicalProgress) -> Self {
        Self::from_state(WorkflowState::new(Uuid::new_v4().to_string()), canonical)
    }

    pub fn from_state(state: WorkflowState, canonical: CanonicalProgress) -> Self {
        let (tx, _rx) = watch::channel(state);
        Self {
            state: Arc::new(tx),
            canonical,
        }
    }

    fn modify(&self, change: impl FnOnce(&mut WorkflowState)) {
        self.state.send_modify(|state| {
            change(state);
            state.revision += 1;
        });
    }

    fn modify_if(&self, change: impl FnOnce(&mut WorkflowState) -> bool) -> bool {
        self.state.send_if_modified(|state| {
            let changed = change(state);
            if changed {
                state.revision += 1;
            }
            changed
        })
    }

    pub fn session_id(&self) -> String {
        self.state.borrow().session_id.clone()
    }

    pub fn snapshot(&self) -> WorkflowState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.state.subscribe()
    }

    pub fn current_step(&self) -> WorkflowStep {
        self.state.borrow().current_step
    }

    pub fn can_navigate_to(&self, target: WorkflowStep) -> bool {
        let state = self.state.borrow();
        can_navigate_to(state.current_step, target, state.can_proceed)
    }

    /// Move to `target`, assigning `measured` progress or the canonical value for
    /// the step. Progress never goes down.
    pub fn navigate_to(&self, target: WorkflowStep, measured: Option<u8>) -> Result<()> {
        let mut outcome = Ok(());
        self.modify_if(|state| {
            let from = state.current_step;
            if !can_navigate_to(from, target, state.can_proceed) {
                outcome = Err(FlowError::InvalidTransition { from, to: target });
                return false;
            }
            let progress = measured.unwrap_or_else(|| self.canonical.for_step(target));
            state.current_step = target;
            state.progress = state.progress.max(progress.min(100));
            state.can_proceed = state.step_satisfied(target);
            debug!(
                session_id = %state.session_id,
                ?from,
                to = ?target,
                progress = state.progress,
                "Workflow step changed"
            );
            true
        });
        outcome
    }

    pub fn set_can_proceed(&self, can_proceed: bool) {
        self.modify_if(|state| {
            let changed = state.can_proceed != can_proceed;
            state.can_proceed = can_proceed;
            changed
        });
    }

    pub fn set_status(&self, status: ProcessingStatus) {
        self.modify(|state| {
            state.processing_status = status;
            if status != ProcessingStatus::Error {
                state.error = None;
            }
        });
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.modify(|state| {
            info!(session_id = %state.session_id, step = ?state.current_step, "Workflow entered error state: {}", message);
            state.processing_status = ProcessingStatus::Error;
            state.error = Some(message);
        });
    }

    pub fn update_progress(&self, progress: u8) {
        self.modify_if(|state| {
            let next = state.progress.max(progress.min(100));
            let changed = next != state.progress;
            state.progress = next;
            changed
        });
    }

    pub fn attach_analysis(&self, result: AnalysisResult) {
        self.modify(|state| {
            state.analysis_result = Some(result);
            if matches!(state.current_step, WorkflowStep::Upload | WorkflowStep::Analysis) {
                state.can_proceed = true;
            }
        });
    }

    pub fn attach_interpretation(&self, result: InterpretationResult) {
        self.modify(|state| {
            state.interpretation_result = Some(result);
            if state.current_step == WorkflowStep::Interpretation {
                state.can_proceed = true;
            }
        });
    }

    /// Publish a plan batch. A batch with requests still in flight does not
    /// unlock the next step.
    pub fn attach_action_plan(&self, result: ActionPlanResult) {
        self.modify(|state| {
            let settled = result.is_settled();
            state.action_plan_result = Some(result);
            if state.current_step == WorkflowStep::ActionPlan {
                state.can_proceed = settled;
            }
        });
    }

    /// Enter the terminal step.
    pub fn complete(&self) -> Result<()> {
        self.navigate_to(WorkflowStep::Completed, None)?;
        self.modify(|state| {
            state.processing_status = ProcessingStatus::Completed;
            state.error = None;
            state.progress = 100;
            state.can_proceed = false;
        });
        Ok(())
    }

    /// Start over with a brand new session id. Returns the new id.
    pub fn restart(&self) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.state.send_replace(WorkflowState::new(session_id.clone()));
        info!(session_id = %session_id, "Workflow restarted");
        session_id
    }
}
