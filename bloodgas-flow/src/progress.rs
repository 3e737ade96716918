//! Phase-weighted progress aggregation and the progress callback interface.
//!
//! Each pipeline phase declares a weight. A phase reports its own sub-progress
//! (0–100) and the aggregator turns that into an overall percentage, clamped so
//! the value shown to the user never goes backwards.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelinePhase {
    Extraction,
    Interpretation,
    ActionPlan,
}

impl PipelinePhase {
    pub const ORDER: [PipelinePhase; 3] = [
        PipelinePhase::Extraction,
        PipelinePhase::Interpretation,
        PipelinePhase::ActionPlan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Extraction => "extraction",
            PipelinePhase::Interpretation => "interpretation",
            PipelinePhase::ActionPlan => "action-plan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseWeights {
    pub extraction: f32,
    pub interpretation: f32,
    pub action_plan: f32,
}

impl Default for PhaseWeights {
    fn default() -> Self {
        Self {
            extraction: 25.0,
            interpretation: 50.0,
            action_plan: 25.0,
        }
    }
}

impl PhaseWeights {
    pub fn weight(&self, phase: PipelinePhase) -> f32 {
        match phase {
            PipelinePhase::Extraction => self.extraction,
            PipelinePhase::Interpretation => self.interpretation,
            PipelinePhase::ActionPlan => self.action_plan,
        }
        .max(0.0)
    }

    fn total(&self) -> f32 {
        PipelinePhase::ORDER.iter().map(|p| self.weight(*p)).sum()
    }
}

/// Turns `(phase, sub-progress)` into overall progress.
#[derive(Debug)]
pub struct ProgressAggregator {
    weights: PhaseWeights,
    last: AtomicU8,
}

impl ProgressAggregator {
    pub fn new(weights: PhaseWeights) -> Self {
        Self {
            weights,
            last: AtomicU8::new(0),
        }
    }

    /// Overall progress for `phase` at `sub_progress` percent, ignoring history.
    pub fn overall(&self, phase: PipelinePhase, sub_progress: u8) -> u8 {
        let total = self.weights.total();
        if total <= f32::EPSILON {
            return 0;
        }
        let before: f32 = PipelinePhase::ORDER
            .iter()
            .take_while(|p| **p != phase)
            .map(|p| self.weights.weight(*p))
            .sum();
        let within = self.weights.weight(phase) * f32::from(sub_progress.min(100)) / 100.0;
        ((before + within) / total * 100.0).round().clamp(0.0, 100.0) as u8
    }

    /// Record a report and return the non-decreasing overall value.
    pub fn advance(&self, phase: PipelinePhase, sub_progress: u8) -> u8 {
        let value = self.overall(phase, sub_progress);
        self.last.fetch_max(value, Ordering::SeqCst).max(value)
    }

    pub fn current(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Receives `onProgress(phase, stage, percentage)` callbacks.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, phase: PipelinePhase, stage: &str, percentage: u8);
}

impl<F> ProgressSink for F
where
    F: Fn(PipelinePhase, &str, u8) + Send + Sync,
{
    fn on_progress(&self, phase: PipelinePhase, stage: &str, percentage: u8) {
        self(phase, stage, percentage)
    }
}

/// Sink that only logs.
pub struct TracingProgressSink {
    pub session_id: String,
}

impl ProgressSink for TracingProgressSink {
    fn on_progress(&self, phase: PipelinePhase, stage: &str, percentage: u8) {
        info!(
            session_id = %self.session_id,
            phase = phase.as_str(),
            percentage,
            "{}",
            stage
        );
    }
}

pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_progress(&self, _phase: PipelinePhase, _stage: &str, _percentage: u8) {}
}
