//! Concurrent per-issue action-plan generation.
//!
//! Each issue gets its own request; one failing request never affects the
//! others. All requests run inside the caller's future through `join_all`,
//! so nothing outlives [`ActionPlanFanOut::run`].

use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{ActionPlanOutcome, ActionPlanResult, DocumentKind, Issue, PlanStatus};
use crate::providers::{ActionPlanProvider, ActionPlanRequest, ProviderError};

pub const COMPREHENSIVE_TITLE: &str = "Comprehensive management plan";
const CANCELLED: &str = "cancelled";

pub struct ActionPlanFanOut {
    provider: Arc<dyn ActionPlanProvider>,
    timeout: Duration,
}

impl ActionPlanFanOut {
    pub fn new(provider: Arc<dyn ActionPlanProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Generate one plan per issue, or a single comprehensive plan when
    /// `issues` is empty.
    ///
    /// `on_update(batch, done)` receives the live batch when it is created and
    /// every time one of its outcomes changes status.
    pub async fn run(
        &self,
        issues: &[Issue],
        interpretation_text: &str,
        kind: DocumentKind,
        on_update: &(dyn Fn(&ActionPlanResult, usize) + Send + Sync),
        token: &CancellationToken,
    ) -> ActionPlanResult {
        let batch_id = Uuid::new_v4().to_string();
        let comprehensive = issues.is_empty();

        let jobs: Vec<(Issue, ActionPlanRequest, String)> = if comprehensive {
            vec![(
                Issue {
                    title: COMPREHENSIVE_TITLE.to_string(),
                    description: String::new(),
                    clinical_question: String::new(),
                },
                ActionPlanRequest::comprehensive(interpretation_text, kind),
                format!("{batch_id}-comprehensive"),
            )]
        } else {
            issues
                .iter()
                .enumerate()
                .map(|(i, issue)| {
                    (
                        issue.clone(),
                        ActionPlanRequest::for_issue(issue, kind),
                        format!("{batch_id}-issue-{i}"),
                    )
                })
                .collect()
        };

        let total = jobs.len();
        let done = AtomicUsize::new(0);
        let live = Mutex::new(ActionPlanResult::pending(
            batch_id.clone(),
            jobs.iter().map(|(issue, _, _)| issue.clone()).collect(),
            comprehensive,
        ));
        on_update(&*live.lock().await, 0);
        info!(batch_id = %batch_id, total, comprehensive, "Starting action plan fan-out");

        let futures = jobs
            .into_iter()
            .enumerate()
            .map(|(index, (issue, request, correlation_id))| {
                let done = &done;
                let live = &live;
                async move {
                    {
                        let mut batch = live.lock().await;
                        batch.outcomes[index].status = PlanStatus::Loading;
                        on_update(&*batch, done.load(Ordering::SeqCst));
                    }
                    let started = Instant::now();
                    let result = tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(ProviderError::Cancelled),
                        result = tokio::time::timeout(
                            self.timeout,
                            self.provider.generate(&request, &correlation_id, token),
                        ) => result.unwrap_or(Err(ProviderError::Timeout(self.timeout))),
                    };
                    let outcome = settle(issue, result, started, &correlation_id);
                    let mut batch = live.lock().await;
                    batch.outcomes[index] = outcome;
                    on_update(&*batch, done.fetch_add(1, Ordering::SeqCst) + 1);
                }
            });
        join_all(futures).await;

        let mut result = live.into_inner();
        result.successful_plans = result.outcomes.iter().filter(|o| o.is_success()).count();
        result.failed_plans = result.outcomes.len() - result.successful_plans;
        result.combined_plan = combine(&result.outcomes, comprehensive);
        info!(
            batch_id = %batch_id,
            successful_plans = result.successful_plans,
            failed_plans = result.failed_plans,
            "Action plan fan-out finished"
        );
        result
    }
}

fn settle(
    issue: Issue,
    result: Result<String, ProviderError>,
    started: Instant,
    correlation_id: &str,
) -> ActionPlanOutcome {
    let mut outcome = ActionPlanOutcome::pending(issue);
    outcome.processing_time_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(plan) => {
            outcome.status = PlanStatus::Success;
            outcome.plan_text = Some(plan);
        }
        Err(ProviderError::Cancelled) => {
            outcome.status = PlanStatus::Error;
            outcome.error_message = Some(CANCELLED.to_string());
        }
        Err(e) => {
            warn!(correlation_id, issue = %outcome.issue.title, "Action plan failed: {}", e);
            outcome.status = PlanStatus::Error;
            outcome.error_message = Some(e.user_message());
        }
    }
    outcome
}

fn combine(outcomes: &[ActionPlanOutcome], comprehensive: bool) -> String {
    if comprehensive {
        return outcomes
            .iter()
            .find_map(|o| o.plan_text.clone())
            .unwrap_or_default();
    }
    outcomes
        .iter()
        .filter_map(|o| {
            o.plan_text
                .as_ref()
                .map(|plan| format!("## {}\n\n{}", o.issue.title, plan.trim()))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies after `delay`; fails for titles in `failing`.
    struct Scripted {
        delay: Duration,
        failing: Vec<&'static str>,
        calls: Mutex<Vec<(ActionPlanRequest, String)>>,
    }

    impl Scripted {
        fn new(delay: Duration, failing: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                delay,
                failing,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ActionPlanProvider for Scripted {
        async fn generate(
            &self,
            request: &ActionPlanRequest,
            correlation_id: &str,
            token: &CancellationToken,
        ) -> Result<String, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.clone(), correlation_id.to_string()));
            tokio::select! {
                _ = token.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
            if self.failing.contains(&request.issue_title.as_str()) {
                Err(ProviderError::Http {
                    status: 500,
                    body: "boom".into(),
                })
            } else {
                Ok(format!("Plan for {}", request.issue_title))
            }
        }
    }

    fn issue(title: &str) -> Issue {
        Issue {
            title: title.to_string(),
            description: format!("{title} details"),
            clinical_question: format!("What about {title}?"),
        }
    }

    #[tokio::test]
    async fn partial_failure_is_isolated() {
        let provider = Scripted::new(Duration::from_millis(5), vec!["Hypoxaemia"]);
        let fanout = ActionPlanFanOut::new(provider.clone(), Duration::from_secs(5));
        let issues = [issue("Acidosis"), issue("Hypoxaemia"), issue("Hyperkalaemia")];
        let resolved = AtomicUsize::new(0);

        let result = fanout
            .run(
                &issues,
                "interp",
                DocumentKind::Arterial,
                &|batch: &ActionPlanResult, done| {
                    assert_eq!(batch.total_issues, 3);
                    assert_eq!(batch.outcomes.iter().filter(|o| o.is_settled()).count(), done);
                    resolved.fetch_max(done, Ordering::SeqCst);
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.successful_plans, 2);
        assert_eq!(result.failed_plans, 1);
        assert_eq!(result.total_issues, 3);
        assert!(!result.comprehensive);
        assert_eq!(resolved.load(Ordering::SeqCst), 3);
        assert_eq!(result.outcomes[1].status, PlanStatus::Error);
        assert!(!result.outcomes[1].error_message.as_ref().unwrap().contains("boom"));
        assert!(result.combined_plan.contains("## Acidosis"));
        assert!(result.combined_plan.contains("## Hyperkalaemia"));
        assert!(!result.combined_plan.contains("## Hypoxaemia"));

        let mut ids: Vec<String> = provider
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        assert_eq!(
            ids,
            (0..3)
                .map(|i| format!("{}-issue-{i}", result.batch_id))
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn live_batch_moves_through_pending_and_loading() {
        let provider = Scripted::new(Duration::from_millis(20), vec![]);
        let fanout = ActionPlanFanOut::new(provider, Duration::from_secs(5));
        let seen = Mutex::new(Vec::new());

        let result = fanout
            .run(
                &[issue("Acidosis"), issue("Hypoxaemia")],
                "",
                DocumentKind::Arterial,
                &|batch: &ActionPlanResult, _| {
                    let statuses: Vec<PlanStatus> =
                        batch.outcomes.iter().map(|o| o.status).collect();
                    seen.lock().unwrap().push(statuses);
                },
                &CancellationToken::new(),
            )
            .await;

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first(), Some(&vec![PlanStatus::Pending, PlanStatus::Pending]));
        assert!(seen.contains(&vec![PlanStatus::Loading, PlanStatus::Loading]));
        assert_eq!(seen.last(), Some(&vec![PlanStatus::Success, PlanStatus::Success]));
        assert!(result.is_settled());
    }

    #[tokio::test]
    async fn no_issues_means_one_comprehensive_request() {
        let provider = Scripted::new(Duration::ZERO, vec![]);
        let fanout = ActionPlanFanOut::new(provider.clone(), Duration::from_secs(5));
        let result = fanout
            .run(&[], "Full interpretation", DocumentKind::Venous, &|_, _| {}, &CancellationToken::new())
            .await;

        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.issue_description, "Full interpretation");
        assert_eq!(calls[0].1, format!("{}-comprehensive", result.batch_id));
        assert!(result.comprehensive);
        assert_eq!(result.successful_plans, 1);
        assert_eq!(result.combined_plan, format!("Plan for {COMPREHENSIVE_TITLE}"));
    }

    #[tokio::test]
    async fn requests_run_concurrently() {
        let provider = Scripted::new(Duration::from_millis(200), vec![]);
        let fanout = ActionPlanFanOut::new(provider, Duration::from_secs(5));
        let issues: Vec<Issue> = (0..5).map(|i| issue(&format!("Issue {i}"))).collect();

        let started = Instant::now();
        let result = fanout
            .run(&issues, "", DocumentKind::Arterial, &|_, _| {}, &CancellationToken::new())
            .await;
        assert_eq!(result.successful_plans, 5);
        assert!(started.elapsed() < Duration::from_millis(800), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn slow_request_times_out_alone() {
        struct SlowFor(&'static str);

        #[async_trait]
        impl ActionPlanProvider for SlowFor {
            async fn generate(
                &self,
                request: &ActionPlanRequest,
                _correlation_id: &str,
                _token: &CancellationToken,
            ) -> Result<String, ProviderError> {
                if request.issue_title == self.0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok("ok".into())
            }
        }

        let fanout = ActionPlanFanOut::new(Arc::new(SlowFor("Slow")), Duration::from_millis(50));
        let result = fanout
            .run(
                &[issue("Fast"), issue("Slow")],
                "",
                DocumentKind::Arterial,
                &|_, _| {},
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.successful_plans, 1);
        assert_eq!(result.outcomes[1].status, PlanStatus::Error);
    }

    #[tokio::test]
    async fn cancellation_keeps_resolved_outcomes() {
        struct Staggered;

        #[async_trait]
        impl ActionPlanProvider for Staggered {
            async fn generate(
                &self,
                request: &ActionPlanRequest,
                _correlation_id: &str,
                _token: &CancellationToken,
            ) -> Result<String, ProviderError> {
                let delay = if request.issue_title == "Quick" { 5 } else { 5_000 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok("done".into())
            }
        }

        let fanout = ActionPlanFanOut::new(Arc::new(Staggered), Duration::from_secs(30));
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let result = fanout
            .run(&[issue("Quick"), issue("Stuck")], "", DocumentKind::Arterial, &|_, _| {}, &token)
            .await;
        assert_eq!(result.outcomes[0].status, PlanStatus::Success);
        assert_eq!(result.outcomes[1].status, PlanStatus::Error);
        assert_eq!(result.outcomes[1].error_message.as_deref(), Some("cancelled"));
    }
}
