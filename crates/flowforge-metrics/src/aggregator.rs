//! In-memory rolling-window aggregator (spec.md §4.10): observes the same
//! `orchestrator:results` / `workflow:events` streams the orchestrator
//! publishes and keeps 1/5/15-minute counters for the broadcaster to read.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowforge_core::bus::{MessageBus, SubscribeOptions};
use flowforge_schemas::task_result::{ResultStatus, TaskResult};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const WINDOWS: [(&str, Duration); 3] = [
    ("1m", Duration::from_secs(60)),
    ("5m", Duration::from_secs(5 * 60)),
    ("15m", Duration::from_secs(15 * 60)),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEventKind {
    Created,
    Completed,
    Failed,
    DuplicateResultIgnored,
    LateResultDiscarded,
}

struct TaskSample {
    at: Instant,
    duration_ms: u64,
    success: bool,
}

struct WorkflowSample {
    at: Instant,
    kind: WorkflowEventKind,
}

#[derive(Default)]
struct State {
    tasks: VecDeque<TaskSample>,
    workflows: VecDeque<WorkflowSample>,
    stream_lag_ms: u64,
}

impl State {
    fn prune(&mut self, now: Instant) {
        let horizon = WINDOWS[WINDOWS.len() - 1].1;
        while self.tasks.front().is_some_and(|s| now.duration_since(s.at) > horizon) {
            self.tasks.pop_front();
        }
        while self.workflows.front().is_some_and(|s| now.duration_since(s.at) > horizon) {
            self.workflows.pop_front();
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WindowMetrics {
    pub workflows_created: u64,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    pub duplicate_results_ignored: u64,
    pub late_results_discarded: u64,
    pub workflows_per_second: f64,
    pub task_count: u64,
    pub task_failures: u64,
    pub success_rate_pct: f64,
    pub error_rate_pct: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub windows: std::collections::BTreeMap<String, WindowMetrics>,
    pub stream_lag_ms: u64,
}

/// Rolling-window metrics aggregator; safe to share across the subscriber
/// loop and however many broadcaster clients are reading snapshots.
pub struct MetricsAggregator {
    state: RwLock<State>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    pub async fn record_task_result(&self, result: &TaskResult) {
        let mut state = self.state.write().await;
        let now = Instant::now();
        state.prune(now);
        state.tasks.push_back(TaskSample {
            at: now,
            duration_ms: result.metrics.duration_ms,
            success: matches!(result.status, ResultStatus::Success),
        });
    }

    pub async fn record_workflow_event(&self, kind: WorkflowEventKind) {
        let mut state = self.state.write().await;
        let now = Instant::now();
        state.prune(now);
        state.workflows.push_back(WorkflowSample { at: now, kind });
    }

    pub async fn set_stream_lag_ms(&self, lag_ms: u64) {
        self.state.write().await.stream_lag_ms = lag_ms;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let mut state = self.state.write().await;
        let now = Instant::now();
        state.prune(now);

        let mut windows = std::collections::BTreeMap::new();
        for (label, window) in WINDOWS {
            let tasks: Vec<&TaskSample> = state.tasks.iter().filter(|s| now.duration_since(s.at) <= window).collect();
            let workflows: Vec<&WorkflowSample> =
                state.workflows.iter().filter(|s| now.duration_since(s.at) <= window).collect();

            let workflows_created = workflows.iter().filter(|s| s.kind == WorkflowEventKind::Created).count() as u64;
            let workflows_completed =
                workflows.iter().filter(|s| s.kind == WorkflowEventKind::Completed).count() as u64;
            let workflows_failed = workflows.iter().filter(|s| s.kind == WorkflowEventKind::Failed).count() as u64;
            let duplicate_results_ignored = workflows
                .iter()
                .filter(|s| s.kind == WorkflowEventKind::DuplicateResultIgnored)
                .count() as u64;
            let late_results_discarded = workflows
                .iter()
                .filter(|s| s.kind == WorkflowEventKind::LateResultDiscarded)
                .count() as u64;

            let task_count = tasks.len() as u64;
            let task_failures = tasks.iter().filter(|s| !s.success).count() as u64;

            let mut latencies: Vec<u64> = tasks.iter().map(|s| s.duration_ms).collect();
            latencies.sort_unstable();

            windows.insert(
                label.to_string(),
                WindowMetrics {
                    workflows_created,
                    workflows_completed,
                    workflows_failed,
                    duplicate_results_ignored,
                    late_results_discarded,
                    workflows_per_second: workflows_created as f64 / window.as_secs_f64(),
                    task_count,
                    task_failures,
                    success_rate_pct: percent(task_count - task_failures, task_count),
                    error_rate_pct: percent(task_failures, task_count),
                    latency_p50_ms: percentile(&latencies, 0.50),
                    latency_p95_ms: percentile(&latencies, 0.95),
                    latency_p99_ms: percentile(&latencies, 0.99),
                },
            );
        }

        MetricsSnapshot {
            windows,
            stream_lag_ms: state.stream_lag_ms,
        }
    }
}

fn percent(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        (numerator as f64 / denominator as f64) * 100.0
    }
}

/// Nearest-rank percentile over an already-sorted sample.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx]
}

/// Drive the aggregator from the live bus: subscribes to `orchestrator:results`
/// for task metrics and `workflow:events` for workflow lifecycle counts.
pub async fn run_subscriber(bus: Arc<dyn MessageBus>, aggregator: Arc<MetricsAggregator>) -> flowforge_core::error::Result<()> {
    let mut results = bus.subscribe("orchestrator:results", SubscribeOptions::default()).await?;
    let mut events = bus.subscribe("workflow:events", SubscribeOptions::default()).await?;

    loop {
        tokio::select! {
            next = results.next() => {
                match next {
                    Some(Ok(envelope)) => {
                        match serde_json::from_value::<TaskResult>(envelope.payload) {
                            Ok(result) => aggregator.record_task_result(&result).await,
                            Err(e) => warn!(error = %e, "malformed task result on results topic"),
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "results subscription error"),
                    None => return Ok(()),
                }
            }
            next = events.next() => {
                match next {
                    Some(Ok(envelope)) => {
                        let kind = match envelope.r#type.as_str() {
                            "workflow.created" => Some(WorkflowEventKind::Created),
                            "workflow.completed" => Some(WorkflowEventKind::Completed),
                            "workflow.failed" => Some(WorkflowEventKind::Failed),
                            "workflow.result_duplicate_ignored" => Some(WorkflowEventKind::DuplicateResultIgnored),
                            "workflow.result_late_discarded" => Some(WorkflowEventKind::LateResultDiscarded),
                            other => {
                                debug!(event_type = other, "ignoring unrecognized workflow event");
                                None
                            }
                        };
                        if let Some(kind) = kind {
                            aggregator.record_workflow_event(kind).await;
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "events subscription error"),
                    None => return Ok(()),
                }
            }
        }
    }
}
