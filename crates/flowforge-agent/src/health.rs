//! Agent health surfaces. Two shapes are deliberately kept separate
//! (resolved Open Question, see SPEC_FULL.md): `wait_until_ready` gates
//! startup admission, `check(verbose)` answers operational health probes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Ready,
    Degraded,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub agent_type: String,
    pub state: HealthState,
    pub current_load: usize,
    pub max_concurrency: usize,
    pub last_heartbeat: DateTime<Utc>,
    /// Only populated when the health check is requested with `verbose`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Shared, lock-free health state updated by the runtime and read by health
/// probes and the metrics aggregator.
pub struct HealthTracker {
    tx: watch::Sender<AgentHealth>,
}

impl HealthTracker {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>, max_concurrency: usize) -> Self {
        let initial = AgentHealth {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            state: HealthState::Starting,
            current_load: 0,
            max_concurrency,
            last_heartbeat: Utc::now(),
            detail: None,
        };
        Self {
            tx: watch::channel(initial).0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentHealth> {
        self.tx.subscribe()
    }

    pub fn set_state(&self, state: HealthState) {
        self.tx.send_modify(|h| {
            h.state = state;
            h.last_heartbeat = Utc::now();
        });
    }

    pub fn set_load(&self, load: usize) {
        self.tx.send_modify(|h| h.current_load = load);
    }

    pub fn heartbeat(&self) {
        self.tx.send_modify(|h| h.last_heartbeat = Utc::now());
    }

    /// Block until the tracker reports [`HealthState::Ready`] or `timeout`
    /// elapses, whichever comes first.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        if rx.borrow().state == HealthState::Ready {
            return true;
        }
        tokio::time::timeout(timeout, async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if rx.borrow().state == HealthState::Ready {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Snapshot the current health, attaching free-form detail only when
    /// `verbose` is requested (spec.md §4.4 health surfaces).
    pub fn check(&self, verbose: bool) -> AgentHealth {
        let mut snapshot = self.tx.borrow().clone();
        if !verbose {
            snapshot.detail = None;
        } else if snapshot.detail.is_none() {
            snapshot.detail = Some(format!(
                "load {}/{}",
                snapshot.current_load, snapshot.max_concurrency
            ));
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_until_ready_returns_immediately_once_ready() {
        let tracker = HealthTracker::new("agent-1", "scaffold", 4);
        tracker.set_state(HealthState::Ready);
        assert!(tracker.wait_until_ready(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_until_ready_times_out_while_starting() {
        let tracker = HealthTracker::new("agent-1", "scaffold", 4);
        assert!(!tracker.wait_until_ready(Duration::from_millis(20)).await);
    }

    #[test]
    fn check_strips_detail_unless_verbose() {
        let tracker = HealthTracker::new("agent-1", "scaffold", 4);
        tracker.set_load(2);
        assert!(tracker.check(false).detail.is_none());
        assert!(tracker.check(true).detail.is_some());
    }
}
