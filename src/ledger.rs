//! Request ledger: per-document run state, observable by pollers and
//! WebSocket subscribers.
//!
//! Only the pipeline orchestrator writes to the ledger. Each write is a
//! single atomic update of one entry (a `DashMap` shard lock), and every
//! write is mirrored onto a broadcast channel as a [`ProgressEvent`].

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use documind_core::stage::RunState;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::PipelineFailure;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct LedgerEntry {
    state: RunState,
    failure: Option<PipelineFailure>,
    created_at: DateTime<Utc>,
    touched: Instant,
}

/// Point-in-time view of one run.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub document_id: String,
    pub state: RunState,
    pub failure: Option<PipelineFailure>,
    pub created_at: DateTime<Utc>,
}

/// Pushed to subscribers on every ledger transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub document_id: String,
    /// Stage the event refers to; `None` while queued or once completed.
    pub stage: Option<&'static str>,
    pub status: &'static str,
    pub phase: &'static str,
    pub progress: u8,
}

impl ProgressEvent {
    fn new(document_id: &str, state: RunState) -> Self {
        let stage = match state {
            RunState::Running(stage) | RunState::Failed(stage) => Some(stage.name()),
            RunState::Queued | RunState::Done => None,
        };
        Self {
            document_id: document_id.to_string(),
            stage,
            status: state.status(),
            phase: state.phase(),
            progress: state.progress(),
        }
    }
}

pub struct Ledger {
    entries: DashMap<String, LedgerEntry>,
    events: broadcast::Sender<ProgressEvent>,
    ttl: Duration,
}

impl Ledger {
    pub fn new(ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
            ttl,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Register a new run in the `queued` state.
    pub fn open(&self, document_id: &str) {
        self.entries.insert(
            document_id.to_string(),
            LedgerEntry {
                state: RunState::Queued,
                failure: None,
                created_at: Utc::now(),
                touched: Instant::now(),
            },
        );
        self.publish(document_id, RunState::Queued);
    }

    /// Move a run to its next state. Returns the new state, or `None` if the
    /// run is unknown or already terminal.
    pub fn advance(&self, document_id: &str) -> Option<RunState> {
        let next = {
            let mut entry = self.entries.get_mut(document_id)?;
            let next = entry.state.advance()?;
            entry.state = next;
            entry.touched = Instant::now();
            next
        };
        self.publish(document_id, next);
        Some(next)
    }

    /// Record a terminal failure.
    pub fn fail(&self, failure: &PipelineFailure) -> Option<RunState> {
        let next = {
            let mut entry = self.entries.get_mut(&failure.document_id)?;
            let next = entry.state.fail()?;
            entry.state = next;
            entry.failure = Some(failure.clone());
            entry.touched = Instant::now();
            next
        };
        self.publish(&failure.document_id, next);
        Some(next)
    }

    pub fn status(&self, document_id: &str) -> Option<RunStatus> {
        self.entries.get(document_id).map(|e| RunStatus {
            document_id: document_id.to_string(),
            state: e.state,
            failure: e.failure.clone(),
            created_at: e.created_at,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop terminal entries idle for longer than the TTL. Running entries
    /// are kept regardless of age.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            !(e.state.is_terminal() && now.saturating_duration_since(e.touched) > self.ttl)
        });
        before.saturating_sub(self.entries.len())
    }

    fn publish(&self, document_id: &str, state: RunState) {
        // no subscribers is fine
        let _ = self.events.send(ProgressEvent::new(document_id, state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use documind_core::stage::Stage;

    #[test]
    fn advances_through_every_stage() {
        let ledger = Ledger::new(Duration::from_secs(60));
        ledger.open("d");
        assert_eq!(ledger.status("d").unwrap().state, RunState::Queued);
        for stage in Stage::ALL {
            assert_eq!(ledger.advance("d"), Some(RunState::Running(stage)));
        }
        assert_eq!(ledger.advance("d"), Some(RunState::Done));
        assert_eq!(ledger.advance("d"), None);
        assert_eq!(ledger.status("d").unwrap().state.progress(), 100);
        assert_eq!(ledger.advance("unknown"), None);
    }

    #[test]
    fn failure_is_terminal_and_kept() {
        let ledger = Ledger::new(Duration::from_secs(60));
        ledger.open("d");
        ledger.advance("d");
        ledger.advance("d");
        let failure = PipelineFailure::new(Stage::Analyze, FailureKind::AnalysisFailure, "d", "boom");
        assert_eq!(ledger.fail(&failure), Some(RunState::Failed(Stage::Analyze)));
        assert_eq!(ledger.fail(&failure), None);
        let status = ledger.status("d").unwrap();
        assert_eq!(status.state.status(), "failed");
        assert_eq!(status.failure.unwrap().kind, FailureKind::AnalysisFailure);
    }

    #[test]
    fn transitions_are_broadcast() {
        let ledger = Ledger::new(Duration::from_secs(60));
        let mut rx = ledger.subscribe();
        ledger.open("d");
        ledger.advance("d");
        ledger.advance("d");
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.status, "queued");
        let parsing = rx.try_recv().unwrap();
        assert_eq!(parsing.stage, Some("parse"));
        assert_eq!(parsing.progress, 0);
        let analyzing = rx.try_recv().unwrap();
        assert_eq!(analyzing.phase, "analyzing");
        assert_eq!(analyzing.progress, 15);
    }

    #[test]
    fn sweep_only_drops_stale_terminal_runs() {
        let ledger = Ledger::new(Duration::from_secs(1));
        ledger.open("running");
        ledger.advance("running");
        ledger.open("done");
        for _ in 0..7 {
            ledger.advance("done");
        }
        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(ledger.sweep(later), 1);
        assert!(ledger.status("running").is_some());
        assert!(ledger.status("done").is_none());
    }
}
