//! Query Execution Coordinator - per-query run bookkeeping
//!
//! Enforces at most one in-flight run per query. A request whose resolved
//! options match the in-flight run joins it; any other request while a run
//! is in flight claims the single queued-rerun slot, which starts as soon as
//! the current run completes. Editing or tearing down a query bumps its
//! epoch, and results from an older epoch are discarded on arrival.

use crate::{QueryError, QueryRequest};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::SystemTime;
use tokio::sync::oneshot;

/// Lifecycle state of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Idle,
    Pending,
    Running,
    Success,
    Error,
}

/// How a run ended, as delivered to every caller waiting on it
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Success { run_id: u64, data: serde_json::Value },
    /// `run_id` is `None` when the run failed before reaching the connector
    Failed { run_id: Option<u64>, error: QueryError },
    /// The result arrived after its owner was torn down or edited
    Discarded { run_id: Option<u64> },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            RunOutcome::Success { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&QueryError> {
        match self {
            RunOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Errored,
    Discarded,
}

/// Record of one execution
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRun {
    pub run_id: u64,
    pub query_id: String,
    pub status: RunStatus,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
    /// Resolved options the run was computed from
    pub request: QueryRequest,
    /// Connector calls made, retries included
    pub attempts: u32,
    pub outcome: Option<RunOutcome>,
}

/// Counters per query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    /// Requests of any kind (manual, dependency, page load, action)
    pub triggered: u64,
    /// Runs that reached the connector
    pub started: u64,
    /// Requests that joined an identical in-flight run
    pub coalesced: u64,
    /// Requests folded into the queued rerun
    pub queued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub discarded: u64,
}

pub(crate) type Waiter = oneshot::Sender<RunOutcome>;

const TRANSITION_HISTORY: usize = 32;

#[derive(Default)]
struct QuerySlot {
    status: QueryStatus,
    epoch: u64,
    in_flight: Option<InFlight>,
    queued: Option<Vec<Waiter>>,
    last_run: Option<QueryRun>,
    stats: QueryStats,
    transitions: Vec<QueryStatus>,
}

impl QuerySlot {
    fn transition(&mut self, status: QueryStatus) {
        self.status = status;
        if self.transitions.len() == TRANSITION_HISTORY {
            self.transitions.remove(0);
        }
        self.transitions.push(status);
    }
}

struct InFlight {
    run: QueryRun,
    epoch: u64,
    waiters: Vec<Waiter>,
}

/// Result of asking for a run
#[derive(Debug, PartialEq)]
pub(crate) enum Admission {
    /// Caller must start the connector call for this run
    Start { run_id: u64, request: QueryRequest },
    Joined,
    Queued,
}

/// An in-flight run taken off its slot
pub(crate) struct Finished {
    pub run: QueryRun,
    /// Owner was torn down or edited since the run started
    pub stale: bool,
    pub waiters: Vec<Waiter>,
    /// Waiters for the rerun that should start now
    pub queued: Option<Vec<Waiter>>,
}

pub(crate) struct Coordinator {
    slots: BTreeMap<String, QuerySlot>,
    next_run_id: u64,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            next_run_id: 1,
        }
    }

    pub fn register(&mut self, query_id: &str) {
        self.slots.entry(query_id.to_string()).or_default();
    }

    /// Forget a query; anyone waiting on it sees a discard
    pub fn remove(&mut self, query_id: &str) {
        if let Some(slot) = self.slots.remove(query_id) {
            let run_id = slot.in_flight.as_ref().map(|f| f.run.run_id);
            let waiters = slot.in_flight.into_iter().flat_map(|f| f.waiters);
            for waiter in waiters.chain(slot.queued.into_iter().flatten()) {
                let _ = waiter.send(RunOutcome::Discarded { run_id });
            }
        }
    }

    pub fn status(&self, query_id: &str) -> Option<QueryStatus> {
        self.slots.get(query_id).map(|slot| slot.status)
    }

    pub fn stats(&self, query_id: &str) -> Option<QueryStats> {
        self.slots.get(query_id).map(|slot| slot.stats)
    }

    pub fn last_run(&self, query_id: &str) -> Option<&QueryRun> {
        self.slots.get(query_id).and_then(|slot| slot.last_run.as_ref())
    }

    pub fn transitions(&self, query_id: &str) -> Vec<QueryStatus> {
        self.slots
            .get(query_id)
            .map(|slot| slot.transitions.clone())
            .unwrap_or_default()
    }

    pub fn is_in_flight(&self, query_id: &str) -> bool {
        self.slots.get(query_id).is_some_and(|slot| slot.in_flight.is_some())
    }

    /// Decide whether `request` starts a run, joins the in-flight one or
    /// waits for the rerun
    pub fn admit(&mut self, query_id: &str, request: QueryRequest, waiters: Vec<Waiter>) -> Admission {
        let run_id = self.next_run_id;
        let slot = self.slots.entry(query_id.to_string()).or_default();
        slot.stats.triggered += 1;

        if let Some(in_flight) = &mut slot.in_flight {
            if in_flight.epoch == slot.epoch && in_flight.run.request == request {
                in_flight.waiters.extend(waiters);
                slot.stats.coalesced += 1;
                return Admission::Joined;
            }
            slot.queued.get_or_insert_with(Vec::new).extend(waiters);
            slot.stats.queued += 1;
            return Admission::Queued;
        }

        self.next_run_id += 1;
        slot.transition(QueryStatus::Pending);
        slot.transition(QueryStatus::Running);
        slot.stats.started += 1;
        slot.in_flight = Some(InFlight {
            run: QueryRun {
                run_id,
                query_id: query_id.to_string(),
                status: RunStatus::Running,
                started_at: SystemTime::now(),
                finished_at: None,
                request: request.clone(),
                attempts: 0,
                outcome: None,
            },
            epoch: slot.epoch,
            waiters,
        });
        Admission::Start { run_id, request }
    }

    /// Take the in-flight run `run_id` off its slot. `None` if the query
    /// was removed or another run is in flight.
    pub fn finish(&mut self, query_id: &str, run_id: u64) -> Option<Finished> {
        let slot = self.slots.get_mut(query_id)?;
        if slot.in_flight.as_ref().map(|f| f.run.run_id) != Some(run_id) {
            return None;
        }
        let in_flight = slot.in_flight.take()?;
        let stale = in_flight.epoch != slot.epoch;
        if stale {
            slot.stats.discarded += 1;
        }
        Some(Finished {
            run: in_flight.run,
            stale,
            waiters: in_flight.waiters,
            queued: slot.queued.take(),
        })
    }

    /// Record how a non-stale run ended
    pub fn settle(&mut self, query_id: &str, mut run: QueryRun, outcome: &RunOutcome) {
        let Some(slot) = self.slots.get_mut(query_id) else {
            return;
        };
        run.finished_at = Some(SystemTime::now());
        run.outcome = Some(outcome.clone());
        match outcome {
            RunOutcome::Success { .. } => {
                run.status = RunStatus::Completed;
                slot.stats.succeeded += 1;
                slot.transition(QueryStatus::Success);
            }
            RunOutcome::Failed { .. } => {
                run.status = RunStatus::Errored;
                slot.stats.failed += 1;
                slot.transition(QueryStatus::Error);
            }
            RunOutcome::Discarded { .. } => run.status = RunStatus::Discarded,
        }
        slot.last_run = Some(run);
    }

    /// A request that failed before reaching the connector
    pub fn fail_early(&mut self, query_id: &str) {
        let slot = self.slots.entry(query_id.to_string()).or_default();
        slot.stats.triggered += 1;
        slot.stats.failed += 1;
        if slot.in_flight.is_none() {
            slot.transition(QueryStatus::Error);
        }
    }

    /// Invalidate whatever is in flight for this query. The run still
    /// completes but its result is discarded; a queued rerun is dropped.
    /// Returns true when a run was in flight.
    pub fn invalidate(&mut self, query_id: &str) -> bool {
        let Some(slot) = self.slots.get_mut(query_id) else {
            return false;
        };
        slot.epoch += 1;
        let run_id = slot.in_flight.as_ref().map(|f| f.run.run_id);
        for waiter in slot.queued.take().into_iter().flatten() {
            let _ = waiter.send(RunOutcome::Discarded { run_id: None });
        }
        if slot.status != QueryStatus::Idle {
            slot.transition(QueryStatus::Idle);
        }
        run_id.is_some()
    }

    /// Record a connector attempt on the in-flight run
    pub fn note_attempt(&mut self, query_id: &str, run_id: u64) {
        if let Some(in_flight) = self.slots.get_mut(query_id).and_then(|slot| slot.in_flight.as_mut()) {
            if in_flight.run.run_id == run_id {
                in_flight.run.attempts += 1;
            }
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}
