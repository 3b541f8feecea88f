//! Concurrent local executor.
//!
//! A coordinator on the calling thread launches every action whose in-batch
//! prerequisites finished successfully, up to the concurrency limit, each on
//! its own scoped worker thread. Workers report completion over a channel;
//! the coordinator blocks on it only while something is running, so new
//! work is evaluated as soon as an action finishes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, mpsc};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info};

use super::process::Job;
use super::{ActionOutcome, BatchReport, ConcurrencyOptions, Executor, LineSink, concurrency_limit};
use crate::action::ActionId;
use crate::artifact::ArtifactRegistry;
use crate::error::ExecutorError;
use crate::graph::ActionGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Running,
    Finished(bool),
}

/// Message sent back from a worker thread.
struct Completion {
    id: ActionId,
    outcome: ActionOutcome,
    start: SystemTime,
    end: SystemTime,
}

/// Runs actions as local processes with bounded parallelism.
#[derive(Clone)]
pub struct LocalExecutor {
    limit: usize,
    sink: Option<Arc<LineSink>>,
}

impl LocalExecutor {
    /// Executor running at most `limit` actions at once (at least one).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            sink: None,
        }
    }

    /// Executor with the limit derived from the host.
    pub fn from_options(options: &ConcurrencyOptions) -> Self {
        Self::new(concurrency_limit(options))
    }

    /// Deliver process output to `sink` instead of the log.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<LineSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Maximum number of actions running at once.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl std::fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("limit", &self.limit)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    fn execute(
        &mut self,
        graph: &mut ActionGraph,
        artifacts: &ArtifactRegistry,
        batch: &[ActionId],
        verbose_stats: bool,
    ) -> Result<BatchReport, ExecutorError> {
        let in_batch: HashSet<ActionId> = batch.iter().copied().collect();

        // Preference order from the graph, then anything it does not list.
        let mut pending: Vec<ActionId> = graph
            .order()
            .iter()
            .copied()
            .filter(|id| in_batch.contains(id))
            .collect();
        let listed: HashSet<ActionId> = pending.iter().copied().collect();
        let mut extra: Vec<ActionId> = in_batch.difference(&listed).copied().collect();
        extra.sort();
        pending.extend(extra);

        // Producers outside the batch are treated as satisfied.
        let prerequisites: HashMap<ActionId, Vec<ActionId>> = pending
            .iter()
            .map(|&id| {
                let producers = graph
                    .prerequisite_actions(artifacts, id)
                    .into_iter()
                    .filter(|p| in_batch.contains(p))
                    .collect();
                (id, producers)
            })
            .collect();

        let mut jobs: HashMap<ActionId, Job> = pending
            .iter()
            .map(|&id| (id, Job::from_action(graph.action(id))))
            .collect();
        let mut states: HashMap<ActionId, State> =
            pending.iter().map(|&id| (id, State::NotStarted)).collect();
        let mut outcomes = BTreeMap::new();
        let mut times: Vec<(ActionId, SystemTime, SystemTime)> = Vec::new();

        let total = pending.len();
        let limit = self.limit;
        let graph_view: &ActionGraph = graph;
        debug!(actions = total, limit, "starting local batch");

        let (tx, rx) = mpsc::channel::<Completion>();
        let scheduled: Result<(), ExecutorError> = std::thread::scope(|s| {
            // Dropped once every job is launched, so the channel disconnects
            // if the remaining workers all exit without reporting.
            let mut sender = Some(tx);
            let mut running = 0usize;
            let mut finished = 0usize;

            loop {
                if finished == total {
                    return Ok(());
                }

                let mut progressed = false;
                for &id in &pending {
                    if states[&id] != State::NotStarted {
                        continue;
                    }
                    let mut blocked = false;
                    let mut poisoned = false;
                    for producer in &prerequisites[&id] {
                        match states[producer] {
                            State::Finished(true) => {}
                            State::Finished(false) => poisoned = true,
                            State::NotStarted | State::Running => blocked = true,
                        }
                    }

                    if poisoned {
                        debug!(action = %id, "not launched, a prerequisite failed");
                        states.insert(id, State::Finished(false));
                        outcomes.insert(id, ActionOutcome::Poisoned);
                        finished += 1;
                        progressed = true;
                        continue;
                    }
                    if blocked || running >= limit {
                        continue;
                    }

                    let (Some(job), Some(tx)) = (jobs.remove(&id), sender.clone()) else {
                        continue;
                    };
                    let action = graph_view.action(id);
                    if action.emit_status_line {
                        info!("{}", action.status_text());
                    }
                    let sink = self.sink.clone();
                    s.spawn(move || {
                        let start = SystemTime::now();
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run(sink.as_deref())))
                            .unwrap_or_else(|_| ActionOutcome::LaunchFailed {
                                reason: "worker panicked".into(),
                            });
                        let end = SystemTime::now();
                        // The coordinator only drops the receiver after every
                        // worker is joined.
                        let _ = tx.send(Completion {
                            id: job.id,
                            outcome,
                            start,
                            end,
                        });
                    });
                    states.insert(id, State::Running);
                    running += 1;
                    progressed = true;
                }

                if jobs.is_empty() {
                    sender = None;
                }
                if finished == total {
                    return Ok(());
                }
                if running == 0 {
                    if progressed {
                        continue;
                    }
                    return Err(ExecutorError::Stalled {
                        remaining: total - finished,
                    });
                }

                let done = next_completion(&rx)?;
                running -= 1;
                finished += 1;
                let success = done.outcome.is_success();
                if !success {
                    error!(
                        "{} ({}) {}",
                        graph_view.action(done.id).status_text(),
                        done.id,
                        done.outcome
                    );
                }
                states.insert(done.id, State::Finished(success));
                times.push((done.id, done.start, done.end));
                outcomes.insert(done.id, done.outcome);
            }
        });
        scheduled?;

        for &(id, start, end) in &times {
            let action = graph.action_mut(id);
            action.start_time = Some(start);
            action.end_time = Some(end);
        }

        if verbose_stats {
            log_slowest(graph, times.iter().map(|&(id, _, _)| id));
        }

        let success = outcomes.values().all(ActionOutcome::is_success);
        Ok(BatchReport {
            executor: self.name().to_owned(),
            success,
            outcomes,
        })
    }
}

/// Block for the next worker report.
fn next_completion(rx: &mpsc::Receiver<Completion>) -> Result<Completion, ExecutorError> {
    rx.recv().map_err(|_| ExecutorError::WorkerLost)
}

fn log_slowest(graph: &ActionGraph, finished: impl Iterator<Item = ActionId>) {
    let mut timings: Vec<(ActionId, Duration)> = finished
        .filter_map(|id| Some((id, graph.action(id).duration()?)))
        .collect();
    if timings.is_empty() {
        return;
    }
    timings.sort_by(|a, b| b.1.cmp(&a.1));
    timings.truncate(5);

    info!("Slowest actions:");
    for (id, duration) in &timings {
        info!("    {:<40} {:.1?}", graph.action(*id).status_text(), duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_succeeds() {
        let mut graph = ActionGraph::new();
        let artifacts = ArtifactRegistry::new("/w");
        let report = LocalExecutor::new(4)
            .execute(&mut graph, &artifacts, &[], false)
            .unwrap();
        assert!(report.success);
        assert!(report.outcomes.is_empty());
        assert_eq!(report.executor, "local");
    }

    #[test]
    fn disconnected_channel_is_a_lost_worker() {
        let (tx, rx) = mpsc::channel::<Completion>();
        let worker = std::thread::spawn(move || drop(tx));
        worker.join().unwrap();
        assert!(matches!(next_completion(&rx), Err(ExecutorError::WorkerLost)));
    }

    #[test]
    fn limit_is_at_least_one() {
        assert_eq!(LocalExecutor::new(0).limit(), 1);
    }
}
