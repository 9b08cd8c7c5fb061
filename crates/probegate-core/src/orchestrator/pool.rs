//! Worker pool for one run.
//!
//! `concurrency` workers pull the next unstarted suite from a shared index.
//! Completion order is whatever it is; every result is written to the slot
//! of its suite, so the record stays in requested order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{gate, RunState, Shared};
use crate::client::ResilientClient;
use crate::error::{GateError, GateResult};
use crate::model::{RunEventKind, RunRequest, RunStatus, SuiteConfig, SuiteResult, SuiteStatus};
use crate::report::{ProgressEvent, ProgressSink};
use crate::suite::SuiteRunner;

pub(super) async fn drive(shared: Arc<Shared>, state: Arc<RunState>, request: RunRequest) {
    {
        let mut record = state.record();
        record.transition(RunStatus::Running);
        record.push_event(RunEventKind::Started);
    }

    match prepare(&shared, &request) {
        Ok(runner) => execute(&shared, &state, runner, request).await,
        Err(e) => {
            warn!(run_id = %state.run_id, error = %e, "run failed before scheduling");
            let mut record = state.record();
            record.failure = Some(e.to_string());
            record.push_event(RunEventKind::Failed {
                reason: e.to_string(),
            });
            record.transition(RunStatus::Failed);
        }
    }

    let record = state.snapshot();
    if let Err(e) = shared.sink.publish(&record).await {
        warn!(run_id = %state.run_id, error = %e, "report sink failed");
    }
    state.done.send_replace(true);
}

/// Orchestrator-level checks. Any error here fails the run.
fn prepare(shared: &Shared, request: &RunRequest) -> GateResult<SuiteRunner> {
    request
        .validate(shared.config.max_concurrency)
        .map_err(|message| GateError::InvalidRequest { message })?;
    let adapter = shared.connector.connect(&request.target)?;
    let breaker = shared.breakers.get(adapter.endpoint());
    let client = ResilientClient::new(adapter, breaker, shared.config.retry.clone());
    Ok(SuiteRunner::new(
        client,
        shared.evaluators.clone(),
        shared.cache.clone(),
    ))
}

async fn execute(shared: &Shared, state: &Arc<RunState>, runner: SuiteRunner, request: RunRequest) {
    let workers = request.concurrency.min(request.suites.len()).max(1);
    let pool = Arc::new(Pool {
        state: state.clone(),
        runner,
        seed: request.seed,
        fail_fast: request.fail_fast,
        total: request.suites.len(),
        suites: request.suites,
        next: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
        halted: AtomicBool::new(false),
        progress: shared.progress.clone(),
    });

    let mut join_set = JoinSet::new();
    for worker in 0..workers {
        let pool = pool.clone();
        join_set.spawn(async move { pool.work(worker).await });
    }
    while let Some(joined) = join_set.join_next().await {
        if let Err(e) = joined {
            error!(run_id = %state.run_id, error = %e, "suite worker failed");
        }
    }

    pool.finalize();
}

struct Pool {
    state: Arc<RunState>,
    runner: SuiteRunner,
    suites: Vec<SuiteConfig>,
    seed: u64,
    fail_fast: bool,
    total: usize,
    next: AtomicUsize,
    finished: AtomicUsize,
    /// Set by fail-fast: no new suite is started once true.
    halted: AtomicBool,
    progress: Option<ProgressSink>,
}

impl Pool {
    async fn work(&self, worker: usize) {
        loop {
            // Suite-start checkpoint.
            if self.state.cancel.is_cancelled() || self.halted.load(Ordering::Acquire) {
                break;
            }
            let index = self.next.fetch_add(1, Ordering::AcqRel);
            let Some(suite) = self.suites.get(index) else {
                break;
            };

            self.state.record().push_event(RunEventKind::SuiteStarted {
                suite_id: suite.id.clone(),
            });
            debug!(run_id = %self.state.run_id, worker, suite = %suite.id, "suite started");

            let outcome = self.runner.run(suite, self.seed, &self.state.cancel).await;
            match outcome {
                Ok(result) => self.complete(index, result),
                Err(_) => {
                    debug!(run_id = %self.state.run_id, suite = %suite.id, "suite cancelled");
                    if let Some(slot) = self.state.record().suites.get_mut(index) {
                        slot.status = SuiteStatus::Cancelled;
                    }
                }
            }
        }
    }

    fn complete(&self, index: usize, result: SuiteResult) {
        let suite_id = result.suite_id.clone();
        let status = result.status;
        let trip = self.fail_fast && result.required && status == SuiteStatus::Failed;

        {
            let mut record = self.state.record();
            if let Some(slot) = record.suites.get_mut(index) {
                *slot = result;
            }
            record.push_event(RunEventKind::SuiteFinished {
                suite_id: suite_id.clone(),
                status,
            });
            if trip && !self.halted.swap(true, Ordering::AcqRel) {
                record.push_event(RunEventKind::FailFastTriggered {
                    suite_id: suite_id.clone(),
                });
                info!(run_id = %self.state.run_id, suite = %suite_id, "fail-fast: no further suites will start");
            }
        }

        let done = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(progress) = &self.progress {
            progress(ProgressEvent {
                run_id: self.state.run_id.clone(),
                suite_id,
                status,
                done,
                total: self.total,
            });
        }
    }

    /// Settle unstarted suites and pick the terminal status.
    fn finalize(&self) {
        let cancelled = self.state.cancel.is_cancelled();
        let mut record = self.state.record();

        let mut skipped = Vec::new();
        for suite in record.suites.iter_mut() {
            if suite.status == SuiteStatus::Pending {
                if cancelled {
                    suite.status = SuiteStatus::Cancelled;
                } else {
                    suite.status = SuiteStatus::Skipped;
                    skipped.push(suite.suite_id.clone());
                }
            }
        }
        for suite_id in skipped {
            record.push_event(RunEventKind::SuiteSkipped { suite_id });
        }

        if record.suites.iter().any(|s| s.status == SuiteStatus::Cancelled) {
            record.transition(RunStatus::Cancelled);
        } else {
            let decision = gate::decide(&record.suites);
            info!(
                run_id = %self.state.run_id,
                verdict = ?decision.verdict,
                reasons = decision.reasons.len(),
                "gate decided"
            );
            record.gate = Some(decision);
            record.transition(RunStatus::Completed);
        }
    }
}
