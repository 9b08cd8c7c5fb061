//! Run lifecycle: admission, scheduling, cancellation, gating.
//!
//! ```text
//! start_run --admission denied--> Err(Throttled)   (no record is created)
//!     |
//!  Pending --> Running --+--> Completed   all scheduled suites finished, gate applied
//!                        +--> Cancelled   cancel() observed before every suite finished
//!                        +--> Failed      bad request or target descriptor
//! ```
//!
//! The orchestrator is the only writer of a [`RunRecord`]. All shared
//! engine state (limiters, breakers, cache) is owned here and handed to
//! each run explicitly.

pub mod gate;
mod pool;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::CacheStats;
use crate::cancel::CancelToken;
use crate::circuit_breaker::{BreakerRegistry, CircuitSnapshot};
use crate::config::EngineConfig;
use crate::error::{GateError, GateResult};
use crate::evaluator::EvaluatorRegistry;
use crate::model::{RunEventKind, RunId, RunRecord, RunRequest};
use crate::rate_limit::Admission;
use crate::report::{LogSink, ProgressSink, ReportSink};
use crate::suite::EvaluationCache;
use crate::target::{HttpConnector, TargetConnector};

/// Per-run state shared between the control surface and the run's workers.
struct RunState {
    run_id: RunId,
    record: Mutex<RunRecord>,
    cancel: CancelToken,
    done: watch::Sender<bool>,
}

impl RunState {
    fn record(&self) -> MutexGuard<'_, RunRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> RunRecord {
        self.record().clone()
    }
}

struct Shared {
    config: EngineConfig,
    admission: Admission,
    breakers: BreakerRegistry,
    cache: Arc<EvaluationCache>,
    evaluators: Arc<EvaluatorRegistry>,
    connector: Arc<dyn TargetConnector>,
    sink: Arc<dyn ReportSink>,
    progress: Option<ProgressSink>,
    runs: Mutex<HashMap<RunId, Arc<RunState>>>,
}

impl Shared {
    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, Arc<RunState>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct OrchestratorBuilder {
    config: EngineConfig,
    connector: Option<Arc<dyn TargetConnector>>,
    evaluators: EvaluatorRegistry,
    sink: Option<Arc<dyn ReportSink>>,
    progress: Option<ProgressSink>,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            connector: None,
            evaluators: EvaluatorRegistry::with_builtins(),
            sink: None,
            progress: None,
        }
    }

    /// Defaults to [`HttpConnector`].
    pub fn connector(mut self, connector: Arc<dyn TargetConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Defaults to the built-in evaluators.
    pub fn evaluators(mut self, evaluators: EvaluatorRegistry) -> Self {
        self.evaluators = evaluators;
        self
    }

    /// Defaults to [`LogSink`].
    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn progress(mut self, progress: ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Validates the configuration. Inside a tokio runtime this also starts
    /// the cache sweeper and idle-bucket pruning; both stop once the
    /// orchestrator is dropped.
    pub fn build(self) -> GateResult<Orchestrator> {
        self.config.validate()?;
        let connector = match self.connector {
            Some(c) => c,
            None => Arc::new(HttpConnector::new()?),
        };
        let shared = Arc::new(Shared {
            admission: Admission::new(&self.config.rate_limit),
            breakers: BreakerRegistry::new(&self.config),
            cache: Arc::new(EvaluationCache::new(self.config.cache.ttl())),
            evaluators: Arc::new(self.evaluators),
            connector,
            sink: self.sink.unwrap_or_else(|| Arc::new(LogSink)),
            progress: self.progress,
            runs: Mutex::new(HashMap::new()),
            config: self.config,
        });
        spawn_maintenance(&shared);
        Ok(Orchestrator { shared })
    }
}

fn spawn_maintenance(shared: &Arc<Shared>) {
    if tokio::runtime::Handle::try_current().is_err() {
        debug!("no tokio runtime, background maintenance disabled");
        return;
    }
    let every = shared.config.cache.sweep_interval();
    shared.cache.spawn_sweeper(every);

    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else { break };
            shared.admission.prune_idle();
        }
    });
}

/// Handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.shared.config)
            .field("runs", &self.shared.runs().len())
            .finish()
    }
}

impl Orchestrator {
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Admit and start a run. Denied admission returns `Throttled` before any
    /// record exists; everything after admission is reported on the record.
    pub async fn start_run(&self, request: RunRequest) -> GateResult<RunId> {
        let decision = self.shared.admission.admit(&request.caller);
        if !decision.allowed {
            warn!(
                source_ip = %request.caller.source_ip,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "run throttled"
            );
            return Err(GateError::Throttled {
                retry_after: decision.retry_after,
            });
        }

        let run_id = RunId::generate();
        let mut record = RunRecord::new(run_id.clone(), &request);
        record.push_event(RunEventKind::Admitted);
        let (done, _) = watch::channel(false);
        let state = Arc::new(RunState {
            run_id: run_id.clone(),
            record: Mutex::new(record),
            cancel: CancelToken::new(),
            done,
        });
        self.shared.runs().insert(run_id.clone(), state.clone());

        info!(
            run_id = %run_id,
            target = %request.target.endpoint,
            suites = request.suites.len(),
            concurrency = request.concurrency,
            fail_fast = request.fail_fast,
            "run admitted"
        );
        tokio::spawn(pool::drive(self.shared.clone(), state, request));
        Ok(run_id)
    }

    fn lookup(&self, run_id: &RunId) -> GateResult<Arc<RunState>> {
        self.shared
            .runs()
            .get(run_id)
            .cloned()
            .ok_or_else(|| GateError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Request cooperative cancellation. Idempotent; a no-op on finished runs.
    pub fn cancel(&self, run_id: &RunId) -> GateResult<()> {
        let state = self.lookup(run_id)?;
        let mut record = state.record();
        if record.status.is_terminal() || state.cancel.is_cancelled() {
            return Ok(());
        }
        record.push_event(RunEventKind::CancelRequested);
        state.cancel.cancel();
        info!(run_id = %run_id, "cancellation requested");
        Ok(())
    }

    pub fn status(&self, run_id: &RunId) -> GateResult<RunRecord> {
        Ok(self.lookup(run_id)?.snapshot())
    }

    /// Resolves with the record once the run is terminal and published.
    pub async fn wait(&self, run_id: &RunId) -> GateResult<RunRecord> {
        let state = self.lookup(run_id)?;
        let mut done = state.done.subscribe();
        // The sender lives in `state`, which we hold: the channel cannot close.
        let _ = done.wait_for(|finished| *finished).await;
        Ok(state.snapshot())
    }

    /// Remove a finished record, handing it back. Active runs are refused.
    pub fn evict(&self, run_id: &RunId) -> GateResult<RunRecord> {
        let mut runs = self.shared.runs();
        let state = runs.get(run_id).ok_or_else(|| GateError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        let record = state.snapshot();
        if !record.status.is_terminal() {
            return Err(GateError::RunActive {
                run_id: run_id.to_string(),
            });
        }
        runs.remove(run_id);
        debug!(run_id = %run_id, "run evicted");
        Ok(record)
    }

    pub fn run_ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.shared.runs().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn breakers(&self) -> Vec<(String, CircuitSnapshot)> {
        self.shared.breakers.snapshot()
    }
}
