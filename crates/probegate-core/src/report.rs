//! Reporting seams: progress callbacks and the sink that receives finished
//! run records. Formatting (JSON files, console) belongs to the caller.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;

use crate::model::{RunId, RunRecord, SuiteStatus};

/// Emitted each time a suite reaches a final status, in completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub run_id: RunId,
    pub suite_id: String,
    pub status: SuiteStatus,
    pub done: usize,
    pub total: usize,
}

pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Receives every run record once it is terminal (partial records included).
/// A publish error is logged by the orchestrator and never changes the run.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, record: &RunRecord) -> anyhow::Result<()>;
}

/// Logs a one-line summary per finished run.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn publish(&self, record: &RunRecord) -> anyhow::Result<()> {
        let completed = record.completed_suites().count();
        info!(
            run_id = %record.run_id,
            status = ?record.status,
            verdict = ?record.gate.as_ref().map(|g| g.verdict),
            suites = record.suites.len(),
            completed,
            "run finished"
        );
        Ok(())
    }
}

/// Keeps published records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<RunRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RunRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn publish(&self, record: &RunRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
