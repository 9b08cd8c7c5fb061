//! Run record output: JSON file sink and the console summary.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use probegate_core::model::CaseStatus;
use probegate_core::{GateVerdict, ProgressEvent, ReportSink, RunRecord, RunStatus, SuiteStatus};

/// Writes the record as pretty JSON. Partial records are written too.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ReportSink for JsonFileSink {
    async fn publish(&self, record: &RunRecord) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), "run record written");
        Ok(())
    }
}

pub fn print_progress(event: ProgressEvent) {
    eprintln!(
        "[{}/{}] {} {}",
        event.done,
        event.total,
        status_label(event.status),
        event.suite_id
    );
}

fn status_label(status: SuiteStatus) -> &'static str {
    match status {
        SuiteStatus::Pending => "PENDING",
        SuiteStatus::Passed => "PASS",
        SuiteStatus::Failed => "FAIL",
        SuiteStatus::Skipped => "SKIP",
        SuiteStatus::Cancelled => "CANCELLED",
    }
}

/// Console summary on stdout: one line per suite, then the verdict.
pub fn print_summary(record: &RunRecord) {
    println!("run {} ({:?})", record.run_id, record.status);
    for suite in &record.suites {
        let c = &suite.counts;
        let mut line = format!(
            "  {:<9} {}{}",
            status_label(suite.status),
            suite.suite_id,
            if suite.required { "" } else { " (optional)" }
        );
        if c.total > 0 {
            line.push_str(&format!(
                "  pass={} fail={} error={} skip={} cached={}",
                c.passed, c.failed, c.errored, c.skipped, c.cached
            ));
        }
        if !suite.failure_causes.is_empty() {
            let causes: Vec<String> = suite
                .failure_causes
                .iter()
                .map(|c| format!("{c:?}"))
                .collect();
            line.push_str(&format!("  causes: {}", causes.join(", ")));
        }
        println!("{line}");

        for case in suite.cases.iter().filter(|c| c.status == CaseStatus::Error) {
            if let Some(err) = &case.error {
                println!("      {} [{}] {}", case.case_id, err.code, err.message);
            }
        }
    }

    match (&record.gate, record.status) {
        (Some(gate), _) => {
            let verdict = match gate.verdict {
                GateVerdict::Pass => "PASS",
                GateVerdict::Fail => "FAIL",
            };
            println!("gate: {verdict}");
        }
        (None, RunStatus::Failed) => println!(
            "gate: not decided, run failed: {}",
            record.failure.as_deref().unwrap_or("unknown error")
        ),
        (None, _) => println!("gate: not decided (run {:?})", record.status),
    }
}
