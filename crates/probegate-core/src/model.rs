//! Run request and run record types.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mutators::MutatorKind;

// --- Request side -----------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolMode {
    /// JSON POST to the endpoint.
    #[default]
    Http,
    /// JSON-RPC 2.0 `tools/call`.
    ToolCall,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetDescriptor {
    pub endpoint: String,
    /// Bearer token. Never serialized back out.
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub protocol: ProtocolMode,
    /// Tool name for `tool_call` targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl TargetDescriptor {
    pub fn http(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token: None,
            protocol: ProtocolMode::Http,
            tool_name: None,
        }
    }
}

impl fmt::Debug for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetDescriptor")
            .field("endpoint", &self.endpoint)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("protocol", &self.protocol)
            .field("tool_name", &self.tool_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseTemplate {
    pub id: String,
    pub input: String,
    /// Reference value handed to the evaluator (substring, pattern, answer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SuiteThresholds {
    /// Minimum evaluator score for a case to pass.
    pub min_score: f64,
    /// Fraction of evaluated cases that must pass.
    pub min_pass_rate: f64,
    /// Tolerated fraction of executed cases that errored.
    pub max_error_rate: f64,
}

impl Default for SuiteThresholds {
    fn default() -> Self {
        Self {
            min_score: 0.5,
            min_pass_rate: 1.0,
            max_error_rate: 0.0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_case_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    pub id: String,
    /// Name of a registered evaluator.
    pub evaluator: String,
    /// Whether a failure of this suite fails the gate.
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub thresholds: SuiteThresholds,
    #[serde(default = "default_case_concurrency")]
    pub case_concurrency: usize,
    /// Consult the fingerprint cache for this suite's cases.
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default)]
    pub mutators: Vec<MutatorKind>,
    pub cases: Vec<CaseTemplate>,
}

impl SuiteConfig {
    pub fn new(id: impl Into<String>, evaluator: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            evaluator: evaluator.into(),
            required: true,
            thresholds: SuiteThresholds::default(),
            case_concurrency: default_case_concurrency(),
            cache: true,
            mutators: Vec::new(),
            cases: Vec::new(),
        }
    }

    pub fn with_case(
        mut self,
        id: impl Into<String>,
        input: impl Into<String>,
        expected: Option<&str>,
    ) -> Self {
        self.cases.push(CaseTemplate {
            id: id.into(),
            input: input.into(),
            expected: expected.map(str::to_string),
        });
        self
    }
}

/// Admission identity: both keys must be admitted by their limiter.
#[derive(Clone, PartialEq, Eq)]
pub struct CallerKey {
    pub token: String,
    pub source_ip: IpAddr,
}

impl fmt::Debug for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerKey")
            .field("token", &"<redacted>")
            .field("source_ip", &self.source_ip)
            .finish()
    }
}

/// Immutable description of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub target: TargetDescriptor,
    /// Suites in requested order; the record lists them in this order.
    pub suites: Vec<SuiteConfig>,
    pub concurrency: usize,
    pub fail_fast: bool,
    pub caller: CallerKey,
    /// Seed for the deterministic mutators.
    pub seed: u64,
}

impl RunRequest {
    /// Structural checks; failures put the run into `Failed`.
    pub fn validate(&self, max_concurrency: usize) -> Result<(), String> {
        if self.suites.is_empty() {
            return Err("no suites requested".into());
        }
        if self.concurrency == 0 || self.concurrency > max_concurrency {
            return Err(format!(
                "concurrency must be within 1..={max_concurrency}, got {}",
                self.concurrency
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for suite in &self.suites {
            if suite.id.trim().is_empty() {
                return Err("suite id must not be empty".into());
            }
            if !seen.insert(suite.id.as_str()) {
                return Err(format!("duplicate suite id '{}'", suite.id));
            }
            if suite.case_concurrency == 0 {
                return Err(format!("suite '{}': case_concurrency must be > 0", suite.id));
            }
            let t = &suite.thresholds;
            for (name, v) in [
                ("min_score", t.min_score),
                ("min_pass_rate", t.min_pass_rate),
                ("max_error_rate", t.max_error_rate),
            ] {
                if !(0.0..=1.0).contains(&v) {
                    return Err(format!(
                        "suite '{}': {name} must be within 0..=1, got {v}",
                        suite.id
                    ));
                }
            }
        }
        Ok(())
    }
}

fn default_concurrency() -> usize {
    1
}

/// Run section of a gate file. Becomes a [`RunRequest`] once a caller is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunPlan {
    pub target: TargetDescriptor,
    pub suites: Vec<SuiteConfig>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub seed: u64,
}

impl RunPlan {
    pub fn into_request(self, caller: CallerKey) -> RunRequest {
        RunRequest {
            target: self.target,
            suites: self.suites,
            concurrency: self.concurrency,
            fail_fast: self.fail_fast,
            caller,
            seed: self.seed,
        }
    }
}

/// One generated test case.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    /// Position within the suite; results are ordered by it.
    pub index: usize,
    pub id: String,
    pub template_id: String,
    pub mutator: MutatorKind,
    pub input: String,
    pub expected: Option<String>,
}

// --- Record side ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(format!("run_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Cancelled)
                | (Self::Running, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteStatus {
    /// Not started yet.
    Pending,
    Passed,
    Failed,
    /// Not run: fail-fast halted scheduling, or every case was skipped.
    Skipped,
    /// Cancelled before finishing; carries no case results.
    Cancelled,
}

impl SuiteStatus {
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Passed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// Evaluated, score at or above threshold.
    Pass,
    /// Evaluated, score below threshold: the target answered incorrectly.
    Fail,
    /// Not evaluated: call or evaluator failure.
    Error,
    /// Not evaluated, not a failure (evaluator unavailable).
    Skipped,
}

/// Why a suite failed. Kept distinct so "target is down" is never read as
/// "target answered incorrectly".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Quality,
    TargetUnavailable,
    RequestRejected,
    EvaluatorError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseError {
    pub cause: FailureCause,
    /// Stable code, e.g. `circuit_open`, `target_timeout`, `evaluator_error`.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CaseError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Served from the fingerprint cache.
    pub reused: bool,
    pub latency_ms: u64,
    pub attempts: u32,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub cached: usize,
}

impl SuiteCounts {
    pub fn from_cases(cases: &[CaseResult]) -> Self {
        let mut c = SuiteCounts {
            total: cases.len(),
            ..Default::default()
        };
        for case in cases {
            match case.status {
                CaseStatus::Pass => c.passed += 1,
                CaseStatus::Fail => c.failed += 1,
                CaseStatus::Error => c.errored += 1,
                CaseStatus::Skipped => c.skipped += 1,
            }
            if case.reused {
                c.cached += 1;
            }
        }
        c
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub suite_id: String,
    pub required: bool,
    pub status: SuiteStatus,
    pub cases: Vec<CaseResult>,
    pub counts: SuiteCounts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_causes: Vec<FailureCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl SuiteResult {
    /// Placeholder for a suite with no results (yet).
    pub fn empty(suite_id: &str, required: bool, status: SuiteStatus) -> Self {
        Self {
            suite_id: suite_id.to_string(),
            required,
            status,
            cases: Vec::new(),
            counts: SuiteCounts::default(),
            failure_causes: Vec::new(),
            duration_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReason {
    pub suite_id: String,
    pub required: bool,
    pub status: SuiteStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<FailureCause>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub verdict: GateVerdict,
    /// Every suite that did not pass, in requested order.
    pub reasons: Vec<GateReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    Admitted,
    Started,
    SuiteStarted { suite_id: String },
    SuiteFinished { suite_id: String, status: SuiteStatus },
    SuiteSkipped { suite_id: String },
    FailFastTriggered { suite_id: String },
    CancelRequested,
    Failed { reason: String },
    Finished { status: RunStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Strictly increasing within a run.
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

/// Aggregate owned by the orchestrator for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub status: RunStatus,
    pub target_endpoint: String,
    pub seed: u64,
    pub fail_fast: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// One entry per requested suite, in requested order.
    pub suites: Vec<SuiteResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub events: Vec<RunEvent>,
}

impl RunRecord {
    pub fn new(run_id: RunId, request: &RunRequest) -> Self {
        Self {
            run_id,
            status: RunStatus::Pending,
            target_endpoint: request.target.endpoint.clone(),
            seed: request.seed,
            fail_fast: request.fail_fast,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            suites: request
                .suites
                .iter()
                .map(|s| SuiteResult::empty(&s.id, s.required, SuiteStatus::Pending))
                .collect(),
            gate: None,
            failure: None,
            events: Vec::new(),
        }
    }

    pub fn push_event(&mut self, kind: RunEventKind) {
        let seq = self.events.last().map(|e| e.seq + 1).unwrap_or(1);
        self.events.push(RunEvent {
            seq,
            at: Utc::now(),
            kind,
        });
    }

    /// Move to `next` if the state machine allows it. Returns whether it moved.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match next {
            RunStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => {
                self.finished_at = Some(Utc::now());
                self.push_event(RunEventKind::Finished { status: s });
            }
            _ => {}
        }
        true
    }

    pub fn completed_suites(&self) -> impl Iterator<Item = &SuiteResult> {
        self.suites.iter().filter(|s| s.status.is_completed())
    }
}
