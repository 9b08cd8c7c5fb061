//! Resilient test orchestration for AI quality gates.
//!
//! Drives suites of probes against a target endpoint, scores the responses
//! and derives a pass/fail gate. This crate provides:
//!
//! - Run admission via dual token-bucket rate limiting (caller token + IP)
//! - Per-endpoint circuit breakers with single-probe half-open recovery
//! - Timeout + jittered retry around every target call
//! - Single-flight fingerprint cache for repeated evaluations
//! - Bounded suite and case concurrency with cooperative cancellation
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use probegate_core::{
//!     CallerKey, EngineConfig, Orchestrator, RunRequest, SuiteConfig, TargetDescriptor,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let orchestrator = Orchestrator::builder(EngineConfig::default()).build()?;
//!
//! let request = RunRequest {
//!     target: TargetDescriptor::http("http://localhost:8080/answer"),
//!     suites: vec![SuiteConfig::new("capitals", "contains")
//!         .with_case("fr", "What is the capital of France?", Some("Paris"))],
//!     concurrency: 1,
//!     fail_fast: false,
//!     caller: CallerKey {
//!         token: "ci".into(),
//!         source_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
//!     },
//!     seed: 42,
//! };
//!
//! let run_id = orchestrator.start_run(request).await?;
//! let record = orchestrator.wait(&run_id).await?;
//! println!("{:?}", record.gate.map(|g| g.verdict));
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! See [`config`] for the gate file format and environment overrides.

pub mod cache;
pub mod cancel;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod fingerprint;
pub mod model;
pub mod mutators;
pub mod orchestrator;
pub mod rate_limit;
pub mod report;
pub mod suite;
pub mod target;

#[cfg(test)]
mod test_support;

pub use cache::{CacheError, CacheStats, FingerprintCache};
pub use cancel::CancelToken;
pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use client::{Delivery, ResilientClient};
pub use config::{load_gate_file, EngineConfig, GateFile, GATE_FILE_VERSION};
pub use error::{CallError, EvalError, GateError, GateResult};
pub use evaluator::{Evaluator, EvaluatorRegistry, Score};
pub use model::{
    CallerKey, CaseResult, CaseStatus, FailureCause, GateDecision, GateVerdict, RunId, RunPlan,
    RunRecord, RunRequest, RunStatus, SuiteConfig, SuiteResult, SuiteStatus, TargetDescriptor,
};
pub use mutators::MutatorKind;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use rate_limit::{Admission, Decision, RateLimiter};
pub use report::{LogSink, MemorySink, ProgressEvent, ProgressSink, ReportSink};
pub use suite::SuiteRunner;
pub use target::{HttpConnector, TargetAdapter, TargetConnector, TargetRequest, TargetResponse};
