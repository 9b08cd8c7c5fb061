//! Suite execution: generate cases, run them under a per-suite limit,
//! score through the fingerprint cache, judge the suite.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, FingerprintCache};
use crate::cancel::CancelToken;
use crate::client::ResilientClient;
use crate::error::{CallError, EvalError};
use crate::evaluator::{Evaluator, EvaluatorRegistry};
use crate::fingerprint::{self, Fingerprint};
use crate::model::{
    CaseError, CaseResult, CaseStatus, FailureCause, SuiteConfig, SuiteCounts, SuiteResult,
    SuiteStatus, SuiteThresholds, TestCase,
};
use crate::mutators::generate_cases;
use crate::target::TargetRequest;

pub const SKIP_EVALUATOR_UNAVAILABLE: &str = "evaluator_unavailable";

/// What the cache stores: a scored response.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub response: String,
    pub score: f64,
    pub label: String,
    pub details: serde_json::Value,
    pub attempts: u32,
}

/// Why a case produced no score. Shared with single-flight followers,
/// never cached.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseFault {
    Call(CallError),
    Eval {
        error: EvalError,
        response: String,
        attempts: u32,
    },
}

pub type EvaluationCache = FingerprintCache<Evaluation, CaseFault>;

#[derive(Debug, Clone, Copy)]
struct CasePolicy {
    cache: bool,
    min_score: f64,
}

#[derive(Clone)]
pub struct SuiteRunner {
    client: ResilientClient,
    evaluators: Arc<EvaluatorRegistry>,
    cache: Arc<EvaluationCache>,
}

impl std::fmt::Debug for SuiteRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteRunner")
            .field("endpoint", &self.client.endpoint())
            .field("evaluators", &self.evaluators)
            .finish()
    }
}

impl SuiteRunner {
    pub fn new(
        client: ResilientClient,
        evaluators: Arc<EvaluatorRegistry>,
        cache: Arc<EvaluationCache>,
    ) -> Self {
        Self {
            client,
            evaluators,
            cache,
        }
    }

    /// Runs every case of `suite`. A case failure never aborts the suite.
    ///
    /// Returns `Err(CallError::Cancelled)` if cancellation was observed
    /// before every case finished; a cancelled suite has no result.
    pub async fn run(
        &self,
        suite: &SuiteConfig,
        seed: u64,
        cancel: &CancelToken,
    ) -> Result<SuiteResult, CallError> {
        cancel.checkpoint()?;
        let started = Instant::now();
        let cases = generate_cases(suite, seed);

        let results = match self.evaluators.get(&suite.evaluator) {
            None => {
                warn!(
                    suite = %suite.id,
                    evaluator = %suite.evaluator,
                    "evaluator not registered, skipping suite cases"
                );
                cases
                    .iter()
                    .map(|case| self.unavailable(case, &suite.evaluator))
                    .collect()
            }
            Some(evaluator) => self.run_cases(suite, evaluator, &cases, cancel).await?,
        };

        let (status, failure_causes) = judge(&suite.thresholds, &results);
        let counts = SuiteCounts::from_cases(&results);
        info!(
            suite = %suite.id,
            status = ?status,
            total = counts.total,
            passed = counts.passed,
            failed = counts.failed,
            errored = counts.errored,
            cached = counts.cached,
            "suite finished"
        );

        Ok(SuiteResult {
            suite_id: suite.id.clone(),
            required: suite.required,
            status,
            cases: results,
            counts,
            failure_causes,
            duration_ms: Some(started.elapsed().as_millis() as u64),
        })
    }

    async fn run_cases(
        &self,
        suite: &SuiteConfig,
        evaluator: Arc<dyn Evaluator>,
        cases: &[TestCase],
        cancel: &CancelToken,
    ) -> Result<Vec<CaseResult>, CallError> {
        let policy = CasePolicy {
            cache: suite.cache,
            min_score: suite.thresholds.min_score,
        };
        let sem = Arc::new(Semaphore::new(suite.case_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for case in cases {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                p = sem.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let this = self.clone();
            let evaluator = evaluator.clone();
            let case = case.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let index = case.index;
                (index, this.run_case(policy, evaluator, case, &cancel).await)
            });
        }

        let mut slots: Vec<Option<CaseResult>> = vec![None; cases.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Some(result))) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(result);
                    }
                }
                Ok((_, None)) => {}
                Err(e) => warn!(suite = %suite.id, error = %e, "case task failed"),
            }
        }

        // A cancel that lands after every case settled keeps the suite.
        if cancel.is_cancelled() && slots.iter().any(Option::is_none) {
            debug!(suite = %suite.id, "suite cancelled, discarding partial cases");
            return Err(CallError::Cancelled);
        }

        // Reorder by case index; a slot left empty means its task panicked.
        Ok(cases
            .iter()
            .zip(slots)
            .map(|(case, slot)| {
                slot.unwrap_or_else(|| {
                    let mut r = blank(case, String::new());
                    r.status = CaseStatus::Error;
                    r.error = Some(CaseError {
                        cause: FailureCause::EvaluatorError,
                        code: "internal".into(),
                        message: "case task aborted".into(),
                        status: None,
                    });
                    r
                })
            })
            .collect())
    }

    /// `None` when cancellation stopped the case.
    async fn run_case(
        &self,
        policy: CasePolicy,
        evaluator: Arc<dyn Evaluator>,
        case: TestCase,
        cancel: &CancelToken,
    ) -> Option<CaseResult> {
        if cancel.is_cancelled() {
            return None;
        }
        let started = Instant::now();
        let fp = self.fingerprint(&case, evaluator.name());

        let compute = || self.evaluate(evaluator.as_ref(), &case, cancel);
        let outcome = if policy.cache {
            self.cache.get_or_compute(&fp, cancel, compute).await
        } else {
            compute()
                .await
                .map(|evaluation| (evaluation, false))
                .map_err(CacheError::Compute)
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut result = blank(&case, fp.hex);
        result.latency_ms = latency_ms;
        match outcome {
            Err(CacheError::Cancelled)
            | Err(CacheError::Compute(CaseFault::Call(CallError::Cancelled))) => return None,
            Ok((evaluation, reused)) => {
                result.status = if evaluation.score >= policy.min_score {
                    CaseStatus::Pass
                } else {
                    CaseStatus::Fail
                };
                result.response = Some(evaluation.response);
                result.score = Some(evaluation.score);
                result.label = Some(evaluation.label);
                result.details = evaluation.details;
                result.reused = reused;
                result.attempts = if reused { 0 } else { evaluation.attempts };
            }
            Err(CacheError::Compute(CaseFault::Call(err))) => {
                result.status = CaseStatus::Error;
                result.error = Some(call_error(&err));
            }
            Err(CacheError::Compute(CaseFault::Eval {
                error,
                response,
                attempts,
            })) => {
                result.response = Some(response);
                result.attempts = attempts;
                match error {
                    EvalError::Unavailable { reason } => {
                        result.status = CaseStatus::Skipped;
                        result.skip_reason = Some(SKIP_EVALUATOR_UNAVAILABLE.into());
                        result.details = serde_json::json!({ "reason": reason });
                    }
                    EvalError::Failed { message } => {
                        result.status = CaseStatus::Error;
                        result.error = Some(CaseError {
                            cause: FailureCause::EvaluatorError,
                            code: "evaluator_error".into(),
                            message,
                            status: None,
                        });
                    }
                }
            }
        }
        Some(result)
    }

    async fn evaluate(
        &self,
        evaluator: &dyn Evaluator,
        case: &TestCase,
        cancel: &CancelToken,
    ) -> Result<Evaluation, CaseFault> {
        let request = TargetRequest {
            case_id: case.id.clone(),
            input: case.input.clone(),
        };
        let delivery = self
            .client
            .call(&request, cancel)
            .await
            .map_err(CaseFault::Call)?;
        match evaluator.score(case, &delivery.response).await {
            Ok(score) => Ok(Evaluation {
                response: delivery.response.text,
                score: score.value,
                label: score.label,
                details: score.details,
                attempts: delivery.attempts,
            }),
            Err(error) => Err(CaseFault::Eval {
                error,
                response: delivery.response.text,
                attempts: delivery.attempts,
            }),
        }
    }

    fn fingerprint(&self, case: &TestCase, evaluator: &str) -> Fingerprint {
        let provider = fingerprint::provider_id(&self.client.provider_id(), evaluator);
        fingerprint::compute(&provider, &case.input, case.expected.as_deref())
    }

    fn unavailable(&self, case: &TestCase, evaluator: &str) -> CaseResult {
        let mut r = blank(case, self.fingerprint(case, evaluator).hex);
        r.status = CaseStatus::Skipped;
        r.skip_reason = Some(SKIP_EVALUATOR_UNAVAILABLE.into());
        r.details = serde_json::json!({ "reason": format!("evaluator '{evaluator}' is not registered") });
        r
    }
}

fn blank(case: &TestCase, fingerprint: String) -> CaseResult {
    CaseResult {
        case_id: case.id.clone(),
        input: case.input.clone(),
        response: None,
        error: None,
        score: None,
        label: None,
        details: serde_json::Value::Null,
        status: CaseStatus::Skipped,
        skip_reason: None,
        reused: false,
        latency_ms: 0,
        attempts: 0,
        fingerprint,
    }
}

fn call_error(err: &CallError) -> CaseError {
    let cause = match err {
        CallError::NonTransient { .. } => FailureCause::RequestRejected,
        _ => FailureCause::TargetUnavailable,
    };
    CaseError {
        cause,
        code: err.code().into(),
        message: err.to_string(),
        status: err.status(),
    }
}

/// Suite verdict from its cases.
///
/// - Skipped cases are neither failures nor part of any rate.
/// - Error rate is over executed (non-skipped) cases; exceeding
///   `max_error_rate` fails the suite with the errors' causes.
/// - Pass rate is over evaluated (pass + fail) cases; falling below
///   `min_pass_rate` fails the suite with `Quality`.
/// - A suite with nothing executed is `Skipped`.
pub fn judge(thresholds: &SuiteThresholds, cases: &[CaseResult]) -> (SuiteStatus, Vec<FailureCause>) {
    let counts = SuiteCounts::from_cases(cases);
    let executed = counts.total - counts.skipped;
    if executed == 0 {
        return (SuiteStatus::Skipped, Vec::new());
    }

    let mut causes = BTreeSet::new();
    let error_rate = counts.errored as f64 / executed as f64;
    if error_rate > thresholds.max_error_rate {
        causes.extend(cases.iter().filter_map(|c| c.error.as_ref().map(|e| e.cause)));
    }

    let evaluated = counts.passed + counts.failed;
    if evaluated > 0 {
        let pass_rate = counts.passed as f64 / evaluated as f64;
        if pass_rate < thresholds.min_pass_rate {
            causes.insert(FailureCause::Quality);
        }
    }

    if causes.is_empty() {
        (SuiteStatus::Passed, Vec::new())
    } else {
        (SuiteStatus::Failed, causes.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::config::{BreakerConfig, RetryConfig};
    use crate::error::{RejectKind, TransientKind};
    use crate::mutators::MutatorKind;
    use crate::test_support::FnTarget;
    use crate::target::TargetResponse;
    use std::time::Duration;

    fn runner(target: Arc<FnTarget>) -> SuiteRunner {
        let breaker = Arc::new(CircuitBreaker::new(
            "http://target.test",
            BreakerConfig::default(),
        ));
        let retry = RetryConfig {
            max_retries: 0,
            jitter_ms: 0,
            ..RetryConfig::default()
        };
        SuiteRunner::new(
            ResilientClient::new(target, breaker, retry),
            Arc::new(EvaluatorRegistry::with_builtins()),
            Arc::new(EvaluationCache::new(Duration::from_secs(60))),
        )
    }

    fn capital_suite() -> SuiteConfig {
        SuiteConfig::new("capitals", "contains")
            .with_case("fr", "capital of France?", Some("Paris"))
            .with_case("de", "capital of Germany?", Some("Berlin"))
            .with_case("it", "capital of Italy?", Some("Rome"))
    }

    fn oracle() -> Arc<FnTarget> {
        FnTarget::new(|req| {
            let answer = if req.input.contains("France") {
                "Paris"
            } else if req.input.contains("Germany") {
                "Berlin"
            } else {
                "no idea"
            };
            Ok(TargetResponse::text(answer))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_case_order_and_quality_failures_are_labelled() {
        let suite = capital_suite();
        let result = runner(oracle())
            .run(&suite, 42, &CancelToken::new())
            .await
            .unwrap();
        let ids: Vec<_> = result.cases.iter().map(|c| c.case_id.as_str()).collect();
        assert_eq!(ids, vec!["fr", "de", "it"]);
        assert_eq!(result.status, SuiteStatus::Failed);
        assert_eq!(result.failure_causes, vec![FailureCause::Quality]);
        assert_eq!((result.counts.passed, result.counts.failed), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_fingerprints_are_reused() {
        let target = oracle();
        let runner = runner(target.clone());
        let suite = capital_suite();
        runner.run(&suite, 1, &CancelToken::new()).await.unwrap();
        let again = runner.run(&suite, 1, &CancelToken::new()).await.unwrap();
        assert!(again.cases.iter().all(|c| c.reused));
        assert_eq!(again.counts.cached, 3);
        assert_eq!(target.calls(), 3);

        let mut uncached = suite.clone();
        uncached.cache = false;
        let fresh = runner.run(&uncached, 1, &CancelToken::new()).await.unwrap();
        assert!(fresh.cases.iter().all(|c| !c.reused));
        assert_eq!(target.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn target_faults_are_not_read_as_quality() {
        let target = FnTarget::new(|req| {
            if req.case_id == "fr" {
                Err(CallError::transient(TransientKind::Server, "503"))
            } else {
                Err(CallError::rejected(RejectKind::Unauthorized, "401"))
            }
        });
        let suite = capital_suite();
        let result = runner(target).run(&suite, 0, &CancelToken::new()).await.unwrap();
        assert_eq!(result.status, SuiteStatus::Failed);
        assert_eq!(
            result.failure_causes,
            vec![FailureCause::TargetUnavailable, FailureCause::RequestRejected]
        );
        assert_eq!(result.counts.errored, 3);
        let first = result.cases[0].error.as_ref().unwrap();
        assert_eq!(first.code, "target_server");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_evaluator_skips_without_calling_the_target() {
        let target = oracle();
        let mut suite = capital_suite();
        suite.evaluator = "semantic_similarity".into();
        let result = runner(target.clone())
            .run(&suite, 0, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, SuiteStatus::Skipped);
        assert!(result
            .cases
            .iter()
            .all(|c| c.skip_reason.as_deref() == Some(SKIP_EVALUATOR_UNAVAILABLE)));
        assert_eq!(target.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn evaluator_failures_are_their_own_cause() {
        let suite = SuiteConfig::new("pattern", "regex").with_case("bad", "q", Some("("));
        let result = runner(oracle()).run(&suite, 0, &CancelToken::new()).await.unwrap();
        assert_eq!(result.failure_causes, vec![FailureCause::EvaluatorError]);
        assert_eq!(result.cases[0].response.as_deref(), Some("no idea"));
    }

    #[tokio::test(start_paused = true)]
    async fn mutators_expand_cases_deterministically() {
        let mut suite = capital_suite();
        suite.mutators = vec![MutatorKind::Uppercase, MutatorKind::Typo];
        let runner = runner(oracle());
        let a = runner.run(&suite, 7, &CancelToken::new()).await.unwrap();
        let b = runner.run(&suite, 7, &CancelToken::new()).await.unwrap();
        assert_eq!(a.cases.len(), 9);
        let inputs = |r: &SuiteResult| r.cases.iter().map(|c| c.input.clone()).collect::<Vec<_>>();
        assert_eq!(inputs(&a), inputs(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_discards_the_partial_suite() {
        let target = FnTarget::slow(Duration::from_secs(5), |_| Ok(TargetResponse::text("Paris")));
        let runner = runner(target);
        let cancel = CancelToken::new();
        let suite = capital_suite();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(&suite, 0, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap_err(), CallError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_every_case_settled_keeps_the_suite() {
        let cancel = CancelToken::new();
        let target = {
            let cancel = cancel.clone();
            FnTarget::new(move |req| {
                if req.case_id == "it" {
                    cancel.cancel();
                }
                Ok(TargetResponse::text("Paris Berlin Rome"))
            })
        };
        let mut suite = capital_suite();
        suite.case_concurrency = 1;
        let result = runner(target).run(&suite, 0, &cancel).await.unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(result.cases.len(), 3);
        assert_eq!(result.counts.passed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn whitespace_noise_variant_reaches_the_target() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let target = {
            let seen = seen.clone();
            FnTarget::new(move |req| {
                seen.lock().unwrap().push(req.input.clone());
                Ok(TargetResponse::text("Paris"))
            })
        };
        let mut suite = SuiteConfig::new("noise", "contains").with_case(
            "fr",
            "capital of France?",
            Some("Paris"),
        );
        suite.mutators = vec![MutatorKind::WhitespaceNoise];
        let result = runner(target.clone())
            .run(&suite, 3, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.cases.len(), 2);
        assert_eq!(target.calls(), 2);
        assert!(result.cases.iter().all(|c| !c.reused));
        assert_ne!(result.cases[0].fingerprint, result.cases[1].fingerprint);
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&"capital of France?".to_string()));
        assert!(seen.iter().any(|input| input != "capital of France?"));
    }

    fn case(status: CaseStatus, cause: Option<FailureCause>) -> CaseResult {
        let tc = TestCase {
            index: 0,
            id: "x".into(),
            template_id: "x".into(),
            mutator: MutatorKind::Identity,
            input: String::new(),
            expected: None,
        };
        let mut r = blank(&tc, String::new());
        r.status = status;
        r.error = cause.map(|cause| CaseError {
            cause,
            code: "c".into(),
            message: String::new(),
            status: None,
        });
        r
    }

    #[test]
    fn judge_applies_rates() {
        let lenient = SuiteThresholds {
            min_score: 0.5,
            min_pass_rate: 0.5,
            max_error_rate: 0.5,
        };
        let cases = vec![
            case(CaseStatus::Pass, None),
            case(CaseStatus::Fail, None),
            case(CaseStatus::Error, Some(FailureCause::TargetUnavailable)),
            case(CaseStatus::Skipped, None),
        ];
        assert_eq!(judge(&lenient, &cases).0, SuiteStatus::Passed);
        assert_eq!(
            judge(&SuiteThresholds::default(), &cases).1,
            vec![FailureCause::Quality, FailureCause::TargetUnavailable]
        );
        assert_eq!(
            judge(&SuiteThresholds::default(), &[case(CaseStatus::Skipped, None)]).0,
            SuiteStatus::Skipped
        );
    }
}
