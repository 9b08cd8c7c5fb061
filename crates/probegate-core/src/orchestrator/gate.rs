use crate::model::{GateDecision, GateReason, GateVerdict, SuiteResult, SuiteStatus};

/// Run-level gate over suites in requested order.
///
/// The gate fails iff a required suite failed. Skipped, cancelled and
/// optional suites are listed as reasons but never fail it on their own.
pub fn decide(suites: &[SuiteResult]) -> GateDecision {
    let reasons: Vec<GateReason> = suites
        .iter()
        .filter(|s| s.status != SuiteStatus::Passed)
        .map(|s| GateReason {
            suite_id: s.suite_id.clone(),
            required: s.required,
            status: s.status,
            causes: s.failure_causes.clone(),
        })
        .collect();

    let verdict = if reasons
        .iter()
        .any(|r| r.required && r.status == SuiteStatus::Failed)
    {
        GateVerdict::Fail
    } else {
        GateVerdict::Pass
    };

    GateDecision { verdict, reasons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailureCause;

    fn suite(id: &str, required: bool, status: SuiteStatus) -> SuiteResult {
        let mut s = SuiteResult::empty(id, required, status);
        if status == SuiteStatus::Failed {
            s.failure_causes = vec![FailureCause::Quality];
        }
        s
    }

    #[test]
    fn required_failure_fails_the_gate() {
        let d = decide(&[
            suite("a", true, SuiteStatus::Passed),
            suite("b", true, SuiteStatus::Failed),
            suite("c", true, SuiteStatus::Skipped),
        ]);
        assert_eq!(d.verdict, GateVerdict::Fail);
        let ids: Vec<_> = d.reasons.iter().map(|r| r.suite_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(d.reasons[0].causes, vec![FailureCause::Quality]);
    }

    #[test]
    fn optional_failures_and_skips_do_not_fail_the_gate() {
        let d = decide(&[
            suite("a", true, SuiteStatus::Passed),
            suite("b", false, SuiteStatus::Failed),
            suite("c", true, SuiteStatus::Skipped),
        ]);
        assert_eq!(d.verdict, GateVerdict::Pass);
        assert_eq!(d.reasons.len(), 2);
    }
}
