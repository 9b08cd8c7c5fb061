use std::net::Ipv4Addr;

use probegate_core::mutators::generate_cases;
use probegate_core::{load_gate_file, CallerKey, EvaluatorRegistry, HttpConnector, TargetConnector};

use crate::cli::args::ValidateArgs;
use crate::exit_codes;

/// Parse and check a gate file without contacting the target. Unknown
/// evaluators are warnings: their suites would be skipped, not failed.
pub async fn run(args: ValidateArgs) -> anyhow::Result<i32> {
    let file = match load_gate_file(&args.config) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(e.exit_code());
        }
    };

    let plan = file.run.clone();
    let request = plan.into_request(CallerKey {
        token: String::new(),
        source_ip: Ipv4Addr::LOCALHOST.into(),
    });
    if let Err(message) = request.validate(file.engine.max_concurrency) {
        eprintln!("error: {}: {message}", args.config.display());
        return Ok(exit_codes::CONFIG_ERROR);
    }
    if let Err(e) = HttpConnector::new().and_then(|c| c.connect(&request.target).map(|_| ())) {
        eprintln!("error: {}: {e}", args.config.display());
        return Ok(exit_codes::CONFIG_ERROR);
    }

    let evaluators = EvaluatorRegistry::with_builtins();
    for suite in &request.suites {
        if evaluators.get(&suite.evaluator).is_none() {
            eprintln!(
                "warning: suite '{}' uses unknown evaluator '{}'; its cases will be skipped",
                suite.id, suite.evaluator
            );
        }
    }

    let cases: usize = request
        .suites
        .iter()
        .map(|s| generate_cases(s, request.seed).len())
        .sum();
    println!(
        "{}: ok ({} suites, {} cases, target {})",
        args.config.display(),
        request.suites.len(),
        cases,
        request.target.endpoint
    );
    Ok(exit_codes::GATE_PASS)
}
