use std::sync::Arc;

use probegate_core::{
    load_gate_file, CallerKey, GateError, GateVerdict, LogSink, Orchestrator, ReportSink,
    RunRecord, RunStatus,
};
use tracing::{info, warn};

use super::output::{print_progress, print_summary, JsonFileSink};
use crate::cli::args::RunArgs;
use crate::exit_codes;

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let file = match load_gate_file(&args.config) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(e.exit_code());
        }
    };

    let mut plan = file.run;
    if let Some(seed) = args.seed {
        plan.seed = seed;
    }
    if let Some(concurrency) = args.concurrency {
        plan.concurrency = concurrency;
    }
    plan.fail_fast |= args.fail_fast;
    let request = plan.into_request(CallerKey {
        token: args.caller_key.clone(),
        source_ip: args.source_ip,
    });

    let sink: Arc<dyn ReportSink> = match &args.output {
        Some(path) => Arc::new(JsonFileSink::new(path.clone())),
        None => Arc::new(LogSink),
    };
    let orchestrator = match Orchestrator::builder(file.engine)
        .sink(sink)
        .progress(Arc::new(print_progress))
        .build()
    {
        Ok(o) => o,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(e.exit_code());
        }
    };

    let run_id = match orchestrator.start_run(request).await {
        Ok(id) => id,
        Err(e @ GateError::Throttled { .. }) => {
            eprintln!("error: {e}");
            return Ok(exit_codes::THROTTLED);
        }
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(e.exit_code());
        }
    };
    info!(run_id = %run_id, config = %args.config.display(), "run started");

    let record = tokio::select! {
        record = orchestrator.wait(&run_id) => record?,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "interrupted, cancelling run");
            orchestrator.cancel(&run_id)?;
            orchestrator.wait(&run_id).await?
        }
    };

    print_summary(&record);
    Ok(decide_exit(&record))
}

fn decide_exit(record: &RunRecord) -> i32 {
    match (record.status, &record.gate) {
        (RunStatus::Completed, Some(gate)) if gate.verdict == GateVerdict::Pass => {
            exit_codes::GATE_PASS
        }
        (RunStatus::Completed, _) => exit_codes::GATE_FAIL,
        (RunStatus::Cancelled, _) => exit_codes::CANCELLED,
        _ => exit_codes::CONFIG_ERROR,
    }
}
