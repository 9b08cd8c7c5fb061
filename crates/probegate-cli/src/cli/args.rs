use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "probegate",
    version,
    about = "Quality gates for AI endpoints: run probe suites, score the answers, gate the release"
)]
pub struct Cli {
    /// Log line format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a gate file against its target and decide the gate
    Run(RunArgs),
    /// Check a gate file without contacting the target
    Validate(ValidateArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    #[arg(long, default_value = "gate.yaml")]
    pub config: PathBuf,

    /// Write the full run record as JSON here
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Override the mutator seed from the gate file
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override how many suites run at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Stop scheduling suites after the first required failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Caller identity used for admission
    #[arg(long, env = "PROBEGATE_CALLER_KEY", default_value = "local")]
    pub caller_key: String,

    /// Source address used for admission
    #[arg(long, default_value = "127.0.0.1")]
    pub source_ip: IpAddr,
}

#[derive(Parser, Clone, Debug)]
pub struct ValidateArgs {
    #[arg(long, default_value = "gate.yaml")]
    pub config: PathBuf,
}
