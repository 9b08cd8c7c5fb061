#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use probegate_core::config::{BreakerConfig, RetryConfig};
use probegate_core::{
    CallError, CallerKey, EngineConfig, GateError, GateResult, RunRequest, SuiteConfig,
    TargetAdapter, TargetConnector, TargetDescriptor, TargetRequest, TargetResponse,
};

type Respond = dyn Fn(&TargetRequest) -> Result<TargetResponse, CallError> + Send + Sync;

/// Scripted target. Inputs containing `slow:<ms>` sleep that long first.
pub struct FakeTarget {
    respond: Box<Respond>,
    calls: AtomicUsize,
}

impl FakeTarget {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&TargetRequest) -> Result<TargetResponse, CallError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        })
    }

    /// Answers every request with `text`.
    pub fn answering(text: &'static str) -> Arc<Self> {
        Self::new(move |_| Ok(TargetResponse::text(text)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn delay_of(input: &str) -> Option<Duration> {
    let rest = input.split("slow:").nth(1)?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok().map(Duration::from_millis)
}

#[async_trait]
impl TargetAdapter for FakeTarget {
    fn endpoint(&self) -> &str {
        "http://fake.target"
    }

    async fn invoke(&self, request: &TargetRequest) -> Result<TargetResponse, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = delay_of(&request.input) {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(request)
    }
}

/// Hands out the same fake target; endpoints starting with `invalid` fail.
pub struct FakeConnector {
    pub target: Arc<FakeTarget>,
}

impl FakeConnector {
    pub fn new(target: Arc<FakeTarget>) -> Arc<Self> {
        Arc::new(Self { target })
    }
}

impl TargetConnector for FakeConnector {
    fn connect(&self, target: &TargetDescriptor) -> GateResult<Arc<dyn TargetAdapter>> {
        if target.endpoint.starts_with("invalid") {
            return Err(GateError::InvalidTarget {
                message: format!("cannot reach '{}'", target.endpoint),
            });
        }
        Ok(self.target.clone())
    }
}

/// Engine config with fast, deterministic retries.
pub fn engine() -> EngineConfig {
    EngineConfig {
        breaker: BreakerConfig {
            failure_threshold: 3,
            reset_timeout_ms: 30_000,
        },
        retry: RetryConfig {
            max_retries: 0,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter_ms: 0,
            attempt_timeout_ms: 60_000,
            total_budget_ms: 120_000,
        },
        ..EngineConfig::default()
    }
}

pub fn caller(token: &str, last_octet: u8) -> CallerKey {
    CallerKey {
        token: token.into(),
        source_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
    }
}

pub fn request(suites: Vec<SuiteConfig>, concurrency: usize) -> RunRequest {
    RunRequest {
        target: TargetDescriptor::http("http://fake.target"),
        suites,
        concurrency,
        fail_fast: false,
        caller: caller("ci", 1),
        seed: 42,
    }
}

/// Suite whose single case answers "ok" after `delay_ms`.
pub fn suite(id: &str, delay_ms: u64) -> SuiteConfig {
    SuiteConfig::new(id, "contains").with_case(
        format!("{id}-1"),
        format!("{id} probe slow:{delay_ms}"),
        Some("ok"),
    )
}
