//! Engine configuration and gate files.
//!
//! Every recognised option is a typed field with a documented default;
//! unknown keys are rejected (`deny_unknown_fields`) rather than ignored.
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `PROBEGATE_MAX_RETRIES` | Max retries for transient failures (default: 2) |
//! | `PROBEGATE_ATTEMPT_TIMEOUT_MS` | Per-attempt timeout in ms (default: 30000) |
//! | `PROBEGATE_CACHE_TTL_MS` | Fingerprint cache TTL in ms (default: 3600000) |
//! | `PROBEGATE_TARGET_TOKEN` | Target auth token, applied to the run plan |

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};
use crate::model::RunPlan;

/// Gate file format version understood by this build.
pub const GATE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed.
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the uniform jitter added to each backoff.
    pub jitter_ms: u64,
    pub attempt_timeout_ms: u64,
    /// Deadline budget for one top-level call, retries and backoff included.
    pub total_budget_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter_ms: 100,
            attempt_timeout_ms: 30_000,
            total_budget_ms: 120_000,
        }
    }
}

impl RetryConfig {
    /// `min(max_delay, base_delay * 2^attempt)`, jitter excluded.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn jitter_window(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_millis(self.total_budget_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    /// Buckets keyed by caller token.
    pub caller: BucketConfig,
    /// Buckets keyed by source IP.
    pub ip: BucketConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60 * 60 * 1000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub breaker: BreakerConfig,
    /// Per-endpoint breaker settings, keyed by the exact endpoint string.
    pub breaker_overrides: BTreeMap<String, BreakerConfig>,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    /// Largest worker pool a run may request.
    pub max_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            breaker_overrides: BTreeMap::new(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            max_concurrency: 16,
        }
    }
}

impl EngineConfig {
    pub fn breaker_for(&self, endpoint: &str) -> &BreakerConfig {
        self.breaker_overrides.get(endpoint).unwrap_or(&self.breaker)
    }

    pub fn validate(&self) -> GateResult<()> {
        validate_breaker("breaker", &self.breaker)?;
        for (endpoint, b) in &self.breaker_overrides {
            validate_breaker(&format!("breaker_overrides[{endpoint}]"), b)?;
        }
        validate_bucket("rate_limit.caller", &self.rate_limit.caller)?;
        validate_bucket("rate_limit.ip", &self.rate_limit.ip)?;

        let r = &self.retry;
        if r.attempt_timeout_ms == 0 || r.total_budget_ms == 0 {
            return Err(GateError::config(
                "retry: attempt_timeout_ms and total_budget_ms must be > 0",
            ));
        }
        if r.base_delay_ms > r.max_delay_ms {
            return Err(GateError::config(format!(
                "retry: base_delay_ms ({}) exceeds max_delay_ms ({})",
                r.base_delay_ms, r.max_delay_ms
            )));
        }
        if self.cache.ttl_ms == 0 || self.cache.sweep_interval_ms == 0 {
            return Err(GateError::config(
                "cache: ttl_ms and sweep_interval_ms must be > 0",
            ));
        }
        if self.max_concurrency == 0 {
            return Err(GateError::config("max_concurrency must be > 0"));
        }
        Ok(())
    }

    /// Apply `PROBEGATE_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GateResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PROBEGATE_MAX_RETRIES") {
            self.retry.max_retries = parse_override("PROBEGATE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("PROBEGATE_ATTEMPT_TIMEOUT_MS") {
            self.retry.attempt_timeout_ms = parse_override("PROBEGATE_ATTEMPT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("PROBEGATE_CACHE_TTL_MS") {
            self.cache.ttl_ms = parse_override("PROBEGATE_CACHE_TTL_MS", &v)?;
        }
        Ok(())
    }
}

fn validate_breaker(section: &str, b: &BreakerConfig) -> GateResult<()> {
    if b.failure_threshold == 0 {
        return Err(GateError::config(format!(
            "{section}: failure_threshold must be > 0"
        )));
    }
    if b.reset_timeout_ms == 0 {
        return Err(GateError::config(format!(
            "{section}: reset_timeout_ms must be > 0"
        )));
    }
    Ok(())
}

fn validate_bucket(section: &str, b: &BucketConfig) -> GateResult<()> {
    if b.capacity == 0 {
        return Err(GateError::config(format!("{section}: capacity must be > 0")));
    }
    if !(b.refill_per_sec.is_finite() && b.refill_per_sec > 0.0) {
        return Err(GateError::config(format!(
            "{section}: refill_per_sec must be a positive number"
        )));
    }
    Ok(())
}

fn parse_override<T: std::str::FromStr>(name: &str, raw: &str) -> GateResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| GateError::config(format!("{name}: invalid value '{raw}'")))
}

/// On-disk gate file: engine settings plus one run plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateFile {
    pub version: u32,
    #[serde(default)]
    pub engine: EngineConfig,
    pub run: RunPlan,
}

impl GateFile {
    pub fn parse(yaml: &str, origin: &str) -> GateResult<Self> {
        let file: GateFile = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::config(format!("failed to parse {origin}: {e}")))?;
        if file.version != GATE_FILE_VERSION {
            return Err(GateError::config(format!(
                "{origin}: unsupported version {} (expected {})",
                file.version, GATE_FILE_VERSION
            )));
        }
        file.engine.validate()?;
        Ok(file)
    }

    /// Apply environment overrides to both the engine and the plan.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GateResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.engine.apply_overrides(&lookup)?;
        if let Some(token) = lookup("PROBEGATE_TARGET_TOKEN") {
            if !token.trim().is_empty() {
                self.run.target.auth_token = Some(token.trim().to_string());
            }
        }
        self.engine.validate()
    }
}

/// Load a gate file from disk and apply process environment overrides.
pub fn load_gate_file(path: &Path) -> GateResult<GateFile> {
    let raw = std::fs::read_to_string(path).map_err(|source| GateError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut file = GateFile::parse(&raw, &path.display().to_string())?;
    file.apply_overrides(|k| std::env::var(k).ok())?;
    Ok(file)
}
