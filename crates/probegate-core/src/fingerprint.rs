use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub hex: String,
    pub components: Vec<String>,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

pub fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

/// Trim and collapse runs of whitespace. Case is preserved: evaluators may
/// care about it.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Computes the deterministic cache key for one evaluation.
///
/// `provider` identifies who produces and judges the output (target
/// identity plus evaluator). `input` is hashed byte for byte since it is
/// what the target sees; `output` is the normalized reference the
/// evaluation is judged against.
pub fn compute(provider: &str, input: &str, output: Option<&str>) -> Fingerprint {
    let mut parts = Vec::with_capacity(4);

    parts.push(format!("provider={provider}"));
    parts.push(format!("input={input}"));
    parts.push(format!("output={}", output.map(normalize).unwrap_or_default()));

    // Invalidate everything on engine upgrades.
    parts.push(format!("probegate_version={}", env!("CARGO_PKG_VERSION")));

    let raw = parts.join("\n");
    let hex = sha256_hex(&raw);

    Fingerprint {
        hex,
        components: parts,
    }
}

/// Provider identity for a (target, evaluator) pair.
pub fn provider_id(endpoint: &str, evaluator: &str) -> String {
    format!("{endpoint}#{evaluator}")
}
