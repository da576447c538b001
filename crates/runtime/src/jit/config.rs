//! Tunables for when a loop gets traced and how big a trace may grow.
//!
//! Both are overridable by environment variable so tests can force
//! near-immediate compilation (`LUMEN_JIT_THRESHOLD=1`) without waiting for
//! a real hot loop, and so a pathological trace can be capped without a
//! rebuild.

#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    pub enabled: bool,
    pub threshold: u32,
    pub max_trace_len: usize,
}

impl JitConfig {
    pub fn from_env(enabled: bool) -> Self {
        let threshold = std::env::var("LUMEN_JIT_THRESHOLD").ok().and_then(|s| s.parse().ok()).unwrap_or(1_000);
        let max_trace_len = std::env::var("LUMEN_TRACE_MAX_LEN").ok().and_then(|s| s.parse().ok()).unwrap_or(256);
        JitConfig { enabled, threshold, max_trace_len }
    }

    pub fn disabled() -> Self {
        JitConfig { enabled: false, threshold: u32::MAX, max_trace_len: 0 }
    }
}
