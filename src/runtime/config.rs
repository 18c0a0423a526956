//! Bridge configuration.

use std::env;

/// Environment variable holding the trace verbosity threshold.
pub const TRACE_ENV: &str = "TSCL_BRIDGE_TRACE";

/// Environment variable overriding the reference frame capacity.
pub const FRAME_CAPACITY_ENV: &str = "TSCL_BRIDGE_FRAME_CAPACITY";

/// Configuration for a `Bridge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Trace lines at or below this level are emitted. 0 disables tracing.
    pub trace_level: u8,
    /// Capacity hint passed when a root scope pushes its reference frame.
    pub frame_capacity: usize,
    /// Scan live durable handles for the same foreign object on every
    /// durable registration.
    pub check_duplicate_durables: bool,
    /// Local frames dropped from the top of the shadow stack before splicing.
    pub local_frame_skip: usize,
    /// Foreign frames dropped from a freshly created foreign exception's stack
    /// (the factory callback's own frames).
    pub foreign_frame_skip: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            trace_level: 0,
            frame_capacity: 64,
            check_duplicate_durables: cfg!(debug_assertions),
            local_frame_skip: 0,
            foreign_frame_skip: 1,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(level) = read_env::<u8>(TRACE_ENV) {
            config.trace_level = level;
        }
        if let Some(capacity) = read_env::<usize>(FRAME_CAPACITY_ENV) {
            config.frame_capacity = capacity;
        }
        config
    }

    pub fn with_trace_level(mut self, level: u8) -> Self {
        self.trace_level = level;
        self
    }

    pub fn with_frame_capacity(mut self, capacity: usize) -> Self {
        self.frame_capacity = capacity;
        self
    }

    pub fn with_duplicate_check(mut self, enabled: bool) -> Self {
        self.check_duplicate_durables = enabled;
        self
    }

    pub fn with_frame_skips(mut self, local: usize, foreign: usize) -> Self {
        self.local_frame_skip = local;
        self.foreign_frame_skip = foreign;
        self
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(target: "tscl_bridge", variable = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
