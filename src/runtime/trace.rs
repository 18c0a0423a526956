//! Leveled diagnostic trace.
//!
//! Levels:
//! - 1: scope open/close, symbol resolution
//! - 2: every primitive foreign operation issued by the bridge
//! - 3: durable reference creation and deletion
//!
//! Every emitted line goes to `tracing` (target `tscl_bridge`) and, if one is
//! installed, to the caller's sink.

use std::fmt;
use std::sync::Arc;

pub const TRACE_SCOPES: u8 = 1;
pub const TRACE_CALLS: u8 = 2;
pub const TRACE_REFS: u8 = 3;

/// Receives `(verbosity, formatted line)`.
pub type TraceSink = Arc<dyn Fn(u8, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Tracer {
    threshold: u8,
    sink: Option<TraceSink>,
}

impl Tracer {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: TraceSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    #[inline]
    pub fn enabled(&self, level: u8) -> bool {
        level != 0 && level <= self.threshold
    }

    pub fn emit(&self, level: u8, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let line = args.to_string();
        tracing::trace!(target: "tscl_bridge", verbosity = level, "{}", line);
        if let Some(sink) = &self.sink {
            sink(level, &line);
        }
    }

    /// Write a multi-line diagnostic record regardless of the threshold.
    pub fn dump(&self, record: &str) {
        tracing::error!(target: "tscl_bridge", "{}", record);
        if let Some(sink) = &self.sink {
            sink(0, record);
        }
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("threshold", &self.threshold)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// `bridge_trace!(tracer, level, "fmt", args..)`; formats only when enabled.
macro_rules! bridge_trace {
    ($tracer:expr, $level:expr, $($arg:tt)+) => {{
        let tracer: &$crate::runtime::trace::Tracer = &$tracer;
        if tracer.enabled($level) {
            tracer.emit($level, format_args!($($arg)+));
        }
    }};
}

pub(crate) use bridge_trace;
