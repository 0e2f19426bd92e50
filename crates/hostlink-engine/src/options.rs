//! Runtime configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default nesting limit for calls through the engine
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;

/// Limits and tuning applied when a runtime is created.
///
/// Every field is optional in serialized form; missing fields take their
/// default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Heap limit in bytes; `None` is unlimited
    pub memory_limit: Option<usize>,
    /// Allocations between automatic collections; `None` collects only on
    /// explicit `run_gc`
    pub gc_threshold: Option<usize>,
    /// Maximum nesting of engine calls; `None` is unlimited
    pub max_call_depth: Option<usize>,
    /// Wall-clock budget for each outermost call, in milliseconds
    pub execute_timeout_ms: Option<u64>,
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self {
            memory_limit: None,
            gc_threshold: None,
            max_call_depth: Some(DEFAULT_MAX_CALL_DEPTH),
            execute_timeout_ms: None,
        }
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_gc_threshold(mut self, allocations: usize) -> Self {
        self.gc_threshold = Some(allocations);
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = Some(depth);
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn execute_timeout(&self) -> Option<Duration> {
        self.execute_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::new()
    }
}
