//! Clock context: wall time and a monotonic clock anchored at invocation
//! start.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Reported by `clock_res_get` for both clocks: 1ms.
pub const CLOCK_RESOLUTION_NS: u64 = 1_000_000;

pub struct WasiClocks {
    creation_time: Instant,
}

impl WasiClocks {
    pub fn new() -> Self {
        Self {
            creation_time: Instant::now(),
        }
    }

    /// Nanoseconds since the Unix epoch.
    pub fn realtime_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    /// Nanoseconds since the invocation started.
    pub fn monotonic_ns(&self) -> u64 {
        self.creation_time.elapsed().as_nanos() as u64
    }
}

impl Default for WasiClocks {
    fn default() -> Self {
        Self::new()
    }
}
