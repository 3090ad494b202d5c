//! Resource limiting and per-store state for sandbox instances.

use wasmtime::{ResourceLimiter, Store};
use wasmtime_wasi::preview1::WasiP1Ctx;

/// Resource limiter that enforces memory and table size limits.
pub struct SandboxLimiter {
    /// Maximum memory in bytes.
    max_memory: u64,
    /// Peak memory allocation (highest ever seen).
    peak_memory: u64,
    /// Maximum table elements.
    max_table_elements: u64,
    /// Set when a growth request was denied, cleared by `take_limit_exceeded`.
    limit_exceeded: bool,
}

impl SandboxLimiter {
    /// Create a new resource limiter with the specified memory limit.
    pub fn new(max_memory: u64) -> Self {
        Self {
            max_memory,
            peak_memory: 0,
            max_table_elements: 100_000, // C++ vtables need headroom
            limit_exceeded: false,
        }
    }

    /// Return and clear the exceeded flag.
    pub fn take_limit_exceeded(&mut self) -> bool {
        std::mem::take(&mut self.limit_exceeded)
    }

    /// Get the peak memory usage (highest ever observed).
    pub fn peak_memory(&self) -> u64 {
        self.peak_memory
    }
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let desired_bytes = desired as u64;

        if desired_bytes > self.max_memory {
            self.limit_exceeded = true;
            return Ok(false);
        }

        self.peak_memory = self.peak_memory.max(desired_bytes);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired as u64 > self.max_table_elements {
            self.limit_exceeded = true;
            return Ok(false);
        }
        Ok(true)
    }
}

/// Store data for one sandbox instance.
pub struct StoreData {
    /// The resource limiter.
    pub limiter: SandboxLimiter,
    /// WASI Preview 1 context for the sandbox.
    pub wasi: WasiP1Ctx,
    /// Diagnostic recorded by the `__cxa_throw` shim, consumed after the call returns.
    pending_trap: Option<String>,
}

impl StoreData {
    /// Create new store data with the given memory limit and WASI context.
    pub fn new(max_memory: u64, wasi: WasiP1Ctx) -> Self {
        Self {
            limiter: SandboxLimiter::new(max_memory),
            wasi,
            pending_trap: None,
        }
    }

    /// Record an abnormal termination for the call in progress.
    pub fn raise_trap(&mut self, message: impl Into<String>) {
        self.pending_trap = Some(message.into());
    }

    /// Take the pending trap, if the last call raised one.
    pub fn take_pending_trap(&mut self) -> Option<String> {
        self.pending_trap.take()
    }
}

/// Extension trait for Store to configure resource limiting.
pub trait StoreLimiterExt {
    /// Configure the store with resource limiting enabled.
    fn configure_limiter(&mut self);
}

impl StoreLimiterExt for Store<StoreData> {
    fn configure_limiter(&mut self) {
        self.limiter(|data| &mut data.limiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_allows_within_limit() {
        let mut limiter = SandboxLimiter::new(1024 * 1024); // 1MB

        let result = limiter.memory_growing(0, 512 * 1024, None).unwrap();
        assert!(result);
        assert!(!limiter.take_limit_exceeded());
        assert_eq!(limiter.peak_memory(), 512 * 1024);
    }

    #[test]
    fn test_limiter_denies_over_limit() {
        let mut limiter = SandboxLimiter::new(1024 * 1024); // 1MB

        let result = limiter.memory_growing(0, 2 * 1024 * 1024, None).unwrap();
        assert!(!result);
        assert!(limiter.take_limit_exceeded());
        assert!(!limiter.take_limit_exceeded());
        assert_eq!(limiter.peak_memory(), 0);
    }

    #[test]
    fn test_limiter_tracks_peak() {
        let mut limiter = SandboxLimiter::new(4 * 1024 * 1024);
        limiter.memory_growing(0, 3 * 1024 * 1024, None).unwrap();
        limiter.memory_growing(0, 1024 * 1024, None).unwrap();
        assert_eq!(limiter.peak_memory(), 3 * 1024 * 1024);
    }

    #[test]
    fn test_pending_trap_is_consumed_once() {
        let wasi = wasmtime_wasi::WasiCtxBuilder::new().build_p1();
        let mut data = StoreData::new(1024, wasi);
        assert!(data.take_pending_trap().is_none());

        data.raise_trap("bad config");
        assert_eq!(data.take_pending_trap().as_deref(), Some("bad config"));
        assert!(data.take_pending_trap().is_none());
    }
}
