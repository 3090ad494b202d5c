//! Bridge configuration with builder pattern.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::abi::PROGRAM_NAME;

/// Largest deadline handed to the store; wasmtime adds it to the current epoch.
const MAX_DEADLINE_TICKS: u64 = u64::MAX / 2;

/// Where the compiled OpenCC module comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// A `.wasm` (or `.wat`) file read on first use.
    File(PathBuf),
    /// Module bytes already in memory.
    Bytes(Arc<[u8]>),
}

/// How the module's stdout/stderr are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// Forward to the host process's stdout/stderr.
    #[default]
    Inherit,
    /// Capture into memory, readable from the instance.
    Capture,
    /// Drop all output.
    Discard,
}

/// Configuration for the sandbox runtime.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// The compiled module.
    pub module: ModuleSource,
    /// Host directory mounted read-only as the module's `/`.
    pub data_dir: Option<PathBuf>,
    /// `argv[0]` for the module.
    pub program_name: String,
    /// Maximum linear memory per instance, in bytes.
    pub max_memory: u64,
    /// Maximum fuel (instruction count) per call.
    pub max_fuel: Option<u64>,
    /// Maximum wall time per call.
    pub call_timeout: Option<Duration>,
    /// Epoch interruption interval backing `call_timeout`.
    pub epoch_tick_interval: Duration,
    /// Where module output goes.
    pub stdio: StdioMode,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            module: ModuleSource::File(PathBuf::from("assets/opencc.wasm")),
            data_dir: Some(PathBuf::from("assets/data")),
            program_name: PROGRAM_NAME.to_string(),
            max_memory: 256 * 1024 * 1024, // 256MB, dictionaries are large
            max_fuel: None,
            call_timeout: None,
            epoch_tick_interval: Duration::from_millis(10),
            stdio: StdioMode::Inherit,
        }
    }
}

impl BridgeConfig {
    /// Create a new builder for BridgeConfig.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Number of epoch ticks a call may run before it is interrupted.
    pub(crate) fn epoch_deadline_ticks(&self) -> Option<u64> {
        let timeout = self.call_timeout?;
        let tick = self.epoch_tick_interval.as_nanos().max(1);
        let ticks = timeout.as_nanos().div_ceil(tick).max(1);
        // One extra tick: the first one may land right after the deadline is armed.
        let ticks = u64::try_from(ticks).unwrap_or(MAX_DEADLINE_TICKS);
        Some(ticks.saturating_add(1).min(MAX_DEADLINE_TICKS))
    }
}

/// Builder for creating BridgeConfig instances.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfigBuilder {
    module: Option<ModuleSource>,
    data_dir: Option<Option<PathBuf>>,
    program_name: Option<String>,
    max_memory: Option<u64>,
    max_fuel: Option<u64>,
    call_timeout: Option<Duration>,
    epoch_tick_interval: Option<Duration>,
    stdio: Option<StdioMode>,
}

impl BridgeConfigBuilder {
    /// Load the module from a file.
    pub fn module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module = Some(ModuleSource::File(path.into()));
        self
    }

    /// Use module bytes (binary wasm or text format).
    pub fn module_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.module = Some(ModuleSource::Bytes(Arc::from(bytes.into())));
        self
    }

    /// Mount a host directory as the module's read-only root.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(Some(path.into()));
        self
    }

    /// Do not mount any directory.
    pub fn no_data_dir(mut self) -> Self {
        self.data_dir = Some(None);
        self
    }

    /// Set the program name passed as `argv[0]`.
    pub fn program_name(mut self, name: impl Into<String>) -> Self {
        self.program_name = Some(name.into());
        self
    }

    /// Set the maximum memory limit in bytes.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Set the maximum fuel (instruction count) per call.
    pub fn max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = Some(fuel);
        self
    }

    /// Set the per-call timeout.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Set the epoch tick interval for timeout checking.
    pub fn epoch_tick_interval(mut self, interval: Duration) -> Self {
        self.epoch_tick_interval = Some(interval);
        self
    }

    /// Set how module stdout/stderr are handled.
    pub fn stdio(mut self, mode: StdioMode) -> Self {
        self.stdio = Some(mode);
        self
    }

    /// Build the BridgeConfig.
    pub fn build(self) -> BridgeConfig {
        let default = BridgeConfig::default();
        BridgeConfig {
            module: self.module.unwrap_or(default.module),
            data_dir: self.data_dir.unwrap_or(default.data_dir),
            program_name: self.program_name.unwrap_or(default.program_name),
            max_memory: self.max_memory.unwrap_or(default.max_memory),
            max_fuel: self.max_fuel.or(default.max_fuel),
            call_timeout: self.call_timeout.or(default.call_timeout),
            epoch_tick_interval: self.epoch_tick_interval.unwrap_or(default.epoch_tick_interval),
            stdio: self.stdio.unwrap_or(default.stdio),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.program_name, "opencc");
        assert_eq!(config.max_memory, 256 * 1024 * 1024);
        assert_eq!(config.data_dir, Some(PathBuf::from("assets/data")));
        assert!(config.call_timeout.is_none());
        assert!(config.epoch_deadline_ticks().is_none());
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::builder()
            .module_bytes(b"(module)".to_vec())
            .no_data_dir()
            .max_memory(32 * 1024 * 1024)
            .max_fuel(1_000_000)
            .stdio(StdioMode::Capture)
            .build();

        assert!(matches!(config.module, ModuleSource::Bytes(ref b) if &b[..] == b"(module)"));
        assert!(config.data_dir.is_none());
        assert_eq!(config.max_memory, 32 * 1024 * 1024);
        assert_eq!(config.max_fuel, Some(1_000_000));
        assert_eq!(config.stdio, StdioMode::Capture);
    }

    #[test]
    fn test_deadline_ticks_round_up() {
        let config = BridgeConfig::builder()
            .call_timeout(Duration::from_millis(25))
            .epoch_tick_interval(Duration::from_millis(10))
            .build();

        assert_eq!(config.epoch_deadline_ticks(), Some(4));
    }

    #[test]
    fn test_deadline_ticks_saturate() {
        let config = BridgeConfig::builder()
            .call_timeout(Duration::MAX)
            .epoch_tick_interval(Duration::from_nanos(1))
            .build();

        assert_eq!(config.epoch_deadline_ticks(), Some(MAX_DEADLINE_TICKS));
    }
}
