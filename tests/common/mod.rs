//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use wasm_opencc_rs::prelude::*;
use wasm_opencc_rs::{BridgeConfigBuilder, SandboxInstance, StdioMode};

/// Module implementing the OpenCC ABI with ASCII case mapping.
pub const MOCK_OPENCC: &str = include_str!("../fixtures/mock_opencc.wat");

/// Builder preloaded with the mock module and no data mount.
pub fn mock_builder() -> BridgeConfigBuilder {
    BridgeConfig::builder()
        .module_bytes(MOCK_OPENCC.as_bytes().to_vec())
        .no_data_dir()
        .stdio(StdioMode::Discard)
}

/// A fresh runtime over the mock module.
pub fn mock_runtime() -> SandboxRuntime {
    SandboxRuntime::new(mock_builder().build())
}

/// A runtime whose calls are interrupted after `timeout`.
pub fn mock_runtime_with_timeout(timeout: Duration) -> SandboxRuntime {
    SandboxRuntime::new(
        mock_builder()
            .call_timeout(timeout)
            .epoch_tick_interval(Duration::from_millis(5))
            .build(),
    )
}

/// Outstanding `malloc` calls inside the mock module.
pub fn live_allocations(instance: &mut SandboxInstance) -> i32 {
    instance
        .invoke::<(), i32>("live_allocations", ())
        .expect("mock exports live_allocations")
}
