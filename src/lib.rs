//! # OpenCC over WebAssembly
//!
//! Chinese Simplified/Traditional conversion through OpenCC compiled to a
//! WASI module and executed by Wasmtime. The host program never links the
//! native library: every call crosses a sandbox boundary where
//!
//! - **Strings** are copied into and out of the module's linear memory
//! - **Allocations** made for a call are released before it returns
//! - **Exceptions** thrown by the C++ code become [`BridgeError::SandboxTrap`]
//!   instead of aborting the host
//! - **Dictionaries** are read from a host directory mounted read-only
//!
//! The module is compiled once per [`SandboxRuntime`] and instantiated per
//! session.
//!
//! ## Example
//!
//! ```rust,ignore
//! use wasm_opencc_rs::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let runtime = SandboxRuntime::new(
//!         BridgeConfig::builder()
//!             .module_path("assets/opencc.wasm")
//!             .data_dir("assets/data")
//!             .build(),
//!     );
//!
//!     // One instance per call
//!     let traditional = runtime.convert(Direction::SimplifiedToTraditional, "简体字")?;
//!     assert_eq!(traditional, "簡體字");
//!
//!     // One instance kept across calls
//!     let mut converter = Converter::open_with(&runtime, configs::T2S)?;
//!     assert_eq!(converter.convert("繁體字")?, "繁体字");
//!     converter.close()?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//!
//! A runtime can be shared freely across threads. Instances and converters
//! are owned by one caller at a time; use one converter per thread.

pub mod abi;
pub mod converter;
pub mod error;
pub mod oneshot;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use abi::{configs, Direction, INVALID_HANDLE};
pub use converter::Converter;
pub use error::{BridgeError, CallOutcome, CleanupFailure, Result};
pub use oneshot::{convert_async, convert_s2t, convert_t2s};
pub use sandbox::cache::{configure_global, global_runtime, CompiledRuntime, RuntimeStats, SandboxRuntime};
pub use sandbox::config::{BridgeConfig, BridgeConfigBuilder, ModuleSource, StdioMode};
pub use sandbox::instance::SandboxInstance;
