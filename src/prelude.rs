//! Prelude module for convenient imports.

pub use crate::abi::{configs, Direction};
pub use crate::converter::Converter;
pub use crate::error::{BridgeError, Result};
pub use crate::oneshot::{convert_s2t, convert_t2s};
pub use crate::sandbox::{cache::SandboxRuntime, config::BridgeConfig};
