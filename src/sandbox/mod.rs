//! Sandbox module containing the host side of the WebAssembly boundary.

pub mod cache;
pub mod config;
pub mod instance;
pub mod limits;
pub mod marshal;
pub mod shims;
