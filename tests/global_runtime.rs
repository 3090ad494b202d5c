//! The process-wide runtime behind `Converter::open` and the free functions.
//!
//! Kept in its own test binary: the global can be configured only once per process.

mod common;

use wasm_opencc_rs::prelude::*;
use wasm_opencc_rs::{configure_global, global_runtime};

#[test]
fn test_global_runtime() {
    configure_global(common::mock_builder().build()).unwrap();
    assert!(configure_global(BridgeConfig::default()).is_err());

    assert_eq!(convert_s2t("global").unwrap(), "GLOBAL");
    assert_eq!(convert_t2s("GLOBAL").unwrap(), "global");
    assert_eq!(convert_s2t("").unwrap(), "");

    let mut converter = Converter::open(configs::S2T).unwrap();
    assert_eq!(converter.convert("handle").unwrap(), "HANDLE");
    converter.close().unwrap();

    let stats = global_runtime().stats();
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.live_instances, 0);
}
