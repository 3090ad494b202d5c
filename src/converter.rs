//! Long-lived OpenCC converters.

use crate::abi::{self, INVALID_HANDLE};
use crate::error::{BridgeError, CallOutcome, CleanupFailure, Result};
use crate::sandbox::cache::{global_runtime, SandboxRuntime};
use crate::sandbox::instance::SandboxInstance;
use crate::sandbox::marshal::{dispatch, ExportCall};

/// An open OpenCC configuration bound to its own sandbox instance.
///
/// Keeping one instance across many conversions avoids re-instantiating the
/// module and re-loading dictionaries per call. A converter is `Send` but
/// not shareable; use one converter per thread for parallel throughput.
///
/// # Example
///
/// ```rust,ignore
/// use wasm_opencc_rs::prelude::*;
///
/// let mut converter = Converter::open(configs::S2T)?;
/// assert_eq!(converter.convert("简体字")?, "簡體字");
/// converter.close()?;
/// ```
#[derive(Debug)]
pub struct Converter {
    config_id: String,
    instance: Option<SandboxInstance>,
    handle: u32,
}

impl Converter {
    /// Open `config_id` on the process-wide runtime.
    ///
    /// Common configurations:
    /// - `s2t.json` - Simplified to Traditional Chinese
    /// - `t2s.json` - Traditional to Simplified Chinese
    /// - `s2tw.json` - Simplified to Traditional Chinese (Taiwan)
    /// - `s2hk.json` - Simplified to Traditional Chinese (Hong Kong)
    /// - `t2tw.json` - Traditional to Traditional Chinese (Taiwan)
    /// - `t2hk.json` - Traditional to Traditional Chinese (Hong Kong)
    pub fn open(config_id: &str) -> Result<Self> {
        Self::open_with(global_runtime(), config_id)
    }

    /// Open `config_id` on a specific runtime.
    ///
    /// On any failure the freshly created instance is torn down before
    /// returning, so no half-open converter is observable.
    pub fn open_with(runtime: &SandboxRuntime, config_id: &str) -> Result<Self> {
        let mut instance = runtime.new_instance()?;

        let handle = dispatch(&mut instance, &ExportCall::Open { config: config_id })
            .and_then(|value| value.into_u32(abi::OPEN))
            .into_result()?;

        if handle == INVALID_HANDLE {
            tracing::debug!(config = config_id, "module rejected configuration");
            return Err(BridgeError::InvalidConverter);
        }

        tracing::debug!(config = config_id, handle, instance = instance.id(), "opened converter");
        Ok(Self {
            config_id: config_id.to_string(),
            instance: Some(instance),
            handle,
        })
    }

    /// The configuration this converter was opened with.
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    /// Whether the converter can still convert.
    pub fn is_open(&self) -> bool {
        self.instance.is_some() && self.handle != INVALID_HANDLE
    }

    /// Convert `input`.
    ///
    /// Fails with [`BridgeError::InvalidConverter`] without entering the
    /// sandbox once the converter is closed. An empty result for non-empty
    /// input is reported as [`BridgeError::ConversionFailed`].
    pub fn convert(&mut self, input: &str) -> Result<String> {
        let handle = self.handle;
        let instance = match self.instance.as_mut() {
            Some(instance) if handle != INVALID_HANDLE => instance,
            _ => return Err(BridgeError::InvalidConverter),
        };

        let output = dispatch(instance, &ExportCall::Convert { handle, input })
            .and_then(|value| value.into_string(abi::CONVERT))
            .into_result()?;

        if output.is_empty() && !input.is_empty() {
            return Err(BridgeError::ConversionFailed);
        }
        Ok(output)
    }

    /// The module's last error message, if it reports one.
    pub fn last_error(&mut self) -> Result<Option<String>> {
        let instance = self.instance.as_mut().ok_or(BridgeError::InvalidConverter)?;
        let message = dispatch(instance, &ExportCall::LastError)
            .and_then(|value| value.into_string(abi::ERROR))
            .into_result()?;
        Ok(Some(message).filter(|m| !m.is_empty()))
    }

    /// Close the converter. Calling it again is a no-op.
    ///
    /// A failure of the module's close export is logged, not returned; the
    /// instance is torn down regardless.
    pub fn close(&mut self) -> Result<()> {
        self.close_reporting().into_result()
    }

    /// Close the converter and report cleanup failures instead of logging them.
    pub fn close_reporting(&mut self) -> CallOutcome<()> {
        let Some(mut instance) = self.instance.take() else {
            return CallOutcome::new(Ok(()));
        };

        let mut outcome = CallOutcome::new(Ok(()));
        if self.handle != INVALID_HANDLE {
            let handle = self.handle;
            let closed = dispatch(&mut instance, &ExportCall::Close { handle });
            outcome.suppress(closed.suppressed);
            match closed.result.and_then(|value| value.into_i32(abi::CLOSE)) {
                Ok(0) => {}
                Ok(status) => outcome.suppress([CleanupFailure {
                    operation: abi::CLOSE.to_string(),
                    address: None,
                    message: format!("module returned status {status}"),
                }]),
                Err(e) => outcome.suppress([CleanupFailure::new(abi::CLOSE, None, &e)]),
            }
            self.handle = INVALID_HANDLE;
        }

        tracing::debug!(config = %self.config_id, instance = instance.id(), "closed converter");
        instance.close();
        outcome
    }
}

impl Drop for Converter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::configs;
    use crate::sandbox::config::{BridgeConfig, StdioMode};

    const MOCK: &str = include_str!("../tests/fixtures/mock_opencc.wat");

    fn runtime() -> SandboxRuntime {
        SandboxRuntime::new(
            BridgeConfig::builder()
                .module_bytes(MOCK.as_bytes().to_vec())
                .no_data_dir()
                .stdio(StdioMode::Discard)
                .build(),
        )
    }

    #[test]
    fn test_open_convert_close() {
        let runtime = runtime();
        let mut converter = Converter::open_with(&runtime, configs::S2T).unwrap();
        assert!(converter.is_open());
        assert_eq!(converter.config_id(), "s2t.json");

        assert_eq!(converter.convert("hello").unwrap(), "HELLO");
        assert_eq!(converter.convert("again").unwrap(), "AGAIN");
        assert_eq!(runtime.stats().instances_created, 1);

        converter.close().unwrap();
        assert!(!converter.is_open());
        assert_eq!(runtime.stats().live_instances, 0);
    }

    #[test]
    fn test_empty_input_is_identity() {
        let runtime = runtime();
        let mut converter = Converter::open_with(&runtime, configs::T2S).unwrap();
        assert_eq!(converter.convert("").unwrap(), "");
    }

    #[test]
    fn test_null_output_is_conversion_failure() {
        let runtime = runtime();
        let mut converter = Converter::open_with(&runtime, configs::T2S).unwrap();
        let err = converter.convert("!broken").unwrap_err();
        assert!(err.is_conversion_failed());
        assert!(converter.is_open());
    }

    #[test]
    fn test_close_reporting_is_clean() {
        let runtime = runtime();
        let mut converter = Converter::open_with(&runtime, configs::S2T).unwrap();
        let outcome = converter.close_reporting();
        assert!(outcome.result.is_ok());
        assert!(!outcome.has_suppressed());

        let again = converter.close_reporting();
        assert!(again.result.is_ok());
        assert!(!again.has_suppressed());
    }

    #[test]
    fn test_last_error() {
        let runtime = runtime();
        let mut converter = Converter::open_with(&runtime, configs::S2T).unwrap();
        assert_eq!(converter.last_error().unwrap().as_deref(), Some("no error"));

        converter.close().unwrap();
        assert!(converter.last_error().unwrap_err().is_invalid_converter());
    }

    #[test]
    fn test_drop_tears_down_instance() {
        let runtime = runtime();
        {
            let _converter = Converter::open_with(&runtime, configs::S2T).unwrap();
            assert_eq!(runtime.stats().live_instances, 1);
        }
        assert_eq!(runtime.stats().live_instances, 0);
    }
}
