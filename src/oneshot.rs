//! Stateless conversions that use a fresh instance per call.

use crate::abi::Direction;
use crate::error::{BridgeError, Result};
use crate::sandbox::cache::{global_runtime, SandboxRuntime};
use crate::sandbox::marshal::{dispatch, ExportCall};

impl SandboxRuntime {
    /// Convert `input` in one direction using a throwaway instance.
    ///
    /// The instance is torn down whether or not the call succeeded. Empty
    /// input always converts to empty output.
    pub fn convert(&self, direction: Direction, input: &str) -> Result<String> {
        let mut instance = self.new_instance()?;
        let outcome = dispatch(&mut instance, &ExportCall::ConvertFixed { direction, input });
        instance.close();

        let output = outcome
            .and_then(|value| value.into_string(direction.export()))
            .into_result()?;

        // Empty result is only an error if input was non-empty
        if output.is_empty() && !input.is_empty() {
            return Err(BridgeError::ConversionFailed);
        }
        Ok(output)
    }
}

/// Convert Simplified Chinese to Traditional Chinese on the global runtime.
pub fn convert_s2t(input: &str) -> Result<String> {
    global_runtime().convert(Direction::SimplifiedToTraditional, input)
}

/// Convert Traditional Chinese to Simplified Chinese on the global runtime.
pub fn convert_t2s(input: &str) -> Result<String> {
    global_runtime().convert(Direction::TraditionalToSimplified, input)
}

/// Run a one-shot conversion on tokio's blocking pool.
///
/// Accepts anything that can lend a runtime for `'static`, such as an
/// `Arc<SandboxRuntime>` or [`global_runtime()`].
pub async fn convert_async<R>(runtime: R, direction: Direction, input: impl Into<String>) -> Result<String>
where
    R: AsRef<SandboxRuntime> + Send + 'static,
{
    let input = input.into();
    tokio::task::spawn_blocking(move || runtime.as_ref().convert(direction, &input))
        .await
        .map_err(|e| BridgeError::TaskFailed(format!("task panicked: {e}")))?
}
