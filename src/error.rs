//! Error types for the OpenCC bridge.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving the sandboxed OpenCC module.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The converter could not be opened, or it is already closed.
    #[error("invalid converter")]
    InvalidConverter,

    /// The module returned no output for a non-empty input.
    #[error("conversion failed")]
    ConversionFailed,

    /// Setting up the engine, module, imports or instance failed.
    #[error("failed to initialize sandbox ({stage}): {source}")]
    Initialization {
        /// Which setup step failed (e.g. "compile module").
        stage: &'static str,
        /// The underlying runtime error.
        #[source]
        source: anyhow::Error,
    },

    /// The module artifact was not found on disk.
    #[error("sandbox module not found at: {0}")]
    ModuleNotFound(String),

    /// The module does not export the requested function.
    #[error("exported function `{0}` not found")]
    FunctionNotFound(String),

    /// An argument or result kind does not match the export's signature.
    #[error("unsupported type for `{function}`: {detail}")]
    UnsupportedType {
        /// The export being called.
        function: String,
        /// What did not match.
        detail: String,
    },

    /// The sandboxed code terminated abnormally and the host recovered.
    #[error("sandbox trapped in `{function}`: {message}")]
    SandboxTrap {
        /// The export that was running when the trap fired.
        function: String,
        /// Best-effort diagnostic read from sandbox memory.
        message: String,
    },

    /// The runtime reported a failure that is not one of the cases above.
    #[error("call to `{function}` failed: {source}")]
    Invocation {
        /// The export being called.
        function: String,
        /// The underlying runtime error.
        #[source]
        source: anyhow::Error,
    },

    /// The module allocator returned a null pointer.
    #[error("sandbox allocation of {size} bytes failed")]
    AllocationFailed {
        /// Requested size in bytes.
        size: u32,
    },

    /// A read or write fell outside the module's linear memory.
    #[error("invalid sandbox memory access at {address:#x}: {reason}")]
    MemoryAccess {
        /// Guest address of the access.
        address: u32,
        /// Why the access failed.
        reason: String,
    },

    /// The call exceeded the configured timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The module tried to grow past the configured memory limit.
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    /// The call ran out of fuel (instruction limit).
    #[error("sandbox ran out of fuel")]
    OutOfFuel,

    /// I/O error while reading the module or data directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking conversion task panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl BridgeError {
    pub(crate) fn init(stage: &'static str, source: impl Into<anyhow::Error>) -> Self {
        BridgeError::Initialization {
            stage,
            source: source.into(),
        }
    }

    pub(crate) fn unsupported(function: &str, detail: impl Into<String>) -> Self {
        BridgeError::UnsupportedType {
            function: function.to_string(),
            detail: detail.into(),
        }
    }

    /// Check if this error happened while setting up the sandbox.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            BridgeError::Initialization { .. } | BridgeError::ModuleNotFound(_)
        )
    }

    /// Check if this error is a recovered sandbox trap.
    pub fn is_trap(&self) -> bool {
        matches!(self, BridgeError::SandboxTrap { .. })
    }

    /// Check if this error reports an invalid or closed converter.
    pub fn is_invalid_converter(&self) -> bool {
        matches!(self, BridgeError::InvalidConverter)
    }

    /// Check if this error reports a failed conversion.
    pub fn is_conversion_failed(&self) -> bool {
        matches!(self, BridgeError::ConversionFailed)
    }

    /// Check if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout(_))
    }

    /// Check if this error represents a memory limit exceeded.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, BridgeError::MemoryLimitExceeded(_))
    }

    /// Check if this error represents an out-of-fuel condition.
    pub fn is_out_of_fuel(&self) -> bool {
        matches!(self, BridgeError::OutOfFuel)
    }

    /// The diagnostic carried by a sandbox trap, if this is one.
    pub fn trap_message(&self) -> Option<&str> {
        match self {
            BridgeError::SandboxTrap { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// A cleanup step that failed after the primary operation had finished.
///
/// Cleanup failures never replace the primary result; they are carried
/// next to it in a [`CallOutcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// The cleanup export or step that failed (e.g. "free").
    pub operation: String,
    /// The guest address being released, when there is one.
    pub address: Option<u32>,
    /// Rendered error.
    pub message: String,
}

impl CleanupFailure {
    pub(crate) fn new(operation: &str, address: Option<u32>, error: &BridgeError) -> Self {
        Self {
            operation: operation.to_string(),
            address,
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Some(address) => write!(f, "{}({:#x}): {}", self.operation, address, self.message),
            None => write!(f, "{}: {}", self.operation, self.message),
        }
    }
}

/// The primary result of a sandbox call plus any suppressed cleanup failures.
#[must_use]
#[derive(Debug)]
pub struct CallOutcome<T> {
    /// What the call produced.
    pub result: Result<T>,
    /// Cleanup failures that happened along the way.
    pub suppressed: Vec<CleanupFailure>,
}

impl<T> CallOutcome<T> {
    /// Wrap a result with no suppressed diagnostics.
    pub fn new(result: Result<T>) -> Self {
        Self {
            result,
            suppressed: Vec::new(),
        }
    }

    /// Transform the primary value, keeping the diagnostics.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CallOutcome<U> {
        CallOutcome {
            result: self.result.map(f),
            suppressed: self.suppressed,
        }
    }

    /// Chain a fallible step on the primary value, keeping the diagnostics.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Result<U>) -> CallOutcome<U> {
        CallOutcome {
            result: self.result.and_then(f),
            suppressed: self.suppressed,
        }
    }

    /// Append diagnostics from a later cleanup step.
    pub fn suppress(&mut self, failures: impl IntoIterator<Item = CleanupFailure>) {
        self.suppressed.extend(failures);
    }

    /// Check whether any cleanup step failed.
    pub fn has_suppressed(&self) -> bool {
        !self.suppressed.is_empty()
    }

    /// Log the suppressed diagnostics and return the primary result.
    pub fn into_result(self) -> Result<T> {
        for failure in &self.suppressed {
            tracing::warn!(
                operation = %failure.operation,
                address = ?failure.address,
                "sandbox cleanup failed: {}",
                failure.message
            );
        }
        self.result
    }
}
