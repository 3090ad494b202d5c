//! Moving values across the host/sandbox boundary.
//!
//! Every OpenCC export takes and returns `i32`s. Strings travel as addresses
//! of NUL-terminated buffers in linear memory: arguments are allocated here
//! and freed before [`call`] returns; returned strings are copied out and,
//! when the module hands over ownership, released through the module's own
//! deallocator.
//!
//! Argument buffers are released by convention, one per string argument.
//! None of the exports used here keep or reallocate an argument buffer.

use wasmtime::{FuncType, Val, ValType};

use crate::abi::{self, Direction};
use crate::error::{BridgeError, CallOutcome, CleanupFailure, Result};
use crate::sandbox::instance::SandboxInstance;

/// An argument to an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    /// Passed as the address of a NUL-terminated copy.
    Str(&'a str),
    /// Passed through unchanged.
    U32(u32),
    /// Passed through unchanged.
    I32(i32),
}

/// How to decode an export's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// A string the caller owns; released with `free_with` after copying.
    OwnedString {
        /// Export that releases the string.
        free_with: &'static str,
    },
    /// A string owned by the module; copied, never released.
    BorrowedString,
    /// The raw `i32` reinterpreted as unsigned.
    U32,
    /// The raw `i32`.
    I32,
    /// No return value.
    Unit,
}

impl ResultKind {
    fn result_count(self) -> usize {
        match self {
            ResultKind::Unit => 0,
            _ => 1,
        }
    }
}

/// A decoded return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A copied string; a null address decodes as empty.
    Str(String),
    /// Unsigned integer.
    U32(u32),
    /// Signed integer.
    I32(i32),
    /// Nothing.
    Unit,
}

impl Value {
    /// Expect a string result.
    pub fn into_string(self, function: &str) -> Result<String> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(BridgeError::unsupported(function, format!("expected string, got {other:?}"))),
        }
    }

    /// Expect an unsigned result.
    pub fn into_u32(self, function: &str) -> Result<u32> {
        match self {
            Value::U32(v) => Ok(v),
            other => Err(BridgeError::unsupported(function, format!("expected u32, got {other:?}"))),
        }
    }

    /// Expect a signed result.
    pub fn into_i32(self, function: &str) -> Result<i32> {
        match self {
            Value::I32(v) => Ok(v),
            other => Err(BridgeError::unsupported(function, format!("expected i32, got {other:?}"))),
        }
    }
}

/// The exports this crate calls, with their typed arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportCall<'a> {
    /// `opencc_open(config) -> handle`
    Open {
        /// Configuration file name, e.g. `s2t.json`.
        config: &'a str,
    },
    /// `opencc_close(handle) -> status`
    Close {
        /// Handle from a previous open.
        handle: u32,
    },
    /// `opencc_convert(handle, input) -> owned string`
    Convert {
        /// Handle from a previous open.
        handle: u32,
        /// UTF-8 text.
        input: &'a str,
    },
    /// `opencc_s2t(input)` or `opencc_t2s(input)`
    ConvertFixed {
        /// Which fixed export to call.
        direction: Direction,
        /// UTF-8 text.
        input: &'a str,
    },
    /// `opencc_error() -> borrowed string`
    LastError,
}

impl<'a> ExportCall<'a> {
    /// The export this call targets.
    pub fn name(&self) -> &'static str {
        match self {
            ExportCall::Open { .. } => abi::OPEN,
            ExportCall::Close { .. } => abi::CLOSE,
            ExportCall::Convert { .. } => abi::CONVERT,
            ExportCall::ConvertFixed { direction, .. } => direction.export(),
            ExportCall::LastError => abi::ERROR,
        }
    }

    /// The arguments, in export order.
    pub fn args(&self) -> Vec<Arg<'a>> {
        match *self {
            ExportCall::Open { config } => vec![Arg::Str(config)],
            ExportCall::Close { handle } => vec![Arg::U32(handle)],
            ExportCall::Convert { handle, input } => vec![Arg::U32(handle), Arg::Str(input)],
            ExportCall::ConvertFixed { input, .. } => vec![Arg::Str(input)],
            ExportCall::LastError => Vec::new(),
        }
    }

    /// How the return value is decoded.
    pub fn result_kind(&self) -> ResultKind {
        match self {
            ExportCall::Open { .. } => ResultKind::U32,
            ExportCall::Close { .. } => ResultKind::I32,
            ExportCall::Convert { .. } | ExportCall::ConvertFixed { .. } => {
                ResultKind::OwnedString {
                    free_with: abi::CONVERT_FREE,
                }
            }
            ExportCall::LastError => ResultKind::BorrowedString,
        }
    }
}

/// Perform a typed export call.
pub fn dispatch(instance: &mut SandboxInstance, export: &ExportCall<'_>) -> CallOutcome<Value> {
    call(instance, export.name(), &export.args(), export.result_kind())
}

/// Call `name` with `args`, decoding the result as `kind`.
///
/// String arguments are freed before this returns, whether the call
/// succeeded or not. Failures to free are reported in
/// [`CallOutcome::suppressed`] and never replace the primary result.
pub fn call(
    instance: &mut SandboxInstance,
    name: &str,
    args: &[Arg<'_>],
    kind: ResultKind,
) -> CallOutcome<Value> {
    let mut buffers = Vec::with_capacity(args.len());
    let mut suppressed = Vec::new();

    let result = invoke(instance, name, args, kind, &mut buffers, &mut suppressed);

    for address in buffers {
        if let Err(e) = instance.free(address) {
            suppressed.push(CleanupFailure::new(abi::FREE, Some(address), &e));
        }
    }

    CallOutcome { result, suppressed }
}

fn invoke(
    instance: &mut SandboxInstance,
    name: &str,
    args: &[Arg<'_>],
    kind: ResultKind,
    buffers: &mut Vec<u32>,
    suppressed: &mut Vec<CleanupFailure>,
) -> Result<Value> {
    let func = instance.get_func(name)?;
    check_signature(name, &instance.func_type(&func), args.len(), kind)?;

    let mut params = Vec::with_capacity(args.len());
    for arg in args {
        let param = match *arg {
            Arg::Str(s) => Val::I32(write_c_string(instance, s, buffers)? as i32),
            Arg::U32(v) => Val::I32(v as i32),
            Arg::I32(v) => Val::I32(v),
        };
        params.push(param);
    }

    let mut results = vec![Val::I32(0); kind.result_count()];
    instance.call_func(name, &func, &params, &mut results)?;

    let raw = match (kind, results.first()) {
        (ResultKind::Unit, _) => return Ok(Value::Unit),
        (_, Some(Val::I32(raw))) => *raw,
        (_, other) => {
            return Err(BridgeError::unsupported(name, format!("unexpected result {other:?}")))
        }
    };

    match kind {
        ResultKind::U32 => Ok(Value::U32(raw as u32)),
        ResultKind::I32 => Ok(Value::I32(raw)),
        ResultKind::BorrowedString => read_string(instance, raw as u32).map(Value::Str),
        ResultKind::OwnedString { free_with } => {
            let address = raw as u32;
            let text = read_string(instance, address);
            if address != 0 {
                if let Err(e) = instance.invoke::<u32, ()>(free_with, address) {
                    suppressed.push(CleanupFailure::new(free_with, Some(address), &e));
                }
            }
            text.map(Value::Str)
        }
        ResultKind::Unit => Ok(Value::Unit),
    }
}

/// Copy `s` into a fresh NUL-terminated buffer and record it for release.
fn write_c_string(instance: &mut SandboxInstance, s: &str, buffers: &mut Vec<u32>) -> Result<u32> {
    let size = u32::try_from(s.len() + 1)
        .map_err(|_| BridgeError::AllocationFailed { size: u32::MAX })?;
    let address = instance.alloc(size)?;
    buffers.push(address);

    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    instance.write_bytes(address, &bytes)?;
    Ok(address)
}

fn read_string(instance: &SandboxInstance, address: u32) -> Result<String> {
    if address == 0 {
        return Ok(String::new());
    }
    instance.read_c_string(address)
}

fn check_signature(name: &str, ty: &FuncType, arg_count: usize, kind: ResultKind) -> Result<()> {
    let params: Vec<ValType> = ty.params().collect();
    if params.len() != arg_count {
        return Err(BridgeError::unsupported(
            name,
            format!("export takes {} parameters, {arg_count} supplied", params.len()),
        ));
    }
    if let Some(param) = params.iter().find(|p| !matches!(p, ValType::I32)) {
        return Err(BridgeError::unsupported(
            name,
            format!("parameter type {param:?} cannot carry a string or integer"),
        ));
    }

    let results: Vec<ValType> = ty.results().collect();
    match (kind.result_count(), results.as_slice()) {
        (0, []) | (1, [ValType::I32]) => Ok(()),
        (_, other) => Err(BridgeError::unsupported(
            name,
            format!("export returns {other:?}, expected {kind:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::cache::SandboxRuntime;
    use crate::sandbox::config::{BridgeConfig, StdioMode};

    const MOCK: &str = include_str!("../../tests/fixtures/mock_opencc.wat");

    fn runtime() -> SandboxRuntime {
        SandboxRuntime::new(
            BridgeConfig::builder()
                .module_bytes(MOCK.as_bytes().to_vec())
                .no_data_dir()
                .stdio(StdioMode::Discard)
                .build(),
        )
    }

    fn live_allocations(instance: &mut SandboxInstance) -> i32 {
        instance.invoke("live_allocations", ()).unwrap()
    }

    #[test]
    fn test_string_in_string_out() {
        let runtime = runtime();
        let mut instance = runtime.new_instance().unwrap();

        let outcome = dispatch(
            &mut instance,
            &ExportCall::ConvertFixed {
                direction: Direction::SimplifiedToTraditional,
                input: "abc",
            },
        );
        assert!(!outcome.has_suppressed());
        assert_eq!(outcome.result.unwrap(), Value::Str("ABC".to_string()));
        assert_eq!(live_allocations(&mut instance), 0);
    }

    #[test]
    fn test_null_result_is_empty_string() {
        let runtime = runtime();
        let mut instance = runtime.new_instance().unwrap();

        for input in ["", "!nope"] {
            let value = dispatch(
                &mut instance,
                &ExportCall::ConvertFixed {
                    direction: Direction::TraditionalToSimplified,
                    input,
                },
            )
            .into_result()
            .unwrap();
            assert_eq!(value, Value::Str(String::new()));
        }
        assert_eq!(live_allocations(&mut instance), 0);
    }

    #[test]
    fn test_arguments_freed_when_sandbox_traps() {
        let runtime = runtime();
        let mut instance = runtime.new_instance().unwrap();

        let err = dispatch(
            &mut instance,
            &ExportCall::ConvertFixed {
                direction: Direction::SimplifiedToTraditional,
                input: "#explode",
            },
        )
        .into_result()
        .unwrap_err();

        assert_eq!(err.trap_message(), Some("invalid conversion request"));
        assert_eq!(live_allocations(&mut instance), 0);
    }

    #[test]
    fn test_integer_reinterpretation() {
        let runtime = runtime();
        let mut instance = runtime.new_instance().unwrap();

        let signed = call(&mut instance, abi::CLOSE, &[Arg::U32(99)], ResultKind::I32)
            .into_result()
            .unwrap();
        assert_eq!(signed, Value::I32(-1));

        let unsigned = call(&mut instance, abi::CLOSE, &[Arg::I32(99)], ResultKind::U32)
            .into_result()
            .unwrap();
        assert_eq!(unsigned, Value::U32(u32::MAX));
    }

    #[test]
    fn test_borrowed_string_is_not_freed() {
        let runtime = runtime();
        let mut instance = runtime.new_instance().unwrap();

        let calls_before = runtime.stats().sandbox_calls;
        let message = dispatch(&mut instance, &ExportCall::LastError)
            .into_result()
            .unwrap()
            .into_string(abi::ERROR)
            .unwrap();

        assert_eq!(message, "no error");
        assert_eq!(runtime.stats().sandbox_calls, calls_before + 1);
    }

    #[test]
    fn test_arity_mismatch_allocates_nothing() {
        let runtime = runtime();
        let mut instance = runtime.new_instance().unwrap();

        let err = call(
            &mut instance,
            abi::S2T,
            &[Arg::Str("a"), Arg::Str("b")],
            ResultKind::OwnedString {
                free_with: abi::CONVERT_FREE,
            },
        )
        .into_result()
        .unwrap_err();

        assert!(matches!(err, BridgeError::UnsupportedType { .. }));
        assert_eq!(runtime.stats().sandbox_calls, 0);
    }

    #[test]
    fn test_result_kind_mismatch() {
        let runtime = runtime();
        let mut instance = runtime.new_instance().unwrap();

        let err = call(&mut instance, "spin", &[], ResultKind::U32)
            .into_result()
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedType { .. }));
    }

    #[test]
    fn test_missing_export() {
        let runtime = runtime();
        let mut instance = runtime.new_instance().unwrap();

        let err = call(&mut instance, "opencc_s2hk", &[Arg::Str("x")], ResultKind::BorrowedString)
            .into_result()
            .unwrap_err();
        assert!(matches!(err, BridgeError::FunctionNotFound(name) if name == "opencc_s2hk"));
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::U32(7).into_u32("f").unwrap(), 7);
        assert_eq!(Value::I32(-7).into_i32("f").unwrap(), -7);
        assert!(matches!(
            Value::Unit.into_string("f"),
            Err(BridgeError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_export_call_lowering() {
        let convert = ExportCall::Convert {
            handle: 3,
            input: "x",
        };
        assert_eq!(convert.name(), "opencc_convert");
        assert_eq!(convert.args(), vec![Arg::U32(3), Arg::Str("x")]);
        assert_eq!(
            convert.result_kind(),
            ResultKind::OwnedString {
                free_with: "opencc_convert_free"
            }
        );
        assert_eq!(ExportCall::LastError.args(), Vec::new());
    }
}
