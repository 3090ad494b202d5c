//! Host functions the module imports from `env`.
//!
//! OpenCC is C++ compiled without exception support in the sandbox, but
//! libc++abi still references a handful of unwind entry points. They are
//! provided here so the module links. A throw never unwinds: the throw shim
//! records a diagnostic on the store and fails the current call.

use anyhow::anyhow;
use wasmtime::{Caller, Extern, Func, Linker};

use crate::abi;
use crate::sandbox::limits::StoreData;

/// Import module name.
pub const ENV: &str = "env";

/// Upper bound on the bytes scanned for a thrown diagnostic.
pub const MAX_DIAGNOSTIC_BYTES: usize = 256;

/// Every function registered by [`register`].
pub const IMPORTS: &[&str] = &[
    "__cxa_allocate_exception",
    "__cxa_throw",
    "__cxa_free_exception",
    "__gxx_personality_v0",
    "__cxa_begin_catch",
    "__cxa_end_catch",
];

const UNKNOWN_EXCEPTION: &str = "unhandled exception inside the sandbox";

/// Register the shims on a linker.
pub fn register(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap(
        ENV,
        "__cxa_allocate_exception",
        |mut caller: Caller<'_, StoreData>, size: u32| -> anyhow::Result<u32> {
            let malloc = guest_func(&mut caller, abi::MALLOC)?;
            malloc.typed::<u32, u32>(&caller)?.call(&mut caller, size)
        },
    )?;

    linker.func_wrap(
        ENV,
        "__cxa_throw",
        |mut caller: Caller<'_, StoreData>,
         exception: u32,
         type_info: u32,
         _destructor: u32|
         -> anyhow::Result<()> {
            let mut message = read_diagnostic(&mut caller, exception);
            if message.is_empty() {
                message = UNKNOWN_EXCEPTION.to_string();
            }
            tracing::warn!(exception, type_info, "sandbox threw: {message}");
            caller.data_mut().raise_trap(message.clone());
            Err(anyhow!("sandbox exception: {message}"))
        },
    )?;

    linker.func_wrap(
        ENV,
        "__cxa_free_exception",
        |mut caller: Caller<'_, StoreData>, exception: u32| {
            if let Err(e) = free_guest(&mut caller, exception) {
                tracing::warn!(exception, "failed to free exception memory: {e}");
            }
        },
    )?;

    // No handler ever matches, so the personality routine reports "continue unwinding".
    linker.func_wrap(
        ENV,
        "__gxx_personality_v0",
        |_version: i32, _actions: i32, _class: i64, _exception: i32, _context: i32| -> i32 { 0 },
    )?;

    linker.func_wrap(ENV, "__cxa_begin_catch", |exception: i32| -> i32 {
        exception
    })?;

    linker.func_wrap(ENV, "__cxa_end_catch", || {})?;

    Ok(())
}

/// Decode a NUL-terminated diagnostic, keeping printable ASCII only.
pub fn extract_diagnostic(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(MAX_DIAGNOSTIC_BYTES)
        .take_while(|&&b| b != 0)
        .filter(|&&b| (0x20..=0x7e).contains(&b))
        .map(|&b| b as char)
        .collect()
}

fn read_diagnostic(caller: &mut Caller<'_, StoreData>, address: u32) -> String {
    if address == 0 {
        return String::new();
    }
    let Some(memory) = caller
        .get_export(abi::MEMORY)
        .and_then(Extern::into_memory)
    else {
        return String::new();
    };

    let data = memory.data(&*caller);
    let start = address as usize;
    if start >= data.len() {
        return String::new();
    }
    let end = start.saturating_add(MAX_DIAGNOSTIC_BYTES).min(data.len());
    extract_diagnostic(&data[start..end])
}

fn guest_func(caller: &mut Caller<'_, StoreData>, name: &str) -> anyhow::Result<Func> {
    caller
        .get_export(name)
        .and_then(Extern::into_func)
        .ok_or_else(|| anyhow!("module does not export `{name}`"))
}

fn free_guest(caller: &mut Caller<'_, StoreData>, address: u32) -> anyhow::Result<()> {
    let free = guest_func(caller, abi::FREE)?;
    free.typed::<u32, ()>(&*caller)?.call(&mut *caller, address)
}
