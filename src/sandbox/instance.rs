//! One running instantiation of the OpenCC module.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use wasmtime::{Func, FuncType, Instance, Memory, Store, Trap, TypedFunc, Val, WasmParams, WasmResults};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::abi;
use crate::error::{BridgeError, Result};
use crate::sandbox::cache::{RuntimeCounters, SandboxRuntime};
use crate::sandbox::config::{BridgeConfig, StdioMode};
use crate::sandbox::limits::{StoreData, StoreLimiterExt};

/// Bytes kept per captured stream.
const CAPTURE_CAPACITY: usize = 64 * 1024;

/// A module instance with its own store, linear memory and mounted data.
///
/// Instances are exclusively owned: every call takes `&mut self`, so at most
/// one call is in flight. Dropping the instance releases everything the
/// sandbox held.
pub struct SandboxInstance {
    id: usize,
    store: Store<StoreData>,
    instance: Instance,
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    stdout: Option<MemoryOutputPipe>,
    stderr: Option<MemoryOutputPipe>,
    deadline_ticks: Option<u64>,
    max_fuel: Option<u64>,
    call_timeout: Option<Duration>,
    counters: Arc<RuntimeCounters>,
}

impl std::fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("id", &self.id)
            .field("memory_bytes", &self.memory.data_size(&self.store))
            .finish()
    }
}

impl SandboxInstance {
    /// Instantiate the runtime's module, compiling it first if needed.
    pub fn new(runtime: &SandboxRuntime) -> Result<Self> {
        let compiled = runtime.acquire()?;
        let config = runtime.config();
        let (wasi, stdout, stderr) = build_wasi(config)?;

        let mut store = Store::new(compiled.engine(), StoreData::new(config.max_memory, wasi));
        store.configure_limiter();

        let deadline_ticks = config.epoch_deadline_ticks();
        if let Some(ticks) = deadline_ticks {
            store.epoch_deadline_trap();
            store.set_epoch_deadline(ticks);
        }
        if let Some(fuel) = config.max_fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::init("set fuel", e))?;
        }

        let instance = compiled
            .instance_pre()
            .instantiate(&mut store)
            .map_err(|e| {
                let e = if store.data_mut().limiter.take_limit_exceeded() {
                    e.context("memory limit exceeded during instantiation")
                } else {
                    e
                };
                BridgeError::init("instantiate module", e)
            })?;

        if let Some(initialize) = instance.get_func(&mut store, abi::INITIALIZE) {
            initialize
                .typed::<(), ()>(&store)
                .and_then(|f| f.call(&mut store, ()))
                .map_err(|e| BridgeError::init("run _initialize", e))?;
        }

        let memory = instance
            .get_memory(&mut store, abi::MEMORY)
            .ok_or_else(|| {
                BridgeError::init("resolve exports", anyhow!("module does not export `memory`"))
            })?;
        let malloc = instance
            .get_typed_func::<u32, u32>(&mut store, abi::MALLOC)
            .map_err(|e| BridgeError::init("resolve exports", e))?;
        let free = instance
            .get_typed_func::<u32, ()>(&mut store, abi::FREE)
            .map_err(|e| BridgeError::init("resolve exports", e))?;

        let counters = Arc::clone(runtime.counters());
        let id = counters.instances_created.fetch_add(1, Ordering::SeqCst);
        counters.live_instances.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(instance = id, "created sandbox instance");

        Ok(Self {
            id,
            store,
            instance,
            memory,
            malloc,
            free,
            stdout,
            stderr,
            deadline_ticks,
            max_fuel: config.max_fuel,
            call_timeout: config.call_timeout,
            counters,
        })
    }

    /// Sequence number of this instance within its runtime.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Call an export with statically typed parameters and results.
    pub fn invoke<P, R>(&mut self, name: &str, params: P) -> Result<R>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self.get_func(name)?;
        let typed = func
            .typed::<P, R>(&self.store)
            .map_err(|e| BridgeError::unsupported(name, e.to_string()))?;

        self.arm(name)?;
        match typed.call(&mut self.store, params) {
            Ok(results) => Ok(results),
            Err(e) => Err(self.classify(name, e)),
        }
    }

    /// Look up an exported function.
    pub fn get_func(&mut self, name: &str) -> Result<Func> {
        self.instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| BridgeError::FunctionNotFound(name.to_string()))
    }

    /// The signature of an exported function.
    pub fn func_type(&self, func: &Func) -> FuncType {
        func.ty(&self.store)
    }

    /// Call a function with dynamically typed values.
    pub fn call_func(
        &mut self,
        name: &str,
        func: &Func,
        params: &[Val],
        results: &mut [Val],
    ) -> Result<()> {
        self.arm(name)?;
        func.call(&mut self.store, params, results)
            .map_err(|e| self.classify(name, e))
    }

    /// Allocate `size` bytes with the module's allocator.
    pub fn alloc(&mut self, size: u32) -> Result<u32> {
        self.arm(abi::MALLOC)?;
        let address = match self.malloc.call(&mut self.store, size) {
            Ok(address) => address,
            Err(e) => return Err(self.classify(abi::MALLOC, e)),
        };

        if address == 0 {
            if self.store.data_mut().limiter.take_limit_exceeded() {
                return Err(BridgeError::MemoryLimitExceeded(format!(
                    "allocation of {size} bytes denied"
                )));
            }
            return Err(BridgeError::AllocationFailed { size });
        }
        Ok(address)
    }

    /// Release memory obtained from [`alloc`](Self::alloc). Null is a no-op.
    pub fn free(&mut self, address: u32) -> Result<()> {
        if address == 0 {
            return Ok(());
        }
        self.arm(abi::FREE)?;
        self.free
            .call(&mut self.store, address)
            .map_err(|e| self.classify(abi::FREE, e))
    }

    /// Copy bytes into linear memory.
    pub fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        self.memory
            .write(&mut self.store, address as usize, bytes)
            .map_err(|e| BridgeError::MemoryAccess {
                address,
                reason: e.to_string(),
            })
    }

    /// Read a NUL-terminated string starting at `address`.
    ///
    /// Reading stops at the first NUL or at the end of linear memory.
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn read_c_string(&self, address: u32) -> Result<String> {
        let data = self.memory.data(&self.store);
        let tail = data
            .get(address as usize..)
            .filter(|tail| !tail.is_empty())
            .ok_or_else(|| BridgeError::MemoryAccess {
                address,
                reason: format!("outside linear memory of {} bytes", data.len()),
            })?;

        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }

    /// Current size of linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    /// Largest linear memory size this instance has reached, in bytes.
    pub fn peak_memory(&self) -> u64 {
        self.store.data().limiter.peak_memory()
    }

    /// Output the module wrote to stdout, when stdio is captured.
    pub fn captured_stdout(&self) -> Option<String> {
        self.stdout
            .as_ref()
            .map(|pipe| String::from_utf8_lossy(&pipe.contents()).into_owned())
    }

    /// Output the module wrote to stderr, when stdio is captured.
    pub fn captured_stderr(&self) -> Option<String> {
        self.stderr
            .as_ref()
            .map(|pipe| String::from_utf8_lossy(&pipe.contents()).into_owned())
    }

    /// Tear the instance down.
    pub fn close(self) {
        drop(self);
    }

    /// Reset per-call limits before entering the sandbox.
    fn arm(&mut self, function: &str) -> Result<()> {
        if let Some(ticks) = self.deadline_ticks {
            self.store.set_epoch_deadline(ticks);
        }
        if let Some(fuel) = self.max_fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|source| BridgeError::Invocation {
                    function: function.to_string(),
                    source,
                })?;
        }

        let data = self.store.data_mut();
        data.take_pending_trap();
        data.limiter.take_limit_exceeded();

        self.counters.sandbox_calls.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(instance = self.id, function, "entering sandbox");
        Ok(())
    }

    /// Map a runtime failure to the error the caller should see.
    fn classify(&mut self, function: &str, error: anyhow::Error) -> BridgeError {
        let data = self.store.data_mut();
        if let Some(message) = data.take_pending_trap() {
            return BridgeError::SandboxTrap {
                function: function.to_string(),
                message,
            };
        }
        let limit_hit = data.limiter.take_limit_exceeded();

        match error.downcast_ref::<Trap>() {
            Some(Trap::Interrupt) => {
                return BridgeError::Timeout(self.call_timeout.unwrap_or_default());
            }
            Some(Trap::OutOfFuel) => return BridgeError::OutOfFuel,
            _ => {}
        }

        if limit_hit {
            return BridgeError::MemoryLimitExceeded(format!(
                "memory limit exceeded in `{function}`"
            ));
        }

        BridgeError::Invocation {
            function: function.to_string(),
            source: error,
        }
    }
}

impl Drop for SandboxInstance {
    fn drop(&mut self) {
        self.counters.live_instances.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(instance = self.id, "closed sandbox instance");
    }
}

fn build_wasi(
    config: &BridgeConfig,
) -> Result<(WasiP1Ctx, Option<MemoryOutputPipe>, Option<MemoryOutputPipe>)> {
    let mut builder = WasiCtxBuilder::new();
    builder.args(&[config.program_name.as_str()]);

    if let Some(dir) = &config.data_dir {
        builder
            .preopened_dir(dir, "/", DirPerms::READ, FilePerms::READ)
            .map_err(|e| {
                BridgeError::init(
                    "mount data directory",
                    e.context(format!("cannot mount {}", dir.display())),
                )
            })?;
    }

    let (stdout, stderr) = match config.stdio {
        StdioMode::Inherit => {
            builder.inherit_stdout().inherit_stderr();
            (None, None)
        }
        StdioMode::Capture => {
            let stdout = MemoryOutputPipe::new(CAPTURE_CAPACITY);
            let stderr = MemoryOutputPipe::new(CAPTURE_CAPACITY);
            builder.stdout(stdout.clone()).stderr(stderr.clone());
            (Some(stdout), Some(stderr))
        }
        // The WASI default for unset streams is a closed sink.
        StdioMode::Discard => (None, None),
    };

    Ok((builder.build_p1(), stdout, stderr))
}
