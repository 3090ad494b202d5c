//! Process-wide runtime cache.
//!
//! A [`SandboxRuntime`] owns the engine, the compiled OpenCC module and the
//! pre-linked host imports. Nothing is built until the first instance is
//! requested; after that the compiled state is read-only and shared by every
//! instance created from the runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use wasmtime::{Engine, InstancePre, Linker, Module};
use wasmtime_wasi::preview1;

use crate::error::{BridgeError, Result};
use crate::sandbox::config::{BridgeConfig, ModuleSource};
use crate::sandbox::instance::SandboxInstance;
use crate::sandbox::limits::StoreData;
use crate::sandbox::shims;

/// Counters shared by a runtime and every instance it creates.
#[derive(Debug, Default)]
pub(crate) struct RuntimeCounters {
    pub(crate) compilations: AtomicUsize,
    pub(crate) instances_created: AtomicUsize,
    pub(crate) live_instances: AtomicUsize,
    pub(crate) sandbox_calls: AtomicU64,
}

/// Snapshot of a runtime's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    /// How many times the module was compiled (at most once on success).
    pub compilations: usize,
    /// Instances created since the runtime was built.
    pub instances_created: usize,
    /// Instances not yet torn down.
    pub live_instances: usize,
    /// Calls made into the sandbox, including allocator calls.
    pub sandbox_calls: u64,
}

/// Engine, module and linked imports, built once per runtime.
pub struct CompiledRuntime {
    engine: Engine,
    module: Module,
    pre: InstancePre<StoreData>,
    _ticker: Option<EpochTicker>,
}

impl CompiledRuntime {
    /// The engine every instance runs on.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The compiled module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub(crate) fn instance_pre(&self) -> &InstancePre<StoreData> {
        &self.pre
    }
}

impl std::fmt::Debug for CompiledRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRuntime")
            .field("engine", &"<wasmtime::Engine>")
            .field("module", &self.module.name())
            .field("epoch_ticker", &self._ticker.is_some())
            .finish()
    }
}

/// Lazily initialized runtime shared by converters and one-shot calls.
///
/// # Example
///
/// ```rust,ignore
/// use wasm_opencc_rs::prelude::*;
///
/// let runtime = SandboxRuntime::new(BridgeConfig::default());
/// let traditional = runtime.convert(Direction::SimplifiedToTraditional, "简体字")?;
/// assert_eq!(traditional, "簡體字");
/// assert_eq!(runtime.stats().compilations, 1);
/// ```
pub struct SandboxRuntime {
    config: BridgeConfig,
    compiled: OnceLock<CompiledRuntime>,
    init_lock: Mutex<()>,
    counters: Arc<RuntimeCounters>,
}

impl std::fmt::Debug for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .field("stats", &self.stats())
            .finish()
    }
}

impl AsRef<SandboxRuntime> for SandboxRuntime {
    fn as_ref(&self) -> &SandboxRuntime {
        self
    }
}

impl SandboxRuntime {
    /// Create a runtime. The module is not compiled until first use.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            compiled: OnceLock::new(),
            init_lock: Mutex::new(()),
            counters: Arc::new(RuntimeCounters::default()),
        }
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Whether the engine and module have been built.
    pub fn is_initialized(&self) -> bool {
        self.compiled.get().is_some()
    }

    /// Get the compiled runtime, building it on first call.
    ///
    /// Concurrent first callers serialize on a mutex; exactly one of them
    /// compiles. A failed build is not cached, so the next call retries.
    pub fn acquire(&self) -> Result<&CompiledRuntime> {
        if let Some(compiled) = self.compiled.get() {
            return Ok(compiled);
        }

        let _guard = self.init_lock.lock().unwrap_or_else(|e| e.into_inner());
        // Double-check pattern: another thread might have built it while we waited
        if let Some(compiled) = self.compiled.get() {
            return Ok(compiled);
        }

        let compiled = self.build()?;
        Ok(self.compiled.get_or_init(|| compiled))
    }

    /// Create a fresh instance bound to this runtime.
    pub fn new_instance(&self) -> Result<SandboxInstance> {
        SandboxInstance::new(self)
    }

    /// Snapshot the runtime counters.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            compilations: self.counters.compilations.load(Ordering::SeqCst),
            instances_created: self.counters.instances_created.load(Ordering::SeqCst),
            live_instances: self.counters.live_instances.load(Ordering::SeqCst),
            sandbox_calls: self.counters.sandbox_calls.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn counters(&self) -> &Arc<RuntimeCounters> {
        &self.counters
    }

    fn build(&self) -> Result<CompiledRuntime> {
        let started = Instant::now();

        let mut engine_config = wasmtime::Config::new();
        engine_config.epoch_interruption(self.config.call_timeout.is_some());
        engine_config.consume_fuel(self.config.max_fuel.is_some());
        let engine =
            Engine::new(&engine_config).map_err(|e| BridgeError::init("create engine", e))?;

        let wasm_bytes = self.module_bytes()?;
        let module = Module::new(&engine, &wasm_bytes[..])
            .map_err(|e| BridgeError::init("compile module", e))?;
        self.counters.compilations.fetch_add(1, Ordering::SeqCst);

        let mut linker: Linker<StoreData> = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi)
            .map_err(|e| BridgeError::init("link WASI", e))?;
        shims::register(&mut linker).map_err(|e| BridgeError::init("register host imports", e))?;
        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| BridgeError::init("resolve module imports", e))?;

        let ticker = match self.config.call_timeout {
            Some(_) => Some(
                EpochTicker::start(engine.clone(), self.config.epoch_tick_interval)
                    .map_err(|e| BridgeError::init("start epoch ticker", e))?,
            ),
            None => None,
        };

        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            imports = module.imports().len(),
            "compiled OpenCC module"
        );

        Ok(CompiledRuntime {
            engine,
            module,
            pre,
            _ticker: ticker,
        })
    }

    fn module_bytes(&self) -> Result<Arc<[u8]>> {
        match &self.config.module {
            ModuleSource::Bytes(bytes) => Ok(Arc::clone(bytes)),
            ModuleSource::File(path) => std::fs::read(path).map(Arc::from).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    BridgeError::ModuleNotFound(path.display().to_string())
                } else {
                    BridgeError::Io(e)
                }
            }),
        }
    }
}

/// Background thread advancing the engine epoch for call timeouts.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("opencc-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

static GLOBAL_RUNTIME: OnceLock<SandboxRuntime> = OnceLock::new();

/// Install the configuration used by the process-wide runtime.
///
/// Returns the configuration back if the global runtime already exists.
pub fn configure_global(config: BridgeConfig) -> std::result::Result<(), BridgeConfig> {
    let mut pending = Some(config);
    GLOBAL_RUNTIME.get_or_init(|| SandboxRuntime::new(pending.take().unwrap_or_default()));
    match pending {
        None => Ok(()),
        Some(config) => Err(config),
    }
}

/// Get the process-wide runtime.
///
/// Used by [`Converter::open`](crate::Converter::open) and the free
/// conversion functions. Built from [`BridgeConfig::default`] unless
/// [`configure_global`] ran first.
pub fn global_runtime() -> &'static SandboxRuntime {
    GLOBAL_RUNTIME.get_or_init(|| SandboxRuntime::new(BridgeConfig::default()))
}
