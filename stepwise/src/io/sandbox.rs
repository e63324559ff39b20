//! In-process execution of WebAssembly text modules.
//!
//! Code is compiled in isolation first so syntax errors never reach
//! instantiation. Modules may only import the host functions registered in
//! module `env`:
//!
//! | name        | signature        | effect                                  |
//! |-------------|------------------|-----------------------------------------|
//! | `print`     | `(ptr i32, len i32)` | append bytes from exported `memory` |
//! | `print_i64` | `(i64)`          | append the number and a newline         |
//! | `print_f64` | `(f64)`          | append the number and a newline         |
//! | `exit`      | `(code i32)`     | stop the module; counts as success      |
//! | `now_ms`    | `() -> i64`      | wall clock in unix milliseconds         |
//! | `random`    | `() -> f64`      | uniform in `[0, 1)`                     |
//! | `sleep_ms`  | `(ms i64)`       | sleep, waking early on interrupt        |
//!
//! The entry point is the exported `_start` or `main` function; a module
//! with neither only runs its start section.

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};
use wasmtime::{Caller, Config, Engine, Extern, Instance, Linker, Module, Store, Trap};

use crate::core::types::RunStatus;
use crate::io::interrupt::Interrupt;

const HOST_MODULE: &str = "env";
const ENTRY_POINTS: [&str; 2] = ["_start", "main"];
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Host error raised by the `exit` import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitRequest(i32);

impl fmt::Display for ExitRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module requested exit with code {}", self.0)
    }
}

impl std::error::Error for ExitRequest {}

struct HostState {
    output: Vec<u8>,
    interrupt: Interrupt,
}

/// Result of one in-process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRun {
    pub status: RunStatus,
    pub stdout_lines: Vec<String>,
}

/// Compiles and runs WebAssembly text with a fixed set of host imports.
pub struct Sandbox {
    engine: Engine,
    linker: Linker<HostState>,
    interrupt: Interrupt,
}

impl Sandbox {
    pub fn new(interrupt: Interrupt) -> Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).context("create wasm engine")?;
        let linker = host_linker(&engine)?;
        Ok(Self {
            engine,
            linker,
            interrupt,
        })
    }

    /// Compile `source` without running it. The error is the compiler message.
    pub fn compile(&self, source: &str) -> std::result::Result<Module, String> {
        let bytes = wat::parse_str(source).map_err(|e| e.to_string())?;
        Module::from_binary(&self.engine, &bytes).map_err(|e| format!("{e:#}"))
    }

    /// Compile and run `source`, capturing everything it prints.
    ///
    /// Captured output is echoed to stdout once the module stops, whatever the
    /// reason.
    #[instrument(skip_all, fields(bytes = source.len()))]
    pub fn run(&self, source: &str) -> Result<SandboxRun> {
        let module = match self.compile(source) {
            Ok(module) => module,
            Err(msg) => {
                info!("module failed to compile");
                return Ok(SandboxRun {
                    status: RunStatus::CompileError(msg),
                    stdout_lines: Vec::new(),
                });
            }
        };

        let mut store = Store::new(
            &self.engine,
            HostState {
                output: Vec::new(),
                interrupt: self.interrupt.clone(),
            },
        );
        store.set_epoch_deadline(1);

        let watcher = EpochWatcher::spawn(self.engine.clone(), self.interrupt.clone())?;
        let result = self.instantiate_and_call(&mut store, &module);
        watcher.finish();

        let output = std::mem::take(&mut store.data_mut().output);
        let stdout_lines = echo_and_split(&output);
        let status = match result {
            Ok(()) => RunStatus::Succeeded,
            Err(err) => classify(&err),
        };
        debug!(status = ?status, lines = stdout_lines.len(), "module finished");
        Ok(SandboxRun {
            status,
            stdout_lines,
        })
    }

    fn instantiate_and_call(&self, store: &mut Store<HostState>, module: &Module) -> Result<()> {
        let instance: Instance = self.linker.instantiate(&mut *store, module)?;
        let Some(entry) = ENTRY_POINTS
            .iter()
            .find_map(|name| instance.get_func(&mut *store, name))
        else {
            debug!("module has no entry point export");
            return Ok(());
        };
        let entry = entry
            .typed::<(), ()>(&*store)
            .context("entry point must take no parameters and return nothing")?;
        entry.call(&mut *store, ())?;
        Ok(())
    }
}

fn classify(err: &anyhow::Error) -> RunStatus {
    if let Some(ExitRequest(code)) = err.downcast_ref::<ExitRequest>() {
        info!(code, "module exited");
        return RunStatus::Exited(*code);
    }
    if err.downcast_ref::<Trap>() == Some(&Trap::Interrupt) {
        warn!("module interrupted by operator");
        return RunStatus::Interrupted;
    }
    RunStatus::RuntimeError(format!("{err:#}"))
}

fn host_linker(engine: &Engine) -> Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);
    linker
        .func_wrap(
            HOST_MODULE,
            "print",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<()> {
                let memory = caller
                    .get_export("memory")
                    .and_then(Extern::into_memory)
                    .ok_or_else(|| anyhow!("print requires an exported memory"))?;
                let start = usize::try_from(ptr).context("negative print pointer")?;
                let len = usize::try_from(len).context("negative print length")?;
                let bytes = start
                    .checked_add(len)
                    .and_then(|end| memory.data(&caller).get(start..end))
                    .ok_or_else(|| anyhow!("print range {start}+{len} is out of bounds"))?
                    .to_vec();
                caller.data_mut().output.extend_from_slice(&bytes);
                Ok(())
            },
        )
        .context("register print")?;
    linker
        .func_wrap(
            HOST_MODULE,
            "print_i64",
            |mut caller: Caller<'_, HostState>, value: i64| {
                caller
                    .data_mut()
                    .output
                    .extend_from_slice(format!("{value}\n").as_bytes());
            },
        )
        .context("register print_i64")?;
    linker
        .func_wrap(
            HOST_MODULE,
            "print_f64",
            |mut caller: Caller<'_, HostState>, value: f64| {
                caller
                    .data_mut()
                    .output
                    .extend_from_slice(format!("{value}\n").as_bytes());
            },
        )
        .context("register print_f64")?;
    linker
        .func_wrap(HOST_MODULE, "exit", |code: i32| -> Result<()> {
            Err(ExitRequest(code).into())
        })
        .context("register exit")?;
    linker
        .func_wrap(HOST_MODULE, "now_ms", || -> i64 {
            chrono::Utc::now().timestamp_millis()
        })
        .context("register now_ms")?;
    linker
        .func_wrap(HOST_MODULE, "random", || -> f64 { rand::random::<f64>() })
        .context("register random")?;
    linker
        .func_wrap(
            HOST_MODULE,
            "sleep_ms",
            |caller: Caller<'_, HostState>, ms: i64| -> Result<()> {
                let total = Duration::from_millis(u64::try_from(ms).unwrap_or(0));
                let deadline = Instant::now() + total;
                loop {
                    if caller.data().interrupt.is_set() {
                        return Err(Trap::Interrupt.into());
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
            },
        )
        .context("register sleep_ms")?;
    Ok(linker)
}

/// Bumps the engine epoch once the operator interrupts, trapping running code.
struct EpochWatcher {
    done: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl EpochWatcher {
    fn spawn(engine: Engine, interrupt: Interrupt) -> Result<Self> {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let handle = thread::Builder::new()
            .name("wasm-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    if interrupt.is_set() {
                        engine.increment_epoch();
                        return;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            })
            .context("spawn epoch watcher")?;
        Ok(Self { done, handle })
    }

    fn finish(self) {
        self.done.store(true, Ordering::SeqCst);
        if self.handle.join().is_err() {
            warn!("epoch watcher panicked");
        }
    }
}

fn echo_and_split(output: &[u8]) -> Vec<String> {
    if output.is_empty() {
        return Vec::new();
    }
    let mut out = std::io::stdout().lock();
    if let Err(e) = out.write_all(output).and_then(|()| out.flush()) {
        warn!(err = %e, "failed to echo module output");
    }
    String::from_utf8_lossy(output)
        .lines()
        .map(str::to_string)
        .collect()
}
