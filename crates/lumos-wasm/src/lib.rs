#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-wasm** – In-process WebAssembly compute sandbox.
//!
//! Each launched app runs on its own dedicated thread with its own engine
//! and store: capped memory (validated against the binary before
//! compilation), an epoch-based CPU deadline, and capability-gated host
//! functions under the `llmos` import namespace. Host calls are strictly
//! serial per app: the guest blocks on its thread until the kernel
//! answers over the call channel.
//!
//! A module is only instantiated if every memory it declares carries a
//! bounded maximum within the per-launch limit, and only if every gated
//! import it requires is covered by a granted capability.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, info, warn};
use wasmtime::{Caller, Config, Engine, Extern, Linker, Module, Store, Val};

use lumos_types::Capability;

pub mod hostcall;
pub mod validate;

pub use hostcall::{DenyAllHost, HostCall, HostCallRequest, HostInterface, HostResponse, MAX_PAYLOAD_BYTES};
pub use validate::validate_memory;

/// Default CPU deadline per launch.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default initial pages ensured for the module's exported memory.
pub const DEFAULT_MEMORY_PAGES: u32 = 16;

/// Default upper bound on declared memory maxima, in 64 KiB pages.
pub const DEFAULT_MAX_MEMORY_PAGES: u32 = 1024;

const STATE_RUNNING: u8 = 0;
const STATE_DONE: u8 = 1;
const STATE_FAILED: u8 = 2;
const STATE_KILLED: u8 = 3;
const STATE_TIMED_OUT: u8 = 4;

/// Sandbox errors. `Display` strings for the launch-path failures are part
/// of the API surface.
#[derive(Debug, thiserror::Error)]
pub enum WasmError {
    /// An app with this id is already running.
    #[error("app already running: {0}")]
    Conflict(String),
    /// A memory lacks a declared maximum.
    #[error("unbounded memory")]
    UnboundedMemory,
    /// A memory maximum exceeds the per-launch limit.
    #[error("memory maximum {declared} pages exceeds limit {limit}")]
    MemoryTooLarge {
        /// Pages the module asked for.
        declared: u32,
        /// Configured ceiling.
        limit: u32,
    },
    /// The module imports a capability-gated function without the grant.
    #[error("{0} not granted")]
    CapabilityNotGranted(Capability),
    /// The requested entry point does not exist.
    #[error("no exported function: {0}")]
    NoExportedFunction(String),
    /// The CPU deadline fired while the app was running.
    #[error("CPU timeout")]
    CpuTimeout,
    /// The app was killed while running.
    #[error("killed")]
    Killed,
    /// The guest trapped or returned an error.
    #[error("execution failed: {0}")]
    Trap(String),
    /// The binary failed structural validation or compilation.
    #[error("invalid module: {0}")]
    Validation(String),
}

/// Launch options.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Exported function to invoke.
    pub entry_fn: String,
    /// i32 arguments passed to the entry function.
    pub args: Vec<i32>,
    /// CPU deadline in milliseconds.
    pub timeout_ms: u64,
    /// Initial pages ensured for the exported memory.
    pub memory_pages: u32,
    /// Ceiling on declared memory maxima.
    pub max_memory_pages: u32,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            entry_fn: "main".to_string(),
            args: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_pages: DEFAULT_MEMORY_PAGES,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
        }
    }
}

/// Public view of a running app.
#[derive(Debug, Clone)]
pub struct AppInfo {
    /// App identifier.
    pub app_id: String,
    /// Display title.
    pub title: String,
    /// `running`, `done`, `failed`, `killed`, or `timed_out`.
    pub state: &'static str,
    /// Launch time.
    pub started_at: DateTime<Utc>,
}

struct AppHandle {
    title: String,
    started_at: DateTime<Utc>,
    engine: Engine,
    state: Arc<AtomicU8>,
}

fn state_name(state: u8) -> &'static str {
    match state {
        STATE_RUNNING => "running",
        STATE_DONE => "done",
        STATE_FAILED => "failed",
        STATE_KILLED => "killed",
        _ => "timed_out",
    }
}

/// The WASM compute sandbox.
pub struct WasmSandbox {
    apps: Arc<Mutex<HashMap<String, AppHandle>>>,
    host_tx: UnboundedSender<HostCallRequest>,
}

impl WasmSandbox {
    /// Create a sandbox whose host calls are answered by `host`.
    ///
    /// The dispatch loop runs on the current tokio runtime for the life of
    /// the sandbox.
    pub fn new(host: Arc<dyn HostInterface>) -> Self {
        let (host_tx, mut host_rx) = unbounded_channel::<HostCallRequest>();
        tokio::spawn(async move {
            while let Some(request) = host_rx.recv().await {
                let response = host.handle(&request.app_id, request.call).await;
                // A dropped worker just means the app died mid-call.
                let _ = request.reply.send(response);
            }
        });
        Self { apps: Arc::new(Mutex::new(HashMap::new())), host_tx }
    }

    /// Launch a module and run its entry function to completion.
    ///
    /// Returns the entry function's i32 result, if it has one. The app slot
    /// is freed on every exit path, so a failed launch can be retried.
    pub async fn launch(
        &self,
        app_id: &str,
        wasm_bytes: Vec<u8>,
        capabilities: Vec<Capability>,
        title: &str,
        options: LaunchOptions,
    ) -> Result<Option<i32>, WasmError> {
        validate_memory(&wasm_bytes, options.max_memory_pages)?;

        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine =
            Engine::new(&config).map_err(|e| WasmError::Validation(e.to_string()))?;
        let module = Module::from_binary(&engine, &wasm_bytes)
            .map_err(|e| WasmError::Validation(format!("compile: {e}")))?;

        let granted: HashSet<Capability> = capabilities.into_iter().collect();
        gate_imports(&module, &granted)?;

        let state = Arc::new(AtomicU8::new(STATE_RUNNING));
        {
            let mut apps = self.apps.lock();
            if apps.contains_key(app_id) {
                return Err(WasmError::Conflict(app_id.to_string()));
            }
            apps.insert(
                app_id.to_string(),
                AppHandle {
                    title: title.to_string(),
                    started_at: Utc::now(),
                    engine: engine.clone(),
                    state: state.clone(),
                },
            );
        }
        info!(app_id, entry = %options.entry_fn, "wasm app launched");

        let result = self
            .run_module(app_id, engine, module, granted, options, state.clone())
            .await;

        self.apps.lock().remove(app_id);
        match &result {
            Ok(_) => debug!(app_id, "wasm app finished"),
            Err(e) => debug!(app_id, error = %e, "wasm app did not finish cleanly"),
        }
        result
    }

    async fn run_module(
        &self,
        app_id: &str,
        engine: Engine,
        module: Module,
        granted: HashSet<Capability>,
        options: LaunchOptions,
        state: Arc<AtomicU8>,
    ) -> Result<Option<i32>, WasmError> {
        // CPU deadline: the timer flips the state and bumps the epoch, which
        // traps the guest on its next interruption check.
        let timer_engine = engine.clone();
        let timer_state = state.clone();
        let timeout = Duration::from_millis(options.timeout_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if timer_state
                .compare_exchange(STATE_RUNNING, STATE_TIMED_OUT, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                timer_engine.increment_epoch();
            }
        });

        let host_tx = self.host_tx.clone();
        let worker_app_id = app_id.to_string();
        let worker_state = state.clone();
        let join = tokio::task::spawn_blocking(move || {
            execute(engine, module, granted, options, host_tx, worker_app_id)
        })
        .await;

        timer.abort();

        let outcome = match join {
            Ok(outcome) => outcome,
            Err(e) => Err(format!("worker panicked: {e}")),
        };

        match outcome {
            Ok(value) => {
                worker_state.store(STATE_DONE, Ordering::SeqCst);
                Ok(value)
            }
            Err(message) => match worker_state.load(Ordering::SeqCst) {
                STATE_TIMED_OUT => Err(WasmError::CpuTimeout),
                STATE_KILLED => Err(WasmError::Killed),
                _ => {
                    worker_state.store(STATE_FAILED, Ordering::SeqCst);
                    if message.starts_with("no exported function: ") {
                        Err(WasmError::NoExportedFunction(
                            message["no exported function: ".len()..].to_string(),
                        ))
                    } else {
                        Err(WasmError::Trap(message))
                    }
                }
            },
        }
    }

    /// Kill a running app. The in-flight launch resolves as
    /// [`WasmError::Killed`]. Returns whether a running app was hit.
    pub fn kill(&self, app_id: &str) -> bool {
        let apps = self.apps.lock();
        match apps.get(app_id) {
            Some(handle) => {
                let hit = handle
                    .state
                    .compare_exchange(STATE_RUNNING, STATE_KILLED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
                if hit {
                    handle.engine.increment_epoch();
                    warn!(app_id, "wasm app killed");
                }
                hit
            }
            None => false,
        }
    }

    /// Kill every running app, returning how many were hit.
    pub fn kill_all(&self) -> usize {
        let ids: Vec<String> = {
            let apps = self.apps.lock();
            apps.keys().cloned().collect()
        };
        ids.iter().filter(|id| self.kill(id)).count()
    }

    /// Info for one app, if it is currently launched.
    pub fn get_app(&self, app_id: &str) -> Option<AppInfo> {
        let apps = self.apps.lock();
        apps.get(app_id).map(|handle| AppInfo {
            app_id: app_id.to_string(),
            title: handle.title.clone(),
            state: state_name(handle.state.load(Ordering::SeqCst)),
            started_at: handle.started_at,
        })
    }

    /// All currently launched apps.
    pub fn list_apps(&self) -> Vec<AppInfo> {
        let apps = self.apps.lock();
        apps.iter()
            .map(|(id, handle)| AppInfo {
                app_id: id.clone(),
                title: handle.title.clone(),
                state: state_name(handle.state.load(Ordering::SeqCst)),
                started_at: handle.started_at,
            })
            .collect()
    }
}

/// Reject modules whose gated `llmos` imports exceed the granted set.
fn gate_imports(module: &Module, granted: &HashSet<Capability>) -> Result<(), WasmError> {
    for import in module.imports() {
        if import.module() != "llmos" {
            continue;
        }
        let required = match import.name() {
            name if name.starts_with("storage_") => Some(Capability::StorageLocal),
            "fetch" => Some(Capability::NetworkHttp),
            "notify" | "cap_request" => None,
            other => {
                return Err(WasmError::Validation(format!("unknown import: llmos.{other}")))
            }
        };
        if let Some(cap) = required {
            if !granted.contains(&cap) {
                return Err(WasmError::CapabilityNotGranted(cap));
            }
        }
    }
    Ok(())
}

/// Runs on the app's dedicated thread: instantiate, wire host functions,
/// invoke the entry function. String errors keep the thread boundary simple;
/// the async side maps them back onto [`WasmError`].
fn execute(
    engine: Engine,
    module: Module,
    granted: HashSet<Capability>,
    options: LaunchOptions,
    host_tx: UnboundedSender<HostCallRequest>,
    app_id: String,
) -> Result<Option<i32>, String> {
    let mut store = Store::new(&engine, ());
    store.set_epoch_deadline(1);

    let mut linker: Linker<()> = Linker::new(&engine);
    define_host_functions(&mut linker, granted, host_tx, app_id)?;

    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| format!("instantiate: {e}"))?;

    if let Some(memory) = instance.get_memory(&mut store, "memory") {
        let current = memory.size(&store);
        if current < u64::from(options.memory_pages) {
            // Best effort: a module with a smaller maximum keeps its own cap.
            let _ = memory.grow(&mut store, u64::from(options.memory_pages) - current);
        }
    }

    let func = instance
        .get_func(&mut store, &options.entry_fn)
        .ok_or_else(|| format!("no exported function: {}", options.entry_fn))?;

    let ty = func.ty(&store);
    let param_count = ty.params().len();
    if param_count != options.args.len() {
        return Err(format!(
            "entry function takes {param_count} arguments, {} given",
            options.args.len()
        ));
    }
    let params: Vec<Val> = options.args.iter().map(|a| Val::I32(*a)).collect();
    let mut results = vec![Val::I32(0); ty.results().len()];

    func.call(&mut store, &params, &mut results)
        .map_err(|e| format!("{e}"))?;

    Ok(results.first().and_then(|v| v.i32()))
}

/// Status codes shared by the guest-facing host functions.
const STATUS_MISSING: i32 = -1;
const STATUS_ERROR: i32 = -2;
const STATUS_BUFFER_TOO_SMALL: i32 = -3;
const STATUS_PAYLOAD_TOO_LARGE: i32 = -4;
const STATUS_DENIED: i32 = -5;

fn define_host_functions(
    linker: &mut Linker<()>,
    granted: HashSet<Capability>,
    host_tx: UnboundedSender<HostCallRequest>,
    app_id: String,
) -> Result<(), String> {
    let ctx = Arc::new(HostCtx { granted, host_tx, app_id });

    let c = ctx.clone();
    linker
        .func_wrap(
            "llmos",
            "storage_get",
            move |mut caller: Caller<'_, ()>, ptr: i32, len: i32, out_ptr: i32, out_cap: i32| -> i32 {
                let key = match read_guest_string(&mut caller, ptr, len) {
                    Ok(key) => key,
                    Err(code) => return code,
                };
                match c.dispatch_gated(HostCall::StorageGet { key }) {
                    Ok(Value::Null) => STATUS_MISSING,
                    Ok(value) => write_guest_json(&mut caller, out_ptr, out_cap, &value),
                    Err(code) => code,
                }
            },
        )
        .map_err(|e| e.to_string())?;

    let c = ctx.clone();
    linker
        .func_wrap(
            "llmos",
            "storage_set",
            move |mut caller: Caller<'_, ()>, kp: i32, kl: i32, vp: i32, vl: i32| -> i32 {
                if kl as usize + vl as usize > MAX_PAYLOAD_BYTES {
                    return STATUS_PAYLOAD_TOO_LARGE;
                }
                let key = match read_guest_string(&mut caller, kp, kl) {
                    Ok(key) => key,
                    Err(code) => return code,
                };
                let value = match read_guest_string(&mut caller, vp, vl) {
                    Ok(value) => value,
                    Err(code) => return code,
                };
                match c.dispatch_gated(HostCall::StorageSet { key, value }) {
                    Ok(_) => 0,
                    Err(code) => code,
                }
            },
        )
        .map_err(|e| e.to_string())?;

    let c = ctx.clone();
    linker
        .func_wrap(
            "llmos",
            "storage_remove",
            move |mut caller: Caller<'_, ()>, ptr: i32, len: i32| -> i32 {
                let key = match read_guest_string(&mut caller, ptr, len) {
                    Ok(key) => key,
                    Err(code) => return code,
                };
                match c.dispatch_gated(HostCall::StorageRemove { key }) {
                    Ok(_) => 0,
                    Err(code) => code,
                }
            },
        )
        .map_err(|e| e.to_string())?;

    let c = ctx.clone();
    linker
        .func_wrap(
            "llmos",
            "storage_keys",
            move |mut caller: Caller<'_, ()>, out_ptr: i32, out_cap: i32| -> i32 {
                match c.dispatch_gated(HostCall::StorageKeys) {
                    Ok(value) => write_guest_json(&mut caller, out_ptr, out_cap, &value),
                    Err(code) => code,
                }
            },
        )
        .map_err(|e| e.to_string())?;

    let c = ctx.clone();
    linker
        .func_wrap(
            "llmos",
            "notify",
            move |mut caller: Caller<'_, ()>, ptr: i32, len: i32| -> i32 {
                let message = match read_guest_string(&mut caller, ptr, len) {
                    Ok(message) => message,
                    Err(code) => return code,
                };
                match c.dispatch_gated(HostCall::Notify { message }) {
                    Ok(_) => 0,
                    Err(code) => code,
                }
            },
        )
        .map_err(|e| e.to_string())?;

    let c = ctx.clone();
    linker
        .func_wrap(
            "llmos",
            "cap_request",
            move |mut caller: Caller<'_, ()>, ptr: i32, len: i32| -> i32 {
                let cap = match read_guest_string(&mut caller, ptr, len) {
                    Ok(cap) => cap,
                    Err(code) => return code,
                };
                match c.dispatch_gated(HostCall::CapRequest { cap }) {
                    Ok(Value::Bool(true)) => 1,
                    Ok(_) => 0,
                    Err(code) => code,
                }
            },
        )
        .map_err(|e| e.to_string())?;

    // Network access is gated at import time; the in-process fetch surface
    // is not wired yet, so a granted module still gets a clean error code.
    linker
        .func_wrap(
            "llmos",
            "fetch",
            move |_caller: Caller<'_, ()>, _ptr: i32, _len: i32, _out: i32, _cap: i32| -> i32 {
                STATUS_ERROR
            },
        )
        .map_err(|e| e.to_string())?;

    Ok(())
}

struct HostCtx {
    granted: HashSet<Capability>,
    host_tx: UnboundedSender<HostCallRequest>,
    app_id: String,
}

impl HostCtx {
    /// Capability-gate the call, then block this worker thread until the
    /// kernel replies.
    fn dispatch_gated(&self, call: HostCall) -> Result<Value, i32> {
        let required = match call {
            HostCall::StorageGet { .. }
            | HostCall::StorageSet { .. }
            | HostCall::StorageRemove { .. }
            | HostCall::StorageKeys => Some(Capability::StorageLocal),
            HostCall::Notify { .. } | HostCall::CapRequest { .. } => None,
        };
        if let Some(cap) = required {
            if !self.granted.contains(&cap) {
                return Err(STATUS_DENIED);
            }
        }

        let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
        let request = HostCallRequest {
            app_id: self.app_id.clone(),
            call,
            reply: reply_tx,
        };
        if self.host_tx.send(request).is_err() {
            return Err(STATUS_ERROR);
        }
        match reply_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(_) => Err(STATUS_ERROR),
        }
    }
}

fn read_guest_string(caller: &mut Caller<'_, ()>, ptr: i32, len: i32) -> Result<String, i32> {
    if len < 0 || ptr < 0 || len as usize > MAX_PAYLOAD_BYTES {
        return Err(STATUS_PAYLOAD_TOO_LARGE);
    }
    let memory = match caller.get_export("memory").and_then(Extern::into_memory) {
        Some(memory) => memory,
        None => return Err(STATUS_ERROR),
    };
    let data = memory.data(&caller);
    let start = ptr as usize;
    let end = start.checked_add(len as usize).ok_or(STATUS_ERROR)?;
    if end > data.len() {
        return Err(STATUS_ERROR);
    }
    String::from_utf8(data[start..end].to_vec()).map_err(|_| STATUS_ERROR)
}

fn write_guest_json(caller: &mut Caller<'_, ()>, out_ptr: i32, out_cap: i32, value: &Value) -> i32 {
    let bytes = match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(_) => return STATUS_ERROR,
    };
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return STATUS_PAYLOAD_TOO_LARGE;
    }
    if bytes.len() > out_cap as usize {
        return STATUS_BUFFER_TOO_SMALL;
    }
    let memory = match caller.get_export("memory").and_then(Extern::into_memory) {
        Some(memory) => memory,
        None => return STATUS_ERROR,
    };
    let start = out_ptr as usize;
    let data = memory.data_mut(caller);
    if start + bytes.len() > data.len() {
        return STATUS_ERROR;
    }
    data[start..start + bytes.len()].copy_from_slice(&bytes);
    bytes.len() as i32
}
