use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use lumos_types::Capability;
use lumos_wasm::{
    DenyAllHost, HostCall, HostInterface, HostResponse, LaunchOptions, WasmError, WasmSandbox,
};

/// Records calls and answers storage reads from a fixed map.
struct RecordingHost {
    calls: Mutex<Vec<(String, HostCall)>>,
}

impl RecordingHost {
    fn new() -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl HostInterface for RecordingHost {
    async fn handle(&self, app_id: &str, call: HostCall) -> HostResponse {
        self.calls.lock().await.push((app_id.to_string(), call.clone()));
        match call {
            HostCall::StorageGet { key } if key == "greeting" => Ok(json!("hello")),
            HostCall::StorageGet { .. } => Ok(Value::Null),
            HostCall::CapRequest { cap } => Ok(json!(cap == "storage:local")),
            _ => Ok(json!(0)),
        }
    }
}

fn compile(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).unwrap()
}

const RETURN_42: &str = r#"(module (memory (export "memory") 1 2)
    (func (export "main") (result i32) i32.const 42))"#;

const INFINITE_LOOP: &str = r#"(module (memory (export "memory") 1 2)
    (func (export "main") (loop br 0)))"#;

#[tokio::test]
async fn launch_returns_entry_value() {
    let sandbox = WasmSandbox::new(Arc::new(DenyAllHost));
    let result = sandbox
        .launch("ret42", compile(RETURN_42), vec![], "Returner", LaunchOptions::default())
        .await
        .unwrap();
    assert_eq!(result, Some(42));
    assert!(sandbox.list_apps().is_empty());
}

#[tokio::test]
async fn entry_args_are_passed() {
    let wat = r#"(module (memory (export "memory") 1 2)
        (func (export "add") (param i32 i32) (result i32)
            local.get 0 local.get 1 i32.add))"#;
    let sandbox = WasmSandbox::new(Arc::new(DenyAllHost));
    let result = sandbox
        .launch(
            "adder",
            compile(wat),
            vec![],
            "Adder",
            LaunchOptions { entry_fn: "add".into(), args: vec![19, 23], ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(result, Some(42));
}

#[tokio::test]
async fn missing_export_is_reported() {
    let sandbox = WasmSandbox::new(Arc::new(DenyAllHost));
    let err = sandbox
        .launch(
            "noent",
            compile(RETURN_42),
            vec![],
            "NoEntry",
            LaunchOptions { entry_fn: "start".into(), ..Default::default() },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no exported function"));
    // The slot is freed, so a corrected retry works.
    assert!(sandbox
        .launch("noent", compile(RETURN_42), vec![], "Retry", LaunchOptions::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn unbounded_memory_is_rejected() {
    let sandbox = WasmSandbox::new(Arc::new(DenyAllHost));
    let bytes = compile(r#"(module (memory (export "memory") 1))"#);
    let err = sandbox
        .launch("unbounded", bytes, vec![], "Unbounded", LaunchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unbounded memory");
}

#[tokio::test]
async fn oversized_memory_is_rejected() {
    let sandbox = WasmSandbox::new(Arc::new(DenyAllHost));
    let bytes = compile(r#"(module (memory (export "memory") 1 2048))"#);
    let err = sandbox
        .launch("huge", bytes, vec![], "Huge", LaunchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WasmError::MemoryTooLarge { .. }));
}

#[tokio::test]
async fn cpu_timeout_fires_within_bounds() {
    let sandbox = WasmSandbox::new(Arc::new(DenyAllHost));
    let started = Instant::now();
    let err = sandbox
        .launch(
            "spinner",
            compile(INFINITE_LOOP),
            vec![],
            "Spinner",
            LaunchOptions { timeout_ms: 500, ..Default::default() },
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed().as_millis();
    assert_eq!(err.to_string(), "CPU timeout");
    assert!((500..3000).contains(&elapsed), "took {elapsed}ms");
    assert!(sandbox.list_apps().is_empty());
}

#[tokio::test]
async fn kill_settles_launch_as_killed() {
    let sandbox = Arc::new(WasmSandbox::new(Arc::new(DenyAllHost)));
    let bytes = compile(INFINITE_LOOP);

    let launcher = sandbox.clone();
    let handle = tokio::spawn(async move {
        launcher
            .launch("victim", bytes, vec![], "Victim", LaunchOptions::default())
            .await
    });

    // Wait until the app shows up, then kill it.
    for _ in 0..50 {
        if sandbox.get_app("victim").is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(sandbox.kill("victim"));

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(WasmError::Killed)));
    assert!(sandbox.list_apps().is_empty());
    // Killing again is a no-op.
    assert!(!sandbox.kill("victim"));
}

#[tokio::test]
async fn duplicate_launch_is_a_conflict() {
    let sandbox = Arc::new(WasmSandbox::new(Arc::new(DenyAllHost)));
    let bytes = compile(INFINITE_LOOP);

    let launcher = sandbox.clone();
    let first_bytes = bytes.clone();
    let first = tokio::spawn(async move {
        launcher
            .launch("dup", first_bytes, vec![], "First", LaunchOptions::default())
            .await
    });
    for _ in 0..50 {
        if sandbox.get_app("dup").is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let err = sandbox
        .launch("dup", bytes, vec![], "Second", LaunchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WasmError::Conflict(_)));

    sandbox.kill("dup");
    let _ = first.await.unwrap();
}

#[tokio::test]
async fn gated_import_requires_grant() {
    let wat = r#"(module
        (import "llmos" "storage_get" (func $get (param i32 i32 i32 i32) (result i32)))
        (memory (export "memory") 1 2)
        (func (export "main") (result i32)
            i32.const 0 i32.const 0 i32.const 0 i32.const 0 call $get))"#;
    let sandbox = WasmSandbox::new(Arc::new(DenyAllHost));
    let err = sandbox
        .launch("gated", compile(wat), vec![], "Gated", LaunchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "storage:local not granted");
}

#[tokio::test]
async fn host_calls_round_trip_through_the_kernel() {
    // Reads "greeting" (8 chars at offset 0) into the buffer at offset 64,
    // returning the number of bytes the kernel wrote.
    let wat = r#"(module
        (import "llmos" "storage_get" (func $get (param i32 i32 i32 i32) (result i32)))
        (memory (export "memory") 1 2)
        (data (i32.const 0) "greeting")
        (func (export "main") (result i32)
            i32.const 0 i32.const 8 i32.const 64 i32.const 256 call $get))"#;

    let host = RecordingHost::new();
    let sandbox = WasmSandbox::new(host.clone());
    let result = sandbox
        .launch(
            "reader",
            compile(wat),
            vec![Capability::StorageLocal],
            "Reader",
            LaunchOptions::default(),
        )
        .await
        .unwrap();
    // "hello" serializes to "\"hello\"", 7 bytes.
    assert_eq!(result, Some(7));

    let calls = host.calls.lock().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "reader");
    assert_eq!(calls[0].1, HostCall::StorageGet { key: "greeting".into() });
}

#[tokio::test]
async fn notify_needs_no_grant() {
    let wat = r#"(module
        (import "llmos" "notify" (func $notify (param i32 i32) (result i32)))
        (memory (export "memory") 1 2)
        (data (i32.const 0) "done")
        (func (export "main") (result i32)
            i32.const 0 i32.const 4 call $notify))"#;

    let host = RecordingHost::new();
    let sandbox = WasmSandbox::new(host.clone());
    let result = sandbox
        .launch("notifier", compile(wat), vec![], "Notifier", LaunchOptions::default())
        .await
        .unwrap();
    assert_eq!(result, Some(0));
    assert_eq!(host.calls.lock().await.len(), 1);
}

#[tokio::test]
async fn storage_without_grant_is_denied_at_runtime_too() {
    // cap_request is always allowed and reports the granted set truthfully.
    let wat = r#"(module
        (import "llmos" "cap_request" (func $req (param i32 i32) (result i32)))
        (memory (export "memory") 1 2)
        (data (i32.const 0) "storage:local")
        (func (export "main") (result i32)
            i32.const 0 i32.const 13 call $req))"#;

    let host = RecordingHost::new();
    let sandbox = WasmSandbox::new(host.clone());
    let result = sandbox
        .launch("asker", compile(wat), vec![], "Asker", LaunchOptions::default())
        .await
        .unwrap();
    assert_eq!(result, Some(1));
}
