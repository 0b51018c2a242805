use plugos_host::syscalls::store_syscalls;
use plugos_host::{
    HandlerError, NativeProvider, PluginDefinition, PluginHostError, PolicyConfig, PolicyEngine,
    SandboxLimits, SandboxState, SyscallMap, SyscallPort, System, syscall_fn,
};
use plugos_storage::KvStore;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn limits_policy(limits: SandboxLimits) -> PolicyEngine {
    PolicyEngine::with_config(PolicyConfig {
        limits,
        ..Default::default()
    })
}

fn provider() -> NativeProvider {
    NativeProvider::new()
        .with_function("echo", |_port, args: Vec<Value>| async move { Ok(Value::Array(args)) })
        .with_function("call_missing", |port: SyscallPort, _args| async move {
            port.call("nope.missing", vec![]).await
        })
        .with_function("sleep", |_port, _args| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })
        .with_function("panic", |_port, _args| async move {
            if true {
                panic!("plugin exploded");
            }
            Ok(Value::Null)
        })
        .with_function("escape", |port: SyscallPort, _args| async move {
            Err(PluginHostError::IsolationFailure {
                plugin: port.plugin_name().to_string(),
                message: "memory boundary violated".into(),
            })
        })
        .with_function("whoami", |port: SyscallPort, _args| async move {
            port.call("test.whoami", vec![]).await
        })
}

fn plugin(name: &str) -> PluginDefinition {
    PluginDefinition::new(name)
        .function("echo", "echo")
        .function("callMissing", "call_missing")
        .function("sleep", "sleep")
        .function("panic", "panic")
        .function("escape", "escape")
        .function("whoami", "whoami")
}

#[tokio::test]
async fn invoke_returns_function_result() {
    let mut system = System::new();
    let handle = system.load(&plugin("p"), &provider()).await.unwrap();
    let out = assert_ok!(handle.invoke("echo", vec![json!(1), json!("x")]).await);
    assert_eq!(out, json!([1, "x"]));
    assert_eq!(handle.state(), SandboxState::Ready);
    assert_eq!(system.invoke("p", "echo", vec![]).await.unwrap(), json!([]));
}

#[tokio::test]
async fn unregistered_syscall_is_not_found_and_state_unchanged() {
    let store = Arc::new(KvStore::open_in_memory("test_table").unwrap());
    let mut system = System::new();
    system
        .register_syscalls(vec![], store_syscalls(Arc::clone(&store)))
        .await
        .unwrap();
    store.put("before", &json!(1)).unwrap();

    let handle = system.load(&plugin("p"), &provider()).await.unwrap();
    let err = handle.invoke("callMissing", vec![]).await.unwrap_err();
    assert!(matches!(err, PluginHostError::SyscallNotFound(ref n) if n == "nope.missing"));
    assert!(err.is_not_found());

    assert_eq!(handle.state(), SandboxState::Ready);
    assert_eq!(store.count().unwrap(), 1);
    assert!(handle.invoke("echo", vec![]).await.is_ok());
}

#[tokio::test]
async fn invoke_after_unload_all_is_sandbox_unloaded() {
    let mut system = System::new();
    let handle = system.load(&plugin("p"), &provider()).await.unwrap();
    system.unload_all();

    let err = handle.invoke("echo", vec![]).await.unwrap_err();
    assert!(matches!(err, PluginHostError::SandboxUnloaded(_)));
    assert_eq!(handle.state(), SandboxState::Unloaded);
    let err = system.invoke("p", "echo", vec![]).await.unwrap_err();
    assert!(matches!(err, PluginHostError::SandboxUnloaded(ref n) if n == "p"));
}

#[tokio::test]
async fn unknown_function_is_not_found() {
    let mut system = System::new();
    let handle = system.load(&plugin("p"), &provider()).await.unwrap();
    let err = assert_err!(handle.invoke("nothing", vec![]).await);
    assert!(matches!(err, PluginHostError::FunctionNotFound { .. }));
    assert_eq!(handle.state(), SandboxState::Ready);
}

#[tokio::test]
async fn invocation_timeout_ends_only_that_call() {
    let mut system = System::with_policy(limits_policy(SandboxLimits {
        call_timeout_ms: 50,
        ..Default::default()
    }));
    let handle = system.load(&plugin("p"), &provider()).await.unwrap();

    let err = handle.invoke("sleep", vec![]).await.unwrap_err();
    assert!(matches!(err, PluginHostError::Timeout { timeout_ms: 50, .. }));
    assert_eq!(handle.state(), SandboxState::Ready);
    assert!(handle.invoke("echo", vec![]).await.is_ok());
}

#[tokio::test]
async fn panic_is_reported_as_crash_and_sandbox_survives() {
    let mut system = System::new();
    let handle = system.load(&plugin("p"), &provider()).await.unwrap();

    let err = handle.invoke("panic", vec![]).await.unwrap_err();
    match err {
        PluginHostError::PluginCrashed { plugin, message } => {
            assert_eq!(plugin, "p");
            assert!(message.contains("plugin exploded"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(handle.invoke("echo", vec![]).await.is_ok());
}

#[tokio::test]
async fn isolation_failure_unloads_sandbox() {
    let mut system = System::new();
    let handle = system.load(&plugin("p"), &provider()).await.unwrap();

    let err = assert_err!(handle.invoke("escape", vec![]).await);
    assert!(matches!(err, PluginHostError::IsolationFailure { .. }));
    assert_eq!(handle.state(), SandboxState::Unloaded);

    let err = handle.invoke("echo", vec![]).await.unwrap_err();
    assert!(matches!(err, PluginHostError::SandboxUnloaded(_)));
}

#[tokio::test]
async fn unloading_fails_running_invocations() {
    let mut system = System::new();
    let handle = system.load(&plugin("p"), &provider()).await.unwrap();

    let running = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.invoke("sleep", vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), SandboxState::Invoking(1));

    system.unload("p").unwrap();
    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, PluginHostError::SandboxUnloaded(_)));
}

#[tokio::test]
async fn concurrent_invocations_are_counted() {
    let mut system = System::new();
    let handle = system.load(&plugin("p"), &provider()).await.unwrap();

    let a = tokio::spawn({
        let handle = handle.clone();
        async move { handle.invoke("sleep", vec![]).await }
    });
    let b = tokio::spawn({
        let handle = handle.clone();
        async move { handle.invoke("sleep", vec![]).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), SandboxState::Invoking(2));

    a.abort();
    b.abort();
    let _ = a.await;
    let _ = b.await;
    assert_eq!(handle.state(), SandboxState::Ready);
}

#[tokio::test]
async fn slow_syscall_in_one_sandbox_does_not_block_another() {
    let mut system = System::new();
    let mut syscalls = SyscallMap::new();
    syscalls.insert(
        "test.slow".into(),
        syscall_fn(|_ctx, _args| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }),
    );
    syscalls.insert(
        "test.fast".into(),
        syscall_fn(|ctx, _args| async move { Ok(json!(ctx.plugin_name)) }),
    );
    system.register_syscalls(vec![], syscalls).await.unwrap();

    let provider = NativeProvider::new()
        .with_function("slow", |port: SyscallPort, _args| async move {
            port.call("test.slow", vec![]).await
        })
        .with_function("fast", |port: SyscallPort, _args| async move {
            port.call("test.fast", vec![]).await
        });
    let slow = system
        .load(&PluginDefinition::new("slow").function("run", "slow"), &provider)
        .await
        .unwrap();
    let fast = system
        .load(
            &PluginDefinition::new("fast")
                .function("run", "fast")
                .function("slow", "slow"),
            &provider,
        )
        .await
        .unwrap();

    let blocked = tokio::spawn(async move { slow.invoke("run", vec![]).await });
    // Same sandbox, outstanding slow call: fast calls still complete.
    let pending_in_fast = tokio::spawn({
        let fast = fast.clone();
        async move { fast.invoke("slow", vec![]).await }
    });

    let out = tokio::time::timeout(Duration::from_secs(2), fast.invoke("run", vec![]))
        .await
        .expect("fast sandbox was blocked")
        .unwrap();
    assert_eq!(out, json!("fast"));

    blocked.abort();
    pending_in_fast.abort();
}

#[tokio::test]
async fn scoped_syscalls_are_only_visible_in_scope() {
    let mut system = System::new();
    let mut syscalls = SyscallMap::new();
    syscalls.insert(
        "test.whoami".into(),
        syscall_fn(|ctx, _args| async move { Ok(json!(ctx.plugin_name)) }),
    );
    system
        .register_syscalls(vec!["inside".into()], syscalls)
        .await
        .unwrap();

    let inside = system.load(&plugin("inside"), &provider()).await.unwrap();
    let outside = system.load(&plugin("outside"), &provider()).await.unwrap();

    assert_eq!(inside.invoke("whoami", vec![]).await.unwrap(), json!("inside"));
    let err = outside.invoke("whoami", vec![]).await.unwrap_err();
    assert!(matches!(err, PluginHostError::SyscallNotFound(_)));
}

#[tokio::test]
async fn duplicate_registration_fails_fast() {
    let system = System::new();
    let store = Arc::new(KvStore::open_in_memory("t").unwrap());
    system
        .register_syscalls(vec![], store_syscalls(Arc::clone(&store)))
        .await
        .unwrap();
    let err = system
        .register_syscalls(vec!["p".into()], store_syscalls(store))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginHostError::DuplicateSyscall(_)));
}

#[tokio::test]
async fn policy_denied_syscall_is_hidden() {
    let mut config = PolicyConfig::default();
    config.denied_syscalls.insert("store.deleteAll".into());
    let system = System::with_policy(PolicyEngine::with_config(config));
    let store = Arc::new(KvStore::open_in_memory("t").unwrap());
    system
        .register_syscalls(vec![], store_syscalls(Arc::clone(&store)))
        .await
        .unwrap();
    store.put("keep", &json!(true)).unwrap();

    let err = system
        .dispatch_syscall("p", "store.deleteAll", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, PluginHostError::SyscallNotFound(_)));
    assert_eq!(store.count().unwrap(), 1);
}

#[tokio::test]
async fn handler_error_reaches_plugin_as_handler_variant() {
    let mut system = System::new();
    let mut syscalls = SyscallMap::new();
    syscalls.insert(
        "test.whoami".into(),
        syscall_fn(|_ctx, _args| async { Err(HandlerError::new("denied today")) }),
    );
    system.register_syscalls(vec![], syscalls).await.unwrap();
    let handle = system.load(&plugin("p"), &provider()).await.unwrap();

    let err = handle.invoke("whoami", vec![]).await.unwrap_err();
    assert!(matches!(err, PluginHostError::Handler(ref e) if e.message == "denied today"));
    assert_eq!(handle.state(), SandboxState::Ready);
}

#[tokio::test]
async fn typed_syscall_serialization_failure() {
    let mut system = System::new();
    let provider =
        NativeProvider::new().with_function("bad", |port: SyscallPort, _args| async move {
            // Maps with non-string keys cannot become JSON.
            let mut bad = std::collections::HashMap::new();
            bad.insert((1, 2), "x");
            port.syscall::<_, Value>("store.set", ("k", bad)).await
        });
    let handle = system
        .load(&PluginDefinition::new("p").function("run", "bad"), &provider)
        .await
        .unwrap();
    let err = handle.invoke("run", vec![]).await.unwrap_err();
    assert!(matches!(err, PluginHostError::Serialization(_)));
}
