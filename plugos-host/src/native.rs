//! In-process execution provider backed by async Rust functions.
//!
//! A plugin's `code` strings name functions registered on the provider.
//! Every invocation runs on its own tokio task, so a panicking plugin only
//! fails that invocation with `PluginCrashed`.

use crate::bridge::SyscallPort;
use crate::error::PluginHostError;
use crate::provider::{CodeUnit, ExecutionProvider};
use async_trait::async_trait;
use futures::future::BoxFuture;
use plugos_types::PluginDefinition;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

/// A plugin function: receives the sandbox's syscall port and the call
/// arguments.
pub type NativeFunction = Arc<dyn Fn(SyscallPort, Vec<Value>) -> NativeFuture + Send + Sync>;

/// The future a [`NativeFunction`] returns.
pub type NativeFuture = BoxFuture<'static, Result<Value, PluginHostError>>;

#[derive(Default, Clone)]
pub struct NativeProvider {
    code: HashMap<String, NativeFunction>,
}

impl NativeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under the code reference `code`.
    pub fn register<F, Fut>(&mut self, code: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(SyscallPort, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, PluginHostError>> + Send + 'static,
    {
        let function: NativeFunction =
            Arc::new(move |port: SyscallPort, args: Vec<Value>| -> NativeFuture {
                Box::pin(f(port, args))
            });
        self.code.insert(code.into(), function);
        self
    }

    /// Builder form of [`NativeProvider::register`].
    pub fn with_function<F, Fut>(mut self, code: impl Into<String>, f: F) -> Self
    where
        F: Fn(SyscallPort, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, PluginHostError>> + Send + 'static,
    {
        self.register(code, f);
        self
    }

    pub fn contains(&self, code: &str) -> bool {
        self.code.contains_key(code)
    }
}

#[async_trait]
impl ExecutionProvider for NativeProvider {
    async fn create_sandbox(
        &self,
        definition: &PluginDefinition,
        port: SyscallPort,
    ) -> Result<Box<dyn CodeUnit>, PluginHostError> {
        let mut functions = BTreeMap::new();
        for (name, function) in &definition.functions {
            let native = self.code.get(&function.code).ok_or_else(|| {
                PluginHostError::InitializationFailed(format!(
                    "plugin '{}': function '{}' references unknown code '{}'",
                    definition.name, name, function.code
                ))
            })?;
            functions.insert(name.clone(), Arc::clone(native));
        }

        debug!(plugin = %definition.name, functions = functions.len(), "Native code unit created");
        Ok(Box::new(NativeUnit {
            plugin: definition.name.clone(),
            functions,
            port,
            tasks: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        }))
    }
}

struct NativeUnit {
    plugin: String,
    functions: BTreeMap<String, NativeFunction>,
    port: SyscallPort,
    tasks: Mutex<Vec<AbortHandle>>,
    terminated: AtomicBool,
}

impl NativeUnit {
    fn track(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

impl CodeUnit for NativeUnit {
    fn exports(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    fn invoke(
        &self,
        function: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, PluginHostError>> {
        let plugin = self.plugin.clone();

        let Some(native) = self.functions.get(function) else {
            let function = function.to_string();
            return Box::pin(async move {
                Err(PluginHostError::FunctionNotFound { plugin, function })
            });
        };
        if self.terminated.load(Ordering::SeqCst) {
            return Box::pin(async move { Err(PluginHostError::SandboxUnloaded(plugin)) });
        }

        let task = tokio::spawn(native(self.port.clone(), args));
        self.track(task.abort_handle());

        Box::pin(async move {
            let mut task = AbortOnDrop(task);
            match (&mut task.0).await {
                Ok(result) => result,
                Err(err) if err.is_panic() => Err(PluginHostError::PluginCrashed {
                    plugin,
                    message: panic_message(err.into_panic()),
                }),
                Err(_) => Err(PluginHostError::SandboxUnloaded(plugin)),
            }
        })
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let running = tasks.iter().filter(|task| !task.is_finished()).count();
        for task in tasks {
            task.abort();
        }
        debug!(plugin = %self.plugin, aborted = running, "Native code unit terminated");
    }
}

/// Aborts the plugin task when its caller stops waiting (e.g. on timeout).
struct AbortOnDrop(JoinHandle<Result<Value, PluginHostError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
