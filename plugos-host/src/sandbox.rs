//! Individual plugin sandbox: one code unit plus its syscall bridge.
//!
//! A sandbox moves through `Created -> Ready -> Invoking(n) -> Unloaded`.
//! `Invoking` counts concurrent invocations and drops back to `Ready` when
//! the last one finishes. `Unloaded` is terminal.

use crate::bridge::Bridge;
use crate::error::PluginHostError;
use crate::provider::{CodeUnit, ExecutionProvider};
use crate::registry::{SharedRegistry, SyscallContext};
use plugos_types::{PluginDefinition, SandboxId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resource limits for a plugin sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Deadline for a single invocation in milliseconds.
    pub call_timeout_ms: u64,
    /// Outstanding syscalls allowed per sandbox before new ones are rejected.
    pub max_pending_calls: usize,
}

impl SandboxLimits {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            max_pending_calls: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Ready,
    Invoking(usize),
    Unloaded,
}

/// A loaded plugin and the bridge that serves its syscalls.
pub struct PluginSandbox {
    id: SandboxId,
    name: String,
    limits: SandboxLimits,
    exports: Vec<String>,
    state: Mutex<SandboxState>,
    unit: Box<dyn CodeUnit>,
    bridge: Bridge,
}

impl PluginSandbox {
    /// Creates the bridge, asks `provider` for a code unit and returns a
    /// handle to the ready sandbox.
    pub async fn load(
        definition: &PluginDefinition,
        provider: &dyn ExecutionProvider,
        registry: SharedRegistry,
        limits: SandboxLimits,
    ) -> Result<PluginHandle, PluginHostError> {
        let id = SandboxId::new();
        let state = Mutex::new(SandboxState::Created);
        let ctx = SyscallContext::new(id, definition.name.clone());
        let (bridge, port) = Bridge::spawn(ctx, registry, limits.max_pending_calls);

        let unit = match provider.create_sandbox(definition, port).await {
            Ok(unit) => unit,
            Err(e) => {
                warn!(
                    plugin = %definition.name,
                    sandbox_id = %id,
                    "Sandbox creation failed: {}", e
                );
                bridge.shutdown();
                return Err(e);
            }
        };

        let mut exports = unit.exports();
        exports.sort();
        let sandbox = Self {
            id,
            name: definition.name.clone(),
            limits,
            exports,
            state,
            unit,
            bridge,
        };
        sandbox.set_state(SandboxState::Ready);

        info!(
            plugin = %sandbox.name,
            sandbox_id = %sandbox.id,
            exports = sandbox.exports.len(),
            "Sandbox ready"
        );
        Ok(PluginHandle {
            sandbox: Arc::new(sandbox),
        })
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn state(&self) -> SandboxState {
        *self.lock_state()
    }

    /// Runs an exported function to completion.
    ///
    /// Fails with `Timeout` after `call_timeout_ms`. An `IsolationFailure`
    /// from the code unit unloads the sandbox before it is returned.
    pub async fn invoke(&self, function: &str, args: Vec<Value>) -> Result<Value, PluginHostError> {
        let _invocation = self.begin_invocation(function)?;
        debug!(plugin = %self.name, function = %function, "Invoking plugin function");

        let result = match tokio::time::timeout(
            self.limits.call_timeout(),
            self.unit.invoke(function, args),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    plugin = %self.name,
                    function = %function,
                    timeout_ms = self.limits.call_timeout_ms,
                    "Invocation timed out"
                );
                Err(PluginHostError::Timeout {
                    plugin: self.name.clone(),
                    timeout_ms: self.limits.call_timeout_ms,
                })
            }
        };

        if let Err(PluginHostError::IsolationFailure { message, .. }) = &result {
            warn!(
                plugin = %self.name,
                sandbox_id = %self.id,
                "Isolation failure, unloading: {}", message
            );
            self.unload();
        }
        result
    }

    /// Terminates the code unit and stops the bridge. Returns false if the
    /// sandbox was already unloaded.
    pub fn unload(&self) -> bool {
        {
            let mut state = self.lock_state();
            if *state == SandboxState::Unloaded {
                return false;
            }
            *state = SandboxState::Unloaded;
        }

        self.unit.terminate();
        self.bridge.shutdown();
        info!(plugin = %self.name, sandbox_id = %self.id, "Sandbox unloaded");
        true
    }

    fn begin_invocation(&self, function: &str) -> Result<Invocation<'_>, PluginHostError> {
        let mut state = self.lock_state();
        let next = match *state {
            SandboxState::Unloaded => {
                return Err(PluginHostError::SandboxUnloaded(self.name.clone()));
            }
            SandboxState::Created => {
                return Err(PluginHostError::InitializationFailed(format!(
                    "sandbox for '{}' is not ready",
                    self.name
                )));
            }
            SandboxState::Ready => SandboxState::Invoking(1),
            SandboxState::Invoking(n) => SandboxState::Invoking(n + 1),
        };

        if !self.exports.iter().any(|f| f == function) {
            return Err(PluginHostError::FunctionNotFound {
                plugin: self.name.clone(),
                function: function.to_string(),
            });
        }

        *state = next;
        Ok(Invocation { sandbox: self })
    }

    fn set_state(&self, next: SandboxState) {
        *self.lock_state() = next;
    }

    fn lock_state(&self) -> MutexGuard<'_, SandboxState> {
        // A poisoned lock still holds a valid state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PluginSandbox {
    fn drop(&mut self) {
        if self.state() != SandboxState::Unloaded {
            self.unit.terminate();
            self.bridge.shutdown();
        }
    }
}

/// Marks one running invocation; leaving `Invoking` happens on drop so a
/// cancelled caller cannot leak the count.
struct Invocation<'a> {
    sandbox: &'a PluginSandbox,
}

impl Drop for Invocation<'_> {
    fn drop(&mut self) {
        let mut state = self.sandbox.lock_state();
        *state = match *state {
            SandboxState::Invoking(1) => SandboxState::Ready,
            SandboxState::Invoking(n) => SandboxState::Invoking(n - 1),
            other => other,
        };
    }
}

/// Shared handle to a loaded plugin.
#[derive(Clone)]
pub struct PluginHandle {
    sandbox: Arc<PluginSandbox>,
}

impl PluginHandle {
    pub fn id(&self) -> SandboxId {
        self.sandbox.id()
    }

    pub fn name(&self) -> &str {
        self.sandbox.name()
    }

    pub fn exports(&self) -> &[String] {
        self.sandbox.exports()
    }

    pub fn state(&self) -> SandboxState {
        self.sandbox.state()
    }

    pub fn is_unloaded(&self) -> bool {
        self.state() == SandboxState::Unloaded
    }

    pub async fn invoke(&self, function: &str, args: Vec<Value>) -> Result<Value, PluginHostError> {
        self.sandbox.invoke(function, args).await
    }

    pub fn unload(&self) -> bool {
        self.sandbox.unload()
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.call_timeout(), Duration::from_secs(5));
        assert_eq!(limits.max_pending_calls, 256);
    }

    #[test]
    fn limits_fill_missing_fields_from_defaults() {
        let limits: SandboxLimits = toml::from_str("call_timeout_ms = 100").unwrap();
        assert_eq!(limits.call_timeout_ms, 100);
        assert_eq!(limits.max_pending_calls, 256);
    }
}
