//! Central plugin lifecycle manager.
//!
//! Owns the syscall registry and every loaded sandbox, enforces policy at
//! load time and routes invocations by plugin name. Names of unloaded
//! plugins are remembered until reloaded, so calls by name report
//! `SandboxUnloaded` rather than `PluginNotFound`.

use crate::error::PluginHostError;
use crate::policy::{PolicyConfig, PolicyEngine};
use crate::provider::ExecutionProvider;
use crate::registry::{self, SharedRegistry, SyscallContext, SyscallMap, SyscallRegistry};
use crate::sandbox::{PluginHandle, PluginSandbox};
use plugos_types::PluginDefinition;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub struct System {
    plugins: HashMap<String, PluginHandle>,
    unloaded: HashSet<String>,
    registry: SharedRegistry,
    policy_engine: PolicyEngine,
}

impl System {
    /// Creates a system with an unrestricted policy.
    pub fn new() -> Self {
        Self::with_policy(PolicyEngine::with_config(PolicyConfig::default()))
    }

    pub fn with_policy(policy_engine: PolicyEngine) -> Self {
        let registry =
            SyscallRegistry::with_denied(policy_engine.config().denied_syscalls.iter().cloned());
        Self {
            plugins: HashMap::new(),
            unloaded: HashSet::new(),
            registry: Arc::new(RwLock::new(registry)),
            policy_engine,
        }
    }

    /// Makes `syscalls` available to the plugins named in `scope` (all
    /// plugins if empty), including ones already loaded.
    pub async fn register_syscalls(
        &self,
        scope: Vec<String>,
        syscalls: SyscallMap,
    ) -> Result<(), PluginHostError> {
        self.registry.write().await.register(scope, syscalls)
    }

    // ================================================================
    // Loading / Unloading
    // ================================================================

    /// Loads `definition` into a fresh sandbox created by `provider`.
    pub async fn load(
        &mut self,
        definition: &PluginDefinition,
        provider: &dyn ExecutionProvider,
    ) -> Result<PluginHandle, PluginHostError> {
        let name = definition.name.clone();

        if !self.policy_engine.is_plugin_allowed(&name) {
            return Err(PluginHostError::PolicyDenied(format!(
                "plugin '{}' blocked by policy",
                name
            )));
        }

        if self.plugins.contains_key(&name) {
            return Err(PluginHostError::PluginAlreadyLoaded(name));
        }

        let handle = PluginSandbox::load(
            definition,
            provider,
            Arc::clone(&self.registry),
            self.policy_engine.limits(),
        )
        .await?;

        info!(plugin = %name, sandbox_id = %handle.id(), "Plugin loaded");
        self.unloaded.remove(&name);
        self.plugins.insert(name, handle.clone());
        Ok(handle)
    }

    /// Unloads one plugin. Handles held elsewhere see `SandboxUnloaded`.
    pub fn unload(&mut self, plugin: &str) -> Result<(), PluginHostError> {
        match self.plugins.remove(plugin) {
            Some(handle) => {
                handle.unload();
                self.unloaded.insert(plugin.to_string());
                info!(plugin = %plugin, "Plugin unloaded");
                Ok(())
            }
            None => Err(self.missing(plugin)),
        }
    }

    /// Unloads every plugin. Safe to call repeatedly or with nothing loaded.
    pub fn unload_all(&mut self) {
        let count = self.plugins.len();
        for (name, handle) in self.plugins.drain() {
            handle.unload();
            self.unloaded.insert(name);
        }
        if count > 0 {
            info!(count, "All plugins unloaded");
        }
    }

    // ================================================================
    // Plugin access
    // ================================================================

    pub fn get_plugin(&self, plugin: &str) -> Result<&PluginHandle, PluginHostError> {
        self.plugins.get(plugin).ok_or_else(|| self.missing(plugin))
    }

    fn missing(&self, plugin: &str) -> PluginHostError {
        if self.unloaded.contains(plugin) {
            PluginHostError::SandboxUnloaded(plugin.to_string())
        } else {
            PluginHostError::PluginNotFound(plugin.to_string())
        }
    }

    /// Names of all loaded plugins, sorted.
    pub fn list_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_loaded(&self, plugin: &str) -> bool {
        self.plugins.contains_key(plugin)
    }

    /// Invokes `function` of a loaded plugin.
    pub async fn invoke(
        &self,
        plugin: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, PluginHostError> {
        let handle = self.get_plugin(plugin)?.clone();
        handle.invoke(function, args).await
    }

    /// Runs a syscall from the host side, resolved as if `plugin` called it.
    pub async fn dispatch_syscall(
        &self,
        plugin: &str,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, PluginHostError> {
        registry::dispatch(&self.registry, SyscallContext::host(plugin), name, args).await
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.unload_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeProvider;
    use crate::policy::PolicyMode;

    fn provider() -> NativeProvider {
        NativeProvider::new().with_function("noop", |_port, _args| async { Ok(Value::Null) })
    }

    #[tokio::test]
    async fn duplicate_plugin_names_are_rejected() {
        let mut system = System::new();
        let def = PluginDefinition::new("p").function("f", "noop");
        system.load(&def, &provider()).await.unwrap();
        let err = system.load(&def, &provider()).await.unwrap_err();
        assert!(matches!(err, PluginHostError::PluginAlreadyLoaded(ref n) if n == "p"));
        assert_eq!(system.plugin_count(), 1);
    }

    #[tokio::test]
    async fn policy_blocks_unlisted_plugins() {
        let mut system = System::with_policy(PolicyEngine::with_config(PolicyConfig {
            mode: PolicyMode::Allowlist,
            plugin_names: vec!["ok".into()],
            ..Default::default()
        }));
        let blocked = PluginDefinition::new("nope").function("f", "noop");
        let err = system.load(&blocked, &provider()).await.unwrap_err();
        assert!(matches!(err, PluginHostError::PolicyDenied(_)));
        assert!(!system.is_loaded("nope"));

        let allowed = PluginDefinition::new("ok").function("f", "noop");
        assert!(system.load(&allowed, &provider()).await.is_ok());
    }

    #[tokio::test]
    async fn unload_unknown_plugin_is_not_found() {
        let mut system = System::new();
        assert!(system.unload("ghost").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unload_all_is_idempotent() {
        let mut system = System::new();
        system.unload_all();
        let def = PluginDefinition::new("p").function("f", "noop");
        let handle = system.load(&def, &provider()).await.unwrap();
        system.unload_all();
        system.unload_all();
        assert_eq!(system.plugin_count(), 0);
        assert!(handle.is_unloaded());
    }

    #[tokio::test]
    async fn unloaded_names_report_sandbox_unloaded_until_reloaded() {
        let mut system = System::new();
        let def = PluginDefinition::new("p").function("f", "noop");
        system.load(&def, &provider()).await.unwrap();
        system.unload("p").unwrap();

        let err = system.invoke("p", "f", vec![]).await.unwrap_err();
        assert!(matches!(err, PluginHostError::SandboxUnloaded(ref n) if n == "p"));
        assert!(matches!(system.unload("p"), Err(PluginHostError::SandboxUnloaded(_))));
        assert!(system.get_plugin("ghost").unwrap_err().is_not_found());

        system.load(&def, &provider()).await.unwrap();
        assert_eq!(system.invoke("p", "f", vec![]).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn failed_load_does_not_register_plugin() {
        let mut system = System::new();
        let def = PluginDefinition::new("p").function("f", "missing-code");
        let err = system.load(&def, &provider()).await.unwrap_err();
        assert!(matches!(err, PluginHostError::InitializationFailed(_)));
        assert!(system.list_plugins().is_empty());
    }
}
