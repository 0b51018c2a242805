//! Named syscalls and the scopes they are visible in.
//!
//! A registration pairs a scope (a list of plugin names, empty meaning
//! every plugin) with a map of handlers. A plugin sees the union of all
//! registrations whose scope includes it. Two registrations may only
//! define the same name if their scopes are disjoint, so every lookup
//! resolves to at most one handler.

use crate::error::{HandlerError, PluginHostError};
use async_trait::async_trait;
use plugos_types::SandboxId;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Who is calling a syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallContext {
    pub sandbox_id: SandboxId,
    pub plugin_name: String,
}

impl SyscallContext {
    pub fn new(sandbox_id: SandboxId, plugin_name: impl Into<String>) -> Self {
        Self {
            sandbox_id,
            plugin_name: plugin_name.into(),
        }
    }

    /// Context for calls issued by the host itself on behalf of `plugin_name`.
    pub fn host(plugin_name: impl Into<String>) -> Self {
        Self::new(SandboxId::new(), plugin_name)
    }
}

/// A host capability callable by plugins.
#[async_trait]
pub trait SyscallHandler: Send + Sync {
    async fn call(&self, ctx: SyscallContext, args: Vec<Value>) -> Result<Value, HandlerError>;
}

pub type SyscallMap = BTreeMap<String, Arc<dyn SyscallHandler>>;

/// Registry shared between the system and its sandboxes.
pub type SharedRegistry = Arc<RwLock<SyscallRegistry>>;

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> SyscallHandler for FnHandler<F>
where
    F: Fn(SyscallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, ctx: SyscallContext, args: Vec<Value>) -> Result<Value, HandlerError> {
        (self.0)(ctx, args).await
    }
}

/// Wraps an async closure as a [`SyscallHandler`].
pub fn syscall_fn<F, Fut>(f: F) -> Arc<dyn SyscallHandler>
where
    F: Fn(SyscallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct Registration {
    scope: Vec<String>,
    syscalls: SyscallMap,
}

impl Registration {
    fn covers(&self, plugin: &str) -> bool {
        self.scope.is_empty() || self.scope.iter().any(|p| p == plugin)
    }

    fn overlaps(&self, scope: &[String]) -> bool {
        self.scope.is_empty() || scope.is_empty() || scope.iter().any(|p| self.covers(p))
    }
}

#[derive(Default)]
pub struct SyscallRegistry {
    registrations: Vec<Registration>,
    denied: HashSet<String>,
}

impl SyscallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that hides the given syscall names from every plugin.
    pub fn with_denied<I, S>(denied: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            registrations: Vec::new(),
            denied: denied.into_iter().map(Into::into).collect(),
        }
    }

    /// Adds `syscalls`, visible to the plugins named in `scope`.
    ///
    /// Fails without registering anything if one of the names is already
    /// defined for a plugin in `scope`.
    pub fn register(
        &mut self,
        scope: Vec<String>,
        syscalls: SyscallMap,
    ) -> Result<(), PluginHostError> {
        for existing in self.registrations.iter().filter(|r| r.overlaps(&scope)) {
            if let Some(name) = syscalls.keys().find(|n| existing.syscalls.contains_key(*n)) {
                return Err(PluginHostError::DuplicateSyscall(name.clone()));
            }
        }

        debug!(scope = ?scope, count = syscalls.len(), "Registered syscalls");
        self.registrations.push(Registration { scope, syscalls });
        Ok(())
    }

    /// Finds the handler `plugin` sees under `name`.
    pub fn resolve(
        &self,
        plugin: &str,
        name: &str,
    ) -> Result<Arc<dyn SyscallHandler>, PluginHostError> {
        if self.denied.contains(name) {
            debug!(plugin = %plugin, syscall = %name, "Syscall denied by policy");
            return Err(PluginHostError::SyscallNotFound(name.to_string()));
        }

        self.registrations
            .iter()
            .filter(|r| r.covers(plugin))
            .find_map(|r| r.syscalls.get(name))
            .cloned()
            .ok_or_else(|| PluginHostError::SyscallNotFound(name.to_string()))
    }

    /// Every syscall name visible to `plugin`, sorted.
    pub fn names_for(&self, plugin: &str) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .registrations
            .iter()
            .filter(|r| r.covers(plugin))
            .flat_map(|r| r.syscalls.keys())
            .filter(|n| !self.denied.contains(*n))
            .collect();
        names.into_iter().cloned().collect()
    }

    pub fn is_denied(&self, name: &str) -> bool {
        self.denied.contains(name)
    }
}

/// Resolves and runs a syscall.
///
/// The registry lock is released before the handler runs, so long-running
/// handlers never block registration.
pub async fn dispatch(
    registry: &RwLock<SyscallRegistry>,
    ctx: SyscallContext,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, PluginHostError> {
    let handler = registry.read().await.resolve(&ctx.plugin_name, name)?;
    Ok(handler.call(ctx, args).await?)
}
