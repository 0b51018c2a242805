//! Contract between the host and whatever actually runs plugin code.

use crate::bridge::SyscallPort;
use crate::error::PluginHostError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use plugos_types::PluginDefinition;
use serde_json::Value;

/// Builds isolated code units from plugin definitions.
///
/// The host never parses `FunctionDefinition::code`; a provider decides
/// what it means.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    /// Creates the unit hosting `definition`. All capability calls the unit
    /// makes must go through `port`.
    async fn create_sandbox(
        &self,
        definition: &PluginDefinition,
        port: SyscallPort,
    ) -> Result<Box<dyn CodeUnit>, PluginHostError>;
}

/// A loaded plugin as seen by the host.
pub trait CodeUnit: Send + Sync {
    /// Names of the functions this unit can run.
    fn exports(&self) -> Vec<String>;

    /// Runs an exported function. Returning
    /// [`PluginHostError::IsolationFailure`] marks the unit as unusable.
    fn invoke(
        &self,
        function: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, PluginHostError>>;

    /// Stops all running work. Called once, when the sandbox is unloaded.
    fn terminate(&self);
}
