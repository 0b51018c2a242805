//! Sandboxed plugin host for plugos.
//!
//! Loads plugins into isolated sandboxes and routes every capability they
//! use through named syscalls registered on a [`System`]. Plugins never
//! touch host resources directly; the `store.*` syscalls expose a shared
//! key/value document store instead.
//!
//! Running plugin code is delegated to an [`ExecutionProvider`]. The
//! bundled [`NativeProvider`] runs async Rust functions in-process.

mod bridge;
mod error;
mod native;
mod policy;
mod provider;
mod registry;
mod sandbox;
pub mod syscalls;
mod system;

pub use bridge::SyscallPort;
pub use error::{HandlerError, PluginHostError};
pub use native::{NativeFunction, NativeFuture, NativeProvider};
pub use policy::{PolicyConfig, PolicyEngine, PolicyMode};
pub use provider::{CodeUnit, ExecutionProvider};
pub use registry::{
    SharedRegistry, SyscallContext, SyscallHandler, SyscallMap, SyscallRegistry, dispatch,
    syscall_fn,
};
pub use sandbox::{PluginHandle, PluginSandbox, SandboxLimits, SandboxState};
pub use system::System;

pub use plugos_types::{FunctionDefinition, PluginDefinition};
