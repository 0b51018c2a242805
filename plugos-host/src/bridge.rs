//! Syscall bridge between a sandbox and the host registry.
//!
//! Plugin code holds a [`SyscallPort`]. Every call sends a request tagged
//! with a fresh [`CallId`] to the sandbox's bridge loop, which resolves the
//! handler and runs it on its own task. Finished handlers report back over
//! a second channel and the loop completes the waiting caller from its
//! pending-call table. Slow handlers therefore never hold up other calls
//! from the same sandbox, let alone other sandboxes.

use crate::error::{HandlerError, PluginHostError};
use crate::registry::{SharedRegistry, SyscallContext};
use futures::FutureExt;
use plugos_types::{CallId, SandboxId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, warn};

const COMMAND_BUFFER: usize = 32;
const RESPONSE_BUFFER: usize = 32;

type Reply = oneshot::Sender<Result<Value, PluginHostError>>;

/// Request sent from a port to the bridge loop.
enum BridgeCommand {
    Call {
        name: String,
        args: Vec<Value>,
        reply: Reply,
    },
}

/// Result of one handler run, sent back to the bridge loop.
struct SyscallResponse {
    call_id: CallId,
    result: Result<Value, PluginHostError>,
}

/// A sandbox's only way to reach host capabilities.
///
/// Cheap to clone; all clones feed the same bridge.
#[derive(Clone)]
pub struct SyscallPort {
    sandbox_id: SandboxId,
    plugin: Arc<str>,
    commands: mpsc::Sender<BridgeCommand>,
}

impl SyscallPort {
    pub fn sandbox_id(&self) -> SandboxId {
        self.sandbox_id
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    /// Calls syscall `name` and waits for its result.
    ///
    /// Handler failures come back as [`PluginHostError::Handler`] and leave
    /// the sandbox usable.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, PluginHostError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(BridgeCommand::Call {
                name: name.to_string(),
                args,
                reply,
            })
            .await
            .map_err(|_| self.unloaded())?;

        response.await.map_err(|_| self.unloaded())?
    }

    /// Typed variant of [`SyscallPort::call`].
    ///
    /// `args` is serialized first: a tuple or sequence becomes the argument
    /// list, `()` means no arguments and any other value is passed as the
    /// single argument. The result is deserialized into `R`.
    pub async fn syscall<A, R>(&self, name: &str, args: A) -> Result<R, PluginHostError>
    where
        A: Serialize + Send,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let value = self.call(name, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn unloaded(&self) -> PluginHostError {
        PluginHostError::SandboxUnloaded(self.plugin.to_string())
    }
}

/// Owner side of a running bridge loop.
pub(crate) struct Bridge {
    shutdown: Arc<Notify>,
}

impl Bridge {
    /// Spawns the bridge loop for one sandbox and returns the port plugin
    /// code will use.
    pub(crate) fn spawn(
        ctx: SyscallContext,
        registry: SharedRegistry,
        max_pending_calls: usize,
    ) -> (Self, SyscallPort) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = Arc::new(Notify::new());

        let port = SyscallPort {
            sandbox_id: ctx.sandbox_id,
            plugin: Arc::from(ctx.plugin_name.as_str()),
            commands: command_tx,
        };

        tokio::spawn(run_bridge(
            ctx,
            registry,
            max_pending_calls,
            command_rx,
            Arc::clone(&shutdown),
        ));

        (Self { shutdown }, port)
    }

    /// Stops the loop. Outstanding calls fail with `SandboxUnloaded`;
    /// handlers already running finish on their own.
    pub(crate) fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

async fn run_bridge(
    ctx: SyscallContext,
    registry: SharedRegistry,
    max_pending_calls: usize,
    mut command_rx: mpsc::Receiver<BridgeCommand>,
    shutdown: Arc<Notify>,
) {
    let (response_tx, mut response_rx) = mpsc::channel::<SyscallResponse>(RESPONSE_BUFFER);
    let mut pending: HashMap<CallId, Reply> = HashMap::new();
    let mut next_call = CallId::new(1);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,

            Some(response) = response_rx.recv() => {
                match pending.remove(&response.call_id) {
                    // The caller may have given up (timeout); nothing to do then.
                    Some(reply) => {
                        let _ = reply.send(response.result);
                    }
                    None => debug!(
                        plugin = %ctx.plugin_name,
                        call_id = %response.call_id,
                        "Dropping response for unknown call"
                    ),
                }
            }

            command = command_rx.recv() => {
                let Some(BridgeCommand::Call { name, args, reply }) = command else {
                    break;
                };

                if pending.len() >= max_pending_calls {
                    warn!(
                        plugin = %ctx.plugin_name,
                        syscall = %name,
                        limit = max_pending_calls,
                        "Rejecting syscall: too many pending calls"
                    );
                    let _ = reply.send(Err(PluginHostError::TooManyPendingCalls {
                        plugin: ctx.plugin_name.clone(),
                        limit: max_pending_calls,
                    }));
                } else {
                    let resolved = registry.read().await.resolve(&ctx.plugin_name, &name);
                    match resolved {
                        Ok(handler) => {
                            let call_id = next_call;
                            next_call = next_call.next();
                            debug!(
                                plugin = %ctx.plugin_name,
                                sandbox_id = %ctx.sandbox_id,
                                call_id = %call_id,
                                syscall = %name,
                                "Dispatching syscall"
                            );
                            pending.insert(call_id, reply);

                            let call_ctx = ctx.clone();
                            let response_tx = response_tx.clone();
                            tokio::spawn(async move {
                                let result = AssertUnwindSafe(handler.call(call_ctx, args))
                                    .catch_unwind()
                                    .await
                                    .unwrap_or_else(|_| {
                                        Err(HandlerError::new(format!("syscall '{name}' panicked")))
                                    })
                                    .map_err(PluginHostError::Handler);
                                let _ = response_tx.send(SyscallResponse { call_id, result }).await;
                            });
                        }
                        Err(err) => {
                            debug!(plugin = %ctx.plugin_name, syscall = %name, "Unknown syscall");
                            let _ = reply.send(Err(err));
                        }
                    }
                }
            }
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(PluginHostError::SandboxUnloaded(ctx.plugin_name.clone())));
    }
    debug!(plugin = %ctx.plugin_name, sandbox_id = %ctx.sandbox_id, "Syscall bridge stopped");
}
