//! `store.*` syscalls over a [`KvStore`].
//!
//! | name | args | result |
//! |---|---|---|
//! | `store.set` | key, value | null |
//! | `store.get` | key | value or null |
//! | `store.batchSet` | `[{key, value}]` | null |
//! | `store.batchGet` | `[key]` | `[value or null]` |
//! | `store.delete` | key | null |
//! | `store.batchDelete` | `[key]` | null |
//! | `store.deleteAll` | | null |
//! | `store.query` | query spec (optional) | `[{key, value}]` |
//! | `store.deleteQuery` | query spec (optional) | null |

use crate::error::HandlerError;
use crate::registry::{SyscallContext, SyscallHandler, SyscallMap};
use async_trait::async_trait;
use plugos_storage::KvStore;
use plugos_types::{KvPair, QuerySpec};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreOp {
    Set,
    Get,
    BatchSet,
    BatchGet,
    Delete,
    BatchDelete,
    DeleteAll,
    Query,
    DeleteQuery,
}

impl StoreOp {
    const ALL: [StoreOp; 9] = [
        Self::Set,
        Self::Get,
        Self::BatchSet,
        Self::BatchGet,
        Self::Delete,
        Self::BatchDelete,
        Self::DeleteAll,
        Self::Query,
        Self::DeleteQuery,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Set => "store.set",
            Self::Get => "store.get",
            Self::BatchSet => "store.batchSet",
            Self::BatchGet => "store.batchGet",
            Self::Delete => "store.delete",
            Self::BatchDelete => "store.batchDelete",
            Self::DeleteAll => "store.deleteAll",
            Self::Query => "store.query",
            Self::DeleteQuery => "store.deleteQuery",
        }
    }
}

/// Builds the `store.*` syscalls, all backed by `store`.
pub fn store_syscalls(store: Arc<KvStore>) -> SyscallMap {
    StoreOp::ALL
        .iter()
        .map(|&op| {
            let handler: Arc<dyn SyscallHandler> = Arc::new(StoreSyscall {
                store: Arc::clone(&store),
                op,
            });
            (op.name().to_string(), handler)
        })
        .collect()
}

struct StoreSyscall {
    store: Arc<KvStore>,
    op: StoreOp,
}

#[async_trait]
impl SyscallHandler for StoreSyscall {
    async fn call(&self, ctx: SyscallContext, args: Vec<Value>) -> Result<Value, HandlerError> {
        debug!(plugin = %ctx.plugin_name, syscall = self.op.name(), "Store syscall");

        match self.op {
            StoreOp::Set => {
                let key = key_arg(&args, 0)?;
                let value = required(&args, 1, "value")?.clone();
                self.blocking(move |store| {
                    store.put(&key, &value)?;
                    Ok(Value::Null)
                })
                .await
            }
            StoreOp::Get => {
                let key = key_arg(&args, 0)?;
                self.blocking(move |store| Ok(store.get(&key)?.unwrap_or(Value::Null)))
                    .await
            }
            StoreOp::BatchSet => {
                let pairs: Vec<KvPair> = decode(&args, 0, "pairs")?;
                self.blocking(move |store| {
                    store.batch_put(&pairs)?;
                    Ok(Value::Null)
                })
                .await
            }
            StoreOp::BatchGet => {
                let keys: Vec<String> = decode(&args, 0, "keys")?;
                self.blocking(move |store| {
                    let values = store.batch_get(&keys)?;
                    Ok(Value::Array(
                        values
                            .into_iter()
                            .map(|v| v.unwrap_or(Value::Null))
                            .collect(),
                    ))
                })
                .await
            }
            StoreOp::Delete => {
                let key = key_arg(&args, 0)?;
                self.blocking(move |store| {
                    store.delete(&key)?;
                    Ok(Value::Null)
                })
                .await
            }
            StoreOp::BatchDelete => {
                let keys: Vec<String> = decode(&args, 0, "keys")?;
                self.blocking(move |store| {
                    store.delete_many(&keys)?;
                    Ok(Value::Null)
                })
                .await
            }
            StoreOp::DeleteAll => {
                self.blocking(|store| {
                    store.delete_all()?;
                    Ok(Value::Null)
                })
                .await
            }
            StoreOp::Query => {
                let spec = spec_arg(&args)?;
                self.blocking(move |store| Ok(serde_json::to_value(store.query(&spec)?)?))
                    .await
            }
            StoreOp::DeleteQuery => {
                let spec = spec_arg(&args)?;
                let plugin = ctx.plugin_name.clone();
                self.blocking(move |store| {
                    let removed = store.delete_query(&spec)?;
                    debug!(plugin = %plugin, removed, "store.deleteQuery");
                    Ok(Value::Null)
                })
                .await
            }
        }
    }
}

impl StoreSyscall {
    /// Runs a storage operation on the blocking pool. The operation runs to
    /// completion even if the calling sandbox is unloaded meanwhile.
    async fn blocking<F>(&self, op: F) -> Result<Value, HandlerError>
    where
        F: FnOnce(&KvStore) -> Result<Value, HandlerError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || op(&store)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(syscall = self.op.name(), "Storage task failed: {}", e);
                Err(HandlerError::new(format!("storage task failed: {e}")))
            }
        }
    }
}

fn required<'a>(args: &'a [Value], index: usize, what: &str) -> Result<&'a Value, HandlerError> {
    args.get(index)
        .ok_or_else(|| HandlerError::new(format!("missing argument {index} ({what})")))
}

fn key_arg(args: &[Value], index: usize) -> Result<String, HandlerError> {
    match required(args, index, "key")? {
        Value::String(key) => Ok(key.clone()),
        other => Err(HandlerError::new(format!(
            "argument {index} (key) must be a string, got {other}"
        ))),
    }
}

fn decode<T: DeserializeOwned>(
    args: &[Value],
    index: usize,
    what: &str,
) -> Result<T, HandlerError> {
    Ok(serde_json::from_value(required(args, index, what)?.clone())?)
}

/// A missing or null spec matches everything.
fn spec_arg(args: &[Value]) -> Result<QuerySpec, HandlerError> {
    match args.first() {
        None | Some(Value::Null) => Ok(QuerySpec::all()),
        Some(spec) => Ok(serde_json::from_value(spec.clone())?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler(store: &Arc<KvStore>, name: &str) -> Arc<dyn SyscallHandler> {
        Arc::clone(&store_syscalls(Arc::clone(store))[name])
    }

    #[test]
    fn exposes_every_store_syscall() {
        let store = Arc::new(KvStore::open_in_memory("t").unwrap());
        let names: Vec<_> = store_syscalls(store).into_keys().collect();
        assert_eq!(
            names,
            vec![
                "store.batchDelete",
                "store.batchGet",
                "store.batchSet",
                "store.delete",
                "store.deleteAll",
                "store.deleteQuery",
                "store.get",
                "store.query",
                "store.set",
            ]
        );
    }

    #[tokio::test]
    async fn set_requires_string_key() {
        let store = Arc::new(KvStore::open_in_memory("t").unwrap());
        let err = handler(&store, "store.set")
            .call(SyscallContext::host("p"), vec![json!(1), json!("v")])
            .await
            .unwrap_err();
        assert!(err.message.contains("must be a string"));
    }

    #[tokio::test]
    async fn set_requires_value() {
        let store = Arc::new(KvStore::open_in_memory("t").unwrap());
        let err = handler(&store, "store.set")
            .call(SyscallContext::host("p"), vec![json!("k")])
            .await
            .unwrap_err();
        assert!(err.message.contains("missing argument 1"));
    }

    #[tokio::test]
    async fn get_missing_is_null() {
        let store = Arc::new(KvStore::open_in_memory("t").unwrap());
        let out = handler(&store, "store.get")
            .call(SyscallContext::host("p"), vec![json!("nope")])
            .await
            .unwrap();
        assert_eq!(out, Value::Null);
    }

    #[tokio::test]
    async fn malformed_spec_is_handler_error() {
        let store = Arc::new(KvStore::open_in_memory("t").unwrap());
        let err = handler(&store, "store.query")
            .call(
                SyscallContext::host("p"),
                vec![json!({ "filter": [{ "op": "~", "prop": "a", "value": 1 }] })],
            )
            .await
            .unwrap_err();
        assert!(err.message.starts_with("invalid arguments"));
    }

    #[tokio::test]
    async fn set_operator_without_array_is_rejected() {
        let store = Arc::new(KvStore::open_in_memory("t").unwrap());
        let err = handler(&store, "store.query")
            .call(
                SyscallContext::host("p"),
                vec![json!({ "filter": [{ "op": "in", "prop": "a", "value": 1 }] })],
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("expected an array"));
    }
}
