//! Built-in syscall sets.

mod store;

pub use store::store_syscalls;
