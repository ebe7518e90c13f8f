///
/// Versioned store contract: values, preconditions, change events and the backend trait.
///
pub mod store;

///
/// Store backends: etcd v3 and in-process.
///
pub mod backend;

///
/// Compare-and-swap and compare-and-delete over a versioned store.
///
pub mod cas;

///
/// Blocking, interruptible watches over a single key or a directory.
///
pub mod watcher;

///
/// Distributed lock with lease renewal built on compare-and-swap and watches.
///
pub mod lock;

///
/// Plain key access and the store factory.
///
pub mod kv;

///
/// Backend selection and connection settings.
///
pub mod config;

pub mod error;

///
/// Utility function to manage various transient errors.
pub mod retry;

///
/// Utiltities for inter-task communication
///
pub mod sync;

///
/// Alias for a store-assigned modification version
pub type Version = u64;

pub use {
    error::Error,
    kv::Store,
    lock::{LockHandle, LockLostNotify, LockOptions},
    store::{Action, ChangeEvent, Precondition, VersionedStore, VersionedValue},
    watcher::{KeyWatcher, TreeWatcher},
};
