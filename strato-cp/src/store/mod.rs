//! Object store, typed registry, and the error taxonomy.

pub mod error;
pub mod kv;
pub mod mem;
pub mod registry;

pub use error::{Result, StoreError};
pub use kv::{Compare, Fence, KvEntry, KvStore, LeaseHandle, LeaseInfo, Txn, TxnOp, WatchEvent};
pub use mem::MemStore;
pub use registry::{Registry, RegistryEvent};
