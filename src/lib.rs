//! Distributed lock and double barrier recipes for a ZooKeeper-style
//! coordination service.
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let mut lock = Lock::builder(store.connect()).base_path("/locks/jobs").build()?;
//! let mut guard = lock.acquire(Some(Duration::from_secs(5))).await?;
//! // ... critical section ...
//! guard.release().await?;
//! ```

pub mod barrier;
pub mod client;
pub mod error;
pub mod lock;
pub mod memory;
pub mod sequential;

pub use barrier::{DoubleBarrier, DoubleBarrierBuilder};
pub use client::{Client, CreateMode, SessionState, WatchEvent, Watcher};
pub use error::{Error, Result};
pub use lock::{Lock, LockBuilder, LockGuard, SharedLock, SharedLockBuilder};
pub use memory::{MemoryClient, MemoryStore};
pub use sequential::SequentialRecipe;
