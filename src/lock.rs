//! Queue-based mutual exclusion.
//!
//! Contenders line up as sequential nodes under a base path and each one
//! waits for the nearest node ahead of it that it conflicts with. With no
//! conflict filter that is plain FIFO exclusion; with one, it gives shared
//! (read/write) locking.

use crate::client::{Client, SessionState};
use crate::error::{Error, Result};
use crate::sequential::{SequentialRecipe, bounded};
use log::*;
use scopeguard::defer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const LOCK_LABEL: &str = "lock";
const READ_LABEL: &str = "read";
const WRITE_LABEL: &str = "write";

pub struct Lock {
    recipe: SequentialRecipe,
}

impl Lock {
    pub fn builder(client: Arc<dyn Client>) -> LockBuilder {
        LockBuilder::new(client)
    }

    pub fn base_path(&self) -> &str {
        self.recipe.base_path()
    }

    /// Takes the exclusive lock.
    pub async fn acquire(&mut self, timeout: Option<Duration>) -> Result<LockGuard> {
        self.wait_in_line(LOCK_LABEL, timeout, None).await
    }

    /// Queues a node labelled `label` and waits until nothing ahead of it
    /// blocks. With `blocked_by`, only earlier nodes carrying one of those
    /// labels block.
    ///
    /// On failure our own node is removed (best effort) before the error is
    /// returned, and a node left behind by an earlier failed attempt is
    /// removed before queueing again. [`Error::SessionLost`] means our node
    /// disappeared while waiting; the lock was not acquired.
    pub async fn wait_in_line(
        &mut self,
        label: &str,
        timeout: Option<Duration>,
        blocked_by: Option<&[&str]>,
    ) -> Result<LockGuard> {
        let start = Instant::now();
        defer! {
            debug!("wait_in_line({label}) took {:?}", start.elapsed());
        }

        self.recipe.delete_unique_znode(label).await?;
        match bounded(timeout, self.queue_up(label, blocked_by)).await {
            Err(Error::SessionLost) => Err(Error::SessionLost),
            Err(e) => {
                if let Err(cleanup) = self.recipe.delete_unique_znode(label).await {
                    warn!("cleanup of {label} after '{e}' failed: {cleanup}");
                }
                Err(e)
            }
            res => res,
        }
    }

    async fn queue_up(&mut self, label: &str, blocked_by: Option<&[&str]>) -> Result<LockGuard> {
        let path = self.recipe.create_unique_znode(label).await?;

        loop {
            let (owned, contenders) = self.recipe.analyze_siblings().await?;
            let Some(&position) = owned.get(label) else {
                warn!("{path} vanished while waiting in line");
                return Err(Error::SessionLost);
            };

            let mut blocker = None;
            for c in contenders[..position].iter().rev() {
                let conflicts = match blocked_by {
                    Some(roles) => roles.contains(&self.recipe.determine_znode_label(c)?),
                    None => true,
                };

                if conflicts {
                    blocker = Some(c);
                    break;
                }
            }

            match blocker {
                // Nearest blocker only; the whole ranking is rechecked after.
                Some(b) => self.recipe.wait_on_sibling(b).await?,
                None => break,
            }
        }

        // The guard owns the node from here on.
        self.recipe.disown(label);
        info!("acquired {path}");
        Ok(LockGuard::new(self.recipe.client().clone(), path))
    }
}

pub struct LockBuilder {
    client: Arc<dyn Client>,
    base_path: String,
}

impl LockBuilder {
    pub fn new(client: Arc<dyn Client>) -> LockBuilder {
        LockBuilder {
            client,
            base_path: "/".to_string(),
        }
    }

    pub fn base_path(mut self, path: impl Into<String>) -> LockBuilder {
        self.base_path = path.into();
        self
    }

    pub fn build(self) -> Lock {
        Lock {
            recipe: SequentialRecipe::new(self.client, self.base_path),
        }
    }
}

/// Readers share the lock with each other; writers exclude everyone.
pub struct SharedLock {
    inner: Lock,
}

impl SharedLock {
    pub fn builder(client: Arc<dyn Client>) -> SharedLockBuilder {
        SharedLockBuilder::new(client)
    }

    pub async fn acquire_read(&mut self, timeout: Option<Duration>) -> Result<LockGuard> {
        self.inner
            .wait_in_line(READ_LABEL, timeout, Some(&[WRITE_LABEL]))
            .await
    }

    pub async fn acquire_write(&mut self, timeout: Option<Duration>) -> Result<LockGuard> {
        self.inner
            .wait_in_line(WRITE_LABEL, timeout, Some(&[READ_LABEL, WRITE_LABEL]))
            .await
    }
}

pub struct SharedLockBuilder {
    inner: LockBuilder,
}

impl SharedLockBuilder {
    pub fn new(client: Arc<dyn Client>) -> SharedLockBuilder {
        SharedLockBuilder {
            inner: LockBuilder::new(client),
        }
    }

    pub fn base_path(mut self, path: impl Into<String>) -> SharedLockBuilder {
        self.inner = self.inner.base_path(path);
        self
    }

    pub fn build(self) -> SharedLock {
        SharedLock {
            inner: self.inner.build(),
        }
    }
}

/// Proof of acquisition returned by [`Lock::wait_in_line`].
///
/// A background task watches the session; if it is lost while the guard is
/// held, [`is_acquired`](Self::is_acquired) turns false and a warning is
/// logged. Releasing deletes the participant node. A guard dropped without
/// [`release`](Self::release) schedules the deletion on the current runtime.
pub struct LockGuard {
    client: Arc<dyn Client>,
    path: String,
    acquired: Arc<AtomicBool>,
    released: bool,
    observer: JoinHandle<()>,
}

impl LockGuard {
    fn new(client: Arc<dyn Client>, path: String) -> LockGuard {
        let acquired = Arc::new(AtomicBool::new(true));
        let observer = tokio::spawn(watch_session(
            client.clone(),
            acquired.clone(),
            path.clone(),
        ));

        LockGuard {
            client,
            path,
            acquired,
            released: false,
            observer,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }

    /// Releases the lock. Once it succeeds, calling it again is a no-op;
    /// after a failure the guard stays held and release can be retried.
    /// An expired session is reported once and ends the guard, since its
    /// node is already gone.
    pub async fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        let res = match self.client.delete(&self.path).await {
            Ok(()) => {
                info!("released {}", self.path);
                Ok(())
            }
            Err(e) if e.is_no_node() => Ok(()),
            // The ephemeral node went with the session.
            Err(Error::SessionExpired) => Err(Error::SessionExpired),
            Err(e) => return Err(e),
        };

        self.released = true;
        self.acquired.store(false, Ordering::Release);
        self.observer.abort();
        res
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        self.acquired.store(false, Ordering::Release);
        self.observer.abort();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                let path = std::mem::take(&mut self.path);
                handle.spawn(async move {
                    match client.delete(&path).await {
                        Ok(()) => debug!("released {path} on drop"),
                        Err(e) if e.is_no_node() => {}
                        Err(e) => warn!("releasing {path} on drop failed: {e}"),
                    }
                });
            }
            Err(_) => warn!("{} dropped outside a runtime; left to session expiry", self.path),
        }
    }
}

async fn watch_session(client: Arc<dyn Client>, acquired: Arc<AtomicBool>, path: String) {
    let mut state = client.session_state();
    if state.wait_for(|s| *s == SessionState::Lost).await.is_err() {
        return;
    }

    if acquired.swap(false, Ordering::AcqRel) {
        warn!("session expired at some point, lock {path} no longer acquired");
    }
}
