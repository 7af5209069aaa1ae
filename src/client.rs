//! Boundary to the coordination service.
//!
//! The recipes only need a handful of primitives from the service: node
//! creation and deletion, child listing, existence checks, one-shot watches
//! and the session state. Anything speaking that contract (a real ZooKeeper
//! client, or the in-process [`crate::memory::MemoryStore`]) can drive them.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Kinds of change a watch can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEvent {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Suspended,
    /// The session and every ephemeral node it owned are gone.
    Lost,
}

/// A registered one-shot watch.
///
/// Registration happens when the watcher is created, not when it is first
/// polled, so callers can register and then check state without a gap.
/// Dropping an unfired watcher removes its registration. The sending side
/// may deliver an error instead of an event, e.g. when the session expires
/// before the watch fires.
pub struct Watcher {
    rx: oneshot::Receiver<Result<WatchEvent>>,
    deregister: Option<Box<dyn FnOnce() + Send>>,
}

impl Watcher {
    pub fn new(rx: oneshot::Receiver<Result<WatchEvent>>) -> Self {
        Watcher {
            rx,
            deregister: None,
        }
    }

    /// Attaches the hook run when the watcher is dropped before firing.
    pub fn on_drop(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.deregister = Some(Box::new(f));
        self
    }
}

impl Future for Watcher {
    type Output = Result<WatchEvent>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => {
                self.deregister = None;
                Poll::Ready(res)
            }
            // Sender dropped without a verdict.
            Poll::Ready(Err(_)) => {
                self.deregister = None;
                Poll::Ready(Err(Error::ConnectionLoss))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some(f) = self.deregister.take() {
            f();
        }
    }
}

/// Operations the recipes consume from a coordination-service client.
#[async_trait]
pub trait Client: Send + Sync {
    /// Creates `path` and returns the full path actually created (with the
    /// sequence suffix for sequential modes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Deletes `path`; fails with [`Error::NoNode`] if it is absent.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Checks existence of `path`, optionally arming a server-side watch.
    async fn exists(&self, path: &str, watch: bool) -> Result<bool>;

    /// Registers for the first of `events` on `path`.
    fn wait_for_events(&self, events: &[WatchEvent], path: &str) -> Watcher;

    fn session_state(&self) -> watch::Receiver<SessionState>;
}
