//! In-process coordination store.
//!
//! Mirrors the subset of ZooKeeper semantics the recipes rely on: a node
//! tree rooted at `/`, per-parent sequence counters, session-owned
//! ephemeral nodes and one-shot watches. Every [`MemoryStore::connect`]
//! opens an independent session, which makes it convenient for exercising
//! several contenders from one process.

use crate::client::{Client, CreateMode, SessionState, WatchEvent, Watcher};
use crate::error::{Error, Result};
use async_trait::async_trait;
use log::*;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use time::OffsetDateTime;
use tokio::sync::{oneshot, watch};

type SessionId = u64;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    owner: Option<SessionId>,
    next_seq: u32,
    created_at: OffsetDateTime,
}

impl Node {
    fn new(data: &[u8], owner: Option<SessionId>) -> Node {
        Node {
            data: data.to_vec(),
            owner,
            next_seq: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug)]
struct Registration {
    session: SessionId,
    path: String,
    events: Vec<WatchEvent>,
    tx: oneshot::Sender<Result<WatchEvent>>,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<u64, Registration>,
    next_watch: u64,
    next_session: SessionId,
}

impl Tree {
    fn new() -> Tree {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(&[], None));
        Tree {
            nodes,
            watches: HashMap::new(),
            next_watch: 0,
            next_session: 0,
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };

        self.nodes
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        let ids: Vec<u64> = self
            .watches
            .iter()
            .filter(|(_, r)| r.path == path && r.events.contains(&event))
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            if let Some(r) = self.watches.remove(&id) {
                let _ = r.tx.send(Ok(event));
            }
        }
    }

    fn create(
        &mut self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        validate(path)?;
        let parent = parent_of(path).ok_or_else(|| Error::NodeExists(path.to_string()))?;
        let pnode = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| Error::NoNode(parent.to_string()))?;

        if pnode.owner.is_some() {
            return Err(Error::Client(format!(
                "ephemeral node {parent} cannot have children"
            )));
        }

        let full = if mode.is_sequential() {
            let seq = pnode.next_seq;
            format!("{path}{seq:010}")
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&full) {
            return Err(Error::NodeExists(full));
        }

        if let Some(p) = self.nodes.get_mut(parent) {
            p.next_seq = p.next_seq.wrapping_add(1);
        }

        let owner = mode.is_ephemeral().then_some(session);
        self.nodes.insert(full.clone(), Node::new(data, owner));
        self.fire(&full, WatchEvent::Created);
        self.fire(parent, WatchEvent::ChildrenChanged);
        Ok(full)
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        validate(path)?;
        if !self.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }

        if path == "/" || !self.children(path).is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        self.nodes.remove(path);
        self.fire(path, WatchEvent::Deleted);
        if let Some(parent) = parent_of(path) {
            self.fire(parent, WatchEvent::ChildrenChanged);
        }

        Ok(())
    }

    fn drop_session(&mut self, session: SessionId) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();

        for path in owned {
            if let Err(e) = self.delete(&path) {
                error!("removing ephemeral {path} failed: {e}");
            }
        }

        let ids: Vec<u64> = self
            .watches
            .iter()
            .filter(|(_, r)| r.session == session)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            if let Some(r) = self.watches.remove(&id) {
                let _ = r.tx.send(Err(Error::SessionExpired));
            }
        }
    }
}

fn validate(path: &str) -> Result<()> {
    let ok = path == "/"
        || (path.starts_with('/') && !path.ends_with('/') && !path.contains("//"));
    if ok {
        Ok(())
    } else {
        Err(Error::Client(format!("invalid path: {path:?}")))
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }

    match path.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

fn lock(tree: &Mutex<Tree>) -> MutexGuard<'_, Tree> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared node tree; hand out sessions with [`MemoryStore::connect`].
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Opens a new session against the store.
    pub fn connect(&self) -> Arc<MemoryClient> {
        let id = {
            let mut t = lock(&self.tree);
            t.next_session += 1;
            t.next_session
        };

        let (state, _) = watch::channel(SessionState::Connected);
        debug!("session {id} connected");
        Arc::new(MemoryClient {
            tree: self.tree.clone(),
            id,
            state,
        })
    }
}

/// One session on a [`MemoryStore`].
pub struct MemoryClient {
    tree: Arc<Mutex<Tree>>,
    id: SessionId,
    state: watch::Sender<SessionState>,
}

impl MemoryClient {
    pub fn session_id(&self) -> u64 {
        self.id
    }

    fn check_session(&self) -> Result<()> {
        match *self.state.borrow() {
            SessionState::Connected => Ok(()),
            SessionState::Suspended => Err(Error::ConnectionLoss),
            SessionState::Lost => Err(Error::SessionExpired),
        }
    }

    /// Simulates a dropped connection; operations fail until [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.state.send_if_modified(|s| {
            let changed = *s == SessionState::Connected;
            if changed {
                *s = SessionState::Suspended;
            }
            changed
        });
    }

    pub fn resume(&self) {
        self.state.send_if_modified(|s| {
            let changed = *s == SessionState::Suspended;
            if changed {
                *s = SessionState::Connected;
            }
            changed
        });
    }

    /// Expires the session: its ephemeral nodes are removed and the state
    /// moves to [`SessionState::Lost`].
    pub fn expire(&self) {
        if *self.state.borrow() == SessionState::Lost {
            return;
        }

        lock(&self.tree).drop_session(self.id);
        self.state.send_replace(SessionState::Lost);
        info!(
            "session {} expired at {}",
            self.id,
            OffsetDateTime::now_utc()
        );
    }

    /// Creation time of the node at `path`, if it exists.
    pub fn created_at(&self, path: &str) -> Option<OffsetDateTime> {
        lock(&self.tree).nodes.get(path).map(|n| n.created_at)
    }

    pub fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.check_session()?;
        lock(&self.tree)
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        lock(&self.tree).drop_session(self.id);
    }
}

#[async_trait]
impl Client for MemoryClient {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.check_session()?;
        lock(&self.tree).create(self.id, path, data, mode)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_session()?;
        lock(&self.tree).delete(path)
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check_session()?;
        let t = lock(&self.tree);
        if !t.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }

        Ok(t.children(path))
    }

    async fn exists(&self, path: &str, _watch: bool) -> Result<bool> {
        // Registrations made through wait_for_events are live already;
        // there is no separate server-side watch to arm.
        self.check_session()?;
        Ok(lock(&self.tree).nodes.contains_key(path))
    }

    fn wait_for_events(&self, events: &[WatchEvent], path: &str) -> Watcher {
        let (tx, rx) = oneshot::channel();
        if *self.state.borrow() == SessionState::Lost {
            let _ = tx.send(Err(Error::SessionExpired));
            return Watcher::new(rx);
        }

        let id = {
            let mut t = lock(&self.tree);
            t.next_watch += 1;
            let id = t.next_watch;
            t.watches.insert(
                id,
                Registration {
                    session: self.id,
                    path: path.to_string(),
                    events: events.to_vec(),
                    tx,
                },
            );
            id
        };

        let tree: Weak<Mutex<Tree>> = Arc::downgrade(&self.tree);
        Watcher::new(rx).on_drop(move || {
            if let Some(tree) = tree.upgrade() {
                lock(&tree).watches.remove(&id);
            }
        })
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}
