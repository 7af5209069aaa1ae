//! Double barrier: participants wait on entry until a quorum has gathered,
//! and on exit until everyone else has gone.
//!
//! Entry is signalled by a sentinel node under the barrier's base path,
//! created by whichever participant first sees the quorum. Exit drains
//! participants one at a time: the lowest-ranked node leaves last.

use crate::client::{Client, WatchEvent};
use crate::error::{Error, Result};
use crate::sequential::{SequentialRecipe, bounded};
use log::*;
use scopeguard::defer;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WORKER_LABEL: &str = "worker";
const SENTINEL: &str = "sentinel";

pub struct DoubleBarrier {
    recipe: SequentialRecipe,
    min_participants: usize,
}

impl DoubleBarrier {
    pub fn builder(client: Arc<dyn Client>) -> DoubleBarrierBuilder {
        DoubleBarrierBuilder::new(client)
    }

    pub fn base_path(&self) -> &str {
        self.recipe.base_path()
    }

    pub fn min_participants(&self) -> usize {
        self.min_participants
    }

    pub fn sentinel_path(&self) -> String {
        self.recipe.sibling_path(SENTINEL)
    }

    /// Joins the barrier and waits until `min_participants` have joined.
    ///
    /// A caller arriving after the barrier opened still registers as a
    /// participant and returns at once. On failure the caller's node is
    /// withdrawn (best effort) before the error is returned; a node left
    /// behind by an earlier failed attempt is replaced.
    pub async fn enter(&mut self, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let base = self.recipe.base_path().to_string();
        defer! {
            debug!("enter {base} took {:?}", start.elapsed());
        }

        self.recipe.delete_unique_znode(WORKER_LABEL).await?;
        match bounded(timeout, self.wait_for_quorum()).await {
            Err(Error::SessionLost) => Err(Error::SessionLost),
            Err(e) => {
                if let Err(cleanup) = self.recipe.delete_unique_znode(WORKER_LABEL).await {
                    warn!("withdrawing from {base} after '{e}' failed: {cleanup}");
                }
                Err(e)
            }
            res => res,
        }
    }

    async fn wait_for_quorum(&mut self) -> Result<()> {
        debug!("entering double barrier {}", self.recipe.base_path());
        let sentinel = self.sentinel_path();
        let client = self.recipe.client().clone();

        // Registered ahead of the existence check so a creation in between
        // is not missed.
        let lifted = client.wait_for_events(&[WatchEvent::Created], &sentinel);
        let open = client.exists(&sentinel, true).await?;

        self.recipe.create_unique_znode(WORKER_LABEL).await?;
        let (_, participants) = self.recipe.analyze_siblings().await?;

        if open {
            return Ok(());
        }

        if participants.len() >= self.min_participants {
            info!(
                "quorum of {} reached on {}, opening barrier",
                participants.len(),
                self.recipe.base_path()
            );
            return self.recipe.create_znode(&sentinel).await;
        }

        lifted.await.map(|_| ())
    }

    /// Leaves the barrier, returning once every other participant has left.
    pub async fn leave(&mut self, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let base = self.recipe.base_path().to_string();
        defer! {
            debug!("leave {base} took {:?}", start.elapsed());
        }

        bounded(timeout, self.drain()).await
    }

    async fn drain(&mut self) -> Result<()> {
        debug!("leaving double barrier {}", self.recipe.base_path());
        if self.recipe.owned_path(WORKER_LABEL).is_none() {
            debug!("not a participant of {}", self.recipe.base_path());
            return Ok(());
        }

        let (mut owned, mut participants) = self.recipe.analyze_siblings().await?;
        if !owned.contains_key(WORKER_LABEL) {
            return Err(Error::SessionLost);
        }

        loop {
            match owned.get(WORKER_LABEL) {
                Some(_) if participants.len() == 1 => {
                    self.recipe.delete_unique_znode(WORKER_LABEL).await?;
                    return self.remove_sentinel().await;
                }
                Some(0) => {
                    if let Some(last) = participants.last() {
                        self.recipe.wait_on_sibling(last).await?;
                    }
                }
                Some(_) => {
                    self.recipe.delete_unique_znode(WORKER_LABEL).await?;
                    self.recipe.wait_on_sibling(&participants[0]).await?;
                }
                // Already withdrawn: follow the lowest until nobody is left.
                None => match participants.first() {
                    Some(lowest) => self.recipe.wait_on_sibling(lowest).await?,
                    None => return self.remove_sentinel().await,
                },
            }

            (owned, participants) = self.recipe.analyze_siblings().await?;
        }
    }

    async fn remove_sentinel(&self) -> Result<()> {
        match self.recipe.client().delete(&self.sentinel_path()).await {
            Ok(()) => {
                info!("barrier {} drained", self.recipe.base_path());
                Ok(())
            }
            Err(e) if e.is_no_node() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub struct DoubleBarrierBuilder {
    client: Arc<dyn Client>,
    base_path: String,
    min_participants: usize,
}

impl DoubleBarrierBuilder {
    pub fn new(client: Arc<dyn Client>) -> DoubleBarrierBuilder {
        DoubleBarrierBuilder {
            client,
            base_path: "/".to_string(),
            min_participants: 1,
        }
    }

    pub fn base_path(mut self, path: impl Into<String>) -> DoubleBarrierBuilder {
        self.base_path = path.into();
        self
    }

    pub fn min_participants(mut self, n: usize) -> DoubleBarrierBuilder {
        self.min_participants = n;
        self
    }

    pub fn build(self) -> DoubleBarrier {
        DoubleBarrier {
            recipe: SequentialRecipe::new(self.client, self.base_path),
            min_participants: self.min_participants.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn barrier(store: &MemoryStore, n: usize) -> DoubleBarrier {
        DoubleBarrier::builder(store.connect())
            .base_path("/barriers/b")
            .min_participants(n)
            .build()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn enter_waits_for_quorum() {
        let store = MemoryStore::new();
        let mut first = barrier(&store, 3);
        let mut second = barrier(&store, 3);
        let mut third = barrier(&store, 3);

        let t1 = tokio::spawn(async move {
            let res = first.enter(None).await;
            res.map(|_| first)
        });
        let t2 = tokio::spawn(async move {
            let res = second.enter(None).await;
            res.map(|_| second)
        });
        settle().await;
        assert!(!t1.is_finished());
        assert!(!t2.is_finished());

        third.enter(Some(Duration::from_secs(1))).await.unwrap();
        let limit = Duration::from_secs(1);
        assert!(tokio::time::timeout(limit, t1).await.unwrap().unwrap().is_ok());
        assert!(tokio::time::timeout(limit, t2).await.unwrap().unwrap().is_ok());

        let admin = store.connect();
        assert!(admin.exists(&third.sentinel_path(), false).await.unwrap());
    }

    #[tokio::test]
    async fn late_joiner_passes_and_registers() {
        let store = MemoryStore::new();
        let mut a = barrier(&store, 1);
        let mut late = barrier(&store, 1);
        a.enter(None).await.unwrap();
        late.enter(Some(Duration::from_millis(200))).await.unwrap();

        let (owned, participants) = late.recipe.analyze_siblings().await.unwrap();
        assert_eq!(participants.len(), 2);
        assert_eq!(owned.get(WORKER_LABEL), Some(&1));
    }

    #[tokio::test]
    async fn enter_timeout_withdraws() {
        let store = MemoryStore::new();
        let admin = store.connect();
        let mut lonely = barrier(&store, 2);
        let res = lonely.enter(Some(Duration::from_millis(50))).await;
        assert_eq!(res, Err(Error::Timeout));
        assert!(admin.get_children("/barriers/b").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn leave_drains_everyone() {
        let store = MemoryStore::new();
        let mut tasks = vec![];
        for _ in 0..3 {
            let mut b = barrier(&store, 3);
            tasks.push(tokio::spawn(async move {
                let limit = Some(Duration::from_secs(5));
                b.enter(limit).await?;
                b.leave(limit).await
            }));
        }

        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let admin = store.connect();
        assert!(admin.get_children("/barriers/b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lowest_leaves_last() {
        let store = MemoryStore::new();
        let mut low = barrier(&store, 2);
        let mut high = barrier(&store, 2);
        let entering = tokio::spawn(async move {
            let res = low.enter(None).await;
            res.map(|_| low)
        });
        settle().await;
        high.enter(Some(Duration::from_secs(1))).await.unwrap();
        let mut low = entering.await.unwrap().unwrap();

        let leaving = tokio::spawn(async move { low.leave(None).await });
        settle().await;
        assert!(!leaving.is_finished());

        high.leave(Some(Duration::from_secs(1))).await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(1), leaving).await;
        assert_eq!(res.unwrap().unwrap(), Ok(()));

        let admin = store.connect();
        assert!(!admin.exists("/barriers/b/sentinel", false).await.unwrap());
    }

    #[tokio::test]
    async fn leave_without_entering_is_noop() {
        let store = MemoryStore::new();
        let mut b = barrier(&store, 2);
        b.leave(Some(Duration::from_millis(100))).await.unwrap();
    }

    #[tokio::test]
    async fn missing_sentinel_is_ignored() {
        let store = MemoryStore::new();
        let admin = store.connect();
        let mut b = barrier(&store, 1);
        b.enter(None).await.unwrap();
        admin.delete(&b.sentinel_path()).await.unwrap();
        b.leave(Some(Duration::from_millis(100))).await.unwrap();
        assert!(admin.get_children("/barriers/b").await.unwrap().is_empty());
    }

    /// Enters `n` barriers one after another so their ranks follow the
    /// returned order.
    async fn enter_in_order(
        store: &MemoryStore,
        clients: Vec<Arc<dyn Client>>,
    ) -> Vec<DoubleBarrier> {
        let n = clients.len();
        let mut tasks = vec![];
        for client in clients {
            let mut b = DoubleBarrier::builder(client)
                .base_path("/barriers/b")
                .min_participants(n)
                .build();
            tasks.push(tokio::spawn(async move {
                let res = b.enter(Some(Duration::from_secs(5))).await;
                res.map(|_| b)
            }));
            settle().await;
        }

        let mut entered = vec![];
        for t in tasks {
            entered.push(t.await.unwrap().unwrap());
        }

        let admin = SequentialRecipe::new(store.connect(), "/barriers/b");
        let (_, participants) = admin.analyze_siblings().await.unwrap();
        assert_eq!(participants.len(), n);
        entered
    }

    #[tokio::test]
    async fn lowest_node_is_removed_last() {
        let store = MemoryStore::new();
        let admin = store.connect();
        let clients: Vec<Arc<dyn Client>> = (0..3)
            .map(|_| store.connect() as Arc<dyn Client>)
            .collect();
        let mut entered = enter_in_order(&store, clients).await;
        let paths: Vec<String> = entered
            .iter()
            .map(|b| b.recipe.owned_path(WORKER_LABEL).unwrap().to_string())
            .collect();

        let mut c = entered.pop().unwrap();
        let mut b = entered.pop().unwrap();
        let mut a = entered.pop().unwrap();

        let la = tokio::spawn(async move { a.leave(None).await });
        settle().await;
        assert!(!la.is_finished());
        assert!(admin.exists(&paths[0], false).await.unwrap());

        let lb = tokio::spawn(async move { b.leave(None).await });
        settle().await;
        assert!(!la.is_finished());
        assert!(!lb.is_finished());
        assert!(!admin.exists(&paths[1], false).await.unwrap());
        assert!(admin.exists(&paths[0], false).await.unwrap());
        assert!(admin.exists(&paths[2], false).await.unwrap());

        c.leave(Some(Duration::from_secs(1))).await.unwrap();
        let limit = Duration::from_secs(1);
        assert_eq!(tokio::time::timeout(limit, la).await.unwrap().unwrap(), Ok(()));
        assert_eq!(tokio::time::timeout(limit, lb).await.unwrap().unwrap(), Ok(()));
        assert!(admin.get_children("/barriers/b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_completes_when_lowest_session_dies() {
        let store = MemoryStore::new();
        let admin = store.connect();
        let lowest = store.connect();
        let clients: Vec<Arc<dyn Client>> = vec![
            lowest.clone() as Arc<dyn Client>,
            store.connect(),
            store.connect(),
        ];
        let mut entered = enter_in_order(&store, clients).await;
        let mut c = entered.pop().unwrap();
        let mut b = entered.pop().unwrap();

        // Both higher-ranked participants withdraw and wait on the lowest.
        let lb = tokio::spawn(async move { b.leave(None).await });
        let lc = tokio::spawn(async move { c.leave(None).await });
        settle().await;
        assert!(!lb.is_finished());
        assert!(!lc.is_finished());

        lowest.expire();
        let limit = Duration::from_secs(1);
        assert_eq!(tokio::time::timeout(limit, lb).await.unwrap().unwrap(), Ok(()));
        assert_eq!(tokio::time::timeout(limit, lc).await.unwrap().unwrap(), Ok(()));
        assert!(admin.get_children("/barriers/b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_worker_is_replaced_on_retry() {
        let store = MemoryStore::new();
        let admin = store.connect();
        let bc = store.connect();
        let mut flaky = DoubleBarrier::builder(bc.clone())
            .base_path("/barriers/b")
            .min_participants(2)
            .build();

        let entering = tokio::spawn(async move {
            let res = flaky.enter(Some(Duration::from_millis(100))).await;
            (flaky, res)
        });
        settle().await;

        // The timeout fires while the connection is down, so the withdrawal fails.
        bc.suspend();
        let (mut flaky, res) = entering.await.unwrap();
        assert_eq!(res, Err(Error::Timeout));
        assert_eq!(admin.get_children("/barriers/b").await.unwrap().len(), 1);

        bc.resume();
        let mut other = barrier(&store, 2);
        let retry =
            tokio::spawn(async move { flaky.enter(Some(Duration::from_secs(1))).await });
        settle().await;
        assert!(!retry.is_finished());

        other.enter(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(retry.await.unwrap(), Ok(()));
        let children = admin.get_children("/barriers/b").await.unwrap();
        assert_eq!(children.iter().filter(|c| c.starts_with("worker-")).count(), 2);
    }
}
