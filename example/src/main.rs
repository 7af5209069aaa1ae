use exp_backoff::BackoffBuilder;
use log::*;
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use zk_recipes::*;

async fn contend(
    store: MemoryStore,
    id: usize,
    rounds: usize,
    hold_ms: u64,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut lock = Lock::builder(store.connect())
        .base_path("/demo/lock")
        .build();

    // Random hold times between half and the full configured hold.
    let min = hold_ms / 2;
    let pauses: Vec<u64> = {
        let mut bo = BackoffBuilder::new().initial_ns(min).max_ns(hold_ms).build();
        (0..rounds).map(|_| bo.pause().clamp(min, hold_ms)).collect()
    };

    for (round, pause) in pauses.into_iter().enumerate() {
        if stop.load(Ordering::Acquire) {
            break;
        }

        let mut guard = lock.acquire(Some(Duration::from_secs(30))).await?;
        info!("[{id}] round {round}: holding {} for {pause}ms", guard.path());
        tokio::time::sleep(Duration::from_millis(pause)).await;
        guard.release().await?;
    }

    Ok(())
}

async fn rendezvous(store: MemoryStore, id: usize, quorum: usize) -> anyhow::Result<()> {
    let mut barrier = DoubleBarrier::builder(store.connect())
        .base_path("/demo/barrier")
        .min_participants(quorum)
        .build();

    barrier.enter(Some(Duration::from_secs(30))).await?;
    info!("[{id}] entered barrier");
    barrier.leave(Some(Duration::from_secs(30))).await?;
    info!("[{id}] left barrier");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let workers: usize = args.get(1).map(|v| v.parse()).transpose()?.unwrap_or(3);
    let rounds: usize = args.get(2).map(|v| v.parse()).transpose()?.unwrap_or(5);
    let hold_ms: u64 = args.get(3).map(|v| v.parse()).transpose()?.unwrap_or(200);
    info!("workers={workers}, rounds={rounds}, hold={hold_ms}ms");

    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    ctrlc::set_handler(move || {
        info!("interrupted, finishing current round");
        s.store(true, Ordering::Release);
    })?;

    let store = MemoryStore::new();
    let mut tasks = vec![];
    for id in 0..workers {
        let store = store.clone();
        let stop = stop.clone();
        tasks.push(tokio::spawn(contend(store, id, rounds, hold_ms, stop)));
    }

    for t in tasks {
        t.await??;
    }

    if stop.load(Ordering::Acquire) {
        return Ok(());
    }

    let mut tasks = vec![];
    for id in 0..workers {
        tasks.push(tokio::spawn(rendezvous(store.clone(), id, workers)));
    }

    for t in tasks {
        t.await??;
    }

    Ok(())
}
