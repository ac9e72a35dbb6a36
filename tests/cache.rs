use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use symsolve::{
    Coefficient, HostBinding, HostId, MemStore, Store, Terminal, TerminalHost, TerminalQueue,
};

/// Host with a byte budget over a `MemStore`, keyed by `u64` identifiers.
struct BudgetHost {
    queue: Arc<TerminalQueue>,
    store: MemStore,
    usage: AtomicUsize,
    limit: usize,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

impl BudgetHost {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: TerminalQueue::new(),
            store: MemStore::new(),
            usage: AtomicUsize::new(0),
            limit,
            loads: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
        })
    }

    fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }
}

impl TerminalHost for BudgetHost {
    fn load(&self, id: &HostId) -> Result<Coefficient> {
        let uid = id.downcast_ref::<u64>().expect("u64 id");
        self.loads.fetch_add(1, Ordering::Relaxed);
        let bytes = self
            .store
            .get(&uid.to_le_bytes())?
            .context("coefficient was never saved")?;
        Ok(Coefficient::from_bytes(&bytes))
    }

    fn save(&self, id: &HostId, value: &Coefficient) -> Result<()> {
        let uid = id.downcast_ref::<u64>().expect("u64 id");
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.store.set(&uid.to_le_bytes(), value.as_bytes())
    }

    fn memory_change(&self, bytes: usize, freed: bool) {
        if freed {
            self.usage.fetch_sub(bytes, Ordering::Relaxed);
            return;
        }
        self.usage.fetch_add(bytes, Ordering::Relaxed);
        while self.usage.load(Ordering::Relaxed) > self.limit {
            if !self.queue.pop() {
                break;
            }
        }
    }

    fn queue(&self) -> &Arc<TerminalQueue> {
        &self.queue
    }
}

fn managed(host: &Arc<BudgetHost>, uid: u64, text: &str) -> Arc<Terminal> {
    let terminal = Terminal::managed(HostBinding::new(host.clone(), uid));
    terminal.load(Coefficient::from(text));
    terminal
}

#[test]
fn eviction_round_trips_through_the_store() -> Result<()> {
    let host = BudgetHost::new(16);

    // Three 8-byte coefficients against a 16-byte budget.
    let c1 = managed(&host, 1, "11111111");
    let c2 = managed(&host, 2, "22222222");
    let c3 = managed(&host, 3, "33333333");

    // Loading the third pushed the least recently used one out.
    assert_eq!(host.usage(), 16);
    assert_eq!(host.saves.load(Ordering::Relaxed), 1);

    // Re-materialising returns the exact original bytes.
    let reloaded = c1.acquire()?;
    assert_eq!(reloaded.as_bytes(), b"11111111");
    assert_eq!(host.loads.load(Ordering::Relaxed), 1);

    drop(reloaded);
    drop((c1, c2, c3));
    Ok(())
}

#[test]
fn usage_stays_at_or_below_the_limit_when_unpinned() -> Result<()> {
    let host = BudgetHost::new(24);

    let mut terminals = Vec::new();
    for uid in 0..12u64 {
        terminals.push(managed(&host, uid, "xxxxxxxx"));
    }

    assert!(host.usage() <= 24, "usage {} over budget", host.usage());

    // Everything is still reachable.
    for terminal in &terminals {
        assert_eq!(terminal.acquire()?.as_bytes(), b"xxxxxxxx");
    }
    Ok(())
}

#[test]
fn pinned_values_are_not_evicted() -> Result<()> {
    let host = BudgetHost::new(16);

    let c1 = managed(&host, 1, "aaaaaaaa");
    let c2 = managed(&host, 2, "bbbbbbbb");
    let pinned = c2.acquire()?;

    let _c3 = managed(&host, 3, "cccccccc");
    let _c4 = managed(&host, 4, "dddddddd");

    // The pin kept c2 resident through the evictions.
    assert_eq!(pinned.as_bytes(), b"bbbbbbbb");
    assert_eq!(
        host.store.get(&2u64.to_le_bytes())?,
        None,
        "pinned value must not be saved away"
    );
    assert!(host.store.get(&1u64.to_le_bytes())?.is_some());

    drop(pinned);
    drop((c1, c2));
    Ok(())
}

#[test]
fn release_reinserts_at_the_mru_end() -> Result<()> {
    let host = BudgetHost::new(32);

    let c1 = managed(&host, 1, "aaaaaaaa");
    let c2 = managed(&host, 2, "bbbbbbbb");
    let c3 = managed(&host, 3, "cccccccc");
    let c4 = managed(&host, 4, "dddddddd");
    assert_eq!(host.usage(), 32);

    // Touch c1: it moves to the MRU end, so the next eviction takes c2.
    drop(c1.acquire()?);
    let _c5 = managed(&host, 5, "eeeeeeee");

    assert!(host.store.get(&2u64.to_le_bytes())?.is_some());
    assert_eq!(host.store.get(&1u64.to_le_bytes())?, None);

    drop((c1, c2, c3, c4));
    Ok(())
}

#[test]
fn memory_returns_to_zero_when_terminals_die() {
    let host = BudgetHost::new(1);

    {
        let _c1 = managed(&host, 1, "aaaaaaaa");
        let _c2 = managed(&host, 2, "bbbbbbbb");
        assert!(host.usage() > 0);
    }

    assert_eq!(host.usage(), 0);
}
