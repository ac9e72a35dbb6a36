//! The evaluator worker pool.
//!
//! An [`Aef`] owns a FIFO queue of ready terminals and a set of worker
//! threads, each wrapping one [`Evaluate`] instance (one algebra helper
//! subprocess per worker in production). Workers block on a condition
//! variable until a terminal is ready or the pool is told to stop; stopping
//! never dispatches new work, joins every worker, and leaves outstanding
//! pending terminals untouched.

use crate::evaluator::Evaluate;
use crate::metrics::RunStats;
use crate::operand::{Terminal, render_expression};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error};

struct PoolShared {
    ready: VecDeque<Arc<Terminal>>,
    stop: bool,
}

/// Worker pool dispatching primitive operations to algebra helpers.
pub struct Aef {
    shared: Mutex<PoolShared>,
    work: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<RunStats>,
}

impl Aef {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(PoolShared {
                ready: VecDeque::new(),
                stop: false,
            }),
            work: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            stats: Arc::new(RunStats::new()),
        })
    }

    #[must_use]
    pub fn stats(&self) -> Arc<RunStats> {
        self.stats.clone()
    }

    /// Spawn one worker owning `evaluator`.
    ///
    /// # Errors
    ///
    /// Thread spawn failure is reported to the caller; per the error model
    /// it is not survivable and callers bail out.
    pub fn spawn(self: &Arc<Self>, evaluator: Box<dyn Evaluate>) -> Result<()> {
        let pool = self.clone();
        let handle = std::thread::Builder::new()
            .name("aef-worker".into())
            .spawn(move || worker(&pool, evaluator))
            .context("failed to spawn evaluator worker")?;
        self.workers.lock().expect("worker list lock").push(handle);
        Ok(())
    }

    /// Spawn `n` workers from an evaluator factory.
    pub fn spawn_n(
        self: &Arc<Self>,
        n: usize,
        factory: impl Fn() -> Result<Box<dyn Evaluate>>,
    ) -> Result<()> {
        for _ in 0..n {
            self.spawn(factory()?)?;
        }
        Ok(())
    }

    /// Stop dispatching, wake every worker and join them. In-flight
    /// evaluations finish; queued terminals stay pending.
    pub fn shutdown(&self) {
        {
            let mut shared = self.shared.lock().expect("pool lock");
            shared.stop = true;
        }
        self.work.notify_all();

        let handles: Vec<_> = self
            .workers
            .lock()
            .expect("worker list lock")
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("evaluator worker panicked");
            }
        }
        debug!("evaluator pool drained");
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.lock().expect("pool lock").stop
    }

    pub(crate) fn push_ready(&self, terminal: Arc<Terminal>) {
        let mut shared = self.shared.lock().expect("pool lock");
        shared.ready.push_back(terminal);
        drop(shared);
        self.work.notify_one();
    }
}

fn worker(pool: &Arc<Aef>, mut evaluator: Box<dyn Evaluate>) {
    loop {
        let target = {
            let mut shared = pool.shared.lock().expect("pool lock");
            loop {
                if shared.stop {
                    return;
                }
                if let Some(t) = shared.ready.pop_front() {
                    break t;
                }
                shared = pool.work.wait(shared).expect("pool lock");
            }
        };

        let (op, children) = target.pending_parts();
        let outcome =
            render_expression(op, &children).and_then(|text| evaluator.evaluate(&text));

        match outcome {
            Ok(value) => {
                pool.stats.count_evaluation();
                target.complete(value);
            }
            Err(err) => {
                // No recovery semantics: a dead helper poisons every result
                // downstream of it.
                error!("algebra helper failed: {err:#}");
                std::process::abort();
            }
        }
    }
}

/// Wakeup channel between completing terminals and a [`TerminalGroup`].
///
/// [`TerminalGroup`]: crate::operand::TerminalGroup
pub(crate) struct GroupShared {
    events: Mutex<u64>,
    wake: Condvar,
}

impl GroupShared {
    pub(crate) fn new() -> Self {
        Self {
            events: Mutex::new(0),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut events = self.events.lock().expect("group lock");
        *events += 1;
        drop(events);
        self.wake.notify_all();
    }

    pub(crate) fn wait_until(&self, ready: impl Fn() -> bool) {
        let mut events = self.events.lock().expect("group lock");
        while !ready() {
            events = self.wake.wait(events).expect("group lock");
        }
    }
}
