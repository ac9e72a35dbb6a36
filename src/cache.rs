//! Ownership and eviction of concrete coefficients.
//!
//! Managed terminals hand their storage concerns to a [`TerminalHost`]: a
//! loader that re-materialises an evicted value, an optional saver invoked
//! before the in-memory bytes are freed, a discard hook fired when the
//! terminal dies, and the memory accounting callback that drives eviction.
//!
//! All hosts sharing one byte budget share a [`TerminalQueue`]: a
//! least-recently-used list of terminals whose values currently sit in
//! memory unpinned. The queue stores hints, not truth -- entries go stale
//! when a value is pinned or evicted through another path -- and
//! [`TerminalQueue::pop`] skips anything that is no longer evictable.

use crate::coefficient::Coefficient;
use crate::operand::Terminal;
use anyhow::Result;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

/// Opaque per-terminal identifier interpreted by its host.
pub type HostId = Box<dyn Any + Send + Sync>;

/// Backing storage for the values of managed terminals.
pub trait TerminalHost: Send + Sync {
    /// Re-materialise the coefficient named by `id`.
    fn load(&self, id: &HostId) -> Result<Coefficient>;

    /// Persist `value` before its in-memory bytes are freed. The default
    /// discards: the value must then be recoverable through [`Self::load`]
    /// alone.
    fn save(&self, _id: &HostId, _value: &Coefficient) -> Result<()> {
        Ok(())
    }

    /// The identifier is retired; delete any record held for it.
    fn discard(&self, _id: &HostId) {}

    /// Account `bytes` entering (`freed == false`) or leaving memory.
    fn memory_change(&self, bytes: usize, freed: bool);

    /// The eviction queue this host shares with its siblings.
    fn queue(&self) -> &Arc<TerminalQueue>;
}

/// LRU queue of unpinned, in-memory, managed terminals.
pub struct TerminalQueue {
    entries: Mutex<VecDeque<Weak<Terminal>>>,
}

impl TerminalQueue {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(VecDeque::new()),
        })
    }

    /// Note `terminal` as most recently used.
    pub(crate) fn push(&self, terminal: &Arc<Terminal>) {
        self.entries
            .lock()
            .expect("queue lock")
            .push_back(Arc::downgrade(terminal));
    }

    /// Drop every entry for `terminal`; pinning removes it from eviction.
    pub(crate) fn remove(&self, terminal: &Arc<Terminal>) {
        let target = Arc::as_ptr(terminal);
        self.entries
            .lock()
            .expect("queue lock")
            .retain(|weak| weak.as_ptr() != target);
    }

    /// Evict the least recently used evictable terminal. Returns false when
    /// nothing could be evicted.
    pub fn pop(&self) -> bool {
        loop {
            let candidate = self.entries.lock().expect("queue lock").pop_front();
            let Some(weak) = candidate else {
                return false;
            };
            if let Some(terminal) = weak.upgrade()
                && terminal.evict()
            {
                return true;
            }
        }
    }

    /// Number of queued hints (stale entries included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("queue lock").is_empty()
    }
}
