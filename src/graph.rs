//! The pivot graph.
//!
//! Each materialised component owns a list of outgoing edges whose
//! coefficients are operand handles into the evaluator DAG; every edge also
//! carries a numeric mirror operand evaluated on a separate pool against a
//! fully bound helper, the cheap non-zero probe policies race before paying
//! full symbolic cost. The graph contributes the three row primitives
//! policies drive -- [`PivotGraph::relay`], [`PivotGraph::collect`],
//! [`PivotGraph::normalize`] -- plus pinned read-back via
//! [`PivotGraph::acquire`].
//!
//! Coefficient memory is bounded: concrete values live under two
//! [`TerminalHost`]s sharing one LRU queue and one byte budget. Initial
//! row coefficients reload from the row source; intermediate results are
//! spilled to a key/value store under graph-minted UIDs and deleted again
//! when their operands die.

use crate::aef::Aef;
use crate::cache::{HostId, TerminalHost, TerminalQueue};
use crate::coefficient::Coefficient;
use crate::expression::Metadata;
use crate::integral::Component;
use crate::metrics::RunStats;
use crate::operand::{
    HostBinding, Operand, Operation, Terminal, TerminalRef, link, terminate,
};
use crate::store::Store;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// One row keyed by dense components: `tail = Σ coeffₖ · headₖ`.
#[derive(Clone, Debug, Default)]
pub struct Reflist {
    pub terms: Vec<RowTerm>,
}

/// One `coefficient · head` reference of a row.
#[derive(Clone, Debug)]
pub struct RowTerm {
    pub head: Component,
    pub coefficient: Coefficient,
}

impl Reflist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, head: Component, coefficient: Coefficient) {
        self.terms.push(RowTerm { head, coefficient });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Where rows come from and where solved rows go.
///
/// Loading `None` (or an empty row) marks the component as a master: it has
/// no equation and is never eliminated.
pub trait RowSource: Send + Sync {
    fn load(&self, component: Component) -> Result<Option<(Reflist, Metadata)>>;
    fn save(&self, component: Component, row: &Reflist, meta: Metadata) -> Result<()>;
}

struct Edge {
    head: Component,
    coefficient: Operand,
    numeric: Operand,
}

struct Pivot {
    meta: Metadata,
    edges: Vec<Edge>,
}

/// UID space for spillable intermediate coefficients.
///
/// IDs are allocated from the low half until it is exhausted, then from the
/// high half; the counter may wrap once the opposite half holds no live
/// IDs. Violations are structural corruption and abort.
struct UidSpace {
    current: Mutex<u64>,
    low_live: AtomicU64,
    high_live: AtomicU64,
}

const UID_LOW_MAX: u64 = u64::MAX >> 1;

impl UidSpace {
    fn new() -> Self {
        Self {
            current: Mutex::new(0),
            low_live: AtomicU64::new(0),
            high_live: AtomicU64::new(0),
        }
    }

    fn allocate(&self) -> u64 {
        let mut current = self.current.lock().expect("uid lock");

        if *current == u64::MAX {
            assert_eq!(
                self.low_live.load(Ordering::Relaxed),
                0,
                "uid space exhausted: low half still live at wrap"
            );
            *current = 0;
        }
        if *current == UID_LOW_MAX {
            assert_eq!(
                self.high_live.load(Ordering::Relaxed),
                0,
                "uid space exhausted: high half still live"
            );
        }

        let id = *current;
        if id <= UID_LOW_MAX {
            self.low_live.fetch_add(1, Ordering::Relaxed);
        } else {
            self.high_live.fetch_add(1, Ordering::Relaxed);
        }
        *current += 1;
        id
    }

    fn release(&self, uid: u64) {
        if uid <= UID_LOW_MAX {
            self.low_live.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.high_live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Shared byte budget. Growth past the limit pops the LRU queue until the
/// budget holds again or nothing evictable remains.
struct MemoryGovernor {
    usage: AtomicUsize,
    limit: usize,
    queue: Arc<TerminalQueue>,
    stats: Arc<RunStats>,
    starved: AtomicBool,
}

impl MemoryGovernor {
    fn change(&self, bytes: usize, freed: bool) {
        if freed {
            self.usage.fetch_sub(bytes, Ordering::Relaxed);
            return;
        }

        self.usage.fetch_add(bytes, Ordering::Relaxed);
        if self.limit == 0 {
            return;
        }

        while self.usage.load(Ordering::Relaxed) > self.limit {
            if self.queue.pop() {
                self.stats.count_eviction();
                self.starved.store(false, Ordering::Relaxed);
            } else {
                if !self.starved.swap(true, Ordering::Relaxed) {
                    warn!("could not reduce coefficient memory below the limit");
                }
                break;
            }
        }
    }

    fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }
}

/// Identifier of an initial row coefficient: edge `tail -> head` as loaded.
struct RowKey {
    tail: Component,
    head: Component,
}

/// Host of initial coefficients. No saver: the value is recovered by
/// re-reading the source row.
struct InitialCoeffHost {
    gov: Arc<MemoryGovernor>,
    source: Arc<dyn RowSource>,
    io_lock: Mutex<()>,
}

impl TerminalHost for InitialCoeffHost {
    fn load(&self, id: &HostId) -> Result<Coefficient> {
        let key = id.downcast_ref::<RowKey>().expect("initial host id");
        let _io = self.io_lock.lock().expect("host lock");

        let (row, _meta) = self
            .source
            .load(key.tail)?
            .with_context(|| format!("row {} vanished from the source", key.tail))?;
        let coefficient = row
            .terms
            .into_iter()
            .find(|term| term.head == key.head)
            .map(|term| term.coefficient)
            .with_context(|| format!("edge {} -> {} vanished from the source", key.tail, key.head))?;

        self.gov.stats.count_reload();
        Ok(coefficient)
    }

    fn memory_change(&self, bytes: usize, freed: bool) {
        self.gov.change(bytes, freed);
    }

    fn queue(&self) -> &Arc<TerminalQueue> {
        &self.gov.queue
    }
}

/// Identifier of a spillable intermediate coefficient.
struct SpillId {
    uid: u64,
    saved: AtomicBool,
}

impl SpillId {
    fn key(&self) -> [u8; 8] {
        self.uid.to_le_bytes()
    }
}

/// Host of intermediate results: evicted values round-trip through the
/// spill store, and only records actually written get deleted on discard.
struct SpillHost {
    gov: Arc<MemoryGovernor>,
    store: Arc<dyn Store>,
    uids: Arc<UidSpace>,
    io_lock: Mutex<()>,
}

impl TerminalHost for SpillHost {
    fn load(&self, id: &HostId) -> Result<Coefficient> {
        let id = id.downcast_ref::<SpillId>().expect("spill host id");
        let _io = self.io_lock.lock().expect("host lock");

        let value = self
            .store
            .get(&id.key())?
            .with_context(|| format!("spilled coefficient {} missing from the store", id.uid))?;

        self.gov.stats.count_reload();
        Ok(Coefficient::from_bytes(&value))
    }

    fn save(&self, id: &HostId, value: &Coefficient) -> Result<()> {
        let id = id.downcast_ref::<SpillId>().expect("spill host id");
        if !id.saved.swap(true, Ordering::AcqRel) {
            let _io = self.io_lock.lock().expect("host lock");
            self.store.set(&id.key(), value.as_bytes())?;
            self.gov.stats.count_spill();
        }
        Ok(())
    }

    fn discard(&self, id: &HostId) {
        let id = id.downcast_ref::<SpillId>().expect("spill host id");
        if id.saved.load(Ordering::Acquire)
            && let Err(err) = self.store.delete(&id.key())
        {
            warn!("could not drop spilled coefficient {}: {err:#}", id.uid);
        }
        self.uids.release(id.uid);
    }

    fn memory_change(&self, bytes: usize, freed: bool) {
        self.gov.change(bytes, freed);
    }

    fn queue(&self) -> &Arc<TerminalQueue> {
        &self.gov.queue
    }
}

struct GraphMemory {
    gov: Arc<MemoryGovernor>,
    uids: Arc<UidSpace>,
    initial_host: Arc<InitialCoeffHost>,
    spill_host: Arc<SpillHost>,
}

/// The pivot graph. See the module documentation.
pub struct PivotGraph {
    components: Vec<Option<Pivot>>,
    prealloc: usize,
    source: Arc<dyn RowSource>,
    aef: Arc<Aef>,
    aef_numeric: Arc<Aef>,
    memory: GraphMemory,
    one: Arc<Terminal>,
    stats: Arc<RunStats>,
}

fn spill_binder(
    host: Arc<SpillHost>,
    uids: Arc<UidSpace>,
) -> impl FnOnce() -> Option<HostBinding> {
    move || {
        Some(HostBinding::new(
            host,
            SpillId {
                uid: uids.allocate(),
                saved: AtomicBool::new(false),
            },
        ))
    }
}

fn two_pivots(
    components: &mut [Option<Pivot>],
    a: Component,
    b: Component,
) -> Option<(&mut Pivot, &mut Pivot)> {
    let (a, b) = (a as usize, b as usize);
    debug_assert_ne!(a, b, "a pivot cannot be relayed into itself");

    if a < b {
        let (lo, hi) = components.split_at_mut(b);
        Some((lo[a].as_mut()?, hi[0].as_mut()?))
    } else {
        let (lo, hi) = components.split_at_mut(a);
        let first = hi[0].as_mut()?;
        let second = lo[b].as_mut()?;
        Some((first, second))
    }
}

impl PivotGraph {
    #[must_use]
    pub fn new(
        aef: Arc<Aef>,
        aef_numeric: Arc<Aef>,
        source: Arc<dyn RowSource>,
        spill_store: Arc<dyn Store>,
        memory_limit: usize,
        prealloc: usize,
    ) -> Self {
        let stats = Arc::new(RunStats::new());
        let queue = TerminalQueue::new();
        let gov = Arc::new(MemoryGovernor {
            usage: AtomicUsize::new(0),
            limit: memory_limit,
            queue,
            stats: stats.clone(),
            starved: AtomicBool::new(false),
        });
        let uids = Arc::new(UidSpace::new());

        let memory = GraphMemory {
            initial_host: Arc::new(InitialCoeffHost {
                gov: gov.clone(),
                source: source.clone(),
                io_lock: Mutex::new(()),
            }),
            spill_host: Arc::new(SpillHost {
                gov: gov.clone(),
                store: spill_store,
                uids: uids.clone(),
                io_lock: Mutex::new(()),
            }),
            gov,
            uids,
        };

        Self {
            components: Vec::with_capacity(prealloc),
            prealloc,
            source,
            aef,
            aef_numeric,
            memory,
            one: Terminal::from_coefficient(Coefficient::from("1")),
            stats,
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<RunStats> {
        self.stats.clone()
    }

    /// Bytes of concrete coefficient storage currently in memory.
    #[must_use]
    pub fn memory_in_use(&self) -> usize {
        self.memory.gov.usage()
    }

    fn assert_coverage(&mut self, i: Component) {
        let i = i as usize;
        if self.components.len() > i {
            return;
        }
        if i >= self.prealloc {
            warn!("preallocated space did not suffice for {} pivots", i + 1);
        }
        self.components.resize_with(i + 1, || None);
    }

    fn ensure_loaded(&mut self, i: Component) -> Result<bool> {
        self.assert_coverage(i);
        if self.components[i as usize].is_some() {
            return Ok(true);
        }

        let Some((row, meta)) = self.source.load(i)? else {
            return Ok(false);
        };
        if row.is_empty() {
            return Ok(false);
        }

        let mut edges = Vec::with_capacity(row.len());
        for term in row.terms {
            let binding = HostBinding::new(
                self.memory.initial_host.clone(),
                RowKey {
                    tail: i,
                    head: term.head,
                },
            );
            let coeff = Terminal::managed(binding);
            coeff.load(term.coefficient);

            // The numeric mirror starts out as the same operand; the two
            // sides diverge at the first relay or terminate.
            edges.push(Edge {
                head: term.head,
                coefficient: Operand::Terminal(coeff.clone()),
                numeric: Operand::Terminal(coeff),
            });
        }

        self.components[i as usize] = Some(Pivot { meta, edges });
        Ok(true)
    }

    /// Materialise pivot `i` on demand; `None` when the source has no row
    /// for it (the component is a master).
    pub fn meta(&mut self, i: Component) -> Result<Option<&mut Metadata>> {
        if !self.ensure_loaded(i)? {
            return Ok(None);
        }
        Ok(self.components[i as usize].as_mut().map(|p| &mut p.meta))
    }

    fn pivot(&self, i: Component) -> &Pivot {
        self.components[i as usize]
            .as_ref()
            .expect("pivot not materialised")
    }

    fn pivot_mut(&mut self, i: Component) -> &mut Pivot {
        self.components[i as usize]
            .as_mut()
            .expect("pivot not materialised")
    }

    #[must_use]
    pub fn n_refs(&self, i: Component) -> usize {
        self.pivot(i).edges.len()
    }

    #[must_use]
    pub fn head_nth(&self, i: Component, n: usize) -> Component {
        self.pivot(i).edges[n].head
    }

    /// Raw (possibly unbaked) operand handle of the n-th edge.
    #[must_use]
    pub fn operand_nth(&self, i: Component, n: usize, numeric: bool) -> Operand {
        let edge = &self.pivot(i).edges[n];
        if numeric {
            edge.numeric.clone()
        } else {
            edge.coefficient.clone()
        }
    }

    /// Force the n-th edge's coefficient onto its evaluator pool.
    pub fn terminate_nth(&mut self, i: Component, n: usize, numeric: bool) -> Arc<Terminal> {
        if numeric {
            let aef = self.aef_numeric.clone();
            let edge = &mut self.pivot_mut(i).edges[n];
            let t = terminate(edge.numeric.clone(), &aef, || None, true);
            edge.numeric = Operand::Terminal(t.clone());
            t
        } else {
            let aef = self.aef.clone();
            let binder = spill_binder(self.memory.spill_host.clone(), self.memory.uids.clone());
            let edge = &mut self.pivot_mut(i).edges[n];
            let t = terminate(edge.coefficient.clone(), &aef, binder, false);
            edge.coefficient = Operand::Terminal(t.clone());
            t
        }
    }

    /// Swap-remove the n-th edge, dropping its operands.
    pub fn delete_nth(&mut self, i: Component, n: usize) {
        self.pivot_mut(i).edges.swap_remove(n);
    }

    /// Substitute the normalised pivot `head` into `tail`'s row.
    ///
    /// The coefficient of the edge `tail -> head` is baked (it multiplies
    /// every substituted term and must be evaluated once); the head's edge
    /// coefficients are terminated (they are read again later). The product
    /// coefficients on the new edges stay unbaked, and parallel edges are
    /// left for a following [`PivotGraph::collect`].
    ///
    /// Returns whether a matching edge existed.
    pub fn relay(&mut self, tail: Component, head: Component) -> bool {
        let aef = self.aef.clone();
        let aef_numeric = self.aef_numeric.clone();
        let spill_host = self.memory.spill_host.clone();
        let uids = self.memory.uids.clone();

        let Some((tail_pivot, head_pivot)) = two_pivots(&mut self.components, tail, head) else {
            return false;
        };
        let Some(at) = tail_pivot.edges.iter().position(|e| e.head == head) else {
            return false;
        };

        let edge = tail_pivot.edges.swap_remove(at);
        let base = terminate(
            edge.coefficient,
            &aef,
            spill_binder(spill_host.clone(), uids.clone()),
            false,
        );
        let base_numeric = terminate(edge.numeric, &aef_numeric, || None, true);

        // Minus the removed tail->head edge and the skipped head->head one.
        tail_pivot
            .edges
            .reserve(head_pivot.edges.len().saturating_sub(1));

        for limb in &mut head_pivot.edges {
            if limb.head == head {
                continue;
            }

            let limb_coeff = terminate(
                limb.coefficient.clone(),
                &aef,
                spill_binder(spill_host.clone(), uids.clone()),
                false,
            );
            limb.coefficient = Operand::Terminal(limb_coeff.clone());
            let product = link(
                Operation::Mul,
                vec![Operand::Terminal(limb_coeff), Operand::Terminal(base.clone())],
            );

            let limb_numeric = terminate(limb.numeric.clone(), &aef_numeric, || None, true);
            limb.numeric = Operand::Terminal(limb_numeric.clone());
            let product_numeric = link(
                Operation::Mul,
                vec![
                    Operand::Terminal(limb_numeric),
                    Operand::Terminal(base_numeric.clone()),
                ],
            );

            tail_pivot.edges.push(Edge {
                head: limb.head,
                coefficient: Operand::Intermediate(product),
                numeric: Operand::Intermediate(product_numeric),
            });
        }

        true
    }

    /// Fold all edges `tail -> head` into the first of them, replacing its
    /// coefficient with the n-ary sum of all of them.
    pub fn collect(&mut self, tail: Component, head: Component) {
        let pivot = self.pivot_mut(tail);

        let mut first: Option<usize> = None;
        let mut coefficients = Vec::new();
        let mut numerics = Vec::new();

        let mut j = 0;
        while j < pivot.edges.len() {
            if pivot.edges[j].head != head {
                j += 1;
                continue;
            }
            if first.is_none() {
                first = Some(j);
                coefficients.push(pivot.edges[j].coefficient.clone());
                numerics.push(pivot.edges[j].numeric.clone());
                j += 1;
            } else {
                let edge = pivot.edges.swap_remove(j);
                coefficients.push(edge.coefficient);
                numerics.push(edge.numeric);
            }
        }

        if coefficients.len() > 1 {
            let at = first.expect("duplicates imply a first edge");
            pivot.edges[at].coefficient = Operand::Intermediate(link(Operation::Add, coefficients));
            pivot.edges[at].numeric = Operand::Intermediate(link(Operation::Add, numerics));
        }
    }

    /// Collect every head of `tail`'s row.
    pub fn collect_all(&mut self, tail: Component) {
        let mut heads: Vec<Component> =
            self.pivot(tail).edges.iter().map(|e| e.head).collect();
        heads.sort_unstable();
        heads.dedup();
        for head in heads {
            self.collect(tail, head);
        }
    }

    /// Divide the row by minus its self-coefficient, leaving the self-edge
    /// at the constant `1`: the row takes the form `-target + Σ … = 0`.
    ///
    /// Assumes self-edges were collected. A single-edge row is left alone:
    /// the lone coefficient is irrelevant and is never evaluated.
    pub fn normalize(&mut self, target: Component) {
        let aef = self.aef.clone();
        let aef_numeric = self.aef_numeric.clone();
        let spill_host = self.memory.spill_host.clone();
        let uids = self.memory.uids.clone();
        let one = self.one.clone();

        let pivot = self.pivot_mut(target);
        if pivot.edges.len() == 1 {
            return;
        }
        let Some(at) = pivot.edges.iter().position(|e| e.head == target) else {
            return;
        };

        let binding = spill_binder(spill_host, uids)();
        let divisor = Terminal::bake(
            Operation::Sub,
            &[pivot.edges[at].coefficient.clone()],
            &aef,
            binding,
            false,
        );
        let divisor_numeric = Terminal::bake(
            Operation::Sub,
            &[pivot.edges[at].numeric.clone()],
            &aef_numeric,
            None,
            true,
        );

        for edge in &mut pivot.edges {
            if edge.head == target {
                edge.coefficient = Operand::Terminal(one.clone());
                edge.numeric = Operand::Terminal(one.clone());
            } else {
                let quotient = link(
                    Operation::Div,
                    vec![edge.coefficient.clone(), Operand::Terminal(divisor.clone())],
                );
                edge.coefficient = Operand::Intermediate(quotient);

                let quotient_numeric = link(
                    Operation::Div,
                    vec![
                        edge.numeric.clone(),
                        Operand::Terminal(divisor_numeric.clone()),
                    ],
                );
                edge.numeric = Operand::Intermediate(quotient_numeric);
            }
        }
    }

    /// Force every edge of `i` onto the evaluators.
    pub fn terminate_all(&mut self, i: Component) {
        if self
            .components
            .get(i as usize)
            .is_none_or(|slot| slot.is_none())
        {
            return;
        }
        for n in 0..self.n_refs(i) {
            self.terminate_nth(i, n, false);
            self.terminate_nth(i, n, true);
        }
    }

    /// Force-terminate and wait every edge, drop zero-valued edges, and
    /// return the row pinned in memory. Pins are released when the returned
    /// guard drops.
    pub fn acquire(&mut self, i: Component) -> Result<RowGuard> {
        self.terminate_all(i);

        if self
            .components
            .get(i as usize)
            .is_none_or(|slot| slot.is_none())
        {
            return Ok(RowGuard { terms: Vec::new() });
        }

        let pivot = self.pivot_mut(i);
        let mut terms = Vec::with_capacity(pivot.edges.len());

        let mut j = 0;
        while j < pivot.edges.len() {
            let coeff = pivot.edges[j]
                .coefficient
                .as_terminal()
                .expect("edge was terminated")
                .clone();
            coeff.wait();
            if let Some(numeric) = pivot.edges[j].numeric.as_terminal() {
                numeric.wait();
            }

            let value = coeff.acquire()?;
            if value.is_zero() {
                drop(value);
                pivot.edges.swap_remove(j);
            } else {
                terms.push((pivot.edges[j].head, value));
                j += 1;
            }
        }

        Ok(RowGuard { terms })
    }

    /// Persist pivot `i` through the row source.
    pub fn save(&mut self, i: Component) -> Result<()> {
        if self
            .components
            .get(i as usize)
            .is_none_or(|slot| slot.is_none())
        {
            return Ok(());
        }

        let meta = self.pivot(i).meta;
        let row = self.acquire(i)?;
        self.source.save(i, &row.to_reflist(), meta)
    }

    /// Kick off evaluation of everything still deferred, then persist every
    /// materialised pivot.
    pub fn finish(&mut self) -> Result<()> {
        let count = self.components.len();
        for i in 0..count {
            self.terminate_all(i as Component);
        }
        for i in 0..count {
            self.save(i as Component)?;
        }
        Ok(())
    }
}

impl Drop for PivotGraph {
    fn drop(&mut self) {
        self.components.clear();
        debug_assert_eq!(
            self.memory.gov.usage(),
            0,
            "coefficient bytes still accounted at graph destruction"
        );
    }
}

/// A row read back from the graph, every coefficient pinned in memory.
pub struct RowGuard {
    terms: Vec<(Component, TerminalRef)>,
}

impl RowGuard {
    #[must_use]
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Component, &Coefficient)> {
        self.terms.iter().map(|(head, value)| (*head, &**value))
    }

    /// Owned copy of the row.
    #[must_use]
    pub fn to_reflist(&self) -> Reflist {
        let mut row = Reflist::new();
        for (head, value) in self.iter() {
            row.push(head, value.clone());
        }
        row
    }
}
