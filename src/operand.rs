//! The deferred-expression operand DAG.
//!
//! This module defines:
//! - [`Operand`]: a cheaply clonable handle to a DAG node, either a
//!   [`Terminal`] (holds, or will hold, a concrete [`Coefficient`]) or an
//!   [`Intermediate`] (a pure internal node: operation + children).
//! - [`Terminal::bake`]: promote an expression over existing operands into a
//!   terminal that the evaluator pool schedules once every terminal ancestor
//!   has become concrete.
//! - [`link`]: build an [`Intermediate`] without scheduling anything.
//! - [`TerminalGroup`]: a cancellable set of terminals raced for completion,
//!   the sole mechanism policies use to race numeric probes.
//!
//! # Scheduling protocol
//!
//! Every pending terminal carries a dependee counter: the number of its
//! not-yet-concrete terminal ancestors, plus one construction guard taken
//! while the expression is still being wired up. Ancestors are found through
//! the tails cache each intermediate maintains, so baking never re-traverses
//! the DAG. When the counter falls to zero -- and it can fall to zero only
//! once -- the terminal is pushed onto its pool's FIFO ready queue.
//!
//! The per-terminal state lock serialises "store concrete value + hand out
//! the depender list" against "register a new depender": a late registrant
//! either sees the value already concrete (and registers nothing) or is
//! appended to the list and is guaranteed to be counted down on completion.
//!
//! # Discard rule
//!
//! Dropping the last handle to a terminal whose value was computed by a
//! worker but never consumed is a defect (wasted evaluator work), asserted
//! in debug builds. Operands whose values are legitimately disposable --
//! numeric probes that lost their race -- are built with `allow_discard`.

use crate::aef::{Aef, GroupShared};
use crate::cache::{HostId, TerminalHost};
use crate::coefficient::Coefficient;
use anyhow::{Context, Result};
use std::any::Any;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use tracing::warn;

/// Primitive operations of the expression DAG.
///
/// `Add` and `Mul` are n-ary; `Sub` with one child is unary negation;
/// `Div` is binary. There are no other variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Add,
    Sub,
    Mul,
    Div,
}

impl Operation {
    fn symbol(self) -> char {
        match self {
            Self::Add => '+',
            Self::Sub => '-',
            Self::Mul => '*',
            Self::Div => '/',
        }
    }
}

/// Handle to a DAG node. Clones share the node.
#[derive(Clone)]
pub enum Operand {
    Terminal(Arc<Terminal>),
    Intermediate(Arc<Intermediate>),
}

impl Operand {
    #[must_use]
    pub fn as_terminal(&self) -> Option<&Arc<Terminal>> {
        match self {
            Self::Terminal(t) => Some(t),
            Self::Intermediate(_) => None,
        }
    }
}

impl From<Arc<Terminal>> for Operand {
    fn from(t: Arc<Terminal>) -> Self {
        Self::Terminal(t)
    }
}

impl From<Arc<Intermediate>> for Operand {
    fn from(i: Arc<Intermediate>) -> Self {
        Self::Intermediate(i)
    }
}

/// Pure internal DAG node: children under one operation, plus the cached
/// set of terminal ancestors ("tails") consumed when the node is linked
/// into a parent or baked.
pub struct Intermediate {
    op: Operation,
    children: Vec<Operand>,
    tails: Mutex<Option<Vec<Arc<Terminal>>>>,
}

/// Create an intermediate node. No scheduling occurs; the children's tails
/// caches are merged into the new node.
///
/// Each intermediate may be consumed (linked or baked) exactly once.
#[must_use]
pub fn link(op: Operation, children: Vec<Operand>) -> Arc<Intermediate> {
    let mut tails = Vec::new();
    for child in &children {
        match child {
            Operand::Terminal(t) => tails.push(t.clone()),
            Operand::Intermediate(i) => {
                let inherited = i
                    .tails
                    .lock()
                    .expect("tails lock")
                    .take()
                    .expect("intermediate consumed twice");
                tails.extend(inherited);
            }
        }
    }

    Arc::new(Intermediate {
        op,
        children,
        tails: Mutex::new(Some(tails)),
    })
}

/// Manager attachment of a managed terminal: the host implements load,
/// save and discard against backing storage, the id names the record.
pub struct HostBinding {
    pub(crate) host: Arc<dyn TerminalHost>,
    pub(crate) id: HostId,
}

impl HostBinding {
    #[must_use]
    pub fn new(host: Arc<dyn TerminalHost>, id: impl Any + Send + Sync) -> Self {
        Self {
            host,
            id: Box::new(id),
        }
    }
}

enum State {
    /// Expression registered with a pool, not yet evaluated.
    Pending(Box<Baked>),
    /// Evaluation (or first load) done. `value` is `None` while the bytes
    /// are evicted to the host's backing storage.
    Ready {
        value: Option<Arc<Coefficient>>,
        pins: u32,
    },
}

struct Baked {
    op: Operation,
    children: Vec<Operand>,
    queue: Arc<Aef>,
    /// Terminals whose dependee counts this one holds up.
    dependers: Vec<Arc<Terminal>>,
    /// Groups racing on this terminal's completion.
    watchers: Vec<Weak<GroupShared>>,
}

/// Operand whose value is (or will become) a concrete coefficient.
pub struct Terminal {
    state: Mutex<State>,
    ready: Condvar,
    /// Outstanding unevaluated terminal ancestors, plus the construction
    /// guard. Meaningful only while pending.
    deps: AtomicU32,
    binding: Option<HostBinding>,
    allow_discard: bool,
    computed: AtomicBool,
    consumed: AtomicBool,
}

impl Terminal {
    /// Terminal already in the concrete state, owning `value`. Unmanaged:
    /// never evicted.
    #[must_use]
    pub fn from_coefficient(value: Coefficient) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Ready {
                value: Some(Arc::new(value)),
                pins: 0,
            }),
            ready: Condvar::new(),
            deps: AtomicU32::new(0),
            binding: None,
            allow_discard: false,
            computed: AtomicBool::new(false),
            consumed: AtomicBool::new(false),
        })
    }

    /// Managed terminal in the loadable state; the value arrives later via
    /// [`Terminal::load`] or is produced by the host's loader on demand.
    #[must_use]
    pub fn managed(binding: HostBinding) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Ready {
                value: None,
                pins: 0,
            }),
            ready: Condvar::new(),
            deps: AtomicU32::new(0),
            binding: Some(binding),
            allow_discard: false,
            computed: AtomicBool::new(false),
            consumed: AtomicBool::new(false),
        })
    }

    /// Bake `op` over `children` into a terminal scheduled on `aef`.
    ///
    /// The new terminal registers as a depender on every terminal in each
    /// child's tails cache (or on the child itself when the child is a
    /// terminal); if all of them are already concrete it lands on the ready
    /// queue before this returns.
    #[must_use]
    pub fn bake(
        op: Operation,
        children: &[Operand],
        aef: &Arc<Aef>,
        binding: Option<HostBinding>,
        allow_discard: bool,
    ) -> Arc<Self> {
        let result = Arc::new(Self {
            state: Mutex::new(State::Pending(Box::new(Baked {
                op,
                children: children.to_vec(),
                queue: aef.clone(),
                dependers: Vec::new(),
                watchers: Vec::new(),
            }))),
            ready: Condvar::new(),
            // The extra count keeps the expression off the ready queue
            // until registration below has finished.
            deps: AtomicU32::new(1),
            binding,
            allow_discard,
            computed: AtomicBool::new(false),
            consumed: AtomicBool::new(false),
        });

        for child in children {
            match child {
                Operand::Terminal(dep) => register_dependency(dep, &result),
                Operand::Intermediate(i) => {
                    let tails = i
                        .tails
                        .lock()
                        .expect("tails lock")
                        .take()
                        .expect("intermediate consumed twice");
                    for dep in &tails {
                        register_dependency(dep, &result);
                    }
                }
            }
        }

        result.independ();
        result
    }

    /// Supply the first concrete value of a loadable terminal.
    pub fn load(self: &Arc<Self>, value: Coefficient) {
        let size = value.size();
        {
            let mut st = self.state.lock().expect("terminal lock");
            match &mut *st {
                State::Ready { value: slot, .. } => {
                    debug_assert!(slot.is_none(), "terminal loaded twice");
                    *slot = Some(Arc::new(value));
                }
                State::Pending(_) => panic!("cannot load a pending terminal"),
            }
        }
        self.ready.notify_all();
        if let Some(binding) = &self.binding {
            binding.host.memory_change(size, false);
            binding.host.queue().push(self);
        }
    }

    /// Block until the value has been evaluated (or loaded). Does not pin
    /// the value in memory; follow up with [`Terminal::acquire`] to read it.
    pub fn wait(&self) {
        let mut st = self.state.lock().expect("terminal lock");
        while matches!(&*st, State::Pending(_)) {
            st = self.ready.wait(st).expect("terminal lock");
        }
    }

    /// Whether the value exists (in memory or evicted).
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        matches!(
            &*self.state.lock().expect("terminal lock"),
            State::Ready { .. }
        )
    }

    /// Pin the concrete value in memory and return a read guard. Blocks on
    /// a pending evaluation; re-materialises an evicted value through the
    /// host's loader.
    pub fn acquire(self: &Arc<Self>) -> Result<TerminalRef> {
        loop {
            let mut st = self.state.lock().expect("terminal lock");
            while matches!(&*st, State::Pending(_)) {
                st = self.ready.wait(st).expect("terminal lock");
            }

            let State::Ready { value, pins } = &mut *st else {
                unreachable!("waited terminal is ready");
            };

            if let Some(value) = value {
                *pins += 1;
                let newly_pinned = *pins == 1;
                let guard = TerminalRef {
                    terminal: self.clone(),
                    value: value.clone(),
                };
                drop(st);
                self.consumed.store(true, Ordering::Relaxed);
                if newly_pinned && let Some(binding) = &self.binding {
                    binding.host.queue().remove(self);
                }
                return Ok(guard);
            }

            drop(st);

            let binding = self
                .binding
                .as_ref()
                .context("terminal has no value and no backing host")?;
            let loaded = binding.host.load(&binding.id)?;
            let size = loaded.size();

            let installed = {
                let mut st = self.state.lock().expect("terminal lock");
                match &mut *st {
                    State::Ready { value: slot, .. } if slot.is_none() => {
                        *slot = Some(Arc::new(loaded));
                        true
                    }
                    // Another caller loaded it first.
                    _ => false,
                }
            };
            if installed {
                binding.host.memory_change(size, false);
            }
        }
    }

    /// Install the worker's result and wake everything waiting on it.
    pub(crate) fn complete(self: &Arc<Self>, value: Coefficient) {
        let size = value.size();
        let baked = {
            let mut st = self.state.lock().expect("terminal lock");
            match std::mem::replace(
                &mut *st,
                State::Ready {
                    value: Some(Arc::new(value)),
                    pins: 0,
                },
            ) {
                State::Pending(b) => b,
                State::Ready { .. } => unreachable!("terminal completed twice"),
            }
        };

        self.computed.store(true, Ordering::Relaxed);
        self.ready.notify_all();

        if let Some(binding) = &self.binding {
            binding.host.memory_change(size, false);
            binding.host.queue().push(self);
        }

        for depender in &baked.dependers {
            depender.independ();
        }
        for watcher in &baked.watchers {
            if let Some(group) = watcher.upgrade() {
                group.notify();
            }
        }

        // Dropping the expression releases the children, which may cascade.
        drop(baked);
    }

    /// Clone out the parts a worker needs to evaluate this terminal.
    pub(crate) fn pending_parts(&self) -> (Operation, Vec<Operand>) {
        let st = self.state.lock().expect("terminal lock");
        match &*st {
            State::Pending(b) => (b.op, b.children.clone()),
            State::Ready { .. } => unreachable!("a scheduled terminal must still be pending"),
        }
    }

    /// Drop the construction guard / count down one dependee; push onto the
    /// ready queue on the zero transition. The decrement pairs its release
    /// with the acquire of the worker that picks the terminal up.
    fn independ(self: &Arc<Self>) {
        if self.deps.fetch_sub(1, Ordering::AcqRel) == 1 {
            let queue = {
                let st = self.state.lock().expect("terminal lock");
                match &*st {
                    State::Pending(b) => b.queue.clone(),
                    State::Ready { .. } => return,
                }
            };
            queue.push_ready(self.clone());
        }
    }

    /// Evict the value to the host. Called by the cache queue; succeeds only
    /// for an unpinned, in-memory, managed value.
    pub(crate) fn evict(self: &Arc<Self>) -> bool {
        let Some(binding) = &self.binding else {
            return false;
        };

        let freed = {
            let mut st = self.state.lock().expect("terminal lock");
            match &mut *st {
                State::Ready { value, pins: 0 } if value.is_some() => {
                    let taken = value.take().expect("checked above");
                    match binding.host.save(&binding.id, &taken) {
                        Ok(()) => Some(taken.size()),
                        Err(err) => {
                            warn!("could not save coefficient for eviction: {err:#}");
                            *value = Some(taken);
                            None
                        }
                    }
                }
                _ => None,
            }
        };

        match freed {
            Some(size) => {
                binding.host.memory_change(size, true);
                true
            }
            None => false,
        }
    }

    /// Register `group` for completion notification. Already-concrete
    /// terminals register nothing; the group's scan finds them directly.
    pub(crate) fn watch(&self, group: &Arc<GroupShared>) {
        let mut st = self.state.lock().expect("terminal lock");
        if let State::Pending(b) = &mut *st {
            b.watchers.push(Arc::downgrade(group));
        }
    }
}

fn register_dependency(dependee: &Arc<Terminal>, depender: &Arc<Terminal>) {
    let mut st = dependee.state.lock().expect("terminal lock");
    if let State::Pending(b) = &mut *st {
        b.dependers.push(depender.clone());
        // Order the worker-side decrements after this increment.
        depender.deps.fetch_add(1, Ordering::Release);
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        let st = self.state.get_mut().expect("terminal lock");
        match st {
            State::Pending(b) => {
                debug_assert!(
                    b.queue.is_stopped(),
                    "dropping a terminal whose expression never completed"
                );
            }
            State::Ready { value, pins } => {
                debug_assert_eq!(*pins, 0, "dropping a pinned terminal");
                if let Some(value) = value
                    && let Some(binding) = &self.binding
                {
                    binding.host.memory_change(value.size(), true);
                }
            }
        }

        debug_assert!(
            self.allow_discard
                || !self.computed.load(Ordering::Relaxed)
                || self.consumed.load(Ordering::Relaxed),
            "discarding a computed coefficient that was never consumed"
        );

        if let Some(binding) = &self.binding {
            binding.host.discard(&binding.id);
        }
    }
}

/// Pinned view of a terminal's concrete coefficient. The pin is dropped --
/// and the terminal re-enters the eviction queue at the most-recently-used
/// end -- when the guard goes out of scope.
pub struct TerminalRef {
    terminal: Arc<Terminal>,
    value: Arc<Coefficient>,
}

impl Deref for TerminalRef {
    type Target = Coefficient;

    fn deref(&self) -> &Coefficient {
        &self.value
    }
}

impl Drop for TerminalRef {
    fn drop(&mut self) {
        let unpinned = {
            let mut st = self.terminal.state.lock().expect("terminal lock");
            match &mut *st {
                State::Ready { pins, .. } => {
                    *pins -= 1;
                    *pins == 0
                }
                State::Pending(_) => unreachable!("pinned terminal is ready"),
            }
        };
        if unpinned && let Some(binding) = &self.terminal.binding {
            binding.host.queue().push(&self.terminal);
        }
    }
}

/// Bake `operand` onto the evaluator if it is not already a terminal.
///
/// The binding is allocated lazily so callers minting spill identifiers do
/// not burn one when the operand is already terminal.
pub fn terminate(
    operand: Operand,
    aef: &Arc<Aef>,
    binding: impl FnOnce() -> Option<HostBinding>,
    allow_discard: bool,
) -> Arc<Terminal> {
    match operand {
        Operand::Terminal(t) => t,
        Operand::Intermediate(_) => {
            Terminal::bake(Operation::Add, &[operand], aef, binding(), allow_discard)
        }
    }
}

/// Render a pending expression to the helper's text form.
///
/// Terminal leaves are pinned while their bytes are copied out, which
/// re-materialises evicted values; composite pieces and non-atomic leaves
/// are parenthesised.
pub(crate) fn render_expression(op: Operation, children: &[Operand]) -> Result<String> {
    let mut out = String::new();
    render_compound(&mut out, op, children)?;
    Ok(out)
}

fn render_compound(out: &mut String, op: Operation, children: &[Operand]) -> Result<()> {
    if op == Operation::Sub && children.len() == 1 {
        out.push('-');
        return render_operand(out, &children[0]);
    }

    for (j, child) in children.iter().enumerate() {
        if j > 0 {
            out.push(op.symbol());
        }
        render_operand(out, child)?;
    }
    Ok(())
}

fn render_operand(out: &mut String, operand: &Operand) -> Result<()> {
    match operand {
        Operand::Terminal(t) => {
            let value = t.acquire()?;
            if is_atom(value.as_bytes()) {
                out.push_str(&value.to_string());
            } else {
                out.push('(');
                out.push_str(&value.to_string());
                out.push(')');
            }
        }
        Operand::Intermediate(i) => {
            out.push('(');
            render_compound(out, i.op, &i.children)?;
            out.push(')');
        }
    }
    Ok(())
}

fn is_atom(bytes: &[u8]) -> bool {
    !bytes.is_empty()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'.')
}

/// A cancellable set of terminals raced for completion.
///
/// `push` registers a terminal, `wait` blocks until at least one member is
/// concrete, `pop` removes and returns one concrete member. `clear`
/// unregisters everything without touching the terminals.
pub struct TerminalGroup {
    shared: Arc<GroupShared>,
    members: Vec<Arc<Terminal>>,
}

impl TerminalGroup {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(GroupShared::new()),
            members: Vec::new(),
        }
    }

    pub fn push(&mut self, terminal: Arc<Terminal>) {
        terminal.watch(&self.shared);
        self.members.push(terminal);
    }

    /// Block until some member is concrete. Returns immediately when the
    /// group is empty.
    pub fn wait(&self) {
        self.shared.wait_until(|| {
            self.members.is_empty() || self.members.iter().any(|t| t.is_concrete())
        });
    }

    /// Remove and return one concrete member, or `None` if none is ready.
    pub fn pop(&mut self) -> Option<Arc<Terminal>> {
        let at = self.members.iter().position(|t| t.is_concrete())?;
        Some(self.members.swap_remove(at))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

impl Default for TerminalGroup {
    fn default() -> Self {
        Self::new()
    }
}
