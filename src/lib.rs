//! # Symsolve
//!
//! A solver for **large sparse linear systems with symbolic coefficients**,
//! as they arise in integration-by-parts reduction of Feynman integrals.
//! Each unknown is an [`Integral`]; the system is a directed graph of
//! pivots whose edges carry coefficients that are rational expressions in
//! several symbols. The solver reduces a target integral to a linear
//! combination of master integrals by repeated elimination against
//! neighbours of smaller (or already solved) order.
//!
//! ## Key Features
//!
//! - **Deferred symbolic arithmetic** - coefficients are operand handles
//!   into an expression DAG; nothing is simplified until a terminal is
//!   baked onto the evaluator pool
//! - **Parallel evaluation** - a pool of workers, each owning one external
//!   algebra helper subprocess, drains terminals as their dependencies
//!   resolve
//! - **Numeric probes** - every edge carries a numeric mirror operand
//!   evaluated against fully bound symbols, so the policy can race cheap
//!   non-zero checks instead of paying symbolic cost
//! - **Bounded coefficient memory** - concrete values live in an LRU cache
//!   under a byte budget, spilling to a key/value store and reloading on
//!   demand
//! - **Pluggable seams** - the algebra helper ([`Evaluate`]), the record
//!   engine ([`Store`]) and the row persistence ([`RowSource`]) are traits
//!
//! ## Core Concepts
//!
//! ### Operands
//!
//! An [`Operand`] is a handle to a node of the expression DAG: a
//! [`Terminal`] holds (or will hold) a concrete [`Coefficient`]; an
//! intermediate built with [`link`] is a pure internal node. `bake`
//! promotes an expression into a terminal that the [`Aef`] pool schedules
//! once all of its terminal ancestors are concrete.
//!
//! ### The pivot graph
//!
//! A [`PivotGraph`] materialises rows on demand from a [`RowSource`] and
//! exposes the three primitives elimination is made of: `relay`
//! (substitute a normalised neighbour), `collect` (fold parallel edges)
//! and `normalize` (divide a row by minus its self-coefficient).
//!
//! ### The policy
//!
//! [`solve`] walks the graph: it races the numeric probes of suitable
//! neighbours, recurses on the winner, then relays, collects and
//! normalises. A despair ladder bounded by the caller keeps mutual
//! orderings from recursing forever.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use symsolve::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mgr = Arc::new(IntegralMgr::new("./data"));
//! let spill = Arc::new(MemStore::new());
//!
//! let aef = Aef::new();
//! let aef_numeric = Aef::new();
//! let mut options = EvaluatorOptions::new();
//! options.declare("ep");
//! let mut numeric_options = EvaluatorOptions::new();
//! numeric_options.bind("ep", "1/137");
//!
//! for _ in 0..4 {
//!     aef.spawn(Box::new(ProcessEvaluator::spawn("fermat-shim", &options)?))?;
//!     aef_numeric.spawn(Box::new(ProcessEvaluator::spawn("fermat-shim", &numeric_options)?))?;
//! }
//!
//! let mut graph = PivotGraph::new(
//!     aef.clone(),
//!     aef_numeric.clone(),
//!     mgr.clone(),
//!     spill,
//!     1 << 30,
//!     1 << 20,
//! );
//!
//! let target = mgr.manage(Integral::from_string("PR11(1,1,1,0,0)")?);
//! let stop = AtomicBool::new(false);
//! solve(&mut graph, target, u16::MAX, &stop)?;
//!
//! let row = graph.acquire(target)?;
//! for (head, coefficient) in row.iter() {
//!     println!("{head} -> {coefficient}");
//! }
//! drop(row);
//!
//! graph.finish()?;
//! aef.shutdown();
//! aef_numeric.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`coefficient`] - opaque coefficient values
//! - [`integral`] - integral identities and their encodings
//! - [`expression`] - row records, wire format, pivot metadata
//! - [`store`] - keyed byte-blob persistence behind the [`Store`] trait
//! - [`evaluator`] - the external algebra helper seam
//! - [`operand`] - the deferred-expression operand DAG
//! - [`aef`] - the evaluator worker pool
//! - [`cache`] - ownership and eviction of concrete coefficients
//! - [`graph`] - the pivot graph and its elimination primitives
//! - [`policy`] - the elimination strategy
//! - [`integral_mgr`] - interning and per-prototype row persistence
//! - [`metrics`] - execution counters
//! - [`testing`] - in-process stand-ins for the external collaborators

pub mod aef;
pub mod cache;
pub mod coefficient;
pub mod evaluator;
pub mod expression;
pub mod graph;
pub mod integral;
pub mod integral_mgr;
pub mod metrics;
pub mod operand;
pub mod policy;
pub mod store;
pub mod testing;

// General re-exports
pub use aef::Aef;
pub use cache::{HostId, TerminalHost, TerminalQueue};
pub use coefficient::Coefficient;
pub use evaluator::{Evaluate, EvaluatorOptions, ProcessEvaluator};
pub use expression::{Expression, Metadata, Term};
pub use graph::{PivotGraph, Reflist, RowGuard, RowSource, RowTerm};
pub use integral::{Component, Integral, Power, Prototype};
pub use integral_mgr::IntegralMgr;
pub use metrics::{RunStats, StatsSnapshot};
pub use operand::{
    HostBinding, Operand, Operation, Terminal, TerminalGroup, TerminalRef, link, terminate,
};
pub use policy::solve;
pub use store::{Cursor, FileStore, MemStore, Store, StoreMode};
