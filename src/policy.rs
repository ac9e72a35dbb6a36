//! The elimination strategy.
//!
//! One edge to a suitable pivot is eliminated at a time. Suitable means
//! solved (lazy back-substitution) or of smaller order; under despair,
//! candidates already under consideration further up the recursion are
//! admitted as well, which breaks the orderings that would otherwise
//! recurse forever. Candidates are raced through their numeric probes: the
//! first one whose probe comes back non-zero wins, so no symbolic cost is
//! paid for coefficients that cancel.
//!
//! When no candidate remains the pivot is normalised. A zero
//! self-coefficient escalates despair and retries; at the configured
//! maximum the solver gives up.
//!
//! The stop flag is honoured at every relay/collect/normalise boundary.

use crate::graph::PivotGraph;
use crate::integral::Component;
use crate::operand::TerminalGroup;
use anyhow::{Result, bail};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Reduce `target` to masters. Returns early, without touching the graph
/// further, once `stop` is raised.
pub fn solve(
    graph: &mut PivotGraph,
    target: Component,
    despair_max: u16,
    stop: &AtomicBool,
) -> Result<()> {
    let Some(meta) = graph.meta(target)? else {
        return Ok(());
    };
    meta.consideration = 1;

    let outcome = eliminate(graph, target, 1, despair_max, stop);

    if let Ok(Some(meta)) = graph.meta(target) {
        meta.consideration = 0;
    }
    outcome
}

fn eliminate(
    graph: &mut PivotGraph,
    i: Component,
    despair: u16,
    despair_max: u16,
    stop: &AtomicBool,
) -> Result<()> {
    let order = graph
        .meta(i)?
        .map(|meta| meta.order)
        .expect("eliminating an unmaterialised pivot");

    let mut group = TerminalGroup::new();
    let mut probes = Vec::new();
    let mut next = None;

    let mut j = 0;
    while !stop.load(Ordering::Relaxed) && next.is_none() && j < graph.n_refs(i) {
        let candidate = graph.head_nth(i, j);
        if candidate != i
            && let Some(candidate_meta) = graph.meta(candidate)?
        {
            let suitable = candidate_meta.solved
                || candidate_meta.order < order
                || (despair > 0 && despair >= candidate_meta.consideration);
            if suitable {
                let probe = graph.terminate_nth(i, j, true);
                group.push(probe.clone());
                probes.push((candidate, probe));
            }
        }
        j += 1;

        // Drain whatever probes already finished; once every edge has been
        // offered, block until the race produces a winner or runs dry.
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            if let Some(ready) = group.pop() {
                if !ready.acquire()?.is_zero() {
                    let head = probes
                        .iter()
                        .find(|(_, probe)| Arc::ptr_eq(probe, &ready))
                        .map(|(head, _)| *head)
                        .expect("ready probe belongs to a candidate");
                    next = Some(head);
                    break;
                }
            } else if j == graph.n_refs(i) && group.count() > 0 {
                group.wait();
            } else {
                break;
            }
        }
    }

    if let Some(next_i) = next {
        group.clear();

        {
            let meta = graph.meta(i)?.expect("pivot stays materialised");
            meta.solved = false;
            meta.touched = false;
        }
        {
            let candidate_meta = graph.meta(next_i)?.expect("candidate is materialised");
            debug!(
                "eliminating order {} from {order}",
                candidate_meta.order
            );
            candidate_meta.consideration += 1;
        }

        let recursed = eliminate(graph, next_i, 0, despair_max, stop);
        if let Ok(Some(candidate_meta)) = graph.meta(next_i) {
            candidate_meta.consideration -= 1;
        }
        recursed?;

        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        // A desperate recursion may have come back around and modified this
        // pivot; relaying with the pre-recursion row would be stale.
        let touched = graph.meta(i)?.expect("pivot stays materialised").touched;
        if !touched {
            graph.relay(i, next_i);
            graph.collect_all(i);
        }
        graph.meta(i)?.expect("pivot stays materialised").touched = true;

        eliminate(graph, i, despair, despair_max, stop)
    } else {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        if graph.meta(i)?.expect("pivot stays materialised").solved {
            // Reached through back-substitution without changes.
            return Ok(());
        }

        if let Some(at) = (0..graph.n_refs(i)).find(|&n| graph.head_nth(i, n) == i) {
            let probe = graph.terminate_nth(i, at, true);
            probe.wait();
            if !probe.acquire()?.is_zero() {
                debug!("normalizing order {order} for substitution");
                graph.normalize(i);
                graph.meta(i)?.expect("pivot stays materialised").solved = true;
                return Ok(());
            }
        }

        warn!("canonical elimination in order {order} not normalizable (despair {despair})");
        if despair == despair_max {
            bail!("desperate elimination recursion reached its limit ({despair_max})");
        }
        eliminate(graph, i, despair + 1, despair_max, stop)
    }
}
