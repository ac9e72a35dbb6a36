use anyhow::Result;
use std::sync::Arc;
use symsolve::testing::{TableSource, spawn_stub_workers};
use symsolve::{Aef, MemStore, PivotGraph};

struct Fixture {
    aef: Arc<Aef>,
    aef_numeric: Arc<Aef>,
    source: Arc<TableSource>,
    graph: PivotGraph,
}

impl Fixture {
    fn new(memory_limit: usize) -> Self {
        let source = Arc::new(TableSource::new());
        let aef = Aef::new();
        let aef_numeric = Aef::new();
        spawn_stub_workers(&aef, 2).expect("workers");
        spawn_stub_workers(&aef_numeric, 2).expect("numeric workers");

        let graph = PivotGraph::new(
            aef.clone(),
            aef_numeric.clone(),
            source.clone(),
            Arc::new(MemStore::new()),
            memory_limit,
            16,
        );

        Self {
            aef,
            aef_numeric,
            source,
            graph,
        }
    }

    fn teardown(self) {
        drop(self.graph);
        self.aef.shutdown();
        self.aef_numeric.shutdown();
    }
}

fn row_of(graph: &mut PivotGraph, i: u32) -> Vec<(u32, String)> {
    let guard = graph.acquire(i).expect("acquire");
    let mut row: Vec<(u32, String)> = guard
        .iter()
        .map(|(head, coefficient)| (head, coefficient.to_string()))
        .collect();
    row.sort();
    row
}

#[test]
fn meta_materialises_on_demand() -> Result<()> {
    let mut fx = Fixture::new(0);
    fx.source.insert(0, 7, &[(0, "2"), (1, "3")]);

    let meta = fx.graph.meta(0)?.expect("pivot exists");
    assert_eq!(meta.order, 7);
    assert!(!meta.solved);
    assert_eq!(fx.graph.n_refs(0), 2);
    assert_eq!(fx.graph.head_nth(0, 0), 0);
    assert_eq!(fx.graph.head_nth(0, 1), 1);

    // Unknown components are masters.
    assert!(fx.graph.meta(9)?.is_none());

    fx.teardown();
    Ok(())
}

#[test]
fn relay_substitutes_a_normalised_head() -> Result<()> {
    let mut fx = Fixture::new(0);
    // Row 0: a=5 on self, b=2 towards 1, c=3 towards 2.
    fx.source.insert(0, 2, &[(0, "5"), (1, "2"), (2, "3")]);
    // Row 1 is already in normalised form: self 1, d=7 towards 2.
    fx.source.insert(1, 1, &[(1, "1"), (2, "7")]);

    fx.graph.meta(0)?.expect("row 0");
    fx.graph.meta(1)?.expect("row 1");

    assert!(fx.graph.relay(0, 1));
    // The relayed edge is gone; the substituted one arrived unbaked.
    assert_eq!(fx.graph.n_refs(0), 3);
    for n in 0..fx.graph.n_refs(0) {
        assert_ne!(fx.graph.head_nth(0, n), 1);
    }

    fx.graph.collect(0, 2);
    assert_eq!(fx.graph.n_refs(0), 2);

    // c + b*d = 3 + 2*7
    assert_eq!(
        row_of(&mut fx.graph, 0),
        vec![(0, "5".to_string()), (2, "17".to_string())]
    );

    fx.teardown();
    Ok(())
}

#[test]
fn relay_without_a_matching_edge_reports_false() -> Result<()> {
    let mut fx = Fixture::new(0);
    fx.source.insert(0, 2, &[(0, "5")]);
    fx.source.insert(1, 1, &[(1, "1")]);
    fx.graph.meta(0)?.expect("row 0");
    fx.graph.meta(1)?.expect("row 1");

    assert!(!fx.graph.relay(0, 1));
    assert_eq!(fx.graph.n_refs(0), 1);

    fx.teardown();
    Ok(())
}

#[test]
fn collect_folds_parallel_edges_additively() -> Result<()> {
    let mut fx = Fixture::new(0);
    fx.source
        .insert(0, 3, &[(0, "1"), (1, "4"), (1, "5"), (1, "6")]);
    fx.graph.meta(0)?.expect("row 0");

    fx.graph.collect(0, 1);
    assert_eq!(fx.graph.n_refs(0), 2);
    assert_eq!(
        row_of(&mut fx.graph, 0),
        vec![(0, "1".to_string()), (1, "15".to_string())]
    );

    fx.teardown();
    Ok(())
}

#[test]
fn normalize_divides_by_minus_self() -> Result<()> {
    let mut fx = Fixture::new(0);
    // {(i,s), (j,x), (k,y)} with s=2, x=6, y=10.
    fx.source.insert(0, 3, &[(0, "2"), (1, "6"), (2, "10")]);
    fx.graph.meta(0)?.expect("row 0");

    fx.graph.normalize(0);

    assert_eq!(
        row_of(&mut fx.graph, 0),
        vec![
            (0, "1".to_string()),
            (1, "-3".to_string()),
            (2, "-5".to_string()),
        ]
    );

    fx.teardown();
    Ok(())
}

#[test]
fn normalize_with_a_single_edge_is_a_no_op() -> Result<()> {
    let mut fx = Fixture::new(0);
    fx.source.insert(0, 1, &[(0, "5")]);
    fx.graph.meta(0)?.expect("row 0");

    fx.graph.normalize(0);
    assert_eq!(row_of(&mut fx.graph, 0), vec![(0, "5".to_string())]);

    fx.teardown();
    Ok(())
}

#[test]
fn acquire_drops_zero_edges() -> Result<()> {
    let mut fx = Fixture::new(0);
    fx.source.insert(0, 2, &[(0, "3"), (1, "0"), (2, "8")]);
    fx.graph.meta(0)?.expect("row 0");

    let row = row_of(&mut fx.graph, 0);
    assert_eq!(row, vec![(0, "3".to_string()), (2, "8".to_string())]);
    assert_eq!(fx.graph.n_refs(0), 2);

    fx.teardown();
    Ok(())
}

#[test]
fn delete_nth_swap_removes() -> Result<()> {
    let mut fx = Fixture::new(0);
    fx.source.insert(0, 2, &[(0, "1"), (1, "2"), (2, "3")]);
    fx.graph.meta(0)?.expect("row 0");

    fx.graph.delete_nth(0, 1);
    assert_eq!(fx.graph.n_refs(0), 2);
    assert_eq!(fx.graph.head_nth(0, 0), 0);
    assert_eq!(fx.graph.head_nth(0, 1), 2);

    fx.teardown();
    Ok(())
}

#[test]
fn save_writes_the_acquired_row_back() -> Result<()> {
    let mut fx = Fixture::new(0);
    fx.source.insert(0, 4, &[(0, "2"), (1, "6")]);
    fx.graph.meta(0)?.expect("row 0");
    fx.graph.normalize(0);

    fx.graph.save(0)?;

    let (row, meta) = fx.source.saved_row(0).expect("saved");
    assert_eq!(meta.order, 4);
    let mut terms: Vec<(u32, String)> = row
        .terms
        .iter()
        .map(|t| (t.head, t.coefficient.to_string()))
        .collect();
    terms.sort();
    assert_eq!(
        terms,
        vec![(0, "1".to_string()), (1, "-3".to_string())]
    );

    fx.teardown();
    Ok(())
}

#[test]
fn evicted_initial_coefficients_reload_from_the_source() -> Result<()> {
    // A 4-byte budget cannot hold either coefficient for long.
    let mut fx = Fixture::new(4);
    fx.source.insert(0, 1, &[(0, "123456"), (1, "654321")]);
    fx.graph.meta(0)?.expect("row 0");

    assert_eq!(
        row_of(&mut fx.graph, 0),
        vec![(0, "123456".to_string()), (1, "654321".to_string())]
    );
    assert!(fx.graph.stats().snapshot().reloads >= 1);

    fx.teardown();
    Ok(())
}
