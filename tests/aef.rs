use anyhow::Result;
use std::sync::Arc;
use symsolve::testing::spawn_stub_workers;
use symsolve::{Aef, Coefficient, Operand, Operation, Terminal, TerminalGroup, link};

fn pool(workers: usize) -> Arc<Aef> {
    let aef = Aef::new();
    spawn_stub_workers(&aef, workers).expect("spawn workers");
    aef
}

fn leaf(text: &str) -> Operand {
    Operand::Terminal(Terminal::from_coefficient(Coefficient::from(text)))
}

#[test]
fn constant_bake_adds() -> Result<()> {
    for workers in [1, 4] {
        let aef = pool(workers);

        let sum = Terminal::bake(
            Operation::Add,
            &[leaf("2"), leaf("3")],
            &aef,
            None,
            false,
        );
        sum.wait();
        assert_eq!(sum.acquire()?.as_bytes(), b"5");

        drop(sum);
        aef.shutdown();
    }
    Ok(())
}

#[test]
fn unary_sub_negates() -> Result<()> {
    let aef = pool(2);

    let negated = Terminal::bake(Operation::Sub, &[leaf("ep")], &aef, None, false);
    negated.wait();
    assert_eq!(negated.acquire()?.as_bytes(), b"-ep");

    drop(negated);
    aef.shutdown();
    Ok(())
}

#[test]
fn wait_is_idempotent() -> Result<()> {
    let aef = pool(2);

    let product = Terminal::bake(
        Operation::Mul,
        &[leaf("6"), leaf("7")],
        &aef,
        None,
        false,
    );
    product.wait();
    product.wait();
    assert_eq!(product.acquire()?.as_bytes(), b"42");
    assert_eq!(product.acquire()?.as_bytes(), b"42");

    drop(product);
    aef.shutdown();
    Ok(())
}

#[test]
fn linked_intermediates_evaluate_once_baked() -> Result<()> {
    for workers in [1, 3] {
        let aef = pool(workers);

        // ((2+3)*4 - 6) / 7 = 2
        let sum = link(Operation::Add, vec![leaf("2"), leaf("3")]);
        let scaled = link(
            Operation::Mul,
            vec![Operand::Intermediate(sum), leaf("4")],
        );
        let shifted = link(
            Operation::Sub,
            vec![Operand::Intermediate(scaled), leaf("6")],
        );
        let quotient = Terminal::bake(
            Operation::Div,
            &[Operand::Intermediate(shifted), leaf("7")],
            &aef,
            None,
            false,
        );

        quotient.wait();
        assert_eq!(quotient.acquire()?.as_bytes(), b"2");

        drop(quotient);
        aef.shutdown();
    }
    Ok(())
}

#[test]
fn baked_terminals_chain_through_dependees() -> Result<()> {
    for workers in [1, 4] {
        let aef = pool(workers);

        let a = Terminal::bake(Operation::Add, &[leaf("1"), leaf("2")], &aef, None, false);
        let b = Terminal::bake(
            Operation::Mul,
            &[Operand::Terminal(a.clone()), leaf("2")],
            &aef,
            None,
            false,
        );
        let c = Terminal::bake(
            Operation::Add,
            &[Operand::Terminal(b.clone()), Operand::Terminal(a.clone())],
            &aef,
            None,
            false,
        );

        c.wait();
        assert_eq!(c.acquire()?.as_bytes(), b"9");
        assert_eq!(a.acquire()?.as_bytes(), b"3");
        assert_eq!(b.acquire()?.as_bytes(), b"6");

        drop((a, b, c));
        aef.shutdown();
    }
    Ok(())
}

#[test]
fn division_yields_reduced_fractions() -> Result<()> {
    let aef = pool(2);

    let quotient = Terminal::bake(
        Operation::Div,
        &[leaf("10"), leaf("4")],
        &aef,
        None,
        false,
    );
    quotient.wait();
    assert_eq!(quotient.acquire()?.as_bytes(), b"5/2");

    drop(quotient);
    aef.shutdown();
    Ok(())
}

#[test]
fn group_races_completions() -> Result<()> {
    let aef = pool(2);

    let mut group = TerminalGroup::new();
    let mut terminals = Vec::new();
    for j in 0..6 {
        let t = Terminal::bake(
            Operation::Add,
            &[leaf(&j.to_string()), leaf("10")],
            &aef,
            None,
            false,
        );
        group.push(t.clone());
        terminals.push(t);
    }

    let mut seen = Vec::new();
    while group.count() > 0 {
        group.wait();
        while let Some(ready) = group.pop() {
            seen.push(ready.acquire()?.to_string());
        }
    }

    seen.sort();
    let mut expected: Vec<String> = (10..16).map(|v| v.to_string()).collect();
    expected.sort();
    assert_eq!(seen, expected);

    drop(terminals);
    aef.shutdown();
    Ok(())
}

#[test]
fn group_clear_unregisters_without_destruction() -> Result<()> {
    let aef = pool(1);

    let t = Terminal::bake(Operation::Add, &[leaf("4"), leaf("5")], &aef, None, false);
    let mut group = TerminalGroup::new();
    group.push(t.clone());
    assert_eq!(group.count(), 1);

    group.clear();
    assert_eq!(group.count(), 0);
    assert!(group.pop().is_none());

    // The terminal itself is untouched by the clear.
    t.wait();
    assert_eq!(t.acquire()?.as_bytes(), b"9");

    drop(t);
    aef.shutdown();
    Ok(())
}

#[test]
fn group_pop_sees_already_concrete_members() -> Result<()> {
    let aef = pool(1);

    let t = Terminal::from_coefficient(Coefficient::from("11"));
    let mut group = TerminalGroup::new();
    group.push(t.clone());

    group.wait();
    let popped = group.pop().expect("concrete member");
    assert!(Arc::ptr_eq(&popped, &t));
    assert_eq!(group.count(), 0);

    aef.shutdown();
    Ok(())
}

// A deterministic pseudo-random additive DAG, mirrored by exact integer
// bookkeeping on the side. Exercises dependee counting and scheduling
// interleavings without depending on completion order.
#[test]
fn random_additive_dag_matches_model() -> Result<()> {
    struct Lcg(u64);
    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }
    }

    for workers in [1, 4] {
        let aef = pool(workers);
        let mut rng = Lcg(100);

        // (operand, expected value); intermediates are single-use.
        let mut terminals: Vec<(Operand, i128)> = (0..8)
            .map(|v| (leaf(&v.to_string()), i128::from(v)))
            .collect();
        let mut intermediates: Vec<(Operand, i128)> = Vec::new();
        let mut watch: Vec<(Arc<Terminal>, i128)> = Vec::new();

        for _ in 0..120 {
            let arity = 1 + rng.next(3) as usize;
            let op = if arity == 1 || rng.next(2) == 0 {
                Operation::Sub
            } else {
                Operation::Add
            };

            let mut children = Vec::new();
            let mut values = Vec::new();
            for _ in 0..arity {
                if !intermediates.is_empty() && rng.next(3) == 0 {
                    let at = rng.next(intermediates.len() as u64) as usize;
                    let (operand, value) = intermediates.swap_remove(at);
                    children.push(operand);
                    values.push(value);
                } else {
                    let at = rng.next(terminals.len() as u64) as usize;
                    let (operand, value) = &terminals[at];
                    children.push(operand.clone());
                    values.push(*value);
                }
            }

            let expected = match op {
                Operation::Sub if values.len() == 1 => -values[0],
                Operation::Sub => values[0] - values[1..].iter().sum::<i128>(),
                Operation::Add => values.iter().sum(),
                _ => unreachable!(),
            };

            if rng.next(5) == 0 {
                intermediates.push((Operand::Intermediate(link(op, children)), expected));
            } else {
                let baked = Terminal::bake(op, &children, &aef, None, false);
                watch.push((baked.clone(), expected));
                terminals.push((Operand::Terminal(baked), expected));
            }
        }

        // Close the remaining intermediates so nothing stays unevaluated.
        for (operand, expected) in intermediates.drain(..) {
            let baked = Terminal::bake(Operation::Add, &[operand], &aef, None, false);
            watch.push((baked, expected));
        }

        for (terminal, expected) in &watch {
            terminal.wait();
            assert_eq!(terminal.acquire()?.to_string(), expected.to_string());
        }

        drop((terminals, watch));
        aef.shutdown();
    }
    Ok(())
}
