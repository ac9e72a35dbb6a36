//! Solver driver.
//!
//! Reads target integrals (one `PR<p>(…)` per line) from a file, reduces
//! each to masters against the per-prototype stores in the data directory,
//! and prints `fill` rows on stdout.
//!
//! ```text
//! symsolve -e CMD [-p N] [-w N] [-l BYTES] [-s sym[=val]]... [-d DIR] TARGETS
//! ```
//!
//! - `-e CMD`   algebra helper command (one subprocess per worker)
//! - `-p N`     workers per pool (default: logical CPUs)
//! - `-w N`     pivot preallocation hint
//! - `-l BYTES` coefficient memory limit (0 = unbounded)
//! - `-s S[=V]` declare symbol S; with `=V` the numeric pool binds it
//! - `-d DIR`   data directory (default `.`)

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use symsolve::{
    Aef, Evaluate, EvaluatorOptions, FileStore, Integral, IntegralMgr, PivotGraph,
    ProcessEvaluator, StoreMode, solve,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "usage: symsolve -e CMD [-p N] [-w N] [-l BYTES] [-s sym[=val]]... [-d DIR] TARGETS";

struct Args {
    helper: String,
    workers: usize,
    prealloc: usize,
    memory_limit: usize,
    data_dir: PathBuf,
    symbols: Vec<(String, Option<String>)>,
    targets: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut helper = None;
    let mut workers = num_cpus::get();
    let mut prealloc = 1 << 20;
    let mut memory_limit = 0usize;
    let mut data_dir = PathBuf::from(".");
    let mut symbols = Vec::new();
    let mut targets = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-e" => helper = Some(args.next().context("-e needs a command")?),
            "-p" => {
                workers = args
                    .next()
                    .context("-p needs a count")?
                    .parse()
                    .context("bad worker count")?;
                if workers == 0 {
                    bail!("worker count must be positive");
                }
            }
            "-w" => {
                prealloc = args
                    .next()
                    .context("-w needs a count")?
                    .parse()
                    .context("bad preallocation hint")?;
            }
            "-l" => {
                memory_limit = args
                    .next()
                    .context("-l needs a byte count")?
                    .parse()
                    .context("bad memory limit")?;
            }
            "-s" => {
                let spec = args.next().context("-s needs a symbol")?;
                match spec.split_once('=') {
                    Some((sym, val)) => symbols.push((sym.to_string(), Some(val.to_string()))),
                    None => symbols.push((spec, None)),
                }
            }
            "-d" => data_dir = PathBuf::from(args.next().context("-d needs a directory")?),
            other if targets.is_none() && !other.starts_with('-') => {
                targets = Some(PathBuf::from(other));
            }
            other => bail!("unexpected argument `{other}`\n{USAGE}"),
        }
    }

    Ok(Args {
        helper: helper.with_context(|| format!("no helper command\n{USAGE}"))?,
        workers,
        prealloc,
        memory_limit,
        data_dir,
        symbols,
        targets: targets.with_context(|| format!("no targets file\n{USAGE}"))?,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;

    let mut options = EvaluatorOptions::new();
    let mut numeric_options = EvaluatorOptions::new();
    for (sym, val) in &args.symbols {
        options.declare(sym.clone());
        match val {
            Some(val) => numeric_options.bind(sym.clone(), val.clone()),
            None => numeric_options.declare(sym.clone()),
        }
    }

    let aef = Aef::new();
    let aef_numeric = Aef::new();
    aef.spawn_n(args.workers, || {
        let evaluator: Box<dyn Evaluate> =
            Box::new(ProcessEvaluator::spawn(&args.helper, &options)?);
        Ok(evaluator)
    })?;
    aef_numeric.spawn_n(args.workers, || {
        let evaluator: Box<dyn Evaluate> =
            Box::new(ProcessEvaluator::spawn(&args.helper, &numeric_options)?);
        Ok(evaluator)
    })?;

    let mgr = Arc::new(IntegralMgr::new(&args.data_dir));
    let spill = Arc::new(FileStore::open(
        args.data_dir.join("spill.dat"),
        StoreMode::Create,
    )?);

    let mut graph = PivotGraph::new(
        aef.clone(),
        aef_numeric.clone(),
        mgr.clone(),
        spill,
        args.memory_limit,
        args.prealloc,
    );

    let stop = AtomicBool::new(false);

    let targets = std::fs::read_to_string(&args.targets)
        .with_context(|| format!("cannot read targets {}", args.targets.display()))?;
    for line in targets.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let integral = Integral::from_string(line)?;
        let target = mgr.manage(integral.clone());

        info!("solving {integral}");
        solve(&mut graph, target, u16::MAX, &stop)?;

        let row = graph.acquire(target)?;
        println!("fill {integral} =");
        if row.len() > 1 {
            for (head, coefficient) in row.iter() {
                if head != target {
                    let head = mgr
                        .integral(head)
                        .with_context(|| format!("unmanaged head {head}"))?;
                    println!(" + {head} * ({coefficient})");
                }
            }
        } else {
            println!("0");
        }
        println!(";");
    }

    graph.finish()?;
    mgr.flush()?;

    info!(
        "evaluator stats: {} / numeric {}",
        aef.stats().snapshot().to_json(),
        aef_numeric.stats().snapshot().to_json()
    );
    info!("graph stats: {}", graph.stats().snapshot().to_json());

    drop(graph);
    aef.shutdown();
    aef_numeric.shutdown();

    Ok(())
}
