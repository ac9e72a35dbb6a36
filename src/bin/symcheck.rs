//! Store checker.
//!
//! Iterates the given row stores, decodes every record and bakes each
//! coefficient as a single-operand sum through the algebra helper, which
//! flushes corrupt coefficients out as helper errors.
//!
//! ```text
//! symcheck -e CMD [-p N] [-s sym[=val]]... FILE...
//! ```

use anyhow::{Context, Result, bail};
use symsolve::{
    Aef, Evaluate, EvaluatorOptions, Expression, FileStore, Metadata, Operand, Operation,
    ProcessEvaluator, Store, StoreMode, Terminal, store,
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: symcheck -e CMD [-p N] [-s sym[=val]]... FILE...";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let mut helper = None;
    let mut workers = num_cpus::get();
    let mut options = EvaluatorOptions::new();
    let mut files = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-e" => helper = Some(args.next().context("-e needs a command")?),
            "-p" => {
                workers = args
                    .next()
                    .context("-p needs a count")?
                    .parse()
                    .context("bad worker count")?;
            }
            "-s" => {
                let spec = args.next().context("-s needs a symbol")?;
                match spec.split_once('=') {
                    Some((sym, val)) => options.bind(sym, val),
                    None => options.declare(spec),
                }
            }
            other if !other.starts_with('-') => files.push(other.to_string()),
            other => bail!("unexpected argument `{other}`\n{USAGE}"),
        }
    }

    let helper = helper.with_context(|| format!("no helper command\n{USAGE}"))?;
    if files.is_empty() {
        bail!("no store files\n{USAGE}");
    }

    let aef = Aef::new();
    aef.spawn_n(workers, || {
        let evaluator: Box<dyn Evaluate> = Box::new(ProcessEvaluator::spawn(&helper, &options)?);
        Ok(evaluator)
    })?;

    for file in &files {
        eprintln!("checking store {file}");
        let db = FileStore::open(file, StoreMode::Read)?;

        let mut rows = 0usize;
        let mut terms = Vec::new();
        for (key, value) in db.cursor()? {
            if store::is_reserved(&key) {
                continue;
            }
            if value.len() < Metadata::WIRE_LEN {
                bail!("truncated record in {file}");
            }

            let expression = Expression::from_binary(&value[Metadata::WIRE_LEN..])
                .with_context(|| format!("corrupt record in {file}"))?;
            for term in expression.terms() {
                let leaf = Terminal::from_coefficient(term.coefficient.clone());
                terms.push(Terminal::bake(
                    Operation::Add,
                    &[Operand::Terminal(leaf)],
                    &aef,
                    None,
                    false,
                ));
            }
            rows += 1;
        }

        for term in &terms {
            term.wait();
            term.acquire()?;
        }
        println!("{file}: {rows} rows, {} coefficients ok", terms.len());
    }

    aef.shutdown();
    Ok(())
}
