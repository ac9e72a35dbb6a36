//! The external algebra helper.
//!
//! Workers never simplify expressions themselves; each one owns an
//! [`Evaluate`] instance that turns the rendered text of one primitive
//! operation into one normalised coefficient. The production implementation
//! is [`ProcessEvaluator`], a helper subprocess spoken to over a
//! newline-delimited duplex pipe: one request line in, one reply line out,
//! a pure function of its input. Symbol bindings (`sym=val`) are handed to
//! the helper as arguments at spawn time; a numeric worker pool is simply
//! one whose helper was spawned with every symbol bound.
//!
//! Helper death is fatal for the run; there are no recovery semantics.

use crate::coefficient::Coefficient;
use anyhow::{Context, Result, bail};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::debug;

/// Symbol table handed to the helper at spawn time.
///
/// A bare symbol declares it; a binding `sym=val` substitutes it, which is
/// how the numeric probe pool collapses symbolic coefficients to numbers.
#[derive(Clone, Debug, Default)]
pub struct EvaluatorOptions {
    symbols: Vec<(String, Option<String>)>,
}

impl EvaluatorOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, symbol: impl Into<String>) {
        self.symbols.push((symbol.into(), None));
    }

    pub fn bind(&mut self, symbol: impl Into<String>, value: impl Into<String>) {
        self.symbols.push((symbol.into(), Some(value.into())));
    }

    /// `sym` / `sym=val` argument forms, in declaration order.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        self.symbols
            .iter()
            .map(|(sym, val)| match val {
                Some(v) => format!("{sym}={v}"),
                None => sym.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn is_fully_bound(&self) -> bool {
        self.symbols.iter().all(|(_, val)| val.is_some())
    }
}

/// One primitive evaluation: rendered operation text in, coefficient out.
///
/// Implementations must behave as pure functions of the input text.
pub trait Evaluate: Send {
    fn evaluate(&mut self, expr: &str) -> Result<Coefficient>;
}

/// Algebra helper subprocess.
pub struct ProcessEvaluator {
    child: Child,
    requests: BufWriter<ChildStdin>,
    replies: BufReader<ChildStdout>,
}

impl ProcessEvaluator {
    /// Spawn `command` with the options appended as arguments.
    pub fn spawn(command: &str, options: &EvaluatorOptions) -> Result<Self> {
        let mut child = Command::new(command)
            .args(options.to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn algebra helper `{command}`"))?;

        let stdin = child.stdin.take().context("helper has no stdin")?;
        let stdout = child.stdout.take().context("helper has no stdout")?;

        debug!("spawned algebra helper `{command}` (pid {})", child.id());

        Ok(Self {
            child,
            requests: BufWriter::new(stdin),
            replies: BufReader::new(stdout),
        })
    }
}

impl Evaluate for ProcessEvaluator {
    fn evaluate(&mut self, expr: &str) -> Result<Coefficient> {
        self.requests
            .write_all(expr.as_bytes())
            .and_then(|()| self.requests.write_all(b"\n"))
            .and_then(|()| self.requests.flush())
            .context("algebra helper closed its request pipe")?;

        let mut reply = String::new();
        let n = self
            .replies
            .read_line(&mut reply)
            .context("algebra helper closed its reply pipe")?;
        if n == 0 {
            bail!("algebra helper exited mid-run");
        }

        Ok(Coefficient::from_string(reply.trim_end_matches('\n')))
    }
}

impl Drop for ProcessEvaluator {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
