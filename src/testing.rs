//! Testing utilities.
//!
//! The solver's two external collaborators -- the algebra helper process and
//! the row persistence -- get in-process stand-ins here so pipelines of
//! operands and whole reductions can run inside `cargo test`:
//!
//! - [`StubEvaluator`]: exact rational arithmetic over integer atoms. An
//!   expression containing symbols is returned as its own (trimmed) text,
//!   which keeps it a pure function of the input the way the real helper
//!   is.
//! - [`TableSource`]: an in-memory [`RowSource`] seeded from plain tuples,
//!   recording saved rows separately so tests can inspect results without
//!   disturbing reloads.

use crate::coefficient::Coefficient;
use crate::evaluator::Evaluate;
use crate::expression::Metadata;
use crate::graph::{Reflist, RowSource};
use crate::integral::Component;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-process evaluator: exact rational arithmetic where the expression is
/// numeric, textual echo where it is not.
#[derive(Default)]
pub struct StubEvaluator;

impl StubEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Evaluate for StubEvaluator {
    fn evaluate(&mut self, expr: &str) -> Result<Coefficient> {
        let text = match Parser::run(expr) {
            Some(value) => value.to_string(),
            None => expr.trim().to_string(),
        };
        Ok(Coefficient::from_string(text))
    }
}

/// Reduced fraction with the sign on the numerator.
#[derive(Clone, Copy)]
struct Rat {
    num: i128,
    den: i128,
}

impl Rat {
    fn new(num: i128, den: i128) -> Option<Self> {
        if den == 0 {
            return None;
        }
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd(num.unsigned_abs(), den.unsigned_abs());
        if g == 0 {
            return Some(Self { num: 0, den: 1 });
        }
        Some(Self {
            num: sign * num / g as i128,
            den: den.abs() / g as i128,
        })
    }

    fn add(self, other: Self) -> Option<Self> {
        Self::new(
            self.num * other.den + other.num * self.den,
            self.den * other.den,
        )
    }

    fn sub(self, other: Self) -> Option<Self> {
        Self::new(
            self.num * other.den - other.num * self.den,
            self.den * other.den,
        )
    }

    fn mul(self, other: Self) -> Option<Self> {
        Self::new(self.num * other.num, self.den * other.den)
    }

    fn div(self, other: Self) -> Option<Self> {
        Self::new(self.num * other.den, self.den * other.num)
    }

    fn neg(self) -> Self {
        Self {
            num: -self.num,
            den: self.den,
        }
    }
}

impl std::fmt::Display for Rat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Recursive-descent parser for `+ - * / ( )` over integer atoms. Bails
/// (returns `None`) on the first symbol or division by zero.
struct Parser<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Parser<'a> {
    fn run(text: &'a str) -> Option<Rat> {
        let mut parser = Self {
            bytes: text.as_bytes(),
            at: 0,
        };
        let value = parser.expr()?;
        parser.skip_ws();
        if parser.at == parser.bytes.len() {
            Some(value)
        } else {
            None
        }
    }

    fn skip_ws(&mut self) {
        while self.bytes.get(self.at).is_some_and(u8::is_ascii_whitespace) {
            self.at += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.at).copied()
    }

    fn expr(&mut self) -> Option<Rat> {
        let mut acc = self.term()?;
        loop {
            match self.peek() {
                Some(b'+') => {
                    self.at += 1;
                    acc = acc.add(self.term()?)?;
                }
                Some(b'-') => {
                    self.at += 1;
                    acc = acc.sub(self.term()?)?;
                }
                _ => return Some(acc),
            }
        }
    }

    fn term(&mut self) -> Option<Rat> {
        let mut acc = self.factor()?;
        loop {
            match self.peek() {
                Some(b'*') => {
                    self.at += 1;
                    acc = acc.mul(self.factor()?)?;
                }
                Some(b'/') => {
                    self.at += 1;
                    acc = acc.div(self.factor()?)?;
                }
                _ => return Some(acc),
            }
        }
    }

    fn factor(&mut self) -> Option<Rat> {
        match self.peek()? {
            b'-' => {
                self.at += 1;
                Some(self.factor()?.neg())
            }
            b'(' => {
                self.at += 1;
                let inner = self.expr()?;
                if self.peek()? != b')' {
                    return None;
                }
                self.at += 1;
                Some(inner)
            }
            b'0'..=b'9' => {
                let start = self.at;
                while self.bytes.get(self.at).is_some_and(u8::is_ascii_digit) {
                    self.at += 1;
                }
                let digits = std::str::from_utf8(&self.bytes[start..self.at]).ok()?;
                Rat::new(digits.parse().ok()?, 1)
            }
            _ => None,
        }
    }
}

/// In-memory row source seeded from literal tables.
#[derive(Default)]
pub struct TableSource {
    rows: Mutex<HashMap<Component, (Reflist, Metadata)>>,
    saved: Mutex<HashMap<Component, (Reflist, Metadata)>>,
}

impl TableSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the row of `component` with the given order and terms.
    pub fn insert(&self, component: Component, order: u32, terms: &[(Component, &str)]) {
        let mut row = Reflist::new();
        for (head, coefficient) in terms {
            row.push(*head, Coefficient::from(*coefficient));
        }
        self.rows
            .lock()
            .expect("table lock")
            .insert(component, (row, Metadata::with_order(order)));
    }

    /// The row last saved for `component`, if any.
    #[must_use]
    pub fn saved_row(&self, component: Component) -> Option<(Reflist, Metadata)> {
        self.saved
            .lock()
            .expect("table lock")
            .get(&component)
            .cloned()
    }
}

impl RowSource for TableSource {
    fn load(&self, component: Component) -> Result<Option<(Reflist, Metadata)>> {
        Ok(self
            .rows
            .lock()
            .expect("table lock")
            .get(&component)
            .cloned())
    }

    fn save(&self, component: Component, row: &Reflist, meta: Metadata) -> Result<()> {
        self.saved
            .lock()
            .expect("table lock")
            .insert(component, (row.clone(), meta));
        Ok(())
    }
}

/// Spawn `n` stub workers on `aef`.
pub fn spawn_stub_workers(aef: &std::sync::Arc<crate::aef::Aef>, n: usize) -> Result<()> {
    aef.spawn_n(n, || {
        let evaluator: Box<dyn Evaluate> = Box::new(StubEvaluator::new());
        Ok(evaluator)
    })
}
