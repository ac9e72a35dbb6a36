//! Row records and their wire format.
//!
//! An [`Expression`] is one equation of the system, an ordered list of
//! `(integral, coefficient)` terms. Rows are persisted as:
//!
//! ```text
//! record := term*
//! term   := u32 int_len, u8[int_len] integral_bytes,
//!           u32 coeff_len, u8[coeff_len] coeff_bytes
//! ```
//!
//! Lengths are little-endian; the term list runs to the end of the buffer
//! with no count prefix. A [`Metadata`] header occupies exactly
//! [`Metadata::WIRE_LEN`] bytes in front of the record when a row is filed
//! in a store.

use crate::coefficient::Coefficient;
use crate::integral::Integral;
use anyhow::{Result, bail};

/// One `coefficient · integral` term.
#[derive(Clone, Debug)]
pub struct Term {
    pub integral: Integral,
    pub coefficient: Coefficient,
}

/// An ordered sum of terms, one row of the system.
#[derive(Clone, Debug, Default)]
pub struct Expression {
    terms: Vec<Term>,
}

impl Expression {
    #[must_use]
    pub fn new() -> Self {
        Self { terms: Vec::new() }
    }

    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        Self {
            terms: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, integral: Integral, coefficient: Coefficient) {
        self.terms.push(Term {
            integral,
            coefficient,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Decode a full record buffer.
    pub fn from_binary(data: &[u8]) -> Result<Self> {
        let mut result = Self::new();
        let mut at = 0usize;

        while at < data.len() {
            let int_bytes = read_blob(data, &mut at, "integral")?;
            let integral = Integral::from_binary(int_bytes)?;
            let coeff_bytes = read_blob(data, &mut at, "coefficient")?;
            result.push(integral, Coefficient::from_bytes(coeff_bytes));
        }

        Ok(result)
    }

    /// Encode to the record buffer form.
    #[must_use]
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for term in &self.terms {
            let int_bytes = term.integral.to_binary();
            write_blob(&mut out, &int_bytes);
            write_blob(&mut out, term.coefficient.as_bytes());
        }
        out
    }

    /// Human-readable sum, `+ PR…(…) * (coeff)` per term.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for term in &self.terms {
            out.push_str(&format!(
                " + {} * ({})",
                term.integral, term.coefficient
            ));
        }
        out
    }
}

fn write_blob(out: &mut Vec<u8>, blob: &[u8]) {
    out.extend_from_slice(&u32::try_from(blob.len()).expect("blob length fits u32").to_le_bytes());
    out.extend_from_slice(blob);
}

fn read_blob<'a>(data: &'a [u8], at: &mut usize, what: &str) -> Result<&'a [u8]> {
    if data.len() - *at < 4 {
        bail!("record truncated before {what} length");
    }
    let len = u32::from_le_bytes(data[*at..*at + 4].try_into().expect("length width")) as usize;
    *at += 4;
    if data.len() - *at < len {
        bail!("record truncated inside {what} ({len} bytes expected)");
    }
    let blob = &data[*at..*at + len];
    *at += len;
    Ok(blob)
}

/// Per-pivot metadata, filed in front of each persisted row.
///
/// Wire layout, 7 bytes: `u32 order, u16 consideration, u8 flags` with flag
/// bits `S` (solved, bit 0) and `T` (touched, bit 1).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Elimination order of the pivot.
    pub order: u32,
    /// Recursion marker: the pivot is being solved for further up the stack.
    pub consideration: u16,
    /// All pivots of smaller order eliminated and the row normalised.
    pub solved: bool,
    /// The row was modified since it was loaded.
    pub touched: bool,
}

const FLAG_SOLVED: u8 = 1 << 0;
const FLAG_TOUCHED: u8 = 1 << 1;

impl Metadata {
    pub const WIRE_LEN: usize = 7;

    #[must_use]
    pub fn with_order(order: u32) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn to_binary(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[..4].copy_from_slice(&self.order.to_le_bytes());
        out[4..6].copy_from_slice(&self.consideration.to_le_bytes());
        let mut flags = 0u8;
        if self.solved {
            flags |= FLAG_SOLVED;
        }
        if self.touched {
            flags |= FLAG_TOUCHED;
        }
        out[6] = flags;
        out
    }

    pub fn from_binary(data: &[u8]) -> Result<Self> {
        if data.len() < Self::WIRE_LEN {
            bail!("metadata record shorter than {} bytes", Self::WIRE_LEN);
        }
        let order = u32::from_le_bytes(data[..4].try_into().expect("order width"));
        let consideration = u16::from_le_bytes(data[4..6].try_into().expect("consideration width"));
        let flags = data[6];
        Ok(Self {
            order,
            consideration,
            solved: flags & FLAG_SOLVED != 0,
            touched: flags & FLAG_TOUCHED != 0,
        })
    }
}
