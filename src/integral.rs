//! Integral identities.
//!
//! An [`Integral`] names one unknown of the linear system: a prototype tag
//! plus an ordered sequence of signed integer powers. Two encodings exist:
//!
//! - text: `PR<prototype>(p1,p2,…,pN)`
//! - binary: the ASCII prefix `PR<prototype>\0` followed by one
//!   little-endian [`Power`] per exponent.
//!
//! The binary form is the store key under which a row is filed; the text
//! form appears in driver input and output.

use anyhow::{Context, Result, bail};

/// Width of a single exponent in the binary encoding.
pub type Power = i32;

/// Prototype (topology) tag.
pub type Prototype = u32;

/// Dense per-run identity assigned by the integral manager.
pub type Component = u32;

/// One unknown: prototype tag plus exponent vector. Equality is structural.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Integral {
    prototype: Prototype,
    powers: Vec<Power>,
}

impl Integral {
    #[must_use]
    pub fn new(prototype: Prototype, powers: Vec<Power>) -> Self {
        Self { prototype, powers }
    }

    #[must_use]
    pub fn prototype(&self) -> Prototype {
        self.prototype
    }

    #[must_use]
    pub fn powers(&self) -> &[Power] {
        &self.powers
    }

    /// Parse the canonical text form `PR<prototype>(p1,…,pN)`.
    pub fn from_string(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix("PR")
            .with_context(|| format!("integral `{s}` does not start with PR"))?;

        let open = rest
            .find('(')
            .with_context(|| format!("integral `{s}` has no power list"))?;
        let close = rest
            .rfind(')')
            .with_context(|| format!("integral `{s}` has no closing parenthesis"))?;
        if close < open {
            bail!("integral `{s}` has mismatched parentheses");
        }

        let prototype: Prototype = rest[..open]
            .parse()
            .with_context(|| format!("bad prototype in `{s}`"))?;

        let body = &rest[open + 1..close];
        let mut powers = Vec::new();
        if !body.trim().is_empty() {
            for part in body.split(',') {
                let p: Power = part
                    .trim()
                    .parse()
                    .with_context(|| format!("bad power `{part}` in `{s}`"))?;
                powers.push(p);
            }
        }

        Ok(Self { prototype, powers })
    }

    /// Canonical text form.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = format!("PR{}(", self.prototype);
        for (j, p) in self.powers.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            out.push_str(&p.to_string());
        }
        out.push(')');
        out
    }

    /// Binary key form: `PR<prototype>\0` + little-endian powers.
    #[must_use]
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = format!("PR{}", self.prototype).into_bytes();
        out.push(0);
        for p in &self.powers {
            out.extend_from_slice(&p.to_le_bytes());
        }
        out
    }

    /// Decode the binary key form.
    pub fn from_binary(data: &[u8]) -> Result<Self> {
        let nul = data
            .iter()
            .position(|&b| b == 0)
            .context("integral key has no prototype terminator")?;
        let prefix =
            std::str::from_utf8(&data[..nul]).context("integral prototype is not ASCII")?;
        let prototype: Prototype = prefix
            .strip_prefix("PR")
            .with_context(|| format!("integral key `{prefix}` does not start with PR"))?
            .parse()
            .with_context(|| format!("bad prototype in key `{prefix}`"))?;

        let body = &data[nul + 1..];
        let width = size_of::<Power>();
        if body.len() % width != 0 {
            bail!("integral key has a truncated power list");
        }

        let powers = body
            .chunks_exact(width)
            .map(|c| Power::from_le_bytes(c.try_into().expect("chunk width")))
            .collect();

        Ok(Self { prototype, powers })
    }
}

impl std::fmt::Display for Integral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_text())
    }
}
