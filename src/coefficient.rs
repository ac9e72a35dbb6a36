//! Opaque coefficient values.
//!
//! A [`Coefficient`] is an immutable byte blob holding the textual form of a
//! symbolic expression (e.g. `ep*x/5+2`). The solver core never interprets
//! the contents beyond the two trivial predicates [`Coefficient::is_zero`]
//! and [`Coefficient::is_one`]; all arithmetic happens in the external
//! algebra helper.

use std::fmt;
use std::sync::Arc;

/// Immutable textual coefficient.
///
/// Cloning is cheap: the payload is shared behind an `Arc`, which also lets
/// an evicted cache slot drop its reference while a reader still holds one.
#[derive(Clone, PartialEq, Eq)]
pub struct Coefficient {
    bytes: Arc<[u8]>,
}

impl Coefficient {
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: Arc::from(bytes),
        }
    }

    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self {
            bytes: Arc::from(s.into().into_bytes().into_boxed_slice()),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Payload size in bytes, the unit of the cache budget.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.bytes.as_ref() == b"0"
    }

    #[must_use]
    pub fn is_one(&self) -> bool {
        self.bytes.as_ref() == b"1"
    }
}

impl fmt::Display for Coefficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}

impl fmt::Debug for Coefficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coefficient({self})")
    }
}

impl From<&str> for Coefficient {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}
