//! Memory-location canonicalization.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::arch::aarch64::RegId;

use super::{Tree, TreeFactory, TreeRef};

/// The canonical form of a memory address tree.
///
/// An address tree of the shape `Add(X, Y)` or a bare `X` canonicalizes to a
/// base register plus a constant offset: each `Const` child accumulates into
/// the offset and each `PhysReg` child becomes the base. Any other shape is
/// an opaque location.
///
/// Two canonical locations are equal iff their bases agree (both absent
/// allowed) and their offsets agree. An opaque location compares equal to
/// nothing, not even itself.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub enum MemLocation {
    Canonical {
        base: Option<(RegId, usize)>,
        offset: i64,
    },
    Opaque,
}

impl MemLocation {
    /// Canonicalizes a memory address tree.
    ///
    /// The decomposition is shallow: nested arithmetic inside the address is
    /// not simplified and makes the location opaque.
    pub fn new(trees: &TreeFactory, place: TreeRef) -> MemLocation {
        let mut base = None;
        let mut offset = 0i64;

        let mut fold = |tree: &Tree| -> bool {
            match tree {
                Tree::Const(value) => {
                    offset += value;
                    true
                }
                Tree::PhysReg { reg, width } => {
                    base = Some((*reg, *width));
                    true
                }
                _ => false,
            }
        };

        let ok = match trees.get(place) {
            Tree::Add(lhs, rhs) => fold(trees.get(*lhs)) && fold(trees.get(*rhs)),
            tree => fold(tree),
        };

        if ok {
            MemLocation::Canonical { base, offset }
        } else {
            MemLocation::Opaque
        }
    }
}

impl PartialEq for MemLocation {
    fn eq(&self, other: &MemLocation) -> bool {
        match (self, other) {
            (
                MemLocation::Canonical {
                    base: b0,
                    offset: o0,
                },
                MemLocation::Canonical {
                    base: b1,
                    offset: o1,
                },
            ) => b0 == b1 && o0 == o1,
            _ => false,
        }
    }
}

impl fmt::Display for MemLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemLocation::Canonical {
                base: Some((reg, _)),
                offset,
            } => write!(f, "[R{} {:+#x}]", reg, offset),
            MemLocation::Canonical { base: None, offset } => write!(f, "[{:#x}]", offset),
            MemLocation::Opaque => write!(f, "[opaque]"),
        }
    }
}
