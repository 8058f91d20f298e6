//! Symbolic expression trees.
//!
//! Trees represent the values instructions compute: constants, program
//! addresses, physical registers, dereferences, arithmetic, shifts and
//! comparisons. All nodes are allocated by a [`TreeFactory`], which owns them
//! for the lifetime of an analysis session; everything else passes around
//! copyable [`TreeRef`] handles. Trees are immutable once built and equality
//! on them is structural.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::arch::aarch64::RegId;
use crate::error::{Error, Result};

mod location;

pub use self::location::MemLocation;

/// A non-owning handle to a tree node inside a [`TreeFactory`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TreeRef(u32);

/// A symbolic expression tree node.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Tree {
    /// An integer constant.
    Const(i64),
    /// An absolute program address constant.
    Addr(i64),
    /// A physical register with its access width in bytes.
    PhysReg { reg: RegId, width: usize },
    Add(TreeRef, TreeRef),
    Sub(TreeRef, TreeRef),
    And(TreeRef, TreeRef),
    LogicalShiftLeft(TreeRef, TreeRef),
    LogicalShiftRight(TreeRef, TreeRef),
    ArithmeticShiftRight(TreeRef, TreeRef),
    RotateRight(TreeRef, TreeRef),
    /// A memory load of `width` bytes at the address `addr` evaluates to.
    Deref { addr: TreeRef, width: usize },
    /// A comparison producing the conceptual condition-flags value.
    Compare(TreeRef, TreeRef),
}

/// The arena that owns every tree node of an analysis session.
///
/// Handles become invalid when the factory is dropped. The factory does not
/// intern; structurally equal trees may live at distinct handles.
#[derive(Clone, Debug, Default)]
pub struct TreeFactory {
    nodes: Vec<Tree>,
}

impl TreeFactory {
    pub fn new() -> TreeFactory {
        TreeFactory { nodes: Vec::new() }
    }

    fn make(&mut self, tree: Tree) -> TreeRef {
        let reference = TreeRef(self.nodes.len() as u32);
        self.nodes.push(tree);
        reference
    }

    /// The node a handle refers to.
    pub fn get(&self, tree: TreeRef) -> &Tree {
        &self.nodes[tree.0 as usize]
    }

    pub fn constant(&mut self, value: i64) -> TreeRef {
        self.make(Tree::Const(value))
    }

    pub fn address(&mut self, value: i64) -> TreeRef {
        self.make(Tree::Addr(value))
    }

    pub fn phys_reg(&mut self, reg: RegId, width: usize) -> TreeRef {
        self.make(Tree::PhysReg { reg, width })
    }

    pub fn add(&mut self, lhs: TreeRef, rhs: TreeRef) -> TreeRef {
        self.make(Tree::Add(lhs, rhs))
    }

    pub fn sub(&mut self, lhs: TreeRef, rhs: TreeRef) -> TreeRef {
        self.make(Tree::Sub(lhs, rhs))
    }

    pub fn and(&mut self, lhs: TreeRef, rhs: TreeRef) -> TreeRef {
        self.make(Tree::And(lhs, rhs))
    }

    pub fn logical_shift_left(&mut self, lhs: TreeRef, rhs: TreeRef) -> TreeRef {
        self.make(Tree::LogicalShiftLeft(lhs, rhs))
    }

    pub fn logical_shift_right(&mut self, lhs: TreeRef, rhs: TreeRef) -> TreeRef {
        self.make(Tree::LogicalShiftRight(lhs, rhs))
    }

    pub fn arithmetic_shift_right(&mut self, lhs: TreeRef, rhs: TreeRef) -> TreeRef {
        self.make(Tree::ArithmeticShiftRight(lhs, rhs))
    }

    pub fn rotate_right(&mut self, lhs: TreeRef, rhs: TreeRef) -> TreeRef {
        self.make(Tree::RotateRight(lhs, rhs))
    }

    pub fn deref(&mut self, addr: TreeRef, width: usize) -> TreeRef {
        self.make(Tree::Deref { addr, width })
    }

    pub fn compare(&mut self, lhs: TreeRef, rhs: TreeRef) -> TreeRef {
        self.make(Tree::Compare(lhs, rhs))
    }

    /// Structural equality between two trees.
    pub fn structural_eq(&self, lhs: TreeRef, rhs: TreeRef) -> bool {
        if lhs == rhs {
            return true;
        }
        match (self.get(lhs), self.get(rhs)) {
            (Tree::Const(a), Tree::Const(b)) => a == b,
            (Tree::Addr(a), Tree::Addr(b)) => a == b,
            (
                Tree::PhysReg { reg: r0, width: w0 },
                Tree::PhysReg { reg: r1, width: w1 },
            ) => r0 == r1 && w0 == w1,
            (Tree::Add(a0, a1), Tree::Add(b0, b1))
            | (Tree::Sub(a0, a1), Tree::Sub(b0, b1))
            | (Tree::And(a0, a1), Tree::And(b0, b1))
            | (Tree::LogicalShiftLeft(a0, a1), Tree::LogicalShiftLeft(b0, b1))
            | (Tree::LogicalShiftRight(a0, a1), Tree::LogicalShiftRight(b0, b1))
            | (Tree::ArithmeticShiftRight(a0, a1), Tree::ArithmeticShiftRight(b0, b1))
            | (Tree::RotateRight(a0, a1), Tree::RotateRight(b0, b1))
            | (Tree::Compare(a0, a1), Tree::Compare(b0, b1)) => {
                self.structural_eq(*a0, *b0) && self.structural_eq(*a1, *b1)
            }
            (
                Tree::Deref { addr: a, width: w0 },
                Tree::Deref { addr: b, width: w1 },
            ) => w0 == w1 && self.structural_eq(*a, *b),
            _ => false,
        }
    }

    /// A displayable rendering of a tree, for logs and error messages.
    pub fn display(&self, tree: TreeRef) -> TreeDisplay {
        TreeDisplay {
            factory: self,
            tree,
        }
    }
}

/// Displays a tree in infix form, e.g. `(R31 + -16)`.
pub struct TreeDisplay<'f> {
    factory: &'f TreeFactory,
    tree: TreeRef,
}

impl<'f> fmt::Display for TreeDisplay<'f> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let d = |t| self.factory.display(t);
        match self.factory.get(self.tree) {
            Tree::Const(v) => write!(f, "{:#x}", v),
            Tree::Addr(v) => write!(f, "addr {:#x}", v),
            Tree::PhysReg { reg, width } => write!(f, "R{}:{}", reg, width),
            Tree::Add(l, r) => write!(f, "({} + {})", d(*l), d(*r)),
            Tree::Sub(l, r) => write!(f, "({} - {})", d(*l), d(*r)),
            Tree::And(l, r) => write!(f, "({} & {})", d(*l), d(*r)),
            Tree::LogicalShiftLeft(l, r) => write!(f, "({} << {})", d(*l), d(*r)),
            Tree::LogicalShiftRight(l, r) => write!(f, "({} >>l {})", d(*l), d(*r)),
            Tree::ArithmeticShiftRight(l, r) => write!(f, "({} >>a {})", d(*l), d(*r)),
            Tree::RotateRight(l, r) => write!(f, "({} ror {})", d(*l), d(*r)),
            Tree::Deref { addr, width } => write!(f, "*{}({})", width, d(*addr)),
            Tree::Compare(l, r) => write!(f, "({} cmp {})", d(*l), d(*r)),
        }
    }
}

/// An operand shift/extend kind.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ShiftKind {
    Invalid,
    Lsl,
    Lsr,
    Asr,
    Ror,
    Msl,
}

/// Wraps `tree` in the shift node `kind` describes.
///
/// `Invalid` is the identity. `Msl` is declared unsupported and is a hard
/// error.
pub fn shift_extend(
    trees: &mut TreeFactory,
    tree: TreeRef,
    kind: ShiftKind,
    value: u32,
) -> Result<TreeRef> {
    let tree = match kind {
        ShiftKind::Lsl => {
            let amount = trees.constant(i64::from(value));
            trees.logical_shift_left(tree, amount)
        }
        ShiftKind::Lsr => {
            let amount = trees.constant(i64::from(value));
            trees.logical_shift_right(tree, amount)
        }
        ShiftKind::Asr => {
            let amount = trees.constant(i64::from(value));
            trees.arithmetic_shift_right(tree, amount)
        }
        ShiftKind::Ror => {
            let amount = trees.constant(i64::from(value));
            trees.rotate_right(tree, amount)
        }
        ShiftKind::Msl => return Err(Error::UnsupportedShift("msl".to_string())),
        ShiftKind::Invalid => tree,
    };
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality() {
        let mut trees = TreeFactory::new();
        let sp0 = trees.phys_reg(31, 8);
        let sp1 = trees.phys_reg(31, 8);
        let c0 = trees.constant(-16);
        let c1 = trees.constant(-16);
        let a0 = trees.add(sp0, c0);
        let a1 = trees.add(sp1, c1);
        assert!(trees.structural_eq(a0, a1));

        let c2 = trees.constant(8);
        let a2 = trees.add(sp0, c2);
        assert!(!trees.structural_eq(a0, a2));

        let addr = trees.address(-16);
        assert!(!trees.structural_eq(c0, addr));
    }

    #[test]
    fn shift_extend_invalid_is_identity() {
        let mut trees = TreeFactory::new();
        let reg = trees.phys_reg(0, 8);
        let shifted = shift_extend(&mut trees, reg, ShiftKind::Invalid, 12).unwrap();
        assert_eq!(shifted, reg);
    }

    #[test]
    fn shift_extend_wraps() {
        let mut trees = TreeFactory::new();
        let reg = trees.phys_reg(2, 8);
        let shifted = shift_extend(&mut trees, reg, ShiftKind::Lsl, 3).unwrap();
        match trees.get(shifted) {
            Tree::LogicalShiftLeft(lhs, rhs) => {
                assert_eq!(*lhs, reg);
                assert_eq!(trees.get(*rhs), &Tree::Const(3));
            }
            tree => panic!("expected shift node, got {:?}", tree),
        }
    }

    #[test]
    fn shift_extend_msl_errors() {
        let mut trees = TreeFactory::new();
        let reg = trees.phys_reg(2, 8);
        assert!(shift_extend(&mut trees, reg, ShiftKind::Msl, 8).is_err());
    }
}
