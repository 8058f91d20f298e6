//! The decoded instruction and operand model.
//!
//! An [`Assembly`] is the operand-level view of one decoded instruction, and
//! an [`InstructionSemantic`] classifies what the instruction means to the
//! rest of the toolkit: most instructions are isolated, some carry a link to
//! another analyzed entity, and some are not instructions at all but literal
//! data words embedded in code.

use bad64::{Op, Reg};

use crate::chunk::Link;
use crate::error::{Error, Result};
use crate::tree::ShiftKind;

pub mod disasm;

/// A memory operand: base register, optional index register, displacement.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemOperand {
    pub base: Reg,
    pub index: Option<Reg>,
    pub disp: i64,
}

/// One decoded operand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OperandKind {
    Reg(Reg),
    Imm(i64),
    Mem(MemOperand),
    /// System registers, conditions and other operands the analysis never
    /// inspects directly.
    Other,
}

/// An operand together with its shift/extend decoration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AsmOperand {
    kind: OperandKind,
    shift: (ShiftKind, u32),
}

impl AsmOperand {
    pub fn new(kind: OperandKind) -> AsmOperand {
        AsmOperand {
            kind,
            shift: (ShiftKind::Invalid, 0),
        }
    }

    pub fn with_shift(kind: OperandKind, shift: (ShiftKind, u32)) -> AsmOperand {
        AsmOperand { kind, shift }
    }

    pub fn kind(&self) -> &OperandKind {
        &self.kind
    }

    pub fn shift(&self) -> (ShiftKind, u32) {
        self.shift
    }
}

/// The operand-shape of an instruction, used to pick a fill strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandMode {
    Reg,
    Imm,
    RegReg,
    RegImm,
    RegRegReg,
    RegRegImm,
    RegMem,
    RegMemImm,
    RegRegMem,
    RegRegMemImm,
    Other,
}

/// Base-register write-back behavior of a memory operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Writeback {
    None,
    Pre,
    Post,
}

/// The operand list of a decoded instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct AsmOperands {
    mode: OperandMode,
    operands: Vec<AsmOperand>,
    writeback: Writeback,
}

impl AsmOperands {
    pub fn new(mode: OperandMode, operands: Vec<AsmOperand>, writeback: Writeback) -> AsmOperands {
        AsmOperands {
            mode,
            operands,
            writeback,
        }
    }

    pub fn mode(&self) -> OperandMode {
        self.mode
    }

    pub fn operands(&self) -> &[AsmOperand] {
        &self.operands
    }

    pub fn is_pre_index(&self) -> bool {
        self.writeback == Writeback::Pre
    }

    pub fn is_post_index(&self) -> bool {
        self.writeback == Writeback::Post
    }

    fn operand(&self, index: usize) -> Result<&AsmOperand> {
        self.operands
            .get(index)
            .ok_or_else(|| Error::MalformedOperands(format!("no operand {}", index)))
    }

    /// The register operand at `index`.
    pub fn reg(&self, index: usize) -> Result<Reg> {
        match self.operand(index)?.kind() {
            OperandKind::Reg(reg) => Ok(*reg),
            kind => Err(Error::MalformedOperands(format!(
                "operand {} is {:?}, expected register",
                index, kind
            ))),
        }
    }

    /// The immediate operand at `index`.
    pub fn imm(&self, index: usize) -> Result<i64> {
        match self.operand(index)?.kind() {
            OperandKind::Imm(imm) => Ok(*imm),
            kind => Err(Error::MalformedOperands(format!(
                "operand {} is {:?}, expected immediate",
                index, kind
            ))),
        }
    }

    /// The memory operand at `index`.
    pub fn mem(&self, index: usize) -> Result<MemOperand> {
        match self.operand(index)?.kind() {
            OperandKind::Mem(mem) => Ok(*mem),
            kind => Err(Error::MalformedOperands(format!(
                "operand {} is {:?}, expected memory",
                index, kind
            ))),
        }
    }

    /// The shift decoration of the operand at `index`, `Invalid` if absent.
    pub fn shift(&self, index: usize) -> (ShiftKind, u32) {
        self.operands
            .get(index)
            .map(|operand| operand.shift())
            .unwrap_or((ShiftKind::Invalid, 0))
    }
}

/// The operand-level view of one decoded instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Assembly {
    id: Op,
    mnemonic: String,
    bytes: Vec<u8>,
    operands: AsmOperands,
}

impl Assembly {
    pub fn new(id: Op, mnemonic: String, bytes: Vec<u8>, operands: AsmOperands) -> Assembly {
        Assembly {
            id,
            mnemonic,
            bytes,
            operands,
        }
    }

    /// The opcode id, the key of the use-def handler table.
    pub fn id(&self) -> Op {
        self.id
    }

    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// The raw encoding, least significant byte first.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn operands(&self) -> &AsmOperands {
        &self.operands
    }
}

/// What a decoded instruction means to the toolkit.
#[derive(Clone, Debug)]
pub enum InstructionSemantic {
    /// Bytes that could not (or need not) be decoded.
    Raw { bytes: Vec<u8> },
    /// An instruction with no cross-reference.
    Isolated { assembly: Assembly },
    /// An instruction one of whose operands refers to another chunk.
    Linked {
        assembly: Assembly,
        link: Link,
        index: u8,
    },
    /// A direct branch or call.
    ControlFlow { assembly: Assembly, link: Link },
    Return { assembly: Assembly },
    IndirectJump { assembly: Assembly },
    IndirectCall { assembly: Assembly },
    /// A stack-frame setup instruction (not produced for AArch64).
    StackFrame { assembly: Assembly },
    /// A non-executable data word embedded in code.
    Literal { bytes: Vec<u8> },
    /// A data word whose value is a cross-reference.
    LinkedLiteral { bytes: Vec<u8>, link: Link },
}

impl InstructionSemantic {
    /// The decoded assembly, absent for raw bytes and literals.
    pub fn assembly(&self) -> Option<&Assembly> {
        match self {
            InstructionSemantic::Isolated { assembly }
            | InstructionSemantic::Linked { assembly, .. }
            | InstructionSemantic::ControlFlow { assembly, .. }
            | InstructionSemantic::Return { assembly }
            | InstructionSemantic::IndirectJump { assembly }
            | InstructionSemantic::IndirectCall { assembly }
            | InstructionSemantic::StackFrame { assembly } => Some(assembly),
            InstructionSemantic::Raw { .. }
            | InstructionSemantic::Literal { .. }
            | InstructionSemantic::LinkedLiteral { .. } => None,
        }
    }

    /// The raw bytes this semantic serializes as.
    pub fn bytes(&self) -> &[u8] {
        match self {
            InstructionSemantic::Raw { bytes }
            | InstructionSemantic::Literal { bytes }
            | InstructionSemantic::LinkedLiteral { bytes, .. } => bytes,
            semantic => semantic
                .assembly()
                .map(|assembly| assembly.bytes())
                .unwrap_or(&[]),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes().len()
    }

    /// The attached link, if this semantic carries one.
    pub fn link(&self) -> Option<&Link> {
        match self {
            InstructionSemantic::Linked { link, .. }
            | InstructionSemantic::ControlFlow { link, .. }
            | InstructionSemantic::LinkedLiteral { link, .. } => Some(link),
            _ => None,
        }
    }

    pub fn set_link(&mut self, new: Link) {
        match self {
            InstructionSemantic::Linked { link, .. }
            | InstructionSemantic::ControlFlow { link, .. }
            | InstructionSemantic::LinkedLiteral { link, .. } => *link = new,
            _ => {}
        }
    }

    /// True for data words the use-def analysis must skip.
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            InstructionSemantic::Literal { .. } | InstructionSemantic::LinkedLiteral { .. }
        )
    }
}
