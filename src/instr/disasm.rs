//! bad64-based instruction decoding.
//!
//! This is the bridge the archive codec and loaders use to rebuild
//! [`InstructionSemantic`]s from raw bytes. Decoding is delegated entirely to
//! `bad64`; this module only reshapes the decoder's operand list into the
//! [`AsmOperands`] model and classifies the opcode into a semantic variant.

use bad64::{Imm, Op, Operand, Shift};

use crate::chunk::Link;
use crate::error::{Error, Result};
use crate::tree::ShiftKind;

use super::{
    AsmOperand, AsmOperands, Assembly, InstructionSemantic, MemOperand, OperandKind, OperandMode,
    Writeback,
};

fn imm_value(imm: &Imm) -> i64 {
    match imm {
        Imm::Signed(value) => *value,
        Imm::Unsigned(value) => *value as i64,
    }
}

fn convert_shift(shift: &Shift) -> (ShiftKind, u32) {
    match shift {
        Shift::LSL(value) => (ShiftKind::Lsl, *value),
        Shift::LSR(value) => (ShiftKind::Lsr, *value),
        Shift::ASR(value) => (ShiftKind::Asr, *value),
        Shift::ROR(value) => (ShiftKind::Ror, *value),
        Shift::MSL(value) => (ShiftKind::Msl, *value),
        // Register extends are not modeled as shifts.
        _ => (ShiftKind::Invalid, 0),
    }
}

fn convert_operands(decoded: &bad64::Instruction) -> AsmOperands {
    let mut operands = Vec::new();
    let mut writeback = Writeback::None;

    for operand in decoded.operands() {
        match operand {
            Operand::Reg { reg, .. } => {
                operands.push(AsmOperand::new(OperandKind::Reg(*reg)));
            }
            Operand::ShiftReg { reg, shift } => {
                operands.push(AsmOperand::with_shift(
                    OperandKind::Reg(*reg),
                    convert_shift(shift),
                ));
            }
            Operand::Imm32 { imm, shift } | Operand::Imm64 { imm, shift } => {
                let shift = shift
                    .as_ref()
                    .map(|shift| convert_shift(shift))
                    .unwrap_or((ShiftKind::Invalid, 0));
                operands.push(AsmOperand::with_shift(
                    OperandKind::Imm(imm_value(imm)),
                    shift,
                ));
            }
            Operand::Label(imm) => {
                operands.push(AsmOperand::new(OperandKind::Imm(imm_value(imm))));
            }
            Operand::MemReg(reg) => {
                operands.push(AsmOperand::new(OperandKind::Mem(MemOperand {
                    base: *reg,
                    index: None,
                    disp: 0,
                })));
            }
            Operand::MemOffset { reg, offset, .. } => {
                operands.push(AsmOperand::new(OperandKind::Mem(MemOperand {
                    base: *reg,
                    index: None,
                    disp: imm_value(offset),
                })));
            }
            Operand::MemPreIdx { reg, imm } => {
                writeback = Writeback::Pre;
                operands.push(AsmOperand::new(OperandKind::Mem(MemOperand {
                    base: *reg,
                    index: None,
                    disp: imm_value(imm),
                })));
            }
            Operand::MemPostIdxImm { reg, imm } => {
                // Post-index: the access happens at the unmodified base and
                // the displacement reappears as a trailing immediate operand.
                writeback = Writeback::Post;
                operands.push(AsmOperand::new(OperandKind::Mem(MemOperand {
                    base: *reg,
                    index: None,
                    disp: 0,
                })));
                operands.push(AsmOperand::new(OperandKind::Imm(imm_value(imm))));
            }
            Operand::MemPostIdxReg(regs) => {
                writeback = Writeback::Post;
                operands.push(AsmOperand::new(OperandKind::Mem(MemOperand {
                    base: regs[0],
                    index: None,
                    disp: 0,
                })));
                operands.push(AsmOperand::new(OperandKind::Reg(regs[1])));
            }
            Operand::MemExt { regs, shift, .. } => {
                let shift = shift
                    .as_ref()
                    .map(|shift| convert_shift(shift))
                    .unwrap_or((ShiftKind::Invalid, 0));
                operands.push(AsmOperand::with_shift(
                    OperandKind::Mem(MemOperand {
                        base: regs[0],
                        index: Some(regs[1]),
                        disp: 0,
                    }),
                    shift,
                ));
            }
            _ => operands.push(AsmOperand::new(OperandKind::Other)),
        }
    }

    let mode = infer_mode(&operands);
    AsmOperands::new(mode, operands, writeback)
}

fn infer_mode(operands: &[AsmOperand]) -> OperandMode {
    use OperandKind::{Imm, Mem, Reg};

    let kinds: Vec<u8> = operands
        .iter()
        .map(|operand| match operand.kind() {
            Reg(_) => b'r',
            Imm(_) => b'i',
            Mem(_) => b'm',
            _ => b'?',
        })
        .collect();

    match kinds.as_slice() {
        b"r" => OperandMode::Reg,
        b"i" => OperandMode::Imm,
        b"rr" => OperandMode::RegReg,
        b"ri" => OperandMode::RegImm,
        b"rrr" => OperandMode::RegRegReg,
        b"rri" => OperandMode::RegRegImm,
        b"rm" => OperandMode::RegMem,
        b"rmi" => OperandMode::RegMemImm,
        b"rrm" => OperandMode::RegRegMem,
        b"rrmi" => OperandMode::RegRegMemImm,
        _ => OperandMode::Other,
    }
}

#[rustfmt::skip]
fn is_direct_branch(op: Op) -> bool {
    matches!(op,
        Op::B | Op::BL
        | Op::B_AL | Op::B_CC | Op::B_CS | Op::B_EQ | Op::B_GE | Op::B_GT
        | Op::B_HI | Op::B_LE | Op::B_LS | Op::B_LT | Op::B_MI | Op::B_NE
        | Op::B_NV | Op::B_PL | Op::B_VC | Op::B_VS
        | Op::CBZ | Op::CBNZ | Op::TBZ | Op::TBNZ)
}

/// True for direct branches that may also fall through.
///
/// The AL and NV condition encodings are always taken, so they sit with
/// `B` on the unconditional side.
#[rustfmt::skip]
pub fn is_conditional_branch(op: Op) -> bool {
    matches!(op,
        Op::B_CC | Op::B_CS | Op::B_EQ | Op::B_GE | Op::B_GT
        | Op::B_HI | Op::B_LE | Op::B_LS | Op::B_LT | Op::B_MI | Op::B_NE
        | Op::B_PL | Op::B_VC | Op::B_VS
        | Op::CBZ | Op::CBNZ | Op::TBZ | Op::TBNZ)
}

fn branch_target(decoded: &bad64::Instruction) -> Option<u64> {
    decoded.operands().iter().find_map(|operand| match operand {
        Operand::Label(imm) => Some(imm_value(imm) as u64),
        _ => None,
    })
}

/// Decodes one instruction and classifies it into a semantic.
///
/// Direct branches come back as control flow semantics carrying an
/// [`Link::Unresolved`] placeholder at the decoded target; the resolver
/// upgrades these later.
pub fn disassemble(bytes: &[u8], address: u64) -> Result<InstructionSemantic> {
    let encoding = match *bytes {
        [b0, b1, b2, b3] => u32::from_le_bytes([b0, b1, b2, b3]),
        _ => return Err(Error::DisassemblyFailure),
    };

    let decoded = bad64::decode(encoding, address)?;
    let assembly = Assembly::new(
        decoded.op(),
        decoded.op().to_string(),
        bytes.to_vec(),
        convert_operands(&decoded),
    );

    let semantic = match decoded.op() {
        op if is_direct_branch(op) => {
            let target = branch_target(&decoded).unwrap_or(address);
            InstructionSemantic::ControlFlow {
                assembly,
                link: Link::Unresolved { address: target },
            }
        }
        Op::RET => InstructionSemantic::Return { assembly },
        Op::BR => InstructionSemantic::IndirectJump { assembly },
        Op::BLR => InstructionSemantic::IndirectCall { assembly },
        _ => InstructionSemantic::Isolated { assembly },
    };

    Ok(semantic)
}
