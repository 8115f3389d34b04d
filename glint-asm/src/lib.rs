//! Bytecode instruction set of the Glint virtual machine.
//!
//! This crate is pure data: the opcode set, the wire representation of an
//! instruction, and the compressed source-line table carried by function
//! prototypes. It knows nothing about values or the heap so that both the
//! interpreter and the compiler can depend on it without cycles.

#![cfg_attr(docsrs, feature(doc_cfg))]

mod instruction;
mod line;
mod opcode;

pub use instruction::Instruction;
pub use line::{LineEntry, LineTable};
pub use opcode::{Opcode, OperandKind};

/// Register operand. Non-negative indices address frame locals; negative
/// indices address the call frame: `-1` is the self slot, `-2` the target
/// slot and `-3 - n` the n-th argument.
pub type Reg = i32;

/// Immediate operand.
pub type Imm = i32;

/// Relative jump operand, in instructions from the next instruction.
pub type Rel = i32;

/// Bytecode position.
pub type Pos = u32;

/// Sentinel for "no bytecode position".
pub const NO_POS: Pos = u32::MAX;

/// Self slot register index.
pub const REG_SELF: Reg = -1;

/// Target (callee function) slot register index.
pub const REG_TARGET: Reg = -2;

/// Register index of the n-th argument.
pub const fn reg_arg(n: u32) -> Reg {
    -3 - n as Reg
}

/// Slot count a call frame occupies above the argument window.
pub const FRAME_SIZE: usize = 3;
