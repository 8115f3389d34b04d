//! IR instructions: opcodes, flags and the per-opcode typing rules.

use glint_asm::Pos;
use glint_vm::types::Ty;

use crate::entities::{Block, ValueRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// IR opcode.
pub enum IrOp {
    /// Reads a frame slot; operand: `I32` slot index (negative for the
    /// calling convention slots).
    LoadLocal,
    /// Writes a frame slot; operands: slot index constant, value.
    StoreLocal,
    /// Allocates an array; operand: reserve count.
    ArrayNew,
    /// Allocates a table; operand: reserve count.
    TableNew,
    /// Container read; operands: raw flag, container, key.
    FieldGet,
    /// Container write; operands: raw flag, container, key, value.
    FieldSet,
    /// Unary operator; operands: `Vmop` constant, value.
    Unop,
    /// Binary operator; operands: `Vmop` constant, lhs, rhs.
    Binop,
    /// Bitwise and over booleans/integers.
    BoolAnd,
    /// Bitwise or.
    BoolOr,
    /// Bitwise xor.
    BoolXor,
    /// Collector yield point.
    GcTick,
    /// Upvalue read; operands: function, index.
    UvalGet,
    /// Upvalue write; operands: function, index, value.
    UvalSet,
    /// Type-guarded reinterpretation; operands: value, `Dty` constant.
    AssumeCast,
    /// Truthiness coercion.
    CoerceBool,
    /// Register copy, used for phi lowering.
    Move,
    /// Boxes a typed value back to `any`, used for phi lowering.
    EraseType,
    /// Runtime type test; operands: value, `Vty` constant.
    TestType,
    /// Comparison; operands: `Vmop` constant, lhs, rhs.
    Compare,
    /// Conditional move; operands: condition, on-true, on-false.
    Select,
    /// SSA merge; one operand per predecessor.
    Phi,
    /// Writes the last-exception slot.
    SetException,
    /// Reads the last-exception slot.
    GetException,
    /// Direct call to a native helper; operands: `Native` constant,
    /// overload index, arguments.
    Ccall,
    /// Virtual call; operands: target, self, arguments.
    Vcall,
    /// Polymorphic length.
    Vlen,
    /// Polymorphic duplication.
    Vdup,
    /// Polymorphic concatenation.
    Vjoin,
    /// Polymorphic membership test.
    Vin,
    /// Number of varargs in the frame.
    VaCount,
    /// Indexed vararg read.
    VaGet,
    /// Unconditional branch; operand: `Block` constant.
    Jmp,
    /// Conditional branch; operands: condition, true `Block`, false `Block`.
    Jcc,
    /// Procedure return; operand: value.
    Ret,
    /// Deoptimization sink: reaching it means a specialization assumption
    /// was violated.
    Unreachable,
}

impl IrOp {
    /// Whether the opcode terminates a basic block.
    pub const fn is_terminator(self) -> bool {
        matches!(self, Self::Jmp | Self::Jcc | Self::Ret | Self::Unreachable)
    }

    /// Whether the opcode terminates the procedure.
    pub const fn is_proc_terminator(self) -> bool {
        matches!(self, Self::Ret | Self::Unreachable)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// Behavior bits of an instruction, derived by [`update`]
    /// (crate::proc::Procedure::update).
    pub struct InsnFlags: u8 {
        /// Same operands produce the same result absent intervening side
        /// effects.
        const PURE = 1 << 0;
        /// Pure and additionally independent of side effects.
        const CONST = 1 << 1;
        /// Must not be discarded even when unused.
        const SIDE_EFFECT = 1 << 2;
        /// User-pinned; no optimizer may touch it.
        const VOLATILE = 1 << 3;
    }
}

#[derive(Debug, Clone)]
/// Instruction payload inside the procedure arena.
pub struct InsnData {
    /// Opcode.
    pub op: IrOp,
    /// Result type.
    pub vt: Ty,
    /// Behavior bits.
    pub flags: InsnFlags,
    /// Originating bytecode position.
    pub bc_pos: Pos,
    /// Owning block; `None` for orphans.
    pub block: Option<Block>,
    /// SSA name, for printing.
    pub name: u32,
    /// Operand list; every entry is a use.
    pub operands: Vec<ValueRef>,
}

impl InsnData {
    /// Whether the instruction is free of side effects.
    pub fn is_pure(&self) -> bool {
        self.flags.contains(InsnFlags::PURE)
    }

    /// Whether the instruction is constant-foldable across side effects.
    pub fn is_const(&self) -> bool {
        self.flags.contains(InsnFlags::CONST)
    }

    /// Whether discarding the instruction would lose behavior.
    pub fn has_side_effect(&self) -> bool {
        self.flags.contains(InsnFlags::SIDE_EFFECT)
    }

    /// Whether the optimizer must leave the instruction alone.
    pub fn is_volatile(&self) -> bool {
        self.flags.contains(InsnFlags::VOLATILE)
    }
}
