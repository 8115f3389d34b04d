use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// Opcode set of the register machine.
///
/// Every instruction is `{opcode, a, b, c}` with three typed operands; the
/// extended form overlays `b:c` as a single 64-bit immediate (`xmm`). Operand
/// kinds per opcode are described by [`Opcode::operands`].
pub enum Opcode {
    /// Undefined. Executing it is a bug in the emitter.
    UD = 0x00,
    /// No-op.
    NOP = 0x01,

    /// `A = !B`.
    LNOT = 0x02,
    /// `A = -B`.
    ANEG = 0x03,
    /// `A = B`.
    MOV = 0x04,

    /// `A = B + C`.
    AADD = 0x05,
    /// `A = B - C`.
    ASUB = 0x06,
    /// `A = B * C`.
    AMUL = 0x07,
    /// `A = B / C`.
    ADIV = 0x08,
    /// `A = B % C`.
    AMOD = 0x09,
    /// `A = B ^ C` (exponentiation).
    APOW = 0x0a,
    /// `A = truthy(B) ? C : B`.
    LAND = 0x0b,
    /// `A = truthy(B) ? B : C`.
    LOR = 0x0c,
    /// `A = B == nil ? C : B`.
    NCS = 0x0d,
    /// `A = type(B) == C`.
    CTY = 0x0e,
    /// `A = C is a base class of B`.
    CTYX = 0x0f,
    /// `A = B == C`.
    CEQ = 0x10,
    /// `A = B != C`.
    CNE = 0x11,
    /// `A = B < C`.
    CLT = 0x12,
    /// `A = B >= C`.
    CGE = 0x13,
    /// `A = B > C`.
    CGT = 0x14,
    /// `A = B <= C`.
    CLE = 0x15,

    /// `A = concat(str(A) .. str(A+B-1))`.
    CCAT = 0x16,
    /// Installs the exception handler of the current frame at `ip + 1 + A`.
    SETEH = 0x17,
    /// Stores `A` into the last-exception slot.
    SETEX = 0x18,
    /// `A = last exception`.
    GETEX = 0x19,

    /// `A = bitcast(B:C)`: loads the 64-bit immediate as a boxed value.
    KIMM = 0x1a,

    /// `A = upvalue[B]`.
    UGET = 0x1b,
    /// `upvalue[A] = B`.
    USET = 0x1c,

    /// `A = trivially-initialized instance of the class in B:C`.
    STRIV = 0x1d,
    /// `A = C[B]` where `C` is an object or a class.
    SGET = 0x1e,
    /// `C[A] = B` where `C` is an object or a class.
    SSET = 0x1f,

    /// `A = number of varargs`.
    VACNT = 0x20,
    /// Raises the value in `B:C` when fewer than `A` varargs were passed.
    VACHK = 0x21,
    /// `A = vararg[B]`, `nil` when out of range.
    VAGET = 0x22,

    /// `A = array with capacity B`.
    ANEW = 0x23,
    /// `A = table with reserved size B`.
    TNEW = 0x24,
    /// `A = C[B]`, trait-aware.
    TGET = 0x25,
    /// `C[A] = B`, trait-aware.
    TSET = 0x26,
    /// `A = C[B]`, raw.
    TGETR = 0x27,
    /// `C[A] = B`, raw.
    TSETR = 0x28,

    /// `A = duplicate(const[B])`, then `A.upvalue[i] = C + i`.
    FDUP = 0x29,

    /// Pushes `A` onto the evaluation stack.
    PUSHR = 0x2a,
    /// Pushes the boxed 64-bit immediate in `B:C` onto the evaluation stack.
    PUSHI = 0x2b,

    /// `A = number(B)`.
    TONUM = 0x2c,
    /// `A = integer(B)` (truncating).
    TOINT = 0x2d,
    /// `A = string(B)`.
    TOSTR = 0x2e,
    /// `A = bool(B)`.
    TOBOOL = 0x2f,

    /// `A = trait C of B`.
    TRGET = 0x30,
    /// Sets trait `C` of `A` to `B`.
    TRSET = 0x31,

    /// `A = call(with B stack arguments)`.
    CALL = 0x32,
    /// Returns `A`.
    RET = 0x33,
    /// Jumps to `ip + 1 + A`.
    JMP = 0x34,
    /// Jumps to `ip + 1 + A` when `B` is truthy.
    JS = 0x35,
    /// Jumps to `ip + 1 + A` when `B` is falsy.
    JNS = 0x36,
    /// `B+1, B+2 = C[B++].kv`, jumps to `ip + 1 + A` at the end.
    ITER = 0x37,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Kind of a single instruction operand.
pub enum OperandKind {
    /// Unused.
    None,
    /// Register index, possibly negative (frame slot).
    Reg,
    /// Upvalue index.
    Uvl,
    /// Constant pool index.
    Kvl,
    /// Immediate.
    Imm,
    /// 64-bit immediate overlaying `b:c`.
    Xmm,
    /// Relative jump target.
    Rel,
}

impl Opcode {
    /// Operand kinds `(a, b, c)` for this opcode.
    pub const fn operands(self) -> (OperandKind, OperandKind, OperandKind) {
        use OperandKind::*;
        match self {
            Self::UD | Self::NOP => (None, None, None),
            Self::LNOT | Self::ANEG | Self::MOV => (Reg, Reg, None),
            Self::AADD
            | Self::ASUB
            | Self::AMUL
            | Self::ADIV
            | Self::AMOD
            | Self::APOW
            | Self::LAND
            | Self::LOR
            | Self::NCS
            | Self::CTYX
            | Self::CEQ
            | Self::CNE
            | Self::CLT
            | Self::CGE
            | Self::CGT
            | Self::CLE => (Reg, Reg, Reg),
            Self::CTY => (Reg, Reg, Imm),
            Self::CCAT => (Reg, Imm, None),
            Self::SETEH => (Rel, None, None),
            Self::SETEX | Self::GETEX => (Reg, None, None),
            Self::KIMM | Self::STRIV => (Reg, Xmm, None),
            Self::UGET => (Reg, Uvl, None),
            Self::USET => (Uvl, Reg, None),
            Self::SGET | Self::SSET | Self::TGET | Self::TSET | Self::TGETR | Self::TSETR => {
                (Reg, Reg, Reg)
            }
            Self::VACNT => (Reg, None, None),
            Self::VACHK => (Imm, Xmm, None),
            Self::VAGET => (Reg, Reg, None),
            Self::ANEW | Self::TNEW => (Reg, Imm, None),
            Self::FDUP => (Reg, Kvl, Reg),
            Self::PUSHR => (Reg, None, None),
            Self::PUSHI => (None, Xmm, None),
            Self::TONUM | Self::TOINT | Self::TOSTR | Self::TOBOOL => (Reg, Reg, None),
            Self::TRGET => (Reg, Reg, Imm),
            Self::TRSET => (Reg, Reg, Imm),
            Self::CALL => (Reg, Imm, None),
            Self::RET => (Reg, None, None),
            Self::JMP => (Rel, None, None),
            Self::JS | Self::JNS => (Rel, Reg, None),
            Self::ITER => (Rel, Reg, Reg),
        }
    }

    /// Whether the opcode carries a 64-bit immediate in `b:c`.
    pub const fn has_xmm(self) -> bool {
        matches!(self.operands().1, OperandKind::Xmm)
    }

    /// Whether the opcode unconditionally or conditionally transfers control.
    pub const fn is_branch(self) -> bool {
        matches!(self, Self::JMP | Self::JS | Self::JNS | Self::ITER)
    }

    /// Whether executing the opcode may allocate on the garbage-collected
    /// heap. The compiler schedules a collector tick ahead of these.
    pub const fn is_allocating(self) -> bool {
        matches!(
            self,
            Self::ANEW | Self::TNEW | Self::FDUP | Self::CCAT | Self::TOSTR | Self::STRIV
        )
    }
}

impl Default for Opcode {
    fn default() -> Self {
        Self::UD
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<u8> for Opcode {
    fn from(b: u8) -> Self {
        if b <= Self::ITER as u8 {
            // Safety: the opcode space is contiguous from UD to ITER and the
            // enum is `repr(u8)`.
            unsafe { core::mem::transmute::<u8, Opcode>(b) }
        } else {
            Self::UD
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_u8_round_trip() {
        for op in Opcode::iter() {
            assert_eq!(op, Opcode::from(op as u8));
        }
        for b in Opcode::ITER as u8 + 1..=255 {
            assert_eq!(Opcode::from(b), Opcode::UD);
        }
    }

    #[test]
    fn xmm_opcodes_have_no_c_operand() {
        for op in Opcode::iter() {
            if op.has_xmm() {
                assert_eq!(op.operands().2, OperandKind::None, "{op}");
            }
        }
    }
}
