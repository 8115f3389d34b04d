//! Typed entity references into the procedure arenas.
//!
//! Instructions reference other values, blocks own instructions and jumps
//! reference blocks; modelling those edges as `u32` newtypes into arenas
//! keeps the graph cyclic-friendly without reference counting, and a
//! separate index type per entity preserves type safety.

use core::fmt;

macro_rules! entity_impl {
    ($name:ident, $prefix:literal) => {
        impl $name {
            /// Creates a reference from its arena index.
            pub fn new(index: usize) -> Self {
                debug_assert!(index < u32::MAX as usize);
                Self(index as u32)
            }

            /// The arena index.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }
    };
}

/// An opaque reference to a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "$");

/// An opaque reference to an instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "%");

/// An opaque reference to a pooled constant.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstId(u32);
entity_impl!(ConstId, "k");

/// An operand: either an SSA instruction result or a pooled constant.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueRef {
    /// Result of an instruction.
    Inst(Inst),
    /// Pooled constant.
    Const(ConstId),
}

impl ValueRef {
    /// The instruction behind the operand, when it is one.
    pub fn as_inst(self) -> Option<Inst> {
        match self {
            Self::Inst(i) => Some(i),
            Self::Const(_) => None,
        }
    }

    /// The constant behind the operand, when it is one.
    pub fn as_const(self) -> Option<ConstId> {
        match self {
            Self::Const(c) => Some(c),
            Self::Inst(_) => None,
        }
    }
}

impl From<Inst> for ValueRef {
    fn from(i: Inst) -> Self {
        Self::Inst(i)
    }
}

impl From<ConstId> for ValueRef {
    fn from(c: ConstId) -> Self {
        Self::Const(c)
    }
}

impl fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inst(i) => write!(f, "{i}"),
            Self::Const(c) => write!(f, "{c}"),
        }
    }
}
