//! SSA compiler core of the Glint virtual machine.
//!
//! The pipeline takes a function prototype from `glint-vm` and produces a
//! register-allocated machine IR:
//!
//! 1. [`lift::lift`] — bytecode to crude SSA with `load_local`/`store_local`.
//! 2. [`opt::optimize`] — phi construction, gc-tick scheduling, folding,
//!    CFG cleanup and type-directed specialization, to fixpoint.
//! 3. [`opt::optimize_for_mir`] — plus helper-call lowering and phi
//!    materialization.
//! 4. [`lower::lower`] — linear machine IR over virtual registers.
//! 5. [`regalloc::allocate_registers`] — interference-graph coloring.
//!
//! Machine-code emission is an external collaborator: it consumes the
//! allocated [`mir::MProcedure`] and fills its code buffer.

pub mod bitset;
pub mod constant;
pub mod entities;
pub mod insn;
pub mod lift;
pub mod lower;
pub mod mir;
pub mod opt;
pub mod proc;
pub mod regalloc;

use glint_vm::gc::Gc;
use glint_vm::object::Proto;
use glint_vm::vm::Vm;

pub use lift::LiftError;

/// Runs the whole pipeline over a prototype.
pub fn compile(vm: &mut Vm, proto: Gc<Proto>) -> Result<mir::MProcedure, LiftError> {
    let mut proc = lift::lift(proto)?;
    opt::optimize_for_mir(vm, &mut proc);
    let mut machine = lower::lower(&proc);
    regalloc::allocate_registers(&mut machine, regalloc::RegLimits::default());
    Ok(machine)
}
