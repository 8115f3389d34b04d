//! The optimizer pipeline.
//!
//! `lift_phi` and `schedule_gc` run once after lifting; the folding,
//! cleanup and specialization passes iterate until none of them reports a
//! change. `prepare_for_mir`/`finalize_for_mir` then shape the procedure
//! for lowering.

pub mod cfg;
pub mod dce;
pub mod fold_const;
pub mod gvn;
pub mod lift_phi;
pub mod prepare_mir;
pub mod schedule_gc;
pub mod type_infer;
pub mod type_split;

use glint_vm::vm::Vm;
use tracing::debug;

use crate::proc::Procedure;

/// Iteration backstop for the fixpoint loop.
const MAX_ROUNDS: usize = 64;

/// Runs the full optimization pipeline over a freshly lifted procedure.
pub fn optimize(vm: &mut Vm, proc: &mut Procedure) {
    lift_phi::lift_phi(proc);
    schedule_gc::schedule_gc(proc);

    for round in 0..MAX_ROUNDS {
        let mut changed = false;
        changed |= fold_const::fold_constant(vm, proc);
        changed |= gvn::fold_identical(proc);
        changed |= dce::dce(proc);
        changed |= cfg::cfg(proc);
        changed |= type_split::type_split_cfg(proc);
        changed |= type_infer::type_inference(proc);
        if !changed {
            debug!(round, "optimizer reached fixpoint");
            break;
        }
    }
    proc.validate();
}

/// Optimizes and lowers the procedure shape for MIR translation.
pub fn optimize_for_mir(vm: &mut Vm, proc: &mut Procedure) {
    optimize(vm, proc);
    prepare_mir::prepare_for_mir(proc);
    prepare_mir::finalize_for_mir(proc);
}
