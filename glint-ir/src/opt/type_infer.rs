//! Type inference across guards.
//!
//! Within a region dominated by a successful `assume_cast`, the operand's
//! runtime type is known, so later `test_type` checks over the same value
//! fold to booleans. Proven declared types decide their checks directly.

use glint_vm::types::{Ty, ValueKind};

use crate::constant::ConstData;
use crate::entities::{Inst, ValueRef};
use crate::insn::IrOp;
use crate::proc::Procedure;

/// The runtime kind of `v` as observable at `at`, when one dominates.
fn dominating_kind_at(proc: &Procedure, at: Inst, v: ValueRef) -> Option<ValueKind> {
    let t = proc.value_ty(v);
    if !matches!(t, Ty::Unk | Ty::Any) {
        return t.to_value_kind();
    }

    // A cast user whose block dominates the query point proves the kind.
    let at_block = proc.inst(at).block?;
    for b in &proc.layout {
        for i in &proc.block(*b).insts {
            let insn = proc.inst(*i);
            if insn.op != IrOp::AssumeCast || insn.operands[0] != v {
                continue;
            }
            let cast_block = insn.block?;
            if cast_block != at_block && proc.dom(cast_block, at_block) {
                if let Some(ConstData::Dty(t)) = proc.const_of(insn.operands[1]) {
                    return t.to_value_kind();
                }
            }
        }
    }
    None
}

/// Runs one inference sweep. Returns whether anything changed.
pub fn type_inference(proc: &mut Procedure) -> bool {
    let mut changed = false;

    for b in proc.layout.clone() {
        for i in proc.block(b).insts.clone() {
            if proc.inst(i).block.is_none() || proc.inst(i).op != IrOp::TestType {
                continue;
            }
            let value = proc.inst(i).operands[0];
            let expected = match proc.const_of(proc.inst(i).operands[1]) {
                Some(ConstData::Vty(k)) => *k,
                _ => continue,
            };
            if let Some(kind) = dominating_kind_at(proc, i, value) {
                let k = proc.constant(ConstData::Bool(kind == expected));
                proc.replace_all_uses(i, k);
                proc.erase(i);
                changed = true;
            }
        }
    }
    changed
}
