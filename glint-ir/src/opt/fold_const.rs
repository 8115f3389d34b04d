//! Constant folding.
//!
//! `select` over a constant condition collapses to the taken branch;
//! `binop`/`compare` over two constants evaluate eagerly through the
//! runtime operator so folded and interpreted results agree; type-tag
//! comparisons where one side's declared type decides the answer become
//! constants.

use glint_asm::Opcode;
use glint_vm::runtime;
use glint_vm::types::Ty;
use glint_vm::vm::Vm;

use crate::constant::ConstData;
use crate::entities::Inst;
use crate::insn::IrOp;
use crate::proc::Procedure;

fn vmop_of(proc: &Procedure, i: Inst) -> Option<Opcode> {
    match proc.const_of(proc.inst(i).operands[0]) {
        Some(ConstData::Vmop(op)) => Some(*op),
        _ => None,
    }
}

/// Runs one folding sweep. Returns whether anything changed.
pub fn fold_constant(vm: &mut Vm, proc: &mut Procedure) -> bool {
    let mut changed = false;

    for b in proc.layout.clone() {
        for i in proc.block(b).insts.clone() {
            if proc.inst(i).block.is_none() || proc.inst(i).is_volatile() {
                continue;
            }
            match proc.inst(i).op {
                IrOp::Select => {
                    let cond = proc.inst(i).operands[0];
                    if let Some(k) = proc.const_of(cond).and_then(|c| c.to_bool()) {
                        let taken = proc.inst(i).operands[if k { 1 } else { 2 }];
                        proc.replace_all_uses(i, taken);
                        proc.erase(i);
                        changed = true;
                    }
                }
                IrOp::Binop | IrOp::Compare => {
                    let lhs = proc.inst(i).operands[1];
                    let rhs = proc.inst(i).operands[2];
                    let lv = proc.const_of(lhs).and_then(|c| c.to_value());
                    let rv = proc.const_of(rhs).and_then(|c| c.to_value());
                    if let (Some(op), Some(lv), Some(rv)) = (vmop_of(proc, i), lv, rv) {
                        let folded = if proc.inst(i).op == IrOp::Binop {
                            runtime::apply_binop(vm, op, lv, rv)
                        } else {
                            runtime::apply_compare(vm, op, lv, rv)
                        };
                        // Operations that would raise are left for runtime.
                        if let Ok(v) = folded {
                            let k = proc.constant(ConstData::from_value(v));
                            proc.replace_all_uses(i, k);
                            proc.erase(i);
                            changed = true;
                            continue;
                        }
                    }

                    // Tag trick: a marker literal never equals a value whose
                    // type is proven different.
                    if proc.inst(i).block.is_some() && proc.inst(i).op == IrOp::Compare {
                        if let Some(op @ (Opcode::CEQ | Opcode::CNE)) = vmop_of(proc, i) {
                            let tl = proc.value_ty(lhs);
                            let tr = proc.value_ty(rhs);
                            let decided = (tl.is_marker()
                                && !matches!(tr, Ty::Unk | Ty::Any)
                                && tl != tr)
                                || (tr.is_marker()
                                    && !matches!(tl, Ty::Unk | Ty::Any)
                                    && tl != tr);
                            if decided {
                                let k = proc.constant(ConstData::Bool(op == Opcode::CNE));
                                proc.replace_all_uses(i, k);
                                proc.erase(i);
                                changed = true;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    changed
}
