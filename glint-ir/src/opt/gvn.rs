//! Identical-value folding, a block-local GVN.
//!
//! For each non-volatile instruction, walk backwards within its block (and
//! one level into a sole predecessor) looking for an instruction with the
//! same opcode and operand sequence. A side-effecting instruction between
//! the two kills the match unless the candidate is constant-foldable.

use crate::entities::Inst;
use crate::insn::IrOp;
use crate::proc::Procedure;

fn is_identical(proc: &Procedure, a: Inst, b: Inst) -> bool {
    if a == b {
        return true;
    }
    let ia = proc.inst(a);
    let ib = proc.inst(b);
    if ia.has_side_effect() || !ia.is_pure() || ia.op == IrOp::Phi {
        return false;
    }
    ia.op == ib.op && ia.operands == ib.operands
}

/// Runs one folding sweep. Returns whether anything changed.
pub fn fold_identical(proc: &mut Procedure) -> bool {
    let mut changed = false;

    for b in proc.layout.clone() {
        let insts = proc.block(b).insts.clone();
        for (pos, i) in insts.iter().copied().enumerate().rev() {
            if proc.inst(i).block.is_none() || proc.inst(i).is_volatile() {
                continue;
            }

            let mut found: Option<Inst> = None;
            let mut blocked = false;
            for cand in insts[..pos].iter().copied().rev() {
                if proc.inst(cand).block.is_none() {
                    continue;
                }
                if is_identical(proc, i, cand) {
                    found = Some(cand);
                    break;
                }
                if proc.inst(cand).has_side_effect() && !proc.inst(i).is_const() {
                    blocked = true;
                    break;
                }
            }

            // One level into a sole predecessor.
            if found.is_none() && !blocked {
                let preds = &proc.block(b).preds;
                if preds.len() == 1 {
                    let p = preds[0];
                    for cand in proc.block(p).insts.clone().into_iter().rev() {
                        if is_identical(proc, i, cand) {
                            found = Some(cand);
                            break;
                        }
                        if proc.inst(cand).has_side_effect() && !proc.inst(i).is_const() {
                            break;
                        }
                    }
                }
            }

            if let Some(found) = found {
                if found != i {
                    proc.replace_all_uses(i, crate::entities::ValueRef::Inst(found));
                    changed = true;
                }
            }
        }
    }

    if changed {
        proc.validate();
    }
    changed
}
