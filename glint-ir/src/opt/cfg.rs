//! Control-flow cleanup: degenerate `jcc` collapse, constant branch
//! evaluation, jump-chain inlining and unreachable-block removal.

use crate::constant::ConstData;
use crate::entities::Block;
use crate::insn::IrOp;
use crate::proc::Procedure;

/// Runs one cleanup sweep. Returns whether anything changed.
pub fn cfg(proc: &mut Procedure) -> bool {
    let mut changed = false;

    // Branch simplification.
    for b in proc.layout.clone() {
        if proc.block(b).dead {
            continue;
        }
        let Some(term) = proc.terminator(b) else { continue };
        if proc.inst(term).op != IrOp::Jcc {
            continue;
        }

        let cond = proc.inst(term).operands[0];
        let tt = proc.target_of(proc.inst(term).operands[1]).expect("jcc target");
        let tf = proc.target_of(proc.inst(term).operands[2]).expect("jcc target");

        let taken = if tt == tf {
            Some(tt)
        } else if let Some(k) = proc.const_of(cond).and_then(|c| c.to_bool()) {
            let (keep, drop) = if k { (tt, tf) } else { (tf, tt) };
            proc.remove_pred_edge(b, drop);
            Some(keep)
        } else {
            None
        };

        if let Some(keep) = taken {
            let bc = proc.inst(term).bc_pos;
            proc.erase(term);
            let k = proc.constant(ConstData::Block(keep));
            let jmp = proc.create(IrOp::Jmp, vec![k], bc);
            proc.append(b, jmp);
            changed = true;
        }
    }

    // Drop blocks no edge reaches anymore.
    loop {
        let dead: Vec<Block> = proc
            .layout
            .iter()
            .copied()
            .skip(1)
            .filter(|b| proc.block(*b).preds.is_empty())
            .collect();
        if dead.is_empty() {
            break;
        }
        for b in dead {
            proc.del_block(b);
            changed = true;
        }
    }

    // Inline blocks that only forward: a lone `jmp` whose target carries no
    // phis can be bypassed by rewriting every predecessor.
    for b in proc.layout.clone() {
        if proc.block(b).dead || b == proc.entry() {
            continue;
        }
        if proc.block(b).insts.len() != 1 {
            continue;
        }
        let only = proc.block(b).insts[0];
        if proc.inst(only).op != IrOp::Jmp {
            continue;
        }
        let target = proc.target_of(proc.inst(only).operands[0]).expect("jmp target");
        if target == b || !proc.phis(target).is_empty() || !proc.phis(b).is_empty() {
            continue;
        }

        for p in proc.block(b).preds.clone() {
            // Skip predecessors already flowing into the target: merging
            // the edges would break phi arity bookkeeping later.
            if proc.block(p).succs.contains(&target) {
                continue;
            }
            let Some(pterm) = proc.terminator(p) else { continue };
            let old = proc.constant(ConstData::Block(b));
            let new = proc.constant(ConstData::Block(target));
            for slot in 0..proc.inst(pterm).operands.len() {
                if proc.inst(pterm).operands[slot] == old {
                    proc.set_operand(pterm, slot, new);
                }
            }
            proc.del_jump(p, b);
            proc.add_jump(p, target);
            changed = true;
        }
        if proc.block(b).preds.is_empty() {
            proc.del_block(b);
        }
    }

    if changed && proc.topo_sorted {
        // Keep the layout in order for the passes that rely on it.
        proc.topological_sort();
    }
    changed
}
