//! Type-directed CFG splitting.
//!
//! Every polymorphic operation over an unproven operand gets a `test_type`
//! guard. The block splits at the guard: the success edge casts the operand
//! with `assume_cast` and runs the specialized copy, the failure edge
//! either chains a check for the next candidate kind or terminates in
//! `unreachable` (the deoptimization sink). A phi merges the results.

use glint_asm::Opcode;
use glint_vm::types::{Ty, ValueKind};

use crate::constant::ConstData;
use crate::entities::{Block, Inst, ValueRef};
use crate::insn::IrOp;
use crate::proc::Procedure;

/// Result of one split: the specialized copy, the unspecialized copy on
/// the failure edge, and the join block.
struct Split {
    checked: Inst,
    fallback: Inst,
    fail_block: Block,
    join: Block,
}

fn is_unproven(t: Ty) -> bool {
    matches!(t, Ty::Unk | Ty::Any)
}

/// Splits around `i`, guarding `operands[op_idx]` against `kind`.
fn split_by(proc: &mut Procedure, i: Inst, op_idx: usize, kind: ValueKind) -> Split {
    let blk = proc.inst(i).block.expect("splitting an orphan");
    let operand = proc.inst(i).operands[op_idx];
    let bc = proc.inst(i).bc_pos;

    // Guard before the instruction, then cut the block there.
    let vty = proc.constant(ConstData::Vty(kind));
    let test = proc.create(IrOp::TestType, vec![operand, vty], bc);
    proc.insert_before(i, test);
    let join = proc.split_at(blk, test);

    // The split terminator becomes a jcc over the guard.
    let jmp = proc.terminator(blk).expect("split leaves a jmp");
    proc.erase(jmp);
    proc.del_jump(blk, join);

    let tblk = proc.add_block();
    let fblk = proc.add_block();
    let kt = proc.constant(ConstData::Block(tblk));
    let kf = proc.constant(ConstData::Block(fblk));
    let jcc = proc.create(IrOp::Jcc, vec![ValueRef::Inst(test), kt, kf], bc);
    proc.append(blk, jcc);
    proc.add_jump(blk, tblk);
    proc.add_jump(blk, fblk);

    // Failure copy first, reading the unguarded operand.
    let fallback = proc.duplicate(i);
    proc.append(fblk, fallback);

    // Success copy runs over the cast operand.
    proc.remove(i);
    let dty = proc.constant(ConstData::Dty(Ty::from_value_kind(kind)));
    let cast = proc.create(IrOp::AssumeCast, vec![operand, dty], bc);
    proc.append(tblk, cast);
    proc.set_operand(i, op_idx, ValueRef::Inst(cast));
    proc.append(tblk, i);

    for from in [tblk, fblk] {
        let k = proc.constant(ConstData::Block(join));
        let jmp = proc.create(IrOp::Jmp, vec![k], bc);
        proc.append(from, jmp);
        proc.add_jump(from, join);
    }

    // A value-producing operation merges through a phi at the join.
    if proc.inst(i).vt != Ty::None {
        let phi = proc.create(IrOp::Phi, vec![ValueRef::Inst(i), ValueRef::Inst(fallback)], bc);
        proc.insert_front(join, phi);
        proc.replace_all_uses_except(i, ValueRef::Inst(phi), Some(phi));
        proc.update(phi);
    }

    proc.update(i);
    Split {
        checked: i,
        fallback,
        fail_block: fblk,
        join,
    }
}

/// Turns the failure edge into the deoptimization sink.
fn kill_fallback(proc: &mut Procedure, split: &Split) {
    let fblk = split.fail_block;
    let jmp = proc.terminator(fblk).expect("fallback jmp");
    proc.erase(jmp);
    proc.remove_pred_edge(fblk, split.join);
    proc.erase(split.fallback);
    let bc = proc.inst(split.checked).bc_pos;
    let dead = proc.create(IrOp::Unreachable, vec![], bc);
    proc.append(fblk, dead);
    proc.block_mut(fblk).cold_hint = u8::MAX;
}

/// Forwards the failure edge as an identity over the original operand;
/// used by duplication, where a non-container duplicates to itself.
fn forward_fallback(proc: &mut Procedure, split: &Split, operand: ValueRef) {
    proc.replace_all_uses(split.fallback, operand);
    proc.erase(split.fallback);
}

/// Specializes numeric `binop`/ordered `compare` operands.
fn specialize_op(proc: &mut Procedure) -> bool {
    for b in proc.layout.clone() {
        for i in proc.block(b).insts.clone() {
            let insn = proc.inst(i);
            let interesting = match insn.op {
                IrOp::Binop => is_unproven(insn.vt),
                IrOp::Compare => {
                    matches!(
                        proc.const_of(insn.operands[0]),
                        Some(ConstData::Vmop(
                            Opcode::CLT | Opcode::CLE | Opcode::CGT | Opcode::CGE
                        ))
                    ) && (is_unproven(proc.value_ty(insn.operands[1]))
                        || is_unproven(proc.value_ty(insn.operands[2])))
                }
                _ => false,
            };
            if !interesting {
                continue;
            }

            let op_idx = if is_unproven(proc.value_ty(proc.inst(i).operands[1])) {
                1
            } else {
                2
            };
            let split = split_by(proc, i, op_idx, ValueKind::Number);
            kill_fallback(proc, &split);
            return true;
        }
    }
    false
}

/// Specializes `vdup` over arrays, tables and functions; everything else
/// duplicates to itself.
fn specialize_dup(proc: &mut Procedure) -> bool {
    for b in proc.layout.clone() {
        for i in proc.block(b).insts.clone() {
            let insn = proc.inst(i);
            if insn.op != IrOp::Vdup || !is_unproven(insn.vt) {
                continue;
            }
            let operand = proc.inst(i).operands[0];
            let s0 = split_by(proc, i, 0, ValueKind::Array);
            let s1 = split_by(proc, s0.fallback, 0, ValueKind::Table);
            let s2 = split_by(proc, s1.fallback, 0, ValueKind::Function);
            forward_fallback(proc, &s2, operand);
            return true;
        }
    }
    false
}

/// Specializes `vlen` over arrays, tables and strings.
fn specialize_len(proc: &mut Procedure) -> bool {
    for b in proc.layout.clone() {
        for i in proc.block(b).insts.clone() {
            let insn = proc.inst(i);
            if insn.op != IrOp::Vlen || !is_unproven(proc.value_ty(insn.operands[0])) {
                continue;
            }
            let s0 = split_by(proc, i, 0, ValueKind::Array);
            let s1 = split_by(proc, s0.fallback, 0, ValueKind::Table);
            let s2 = split_by(proc, s1.fallback, 0, ValueKind::String);
            kill_fallback(proc, &s2);
            return true;
        }
    }
    false
}

/// Specializes the `vcall` target against functions.
fn specialize_call(proc: &mut Procedure) -> bool {
    for b in proc.layout.clone() {
        for i in proc.block(b).insts.clone() {
            let insn = proc.inst(i);
            if insn.op != IrOp::Vcall || !is_unproven(proc.value_ty(insn.operands[0])) {
                continue;
            }
            let split = split_by(proc, i, 0, ValueKind::Function);
            kill_fallback(proc, &split);
            return true;
        }
    }
    false
}

/// Specializes `field_get`/`field_set` containers. The array and string
/// branches switch to the raw helper: the guard already validated the
/// container kind.
fn specialize_field(proc: &mut Procedure) -> bool {
    for b in proc.layout.clone() {
        for i in proc.block(b).insts.clone() {
            let insn = proc.inst(i);
            if !matches!(insn.op, IrOp::FieldGet | IrOp::FieldSet)
                || !is_unproven(proc.value_ty(insn.operands[1]))
            {
                continue;
            }
            let is_get = proc.inst(i).op == IrOp::FieldGet;

            let raw_true = proc.constant(ConstData::Bool(true));
            let s0 = split_by(proc, i, 1, ValueKind::Table);
            let s1 = split_by(proc, s0.fallback, 1, ValueKind::Array);
            proc.set_operand(s1.checked, 0, raw_true);
            proc.update(s1.checked);
            if is_get {
                let s2 = split_by(proc, s1.fallback, 1, ValueKind::String);
                proc.set_operand(s2.checked, 0, raw_true);
                proc.update(s2.checked);
                kill_fallback(proc, &s2);
            } else {
                kill_fallback(proc, &s1);
            }
            return true;
        }
    }
    false
}

/// Runs one specialization step. Returns whether anything changed.
pub fn type_split_cfg(proc: &mut Procedure) -> bool {
    let changed = specialize_op(proc)
        || specialize_dup(proc)
        || specialize_len(proc)
        || specialize_call(proc)
        || specialize_field(proc);
    if changed {
        if proc.topo_sorted {
            proc.topological_sort();
        }
        proc.validate();
    }
    changed
}
