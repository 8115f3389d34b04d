//! Lowering preparation.
//!
//! `prepare_for_mir` rewrites the opcodes MIR cannot express as direct
//! `ccall`s against the runtime helpers. `finalize_for_mir` materializes
//! phi inputs as `move`/`erase_type` in the predecessors, sorts the blocks
//! topologically, fills loop-depth hints and renumbers the SSA names.

use glint_asm::Opcode;
use glint_vm::runtime;
use glint_vm::types::Ty;

use crate::constant::ConstData;
use crate::entities::{Inst, ValueRef};
use crate::insn::IrOp;
use crate::proc::Procedure;

fn replace_with_ccall(
    proc: &mut Procedure,
    i: Inst,
    nf: &'static glint_vm::object::NativeInfo,
    args: Vec<ValueRef>,
) {
    let bc = proc.inst(i).bc_pos;
    let target = proc.constant(ConstData::Native(nf));
    let ovl = proc.constant(ConstData::I32(0));
    let mut operands = vec![target, ovl];
    operands.extend(args);
    let call = proc.create(IrOp::Ccall, operands, bc);
    proc.insert_before(i, call);
    proc.replace_all_uses(i, ValueRef::Inst(call));
    proc.erase(i);
}

/// Lowers the remaining polymorphic opcodes to runtime helper calls.
pub fn prepare_for_mir(proc: &mut Procedure) {
    for b in proc.layout.clone() {
        for i in proc.block(b).insts.clone() {
            if proc.inst(i).block.is_none() {
                continue;
            }
            let operands = proc.inst(i).operands.clone();
            match proc.inst(i).op {
                IrOp::ArrayNew => {
                    replace_with_ccall(proc, i, &runtime::NF_ARRAY_NEW, vec![operands[0]]);
                }
                IrOp::TableNew => {
                    replace_with_ccall(proc, i, &runtime::NF_TABLE_NEW, vec![operands[0]]);
                }
                IrOp::Vdup => {
                    replace_with_ccall(proc, i, &runtime::NF_DUP, vec![operands[0]]);
                }
                IrOp::Vlen => {
                    replace_with_ccall(proc, i, &runtime::NF_LEN, vec![operands[0]]);
                }
                IrOp::Vjoin => {
                    replace_with_ccall(proc, i, &runtime::NF_JOIN, operands);
                }
                IrOp::Vin => {
                    replace_with_ccall(proc, i, &runtime::NF_IN, operands);
                }
                IrOp::FieldGet => {
                    let raw = matches!(proc.const_of(operands[0]), Some(ConstData::Bool(true)));
                    let nf = if raw {
                        &runtime::NF_FIELD_GET_RAW
                    } else {
                        &runtime::NF_FIELD_GET
                    };
                    replace_with_ccall(proc, i, nf, operands[1..].to_vec());
                }
                IrOp::FieldSet => {
                    let raw = matches!(proc.const_of(operands[0]), Some(ConstData::Bool(true)));
                    let nf = if raw {
                        &runtime::NF_FIELD_SET_RAW
                    } else {
                        &runtime::NF_FIELD_SET
                    };
                    replace_with_ccall(proc, i, nf, operands[1..].to_vec());
                }
                IrOp::Binop => {
                    // `mod` and `pow` over doubles have no single machine
                    // op; they tail-call the math helpers.
                    if proc.inst(i).vt == Ty::F64 {
                        match proc.const_of(operands[0]) {
                            Some(ConstData::Vmop(Opcode::AMOD)) => {
                                replace_with_ccall(
                                    proc,
                                    i,
                                    &runtime::NF_FMOD,
                                    vec![operands[1], operands[2]],
                                );
                            }
                            Some(ConstData::Vmop(Opcode::APOW)) => {
                                replace_with_ccall(
                                    proc,
                                    i,
                                    &runtime::NF_FPOW,
                                    vec![operands[1], operands[2]],
                                );
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }
    proc.validate();
}

/// Converts phi operands to explicit `move`/`erase_type` in the matching
/// predecessors, sorts, fills loop hints and renumbers.
pub fn finalize_for_mir(proc: &mut Procedure) {
    for b in proc.layout.clone() {
        for phi in proc.phis(b) {
            let phi_ty = proc.inst(phi).vt;
            let preds = proc.block(b).preds.clone();
            for (k, pred) in preds.into_iter().enumerate() {
                let incoming = proc.inst(phi).operands[k];
                let bc = proc.inst(phi).bc_pos;
                // A typed value flowing into an untyped phi re-boxes.
                let op = if matches!(phi_ty, Ty::Unk | Ty::Any)
                    && !matches!(proc.value_ty(incoming), Ty::Unk | Ty::Any)
                {
                    IrOp::EraseType
                } else {
                    IrOp::Move
                };
                let mat = proc.create(op, vec![incoming], bc);
                let term = proc.terminator(pred).expect("predecessor terminator");
                proc.insert_before(term, mat);
                proc.set_operand(phi, k, ValueRef::Inst(mat));
            }
        }
    }

    proc.topological_sort();
    proc.compute_loop_depth();
    proc.rename();
    proc.validate();
}
