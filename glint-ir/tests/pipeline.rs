use glint_asm::{reg_arg, Instruction as I, Opcode};
use glint_ir::entities::ValueRef;
use glint_ir::insn::IrOp;
use glint_ir::opt;
use glint_ir::proc::Procedure;
use glint_vm::gc::Gc;
use glint_vm::prelude::*;

fn proto(vm: &mut Vm, code: &[I], consts: &[Value], locals: u32, args: u32) -> Gc<Proto> {
    Proto::create(
        vm,
        &ProtoDesc {
            code,
            consts,
            lines: &[],
            num_locals: locals,
            num_args: args,
            num_uval: 0,
            is_vararg: false,
            chunk: "pipeline",
            src_line: 1,
        },
    )
    .expect("prototype")
}

fn num(v: f64) -> Value {
    Value::number(v)
}

/// `s = 0; for i in 1..10 do s = s + i end; return s`
fn loop_proto(vm: &mut Vm) -> Gc<Proto> {
    let code = [
        I::ext(Opcode::KIMM, 0, num(0.0).raw()),
        I::ext(Opcode::KIMM, 1, num(1.0).raw()),
        I::ext(Opcode::KIMM, 2, num(10.0).raw()),
        I::ext(Opcode::KIMM, 3, num(1.0).raw()),
        I::new(Opcode::CLT, 4, 1, 2),
        I::new(Opcode::JNS, 3, 4, 0),
        I::new(Opcode::AADD, 0, 0, 1),
        I::new(Opcode::AADD, 1, 1, 3),
        I::new(Opcode::JMP, -5, 0, 0),
        I::new(Opcode::RET, 0, 0, 0),
    ];
    proto(vm, &code, &[], 5, 0)
}

fn count_op(proc: &Procedure, op: IrOp) -> usize {
    proc.layout
        .iter()
        .flat_map(|b| proc.block(*b).insts.iter())
        .filter(|i| proc.inst(**i).op == op)
        .count()
}

#[test]
fn lifted_procedures_validate() {
    let mut vm = Vm::new();
    let p = loop_proto(&mut vm);
    let proc = glint_ir::lift::lift(p).expect("lift");
    proc.validate();

    // The crude form still reads and writes frame slots.
    assert!(count_op(&proc, IrOp::LoadLocal) > 0);
    assert!(count_op(&proc, IrOp::StoreLocal) > 0);
    assert!(count_op(&proc, IrOp::Ret) == 1);
}

#[test]
fn phi_construction_places_two_loop_phis() {
    let mut vm = Vm::new();
    let p = loop_proto(&mut vm);
    let mut proc = glint_ir::lift::lift(p).expect("lift");
    opt::lift_phi::lift_phi(&mut proc);

    // One phi for `s`, one for `i`, both in the loop header with one
    // operand per predecessor.
    assert_eq!(count_op(&proc, IrOp::Phi), 2);
    let header = proc
        .layout
        .iter()
        .copied()
        .find(|b| !proc.phis(*b).is_empty())
        .expect("loop header with phis");
    for phi in proc.phis(header) {
        assert_eq!(proc.inst(phi).operands.len(), 2);
        assert_eq!(proc.block(header).preds.len(), 2);
    }

    // The locals traffic is gone outside the entry block.
    for b in proc.layout.iter().skip(1) {
        for i in &proc.block(*b).insts {
            assert!(
                !matches!(proc.inst(*i).op, IrOp::LoadLocal | IrOp::StoreLocal),
                "locals traffic survived in {b}"
            );
        }
    }
}

#[test]
fn cleanup_shrinks_the_loop_to_four_blocks() {
    let mut vm = Vm::new();
    let p = loop_proto(&mut vm);
    let mut proc = glint_ir::lift::lift(p).expect("lift");
    opt::lift_phi::lift_phi(&mut proc);
    opt::fold_const::fold_constant(&mut vm, &mut proc);
    opt::gvn::fold_identical(&mut proc);
    opt::dce::dce(&mut proc);
    opt::cfg::cfg(&mut proc);
    proc.validate();

    assert!(proc.layout.len() <= 4, "{} blocks", proc.layout.len());
}

#[test]
fn fold_constant_is_idempotent() {
    let mut vm = Vm::new();
    // return 2 + 3
    let code = [
        I::ext(Opcode::KIMM, 0, num(2.0).raw()),
        I::ext(Opcode::KIMM, 1, num(3.0).raw()),
        I::new(Opcode::AADD, 2, 0, 1),
        I::new(Opcode::RET, 2, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 3, 0);
    let mut proc = glint_ir::lift::lift(p).expect("lift");
    opt::lift_phi::lift_phi(&mut proc);

    assert!(opt::fold_const::fold_constant(&mut vm, &mut proc));
    opt::dce::dce(&mut proc);
    assert_eq!(count_op(&proc, IrOp::Binop), 0);

    // Second application finds nothing.
    assert!(!opt::fold_const::fold_constant(&mut vm, &mut proc));

    // The return operand folded to the literal 5.
    let ret = proc
        .layout
        .iter()
        .flat_map(|b| proc.block(*b).insts.clone())
        .find(|i| proc.inst(*i).op == IrOp::Ret)
        .expect("ret");
    let operand = proc.inst(ret).operands[0];
    let ValueRef::Const(c) = operand else {
        panic!("return operand did not fold")
    };
    let v = proc.const_data(c).to_value().expect("value constant");
    assert!(v.equals(num(5.0)));
}

#[test]
fn identical_folding_merges_repeated_loads() {
    let mut vm = Vm::new();
    // return (a + a) + (a + a): the second `a + a` is identical.
    let code = [
        I::new(Opcode::AADD, 0, reg_arg(0), reg_arg(0)),
        I::new(Opcode::AADD, 1, reg_arg(0), reg_arg(0)),
        I::new(Opcode::AADD, 2, 0, 1),
        I::new(Opcode::RET, 2, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 3, 1);
    let mut proc = glint_ir::lift::lift(p).expect("lift");
    opt::lift_phi::lift_phi(&mut proc);

    let before = count_op(&proc, IrOp::Binop);
    assert_eq!(before, 3);
    assert!(opt::gvn::fold_identical(&mut proc));
    opt::dce::dce(&mut proc);
    assert_eq!(count_op(&proc, IrOp::Binop), 2);

    // Idempotent after the cleanup.
    assert!(!opt::gvn::fold_identical(&mut proc));
}

#[test]
fn dce_leaves_no_unused_pure_values() {
    let mut vm = Vm::new();
    // r1 is computed and never used.
    let code = [
        I::ext(Opcode::KIMM, 0, num(1.0).raw()),
        I::new(Opcode::AADD, 1, 0, 0),
        I::new(Opcode::RET, 0, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 2, 0);
    let mut proc = glint_ir::lift::lift(p).expect("lift");
    opt::lift_phi::lift_phi(&mut proc);
    opt::dce::dce(&mut proc);

    for b in proc.layout.clone() {
        for i in proc.block(b).insts.clone() {
            let insn = proc.inst(i);
            if insn.is_pure() && !insn.has_side_effect() && !insn.op.is_terminator() {
                assert!(proc.use_count(i) > 0, "unused pure {i:?} survived dce");
            }
        }
    }
}

#[test]
fn type_split_specializes_the_loop_to_doubles() {
    let mut vm = Vm::new();
    let p = loop_proto(&mut vm);
    let mut proc = glint_ir::lift::lift(p).expect("lift");
    opt::optimize(&mut vm, &mut proc);

    // Every surviving arithmetic op settled to f64.
    for b in proc.layout.clone() {
        for i in proc.block(b).insts.clone() {
            let insn = proc.inst(i);
            if matches!(insn.op, IrOp::Binop) {
                assert_eq!(insn.vt, Ty::F64, "binop left at {:?}", insn.vt);
            }
            if matches!(insn.op, IrOp::Compare | IrOp::Binop) {
                for v in &insn.operands[1..] {
                    assert!(
                        !matches!(proc.value_ty(*v), Ty::Unk | Ty::Any),
                        "residual unproven operand"
                    );
                }
            }
        }
    }

    // Deoptimization sinks terminate the failure edges.
    assert!(count_op(&proc, IrOp::Unreachable) >= 1);
    for b in proc.layout.clone() {
        let last = *proc.block(b).insts.last().expect("terminator");
        if proc.inst(last).op == IrOp::Unreachable {
            assert_eq!(proc.block(b).cold_hint, u8::MAX);
        }
    }
}

#[test]
fn gc_ticks_hoist_into_loop_headers() {
    let mut vm = Vm::new();
    // Allocate a table every iteration; the tick should hoist.
    let code = [
        I::ext(Opcode::KIMM, 0, num(0.0).raw()),
        I::ext(Opcode::KIMM, 2, num(10.0).raw()),
        I::ext(Opcode::KIMM, 3, num(1.0).raw()),
        // 3: header
        I::new(Opcode::CLT, 4, 0, 2),
        I::new(Opcode::JNS, 3, 4, 0),
        I::new(Opcode::TNEW, 1, 0, 0),
        I::new(Opcode::AADD, 0, 0, 3),
        I::new(Opcode::JMP, -5, 0, 0),
        I::new(Opcode::RET, 0, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 5, 0);
    let mut proc = glint_ir::lift::lift(p).expect("lift");
    opt::lift_phi::lift_phi(&mut proc);
    let moved = opt::schedule_gc::schedule_gc(&mut proc);
    assert!(moved);

    // Exactly one tick, sitting at the head of a block with a back edge.
    assert_eq!(count_op(&proc, IrOp::GcTick), 1);
    let holder = proc
        .layout
        .iter()
        .copied()
        .find(|b| {
            proc.block(*b)
                .insts
                .iter()
                .any(|i| proc.inst(*i).op == IrOp::GcTick)
        })
        .expect("tick holder");
    let pos = proc.layout.iter().position(|b| *b == holder).expect("pos");
    let has_back_edge = proc.block(holder).preds.iter().any(|p| {
        proc.layout.iter().position(|b| b == p).expect("pred pos") >= pos
    });
    assert!(has_back_edge, "tick not in a loop header");
}

#[test]
fn unsupported_opcodes_refuse_to_lift() {
    let mut vm = Vm::new();
    let code = [
        I::new(Opcode::SETEH, 1, 0, 0),
        I::new(Opcode::RET, 0, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 1, 0);
    assert!(glint_ir::lift::lift(p).is_err());
}

#[test]
fn finalize_materializes_phi_inputs() {
    let mut vm = Vm::new();
    let p = loop_proto(&mut vm);
    let mut proc = glint_ir::lift::lift(p).expect("lift");
    opt::optimize_for_mir(&mut vm, &mut proc);

    // Every phi operand is a move or a re-boxing in the predecessor.
    for b in proc.layout.clone() {
        for phi in proc.phis(b) {
            for (k, v) in proc.inst(phi).operands.clone().into_iter().enumerate() {
                let i = v.as_inst().expect("materialized phi input");
                assert!(
                    matches!(proc.inst(i).op, IrOp::Move | IrOp::EraseType),
                    "phi input {k} is {:?}",
                    proc.inst(i).op
                );
                let pred = proc.block(b).preds[k];
                assert_eq!(proc.inst(i).block, Some(pred));
            }
        }
    }

    // No allocation opcodes survive into the MIR shape.
    assert_eq!(count_op(&proc, IrOp::ArrayNew), 0);
    assert_eq!(count_op(&proc, IrOp::TableNew), 0);
    assert_eq!(count_op(&proc, IrOp::Vdup), 0);
}
