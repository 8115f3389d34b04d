use glint_asm::{reg_arg, Instruction as I, Opcode};
use glint_ir::mir::{MOp, MProcedure, MReg, VOp, VREG_FIRST};
use glint_ir::regalloc::{allocate_registers, RegLimits};
use glint_vm::gc::Gc;
use glint_vm::prelude::*;

fn proto(vm: &mut Vm, code: &[I], locals: u32, args: u32) -> Gc<Proto> {
    Proto::create(
        vm,
        &ProtoDesc {
            code,
            consts: &[],
            lines: &[],
            num_locals: locals,
            num_args: args,
            num_uval: 0,
            is_vararg: false,
            chunk: "machine",
            src_line: 1,
        },
    )
    .expect("prototype")
}

fn num(v: f64) -> Value {
    Value::number(v)
}

fn loop_code() -> Vec<I> {
    vec![
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
    ]
}

/// Every register in an allocated procedure is physical, a flag, or one of
/// the reserved pseudo names.
fn assert_fully_allocated(m: &MProcedure) {
    for b in &m.blocks {
        for insn in &b.insts {
            insn.for_each_reg(|r, _| {
                let reserved = r.is_virt() && r.id > 0 && r.id < VREG_FIRST;
                assert!(
                    r.is_phys() || r.is_flag() || reserved,
                    "unallocated register {r:?}"
                );
            });
        }
    }
}

#[test]
fn the_loop_compiles_to_allocated_mir() {
    let mut vm = Vm::new();
    let p = proto(&mut vm, &loop_code(), 5, 0);
    let machine = glint_ir::compile(&mut vm, p).expect("compile");

    assert!(!machine.blocks.is_empty());
    assert_fully_allocated(&machine);
    assert_eq!(machine.used_stack % 16, 0);

    // Exactly one virtual return and at least one trap from the splits.
    let mut rets = 0;
    let mut traps = 0;
    for b in &machine.blocks {
        for insn in &b.insts {
            if insn.is(VOp::Ret) {
                rets += 1;
            }
            if insn.is(VOp::Unreachable) {
                traps += 1;
            }
        }
    }
    assert_eq!(rets, 1);
    assert!(traps >= 1);
}

#[test]
fn no_self_moves_survive_allocation() {
    let mut vm = Vm::new();
    let p = proto(&mut vm, &loop_code(), 5, 0);
    let machine = glint_ir::compile(&mut vm, p).expect("compile");

    for b in &machine.blocks {
        for insn in &b.insts {
            if insn.is(VOp::MovI) || insn.is(VOp::MovF) {
                if let MOp::Reg(src) = insn.args[0] {
                    assert_ne!(src, insn.out, "self move survived");
                }
            }
        }
    }
}

#[test]
fn register_pressure_forces_spills_and_still_colors() {
    let mut vm = Vm::new();

    // Eight sums kept live until one final reduction chain.
    let mut code = Vec::new();
    for i in 0..8 {
        code.push(I::ext(Opcode::KIMM, 8 + i, num(i as f64).raw()));
        code.push(I::new(Opcode::AADD, i, reg_arg(0), 8 + i));
    }
    for i in 1..8 {
        code.push(I::new(Opcode::AADD, 0, 0, i));
    }
    code.push(I::new(Opcode::RET, 0, 0, 0));

    let p = proto(&mut vm, &code, 16, 1);
    let mut proc = glint_ir::lift::lift(p).expect("lift");
    glint_ir::opt::optimize_for_mir(&mut vm, &mut proc);
    let mut machine = glint_ir::lower::lower(&proc);

    // Three registers per class cannot hold eight live doubles.
    allocate_registers(
        &mut machine,
        RegLimits { gp: 3, fp: 3, gp_volatile: 2, fp_volatile: 2 },
    );

    assert_fully_allocated(&machine);
    assert!(machine.used_stack > 0, "pressure did not spill");
    assert_eq!(machine.used_stack % 16, 0);

    // Spill traffic goes through load/store pairs the spiller marked.
    let spill_code = machine
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter())
        .filter(|i| {
            i.no_spill
                && (i.is(VOp::LoadF64) || i.is(VOp::StoreF64) || i.is(VOp::LoadI64) || i.is(VOp::StoreI64))
        })
        .count();
    assert!(spill_code > 0);
}

#[test]
fn colors_stay_within_the_register_file() {
    let mut vm = Vm::new();
    let p = proto(&mut vm, &loop_code(), 5, 0);
    let mut proc = glint_ir::lift::lift(p).expect("lift");
    glint_ir::opt::optimize_for_mir(&mut vm, &mut proc);
    let mut machine = glint_ir::lower::lower(&proc);

    let limits = RegLimits { gp: 6, fp: 6, gp_volatile: 3, fp_volatile: 3 };
    allocate_registers(&mut machine, limits);

    for b in &machine.blocks {
        for insn in &b.insts {
            insn.for_each_reg(|r, _| {
                if r.is_phys() && r.id != glint_ir::mir::PHYS_SP {
                    let color = r.id.unsigned_abs() as usize;
                    let limit = if r.is_fp() { limits.fp } else { limits.gp };
                    assert!(
                        color <= limit.max(3),
                        "{r:?} out of the register file"
                    );
                }
            });
        }
    }
}
