//! SSA to MIR lowering.
//!
//! Instructions are visited in program order. Each SSA value gets a virtual
//! register the first time it is materialized and keeps it afterwards; phi
//! webs were pre-coalesced by the finalizer, so every phi input move yields
//! into the phi's register.

use std::collections::HashMap;

use glint_asm::Opcode;
use glint_vm::object::Function;
use glint_vm::types::{Ty, ValueKind};
use glint_vm::value::Value;

use crate::constant::ConstData;
use crate::entities::{Block, Inst, ValueRef};
use crate::insn::IrOp;
use crate::mir::{Cond, MInsn, MMem, MOp, MProcedure, MReg, VOp, VREG_ARGS, VREG_NARGS, VREG_TOS, VREG_VM};
use crate::proc::Procedure;

/// Frame displacement of the return slot: the result is left in the self
/// slot, right below the locals base.
pub const RET_SLOT_DISP: i32 = -8;

struct Lower<'a> {
    proc: &'a Procedure,
    out: MProcedure,
    value_map: HashMap<Inst, MReg>,
    block_map: HashMap<Block, usize>,
    cur: usize,
}

impl<'a> Lower<'a> {
    fn emit(&mut self, op: VOp, out: MReg, args: &[MOp]) {
        self.out.blocks[self.cur].insts.push(MInsn::v(op, out, args));
    }

    fn is_fp_ty(t: Ty) -> bool {
        t.is_fp()
    }

    /// The virtual register holding an instruction result, allocated on
    /// first demand.
    fn reg_of(&mut self, i: Inst) -> MReg {
        if let Some(r) = self.value_map.get(&i) {
            return *r;
        }
        let r = if Self::is_fp_ty(self.proc.inst(i).vt) {
            self.out.next_fp()
        } else {
            self.out.next_gp()
        };
        self.value_map.insert(i, r);
        r
    }

    /// Boxed bits of a constant operand.
    fn const_bits(&self, c: &ConstData) -> i64 {
        match c {
            ConstData::I32(v) => *v as i64,
            ConstData::I64(v) => *v,
            _ => c
                .to_value()
                .map(|v| v.raw() as i64)
                .unwrap_or_default(),
        }
    }

    /// A GP-consumable operand: register or immediate bits.
    fn use_gp(&mut self, v: ValueRef) -> MOp {
        match v {
            ValueRef::Inst(i) => {
                let r = self.reg_of(i);
                if r.is_fp() {
                    // A typed double flowing into a GP context re-boxes.
                    let g = self.out.next_gp();
                    self.emit(VOp::Bitcast, g, &[MOp::Reg(r)]);
                    MOp::Reg(g)
                } else {
                    MOp::Reg(r)
                }
            }
            ValueRef::Const(c) => MOp::Imm(self.const_bits(self.proc.const_data(c))),
        }
    }

    /// An FP-consumable operand: register or pool constant.
    fn use_fp(&mut self, v: ValueRef) -> MOp {
        match v {
            ValueRef::Inst(i) => {
                let r = self.reg_of(i);
                if r.is_fp() {
                    MOp::Reg(r)
                } else {
                    let f = self.out.next_fp();
                    self.emit(VOp::Bitcast, f, &[MOp::Reg(r)]);
                    MOp::Reg(f)
                }
            }
            ValueRef::Const(c) => {
                let bits = self.const_bits(self.proc.const_data(c)) as u64;
                MOp::Mem(self.out.add_const(bits))
            }
        }
    }

    /// Boxes a value into a fresh GP register using the NaN-boxing formula
    /// for its IR type.
    fn box_value(&mut self, v: ValueRef) -> MReg {
        let dst = self.out.next_gp();
        match v {
            ValueRef::Const(c) => {
                let bits = self
                    .proc
                    .const_data(c)
                    .to_value()
                    .map(|x| x.raw())
                    .unwrap_or(Value::NIL.raw());
                self.emit(VOp::MovI, dst, &[MOp::Imm(bits as i64)]);
            }
            ValueRef::Inst(i) => {
                let src = self.reg_of(i);
                match self.proc.inst(i).vt {
                    Ty::F64 | Ty::F32 => {
                        self.emit(VOp::Bitcast, dst, &[MOp::Reg(src)]);
                    }
                    Ty::I1 => {
                        self.emit(VOp::MovI, dst, &[MOp::Reg(src)]);
                        self.emit(
                            VOp::OrI,
                            dst,
                            &[MOp::Reg(dst), MOp::Imm(Value::tag_mix(ValueKind::Bool) as i64)],
                        );
                    }
                    Ty::I8 | Ty::I16 | Ty::I32 | Ty::I64 => {
                        let f = self.out.next_fp();
                        self.emit(VOp::CvtI2F, f, &[MOp::Reg(src)]);
                        self.emit(VOp::Bitcast, dst, &[MOp::Reg(f)]);
                    }
                    t if t.is_gc() => {
                        let kind = t.to_value_kind().expect("gc type maps to a kind");
                        self.emit(VOp::MovI, dst, &[MOp::Reg(src)]);
                        self.emit(
                            VOp::OrI,
                            dst,
                            &[MOp::Reg(dst), MOp::Imm(Value::tag_mix(kind) as i64)],
                        );
                    }
                    // Already boxed (`any`), or a marker constant path.
                    _ => {
                        self.emit(VOp::MovI, dst, &[MOp::Reg(src)]);
                    }
                }
            }
        }
        dst
    }

    fn local_mem(&self, slot: i32) -> MMem {
        MMem::base_disp(MReg::virt(VREG_ARGS), slot * 8)
    }

    fn lower_inst(&mut self, i: Inst) {
        let insn = self.proc.inst(i).clone();
        match insn.op {
            IrOp::LoadLocal => {
                let slot = match self.proc.const_of(insn.operands[0]) {
                    Some(ConstData::I32(r)) => *r,
                    _ => 0,
                };
                let dst = self.reg_of(i);
                self.emit(VOp::LoadI64, dst, &[MOp::Mem(self.local_mem(slot))]);
            }
            IrOp::StoreLocal => {
                let slot = match self.proc.const_of(insn.operands[0]) {
                    Some(ConstData::I32(r)) => *r,
                    _ => 0,
                };
                let v = insn.operands[1];
                if Self::is_fp_ty(self.proc.value_ty(v)) {
                    let src = self.use_fp(v);
                    self.emit(VOp::StoreF64, MReg::NULL, &[MOp::Mem(self.local_mem(slot)), src]);
                } else {
                    let src = self.box_value(v);
                    self.emit(
                        VOp::StoreI64,
                        MReg::NULL,
                        &[MOp::Mem(self.local_mem(slot)), MOp::Reg(src)],
                    );
                }
            }

            IrOp::Binop => {
                let op = match self.proc.const_of(insn.operands[0]) {
                    Some(ConstData::Vmop(op)) => *op,
                    _ => Opcode::AADD,
                };
                let dst = self.reg_of(i);
                let lhs = self.use_fp(insn.operands[1]);
                let rhs = self.use_fp(insn.operands[2]);
                self.emit(VOp::MovF, dst, &[lhs]);
                let vop = match op {
                    Opcode::AADD => VOp::AddF,
                    Opcode::ASUB => VOp::SubF,
                    Opcode::AMUL => VOp::MulF,
                    _ => VOp::DivF,
                };
                self.emit(vop, dst, &[MOp::Reg(dst), rhs]);
            }
            IrOp::Unop => {
                let dst = self.reg_of(i);
                match self.proc.const_of(insn.operands[0]) {
                    Some(ConstData::Vmop(Opcode::LNOT)) => {
                        let v = self.use_gp(insn.operands[1]);
                        self.emit(VOp::MovI, dst, &[v]);
                        self.emit(VOp::XorI, dst, &[MOp::Reg(dst), MOp::Imm(1)]);
                    }
                    _ => {
                        let v = self.use_fp(insn.operands[1]);
                        self.emit(VOp::MovF, dst, &[v]);
                        self.emit(VOp::NegF, dst, &[MOp::Reg(dst)]);
                    }
                }
            }
            IrOp::BoolAnd | IrOp::BoolOr | IrOp::BoolXor => {
                let dst = self.reg_of(i);
                let a = self.use_gp(insn.operands[0]);
                let b = self.use_gp(insn.operands[1]);
                self.emit(VOp::MovI, dst, &[a]);
                let vop = match insn.op {
                    IrOp::BoolAnd => VOp::AndI,
                    IrOp::BoolOr => VOp::OrI,
                    _ => VOp::XorI,
                };
                self.emit(vop, dst, &[MOp::Reg(dst), b]);
            }

            IrOp::Compare => {
                let op = match self.proc.const_of(insn.operands[0]) {
                    Some(ConstData::Vmop(op)) => *op,
                    _ => Opcode::CEQ,
                };
                let dst = self.reg_of(i);
                let lhs_ty = self.proc.value_ty(insn.operands[1]);
                let flag = self.out.next_flag();
                // Normalize the greater-than forms by swapping.
                let (a_idx, b_idx, cond) = match op {
                    Opcode::CGT => (2, 1, Cond::FLt),
                    Opcode::CGE => (2, 1, Cond::FLe),
                    Opcode::CLT => (1, 2, Cond::FLt),
                    Opcode::CLE => (1, 2, Cond::FLe),
                    Opcode::CNE => (1, 2, Cond::Ne),
                    _ => (1, 2, Cond::Eq),
                };
                if Self::is_fp_ty(lhs_ty) || matches!(cond, Cond::FLt | Cond::FLe) {
                    let a = self.use_fp(insn.operands[a_idx]);
                    let b = self.use_fp(insn.operands[b_idx]);
                    self.emit(VOp::CmpF, flag, &[a, b]);
                } else {
                    let a = self.use_gp(insn.operands[a_idx]);
                    let b = self.use_gp(insn.operands[b_idx]);
                    self.emit(VOp::CmpI, flag, &[a, b]);
                }
                self.emit(VOp::Setcc, dst, &[MOp::Reg(flag), MOp::Imm(cond as i64)]);
            }

            IrOp::TestType => {
                let dst = self.reg_of(i);
                let kind = match self.proc.const_of(insn.operands[1]) {
                    Some(ConstData::Vty(k)) => *k,
                    _ => ValueKind::Nil,
                };
                let v = self.use_gp(insn.operands[0]);
                // Rotate the tag into the low bits and mask it out.
                let t = self.out.next_gp();
                self.emit(VOp::MovI, t, &[v]);
                self.emit(VOp::RolI, t, &[MOp::Reg(t), MOp::Imm(17)]);
                self.emit(VOp::AndI, t, &[MOp::Reg(t), MOp::Imm(0x1_ffff)]);
                let flag = self.out.next_flag();
                if kind == ValueKind::Number {
                    self.emit(
                        VOp::CmpI,
                        flag,
                        &[MOp::Reg(t), MOp::Imm(Value::number_tag_bound() as i64)],
                    );
                    self.emit(VOp::Setcc, dst, &[MOp::Reg(flag), MOp::Imm(Cond::Ult as i64)]);
                } else {
                    self.emit(
                        VOp::CmpI,
                        flag,
                        &[MOp::Reg(t), MOp::Imm(Value::tag_pattern(kind) as i64)],
                    );
                    self.emit(VOp::Setcc, dst, &[MOp::Reg(flag), MOp::Imm(Cond::Eq as i64)]);
                }
            }

            IrOp::AssumeCast => {
                let dst = self.reg_of(i);
                let src = self.use_gp(insn.operands[0]);
                match insn.vt {
                    Ty::F64 | Ty::F32 => {
                        self.emit(VOp::Bitcast, dst, &[src]);
                    }
                    Ty::I1 => {
                        self.emit(VOp::MovI, dst, &[src]);
                        self.emit(VOp::AndI, dst, &[MOp::Reg(dst), MOp::Imm(1)]);
                    }
                    t if t.is_gc() => {
                        self.emit(VOp::MovI, dst, &[src]);
                        self.emit(
                            VOp::AndI,
                            dst,
                            &[MOp::Reg(dst), MOp::Imm(Value::payload_mask() as i64)],
                        );
                    }
                    _ => {
                        self.emit(VOp::MovI, dst, &[src]);
                    }
                }
            }

            IrOp::CoerceBool => {
                // Truthy unless the bits spell false or nil.
                let dst = self.reg_of(i);
                let v = self.use_gp(insn.operands[0]);
                let t = self.out.next_gp();
                let f1 = self.out.next_flag();
                self.emit(VOp::CmpI, f1, &[v, MOp::Imm(Value::FALSE.raw() as i64)]);
                self.emit(VOp::Setcc, dst, &[MOp::Reg(f1), MOp::Imm(Cond::Ne as i64)]);
                let f2 = self.out.next_flag();
                self.emit(VOp::CmpI, f2, &[v, MOp::Imm(Value::NIL.raw() as i64)]);
                self.emit(VOp::Setcc, t, &[MOp::Reg(f2), MOp::Imm(Cond::Ne as i64)]);
                self.emit(VOp::AndI, dst, &[MOp::Reg(dst), MOp::Reg(t)]);
            }

            IrOp::Move => {
                let dst = self.reg_of(i);
                if dst.is_fp() {
                    let src = self.use_fp(insn.operands[0]);
                    self.emit(VOp::MovF, dst, &[src]);
                } else {
                    let src = self.use_gp(insn.operands[0]);
                    self.emit(VOp::MovI, dst, &[src]);
                }
            }
            IrOp::EraseType => {
                let boxed = self.box_value(insn.operands[0]);
                let dst = self.reg_of(i);
                self.emit(VOp::MovI, dst, &[MOp::Reg(boxed)]);
            }
            IrOp::Select => {
                let dst = self.reg_of(i);
                let cond = self.use_gp(insn.operands[0]);
                let a = self.use_gp(insn.operands[1]);
                let b = self.use_gp(insn.operands[2]);
                self.emit(VOp::Select, dst, &[cond, a, b]);
            }
            IrOp::Phi => {
                // All inputs were coalesced into the phi's register.
                let _ = self.reg_of(i);
            }

            IrOp::GcTick => {
                self.emit(
                    VOp::Call,
                    MReg::NULL,
                    &[MOp::Sym("gc_step"), MOp::Reg(MReg::virt(VREG_VM))],
                );
            }
            IrOp::SetException => {
                let v = self.box_value(insn.operands[0]);
                self.emit(
                    VOp::Call,
                    MReg::NULL,
                    &[MOp::Sym("set_exception"), MOp::Reg(MReg::virt(VREG_VM)), MOp::Reg(v)],
                );
            }
            IrOp::GetException => {
                let dst = self.reg_of(i);
                self.emit(
                    VOp::Call,
                    dst,
                    &[MOp::Sym("get_exception"), MOp::Reg(MReg::virt(VREG_VM))],
                );
            }

            IrOp::UvalGet => {
                let dst = self.reg_of(i);
                let f = self.use_gp(insn.operands[0]);
                let idx = self
                    .proc
                    .const_of(insn.operands[1])
                    .and_then(|c| c.to_i64())
                    .unwrap_or(0) as i32;
                let ptr = self.out.next_gp();
                self.emit(VOp::MovI, ptr, &[f]);
                self.emit(
                    VOp::AndI,
                    ptr,
                    &[MOp::Reg(ptr), MOp::Imm(Value::payload_mask() as i64)],
                );
                let disp = Function::UPVALS_OFFSET as i32 + idx * 8;
                self.emit(VOp::LoadI64, dst, &[MOp::Mem(MMem::base_disp(ptr, disp))]);
            }
            IrOp::UvalSet => {
                let f = self.use_gp(insn.operands[0]);
                let idx = self
                    .proc
                    .const_of(insn.operands[1])
                    .and_then(|c| c.to_i64())
                    .unwrap_or(0) as i32;
                let v = self.box_value(insn.operands[2]);
                let ptr = self.out.next_gp();
                self.emit(VOp::MovI, ptr, &[f]);
                self.emit(
                    VOp::AndI,
                    ptr,
                    &[MOp::Reg(ptr), MOp::Imm(Value::payload_mask() as i64)],
                );
                let disp = Function::UPVALS_OFFSET as i32 + idx * 8;
                self.emit(
                    VOp::StoreI64,
                    MReg::NULL,
                    &[MOp::Mem(MMem::base_disp(ptr, disp)), MOp::Reg(v)],
                );
            }

            IrOp::VaCount => {
                let dst = self.reg_of(i);
                self.emit(VOp::MovI, dst, &[MOp::Reg(MReg::virt(VREG_NARGS))]);
            }
            IrOp::VaGet => {
                // addr = args - 8*(3 + idx); the count check ran upstream.
                let dst = self.reg_of(i);
                let idx = self.use_gp(insn.operands[0]);
                let t = self.out.next_gp();
                self.emit(VOp::MovI, t, &[idx]);
                self.emit(VOp::ShlI, t, &[MOp::Reg(t), MOp::Imm(3)]);
                let base = self.out.next_gp();
                self.emit(VOp::MovI, base, &[MOp::Reg(MReg::virt(VREG_ARGS))]);
                self.emit(VOp::SubI, base, &[MOp::Reg(base), MOp::Reg(t)]);
                self.emit(VOp::LoadI64, dst, &[MOp::Mem(MMem::base_disp(base, -24))]);
            }

            IrOp::Ccall => {
                let nf = match self.proc.const_of(insn.operands[0]) {
                    Some(ConstData::Native(nf)) => *nf,
                    _ => unreachable!("ccall without a native descriptor"),
                };
                // Arguments spill to the evaluation stack region.
                for (k, arg) in insn.operands[2..].iter().enumerate() {
                    let boxed = self.box_value(*arg);
                    let mem = MMem::base_disp(MReg::virt(VREG_TOS), (k as i32) * 8);
                    self.emit(VOp::StoreI64, MReg::NULL, &[MOp::Mem(mem), MOp::Reg(boxed)]);
                }
                let dst = if insn.vt == Ty::None { MReg::NULL } else { self.reg_of(i) };
                self.emit(
                    VOp::Call,
                    dst,
                    &[
                        MOp::Sym(nf.name),
                        MOp::Reg(MReg::virt(VREG_VM)),
                        MOp::Imm(insn.operands.len() as i64 - 2),
                    ],
                );
            }
            IrOp::Vcall => {
                // Spill target, self and arguments at descending offsets
                // from the current stack top.
                for (k, arg) in insn.operands.iter().enumerate() {
                    let boxed = self.box_value(*arg);
                    let mem = MMem::base_disp(MReg::virt(VREG_TOS), (k as i32) * 8);
                    self.emit(VOp::StoreI64, MReg::NULL, &[MOp::Mem(mem), MOp::Reg(boxed)]);
                }
                let dst = self.reg_of(i);
                self.emit(
                    VOp::Call,
                    dst,
                    &[
                        MOp::Sym("vm_call"),
                        MOp::Reg(MReg::virt(VREG_VM)),
                        MOp::Imm(insn.operands.len() as i64 - 2),
                    ],
                );
            }

            IrOp::Jmp => {
                let target = self.proc.target_of(insn.operands[0]).expect("jmp target");
                let idx = self.block_map[&target];
                self.emit(VOp::Jmp, MReg::NULL, &[MOp::Imm(idx as i64)]);
            }
            IrOp::Jcc => {
                let cond = self.use_gp(insn.operands[0]);
                let tt = self.proc.target_of(insn.operands[1]).expect("jcc target");
                let tf = self.proc.target_of(insn.operands[2]).expect("jcc target");
                let flag = self.out.next_flag();
                self.emit(VOp::CmpI, flag, &[cond, MOp::Imm(0)]);
                self.emit(
                    VOp::Js,
                    MReg::NULL,
                    &[
                        MOp::Reg(flag),
                        MOp::Imm(self.block_map[&tt] as i64),
                        MOp::Imm(self.block_map[&tf] as i64),
                    ],
                );
            }
            IrOp::Ret => {
                let boxed = self.box_value(insn.operands[0]);
                let mem = MMem::base_disp(MReg::virt(VREG_ARGS), RET_SLOT_DISP);
                self.emit(VOp::StoreI64, MReg::NULL, &[MOp::Mem(mem), MOp::Reg(boxed)]);
                self.emit(VOp::Ret, MReg::NULL, &[]);
            }
            IrOp::Unreachable => {
                self.emit(VOp::Unreachable, MReg::NULL, &[]);
            }

            // Shapes the preparation pass must have lowered already.
            IrOp::ArrayNew
            | IrOp::TableNew
            | IrOp::FieldGet
            | IrOp::FieldSet
            | IrOp::Vlen
            | IrOp::Vdup
            | IrOp::Vjoin
            | IrOp::Vin => {
                unreachable!("{:?} survived prepare_for_mir", insn.op)
            }
        }
    }
}

/// Lowers a finalized SSA procedure into machine IR.
pub fn lower(proc: &Procedure) -> MProcedure {
    let mut l = Lower {
        proc,
        out: MProcedure::default(),
        value_map: HashMap::new(),
        block_map: HashMap::new(),
        cur: 0,
    };
    l.out.max_stack_slot = proc.max_stack_slot;

    for b in &proc.layout {
        let idx = l.out.add_block();
        let data = proc.block(*b);
        l.out.blocks[idx].hot = data.loop_depth as i32 - data.cold_hint as i32;
        l.block_map.insert(*b, idx);
    }
    for b in &proc.layout {
        for s in &proc.block(*b).succs {
            l.out.add_jump(l.block_map[b], l.block_map[s]);
        }
    }

    // Phi coalescing: the phi and every input move share one register.
    for b in &proc.layout {
        for phi in proc.phis(*b) {
            let r = l.reg_of(phi);
            for v in proc.inst(phi).operands.clone() {
                if let ValueRef::Inst(input) = v {
                    l.value_map.insert(input, r);
                }
            }
        }
    }

    for b in &proc.layout {
        l.cur = l.block_map[b];
        for i in proc.block(*b).insts.clone() {
            l.lower_inst(i);
        }
    }
    l.out
}
