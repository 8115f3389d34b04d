//! Lifts bytecode into the crude SSA form.
//!
//! Every jump target starts a block. Each block is translated with a local
//! per-slot value cache: reads materialize `load_local` on first demand,
//! writes stay in the cache and spill as `store_local` only at block exit.
//! The phi construction pass then removes the locals traffic entirely.

use std::collections::BTreeSet;

use glint_asm::{Opcode, Pos, Reg, FRAME_SIZE, REG_TARGET};
use glint_vm::gc::Gc;
use glint_vm::object::Proto;
use glint_vm::runtime;
use glint_vm::types::{Ty, ValueKind};
use glint_vm::value::Value;
use thiserror::Error;

use crate::constant::ConstData;
use crate::entities::{Block, Inst, ValueRef};
use crate::insn::IrOp;
use crate::proc::Procedure;

#[derive(Debug, Error)]
/// Why a prototype cannot be compiled; the interpreter keeps running it.
pub enum LiftError {
    /// The opcode has no IR counterpart.
    #[error("unsupported opcode for compilation: {0}")]
    Unsupported(Opcode),
    /// A jump leaves the bytecode range.
    #[error("branch target {0} out of range")]
    BadTarget(i64),
}

struct BlockLifter<'a> {
    proc: &'a mut Procedure,
    /// Label position -> block.
    targets: &'a [(Pos, Block)],
    cur: Block,
    bc: Pos,
    /// Per-slot value cache, indexed by `reg + shift`.
    locals: Vec<Option<ValueRef>>,
    shift: i32,
    call_args: Vec<ValueRef>,
}

impl<'a> BlockLifter<'a> {
    fn block_at(&self, pos: Pos) -> Result<Block, LiftError> {
        self.targets
            .iter()
            .find(|(p, _)| *p == pos)
            .map(|(_, b)| *b)
            .ok_or(LiftError::BadTarget(pos as i64))
    }

    fn slot(&self, r: Reg) -> usize {
        (r + self.shift) as usize
    }

    fn konst(&mut self, data: ConstData) -> ValueRef {
        self.proc.constant(data)
    }

    fn emit(&mut self, op: IrOp, operands: Vec<ValueRef>) -> Inst {
        self.proc.emit(self.cur, op, operands, self.bc)
    }

    fn get_reg(&mut self, r: Reg) -> ValueRef {
        if let Some(v) = self.locals[self.slot(r)] {
            return v;
        }
        let slot = self.konst(ConstData::I32(r));
        let mut v = ValueRef::Inst(self.emit(IrOp::LoadLocal, vec![slot]));
        if r == REG_TARGET {
            // The target slot always holds the running function.
            let dty = self.konst(ConstData::Dty(Ty::Fn));
            v = ValueRef::Inst(self.emit(IrOp::AssumeCast, vec![v, dty]));
        }
        let slot = self.slot(r);
        self.locals[slot] = Some(v);
        v
    }

    fn set_reg(&mut self, r: Reg, v: ValueRef) {
        let slot = self.slot(r);
        self.locals[slot] = Some(v);
    }

    /// Writes the dirty cache back so the next block can re-read it.
    fn spill(&mut self) {
        for idx in 0..self.locals.len() {
            let Some(v) = self.locals[idx] else { continue };
            let r = idx as i32 - self.shift;
            if let ValueRef::Inst(i) = v {
                // A cached load of the same slot is not a new definition.
                let insn = self.proc.inst(i);
                if insn.op == IrOp::LoadLocal {
                    if let Some(ConstData::I32(lr)) = self.proc.const_of(insn.operands[0]) {
                        if *lr == r {
                            continue;
                        }
                    }
                }
            }
            let slot = self.konst(ConstData::I32(r));
            self.emit(IrOp::StoreLocal, vec![slot, v]);
        }
    }

    fn gc_tick(&mut self) {
        self.emit(IrOp::GcTick, vec![]);
    }

    fn ccall(&mut self, nf: &'static glint_vm::object::NativeInfo, args: &[ValueRef]) -> Inst {
        let target = self.konst(ConstData::Native(nf));
        let ovl = self.konst(ConstData::I32(0));
        let mut operands = vec![target, ovl];
        operands.extend_from_slice(args);
        self.emit(IrOp::Ccall, operands)
    }
}

/// Lifts a prototype into an SSA procedure in crude locals form.
pub fn lift(proto: Gc<Proto>) -> Result<Procedure, LiftError> {
    let mut proc = Procedure::new(proto);
    let code = proto.code().to_vec();

    // Every jump target and fall-through continuation is a label.
    let mut labels: BTreeSet<Pos> = BTreeSet::new();
    labels.insert(0);
    for (i, insn) in code.iter().enumerate() {
        let ip = i as i64 + 1;
        let target = ip + insn.a() as i64;
        match insn.op() {
            Opcode::JMP => {
                check_target(target, code.len())?;
                labels.insert(target as Pos);
            }
            Opcode::JS | Opcode::JNS | Opcode::ITER => {
                check_target(target, code.len())?;
                check_target(ip, code.len())?;
                labels.insert(ip as Pos);
                labels.insert(target as Pos);
            }
            _ => {}
        }
    }

    // Blocks in bytecode order; the entry block covers position zero.
    let targets: Vec<(Pos, Block)> = labels
        .iter()
        .map(|pos| {
            let b = proc.add_block();
            proc.block_mut(b).bc_begin = *pos;
            (*pos, b)
        })
        .collect();
    for (idx, (_, b)) in targets.iter().enumerate() {
        let end = targets
            .get(idx + 1)
            .map(|(p, _)| *p)
            .unwrap_or(code.len() as Pos);
        proc.block_mut(*b).bc_end = end;
    }

    for (pos, b) in &targets {
        lift_block(&mut proc, &targets, *b, *pos, &code)?;
    }

    // Blocks the branches never reach are dropped before sorting.
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
        }
    }
    proc.topological_sort();
    Ok(proc)
}

fn check_target(target: i64, len: usize) -> Result<(), LiftError> {
    if target < 0 || target >= len as i64 {
        Err(LiftError::BadTarget(target))
    } else {
        Ok(())
    }
}

fn lift_block(
    proc: &mut Procedure,
    targets: &[(Pos, Block)],
    block: Block,
    begin: Pos,
    code: &[glint_asm::Instruction],
) -> Result<(), LiftError> {
    let proto = proc.proto;
    let end = proc.block(block).bc_end;
    let shift = (proto.num_args as usize + FRAME_SIZE) as i32;
    let mut lb = BlockLifter {
        proc,
        targets,
        cur: block,
        bc: begin,
        locals: vec![None; proto.num_locals as usize + proto.num_args as usize + FRAME_SIZE],
        shift,
        call_args: Vec::new(),
    };

    let mut ip = begin;
    while ip < end {
        lb.bc = ip;
        let insn = code[ip as usize];
        ip += 1;
        let (op, a, b, c) = insn.into_inner();

        match op {
            Opcode::NOP => {}

            Opcode::LNOT | Opcode::ANEG => {
                let vmop = lb.konst(ConstData::Vmop(op));
                let v = lb.get_reg(b);
                let i = lb.emit(IrOp::Unop, vec![vmop, v]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::MOV => {
                let v = lb.get_reg(b);
                lb.set_reg(a, v);
            }

            Opcode::AADD
            | Opcode::ASUB
            | Opcode::AMUL
            | Opcode::ADIV
            | Opcode::AMOD
            | Opcode::APOW => {
                let vmop = lb.konst(ConstData::Vmop(op));
                let (x, y) = (lb.get_reg(b), lb.get_reg(c));
                let i = lb.emit(IrOp::Binop, vec![vmop, x, y]);
                lb.set_reg(a, ValueRef::Inst(i));
            }

            Opcode::CEQ
            | Opcode::CNE
            | Opcode::CLT
            | Opcode::CGE
            | Opcode::CGT
            | Opcode::CLE => {
                let vmop = lb.konst(ConstData::Vmop(op));
                let (x, y) = (lb.get_reg(b), lb.get_reg(c));
                let i = lb.emit(IrOp::Compare, vec![vmop, x, y]);
                lb.set_reg(a, ValueRef::Inst(i));
            }

            Opcode::LAND | Opcode::LOR => {
                let (x, y) = (lb.get_reg(b), lb.get_reg(c));
                let cond = ValueRef::Inst(lb.emit(IrOp::CoerceBool, vec![x]));
                let (t, f) = if op == Opcode::LAND { (y, x) } else { (x, y) };
                let i = lb.emit(IrOp::Select, vec![cond, t, f]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::NCS => {
                let (x, y) = (lb.get_reg(b), lb.get_reg(c));
                let vmop = lb.konst(ConstData::Vmop(Opcode::CEQ));
                let nil = lb.konst(ConstData::Nil);
                let cond = ValueRef::Inst(lb.emit(IrOp::Compare, vec![vmop, x, nil]));
                let i = lb.emit(IrOp::Select, vec![cond, y, x]);
                lb.set_reg(a, ValueRef::Inst(i));
            }

            Opcode::CTY => {
                let Some(kind) = u8::try_from(c).ok().and_then(ValueKind::from_tag) else {
                    return Err(LiftError::Unsupported(op));
                };
                let v = lb.get_reg(b);
                let vty = lb.konst(ConstData::Vty(kind));
                let i = lb.emit(IrOp::TestType, vec![v, vty]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::CTYX => {
                let (x, y) = (lb.get_reg(b), lb.get_reg(c));
                let i = lb.ccall(&runtime::NF_INSTANCE_OF, &[x, y]);
                lb.set_reg(a, ValueRef::Inst(i));
            }

            Opcode::KIMM => {
                let k = ConstData::from_value(Value::from_raw(insn.xmm()));
                let v = lb.konst(k);
                lb.set_reg(a, v);
            }

            Opcode::CCAT => {
                lb.gc_tick();
                let first = lb.get_reg(a);
                let mut acc = ValueRef::Inst(lb.ccall(&runtime::NF_STR, &[first]));
                for i in 1..b {
                    let part = lb.get_reg(a + i);
                    let s = ValueRef::Inst(lb.ccall(&runtime::NF_STR, &[part]));
                    acc = ValueRef::Inst(lb.emit(IrOp::Vjoin, vec![acc, s]));
                }
                lb.set_reg(a, acc);
            }

            Opcode::SETEX => {
                let v = lb.get_reg(a);
                lb.emit(IrOp::SetException, vec![v]);
            }
            Opcode::GETEX => {
                let i = lb.emit(IrOp::GetException, vec![]);
                lb.set_reg(a, ValueRef::Inst(i));
            }

            Opcode::UGET => {
                let f = lb.get_reg(REG_TARGET);
                let idx = lb.konst(ConstData::I32(b));
                let i = lb.emit(IrOp::UvalGet, vec![f, idx]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::USET => {
                let f = lb.get_reg(REG_TARGET);
                let idx = lb.konst(ConstData::I32(a));
                let v = lb.get_reg(b);
                lb.emit(IrOp::UvalSet, vec![f, idx, v]);
            }

            Opcode::STRIV => {
                lb.gc_tick();
                let k = lb.konst(ConstData::from_value(Value::from_raw(insn.xmm())));
                let i = lb.ccall(&runtime::NF_OBJECT_NEW, &[k]);
                lb.set_reg(a, ValueRef::Inst(i));
            }

            Opcode::VACNT => {
                let i = lb.emit(IrOp::VaCount, vec![]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::VAGET => {
                let idx = lb.get_reg(b);
                let i = lb.emit(IrOp::VaGet, vec![idx]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::VACHK => {
                // count < required splits off an in-line raise path.
                let count = ValueRef::Inst(lb.emit(IrOp::VaCount, vec![]));
                let vmop = lb.konst(ConstData::Vmop(Opcode::CLT));
                let req = lb.konst(ConstData::I32(a));
                let cond = ValueRef::Inst(lb.emit(IrOp::Compare, vec![vmop, count, req]));

                let fail = lb.proc.add_block();
                let cont = lb.proc.add_block();
                let tfail = lb.konst(ConstData::Block(fail));
                let tcont = lb.konst(ConstData::Block(cont));
                lb.emit(IrOp::Jcc, vec![cond, tfail, tcont]);
                lb.proc.add_jump(lb.cur, fail);
                lb.proc.add_jump(lb.cur, cont);

                let exc = lb.konst(ConstData::from_value(Value::from_raw(insn.xmm())));
                let marker = lb.konst(ConstData::Exc);
                lb.proc.emit(fail, IrOp::SetException, vec![exc], lb.bc);
                lb.proc.emit(fail, IrOp::Ret, vec![marker], lb.bc);
                lb.proc.block_mut(fail).cold_hint = u8::MAX;

                // The remainder of the range lifts into the continuation.
                lb.cur = cont;
            }

            Opcode::ANEW => {
                lb.gc_tick();
                let n = lb.konst(ConstData::I32(b));
                let i = lb.emit(IrOp::ArrayNew, vec![n]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::TNEW => {
                lb.gc_tick();
                let n = lb.konst(ConstData::I32(b));
                let i = lb.emit(IrOp::TableNew, vec![n]);
                lb.set_reg(a, ValueRef::Inst(i));
            }

            Opcode::TGET | Opcode::TGETR | Opcode::SGET => {
                let raw = lb.konst(ConstData::Bool(op == Opcode::TGETR));
                let (key, obj) = (lb.get_reg(b), lb.get_reg(c));
                let i = lb.emit(IrOp::FieldGet, vec![raw, obj, key]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::TSET | Opcode::TSETR | Opcode::SSET => {
                lb.gc_tick();
                let raw = lb.konst(ConstData::Bool(op == Opcode::TSETR));
                let (val, key, obj) = (lb.get_reg(b), lb.get_reg(a), lb.get_reg(c));
                lb.emit(IrOp::FieldSet, vec![raw, obj, key, val]);
            }

            Opcode::FDUP => {
                lb.gc_tick();
                let template = proto.consts()[b as usize];
                let Some(f) = template.as_function() else {
                    return Err(LiftError::Unsupported(op));
                };
                let k = lb.konst(ConstData::FnRef(f));
                let d = ValueRef::Inst(lb.emit(IrOp::Vdup, vec![k]));
                let dty = lb.konst(ConstData::Dty(Ty::Fn));
                let cast = ValueRef::Inst(lb.emit(IrOp::AssumeCast, vec![d, dty]));
                for uv in 0..f.num_uval as i32 {
                    let idx = lb.konst(ConstData::I32(uv));
                    let v = lb.get_reg(c + uv);
                    lb.emit(IrOp::UvalSet, vec![cast, idx, v]);
                }
                lb.set_reg(a, cast);
            }

            Opcode::PUSHR => {
                let v = lb.get_reg(a);
                lb.call_args.push(v);
            }
            Opcode::PUSHI => {
                let k = lb.konst(ConstData::from_value(Value::from_raw(insn.xmm())));
                lb.call_args.push(k);
            }
            Opcode::CALL => {
                let n = b.max(0) as usize;
                if lb.call_args.len() != n + 2 {
                    return Err(LiftError::Unsupported(op));
                }
                lb.proc.max_stack_slot = lb.proc.max_stack_slot.max(n as u32 + 3);
                let args: Vec<ValueRef> = core::mem::take(&mut lb.call_args);
                let target = args[n];
                let this = args[n + 1];
                let mut operands = vec![target, this];
                // Pushed in reverse; the call reads them in logical order.
                operands.extend((0..n).map(|i| args[n - 1 - i]));
                let i = lb.emit(IrOp::Vcall, operands);
                lb.set_reg(a, ValueRef::Inst(i));
            }

            Opcode::TONUM => {
                let v = lb.get_reg(b);
                let i = lb.ccall(&runtime::NF_NUM, &[v]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::TOINT => {
                let v = lb.get_reg(b);
                let i = lb.ccall(&runtime::NF_INT, &[v]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::TOSTR => {
                lb.gc_tick();
                let v = lb.get_reg(b);
                let i = lb.ccall(&runtime::NF_STR, &[v]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::TOBOOL => {
                let v = lb.get_reg(b);
                let i = lb.emit(IrOp::CoerceBool, vec![v]);
                lb.set_reg(a, ValueRef::Inst(i));
            }

            Opcode::TRGET => {
                let obj = lb.get_reg(b);
                let idx = lb.konst(ConstData::F64(Value::number(c as f64).raw()));
                let i = lb.ccall(&runtime::NF_TRAIT_GET, &[obj, idx]);
                lb.set_reg(a, ValueRef::Inst(i));
            }
            Opcode::TRSET => {
                let obj = lb.get_reg(a);
                let v = lb.get_reg(b);
                let idx = lb.konst(ConstData::F64(Value::number(c as f64).raw()));
                lb.ccall(&runtime::NF_TRAIT_SET, &[obj, idx, v]);
            }

            Opcode::RET => {
                let v = lb.get_reg(a);
                lb.emit(IrOp::Ret, vec![v]);
                return Ok(());
            }

            Opcode::JMP => {
                let tt = lb.block_at((ip as i64 + a as i64) as Pos)?;
                lb.spill();
                let k = lb.konst(ConstData::Block(tt));
                lb.emit(IrOp::Jmp, vec![k]);
                let cur = lb.cur;
                lb.proc.add_jump(cur, tt);
                return Ok(());
            }
            Opcode::JS | Opcode::JNS => {
                let mut tf = lb.block_at(ip)?;
                let mut tt = lb.block_at((ip as i64 + a as i64) as Pos)?;
                if op == Opcode::JNS {
                    core::mem::swap(&mut tt, &mut tf);
                }
                lb.spill();
                let mut cond = lb.get_reg(b);
                if lb.proc.value_ty(cond) != Ty::I1 {
                    cond = ValueRef::Inst(lb.emit(IrOp::CoerceBool, vec![cond]));
                }
                let kt = lb.konst(ConstData::Block(tt));
                let kf = lb.konst(ConstData::Block(tf));
                lb.emit(IrOp::Jcc, vec![cond, kt, kf]);
                let cur = lb.cur;
                lb.proc.add_jump(cur, tt);
                lb.proc.add_jump(cur, tf);
                return Ok(());
            }

            Opcode::UD | Opcode::SETEH | Opcode::ITER => {
                return Err(LiftError::Unsupported(op));
            }
        }
    }

    // The range ended on a label: jump to the continuation.
    if !lb.call_args.is_empty() {
        return Err(LiftError::Unsupported(Opcode::CALL));
    }
    let tt = lb.block_at(end)?;
    lb.spill();
    let k = lb.konst(ConstData::Block(tt));
    lb.emit(IrOp::Jmp, vec![k]);
    let cur = lb.cur;
    lb.proc.add_jump(cur, tt);
    Ok(())
}
