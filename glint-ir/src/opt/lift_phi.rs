//! Phi construction over the crude locals form, after Braun et al.:
//! local value numbering per block, then recursive resolution of
//! block-entry values with cycle-breaking empty phis and trivial-phi
//! removal.

use std::collections::HashMap;

use glint_asm::Reg;

use crate::constant::ConstData;
use crate::entities::{Block, Inst, ValueRef};
use crate::insn::IrOp;
use crate::proc::Procedure;

struct PhiBuilder<'a> {
    proc: &'a mut Procedure,
    /// Last definition of a slot at the end of a block.
    exit_defs: HashMap<(Block, Reg), ValueRef>,
    /// Resolved value of a slot at the entry of a block.
    entry_defs: HashMap<(Block, Reg), ValueRef>,
}

impl<'a> PhiBuilder<'a> {
    fn slot_of(&self, v: ValueRef) -> Option<Reg> {
        let i = v.as_inst()?;
        let insn = self.proc.inst(i);
        match self.proc.const_of(insn.operands[0]) {
            Some(ConstData::I32(r)) => Some(*r),
            _ => None,
        }
    }

    /// Value of `r` flowing out of `b`.
    fn read_at_exit(&mut self, b: Block, r: Reg) -> ValueRef {
        if let Some(v) = self.exit_defs.get(&(b, r)).copied() {
            // A deferred load only forwards the entry value; resolving
            // through it would freeze an unresolved placeholder into phis.
            let is_own_load = v.as_inst().is_some_and(|i| {
                self.proc.inst(i).op == IrOp::LoadLocal
                    && self.proc.inst(i).block == Some(b)
                    && self.slot_of(v) == Some(r)
            });
            if !is_own_load {
                return v;
            }
        } else {
            return self.read_at_entry(b, r);
        }
        self.read_at_entry(b, r)
    }

    /// Value of `r` flowing into `b`.
    fn read_at_entry(&mut self, b: Block, r: Reg) -> ValueRef {
        if let Some(v) = self.entry_defs.get(&(b, r)) {
            return *v;
        }

        let preds = self.proc.block(b).preds.clone();
        let v = if preds.is_empty() {
            // The entry block reads the frame slot itself.
            let slot = self.proc.constant(ConstData::I32(r));
            let load = self.proc.create(IrOp::LoadLocal, vec![slot], 0);
            self.proc.insert_front(b, load);
            ValueRef::Inst(load)
        } else if preds.len() == 1 {
            self.read_at_exit(preds[0], r)
        } else {
            // Seed an empty phi first so cycles terminate on it.
            let phi = self.proc.create(IrOp::Phi, vec![], 0);
            self.proc.insert_front(b, phi);
            self.entry_defs.insert((b, r), ValueRef::Inst(phi));
            for p in preds {
                let incoming = self.read_at_exit(p, r);
                self.proc.push_operand(phi, incoming);
            }
            self.proc.update(phi);
            self.try_remove_trivial_phi(phi)
        };
        self.entry_defs.insert((b, r), v);
        v
    }

    /// A phi whose operands all agree (or self-reference) forwards the one
    /// distinct value.
    fn try_remove_trivial_phi(&mut self, phi: Inst) -> ValueRef {
        let mut same: Option<ValueRef> = None;
        for op in self.proc.inst(phi).operands.clone() {
            if op == ValueRef::Inst(phi) || Some(op) == same {
                continue;
            }
            if same.is_some() {
                return ValueRef::Inst(phi);
            }
            same = Some(op);
        }
        let Some(same) = same else {
            return ValueRef::Inst(phi);
        };

        self.proc.replace_all_uses(phi, same);
        self.proc.erase(phi);
        for v in self.entry_defs.values_mut().chain(self.exit_defs.values_mut()) {
            if *v == ValueRef::Inst(phi) {
                *v = same;
            }
        }
        same
    }
}

/// Completes phi construction: replaces every block-crossing `load_local`
/// with the flowing definition, removes redundant local stores and renames
/// the SSA registers.
pub fn lift_phi(proc: &mut Procedure) {
    let mut pb = PhiBuilder {
        proc,
        exit_defs: HashMap::new(),
        entry_defs: HashMap::new(),
    };

    // Pass 1: per-block local value numbering. Loads after a store in the
    // same block forward the stored value; the rest are deferred.
    let mut deferred: Vec<(Inst, Reg, Block)> = Vec::new();
    for b in pb.proc.layout.clone() {
        let mut cur: HashMap<Reg, ValueRef> = HashMap::new();
        for i in pb.proc.block(b).insts.clone() {
            match pb.proc.inst(i).op {
                IrOp::StoreLocal => {
                    if let Some(r) = pb.slot_of(ValueRef::Inst(i)) {
                        cur.insert(r, pb.proc.inst(i).operands[1]);
                    }
                }
                IrOp::LoadLocal => {
                    if let Some(r) = pb.slot_of(ValueRef::Inst(i)) {
                        match cur.get(&r) {
                            Some(v) => {
                                let v = *v;
                                pb.proc.replace_all_uses(i, v);
                            }
                            None => {
                                deferred.push((i, r, b));
                                cur.insert(r, ValueRef::Inst(i));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        for (r, v) in cur {
            pb.exit_defs.insert((b, r), v);
        }
    }

    // Pass 2: resolve deferred loads against the predecessors. The entry
    // block keeps its loads: they are the real frame reads.
    let entry = pb.proc.entry();
    for (load, r, b) in deferred {
        if b == entry {
            continue;
        }
        let preds = pb.proc.block(b).preds.clone();
        let v = if preds.is_empty() {
            continue;
        } else if preds.len() == 1 {
            pb.read_at_exit(preds[0], r)
        } else {
            pb.read_at_entry(b, r)
        };
        if v != ValueRef::Inst(load) {
            pb.proc.replace_all_uses(load, v);
            pb.proc.erase(load);
            for memo in pb.entry_defs.values_mut().chain(pb.exit_defs.values_mut()) {
                if *memo == ValueRef::Inst(load) {
                    *memo = v;
                }
            }
        }
    }

    // Pass 3: stores to plain locals are dead once everything reads SSA
    // values; stores to the calling-convention slots stay.
    for b in pb.proc.layout.clone() {
        for i in pb.proc.block(b).insts.clone() {
            if pb.proc.inst(i).op == IrOp::StoreLocal && !pb.proc.inst(i).is_volatile() {
                if let Some(r) = pb.slot_of(ValueRef::Inst(i)) {
                    if r >= 0 {
                        pb.proc.erase(i);
                    }
                }
            }
        }
    }

    super::dce::dce(proc);
    proc.rename();
    proc.validate();
}
