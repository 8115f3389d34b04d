//! Procedures: the arenas that own blocks, instructions and constants.

use std::collections::HashMap;

use glint_asm::{Pos, NO_POS};
use glint_vm::gc::Gc;
use glint_vm::object::Proto;
use glint_vm::types::Ty;

use crate::constant::ConstData;
use crate::entities::{Block, ConstId, Inst, ValueRef};
use crate::insn::{InsnData, InsnFlags, IrOp};

#[derive(Debug, Default)]
/// Basic-block payload.
pub struct BlockData {
    /// How cold the block is; deopt paths score high.
    pub cold_hint: u8,
    /// Loop nesting depth, filled by the MIR finalizer.
    pub loop_depth: u32,
    /// First lifted bytecode position.
    pub bc_begin: Pos,
    /// One past the last lifted bytecode position.
    pub bc_end: Pos,
    /// Predecessor blocks.
    pub preds: Vec<Block>,
    /// Successor blocks.
    pub succs: Vec<Block>,
    /// Ordered instruction list.
    pub insts: Vec<Inst>,
    /// Dead blocks stay in the arena but leave the layout.
    pub dead: bool,
}

/// A procedure under compilation.
pub struct Procedure {
    pub(crate) insts: Vec<InsnData>,
    uses: Vec<u32>,
    consts: Vec<ConstData>,
    const_map: HashMap<ConstData, ConstId>,
    pub(crate) blocks: Vec<BlockData>,
    /// Alive blocks in order; the first entry is the entry block.
    pub layout: Vec<Block>,
    next_name: u32,
    /// Deepest evaluation-stack slot used by call sequences.
    pub max_stack_slot: u32,
    /// The prototype this procedure was lifted from.
    pub proto: Gc<Proto>,
    /// Whether the layout is in reverse post order.
    pub topo_sorted: bool,
}

impl Procedure {
    /// Creates an empty procedure over a prototype.
    pub fn new(proto: Gc<Proto>) -> Self {
        Self {
            insts: Vec::new(),
            uses: Vec::new(),
            consts: Vec::new(),
            const_map: HashMap::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
            next_name: 0,
            max_stack_slot: 0,
            proto,
            topo_sorted: false,
        }
    }

    // -- Blocks.

    /// Appends a fresh block to the layout.
    pub fn add_block(&mut self) -> Block {
        let b = Block::new(self.blocks.len());
        self.blocks.push(BlockData::default());
        self.layout.push(b);
        b
    }

    /// The entry block.
    pub fn entry(&self) -> Block {
        self.layout[0]
    }

    /// Immutable block access.
    pub fn block(&self, b: Block) -> &BlockData {
        &self.blocks[b.index()]
    }

    /// Mutable block access.
    pub fn block_mut(&mut self, b: Block) -> &mut BlockData {
        &mut self.blocks[b.index()]
    }

    /// Records a CFG edge, ignoring duplicates.
    pub fn add_jump(&mut self, from: Block, to: Block) {
        if !self.blocks[from.index()].succs.contains(&to) {
            self.blocks[from.index()].succs.push(to);
        }
        if !self.blocks[to.index()].preds.contains(&from) {
            self.blocks[to.index()].preds.push(from);
        }
    }

    /// Removes a CFG edge.
    pub fn del_jump(&mut self, from: Block, to: Block) {
        self.blocks[from.index()].succs.retain(|s| *s != to);
        self.blocks[to.index()].preds.retain(|p| *p != from);
    }

    /// Removes the edge `from -> to`, dropping the matching phi operand of
    /// every phi in `to` so arity keeps tracking the predecessor count.
    pub fn remove_pred_edge(&mut self, from: Block, to: Block) {
        if let Some(idx) = self.blocks[to.index()].preds.iter().position(|p| *p == from) {
            for phi in self.phis(to) {
                let v = self.insts[phi.index()].operands.remove(idx);
                self.bump_use(v, false);
            }
        }
        self.del_jump(from, to);
    }

    /// Deletes a block: erases its instructions, drops its out-edges and
    /// removes it from the layout. The caller clears in-edges first.
    pub fn del_block(&mut self, b: Block) {
        debug_assert!(self.blocks[b.index()].preds.is_empty());
        for s in self.blocks[b.index()].succs.clone() {
            self.remove_pred_edge(b, s);
        }
        for i in core::mem::take(&mut self.blocks[b.index()].insts) {
            self.insts[i.index()].block = None;
            self.drop_operands(i);
        }
        self.blocks[b.index()].dead = true;
        self.layout.retain(|x| *x != b);
    }

    // -- Constants.

    /// Interns a constant into the pool.
    pub fn constant(&mut self, data: ConstData) -> ValueRef {
        if let Some(id) = self.const_map.get(&data) {
            return ValueRef::Const(*id);
        }
        let id = ConstId::new(self.consts.len());
        self.consts.push(data);
        self.const_map.insert(data, id);
        ValueRef::Const(id)
    }

    /// Constant payload.
    pub fn const_data(&self, id: ConstId) -> &ConstData {
        &self.consts[id.index()]
    }

    /// The constant behind an operand, when it is one.
    pub fn const_of(&self, v: ValueRef) -> Option<&ConstData> {
        v.as_const().map(|c| self.const_data(c))
    }

    /// The block a branch-target operand names.
    pub fn target_of(&self, v: ValueRef) -> Option<Block> {
        match self.const_of(v) {
            Some(ConstData::Block(b)) => Some(*b),
            _ => None,
        }
    }

    // -- Instructions.

    /// Immutable instruction access.
    pub fn inst(&self, i: Inst) -> &InsnData {
        &self.insts[i.index()]
    }

    /// Mutable instruction access.
    pub fn inst_mut(&mut self, i: Inst) -> &mut InsnData {
        &mut self.insts[i.index()]
    }

    /// SSA readers of the instruction's result.
    pub fn use_count(&self, i: Inst) -> u32 {
        self.uses[i.index()]
    }

    /// The result type of an operand.
    pub fn value_ty(&self, v: ValueRef) -> Ty {
        match v {
            ValueRef::Inst(i) => self.insts[i.index()].vt,
            ValueRef::Const(c) => self.const_data(c).ty(),
        }
    }

    fn bump_use(&mut self, v: ValueRef, up: bool) {
        if let ValueRef::Inst(i) = v {
            if up {
                self.uses[i.index()] += 1;
            } else {
                self.uses[i.index()] -= 1;
            }
        }
    }

    /// Creates an orphan instruction and derives its type and flags.
    pub fn create(&mut self, op: IrOp, operands: Vec<ValueRef>, bc_pos: Pos) -> Inst {
        let i = Inst::new(self.insts.len());
        for v in &operands {
            self.bump_use(*v, true);
        }
        self.insts.push(InsnData {
            op,
            vt: Ty::Unk,
            flags: InsnFlags::PURE,
            bc_pos,
            block: None,
            name: self.next_name,
            operands,
        });
        self.next_name += 1;
        self.uses.push(0);
        self.update(i);
        i
    }

    /// Appends an instruction at the end of a block.
    pub fn emit(&mut self, b: Block, op: IrOp, operands: Vec<ValueRef>, bc_pos: Pos) -> Inst {
        let i = self.create(op, operands, bc_pos);
        self.append(b, i);
        i
    }

    /// Appends an orphan to a block.
    pub fn append(&mut self, b: Block, i: Inst) {
        debug_assert!(self.insts[i.index()].block.is_none());
        self.insts[i.index()].block = Some(b);
        self.blocks[b.index()].insts.push(i);
    }

    /// Inserts an orphan at the head of a block.
    pub fn insert_front(&mut self, b: Block, i: Inst) {
        debug_assert!(self.insts[i.index()].block.is_none());
        self.insts[i.index()].block = Some(b);
        self.blocks[b.index()].insts.insert(0, i);
    }

    /// Inserts an orphan right before `before` in its block.
    pub fn insert_before(&mut self, before: Inst, i: Inst) {
        let b = self.insts[before.index()].block.expect("insert before orphan");
        let pos = self.position_of(b, before);
        self.insts[i.index()].block = Some(b);
        self.blocks[b.index()].insts.insert(pos, i);
    }

    /// Inserts an orphan at an explicit position within a block.
    pub fn insert_at(&mut self, b: Block, pos: usize, i: Inst) {
        debug_assert!(self.insts[i.index()].block.is_none());
        self.insts[i.index()].block = Some(b);
        self.blocks[b.index()].insts.insert(pos, i);
    }

    fn position_of(&self, b: Block, i: Inst) -> usize {
        self.blocks[b.index()]
            .insts
            .iter()
            .position(|x| *x == i)
            .expect("instruction in its block")
    }

    /// Unlinks an instruction from its block without touching operands.
    pub fn remove(&mut self, i: Inst) {
        if let Some(b) = self.insts[i.index()].block.take() {
            self.blocks[b.index()].insts.retain(|x| *x != i);
        }
    }

    fn drop_operands(&mut self, i: Inst) {
        for v in core::mem::take(&mut self.insts[i.index()].operands) {
            self.bump_use(v, false);
        }
    }

    /// Erases an instruction: unlinks it and releases its operand uses.
    pub fn erase(&mut self, i: Inst) {
        self.remove(i);
        self.drop_operands(i);
    }

    /// Rewrites one operand slot.
    pub fn set_operand(&mut self, i: Inst, idx: usize, v: ValueRef) {
        let old = self.insts[i.index()].operands[idx];
        if old == v {
            return;
        }
        self.bump_use(old, false);
        self.bump_use(v, true);
        self.insts[i.index()].operands[idx] = v;
    }

    /// Appends an operand slot.
    pub fn push_operand(&mut self, i: Inst, v: ValueRef) {
        self.bump_use(v, true);
        self.insts[i.index()].operands.push(v);
    }

    /// Replaces every use of `of` with `with`. Returns the number of
    /// rewritten slots.
    pub fn replace_all_uses(&mut self, of: Inst, with: ValueRef) -> usize {
        self.replace_all_uses_except(of, with, None)
    }

    /// Replace-all with one instruction exempted (e.g. a freshly built phi).
    pub fn replace_all_uses_except(
        &mut self,
        of: Inst,
        with: ValueRef,
        except: Option<Inst>,
    ) -> usize {
        let mut n = 0;
        for idx in 0..self.insts.len() {
            let reader = Inst::new(idx);
            if Some(reader) == except || self.insts[idx].block.is_none() {
                continue;
            }
            for slot in 0..self.insts[idx].operands.len() {
                if self.insts[idx].operands[slot] == ValueRef::Inst(of) {
                    self.set_operand(reader, slot, with);
                    n += 1;
                }
            }
        }
        n
    }

    /// Duplicates an instruction payload as a fresh orphan with reset
    /// name and block state.
    pub fn duplicate(&mut self, i: Inst) -> Inst {
        let op = self.insts[i.index()].op;
        let operands = self.insts[i.index()].operands.clone();
        let bc = self.insts[i.index()].bc_pos;
        self.create(op, operands, bc)
    }

    /// The leading phi prefix of a block.
    pub fn phis(&self, b: Block) -> Vec<Inst> {
        self.blocks[b.index()]
            .insts
            .iter()
            .copied()
            .take_while(|i| self.insts[i.index()].op == IrOp::Phi)
            .collect()
    }

    /// Terminator of a block, when it has one.
    pub fn terminator(&self, b: Block) -> Option<Inst> {
        let last = *self.blocks[b.index()].insts.last()?;
        self.insts[last.index()].op.is_terminator().then_some(last)
    }

    // -- Structure edits.

    /// Moves every instruction after `at` into a fresh block, transfers the
    /// old successors there and terminates the old block with a jump to the
    /// new one.
    pub fn split_at(&mut self, b: Block, at: Inst) -> Block {
        let pos = self.position_of(b, at);
        let tail = self.blocks[b.index()].insts.split_off(pos + 1);
        let nb = self.add_block();
        for i in &tail {
            self.insts[i.index()].block = Some(nb);
        }
        self.blocks[nb.index()].insts = tail;
        self.blocks[nb.index()].bc_begin = self.insts[at.index()].bc_pos;
        self.blocks[nb.index()].bc_end = self.blocks[b.index()].bc_end;

        let succs = core::mem::take(&mut self.blocks[b.index()].succs);
        for s in &succs {
            for p in self.blocks[s.index()].preds.iter_mut() {
                if *p == b {
                    *p = nb;
                }
            }
        }
        self.blocks[nb.index()].succs = succs;

        let target = self.constant(ConstData::Block(nb));
        let jmp = self.create(IrOp::Jmp, vec![target], NO_POS);
        self.append(b, jmp);
        self.add_jump(b, nb);
        nb
    }

    /// Whether `a` strictly dominates `b` (reflexively true for `a == b`),
    /// by DFS over predecessors.
    pub fn dom(&self, a: Block, b: Block) -> bool {
        if a == b {
            return true;
        }
        // `b` is not dominated iff some path reaches a pred-less block
        // without passing through `a`.
        let mut visited = vec![false; self.blocks.len()];
        let mut stack = vec![b];
        visited[b.index()] = true;
        while let Some(n) = stack.pop() {
            if self.blocks[n.index()].preds.is_empty() {
                return false;
            }
            for p in &self.blocks[n.index()].preds {
                if *p == a || visited[p.index()] {
                    continue;
                }
                visited[p.index()] = true;
                stack.push(*p);
            }
        }
        true
    }

    /// Reverse post order over the reachable subgraph.
    pub fn reverse_postorder(&self) -> Vec<Block> {
        let mut visited = vec![false; self.blocks.len()];
        let mut post = Vec::with_capacity(self.layout.len());
        // Iterative DFS with an explicit phase marker.
        let mut stack = vec![(self.entry(), 0usize)];
        visited[self.entry().index()] = true;
        while let Some((b, next_child)) = stack.pop() {
            let succs = &self.blocks[b.index()].succs;
            if next_child < succs.len() {
                stack.push((b, next_child + 1));
                let s = succs[next_child];
                if !visited[s.index()] {
                    visited[s.index()] = true;
                    stack.push((s, 0));
                }
            } else {
                post.push(b);
            }
        }
        post.reverse();
        post
    }

    /// Reorders the layout into reverse post order and deletes blocks the
    /// order cannot reach.
    pub fn topological_sort(&mut self) {
        let rpo = self.reverse_postorder();
        let mut reachable = vec![false; self.blocks.len()];
        for b in &rpo {
            reachable[b.index()] = true;
        }
        let dead: Vec<Block> = self
            .layout
            .iter()
            .copied()
            .filter(|b| !reachable[b.index()])
            .collect();
        for b in &dead {
            // Clear in-edges from other dead blocks before deletion.
            for p in self.blocks[b.index()].preds.clone() {
                self.del_jump(p, *b);
            }
        }
        for b in dead {
            self.del_block(b);
        }
        self.layout = rpo;
        self.topo_sorted = true;
    }

    /// Renumbers SSA names in layout order.
    pub fn rename(&mut self) {
        let mut next = 0;
        for b in self.layout.clone() {
            for i in self.blocks[b.index()].insts.clone() {
                self.insts[i.index()].name = next;
                next += 1;
            }
        }
        self.next_name = next;
    }

    /// Fills per-block loop depths from back edges in the sorted layout.
    pub fn compute_loop_depth(&mut self) {
        debug_assert!(self.topo_sorted);
        let position: HashMap<Block, usize> =
            self.layout.iter().copied().enumerate().map(|(i, b)| (b, i)).collect();
        for b in self.layout.clone() {
            self.blocks[b.index()].loop_depth = 0;
        }
        for (pos, b) in self.layout.clone().into_iter().enumerate() {
            for s in self.blocks[b.index()].succs.clone() {
                let target = position[&s];
                if target <= pos {
                    for i in target..=pos {
                        let inner = self.layout[i];
                        self.blocks[inner.index()].loop_depth += 1;
                    }
                }
            }
        }
    }

    // -- Typing.

    /// Narrows a value's type to `t` when consistent, recursing through
    /// operands. With `save`, a successful narrowing persists.
    pub fn type_try_settle(&mut self, v: ValueRef, t: Ty, save: bool) -> bool {
        match v {
            ValueRef::Const(c) => {
                let ct = self.const_data(c).ty();
                ct == t || t == Ty::Any
            }
            ValueRef::Inst(i) => {
                let vt = self.insts[i.index()].vt;
                if vt == t || t == Ty::Any {
                    return true;
                }
                if !matches!(vt, Ty::Unk | Ty::Any) {
                    return false;
                }
                self.insts[i.index()].vt = t;
                let ok = self.rec_type_check(i, t);
                if !(save && ok) {
                    self.insts[i.index()].vt = vt;
                }
                ok
            }
        }
    }

    /// Whether every input of `i` can narrow to `t`.
    fn rec_type_check(&mut self, i: Inst, t: Ty) -> bool {
        let op = self.insts[i.index()].op;
        let operands = self.insts[i.index()].operands.clone();
        match op {
            IrOp::Unop => t.is_numeric() && self.type_try_settle(operands[1], t, false),
            IrOp::Binop => {
                t.is_numeric()
                    && self.type_try_settle(operands[1], t, false)
                    && self.type_try_settle(operands[2], t, false)
            }
            IrOp::Select => {
                self.type_try_settle(operands[1], t, false)
                    && self.type_try_settle(operands[2], t, false)
            }
            IrOp::Phi => operands.iter().all(|v| self.type_try_settle(*v, t, false)),
            IrOp::Move => self.type_try_settle(operands[0], t, false),
            _ => false,
        }
    }

    /// Re-derives the result type and behavior flags of an instruction
    /// from its operands.
    pub fn update(&mut self, i: Inst) {
        use IrOp::*;

        let op = self.insts[i.index()].op;
        let operands = self.insts[i.index()].operands.clone();
        let volatile = self.insts[i.index()].flags.contains(InsnFlags::VOLATILE);
        let mut flags = InsnFlags::PURE;
        let mut vt = Ty::Unk;

        match op {
            LoadLocal | UvalGet | VaGet | FieldGet => {
                vt = Ty::Unk;
            }
            GetException => {
                flags.remove(InsnFlags::PURE);
                vt = Ty::Unk;
            }
            StoreLocal | UvalSet | FieldSet | SetException | GcTick => {
                flags = InsnFlags::SIDE_EFFECT;
                vt = Ty::None;
            }
            ArrayNew => {
                flags = InsnFlags::empty();
                vt = Ty::Arr;
            }
            TableNew => {
                flags = InsnFlags::empty();
                vt = Ty::Tbl;
            }
            Unop => {
                let t = self.value_ty(operands[1]);
                if t.is_numeric() {
                    self.insts[i.index()].vt = Ty::Unk;
                    if self.type_try_settle(ValueRef::Inst(i), t, true) {
                        vt = self.insts[i.index()].vt;
                    }
                }
            }
            Binop => {
                let t1 = self.value_ty(operands[1]);
                let t2 = self.value_ty(operands[2]);
                let target = if t1.is_numeric() {
                    Some(t1)
                } else if t2.is_numeric() {
                    Some(t2)
                } else {
                    None
                };
                if let Some(t) = target {
                    self.insts[i.index()].vt = Ty::Unk;
                    if self.type_try_settle(ValueRef::Inst(i), t, true) {
                        vt = self.insts[i.index()].vt;
                    }
                }
            }
            BoolAnd | BoolOr | BoolXor => {
                flags |= InsnFlags::CONST;
                vt = self.value_ty(operands[0]);
            }
            AssumeCast => {
                flags |= InsnFlags::CONST;
                vt = match self.const_of(operands[1]) {
                    Some(ConstData::Dty(t)) => *t,
                    _ => Ty::Unk,
                };
            }
            CoerceBool | TestType | Vin => {
                flags |= InsnFlags::CONST;
                vt = Ty::I1;
            }
            Compare => {
                vt = Ty::I1;
            }
            Move => {
                flags |= InsnFlags::CONST;
                vt = self.value_ty(operands[0]);
            }
            EraseType => {
                flags |= InsnFlags::CONST;
                vt = Ty::Any;
            }
            Select => {
                flags |= InsnFlags::CONST;
                let t1 = self.value_ty(operands[1]);
                let t2 = self.value_ty(operands[2]);
                vt = if t1 == t2 { t1 } else { Ty::Unk };
            }
            Phi => {
                flags |= InsnFlags::CONST;
                let mut merged: Option<Ty> = None;
                for v in &operands {
                    let t = self.value_ty(*v);
                    merged = match merged {
                        None => Some(t),
                        Some(m) if m == t => Some(m),
                        Some(_) => Some(Ty::Unk),
                    };
                }
                vt = merged.unwrap_or(Ty::Unk);
            }
            Ccall => {
                if let Some(ConstData::Native(nf)) = self.const_of(operands[0]) {
                    let ovl = self
                        .const_of(operands[1])
                        .and_then(|c| c.to_i64())
                        .unwrap_or(0) as usize;
                    vt = nf.overloads.get(ovl).map(|o| o.ret).unwrap_or(Ty::Unk);
                    flags = native_flags(nf.attr);
                }
            }
            Vcall => {
                flags = InsnFlags::SIDE_EFFECT;
                vt = Ty::Unk;
                if let Some(ConstData::FnRef(f)) = self.const_of(operands[0]) {
                    if let Some(nf) = f.native() {
                        flags = native_flags(nf.attr);
                    }
                }
            }
            Vlen => {
                vt = match self.value_ty(operands[0]) {
                    Ty::Arr | Ty::Tbl | Ty::Str => Ty::F64,
                    _ => Ty::Unk,
                };
            }
            Vdup => {
                flags = InsnFlags::empty();
                vt = match self.value_ty(operands[0]) {
                    t @ (Ty::Arr | Ty::Tbl | Ty::Fn | Ty::Obj) => t,
                    _ => Ty::Unk,
                };
            }
            Vjoin => {
                flags = InsnFlags::empty();
                let t1 = self.value_ty(operands[0]);
                let t2 = self.value_ty(operands[1]);
                vt = if t1 == t2 && matches!(t1, Ty::Str | Ty::Arr | Ty::Tbl) {
                    t1
                } else {
                    Ty::Unk
                };
            }
            VaCount => {
                vt = Ty::I32;
            }
            Jmp | Jcc => {
                flags = InsnFlags::empty();
                vt = Ty::None;
            }
            Ret | Unreachable => {
                flags = InsnFlags::SIDE_EFFECT;
                vt = Ty::None;
            }
        }

        if flags.contains(InsnFlags::CONST) {
            flags |= InsnFlags::PURE;
        }
        if volatile {
            flags |= InsnFlags::VOLATILE;
        }
        let data = &mut self.insts[i.index()];
        data.flags = flags;
        data.vt = vt;
    }

    // -- Validation.

    /// Checks the structural invariants; panics with a description on the
    /// first violation.
    pub fn validate(&self) {
        assert!(!self.layout.is_empty(), "procedure without entry block");

        // Use counts match the operand graph.
        let mut counted = vec![0u32; self.insts.len()];
        for b in &self.layout {
            for i in &self.blocks[b.index()].insts {
                for v in &self.insts[i.index()].operands {
                    if let ValueRef::Inst(u) = v {
                        counted[u.index()] += 1;
                    }
                }
            }
        }
        for (idx, n) in counted.iter().enumerate() {
            let i = Inst::new(idx);
            if self.insts[idx].block.is_some() {
                assert_eq!(
                    *n, self.uses[idx],
                    "use count mismatch on {i}: counted {n}, stored {}",
                    self.uses[idx]
                );
            }
        }

        for b in self.layout.iter().copied() {
            let data = &self.blocks[b.index()];
            assert!(!data.dead, "dead block {b} in layout");

            // Exactly one terminator, and it is the last instruction.
            let term_count = data
                .insts
                .iter()
                .filter(|i| self.insts[i.index()].op.is_terminator())
                .count();
            assert_eq!(term_count, 1, "{b} holds {term_count} terminators");
            let last = *data.insts.last().expect("no empty blocks");
            assert!(
                self.insts[last.index()].op.is_terminator(),
                "{b} does not end in a terminator"
            );

            // Phi arity equals predecessor count; phis form the prefix.
            let mut seen_non_phi = false;
            for i in &data.insts {
                let insn = &self.insts[i.index()];
                if insn.op == IrOp::Phi {
                    assert!(!seen_non_phi, "phi {i} after a non-phi in {b}");
                    assert_eq!(
                        insn.operands.len(),
                        data.preds.len(),
                        "phi {i} arity mismatch in {b}"
                    );
                } else {
                    seen_non_phi = true;
                }

                // No orphan operands.
                for v in &insn.operands {
                    if let ValueRef::Inst(u) = v {
                        assert!(
                            self.insts[u.index()].block.is_some(),
                            "{i} reads the orphan {u}"
                        );
                    }
                }
            }

            // Branch targets are alive, and the CFG edges mirror them.
            if let Some(term) = self.terminator(b) {
                for v in &self.insts[term.index()].operands {
                    if let Some(ConstData::Block(t)) = self.const_of(*v) {
                        assert!(!self.blocks[t.index()].dead, "{b} jumps to dead {t}");
                        assert!(
                            self.blocks[b.index()].succs.contains(t),
                            "{b} jumps to {t} without an edge"
                        );
                    }
                }
            }

            // Edge symmetry.
            for s in &data.succs {
                assert!(
                    self.blocks[s.index()].preds.contains(&b),
                    "edge {b} -> {s} lacks the back reference"
                );
            }
            for p in &data.preds {
                assert!(
                    self.blocks[p.index()].succs.contains(&b),
                    "edge {p} -> {b} lacks the forward reference"
                );
            }
        }
    }

    /// Renders the procedure for debugging.
    pub fn display(&self) -> String {
        use core::fmt::Write;
        use itertools::Itertools;

        let mut out = String::new();
        for b in &self.layout {
            let data = &self.blocks[b.index()];
            let _ = writeln!(
                out,
                "{b}: preds={:?} succs={:?} depth={}",
                data.preds, data.succs, data.loop_depth
            );
            for i in &data.insts {
                let insn = &self.insts[i.index()];
                let operands = insn
                    .operands
                    .iter()
                    .map(|v| match v {
                        ValueRef::Inst(u) => format!("%{}", self.insts[u.index()].name),
                        ValueRef::Const(c) => format!("{:?}", self.const_data(*c)),
                    })
                    .join(", ");
                let _ = writeln!(out, "  %{} = {:?}.{} {}", insn.name, insn.op, insn.vt, operands);
            }
        }
        out
    }
}

fn native_flags(attr: glint_vm::object::NativeAttr) -> InsnFlags {
    use glint_vm::object::NativeAttr;
    let mut flags = InsnFlags::empty();
    if attr.contains(NativeAttr::PURE) {
        flags |= InsnFlags::PURE;
    }
    if attr.contains(NativeAttr::CONST) {
        flags |= InsnFlags::CONST | InsnFlags::PURE;
    }
    if attr.contains(NativeAttr::SIDE_EFFECT) {
        flags |= InsnFlags::SIDE_EFFECT;
        flags.remove(InsnFlags::PURE);
    }
    flags
}
