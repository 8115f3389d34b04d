//! Interference-graph coloring over the MIR.
//!
//! Two color sets: K general-purpose and M floating-point colors.
//! Simplify-and-color with coalescing hints; nodes that cannot color get a
//! stack slot, uses are rewritten through `no_spill` reloads/stores, and
//! the whole thing iterates until the graph colors.

use tracing::debug;

use crate::bitset::Bitset;
use crate::mir::{
    MInsn, MMem, MOp, MProcedure, MReg, VOp, PHYS_SP, SP_HOME, VREG_ARGS, VREG_FIRST, VREG_NARGS,
    VREG_TOS, VREG_VM,
};

/// Available color counts per class.
#[derive(Debug, Clone, Copy)]
pub struct RegLimits {
    /// General-purpose colors.
    pub gp: usize,
    /// Floating-point colors.
    pub fp: usize,
    /// Volatile GP registers the first coloring attempt restricts itself
    /// to; escalates toward `gp` before spilling.
    pub gp_volatile: usize,
    /// Volatile FP registers for the first attempt.
    pub fp_volatile: usize,
}

impl Default for RegLimits {
    fn default() -> Self {
        Self { gp: 14, fp: 16, gp_volatile: 7, fp_volatile: 8 }
    }
}

const HOT_BIAS: f32 = 12.0;
const MAX_STEPS: usize = 32;

#[derive(Clone, Default)]
struct GraphNode {
    vtx: Bitset,
    priority: f32,
    hints: [i32; 4],
    hint_id: u8,
    color: u8,
    is_fp: bool,
    spill_slot: i32,
}

impl GraphNode {
    fn add_hint(&mut self, offset: i32) {
        self.hints[self.hint_id as usize % 4] = offset;
        self.hint_id = self.hint_id.wrapping_add(1);
    }
}

/// Registers exempt from allocation: flags and the reserved virtual names.
fn is_pseudo(r: MReg) -> bool {
    r.is_flag() || (r.is_virt() && r.id > 0 && r.id < VREG_FIRST)
}

fn interferes(a: MReg, b: MReg) -> bool {
    if is_pseudo(a) || is_pseudo(b) {
        return false;
    }
    a.is_fp() == b.is_fp()
}

/// Rewrites the entry-reserved argument registers into fresh virtuals and
/// rebases evaluation-stack addressing onto the frame.
fn spill_args(proc: &mut MProcedure) {
    let tos_rebase = 8 + proc.max_stack_slot as i32 * 8;
    for b in proc.blocks.iter_mut() {
        for insn in b.insts.iter_mut() {
            for a in insn.args.iter_mut() {
                if let MOp::Mem(m) = a {
                    if m.base.is_virt() && m.base.id == VREG_TOS {
                        m.base = MReg::virt(VREG_ARGS);
                        m.disp += tos_rebase;
                    }
                }
            }
        }
    }

    let repl = [proc.next_gp(), proc.next_gp(), proc.next_gp()];
    let mut used = [false; 3];
    for b in proc.blocks.iter_mut() {
        for insn in b.insts.iter_mut() {
            insn.for_each_reg_mut(|r, _| {
                if !r.is_virt() {
                    return;
                }
                let slot = match r.id {
                    VREG_VM => 0,
                    VREG_ARGS => 1,
                    VREG_NARGS => 2,
                    _ => return,
                };
                used[slot] = true;
                *r = repl[slot];
            });
        }
    }
    for (slot, r) in repl.iter().enumerate().rev() {
        if used[slot] {
            let def = MInsn::v(VOp::MovI, *r, &[MOp::Reg(MReg::phys(slot as i32 + 1))]);
            proc.blocks[0].insts.insert(0, def);
        }
    }
}

/// Computes per-block def/ref and solves liveness to fixpoint.
fn dataflow(proc: &mut MProcedure, max_uid: usize) {
    for b in proc.blocks.iter_mut() {
        b.df_def = Bitset::new(max_uid);
        b.df_ref = Bitset::new(max_uid);
        b.df_in = Bitset::new(max_uid);
        b.df_out = Bitset::new(max_uid);
        for insn in &b.insts {
            insn.for_each_reg(|r, is_read| {
                if is_pseudo(r) {
                    return;
                }
                if is_read {
                    if !b.df_def.get(r.uid()) {
                        b.df_ref.set(r.uid());
                    }
                } else {
                    b.df_def.set(r.uid());
                }
            });
        }
    }

    // live_in = (live_out \ def) ∪ ref; live_out = ∪ live_in(succ).
    loop {
        let mut changed = false;
        for bi in 0..proc.blocks.len() {
            let mut new_in = Bitset::new(max_uid);
            for s in proc.blocks[bi].succs.clone() {
                new_in.union_with(&proc.blocks[s].df_in);
            }
            new_in.difference_with(&proc.blocks[bi].df_def);
            new_in.union_with(&proc.blocks[bi].df_ref);
            if new_in != proc.blocks[bi].df_in {
                changed = true;
                proc.blocks[bi].df_in = new_in;
            }
        }
        if !changed {
            break;
        }
    }
    for bi in 0..proc.blocks.len() {
        let mut out = Bitset::new(max_uid);
        for s in proc.blocks[bi].succs.clone() {
            out.union_with(&proc.blocks[s].df_in);
        }
        proc.blocks[bi].df_out = out;
    }
}

fn max_reg_uid(proc: &MProcedure) -> usize {
    let mut max = 0usize;
    for b in &proc.blocks {
        for insn in &b.insts {
            insn.for_each_reg(|r, _| max = max.max(r.uid()));
        }
    }
    max + 1
}

/// Builds the interference graph over the current MIR.
fn build_graph(proc: &mut MProcedure) -> Vec<GraphNode> {
    let max_uid = max_reg_uid(proc);

    // Which uids are real allocatable registers.
    let mut present = Bitset::new(max_uid);
    for b in &proc.blocks {
        for insn in &b.insts {
            insn.for_each_reg(|r, _| {
                if !is_pseudo(r) && (r.is_virt() || r.is_phys()) {
                    present.set(r.uid());
                }
            });
        }
    }

    // Spill priority: hot-weighted use counts; `no_spill` pins to infinity.
    let mut prios = vec![0f32; max_uid];
    for b in &proc.blocks {
        for insn in &b.insts {
            let hot = b.hot;
            let no_spill = insn.no_spill;
            insn.for_each_reg(|r, is_read| {
                if no_spill {
                    prios[r.uid()] = f32::INFINITY;
                } else if is_read {
                    prios[r.uid()] += (hot as f32 * HOT_BIAS).max(0.0) + 1.0;
                }
            });
        }
    }

    dataflow(proc, max_uid);

    let mut graph: Vec<GraphNode> = vec![GraphNode::default(); max_uid];
    for (uid, node) in graph.iter_mut().enumerate() {
        let r = MReg::from_uid(uid);
        node.vtx = Bitset::new(max_uid);
        if present.get(uid) {
            node.vtx.set(uid);
        }
        node.priority = prios[uid];
        node.is_fp = r.is_fp();
        if r.is_phys() {
            node.color = r.id.unsigned_abs() as u8;
        }
    }

    // Reverse walk: a write interferes with everything live after it.
    for bi in 0..proc.blocks.len() {
        let mut live = proc.blocks[bi].df_out.clone();
        for insn in proc.blocks[bi].insts.clone().iter().rev() {
            if insn.is_move_between_same_class() {
                if let MOp::Reg(src) = insn.args[0] {
                    if !is_pseudo(src) && !is_pseudo(insn.out) {
                        let (a, b) = (src.uid() as i32, insn.out.uid() as i32);
                        graph[a as usize].add_hint(b - a);
                        graph[b as usize].add_hint(a - b);
                    }
                }
            }

            insn.for_each_reg(|r, is_read| {
                if is_read || is_pseudo(r) {
                    return;
                }
                live.reset(r.uid());
                for other in live.ones().collect::<Vec<_>>() {
                    let o = MReg::from_uid(other);
                    if interferes(r, o) {
                        graph[r.uid()].vtx.set(other);
                        graph[other].vtx.set(r.uid());
                    }
                }
            });
            insn.for_each_reg(|r, is_read| {
                if is_read && !is_pseudo(r) {
                    live.set(r.uid());
                }
            });
            insn.for_each_reg(|r, is_read| {
                if !is_read || is_pseudo(r) {
                    return;
                }
                for other in live.ones().collect::<Vec<_>>() {
                    let o = MReg::from_uid(other);
                    if interferes(r, o) {
                        graph[r.uid()].vtx.set(other);
                        graph[other].vtx.set(r.uid());
                    }
                }
            });
        }
    }
    graph
}

/// Simplify-and-color. Returns the spill counts per class.
fn try_color(graph: &mut [GraphNode], k: usize, m: usize) -> (usize, usize) {
    // Pick a trivially colorable node, or the cheapest over-degree node.
    let mut over: Option<usize> = None;
    let mut pick: Option<usize> = None;
    for (idx, n) in graph.iter().enumerate() {
        if n.color != 0 {
            continue;
        }
        let deg = n.vtx.popcount();
        if deg == 0 {
            continue;
        }
        let neighbors = deg - 1;
        let limit = if n.is_fp { m } else { k };
        if neighbors >= limit {
            match over {
                Some(o) if graph[o].priority <= n.priority => {}
                _ => over = Some(idx),
            }
        } else {
            pick = Some(idx);
            break;
        }
    }

    let idx = match pick.or(over) {
        Some(idx) => idx,
        None => return (0, 0),
    };
    debug_assert!(
        pick.is_some() || graph[idx].priority != f32::INFINITY,
        "spilling a no_spill register"
    );

    // Remove the node, color the rest, then add it back.
    let mut saved = Bitset::new(graph[idx].vtx.len());
    saved.swap(&mut graph[idx].vtx);
    for other in saved.ones().collect::<Vec<_>>() {
        if other != idx {
            graph[other].vtx.reset(idx);
        }
    }

    let (mut spill_gp, mut spill_fp) = try_color(graph, k, m);

    let mut used_mask = 0u64;
    for other in saved.ones().collect::<Vec<_>>() {
        if other != idx {
            graph[other].vtx.set(idx);
            if graph[other].color != 0 {
                used_mask |= 1 << (graph[other].color - 1);
            }
        }
    }
    saved.swap(&mut graph[idx].vtx);

    // Coalescing hints first.
    for h in graph[idx].hints {
        if h == 0 {
            continue;
        }
        let hint = (idx as i64 + h as i64) as usize;
        if hint < graph.len() && graph[hint].color != 0 {
            let c = graph[hint].color;
            if used_mask & (1 << (c - 1)) == 0
                && graph[hint].is_fp == graph[idx].is_fp
                && (c as usize) <= (if graph[idx].is_fp { m } else { k })
            {
                graph[idx].color = c;
                return (spill_gp, spill_fp);
            }
        }
    }

    let limit = if graph[idx].is_fp { m } else { k };
    let free = (!used_mask).trailing_zeros() as usize;
    if free >= limit {
        // No color fits: take a stack slot that no interfering neighbor
        // already owns.
        if graph[idx].is_fp {
            spill_fp += 1;
        } else {
            spill_gp += 1;
        }
        graph[idx].color = 0;
        graph[idx].spill_slot = 1;
        loop {
            let clash = (0..graph.len()).any(|o| {
                o != idx && graph[o].spill_slot == graph[idx].spill_slot && graph[o].vtx.get(idx)
            });
            if !clash {
                break;
            }
            graph[idx].spill_slot += 1;
        }
    } else {
        graph[idx].color = free as u8 + 1;
    }
    (spill_gp, spill_fp)
}

/// Rewrites spilled virtuals through frame slots, marking the inserted
/// loads and stores `no_spill`.
fn rewrite_spills(proc: &mut MProcedure, graph: &[GraphNode], slot_base: i32) -> i32 {
    let spill_mem = |slot: i32| MMem::base_disp(MReg::phys(PHYS_SP), SP_HOME + 8 * slot);
    let mut max_slot = 0;

    for bi in 0..proc.blocks.len() {
        let mut ii = 0;
        while ii < proc.blocks[bi].insts.len() {
            // Scan for spilled registers first so fresh virtuals can be
            // drawn from the procedure counters.
            let mut spilled_reads: Vec<(MReg, i32)> = Vec::new();
            let mut spilled_writes: Vec<(MReg, i32)> = Vec::new();
            proc.blocks[bi].insts[ii].for_each_reg(|r, is_read| {
                if is_pseudo(r) || !r.is_virt() {
                    return;
                }
                let uid = r.uid();
                if uid >= graph.len() || graph[uid].spill_slot == 0 {
                    return;
                }
                let slot = slot_base + graph[uid].spill_slot - 1;
                let list = if is_read { &mut spilled_reads } else { &mut spilled_writes };
                if !list.iter().any(|(old, _)| *old == r) {
                    list.push((r, slot));
                }
            });
            if spilled_reads.is_empty() && spilled_writes.is_empty() {
                ii += 1;
                continue;
            }

            let reloads: Vec<(MReg, MReg, i32)> = spilled_reads
                .into_iter()
                .map(|(old, slot)| {
                    let fresh = if old.is_fp() { proc.next_fp() } else { proc.next_gp() };
                    (old, fresh, slot)
                })
                .collect();
            let stores: Vec<(MReg, MReg, i32)> = spilled_writes
                .into_iter()
                .map(|(old, slot)| {
                    let fresh = if old.is_fp() { proc.next_fp() } else { proc.next_gp() };
                    (old, fresh, slot)
                })
                .collect();

            let insn = &mut proc.blocks[bi].insts[ii];
            insn.no_spill = true;
            insn.for_each_reg_mut(|r, is_read| {
                let list = if is_read { &reloads } else { &stores };
                if let Some((_, fresh, _)) = list.iter().find(|(old, _, _)| old == r) {
                    *r = *fresh;
                }
            });

            for (_, fresh, slot) in &reloads {
                let op = if fresh.is_fp() { VOp::LoadF64 } else { VOp::LoadI64 };
                let mut load = MInsn::v(op, *fresh, &[MOp::Mem(spill_mem(*slot))]);
                load.no_spill = true;
                proc.blocks[bi].insts.insert(ii, load);
                ii += 1;
                max_slot = max_slot.max(*slot - slot_base + 1);
            }
            for (_, fresh, slot) in &stores {
                let op = if fresh.is_fp() { VOp::StoreF64 } else { VOp::StoreI64 };
                let mut store = MInsn::v(op, MReg::NULL, &[MOp::Mem(spill_mem(*slot)), MOp::Reg(*fresh)]);
                store.no_spill = true;
                proc.blocks[bi].insts.insert(ii + 1, store);
                ii += 1;
                max_slot = max_slot.max(*slot - slot_base + 1);
            }
            ii += 1;
        }
    }
    max_slot
}

/// Allocates every virtual register a physical color or a stack slot.
pub fn allocate_registers(proc: &mut MProcedure, limits: RegLimits) {
    spill_args(proc);

    let mut k = limits.gp_volatile.clamp(2, limits.gp.max(2));
    let mut m = limits.fp_volatile.clamp(2, limits.fp.max(2));
    let mut slot_base = 0i32;

    for step in 0..MAX_STEPS {
        let mut graph = build_graph(proc);
        let (spill_gp, spill_fp) = try_color(&mut graph, k, m);

        if spill_gp == 0 && spill_fp == 0 {
            finish(proc, &graph, slot_base);
            return;
        }

        // Prefer widening the register file over spilling.
        let widen_k = spill_gp > 0 && k < limits.gp;
        let widen_m = spill_fp > 0 && m < limits.fp;
        if widen_k || widen_m {
            if widen_k {
                k += 1;
            }
            if widen_m {
                m += 1;
            }
            continue;
        }

        debug!(step, spill_gp, spill_fp, "inserting spill code");
        slot_base += rewrite_spills(proc, &graph, slot_base);
    }
    panic!("register allocation failed to converge");
}

fn finish(proc: &mut MProcedure, graph: &[GraphNode], slots: i32) {
    // Swap the colored virtuals for physical registers.
    for b in proc.blocks.iter_mut() {
        for insn in b.insts.iter_mut() {
            insn.for_each_reg_mut(|r, _| {
                if is_pseudo(*r) || !r.is_virt() {
                    return;
                }
                let uid = r.uid();
                if uid >= graph.len() {
                    return;
                }
                let color = graph[uid].color as i32;
                debug_assert!(color != 0, "uncolored virtual {r:?}");
                *r = MReg::phys(if r.is_fp() { -color } else { color });
            });
        }
    }

    // Moves that collapsed onto one register disappear.
    for b in proc.blocks.iter_mut() {
        b.insts.retain(|insn| {
            if insn.is(VOp::MovI) || insn.is(VOp::MovF) {
                if let MOp::Reg(src) = insn.args[0] {
                    return src != insn.out;
                }
            }
            true
        });
    }

    // Frame bytes round up to sixteen.
    let bytes = (slots as u32) * 8;
    proc.used_stack = (bytes + 15) & !15;
}
