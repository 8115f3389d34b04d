//! Collector-tick placement.
//!
//! The lifter pairs every allocating instruction with its own `gc_tick`.
//! Inside loops that is one tick per iteration per allocation; hoisting a
//! single tick into the loop header meets the collector's deadline without
//! per-allocation checks.

use std::collections::HashMap;

use glint_asm::NO_POS;

use crate::entities::{Block, Inst};
use crate::insn::IrOp;
use crate::proc::Procedure;

/// Hoists loop-body ticks into the loop header. Returns whether anything
/// moved.
pub fn schedule_gc(proc: &mut Procedure) -> bool {
    debug_assert!(proc.topo_sorted);
    let position: HashMap<Block, usize> = proc
        .layout
        .iter()
        .copied()
        .enumerate()
        .map(|(i, b)| (b, i))
        .collect();

    // Back edges in the sorted layout identify loop ranges.
    let mut loops: Vec<(usize, usize)> = Vec::new();
    for (pos, b) in proc.layout.clone().into_iter().enumerate() {
        for s in proc.block(b).succs.clone() {
            let target = position[&s];
            if target <= pos {
                loops.push((target, pos));
            }
        }
    }

    let mut changed = false;
    for (head_pos, tail_pos) in loops {
        let header = proc.layout[head_pos];
        let body: Vec<Block> = proc.layout[head_pos..=tail_pos].to_vec();

        let ticks: Vec<Inst> = body
            .iter()
            .flat_map(|b| proc.block(*b).insts.clone())
            .filter(|i| proc.inst(*i).op == IrOp::GcTick)
            .collect();
        if ticks.is_empty() {
            continue;
        }

        // Already canonical: one tick right after the header's phi prefix.
        let phi_len = proc.phis(header).len();
        if ticks.len() == 1
            && proc.inst(ticks[0]).block == Some(header)
            && proc.block(header).insts.get(phi_len) == Some(&ticks[0])
        {
            continue;
        }

        for t in ticks {
            proc.erase(t);
        }
        let tick = proc.create(IrOp::GcTick, vec![], NO_POS);
        proc.insert_at(header, phi_len, tick);
        changed = true;
    }
    changed
}
