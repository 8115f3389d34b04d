//! Dead code elimination: unused pure instructions go, to fixpoint.

use crate::insn::InsnFlags;
use crate::proc::Procedure;

/// Erases every pure, non-volatile instruction with no readers. Iterates
/// until nothing changes. Returns whether anything was erased.
pub fn dce(proc: &mut Procedure) -> bool {
    let mut changed = false;
    loop {
        let mut round = 0usize;
        for b in proc.layout.clone() {
            for i in proc.block(b).insts.clone() {
                let insn = proc.inst(i);
                if insn.op.is_terminator()
                    || insn.flags.intersects(InsnFlags::SIDE_EFFECT | InsnFlags::VOLATILE)
                    || !insn.is_pure()
                {
                    continue;
                }
                if proc.use_count(i) == 0 {
                    proc.erase(i);
                    round += 1;
                }
            }
        }
        if round == 0 {
            break;
        }
        changed = true;
    }
    changed
}
