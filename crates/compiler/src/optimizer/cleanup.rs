//! Pass 7: no-op removal and jump repair
//!
//! Removes the `NoOp` placeholders left by earlier passes, keeping
//! those that serve as skip targets of `Test`/`TestTag` (removing them
//! would let a skip land on a real instruction it was never meant to
//! reach). Builds an old-pc to new-pc map and rewrites every jump
//! offset: `sbx` in the Asbx forms, the upper 16 bits of `ax` in the
//! compare-and-jump family.

use super::{branch_target, defer_body_target, FuncBody};
use etch_core::instruction::{Opcode, Operands};

pub(crate) fn run(body: &mut FuncBody) {
    let n = body.code.len();
    if n == 0 {
        return;
    }

    // NoOps preserved as skip targets: the instruction right after a
    // Test/TestTag is skippable and must stay addressable
    let mut keep = vec![false; n];
    for (pc, instr) in body.code.iter().enumerate() {
        keep[pc] = instr.op != Opcode::NoOp;
        if matches!(instr.op, Opcode::Test | Opcode::TestTag) && pc + 1 < n {
            keep[pc + 1] = true;
        }
    }

    // Old-pc -> new-pc map; removed pcs map to the next surviving
    // instruction (or the end-of-function sentinel)
    let mut map = vec![0usize; n + 1];
    let mut new_pc = 0usize;
    for old in 0..n {
        map[old] = new_pc;
        if keep[old] {
            new_pc += 1;
        }
    }
    map[n] = new_pc;

    let old_code = std::mem::take(&mut body.code);
    let old_debug = std::mem::take(&mut body.debug);
    let mut new_code = Vec::with_capacity(new_pc);
    let mut new_debug = Vec::with_capacity(new_pc);

    for (old, mut instr) in old_code.into_iter().enumerate() {
        if !keep[old] {
            continue;
        }
        if let Some(old_target) = branch_target(&instr, old) {
            let target = map[old_target.min(n)] as i64;
            let here = new_code.len() as i64;
            let offset = target - here - 1;
            match &mut instr.operands {
                Operands::Asbx { sbx, .. } => *sbx = offset as i32,
                Operands::Ax { .. } => instr.repack_cmp_offset(offset as i16),
                _ => {}
            }
        } else if let Some(old_target) = defer_body_target(&instr, old) {
            // PushDefer offsets are based on the instruction's own pc
            let target = map[old_target.min(n)] as i64;
            let here = new_code.len() as i64;
            if let Operands::Asbx { sbx, .. } = &mut instr.operands {
                *sbx = (target - here) as i32;
            }
        }
        new_code.push(instr);
        new_debug.push(old_debug[old]);
    }
    body.code = new_code;
    body.debug = new_debug;
}

#[cfg(test)]
mod tests {
    use super::super::testutil::body;
    use super::*;
    use etch_core::instruction::{CmpOp, Instruction};

    #[test]
    fn test_noops_removed_and_jumps_repaired() {
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 0, 0),    // 0
            Instruction::nop(),                        // 1 (removed)
            Instruction::nop(),                        // 2 (removed)
            Instruction::asbx(Opcode::Jmp, 0, -4),     // 3 -> 0
            Instruction::abc(Opcode::Return, 0, 0, 0), // 4
        ]);
        run(&mut b);
        assert_eq!(b.code.len(), 3);
        assert_eq!(b.code[1].op, Opcode::Jmp);
        // Jump at new pc 1 still targets the LoadK at new pc 0
        assert_eq!(branch_target(&b.code[1], 1), Some(0));
    }

    #[test]
    fn test_cmp_jmp_offsets_repaired() {
        let mut b = body(vec![
            Instruction::cmp_jmp(Opcode::CmpJmpInt(CmpOp::Ge), 0, 1, 2), // 0 -> 3
            Instruction::nop(),                                           // 1 (removed)
            Instruction::abx(Opcode::LoadK, 0, 0),                        // 2
            Instruction::abc(Opcode::Return, 0, 0, 0),                    // 3
        ]);
        run(&mut b);
        assert_eq!(b.code.len(), 3);
        // Target was old pc 3, now new pc 2
        assert_eq!(branch_target(&b.code[0], 0), Some(2));
    }

    #[test]
    fn test_skip_target_noop_preserved() {
        let mut b = body(vec![
            Instruction::abc(Opcode::Test, 0, 0, 1), // skips next when truthy
            Instruction::nop(),                       // skip target: must stay
            Instruction::abc(Opcode::Return, 0, 0, 0),
        ]);
        run(&mut b);
        assert_eq!(b.code.len(), 3);
        assert_eq!(b.code[1].op, Opcode::NoOp);
    }

    #[test]
    fn test_push_defer_offset_repaired() {
        let mut b = body(vec![
            Instruction::asbx(Opcode::Jmp, 0, 3),          // 0 -> 4
            Instruction::abx(Opcode::LoadK, 0, 0),          // 1 defer body
            Instruction::abc(Opcode::DeferEnd, 0, 0, 0),    // 2
            Instruction::nop(),                              // 3 (removed)
            Instruction::asbx(Opcode::PushDefer, 0, -3),    // 4 -> body at 1
            Instruction::abc(Opcode::ExecDefers, 0, 0, 0),  // 5
        ]);
        run(&mut b);
        assert_eq!(b.code.len(), 5);
        // PushDefer is now at pc 3 and must still reach the body at pc 1
        let push = b.code[3];
        assert_eq!(push.op, Opcode::PushDefer);
        assert_eq!(super::super::defer_body_target(&push, 3), Some(1));
    }

    #[test]
    fn test_jump_to_removed_pc_lands_on_successor() {
        let mut b = body(vec![
            Instruction::asbx(Opcode::Jmp, 0, 1), // 0 -> 2 (a noop)
            Instruction::abx(Opcode::LoadK, 0, 0), // 1
            Instruction::nop(),                    // 2 (removed)
            Instruction::abc(Opcode::Return, 0, 0, 0), // 3
        ]);
        run(&mut b);
        assert_eq!(b.code.len(), 3);
        // Old target 2 resolves to the surviving Return
        assert_eq!(branch_target(&b.code[0], 0), Some(2));
        assert_eq!(b.code[2].op, Opcode::Return);
    }
}
