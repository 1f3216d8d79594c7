//! Pass 3: peephole
//!
//! Local rewrites over adjacent instructions:
//! - `LoadK t; Move d, t` becomes `LoadK d` when `t` dies at the move
//! - `Move a, b; Move c, a` becomes `Move c, b` when `a` dies
//! - back-to-back identical comparisons collapse to one
//!
//! In functions containing `Yield`, forwarding is restricted to source
//! registers whose last use is at or before the move: a suspended
//! coroutine snapshot must never observe a register that forwarding
//! left stale.

use super::{dead_after, jump_target_set, reg_uses, FuncBody};
use etch_core::instruction::{CmpOp, Instruction, Opcode, Operands};

pub(crate) fn run(body: &mut FuncBody) {
    let targets = jump_target_set(&body.code);

    for i in 0..body.code.len().saturating_sub(1) {
        if targets[i + 1] {
            continue;
        }
        let first = body.code[i];
        let second = body.code[i + 1];

        // LoadK t; Move d,t  =>  LoadK d
        if first.op == Opcode::LoadK && second.op == Opcode::Move {
            let Operands::Abx { a: t, bx } = first.operands else {
                continue;
            };
            let Operands::Abc { a: d, b, .. } = second.operands else {
                continue;
            };
            if b as u8 == t && forward_ok(body, t, i + 1) {
                body.code[i] = Instruction::abx(Opcode::LoadK, d, bx);
                body.code[i + 1] = Instruction::nop();
            }
            continue;
        }

        // Move a,b; Move c,a  =>  Move c,b
        if first.op == Opcode::Move && second.op == Opcode::Move {
            let Operands::Abc { a, b, .. } = first.operands else {
                continue;
            };
            let Operands::Abc { a: c2, b: b2, .. } = second.operands else {
                continue;
            };
            if b2 as u8 == a && forward_ok(body, a, i + 1) {
                body.code[i] = Instruction::nop();
                body.code[i + 1] = Instruction::abc(Opcode::Move, c2, b, 0);
            }
            continue;
        }

        // Identical adjacent comparisons are redundant
        if matches!(
            first.op,
            Opcode::Cmp(_) | Opcode::CmpInt(_) | Opcode::CmpFloat(_)
        ) && first == second
        {
            body.code[i + 1] = Instruction::nop();
            continue;
        }

        // increment-and-test: AddImm r,r,1 feeding a < jump on r
        if first.op == Opcode::AddImm && second.op == Opcode::CmpJmpInt(CmpOp::Lt) {
            let Operands::Abc { a, b, .. } = first.operands else {
                continue;
            };
            if a as u16 != b || first.imm8() != 1 {
                continue;
            }
            let (lhs, rhs, off) = second.unpack_cmp();
            if lhs != a {
                continue;
            }
            body.code[i] = Instruction::nop();
            body.code[i + 1] = Instruction::cmp_jmp(Opcode::IncTest, lhs, rhs, off);
        }
    }
}

/// Forwarding is safe when the forwarded register dies at or before the
/// rewrite point; with yields in the function that check is mandatory
/// rather than merely profitable
fn forward_ok(body: &FuncBody, reg: u8, move_index: usize) -> bool {
    if body.has_yield {
        // last use must not extend past the move itself
        let last = body
            .code
            .iter()
            .enumerate()
            .filter(|(_, instr)| {
                let u = reg_uses(instr);
                u.reads.contains(&reg) || u.write == Some(reg)
            })
            .map(|(pc, _)| pc)
            .max()
            .unwrap_or(0);
        if last > move_index {
            return false;
        }
    }
    dead_after(&body.code, reg, move_index)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::body;
    use super::*;
    use etch_core::instruction::CmpOp;

    #[test]
    fn test_loadk_move_forwarding() {
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 3, 7),
            Instruction::abc(Opcode::Move, 0, 3, 0),
            Instruction::abc(Opcode::Return, 0, 1, 0),
        ]);
        run(&mut b);
        assert_eq!(b.code[0], Instruction::abx(Opcode::LoadK, 0, 7));
        assert_eq!(b.code[1].op, Opcode::NoOp);
    }

    #[test]
    fn test_move_move_forwarding() {
        let mut b = body(vec![
            Instruction::abc(Opcode::Move, 1, 0, 0),
            Instruction::abc(Opcode::Move, 2, 1, 0),
        ]);
        run(&mut b);
        assert_eq!(b.code[0].op, Opcode::NoOp);
        assert_eq!(b.code[1], Instruction::abc(Opcode::Move, 2, 0, 0));
    }

    #[test]
    fn test_no_forwarding_when_source_live() {
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 3, 7),
            Instruction::abc(Opcode::Move, 0, 3, 0),
            Instruction::abc(Opcode::AddInt, 1, 3, 3),
        ]);
        run(&mut b);
        assert_eq!(b.code[0], Instruction::abx(Opcode::LoadK, 3, 7));
    }

    #[test]
    fn test_redundant_compare_removed() {
        let cmp = Instruction::abc(Opcode::CmpInt(CmpOp::Lt), 2, 0, 1);
        let mut b = body(vec![cmp, cmp]);
        run(&mut b);
        assert_eq!(b.code[0].op, Opcode::CmpInt(CmpOp::Lt));
        assert_eq!(b.code[1].op, Opcode::NoOp);
    }

    #[test]
    fn test_yield_function_blocks_late_forwarding() {
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 3, 7),
            Instruction::abc(Opcode::Move, 0, 3, 0),
            Instruction::abc(Opcode::Yield, 3, 1, 0),
        ]);
        b.has_yield = true;
        run(&mut b);
        // r3 is read by the yield after the move: no forwarding
        assert_eq!(b.code[0], Instruction::abx(Opcode::LoadK, 3, 7));
    }

    #[test]
    fn test_inc_test_fusion() {
        let mut b = body(vec![
            Instruction::abc(Opcode::AddImm, 0, 0, 1),
            Instruction::cmp_jmp(Opcode::CmpJmpInt(CmpOp::Lt), 0, 1, -2),
        ]);
        run(&mut b);
        assert_eq!(b.code[0].op, Opcode::NoOp);
        assert_eq!(b.code[1].op, Opcode::IncTest);
        assert_eq!(b.code[1].unpack_cmp(), (0, 1, -2));
    }

    #[test]
    fn test_inc_test_needs_matching_register() {
        let original = vec![
            Instruction::abc(Opcode::AddImm, 2, 2, 1),
            Instruction::cmp_jmp(Opcode::CmpJmpInt(CmpOp::Lt), 0, 1, -2),
        ];
        let mut b = body(original.clone());
        run(&mut b);
        assert_eq!(b.code, original);
    }

    #[test]
    fn test_no_forwarding_into_jump_target() {
        let mut b = body(vec![
            Instruction::asbx(Opcode::Jmp, 0, 0), // jumps to pc 1
            Instruction::abc(Opcode::Move, 0, 3, 0),
        ]);
        // pc 1 is a jump target; the pair starting at 0 is not safe
        run(&mut b);
        assert_eq!(b.code[1].op, Opcode::Move);
    }
}
