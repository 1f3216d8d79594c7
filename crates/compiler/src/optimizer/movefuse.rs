//! Pass 5: move fusion
//!
//! Collapses `Op r_tmp, x, y; Move r_dst, r_tmp` into `Op r_dst, x, y`
//! when the temporary is dead after the move. Applies to every
//! register-writing instruction whose destination can be retargeted
//! freely (plain `a`-destination forms).

use super::{dead_after, jump_target_set, FuncBody};
use etch_core::instruction::{Instruction, Opcode, Operands};

/// Ops whose `a` operand is a plain destination register that can be
/// renamed without changing semantics
fn retargetable(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::LoadK
            | Opcode::LoadBool
            | Opcode::LoadNil
            | Opcode::LoadNone
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::AddInt
            | Opcode::SubInt
            | Opcode::MulInt
            | Opcode::DivInt
            | Opcode::ModInt
            | Opcode::AddFloat
            | Opcode::SubFloat
            | Opcode::MulFloat
            | Opcode::DivFloat
            | Opcode::ModFloat
            | Opcode::AddImm
            | Opcode::SubImm
            | Opcode::MulImm
            | Opcode::DivImm
            | Opcode::ModImm
            | Opcode::Pow
            | Opcode::Unm
            | Opcode::Not
            | Opcode::Cmp(_)
            | Opcode::CmpInt(_)
            | Opcode::CmpFloat(_)
            | Opcode::Len
            | Opcode::GetIndex
            | Opcode::GetIndexImm
            | Opcode::GetIndexInt
            | Opcode::GetField
            | Opcode::ConcatArray
    )
}

pub(crate) fn run(body: &mut FuncBody) {
    let targets = jump_target_set(&body.code);
    for i in 0..body.code.len().saturating_sub(1) {
        if targets[i + 1] {
            continue;
        }
        let first = body.code[i];
        let second = body.code[i + 1];
        if second.op != Opcode::Move || !retargetable(first.op) {
            continue;
        }
        let Operands::Abc { a: dst, b: src, .. } = second.operands else {
            continue;
        };
        let tmp = match first.operands {
            Operands::Abc { a, .. } => a,
            Operands::Abx { a, .. } => a,
            _ => continue,
        };
        if src as u8 != tmp || dst == tmp {
            continue;
        }
        // The op must not read its own destination (true for the
        // retargetable set) and the temp must die here
        if !dead_after(&body.code, tmp, i + 1) {
            continue;
        }
        let mut retargeted = first;
        match &mut retargeted.operands {
            Operands::Abc { a, .. } => *a = dst,
            Operands::Abx { a, .. } => *a = dst,
            _ => continue,
        }
        body.code[i] = retargeted;
        body.code[i + 1] = Instruction::nop();
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::body;
    use super::*;

    #[test]
    fn test_arith_move_collapses() {
        let mut b = body(vec![
            Instruction::abc(Opcode::AddInt, 5, 1, 2),
            Instruction::abc(Opcode::Move, 0, 5, 0),
        ]);
        run(&mut b);
        assert_eq!(b.code[0], Instruction::abc(Opcode::AddInt, 0, 1, 2));
        assert_eq!(b.code[1].op, Opcode::NoOp);
    }

    #[test]
    fn test_live_temp_blocks_collapse() {
        let mut b = body(vec![
            Instruction::abc(Opcode::AddInt, 5, 1, 2),
            Instruction::abc(Opcode::Move, 0, 5, 0),
            Instruction::abc(Opcode::Return, 5, 1, 0),
        ]);
        run(&mut b);
        assert_eq!(b.code[1].op, Opcode::Move);
    }

    #[test]
    fn test_side_effecting_op_untouched() {
        let mut b = body(vec![
            Instruction::call(Opcode::Call, 5, 0, 0),
            Instruction::abc(Opcode::Move, 0, 5, 0),
        ]);
        run(&mut b);
        assert_eq!(b.code[1].op, Opcode::Move);
    }
}
