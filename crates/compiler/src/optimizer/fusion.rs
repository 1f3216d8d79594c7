//! Pass 4: instruction fusion
//!
//! Rewrites adjacent arithmetic pairs of the shape
//!
//! ```text
//! Op1 t, b, c
//! Op2 a, a, t
//! ```
//!
//! into the three-register fused form `Fused(Op1Op2) a, b, c`, meaning
//! `r[a] = r[a] OP2 (r[b] OP1 r[c])`. The temporary must die at the
//! second instruction and the pair must not straddle a jump target.
//! Division stays unfused when it could trap differently (the fused
//! form evaluates the inner operation first, exactly like the pair, so
//! only the dead-temp and jump-target conditions gate the rewrite).

use super::{dead_after, jump_target_set, FuncBody};
use etch_core::instruction::{FusedOp, Instruction, Opcode, Operands};

#[derive(Clone, Copy, PartialEq)]
enum Family {
    Int,
    Float,
    Generic,
}

fn classify(op: Opcode) -> Option<(char, Family)> {
    let pair = match op {
        Opcode::Add => ('+', Family::Generic),
        Opcode::Sub => ('-', Family::Generic),
        Opcode::Mul => ('*', Family::Generic),
        Opcode::Div => ('/', Family::Generic),
        Opcode::AddInt => ('+', Family::Int),
        Opcode::SubInt => ('-', Family::Int),
        Opcode::MulInt => ('*', Family::Int),
        Opcode::DivInt => ('/', Family::Int),
        Opcode::AddFloat => ('+', Family::Float),
        Opcode::SubFloat => ('-', Family::Float),
        Opcode::MulFloat => ('*', Family::Float),
        Opcode::DivFloat => ('/', Family::Float),
        _ => return None,
    };
    Some(pair)
}

/// The fused opcode for inner `first` and outer `second`, when the
/// combination exists
fn fused_op(first: char, second: char) -> Option<FusedOp> {
    let op = match (first, second) {
        ('+', '+') => FusedOp::AddAdd,
        ('*', '+') => FusedOp::MulAdd,
        ('*', '-') => FusedOp::MulSub,
        ('-', '-') => FusedOp::SubSub,
        ('-', '*') => FusedOp::SubMul,
        ('/', '+') => FusedOp::DivAdd,
        ('+', '-') => FusedOp::AddSub,
        ('+', '*') => FusedOp::AddMul,
        ('-', '/') => FusedOp::SubDiv,
        _ => return None,
    };
    Some(op)
}

pub(crate) fn run(body: &mut FuncBody) {
    let targets = jump_target_set(&body.code);
    for i in 0..body.code.len().saturating_sub(1) {
        // Never fuse across a jump target
        if targets[i + 1] {
            continue;
        }
        let first = body.code[i];
        let second = body.code[i + 1];
        let Some((op1, fam1)) = classify(first.op) else {
            continue;
        };
        let Some((op2, fam2)) = classify(second.op) else {
            continue;
        };
        if fam1 != fam2 {
            continue;
        }
        let Some(fused) = fused_op(op1, op2) else {
            continue;
        };
        let Operands::Abc { a: t, b, c } = first.operands else {
            continue;
        };
        let Operands::Abc { a, b: a2, c: t2 } = second.operands else {
            continue;
        };
        // Pattern: the second op folds the temp into its own dst
        if a2 as u8 != a || t2 as u8 != t || a == t {
            continue;
        }
        if !dead_after(&body.code, t, i + 1) {
            continue;
        }
        let opcode = match fam1 {
            Family::Int => Opcode::FusedInt(fused),
            Family::Float => Opcode::FusedFloat(fused),
            Family::Generic => Opcode::Fused(fused),
        };
        body.code[i] = Instruction::nop();
        body.code[i + 1] = Instruction::abc(opcode, a, b, c);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::body;
    use super::*;

    #[test]
    fn test_mul_add_fuses() {
        // t = b * c; a = a + t  =>  a += b * c
        let mut b = body(vec![
            Instruction::abc(Opcode::MulInt, 5, 1, 2),
            Instruction::abc(Opcode::AddInt, 0, 0, 5),
        ]);
        run(&mut b);
        assert_eq!(b.code[0].op, Opcode::NoOp);
        assert_eq!(
            b.code[1],
            Instruction::abc(Opcode::FusedInt(FusedOp::MulAdd), 0, 1, 2)
        );
    }

    #[test]
    fn test_live_temp_blocks_fusion() {
        let mut b = body(vec![
            Instruction::abc(Opcode::MulInt, 5, 1, 2),
            Instruction::abc(Opcode::AddInt, 0, 0, 5),
            Instruction::abc(Opcode::Return, 5, 1, 0),
        ]);
        run(&mut b);
        assert_eq!(b.code[0].op, Opcode::MulInt);
    }

    #[test]
    fn test_jump_target_blocks_fusion() {
        let mut b = body(vec![
            Instruction::abc(Opcode::MulInt, 5, 1, 2),
            Instruction::abc(Opcode::AddInt, 0, 0, 5),
            Instruction::asbx(Opcode::Jmp, 0, -3), // back to pc 1
        ]);
        run(&mut b);
        assert_eq!(b.code[0].op, Opcode::MulInt);
        assert_eq!(b.code[1].op, Opcode::AddInt);
    }

    #[test]
    fn test_mixed_families_do_not_fuse() {
        let mut b = body(vec![
            Instruction::abc(Opcode::MulInt, 5, 1, 2),
            Instruction::abc(Opcode::AddFloat, 0, 0, 5),
        ]);
        run(&mut b);
        assert_eq!(b.code[0].op, Opcode::MulInt);
    }

    #[test]
    fn test_wrong_shape_does_not_fuse() {
        // second op reads the temp on the left instead of folding into dst
        let mut b = body(vec![
            Instruction::abc(Opcode::MulInt, 5, 1, 2),
            Instruction::abc(Opcode::AddInt, 0, 5, 3),
        ]);
        run(&mut b);
        assert_eq!(b.code[1].op, Opcode::AddInt);
    }
}
