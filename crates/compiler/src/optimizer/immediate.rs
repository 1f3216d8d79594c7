//! Pass 2: immediate-operand conversion
//!
//! When an integer arithmetic instruction consumes a just-loaded
//! constant that fits a signed 8-bit immediate, rewrite to the `*Imm`
//! form and wipe the constant load. Division keeps the immediate form
//! only for nonzero divisors (the zero case traps at runtime and must
//! stay observable through the generic path).

use super::{dead_after, jump_target_set, FuncBody};
use etch_core::instruction::{Instruction, Opcode, Operands};
use etch_core::Const;

fn imm_form(op: Opcode) -> Option<Opcode> {
    match op {
        Opcode::AddInt | Opcode::Add => Some(Opcode::AddImm),
        Opcode::SubInt | Opcode::Sub => Some(Opcode::SubImm),
        Opcode::MulInt | Opcode::Mul => Some(Opcode::MulImm),
        Opcode::DivInt | Opcode::Div => Some(Opcode::DivImm),
        Opcode::ModInt | Opcode::Mod => Some(Opcode::ModImm),
        _ => None,
    }
}

fn commutative(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::AddInt | Opcode::Add | Opcode::MulInt | Opcode::Mul
    )
}

pub(crate) fn run(body: &mut FuncBody, pool: &[Const]) {
    let targets = jump_target_set(&body.code);
    for i in 0..body.code.len().saturating_sub(1) {
        let load = body.code[i];
        if load.op != Opcode::LoadK || targets[i + 1] {
            continue;
        }
        let Operands::Abx { a: t, bx } = load.operands else {
            continue;
        };
        let Some(Const::Int(v)) = pool.get(bx as usize) else {
            continue;
        };
        let Ok(imm) = i8::try_from(*v) else { continue };
        let next = body.code[i + 1];
        let Some(imm_op) = imm_form(next.op) else {
            continue;
        };
        if imm == 0 && matches!(imm_op, Opcode::DivImm | Opcode::ModImm) {
            continue;
        }
        let Operands::Abc { a: dst, b, c } = next.operands else {
            continue;
        };
        // The constant register must be one operand and dead afterward
        let src = if c as u8 == t {
            b
        } else if b as u8 == t && commutative(next.op) {
            c
        } else {
            continue;
        };
        // Both operands being the constant would leave the surviving
        // operand reading a wiped register
        if src as u8 == t {
            continue;
        }
        if !dead_after(&body.code, t, i + 1) {
            continue;
        }
        body.code[i] = Instruction::nop();
        body.code[i + 1] = Instruction::abc(imm_op, dst, src, imm as u8 as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::body;
    use super::*;

    #[test]
    fn test_converts_small_constant() {
        let pool = vec![Const::Int(1)];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 1, 0),
            Instruction::abc(Opcode::AddInt, 2, 0, 1),
        ]);
        run(&mut b, &pool);
        assert_eq!(b.code[0].op, Opcode::NoOp);
        assert_eq!(b.code[1].op, Opcode::AddImm);
        assert_eq!(b.code[1].imm8(), 1);
    }

    #[test]
    fn test_negative_immediate() {
        let pool = vec![Const::Int(-3)];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 1, 0),
            Instruction::abc(Opcode::SubInt, 2, 0, 1),
        ]);
        run(&mut b, &pool);
        assert_eq!(b.code[1].op, Opcode::SubImm);
        assert_eq!(b.code[1].imm8(), -3);
    }

    #[test]
    fn test_large_constant_untouched() {
        let pool = vec![Const::Int(1000)];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 1, 0),
            Instruction::abc(Opcode::AddInt, 2, 0, 1),
        ]);
        run(&mut b, &pool);
        assert_eq!(b.code[0].op, Opcode::LoadK);
        assert_eq!(b.code[1].op, Opcode::AddInt);
    }

    #[test]
    fn test_commutative_swap() {
        // constant is the left operand of an Add
        let pool = vec![Const::Int(5)];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 1, 0),
            Instruction::abc(Opcode::AddInt, 2, 1, 0),
        ]);
        run(&mut b, &pool);
        assert_eq!(b.code[1].op, Opcode::AddImm);
        match b.code[1].operands {
            Operands::Abc { b, .. } => assert_eq!(b, 0),
            _ => panic!("expected Abc"),
        }
    }

    #[test]
    fn test_noncommutative_left_constant_untouched() {
        // 5 - x must not become x SubImm 5
        let pool = vec![Const::Int(5)];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 1, 0),
            Instruction::abc(Opcode::SubInt, 2, 1, 0),
        ]);
        run(&mut b, &pool);
        assert_eq!(b.code[1].op, Opcode::SubInt);
    }
}
