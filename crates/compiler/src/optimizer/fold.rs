//! Pass 1: constant folding
//!
//! Recognizes `LoadK; LoadK; BinOp` triples over matching scalar types
//! and replaces them with a single `LoadK` of the folded value. Folding
//! skips zero divisors and overflowing results; wiped instructions
//! become `NoOp` for the cleanup pass to drop.

use super::{add_const, dead_after, jump_target_set, FuncBody};
use etch_core::instruction::{Instruction, Opcode, Operands};
use etch_core::Const;

pub(crate) fn run(body: &mut FuncBody, pool: &mut Vec<Const>) {
    let targets = jump_target_set(&body.code);
    let mut i = 0;
    while i + 2 < body.code.len() {
        if !try_fold_at(body, pool, &targets, i) {
            i += 1;
        } else {
            i += 3;
        }
    }
}

fn try_fold_at(
    body: &mut FuncBody,
    pool: &mut Vec<Const>,
    targets: &[bool],
    i: usize,
) -> bool {
    let (first, second, third) = (body.code[i], body.code[i + 1], body.code[i + 2]);
    // The triple must flow straight through, with no incoming jumps
    if targets[i + 1] || targets[i + 2] {
        return false;
    }
    if first.op != Opcode::LoadK || second.op != Opcode::LoadK {
        return false;
    }
    let (Operands::Abx { a: ra, bx: ka }, Operands::Abx { a: rb, bx: kb }) =
        (first.operands, second.operands)
    else {
        return false;
    };
    let Operands::Abc { a: dst, b, c } = third.operands else {
        return false;
    };
    if (b as u8, c as u8) != (ra, rb) {
        return false;
    }
    if !dead_after(&body.code, ra, i + 2) || !dead_after(&body.code, rb, i + 2) {
        return false;
    }
    let (Some(lk), Some(rk)) = (pool.get(ka as usize), pool.get(kb as usize)) else {
        return false;
    };
    let Some(folded) = fold(third.op, lk, rk) else {
        return false;
    };
    let k = add_const(pool, folded);
    body.code[i] = Instruction::nop();
    body.code[i + 1] = Instruction::nop();
    body.code[i + 2] = Instruction::abx(Opcode::LoadK, dst, k);
    true
}

/// Fold a binary operation over two constants of matching scalar type
fn fold(op: Opcode, lhs: &Const, rhs: &Const) -> Option<Const> {
    match (lhs, rhs) {
        (Const::Int(a), Const::Int(b)) => {
            let v = match op {
                Opcode::Add | Opcode::AddInt => a.checked_add(*b)?,
                Opcode::Sub | Opcode::SubInt => a.checked_sub(*b)?,
                Opcode::Mul | Opcode::MulInt => a.checked_mul(*b)?,
                Opcode::Div | Opcode::DivInt => {
                    if *b == 0 {
                        return None;
                    }
                    a.checked_div(*b)?
                }
                Opcode::Mod | Opcode::ModInt => {
                    if *b == 0 {
                        return None;
                    }
                    a.checked_rem(*b)?
                }
                Opcode::Pow => {
                    if *b < 0 || *b > u32::MAX as i64 {
                        return None;
                    }
                    a.checked_pow(*b as u32)?
                }
                _ => return None,
            };
            Some(Const::Int(v))
        }
        (Const::Float(a), Const::Float(b)) => {
            let v = match op {
                Opcode::Add | Opcode::AddFloat => a + b,
                Opcode::Sub | Opcode::SubFloat => a - b,
                Opcode::Mul | Opcode::MulFloat => a * b,
                Opcode::Div | Opcode::DivFloat => a / b,
                Opcode::Pow => a.powf(*b),
                _ => return None,
            };
            Some(Const::Float(v))
        }
        (Const::Str(a), Const::Str(b)) if op == Opcode::Add => {
            Some(Const::Str(format!("{}{}", a, b)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::body;
    use super::*;

    #[test]
    fn test_folds_int_add() {
        let mut pool = vec![Const::Int(6), Const::Int(7)];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 0, 0),
            Instruction::abx(Opcode::LoadK, 1, 1),
            Instruction::abc(Opcode::AddInt, 2, 0, 1),
            Instruction::abc(Opcode::Return, 2, 1, 0),
        ]);
        run(&mut b, &mut pool);
        assert_eq!(b.code[0].op, Opcode::NoOp);
        assert_eq!(b.code[1].op, Opcode::NoOp);
        assert_eq!(b.code[2].op, Opcode::LoadK);
        let folded_idx = match b.code[2].operands {
            Operands::Abx { bx, .. } => bx as usize,
            _ => panic!("expected Abx"),
        };
        assert_eq!(pool[folded_idx], Const::Int(13));
    }

    #[test]
    fn test_skips_zero_divisor() {
        let mut pool = vec![Const::Int(10), Const::Int(0)];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 0, 0),
            Instruction::abx(Opcode::LoadK, 1, 1),
            Instruction::abc(Opcode::DivInt, 2, 0, 1),
        ]);
        run(&mut b, &mut pool);
        assert_eq!(b.code[2].op, Opcode::DivInt);
    }

    #[test]
    fn test_skips_live_operand() {
        let mut pool = vec![Const::Int(1), Const::Int(2)];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 0, 0),
            Instruction::abx(Opcode::LoadK, 1, 1),
            Instruction::abc(Opcode::AddInt, 2, 0, 1),
            // r0 read again: the load cannot be wiped
            Instruction::abc(Opcode::AddInt, 3, 0, 2),
        ]);
        run(&mut b, &mut pool);
        assert_eq!(b.code[0].op, Opcode::LoadK);
        assert_eq!(b.code[2].op, Opcode::AddInt);
    }

    #[test]
    fn test_folds_string_concat() {
        let mut pool = vec![Const::Str("ab".into()), Const::Str("cd".into())];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 0, 0),
            Instruction::abx(Opcode::LoadK, 1, 1),
            Instruction::abc(Opcode::Add, 2, 0, 1),
        ]);
        run(&mut b, &mut pool);
        assert_eq!(b.code[2].op, Opcode::LoadK);
        assert!(pool.contains(&Const::Str("abcd".into())));
    }
}
