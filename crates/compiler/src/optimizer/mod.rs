//! Optimizer passes over instruction streams
//!
//! Passes run per function, in a fixed order:
//!
//! 1. constant folding
//! 2. immediate-operand conversion
//! 3. peephole (load/move forwarding, redundant compares)
//! 4. instruction fusion
//! 5. move fusion
//! 6. loop analysis (invariant hoisting, integer-for specialization)
//! 7. no-op removal with jump-target repair
//!
//! Every pass must leave the stream semantically equivalent, with jump
//! targets landing on a surviving instruction or the end-of-function
//! sentinel. Passes 1-5 only rewrite in place (wiped instructions become
//! `NoOp`); passes 6 and 7 may reorder or remove and therefore repair
//! jump offsets through an old-pc to new-pc map.

mod cleanup;
mod fold;
mod fusion;
mod immediate;
mod loops;
mod movefuse;
mod peephole;

use crate::codegen::FnMeta;
use etch_core::instruction::{Instruction, Opcode, Operands};
use etch_core::{Const, DebugInfo, FunctionKind, Program};
use std::collections::HashMap;
use tracing::debug;

/// Intern a constant into the shared pool
pub(crate) fn add_const(pool: &mut Vec<Const>, c: Const) -> u32 {
    if let Some(idx) = pool.iter().position(|k| *k == c) {
        return idx as u32;
    }
    pool.push(c);
    (pool.len() - 1) as u32
}

/// One function's instructions and debug slots during optimization
pub(crate) struct FuncBody {
    pub code: Vec<Instruction>,
    pub debug: Vec<DebugInfo>,
    pub has_yield: bool,
}

/// Run all passes over every native function in the program
pub fn optimize(program: &mut Program, meta: &HashMap<String, FnMeta>) {
    // Split the flat stream into per-function bodies, ordered by pc
    let mut order: Vec<String> = program
        .functions
        .iter()
        .filter(|(_, r)| r.kind == FunctionKind::Native)
        .map(|(n, _)| n.clone())
        .collect();
    order.sort_by_key(|n| program.functions[n].start_pc);

    let instructions = std::mem::take(&mut program.instructions);
    let debug_info = std::mem::take(&mut program.debug_info);

    let mut bodies: Vec<(String, FuncBody)> = Vec::with_capacity(order.len());
    for name in &order {
        let rec = &program.functions[name];
        let (s, e) = (rec.start_pc as usize, rec.end_pc as usize);
        bodies.push((
            name.clone(),
            FuncBody {
                code: instructions[s..e].to_vec(),
                debug: debug_info[s..e].to_vec(),
                has_yield: meta.get(name).map(|m| m.has_yield).unwrap_or(false),
            },
        ));
    }

    let mut pool = std::mem::take(&mut program.constants);
    for (name, body) in bodies.iter_mut() {
        let before = body.code.len();
        fold::run(body, &mut pool);
        immediate::run(body, &pool);
        peephole::run(body);
        fusion::run(body);
        movefuse::run(body);
        loops::run(body, &pool);
        cleanup::run(body);
        debug!(
            function = %name,
            before,
            after = body.code.len(),
            "optimized"
        );
    }
    program.constants = pool;

    // Reassemble the flat stream and update the records
    let mut new_instructions = Vec::new();
    let mut new_debug = Vec::new();
    for (name, body) in bodies {
        let start = new_instructions.len() as u32;
        new_instructions.extend(body.code);
        new_debug.extend(body.debug);
        let end = new_instructions.len() as u32;
        if let Some(rec) = program.functions.get_mut(&name) {
            rec.start_pc = start;
            rec.end_pc = end;
        }
    }
    program.instructions = new_instructions;
    program.debug_info = new_debug;
}

// ----------------------------------------------------------------------------
// Shared def-use analysis
// ----------------------------------------------------------------------------

pub(crate) struct RegUse {
    pub reads: Vec<u8>,
    pub write: Option<u8>,
}

/// Registers read and written by an instruction. The single source of
/// truth for operand roles across all passes.
pub(crate) fn reg_uses(instr: &Instruction) -> RegUse {
    let (a, b, c) = match instr.operands {
        Operands::Abc { a, b, c } => (a, b as u8, c as u8),
        Operands::Abx { a, .. } => (a, 0, 0),
        Operands::Asbx { a, .. } => (a, 0, 0),
        Operands::Ax { .. } => (0, 0, 0),
        Operands::Call { dst, func, .. } => (dst, func as u8, 0),
    };
    let mut reads = Vec::new();
    let mut write = None;
    match instr.op {
        Opcode::NoOp
        | Opcode::Jmp
        | Opcode::PushDefer
        | Opcode::ExecDefers
        | Opcode::DeferEnd
        | Opcode::CheckCycles
        | Opcode::ArgImm => {}
        Opcode::LoadK | Opcode::LoadBool | Opcode::LoadNil | Opcode::LoadNone | Opcode::NewTable => {
            write = Some(a)
        }
        Opcode::Move
        | Opcode::Unm
        | Opcode::Not
        | Opcode::Len
        | Opcode::NewRef
        | Opcode::NewWeak
        | Opcode::WeakToStrong
        | Opcode::Deref
        | Opcode::WrapSome
        | Opcode::WrapOk
        | Opcode::WrapErr
        | Opcode::UnwrapOption
        | Opcode::UnwrapResult
        | Opcode::Cast
        | Opcode::GetField
        | Opcode::GetIndexImm
        | Opcode::Resume => {
            reads.push(b);
            write = Some(a);
        }
        Opcode::Add
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
        | Opcode::Pow
        | Opcode::And
        | Opcode::Or
        | Opcode::In
        | Opcode::NotIn
        | Opcode::GetIndex
        | Opcode::GetIndexInt
        | Opcode::ConcatArray => {
            reads.push(b);
            reads.push(c);
            write = Some(a);
        }
        Opcode::Cmp(_) | Opcode::CmpInt(_) | Opcode::CmpFloat(_) => {
            reads.push(b);
            reads.push(c);
            write = Some(a);
        }
        Opcode::AddImm | Opcode::SubImm | Opcode::MulImm | Opcode::DivImm | Opcode::ModImm => {
            reads.push(b);
            write = Some(a);
        }
        Opcode::Fused(_) | Opcode::FusedInt(_) | Opcode::FusedFloat(_) => {
            reads.push(a);
            reads.push(b);
            reads.push(c);
            write = Some(a);
        }
        Opcode::NewArray => {
            // reads b..b+c-1
            let count = c;
            for i in 0..count {
                reads.push(b.wrapping_add(i));
            }
            write = Some(a);
        }
        Opcode::Slice => {
            reads.push(b);
            reads.push(c);
            reads.push(c.wrapping_add(1));
            write = Some(a);
        }
        Opcode::SetIndex | Opcode::SetIndexInt => {
            reads.push(a);
            reads.push(b);
            reads.push(c);
        }
        Opcode::SetField | Opcode::GetAddSet | Opcode::GetSubSet | Opcode::GetMulSet
        | Opcode::GetDivSet | Opcode::GetModSet => {
            reads.push(a);
            reads.push(c);
        }
        Opcode::SetRef => {
            reads.push(a);
            reads.push(b);
        }
        Opcode::IncRef | Opcode::DecRef | Opcode::Test | Opcode::TestTag | Opcode::Yield
        | Opcode::Arg | Opcode::InitGlobal | Opcode::SetGlobal | Opcode::Return => {
            reads.push(a);
        }
        Opcode::TestSet => {
            reads.push(b);
            write = Some(a);
        }
        Opcode::GetGlobal => write = Some(a),
        Opcode::LoadAddStore | Opcode::LoadSubStore | Opcode::LoadMulStore
        | Opcode::LoadDivStore | Opcode::LoadModStore => {
            reads.push(c);
        }
        Opcode::CmpJmp(_) | Opcode::CmpJmpInt(_) | Opcode::CmpJmpFloat(_) | Opcode::IncTest => {
            let (lhs, rhs, _) = instr.unpack_cmp();
            reads.push(lhs);
            reads.push(rhs);
            if instr.op == Opcode::IncTest {
                write = Some(lhs);
            }
        }
        Opcode::ForPrep | Opcode::ForLoop | Opcode::ForIntPrep | Opcode::ForIntLoop => {
            reads.push(a);
            reads.push(a.wrapping_add(1));
            reads.push(a.wrapping_add(2));
            write = Some(a);
        }
        Opcode::Call | Opcode::CallBuiltin | Opcode::CallHost | Opcode::CallFfi
        | Opcode::Spawn | Opcode::NewClosure => {
            write = Some(a);
        }
        Opcode::CallClosure => {
            reads.push(b); // the closure register rides in `func`
            write = Some(a);
        }
        Opcode::TailCall => {}
    }
    RegUse { reads, write }
}

/// The explicit control-flow target of an instruction at `pc`, if any
pub(crate) fn branch_target(instr: &Instruction, pc: usize) -> Option<usize> {
    if instr.op.is_sbx_jump() {
        if let Operands::Asbx { sbx, .. } = instr.operands {
            return Some((pc as i64 + 1 + sbx as i64).max(0) as usize);
        }
    }
    if instr.op.is_cmp_jmp() {
        let (_, _, off) = instr.unpack_cmp();
        return Some((pc as i64 + 1 + off as i64).max(0) as usize);
    }
    None
}

/// The defer body a PushDefer points at; its offset is based on the
/// instruction's own pc, unlike ordinary jumps
pub(crate) fn defer_body_target(instr: &Instruction, pc: usize) -> Option<usize> {
    if instr.op != Opcode::PushDefer {
        return None;
    }
    match instr.operands {
        Operands::Asbx { sbx, .. } => Some((pc as i64 + sbx as i64).max(0) as usize),
        _ => None,
    }
}

/// Marks every instruction index reachable non-sequentially: jump
/// targets, the skip targets of Test/TestTag, defer bodies, and the
/// resume points after ExecDefers
pub(crate) fn jump_target_set(code: &[Instruction]) -> Vec<bool> {
    let mut targets = vec![false; code.len() + 1];
    for (pc, instr) in code.iter().enumerate() {
        if let Some(t) = branch_target(instr, pc) {
            if t < targets.len() {
                targets[t] = true;
            }
        }
        if let Some(t) = defer_body_target(instr, pc) {
            if t < targets.len() {
                targets[t] = true;
            }
        }
        if matches!(instr.op, Opcode::Test | Opcode::TestTag) && pc + 2 < targets.len() {
            targets[pc + 2] = true;
        }
        // DeferEnd returns to the instruction after the ExecDefers site
        if instr.op == Opcode::ExecDefers && pc + 1 < targets.len() {
            targets[pc + 1] = true;
        }
    }
    targets
}

/// Conservative deadness: `reg` is dead after `pc` when no later
/// instruction reads it, no back edge can re-run earlier reads, and no
/// defer body at or before `pc` can re-run at a later scope exit
pub(crate) fn dead_after(code: &[Instruction], reg: u8, pc: usize) -> bool {
    for instr in code.iter().skip(pc + 1) {
        if reg_uses(instr).reads.contains(&reg) {
            return false;
        }
    }
    for (src, instr) in code.iter().enumerate() {
        if src <= pc {
            continue;
        }
        if let Some(target) = branch_target(instr, src) {
            if target <= pc {
                return false;
            }
        }
    }
    let defer_body_before = code
        .iter()
        .enumerate()
        .filter_map(|(src, i)| defer_body_target(i, src))
        .any(|t| t <= pc);
    if defer_body_before {
        let exec_after = code
            .iter()
            .skip(pc + 1)
            .any(|i| matches!(i.op, Opcode::ExecDefers | Opcode::DeferEnd));
        if exec_after {
            return false;
        }
    }
    true
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn body(code: Vec<Instruction>) -> FuncBody {
        let n = code.len();
        FuncBody {
            code,
            debug: vec![DebugInfo::default(); n],
            has_yield: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etch_core::instruction::CmpOp;

    #[test]
    fn test_reg_uses_arith() {
        let i = Instruction::abc(Opcode::AddInt, 2, 0, 1);
        let u = reg_uses(&i);
        assert_eq!(u.reads, vec![0, 1]);
        assert_eq!(u.write, Some(2));
    }

    #[test]
    fn test_reg_uses_cmp_jmp() {
        let i = Instruction::cmp_jmp(Opcode::CmpJmpInt(CmpOp::Lt), 4, 5, 3);
        let u = reg_uses(&i);
        assert_eq!(u.reads, vec![4, 5]);
        assert_eq!(u.write, None);
    }

    #[test]
    fn test_dead_after_blocked_by_back_edge() {
        let code = vec![
            Instruction::abx(Opcode::LoadK, 0, 0),
            Instruction::abc(Opcode::AddInt, 1, 0, 0),
            Instruction::asbx(Opcode::Jmp, 0, -2), // back to pc 1
        ];
        // r0 read at pc 1, and the back edge can re-run it
        assert!(!dead_after(&code, 0, 1));
        assert!(dead_after(&code, 1, 2));
    }
}
