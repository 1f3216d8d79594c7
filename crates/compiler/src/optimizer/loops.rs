//! Pass 6: loop optimizations
//!
//! Detects loop regions by back-edges, builds nesting relationships and
//! a per-region def set, classifies pure instructions whose inputs are
//! loop-invariant, and hoists them to the pre-header (the `ForPrep`
//! site for numeric loops, the instruction before the region for
//! condition-headed loops). Side-effecting, trapping and control-flow
//! instructions never move.
//!
//! Finally, generic `ForPrep`/`ForLoop` pairs whose index, limit and
//! step registers are all defined by integer-producing instructions are
//! converted to the integer-specialized variants.

use super::{branch_target, reg_uses, FuncBody};
use etch_core::instruction::{Instruction, Opcode, Operands};
use etch_core::Const;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    start: usize,
    /// The back-edge instruction (inclusive)
    end: usize,
}

pub(crate) fn run(body: &mut FuncBody, pool: &[Const]) {
    // Defer bodies are entered through saved pcs the rebuild cannot see;
    // reordering a function that registers defers is not worth the risk
    let has_defers = body.code.iter().any(|i| i.op == Opcode::PushDefer);
    if !has_defers {
        hoist_invariants(body);
    }
    convert_int_for(body, pool);
}

fn find_regions(code: &[Instruction]) -> Vec<Region> {
    let mut regions = Vec::new();
    for (pc, instr) in code.iter().enumerate() {
        if let Some(target) = branch_target(instr, pc) {
            if target <= pc {
                regions.push(Region {
                    start: target,
                    end: pc,
                });
            }
        }
    }
    // Outermost first, so invariants leave the widest region available
    regions.sort_by_key(|r| (r.start, std::cmp::Reverse(r.end)));
    regions.dedup();
    regions
}

/// Pure operations that are safe to execute unconditionally once:
/// no traps, no heap writes, no control flow
fn hoistable(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::LoadK
            | Opcode::LoadBool
            | Opcode::LoadNil
            | Opcode::LoadNone
            | Opcode::AddInt
            | Opcode::SubInt
            | Opcode::MulInt
            | Opcode::AddFloat
            | Opcode::SubFloat
            | Opcode::MulFloat
            | Opcode::AddImm
            | Opcode::SubImm
            | Opcode::MulImm
            | Opcode::Unm
            | Opcode::Not
            | Opcode::CmpInt(_)
            | Opcode::CmpFloat(_)
    )
}

fn hoist_invariants(body: &mut FuncBody) {
    let regions = find_regions(&body.code);
    if regions.is_empty() {
        return;
    }
    let code = &body.code;

    // Nesting: skip regions fully contained in an already-processed one;
    // their invariants hoist one level per pass
    let mut processed: Vec<Region> = Vec::new();
    // (insertion point, hoisted old pcs in original order)
    let mut hoists: Vec<(usize, Vec<usize>)> = Vec::new();
    let mut hoisted_set: HashSet<usize> = HashSet::new();

    for region in regions {
        if processed
            .iter()
            .any(|outer| outer.start <= region.start && region.end <= outer.end)
        {
            continue;
        }
        processed.push(region);

        // Registers written anywhere in the region
        let mut written: HashSet<u8> = HashSet::new();
        let mut write_counts = [0u32; 256];
        for instr in &code[region.start..=region.end] {
            if let Some(w) = reg_uses(instr).write {
                written.insert(w);
                write_counts[w as usize] += 1;
            }
        }

        // The pre-header: a ForLoop back edge hoists above its ForPrep,
        // a plain back edge hoists directly above the region
        let insert_at = match code[region.end].op {
            Opcode::ForLoop | Opcode::ForIntLoop => {
                let prep = (0..region.start)
                    .rev()
                    .find(|&pc| {
                        matches!(code[pc].op, Opcode::ForPrep | Opcode::ForIntPrep)
                            && branch_target(&code[pc], pc) == Some(region.end)
                    });
                match prep {
                    Some(p) => p,
                    None => continue,
                }
            }
            _ => region.start,
        };

        let mut region_hoists = Vec::new();
        for pc in region.start..=region.end {
            if hoisted_set.contains(&pc) {
                continue;
            }
            let instr = &code[pc];
            if !hoistable(instr.op) {
                continue;
            }
            let uses = reg_uses(instr);
            let Some(dst) = uses.write else { continue };
            // Inputs must be invariant; the hoisted values themselves
            // count, so inputs defined by earlier hoists still qualify
            let inputs_invariant = uses
                .reads
                .iter()
                .all(|r| !written.contains(r) || region_hoists.iter().any(|&h| defines(code, h, *r)));
            if !inputs_invariant {
                continue;
            }
            // Single definition, never read earlier in the region
            if write_counts[dst as usize] != 1 {
                continue;
            }
            let read_before = code[region.start..pc]
                .iter()
                .any(|i| reg_uses(i).reads.contains(&dst));
            if read_before {
                continue;
            }
            // A destination alive before the loop would be clobbered on
            // the zero-iteration and not-taken paths
            let defined_before = code[..region.start]
                .iter()
                .any(|i| reg_uses(i).write == Some(dst));
            if defined_before {
                continue;
            }
            region_hoists.push(pc);
            hoisted_set.insert(pc);
        }
        if !region_hoists.is_empty() {
            hoists.push((insert_at, region_hoists));
        }
    }

    if hoists.is_empty() {
        return;
    }
    rebuild(body, hoists, hoisted_set);
}

fn defines(code: &[Instruction], pc: usize, reg: u8) -> bool {
    reg_uses(&code[pc]).write == Some(reg)
}

/// Reorder the instruction stream with hoisted instructions moved to
/// their insertion points, then repair every jump offset
fn rebuild(body: &mut FuncBody, hoists: Vec<(usize, Vec<usize>)>, hoisted: HashSet<usize>) {
    let n = body.code.len();
    let mut order: Vec<usize> = Vec::with_capacity(n);
    for pc in 0..n {
        for (at, list) in &hoists {
            if *at == pc {
                order.extend(list.iter().copied());
            }
        }
        if !hoisted.contains(&pc) {
            order.push(pc);
        }
    }

    let mut map = vec![0usize; n + 1];
    for (new_pc, old_pc) in order.iter().enumerate() {
        map[*old_pc] = new_pc;
    }
    map[n] = order.len();

    // Jump targets landing on a hoisted instruction redirect to the
    // next surviving instruction, so back edges skip the pre-header
    let mut target_map = vec![0usize; n + 1];
    for old in 0..n {
        target_map[old] = if hoisted.contains(&old) {
            match (old + 1..n).find(|p| !hoisted.contains(p)) {
                Some(p) => map[p],
                None => order.len(),
            }
        } else {
            map[old]
        };
    }
    target_map[n] = order.len();

    let old_code = std::mem::take(&mut body.code);
    let old_debug = std::mem::take(&mut body.debug);
    let mut new_code = Vec::with_capacity(n);
    let mut new_debug = Vec::with_capacity(n);
    for old_pc in &order {
        let mut instr = old_code[*old_pc];
        if let Some(old_target) = branch_target(&instr, *old_pc) {
            let new_target = target_map[old_target.min(n)] as i64;
            let new_pc = new_code.len() as i64;
            let offset = new_target - new_pc - 1;
            match &mut instr.operands {
                Operands::Asbx { sbx, .. } => *sbx = offset as i32,
                Operands::Ax { .. } => instr.repack_cmp_offset(offset as i16),
                _ => {}
            }
        }
        new_code.push(instr);
        new_debug.push(old_debug[*old_pc]);
    }
    body.code = new_code;
    body.debug = new_debug;
}

/// Whether the instruction always leaves an integer in its destination
fn produces_int(instr: &Instruction, pool: &[Const]) -> bool {
    match instr.op {
        Opcode::LoadK => match instr.operands {
            Operands::Abx { bx, .. } => matches!(pool.get(bx as usize), Some(Const::Int(_))),
            _ => false,
        },
        Opcode::AddInt
        | Opcode::SubInt
        | Opcode::MulInt
        | Opcode::DivInt
        | Opcode::ModInt
        | Opcode::AddImm
        | Opcode::SubImm
        | Opcode::MulImm
        | Opcode::DivImm
        | Opcode::ModImm
        | Opcode::Len => true,
        Opcode::Fused(_) => false,
        Opcode::FusedInt(_) => true,
        _ => false,
    }
}

/// Convert ForPrep/ForLoop to the integer-specialized forms when idx,
/// limit and step are all provably integers at loop entry
fn convert_int_for(body: &mut FuncBody, pool: &[Const]) {
    for prep_pc in 0..body.code.len() {
        if body.code[prep_pc].op != Opcode::ForPrep {
            continue;
        }
        let Some(loop_pc) = branch_target(&body.code[prep_pc], prep_pc) else {
            continue;
        };
        if body.code.get(loop_pc).map(|i| i.op) != Some(Opcode::ForLoop) {
            continue;
        }
        let base = match body.code[prep_pc].operands {
            Operands::Asbx { a, .. } => a,
            _ => continue,
        };
        // Find the last definition of each triple register before the prep
        let all_int = (0..3).all(|i| {
            let reg = base + i;
            (0..prep_pc)
                .rev()
                .find(|&pc| reg_uses(&body.code[pc]).write == Some(reg))
                .map(|pc| produces_int(&body.code[pc], pool))
                .unwrap_or(false)
        });
        if !all_int {
            continue;
        }
        body.code[prep_pc].op = Opcode::ForIntPrep;
        body.code[loop_pc].op = Opcode::ForIntLoop;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::body;
    use super::*;

    #[test]
    fn test_for_int_conversion() {
        // idx=0, limit=10, step=1, all LoadK ints
        let pool = vec![Const::Int(0), Const::Int(10), Const::Int(1)];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 0, 0),
            Instruction::abx(Opcode::LoadK, 1, 1),
            Instruction::abx(Opcode::LoadK, 2, 2),
            Instruction::asbx(Opcode::ForPrep, 0, 1), // to pc 5
            Instruction::abc(Opcode::NoOp, 0, 0, 0),
            Instruction::asbx(Opcode::ForLoop, 0, -2),
        ]);
        run(&mut b, &pool);
        assert_eq!(b.code[3].op, Opcode::ForIntPrep);
        assert_eq!(b.code[5].op, Opcode::ForIntLoop);
    }

    #[test]
    fn test_float_bound_blocks_conversion() {
        let pool = vec![Const::Int(0), Const::Float(10.0), Const::Int(1)];
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 0, 0),
            Instruction::abx(Opcode::LoadK, 1, 1),
            Instruction::abx(Opcode::LoadK, 2, 2),
            Instruction::asbx(Opcode::ForPrep, 0, 1),
            Instruction::abc(Opcode::NoOp, 0, 0, 0),
            Instruction::asbx(Opcode::ForLoop, 0, -2),
        ]);
        run(&mut b, &pool);
        assert_eq!(b.code[3].op, Opcode::ForPrep);
    }

    #[test]
    fn test_invariant_hoisted_out_of_while_loop() {
        // loop body recomputes r3 = r1 + r2 every iteration; r1/r2 are
        // never written inside the region
        let pool: Vec<Const> = Vec::new();
        let mut b = body(vec![
            Instruction::abx(Opcode::LoadK, 0, 0),            // 0 (pre-loop)
            Instruction::abc(Opcode::AddInt, 3, 1, 2),        // 1 invariant
            Instruction::abc(Opcode::AddImm, 0, 0, 1),        // 2 variant
            Instruction::asbx(Opcode::Jmp, 0, -3),            // 3 back to 1
            Instruction::abc(Opcode::Return, 0, 1, 0),        // 4
        ]);
        run(&mut b, &pool);
        // The invariant add now sits before the loop head
        assert_eq!(b.code[1].op, Opcode::AddInt);
        let back = &b.code[3];
        assert_eq!(back.op, Opcode::Jmp);
        // Back edge must land on the first in-loop instruction (pc 2)
        assert_eq!(branch_target(back, 3), Some(2));
        // And the hoisted instruction runs exactly once, outside the loop
        assert_eq!(b.code[2].op, Opcode::AddImm);
    }

    #[test]
    fn test_variant_instruction_not_hoisted() {
        let pool: Vec<Const> = Vec::new();
        let original = vec![
            Instruction::abc(Opcode::AddImm, 0, 0, 1), // 0: writes r0, reads r0
            Instruction::asbx(Opcode::Jmp, 0, -2),     // 1: back to 0
        ];
        let mut b = body(original.clone());
        run(&mut b, &pool);
        assert_eq!(b.code, original);
    }
}
