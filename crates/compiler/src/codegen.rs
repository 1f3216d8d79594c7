//! Bytecode generation
//!
//! Translates the analyzed AST into register bytecode. Owns register
//! allocation, variable lifetime tracking, scope and defer bookkeeping,
//! constant-pool interning, and reference-count operation emission.
//!
//! Calling convention: arguments are pushed onto the VM's argument queue
//! with `Arg`/`ArgImm` and materialized into the callee's first
//! registers by `Call`. Function results arrive in the call's `dst`
//! register.
//!
//! Reference counting: an assignment to a ref-typed location emits
//! `DecRef old; Move; IncRef new`, with `IncRef` elided when the source
//! is a fresh allocation (new, spawn, or a call returning a ref -
//! ownership transfers). Scope exit emits `ExecDefers` then reverse-order
//! `DecRef` for the scope's ref-tracked locals; a returned ref is
//! excluded, transferring ownership to the caller.

use crate::analyzer::{Analysis, FnSig};
use crate::ast::{
    Block, Decl, Expr, ExprKind, FunctionDecl, MatchPattern, Module, Stmt, StmtKind, BinOp, UnOp,
    WrapKind,
};
use crate::error::{CompileError, Result};
use crate::types::Type;
use etch_core::builtins;
use etch_core::instruction::{cast, tag, CmpOp, Instruction, Opcode, Operands};
use etch_core::{Const, DebugInfo, FunctionKind, FunctionRecord, Position, Program};
use std::collections::HashMap;
use tracing::debug;

/// Name of the synthetic module-initializer function, run before main
pub const INIT_FUNCTION: &str = "@init";

/// Variable lifetime record for debug scope reporting
#[derive(Debug, Clone, PartialEq)]
pub struct VarLifetime {
    pub name: String,
    pub register: u8,
    pub decl_pc: u32,
    pub last_use_pc: u32,
}

/// Per-function metadata handed to the optimizer
#[derive(Debug, Clone, Default)]
pub struct FnMeta {
    pub has_yield: bool,
    pub var_lifetimes: Vec<VarLifetime>,
}

#[derive(Debug)]
pub struct CodegenOutput {
    pub program: Program,
    pub meta: HashMap<String, FnMeta>,
}

/// Compile an analyzed module into a program
pub fn generate(module: &Module, analysis: &Analysis, source_hash: [u8; 32]) -> Result<CodegenOutput> {
    let mut program = Program::new();
    program.source_hash = source_hash;
    let mut meta = HashMap::new();

    register_records(&mut program, analysis);

    // Synthetic module initializer for globals
    {
        let mut ctx = FnCtx::new(&mut program, analysis, INIT_FUNCTION.to_string());
        ctx.compile_init(module)?;
        let fn_meta = ctx.finish()?;
        meta.insert(INIT_FUNCTION.to_string(), fn_meta);
    }

    for decl in &module.decls {
        let f = match decl {
            Decl::Function(f) => f,
            _ => continue,
        };
        if !f.type_params.is_empty() {
            // Generic templates are emitted once per instance
            continue;
        }
        let sig = find_sig(analysis, f).ok_or_else(|| {
            CompileError::internal(f.pos.clone(), format!("no signature for '{}'", f.name))
        })?;
        debug!(function = %sig.mangled, "compiling");
        let mut ctx = FnCtx::new(&mut program, analysis, sig.mangled.clone());
        ctx.compile_function(f, &sig)?;
        let fn_meta = ctx.finish()?;
        meta.insert(sig.mangled.clone(), fn_meta);
    }

    Ok(CodegenOutput { program, meta })
}

/// Locate the signature for a declaration: by mangled name when unique,
/// falling back to the (source name, position) pair for overloads
fn find_sig(analysis: &Analysis, f: &FunctionDecl) -> Option<FnSig> {
    if let Some(sig) = analysis.mangled.get(&f.name) {
        if sig.pos == f.pos || f.name.contains('[') || f.name.contains('@') {
            return Some(sig.clone());
        }
    }
    analysis
        .mangled
        .values()
        .find(|s| s.source_name == f.name && s.pos == f.pos)
        .cloned()
}

/// Create function-table entries and records up front so call sites can
/// reference any function regardless of emission order
fn register_records(program: &mut Program, analysis: &Analysis) {
    program.function_index(INIT_FUNCTION);
    program.functions.insert(
        INIT_FUNCTION.to_string(),
        FunctionRecord::native(0, 0),
    );

    // Sorted so function indices (and therefore emitted call operands)
    // are identical across runs
    let mut sigs: Vec<&FnSig> = analysis.mangled.values().collect();
    sigs.sort_by(|a, b| a.mangled.cmp(&b.mangled));
    for sig in sigs {
        program.function_index(&sig.mangled);
        let mut rec = FunctionRecord::native(0, 0);
        rec.param_types = sig.params.iter().map(|p| p.ty.value_tag()).collect();
        rec.return_type = sig.ret.value_tag();
        rec.param_names = sig.params.iter().map(|p| p.name.clone()).collect();
        program.functions.insert(sig.mangled.clone(), rec);
    }

    for ffi in &analysis.ffi {
        program.function_index(&ffi.name);
        let rec = FunctionRecord {
            kind: FunctionKind::Ffi,
            param_types: ffi.params.iter().map(|t| t.value_tag()).collect(),
            return_type: ffi.ret.value_tag(),
            start_pc: 0,
            end_pc: 0,
            max_register: 0,
            param_names: Vec::new(),
            symbol: Some(ffi.name.clone()),
            library: Some(ffi.library.clone()),
            is_destructor: false,
            builtin_id: None,
        };
        program.functions.insert(ffi.name.clone(), rec);
    }

    for host in &analysis.host_functions {
        program.function_index(host);
        let rec = FunctionRecord {
            kind: FunctionKind::Host,
            param_types: Vec::new(),
            return_type: etch_core::ValueTag::Void,
            start_pc: 0,
            end_pc: 0,
            max_register: 0,
            param_names: Vec::new(),
            symbol: None,
            library: None,
            is_destructor: false,
            builtin_id: None,
        };
        program.functions.insert(host.clone(), rec);
    }

    for name in crate::analyzer::BUILTINS {
        if let Some(id) = builtins::id_for(name) {
            let rec = FunctionRecord {
                kind: FunctionKind::Builtin,
                param_types: Vec::new(),
                return_type: etch_core::ValueTag::Void,
                start_pc: 0,
                end_pc: 0,
                max_register: 0,
                param_names: Vec::new(),
                symbol: None,
                library: None,
                is_destructor: false,
                builtin_id: Some(id),
            };
            program.functions.insert((*name).to_string(), rec);
        }
    }
}

// ----------------------------------------------------------------------------
// Register allocator
// ----------------------------------------------------------------------------

/// Bump allocator with freeing and a high-water mark. Guarantees
/// consecutive blocks for numeric-for triples and literal element lists.
struct RegAlloc {
    used: [bool; 256],
    max: u8,
}

impl RegAlloc {
    fn new() -> Self {
        RegAlloc {
            used: [false; 256],
            max: 0,
        }
    }

    fn alloc(&mut self, pos: &Position) -> Result<u8> {
        for r in 0..=255u8 {
            if !self.used[r as usize] {
                self.used[r as usize] = true;
                self.max = self.max.max(r);
                return Ok(r);
            }
        }
        Err(CompileError::internal(
            pos.clone(),
            "function needs more than 256 registers",
        ))
    }

    /// Allocate `n` consecutive registers, returning the first
    fn alloc_block(&mut self, n: usize, pos: &Position) -> Result<u8> {
        if n == 0 {
            return self.alloc(pos);
        }
        'outer: for start in 0..=(256usize.saturating_sub(n)) {
            for i in 0..n {
                if self.used[start + i] {
                    continue 'outer;
                }
            }
            for i in 0..n {
                self.used[start + i] = true;
            }
            let last = (start + n - 1) as u8;
            self.max = self.max.max(last);
            return Ok(start as u8);
        }
        Err(CompileError::internal(
            pos.clone(),
            "function needs more than 256 registers",
        ))
    }

    fn free(&mut self, r: u8) {
        self.used[r as usize] = false;
    }
}

// ----------------------------------------------------------------------------
// Scopes and loops
// ----------------------------------------------------------------------------

struct VarSlot {
    register: u8,
    ty: Type,
    decl_pc: u32,
}

#[derive(Default)]
struct ScopeInfo {
    vars: HashMap<String, VarSlot>,
    /// Registers holding RC-tracked values, in declaration order
    ref_regs: Vec<u8>,
    has_defers: bool,
    temps: Vec<u8>,
}

struct LoopCtx {
    /// Scope depth of the loop body (for break/continue unwinding)
    scope_depth: usize,
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
}

// ----------------------------------------------------------------------------
// Per-function compiler
// ----------------------------------------------------------------------------

struct FnCtx<'a> {
    program: &'a mut Program,
    analysis: &'a Analysis,
    name: String,
    regs: RegAlloc,
    scopes: Vec<ScopeInfo>,
    loops: Vec<LoopCtx>,
    start_pc: usize,
    has_yield: bool,
    allocates_heap: bool,
    var_lifetimes: Vec<VarLifetime>,
    current_file: u16,
}

impl<'a> FnCtx<'a> {
    fn new(program: &'a mut Program, analysis: &'a Analysis, name: String) -> Self {
        let start_pc = program.instructions.len();
        FnCtx {
            program,
            analysis,
            name,
            regs: RegAlloc::new(),
            scopes: vec![ScopeInfo::default()],
            loops: Vec::new(),
            start_pc,
            has_yield: false,
            allocates_heap: false,
            var_lifetimes: Vec::new(),
            current_file: 0,
        }
    }

    fn pc(&self) -> usize {
        self.program.instructions.len()
    }

    fn emit(&mut self, instr: Instruction, pos: &Position) -> usize {
        let pc = self.pc();
        self.program.instructions.push(instr);
        let file = if pos.file.is_empty() {
            self.current_file
        } else {
            let f = self.program.add_file(&pos.file);
            self.current_file = f;
            f
        };
        self.program.debug_info.push(DebugInfo {
            file,
            line: pos.line,
            col: pos.column,
        });
        pc
    }

    fn internal(&self, pos: &Position, msg: impl Into<String>) -> CompileError {
        CompileError::internal(pos.clone(), msg)
    }

    fn konst(&mut self, c: Const) -> u32 {
        self.program.add_constant(c)
    }

    fn kname(&mut self, name: &str, pos: &Position) -> Result<u16> {
        let idx = self.program.add_constant(Const::Str(name.to_string()));
        u16::try_from(idx)
            .map_err(|_| self.internal(pos, "constant pool exceeds field-operand width"))
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    fn compile_init(&mut self, module: &Module) -> Result<()> {
        for decl in &module.decls {
            let v = match decl {
                Decl::Global(v) => v,
                _ => continue,
            };
            let Some(init) = &v.init else { continue };
            let reg = self.expr(init, None)?;
            let kidx = self.konst(Const::Str(v.name.clone()));
            self.emit(Instruction::abx(Opcode::InitGlobal, reg, kidx), &v.pos);
            self.release_temp(reg);
        }
        let end = Position::synthetic();
        self.emit(Instruction::abc(Opcode::Return, 0, 0, 0), &end);
        Ok(())
    }

    fn compile_function(&mut self, f: &FunctionDecl, sig: &FnSig) -> Result<()> {
        // Parameters (including lambda captures) occupy the first
        // consecutive registers, in signature order
        for p in &sig.params {
            let reg = self.regs.alloc(&f.pos)?;
            if let Some(scope) = self.scopes.first_mut() {
                scope.vars.insert(
                    p.name.clone(),
                    VarSlot {
                        register: reg,
                        ty: p.ty.clone(),
                        decl_pc: self.program.instructions.len() as u32,
                    },
                );
            }
        }
        self.block(&f.body)?;
        // Fall-through epilogue for void paths
        self.emit_function_exit(None, &f.pos)?;
        self.emit(Instruction::abc(Opcode::Return, 0, 0, 0), &f.pos);
        Ok(())
    }

    fn finish(mut self) -> Result<FnMeta> {
        let end_pc = self.pc();
        let missing = CompileError::internal(Position::synthetic(), "missing function record");
        let rec = self.program.functions.get_mut(&self.name).ok_or(missing)?;
        rec.start_pc = self.start_pc as u32;
        rec.end_pc = end_pc as u32;
        rec.max_register = self.regs.max;
        Ok(FnMeta {
            has_yield: self.has_yield,
            var_lifetimes: std::mem::take(&mut self.var_lifetimes),
        })
    }

    // ------------------------------------------------------------------
    // Scope helpers
    // ------------------------------------------------------------------

    fn lookup_var(&self, name: &str) -> Option<(u8, Type)> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.vars.get(name))
            .map(|slot| (slot.register, slot.ty.clone()))
    }

    fn is_global(&self, name: &str) -> Option<Type> {
        self.analysis
            .globals
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
    }

    fn push_scope(&mut self) {
        self.scopes.push(ScopeInfo::default());
    }

    /// Emit exit code for the top scope, then drop it
    fn pop_scope(&mut self, pos: &Position) {
        self.emit_scope_cleanup(self.scopes.len() - 1, None, pos);
        if let Some(scope) = self.scopes.pop() {
            for slot in scope.vars.values() {
                let pc = self.pc() as u32;
                self.var_lifetimes.push(VarLifetime {
                    name: String::new(),
                    register: slot.register,
                    decl_pc: slot.decl_pc,
                    last_use_pc: pc,
                });
                self.regs.free(slot.register);
            }
            for t in scope.temps {
                self.regs.free(t);
            }
        }
    }

    /// Emit ExecDefers + reverse-order DecRefs for a single scope depth,
    /// without dropping compiler state (used for break/return paths)
    fn emit_scope_cleanup(&mut self, depth: usize, skip: Option<u8>, pos: &Position) {
        let (has_defers, refs) = match self.scopes.get(depth) {
            Some(s) => (s.has_defers, s.ref_regs.clone()),
            None => return,
        };
        if has_defers {
            self.emit(
                Instruction::abc(Opcode::ExecDefers, depth as u8, 0, 0),
                pos,
            );
        }
        for reg in refs.iter().rev() {
            if Some(*reg) == skip {
                continue;
            }
            self.emit(Instruction::abc(Opcode::DecRef, *reg, 0, 0), pos);
        }
    }

    /// Exit code for scopes above (and including) `down_to`, innermost
    /// first; compiler state is left intact
    fn emit_unwind(&mut self, down_to: usize, skip: Option<u8>, pos: &Position) {
        for depth in (down_to..self.scopes.len()).rev() {
            self.emit_scope_cleanup(depth, skip, pos);
        }
    }

    fn emit_function_exit(&mut self, returned: Option<(u8, &Type)>, pos: &Position) -> Result<()> {
        let skip = match returned {
            Some((reg, ty)) if ty.is_ref_counted() => Some(reg),
            _ => None,
        };
        self.emit_unwind(0, skip, pos);
        if self.allocates_heap {
            self.emit(Instruction::abc(Opcode::CheckCycles, 0, 0, 0), pos);
        }
        Ok(())
    }

    fn track_temp(&mut self, reg: u8) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.temps.push(reg);
        }
    }

    fn release_temp(&mut self, reg: u8) {
        // Only free registers not owned by a variable
        let is_var = self
            .scopes
            .iter()
            .any(|s| s.vars.values().any(|v| v.register == reg));
        if !is_var {
            self.regs.free(reg);
            if let Some(scope) = self.scopes.last_mut() {
                scope.temps.retain(|t| *t != reg);
            }
        }
    }

    // ------------------------------------------------------------------
    // Jump patching
    // ------------------------------------------------------------------

    fn patch_jump(&mut self, at: usize, target: usize) {
        let offset = target as i64 - (at as i64 + 1);
        match &mut self.program.instructions[at].operands {
            Operands::Asbx { sbx, .. } => *sbx = offset as i32,
            Operands::Ax { .. } => {
                self.program.instructions[at].repack_cmp_offset(offset as i16);
            }
            _ => {}
        }
    }

    /// Emit a jump that transfers control when `cond` is false
    fn emit_branch_false(&mut self, cond: &Expr) -> Result<usize> {
        // Fused compare-and-jump for direct comparisons
        if let ExprKind::Binary { op, lhs, rhs } = &cond.kind {
            if let Some(cmp) = cmp_of(*op) {
                let lt = lhs.type_of();
                let rt = rhs.type_of();
                let specialized = specialization(&lt, &rt);
                if !matches!(lt, Type::Ref(_) | Type::Weak(_))
                    && !matches!(rt, Type::Ref(_) | Type::Weak(_))
                {
                    let lr = self.expr(lhs, None)?;
                    let rr = self.expr(rhs, None)?;
                    let op = match specialized {
                        Spec::Int => Opcode::CmpJmpInt(cmp.negated()),
                        Spec::Float => Opcode::CmpJmpFloat(cmp.negated()),
                        Spec::Generic => Opcode::CmpJmp(cmp.negated()),
                    };
                    let at = self.emit(Instruction::cmp_jmp(op, lr, rr, 0), &cond.pos);
                    self.release_temp(rr);
                    self.release_temp(lr);
                    return Ok(at);
                }
            }
        }
        let reg = self.expr(cond, None)?;
        // Skip the jump when the condition holds
        self.emit(Instruction::abc(Opcode::Test, reg, 0, 1), &cond.pos);
        let at = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), &cond.pos);
        self.release_temp(reg);
        Ok(at)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn block(&mut self, block: &Block) -> Result<()> {
        self.push_scope();
        for stmt in &block.stmts {
            self.stmt(stmt)?;
        }
        let pos = block
            .stmts
            .last()
            .map(|s| s.pos.clone())
            .unwrap_or_else(Position::synthetic);
        self.pop_scope(&pos);
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Expr(e) => {
                let reg = self.expr(e, None)?;
                // A discarded fresh ref would leak without this
                if e.type_of().is_ref_counted() && is_fresh(e) {
                    self.emit(Instruction::abc(Opcode::DecRef, reg, 0, 0), &stmt.pos);
                }
                self.release_temp(reg);
                Ok(())
            }
            StmtKind::VarDecl(v) => {
                let ty = v
                    .resolved_ty
                    .clone()
                    .or_else(|| v.init.as_ref().and_then(|e| e.ty.clone()))
                    .unwrap_or(Type::Void);
                let reg = self.regs.alloc(&v.pos)?;
                match &v.init {
                    Some(init) => {
                        self.expr(init, Some(reg))?;
                        if matches!(ty, Type::Weak(_)) && matches!(init.type_of(), Type::Ref(_)) {
                            self.emit(Instruction::abc(Opcode::NewWeak, reg, reg as u16, 0), &v.pos);
                        }
                        if ty.is_ref_counted() && !is_fresh(init) {
                            self.emit(Instruction::abc(Opcode::IncRef, reg, 0, 0), &v.pos);
                        }
                    }
                    None => {
                        self.emit(Instruction::abc(Opcode::LoadNil, reg, 0, 0), &v.pos);
                    }
                }
                let decl_pc = self.pc() as u32;
                if let Some(scope) = self.scopes.last_mut() {
                    if ty.is_ref_counted() {
                        scope.ref_regs.push(reg);
                    }
                    scope.vars.insert(
                        v.name.clone(),
                        VarSlot {
                            register: reg,
                            ty,
                            decl_pc,
                        },
                    );
                }
                self.var_lifetimes.push(VarLifetime {
                    name: v.name.clone(),
                    register: reg,
                    decl_pc,
                    last_use_pc: decl_pc,
                });
                Ok(())
            }
            StmtKind::Assign { target, value } => self.assign(target, value, &stmt.pos),
            StmtKind::If {
                arms,
                else_body,
                else_unreachable,
            } => {
                let mut end_jumps = Vec::new();
                for arm in arms {
                    if arm.unreachable {
                        // Dead branches are removed before emission
                        continue;
                    }
                    let false_jump = self.emit_branch_false(&arm.cond)?;
                    self.block(&arm.body)?;
                    let end = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), &stmt.pos);
                    end_jumps.push(end);
                    let next = self.pc();
                    self.patch_jump(false_jump, next);
                }
                if let (Some(body), false) = (else_body, *else_unreachable) {
                    self.block(body)?;
                }
                let end = self.pc();
                for j in end_jumps {
                    self.patch_jump(j, end);
                }
                Ok(())
            }
            StmtKind::While { cond, body } => {
                let loop_start = self.pc();
                let exit_jump = self.emit_branch_false(cond)?;
                self.loops.push(LoopCtx {
                    scope_depth: self.scopes.len(),
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                });
                self.block(body)?;
                let back = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), &stmt.pos);
                self.patch_jump(back, loop_start);
                let end = self.pc();
                self.patch_jump(exit_jump, end);
                if let Some(ctx) = self.loops.pop() {
                    for j in ctx.break_jumps {
                        self.patch_jump(j, end);
                    }
                    for j in ctx.continue_jumps {
                        self.patch_jump(j, loop_start);
                    }
                }
                Ok(())
            }
            StmtKind::ForRange {
                var,
                start,
                end,
                body,
            } => self.for_range(var, start, end, body, &stmt.pos),
            StmtKind::ForIn { var, iter, body } => self.for_in(var, iter, body, &stmt.pos),
            StmtKind::Break => {
                let ctx_depth = self
                    .loops
                    .last()
                    .map(|l| l.scope_depth)
                    .ok_or_else(|| self.internal(&stmt.pos, "break outside loop"))?;
                self.emit_unwind(ctx_depth, None, &stmt.pos);
                let j = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), &stmt.pos);
                if let Some(ctx) = self.loops.last_mut() {
                    ctx.break_jumps.push(j);
                }
                Ok(())
            }
            StmtKind::Continue => {
                let depth = self
                    .loops
                    .last()
                    .map(|l| l.scope_depth)
                    .ok_or_else(|| self.internal(&stmt.pos, "continue outside loop"))?;
                self.emit_unwind(depth, None, &stmt.pos);
                let j = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), &stmt.pos);
                if let Some(ctx) = self.loops.last_mut() {
                    ctx.continue_jumps.push(j);
                }
                Ok(())
            }
            StmtKind::Return(value) => {
                match value {
                    Some(e) => {
                        let reg = self.expr(e, None)?;
                        let ty = e.type_of();
                        self.emit_function_exit(Some((reg, &ty)), &stmt.pos)?;
                        self.emit(Instruction::abc(Opcode::Return, reg, 1, 0), &stmt.pos);
                        self.release_temp(reg);
                    }
                    None => {
                        self.emit_function_exit(None, &stmt.pos)?;
                        self.emit(Instruction::abc(Opcode::Return, 0, 0, 0), &stmt.pos);
                    }
                }
                Ok(())
            }
            StmtKind::Yield(e) => {
                self.has_yield = true;
                let reg = self.expr(e, None)?;
                self.emit(Instruction::abc(Opcode::Yield, reg, 1, 0), &stmt.pos);
                self.release_temp(reg);
                Ok(())
            }
            StmtKind::Defer(body) => {
                let depth = self.scopes.len() - 1;
                if let Some(scope) = self.scopes.last_mut() {
                    scope.has_defers = true;
                }
                let skip = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), &stmt.pos);
                let body_start = self.pc();
                self.block(body)?;
                self.emit(Instruction::abc(Opcode::DeferEnd, 0, 0, 0), &stmt.pos);
                let after = self.pc();
                self.patch_jump(skip, after);
                // PushDefer's offset reaches back from its own pc to the
                // defer body
                let offset = body_start as i64 - after as i64;
                self.emit(
                    Instruction::asbx(Opcode::PushDefer, depth as u8, offset as i32),
                    &stmt.pos,
                );
                Ok(())
            }
            StmtKind::Comptime(_) => Err(self.internal(&stmt.pos, "comptime survived expansion")),
            StmtKind::Block(b) => self.block(b),
        }
    }

    fn assign(&mut self, target: &Expr, value: &Expr, pos: &Position) -> Result<()> {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some((reg, ty)) = self.lookup_var(name) {
                    if ty.is_ref_counted() {
                        let tmp = self.expr(value, None)?;
                        self.emit(Instruction::abc(Opcode::DecRef, reg, 0, 0), pos);
                        self.emit(Instruction::abc(Opcode::Move, reg, tmp as u16, 0), pos);
                        if !is_fresh(value) {
                            self.emit(Instruction::abc(Opcode::IncRef, reg, 0, 0), pos);
                        }
                        self.release_temp(tmp);
                    } else {
                        self.expr(value, Some(reg))?;
                        if matches!(ty, Type::Weak(_)) && matches!(value.type_of(), Type::Ref(_)) {
                            self.emit(Instruction::abc(Opcode::NewWeak, reg, reg as u16, 0), pos);
                        }
                    }
                    return Ok(());
                }
                if self.is_global(name).is_some() {
                    let tmp = self.expr(value, None)?;
                    let kidx = self.konst(Const::Str(name.clone()));
                    self.emit(Instruction::abx(Opcode::SetGlobal, tmp, kidx), pos);
                    self.release_temp(tmp);
                    return Ok(());
                }
                Err(self.internal(pos, format!("assignment to unresolved name '{}'", name)))
            }
            ExprKind::Deref(refexpr) => {
                let r = self.expr(refexpr, None)?;
                let v = self.expr(value, None)?;
                self.emit(Instruction::abc(Opcode::SetRef, r, v as u16, 0), pos);
                self.release_temp(v);
                self.release_temp(r);
                Ok(())
            }
            ExprKind::Index { base, index } => {
                let b = self.expr(base, None)?;
                let i = self.expr(index, None)?;
                let v = self.expr(value, None)?;
                self.emit(
                    Instruction::abc(Opcode::SetIndexInt, b, i as u16, v as u16),
                    pos,
                );
                self.release_temp(v);
                self.release_temp(i);
                self.release_temp(b);
                Ok(())
            }
            ExprKind::Field { base, name } => {
                let b = self.field_base(base, pos)?;
                let kidx = self.kname(name, pos)?;
                let v = self.expr(value, None)?;
                self.emit(Instruction::abc(Opcode::SetField, b, kidx, v as u16), pos);
                self.release_temp(v);
                self.release_temp(b);
                Ok(())
            }
            _ => Err(self.internal(pos, "invalid assignment target survived analysis")),
        }
    }

    fn for_range(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        body: &Block,
        pos: &Position,
    ) -> Result<()> {
        // idx, limit, step in consecutive registers
        let base = self.regs.alloc_block(3, pos)?;
        let (idx, limit, step) = (base, base + 1, base + 2);
        self.expr(start, Some(idx))?;
        self.expr(end, Some(limit))?;
        let one = self.konst(Const::Int(1));
        self.emit(Instruction::abx(Opcode::LoadK, step, one), pos);

        let prep = self.emit(Instruction::asbx(Opcode::ForPrep, base, 0), pos);
        let body_start = self.pc();

        self.push_scope();
        if let Some(scope) = self.scopes.last_mut() {
            scope.vars.insert(
                var.to_string(),
                VarSlot {
                    register: idx,
                    ty: Type::Int,
                    decl_pc: body_start as u32,
                },
            );
        }
        self.loops.push(LoopCtx {
            scope_depth: self.scopes.len(),
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        // The body gets its own scope so per-iteration locals are
        // cleaned up inside the loop
        self.block(body)?;

        let loop_pc = self.pc();
        self.emit(
            Instruction::asbx(
                Opcode::ForLoop,
                base,
                (body_start as i64 - loop_pc as i64 - 1) as i32,
            ),
            pos,
        );
        self.patch_jump(prep, loop_pc);

        let end_pc = self.pc();
        if let Some(ctx) = self.loops.pop() {
            for j in ctx.break_jumps {
                self.patch_jump(j, end_pc);
            }
            // Continues re-enter at the ForLoop instruction
            for j in ctx.continue_jumps {
                self.patch_jump(j, loop_pc);
            }
        }
        // Remove the loop variable without emitting cleanup for it
        if let Some(scope) = self.scopes.last_mut() {
            scope.vars.remove(var);
        }
        self.pop_scope(pos);
        self.regs.free(step);
        self.regs.free(limit);
        self.regs.free(idx);
        Ok(())
    }

    fn for_in(&mut self, var: &str, iter: &Expr, body: &Block, pos: &Position) -> Result<()> {
        let container = self.expr(iter, None)?;
        let len = self.regs.alloc(pos)?;
        self.emit(Instruction::abc(Opcode::Len, len, container as u16, 0), pos);
        let idx = self.regs.alloc(pos)?;
        let zero = self.konst(Const::Int(0));
        self.emit(Instruction::abx(Opcode::LoadK, idx, zero), pos);

        let loop_start = self.pc();
        let exit = self.emit(
            Instruction::cmp_jmp(Opcode::CmpJmpInt(CmpOp::Ge), idx, len, 0),
            pos,
        );

        self.push_scope();
        let var_reg = self.regs.alloc(pos)?;
        let elem_is_char = matches!(iter.type_of(), Type::Str);
        let get = if elem_is_char {
            Opcode::GetIndex
        } else {
            Opcode::GetIndexInt
        };
        self.emit(
            Instruction::abc(get, var_reg, container as u16, idx as u16),
            pos,
        );
        if let Some(scope) = self.scopes.last_mut() {
            scope.vars.insert(
                var.to_string(),
                VarSlot {
                    register: var_reg,
                    ty: Type::Void,
                    decl_pc: loop_start as u32,
                },
            );
        }
        self.loops.push(LoopCtx {
            scope_depth: self.scopes.len(),
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        self.block(body)?;

        // Increment and loop
        let incr = self.pc();
        self.emit(Instruction::abc(Opcode::AddImm, idx, idx as u16, 1), pos);
        let back = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), pos);
        self.patch_jump(back, loop_start);
        let end_pc = self.pc();
        self.patch_jump(exit, end_pc);

        if let Some(ctx) = self.loops.pop() {
            for j in ctx.break_jumps {
                self.patch_jump(j, end_pc);
            }
            for j in ctx.continue_jumps {
                self.patch_jump(j, incr);
            }
        }
        self.pop_scope(pos);
        self.release_temp(idx);
        self.release_temp(len);
        self.release_temp(container);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Compile an expression; the result lands in `want` when given,
    /// otherwise in a register of the compiler's choosing
    fn expr(&mut self, e: &Expr, want: Option<u8>) -> Result<u8> {
        let pos = &e.pos;
        match &e.kind {
            ExprKind::Int(v) => {
                let dst = self.dst(want, pos)?;
                let k = self.konst(Const::Int(*v));
                self.emit(Instruction::abx(Opcode::LoadK, dst, k), pos);
                Ok(dst)
            }
            ExprKind::Float(v) => {
                let dst = self.dst(want, pos)?;
                let k = self.konst(Const::Float(*v));
                self.emit(Instruction::abx(Opcode::LoadK, dst, k), pos);
                Ok(dst)
            }
            ExprKind::Str(s) => {
                let dst = self.dst(want, pos)?;
                let k = self.konst(Const::Str(s.clone()));
                self.emit(Instruction::abx(Opcode::LoadK, dst, k), pos);
                Ok(dst)
            }
            ExprKind::Char(c) => {
                let dst = self.dst(want, pos)?;
                let k = self.konst(Const::Char(*c));
                self.emit(Instruction::abx(Opcode::LoadK, dst, k), pos);
                Ok(dst)
            }
            ExprKind::Bool(b) => {
                let dst = self.dst(want, pos)?;
                self.emit(
                    Instruction::abc(Opcode::LoadBool, dst, u16::from(*b), 0),
                    pos,
                );
                Ok(dst)
            }
            ExprKind::Nil => {
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::abc(Opcode::LoadNil, dst, 0, 0), pos);
                Ok(dst)
            }
            ExprKind::NoneLit => {
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::abc(Opcode::LoadNone, dst, 0, 0), pos);
                Ok(dst)
            }
            ExprKind::Ident(name) => self.ident(e, name, want, pos),
            ExprKind::Binary { op, lhs, rhs } => self.binary(e, *op, lhs, rhs, want, pos),
            ExprKind::Unary { op, operand } => {
                let src = self.expr(operand, None)?;
                let dst = self.dst(want, pos)?;
                let opcode = match op {
                    UnOp::Neg => Opcode::Unm,
                    UnOp::Not => Opcode::Not,
                };
                self.emit(Instruction::abc(opcode, dst, src as u16, 0), pos);
                self.release_temp(src);
                Ok(dst)
            }
            ExprKind::Call { .. } => self.call(e, want, pos),
            ExprKind::Wrap { kind, value } => {
                let src = self.expr(value, None)?;
                let dst = self.dst(want, pos)?;
                let op = match kind {
                    WrapKind::Some => Opcode::WrapSome,
                    WrapKind::Ok => Opcode::WrapOk,
                    WrapKind::Err => Opcode::WrapErr,
                };
                self.emit(Instruction::abc(op, dst, src as u16, 0), pos);
                self.release_temp(src);
                Ok(dst)
            }
            ExprKind::Index { base, index } => {
                let b = self.expr(base, None)?;
                let (op, c) = match (&index.kind, &base.type_of()) {
                    (ExprKind::Int(i), _) if *i >= 0 && *i <= i8::MAX as i64 => {
                        (Opcode::GetIndexImm, *i as u16)
                    }
                    (_, Type::Str) => {
                        let i = self.expr(index, None)?;
                        (Opcode::GetIndex, i as u16)
                    }
                    _ => {
                        let i = self.expr(index, None)?;
                        (Opcode::GetIndexInt, i as u16)
                    }
                };
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::abc(op, dst, b as u16, c), pos);
                if op != Opcode::GetIndexImm {
                    self.release_temp(c as u8);
                }
                self.release_temp(b);
                Ok(dst)
            }
            ExprKind::Slice { base, lo, hi } => {
                let b = self.expr(base, None)?;
                let bounds = self.regs.alloc_block(2, pos)?;
                match lo {
                    Some(l) => {
                        self.expr(l, Some(bounds))?;
                    }
                    None => {
                        let k = self.konst(Const::Int(0));
                        self.emit(Instruction::abx(Opcode::LoadK, bounds, k), pos);
                    }
                }
                match hi {
                    Some(h) => {
                        self.expr(h, Some(bounds + 1))?;
                    }
                    None => {
                        self.emit(
                            Instruction::abc(Opcode::Len, bounds + 1, b as u16, 0),
                            pos,
                        );
                    }
                }
                let dst = self.dst(want, pos)?;
                self.emit(
                    Instruction::abc(Opcode::Slice, dst, b as u16, bounds as u16),
                    pos,
                );
                self.regs.free(bounds + 1);
                self.regs.free(bounds);
                self.release_temp(b);
                Ok(dst)
            }
            ExprKind::Field { base, name } => {
                // Enum members are compile-time integer constants
                if let (Some(Type::Enum { .. }), Some(range)) = (&e.ty, e.range) {
                    if let Some(v) = range.as_exact() {
                        let dst = self.dst(want, pos)?;
                        let k = self.konst(Const::Int(v));
                        self.emit(Instruction::abx(Opcode::LoadK, dst, k), pos);
                        return Ok(dst);
                    }
                }
                let b = self.field_base(base, pos)?;
                let kidx = self.kname(name, pos)?;
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::abc(Opcode::GetField, dst, b as u16, kidx), pos);
                self.release_temp(b);
                Ok(dst)
            }
            ExprKind::ArrayLit(elems) | ExprKind::TupleLit(elems) => {
                let n = elems.len();
                let dst = self.dst(want, pos)?;
                if n == 0 {
                    self.emit(Instruction::abc(Opcode::NewArray, dst, 0, 0), pos);
                    return Ok(dst);
                }
                let first = self.regs.alloc_block(n, pos)?;
                for (i, el) in elems.iter().enumerate() {
                    self.expr(el, Some(first + i as u8))?;
                }
                self.emit(
                    Instruction::abc(Opcode::NewArray, dst, first as u16, n as u16),
                    pos,
                );
                for i in (0..n).rev() {
                    self.regs.free(first + i as u8);
                }
                Ok(dst)
            }
            ExprKind::ObjectLit { type_name, fields } => {
                let dst = self.dst(want, pos)?;
                let tname = self.kname(type_name, pos)?;
                self.emit(Instruction::abx(Opcode::NewTable, dst, tname as u32), pos);
                for (fname, fexpr) in fields {
                    let v = self.expr(fexpr, None)?;
                    let kidx = self.kname(fname, pos)?;
                    self.emit(Instruction::abc(Opcode::SetField, dst, kidx, v as u16), pos);
                    self.release_temp(v);
                }
                Ok(dst)
            }
            ExprKind::Deref(inner) => {
                let r = self.expr(inner, None)?;
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::abc(Opcode::Deref, dst, r as u16, 0), pos);
                self.release_temp(r);
                Ok(dst)
            }
            ExprKind::New { init, .. } => {
                self.allocates_heap = true;
                let src = match init {
                    Some(init) => self.expr(init, None)?,
                    None => {
                        let r = self.regs.alloc(pos)?;
                        self.emit(Instruction::abc(Opcode::LoadNil, r, 0, 0), pos);
                        r
                    }
                };
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::abc(Opcode::NewRef, dst, src as u16, 0), pos);
                self.release_temp(src);
                Ok(dst)
            }
            ExprKind::Lambda(decl) => {
                // Captures are copied into the closure at creation time
                let mut count = 0u8;
                for cap in &decl.captures {
                    let (reg, _) = self
                        .lookup_var(cap)
                        .ok_or_else(|| self.internal(pos, format!("missing capture '{}'", cap)))?;
                    self.emit(Instruction::abc(Opcode::Arg, reg, reg as u16, 0), pos);
                    count += 1;
                }
                let fidx = self.program.function_index(&decl.name);
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::call(Opcode::NewClosure, dst, fidx, count), pos);
                Ok(dst)
            }
            ExprKind::Match { scrutinee, arms } => self.match_expr(scrutinee, arms, want, pos),
            ExprKind::Spawn { args, .. } => {
                let mangled = e
                    .resolved
                    .as_deref()
                    .ok_or_else(|| self.internal(pos, "unresolved spawn"))?;
                let fidx = self.program.function_index(mangled);
                let argc = self.push_args(args)?;
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::call(Opcode::Spawn, dst, fidx, argc), pos);
                Ok(dst)
            }
            ExprKind::Resume(coro) => {
                let c = self.expr(coro, None)?;
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::abc(Opcode::Resume, dst, c as u16, 0), pos);
                self.release_temp(c);
                Ok(dst)
            }
            ExprKind::Cast { expr, .. } => {
                let src_ty = expr.type_of();
                let src = self.expr(expr, None)?;
                let target = e.type_of();
                let dst = self.dst(want, pos)?;
                if matches!(src_ty, Type::Weak(_)) && matches!(target, Type::Ref(_)) {
                    // Strong promotion; nil when the target has been freed
                    self.emit(
                        Instruction::abc(Opcode::WeakToStrong, dst, src as u16, 0),
                        pos,
                    );
                    self.release_temp(src);
                    return Ok(dst);
                }
                match runtime_cast_tag(&src_ty, &target) {
                    Some(t) => {
                        self.emit(Instruction::abc(Opcode::Cast, dst, src as u16, t), pos);
                    }
                    None => {
                        // Same representation (distinct, enum, union)
                        self.emit(Instruction::abc(Opcode::Move, dst, src as u16, 0), pos);
                    }
                }
                self.release_temp(src);
                Ok(dst)
            }
            ExprKind::Propagate(inner) => {
                let src = self.expr(inner, None)?;
                // err: unwind and return the error value as-is
                self.emit(Instruction::abc(Opcode::TestTag, src, tag::ERR, 0), pos);
                let not_err = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), pos);
                let ty = inner.type_of();
                self.emit_function_exit(Some((src, &ty)), pos)?;
                self.emit(Instruction::abc(Opcode::Return, src, 1, 0), pos);
                let cont = self.pc();
                self.patch_jump(not_err, cont);
                let dst = self.dst(want, pos)?;
                let unwrap = if matches!(inner.type_of(), Type::Option(_)) {
                    Opcode::UnwrapOption
                } else {
                    Opcode::UnwrapResult
                };
                self.emit(Instruction::abc(unwrap, dst, src as u16, 0), pos);
                self.release_temp(src);
                Ok(dst)
            }
            ExprKind::Len(inner) => {
                let src = self.expr(inner, None)?;
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::abc(Opcode::Len, dst, src as u16, 0), pos);
                self.release_temp(src);
                Ok(dst)
            }
            ExprKind::Comptime(_) => Err(self.internal(pos, "comptime survived expansion")),
        }
    }

    fn dst(&mut self, want: Option<u8>, pos: &Position) -> Result<u8> {
        match want {
            Some(r) => Ok(r),
            None => {
                let r = self.regs.alloc(pos)?;
                self.track_temp(r);
                Ok(r)
            }
        }
    }

    fn ident(&mut self, e: &Expr, name: &str, want: Option<u8>, pos: &Position) -> Result<u8> {
        if let Some((reg, _)) = self.lookup_var(name) {
            return match want {
                Some(dst) if dst != reg => {
                    self.emit(Instruction::abc(Opcode::Move, dst, reg as u16, 0), pos);
                    Ok(dst)
                }
                _ => Ok(reg),
            };
        }
        if self.is_global(name).is_some() {
            let kidx = self.konst(Const::Str(name.to_string()));
            let dst = self.dst(want, pos)?;
            self.emit(Instruction::abx(Opcode::GetGlobal, dst, kidx), pos);
            return Ok(dst);
        }
        // First-class function value
        if let Some(mangled) = &e.resolved {
            let fidx = self.program.function_index(mangled);
            let dst = self.dst(want, pos)?;
            self.emit(Instruction::call(Opcode::NewClosure, dst, fidx, 0), pos);
            return Ok(dst);
        }
        Err(self.internal(pos, format!("unresolved name '{}' survived analysis", name)))
    }

    fn binary(
        &mut self,
        e: &Expr,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        want: Option<u8>,
        pos: &Position,
    ) -> Result<u8> {
        if matches!(op, BinOp::And | BinOp::Or) {
            // Short-circuit evaluation
            let dst = self.dst(want, pos)?;
            self.expr(lhs, Some(dst))?;
            let c = if op == BinOp::And { 0 } else { 1 };
            self.emit(Instruction::abc(Opcode::Test, dst, 0, c), pos);
            let to_rhs = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), pos);
            let to_end = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), pos);
            let rhs_start = self.pc();
            self.patch_jump(to_rhs, rhs_start);
            self.expr(rhs, Some(dst))?;
            let end = self.pc();
            self.patch_jump(to_end, end);
            return Ok(dst);
        }

        if matches!(op, BinOp::In | BinOp::NotIn) {
            let l = self.expr(lhs, None)?;
            let r = self.expr(rhs, None)?;
            let dst = self.dst(want, pos)?;
            let opcode = if op == BinOp::In { Opcode::In } else { Opcode::NotIn };
            self.emit(Instruction::abc(opcode, dst, l as u16, r as u16), pos);
            self.release_temp(r);
            self.release_temp(l);
            return Ok(dst);
        }

        let lt = lhs.type_of();
        let rt = rhs.type_of();
        let spec = specialization(&lt, &rt);

        if let Some(cmp) = cmp_of(op) {
            let l = self.expr(lhs, None)?;
            let r = self.expr(rhs, None)?;
            let dst = self.dst(want, pos)?;
            let opcode = match spec {
                Spec::Int => Opcode::CmpInt(cmp),
                Spec::Float => Opcode::CmpFloat(cmp),
                Spec::Generic => Opcode::Cmp(cmp),
            };
            self.emit(Instruction::abc(opcode, dst, l as u16, r as u16), pos);
            self.release_temp(r);
            self.release_temp(l);
            return Ok(dst);
        }

        // Array concatenation keeps its own opcode
        if op == BinOp::Add && matches!(e.type_of(), Type::Array(_)) {
            let l = self.expr(lhs, None)?;
            let r = self.expr(rhs, None)?;
            let dst = self.dst(want, pos)?;
            self.emit(
                Instruction::abc(Opcode::ConcatArray, dst, l as u16, r as u16),
                pos,
            );
            self.release_temp(r);
            self.release_temp(l);
            return Ok(dst);
        }

        let l = self.expr(lhs, None)?;
        let r = self.expr(rhs, None)?;
        let dst = self.dst(want, pos)?;
        let opcode = match (op, spec) {
            (BinOp::Add, Spec::Int) => Opcode::AddInt,
            (BinOp::Sub, Spec::Int) => Opcode::SubInt,
            (BinOp::Mul, Spec::Int) => Opcode::MulInt,
            (BinOp::Div, Spec::Int) => Opcode::DivInt,
            (BinOp::Mod, Spec::Int) => Opcode::ModInt,
            (BinOp::Add, Spec::Float) => Opcode::AddFloat,
            (BinOp::Sub, Spec::Float) => Opcode::SubFloat,
            (BinOp::Mul, Spec::Float) => Opcode::MulFloat,
            (BinOp::Div, Spec::Float) => Opcode::DivFloat,
            (BinOp::Mod, Spec::Float) => Opcode::ModFloat,
            (BinOp::Add, _) => Opcode::Add,
            (BinOp::Sub, _) => Opcode::Sub,
            (BinOp::Mul, _) => Opcode::Mul,
            (BinOp::Div, _) => Opcode::Div,
            (BinOp::Mod, _) => Opcode::Mod,
            (BinOp::Pow, _) => Opcode::Pow,
            _ => return Err(self.internal(pos, "unexpected operator")),
        };
        self.emit(Instruction::abc(opcode, dst, l as u16, r as u16), pos);
        self.release_temp(r);
        self.release_temp(l);
        Ok(dst)
    }

    fn field_base(&mut self, base: &Expr, pos: &Position) -> Result<u8> {
        let reg = self.expr(base, None)?;
        if matches!(base.type_of(), Type::Ref(_)) {
            let deref = self.dst(None, pos)?;
            self.emit(Instruction::abc(Opcode::Deref, deref, reg as u16, 0), pos);
            self.release_temp(reg);
            return Ok(deref);
        }
        Ok(reg)
    }

    fn push_args(&mut self, args: &[Expr]) -> Result<u8> {
        for arg in args {
            match &arg.kind {
                // Small integer immediates skip a register entirely
                ExprKind::Int(v) if *v >= i32::MIN as i64 && *v <= i32::MAX as i64 => {
                    self.emit(Instruction::asbx(Opcode::ArgImm, 0, *v as i32), &arg.pos);
                }
                _ => {
                    let r = self.expr(arg, None)?;
                    self.emit(Instruction::abc(Opcode::Arg, r, r as u16, 0), &arg.pos);
                    self.release_temp(r);
                }
            }
        }
        u8::try_from(args.len()).map_err(|_| {
            self.internal(
                &args.first().map(|a| a.pos.clone()).unwrap_or_default(),
                "too many call arguments",
            )
        })
    }

    fn call(&mut self, e: &Expr, want: Option<u8>, pos: &Position) -> Result<u8> {
        let (callee, args) = match &e.kind {
            ExprKind::Call { callee, args } => (callee, args),
            _ => return Err(self.internal(pos, "call on non-call")),
        };
        if let Some(resolved) = &e.resolved {
            if let Some(name) = resolved.strip_prefix("@builtin:") {
                let id = builtins::id_for(name)
                    .ok_or_else(|| self.internal(pos, "unknown builtin id"))?;
                let argc = self.push_args(args)?;
                let dst = self.dst(want, pos)?;
                self.emit(
                    Instruction::call(Opcode::CallBuiltin, dst, id as u32, argc),
                    pos,
                );
                return Ok(dst);
            }
            if let Some(name) = resolved.strip_prefix("@ffi:") {
                let fidx = self.program.function_index(name);
                let argc = self.push_args(args)?;
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::call(Opcode::CallFfi, dst, fidx, argc), pos);
                return Ok(dst);
            }
            if let Some(name) = resolved.strip_prefix("@host:") {
                let fidx = self.program.function_index(name);
                let argc = self.push_args(args)?;
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::call(Opcode::CallHost, dst, fidx, argc), pos);
                return Ok(dst);
            }
            // Direct native call; lambdas resolve here too but are
            // values, not direct callees
            if !matches!(callee.kind, ExprKind::Lambda(_)) {
                let fidx = self.program.function_index(resolved);
                let argc = self.push_args(args)?;
                let dst = self.dst(want, pos)?;
                self.emit(Instruction::call(Opcode::Call, dst, fidx, argc), pos);
                return Ok(dst);
            }
        }
        // Indirect call through a closure value
        let creg = self.expr(callee, None)?;
        let argc = self.push_args(args)?;
        let dst = self.dst(want, pos)?;
        self.emit(
            Instruction::call(Opcode::CallClosure, dst, creg as u32, argc),
            pos,
        );
        self.release_temp(creg);
        Ok(dst)
    }

    fn match_expr(
        &mut self,
        scrutinee: &Expr,
        arms: &[crate::ast::MatchArm],
        want: Option<u8>,
        pos: &Position,
    ) -> Result<u8> {
        let s = self.expr(scrutinee, None)?;
        let dst = self.dst(want, pos)?;
        let mut end_jumps = Vec::new();

        for arm in arms {
            let (check, binding, unwrap_err) = match &arm.pattern {
                MatchPattern::Some(n) => (Some(tag::SOME), Some(n), false),
                MatchPattern::None => (Some(tag::NONE), None, false),
                MatchPattern::Ok(n) => (Some(tag::OK), Some(n), false),
                MatchPattern::Err(n) => (Some(tag::ERR), Some(n), true),
                MatchPattern::Wildcard => (None, None, false),
            };
            let skip = match check {
                Some(t) => {
                    self.emit(Instruction::abc(Opcode::TestTag, s, t, 0), &arm.pos);
                    Some(self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), &arm.pos))
                }
                None => None,
            };

            self.push_scope();
            if let Some(name) = binding {
                if name != "_" {
                    let breg = self.regs.alloc(&arm.pos)?;
                    let unwrap = match (&arm.pattern, unwrap_err) {
                        (MatchPattern::Some(_), _) => Opcode::UnwrapOption,
                        (_, true) => Opcode::UnwrapResult,
                        _ => Opcode::UnwrapResult,
                    };
                    let c = u16::from(unwrap_err);
                    self.emit(Instruction::abc(unwrap, breg, s as u16, c), &arm.pos);
                    if let Some(scope) = self.scopes.last_mut() {
                        scope.vars.insert(
                            name.clone(),
                            VarSlot {
                                register: breg,
                                ty: Type::Void,
                                decl_pc: self.program.instructions.len() as u32,
                            },
                        );
                    }
                }
            }
            // Arm value is the trailing expression when present
            let (init_stmts, tail) = split_tail_expr(&arm.body);
            for stmt in init_stmts {
                self.stmt(stmt)?;
            }
            match tail {
                Some(expr) => {
                    self.expr(expr, Some(dst))?;
                }
                None => {
                    self.emit(Instruction::abc(Opcode::LoadNil, dst, 0, 0), &arm.pos);
                }
            }
            self.pop_scope(&arm.pos);

            let endj = self.emit(Instruction::asbx(Opcode::Jmp, 0, 0), &arm.pos);
            end_jumps.push(endj);
            if let Some(skip) = skip {
                let next = self.pc();
                self.patch_jump(skip, next);
            }
        }
        // No arm matched: leave nil in dst
        self.emit(Instruction::abc(Opcode::LoadNil, dst, 0, 0), pos);
        let end = self.pc();
        for j in end_jumps {
            self.patch_jump(j, end);
        }
        self.release_temp(s);
        Ok(dst)
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn cmp_of(op: BinOp) -> Option<CmpOp> {
    match op {
        BinOp::Eq => Some(CmpOp::Eq),
        BinOp::Ne => Some(CmpOp::Ne),
        BinOp::Lt => Some(CmpOp::Lt),
        BinOp::Le => Some(CmpOp::Le),
        BinOp::Gt => Some(CmpOp::Gt),
        BinOp::Ge => Some(CmpOp::Ge),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Spec {
    Int,
    Float,
    Generic,
}

/// Pick a type-specialized opcode family when the analyzer proved both
/// operand types
fn specialization(lt: &Type, rt: &Type) -> Spec {
    match (lt, rt) {
        (Type::Int, Type::Int) => Spec::Int,
        (Type::Float, Type::Float) => Spec::Float,
        _ => Spec::Generic,
    }
}

/// Whether an expression produces a value that already owns its
/// reference (so assignment elides the IncRef)
fn is_fresh(e: &Expr) -> bool {
    match &e.kind {
        ExprKind::New { .. } | ExprKind::Spawn { .. } => true,
        // A call returning a ref transfers ownership to the caller
        ExprKind::Call { .. } => true,
        ExprKind::Match { .. } => true,
        // Literal aggregates own their elements' counts already
        ExprKind::ArrayLit(_) | ExprKind::TupleLit(_) => true,
        // Weak-to-strong promotion bumps the count itself
        ExprKind::Cast { expr, .. } => matches!(expr.ty, Some(Type::Weak(_))),
        _ => false,
    }
}

/// The runtime cast tag, or None when the cast is representation-free
fn runtime_cast_tag(src: &Type, target: &Type) -> Option<u16> {
    let t = match target {
        Type::Int => cast::INT,
        Type::Float => cast::FLOAT,
        Type::Bool => cast::BOOL,
        Type::Char => cast::CHAR,
        Type::Str => cast::STR,
        _ => return None,
    };
    // Same scalar type needs no conversion
    if src == target {
        return None;
    }
    match src {
        Type::Int | Type::Float | Type::Bool | Type::Char | Type::Str => Some(t),
        // Enum/distinct sources share the base representation
        _ => None,
    }
}

/// Split a block into leading statements and a trailing expression
fn split_tail_expr(block: &Block) -> (&[Stmt], Option<&Expr>) {
    match block.stmts.split_last() {
        Some((last, init)) => match &last.kind {
            StmtKind::Expr(e) => (init, Some(e)),
            _ => (&block.stmts, None),
        },
        None => (&[], None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use crate::parser::parse_module;

    fn compile(source: &str) -> CodegenOutput {
        let mut module = parse_module(source, "test.etch").unwrap();
        let analysis = analyze(&mut module, Vec::new(), &[]).unwrap();
        generate(&module, &analysis, [0u8; 32]).unwrap()
    }

    fn ops_of(out: &CodegenOutput, name: &str) -> Vec<Opcode> {
        let rec = out.program.functions.get(name).unwrap();
        out.program.instructions[rec.start_pc as usize..rec.end_pc as usize]
            .iter()
            .map(|i| i.op)
            .collect()
    }

    #[test]
    fn test_simple_function_emits_specialized_arith() {
        let out = compile("fn add(a: int, b: int) -> int { return a + b }\nfn main() { print(add(1, 2)) }");
        let ops = ops_of(&out, "add");
        assert!(ops.contains(&Opcode::AddInt), "ops: {:?}", ops);
        assert!(ops.contains(&Opcode::Return));
    }

    #[test]
    fn test_function_records_have_ranges() {
        let out = compile("fn main() { print(1) }");
        let rec = out.program.functions.get("main").unwrap();
        assert!(rec.end_pc > rec.start_pc);
        let init = out.program.functions.get(INIT_FUNCTION).unwrap();
        assert!(init.end_pc >= init.start_pc);
    }

    #[test]
    fn test_call_uses_arg_queue() {
        let out = compile("fn f(a: int) { print(a) }\nfn main() { f(300) }");
        let ops = ops_of(&out, "main");
        // 300 exceeds nothing; immediates ride ArgImm
        assert!(ops.contains(&Opcode::ArgImm), "ops: {:?}", ops);
        assert!(ops.contains(&Opcode::Call));
    }

    #[test]
    fn test_if_emits_fused_compare_jump() {
        let out = compile("fn main() { let x = rand(10, 0) if x > 5 { print(1) } }");
        let ops = ops_of(&out, "main");
        assert!(
            ops.iter().any(|o| matches!(o, Opcode::CmpJmpInt(_))),
            "ops: {:?}",
            ops
        );
    }

    #[test]
    fn test_dead_branch_not_emitted() {
        let out = compile(
            "fn main() { let x = rand(100, 50) if x > 200 { print(10 / 0) } print(2) }",
        );
        let ops = ops_of(&out, "main");
        // The dead branch's division never reaches the stream
        assert!(!ops.contains(&Opcode::DivInt), "ops: {:?}", ops);
    }

    #[test]
    fn test_for_range_emits_forprep_forloop() {
        let out = compile("fn main() { for i in 0..3 { print(i) } }");
        let ops = ops_of(&out, "main");
        assert!(ops.contains(&Opcode::ForPrep));
        assert!(ops.contains(&Opcode::ForLoop));
    }

    #[test]
    fn test_defer_emits_push_exec() {
        let out = compile("fn main() { defer { print(1) } print(2) }");
        let ops = ops_of(&out, "main");
        assert!(ops.contains(&Opcode::PushDefer), "ops: {:?}", ops);
        assert!(ops.contains(&Opcode::ExecDefers));
        assert!(ops.contains(&Opcode::DeferEnd));
    }

    #[test]
    fn test_ref_locals_get_decref_on_exit() {
        let out = compile("fn main() { let r = new int(5) if r != nil { print(@r) } }");
        let ops = ops_of(&out, "main");
        assert!(ops.contains(&Opcode::NewRef));
        assert!(ops.contains(&Opcode::DecRef));
        assert!(ops.contains(&Opcode::CheckCycles));
    }

    #[test]
    fn test_spawn_resume_yield() {
        let out = compile(
            "fn gen() -> coroutine[int] { yield 1 }\n\
             fn main() { let c = spawn gen() match resume(c) { ok(v) => print(v), err(_) => print(-1) } }",
        );
        let main_ops = ops_of(&out, "main");
        assert!(main_ops.contains(&Opcode::Spawn));
        assert!(main_ops.contains(&Opcode::Resume));
        assert!(main_ops.contains(&Opcode::TestTag));
        let gen_ops = ops_of(&out, "gen");
        assert!(gen_ops.contains(&Opcode::Yield));
        assert!(out.meta.get("gen").unwrap().has_yield);
    }

    #[test]
    fn test_globals_emitted_in_init() {
        let out = compile("var counter = 10\nfn main() { counter = counter + 1 print(counter) }");
        let init_ops = ops_of(&out, INIT_FUNCTION);
        assert!(init_ops.contains(&Opcode::InitGlobal));
        let main_ops = ops_of(&out, "main");
        assert!(main_ops.contains(&Opcode::GetGlobal));
        assert!(main_ops.contains(&Opcode::SetGlobal));
    }

    #[test]
    fn test_lambda_becomes_closure() {
        let out = compile(
            "fn main() { let base = 2 let f = fn(x: int) -> int { return x * base } print(f(3)) }",
        );
        let ops = ops_of(&out, "main");
        assert!(ops.contains(&Opcode::NewClosure), "ops: {:?}", ops);
        assert!(ops.contains(&Opcode::CallClosure));
        assert!(out.program.functions.contains_key("main@lambda1"));
    }

    #[test]
    fn test_jump_targets_inside_function() {
        let out = compile("fn main() { var i = 0 while i < 10 { i = i + 1 } print(i) }");
        let rec = out.program.functions.get("main").unwrap();
        let range = rec.start_pc as i64..=rec.end_pc as i64;
        for (pc, instr) in out.program.instructions
            [rec.start_pc as usize..rec.end_pc as usize]
            .iter()
            .enumerate()
        {
            let pc = pc as i64 + rec.start_pc as i64;
            let target = match instr.operands {
                Operands::Asbx { sbx, .. } if instr.op.is_sbx_jump() => Some(pc + 1 + sbx as i64),
                Operands::Ax { .. } if instr.op.is_cmp_jmp() => {
                    let (_, _, off) = instr.unpack_cmp();
                    Some(pc + 1 + off as i64)
                }
                _ => None,
            };
            if let Some(t) = target {
                assert!(range.contains(&t), "jump at {} targets {}", pc, t);
            }
        }
    }
}
