//! The Etch virtual machine
//!
//! Register-file interpreter over the compiled `Program`. Single
//! threaded: one frame executes at a time, coroutines are explicit
//! state machines resumed re-entrantly, and the only suspension point
//! is `Yield`.
//!
//! Type-specialized and fused opcodes skip tag checks entirely - the
//! compiler only emits them when it proved the operand types. Generic
//! opcodes check tags and promote int to float where either side is a
//! float. Division and modulo by integer zero still trap here even
//! though the prover rejects any program where that could happen.

use crate::builtins;
use crate::coroutine::{CoroState, Coroutine, DeferEntry};
use crate::error::RuntimeError;
use crate::ffi::FfiBridge;
use crate::heap::{collect_children, Heap, PendingDestructor};
use crate::value::{CoroId, Table, Value};
use etch_core::instruction::{cast, tag, CmpOp, FusedOp, Opcode, Operands};
use etch_core::{Const, FunctionKind, FunctionRecord, Program};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;
use tracing::debug;

/// Recursion guard for native calls and nested resumes
const MAX_CALL_DEPTH: u32 = 256;

/// Per-activation defer stack bound
const MAX_DEFERS: usize = 256;

/// Sentinel defer-resume pc used by coroutine cleanup
const CLEANUP_RESUME: usize = usize::MAX;

pub type HostFn = Box<dyn FnMut(&[Value]) -> Value>;

pub struct VmOptions {
    pub gc_cycle_interval: u32,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            gc_cycle_interval: 1024,
        }
    }
}

struct Frame {
    regs: Vec<Value>,
    pc: usize,
    end_pc: usize,
    defers: Vec<DeferEntry>,
    defer_resume: usize,
    defer_min: u8,
}

enum Outcome {
    Returned(Value),
    Yielded(Value),
}

pub struct Vm {
    pub program: Program,
    /// func index -> record, parallel to the program's function table
    funcs: Vec<FunctionRecord>,
    pub globals: HashMap<String, Value>,
    pub heap: Heap,
    pub coroutines: Vec<Coroutine>,
    call_args: Vec<Value>,
    ffi: FfiBridge,
    host: HashMap<String, HostFn>,
    /// Print target; embedders may capture it
    pub out: Box<dyn Write>,
    depth: u32,
}

impl Vm {
    pub fn new(program: Program, options: VmOptions) -> Self {
        let funcs = program
            .function_table
            .iter()
            .map(|name| {
                program
                    .functions
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| FunctionRecord::native(0, 0))
            })
            .collect();
        Vm {
            funcs,
            program,
            globals: HashMap::new(),
            heap: Heap::new(options.gc_cycle_interval),
            coroutines: Vec::new(),
            call_args: Vec::new(),
            ffi: FfiBridge::new(),
            host: HashMap::new(),
            out: Box::new(std::io::stdout()),
            depth: 0,
        }
    }

    pub fn register_host(&mut self, name: impl Into<String>, callback: HostFn) {
        self.host.insert(name.into(), callback);
    }

    /// Run the module initializer and `main`; the exit code is main's
    /// integer return value when there is one
    pub fn execute(&mut self) -> Result<i64, RuntimeError> {
        if self.program.functions.contains_key(crate::INIT_FUNCTION) {
            let idx = self.function_index(crate::INIT_FUNCTION)?;
            self.call_function(idx, Vec::new())?;
        }
        let main = self.function_index("main")?;
        let result = self.call_function(main, Vec::new())?;
        Ok(result.as_int().unwrap_or(0))
    }

    pub fn call_by_name(&mut self, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let idx = self.function_index(name)?;
        self.call_function(idx, args)
    }

    fn function_index(&self, name: &str) -> Result<u32, RuntimeError> {
        self.program
            .function_table
            .iter()
            .position(|n| n == name)
            .map(|i| i as u32)
            .ok_or_else(|| RuntimeError::msg(format!("unknown function '{}'", name)))
    }

    fn record(&self, func: u32) -> Result<&FunctionRecord, RuntimeError> {
        self.funcs
            .get(func as usize)
            .ok_or_else(|| RuntimeError::msg(format!("bad function index {}", func)))
    }

    /// Dispatch a call by function kind
    fn call_function(&mut self, func: u32, args: Vec<Value>) -> Result<Value, RuntimeError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(RuntimeError::msg("call depth limit exceeded"));
        }
        let record = self.record(func)?.clone();
        match record.kind {
            FunctionKind::Native => {
                let mut frame = self.new_frame(&record, args);
                self.depth += 1;
                let outcome = self.run_frame(&mut frame, None);
                self.depth -= 1;
                match outcome? {
                    Outcome::Returned(v) => Ok(v),
                    Outcome::Yielded(_) => Err(RuntimeError::msg(
                        "yield outside of a coroutine resume",
                    )),
                }
            }
            FunctionKind::Builtin => {
                let id = record.builtin_id.unwrap_or(u16::MAX);
                builtins::dispatch(id, &args, self.out.as_mut())
            }
            FunctionKind::Ffi => self.ffi.call(&record, &args),
            FunctionKind::Host => {
                let name = self.program.function_table[func as usize].clone();
                let callback = self
                    .host
                    .get_mut(&name)
                    .ok_or_else(|| RuntimeError::msg(format!("host function '{}' not registered", name)))?;
                Ok(callback(&args))
            }
        }
    }

    fn new_frame(&self, record: &FunctionRecord, args: Vec<Value>) -> Frame {
        let mut regs = vec![Value::Nil; record.max_register as usize + 1];
        for (i, arg) in args.into_iter().enumerate() {
            if i < regs.len() {
                regs[i] = arg;
            }
        }
        Frame {
            regs,
            pc: record.start_pc as usize,
            end_pc: record.end_pc as usize,
            defers: Vec::new(),
            defer_resume: 0,
            defer_min: 0,
        }
    }

    fn trap(&self, pc: usize, message: impl Into<String>) -> RuntimeError {
        RuntimeError::msg(message).with_pos(self.program.position_at(pc))
    }

    // ------------------------------------------------------------------
    // Reference counting over values
    // ------------------------------------------------------------------

    fn inc_value(&mut self, v: &Value) {
        match v {
            Value::Ref(id) => self.heap.inc(*id),
            Value::Coroutine(id) => {
                if let Some(c) = self.coroutines.get_mut(*id as usize) {
                    c.rc += 1;
                }
            }
            // Aggregates cascade into their ref elements
            Value::Array(items) => {
                let items = items.borrow().clone();
                for item in &items {
                    self.inc_value(item);
                }
            }
            _ => {}
        }
    }

    fn dec_value(&mut self, v: &Value) -> Result<(), RuntimeError> {
        let mut destructors: Vec<PendingDestructor> = Vec::new();
        let mut cleanups: Vec<CoroId> = Vec::new();
        match v {
            Value::Ref(id) => destructors.extend(self.heap.dec(*id)),
            Value::Coroutine(id) => {
                if let Some(c) = self.coroutines.get_mut(*id as usize) {
                    c.rc = c.rc.saturating_sub(1);
                    if c.rc == 0 && c.resumable() {
                        cleanups.push(*id);
                    }
                }
            }
            Value::Array(items) => {
                let items = items.borrow().clone();
                for item in &items {
                    self.dec_value(item)?;
                }
            }
            _ => {}
        }
        for pending in destructors {
            self.run_destructor(pending)?;
        }
        for id in cleanups {
            self.cleanup_coroutine(id);
        }
        Ok(())
    }

    fn run_destructor(&mut self, pending: PendingDestructor) -> Result<(), RuntimeError> {
        debug!(func = pending.func, "running destructor");
        self.call_function(pending.func, vec![pending.value])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Coroutines
    // ------------------------------------------------------------------

    fn spawn(&mut self, func: u32, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let record = self.record(func)?;
        let mut registers = vec![Value::Nil; record.max_register as usize + 1];
        for (i, arg) in args.into_iter().enumerate() {
            if i < registers.len() {
                registers[i] = arg;
            }
        }
        let id = self.coroutines.len() as CoroId;
        self.coroutines.push(Coroutine::new(func, registers));
        Ok(Value::Coroutine(id))
    }

    /// Resume a coroutine, producing the `result[T]` the script sees
    fn resume_coroutine(&mut self, id: CoroId) -> Result<Value, RuntimeError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(RuntimeError::msg("resume depth limit exceeded"));
        }
        let Some(state) = self.coroutines.get(id as usize).map(|c| c.state) else {
            return Ok(Value::error("resume of unknown coroutine"));
        };
        if !matches!(state, CoroState::Ready | CoroState::Suspended) {
            let reason = match state {
                CoroState::Completed => "coroutine already completed",
                CoroState::Running => "coroutine is already running",
                _ => "coroutine is not resumable",
            };
            return Ok(Value::error(reason));
        }
        let func = self.coroutines[id as usize].func;
        let record = self.record(func)?.clone();
        let first_entry = state == CoroState::Ready;
        let coro = &mut self.coroutines[id as usize];
        let mut frame = Frame {
            regs: std::mem::take(&mut coro.registers),
            pc: if first_entry {
                record.start_pc as usize
            } else {
                coro.resume_pc
            },
            end_pc: record.end_pc as usize,
            defers: std::mem::take(&mut coro.defer_stack),
            defer_resume: 0,
            defer_min: 0,
        };
        coro.state = CoroState::Running;

        self.depth += 1;
        let outcome = self.run_frame(&mut frame, Some(id));
        self.depth -= 1;

        let coro = &mut self.coroutines[id as usize];
        match outcome {
            Ok(Outcome::Yielded(value)) => {
                // The frame already saved itself through `suspend`
                Ok(Value::Ok(Box::new(value)))
            }
            Ok(Outcome::Returned(value)) => {
                coro.complete(value.clone());
                if value.is_nil() {
                    Ok(Value::error("coroutine completed"))
                } else {
                    Ok(Value::Ok(Box::new(value)))
                }
            }
            Err(e) => {
                coro.state = CoroState::Dead;
                Err(e)
            }
        }
    }

    /// Final CLEANUP resume for an unreferenced coroutine: run its
    /// pending defers, then mark it DEAD. Best effort - errors inside
    /// defers are logged, not propagated.
    fn cleanup_coroutine(&mut self, id: CoroId) {
        let Some(coro) = self.coroutines.get_mut(id as usize) else {
            return;
        };
        if coro.defer_stack.is_empty() {
            coro.state = CoroState::Dead;
            return;
        }
        coro.state = CoroState::Cleanup;
        let func = coro.func;
        let Ok(record) = self.record(func).cloned() else {
            return;
        };
        let mut defers = std::mem::take(&mut self.coroutines[id as usize].defer_stack);
        let first = defers.pop().unwrap_or(DeferEntry { pc: 0, depth: 0 });
        let mut frame = Frame {
            regs: std::mem::take(&mut self.coroutines[id as usize].registers),
            pc: first.pc,
            end_pc: record.end_pc as usize,
            defers,
            defer_resume: CLEANUP_RESUME,
            defer_min: 0,
        };
        self.depth += 1;
        let result = self.run_frame(&mut frame, Some(id));
        self.depth -= 1;
        if let Err(e) = result {
            debug!(error = %e, "error in coroutine cleanup defers");
        }
        self.coroutines[id as usize].state = CoroState::Dead;
    }

    // ------------------------------------------------------------------
    // Interpreter loop
    // ------------------------------------------------------------------

    fn run_frame(&mut self, frame: &mut Frame, coro: Option<CoroId>) -> Result<Outcome, RuntimeError> {
        loop {
            if frame.pc >= frame.end_pc {
                return Ok(Outcome::Returned(Value::Nil));
            }
            let pc = frame.pc;
            let instr = self.program.instructions[pc];
            frame.pc += 1;
            let (a, b, c) = match instr.operands {
                Operands::Abc { a, b, c } => (a, b, c),
                _ => (0, 0, 0),
            };

            match instr.op {
                Opcode::NoOp => {}

                // Constants and moves
                Opcode::LoadK => {
                    if let Operands::Abx { a, bx } = instr.operands {
                        let value = self
                            .program
                            .constants
                            .get(bx as usize)
                            .map(Value::from_const)
                            .unwrap_or(Value::Nil);
                        frame.regs[a as usize] = value;
                    }
                }
                Opcode::LoadBool => frame.regs[a as usize] = Value::Bool(b != 0),
                Opcode::LoadNil => frame.regs[a as usize] = Value::Nil,
                Opcode::LoadNone => frame.regs[a as usize] = Value::None,
                Opcode::Move => frame.regs[a as usize] = frame.regs[b as usize].clone(),

                // Arithmetic
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    let lhs = &frame.regs[b as usize];
                    let rhs = &frame.regs[c as usize];
                    let value = self.arith(instr.op, lhs, rhs).map_err(|e| {
                        e.with_pos(self.program.position_at(pc))
                    })?;
                    frame.regs[a as usize] = value;
                }
                Opcode::AddInt => int_op(frame, pc, self, a, b, c, i64::checked_add)?,
                Opcode::SubInt => int_op(frame, pc, self, a, b, c, i64::checked_sub)?,
                Opcode::MulInt => int_op(frame, pc, self, a, b, c, i64::checked_mul)?,
                Opcode::DivInt => {
                    let (x, y) = int_pair(frame, b, c);
                    if y == 0 {
                        return Err(self.trap(pc, "division by zero"));
                    }
                    let v = x
                        .checked_div(y)
                        .ok_or_else(|| self.trap(pc, "integer overflow in division"))?;
                    frame.regs[a as usize] = Value::Int(v);
                }
                Opcode::ModInt => {
                    let (x, y) = int_pair(frame, b, c);
                    if y == 0 {
                        return Err(self.trap(pc, "modulo by zero"));
                    }
                    frame.regs[a as usize] = Value::Int(x.wrapping_rem(y));
                }
                Opcode::AddFloat => float_op(frame, a, b, c, |x, y| x + y),
                Opcode::SubFloat => float_op(frame, a, b, c, |x, y| x - y),
                Opcode::MulFloat => float_op(frame, a, b, c, |x, y| x * y),
                Opcode::DivFloat => float_op(frame, a, b, c, |x, y| x / y),
                Opcode::ModFloat => float_op(frame, a, b, c, |x, y| x % y),
                Opcode::AddImm | Opcode::SubImm | Opcode::MulImm | Opcode::DivImm
                | Opcode::ModImm => {
                    let x = frame.regs[b as usize].as_int().unwrap_or(0);
                    let imm = instr.imm8() as i64;
                    let v = match instr.op {
                        Opcode::AddImm => x.checked_add(imm),
                        Opcode::SubImm => x.checked_sub(imm),
                        Opcode::MulImm => x.checked_mul(imm),
                        Opcode::DivImm => {
                            if imm == 0 {
                                return Err(self.trap(pc, "division by zero"));
                            }
                            x.checked_div(imm)
                        }
                        _ => {
                            if imm == 0 {
                                return Err(self.trap(pc, "modulo by zero"));
                            }
                            Some(x.wrapping_rem(imm))
                        }
                    }
                    .ok_or_else(|| self.trap(pc, "integer overflow"))?;
                    frame.regs[a as usize] = Value::Int(v);
                }
                Opcode::Pow => {
                    let lhs = &frame.regs[b as usize];
                    let rhs = &frame.regs[c as usize];
                    let value = match (lhs, rhs) {
                        (Value::Int(x), Value::Int(y)) => {
                            if *y < 0 {
                                Value::Float((*x as f64).powf(*y as f64))
                            } else {
                                let v = x
                                    .checked_pow((*y).min(u32::MAX as i64) as u32)
                                    .ok_or_else(|| self.trap(pc, "integer overflow in power"))?;
                                Value::Int(v)
                            }
                        }
                        _ => {
                            let x = lhs.as_float().ok_or_else(|| {
                                self.trap(pc, format!("cannot exponentiate {}", lhs.type_name()))
                            })?;
                            let y = rhs.as_float().ok_or_else(|| {
                                self.trap(pc, format!("cannot exponentiate by {}", rhs.type_name()))
                            })?;
                            Value::Float(x.powf(y))
                        }
                    };
                    frame.regs[a as usize] = value;
                }
                Opcode::Unm => {
                    let value = match &frame.regs[b as usize] {
                        Value::Int(v) => Value::Int(
                            v.checked_neg()
                                .ok_or_else(|| self.trap(pc, "integer overflow in negation"))?,
                        ),
                        Value::Float(v) => Value::Float(-v),
                        other => {
                            return Err(
                                self.trap(pc, format!("cannot negate {}", other.type_name()))
                            )
                        }
                    };
                    frame.regs[a as usize] = value;
                }
                Opcode::Not => {
                    let v = frame.regs[b as usize].truthy();
                    frame.regs[a as usize] = Value::Bool(!v);
                }
                Opcode::And => {
                    let v = frame.regs[b as usize].truthy() && frame.regs[c as usize].truthy();
                    frame.regs[a as usize] = Value::Bool(v);
                }
                Opcode::Or => {
                    let v = frame.regs[b as usize].truthy() || frame.regs[c as usize].truthy();
                    frame.regs[a as usize] = Value::Bool(v);
                }

                // Comparisons
                Opcode::Cmp(op) => {
                    let v = self
                        .compare(op, &frame.regs[b as usize], &frame.regs[c as usize])
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                    frame.regs[a as usize] = Value::Bool(v);
                }
                Opcode::CmpInt(op) => {
                    let (x, y) = int_pair(frame, b, c);
                    frame.regs[a as usize] = Value::Bool(cmp_int(op, x, y));
                }
                Opcode::CmpFloat(op) => {
                    let x = frame.regs[b as usize].as_float().unwrap_or(f64::NAN);
                    let y = frame.regs[c as usize].as_float().unwrap_or(f64::NAN);
                    frame.regs[a as usize] = Value::Bool(cmp_float(op, x, y));
                }
                Opcode::In | Opcode::NotIn => {
                    let found = self
                        .contains(&frame.regs[c as usize], &frame.regs[b as usize])
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                    let v = if instr.op == Opcode::In { found } else { !found };
                    frame.regs[a as usize] = Value::Bool(v);
                }

                // Arrays, strings, tables
                Opcode::NewArray => {
                    let first = b as usize;
                    let count = c as usize;
                    let items: Vec<Value> = frame.regs[first..first + count].to_vec();
                    frame.regs[a as usize] = Value::array(items);
                }
                Opcode::GetIndex | Opcode::GetIndexInt | Opcode::GetIndexImm => {
                    let idx = if instr.op == Opcode::GetIndexImm {
                        c as i64
                    } else {
                        frame.regs[c as usize]
                            .as_int()
                            .ok_or_else(|| self.trap(pc, "index must be int"))?
                    };
                    let value = self
                        .index(&frame.regs[b as usize], idx)
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                    frame.regs[a as usize] = value;
                }
                Opcode::SetIndex | Opcode::SetIndexInt => {
                    let idx = frame.regs[b as usize]
                        .as_int()
                        .ok_or_else(|| self.trap(pc, "index must be int"))?;
                    let target = frame.regs[a as usize].clone();
                    let value = frame.regs[c as usize].clone();
                    self.set_index(&target, idx, value)
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                }
                Opcode::Slice => {
                    let lo = frame.regs[c as usize].as_int().unwrap_or(0);
                    let hi = frame.regs[c as usize + 1].as_int().unwrap_or(0);
                    let value = self
                        .slice(&frame.regs[b as usize], lo, hi)
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                    frame.regs[a as usize] = value;
                }
                Opcode::ConcatArray => {
                    let lhs = &frame.regs[b as usize];
                    let rhs = &frame.regs[c as usize];
                    match (lhs, rhs) {
                        (Value::Array(x), Value::Array(y)) => {
                            let mut items = x.borrow().clone();
                            items.extend(y.borrow().iter().cloned());
                            frame.regs[a as usize] = Value::array(items);
                        }
                        _ => return Err(self.trap(pc, "concat needs two arrays")),
                    }
                }
                Opcode::Len => {
                    let value = match &frame.regs[b as usize] {
                        Value::Array(items) => Value::Int(items.borrow().len() as i64),
                        Value::Str(s) => Value::Int(s.chars().count() as i64),
                        other => {
                            return Err(
                                self.trap(pc, format!("cannot take length of {}", other.type_name()))
                            )
                        }
                    };
                    frame.regs[a as usize] = value;
                }
                Opcode::NewTable => {
                    if let Operands::Abx { a, bx } = instr.operands {
                        let type_name = match self.program.constants.get(bx as usize) {
                            Some(Const::Str(s)) => s.clone(),
                            _ => String::new(),
                        };
                        frame.regs[a as usize] = Value::Table(Rc::new(RefCell::new(Table {
                            type_name,
                            fields: HashMap::new(),
                        })));
                    }
                }
                Opcode::GetField => {
                    let name = self.const_str(c as u32);
                    let value = match &frame.regs[b as usize] {
                        Value::Table(t) => t.borrow().fields.get(&name).cloned(),
                        other => {
                            return Err(
                                self.trap(pc, format!("{} has no fields", other.type_name()))
                            )
                        }
                    };
                    frame.regs[a as usize] = value.unwrap_or(Value::Nil);
                }
                Opcode::SetField => {
                    let name = self.const_str(b as u32);
                    let value = frame.regs[c as usize].clone();
                    let target = frame.regs[a as usize].clone();
                    self.set_field(&target, &name, value)
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                }

                // Heap references
                Opcode::NewRef => {
                    let value = frame.regs[b as usize].clone();
                    let destructor = if c == 0 { None } else { Some(c as u32 - 1) };
                    let id = self.heap.alloc(value, destructor);
                    frame.regs[a as usize] = Value::Ref(id);
                }
                Opcode::NewWeak => {
                    let value = match &frame.regs[b as usize] {
                        Value::Ref(id) => Value::Weak(self.heap.new_weak(*id)),
                        Value::Nil => Value::Nil,
                        other => {
                            return Err(
                                self.trap(pc, format!("cannot weaken {}", other.type_name()))
                            )
                        }
                    };
                    frame.regs[a as usize] = value;
                }
                Opcode::WeakToStrong => {
                    let value = match &frame.regs[b as usize] {
                        Value::Weak(w) => match self.heap.weak_to_strong(*w) {
                            Some(id) => Value::Ref(id),
                            None => Value::Nil,
                        },
                        Value::Nil => Value::Nil,
                        other => {
                            return Err(
                                self.trap(pc, format!("cannot promote {}", other.type_name()))
                            )
                        }
                    };
                    frame.regs[a as usize] = value;
                }
                Opcode::IncRef => {
                    let v = frame.regs[a as usize].clone();
                    self.inc_value(&v);
                }
                Opcode::DecRef => {
                    let v = frame.regs[a as usize].clone();
                    self.dec_value(&v)
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                }
                Opcode::SetRef => {
                    let value = frame.regs[b as usize].clone();
                    match &frame.regs[a as usize] {
                        Value::Ref(id) => {
                            let old_children = self.ref_cell_swap(*id, value)?;
                            for child in old_children {
                                let destructors = self.heap.dec(child);
                                for d in destructors {
                                    self.run_destructor(d)?;
                                }
                            }
                        }
                        other => {
                            return Err(
                                self.trap(pc, format!("cannot store through {}", other.type_name()))
                            )
                        }
                    }
                }
                Opcode::Deref => {
                    let value = match &frame.regs[b as usize] {
                        Value::Ref(id) => self
                            .heap
                            .get(*id)
                            .map(|obj| obj.value.clone())
                            .ok_or_else(|| self.trap(pc, "dereference of freed reference"))?,
                        Value::Nil => return Err(self.trap(pc, "nil dereference")),
                        other => {
                            return Err(
                                self.trap(pc, format!("cannot dereference {}", other.type_name()))
                            )
                        }
                    };
                    frame.regs[a as usize] = value;
                }
                Opcode::CheckCycles => {
                    let pending = self.heap.collect_cycles();
                    for d in pending {
                        self.run_destructor(d)?;
                    }
                }

                // Option / result
                Opcode::WrapSome => {
                    frame.regs[a as usize] =
                        Value::Some(Box::new(frame.regs[b as usize].clone()));
                }
                Opcode::WrapOk => {
                    frame.regs[a as usize] = Value::Ok(Box::new(frame.regs[b as usize].clone()));
                }
                Opcode::WrapErr => {
                    frame.regs[a as usize] = Value::Err(Box::new(frame.regs[b as usize].clone()));
                }
                Opcode::UnwrapOption => {
                    let value = match &frame.regs[b as usize] {
                        Value::Some(v) => (**v).clone(),
                        Value::None => return Err(self.trap(pc, "unwrap of none")),
                        other => {
                            return Err(
                                self.trap(pc, format!("cannot unwrap {}", other.type_name()))
                            )
                        }
                    };
                    frame.regs[a as usize] = value;
                }
                Opcode::UnwrapResult => {
                    // c=0: ok payload, c=1: err payload
                    let value = match (&frame.regs[b as usize], c) {
                        (Value::Ok(v), 0) => (**v).clone(),
                        (Value::Err(v), 1) => (**v).clone(),
                        (Value::Err(v), 0) => {
                            return Err(self.trap(pc, format!("unwrap of err({})", v)))
                        }
                        (other, _) => {
                            return Err(
                                self.trap(pc, format!("cannot unwrap {}", other.type_name()))
                            )
                        }
                    };
                    frame.regs[a as usize] = value;
                }
                Opcode::TestTag => {
                    // Skip the next instruction when the tag matches
                    let matches = match (&frame.regs[a as usize], b) {
                        (Value::Some(_), tag::SOME) => true,
                        (Value::None, tag::NONE) => true,
                        (Value::Ok(_), tag::OK) => true,
                        (Value::Err(_), tag::ERR) => true,
                        _ => false,
                    };
                    if matches {
                        frame.pc += 1;
                    }
                }
                Opcode::Cast => {
                    let value = self
                        .cast(&frame.regs[b as usize], c)
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                    frame.regs[a as usize] = value;
                }

                // Control flow
                Opcode::Jmp => {
                    if let Operands::Asbx { sbx, .. } = instr.operands {
                        frame.pc = offset_pc(pc, sbx);
                    }
                }
                Opcode::Test => {
                    // Skip next when truthiness matches the c flag
                    if frame.regs[a as usize].truthy() == (c != 0) {
                        frame.pc += 1;
                    }
                }
                Opcode::TestSet => {
                    if frame.regs[b as usize].truthy() == (c != 0) {
                        frame.regs[a as usize] = frame.regs[b as usize].clone();
                    } else {
                        frame.pc += 1;
                    }
                }
                Opcode::CmpJmp(op) => {
                    let (lhs, rhs, off) = instr.unpack_cmp();
                    let v = self
                        .compare(op, &frame.regs[lhs as usize], &frame.regs[rhs as usize])
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                    if v {
                        frame.pc = offset_pc(pc, off as i32);
                    }
                }
                Opcode::CmpJmpInt(op) => {
                    let (lhs, rhs, off) = instr.unpack_cmp();
                    let x = frame.regs[lhs as usize].as_int().unwrap_or(0);
                    let y = frame.regs[rhs as usize].as_int().unwrap_or(0);
                    if cmp_int(op, x, y) {
                        frame.pc = offset_pc(pc, off as i32);
                    }
                }
                Opcode::CmpJmpFloat(op) => {
                    let (lhs, rhs, off) = instr.unpack_cmp();
                    let x = frame.regs[lhs as usize].as_float().unwrap_or(f64::NAN);
                    let y = frame.regs[rhs as usize].as_float().unwrap_or(f64::NAN);
                    if cmp_float(op, x, y) {
                        frame.pc = offset_pc(pc, off as i32);
                    }
                }
                Opcode::IncTest => {
                    let (counter, limit, off) = instr.unpack_cmp();
                    let x = frame.regs[counter as usize].as_int().unwrap_or(0) + 1;
                    frame.regs[counter as usize] = Value::Int(x);
                    let y = frame.regs[limit as usize].as_int().unwrap_or(0);
                    if x < y {
                        frame.pc = offset_pc(pc, off as i32);
                    }
                }
                Opcode::ForPrep | Opcode::ForIntPrep => {
                    if let Operands::Asbx { a, sbx } = instr.operands {
                        let base = a as usize;
                        let idx = frame.regs[base].clone();
                        let step = frame.regs[base + 2].clone();
                        frame.regs[base] = numeric_sub(&idx, &step)
                            .ok_or_else(|| self.trap(pc, "for loop needs numeric bounds"))?;
                        frame.pc = offset_pc(pc, sbx);
                    }
                }
                Opcode::ForLoop | Opcode::ForIntLoop => {
                    if let Operands::Asbx { a, sbx } = instr.operands {
                        let base = a as usize;
                        let idx = numeric_add(&frame.regs[base], &frame.regs[base + 2])
                            .ok_or_else(|| self.trap(pc, "for loop needs numeric bounds"))?;
                        let continue_loop = match (&idx, &frame.regs[base + 1]) {
                            (Value::Int(i), Value::Int(limit)) => i < limit,
                            (x, limit) => {
                                let xf = x.as_float().unwrap_or(f64::NAN);
                                let lf = limit.as_float().unwrap_or(f64::NAN);
                                xf < lf
                            }
                        };
                        frame.regs[base] = idx;
                        if continue_loop {
                            frame.pc = offset_pc(pc, sbx);
                        }
                    }
                }

                // Calls
                Opcode::Arg => self.call_args.push(frame.regs[a as usize].clone()),
                Opcode::ArgImm => {
                    if let Operands::Asbx { sbx, .. } = instr.operands {
                        self.call_args.push(Value::Int(sbx as i64));
                    }
                }
                Opcode::Call | Opcode::TailCall => {
                    if let Operands::Call { dst, func, argc } = instr.operands {
                        let args = self.take_args(argc);
                        let value = self.call_function(func, args)?;
                        frame.regs[dst as usize] = value;
                        if instr.op == Opcode::TailCall {
                            let v = frame.regs[dst as usize].clone();
                            return Ok(Outcome::Returned(v));
                        }
                    }
                }
                Opcode::CallBuiltin => {
                    if let Operands::Call { dst, func, argc } = instr.operands {
                        let args = self.take_args(argc);
                        let value = builtins::dispatch(func as u16, &args, self.out.as_mut())
                            .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                        frame.regs[dst as usize] = value;
                    }
                }
                Opcode::CallHost | Opcode::CallFfi => {
                    if let Operands::Call { dst, func, argc } = instr.operands {
                        let args = self.take_args(argc);
                        let value = self.call_function(func, args)
                            .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                        frame.regs[dst as usize] = value;
                    }
                }
                Opcode::CallClosure => {
                    if let Operands::Call { dst, func, argc } = instr.operands {
                        let closure = match &frame.regs[func as usize] {
                            Value::Closure(c) => c.clone(),
                            other => {
                                return Err(self.trap(
                                    pc,
                                    format!("cannot call {}", other.type_name()),
                                ))
                            }
                        };
                        let args = self.take_args(argc);
                        let mut full = closure.captures.clone();
                        full.extend(args);
                        let value = self.call_function(closure.func, full)?;
                        frame.regs[dst as usize] = value;
                    }
                }
                Opcode::NewClosure => {
                    if let Operands::Call { dst, func, argc } = instr.operands {
                        let captures = self.take_args(argc);
                        frame.regs[dst as usize] = Value::Closure(Rc::new(
                            crate::value::ClosureData { func, captures },
                        ));
                    }
                }
                Opcode::Return => {
                    let value = if b != 0 {
                        frame.regs[a as usize].clone()
                    } else {
                        Value::Nil
                    };
                    return Ok(Outcome::Returned(value));
                }

                // Globals
                Opcode::InitGlobal => {
                    if let Operands::Abx { a, bx } = instr.operands {
                        let name = self.const_str(bx);
                        // Host pre-assignment wins
                        self.globals
                            .entry(name)
                            .or_insert_with(|| frame.regs[a as usize].clone());
                    }
                }
                Opcode::GetGlobal => {
                    if let Operands::Abx { a, bx } = instr.operands {
                        let name = self.const_str(bx);
                        frame.regs[a as usize] =
                            self.globals.get(&name).cloned().unwrap_or(Value::Nil);
                    }
                }
                Opcode::SetGlobal => {
                    if let Operands::Abx { a, bx } = instr.operands {
                        let name = self.const_str(bx);
                        self.globals.insert(name, frame.regs[a as usize].clone());
                    }
                }
                Opcode::LoadAddStore | Opcode::LoadSubStore | Opcode::LoadMulStore
                | Opcode::LoadDivStore | Opcode::LoadModStore => {
                    let name = self.const_str(b as u32);
                    let old = self.globals.get(&name).cloned().unwrap_or(Value::Nil);
                    let operand = frame.regs[c as usize].clone();
                    let arith_op = match instr.op {
                        Opcode::LoadAddStore => Opcode::Add,
                        Opcode::LoadSubStore => Opcode::Sub,
                        Opcode::LoadMulStore => Opcode::Mul,
                        Opcode::LoadDivStore => Opcode::Div,
                        _ => Opcode::Mod,
                    };
                    let value = self
                        .arith(arith_op, &old, &operand)
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                    self.globals.insert(name, value);
                }
                Opcode::GetAddSet | Opcode::GetSubSet | Opcode::GetMulSet | Opcode::GetDivSet
                | Opcode::GetModSet => {
                    let name = self.const_str(b as u32);
                    let operand = frame.regs[c as usize].clone();
                    let target = frame.regs[a as usize].clone();
                    let arith_op = match instr.op {
                        Opcode::GetAddSet => Opcode::Add,
                        Opcode::GetSubSet => Opcode::Sub,
                        Opcode::GetMulSet => Opcode::Mul,
                        Opcode::GetDivSet => Opcode::Div,
                        _ => Opcode::Mod,
                    };
                    match &target {
                        Value::Table(t) => {
                            let old = t.borrow().fields.get(&name).cloned().unwrap_or(Value::Nil);
                            let value = self
                                .arith(arith_op, &old, &operand)
                                .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                            t.borrow_mut().fields.insert(name, value);
                        }
                        other => {
                            return Err(
                                self.trap(pc, format!("{} has no fields", other.type_name()))
                            )
                        }
                    }
                }

                // Defers
                Opcode::PushDefer => {
                    if let Operands::Asbx { a, sbx } = instr.operands {
                        if frame.defers.len() >= MAX_DEFERS {
                            return Err(self.trap(pc, "defer stack overflow"));
                        }
                        let body_pc = (pc as i64 + sbx as i64).max(0) as usize;
                        frame.defers.push(DeferEntry {
                            pc: body_pc,
                            depth: a,
                        });
                    }
                }
                Opcode::ExecDefers => {
                    let depth = a;
                    let runnable = frame
                        .defers
                        .last()
                        .map(|e| e.depth >= depth)
                        .unwrap_or(false);
                    if runnable {
                        frame.defer_min = depth;
                        frame.defer_resume = pc;
                        let entry = frame.defers.pop().unwrap_or(DeferEntry { pc: 0, depth: 0 });
                        frame.pc = entry.pc;
                    }
                }
                Opcode::DeferEnd => {
                    let next = frame
                        .defers
                        .last()
                        .filter(|e| e.depth >= frame.defer_min)
                        .copied();
                    match next {
                        Some(entry) => {
                            frame.defers.pop();
                            frame.pc = entry.pc;
                        }
                        None if frame.defer_resume == CLEANUP_RESUME => {
                            return Ok(Outcome::Returned(Value::Nil));
                        }
                        None => {
                            frame.pc = frame.defer_resume + 1;
                        }
                    }
                }

                // Coroutines
                Opcode::Spawn => {
                    if let Operands::Call { dst, func, argc } = instr.operands {
                        let args = self.take_args(argc);
                        let value = self.spawn(func, args)?;
                        frame.regs[dst as usize] = value;
                    }
                }
                Opcode::Resume => {
                    let value = match &frame.regs[b as usize] {
                        Value::Coroutine(id) => self.resume_coroutine(*id)?,
                        other => Value::error(format!("cannot resume {}", other.type_name())),
                    };
                    frame.regs[a as usize] = value;
                }
                Opcode::Yield => {
                    let Some(id) = coro else {
                        return Err(self.trap(pc, "yield outside of a coroutine"));
                    };
                    let value = if b != 0 {
                        frame.regs[a as usize].clone()
                    } else {
                        Value::Nil
                    };
                    let defers = std::mem::take(&mut frame.defers);
                    self.coroutines[id as usize].suspend(&frame.regs, defers, frame.pc, value.clone());
                    return Ok(Outcome::Yielded(value));
                }

                // Fused arithmetic: r[a] = r[a] OP2 (r[b] OP1 r[c])
                Opcode::Fused(f) | Opcode::FusedInt(f) | Opcode::FusedFloat(f) => {
                    let (op1, op2) = fused_parts(f);
                    let inner = self
                        .arith(op1, &frame.regs[b as usize], &frame.regs[c as usize])
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                    let value = self
                        .arith(op2, &frame.regs[a as usize], &inner)
                        .map_err(|e| e.with_pos(self.program.position_at(pc)))?;
                    frame.regs[a as usize] = value;
                }
            }
        }
    }

    fn take_args(&mut self, argc: u8) -> Vec<Value> {
        let n = argc as usize;
        let start = self.call_args.len().saturating_sub(n);
        self.call_args.split_off(start)
    }

    fn const_str(&self, idx: u32) -> String {
        match self.program.constants.get(idx as usize) {
            Some(Const::Str(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// Swap a scalar cell's value, returning the heap children of the
    /// old value so the caller can release them
    fn ref_cell_swap(&mut self, id: u32, value: Value) -> Result<Vec<u32>, RuntimeError> {
        let slot = self
            .heap
            .get(id)
            .ok_or_else(|| RuntimeError::msg("store through freed reference"))?;
        let old = slot.value.clone();
        // Incoming refs gain a count from living in the cell
        self.inc_value(&value);
        if let Some(obj) = self.heap.cell_mut(id) {
            obj.value = value;
        }
        let mut children = Vec::new();
        collect_children(&old, &mut children);
        Ok(children)
    }

    fn set_field(&mut self, target: &Value, name: &str, value: Value) -> Result<(), RuntimeError> {
        match target {
            Value::Table(t) => {
                let old = t.borrow().fields.get(name).cloned();
                // Ref-typed fields are counted by the container
                self.inc_value(&value);
                t.borrow_mut().fields.insert(name.to_string(), value);
                if let Some(old) = old {
                    self.dec_value(&old)?;
                }
                Ok(())
            }
            Value::Ref(id) => {
                let inner = self
                    .heap
                    .get(*id)
                    .map(|o| o.value.clone())
                    .ok_or_else(|| RuntimeError::msg("store through freed reference"))?;
                self.set_field(&inner, name, value)
            }
            other => Err(RuntimeError::msg(format!(
                "{} has no fields",
                other.type_name()
            ))),
        }
    }

    fn set_index(&mut self, target: &Value, idx: i64, value: Value) -> Result<(), RuntimeError> {
        match target {
            Value::Array(items) => {
                let len = items.borrow().len();
                if idx < 0 || idx as usize >= len {
                    return Err(RuntimeError::msg(format!(
                        "index {} out of bounds for length {}",
                        idx, len
                    )));
                }
                let old = items.borrow()[idx as usize].clone();
                self.inc_value(&value);
                items.borrow_mut()[idx as usize] = value;
                self.dec_value(&old)?;
                Ok(())
            }
            Value::Ref(id) => {
                let inner = self
                    .heap
                    .get(*id)
                    .map(|o| o.value.clone())
                    .ok_or_else(|| RuntimeError::msg("store through freed reference"))?;
                self.set_index(&inner, idx, value)
            }
            other => Err(RuntimeError::msg(format!(
                "cannot index {}",
                other.type_name()
            ))),
        }
    }

    fn index(&self, target: &Value, idx: i64) -> Result<Value, RuntimeError> {
        match target {
            Value::Array(items) => {
                let items = items.borrow();
                if idx < 0 || idx as usize >= items.len() {
                    return Err(RuntimeError::msg(format!(
                        "index {} out of bounds for length {}",
                        idx,
                        items.len()
                    )));
                }
                Ok(items[idx as usize].clone())
            }
            Value::Str(s) => s
                .chars()
                .nth(idx.max(0) as usize)
                .map(Value::Char)
                .ok_or_else(|| {
                    RuntimeError::msg(format!(
                        "index {} out of bounds for string of length {}",
                        idx,
                        s.chars().count()
                    ))
                }),
            other => Err(RuntimeError::msg(format!(
                "cannot index {}",
                other.type_name()
            ))),
        }
    }

    fn slice(&self, target: &Value, lo: i64, hi: i64) -> Result<Value, RuntimeError> {
        match target {
            Value::Array(items) => {
                let items = items.borrow();
                let len = items.len() as i64;
                let lo = lo.clamp(0, len) as usize;
                let hi = hi.clamp(0, len) as usize;
                let out: Vec<Value> = if lo < hi {
                    items[lo..hi].to_vec()
                } else {
                    Vec::new()
                };
                Ok(Value::array(out))
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                let lo = lo.clamp(0, len) as usize;
                let hi = hi.clamp(0, len) as usize;
                let out: String = if lo < hi {
                    chars[lo..hi].iter().collect()
                } else {
                    String::new()
                };
                Ok(Value::str(out))
            }
            other => Err(RuntimeError::msg(format!(
                "cannot slice {}",
                other.type_name()
            ))),
        }
    }

    /// Generic arithmetic with runtime tag checks and int->float
    /// promotion; strings concatenate, arrays concatenate
    fn arith(&self, op: Opcode, lhs: &Value, rhs: &Value) -> Result<Value, RuntimeError> {
        match (lhs, rhs) {
            (Value::Int(x), Value::Int(y)) => {
                let v = match op {
                    Opcode::Add => x.checked_add(*y),
                    Opcode::Sub => x.checked_sub(*y),
                    Opcode::Mul => x.checked_mul(*y),
                    Opcode::Div => {
                        if *y == 0 {
                            return Err(RuntimeError::msg("division by zero"));
                        }
                        x.checked_div(*y)
                    }
                    Opcode::Mod => {
                        if *y == 0 {
                            return Err(RuntimeError::msg("modulo by zero"));
                        }
                        Some(x.wrapping_rem(*y))
                    }
                    _ => None,
                };
                v.map(Value::Int)
                    .ok_or_else(|| RuntimeError::msg("integer overflow"))
            }
            (Value::Str(x), Value::Str(y)) if op == Opcode::Add => {
                Ok(Value::str(format!("{}{}", x, y)))
            }
            (Value::Array(x), Value::Array(y)) if op == Opcode::Add => {
                let mut items = x.borrow().clone();
                items.extend(y.borrow().iter().cloned());
                Ok(Value::array(items))
            }
            _ => {
                let x = lhs.as_float().ok_or_else(|| {
                    RuntimeError::msg(format!(
                        "arithmetic on {} and {}",
                        lhs.type_name(),
                        rhs.type_name()
                    ))
                })?;
                let y = rhs.as_float().ok_or_else(|| {
                    RuntimeError::msg(format!(
                        "arithmetic on {} and {}",
                        lhs.type_name(),
                        rhs.type_name()
                    ))
                })?;
                let v = match op {
                    Opcode::Add => x + y,
                    Opcode::Sub => x - y,
                    Opcode::Mul => x * y,
                    Opcode::Div => x / y,
                    Opcode::Mod => x % y,
                    _ => return Err(RuntimeError::msg("bad arithmetic opcode")),
                };
                Ok(Value::Float(v))
            }
        }
    }

    fn compare(&self, op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, RuntimeError> {
        let v = match (lhs, rhs) {
            (Value::Int(x), Value::Int(y)) => cmp_int(op, *x, *y),
            (Value::Float(_), _) | (_, Value::Float(_)) => {
                let x = lhs.as_float().unwrap_or(f64::NAN);
                let y = rhs.as_float().unwrap_or(f64::NAN);
                cmp_float(op, x, y)
            }
            (Value::Str(x), Value::Str(y)) => match op {
                CmpOp::Eq => x == y,
                CmpOp::Ne => x != y,
                CmpOp::Lt => x < y,
                CmpOp::Le => x <= y,
                CmpOp::Gt => x > y,
                CmpOp::Ge => x >= y,
            },
            (Value::Char(x), Value::Char(y)) => cmp_int(op, *x as i64, *y as i64),
            (a, b) => match op {
                CmpOp::Eq => a.equals(b),
                CmpOp::Ne => !a.equals(b),
                _ => {
                    return Err(RuntimeError::msg(format!(
                        "cannot order {} and {}",
                        a.type_name(),
                        b.type_name()
                    )))
                }
            },
        };
        Ok(v)
    }

    /// Membership: array element equality, or substring for strings
    fn contains(&self, container: &Value, element: &Value) -> Result<bool, RuntimeError> {
        match container {
            Value::Array(items) => Ok(items.borrow().iter().any(|v| v.equals(element))),
            Value::Str(haystack) => match element {
                Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
                Value::Char(c) => Ok(haystack.contains(*c)),
                other => Err(RuntimeError::msg(format!(
                    "cannot search for {} in a string",
                    other.type_name()
                ))),
            },
            other => Err(RuntimeError::msg(format!(
                "'in' needs an array or string, got {}",
                other.type_name()
            ))),
        }
    }

    fn cast(&self, value: &Value, target: u16) -> Result<Value, RuntimeError> {
        let out = match target {
            cast::INT => match value {
                Value::Int(v) => Value::Int(*v),
                Value::Float(v) => Value::Int(*v as i64),
                Value::Char(c) => Value::Int(*c as i64),
                Value::Bool(b) => Value::Int(i64::from(*b)),
                other => {
                    return Err(RuntimeError::msg(format!(
                        "cannot cast {} to int",
                        other.type_name()
                    )))
                }
            },
            cast::FLOAT => match value.as_float() {
                Some(v) => Value::Float(v),
                None => {
                    return Err(RuntimeError::msg(format!(
                        "cannot cast {} to float",
                        value.type_name()
                    )))
                }
            },
            cast::BOOL => Value::Bool(value.truthy()),
            cast::CHAR => match value {
                Value::Char(c) => Value::Char(*c),
                Value::Int(v) => char::from_u32(*v as u32)
                    .map(Value::Char)
                    .ok_or_else(|| RuntimeError::msg(format!("{} is not a valid char", v)))?,
                other => {
                    return Err(RuntimeError::msg(format!(
                        "cannot cast {} to char",
                        other.type_name()
                    )))
                }
            },
            cast::STR => Value::str(value.to_string()),
            _ => return Err(RuntimeError::msg("unknown cast target")),
        };
        Ok(out)
    }

    /// Final teardown: one last cycle-collector pass, then drop the heap
    pub fn teardown(&mut self) {
        let _ = self.heap.collect_cycles();
        let freed = self.heap.teardown();
        debug!(freed, "vm teardown");
    }
}

fn offset_pc(pc: usize, offset: i32) -> usize {
    (pc as i64 + 1 + offset as i64).max(0) as usize
}

fn int_pair(frame: &Frame, b: u16, c: u16) -> (i64, i64) {
    (
        frame.regs[b as usize].as_int().unwrap_or(0),
        frame.regs[c as usize].as_int().unwrap_or(0),
    )
}

fn int_op(
    frame: &mut Frame,
    pc: usize,
    vm: &Vm,
    a: u8,
    b: u16,
    c: u16,
    f: fn(i64, i64) -> Option<i64>,
) -> Result<(), RuntimeError> {
    let (x, y) = int_pair(frame, b, c);
    let v = f(x, y).ok_or_else(|| vm.trap(pc, "integer overflow"))?;
    frame.regs[a as usize] = Value::Int(v);
    Ok(())
}

fn float_op(frame: &mut Frame, a: u8, b: u16, c: u16, f: fn(f64, f64) -> f64) {
    let x = frame.regs[b as usize].as_float().unwrap_or(f64::NAN);
    let y = frame.regs[c as usize].as_float().unwrap_or(f64::NAN);
    frame.regs[a as usize] = Value::Float(f(x, y));
}

fn cmp_int(op: CmpOp, x: i64, y: i64) -> bool {
    match op {
        CmpOp::Eq => x == y,
        CmpOp::Ne => x != y,
        CmpOp::Lt => x < y,
        CmpOp::Le => x <= y,
        CmpOp::Gt => x > y,
        CmpOp::Ge => x >= y,
    }
}

/// NaN propagates as false for every comparison, `!=` included
fn cmp_float(op: CmpOp, x: f64, y: f64) -> bool {
    if x.is_nan() || y.is_nan() {
        return false;
    }
    match op {
        CmpOp::Eq => x == y,
        CmpOp::Ne => x != y,
        CmpOp::Lt => x < y,
        CmpOp::Le => x <= y,
        CmpOp::Gt => x > y,
        CmpOp::Ge => x >= y,
    }
}

fn numeric_add(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(Value::Int(x.checked_add(*y)?)),
        _ => Some(Value::Float(a.as_float()? + b.as_float()?)),
    }
}

fn numeric_sub(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(Value::Int(x.checked_sub(*y)?)),
        _ => Some(Value::Float(a.as_float()? - b.as_float()?)),
    }
}

/// Inner and outer opcodes of a fused pair (name reads inner-then-outer)
fn fused_parts(f: FusedOp) -> (Opcode, Opcode) {
    match f {
        FusedOp::AddAdd => (Opcode::Add, Opcode::Add),
        FusedOp::MulAdd => (Opcode::Mul, Opcode::Add),
        FusedOp::MulSub => (Opcode::Mul, Opcode::Sub),
        FusedOp::SubSub => (Opcode::Sub, Opcode::Sub),
        FusedOp::SubMul => (Opcode::Sub, Opcode::Mul),
        FusedOp::DivAdd => (Opcode::Div, Opcode::Add),
        FusedOp::AddSub => (Opcode::Add, Opcode::Sub),
        FusedOp::AddMul => (Opcode::Add, Opcode::Mul),
        FusedOp::SubDiv => (Opcode::Sub, Opcode::Div),
    }
}
