//! Comptime evaluation
//!
//! Runs a restricted interpreter over `comptime` expressions and blocks
//! before type analysis. Supported: literals, let/var, control flow,
//! calls to pure user functions, `readFile(path)` (embeds file contents
//! into the program) and `inject(name, typeStr, value)` (appends a typed
//! global declaration to the module). Anything with other side effects
//! is rejected.
//!
//! Safety errors raised during evaluation (division by zero, overflow)
//! surface as compile-time errors.

use crate::ast::{
    Block, Decl, Expr, ExprKind, FunctionDecl, Module, Stmt, StmtKind, TypeExpr, VarDecl, BinOp,
    UnOp,
};
use crate::error::{CompileError, ErrorKind, Result};
use etch_core::Position;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Evaluation fuel: each executed statement or expression costs one unit
const FUEL: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
enum CtValue {
    Void,
    Bool(bool),
    Char(char),
    Int(i64),
    Float(f64),
    Str(String),
}

impl CtValue {
    fn type_name(&self) -> &'static str {
        match self {
            CtValue::Void => "void",
            CtValue::Bool(_) => "bool",
            CtValue::Char(_) => "char",
            CtValue::Int(_) => "int",
            CtValue::Float(_) => "float",
            CtValue::Str(_) => "string",
        }
    }

    fn truthy(&self, pos: &Position) -> Result<bool> {
        match self {
            CtValue::Bool(b) => Ok(*b),
            other => Err(CompileError::new(
                ErrorKind::Comptime,
                pos.clone(),
                format!("condition must be bool, found {}", other.type_name()),
            )),
        }
    }

    fn to_expr(&self, pos: &Position) -> Expr {
        let kind = match self {
            CtValue::Void => ExprKind::Nil,
            CtValue::Bool(b) => ExprKind::Bool(*b),
            CtValue::Char(c) => ExprKind::Char(*c),
            CtValue::Int(v) => ExprKind::Int(*v),
            CtValue::Float(v) => ExprKind::Float(*v),
            CtValue::Str(s) => ExprKind::Str(s.clone()),
        };
        Expr::new(kind, pos.clone())
    }
}

impl std::fmt::Display for CtValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CtValue::Void => write!(f, "void"),
            CtValue::Bool(b) => write!(f, "{}", b),
            CtValue::Char(c) => write!(f, "{}", c),
            CtValue::Int(v) => write!(f, "{}", v),
            CtValue::Float(v) => write!(f, "{}", v),
            CtValue::Str(s) => write!(f, "{}", s),
        }
    }
}

/// An `inject(name, typeStr, value)` recorded during block evaluation
struct Injection {
    name: String,
    type_name: String,
    value: CtValue,
    pos: Position,
}

enum CtFlow {
    Normal(CtValue),
    Return(CtValue),
    Break,
    Continue,
}

struct Evaluator {
    /// Function declarations snapshot for pure calls
    functions: HashMap<String, FunctionDecl>,
    source_dir: PathBuf,
    scopes: Vec<HashMap<String, CtValue>>,
    injections: Vec<Injection>,
    /// Injection is only allowed in statement-level comptime blocks
    allow_inject: bool,
    fuel: u64,
}

/// Evaluate and erase every comptime construct in the module.
///
/// `comptime(expr)` nodes are replaced by their literal result;
/// `comptime { ... }` blocks execute and are removed, with their
/// injections appended to the module as immutable globals.
pub fn expand(module: &mut Module, source_dir: &Path) -> Result<()> {
    let mut functions = HashMap::new();
    for decl in &module.decls {
        if let Decl::Function(f) = decl {
            functions.entry(f.name.clone()).or_insert_with(|| f.clone());
        }
    }
    let mut evaluator = Evaluator {
        functions,
        source_dir: source_dir.to_path_buf(),
        scopes: Vec::new(),
        injections: Vec::new(),
        allow_inject: false,
        fuel: FUEL,
    };

    for decl in module.decls.iter_mut() {
        match decl {
            Decl::Function(f) => evaluator.expand_block(&mut f.body)?,
            Decl::Global(v) => {
                if let Some(init) = &mut v.init {
                    evaluator.expand_expr(init)?;
                }
            }
            Decl::TypeDef(_) => {}
        }
    }

    for inj in evaluator.injections.drain(..) {
        debug!(name = %inj.name, "injecting comptime global");
        let init = inj.value.to_expr(&inj.pos);
        module.decls.push(Decl::Global(VarDecl {
            name: inj.name,
            mutable: false,
            ty: Some(TypeExpr::Named(inj.type_name)),
            init: Some(init),
            exported: false,
            resolved_ty: None,
            pos: inj.pos,
        }));
    }
    Ok(())
}

impl Evaluator {
    fn error(&self, pos: &Position, msg: impl Into<String>) -> CompileError {
        CompileError::new(ErrorKind::Comptime, pos.clone(), msg)
    }

    fn burn(&mut self, pos: &Position) -> Result<()> {
        if self.fuel == 0 {
            return Err(self.error(pos, "comptime evaluation did not terminate"));
        }
        self.fuel -= 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expansion walk: find comptime nodes anywhere in a function body
    // ------------------------------------------------------------------

    fn expand_block(&mut self, block: &mut Block) -> Result<()> {
        let mut i = 0;
        while i < block.stmts.len() {
            let is_comptime_block = matches!(block.stmts[i].kind, StmtKind::Comptime(_));
            if is_comptime_block {
                let stmt = block.stmts.remove(i);
                if let StmtKind::Comptime(mut body) = stmt.kind {
                    self.run_block_at_top(&mut body)?;
                }
                continue;
            }
            self.expand_stmt(&mut block.stmts[i])?;
            i += 1;
        }
        Ok(())
    }

    fn run_block_at_top(&mut self, body: &mut Block) -> Result<()> {
        self.scopes.push(HashMap::new());
        self.allow_inject = true;
        let result = self.exec_block(body);
        self.allow_inject = false;
        self.scopes.pop();
        result.map(|_| ())
    }

    fn expand_stmt(&mut self, stmt: &mut Stmt) -> Result<()> {
        match &mut stmt.kind {
            StmtKind::Expr(e) => self.expand_expr(e),
            StmtKind::VarDecl(v) => {
                if let Some(init) = &mut v.init {
                    self.expand_expr(init)?;
                }
                Ok(())
            }
            StmtKind::Assign { target, value } => {
                self.expand_expr(target)?;
                self.expand_expr(value)
            }
            StmtKind::If {
                arms, else_body, ..
            } => {
                for arm in arms {
                    self.expand_expr(&mut arm.cond)?;
                    self.expand_block(&mut arm.body)?;
                }
                if let Some(body) = else_body {
                    self.expand_block(body)?;
                }
                Ok(())
            }
            StmtKind::While { cond, body } => {
                self.expand_expr(cond)?;
                self.expand_block(body)
            }
            StmtKind::ForRange {
                start, end, body, ..
            } => {
                self.expand_expr(start)?;
                self.expand_expr(end)?;
                self.expand_block(body)
            }
            StmtKind::ForIn { iter, body, .. } => {
                self.expand_expr(iter)?;
                self.expand_block(body)
            }
            StmtKind::Return(Some(e)) | StmtKind::Yield(e) => self.expand_expr(e),
            StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => Ok(()),
            StmtKind::Defer(body) | StmtKind::Block(body) => self.expand_block(body),
            StmtKind::Comptime(_) => Ok(()), // handled by expand_block
        }
    }

    fn expand_expr(&mut self, e: &mut Expr) -> Result<()> {
        if let ExprKind::Comptime(inner) = &mut e.kind {
            let inner = std::mem::take(inner);
            self.scopes.push(HashMap::new());
            let value = self.eval_expr(&inner);
            self.scopes.pop();
            let value = value?;
            if value == CtValue::Void {
                return Err(self.error(&inner.pos, "comptime expression produced no value"));
            }
            let pos = e.pos.clone();
            *e = value.to_expr(&pos);
            return Ok(());
        }
        // Recurse into children
        match &mut e.kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expand_expr(lhs)?;
                self.expand_expr(rhs)
            }
            ExprKind::Unary { operand, .. } => self.expand_expr(operand),
            ExprKind::Call { callee, args } => {
                self.expand_expr(callee)?;
                for a in args {
                    self.expand_expr(a)?;
                }
                Ok(())
            }
            ExprKind::Index { base, index } => {
                self.expand_expr(base)?;
                self.expand_expr(index)
            }
            ExprKind::Slice { base, lo, hi } => {
                self.expand_expr(base)?;
                for b in [lo, hi].into_iter().flatten() {
                    self.expand_expr(b)?;
                }
                Ok(())
            }
            ExprKind::Field { base, .. } => self.expand_expr(base),
            ExprKind::ArrayLit(elems) | ExprKind::TupleLit(elems) => {
                for el in elems {
                    self.expand_expr(el)?;
                }
                Ok(())
            }
            ExprKind::ObjectLit { fields, .. } => {
                for (_, f) in fields {
                    self.expand_expr(f)?;
                }
                Ok(())
            }
            ExprKind::Deref(inner)
            | ExprKind::Propagate(inner)
            | ExprKind::Len(inner)
            | ExprKind::Resume(inner) => self.expand_expr(inner),
            ExprKind::New { init, .. } => {
                if let Some(init) = init {
                    self.expand_expr(init)?;
                }
                Ok(())
            }
            ExprKind::Lambda(decl) => self.expand_block(&mut decl.body),
            ExprKind::Match { scrutinee, arms } => {
                self.expand_expr(scrutinee)?;
                for arm in arms {
                    self.expand_block(&mut arm.body)?;
                }
                Ok(())
            }
            ExprKind::Spawn { args, .. } => {
                for a in args {
                    self.expand_expr(a)?;
                }
                Ok(())
            }
            ExprKind::Cast { expr, .. } => self.expand_expr(expr),
            ExprKind::Wrap { value, .. } => self.expand_expr(value),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Interpreter
    // ------------------------------------------------------------------

    fn lookup(&self, name: &str) -> Option<&CtValue> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn assign(&mut self, name: &str, value: CtValue) -> bool {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = value;
                return true;
            }
        }
        false
    }

    fn exec_block(&mut self, block: &mut Block) -> Result<CtFlow> {
        self.scopes.push(HashMap::new());
        let mut result = CtFlow::Normal(CtValue::Void);
        for stmt in &mut block.stmts {
            match self.exec_stmt(stmt)? {
                CtFlow::Normal(v) => result = CtFlow::Normal(v),
                other => {
                    self.scopes.pop();
                    return Ok(other);
                }
            }
        }
        self.scopes.pop();
        Ok(result)
    }

    fn exec_stmt(&mut self, stmt: &mut Stmt) -> Result<CtFlow> {
        self.burn(&stmt.pos)?;
        match &mut stmt.kind {
            StmtKind::Expr(e) => {
                let v = self.eval_expr(e)?;
                Ok(CtFlow::Normal(v))
            }
            StmtKind::VarDecl(v) => {
                let value = match &v.init {
                    Some(init) => self.eval_expr(init)?,
                    None => {
                        return Err(self.error(&v.pos, "comptime variables need an initializer"))
                    }
                };
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(v.name.clone(), value);
                }
                Ok(CtFlow::Normal(CtValue::Void))
            }
            StmtKind::Assign { target, value } => {
                let name = match &target.kind {
                    ExprKind::Ident(name) => name.clone(),
                    _ => {
                        return Err(self.error(
                            &target.pos,
                            "only plain variables can be assigned in comptime code",
                        ))
                    }
                };
                let v = self.eval_expr(value)?;
                if !self.assign(&name, v) {
                    return Err(self.error(
                        &target.pos,
                        format!("unknown comptime variable '{}'", name),
                    ));
                }
                Ok(CtFlow::Normal(CtValue::Void))
            }
            StmtKind::If {
                arms, else_body, ..
            } => {
                for arm in arms.iter_mut() {
                    let cond = self.eval_expr(&arm.cond)?;
                    if cond.truthy(&arm.cond.pos)? {
                        return self.exec_block(&mut arm.body);
                    }
                }
                if let Some(body) = else_body {
                    return self.exec_block(body);
                }
                Ok(CtFlow::Normal(CtValue::Void))
            }
            StmtKind::While { cond, body } => {
                loop {
                    self.burn(&stmt.pos)?;
                    let c = self.eval_expr(cond)?;
                    if !c.truthy(&cond.pos)? {
                        break;
                    }
                    match self.exec_block(body)? {
                        CtFlow::Break => break,
                        CtFlow::Return(v) => return Ok(CtFlow::Return(v)),
                        _ => {}
                    }
                }
                Ok(CtFlow::Normal(CtValue::Void))
            }
            StmtKind::ForRange {
                var,
                start,
                end,
                body,
            } => {
                let s = match self.eval_expr(start)? {
                    CtValue::Int(v) => v,
                    other => {
                        return Err(self.error(
                            &start.pos,
                            format!("range bound must be int, found {}", other.type_name()),
                        ))
                    }
                };
                let e = match self.eval_expr(end)? {
                    CtValue::Int(v) => v,
                    other => {
                        return Err(self.error(
                            &end.pos,
                            format!("range bound must be int, found {}", other.type_name()),
                        ))
                    }
                };
                for i in s..e {
                    self.burn(&stmt.pos)?;
                    self.scopes.push(HashMap::new());
                    if let Some(scope) = self.scopes.last_mut() {
                        scope.insert(var.clone(), CtValue::Int(i));
                    }
                    let flow = self.exec_block(body);
                    self.scopes.pop();
                    match flow? {
                        CtFlow::Break => break,
                        CtFlow::Return(v) => return Ok(CtFlow::Return(v)),
                        _ => {}
                    }
                }
                Ok(CtFlow::Normal(CtValue::Void))
            }
            StmtKind::Return(value) => {
                let v = match value {
                    Some(e) => self.eval_expr(e)?,
                    None => CtValue::Void,
                };
                Ok(CtFlow::Return(v))
            }
            StmtKind::Break => Ok(CtFlow::Break),
            StmtKind::Continue => Ok(CtFlow::Continue),
            StmtKind::Block(body) => self.exec_block(body),
            StmtKind::Comptime(body) => self.exec_block(body),
            other => Err(self.error(
                &stmt.pos,
                format!("statement not supported in comptime code: {:?}", other),
            )),
        }
    }

    fn eval_expr(&mut self, e: &Expr) -> Result<CtValue> {
        self.burn(&e.pos)?;
        match &e.kind {
            ExprKind::Int(v) => Ok(CtValue::Int(*v)),
            ExprKind::Float(v) => Ok(CtValue::Float(*v)),
            ExprKind::Bool(b) => Ok(CtValue::Bool(*b)),
            ExprKind::Char(c) => Ok(CtValue::Char(*c)),
            ExprKind::Str(s) => Ok(CtValue::Str(s.clone())),
            ExprKind::Ident(name) => self
                .lookup(name)
                .cloned()
                .ok_or_else(|| self.error(&e.pos, format!("unknown comptime name '{}'", name))),
            ExprKind::Comptime(inner) => self.eval_expr(inner),
            ExprKind::Unary { op, operand } => {
                let v = self.eval_expr(operand)?;
                match (op, v) {
                    (UnOp::Neg, CtValue::Int(v)) => v
                        .checked_neg()
                        .map(CtValue::Int)
                        .ok_or_else(|| self.error(&e.pos, "integer overflow in negation")),
                    (UnOp::Neg, CtValue::Float(v)) => Ok(CtValue::Float(-v)),
                    (UnOp::Not, CtValue::Bool(b)) => Ok(CtValue::Bool(!b)),
                    (_, v) => Err(self.error(
                        &e.pos,
                        format!("unary operator not supported for {}", v.type_name()),
                    )),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let l = self.eval_expr(lhs)?;
                // Short circuit
                if *op == BinOp::And {
                    return if l.truthy(&lhs.pos)? {
                        self.eval_expr(rhs)
                    } else {
                        Ok(CtValue::Bool(false))
                    };
                }
                if *op == BinOp::Or {
                    return if l.truthy(&lhs.pos)? {
                        Ok(CtValue::Bool(true))
                    } else {
                        self.eval_expr(rhs)
                    };
                }
                let r = self.eval_expr(rhs)?;
                self.eval_binary(*op, l, r, &e.pos)
            }
            ExprKind::Len(inner) => match self.eval_expr(inner)? {
                CtValue::Str(s) => Ok(CtValue::Int(s.len() as i64)),
                other => Err(self.error(
                    &e.pos,
                    format!("# not supported for comptime {}", other.type_name()),
                )),
            },
            ExprKind::Call { callee, args } => {
                let name = match &callee.kind {
                    ExprKind::Ident(name) => name.clone(),
                    _ => {
                        return Err(
                            self.error(&e.pos, "only named functions are callable in comptime")
                        )
                    }
                };
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.eval_expr(a)?);
                }
                self.call(&name, values, &e.pos)
            }
            ExprKind::Cast { expr, ty } => {
                let v = self.eval_expr(expr)?;
                match (v, ty) {
                    (CtValue::Int(v), TypeExpr::Named(n)) if n == "float" => {
                        Ok(CtValue::Float(v as f64))
                    }
                    (CtValue::Float(v), TypeExpr::Named(n)) if n == "int" => {
                        Ok(CtValue::Int(v as i64))
                    }
                    (CtValue::Char(c), TypeExpr::Named(n)) if n == "int" => {
                        Ok(CtValue::Int(c as i64))
                    }
                    (v, _) => Err(self.error(
                        &e.pos,
                        format!("cast not supported in comptime for {}", v.type_name()),
                    )),
                }
            }
            other => Err(self.error(
                &e.pos,
                format!("expression not supported in comptime code: {:?}", other),
            )),
        }
    }

    fn eval_binary(&self, op: BinOp, l: CtValue, r: CtValue, pos: &Position) -> Result<CtValue> {
        use CtValue::*;
        let v = match (op, &l, &r) {
            (BinOp::Add, Int(a), Int(b)) => Int(a.checked_add(*b).ok_or_else(|| {
                self.error(pos, "integer overflow in comptime addition")
            })?),
            (BinOp::Sub, Int(a), Int(b)) => Int(a.checked_sub(*b).ok_or_else(|| {
                self.error(pos, "integer overflow in comptime subtraction")
            })?),
            (BinOp::Mul, Int(a), Int(b)) => Int(a.checked_mul(*b).ok_or_else(|| {
                self.error(pos, "integer overflow in comptime multiplication")
            })?),
            (BinOp::Div, Int(a), Int(b)) => {
                if *b == 0 {
                    return Err(CompileError::new(
                        ErrorKind::DivByZero,
                        pos.clone(),
                        "division by zero in comptime code",
                    ));
                }
                Int(a.checked_div(*b).ok_or_else(|| {
                    self.error(pos, "integer overflow in comptime division")
                })?)
            }
            (BinOp::Mod, Int(a), Int(b)) => {
                if *b == 0 {
                    return Err(CompileError::new(
                        ErrorKind::DivByZero,
                        pos.clone(),
                        "modulo by zero in comptime code",
                    ));
                }
                Int(a.wrapping_rem(*b))
            }
            (BinOp::Pow, Int(a), Int(b)) if *b >= 0 => {
                Int(a.checked_pow((*b).min(u32::MAX as i64) as u32).ok_or_else(|| {
                    self.error(pos, "integer overflow in comptime power")
                })?)
            }
            (BinOp::Add, Float(a), Float(b)) => Float(a + b),
            (BinOp::Sub, Float(a), Float(b)) => Float(a - b),
            (BinOp::Mul, Float(a), Float(b)) => Float(a * b),
            (BinOp::Div, Float(a), Float(b)) => Float(a / b),
            (BinOp::Pow, Float(a), Float(b)) => Float(a.powf(*b)),
            (BinOp::Add, Str(a), Str(b)) => Str(format!("{}{}", a, b)),
            (BinOp::Eq, a, b) => Bool(a == b),
            (BinOp::Ne, a, b) => Bool(a != b),
            (BinOp::Lt, Int(a), Int(b)) => Bool(a < b),
            (BinOp::Le, Int(a), Int(b)) => Bool(a <= b),
            (BinOp::Gt, Int(a), Int(b)) => Bool(a > b),
            (BinOp::Ge, Int(a), Int(b)) => Bool(a >= b),
            (BinOp::Lt, Float(a), Float(b)) => Bool(a < b),
            (BinOp::Le, Float(a), Float(b)) => Bool(a <= b),
            (BinOp::Gt, Float(a), Float(b)) => Bool(a > b),
            (BinOp::Ge, Float(a), Float(b)) => Bool(a >= b),
            _ => {
                return Err(self.error(
                    pos,
                    format!(
                        "operator '{}' not supported in comptime for {} and {}",
                        op.symbol(),
                        l.type_name(),
                        r.type_name()
                    ),
                ))
            }
        };
        Ok(v)
    }

    fn call(&mut self, name: &str, values: Vec<CtValue>, pos: &Position) -> Result<CtValue> {
        match name {
            "readFile" => {
                let path = match values.as_slice() {
                    [CtValue::Str(p)] => p.clone(),
                    _ => return Err(self.error(pos, "readFile takes a string path")),
                };
                let full = self.source_dir.join(&path);
                let content = std::fs::read_to_string(&full).map_err(|e| {
                    self.error(pos, format!("readFile: cannot read '{}': {}", full.display(), e))
                })?;
                Ok(CtValue::Str(content))
            }
            "print" => {
                match values.as_slice() {
                    [v] => println!("{}", v),
                    _ => return Err(self.error(pos, "print takes one argument")),
                }
                Ok(CtValue::Void)
            }
            "str" => match values.as_slice() {
                [v] => Ok(CtValue::Str(v.to_string())),
                _ => Err(self.error(pos, "str takes one argument")),
            },
            "len" => match values.as_slice() {
                [CtValue::Str(s)] => Ok(CtValue::Int(s.len() as i64)),
                _ => Err(self.error(pos, "len takes a string in comptime code")),
            },
            "inject" => {
                if !self.allow_inject {
                    return Err(self.error(
                        pos,
                        "inject is only allowed in statement-level comptime blocks",
                    ));
                }
                let (name, type_name, value) = match values.as_slice() {
                    [CtValue::Str(n), CtValue::Str(t), v] => (n.clone(), t.clone(), v.clone()),
                    _ => {
                        return Err(
                            self.error(pos, "inject takes (name, typeStr, value) arguments")
                        )
                    }
                };
                if !matches!(type_name.as_str(), "int" | "float" | "bool" | "char" | "string") {
                    return Err(self.error(
                        pos,
                        format!("inject: unsupported type '{}'", type_name),
                    ));
                }
                self.injections.push(Injection {
                    name,
                    type_name,
                    value,
                    pos: pos.clone(),
                });
                Ok(CtValue::Void)
            }
            "rand" => Err(self.error(pos, "rand is not available in comptime code")),
            _ => {
                let decl = self.functions.get(name).cloned().ok_or_else(|| {
                    self.error(pos, format!("unknown comptime function '{}'", name))
                })?;
                if !decl.type_params.is_empty() {
                    return Err(self.error(pos, "generic functions cannot run in comptime code"));
                }
                if values.len() != decl.params.len() {
                    return Err(self.error(
                        pos,
                        format!(
                            "'{}' takes {} arguments, found {}",
                            name,
                            decl.params.len(),
                            values.len()
                        ),
                    ));
                }
                let mut frame = HashMap::new();
                for (param, value) in decl.params.iter().zip(values) {
                    frame.insert(param.name.clone(), value);
                }
                // Fresh scope stack: user functions see only their params
                let saved = std::mem::replace(&mut self.scopes, vec![frame]);
                let saved_inject = std::mem::replace(&mut self.allow_inject, false);
                let mut body = decl.body.clone();
                let flow = self.exec_block(&mut body);
                self.allow_inject = saved_inject;
                self.scopes = saved;
                match flow? {
                    CtFlow::Return(v) | CtFlow::Normal(v) => Ok(v),
                    _ => Ok(CtValue::Void),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;
    use std::io::Write as _;

    fn expand_source(source: &str, dir: &Path) -> Result<Module> {
        let mut module = parse_module(source, "test.etch")?;
        expand(&mut module, dir)?;
        Ok(module)
    }

    fn first_init<'a>(module: &'a Module, fn_name: &str) -> &'a Expr {
        let f = module.find_function(fn_name).unwrap();
        match &f.body.stmts[0].kind {
            StmtKind::VarDecl(v) => v.init.as_ref().unwrap(),
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_comptime_expr_folds_to_literal() {
        let module = expand_source(
            "fn main() { let x = comptime(6 * 7) }",
            Path::new("."),
        )
        .unwrap();
        assert_eq!(first_init(&module, "main").kind, ExprKind::Int(42));
    }

    #[test]
    fn test_comptime_calls_pure_function() {
        let module = expand_source(
            "fn sq(x: int) -> int { return x * x }\n\
             fn main() { let x = comptime(sq(9)) }",
            Path::new("."),
        )
        .unwrap();
        assert_eq!(first_init(&module, "main").kind, ExprKind::Int(81));
    }

    #[test]
    fn test_read_file_embeds_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("msg.txt")).unwrap();
        writeln!(f, "hello").unwrap();
        let module = expand_source(
            "fn main() { let s: string = comptime(readFile(\"msg.txt\")) }",
            dir.path(),
        )
        .unwrap();
        assert_eq!(
            first_init(&module, "main").kind,
            ExprKind::Str("hello\n".into())
        );
    }

    #[test]
    fn test_inject_appends_global() {
        let module = expand_source(
            "fn main() { }\n\
             comptime { inject(\"answer\", \"int\", 6 * 7) }",
            Path::new("."),
        );
        // comptime blocks are only valid inside functions; at module
        // level the parser rejects them
        assert!(module.is_err());

        let module = expand_source(
            "fn main() { comptime { inject(\"answer\", \"int\", 6 * 7) } }",
            Path::new("."),
        )
        .unwrap();
        let found = module.decls.iter().any(|d| {
            matches!(d, Decl::Global(v) if v.name == "answer"
                && v.init.as_ref().map(|e| e.kind == ExprKind::Int(42)).unwrap_or(false))
        });
        assert!(found, "injected global missing");
    }

    #[test]
    fn test_comptime_div_by_zero_is_compile_error() {
        let err = expand_source("fn main() { let x = comptime(1 / 0) }", Path::new("."))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivByZero);
    }

    #[test]
    fn test_comptime_rejects_rand() {
        let err = expand_source("fn main() { let x = comptime(rand(1, 0)) }", Path::new("."))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Comptime);
    }

    #[test]
    fn test_comptime_loop_terminates_via_fuel() {
        let err = expand_source(
            "fn main() { comptime { var i = 0 while i >= 0 { i = 0 } } }",
            Path::new("."),
        )
        .unwrap_err();
        assert!(err.message.contains("did not terminate"));
    }

    #[test]
    fn test_comptime_control_flow() {
        let module = expand_source(
            "fn fib(n: int) -> int {\n\
               var a = 0\n\
               var b = 1\n\
               for i in 0..n { let t = a + b a = b b = t }\n\
               return a\n\
             }\n\
             fn main() { let x = comptime(fib(10)) }",
            Path::new("."),
        )
        .unwrap();
        assert_eq!(first_init(&module, "main").kind, ExprKind::Int(55));
    }
}
