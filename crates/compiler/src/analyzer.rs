//! Type and safety analysis
//!
//! A single pass over each function interleaves three analyses:
//!
//! - type inference with expected-type propagation, overload resolution
//!   and generic monomorphization
//! - the safety prover: integer range propagation with branch narrowing
//!   and loop widening, nil-state tracking for refs/weaks, and static
//!   div-by-zero / overflow / bounds obligations
//! - definite initialization and dead-branch marking
//!
//! Branches the prover rules out are marked unreachable on the AST and
//! contribute nothing: neither their safety obligations nor their
//! initialization state propagate.

use crate::ast::{
    Block, Decl, Expr, ExprKind, FunctionDecl, IfArm, MatchPattern, Module, Stmt, StmtKind,
    TypeDecl, TypeDeclBody, TypeExpr, VarDecl, BinOp, UnOp, WrapKind,
};
use crate::error::{CompileError, ErrorKind, Result};
use crate::range::Range;
use crate::types::{EnumMember, ObjectField, Type};
use etch_core::instruction::CmpOp;
use etch_core::Position;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Reserved builtin function names
pub const BUILTINS: &[&str] = &["print", "rand", "len", "str"];

/// An FFI function made visible by `import ffi`, resolved by the module
/// resolver before analysis runs
#[derive(Debug, Clone, PartialEq)]
pub struct FfiFunction {
    pub name: String,
    pub library: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSig {
    pub name: String,
    pub ty: Type,
    pub default: Option<Expr>,
}

/// Signature of a callable function, keyed both by source name (for
/// overload resolution) and mangled name (for codegen)
#[derive(Debug, Clone, PartialEq)]
pub struct FnSig {
    /// Unique emission name: plain, `name@N` for overloads past the
    /// first, `name[int]` for generic instances, `outer@lambdaN`
    pub mangled: String,
    pub source_name: String,
    pub type_params: Vec<String>,
    pub params: Vec<ParamSig>,
    pub ret: Type,
    /// True when the return type is `coroutine[T]`
    pub is_coroutine: bool,
    pub pos: Position,
}

impl FnSig {
    pub fn required_arity(&self) -> usize {
        self.params.iter().filter(|p| p.default.is_none()).count()
    }

    /// The yield/completion type for coroutine functions
    pub fn yield_type(&self) -> Type {
        match &self.ret {
            Type::Coroutine(inner) => (**inner).clone(),
            other => other.clone(),
        }
    }
}

/// Result of analysis, consumed by the bytecode compiler
#[derive(Debug, Default)]
pub struct Analysis {
    /// Overload sets by source name
    pub signatures: HashMap<String, Vec<FnSig>>,
    /// Every emittable signature by mangled name
    pub mangled: HashMap<String, FnSig>,
    pub ffi: Vec<FfiFunction>,
    pub host_functions: Vec<String>,
    /// Module-level variable types in declaration order
    pub globals: Vec<(String, Type)>,
}

// ----------------------------------------------------------------------------
// Environment
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NilState {
    Nil,
    NonNil,
    Unknown,
}

impl NilState {
    fn join(self, other: NilState) -> NilState {
        if self == other {
            self
        } else {
            NilState::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct VarInfo {
    ty: Type,
    mutable: bool,
    initialized: bool,
    range: Option<Range>,
    nil: NilState,
    /// Statically known array length (let-bound literals)
    array_len: Option<i64>,
}

type Scope = HashMap<String, VarInfo>;
type Env = Vec<Scope>;

fn env_lookup<'e>(env: &'e Env, name: &str) -> Option<&'e VarInfo> {
    env.iter().rev().find_map(|s| s.get(name))
}

fn env_lookup_mut<'e>(env: &'e mut Env, name: &str) -> Option<&'e mut VarInfo> {
    env.iter_mut().rev().find_map(|s| s.get_mut(name))
}

/// Merge two environments at a control-flow join. Scope shapes match
/// because branches push and pop their own scopes symmetrically.
fn merge_env(a: &Env, b: &Env) -> Env {
    let mut merged = Vec::with_capacity(a.len());
    for (sa, sb) in a.iter().zip(b.iter()) {
        let mut scope = Scope::new();
        for (name, va) in sa {
            let info = match sb.get(name) {
                Some(vb) => VarInfo {
                    ty: va.ty.clone(),
                    mutable: va.mutable,
                    initialized: va.initialized && vb.initialized,
                    range: match (&va.range, &vb.range) {
                        (Some(ra), Some(rb)) => Some(ra.union(rb)),
                        _ => None,
                    },
                    nil: va.nil.join(vb.nil),
                    array_len: if va.array_len == vb.array_len {
                        va.array_len
                    } else {
                        None
                    },
                },
                None => va.clone(),
            };
            scope.insert(name.clone(), info);
        }
        merged.push(scope);
    }
    merged
}

/// How a statement sequence leaves control flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    /// Returns, breaks or continues on every path
    Exits,
}

// ----------------------------------------------------------------------------
// Analyzer
// ----------------------------------------------------------------------------

pub struct Analyzer {
    types: HashMap<String, Type>,
    sigs: HashMap<String, Vec<FnSig>>,
    mangled: HashMap<String, FnSig>,
    ffi: HashMap<String, FfiFunction>,
    host: HashSet<String>,
    globals: HashMap<String, VarInfo>,
    global_order: Vec<(String, Type)>,

    current_ret: Type,
    current_is_coroutine: bool,
    current_fn: String,
    /// Generic bindings in effect while analyzing a monomorphized instance
    bindings: HashMap<String, Type>,
    /// Generic template declarations by mangled template name
    templates: HashMap<String, FunctionDecl>,
    /// Default field initializers: (type name, field name) -> expr
    object_defaults: HashMap<(String, String), Expr>,
    /// Pending generic instances: (mangled, template decl, bindings)
    pending: Vec<(String, FunctionDecl, HashMap<String, Type>)>,
    instantiated: HashSet<String>,
    /// Lambdas lifted out of the function being analyzed
    lifted: Vec<FunctionDecl>,
    lambda_counter: u32,
    /// Outer environments visible to a lambda body, for capture analysis
    enclosing: Vec<Env>,
    capture_sink: Vec<Vec<(String, Type)>>,
    /// > 0 while running speculative loop rounds: obligations are
    /// deferred to the final pass instead of raised
    speculative: u32,
    loop_depth: u32,
    /// Environments captured at break/continue, one collector per
    /// enclosing loop; merged into the loop's dataflow
    loop_joins: Vec<Vec<Env>>,
}

/// Entry point: annotate the module and produce the codegen-facing
/// analysis tables. The module is extended in place with monomorphized
/// generic instances and lifted lambdas.
pub fn analyze(
    module: &mut Module,
    ffi: Vec<FfiFunction>,
    host_functions: &[String],
) -> Result<Analysis> {
    let mut analyzer = Analyzer::new(&ffi, host_functions);
    analyzer.collect_types(module)?;
    analyzer.collect_signatures(module)?;
    analyzer.analyze_globals(module)?;
    analyzer.analyze_functions(module)?;
    analyzer.drain_instances(module)?;

    let mut signatures = analyzer.sigs;
    // Templates are not emittable; drop them from the codegen tables
    for sigs in signatures.values_mut() {
        sigs.retain(|s| s.type_params.is_empty());
    }
    Ok(Analysis {
        signatures,
        mangled: analyzer.mangled,
        ffi,
        host_functions: host_functions.to_vec(),
        globals: analyzer.global_order,
    })
}

impl Analyzer {
    fn new(ffi: &[FfiFunction], host_functions: &[String]) -> Self {
        Analyzer {
            types: HashMap::new(),
            sigs: HashMap::new(),
            mangled: HashMap::new(),
            ffi: ffi.iter().map(|f| (f.name.clone(), f.clone())).collect(),
            host: host_functions.iter().cloned().collect(),
            globals: HashMap::new(),
            global_order: Vec::new(),
            current_ret: Type::Void,
            current_is_coroutine: false,
            current_fn: String::new(),
            bindings: HashMap::new(),
            templates: HashMap::new(),
            object_defaults: HashMap::new(),
            pending: Vec::new(),
            instantiated: HashSet::new(),
            lifted: Vec::new(),
            lambda_counter: 0,
            enclosing: Vec::new(),
            capture_sink: Vec::new(),
            speculative: 0,
            loop_depth: 0,
            loop_joins: Vec::new(),
        }
    }

    fn err(&self, kind: ErrorKind, pos: &Position, msg: impl Into<String>) -> CompileError {
        CompileError::new(kind, pos.clone(), msg)
    }

    // ------------------------------------------------------------------
    // Module-level collection
    // ------------------------------------------------------------------

    fn collect_types(&mut self, module: &Module) -> Result<()> {
        // First register names so types can reference each other
        for decl in &module.decls {
            if let Decl::TypeDef(t) = decl {
                if self.types.contains_key(&t.name) {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &t.pos,
                        format!("duplicate type name '{}'", t.name),
                    ));
                }
                self.types.insert(t.name.clone(), Type::Named(t.name.clone()));
            }
        }
        // Then resolve bodies
        for decl in &module.decls {
            if let Decl::TypeDef(t) = decl {
                let resolved = self.resolve_type_decl(t)?;
                if let TypeDeclBody::Object { fields } = &t.body {
                    for f in fields {
                        if let Some(default) = &f.default {
                            self.object_defaults
                                .insert((t.name.clone(), f.name.clone()), default.clone());
                        }
                    }
                }
                self.types.insert(t.name.clone(), resolved);
            }
        }
        Ok(())
    }

    fn resolve_type_decl(&mut self, decl: &TypeDecl) -> Result<Type> {
        match &decl.body {
            TypeDeclBody::Alias(te) => self.resolve_type(te, &decl.pos),
            TypeDeclBody::Distinct(te) => Ok(Type::Distinct {
                name: decl.name.clone(),
                base: Box::new(self.resolve_type(te, &decl.pos)?),
            }),
            TypeDeclBody::Union(variants) => {
                let mut resolved = Vec::new();
                for v in variants {
                    resolved.push(self.resolve_type(v, &decl.pos)?);
                }
                Ok(Type::union_of(resolved))
            }
            TypeDeclBody::Object { fields } => {
                let mut resolved = Vec::new();
                for f in fields {
                    resolved.push(ObjectField {
                        name: f.name.clone(),
                        ty: self.resolve_type(&f.ty, &decl.pos)?,
                        has_default: f.default.is_some(),
                        exported: f.exported,
                    });
                }
                Ok(Type::Object {
                    name: decl.name.clone(),
                    fields: resolved,
                })
            }
            TypeDeclBody::Enum { members } => {
                let mut resolved = Vec::new();
                let mut next = 0i64;
                for m in members {
                    let value = m.value.unwrap_or(next);
                    next = value + 1;
                    resolved.push(EnumMember {
                        name: m.name.clone(),
                        int_val: value,
                        str_val: m.name.clone(),
                    });
                }
                Ok(Type::Enum {
                    name: decl.name.clone(),
                    members: resolved,
                })
            }
        }
    }

    fn resolve_type(&self, te: &TypeExpr, pos: &Position) -> Result<Type> {
        let ty = match te {
            TypeExpr::Named(name) => match name.as_str() {
                "void" => Type::Void,
                "bool" => Type::Bool,
                "char" => Type::Char,
                "int" => Type::Int,
                "float" => Type::Float,
                "string" => Type::Str,
                "typedesc" => Type::TypeDesc,
                other => {
                    if let Some(bound) = self.bindings.get(other) {
                        bound.clone()
                    } else if let Some(known) = self.types.get(other) {
                        match known {
                            // Nominal types stay behind the name so
                            // recursive objects terminate; aliases
                            // resolve structurally right away
                            Type::Object { .. }
                            | Type::Enum { .. }
                            | Type::Distinct { .. }
                            | Type::Named(_) => Type::Named(other.to_string()),
                            concrete => concrete.clone(),
                        }
                    } else {
                        return Err(self.err(
                            ErrorKind::UnknownName,
                            pos,
                            format!("unknown type '{}'", other),
                        ));
                    }
                }
            },
            TypeExpr::Array(inner) => Type::Array(Box::new(self.resolve_type(inner, pos)?)),
            TypeExpr::Option(inner) => Type::Option(Box::new(self.resolve_type(inner, pos)?)),
            TypeExpr::Result(inner) => Type::Result(Box::new(self.resolve_type(inner, pos)?)),
            TypeExpr::Ref(inner) => Type::Ref(Box::new(self.resolve_type(inner, pos)?)),
            TypeExpr::Weak(inner) => Type::Weak(Box::new(self.resolve_type(inner, pos)?)),
            TypeExpr::Coroutine(inner) => Type::Coroutine(Box::new(self.resolve_type(inner, pos)?)),
            TypeExpr::Channel(inner) => Type::Channel(Box::new(self.resolve_type(inner, pos)?)),
            TypeExpr::Tuple(elems) => {
                let mut resolved = Vec::new();
                for e in elems {
                    resolved.push(self.resolve_type(e, pos)?);
                }
                Type::Tuple(resolved)
            }
            TypeExpr::Function(params, ret) => {
                let mut ps = Vec::new();
                for p in params {
                    ps.push(self.resolve_type(p, pos)?);
                }
                Type::Function {
                    params: ps,
                    ret: Box::new(self.resolve_type(ret, pos)?),
                }
            }
            TypeExpr::Union(variants) => {
                let mut resolved = Vec::new();
                for v in variants {
                    resolved.push(self.resolve_type(v, pos)?);
                }
                Type::union_of(resolved)
            }
        };
        Ok(ty)
    }

    /// Resolve a type inside a generic function template: unknown names
    /// that match a type parameter become `Generic`
    fn resolve_type_generic(
        &self,
        te: &TypeExpr,
        type_params: &[String],
        pos: &Position,
    ) -> Result<Type> {
        if let TypeExpr::Named(name) = te {
            if type_params.iter().any(|p| p == name) {
                return Ok(Type::Generic(name.clone()));
            }
        }
        match te {
            TypeExpr::Array(i) => Ok(Type::Array(Box::new(
                self.resolve_type_generic(i, type_params, pos)?,
            ))),
            TypeExpr::Option(i) => Ok(Type::Option(Box::new(
                self.resolve_type_generic(i, type_params, pos)?,
            ))),
            TypeExpr::Result(i) => Ok(Type::Result(Box::new(
                self.resolve_type_generic(i, type_params, pos)?,
            ))),
            TypeExpr::Ref(i) => Ok(Type::Ref(Box::new(
                self.resolve_type_generic(i, type_params, pos)?,
            ))),
            TypeExpr::Weak(i) => Ok(Type::Weak(Box::new(
                self.resolve_type_generic(i, type_params, pos)?,
            ))),
            TypeExpr::Coroutine(i) => Ok(Type::Coroutine(Box::new(
                self.resolve_type_generic(i, type_params, pos)?,
            ))),
            TypeExpr::Channel(i) => Ok(Type::Channel(Box::new(
                self.resolve_type_generic(i, type_params, pos)?,
            ))),
            _ => self.resolve_type(te, pos),
        }
    }

    fn collect_signatures(&mut self, module: &Module) -> Result<()> {
        for decl in &module.decls {
            let f = match decl {
                Decl::Function(f) => f,
                _ => continue,
            };
            if BUILTINS.contains(&f.name.as_str()) {
                return Err(self.err(
                    ErrorKind::TypeMismatch,
                    &f.pos,
                    format!("'{}' is a builtin and cannot be redefined", f.name),
                ));
            }
            let sig = self.signature_of(f)?;
            if !f.type_params.is_empty() {
                self.templates.insert(sig.mangled.clone(), f.clone());
            }
            self.register_sig(sig);
        }
        Ok(())
    }

    fn signature_of(&mut self, f: &FunctionDecl) -> Result<FnSig> {
        let mut params = Vec::new();
        for p in &f.params {
            let ty = self.resolve_type_generic(&p.ty, &f.type_params, &p.pos)?;
            params.push(ParamSig {
                name: p.name.clone(),
                ty,
                default: p.default.clone(),
            });
        }
        let ret = match &f.return_type {
            Some(te) => self.resolve_type_generic(te, &f.type_params, &f.pos)?,
            None => Type::Void,
        };
        let is_coroutine = matches!(ret, Type::Coroutine(_));
        let overload_idx = self.sigs.get(&f.name).map(|v| v.len()).unwrap_or(0);
        let mangled = if overload_idx == 0 {
            f.name.clone()
        } else {
            format!("{}@{}", f.name, overload_idx)
        };
        Ok(FnSig {
            mangled,
            source_name: f.name.clone(),
            type_params: f.type_params.clone(),
            params,
            ret,
            is_coroutine,
            pos: f.pos.clone(),
        })
    }

    fn register_sig(&mut self, sig: FnSig) {
        self.mangled.insert(sig.mangled.clone(), sig.clone());
        self.sigs.entry(sig.source_name.clone()).or_default().push(sig);
    }

    fn analyze_globals(&mut self, module: &mut Module) -> Result<()> {
        let mut decls = std::mem::take(&mut module.decls);
        let mut result = Ok(());
        for decl in decls.iter_mut() {
            if let Decl::Global(v) = decl {
                if let Err(e) = self.analyze_global(v) {
                    result = Err(e);
                    break;
                }
            }
        }
        module.decls = decls;
        result
    }

    fn analyze_global(&mut self, v: &mut VarDecl) -> Result<()> {
        let declared = match &v.ty {
            Some(te) => Some(self.resolve_type(te, &v.pos)?),
            None => None,
        };
        let mut env: Env = vec![Scope::new()];
        let ty = match (&declared, &mut v.init) {
            (Some(want), Some(init)) => {
                let got = self.infer_expr(init, &mut env, Some(want))?;
                if !self.accepts(want, &got) {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &v.pos,
                        format!("cannot initialize '{}: {}' with {}", v.name, want, got),
                    ));
                }
                want.clone()
            }
            (Some(want), None) => want.clone(),
            (None, Some(init)) => self.infer_expr(init, &mut env, None)?,
            (None, None) => {
                return Err(self.err(
                    ErrorKind::TypeMismatch,
                    &v.pos,
                    format!("global '{}' needs a type or initializer", v.name),
                ))
            }
        };
        v.resolved_ty = Some(ty.clone());
        // Mutable globals can change between any two functions; only
        // immutable ones keep a provable range
        let range = if v.mutable {
            if self.resolve(&ty) == Type::Int {
                Some(Range::full())
            } else {
                None
            }
        } else {
            v.init.as_ref().and_then(|e| e.range)
        };
        self.globals.insert(
            v.name.clone(),
            VarInfo {
                ty: ty.clone(),
                mutable: v.mutable,
                initialized: v.init.is_some(),
                range,
                nil: NilState::Unknown,
                array_len: None,
            },
        );
        self.global_order.push((v.name.clone(), ty));
        Ok(())
    }

    fn analyze_functions(&mut self, module: &mut Module) -> Result<()> {
        let mut decls = std::mem::take(&mut module.decls);
        let mut result = Ok(());
        for decl in decls.iter_mut() {
            if let Decl::Function(f) = decl {
                if !f.type_params.is_empty() {
                    // Generic templates are analyzed per instance
                    continue;
                }
                if let Err(e) = self.analyze_function(f, None) {
                    result = Err(e);
                    break;
                }
            }
        }
        // Lambdas lifted during body analysis become real declarations
        for lifted in self.lifted.drain(..) {
            decls.push(Decl::Function(lifted));
        }
        module.decls = decls;
        result
    }

    /// Instantiate queued generic instances until the queue drains.
    /// Instances may themselves request further instances.
    fn drain_instances(&mut self, module: &mut Module) -> Result<()> {
        while let Some((mangled, template, bindings)) = self.pending.pop() {
            debug!(instance = %mangled, "monomorphizing");
            let mut decl = template;
            decl.name = mangled.clone();
            decl.type_params = Vec::new();
            let saved = std::mem::replace(&mut self.bindings, bindings);
            let result = self.analyze_function(&mut decl, Some(&mangled));
            self.bindings = saved;
            result?;
            for lifted in self.lifted.drain(..) {
                module.decls.push(Decl::Function(lifted));
            }
            module.decls.push(Decl::Function(decl));
        }
        Ok(())
    }

    fn analyze_function(&mut self, f: &mut FunctionDecl, mangled: Option<&str>) -> Result<()> {
        let sig = match mangled {
            Some(m) => self
                .mangled
                .get(m)
                .cloned()
                .ok_or_else(|| self.err(ErrorKind::Internal, &f.pos, "missing instance signature"))?,
            None => {
                // Find this decl's signature among the overload set by
                // position-and-shape match
                let sigs = self.sigs.get(&f.name).cloned().unwrap_or_default();
                sigs.into_iter()
                    .find(|s| s.pos == f.pos && s.params.len() == f.params.len())
                    .ok_or_else(|| self.err(ErrorKind::Internal, &f.pos, "missing signature"))?
            }
        };

        self.current_ret = sig.ret.clone();
        self.current_is_coroutine = sig.is_coroutine;
        self.current_fn = sig.mangled.clone();
        self.lambda_counter = 0;

        let mut env: Env = vec![Scope::new()];
        for p in &sig.params {
            let range = if self.resolve(&p.ty) == Type::Int {
                Some(Range::full())
            } else {
                None
            };
            env[0].insert(
                p.name.clone(),
                VarInfo {
                    ty: p.ty.clone(),
                    mutable: false,
                    initialized: true,
                    range,
                    nil: NilState::Unknown,
                    array_len: None,
                },
            );
        }

        let flow = self.analyze_block(&mut f.body, &mut env)?;
        let ret = self.resolve(&sig.ret);
        if ret != Type::Void && !sig.is_coroutine && flow != Flow::Exits {
            return Err(self.err(
                ErrorKind::TypeMismatch,
                &f.pos,
                format!("function '{}' does not return a value on all paths", f.name),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn analyze_block(&mut self, block: &mut Block, env: &mut Env) -> Result<Flow> {
        env.push(Scope::new());
        let mut flow = Flow::Normal;
        for stmt in &mut block.stmts {
            if flow == Flow::Exits {
                // Unreachable trailing statements are still type-checked
                // but contribute nothing
            }
            let f = self.analyze_stmt(stmt, env)?;
            if f == Flow::Exits && flow == Flow::Normal {
                flow = Flow::Exits;
            }
        }
        env.pop();
        Ok(flow)
    }

    fn analyze_stmt(&mut self, stmt: &mut Stmt, env: &mut Env) -> Result<Flow> {
        match &mut stmt.kind {
            StmtKind::Expr(e) => {
                self.infer_expr(e, env, None)?;
                Ok(Flow::Normal)
            }
            StmtKind::VarDecl(v) => {
                self.analyze_var_decl(v, env)?;
                Ok(Flow::Normal)
            }
            StmtKind::Assign { target, value } => {
                self.analyze_assign(target, value, env, &stmt.pos)?;
                Ok(Flow::Normal)
            }
            StmtKind::If {
                arms,
                else_body,
                else_unreachable,
            } => self.analyze_if(arms, else_body, else_unreachable, env),
            StmtKind::While { cond, body } => {
                self.analyze_while(cond, body, env)?;
                Ok(Flow::Normal)
            }
            StmtKind::ForRange {
                var,
                start,
                end,
                body,
            } => {
                self.analyze_for_range(var, start, end, body, env)?;
                Ok(Flow::Normal)
            }
            StmtKind::ForIn { var, iter, body } => {
                self.analyze_for_in(var, iter, body, env, &stmt.pos)?;
                Ok(Flow::Normal)
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &stmt.pos,
                        "break/continue outside of a loop",
                    ));
                }
                // The state on this path still reaches the loop's join
                if let Some(joins) = self.loop_joins.last_mut() {
                    joins.push(env.clone());
                }
                Ok(Flow::Exits)
            }
            StmtKind::Return(value) => {
                let want = if self.current_is_coroutine {
                    match &self.current_ret {
                        Type::Coroutine(inner) => (**inner).clone(),
                        other => other.clone(),
                    }
                } else {
                    self.current_ret.clone()
                };
                match value {
                    Some(e) => {
                        let got = self.infer_expr(e, env, Some(&want))?;
                        if !self.accepts(&want, &got) {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                &stmt.pos,
                                format!("cannot return {} from a function returning {}", got, want),
                            ));
                        }
                    }
                    None => {
                        if self.resolve(&want) != Type::Void && !self.current_is_coroutine {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                &stmt.pos,
                                format!("missing return value of type {}", want),
                            ));
                        }
                    }
                }
                Ok(Flow::Exits)
            }
            StmtKind::Yield(e) => {
                if !self.current_is_coroutine {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &stmt.pos,
                        "yield outside of a coroutine function",
                    ));
                }
                let want = match &self.current_ret {
                    Type::Coroutine(inner) => (**inner).clone(),
                    other => other.clone(),
                };
                let got = self.infer_expr(e, env, Some(&want))?;
                if !self.accepts(&want, &got) {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &stmt.pos,
                        format!("cannot yield {} from coroutine[{}]", got, want),
                    ));
                }
                Ok(Flow::Normal)
            }
            StmtKind::Defer(block) => {
                // Defers run at scope exit; analyze them in the current
                // environment for type errors, but their assignments do
                // not flow back
                let mut defer_env = env.clone();
                self.analyze_block(block, &mut defer_env)?;
                Ok(Flow::Normal)
            }
            StmtKind::Comptime(_) => {
                // Already executed and cleared by the comptime expansion
                // pass; anything left is a pipeline bug
                Err(self.err(
                    ErrorKind::Internal,
                    &stmt.pos,
                    "comptime block survived expansion",
                ))
            }
            StmtKind::Block(b) => self.analyze_block(b, env),
        }
    }

    fn analyze_var_decl(&mut self, v: &mut VarDecl, env: &mut Env) -> Result<()> {
        if env.last().is_some_and(|s| s.contains_key(&v.name)) {
            return Err(self.err(
                ErrorKind::TypeMismatch,
                &v.pos,
                format!("'{}' is already declared in this scope", v.name),
            ));
        }
        let declared = match &v.ty {
            Some(te) => Some(self.resolve_type(te, &v.pos)?),
            None => None,
        };
        let mut range = None;
        let mut nil = NilState::Unknown;
        let mut array_len = None;
        let ty = match (&declared, &mut v.init) {
            (Some(want), Some(init)) => {
                let got = self.infer_expr(init, env, Some(want))?;
                if !self.accepts(want, &got) {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &v.pos,
                        format!("cannot initialize '{}: {}' with {}", v.name, want, got),
                    ));
                }
                range = init.range;
                nil = self.nil_of(init, env);
                array_len = self.static_len(init, env);
                want.clone()
            }
            (Some(want), None) => want.clone(),
            (None, Some(init)) => {
                let got = self.infer_expr(init, env, None)?;
                range = init.range;
                nil = self.nil_of(init, env);
                array_len = self.static_len(init, env);
                got
            }
            (None, None) => {
                return Err(self.err(
                    ErrorKind::TypeMismatch,
                    &v.pos,
                    format!("variable '{}' needs a type or initializer", v.name),
                ))
            }
        };
        v.resolved_ty = Some(ty.clone());
        if let Some(scope) = env.last_mut() {
            scope.insert(
                v.name.clone(),
                VarInfo {
                    ty,
                    mutable: v.mutable,
                    initialized: v.init.is_some(),
                    range,
                    nil,
                    array_len,
                },
            );
        }
        Ok(())
    }

    fn analyze_assign(
        &mut self,
        target: &mut Expr,
        value: &mut Expr,
        env: &mut Env,
        pos: &Position,
    ) -> Result<()> {
        // Targets other than plain variables are ordinary expressions
        match &mut target.kind {
            ExprKind::Ident(name) => {
                let name = name.clone();
                let info = match env_lookup(env, &name).or_else(|| self.globals.get(&name)) {
                    Some(info) => info.clone(),
                    None => {
                        return Err(self.err(
                            ErrorKind::UnknownName,
                            pos,
                            format!("assignment to undeclared variable '{}'", name),
                        ))
                    }
                };
                if !info.mutable && info.initialized {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        pos,
                        format!("cannot assign to immutable '{}'", name),
                    ));
                }
                let got = self.infer_expr(value, env, Some(&info.ty))?;
                if !self.accepts(&info.ty, &got) {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        pos,
                        format!("cannot assign {} to '{}: {}'", got, name, info.ty),
                    ));
                }
                target.ty = Some(info.ty.clone());
                let range = value.range;
                let nil = self.nil_of(value, env);
                let array_len = self.static_len(value, env);
                if let Some(slot) = env_lookup_mut(env, &name) {
                    slot.initialized = true;
                    slot.range = range;
                    slot.nil = nil;
                    slot.array_len = array_len;
                } else if let Some(slot) = self.globals.get_mut(&name) {
                    // Cross-function mutation keeps globals rangeless
                    slot.initialized = true;
                }
                Ok(())
            }
            ExprKind::Index { .. } | ExprKind::Field { .. } | ExprKind::Deref(_) => {
                let want = self.infer_expr(target, env, None)?;
                let got = self.infer_expr(value, env, Some(&want))?;
                if !self.accepts(&want, &got) {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        pos,
                        format!("cannot assign {} to location of type {}", got, want),
                    ));
                }
                Ok(())
            }
            _ => Err(self.err(ErrorKind::TypeMismatch, pos, "invalid assignment target")),
        }
    }

    fn analyze_if(
        &mut self,
        arms: &mut [IfArm],
        else_body: &mut Option<Block>,
        else_unreachable: &mut bool,
        env: &mut Env,
    ) -> Result<Flow> {
        let mut taken = false; // a previous condition was statically true
        let mut joined: Option<Env> = None;
        let mut all_exit = true;
        let mut any_reachable = false;

        // Environment in which each next condition is evaluated: all
        // previous conditions were false
        let mut fallthrough = env.clone();

        for arm in arms.iter_mut() {
            if taken {
                arm.unreachable = true;
                continue;
            }
            self.infer_expr(&mut arm.cond, &mut fallthrough, Some(&Type::Bool))?;
            let cond_ty = arm.cond.type_of();
            if self.resolve(&cond_ty) != Type::Bool {
                return Err(self.err(
                    ErrorKind::TypeMismatch,
                    &arm.cond.pos,
                    format!("condition must be bool, found {}", cond_ty),
                ));
            }
            match self.static_truth(&arm.cond, &fallthrough) {
                Some(false) => {
                    // Dead branch: skip its body entirely so unsafe
                    // operations inside cannot raise obligations
                    arm.unreachable = true;
                    continue;
                }
                Some(true) => {
                    taken = true;
                }
                None => {}
            }
            any_reachable = true;
            let mut branch_env = fallthrough.clone();
            self.narrow_env(&arm.cond, true, &mut branch_env);
            let flow = self.analyze_block(&mut arm.body, &mut branch_env)?;
            if flow == Flow::Normal {
                all_exit = false;
                joined = Some(match joined {
                    Some(j) => merge_env(&j, &branch_env),
                    None => branch_env,
                });
            }
            self.narrow_env(&arm.cond, false, &mut fallthrough);
        }

        if taken {
            // A condition held statically; the else never runs
            *else_unreachable = true;
        } else if let Some(body) = else_body {
            any_reachable = true;
            let mut branch_env = fallthrough.clone();
            let flow = self.analyze_block(body, &mut branch_env)?;
            if flow == Flow::Normal {
                all_exit = false;
                joined = Some(match joined {
                    Some(j) => merge_env(&j, &branch_env),
                    None => branch_env,
                });
            }
        } else {
            // No else: falling through with every condition false is a
            // normal path
            all_exit = false;
            joined = Some(match joined {
                Some(j) => merge_env(&j, &fallthrough),
                None => fallthrough.clone(),
            });
        }

        if let Some(j) = joined {
            *env = j;
        }
        if any_reachable && all_exit && (else_body.is_some() || taken) {
            Ok(Flow::Exits)
        } else {
            Ok(Flow::Normal)
        }
    }

    /// Bounded fix-point for while loops: up to three narrowing rounds,
    /// then widening of any range still in motion, then a final sound
    /// pass that raises obligations.
    fn analyze_while(&mut self, cond: &mut Expr, body: &mut Block, env: &mut Env) -> Result<()> {
        let baseline = env.clone();
        let mut loop_env = env.clone();
        let mut stabilized = false;
        for _round in 0..3 {
            let mut trial = loop_env.clone();
            self.speculative += 1;
            self.loop_depth += 1;
            self.loop_joins.push(Vec::new());
            let round_result = match self.infer_expr(cond, &mut trial, Some(&Type::Bool)) {
                Ok(_) => {
                    self.narrow_env(cond, true, &mut trial);
                    self.analyze_block(body, &mut trial)
                }
                Err(e) => Err(e),
            };
            let joins = self.loop_joins.pop().unwrap_or_default();
            self.loop_depth -= 1;
            self.speculative -= 1;
            if round_result.is_err() {
                // Hard type errors reproduce in the final pass
                break;
            }
            let mut merged = merge_env(&loop_env, &trial);
            for join in &joins {
                merged = merge_env(&merged, join);
            }
            if merged == loop_env {
                stabilized = true;
                break;
            }
            loop_env = merged;
        }
        if !stabilized {
            // Widen every range that moved since loop entry
            for (scope, base_scope) in loop_env.iter_mut().zip(baseline.iter()) {
                for (name, info) in scope.iter_mut() {
                    if let (Some(r), Some(base)) = (
                        info.range,
                        base_scope.get(name).and_then(|b| b.range),
                    ) {
                        info.range = Some(r.widen(&base));
                        if info.range != Some(r) {
                            debug!(var = %name, "widened loop range");
                        }
                    }
                }
            }
        }

        // Final pass with the sound environment
        *env = loop_env;
        self.infer_expr(cond, env, Some(&Type::Bool))?;
        if self.resolve(&cond.type_of()) != Type::Bool {
            return Err(self.err(
                ErrorKind::TypeMismatch,
                &cond.pos,
                format!("loop condition must be bool, found {}", cond.type_of()),
            ));
        }
        let mut body_env = env.clone();
        self.narrow_env(cond, true, &mut body_env);
        self.loop_depth += 1;
        self.loop_joins.push(Vec::new());
        let result = self.analyze_block(body, &mut body_env);
        let joins = self.loop_joins.pop().unwrap_or_default();
        self.loop_depth -= 1;
        result?;
        *env = merge_env(env, &body_env);
        // Normal exit sees the condition false; break paths do not
        self.narrow_env(cond, false, env);
        for join in &joins {
            *env = merge_env(env, join);
        }
        Ok(())
    }

    fn analyze_for_range(
        &mut self,
        var: &str,
        start: &mut Expr,
        end: &mut Expr,
        body: &mut Block,
        env: &mut Env,
    ) -> Result<()> {
        let st = self.infer_expr(start, env, Some(&Type::Int))?;
        let et = self.infer_expr(end, env, Some(&Type::Int))?;
        if self.resolve(&st) != Type::Int || self.resolve(&et) != Type::Int {
            return Err(self.err(
                ErrorKind::TypeMismatch,
                &start.pos,
                format!("range bounds must be int, found {} and {}", st, et),
            ));
        }
        let sr = start.range.unwrap_or_else(Range::full);
        let er = end.range.unwrap_or_else(Range::full);
        // Half-open [start, end): the variable never reaches `end`
        let var_range = Range::new(sr.lo, sr.lo.max(er.hi.saturating_sub(1)));

        let run_body = |this: &mut Self, body: &mut Block, env: &mut Env| -> Result<Flow> {
            env.push(Scope::new());
            if let Some(scope) = env.last_mut() {
                scope.insert(
                    var.to_string(),
                    VarInfo {
                        ty: Type::Int,
                        mutable: false,
                        initialized: true,
                        range: Some(var_range),
                        nil: NilState::Unknown,
                        array_len: None,
                    },
                );
            }
            this.loop_depth += 1;
            let flow = this.analyze_block(body, env);
            this.loop_depth -= 1;
            env.pop();
            flow
        };

        let baseline = env.clone();
        let mut loop_env = env.clone();
        let mut stabilized = false;
        for _round in 0..3 {
            let mut trial = loop_env.clone();
            self.speculative += 1;
            self.loop_joins.push(Vec::new());
            let round = run_body(self, body, &mut trial);
            let joins = self.loop_joins.pop().unwrap_or_default();
            self.speculative -= 1;
            if round.is_err() {
                break;
            }
            let mut merged = merge_env(&loop_env, &trial);
            for join in &joins {
                merged = merge_env(&merged, join);
            }
            if merged == loop_env {
                stabilized = true;
                break;
            }
            loop_env = merged;
        }
        if !stabilized {
            for (scope, base_scope) in loop_env.iter_mut().zip(baseline.iter()) {
                for (name, info) in scope.iter_mut() {
                    if let (Some(r), Some(base)) =
                        (info.range, base_scope.get(name).and_then(|b| b.range))
                    {
                        info.range = Some(r.widen(&base));
                    }
                }
            }
        }
        *env = loop_env.clone();
        let mut final_env = loop_env;
        self.loop_joins.push(Vec::new());
        let final_result = run_body(self, body, &mut final_env);
        let joins = self.loop_joins.pop().unwrap_or_default();
        final_result?;
        *env = merge_env(env, &final_env);
        for join in &joins {
            *env = merge_env(env, join);
        }
        Ok(())
    }

    fn analyze_for_in(
        &mut self,
        var: &str,
        iter: &mut Expr,
        body: &mut Block,
        env: &mut Env,
        pos: &Position,
    ) -> Result<()> {
        let it = self.infer_expr(iter, env, None)?;
        let elem = match self.resolve(&it) {
            Type::Array(elem) => *elem,
            Type::Str => Type::Char,
            other => {
                return Err(self.err(
                    ErrorKind::TypeMismatch,
                    pos,
                    format!("cannot iterate over {}", other),
                ))
            }
        };

        let run_body = |this: &mut Self, body: &mut Block, env: &mut Env| -> Result<Flow> {
            env.push(Scope::new());
            if let Some(scope) = env.last_mut() {
                let range = if elem == Type::Int {
                    Some(Range::full())
                } else {
                    None
                };
                scope.insert(
                    var.to_string(),
                    VarInfo {
                        ty: elem.clone(),
                        mutable: false,
                        initialized: true,
                        range,
                        nil: NilState::Unknown,
                        array_len: None,
                    },
                );
            }
            this.loop_depth += 1;
            let flow = this.analyze_block(body, env);
            this.loop_depth -= 1;
            env.pop();
            flow
        };

        let baseline = env.clone();
        let mut loop_env = env.clone();
        let mut stabilized = false;
        for _round in 0..3 {
            let mut trial = loop_env.clone();
            self.speculative += 1;
            self.loop_joins.push(Vec::new());
            let round = run_body(self, body, &mut trial);
            let joins = self.loop_joins.pop().unwrap_or_default();
            self.speculative -= 1;
            if round.is_err() {
                break;
            }
            let mut merged = merge_env(&loop_env, &trial);
            for join in &joins {
                merged = merge_env(&merged, join);
            }
            if merged == loop_env {
                stabilized = true;
                break;
            }
            loop_env = merged;
        }
        if !stabilized {
            for (scope, base_scope) in loop_env.iter_mut().zip(baseline.iter()) {
                for (name, info) in scope.iter_mut() {
                    if let (Some(r), Some(base)) =
                        (info.range, base_scope.get(name).and_then(|b| b.range))
                    {
                        info.range = Some(r.widen(&base));
                    }
                }
            }
        }
        *env = loop_env.clone();
        let mut final_env = loop_env;
        self.loop_joins.push(Vec::new());
        let final_result = run_body(self, body, &mut final_env);
        let joins = self.loop_joins.pop().unwrap_or_default();
        final_result?;
        *env = merge_env(env, &final_env);
        for join in &joins {
            *env = merge_env(env, join);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Narrowing and static truth
    // ------------------------------------------------------------------

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

    /// Statically decide a condition from literal values and proven
    /// ranges; `None` when undecidable
    fn static_truth(&self, cond: &Expr, env: &Env) -> Option<bool> {
        match &cond.kind {
            ExprKind::Bool(b) => Some(*b),
            ExprKind::Unary {
                op: UnOp::Not,
                operand,
            } => self.static_truth(operand, env).map(|b| !b),
            ExprKind::Binary { op, lhs, rhs } => {
                let cmp = Self::cmp_of(*op)?;
                let lr = self.range_of(lhs, env)?;
                let rr = self.range_of(rhs, env)?;
                lr.compare(cmp, &rr)
            }
            _ => None,
        }
    }

    fn range_of(&self, e: &Expr, env: &Env) -> Option<Range> {
        if let Some(r) = e.range {
            return Some(r);
        }
        if let ExprKind::Ident(name) = &e.kind {
            return env_lookup(env, name).and_then(|v| v.range);
        }
        None
    }

    /// Narrow ranges and nil states under the assumption that `cond`
    /// evaluated to `assume`
    fn narrow_env(&self, cond: &Expr, assume: bool, env: &mut Env) {
        match &cond.kind {
            ExprKind::Unary {
                op: UnOp::Not,
                operand,
            } => self.narrow_env(operand, !assume, env),
            ExprKind::Binary {
                op: BinOp::And,
                lhs,
                rhs,
            } if assume => {
                self.narrow_env(lhs, true, env);
                self.narrow_env(rhs, true, env);
            }
            ExprKind::Binary {
                op: BinOp::Or,
                lhs,
                rhs,
            } if !assume => {
                self.narrow_env(lhs, false, env);
                self.narrow_env(rhs, false, env);
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let Some(cmp) = Self::cmp_of(*op) else { return };
                let cmp = if assume { cmp } else { cmp.negated() };

                // Nil-state narrowing: `x == nil` / `x != nil`
                if matches!(cmp, CmpOp::Eq | CmpOp::Ne) {
                    let (var, other) = match (&lhs.kind, &rhs.kind) {
                        (ExprKind::Ident(n), ExprKind::Nil) => (Some(n), true),
                        (ExprKind::Nil, ExprKind::Ident(n)) => (Some(n), true),
                        _ => (None, false),
                    };
                    if let (Some(name), true) = (var, other) {
                        if let Some(info) = env_lookup_mut(env, name) {
                            info.nil = if cmp == CmpOp::Eq {
                                NilState::Nil
                            } else {
                                NilState::NonNil
                            };
                        }
                        return;
                    }
                }

                // Range narrowing on `x <op> e` / `e <op> x`
                if let ExprKind::Ident(name) = &lhs.kind {
                    if let Some(rr) = self.range_of(rhs, env) {
                        if let Some(info) = env_lookup_mut(env, name) {
                            if let Some(cur) = info.range {
                                if let Some(narrowed) = cur.narrow(cmp, &rr) {
                                    info.range = Some(narrowed);
                                }
                            }
                        }
                    }
                }
                if let ExprKind::Ident(name) = &rhs.kind {
                    if let Some(lr) = self.range_of(lhs, env) {
                        if let Some(info) = env_lookup_mut(env, name) {
                            if let Some(cur) = info.range {
                                if let Some(narrowed) = cur.narrow(cmp.swapped(), &lr) {
                                    info.range = Some(narrowed);
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Resolve `Named` indirection one level at a time
    fn resolve(&self, ty: &Type) -> Type {
        let mut current = ty.clone();
        let mut fuel = 16;
        while fuel > 0 {
            match current {
                Type::Named(name) => match self.types.get(&name) {
                    Some(t) if *t != Type::Named(name.clone()) => current = t.clone(),
                    _ => return Type::Named(name),
                },
                Type::Generic(name) => match self.bindings.get(&name) {
                    Some(t) => current = t.clone(),
                    None => return Type::Generic(name),
                },
                other => return other,
            }
            fuel -= 1;
        }
        current
    }

    /// Resolve `Named` indirection through every structural layer.
    /// Nominal types (objects, enums, distincts) resolve at the top but
    /// keep their field types as written, so recursive objects
    /// terminate.
    fn normalize(&self, ty: &Type) -> Type {
        match self.resolve(ty) {
            Type::Array(i) => Type::Array(Box::new(self.normalize(&i))),
            Type::Option(i) => Type::Option(Box::new(self.normalize(&i))),
            Type::Result(i) => Type::Result(Box::new(self.normalize(&i))),
            Type::Ref(i) => Type::Ref(Box::new(self.normalize(&i))),
            Type::Weak(i) => Type::Weak(Box::new(self.normalize(&i))),
            Type::Coroutine(i) => Type::Coroutine(Box::new(self.normalize(&i))),
            Type::Channel(i) => Type::Channel(Box::new(self.normalize(&i))),
            Type::Tuple(elems) => {
                Type::Tuple(elems.iter().map(|t| self.normalize(t)).collect())
            }
            Type::Union(variants) => {
                Type::union_of(variants.iter().map(|t| self.normalize(t)).collect())
            }
            Type::Function { params, ret } => Type::Function {
                params: params.iter().map(|t| self.normalize(t)).collect(),
                ret: Box::new(self.normalize(&ret)),
            },
            other => other,
        }
    }

    fn accepts(&self, want: &Type, got: &Type) -> bool {
        let want = self.normalize(want);
        let got = self.normalize(got);
        if want.accepts(&got) {
            return true;
        }
        // err/none constructors without context type their payload Void
        match (&want, &got) {
            (Type::Result(_), Type::Result(inner)) if **inner == Type::Void => true,
            (Type::Option(_), Type::Option(inner)) if **inner == Type::Void => true,
            _ => false,
        }
    }

    fn nil_of(&self, e: &Expr, env: &Env) -> NilState {
        match &e.kind {
            ExprKind::Nil => NilState::Nil,
            ExprKind::New { .. } => NilState::NonNil,
            ExprKind::Ident(name) => env_lookup(env, name).map(|v| v.nil).unwrap_or(NilState::Unknown),
            _ => NilState::Unknown,
        }
    }

    fn static_len(&self, e: &Expr, env: &Env) -> Option<i64> {
        match &e.kind {
            ExprKind::ArrayLit(elems) | ExprKind::TupleLit(elems) => Some(elems.len() as i64),
            ExprKind::Str(s) => Some(s.len() as i64),
            ExprKind::Ident(name) => env_lookup(env, name).and_then(|v| v.array_len),
            _ => None,
        }
    }

    fn obligation(
        &self,
        kind: ErrorKind,
        pos: &Position,
        msg: impl Into<String>,
    ) -> Result<()> {
        if self.speculative > 0 {
            // Deferred to the final non-speculative pass
            return Ok(());
        }
        Err(self.err(kind, pos, msg))
    }

    fn infer_expr(&mut self, e: &mut Expr, env: &mut Env, expected: Option<&Type>) -> Result<Type> {
        let ty = self.infer_expr_inner(e, env, expected)?;
        e.ty = Some(ty.clone());
        Ok(ty)
    }

    fn infer_expr_inner(
        &mut self,
        e: &mut Expr,
        env: &mut Env,
        expected: Option<&Type>,
    ) -> Result<Type> {
        let pos = e.pos.clone();
        match &mut e.kind {
            ExprKind::Nil => Ok(Type::nil()),
            ExprKind::NoneLit => {
                let inner = match expected.map(|t| self.resolve(t)) {
                    Some(Type::Option(inner)) => *inner,
                    _ => Type::Void,
                };
                Ok(Type::Option(Box::new(inner)))
            }
            ExprKind::Int(v) => {
                e.range = Some(Range::exact(*v));
                Ok(Type::Int)
            }
            ExprKind::Float(_) => Ok(Type::Float),
            ExprKind::Bool(_) => Ok(Type::Bool),
            ExprKind::Char(_) => Ok(Type::Char),
            ExprKind::Str(_) => Ok(Type::Str),
            ExprKind::Ident(name) => {
                if name.as_str() == "none" {
                    e.kind = ExprKind::NoneLit;
                    let inner = match expected.map(|t| self.resolve(t)) {
                        Some(Type::Option(inner)) => *inner,
                        _ => Type::Void,
                    };
                    return Ok(Type::Option(Box::new(inner)));
                }
                let name = name.clone();
                self.infer_ident(e, &name, env, &pos)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let op = *op;
                // Detach children so both sides can be borrowed mutably
                let mut l = std::mem::take(lhs);
                let mut r = std::mem::take(rhs);
                let result = self.infer_binary(op, l.as_mut(), r.as_mut(), env, &pos, expected);
                *lhs = l;
                *rhs = r;
                let (ty, range) = result?;
                e.range = range;
                Ok(ty)
            }
            ExprKind::Unary { op, operand } => {
                let op = *op;
                let t = self.infer_boxed(operand, env, expected)?;
                match op {
                    UnOp::Neg => {
                        let rt = self.resolve(&t);
                        if !rt.is_numeric() {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                &pos,
                                format!("cannot negate {}", t),
                            ));
                        }
                        if rt == Type::Int {
                            if let Some(r) = operand.range {
                                let neg = r.neg();
                                if !neg.fits_i64() {
                                    self.obligation(
                                        ErrorKind::Overflow,
                                        &pos,
                                        format!("negation of {} overflows int", r),
                                    )?;
                                }
                                e.range = Some(neg);
                            }
                        }
                        Ok(rt)
                    }
                    UnOp::Not => {
                        if self.resolve(&t) != Type::Bool {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                &pos,
                                format!("'not' needs a bool, found {}", t),
                            ));
                        }
                        Ok(Type::Bool)
                    }
                }
            }
            ExprKind::Call { .. } => self.infer_call(e, env, expected),
            ExprKind::Wrap { kind, value } => {
                // Re-analysis of an already-rewritten node
                let kind = *kind;
                let vt = self.infer_boxed(value, env, None)?;
                Ok(self.wrap_type(kind, vt, expected))
            }
            ExprKind::Index { base, index } => {
                let bt = self.infer_boxed(base, env, None)?;
                let bt = self.resolve(&bt);
                match bt {
                    Type::Tuple(elems) => {
                        let it = self.infer_boxed(index, env, None)?;
                        if self.resolve(&it) != Type::Int {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                &pos,
                                "tuple index must be int",
                            ));
                        }
                        let idx = match index.range.and_then(|r| r.as_exact()) {
                            Some(v) => v,
                            None => {
                                return Err(self.err(
                                    ErrorKind::TypeMismatch,
                                    &pos,
                                    "tuple index must be a compile-time constant",
                                ))
                            }
                        };
                        if idx < 0 || idx as usize >= elems.len() {
                            return Err(self.err(
                                ErrorKind::OutOfBounds,
                                &pos,
                                format!("tuple index {} out of bounds for {} elements", idx, elems.len()),
                            ));
                        }
                        Ok(elems[idx as usize].clone())
                    }
                    Type::Array(elem) => {
                        let it = self.infer_boxed(index, env, None)?;
                        if self.resolve(&it) != Type::Int {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                &pos,
                                format!("array index must be int, found {}", it),
                            ));
                        }
                        self.check_index_bounds(base, index, env, &pos)?;
                        Ok(*elem)
                    }
                    Type::Str => {
                        let it = self.infer_boxed(index, env, None)?;
                        if self.resolve(&it) != Type::Int {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                &pos,
                                "string index must be int",
                            ));
                        }
                        self.check_index_bounds(base, index, env, &pos)?;
                        Ok(Type::Char)
                    }
                    other => Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("cannot index {}", other),
                    )),
                }
            }
            ExprKind::Slice { base, lo, hi } => {
                let bt = self.infer_boxed(base, env, None)?;
                let bt = self.resolve(&bt);
                if !matches!(bt, Type::Array(_) | Type::Str) {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("cannot slice {}", bt),
                    ));
                }
                for bound in [lo, hi].into_iter().flatten() {
                    let t = self.infer_boxed(bound, env, None)?;
                    if self.resolve(&t) != Type::Int {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &pos,
                            "slice bounds must be int",
                        ));
                    }
                }
                Ok(bt)
            }
            ExprKind::Field { base, name } => {
                let name = name.clone();
                // Enum member access: `Color.red`
                if let ExprKind::Ident(type_name) = &base.kind {
                    if let Some(ty) = self.types.get(type_name).cloned() {
                        let resolved = self.resolve(&ty);
                        if let Type::Enum { members, .. } = &resolved {
                            let member = members.iter().find(|m| m.name == name);
                            return match member {
                                Some(m) => {
                                    e.range = Some(Range::exact(m.int_val));
                                    Ok(resolved.clone())
                                }
                                None => Err(self.err(
                                    ErrorKind::UnknownName,
                                    &pos,
                                    format!("enum {} has no member '{}'", type_name, name),
                                )),
                            };
                        }
                    }
                }
                let bt = self.infer_boxed(base, env, None)?;
                let mut bt = self.resolve(&bt);
                // Field access auto-derefs one level of proven-non-nil ref
                if let Type::Ref(inner) = &bt {
                    self.require_non_nil(base, env, &pos)?;
                    bt = self.resolve(inner);
                }
                match &bt {
                    Type::Object { name: oname, fields } => {
                        match fields.iter().find(|f| f.name == name) {
                            Some(f) => Ok(f.ty.clone()),
                            None => Err(self.err(
                                ErrorKind::UnknownName,
                                &pos,
                                format!("object {} has no field '{}'", oname, name),
                            )),
                        }
                    }
                    other => Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("{} has no fields", other),
                    )),
                }
            }
            ExprKind::ArrayLit(elems) => {
                let expected_elem = match expected.map(|t| self.resolve(t)) {
                    Some(Type::Array(inner)) => Some(*inner),
                    _ => None,
                };
                let mut elem_ty = expected_elem.clone();
                let mut elems_taken = std::mem::take(elems);
                for el in elems_taken.iter_mut() {
                    let t = self.infer_expr(el, env, elem_ty.as_ref())?;
                    match &elem_ty {
                        None => elem_ty = Some(t),
                        Some(want) => {
                            if !self.accepts(want, &t) {
                                return Err(self.err(
                                    ErrorKind::TypeMismatch,
                                    &el.pos,
                                    format!("array element {} does not match element type {}", t, want),
                                ));
                            }
                        }
                    }
                }
                if let ExprKind::ArrayLit(slot) = &mut e.kind {
                    *slot = elems_taken;
                }
                Ok(Type::Array(Box::new(elem_ty.unwrap_or(Type::Void))))
            }
            ExprKind::TupleLit(elems) => {
                let mut tys = Vec::new();
                let mut elems_taken = std::mem::take(elems);
                for el in elems_taken.iter_mut() {
                    tys.push(self.infer_expr(el, env, None)?);
                }
                if let ExprKind::TupleLit(slot) = &mut e.kind {
                    *slot = elems_taken;
                }
                Ok(Type::Tuple(tys))
            }
            ExprKind::ObjectLit { type_name, fields } => {
                let type_name = type_name.clone();
                let ty = match self.types.get(&type_name).cloned() {
                    Some(t) => self.resolve(&t),
                    None => {
                        return Err(self.err(
                            ErrorKind::UnknownName,
                            &pos,
                            format!("unknown type '{}'", type_name),
                        ))
                    }
                };
                let obj_fields = match &ty {
                    Type::Object { fields, .. } => fields.clone(),
                    other => {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &pos,
                            format!("{} is not an object type", other),
                        ))
                    }
                };
                let mut fields_taken = std::mem::take(fields);
                let mut seen = HashSet::new();
                for (fname, fexpr) in fields_taken.iter_mut() {
                    let decl = obj_fields.iter().find(|f| f.name == *fname).ok_or_else(|| {
                        self.err(
                            ErrorKind::UnknownName,
                            &fexpr.pos,
                            format!("object {} has no field '{}'", type_name, fname),
                        )
                    })?;
                    if !seen.insert(fname.clone()) {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &fexpr.pos,
                            format!("duplicate field '{}'", fname),
                        ));
                    }
                    let want = decl.ty.clone();
                    let got = self.infer_expr(fexpr, env, Some(&want))?;
                    if !self.accepts(&want, &got) {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &fexpr.pos,
                            format!("field '{}' expects {}, found {}", fname, want, got),
                        ));
                    }
                }
                for f in &obj_fields {
                    if seen.contains(&f.name) {
                        continue;
                    }
                    if !f.has_default {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &pos,
                            format!("missing field '{}' in {} literal", f.name, type_name),
                        ));
                    }
                    // Fill defaults in so codegen sees a complete literal
                    let key = (type_name.clone(), f.name.clone());
                    if let Some(default) = self.object_defaults.get(&key).cloned() {
                        let mut expr = default;
                        let want = f.ty.clone();
                        self.infer_expr(&mut expr, env, Some(&want))?;
                        fields_taken.push((f.name.clone(), expr));
                    }
                }
                if let ExprKind::ObjectLit { fields: slot, .. } = &mut e.kind {
                    *slot = fields_taken;
                }
                Ok(ty)
            }
            ExprKind::Deref(inner) => {
                let t = self.infer_boxed(inner, env, None)?;
                match self.resolve(&t) {
                    Type::Ref(target) => {
                        self.require_non_nil(inner, env, &pos)?;
                        Ok(*target)
                    }
                    Type::Weak(_) => Err(self.err(
                        ErrorKind::NilDeref,
                        &pos,
                        "weak references must be promoted with a match before dereference",
                    )),
                    other => Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("cannot dereference {}", other),
                    )),
                }
            }
            ExprKind::New { ty, init } => {
                let declared = match ty {
                    Some(te) => Some(self.resolve_type(te, &pos)?),
                    None => None,
                };
                let inner = match (declared, init) {
                    (Some(want), Some(init)) => {
                        let got = self.infer_boxed(init, env, Some(&want))?;
                        if !self.accepts(&want, &got) {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                &pos,
                                format!("cannot initialize new {} with {}", want, got),
                            ));
                        }
                        want
                    }
                    (Some(want), None) => want,
                    (None, Some(init)) => self.infer_boxed(init, env, None)?,
                    (None, None) => {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &pos,
                            "new needs a type or an initializer",
                        ))
                    }
                };
                Ok(Type::Ref(Box::new(inner)))
            }
            ExprKind::Lambda(decl) => {
                let mut decl_taken = std::mem::replace(decl.as_mut(), placeholder_fn(&pos));
                let ty = self.infer_lambda(&mut decl_taken, env, &pos)?;
                e.resolved = Some(decl_taken.name.clone());
                if let ExprKind::Lambda(slot) = &mut e.kind {
                    **slot = decl_taken;
                }
                Ok(ty)
            }
            ExprKind::Match { scrutinee, arms } => {
                let st = self.infer_boxed(scrutinee, env, None)?;
                let st = self.resolve(&st);
                let payload = match &st {
                    Type::Option(inner) => (**inner).clone(),
                    Type::Result(inner) => (**inner).clone(),
                    other => {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &pos,
                            format!("match needs option[T] or result[T], found {}", other),
                        ))
                    }
                };
                let is_result = matches!(st, Type::Result(_));
                let mut arms_taken = std::mem::take(arms);
                let mut joined: Option<Env> = None;
                let mut result_ty: Option<Type> = None;
                for arm in arms_taken.iter_mut() {
                    let valid = match (&arm.pattern, is_result) {
                        (MatchPattern::Ok(_) | MatchPattern::Err(_), true) => true,
                        (MatchPattern::Some(_) | MatchPattern::None, false) => true,
                        (MatchPattern::Wildcard, _) => true,
                        _ => false,
                    };
                    if !valid {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &arm.pos,
                            format!("pattern does not match scrutinee type {}", st),
                        ));
                    }
                    let mut branch_env = env.clone();
                    branch_env.push(Scope::new());
                    let binding = match &arm.pattern {
                        MatchPattern::Ok(n) | MatchPattern::Some(n) => {
                            Some((n.clone(), payload.clone()))
                        }
                        MatchPattern::Err(n) => Some((n.clone(), Type::Str)),
                        _ => None,
                    };
                    if let Some((bname, bty)) = binding {
                        if bname != "_" {
                            if let Some(scope) = branch_env.last_mut() {
                                scope.insert(
                                    bname,
                                    VarInfo {
                                        range: if bty == Type::Int {
                                            Some(Range::full())
                                        } else {
                                            None
                                        },
                                        ty: bty,
                                        mutable: false,
                                        initialized: true,
                                        nil: NilState::Unknown,
                                        array_len: None,
                                    },
                                );
                            }
                        }
                    }
                    let flow = self.analyze_block(&mut arm.body, &mut branch_env)?;
                    branch_env.pop();
                    if flow == Flow::Normal {
                        joined = Some(match joined {
                            Some(j) => merge_env(&j, &branch_env),
                            None => branch_env,
                        });
                    }
                    // The arm value is its trailing expression, if any
                    let arm_ty = arm
                        .body
                        .stmts
                        .last()
                        .and_then(|s| match &s.kind {
                            StmtKind::Expr(ex) => ex.ty.clone(),
                            _ => None,
                        })
                        .unwrap_or(Type::Void);
                    result_ty = Some(match result_ty {
                        None => arm_ty,
                        Some(prev) if self.accepts(&prev, &arm_ty) => prev,
                        Some(prev) if self.accepts(&arm_ty, &prev) => arm_ty,
                        Some(_) => Type::Void,
                    });
                }
                if let Some(j) = joined {
                    *env = j;
                }
                if let ExprKind::Match { arms: slot, .. } = &mut e.kind {
                    *slot = arms_taken;
                }
                Ok(result_ty.unwrap_or(Type::Void))
            }
            ExprKind::Spawn { callee, args } => {
                let callee = callee.clone();
                let mut args_taken = std::mem::take(args);
                let (mangled, ret) = self.resolve_user_call(&callee, &mut args_taken, env, &pos)?;
                let sig = self.mangled.get(&mangled).cloned();
                let is_coroutine = sig.map(|s| s.is_coroutine).unwrap_or(false);
                if !is_coroutine {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("spawn target '{}' is not a coroutine function", callee),
                    ));
                }
                e.resolved = Some(mangled);
                if let ExprKind::Spawn { args: slot, .. } = &mut e.kind {
                    *slot = args_taken;
                }
                Ok(ret)
            }
            ExprKind::Resume(coro) => {
                let t = self.infer_boxed(coro, env, None)?;
                match self.resolve(&t) {
                    Type::Coroutine(inner) => Ok(Type::Result(inner)),
                    other => Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("resume needs coroutine[T], found {}", other),
                    )),
                }
            }
            ExprKind::Cast { expr, ty } => {
                let target = self.resolve_type(ty, &pos)?;
                let src = self.infer_boxed(expr, env, None)?;
                self.check_cast(&src, &target, &pos)?;
                if self.resolve(&target) == Type::Int {
                    e.range = Some(expr.range.unwrap_or_else(Range::full));
                }
                Ok(target)
            }
            ExprKind::Propagate(inner) => {
                let t = self.infer_boxed(inner, env, None)?;
                match self.resolve(&t) {
                    Type::Result(payload) => {
                        if !matches!(self.resolve(&self.current_ret), Type::Result(_)) {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                &pos,
                                "'?' requires the enclosing function to return result[T]",
                            ));
                        }
                        Ok(*payload)
                    }
                    Type::Option(payload) => {
                        if !matches!(self.resolve(&self.current_ret), Type::Option(_)) {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                &pos,
                                "'?' on option requires the enclosing function to return option[T]",
                            ));
                        }
                        Ok(*payload)
                    }
                    other => Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("'?' needs result[T] or option[T], found {}", other),
                    )),
                }
            }
            ExprKind::Len(inner) => {
                let t = self.infer_boxed(inner, env, None)?;
                match self.resolve(&t) {
                    Type::Array(_) | Type::Str | Type::Tuple(_) => {
                        let len = self.static_len(inner, env);
                        e.range = Some(match len {
                            Some(n) => Range::exact(n),
                            None => Range::new(0, i64::MAX as i128),
                        });
                        Ok(Type::Int)
                    }
                    other => Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("# needs an array, string or tuple, found {}", other),
                    )),
                }
            }
            ExprKind::Comptime(_) => Err(self.err(
                ErrorKind::Internal,
                &pos,
                "comptime expression survived expansion",
            )),
        }
    }

    fn infer_boxed(
        &mut self,
        e: &mut Box<Expr>,
        env: &mut Env,
        expected: Option<&Type>,
    ) -> Result<Type> {
        self.infer_expr(e.as_mut(), env, expected)
    }

    fn infer_ident(
        &mut self,
        e: &mut Expr,
        name: &str,
        env: &mut Env,
        pos: &Position,
    ) -> Result<Type> {
        if let Some(info) = env_lookup(env, name) {
            if !info.initialized {
                return Err(self.err(
                    ErrorKind::Uninitialized,
                    pos,
                    format!("'{}' may be read before it is assigned", name),
                ));
            }
            e.range = info.range;
            return Ok(info.ty.clone());
        }
        // Capture from an enclosing function (lambda analysis)
        if let Some(outer) = self.enclosing.last() {
            if let Some(info) = env_lookup(outer, name) {
                let info = info.clone();
                if !info.initialized {
                    return Err(self.err(
                        ErrorKind::Uninitialized,
                        pos,
                        format!("captured '{}' may be read before it is assigned", name),
                    ));
                }
                if let Some(sink) = self.capture_sink.last_mut() {
                    if !sink.iter().any(|(n, _)| n == name) {
                        sink.push((name.to_string(), info.ty.clone()));
                    }
                }
                // Make it visible for the rest of the lambda body
                if let Some(scope) = env.first_mut() {
                    scope.insert(
                        name.to_string(),
                        VarInfo {
                            ty: info.ty.clone(),
                            mutable: false,
                            initialized: true,
                            range: info.range,
                            nil: info.nil,
                            array_len: None,
                        },
                    );
                }
                e.range = info.range;
                return Ok(info.ty);
            }
        }
        if let Some(info) = self.globals.get(name) {
            e.range = info.range;
            return Ok(info.ty.clone());
        }
        // A bare function name is a first-class function value
        if let Some(sigs) = self.sigs.get(name) {
            if let Some(sig) = sigs.first() {
                if sig.type_params.is_empty() {
                    e.resolved = Some(sig.mangled.clone());
                    return Ok(Type::Function {
                        params: sig.params.iter().map(|p| p.ty.clone()).collect(),
                        ret: Box::new(sig.ret.clone()),
                    });
                }
            }
        }
        // Enum type name, for `Color.red` style access
        if self.types.contains_key(name) {
            return Ok(Type::TypeDesc);
        }
        Err(self.err(
            ErrorKind::UnknownName,
            pos,
            format!("unknown name '{}'", name),
        ))
    }

    fn wrap_type(&self, kind: WrapKind, payload: Type, expected: Option<&Type>) -> Type {
        match kind {
            WrapKind::Some => Type::Option(Box::new(payload)),
            WrapKind::Ok => Type::Result(Box::new(payload)),
            WrapKind::Err => match expected.map(|t| self.resolve(t)) {
                Some(Type::Result(inner)) => Type::Result(inner),
                _ => Type::Result(Box::new(Type::Void)),
            },
        }
    }

    fn require_non_nil(&self, e: &Expr, env: &Env, pos: &Position) -> Result<()> {
        let state = self.nil_of(e, env);
        match state {
            NilState::NonNil => Ok(()),
            NilState::Nil => Err(self.err(
                ErrorKind::NilDeref,
                pos,
                "reference is nil here",
            )),
            NilState::Unknown => Err(self.err(
                ErrorKind::NilDeref,
                pos,
                "reference must be checked against nil before use",
            )),
        }
    }

    fn check_index_bounds(
        &mut self,
        base: &Expr,
        index: &Expr,
        env: &Env,
        pos: &Position,
    ) -> Result<()> {
        let Some(len) = self.static_len(base, env) else {
            // Length unknown statically: the VM's index opcodes carry the
            // runtime bounds check
            return Ok(());
        };
        let idx = self
            .range_of(index, env)
            .unwrap_or_else(Range::full);
        let valid = Range::new(0, (len as i128 - 1).max(-1));
        if len == 0 || idx.lo < valid.lo || idx.hi > valid.hi {
            return self.obligation(
                ErrorKind::OutOfBounds,
                pos,
                format!(
                    "index range {} not provably within [0, {}) for length-{} value",
                    idx, len, len
                ),
            );
        }
        Ok(())
    }

    fn check_cast(&self, src: &Type, target: &Type, pos: &Position) -> Result<()> {
        let s = self.resolve(src);
        let t = self.resolve(target);
        let ok = match (&s, &t) {
            _ if s == t => true,
            (Type::Int, Type::Float) | (Type::Float, Type::Int) => true,
            (Type::Int, Type::Char) | (Type::Char, Type::Int) => true,
            (Type::Enum { .. }, Type::Int) | (Type::Int, Type::Enum { .. }) => true,
            (Type::Distinct { base, .. }, other) => self.resolve(base) == *other,
            (other, Type::Distinct { base, .. }) => self.resolve(base) == *other,
            // Strong promotion of a weak; yields nil when the target died
            (Type::Weak(a), Type::Ref(b)) => self.resolve(a) == self.resolve(b),
            (Type::Union(variants), other) => variants.iter().any(|v| self.resolve(v) == *other),
            (other, Type::Union(variants)) => variants.iter().any(|v| self.resolve(v) == *other),
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(self.err(
                ErrorKind::InvalidCast,
                pos,
                format!("cannot cast {} to {}", s, t),
            ))
        }
    }

    // ------------------------------------------------------------------
    // Binary operators and the prover obligations
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn infer_binary(
        &mut self,
        op: BinOp,
        lhs: &mut Expr,
        rhs: &mut Expr,
        env: &mut Env,
        pos: &Position,
        expected: Option<&Type>,
    ) -> Result<(Type, Option<Range>)> {
        match op {
            BinOp::And | BinOp::Or => {
                let lt = self.infer_expr(lhs, env, Some(&Type::Bool))?;
                // The right side sees the left's narrowing (`x != nil and @x > 0`)
                let mut rhs_env = env.clone();
                self.narrow_env(lhs, op == BinOp::And, &mut rhs_env);
                let rt = self.infer_expr(rhs, &mut rhs_env, Some(&Type::Bool))?;
                if self.resolve(&lt) != Type::Bool || self.resolve(&rt) != Type::Bool {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        pos,
                        format!("'{}' needs bool operands, found {} and {}", op.symbol(), lt, rt),
                    ));
                }
                Ok((Type::Bool, None))
            }
            BinOp::In | BinOp::NotIn => {
                let et = self.infer_expr(lhs, env, None)?;
                let ct = self.infer_expr(rhs, env, None)?;
                let valid = match self.resolve(&ct) {
                    Type::Array(elem) => self.accepts(&elem, &et),
                    Type::Str => self.resolve(&et) == Type::Str,
                    _ => false,
                };
                if !valid {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        pos,
                        format!("'{}' not supported for {} in {}", op.symbol(), et, ct),
                    ));
                }
                Ok((Type::Bool, None))
            }
            _ if op.is_comparison() => {
                let lt = self.infer_expr(lhs, env, None)?;
                let rt = self.infer_expr(rhs, env, Some(&lt))?;
                let ls = self.resolve(&lt);
                let rs = self.resolve(&rt);
                let comparable = ls == rs
                    || (ls.is_numeric() && rs.is_numeric())
                    || (matches!(op, BinOp::Eq | BinOp::Ne)
                        && (ls.is_reference() && rs.is_nil()
                            || rs.is_reference() && ls.is_nil()));
                if !comparable {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        pos,
                        format!("cannot compare {} with {}", lt, rt),
                    ));
                }
                Ok((Type::Bool, None))
            }
            _ => {
                // Arithmetic
                let expect_elem = match expected.map(|t| self.resolve(t)) {
                    Some(t @ (Type::Int | Type::Float)) => Some(t),
                    _ => None,
                };
                let lt = self.infer_expr(lhs, env, expect_elem.as_ref())?;
                let rt = self.infer_expr(rhs, env, Some(&lt))?;
                let ls = self.resolve(&lt);
                let rs = self.resolve(&rt);
                match (&ls, &rs) {
                    (Type::Str, Type::Str) if op == BinOp::Add => Ok((Type::Str, None)),
                    (Type::Array(a), Type::Array(b)) if op == BinOp::Add => {
                        if !self.accepts(a, b) && !self.accepts(b, a) {
                            return Err(self.err(
                                ErrorKind::TypeMismatch,
                                pos,
                                format!("cannot concatenate {} with {}", lt, rt),
                            ));
                        }
                        Ok((ls.clone(), None))
                    }
                    (Type::Int, Type::Int) => {
                        let lr = self.range_of(lhs, env).unwrap_or_else(Range::full);
                        let rr = self.range_of(rhs, env).unwrap_or_else(Range::full);
                        let range = self.int_arith_range(op, &lr, &rr, pos)?;
                        Ok((Type::Int, Some(range)))
                    }
                    (a, b) if a.is_numeric() && b.is_numeric() => Ok((Type::Float, None)),
                    _ => Err(self.err(
                        ErrorKind::TypeMismatch,
                        pos,
                        format!(
                            "operator '{}' not supported for {} and {}",
                            op.symbol(),
                            lt,
                            rt
                        ),
                    )),
                }
            }
        }
    }

    /// Interval transfer for integer arithmetic, raising the prover's
    /// div-by-zero and overflow obligations
    fn int_arith_range(
        &self,
        op: BinOp,
        lr: &Range,
        rr: &Range,
        pos: &Position,
    ) -> Result<Range> {
        let range = match op {
            BinOp::Add => lr.add(rr),
            BinOp::Sub => lr.sub(rr),
            BinOp::Mul => lr.mul(rr),
            BinOp::Div | BinOp::Mod => {
                if rr.contains(0) {
                    self.obligation(
                        ErrorKind::DivByZero,
                        pos,
                        format!("divisor range {} includes zero", rr),
                    )?;
                    // Speculative round: continue with an unknown result
                    return Ok(Range::top());
                }
                if op == BinOp::Div {
                    lr.div(rr)
                } else {
                    lr.rem(rr)
                }
            }
            BinOp::Pow => match rr.as_exact() {
                Some(exp) if (0..=u32::MAX as i64).contains(&exp) => lr.pow(exp as u32),
                _ => Range::top(),
            },
            _ => Range::top(),
        };
        if !range.fits_i64() {
            self.obligation(
                ErrorKind::Overflow,
                pos,
                format!("result range {} does not fit in int", range),
            )?;
            return Ok(Range::top());
        }
        Ok(range)
    }

    // ------------------------------------------------------------------
    // Calls, overloads, monomorphization
    // ------------------------------------------------------------------

    fn infer_call(&mut self, e: &mut Expr, env: &mut Env, expected: Option<&Type>) -> Result<Type> {
        let pos = e.pos.clone();
        let (callee, mut args) = match &mut e.kind {
            ExprKind::Call { callee, args } => {
                (std::mem::take(callee), std::mem::take(args))
            }
            _ => return Err(self.err(ErrorKind::Internal, &pos, "infer_call on non-call")),
        };

        // Constructors: ok/err/some become Wrap nodes
        if let ExprKind::Ident(name) = &callee.kind {
            if let Some(kind) = match name.as_str() {
                "some" => Some(WrapKind::Some),
                "ok" => Some(WrapKind::Ok),
                "err" => Some(WrapKind::Err),
                _ => None,
            } {
                if args.len() != 1 {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("{}() takes exactly one argument", name),
                    ));
                }
                let mut value = args.remove(0);
                let payload_expected = match (kind, expected.map(|t| self.resolve(t))) {
                    (WrapKind::Some, Some(Type::Option(inner))) => Some(*inner),
                    (WrapKind::Ok, Some(Type::Result(inner))) => Some(*inner),
                    (WrapKind::Err, _) => Some(Type::Str),
                    _ => None,
                };
                let vt = self.infer_expr(&mut value, env, payload_expected.as_ref())?;
                if kind == WrapKind::Err && self.resolve(&vt) != Type::Str {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("err() takes a string message, found {}", vt),
                    ));
                }
                let ty = self.wrap_type(kind, vt, expected);
                e.kind = ExprKind::Wrap {
                    kind,
                    value: Box::new(value),
                };
                return Ok(ty);
            }

            // Builtins
            if BUILTINS.contains(&name.as_str()) {
                let name = name.clone();
                let ty = self.infer_builtin(&name, &mut args, env, &pos, e)?;
                e.resolved = Some(format!("@builtin:{}", name));
                if let ExprKind::Call { args: slot, callee: cslot } = &mut e.kind {
                    *slot = args;
                    *cslot = callee;
                }
                return Ok(ty);
            }

            // FFI functions
            if let Some(ffi) = self.ffi.get(name).cloned() {
                if args.len() != ffi.params.len() {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!(
                            "ffi function '{}' takes {} arguments, found {}",
                            ffi.name,
                            ffi.params.len(),
                            args.len()
                        ),
                    ));
                }
                for (arg, want) in args.iter_mut().zip(&ffi.params) {
                    let got = self.infer_expr(arg, env, Some(want))?;
                    if !self.accepts(want, &got) {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &arg.pos,
                            format!("ffi argument expects {}, found {}", want, got),
                        ));
                    }
                }
                e.resolved = Some(format!("@ffi:{}", ffi.name));
                if let ExprKind::Call { args: slot, callee: cslot } = &mut e.kind {
                    *slot = args;
                    *cslot = callee;
                }
                if self.resolve(&ffi.ret) == Type::Int {
                    e.range = Some(Range::full());
                }
                return Ok(ffi.ret);
            }

            // Host callbacks registered through the embedding API
            if self.host.contains(name.as_str()) {
                for arg in args.iter_mut() {
                    self.infer_expr(arg, env, None)?;
                }
                e.resolved = Some(format!("@host:{}", name));
                if let ExprKind::Call { args: slot, callee: cslot } = &mut e.kind {
                    *slot = args;
                    *cslot = callee;
                }
                return Ok(Type::Void);
            }

            // User functions, unless shadowed by a local variable
            let shadowed = env_lookup(env, name).is_some();
            if !shadowed && self.sigs.contains_key(name.as_str()) {
                let name = name.clone();
                let (mangled, ret) = self.resolve_user_call(&name, &mut args, env, &pos)?;
                if self.mangled.get(&mangled).is_some_and(|s| s.is_coroutine) {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("coroutine function '{}' must be started with spawn", name),
                    ));
                }
                e.resolved = Some(mangled);
                if let ExprKind::Call { args: slot, callee: cslot } = &mut e.kind {
                    *slot = args;
                    *cslot = callee;
                }
                if self.resolve(&ret) == Type::Int {
                    e.range = Some(Range::full());
                }
                return Ok(ret);
            }
        }

        // Indirect call through a function-typed value (closures)
        let mut callee = callee;
        let ct = self.infer_expr(&mut callee, env, None)?;
        match self.resolve(&ct) {
            Type::Function { params, ret } => {
                if args.len() != params.len() {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        &pos,
                        format!("function takes {} arguments, found {}", params.len(), args.len()),
                    ));
                }
                for (arg, want) in args.iter_mut().zip(&params) {
                    let got = self.infer_expr(arg, env, Some(want))?;
                    if !self.accepts(want, &got) {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &arg.pos,
                            format!("argument expects {}, found {}", want, got),
                        ));
                    }
                }
                if let ExprKind::Call { args: slot, callee: cslot } = &mut e.kind {
                    *slot = args;
                    *cslot = callee;
                }
                Ok(*ret)
            }
            other => Err(self.err(
                ErrorKind::TypeMismatch,
                &pos,
                format!("cannot call a value of type {}", other),
            )),
        }
    }

    fn infer_builtin(
        &mut self,
        name: &str,
        args: &mut [Expr],
        env: &mut Env,
        pos: &Position,
        e: &mut Expr,
    ) -> Result<Type> {
        match name {
            "print" => {
                if args.len() != 1 {
                    return Err(self.err(ErrorKind::TypeMismatch, pos, "print takes one argument"));
                }
                self.infer_expr(&mut args[0], env, None)?;
                Ok(Type::Void)
            }
            "rand" => {
                if args.len() != 2 {
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        pos,
                        "rand takes (max, min) arguments",
                    ));
                }
                for arg in args.iter_mut() {
                    let t = self.infer_expr(arg, env, Some(&Type::Int))?;
                    if self.resolve(&t) != Type::Int {
                        return Err(self.err(
                            ErrorKind::TypeMismatch,
                            &arg.pos,
                            format!("rand bounds must be int, found {}", t),
                        ));
                    }
                }
                // rand(max, min) is uniform in [min, max]; the prover
                // takes the widest interpretation of the two ranges
                let max_r = self.range_of(&args[0], env).unwrap_or_else(Range::full);
                let min_r = self.range_of(&args[1], env).unwrap_or_else(Range::full);
                e.range = Some(Range::new(min_r.lo.min(max_r.lo), max_r.hi.max(min_r.hi)));
                Ok(Type::Int)
            }
            "len" => {
                if args.len() != 1 {
                    return Err(self.err(ErrorKind::TypeMismatch, pos, "len takes one argument"));
                }
                let t = self.infer_expr(&mut args[0], env, None)?;
                match self.resolve(&t) {
                    Type::Array(_) | Type::Str | Type::Tuple(_) => {
                        e.range = Some(Range::new(0, i64::MAX as i128));
                        Ok(Type::Int)
                    }
                    other => Err(self.err(
                        ErrorKind::TypeMismatch,
                        pos,
                        format!("len needs an array, string or tuple, found {}", other),
                    )),
                }
            }
            "str" => {
                if args.len() != 1 {
                    return Err(self.err(ErrorKind::TypeMismatch, pos, "str takes one argument"));
                }
                self.infer_expr(&mut args[0], env, None)?;
                Ok(Type::Str)
            }
            _ => Err(self.err(ErrorKind::Internal, pos, "unknown builtin")),
        }
    }

    /// Resolve an overloaded or generic user call: pick the single exact
    /// match, or the first overload whose required arity accepts the
    /// argument types. Appends default argument expressions so codegen
    /// sees a complete argument list. Returns (mangled name, return type).
    fn resolve_user_call(
        &mut self,
        name: &str,
        args: &mut Vec<Expr>,
        env: &mut Env,
        pos: &Position,
    ) -> Result<(String, Type)> {
        let mut arg_types = Vec::with_capacity(args.len());
        for arg in args.iter_mut() {
            arg_types.push(self.infer_expr(arg, env, None)?);
        }
        let candidates = self
            .sigs
            .get(name)
            .cloned()
            .ok_or_else(|| self.err(ErrorKind::UnknownName, pos, format!("unknown function '{}'", name)))?;

        // Pass 1: single exact match (same arity, identical types)
        let exact: Vec<&FnSig> = candidates
            .iter()
            .filter(|sig| {
                sig.type_params.is_empty()
                    && sig.params.len() == arg_types.len()
                    && sig
                        .params
                        .iter()
                        .zip(&arg_types)
                        .all(|(p, a)| self.normalize(&p.ty) == self.normalize(a))
            })
            .collect();
        if exact.len() > 1 {
            return Err(self.err(
                ErrorKind::AmbiguousOverload,
                pos,
                format!("ambiguous call to '{}': {} exact matches", name, exact.len()),
            ));
        }
        let chosen: FnSig = if let Some(sig) = exact.first() {
            (*sig).clone()
        } else {
            // Pass 2: first overload whose required arity accepts the
            // argument types (generic binding allowed)
            let mut found = None;
            for sig in &candidates {
                if arg_types.len() < sig.required_arity() || arg_types.len() > sig.params.len() {
                    continue;
                }
                let mut bindings: HashMap<String, Type> = HashMap::new();
                let ok = sig
                    .params
                    .iter()
                    .zip(&arg_types)
                    .all(|(p, a)| self.bind_types(&p.ty, a, &mut bindings));
                if ok && sig.type_params.iter().all(|tp| bindings.contains_key(tp)) {
                    found = Some((sig.clone(), bindings));
                    break;
                }
            }
            match found {
                Some((sig, _)) if sig.type_params.is_empty() => sig,
                Some((sig, bindings)) => {
                    return self.instantiate_generic(sig, bindings, args, env, pos);
                }
                None => {
                    let types: Vec<String> = arg_types.iter().map(|t| t.to_string()).collect();
                    return Err(self.err(
                        ErrorKind::TypeMismatch,
                        pos,
                        format!("no overload of '{}' accepts ({})", name, types.join(", ")),
                    ));
                }
            }
        };

        self.append_defaults(&chosen, args, env)?;
        Ok((chosen.mangled.clone(), chosen.ret.clone()))
    }

    /// Structural binding of generic parameters: `Generic(T)` binds to
    /// the argument type; everything else must be accepted as usual
    fn bind_types(&self, param: &Type, arg: &Type, bindings: &mut HashMap<String, Type>) -> bool {
        match (param, arg) {
            (Type::Generic(name), got) => match bindings.get(name) {
                Some(bound) => self.normalize(bound) == self.normalize(got),
                None => {
                    bindings.insert(name.clone(), got.clone());
                    true
                }
            },
            (Type::Array(p), Type::Array(a)) => self.bind_types(p, a, bindings),
            (Type::Option(p), Type::Option(a)) => self.bind_types(p, a, bindings),
            (Type::Result(p), Type::Result(a)) => self.bind_types(p, a, bindings),
            (Type::Ref(p), Type::Ref(a)) => self.bind_types(p, a, bindings),
            (Type::Weak(p), Type::Weak(a)) => self.bind_types(p, a, bindings),
            (Type::Coroutine(p), Type::Coroutine(a)) => self.bind_types(p, a, bindings),
            (p, a) => self.accepts(p, a),
        }
    }

    fn subst(&self, ty: &Type, bindings: &HashMap<String, Type>) -> Type {
        match ty {
            Type::Generic(name) => bindings.get(name).cloned().unwrap_or_else(|| ty.clone()),
            Type::Array(i) => Type::Array(Box::new(self.subst(i, bindings))),
            Type::Option(i) => Type::Option(Box::new(self.subst(i, bindings))),
            Type::Result(i) => Type::Result(Box::new(self.subst(i, bindings))),
            Type::Ref(i) => Type::Ref(Box::new(self.subst(i, bindings))),
            Type::Weak(i) => Type::Weak(Box::new(self.subst(i, bindings))),
            Type::Coroutine(i) => Type::Coroutine(Box::new(self.subst(i, bindings))),
            Type::Channel(i) => Type::Channel(Box::new(self.subst(i, bindings))),
            Type::Tuple(elems) => {
                Type::Tuple(elems.iter().map(|t| self.subst(t, bindings)).collect())
            }
            Type::Function { params, ret } => Type::Function {
                params: params.iter().map(|t| self.subst(t, bindings)).collect(),
                ret: Box::new(self.subst(ret, bindings)),
            },
            other => other.clone(),
        }
    }

    fn instantiate_generic(
        &mut self,
        template: FnSig,
        bindings: HashMap<String, Type>,
        args: &mut Vec<Expr>,
        env: &mut Env,
        pos: &Position,
    ) -> Result<(String, Type)> {
        let key: Vec<String> = template
            .type_params
            .iter()
            .map(|tp| {
                bindings
                    .get(tp)
                    .map(|t| self.resolve(t).to_string())
                    .unwrap_or_else(|| "?".into())
            })
            .collect();
        let mangled = format!("{}[{}]", template.source_name, key.join(","));

        let inst_sig = FnSig {
            mangled: mangled.clone(),
            source_name: template.source_name.clone(),
            type_params: Vec::new(),
            params: template
                .params
                .iter()
                .map(|p| ParamSig {
                    name: p.name.clone(),
                    ty: self.subst(&p.ty, &bindings),
                    default: p.default.clone(),
                })
                .collect(),
            ret: self.subst(&template.ret, &bindings),
            is_coroutine: template.is_coroutine,
            pos: template.pos.clone(),
        };

        if self.instantiated.insert(mangled.clone()) {
            // Locate the template declaration to clone; instance bodies
            // are analyzed when the queue drains
            let decl = self
                .template_decl(&template)
                .ok_or_else(|| self.err(ErrorKind::Internal, pos, "missing generic template"))?;
            self.mangled.insert(mangled.clone(), inst_sig.clone());
            self.pending.push((mangled.clone(), decl, bindings));
        }

        self.append_defaults(&inst_sig, args, env)?;
        Ok((mangled, inst_sig.ret))
    }

    fn template_decl(&self, sig: &FnSig) -> Option<FunctionDecl> {
        self.templates.get(&sig.mangled).cloned()
    }

    fn append_defaults(&mut self, sig: &FnSig, args: &mut Vec<Expr>, env: &mut Env) -> Result<()> {
        while args.len() < sig.params.len() {
            let param = &sig.params[args.len()];
            let default = match &param.default {
                Some(d) => d.clone(),
                None => break,
            };
            let mut arg = default;
            let want = param.ty.clone();
            self.infer_expr(&mut arg, env, Some(&want))?;
            args.push(arg);
        }
        Ok(())
    }

    fn infer_lambda(
        &mut self,
        decl: &mut FunctionDecl,
        env: &Env,
        pos: &Position,
    ) -> Result<Type> {
        self.lambda_counter += 1;
        let mangled = format!("{}@lambda{}", self.current_fn, self.lambda_counter);
        decl.name = mangled.clone();

        let mut params = Vec::new();
        for p in &decl.params {
            params.push(ParamSig {
                name: p.name.clone(),
                ty: self.resolve_type(&p.ty, &p.pos)?,
                default: None,
            });
        }
        let ret = match &decl.return_type {
            Some(te) => self.resolve_type(te, pos)?,
            None => Type::Void,
        };

        // Analyze the body with the enclosing environment available for
        // capture-by-value
        let mut lambda_env: Env = vec![Scope::new()];
        for p in &params {
            lambda_env[0].insert(
                p.name.clone(),
                VarInfo {
                    range: if self.resolve(&p.ty) == Type::Int {
                        Some(Range::full())
                    } else {
                        None
                    },
                    ty: p.ty.clone(),
                    mutable: false,
                    initialized: true,
                    nil: NilState::Unknown,
                    array_len: None,
                },
            );
        }
        self.enclosing.push(env.clone());
        self.capture_sink.push(Vec::new());
        let saved_ret = std::mem::replace(&mut self.current_ret, ret.clone());
        let saved_coro = std::mem::replace(&mut self.current_is_coroutine, false);
        let flow = self.analyze_block(&mut decl.body, &mut lambda_env);
        self.current_ret = saved_ret;
        self.current_is_coroutine = saved_coro;
        let captures = self.capture_sink.pop().unwrap_or_default();
        self.enclosing.pop();
        let flow = flow?;

        if ret != Type::Void && flow != Flow::Exits {
            return Err(self.err(
                ErrorKind::TypeMismatch,
                pos,
                "lambda does not return a value on all paths",
            ));
        }

        decl.captures = captures.iter().map(|(n, _)| n.clone()).collect();

        // Captures become leading parameters of the lifted function
        let mut full_params: Vec<ParamSig> = captures
            .iter()
            .map(|(n, t)| ParamSig {
                name: n.clone(),
                ty: t.clone(),
                default: None,
            })
            .collect();
        full_params.extend(params.iter().cloned());

        let sig = FnSig {
            mangled: mangled.clone(),
            source_name: mangled.clone(),
            type_params: Vec::new(),
            params: full_params,
            ret: ret.clone(),
            is_coroutine: false,
            pos: pos.clone(),
        };
        self.mangled.insert(mangled.clone(), sig);
        self.lifted.push(decl.clone());

        Ok(Type::Function {
            params: params.into_iter().map(|p| p.ty).collect(),
            ret: Box::new(ret),
        })
    }
}

fn placeholder_fn(pos: &Position) -> FunctionDecl {
    FunctionDecl {
        name: String::new(),
        type_params: Vec::new(),
        params: Vec::new(),
        return_type: None,
        body: Block::default(),
        exported: false,
        captures: Vec::new(),
        pos: pos.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn analyze_source(source: &str) -> Result<(Module, Analysis)> {
        let mut module = parse_module(source, "test.etch")?;
        let analysis = analyze(&mut module, Vec::new(), &[])?;
        Ok((module, analysis))
    }

    fn expect_error(source: &str, kind: ErrorKind) -> CompileError {
        let err = analyze_source(source).unwrap_err();
        assert_eq!(err.kind, kind, "wrong error kind: {}", err);
        err
    }

    #[test]
    fn test_range_proven_division() {
        let (_, _) = analyze_source(
            "fn main() { let d: int = rand(10, 5) print(100 / d) }",
        )
        .unwrap();
    }

    #[test]
    fn test_caught_division() {
        let err = expect_error(
            "fn main() { let d: int = rand(5, 0) print(100 / d) }",
            ErrorKind::DivByZero,
        );
        assert_eq!(err.pos.file, "test.etch");
    }

    #[test]
    fn test_dead_branch_tolerates_unsafe_ops() {
        let (module, _) = analyze_source(
            "fn main() {\n\
               let x: int = rand(100, 50)\n\
               if x > 200 { print(10 / 0) }\n\
               print(\"ok\")\n\
             }",
        )
        .unwrap();
        let main = module.find_function("main").unwrap();
        match &main.body.stmts[1].kind {
            StmtKind::If { arms, .. } => assert!(arms[0].unreachable),
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_statically_true_branch_kills_else() {
        let (module, _) = analyze_source(
            "fn main() { let x = 5 if x < 10 { print(1) } else { print(10 / 0) } }",
        )
        .unwrap();
        let main = module.find_function("main").unwrap();
        match &main.body.stmts[1].kind {
            StmtKind::If {
                else_unreachable, ..
            } => assert!(else_unreachable),
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_narrowing_enables_division() {
        analyze_source(
            "fn f(x: int) { if x > 10 { print(100 / x) } }",
        )
        .unwrap();
    }

    #[test]
    fn test_unnarrowed_param_division_is_caught() {
        expect_error("fn f(x: int) { print(100 / x) }", ErrorKind::DivByZero);
    }

    #[test]
    fn test_overflow_is_caught() {
        expect_error(
            "fn main() { let x = 9223372036854775807 print(x + 1) }",
            ErrorKind::Overflow,
        );
    }

    #[test]
    fn test_uninitialized_read() {
        expect_error(
            "fn main() { var x: int if rand(1, 0) > 0 { x = 1 } print(x) }",
            ErrorKind::Uninitialized,
        );
    }

    #[test]
    fn test_initialized_on_all_paths() {
        analyze_source(
            "fn main() { var x: int if rand(1, 0) > 0 { x = 1 } else { x = 2 } print(x) }",
        )
        .unwrap();
    }

    #[test]
    fn test_nil_deref_unknown_state() {
        expect_error(
            "fn f(r: ref int) { print(@r) }",
            ErrorKind::NilDeref,
        );
    }

    #[test]
    fn test_nil_check_enables_deref() {
        analyze_source("fn f(r: ref int) { if r != nil { print(@r) } }").unwrap();
    }

    #[test]
    fn test_new_is_non_nil() {
        analyze_source("fn main() { let r = new int(5) print(@r) }").unwrap();
    }

    #[test]
    fn test_overload_exact_match() {
        let (_, analysis) = analyze_source(
            "fn f(a: int) -> int { return a }\n\
             fn f(a: string) -> string { return a }\n\
             fn main() { print(f(1)) print(f(\"x\")) }",
        )
        .unwrap();
        assert_eq!(analysis.signatures.get("f").map(|v| v.len()), Some(2));
        assert!(analysis.mangled.contains_key("f"));
        assert!(analysis.mangled.contains_key("f@1"));
    }

    #[test]
    fn test_monomorphization_registers_instances() {
        let (module, analysis) = analyze_source(
            "fn id[T](x: T) -> T { return x }\n\
             fn main() { print(id(1)) print(id(\"s\")) }",
        )
        .unwrap();
        assert!(analysis.mangled.contains_key("id[int]"));
        assert!(analysis.mangled.contains_key("id[string]"));
        assert!(module.find_function("id[int]").is_some());
        assert!(module.find_function("id[string]").is_some());
    }

    #[test]
    fn test_tuple_index_must_be_constant() {
        expect_error(
            "fn f(t: (int, string), i: int) { print(t[i]) }",
            ErrorKind::TypeMismatch,
        );
    }

    #[test]
    fn test_static_array_bounds() {
        expect_error(
            "fn main() { let a = [1, 2, 3] print(a[3]) }",
            ErrorKind::OutOfBounds,
        );
        analyze_source("fn main() { let a = [1, 2, 3] print(a[2]) }").unwrap();
    }

    #[test]
    fn test_coroutine_must_be_spawned() {
        expect_error(
            "fn gen() -> coroutine[int] { yield 1 }\n\
             fn main() { gen() }",
            ErrorKind::TypeMismatch,
        );
    }

    #[test]
    fn test_spawn_and_resume_types() {
        analyze_source(
            "fn gen() -> coroutine[int] { yield 1 }\n\
             fn main() {\n\
               let c = spawn gen()\n\
               match resume(c) { ok(v) => print(v), err(_) => print(-1) }\n\
             }",
        )
        .unwrap();
    }

    #[test]
    fn test_yield_outside_coroutine() {
        expect_error("fn f() { yield 1 }", ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_propagate_requires_result_return() {
        expect_error(
            "fn f() -> result[int] { return ok(1) }\n\
             fn g() { let x = f()? }",
            ErrorKind::TypeMismatch,
        );
        analyze_source(
            "fn f() -> result[int] { return ok(1) }\n\
             fn g() -> result[int] { let x = f()? return ok(x + 0) }",
        )
        .unwrap();
    }

    #[test]
    fn test_immutable_assignment_rejected() {
        expect_error("fn main() { let x = 1 x = 2 }", ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_unknown_name() {
        expect_error("fn main() { print(zork) }", ErrorKind::UnknownName);
    }

    #[test]
    fn test_distinct_requires_cast() {
        expect_error(
            "type Id = distinct int\n\
             fn main() { let i: Id = 5 }",
            ErrorKind::TypeMismatch,
        );
        analyze_source(
            "type Id = distinct int\n\
             fn main() { let i: Id = 5 as Id print(i as int) }",
        )
        .unwrap();
    }

    #[test]
    fn test_invalid_cast() {
        expect_error(
            "fn main() { let s = \"x\" as int }",
            ErrorKind::InvalidCast,
        );
    }

    #[test]
    fn test_while_loop_widening_is_sound() {
        // i is widened to [0, +inf) by the loop; its range still
        // includes zero afterwards, so the division must be rejected
        expect_error(
            "fn main() { var i = 0 while rand(1, 0) > 0 { i = i + 1 } print(10 / i) }",
            ErrorKind::DivByZero,
        );
    }

    #[test]
    fn test_loop_exit_narrowing() {
        // The loop only exits once i >= 10, so dividing by i is safe
        analyze_source("fn main() { var i = 1 while i < 10 { i = i + 1 } print(10 / i) }")
            .unwrap();
    }

    #[test]
    fn test_for_range_var_range() {
        // i in [0, 9]: i + 1 in [1, 10], division is safe
        analyze_source("fn main() { for i in 0..10 { print(100 / (i + 1)) } }").unwrap();
        expect_error(
            "fn main() { for i in 0..10 { print(100 / i) } }",
            ErrorKind::DivByZero,
        );
    }

    #[test]
    fn test_lambda_capture() {
        let (module, analysis) = analyze_source(
            "fn main() { let base = 10 let add = fn(x: int) -> int { return x + base } print(add(5)) }",
        )
        .unwrap();
        let lifted = module.find_function("main@lambda1").unwrap();
        assert_eq!(lifted.captures, vec!["base".to_string()]);
        let sig = analysis.mangled.get("main@lambda1").unwrap();
        assert_eq!(sig.params.len(), 2); // capture + declared param
    }

    #[test]
    fn test_missing_return_detected() {
        expect_error(
            "fn f(x: int) -> int { if x > 0 { return 1 } }",
            ErrorKind::TypeMismatch,
        );
    }

    #[test]
    fn test_object_literal_defaults() {
        analyze_source(
            "type P = object { x: int, y: int = 0 }\n\
             fn main() { let p = P{x: 1} print(p.x) }",
        )
        .unwrap();
        expect_error(
            "type P = object { x: int, y: int = 0 }\n\
             fn main() { let p = P{y: 1} }",
            ErrorKind::TypeMismatch,
        );
    }

    #[test]
    fn test_union_assignability() {
        analyze_source(
            "type Num = int | float\n\
             fn f(n: Num) { }\n\
             fn main() { f(1) f(1.5) }",
        )
        .unwrap();
    }

    #[test]
    fn test_recursive_object_type() {
        analyze_source(
            "type Node = object { value: int, next: ref Node }\n\
             fn main() {\n\
               let a = new Node{value: 1, next: nil}\n\
               let b = new Node{value: 2, next: a}\n\
               @a = Node{value: 3, next: b}\n\
               print(a.value)\n\
             }",
        )
        .unwrap();
    }

    #[test]
    fn test_weak_surface() {
        analyze_source(
            "fn main() {\n\
               var w: weak int = nil\n\
               let r = new int(1)\n\
               w = r\n\
               let s = w as ref int\n\
               if s != nil { print(@s) }\n\
             }",
        )
        .unwrap();
    }

    #[test]
    fn test_enum_member_access() {
        let (module, _) = analyze_source(
            "type Color = enum { red, green = 5, blue }\n\
             fn main() { let c = Color.green print(c as int) }",
        )
        .unwrap();
        let main = module.find_function("main").unwrap();
        match &main.body.stmts[0].kind {
            StmtKind::VarDecl(v) => {
                assert_eq!(v.init.as_ref().unwrap().range, Some(Range::exact(5)));
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }
}
