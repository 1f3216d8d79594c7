//! Abstract syntax tree for Etch
//!
//! The parser builds the tree; the analyzer writes `ty`/`range`
//! annotations and dead-branch marks into it. After analysis the tree is
//! read-only for codegen.

use crate::range::Range;
use crate::types::Type;
use etch_core::Position;

/// Syntactic type as written in source; resolved to a semantic `Type`
/// by the analyzer through the per-scope type environment.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    Named(String),
    Array(Box<TypeExpr>),
    Option(Box<TypeExpr>),
    Result(Box<TypeExpr>),
    Ref(Box<TypeExpr>),
    Weak(Box<TypeExpr>),
    Coroutine(Box<TypeExpr>),
    Channel(Box<TypeExpr>),
    Tuple(Vec<TypeExpr>),
    Function(Vec<TypeExpr>, Box<TypeExpr>),
    Union(Vec<TypeExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Import {
    /// `import name`
    Module { name: String, pos: Position },
    /// `import ffi lib { fn sym(a: int) -> int; ... }`
    Ffi {
        library: String,
        funcs: Vec<FfiFnDecl>,
        pos: Position,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FfiFnDecl {
    pub name: String,
    pub params: Vec<(String, TypeExpr)>,
    pub return_type: TypeExpr,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeExpr,
    pub default: Option<Expr>,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    /// Generic type parameters, e.g. `fn id[T](x: T) -> T`
    pub type_params: Vec<String>,
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    pub body: Block,
    pub exported: bool,
    /// For lambdas: enclosing locals captured by value, filled in by the
    /// analyzer
    pub captures: Vec<String>,
    pub pos: Position,
}

impl FunctionDecl {
    /// Number of parameters without a default (required arity)
    pub fn required_arity(&self) -> usize {
        self.params.iter().filter(|p| p.default.is_none()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub mutable: bool,
    pub ty: Option<TypeExpr>,
    pub init: Option<Expr>,
    pub exported: bool,
    /// Semantic type, written by the analyzer
    pub resolved_ty: Option<Type>,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectFieldDecl {
    pub name: String,
    pub ty: TypeExpr,
    pub default: Option<Expr>,
    pub exported: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumMemberDecl {
    pub name: String,
    pub value: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeDeclBody {
    Alias(TypeExpr),
    Object { fields: Vec<ObjectFieldDecl> },
    Enum { members: Vec<EnumMemberDecl> },
    Distinct(TypeExpr),
    Union(Vec<TypeExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDecl {
    pub name: String,
    pub body: TypeDeclBody,
    pub exported: bool,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Function(FunctionDecl),
    Global(VarDecl),
    TypeDef(TypeDecl),
}

impl Decl {
    pub fn pos(&self) -> &Position {
        match self {
            Decl::Function(f) => &f.pos,
            Decl::Global(v) => &v.pos,
            Decl::TypeDef(t) => &t.pos,
        }
    }

    pub fn exported(&self) -> bool {
        match self {
            Decl::Function(f) => f.exported,
            Decl::Global(v) => v.exported,
            Decl::TypeDef(t) => t.exported,
        }
    }
}

/// A parsed module (one source file, plus merged imports after resolution)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub name: String,
    pub file: String,
    pub imports: Vec<Import>,
    pub decls: Vec<Decl>,
}

impl Module {
    pub fn find_function(&self, name: &str) -> Option<&FunctionDecl> {
        self.decls.iter().find_map(|d| match d {
            Decl::Function(f) if f.name == name => Some(f),
            _ => None,
        })
    }

    /// All overloads sharing a name, in declaration order
    pub fn functions_named(&self, name: &str) -> Vec<&FunctionDecl> {
        self.decls
            .iter()
            .filter_map(|d| match d {
                Decl::Function(f) if f.name == name => Some(f),
                _ => None,
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Statements
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfArm {
    pub cond: Expr,
    pub body: Block,
    /// Set by the prover when the condition is statically false; the arm
    /// is skipped by the rest of analysis and by codegen
    pub unreachable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    VarDecl(VarDecl),
    Assign { target: Expr, value: Expr },
    If { arms: Vec<IfArm>, else_body: Option<Block>, else_unreachable: bool },
    While { cond: Expr, body: Block },
    ForRange { var: String, start: Expr, end: Expr, body: Block },
    ForIn { var: String, iter: Expr, body: Block },
    Break,
    Continue,
    Return(Option<Expr>),
    Yield(Expr),
    Defer(Block),
    Comptime(Block),
    Block(Block),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: Position,
}

// ----------------------------------------------------------------------------
// Expressions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
    NotIn,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::In => "in",
            BinOp::NotIn => "not in",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchPattern {
    /// `ok(name)`
    Ok(String),
    /// `err(name)`
    Err(String),
    /// `some(name)`
    Some(String),
    /// `none`
    None,
    /// `_`
    Wildcard,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: MatchPattern,
    pub body: Block,
    pub pos: Position,
}

/// Constructors for option/result values (`some(e)`, `ok(e)`, `err(e)`).
/// The parser sees these as ordinary calls; the analyzer rewrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapKind {
    Some,
    Ok,
    Err,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Nil,
    /// `none` (written by the analyzer from the bare identifier)
    NoneLit,
    /// `some(e)` / `ok(e)` / `err(e)` (written by the analyzer)
    Wrap {
        kind: WrapKind,
        value: Box<Expr>,
    },
    Int(i64),
    Float(f64),
    Bool(bool),
    Char(char),
    Str(String),
    Ident(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        base: Box<Expr>,
        lo: Option<Box<Expr>>,
        hi: Option<Box<Expr>>,
    },
    Field {
        base: Box<Expr>,
        name: String,
    },
    ArrayLit(Vec<Expr>),
    TupleLit(Vec<Expr>),
    ObjectLit {
        type_name: String,
        fields: Vec<(String, Expr)>,
    },
    /// `@e`
    Deref(Box<Expr>),
    /// `new T(init)` / `new(init)`
    New {
        ty: Option<TypeExpr>,
        init: Option<Box<Expr>>,
    },
    Lambda(Box<FunctionDecl>),
    Match {
        scrutinee: Box<Expr>,
        arms: Vec<MatchArm>,
    },
    /// `spawn f(args)`
    Spawn {
        callee: String,
        args: Vec<Expr>,
    },
    /// `resume(c)`
    Resume(Box<Expr>),
    Cast {
        expr: Box<Expr>,
        ty: TypeExpr,
    },
    /// postfix `?`
    Propagate(Box<Expr>),
    /// prefix `#`
    Len(Box<Expr>),
    Comptime(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Position,
    /// Resolved type, written by the analyzer
    pub ty: Option<Type>,
    /// Integer interval, written by the prover for int-typed expressions
    pub range: Option<Range>,
    /// For calls: the mangled name of the resolved overload or generic
    /// instance, written by the analyzer
    pub resolved: Option<String>,
}

impl Default for Expr {
    /// Placeholder used when temporarily detaching child nodes during
    /// analysis; never survives in a finished tree
    fn default() -> Self {
        Expr::new(ExprKind::Nil, Position::synthetic())
    }
}

impl Expr {
    pub fn new(kind: ExprKind, pos: Position) -> Self {
        Expr {
            kind,
            pos,
            ty: None,
            range: None,
            resolved: None,
        }
    }

    /// The resolved type; `Void` before analysis has run
    pub fn type_of(&self) -> Type {
        self.ty.clone().unwrap_or(Type::Void)
    }

    /// True for targets that can appear on the left of `=`
    pub fn is_assignable(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Ident(_) | ExprKind::Index { .. } | ExprKind::Field { .. } | ExprKind::Deref(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_arity_skips_defaults() {
        let pos = Position::synthetic();
        let decl = FunctionDecl {
            name: "f".into(),
            type_params: vec![],
            params: vec![
                Param {
                    name: "a".into(),
                    ty: TypeExpr::Named("int".into()),
                    default: None,
                    pos: pos.clone(),
                },
                Param {
                    name: "b".into(),
                    ty: TypeExpr::Named("int".into()),
                    default: Some(Expr::new(ExprKind::Int(1), pos.clone())),
                    pos: pos.clone(),
                },
            ],
            return_type: None,
            body: Block::default(),
            exported: false,
            captures: vec![],
            pos,
        };
        assert_eq!(decl.required_arity(), 1);
    }

    #[test]
    fn test_assignable_targets() {
        let pos = Position::synthetic();
        let ident = Expr::new(ExprKind::Ident("x".into()), pos.clone());
        assert!(ident.is_assignable());
        let lit = Expr::new(ExprKind::Int(3), pos);
        assert!(!lit.is_assignable());
    }
}
