//! Recursive-descent parser for Etch
//!
//! Consumes the token stream from the lexer and produces a `Module`.
//! All failures are structured parse errors with positions; the parser
//! never panics on malformed input.

use crate::ast::{
    Block, Decl, EnumMemberDecl, Expr, ExprKind, FfiFnDecl, FunctionDecl, IfArm, Import, MatchArm,
    MatchPattern, Module, ObjectFieldDecl, Param, Stmt, StmtKind, TypeDecl, TypeDeclBody, TypeExpr,
    VarDecl, BinOp, UnOp,
};
use crate::error::{CompileError, Result};
use crate::lexer::{tokenize, Token, TokenKind};
use etch_core::Position;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(source: &str, file: &str) -> Result<Self> {
        Ok(Parser {
            tokens: tokenize(source, file)?,
            pos: 0,
        })
    }

    pub fn parse(&mut self) -> Result<Module> {
        let file = self.peek().pos.file.clone();
        let name = std::path::Path::new(&file)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.clone());
        let mut module = Module {
            name,
            file,
            imports: Vec::new(),
            decls: Vec::new(),
        };

        while !self.at(&TokenKind::Eof) {
            if self.at(&TokenKind::Import) {
                module.imports.push(self.import()?);
                continue;
            }
            module.decls.push(self.decl()?);
        }
        Ok(module)
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        // tokenize always appends Eof, so the stream is never empty
        self.tokens.get(self.pos).unwrap_or(&self.tokens[self.tokens.len() - 1])
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek2_kind(&self) -> &TokenKind {
        &self
            .tokens
            .get(self.pos + 1)
            .unwrap_or(&self.tokens[self.tokens.len() - 1])
            .kind
    }

    fn here(&self) -> Position {
        self.peek().pos.clone()
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {}, found {}", what, describe(self.peek_kind()))))
        }
    }

    fn ident(&mut self, what: &str) -> Result<(String, Position)> {
        let pos = self.here();
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, pos))
            }
            other => Err(CompileError::parse(
                pos,
                format!("expected {}, found {}", what, describe(&other)),
            )),
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::parse(self.here(), message)
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn import(&mut self) -> Result<Import> {
        let pos = self.here();
        self.expect(&TokenKind::Import, "'import'")?;
        if self.eat(&TokenKind::Ffi) {
            let (library, _) = self.ident("library name")?;
            self.expect(&TokenKind::LBrace, "'{'")?;
            let mut funcs = Vec::new();
            while !self.eat(&TokenKind::RBrace) {
                if self.at(&TokenKind::Eof) {
                    return Err(self.error("unterminated ffi import block"));
                }
                funcs.push(self.ffi_fn_decl()?);
            }
            Ok(Import::Ffi { library, funcs, pos })
        } else {
            let (name, _) = self.ident("module name")?;
            Ok(Import::Module { name, pos })
        }
    }

    fn ffi_fn_decl(&mut self) -> Result<FfiFnDecl> {
        let pos = self.here();
        self.expect(&TokenKind::Fn, "'fn'")?;
        let (name, _) = self.ident("function name")?;
        self.expect(&TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let (pname, _) = self.ident("parameter name")?;
            self.expect(&TokenKind::Colon, "':'")?;
            let ty = self.type_expr()?;
            params.push((pname, ty));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        let return_type = if self.eat(&TokenKind::Arrow) {
            self.type_expr()?
        } else {
            TypeExpr::Named("void".into())
        };
        self.expect(&TokenKind::Semicolon, "';'")?;
        Ok(FfiFnDecl {
            name,
            params,
            return_type,
            pos,
        })
    }

    fn decl(&mut self) -> Result<Decl> {
        let exported = self.eat(&TokenKind::Export);
        match self.peek_kind() {
            TokenKind::Fn => {
                let mut f = self.function_decl()?;
                f.exported = exported;
                Ok(Decl::Function(f))
            }
            TokenKind::Var | TokenKind::Let => {
                let mut v = self.var_decl()?;
                v.exported = exported;
                Ok(Decl::Global(v))
            }
            TokenKind::Type => {
                let mut t = self.type_decl()?;
                t.exported = exported;
                Ok(Decl::TypeDef(t))
            }
            other => Err(self.error(format!(
                "expected declaration (fn, var, let, type), found {}",
                describe(other)
            ))),
        }
    }

    fn function_decl(&mut self) -> Result<FunctionDecl> {
        let pos = self.here();
        self.expect(&TokenKind::Fn, "'fn'")?;
        let (name, _) = self.ident("function name")?;
        let mut type_params = Vec::new();
        if self.eat(&TokenKind::LBracket) {
            while !self.at(&TokenKind::RBracket) {
                let (p, _) = self.ident("type parameter")?;
                type_params.push(p);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RBracket, "']'")?;
        }
        let params = self.param_list()?;
        let return_type = if self.eat(&TokenKind::Arrow) {
            Some(self.type_expr()?)
        } else {
            None
        };
        let body = self.block()?;
        Ok(FunctionDecl {
            name,
            type_params,
            params,
            return_type,
            body,
            exported: false,
            captures: Vec::new(),
            pos,
        })
    }

    fn param_list(&mut self) -> Result<Vec<Param>> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let (name, pos) = self.ident("parameter name")?;
            self.expect(&TokenKind::Colon, "':'")?;
            let ty = self.type_expr()?;
            let default = if self.eat(&TokenKind::Assign) {
                Some(self.expr()?)
            } else {
                None
            };
            params.push(Param {
                name,
                ty,
                default,
                pos,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(params)
    }

    fn var_decl(&mut self) -> Result<VarDecl> {
        let pos = self.here();
        let mutable = match self.advance().kind {
            TokenKind::Var => true,
            TokenKind::Let => false,
            _ => return Err(CompileError::parse(pos, "expected 'var' or 'let'")),
        };
        let (name, _) = self.ident("variable name")?;
        let ty = if self.eat(&TokenKind::Colon) {
            Some(self.type_expr()?)
        } else {
            None
        };
        let init = if self.eat(&TokenKind::Assign) {
            Some(self.expr()?)
        } else {
            None
        };
        if ty.is_none() && init.is_none() {
            return Err(CompileError::parse(
                pos,
                format!("variable '{}' needs a type annotation or an initializer", name),
            ));
        }
        Ok(VarDecl {
            name,
            mutable,
            ty,
            init,
            exported: false,
            resolved_ty: None,
            pos,
        })
    }

    fn type_decl(&mut self) -> Result<TypeDecl> {
        let pos = self.here();
        self.expect(&TokenKind::Type, "'type'")?;
        let (name, _) = self.ident("type name")?;
        self.expect(&TokenKind::Assign, "'='")?;
        let body = match self.peek_kind() {
            TokenKind::Object => {
                self.advance();
                self.expect(&TokenKind::LBrace, "'{'")?;
                let mut fields = Vec::new();
                while !self.at(&TokenKind::RBrace) {
                    let exported = self.eat(&TokenKind::Export);
                    let (fname, _) = self.ident("field name")?;
                    self.expect(&TokenKind::Colon, "':'")?;
                    let ty = self.type_expr()?;
                    let default = if self.eat(&TokenKind::Assign) {
                        Some(self.expr()?)
                    } else {
                        None
                    };
                    fields.push(ObjectFieldDecl {
                        name: fname,
                        ty,
                        default,
                        exported,
                    });
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "'}'")?;
                TypeDeclBody::Object { fields }
            }
            TokenKind::Enum => {
                self.advance();
                self.expect(&TokenKind::LBrace, "'{'")?;
                let mut members = Vec::new();
                while !self.at(&TokenKind::RBrace) {
                    let (mname, mpos) = self.ident("enum member")?;
                    let value = if self.eat(&TokenKind::Assign) {
                        match self.advance().kind {
                            TokenKind::Int(v) => Some(v),
                            _ => {
                                return Err(CompileError::parse(
                                    mpos,
                                    "enum member value must be an integer literal",
                                ))
                            }
                        }
                    } else {
                        None
                    };
                    members.push(EnumMemberDecl { name: mname, value });
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "'}'")?;
                TypeDeclBody::Enum { members }
            }
            TokenKind::Distinct => {
                self.advance();
                TypeDeclBody::Distinct(self.type_expr()?)
            }
            _ => {
                let first = self.type_expr_no_union()?;
                if self.at(&TokenKind::Pipe) {
                    let mut variants = vec![first];
                    while self.eat(&TokenKind::Pipe) {
                        variants.push(self.type_expr_no_union()?);
                    }
                    TypeDeclBody::Union(variants)
                } else {
                    TypeDeclBody::Alias(first)
                }
            }
        };
        Ok(TypeDecl {
            name,
            body,
            exported: false,
            pos,
        })
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    fn type_expr(&mut self) -> Result<TypeExpr> {
        let first = self.type_expr_no_union()?;
        if self.at(&TokenKind::Pipe) {
            let mut variants = vec![first];
            while self.eat(&TokenKind::Pipe) {
                variants.push(self.type_expr_no_union()?);
            }
            Ok(TypeExpr::Union(variants))
        } else {
            Ok(first)
        }
    }

    fn type_expr_no_union(&mut self) -> Result<TypeExpr> {
        let pos = self.here();
        match self.peek_kind().clone() {
            TokenKind::LParen => {
                self.advance();
                let mut elems = Vec::new();
                while !self.at(&TokenKind::RParen) {
                    elems.push(self.type_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(TypeExpr::Tuple(elems))
            }
            TokenKind::Fn => {
                self.advance();
                self.expect(&TokenKind::LParen, "'('")?;
                let mut params = Vec::new();
                while !self.at(&TokenKind::RParen) {
                    params.push(self.type_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen, "')'")?;
                self.expect(&TokenKind::Arrow, "'->'")?;
                let ret = self.type_expr()?;
                Ok(TypeExpr::Function(params, Box::new(ret)))
            }
            TokenKind::Ident(name) => {
                self.advance();
                match name.as_str() {
                    "array" | "option" | "result" | "coroutine" | "channel" => {
                        self.expect(&TokenKind::LBracket, "'['")?;
                        let inner = self.type_expr()?;
                        self.expect(&TokenKind::RBracket, "']'")?;
                        let inner = Box::new(inner);
                        Ok(match name.as_str() {
                            "array" => TypeExpr::Array(inner),
                            "option" => TypeExpr::Option(inner),
                            "result" => TypeExpr::Result(inner),
                            "coroutine" => TypeExpr::Coroutine(inner),
                            _ => TypeExpr::Channel(inner),
                        })
                    }
                    "ref" => Ok(TypeExpr::Ref(Box::new(self.type_expr_no_union()?))),
                    "weak" => Ok(TypeExpr::Weak(Box::new(self.type_expr_no_union()?))),
                    _ => Ok(TypeExpr::Named(name)),
                }
            }
            other => Err(CompileError::parse(
                pos,
                format!("expected type, found {}", describe(&other)),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn block(&mut self) -> Result<Block> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unterminated block"));
            }
            stmts.push(self.stmt()?);
            // Optional statement separators
            while self.eat(&TokenKind::Semicolon) {}
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Block { stmts })
    }

    fn stmt(&mut self) -> Result<Stmt> {
        let pos = self.here();
        let kind = match self.peek_kind() {
            TokenKind::Var | TokenKind::Let => StmtKind::VarDecl(self.var_decl()?),
            TokenKind::If => self.if_stmt()?,
            TokenKind::While => {
                self.advance();
                let cond = self.expr()?;
                let body = self.block()?;
                StmtKind::While { cond, body }
            }
            TokenKind::For => self.for_stmt()?,
            TokenKind::Break => {
                self.advance();
                StmtKind::Break
            }
            TokenKind::Continue => {
                self.advance();
                StmtKind::Continue
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.at(&TokenKind::RBrace) || self.at(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.expr()?)
                };
                StmtKind::Return(value)
            }
            TokenKind::Yield => {
                self.advance();
                StmtKind::Yield(self.expr()?)
            }
            TokenKind::Defer => {
                self.advance();
                StmtKind::Defer(self.block()?)
            }
            TokenKind::Comptime if self.peek2_kind() == &TokenKind::LBrace => {
                self.advance();
                StmtKind::Comptime(self.block()?)
            }
            TokenKind::LBrace => StmtKind::Block(self.block()?),
            _ => {
                let expr = self.expr()?;
                if self.eat(&TokenKind::Assign) {
                    if !expr.is_assignable() {
                        return Err(CompileError::parse(
                            expr.pos.clone(),
                            "invalid assignment target",
                        ));
                    }
                    let value = self.expr()?;
                    StmtKind::Assign {
                        target: expr,
                        value,
                    }
                } else {
                    StmtKind::Expr(expr)
                }
            }
        };
        Ok(Stmt { kind, pos })
    }

    fn if_stmt(&mut self) -> Result<StmtKind> {
        self.expect(&TokenKind::If, "'if'")?;
        let mut arms = Vec::new();
        let cond = self.expr()?;
        let body = self.block()?;
        arms.push(IfArm {
            cond,
            body,
            unreachable: false,
        });
        let mut else_body = None;
        loop {
            if self.eat(&TokenKind::Elif) {
                let cond = self.expr()?;
                let body = self.block()?;
                arms.push(IfArm {
                    cond,
                    body,
                    unreachable: false,
                });
            } else if self.eat(&TokenKind::Else) {
                else_body = Some(self.block()?);
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If {
            arms,
            else_body,
            else_unreachable: false,
        })
    }

    fn for_stmt(&mut self) -> Result<StmtKind> {
        self.expect(&TokenKind::For, "'for'")?;
        let (var, _) = self.ident("loop variable")?;
        self.expect(&TokenKind::In, "'in'")?;
        let first = self.expr()?;
        if self.eat(&TokenKind::DotDot) {
            let end = self.expr()?;
            let body = self.block()?;
            Ok(StmtKind::ForRange {
                var,
                start: first,
                end,
                body,
            })
        } else {
            let body = self.block()?;
            Ok(StmtKind::ForIn {
                var,
                iter: first,
                body,
            })
        }
    }

    // ------------------------------------------------------------------
    // Expressions (precedence climbing)
    // ------------------------------------------------------------------

    pub fn expr(&mut self) -> Result<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.at(&TokenKind::Or) {
            let pos = self.here();
            self.advance();
            let rhs = self.and_expr()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op: BinOp::Or,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.not_expr()?;
        while self.at(&TokenKind::And) {
            let pos = self.here();
            self.advance();
            let rhs = self.not_expr()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op: BinOp::And,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.at(&TokenKind::Not) {
            let pos = self.here();
            self.advance();
            let operand = self.not_expr()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnOp::Not,
                    operand: Box::new(operand),
                },
                pos,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let lhs = self.additive()?;
        let op = match self.peek_kind() {
            TokenKind::EqEq => Some(BinOp::Eq),
            TokenKind::NotEq => Some(BinOp::Ne),
            TokenKind::Lt => Some(BinOp::Lt),
            TokenKind::Le => Some(BinOp::Le),
            TokenKind::Gt => Some(BinOp::Gt),
            TokenKind::Ge => Some(BinOp::Ge),
            TokenKind::In => Some(BinOp::In),
            TokenKind::Not if self.peek2_kind() == &TokenKind::In => Some(BinOp::NotIn),
            _ => None,
        };
        if let Some(op) = op {
            let pos = self.here();
            self.advance();
            if op == BinOp::NotIn {
                self.advance(); // the 'in' after 'not'
            }
            let rhs = self.additive()?;
            return Ok(Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            ));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            let pos = self.here();
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            let pos = self.here();
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        let pos = self.here();
        match self.peek_kind() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnOp::Neg,
                        operand: Box::new(operand),
                    },
                    pos,
                ))
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnOp::Not,
                        operand: Box::new(operand),
                    },
                    pos,
                ))
            }
            TokenKind::Hash => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::new(ExprKind::Len(Box::new(operand)), pos))
            }
            TokenKind::At => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::new(ExprKind::Deref(Box::new(operand)), pos))
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.postfix()?;
        if self.at(&TokenKind::StarStar) {
            let pos = self.here();
            self.advance();
            // Right-associative
            let exp = self.unary()?;
            return Ok(Expr::new(
                ExprKind::Binary {
                    op: BinOp::Pow,
                    lhs: Box::new(base),
                    rhs: Box::new(exp),
                },
                pos,
            ));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::LParen => {
                    let pos = self.here();
                    let args = self.call_args()?;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        pos,
                    );
                }
                TokenKind::LBracket => {
                    let pos = self.here();
                    self.advance();
                    // Distinguish index, slice, and open-ended slices
                    if self.eat(&TokenKind::Colon) {
                        let hi = if self.at(&TokenKind::RBracket) {
                            None
                        } else {
                            Some(Box::new(self.expr()?))
                        };
                        self.expect(&TokenKind::RBracket, "']'")?;
                        expr = Expr::new(
                            ExprKind::Slice {
                                base: Box::new(expr),
                                lo: None,
                                hi,
                            },
                            pos,
                        );
                        continue;
                    }
                    let first = self.expr()?;
                    if self.eat(&TokenKind::Colon) {
                        let hi = if self.at(&TokenKind::RBracket) {
                            None
                        } else {
                            Some(Box::new(self.expr()?))
                        };
                        self.expect(&TokenKind::RBracket, "']'")?;
                        expr = Expr::new(
                            ExprKind::Slice {
                                base: Box::new(expr),
                                lo: Some(Box::new(first)),
                                hi,
                            },
                            pos,
                        );
                    } else {
                        self.expect(&TokenKind::RBracket, "']'")?;
                        expr = Expr::new(
                            ExprKind::Index {
                                base: Box::new(expr),
                                index: Box::new(first),
                            },
                            pos,
                        );
                    }
                }
                TokenKind::Dot => {
                    let pos = self.here();
                    self.advance();
                    // Tuple index or field name
                    match self.peek_kind().clone() {
                        TokenKind::Int(n) => {
                            self.advance();
                            expr = Expr::new(
                                ExprKind::Index {
                                    base: Box::new(expr),
                                    index: Box::new(Expr::new(ExprKind::Int(n), pos.clone())),
                                },
                                pos,
                            );
                        }
                        _ => {
                            let (name, _) = self.ident("field name")?;
                            expr = Expr::new(
                                ExprKind::Field {
                                    base: Box::new(expr),
                                    name,
                                },
                                pos,
                            );
                        }
                    }
                }
                TokenKind::Question => {
                    let pos = self.here();
                    self.advance();
                    expr = Expr::new(ExprKind::Propagate(Box::new(expr)), pos);
                }
                TokenKind::As => {
                    let pos = self.here();
                    self.advance();
                    let ty = self.type_expr_no_union()?;
                    expr = Expr::new(
                        ExprKind::Cast {
                            expr: Box::new(expr),
                            ty,
                        },
                        pos,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<Vec<Expr>> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        while !self.at(&TokenKind::RParen) {
            args.push(self.expr()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr> {
        let pos = self.here();
        match self.peek_kind().clone() {
            TokenKind::Int(v) => {
                self.advance();
                Ok(Expr::new(ExprKind::Int(v), pos))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(Expr::new(ExprKind::Float(v), pos))
            }
            TokenKind::Char(c) => {
                self.advance();
                Ok(Expr::new(ExprKind::Char(c), pos))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::new(ExprKind::Str(s), pos))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(true), pos))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(false), pos))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::new(ExprKind::Nil, pos))
            }
            TokenKind::LParen => {
                self.advance();
                let first = self.expr()?;
                if self.eat(&TokenKind::Comma) {
                    let mut elems = vec![first];
                    while !self.at(&TokenKind::RParen) {
                        elems.push(self.expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RParen, "')'")?;
                    Ok(Expr::new(ExprKind::TupleLit(elems), pos))
                } else {
                    self.expect(&TokenKind::RParen, "')'")?;
                    Ok(first)
                }
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elems = Vec::new();
                while !self.at(&TokenKind::RBracket) {
                    elems.push(self.expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBracket, "']'")?;
                Ok(Expr::new(ExprKind::ArrayLit(elems), pos))
            }
            TokenKind::New => {
                self.advance();
                // `new Type{...}` carries an object-literal initializer
                if let TokenKind::Ident(name) = self.peek_kind() {
                    if name.chars().next().is_some_and(|c| c.is_uppercase())
                        && self.peek2_kind() == &TokenKind::LBrace
                    {
                        let init = self.primary()?;
                        return Ok(Expr::new(
                            ExprKind::New {
                                ty: None,
                                init: Some(Box::new(init)),
                            },
                            pos,
                        ));
                    }
                }
                // `new T(init)`, `new T`, or `new(init)`
                let ty = if !self.at(&TokenKind::LParen) {
                    Some(self.type_expr_no_union()?)
                } else {
                    None
                };
                let init = if self.at(&TokenKind::LParen) {
                    self.advance();
                    if self.eat(&TokenKind::RParen) {
                        None
                    } else {
                        let e = self.expr()?;
                        self.expect(&TokenKind::RParen, "')'")?;
                        Some(Box::new(e))
                    }
                } else {
                    None
                };
                Ok(Expr::new(ExprKind::New { ty, init }, pos))
            }
            TokenKind::Fn => {
                let decl = self.function_lambda()?;
                Ok(Expr::new(ExprKind::Lambda(Box::new(decl)), pos))
            }
            TokenKind::Match => {
                self.advance();
                let scrutinee = self.expr()?;
                self.expect(&TokenKind::LBrace, "'{'")?;
                let mut arms = Vec::new();
                while !self.at(&TokenKind::RBrace) {
                    arms.push(self.match_arm()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "'}'")?;
                if arms.is_empty() {
                    return Err(CompileError::parse(pos, "match needs at least one arm"));
                }
                Ok(Expr::new(
                    ExprKind::Match {
                        scrutinee: Box::new(scrutinee),
                        arms,
                    },
                    pos,
                ))
            }
            TokenKind::Spawn => {
                self.advance();
                let (callee, _) = self.ident("coroutine function name")?;
                let args = self.call_args()?;
                Ok(Expr::new(ExprKind::Spawn { callee, args }, pos))
            }
            TokenKind::Resume => {
                self.advance();
                self.expect(&TokenKind::LParen, "'('")?;
                let coro = self.expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(Expr::new(ExprKind::Resume(Box::new(coro)), pos))
            }
            TokenKind::Comptime => {
                self.advance();
                self.expect(&TokenKind::LParen, "'('")?;
                let inner = self.expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(Expr::new(ExprKind::Comptime(Box::new(inner)), pos))
            }
            TokenKind::Inject => {
                // inject(...) is only meaningful inside comptime blocks;
                // parse it as a call so the evaluator can handle it
                self.advance();
                let args = self.call_args()?;
                Ok(Expr::new(
                    ExprKind::Call {
                        callee: Box::new(Expr::new(ExprKind::Ident("inject".into()), pos.clone())),
                        args,
                    },
                    pos,
                ))
            }
            TokenKind::Ident(name) => {
                self.advance();
                // Object literal: `Type{field: v, ...}` (uppercase start
                // keeps `if x {` unambiguous)
                if self.at(&TokenKind::LBrace)
                    && name.chars().next().is_some_and(|c| c.is_uppercase())
                {
                    self.advance();
                    let mut fields = Vec::new();
                    while !self.at(&TokenKind::RBrace) {
                        let (fname, _) = self.ident("field name")?;
                        self.expect(&TokenKind::Colon, "':'")?;
                        fields.push((fname, self.expr()?));
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RBrace, "'}'")?;
                    return Ok(Expr::new(
                        ExprKind::ObjectLit {
                            type_name: name,
                            fields,
                        },
                        pos,
                    ));
                }
                Ok(Expr::new(ExprKind::Ident(name), pos))
            }
            other => Err(CompileError::parse(
                pos,
                format!("expected expression, found {}", describe(&other)),
            )),
        }
    }

    fn function_lambda(&mut self) -> Result<FunctionDecl> {
        let pos = self.here();
        self.expect(&TokenKind::Fn, "'fn'")?;
        let params = self.param_list()?;
        let return_type = if self.eat(&TokenKind::Arrow) {
            Some(self.type_expr()?)
        } else {
            None
        };
        let body = self.block()?;
        Ok(FunctionDecl {
            name: String::new(),
            type_params: Vec::new(),
            params,
            return_type,
            body,
            exported: false,
            captures: Vec::new(),
            pos,
        })
    }

    fn match_arm(&mut self) -> Result<MatchArm> {
        let pos = self.here();
        let pattern = match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                match name.as_str() {
                    "ok" | "err" | "some" => {
                        self.expect(&TokenKind::LParen, "'('")?;
                        let (binding, _) = match self.peek_kind() {
                            TokenKind::Ident(_) => self.ident("binding name")?,
                            _ => {
                                return Err(self.error("expected binding name in pattern"));
                            }
                        };
                        self.expect(&TokenKind::RParen, "')'")?;
                        match name.as_str() {
                            "ok" => MatchPattern::Ok(binding),
                            "err" => MatchPattern::Err(binding),
                            _ => MatchPattern::Some(binding),
                        }
                    }
                    "none" => MatchPattern::None,
                    "_" => MatchPattern::Wildcard,
                    other => {
                        return Err(CompileError::parse(
                            pos,
                            format!(
                                "unknown pattern '{}' (expected ok, err, some, none or _)",
                                other
                            ),
                        ))
                    }
                }
            }
            other => {
                return Err(CompileError::parse(
                    pos,
                    format!("expected match pattern, found {}", describe(&other)),
                ))
            }
        };
        self.expect(&TokenKind::FatArrow, "'=>'")?;
        let body = if self.at(&TokenKind::LBrace) {
            self.block()?
        } else {
            let expr_pos = self.here();
            let expr = self.expr()?;
            Block {
                stmts: vec![Stmt {
                    kind: StmtKind::Expr(expr),
                    pos: expr_pos,
                }],
            }
        };
        Ok(MatchArm { pattern, body, pos })
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Int(v) => format!("integer '{}'", v),
        TokenKind::Float(v) => format!("float '{}'", v),
        TokenKind::Str(_) => "string literal".into(),
        TokenKind::Char(_) => "character literal".into(),
        TokenKind::Ident(name) => format!("'{}'", name),
        TokenKind::Eof => "end of file".into(),
        other => format!("'{:?}'", other).to_lowercase(),
    }
}

/// Parse a complete source file into a module
pub fn parse_module(source: &str, file: &str) -> Result<Module> {
    Parser::new(source, file)?.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Module {
        parse_module(source, "test.etch").unwrap()
    }

    #[test]
    fn test_function_decl() {
        let m = parse("fn add(a: int, b: int = 1) -> int { return a + b }");
        let f = m.find_function("add").unwrap();
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.required_arity(), 1);
        assert_eq!(f.return_type, Some(TypeExpr::Named("int".into())));
    }

    #[test]
    fn test_generic_function() {
        let m = parse("fn id[T](x: T) -> T { return x }");
        let f = m.find_function("id").unwrap();
        assert_eq!(f.type_params, vec!["T".to_string()]);
    }

    #[test]
    fn test_if_elif_else() {
        let m = parse("fn f(x: int) { if x > 1 { } elif x > 0 { } else { } }");
        let f = m.find_function("f").unwrap();
        match &f.body.stmts[0].kind {
            StmtKind::If {
                arms, else_body, ..
            } => {
                assert_eq!(arms.len(), 2);
                assert!(else_body.is_some());
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_for_range_and_for_in() {
        let m = parse("fn f() { for i in 0..10 { } for c in \"ab\" { } }");
        let f = m.find_function("f").unwrap();
        assert!(matches!(f.body.stmts[0].kind, StmtKind::ForRange { .. }));
        assert!(matches!(f.body.stmts[1].kind, StmtKind::ForIn { .. }));
    }

    #[test]
    fn test_match_expr() {
        let m = parse("fn f(c: coroutine[int]) { match resume(c) { ok(v) => print(v), err(_) => print(-1) } }");
        let f = m.find_function("f").unwrap();
        match &f.body.stmts[0].kind {
            StmtKind::Expr(e) => match &e.kind {
                ExprKind::Match { arms, .. } => {
                    assert_eq!(arms.len(), 2);
                    assert_eq!(arms[0].pattern, MatchPattern::Ok("v".into()));
                    assert_eq!(arms[1].pattern, MatchPattern::Err("_".into()));
                }
                other => panic!("expected match, got {:?}", other),
            },
            other => panic!("expected expr stmt, got {:?}", other),
        }
    }

    #[test]
    fn test_ffi_import() {
        let m = parse("import ffi m { fn cos(x: float) -> float; fn noop(); }");
        match &m.imports[0] {
            Import::Ffi { library, funcs, .. } => {
                assert_eq!(library, "m");
                assert_eq!(funcs.len(), 2);
                assert_eq!(funcs[1].return_type, TypeExpr::Named("void".into()));
            }
            other => panic!("expected ffi import, got {:?}", other),
        }
    }

    #[test]
    fn test_object_type_and_literal() {
        let m = parse(
            "type Point = object { x: int, y: int = 0 }\n\
             fn f() { let p = Point{x: 1, y: 2} }",
        );
        assert!(matches!(
            m.decls[0],
            Decl::TypeDef(TypeDecl {
                body: TypeDeclBody::Object { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_union_type_decl() {
        let m = parse("type Num = int | float");
        match &m.decls[0] {
            Decl::TypeDef(t) => assert!(matches!(&t.body, TypeDeclBody::Union(v) if v.len() == 2)),
            other => panic!("expected type decl, got {:?}", other),
        }
    }

    #[test]
    fn test_defer_and_spawn() {
        let m = parse("fn f() { defer { print(1) } let c = spawn g(1, 2) }");
        let f = m.find_function("f").unwrap();
        assert!(matches!(f.body.stmts[0].kind, StmtKind::Defer(_)));
    }

    #[test]
    fn test_operators_precedence() {
        let m = parse("fn f() { let x = 1 + 2 * 3 }");
        let f = m.find_function("f").unwrap();
        match &f.body.stmts[0].kind {
            StmtKind::VarDecl(v) => match &v.init.as_ref().unwrap().kind {
                ExprKind::Binary { op: BinOp::Add, rhs, .. } => {
                    assert!(matches!(
                        rhs.kind,
                        ExprKind::Binary { op: BinOp::Mul, .. }
                    ));
                }
                other => panic!("expected add at top, got {:?}", other),
            },
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_postfix_chain() {
        let m = parse("fn f() { let x = a.b[0].c? }");
        assert!(m.find_function("f").is_some());
    }

    #[test]
    fn test_parse_error_has_position() {
        let err = parse_module("fn f( {", "bad.etch").unwrap_err();
        assert_eq!(err.pos.file, "bad.etch");
        assert!(err.to_string().contains("parse error"));
    }

    #[test]
    fn test_slice_forms() {
        let m = parse("fn f(a: array[int]) { let x = a[1:3] let y = a[:2] let z = a[1:] }");
        assert!(m.find_function("f").is_some());
    }

    #[test]
    fn test_new_with_object_literal() {
        let m = parse(
            "type Node = object { next: ref Node }\n\
             fn f() { let n = new Node{next: nil} let r = new int(5) }",
        );
        let f = m.find_function("f").unwrap();
        match &f.body.stmts[0].kind {
            StmtKind::VarDecl(v) => match &v.init.as_ref().unwrap().kind {
                ExprKind::New { ty: None, init: Some(init) } => {
                    assert!(matches!(init.kind, ExprKind::ObjectLit { .. }));
                }
                other => panic!("expected new with object literal, got {:?}", other),
            },
            other => panic!("expected var decl, got {:?}", other),
        }
        match &f.body.stmts[1].kind {
            StmtKind::VarDecl(v) => {
                assert!(matches!(
                    v.init.as_ref().unwrap().kind,
                    ExprKind::New { ty: Some(_), init: Some(_) }
                ));
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_tuple_index() {
        let m = parse("fn f(t: (int, string)) { let x = t.0 }");
        let f = m.find_function("f").unwrap();
        match &f.body.stmts[0].kind {
            StmtKind::VarDecl(v) => {
                assert!(matches!(
                    v.init.as_ref().unwrap().kind,
                    ExprKind::Index { .. }
                ));
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }
}
