//! Lexer for Etch source
//!
//! Produces a token stream with a `Position` on every token. Malformed
//! input (unterminated strings, bad escapes, stray characters) surfaces
//! as a structured parse error, never a panic.

use crate::error::{CompileError, Result};
use etch_core::Position;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Ident(String),

    // Keywords
    Fn,
    Var,
    Let,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    Return,
    Defer,
    Match,
    Comptime,
    Import,
    Export,
    Inject,
    Type,
    Object,
    Enum,
    Distinct,
    New,
    Nil,
    True,
    False,
    And,
    Or,
    Not,
    Spawn,
    Resume,
    Yield,
    Ffi,
    As,

    // Operators and punctuation
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Bang,
    Question,
    Hash,
    At,
    Arrow,
    FatArrow,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    DotDot,
    Pipe,

    Eof,
}

impl TokenKind {
    /// Keyword lookup for an identifier-shaped lexeme
    fn keyword(text: &str) -> Option<TokenKind> {
        let kind = match text {
            "fn" => TokenKind::Fn,
            "var" => TokenKind::Var,
            "let" => TokenKind::Let,
            "if" => TokenKind::If,
            "elif" => TokenKind::Elif,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "return" => TokenKind::Return,
            "defer" => TokenKind::Defer,
            "match" => TokenKind::Match,
            "comptime" => TokenKind::Comptime,
            "import" => TokenKind::Import,
            "export" => TokenKind::Export,
            "inject" => TokenKind::Inject,
            "type" => TokenKind::Type,
            "object" => TokenKind::Object,
            "enum" => TokenKind::Enum,
            "distinct" => TokenKind::Distinct,
            "new" => TokenKind::New,
            "nil" => TokenKind::Nil,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "spawn" => TokenKind::Spawn,
            "resume" => TokenKind::Resume,
            "yield" => TokenKind::Yield,
            "ffi" => TokenKind::Ffi,
            "as" => TokenKind::As,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Position,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    file: String,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str, file: &str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            file: file.to_string(),
            line: 0,
            column: 0,
        }
    }

    fn pos(&self) -> Position {
        Position::new(self.file.clone(), self.line, self.column)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn error(&self, pos: Position, message: impl Into<String>) -> CompileError {
        CompileError::parse(pos, message)
    }

    fn escape(&mut self, pos: &Position) -> Result<char> {
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('\\') => Ok('\\'),
            Some('"') => Ok('"'),
            Some('\'') => Ok('\''),
            Some('0') => Ok('\0'),
            Some(c) => Err(self.error(pos.clone(), format!("unknown escape '\\{}'", c))),
            None => Err(self.error(pos.clone(), "unterminated escape sequence")),
        }
    }

    fn number(&mut self, first: char, pos: Position) -> Result<Token> {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        // A '.' starts the fractional part only when followed by a digit;
        // `0..10` must lex as Int DotDot Int.
        let mut is_float = false;
        if self.peek() == Some('.') {
            let mut lookahead = self.chars.clone();
            lookahead.next();
            if lookahead.peek().is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                text.push('.');
                self.bump();
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() || c == '_' {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        let text: String = text.chars().filter(|c| *c != '_').collect();
        let kind = if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| self.error(pos.clone(), format!("invalid float literal '{}'", text)))?;
            TokenKind::Float(value)
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| self.error(pos.clone(), format!("integer literal '{}' out of range", text)))?;
            TokenKind::Int(value)
        };
        Ok(Token { kind, pos })
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        loop {
            // Skip whitespace and // comments
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                    continue;
                }
                Some('/') => {
                    let mut lookahead = self.chars.clone();
                    lookahead.next();
                    if lookahead.peek() == Some(&'/') {
                        while let Some(c) = self.peek() {
                            if c == '\n' {
                                break;
                            }
                            self.bump();
                        }
                        continue;
                    }
                }
                _ => {}
            }
            break;
        }

        let pos = self.pos();
        let c = match self.bump() {
            Some(c) => c,
            None => return Ok(None),
        };

        let kind = match c {
            '+' => TokenKind::Plus,
            '-' => {
                if self.eat('>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.eat('*') {
                    TokenKind::StarStar
                } else {
                    TokenKind::Star
                }
            }
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '=' => {
                if self.eat('=') {
                    TokenKind::EqEq
                } else if self.eat('>') {
                    TokenKind::FatArrow
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.eat('=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                if self.eat('=') {
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.eat('=') {
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '?' => TokenKind::Question,
            '#' => TokenKind::Hash,
            '@' => TokenKind::At,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '|' => TokenKind::Pipe,
            '.' => {
                if self.eat('.') {
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                }
            }
            '"' => {
                let mut value = String::new();
                loop {
                    match self.bump() {
                        Some('"') => break,
                        Some('\\') => value.push(self.escape(&pos)?),
                        Some('\n') | None => {
                            return Err(self.error(pos, "unterminated string literal"));
                        }
                        Some(c) => value.push(c),
                    }
                }
                TokenKind::Str(value)
            }
            '\'' => {
                let value = match self.bump() {
                    Some('\\') => self.escape(&pos)?,
                    Some('\'') | None => {
                        return Err(self.error(pos, "empty character literal"));
                    }
                    Some(c) => c,
                };
                if !self.eat('\'') {
                    return Err(self.error(pos, "unterminated character literal"));
                }
                TokenKind::Char(value)
            }
            c if c.is_ascii_digit() => return self.number(c, pos).map(Some),
            c if c.is_alphabetic() || c == '_' => {
                let mut text = String::new();
                text.push(c);
                while let Some(c) = self.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                TokenKind::keyword(&text).unwrap_or(TokenKind::Ident(text))
            }
            c => {
                return Err(self.error(pos, format!("unexpected character '{}'", c)));
            }
        };

        Ok(Some(Token { kind, pos }))
    }
}

/// Tokenize a source file; the final token is always `Eof`
pub fn tokenize(source: &str, file: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer::new(source, file);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    tokens.push(Token {
        kind: TokenKind::Eof,
        pos: lexer.pos(),
    });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source, "test.etch")
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            kinds("fn main yield"),
            vec![
                TokenKind::Fn,
                TokenKind::Ident("main".into()),
                TokenKind::Yield,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_range_vs_float() {
        assert_eq!(
            kinds("0..10"),
            vec![
                TokenKind::Int(0),
                TokenKind::DotDot,
                TokenKind::Int(10),
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("1.5"), vec![TokenKind::Float(1.5), TokenKind::Eof]);
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("a ** b -> c => d"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::StarStar,
                TokenKind::Ident("b".into()),
                TokenKind::Arrow,
                TokenKind::Ident("c".into()),
                TokenKind::FatArrow,
                TokenKind::Ident("d".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\nb\"c""#),
            vec![TokenKind::Str("a\nb\"c".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_char_literal() {
        assert_eq!(
            kinds(r"'x' '\n'"),
            vec![TokenKind::Char('x'), TokenKind::Char('\n'), TokenKind::Eof]
        );
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = tokenize("\"abc", "t.etch").unwrap_err();
        assert!(err.message.contains("unterminated string"));
        assert_eq!(err.pos.line, 0);
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("1 // comment\n2"),
            vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("a\n  b", "t.etch").unwrap();
        assert_eq!(tokens[0].pos.line, 0);
        assert_eq!(tokens[0].pos.column, 0);
        assert_eq!(tokens[1].pos.line, 1);
        assert_eq!(tokens[1].pos.column, 2);
    }
}
