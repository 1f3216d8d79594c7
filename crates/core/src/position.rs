//! Source positions
//!
//! Every token, AST node, emitted instruction and diagnostic carries a
//! `Position`. Lines and columns are 0-indexed internally and rendered
//! 1-indexed for user display.

use serde::{Deserialize, Serialize};

/// A location in a source file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub file: String,
    /// Line number (0-indexed)
    pub line: u32,
    /// Column number (0-indexed)
    pub column: u32,
}

impl Position {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Position {
            file: file.into(),
            line,
            column,
        }
    }

    /// A position with no file attached (generated code, injected globals)
    pub fn synthetic() -> Self {
        Position::default()
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.file.is_empty() {
            write!(f, "<generated>")
        } else {
            write!(f, "{}:{}:{}", self.file, self.line + 1, self.column + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_one_indexed() {
        let pos = Position::new("main.etch", 0, 4);
        assert_eq!(pos.to_string(), "main.etch:1:5");
    }

    #[test]
    fn test_synthetic_display() {
        assert_eq!(Position::synthetic().to_string(), "<generated>");
    }
}
