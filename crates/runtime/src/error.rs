//! Runtime error type
//!
//! Runtime failures terminate the VM with a formatted message; the pc's
//! debug slot supplies the source position when one exists. Recoverable
//! script-level errors never take this path - they travel as
//! `result[T]` values.

use etch_core::Position;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    pub pos: Option<Position>,
}

impl RuntimeError {
    pub fn msg(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            pos: None,
        }
    }

    pub fn at(message: impl Into<String>, pos: Position) -> Self {
        RuntimeError {
            message: message.into(),
            pos: Some(pos),
        }
    }

    pub fn with_pos(mut self, pos: Option<Position>) -> Self {
        if self.pos.is_none() {
            self.pos = pos;
        }
        self
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.pos {
            Some(pos) => write!(f, "{}: runtime error: {}", pos, self.message),
            None => write!(f, "runtime error: {}", self.message),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_position() {
        let err = RuntimeError::at("division by zero", Position::new("m.etch", 4, 2));
        assert_eq!(err.to_string(), "m.etch:5:3: runtime error: division by zero");
    }
}
