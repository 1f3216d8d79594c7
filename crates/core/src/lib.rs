//! Etch core IR
//!
//! Shared foundation for the Etch compiler and VM:
//! - Position: source locations carried by tokens, AST nodes and diagnostics
//! - Instruction: the register-bytecode instruction set and operand formats
//! - Program: compiled unit (instructions, constants, function records)
//! - serialize: bytecode cache encoding with a source-hash header

pub mod instruction;
pub mod position;
pub mod program;
pub mod serialize;

/// Builtin function dispatch ids shared by the compiler and the VM
pub mod builtins {
    pub const PRINT: u16 = 0;
    pub const RAND: u16 = 1;
    pub const LEN: u16 = 2;
    pub const STR: u16 = 3;

    pub fn id_for(name: &str) -> Option<u16> {
        match name {
            "print" => Some(PRINT),
            "rand" => Some(RAND),
            "len" => Some(LEN),
            "str" => Some(STR),
            _ => None,
        }
    }

    pub fn name_for(id: u16) -> Option<&'static str> {
        match id {
            PRINT => Some("print"),
            RAND => Some("rand"),
            LEN => Some("len"),
            STR => Some("str"),
            _ => None,
        }
    }
}

pub use instruction::{CmpOp, FusedOp, Instruction, Opcode, Operands};
pub use position::Position;
pub use program::{Const, DebugInfo, FunctionKind, FunctionRecord, Program, ValueTag};
pub use serialize::{
    deserialize_program, read_header, serialize_program, source_digest, CacheHeader,
    SerializeError, FORMAT_VERSION, MAGIC,
};

/// Compiler version stamped into every serialized program.
///
/// Cache files produced by a different version are recompiled rather
/// than loaded.
pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");
