//! Bytecode serialization
//!
//! Cache files start with a fixed header that can be checked without
//! decoding the program body:
//!
//! ```text
//! magic "ETCX" | format version (u16 le) | compiler version (u8 len + bytes)
//! | source hash (32 bytes) | bincode-encoded Program
//! ```
//!
//! The source hash digests the source text together with the compiler
//! options that affect emitted code, so an option change invalidates the
//! cache exactly like an edit.

use crate::program::Program;
use sha2::{Digest, Sha256};

pub const MAGIC: &[u8; 4] = b"ETCX";
pub const FORMAT_VERSION: u16 = 3;

/// Error during bytecode encode/decode
#[derive(Debug)]
pub enum SerializeError {
    /// File does not start with the ETCX magic
    BadMagic,
    /// Format version this build cannot read
    UnsupportedVersion(u16),
    /// Header ends before all fixed fields
    Truncated,
    /// Bincode encoding/decoding error (preserves the original error)
    Bincode(Box<bincode::Error>),
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializeError::BadMagic => write!(f, "not an etch bytecode file (bad magic)"),
            SerializeError::UnsupportedVersion(v) => {
                write!(f, "unsupported bytecode format version {}", v)
            }
            SerializeError::Truncated => write!(f, "bytecode file truncated"),
            SerializeError::Bincode(e) => write!(f, "bytecode encoding error: {}", e),
        }
    }
}

impl std::error::Error for SerializeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializeError::Bincode(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<bincode::Error> for SerializeError {
    fn from(e: bincode::Error) -> Self {
        SerializeError::Bincode(Box::new(e))
    }
}

/// Parsed fixed-size header of a cache file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHeader {
    pub format_version: u16,
    pub compiler_version: String,
    pub source_hash: [u8; 32],
    /// Offset of the bincode body within the file
    pub body_offset: usize,
}

/// Stable digest of source content plus the compiler options that affect
/// emitted bytecode
pub fn source_digest(source: &str, options_digest: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(options_digest);
    hasher.finalize().into()
}

pub fn serialize_program(program: &Program) -> Result<Vec<u8>, SerializeError> {
    let mut out = Vec::with_capacity(4096);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    let version = program.compiler_version.as_bytes();
    // Compiler version strings are short; 255 bytes is plenty
    let version = &version[..version.len().min(255)];
    out.push(version.len() as u8);
    out.extend_from_slice(version);
    out.extend_from_slice(&program.source_hash);
    let body = bincode::serialize(program)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse just the header, leaving the body untouched.
///
/// The cache layer uses this to decide staleness without paying for a
/// full decode.
pub fn read_header(bytes: &[u8]) -> Result<CacheHeader, SerializeError> {
    if bytes.len() < 4 {
        return Err(SerializeError::Truncated);
    }
    if &bytes[0..4] != MAGIC {
        return Err(SerializeError::BadMagic);
    }
    if bytes.len() < 7 {
        return Err(SerializeError::Truncated);
    }
    let format_version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if format_version != FORMAT_VERSION {
        return Err(SerializeError::UnsupportedVersion(format_version));
    }
    let vlen = bytes[6] as usize;
    let hash_start = 7 + vlen;
    if bytes.len() < hash_start + 32 {
        return Err(SerializeError::Truncated);
    }
    let compiler_version = String::from_utf8_lossy(&bytes[7..hash_start]).into_owned();
    let mut source_hash = [0u8; 32];
    source_hash.copy_from_slice(&bytes[hash_start..hash_start + 32]);
    Ok(CacheHeader {
        format_version,
        compiler_version,
        source_hash,
        body_offset: hash_start + 32,
    })
}

pub fn deserialize_program(bytes: &[u8]) -> Result<Program, SerializeError> {
    let header = read_header(bytes)?;
    let program: Program = bincode::deserialize(&bytes[header.body_offset..])?;
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, Opcode};
    use crate::program::{Const, DebugInfo, FunctionRecord};

    fn sample_program() -> Program {
        let mut p = Program::new();
        p.source_hash = source_digest("fn main() {}", b"");
        let k = p.add_constant(Const::Int(7));
        p.instructions.push(Instruction::abx(Opcode::LoadK, 0, k));
        p.instructions.push(Instruction::abc(Opcode::Return, 0, 1, 0));
        p.debug_info.push(DebugInfo::default());
        p.debug_info.push(DebugInfo::default());
        p.function_table.push("main".into());
        let mut rec = FunctionRecord::native(0, 0);
        rec.end_pc = 2;
        p.functions.insert("main".into(), rec);
        p
    }

    #[test]
    fn test_round_trip() {
        let program = sample_program();
        let bytes = serialize_program(&program).unwrap();
        let back = deserialize_program(&bytes).unwrap();
        assert_eq!(back, program);
    }

    #[test]
    fn test_header_without_body_decode() {
        let program = sample_program();
        let bytes = serialize_program(&program).unwrap();
        let header = read_header(&bytes).unwrap();
        assert_eq!(header.format_version, FORMAT_VERSION);
        assert_eq!(header.compiler_version, program.compiler_version);
        assert_eq!(header.source_hash, program.source_hash);
    }

    #[test]
    fn test_bad_magic() {
        let err = read_header(b"NOPE....").unwrap_err();
        assert!(matches!(err, SerializeError::BadMagic));
    }

    #[test]
    fn test_truncated() {
        let program = sample_program();
        let bytes = serialize_program(&program).unwrap();
        let err = read_header(&bytes[..10]).unwrap_err();
        assert!(matches!(err, SerializeError::Truncated));
    }

    #[test]
    fn test_digest_changes_with_options() {
        let plain = source_digest("print(1)", b"");
        let release = source_digest("print(1)", b"release");
        assert_ne!(plain, release);
    }
}
