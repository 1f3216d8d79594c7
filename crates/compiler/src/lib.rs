//! Etch compiler library
//!
//! Compiles `.etch` source to register bytecode for the Etch VM:
//! lexing, parsing, module/FFI resolution, comptime expansion, type and
//! safety analysis, bytecode generation, optimization, and the on-disk
//! bytecode cache.
//!
//! ```rust,ignore
//! use etchc::{compile_file, CompilerOptions};
//!
//! let program = compile_file(Path::new("demo.etch"), &CompilerOptions::default())?;
//! println!("{}", program.disassemble());
//! ```

pub mod analyzer;
pub mod ast;
pub mod cache;
pub mod codegen;
pub mod comptime;
pub mod error;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod range;
pub mod resolver;
pub mod types;

pub use analyzer::{analyze, Analysis, FfiFunction};
pub use error::{CompileError, ErrorKind};
pub use parser::{parse_module, Parser};
pub use resolver::Resolver;
pub use types::Type;

use etch_core::{source_digest, Program};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Compilation settings that affect emitted bytecode (and therefore the
/// cache digest) or the pipeline's behavior
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Skip the cache read path and always recompile
    pub force: bool,
    /// Release mode (reserved for debug-assert opcodes; part of the
    /// cache digest so switching modes recompiles)
    pub release: bool,
    /// Use the on-disk cache at all
    pub use_cache: bool,
    /// Verify FFI libraries and symbols at import time
    pub check_ffi_symbols: bool,
    /// Extra directories searched for FFI libraries
    pub library_search_paths: Vec<PathBuf>,
    /// Host callback names registered through the embedding API before
    /// compilation; calls to them compile to `CallHost`
    pub host_functions: Vec<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            force: false,
            release: false,
            use_cache: true,
            check_ffi_symbols: true,
            library_search_paths: Vec::new(),
            host_functions: Vec::new(),
        }
    }
}

impl CompilerOptions {
    /// Digest of every option that changes emitted code
    fn digest(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(u8::from(self.release));
        for host in &self.host_functions {
            out.extend_from_slice(host.as_bytes());
            out.push(0);
        }
        out
    }
}

/// Compile a source file, consulting the bytecode cache
pub fn compile_file(path: &Path, options: &CompilerOptions) -> Result<Program, CompileError> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        CompileError::new(
            ErrorKind::ModuleNotFound,
            etch_core::Position::new(path.to_string_lossy(), 0, 0),
            format!("cannot read '{}': {}", path.display(), e),
        )
    })?;
    let hash = source_digest(&source, &options.digest());

    if options.use_cache && !options.force {
        if let Some(program) = cache::load(path, &hash) {
            info!(path = %path.display(), "using cached bytecode");
            return Ok(program);
        }
    }

    let program = compile_source(&source, path, options, hash)?;
    if options.use_cache {
        cache::store(path, &program);
    }
    Ok(program)
}

/// Compile source text under a synthetic name; the cache is not
/// consulted (there is no file identity to key it on)
pub fn compile_string(
    source: &str,
    name: &str,
    options: &CompilerOptions,
) -> Result<Program, CompileError> {
    let hash = source_digest(source, &options.digest());
    compile_source(source, Path::new(name), options, hash)
}

fn compile_source(
    source: &str,
    path: &Path,
    options: &CompilerOptions,
    hash: [u8; 32],
) -> Result<Program, CompileError> {
    debug!(path = %path.display(), "parsing");
    let mut module = parser::parse_module(source, &path.to_string_lossy())?;

    debug!("resolving imports");
    let mut resolver = Resolver::new();
    resolver.check_symbols = options.check_ffi_symbols;
    resolver.library_search_paths = options.library_search_paths.clone();
    let ffi = resolver.resolve(&mut module, path)?;

    debug!("expanding comptime");
    let source_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    comptime::expand(&mut module, &source_dir)?;

    debug!("analyzing");
    let analysis = analyzer::analyze(&mut module, ffi, &options.host_functions)?;

    debug!("generating bytecode");
    let output = codegen::generate(&module, &analysis, hash)?;
    let mut program = output.program;

    debug!("optimizing");
    optimizer::optimize(&mut program, &output.meta);

    info!(
        path = %path.display(),
        instructions = program.instructions.len(),
        constants = program.constants.len(),
        functions = program.function_table.len(),
        "compiled"
    );
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etch_core::serialize_program;

    fn opts() -> CompilerOptions {
        CompilerOptions {
            use_cache: false,
            ..CompilerOptions::default()
        }
    }

    #[test]
    fn test_compile_string_end_to_end() {
        let program = compile_string("fn main() { print(1 + 2) }", "t.etch", &opts()).unwrap();
        assert!(program.find_function("main").is_some());
        assert!(!program.instructions.is_empty());
    }

    #[test]
    fn test_compile_error_carries_position() {
        let err = compile_string("fn main() { let d = rand(3, 0) print(1 / d) }", "t.etch", &opts())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivByZero);
        assert_eq!(err.pos.file, "t.etch");
    }

    #[test]
    fn test_serialization_round_trip_of_compiled_program() {
        let program =
            compile_string("fn main() { for i in 0..3 { print(i) } }", "t.etch", &opts()).unwrap();
        let bytes = serialize_program(&program).unwrap();
        let back = etch_core::deserialize_program(&bytes).unwrap();
        assert_eq!(back, program);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let source = "fn main() { var i = 0 while i < 5 { i = i + 1 } print(i) }";
        let a = compile_string(source, "t.etch", &opts()).unwrap();
        let b = compile_string(source, "t.etch", &opts()).unwrap();
        assert_eq!(serialize_program(&a).unwrap(), serialize_program(&b).unwrap());
    }

    #[test]
    fn test_cache_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.etch");
        std::fs::write(&path, "fn main() { print(42) }").unwrap();
        let options = CompilerOptions::default();
        let first = compile_file(&path, &options).unwrap();
        // Second run must hit the cache and produce identical bytes
        let second = compile_file(&path, &options).unwrap();
        assert_eq!(
            serialize_program(&first).unwrap(),
            serialize_program(&second).unwrap()
        );
        assert!(cache::cache_path(&path).exists());
    }

    #[test]
    fn test_force_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.etch");
        std::fs::write(&path, "fn main() { print(42) }").unwrap();
        let mut options = CompilerOptions::default();
        compile_file(&path, &options).unwrap();
        options.force = true;
        let fresh = compile_file(&path, &options).unwrap();
        assert!(fresh.find_function("main").is_some());
    }

    #[test]
    fn test_option_change_invalidates_cache() {
        let source = "fn main() { }";
        let plain = CompilerOptions::default();
        let mut release = CompilerOptions::default();
        release.release = true;
        let a = source_digest(source, &plain.digest());
        let b = source_digest(source, &release.digest());
        assert_ne!(a, b);
    }
}
