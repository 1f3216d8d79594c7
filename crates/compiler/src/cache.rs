//! On-disk bytecode cache
//!
//! Compiled programs live in a sibling directory of the source file:
//! `foo.etch` caches to `foo.cache/foo.etcx`. A cache file is reused
//! when its header carries the current compiler version and the digest
//! of the current source text and compiler options; anything else
//! triggers recompilation and overwrite. `--force` bypasses the read
//! path entirely.

use etch_core::{
    deserialize_program, read_header, serialize_program, Program, COMPILER_VERSION,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bytecode file extension
pub const CACHE_EXT: &str = "etcx";

/// The cache file for a source path
pub fn cache_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    let dir = source
        .parent()
        .unwrap_or(Path::new("."))
        .join(format!("{}.cache", stem));
    dir.join(format!("{}.{}", stem, CACHE_EXT))
}

/// Load a cached program when its header matches the source digest and
/// compiler version. Any mismatch or read error falls through to a
/// fresh compile.
pub fn load(source: &Path, source_hash: &[u8; 32]) -> Option<Program> {
    let path = cache_path(source);
    let bytes = std::fs::read(&path).ok()?;
    let header = match read_header(&bytes) {
        Ok(h) => h,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "stale cache header");
            return None;
        }
    };
    if header.compiler_version != COMPILER_VERSION || header.source_hash != *source_hash {
        debug!(path = %path.display(), "cache out of date");
        return None;
    }
    match deserialize_program(&bytes) {
        Ok(program) => {
            debug!(path = %path.display(), "loaded cached bytecode");
            Some(program)
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cache body unreadable");
            None
        }
    }
}

/// Write a program to the cache, best effort: a read-only directory
/// costs a warning and a recompile next run, never a failed build
pub fn store(source: &Path, program: &Program) {
    let path = cache_path(source);
    let Some(dir) = path.parent() else { return };
    if let Err(e) = std::fs::create_dir_all(dir) {
        debug!(dir = %dir.display(), error = %e, "cannot create cache dir");
        return;
    }
    let bytes = match serialize_program(program) {
        Ok(b) => b,
        Err(e) => {
            debug!(error = %e, "cannot serialize program");
            return;
        }
    };
    if let Err(e) = std::fs::write(&path, bytes) {
        debug!(path = %path.display(), error = %e, "cannot write cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etch_core::source_digest;

    #[test]
    fn test_cache_path_shape() {
        let p = cache_path(Path::new("/tmp/demo/foo.etch"));
        assert_eq!(p, Path::new("/tmp/demo/foo.cache/foo.etcx"));
    }

    #[test]
    fn test_store_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("prog.etch");
        std::fs::write(&source, "fn main() { }").unwrap();
        let hash = source_digest("fn main() { }", b"");
        let mut program = Program::new();
        program.source_hash = hash;

        assert!(load(&source, &hash).is_none());
        store(&source, &program);
        let loaded = load(&source, &hash).expect("cache should hit");
        assert_eq!(loaded, program);
    }

    #[test]
    fn test_source_change_misses() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("prog.etch");
        let hash = source_digest("fn main() { }", b"");
        let mut program = Program::new();
        program.source_hash = hash;
        store(&source, &program);

        let new_hash = source_digest("fn main() { print(1) }", b"");
        assert!(load(&source, &new_hash).is_none());
    }

    #[test]
    fn test_version_mismatch_misses() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("prog.etch");
        let hash = source_digest("fn main() { }", b"");
        let mut program = Program::new();
        program.source_hash = hash;
        program.compiler_version = "0.0.0-old".to_string();
        store(&source, &program);
        assert!(load(&source, &hash).is_none());
    }
}
