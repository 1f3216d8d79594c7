//! Module and FFI import resolution
//!
//! Resolves `import name` by loading `<name>.etch` next to the importing
//! file and merging its exported declarations, with double-include and
//! circular-import protection. Resolves `import ffi lib { ... }` by
//! loading the dynamic library through a platform-agnostic search and
//! verifying every declared symbol exists, so missing symbols surface at
//! compile time.

use crate::analyzer::FfiFunction;
use crate::ast::{Decl, Import, Module, TypeExpr};
use crate::error::{CompileError, ErrorKind, Result};
use crate::parser::parse_module;
use crate::types::Type;
use etch_core::Position;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct Resolver {
    /// Canonical paths already merged (double-include protection)
    loaded: HashSet<PathBuf>,
    /// Import chain currently being resolved (circular-import detection)
    in_progress: Vec<PathBuf>,
    /// Extra directories searched for dynamic libraries
    pub library_search_paths: Vec<PathBuf>,
    /// When false, FFI libraries and symbols are recorded without being
    /// opened (used by `--gen` on machines without the target libraries)
    pub check_symbols: bool,
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        Resolver {
            loaded: HashSet::new(),
            in_progress: Vec::new(),
            library_search_paths: Vec::new(),
            check_symbols: true,
        }
    }

    /// Resolve every import of `module`, merging exported declarations
    /// into it. Returns the FFI functions declared by the import graph.
    pub fn resolve(&mut self, module: &mut Module, source_path: &Path) -> Result<Vec<FfiFunction>> {
        let canonical = source_path
            .canonicalize()
            .unwrap_or_else(|_| source_path.to_path_buf());
        self.loaded.insert(canonical.clone());
        self.in_progress.push(canonical);
        let result = self.resolve_inner(module, source_path);
        self.in_progress.pop();
        result
    }

    fn resolve_inner(
        &mut self,
        module: &mut Module,
        source_path: &Path,
    ) -> Result<Vec<FfiFunction>> {
        let dir = source_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let imports = std::mem::take(&mut module.imports);
        let mut ffi = Vec::new();

        for import in imports {
            match import {
                Import::Module { name, pos } => {
                    let path = dir.join(format!("{}.etch", name));
                    let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
                    if self.in_progress.contains(&canonical) {
                        return Err(CompileError::new(
                            ErrorKind::ModuleNotFound,
                            pos,
                            format!("circular import of module '{}'", name),
                        ));
                    }
                    if self.loaded.contains(&canonical) {
                        continue;
                    }
                    let source = std::fs::read_to_string(&path).map_err(|e| {
                        CompileError::new(
                            ErrorKind::ModuleNotFound,
                            pos.clone(),
                            format!("cannot read module '{}' ({}): {}", name, path.display(), e),
                        )
                    })?;
                    debug!(module = %name, path = %path.display(), "resolving import");
                    let mut imported = parse_module(&source, &path.to_string_lossy())?;
                    self.loaded.insert(canonical.clone());
                    self.in_progress.push(canonical);
                    let nested = self.resolve_inner(&mut imported, &path);
                    self.in_progress.pop();
                    ffi.extend(nested?);
                    self.merge(module, imported, &name, &pos)?;
                }
                Import::Ffi {
                    library,
                    funcs,
                    pos,
                } => {
                    if self.check_symbols {
                        self.check_library(&library, &funcs, &pos)?;
                    }
                    for decl in funcs {
                        let mut params = Vec::new();
                        for (pname, ty) in &decl.params {
                            params.push(Self::ffi_type(ty, pname, &decl.pos)?);
                        }
                        let ret = Self::ffi_type(&decl.return_type, "return value", &decl.pos)?;
                        ffi.push(FfiFunction {
                            name: decl.name,
                            library: library.clone(),
                            params,
                            ret,
                            pos: decl.pos,
                        });
                    }
                }
            }
        }
        Ok(ffi)
    }

    /// Only scalars cross the FFI boundary
    fn ffi_type(te: &TypeExpr, what: &str, pos: &Position) -> Result<Type> {
        match te {
            TypeExpr::Named(name) => match name.as_str() {
                "void" => Ok(Type::Void),
                "bool" => Ok(Type::Bool),
                "char" => Ok(Type::Char),
                "int" => Ok(Type::Int),
                "float" => Ok(Type::Float),
                other => Err(CompileError::new(
                    ErrorKind::TypeMismatch,
                    pos.clone(),
                    format!(
                        "ffi {} has unsupported type '{}' (scalars only)",
                        what, other
                    ),
                )),
            },
            _ => Err(CompileError::new(
                ErrorKind::TypeMismatch,
                pos.clone(),
                format!("ffi {} has a non-scalar type", what),
            )),
        }
    }

    /// Platform-decorated candidate file names for a library
    fn candidates(&self, library: &str) -> Vec<PathBuf> {
        let mut out = vec![PathBuf::from(library)];
        let decorated = [
            format!("lib{}.so", library),
            format!("lib{}.dylib", library),
            format!("{}.dll", library),
        ];
        for name in &decorated {
            out.push(PathBuf::from(name));
        }
        for dir in &self.library_search_paths {
            out.push(dir.join(library));
            for name in &decorated {
                out.push(dir.join(name));
            }
        }
        out
    }

    fn check_library(
        &self,
        library: &str,
        funcs: &[crate::ast::FfiFnDecl],
        pos: &Position,
    ) -> Result<()> {
        let mut lib = None;
        for candidate in self.candidates(library) {
            // Loading a library runs its initializers; that is the
            // documented cost of compile-time symbol checking
            match unsafe { libloading::Library::new(&candidate) } {
                Ok(l) => {
                    debug!(library = %library, path = %candidate.display(), "ffi library found");
                    lib = Some(l);
                    break;
                }
                Err(_) => continue,
            }
        }
        let lib = lib.ok_or_else(|| {
            CompileError::new(
                ErrorKind::ModuleNotFound,
                pos.clone(),
                format!("ffi library '{}' not found", library),
            )
        })?;
        for f in funcs {
            let symbol = std::ffi::CString::new(f.name.as_bytes()).map_err(|_| {
                CompileError::new(
                    ErrorKind::ModuleNotFound,
                    f.pos.clone(),
                    format!("invalid ffi symbol name '{}'", f.name),
                )
            })?;
            let found = unsafe { lib.get::<*const ()>(symbol.as_bytes_with_nul()) };
            if found.is_err() {
                return Err(CompileError::new(
                    ErrorKind::ModuleNotFound,
                    f.pos.clone(),
                    format!("symbol '{}' not found in library '{}'", f.name, library),
                ));
            }
        }
        Ok(())
    }

    /// Merge the exported declarations of `imported` into `module`
    fn merge(
        &self,
        module: &mut Module,
        imported: Module,
        name: &str,
        pos: &Position,
    ) -> Result<()> {
        for decl in imported.decls {
            if !decl.exported() {
                continue;
            }
            let decl_name = match &decl {
                Decl::Function(f) => f.name.clone(),
                Decl::Global(v) => v.name.clone(),
                Decl::TypeDef(t) => t.name.clone(),
            };
            let collision = match &decl {
                // Functions may overload across modules; other names may not
                Decl::Function(_) => false,
                Decl::Global(_) => module.decls.iter().any(
                    |d| matches!(d, Decl::Global(v) if v.name == decl_name),
                ),
                Decl::TypeDef(_) => module.decls.iter().any(
                    |d| matches!(d, Decl::TypeDef(t) if t.name == decl_name),
                ),
            };
            if collision {
                return Err(CompileError::new(
                    ErrorKind::ModuleNotFound,
                    pos.clone(),
                    format!("import '{}' redefines '{}'", name, decl_name),
                ));
            }
            module.decls.push(decl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{}", content).unwrap();
        path
    }

    #[test]
    fn test_import_merges_exported_decls() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "util.etch",
            "export fn double(x: int) -> int { return x * 2 }\n\
             fn private_helper() { }\n",
        );
        let main_path = write_file(
            dir.path(),
            "main.etch",
            "import util\nfn main() { print(double(2)) }\n",
        );
        let source = std::fs::read_to_string(&main_path).unwrap();
        let mut module = parse_module(&source, &main_path.to_string_lossy()).unwrap();
        let ffi = Resolver::new().resolve(&mut module, &main_path).unwrap();
        assert!(ffi.is_empty());
        assert!(module.find_function("double").is_some());
        assert!(module.find_function("private_helper").is_none());
    }

    #[test]
    fn test_missing_module() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = write_file(dir.path(), "main.etch", "import nope\nfn main() { }\n");
        let source = std::fs::read_to_string(&main_path).unwrap();
        let mut module = parse_module(&source, &main_path.to_string_lossy()).unwrap();
        let err = Resolver::new().resolve(&mut module, &main_path).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModuleNotFound);
    }

    #[test]
    fn test_circular_import_detected() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.etch", "import b\nexport fn fa() { }\n");
        write_file(dir.path(), "b.etch", "import a\nexport fn fb() { }\n");
        let main_path = write_file(dir.path(), "main.etch", "import a\nfn main() { }\n");
        let source = std::fs::read_to_string(&main_path).unwrap();
        let mut module = parse_module(&source, &main_path.to_string_lossy()).unwrap();
        let err = Resolver::new().resolve(&mut module, &main_path).unwrap_err();
        assert!(err.message.contains("circular import"));
    }

    #[test]
    fn test_diamond_import_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "base.etch", "export fn base() -> int { return 1 }\n");
        write_file(dir.path(), "l.etch", "import base\nexport fn l() { }\n");
        write_file(dir.path(), "r.etch", "import base\nexport fn r() { }\n");
        let main_path = write_file(
            dir.path(),
            "main.etch",
            "import l\nimport r\nfn main() { }\n",
        );
        let source = std::fs::read_to_string(&main_path).unwrap();
        let mut module = parse_module(&source, &main_path.to_string_lossy()).unwrap();
        Resolver::new().resolve(&mut module, &main_path).unwrap();
        assert!(module.find_function("base").is_some());
    }

    #[test]
    fn test_ffi_decls_recorded_without_checking() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = write_file(
            dir.path(),
            "main.etch",
            "import ffi m { fn cos(x: float) -> float; }\nfn main() { }\n",
        );
        let source = std::fs::read_to_string(&main_path).unwrap();
        let mut module = parse_module(&source, &main_path.to_string_lossy()).unwrap();
        let mut resolver = Resolver::new();
        resolver.check_symbols = false;
        let ffi = resolver.resolve(&mut module, &main_path).unwrap();
        assert_eq!(ffi.len(), 1);
        assert_eq!(ffi[0].name, "cos");
        assert_eq!(ffi[0].library, "m");
        assert_eq!(ffi[0].params, vec![Type::Float]);
        assert_eq!(ffi[0].ret, Type::Float);
    }

    #[test]
    fn test_missing_ffi_library_is_compile_error() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = write_file(
            dir.path(),
            "main.etch",
            "import ffi no_such_library_zzz { fn f(); }\nfn main() { }\n",
        );
        let source = std::fs::read_to_string(&main_path).unwrap();
        let mut module = parse_module(&source, &main_path.to_string_lossy()).unwrap();
        let err = Resolver::new().resolve(&mut module, &main_path).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModuleNotFound);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_libm_symbols_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = write_file(
            dir.path(),
            "main.etch",
            "import ffi m { fn cos(x: float) -> float; }\nfn main() { }\n",
        );
        let source = std::fs::read_to_string(&main_path).unwrap();
        let mut module = parse_module(&source, &main_path.to_string_lossy()).unwrap();
        let ffi = Resolver::new().resolve(&mut module, &main_path).unwrap();
        assert_eq!(ffi[0].name, "cos");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_symbol_is_compile_error() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = write_file(
            dir.path(),
            "main.etch",
            "import ffi m { fn definitely_not_in_libm(); }\nfn main() { }\n",
        );
        let source = std::fs::read_to_string(&main_path).unwrap();
        let mut module = parse_module(&source, &main_path.to_string_lossy()).unwrap();
        let err = Resolver::new().resolve(&mut module, &main_path).unwrap_err();
        assert!(err.message.contains("definitely_not_in_libm"));
    }
}
