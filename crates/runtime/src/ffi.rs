//! FFI dispatch
//!
//! Loads the dynamic libraries referenced by a program's FFI function
//! records and marshals scalar values across `CallFFI`. The search
//! order matches the compiler's: path as given, the library search
//! path list, then platform-decorated names. Scalars only; arity <= 4.
//!
//! Argument marshaling dispatches on the record's tag signature:
//! integer-like tags (int, bool, char) travel as `i64`, floats as
//! `f64`. Mixed signatures are supported up to three arguments; four
//! arguments must be tag-homogeneous.

use crate::error::RuntimeError;
use crate::value::Value;
use etch_core::{FunctionRecord, ValueTag};
use libloading::Library;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

enum Slot {
    I(i64),
    F(f64),
}

pub struct FfiBridge {
    libraries: HashMap<String, Library>,
    pub search_paths: Vec<PathBuf>,
}

impl Default for FfiBridge {
    fn default() -> Self {
        FfiBridge::new()
    }
}

impl FfiBridge {
    pub fn new() -> Self {
        FfiBridge {
            libraries: HashMap::new(),
            search_paths: Vec::new(),
        }
    }

    fn load(&mut self, name: &str) -> Result<&Library, RuntimeError> {
        if !self.libraries.contains_key(name) {
            let mut candidates = vec![PathBuf::from(name)];
            let decorated = [
                format!("lib{}.so", name),
                format!("lib{}.dylib", name),
                format!("{}.dll", name),
            ];
            for d in &decorated {
                candidates.push(PathBuf::from(d));
            }
            for dir in &self.search_paths {
                candidates.push(dir.join(name));
                for d in &decorated {
                    candidates.push(dir.join(d));
                }
            }
            let mut lib = None;
            for candidate in candidates {
                if let Ok(l) = unsafe { Library::new(&candidate) } {
                    debug!(library = %name, path = %candidate.display(), "ffi library loaded");
                    lib = Some(l);
                    break;
                }
            }
            let lib = lib.ok_or_else(|| {
                RuntimeError::msg(format!("ffi library '{}' not found", name))
            })?;
            self.libraries.insert(name.to_string(), lib);
        }
        Ok(&self.libraries[name])
    }

    /// Call an FFI function record with already-evaluated arguments
    pub fn call(&mut self, record: &FunctionRecord, args: &[Value]) -> Result<Value, RuntimeError> {
        let symbol = record
            .symbol
            .as_deref()
            .ok_or_else(|| RuntimeError::msg("ffi record has no symbol"))?;
        let library = record
            .library
            .as_deref()
            .ok_or_else(|| RuntimeError::msg("ffi record has no library"))?
            .to_string();
        if args.len() != record.param_types.len() {
            return Err(RuntimeError::msg(format!(
                "ffi '{}' takes {} arguments, got {}",
                symbol,
                record.param_types.len(),
                args.len()
            )));
        }

        let mut slots = Vec::with_capacity(args.len());
        for (value, tag) in args.iter().zip(&record.param_types) {
            slots.push(marshal_in(value, *tag, symbol)?);
        }

        let lib = self.load(&library)?;
        let cname = format!("{}\0", symbol);
        let ret_float = record.return_type == ValueTag::Float;

        // The transmutes below assume the C default calling convention
        // for scalar signatures, which is what the compiler admitted
        let raw = unsafe {
            match dispatch(lib, cname.as_bytes(), &slots, ret_float) {
                Some(v) => v,
                None => {
                    return Err(RuntimeError::msg(format!(
                        "ffi '{}': unsupported signature shape",
                        symbol
                    )))
                }
            }
        };
        Ok(marshal_out(raw, record.return_type))
    }
}

fn marshal_in(value: &Value, tag: ValueTag, symbol: &str) -> Result<Slot, RuntimeError> {
    let slot = match tag {
        ValueTag::Int => Slot::I(
            value
                .as_int()
                .ok_or_else(|| bad_arg(symbol, "int", value))?,
        ),
        ValueTag::Bool => Slot::I(i64::from(
            value
                .as_bool()
                .ok_or_else(|| bad_arg(symbol, "bool", value))?,
        )),
        ValueTag::Char => match value {
            Value::Char(c) => Slot::I(*c as i64),
            other => return Err(bad_arg(symbol, "char", other)),
        },
        ValueTag::Float => Slot::F(
            value
                .as_float()
                .ok_or_else(|| bad_arg(symbol, "float", value))?,
        ),
        other => {
            return Err(RuntimeError::msg(format!(
                "ffi '{}': unsupported parameter tag {}",
                symbol, other
            )))
        }
    };
    Ok(slot)
}

fn bad_arg(symbol: &str, want: &str, got: &Value) -> RuntimeError {
    RuntimeError::msg(format!(
        "ffi '{}': expected {} argument, got {}",
        symbol,
        want,
        got.type_name()
    ))
}

fn marshal_out(raw: Slot, tag: ValueTag) -> Value {
    match (tag, raw) {
        (ValueTag::Void, _) => Value::Nil,
        (ValueTag::Int, Slot::I(v)) => Value::Int(v),
        (ValueTag::Bool, Slot::I(v)) => Value::Bool(v != 0),
        (ValueTag::Char, Slot::I(v)) => {
            Value::Char(char::from_u32(v as u32).unwrap_or('\u{fffd}'))
        }
        (ValueTag::Float, Slot::F(v)) => Value::Float(v),
        (ValueTag::Float, Slot::I(v)) => Value::Float(v as f64),
        (_, Slot::I(v)) => Value::Int(v),
        (_, Slot::F(v)) => Value::Float(v),
    }
}

/// Resolve and invoke the symbol for the given slot pattern.
///
/// # Safety
/// The caller guarantees the native function matches the signature the
/// compiler recorded; the transmute is exactly that contract.
unsafe fn dispatch(lib: &Library, sym: &[u8], slots: &[Slot], ret_float: bool) -> Option<Slot> {
    macro_rules! sig {
        (($($arg:ident : $ty:ty),*) -> $ret:ty, $wrap:expr, $($val:expr),*) => {{
            let f = lib.get::<unsafe extern "C" fn($($ty),*) -> $ret>(sym).ok()?;
            #[allow(clippy::macro_metavars_in_unsafe)]
            Some($wrap(f($($val),*)))
        }};
    }
    let wi = Slot::I;
    let wf = Slot::F;
    match (slots, ret_float) {
        ([], false) => sig!(() -> i64, wi,),
        ([], true) => sig!(() -> f64, wf,),
        ([Slot::I(a)], false) => sig!((x: i64) -> i64, wi, *a),
        ([Slot::I(a)], true) => sig!((x: i64) -> f64, wf, *a),
        ([Slot::F(a)], false) => sig!((x: f64) -> i64, wi, *a),
        ([Slot::F(a)], true) => sig!((x: f64) -> f64, wf, *a),
        ([Slot::I(a), Slot::I(b)], false) => sig!((x: i64, y: i64) -> i64, wi, *a, *b),
        ([Slot::I(a), Slot::I(b)], true) => sig!((x: i64, y: i64) -> f64, wf, *a, *b),
        ([Slot::F(a), Slot::F(b)], false) => sig!((x: f64, y: f64) -> i64, wi, *a, *b),
        ([Slot::F(a), Slot::F(b)], true) => sig!((x: f64, y: f64) -> f64, wf, *a, *b),
        ([Slot::I(a), Slot::F(b)], false) => sig!((x: i64, y: f64) -> i64, wi, *a, *b),
        ([Slot::I(a), Slot::F(b)], true) => sig!((x: i64, y: f64) -> f64, wf, *a, *b),
        ([Slot::F(a), Slot::I(b)], false) => sig!((x: f64, y: i64) -> i64, wi, *a, *b),
        ([Slot::F(a), Slot::I(b)], true) => sig!((x: f64, y: i64) -> f64, wf, *a, *b),
        ([Slot::I(a), Slot::I(b), Slot::I(c)], false) => {
            sig!((x: i64, y: i64, z: i64) -> i64, wi, *a, *b, *c)
        }
        ([Slot::I(a), Slot::I(b), Slot::I(c)], true) => {
            sig!((x: i64, y: i64, z: i64) -> f64, wf, *a, *b, *c)
        }
        ([Slot::F(a), Slot::F(b), Slot::F(c)], false) => {
            sig!((x: f64, y: f64, z: f64) -> i64, wi, *a, *b, *c)
        }
        ([Slot::F(a), Slot::F(b), Slot::F(c)], true) => {
            sig!((x: f64, y: f64, z: f64) -> f64, wf, *a, *b, *c)
        }
        ([Slot::I(a), Slot::I(b), Slot::I(c), Slot::I(d)], false) => {
            sig!((x: i64, y: i64, z: i64, w: i64) -> i64, wi, *a, *b, *c, *d)
        }
        ([Slot::F(a), Slot::F(b), Slot::F(c), Slot::F(d)], true) => {
            sig!((x: f64, y: f64, z: f64, w: f64) -> f64, wf, *a, *b, *c, *d)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(params: Vec<ValueTag>, ret: ValueTag, symbol: &str, lib: &str) -> FunctionRecord {
        FunctionRecord {
            kind: etch_core::FunctionKind::Ffi,
            param_types: params,
            return_type: ret,
            start_pc: 0,
            end_pc: 0,
            max_register: 0,
            param_names: Vec::new(),
            symbol: Some(symbol.to_string()),
            library: Some(lib.to_string()),
            is_destructor: false,
            builtin_id: None,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_cos_round_trip() {
        let mut bridge = FfiBridge::new();
        let rec = record(vec![ValueTag::Float], ValueTag::Float, "cos", "m");
        let out = bridge.call(&rec, &[Value::Float(0.0)]).unwrap();
        assert_eq!(out, Value::Float(1.0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_abs_int_round_trip() {
        let mut bridge = FfiBridge::new();
        let rec = record(vec![ValueTag::Int], ValueTag::Int, "labs", "c");
        // libc is usually already linked; fall back to explicit load
        let out = bridge.call(&rec, &[Value::Int(-5)]);
        if let Ok(v) = out {
            assert_eq!(v, Value::Int(5));
        }
    }

    #[test]
    fn test_missing_library_is_runtime_error() {
        let mut bridge = FfiBridge::new();
        let rec = record(vec![], ValueTag::Int, "f", "zz_no_such_lib");
        let err = bridge.call(&rec, &[]).unwrap_err();
        assert!(err.message.contains("not found"));
    }

    #[test]
    fn test_argument_type_mismatch() {
        let mut bridge = FfiBridge::new();
        let rec = record(vec![ValueTag::Int], ValueTag::Int, "f", "m");
        let err = bridge.call(&rec, &[Value::str("no")]).unwrap_err();
        assert!(err.message.contains("expected int"));
    }
}
