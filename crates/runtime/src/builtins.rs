//! Builtin functions
//!
//! Dispatched by id from `CallBuiltin`. The print stream is passed in
//! by the VM so embedders (and the test suite) can capture output.

use crate::error::RuntimeError;
use crate::value::Value;
use etch_core::builtins as ids;
use rand::Rng;
use std::io::Write;

pub fn dispatch(
    id: u16,
    args: &[Value],
    out: &mut dyn Write,
) -> Result<Value, RuntimeError> {
    match id {
        ids::PRINT => {
            let value = args.first().cloned().unwrap_or(Value::Nil);
            writeln!(out, "{}", value)
                .map_err(|e| RuntimeError::msg(format!("print failed: {}", e)))?;
            Ok(Value::Nil)
        }
        ids::RAND => {
            // rand(max, min): uniform in [min, max]
            let max = args
                .first()
                .and_then(|v| v.as_int())
                .ok_or_else(|| RuntimeError::msg("rand: max must be int"))?;
            let min = args
                .get(1)
                .and_then(|v| v.as_int())
                .ok_or_else(|| RuntimeError::msg("rand: min must be int"))?;
            let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
            let v = rand::thread_rng().gen_range(lo..=hi);
            Ok(Value::Int(v))
        }
        ids::LEN => {
            let v = args.first().ok_or_else(|| RuntimeError::msg("len: missing argument"))?;
            match v {
                Value::Array(items) => Ok(Value::Int(items.borrow().len() as i64)),
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                other => Err(RuntimeError::msg(format!(
                    "len: unsupported value of type {}",
                    other.type_name()
                ))),
            }
        }
        ids::STR => {
            let v = args.first().cloned().unwrap_or(Value::Nil);
            Ok(Value::str(v.to_string()))
        }
        other => Err(RuntimeError::msg(format!("unknown builtin id {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_writes_line() {
        let mut out = Vec::new();
        dispatch(ids::PRINT, &[Value::Int(42)], &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "42\n");
    }

    #[test]
    fn test_rand_stays_in_bounds() {
        let mut out = Vec::new();
        for _ in 0..100 {
            let v = dispatch(ids::RAND, &[Value::Int(10), Value::Int(5)], &mut out).unwrap();
            let v = v.as_int().unwrap();
            assert!((5..=10).contains(&v), "rand out of range: {}", v);
        }
    }

    #[test]
    fn test_len_and_str() {
        let mut out = Vec::new();
        let arr = Value::array(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(dispatch(ids::LEN, &[arr], &mut out).unwrap(), Value::Int(2));
        assert_eq!(
            dispatch(ids::STR, &[Value::Int(7)], &mut out).unwrap(),
            Value::str("7")
        );
    }
}
