//! Embedding API
//!
//! `Context` is the host-facing handle around the compiler and VM:
//! compile a source, execute it, exchange globals, call script
//! functions, register host callbacks, and drive the cycle collector
//! under a frame budget. Dropping the context tears the VM down,
//! including a final cycle-collector pass.

use crate::error::RuntimeError;
use crate::heap::GcStats;
use crate::value::Value;
use crate::vm::{HostFn, Vm, VmOptions};
use etchc::{CompileError, CompilerOptions};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub verbose: bool,
    pub debug: bool,
    pub gc_cycle_interval: u32,
    /// Capture the print stream instead of writing to stdout
    pub capture_output: bool,
    /// Compiler settings used by compile_string/compile_file
    pub compiler: CompilerOptions,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            verbose: false,
            debug: false,
            gc_cycle_interval: 1024,
            capture_output: false,
            compiler: CompilerOptions::default(),
        }
    }
}

/// Shared buffer standing in for stdout when output capture is on
#[derive(Clone, Default)]
struct CaptureBuffer(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

impl std::io::Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct Context {
    options: ContextOptions,
    vm: Option<Vm>,
    /// Host callbacks registered before execute() builds the VM
    pending_host: Vec<(String, HostFn)>,
    /// Globals assigned before execute(); InitGlobal respects them
    pending_globals: HashMap<String, Value>,
    capture: Option<CaptureBuffer>,
    last_error: Option<String>,
}

impl Context {
    pub fn new(options: ContextOptions) -> Self {
        Context {
            options,
            vm: None,
            pending_host: Vec::new(),
            pending_globals: HashMap::new(),
            capture: None,
            last_error: None,
        }
    }

    fn compiler_options(&self) -> CompilerOptions {
        let mut opts = self.options.compiler.clone();
        for (name, _) in &self.pending_host {
            if !opts.host_functions.contains(name) {
                opts.host_functions.push(name.clone());
            }
        }
        opts
    }

    pub fn compile_string(&mut self, source: &str, name: &str) -> Result<(), CompileError> {
        let options = self.compiler_options();
        match etchc::compile_string(source, name, &options) {
            Ok(program) => {
                self.install(program);
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn compile_file(&mut self, path: &Path) -> Result<(), CompileError> {
        let options = self.compiler_options();
        match etchc::compile_file(path, &options) {
            Ok(program) => {
                self.install(program);
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn install(&mut self, program: etch_core::Program) {
        let mut vm = Vm::new(
            program,
            VmOptions {
                gc_cycle_interval: self.options.gc_cycle_interval,
            },
        );
        for (name, callback) in self.pending_host.drain(..) {
            vm.register_host(name, callback);
        }
        for (name, value) in self.pending_globals.drain() {
            vm.globals.insert(name, value);
        }
        if self.options.capture_output {
            let buffer = CaptureBuffer::default();
            self.capture = Some(buffer.clone());
            vm.out = Box::new(buffer);
        }
        self.vm = Some(vm);
    }

    /// Run the compiled program; returns the process exit code
    pub fn execute(&mut self) -> Result<i64, RuntimeError> {
        let vm = self
            .vm
            .as_mut()
            .ok_or_else(|| RuntimeError::msg("nothing compiled"))?;
        match vm.execute() {
            Ok(code) => Ok(code),
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        match &self.vm {
            Some(vm) => vm.globals.get(name).cloned(),
            None => self.pending_globals.get(name).cloned(),
        }
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        match &mut self.vm {
            Some(vm) => {
                vm.globals.insert(name.to_string(), value);
            }
            None => {
                self.pending_globals.insert(name.to_string(), value);
            }
        }
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.get_global(name).is_some()
    }

    /// Call a script function by name
    pub fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let vm = self
            .vm
            .as_mut()
            .ok_or_else(|| RuntimeError::msg("nothing compiled"))?;
        match vm.call_by_name(name, args.to_vec()) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Register a host callback; scripts calling `name(...)` dispatch
    /// to it through `CallHost`. Must happen before compilation so the
    /// analyzer knows the name.
    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        callback: impl FnMut(&[Value]) -> Value + 'static,
    ) {
        let name = name.into();
        match &mut self.vm {
            Some(vm) => vm.register_host(name, Box::new(callback)),
            None => self.pending_host.push((name, Box::new(callback))),
        }
    }

    // ------------------------------------------------------------------
    // GC budget
    // ------------------------------------------------------------------

    pub fn begin_frame(&mut self, budget_us: u64) {
        if let Some(vm) = &mut self.vm {
            vm.heap.begin_frame(budget_us);
            let pending = vm.heap.collect_cycles();
            // Frame-driven collection never runs destructors re-entrantly
            // into host code; they queue for the next VM entry
            drop(pending);
        }
    }

    pub fn gc_stats(&self) -> GcStats {
        self.vm
            .as_ref()
            .map(|vm| vm.heap.stats)
            .unwrap_or_default()
    }

    pub fn needs_gc_frame(&self) -> bool {
        self.vm
            .as_ref()
            .map(|vm| vm.heap.has_candidates())
            .unwrap_or(false)
    }

    pub fn heap_needs_collection(&self) -> bool {
        self.vm
            .as_ref()
            .map(|vm| vm.heap.needs_collection())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Error channel and output capture
    // ------------------------------------------------------------------

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Captured print output so far (only with `capture_output`)
    pub fn take_output(&mut self) -> String {
        match &self.capture {
            Some(buffer) => {
                let bytes = std::mem::take(&mut *buffer.0.borrow_mut());
                String::from_utf8_lossy(&bytes).into_owned()
            }
            None => String::new(),
        }
    }

    /// Disassembly of the compiled program
    pub fn dump(&self) -> Option<String> {
        self.vm.as_ref().map(|vm| vm.program.disassemble())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(vm) = &mut self.vm {
            vm.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        let mut options = ContextOptions::default();
        options.capture_output = true;
        options.compiler.use_cache = false;
        Context::new(options)
    }

    #[test]
    fn test_compile_and_execute() {
        let mut c = ctx();
        c.compile_string("fn main() { print(2 + 3) }", "t.etch").unwrap();
        let code = c.execute().unwrap();
        assert_eq!(code, 0);
        assert_eq!(c.take_output(), "5\n");
    }

    #[test]
    fn test_exit_code_from_main() {
        let mut c = ctx();
        c.compile_string("fn main() -> int { return 7 }", "t.etch").unwrap();
        assert_eq!(c.execute().unwrap(), 7);
    }

    #[test]
    fn test_globals_exchange() {
        let mut c = ctx();
        // Host pre-assignment wins over InitGlobal
        c.compile_string(
            "var seed = 1\nfn main() { print(seed) }",
            "t.etch",
        )
        .unwrap();
        c.set_global("seed", Value::Int(99));
        c.execute().unwrap();
        assert_eq!(c.take_output(), "99\n");
        assert!(c.has_global("seed"));
    }

    #[test]
    fn test_call_function_from_host() {
        let mut c = ctx();
        c.compile_string("fn double(x: int) -> int { return x * 2 }\nfn main() { }", "t.etch")
            .unwrap();
        c.execute().unwrap();
        let v = c.call_function("double", &[Value::Int(21)]).unwrap();
        assert_eq!(v, Value::Int(42));
    }

    #[test]
    fn test_host_callback() {
        let mut c = ctx();
        c.register_function("host_add", |args: &[Value]| {
            let sum: i64 = args.iter().filter_map(|v| v.as_int()).sum();
            Value::Int(sum)
        });
        c.compile_string("fn main() { host_add(1, 2) print(9) }", "t.etch")
            .unwrap();
        c.execute().unwrap();
        assert_eq!(c.take_output(), "9\n");
    }

    #[test]
    fn test_error_channel() {
        let mut c = ctx();
        let err = c.compile_string("fn main() { print(1 / 0) }", "t.etch");
        assert!(err.is_err());
        assert!(c.last_error().unwrap().contains("division by zero"));
    }
}
