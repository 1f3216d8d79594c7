//! End-to-end scenarios: compile with etchc, run on the VM, observe
//! printed output through the context's capture buffer.

use etch_runtime::{Context, ContextOptions};

fn context() -> Context {
    let mut options = ContextOptions::default();
    options.capture_output = true;
    options.compiler.use_cache = false;
    Context::new(options)
}

fn run(source: &str) -> String {
    let mut ctx = context();
    ctx.compile_string(source, "e2e.etch")
        .unwrap_or_else(|e| panic!("compile failed: {}", e));
    ctx.execute().unwrap_or_else(|e| panic!("runtime failed: {}", e));
    ctx.take_output()
}

fn compile_error(source: &str) -> etchc::CompileError {
    let mut ctx = context();
    ctx.compile_string(source, "e2e.etch")
        .expect_err("expected a compile error")
}

#[test]
fn range_proven_division() {
    let out = run("fn main() { let d: int = rand(10, 5) print(100 / d) }");
    let value: i64 = out.trim().parse().expect("integer output");
    assert!(
        [10, 11, 12, 14, 16, 20].contains(&value),
        "unexpected quotient {}",
        value
    );
}

#[test]
fn caught_division() {
    let err = compile_error("fn main() { let d: int = rand(5, 0) print(100 / d) }");
    assert_eq!(err.kind, etchc::ErrorKind::DivByZero);
    assert_eq!(err.pos.file, "e2e.etch");
}

#[test]
fn dead_code_tolerates_unsafe_operations() {
    let out = run(
        "fn main() {\n\
           let x: int = rand(100, 50)\n\
           if x > 200 { print(10 / 0) }\n\
           print(\"ok\")\n\
         }",
    );
    assert_eq!(out, "ok\n");
}

#[test]
fn comptime_embedding() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("msg.txt"), "hello\n").unwrap();
    let source_path = dir.path().join("main.etch");
    std::fs::write(
        &source_path,
        "fn main() { let s: string = comptime(readFile(\"msg.txt\")) print(s) }",
    )
    .unwrap();
    let mut ctx = context();
    ctx.compile_file(&source_path).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.take_output(), "hello\n\n");
}

#[test]
fn coroutine_counter() {
    let out = run(
        "fn counter() -> coroutine[int] { yield 1 yield 2 yield 3 }\n\
         fn main() {\n\
           let c = spawn counter()\n\
           match resume(c) { ok(v) => print(v), err(_) => print(-1) }\n\
           match resume(c) { ok(v) => print(v), err(_) => print(-1) }\n\
           match resume(c) { ok(v) => print(v), err(_) => print(-1) }\n\
           match resume(c) { ok(_) => print(0), err(_) => print(-1) }\n\
         }",
    );
    assert_eq!(out, "1\n2\n3\n-1\n");
}

#[test]
fn defer_lifo() {
    let out = run(
        "fn main() {\n\
           defer { print(\"a\") }\n\
           defer { print(\"b\") }\n\
           print(\"c\")\n\
         }",
    );
    assert_eq!(out, "c\nb\na\n");
}

#[test]
fn defer_inner_scopes_run_first() {
    let out = run(
        "fn main() {\n\
           defer { print(\"outer\") }\n\
           {\n\
             defer { print(\"inner\") }\n\
             print(\"body\")\n\
           }\n\
           print(\"after\")\n\
         }",
    );
    assert_eq!(out, "body\ninner\nafter\nouter\n");
}

#[test]
fn while_loop_and_narrowing() {
    let out = run("fn main() { var i = 1 while i < 10 { i = i + 1 } print(10 / i) }");
    assert_eq!(out, "1\n");
}

#[test]
fn for_range_iterates_half_open() {
    let out = run("fn main() { var sum = 0 for i in 0..5 { sum = sum + i } print(sum) }");
    assert_eq!(out, "10\n");
}

#[test]
fn for_in_over_array_and_string() {
    let out = run(
        "fn main() {\n\
           for x in [10, 20, 30] { print(x) }\n\
           for c in \"ab\" { print(c) }\n\
         }",
    );
    assert_eq!(out, "10\n20\n30\na\nb\n");
}

#[test]
fn break_and_continue() {
    let out = run(
        "fn main() {\n\
           for i in 0..10 {\n\
             if i % 2 == 0 { continue }\n\
             if i > 5 { break }\n\
             print(i)\n\
           }\n\
         }",
    );
    assert_eq!(out, "1\n3\n5\n");
}

#[test]
fn string_operations() {
    let out = run(
        "fn main() {\n\
           let s = \"hello\" + \" \" + \"world\"\n\
           print(s)\n\
           print(#s)\n\
           if \"lo w\" in s { print(\"found\") }\n\
           print(s[0:5])\n\
         }",
    );
    assert_eq!(out, "hello world\n11\nfound\nhello\n");
}

#[test]
fn arrays_and_slices() {
    let out = run(
        "fn main() {\n\
           let a = [1, 2, 3]\n\
           let b = a + [4]\n\
           print(#b)\n\
           print(b[3])\n\
           print(b[1:3])\n\
           if 3 in b { print(\"has3\") }\n\
         }",
    );
    assert_eq!(out, "4\n4\n[2, 3]\nhas3\n");
}

#[test]
fn objects_and_refs() {
    let out = run(
        "type Point = object { x: int, y: int = 0 }\n\
         fn main() {\n\
           let p = Point{x: 3}\n\
           print(p.x + p.y)\n\
           let r = new int(41)\n\
           print(@r + 1)\n\
         }",
    );
    assert_eq!(out, "3\n42\n");
}

#[test]
fn weak_after_free_is_nil() {
    let out = run(
        "fn main() {\n\
           var w: weak int = nil\n\
           {\n\
             let r = new int(5)\n\
             w = r\n\
             let s = w as ref int\n\
             if s != nil { print(@s) }\n\
           }\n\
           let dead = w as ref int\n\
           if dead == nil { print(\"dead\") }\n\
         }",
    );
    assert_eq!(out, "5\ndead\n");
}

#[test]
fn result_propagation() {
    let out = run(
        "fn may_fail(fail: bool) -> result[int] {\n\
           if fail { return err(\"nope\") }\n\
           return ok(10)\n\
         }\n\
         fn chain(fail: bool) -> result[int] {\n\
           let v = may_fail(fail)?\n\
           return ok(v + 1)\n\
         }\n\
         fn main() {\n\
           match chain(false) { ok(v) => print(v), err(m) => print(m) }\n\
           match chain(true) { ok(v) => print(v), err(m) => print(m) }\n\
         }",
    );
    assert_eq!(out, "11\nnope\n");
}

#[test]
fn option_match() {
    let out = run(
        "fn find(v: int) -> option[int] {\n\
           if v > 0 { return some(v) }\n\
           return none\n\
         }\n\
         fn main() {\n\
           match find(5) { some(v) => print(v), none => print(-1) }\n\
           match find(-2) { some(v) => print(v), none => print(-1) }\n\
         }",
    );
    assert_eq!(out, "5\n-1\n");
}

#[test]
fn overloads_and_generics() {
    let out = run(
        "fn describe(a: int) -> string { return \"int\" }\n\
         fn describe(a: string) -> string { return \"string\" }\n\
         fn id[T](x: T) -> T { return x }\n\
         fn main() {\n\
           print(describe(1))\n\
           print(describe(\"x\"))\n\
           print(id(7))\n\
           print(id(\"seven\"))\n\
         }",
    );
    assert_eq!(out, "int\nstring\n7\nseven\n");
}

#[test]
fn closures_capture_by_value() {
    let out = run(
        "fn main() {\n\
           let base = 10\n\
           let add = fn(x: int) -> int { return x + base }\n\
           print(add(5))\n\
         }",
    );
    assert_eq!(out, "15\n");
}

#[test]
fn default_arguments() {
    let out = run(
        "fn greet(times: int, bang: int = 1) -> int { return times + bang }\n\
         fn main() { print(greet(1)) print(greet(1, 5)) }",
    );
    assert_eq!(out, "2\n6\n");
}

#[test]
fn enums_and_casts() {
    let out = run(
        "type Color = enum { red, green = 5, blue }\n\
         type Id = distinct int\n\
         fn main() {\n\
           print(Color.green as int)\n\
           print(Color.blue as int)\n\
           let i = 7 as Id\n\
           print(i as int)\n\
           print(2.9 as int)\n\
           print(3 as float)\n\
         }",
    );
    assert_eq!(out, "5\n6\n7\n2\n3.0\n");
}

#[test]
fn comptime_injection() {
    let out = run(
        "fn main() {\n\
           comptime { inject(\"answer\", \"int\", 6 * 7) }\n\
           print(answer)\n\
         }",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn tuples() {
    let out = run(
        "fn main() {\n\
           let t = (1, \"two\")\n\
           print(t.0)\n\
           print(t.1)\n\
         }",
    );
    assert_eq!(out, "1\ntwo\n");
}

#[test]
fn modules_import() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("mathutil.etch"),
        "export fn triple(x: int) -> int { return x * 3 }\n",
    )
    .unwrap();
    let main_path = dir.path().join("main.etch");
    std::fs::write(
        &main_path,
        "import mathutil\nfn main() { print(triple(14)) }\n",
    )
    .unwrap();
    let mut ctx = context();
    ctx.compile_file(&main_path).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.take_output(), "42\n");
}

#[cfg(target_os = "linux")]
#[test]
fn ffi_cos_round_trip() {
    let out = run(
        "import ffi m { fn cos(x: float) -> float; }\n\
         fn main() { print(cos(0.0)) }",
    );
    assert_eq!(out, "1.0\n");
}

#[cfg(target_os = "linux")]
#[test]
fn ffi_missing_symbol_is_compile_error() {
    let err = compile_error(
        "import ffi m { fn surely_not_a_symbol_in_libm(); }\n\
         fn main() { }",
    );
    assert_eq!(err.kind, etchc::ErrorKind::ModuleNotFound);
}

#[test]
fn rc_objects_are_reclaimed() {
    let mut ctx = context();
    ctx.compile_string(
        "type Node = object { value: int, next: ref Node }\n\
         fn main() {\n\
           var i = 0\n\
           while i < 100 {\n\
             let n = new Node{value: i, next: nil}\n\
             i = i + 1\n\
           }\n\
           print(\"done\")\n\
         }",
        "rc.etch",
    )
    .unwrap();
    ctx.execute().unwrap();
    let stats = ctx.gc_stats();
    assert_eq!(stats.allocated, 100);
    assert_eq!(stats.live, 0, "all cells must reach refcount zero");
    assert_eq!(ctx.take_output(), "done\n");
}

#[test]
fn reference_cycles_are_collected() {
    let mut ctx = context();
    ctx.compile_string(
        "type Node = object { next: ref Node }\n\
         fn knot() {\n\
           let a = new Node{next: nil}\n\
           let b = new Node{next: a}\n\
           @a = Node{next: b}\n\
         }\n\
         fn main() {\n\
           knot()\n\
           print(\"tied\")\n\
         }",
        "cycle.etch",
    )
    .unwrap();
    ctx.execute().unwrap();
    let stats = ctx.gc_stats();
    assert_eq!(
        stats.live, 0,
        "cycle collector must reclaim the knot: {:?}",
        stats
    );
}

#[test]
fn coroutine_with_defer_runs_cleanup() {
    let out = run(
        "fn worker() -> coroutine[int] {\n\
           defer { print(\"cleanup\") }\n\
           yield 1\n\
           yield 2\n\
         }\n\
         fn main() {\n\
           {\n\
             let c = spawn worker()\n\
             match resume(c) { ok(v) => print(v), err(_) => print(-1) }\n\
           }\n\
           print(\"end\")\n\
         }",
    );
    assert_eq!(out, "1\ncleanup\nend\n");
}

#[test]
fn exit_code_is_mains_return() {
    let mut ctx = context();
    ctx.compile_string("fn main() -> int { return 3 }", "t.etch").unwrap();
    assert_eq!(ctx.execute().unwrap(), 3);
}

#[test]
fn optimizer_preserves_observable_behavior() {
    // Fusion, folding, immediates and loop hoisting all fire here; the
    // observable output must match the naive evaluation
    let out = run(
        "fn main() {\n\
           var acc = 0\n\
           let a = 3\n\
           let b = 4\n\
           for i in 0..10 {\n\
             acc = acc + a * b\n\
           }\n\
           print(acc)\n\
           print(2 + 3 * 4)\n\
           print((1 + 2) * (3 + 4))\n\
         }",
    );
    assert_eq!(out, "120\n14\n21\n");
}

#[test]
fn deterministic_output_across_runs() {
    let source = "fn main() { var i = 0 while i < 5 { i = i + 1 print(i * i) } }";
    assert_eq!(run(source), run(source));
}
