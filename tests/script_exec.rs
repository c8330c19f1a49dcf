// Script execution: the VM without a renderer. Exit codes, closures,
// defer/panic/recover, goroutines and channels.

use std::sync::{Arc, Mutex};

use tela::{BuildOptions, RunOptions, RuntimeError, Script, Vars};

struct Captured {
    buf: Arc<Mutex<String>>,
    opts: RunOptions,
}

fn captured() -> Captured {
    let buf = Arc::new(Mutex::new(String::new()));
    let sink = buf.clone();
    let mut opts = RunOptions::default();
    opts.print = Some(Arc::new(move |s: &str| sink.lock().unwrap().push_str(s)));
    Captured { buf, opts }
}

fn run_script(src: &str) -> (i32, String) {
    let cap = captured();
    let script = Script::build(src, "main.ggo", &BuildOptions::default())
        .unwrap_or_else(|e| panic!("build: {e}"));
    let code = script
        .run(&Vars::new(), &cap.opts)
        .unwrap_or_else(|e| panic!("run: {e}"));
    let out = cap.buf.lock().unwrap().clone();
    (code, out)
}

fn run_script_err(src: &str) -> RuntimeError {
    let script = Script::build(src, "main.ggo", &BuildOptions::default())
        .unwrap_or_else(|e| panic!("build: {e}"));
    script.run(&Vars::new(), &RunOptions::default()).unwrap_err()
}

#[test]
fn arithmetic_and_print() {
    let (code, out) = run_script("print(1 + 2*3)");
    assert_eq!(code, 0);
    assert_eq!(out, "7");
}

#[test]
fn exit_code_propagates() {
    let (code, _) = run_script("exit(3)");
    assert_eq!(code, 3);
}

#[test]
fn functions_and_recursion() {
    let src = r#"
func fib(n int) int {
    if n < 2 {
        return n
    }
    return fib(n-1) + fib(n-2)
}
print(fib(10))
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "55");
}

#[test]
fn closures_capture_by_reference() {
    let src = r#"
counter := func() func() int {
    c := 0
    return func() int {
        c = c + 1
        return c
    }
}()
println(counter(), counter(), counter())
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "1 2 3\n");
}

#[test]
fn for_loops_and_break() {
    let src = r#"
sum := 0
for i := 0; i < 10; i++ {
    if i == 5 {
        break
    }
    sum += i
}
print(sum)
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "10");
}

#[test]
fn range_over_slice_and_map_builtins() {
    let src = r#"
xs := []int{3, 1, 4}
total := 0
for _, v := range xs {
    total += v
}
xs = append(xs, 1)
print(total, " ", len(xs))
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "8 4");
}

#[test]
fn maps_with_comma_ok() {
    let src = r#"
m := map[string]int{"a": 1}
v, ok := m["a"]
_, missing := m["b"]
if ok && !missing {
    print(v)
}
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "1");
}

#[test]
fn defer_runs_in_lifo_order() {
    let src = r#"
defer func() { print(1) }()
defer func() { print(2) }()
print(3)
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "321");
}

#[test]
fn deferred_arguments_are_evaluated_at_defer_time() {
    let src = r#"
show := func(n int) { print(n) }
x := 1
defer show(x)
x = 2
print(x)
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "21");
}

#[test]
fn panic_recovered_by_deferred_call() {
    let src = r#"
defer func() {
    v := recover()
    print("recovered: ", v)
}()
panic("x")
"#;
    let (code, out) = run_script(src);
    assert_eq!(code, 0);
    assert_eq!(out, "recovered: x");
}

#[test]
fn unrecovered_panic_surfaces() {
    let err = run_script_err("panic(\"boom\")");
    match err {
        RuntimeError::Panic(p) => {
            assert_eq!(p.chain.len(), 1);
            assert_eq!(p.chain[0].message, "boom");
            assert!(!p.chain[0].recovered);
        }
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn runtime_faults_are_recoverable_panics() {
    let src = r#"
defer func() {
    recover()
    print("ok")
}()
a := 0
print(1 / a)
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "ok");
    let err = run_script_err("a := 0\nprint(10 / a)");
    match err {
        RuntimeError::Panic(p) => {
            assert!(p.chain[0].message.contains("integer divide by zero"), "{p}");
        }
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn type_assertion_ok_form() {
    let src = r#"
var x any = 7
n, ok := x.(int)
if ok {
    print(n)
}
_, ok2 := x.(string)
if !ok2 {
    print(" no-string")
}
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "7 no-string");
}

#[test]
fn type_switch_binds_per_case() {
    let src = r#"
func describe(x any) {
    switch v := x.(type) {
    case int:
        print("int ", v)
    case string:
        print("string ", v)
    default:
        print("other")
    }
}
describe(3)
describe(" three")
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "int 3string  three");
}

#[test]
fn goroutines_and_channels() {
    let src = r#"
ch := make(chan int, 1)
go func() {
    ch <- 42
}()
print(<-ch)
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "42");
}

#[test]
fn channel_range_until_close() {
    let src = r#"
ch := make(chan int, 3)
ch <- 1
ch <- 2
ch <- 3
close(ch)
sum := 0
for v := range ch {
    sum += v
}
print(sum)
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "6");
}

#[test]
fn select_with_default() {
    let src = r#"
ch := make(chan int, 1)
ch <- 9
select {
case v := <-ch:
    print("got ", v)
default:
    print("empty")
}
select {
case v := <-ch:
    print(" again ", v)
default:
    print(" empty")
}
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "got 9 empty");
}

#[test]
fn goto_and_labels() {
    let src = r#"
i := 0
loop:
if i < 3 {
    print(i)
    i++
    goto loop
}
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "012");
}

#[test]
fn string_conversions() {
    let src = r#"
bs := []byte("abc")
print(string(bs), " ", len(bs), " ", string(65))
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "abc 3 A");
}

#[test]
fn unused_variable_is_an_error_in_scripts() {
    let err = Script::build("x := 1\n", "main.ggo", &BuildOptions::default()).unwrap_err();
    assert!(err.message.contains("x declared and not used"), "{}", err.message);
}

#[test]
fn variadic_functions() {
    let src = r#"
func sum(xs ...int) int {
    total := 0
    for _, x := range xs {
        total += x
    }
    return total
}
print(sum(1, 2, 3), " ", sum())
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "6 0");
}

#[test]
fn structs_and_pointers() {
    let src = r#"
type point struct {
    x int
    y int
}
p := point{1, 2}
q := &p
print(p.x + p.y)
_ = q
"#;
    let (_, out) = run_script(src);
    assert_eq!(out, "3");
}
