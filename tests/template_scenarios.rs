// End-to-end template scenarios: build with an in-memory file system,
// run, compare rendered output.

use std::sync::{Arc, Mutex};

use tela::{
    build, native_fn, BuildOptions, Converter, MapFiles, RunOptions, RuntimeError, TypeDesc,
    Value, Vars,
};

fn render_with(files: &[(&str, &str)], name: &str, opts: &BuildOptions) -> String {
    let fs = MapFiles::from_pairs(files.iter().copied());
    let t = build(&fs, name, opts).unwrap_or_else(|e| panic!("build {name}: {e}"));
    let mut out = Vec::new();
    t.run(&mut out, &Vars::new(), &RunOptions::default())
        .unwrap_or_else(|e| panic!("run {name}: {e}"));
    String::from_utf8(out).expect("output is UTF-8")
}

fn render(src: &str, opts: &BuildOptions) -> String {
    render_with(&[("index.html", src)], "index.html", opts)
}

fn with_var(name: &str, ty: TypeDesc, v: Value) -> BuildOptions {
    let mut opts = BuildOptions::default();
    opts.globals.add_var(name, ty, v);
    opts
}

#[test]
fn escape_in_html_context() {
    let opts = with_var("name", TypeDesc::String, Value::str("<b>"));
    assert_eq!(render("Hello {{ name }}!", &opts), "Hello &lt;b&gt;!");
}

#[test]
fn url_attribute_query_escaping() {
    let opts = with_var("q", TypeDesc::String, Value::str("a&b"));
    assert_eq!(
        render("<a href=\"/p?{{ q }}\">x</a>", &opts),
        "<a href=\"/p?a&amp;b\">x</a>",
    );
}

#[test]
fn srcset_comma_returns_to_path_state() {
    let mut opts = BuildOptions::default();
    opts.globals.add_var("a", TypeDesc::String, Value::str("/x?u=1"));
    opts.globals.add_var("b", TypeDesc::String, Value::str("/y"));
    assert_eq!(
        render("<img srcset=\"{{ a }}, {{ b }}\">", &opts),
        "<img srcset=\"/x?u=1, /y\">",
    );
}

#[test]
fn format_typed_value_bypasses_escaping() {
    let out = render("{% var s html = \"<i>\" %}{{ s }}", &BuildOptions::default());
    assert_eq!(out, "<i>");
    let out = render("{% var s string = \"<i>\" %}{{ s }}", &BuildOptions::default());
    assert_eq!(out, "&lt;i&gt;");
}

#[test]
fn macro_with_extension() {
    let out = render_with(
        &[
            ("index.html", "{% extends \"base.html\" %}{% macro Title html %}Hi{% end %}"),
            ("base.html", "<title>{% show Title() %}</title>"),
        ],
        "index.html",
        &BuildOptions::default(),
    );
    assert_eq!(out, "<title>Hi</title>");
}

#[test]
fn macro_with_parameters() {
    let out = render(
        "{% macro Greet(name string) %}Hello {{ name }}{% end %}{% show Greet(\"Ada\") %}",
        &BuildOptions::default(),
    );
    assert_eq!(out, "Hello Ada");
}

#[test]
fn include_shares_scope() {
    let out = render_with(
        &[
            ("index.html", "{% var x = 3 %}a{% include \"part.html\" %}b"),
            ("part.html", "[{{ x }}]"),
        ],
        "index.html",
        &BuildOptions::default(),
    );
    assert_eq!(out, "a[3]b");
}

#[test]
fn import_template_as_package() {
    let out = render_with(
        &[
            ("index.html", "{% import \"lib.html\" %}{% show lib.Em(\"x\") %}"),
            ("lib.html", "{% macro Em(s string) %}<em>{{ s }}</em>{% end %}"),
        ],
        "index.html",
        &BuildOptions::default(),
    );
    assert_eq!(out, "<em>x</em>");
}

#[test]
fn for_range_over_host_slice() {
    let items = Value::Slice(tela::vm::value::SliceVal::from_vec(vec![
        Value::str("a"),
        Value::str("b"),
        Value::str("c"),
    ]));
    let opts = with_var("items", TypeDesc::Slice(Box::new(TypeDesc::String)), items);
    assert_eq!(
        render("{% for i, v := range items %}{{ i }}:{{ v }};{% end %}", &opts),
        "0:a;1:b;2:c;",
    );
}

#[test]
fn if_else_chains() {
    let opts = with_var("n", TypeDesc::Int, Value::Int(2));
    let src = "{% if n == 1 %}one{% else if n == 2 %}two{% else %}many{% end %}";
    assert_eq!(render(src, &opts), "two");
}

#[test]
fn switch_statement() {
    let opts = with_var("n", TypeDesc::Int, Value::Int(3));
    let src = "{% switch n %}{% case 1, 2 %}low{% case 3 %}three{% default %}hi{% end %}";
    assert_eq!(render(src, &opts), "three");
}

#[test]
fn contains_operator() {
    let src = r#"{% if "hello" contains "ell" %}y{% else %}n{% end %}"#;
    assert_eq!(render(src, &BuildOptions::default()), "y");
    let src = r#"{% if "hello" contains 'z' %}y{% else %}n{% end %}"#;
    assert_eq!(render(src, &BuildOptions::default()), "n");
}

#[test]
fn constant_arithmetic_is_exact() {
    // 0.1 + 0.2 == 0.3 exactly: constants are arbitrary precision.
    let src = "{% if 0.1 + 0.2 == 0.3 %}exact{% else %}approx{% end %}";
    assert_eq!(render(src, &BuildOptions::default()), "exact");
    assert_eq!(render("{{ 5 / 2 }}", &BuildOptions::default()), "2");
    assert_eq!(render("{{ 5.0 / 2 }}", &BuildOptions::default()), "2.5");
    assert_eq!(render("{{ 1 << 10 }}", &BuildOptions::default()), "1024");
}

#[test]
fn native_function_call() {
    let mut opts = BuildOptions::default();
    opts.globals.add_func(
        "upper",
        TypeDesc::Func {
            params: vec![TypeDesc::String],
            results: vec![TypeDesc::String],
            variadic: false,
        },
        native_fn(|args| match args.first() {
            Some(Value::Str(s)) => Ok(vec![Value::str(s.to_uppercase())]),
            _ => Ok(vec![Value::str("")]),
        }),
    );
    assert_eq!(render("{{ upper(\"abc\") }}", &opts), "ABC");
}

#[test]
fn javascript_context_serializes_values() {
    let items = Value::Slice(tela::vm::value::SliceVal::from_vec(vec![
        Value::Int(1),
        Value::Int(2),
    ]));
    let mut opts = BuildOptions::default();
    opts.globals.add_var("xs", TypeDesc::Slice(Box::new(TypeDesc::Int)), items);
    opts.globals.add_var("s", TypeDesc::String, Value::str("</script>"));
    let out = render("<script>var a = {{ xs }}; var b = {{ s }};</script>", &opts);
    assert_eq!(
        out,
        "<script>var a = [1,2]; var b = \"\\u003c/script\\u003e\";</script>",
    );
}

#[test]
fn css_context_quotes_strings() {
    let opts = with_var("c", TypeDesc::String, Value::str("red"));
    let out = render("<style>p { color: {{ c }}; }</style>", &opts);
    assert_eq!(out, "<style>p { color: \"red\"; }</style>");
}

#[test]
fn markdown_in_html_requires_converter() {
    let fs = MapFiles::from_pairs([("index.html", "{{ md }}")]);
    let mut opts = BuildOptions::default();
    opts.globals.add_var("md", TypeDesc::Markdown, Value::str("# Title"));
    let t = build(&fs, "index.html", &opts).unwrap();
    let mut out = Vec::new();
    let err = t.run(&mut out, &Vars::new(), &RunOptions::default()).unwrap_err();
    assert!(matches!(err, RuntimeError::NoMarkdownConverter));

    // With a converter the value is converted at the boundary.
    let conv: Converter = Arc::new(|src, out| {
        out.write_all(b"<h1>")?;
        out.write_all(src.strip_prefix(b"# ").unwrap_or(src))?;
        out.write_all(b"</h1>")
    });
    let mut run_opts = RunOptions::default();
    run_opts.markdown_converter = Some(conv);
    let mut out = Vec::new();
    t.run(&mut out, &Vars::new(), &run_opts).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "<h1>Title</h1>");
}

#[test]
fn cancellation_stops_infinite_loop() {
    let fs = MapFiles::from_pairs([("index.html", "{% for %}{% end %}")]);
    let t = build(&fs, "index.html", &BuildOptions::default()).unwrap();
    let mut out = Vec::new();
    let mut opts = RunOptions::default();
    opts.timeout = Some(std::time::Duration::from_millis(50));
    let start = std::time::Instant::now();
    let err = t.run(&mut out, &Vars::new(), &opts).unwrap_err();
    assert!(matches!(err, RuntimeError::DeadlineExceeded), "{err}");
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
}

#[test]
fn memory_limit_stops_allocation() {
    let fs = MapFiles::from_pairs([(
        "index.html",
        "{% var s = \"x\" %}{% for %}{% s = s + s %}{% end %}",
    )]);
    let t = build(&fs, "index.html", &BuildOptions::default()).unwrap();
    let mut out = Vec::new();
    let mut opts = RunOptions::default();
    opts.memory_limit = Some(64 * 1024);
    let err = t.run(&mut out, &Vars::new(), &opts).unwrap_err();
    assert!(matches!(err, RuntimeError::OutOfMemory), "{err}");
}

#[test]
fn run_variables_override_host_values() {
    let opts = with_var("name", TypeDesc::String, Value::str("default"));
    let fs = MapFiles::from_pairs([("index.html", "{{ name }}")]);
    let t = build(&fs, "index.html", &opts).unwrap();
    let mut out = Vec::new();
    let mut vars = Vars::new();
    vars.insert("name".to_string(), Value::str("override"));
    t.run(&mut out, &vars, &RunOptions::default()).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "override");
}

#[test]
fn deterministic_compilation() {
    let files = [("index.html", "{% var x = 1 %}{{ x }}{% for i := 0; i < 3; i++ %}.{% end %}")];
    let fs = MapFiles::from_pairs(files);
    let t1 = build(&fs, "index.html", &BuildOptions::default()).unwrap();
    let t2 = build(&fs, "index.html", &BuildOptions::default()).unwrap();
    assert_eq!(t1.disassemble(-1), t2.disassemble(-1));
}

#[test]
fn disassemble_lists_main() {
    let fs = MapFiles::from_pairs([("index.html", "Hello {{ 1 + 2 }}")]);
    let t = build(&fs, "index.html", &BuildOptions::default()).unwrap();
    let asm = String::from_utf8(t.disassemble(10)).unwrap();
    assert!(asm.contains("Func main"), "{asm}");
    assert!(asm.contains("Show"), "{asm}");
}

#[test]
fn print_goes_to_the_hook() {
    let buf = Arc::new(Mutex::new(String::new()));
    let sink = buf.clone();
    let mut opts = RunOptions::default();
    opts.print = Some(Arc::new(move |s: &str| sink.lock().unwrap().push_str(s)));
    let fs = MapFiles::from_pairs([("index.html", "{% println(1, 2) %}ok")]);
    let t = build(&fs, "index.html", &BuildOptions::default()).unwrap();
    let mut out = Vec::new();
    t.run(&mut out, &Vars::new(), &opts).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "ok");
    assert_eq!(*buf.lock().unwrap(), "1 2\n");
}
