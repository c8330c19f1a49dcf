// Diagnostics: every build error carries a path, a position and the
// expected message.

use tela::{build, BuildOptions, MapFiles, Script, TypeDesc, Value};

fn build_err(src: &str) -> tela::BuildError {
    let fs = MapFiles::from_pairs([("index.html", src)]);
    build(&fs, "index.html", &BuildOptions::default())
        .expect_err(&format!("expected error for {src:?}"))
}

#[test]
fn error_messages_table() {
    let cases: &[(&str, &str)] = &[
        ("{{ 42 + \"hello\" }}", "mismatched types int and string"),
        ("{{ missing }}", "undefined: missing"),
        ("{% var a = 1 %}{% var a = 2 %}{{ a }}", "a redeclared in this block"),
        ("{% if 1 %}x{% end %}", "non-bool 1 (type int) used as if condition"),
        ("{{ 1 / 0 }}", "division by zero"),
        ("{% var x int8 = 300 %}{{ x }}", "constant 300 overflows int8"),
        ("{% break %}", "break is not in a loop"),
        ("{{ len(42) }}", "invalid argument 42 (type int) for len"),
        ("{% var s string = 3 %}{{ s }}", "cannot use 3"),
        ("{{ nil }}", "use of untyped nil"),
        ("{% x = 1 %}", "undefined: x"),
        ("{% var f float64 = 1 %}{{ f % 2 }}", "operator % not defined on float64"),
    ];
    for (src, want) in cases {
        let err = build_err(src);
        assert!(
            err.message.contains(want),
            "source {src:?}: message {:?} does not contain {want:?}",
            err.message,
        );
        assert_eq!(err.path, "index.html");
        assert!(err.pos.line >= 1);
    }
}

#[test]
fn redeclaration_reports_previous_position() {
    let err = build_err("{% var a = 1 %}\n{% var a = 2 %}{{ a }}");
    assert!(err.message.contains("previous declaration at index.html:1:8"), "{}", err.message);
}

#[test]
fn format_types_are_nominal() {
    // A typed string value does not assign to a format type.
    let err = build_err("{% var s string = \"x\" %}{% var h html = s %}{{ h }}");
    assert!(err.message.contains("cannot use"), "{}", err.message);
    // Distinct format types never convert into each other.
    let err = build_err("{% var h html = \"x\" %}{{ css(h) }}");
    assert!(err.message.contains("cannot convert"), "{}", err.message);
    // Explicit conversion through string is fine in both directions.
    let fs = MapFiles::from_pairs([(
        "index.html",
        "{% var h html = \"x\" %}{% var s = string(h) %}{% var h2 = html(s) %}{{ h2 }}",
    )]);
    build(&fs, "index.html", &BuildOptions::default()).unwrap();
}

#[test]
fn show_legality_depends_on_context() {
    // A byte slice shows in CSS context but not in HTML context.
    let mut opts = BuildOptions::default();
    opts.globals.add_var(
        "bs",
        TypeDesc::Slice(Box::new(TypeDesc::Uint8)),
        Value::Slice(tela::vm::value::SliceVal::from_vec(vec![Value::Int(171)])),
    );
    let fs = MapFiles::from_pairs([("index.html", "<style>{{ bs }}</style>")]);
    build(&fs, "index.html", &opts).unwrap();
    let fs = MapFiles::from_pairs([("index.html", "{{ bs }}")]);
    let err = build(&fs, "index.html", &opts).unwrap_err();
    assert!(err.message.contains("cannot show"), "{}", err.message);
}

#[test]
fn macro_context_must_match() {
    let fs = MapFiles::from_pairs([(
        "index.html",
        "{% macro S css %}a { color: red }{% end %}<p>{% show S() %}</p>",
    )]);
    let err = build(&fs, "index.html", &BuildOptions::default()).unwrap_err();
    assert!(err.message.contains("different context"), "{}", err.message);
}

#[test]
fn go_statement_rejected_when_disallowed() {
    let mut opts = BuildOptions::default();
    opts.disallow_go_stmt = true;
    let err = Script::build("go func() { print(1) }()\n", "main.ggo", &opts).unwrap_err();
    assert!(err.message.contains("go statement not allowed"), "{}", err.message);
}

#[test]
fn templates_allow_unused_but_scripts_do_not() {
    let fs = MapFiles::from_pairs([("index.html", "{% var unused = 1 %}ok")]);
    build(&fs, "index.html", &BuildOptions::default()).unwrap();
    let err = Script::build("unused := 1\n", "main.ggo", &BuildOptions::default()).unwrap_err();
    assert!(err.message.contains("declared and not used"), "{}", err.message);
}

#[test]
fn error_position_points_at_the_expression() {
    let err = build_err("line one\n{{ 42 + \"x\" }}");
    assert_eq!(err.pos.line, 2);
}

#[test]
fn initialization_cycle_detected() {
    let fs = MapFiles::from_pairs([
        (
            "index.html",
            "{% extends \"base.html\" %}{% var a = b %}{% var b = a %}",
        ),
        ("base.html", "x"),
    ]);
    let err = build(&fs, "index.html", &BuildOptions::default()).unwrap_err();
    assert!(err.message.contains("initialization cycle"), "{}", err.message);
}

#[test]
fn wrong_arity_in_calls() {
    let fs = MapFiles::from_pairs([(
        "index.html",
        "{% macro M(a int) %}{{ a }}{% end %}{% show M(1, 2) %}",
    )]);
    let err = build(&fs, "index.html", &BuildOptions::default()).unwrap_err();
    assert!(err.message.contains("too many arguments in call to M"), "{}", err.message);
}
