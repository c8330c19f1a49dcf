// Escape soundness: output embedded into a document never changes its
// structure, and unescaping recovers the shown value.

use proptest::prelude::*;
use tela::render::{html_escape, js_string_escape, markdown_escape};
use tela::{build, BuildOptions, MapFiles, RunOptions, TypeDesc, Value, Vars};

fn render_value(src: &str, name: &str, v: Value, ty: TypeDesc) -> String {
    let fs = MapFiles::from_pairs([("index.html", src)]);
    let mut opts = BuildOptions::default();
    opts.globals.add_var(name, ty, v);
    let t = build(&fs, "index.html", &opts).unwrap();
    let mut out = Vec::new();
    t.run(&mut out, &Vars::new(), &RunOptions::default()).unwrap();
    String::from_utf8(out).unwrap()
}

/// Reverses `html_escape`, as an HTML parser would interpret the output.
fn html_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&#34;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn html_escaping_is_structure_preserving(s in ".*") {
        let escaped = html_escape(&s);
        // No markup-significant character survives unescaped.
        prop_assert!(!escaped.contains('<'));
        prop_assert!(!escaped.contains('>'));
        prop_assert!(!escaped.contains('"'));
        prop_assert!(!escaped.contains('\''));
        // A reference parser recovers the value (minus stripped NULs).
        let want: String = s.chars().filter(|&c| c != '\0').collect();
        prop_assert_eq!(html_unescape(&escaped), want);
    }

    #[test]
    fn js_string_escaping_stays_inside_the_literal(s in ".*") {
        let escaped = js_string_escape(&s);
        prop_assert!(!escaped.contains('<'));
        prop_assert!(!escaped.contains('>'));
        // No unescaped quote can terminate the literal early.
        let mut prev_backslashes = 0;
        for ch in escaped.chars() {
            if ch == '"' {
                prop_assert!(prev_backslashes % 2 == 1, "unescaped quote in {escaped:?}");
            }
            if ch == '\\' {
                prev_backslashes += 1;
            } else {
                prev_backslashes = 0;
            }
        }
    }

    #[test]
    fn markdown_escaping_neutralizes_punctuation(s in "[a-z*_\\[\\]#`|!-]{0,24}") {
        let escaped = markdown_escape(&s);
        // Every Markdown-significant character is backslash-escaped.
        let mut chars = escaped.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\' {
                chars.next();
                continue;
            }
            prop_assert!(
                !matches!(c, '*' | '_' | '[' | ']' | '#' | '`' | '|' | '!'),
                "unescaped {c:?} in {escaped:?}"
            );
        }
    }

    #[test]
    fn shown_strings_round_trip_through_html(s in "[ -~]{0,32}") {
        let out = render_value("{{ v }}", "v", Value::str(&s), TypeDesc::String);
        prop_assert_eq!(html_unescape(&out), s);
    }
}

#[test]
fn attribute_context_escapes_quotes() {
    let out = render_value(
        "<a title=\"{{ v }}\">x</a>",
        "v",
        Value::str("\" onload=\"evil()"),
        TypeDesc::String,
    );
    assert_eq!(out, "<a title=\"&#34; onload=&#34;evil()\">x</a>");
}

#[test]
fn tag_context_is_escaped() {
    let out = render_value("<div {{ v }}>", "v", Value::str("a=\"b\""), TypeDesc::String);
    assert_eq!(out, "<div a=&#34;b&#34;>");
}

#[test]
fn numbers_render_plainly_everywhere() {
    assert_eq!(render_value("{{ v }}", "v", Value::Int(-7), TypeDesc::Int), "-7");
    assert_eq!(
        render_value("{{ v }}", "v", Value::Float(2.5), TypeDesc::Float64),
        "2.5",
    );
    assert_eq!(
        render_value("<script>{{ v }}</script>", "v", Value::Int(7), TypeDesc::Int),
        "<script>7</script>",
    );
}

#[test]
fn json_in_script_block() {
    let mut m = std::collections::HashMap::new();
    m.insert(tela::vm::value::MapKey::Str("b".into()), Value::Int(2));
    m.insert(tela::vm::value::MapKey::Str("a".into()), Value::Int(1));
    let v = Value::Map(std::sync::Arc::new(parking_lot::Mutex::new(m)));
    let out = render_value(
        "<script>var m = {{ v }};</script>",
        "v",
        v,
        TypeDesc::Map(Box::new(TypeDesc::String), Box::new(TypeDesc::Int)),
    );
    assert_eq!(out, "<script>var m = {\"a\":1,\"b\":2};</script>");
}
