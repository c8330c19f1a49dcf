//! Context-aware rendering.
//!
//! One renderer is bound to each run; `text` writes literal template
//! text, `show` writes an interpolated value escaped for the rendering
//! context it appears in. Inside a URL attribute a small substate tracks
//! the path/query transition and `srcset` comma splitting.

use std::io::{self, Write};
use std::sync::Arc;

use crate::ast::Context;
use crate::code::Code;
use crate::error::RuntimeError;
use crate::fs::Format;
use crate::types::{Type, TypeId, TypeRegistry};
use crate::vm::value::{MapKey, Value};

/// Converts Markdown source to HTML.
pub type Converter = Arc<dyn Fn(&[u8], &mut dyn Write) -> io::Result<()> + Send + Sync>;

/// Destination of the `print` and `println` builtins.
pub type PrintFunc = Arc<dyn Fn(&str) + Send + Sync>;

/// A value read out of a register bank for showing.
#[derive(Debug, Clone)]
pub enum ShowData {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(Arc<str>),
    Value(Value),
}

#[derive(Debug, Default, Clone, Copy)]
struct UrlState {
    query: bool,
    is_set: bool,
    add_amp: bool,
}

pub struct Renderer<'w> {
    out: &'w mut dyn Write,
    url: Option<UrlState>,
    md: Option<Converter>,
}

impl<'w> Renderer<'w> {
    pub fn new(out: &'w mut dyn Write, md: Option<Converter>) -> Renderer<'w> {
        Renderer { out, url: None, md }
    }

    /// Writes literal template text, observing URL state transitions.
    pub fn text(&mut self, s: &str) -> io::Result<()> {
        if let Some(url) = &mut self.url {
            for ch in s.chars() {
                match ch {
                    '?' | '#' if !url.query => url.query = true,
                    ',' if url.is_set => {
                        url.query = false;
                        url.add_amp = false;
                    }
                    '&' | '?' => url.add_amp = false,
                    _ => {}
                }
            }
        }
        self.out.write_all(s.as_bytes())
    }

    pub fn url_start(&mut self, is_set: bool) {
        self.url = Some(UrlState { query: false, is_set, add_amp: false });
    }

    pub fn url_end(&mut self) {
        self.url = None;
    }

    /// Writes an interpolated value, escaped for `ctx`.
    pub fn show(
        &mut self,
        code: &Code,
        ty: TypeId,
        data: &ShowData,
        ctx: Context,
    ) -> Result<(), RuntimeError> {
        let reg = &code.registry;

        // A URL attribute has its own writer.
        if self.url.is_some() {
            let s = data_string(data);
            return Ok(self.show_in_url(&s)?);
        }

        // Format-typed values bypass escaping in their own context.
        if let Some(f) = reg.format_of(dynamic_type(data).unwrap_or(ty)) {
            return self.show_format(code, f, data, ctx);
        }

        // Stringer dispatch: a type implementing the context's interface
        // renders itself without escaping.
        let dty = dynamic_type(data).unwrap_or(ty);
        let method = match ctx {
            Context::Html => Some("HTML"),
            Context::Css | Context::CssString => Some("CSS"),
            Context::JavaScript | Context::JavaScriptString => Some("JS"),
            Context::Json => Some("JSON"),
            Context::Markdown => Some("Markdown"),
            _ => None,
        };
        if let Some(m) = method {
            if let Some(s) = self.call_stringer(code, dty, m, data)? {
                self.out.write_all(s.as_bytes()).map_err(RuntimeError::Io)?;
                return Ok(());
            }
        }
        // The plain Stringer applies in every text-like context.
        if matches!(
            ctx,
            Context::Text
                | Context::Html
                | Context::Tag
                | Context::Attribute
                | Context::UnquotedAttribute
                | Context::Markdown
        ) {
            if let Some(s) = self.call_stringer(code, dty, "String", data)? {
                return self.show_str(&s, ctx);
            }
        }

        match ctx {
            Context::JavaScript | Context::Json => {
                let mut buf = String::new();
                serialize_js(reg, ty, data, &mut buf, 0)?;
                self.out.write_all(buf.as_bytes()).map_err(RuntimeError::Io)
            }
            Context::Css => match data {
                ShowData::Value(v) => match v.unboxed() {
                    Value::Bytes(b) => {
                        let mut s = String::new();
                        for byte in b.lock().iter() {
                            s.push_str(&format!("{byte:02x}"));
                        }
                        self.out.write_all(s.as_bytes()).map_err(RuntimeError::Io)
                    }
                    _ => self.show_str(&data_string(data), ctx),
                },
                _ => self.show_str(&data_string(data), ctx),
            },
            _ => self.show_str(&data_string(data), ctx),
        }
    }

    fn show_format(
        &mut self,
        code: &Code,
        f: Format,
        data: &ShowData,
        ctx: Context,
    ) -> Result<(), RuntimeError> {
        let s = data_string(data);
        match (f, ctx) {
            // A format value in its own context is written verbatim.
            (Format::Html, Context::Html)
            | (Format::Css, Context::Css)
            | (Format::JavaScript, Context::JavaScript)
            | (Format::Json, Context::Json)
            | (Format::Markdown, Context::Markdown) => {
                self.out.write_all(s.as_bytes()).map_err(RuntimeError::Io)
            }
            // Markdown shown in HTML goes through the converter.
            (Format::Markdown, Context::Html) => {
                let md = self.md.clone().ok_or(RuntimeError::NoMarkdownConverter)?;
                md(s.as_bytes(), self.out).map_err(RuntimeError::Io)?;
                let _ = code;
                Ok(())
            }
            // Anywhere else the value is escaped like a plain string.
            _ => self.show_str(&s, ctx),
        }
    }

    fn call_stringer(
        &mut self,
        code: &Code,
        ty: TypeId,
        method: &str,
        data: &ShowData,
    ) -> Result<Option<String>, RuntimeError> {
        let imp = match code.method_impls.get(&(ty, method.to_string())) {
            Some(imp) => imp.clone(),
            None => return Ok(None),
        };
        let receiver = match data {
            ShowData::Value(v) => v.clone(),
            ShowData::Bool(b) => Value::Bool(*b),
            ShowData::Int(i) => Value::Int(*i),
            ShowData::Uint(u) => Value::Int(*u as i64),
            ShowData::Float(f) => Value::Float(*f),
            ShowData::Str(s) => Value::Str(s.clone()),
        };
        let results = imp(vec![receiver])?;
        match results.into_iter().next() {
            Some(Value::Str(s)) => Ok(Some(s.to_string())),
            Some(other) => Ok(Some(format_value(&other))),
            None => Ok(Some(String::new())),
        }
    }

    fn show_str(&mut self, s: &str, ctx: Context) -> Result<(), RuntimeError> {
        let escaped = match ctx {
            Context::Text => s.to_string(),
            Context::Html => html_escape(s),
            Context::Tag | Context::Attribute => attribute_escape(s),
            Context::UnquotedAttribute => {
                if s.chars().any(|c| c.is_whitespace() || matches!(c, '=' | '"' | '\'' | '`' | '<' | '>')) {
                    return Err(RuntimeError::Custom(Arc::from(
                        "cannot show value in unquoted attribute: it contains whitespace or a quote",
                    )));
                }
                attribute_escape(s)
            }
            Context::Css => {
                let mut out = String::from("\"");
                out.push_str(&css_string_escape(s));
                out.push('"');
                out
            }
            Context::CssString => css_string_escape(s),
            Context::JavaScriptString => js_string_escape(s),
            Context::JavaScript | Context::Json => {
                let mut out = String::from("\"");
                out.push_str(&js_string_escape(s));
                out.push('"');
                out
            }
            Context::Markdown => markdown_escape(s),
        };
        self.out.write_all(escaped.as_bytes()).map_err(RuntimeError::Io)
    }

    fn show_in_url(&mut self, s: &str) -> io::Result<()> {
        let mut url = self.url.unwrap_or_default();
        if url.query && url.add_amp {
            self.out.write_all(b"&amp;")?;
        }
        let mut out = String::new();
        for ch in s.chars() {
            match ch {
                '?' | '#' if !url.query => {
                    url.query = true;
                    out.push(ch);
                }
                ',' if url.is_set => {
                    url.query = false;
                    out.push(ch);
                }
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&#34;"),
                '\'' => out.push_str("&#39;"),
                _ => out.push(ch),
            }
        }
        if url.query {
            url.add_amp = true;
        }
        self.url = Some(url);
        self.out.write_all(out.as_bytes())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn write_raw(&mut self, s: &str) -> io::Result<()> {
        self.out.write_all(s.as_bytes())
    }
}

fn dynamic_type(data: &ShowData) -> Option<TypeId> {
    match data {
        ShowData::Value(Value::Dyn(t, _)) => Some(*t),
        _ => None,
    }
}

fn data_string(data: &ShowData) -> String {
    match data {
        ShowData::Bool(b) => b.to_string(),
        ShowData::Int(i) => i.to_string(),
        ShowData::Uint(u) => u.to_string(),
        ShowData::Float(f) => format_float(*f),
        ShowData::Str(s) => s.to_string(),
        ShowData::Value(v) => format_value(v),
    }
}

fn format_float(f: f64) -> String {
    if f == f.trunc() && f.is_finite() && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{f}")
    }
}

/// A human-readable rendering used by `print`, panics and text contexts.
pub fn format_value(v: &Value) -> String {
    match v {
        Value::Nil => "<nil>".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format_float(*f),
        Value::Complex(re, im) => format!("({}{}i)", format_float(*re), format_signed(*im)),
        Value::Str(s) => s.to_string(),
        Value::Bytes(b) => {
            let b = b.lock();
            String::from_utf8_lossy(&b).to_string()
        }
        Value::Slice(s) => {
            let items: Vec<String> = s.to_vec().iter().map(format_value).collect();
            format!("[{}]", items.join(" "))
        }
        Value::Map(m) => {
            let m = m.lock();
            let mut entries: Vec<String> = m
                .iter()
                .map(|(k, v)| format!("{}:{}", format_value(&k.to_value()), format_value(v)))
                .collect();
            entries.sort();
            format!("map[{}]", entries.join(" "))
        }
        Value::Struct(s) => {
            let items: Vec<String> = s.lock().iter().map(format_value).collect();
            format!("{{{}}}", items.join(" "))
        }
        Value::Ptr(p) => format!("&{}", format_value(&p.lock())),
        Value::Closure(_) | Value::Native(_) => "<func>".to_string(),
        Value::Chan(_) => "<chan>".to_string(),
        Value::Dyn(_, inner) => format_value(inner),
    }
}

fn format_signed(f: f64) -> String {
    if f >= 0.0 {
        format!("+{}", format_float(f))
    } else {
        format_float(f)
    }
}

// =============================================================================
// Escaping
// =============================================================================

/// HTML-escapes `<`, `>`, `&`, `"`, `'` and strips NUL bytes.
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            '\0' => {}
            _ => out.push(ch),
        }
    }
    out
}

/// Attribute-value escaping; strict superset of HTML escaping.
pub fn attribute_escape(s: &str) -> String {
    html_escape(s)
}

/// Escapes a string for a CSS string literal, per CSS3 escape rules.
pub fn css_string_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        let code = ch as u32;
        if ch.is_ascii_alphanumeric()
            || matches!(ch, ' ' | '-' | '_' | '.' | ',' | ':' | ';' | '/' | '!' | '#' | '%')
        {
            out.push(ch);
        } else {
            out.push_str(&format!("\\{code:x} "));
        }
    }
    out
}

/// Escapes a string for a JavaScript or JSON string literal (without the
/// surrounding quotes). HTML-significant characters are escaped too so
/// the output cannot close a surrounding `<script>` element.
pub fn js_string_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(ch),
        }
    }
    out
}

/// Escapes Markdown punctuation with backslashes.
pub fn markdown_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(
            ch,
            '\\' | '`' | '*' | '_' | '{' | '}' | '[' | ']' | '(' | ')' | '#' | '+' | '-' | '.'
                | '!' | '|' | '<' | '>'
        ) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// JSON-style serialization for JavaScript and JSON contexts, driven by
/// the static type where available and the runtime value otherwise.
fn serialize_js(
    reg: &TypeRegistry,
    ty: TypeId,
    data: &ShowData,
    out: &mut String,
    depth: u8,
) -> Result<(), RuntimeError> {
    if depth > 32 {
        return Err(RuntimeError::Custom(Arc::from("value too deep to serialize")));
    }
    match data {
        ShowData::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        ShowData::Int(i) => out.push_str(&i.to_string()),
        ShowData::Uint(u) => out.push_str(&u.to_string()),
        ShowData::Float(f) => {
            if f.is_finite() {
                out.push_str(&format_float(*f));
            } else {
                out.push_str("null");
            }
        }
        ShowData::Str(s) => {
            out.push('"');
            out.push_str(&js_string_escape(s));
            out.push('"');
        }
        ShowData::Value(v) => serialize_js_value(reg, ty, v, out, depth)?,
    }
    Ok(())
}

fn serialize_js_value(
    reg: &TypeRegistry,
    ty: TypeId,
    v: &Value,
    out: &mut String,
    depth: u8,
) -> Result<(), RuntimeError> {
    if depth > 32 {
        return Err(RuntimeError::Custom(Arc::from("value too deep to serialize")));
    }
    let v = v.unboxed();
    match v {
        Value::Nil => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => {
            if f.is_finite() {
                out.push_str(&format_float(*f));
            } else {
                out.push_str("null");
            }
        }
        Value::Str(s) => {
            out.push('"');
            out.push_str(&js_string_escape(s));
            out.push('"');
        }
        Value::Bytes(b) => {
            let b = b.lock();
            out.push('"');
            out.push_str(&js_string_escape(&String::from_utf8_lossy(&b)));
            out.push('"');
        }
        Value::Slice(s) => {
            let elem_ty = match reg.get(reg.underlying(ty)) {
                Type::Slice(e) | Type::Array(_, e) => *e,
                _ => crate::types::ANY,
            };
            out.push('[');
            for (i, item) in s.to_vec().iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                serialize_js_value(reg, elem_ty, item, out, depth + 1)?;
            }
            out.push(']');
        }
        Value::Map(m) => {
            let val_ty = match reg.get(reg.underlying(ty)) {
                Type::Map(_, v) => *v,
                _ => crate::types::ANY,
            };
            let m = m.lock();
            let mut entries: Vec<(String, &Value)> = m
                .iter()
                .map(|(k, v)| {
                    let key = match k {
                        MapKey::Str(s) => s.to_string(),
                        other => format_value(&other.to_value()),
                    };
                    (key, v)
                })
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            out.push('{');
            for (i, (k, val)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                out.push_str(&js_string_escape(k));
                out.push_str("\":");
                serialize_js_value(reg, val_ty, val, out, depth + 1)?;
            }
            out.push('}');
        }
        Value::Struct(s) => {
            let fields = match reg.get(reg.underlying(ty)) {
                Type::Struct(fields) => fields.clone(),
                _ => Vec::new(),
            };
            let vals = s.lock();
            out.push('{');
            for (i, val) in vals.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let (name, fty) = fields
                    .get(i)
                    .map(|f| (f.name.clone(), f.ty))
                    .unwrap_or_else(|| (i.to_string(), crate::types::ANY));
                out.push('"');
                out.push_str(&js_string_escape(&name));
                out.push_str("\":");
                serialize_js_value(reg, fty, val, out, depth + 1)?;
            }
            out.push('}');
        }
        Value::Complex(..) | Value::Closure(_) | Value::Native(_) | Value::Chan(_)
        | Value::Ptr(_) => {
            return Err(RuntimeError::Custom(Arc::from(format!(
                "cannot serialize {} in JavaScript context",
                v.kind_name()
            ))));
        }
        Value::Dyn(..) => unreachable!("unboxed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_escaping() {
        assert_eq!(html_escape("<b>&\"'"), "&lt;b&gt;&amp;&#34;&#39;");
        assert_eq!(html_escape("plain"), "plain");
        assert_eq!(html_escape("a\0b"), "ab");
    }

    #[test]
    fn js_escaping() {
        assert_eq!(js_string_escape("a\"b"), "a\\\"b");
        assert_eq!(js_string_escape("</script>"), "\\u003c/script\\u003e");
        assert_eq!(js_string_escape("line\nbreak"), "line\\nbreak");
    }

    #[test]
    fn markdown_escaping() {
        assert_eq!(markdown_escape("*bold*"), "\\*bold\\*");
        assert_eq!(markdown_escape("a#b"), "a\\#b");
    }

    #[test]
    fn float_formatting() {
        assert_eq!(format_float(1.0), "1");
        assert_eq!(format_float(1.5), "1.5");
        assert_eq!(format_float(-3.0), "-3");
    }

    #[test]
    fn url_state_query_transition() {
        let mut buf = Vec::new();
        {
            let mut r = Renderer::new(&mut buf, None);
            r.url_start(false);
            r.text("/p?").unwrap();
            r.show_in_url("a&b").unwrap();
            r.url_end();
        }
        assert_eq!(String::from_utf8(buf).unwrap(), "/p?a&amp;b");
    }

    #[test]
    fn url_state_srcset_comma_resets() {
        let mut buf = Vec::new();
        {
            let mut r = Renderer::new(&mut buf, None);
            r.url_start(true);
            r.show_in_url("/x?u=1").unwrap();
            r.text(", ").unwrap();
            r.show_in_url("/y").unwrap();
            r.url_end();
        }
        assert_eq!(String::from_utf8(buf).unwrap(), "/x?u=1, /y");
    }
}
