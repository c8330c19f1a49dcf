//! Context-aware lexer.
//!
//! A template file interleaves literal text with code regions delimited by
//! `{{ }}` (show expression), `{% %}` (statement) and `{# #}` (comment).
//! The outer scanner is a hand-written byte machine that tracks HTML
//! parsing sub-states across the literal text, so that every token produced
//! inside a code region carries the rendering context it appears in. Code
//! regions themselves are tokenized with a Logos-derived raw lexer
//! implementing the Go lexical grammar, including semicolon insertion.

use logos::{Lexer as LogosLexer, Logos};
use unicode_ident::{is_xid_continue, is_xid_start};

use crate::ast::Context;
use crate::error::{LexError, LexErrorKind, Position};
use crate::fs::Format;

/// Token kinds. Lexeme text is recovered by slicing the source with the
/// token position, so variants carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tok {
    // Template structure
    Text,
    StartValue,     // {{
    EndValue,       // }}
    StartStatement, // {%
    EndStatement,   // %}
    Comment,        // {# ... #}
    StartUrl { is_set: bool },
    EndUrl,

    // Identifiers and literals
    Ident,
    Int,
    Float,
    Imag,
    Rune,
    InterpretedString,
    RawString,

    // Go keywords
    Break,
    Case,
    Chan,
    Const,
    Continue,
    Default,
    Defer,
    Else,
    Fallthrough,
    For,
    Func,
    Go,
    Goto,
    If,
    Import,
    Interface,
    Map,
    Package,
    Range,
    Return,
    Select,
    Struct,
    Switch,
    TypeKw,
    Var,

    // Template keywords
    End,
    Extends,
    Include,
    Macro,
    Show,
    Contains,

    // Operators and punctuation
    Ellipsis,
    ShlAssign,
    ShrAssign,
    AndNotAssign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    Shl,
    Shr,
    AndNot,
    LAnd,
    LOr,
    EqEq,
    NotEq,
    Le,
    Ge,
    Inc,
    Dec,
    Define,
    Arrow,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Bang,
    Lt,
    Gt,
    LParen,
    RParen,
    LBrack,
    RBrack,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Colon,
    Dot,

    Eof,
}

impl Tok {
    /// Reports whether a newline after this token synthesizes a semicolon.
    fn can_insert_semi_after(self) -> bool {
        matches!(
            self,
            Tok::Ident
                | Tok::Int
                | Tok::Float
                | Tok::Imag
                | Tok::Rune
                | Tok::InterpretedString
                | Tok::RawString
                | Tok::Break
                | Tok::Continue
                | Tok::Fallthrough
                | Tok::Return
                | Tok::Inc
                | Tok::Dec
                | Tok::RParen
                | Tok::RBrack
                | Tok::RBrace
                | Tok::End
        )
    }

    pub fn describe(self) -> &'static str {
        match self {
            Tok::Text => "text",
            Tok::StartValue => "{{",
            Tok::EndValue => "}}",
            Tok::StartStatement => "{%",
            Tok::EndStatement => "%}",
            Tok::Comment => "comment",
            Tok::StartUrl { .. } => "URL",
            Tok::EndUrl => "end of URL",
            Tok::Ident => "identifier",
            Tok::Int => "int literal",
            Tok::Float => "float literal",
            Tok::Imag => "imaginary literal",
            Tok::Rune => "rune literal",
            Tok::InterpretedString | Tok::RawString => "string literal",
            Tok::Break => "break",
            Tok::Case => "case",
            Tok::Chan => "chan",
            Tok::Const => "const",
            Tok::Continue => "continue",
            Tok::Default => "default",
            Tok::Defer => "defer",
            Tok::Else => "else",
            Tok::Fallthrough => "fallthrough",
            Tok::For => "for",
            Tok::Func => "func",
            Tok::Go => "go",
            Tok::Goto => "goto",
            Tok::If => "if",
            Tok::Import => "import",
            Tok::Interface => "interface",
            Tok::Map => "map",
            Tok::Package => "package",
            Tok::Range => "range",
            Tok::Return => "return",
            Tok::Select => "select",
            Tok::Struct => "struct",
            Tok::Switch => "switch",
            Tok::TypeKw => "type",
            Tok::Var => "var",
            Tok::End => "end",
            Tok::Extends => "extends",
            Tok::Include => "include",
            Tok::Macro => "macro",
            Tok::Show => "show",
            Tok::Contains => "contains",
            Tok::Ellipsis => "...",
            Tok::ShlAssign => "<<=",
            Tok::ShrAssign => ">>=",
            Tok::AndNotAssign => "&^=",
            Tok::AddAssign => "+=",
            Tok::SubAssign => "-=",
            Tok::MulAssign => "*=",
            Tok::DivAssign => "/=",
            Tok::ModAssign => "%=",
            Tok::AndAssign => "&=",
            Tok::OrAssign => "|=",
            Tok::XorAssign => "^=",
            Tok::Shl => "<<",
            Tok::Shr => ">>",
            Tok::AndNot => "&^",
            Tok::LAnd => "&&",
            Tok::LOr => "||",
            Tok::EqEq => "==",
            Tok::NotEq => "!=",
            Tok::Le => "<=",
            Tok::Ge => ">=",
            Tok::Inc => "++",
            Tok::Dec => "--",
            Tok::Define => ":=",
            Tok::Arrow => "<-",
            Tok::Assign => "=",
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::Slash => "/",
            Tok::Percent => "%",
            Tok::Amp => "&",
            Tok::Pipe => "|",
            Tok::Caret => "^",
            Tok::Bang => "!",
            Tok::Lt => "<",
            Tok::Gt => ">",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::LBrack => "[",
            Tok::RBrack => "]",
            Tok::LBrace => "{",
            Tok::RBrace => "}",
            Tok::Comma => ",",
            Tok::Semicolon => ";",
            Tok::Colon => ":",
            Tok::Dot => ".",
            Tok::Eof => "EOF",
        }
    }
}

/// A token with its position and the rendering context it was lexed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub tok: Tok,
    pub pos: Position,
    pub ctx: Context,
}

// =============================================================================
// Raw code-region lexer (Logos)
// =============================================================================

#[derive(Logos, Debug, Clone, Copy, PartialEq)]
#[logos(error = LexErrorKind)]
enum RawTok {
    #[regex(r"[\t\x0C\x0B ]+", logos::skip)]
    _Ws,

    // Newlines are kept as tokens to implement semicolon insertion.
    #[regex(r"\r\n|\n|\r")]
    Newline,

    #[regex(r"//[^\n\r]*", logos::skip)]
    _LineComment,

    // Block comment: not skipped, a contained newline acts as a newline.
    #[token("/*", lex_block_comment)]
    BlockComment,

    #[regex(r"[_\p{XID_Start}][_\p{XID_Continue}]*")]
    Ident,

    #[regex(r"`[^`]*`")]
    RawString,

    #[regex(r#""([^"\\\n\r]|\\.)*""#, validate_interpreted_string)]
    String,

    #[regex(r"'([^'\\\n\r]|\\.)+'", validate_rune_lit)]
    Rune,

    // Numeric literals; underscore placement is validated in the callback.
    #[regex(r"0[bB][01_]+", validate_number)]
    #[regex(r"0[oO][0-7_]+", validate_number)]
    #[regex(r"0[xX][0-9a-fA-F_]+", validate_number)]
    #[regex(r"[0-9][0-9_]*", validate_number)]
    Int,

    #[regex(
        r"([0-9][0-9_]*\.[0-9_]*([eE][+-]?[0-9]+)?)|([0-9][0-9_]*[eE][+-]?[0-9]+)|(\.[0-9][0-9_]*([eE][+-]?[0-9]+)?)",
        validate_number
    )]
    Float,

    #[regex(
        r"(([0-9][0-9_]*(\.[0-9_]*)?([eE][+-]?[0-9]+)?)|(\.[0-9][0-9_]*([eE][+-]?[0-9]+)?))i",
        validate_number
    )]
    Imag,

    #[token("...")]
    Ellipsis,
    #[token("<<=")]
    ShlAssign,
    #[token(">>=")]
    ShrAssign,
    #[token("&^=")]
    AndNotAssign,
    #[token("+=")]
    AddAssign,
    #[token("-=")]
    SubAssign,
    #[token("*=")]
    MulAssign,
    #[token("/=")]
    DivAssign,
    #[token("%=")]
    ModAssign,
    #[token("&=")]
    AndAssign,
    #[token("|=")]
    OrAssign,
    #[token("^=")]
    XorAssign,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("&^")]
    AndNot,
    #[token("&&")]
    LAnd,
    #[token("||")]
    LOr,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("++")]
    Inc,
    #[token("--")]
    Dec,
    #[token(":=")]
    Define,
    #[token("<-")]
    Arrow,
    #[token("=")]
    Assign,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("!")]
    Bang,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBrack,
    #[token("]")]
    RBrack,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,
}

fn lex_block_comment(lex: &mut LogosLexer<'_, RawTok>) -> Result<(), LexErrorKind> {
    let rem = lex.remainder().as_bytes();
    match rem.windows(2).position(|w| w == b"*/") {
        Some(pos) => {
            lex.bump(pos + 2);
            Ok(())
        }
        None => {
            lex.bump(rem.len());
            Err(LexErrorKind::UnterminatedComment)
        }
    }
}

fn validate_escapes(body: &str, quote: char) -> Result<(), LexErrorKind> {
    let mut it = body.chars();
    while let Some(c) = it.next() {
        if c != '\\' {
            continue;
        }
        match it.next() {
            Some('a' | 'b' | 'f' | 'n' | 'r' | 't' | 'v' | '\\') => {}
            Some(q) if q == quote => {}
            Some('x') => {
                for _ in 0..2 {
                    let h = it.next().ok_or(LexErrorKind::InvalidEscape)?;
                    if !h.is_ascii_hexdigit() {
                        return Err(LexErrorKind::InvalidEscape);
                    }
                }
            }
            Some('u') => {
                for _ in 0..4 {
                    let h = it.next().ok_or(LexErrorKind::InvalidEscape)?;
                    if !h.is_ascii_hexdigit() {
                        return Err(LexErrorKind::InvalidEscape);
                    }
                }
            }
            Some('U') => {
                for _ in 0..8 {
                    let h = it.next().ok_or(LexErrorKind::InvalidEscape)?;
                    if !h.is_ascii_hexdigit() {
                        return Err(LexErrorKind::InvalidEscape);
                    }
                }
            }
            Some('0'..='7') => {
                for _ in 0..2 {
                    match it.clone().next() {
                        Some('0'..='7') => {
                            it.next();
                        }
                        _ => return Err(LexErrorKind::InvalidEscape),
                    }
                }
            }
            _ => return Err(LexErrorKind::InvalidEscape),
        }
    }
    Ok(())
}

fn validate_interpreted_string(lex: &mut LogosLexer<'_, RawTok>) -> Result<(), LexErrorKind> {
    let s = lex.slice();
    validate_escapes(&s[1..s.len() - 1], '"')
}

fn validate_rune_lit(lex: &mut LogosLexer<'_, RawTok>) -> Result<(), LexErrorKind> {
    let s = lex.slice();
    if s.len() < 3 {
        return Err(LexErrorKind::UnterminatedRune);
    }
    // Escape forms are shared with strings; the "exactly one rune" check
    // happens when the literal value is decoded.
    validate_escapes(&s[1..s.len() - 1], '\'')
}

fn validate_number(lex: &mut LogosLexer<'_, RawTok>) -> Result<(), LexErrorKind> {
    let s = lex.slice();
    if s.starts_with('_') || s.ends_with('_') || s.contains("__") {
        return Err(LexErrorKind::InvalidNumber);
    }
    // An underscore may only separate digits, not follow a base prefix.
    let b = s.as_bytes();
    if b.len() > 2
        && (b[1].eq_ignore_ascii_case(&b'b')
            || b[1].eq_ignore_ascii_case(&b'o')
            || b[1].eq_ignore_ascii_case(&b'x'))
        && b[2] == b'_'
    {
        return Err(LexErrorKind::InvalidNumber);
    }
    Ok(())
}

// =============================================================================
// HTML machine
// =============================================================================

/// HTML parsing sub-state tracked while scanning literal text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Html {
    Out,
    /// After `<`, reading the tag name.
    TagName,
    /// Inside a tag, between attributes.
    Tag,
    AttrName,
    /// After `=`, before the value.
    AfterEq,
    AttrValue { quote: u8, url: bool }, // quote 0 means unquoted
    Script,
    ScriptString { quote: u8 },
    Style,
    StyleString { quote: u8 },
    Cdata,
    Comment,
}

const URL_ATTRIBUTES: &[&str] = &[
    "action", "cite", "data", "formaction", "href", "longdesc", "manifest", "poster", "src",
    "srcset",
];

fn is_url_attribute(name: &str) -> bool {
    URL_ATTRIBUTES.iter().any(|a| name.eq_ignore_ascii_case(a))
}

/// Lexer mode: templates interleave text and code regions, scripts are a
/// single code region covering the whole input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Template(Format),
    Script,
}

struct Lexer<'s> {
    src: &'s str,
    bytes: &'s [u8],
    i: usize,
    out: Vec<Token>,
    mode: Mode,
    line_starts: Vec<u32>,
    // HTML machine state (Html and Markdown formats only).
    html: Html,
    tag_name: String,
    attr_name: String,
    // String tracking for whole-file CSS/JS formats.
    flat_quote: u8,
}

/// Lexes a whole source in the given mode. A leading BOM must already be
/// stripped by the caller. The returned stream always ends with `Eof`.
pub fn lex(src: &str, mode: Mode) -> Result<Vec<Token>, LexError> {
    let mut lx = Lexer::new(src, mode);
    match mode {
        Mode::Template(_) => lx.run_template()?,
        Mode::Script => {
            lx.i = 0;
            lx.lex_code_region(RegionEnd::Eof, Context::Text)?;
        }
    }
    let pos = lx.pos_at(src.len(), src.len());
    let ctx = lx.base_context();
    lx.out.push(Token { tok: Tok::Eof, pos, ctx });
    Ok(lx.out)
}

/// Strips a leading byte-order mark, which is ignored like in Go sources.
pub fn strip_bom(src: &str) -> &str {
    src.strip_prefix('\u{FEFF}').unwrap_or(src)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionEnd {
    Value,     // }}
    Statement, // %}
    Eof,
}

impl<'s> Lexer<'s> {
    fn new(src: &'s str, mode: Mode) -> Self {
        let src = strip_bom(src);
        let mut line_starts = vec![0u32];
        for (i, b) in src.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        Self {
            src,
            bytes: src.as_bytes(),
            i: 0,
            out: Vec::new(),
            mode,
            line_starts,
            html: Html::Out,
            tag_name: String::new(),
            attr_name: String::new(),
            flat_quote: 0,
        }
    }

    fn base_context(&self) -> Context {
        match self.mode {
            Mode::Template(Format::Html) => Context::Html,
            Mode::Template(Format::Css) => Context::Css,
            Mode::Template(Format::JavaScript) => Context::JavaScript,
            Mode::Template(Format::Json) => Context::Json,
            Mode::Template(Format::Markdown) => Context::Markdown,
            Mode::Template(Format::Text) | Mode::Script => Context::Text,
        }
    }

    /// The rendering context for a code region opened at the current state.
    fn code_context(&self) -> Context {
        match self.mode {
            Mode::Template(Format::Html) | Mode::Template(Format::Markdown) => match self.html {
                Html::Out => self.base_context(),
                Html::TagName | Html::Tag | Html::AttrName => Context::Tag,
                Html::AfterEq | Html::AttrValue { quote: 0, .. } => Context::UnquotedAttribute,
                Html::AttrValue { .. } => Context::Attribute,
                Html::Script => Context::JavaScript,
                Html::ScriptString { .. } => Context::JavaScriptString,
                Html::Style => Context::Css,
                Html::StyleString { .. } => Context::CssString,
                Html::Cdata | Html::Comment => Context::Text,
            },
            Mode::Template(Format::Css) => {
                if self.flat_quote != 0 {
                    Context::CssString
                } else {
                    Context::Css
                }
            }
            Mode::Template(Format::JavaScript) => {
                if self.flat_quote != 0 {
                    Context::JavaScriptString
                } else {
                    Context::JavaScript
                }
            }
            _ => self.base_context(),
        }
    }

    fn pos_at(&self, start: usize, end_excl: usize) -> Position {
        let line_idx = match self.line_starts.binary_search(&(start as u32)) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = self.line_starts[line_idx] as usize;
        let column = self.src[line_start..start].chars().count() as u32 + 1;
        let end = if end_excl > start { end_excl - 1 } else { start };
        Position::new(line_idx as u32 + 1, column, start as u32, end as u32)
    }

    fn err(&self, kind: LexErrorKind, at: usize) -> LexError {
        let at = at.min(self.src.len());
        LexError { kind, pos: self.pos_at(at, at + 1) }
    }

    fn push(&mut self, tok: Tok, start: usize, end_excl: usize, ctx: Context) {
        let pos = self.pos_at(start, end_excl);
        self.out.push(Token { tok, pos, ctx });
    }

    // -------------------------------------------------------------------------
    // Literal text scanning
    // -------------------------------------------------------------------------

    fn run_template(&mut self) -> Result<(), LexError> {
        let track_html = matches!(
            self.mode,
            Mode::Template(Format::Html) | Mode::Template(Format::Markdown)
        );
        let track_flat = matches!(
            self.mode,
            Mode::Template(Format::Css) | Mode::Template(Format::JavaScript)
        );
        let mut text_start = self.i;
        while self.i < self.bytes.len() {
            let b = self.bytes[self.i];
            // Code region delimiters are not recognized inside CDATA
            // sections and HTML comments.
            let suppressed = matches!(self.html, Html::Cdata | Html::Comment);
            if b == b'{' && !suppressed && self.i + 1 < self.bytes.len() {
                let next = self.bytes[self.i + 1];
                if next == b'{' || next == b'%' || next == b'#' {
                    self.flush_text(text_start, self.i);
                    let pre = self.html;
                    match next {
                        b'{' => self.lex_region(RegionEnd::Value)?,
                        b'%' => self.lex_region(RegionEnd::Statement)?,
                        _ => self.lex_comment_region()?,
                    }
                    // An interpolation right after `=` starts an unquoted
                    // attribute value.
                    if next != b'#' && pre == Html::AfterEq && self.html == Html::AfterEq {
                        self.html = Html::AttrValue { quote: 0, url: false };
                    }
                    text_start = self.i;
                    continue;
                }
            }
            if track_html {
                if let Some(new_start) = self.step_html(text_start) {
                    text_start = new_start;
                    continue;
                }
            } else if track_flat {
                self.step_flat();
            }
            self.i += 1;
        }
        self.flush_text(text_start, self.i);
        Ok(())
    }

    fn flush_text(&mut self, start: usize, end_excl: usize) {
        if end_excl > start {
            self.push(Tok::Text, start, end_excl, Context::Text);
        }
    }

    /// Advances the flat CSS/JS string tracker over the byte at `self.i`.
    fn step_flat(&mut self) {
        let b = self.bytes[self.i];
        if self.flat_quote != 0 {
            if b == b'\\' {
                self.i += 1; // skip the escaped byte
            } else if b == self.flat_quote {
                self.flat_quote = 0;
            }
        } else if b == b'"'
            || b == b'\''
            || (b == b'`' && matches!(self.mode, Mode::Template(Format::JavaScript)))
        {
            self.flat_quote = b;
        }
    }

    /// Advances the HTML machine over the byte at `self.i`. Returns
    /// `Some(new_text_start)` when it emitted tokens or consumed bytes
    /// itself; `None` when the main loop should advance by one byte.
    fn step_html(&mut self, text_start: usize) -> Option<usize> {
        let b = self.bytes[self.i];
        match self.html {
            Html::Out => {
                if b == b'<' {
                    if self.starts_with_at(self.i, b"<!--") {
                        self.html = Html::Comment;
                        self.i += 4;
                        return Some(text_start);
                    }
                    if self.starts_with_at(self.i, b"<![CDATA[") {
                        self.html = Html::Cdata;
                        self.i += 9;
                        return Some(text_start);
                    }
                    let next = self.bytes.get(self.i + 1).copied().unwrap_or(0);
                    if next.is_ascii_alphabetic() || next == b'/' || next == b'!' {
                        self.html = Html::TagName;
                        self.tag_name.clear();
                        if next == b'/' {
                            self.tag_name.push('/');
                            self.i += 2;
                        } else {
                            self.i += 1;
                        }
                        return Some(text_start);
                    }
                }
                None
            }
            Html::TagName => {
                if b.is_ascii_alphanumeric() || b == b'-' || b == b'!' {
                    self.tag_name.push(b.to_ascii_lowercase() as char);
                    None
                } else {
                    // The byte that ended the name is reprocessed in the
                    // Tag state.
                    self.html = Html::Tag;
                    self.step_html(text_start)
                }
            }
            Html::Tag => {
                match b {
                    b'>' => {
                        if self.i > 0 && self.bytes[self.i - 1] == b'/' {
                            self.html = Html::Out; // self-closing
                        } else {
                            self.close_tag();
                        }
                    }
                    b'/' => {}
                    b'=' => self.html = Html::AfterEq,
                    _ if b.is_ascii_whitespace() => {}
                    _ => {
                        self.html = Html::AttrName;
                        self.attr_name.clear();
                        self.attr_name.push(b.to_ascii_lowercase() as char);
                    }
                }
                None
            }
            Html::AttrName => {
                match b {
                    b'=' => self.html = Html::AfterEq,
                    b'>' => self.close_tag(),
                    b'/' => self.html = Html::Tag,
                    _ if b.is_ascii_whitespace() => self.html = Html::Tag,
                    _ => self.attr_name.push(b.to_ascii_lowercase() as char),
                }
                None
            }
            Html::AfterEq => match b {
                b'"' | b'\'' => {
                    let url = !self.in_raw_text_tag() && is_url_attribute(&self.attr_name);
                    self.html = Html::AttrValue { quote: b, url };
                    if url {
                        // The URL markers wrap the attribute value: text up
                        // to and including the quote first, marker after.
                        self.flush_text(text_start, self.i + 1);
                        let is_set = self.attr_name.eq_ignore_ascii_case("srcset");
                        self.push(
                            Tok::StartUrl { is_set },
                            self.i + 1,
                            self.i + 1,
                            Context::Attribute,
                        );
                        self.i += 1;
                        return Some(self.i);
                    }
                    None
                }
                b'>' => {
                    self.close_tag();
                    None
                }
                _ if b.is_ascii_whitespace() => None,
                _ => {
                    self.html = Html::AttrValue { quote: 0, url: false };
                    None
                }
            },
            Html::AttrValue { quote, url } => {
                let ended = if quote == 0 {
                    b.is_ascii_whitespace() || b == b'>'
                } else {
                    b == quote
                };
                if ended {
                    if url {
                        // Quoted URL value: close the marker before the
                        // quote; the quote itself stays literal text.
                        self.flush_text(text_start, self.i);
                        self.push(Tok::EndUrl, self.i, self.i, Context::Attribute);
                        self.html = Html::Tag;
                        self.i += 1;
                        return Some(self.i - 1);
                    }
                    if quote == 0 && b == b'>' {
                        self.close_tag();
                    } else {
                        self.html = Html::Tag;
                    }
                }
                None
            }
            Html::Script => {
                if b == b'"' || b == b'\'' || b == b'`' {
                    self.html = Html::ScriptString { quote: b };
                } else if b == b'<' && self.close_tag_at(self.i, b"script") {
                    self.html = Html::Out;
                }
                None
            }
            Html::ScriptString { quote } => {
                if b == b'\\' {
                    self.i += 2;
                    return Some(text_start);
                }
                if b == quote {
                    self.html = Html::Script;
                }
                None
            }
            Html::Style => {
                if b == b'"' || b == b'\'' {
                    self.html = Html::StyleString { quote: b };
                } else if b == b'<' && self.close_tag_at(self.i, b"style") {
                    self.html = Html::Out;
                }
                None
            }
            Html::StyleString { quote } => {
                if b == b'\\' {
                    self.i += 2;
                    return Some(text_start);
                }
                if b == quote {
                    self.html = Html::Style;
                }
                None
            }
            Html::Cdata => {
                if b == b']' && self.starts_with_at(self.i, b"]]>") {
                    self.html = Html::Out;
                    self.i += 3;
                    return Some(text_start);
                }
                None
            }
            Html::Comment => {
                if b == b'-' && self.starts_with_at(self.i, b"-->") {
                    self.html = Html::Out;
                    self.i += 3;
                    return Some(text_start);
                }
                None
            }
        }
    }

    fn in_raw_text_tag(&self) -> bool {
        self.tag_name == "script" || self.tag_name == "style"
    }

    fn close_tag(&mut self) {
        self.html = match self.tag_name.as_str() {
            "script" => Html::Script,
            "style" => Html::Style,
            _ => Html::Out,
        };
    }

    fn starts_with_at(&self, i: usize, pat: &[u8]) -> bool {
        self.bytes[i..].starts_with(pat)
    }

    /// Reports whether a closing tag `</name ... >` starts at `i`.
    fn close_tag_at(&self, i: usize, name: &[u8]) -> bool {
        let rest = &self.bytes[i..];
        if rest.len() < 3 + name.len() || rest[1] != b'/' {
            return false;
        }
        if !rest[2..2 + name.len()].eq_ignore_ascii_case(name) {
            return false;
        }
        let mut j = 2 + name.len();
        while j < rest.len() && rest[j].is_ascii_whitespace() {
            j += 1;
        }
        j < rest.len() && rest[j] == b'>'
    }

    // -------------------------------------------------------------------------
    // Code regions
    // -------------------------------------------------------------------------

    fn lex_comment_region(&mut self) -> Result<(), LexError> {
        let start = self.i;
        let rest = &self.bytes[self.i + 2..];
        match rest.windows(2).position(|w| w == b"#}") {
            Some(p) => {
                let end_excl = self.i + 2 + p + 2;
                let ctx = self.code_context();
                self.push(Tok::Comment, start, end_excl, ctx);
                self.i = end_excl;
                Ok(())
            }
            None => Err(self.err(LexErrorKind::UnterminatedComment, start)),
        }
    }

    fn lex_region(&mut self, end: RegionEnd) -> Result<(), LexError> {
        let ctx = self.code_context();
        let start = self.i;
        let open = match end {
            RegionEnd::Value => Tok::StartValue,
            RegionEnd::Statement => Tok::StartStatement,
            RegionEnd::Eof => unreachable!(),
        };
        self.push(open, start, start + 2, ctx);
        self.i += 2;
        self.lex_code_region(end, ctx)
    }

    fn lex_code_region(&mut self, end: RegionEnd, ctx: Context) -> Result<(), LexError> {
        let region_base = self.i;
        let mut logos = RawTok::lexer(&self.src[region_base..]);
        let mut last_semi = false;
        let mut depth: i32 = 0;
        loop {
            let raw = logos.next();
            let span = logos.span();
            let (tstart, tend) = (region_base + span.start, region_base + span.end);
            match raw {
                None => {
                    self.i = self.src.len();
                    return match end {
                        RegionEnd::Eof => {
                            if last_semi {
                                let n = self.src.len();
                                self.push(Tok::Semicolon, n, n, ctx);
                            }
                            Ok(())
                        }
                        RegionEnd::Value => {
                            Err(self.err(LexErrorKind::UnterminatedValue, region_base))
                        }
                        RegionEnd::Statement => {
                            Err(self.err(LexErrorKind::UnterminatedStatement, region_base))
                        }
                    };
                }
                Some(Err(kind)) => return Err(self.err(kind, tstart)),
                Some(Ok(raw)) => {
                    let slice = &self.src[tstart..tend];
                    match raw {
                        RawTok::Newline => {
                            if last_semi {
                                last_semi = false;
                                self.push(Tok::Semicolon, tstart, tstart + 1, ctx);
                            }
                        }
                        RawTok::BlockComment => {
                            if (slice.contains('\n') || slice.contains('\r')) && last_semi {
                                last_semi = false;
                                self.push(Tok::Semicolon, tend, tend, ctx);
                            }
                        }
                        RawTok::RBrace if depth == 0 && end == RegionEnd::Value => {
                            if self.bytes.get(tend) == Some(&b'}') {
                                self.push(Tok::EndValue, tstart, tend + 1, ctx);
                                self.i = tend + 1;
                                return Ok(());
                            }
                            self.push(Tok::RBrace, tstart, tend, ctx);
                            last_semi = true;
                        }
                        RawTok::Percent if depth == 0 && end == RegionEnd::Statement => {
                            if self.bytes.get(tend) == Some(&b'}') {
                                self.push(Tok::EndStatement, tstart, tend + 1, ctx);
                                self.i = tend + 1;
                                return Ok(());
                            }
                            self.push(Tok::Percent, tstart, tend, ctx);
                            last_semi = false;
                        }
                        _ => {
                            let tok = match raw {
                                RawTok::Ident => self.map_ident(slice, tstart)?,
                                RawTok::Int => Tok::Int,
                                RawTok::Float => Tok::Float,
                                RawTok::Imag => Tok::Imag,
                                RawTok::Rune => Tok::Rune,
                                RawTok::String => Tok::InterpretedString,
                                RawTok::RawString => Tok::RawString,
                                RawTok::LBrace => {
                                    depth += 1;
                                    Tok::LBrace
                                }
                                RawTok::RBrace => {
                                    depth -= 1;
                                    Tok::RBrace
                                }
                                other => map_punct(other),
                            };
                            self.push(tok, tstart, tend, ctx);
                            last_semi = tok.can_insert_semi_after();
                        }
                    }
                }
            }
        }
    }

    fn map_ident(&self, s: &str, at: usize) -> Result<Tok, LexError> {
        if !valid_identifier(s) {
            return Err(self.err(LexErrorKind::InvalidToken, at));
        }
        let tok = match s {
            "break" => Tok::Break,
            "case" => Tok::Case,
            "chan" => Tok::Chan,
            "const" => Tok::Const,
            "continue" => Tok::Continue,
            "default" => Tok::Default,
            "defer" => Tok::Defer,
            "else" => Tok::Else,
            "fallthrough" => Tok::Fallthrough,
            "for" => Tok::For,
            "func" => Tok::Func,
            "go" => Tok::Go,
            "goto" => Tok::Goto,
            "if" => Tok::If,
            "import" => Tok::Import,
            "interface" => Tok::Interface,
            "map" => Tok::Map,
            "package" => Tok::Package,
            "range" => Tok::Range,
            "return" => Tok::Return,
            "select" => Tok::Select,
            "struct" => Tok::Struct,
            "switch" => Tok::Switch,
            "type" => Tok::TypeKw,
            "var" => Tok::Var,
            "contains" => Tok::Contains,
            // Template keywords; plain identifiers in script modality.
            "end" if matches!(self.mode, Mode::Template(_)) => Tok::End,
            "extends" if matches!(self.mode, Mode::Template(_)) => Tok::Extends,
            "include" if matches!(self.mode, Mode::Template(_)) => Tok::Include,
            "macro" if matches!(self.mode, Mode::Template(_)) => Tok::Macro,
            "show" if matches!(self.mode, Mode::Template(_)) => Tok::Show,
            _ => Tok::Ident,
        };
        Ok(tok)
    }
}

fn map_punct(raw: RawTok) -> Tok {
    match raw {
        RawTok::Ellipsis => Tok::Ellipsis,
        RawTok::ShlAssign => Tok::ShlAssign,
        RawTok::ShrAssign => Tok::ShrAssign,
        RawTok::AndNotAssign => Tok::AndNotAssign,
        RawTok::AddAssign => Tok::AddAssign,
        RawTok::SubAssign => Tok::SubAssign,
        RawTok::MulAssign => Tok::MulAssign,
        RawTok::DivAssign => Tok::DivAssign,
        RawTok::ModAssign => Tok::ModAssign,
        RawTok::AndAssign => Tok::AndAssign,
        RawTok::OrAssign => Tok::OrAssign,
        RawTok::XorAssign => Tok::XorAssign,
        RawTok::Shl => Tok::Shl,
        RawTok::Shr => Tok::Shr,
        RawTok::AndNot => Tok::AndNot,
        RawTok::LAnd => Tok::LAnd,
        RawTok::LOr => Tok::LOr,
        RawTok::EqEq => Tok::EqEq,
        RawTok::NotEq => Tok::NotEq,
        RawTok::Le => Tok::Le,
        RawTok::Ge => Tok::Ge,
        RawTok::Inc => Tok::Inc,
        RawTok::Dec => Tok::Dec,
        RawTok::Define => Tok::Define,
        RawTok::Arrow => Tok::Arrow,
        RawTok::Assign => Tok::Assign,
        RawTok::Plus => Tok::Plus,
        RawTok::Minus => Tok::Minus,
        RawTok::Star => Tok::Star,
        RawTok::Slash => Tok::Slash,
        RawTok::Percent => Tok::Percent,
        RawTok::Amp => Tok::Amp,
        RawTok::Pipe => Tok::Pipe,
        RawTok::Caret => Tok::Caret,
        RawTok::Bang => Tok::Bang,
        RawTok::Lt => Tok::Lt,
        RawTok::Gt => Tok::Gt,
        RawTok::LParen => Tok::LParen,
        RawTok::RParen => Tok::RParen,
        RawTok::LBrack => Tok::LBrack,
        RawTok::RBrack => Tok::RBrack,
        RawTok::Comma => Tok::Comma,
        RawTok::Semi => Tok::Semicolon,
        RawTok::Colon => Tok::Colon,
        RawTok::Dot => Tok::Dot,
        _ => Tok::Eof,
    }
}

fn valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else { return false };
    if first != '_' && !is_xid_start(first) {
        return false;
    }
    chars.all(|c| c == '_' || is_xid_continue(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str, format: Format) -> Vec<Tok> {
        let mut ts = lex(src, Mode::Template(format)).expect(src);
        assert_eq!(ts.pop().map(|t| t.tok), Some(Tok::Eof));
        ts.into_iter().map(|t| t.tok).collect()
    }

    fn ctxs(src: &str, format: Format) -> Vec<Context> {
        let mut ts = lex(src, Mode::Template(format)).expect(src);
        ts.pop();
        ts.into_iter().map(|t| t.ctx).collect()
    }

    #[test]
    fn token_types_table() {
        use Tok::*;
        let cases: &[(&str, &[Tok])] = &[
            ("", &[]),
            ("a", &[Text]),
            ("{", &[Text]),
            ("}", &[Text]),
            ("{{a}}", &[StartValue, Ident, EndValue]),
            ("{{ a }}", &[StartValue, Ident, EndValue]),
            ("{{\ta\n}}", &[StartValue, Ident, Semicolon, EndValue]),
            ("{{\na\t}}", &[StartValue, Ident, EndValue]),
            ("{{\na;\t}}", &[StartValue, Ident, Semicolon, EndValue]),
            ("{% var a = 1 %}", &[StartStatement, Var, Ident, Assign, Int, EndStatement]),
            ("{% a = 2 %}", &[StartStatement, Ident, Assign, Int, EndStatement]),
            ("{%for()%}", &[StartStatement, For, LParen, RParen, EndStatement]),
            ("{%\tfor()\n%}", &[StartStatement, For, LParen, RParen, Semicolon, EndStatement]),
            ("{%\tfor a%}", &[StartStatement, For, Ident, EndStatement]),
            ("{%end%}", &[StartStatement, End, EndStatement]),
            ("{% break %}", &[StartStatement, Break, EndStatement]),
            ("{% if a %}", &[StartStatement, If, Ident, EndStatement]),
            ("{% extends \"b.html\" %}", &[StartStatement, Extends, InterpretedString, EndStatement]),
            ("{# comment #}", &[Comment]),
            ("a{{b}}c", &[Text, StartValue, Ident, EndValue, Text]),
            ("{{a}}{{b}}", &[StartValue, Ident, EndValue, StartValue, Ident, EndValue]),
            ("<script></script>", &[Text]),
            ("<script>{{a}}</script>", &[Text, StartValue, Ident, EndValue, Text]),
            ("{{ _ }}", &[StartValue, Ident, EndValue]),
            ("{{ 3 }}", &[StartValue, Int, EndValue]),
            ("{{ -3 }}", &[StartValue, Minus, Int, EndValue]),
            ("{{ .0 }}", &[StartValue, Float, EndValue]),
            ("{{ a[3:8] }}", &[StartValue, Ident, LBrack, Int, Colon, Int, RBrack, EndValue]),
            ("{{ a contains b }}", &[StartValue, Ident, Contains, Ident, EndValue]),
            ("{{ `\\t` }}", &[StartValue, RawString, EndValue]),
            ("{{ \"\\u09AF\" }}", &[StartValue, InterpretedString, EndValue]),
            ("{{ T{} }}", &[StartValue, Ident, LBrace, RBrace, EndValue]),
            (
                "{{ ( 1 + 2 ) * 3 }}",
                &[StartValue, LParen, Int, Plus, Int, RParen, Star, Int, EndValue],
            ),
        ];
        for (src, want) in cases {
            assert_eq!(&toks(src, Format::Html)[..], *want, "source: {src:?}");
        }
    }

    #[test]
    fn contexts_in_html() {
        use Context::*;
        let cases: &[(&str, &[Context])] = &[
            ("a", &[Text]),
            ("{{a}}", &[Html, Html, Html]),
            ("<script></script>", &[Text]),
            (
                "<script>s{{a}}</script>{{a}}",
                &[Text, JavaScript, JavaScript, JavaScript, Text, Html, Html, Html],
            ),
            (
                "<style>s{{a}}</style>{{a}}",
                &[Text, Css, Css, Css, Text, Html, Html, Html],
            ),
            ("<style a=\"b\">{{1}}</style>", &[Text, Css, Css, Css, Text]),
            ("<![CDATA[<script>{{1}}</script>]]>", &[Text]),
            ("a<![CDATA[a]]>b{{2}}", &[Text, Html, Html, Html]),
            ("<a class=\"{{c}}\"></a>", &[Text, Attribute, Attribute, Attribute, Text]),
            (
                "<a class={{c}}></a>",
                &[Text, UnquotedAttribute, UnquotedAttribute, UnquotedAttribute, Text],
            ),
            ("<a {{c}}>", &[Text, Tag, Tag, Tag, Text]),
        ];
        for (src, want) in cases {
            assert_eq!(&ctxs(src, Format::Html)[..], *want, "source: {src:?}");
        }
    }

    #[test]
    fn contexts_in_text_format() {
        use Context::*;
        assert_eq!(ctxs("{{a}}", Format::Text), vec![Text, Text, Text]);
        assert_eq!(
            ctxs("<script>s{{a}}t</script>", Format::Text),
            vec![Text, Text, Text, Text, Text],
        );
    }

    #[test]
    fn contexts_in_css_format() {
        use Context::*;
        assert_eq!(ctxs("a: {{v}};", Format::Css), vec![Text, Css, Css, Css, Text]);
        assert_eq!(
            ctxs("a: \"{{v}}\";", Format::Css),
            vec![Text, CssString, CssString, CssString, Text],
        );
    }

    #[test]
    fn url_attribute_markers() {
        let ts = lex("<a href=\"/p?{{ q }}\">x</a>", Mode::Template(Format::Html)).unwrap();
        let kinds: Vec<Tok> = ts.iter().map(|t| t.tok).collect();
        assert_eq!(
            kinds,
            vec![
                Tok::Text,
                Tok::StartUrl { is_set: false },
                Tok::Text,
                Tok::StartValue,
                Tok::Ident,
                Tok::EndValue,
                Tok::EndUrl,
                Tok::Text,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn srcset_marker_is_set() {
        let ts = lex("<img srcset=\"{{ a }}\">", Mode::Template(Format::Html)).unwrap();
        assert!(ts.iter().any(|t| t.tok == Tok::StartUrl { is_set: true }));
    }

    #[test]
    fn class_attribute_is_not_url() {
        let ts = lex("<a class=\"{{ c }}\">", Mode::Template(Format::Html)).unwrap();
        assert!(!ts.iter().any(|t| matches!(t.tok, Tok::StartUrl { .. })));
    }

    #[test]
    fn positions_table() {
        let cases: &[(&str, &[(u32, u32, u32, u32)])] = &[
            ("a", &[(1, 1, 0, 0)]),
            ("\n", &[(1, 1, 0, 0)]),
            ("{{a}}", &[(1, 1, 0, 1), (1, 3, 2, 2), (1, 4, 3, 4)]),
            ("\n{{a}}", &[(1, 1, 0, 0), (2, 1, 1, 2), (2, 3, 3, 3), (2, 4, 4, 5)]),
            (
                "{{a.b}}",
                &[(1, 1, 0, 1), (1, 3, 2, 2), (1, 4, 3, 3), (1, 5, 4, 4), (1, 6, 5, 6)],
            ),
            (
                "{{1\t+\n2}}",
                &[(1, 1, 0, 1), (1, 3, 2, 2), (1, 5, 4, 4), (2, 1, 6, 6), (2, 2, 7, 8)],
            ),
            ("a{# a #}b", &[(1, 1, 0, 0), (1, 2, 1, 7), (1, 9, 8, 8)]),
            ("a{# 本 #}b", &[(1, 1, 0, 0), (1, 2, 1, 9), (1, 9, 10, 10)]),
        ];
        for (src, want) in cases {
            let mut ts = lex(src, Mode::Template(Format::Html)).expect(src);
            ts.pop();
            let got: Vec<(u32, u32, u32, u32)> = ts
                .iter()
                .map(|t| (t.pos.line, t.pos.column, t.pos.start, t.pos.end))
                .collect();
            assert_eq!(&got[..], *want, "source: {src:?}");
        }
    }

    #[test]
    fn script_mode_lexes_whole_input() {
        let ts = lex("var a = 1\na = a + 1\n", Mode::Script).unwrap();
        let kinds: Vec<Tok> = ts.iter().map(|t| t.tok).collect();
        assert_eq!(
            kinds,
            vec![
                Tok::Var,
                Tok::Ident,
                Tok::Assign,
                Tok::Int,
                Tok::Semicolon,
                Tok::Ident,
                Tok::Assign,
                Tok::Ident,
                Tok::Plus,
                Tok::Int,
                Tok::Semicolon,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn script_mode_template_keywords_are_identifiers() {
        let ts = lex("show := 1", Mode::Script).unwrap();
        assert_eq!(ts[0].tok, Tok::Ident);
    }

    #[test]
    fn unterminated_value_region() {
        let err = lex("{{ a ", Mode::Template(Format::Html)).unwrap_err();
        assert_eq!(err.kind, LexErrorKind::UnterminatedValue);
    }

    #[test]
    fn unterminated_comment_region() {
        let err = lex("a{# b", Mode::Template(Format::Html)).unwrap_err();
        assert_eq!(err.kind, LexErrorKind::UnterminatedComment);
    }

    #[test]
    fn invalid_escape_reported() {
        let err = lex(r#"{{ "\q" }}"#, Mode::Template(Format::Html)).unwrap_err();
        assert_eq!(err.kind, LexErrorKind::InvalidEscape);
    }

    #[test]
    fn invalid_number_underscores() {
        for src in ["{{ 1__2 }}", "{{ 0x_1 }}", "{{ 1_ }}"] {
            let err = lex(src, Mode::Template(Format::Html)).unwrap_err();
            assert_eq!(err.kind, LexErrorKind::InvalidNumber, "{src}");
        }
    }

    #[test]
    fn nested_braces_do_not_close_value() {
        let ts = lex("{{ map[string]int{}[a] }}", Mode::Template(Format::Html)).unwrap();
        assert_eq!(ts[ts.len() - 2].tok, Tok::EndValue);
    }

    #[test]
    fn bom_is_skipped() {
        let ts = lex("\u{FEFF}a", Mode::Template(Format::Html)).unwrap();
        assert_eq!(ts[0].tok, Tok::Text);
    }

    #[test]
    fn semicolon_inserted_before_eof_in_script() {
        let ts = lex("return 1", Mode::Script).unwrap();
        assert_eq!(ts[ts.len() - 2].tok, Tok::Semicolon);
    }
}
