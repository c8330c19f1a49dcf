//! Abstract syntax tree.
//!
//! The whole compilation shares one flattened AST: nodes live in typed
//! arenas and reference each other through type-safe indices, variable
//! length lists are stored in centralized extra buffers, and identifiers
//! are interned symbols. Positions are kept in side tables so node
//! payloads stay small.

use core::marker::PhantomData;
use core::ops::{Index, IndexMut};
use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;

use crate::error::Position;
use crate::fs::Format;

// =============================================================================
// Rendering context
// =============================================================================

/// The lexical category a token or `show` appears in; it determines the
/// escaping applied to interpolated values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    Text,
    Html,
    Tag,
    Attribute,
    UnquotedAttribute,
    Css,
    CssString,
    JavaScript,
    JavaScriptString,
    Json,
    Markdown,
}

impl Context {
    pub fn from_format(f: Format) -> Context {
        match f {
            Format::Text => Context::Text,
            Format::Html => Context::Html,
            Format::Css => Context::Css,
            Format::JavaScript => Context::JavaScript,
            Format::Json => Context::Json,
            Format::Markdown => Context::Markdown,
        }
    }

    /// The format a macro must declare to be shown in this context.
    pub fn format(self) -> Format {
        match self {
            Context::Text => Format::Text,
            Context::Html | Context::Tag | Context::Attribute | Context::UnquotedAttribute => {
                Format::Html
            }
            Context::Css | Context::CssString => Format::Css,
            Context::JavaScript | Context::JavaScriptString => Format::JavaScript,
            Context::Json => Format::Json,
            Context::Markdown => Format::Markdown,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Context::Text => "text",
            Context::Html => "HTML",
            Context::Tag => "tag",
            Context::Attribute => "attribute",
            Context::UnquotedAttribute => "unquoted attribute",
            Context::Css => "CSS",
            Context::CssString => "CSS string",
            Context::JavaScript => "JavaScript",
            Context::JavaScriptString => "JavaScript string",
            Context::Json => "JSON",
            Context::Markdown => "Markdown",
        };
        f.write_str(s)
    }
}

// =============================================================================
// IDs, symbols, interner
// =============================================================================

/// Type-safe handle into an arena.
#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Id<T> {
    raw: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Copy for Id<T> {}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Id<T> {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self { raw, _marker: PhantomData }
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.raw
    }

    #[inline]
    pub const fn to_usize(self) -> usize {
        self.raw as usize
    }
}

pub type ExprId = Id<Expr>;
pub type StmtId = Id<Stmt>;
pub type TypeExprId = Id<TypeExpr>;
pub type CaseId = Id<Case>;

/// A reference to a list stored in an extra-data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListRef {
    pub start: u32,
    pub len: u32,
}

impl ListRef {
    pub const EMPTY: ListRef = ListRef { start: 0, len: 0 };

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    #[inline]
    pub const fn len(self) -> usize {
        self.len as usize
    }
}

/// An interned string handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Symbol(u32);

impl Symbol {
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_u32(v: u32) -> Self {
        Symbol(v)
    }
}

/// Deterministic 64-bit FNV-1a hash, good enough for an interner.
#[inline]
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// String interner: canonical storage plus a hash-to-candidates map, so
/// hits never allocate and misses allocate exactly once.
#[derive(Debug, Default)]
pub struct Interner {
    strings: Vec<Box<str>>,
    buckets: HashMap<u64, SmallVec<[Symbol; 1]>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> Symbol {
        let h = fnv1a64(s.as_bytes());
        if let Some(cands) = self.buckets.get(&h) {
            for &sym in cands {
                if &*self.strings[sym.as_u32() as usize] == s {
                    return sym;
                }
            }
        }
        let sym = Symbol::from_u32(self.strings.len() as u32);
        self.strings.push(s.into());
        self.buckets.entry(h).or_default().push(sym);
        sym
    }

    #[inline]
    pub fn resolve(&self, sym: Symbol) -> &str {
        &self.strings[sym.as_u32() as usize]
    }
}

// =============================================================================
// Arenas
// =============================================================================

/// A dense bump arena; IDs are stable indices and nodes never move.
#[derive(Debug)]
pub struct Arena<T> {
    data: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

impl<T> Arena<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn alloc(&mut self, value: T) -> Id<T> {
        let id = Id::from_raw(self.data.len() as u32);
        self.data.push(value);
        id
    }
}

impl<T> Index<Id<T>> for Arena<T> {
    type Output = T;
    #[inline]
    fn index(&self, id: Id<T>) -> &T {
        &self.data[id.to_usize()]
    }
}

impl<T> IndexMut<Id<T>> for Arena<T> {
    #[inline]
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.data[id.to_usize()]
    }
}

/// An arena with a parallel side table of positions.
#[derive(Debug)]
pub struct PosArena<T> {
    nodes: Arena<T>,
    positions: Vec<Position>,
}

impl<T> Default for PosArena<T> {
    fn default() -> Self {
        Self { nodes: Arena::default(), positions: Vec::new() }
    }
}

impl<T> PosArena<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn alloc(&mut self, node: T, pos: Position) -> Id<T> {
        let id = self.nodes.alloc(node);
        debug_assert_eq!(self.positions.len(), id.to_usize());
        self.positions.push(pos);
        id
    }

    #[inline]
    pub fn pos(&self, id: Id<T>) -> Position {
        self.positions[id.to_usize()]
    }
}

impl<T> Index<Id<T>> for PosArena<T> {
    type Output = T;
    #[inline]
    fn index(&self, id: Id<T>) -> &T {
        &self.nodes[id]
    }
}

impl<T> IndexMut<Id<T>> for PosArena<T> {
    #[inline]
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.nodes[id]
    }
}

// =============================================================================
// Node payload types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,    // -
    Pos,    // +
    Not,    // !
    BitNot, // ^
    Deref,  // *
    Addr,   // &
    Recv,   // <-
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    LOr,
    LAnd,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Contains,
    Add,
    Sub,
    Or,
    Xor,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    And,
    AndNot,
}

impl BinOp {
    /// Binding power for precedence climbing; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::LOr => 1,
            BinOp::LAnd => 2,
            BinOp::Eq
            | BinOp::NotEq
            | BinOp::Less
            | BinOp::LessEq
            | BinOp::Greater
            | BinOp::GreaterEq
            | BinOp::Contains => 3,
            BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor => 4,
            BinOp::Mul
            | BinOp::Div
            | BinOp::Rem
            | BinOp::Shl
            | BinOp::Shr
            | BinOp::And
            | BinOp::AndNot => 5,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::LOr => "||",
            BinOp::LAnd => "&&",
            BinOp::Eq => "==",
            BinOp::NotEq => "!=",
            BinOp::Less => "<",
            BinOp::LessEq => "<=",
            BinOp::Greater => ">",
            BinOp::GreaterEq => ">=",
            BinOp::Contains => "contains",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::And => "&",
            BinOp::AndNot => "&^",
        }
    }
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Pos => "+",
            UnOp::Not => "!",
            UnOp::BitNot => "^",
            UnOp::Deref => "*",
            UnOp::Addr => "&",
            UnOp::Recv => "<-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Define,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    AndNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChanDir {
    Both,
    Send,
    Recv,
}

/// A function or macro parameter / result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: Option<Symbol>,
    pub pos: Position,
    pub ty: TypeExprId,
}

/// A struct field; `name == None` marks an embedded field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: Option<Symbol>,
    pub pos: Position,
    pub ty: TypeExprId,
}

/// An interface method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDecl {
    pub name: Symbol,
    pub pos: Position,
    pub params: ListRef,
    pub results: ListRef,
    pub variadic: bool,
}

/// One element of a composite literal, with an optional key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyedElement {
    pub key: Option<ExprId>,
    pub value: ExprId,
}

/// A reference to a parsed tree (file) of the compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TreeRef(pub u32);

impl TreeRef {
    /// Placeholder used while a referenced file has not been loaded yet.
    pub const PENDING: TreeRef = TreeRef(u32::MAX);
}

// =============================================================================
// Expressions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expr {
    /// Integer literal; the symbol holds the lexeme.
    IntLit(Symbol),
    FloatLit(Symbol),
    ImagLit(Symbol),
    RuneLit(char),
    /// String literal; the symbol holds the decoded value.
    StringLit(Symbol),
    Ident(Symbol),
    Unary { op: UnOp, expr: ExprId },
    Binary { op: BinOp, lhs: ExprId, rhs: ExprId },
    Index { expr: ExprId, index: ExprId },
    Slice {
        expr: ExprId,
        low: Option<ExprId>,
        high: Option<ExprId>,
        max: Option<ExprId>,
    },
    Selector { expr: ExprId, sel: Symbol },
    /// `x.(T)`; a `None` type is the `x.(type)` form of a type switch.
    TypeAssert { expr: ExprId, ty: Option<TypeExprId> },
    Call { func: ExprId, args: ListRef, ellipsis: bool },
    /// Composite literal; a `None` type is an elided element type.
    Composite { ty: Option<TypeExprId>, elems: ListRef },
    FuncLit {
        params: ListRef,
        results: ListRef,
        variadic: bool,
        body: StmtId,
    },
    /// A type in expression position (conversion, composite type, ...).
    TypeE(TypeExprId),
}

// =============================================================================
// Type expressions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeExpr {
    Name(Symbol),
    Qualified { pkg: Symbol, name: Symbol },
    Ptr(TypeExprId),
    Slice(TypeExprId),
    /// `[n]T`; a `None` length is the `[...]T` form.
    Array { len: Option<ExprId>, elem: TypeExprId },
    Map { key: TypeExprId, value: TypeExprId },
    Chan { dir: ChanDir, elem: TypeExprId },
    Func { params: ListRef, results: ListRef, variadic: bool },
    Struct { fields: ListRef },
    Interface { methods: ListRef },
}

// =============================================================================
// Statements
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stmt {
    Expr(ExprId),
    Send { chan: ExprId, value: ExprId },
    IncDec { expr: ExprId, inc: bool },
    Assign { lhs: ListRef, rhs: ListRef, op: AssignOp },
    Var { names: ListRef, ty: Option<TypeExprId>, values: ListRef },
    Const { names: ListRef, ty: Option<TypeExprId>, values: ListRef, iota: u32 },
    TypeDecl { name: Symbol, alias: bool, ty: TypeExprId },
    FuncDecl {
        name: Symbol,
        params: ListRef,
        results: ListRef,
        variadic: bool,
        body: StmtId,
    },
    If {
        init: Option<StmtId>,
        cond: ExprId,
        then: StmtId,
        els: Option<StmtId>,
    },
    For {
        init: Option<StmtId>,
        cond: Option<ExprId>,
        post: Option<StmtId>,
        body: StmtId,
    },
    ForRange {
        key: Option<ExprId>,
        value: Option<ExprId>,
        define: bool,
        expr: ExprId,
        body: StmtId,
    },
    Switch { init: Option<StmtId>, expr: Option<ExprId>, cases: ListRef },
    TypeSwitch {
        init: Option<StmtId>,
        binding: Option<Symbol>,
        subject: ExprId,
        cases: ListRef,
    },
    Select { cases: ListRef },
    Return { values: ListRef },
    Break { label: Option<Symbol> },
    Continue { label: Option<Symbol> },
    Goto { label: Symbol },
    Labeled { label: Symbol, stmt: StmtId },
    Fallthrough,
    Defer(ExprId),
    Go(ExprId),
    Block { stmts: ListRef },

    // Template statements
    Text(Symbol),
    Show { exprs: ListRef, ctx: Context },
    ShowMacro { call: ExprId, ctx: Context },
    MacroDecl {
        name: Symbol,
        params: ListRef,
        variadic: bool,
        format: Format,
        body: ListRef,
    },
    Include { path: Symbol, tree: TreeRef },
    Import { alias: Option<Symbol>, dot: bool, path: Symbol, tree: Option<TreeRef> },
    Extends { path: Symbol, tree: TreeRef },
    Url { is_set: bool, stmts: ListRef },
    Comment(Symbol),
}

/// A `case`/`default` clause of a switch, type switch or select. For
/// select clauses `comm` holds the communication statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Case {
    pub exprs: ListRef,
    pub comm: Option<StmtId>,
    pub body: ListRef,
}

/// A parsed file.
#[derive(Debug, Clone)]
pub struct Tree {
    pub path: String,
    pub format: Format,
    pub nodes: ListRef,
}

// =============================================================================
// Central arena
// =============================================================================

/// Extra-data buffers holding variable-length lists referenced by
/// `ListRef`, so nodes stay fixed-size and copyable.
#[derive(Debug, Default)]
pub struct Extras {
    pub exprs: Vec<ExprId>,
    pub stmts: Vec<StmtId>,
    pub cases: Vec<CaseId>,
    pub params: Vec<Param>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<MethodDecl>,
    pub elements: Vec<KeyedElement>,
}

fn push_list<T>(buf: &mut Vec<T>, items: impl IntoIterator<Item = T>) -> ListRef {
    let start = buf.len();
    buf.extend(items);
    let len = buf.len() - start;
    ListRef { start: start as u32, len: len as u32 }
}

fn slice<T>(buf: &[T], list: ListRef) -> &[T] {
    &buf[list.start as usize..(list.start + list.len) as usize]
}

/// The compilation-wide AST: all trees of a build share these arenas.
#[derive(Debug, Default)]
pub struct Ast {
    pub exprs: PosArena<Expr>,
    pub stmts: PosArena<Stmt>,
    pub types: PosArena<TypeExpr>,
    pub cases: PosArena<Case>,
    pub extras: Extras,
    pub interner: Interner,
    pub trees: Vec<Tree>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> Symbol {
        self.interner.intern(s)
    }

    pub fn name(&self, sym: Symbol) -> &str {
        self.interner.resolve(sym)
    }

    pub fn add_tree(&mut self, tree: Tree) -> TreeRef {
        let r = TreeRef(self.trees.len() as u32);
        self.trees.push(tree);
        r
    }

    pub fn tree(&self, r: TreeRef) -> &Tree {
        &self.trees[r.0 as usize]
    }

    // List constructors and accessors, one pair per extra buffer.

    pub fn expr_list(&mut self, items: impl IntoIterator<Item = ExprId>) -> ListRef {
        push_list(&mut self.extras.exprs, items)
    }

    pub fn exprs_of(&self, list: ListRef) -> &[ExprId] {
        slice(&self.extras.exprs, list)
    }

    pub fn stmt_list(&mut self, items: impl IntoIterator<Item = StmtId>) -> ListRef {
        push_list(&mut self.extras.stmts, items)
    }

    pub fn stmts_of(&self, list: ListRef) -> &[StmtId] {
        slice(&self.extras.stmts, list)
    }

    pub fn case_list(&mut self, items: impl IntoIterator<Item = CaseId>) -> ListRef {
        push_list(&mut self.extras.cases, items)
    }

    pub fn cases_of(&self, list: ListRef) -> &[CaseId] {
        slice(&self.extras.cases, list)
    }

    pub fn param_list(&mut self, items: impl IntoIterator<Item = Param>) -> ListRef {
        push_list(&mut self.extras.params, items)
    }

    pub fn params_of(&self, list: ListRef) -> &[Param] {
        slice(&self.extras.params, list)
    }

    pub fn field_list(&mut self, items: impl IntoIterator<Item = FieldDecl>) -> ListRef {
        push_list(&mut self.extras.fields, items)
    }

    pub fn fields_of(&self, list: ListRef) -> &[FieldDecl] {
        slice(&self.extras.fields, list)
    }

    pub fn method_list(&mut self, items: impl IntoIterator<Item = MethodDecl>) -> ListRef {
        push_list(&mut self.extras.methods, items)
    }

    pub fn methods_of(&self, list: ListRef) -> &[MethodDecl] {
        slice(&self.extras.methods, list)
    }

    pub fn element_list(&mut self, items: impl IntoIterator<Item = KeyedElement>) -> ListRef {
        push_list(&mut self.extras.elements, items)
    }

    pub fn elements_of(&self, list: ListRef) -> &[KeyedElement] {
        slice(&self.extras.elements, list)
    }

    /// A short source-like rendering of an expression, for diagnostics.
    pub fn describe_expr(&self, e: ExprId) -> String {
        let mut s = String::new();
        printer::write_expr(self, e, &mut s);
        s
    }
}

// =============================================================================
// Canonical printer
// =============================================================================

/// Renders a tree back to template source. The output is canonical, not
/// byte-identical: whitespace inside code regions is normalized. Parsing
/// the printed source yields a structurally equal tree.
pub mod printer {
    use super::*;

    pub fn print_tree(ast: &Ast, tree: TreeRef) -> String {
        let mut out = String::new();
        let nodes = ast.stmts_of(ast.tree(tree).nodes).to_vec();
        for s in nodes {
            write_stmt(ast, s, &mut out, true);
        }
        out
    }

    fn template_stmt(ast: &Ast, s: StmtId, out: &mut String, body: &str) {
        let _ = ast;
        let _ = s;
        out.push_str("{% ");
        out.push_str(body);
        out.push_str(" %}");
    }

    pub(super) fn write_stmt(ast: &Ast, s: StmtId, out: &mut String, template: bool) {
        match ast.stmts[s] {
            Stmt::Text(sym) => out.push_str(ast.name(sym)),
            Stmt::Comment(sym) => {
                out.push_str("{# ");
                out.push_str(ast.name(sym));
                out.push_str(" #}");
            }
            Stmt::Show { exprs, .. } => {
                out.push_str("{{ ");
                for (i, &e) in ast.exprs_of(exprs).iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_expr(ast, e, out);
                }
                out.push_str(" }}");
            }
            Stmt::ShowMacro { call, .. } => {
                let mut b = String::from("show ");
                write_expr(ast, call, &mut b);
                template_stmt(ast, s, out, &b);
            }
            Stmt::MacroDecl { name, params, variadic, format, body } => {
                let mut b = String::from("macro ");
                b.push_str(ast.name(name));
                b.push('(');
                write_params(ast, params, variadic, &mut b);
                b.push(')');
                match format {
                    Format::Text => {}
                    Format::Html => b.push_str(" html"),
                    Format::Css => b.push_str(" css"),
                    Format::JavaScript => b.push_str(" js"),
                    Format::Json => b.push_str(" json"),
                    Format::Markdown => b.push_str(" markdown"),
                }
                template_stmt(ast, s, out, &b);
                for &inner in ast.stmts_of(body) {
                    write_stmt(ast, inner, out, true);
                }
                template_stmt(ast, s, out, "end macro");
            }
            Stmt::Include { path, .. } => {
                template_stmt(ast, s, out, &format!("include {:?}", ast.name(path)));
            }
            Stmt::Extends { path, .. } => {
                template_stmt(ast, s, out, &format!("extends {:?}", ast.name(path)));
            }
            Stmt::Import { alias, dot, path, .. } => {
                let mut b = String::from("import ");
                if dot {
                    b.push_str(". ");
                } else if let Some(a) = alias {
                    b.push_str(ast.name(a));
                    b.push(' ');
                }
                b.push_str(&format!("{:?}", ast.name(path)));
                template_stmt(ast, s, out, &b);
            }
            Stmt::Url { stmts, .. } => {
                for &inner in ast.stmts_of(stmts) {
                    write_stmt(ast, inner, out, template);
                }
            }
            Stmt::If { .. } | Stmt::For { .. } | Stmt::ForRange { .. } | Stmt::Switch { .. }
            | Stmt::TypeSwitch { .. } | Stmt::Select { .. } => {
                write_control(ast, s, out, template)
            }
            Stmt::Block { stmts } if template => {
                for &inner in ast.stmts_of(stmts) {
                    write_stmt(ast, inner, out, template);
                }
            }
            _ => {
                let mut b = String::new();
                write_simple_stmt(ast, s, &mut b);
                if template {
                    template_stmt(ast, s, out, &b);
                } else {
                    out.push_str(&b);
                    out.push('\n');
                }
            }
        }
    }

    fn write_control(ast: &Ast, s: StmtId, out: &mut String, template: bool) {
        let mut header = String::new();
        let mut bodies: Vec<StmtId> = Vec::new();
        let mut end = "end";
        match ast.stmts[s] {
            Stmt::If { init, cond, then, els } => {
                header.push_str("if ");
                if let Some(init) = init {
                    write_simple_stmt(ast, init, &mut header);
                    header.push_str("; ");
                }
                write_expr(ast, cond, &mut header);
                template_stmt(ast, s, out, &header);
                write_block_stmts(ast, then, out, template);
                let mut cur = els;
                while let Some(e) = cur {
                    match ast.stmts[e] {
                        Stmt::If { init, cond, then, els } => {
                            let mut h = String::from("else if ");
                            if let Some(init) = init {
                                write_simple_stmt(ast, init, &mut h);
                                h.push_str("; ");
                            }
                            write_expr(ast, cond, &mut h);
                            template_stmt(ast, s, out, &h);
                            write_block_stmts(ast, then, out, template);
                            cur = els;
                        }
                        _ => {
                            template_stmt(ast, s, out, "else");
                            write_block_stmts(ast, e, out, template);
                            cur = None;
                        }
                    }
                }
                template_stmt(ast, s, out, "end if");
                return;
            }
            Stmt::For { init, cond, post, body } => {
                header.push_str("for ");
                if init.is_some() || post.is_some() {
                    if let Some(init) = init {
                        write_simple_stmt(ast, init, &mut header);
                    }
                    header.push_str("; ");
                    if let Some(c) = cond {
                        write_expr(ast, c, &mut header);
                    }
                    header.push_str("; ");
                    if let Some(p) = post {
                        write_simple_stmt(ast, p, &mut header);
                    }
                } else if let Some(c) = cond {
                    write_expr(ast, c, &mut header);
                }
                bodies.push(body);
                end = "end for";
            }
            Stmt::ForRange { key, value, define, expr, body } => {
                header.push_str("for ");
                if let Some(k) = key {
                    write_expr(ast, k, &mut header);
                    if let Some(v) = value {
                        header.push_str(", ");
                        write_expr(ast, v, &mut header);
                    }
                    header.push_str(if define { " := range " } else { " = range " });
                } else {
                    header.push_str("range ");
                }
                write_expr(ast, expr, &mut header);
                bodies.push(body);
                end = "end for";
            }
            Stmt::Switch { init, expr, cases } => {
                header.push_str("switch");
                if let Some(init) = init {
                    header.push(' ');
                    write_simple_stmt(ast, init, &mut header);
                    header.push(';');
                }
                if let Some(e) = expr {
                    header.push(' ');
                    write_expr(ast, e, &mut header);
                }
                template_stmt(ast, s, out, &header);
                write_cases(ast, cases, out, template);
                template_stmt(ast, s, out, "end switch");
                return;
            }
            Stmt::TypeSwitch { init, binding, subject, cases } => {
                header.push_str("switch ");
                if let Some(init) = init {
                    write_simple_stmt(ast, init, &mut header);
                    header.push_str("; ");
                }
                if let Some(b) = binding {
                    header.push_str(ast.name(b));
                    header.push_str(" := ");
                }
                write_expr(ast, subject, &mut header);
                header.push_str(".(type)");
                template_stmt(ast, s, out, &header);
                write_cases(ast, cases, out, template);
                template_stmt(ast, s, out, "end switch");
                return;
            }
            Stmt::Select { cases } => {
                template_stmt(ast, s, out, "select");
                write_cases(ast, cases, out, template);
                template_stmt(ast, s, out, "end select");
                return;
            }
            _ => unreachable!(),
        }
        template_stmt(ast, s, out, &header);
        for b in bodies {
            write_block_stmts(ast, b, out, template);
        }
        template_stmt(ast, s, out, end);
    }

    fn write_cases(ast: &Ast, cases: ListRef, out: &mut String, template: bool) {
        for &c in ast.cases_of(cases) {
            let case = ast.cases[c];
            let mut h = String::new();
            if case.exprs.is_empty() && case.comm.is_none() {
                h.push_str("default");
            } else {
                h.push_str("case ");
                if let Some(comm) = case.comm {
                    write_simple_stmt(ast, comm, &mut h);
                } else {
                    for (i, &e) in ast.exprs_of(case.exprs).iter().enumerate() {
                        if i > 0 {
                            h.push_str(", ");
                        }
                        write_expr(ast, e, &mut h);
                    }
                }
            }
            out.push_str("{% ");
            out.push_str(&h);
            out.push_str(" %}");
            let body = ast.stmts_of(case.body).to_vec();
            for s in body {
                write_stmt(ast, s, out, template);
            }
        }
    }

    fn write_block_stmts(ast: &Ast, block: StmtId, out: &mut String, template: bool) {
        match ast.stmts[block] {
            Stmt::Block { stmts } => {
                for &s in ast.stmts_of(stmts) {
                    write_stmt(ast, s, out, template);
                }
            }
            _ => write_stmt(ast, block, out, template),
        }
    }

    pub(super) fn write_simple_stmt(ast: &Ast, s: StmtId, out: &mut String) {
        match ast.stmts[s] {
            Stmt::Expr(e) => write_expr(ast, e, out),
            Stmt::Send { chan, value } => {
                write_expr(ast, chan, out);
                out.push_str(" <- ");
                write_expr(ast, value, out);
            }
            Stmt::IncDec { expr, inc } => {
                write_expr(ast, expr, out);
                out.push_str(if inc { "++" } else { "--" });
            }
            Stmt::Assign { lhs, rhs, op } => {
                for (i, &e) in ast.exprs_of(lhs).iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_expr(ast, e, out);
                }
                out.push_str(match op {
                    AssignOp::Assign => " = ",
                    AssignOp::Define => " := ",
                    AssignOp::Add => " += ",
                    AssignOp::Sub => " -= ",
                    AssignOp::Mul => " *= ",
                    AssignOp::Div => " /= ",
                    AssignOp::Rem => " %= ",
                    AssignOp::And => " &= ",
                    AssignOp::Or => " |= ",
                    AssignOp::Xor => " ^= ",
                    AssignOp::Shl => " <<= ",
                    AssignOp::Shr => " >>= ",
                    AssignOp::AndNot => " &^= ",
                });
                for (i, &e) in ast.exprs_of(rhs).iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_expr(ast, e, out);
                }
            }
            Stmt::Var { names, ty, values } => {
                out.push_str("var ");
                write_name_list(ast, names, out);
                if let Some(t) = ty {
                    out.push(' ');
                    write_type(ast, t, out);
                }
                if !values.is_empty() {
                    out.push_str(" = ");
                    for (i, &e) in ast.exprs_of(values).iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        write_expr(ast, e, out);
                    }
                }
            }
            Stmt::Const { names, ty, values, .. } => {
                out.push_str("const ");
                write_name_list(ast, names, out);
                if let Some(t) = ty {
                    out.push(' ');
                    write_type(ast, t, out);
                }
                if !values.is_empty() {
                    out.push_str(" = ");
                    for (i, &e) in ast.exprs_of(values).iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        write_expr(ast, e, out);
                    }
                }
            }
            Stmt::TypeDecl { name, alias, ty } => {
                out.push_str("type ");
                out.push_str(ast.name(name));
                out.push_str(if alias { " = " } else { " " });
                write_type(ast, ty, out);
            }
            Stmt::Return { values } => {
                out.push_str("return");
                for (i, &e) in ast.exprs_of(values).iter().enumerate() {
                    out.push_str(if i > 0 { ", " } else { " " });
                    write_expr(ast, e, out);
                }
            }
            Stmt::Break { label } => {
                out.push_str("break");
                if let Some(l) = label {
                    out.push(' ');
                    out.push_str(ast.name(l));
                }
            }
            Stmt::Continue { label } => {
                out.push_str("continue");
                if let Some(l) = label {
                    out.push(' ');
                    out.push_str(ast.name(l));
                }
            }
            Stmt::Goto { label } => {
                out.push_str("goto ");
                out.push_str(ast.name(label));
            }
            Stmt::Fallthrough => out.push_str("fallthrough"),
            Stmt::Defer(e) => {
                out.push_str("defer ");
                write_expr(ast, e, out);
            }
            Stmt::Go(e) => {
                out.push_str("go ");
                write_expr(ast, e, out);
            }
            _ => out.push_str("/* statement */"),
        }
    }

    fn write_name_list(ast: &Ast, names: ListRef, out: &mut String) {
        for (i, &e) in ast.exprs_of(names).iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write_expr(ast, e, out);
        }
    }

    pub(super) fn write_params(ast: &Ast, params: ListRef, variadic: bool, out: &mut String) {
        let ps = ast.params_of(params);
        for (i, p) in ps.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            if let Some(n) = p.name {
                out.push_str(ast.name(n));
                out.push(' ');
            }
            if variadic && i + 1 == ps.len() {
                out.push_str("...");
            }
            write_type(ast, p.ty, out);
        }
    }

    pub fn write_expr(ast: &Ast, e: ExprId, out: &mut String) {
        write_expr_prec(ast, e, 0, out);
    }

    fn write_expr_prec(ast: &Ast, e: ExprId, min: u8, out: &mut String) {
        match ast.exprs[e] {
            Expr::IntLit(s) | Expr::FloatLit(s) | Expr::ImagLit(s) => out.push_str(ast.name(s)),
            Expr::RuneLit(c) => {
                out.push('\'');
                out.push_str(&c.escape_default().to_string());
                out.push('\'');
            }
            Expr::StringLit(s) => out.push_str(&format!("{:?}", ast.name(s))),
            Expr::Ident(s) => out.push_str(ast.name(s)),
            Expr::Unary { op, expr } => {
                out.push_str(op.symbol());
                write_expr_prec(ast, expr, 6, out);
            }
            Expr::Binary { op, lhs, rhs } => {
                let p = op.precedence();
                let paren = p < min;
                if paren {
                    out.push('(');
                }
                write_expr_prec(ast, lhs, p, out);
                out.push(' ');
                out.push_str(op.symbol());
                out.push(' ');
                write_expr_prec(ast, rhs, p + 1, out);
                if paren {
                    out.push(')');
                }
            }
            Expr::Index { expr, index } => {
                write_expr_prec(ast, expr, 6, out);
                out.push('[');
                write_expr(ast, index, out);
                out.push(']');
            }
            Expr::Slice { expr, low, high, max } => {
                write_expr_prec(ast, expr, 6, out);
                out.push('[');
                if let Some(l) = low {
                    write_expr(ast, l, out);
                }
                out.push(':');
                if let Some(h) = high {
                    write_expr(ast, h, out);
                }
                if let Some(m) = max {
                    out.push(':');
                    write_expr(ast, m, out);
                }
                out.push(']');
            }
            Expr::Selector { expr, sel } => {
                write_expr_prec(ast, expr, 6, out);
                out.push('.');
                out.push_str(ast.name(sel));
            }
            Expr::TypeAssert { expr, ty } => {
                write_expr_prec(ast, expr, 6, out);
                out.push_str(".(");
                match ty {
                    Some(t) => write_type(ast, t, out),
                    None => out.push_str("type"),
                }
                out.push(')');
            }
            Expr::Call { func, args, ellipsis } => {
                write_expr_prec(ast, func, 6, out);
                out.push('(');
                let list = ast.exprs_of(args);
                for (i, &a) in list.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_expr(ast, a, out);
                    if ellipsis && i + 1 == list.len() {
                        out.push_str("...");
                    }
                }
                out.push(')');
            }
            Expr::Composite { ty, elems } => {
                if let Some(t) = ty {
                    write_type(ast, t, out);
                }
                out.push('{');
                for (i, el) in ast.elements_of(elems).iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if let Some(k) = el.key {
                        write_expr(ast, k, out);
                        out.push_str(": ");
                    }
                    write_expr(ast, el.value, out);
                }
                out.push('}');
            }
            Expr::FuncLit { params, results, variadic, body } => {
                out.push_str("func(");
                write_params(ast, params, variadic, out);
                out.push(')');
                write_results(ast, results, out);
                out.push(' ');
                write_script_block(ast, body, out);
            }
            Expr::TypeE(t) => write_type(ast, t, out),
        }
    }

    /// Writes a result list: a bare type for one unnamed result, a
    /// parenthesized parameter list otherwise.
    fn write_results(ast: &Ast, results: ListRef, out: &mut String) {
        let rs = ast.params_of(results);
        if rs.len() == 1 && rs[0].name.is_none() {
            out.push(' ');
            write_type(ast, rs[0].ty, out);
        } else if !rs.is_empty() {
            out.push_str(" (");
            write_params(ast, results, false, out);
            out.push(')');
        }
    }

    /// Writes a brace-delimited statement block in the script grammar,
    /// used for function literal bodies.
    fn write_script_block(ast: &Ast, block: StmtId, out: &mut String) {
        let stmts: Vec<StmtId> = match ast.stmts[block] {
            Stmt::Block { stmts } => ast.stmts_of(stmts).to_vec(),
            _ => vec![block],
        };
        if stmts.is_empty() {
            out.push_str("{}");
            return;
        }
        out.push_str("{ ");
        for (i, &s) in stmts.iter().enumerate() {
            if i > 0 {
                out.push_str("; ");
            }
            write_script_stmt(ast, s, out);
        }
        out.push_str(" }");
    }

    /// Writes one statement in the script grammar: control flow uses
    /// braces, not statement regions.
    fn write_script_stmt(ast: &Ast, s: StmtId, out: &mut String) {
        match ast.stmts[s] {
            Stmt::If { init, cond, then, els } => {
                out.push_str("if ");
                if let Some(init) = init {
                    write_simple_stmt(ast, init, out);
                    out.push_str("; ");
                }
                write_expr(ast, cond, out);
                out.push(' ');
                write_script_block(ast, then, out);
                if let Some(els) = els {
                    out.push_str(" else ");
                    match ast.stmts[els] {
                        Stmt::If { .. } => write_script_stmt(ast, els, out),
                        _ => write_script_block(ast, els, out),
                    }
                }
            }
            Stmt::For { init, cond, post, body } => {
                out.push_str("for ");
                if init.is_some() || post.is_some() {
                    if let Some(init) = init {
                        write_simple_stmt(ast, init, out);
                    }
                    out.push_str("; ");
                    if let Some(c) = cond {
                        write_expr(ast, c, out);
                    }
                    out.push_str("; ");
                    if let Some(p) = post {
                        write_simple_stmt(ast, p, out);
                    }
                    out.push(' ');
                } else if let Some(c) = cond {
                    write_expr(ast, c, out);
                    out.push(' ');
                }
                write_script_block(ast, body, out);
            }
            Stmt::ForRange { key, value, define, expr, body } => {
                out.push_str("for ");
                if let Some(k) = key {
                    write_expr(ast, k, out);
                    if let Some(v) = value {
                        out.push_str(", ");
                        write_expr(ast, v, out);
                    }
                    out.push_str(if define { " := range " } else { " = range " });
                } else {
                    out.push_str("range ");
                }
                write_expr(ast, expr, out);
                out.push(' ');
                write_script_block(ast, body, out);
            }
            Stmt::Switch { init, expr, cases } => {
                out.push_str("switch ");
                if let Some(init) = init {
                    write_simple_stmt(ast, init, out);
                    out.push_str("; ");
                }
                if let Some(e) = expr {
                    write_expr(ast, e, out);
                    out.push(' ');
                }
                out.push('{');
                write_script_cases(ast, cases, out);
                out.push_str(" }");
            }
            Stmt::TypeSwitch { init, binding, subject, cases } => {
                out.push_str("switch ");
                if let Some(init) = init {
                    write_simple_stmt(ast, init, out);
                    out.push_str("; ");
                }
                if let Some(b) = binding {
                    out.push_str(ast.name(b));
                    out.push_str(" := ");
                }
                write_expr(ast, subject, out);
                out.push_str(".(type) {");
                write_script_cases(ast, cases, out);
                out.push_str(" }");
            }
            Stmt::Select { cases } => {
                out.push_str("select {");
                write_script_cases(ast, cases, out);
                out.push_str(" }");
            }
            Stmt::Labeled { label, stmt } => {
                out.push_str(ast.name(label));
                out.push_str(": ");
                write_script_stmt(ast, stmt, out);
            }
            Stmt::Block { .. } => write_script_block(ast, s, out),
            _ => write_simple_stmt(ast, s, out),
        }
    }

    fn write_script_cases(ast: &Ast, cases: ListRef, out: &mut String) {
        for &c in ast.cases_of(cases) {
            let case = ast.cases[c];
            if case.exprs.is_empty() && case.comm.is_none() {
                out.push_str(" default:");
            } else {
                out.push_str(" case ");
                if let Some(comm) = case.comm {
                    write_simple_stmt(ast, comm, out);
                } else {
                    for (i, &e) in ast.exprs_of(case.exprs).iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        write_expr(ast, e, out);
                    }
                }
                out.push(':');
            }
            for &b in ast.stmts_of(case.body) {
                out.push(' ');
                write_script_stmt(ast, b, out);
                out.push(';');
            }
        }
    }

    pub fn write_type(ast: &Ast, t: TypeExprId, out: &mut String) {
        match ast.types[t] {
            TypeExpr::Name(s) => out.push_str(ast.name(s)),
            TypeExpr::Qualified { pkg, name } => {
                out.push_str(ast.name(pkg));
                out.push('.');
                out.push_str(ast.name(name));
            }
            TypeExpr::Ptr(e) => {
                out.push('*');
                write_type(ast, e, out);
            }
            TypeExpr::Slice(e) => {
                out.push_str("[]");
                write_type(ast, e, out);
            }
            TypeExpr::Array { len, elem } => {
                out.push('[');
                match len {
                    Some(l) => write_expr(ast, l, out),
                    None => out.push_str("..."),
                }
                out.push(']');
                write_type(ast, elem, out);
            }
            TypeExpr::Map { key, value } => {
                out.push_str("map[");
                write_type(ast, key, out);
                out.push(']');
                write_type(ast, value, out);
            }
            TypeExpr::Chan { dir, elem } => {
                match dir {
                    ChanDir::Both => out.push_str("chan "),
                    ChanDir::Send => out.push_str("chan<- "),
                    ChanDir::Recv => out.push_str("<-chan "),
                }
                write_type(ast, elem, out);
            }
            TypeExpr::Func { params, results, variadic } => {
                out.push_str("func(");
                write_params(ast, params, variadic, out);
                out.push(')');
                write_results(ast, results, out);
            }
            TypeExpr::Struct { fields } => {
                out.push_str("struct { ");
                for (i, f) in ast.fields_of(fields).iter().enumerate() {
                    if i > 0 {
                        out.push_str("; ");
                    }
                    if let Some(n) = f.name {
                        out.push_str(ast.name(n));
                        out.push(' ');
                    }
                    write_type(ast, f.ty, out);
                }
                out.push_str(" }");
            }
            TypeExpr::Interface { methods } => {
                if methods.is_empty() {
                    out.push_str("interface{}");
                } else {
                    out.push_str("interface { ");
                    for (i, m) in ast.methods_of(methods).iter().enumerate() {
                        if i > 0 {
                            out.push_str("; ");
                        }
                        out.push_str(ast.name(m.name));
                        out.push('(');
                        write_params(ast, m.params, m.variadic, out);
                        out.push(')');
                    }
                    out.push_str(" }");
                }
            }
        }
    }
}

// =============================================================================
// Structural equality
// =============================================================================

/// Compares two trees, possibly from different arenas, for structural
/// equality; positions are ignored. Used by the parse/print round-trip
/// tests.
pub fn tree_eq(a: &Ast, ta: TreeRef, b: &Ast, tb: TreeRef) -> bool {
    let cmp = Eq2 { a, b };
    cmp.stmt_lists(a.tree(ta).nodes, b.tree(tb).nodes)
}

struct Eq2<'a> {
    a: &'a Ast,
    b: &'a Ast,
}

impl Eq2<'_> {
    fn sym(&self, x: Symbol, y: Symbol) -> bool {
        self.a.name(x) == self.b.name(y)
    }

    fn osym(&self, x: Option<Symbol>, y: Option<Symbol>) -> bool {
        match (x, y) {
            (None, None) => true,
            (Some(x), Some(y)) => self.sym(x, y),
            _ => false,
        }
    }

    fn stmt_lists(&self, x: ListRef, y: ListRef) -> bool {
        let xs = self.a.stmts_of(x);
        let ys = self.b.stmts_of(y);
        xs.len() == ys.len() && xs.iter().zip(ys).all(|(&x, &y)| self.stmt(x, y))
    }

    fn expr_lists(&self, x: ListRef, y: ListRef) -> bool {
        let xs = self.a.exprs_of(x);
        let ys = self.b.exprs_of(y);
        xs.len() == ys.len() && xs.iter().zip(ys).all(|(&x, &y)| self.expr(x, y))
    }

    fn oexpr(&self, x: Option<ExprId>, y: Option<ExprId>) -> bool {
        match (x, y) {
            (None, None) => true,
            (Some(x), Some(y)) => self.expr(x, y),
            _ => false,
        }
    }

    fn ostmt(&self, x: Option<StmtId>, y: Option<StmtId>) -> bool {
        match (x, y) {
            (None, None) => true,
            (Some(x), Some(y)) => self.stmt(x, y),
            _ => false,
        }
    }

    fn otype(&self, x: Option<TypeExprId>, y: Option<TypeExprId>) -> bool {
        match (x, y) {
            (None, None) => true,
            (Some(x), Some(y)) => self.type_expr(x, y),
            _ => false,
        }
    }

    fn params(&self, x: ListRef, y: ListRef) -> bool {
        let xs = self.a.params_of(x);
        let ys = self.b.params_of(y);
        xs.len() == ys.len()
            && xs
                .iter()
                .zip(ys)
                .all(|(p, q)| self.osym(p.name, q.name) && self.type_expr(p.ty, q.ty))
    }

    fn stmt(&self, x: StmtId, y: StmtId) -> bool {
        use Stmt::*;
        match (self.a.stmts[x], self.b.stmts[y]) {
            (Expr(a), Expr(b)) => self.expr(a, b),
            (Send { chan: c1, value: v1 }, Send { chan: c2, value: v2 }) => {
                self.expr(c1, c2) && self.expr(v1, v2)
            }
            (IncDec { expr: e1, inc: i1 }, IncDec { expr: e2, inc: i2 }) => {
                i1 == i2 && self.expr(e1, e2)
            }
            (Assign { lhs: l1, rhs: r1, op: o1 }, Assign { lhs: l2, rhs: r2, op: o2 }) => {
                o1 == o2 && self.expr_lists(l1, l2) && self.expr_lists(r1, r2)
            }
            (Var { names: n1, ty: t1, values: v1 }, Var { names: n2, ty: t2, values: v2 }) => {
                self.expr_lists(n1, n2) && self.otype(t1, t2) && self.expr_lists(v1, v2)
            }
            (
                Const { names: n1, ty: t1, values: v1, .. },
                Const { names: n2, ty: t2, values: v2, .. },
            ) => self.expr_lists(n1, n2) && self.otype(t1, t2) && self.expr_lists(v1, v2),
            (
                TypeDecl { name: n1, alias: a1, ty: t1 },
                TypeDecl { name: n2, alias: a2, ty: t2 },
            ) => a1 == a2 && self.sym(n1, n2) && self.type_expr(t1, t2),
            (
                If { init: i1, cond: c1, then: th1, els: e1 },
                If { init: i2, cond: c2, then: th2, els: e2 },
            ) => self.ostmt(i1, i2) && self.expr(c1, c2) && self.stmt(th1, th2) && self.ostmt(e1, e2),
            (
                For { init: i1, cond: c1, post: p1, body: b1 },
                For { init: i2, cond: c2, post: p2, body: b2 },
            ) => {
                self.ostmt(i1, i2) && self.oexpr(c1, c2) && self.ostmt(p1, p2) && self.stmt(b1, b2)
            }
            (
                ForRange { key: k1, value: v1, define: d1, expr: e1, body: b1 },
                ForRange { key: k2, value: v2, define: d2, expr: e2, body: b2 },
            ) => {
                d1 == d2
                    && self.oexpr(k1, k2)
                    && self.oexpr(v1, v2)
                    && self.expr(e1, e2)
                    && self.stmt(b1, b2)
            }
            (
                Switch { init: i1, expr: e1, cases: c1 },
                Switch { init: i2, expr: e2, cases: c2 },
            ) => self.ostmt(i1, i2) && self.oexpr(e1, e2) && self.cases(c1, c2),
            (
                TypeSwitch { init: i1, binding: bn1, subject: s1, cases: c1 },
                TypeSwitch { init: i2, binding: bn2, subject: s2, cases: c2 },
            ) => {
                self.ostmt(i1, i2)
                    && self.osym(bn1, bn2)
                    && self.expr(s1, s2)
                    && self.cases(c1, c2)
            }
            (Select { cases: c1 }, Select { cases: c2 }) => self.cases(c1, c2),
            (Return { values: v1 }, Return { values: v2 }) => self.expr_lists(v1, v2),
            (Break { label: l1 }, Break { label: l2 }) => self.osym(l1, l2),
            (Continue { label: l1 }, Continue { label: l2 }) => self.osym(l1, l2),
            (Goto { label: l1 }, Goto { label: l2 }) => self.sym(l1, l2),
            (Labeled { label: l1, stmt: s1 }, Labeled { label: l2, stmt: s2 }) => {
                self.sym(l1, l2) && self.stmt(s1, s2)
            }
            (Fallthrough, Fallthrough) => true,
            (Defer(a), Defer(b)) | (Go(a), Go(b)) => self.expr(a, b),
            (Block { stmts: s1 }, Block { stmts: s2 }) => self.stmt_lists(s1, s2),
            (Text(a), Text(b)) => self.sym(a, b),
            (Comment(a), Comment(b)) => self.sym(a, b),
            (Show { exprs: e1, ctx: c1 }, Show { exprs: e2, ctx: c2 }) => {
                c1 == c2 && self.expr_lists(e1, e2)
            }
            (ShowMacro { call: a, .. }, ShowMacro { call: b, .. }) => self.expr(a, b),
            (
                MacroDecl { name: n1, params: p1, variadic: v1, format: f1, body: b1 },
                MacroDecl { name: n2, params: p2, variadic: v2, format: f2, body: b2 },
            ) => {
                v1 == v2
                    && f1 == f2
                    && self.sym(n1, n2)
                    && self.params(p1, p2)
                    && self.stmt_lists(b1, b2)
            }
            (Include { path: p1, .. }, Include { path: p2, .. }) => self.sym(p1, p2),
            (Extends { path: p1, .. }, Extends { path: p2, .. }) => self.sym(p1, p2),
            (
                Import { alias: a1, dot: d1, path: p1, .. },
                Import { alias: a2, dot: d2, path: p2, .. },
            ) => d1 == d2 && self.osym(a1, a2) && self.sym(p1, p2),
            (Url { is_set: s1, stmts: st1 }, Url { is_set: s2, stmts: st2 }) => {
                s1 == s2 && self.stmt_lists(st1, st2)
            }
            (
                FuncDecl { name: n1, params: p1, results: r1, variadic: v1, body: b1 },
                FuncDecl { name: n2, params: p2, results: r2, variadic: v2, body: b2 },
            ) => {
                v1 == v2
                    && self.sym(n1, n2)
                    && self.params(p1, p2)
                    && self.params(r1, r2)
                    && self.stmt(b1, b2)
            }
            _ => false,
        }
    }

    fn cases(&self, x: ListRef, y: ListRef) -> bool {
        let xs = self.a.cases_of(x);
        let ys = self.b.cases_of(y);
        xs.len() == ys.len()
            && xs.iter().zip(ys).all(|(&x, &y)| {
                let cx = self.a.cases[x];
                let cy = self.b.cases[y];
                self.expr_lists(cx.exprs, cy.exprs)
                    && self.ostmt(cx.comm, cy.comm)
                    && self.stmt_lists(cx.body, cy.body)
            })
    }

    fn expr(&self, x: ExprId, y: ExprId) -> bool {
        use Expr::*;
        match (self.a.exprs[x], self.b.exprs[y]) {
            (IntLit(a), IntLit(b))
            | (FloatLit(a), FloatLit(b))
            | (ImagLit(a), ImagLit(b))
            | (StringLit(a), StringLit(b))
            | (Ident(a), Ident(b)) => self.sym(a, b),
            (RuneLit(a), RuneLit(b)) => a == b,
            (Unary { op: o1, expr: e1 }, Unary { op: o2, expr: e2 }) => {
                o1 == o2 && self.expr(e1, e2)
            }
            (Binary { op: o1, lhs: l1, rhs: r1 }, Binary { op: o2, lhs: l2, rhs: r2 }) => {
                o1 == o2 && self.expr(l1, l2) && self.expr(r1, r2)
            }
            (Index { expr: e1, index: i1 }, Index { expr: e2, index: i2 }) => {
                self.expr(e1, e2) && self.expr(i1, i2)
            }
            (
                Slice { expr: e1, low: l1, high: h1, max: m1 },
                Slice { expr: e2, low: l2, high: h2, max: m2 },
            ) => {
                self.expr(e1, e2)
                    && self.oexpr(l1, l2)
                    && self.oexpr(h1, h2)
                    && self.oexpr(m1, m2)
            }
            (Selector { expr: e1, sel: s1 }, Selector { expr: e2, sel: s2 }) => {
                self.sym(s1, s2) && self.expr(e1, e2)
            }
            (TypeAssert { expr: e1, ty: t1 }, TypeAssert { expr: e2, ty: t2 }) => {
                self.expr(e1, e2) && self.otype(t1, t2)
            }
            (
                Call { func: f1, args: a1, ellipsis: el1 },
                Call { func: f2, args: a2, ellipsis: el2 },
            ) => el1 == el2 && self.expr(f1, f2) && self.expr_lists(a1, a2),
            (Composite { ty: t1, elems: e1 }, Composite { ty: t2, elems: e2 }) => {
                self.otype(t1, t2) && {
                    let xs = self.a.elements_of(e1);
                    let ys = self.b.elements_of(e2);
                    xs.len() == ys.len()
                        && xs
                            .iter()
                            .zip(ys)
                            .all(|(p, q)| self.oexpr(p.key, q.key) && self.expr(p.value, q.value))
                }
            }
            (
                FuncLit { params: p1, results: r1, variadic: v1, body: b1 },
                FuncLit { params: p2, results: r2, variadic: v2, body: b2 },
            ) => v1 == v2 && self.params(p1, p2) && self.params(r1, r2) && self.stmt(b1, b2),
            (TypeE(t1), TypeE(t2)) => self.type_expr(t1, t2),
            // An identifier and a named type expression are the same
            // syntax; the distinction is made by the checker.
            (Ident(a), TypeE(t)) => matches!(self.b.types[t], TypeExpr::Name(n) if self.sym(a, n)),
            (TypeE(t), Ident(b)) => matches!(self.a.types[t], TypeExpr::Name(n) if self.sym(n, b)),
            _ => false,
        }
    }

    fn type_expr(&self, x: TypeExprId, y: TypeExprId) -> bool {
        use TypeExpr::*;
        match (self.a.types[x], self.b.types[y]) {
            (Name(a), Name(b)) => self.sym(a, b),
            (Qualified { pkg: p1, name: n1 }, Qualified { pkg: p2, name: n2 }) => {
                self.sym(p1, p2) && self.sym(n1, n2)
            }
            (Ptr(a), Ptr(b)) | (Slice(a), Slice(b)) => self.type_expr(a, b),
            (Array { len: l1, elem: e1 }, Array { len: l2, elem: e2 }) => {
                self.oexpr(l1, l2) && self.type_expr(e1, e2)
            }
            (Map { key: k1, value: v1 }, Map { key: k2, value: v2 }) => {
                self.type_expr(k1, k2) && self.type_expr(v1, v2)
            }
            (Chan { dir: d1, elem: e1 }, Chan { dir: d2, elem: e2 }) => {
                d1 == d2 && self.type_expr(e1, e2)
            }
            (
                Func { params: p1, results: r1, variadic: v1 },
                Func { params: p2, results: r2, variadic: v2 },
            ) => v1 == v2 && self.params(p1, p2) && self.params(r1, r2),
            (Struct { fields: f1 }, Struct { fields: f2 }) => {
                let xs = self.a.fields_of(f1);
                let ys = self.b.fields_of(f2);
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys)
                        .all(|(p, q)| self.osym(p.name, q.name) && self.type_expr(p.ty, q.ty))
            }
            (Interface { methods: m1 }, Interface { methods: m2 }) => {
                let xs = self.a.methods_of(m1);
                let ys = self.b.methods_of(m2);
                xs.len() == ys.len()
                    && xs.iter().zip(ys).all(|(p, q)| {
                        p.variadic == q.variadic
                            && self.sym(p.name, q.name)
                            && self.params(p.params, q.params)
                            && self.params(p.results, q.results)
                    })
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interner_dedup() {
        let mut i = Interner::new();
        let a = i.intern("name");
        let b = i.intern("name");
        let c = i.intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(i.resolve(a), "name");
        assert_eq!(i.resolve(c), "other");
    }

    #[test]
    fn arena_ids_are_stable() {
        let mut arena: PosArena<Expr> = PosArena::default();
        let sym = Symbol::from_u32(0);
        let a = arena.alloc(Expr::Ident(sym), Position::new(1, 1, 0, 0));
        let b = arena.alloc(Expr::RuneLit('x'), Position::new(1, 2, 1, 1));
        assert_eq!(arena[a], Expr::Ident(sym));
        assert_eq!(arena[b], Expr::RuneLit('x'));
        assert_eq!(arena.pos(b).column, 2);
    }

    #[test]
    fn list_refs_slice_extras() {
        let mut ast = Ast::new();
        let s = ast.intern("x");
        let e1 = ast.exprs.alloc(Expr::Ident(s), Position::default());
        let e2 = ast.exprs.alloc(Expr::RuneLit('c'), Position::default());
        let list = ast.expr_list([e1, e2]);
        assert_eq!(ast.exprs_of(list), &[e1, e2]);
        assert!(ListRef::EMPTY.is_empty());
    }

    #[test]
    fn context_formats() {
        assert_eq!(Context::Attribute.format(), Format::Html);
        assert_eq!(Context::CssString.format(), Format::Css);
        assert_eq!(Context::from_format(Format::Json), Context::Json);
    }
}
