//! Recursive descent parser.
//!
//! Turns the token stream into the shared AST. Template files are parsed
//! statement-region by statement-region; block statements (`if`, `for`,
//! `switch`, `select`, `macro`) span regions and must be closed by a
//! matching `{% end %}`. Scripts parse the classic brace-delimited Go
//! statement grammar over the same expression machinery.
//!
//! `include`, `import` and `extends` recurse through the file loader; an
//! in-flight path set rejects reference cycles.

use std::collections::HashMap;

use crate::ast::*;
use crate::error::{BuildError, Position};
use crate::fs::{is_valid_path, resolve_path, Files, Format};
use crate::lexer::{lex, strip_bom, Mode, Tok, Token};

/// The result of parsing: the shared arena plus the root tree.
#[derive(Debug)]
pub struct ParseOutput {
    pub ast: Ast,
    pub main: TreeRef,
}

/// Parses the named template file and, recursively, every file it
/// references.
pub fn parse_template(files: &dyn Files, name: &str) -> Result<ParseOutput, BuildError> {
    if !is_valid_path(name) {
        return Err(BuildError::new(name, Position::default(), format!("invalid path {name:?}")));
    }
    let mut loader = Loader { files, ast: Ast::new(), cache: HashMap::new(), loading: Vec::new() };
    let main = loader.load(name, LoadKind::Root, name, Position::default())?;
    Ok(ParseOutput { ast: loader.ast, main })
}

/// Parses a script source: a single code region with no literal text.
pub fn parse_script(src: &str, path: &str) -> Result<ParseOutput, BuildError> {
    let src = strip_bom(src);
    let toks = lex(src, Mode::Script)
        .map_err(|e| BuildError::new(path, e.pos, format!("syntax error: {e}")))?;
    let mut ast = Ast::new();
    let mut pending = Vec::new();
    let mut p = FileParser {
        ast: &mut ast,
        toks: &toks,
        src,
        path,
        i: 0,
        pending: &mut pending,
        template: false,
        composite_ok: true,
    };
    let nodes = p.parse_script_stmts(Tok::Eof)?;
    for pend in &pending {
        if matches!(pend.kind, LoadKind::Import) {
            // Scripts may only import precompiled packages.
            return Err(BuildError::new(
                path,
                pend.pos,
                format!("cannot import template file {:?} in a script", pend.path),
            ));
        }
    }
    let nodes = ast.stmt_list(nodes);
    let main = ast.add_tree(Tree { path: path.to_string(), format: Format::Text, nodes });
    Ok(ParseOutput { ast, main })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadKind {
    Root,
    Include,
    Import,
    Extends,
}

struct Pending {
    stmt: StmtId,
    path: String,
    pos: Position,
    kind: LoadKind,
}

struct Loader<'f> {
    files: &'f dyn Files,
    ast: Ast,
    cache: HashMap<String, TreeRef>,
    loading: Vec<String>,
}

impl Loader<'_> {
    fn load(
        &mut self,
        path: &str,
        kind: LoadKind,
        from: &str,
        at: Position,
    ) -> Result<TreeRef, BuildError> {
        if let Some(&r) = self.cache.get(path) {
            return Ok(r);
        }
        if self.loading.iter().any(|p| p == path) {
            return Err(BuildError::new(from, at, format!("cyclic reference to file {path:?}")));
        }
        let bytes = self
            .files
            .open(path)
            .map_err(|e| BuildError::new(from, at, e.to_string()))?;
        let src = String::from_utf8(bytes)
            .map_err(|_| BuildError::new(path, Position::default(), "invalid UTF-8 source"))?;
        let src = strip_bom(&src).to_string();
        let format = self.files.format(path);
        let toks = lex(&src, Mode::Template(format))
            .map_err(|e| BuildError::new(path, e.pos, format!("syntax error: {e}")))?;

        self.loading.push(path.to_string());
        let mut pending = Vec::new();
        let mut p = FileParser {
            ast: &mut self.ast,
            toks: &toks,
            src: &src,
            path,
            i: 0,
            pending: &mut pending,
            template: true,
            composite_ok: true,
        };
        let nodes = p.parse_template_body()?;
        let nodes = self.ast.stmt_list(nodes);
        let tree = Tree { path: path.to_string(), format, nodes };

        self.validate_tree(&tree, kind, path)?;

        let tref = self.ast.add_tree(tree);
        for pend in pending {
            let resolved = resolve_path(path, &pend.path).ok_or_else(|| {
                BuildError::new(path, pend.pos, format!("invalid path {:?}", pend.path))
            })?;
            let sub = self.load(&resolved, pend.kind, path, pend.pos)?;
            match &mut self.ast.stmts[pend.stmt] {
                Stmt::Include { tree, .. } => *tree = sub,
                Stmt::Extends { tree, .. } => *tree = sub,
                Stmt::Import { tree, .. } => *tree = Some(sub),
                _ => {}
            }
        }
        self.loading.pop();
        self.cache.insert(path.to_string(), tref);
        Ok(tref)
    }

    /// Enforces the structural rules of extending and imported files.
    fn validate_tree(&self, tree: &Tree, kind: LoadKind, path: &str) -> Result<(), BuildError> {
        let nodes = self.ast.stmts_of(tree.nodes);
        let extends_at = nodes
            .iter()
            .position(|&s| matches!(self.ast.stmts[s], Stmt::Extends { .. }));
        if let Some(i) = extends_at {
            for &s in &nodes[..i] {
                match self.ast.stmts[s] {
                    Stmt::Comment(_) => {}
                    Stmt::Text(sym) if self.ast.name(sym).trim().is_empty() => {}
                    _ => {
                        return Err(BuildError::new(
                            path,
                            self.ast.stmts.pos(nodes[i]),
                            "extends is not at the beginning of the file",
                        ))
                    }
                }
            }
        }
        let declarations_only = extends_at.is_some() || kind == LoadKind::Import;
        if declarations_only {
            let what = if extends_at.is_some() { "extending" } else { "imported" };
            for &s in nodes {
                match self.ast.stmts[s] {
                    Stmt::MacroDecl { .. }
                    | Stmt::Var { .. }
                    | Stmt::Const { .. }
                    | Stmt::TypeDecl { .. }
                    | Stmt::Import { .. }
                    | Stmt::Extends { .. }
                    | Stmt::Comment(_) => {}
                    Stmt::Text(sym) if self.ast.name(sym).trim().is_empty() => {}
                    Stmt::Text(_) => {
                        return Err(BuildError::new(
                            path,
                            self.ast.stmts.pos(s),
                            format!("unexpected text in {what} file"),
                        ))
                    }
                    _ => {
                        return Err(BuildError::new(
                            path,
                            self.ast.stmts.pos(s),
                            format!("unexpected statement in {what} file"),
                        ))
                    }
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// File parser
// =============================================================================

struct FileParser<'a> {
    ast: &'a mut Ast,
    toks: &'a [Token],
    src: &'a str,
    path: &'a str,
    i: usize,
    pending: &'a mut Vec<Pending>,
    template: bool,
    /// Cleared while parsing a script control-flow header, where a
    /// composite literal needs parentheses (classic Go rule).
    composite_ok: bool,
}

/// How a template block was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockEnd {
    Eof,
    /// `{% end %}` or `{% end <kw> %}`.
    End(Option<Tok>),
    Else,
    /// `{% else if ... %}`: the parser is positioned after `if`.
    ElseIf,
    /// `{% case ... %}` / `{% default %}`: positioned after the keyword.
    Case,
    Default,
}

type PResult<T> = Result<T, BuildError>;

impl<'a> FileParser<'a> {
    // ---------------------------------------------------------------------
    // Token plumbing
    // ---------------------------------------------------------------------

    fn cur(&self) -> Token {
        self.toks[self.i.min(self.toks.len() - 1)]
    }

    fn peek(&self, n: usize) -> Token {
        self.toks[(self.i + n).min(self.toks.len() - 1)]
    }

    fn at(&self, t: Tok) -> bool {
        self.cur().tok == t
    }

    fn bump(&mut self) -> Token {
        let t = self.cur();
        if self.i < self.toks.len() - 1 {
            self.i += 1;
        }
        t
    }

    fn eat(&mut self, t: Tok) -> bool {
        if self.at(t) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn text(&self, t: Token) -> &'a str {
        &self.src[t.pos.start as usize..=t.pos.end as usize]
    }

    fn err(&self, pos: Position, msg: impl Into<String>) -> BuildError {
        BuildError::new(self.path, pos, msg)
    }

    fn unexpected(&self, expecting: &str) -> BuildError {
        let t = self.cur();
        self.err(
            t.pos,
            format!("syntax error: unexpected {}, expecting {}", t.tok.describe(), expecting),
        )
    }

    fn expect(&mut self, t: Tok) -> PResult<Token> {
        if self.at(t) {
            Ok(self.bump())
        } else {
            Err(self.unexpected(t.describe()))
        }
    }

    /// Consumes an optional semicolon, then the region terminator.
    fn end_statement(&mut self) -> PResult<()> {
        self.eat(Tok::Semicolon);
        self.expect(Tok::EndStatement)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Template structure
    // ---------------------------------------------------------------------

    fn parse_template_body(&mut self) -> PResult<Vec<StmtId>> {
        let (nodes, end, end_pos) = self.parse_block(None)?;
        match end {
            BlockEnd::Eof => Ok(nodes),
            _ => Err(self.err(end_pos, "syntax error: unexpected end, no block is open")),
        }
    }

    /// Parses template nodes until EOF or a block terminator. `open`
    /// carries the keyword and position of the enclosing block for
    /// diagnostics.
    fn parse_block(
        &mut self,
        open: Option<(&'static str, Position)>,
    ) -> PResult<(Vec<StmtId>, BlockEnd, Position)> {
        let mut nodes = Vec::new();
        loop {
            let t = self.cur();
            match t.tok {
                Tok::Eof => {
                    if let Some((kw, pos)) = open {
                        return Err(self.err(
                            t.pos,
                            format!("syntax error: unexpected EOF, expecting {{% end %}} ({kw} opened at {pos})"),
                        ));
                    }
                    return Ok((nodes, BlockEnd::Eof, t.pos));
                }
                Tok::Text => {
                    self.bump();
                    let sym = self.ast.intern(self.text(t));
                    nodes.push(self.ast.stmts.alloc(Stmt::Text(sym), t.pos));
                }
                Tok::Comment => {
                    self.bump();
                    let raw = self.text(t);
                    let inner = raw[2..raw.len() - 2].trim();
                    let sym = self.ast.intern(inner);
                    nodes.push(self.ast.stmts.alloc(Stmt::Comment(sym), t.pos));
                }
                Tok::StartUrl { is_set } => {
                    self.bump();
                    let (inner, end, end_pos) = self.parse_block(open)?;
                    if end != BlockEnd::Eof || !self.eat(Tok::EndUrl) {
                        // The URL attribute ends inside this block level;
                        // an unterminated one is a lexer bug surfaced as a
                        // plain syntax error.
                        if !matches!(end, BlockEnd::Eof) {
                            return Err(self.err(end_pos, "syntax error: unterminated URL attribute"));
                        }
                    }
                    let stmts = self.ast.stmt_list(inner);
                    nodes.push(self.ast.stmts.alloc(Stmt::Url { is_set, stmts }, t.pos));
                }
                Tok::EndUrl => {
                    // Handled by the StartUrl arm; reaching it here means
                    // the enclosing block consumed it.
                    return Ok((nodes, BlockEnd::Eof, t.pos));
                }
                Tok::StartValue => {
                    self.bump();
                    let e = self.parse_expr()?;
                    let close = self.expect(Tok::EndValue)?;
                    let list = self.ast.expr_list([e]);
                    let pos = t.pos.to(close.pos);
                    nodes.push(self.ast.stmts.alloc(Stmt::Show { exprs: list, ctx: t.ctx }, pos));
                }
                Tok::StartStatement => {
                    match self.parse_statement_region(t, open)? {
                        RegionOutcome::Stmt(s) => nodes.push(s),
                        RegionOutcome::Terminator(end, pos) => return Ok((nodes, end, pos)),
                    }
                }
                _ => return Err(self.unexpected("text or statement")),
            }
        }
    }

    // ---------------------------------------------------------------------
    // Statement regions
    // ---------------------------------------------------------------------

    fn parse_statement_region(
        &mut self,
        start: Token,
        open: Option<(&'static str, Position)>,
    ) -> PResult<RegionOutcome> {
        self.bump(); // {%
        let t = self.cur();
        let ctx = start.ctx;
        match t.tok {
            Tok::End => {
                self.bump();
                let word = match self.cur().tok {
                    w @ (Tok::If
                    | Tok::For
                    | Tok::Switch
                    | Tok::Select
                    | Tok::Macro
                    | Tok::Show) => {
                        self.bump();
                        Some(w)
                    }
                    _ => None,
                };
                self.end_statement()?;
                if open.is_none() {
                    return Err(self.err(t.pos, "syntax error: unexpected end, no block is open"));
                }
                Ok(RegionOutcome::Terminator(BlockEnd::End(word), t.pos))
            }
            Tok::Else => {
                self.bump();
                if self.eat(Tok::If) {
                    return Ok(RegionOutcome::Terminator(BlockEnd::ElseIf, t.pos));
                }
                self.end_statement()?;
                Ok(RegionOutcome::Terminator(BlockEnd::Else, t.pos))
            }
            Tok::Case => {
                self.bump();
                Ok(RegionOutcome::Terminator(BlockEnd::Case, t.pos))
            }
            Tok::Default => {
                self.bump();
                self.end_statement()?;
                Ok(RegionOutcome::Terminator(BlockEnd::Default, t.pos))
            }
            Tok::If => {
                self.bump();
                let s = self.parse_template_if(t.pos)?;
                Ok(RegionOutcome::Stmt(s))
            }
            Tok::For => {
                self.bump();
                let s = self.parse_template_for(t.pos, None)?;
                Ok(RegionOutcome::Stmt(s))
            }
            Tok::Switch => {
                self.bump();
                let s = self.parse_template_switch(t.pos, None)?;
                Ok(RegionOutcome::Stmt(s))
            }
            Tok::Select => {
                self.bump();
                let s = self.parse_template_select(t.pos)?;
                Ok(RegionOutcome::Stmt(s))
            }
            Tok::Macro => {
                self.bump();
                let s = self.parse_macro_decl(t.pos)?;
                Ok(RegionOutcome::Stmt(s))
            }
            Tok::Show => {
                self.bump();
                let mut exprs = vec![self.parse_expr()?];
                while self.eat(Tok::Comma) {
                    exprs.push(self.parse_expr()?);
                }
                self.end_statement()?;
                let s = if exprs.len() == 1
                    && matches!(self.ast.exprs[exprs[0]], Expr::Call { .. })
                {
                    Stmt::ShowMacro { call: exprs[0], ctx }
                } else {
                    let list = self.ast.expr_list(exprs);
                    Stmt::Show { exprs: list, ctx }
                };
                Ok(RegionOutcome::Stmt(self.ast.stmts.alloc(s, t.pos)))
            }
            Tok::Include => {
                self.bump();
                let (path, ppos) = self.parse_path_literal()?;
                self.end_statement()?;
                let sym = self.ast.intern(&path);
                let s = self
                    .ast
                    .stmts
                    .alloc(Stmt::Include { path: sym, tree: TreeRef::PENDING }, t.pos);
                self.pending.push(Pending { stmt: s, path, pos: ppos, kind: LoadKind::Include });
                Ok(RegionOutcome::Stmt(s))
            }
            Tok::Extends => {
                self.bump();
                let (path, ppos) = self.parse_path_literal()?;
                self.end_statement()?;
                let sym = self.ast.intern(&path);
                let s = self
                    .ast
                    .stmts
                    .alloc(Stmt::Extends { path: sym, tree: TreeRef::PENDING }, t.pos);
                self.pending.push(Pending { stmt: s, path, pos: ppos, kind: LoadKind::Extends });
                Ok(RegionOutcome::Stmt(s))
            }
            Tok::Import => {
                self.bump();
                let (alias, dot) = if self.at(Tok::Dot) {
                    self.bump();
                    (None, true)
                } else if self.at(Tok::Ident) {
                    let a = self.bump();
                    let sym = self.ast.intern(self.text(a));
                    (Some(sym), false)
                } else {
                    (None, false)
                };
                let (path, ppos) = self.parse_path_literal()?;
                self.end_statement()?;
                let sym = self.ast.intern(&path);
                // A path with an extension names a template file compiled
                // as a package; without one, a precompiled package.
                let is_file = path.rsplit('/').next().is_some_and(|n| n.contains('.'));
                let s = self
                    .ast
                    .stmts
                    .alloc(Stmt::Import { alias, dot, path: sym, tree: None }, t.pos);
                if is_file {
                    self.pending.push(Pending { stmt: s, path, pos: ppos, kind: LoadKind::Import });
                }
                Ok(RegionOutcome::Stmt(s))
            }
            Tok::Ident if self.peek(1).tok == Tok::Colon => {
                // A label: `{% L: for ... %}`, `{% L: %}`.
                let name = self.bump();
                self.bump();
                let label = self.ast.intern(self.text(name));
                match self.cur().tok {
                    Tok::For => {
                        self.bump();
                        let s = self.parse_template_for(t.pos, Some(label))?;
                        Ok(RegionOutcome::Stmt(s))
                    }
                    Tok::Switch => {
                        self.bump();
                        let s = self.parse_template_switch(t.pos, Some(label))?;
                        Ok(RegionOutcome::Stmt(s))
                    }
                    Tok::EndStatement => {
                        self.bump();
                        let stmts = self.ast.stmt_list([]);
                        let empty = self.ast.stmts.alloc(Stmt::Block { stmts }, t.pos);
                        let s = self
                            .ast
                            .stmts
                            .alloc(Stmt::Labeled { label, stmt: empty }, t.pos);
                        Ok(RegionOutcome::Stmt(s))
                    }
                    _ => {
                        let inner = self.parse_simple_or_decl_stmt(true)?;
                        self.end_statement()?;
                        let s = self
                            .ast
                            .stmts
                            .alloc(Stmt::Labeled { label, stmt: inner }, t.pos);
                        Ok(RegionOutcome::Stmt(s))
                    }
                }
            }
            _ => {
                let s = self.parse_simple_or_decl_stmt(true)?;
                self.end_statement()?;
                Ok(RegionOutcome::Stmt(s))
            }
        }
    }

    fn parse_path_literal(&mut self) -> PResult<(String, Position)> {
        let t = self.cur();
        match t.tok {
            Tok::InterpretedString | Tok::RawString => {
                self.bump();
                let path = self.decode_string(t)?;
                if !is_valid_path(&path) {
                    return Err(self.err(t.pos, format!("invalid path {path:?}")));
                }
                Ok((path, t.pos))
            }
            _ => Err(self.unexpected("string literal")),
        }
    }

    fn block_stmt(&mut self, nodes: Vec<StmtId>, pos: Position) -> StmtId {
        let stmts = self.ast.stmt_list(nodes);
        self.ast.stmts.alloc(Stmt::Block { stmts }, pos)
    }

    fn parse_template_if(&mut self, pos: Position) -> PResult<StmtId> {
        let (init, cond) = self.parse_if_header()?;
        self.end_statement()?;
        let (then_nodes, end, end_pos) = self.parse_block(Some(("if", pos)))?;
        let then = self.block_stmt(then_nodes, pos);
        let els = match end {
            BlockEnd::End(word) => {
                self.check_end_word(word, Tok::If, end_pos)?;
                None
            }
            BlockEnd::Else => {
                let (else_nodes, end2, end2_pos) = self.parse_block(Some(("if", pos)))?;
                match end2 {
                    BlockEnd::End(word) => self.check_end_word(word, Tok::If, end2_pos)?,
                    _ => return Err(self.err(end2_pos, "syntax error: unexpected statement, expecting end if")),
                }
                Some(self.block_stmt(else_nodes, end_pos))
            }
            BlockEnd::ElseIf => {
                // Positioned after `else if`; the nested if consumes the
                // shared `{% end %}`.
                Some(self.parse_template_if(end_pos)?)
            }
            _ => return Err(self.err(end_pos, "syntax error: unexpected statement, expecting end if")),
        };
        Ok(self.ast.stmts.alloc(Stmt::If { init, cond, then, els }, pos))
    }

    fn check_end_word(&self, word: Option<Tok>, want: Tok, at: Position) -> PResult<()> {
        match word {
            None => Ok(()),
            Some(w) if w == want => Ok(()),
            Some(w) => Err(self.err(
                at,
                format!(
                    "syntax error: unexpected end {}, expecting end {}",
                    w.describe(),
                    want.describe()
                ),
            )),
        }
    }

    fn parse_template_for(&mut self, pos: Position, label: Option<Symbol>) -> PResult<StmtId> {
        let header = self.parse_for_header()?;
        self.end_statement()?;
        let (body_nodes, end, end_pos) = self.parse_block(Some(("for", pos)))?;
        match end {
            BlockEnd::End(word) => self.check_end_word(word, Tok::For, end_pos)?,
            _ => return Err(self.err(end_pos, "syntax error: unexpected statement, expecting end for")),
        }
        let body = self.block_stmt(body_nodes, pos);
        let stmt = self.finish_for(header, body);
        let s = self.ast.stmts.alloc(stmt, pos);
        Ok(self.wrap_label(label, s, pos))
    }

    fn wrap_label(&mut self, label: Option<Symbol>, s: StmtId, pos: Position) -> StmtId {
        match label {
            Some(l) => self.ast.stmts.alloc(Stmt::Labeled { label: l, stmt: s }, pos),
            None => s,
        }
    }

    fn parse_template_switch(&mut self, pos: Position, label: Option<Symbol>) -> PResult<StmtId> {
        let header = self.parse_switch_header()?;
        self.end_statement()?;
        // Only blank text may sit between the switch and its first case.
        let mut cases = Vec::new();
        let mut end_info;
        {
            let (nodes, end, end_pos) = self.parse_block(Some(("switch", pos)))?;
            for &s in &nodes {
                match self.ast.stmts[s] {
                    Stmt::Comment(_) => {}
                    Stmt::Text(sym) if self.ast.name(sym).trim().is_empty() => {}
                    _ => {
                        return Err(self.err(
                            self.ast.stmts.pos(s),
                            "syntax error: unexpected statement between switch and case",
                        ))
                    }
                }
            }
            end_info = (end, end_pos);
        }
        loop {
            match end_info.0 {
                BlockEnd::End(word) => {
                    self.check_end_word(word, Tok::Switch, end_info.1)?;
                    break;
                }
                BlockEnd::Case => {
                    let mut exprs = vec![self.parse_expr()?];
                    while self.eat(Tok::Comma) {
                        exprs.push(self.parse_expr()?);
                    }
                    self.end_statement()?;
                    let (body, end, end_pos) = self.parse_block(Some(("switch", pos)))?;
                    let exprs = self.ast.expr_list(exprs);
                    let body = self.ast.stmt_list(body);
                    let c = self.ast.cases.alloc(Case { exprs, comm: None, body }, end_info.1);
                    cases.push(c);
                    end_info = (end, end_pos);
                }
                BlockEnd::Default => {
                    let (body, end, end_pos) = self.parse_block(Some(("switch", pos)))?;
                    let body = self.ast.stmt_list(body);
                    let c = self
                        .ast
                        .cases
                        .alloc(Case { exprs: ListRef::EMPTY, comm: None, body }, end_info.1);
                    cases.push(c);
                    end_info = (end, end_pos);
                }
                _ => {
                    return Err(self.err(end_info.1, "syntax error: unexpected statement, expecting case or end switch"))
                }
            }
        }
        let cases = self.ast.case_list(cases);
        let stmt = match header {
            SwitchHeader::Value { init, expr } => Stmt::Switch { init, expr, cases },
            SwitchHeader::Type { init, binding, subject } => {
                Stmt::TypeSwitch { init, binding, subject, cases }
            }
        };
        let s = self.ast.stmts.alloc(stmt, pos);
        Ok(self.wrap_label(label, s, pos))
    }

    fn parse_template_select(&mut self, pos: Position) -> PResult<StmtId> {
        self.end_statement()?;
        let mut cases = Vec::new();
        let (nodes, mut end_info) = {
            let (nodes, end, end_pos) = self.parse_block(Some(("select", pos)))?;
            (nodes, (end, end_pos))
        };
        for &s in &nodes {
            match self.ast.stmts[s] {
                Stmt::Comment(_) => {}
                Stmt::Text(sym) if self.ast.name(sym).trim().is_empty() => {}
                _ => {
                    return Err(self.err(
                        self.ast.stmts.pos(s),
                        "syntax error: unexpected statement between select and case",
                    ))
                }
            }
        }
        loop {
            match end_info.0 {
                BlockEnd::End(word) => {
                    self.check_end_word(word, Tok::Select, end_info.1)?;
                    break;
                }
                BlockEnd::Case => {
                    let comm = self.parse_simple_or_decl_stmt(false)?;
                    self.end_statement()?;
                    let (body, end, end_pos) = self.parse_block(Some(("select", pos)))?;
                    let body = self.ast.stmt_list(body);
                    let c = self
                        .ast
                        .cases
                        .alloc(Case { exprs: ListRef::EMPTY, comm: Some(comm), body }, end_info.1);
                    cases.push(c);
                    end_info = (end, end_pos);
                }
                BlockEnd::Default => {
                    let (body, end, end_pos) = self.parse_block(Some(("select", pos)))?;
                    let body = self.ast.stmt_list(body);
                    let c = self
                        .ast
                        .cases
                        .alloc(Case { exprs: ListRef::EMPTY, comm: None, body }, end_info.1);
                    cases.push(c);
                    end_info = (end, end_pos);
                }
                _ => {
                    return Err(self
                        .err(end_info.1, "syntax error: unexpected statement, expecting case or end select"))
                }
            }
        }
        let cases = self.ast.case_list(cases);
        let s = self.ast.stmts.alloc(Stmt::Select { cases }, pos);
        Ok(s)
    }

    fn parse_macro_decl(&mut self, pos: Position) -> PResult<StmtId> {
        let name_tok = self.expect(Tok::Ident)?;
        let name = self.ast.intern(self.text(name_tok));
        let (params, variadic) = if self.eat(Tok::LParen) {
            let (params, variadic) = self.parse_params(Tok::RParen)?;
            self.expect(Tok::RParen)?;
            (params, variadic)
        } else {
            (ListRef::EMPTY, false)
        };
        // Optional result format suffix.
        let format = if self.at(Tok::Ident) {
            let t = self.cur();
            let f = match self.text(t) {
                "text" => Some(Format::Text),
                "html" => Some(Format::Html),
                "css" => Some(Format::Css),
                "js" => Some(Format::JavaScript),
                "json" => Some(Format::Json),
                "markdown" => Some(Format::Markdown),
                _ => None,
            };
            match f {
                Some(f) => {
                    self.bump();
                    f
                }
                None => return Err(self.unexpected("format type")),
            }
        } else {
            // The default macro format is the format of the file.
            Format::Text
        };
        self.end_statement()?;
        let (body_nodes, end, end_pos) = self.parse_block(Some(("macro", pos)))?;
        match end {
            BlockEnd::End(word) => self.check_end_word(word, Tok::Macro, end_pos)?,
            _ => {
                return Err(self.err(end_pos, "syntax error: unexpected statement, expecting end macro"))
            }
        }
        let body = self.ast.stmt_list(body_nodes);
        Ok(self
            .ast
            .stmts
            .alloc(Stmt::MacroDecl { name, params, variadic, format, body }, pos))
    }

    // ---------------------------------------------------------------------
    // Script statements
    // ---------------------------------------------------------------------

    fn parse_script_stmts(&mut self, until: Tok) -> PResult<Vec<StmtId>> {
        let mut out = Vec::new();
        loop {
            while self.eat(Tok::Semicolon) {}
            if self.at(until) || self.at(Tok::Eof) {
                break;
            }
            out.push(self.parse_script_stmt()?);
        }
        Ok(out)
    }

    fn parse_script_block(&mut self) -> PResult<StmtId> {
        let open = self.expect(Tok::LBrace)?;
        let nodes = self.parse_script_stmts(Tok::RBrace)?;
        self.expect(Tok::RBrace)?;
        Ok(self.block_stmt(nodes, open.pos))
    }

    fn parse_script_stmt(&mut self) -> PResult<StmtId> {
        let t = self.cur();
        match t.tok {
            Tok::If => {
                self.bump();
                self.parse_script_if(t.pos)
            }
            Tok::For => {
                self.bump();
                self.parse_script_for(t.pos, None)
            }
            Tok::Switch => {
                self.bump();
                self.parse_script_switch(t.pos, None)
            }
            Tok::Select => {
                self.bump();
                self.parse_script_select(t.pos)
            }
            Tok::LBrace => self.parse_script_block(),
            Tok::Func if self.peek(1).tok == Tok::Ident => {
                self.bump();
                let name_tok = self.bump();
                let name = self.ast.intern(self.text(name_tok));
                self.expect(Tok::LParen)?;
                let (params, variadic) = self.parse_params(Tok::RParen)?;
                self.expect(Tok::RParen)?;
                let results = self.parse_results()?;
                let body = self.parse_script_block()?;
                Ok(self.ast.stmts.alloc(
                    Stmt::FuncDecl { name, params, results, variadic, body },
                    t.pos,
                ))
            }
            Tok::Ident if self.peek(1).tok == Tok::Colon => {
                // Label.
                self.bump();
                self.bump();
                let label = self.ast.intern(self.text(t));
                let stmt = match self.cur().tok {
                    Tok::For => {
                        self.bump();
                        self.parse_script_for(t.pos, Some(label))?
                    }
                    Tok::Switch => {
                        self.bump();
                        self.parse_script_switch(t.pos, Some(label))?
                    }
                    _ => self.parse_script_stmt()?,
                };
                Ok(self.ast.stmts.alloc(Stmt::Labeled { label, stmt }, t.pos))
            }
            _ => {
                let s = self.parse_simple_or_decl_stmt(true)?;
                Ok(s)
            }
        }
    }

    fn parse_script_if(&mut self, pos: Position) -> PResult<StmtId> {
        let (init, cond) = self.parse_if_header()?;
        let then = self.parse_script_block()?;
        let els = if self.eat(Tok::Else) {
            if self.at(Tok::If) {
                self.bump();
                Some(self.parse_script_if(pos)?)
            } else {
                Some(self.parse_script_block()?)
            }
        } else {
            None
        };
        Ok(self.ast.stmts.alloc(Stmt::If { init, cond, then, els }, pos))
    }

    fn parse_script_for(&mut self, pos: Position, label: Option<Symbol>) -> PResult<StmtId> {
        let was = self.composite_ok;
        self.composite_ok = false;
        let header = self.parse_for_header()?;
        self.composite_ok = was;
        let body = self.parse_script_block()?;
        let stmt = self.finish_for(header, body);
        let s = self.ast.stmts.alloc(stmt, pos);
        Ok(self.wrap_label(label, s, pos))
    }

    fn parse_script_switch(&mut self, pos: Position, label: Option<Symbol>) -> PResult<StmtId> {
        let was = self.composite_ok;
        self.composite_ok = false;
        let header = self.parse_switch_header()?;
        self.composite_ok = was;
        self.expect(Tok::LBrace)?;
        let mut cases = Vec::new();
        loop {
            let t = self.cur();
            match t.tok {
                Tok::Case => {
                    self.bump();
                    let mut exprs = vec![self.parse_expr()?];
                    while self.eat(Tok::Comma) {
                        exprs.push(self.parse_expr()?);
                    }
                    self.expect(Tok::Colon)?;
                    let body = self.parse_case_body()?;
                    let exprs = self.ast.expr_list(exprs);
                    let body = self.ast.stmt_list(body);
                    cases.push(self.ast.cases.alloc(Case { exprs, comm: None, body }, t.pos));
                }
                Tok::Default => {
                    self.bump();
                    self.expect(Tok::Colon)?;
                    let body = self.parse_case_body()?;
                    let body = self.ast.stmt_list(body);
                    cases.push(
                        self.ast
                            .cases
                            .alloc(Case { exprs: ListRef::EMPTY, comm: None, body }, t.pos),
                    );
                }
                Tok::RBrace => {
                    self.bump();
                    break;
                }
                _ => return Err(self.unexpected("case, default or }")),
            }
        }
        let cases = self.ast.case_list(cases);
        let stmt = match header {
            SwitchHeader::Value { init, expr } => Stmt::Switch { init, expr, cases },
            SwitchHeader::Type { init, binding, subject } => {
                Stmt::TypeSwitch { init, binding, subject, cases }
            }
        };
        let s = self.ast.stmts.alloc(stmt, pos);
        Ok(self.wrap_label(label, s, pos))
    }

    fn parse_script_select(&mut self, pos: Position) -> PResult<StmtId> {
        self.expect(Tok::LBrace)?;
        let mut cases = Vec::new();
        loop {
            let t = self.cur();
            match t.tok {
                Tok::Case => {
                    self.bump();
                    let comm = self.parse_simple_or_decl_stmt(false)?;
                    self.expect(Tok::Colon)?;
                    let body = self.parse_case_body()?;
                    let body = self.ast.stmt_list(body);
                    cases.push(
                        self.ast
                            .cases
                            .alloc(Case { exprs: ListRef::EMPTY, comm: Some(comm), body }, t.pos),
                    );
                }
                Tok::Default => {
                    self.bump();
                    self.expect(Tok::Colon)?;
                    let body = self.parse_case_body()?;
                    let body = self.ast.stmt_list(body);
                    cases.push(
                        self.ast
                            .cases
                            .alloc(Case { exprs: ListRef::EMPTY, comm: None, body }, t.pos),
                    );
                }
                Tok::RBrace => {
                    self.bump();
                    break;
                }
                _ => return Err(self.unexpected("case, default or }")),
            }
        }
        let cases = self.ast.case_list(cases);
        Ok(self.ast.stmts.alloc(Stmt::Select { cases }, pos))
    }

    fn parse_case_body(&mut self) -> PResult<Vec<StmtId>> {
        let mut out = Vec::new();
        loop {
            while self.eat(Tok::Semicolon) {}
            if matches!(self.cur().tok, Tok::Case | Tok::Default | Tok::RBrace | Tok::Eof) {
                return Ok(out);
            }
            out.push(self.parse_script_stmt()?);
        }
    }

    // ---------------------------------------------------------------------
    // Headers shared by templates and scripts
    // ---------------------------------------------------------------------

    fn parse_if_header(&mut self) -> PResult<(Option<StmtId>, ExprId)> {
        let was = self.composite_ok;
        if !self.template {
            self.composite_ok = false;
        }
        let first = self.parse_simple_or_decl_stmt(false)?;
        let out = if self.eat(Tok::Semicolon) {
            let cond = self.parse_expr()?;
            (Some(first), cond)
        } else {
            match self.ast.stmts[first] {
                Stmt::Expr(e) => (None, e),
                _ => {
                    return Err(self.err(
                        self.ast.stmts.pos(first),
                        "syntax error: missing condition in if statement",
                    ))
                }
            }
        };
        self.composite_ok = was;
        Ok(out)
    }

    fn parse_switch_header(&mut self) -> PResult<SwitchHeader> {
        // `switch` with an empty header.
        if self.at(Tok::EndStatement) || self.at(Tok::LBrace) {
            return Ok(SwitchHeader::Value { init: None, expr: None });
        }
        let first = self.parse_simple_or_decl_stmt(false)?;
        let (init, subject) = if self.eat(Tok::Semicolon) {
            if self.at(Tok::EndStatement) || self.at(Tok::LBrace) {
                (Some(first), None)
            } else {
                let s = self.parse_simple_or_decl_stmt(false)?;
                (Some(first), Some(s))
            }
        } else {
            (None, Some(first))
        };
        let subject = match subject {
            None => return Ok(SwitchHeader::Value { init, expr: None }),
            Some(s) => s,
        };
        // Recognize the type switch forms `x.(type)` and `v := x.(type)`.
        match self.ast.stmts[subject] {
            Stmt::Expr(e) => {
                if let Expr::TypeAssert { expr, ty: None } = self.ast.exprs[e] {
                    return Ok(SwitchHeader::Type { init, binding: None, subject: expr });
                }
                Ok(SwitchHeader::Value { init, expr: Some(e) })
            }
            Stmt::Assign { lhs, rhs, op: AssignOp::Define } => {
                let lhs = self.ast.exprs_of(lhs);
                let rhs = self.ast.exprs_of(rhs);
                if lhs.len() == 1 && rhs.len() == 1 {
                    if let Expr::TypeAssert { expr, ty: None } = self.ast.exprs[rhs[0]] {
                        let binding = match self.ast.exprs[lhs[0]] {
                            Expr::Ident(s) => Some(s),
                            _ => None,
                        };
                        return Ok(SwitchHeader::Type { init, binding, subject: expr });
                    }
                }
                Err(self.err(
                    self.ast.stmts.pos(subject),
                    "syntax error: cannot use assignment as switch expression",
                ))
            }
            _ => Err(self.err(
                self.ast.stmts.pos(subject),
                "syntax error: cannot use statement as switch expression",
            )),
        }
    }

    fn parse_for_header(&mut self) -> PResult<ForHeader> {
        // `for` with no header.
        if self.at(Tok::EndStatement) || self.at(Tok::LBrace) {
            return Ok(ForHeader::Loop { init: None, cond: None, post: None });
        }
        // `for range e`.
        if self.eat(Tok::Range) {
            let e = self.parse_expr()?;
            return Ok(ForHeader::Range { key: None, value: None, define: false, expr: e });
        }
        // `for ; cond ; post`.
        if self.at(Tok::Semicolon) {
            return self.parse_for_clauses(None);
        }
        let lhs = self.parse_expr_list()?;
        let t = self.cur();
        match t.tok {
            Tok::Define | Tok::Assign => {
                let define = t.tok == Tok::Define;
                self.bump();
                if self.eat(Tok::Range) {
                    let expr = self.parse_expr()?;
                    let (key, value) = match lhs.len() {
                        1 => (Some(lhs[0]), None),
                        2 => (Some(lhs[0]), Some(lhs[1])),
                        _ => {
                            return Err(self
                                .err(t.pos, "syntax error: too many variables in range"))
                        }
                    };
                    return Ok(ForHeader::Range { key, value, define, expr });
                }
                let init = self.finish_assign(lhs, if define { AssignOp::Define } else { AssignOp::Assign }, t.pos)?;
                self.parse_for_clauses(Some(init))
            }
            Tok::Semicolon => {
                if lhs.len() != 1 {
                    return Err(self.err(t.pos, "syntax error: expected one expression"));
                }
                let init = self.ast.stmts.alloc(Stmt::Expr(lhs[0]), t.pos);
                self.parse_for_clauses(Some(init))
            }
            _ => {
                if lhs.len() != 1 {
                    return Err(self.err(t.pos, "syntax error: expected one expression"));
                }
                // A single condition, or a statement like `x++` used as a
                // condition by mistake; the checker reports the latter.
                Ok(ForHeader::Loop { init: None, cond: Some(lhs[0]), post: None })
            }
        }
    }

    fn parse_for_clauses(&mut self, init: Option<StmtId>) -> PResult<ForHeader> {
        self.expect(Tok::Semicolon)?;
        let cond = if self.at(Tok::Semicolon) { None } else { Some(self.parse_expr()?) };
        self.expect(Tok::Semicolon)?;
        let post = if self.at(Tok::EndStatement) || self.at(Tok::LBrace) {
            None
        } else {
            Some(self.parse_simple_or_decl_stmt(false)?)
        };
        Ok(ForHeader::Loop { init, cond, post })
    }

    fn finish_for(&mut self, header: ForHeader, body: StmtId) -> Stmt {
        match header {
            ForHeader::Loop { init, cond, post } => Stmt::For { init, cond, post, body },
            ForHeader::Range { key, value, define, expr } => {
                Stmt::ForRange { key, value, define, expr, body }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Simple statements and declarations
    // ---------------------------------------------------------------------

    /// Parses a simple statement or, when `decls` is set, a `var`,
    /// `const`, `type`, `return`, `break`, ... statement.
    fn parse_simple_or_decl_stmt(&mut self, decls: bool) -> PResult<StmtId> {
        let t = self.cur();
        if decls {
            match t.tok {
                Tok::Var => {
                    self.bump();
                    return self.parse_var_decl(t.pos);
                }
                Tok::Const => {
                    self.bump();
                    return self.parse_const_decl(t.pos);
                }
                Tok::TypeKw => {
                    self.bump();
                    return self.parse_type_decl(t.pos);
                }
                Tok::Return => {
                    self.bump();
                    let values = if matches!(
                        self.cur().tok,
                        Tok::EndStatement | Tok::Semicolon | Tok::RBrace | Tok::Eof
                    ) {
                        Vec::new()
                    } else {
                        self.parse_expr_list()?
                    };
                    let values = self.ast.expr_list(values);
                    return Ok(self.ast.stmts.alloc(Stmt::Return { values }, t.pos));
                }
                Tok::Break | Tok::Continue => {
                    self.bump();
                    let label = if self.at(Tok::Ident) {
                        let l = self.bump();
                        Some(self.ast.intern(self.text(l)))
                    } else {
                        None
                    };
                    let s = if t.tok == Tok::Break {
                        Stmt::Break { label }
                    } else {
                        Stmt::Continue { label }
                    };
                    return Ok(self.ast.stmts.alloc(s, t.pos));
                }
                Tok::Goto => {
                    self.bump();
                    let l = self.expect(Tok::Ident)?;
                    let label = self.ast.intern(self.text(l));
                    return Ok(self.ast.stmts.alloc(Stmt::Goto { label }, t.pos));
                }
                Tok::Fallthrough => {
                    self.bump();
                    return Ok(self.ast.stmts.alloc(Stmt::Fallthrough, t.pos));
                }
                Tok::Defer => {
                    self.bump();
                    let e = self.parse_expr()?;
                    return Ok(self.ast.stmts.alloc(Stmt::Defer(e), t.pos));
                }
                Tok::Go => {
                    self.bump();
                    let e = self.parse_expr()?;
                    return Ok(self.ast.stmts.alloc(Stmt::Go(e), t.pos));
                }
                _ => {}
            }
        }
        let lhs = self.parse_expr_list()?;
        let t = self.cur();
        match t.tok {
            Tok::Define => {
                self.bump();
                self.finish_assign(lhs, AssignOp::Define, t.pos)
            }
            Tok::Assign => {
                self.bump();
                self.finish_assign(lhs, AssignOp::Assign, t.pos)
            }
            Tok::AddAssign
            | Tok::SubAssign
            | Tok::MulAssign
            | Tok::DivAssign
            | Tok::ModAssign
            | Tok::AndAssign
            | Tok::OrAssign
            | Tok::XorAssign
            | Tok::ShlAssign
            | Tok::ShrAssign
            | Tok::AndNotAssign => {
                let op = match t.tok {
                    Tok::AddAssign => AssignOp::Add,
                    Tok::SubAssign => AssignOp::Sub,
                    Tok::MulAssign => AssignOp::Mul,
                    Tok::DivAssign => AssignOp::Div,
                    Tok::ModAssign => AssignOp::Rem,
                    Tok::AndAssign => AssignOp::And,
                    Tok::OrAssign => AssignOp::Or,
                    Tok::XorAssign => AssignOp::Xor,
                    Tok::ShlAssign => AssignOp::Shl,
                    Tok::ShrAssign => AssignOp::Shr,
                    _ => AssignOp::AndNot,
                };
                self.bump();
                if lhs.len() != 1 {
                    return Err(self.err(t.pos, "syntax error: expected one expression on left side"));
                }
                self.finish_assign(lhs, op, t.pos)
            }
            Tok::Inc | Tok::Dec => {
                self.bump();
                if lhs.len() != 1 {
                    return Err(self.err(t.pos, "syntax error: expected one expression"));
                }
                Ok(self
                    .ast
                    .stmts
                    .alloc(Stmt::IncDec { expr: lhs[0], inc: t.tok == Tok::Inc }, t.pos))
            }
            Tok::Arrow => {
                self.bump();
                if lhs.len() != 1 {
                    return Err(self.err(t.pos, "syntax error: expected one expression"));
                }
                let value = self.parse_expr()?;
                Ok(self.ast.stmts.alloc(Stmt::Send { chan: lhs[0], value }, t.pos))
            }
            _ => {
                if lhs.len() != 1 {
                    return Err(self.err(t.pos, "syntax error: expected one expression"));
                }
                let pos = self.ast.exprs.pos(lhs[0]);
                Ok(self.ast.stmts.alloc(Stmt::Expr(lhs[0]), pos))
            }
        }
    }

    fn finish_assign(&mut self, lhs: Vec<ExprId>, op: AssignOp, pos: Position) -> PResult<StmtId> {
        let rhs = self.parse_expr_list()?;
        let lhs = self.ast.expr_list(lhs);
        let rhs = self.ast.expr_list(rhs);
        Ok(self.ast.stmts.alloc(Stmt::Assign { lhs, rhs, op }, pos))
    }

    fn parse_name_list(&mut self) -> PResult<Vec<ExprId>> {
        let mut names = Vec::new();
        loop {
            let t = self.expect(Tok::Ident)?;
            let sym = self.ast.intern(self.text(t));
            names.push(self.ast.exprs.alloc(Expr::Ident(sym), t.pos));
            if !self.eat(Tok::Comma) {
                return Ok(names);
            }
        }
    }

    fn parse_var_decl(&mut self, pos: Position) -> PResult<StmtId> {
        let names = self.parse_name_list()?;
        let ty = if !self.at(Tok::Assign)
            && !self.at(Tok::EndStatement)
            && !self.at(Tok::Semicolon)
        {
            Some(self.parse_type()?)
        } else {
            None
        };
        let values = if self.eat(Tok::Assign) { self.parse_expr_list()? } else { Vec::new() };
        if values.is_empty() && ty.is_none() {
            return Err(self.err(pos, "syntax error: missing type or value in variable declaration"));
        }
        let names = self.ast.expr_list(names);
        let values = self.ast.expr_list(values);
        Ok(self.ast.stmts.alloc(Stmt::Var { names, ty, values }, pos))
    }

    fn parse_const_decl(&mut self, pos: Position) -> PResult<StmtId> {
        let names = self.parse_name_list()?;
        let ty = if !self.at(Tok::Assign)
            && !self.at(Tok::EndStatement)
            && !self.at(Tok::Semicolon)
        {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect(Tok::Assign)?;
        let values = self.parse_expr_list()?;
        let names = self.ast.expr_list(names);
        let values = self.ast.expr_list(values);
        Ok(self.ast.stmts.alloc(Stmt::Const { names, ty, values, iota: 0 }, pos))
    }

    fn parse_type_decl(&mut self, pos: Position) -> PResult<StmtId> {
        let name_tok = self.expect(Tok::Ident)?;
        let name = self.ast.intern(self.text(name_tok));
        let alias = self.eat(Tok::Assign);
        let ty = self.parse_type()?;
        Ok(self.ast.stmts.alloc(Stmt::TypeDecl { name, alias, ty }, pos))
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    fn parse_expr_list(&mut self) -> PResult<Vec<ExprId>> {
        let mut out = vec![self.parse_expr()?];
        while self.eat(Tok::Comma) {
            out.push(self.parse_expr()?);
        }
        Ok(out)
    }

    pub(crate) fn parse_expr(&mut self) -> PResult<ExprId> {
        self.parse_binary(1)
    }

    fn parse_binary(&mut self, min_prec: u8) -> PResult<ExprId> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.cur().tok {
                Tok::LOr => BinOp::LOr,
                Tok::LAnd => BinOp::LAnd,
                Tok::EqEq => BinOp::Eq,
                Tok::NotEq => BinOp::NotEq,
                Tok::Lt => BinOp::Less,
                Tok::Le => BinOp::LessEq,
                Tok::Gt => BinOp::Greater,
                Tok::Ge => BinOp::GreaterEq,
                Tok::Contains => BinOp::Contains,
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                Tok::Pipe => BinOp::Or,
                Tok::Caret => BinOp::Xor,
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Rem,
                Tok::Shl => BinOp::Shl,
                Tok::Shr => BinOp::Shr,
                Tok::Amp => BinOp::And,
                Tok::AndNot => BinOp::AndNot,
                _ => break,
            };
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            let opt = self.bump();
            let rhs = self.parse_binary(prec + 1)?;
            let pos = self.ast.exprs.pos(lhs).to(self.ast.exprs.pos(rhs));
            let _ = opt;
            lhs = self.ast.exprs.alloc(Expr::Binary { op, lhs, rhs }, pos);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<ExprId> {
        let t = self.cur();
        let op = match t.tok {
            Tok::Minus => Some(UnOp::Neg),
            Tok::Plus => Some(UnOp::Pos),
            Tok::Bang => Some(UnOp::Not),
            Tok::Caret => Some(UnOp::BitNot),
            Tok::Star => Some(UnOp::Deref),
            Tok::Amp => Some(UnOp::Addr),
            Tok::Arrow => Some(UnOp::Recv),
            _ => None,
        };
        match op {
            Some(UnOp::Recv) => {
                self.bump();
                // `<-chan T` is a receive-only channel type.
                if self.at(Tok::Chan) {
                    self.bump();
                    let elem = self.parse_type()?;
                    let ty = self
                        .ast
                        .types
                        .alloc(TypeExpr::Chan { dir: ChanDir::Recv, elem }, t.pos);
                    return Ok(self.ast.exprs.alloc(Expr::TypeE(ty), t.pos));
                }
                let expr = self.parse_unary()?;
                let pos = t.pos.to(self.ast.exprs.pos(expr));
                Ok(self.ast.exprs.alloc(Expr::Unary { op: UnOp::Recv, expr }, pos))
            }
            Some(op) => {
                self.bump();
                let expr = self.parse_unary()?;
                let pos = t.pos.to(self.ast.exprs.pos(expr));
                Ok(self.ast.exprs.alloc(Expr::Unary { op, expr }, pos))
            }
            None => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> PResult<ExprId> {
        let mut e = self.parse_primary()?;
        loop {
            let t = self.cur();
            match t.tok {
                Tok::LParen => {
                    self.bump();
                    let mut args = Vec::new();
                    let mut ellipsis = false;
                    while !self.at(Tok::RParen) {
                        args.push(self.parse_expr()?);
                        if self.eat(Tok::Ellipsis) {
                            ellipsis = true;
                            break;
                        }
                        if !self.eat(Tok::Comma) {
                            break;
                        }
                    }
                    let close = self.expect(Tok::RParen)?;
                    let list = self.ast.expr_list(args);
                    let pos = self.ast.exprs.pos(e).to(close.pos);
                    e = self
                        .ast
                        .exprs
                        .alloc(Expr::Call { func: e, args: list, ellipsis }, pos);
                }
                Tok::LBrack => {
                    self.bump();
                    // Index or slice.
                    let low = if self.at(Tok::Colon) { None } else { Some(self.parse_expr()?) };
                    if self.eat(Tok::Colon) {
                        let high = if self.at(Tok::Colon) || self.at(Tok::RBrack) {
                            None
                        } else {
                            Some(self.parse_expr()?)
                        };
                        let max = if self.eat(Tok::Colon) { Some(self.parse_expr()?) } else { None };
                        let close = self.expect(Tok::RBrack)?;
                        let pos = self.ast.exprs.pos(e).to(close.pos);
                        e = self.ast.exprs.alloc(Expr::Slice { expr: e, low, high, max }, pos);
                    } else {
                        let close = self.expect(Tok::RBrack)?;
                        let index = low.ok_or_else(|| self.unexpected("expression"))?;
                        let pos = self.ast.exprs.pos(e).to(close.pos);
                        e = self.ast.exprs.alloc(Expr::Index { expr: e, index }, pos);
                    }
                }
                Tok::Dot => {
                    self.bump();
                    if self.eat(Tok::LParen) {
                        // Type assertion.
                        let ty = if self.at(Tok::TypeKw) {
                            self.bump();
                            None
                        } else {
                            Some(self.parse_type()?)
                        };
                        let close = self.expect(Tok::RParen)?;
                        let pos = self.ast.exprs.pos(e).to(close.pos);
                        e = self.ast.exprs.alloc(Expr::TypeAssert { expr: e, ty }, pos);
                    } else {
                        let name = self.expect(Tok::Ident)?;
                        let sel = self.ast.intern(self.text(name));
                        let pos = self.ast.exprs.pos(e).to(name.pos);
                        e = self.ast.exprs.alloc(Expr::Selector { expr: e, sel }, pos);
                    }
                }
                Tok::LBrace if self.composite_ok && self.is_composite_type(e) => {
                    let elems = self.parse_composite_body()?;
                    let ty = self.expr_as_type(e);
                    let pos = self.ast.exprs.pos(e);
                    e = self.ast.exprs.alloc(Expr::Composite { ty: Some(ty), elems }, pos);
                }
                _ => return Ok(e),
            }
        }
    }

    /// Reports whether `e` can syntactically be the type of a composite
    /// literal.
    fn is_composite_type(&self, e: ExprId) -> bool {
        match self.ast.exprs[e] {
            Expr::Ident(_) => true,
            Expr::Selector { expr, .. } => matches!(self.ast.exprs[expr], Expr::Ident(_)),
            Expr::TypeE(t) => matches!(
                self.ast.types[t],
                TypeExpr::Slice(_)
                    | TypeExpr::Array { .. }
                    | TypeExpr::Map { .. }
                    | TypeExpr::Struct { .. }
                    | TypeExpr::Name(_)
                    | TypeExpr::Qualified { .. }
            ),
            _ => false,
        }
    }

    fn expr_as_type(&mut self, e: ExprId) -> TypeExprId {
        let pos = self.ast.exprs.pos(e);
        match self.ast.exprs[e] {
            Expr::TypeE(t) => t,
            Expr::Ident(s) => self.ast.types.alloc(TypeExpr::Name(s), pos),
            Expr::Selector { expr, sel } => match self.ast.exprs[expr] {
                Expr::Ident(pkg) => {
                    self.ast.types.alloc(TypeExpr::Qualified { pkg, name: sel }, pos)
                }
                _ => self.ast.types.alloc(TypeExpr::Name(sel), pos),
            },
            _ => {
                let sym = self.ast.intern("_");
                self.ast.types.alloc(TypeExpr::Name(sym), pos)
            }
        }
    }

    fn parse_composite_body(&mut self) -> PResult<ListRef> {
        self.expect(Tok::LBrace)?;
        let mut elems = Vec::new();
        while !self.at(Tok::RBrace) {
            let first = self.parse_composite_value()?;
            if self.eat(Tok::Colon) {
                let value = self.parse_composite_value()?;
                elems.push(KeyedElement { key: Some(first), value });
            } else {
                elems.push(KeyedElement { key: None, value: first });
            }
            if !self.eat(Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RBrace)?;
        Ok(self.ast.element_list(elems))
    }

    /// A composite element value: an expression, or a nested composite
    /// literal with elided type.
    fn parse_composite_value(&mut self) -> PResult<ExprId> {
        if self.at(Tok::LBrace) {
            let pos = self.cur().pos;
            let elems = self.parse_composite_body()?;
            return Ok(self.ast.exprs.alloc(Expr::Composite { ty: None, elems }, pos));
        }
        let was = self.composite_ok;
        self.composite_ok = true;
        let e = self.parse_expr();
        self.composite_ok = was;
        e
    }

    fn parse_primary(&mut self) -> PResult<ExprId> {
        let t = self.cur();
        match t.tok {
            Tok::Int => {
                self.bump();
                let sym = self.ast.intern(self.text(t));
                Ok(self.ast.exprs.alloc(Expr::IntLit(sym), t.pos))
            }
            Tok::Float => {
                self.bump();
                let sym = self.ast.intern(self.text(t));
                Ok(self.ast.exprs.alloc(Expr::FloatLit(sym), t.pos))
            }
            Tok::Imag => {
                self.bump();
                let sym = self.ast.intern(self.text(t));
                Ok(self.ast.exprs.alloc(Expr::ImagLit(sym), t.pos))
            }
            Tok::Rune => {
                self.bump();
                let c = self.decode_rune(t)?;
                Ok(self.ast.exprs.alloc(Expr::RuneLit(c), t.pos))
            }
            Tok::InterpretedString | Tok::RawString => {
                self.bump();
                let s = self.decode_string(t)?;
                let sym = self.ast.intern(&s);
                Ok(self.ast.exprs.alloc(Expr::StringLit(sym), t.pos))
            }
            Tok::Ident => {
                self.bump();
                let sym = self.ast.intern(self.text(t));
                Ok(self.ast.exprs.alloc(Expr::Ident(sym), t.pos))
            }
            Tok::LParen => {
                self.bump();
                let was = self.composite_ok;
                self.composite_ok = true;
                let e = self.parse_expr()?;
                self.composite_ok = was;
                self.expect(Tok::RParen)?;
                Ok(e)
            }
            Tok::Func => {
                self.bump();
                self.expect(Tok::LParen)?;
                let (params, variadic) = self.parse_params(Tok::RParen)?;
                self.expect(Tok::RParen)?;
                let results = self.parse_results()?;
                if self.at(Tok::LBrace) {
                    let was = self.composite_ok;
                    self.composite_ok = true;
                    let body = self.parse_script_block()?;
                    self.composite_ok = was;
                    Ok(self
                        .ast
                        .exprs
                        .alloc(Expr::FuncLit { params, results, variadic, body }, t.pos))
                } else {
                    let ty = self
                        .ast
                        .types
                        .alloc(TypeExpr::Func { params, results, variadic }, t.pos);
                    Ok(self.ast.exprs.alloc(Expr::TypeE(ty), t.pos))
                }
            }
            Tok::LBrack | Tok::Map | Tok::Chan | Tok::Struct | Tok::Interface => {
                let ty = self.parse_type()?;
                Ok(self.ast.exprs.alloc(Expr::TypeE(ty), t.pos))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    // ---------------------------------------------------------------------
    // Types
    // ---------------------------------------------------------------------

    fn parse_type(&mut self) -> PResult<TypeExprId> {
        let t = self.cur();
        match t.tok {
            Tok::Ident => {
                self.bump();
                let name = self.ast.intern(self.text(t));
                if self.at(Tok::Dot) && self.peek(1).tok == Tok::Ident {
                    self.bump();
                    let sel = self.bump();
                    let sym = self.ast.intern(self.text(sel));
                    Ok(self
                        .ast
                        .types
                        .alloc(TypeExpr::Qualified { pkg: name, name: sym }, t.pos))
                } else {
                    Ok(self.ast.types.alloc(TypeExpr::Name(name), t.pos))
                }
            }
            Tok::Star => {
                self.bump();
                let elem = self.parse_type()?;
                Ok(self.ast.types.alloc(TypeExpr::Ptr(elem), t.pos))
            }
            Tok::LBrack => {
                self.bump();
                if self.eat(Tok::RBrack) {
                    let elem = self.parse_type()?;
                    Ok(self.ast.types.alloc(TypeExpr::Slice(elem), t.pos))
                } else if self.eat(Tok::Ellipsis) {
                    self.expect(Tok::RBrack)?;
                    let elem = self.parse_type()?;
                    Ok(self.ast.types.alloc(TypeExpr::Array { len: None, elem }, t.pos))
                } else {
                    let len = self.parse_expr()?;
                    self.expect(Tok::RBrack)?;
                    let elem = self.parse_type()?;
                    Ok(self
                        .ast
                        .types
                        .alloc(TypeExpr::Array { len: Some(len), elem }, t.pos))
                }
            }
            Tok::Map => {
                self.bump();
                self.expect(Tok::LBrack)?;
                let key = self.parse_type()?;
                self.expect(Tok::RBrack)?;
                let value = self.parse_type()?;
                Ok(self.ast.types.alloc(TypeExpr::Map { key, value }, t.pos))
            }
            Tok::Chan => {
                self.bump();
                let dir = if self.eat(Tok::Arrow) { ChanDir::Send } else { ChanDir::Both };
                let elem = self.parse_type()?;
                Ok(self.ast.types.alloc(TypeExpr::Chan { dir, elem }, t.pos))
            }
            Tok::Arrow => {
                self.bump();
                self.expect(Tok::Chan)?;
                let elem = self.parse_type()?;
                Ok(self
                    .ast
                    .types
                    .alloc(TypeExpr::Chan { dir: ChanDir::Recv, elem }, t.pos))
            }
            Tok::Func => {
                self.bump();
                self.expect(Tok::LParen)?;
                let (params, variadic) = self.parse_params(Tok::RParen)?;
                self.expect(Tok::RParen)?;
                let results = self.parse_results()?;
                Ok(self
                    .ast
                    .types
                    .alloc(TypeExpr::Func { params, results, variadic }, t.pos))
            }
            Tok::Struct => {
                self.bump();
                self.expect(Tok::LBrace)?;
                let mut fields = Vec::new();
                while !self.at(Tok::RBrace) {
                    self.parse_field_decl(&mut fields)?;
                    if !self.eat(Tok::Semicolon) && !self.at(Tok::RBrace) {
                        return Err(self.unexpected("semicolon or }"));
                    }
                }
                self.expect(Tok::RBrace)?;
                let fields = self.ast.field_list(fields);
                Ok(self.ast.types.alloc(TypeExpr::Struct { fields }, t.pos))
            }
            Tok::Interface => {
                self.bump();
                self.expect(Tok::LBrace)?;
                let mut methods = Vec::new();
                while self.at(Tok::Ident) {
                    let name_tok = self.bump();
                    let name = self.ast.intern(self.text(name_tok));
                    self.expect(Tok::LParen)?;
                    let (params, variadic) = self.parse_params(Tok::RParen)?;
                    self.expect(Tok::RParen)?;
                    let results = self.parse_results()?;
                    methods.push(MethodDecl { name, pos: name_tok.pos, params, results, variadic });
                    if !self.eat(Tok::Semicolon) {
                        break;
                    }
                }
                self.expect(Tok::RBrace)?;
                let methods = self.ast.method_list(methods);
                Ok(self.ast.types.alloc(TypeExpr::Interface { methods }, t.pos))
            }
            Tok::LParen => {
                self.bump();
                let ty = self.parse_type()?;
                self.expect(Tok::RParen)?;
                Ok(ty)
            }
            _ => Err(self.unexpected("type")),
        }
    }

    fn parse_field_decl(&mut self, out: &mut Vec<FieldDecl>) -> PResult<()> {
        // Embedded field: a (possibly qualified or pointed-to) type name
        // not followed by another name.
        if self.at(Tok::Star)
            || (self.at(Tok::Ident)
                && matches!(self.peek(1).tok, Tok::Semicolon | Tok::RBrace | Tok::Dot))
        {
            let pos = self.cur().pos;
            let ty = self.parse_type()?;
            out.push(FieldDecl { name: None, pos, ty });
            return Ok(());
        }
        let mut names = Vec::new();
        loop {
            let t = self.expect(Tok::Ident)?;
            names.push((self.ast.intern(self.text(t)), t.pos));
            if !self.eat(Tok::Comma) {
                break;
            }
        }
        let ty = self.parse_type()?;
        for (name, pos) in names {
            out.push(FieldDecl { name: Some(name), pos, ty });
        }
        Ok(())
    }

    fn parse_results(&mut self) -> PResult<ListRef> {
        if self.eat(Tok::LParen) {
            let (results, _) = self.parse_params(Tok::RParen)?;
            self.expect(Tok::RParen)?;
            Ok(results)
        } else if self.type_starts_here() {
            let pos = self.cur().pos;
            let ty = self.parse_type()?;
            Ok(self.ast.param_list([Param { name: None, pos, ty }]))
        } else {
            Ok(ListRef::EMPTY)
        }
    }

    fn type_starts_here(&self) -> bool {
        matches!(
            self.cur().tok,
            Tok::Ident
                | Tok::Star
                | Tok::LBrack
                | Tok::Map
                | Tok::Chan
                | Tok::Func
                | Tok::Struct
                | Tok::Interface
                | Tok::Arrow
        )
    }

    /// Parses a parameter list up to (but not consuming) `close`,
    /// resolving the Go grouped-names grammar: `a, b int, c string`.
    fn parse_params(&mut self, close: Tok) -> PResult<(ListRef, bool)> {
        struct RawParam {
            name: Option<(Symbol, Position)>,
            ty: Option<TypeExprId>,
            pos: Position,
            ellipsis: bool,
        }
        let mut raw: Vec<RawParam> = Vec::new();
        let mut variadic = false;
        while !self.at(close) && !self.at(Tok::Eof) {
            let pos = self.cur().pos;
            let mut ellipsis = false;
            // `name type`, `name ...type`, `type` or bare `name`.
            if self.at(Tok::Ident)
                && !matches!(self.peek(1).tok, Tok::Comma | Tok::Dot)
                && self.peek(1).tok != close
            {
                let name_tok = self.bump();
                let name = self.ast.intern(self.text(name_tok));
                if self.eat(Tok::Ellipsis) {
                    ellipsis = true;
                }
                let ty = self.parse_type()?;
                raw.push(RawParam {
                    name: Some((name, name_tok.pos)),
                    ty: Some(ty),
                    pos,
                    ellipsis,
                });
            } else if self.at(Tok::Ellipsis) {
                self.bump();
                let ty = self.parse_type()?;
                raw.push(RawParam { name: None, ty: Some(ty), pos, ellipsis: true });
            } else if self.at(Tok::Ident)
                && matches!(self.peek(1).tok, Tok::Comma) {
                // Either a bare type name or a grouped name; decided when
                // a later element carries a type.
                let name_tok = self.bump();
                let name = self.ast.intern(self.text(name_tok));
                raw.push(RawParam {
                    name: Some((name, name_tok.pos)),
                    ty: None,
                    pos,
                    ellipsis: false,
                });
            } else {
                let ty = self.parse_type()?;
                raw.push(RawParam { name: None, ty: Some(ty), pos, ellipsis: false });
            }
            if !self.eat(Tok::Comma) {
                break;
            }
        }

        let named_mode = raw.iter().any(|p| p.name.is_some() && p.ty.is_some());
        let mut params: Vec<Param> = Vec::new();
        if named_mode {
            // Groups: names without a type take the type of the next
            // element that has one.
            let mut pending: Vec<(Symbol, Position)> = Vec::new();
            for p in &raw {
                match (p.name, p.ty) {
                    (Some(n), None) => pending.push(n),
                    (Some(n), Some(ty)) => {
                        for (name, pos) in pending.drain(..) {
                            params.push(Param { name: Some(name), pos, ty });
                        }
                        params.push(Param { name: Some(n.0), pos: n.1, ty });
                        if p.ellipsis {
                            variadic = true;
                        }
                    }
                    (None, Some(_)) => {
                        return Err(self.err(
                            p.pos,
                            "syntax error: mixed named and unnamed parameters",
                        ))
                    }
                    (None, None) => {}
                }
            }
            if !pending.is_empty() {
                return Err(self.err(
                    pending[0].1,
                    "syntax error: missing parameter type",
                ));
            }
        } else {
            for p in &raw {
                let ty = match (p.ty, p.name) {
                    (Some(ty), _) => ty,
                    (None, Some((name, pos))) => self.ast.types.alloc(TypeExpr::Name(name), pos),
                    (None, None) => continue,
                };
                if p.ellipsis {
                    variadic = true;
                }
                params.push(Param { name: None, pos: p.pos, ty });
            }
        }
        Ok((self.ast.param_list(params), variadic))
    }

    // ---------------------------------------------------------------------
    // Literal decoding
    // ---------------------------------------------------------------------

    fn decode_string(&self, t: Token) -> PResult<String> {
        let raw = self.text(t);
        if raw.starts_with('`') {
            // Carriage returns are discarded in raw string literals.
            return Ok(raw[1..raw.len() - 1].replace('\r', ""));
        }
        decode_escapes(&raw[1..raw.len() - 1], '"')
            .map_err(|m| self.err(t.pos, format!("syntax error: {m}")))
    }

    fn decode_rune(&self, t: Token) -> PResult<char> {
        let raw = self.text(t);
        let body = &raw[1..raw.len() - 1];
        let s = decode_escapes(body, '\'')
            .map_err(|m| self.err(t.pos, format!("syntax error: {m}")))?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            (None, _) => Err(self.err(t.pos, "syntax error: empty rune literal")),
            _ => Err(self.err(t.pos, "syntax error: more than one character in rune literal")),
        }
    }
}

enum RegionOutcome {
    Stmt(StmtId),
    Terminator(BlockEnd, Position),
}

enum SwitchHeader {
    Value { init: Option<StmtId>, expr: Option<ExprId> },
    Type { init: Option<StmtId>, binding: Option<Symbol>, subject: ExprId },
}

enum ForHeader {
    Loop { init: Option<StmtId>, cond: Option<ExprId>, post: Option<StmtId> },
    Range { key: Option<ExprId>, value: Option<ExprId>, define: bool, expr: ExprId },
}

/// Decodes Go escape sequences. The lexer has already validated the
/// shapes; value range errors are still detected here.
fn decode_escapes(body: &str, quote: char) -> Result<String, String> {
    let mut out = String::with_capacity(body.len());
    let mut it = body.chars();
    while let Some(c) = it.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let e = it.next().ok_or("invalid escape")?;
        match e {
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0C'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\x0B'),
            '\\' => out.push('\\'),
            q if q == quote => out.push(q),
            'x' => {
                let hi = it.next().and_then(|c| c.to_digit(16)).ok_or("invalid escape")?;
                let lo = it.next().and_then(|c| c.to_digit(16)).ok_or("invalid escape")?;
                out.push((hi * 16 + lo) as u8 as char);
            }
            'u' | 'U' => {
                let n = if e == 'u' { 4 } else { 8 };
                let mut v: u32 = 0;
                for _ in 0..n {
                    let d = it.next().and_then(|c| c.to_digit(16)).ok_or("invalid escape")?;
                    v = v * 16 + d;
                }
                let c = char::from_u32(v).ok_or("escape is invalid Unicode code point")?;
                out.push(c);
            }
            '0'..='7' => {
                let mut v: u32 = e.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    let d = it.next().and_then(|c| c.to_digit(8)).ok_or("invalid escape")?;
                    v = v * 8 + d;
                }
                if v > 255 {
                    return Err("octal escape value over 255".to_string());
                }
                out.push(v as u8 as char);
            }
            _ => return Err("invalid escape".to_string()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MapFiles;

    fn parse_one(src: &str) -> ParseOutput {
        let fs = MapFiles::from_pairs([("index.html", src)]);
        parse_template(&fs, "index.html").expect(src)
    }

    fn parse_err(src: &str) -> BuildError {
        let fs = MapFiles::from_pairs([("index.html", src)]);
        parse_template(&fs, "index.html").unwrap_err()
    }

    fn top_stmts(out: &ParseOutput) -> Vec<Stmt> {
        out.ast
            .stmts_of(out.ast.tree(out.main).nodes)
            .iter()
            .map(|&s| out.ast.stmts[s])
            .collect()
    }

    #[test]
    fn text_and_show() {
        let out = parse_one("Hello {{ name }}!");
        let stmts = top_stmts(&out);
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[0], Stmt::Text(_)));
        assert!(matches!(stmts[1], Stmt::Show { ctx: Context::Html, .. }));
        assert!(matches!(stmts[2], Stmt::Text(_)));
    }

    #[test]
    fn if_else_blocks() {
        let out = parse_one("{% if a %}x{% else %}y{% end %}");
        let stmts = top_stmts(&out);
        assert_eq!(stmts.len(), 1);
        match stmts[0] {
            Stmt::If { els, .. } => assert!(els.is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn else_if_chain() {
        let out = parse_one("{% if a %}1{% else if b %}2{% else %}3{% end if %}");
        let stmts = top_stmts(&out);
        match stmts[0] {
            Stmt::If { els: Some(e), .. } => {
                assert!(matches!(out.ast.stmts[e], Stmt::If { els: Some(_), .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unmatched_block_reports_open_position() {
        let err = parse_err("{% if a %}x");
        assert!(err.message.contains("expecting {% end %}"), "{}", err.message);
        assert!(err.message.contains("if opened at 1:4"), "{}", err.message);
    }

    #[test]
    fn mismatched_end_word() {
        let err = parse_err("{% if a %}x{% end for %}");
        assert!(err.message.contains("unexpected end for, expecting end if"), "{}", err.message);
    }

    #[test]
    fn for_range_forms() {
        let out = parse_one("{% for i, v := range items %}{{ v }}{% end %}");
        match top_stmts(&out)[0] {
            Stmt::ForRange { key, value, define, .. } => {
                assert!(key.is_some() && value.is_some() && define);
            }
            other => panic!("unexpected {other:?}"),
        }
        let out = parse_one("{% for range items %}x{% end %}");
        assert!(matches!(top_stmts(&out)[0], Stmt::ForRange { key: None, .. }));
    }

    #[test]
    fn three_clause_for() {
        let out = parse_one("{% for i := 0; i < 3; i++ %}x{% end %}");
        match top_stmts(&out)[0] {
            Stmt::For { init, cond, post, .. } => {
                assert!(init.is_some() && cond.is_some() && post.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn switch_with_cases() {
        let out = parse_one("{% switch x %}{% case 1, 2 %}a{% default %}b{% end switch %}");
        match top_stmts(&out)[0] {
            Stmt::Switch { cases, .. } => {
                let cs = out.ast.cases_of(cases).to_vec();
                assert_eq!(cs.len(), 2);
                assert_eq!(out.ast.exprs_of(out.ast.cases[cs[0]].exprs).len(), 2);
                assert!(out.ast.cases[cs[1]].exprs.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn type_switch_binding() {
        let out = parse_one("{% switch v := x.(type) %}{% case int %}i{% end %}");
        assert!(matches!(top_stmts(&out)[0], Stmt::TypeSwitch { binding: Some(_), .. }));
    }

    #[test]
    fn macro_with_format_suffix() {
        let out = parse_one("{% macro Title() html %}Hi{% end macro %}");
        match top_stmts(&out)[0] {
            Stmt::MacroDecl { format, .. } => assert_eq!(format, Format::Html),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn macro_without_parens() {
        let out = parse_one("{% macro Title html %}Hi{% end %}");
        assert!(matches!(top_stmts(&out)[0], Stmt::MacroDecl { .. }));
    }

    #[test]
    fn show_macro_call() {
        let out = parse_one("{% show Title() %}");
        assert!(matches!(top_stmts(&out)[0], Stmt::ShowMacro { .. }));
    }

    #[test]
    fn include_loads_subtree() {
        let fs = MapFiles::from_pairs([
            ("index.html", "a{% include \"part.html\" %}b"),
            ("part.html", "inner {{ x }}"),
        ]);
        let out = parse_template(&fs, "index.html").unwrap();
        let stmts = top_stmts(&out);
        match stmts[1] {
            Stmt::Include { tree, .. } => {
                assert_ne!(tree, TreeRef::PENDING);
                assert_eq!(out.ast.tree(tree).path, "part.html");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn include_cycle_is_rejected() {
        let fs = MapFiles::from_pairs([
            ("a.html", "{% include \"b.html\" %}"),
            ("b.html", "{% include \"a.html\" %}"),
        ]);
        let err = parse_template(&fs, "a.html").unwrap_err();
        assert!(err.message.contains("cyclic reference"), "{}", err.message);
    }

    #[test]
    fn extends_must_be_first() {
        let fs = MapFiles::from_pairs([
            ("index.html", "text{% extends \"base.html\" %}"),
            ("base.html", "base"),
        ]);
        let err = parse_template(&fs, "index.html").unwrap_err();
        assert!(err.message.contains("beginning of the file"), "{}", err.message);
    }

    #[test]
    fn extending_file_allows_only_declarations() {
        let fs = MapFiles::from_pairs([
            ("index.html", "{% extends \"base.html\" %}\n{% macro A %}x{% end %}\nstray"),
            ("base.html", "base"),
        ]);
        let err = parse_template(&fs, "index.html").unwrap_err();
        assert!(err.message.contains("unexpected text in extending file"), "{}", err.message);
    }

    #[test]
    fn import_with_extension_is_loaded() {
        let fs = MapFiles::from_pairs([
            ("index.html", "{% import \"lib.html\" %}ok"),
            ("lib.html", "{% macro M %}m{% end %}"),
        ]);
        let out = parse_template(&fs, "index.html").unwrap();
        match top_stmts(&out)[0] {
            Stmt::Import { tree, .. } => assert!(tree.is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn import_without_extension_is_native() {
        let out = parse_one("{% import \"strings\" %}ok");
        match top_stmts(&out)[0] {
            Stmt::Import { tree, .. } => assert!(tree.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn imported_file_rejects_statements() {
        let fs = MapFiles::from_pairs([
            ("index.html", "{% import \"lib.html\" %}"),
            ("lib.html", "{% if a %}x{% end %}"),
        ]);
        let err = parse_template(&fs, "index.html").unwrap_err();
        assert!(err.message.contains("unexpected statement in imported file"), "{}", err.message);
    }

    #[test]
    fn url_node_wraps_attribute_value() {
        let out = parse_one("<a href=\"/p?{{ q }}\">x</a>");
        let stmts = top_stmts(&out);
        let url = stmts
            .iter()
            .find_map(|s| match s {
                Stmt::Url { stmts, is_set } => Some((*stmts, *is_set)),
                _ => None,
            })
            .expect("no URL node");
        assert!(!url.1);
        let inner: Vec<Stmt> =
            out.ast.stmts_of(url.0).iter().map(|&s| out.ast.stmts[s]).collect();
        assert!(matches!(inner[0], Stmt::Text(_)));
        assert!(matches!(inner[1], Stmt::Show { ctx: Context::Attribute, .. }));
    }

    #[test]
    fn expression_precedence() {
        let out = parse_one("{{ 1 + 2 * 3 }}");
        match top_stmts(&out)[0] {
            Stmt::Show { exprs, .. } => {
                let e = out.ast.exprs_of(exprs)[0];
                match out.ast.exprs[e] {
                    Expr::Binary { op: BinOp::Add, rhs, .. } => {
                        assert!(matches!(
                            out.ast.exprs[rhs],
                            Expr::Binary { op: BinOp::Mul, .. }
                        ));
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn contains_operator_precedence() {
        let out = parse_one("{{ a contains b && c }}");
        match top_stmts(&out)[0] {
            Stmt::Show { exprs, .. } => {
                let e = out.ast.exprs_of(exprs)[0];
                assert!(matches!(out.ast.exprs[e], Expr::Binary { op: BinOp::LAnd, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn composite_literal_with_elided_types() {
        let out = parse_one("{{ len([][]int{{1, 2}, {3, 4}}) }}");
        assert!(matches!(top_stmts(&out)[0], Stmt::Show { .. }));
    }

    #[test]
    fn three_index_slice() {
        let out = parse_one("{{ len(s[1:2:3]) }}");
        assert!(matches!(top_stmts(&out)[0], Stmt::Show { .. }));
    }

    #[test]
    fn script_statements() {
        let out = parse_script("var a = 1\nfor i := 0; i < 3; i++ { a = a + i }\n", "main.ggo").unwrap();
        let stmts: Vec<Stmt> = out
            .ast
            .stmts_of(out.ast.tree(out.main).nodes)
            .iter()
            .map(|&s| out.ast.stmts[s])
            .collect();
        assert!(matches!(stmts[0], Stmt::Var { .. }));
        assert!(matches!(stmts[1], Stmt::For { .. }));
    }

    #[test]
    fn script_func_decl() {
        let out = parse_script("func add(a, b int) int { return a + b }", "main.ggo").unwrap();
        let stmts: Vec<Stmt> = out
            .ast
            .stmts_of(out.ast.tree(out.main).nodes)
            .iter()
            .map(|&s| out.ast.stmts[s])
            .collect();
        match stmts[0] {
            Stmt::FuncDecl { params, .. } => {
                assert_eq!(out.ast.params_of(params).len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn script_composite_needs_parens_in_header() {
        assert!(parse_script("if x == (T{}) { }", "m.ggo").is_ok());
    }

    #[test]
    fn print_round_trip() {
        let sources = [
            "Hello {{ name }}!",
            "{% if a %}x{% else %}y{% end %}",
            "{% for i, v := range items %}{{ v }}{% end %}",
            "{% macro Title() html %}Hi{% end %}",
            "{% var x = 1 + 2*3 %}{{ x }}",
            "{% switch x %}{% case 1 %}a{% default %}b{% end %}",
            // Function literals: declared results and real bodies must
            // survive the printer.
            "{% var f = func(a int) int { return a * 2 } %}x",
            "{% var g = func(n int) int { if n > 0 { return n }; return 0 } %}",
            "{% var h = func() (n int) { n = 7; return } %}",
            "{% var s = func(xs []int) int { t := 0; for _, x := range xs { t += x }; return t } %}",
        ];
        for src in sources {
            let out = parse_one(src);
            let printed = printer::print_tree(&out.ast, out.main);
            let fs = MapFiles::from_pairs([("index.html", printed.as_str())]);
            let reparsed = parse_template(&fs, "index.html")
                .unwrap_or_else(|e| panic!("reparse of {printed:?}: {e}"));
            assert!(
                tree_eq(&out.ast, out.main, &reparsed.ast, reparsed.main),
                "round trip failed for {src:?} -> {printed:?}"
            );
        }
    }
}
