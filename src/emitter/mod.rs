//! Lowering of the checked tree to register VM instructions.
//!
//! One `FnBuilder` exists per function being compiled. Local variables
//! get fixed registers assigned by a pre-scan of the body (captured or
//! address-taken locals get a general register holding a reference
//! cell); temporaries are allocated above the locals and released at
//! statement boundaries. Parameters occupy the window positions dictated
//! by the calling convention: per bank, results first, then parameters.

mod expr;
mod stmt;

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{Ast, Expr, ExprId, Stmt, StmtId, TreeRef};
use crate::checker::{CheckOutput, DeclKey, FnKey, GlobalInit};
use crate::code::{Bank, Code, Function, GlobalDef, Instr, Op, SelectSpec};
use crate::error::{BuildError, Position};
use crate::fs::Format;
use crate::types::{Type, TypeId, TypeRegistry};
use crate::vm::value::{zero_value, Value};

/// Lowers a checked compilation into executable code.
pub fn emit(
    ast: &Ast,
    out: &CheckOutput,
    main: TreeRef,
    check_globals: &[crate::checker::GlobalDecl],
) -> Result<Code, BuildError> {
    let em = Emitter { ast, out, reg: &out.registry };

    if check_globals.len() > 256 {
        return Err(BuildError::new(
            &ast.tree(main).path,
            Position::default(),
            "too many global variables",
        ));
    }

    // The executed body is the outermost extended file of the chain.
    let mut body_tree = main;
    loop {
        let nodes = ast.stmts_of(ast.tree(body_tree).nodes);
        match nodes
            .iter()
            .find_map(|&s| match ast.stmts[s] {
                Stmt::Extends { tree, .. } => Some(tree),
                _ => None,
            }) {
            Some(parent) => body_tree = parent,
            None => break,
        }
    }

    let tree = ast.tree(body_tree);
    let format = ast.tree(main).format;
    let nodes = ast.stmts_of(tree.nodes).to_vec();
    let main_fn = em.emit_main(&tree.path, format, &nodes)?;

    let globals = check_globals
        .iter()
        .map(|g| GlobalDef { name: g.name.clone(), ty: g.ty, host: g.host })
        .collect();

    Ok(Code {
        main: Arc::new(main_fn),
        globals,
        registry: Arc::new(clone_registry(&out.registry)),
        format,
        native_values: out.native_values.clone(),
        method_impls: out.method_impls.clone(),
        used_vars: out.used_host_vars.clone(),
    })
}

// The registry is cloned into the immutable `Code` so the checker output
// stays reusable by the caller.
fn clone_registry(reg: &TypeRegistry) -> TypeRegistry {
    reg.clone()
}

pub(crate) struct Emitter<'a> {
    pub ast: &'a Ast,
    pub out: &'a CheckOutput,
    pub reg: &'a TypeRegistry,
}

/// Where a local declaration lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loc {
    Reg(Bank, i8),
    /// A general register holding a `Value::Ptr` reference cell.
    Cell(i8),
    /// A captured variable of the enclosing function.
    CVar(u8),
}

pub(crate) struct LoopCtx {
    pub label: Option<String>,
    pub break_fixups: Vec<usize>,
    pub continue_fixups: Vec<usize>,
    /// Range iterator depth at loop entry; break pops down to it.
    pub range_depth: u32,
    pub is_range: bool,
    /// `for` loops accept `continue`; switches and selects only `break`.
    pub is_loop: bool,
}

pub(crate) struct FnBuilder<'a> {
    pub em: &'a Emitter<'a>,
    pub f: Function,
    /// Next free register per bank (1-based).
    pub top: [u8; 4],
    /// First temporary register per bank (locals live below).
    pub locals_end: [u8; 4],
    pub locals: HashMap<DeclKey, Loc>,
    pub cvars: HashMap<DeclKey, u8>,
    pub labels: HashMap<String, u32>,
    pub gotos: Vec<(usize, String, Position)>,
    pub loops: Vec<LoopCtx>,
    pub range_depth: u32,
    pub path: String,
    /// A label waiting to attach to the next loop or switch statement.
    pub pending_label: Option<String>,
}

impl Emitter<'_> {
    fn emit_main(
        &self,
        path: &str,
        format: Format,
        nodes: &[StmtId],
    ) -> Result<Function, BuildError> {
        let mut fb = FnBuilder::new(self, "main", path, format, true);

        // Parameters: none. Pre-scan the body for locals.
        fb.prescan_stmts(nodes);
        fb.finish_locals();

        // Global initializers run first: closures (macros, functions),
        // then package-level variable initializers in dependency order.
        for &gidx in &self.out.init_order {
            let g = &self.out.globals[gidx as usize];
            match g.init {
                GlobalInit::Closure(s) => {
                    let sub = self.emit_decl_closure(s, &fb.path, g.ty)?;
                    let fi = fb.add_subfunction(sub)?;
                    let tmp = fb.alloc(Bank::Gen)?;
                    fb.push(Instr::new(Op::Func, 0, fi, tmp), Position::default());
                    fb.push(
                        Instr::new(Op::SetVar, tmp, gidx as u8 as i8, 3),
                        Position::default(),
                    );
                    fb.free_temps();
                }
                GlobalInit::Expr(e) => {
                    let ty = g.ty;
                    let v = fb.emit_boxed(e, ty)?;
                    fb.push(
                        Instr::new(Op::SetVar, v, gidx as u8 as i8, 3),
                        self.ast.exprs.pos(e),
                    );
                    fb.free_temps();
                }
                _ => {}
            }
        }

        for &s in nodes {
            fb.emit_stmt(s)?;
            fb.free_temps();
        }
        fb.push(Instr::new(Op::Return, 0, 0, 0), Position::default());
        fb.finish()
    }

    /// Compiles a macro or function declaration statement into a
    /// standalone function (no captured variables).
    pub(crate) fn emit_decl_closure(
        &self,
        s: StmtId,
        path: &str,
        ty: TypeId,
    ) -> Result<Function, BuildError> {
        match self.ast.stmts[s] {
            Stmt::MacroDecl { name, params, variadic: _, format: _, body } => {
                let name = self.ast.name(name).to_string();
                let format = match self.reg.get(ty) {
                    Type::Macro(m) => m.format,
                    _ => Format::Text,
                };
                let mut fb = FnBuilder::new(self, &name, path, format, true);
                let params = self.ast.params_of(params).to_vec();
                let ins: Vec<TypeId> = (0..params.len())
                    .map(|i| self.out.decl_types[&DeclKey::StmtParam(s.raw(), i as u16)])
                    .collect();
                fb.layout_params(&ins, &[], |i| DeclKey::StmtParam(s.raw(), i as u16));
                let nodes = self.ast.stmts_of(body).to_vec();
                fb.prescan_stmts(&nodes);
                fb.finish_locals();
                fb.emit_param_cells()?;
                for &inner in &nodes {
                    fb.emit_stmt(inner)?;
                    fb.free_temps();
                }
                fb.push(Instr::new(Op::Return, 0, 0, 0), Position::default());
                fb.f.is_macro = true;
                fb.finish()
            }
            Stmt::FuncDecl { name, params, results, variadic: _, body } => {
                let name = self.ast.name(name).to_string();
                let mut fb = FnBuilder::new(self, &name, path, Format::Text, false);
                let params = self.ast.params_of(params).to_vec();
                let result_list = self.ast.params_of(results).to_vec();
                let ins: Vec<TypeId> = (0..params.len())
                    .map(|i| self.out.decl_types[&DeclKey::StmtParam(s.raw(), i as u16)])
                    .collect();
                let outs: Vec<TypeId> = result_list
                    .iter()
                    .enumerate()
                    .map(|(i, r)| {
                        self.out
                            .decl_types
                            .get(&DeclKey::StmtParam(s.raw(), (params.len() + i) as u16))
                            .copied()
                            .unwrap_or_else(|| self.out.denoted(r.ty))
                    })
                    .collect();
                fb.layout_params(&ins, &outs, |i| DeclKey::StmtParam(s.raw(), i as u16));
                // Named results are locals aliased onto the result window.
                for (i, r) in result_list.iter().enumerate() {
                    if r.name.is_some() {
                        let key = DeclKey::StmtParam(s.raw(), (params.len() + i) as u16);
                        let bank = Bank::of(self.reg, outs[i]);
                        let reg = fb.result_reg(&outs, i, bank);
                        fb.locals.insert(key, Loc::Reg(bank, reg));
                    }
                }
                fb.prescan_stmt(body);
                fb.finish_locals();
                fb.emit_param_cells()?;
                fb.emit_stmt(body)?;
                fb.push(Instr::new(Op::Return, 0, 0, 0), Position::default());
                fb.finish()
            }
            _ => unreachable!("closure init on non-declaration"),
        }
    }
}

impl<'a> FnBuilder<'a> {
    pub(crate) fn new(
        em: &'a Emitter<'a>,
        name: &str,
        path: &str,
        format: Format,
        is_macro: bool,
    ) -> FnBuilder<'a> {
        FnBuilder {
            em,
            f: Function {
                name: name.to_string(),
                file: path.to_string(),
                format,
                regs: [0; 4],
                in_counts: [0; 4],
                out_counts: [0; 4],
                consts_int: Vec::new(),
                consts_float: Vec::new(),
                consts_string: Vec::new(),
                consts_general: Vec::new(),
                types: Vec::new(),
                funcs: Vec::new(),
                crefs: Vec::new(),
                selects: Vec::new(),
                body: Vec::new(),
                lines: Vec::new(),
                ins: Vec::new(),
                outs: Vec::new(),
                native: None,
                is_macro,
            },
            top: [1; 4],
            locals_end: [1; 4],
            locals: HashMap::new(),
            cvars: HashMap::new(),
            labels: HashMap::new(),
            gotos: Vec::new(),
            loops: Vec::new(),
            range_depth: 0,
            path: path.to_string(),
            pending_label: None,
        }
    }

    pub(crate) fn err(&self, pos: Position, msg: impl Into<String>) -> BuildError {
        BuildError::new(&self.path, pos, msg)
    }

    // ---------------------------------------------------------------------
    // Registers and constants
    // ---------------------------------------------------------------------

    pub(crate) fn alloc(&mut self, bank: Bank) -> Result<i8, BuildError> {
        let b = bank as usize;
        let r = self.top[b];
        if r > 125 {
            return Err(self.err(
                Position::default(),
                "function too complex: out of registers",
            ));
        }
        self.top[b] += 1;
        if self.top[b] > self.f.regs[b] {
            self.f.regs[b] = self.top[b];
        }
        Ok(r as i8)
    }

    /// Releases every temporary register; called between statements.
    pub(crate) fn free_temps(&mut self) {
        self.top = self.locals_end;
    }

    pub(crate) fn mark(&self) -> [u8; 4] {
        self.top
    }

    pub(crate) fn release(&mut self, mark: [u8; 4]) {
        self.top = mark;
    }

    pub(crate) fn push(&mut self, i: Instr, pos: Position) {
        self.f.body.push(i);
        self.f.lines.push(pos);
    }

    pub(crate) fn pc(&self) -> u32 {
        self.f.body.len() as u32
    }

    pub(crate) fn const_int(&mut self, v: i64) -> Result<i8, BuildError> {
        if let Some(i) = self.f.consts_int.iter().position(|&x| x == v) {
            return Ok(i as u8 as i8);
        }
        if self.f.consts_int.len() >= 256 {
            return Err(self.err(Position::default(), "function too complex: constant pool full"));
        }
        self.f.consts_int.push(v);
        Ok((self.f.consts_int.len() - 1) as u8 as i8)
    }

    pub(crate) fn const_float(&mut self, v: f64) -> Result<i8, BuildError> {
        if let Some(i) = self.f.consts_float.iter().position(|&x| x.to_bits() == v.to_bits()) {
            return Ok(i as u8 as i8);
        }
        if self.f.consts_float.len() >= 256 {
            return Err(self.err(Position::default(), "function too complex: constant pool full"));
        }
        self.f.consts_float.push(v);
        Ok((self.f.consts_float.len() - 1) as u8 as i8)
    }

    pub(crate) fn const_string(&mut self, v: &str) -> Result<i8, BuildError> {
        if let Some(i) = self.f.consts_string.iter().position(|x| &**x == v) {
            return Ok(i as u8 as i8);
        }
        if self.f.consts_string.len() >= 256 {
            return Err(self.err(Position::default(), "function too complex: constant pool full"));
        }
        self.f.consts_string.push(Arc::from(v));
        Ok((self.f.consts_string.len() - 1) as u8 as i8)
    }

    pub(crate) fn const_general(&mut self, v: Value) -> Result<i8, BuildError> {
        if self.f.consts_general.len() >= 256 {
            return Err(self.err(Position::default(), "function too complex: constant pool full"));
        }
        self.f.consts_general.push(v);
        Ok((self.f.consts_general.len() - 1) as u8 as i8)
    }

    pub(crate) fn type_idx(&mut self, ty: TypeId) -> Result<i8, BuildError> {
        if let Some(i) = self.f.types.iter().position(|&t| t == ty) {
            return Ok(i as u8 as i8);
        }
        if self.f.types.len() >= 256 {
            return Err(self.err(Position::default(), "function too complex: type table full"));
        }
        self.f.types.push(ty);
        Ok((self.f.types.len() - 1) as u8 as i8)
    }

    pub(crate) fn add_subfunction(&mut self, f: Function) -> Result<i8, BuildError> {
        if self.f.funcs.len() >= 256 {
            return Err(self.err(Position::default(), "function too complex: too many functions"));
        }
        self.f.funcs.push(Arc::new(f));
        Ok((self.f.funcs.len() - 1) as u8 as i8)
    }

    pub(crate) fn add_select(&mut self, spec: SelectSpec) -> Result<i8, BuildError> {
        self.f.selects.push(spec);
        Ok((self.f.selects.len() - 1) as u8 as i8)
    }

    // ---------------------------------------------------------------------
    // Parameter layout
    // ---------------------------------------------------------------------

    /// Assigns parameter registers per the calling convention and maps
    /// the parameter declaration keys.
    pub(crate) fn layout_params(
        &mut self,
        ins: &[TypeId],
        outs: &[TypeId],
        key_of: impl Fn(usize) -> DeclKey,
    ) {
        let reg = self.em.reg;
        let mut counts = [0u8; 4];
        for &t in outs {
            counts[Bank::of(reg, t) as usize] += 1;
        }
        self.f.out_counts = counts;
        let out_counts = counts;
        let mut next = counts;
        for (i, &t) in ins.iter().enumerate() {
            let bank = Bank::of(reg, t);
            let r = next[bank as usize] + 1;
            next[bank as usize] = r;
            self.locals.insert(key_of(i), Loc::Reg(bank, r as i8));
        }
        for b in 0..4 {
            self.f.in_counts[b] = next[b] - out_counts[b];
            self.top[b] = next[b] + 1;
            self.locals_end[b] = self.top[b];
        }
        self.f.ins = ins.to_vec();
        self.f.outs = outs.to_vec();
        for b in 0..4 {
            if self.top[b] > self.f.regs[b] {
                self.f.regs[b] = self.top[b];
            }
        }
    }

    /// The register of result `i` in this function's own window.
    pub(crate) fn result_reg(&self, outs: &[TypeId], i: usize, bank: Bank) -> i8 {
        let reg = self.em.reg;
        let mut n = 0u8;
        for &t in &outs[..i] {
            if Bank::of(reg, t) == bank {
                n += 1;
            }
        }
        (n + 1) as i8
    }

    /// Boxes captured or address-taken parameters into reference cells.
    pub(crate) fn emit_param_cells(&mut self) -> Result<(), BuildError> {
        let keys: Vec<(DeclKey, Loc)> = self
            .locals
            .iter()
            .map(|(&k, &l)| (k, l))
            .filter(|(k, _)| self.em.out.indirect.contains(k))
            .collect();
        for (key, loc) in keys {
            if let Loc::Reg(bank, r) = loc {
                let ty = self.em.out.decl_types[&key];
                let cell = self.alloc_local(Bank::Gen)?;
                let boxed = self.alloc(Bank::Gen)?;
                let ti = self.type_idx(ty)?;
                if bank == Bank::Gen {
                    self.push(Instr::new(Op::MoveGeneral, 0, r, boxed), Position::default());
                } else {
                    self.push(Instr::new(Op::Typify, ti, r, boxed), Position::default());
                }
                // New cell containing the boxed value.
                self.push(Instr::new(Op::New, ti, 0, cell), Position::default());
                self.push(
                    Instr::new(Op::StorePtr, boxed, cell, Bank::Gen as u8 as i8),
                    Position::default(),
                );
                self.locals.insert(key, Loc::Cell(cell));
                self.free_temps();
            }
        }
        Ok(())
    }

    fn alloc_local(&mut self, bank: Bank) -> Result<i8, BuildError> {
        // Locals grow the reserved area; temporaries above move up.
        let b = bank as usize;
        let r = self.locals_end[b];
        if r > 125 {
            return Err(self.err(Position::default(), "function too complex: out of registers"));
        }
        self.locals_end[b] += 1;
        if self.top[b] < self.locals_end[b] {
            self.top[b] = self.locals_end[b];
        }
        if self.top[b] > self.f.regs[b] {
            self.f.regs[b] = self.top[b];
        }
        Ok(r as i8)
    }

    // ---------------------------------------------------------------------
    // Local pre-scan
    // ---------------------------------------------------------------------

    /// Walks the body (without entering nested function bodies) and
    /// assigns a register to every local declaration.
    pub(crate) fn prescan_stmts(&mut self, nodes: &[StmtId]) {
        for &s in nodes {
            self.prescan_stmt(s);
        }
    }

    pub(crate) fn prescan_stmt(&mut self, s: StmtId) {
        let ast = self.em.ast;
        match ast.stmts[s] {
            Stmt::Var { names, .. } => {
                for &n in ast.exprs_of(names) {
                    self.assign_local(DeclKey::Expr(n.raw()));
                }
            }
            Stmt::Assign { lhs, .. } => {
                for &n in ast.exprs_of(lhs) {
                    self.assign_local(DeclKey::Expr(n.raw()));
                }
            }
            Stmt::ForRange { key, value, body, .. } => {
                for n in [key, value].into_iter().flatten() {
                    self.assign_local(DeclKey::Expr(n.raw()));
                }
                self.prescan_stmt(body);
            }
            Stmt::If { init, then, els, .. } => {
                if let Some(i) = init {
                    self.prescan_stmt(i);
                }
                self.prescan_stmt(then);
                if let Some(e) = els {
                    self.prescan_stmt(e);
                }
            }
            Stmt::For { init, post, body, .. } => {
                if let Some(i) = init {
                    self.prescan_stmt(i);
                }
                if let Some(p) = post {
                    self.prescan_stmt(p);
                }
                self.prescan_stmt(body);
            }
            Stmt::Switch { init, cases, .. } => {
                if let Some(i) = init {
                    self.prescan_stmt(i);
                }
                self.prescan_cases(cases);
            }
            Stmt::TypeSwitch { init, cases, .. } => {
                if let Some(i) = init {
                    self.prescan_stmt(i);
                }
                for &c in ast.cases_of(cases) {
                    self.assign_local(DeclKey::Case(c.raw()));
                }
                self.prescan_cases(cases);
            }
            Stmt::Select { cases } => {
                for &c in ast.cases_of(cases) {
                    if let Some(comm) = ast.cases[c].comm {
                        self.prescan_stmt(comm);
                    }
                }
                self.prescan_cases(cases);
            }
            Stmt::Block { stmts } | Stmt::Url { stmts, .. } => {
                for &inner in ast.stmts_of(stmts) {
                    self.prescan_stmt(inner);
                }
            }
            Stmt::Labeled { stmt, .. } => self.prescan_stmt(stmt),
            Stmt::MacroDecl { .. } => {
                self.assign_local(DeclKey::Stmt(s.raw()));
            }
            Stmt::Include { tree, .. } => {
                let nodes = ast.stmts_of(ast.tree(tree).nodes).to_vec();
                for inner in nodes {
                    self.prescan_stmt(inner);
                }
            }
            _ => {}
        }
    }

    fn prescan_cases(&mut self, cases: crate::ast::ListRef) {
        let ast = self.em.ast;
        for &c in ast.cases_of(cases) {
            for &inner in ast.stmts_of(ast.cases[c].body) {
                self.prescan_stmt(inner);
            }
        }
    }

    fn assign_local(&mut self, key: DeclKey) {
        if self.locals.contains_key(&key) {
            return;
        }
        let ty = match self.em.out.decl_types.get(&key) {
            Some(&ty) => ty,
            None => return, // not a declaration (plain assignment target)
        };
        let loc = if self.em.out.indirect.contains(&key) {
            match self.alloc_local(Bank::Gen) {
                Ok(r) => Loc::Cell(r),
                Err(_) => return,
            }
        } else {
            let bank = Bank::of(self.em.reg, ty);
            match self.alloc_local(bank) {
                Ok(r) => Loc::Reg(bank, r),
                Err(_) => return,
            }
        };
        self.locals.insert(key, loc);
    }

    pub(crate) fn finish_locals(&mut self) {
        self.free_temps();
        // Reference cells for indirect locals are created lazily at their
        // declaration statements; cells for parameters are made by
        // `emit_param_cells`.
    }

    // ---------------------------------------------------------------------
    // Finish
    // ---------------------------------------------------------------------

    pub(crate) fn finish(mut self) -> Result<Function, BuildError> {
        // Resolve pending gotos.
        let gotos = std::mem::take(&mut self.gotos);
        for (pc, label, pos) in gotos {
            match self.labels.get(&label) {
                Some(&target) => {
                    self.f.body[pc] = Instr::jump(Op::Goto, target);
                }
                None => {
                    return Err(self.err(pos, format!("label {label} not defined")));
                }
            }
        }
        Ok(self.f)
    }
}
