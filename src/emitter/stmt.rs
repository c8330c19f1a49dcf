//! Statement lowering.

use crate::ast::{AssignOp, Expr, ExprId, ListRef, Stmt, StmtId, UnOp};
use crate::checker::{Binding, DeclKey, FnKey, GlobalInit};
use crate::code::{Bank, Cond, Instr, Op, SelectCase, SelectSpec};
use crate::error::{BuildError, Position};
use crate::types::{Type, TypeId};

use super::{FnBuilder, Loc, LoopCtx};

type SResult = Result<(), BuildError>;

/// A placeholder static type for values known only by bank.
fn bank_default_type(bank: Bank) -> TypeId {
    match bank {
        Bank::Int => crate::types::INT,
        Bank::Float => crate::types::FLOAT64,
        Bank::Str => crate::types::STRING,
        Bank::Gen => crate::types::ANY,
    }
}

/// An assignment destination with its containers already evaluated.
enum Target {
    Blank,
    Reg(Bank, i8),
    Cell(i8, Bank),
    Global(u32, Bank),
    SliceElem { slice: i8, index: (bool, i8), elem_ty: TypeId },
    MapElem { map: i8, key: i8, val_ty: TypeId },
    Field { st: i8, idx: u8, fty: TypeId },
    Deref { cell: i8, ty: TypeId },
}

impl FnBuilder<'_> {
    fn spos(&self, s: StmtId) -> Position {
        self.em.ast.stmts.pos(s)
    }

    pub(crate) fn emit_stmt(&mut self, s: StmtId) -> SResult {
        let ast = self.em.ast;
        let pos = self.spos(s);
        match ast.stmts[s] {
            Stmt::Expr(e) => {
                self.emit_expr_discard(e)?;
                Ok(())
            }
            Stmt::Send { chan, value } => {
                let ch = self.emit_expr(chan, None)?;
                let vty = self.ty_of(value);
                let v = self.emit_boxed(value, vty)?;
                self.push(Instr::new(Op::Send, ch, v, 0), pos);
                Ok(())
            }
            Stmt::IncDec { expr, inc } => {
                let ty = self.ty_of(expr);
                let target = self.prepare_target(expr)?;
                let cur = self.load_target(&target, ty, pos)?;
                let k1 = self.const_int(1)?;
                let bank = self.bank_of(ty);
                match bank {
                    Bank::Int => {
                        let op = if inc { Op::AddInt } else { Op::SubInt };
                        self.push(Instr::with_k(op, cur, k1, cur), pos);
                        self.emit_wrap(ty, cur, pos)?;
                    }
                    Bank::Float => {
                        let kf = self.const_float(1.0)?;
                        let op = if inc { Op::AddFloat } else { Op::SubFloat };
                        self.push(Instr::with_k(op, cur, kf, cur), pos);
                    }
                    _ => return Err(self.err(pos, "invalid ++/-- operand")),
                }
                self.store_target(&target, bank, cur, ty, pos)
            }
            Stmt::Assign { lhs, rhs, op } => self.emit_assign(s, lhs, rhs, op),
            Stmt::Var { names, values, .. } => {
                let names = ast.exprs_of(names).to_vec();
                let values = ast.exprs_of(values).to_vec();
                if values.len() == 1 && names.len() > 1 {
                    // Multi-value initializer.
                    let elems = match self.em.reg.get(self.ty_of(values[0])).clone() {
                        Type::Tuple(elems) => elems,
                        _ => Vec::new(),
                    };
                    let results = self.emit_call_results(values[0])?;
                    for (i, (&name, (bank, r))) in names.iter().zip(results).enumerate() {
                        let key = DeclKey::Expr(name.raw());
                        if let Some(&ty) = self.em.out.decl_types.get(&key) {
                            let src_ty = elems.get(i).copied().unwrap_or(ty);
                            self.store_local(key, ty, bank, r, src_ty, pos)?;
                        }
                    }
                    return Ok(());
                }
                for (i, &name) in names.iter().enumerate() {
                    let key = DeclKey::Expr(name.raw());
                    let ty = match self.em.out.decl_types.get(&key) {
                        Some(&ty) => ty,
                        None => continue, // blank
                    };
                    match values.get(i) {
                        Some(&v) => {
                            let src_ty = self.ty_of(v);
                            let bank = self.bank_of(src_ty);
                            let r = self.emit_expr(v, None)?;
                            self.store_local(key, ty, bank, r, src_ty, pos)?;
                        }
                        None => {
                            let bank = self.bank_of(ty);
                            let tmp = self.alloc(bank)?;
                            self.emit_zero(ty, tmp, pos)?;
                            self.store_local(key, ty, bank, tmp, ty, pos)?;
                        }
                    }
                }
                Ok(())
            }
            Stmt::Const { .. } | Stmt::TypeDecl { .. } => Ok(()),
            Stmt::FuncDecl { .. } => Ok(()), // compiled from the global table
            Stmt::If { init, cond, then, els } => {
                if let Some(init) = init {
                    self.emit_stmt(init)?;
                }
                let goto_false = self.emit_cond(cond)?;
                self.emit_stmt(then)?;
                match els {
                    Some(els) => {
                        let goto_end = self.pc() as usize;
                        self.push(Instr::jump(Op::Goto, 0), pos);
                        let else_pc = self.pc();
                        self.f.body[goto_false] = Instr::jump(Op::Goto, else_pc);
                        self.emit_stmt(els)?;
                        let end = self.pc();
                        self.f.body[goto_end] = Instr::jump(Op::Goto, end);
                    }
                    None => {
                        let end = self.pc();
                        self.f.body[goto_false] = Instr::jump(Op::Goto, end);
                    }
                }
                Ok(())
            }
            Stmt::For { init, cond, post, body } => {
                if let Some(init) = init {
                    self.emit_stmt(init)?;
                    self.free_temps();
                }
                let cond_pc = self.pc();
                let goto_false = match cond {
                    Some(c) => Some(self.emit_cond(c)?),
                    None => None,
                };
                let label = self.take_label();
                self.loops.push(LoopCtx {
                    label,
                    break_fixups: Vec::new(),
                    continue_fixups: Vec::new(),
                    range_depth: self.range_depth,
                    is_range: false,
                    is_loop: true,
                });
                self.emit_stmt(body)?;
                let post_pc = self.pc();
                if let Some(post) = post {
                    self.emit_stmt(post)?;
                    self.free_temps();
                }
                self.push(Instr::jump(Op::Goto, cond_pc), pos);
                let end = self.pc();
                if let Some(g) = goto_false {
                    self.f.body[g] = Instr::jump(Op::Goto, end);
                }
                let ctx = self.loops.pop().expect("loop context");
                for pc in ctx.break_fixups {
                    self.f.body[pc] = Instr::jump(Op::Goto, end);
                }
                for pc in ctx.continue_fixups {
                    self.f.body[pc] = Instr::jump(Op::Goto, post_pc);
                }
                Ok(())
            }
            Stmt::ForRange { key, value, expr, body, .. } => {
                self.emit_for_range(s, key, value, expr, body)
            }
            Stmt::Switch { init, expr, cases } => self.emit_switch(s, init, expr, cases),
            Stmt::TypeSwitch { init, subject, cases, .. } => {
                self.emit_type_switch(s, init, subject, cases)
            }
            Stmt::Select { cases } => self.emit_select(s, cases),
            Stmt::Return { values } => self.emit_return(s, values),
            Stmt::Break { label } => {
                let (idx, pops) = self.find_loop_or_switch(label.map(|l| {
                    self.em.ast.name(l).to_string()
                }))?;
                for _ in 0..pops {
                    self.push(Instr::new(Op::RangePop, 0, 0, 0), pos);
                }
                let pc = self.pc() as usize;
                self.push(Instr::jump(Op::Goto, 0), pos);
                self.loops[idx].break_fixups.push(pc);
                Ok(())
            }
            Stmt::Continue { label } => {
                let (idx, pops) = self.find_loop(label.map(|l| self.em.ast.name(l).to_string()))?;
                for _ in 0..pops {
                    self.push(Instr::new(Op::RangePop, 0, 0, 0), pos);
                }
                let pc = self.pc() as usize;
                self.push(Instr::jump(Op::Goto, 0), pos);
                self.loops[idx].continue_fixups.push(pc);
                Ok(())
            }
            Stmt::Goto { label } => {
                let name = ast.name(label).to_string();
                let pc = self.pc() as usize;
                self.push(Instr::jump(Op::Goto, 0), pos);
                match self.labels.get(&name) {
                    Some(&target) => self.f.body[pc] = Instr::jump(Op::Goto, target),
                    None => self.gotos.push((pc, name, pos)),
                }
                Ok(())
            }
            Stmt::Labeled { label, stmt } => {
                let name = ast.name(label).to_string();
                self.labels.insert(name.clone(), self.pc());
                self.pending_label = Some(name);
                let r = self.emit_stmt(stmt);
                self.pending_label = None;
                r
            }
            Stmt::Fallthrough => Ok(()), // handled by the switch emitter
            Stmt::Defer(e) | Stmt::Go(e) => {
                let is_go = matches!(ast.stmts[s], Stmt::Go(_));
                let (func, args) = match ast.exprs[e] {
                    Expr::Call { func, args, .. } => (func, args),
                    _ => unreachable!("checked"),
                };
                // The callee and every argument are boxed in consecutive
                // general registers, evaluated at this point.
                let fty = self.ty_of(func);
                let f = self.emit_boxed(func, fty)?;
                let arg_list = ast.exprs_of(args).to_vec();
                let mut boxed = vec![f];
                for &a in &arg_list {
                    let aty = self.ty_of(a);
                    boxed.push(self.emit_boxed(a, aty)?);
                }
                let first = self.alloc(Bank::Gen)?;
                for _ in 1..boxed.len() {
                    self.alloc(Bank::Gen)?;
                }
                for (i, &r) in boxed.iter().enumerate() {
                    let d = first + i as i8;
                    if r != d {
                        self.push(Instr::new(Op::MoveGeneral, 0, r, d), pos);
                    }
                }
                let op = if is_go { Op::Spawn } else { Op::Defer };
                self.push(Instr::new(op, arg_list.len() as i8, first, 0), pos);
                Ok(())
            }
            Stmt::Block { stmts } => {
                for &inner in &ast.stmts_of(stmts).to_vec() {
                    self.emit_stmt(inner)?;
                    self.free_temps();
                }
                Ok(())
            }
            Stmt::Text(sym) => {
                let text = ast.name(sym).to_string();
                if text.is_empty() {
                    return Ok(());
                }
                let k = self.const_string(&text)?;
                self.push(Instr::new(Op::Text, 0, k, 0), pos);
                Ok(())
            }
            Stmt::Show { exprs, ctx } => {
                for &e in &ast.exprs_of(exprs).to_vec() {
                    // A macro invocation shown as a value renders itself.
                    if let Expr::Call { func, args, ellipsis } = ast.exprs[e] {
                        let fty = self.ty_of(func);
                        if matches!(
                            self.em.reg.get(self.em.reg.underlying(fty)),
                            Type::Macro(_)
                        ) {
                            self.emit_call(e, func, args, ellipsis)?;
                            continue;
                        }
                    }
                    let ty = self.ty_of(e);
                    let r = self.emit_expr(e, None)?;
                    let ti = self.type_idx(ty)?;
                    self.push(
                        Instr::new(Op::Show, r, ti, crate::code::context_code(ctx)),
                        pos,
                    );
                }
                Ok(())
            }
            Stmt::ShowMacro { call, ctx } => {
                match ast.exprs[call] {
                    Expr::Call { func, args, ellipsis } => {
                        let fty = self.ty_of(func);
                        if matches!(
                            self.em.reg.get(self.em.reg.underlying(fty)),
                            Type::Macro(_)
                        ) {
                            self.emit_call(call, func, args, ellipsis)?;
                            Ok(())
                        } else {
                            // An ordinary call: show the result.
                            let ty = self.ty_of(call);
                            let r = self.emit_expr(call, None)?;
                            let ti = self.type_idx(ty)?;
                            self.push(
                                Instr::new(Op::Show, r, ti, crate::code::context_code(ctx)),
                                pos,
                            );
                            Ok(())
                        }
                    }
                    _ => {
                        let ty = self.ty_of(call);
                        let r = self.emit_expr(call, None)?;
                        let ti = self.type_idx(ty)?;
                        self.push(
                            Instr::new(Op::Show, r, ti, crate::code::context_code(ctx)),
                            pos,
                        );
                        Ok(())
                    }
                }
            }
            Stmt::MacroDecl { .. } => {
                // A local macro is a closure value bound to its slot. A
                // recursive macro captures its own cell, so the cell must
                // exist before the closure is built.
                let key = DeclKey::Stmt(s.raw());
                let ty = self.em.out.decl_types[&key];
                let cell = match self.locals.get(&key).copied() {
                    Some(super::Loc::Cell(cell)) => {
                        let ti = self.type_idx(ty)?;
                        self.push(Instr::new(Op::New, ti, 0, cell), pos);
                        Some(cell)
                    }
                    _ => None,
                };
                let sub = self.emit_local_macro(s, ty)?;
                let fi = self.add_subfunction(sub)?;
                let d = self.alloc(Bank::Gen)?;
                self.push(Instr::new(Op::Func, 0, fi, d), pos);
                match cell {
                    Some(cell) => {
                        self.push(
                            Instr::new(Op::StorePtr, d, cell, Bank::Gen as u8 as i8),
                            pos,
                        );
                    }
                    None => self.store_local(key, ty, Bank::Gen, d, ty, pos)?,
                }
                Ok(())
            }
            Stmt::Include { tree, .. } => {
                for &inner in &ast.stmts_of(ast.tree(tree).nodes).to_vec() {
                    self.emit_stmt(inner)?;
                    self.free_temps();
                }
                Ok(())
            }
            Stmt::Import { .. } | Stmt::Extends { .. } | Stmt::Comment(_) => Ok(()),
            Stmt::Url { is_set, stmts } => {
                self.push(Instr::new(Op::UrlStart, is_set as i8, 0, 0), pos);
                for &inner in &ast.stmts_of(stmts).to_vec() {
                    self.emit_stmt(inner)?;
                    self.free_temps();
                }
                self.push(Instr::new(Op::UrlEnd, 0, 0, 0), pos);
                Ok(())
            }
        }
    }

    fn emit_expr_discard(&mut self, e: ExprId) -> SResult {
        match self.em.ast.exprs[e] {
            Expr::Call { func, args, ellipsis } => {
                self.emit_call(e, func, args, ellipsis)?;
                Ok(())
            }
            _ => {
                self.emit_expr(e, None)?;
                Ok(())
            }
        }
    }

    /// Emits a boolean condition and an unpatched jump taken when it is
    /// false; returns the jump's pc.
    fn emit_cond(&mut self, cond: ExprId) -> Result<usize, BuildError> {
        let pos = self.em.ast.exprs.pos(cond);
        let r = self.emit_expr(cond, None)?;
        let k0 = self.const_int(0)?;
        // True skips the following Goto.
        self.push(Instr::with_k(Op::IfInt, r, Cond::NotEq as u8 as i8, k0), pos);
        let pc = self.pc() as usize;
        self.push(Instr::jump(Op::Goto, 0), pos);
        self.free_temps();
        Ok(pc)
    }

    fn take_label(&mut self) -> Option<String> {
        self.pending_label.take()
    }

    /// Finds the `continue` target: the innermost (or labeled) loop.
    /// Returns its index and the number of range iterators to pop.
    fn find_loop(&self, label: Option<String>) -> Result<(usize, u32), BuildError> {
        for i in (0..self.loops.len()).rev() {
            let l = &self.loops[i];
            if l.is_loop && (label.is_none() || l.label == label) {
                // Iterators opened inside the loop body are popped; the
                // loop's own iterator stays open for the next step.
                let pops = self.range_depth - l.range_depth;
                return Ok((i, pops));
            }
        }
        Err(self.err(Position::default(), "continue is not in a loop"))
    }

    /// Finds the `break` target: the innermost (or labeled) loop, switch
    /// or select.
    fn find_loop_or_switch(&self, label: Option<String>) -> Result<(usize, u32), BuildError> {
        for i in (0..self.loops.len()).rev() {
            let l = &self.loops[i];
            if label.is_none() || l.label == label {
                // Breaking out of a range loop also closes its iterator.
                let mut pops = self.range_depth - l.range_depth;
                if l.is_range {
                    pops += 1;
                }
                return Ok((i, pops));
            }
        }
        Err(self.err(Position::default(), "break is not in a loop, switch or select"))
    }

    // ---------------------------------------------------------------------
    // Assignment
    // ---------------------------------------------------------------------

    fn prepare_target(&mut self, e: ExprId) -> Result<Target, BuildError> {
        let ast = self.em.ast;
        let pos = ast.exprs.pos(e);
        if let Expr::Ident(sym) = ast.exprs[e] {
            if ast.name(sym) == "_" {
                return Ok(Target::Blank);
            }
        }
        match ast.exprs[e] {
            Expr::Ident(_) => match self.em.out.binding(e) {
                Some(Binding::Local(key)) => {
                    let want = self.bank_of(self.ty_of(e));
                    match self.locals.get(&key).copied() {
                        Some(Loc::Reg(bank, r)) => Ok(Target::Reg(bank, r)),
                        Some(Loc::Cell(cell)) => Ok(Target::Cell(cell, want)),
                        Some(Loc::CVar(idx)) => {
                            let cell = self.alloc(Bank::Gen)?;
                            self.push(Instr::new(Op::GetCVar, 0, idx as i8, cell), pos);
                            Ok(Target::Cell(cell, want))
                        }
                        None => match self.cvars.get(&key).copied() {
                            Some(idx) => {
                                let cell = self.alloc(Bank::Gen)?;
                                self.push(Instr::new(Op::GetCVar, 0, idx as i8, cell), pos);
                                Ok(Target::Cell(cell, want))
                            }
                            None => Err(self.err(pos, "unresolved assignment target")),
                        },
                    }
                }
                Some(Binding::Global(idx)) => {
                    let ty = self.ty_of(e);
                    Ok(Target::Global(idx, self.bank_of(ty)))
                }
                _ => Err(self.err(pos, "invalid assignment target")),
            },
            Expr::Index { expr, index } => {
                let base_ty = self.ty_of(expr);
                let reg = self.em.reg;
                match reg.get(reg.underlying(base_ty)).clone() {
                    Type::Map(_, val_ty) => {
                        let m = self.emit_expr(expr, None)?;
                        let kty = self.ty_of(index);
                        let key = self.emit_boxed(index, kty)?;
                        Ok(Target::MapElem { map: m, key, val_ty })
                    }
                    Type::Slice(elem_ty) | Type::Array(_, elem_ty) => {
                        let sl = self.emit_expr(expr, None)?;
                        let (ik, i) = self.operand_rk_int_pub(index)?;
                        Ok(Target::SliceElem { slice: sl, index: (ik, i), elem_ty })
                    }
                    Type::Ptr(inner) => {
                        let elem_ty = match reg.get(reg.underlying(inner)) {
                            Type::Array(_, e) => *e,
                            _ => inner,
                        };
                        let cell = self.emit_expr(expr, None)?;
                        let arr = self.alloc(Bank::Gen)?;
                        self.push(
                            Instr::new(Op::LoadPtr, cell, Bank::Gen as u8 as i8, arr),
                            pos,
                        );
                        let (ik, i) = self.operand_rk_int_pub(index)?;
                        Ok(Target::SliceElem { slice: arr, index: (ik, i), elem_ty })
                    }
                    _ => Err(self.err(pos, "invalid index assignment target")),
                }
            }
            Expr::Selector { expr, sel } => {
                let reg = self.em.reg;
                let name = ast.name(sel).to_string();
                let mut base_ty = self.ty_of(expr);
                let mut st = self.emit_expr(expr, None)?;
                if let Type::Ptr(inner) = reg.get(reg.underlying(base_ty)) {
                    let inner = *inner;
                    let v = self.alloc(Bank::Gen)?;
                    self.push(Instr::new(Op::LoadPtr, st, Bank::Gen as u8 as i8, v), pos);
                    st = v;
                    base_ty = inner;
                }
                let (path, fty) = reg
                    .lookup_field(base_ty, &name)
                    .ok_or_else(|| self.err(pos, format!("unknown field {name}")))?;
                // Walk to the innermost struct holding the field.
                let mut cur = st;
                for &idx in &path[..path.len() - 1] {
                    let d = self.alloc(Bank::Gen)?;
                    self.push(Instr::new(Op::Field, cur, idx as u8 as i8, d), pos);
                    cur = d;
                }
                Ok(Target::Field { st: cur, idx: *path.last().expect("path") as u8, fty })
            }
            Expr::Unary { op: UnOp::Deref, expr } => {
                let ty = self.ty_of(e);
                let cell = self.emit_expr(expr, None)?;
                Ok(Target::Deref { cell, ty })
            }
            _ => Err(self.err(pos, "cannot assign to this expression")),
        }
    }

    pub(crate) fn operand_rk_int_pub(&mut self, e: ExprId) -> Result<(bool, i8), BuildError> {
        let info = self.em.out.info(e).clone();
        if let Some(c) = &info.constant {
            let v = c.to_i64().unwrap_or(0);
            let k = self.const_int(v)?;
            return Ok((true, k));
        }
        let r = self.emit_expr(e, None)?;
        Ok((false, r))
    }

    fn load_target(&mut self, t: &Target, ty: TypeId, pos: Position) -> Result<i8, BuildError> {
        let bank = self.bank_of(ty);
        match t {
            Target::Reg(b, r) => {
                debug_assert_eq!(*b, bank);
                // Compound assignment mutates in place through a copy.
                let d = self.alloc(bank)?;
                let op = match bank {
                    Bank::Int => Op::MoveInt,
                    Bank::Float => Op::MoveFloat,
                    Bank::Str => Op::MoveString,
                    Bank::Gen => Op::MoveGeneral,
                };
                self.push(Instr::new(op, 0, *r, d), pos);
                Ok(d)
            }
            Target::Cell(cell, _) => {
                let d = self.alloc(bank)?;
                self.push(Instr::new(Op::LoadPtr, *cell, bank as u8 as i8, d), pos);
                Ok(d)
            }
            Target::Global(idx, _) => {
                let d = self.alloc(bank)?;
                self.push(
                    Instr::new(Op::GetVar, bank as u8 as i8, *idx as u8 as i8, d),
                    pos,
                );
                Ok(d)
            }
            Target::SliceElem { slice, index, .. } => {
                let d = self.alloc(bank)?;
                let i = if index.0 {
                    Instr::with_k(Op::SliceIndex, *slice, index.1, d)
                } else {
                    Instr::new(Op::SliceIndex, *slice, index.1, d)
                };
                self.push(i, pos);
                Ok(d)
            }
            Target::MapElem { map, key, val_ty } => {
                let d = self.alloc(bank)?;
                self.emit_zero(*val_ty, d, pos)?;
                self.push(Instr::new(Op::MapIndex, *map, *key, d), pos);
                Ok(d)
            }
            Target::Field { st, idx, .. } => {
                let d = self.alloc(bank)?;
                self.push(Instr::new(Op::Field, *st, *idx as i8, d), pos);
                Ok(d)
            }
            Target::Deref { cell, .. } => {
                let d = self.alloc(bank)?;
                self.push(Instr::new(Op::LoadPtr, *cell, bank as u8 as i8, d), pos);
                Ok(d)
            }
            Target::Blank => Err(self.err(pos, "cannot read blank target")),
        }
    }

    fn store_target(
        &mut self,
        t: &Target,
        bank: Bank,
        src: i8,
        src_ty: TypeId,
        pos: Position,
    ) -> SResult {
        // Coerce into the bank the destination lives in.
        let want = match t {
            Target::Reg(b, _) | Target::Cell(_, b) | Target::Global(_, b) => Some(*b),
            Target::Deref { ty, .. } => Some(self.bank_of(*ty)),
            _ => None,
        };
        let (bank, src) = match want {
            Some(w) if w != bank => (w, self.coerce_reg(bank, src, src_ty, w, pos)?),
            _ => (bank, src),
        };
        match t {
            Target::Blank => Ok(()),
            Target::Reg(b, r) => {
                let op = match b {
                    Bank::Int => Op::MoveInt,
                    Bank::Float => Op::MoveFloat,
                    Bank::Str => Op::MoveString,
                    Bank::Gen => Op::MoveGeneral,
                };
                if src != *r {
                    self.push(Instr::new(op, 0, src, *r), pos);
                }
                Ok(())
            }
            Target::Cell(cell, _) => {
                self.push(Instr::new(Op::StorePtr, src, *cell, bank as u8 as i8), pos);
                Ok(())
            }
            Target::Global(idx, b) => {
                self.push(
                    Instr::new(Op::SetVar, src, *idx as u8 as i8, *b as u8 as i8),
                    pos,
                );
                Ok(())
            }
            Target::SliceElem { slice, index, elem_ty } => {
                let v = self.box_reg(bank, src, src_ty, *elem_ty, pos)?;
                let i = if index.0 {
                    Instr::with_k(Op::SetSlice, v, *slice, index.1)
                } else {
                    Instr::new(Op::SetSlice, v, *slice, index.1)
                };
                self.push(i, pos);
                Ok(())
            }
            Target::MapElem { map, key, val_ty } => {
                let v = self.box_reg(bank, src, src_ty, *val_ty, pos)?;
                self.push(Instr::new(Op::SetMap, v, *map, *key), pos);
                Ok(())
            }
            Target::Field { st, idx, fty } => {
                let v = self.box_reg(bank, src, src_ty, *fty, pos)?;
                self.push(Instr::new(Op::SetField, v, *st, *idx as i8), pos);
                Ok(())
            }
            Target::Deref { cell, .. } => {
                self.push(Instr::new(Op::StorePtr, src, *cell, bank as u8 as i8), pos);
                Ok(())
            }
        }
    }

    /// Stores a freshly produced value into a local declaration slot,
    /// creating the reference cell of indirect locals.
    pub(crate) fn store_local(
        &mut self,
        key: DeclKey,
        ty: TypeId,
        bank: Bank,
        src: i8,
        src_ty: TypeId,
        pos: Position,
    ) -> SResult {
        let want = self.bank_of(ty);
        let (bank, src) = if want != bank {
            (want, self.coerce_reg(bank, src, src_ty, want, pos)?)
        } else {
            (bank, src)
        };
        match self.locals.get(&key).copied() {
            Some(Loc::Reg(b, r)) => {
                let op = match b {
                    Bank::Int => Op::MoveInt,
                    Bank::Float => Op::MoveFloat,
                    Bank::Str => Op::MoveString,
                    Bank::Gen => Op::MoveGeneral,
                };
                if src != r || b != bank {
                    self.push(Instr::new(op, 0, src, r), pos);
                }
                Ok(())
            }
            Some(Loc::Cell(cell)) => {
                // Fresh cell per declaration.
                let ti = self.type_idx(ty)?;
                self.push(Instr::new(Op::New, ti, 0, cell), pos);
                self.push(Instr::new(Op::StorePtr, src, cell, bank as u8 as i8), pos);
                Ok(())
            }
            Some(Loc::CVar(_)) | None => Err(self.err(pos, "unresolved local declaration")),
        }
    }

    fn emit_assign(&mut self, s: StmtId, lhs: ListRef, rhs: ListRef, op: AssignOp) -> SResult {
        let ast = self.em.ast;
        let pos = self.spos(s);
        let lhs = ast.exprs_of(lhs).to_vec();
        let rhs = ast.exprs_of(rhs).to_vec();

        // Compound assignment.
        if !matches!(op, AssignOp::Assign | AssignOp::Define) {
            let ty = self.ty_of(lhs[0]);
            let target = self.prepare_target(lhs[0])?;
            let cur = self.load_target(&target, ty, pos)?;
            let bank = self.bank_of(ty);
            let opcode = match (op, bank) {
                (AssignOp::Add, Bank::Str) => Op::Concat,
                (AssignOp::Add, Bank::Float) => Op::AddFloat,
                (AssignOp::Add, _) => Op::AddInt,
                (AssignOp::Sub, Bank::Float) => Op::SubFloat,
                (AssignOp::Sub, _) => Op::SubInt,
                (AssignOp::Mul, Bank::Float) => Op::MulFloat,
                (AssignOp::Mul, _) => Op::MulInt,
                (AssignOp::Div, Bank::Float) => Op::DivFloat,
                (AssignOp::Div, _) => {
                    if self.em.reg.is_unsigned(ty) {
                        Op::DivUint
                    } else {
                        Op::DivInt
                    }
                }
                (AssignOp::Rem, _) => {
                    if self.em.reg.is_unsigned(ty) {
                        Op::RemUint
                    } else {
                        Op::RemInt
                    }
                }
                (AssignOp::And, _) => Op::And,
                (AssignOp::Or, _) => Op::Or,
                (AssignOp::Xor, _) => Op::Xor,
                (AssignOp::AndNot, _) => Op::AndNot,
                (AssignOp::Shl, _) => Op::Shl,
                (AssignOp::Shr, _) => {
                    if self.em.reg.is_unsigned(ty) {
                        Op::ShrUint
                    } else {
                        Op::ShrInt
                    }
                }
                _ => unreachable!(),
            };
            let v = self.emit_expr(rhs[0], None)?;
            self.push(Instr::new(opcode, cur, v, cur), pos);
            if bank == Bank::Int {
                self.emit_wrap(ty, cur, pos)?;
            }
            return self.store_target(&target, bank, cur, ty, pos);
        }

        // Comma-ok and multi-value right sides.
        if rhs.len() == 1 && lhs.len() > 1 {
            return self.emit_multi_assign(s, &lhs, rhs[0], op);
        }

        // Parallel assignment: evaluate every right side first.
        let mut tmps = Vec::new();
        for &v in &rhs {
            let ty = self.ty_of(v);
            let bank = self.bank_of(ty);
            let r = self.emit_expr(v, None)?;
            // Copy into a fresh temporary so later stores cannot clobber
            // sources.
            let d = self.alloc(bank)?;
            let mv = match bank {
                Bank::Int => Op::MoveInt,
                Bank::Float => Op::MoveFloat,
                Bank::Str => Op::MoveString,
                Bank::Gen => Op::MoveGeneral,
            };
            self.push(Instr::new(mv, 0, r, d), pos);
            tmps.push((bank, d, ty));
        }
        for (&target_e, (bank, r, ty)) in lhs.iter().zip(tmps) {
            if op == AssignOp::Define {
                let key = DeclKey::Expr(target_e.raw());
                if let Some(&dty) = self.em.out.decl_types.get(&key) {
                    self.store_local(key, dty, bank, r, ty, pos)?;
                    continue;
                }
            }
            let t = self.prepare_target(target_e)?;
            self.store_target(&t, bank, r, ty, pos)?;
        }
        Ok(())
    }

    /// `a, b := rhs` with a single multi-valued right side.
    fn emit_multi_assign(
        &mut self,
        s: StmtId,
        lhs: &[ExprId],
        rhs: ExprId,
        op: AssignOp,
    ) -> SResult {
        let ast = self.em.ast;
        let pos = self.spos(s);
        let rinfo = self.em.out.info(rhs).clone();

        let mut produced: Vec<(Bank, i8, TypeId)> = Vec::new();
        if let Type::Tuple(elems) = self.em.reg.get(rinfo.ty).clone() {
            let results = self.emit_call_results(rhs)?;
            for ((bank, r), ty) in results.into_iter().zip(elems) {
                produced.push((bank, r, ty));
            }
        } else {
            // Comma-ok forms.
            let vty = rinfo.ty;
            let vbank = self.bank_of(vty);
            match ast.exprs[rhs] {
                Expr::Index { expr, index } => {
                    let m = self.emit_expr(expr, None)?;
                    let kty = self.ty_of(index);
                    let key = self.emit_boxed(index, kty)?;
                    let d = self.alloc(vbank)?;
                    self.emit_zero(vty, d, pos)?;
                    self.push(Instr::new(Op::MapIndex, m, key, d), pos);
                    let ok = self.alloc(Bank::Int)?;
                    self.push(Instr::new(Op::Ok, 0, 0, ok), pos);
                    produced.push((vbank, d, vty));
                    produced.push((Bank::Int, ok, crate::types::BOOL));
                }
                Expr::TypeAssert { expr, ty } => {
                    let target = ty.map(|t| self.em.out.denoted(t)).unwrap_or(vty);
                    let src = self.emit_expr(expr, None)?;
                    let d = self.alloc(self.bank_of(target))?;
                    let ti = self.type_idx(target)?;
                    self.push(Instr::new(Op::Assert, src, ti, d), pos);
                    let ok = self.alloc(Bank::Int)?;
                    self.push(Instr::new(Op::Ok, 0, 0, ok), pos);
                    produced.push((self.bank_of(target), d, target));
                    produced.push((Bank::Int, ok, crate::types::BOOL));
                }
                Expr::Unary { op: UnOp::Recv, expr } => {
                    let ch = self.emit_expr(expr, None)?;
                    let tmp = self.alloc(Bank::Gen)?;
                    self.push(Instr::new(Op::Receive, ch, 0, tmp), pos);
                    let ok = self.alloc(Bank::Int)?;
                    self.push(Instr::new(Op::Ok, 0, 0, ok), pos);
                    let d = self.unbox_reg(vbank, tmp, None, pos)?;
                    produced.push((vbank, d, vty));
                    produced.push((Bank::Int, ok, crate::types::BOOL));
                }
                _ => return Err(self.err(pos, "unsupported multi-value assignment")),
            }
        }
        for (&target_e, (bank, r, ty)) in lhs.iter().zip(produced) {
            if op == AssignOp::Define {
                let key = DeclKey::Expr(target_e.raw());
                if let Some(&dty) = self.em.out.decl_types.get(&key) {
                    self.store_local(key, dty, bank, r, ty, pos)?;
                    continue;
                }
            }
            if matches!(ast.exprs[target_e], Expr::Ident(sym) if ast.name(sym) == "_") {
                continue;
            }
            let t = self.prepare_target(target_e)?;
            self.store_target(&t, bank, r, ty, pos)?;
        }
        Ok(())
    }

    /// Emits a call expression for its results.
    fn emit_call_results(&mut self, e: ExprId) -> Result<Vec<(Bank, i8)>, BuildError> {
        match self.em.ast.exprs[e] {
            Expr::Call { func, args, ellipsis } => self.emit_call(e, func, args, ellipsis),
            _ => {
                let ty = self.ty_of(e);
                let bank = self.bank_of(ty);
                let r = self.emit_expr(e, None)?;
                Ok(vec![(bank, r)])
            }
        }
    }

    // ---------------------------------------------------------------------
    // Loops and switches
    // ---------------------------------------------------------------------

    fn emit_for_range(
        &mut self,
        s: StmtId,
        key: Option<ExprId>,
        value: Option<ExprId>,
        expr: ExprId,
        body: StmtId,
    ) -> SResult {
        let pos = self.spos(s);
        let ety = self.ty_of(expr);
        let is_string = self.em.reg.is_string(ety);
        let container = self.emit_expr(expr, None)?;
        let variant = if is_string { 1 } else { 0 };
        self.push(Instr::new(Op::RangeNew, 0, variant, container), pos);
        self.range_depth += 1;

        // Destinations: registers of the loop variables, or temporaries
        // for cells.
        let mut key_reg = 0i8;
        let mut key_cell: Option<(DeclKey, TypeId)> = None;
        if let Some(k) = key {
            let dk = DeclKey::Expr(k.raw());
            match self.em.out.decl_types.get(&dk).copied() {
                Some(ty) => match self.locals.get(&dk).copied() {
                    Some(Loc::Reg(_, r)) => key_reg = r,
                    _ => {
                        key_reg = self.alloc(self.bank_of(ty))?;
                        key_cell = Some((dk, ty));
                    }
                },
                None => {
                    // Assignment to an existing variable or blank.
                    if !matches!(self.em.ast.exprs[k], Expr::Ident(sym) if self.em.ast.name(sym) == "_")
                    {
                        let ty = self.ty_of(k);
                        key_reg = self.alloc(self.bank_of(ty))?;
                        key_cell = Some((DeclKey::Expr(k.raw()), ty));
                    }
                }
            }
        }
        let mut val_reg = 0i8;
        let mut val_cell: Option<(DeclKey, TypeId)> = None;
        if let Some(v) = value {
            let dk = DeclKey::Expr(v.raw());
            match self.em.out.decl_types.get(&dk).copied() {
                Some(ty) => match self.locals.get(&dk).copied() {
                    Some(Loc::Reg(_, r)) => val_reg = r,
                    _ => {
                        val_reg = self.alloc(self.bank_of(ty))?;
                        val_cell = Some((dk, ty));
                    }
                },
                None => {
                    if !matches!(self.em.ast.exprs[v], Expr::Ident(sym) if self.em.ast.name(sym) == "_")
                    {
                        let ty = self.ty_of(v);
                        val_reg = self.alloc(self.bank_of(ty))?;
                        val_cell = Some((DeclKey::Expr(v.raw()), ty));
                    }
                }
            }
        }

        let next_pc = self.pc();
        self.push(Instr::new(Op::RangeNext, key_reg, val_reg, 0), pos);
        let exit_word = self.pc() as usize;
        self.push(Instr::word(0, 0, 0), pos);

        // Propagate values received in temporaries into their storage.
        for (cell, reg, target_expr) in [(key_cell, key_reg, key), (val_cell, val_reg, value)] {
            let (dk, ty) = match cell {
                Some(pair) => pair,
                None => continue,
            };
            let bank = self.bank_of(ty);
            if self.em.out.decl_types.contains_key(&dk) {
                self.store_local(dk, ty, bank, reg, ty, pos)?;
            } else if let Some(t) = target_expr {
                let tgt = self.prepare_target(t)?;
                self.store_target(&tgt, bank, reg, ty, pos)?;
            }
        }

        let label = self.take_label();
        self.loops.push(LoopCtx {
            label,
            break_fixups: Vec::new(),
            continue_fixups: Vec::new(),
            range_depth: self.range_depth,
            is_range: true,
            is_loop: true,
        });
        self.emit_stmt(body)?;
        self.push(Instr::jump(Op::Goto, next_pc), pos);
        let end = self.pc();
        self.f.body[exit_word] = Instr::jump(Op::Goto, end);
        self.range_depth -= 1;
        let ctx = self.loops.pop().expect("loop context");
        for pc in ctx.break_fixups {
            self.f.body[pc] = Instr::jump(Op::Goto, end);
        }
        for pc in ctx.continue_fixups {
            self.f.body[pc] = Instr::jump(Op::Goto, next_pc);
        }
        Ok(())
    }

    fn emit_switch(
        &mut self,
        s: StmtId,
        init: Option<StmtId>,
        expr: Option<ExprId>,
        cases: ListRef,
    ) -> SResult {
        let ast = self.em.ast;
        let pos = self.spos(s);
        if let Some(init) = init {
            self.emit_stmt(init)?;
        }
        let subject = match expr {
            Some(e) => {
                let ty = self.ty_of(e);
                let bank = self.bank_of(ty);
                let r = self.emit_expr(e, None)?;
                // Keep the subject alive across case tests.
                let d = self.alloc(bank)?;
                let mv = match bank {
                    Bank::Int => Op::MoveInt,
                    Bank::Float => Op::MoveFloat,
                    Bank::Str => Op::MoveString,
                    Bank::Gen => Op::MoveGeneral,
                };
                self.push(Instr::new(mv, 0, r, d), pos);
                Some((d, ty, bank))
            }
            None => None,
        };

        let case_ids = ast.cases_of(cases).to_vec();
        let mut body_fixups: Vec<(usize, usize)> = Vec::new(); // (goto pc, case idx)
        let mut default_case: Option<usize> = None;
        for (ci, &c) in case_ids.iter().enumerate() {
            let case = ast.cases[c];
            if case.exprs.is_empty() {
                default_case = Some(ci);
                continue;
            }
            for &ce in &ast.exprs_of(case.exprs).to_vec() {
                match subject {
                    Some((sreg, sty, bank)) => {
                        let cpos = ast.exprs.pos(ce);
                        match bank {
                            Bank::Int => {
                                let (ck, cr) = self.operand_rk_int_pub(ce)?;
                                let opc =
                                    if self.em.reg.is_unsigned(sty) { Op::IfUint } else { Op::IfInt };
                                let i = if ck {
                                    Instr::with_k(opc, sreg, Cond::Eq as u8 as i8, cr)
                                } else {
                                    Instr::new(opc, sreg, Cond::Eq as u8 as i8, cr)
                                };
                                self.push(i, cpos);
                            }
                            Bank::Float => {
                                let cr = self.emit_expr(ce, None)?;
                                self.push(
                                    Instr::new(Op::IfFloat, sreg, Cond::Eq as u8 as i8, cr),
                                    cpos,
                                );
                            }
                            Bank::Str => {
                                let cr = self.emit_expr(ce, None)?;
                                self.push(
                                    Instr::new(Op::IfString, sreg, Cond::Eq as u8 as i8, cr),
                                    cpos,
                                );
                            }
                            Bank::Gen => {
                                let cty = self.ty_of(ce);
                                let cr = self.emit_boxed(ce, cty)?;
                                self.push(
                                    Instr::new(Op::If, sreg, Cond::Eq as u8 as i8, cr),
                                    cpos,
                                );
                            }
                        }
                    }
                    None => {
                        // Expressionless switch: case is a condition.
                        let cr = self.emit_expr(ce, None)?;
                        let k0 = self.const_int(0)?;
                        self.push(
                            Instr::with_k(Op::IfInt, cr, Cond::NotEq as u8 as i8, k0),
                            ast.exprs.pos(ce),
                        );
                    }
                }
                // Match skips the "try next" jump and lands on the goto
                // into the body.
                let skip_pc = self.pc() as usize;
                self.push(Instr::jump(Op::Goto, 0), pos);
                let goto_body = self.pc() as usize;
                self.push(Instr::jump(Op::Goto, 0), pos);
                body_fixups.push((goto_body, ci));
                let after = self.pc();
                self.f.body[skip_pc] = Instr::jump(Op::Goto, after);
            }
        }
        // No case matched.
        let no_match_pc = self.pc() as usize;
        self.push(Instr::jump(Op::Goto, 0), pos);
        if let Some(dc) = default_case {
            body_fixups.push((no_match_pc, dc));
        }

        let label = self.take_label();
        self.loops.push(LoopCtx {
            label,
            break_fixups: Vec::new(),
            continue_fixups: Vec::new(),
            range_depth: self.range_depth,
            is_range: false,
            is_loop: false,
        });
        let mut body_starts = vec![0u32; case_ids.len()];
        let mut end_fixups = Vec::new();
        for (ci, &c) in case_ids.iter().enumerate() {
            body_starts[ci] = self.pc();
            let body = ast.stmts_of(ast.cases[c].body).to_vec();
            let falls = body
                .last()
                .map(|&b| matches!(ast.stmts[b], Stmt::Fallthrough))
                .unwrap_or(false);
            for &b in &body {
                self.emit_stmt(b)?;
                self.free_temps();
            }
            if !falls {
                let pc = self.pc() as usize;
                self.push(Instr::jump(Op::Goto, 0), pos);
                end_fixups.push(pc);
            }
        }
        let end = self.pc();
        for (pc, ci) in body_fixups {
            self.f.body[pc] = Instr::jump(Op::Goto, body_starts[ci]);
        }
        if default_case.is_none() {
            self.f.body[no_match_pc] = Instr::jump(Op::Goto, end);
        }
        for pc in end_fixups {
            self.f.body[pc] = Instr::jump(Op::Goto, end);
        }
        let ctx = self.loops.pop().expect("switch context");
        for pc in ctx.break_fixups {
            self.f.body[pc] = Instr::jump(Op::Goto, end);
        }
        // Breaks with no label belong to the switch; continue targets an
        // enclosing loop and was rejected by the checker otherwise.
        for pc in ctx.continue_fixups {
            self.f.body[pc] = Instr::jump(Op::Goto, end);
        }
        Ok(())
    }

    fn emit_type_switch(
        &mut self,
        s: StmtId,
        init: Option<StmtId>,
        subject: ExprId,
        cases: ListRef,
    ) -> SResult {
        let ast = self.em.ast;
        let pos = self.spos(s);
        if let Some(init) = init {
            self.emit_stmt(init)?;
        }
        let sty = self.ty_of(subject);
        let sr = self.emit_boxed(subject, sty)?;
        let subj = self.alloc(Bank::Gen)?;
        self.push(Instr::new(Op::MoveGeneral, 0, sr, subj), pos);

        let case_ids = ast.cases_of(cases).to_vec();
        let mut body_fixups: Vec<(usize, usize)> = Vec::new();
        let mut binding_src: Vec<Option<(Bank, i8)>> = vec![None; case_ids.len()];
        let mut default_case = None;
        for (ci, &c) in case_ids.iter().enumerate() {
            let case = ast.cases[c];
            let exprs = ast.exprs_of(case.exprs).to_vec();
            if exprs.is_empty() {
                default_case = Some(ci);
                continue;
            }
            for &ce in &exprs {
                let cinfo = self.em.out.info(ce).clone();
                if cinfo.is_nil() {
                    self.push(Instr::new(Op::If, subj, Cond::Nil as u8 as i8, 0), pos);
                    let skip = self.pc() as usize;
                    self.push(Instr::jump(Op::Goto, 0), pos);
                    let goto_body = self.pc() as usize;
                    self.push(Instr::jump(Op::Goto, 0), pos);
                    body_fixups.push((goto_body, ci));
                    let after = self.pc();
                    self.f.body[skip] = Instr::jump(Op::Goto, after);
                } else {
                    let target = cinfo.ty;
                    let bank = self.bank_of(target);
                    let d = self.alloc(bank)?;
                    let ti = self.type_idx(target)?;
                    self.push(Instr::new(Op::Assert, subj, ti, d), pos);
                    let goto_body = self.pc() as usize;
                    self.push(Instr::jump(Op::JmpOk, 0), pos);
                    body_fixups.push((goto_body, ci));
                    if exprs.len() == 1 {
                        binding_src[ci] = Some((bank, d));
                    }
                }
            }
        }
        let no_match = self.pc() as usize;
        self.push(Instr::jump(Op::Goto, 0), pos);
        if let Some(dc) = default_case {
            body_fixups.push((no_match, dc));
        }

        let label = self.take_label();
        self.loops.push(LoopCtx {
            label,
            break_fixups: Vec::new(),
            continue_fixups: Vec::new(),
            range_depth: self.range_depth,
            is_range: false,
            is_loop: false,
        });
        let mut body_starts = vec![0u32; case_ids.len()];
        let mut end_fixups = Vec::new();
        for (ci, &c) in case_ids.iter().enumerate() {
            body_starts[ci] = self.pc();
            // Bind the case variable.
            let bkey = DeclKey::Case(c.raw());
            if let Some(&bty) = self.em.out.decl_types.get(&bkey) {
                match binding_src[ci] {
                    Some((bank, r)) => self.store_local(bkey, bty, bank, r, bty, pos)?,
                    None => {
                        // Default or multi-type case: the subject itself.
                        self.store_local(bkey, bty, Bank::Gen, subj, crate::types::ANY, pos)?;
                    }
                }
            }
            for &b in &ast.stmts_of(ast.cases[c].body).to_vec() {
                self.emit_stmt(b)?;
                self.free_temps();
            }
            let pc = self.pc() as usize;
            self.push(Instr::jump(Op::Goto, 0), pos);
            end_fixups.push(pc);
        }
        let end = self.pc();
        for (pc, ci) in body_fixups {
            let target = body_starts[ci];
            let op = self.f.body[pc].opcode();
            self.f.body[pc] = Instr::jump(op, target);
        }
        if default_case.is_none() {
            self.f.body[no_match] = Instr::jump(Op::Goto, end);
        }
        for pc in end_fixups {
            self.f.body[pc] = Instr::jump(Op::Goto, end);
        }
        let ctx = self.loops.pop().expect("switch context");
        for pc in ctx.break_fixups {
            self.f.body[pc] = Instr::jump(Op::Goto, end);
        }
        Ok(())
    }

    fn emit_select(&mut self, s: StmtId, cases: ListRef) -> SResult {
        let ast = self.em.ast;
        let pos = self.spos(s);
        let case_ids = ast.cases_of(cases).to_vec();

        // Evaluate every channel (and sent value) first.
        let mut spec = SelectSpec::default();
        let mut recv_dsts: Vec<Option<(StmtId, i8, i8)>> = Vec::new();
        for &c in &case_ids {
            let case = ast.cases[c];
            match case.comm {
                Some(comm) => match ast.stmts[comm] {
                    Stmt::Send { chan, value } => {
                        let ch = self.emit_expr(chan, None)?;
                        let vty = self.ty_of(value);
                        let v = self.emit_boxed(value, vty)?;
                        spec.cases.push(SelectCase::Send { ch, value: v, addr: 0 });
                        recv_dsts.push(None);
                    }
                    Stmt::Expr(e) => {
                        let chan = match ast.exprs[e] {
                            Expr::Unary { op: UnOp::Recv, expr } => expr,
                            _ => unreachable!("checked"),
                        };
                        let ch = self.emit_expr(chan, None)?;
                        spec.cases.push(SelectCase::Recv { ch, dst: 0, ok_dst: 0, addr: 0 });
                        recv_dsts.push(None);
                    }
                    Stmt::Assign { rhs, .. } => {
                        let r = ast.exprs_of(rhs)[0];
                        let chan = match ast.exprs[r] {
                            Expr::Unary { op: UnOp::Recv, expr } => expr,
                            _ => unreachable!("checked"),
                        };
                        let ch = self.emit_expr(chan, None)?;
                        let dst = self.alloc(Bank::Gen)?;
                        let ok_dst = self.alloc(Bank::Int)?;
                        spec.cases.push(SelectCase::Recv { ch, dst, ok_dst, addr: 0 });
                        recv_dsts.push(Some((comm, dst, ok_dst)));
                    }
                    _ => unreachable!("checked"),
                },
                None => {
                    spec.cases.push(SelectCase::Default { addr: 0 });
                    recv_dsts.push(None);
                }
            }
        }
        let spec_idx = self.add_select(spec)?;
        self.push(Instr::new(Op::Select, spec_idx, 0, 0), pos);

        let label = self.take_label();
        self.loops.push(LoopCtx {
            label,
            break_fixups: Vec::new(),
            continue_fixups: Vec::new(),
            range_depth: self.range_depth,
            is_range: false,
            is_loop: false,
        });
        let mut starts = Vec::new();
        let mut end_fixups = Vec::new();
        for (ci, &c) in case_ids.iter().enumerate() {
            starts.push(self.pc());
            // Bind received values.
            if let Some((comm, dst, ok_dst)) = recv_dsts[ci] {
                if let Stmt::Assign { lhs, rhs, op } = ast.stmts[comm] {
                    let lhs = ast.exprs_of(lhs).to_vec();
                    let vty = self.ty_of(ast.exprs_of(rhs)[0]);
                    let vbank = self.bank_of(vty);
                    let v = self.unbox_reg(vbank, dst, None, pos)?;
                    let targets: Vec<ExprId> = lhs;
                    for (i, &t) in targets.iter().enumerate() {
                        let (bank, src, ty) = if i == 0 {
                            (vbank, v, vty)
                        } else {
                            (Bank::Int, ok_dst, crate::types::BOOL)
                        };
                        if op == AssignOp::Define {
                            let key = DeclKey::Expr(t.raw());
                            if let Some(&dty) = self.em.out.decl_types.get(&key) {
                                self.store_local(key, dty, bank, src, ty, pos)?;
                                continue;
                            }
                        }
                        if matches!(ast.exprs[t], Expr::Ident(sym) if ast.name(sym) == "_") {
                            continue;
                        }
                        let tg = self.prepare_target(t)?;
                        self.store_target(&tg, bank, src, ty, pos)?;
                    }
                }
            }
            for &b in &ast.stmts_of(ast.cases[c].body).to_vec() {
                self.emit_stmt(b)?;
                self.free_temps();
            }
            let pc = self.pc() as usize;
            self.push(Instr::jump(Op::Goto, 0), pos);
            end_fixups.push(pc);
        }
        let end = self.pc();
        for pc in end_fixups {
            self.f.body[pc] = Instr::jump(Op::Goto, end);
        }
        let ctx = self.loops.pop().expect("select context");
        for pc in ctx.break_fixups {
            self.f.body[pc] = Instr::jump(Op::Goto, end);
        }
        // Patch the select table with the case addresses.
        let spec = &mut self.f.selects[spec_idx as usize];
        for (case, &start) in spec.cases.iter_mut().zip(starts.iter()) {
            match case {
                SelectCase::Send { addr, .. }
                | SelectCase::Recv { addr, .. }
                | SelectCase::Default { addr } => *addr = start,
            }
        }
        Ok(())
    }

    fn emit_return(&mut self, s: StmtId, values: ListRef) -> SResult {
        let ast = self.em.ast;
        let pos = self.spos(s);
        let values = ast.exprs_of(values).to_vec();
        let outs = self.f.outs.clone();
        if values.len() == 1 && outs.len() > 1 {
            // Forwarding a multi-value call.
            let results = self.emit_call_results(values[0])?;
            for (i, (bank, r)) in results.into_iter().enumerate() {
                let want = self.bank_of(outs[i]);
                let src_ty = bank_default_type(bank);
                let r = self.coerce_reg(bank, r, src_ty, want, pos)?;
                let dst = self.result_reg(&outs, i, want);
                let mv = match want {
                    Bank::Int => Op::MoveInt,
                    Bank::Float => Op::MoveFloat,
                    Bank::Str => Op::MoveString,
                    Bank::Gen => Op::MoveGeneral,
                };
                self.push(Instr::new(mv, 0, r, dst), pos);
            }
        } else {
            for (i, &v) in values.iter().enumerate() {
                let ty = outs[i];
                let bank = self.bank_of(ty);
                let r = self.emit_expr_as(v, ty)?;
                let dst = self.result_reg(&outs, i, bank);
                let mv = match bank {
                    Bank::Int => Op::MoveInt,
                    Bank::Float => Op::MoveFloat,
                    Bank::Str => Op::MoveString,
                    Bank::Gen => Op::MoveGeneral,
                };
                if r != dst {
                    self.push(Instr::new(mv, 0, r, dst), pos);
                }
            }
        }
        // Unwind open range iterators before leaving the frame.
        for _ in 0..self.range_depth {
            self.push(Instr::new(Op::RangePop, 0, 0, 0), pos);
        }
        self.push(Instr::new(Op::Return, 0, 0, 0), pos);
        Ok(())
    }

    /// Compiles a local macro declaration into a subfunction with
    /// captures.
    fn emit_local_macro(
        &mut self,
        s: StmtId,
        ty: TypeId,
    ) -> Result<crate::code::Function, BuildError> {
        let em = self.em;
        let ast = em.ast;
        let pos = self.spos(s);
        let (name, params, body) = match ast.stmts[s] {
            Stmt::MacroDecl { name, params, body, .. } => (name, params, body),
            _ => unreachable!(),
        };
        let name = ast.name(name).to_string();
        let format = match em.reg.get(ty) {
            Type::Macro(m) => m.format,
            _ => self.f.format,
        };
        let params_list = ast.params_of(params).to_vec();
        let ins: Vec<TypeId> = (0..params_list.len())
            .map(|i| em.out.decl_types[&DeclKey::StmtParam(s.raw(), i as u16)])
            .collect();

        let mut sub = FnBuilder::new(em, &name, &self.path, format, true);
        sub.layout_params(&ins, &[], |i| DeclKey::StmtParam(s.raw(), i as u16));
        let caps = em
            .out
            .captured
            .get(&FnKey::Decl(s.raw()))
            .cloned()
            .unwrap_or_default();
        let mut crefs = Vec::new();
        for (i, key) in caps.iter().enumerate() {
            sub.cvars.insert(*key, i as u8);
            crefs.push(self.capture_ref(*key, pos)?);
        }
        let nodes = ast.stmts_of(body).to_vec();
        sub.prescan_stmts(&nodes);
        sub.finish_locals();
        sub.emit_param_cells()?;
        for &inner in &nodes {
            sub.emit_stmt(inner)?;
            sub.free_temps();
        }
        sub.push(Instr::new(Op::Return, 0, 0, 0), Position::default());
        sub.f.is_macro = true;
        let mut f = sub.finish()?;
        f.crefs = crefs;
        Ok(f)
    }
}
