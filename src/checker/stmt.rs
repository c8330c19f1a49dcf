//! Statement checking, including the template statements.

use crate::ast::{AssignOp, BinOp, Context, Expr, ExprId, ListRef, Stmt, StmtId, Symbol};
use crate::error::BuildError;
use crate::types::{self, Type, TypeId};

use super::{Binding, Checker, DeclKey, FnKey, GlobalInit, Props, TypeInfo};

type SResult = Result<(), BuildError>;

impl Checker<'_> {
    pub(crate) fn check_stmt(&mut self, s: StmtId) -> SResult {
        match self.ast.stmts[s] {
            Stmt::Expr(e) => {
                let info = self.check_value(e)?;
                let is_call = matches!(self.ast.exprs[e], Expr::Call { .. });
                let is_recv =
                    matches!(self.ast.exprs[e], Expr::Unary { op: crate::ast::UnOp::Recv, .. });
                if !is_call && !is_recv {
                    return Err(self.error(
                        self.epos(e),
                        format!("{} evaluated but not used", self.ast.describe_expr(e)),
                    ));
                }
                if info.props.has(Props::IS_MACRO) && is_call {
                    return Err(self.error(
                        self.epos(e),
                        format!("{} can only be invoked with show", self.ast.describe_expr(e)),
                    ));
                }
                Ok(())
            }
            Stmt::Send { chan, value } => {
                let ci = self.check_single_value(chan)?;
                let vi = self.check_single_value(value)?;
                match self.reg.get(self.reg.underlying(ci.ty)).clone() {
                    Type::Chan(dir, elem) => {
                        if dir == crate::ast::ChanDir::Recv {
                            return Err(self.error(
                                self.spos(s),
                                format!(
                                    "invalid operation: {} <- (send to receive-only type {})",
                                    self.ast.describe_expr(chan),
                                    self.reg.describe(ci.ty)
                                ),
                            ));
                        }
                        self.assign_to(value, &vi, elem)
                    }
                    _ => Err(self.error(
                        self.spos(s),
                        format!(
                            "invalid operation: {} <- (send to non-chan type {})",
                            self.ast.describe_expr(chan),
                            self.reg.describe(ci.ty)
                        ),
                    )),
                }
            }
            Stmt::IncDec { expr, inc: _ } => {
                let info = self.check_single_value(expr)?;
                if !info.is_addressable() {
                    return Err(self.error(
                        self.epos(expr),
                        format!("cannot assign to {}", self.ast.describe_expr(expr)),
                    ));
                }
                if !self.reg.is_numeric(info.ty) {
                    return Err(self.error(
                        self.epos(expr),
                        format!(
                            "invalid operation: {} (non-numeric type {})",
                            self.ast.describe_expr(expr),
                            self.reg.describe(info.ty)
                        ),
                    ));
                }
                Ok(())
            }
            Stmt::Assign { lhs, rhs, op } => self.check_assign(s, lhs, rhs, op),
            Stmt::Var { names, ty, values } => self.check_var(s, names, ty, values),
            Stmt::Const { names, ty, values, iota } => self.check_const(s, names, ty, values, iota),
            Stmt::TypeDecl { name, alias, ty } => {
                let t = self.check_type_expr(ty)?;
                let name = self.ast.name(name).to_string();
                let ty = if alias {
                    t
                } else {
                    self.reg.intern(Type::Named {
                        pkg: self.path.clone(),
                        name: name.clone(),
                        underlying: self.reg.underlying(t),
                    })
                };
                self.declare(&name, TypeInfo::type_name(ty), None, self.spos(s))
            }
            Stmt::FuncDecl { .. } => self.check_func_decl_body(s),
            Stmt::If { init, cond, then, els } => {
                self.push_scope();
                if let Some(init) = init {
                    self.check_stmt(init)?;
                }
                self.check_cond(cond, "if")?;
                self.check_stmt(then)?;
                if let Some(els) = els {
                    self.check_stmt(els)?;
                }
                self.pop_scope()
            }
            Stmt::For { init, cond, post, body } => {
                self.push_scope();
                if let Some(init) = init {
                    self.check_stmt(init)?;
                }
                if let Some(cond) = cond {
                    self.check_cond(cond, "for")?;
                }
                if let Some(post) = post {
                    self.check_stmt(post)?;
                }
                self.loop_depth += 1;
                self.check_stmt(body)?;
                self.loop_depth -= 1;
                self.pop_scope()
            }
            Stmt::ForRange { key, value, define, expr, body } => {
                self.check_for_range(s, key, value, define, expr, body)
            }
            Stmt::Switch { init, expr, cases } => self.check_switch(s, init, expr, cases),
            Stmt::TypeSwitch { init, binding, subject, cases } => {
                self.check_type_switch(s, init, binding, subject, cases)
            }
            Stmt::Select { cases } => self.check_select(s, cases),
            Stmt::Return { values } => self.check_return(s, values),
            Stmt::Break { label } => {
                if self.loop_depth == 0 && self.switch_depth == 0 && self.select_depth == 0 {
                    return Err(self.error(self.spos(s), "break is not in a loop, switch or select"));
                }
                if let Some(l) = label {
                    self.check_label_ref(s, l)?;
                }
                Ok(())
            }
            Stmt::Continue { label } => {
                if self.loop_depth == 0 {
                    return Err(self.error(self.spos(s), "continue is not in a loop"));
                }
                if let Some(l) = label {
                    self.check_label_ref(s, l)?;
                }
                Ok(())
            }
            Stmt::Goto { .. } => Ok(()), // targets are resolved by the emitter
            Stmt::Labeled { label, stmt } => {
                let name = self.ast.name(label).to_string();
                self.labels.push(name);
                let r = self.check_stmt(stmt);
                self.labels.pop();
                r
            }
            Stmt::Fallthrough => {
                if !self.in_switch_case {
                    return Err(self.error(self.spos(s), "fallthrough statement out of place"));
                }
                Ok(())
            }
            Stmt::Defer(e) | Stmt::Go(e) => {
                let is_go = matches!(self.ast.stmts[s], Stmt::Go(_));
                if is_go && self.opts.disallow_go_stmt {
                    return Err(self.error(self.spos(s), "go statement not allowed"));
                }
                if !matches!(self.ast.exprs[e], Expr::Call { .. }) {
                    let kw = if is_go { "go" } else { "defer" };
                    return Err(self.error(
                        self.epos(e),
                        format!("expression in {kw} must be function call"),
                    ));
                }
                if let Expr::Call { func, .. } = self.ast.exprs[e] {
                    // A builtin call has no function value to defer.
                    let finfo = self.check_expr(func)?;
                    if finfo.is_builtin() {
                        let kw = if is_go { "go" } else { "defer" };
                        return Err(self.error(
                            self.epos(e),
                            format!("cannot {kw} a call to a builtin; wrap it in a function literal"),
                        ));
                    }
                }
                let info = self.check_value(e)?;
                if info.props.has(Props::IS_MACRO) {
                    let kw = if is_go { "go" } else { "defer" };
                    return Err(self.error(
                        self.epos(e),
                        format!("cannot {kw} a macro invocation"),
                    ));
                }
                Ok(())
            }
            Stmt::Block { stmts } => {
                self.push_scope();
                for &inner in &self.ast.stmts_of(stmts).to_vec() {
                    self.check_stmt(inner)?;
                }
                self.pop_scope()
            }
            Stmt::Text(_) | Stmt::Comment(_) => Ok(()),
            Stmt::Show { exprs, ctx } => {
                for &e in &self.ast.exprs_of(exprs).to_vec() {
                    self.check_show_value(e, ctx)?;
                }
                Ok(())
            }
            Stmt::ShowMacro { call, ctx } => self.check_show_macro(call, ctx),
            Stmt::MacroDecl { .. } => self.check_local_macro(s),
            Stmt::Include { tree, .. } => {
                let t = self.ast.tree(tree);
                let saved_path = std::mem::replace(&mut self.path, t.path.clone());
                let nodes = self.ast.stmts_of(t.nodes).to_vec();
                self.push_scope();
                for inner in nodes {
                    self.check_stmt(inner)?;
                }
                self.pop_scope()?;
                self.path = saved_path;
                Ok(())
            }
            Stmt::Import { alias, dot, path, tree } => {
                let pkg_idx = match tree {
                    Some(t) => self.check_imported_tree(t)?,
                    None => {
                        let p = self.ast.name(path).to_string();
                        self.load_native_pkg(&p, self.spos(s))?
                    }
                };
                if dot {
                    // Dot import: inject the package entries directly.
                    let entries: Vec<(String, super::Entry)> = self.pkgs[pkg_idx as usize]
                        .entries
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    for (name, entry) in entries {
                        self.declare(&name, entry.info, entry.binding, self.spos(s))?;
                    }
                } else {
                    let name = match alias {
                        Some(a) => self.ast.name(a).to_string(),
                        None => self.pkgs[pkg_idx as usize].name.clone(),
                    };
                    let info = TypeInfo {
                        ty: types::ANY,
                        props: Props::IS_PACKAGE,
                        constant: None,
                        package: Some(pkg_idx),
                    };
                    self.declare(&name, info, None, self.spos(s))?;
                }
                Ok(())
            }
            Stmt::Extends { .. } => Ok(()), // handled by the entry checker
            Stmt::Url { stmts, .. } => {
                for &inner in &self.ast.stmts_of(stmts).to_vec() {
                    self.check_stmt(inner)?;
                }
                Ok(())
            }
        }
    }

    fn check_label_ref(&self, s: StmtId, label: Symbol) -> SResult {
        let name = self.ast.name(label);
        if !self.labels.iter().any(|l| l == name) {
            return Err(self.error(self.spos(s), format!("label {name} not defined")));
        }
        Ok(())
    }

    fn check_cond(&mut self, cond: ExprId, what: &str) -> SResult {
        let info = self.check_single_value(cond)?;
        if info.is_untyped() {
            if self.reg.is_bool(info.ty) {
                self.convert_untyped(cond, &info, types::BOOL)?;
                return Ok(());
            }
        } else if self.reg.is_bool(info.ty) {
            return Ok(());
        }
        Err(self.error(
            self.epos(cond),
            format!(
                "non-bool {} (type {}) used as {what} condition",
                self.ast.describe_expr(cond),
                self.reg.describe(info.ty)
            ),
        ))
    }

    // ---------------------------------------------------------------------
    // Declarations and assignment
    // ---------------------------------------------------------------------

    fn check_var(
        &mut self,
        s: StmtId,
        names: ListRef,
        ty: Option<crate::ast::TypeExprId>,
        values: ListRef,
    ) -> SResult {
        let names = self.ast.exprs_of(names).to_vec();
        let values = self.ast.exprs_of(values).to_vec();
        let declared = match ty {
            Some(t) => Some(self.check_type_expr(t)?),
            None => None,
        };

        // `var a, b = f()` with a multi-value call.
        if values.len() == 1 && names.len() > 1 {
            let info = self.check_value(values[0])?;
            if let Type::Tuple(elems) = self.reg.get(info.ty).clone() {
                if elems.len() != names.len() {
                    return Err(self.assign_mismatch(s, names.len(), elems.len()));
                }
                for (i, &name) in names.iter().enumerate() {
                    let ty = match declared {
                        Some(d) => {
                            if !self.reg.assignable(elems[i], d) {
                                return Err(self.error(
                                    self.epos(values[0]),
                                    format!(
                                        "cannot use {} value as type {} in assignment",
                                        self.reg.describe(elems[i]),
                                        self.reg.describe(d)
                                    ),
                                ));
                            }
                            d
                        }
                        None => elems[i],
                    };
                    self.declare_var_name(name, ty)?;
                }
                return Ok(());
            }
            return Err(self.assign_mismatch(s, names.len(), values.len()));
        }

        if !values.is_empty() && values.len() != names.len() {
            return Err(self.assign_mismatch(s, names.len(), values.len()));
        }
        for (i, &name) in names.iter().enumerate() {
            let ty = if let Some(&v) = values.get(i) {
                let info = self.check_single_value(v)?;
                match declared {
                    Some(d) => {
                        self.assign_to(v, &info, d)?;
                        d
                    }
                    None => self.default_of(v, info)?,
                }
            } else {
                declared.expect("var without type or value")
            };
            self.declare_var_name(name, ty)?;
        }
        Ok(())
    }

    fn declare_var_name(&mut self, name: ExprId, ty: TypeId) -> SResult {
        let sym = match self.ast.exprs[name] {
            Expr::Ident(sym) => sym,
            _ => return Err(self.error(self.epos(name), "non-name on left side of var")),
        };
        let key = DeclKey::Expr(name.raw());
        self.decl_types.insert(key, ty);
        self.expr_info.insert(name.raw(), TypeInfo::addressable(ty));
        let n = self.ast.name(sym).to_string();
        self.declare(
            &n,
            TypeInfo::addressable(ty),
            Some(Binding::Local(key)),
            self.epos(name),
        )
    }

    fn assign_mismatch(&self, s: StmtId, vars: usize, vals: usize) -> BuildError {
        self.error(
            self.spos(s),
            format!("assignment mismatch: {vars} variables but {vals} values"),
        )
    }

    fn check_const(
        &mut self,
        s: StmtId,
        names: ListRef,
        ty: Option<crate::ast::TypeExprId>,
        values: ListRef,
        iota: u32,
    ) -> SResult {
        let names = self.ast.exprs_of(names).to_vec();
        let values = self.ast.exprs_of(values).to_vec();
        if names.len() != values.len() {
            return Err(self.assign_mismatch(s, names.len(), values.len()));
        }
        let declared = match ty {
            Some(t) => Some(self.check_type_expr(t)?),
            None => None,
        };
        let saved_iota = self.iota.replace(iota as i64);
        for (&name, &v) in names.iter().zip(values.iter()) {
            let info = self.check_single_value(v)?;
            if !info.is_const() {
                self.iota = saved_iota;
                return Err(self.error(
                    self.epos(v),
                    format!("const initializer {} is not a constant", self.ast.describe_expr(v)),
                ));
            }
            let cinfo = match declared {
                Some(d) => {
                    let c = info.constant.clone().expect("constant");
                    let c = super::consts::representable(&self.reg, &c, d)
                        .map_err(|m| self.error(self.epos(v), m))?;
                    TypeInfo::typed_const(c, d)
                }
                None => info.clone(),
            };
            let sym = match self.ast.exprs[name] {
                Expr::Ident(sym) => sym,
                _ => return Err(self.error(self.epos(name), "non-name on left side of const")),
            };
            self.expr_info.insert(name.raw(), cinfo.clone());
            let n = self.ast.name(sym).to_string();
            self.declare(&n, cinfo, None, self.epos(name))?;
        }
        self.iota = saved_iota;
        Ok(())
    }

    fn check_assign(&mut self, s: StmtId, lhs: ListRef, rhs: ListRef, op: AssignOp) -> SResult {
        let lhs = self.ast.exprs_of(lhs).to_vec();
        let rhs = self.ast.exprs_of(rhs).to_vec();

        // Compound assignment: `x op= y`.
        if !matches!(op, AssignOp::Assign | AssignOp::Define) {
            let target = lhs[0];
            let tinfo = self.check_single_value(target)?;
            if !tinfo.is_addressable() {
                return Err(self.error(
                    self.epos(target),
                    format!("cannot assign to {}", self.ast.describe_expr(target)),
                ));
            }
            let bin = match op {
                AssignOp::Add => BinOp::Add,
                AssignOp::Sub => BinOp::Sub,
                AssignOp::Mul => BinOp::Mul,
                AssignOp::Div => BinOp::Div,
                AssignOp::Rem => BinOp::Rem,
                AssignOp::And => BinOp::And,
                AssignOp::Or => BinOp::Or,
                AssignOp::Xor => BinOp::Xor,
                AssignOp::Shl => BinOp::Shl,
                AssignOp::Shr => BinOp::Shr,
                AssignOp::AndNot => BinOp::AndNot,
                _ => unreachable!(),
            };
            let vinfo = self.check_single_value(rhs[0])?;
            // The operand must be compatible with the target type.
            if matches!(bin, BinOp::Shl | BinOp::Shr) {
                if vinfo.is_untyped() {
                    self.convert_untyped(rhs[0], &vinfo, types::UINT)?;
                } else if !self.reg.is_integer(vinfo.ty) {
                    return Err(self.error(
                        self.epos(rhs[0]),
                        "shift count must be an integer",
                    ));
                }
            } else {
                self.assign_to(rhs[0], &vinfo, tinfo.ty)?;
            }
            let ok = match bin {
                BinOp::Add => self.reg.is_numeric(tinfo.ty) || self.reg.is_string(tinfo.ty),
                BinOp::Sub | BinOp::Mul | BinOp::Div => self.reg.is_numeric(tinfo.ty),
                _ => self.reg.is_integer(tinfo.ty),
            };
            if !ok {
                return Err(self.error(
                    self.spos(s),
                    format!(
                        "invalid operation: {} (operator {} not defined on {})",
                        self.ast.describe_expr(target),
                        bin.symbol(),
                        self.reg.describe(tinfo.ty)
                    ),
                ));
            }
            return Ok(());
        }

        // Multi-value right side: call, map index, type assertion, recv.
        if rhs.len() == 1 && lhs.len() > 1 {
            let kinds = self.multi_value_kinds(rhs[0], lhs.len())?;
            if let Some(types_list) = kinds {
                for (i, &target) in lhs.iter().enumerate() {
                    self.assign_one(target, types_list[i], op)?;
                }
                if op == AssignOp::Define {
                    self.require_new_names(s, &lhs)?;
                }
                return Ok(());
            }
            return Err(self.assign_mismatch(s, lhs.len(), rhs.len()));
        }

        if lhs.len() != rhs.len() {
            return Err(self.assign_mismatch(s, lhs.len(), rhs.len()));
        }
        for (&target, &value) in lhs.iter().zip(rhs.iter()) {
            let vinfo = self.check_single_value(value)?;
            match op {
                AssignOp::Define => {
                    let is_blank = self.is_blank(target);
                    if is_blank {
                        if vinfo.is_untyped() {
                            self.default_of(value, vinfo)?;
                        }
                        continue;
                    }
                    // Redeclaration in := assigns instead.
                    if let Expr::Ident(sym) = self.ast.exprs[target] {
                        let name = self.ast.name(sym).to_string();
                        if self.declared_in_current_scope(&name) {
                            let tinfo = self.check_single_value(target)?;
                            self.assign_to(value, &vinfo, tinfo.ty)?;
                            continue;
                        }
                    }
                    let ty = self.default_of(value, vinfo)?;
                    self.declare_var_name(target, ty)?;
                }
                _ => {
                    if self.is_blank(target) {
                        if vinfo.is_untyped() {
                            self.default_of(value, vinfo)?;
                        }
                        continue;
                    }
                    let tinfo = self.check_single_value(target)?;
                    if !tinfo.is_addressable() {
                        return Err(self.error(
                            self.epos(target),
                            format!("cannot assign to {}", self.ast.describe_expr(target)),
                        ));
                    }
                    self.assign_to(value, &vinfo, tinfo.ty)?;
                }
            }
        }
        if op == AssignOp::Define {
            self.require_new_names(s, &lhs)?;
        }
        Ok(())
    }

    fn is_blank(&self, e: ExprId) -> bool {
        matches!(self.ast.exprs[e], Expr::Ident(sym) if self.ast.name(sym) == "_")
    }

    /// For `a, b := rhs` with one right-side expression: the per-variable
    /// types, or `None` when the form doesn't produce that many values.
    fn multi_value_kinds(
        &mut self,
        rhs: ExprId,
        n: usize,
    ) -> Result<Option<Vec<TypeId>>, BuildError> {
        let info = self.check_value(rhs)?;
        if let Type::Tuple(elems) = self.reg.get(info.ty).clone() {
            if elems.len() == n {
                return Ok(Some(elems));
            }
            return Ok(None);
        }
        if n != 2 {
            return Ok(None);
        }
        // The comma-ok forms.
        match self.ast.exprs[rhs] {
            Expr::Index { expr, .. } => {
                let base = self.expr_info.get(&expr.raw()).map(|i| i.ty);
                if let Some(bt) = base {
                    if matches!(self.reg.get(self.reg.underlying(bt)), Type::Map(..)) {
                        return Ok(Some(vec![info.ty, types::BOOL]));
                    }
                }
                Ok(None)
            }
            Expr::TypeAssert { .. } => Ok(Some(vec![info.ty, types::BOOL])),
            Expr::Unary { op: crate::ast::UnOp::Recv, .. } => {
                Ok(Some(vec![info.ty, types::BOOL]))
            }
            _ => Ok(None),
        }
    }

    fn assign_one(&mut self, target: ExprId, ty: TypeId, op: AssignOp) -> SResult {
        if self.is_blank(target) {
            return Ok(());
        }
        match op {
            AssignOp::Define => {
                if let Expr::Ident(sym) = self.ast.exprs[target] {
                    let name = self.ast.name(sym).to_string();
                    if self.declared_in_current_scope(&name) {
                        let tinfo = self.check_single_value(target)?;
                        if !self.reg.assignable(ty, tinfo.ty) {
                            return Err(self.error(
                                self.epos(target),
                                format!(
                                    "cannot use {} value as type {} in assignment",
                                    self.reg.describe(ty),
                                    self.reg.describe(tinfo.ty)
                                ),
                            ));
                        }
                        return Ok(());
                    }
                }
                self.declare_var_name(target, ty)
            }
            _ => {
                let tinfo = self.check_single_value(target)?;
                if !tinfo.is_addressable() {
                    return Err(self.error(
                        self.epos(target),
                        format!("cannot assign to {}", self.ast.describe_expr(target)),
                    ));
                }
                if !self.reg.assignable(ty, tinfo.ty) {
                    return Err(self.error(
                        self.epos(target),
                        format!(
                            "cannot use {} value as type {} in assignment",
                            self.reg.describe(ty),
                            self.reg.describe(tinfo.ty)
                        ),
                    ));
                }
                Ok(())
            }
        }
    }

    fn require_new_names(&self, s: StmtId, lhs: &[ExprId]) -> SResult {
        let any_new = lhs.iter().any(|&e| match self.ast.exprs[e] {
            Expr::Ident(sym) => {
                let name = self.ast.name(sym);
                name == "_" || self.decl_types.contains_key(&DeclKey::Expr(e.raw()))
            }
            _ => false,
        });
        if !any_new {
            return Err(self.error(self.spos(s), "no new variables on left side of :="));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Control flow
    // ---------------------------------------------------------------------

    fn check_for_range(
        &mut self,
        s: StmtId,
        key: Option<ExprId>,
        value: Option<ExprId>,
        define: bool,
        expr: ExprId,
        body: StmtId,
    ) -> SResult {
        self.push_scope();
        let info = self.check_single_value(expr)?;
        let info = if info.is_untyped() {
            let ty = self.default_of(expr, info)?;
            TypeInfo::value(ty)
        } else {
            info
        };
        let (kt, vt) = match self.reg.get(self.reg.underlying(info.ty)).clone() {
            Type::Slice(elem) | Type::Array(_, elem) => (types::INT, Some(elem)),
            Type::Str => (types::INT, Some(types::RUNE)),
            Type::Map(k, v) => (k, Some(v)),
            Type::Chan(dir, elem) => {
                if dir == crate::ast::ChanDir::Send {
                    self.pop_scope()?;
                    return Err(self.error(
                        self.epos(expr),
                        format!(
                            "invalid operation: range {} (receive from send-only type {})",
                            self.ast.describe_expr(expr),
                            self.reg.describe(info.ty)
                        ),
                    ));
                }
                (elem, None)
            }
            _ => {
                self.pop_scope()?;
                return Err(self.error(
                    self.epos(expr),
                    format!(
                        "cannot range over {} (type {})",
                        self.ast.describe_expr(expr),
                        self.reg.describe(info.ty)
                    ),
                ));
            }
        };
        if value.is_some() && vt.is_none() {
            self.pop_scope()?;
            return Err(self.error(self.spos(s), "too many variables in range"));
        }
        for (target, ty) in [(key, Some(kt)), (value, vt)] {
            if let (Some(target), Some(ty)) = (target, ty) {
                if self.is_blank(target) {
                    continue;
                }
                if define {
                    self.declare_var_name(target, ty)?;
                } else {
                    let tinfo = self.check_single_value(target)?;
                    if !tinfo.is_addressable() {
                        return Err(self.error(
                            self.epos(target),
                            format!("cannot assign to {}", self.ast.describe_expr(target)),
                        ));
                    }
                    if !self.reg.assignable(ty, tinfo.ty) {
                        return Err(self.error(
                            self.epos(target),
                            format!(
                                "cannot use {} value as type {} in assignment",
                                self.reg.describe(ty),
                                self.reg.describe(tinfo.ty)
                            ),
                        ));
                    }
                }
            }
        }
        self.loop_depth += 1;
        self.check_stmt(body)?;
        self.loop_depth -= 1;
        self.pop_scope()
    }

    fn check_switch(
        &mut self,
        s: StmtId,
        init: Option<StmtId>,
        expr: Option<ExprId>,
        cases: ListRef,
    ) -> SResult {
        self.push_scope();
        if let Some(init) = init {
            self.check_stmt(init)?;
        }
        let subject_ty = match expr {
            Some(e) => {
                let info = self.check_single_value(e)?;
                let ty = self.default_of(e, info)?;
                Some(ty)
            }
            None => None,
        };
        let case_ids = self.ast.cases_of(cases).to_vec();
        self.switch_depth += 1;
        let mut seen_default = false;
        for (ci, &c) in case_ids.iter().enumerate() {
            let case = self.ast.cases[c];
            if case.exprs.is_empty() && case.comm.is_none() {
                if seen_default {
                    self.switch_depth -= 1;
                    return Err(self.error(
                        self.ast.cases.pos(c),
                        "multiple defaults in switch",
                    ));
                }
                seen_default = true;
            }
            for &ce in &self.ast.exprs_of(case.exprs).to_vec() {
                let info = self.check_single_value(ce)?;
                match subject_ty {
                    Some(st) => {
                        if info.is_untyped() {
                            self.convert_untyped(ce, &info, st).map_err(|_| {
                                self.error(
                                    self.epos(ce),
                                    format!(
                                        "invalid case {} in switch (mismatched types {} and {})",
                                        self.ast.describe_expr(ce),
                                        self.reg.describe(info.ty),
                                        self.reg.describe(st)
                                    ),
                                )
                            })?;
                        } else if !self.reg.assignable(info.ty, st)
                            && !self.reg.assignable(st, info.ty)
                        {
                            self.switch_depth -= 1;
                            return Err(self.error(
                                self.epos(ce),
                                format!(
                                    "invalid case {} in switch (mismatched types {} and {})",
                                    self.ast.describe_expr(ce),
                                    self.reg.describe(info.ty),
                                    self.reg.describe(st)
                                ),
                            ));
                        }
                    }
                    None => {
                        // An expressionless switch compares against true.
                        if info.is_untyped() {
                            self.convert_untyped(ce, &info, types::BOOL)?;
                        } else if !self.reg.is_bool(info.ty) {
                            self.switch_depth -= 1;
                            return Err(self.error(
                                self.epos(ce),
                                format!(
                                    "invalid case {} in switch (mismatched types {} and bool)",
                                    self.ast.describe_expr(ce),
                                    self.reg.describe(info.ty)
                                ),
                            ));
                        }
                    }
                }
            }
            // Fallthrough is legal except in the last case.
            let body = self.ast.stmts_of(case.body).to_vec();
            for (i, &bs) in body.iter().enumerate() {
                if matches!(self.ast.stmts[bs], Stmt::Fallthrough) {
                    if ci + 1 == case_ids.len() {
                        self.switch_depth -= 1;
                        return Err(self.error(
                            self.spos(bs),
                            "cannot fallthrough final case in switch",
                        ));
                    }
                    if i + 1 != body.len() {
                        self.switch_depth -= 1;
                        return Err(self.error(
                            self.spos(bs),
                            "fallthrough statement out of place",
                        ));
                    }
                }
            }
            let was = self.in_switch_case;
            self.in_switch_case = true;
            self.push_scope();
            for &bs in &body {
                self.check_stmt(bs)?;
            }
            self.pop_scope()?;
            self.in_switch_case = was;
        }
        self.switch_depth -= 1;
        let _ = s;
        self.pop_scope()
    }

    fn check_type_switch(
        &mut self,
        s: StmtId,
        init: Option<StmtId>,
        binding: Option<Symbol>,
        subject: ExprId,
        cases: ListRef,
    ) -> SResult {
        self.push_scope();
        if let Some(init) = init {
            self.check_stmt(init)?;
        }
        let sinfo = self.check_single_value(subject)?;
        if !self.reg.is_interface(sinfo.ty) {
            self.pop_scope()?;
            return Err(self.error(
                self.epos(subject),
                format!(
                    "cannot type switch on non-interface value {} (type {})",
                    self.ast.describe_expr(subject),
                    self.reg.describe(sinfo.ty)
                ),
            ));
        }
        let case_ids = self.ast.cases_of(cases).to_vec();
        self.switch_depth += 1;
        let mut seen_default = false;
        for &c in &case_ids {
            let case = self.ast.cases[c];
            let exprs = self.ast.exprs_of(case.exprs).to_vec();
            if exprs.is_empty() && case.comm.is_none() && seen_default {
                self.switch_depth -= 1;
                return Err(self.error(self.ast.cases.pos(c), "multiple defaults in switch"));
            }
            if exprs.is_empty() {
                seen_default = true;
            }
            let mut case_types = Vec::new();
            for &ce in &exprs {
                // A case is either a type or nil.
                let info = self.check_expr(ce)?;
                if info.is_nil() {
                    case_types.push(None);
                } else if info.is_type() {
                    case_types.push(Some(info.ty));
                } else {
                    self.switch_depth -= 1;
                    return Err(self.error(
                        self.epos(ce),
                        format!("{} is not a type", self.ast.describe_expr(ce)),
                    ));
                }
            }
            self.push_scope();
            if let Some(bsym) = binding {
                // The binding takes the case type when the case lists
                // exactly one type, the subject type otherwise.
                let bty = if case_types.len() == 1 {
                    case_types[0].unwrap_or(sinfo.ty)
                } else {
                    sinfo.ty
                };
                let key = DeclKey::Case(c.raw());
                self.decl_types.insert(key, bty);
                let name = self.ast.name(bsym).to_string();
                self.declare(
                    &name,
                    TypeInfo::addressable(bty),
                    Some(Binding::Local(key)),
                    self.ast.cases.pos(c),
                )?;
            }
            for &bs in &self.ast.stmts_of(case.body).to_vec() {
                if matches!(self.ast.stmts[bs], Stmt::Fallthrough) {
                    self.switch_depth -= 1;
                    return Err(self.error(
                        self.spos(bs),
                        "cannot fallthrough in type switch",
                    ));
                }
                self.check_stmt(bs)?;
            }
            self.pop_scope()?;
        }
        self.switch_depth -= 1;
        let _ = s;
        self.pop_scope()
    }

    fn check_select(&mut self, s: StmtId, cases: ListRef) -> SResult {
        let case_ids = self.ast.cases_of(cases).to_vec();
        self.select_depth += 1;
        let mut seen_default = false;
        for &c in &case_ids {
            let case = self.ast.cases[c];
            self.push_scope();
            match case.comm {
                Some(comm) => {
                    // The communication must be a send or a receive form.
                    match self.ast.stmts[comm] {
                        Stmt::Send { .. } => self.check_stmt(comm)?,
                        Stmt::Expr(e)
                            if matches!(
                                self.ast.exprs[e],
                                Expr::Unary { op: crate::ast::UnOp::Recv, .. }
                            ) =>
                        {
                            self.check_stmt(comm)?
                        }
                        Stmt::Assign { rhs, .. }
                            if self.ast.exprs_of(rhs).len() == 1
                                && matches!(
                                    self.ast.exprs[self.ast.exprs_of(rhs)[0]],
                                    Expr::Unary { op: crate::ast::UnOp::Recv, .. }
                                ) =>
                        {
                            self.check_stmt(comm)?
                        }
                        _ => {
                            self.select_depth -= 1;
                            return Err(self.error(
                                self.spos(comm),
                                "select case must be receive, send or assign recv",
                            ));
                        }
                    }
                }
                None => {
                    if seen_default {
                        self.select_depth -= 1;
                        return Err(self.error(
                            self.ast.cases.pos(c),
                            "multiple defaults in select",
                        ));
                    }
                    seen_default = true;
                }
            }
            for &bs in &self.ast.stmts_of(case.body).to_vec() {
                self.check_stmt(bs)?;
            }
            self.pop_scope()?;
        }
        self.select_depth -= 1;
        let _ = s;
        Ok(())
    }

    fn check_return(&mut self, s: StmtId, values: ListRef) -> SResult {
        let values = self.ast.exprs_of(values).to_vec();
        let (results, named) = match self.fn_stack.last() {
            Some(f) => (f.results.clone(), f.named_results),
            None => (Vec::new(), false),
        };
        if values.is_empty() {
            if results.is_empty() || named {
                return Ok(());
            }
            return Err(self.error(self.spos(s), "not enough arguments to return"));
        }
        // `return f()` forwarding a multi-value call.
        if values.len() == 1 && results.len() > 1 {
            let info = self.check_value(values[0])?;
            if let Type::Tuple(elems) = self.reg.get(info.ty).clone() {
                if elems.len() != results.len() {
                    return Err(self.error(self.spos(s), "wrong number of return values"));
                }
                for (got, want) in elems.iter().zip(results.iter()) {
                    if !self.reg.assignable(*got, *want) {
                        return Err(self.error(
                            self.spos(s),
                            format!(
                                "cannot use {} value as type {} in return statement",
                                self.reg.describe(*got),
                                self.reg.describe(*want)
                            ),
                        ));
                    }
                }
                return Ok(());
            }
        }
        if values.len() != results.len() {
            let which = if values.len() < results.len() { "not enough" } else { "too many" };
            return Err(self.error(self.spos(s), format!("{which} arguments to return")));
        }
        for (&v, &want) in values.iter().zip(results.iter()) {
            let info = self.check_single_value(v)?;
            self.assign_to(v, &info, want).map_err(|_| {
                self.error(
                    self.epos(v),
                    format!(
                        "cannot use {} (type {}) as type {} in return statement",
                        self.ast.describe_expr(v),
                        self.reg.describe(info.ty),
                        self.reg.describe(want)
                    ),
                )
            })?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Template statements
    // ---------------------------------------------------------------------

    fn check_show_value(&mut self, e: ExprId, ctx: Context) -> SResult {
        let info = self.check_single_value(e)?;
        if info.props.has(Props::IS_MACRO) && matches!(self.ast.exprs[e], Expr::Call { .. }) {
            // `{{ M() }}` on a macro is checked like `{% show M() %}`.
            return self.check_show_macro(e, ctx);
        }
        let ty = if info.is_untyped() {
            self.default_of(e, info)?
        } else {
            info.ty
        };
        if !self.can_show(ty, ctx) {
            return Err(self.error(
                self.epos(e),
                format!(
                    "cannot show {} (type {}) in {} context",
                    self.ast.describe_expr(e),
                    self.reg.describe(ty),
                    ctx
                ),
            ));
        }
        Ok(())
    }

    fn check_show_macro(&mut self, call: ExprId, ctx: Context) -> SResult {
        let (func, _args) = match self.ast.exprs[call] {
            Expr::Call { func, args, .. } => (func, args),
            _ => {
                // `{% show expr %}` with a non-call expression.
                return self.check_show_value(call, ctx);
            }
        };
        let info = self.check_value(call)?;
        self.expr_info.insert(call.raw(), info.clone());
        if !info.props.has(Props::IS_MACRO) {
            // A plain function call: its result is shown like a value.
            let ty = info.ty;
            if let Type::Tuple(_) = self.reg.get(ty) {
                return Err(self.error(
                    self.epos(call),
                    format!(
                        "multiple-value {} in single-value context",
                        self.ast.describe_expr(call)
                    ),
                ));
            }
            if !self.can_show(ty, ctx) {
                return Err(self.error(
                    self.epos(call),
                    format!(
                        "cannot show {} (type {}) in {} context",
                        self.ast.describe_expr(call),
                        self.reg.describe(ty),
                        ctx
                    ),
                ));
            }
            return Ok(());
        }
        // A macro of format F may only be shown in a context of format F.
        let finfo = self.expr_info.get(&func.raw()).cloned();
        let mformat = match finfo.map(|i| i.ty).map(|t| self.reg.get(t).clone()) {
            Some(Type::Macro(m)) => m.format,
            _ => match self.reg.format_of(info.ty) {
                Some(f) => f,
                None => crate::fs::Format::Text,
            },
        };
        if mformat != ctx.format() {
            return Err(self.error(
                self.epos(call),
                format!(
                    "macro {} is defined in a different context ({})",
                    self.ast.describe_expr(func),
                    mformat.name()
                ),
            ));
        }
        Ok(())
    }

    /// A macro declared in a template body: a local value of macro type.
    fn check_local_macro(&mut self, s: StmtId) -> SResult {
        let (name, params, variadic, format) = match self.ast.stmts[s] {
            Stmt::MacroDecl { name, params, variadic, format, .. } => {
                (name, params, variadic, format)
            }
            _ => unreachable!(),
        };
        let ty = self.macro_type(params, variadic, format)?;
        let key = DeclKey::Stmt(s.raw());
        self.decl_types.insert(key, ty);
        let n = self.ast.name(name).to_string();
        let info = TypeInfo {
            ty,
            props: Props::HAS_VALUE.with(Props::IS_MACRO),
            constant: None,
            package: None,
        };
        self.declare(&n, info, Some(Binding::Local(key)), self.spos(s))?;
        self.check_macro_body(s)
    }

    /// A script top-level function declaration (already pre-declared).
    fn check_func_decl_body(&mut self, s: StmtId) -> SResult {
        let (params, results, variadic, body) = match self.ast.stmts[s] {
            Stmt::FuncDecl { params, results, variadic, body, .. } => {
                (params, results, variadic, body)
            }
            _ => unreachable!(),
        };
        let param_list = self.ast.params_of(params).to_vec();
        let result_list = self.ast.params_of(results).to_vec();
        let mut rtypes = Vec::new();
        let mut named_results = false;
        for r in &result_list {
            rtypes.push(self.check_type_expr(r.ty)?);
            if r.name.is_some() {
                named_results = true;
            }
        }
        self.fn_stack.push(super::FnCtx {
            key: Some(FnKey::Decl(s.raw())),
            results: rtypes.clone(),
            named_results,
            is_macro: false,
        });
        self.push_fn_scope();
        for (i, p) in param_list.iter().enumerate() {
            let ty = self.check_type_expr(p.ty)?;
            let ty = if variadic && i + 1 == param_list.len() {
                self.reg.slice(ty)
            } else {
                ty
            };
            let key = DeclKey::StmtParam(s.raw(), i as u16);
            self.decl_types.insert(key, ty);
            if let Some(nm) = p.name {
                let nm = self.ast.name(nm).to_string();
                self.declare(&nm, TypeInfo::addressable(ty), Some(Binding::Local(key)), p.pos)?;
            }
        }
        for (i, r) in result_list.iter().enumerate() {
            if let Some(nm) = r.name {
                let key = DeclKey::StmtParam(s.raw(), (param_list.len() + i) as u16);
                self.decl_types.insert(key, rtypes[i]);
                let nm = self.ast.name(nm).to_string();
                self.declare(
                    &nm,
                    TypeInfo::addressable(rtypes[i]),
                    Some(Binding::Local(key)),
                    r.pos,
                )?;
            }
        }
        self.check_stmt(body)?;
        self.pop_scope()?;
        self.fn_stack.pop();
        Ok(())
    }

    /// Pre-declares script top-level functions so calls may precede the
    /// declaration.
    pub(crate) fn predeclare_script_funcs(&mut self, nodes: &[StmtId]) -> SResult {
        for &s in nodes {
            if let Stmt::FuncDecl { name, params, results, variadic, .. } = self.ast.stmts[s] {
                let param_list = self.ast.params_of(params).to_vec();
                let result_list = self.ast.params_of(results).to_vec();
                let mut ptypes = Vec::new();
                for (i, p) in param_list.iter().enumerate() {
                    let ty = self.check_type_expr(p.ty)?;
                    let ty = if variadic && i + 1 == param_list.len() {
                        self.reg.slice(ty)
                    } else {
                        ty
                    };
                    ptypes.push(ty);
                }
                let mut rtypes = Vec::new();
                for r in &result_list {
                    rtypes.push(self.check_type_expr(r.ty)?);
                }
                let fty = self.reg.func(ptypes, rtypes, variadic);
                let idx = self.globals.len() as u32;
                let n = self.ast.name(name).to_string();
                self.globals.push(super::GlobalDecl {
                    name: n.clone(),
                    ty: fty,
                    init: GlobalInit::Closure(s),
                    host: false,
                });
                self.declare(
                    &n,
                    TypeInfo::value(fty),
                    Some(Binding::Global(idx)),
                    self.spos(s),
                )?;
            }
        }
        Ok(())
    }
}
