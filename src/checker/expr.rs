//! Expression checking and constant folding.

use crate::ast::{BinOp, ChanDir, Expr, ExprId, ListRef, TypeExpr, TypeExprId, UnOp};
use crate::error::BuildError;
use crate::fs::Format;
use crate::types::{self, FuncType, StructField, Type, TypeId};

use super::consts::{self, Constant};
use super::{Binding, Builtin, Checker, DeclKey, FnKey, Props, TypeInfo};

type CResult = Result<TypeInfo, BuildError>;

impl Checker<'_> {
    /// Checks an expression and records its type information.
    pub(crate) fn check_expr(&mut self, e: ExprId) -> CResult {
        let info = self.check_expr_inner(e)?;
        self.expr_info.insert(e.raw(), info.clone());
        Ok(info)
    }

    /// Checks an expression that must denote a value.
    pub(crate) fn check_value(&mut self, e: ExprId) -> CResult {
        let info = self.check_expr(e)?;
        if info.is_type() {
            return Err(self.error(
                self.epos(e),
                format!("type {} is not an expression", self.reg.describe(info.ty)),
            ));
        }
        if info.is_package() {
            return Err(self.error(
                self.epos(e),
                format!("use of package {} without selector", self.ast.describe_expr(e)),
            ));
        }
        if info.is_builtin() {
            return Err(self.error(
                self.epos(e),
                format!("use of builtin {} not in function call", self.ast.describe_expr(e)),
            ));
        }
        if let Expr::Ident(sym) = self.ast.exprs[e] {
            if self.ast.name(sym) == "_" {
                return Err(self.error(self.epos(e), "cannot use _ as value"));
            }
        }
        Ok(info)
    }

    /// Checks an expression that must denote a single value (not a
    /// multi-value call).
    pub(crate) fn check_single_value(&mut self, e: ExprId) -> CResult {
        let info = self.check_value(e)?;
        if let Type::Tuple(elems) = self.reg.get(info.ty) {
            let n = elems.len();
            return Err(self.error(
                self.epos(e),
                format!("multiple-value {} in single-value context", self.ast.describe_expr(e))
                    + if n == 0 { " (no value)" } else { "" },
            ));
        }
        Ok(info)
    }

    fn check_expr_inner(&mut self, e: ExprId) -> CResult {
        match self.ast.exprs[e] {
            Expr::IntLit(sym) => {
                let lex = self.ast.name(sym).to_string();
                let i = consts::parse_int(&lex)
                    .ok_or_else(|| self.error(self.epos(e), format!("malformed integer literal {lex}")))?;
                Ok(TypeInfo::untyped_const(Constant::Int(i)))
            }
            Expr::FloatLit(sym) => {
                let lex = self.ast.name(sym).to_string();
                let r = consts::parse_float(&lex)
                    .ok_or_else(|| self.error(self.epos(e), format!("malformed float literal {lex}")))?;
                Ok(TypeInfo::untyped_const(Constant::Float(r)))
            }
            Expr::ImagLit(sym) => {
                let lex = self.ast.name(sym).to_string();
                let c = consts::parse_imag(&lex)
                    .ok_or_else(|| self.error(self.epos(e), format!("malformed imaginary literal {lex}")))?;
                Ok(TypeInfo::untyped_const(c))
            }
            Expr::RuneLit(c) => {
                Ok(TypeInfo::untyped_const(Constant::Rune((c as u32).into())))
            }
            Expr::StringLit(sym) => {
                let s = self.ast.name(sym).to_string();
                Ok(TypeInfo::untyped_const(Constant::Str(s)))
            }
            Expr::Ident(sym) => {
                let name = self.ast.name(sym).to_string();
                if name == "_" {
                    // Valid only in assignment positions, which handle it
                    // before checking.
                    return Err(self.error(self.epos(e), "cannot use _ as value"));
                }
                if name == "iota" {
                    if let Some(i) = self.iota {
                        return Ok(TypeInfo::untyped_const(Constant::Int(i.into())));
                    }
                }
                match self.lookup(&name) {
                    Some((info, binding)) => {
                        if let Some(b) = binding {
                            self.bindings.insert(e.raw(), b);
                        }
                        Ok(info)
                    }
                    None => Err(self.error(self.epos(e), format!("undefined: {name}"))),
                }
            }
            Expr::Unary { op, expr } => self.check_unary(e, op, expr),
            Expr::Binary { op, lhs, rhs } => self.check_binary(e, op, lhs, rhs),
            Expr::Index { expr, index } => self.check_index(e, expr, index),
            Expr::Slice { expr, low, high, max } => self.check_slice(e, expr, low, high, max),
            Expr::Selector { expr, sel } => self.check_selector(e, expr, sel),
            Expr::TypeAssert { expr, ty } => {
                let info = self.check_single_value(expr)?;
                if !self.reg.is_interface(info.ty) {
                    return Err(self.error(
                        self.epos(e),
                        format!(
                            "invalid type assertion: {} (non-interface type {} on left)",
                            self.ast.describe_expr(e),
                            self.reg.describe(info.ty)
                        ),
                    ));
                }
                match ty {
                    Some(t) => {
                        let target = self.check_type_expr(t)?;
                        Ok(TypeInfo::value(target))
                    }
                    None => Err(self.error(
                        self.epos(e),
                        "use of .(type) outside type switch",
                    )),
                }
            }
            Expr::Call { func, args, ellipsis } => self.check_call(e, func, args, ellipsis),
            Expr::Composite { ty, elems } => {
                let t = match ty {
                    Some(t) => self.check_type_expr(t)?,
                    None => {
                        return Err(self.error(
                            self.epos(e),
                            "missing type in composite literal",
                        ))
                    }
                };
                self.check_composite(e, t, elems)
            }
            Expr::FuncLit { params, results, variadic, body } => {
                self.check_func_lit(e, params, results, variadic, body)
            }
            Expr::TypeE(t) => {
                let ty = self.check_type_expr(t)?;
                Ok(TypeInfo::type_name(ty))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Operators
    // ---------------------------------------------------------------------

    fn check_unary(&mut self, e: ExprId, op: UnOp, operand: ExprId) -> CResult {
        // `*T` in expression position denotes a pointer type.
        if op == UnOp::Deref {
            let inner = self.check_expr(operand)?;
            if inner.is_type() {
                let ty = self.reg.ptr(inner.ty);
                return Ok(TypeInfo::type_name(ty));
            }
            return match self.reg.get(self.reg.underlying(inner.ty)) {
                Type::Ptr(elem) => Ok(TypeInfo::addressable(*elem)),
                _ => Err(self.error(
                    self.epos(e),
                    format!(
                        "invalid indirect of {} (type {})",
                        self.ast.describe_expr(operand),
                        self.reg.describe(inner.ty)
                    ),
                )),
            };
        }
        let info = self.check_single_value(operand)?;
        match op {
            UnOp::Neg | UnOp::Pos | UnOp::Not | UnOp::BitNot => {
                if let Some(c) = &info.constant {
                    let folded = consts::unary(op, c).map_err(|m| {
                        self.error(
                            self.epos(e),
                            format!("invalid operation: {} ({m})", self.ast.describe_expr(e)),
                        )
                    })?;
                    return Ok(if info.is_untyped() {
                        TypeInfo::untyped_const(folded)
                    } else {
                        TypeInfo::typed_const(folded, info.ty)
                    });
                }
                let ok = match op {
                    UnOp::Neg | UnOp::Pos => self.reg.is_numeric(info.ty),
                    UnOp::Not => self.reg.is_bool(info.ty),
                    UnOp::BitNot => self.reg.is_integer(info.ty),
                    _ => false,
                };
                if !ok {
                    return Err(self.error(
                        self.epos(e),
                        format!(
                            "invalid operation: {} (operator {} not defined on {})",
                            self.ast.describe_expr(e),
                            op.symbol(),
                            self.reg.describe(info.ty)
                        ),
                    ));
                }
                Ok(TypeInfo::value(info.ty))
            }
            UnOp::Addr => {
                if !info.is_addressable() {
                    return Err(self.error(
                        self.epos(e),
                        format!("cannot take the address of {}", self.ast.describe_expr(operand)),
                    ));
                }
                // An address-taken local lives in a reference cell.
                if let Some(Binding::Local(key)) = self.bindings.get(&operand.raw()).copied() {
                    self.indirect.insert(key);
                }
                let ty = self.reg.ptr(info.ty);
                Ok(TypeInfo::value(ty))
            }
            UnOp::Recv => {
                match self.reg.get(self.reg.underlying(info.ty)) {
                    Type::Chan(dir, elem) => {
                        if *dir == ChanDir::Send {
                            return Err(self.error(
                                self.epos(e),
                                format!(
                                    "invalid operation: {} (receive from send-only type {})",
                                    self.ast.describe_expr(e),
                                    self.reg.describe(info.ty)
                                ),
                            ));
                        }
                        Ok(TypeInfo::value(*elem))
                    }
                    _ => Err(self.error(
                        self.epos(e),
                        format!(
                            "invalid operation: {} (receive from non-chan type {})",
                            self.ast.describe_expr(e),
                            self.reg.describe(info.ty)
                        ),
                    )),
                }
            }
            UnOp::Deref => unreachable!(),
        }
    }

    fn check_binary(&mut self, e: ExprId, op: BinOp, lhs: ExprId, rhs: ExprId) -> CResult {
        let li = self.check_single_value(lhs)?;
        let ri = self.check_single_value(rhs)?;

        // Shifts have their own typing rules: the right operand must be an
        // integer, the left keeps its (possibly untyped) type.
        if matches!(op, BinOp::Shl | BinOp::Shr) {
            return self.check_shift(e, op, lhs, &li, rhs, &ri);
        }
        if op == BinOp::Contains {
            return self.check_contains(e, lhs, &li, rhs, &ri);
        }

        // Both operands constant: fold.
        if let (Some(lc), Some(rc)) = (&li.constant, &ri.constant) {
            if li.is_untyped() && ri.is_untyped() {
                let folded = consts::binary(op, lc, rc).map_err(|m| {
                    self.error(
                        self.epos(e),
                        format!("invalid operation: {} ({m})", self.ast.describe_expr(e)),
                    )
                })?;
                return Ok(TypeInfo::untyped_const(folded));
            }
        }

        // Unify the operand types, materializing untyped sides. nil is
        // handled first: it compares against any nilable type.
        let (lt, rt) = (li.ty, ri.ty);
        let ty = if li.is_nil() || ri.is_nil() {
            // nil comparisons.
            if matches!(op, BinOp::Eq | BinOp::NotEq) {
                let other = if li.is_nil() { rt } else { lt };
                if li.is_nil() && ri.is_nil() {
                    return Err(self.error(
                        self.epos(e),
                        format!(
                            "invalid operation: {} (operator {} not defined on nil)",
                            self.ast.describe_expr(e),
                            op.symbol()
                        ),
                    ));
                }
                if !self.reg.accepts_nil(other) {
                    return Err(self.mismatched(e, lt, rt));
                }
                return Ok(TypeInfo::value(types::BOOL));
            }
            return Err(self.error(
                self.epos(e),
                format!(
                    "invalid operation: {} (operator {} not defined on nil)",
                    self.ast.describe_expr(e),
                    op.symbol()
                ),
            ));
        } else if li.is_untyped() && !ri.is_untyped() {
            self.convert_untyped(lhs, &li, rt)?;
            rt
        } else if ri.is_untyped() && !li.is_untyped() {
            self.convert_untyped(rhs, &ri, lt)?;
            lt
        } else if lt == rt {
            lt
        } else if li.is_untyped() && ri.is_untyped() {
            // Mixed untyped kinds (e.g. untyped bool and untyped int).
            let lc = li.constant.clone();
            let rc = ri.constant.clone();
            match (lc, rc) {
                (Some(lc), Some(rc)) => {
                    let folded = consts::binary(op, &lc, &rc).map_err(|m| {
                        self.error(
                            self.epos(e),
                            format!("invalid operation: {} ({m})", self.ast.describe_expr(e)),
                        )
                    })?;
                    return Ok(TypeInfo::untyped_const(folded));
                }
                _ => {
                    // Untyped non-constants (bool expressions).
                    if self.reg.is_bool(lt) && self.reg.is_bool(rt) {
                        lt
                    } else {
                        return Err(self.mismatched(e, lt, rt));
                    }
                }
            }
        } else {
            // One side assignable to the other (e.g. defined type with
            // identical underlying type is NOT assignable, so this errors).
            if self.reg.assignable(lt, rt) {
                rt
            } else if self.reg.assignable(rt, lt) {
                lt
            } else {
                return Err(self.mismatched(e, lt, rt));
            }
        };

        match op {
            BinOp::LAnd | BinOp::LOr => {
                if !self.reg.is_bool(ty) {
                    return Err(self.not_defined(e, op, ty));
                }
                Ok(TypeInfo::value(ty))
            }
            BinOp::Eq | BinOp::NotEq => {
                if !self.reg.is_comparable(ty) {
                    return Err(self.error(
                        self.epos(e),
                        format!(
                            "invalid operation: {} ({} cannot be compared)",
                            self.ast.describe_expr(e),
                            self.reg.describe(ty)
                        ),
                    ));
                }
                Ok(TypeInfo::value(types::BOOL))
            }
            BinOp::Less | BinOp::LessEq | BinOp::Greater | BinOp::GreaterEq => {
                if !self.reg.is_ordered(ty) {
                    return Err(self.not_defined(e, op, ty));
                }
                Ok(TypeInfo::value(types::BOOL))
            }
            BinOp::Add => {
                if !self.reg.is_numeric(ty) && !self.reg.is_string(ty) {
                    return Err(self.not_defined(e, op, ty));
                }
                Ok(TypeInfo::value(ty))
            }
            BinOp::Sub | BinOp::Mul | BinOp::Div => {
                if !self.reg.is_numeric(ty) {
                    return Err(self.not_defined(e, op, ty));
                }
                Ok(TypeInfo::value(ty))
            }
            BinOp::Rem | BinOp::And | BinOp::Or | BinOp::Xor | BinOp::AndNot => {
                if !self.reg.is_integer(ty) {
                    return Err(self.not_defined(e, op, ty));
                }
                Ok(TypeInfo::value(ty))
            }
            BinOp::Shl | BinOp::Shr | BinOp::Contains => unreachable!(),
        }
    }

    fn check_shift(
        &mut self,
        e: ExprId,
        op: BinOp,
        lhs: ExprId,
        li: &TypeInfo,
        rhs: ExprId,
        ri: &TypeInfo,
    ) -> CResult {
        if let (Some(lc), Some(rc)) = (&li.constant, &ri.constant) {
            if li.is_untyped() {
                let folded = consts::binary(op, lc, rc).map_err(|m| {
                    self.error(
                        self.epos(e),
                        format!("invalid operation: {} ({m})", self.ast.describe_expr(e)),
                    )
                })?;
                return Ok(TypeInfo::untyped_const(folded));
            }
        }
        if !ri.is_untyped() && !self.reg.is_integer(ri.ty) {
            return Err(self.error(
                self.epos(e),
                format!(
                    "invalid operation: {} (shift count type {}, must be integer)",
                    self.ast.describe_expr(e),
                    self.reg.describe(ri.ty)
                ),
            ));
        }
        if ri.is_untyped() {
            self.convert_untyped(rhs, ri, types::UINT)?;
        }
        let lt = if li.is_untyped() {
            self.convert_untyped(lhs, li, types::INT)?;
            types::INT
        } else {
            li.ty
        };
        if !self.reg.is_integer(lt) {
            return Err(self.not_defined(e, op, lt));
        }
        Ok(TypeInfo::value(lt))
    }

    /// `x contains y`: (string, string), (string, rune), (slice/array,
    /// element), (map, key).
    fn check_contains(
        &mut self,
        e: ExprId,
        _lhs: ExprId,
        li: &TypeInfo,
        rhs: ExprId,
        ri: &TypeInfo,
    ) -> CResult {
        if let (Some(lc), Some(rc)) = (&li.constant, &ri.constant) {
            if li.is_untyped() && ri.is_untyped() {
                let folded = consts::binary(BinOp::Contains, lc, rc).map_err(|m| {
                    self.error(
                        self.epos(e),
                        format!("invalid operation: {} ({m})", self.ast.describe_expr(e)),
                    )
                })?;
                return Ok(TypeInfo::untyped_const(folded));
            }
        }
        let lu = self.reg.underlying(li.ty);
        match self.reg.get(lu).clone() {
            Type::Str => {
                if self.reg.is_string(ri.ty) || (ri.is_untyped() && matches!(ri.constant, Some(Constant::Str(_)))) {
                    if ri.is_untyped() {
                        self.convert_untyped(rhs, ri, types::STRING)?;
                    }
                } else if self.reg.is_integer(ri.ty) {
                    if ri.is_untyped() {
                        self.convert_untyped(rhs, ri, types::RUNE)?;
                    }
                } else {
                    return Err(self.not_defined(e, BinOp::Contains, ri.ty));
                }
                Ok(TypeInfo::value(types::BOOL))
            }
            Type::Slice(elem) | Type::Array(_, elem) => {
                self.assign_to(rhs, ri, elem)?;
                if !self.reg.is_comparable(elem) {
                    return Err(self.error(
                        self.epos(e),
                        format!(
                            "invalid operation: {} ({} cannot be compared)",
                            self.ast.describe_expr(e),
                            self.reg.describe(elem)
                        ),
                    ));
                }
                Ok(TypeInfo::value(types::BOOL))
            }
            Type::Map(key, _) => {
                self.assign_to(rhs, ri, key)?;
                Ok(TypeInfo::value(types::BOOL))
            }
            _ => Err(self.not_defined(e, BinOp::Contains, li.ty)),
        }
    }

    fn mismatched(&self, e: ExprId, lt: TypeId, rt: TypeId) -> BuildError {
        self.error(
            self.epos(e),
            format!(
                "invalid operation: {} (mismatched types {} and {})",
                self.ast.describe_expr(e),
                self.reg.describe(lt),
                self.reg.describe(rt)
            ),
        )
    }

    fn not_defined(&self, e: ExprId, op: BinOp, ty: TypeId) -> BuildError {
        self.error(
            self.epos(e),
            format!(
                "invalid operation: {} (operator {} not defined on {})",
                self.ast.describe_expr(e),
                op.symbol(),
                self.reg.describe(ty)
            ),
        )
    }

    // ---------------------------------------------------------------------
    // Untyped materialization
    // ---------------------------------------------------------------------

    /// Converts an untyped expression to `target`, updating its recorded
    /// type information.
    pub(crate) fn convert_untyped(
        &mut self,
        e: ExprId,
        info: &TypeInfo,
        target: TypeId,
    ) -> Result<TypeInfo, BuildError> {
        let new = if info.is_nil() {
            if !self.reg.accepts_nil(target) {
                return Err(self.error(
                    self.epos(e),
                    format!("cannot use nil as type {}", self.reg.describe(target)),
                ));
            }
            TypeInfo::value(target)
        } else if self.reg.is_interface(target) && !self.reg.is_format(target) {
            // Assigning an untyped value to an interface materializes it
            // at its default type.
            let def = match &info.constant {
                Some(c) => c.default_type(),
                None => types::BOOL,
            };
            match &info.constant {
                Some(c) => {
                    let c = consts::representable(&self.reg, c, def)
                        .map_err(|m| self.error(self.epos(e), m))?;
                    TypeInfo::typed_const(c, def)
                }
                None => TypeInfo::value(def),
            }
        } else if let Some(c) = &info.constant {
            let c = consts::representable(&self.reg, c, target)
                .map_err(|m| self.error(self.epos(e), m))?;
            TypeInfo::typed_const(c, target)
        } else {
            // Untyped non-constant (bool).
            if !self.reg.is_bool(target) || !self.reg.is_bool(info.ty) {
                return Err(self.error(
                    self.epos(e),
                    format!(
                        "cannot use {} (type {}) as type {}",
                        self.ast.describe_expr(e),
                        self.reg.describe(info.ty),
                        self.reg.describe(target)
                    ),
                ));
            }
            TypeInfo::value(target)
        };
        self.expr_info.insert(e.raw(), new.clone());
        Ok(new)
    }

    /// Materializes an untyped expression at its default type and returns
    /// the final type.
    pub(crate) fn default_of(&mut self, e: ExprId, info: TypeInfo) -> Result<TypeId, BuildError> {
        if info.is_nil() {
            return Err(self.error(self.epos(e), "use of untyped nil"));
        }
        if info.is_untyped() {
            let target = match &info.constant {
                Some(c) => c.default_type(),
                None => types::BOOL,
            };
            self.convert_untyped(e, &info, target)?;
            return Ok(target);
        }
        Ok(info.ty)
    }

    /// Enforces that the value of `e` is assignable to `target`,
    /// materializing untyped values.
    pub(crate) fn assign_to(
        &mut self,
        e: ExprId,
        info: &TypeInfo,
        target: TypeId,
    ) -> Result<(), BuildError> {
        if info.is_untyped() || info.is_nil() {
            // An untyped string constant converts to any format type.
            self.convert_untyped(e, info, target)?;
            return Ok(());
        }
        if let Type::Tuple(_) = self.reg.get(info.ty) {
            return Err(self.error(
                self.epos(e),
                format!(
                    "multiple-value {} in single-value context",
                    self.ast.describe_expr(e)
                ),
            ));
        }
        if !self.reg.assignable(info.ty, target) {
            return Err(self.error(
                self.epos(e),
                format!(
                    "cannot use {} (type {}) as type {} in assignment",
                    self.ast.describe_expr(e),
                    self.reg.describe(info.ty),
                    self.reg.describe(target)
                ),
            ));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Index, slice, selector
    // ---------------------------------------------------------------------

    fn check_index(&mut self, e: ExprId, expr: ExprId, index: ExprId) -> CResult {
        let base = self.check_single_value(expr)?;
        let iinfo = self.check_single_value(index)?;
        let mut bt = base.ty;
        if let Type::Ptr(elem) = self.reg.get(self.reg.underlying(bt)) {
            if matches!(self.reg.get(self.reg.underlying(*elem)), Type::Array(..)) {
                bt = *elem;
            }
        }
        match self.reg.get(self.reg.underlying(bt)).clone() {
            Type::Str => {
                self.want_integer_index(index, &iinfo)?;
                Ok(TypeInfo::value(types::BYTE))
            }
            Type::Slice(elem) => {
                self.want_integer_index(index, &iinfo)?;
                Ok(TypeInfo::addressable(elem))
            }
            Type::Array(_, elem) => {
                self.want_integer_index(index, &iinfo)?;
                if base.is_addressable() {
                    Ok(TypeInfo::addressable(elem))
                } else {
                    Ok(TypeInfo::value(elem))
                }
            }
            Type::Map(key, value) => {
                self.assign_to(index, &iinfo, key).map_err(|_| {
                    self.error(
                        self.epos(e),
                        format!(
                            "cannot use {} (type {}) as type {} in map index",
                            self.ast.describe_expr(index),
                            self.reg.describe(iinfo.ty),
                            self.reg.describe(key)
                        ),
                    )
                })?;
                Ok(TypeInfo::value(value))
            }
            _ => Err(self.error(
                self.epos(e),
                format!(
                    "invalid operation: {} (type {} does not support indexing)",
                    self.ast.describe_expr(e),
                    self.reg.describe(base.ty)
                ),
            )),
        }
    }

    fn want_integer_index(&mut self, index: ExprId, info: &TypeInfo) -> Result<(), BuildError> {
        if info.is_untyped() {
            self.convert_untyped(index, info, types::INT)?;
            return Ok(());
        }
        if !self.reg.is_integer(info.ty) {
            return Err(self.error(
                self.epos(index),
                format!(
                    "index {} must be integer, not {}",
                    self.ast.describe_expr(index),
                    self.reg.describe(info.ty)
                ),
            ));
        }
        Ok(())
    }

    fn check_slice(
        &mut self,
        e: ExprId,
        expr: ExprId,
        low: Option<ExprId>,
        high: Option<ExprId>,
        max: Option<ExprId>,
    ) -> CResult {
        let base = self.check_single_value(expr)?;
        for idx in [low, high, max].into_iter().flatten() {
            let info = self.check_single_value(idx)?;
            self.want_integer_index(idx, &info)?;
        }
        match self.reg.get(self.reg.underlying(base.ty)).clone() {
            Type::Str => {
                if max.is_some() {
                    return Err(self.error(
                        self.epos(e),
                        "invalid operation: 3-index slice of string",
                    ));
                }
                Ok(TypeInfo::value(base.ty))
            }
            Type::Slice(_) => Ok(TypeInfo::value(base.ty)),
            Type::Array(_, elem) => {
                if !base.is_addressable() {
                    return Err(self.error(
                        self.epos(e),
                        format!(
                            "invalid operation: {} (slice of unaddressable value)",
                            self.ast.describe_expr(e)
                        ),
                    ));
                }
                let ty = self.reg.slice(elem);
                Ok(TypeInfo::value(ty))
            }
            _ => Err(self.error(
                self.epos(e),
                format!(
                    "cannot slice {} (type {})",
                    self.ast.describe_expr(expr),
                    self.reg.describe(base.ty)
                ),
            )),
        }
    }

    fn check_selector(&mut self, e: ExprId, expr: ExprId, sel: crate::ast::Symbol) -> CResult {
        let sel_name = self.ast.name(sel).to_string();
        let base = self.check_expr(expr)?;

        // Package selector.
        if base.is_package() {
            let pkg = base.package.expect("package index") as usize;
            let entry = self.pkgs[pkg].entries.get(&sel_name).cloned();
            match entry {
                Some(entry) => {
                    if let Some(b) = entry.binding {
                        self.bindings.insert(e.raw(), b);
                        if let Binding::Global(g) = b {
                            if self.globals[g as usize].host {
                                self.used_host_vars
                                    .insert(self.globals[g as usize].name.clone());
                            }
                        }
                    }
                    Ok(entry.info)
                }
                None => Err(self.error(
                    self.epos(e),
                    format!("undefined: {}", self.ast.describe_expr(e)),
                )),
            }
        } else if base.is_type() {
            Err(self.error(
                self.epos(e),
                format!(
                    "{} undefined (type {} has no method {})",
                    self.ast.describe_expr(e),
                    self.reg.describe(base.ty),
                    sel_name
                ),
            ))
        } else {
            // Field or method, with one automatic pointer dereference.
            let mut bt = base.ty;
            if let Type::Ptr(elem) = self.reg.get(self.reg.underlying(bt)) {
                bt = *elem;
            }
            if let Some((_path, fty)) = self.reg.lookup_field(bt, &sel_name) {
                return Ok(if base.is_addressable() {
                    TypeInfo::addressable(fty)
                } else {
                    TypeInfo::value(fty)
                });
            }
            if let Some(m) = self.reg.lookup_method(bt, &sel_name) {
                return Ok(TypeInfo::value(m.sig));
            }
            Err(self.error(
                self.epos(e),
                format!(
                    "{} undefined (type {} has no field or method {})",
                    self.ast.describe_expr(e),
                    self.reg.describe(base.ty),
                    sel_name
                ),
            ))
        }
    }

    // ---------------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------------

    fn check_call(&mut self, e: ExprId, func: ExprId, args: ListRef, ellipsis: bool) -> CResult {
        let finfo = self.check_expr(func)?;

        // Builtins.
        if finfo.is_builtin() {
            let b = match self.bindings.get(&func.raw()) {
                Some(Binding::Builtin(b)) => *b,
                _ => unreachable!("builtin without binding"),
            };
            return self.check_builtin(e, b, args, ellipsis);
        }

        // Conversion.
        if finfo.is_type() {
            let arg_list = self.ast.exprs_of(args).to_vec();
            if arg_list.len() != 1 {
                return Err(self.error(
                    self.epos(e),
                    format!(
                        "{} arguments to conversion to {}",
                        if arg_list.len() < 1 { "missing" } else { "too many" },
                        self.reg.describe(finfo.ty)
                    ),
                ));
            }
            return self.check_conversion(e, finfo.ty, arg_list[0]);
        }

        let arg_list = self.ast.exprs_of(args).to_vec();
        match self.reg.get(self.reg.underlying(finfo.ty)).clone() {
            Type::Func(ft) => {
                self.check_call_args(e, func, &ft.params, ft.variadic, &arg_list, ellipsis)?;
                let ty = match ft.results.len() {
                    0 => self.reg.tuple(Vec::new()),
                    1 => ft.results[0],
                    _ => self.reg.tuple(ft.results.clone()),
                };
                Ok(TypeInfo::value(ty))
            }
            Type::Macro(mt) => {
                self.check_call_args(e, func, &mt.params, mt.variadic, &arg_list, ellipsis)?;
                // A macro invocation renders; its "value" is the declared
                // format string type, only meaningful inside `show`.
                let ty = self
                    .reg
                    .format_type(mt.format)
                    .unwrap_or(types::STRING);
                let mut info = TypeInfo::value(ty);
                info.props = info.props.with(Props::IS_MACRO);
                Ok(info)
            }
            _ => Err(self.error(
                self.epos(e),
                format!(
                    "cannot call non-function {} (type {})",
                    self.ast.describe_expr(func),
                    self.reg.describe(finfo.ty)
                ),
            )),
        }
    }

    fn check_call_args(
        &mut self,
        e: ExprId,
        func: ExprId,
        params: &[TypeId],
        variadic: bool,
        args: &[ExprId],
        ellipsis: bool,
    ) -> Result<(), BuildError> {
        let fname = self.ast.describe_expr(func);
        if ellipsis && !variadic {
            return Err(self.error(
                self.epos(e),
                format!("invalid use of ... in call to {fname}"),
            ));
        }
        let fixed = if variadic { params.len() - 1 } else { params.len() };
        if args.len() < fixed {
            return Err(self.error(self.epos(e), format!("not enough arguments in call to {fname}")));
        }
        if !variadic && args.len() > params.len() {
            return Err(self.error(self.epos(e), format!("too many arguments in call to {fname}")));
        }
        for (i, &arg) in args.iter().enumerate() {
            let info = self.check_single_value(arg)?;
            let want = if i < fixed {
                params[i]
            } else if ellipsis {
                // `f(xs...)`: the argument must be the variadic slice.
                params[fixed]
            } else {
                match self.reg.get(self.reg.underlying(params[fixed])).clone() {
                    Type::Slice(elem) => elem,
                    _ => params[fixed],
                }
            };
            self.assign_to(arg, &info, want).map_err(|_| {
                self.error(
                    self.epos(arg),
                    format!(
                        "cannot use {} (type {}) as type {} in argument to {}",
                        self.ast.describe_expr(arg),
                        self.reg.describe(info.ty),
                        self.reg.describe(want),
                        fname
                    ),
                )
            })?;
        }
        if ellipsis && args.len() != fixed + 1 {
            return Err(self.error(
                self.epos(e),
                format!("too many arguments in call to {fname}"),
            ));
        }
        Ok(())
    }

    fn check_conversion(&mut self, e: ExprId, target: TypeId, arg: ExprId) -> CResult {
        let info = self.check_single_value(arg)?;
        if info.is_untyped() {
            if let Some(c) = &info.constant {
                // Integer to string conversion of a constant yields the
                // rune's string.
                if self.reg.is_string(target) && !self.reg.is_format(target) {
                    if let Constant::Int(i) | Constant::Rune(i) = c {
                        use num_traits::ToPrimitive;
                        let ch = i
                            .to_u32()
                            .and_then(char::from_u32)
                            .unwrap_or('\u{FFFD}');
                        let folded = Constant::Str(ch.to_string());
                        let out = TypeInfo::typed_const(folded, target);
                        return Ok(out);
                    }
                }
                let c = consts::representable(&self.reg, c, target).map_err(|_| {
                    self.error(
                        self.epos(e),
                        format!(
                            "cannot convert {} (type {}) to type {}",
                            self.ast.describe_expr(arg),
                            consts::kind_name(c),
                            self.reg.describe(target)
                        ),
                    )
                })?;
                return Ok(TypeInfo::typed_const(c, target));
            }
            self.convert_untyped(arg, &info, target)?;
            return Ok(TypeInfo::value(target));
        }
        if !self.reg.convertible(info.ty, target) {
            return Err(self.error(
                self.epos(e),
                format!(
                    "cannot convert {} (type {}) to type {}",
                    self.ast.describe_expr(arg),
                    self.reg.describe(info.ty),
                    self.reg.describe(target)
                ),
            ));
        }
        Ok(TypeInfo::value(target))
    }

    fn check_builtin(
        &mut self,
        e: ExprId,
        b: Builtin,
        args: ListRef,
        ellipsis: bool,
    ) -> CResult {
        let args = self.ast.exprs_of(args).to_vec();
        let argc = args.len();
        let wrong = |c: &Self, want: &str| {
            c.error(
                c.epos(e),
                format!(
                    "{} arguments to {} ({want})",
                    if argc < want.split(',').count() { "not enough" } else { "too many" },
                    b.name()
                ),
            )
        };
        let void = self.reg.tuple(Vec::new());
        match b {
            Builtin::Len | Builtin::Cap => {
                if argc != 1 {
                    return Err(wrong(self, "one argument"));
                }
                let info = self.check_single_value(args[0])?;
                // len of a constant string folds.
                if b == Builtin::Len {
                    if let Some(Constant::Str(s)) = &info.constant {
                        return Ok(TypeInfo::untyped_const(Constant::Int(
                            (s.len() as i64).into(),
                        )));
                    }
                }
                let u = self.reg.underlying(info.ty);
                let ok = match self.reg.get(u) {
                    Type::Str => b == Builtin::Len,
                    Type::Slice(_) | Type::Array(..) | Type::Chan(..) => true,
                    Type::Map(..) => b == Builtin::Len,
                    _ => false,
                };
                if !ok && info.is_untyped() {
                    if let Some(Constant::Str(_)) = info.constant {
                        return Ok(TypeInfo::value(types::INT));
                    }
                }
                if !ok {
                    return Err(self.error(
                        self.epos(e),
                        format!(
                            "invalid argument {} (type {}) for {}",
                            self.ast.describe_expr(args[0]),
                            self.reg.describe(info.ty),
                            b.name()
                        ),
                    ));
                }
                Ok(TypeInfo::value(types::INT))
            }
            Builtin::Append => {
                if argc == 0 {
                    return Err(wrong(self, "at least one argument"));
                }
                let sinfo = self.check_single_value(args[0])?;
                let elem = match self.reg.get(self.reg.underlying(sinfo.ty)).clone() {
                    Type::Slice(elem) => elem,
                    _ => {
                        return Err(self.error(
                            self.epos(args[0]),
                            format!(
                                "first argument to append must be slice; have {}",
                                self.reg.describe(sinfo.ty)
                            ),
                        ))
                    }
                };
                if ellipsis {
                    if argc != 2 {
                        return Err(wrong(self, "two arguments"));
                    }
                    let info = self.check_single_value(args[1])?;
                    self.assign_to(args[1], &info, sinfo.ty).map_err(|_| {
                        self.error(
                            self.epos(args[1]),
                            format!(
                                "cannot use {} (type {}) as type {} in append",
                                self.ast.describe_expr(args[1]),
                                self.reg.describe(info.ty),
                                self.reg.describe(sinfo.ty)
                            ),
                        )
                    })?;
                } else {
                    for &a in &args[1..] {
                        let info = self.check_single_value(a)?;
                        self.assign_to(a, &info, elem).map_err(|_| {
                            self.error(
                                self.epos(a),
                                format!(
                                    "cannot use {} (type {}) as type {} in append",
                                    self.ast.describe_expr(a),
                                    self.reg.describe(info.ty),
                                    self.reg.describe(elem)
                                ),
                            )
                        })?;
                    }
                }
                Ok(TypeInfo::value(sinfo.ty))
            }
            Builtin::Copy => {
                if argc != 2 {
                    return Err(wrong(self, "two arguments"));
                }
                let dst = self.check_single_value(args[0])?;
                let src = self.check_single_value(args[1])?;
                let delem = match self.reg.get(self.reg.underlying(dst.ty)) {
                    Type::Slice(e) => *e,
                    _ => {
                        return Err(self.error(
                            self.epos(args[0]),
                            "arguments to copy must be slices",
                        ))
                    }
                };
                let ok = match self.reg.get(self.reg.underlying(src.ty)) {
                    Type::Slice(e) => *e == delem,
                    Type::Str => delem == types::BYTE,
                    _ => false,
                };
                if !ok {
                    return Err(self.error(
                        self.epos(e),
                        format!(
                            "arguments to copy have different element types: {} and {}",
                            self.reg.describe(dst.ty),
                            self.reg.describe(src.ty)
                        ),
                    ));
                }
                Ok(TypeInfo::value(types::INT))
            }
            Builtin::Delete => {
                if argc != 2 {
                    return Err(wrong(self, "two arguments"));
                }
                let m = self.check_single_value(args[0])?;
                let key = self.check_single_value(args[1])?;
                match self.reg.get(self.reg.underlying(m.ty)).clone() {
                    Type::Map(k, _) => {
                        self.assign_to(args[1], &key, k).map_err(|_| {
                            self.error(
                                self.epos(args[1]),
                                format!(
                                    "cannot use {} (type {}) as type {} in delete",
                                    self.ast.describe_expr(args[1]),
                                    self.reg.describe(key.ty),
                                    self.reg.describe(k)
                                ),
                            )
                        })?;
                        Ok(TypeInfo::value(void))
                    }
                    _ => Err(self.error(
                        self.epos(args[0]),
                        format!(
                            "first argument to delete must be map; have {}",
                            self.reg.describe(m.ty)
                        ),
                    )),
                }
            }
            Builtin::Make => {
                if argc == 0 {
                    return Err(wrong(self, "at least one argument"));
                }
                let ty = self.type_in_expr(args[0])?;
                let u = self.reg.underlying(ty);
                let max_args = match self.reg.get(u) {
                    Type::Slice(_) => 3,
                    Type::Map(..) | Type::Chan(..) => 2,
                    _ => {
                        return Err(self.error(
                            self.epos(args[0]),
                            format!("cannot make type {}", self.reg.describe(ty)),
                        ))
                    }
                };
                let min_args = if matches!(self.reg.get(u), Type::Slice(_)) { 2 } else { 1 };
                if argc < min_args {
                    return Err(self.error(
                        self.epos(e),
                        format!("missing len argument to make({})", self.reg.describe(ty)),
                    ));
                }
                if argc > max_args {
                    return Err(wrong(self, "fewer arguments"));
                }
                for &a in &args[1..] {
                    let info = self.check_single_value(a)?;
                    self.want_integer_index(a, &info)?;
                }
                Ok(TypeInfo::value(ty))
            }
            Builtin::New => {
                if argc != 1 {
                    return Err(wrong(self, "one argument"));
                }
                let ty = self.type_in_expr(args[0])?;
                let p = self.reg.ptr(ty);
                Ok(TypeInfo::value(p))
            }
            Builtin::Panic => {
                if argc != 1 {
                    return Err(wrong(self, "one argument"));
                }
                let info = self.check_single_value(args[0])?;
                if info.is_untyped() {
                    self.default_of(args[0], info)?;
                }
                Ok(TypeInfo::value(void))
            }
            Builtin::Recover => {
                if argc != 0 {
                    return Err(wrong(self, "no arguments"));
                }
                Ok(TypeInfo::value(types::ANY))
            }
            Builtin::Print | Builtin::Println => {
                for &a in &args {
                    let info = self.check_single_value(a)?;
                    if info.is_untyped() {
                        self.default_of(a, info)?;
                    }
                }
                Ok(TypeInfo::value(void))
            }
            Builtin::Close => {
                if argc != 1 {
                    return Err(wrong(self, "one argument"));
                }
                let info = self.check_single_value(args[0])?;
                match self.reg.get(self.reg.underlying(info.ty)) {
                    Type::Chan(dir, _) => {
                        if *dir == ChanDir::Recv {
                            return Err(self.error(
                                self.epos(e),
                                format!(
                                    "invalid operation: {} (cannot close receive-only channel)",
                                    self.ast.describe_expr(e)
                                ),
                            ));
                        }
                        Ok(TypeInfo::value(void))
                    }
                    _ => Err(self.error(
                        self.epos(args[0]),
                        format!(
                            "invalid operation: {} (non-chan type {})",
                            self.ast.describe_expr(e),
                            self.reg.describe(info.ty)
                        ),
                    )),
                }
            }
            Builtin::Complex => {
                if argc != 2 {
                    return Err(wrong(self, "two arguments"));
                }
                for &a in &args {
                    let info = self.check_single_value(a)?;
                    if info.is_untyped() {
                        self.convert_untyped(a, &info, types::FLOAT64)?;
                    } else if !self.reg.is_float(info.ty) {
                        return Err(self.error(
                            self.epos(a),
                            format!(
                                "invalid argument {} (type {}) for complex",
                                self.ast.describe_expr(a),
                                self.reg.describe(info.ty)
                            ),
                        ));
                    }
                }
                Ok(TypeInfo::value(types::COMPLEX128))
            }
            Builtin::Real | Builtin::Imag => {
                if argc != 1 {
                    return Err(wrong(self, "one argument"));
                }
                let info = self.check_single_value(args[0])?;
                if info.is_untyped() {
                    self.convert_untyped(args[0], &info, types::COMPLEX128)?;
                } else if !self.reg.is_complex(info.ty) {
                    return Err(self.error(
                        self.epos(args[0]),
                        format!(
                            "invalid argument {} (type {}) for {}",
                            self.ast.describe_expr(args[0]),
                            self.reg.describe(info.ty),
                            b.name()
                        ),
                    ));
                }
                Ok(TypeInfo::value(types::FLOAT64))
            }
            Builtin::Exit => {
                if argc != 1 {
                    return Err(wrong(self, "one argument"));
                }
                let info = self.check_single_value(args[0])?;
                if info.is_untyped() {
                    self.convert_untyped(args[0], &info, types::INT)?;
                } else if !self.reg.is_integer(info.ty) {
                    return Err(self.error(
                        self.epos(args[0]),
                        "argument to exit must be an integer",
                    ));
                }
                Ok(TypeInfo::value(void))
            }
        }
    }

    /// Checks an expression that must denote a type (e.g. `make`'s first
    /// argument).
    pub(crate) fn type_in_expr(&mut self, e: ExprId) -> Result<TypeId, BuildError> {
        let info = self.check_expr(e)?;
        if !info.is_type() {
            return Err(self.error(
                self.epos(e),
                format!("{} is not a type", self.ast.describe_expr(e)),
            ));
        }
        Ok(info.ty)
    }

    // ---------------------------------------------------------------------
    // Composite literals
    // ---------------------------------------------------------------------

    fn check_composite(&mut self, e: ExprId, ty: TypeId, elems: ListRef) -> CResult {
        let elems = self.ast.elements_of(elems).to_vec();
        match self.reg.get(self.reg.underlying(ty)).clone() {
            Type::Slice(elem) => {
                for el in &elems {
                    if let Some(k) = el.key {
                        let ki = self.check_single_value(k)?;
                        self.want_integer_index(k, &ki)?;
                        if !self
                            .expr_info
                            .get(&k.raw())
                            .map(|i| i.is_const())
                            .unwrap_or(false)
                        {
                            return Err(self.error(
                                self.epos(k),
                                "index in slice literal must be constant",
                            ));
                        }
                    }
                    self.check_composite_value(el.value, elem)?;
                }
                Ok(TypeInfo::value(ty))
            }
            Type::Array(len, elem) => {
                if elems.len() as i64 > len {
                    return Err(self.error(
                        self.epos(e),
                        format!("array index {} out of bounds [0:{}]", elems.len() - 1, len),
                    ));
                }
                for el in &elems {
                    self.check_composite_value(el.value, elem)?;
                }
                Ok(TypeInfo::value(ty))
            }
            Type::Map(key, value) => {
                for el in &elems {
                    match el.key {
                        Some(k) => {
                            let ki = self.check_single_value(k)?;
                            self.assign_to(k, &ki, key)?;
                        }
                        None => {
                            return Err(self.error(
                                self.epos(el.value),
                                "missing key in map literal",
                            ))
                        }
                    }
                    self.check_composite_value(el.value, value)?;
                }
                Ok(TypeInfo::value(ty))
            }
            Type::Struct(fields) => {
                let keyed = elems.iter().any(|el| el.key.is_some());
                if keyed {
                    for el in &elems {
                        let k = el.key.ok_or_else(|| {
                            self.error(
                                self.epos(e),
                                "mixture of field:value and value initializers",
                            )
                        })?;
                        let name = match self.ast.exprs[k] {
                            Expr::Ident(sym) => self.ast.name(sym).to_string(),
                            _ => {
                                return Err(self.error(
                                    self.epos(k),
                                    "invalid field name in struct literal",
                                ))
                            }
                        };
                        let field = fields.iter().find(|f| f.name == name).ok_or_else(|| {
                            self.error(
                                self.epos(k),
                                format!(
                                    "unknown field '{name}' in struct literal of type {}",
                                    self.reg.describe(ty)
                                ),
                            )
                        })?;
                        self.check_composite_value(el.value, field.ty)?;
                    }
                } else if !elems.is_empty() {
                    if elems.len() != fields.len() {
                        return Err(self.error(
                            self.epos(e),
                            format!(
                                "{} values in struct literal of type {} (expected {})",
                                elems.len(),
                                self.reg.describe(ty),
                                fields.len()
                            ),
                        ));
                    }
                    for (el, f) in elems.iter().zip(fields.iter()) {
                        self.check_composite_value(el.value, f.ty)?;
                    }
                }
                Ok(TypeInfo::value(ty))
            }
            _ => Err(self.error(
                self.epos(e),
                format!(
                    "invalid type for composite literal: {}",
                    self.reg.describe(ty)
                ),
            )),
        }
    }

    /// Checks one element of a composite literal, supplying the elided
    /// element type to nested literals.
    fn check_composite_value(&mut self, v: ExprId, want: TypeId) -> Result<(), BuildError> {
        if let Expr::Composite { ty: None, elems } = self.ast.exprs[v] {
            let info = self.check_composite(v, want, elems)?;
            self.expr_info.insert(v.raw(), info);
            return Ok(());
        }
        let info = self.check_single_value(v)?;
        self.assign_to(v, &info, want)
    }

    // ---------------------------------------------------------------------
    // Function literals
    // ---------------------------------------------------------------------

    fn check_func_lit(
        &mut self,
        e: ExprId,
        params: ListRef,
        results: ListRef,
        variadic: bool,
        body: crate::ast::StmtId,
    ) -> CResult {
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
        let mut named_results = false;
        for r in &result_list {
            rtypes.push(self.check_type_expr(r.ty)?);
            if r.name.is_some() {
                named_results = true;
            }
        }
        let fty = self.reg.intern(Type::Func(FuncType {
            params: ptypes.clone(),
            results: rtypes.clone(),
            variadic,
        }));

        self.fn_stack.push(super::FnCtx {
            key: Some(FnKey::Lit(e.raw())),
            results: rtypes.clone(),
            named_results,
            is_macro: false,
        });
        self.push_fn_scope();
        for (i, p) in param_list.iter().enumerate() {
            let key = DeclKey::ExprParam(e.raw(), i as u16);
            self.decl_types.insert(key, ptypes[i]);
            if let Some(name) = p.name {
                let name = self.ast.name(name).to_string();
                self.declare(
                    &name,
                    TypeInfo::addressable(ptypes[i]),
                    Some(Binding::Local(key)),
                    p.pos,
                )?;
            }
        }
        for (i, r) in result_list.iter().enumerate() {
            if let Some(name) = r.name {
                let key = DeclKey::ExprParam(e.raw(), (param_list.len() + i) as u16);
                self.decl_types.insert(key, rtypes[i]);
                let name = self.ast.name(name).to_string();
                self.declare(
                    &name,
                    TypeInfo::addressable(rtypes[i]),
                    Some(Binding::Local(key)),
                    r.pos,
                )?;
            }
        }
        self.check_stmt(body)?;
        self.pop_scope()?;
        self.fn_stack.pop();
        Ok(TypeInfo::value(fty))
    }

    // ---------------------------------------------------------------------
    // Type expressions
    // ---------------------------------------------------------------------

    pub(crate) fn check_type_expr(&mut self, t: TypeExprId) -> Result<TypeId, BuildError> {
        let ty = self.check_type_expr_inner(t)?;
        self.type_denote.insert(t.raw(), ty);
        Ok(ty)
    }

    fn check_type_expr_inner(&mut self, t: TypeExprId) -> Result<TypeId, BuildError> {
        let pos = self.ast.types.pos(t);
        match self.ast.types[t] {
            TypeExpr::Name(sym) => {
                let name = self.ast.name(sym).to_string();
                match self.lookup(&name) {
                    Some((info, _)) if info.is_type() => Ok(info.ty),
                    Some(_) => Err(self.error(pos, format!("{name} is not a type"))),
                    None => Err(self.error(pos, format!("undefined: {name}"))),
                }
            }
            TypeExpr::Qualified { pkg, name } => {
                let pkg_name = self.ast.name(pkg).to_string();
                let sel = self.ast.name(name).to_string();
                match self.lookup(&pkg_name) {
                    Some((info, _)) if info.is_package() => {
                        let p = info.package.expect("package index") as usize;
                        match self.pkgs[p].entries.get(&sel) {
                            Some(e) if e.info.is_type() => Ok(e.info.ty),
                            Some(_) => {
                                Err(self.error(pos, format!("{pkg_name}.{sel} is not a type")))
                            }
                            None => Err(self.error(pos, format!("undefined: {pkg_name}.{sel}"))),
                        }
                    }
                    Some(_) => Err(self.error(pos, format!("{pkg_name} is not a package"))),
                    None => Err(self.error(pos, format!("undefined: {pkg_name}"))),
                }
            }
            TypeExpr::Ptr(elem) => {
                let e = self.check_type_expr(elem)?;
                Ok(self.reg.ptr(e))
            }
            TypeExpr::Slice(elem) => {
                let e = self.check_type_expr(elem)?;
                Ok(self.reg.slice(e))
            }
            TypeExpr::Array { len, elem } => {
                let e = self.check_type_expr(elem)?;
                let n = match len {
                    Some(l) => {
                        let info = self.check_single_value(l)?;
                        match info.constant.as_ref().and_then(|c| c.to_i64()) {
                            Some(n) if n >= 0 => n,
                            _ => {
                                return Err(self.error(
                                    self.epos(l),
                                    "array length must be a non-negative integer constant",
                                ))
                            }
                        }
                    }
                    None => {
                        return Err(self.error(pos, "invalid use of [...] array outside literal"))
                    }
                };
                Ok(self.reg.array(n, e))
            }
            TypeExpr::Map { key, value } => {
                let k = self.check_type_expr(key)?;
                if !self.reg.is_comparable(k) {
                    return Err(self.error(
                        pos,
                        format!("invalid map key type {}", self.reg.describe(k)),
                    ));
                }
                let v = self.check_type_expr(value)?;
                Ok(self.reg.map(k, v))
            }
            TypeExpr::Chan { dir, elem } => {
                let e = self.check_type_expr(elem)?;
                Ok(self.reg.chan(dir, e))
            }
            TypeExpr::Func { params, results, variadic } => {
                let params = self.ast.params_of(params).to_vec();
                let results = self.ast.params_of(results).to_vec();
                let mut ptypes = Vec::new();
                for (i, p) in params.iter().enumerate() {
                    let ty = self.check_type_expr(p.ty)?;
                    let ty =
                        if variadic && i + 1 == params.len() { self.reg.slice(ty) } else { ty };
                    ptypes.push(ty);
                }
                let mut rtypes = Vec::new();
                for r in &results {
                    rtypes.push(self.check_type_expr(r.ty)?);
                }
                Ok(self.reg.func(ptypes, rtypes, variadic))
            }
            TypeExpr::Struct { fields } => {
                let fields = self.ast.fields_of(fields).to_vec();
                let mut out = Vec::new();
                for f in &fields {
                    let ty = self.check_type_expr(f.ty)?;
                    match f.name {
                        Some(sym) => out.push(StructField {
                            name: self.ast.name(sym).to_string(),
                            ty,
                            embedded: false,
                        }),
                        None => {
                            // Embedded field: must be a (pointer to a)
                            // defined type.
                            out.push(StructField { name: String::new(), ty, embedded: true });
                        }
                    }
                }
                Ok(self.reg.intern(Type::Struct(out)))
            }
            TypeExpr::Interface { methods } => {
                let methods = self.ast.methods_of(methods).to_vec();
                let mut out = Vec::new();
                for m in &methods {
                    let params = self.ast.params_of(m.params).to_vec();
                    let results = self.ast.params_of(m.results).to_vec();
                    let mut ptypes = Vec::new();
                    for (i, p) in params.iter().enumerate() {
                        let ty = self.check_type_expr(p.ty)?;
                        let ty = if m.variadic && i + 1 == params.len() {
                            self.reg.slice(ty)
                        } else {
                            ty
                        };
                        ptypes.push(ty);
                    }
                    let mut rtypes = Vec::new();
                    for r in &results {
                        rtypes.push(self.check_type_expr(r.ty)?);
                    }
                    let sig = self.reg.func(ptypes, rtypes, m.variadic);
                    out.push(crate::types::MethodSig {
                        name: self.ast.name(m.name).to_string(),
                        sig,
                    });
                }
                out.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(self.reg.intern(Type::Interface(out)))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Show legality
    // ---------------------------------------------------------------------

    /// Reports whether a value of type `ty` may be shown in `ctx`.
    pub(crate) fn can_show(&self, ty: TypeId, ctx: crate::ast::Context) -> bool {
        use crate::ast::Context as C;
        let reg = &self.reg;
        if let Some(f) = reg.format_of(ty) {
            // A format value is shown verbatim in its own context; in an
            // HTML context a Markdown value is converted.
            return match ctx {
                C::Html | C::Markdown => matches!(f, Format::Html | Format::Markdown),
                C::Css | C::CssString => f == Format::Css,
                C::JavaScript | C::JavaScriptString => f == Format::JavaScript,
                C::Json => f == Format::Json,
                C::Text | C::Tag | C::Attribute | C::UnquotedAttribute => true,
            };
        }
        if reg.get(reg.underlying(ty)) == &Type::Interface(Vec::new()) {
            return true;
        }
        let stringlike = reg.is_string(ty);
        let numeric = reg.is_numeric(ty);
        let basic = stringlike || numeric || reg.is_bool(ty);
        match ctx {
            C::Text | C::Tag | C::Attribute | C::UnquotedAttribute | C::Markdown => {
                stringlike
                    || numeric
                    || reg.satisfies(ty, reg.stringer("Stringer"))
                    || (ctx == C::Markdown && reg.satisfies(ty, reg.stringer("MarkdownStringer")))
            }
            C::Html => {
                stringlike
                    || numeric
                    || reg.satisfies(ty, reg.stringer("Stringer"))
                    || reg.satisfies(ty, reg.stringer("HTMLStringer"))
            }
            C::Css | C::CssString => {
                stringlike
                    || numeric
                    || reg.satisfies(ty, reg.stringer("CSSStringer"))
                    || matches!(reg.get(reg.underlying(ty)), Type::Slice(e) if *e == types::BYTE)
            }
            C::JavaScript | C::JavaScriptString | C::Json => {
                let stringer = if ctx == C::Json { "JSONStringer" } else { "JSStringer" };
                basic || reg.satisfies(ty, reg.stringer(stringer)) || self.json_like(ty, 0)
            }
        }
    }

    /// The JSON-style type predicate: numbers, strings, bools, and
    /// slices, maps and structs of such.
    fn json_like(&self, ty: TypeId, depth: u8) -> bool {
        if depth > 8 {
            return false;
        }
        let reg = &self.reg;
        if reg.is_numeric(ty) || reg.is_string(ty) || reg.is_bool(ty) {
            return true;
        }
        match reg.get(reg.underlying(ty)) {
            Type::Interface(ms) => ms.is_empty(),
            Type::Slice(e) => self.json_like(*e, depth + 1),
            Type::Array(_, e) => self.json_like(*e, depth + 1),
            Type::Map(k, v) => reg.is_string(*k) && self.json_like(*v, depth + 1),
            Type::Struct(fields) => fields.iter().all(|f| self.json_like(f.ty, depth + 1)),
            Type::Ptr(e) => self.json_like(*e, depth + 1),
            _ => false,
        }
    }
}
