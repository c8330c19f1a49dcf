//! Expression lowering.

use crate::ast::{BinOp, Expr, ExprId, UnOp};
use crate::checker::consts::Constant;
use crate::checker::{Binding, Builtin, DeclKey, FnKey, GlobalInit, TypeInfo};
use crate::code::{Bank, Cond, Instr, Op, NO_PACKAGE};
use crate::error::{BuildError, Position};
use crate::types::{self, IntKind, Type, TypeId};
use crate::vm::value::{zero_value, Value};

use super::{FnBuilder, Loc};

type EResult = Result<i8, BuildError>;

impl FnBuilder<'_> {
    pub(crate) fn info(&self, e: ExprId) -> &TypeInfo {
        self.em.out.info(e)
    }

    pub(crate) fn ty_of(&self, e: ExprId) -> TypeId {
        self.info(e).ty
    }

    pub(crate) fn bank_of(&self, ty: TypeId) -> Bank {
        Bank::of(self.em.reg, ty)
    }

    fn pos(&self, e: ExprId) -> Position {
        self.em.ast.exprs.pos(e)
    }

    fn dst_or(&mut self, dst: Option<i8>, bank: Bank) -> EResult {
        match dst {
            Some(r) => Ok(r),
            None => self.alloc(bank),
        }
    }

    /// Emits `e` into a register of its bank. When `dst` is given the
    /// result lands there.
    pub(crate) fn emit_expr(&mut self, e: ExprId, dst: Option<i8>) -> EResult {
        let info = self.info(e).clone();
        // Constants load straight from the pools.
        if let Some(c) = &info.constant {
            return self.emit_const(e, c, info.ty, dst);
        }
        if info.is_nil() {
            let d = self.dst_or(dst, Bank::Gen)?;
            let k = self.const_general(Value::Nil)?;
            self.push(Instr::with_k(Op::MoveGeneral, 0, k, d), self.pos(e));
            return Ok(d);
        }
        match self.em.ast.exprs[e] {
            Expr::Ident(_) => self.emit_ident(e, dst),
            Expr::Unary { op, expr } => self.emit_unary(e, op, expr, dst),
            Expr::Binary { op, lhs, rhs } => self.emit_binary(e, op, lhs, rhs, dst),
            Expr::Index { expr, index } => self.emit_index(e, expr, index, dst),
            Expr::Slice { expr, low, high, max } => self.emit_slice(e, expr, low, high, max, dst),
            Expr::Selector { .. } => self.emit_selector(e, dst),
            Expr::TypeAssert { expr, ty } => {
                let target = match ty {
                    Some(t) => self.em.out.denoted(t),
                    None => types::ANY,
                };
                let src = self.emit_expr(expr, None)?;
                let d = self.dst_or(dst, self.bank_of(target))?;
                let ti = self.type_idx(target)?;
                self.push(Instr::new(Op::Assert, src, ti, d), self.pos(e));
                // In single-value context an assertion failure panics.
                let msg = format!(
                    "interface conversion: interface {{}} is not {}",
                    self.em.reg.describe(target)
                );
                self.push(Instr::jump(Op::JmpOk, self.pc() + 3), self.pos(e));
                let k = self.const_general(Value::str(&msg))?;
                let tmp = self.alloc(Bank::Gen)?;
                self.push(Instr::with_k(Op::MoveGeneral, 0, k, tmp), self.pos(e));
                self.push(Instr::new(Op::Panic, tmp, 0, 0), self.pos(e));
                Ok(d)
            }
            Expr::Call { func, args, ellipsis } => {
                let results = self.emit_call(e, func, args, ellipsis)?;
                match results.first() {
                    Some(&(bank, r)) => match dst {
                        Some(d) => {
                            self.move_reg(bank, r, d, self.pos(e));
                            Ok(d)
                        }
                        None => Ok(r),
                    },
                    None => Ok(0),
                }
            }
            Expr::Composite { .. } => self.emit_composite(e, dst),
            Expr::FuncLit { .. } => self.emit_func_lit(e, dst),
            Expr::TypeE(_) => Err(self.err(self.pos(e), "type used as value")),
            Expr::IntLit(_)
            | Expr::FloatLit(_)
            | Expr::ImagLit(_)
            | Expr::RuneLit(_)
            | Expr::StringLit(_) => {
                unreachable!("literal exprs are resolved via info.constant above")
            }
        }
    }

    fn move_reg(&mut self, bank: Bank, src: i8, dst: i8, pos: Position) {
        if src == dst {
            return;
        }
        let op = match bank {
            Bank::Int => Op::MoveInt,
            Bank::Float => Op::MoveFloat,
            Bank::Str => Op::MoveString,
            Bank::Gen => Op::MoveGeneral,
        };
        self.push(Instr::new(op, 0, src, dst), pos);
    }

    fn emit_const(&mut self, e: ExprId, c: &Constant, ty: TypeId, dst: Option<i8>) -> EResult {
        let pos = self.pos(e);
        let bank = self.bank_of(ty);
        let d = self.dst_or(dst, bank)?;
        match bank {
            Bank::Int => {
                let v = match c {
                    Constant::Bool(b) => *b as i64,
                    _ => c.to_i64().ok_or_else(|| {
                        self.err(pos, format!("constant {c} overflows {}", self.em.reg.describe(ty)))
                    })?,
                };
                let k = self.const_int(v)?;
                self.push(Instr::with_k(Op::MoveInt, 0, k, d), pos);
            }
            Bank::Float => {
                let v = c
                    .to_f64()
                    .ok_or_else(|| self.err(pos, format!("constant {c} is not a float")))?;
                let k = self.const_float(v)?;
                self.push(Instr::with_k(Op::MoveFloat, 0, k, d), pos);
            }
            Bank::Str => {
                let v = match c {
                    Constant::Str(s) => s.clone(),
                    _ => c.to_string(),
                };
                let k = self.const_string(&v)?;
                self.push(Instr::with_k(Op::MoveString, 0, k, d), pos);
            }
            Bank::Gen => {
                let v = match c {
                    Constant::Complex(..) => {
                        let (re, im) = c.to_complex_f64().unwrap_or((0.0, 0.0));
                        Value::Complex(re, im)
                    }
                    Constant::Bool(b) => Value::Bool(*b),
                    Constant::Str(s) => Value::str(s),
                    _ => Value::Int(c.to_i64().unwrap_or(0)),
                };
                let k = self.const_general(v)?;
                self.push(Instr::with_k(Op::MoveGeneral, 0, k, d), pos);
            }
        }
        Ok(d)
    }

    fn emit_ident(&mut self, e: ExprId, dst: Option<i8>) -> EResult {
        let pos = self.pos(e);
        let ty = self.ty_of(e);
        let bank = self.bank_of(ty);
        match self.em.out.binding(e) {
            Some(Binding::Local(key)) => self.emit_local_read(key, bank, dst, pos),
            Some(Binding::Global(idx)) => {
                let d = self.dst_or(dst, bank)?;
                self.push(
                    Instr::new(Op::GetVar, bank as u8 as i8, idx as u8 as i8, d),
                    pos,
                );
                Ok(d)
            }
            Some(Binding::Builtin(_)) => Err(self.err(pos, "builtin used as value")),
            None => Err(self.err(pos, "unresolved identifier")),
        }
    }

    pub(crate) fn emit_local_read(
        &mut self,
        key: DeclKey,
        bank: Bank,
        dst: Option<i8>,
        pos: Position,
    ) -> EResult {
        match self.locals.get(&key).copied() {
            Some(Loc::Reg(b, r)) => {
                debug_assert_eq!(b, bank);
                match dst {
                    Some(d) => {
                        self.move_reg(bank, r, d, pos);
                        Ok(d)
                    }
                    None => Ok(r),
                }
            }
            Some(Loc::Cell(cell)) => {
                let d = self.dst_or(dst, bank)?;
                self.push(Instr::new(Op::LoadPtr, cell, bank as u8 as i8, d), pos);
                Ok(d)
            }
            Some(Loc::CVar(idx)) => {
                let cell = self.alloc(Bank::Gen)?;
                self.push(Instr::new(Op::GetCVar, 0, idx as i8, cell), pos);
                let d = self.dst_or(dst, bank)?;
                self.push(Instr::new(Op::LoadPtr, cell, bank as u8 as i8, d), pos);
                Ok(d)
            }
            None => {
                // A capture of the enclosing function that the pre-scan
                // has not mapped: resolve through the capture list.
                match self.cvars.get(&key).copied() {
                    Some(idx) => {
                        self.locals.insert(key, Loc::CVar(idx));
                        self.emit_local_read(key, bank, dst, pos)
                    }
                    None => Err(self.err(pos, "unresolved local")),
                }
            }
        }
    }

    /// Emits `e` boxed into a general register as a value of type `ty`.
    pub(crate) fn emit_boxed(&mut self, e: ExprId, ty: TypeId) -> EResult {
        let src_ty = self.ty_of(e);
        let bank = self.bank_of(src_ty);
        let r = self.emit_expr(e, None)?;
        self.box_reg(bank, r, src_ty, ty, self.pos(e))
    }

    /// Boxes a bank register into the general bank. The boxed value is
    /// tagged with the destination type when it lives in the same bank
    /// (a plain int flowing into a defined int type keeps the defined
    /// type, so assertions and method dispatch observe it); interface
    /// destinations keep the value's own type.
    pub(crate) fn box_reg(
        &mut self,
        bank: Bank,
        r: i8,
        src_ty: TypeId,
        as_ty: TypeId,
        pos: Position,
    ) -> EResult {
        if bank == Bank::Gen {
            return Ok(r);
        }
        let tag = if Bank::of(self.em.reg, as_ty) == bank { as_ty } else { src_ty };
        let d = self.alloc(Bank::Gen)?;
        let ti = self.type_idx(tag)?;
        self.push(Instr::new(Op::Typify, ti, r, d), pos);
        Ok(d)
    }

    /// Emits `e` into the bank `want` expects, boxing or unboxing when
    /// the value's own bank differs (e.g. an int flowing into `any`).
    pub(crate) fn emit_expr_as(&mut self, e: ExprId, want: TypeId) -> EResult {
        let want_bank = self.bank_of(want);
        let src_ty = self.ty_of(e);
        let src_bank = self.bank_of(src_ty);
        let r = self.emit_expr(e, None)?;
        self.coerce_reg(src_bank, r, src_ty, want_bank, self.pos(e))
    }

    /// Moves a value between banks when needed.
    pub(crate) fn coerce_reg(
        &mut self,
        src_bank: Bank,
        r: i8,
        src_ty: TypeId,
        want_bank: Bank,
        pos: Position,
    ) -> EResult {
        if src_bank == want_bank {
            return Ok(r);
        }
        if want_bank == Bank::Gen {
            return self.box_reg(src_bank, r, src_ty, src_ty, pos);
        }
        if src_bank == Bank::Gen {
            return self.unbox_reg(want_bank, r, None, pos);
        }
        Err(self.err(pos, "internal error: incompatible register banks"))
    }

    /// Unboxes a general register into `bank`.
    pub(crate) fn unbox_reg(&mut self, bank: Bank, r: i8, dst: Option<i8>, pos: Position) -> EResult {
        if bank == Bank::Gen {
            return match dst {
                Some(d) => {
                    self.move_reg(Bank::Gen, r, d, pos);
                    Ok(d)
                }
                None => Ok(r),
            };
        }
        let d = self.dst_or(dst, bank)?;
        let op = match bank {
            Bank::Int => Op::UnboxInt,
            Bank::Float => Op::UnboxFloat,
            Bank::Str => Op::UnboxString,
            Bank::Gen => unreachable!(),
        };
        self.push(Instr::new(op, r, 0, d), pos);
        Ok(d)
    }

    // ---------------------------------------------------------------------
    // Operators
    // ---------------------------------------------------------------------

    fn emit_unary(&mut self, e: ExprId, op: UnOp, operand: ExprId, dst: Option<i8>) -> EResult {
        let pos = self.pos(e);
        let ty = self.ty_of(e);
        let bank = self.bank_of(ty);
        match op {
            UnOp::Pos => self.emit_expr(operand, dst),
            UnOp::Neg => {
                let r = self.emit_expr(operand, None)?;
                let d = self.dst_or(dst, bank)?;
                match bank {
                    Bank::Int => {
                        let k = self.const_int(0)?;
                        self.push(Instr::with_k(Op::SubInvInt, r, k, d), pos);
                        self.emit_wrap(ty, d, pos)?;
                    }
                    Bank::Float => {
                        let k = self.const_float(0.0)?;
                        self.push(Instr::with_k(Op::SubInvFloat, r, k, d), pos);
                    }
                    Bank::Gen => {
                        let k = self.const_general(Value::Complex(0.0, 0.0))?;
                        let z = self.alloc(Bank::Gen)?;
                        self.push(Instr::with_k(Op::MoveGeneral, 0, k, z), pos);
                        self.push(Instr::new(Op::SubComplex, z, r, d), pos);
                    }
                    Bank::Str => unreachable!("negation of string"),
                }
                Ok(d)
            }
            UnOp::Not => {
                let r = self.emit_expr(operand, None)?;
                let d = self.dst_or(dst, Bank::Int)?;
                let k = self.const_int(1)?;
                self.push(Instr::with_k(Op::Xor, r, k, d), pos);
                Ok(d)
            }
            UnOp::BitNot => {
                let r = self.emit_expr(operand, None)?;
                let d = self.dst_or(dst, Bank::Int)?;
                let k = self.const_int(-1)?;
                self.push(Instr::with_k(Op::Xor, r, k, d), pos);
                self.emit_wrap(ty, d, pos)?;
                Ok(d)
            }
            UnOp::Deref => {
                let cell = self.emit_expr(operand, None)?;
                let d = self.dst_or(dst, bank)?;
                self.push(Instr::new(Op::LoadPtr, cell, bank as u8 as i8, d), pos);
                Ok(d)
            }
            UnOp::Addr => self.emit_addr(e, operand, dst),
            UnOp::Recv => {
                let ch = self.emit_expr(operand, None)?;
                let tmp = self.alloc(Bank::Gen)?;
                self.push(Instr::new(Op::Receive, ch, 0, tmp), pos);
                self.unbox_reg(bank, tmp, dst, pos)
            }
        }
    }

    fn emit_addr(&mut self, e: ExprId, operand: ExprId, dst: Option<i8>) -> EResult {
        let pos = self.pos(e);
        // The address of a local is its reference cell.
        if let Expr::Ident(_) = self.em.ast.exprs[operand] {
            if let Some(Binding::Local(key)) = self.em.out.binding(operand) {
                match self.locals.get(&key).copied() {
                    Some(Loc::Cell(cell)) => {
                        let d = self.dst_or(dst, Bank::Gen)?;
                        self.move_reg(Bank::Gen, cell, d, pos);
                        return Ok(d);
                    }
                    Some(Loc::CVar(idx)) => {
                        let d = self.dst_or(dst, Bank::Gen)?;
                        self.push(Instr::new(Op::GetCVar, 0, idx as i8, d), pos);
                        return Ok(d);
                    }
                    _ => {}
                }
            }
        }
        // Otherwise box the value into a fresh cell; the pointer observes
        // the shared container, not the storage location.
        let ty = self.ty_of(operand);
        let boxed = self.emit_boxed(operand, ty)?;
        let d = self.dst_or(dst, Bank::Gen)?;
        let ti = self.type_idx(ty)?;
        self.push(Instr::new(Op::New, ti, 0, d), pos);
        self.push(Instr::new(Op::StorePtr, boxed, d, Bank::Gen as u8 as i8), pos);
        Ok(d)
    }

    fn emit_binary(
        &mut self,
        e: ExprId,
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
        dst: Option<i8>,
    ) -> EResult {
        let pos = self.pos(e);
        match op {
            BinOp::LAnd | BinOp::LOr => {
                let d = self.dst_or(dst, Bank::Int)?;
                self.emit_expr(lhs, Some(d))?;
                let k0 = self.const_int(0)?;
                let cond = if op == BinOp::LAnd { Cond::NotEq } else { Cond::Eq };
                self.push(Instr::with_k(Op::IfInt, d, cond as u8 as i8, k0), pos);
                let goto_pc = self.pc() as usize;
                self.push(Instr::jump(Op::Goto, 0), pos);
                self.emit_expr(rhs, Some(d))?;
                let end = self.pc();
                self.f.body[goto_pc] = Instr::jump(Op::Goto, end);
                Ok(d)
            }
            BinOp::Eq | BinOp::NotEq | BinOp::Less | BinOp::LessEq | BinOp::Greater
            | BinOp::GreaterEq => self.emit_compare(e, op, lhs, rhs, dst),
            BinOp::Contains => {
                let lty = self.ty_of(lhs);
                let l = self.emit_boxed(lhs, lty)?;
                let rty = self.ty_of(rhs);
                let r = self.emit_boxed(rhs, rty)?;
                let d = self.dst_or(dst, Bank::Int)?;
                self.push(Instr::new(Op::Contains, l, r, d), pos);
                Ok(d)
            }
            _ => self.emit_arith(e, op, lhs, rhs, dst),
        }
    }

    fn emit_compare(
        &mut self,
        e: ExprId,
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
        dst: Option<i8>,
    ) -> EResult {
        let pos = self.pos(e);
        let lty = self.ty_of(lhs);
        let rty = self.ty_of(rhs);
        let linfo = self.info(lhs).clone();
        let rinfo = self.info(rhs).clone();
        let d = self.dst_or(dst, Bank::Int)?;
        let k1 = self.const_int(1)?;
        self.push(Instr::with_k(Op::MoveInt, 0, k1, d), pos);

        let cond = match op {
            BinOp::Eq => Cond::Eq,
            BinOp::NotEq => Cond::NotEq,
            BinOp::Less => Cond::Less,
            BinOp::LessEq => Cond::LessEq,
            BinOp::Greater => Cond::Greater,
            BinOp::GreaterEq => Cond::GreaterEq,
            _ => unreachable!(),
        };

        // nil comparisons use the general bank conditions.
        if linfo.is_nil() || rinfo.is_nil() {
            let operand = if linfo.is_nil() { rhs } else { lhs };
            let oty = self.ty_of(operand);
            let r = self.emit_boxed(operand, oty)?;
            let c = if op == BinOp::Eq { Cond::Nil } else { Cond::NotNil };
            self.push(Instr::new(Op::If, r, c as u8 as i8, 0), pos);
            let k0 = self.const_int(0)?;
            self.push(Instr::with_k(Op::MoveInt, 0, k0, d), pos);
            return Ok(d);
        }

        let bank = self.bank_of(lty);
        match bank {
            Bank::Int => {
                let a = self.emit_expr(lhs, None)?;
                let (ck, c) = self.operand_rk_int(rhs)?;
                let op = if self.em.reg.is_unsigned(lty) { Op::IfUint } else { Op::IfInt };
                let i = if ck {
                    Instr::with_k(op, a, cond as u8 as i8, c)
                } else {
                    Instr::new(op, a, cond as u8 as i8, c)
                };
                self.push(i, pos);
            }
            Bank::Float => {
                let a = self.emit_expr(lhs, None)?;
                let c = self.emit_expr(rhs, None)?;
                self.push(Instr::new(Op::IfFloat, a, cond as u8 as i8, c), pos);
            }
            Bank::Str => {
                // Comparison against an empty string literal uses the
                // length conditions.
                let empty_rhs = matches!(
                    &rinfo.constant,
                    Some(Constant::Str(s)) if s.is_empty()
                );
                let a = self.emit_expr(lhs, None)?;
                if empty_rhs && matches!(op, BinOp::Eq | BinOp::NotEq) {
                    let lc = if op == BinOp::Eq { Cond::EqLen } else { Cond::NotEqLen };
                    let k0 = self.const_int(0)?;
                    self.push(Instr::with_k(Op::IfString, a, lc as u8 as i8, k0), pos);
                } else {
                    let c = self.emit_expr(rhs, None)?;
                    self.push(Instr::new(Op::IfString, a, cond as u8 as i8, c), pos);
                }
            }
            Bank::Gen => {
                let a = self.emit_boxed(lhs, lty)?;
                let c = self.emit_boxed(rhs, rty)?;
                self.push(Instr::new(Op::If, a, cond as u8 as i8, c), pos);
            }
        }
        let k0 = self.const_int(0)?;
        self.push(Instr::with_k(Op::MoveInt, 0, k0, d), pos);
        Ok(d)
    }

    /// Emits the right operand of an int instruction, using the constant
    /// pool (k flag) when it is a constant.
    fn operand_rk_int(&mut self, e: ExprId) -> Result<(bool, i8), BuildError> {
        let info = self.info(e).clone();
        if let Some(c) = &info.constant {
            let v = match c {
                Constant::Bool(b) => *b as i64,
                _ => c.to_i64().unwrap_or(0),
            };
            let k = self.const_int(v)?;
            return Ok((true, k));
        }
        let r = self.emit_expr(e, None)?;
        Ok((false, r))
    }

    fn emit_arith(
        &mut self,
        e: ExprId,
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
        dst: Option<i8>,
    ) -> EResult {
        let pos = self.pos(e);
        let ty = self.ty_of(e);
        let bank = self.bank_of(ty);
        let reg = self.em.reg;
        let unsigned = reg.is_unsigned(ty);
        match bank {
            Bank::Str => {
                let a = self.emit_expr(lhs, None)?;
                let b = self.emit_expr(rhs, None)?;
                let d = self.dst_or(dst, Bank::Str)?;
                self.push(Instr::new(Op::Concat, a, b, d), pos);
                Ok(d)
            }
            Bank::Int => {
                let a = self.emit_expr(lhs, None)?;
                let (ck, b) = self.operand_rk_int(rhs)?;
                let d = self.dst_or(dst, Bank::Int)?;
                let opcode = match op {
                    BinOp::Add => Op::AddInt,
                    BinOp::Sub => Op::SubInt,
                    BinOp::Mul => Op::MulInt,
                    BinOp::Div => {
                        if unsigned {
                            Op::DivUint
                        } else {
                            Op::DivInt
                        }
                    }
                    BinOp::Rem => {
                        if unsigned {
                            Op::RemUint
                        } else {
                            Op::RemInt
                        }
                    }
                    BinOp::And => Op::And,
                    BinOp::Or => Op::Or,
                    BinOp::Xor => Op::Xor,
                    BinOp::AndNot => Op::AndNot,
                    BinOp::Shl => Op::Shl,
                    BinOp::Shr => {
                        if unsigned {
                            Op::ShrUint
                        } else {
                            Op::ShrInt
                        }
                    }
                    _ => unreachable!(),
                };
                let i = if ck {
                    Instr::with_k(opcode, a, b, d)
                } else {
                    Instr::new(opcode, a, b, d)
                };
                self.push(i, pos);
                self.emit_wrap(ty, d, pos)?;
                Ok(d)
            }
            Bank::Float => {
                let a = self.emit_expr(lhs, None)?;
                let b = self.emit_expr(rhs, None)?;
                let d = self.dst_or(dst, Bank::Float)?;
                let opcode = match op {
                    BinOp::Add => Op::AddFloat,
                    BinOp::Sub => Op::SubFloat,
                    BinOp::Mul => Op::MulFloat,
                    BinOp::Div => Op::DivFloat,
                    _ => unreachable!(),
                };
                self.push(Instr::new(opcode, a, b, d), pos);
                if matches!(reg.get(reg.underlying(ty)), Type::Float32) {
                    self.push(Instr::new(Op::CastFloat32, d, 0, d), pos);
                }
                Ok(d)
            }
            Bank::Gen => {
                // Complex arithmetic.
                let a = self.emit_expr(lhs, None)?;
                let b = self.emit_expr(rhs, None)?;
                let d = self.dst_or(dst, Bank::Gen)?;
                let opcode = match op {
                    BinOp::Add => Op::AddComplex,
                    BinOp::Sub => Op::SubComplex,
                    BinOp::Mul => Op::MulComplex,
                    BinOp::Div => Op::DivComplex,
                    _ => unreachable!(),
                };
                self.push(Instr::new(opcode, a, b, d), pos);
                Ok(d)
            }
        }
    }

    /// Truncates a 64-bit int result to the width of a sized type.
    pub(crate) fn emit_wrap(&mut self, ty: TypeId, r: i8, pos: Position) -> Result<(), BuildError> {
        let reg = self.em.reg;
        if let Type::Int(kind) = reg.get(reg.underlying(ty)) {
            let op = match kind {
                IntKind::I8 => Some(Op::CastInt8),
                IntKind::I16 => Some(Op::CastInt16),
                IntKind::I32 => Some(Op::CastInt32),
                IntKind::U8 => Some(Op::CastUint8),
                IntKind::U16 => Some(Op::CastUint16),
                IntKind::U32 => Some(Op::CastUint32),
                _ => None,
            };
            if let Some(op) = op {
                self.push(Instr::new(op, r, 0, r), pos);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Index, slice, selector
    // ---------------------------------------------------------------------

    fn emit_index(&mut self, e: ExprId, expr: ExprId, index: ExprId, dst: Option<i8>) -> EResult {
        let pos = self.pos(e);
        let base_ty = self.ty_of(expr);
        let reg = self.em.reg;
        let ty = self.ty_of(e);
        let bank = self.bank_of(ty);
        let u = reg.underlying(base_ty);
        match reg.get(u).clone() {
            Type::Str => {
                let s = self.emit_expr(expr, None)?;
                let (ik, i) = self.operand_rk_int(index)?;
                let d = self.dst_or(dst, Bank::Int)?;
                let instr = if ik {
                    Instr::with_k(Op::StringIndex, s, i, d)
                } else {
                    Instr::new(Op::StringIndex, s, i, d)
                };
                self.push(instr, pos);
                Ok(d)
            }
            Type::Map(..) => {
                let m = self.emit_expr(expr, None)?;
                let kty = self.ty_of(index);
                let key = self.emit_boxed(index, kty)?;
                let d = self.dst_or(dst, bank)?;
                // Load the zero value first: a missing key leaves it.
                self.emit_zero(ty, d, pos)?;
                self.push(Instr::new(Op::MapIndex, m, key, d), pos);
                Ok(d)
            }
            Type::Ptr(inner) => {
                let cell = self.emit_expr(expr, None)?;
                let arr = self.alloc(Bank::Gen)?;
                self.push(Instr::new(Op::LoadPtr, cell, Bank::Gen as u8 as i8, arr), pos);
                let (ik, i) = self.operand_rk_int(index)?;
                let d = self.dst_or(dst, bank)?;
                let _ = inner;
                let instr = if ik {
                    Instr::with_k(Op::SliceIndex, arr, i, d)
                } else {
                    Instr::new(Op::SliceIndex, arr, i, d)
                };
                self.push(instr, pos);
                Ok(d)
            }
            _ => {
                let s = self.emit_expr(expr, None)?;
                let (ik, i) = self.operand_rk_int(index)?;
                let d = self.dst_or(dst, bank)?;
                let instr = if ik {
                    Instr::with_k(Op::SliceIndex, s, i, d)
                } else {
                    Instr::new(Op::SliceIndex, s, i, d)
                };
                self.push(instr, pos);
                Ok(d)
            }
        }
    }

    pub(crate) fn emit_zero(&mut self, ty: TypeId, d: i8, pos: Position) -> Result<(), BuildError> {
        match self.bank_of(ty) {
            Bank::Int => {
                let k = self.const_int(0)?;
                self.push(Instr::with_k(Op::MoveInt, 0, k, d), pos);
            }
            Bank::Float => {
                let k = self.const_float(0.0)?;
                self.push(Instr::with_k(Op::MoveFloat, 0, k, d), pos);
            }
            Bank::Str => {
                let k = self.const_string("")?;
                self.push(Instr::with_k(Op::MoveString, 0, k, d), pos);
            }
            Bank::Gen => {
                let z = zero_value(self.em.reg, ty);
                let k = self.const_general(z)?;
                self.push(Instr::with_k(Op::MoveGeneral, 0, k, d), pos);
            }
        }
        Ok(())
    }

    fn emit_slice(
        &mut self,
        e: ExprId,
        expr: ExprId,
        low: Option<ExprId>,
        high: Option<ExprId>,
        max: Option<ExprId>,
        dst: Option<i8>,
    ) -> EResult {
        let pos = self.pos(e);
        let base_ty = self.ty_of(expr);
        let is_string = self.em.reg.is_string(base_ty);
        let src = self.emit_expr(expr, None)?;
        let lo = match low {
            Some(l) => self.emit_expr(l, None)?,
            None => 0,
        };
        let hi = match high {
            Some(h) => self.emit_expr(h, None)?,
            None => 0,
        };
        let mx = match max {
            Some(m) => self.emit_expr(m, None)?,
            None => 0,
        };
        let bank = if is_string { Bank::Str } else { Bank::Gen };
        let d = self.dst_or(dst, bank)?;
        let op = if is_string { Op::SliceString } else { Op::Slice };
        // Flags: bit0 low omitted, bit1 high omitted, bit2 has max.
        let mut flags = 0i8;
        if low.is_none() {
            flags |= 1;
        }
        if high.is_none() {
            flags |= 2;
        }
        if max.is_some() {
            flags |= 4;
        }
        self.push(Instr::new(op, src, 0, d), pos);
        self.push(Instr { op: lo as u8, a: hi, b: mx, c: flags }, pos);
        Ok(d)
    }

    fn emit_selector(&mut self, e: ExprId, dst: Option<i8>) -> EResult {
        let pos = self.pos(e);
        // A package selector resolves through its recorded binding.
        if let Some(binding) = self.em.out.binding(e) {
            let ty = self.ty_of(e);
            let bank = self.bank_of(ty);
            return match binding {
                Binding::Global(idx) => {
                    let d = self.dst_or(dst, bank)?;
                    self.push(
                        Instr::new(Op::GetVar, bank as u8 as i8, idx as u8 as i8, d),
                        pos,
                    );
                    Ok(d)
                }
                Binding::Local(key) => self.emit_local_read(key, bank, dst, pos),
                Binding::Builtin(_) => Err(self.err(pos, "builtin used as value")),
            };
        }
        let (expr, sel) = match self.em.ast.exprs[e] {
            Expr::Selector { expr, sel } => (expr, sel),
            _ => unreachable!(),
        };
        let name = self.em.ast.name(sel).to_string();
        let mut base_ty = self.ty_of(expr);
        let reg = self.em.reg;
        let mut src = self.emit_expr(expr, None)?;
        if let Type::Ptr(inner) = reg.get(reg.underlying(base_ty)) {
            let inner = *inner;
            let v = self.alloc(Bank::Gen)?;
            self.push(Instr::new(Op::LoadPtr, src, Bank::Gen as u8 as i8, v), pos);
            src = v;
            base_ty = inner;
        }
        if let Some((path, fty)) = reg.lookup_field(base_ty, &name) {
            // Walk embedded fields; the last step lands in the field's
            // bank.
            let mut cur = src;
            for (i, &idx) in path.iter().enumerate() {
                let last = i + 1 == path.len();
                let d = if last {
                    self.dst_or(dst, self.bank_of(fty))?
                } else {
                    self.alloc(Bank::Gen)?
                };
                self.push(Instr::new(Op::Field, cur, idx as u8 as i8, d), pos);
                cur = d;
            }
            return Ok(cur);
        }
        Err(self.err(
            pos,
            format!("method value {name} is not directly usable; call it instead"),
        ))
    }

    // ---------------------------------------------------------------------
    // Composite literals and function literals
    // ---------------------------------------------------------------------

    fn emit_composite(&mut self, e: ExprId, dst: Option<i8>) -> EResult {
        let pos = self.pos(e);
        let ty = self.ty_of(e);
        let elems = match self.em.ast.exprs[e] {
            Expr::Composite { elems, .. } => self.em.ast.elements_of(elems).to_vec(),
            _ => unreachable!(),
        };
        let reg = self.em.reg;
        match reg.get(reg.underlying(ty)).clone() {
            Type::Slice(elem_ty) => {
                // Keyed entries may extend the length.
                let mut len = 0i64;
                let mut next = 0i64;
                for el in &elems {
                    let idx = match el.key {
                        Some(k) => self
                            .info(k)
                            .constant
                            .as_ref()
                            .and_then(|c| c.to_i64())
                            .unwrap_or(next),
                        None => next,
                    };
                    next = idx + 1;
                    len = len.max(next);
                }
                let d = self.dst_or(dst, Bank::Gen)?;
                let ti = self.type_idx(ty)?;
                let lk = self.const_int(len)?;
                self.push(Instr::with_k(Op::MakeSlice, ti, lk, d), pos);
                self.push(Instr::word(lk, 0b11, 0), pos);
                let mut next = 0i64;
                for el in &elems {
                    let idx = match el.key {
                        Some(k) => self
                            .info(k)
                            .constant
                            .as_ref()
                            .and_then(|c| c.to_i64())
                            .unwrap_or(next),
                        None => next,
                    };
                    next = idx + 1;
                    let v = self.emit_boxed(el.value, elem_ty)?;
                    let ik = self.const_int(idx)?;
                    self.push(Instr::with_k(Op::SetSlice, v, d, ik), pos);
                }
                Ok(d)
            }
            Type::Array(n, elem_ty) => {
                let d = self.dst_or(dst, Bank::Gen)?;
                let ti = self.type_idx(ty)?;
                let _ = n;
                self.push(Instr::new(Op::New, ti, 1, d), pos);
                for (i, el) in elems.iter().enumerate() {
                    let v = self.emit_boxed(el.value, elem_ty)?;
                    let ik = self.const_int(i as i64)?;
                    self.push(Instr::with_k(Op::SetSlice, v, d, ik), pos);
                }
                Ok(d)
            }
            Type::Map(kty, vty) => {
                let d = self.dst_or(dst, Bank::Gen)?;
                let ti = self.type_idx(ty)?;
                let sk = self.const_int(elems.len() as i64)?;
                self.push(Instr::with_k(Op::MakeMap, ti, sk, d), pos);
                for el in &elems {
                    let key = el.key.expect("map literal key");
                    let k = self.emit_boxed(key, kty)?;
                    let v = self.emit_boxed(el.value, vty)?;
                    self.push(Instr::new(Op::SetMap, v, d, k), pos);
                }
                Ok(d)
            }
            Type::Struct(fields) => {
                let d = self.dst_or(dst, Bank::Gen)?;
                let ti = self.type_idx(ty)?;
                self.push(Instr::new(Op::New, ti, 1, d), pos);
                let keyed = elems.iter().any(|el| el.key.is_some());
                for (i, el) in elems.iter().enumerate() {
                    let (idx, fty) = if keyed {
                        let key = el.key.expect("struct literal key");
                        let name = match self.em.ast.exprs[key] {
                            Expr::Ident(sym) => self.em.ast.name(sym).to_string(),
                            _ => String::new(),
                        };
                        let fi = fields
                            .iter()
                            .position(|f| f.name == name)
                            .unwrap_or_default();
                        (fi, fields[fi].ty)
                    } else {
                        (i, fields[i].ty)
                    };
                    let v = self.emit_boxed(el.value, fty)?;
                    self.push(Instr::new(Op::SetField, v, d, idx as u8 as i8), pos);
                }
                Ok(d)
            }
            _ => Err(self.err(pos, "invalid composite literal")),
        }
    }

    pub(crate) fn emit_func_lit(&mut self, e: ExprId, dst: Option<i8>) -> EResult {
        let pos = self.pos(e);
        let (params, results, variadic, body) = match self.em.ast.exprs[e] {
            Expr::FuncLit { params, results, variadic, body } => {
                (params, results, variadic, body)
            }
            _ => unreachable!(),
        };
        let _ = variadic;
        let em = self.em;
        let param_list = em.ast.params_of(params).to_vec();
        let result_list = em.ast.params_of(results).to_vec();
        let ins: Vec<TypeId> = (0..param_list.len())
            .map(|i| em.out.decl_types[&DeclKey::ExprParam(e.raw(), i as u16)])
            .collect();
        let outs: Vec<TypeId> = result_list
            .iter()
            .map(|r| em.out.denoted(r.ty))
            .collect();

        let mut sub = FnBuilder::new(em, "func", &self.path, self.f.format, false);
        sub.layout_params(&ins, &outs, |i| DeclKey::ExprParam(e.raw(), i as u16));
        for (i, r) in result_list.iter().enumerate() {
            if r.name.is_some() {
                let key = DeclKey::ExprParam(e.raw(), (param_list.len() + i) as u16);
                let bank = Bank::of(em.reg, outs[i]);
                let reg = sub.result_reg(&outs, i, bank);
                sub.locals.insert(key, Loc::Reg(bank, reg));
            }
        }
        // Captured declarations become the closure's variables.
        let caps = em
            .out
            .captured
            .get(&FnKey::Lit(e.raw()))
            .cloned()
            .unwrap_or_default();
        let mut crefs = Vec::new();
        for (i, key) in caps.iter().enumerate() {
            sub.cvars.insert(*key, i as u8);
            let cref = self.capture_ref(*key, pos)?;
            crefs.push(cref);
        }
        sub.prescan_stmt(body);
        sub.finish_locals();
        sub.emit_param_cells()?;
        sub.emit_stmt(body)?;
        sub.push(Instr::new(Op::Return, 0, 0, 0), Position::default());
        let mut f = sub.finish()?;
        f.crefs = crefs;
        let fi = self.add_subfunction(f)?;
        let d = self.dst_or(dst, Bank::Gen)?;
        self.push(Instr::new(Op::Func, 0, fi, d), pos);
        Ok(d)
    }

    /// The capture reference of `key` from the perspective of the current
    /// function.
    pub(crate) fn capture_ref(&mut self, key: DeclKey, pos: Position) -> Result<i16, BuildError> {
        match self.locals.get(&key).copied() {
            Some(Loc::Cell(r)) => Ok(-(r as i16) - 1),
            Some(Loc::CVar(idx)) => Ok(idx as i16),
            Some(Loc::Reg(..)) => Err(self.err(pos, "captured variable is not indirect")),
            None => match self.cvars.get(&key).copied() {
                Some(idx) => Ok(idx as i16),
                None => Err(self.err(pos, "unresolved captured variable")),
            },
        }
    }

    // ---------------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------------

    /// Emits a call expression. Returns the result locations in the
    /// caller's frame, in declaration order.
    pub(crate) fn emit_call(
        &mut self,
        e: ExprId,
        func: ExprId,
        args: crate::ast::ListRef,
        ellipsis: bool,
    ) -> Result<Vec<(Bank, i8)>, BuildError> {
        let pos = self.pos(e);
        let finfo = self.info(func).clone();

        // Builtins.
        if let Some(Binding::Builtin(b)) = self.em.out.binding(func) {
            return self.emit_builtin(e, b, args, ellipsis);
        }
        // Conversions.
        if finfo.is_type() {
            let arg = self.em.ast.exprs_of(args)[0];
            let d = self.emit_conversion(e, finfo.ty, arg)?;
            return Ok(vec![(self.bank_of(finfo.ty), d)]);
        }

        let reg = self.em.reg;
        let (ins, outs, variadic) = match reg.get(reg.underlying(finfo.ty)).clone() {
            Type::Func(ft) => (ft.params, ft.results, ft.variadic),
            Type::Macro(mt) => (mt.params.clone(), Vec::new(), mt.variadic),
            other => {
                let _ = other;
                return Err(self.err(pos, "call of non-function value"));
            }
        };

        // A direct call to a host function goes through CallNative.
        if let Some(Binding::Global(idx)) = self.em.out.binding(func) {
            let g = &self.em.out.globals[idx as usize];
            if matches!(g.init, GlobalInit::Host) {
                if let Some(v) = self.em.out.native_values.get(&idx) {
                    if matches!(v, Value::Native(_)) {
                        return self.emit_native_call(e, v.clone(), None, args, &ins, &outs, variadic);
                    }
                }
            }
        }
        // A method call on a native named type.
        if let Expr::Selector { expr, sel } = self.em.ast.exprs[func] {
            if self.em.out.binding(func).is_none() {
                let name = self.em.ast.name(sel).to_string();
                let mut base_ty = self.ty_of(expr);
                if let Type::Ptr(inner) = reg.get(reg.underlying(base_ty)) {
                    base_ty = *inner;
                }
                if let Some(imp) = self.em.out.method_impls.get(&(base_ty, name.clone())) {
                    let v = Value::Native(imp.clone());
                    return self.emit_native_call(e, v, Some(expr), args, &ins, &outs, variadic);
                }
            }
        }

        // General closure call.
        let closure = self.emit_expr(func, None)?;
        self.emit_window_call(e, closure, args, &ins, &outs, variadic, ellipsis)
    }

    fn emit_native_call(
        &mut self,
        e: ExprId,
        fval: Value,
        receiver: Option<ExprId>,
        args: crate::ast::ListRef,
        ins: &[TypeId],
        outs: &[TypeId],
        variadic: bool,
    ) -> Result<Vec<(Bank, i8)>, BuildError> {
        let pos = self.pos(e);
        let arg_list = self.em.ast.exprs_of(args).to_vec();
        let k = self.const_general(fval)?;
        let freg = self.alloc(Bank::Gen)?;
        self.push(Instr::with_k(Op::MoveGeneral, 0, k, freg), pos);

        // Box the arguments into consecutive general registers.
        let mut boxed = Vec::new();
        if let Some(rcv) = receiver {
            let rty = self.ty_of(rcv);
            boxed.push(self.emit_boxed(rcv, rty)?);
        }
        let fixed = if variadic { ins.len().saturating_sub(1) } else { ins.len() };
        for (i, &a) in arg_list.iter().enumerate() {
            // The declared parameter type (the element type past a
            // variadic boundary) tags the boxed argument.
            let want = if i < fixed {
                ins[i]
            } else {
                match self.em.reg.get(self.em.reg.underlying(ins[fixed])) {
                    Type::Slice(elem) => *elem,
                    _ => ins[fixed],
                }
            };
            boxed.push(self.emit_boxed(a, want)?);
        }
        // Compact into a contiguous window.
        let first = self.alloc(Bank::Gen)?;
        let argc = boxed.len();
        for _ in 1..argc.max(outs.len()) {
            self.alloc(Bank::Gen)?;
        }
        for (i, r) in boxed.iter().enumerate() {
            self.move_reg(Bank::Gen, *r, first + i as i8, pos);
        }
        self.push(Instr::new(Op::CallNative, argc as i8, freg, first), pos);

        // Unbox results into their banks.
        let mut results = Vec::new();
        for (i, &rt) in outs.iter().enumerate() {
            let bank = self.bank_of(rt);
            let d = self.unbox_reg(bank, first + i as i8, None, pos)?;
            results.push((bank, d));
        }
        Ok(results)
    }

    /// Emits a window-convention call to a closure register.
    pub(crate) fn emit_window_call(
        &mut self,
        e: ExprId,
        closure: i8,
        args: crate::ast::ListRef,
        ins: &[TypeId],
        outs: &[TypeId],
        variadic: bool,
        ellipsis: bool,
    ) -> Result<Vec<(Bank, i8)>, BuildError> {
        let pos = self.pos(e);
        let reg = self.em.reg;
        let arg_list = self.em.ast.exprs_of(args).to_vec();

        // The callee window begins at the current register tops.
        let shift = [
            self.top[0] as i8 - 1,
            self.top[1] as i8 - 1,
            self.top[2] as i8 - 1,
            self.top[3] as i8 - 1,
        ];
        // Window register of parameter i: results of the callee occupy
        // the first registers of each bank.
        let mut out_counts = [0u8; 4];
        for &t in outs {
            out_counts[Bank::of(reg, t) as usize] += 1;
        }
        let mut next = out_counts;
        let mut param_regs = Vec::new();
        for &t in ins {
            let b = Bank::of(reg, t) as usize;
            next[b] += 1;
            param_regs.push((Bank::of(reg, t), next[b] as i8));
        }
        // Reserve the whole window.
        for b in 0..4 {
            while self.top[b] <= shift[b] as u8 + next[b] {
                self.alloc(Bank::from_u8(b as u8))?;
            }
        }

        let fixed = if variadic { ins.len() - 1 } else { ins.len() };
        for (i, &a) in arg_list.iter().enumerate().take(fixed) {
            let (bank, wreg) = param_regs[i];
            let abs = shift[bank as usize] + wreg;
            let r = self.emit_expr_as(a, ins[i])?;
            self.move_reg(bank, r, abs, pos);
        }
        if variadic {
            let (bank, wreg) = param_regs[fixed];
            let abs = shift[bank as usize] + wreg;
            if ellipsis {
                let &a = arg_list.last().expect("ellipsis argument");
                let r = self.emit_expr_as(a, ins[fixed])?;
                self.move_reg(bank, r, abs, pos);
            } else {
                // Collect the remaining arguments into a slice.
                let slice_ty = ins[fixed];
                let elem_ty = match reg.get(reg.underlying(slice_ty)) {
                    Type::Slice(elem) => *elem,
                    _ => types::ANY,
                };
                let ti = self.type_idx(slice_ty)?;
                let n = arg_list.len() - fixed;
                let nk = self.const_int(n as i64)?;
                let sreg = self.alloc(Bank::Gen)?;
                self.push(Instr::with_k(Op::MakeSlice, ti, nk, sreg), pos);
                self.push(Instr::word(nk, 0b11, 0), pos);
                for (j, &a) in arg_list[fixed..].iter().enumerate() {
                    let v = self.emit_boxed(a, elem_ty)?;
                    let jk = self.const_int(j as i64)?;
                    self.push(Instr::with_k(Op::SetSlice, v, sreg, jk), pos);
                }
                self.move_reg(Bank::Gen, sreg, abs, pos);
            }
        }

        self.push(Instr::new(Op::Call, NO_PACKAGE, closure, 0), pos);
        self.push(
            Instr { op: shift[0] as u8, a: shift[1], b: shift[2], c: shift[3] },
            pos,
        );

        // Results sit at the bottom of the window.
        let mut results = Vec::new();
        let mut seen = [0u8; 4];
        for &t in outs {
            let bank = Bank::of(reg, t);
            seen[bank as usize] += 1;
            results.push((bank, shift[bank as usize] + seen[bank as usize] as i8));
        }
        Ok(results)
    }

    fn emit_conversion(&mut self, e: ExprId, target: TypeId, arg: ExprId) -> EResult {
        let pos = self.pos(e);
        let reg = self.em.reg;
        let src_ty = self.ty_of(arg);
        let sbank = self.bank_of(src_ty);
        let tbank = self.bank_of(target);
        let src = self.emit_expr(arg, None)?;

        match (sbank, tbank) {
            (Bank::Int, Bank::Int) => {
                let d = self.alloc(Bank::Int)?;
                self.move_reg(Bank::Int, src, d, pos);
                self.emit_wrap(target, d, pos)?;
                Ok(d)
            }
            (Bank::Int, Bank::Float) => {
                let d = self.alloc(Bank::Float)?;
                let op = if reg.is_unsigned(src_ty) { Op::ConvUF } else { Op::ConvIF };
                self.push(Instr::new(op, src, 0, d), pos);
                if matches!(reg.get(reg.underlying(target)), Type::Float32) {
                    self.push(Instr::new(Op::CastFloat32, d, 0, d), pos);
                }
                Ok(d)
            }
            (Bank::Float, Bank::Int) => {
                let d = self.alloc(Bank::Int)?;
                self.push(Instr::new(Op::ConvFI, src, 0, d), pos);
                self.emit_wrap(target, d, pos)?;
                Ok(d)
            }
            (Bank::Float, Bank::Float) => {
                let d = self.alloc(Bank::Float)?;
                self.move_reg(Bank::Float, src, d, pos);
                if matches!(reg.get(reg.underlying(target)), Type::Float32) {
                    self.push(Instr::new(Op::CastFloat32, d, 0, d), pos);
                }
                Ok(d)
            }
            (Bank::Int, Bank::Str) => {
                // Rune to string.
                let d = self.alloc(Bank::Str)?;
                self.push(Instr::new(Op::ConvRuneString, src, 0, d), pos);
                Ok(d)
            }
            (Bank::Str, Bank::Str) => {
                // Format and string conversions share representation.
                let d = self.alloc(Bank::Str)?;
                self.move_reg(Bank::Str, src, d, pos);
                Ok(d)
            }
            (Bank::Gen, Bank::Str) => {
                // []byte or []rune to string.
                let d = self.alloc(Bank::Str)?;
                let op = match reg.get(reg.underlying(src_ty)) {
                    Type::Slice(e) if *e == types::BYTE => Op::ConvBytesString,
                    _ => Op::ConvRunesString,
                };
                self.push(Instr::new(op, src, 0, d), pos);
                Ok(d)
            }
            (Bank::Str, Bank::Gen) => {
                let d = self.alloc(Bank::Gen)?;
                let op = match reg.get(reg.underlying(target)) {
                    Type::Slice(e) if *e == types::BYTE => Op::ConvStringBytes,
                    Type::Slice(_) => Op::ConvStringRunes,
                    _ => {
                        // string into an interface.
                        let ti = self.type_idx(src_ty)?;
                        self.push(Instr::new(Op::Typify, ti, src, d), pos);
                        return Ok(d);
                    }
                };
                self.push(Instr::new(op, src, 0, d), pos);
                Ok(d)
            }
            (b, Bank::Gen) => {
                // Into an interface or complex target.
                if reg.is_complex(target) && b == Bank::Float {
                    let zero = self.const_float(0.0)?;
                    let zf = self.alloc(Bank::Float)?;
                    self.push(Instr::with_k(Op::MoveFloat, 0, zero, zf), pos);
                    let d = self.alloc(Bank::Gen)?;
                    self.push(Instr::new(Op::ComplexNew, src, zf, d), pos);
                    return Ok(d);
                }
                if reg.is_complex(target) && b == Bank::Int {
                    let fr = self.alloc(Bank::Float)?;
                    self.push(Instr::new(Op::ConvIF, src, 0, fr), pos);
                    let zero = self.const_float(0.0)?;
                    let zf = self.alloc(Bank::Float)?;
                    self.push(Instr::with_k(Op::MoveFloat, 0, zero, zf), pos);
                    let d = self.alloc(Bank::Gen)?;
                    self.push(Instr::new(Op::ComplexNew, fr, zf, d), pos);
                    return Ok(d);
                }
                let d = self.alloc(Bank::Gen)?;
                if b == Bank::Gen {
                    self.move_reg(Bank::Gen, src, d, pos);
                } else {
                    let ti = self.type_idx(src_ty)?;
                    self.push(Instr::new(Op::Typify, ti, src, d), pos);
                }
                Ok(d)
            }
            (Bank::Gen, b) => {
                // Out of an interface (checked conversions are asserts).
                self.unbox_reg(b, src, None, pos)
            }
            _ => Err(self.err(pos, "unsupported conversion")),
        }
    }

    // ---------------------------------------------------------------------
    // Builtins
    // ---------------------------------------------------------------------

    fn emit_builtin(
        &mut self,
        e: ExprId,
        b: Builtin,
        args: crate::ast::ListRef,
        ellipsis: bool,
    ) -> Result<Vec<(Bank, i8)>, BuildError> {
        let pos = self.pos(e);
        let arg_list = self.em.ast.exprs_of(args).to_vec();
        let reg = self.em.reg;
        match b {
            Builtin::Len | Builtin::Cap => {
                let a = arg_list[0];
                let aty = self.ty_of(a);
                let d = self.alloc(Bank::Int)?;
                if reg.is_string(aty) && b == Builtin::Len {
                    let s = self.emit_expr(a, None)?;
                    self.push(Instr::new(Op::Len, 0, s, d), pos);
                } else {
                    let s = self.emit_expr(a, None)?;
                    let op = if b == Builtin::Len { Op::Len } else { Op::Cap };
                    self.push(Instr::new(op, 1, s, d), pos);
                }
                Ok(vec![(Bank::Int, d)])
            }
            Builtin::Append => {
                let sty = self.ty_of(arg_list[0]);
                let elem_ty = match reg.get(reg.underlying(sty)) {
                    Type::Slice(e) => *e,
                    _ => types::ANY,
                };
                let mut cur = self.emit_expr(arg_list[0], None)?;
                if ellipsis {
                    let other = self.emit_expr(arg_list[1], None)?;
                    let d = self.alloc(Bank::Gen)?;
                    self.push(Instr::new(Op::AppendSlice, other, cur, d), pos);
                    return Ok(vec![(Bank::Gen, d)]);
                }
                for &a in &arg_list[1..] {
                    let v = self.emit_boxed(a, elem_ty)?;
                    let d = self.alloc(Bank::Gen)?;
                    self.push(Instr::new(Op::Append, v, cur, d), pos);
                    cur = d;
                }
                Ok(vec![(Bank::Gen, cur)])
            }
            Builtin::Copy => {
                let dst = self.emit_expr(arg_list[0], None)?;
                let src = self.emit_expr(arg_list[1], None)?;
                let d = self.alloc(Bank::Int)?;
                self.push(Instr::new(Op::Copy, dst, src, d), pos);
                Ok(vec![(Bank::Int, d)])
            }
            Builtin::Delete => {
                let m = self.emit_expr(arg_list[0], None)?;
                let kty = self.ty_of(arg_list[1]);
                let k = self.emit_boxed(arg_list[1], kty)?;
                self.push(Instr::new(Op::Delete, m, k, 0), pos);
                Ok(vec![])
            }
            Builtin::Make => {
                let ty = self.ty_of(e);
                let ti = self.type_idx(ty)?;
                let d = self.alloc(Bank::Gen)?;
                match reg.get(reg.underlying(ty)).clone() {
                    Type::Slice(_) => {
                        let (lk, l) = self.operand_rk_int(arg_list[1])?;
                        let (ck, c) = if arg_list.len() > 2 {
                            self.operand_rk_int(arg_list[2])?
                        } else {
                            (lk, l)
                        };
                        let i = if lk {
                            Instr::with_k(Op::MakeSlice, ti, l, d)
                        } else {
                            Instr::new(Op::MakeSlice, ti, l, d)
                        };
                        self.push(i, pos);
                        let flags = (lk as i8) | ((ck as i8) << 1);
                        self.push(Instr::word(c, flags, 0), pos);
                    }
                    Type::Map(..) => {
                        let (sk, s) = if arg_list.len() > 1 {
                            self.operand_rk_int(arg_list[1])?
                        } else {
                            (true, self.const_int(0)?)
                        };
                        let i = if sk {
                            Instr::with_k(Op::MakeMap, ti, s, d)
                        } else {
                            Instr::new(Op::MakeMap, ti, s, d)
                        };
                        self.push(i, pos);
                    }
                    Type::Chan(..) => {
                        let (ck, c) = if arg_list.len() > 1 {
                            self.operand_rk_int(arg_list[1])?
                        } else {
                            (true, self.const_int(0)?)
                        };
                        let i = if ck {
                            Instr::with_k(Op::MakeChan, ti, c, d)
                        } else {
                            Instr::new(Op::MakeChan, ti, c, d)
                        };
                        self.push(i, pos);
                    }
                    _ => return Err(self.err(pos, "cannot make this type")),
                }
                Ok(vec![(Bank::Gen, d)])
            }
            Builtin::New => {
                let ty = match self.em.ast.exprs[arg_list[0]] {
                    Expr::TypeE(t) => self.em.out.denoted(t),
                    _ => self.info(arg_list[0]).ty,
                };
                let ti = self.type_idx(ty)?;
                let d = self.alloc(Bank::Gen)?;
                self.push(Instr::new(Op::New, ti, 0, d), pos);
                Ok(vec![(Bank::Gen, d)])
            }
            Builtin::Panic => {
                let aty = self.ty_of(arg_list[0]);
                let v = self.emit_boxed(arg_list[0], aty)?;
                self.push(Instr::new(Op::Panic, v, 0, 0), pos);
                Ok(vec![])
            }
            Builtin::Recover => {
                let d = self.alloc(Bank::Gen)?;
                self.push(Instr::new(Op::Recover, 0, 0, d), pos);
                Ok(vec![(Bank::Gen, d)])
            }
            Builtin::Print | Builtin::Println => {
                for (i, &a) in arg_list.iter().enumerate() {
                    if b == Builtin::Println && i > 0 {
                        let sp = self.const_string(" ")?;
                        let sr = self.alloc(Bank::Str)?;
                        self.push(Instr::with_k(Op::MoveString, 0, sp, sr), pos);
                        self.push(Instr::new(Op::Print, Bank::Str as u8 as i8, sr, 0), pos);
                    }
                    let aty = self.ty_of(a);
                    let bank = self.bank_of(aty);
                    let r = self.emit_expr(a, None)?;
                    self.push(Instr::new(Op::Print, bank as u8 as i8, r, 0), pos);
                }
                if b == Builtin::Println {
                    self.push(Instr::new(Op::Println, 0, 0, 0), pos);
                }
                Ok(vec![])
            }
            Builtin::Close => {
                let ch = self.emit_expr(arg_list[0], None)?;
                self.push(Instr::new(Op::CloseChan, ch, 0, 0), pos);
                Ok(vec![])
            }
            Builtin::Complex => {
                let re = self.emit_expr(arg_list[0], None)?;
                let im = self.emit_expr(arg_list[1], None)?;
                let d = self.alloc(Bank::Gen)?;
                self.push(Instr::new(Op::ComplexNew, re, im, d), pos);
                Ok(vec![(Bank::Gen, d)])
            }
            Builtin::Real | Builtin::Imag => {
                let c = self.emit_expr(arg_list[0], None)?;
                let d = self.alloc(Bank::Float)?;
                let op = if b == Builtin::Real { Op::ComplexReal } else { Op::ComplexImag };
                self.push(Instr::new(op, c, 0, d), pos);
                Ok(vec![(Bank::Float, d)])
            }
            Builtin::Exit => {
                let (ck, c) = self.operand_rk_int(arg_list[0])?;
                let i = if ck {
                    Instr::with_k(Op::Exit, 0, c, 0)
                } else {
                    Instr::new(Op::Exit, 0, c, 0)
                };
                self.push(i, pos);
                Ok(vec![])
            }
        }
    }
}
