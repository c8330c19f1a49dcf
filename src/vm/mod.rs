//! The register virtual machine.
//!
//! Four typed register banks addressed relative to a frame pointer per
//! bank; banks grow by amortized doubling. Conditional instructions skip
//! the following instruction when the condition holds. Cancellation and
//! the memory limit are polled at safepoints: backward jumps, calls and
//! range steps.

pub mod chan;
pub mod value;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::code::{context_from_code, Bank, Code, Cond, Function, Op, SelectCase, NO_PACKAGE};
use crate::error::{PanicEntry, PanicError, Position, RuntimeError};
use crate::render::{format_value, PrintFunc, Renderer, ShowData};
use crate::types::{IntKind, Type, TypeId};

use chan::{Channel, RecvTry, SendTry};
use value::{value_eq, zero_value, Closure, MapKey, SliceVal, Value};

/// Shared run environment: cancellation, deadline, memory budget and the
/// print hook. One per run, shared with spawned goroutines.
pub struct Env {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    memory: Option<AtomicI64>,
    pub print: Option<PrintFunc>,
}

impl Env {
    pub fn new(
        deadline: Option<Instant>,
        memory_limit: Option<i64>,
        print: Option<PrintFunc>,
    ) -> Env {
        Env {
            cancelled: AtomicBool::new(false),
            deadline,
            memory: memory_limit.map(AtomicI64::new),
            print,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Safepoint poll.
    pub fn check(&self) -> Result<(), RuntimeError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(RuntimeError::Cancelled);
        }
        if let Some(d) = self.deadline {
            if Instant::now() >= d {
                return Err(RuntimeError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Charges `bytes` against the memory budget.
    pub fn alloc(&self, bytes: i64) -> Result<(), RuntimeError> {
        if let Some(m) = &self.memory {
            let left = m.fetch_sub(bytes, Ordering::AcqRel) - bytes;
            if left < 0 {
                return Err(RuntimeError::OutOfMemory);
            }
        }
        Ok(())
    }
}

pub type Globals = Arc<Vec<Arc<Mutex<Value>>>>;

/// Builds the global cells for one run: host values, run-variable
/// overrides, zero values.
pub fn init_globals(
    code: &Code,
    vars: &std::collections::HashMap<String, Value>,
) -> Result<Globals, RuntimeError> {
    let mut cells = Vec::with_capacity(code.globals.len());
    for (i, g) in code.globals.iter().enumerate() {
        let v = if g.host {
            match vars.get(&g.name) {
                Some(v) => v.clone(),
                None => code
                    .native_values
                    .get(&(i as u32))
                    .cloned()
                    .unwrap_or_else(|| zero_value(&code.registry, g.ty)),
            }
        } else {
            code.native_values
                .get(&(i as u32))
                .cloned()
                .unwrap_or_else(|| zero_value(&code.registry, g.ty))
        };
        cells.push(Arc::new(Mutex::new(v)));
    }
    Ok(Arc::new(cells))
}

struct Frame {
    func: Arc<Function>,
    cvars: Vec<Value>,
    fp: [usize; 4],
    pc: u32,
    tail: bool,
}

struct DeferEntry {
    depth: usize,
    fn_val: Value,
    args: Vec<Value>,
}

enum RangeIter {
    Items { items: Vec<(Value, Value)>, i: usize },
    Str { chars: Vec<(i64, char)>, i: usize },
    Chan(Arc<Channel>),
}

enum PanicOutcome {
    /// A deferred call recovered; execution resumes at the returned pc.
    Resume(u32),
    /// Recovered at the base frame of this execution; it returns.
    ReturnExec,
}

pub struct Vm<'w> {
    pub code: Arc<Code>,
    pub env: Arc<Env>,
    globals: Globals,
    renderer: Option<Renderer<'w>>,

    regs_int: Vec<i64>,
    regs_float: Vec<f64>,
    regs_str: Vec<Arc<str>>,
    regs_gen: Vec<Value>,
    fp: [usize; 4],

    func: Arc<Function>,
    cvars: Vec<Value>,
    pc: u32,
    calls: Vec<Frame>,
    defers: Vec<DeferEntry>,
    iters: Vec<RangeIter>,
    ok: bool,

    cur_panic: Option<Value>,
    panic_chain: Vec<PanicEntry>,
    recovered: bool,
    in_defer: usize,
}

impl<'w> Vm<'w> {
    pub fn new(
        code: Arc<Code>,
        env: Arc<Env>,
        globals: Globals,
        renderer: Option<Renderer<'w>>,
    ) -> Vm<'w> {
        let main = code.main.clone();
        Vm {
            code,
            env,
            globals,
            renderer,
            regs_int: vec![0; 16],
            regs_float: vec![0.0; 16],
            regs_str: vec![Arc::from(""); 16],
            regs_gen: vec![Value::Nil; 16],
            fp: [0; 4],
            func: main,
            cvars: Vec::new(),
            pc: 0,
            calls: Vec::new(),
            defers: Vec::new(),
            iters: Vec::new(),
            ok: false,
            cur_panic: None,
            panic_chain: Vec::new(),
            recovered: false,
            in_defer: 0,
        }
    }

    pub fn run_main(&mut self) -> Result<(), RuntimeError> {
        self.func = self.code.main.clone();
        self.pc = 0;
        self.ensure_stacks();
        self.exec(0)?;
        if let Some(r) = self.renderer.as_mut() {
            r.flush()?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Register access
    // ---------------------------------------------------------------------

    fn ensure_stacks(&mut self) {
        let need = [
            self.fp[0] + self.func.regs[0] as usize + 1,
            self.fp[1] + self.func.regs[1] as usize + 1,
            self.fp[2] + self.func.regs[2] as usize + 1,
            self.fp[3] + self.func.regs[3] as usize + 1,
        ];
        if self.regs_int.len() < need[0] {
            self.regs_int.resize(need[0].next_power_of_two(), 0);
        }
        if self.regs_float.len() < need[1] {
            self.regs_float.resize(need[1].next_power_of_two(), 0.0);
        }
        if self.regs_str.len() < need[2] {
            self.regs_str.resize(need[2].next_power_of_two(), Arc::from(""));
        }
        if self.regs_gen.len() < need[3] {
            self.regs_gen.resize(need[3].next_power_of_two(), Value::Nil);
        }
    }

    #[inline]
    fn int(&self, r: i8) -> i64 {
        self.regs_int[self.fp[0] + r as usize]
    }

    #[inline]
    fn set_int(&mut self, r: i8, v: i64) {
        self.regs_int[self.fp[0] + r as usize] = v;
    }

    #[inline]
    fn intk(&self, r: i8, k: bool) -> i64 {
        if k {
            self.func.consts_int[r as u8 as usize]
        } else {
            self.int(r)
        }
    }

    #[inline]
    fn float(&self, r: i8) -> f64 {
        self.regs_float[self.fp[1] + r as usize]
    }

    #[inline]
    fn set_float(&mut self, r: i8, v: f64) {
        self.regs_float[self.fp[1] + r as usize] = v;
    }

    #[inline]
    fn floatk(&self, r: i8, k: bool) -> f64 {
        if k {
            self.func.consts_float[r as u8 as usize]
        } else {
            self.float(r)
        }
    }

    #[inline]
    fn str(&self, r: i8) -> Arc<str> {
        self.regs_str[self.fp[2] + r as usize].clone()
    }

    #[inline]
    fn set_str(&mut self, r: i8, v: Arc<str>) {
        self.regs_str[self.fp[2] + r as usize] = v;
    }

    #[inline]
    fn strk(&self, r: i8, k: bool) -> Arc<str> {
        if k {
            self.func.consts_string[r as u8 as usize].clone()
        } else {
            self.str(r)
        }
    }

    #[inline]
    fn gen(&self, r: i8) -> Value {
        self.regs_gen[self.fp[3] + r as usize].clone()
    }

    #[inline]
    fn set_gen(&mut self, r: i8, v: Value) {
        self.regs_gen[self.fp[3] + r as usize] = v;
    }

    #[inline]
    fn genk(&self, r: i8, k: bool) -> Value {
        if k {
            self.func.consts_general[r as u8 as usize].clone()
        } else {
            self.gen(r)
        }
    }

    /// Reads a bank register as a boxed value.
    fn read_bank(&self, bank: i8, r: i8) -> Value {
        match Bank::from_u8(bank as u8) {
            Bank::Int => Value::Int(self.int(r)),
            Bank::Float => Value::Float(self.float(r)),
            Bank::Str => Value::Str(self.str(r)),
            Bank::Gen => self.gen(r),
        }
    }

    /// Writes a boxed value into a register of the given bank.
    fn write_bank(&mut self, bank: i8, r: i8, v: Value) {
        match Bank::from_u8(bank as u8) {
            Bank::Int => {
                let n = as_int(&v);
                self.set_int(r, n);
            }
            Bank::Float => {
                let f = as_float(&v);
                self.set_float(r, f);
            }
            Bank::Str => {
                let s = as_str(&v);
                self.set_str(r, s);
            }
            Bank::Gen => self.set_gen(r, v),
        }
    }

    /// Writes a value into the bank implied by its kind; used by the
    /// instructions whose destination bank follows the element type.
    fn write_value(&mut self, r: i8, v: Value) {
        match v.unboxed() {
            Value::Bool(_) | Value::Int(_) => {
                let n = as_int(&v);
                self.set_int(r, n);
            }
            Value::Float(_) => {
                let f = as_float(&v);
                self.set_float(r, f);
            }
            Value::Str(_) => {
                let s = as_str(&v);
                self.set_str(r, s);
            }
            _ => self.set_gen(r, v),
        }
    }

    fn fault_pos(&self) -> Position {
        self.func.position_at(self.pc.saturating_sub(1) as usize)
    }

    // ---------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------

    /// Executes until the frame that was current at entry returns.
    fn exec(&mut self, base: usize) -> Result<(), RuntimeError> {
        macro_rules! fault {
            ($self:ident, $base:expr, $msg:expr) => {{
                let v = Value::str(&format!("runtime error: {}", $msg));
                match $self.begin_panic(v, $base)? {
                    PanicOutcome::Resume(pc) => {
                        $self.pc = pc;
                        continue;
                    }
                    PanicOutcome::ReturnExec => return Ok(()),
                }
            }};
        }

        loop {
            let in_ = self.func.body[self.pc as usize];
            self.pc += 1;
            let op = in_.opcode();
            let k = in_.k();
            let (a, b, c) = (in_.a, in_.b, in_.c);

            match op {
                Op::Nop => {}

                // -- Integer arithmetic ------------------------------------
                Op::AddInt => {
                    let v = self.int(a).wrapping_add(self.intk(b, k));
                    self.set_int(c, v);
                }
                Op::SubInt => {
                    let v = self.int(a).wrapping_sub(self.intk(b, k));
                    self.set_int(c, v);
                }
                Op::SubInvInt => {
                    let v = self.intk(b, k).wrapping_sub(self.int(a));
                    self.set_int(c, v);
                }
                Op::MulInt => {
                    let v = self.int(a).wrapping_mul(self.intk(b, k));
                    self.set_int(c, v);
                }
                Op::DivInt => {
                    let d = self.intk(b, k);
                    if d == 0 {
                        fault!(self, base, "integer divide by zero");
                    }
                    let v = self.int(a).wrapping_div(d);
                    self.set_int(c, v);
                }
                Op::DivUint => {
                    let d = self.intk(b, k) as u64;
                    if d == 0 {
                        fault!(self, base, "integer divide by zero");
                    }
                    let v = (self.int(a) as u64 / d) as i64;
                    self.set_int(c, v);
                }
                Op::RemInt => {
                    let d = self.intk(b, k);
                    if d == 0 {
                        fault!(self, base, "integer divide by zero");
                    }
                    let v = self.int(a).wrapping_rem(d);
                    self.set_int(c, v);
                }
                Op::RemUint => {
                    let d = self.intk(b, k) as u64;
                    if d == 0 {
                        fault!(self, base, "integer divide by zero");
                    }
                    let v = (self.int(a) as u64 % d) as i64;
                    self.set_int(c, v);
                }

                // -- Float arithmetic --------------------------------------
                Op::AddFloat => {
                    let v = self.float(a) + self.floatk(b, k);
                    self.set_float(c, v);
                }
                Op::SubFloat => {
                    let v = self.float(a) - self.floatk(b, k);
                    self.set_float(c, v);
                }
                Op::SubInvFloat => {
                    let v = self.floatk(b, k) - self.float(a);
                    self.set_float(c, v);
                }
                Op::MulFloat => {
                    let v = self.float(a) * self.floatk(b, k);
                    self.set_float(c, v);
                }
                Op::DivFloat => {
                    let v = self.float(a) / self.floatk(b, k);
                    self.set_float(c, v);
                }

                // -- Complex arithmetic ------------------------------------
                Op::AddComplex | Op::SubComplex | Op::MulComplex | Op::DivComplex => {
                    let (ar, ai) = as_complex(&self.gen(a));
                    let (br, bi) = as_complex(&self.gen(b));
                    let v = match op {
                        Op::AddComplex => (ar + br, ai + bi),
                        Op::SubComplex => (ar - br, ai - bi),
                        Op::MulComplex => (ar * br - ai * bi, ar * bi + ai * br),
                        _ => {
                            let d = br * br + bi * bi;
                            ((ar * br + ai * bi) / d, (ai * br - ar * bi) / d)
                        }
                    };
                    self.set_gen(c, Value::Complex(v.0, v.1));
                }
                Op::ComplexNew => {
                    let v = Value::Complex(self.float(a), self.float(b));
                    self.set_gen(c, v);
                }
                Op::ComplexReal => {
                    let (re, _) = as_complex(&self.gen(a));
                    self.set_float(c, re);
                }
                Op::ComplexImag => {
                    let (_, im) = as_complex(&self.gen(a));
                    self.set_float(c, im);
                }

                // -- Bitwise -----------------------------------------------
                Op::And => {
                    let v = self.int(a) & self.intk(b, k);
                    self.set_int(c, v);
                }
                Op::Or => {
                    let v = self.int(a) | self.intk(b, k);
                    self.set_int(c, v);
                }
                Op::Xor => {
                    let v = self.int(a) ^ self.intk(b, k);
                    self.set_int(c, v);
                }
                Op::AndNot => {
                    let v = self.int(a) & !self.intk(b, k);
                    self.set_int(c, v);
                }
                Op::Shl => {
                    let n = self.intk(b, k);
                    if n < 0 {
                        fault!(self, base, "negative shift amount");
                    }
                    let v = if n >= 64 { 0 } else { self.int(a).wrapping_shl(n as u32) };
                    self.set_int(c, v);
                }
                Op::ShrInt => {
                    let n = self.intk(b, k);
                    if n < 0 {
                        fault!(self, base, "negative shift amount");
                    }
                    let v = if n >= 64 {
                        self.int(a) >> 63
                    } else {
                        self.int(a) >> n
                    };
                    self.set_int(c, v);
                }
                Op::ShrUint => {
                    let n = self.intk(b, k);
                    if n < 0 {
                        fault!(self, base, "negative shift amount");
                    }
                    let v = if n >= 64 { 0 } else { ((self.int(a) as u64) >> n) as i64 };
                    self.set_int(c, v);
                }

                // -- Strings -----------------------------------------------
                Op::Concat => {
                    let x = self.str(a);
                    let y = self.strk(b, k);
                    self.env.alloc((x.len() + y.len()) as i64)?;
                    let mut s = String::with_capacity(x.len() + y.len());
                    s.push_str(&x);
                    s.push_str(&y);
                    self.set_str(c, Arc::from(s.as_str()));
                }
                Op::Contains => {
                    let container = self.gen(a);
                    let needle = self.genk(b, k);
                    let found = match (container.unboxed(), needle.unboxed()) {
                        (Value::Str(s), Value::Str(n)) => s.contains(&**n),
                        (Value::Str(s), Value::Int(r)) => char::from_u32(*r as u32)
                            .map(|ch| s.contains(ch))
                            .unwrap_or(false),
                        (Value::Slice(s), n) => {
                            s.to_vec().iter().any(|x| value_eq(x, n))
                        }
                        (Value::Map(m), n) => match MapKey::from_value(n) {
                            Some(key) => m.lock().contains_key(&key),
                            None => false,
                        },
                        _ => false,
                    };
                    self.set_int(c, found as i64);
                }

                // -- Moves -------------------------------------------------
                Op::MoveInt => {
                    let v = self.intk(b, k);
                    self.set_int(c, v);
                }
                Op::MoveFloat => {
                    let v = self.floatk(b, k);
                    self.set_float(c, v);
                }
                Op::MoveString => {
                    let v = self.strk(b, k);
                    self.set_str(c, v);
                }
                Op::MoveGeneral => {
                    let v = self.genk(b, k);
                    self.set_gen(c, v);
                }

                // -- Conversions -------------------------------------------
                Op::ConvIF => {
                    let v = self.int(a) as f64;
                    self.set_float(c, v);
                }
                Op::ConvUF => {
                    let v = self.int(a) as u64 as f64;
                    self.set_float(c, v);
                }
                Op::ConvFI => {
                    let v = self.float(a);
                    let v = if v.is_nan() { 0 } else { v as i64 };
                    self.set_int(c, v);
                }
                Op::CastInt8 => {
                    let v = self.int(a) as i8 as i64;
                    self.set_int(c, v);
                }
                Op::CastInt16 => {
                    let v = self.int(a) as i16 as i64;
                    self.set_int(c, v);
                }
                Op::CastInt32 => {
                    let v = self.int(a) as i32 as i64;
                    self.set_int(c, v);
                }
                Op::CastUint8 => {
                    let v = self.int(a) as u8 as i64;
                    self.set_int(c, v);
                }
                Op::CastUint16 => {
                    let v = self.int(a) as u16 as i64;
                    self.set_int(c, v);
                }
                Op::CastUint32 => {
                    let v = self.int(a) as u32 as i64;
                    self.set_int(c, v);
                }
                Op::CastFloat32 => {
                    let v = self.float(a) as f32 as f64;
                    self.set_float(c, v);
                }
                Op::ConvRuneString => {
                    let ch = char::from_u32(self.int(a) as u32).unwrap_or('\u{FFFD}');
                    self.set_str(c, Arc::from(ch.to_string().as_str()));
                }
                Op::ConvBytesString => {
                    let v = self.gen(a);
                    let s = match v.unboxed() {
                        Value::Bytes(b) => String::from_utf8_lossy(&b.lock()).to_string(),
                        Value::Slice(sl) => {
                            let bytes: Vec<u8> =
                                sl.to_vec().iter().map(|x| as_int(x) as u8).collect();
                            String::from_utf8_lossy(&bytes).to_string()
                        }
                        Value::Nil => String::new(),
                        _ => String::new(),
                    };
                    self.env.alloc(s.len() as i64)?;
                    self.set_str(c, Arc::from(s.as_str()));
                }
                Op::ConvStringBytes => {
                    let s = self.str(a);
                    self.env.alloc(s.len() as i64)?;
                    let items: Vec<Value> =
                        s.bytes().map(|b| Value::Int(b as i64)).collect();
                    self.set_gen(c, Value::Slice(SliceVal::from_vec(items)));
                }
                Op::ConvRunesString => {
                    let v = self.gen(a);
                    let s: String = match v.unboxed() {
                        Value::Slice(sl) => sl
                            .to_vec()
                            .iter()
                            .filter_map(|x| char::from_u32(as_int(x) as u32))
                            .collect(),
                        _ => String::new(),
                    };
                    self.set_str(c, Arc::from(s.as_str()));
                }
                Op::ConvStringRunes => {
                    let s = self.str(a);
                    let items: Vec<Value> =
                        s.chars().map(|ch| Value::Int(ch as i64)).collect();
                    self.set_gen(c, Value::Slice(SliceVal::from_vec(items)));
                }

                // -- Boxing ------------------------------------------------
                Op::BoxInt => {
                    let v = Value::Int(self.int(b));
                    self.set_gen(c, v);
                }
                Op::BoxFloat => {
                    let v = Value::Float(self.float(b));
                    self.set_gen(c, v);
                }
                Op::BoxString => {
                    let v = Value::Str(self.str(b));
                    self.set_gen(c, v);
                }
                Op::UnboxInt => {
                    let v = as_int(&self.gen(a));
                    self.set_int(c, v);
                }
                Op::UnboxFloat => {
                    let v = as_float(&self.gen(a));
                    self.set_float(c, v);
                }
                Op::UnboxString => {
                    let v = as_str(&self.gen(a));
                    self.set_str(c, v);
                }
                Op::Typify => {
                    let ty = self.func.types[a as u8 as usize];
                    let v = self.typify(ty, b);
                    self.set_gen(c, v);
                }

                // -- Branches ----------------------------------------------
                Op::IfInt => {
                    let x = self.int(a);
                    let y = self.intk(c, k);
                    if int_cond(Cond::from_u8(b as u8), x, y) {
                        self.pc += 1;
                    }
                }
                Op::IfUint => {
                    let x = self.int(a) as u64;
                    let y = self.intk(c, k) as u64;
                    let cond = match Cond::from_u8(b as u8) {
                        Cond::Eq => x == y,
                        Cond::NotEq => x != y,
                        Cond::Less => x < y,
                        Cond::LessEq => x <= y,
                        Cond::Greater => x > y,
                        Cond::GreaterEq => x >= y,
                        _ => false,
                    };
                    if cond {
                        self.pc += 1;
                    }
                }
                Op::IfFloat => {
                    let x = self.float(a);
                    let y = self.floatk(c, k);
                    let cond = match Cond::from_u8(b as u8) {
                        Cond::Eq => x == y,
                        Cond::NotEq => x != y,
                        Cond::Less => x < y,
                        Cond::LessEq => x <= y,
                        Cond::Greater => x > y,
                        Cond::GreaterEq => x >= y,
                        _ => false,
                    };
                    if cond {
                        self.pc += 1;
                    }
                }
                Op::IfString => {
                    let x = self.str(a);
                    let cond = match Cond::from_u8(b as u8) {
                        Cond::Eq => *x == *self.strk(c, k),
                        Cond::NotEq => *x != *self.strk(c, k),
                        Cond::Less => *x < *self.strk(c, k),
                        Cond::LessEq => *x <= *self.strk(c, k),
                        Cond::Greater => *x > *self.strk(c, k),
                        Cond::GreaterEq => *x >= *self.strk(c, k),
                        // Length conditions compare against an int.
                        Cond::EqLen => x.len() as i64 == self.intk(c, k),
                        Cond::NotEqLen => x.len() as i64 != self.intk(c, k),
                        Cond::LessLen => (x.len() as i64) < self.intk(c, k),
                        Cond::LessEqLen => x.len() as i64 <= self.intk(c, k),
                        Cond::GreaterLen => x.len() as i64 > self.intk(c, k),
                        Cond::GreaterEqLen => x.len() as i64 >= self.intk(c, k),
                        _ => false,
                    };
                    if cond {
                        self.pc += 1;
                    }
                }
                Op::If => {
                    let x = self.gen(a);
                    let cond = match Cond::from_u8(b as u8) {
                        Cond::Nil => matches!(x.unboxed(), Value::Nil),
                        Cond::NotNil => !matches!(x.unboxed(), Value::Nil),
                        Cond::Eq => value_eq(&x, &self.genk(c, k)),
                        Cond::NotEq => !value_eq(&x, &self.genk(c, k)),
                        _ => false,
                    };
                    if cond {
                        self.pc += 1;
                    }
                }
                Op::Goto => {
                    let target = in_.addr();
                    if target <= self.pc {
                        self.env.check()?; // back branch safepoint
                    }
                    self.pc = target;
                }
                Op::JmpOk => {
                    if self.ok {
                        self.pc = in_.addr();
                    }
                }
                Op::JmpNotOk => {
                    if !self.ok {
                        self.pc = in_.addr();
                    }
                }
                Op::Ok => {
                    let v = self.ok as i64;
                    self.set_int(c, v);
                }

                // -- Calls -------------------------------------------------
                Op::Call => {
                    self.env.check()?;
                    let word = self.func.body[self.pc as usize];
                    self.pc += 1;
                    let shift =
                        [word.op as usize, word.a as u8 as usize, word.b as u8 as usize, word.c as u8 as usize];
                    let (callee, cvars) = if a == NO_PACKAGE {
                        match self.gen(b).unboxed().clone() {
                            Value::Closure(cl) => (cl.func.clone(), cl.cvars.clone()),
                            Value::Nil => {
                                fault!(self, base, "invalid memory address or nil pointer dereference")
                            }
                            Value::Native(nf) => {
                                // A bare native value has no register
                                // window; it must come through a stub.
                                let _ = nf;
                                fault!(self, base, "call of unwrapped native function")
                            }
                            _ => fault!(self, base, "call of non-function value"),
                        }
                    } else {
                        (self.func.funcs[b as u8 as usize].clone(), Vec::new())
                    };
                    if let Some(nf) = &callee.native {
                        // Native stub: marshal the window through values.
                        let args = self.collect_args(&callee, &shift);
                        let results = nf(args).map_err(native_err)?;
                        self.spread_results(&callee, &shift, results);
                    } else {
                        self.calls.push(Frame {
                            func: self.func.clone(),
                            cvars: std::mem::take(&mut self.cvars),
                            fp: self.fp,
                            pc: self.pc,
                            tail: false,
                        });
                        for bnk in 0..4 {
                            self.fp[bnk] += shift[bnk];
                        }
                        self.func = callee;
                        self.cvars = cvars;
                        self.ensure_stacks();
                        self.pc = 0;
                    }
                }
                Op::TailCall => {
                    self.env.check()?;
                    let word = self.func.body[self.pc as usize];
                    self.pc += 1;
                    let _ = word;
                    self.calls.push(Frame {
                        func: self.func.clone(),
                        cvars: std::mem::take(&mut self.cvars),
                        fp: self.fp,
                        pc: self.pc,
                        tail: true,
                    });
                    let (callee, cvars) = if a == NO_PACKAGE {
                        match self.gen(b).unboxed().clone() {
                            Value::Closure(cl) => (cl.func.clone(), cl.cvars.clone()),
                            _ => fault!(self, base, "call of non-function value"),
                        }
                    } else {
                        (self.func.funcs[b as u8 as usize].clone(), Vec::new())
                    };
                    self.func = callee;
                    self.cvars = cvars;
                    self.ensure_stacks();
                    self.pc = 0;
                }
                Op::CallNative => {
                    self.env.check()?;
                    let f = self.gen(b);
                    let argc = a as usize;
                    let mut args = Vec::with_capacity(argc);
                    for i in 0..argc {
                        args.push(self.gen(c + i as i8));
                    }
                    let nf = match f.unboxed() {
                        Value::Native(nf) => nf.clone(),
                        _ => fault!(self, base, "call of non-function value"),
                    };
                    match nf(args) {
                        Ok(results) => {
                            for (i, v) in results.into_iter().enumerate() {
                                self.set_gen(c + i as i8, v);
                            }
                        }
                        Err(RuntimeError::Panic(p)) => {
                            for e in p.chain {
                                self.panic_chain.push(e);
                            }
                            let v = Value::Nil;
                            match self.unwind(v, base, false)? {
                                PanicOutcome::Resume(pc) => {
                                    self.pc = pc;
                                }
                                PanicOutcome::ReturnExec => return Ok(()),
                            }
                        }
                        Err(RuntimeError::Custom(msg)) => {
                            let v = Value::str(&msg);
                            match self.begin_panic(v, base)? {
                                PanicOutcome::Resume(pc) => {
                                    self.pc = pc;
                                }
                                PanicOutcome::ReturnExec => return Ok(()),
                            }
                        }
                        Err(other) => return Err(other),
                    }
                }
                Op::Defer => {
                    let argc = a as usize;
                    let fn_val = self.gen(b);
                    let mut args = Vec::with_capacity(argc);
                    for i in 0..argc {
                        args.push(self.gen(b + 1 + i as i8));
                    }
                    self.defers.push(DeferEntry { depth: self.calls.len(), fn_val, args });
                }
                Op::Return => {
                    // Run the deferred calls of this frame.
                    if let Some(out) = self.run_frame_defers(base)? {
                        match out {
                            PanicOutcome::Resume(pc) => {
                                self.pc = pc;
                                continue;
                            }
                            PanicOutcome::ReturnExec => return Ok(()),
                        }
                    }
                    if self.calls.len() == base {
                        return Ok(());
                    }
                    // Pop tail-call frames too.
                    loop {
                        let frame = self.calls.pop().expect("call stack underflow");
                        let tail = frame.tail;
                        self.func = frame.func;
                        self.cvars = frame.cvars;
                        self.fp = frame.fp;
                        self.pc = frame.pc;
                        if !tail {
                            break;
                        }
                        if self.calls.len() == base {
                            return Ok(());
                        }
                    }
                }
                Op::Panic => {
                    let v = self.gen(a);
                    match self.begin_panic(v, base)? {
                        PanicOutcome::Resume(pc) => {
                            self.pc = pc;
                        }
                        PanicOutcome::ReturnExec => return Ok(()),
                    }
                }
                Op::Recover => {
                    let v = if self.in_defer > 0 && self.cur_panic.is_some() && !self.recovered
                    {
                        self.recovered = true;
                        if let Some(last) = self.panic_chain.last_mut() {
                            last.recovered = true;
                        }
                        self.cur_panic.take().unwrap_or(Value::Nil)
                    } else {
                        Value::Nil
                    };
                    self.set_gen(c, v);
                }

                // -- Allocation --------------------------------------------
                Op::New => {
                    let ty = self.func.types[a as u8 as usize];
                    let zero = zero_value(&self.code.registry, ty);
                    self.env.alloc(32)?;
                    let v = if b == 1 { zero } else { Value::new_cell(zero) };
                    self.set_gen(c, v);
                }
                Op::MakeSlice => {
                    let word = self.func.body[self.pc as usize];
                    self.pc += 1;
                    let len_k = word.b & 1 != 0;
                    let cap_k = word.b & 2 != 0;
                    let len = self.intk(b, len_k || k);
                    let cap = self.intk(word.a, cap_k || k).max(len);
                    if len < 0 || cap < len {
                        fault!(self, base, "makeslice: len out of range");
                    }
                    self.env.alloc(cap * 16)?;
                    let s = SliceVal::with_capacity(len as u32, cap as u32);
                    // Element zero values follow the slice type.
                    let ty = self.func.types[a as u8 as usize];
                    if let Type::Slice(elem) = self.code.registry.get(self.code.registry.underlying(ty))
                    {
                        let z = zero_value(&self.code.registry, *elem);
                        for i in 0..len as usize {
                            s.set(i, z.clone());
                        }
                    }
                    self.set_gen(c, Value::Slice(s));
                }
                Op::MakeMap => {
                    let n = self.intk(b, k).max(0);
                    self.env.alloc(n * 32 + 48)?;
                    self.set_gen(
                        c,
                        Value::Map(Arc::new(Mutex::new(std::collections::HashMap::new()))),
                    );
                }
                Op::MakeChan => {
                    let n = self.intk(b, k).max(0);
                    self.env.alloc(n * 16 + 96)?;
                    self.set_gen(c, Value::Chan(Arc::new(Channel::new(n as usize))));
                }
                Op::Append => {
                    self.env.alloc(16)?;
                    let v = self.gen(a);
                    let s = self.gen(b);
                    let out = match s.unboxed() {
                        Value::Slice(sl) => Value::Slice(sl.push(v)),
                        Value::Nil => Value::Slice(SliceVal::from_vec(vec![v])),
                        _ => fault!(self, base, "append of non-slice value"),
                    };
                    self.set_gen(c, out);
                }
                Op::AppendSlice => {
                    let other = self.gen(a);
                    let s = self.gen(b);
                    let items = match other.unboxed() {
                        Value::Slice(sl) => sl.to_vec(),
                        Value::Nil => Vec::new(),
                        _ => fault!(self, base, "append of non-slice value"),
                    };
                    self.env.alloc(items.len() as i64 * 16)?;
                    let mut cur = match s.unboxed() {
                        Value::Slice(sl) => sl.clone(),
                        Value::Nil => SliceVal::from_vec(Vec::new()),
                        _ => fault!(self, base, "append of non-slice value"),
                    };
                    for v in items {
                        cur = cur.push(v);
                    }
                    self.set_gen(c, Value::Slice(cur));
                }
                Op::Copy => {
                    let dst = self.gen(a);
                    let src = self.gen(b);
                    let n = match (dst.unboxed(), src.unboxed()) {
                        (Value::Slice(d), Value::Slice(s)) => {
                            let items = s.to_vec();
                            let n = items.len().min(d.len as usize);
                            for (i, v) in items.into_iter().take(n).enumerate() {
                                d.set(i, v);
                            }
                            n
                        }
                        (Value::Slice(d), Value::Str(s)) => {
                            let bytes = s.as_bytes();
                            let n = bytes.len().min(d.len as usize);
                            for (i, &byte) in bytes.iter().take(n).enumerate() {
                                d.set(i, Value::Int(byte as i64));
                            }
                            n
                        }
                        _ => 0,
                    };
                    self.set_int(c, n as i64);
                }
                Op::Delete => {
                    let m = self.gen(a);
                    let key = self.gen(b);
                    if let Value::Map(m) = m.unboxed() {
                        if let Some(k) = MapKey::from_value(&key) {
                            m.lock().remove(&k);
                        }
                    }
                }
                Op::Len => {
                    let n = if a == 0 {
                        self.str(b).len() as i64
                    } else {
                        match self.gen(b).unboxed() {
                            Value::Slice(s) => s.len as i64,
                            Value::Map(m) => m.lock().len() as i64,
                            Value::Bytes(x) => x.lock().len() as i64,
                            Value::Chan(ch) => ch.len() as i64,
                            Value::Str(s) => s.len() as i64,
                            Value::Nil => 0,
                            _ => 0,
                        }
                    };
                    self.set_int(c, n);
                }
                Op::Cap => {
                    let n = match self.gen(b).unboxed() {
                        Value::Slice(s) => s.cap as i64,
                        Value::Chan(ch) => ch.cap() as i64,
                        Value::Nil => 0,
                        _ => 0,
                    };
                    self.set_int(c, n);
                }
                Op::SliceIndex => {
                    let s = self.gen(a);
                    let i = self.intk(b, k);
                    match s.unboxed() {
                        Value::Slice(sl) => match sl.get(i.max(0) as usize) {
                            Some(v) if i >= 0 => self.write_value(c, v),
                            _ => fault!(
                                self,
                                base,
                                format!("index out of range [{i}] with length {}", sl.len)
                            ),
                        },
                        Value::Bytes(bts) => {
                            let bts = bts.lock();
                            if i < 0 || i as usize >= bts.len() {
                                let n = bts.len();
                                drop(bts);
                                fault!(self, base, format!("index out of range [{i}] with length {n}"));
                            }
                            let v = bts[i as usize] as i64;
                            drop(bts);
                            self.set_int(c, v);
                        }
                        Value::Nil => {
                            fault!(self, base, format!("index out of range [{i}] with length 0"))
                        }
                        _ => fault!(self, base, "indexing a non-slice value"),
                    }
                }
                Op::StringIndex => {
                    let s = self.str(a);
                    let i = self.intk(b, k);
                    if i < 0 || i as usize >= s.len() {
                        fault!(
                            self,
                            base,
                            format!("index out of range [{i}] with length {}", s.len())
                        );
                    }
                    let v = s.as_bytes()[i as usize] as i64;
                    self.set_int(c, v);
                }
                Op::MapIndex => {
                    let m = self.gen(a);
                    let key = self.gen(b);
                    match m.unboxed() {
                        Value::Map(m) => match MapKey::from_value(&key) {
                            Some(mk) => match m.lock().get(&mk) {
                                Some(v) => {
                                    let v = v.clone();
                                    self.write_value(c, v);
                                    self.ok = true;
                                }
                                None => self.ok = false,
                            },
                            None => fault!(self, base, "invalid map key"),
                        },
                        Value::Nil => self.ok = false,
                        _ => fault!(self, base, "indexing a non-map value"),
                    }
                }
                Op::SetSlice => {
                    let v = self.gen(a);
                    let s = self.gen(b);
                    let i = self.intk(c, k);
                    match s.unboxed() {
                        Value::Slice(sl) => {
                            if i < 0 || !sl.set(i as usize, v) {
                                fault!(
                                    self,
                                    base,
                                    format!("index out of range [{i}] with length {}", sl.len)
                                );
                            }
                        }
                        _ => fault!(self, base, "assignment to entry in nil slice"),
                    }
                }
                Op::SetMap => {
                    let v = self.gen(a);
                    let m = self.gen(b);
                    let key = self.gen(c);
                    match m.unboxed() {
                        Value::Map(m) => match MapKey::from_value(&key) {
                            Some(mk) => {
                                self.env.alloc(32)?;
                                m.lock().insert(mk, v);
                            }
                            None => fault!(self, base, "invalid map key"),
                        },
                        Value::Nil => fault!(self, base, "assignment to entry in nil map"),
                        _ => fault!(self, base, "assignment to entry in non-map value"),
                    }
                }
                Op::Field => {
                    let st = self.gen(a);
                    match st.unboxed() {
                        Value::Struct(fields) => {
                            let v = fields
                                .lock()
                                .get(b as u8 as usize)
                                .cloned()
                                .unwrap_or(Value::Nil);
                            self.write_value(c, v);
                        }
                        Value::Nil => {
                            fault!(self, base, "invalid memory address or nil pointer dereference")
                        }
                        _ => fault!(self, base, "field access on non-struct value"),
                    }
                }
                Op::SetField => {
                    let v = self.gen(a);
                    let st = self.gen(b);
                    match st.unboxed() {
                        Value::Struct(fields) => {
                            let mut fields = fields.lock();
                            let idx = c as u8 as usize;
                            if idx < fields.len() {
                                fields[idx] = v;
                            }
                        }
                        _ => fault!(self, base, "field assignment on non-struct value"),
                    }
                }
                Op::GetVar => {
                    let g = self.globals[b as u8 as usize].lock().clone();
                    self.write_bank(a, c, g);
                }
                Op::SetVar => {
                    let v = self.read_bank(c, a);
                    *self.globals[b as u8 as usize].lock() = v;
                }
                Op::LoadPtr => {
                    let cell = self.gen(a);
                    match cell.unboxed() {
                        Value::Ptr(p) => {
                            let v = p.lock().clone();
                            self.write_bank(b, c, v);
                        }
                        Value::Nil => {
                            fault!(self, base, "invalid memory address or nil pointer dereference")
                        }
                        _ => fault!(self, base, "indirect through non-pointer value"),
                    }
                }
                Op::StorePtr => {
                    let v = self.read_bank(c, a);
                    let cell = self.gen(b);
                    match cell.unboxed() {
                        Value::Ptr(p) => *p.lock() = v,
                        Value::Nil => {
                            fault!(self, base, "invalid memory address or nil pointer dereference")
                        }
                        _ => fault!(self, base, "indirect through non-pointer value"),
                    }
                }
                Op::GetCVar => {
                    let v = self.cvars.get(b as u8 as usize).cloned().unwrap_or(Value::Nil);
                    self.set_gen(c, v);
                }
                Op::Func => {
                    let sub = self.func.funcs[b as u8 as usize].clone();
                    let mut cvars = Vec::with_capacity(sub.crefs.len());
                    for &cref in &sub.crefs {
                        if cref >= 0 {
                            cvars.push(
                                self.cvars.get(cref as usize).cloned().unwrap_or(Value::Nil),
                            );
                        } else {
                            cvars.push(self.gen((-cref - 1) as i8));
                        }
                    }
                    self.env.alloc(64)?;
                    self.set_gen(c, Value::Closure(Arc::new(Closure { func: sub, cvars })));
                }
                Op::Assert => {
                    let v = self.gen(a);
                    let target = self.func.types[b as u8 as usize];
                    let ok = self.type_matches(&v, target);
                    if ok {
                        let inner = v.unboxed().clone();
                        let bank = Bank::of(&self.code.registry, target);
                        let keep_box = bank == Bank::Gen
                            && self.code.registry.is_interface(target);
                        if keep_box {
                            self.set_gen(c, v);
                        } else {
                            self.write_bank(bank as u8 as i8, c, inner);
                        }
                    }
                    self.ok = ok;
                }
                Op::Slice | Op::SliceString => {
                    let word = self.func.body[self.pc as usize];
                    self.pc += 1;
                    let low_omit = word.c & 1 != 0;
                    let high_omit = word.c & 2 != 0;
                    let low = if low_omit { 0 } else { self.int(word.op as i8) };
                    if op == Op::SliceString {
                        let s = self.str(a);
                        let high = if high_omit { s.len() as i64 } else { self.int(word.a) };
                        if low < 0 || high < low || high as usize > s.len() {
                            fault!(self, base, "slice bounds out of range");
                        }
                        if !s.is_char_boundary(low as usize) || !s.is_char_boundary(high as usize)
                        {
                            fault!(self, base, "slice bounds not on character boundary");
                        }
                        let out = Arc::from(&s[low as usize..high as usize]);
                        self.set_str(c, out);
                    } else {
                        let v = self.gen(a);
                        match v.unboxed() {
                            Value::Slice(sl) => {
                                let high =
                                    if high_omit { sl.len as i64 } else { self.int(word.a) };
                                let has_max = word.c & 4 != 0;
                                let max = if has_max { self.int(word.b) } else { sl.cap as i64 };
                                if low < 0
                                    || high < low
                                    || high > sl.cap as i64
                                    || max < high
                                    || max > sl.cap as i64
                                {
                                    fault!(self, base, "slice bounds out of range");
                                }
                                let out = SliceVal {
                                    buf: sl.buf.clone(),
                                    off: sl.off + low as u32,
                                    len: (high - low) as u32,
                                    cap: (max - low) as u32,
                                };
                                self.set_gen(c, Value::Slice(out));
                            }
                            Value::Nil if low == 0 => {
                                self.set_gen(c, Value::Slice(SliceVal::from_vec(Vec::new())));
                            }
                            _ => fault!(self, base, "slice of non-slice value"),
                        }
                    }
                }

                // -- Concurrency -------------------------------------------
                Op::Send => {
                    let ch = self.gen(a);
                    let v = self.gen(b);
                    match ch.unboxed() {
                        Value::Chan(ch) => {
                            let env = self.env.clone();
                            let check = move || env.check();
                            match ch.send(v, &check) {
                                Ok(()) => {}
                                Err(RuntimeError::Panic(p)) => {
                                    for e in p.chain {
                                        self.panic_chain.push(e);
                                    }
                                    match self.unwind(Value::Nil, base, false)? {
                                        PanicOutcome::Resume(pc) => self.pc = pc,
                                        PanicOutcome::ReturnExec => return Ok(()),
                                    }
                                }
                                Err(e) => return Err(e),
                            }
                        }
                        Value::Nil => fault!(self, base, "send on nil channel"),
                        _ => fault!(self, base, "send on non-channel value"),
                    }
                }
                Op::Receive => {
                    let ch = self.gen(a);
                    match ch.unboxed() {
                        Value::Chan(ch) => {
                            let env = self.env.clone();
                            let check = move || env.check();
                            match ch.recv(&check)? {
                                Some(v) => {
                                    self.set_gen(c, v);
                                    self.ok = true;
                                }
                                None => {
                                    self.set_gen(c, Value::Nil);
                                    self.ok = false;
                                }
                            }
                        }
                        Value::Nil => fault!(self, base, "receive on nil channel"),
                        _ => fault!(self, base, "receive on non-channel value"),
                    }
                }
                Op::CloseChan => {
                    let ch = self.gen(a);
                    match ch.unboxed() {
                        Value::Chan(ch) => {
                            if !ch.close() {
                                fault!(self, base, "close of closed channel");
                            }
                        }
                        Value::Nil => fault!(self, base, "close of nil channel"),
                        _ => fault!(self, base, "close of non-channel value"),
                    }
                }
                Op::Select => {
                    let spec = self.func.selects[a as u8 as usize].clone();
                    let target = self.exec_select(&spec)?;
                    self.pc = target;
                }
                Op::Spawn => {
                    let argc = a as usize;
                    let fn_val = self.gen(b);
                    let mut args = Vec::with_capacity(argc);
                    for i in 0..argc {
                        args.push(self.gen(b + 1 + i as i8));
                    }
                    self.env.alloc(1024)?;
                    let code = self.code.clone();
                    let env = self.env.clone();
                    let globals = self.globals.clone();
                    std::thread::spawn(move || {
                        let mut vm = Vm::new(code, env, globals, None);
                        // A goroutine failure does not stop the main run.
                        let _ = vm.run_call_values(fn_val, args);
                    });
                }

                // -- Range iteration ---------------------------------------
                Op::RangeNew => {
                    let iter = if b == 1 {
                        let s = self.str(c);
                        RangeIter::Str {
                            chars: s.char_indices().map(|(i, ch)| (i as i64, ch)).collect(),
                            i: 0,
                        }
                    } else {
                        match self.gen(c).unboxed().clone() {
                            Value::Slice(sl) => RangeIter::Items {
                                items: sl
                                    .to_vec()
                                    .into_iter()
                                    .enumerate()
                                    .map(|(i, v)| (Value::Int(i as i64), v))
                                    .collect(),
                                i: 0,
                            },
                            Value::Bytes(bts) => RangeIter::Items {
                                items: bts
                                    .lock()
                                    .iter()
                                    .enumerate()
                                    .map(|(i, &v)| (Value::Int(i as i64), Value::Int(v as i64)))
                                    .collect(),
                                i: 0,
                            },
                            Value::Map(m) => {
                                let mut items: Vec<(Value, Value)> = m
                                    .lock()
                                    .iter()
                                    .map(|(k, v)| (k.to_value(), v.clone()))
                                    .collect();
                                // Deterministic iteration keeps rendered
                                // output reproducible.
                                items.sort_by(|x, y| {
                                    format_value(&x.0).cmp(&format_value(&y.0))
                                });
                                RangeIter::Items { items, i: 0 }
                            }
                            Value::Str(s) => RangeIter::Str {
                                chars: s.char_indices().map(|(i, ch)| (i as i64, ch)).collect(),
                                i: 0,
                            },
                            Value::Chan(ch) => RangeIter::Chan(ch),
                            Value::Nil => RangeIter::Items { items: Vec::new(), i: 0 },
                            _ => fault!(self, base, "range over unsupported value"),
                        }
                    };
                    self.iters.push(iter);
                }
                Op::RangeNext => {
                    self.env.check()?;
                    let word = self.func.body[self.pc as usize];
                    self.pc += 1;
                    let exit = word.addr();
                    let next: Option<(Value, Value)> = match self.iters.last_mut() {
                        Some(RangeIter::Items { items, i }) => {
                            if *i < items.len() {
                                let pair = items[*i].clone();
                                *i += 1;
                                Some(pair)
                            } else {
                                None
                            }
                        }
                        Some(RangeIter::Str { chars, i }) => {
                            if *i < chars.len() {
                                let (idx, ch) = chars[*i];
                                *i += 1;
                                Some((Value::Int(idx), Value::Int(ch as i64)))
                            } else {
                                None
                            }
                        }
                        Some(RangeIter::Chan(ch)) => {
                            let ch = ch.clone();
                            let env = self.env.clone();
                            let check = move || env.check();
                            ch.recv(&check)?.map(|v| (v, Value::Nil))
                        }
                        None => None,
                    };
                    match next {
                        Some((kv, vv)) => {
                            if a != 0 {
                                self.write_value(a, kv);
                            }
                            if b != 0 {
                                self.write_value(b, vv);
                            }
                        }
                        None => {
                            self.iters.pop();
                            self.pc = exit;
                        }
                    }
                }
                Op::RangePop => {
                    self.iters.pop();
                }

                // -- Template ----------------------------------------------
                Op::Text => {
                    let s = self.func.consts_string[b as u8 as usize].clone();
                    if !self.render_text(&s)? {
                        fault!(self, base, "rendering without an output writer");
                    }
                }
                Op::Show => {
                    let ty = self.func.types[b as u8 as usize];
                    let data = self.read_show_data(a, ty);
                    let ctx = context_from_code(c);
                    if !self.render_show(ty, &data, ctx)? {
                        fault!(self, base, "rendering without an output writer");
                    }
                }
                Op::UrlStart => {
                    if let Some(r) = self.renderer.as_mut() {
                        r.url_start(a & 1 != 0);
                    }
                }
                Op::UrlEnd => {
                    if let Some(r) = self.renderer.as_mut() {
                        r.url_end();
                    }
                }

                // -- Builtins ----------------------------------------------
                Op::Print => {
                    let v = self.read_bank(a, b);
                    let s = format_value(&v);
                    match &self.env.print {
                        Some(p) => p(&s),
                        None => eprint!("{s}"),
                    }
                }
                Op::Println => match &self.env.print {
                    Some(p) => p("\n"),
                    None => eprintln!(),
                },
                Op::Exit => {
                    let code = self.intk(b, k);
                    return Err(RuntimeError::Exit(code as i32));
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Calls through boxed values
    // ---------------------------------------------------------------------

    /// Calls a function value with boxed arguments; used by deferred
    /// calls, goroutines and the select machinery.
    pub fn run_call_values(
        &mut self,
        f: Value,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, RuntimeError> {
        match f.unboxed().clone() {
            Value::Native(nf) => nf(args).map_err(native_err),
            Value::Closure(cl) => {
                if let Some(nf) = &cl.func.native {
                    return nf(args).map_err(native_err);
                }
                let saved_fn = std::mem::replace(&mut self.func, cl.func.clone());
                let saved_cvars = std::mem::replace(&mut self.cvars, cl.cvars.clone());
                let saved_fp = self.fp;
                let saved_pc = self.pc;
                // The callee window begins above the current frame.
                for bnk in 0..4 {
                    self.fp[bnk] += saved_fn.regs[bnk] as usize;
                }
                self.ensure_stacks();
                self.marshal_args(&cl.func, args);
                self.pc = 0;
                let base = self.calls.len();
                let result = self.exec(base);
                let out = result.map(|()| self.collect_results(&cl.func));
                self.func = saved_fn;
                self.cvars = saved_cvars;
                self.fp = saved_fp;
                self.pc = saved_pc;
                out
            }
            Value::Nil => Err(RuntimeError::Panic(PanicError {
                chain: vec![PanicEntry {
                    message: "runtime error: invalid memory address or nil pointer dereference"
                        .to_string(),
                    recovered: false,
                }],
            })),
            _ => Err(RuntimeError::Custom(Arc::from("call of non-function value"))),
        }
    }

    /// Places boxed arguments into the parameter registers of `callee`,
    /// which occupy the window after its result registers.
    fn marshal_args(&mut self, callee: &Function, args: Vec<Value>) {
        let reg = self.code.registry.clone();
        let mut next = callee.out_counts;
        for (i, v) in args.into_iter().enumerate() {
            let ty = callee.ins.get(i).copied().unwrap_or(crate::types::ANY);
            let bank = Bank::of(&reg, ty);
            next[bank as usize] += 1;
            let r = next[bank as usize] as i8;
            self.write_bank(bank as u8 as i8, r, v);
        }
    }

    fn collect_results(&mut self, callee: &Function) -> Vec<Value> {
        let reg = self.code.registry.clone();
        let mut seen = [0u8; 4];
        let mut out = Vec::with_capacity(callee.outs.len());
        for &ty in &callee.outs {
            let bank = Bank::of(&reg, ty);
            seen[bank as usize] += 1;
            let r = seen[bank as usize] as i8;
            out.push(self.read_bank(bank as u8 as i8, r));
        }
        out
    }

    /// Reads window arguments for a native stub called with the register
    /// convention.
    fn collect_args(&mut self, callee: &Function, shift: &[usize; 4]) -> Vec<Value> {
        let reg = self.code.registry.clone();
        let mut next = callee.out_counts;
        let mut out = Vec::with_capacity(callee.ins.len());
        let saved = self.fp;
        for bnk in 0..4 {
            self.fp[bnk] += shift[bnk];
        }
        for &ty in &callee.ins {
            let bank = Bank::of(&reg, ty);
            next[bank as usize] += 1;
            out.push(self.read_bank(bank as u8 as i8, next[bank as usize] as i8));
        }
        self.fp = saved;
        out
    }

    fn spread_results(&mut self, callee: &Function, shift: &[usize; 4], results: Vec<Value>) {
        let reg = self.code.registry.clone();
        let saved = self.fp;
        for bnk in 0..4 {
            self.fp[bnk] += shift[bnk];
        }
        let mut seen = [0u8; 4];
        for (i, v) in results.into_iter().enumerate() {
            let ty = callee.outs.get(i).copied().unwrap_or(crate::types::ANY);
            let bank = Bank::of(&reg, ty);
            seen[bank as usize] += 1;
            self.write_bank(bank as u8 as i8, seen[bank as usize] as i8, v);
        }
        self.fp = saved;
    }

    // ---------------------------------------------------------------------
    // Panics and defers
    // ---------------------------------------------------------------------

    fn begin_panic(
        &mut self,
        value: Value,
        base: usize,
    ) -> Result<PanicOutcome, RuntimeError> {
        self.panic_chain.push(PanicEntry {
            message: format_value(&value),
            recovered: false,
        });
        self.unwind(value, base, true)
    }

    /// Unwinds frames running deferred calls until a `recover` stops the
    /// panic or the chain escapes `base`.
    fn unwind(
        &mut self,
        value: Value,
        base: usize,
        _fresh: bool,
    ) -> Result<PanicOutcome, RuntimeError> {
        self.cur_panic = Some(value);
        self.recovered = false;
        loop {
            if let Some(out) = self.run_frame_defers(base)? {
                return Ok(out);
            }
            if self.recovered {
                // Recovered: the panicking frame returns normally.
                self.recovered = false;
                self.cur_panic = None;
                if self.calls.len() == base {
                    return Ok(PanicOutcome::ReturnExec);
                }
                let frame = self.calls.pop().expect("call stack underflow");
                let pc = frame.pc;
                self.func = frame.func;
                self.cvars = frame.cvars;
                self.fp = frame.fp;
                return Ok(PanicOutcome::Resume(pc));
            }
            if self.calls.len() == base {
                let chain = std::mem::take(&mut self.panic_chain);
                self.cur_panic = None;
                return Err(RuntimeError::Panic(PanicError { chain }));
            }
            let frame = self.calls.pop().expect("call stack underflow");
            self.func = frame.func;
            self.cvars = frame.cvars;
            self.fp = frame.fp;
            self.pc = frame.pc;
        }
    }

    /// Runs the deferred calls registered by the current frame. Returns
    /// an outcome when a panic raised inside a deferred call unwound past
    /// this frame.
    fn run_frame_defers(&mut self, base: usize) -> Result<Option<PanicOutcome>, RuntimeError> {
        let depth = self.calls.len();
        while let Some(last) = self.defers.last() {
            if last.depth != depth {
                break;
            }
            let d = self.defers.pop().expect("defer entry");
            self.in_defer += 1;
            let res = self.run_call_values(d.fn_val, d.args);
            self.in_defer -= 1;
            match res {
                Ok(_) => {}
                Err(RuntimeError::Panic(p)) => {
                    // A deferred call panicked: the chain continues.
                    for e in p.chain {
                        self.panic_chain.push(e);
                    }
                    self.cur_panic = Some(Value::Nil);
                    let out = self.unwind_inner_after_defer(base)?;
                    return Ok(out);
                }
                Err(other) => return Err(other),
            }
            if self.recovered {
                break;
            }
        }
        Ok(None)
    }

    fn unwind_inner_after_defer(
        &mut self,
        base: usize,
    ) -> Result<Option<PanicOutcome>, RuntimeError> {
        // Remaining defers of this frame still run as the panic passes.
        let panic_val = self.cur_panic.take().unwrap_or(Value::Nil);
        match self.unwind(panic_val, base, false) {
            Ok(out) => Ok(Some(out)),
            Err(e) => Err(e),
        }
    }

    // ---------------------------------------------------------------------
    // Select
    // ---------------------------------------------------------------------

    fn exec_select(&mut self, spec: &crate::code::SelectSpec) -> Result<u32, RuntimeError> {
        loop {
            self.env.check()?;
            let mut default_addr = None;
            for case in &spec.cases {
                match case {
                    SelectCase::Send { ch, value, addr } => {
                        let chv = self.gen(*ch);
                        if let Value::Chan(chan) = chv.unboxed() {
                            match chan.try_send(self.gen(*value)) {
                                SendTry::Sent => return Ok(*addr),
                                SendTry::Closed(_) => {
                                    return Err(RuntimeError::Panic(PanicError {
                                        chain: vec![PanicEntry {
                                            message: "send on closed channel".to_string(),
                                            recovered: false,
                                        }],
                                    }))
                                }
                                SendTry::Full(_) => {}
                            }
                        }
                    }
                    SelectCase::Recv { ch, dst, ok_dst, addr } => {
                        let chv = self.gen(*ch);
                        if let Value::Chan(chan) = chv.unboxed() {
                            match chan.try_recv() {
                                RecvTry::Received(v) => {
                                    if *dst != 0 {
                                        self.set_gen(*dst, v);
                                    }
                                    if *ok_dst != 0 {
                                        self.set_int(*ok_dst, 1);
                                    }
                                    return Ok(*addr);
                                }
                                RecvTry::Closed => {
                                    if *dst != 0 {
                                        self.set_gen(*dst, Value::Nil);
                                    }
                                    if *ok_dst != 0 {
                                        self.set_int(*ok_dst, 0);
                                    }
                                    return Ok(*addr);
                                }
                                RecvTry::Empty => {}
                            }
                        }
                    }
                    SelectCase::Default { addr } => default_addr = Some(*addr),
                }
            }
            if let Some(addr) = default_addr {
                return Ok(addr);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    // ---------------------------------------------------------------------
    // Values and types
    // ---------------------------------------------------------------------

    fn typify(&self, ty: TypeId, src: i8) -> Value {
        let reg = &self.code.registry;
        let u = reg.underlying(ty);
        let base = match reg.get(u) {
            Type::Bool => Value::Bool(self.int(src) != 0),
            Type::Int(_) => Value::Int(self.int(src)),
            Type::Float32 | Type::Float64 => Value::Float(self.float(src)),
            Type::Str => Value::Str(self.str(src)),
            _ => self.gen(src),
        };
        if reg.is_named(ty) && !reg.is_format(ty) {
            match base {
                Value::Dyn(..) => base,
                other => Value::Dyn(ty, Box::new(other)),
            }
        } else {
            base
        }
    }

    /// The dynamic type test behind `Assert`.
    fn type_matches(&self, v: &Value, target: TypeId) -> bool {
        let reg = &self.code.registry;
        if let Value::Dyn(t, _) = v {
            if reg.is_interface(target) {
                return reg.satisfies(*t, target);
            }
            return *t == target;
        }
        if matches!(v, Value::Nil) {
            return false;
        }
        if reg.is_interface(target) {
            // A plain value satisfies only the empty interface.
            return matches!(reg.get(reg.underlying(target)), Type::Interface(ms) if ms.is_empty());
        }
        let u = reg.underlying(target);
        if reg.is_named(target) && !reg.is_format(target) {
            return false;
        }
        match (v.unboxed(), reg.get(u)) {
            (Value::Bool(_), Type::Bool) => true,
            (Value::Int(_), Type::Int(kind)) => *kind == IntKind::Int,
            (Value::Float(_), Type::Float64) => true,
            (Value::Complex(..), Type::Complex128) => true,
            (Value::Str(_), Type::Str) => true,
            (Value::Slice(_), Type::Slice(_)) => true,
            (Value::Map(_), Type::Map(..)) => true,
            (Value::Struct(_), Type::Struct(_)) => true,
            (Value::Chan(_), Type::Chan(..)) => true,
            (Value::Closure(_) | Value::Native(_), Type::Func(_)) => true,
            _ => false,
        }
    }

    /// Writes literal text; false when the VM has no renderer.
    fn render_text(&mut self, s: &str) -> Result<bool, RuntimeError> {
        match self.renderer.as_mut() {
            Some(r) => {
                r.text(s)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Shows a value; false when the VM has no renderer.
    fn render_show(
        &mut self,
        ty: TypeId,
        data: &ShowData,
        ctx: crate::ast::Context,
    ) -> Result<bool, RuntimeError> {
        let code = self.code.clone();
        match self.renderer.as_mut() {
            Some(r) => {
                r.show(&code, ty, data, ctx)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read_show_data(&self, r: i8, ty: TypeId) -> ShowData {
        let reg = &self.code.registry;
        match Bank::of(reg, ty) {
            Bank::Int => {
                if reg.is_bool(ty) {
                    ShowData::Bool(self.int(r) != 0)
                } else if reg.is_unsigned(ty) {
                    ShowData::Uint(self.int(r) as u64)
                } else {
                    ShowData::Int(self.int(r))
                }
            }
            Bank::Float => ShowData::Float(self.float(r)),
            Bank::Str => ShowData::Str(self.str(r)),
            Bank::Gen => ShowData::Value(self.gen(r)),
        }
    }

    #[allow(dead_code)]
    fn fault_position(&self) -> Position {
        self.fault_pos()
    }
}

fn native_err(e: RuntimeError) -> RuntimeError {
    e
}

fn int_cond(cond: Cond, x: i64, y: i64) -> bool {
    match cond {
        Cond::Eq => x == y,
        Cond::NotEq => x != y,
        Cond::Less => x < y,
        Cond::LessEq => x <= y,
        Cond::Greater => x > y,
        Cond::GreaterEq => x >= y,
        _ => false,
    }
}

fn as_int(v: &Value) -> i64 {
    match v.unboxed() {
        Value::Bool(b) => *b as i64,
        Value::Int(i) => *i,
        Value::Float(f) => *f as i64,
        _ => 0,
    }
}

fn as_float(v: &Value) -> f64 {
    match v.unboxed() {
        Value::Float(f) => *f,
        Value::Int(i) => *i as f64,
        _ => 0.0,
    }
}

fn as_str(v: &Value) -> Arc<str> {
    match v.unboxed() {
        Value::Str(s) => s.clone(),
        Value::Nil => Arc::from(""),
        other => Arc::from(format_value(other).as_str()),
    }
}

fn as_complex(v: &Value) -> (f64, f64) {
    match v.unboxed() {
        Value::Complex(re, im) => (*re, *im),
        Value::Float(f) => (*f, 0.0),
        Value::Int(i) => (*i as f64, 0.0),
        _ => (0.0, 0.0),
    }
}
