//! Compiled code.
//!
//! Instructions are 32-bit slots: an opcode byte and three signed 8-bit
//! operands `a`, `b`, `c`. The high bit of the opcode byte is the k flag:
//! when set, the constant-bearing operand indexes the constant pool of
//! its bank instead of naming a register. Registers are 1-based per bank;
//! index 0 is reserved and means "no register".

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::ast::Context;
use crate::error::Position;
use crate::fs::Format;
use crate::native::NativeFn;
use crate::types::{TypeId, TypeRegistry};
use crate::vm::value::Value;

/// The k flag bit of the opcode byte.
pub const K: u8 = 0x80;

/// Call operand `a` meaning "the callee is a closure in general register
/// `b`".
pub const NO_PACKAGE: i8 = -2;
/// Call operand `a` meaning "the callee is `funcs[b]` of the current
/// function".
pub const CURRENT_FUNCTION: i8 = -1;
/// A register operand meaning "no register".
pub const NO_REGISTER: i8 = 0;

/// The four typed register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Bank {
    Int = 0,
    Float = 1,
    Str = 2,
    Gen = 3,
}

impl Bank {
    pub fn from_u8(v: u8) -> Bank {
        match v & 3 {
            0 => Bank::Int,
            1 => Bank::Float,
            2 => Bank::Str,
            _ => Bank::Gen,
        }
    }

    /// The bank holding values of `ty`: booleans, integers and runes in
    /// the int bank, floats in the float bank, strings (including format
    /// types) in the string bank, everything else boxed in the general
    /// bank.
    pub fn of(reg: &TypeRegistry, ty: TypeId) -> Bank {
        use crate::types::Type;
        match reg.get(reg.underlying(ty)) {
            Type::Bool | Type::Int(_) => Bank::Int,
            Type::Float32 | Type::Float64 => Bank::Float,
            Type::Str => Bank::Str,
            _ => Bank::Gen,
        }
    }
}

/// Comparison condition selected by operand `b` of the `If*` family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    NotEq = 1,
    Less = 2,
    LessEq = 3,
    Greater = 4,
    GreaterEq = 5,
    // String length forms, cheap empty-string checks.
    EqLen = 6,
    NotEqLen = 7,
    LessLen = 8,
    LessEqLen = 9,
    GreaterLen = 10,
    GreaterEqLen = 11,
    // General forms.
    Nil = 12,
    NotNil = 13,
}

impl Cond {
    pub fn from_u8(v: u8) -> Cond {
        match v {
            0 => Cond::Eq,
            1 => Cond::NotEq,
            2 => Cond::Less,
            3 => Cond::LessEq,
            4 => Cond::Greater,
            5 => Cond::GreaterEq,
            6 => Cond::EqLen,
            7 => Cond::NotEqLen,
            8 => Cond::LessLen,
            9 => Cond::LessEqLen,
            10 => Cond::GreaterLen,
            11 => Cond::GreaterEqLen,
            12 => Cond::Nil,
            _ => Cond::NotNil,
        }
    }
}

macro_rules! ops {
    ($($name:ident),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Op { $($name),* }

        impl Op {
            pub fn from_u8(v: u8) -> Op {
                const OPS: &[Op] = &[$(Op::$name),*];
                OPS[(v & !K) as usize]
            }

            pub fn name(self) -> &'static str {
                match self { $(Op::$name => stringify!($name)),* }
            }
        }
    };
}

ops! {
    Nop,
    // Integer arithmetic (int bank, 64-bit two's complement).
    AddInt, SubInt, SubInvInt, MulInt, DivInt, DivUint, RemInt, RemUint,
    // Float arithmetic.
    AddFloat, SubFloat, SubInvFloat, MulFloat, DivFloat,
    // Complex arithmetic (general bank).
    AddComplex, SubComplex, MulComplex, DivComplex, ComplexNew, ComplexReal, ComplexImag,
    // Bitwise and shifts.
    And, Or, Xor, AndNot, Shl, ShrInt, ShrUint,
    // Strings and containers.
    Concat, Contains,
    // Moves; with k the source is a constant pool index.
    MoveInt, MoveFloat, MoveString, MoveGeneral,
    // Conversions.
    ConvIF, ConvUF, ConvFI,
    CastInt8, CastInt16, CastInt32, CastUint8, CastUint16, CastUint32, CastFloat32,
    ConvRuneString, ConvBytesString, ConvStringBytes, ConvRunesString, ConvStringRunes,
    // Boxing between banks and the general bank.
    BoxInt, BoxFloat, BoxString, UnboxInt, UnboxFloat, UnboxString, Typify,
    // Branches: a true condition skips the following instruction.
    IfInt, IfUint, IfFloat, IfString, If,
    Goto, JmpOk, JmpNotOk, Ok,
    // Calls and frames.
    Call, CallNative, TailCall, Defer, Return, Panic, Recover,
    // Allocation.
    New, MakeSlice, MakeMap, MakeChan,
    Append, AppendSlice, Copy, Delete, Len, Cap,
    SliceIndex, StringIndex, MapIndex, SetSlice, SetMap,
    Field, SetField,
    GetVar, SetVar, LoadPtr, StorePtr, GetCVar,
    Func, Assert,
    Slice, SliceString,
    // Concurrency.
    Send, Receive, CloseChan, Select, Spawn,
    // Range iteration.
    RangeNew, RangeNext, RangePop,
    // Template.
    Text, Show, UrlStart, UrlEnd,
    // Builtins.
    Print, Println, Exit,
}

/// One 32-bit instruction slot. Slots after `Call`, `MakeSlice`, `Slice`
/// and `RangeNext` carry raw operands rather than an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: u8,
    pub a: i8,
    pub b: i8,
    pub c: i8,
}

impl Instr {
    pub fn new(op: Op, a: i8, b: i8, c: i8) -> Instr {
        Instr { op: op as u8, a, b, c }
    }

    pub fn with_k(op: Op, a: i8, b: i8, c: i8) -> Instr {
        Instr { op: op as u8 | K, a, b, c }
    }

    #[inline]
    pub fn opcode(self) -> Op {
        Op::from_u8(self.op)
    }

    #[inline]
    pub fn k(self) -> bool {
        self.op & K != 0
    }

    /// A 24-bit address packed into the three operands.
    #[inline]
    pub fn addr(self) -> u32 {
        (self.a as u8 as u32) | ((self.b as u8 as u32) << 8) | ((self.c as u8 as u32) << 16)
    }

    pub fn jump(op: Op, addr: u32) -> Instr {
        Instr {
            op: op as u8,
            a: (addr & 0xFF) as u8 as i8,
            b: ((addr >> 8) & 0xFF) as u8 as i8,
            c: ((addr >> 16) & 0xFF) as u8 as i8,
        }
    }

    /// A raw operand slot following an instruction.
    pub fn word(a: i8, b: i8, c: i8) -> Instr {
        Instr { op: Op::Nop as u8, a, b, c }
    }
}

/// One case of a `select` table.
#[derive(Debug, Clone)]
pub enum SelectCase {
    Send { ch: i8, value: i8, addr: u32 },
    Recv { ch: i8, dst: i8, ok_dst: i8, addr: u32 },
    Default { addr: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct SelectSpec {
    pub cases: Vec<SelectCase>,
}

/// A compiled function: instructions, constant pools per bank, type and
/// subfunction tables.
pub struct Function {
    pub name: String,
    pub file: String,
    pub format: Format,
    /// Register counts per bank.
    pub regs: [u8; 4],
    /// Parameter and result register counts per bank; results come first
    /// in the window.
    pub in_counts: [u8; 4],
    pub out_counts: [u8; 4],
    /// Parameter and result types in declaration order, used to marshal
    /// boxed argument lists (deferred calls, goroutines, native calls).
    pub ins: Vec<TypeId>,
    pub outs: Vec<TypeId>,
    /// Set on stub functions that forward to a native implementation.
    pub native: Option<NativeFn>,
    pub consts_int: Vec<i64>,
    pub consts_float: Vec<f64>,
    pub consts_string: Vec<Arc<str>>,
    pub consts_general: Vec<Value>,
    pub types: Vec<TypeId>,
    pub funcs: Vec<Arc<Function>>,
    /// Closure capture references: a non-negative entry names a captured
    /// variable of the enclosing function, a negative entry `-r-1` takes
    /// the cell in the enclosing function's general register `r`.
    pub crefs: Vec<i16>,
    pub selects: Vec<SelectSpec>,
    pub body: Vec<Instr>,
    /// Source position per instruction, for runtime faults.
    pub lines: Vec<Position>,
    pub is_macro: bool,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Function {}({} instructions)", self.name, self.body.len())
    }
}

impl Function {
    pub fn position_at(&self, pc: usize) -> Position {
        self.lines.get(pc).copied().unwrap_or_default()
    }
}

/// A global variable slot of the compiled code.
#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub name: String,
    pub ty: TypeId,
    /// Overridable by run variables.
    pub host: bool,
}

/// Immutable compiled output of a build; freely shareable across
/// concurrent runs.
pub struct Code {
    pub main: Arc<Function>,
    pub globals: Vec<GlobalDef>,
    pub registry: Arc<TypeRegistry>,
    pub format: Format,
    /// Initial values of host globals, by global index.
    pub native_values: HashMap<u32, Value>,
    /// Native method implementations, for the renderer's Stringer
    /// dispatch and method calls.
    pub method_impls: HashMap<(TypeId, String), NativeFn>,
    pub used_vars: Vec<String>,
}

impl std::fmt::Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Code({}, {} globals)", self.main.name, self.globals.len())
    }
}

/// Context codes used by the `Show` instruction's `c` operand.
pub fn context_code(ctx: Context) -> i8 {
    match ctx {
        Context::Text => 0,
        Context::Html => 1,
        Context::Tag => 2,
        Context::Attribute => 3,
        Context::UnquotedAttribute => 4,
        Context::Css => 5,
        Context::CssString => 6,
        Context::JavaScript => 7,
        Context::JavaScriptString => 8,
        Context::Json => 9,
        Context::Markdown => 10,
    }
}

pub fn context_from_code(code: i8) -> Context {
    match code {
        0 => Context::Text,
        1 => Context::Html,
        2 => Context::Tag,
        3 => Context::Attribute,
        4 => Context::UnquotedAttribute,
        5 => Context::Css,
        6 => Context::CssString,
        7 => Context::JavaScript,
        8 => Context::JavaScriptString,
        9 => Context::Json,
        _ => Context::Markdown,
    }
}

// =============================================================================
// Disassembler
// =============================================================================

/// Disassembles compiled code to assembly text.
///
/// `n` limits disassembled text: `n > 0` shows at most `n` runes with
/// surrounding white space trimmed, `n == 0` hides text, `n < 0` shows
/// it all.
pub fn disassemble(code: &Code, n: i32) -> Vec<u8> {
    let mut out = String::new();
    let mut queue: Vec<(String, Arc<Function>)> =
        vec![("main".to_string(), code.main.clone())];
    let mut seen = 0usize;
    while seen < queue.len() {
        let (name, f) = queue[seen].clone();
        seen += 1;
        disassemble_function(&mut out, code, &name, &f, n);
        for (i, sub) in f.funcs.iter().enumerate() {
            queue.push((format!("{name}.f{i}"), sub.clone()));
        }
        out.push('\n');
    }
    out.into_bytes()
}

fn disassemble_function(out: &mut String, code: &Code, name: &str, f: &Function, n: i32) {
    let _ = writeln!(out, "Func {}({}) ; regs i{} f{} s{} g{}",
        name, f.file, f.regs[0], f.regs[1], f.regs[2], f.regs[3]);
    let mut skip_words = 0usize;
    for (pc, in_) in f.body.iter().enumerate() {
        if skip_words > 0 {
            skip_words -= 1;
            let _ = writeln!(out, "\t{pc}\t.word {} {} {}", in_.a, in_.b, in_.c);
            continue;
        }
        let op = in_.opcode();
        let k = if in_.k() { "k" } else { "" };
        let mut line = format!("\t{pc}\t{}{k} {} {} {}", op.name(), in_.a, in_.b, in_.c);
        match op {
            Op::Call | Op::TailCall | Op::MakeSlice | Op::Slice | Op::SliceString
            | Op::RangeNext | Op::CallNative => skip_words = 1,
            Op::Goto | Op::JmpOk | Op::JmpNotOk => {
                line = format!("\t{pc}\t{} {}", op.name(), in_.addr());
            }
            Op::Text => {
                let idx = in_.b as u8 as usize;
                if let Some(s) = f.consts_string.get(idx) {
                    let text = render_text(s, n);
                    line.push_str(&format!(" ; {text:?}"));
                }
            }
            Op::MoveString if in_.k() => {
                let idx = in_.b as u8 as usize;
                if let Some(s) = f.consts_string.get(idx) {
                    let text = render_text(s, n.max(32));
                    line.push_str(&format!(" ; {text:?}"));
                }
            }
            Op::MoveInt if in_.k() => {
                let idx = in_.b as u8 as usize;
                if let Some(v) = f.consts_int.get(idx) {
                    line.push_str(&format!(" ; {v}"));
                }
            }
            Op::Show => {
                let t = f.types.get(in_.b as u8 as usize);
                if let Some(&t) = t {
                    line.push_str(&format!(
                        " ; show {} in {}",
                        code.registry.describe(t),
                        context_from_code(in_.c)
                    ));
                }
            }
            _ => {}
        }
        let _ = writeln!(out, "{line}");
    }
}

fn render_text(s: &str, n: i32) -> String {
    if n == 0 {
        return String::new();
    }
    if n < 0 {
        return s.to_string();
    }
    let trimmed = s.trim();
    let mut out: String = trimmed.chars().take(n as usize).collect();
    if trimmed.chars().count() > n as usize {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_encoding() {
        let i = Instr::with_k(Op::AddInt, 1, 2, 3);
        assert!(i.k());
        assert_eq!(i.opcode(), Op::AddInt);
        let j = Instr::new(Op::AddInt, 1, 2, 3);
        assert!(!j.k());
        assert_eq!(j.opcode(), Op::AddInt);
    }

    #[test]
    fn jump_addresses_round_trip() {
        for addr in [0u32, 1, 255, 256, 70000, 0xFF_FFFF] {
            let i = Instr::jump(Op::Goto, addr);
            assert_eq!(i.addr(), addr, "addr {addr}");
        }
    }

    #[test]
    fn context_codes_round_trip() {
        use crate::ast::Context::*;
        for ctx in [
            Text, Html, Tag, Attribute, UnquotedAttribute, Css, CssString, JavaScript,
            JavaScriptString, Json, Markdown,
        ] {
            assert_eq!(context_from_code(context_code(ctx)), ctx);
        }
    }

    #[test]
    fn opcode_fits_seven_bits() {
        assert!((Op::Exit as u8) < K);
    }
}
