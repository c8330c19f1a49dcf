//! Runtime values for the general register bank.
//!
//! Containers share storage through `Arc`, matching reference semantics:
//! slices share a backing buffer with an offset window, maps and structs
//! are shared cells. Values must be `Send` so `go` can move work onto
//! host threads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::code::Function;
use crate::native::NativeFn;
use crate::types::{self, Type, TypeId, TypeRegistry};
use crate::vm::chan::Channel;

/// A slice value: a shared buffer plus an offset window.
#[derive(Clone)]
pub struct SliceVal {
    pub buf: Arc<Mutex<Vec<Value>>>,
    pub off: u32,
    pub len: u32,
    pub cap: u32,
}

impl SliceVal {
    pub fn from_vec(v: Vec<Value>) -> SliceVal {
        let len = v.len() as u32;
        SliceVal { buf: Arc::new(Mutex::new(v)), off: 0, len, cap: len }
    }

    pub fn with_capacity(len: u32, cap: u32) -> SliceVal {
        let mut v = Vec::with_capacity(cap as usize);
        v.resize(len as usize, Value::Nil);
        SliceVal { buf: Arc::new(Mutex::new(v)), off: 0, len, cap }
    }

    pub fn get(&self, i: usize) -> Option<Value> {
        if i >= self.len as usize {
            return None;
        }
        Some(self.buf.lock()[self.off as usize + i].clone())
    }

    pub fn set(&self, i: usize, v: Value) -> bool {
        if i >= self.len as usize {
            return false;
        }
        self.buf.lock()[self.off as usize + i] = v;
        true
    }

    pub fn to_vec(&self) -> Vec<Value> {
        let buf = self.buf.lock();
        buf[self.off as usize..(self.off + self.len) as usize].to_vec()
    }

    /// Appends a value, reallocating with doubled capacity when the
    /// window is full. Returns the (possibly new) slice.
    pub fn push(&self, v: Value) -> SliceVal {
        if self.len < self.cap {
            let mut buf = self.buf.lock();
            let end = (self.off + self.len) as usize;
            if end < buf.len() {
                buf[end] = v;
            } else {
                buf.push(v);
            }
            SliceVal {
                buf: self.buf.clone(),
                off: self.off,
                len: self.len + 1,
                cap: self.cap,
            }
        } else {
            let mut new = self.to_vec();
            let cap = (self.cap * 2).max(4);
            new.reserve(cap as usize - new.len());
            new.push(v);
            let len = new.len() as u32;
            SliceVal { buf: Arc::new(Mutex::new(new)), off: 0, len, cap }
        }
    }
}

/// A key of a runtime map; restricted to the comparable kinds that occur
/// in template data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    /// Float keys hashed by bit pattern.
    Float(u64),
}

impl MapKey {
    pub fn from_value(v: &Value) -> Option<MapKey> {
        match v {
            Value::Bool(b) => Some(MapKey::Bool(*b)),
            Value::Int(i) => Some(MapKey::Int(*i)),
            Value::Str(s) => Some(MapKey::Str(s.clone())),
            Value::Float(f) => Some(MapKey::Float(f.to_bits())),
            Value::Dyn(_, inner) => MapKey::from_value(inner),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Bool(b) => Value::Bool(*b),
            MapKey::Int(i) => Value::Int(*i),
            MapKey::Str(s) => Value::Str(s.clone()),
            MapKey::Float(bits) => Value::Float(f64::from_bits(*bits)),
        }
    }
}

/// A closure: a function plus its captured variable cells.
pub struct Closure {
    pub func: Arc<Function>,
    /// Captured variables; each is a `Value::Ptr` reference cell.
    pub cvars: Vec<Value>,
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(f64, f64),
    Str(Arc<str>),
    Bytes(Arc<Mutex<Vec<u8>>>),
    Slice(SliceVal),
    Map(Arc<Mutex<HashMap<MapKey, Value>>>),
    Struct(Arc<Mutex<Vec<Value>>>),
    Ptr(Arc<Mutex<Value>>),
    Closure(Arc<Closure>),
    Native(NativeFn),
    Chan(Arc<Channel>),
    /// An interface box carrying the dynamic type.
    Dyn(TypeId, Box<Value>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn new_cell(v: Value) -> Value {
        Value::Ptr(Arc::new(Mutex::new(v)))
    }

    /// Unwraps interface boxes.
    pub fn unboxed(&self) -> &Value {
        match self {
            Value::Dyn(_, inner) => inner.unboxed(),
            other => other,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float64",
            Value::Complex(..) => "complex128",
            Value::Str(_) => "string",
            Value::Bytes(_) => "[]byte",
            Value::Slice(_) => "slice",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Ptr(_) => "pointer",
            Value::Closure(_) => "func",
            Value::Native(_) => "func",
            Value::Chan(_) => "chan",
            Value::Dyn(..) => "interface",
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Complex(re, im) => write!(f, "({re}{im:+}i)"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "{:?}", b.lock()),
            Value::Slice(s) => write!(f, "{:?}", s.to_vec()),
            Value::Map(m) => write!(f, "map[{} entries]", m.lock().len()),
            Value::Struct(s) => write!(f, "{:?}", s.lock()),
            Value::Ptr(p) => write!(f, "&{:?}", p.lock()),
            Value::Closure(c) => write!(f, "func {}", c.func.name),
            Value::Native(_) => write!(f, "native func"),
            Value::Chan(_) => write!(f, "chan"),
            Value::Dyn(t, v) => write!(f, "{:?} (dyn {})", v, t.raw()),
        }
    }
}

/// Runtime equality for `==` on interfaces and general values. Identity
/// comparison for reference kinds, structural for basic kinds.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a.unboxed(), b.unboxed()) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        (Value::Complex(a1, b1), Value::Complex(a2, b2)) => a1 == a2 && b1 == b2,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Ptr(x), Value::Ptr(y)) => Arc::ptr_eq(x, y),
        (Value::Chan(x), Value::Chan(y)) => Arc::ptr_eq(x, y),
        (Value::Map(x), Value::Map(y)) => Arc::ptr_eq(x, y),
        (Value::Struct(x), Value::Struct(y)) => {
            if Arc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.lock(), y.lock());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| value_eq(a, b))
        }
        (Value::Nil, other) | (other, Value::Nil) => matches!(
            other,
            Value::Nil
        ),
        _ => false,
    }
}

/// The zero value of a type.
pub fn zero_value(reg: &TypeRegistry, ty: TypeId) -> Value {
    match reg.get(reg.underlying(ty)) {
        Type::Bool => Value::Bool(false),
        Type::Str => Value::Str(Arc::from("")),
        Type::Int(_) => Value::Int(0),
        Type::Float32 | Type::Float64 => Value::Float(0.0),
        Type::Complex64 | Type::Complex128 => Value::Complex(0.0, 0.0),
        Type::Array(n, elem) => {
            let z = zero_value(reg, *elem);
            Value::Slice(SliceVal::from_vec(vec![z; *n as usize]))
        }
        Type::Struct(fields) => {
            let vals: Vec<Value> = fields.iter().map(|f| zero_value(reg, f.ty)).collect();
            Value::Struct(Arc::new(Mutex::new(vals)))
        }
        _ => Value::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_windows_share_storage() {
        let s = SliceVal::from_vec(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let sub = SliceVal { buf: s.buf.clone(), off: 1, len: 2, cap: 2 };
        sub.set(0, Value::Int(9));
        assert!(matches!(s.get(1), Some(Value::Int(9))));
    }

    #[test]
    fn append_within_capacity_shares() {
        let s = SliceVal::with_capacity(0, 4);
        let s1 = s.push(Value::Int(1));
        assert_eq!(s1.len, 1);
        assert!(Arc::ptr_eq(&s.buf, &s1.buf));
        // Growth past capacity reallocates.
        let mut grown = s1;
        for i in 2..=5 {
            grown = grown.push(Value::Int(i));
        }
        assert_eq!(grown.len, 5);
        assert!(!Arc::ptr_eq(&s.buf, &grown.buf));
    }

    #[test]
    fn map_keys() {
        let k1 = MapKey::from_value(&Value::str("a")).unwrap();
        let k2 = MapKey::from_value(&Value::str("a")).unwrap();
        assert_eq!(k1, k2);
        assert!(MapKey::from_value(&Value::Nil).is_none());
    }

    #[test]
    fn equality() {
        assert!(value_eq(&Value::Int(1), &Value::Int(1)));
        assert!(!value_eq(&Value::Int(1), &Value::Int(2)));
        assert!(value_eq(&Value::str("x"), &Value::str("x")));
        let p = Value::new_cell(Value::Int(1));
        assert!(value_eq(&p, &p.clone()));
        assert!(!value_eq(&p, &Value::new_cell(Value::Int(1))));
        assert!(value_eq(
            &Value::Dyn(types::INT, Box::new(Value::Int(3))),
            &Value::Int(3)
        ));
    }

    #[test]
    fn zero_values() {
        let reg = TypeRegistry::new();
        assert!(matches!(zero_value(&reg, types::INT), Value::Int(0)));
        assert!(matches!(zero_value(&reg, types::BOOL), Value::Bool(false)));
        assert!(matches!(zero_value(&reg, types::ANY), Value::Nil));
    }
}
