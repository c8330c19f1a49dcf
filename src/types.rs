//! Type registry.
//!
//! Types are interned by structural identity; defined types carry their
//! fully-qualified name, so two defined types are identical only when
//! name, package and underlying type all match. Methods of defined types
//! are stored in the registry by name; implementations of native methods
//! live with the host declarations, not here.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::ast::ChanDir;
use crate::fs::Format;

/// Interned reference into the type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeId(u32);

impl TypeId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        TypeId(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntKind {
    Int,
    I8,
    I16,
    I32,
    I64,
    Uint,
    U8,
    U16,
    U32,
    U64,
    Uintptr,
}

impl IntKind {
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            IntKind::Uint | IntKind::U8 | IntKind::U16 | IntKind::U32 | IntKind::U64 | IntKind::Uintptr
        )
    }

    /// Bit width; `Int`, `Uint` and `Uintptr` are 64-bit here.
    pub fn bits(self) -> u32 {
        match self {
            IntKind::I8 | IntKind::U8 => 8,
            IntKind::I16 | IntKind::U16 => 16,
            IntKind::I32 | IntKind::U32 => 32,
            _ => 64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IntKind::Int => "int",
            IntKind::I8 => "int8",
            IntKind::I16 => "int16",
            IntKind::I32 => "int32",
            IntKind::I64 => "int64",
            IntKind::Uint => "uint",
            IntKind::U8 => "uint8",
            IntKind::U16 => "uint16",
            IntKind::U32 => "uint32",
            IntKind::U64 => "uint64",
            IntKind::Uintptr => "uintptr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Vec<TypeId>,
    pub results: Vec<TypeId>,
    pub variadic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacroType {
    pub params: Vec<TypeId>,
    pub variadic: bool,
    pub format: Format,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructField {
    pub name: String,
    pub ty: TypeId,
    pub embedded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    pub name: String,
    pub sig: TypeId, // a Func type
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    Str,
    Int(IntKind),
    Float32,
    Float64,
    Complex64,
    Complex128,
    Slice(TypeId),
    Array(i64, TypeId),
    Map(TypeId, TypeId),
    Chan(ChanDir, TypeId),
    Ptr(TypeId),
    Func(FuncType),
    Macro(MacroType),
    Struct(Vec<StructField>),
    /// Methods sorted by name.
    Interface(Vec<MethodSig>),
    Named {
        pkg: String,
        name: String,
        underlying: TypeId,
    },
    /// Internal: the type of a multi-value expression.
    Tuple(Vec<TypeId>),
}

// Predeclared type ids; the registry constructor registers these in order.
pub const BOOL: TypeId = TypeId(0);
pub const STRING: TypeId = TypeId(1);
pub const INT: TypeId = TypeId(2);
pub const INT8: TypeId = TypeId(3);
pub const INT16: TypeId = TypeId(4);
pub const INT32: TypeId = TypeId(5);
pub const INT64: TypeId = TypeId(6);
pub const UINT: TypeId = TypeId(7);
pub const UINT8: TypeId = TypeId(8);
pub const UINT16: TypeId = TypeId(9);
pub const UINT32: TypeId = TypeId(10);
pub const UINT64: TypeId = TypeId(11);
pub const UINTPTR: TypeId = TypeId(12);
pub const FLOAT32: TypeId = TypeId(13);
pub const FLOAT64: TypeId = TypeId(14);
pub const COMPLEX64: TypeId = TypeId(15);
pub const COMPLEX128: TypeId = TypeId(16);
pub const ANY: TypeId = TypeId(17);
/// `rune` is an alias for `int32` and `byte` for `uint8`.
pub const RUNE: TypeId = INT32;
pub const BYTE: TypeId = UINT8;

#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: Vec<Type>,
    interned: HashMap<Type, TypeId>,
    methods: HashMap<TypeId, Vec<MethodSig>>,
    formats: [TypeId; 5],
    error_ty: TypeId,
    stringers: HashMap<&'static str, TypeId>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut r = TypeRegistry {
            types: Vec::new(),
            interned: HashMap::new(),
            methods: HashMap::new(),
            formats: [TypeId(0); 5],
            error_ty: TypeId(0),
            stringers: HashMap::new(),
        };
        // Order matters: it must match the predeclared constants above.
        for t in [
            Type::Bool,
            Type::Str,
            Type::Int(IntKind::Int),
            Type::Int(IntKind::I8),
            Type::Int(IntKind::I16),
            Type::Int(IntKind::I32),
            Type::Int(IntKind::I64),
            Type::Int(IntKind::Uint),
            Type::Int(IntKind::U8),
            Type::Int(IntKind::U16),
            Type::Int(IntKind::U32),
            Type::Int(IntKind::U64),
            Type::Int(IntKind::Uintptr),
            Type::Float32,
            Type::Float64,
            Type::Complex64,
            Type::Complex128,
            Type::Interface(Vec::new()),
        ] {
            r.intern(t);
        }
        debug_assert_eq!(r.types[ANY.raw() as usize], Type::Interface(Vec::new()));

        // Format types: distinct defined string types.
        for (i, name) in ["html", "css", "js", "json", "markdown"].iter().enumerate() {
            let id = r.intern(Type::Named {
                pkg: String::new(),
                name: name.to_string(),
                underlying: STRING,
            });
            r.formats[i] = id;
        }

        // The error interface.
        let err_sig = r.func(vec![], vec![STRING], false);
        let err_iface = r.intern(Type::Interface(vec![MethodSig {
            name: "Error".to_string(),
            sig: err_sig,
        }]));
        r.error_ty = r.intern(Type::Named {
            pkg: String::new(),
            name: "error".to_string(),
            underlying: err_iface,
        });

        // Renderer interfaces: a value implementing one of these bypasses
        // escaping in the matching context.
        let pairs: [(&'static str, &'static str, TypeId); 6] = [
            ("Stringer", "String", STRING),
            ("HTMLStringer", "HTML", r.formats[0]),
            ("CSSStringer", "CSS", r.formats[1]),
            ("JSStringer", "JS", r.formats[2]),
            ("JSONStringer", "JSON", r.formats[3]),
            ("MarkdownStringer", "Markdown", r.formats[4]),
        ];
        for (iface_name, method, result) in pairs {
            let sig = r.func(vec![], vec![result], false);
            let iface = r.intern(Type::Interface(vec![MethodSig {
                name: method.to_string(),
                sig,
            }]));
            let named = r.intern(Type::Named {
                pkg: String::new(),
                name: iface_name.to_string(),
                underlying: iface,
            });
            r.stringers.insert(iface_name, named);
        }
        r
    }

    pub fn intern(&mut self, t: Type) -> TypeId {
        if let Some(&id) = self.interned.get(&t) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(t.clone());
        self.interned.insert(t, id);
        id
    }

    #[inline]
    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.raw() as usize]
    }

    pub fn slice(&mut self, elem: TypeId) -> TypeId {
        self.intern(Type::Slice(elem))
    }

    pub fn array(&mut self, len: i64, elem: TypeId) -> TypeId {
        self.intern(Type::Array(len, elem))
    }

    pub fn map(&mut self, key: TypeId, value: TypeId) -> TypeId {
        self.intern(Type::Map(key, value))
    }

    pub fn chan(&mut self, dir: ChanDir, elem: TypeId) -> TypeId {
        self.intern(Type::Chan(dir, elem))
    }

    pub fn ptr(&mut self, elem: TypeId) -> TypeId {
        self.intern(Type::Ptr(elem))
    }

    pub fn func(&mut self, params: Vec<TypeId>, results: Vec<TypeId>, variadic: bool) -> TypeId {
        self.intern(Type::Func(FuncType { params, results, variadic }))
    }

    pub fn tuple(&mut self, elems: Vec<TypeId>) -> TypeId {
        self.intern(Type::Tuple(elems))
    }

    pub fn format_type(&self, f: Format) -> Option<TypeId> {
        match f {
            Format::Html => Some(self.formats[0]),
            Format::Css => Some(self.formats[1]),
            Format::JavaScript => Some(self.formats[2]),
            Format::Json => Some(self.formats[3]),
            Format::Markdown => Some(self.formats[4]),
            Format::Text => None,
        }
    }

    /// The format of a format type, `None` for every other type.
    pub fn format_of(&self, t: TypeId) -> Option<Format> {
        let i = self.formats.iter().position(|&f| f == t)?;
        Some(match i {
            0 => Format::Html,
            1 => Format::Css,
            2 => Format::JavaScript,
            3 => Format::Json,
            _ => Format::Markdown,
        })
    }

    pub fn is_format(&self, t: TypeId) -> bool {
        self.formats.contains(&t)
    }

    pub fn error_type(&self) -> TypeId {
        self.error_ty
    }

    pub fn stringer(&self, name: &str) -> TypeId {
        self.stringers[name]
    }

    pub fn add_method(&mut self, on: TypeId, sig: MethodSig) {
        self.methods.entry(on).or_default().push(sig);
    }

    // -------------------------------------------------------------------------
    // Predicates
    // -------------------------------------------------------------------------

    /// Resolves defined types to their underlying type.
    pub fn underlying(&self, t: TypeId) -> TypeId {
        match self.get(t) {
            Type::Named { underlying, .. } => self.underlying(*underlying),
            _ => t,
        }
    }

    pub fn is_named(&self, t: TypeId) -> bool {
        matches!(self.get(t), Type::Named { .. })
    }

    pub fn is_bool(&self, t: TypeId) -> bool {
        self.underlying(t) == BOOL
    }

    pub fn is_string(&self, t: TypeId) -> bool {
        self.underlying(t) == STRING
    }

    pub fn is_integer(&self, t: TypeId) -> bool {
        matches!(self.get(self.underlying(t)), Type::Int(_))
    }

    pub fn is_unsigned(&self, t: TypeId) -> bool {
        matches!(self.get(self.underlying(t)), Type::Int(k) if k.is_unsigned())
    }

    pub fn is_float(&self, t: TypeId) -> bool {
        matches!(self.get(self.underlying(t)), Type::Float32 | Type::Float64)
    }

    pub fn is_complex(&self, t: TypeId) -> bool {
        matches!(self.get(self.underlying(t)), Type::Complex64 | Type::Complex128)
    }

    pub fn is_numeric(&self, t: TypeId) -> bool {
        self.is_integer(t) || self.is_float(t) || self.is_complex(t)
    }

    pub fn is_interface(&self, t: TypeId) -> bool {
        matches!(self.get(self.underlying(t)), Type::Interface(_))
    }

    /// Types whose values can be compared with `==` and `!=`.
    pub fn is_comparable(&self, t: TypeId) -> bool {
        match self.get(self.underlying(t)) {
            Type::Bool
            | Type::Str
            | Type::Int(_)
            | Type::Float32
            | Type::Float64
            | Type::Complex64
            | Type::Complex128
            | Type::Chan(..)
            | Type::Ptr(_)
            | Type::Interface(_) => true,
            Type::Array(_, elem) => self.is_comparable(*elem),
            Type::Struct(fields) => fields.iter().all(|f| self.is_comparable(f.ty)),
            _ => false,
        }
    }

    /// Types whose values are ordered with `<`, `<=`, `>`, `>=`.
    pub fn is_ordered(&self, t: TypeId) -> bool {
        match self.get(self.underlying(t)) {
            Type::Str | Type::Int(_) | Type::Float32 | Type::Float64 => true,
            _ => false,
        }
    }

    /// Types a `nil` literal can be assigned to.
    pub fn accepts_nil(&self, t: TypeId) -> bool {
        matches!(
            self.get(self.underlying(t)),
            Type::Ptr(_)
                | Type::Slice(_)
                | Type::Map(..)
                | Type::Chan(..)
                | Type::Func(_)
                | Type::Macro(_)
                | Type::Interface(_)
        )
    }

    /// Go assignability, restricted to the implemented subset.
    pub fn assignable(&self, src: TypeId, dst: TypeId) -> bool {
        if src == dst {
            return true;
        }
        let usrc = self.underlying(src);
        let udst = self.underlying(dst);
        // Identical underlying types, and at least one side is not a
        // defined type.
        if usrc == udst && (!self.is_named(src) || !self.is_named(dst)) {
            return true;
        }
        // Interface satisfaction.
        if let Type::Interface(methods) = self.get(udst) {
            if methods.is_empty() {
                return true;
            }
            return self.satisfies(src, dst);
        }
        // A bidirectional channel is assignable to a directional one.
        if let (Type::Chan(ChanDir::Both, e1), Type::Chan(_, e2)) = (self.get(usrc), self.get(udst))
        {
            if e1 == e2 && (!self.is_named(src) || !self.is_named(dst)) {
                return true;
            }
        }
        false
    }

    /// Go convertibility, with the format-type restriction: a format type
    /// converts to and from `string`, never to another format type.
    pub fn convertible(&self, src: TypeId, dst: TypeId) -> bool {
        if self.is_format(src) && self.is_format(dst) && src != dst {
            return false;
        }
        if self.assignable(src, dst) {
            return true;
        }
        let usrc = self.underlying(src);
        let udst = self.underlying(dst);
        if usrc == udst {
            return true;
        }
        // Numeric conversions.
        if self.is_numeric(src) && self.is_numeric(dst) {
            // Complex converts only to complex.
            if self.is_complex(src) && !self.is_complex(dst) {
                return false;
            }
            return true;
        }
        // String conversions.
        if udst == STRING {
            if self.is_integer(src) {
                return true; // rune to string
            }
            if let Type::Slice(e) = self.get(usrc) {
                if *e == BYTE || *e == RUNE {
                    return true;
                }
            }
        }
        if usrc == STRING {
            if let Type::Slice(e) = self.get(udst) {
                if *e == BYTE || *e == RUNE {
                    return true;
                }
            }
        }
        false
    }

    /// The method set of a type: its own methods plus methods promoted
    /// from embedded struct fields, outermost shallowest first.
    pub fn method_set(&self, t: TypeId) -> Vec<MethodSig> {
        let mut out: Vec<MethodSig> = Vec::new();
        let mut level: Vec<TypeId> = vec![t];
        let mut seen: Vec<TypeId> = Vec::new();
        while !level.is_empty() {
            let mut next = Vec::new();
            for ty in level {
                if seen.contains(&ty) {
                    continue;
                }
                seen.push(ty);
                if let Some(ms) = self.methods.get(&ty) {
                    for m in ms {
                        if !out.iter().any(|o| o.name == m.name) {
                            out.push(m.clone());
                        }
                    }
                }
                if let Type::Interface(ms) = self.get(self.underlying(ty)) {
                    for m in ms {
                        if !out.iter().any(|o| o.name == m.name) {
                            out.push(m.clone());
                        }
                    }
                }
                if let Type::Struct(fields) = self.get(self.underlying(ty)) {
                    for f in fields {
                        if f.embedded {
                            next.push(f.ty);
                        }
                    }
                }
            }
            level = next;
        }
        out
    }

    pub fn lookup_method(&self, t: TypeId, name: &str) -> Option<MethodSig> {
        self.method_set(t).into_iter().find(|m| m.name == name)
    }

    /// Looks up a struct field, following promotion through embedded
    /// fields. Returns the index path from the outer struct to the field.
    pub fn lookup_field(&self, t: TypeId, name: &str) -> Option<(Vec<u16>, TypeId)> {
        let mut level: Vec<(Vec<u16>, TypeId)> = vec![(Vec::new(), t)];
        while !level.is_empty() {
            let mut next = Vec::new();
            let mut found: Option<(Vec<u16>, TypeId)> = None;
            for (path, ty) in level {
                let u = self.underlying(ty);
                if let Type::Struct(fields) = self.get(u) {
                    for (i, f) in fields.iter().enumerate() {
                        let fname = if f.embedded {
                            match self.get(f.ty) {
                                Type::Named { name, .. } => name.as_str(),
                                _ => "",
                            }
                        } else {
                            f.name.as_str()
                        };
                        if fname == name {
                            let mut p = path.clone();
                            p.push(i as u16);
                            // An ambiguous promoted field at the same
                            // depth is not selectable; keep the first and
                            // let shallower matches win.
                            if found.is_none() {
                                found = Some((p, f.ty));
                            }
                        }
                        if f.embedded {
                            let mut p = path.clone();
                            p.push(i as u16);
                            next.push((p, f.ty));
                        }
                    }
                }
            }
            if found.is_some() {
                return found;
            }
            level = next;
        }
        None
    }

    /// Reports whether `t` satisfies the interface type `iface`.
    pub fn satisfies(&self, t: TypeId, iface: TypeId) -> bool {
        let methods = match self.get(self.underlying(iface)) {
            Type::Interface(ms) => ms,
            _ => return false,
        };
        if methods.is_empty() {
            return true;
        }
        let set = self.method_set(t);
        methods
            .iter()
            .all(|m| set.iter().any(|s| s.name == m.name && s.sig == m.sig))
    }

    /// A human-readable rendering for diagnostics, e.g. `[]int`,
    /// `map[string]html`.
    pub fn describe(&self, t: TypeId) -> String {
        let mut s = String::new();
        self.write_type(t, &mut s);
        s
    }

    fn write_type(&self, t: TypeId, out: &mut String) {
        match self.get(t) {
            Type::Bool => out.push_str("bool"),
            Type::Str => out.push_str("string"),
            Type::Int(k) => out.push_str(k.name()),
            Type::Float32 => out.push_str("float32"),
            Type::Float64 => out.push_str("float64"),
            Type::Complex64 => out.push_str("complex64"),
            Type::Complex128 => out.push_str("complex128"),
            Type::Slice(e) => {
                out.push_str("[]");
                self.write_type(*e, out);
            }
            Type::Array(n, e) => {
                let _ = write!(out, "[{n}]");
                self.write_type(*e, out);
            }
            Type::Map(k, v) => {
                out.push_str("map[");
                self.write_type(*k, out);
                out.push(']');
                self.write_type(*v, out);
            }
            Type::Chan(dir, e) => {
                out.push_str(match dir {
                    ChanDir::Both => "chan ",
                    ChanDir::Send => "chan<- ",
                    ChanDir::Recv => "<-chan ",
                });
                self.write_type(*e, out);
            }
            Type::Ptr(e) => {
                out.push('*');
                self.write_type(*e, out);
            }
            Type::Func(f) => {
                out.push_str("func(");
                for (i, p) in f.params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if f.variadic && i + 1 == f.params.len() {
                        out.push_str("...");
                    }
                    self.write_type(*p, out);
                }
                out.push(')');
                match f.results.len() {
                    0 => {}
                    1 => {
                        out.push(' ');
                        self.write_type(f.results[0], out);
                    }
                    _ => {
                        out.push_str(" (");
                        for (i, r) in f.results.iter().enumerate() {
                            if i > 0 {
                                out.push_str(", ");
                            }
                            self.write_type(*r, out);
                        }
                        out.push(')');
                    }
                }
            }
            Type::Macro(m) => {
                out.push_str("macro(");
                for (i, p) in m.params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if m.variadic && i + 1 == m.params.len() {
                        out.push_str("...");
                    }
                    self.write_type(*p, out);
                }
                out.push(')');
                let _ = write!(out, " {}", m.format.name().to_ascii_lowercase());
            }
            Type::Struct(fields) => {
                out.push_str("struct { ");
                for (i, f) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push_str("; ");
                    }
                    if !f.embedded {
                        out.push_str(&f.name);
                        out.push(' ');
                    }
                    self.write_type(f.ty, out);
                }
                out.push_str(" }");
            }
            Type::Interface(ms) => {
                if ms.is_empty() {
                    out.push_str("interface{}");
                } else {
                    out.push_str("interface { ");
                    for (i, m) in ms.iter().enumerate() {
                        if i > 0 {
                            out.push_str("; ");
                        }
                        out.push_str(&m.name);
                        if let Type::Func(f) = self.get(m.sig) {
                            out.push('(');
                            for (j, p) in f.params.iter().enumerate() {
                                if j > 0 {
                                    out.push_str(", ");
                                }
                                self.write_type(*p, out);
                            }
                            out.push(')');
                            if f.results.len() == 1 {
                                out.push(' ');
                                self.write_type(f.results[0], out);
                            }
                        }
                    }
                    out.push_str(" }");
                }
            }
            Type::Named { name, .. } => out.push_str(name),
            Type::Tuple(elems) => {
                out.push('(');
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_type(*e, out);
                }
                out.push(')');
            }
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predeclared_ids_line_up() {
        let r = TypeRegistry::new();
        assert_eq!(r.get(BOOL), &Type::Bool);
        assert_eq!(r.get(STRING), &Type::Str);
        assert_eq!(r.get(INT), &Type::Int(IntKind::Int));
        assert_eq!(r.get(FLOAT64), &Type::Float64);
        assert_eq!(r.get(ANY), &Type::Interface(Vec::new()));
        assert_eq!(r.get(RUNE), &Type::Int(IntKind::I32));
    }

    #[test]
    fn interning_is_idempotent() {
        let mut r = TypeRegistry::new();
        let a = r.slice(INT);
        let b = r.slice(INT);
        assert_eq!(a, b);
        let c = r.slice(STRING);
        assert_ne!(a, c);
    }

    #[test]
    fn format_types_are_distinct_defined_strings() {
        let r = TypeRegistry::new();
        let html = r.format_type(Format::Html).unwrap();
        let css = r.format_type(Format::Css).unwrap();
        assert_ne!(html, css);
        assert_eq!(r.underlying(html), STRING);
        assert!(r.is_format(html));
        assert_eq!(r.format_of(html), Some(Format::Html));
    }

    #[test]
    fn format_type_conversions() {
        let r = TypeRegistry::new();
        let html = r.format_type(Format::Html).unwrap();
        let css = r.format_type(Format::Css).unwrap();
        // Explicit conversion with string works both ways.
        assert!(r.convertible(html, STRING));
        assert!(r.convertible(STRING, html));
        // Between two format types it never works.
        assert!(!r.convertible(html, css));
        // Assignment of a typed string value needs a conversion.
        assert!(!r.assignable(STRING, html));
        assert!(!r.assignable(html, STRING));
    }

    #[test]
    fn assignability() {
        let mut r = TypeRegistry::new();
        let ints = r.slice(INT);
        assert!(r.assignable(ints, ints));
        assert!(r.assignable(INT, ANY));
        assert!(!r.assignable(INT, STRING));
        let named = r.intern(Type::Named {
            pkg: "p".into(),
            name: "IntSlice".into(),
            underlying: ints,
        });
        // Unnamed-to-named with identical underlying type is fine.
        assert!(r.assignable(ints, named));
        assert!(r.assignable(named, ints));
    }

    #[test]
    fn conversions() {
        let mut r = TypeRegistry::new();
        assert!(r.convertible(INT, FLOAT64));
        assert!(r.convertible(FLOAT64, INT8));
        assert!(r.convertible(INT, STRING)); // rune conversion
        let bytes = r.slice(BYTE);
        assert!(r.convertible(bytes, STRING));
        assert!(r.convertible(STRING, bytes));
        assert!(!r.convertible(COMPLEX128, FLOAT64));
        assert!(r.convertible(COMPLEX64, COMPLEX128));
    }

    #[test]
    fn comparability_and_order() {
        let mut r = TypeRegistry::new();
        assert!(r.is_comparable(INT));
        assert!(r.is_comparable(STRING));
        let ints = r.slice(INT);
        assert!(!r.is_comparable(ints));
        let arr = r.array(3, INT);
        assert!(r.is_comparable(arr));
        assert!(r.is_ordered(STRING));
        assert!(!r.is_ordered(BOOL));
    }

    #[test]
    fn interface_satisfaction() {
        let mut r = TypeRegistry::new();
        let stringer = r.stringer("Stringer");
        let sig = r.func(vec![], vec![STRING], false);
        let my = r.intern(Type::Named {
            pkg: "p".into(),
            name: "T".into(),
            underlying: INT,
        });
        assert!(!r.satisfies(my, stringer));
        r.add_method(my, MethodSig { name: "String".into(), sig });
        assert!(r.satisfies(my, stringer));
        assert!(r.assignable(my, stringer));
    }

    #[test]
    fn field_promotion() {
        let mut r = TypeRegistry::new();
        let base_struct = r.intern(Type::Struct(vec![StructField {
            name: "ID".into(),
            ty: INT,
            embedded: false,
        }]));
        let base = r.intern(Type::Named {
            pkg: "p".into(),
            name: "Base".into(),
            underlying: base_struct,
        });
        let outer = r.intern(Type::Struct(vec![
            StructField { name: String::new(), ty: base, embedded: true },
            StructField { name: "Name".into(), ty: STRING, embedded: false },
        ]));
        let (path, ty) = r.lookup_field(outer, "ID").unwrap();
        assert_eq!(ty, INT);
        assert_eq!(path, vec![0, 0]);
        let (path, ty) = r.lookup_field(outer, "Name").unwrap();
        assert_eq!(ty, STRING);
        assert_eq!(path, vec![1]);
        // Embedded field is selectable by its type name.
        let (path, _) = r.lookup_field(outer, "Base").unwrap();
        assert_eq!(path, vec![0]);
    }

    #[test]
    fn method_promotion() {
        let mut r = TypeRegistry::new();
        let sig = r.func(vec![], vec![STRING], false);
        let base = r.intern(Type::Named {
            pkg: "p".into(),
            name: "B".into(),
            underlying: INT,
        });
        r.add_method(base, MethodSig { name: "String".into(), sig });
        let outer_struct = r.intern(Type::Struct(vec![StructField {
            name: String::new(),
            ty: base,
            embedded: true,
        }]));
        let outer = r.intern(Type::Named {
            pkg: "p".into(),
            name: "O".into(),
            underlying: outer_struct,
        });
        assert!(r.lookup_method(outer, "String").is_some());
        let stringer = r.stringer("Stringer");
        assert!(r.satisfies(outer, stringer));
    }

    #[test]
    fn describe_types() {
        let mut r = TypeRegistry::new();
        let t = r.slice(INT);
        assert_eq!(r.describe(t), "[]int");
        let m = r.map(STRING, t);
        assert_eq!(r.describe(m), "map[string][]int");
        let html = r.format_type(Format::Html).unwrap();
        assert_eq!(r.describe(html), "html");
    }
}
