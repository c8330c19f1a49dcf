//! Host declarations.
//!
//! The host makes constants, variables, functions and named types visible
//! to template code through `Declarations`; precompiled packages reach the
//! `import` statement through a `PackageLoader`. Types are described with
//! `TypeDesc`, the public mirror of the compiler's type structure.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::vm::value::Value;

/// A native function callable from template code.
pub type NativeFn = Arc<dyn Fn(Vec<Value>) -> Result<Vec<Value>, RuntimeError> + Send + Sync>;

/// Builds a `NativeFn` from a closure.
pub fn native_fn<F>(f: F) -> NativeFn
where
    F: Fn(Vec<Value>) -> Result<Vec<Value>, RuntimeError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A host-side type description.
#[derive(Clone)]
pub enum TypeDesc {
    Bool,
    String,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Complex128,
    Any,
    Error,
    Html,
    Css,
    Js,
    Json,
    Markdown,
    Slice(Box<TypeDesc>),
    Array(usize, Box<TypeDesc>),
    Map(Box<TypeDesc>, Box<TypeDesc>),
    Ptr(Box<TypeDesc>),
    Chan(Box<TypeDesc>),
    Func {
        params: Vec<TypeDesc>,
        results: Vec<TypeDesc>,
        variadic: bool,
    },
    /// Fields as `(name, type)`; an empty name marks an embedded field.
    Struct(Vec<(String, TypeDesc)>),
    /// A defined type with methods `(name, signature, implementation)`.
    Named {
        pkg: String,
        name: String,
        underlying: Box<TypeDesc>,
        methods: Vec<(String, TypeDesc, NativeFn)>,
    },
}

impl std::fmt::Debug for TypeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeDesc::Named { pkg, name, .. } => write!(f, "Named({pkg}.{name})"),
            TypeDesc::Slice(e) => write!(f, "Slice({e:?})"),
            TypeDesc::Map(k, v) => write!(f, "Map({k:?}, {v:?})"),
            TypeDesc::Func { params, results, .. } => {
                write!(f, "Func({params:?} -> {results:?})")
            }
            _ => write!(f, "TypeDesc"),
        }
    }
}

/// A constant value provided by the host; always untyped.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Bool(bool),
    Str(String),
    Int(i64),
    Float(f64),
}

/// One host declaration.
#[derive(Clone)]
pub enum Global {
    Const(ConstValue),
    Var { ty: TypeDesc, value: Value },
    Func { ty: TypeDesc, f: NativeFn },
    Type(TypeDesc),
}

impl std::fmt::Debug for Global {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Global::Const(c) => write!(f, "Const({c:?})"),
            Global::Var { ty, .. } => write!(f, "Var({ty:?})"),
            Global::Func { ty, .. } => write!(f, "Func({ty:?})"),
            Global::Type(ty) => write!(f, "Type({ty:?})"),
        }
    }
}

/// The set of declarations the host exposes to a template or script.
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    decls: BTreeMap<String, Global>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, g: Global) -> &mut Self {
        self.decls.insert(name.into(), g);
        self
    }

    pub fn add_const(&mut self, name: impl Into<String>, v: ConstValue) -> &mut Self {
        self.add(name, Global::Const(v))
    }

    pub fn add_var(&mut self, name: impl Into<String>, ty: TypeDesc, value: Value) -> &mut Self {
        self.add(name, Global::Var { ty, value })
    }

    pub fn add_func(&mut self, name: impl Into<String>, ty: TypeDesc, f: NativeFn) -> &mut Self {
        self.add(name, Global::Func { ty, f })
    }

    pub fn add_type(&mut self, name: impl Into<String>, ty: TypeDesc) -> &mut Self {
        self.add(name, Global::Type(ty))
    }

    pub fn get(&self, name: &str) -> Option<&Global> {
        self.decls.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Global)> {
        self.decls.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

/// A precompiled package made available through `import`.
#[derive(Debug, Clone)]
pub struct NativePackage {
    pub name: String,
    pub decls: Declarations,
}

/// Resolves import paths without an extension to precompiled packages.
pub trait PackageLoader {
    fn load(&self, path: &str) -> Option<NativePackage>;
}

/// A loader backed by a map from path to package.
#[derive(Debug, Clone, Default)]
pub struct MapPackages {
    pkgs: BTreeMap<String, NativePackage>,
}

impl MapPackages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, pkg: NativePackage) -> &mut Self {
        self.pkgs.insert(path.into(), pkg);
        self
    }
}

impl PackageLoader for MapPackages {
    fn load(&self, path: &str) -> Option<NativePackage> {
        self.pkgs.get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declarations_builder() {
        let mut d = Declarations::new();
        d.add_const("version", ConstValue::Str("1.0".into()))
            .add_var("count", TypeDesc::Int, Value::Int(3))
            .add_func(
                "double",
                TypeDesc::Func {
                    params: vec![TypeDesc::Int],
                    results: vec![TypeDesc::Int],
                    variadic: false,
                },
                native_fn(|args| match args.first() {
                    Some(Value::Int(n)) => Ok(vec![Value::Int(n * 2)]),
                    _ => Ok(vec![Value::Int(0)]),
                }),
            );
        assert!(d.get("version").is_some());
        assert!(d.get("count").is_some());
        assert!(d.get("missing").is_none());
        assert_eq!(d.iter().count(), 3);
    }

    #[test]
    fn map_packages_load() {
        let mut m = MapPackages::new();
        let mut decls = Declarations::new();
        decls.add_const("Pi", ConstValue::Float(3.14159));
        m.insert("math", NativePackage { name: "math".into(), decls });
        assert!(m.load("math").is_some());
        assert!(m.load("strings").is_none());
    }
}
