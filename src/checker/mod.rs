//! Static semantics.
//!
//! The checker walks each tree once, maintaining a scope stack layered as
//! universe (immutable), global (host declarations), file block, then
//! function and block scopes. It resolves every identifier to exactly one
//! declaration, folds constants with arbitrary precision, enforces the
//! template rules (format types, `show` legality, macros, extension) and
//! records for the emitter the type of every expression, the binding of
//! every identifier use, and the capture lists of closures.

pub mod consts;
mod expr;
mod stmt;

use std::collections::{HashMap, HashSet};

use crate::ast::{Ast, Expr, ExprId, ListRef, Stmt, StmtId, TreeRef, TypeExprId};
use crate::error::{BuildError, Position};
use crate::fs::Format;
use crate::native::{ConstValue, Declarations, Global, PackageLoader, TypeDesc};
use crate::types::{self, MacroType, MethodSig, Type, TypeId, TypeRegistry};

use consts::Constant;

// =============================================================================
// Properties and type information
// =============================================================================

/// A bitset of properties attached to every checked expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Props(u16);

impl Props {
    pub const IS_TYPE: Props = Props(1 << 0);
    pub const IS_PACKAGE: Props = Props(1 << 1);
    pub const IS_CONST: Props = Props(1 << 2);
    pub const UNTYPED: Props = Props(1 << 3);
    pub const ADDRESSABLE: Props = Props(1 << 4);
    pub const NIL: Props = Props(1 << 5);
    pub const PREDECLARED: Props = Props(1 << 6);
    pub const HAS_VALUE: Props = Props(1 << 7);
    pub const IS_MACRO: Props = Props(1 << 8);
    pub const IS_BUILTIN: Props = Props(1 << 9);

    #[inline]
    pub fn with(self, other: Props) -> Props {
        Props(self.0 | other.0)
    }

    #[inline]
    pub fn has(self, other: Props) -> bool {
        self.0 & other.0 == other.0
    }
}

/// What the checker knows about one expression node.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub ty: TypeId,
    pub props: Props,
    pub constant: Option<Constant>,
    /// Set for package identifiers.
    pub package: Option<u32>,
}

impl TypeInfo {
    pub fn value(ty: TypeId) -> TypeInfo {
        TypeInfo { ty, props: Props::HAS_VALUE, constant: None, package: None }
    }

    pub fn addressable(ty: TypeId) -> TypeInfo {
        TypeInfo {
            ty,
            props: Props::HAS_VALUE.with(Props::ADDRESSABLE),
            constant: None,
            package: None,
        }
    }

    pub fn untyped_const(c: Constant) -> TypeInfo {
        TypeInfo {
            ty: c.default_type(),
            props: Props::IS_CONST.with(Props::UNTYPED).with(Props::HAS_VALUE),
            constant: Some(c),
            package: None,
        }
    }

    pub fn typed_const(c: Constant, ty: TypeId) -> TypeInfo {
        TypeInfo {
            ty,
            props: Props::IS_CONST.with(Props::HAS_VALUE),
            constant: Some(c),
            package: None,
        }
    }

    pub fn type_name(ty: TypeId) -> TypeInfo {
        TypeInfo { ty, props: Props::IS_TYPE, constant: None, package: None }
    }

    pub fn nil() -> TypeInfo {
        TypeInfo {
            ty: types::ANY,
            props: Props::NIL.with(Props::HAS_VALUE).with(Props::UNTYPED),
            constant: None,
            package: None,
        }
    }

    pub fn is_type(&self) -> bool {
        self.props.has(Props::IS_TYPE)
    }

    pub fn is_package(&self) -> bool {
        self.props.has(Props::IS_PACKAGE)
    }

    pub fn is_const(&self) -> bool {
        self.props.has(Props::IS_CONST)
    }

    pub fn is_untyped(&self) -> bool {
        self.props.has(Props::UNTYPED)
    }

    pub fn is_nil(&self) -> bool {
        self.props.has(Props::NIL)
    }

    pub fn is_addressable(&self) -> bool {
        self.props.has(Props::ADDRESSABLE)
    }

    pub fn is_builtin(&self) -> bool {
        self.props.has(Props::IS_BUILTIN)
    }

    pub fn is_value(&self) -> bool {
        self.props.has(Props::HAS_VALUE)
    }
}

// =============================================================================
// Bindings and check output
// =============================================================================

/// A stable key identifying a local declaration site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclKey {
    /// An identifier node in a `var`/`const`/`:=`/range declaration.
    Expr(u32),
    /// Parameter `i` of a macro or function declaration statement.
    StmtParam(u32, u16),
    /// Parameter `i` of a function literal.
    ExprParam(u32, u16),
    /// The binding of a type switch, one instance per case.
    Case(u32),
    /// A named declaration statement (a local macro).
    Stmt(u32),
}

/// Where an identifier use resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local(DeclKey),
    Global(u32),
    Builtin(Builtin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Append,
    Cap,
    Close,
    Complex,
    Copy,
    Delete,
    Imag,
    Len,
    Make,
    New,
    Panic,
    Print,
    Println,
    Real,
    Recover,
    Exit,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Append => "append",
            Builtin::Cap => "cap",
            Builtin::Close => "close",
            Builtin::Complex => "complex",
            Builtin::Copy => "copy",
            Builtin::Delete => "delete",
            Builtin::Imag => "imag",
            Builtin::Len => "len",
            Builtin::Make => "make",
            Builtin::New => "new",
            Builtin::Panic => "panic",
            Builtin::Print => "print",
            Builtin::Println => "println",
            Builtin::Real => "real",
            Builtin::Recover => "recover",
            Builtin::Exit => "exit",
        }
    }
}

/// A key identifying a function body (for capture lists).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FnKey {
    /// A function literal (`ExprId`).
    Lit(u32),
    /// A macro or function declaration statement (`StmtId`).
    Decl(u32),
}

/// How a global variable gets its initial value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalInit {
    /// Supplied by the host declarations or the run variables.
    Host,
    Zero,
    /// A package-level initializer expression.
    Expr(ExprId),
    /// A package-level macro or function declaration; the closure is
    /// built at run start.
    Closure(StmtId),
}

#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: TypeId,
    pub init: GlobalInit,
    /// Whether the name is a host declaration overridable by run vars.
    pub host: bool,
}

/// Everything the emitter needs, produced by a successful check.
pub struct CheckOutput {
    pub registry: TypeRegistry,
    pub expr_info: HashMap<u32, TypeInfo>,
    pub type_denote: HashMap<u32, TypeId>,
    pub bindings: HashMap<u32, Binding>,
    pub decl_types: HashMap<DeclKey, TypeId>,
    /// Declarations captured by at least one closure; their storage is a
    /// reference cell.
    pub indirect: HashSet<DeclKey>,
    /// Per function body, the outer declarations it captures, in order.
    pub captured: HashMap<FnKey, Vec<DeclKey>>,
    pub globals: Vec<GlobalDecl>,
    /// Indexes of globals with non-host initializers, in evaluation order.
    pub init_order: Vec<u32>,
    /// Host-declared variable names referenced by the template, sorted.
    pub used_host_vars: Vec<String>,
    /// Initial values of host globals, by global index.
    pub native_values: HashMap<u32, crate::vm::value::Value>,
    /// Native method implementations keyed by receiver type and name.
    pub method_impls: HashMap<(TypeId, String), crate::native::NativeFn>,
}

impl CheckOutput {
    pub fn info(&self, e: ExprId) -> &TypeInfo {
        &self.expr_info[&e.raw()]
    }

    pub fn try_info(&self, e: ExprId) -> Option<&TypeInfo> {
        self.expr_info.get(&e.raw())
    }

    pub fn binding(&self, e: ExprId) -> Option<Binding> {
        self.bindings.get(&e.raw()).copied()
    }

    pub fn denoted(&self, t: TypeExprId) -> TypeId {
        self.type_denote[&t.raw()]
    }
}

// =============================================================================
// Options and modality
// =============================================================================

/// The checking modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Script,
    Template,
}

#[derive(Debug, Clone, Copy)]
pub struct CheckOptions {
    pub modality: Modality,
    /// Rejects `go`, channel sends and `select` (the template default).
    pub disallow_go_stmt: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions { modality: Modality::Template, disallow_go_stmt: true }
    }
}

// =============================================================================
// Scopes
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub info: TypeInfo,
    pub binding: Option<Binding>,
    pub decl_pos: Option<Position>,
    pub used: bool,
    /// Index of the function boundary the entry was declared under, to
    /// detect captures.
    pub fn_depth: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Scope {
    names: HashMap<String, Entry>,
    /// Scopes at and below a function boundary belong to that function.
    pub is_fn_boundary: bool,
}

pub(crate) struct FnCtx {
    pub key: Option<FnKey>,
    pub results: Vec<TypeId>,
    pub named_results: bool,
    pub is_macro: bool,
}

/// A loaded native or template package visible through a selector.
pub(crate) struct Pkg {
    pub name: String,
    pub entries: HashMap<String, Entry>,
}

pub(crate) struct Checker<'a> {
    pub ast: &'a Ast,
    pub reg: TypeRegistry,
    pub opts: CheckOptions,
    pub path: String,
    pub format: Format,

    pub expr_info: HashMap<u32, TypeInfo>,
    pub type_denote: HashMap<u32, TypeId>,
    pub bindings: HashMap<u32, Binding>,
    pub decl_types: HashMap<DeclKey, TypeId>,
    pub indirect: HashSet<DeclKey>,
    pub captured: HashMap<FnKey, Vec<DeclKey>>,
    pub globals: Vec<GlobalDecl>,
    pub init_order: Vec<u32>,
    pub used_host_vars: HashSet<String>,
    pub native_values: HashMap<u32, crate::vm::value::Value>,
    pub method_impls: HashMap<(TypeId, String), crate::native::NativeFn>,

    scopes: Vec<Scope>,
    pub fn_stack: Vec<FnCtx>,
    pub pkgs: Vec<Pkg>,
    /// Trees already checked as packages, by tree index.
    checked_pkgs: HashMap<u32, u32>,
    loader: Option<&'a dyn PackageLoader>,
    /// Nesting counters for break/continue/fallthrough legality.
    pub loop_depth: usize,
    pub switch_depth: usize,
    pub select_depth: usize,
    pub in_switch_case: bool,
    pub labels: Vec<String>,
    /// The current iota value inside a const declaration.
    pub iota: Option<i64>,
}

/// Type checks a parsed compilation.
pub fn check(
    ast: &Ast,
    main: TreeRef,
    opts: CheckOptions,
    host: &Declarations,
    loader: Option<&dyn PackageLoader>,
) -> Result<CheckOutput, BuildError> {
    let tree = ast.tree(main);
    let mut c = Checker {
        ast,
        reg: TypeRegistry::new(),
        opts,
        path: tree.path.clone(),
        format: tree.format,
        expr_info: HashMap::new(),
        type_denote: HashMap::new(),
        bindings: HashMap::new(),
        decl_types: HashMap::new(),
        indirect: HashSet::new(),
        captured: HashMap::new(),
        globals: Vec::new(),
        init_order: Vec::new(),
        used_host_vars: HashSet::new(),
        native_values: HashMap::new(),
        method_impls: HashMap::new(),
        scopes: Vec::new(),
        fn_stack: Vec::new(),
        pkgs: Vec::new(),
        checked_pkgs: HashMap::new(),
        loader,
        loop_depth: 0,
        switch_depth: 0,
        select_depth: 0,
        in_switch_case: false,
        labels: Vec::new(),
        iota: None,
    };
    c.push_universe();
    c.push_host_scope(host)?;
    c.check_entry(main)?;
    c.order_global_inits()?;

    let mut used: Vec<String> = c.used_host_vars.into_iter().collect();
    used.sort();
    Ok(CheckOutput {
        registry: c.reg,
        expr_info: c.expr_info,
        type_denote: c.type_denote,
        bindings: c.bindings,
        decl_types: c.decl_types,
        indirect: c.indirect,
        captured: c.captured,
        globals: c.globals,
        init_order: c.init_order,
        used_host_vars: used,
        native_values: c.native_values,
        method_impls: c.method_impls,
    })
}

impl<'a> Checker<'a> {
    // ---------------------------------------------------------------------
    // Errors
    // ---------------------------------------------------------------------

    pub fn error(&self, pos: Position, msg: impl Into<String>) -> BuildError {
        BuildError::new(&self.path, pos, msg)
    }

    pub fn epos(&self, e: ExprId) -> Position {
        self.ast.exprs.pos(e)
    }

    pub fn spos(&self, s: StmtId) -> Position {
        self.ast.stmts.pos(s)
    }

    // ---------------------------------------------------------------------
    // Scopes
    // ---------------------------------------------------------------------

    fn push_universe(&mut self) {
        let mut s = Scope::default();
        let predeclared_types: &[(&str, TypeId)] = &[
            ("bool", types::BOOL),
            ("string", types::STRING),
            ("int", types::INT),
            ("int8", types::INT8),
            ("int16", types::INT16),
            ("int32", types::INT32),
            ("int64", types::INT64),
            ("uint", types::UINT),
            ("uint8", types::UINT8),
            ("uint16", types::UINT16),
            ("uint32", types::UINT32),
            ("uint64", types::UINT64),
            ("uintptr", types::UINTPTR),
            ("float32", types::FLOAT32),
            ("float64", types::FLOAT64),
            ("complex64", types::COMPLEX64),
            ("complex128", types::COMPLEX128),
            ("rune", types::RUNE),
            ("byte", types::BYTE),
            ("any", types::ANY),
            ("error", self.reg.error_type()),
        ];
        for (name, ty) in predeclared_types {
            s.names.insert(
                name.to_string(),
                Entry {
                    info: TypeInfo {
                        ty: *ty,
                        props: Props::IS_TYPE.with(Props::PREDECLARED),
                        constant: None,
                        package: None,
                    },
                    binding: None,
                    decl_pos: None,
                    used: true,
                    fn_depth: 0,
                },
            );
        }
        if self.opts.modality == Modality::Template {
            for f in [Format::Html, Format::Css, Format::JavaScript, Format::Json, Format::Markdown]
            {
                let ty = self.reg.format_type(f).expect("format type");
                let name = self.reg.describe(ty);
                s.names.insert(
                    name,
                    Entry {
                        info: TypeInfo {
                            ty,
                            props: Props::IS_TYPE.with(Props::PREDECLARED),
                            constant: None,
                            package: None,
                        },
                        binding: None,
                        decl_pos: None,
                        used: true,
                        fn_depth: 0,
                    },
                );
            }
        }
        for (name, value) in [("true", true), ("false", false)] {
            s.names.insert(
                name.to_string(),
                Entry {
                    info: TypeInfo::untyped_const(Constant::Bool(value)),
                    binding: None,
                    decl_pos: None,
                    used: true,
                    fn_depth: 0,
                },
            );
        }
        s.names.insert(
            "nil".to_string(),
            Entry {
                info: TypeInfo::nil(),
                binding: None,
                decl_pos: None,
                used: true,
                fn_depth: 0,
            },
        );
        let mut builtins = vec![
            Builtin::Append,
            Builtin::Cap,
            Builtin::Close,
            Builtin::Complex,
            Builtin::Copy,
            Builtin::Delete,
            Builtin::Imag,
            Builtin::Len,
            Builtin::Make,
            Builtin::New,
            Builtin::Panic,
            Builtin::Print,
            Builtin::Println,
            Builtin::Real,
            Builtin::Recover,
        ];
        if self.opts.modality == Modality::Script {
            builtins.push(Builtin::Exit);
        }
        for b in builtins {
            s.names.insert(
                b.name().to_string(),
                Entry {
                    info: TypeInfo {
                        ty: types::ANY,
                        props: Props::IS_BUILTIN.with(Props::PREDECLARED),
                        constant: None,
                        package: None,
                    },
                    binding: Some(Binding::Builtin(b)),
                    decl_pos: None,
                    used: true,
                    fn_depth: 0,
                },
            );
        }
        self.scopes.push(s);
    }

    /// Registers the host declarations as the global scope.
    fn push_host_scope(&mut self, host: &Declarations) -> Result<(), BuildError> {
        let mut s = Scope::default();
        for (name, global) in host.iter() {
            let entry = match global {
                Global::Const(v) => {
                    let c = match v {
                        ConstValue::Bool(b) => Constant::Bool(*b),
                        ConstValue::Str(x) => Constant::Str(x.clone()),
                        ConstValue::Int(i) => Constant::Int((*i).into()),
                        ConstValue::Float(f) => {
                            let r = num_rational::BigRational::from_float(*f)
                                .unwrap_or_else(|| num_rational::BigRational::from_integer(0.into()));
                            Constant::Float(r)
                        }
                    };
                    Entry {
                        info: TypeInfo::untyped_const(c),
                        binding: None,
                        decl_pos: None,
                        used: true,
                        fn_depth: 0,
                    }
                }
                Global::Type(desc) => {
                    let ty = self.materialize_type_desc(name, desc)?;
                    Entry {
                        info: TypeInfo::type_name(ty),
                        binding: None,
                        decl_pos: None,
                        used: true,
                        fn_depth: 0,
                    }
                }
                Global::Var { ty, value } => {
                    let tid = self.materialize_type_desc("", ty)?;
                    let idx = self.globals.len() as u32;
                    self.globals.push(GlobalDecl {
                        name: name.clone(),
                        ty: tid,
                        init: GlobalInit::Host,
                        host: true,
                    });
                    self.native_values.insert(idx, value.clone());
                    Entry {
                        info: TypeInfo::addressable(tid),
                        binding: Some(Binding::Global(idx)),
                        decl_pos: None,
                        used: true,
                        fn_depth: 0,
                    }
                }
                Global::Func { ty, f } => {
                    let tid = self.materialize_type_desc("", ty)?;
                    let idx = self.globals.len() as u32;
                    self.globals.push(GlobalDecl {
                        name: name.clone(),
                        ty: tid,
                        init: GlobalInit::Host,
                        host: false,
                    });
                    self.native_values
                        .insert(idx, crate::vm::value::Value::Native(f.clone()));
                    Entry {
                        info: TypeInfo::value(tid),
                        binding: Some(Binding::Global(idx)),
                        decl_pos: None,
                        used: true,
                        fn_depth: 0,
                    }
                }
            };
            s.names.insert(name.clone(), entry);
        }
        self.scopes.push(s);
        Ok(())
    }

    /// Builds a registry type from a host type description.
    pub fn materialize_type_desc(
        &mut self,
        name: &str,
        desc: &TypeDesc,
    ) -> Result<TypeId, BuildError> {
        // A top-level Named description takes the declaration name when it
        // carries none of its own.
        if let TypeDesc::Named { pkg, name: tname, underlying, methods } = desc {
            if tname.is_empty() && !name.is_empty() {
                return self.named_desc_to_id(pkg, name, underlying, methods);
            }
        }
        self.type_desc_to_id(desc)
    }

    /// Registers a defined type described by the host, with its methods.
    fn named_desc_to_id(
        &mut self,
        pkg: &str,
        name: &str,
        underlying: &TypeDesc,
        methods: &[(String, TypeDesc, crate::native::NativeFn)],
    ) -> Result<TypeId, BuildError> {
        let u = self.type_desc_to_id(underlying)?;
        let id = self.reg.intern(Type::Named {
            pkg: pkg.to_string(),
            name: name.to_string(),
            underlying: u,
        });
        for (mname, sig, imp) in methods {
            let sig = self.type_desc_to_id(sig)?;
            self.reg.add_method(id, MethodSig { name: mname.clone(), sig });
            self.method_impls.insert((id, mname.clone()), imp.clone());
        }
        Ok(id)
    }

    fn type_desc_to_id(&mut self, desc: &TypeDesc) -> Result<TypeId, BuildError> {
        use TypeDesc as D;
        Ok(match desc {
            D::Bool => types::BOOL,
            D::String => types::STRING,
            D::Int => types::INT,
            D::Int8 => types::INT8,
            D::Int16 => types::INT16,
            D::Int32 => types::INT32,
            D::Int64 => types::INT64,
            D::Uint => types::UINT,
            D::Uint8 => types::UINT8,
            D::Uint16 => types::UINT16,
            D::Uint32 => types::UINT32,
            D::Uint64 => types::UINT64,
            D::Float32 => types::FLOAT32,
            D::Float64 => types::FLOAT64,
            D::Complex128 => types::COMPLEX128,
            D::Any => types::ANY,
            D::Error => self.reg.error_type(),
            D::Html => self.reg.format_type(Format::Html).expect("format"),
            D::Css => self.reg.format_type(Format::Css).expect("format"),
            D::Js => self.reg.format_type(Format::JavaScript).expect("format"),
            D::Json => self.reg.format_type(Format::Json).expect("format"),
            D::Markdown => self.reg.format_type(Format::Markdown).expect("format"),
            D::Slice(e) => {
                let e = self.type_desc_to_id(e)?;
                self.reg.slice(e)
            }
            D::Array(n, e) => {
                let e = self.type_desc_to_id(e)?;
                self.reg.array(*n as i64, e)
            }
            D::Map(k, v) => {
                let k = self.type_desc_to_id(k)?;
                let v = self.type_desc_to_id(v)?;
                self.reg.map(k, v)
            }
            D::Ptr(e) => {
                let e = self.type_desc_to_id(e)?;
                self.reg.ptr(e)
            }
            D::Chan(e) => {
                let e = self.type_desc_to_id(e)?;
                self.reg.chan(crate::ast::ChanDir::Both, e)
            }
            D::Func { params, results, variadic } => {
                let params = params
                    .iter()
                    .map(|p| self.type_desc_to_id(p))
                    .collect::<Result<Vec<_>, _>>()?;
                let results = results
                    .iter()
                    .map(|p| self.type_desc_to_id(p))
                    .collect::<Result<Vec<_>, _>>()?;
                self.reg.func(params, results, *variadic)
            }
            D::Struct(fields) => {
                let fields = fields
                    .iter()
                    .map(|(n, t)| {
                        self.type_desc_to_id(t).map(|ty| crate::types::StructField {
                            name: n.clone(),
                            ty,
                            embedded: n.is_empty(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.reg.intern(Type::Struct(fields))
            }
            D::Named { pkg, name, underlying, methods } => {
                self.named_desc_to_id(pkg, name, underlying, methods)?
            }
        })
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn push_fn_scope(&mut self) {
        let mut s = Scope::default();
        s.is_fn_boundary = true;
        self.scopes.push(s);
    }

    /// Pops a scope, applying the unused-name policy: in script modality
    /// an unused local variable is an error; templates allow it.
    pub fn pop_scope(&mut self) -> Result<(), BuildError> {
        let s = self.scopes.pop().expect("scope underflow");
        if self.opts.modality == Modality::Script {
            for (name, e) in &s.names {
                if !e.used && name != "_" && e.info.is_value() && !e.info.is_const() {
                    if let Some(pos) = e.decl_pos {
                        return Err(self.error(pos, format!("{name} declared and not used")));
                    }
                }
            }
        }
        Ok(())
    }

    /// Declares `name` in the current scope.
    pub fn declare(
        &mut self,
        name: &str,
        info: TypeInfo,
        binding: Option<Binding>,
        pos: Position,
    ) -> Result<(), BuildError> {
        if name == "_" {
            return Ok(());
        }
        let fn_depth = self.fn_stack.len();
        let scope = self.scopes.last_mut().expect("no scope");
        if let Some(prev) = scope.names.get(name) {
            let mut msg = format!("{name} redeclared in this block");
            if let Some(pos) = prev.decl_pos {
                msg.push_str(&format!("\n\tprevious declaration at {}:{}", self.path, pos));
            }
            return Err(self.error(pos, msg));
        }
        scope.names.insert(
            name.to_string(),
            Entry { info, binding, decl_pos: Some(pos), used: false, fn_depth },
        );
        Ok(())
    }

    /// Looks `name` up through the scope stack, marking it used and
    /// recording captures when the use crosses a function boundary.
    pub fn lookup(&mut self, name: &str) -> Option<(TypeInfo, Option<Binding>)> {
        for i in (0..self.scopes.len()).rev() {
            if let Some(e) = self.scopes[i].names.get_mut(name) {
                e.used = true;
                let info = e.info.clone();
                let binding = e.binding;
                let decl_depth = e.fn_depth;
                if let Some(Binding::Local(key)) = binding {
                    let cur_depth = self.fn_stack.len();
                    if cur_depth > decl_depth {
                        // Captured by every function between the
                        // declaration and the use.
                        self.indirect.insert(key);
                        for f in &self.fn_stack[decl_depth..] {
                            if let Some(k) = f.key {
                                let caps = self.captured.entry(k).or_default();
                                if !caps.contains(&key) {
                                    caps.push(key);
                                }
                            }
                        }
                    }
                }
                if binding.is_some() {
                    if let Some(g) = match binding {
                        Some(Binding::Global(g)) => Some(g),
                        _ => None,
                    } {
                        let g = &self.globals[g as usize];
                        if g.host {
                            self.used_host_vars.insert(g.name.clone());
                        }
                    }
                }
                return Some((info, binding));
            }
        }
        None
    }

    /// Position of a previous declaration, for redeclaration diagnostics.
    pub fn declared_pos(&self, name: &str) -> Option<Position> {
        for s in self.scopes.iter().rev() {
            if let Some(e) = s.names.get(name) {
                return e.decl_pos;
            }
        }
        None
    }

    pub fn declared_in_current_scope(&self, name: &str) -> bool {
        self.scopes.last().map(|s| s.names.contains_key(name)).unwrap_or(false)
    }

    // ---------------------------------------------------------------------
    // Entry points
    // ---------------------------------------------------------------------

    fn check_entry(&mut self, main: TreeRef) -> Result<(), BuildError> {
        let tree = self.ast.tree(main);
        let nodes = self.ast.stmts_of(tree.nodes).to_vec();
        let extends = nodes
            .iter()
            .find(|&&s| matches!(self.ast.stmts[s], Stmt::Extends { .. }))
            .copied();

        self.push_scope(); // file scope
        match extends {
            Some(ext_stmt) => self.check_extending_file(&nodes, ext_stmt)?,
            None => {
                // A plain template or script: top-level nodes run in order
                // inside the implicit main function. Script functions are
                // pre-declared and their bodies checked first, so they may
                // be called before their declaration but cannot capture
                // the script's local variables.
                if self.opts.modality == Modality::Script {
                    self.predeclare_script_funcs(&nodes)?;
                    for &s in &nodes {
                        if matches!(self.ast.stmts[s], Stmt::FuncDecl { .. }) {
                            self.check_stmt(s)?;
                        }
                    }
                }
                self.fn_stack.push(FnCtx {
                    key: None,
                    results: Vec::new(),
                    named_results: false,
                    is_macro: self.opts.modality == Modality::Template,
                });
                self.push_fn_scope();
                for &s in &nodes {
                    if self.opts.modality == Modality::Script
                        && matches!(self.ast.stmts[s], Stmt::FuncDecl { .. })
                    {
                        continue;
                    }
                    self.check_stmt(s)?;
                }
                self.pop_scope()?;
                self.fn_stack.pop();
            }
        }
        self.pop_scope()?;
        Ok(())
    }

    /// Checks a file with `{% extends %}`: child macros are pre-declared,
    /// the extended file is checked next so it can reference them, then
    /// the child declarations are checked as a package.
    fn check_extending_file(
        &mut self,
        nodes: &[StmtId],
        ext_stmt: StmtId,
    ) -> Result<(), BuildError> {
        let parent = match self.ast.stmts[ext_stmt] {
            Stmt::Extends { tree, .. } => tree,
            _ => unreachable!(),
        };

        // First: declare every macro of the extending file (signature
        // only), backed by a global slot.
        let mut macro_globals: Vec<(StmtId, u32)> = Vec::new();
        for &s in nodes {
            if let Stmt::MacroDecl { name, params, variadic, format, .. } = self.ast.stmts[s] {
                let ty = self.macro_type(params, variadic, format)?;
                let idx = self.globals.len() as u32;
                let name = self.ast.name(name).to_string();
                self.globals.push(GlobalDecl {
                    name: name.clone(),
                    ty,
                    init: GlobalInit::Closure(s),
                    host: false,
                });
                let info = TypeInfo {
                    ty,
                    props: Props::HAS_VALUE.with(Props::IS_MACRO),
                    constant: None,
                    package: None,
                };
                self.declare(&name, info, Some(Binding::Global(idx)), self.spos(s))?;
                macro_globals.push((s, idx));
            }
        }

        // Second: process imports of the extending file.
        for &s in nodes {
            if matches!(self.ast.stmts[s], Stmt::Import { .. }) {
                self.check_stmt(s)?;
            }
        }

        // Third: the package-level types, constants and variables of the
        // extending file, ordered by dependency.
        self.check_package_decls(nodes)?;

        // Fourth: the extended file, in its own path for diagnostics.
        let saved_path = std::mem::replace(&mut self.path, self.ast.tree(parent).path.clone());
        let saved_format = std::mem::replace(&mut self.format, self.ast.tree(parent).format);
        let parent_nodes = self.ast.stmts_of(self.ast.tree(parent).nodes).to_vec();
        if parent_nodes
            .iter()
            .any(|&s| matches!(self.ast.stmts[s], Stmt::Extends { .. }))
        {
            // Extension chains: the parent is itself an extending file.
            let ext = parent_nodes
                .iter()
                .find(|&&s| matches!(self.ast.stmts[s], Stmt::Extends { .. }))
                .copied()
                .expect("extends");
            self.push_scope();
            self.check_extending_file(&parent_nodes, ext)?;
            self.pop_scope()?;
        } else {
            self.fn_stack.push(FnCtx {
                key: None,
                results: Vec::new(),
                named_results: false,
                is_macro: true,
            });
            self.push_fn_scope();
            for &s in &parent_nodes {
                self.check_stmt(s)?;
            }
            self.pop_scope()?;
            self.fn_stack.pop();
        }
        self.path = saved_path;
        self.format = saved_format;

        // Fifth: the macro bodies of the extending file.
        for (s, _idx) in macro_globals {
            self.check_macro_body(s)?;
        }
        Ok(())
    }

    /// Declares and checks package-level `type`, `const` and `var`
    /// declarations, with initialization-cycle detection for variables.
    pub(crate) fn check_package_decls(&mut self, nodes: &[StmtId]) -> Result<(), BuildError> {
        // Types and constants first, in order.
        for &s in nodes {
            match self.ast.stmts[s] {
                Stmt::TypeDecl { .. } | Stmt::Const { .. } => self.check_stmt(s)?,
                _ => {}
            }
        }
        // Variables: order by dependencies among package-level names.
        let vars: Vec<StmtId> = nodes
            .iter()
            .copied()
            .filter(|&s| matches!(self.ast.stmts[s], Stmt::Var { .. }))
            .collect();
        let ordered = self.order_var_decls(&vars)?;
        for s in ordered {
            self.check_package_var(s)?;
        }
        Ok(())
    }

    /// Topologically orders package-level var declarations by the names
    /// their initializers reference; reports initialization cycles.
    fn order_var_decls(&mut self, vars: &[StmtId]) -> Result<Vec<StmtId>, BuildError> {
        // Map from declared name to declaration index.
        let mut by_name: HashMap<String, usize> = HashMap::new();
        for (i, &s) in vars.iter().enumerate() {
            if let Stmt::Var { names, .. } = self.ast.stmts[s] {
                for &n in self.ast.exprs_of(names) {
                    if let Expr::Ident(sym) = self.ast.exprs[n] {
                        by_name.insert(self.ast.name(sym).to_string(), i);
                    }
                }
            }
        }
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); vars.len()];
        for (i, &s) in vars.iter().enumerate() {
            if let Stmt::Var { values, .. } = self.ast.stmts[s] {
                let mut idents = Vec::new();
                for &v in self.ast.exprs_of(values) {
                    self.collect_idents(v, &mut idents);
                }
                for name in idents {
                    if let Some(&j) = by_name.get(&name) {
                        if j != i && !deps[i].contains(&j) {
                            deps[i].push(j);
                        }
                        if j == i {
                            return Err(self.error(
                                self.spos(s),
                                format!("initialization cycle: {name} refers to itself"),
                            ));
                        }
                    }
                }
            }
        }
        // Depth-first topological sort with cycle detection.
        let mut state = vec![0u8; vars.len()]; // 0 new, 1 visiting, 2 done
        let mut order = Vec::new();
        fn visit(
            i: usize,
            deps: &[Vec<usize>],
            state: &mut [u8],
            order: &mut Vec<usize>,
        ) -> bool {
            match state[i] {
                1 => return false,
                2 => return true,
                _ => {}
            }
            state[i] = 1;
            for &j in &deps[i] {
                if !visit(j, deps, state, order) {
                    return false;
                }
            }
            state[i] = 2;
            order.push(i);
            true
        }
        for i in 0..vars.len() {
            if !visit(i, &deps, &mut state, &mut order) {
                return Err(self.error(self.spos(vars[i]), "initialization cycle".to_string()));
            }
        }
        Ok(order.into_iter().map(|i| vars[i]).collect())
    }

    fn collect_idents(&self, e: ExprId, out: &mut Vec<String>) {
        match self.ast.exprs[e] {
            Expr::Ident(sym) => out.push(self.ast.name(sym).to_string()),
            Expr::Unary { expr, .. } => self.collect_idents(expr, out),
            Expr::Binary { lhs, rhs, .. } => {
                self.collect_idents(lhs, out);
                self.collect_idents(rhs, out);
            }
            Expr::Index { expr, index } => {
                self.collect_idents(expr, out);
                self.collect_idents(index, out);
            }
            Expr::Slice { expr, low, high, max } => {
                self.collect_idents(expr, out);
                for e in [low, high, max].into_iter().flatten() {
                    self.collect_idents(e, out);
                }
            }
            Expr::Selector { expr, .. } => self.collect_idents(expr, out),
            Expr::TypeAssert { expr, .. } => self.collect_idents(expr, out),
            Expr::Call { func, args, .. } => {
                self.collect_idents(func, out);
                for &a in self.ast.exprs_of(args) {
                    self.collect_idents(a, out);
                }
            }
            Expr::Composite { elems, .. } => {
                for el in self.ast.elements_of(elems) {
                    if let Some(k) = el.key {
                        self.collect_idents(k, out);
                    }
                    self.collect_idents(el.value, out);
                }
            }
            _ => {}
        }
    }

    /// Checks a package-level var declaration, registering globals.
    fn check_package_var(&mut self, s: StmtId) -> Result<(), BuildError> {
        let (names, ty, values) = match self.ast.stmts[s] {
            Stmt::Var { names, ty, values } => (names, ty, values),
            _ => unreachable!(),
        };
        let names = self.ast.exprs_of(names).to_vec();
        let values = self.ast.exprs_of(values).to_vec();
        let declared = match ty {
            Some(t) => Some(self.check_type_expr(t)?),
            None => None,
        };
        if !values.is_empty() && values.len() != names.len() {
            return Err(self.error(
                self.spos(s),
                format!(
                    "assignment mismatch: {} variables but {} values",
                    names.len(),
                    values.len()
                ),
            ));
        }
        for (i, &name_e) in names.iter().enumerate() {
            let sym = match self.ast.exprs[name_e] {
                Expr::Ident(sym) => sym,
                _ => continue,
            };
            let name = self.ast.name(sym).to_string();
            let (ty, init) = if let Some(&v) = values.get(i) {
                let info = self.check_value(v)?;
                let ty = match declared {
                    Some(d) => {
                        self.assign_to(v, &info, d)?;
                        d
                    }
                    None => self.default_of(v, info)?,
                };
                (ty, GlobalInit::Expr(v))
            } else {
                (declared.expect("var without type or value"), GlobalInit::Zero)
            };
            let idx = self.globals.len() as u32;
            self.globals.push(GlobalDecl { name: name.clone(), ty, init, host: false });
            self.expr_info.insert(name_e.raw(), TypeInfo::addressable(ty));
            self.declare(
                &name,
                TypeInfo::addressable(ty),
                Some(Binding::Global(idx)),
                self.epos(name_e),
            )?;
        }
        Ok(())
    }

    /// Checks a macro declaration body (already declared).
    pub(crate) fn check_macro_body(&mut self, s: StmtId) -> Result<(), BuildError> {
        let (params, variadic, body) = match self.ast.stmts[s] {
            Stmt::MacroDecl { params, variadic, body, .. } => (params, variadic, body),
            _ => unreachable!(),
        };
        self.fn_stack.push(FnCtx {
            key: Some(FnKey::Decl(s.raw())),
            results: Vec::new(),
            named_results: false,
            is_macro: true,
        });
        self.push_fn_scope();
        let params = self.ast.params_of(params).to_vec();
        for (i, p) in params.iter().enumerate() {
            let ty = self.check_type_expr(p.ty)?;
            let ty = if variadic && i + 1 == params.len() { self.reg.slice(ty) } else { ty };
            let key = DeclKey::StmtParam(s.raw(), i as u16);
            self.decl_types.insert(key, ty);
            if let Some(name) = p.name {
                let name = self.ast.name(name).to_string();
                self.declare(
                    &name,
                    TypeInfo::addressable(ty),
                    Some(Binding::Local(key)),
                    p.pos,
                )?;
            }
        }
        for &inner in &self.ast.stmts_of(body).to_vec() {
            self.check_stmt(inner)?;
        }
        self.pop_scope()?;
        self.fn_stack.pop();
        Ok(())
    }

    pub(crate) fn macro_type(
        &mut self,
        params: ListRef,
        variadic: bool,
        format: Format,
    ) -> Result<TypeId, BuildError> {
        let mut ptypes = Vec::new();
        let params = self.ast.params_of(params).to_vec();
        for p in &params {
            ptypes.push(self.check_type_expr(p.ty)?);
        }
        // A variadic macro's last parameter is received as a slice.
        if variadic {
            if let Some(last) = ptypes.last_mut() {
                *last = self.reg.slice(*last);
            }
        }
        let format = if format == Format::Text && self.format != Format::Text {
            // Default macro format is the format of the file.
            self.format
        } else {
            format
        };
        Ok(self.reg.intern(Type::Macro(MacroType { params: ptypes, variadic, format })))
    }

    // ---------------------------------------------------------------------
    // Imports
    // ---------------------------------------------------------------------

    /// Checks an imported template file as a package and returns its
    /// exported entries.
    pub(crate) fn check_imported_tree(&mut self, tree: TreeRef) -> Result<u32, BuildError> {
        if let Some(&idx) = self.checked_pkgs.get(&tree.0) {
            return Ok(idx);
        }
        let t = self.ast.tree(tree);
        let pkg_path = t.path.clone();
        let saved_path = std::mem::replace(&mut self.path, pkg_path.clone());
        let saved_format = std::mem::replace(&mut self.format, t.format);
        let nodes = self.ast.stmts_of(t.nodes).to_vec();

        self.push_scope(); // package file scope

        // Imports of the imported file.
        for &s in &nodes {
            if matches!(self.ast.stmts[s], Stmt::Import { .. }) {
                self.check_stmt(s)?;
            }
        }
        // Macros: pre-declare, check bodies after the other declarations.
        let mut macro_stmts = Vec::new();
        for &s in &nodes {
            if let Stmt::MacroDecl { name, params, variadic, format, .. } = self.ast.stmts[s] {
                let ty = self.macro_type(params, variadic, format)?;
                let idx = self.globals.len() as u32;
                let name = self.ast.name(name).to_string();
                self.globals.push(GlobalDecl {
                    name: format!("{pkg_path}.{name}"),
                    ty,
                    init: GlobalInit::Closure(s),
                    host: false,
                });
                let info = TypeInfo {
                    ty,
                    props: Props::HAS_VALUE.with(Props::IS_MACRO),
                    constant: None,
                    package: None,
                };
                self.declare(&name, info, Some(Binding::Global(idx)), self.spos(s))?;
                macro_stmts.push(s);
            }
        }
        self.check_package_decls(&nodes)?;
        for s in macro_stmts {
            self.check_macro_body(s)?;
        }

        // Export the package scope.
        let scope = self.scopes.pop().expect("package scope");
        let entries = scope.names;
        let idx = self.pkgs.len() as u32;
        let name = pkg_path.rsplit('/').next().unwrap_or(&pkg_path);
        let name = name.split('.').next().unwrap_or(name).to_string();
        self.pkgs.push(Pkg { name, entries });
        self.checked_pkgs.insert(tree.0, idx);

        self.path = saved_path;
        self.format = saved_format;
        Ok(idx)
    }

    /// Loads a precompiled native package.
    pub(crate) fn load_native_pkg(&mut self, path: &str, pos: Position) -> Result<u32, BuildError> {
        let loader = self
            .loader
            .ok_or_else(|| self.error(pos, format!("cannot find package {path:?}")))?;
        let pkg = loader
            .load(path)
            .ok_or_else(|| self.error(pos, format!("cannot find package {path:?}")))?;
        let mut entries = HashMap::new();
        for (name, global) in pkg.decls.iter() {
            let entry = match global {
                Global::Const(v) => {
                    let c = match v {
                        ConstValue::Bool(b) => Constant::Bool(*b),
                        ConstValue::Str(x) => Constant::Str(x.clone()),
                        ConstValue::Int(i) => Constant::Int((*i).into()),
                        ConstValue::Float(f) => Constant::Float(
                            num_rational::BigRational::from_float(*f).unwrap_or_else(|| {
                                num_rational::BigRational::from_integer(0.into())
                            }),
                        ),
                    };
                    Entry {
                        info: TypeInfo::untyped_const(c),
                        binding: None,
                        decl_pos: None,
                        used: true,
                        fn_depth: 0,
                    }
                }
                Global::Type(desc) => {
                    let ty = self.materialize_type_desc(name, desc)?;
                    Entry {
                        info: TypeInfo::type_name(ty),
                        binding: None,
                        decl_pos: None,
                        used: true,
                        fn_depth: 0,
                    }
                }
                Global::Var { ty, value } => {
                    let tid = self.materialize_type_desc("", ty)?;
                    let idx = self.globals.len() as u32;
                    self.globals.push(GlobalDecl {
                        name: format!("{}.{}", pkg.name, name),
                        ty: tid,
                        init: GlobalInit::Host,
                        host: false,
                    });
                    self.native_values.insert(idx, value.clone());
                    Entry {
                        info: TypeInfo::addressable(tid),
                        binding: Some(Binding::Global(idx)),
                        decl_pos: None,
                        used: true,
                        fn_depth: 0,
                    }
                }
                Global::Func { ty, f } => {
                    let tid = self.materialize_type_desc("", ty)?;
                    let idx = self.globals.len() as u32;
                    self.globals.push(GlobalDecl {
                        name: format!("{}.{}", pkg.name, name),
                        ty: tid,
                        init: GlobalInit::Host,
                        host: false,
                    });
                    self.native_values
                        .insert(idx, crate::vm::value::Value::Native(f.clone()));
                    Entry {
                        info: TypeInfo::value(tid),
                        binding: Some(Binding::Global(idx)),
                        decl_pos: None,
                        used: true,
                        fn_depth: 0,
                    }
                }
            };
            entries.insert(name.clone(), entry);
        }
        let idx = self.pkgs.len() as u32;
        self.pkgs.push(Pkg { name: pkg.name.clone(), entries });
        Ok(idx)
    }

    // ---------------------------------------------------------------------
    // Global initialization order
    // ---------------------------------------------------------------------

    fn order_global_inits(&mut self) -> Result<(), BuildError> {
        // Globals were registered in dependency order by construction;
        // closures (macros, functions) are built first so initializer
        // expressions may call them.
        let mut closures = Vec::new();
        let mut exprs = Vec::new();
        for (i, g) in self.globals.iter().enumerate() {
            match g.init {
                GlobalInit::Closure(_) => closures.push(i as u32),
                GlobalInit::Expr(_) => exprs.push(i as u32),
                _ => {}
            }
        }
        self.init_order = closures;
        self.init_order.extend(exprs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MapFiles;
    use crate::parser;

    fn check_src(src: &str, host: &Declarations) -> Result<CheckOutput, BuildError> {
        let fs = MapFiles::from_pairs([("index.html", src)]);
        let parsed = parser::parse_template(&fs, "index.html").expect("parse");
        check(&parsed.ast, parsed.main, CheckOptions::default(), host, None)
    }

    #[test]
    fn named_type_desc_takes_declaration_name() {
        // The description carries no name of its own; the declaration key
        // supplies it.
        let mut host = Declarations::new();
        host.add_type(
            "Celsius",
            TypeDesc::Named {
                pkg: String::new(),
                name: String::new(),
                underlying: Box::new(TypeDesc::Int),
                methods: Vec::new(),
            },
        );
        let out = check_src("{% var x Celsius = 1 %}ok", &host).unwrap();
        let ty = out.decl_types.values().copied().next().expect("declared variable");
        assert_eq!(out.registry.describe(ty), "Celsius");
        assert_eq!(out.registry.underlying(ty), types::INT);
    }

    #[test]
    fn named_type_desc_keeps_its_own_name() {
        // A description that names itself wins over the declaration key.
        let mut host = Declarations::new();
        host.add_type(
            "Temp",
            TypeDesc::Named {
                pkg: String::new(),
                name: "Celsius".to_string(),
                underlying: Box::new(TypeDesc::Int),
                methods: Vec::new(),
            },
        );
        let out = check_src("{% var x Temp = 1 %}ok", &host).unwrap();
        let ty = out.decl_types.values().copied().next().expect("declared variable");
        assert_eq!(out.registry.describe(ty), "Celsius");
    }
}
