//! Compiler and register VM for a Go-flavored scripting language embedded
//! in a context-aware template engine.
//!
//! Template files interleave literal text with code regions; `build`
//! compiles a file (and everything it includes, imports or extends) into
//! immutable bytecode, and [`Template::run`] executes it, streaming
//! rendered output to a writer while interpolated values are escaped for
//! the rendering context they appear in.
//!
//! ```no_run
//! use tela::{build, BuildOptions, MapFiles, RunOptions};
//!
//! let fs = MapFiles::from_pairs([("index.html", "Hello {{ name }}!")]);
//! let mut opts = BuildOptions::default();
//! opts.globals.add_var("name", tela::TypeDesc::String, tela::Value::str("world"));
//! let template = build(&fs, "index.html", &opts).unwrap();
//! let mut out = Vec::new();
//! template.run(&mut out, &Default::default(), &RunOptions::default()).unwrap();
//! ```

pub mod ast;
pub mod checker;
pub mod code;
pub mod emitter;
pub mod error;
pub mod fs;
pub mod lexer;
pub mod native;
pub mod parser;
pub mod render;
pub mod types;
pub mod vm;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug_span;

pub use crate::error::{BuildError, PanicError, RuntimeError};
pub use crate::fs::{DirFiles, Files, Format, MapFiles};
pub use crate::native::{
    native_fn, ConstValue, Declarations, Global, MapPackages, NativeFn, NativePackage,
    PackageLoader, TypeDesc,
};
pub use crate::render::{Converter, PrintFunc};
pub use crate::vm::value::Value;

use crate::checker::{CheckOptions, Modality};
use crate::code::{Code, Function};
use crate::render::Renderer;
use crate::types::Type;
use crate::vm::{init_globals, Env, Vm};

/// Options for [`build`] and [`Script::build`].
#[derive(Default)]
pub struct BuildOptions {
    /// Constants, types, variables and functions visible to the code.
    pub globals: Declarations,
    /// Resolves `import` paths without an extension.
    pub packages: Option<Arc<dyn PackageLoader>>,
    /// Rejects the `go` statement at check time.
    pub disallow_go_stmt: bool,
}

/// Options for [`Template::run`] and [`Script::run`].
#[derive(Default, Clone)]
pub struct RunOptions {
    /// Cancels the run this long after it starts.
    pub timeout: Option<Duration>,
    /// Maximum bytes the run may allocate.
    pub memory_limit: Option<i64>,
    /// Destination of `print` and `println`; stderr when unset.
    pub print: Option<PrintFunc>,
    /// Converts Markdown to HTML when a `markdown` value is shown in an
    /// HTML context.
    pub markdown_converter: Option<Converter>,
}

/// Values for the host-declared variables of a run.
pub type Vars = HashMap<String, Value>;

/// A compiled template, immutable and freely shareable across concurrent
/// runs.
#[derive(Debug, Clone)]
pub struct Template {
    code: Arc<Code>,
}

/// Compiles the named template file rooted at `files`.
///
/// The file format (and with it the initial rendering context) comes
/// from the file system's `format` method, by default inferred from the
/// extension.
pub fn build(
    files: &dyn Files,
    name: &str,
    options: &BuildOptions,
) -> Result<Template, BuildError> {
    let _span = debug_span!("build", name).entered();
    let parsed = parser::parse_template(files, name)?;
    let opts = CheckOptions {
        modality: Modality::Template,
        disallow_go_stmt: options.disallow_go_stmt,
    };
    let loader = options.packages.as_deref();
    let out = checker::check(&parsed.ast, parsed.main, opts, &options.globals, loader)?;
    let mut code = emitter::emit(&parsed.ast, &out, parsed.main, &out.globals)?;
    wrap_native_stubs(&mut code);
    tracing::debug!(
        globals = code.globals.len(),
        instructions = code.main.body.len(),
        "template built"
    );
    Ok(Template { code: Arc::new(code) })
}

impl Template {
    /// Runs the template, writing rendered output to `out`. `vars` holds
    /// the values of host-declared variables; missing names keep their
    /// declaration values.
    pub fn run(
        &self,
        out: &mut dyn Write,
        vars: &Vars,
        options: &RunOptions,
    ) -> Result<(), RuntimeError> {
        let _span = debug_span!("run", template = %self.code.main.file).entered();
        let env = Arc::new(Env::new(
            options.timeout.map(|t| Instant::now() + t),
            options.memory_limit,
            options.print.clone(),
        ));
        let globals = init_globals(&self.code, vars)?;
        let renderer = Renderer::new(out, options.markdown_converter.clone());
        let mut vm = Vm::new(self.code.clone(), env, globals, Some(renderer));
        vm.run_main()
    }

    /// The names of the host-declared variables the template uses,
    /// sorted.
    pub fn used_vars(&self) -> Vec<String> {
        self.code.used_vars.clone()
    }

    /// Disassembles the template.
    ///
    /// `n` bounds disassembled text: at most `n` runes with surrounding
    /// white space trimmed when `n > 0`, no text when `n == 0`, all of
    /// it when `n < 0`.
    pub fn disassemble(&self, n: i32) -> Vec<u8> {
        code::disassemble(&self.code, n)
    }

    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }
}

/// A compiled script: statements executed for effect, with an `exit`
/// builtin supplying the process exit code.
#[derive(Debug, Clone)]
pub struct Script {
    code: Arc<Code>,
}

impl Script {
    /// Compiles script source. Scripts have no literal text and may not
    /// include or extend template files.
    pub fn build(src: &str, name: &str, options: &BuildOptions) -> Result<Script, BuildError> {
        let _span = debug_span!("build_script", name).entered();
        let parsed = parser::parse_script(src, name)?;
        let opts = CheckOptions {
            modality: Modality::Script,
            disallow_go_stmt: options.disallow_go_stmt,
        };
        let loader = options.packages.as_deref();
        let out = checker::check(&parsed.ast, parsed.main, opts, &options.globals, loader)?;
        let mut code = emitter::emit(&parsed.ast, &out, parsed.main, &out.globals)?;
        wrap_native_stubs(&mut code);
        Ok(Script { code: Arc::new(code) })
    }

    /// Runs the script and returns its exit code: 0 normally, or the
    /// value passed to `exit(n)`.
    pub fn run(&self, vars: &Vars, options: &RunOptions) -> Result<i32, RuntimeError> {
        let _span = debug_span!("run_script", script = %self.code.main.file).entered();
        let env = Arc::new(Env::new(
            options.timeout.map(|t| Instant::now() + t),
            options.memory_limit,
            options.print.clone(),
        ));
        let globals = init_globals(&self.code, vars)?;
        let mut vm = Vm::new(self.code.clone(), env, globals, None);
        match vm.run_main() {
            Ok(()) => Ok(0),
            Err(RuntimeError::Exit(n)) => Ok(n),
            Err(e) => Err(e),
        }
    }

    pub fn disassemble(&self, n: i32) -> Vec<u8> {
        code::disassemble(&self.code, n)
    }
}

/// Wraps host function values into native-backed stub functions, so
/// calling them through a function-typed variable uses the ordinary
/// calling convention.
fn wrap_native_stubs(code: &mut Code) {
    let registry = code.registry.clone();
    for (i, g) in code.globals.iter().enumerate() {
        let idx = i as u32;
        let ft = match registry.get(registry.underlying(g.ty)) {
            Type::Func(ft) => ft.clone(),
            _ => continue,
        };
        let nf = match code.native_values.get(&idx) {
            Some(Value::Native(nf)) => nf.clone(),
            _ => continue,
        };
        let mut in_counts = [0u8; 4];
        for &t in &ft.params {
            in_counts[code::Bank::of(&registry, t) as usize] += 1;
        }
        let mut out_counts = [0u8; 4];
        for &t in &ft.results {
            out_counts[code::Bank::of(&registry, t) as usize] += 1;
        }
        let stub = Function {
            name: g.name.clone(),
            file: String::new(),
            format: code.format,
            regs: {
                let mut regs = [0u8; 4];
                for b in 0..4 {
                    regs[b] = in_counts[b] + out_counts[b] + 1;
                }
                regs
            },
            in_counts,
            out_counts,
            ins: ft.params.clone(),
            outs: ft.results.clone(),
            native: Some(nf),
            consts_int: Vec::new(),
            consts_float: Vec::new(),
            consts_string: Vec::new(),
            consts_general: Vec::new(),
            types: Vec::new(),
            funcs: Vec::new(),
            crefs: Vec::new(),
            selects: Vec::new(),
            body: Vec::new(),
            lines: Vec::new(),
            is_macro: false,
        };
        let closure = Value::Closure(Arc::new(vm::value::Closure {
            func: Arc::new(stub),
            cvars: Vec::new(),
        }));
        code.native_values.insert(idx, closure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_run_hello() {
        let fs = MapFiles::from_pairs([("index.html", "Hello {{ name }}!")]);
        let mut opts = BuildOptions::default();
        opts.globals.add_var("name", TypeDesc::String, Value::str("<b>"));
        let t = build(&fs, "index.html", &opts).unwrap();
        let mut out = Vec::new();
        t.run(&mut out, &Vars::new(), &RunOptions::default()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Hello &lt;b&gt;!");
    }

    #[test]
    fn used_vars_are_sorted() {
        let fs = MapFiles::from_pairs([("index.html", "{{ b }}{{ a }}")]);
        let mut opts = BuildOptions::default();
        opts.globals.add_var("b", TypeDesc::Int, Value::Int(1));
        opts.globals.add_var("a", TypeDesc::Int, Value::Int(2));
        opts.globals.add_var("unused", TypeDesc::Int, Value::Int(3));
        let t = build(&fs, "index.html", &opts).unwrap();
        assert_eq!(t.used_vars(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn type_error_carries_path_and_position() {
        let fs = MapFiles::from_pairs([("index.html", "{{ 42 + \"hello\" }}")]);
        let err = build(&fs, "index.html", &BuildOptions::default()).unwrap_err();
        assert_eq!(err.path, "index.html");
        assert!(err.message.contains("mismatched types int and string"), "{}", err.message);
    }
}
