//! The `tela` command: builds and runs a template or script file.
//!
//! Template formats render to stdout; any other extension runs as a
//! script whose `exit(n)` value becomes the process exit code. `-S`
//! disassembles instead of running.
//!
//! Exit codes: 0 success, 1 usage error, 2 build or runtime error.

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use tela::{build, BuildOptions, DirFiles, Format, RunOptions, RuntimeError, Script, Vars};

#[derive(Parser)]
#[command(name = "tela", version, about = "Run a template or script file")]
struct Args {
    /// Print the assembly listing instead of running.
    #[arg(short = 'S')]
    asm: bool,

    /// Limit the allocable memory, e.g. 250K, 16M, 1G; zero is no limit.
    #[arg(long = "mem", value_name = "size")]
    mem: Option<String>,

    /// Limit the execution time, e.g. 50ms, 2s; zero is no limit.
    #[arg(long = "time", value_name = "duration")]
    time: Option<String>,

    /// The file to run.
    file: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };
    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("tela: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<u8> {
    let mut options = RunOptions::default();
    if let Some(time) = &args.time {
        let d = parse_duration(time).map_err(|e| usage(&e))?;
        if !d.is_zero() {
            options.timeout = Some(d);
        }
    }
    if let Some(mem) = &args.mem {
        let bytes = parse_size(mem).map_err(|e| usage(&e))?;
        if bytes > 0 {
            options.memory_limit = Some(bytes);
        }
    }

    let path = Path::new(&args.file);
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| usage("invalid file name"))?
        .to_string();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    if Format::from_path(&name) != Format::Text {
        // A template file: render to stdout.
        let files = DirFiles::new(dir);
        let template =
            build(&files, &name, &BuildOptions::default()).map_err(|e| anyhow!("{e}"))?;
        if args.asm {
            std::io::stdout().write_all(&template.disassemble(80))?;
            return Ok(0);
        }
        let mut stdout = std::io::stdout().lock();
        match template.run(&mut stdout, &Vars::new(), &options) {
            Ok(()) => Ok(0),
            Err(e) => Err(runtime_error(e)),
        }
    } else {
        let src = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", args.file))?;
        let script =
            Script::build(&src, &name, &BuildOptions::default()).map_err(|e| anyhow!("{e}"))?;
        if args.asm {
            std::io::stdout().write_all(&script.disassemble(80))?;
            return Ok(0);
        }
        match script.run(&Vars::new(), &options) {
            Ok(code) => Ok(code.clamp(0, 255) as u8),
            Err(e) => Err(runtime_error(e)),
        }
    }
}

fn runtime_error(e: RuntimeError) -> anyhow::Error {
    match e {
        RuntimeError::Panic(p) => anyhow!("{p}"),
        RuntimeError::DeadlineExceeded => anyhow!("process took too long"),
        other => anyhow!("{other}"),
    }
}

fn usage(msg: &str) -> anyhow::Error {
    // Usage problems exit with code 1, like flag parsing failures.
    eprintln!("usage: tela [-S] [--mem <size>] [--time <duration>] <file>");
    eprintln!("tela: {msg}");
    std::process::exit(1);
}

/// Parses a duration like `50ms`, `2s` or `1m`.
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let (num, unit) = split_number(s)?;
    let n: f64 = num.parse().map_err(|_| format!("invalid duration {s:?}"))?;
    let secs = match unit {
        "ns" => n / 1e9,
        "us" | "µs" => n / 1e6,
        "ms" => n / 1e3,
        "s" | "" => n,
        "m" => n * 60.0,
        "h" => n * 3600.0,
        _ => return Err(format!("invalid duration unit {unit:?}")),
    };
    Ok(Duration::from_secs_f64(secs))
}

/// Parses a memory size like `250K`, `16M` or `1G`.
fn parse_size(s: &str) -> std::result::Result<i64, String> {
    let (num, unit) = split_number(s)?;
    let n: i64 = num.parse().map_err(|_| format!("invalid size {s:?}"))?;
    let mult = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        _ => return Err(format!("invalid size unit {unit:?}")),
    };
    Ok(n * mult)
}

fn split_number(s: &str) -> std::result::Result<(&str, &str), String> {
    let end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .unwrap_or(s.len());
    if end == 0 {
        return Err(format!("invalid value {s:?}"));
    }
    Ok((&s[..end], &s[end..]))
}
