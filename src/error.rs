use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Compact byte-span used across the compiler.
///
/// Offsets are `u32` for compactness; inputs over 4GiB are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: u32,
    pub end: u32, // inclusive
}

impl Span {
    #[inline]
    pub const fn new(start: usize, end: usize) -> Self {
        let s = if start > u32::MAX as usize {
            u32::MAX
        } else {
            start as u32
        };
        let e = if end > u32::MAX as usize {
            u32::MAX
        } else {
            end as u32
        };
        Self { start: s, end: e }
    }
}

/// A position in a source file, as reported in diagnostics.
///
/// `line` and `column` are 1-based; `start` and `end` are byte offsets,
/// with `end` pointing at the first byte of the last rune of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: u32,
    pub column: u32,
    pub start: u32,
    pub end: u32,
}

impl Position {
    #[inline]
    pub const fn new(line: u32, column: u32, start: u32, end: u32) -> Self {
        Self { line, column, start, end }
    }

    /// Extends this position to the end of `other`.
    #[inline]
    pub fn to(self, other: Position) -> Position {
        Position { end: other.end, ..self }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LexErrorKind {
    #[error("invalid character")]
    InvalidToken,
    #[error("invalid numeric literal")]
    InvalidNumber,
    #[error("invalid escape")]
    InvalidEscape,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated rune literal")]
    UnterminatedRune,
    #[error("unterminated comment")]
    UnterminatedComment,
    #[error("unexpected EOF, expecting }}}}")]
    UnterminatedValue,
    #[error("unexpected EOF, expecting %}}")]
    UnterminatedStatement,
}

impl Default for LexErrorKind {
    #[inline]
    fn default() -> Self {
        LexErrorKind::InvalidToken
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}")]
pub struct LexError {
    pub kind: LexErrorKind,
    pub pos: Position,
}

/// An error returned by `build`: a syntax or type error with the path of
/// the file it was found in and a byte-precise position.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{path}:{pos}: {message}")]
pub struct BuildError {
    pub path: String,
    pub pos: Position,
    pub message: String,
}

impl BuildError {
    pub fn new(path: &str, pos: Position, message: impl Into<String>) -> Self {
        Self { path: path.to_string(), pos, message: message.into() }
    }
}

/// One entry of a panic chain: the panic message and whether a deferred
/// call recovered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicEntry {
    pub message: String,
    pub recovered: bool,
}

/// An unrecovered panic, wrapping the whole chain from the first panic to
/// the one that reached the VM boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicError {
    pub chain: Vec<PanicEntry>,
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut msg = String::new();
        for (i, p) in self.chain.iter().enumerate() {
            let mut line = String::new();
            if i + 1 < self.chain.len() {
                line.push_str("\tpanic: ");
            }
            line.push_str(&p.message);
            if p.recovered {
                line.push_str(" [recovered]");
            }
            line.push('\n');
            msg.insert_str(0, &line);
        }
        write!(f, "{}", msg.trim_end_matches('\n'))
    }
}

impl std::error::Error for PanicError {}

/// A failure surfaced by a template or script run.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Panic(PanicError),
    #[error("cannot allocate memory")]
    OutOfMemory,
    #[error("execution cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("cannot show Markdown in HTML context without a Markdown converter")]
    NoMarkdownConverter,
    #[error("{msg}")]
    Fault { msg: String, pos: Position },
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Raised by the `exit` builtin in script modality; carries the
    /// process exit code requested by user code.
    #[error("exit status {0}")]
    Exit(i32),
    #[error("{0}")]
    Custom(Arc<str>),
}

impl RuntimeError {
    pub fn fault(msg: impl Into<String>, pos: Position) -> Self {
        RuntimeError::Fault { msg: msg.into(), pos }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_error_display() {
        let err = BuildError::new(
            "index.html",
            Position::new(3, 7, 41, 44),
            "undefined: name",
        );
        assert_eq!(err.to_string(), "index.html:3:7: undefined: name");
    }

    #[test]
    fn panic_chain_display() {
        let err = PanicError {
            chain: vec![
                PanicEntry { message: "first".to_string(), recovered: true },
                PanicEntry { message: "second".to_string(), recovered: false },
            ],
        };
        assert_eq!(err.to_string(), "second\n\tpanic: first [recovered]");
    }
}
