//! Read-only source access and logical path rules.
//!
//! Templates reference each other through logical, slash-separated paths
//! rooted at the file system passed to `build`. Path validity follows the
//! same rules for `include`, `import` and `extends`.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The content format of a template file, which fixes the initial
/// rendering context of its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Text,
    Html,
    Css,
    JavaScript,
    Json,
    Markdown,
}

impl Format {
    /// Infers the format from a file extension, defaulting to `Text`.
    pub fn from_path(name: &str) -> Format {
        let ext = match name.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return Format::Text,
        };
        match ext.as_str() {
            "html" | "htm" => Format::Html,
            "css" => Format::Css,
            "js" => Format::JavaScript,
            "json" => Format::Json,
            "md" | "mkd" | "mkdn" | "mdown" | "markdown" => Format::Markdown,
            _ => Format::Text,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Format::Text => "text",
            Format::Html => "HTML",
            Format::Css => "CSS",
            Format::JavaScript => "JavaScript",
            Format::Json => "JSON",
            Format::Markdown => "Markdown",
        }
    }
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file {0:?} does not exist")]
    NotFound(String),
    #[error("invalid path {0:?}")]
    InvalidPath(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A read-only file system the builder loads template files from.
///
/// `format` may be overridden by implementations that know the content
/// format out of band; the default infers it from the extension.
pub trait Files {
    fn open(&self, name: &str) -> Result<Vec<u8>, FileError>;

    fn format(&self, name: &str) -> Format {
        Format::from_path(name)
    }
}

/// An in-memory file system, the common backing for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MapFiles {
    files: BTreeMap<String, Vec<u8>>,
}

impl MapFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> &mut Self {
        self.files.insert(name.into(), content.into());
        self
    }

    /// Builds a file system from `(name, content)` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut fs = Self::new();
        for (name, content) in pairs {
            fs.insert(name, content.as_bytes().to_vec());
        }
        fs
    }
}

impl Files for MapFiles {
    fn open(&self, name: &str) -> Result<Vec<u8>, FileError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| FileError::NotFound(name.to_string()))
    }
}

/// A file system rooted at a real directory, used by the CLI.
#[derive(Debug, Clone)]
pub struct DirFiles {
    root: PathBuf,
}

impl DirFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Files for DirFiles {
    fn open(&self, name: &str) -> Result<Vec<u8>, FileError> {
        if !is_valid_path(name) {
            return Err(FileError::InvalidPath(name.to_string()));
        }
        let mut p = self.root.clone();
        for seg in name.split('/') {
            p.push(seg);
        }
        match std::fs::read(&p) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FileError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Reports whether `path` is valid as an `extends`, `import`, `include`
/// or `show` path.
///
/// Valid: `/a.a`, `/a/a.a`, `a.a`, `a/a.a`, `../a.a`, `a/../b.a`.
/// Invalid: ``, `/`, `a`, `aa.`, `a/`, `..`, `a/..`.
pub fn is_valid_path(path: &str) -> bool {
    if path.is_empty() || path.ends_with('/') {
        return false;
    }
    let names: Vec<&str> = path.split('/').collect();
    for (i, name) in names[..names.len() - 1].iter().enumerate() {
        // An empty first name means the path starts with '/'.
        if i == 0 && name.is_empty() {
            continue;
        }
        if *name != ".." && !is_valid_dir_name(name) {
            return false;
        }
    }
    is_valid_file_name(names[names.len() - 1])
}

fn is_valid_dir_name(name: &str) -> bool {
    let runes = name.chars().count();
    if runes == 0 || runes >= 256 {
        return false;
    }
    if name == "." || name.contains("..") {
        return false;
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return false;
    }
    !is_windows_reserved(name)
}

fn is_valid_file_name(name: &str) -> bool {
    let runes = name.chars().count();
    if runes <= 2 || runes >= 256 {
        return false;
    }
    if name.starts_with('.') || name.ends_with('.') {
        return false;
    }
    // The extension must be present and contain no further dot.
    let lower = name.to_ascii_lowercase();
    let ext = match lower.rsplit_once('.') {
        Some((_, ext)) => ext,
        None => return false,
    };
    if ext.contains('.') {
        return false;
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return false;
    }
    !is_windows_reserved(&lower)
}

/// Reports whether `name` is a reserved file name on Windows, or contains
/// a character no Windows file name can contain.
fn is_windows_reserved(name: &str) -> bool {
    const DEL: char = '\x7f';
    for c in name.chars() {
        match c {
            '"' | '*' | '/' | ':' | '<' | '>' | '?' | '\\' | '|' | DEL => return true,
            _ if c <= '\x1f' => return true,
            _ => {}
        }
    }
    let base = match name.split_once('.') {
        Some((base, _)) => base,
        None => name,
    };
    matches!(
        base,
        "con" | "prn" | "aux" | "nul"
            | "com0" | "com1" | "com2" | "com3" | "com4" | "com5" | "com6" | "com7" | "com8"
            | "com9" | "lpt0" | "lpt1" | "lpt2" | "lpt3" | "lpt4" | "lpt5" | "lpt6" | "lpt7"
            | "lpt8" | "lpt9"
    )
}

/// Resolves `path` against the directory of `current`, normalizing `..`
/// segments. Returns `None` when the path is invalid or escapes the root.
pub fn resolve_path(current: &str, path: &str) -> Option<String> {
    if !is_valid_path(path) {
        return None;
    }
    let mut segs: Vec<&str> = Vec::new();
    if !path.starts_with('/') {
        if let Some((dir, _)) = current.rsplit_once('/') {
            segs.extend(dir.split('/'));
        }
    }
    for seg in path.split('/') {
        match seg {
            "" => {} // leading '/'
            ".." => {
                if segs.pop().is_none() {
                    return None;
                }
            }
            _ => segs.push(seg),
        }
    }
    Some(segs.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_paths() {
        for p in ["/a.a", "/a/a.a", "a.a", "a/a.a", "../a.a", "a/../a.a", "index.html"] {
            assert!(is_valid_path(p), "{p:?} should be valid");
        }
    }

    #[test]
    fn invalid_paths() {
        for p in ["", "/", "a", "aa", "aa.", "a/", "..", "a/..", ".a.", "a.html/"] {
            assert!(!is_valid_path(p), "{p:?} should be invalid");
        }
    }

    #[test]
    fn windows_reserved_names() {
        for p in ["con.html", "aux.css", "lpt7.js", "nul.md"] {
            assert!(!is_valid_path(p), "{p:?} should be rejected");
        }
        assert!(is_valid_path("conn.html"));
        assert!(is_valid_path("console.html"));
    }

    #[test]
    fn forbidden_characters() {
        for p in ["a:b.html", "a*.html", "a?.html", "a|b.html", "a\u{1f}b.html"] {
            assert!(!is_valid_path(p), "{p:?} should be rejected");
        }
    }

    #[test]
    fn resolve_relative() {
        assert_eq!(resolve_path("sub/page.html", "part.html").unwrap(), "sub/part.html");
        assert_eq!(resolve_path("sub/page.html", "../top.html").unwrap(), "top.html");
        assert_eq!(resolve_path("page.html", "sub/x.html").unwrap(), "sub/x.html");
        assert_eq!(resolve_path("sub/page.html", "/abs.html").unwrap(), "abs.html");
        assert!(resolve_path("page.html", "../esc.html").is_none());
    }

    #[test]
    fn format_inference() {
        assert_eq!(Format::from_path("a.html"), Format::Html);
        assert_eq!(Format::from_path("a.htm"), Format::Html);
        assert_eq!(Format::from_path("a.css"), Format::Css);
        assert_eq!(Format::from_path("a.js"), Format::JavaScript);
        assert_eq!(Format::from_path("a.json"), Format::Json);
        assert_eq!(Format::from_path("a.md"), Format::Markdown);
        assert_eq!(Format::from_path("a.txt"), Format::Text);
        assert_eq!(Format::from_path("noext"), Format::Text);
    }
}
