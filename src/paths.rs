//! Source identity: turning what the host reports into a stable file key,
//! deciding whether that file is tracked, and reading its text.
//!
//! Also provides a [`SourceProvider`] trait that abstracts over where
//! source text comes from (the filesystem, or memory in tests and
//! embedders).

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::config::Config;
use crate::error::{CoverageError, Result};

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Resolve a host source identifier (`@path`, `=name`, or an inline chunk)
/// to a normalized absolute path.
pub fn resolve_source(raw: &str, root: &Path) -> Result<String> {
    if let Some(path) = raw.strip_prefix('@') {
        if path.is_empty() {
            return Err(CoverageError::PathResolution {
                source_id: raw.to_string(),
                message: "empty file name".to_string(),
            });
        }
        return Ok(normalize_path(path, root));
    }
    let message = if raw.starts_with('=') {
        "named chunk has no file"
    } else {
        "inline chunk has no file"
    };
    Err(CoverageError::PathResolution {
        source_id: truncate(raw),
        message: message.to_string(),
    })
}

/// Make `path` absolute against `root` and fold `.` and `..` without
/// touching the filesystem. Separators are always `/`.
pub fn normalize_path(path: &str, root: &Path) -> String {
    let path = path.replace('\\', "/");
    let joined: PathBuf = if Path::new(&path).is_absolute() {
        PathBuf::from(&path)
    } else {
        root.join(&path)
    };

    let mut parts: Vec<String> = Vec::new();
    let mut prefix = String::new();
    for component in joined.components() {
        match component {
            Component::Prefix(p) => prefix = p.as_os_str().to_string_lossy().replace('\\', "/"),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
        }
    }
    format!("{prefix}/{}", parts.join("/"))
}

fn truncate(raw: &str) -> String {
    const MAX: usize = 40;
    match raw.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

/// Compile path or module globs into one set. `*` and `?` stay within a
/// path segment; `**` crosses segments.
pub fn compile_globs<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern.as_ref())
            .literal_separator(true)
            .build()?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Include/exclude decision per normalized path, decided once and cached.
#[derive(Debug)]
pub struct PathFilter {
    root: String,
    include: GlobSet,
    exclude: GlobSet,
    decided: HashMap<String, bool>,
}

impl PathFilter {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            root: normalize_path(".", &config.root),
            include: compile_globs(&config.include)?,
            exclude: compile_globs(&config.exclude)?,
            decided: HashMap::new(),
        })
    }

    /// Patterns are tried against the absolute path and against the path
    /// relative to the configured root.
    pub fn is_tracked(&mut self, path: &str) -> bool {
        if let Some(decision) = self.decided.get(path) {
            return *decision;
        }
        let relative = path
            .strip_prefix(self.root.trim_end_matches('/'))
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty());
        let matches = |set: &GlobSet| set.is_match(path) || relative.is_some_and(|r| set.is_match(r));

        let included = self.include.is_empty() || matches(&self.include);
        let decision = included && !matches(&self.exclude);
        self.decided.insert(path.to_string(), decision);
        decision
    }

    pub fn cached_decisions(&self) -> usize {
        self.decided.len()
    }
}

// ---------------------------------------------------------------------------
// Source providers
// ---------------------------------------------------------------------------

/// Where source text comes from.
pub trait SourceProvider {
    /// Read the full text of a normalized path.
    fn read_source(&self, path: &str) -> Result<String>;

    /// Cheap existence check that never runs a module loader.
    fn exists(&self, path: &str) -> bool;
}

/// Source from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSource;

impl SourceProvider for FsSource {
    fn read_source(&self, path: &str) -> Result<String> {
        Ok(std::fs::read_to_string(path)?)
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }
}

/// Source held in memory, keyed by normalized path.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    files: HashMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_file(mut self, path: &str, text: &str) -> Self {
        self.insert(path, text);
        self
    }

    pub fn insert(&mut self, path: &str, text: &str) {
        self.files.insert(path.to_string(), text.to_string());
    }

    pub fn remove(&mut self, path: &str) -> Option<String> {
        self.files.remove(path)
    }
}

impl SourceProvider for MemorySource {
    fn read_source(&self, path: &str) -> Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            CoverageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{path} not found"),
            ))
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}
