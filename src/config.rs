//! Engine configuration.
//!
//! Every field has a default, so a partial JSON document is enough to
//! override a single setting. Where the values come from (flags, files,
//! environment) is up to the embedding test runner.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How lines holding nothing but block keywords (`end`, `else`, `do`, ...)
/// are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralPolicy {
    /// Structural lines never count towards coverage.
    #[default]
    NonExecutable,
    /// Structural lines are executable like any statement.
    Executable,
}

impl StructuralPolicy {
    #[must_use]
    pub fn is_executable(self) -> bool {
        matches!(self, StructuralPolicy::Executable)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory relative source identifiers are resolved against.
    pub root: PathBuf,
    /// Glob patterns a file must match to be tracked (empty = everything).
    pub include: Vec<String>,
    /// Glob patterns that exclude a file from tracking.
    pub exclude: Vec<String>,
    pub structural_keywords: StructuralPolicy,
    /// Parser budget per file before the lexical fallback takes over.
    pub parse_timeout_micros: u64,
    /// Files larger than this skip the parser entirely.
    pub max_file_bytes: usize,
    /// Ceiling on nested module loads during interception.
    pub max_load_depth: usize,
    /// `package.path` style search templates, separated by `;`.
    pub module_path: String,
    /// Global name of the tracking primitive injected by instrumentation.
    pub tracker_name: String,
    /// Module name patterns never instrumented, on top of the engine's own.
    pub excluded_modules: Vec<String>,
    /// Optional SQLite file caching instrumented sources across runs.
    pub cache_path: Option<PathBuf>,
    /// Instrument statically required modules while loading their requirer.
    pub eager_requires: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            include: Vec::new(),
            exclude: Vec::new(),
            structural_keywords: StructuralPolicy::default(),
            parse_timeout_micros: 2_000_000,
            max_file_bytes: 4 * 1024 * 1024,
            max_load_depth: 64,
            module_path: "?.lua;?/init.lua".to_string(),
            tracker_name: "__covlua".to_string(),
            excluded_modules: Vec::new(),
            cache_path: None,
            eager_requires: true,
        }
    }
}

impl Config {
    /// Parse a (possibly partial) JSON configuration document.
    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    #[must_use]
    pub fn with_include(mut self, pattern: &str) -> Self {
        self.include.push(pattern.to_string());
        self
    }

    #[must_use]
    pub fn with_exclude(mut self, pattern: &str) -> Self {
        self.exclude.push(pattern.to_string());
        self
    }

    #[must_use]
    pub fn with_structural_policy(mut self, policy: StructuralPolicy) -> Self {
        self.structural_keywords = policy;
        self
    }

    #[must_use]
    pub fn with_max_load_depth(mut self, depth: usize) -> Self {
        self.max_load_depth = depth;
        self
    }

    #[must_use]
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{"structural_keywords": "executable"}"#).unwrap();
        assert_eq!(config.structural_keywords, StructuralPolicy::Executable);
        assert_eq!(config.max_load_depth, 64);
        assert_eq!(config.tracker_name, "__covlua");
        assert!(config.eager_requires);
    }

    #[test]
    fn test_default_structural_policy_is_non_executable() {
        assert!(!Config::default().structural_keywords.is_executable());
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        assert!(Config::from_json(r#"{"structural_keywords": "sometimes"}"#).is_err());
    }
}
