//! Module-load interception.
//!
//! The host hands every `require(name)` to [`ModuleLoader::load`], which
//! answers with instrumented text, the original text, or "not found".
//! Guards, checked in this order for each resolved file:
//!
//!   1. the engine's own modules, configured module patterns and files
//!      outside the include/exclude globs are never touched
//!   2. a file already being instrumented is passed through unchanged
//!   3. a cached transform for the same content is reused
//!   4. nesting deeper than `max_load_depth` aborts that file's
//!      instrumentation with `RecursionLimitExceeded`
//!
//! Resolution only ever asks the [`SourceProvider`] whether a candidate file
//! exists; it never goes through the host's loader.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use globset::GlobSet;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::cache::DiskCache;
use super::{instrument_analyzed, InstrumentOptions, Instrumented};
use crate::analyzer::{Analysis, Analyzer};
use crate::config::Config;
use crate::error::{CoverageError, Result};
use crate::paths::{compile_globs, normalize_path, PathFilter, SourceProvider};

/// Module patterns that are never instrumented.
pub const CORE_MODULES: &[&str] = &["covlua", "covlua.*"];

/// A successfully instrumented file.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub module: String,
    pub path: String,
    pub content_hash: String,
    pub source: String,
    pub instrumented: Instrumented,
    pub analysis: Analysis,
}

/// Why a file is served without instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Passthrough {
    Excluded,
    /// Asked for while its own instrumentation was still running.
    Reentrant,
    DepthLimit,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Interception {
    Instrumented(Box<LoadedModule>),
    Original {
        module: String,
        path: String,
        source: String,
        reason: Passthrough,
    },
    NotFound {
        module: String,
        searched: Vec<String>,
    },
}

impl Interception {
    pub fn path(&self) -> Option<&str> {
        match self {
            Interception::Instrumented(m) => Some(&m.path),
            Interception::Original { path, .. } => Some(path),
            Interception::NotFound { .. } => None,
        }
    }

    /// Text the host should execute.
    pub fn text(&self) -> Option<&str> {
        match self {
            Interception::Instrumented(m) => Some(&m.instrumented.text),
            Interception::Original { source, .. } => Some(source),
            Interception::NotFound { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    pub transforms: u64,
    pub cache_hits: u64,
    pub disk_hits: u64,
    pub reentrant_skips: u64,
    pub depth_aborts: u64,
    pub failures: u64,
}

pub struct ModuleLoader {
    root: PathBuf,
    templates: Vec<String>,
    excluded: GlobSet,
    filter: PathFilter,
    max_depth: usize,
    eager: bool,
    options: InstrumentOptions,
    resolved: HashMap<String, Option<String>>,
    in_progress: Vec<String>,
    aborted: HashSet<String>,
    cache: HashMap<(String, String), LoadedModule>,
    disk: Option<DiskCache>,
    stats: LoaderStats,
}

impl ModuleLoader {
    pub fn new(config: &Config) -> Result<Self> {
        let patterns: Vec<&str> = CORE_MODULES
            .iter()
            .copied()
            .chain(config.excluded_modules.iter().map(String::as_str))
            .collect();
        let excluded = compile_globs(&patterns)?;

        let disk = match &config.cache_path {
            Some(path) => match DiskCache::open(path) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "instrumentation cache unavailable");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            root: config.root.clone(),
            templates: config
                .module_path
                .split(';')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            excluded,
            filter: PathFilter::new(config)?,
            max_depth: config.max_load_depth,
            eager: config.eager_requires,
            options: InstrumentOptions::from_config(config),
            resolved: HashMap::new(),
            in_progress: Vec::new(),
            aborted: HashSet::new(),
            cache: HashMap::new(),
            disk,
            stats: LoaderStats::default(),
        })
    }

    #[must_use]
    pub fn with_disk_cache(mut self, cache: DiskCache) -> Self {
        self.disk = Some(cache);
        self
    }

    pub fn options(&self) -> &InstrumentOptions {
        &self.options
    }

    pub fn stats(&self) -> LoaderStats {
        self.stats
    }

    /// Number of files currently being instrumented.
    pub fn depth(&self) -> usize {
        self.in_progress.len()
    }

    pub fn is_excluded(&self, module: &str) -> bool {
        self.excluded.is_match(module)
    }

    /// Candidate file paths for `module`, in search order.
    pub fn candidates(&self, module: &str) -> Vec<String> {
        let name = module.replace('.', "/");
        self.templates
            .iter()
            .map(|t| normalize_path(&t.replace('?', &name), &self.root))
            .collect()
    }

    /// First existing candidate for `module`. Cached per module name.
    pub fn resolve(&mut self, module: &str, source: &dyn SourceProvider) -> Option<String> {
        if let Some(hit) = self.resolved.get(module) {
            return hit.clone();
        }
        let found = self.candidates(module).into_iter().find(|c| source.exists(c));
        self.resolved.insert(module.to_string(), found.clone());
        found
    }

    /// Forget cached resolutions, e.g. after files were added.
    pub fn clear_resolutions(&mut self) {
        self.resolved.clear();
    }

    /// Intercept `require(module)`.
    pub fn load(&mut self, module: &str, source: &dyn SourceProvider, analyzer: &mut Analyzer) -> Interception {
        let Some(path) = self.resolve(module, source) else {
            return Interception::NotFound {
                module: module.to_string(),
                searched: self.candidates(module),
            };
        };
        self.load_resolved(module, &path, source, analyzer)
    }

    /// Instrument a file the host runs directly (the entry script).
    pub fn load_file(&mut self, path: &str, source: &dyn SourceProvider, analyzer: &mut Analyzer) -> Interception {
        let path = normalize_path(path, &self.root);
        self.load_resolved(&path, &path, source, analyzer)
    }

    fn load_resolved(
        &mut self,
        module: &str,
        path: &str,
        source: &dyn SourceProvider,
        analyzer: &mut Analyzer,
    ) -> Interception {
        let text = match source.read_source(path) {
            Ok(text) => text,
            Err(e) => {
                debug!(module, file = path, error = %e, "module vanished before it could be read");
                return Interception::NotFound {
                    module: module.to_string(),
                    searched: vec![path.to_string()],
                };
            }
        };

        if self.is_excluded(module) || !self.filter.is_tracked(path) {
            return Interception::Original {
                module: module.to_string(),
                path: path.to_string(),
                source: text,
                reason: Passthrough::Excluded,
            };
        }

        match self.instrument_guarded(module, path, &text, source, analyzer) {
            Ok(loaded) => Interception::Instrumented(Box::new(loaded)),
            Err(reason) => Interception::Original {
                module: module.to_string(),
                path: path.to_string(),
                source: text,
                reason,
            },
        }
    }

    fn instrument_guarded(
        &mut self,
        module: &str,
        path: &str,
        text: &str,
        source: &dyn SourceProvider,
        analyzer: &mut Analyzer,
    ) -> std::result::Result<LoadedModule, Passthrough> {
        if self.aborted.contains(path) {
            return Err(Passthrough::DepthLimit);
        }
        if self.in_progress.iter().any(|p| p == path) {
            self.stats.reentrant_skips += 1;
            debug!(module, file = path, "re-entrant load served uninstrumented");
            return Err(Passthrough::Reentrant);
        }

        let hash = content_hash(text);
        let key = (path.to_string(), hash);
        if let Some(hit) = self.cache.get(&key) {
            self.stats.cache_hits += 1;
            return Ok(hit.clone());
        }

        if self.in_progress.len() >= self.max_depth {
            let err = CoverageError::RecursionLimitExceeded {
                module: module.to_string(),
                depth: self.in_progress.len(),
            };
            warn!(module, file = path, phase = err.phase(), "{err}; module runs uninstrumented");
            self.aborted.insert(path.to_string());
            self.stats.depth_aborts += 1;
            return Err(Passthrough::DepthLimit);
        }

        self.in_progress.push(path.to_string());
        let result = self.transform(module, path, text, &key.1, source, analyzer);
        self.in_progress.pop();

        match result {
            Ok(loaded) => {
                // One entry per file: a new content hash replaces the old one.
                self.cache.retain(|(p, _), _| p != path);
                self.cache.insert(key, loaded.clone());
                Ok(loaded)
            }
            Err(e) => {
                self.stats.failures += 1;
                warn!(module, file = path, phase = e.phase(), "{e}; module runs uninstrumented");
                Err(Passthrough::Failed)
            }
        }
    }

    fn transform(
        &mut self,
        module: &str,
        path: &str,
        text: &str,
        hash: &str,
        source: &dyn SourceProvider,
        analyzer: &mut Analyzer,
    ) -> Result<LoadedModule> {
        let analysis = analyzer.analyze(text, path);

        if self.eager {
            for dep in &analysis.requires {
                if self.is_excluded(dep) {
                    continue;
                }
                let Some(dep_path) = self.resolve(dep, source) else {
                    continue;
                };
                if !self.filter.is_tracked(&dep_path) {
                    continue;
                }
                match source.read_source(&dep_path) {
                    Ok(dep_text) => {
                        // Outcome is cached or logged; nothing to do with it here.
                        let _ = self.instrument_guarded(dep, &dep_path, &dep_text, source, analyzer);
                    }
                    Err(e) => debug!(module = %dep, file = %dep_path, error = %e, "skipping eager load"),
                }
            }
        }

        let tracker = self.options.tracker_name.clone();
        let cached = self
            .disk
            .as_ref()
            .and_then(|disk| match disk.get(path, hash, &tracker) {
                Ok(hit) => hit,
                Err(e) => {
                    debug!(file = path, error = %e, "instrumentation cache read failed");
                    None
                }
            });

        let instrumented = match cached {
            Some(hit) => {
                self.stats.disk_hits += 1;
                hit.instrumented
            }
            None => {
                let out = instrument_analyzed(text, path, &analysis, &self.options)?;
                self.stats.transforms += 1;
                if let Some(disk) = self.disk.as_mut() {
                    if let Err(e) = disk.put(path, hash, &tracker, &out) {
                        debug!(file = path, error = %e, "instrumentation cache write failed");
                    }
                }
                out
            }
        };

        Ok(LoadedModule {
            module: module.to_string(),
            path: path.to_string(),
            content_hash: hash.to_string(),
            source: text.to_string(),
            instrumented,
            analysis,
        })
    }

    /// Every cached module, including ones instrumented eagerly.
    pub fn modules(&self) -> impl Iterator<Item = &LoadedModule> {
        self.cache.values()
    }

    pub fn cached(&self, path: &str) -> Option<&LoadedModule> {
        self.cache.iter().find(|((p, _), _)| p == path).map(|(_, m)| m)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Files whose instrumentation was aborted by the depth ceiling.
    pub fn aborted(&self) -> impl Iterator<Item = &str> {
        self.aborted.iter().map(String::as_str)
    }
}

/// Hex sha256 of the source text.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::MemorySource;

    fn setup(files: &[(&str, &str)]) -> (ModuleLoader, MemorySource, Analyzer) {
        let config = Config::default().with_root("/p");
        let mut src = MemorySource::new();
        for (path, text) in files {
            src.insert(path, text);
        }
        (ModuleLoader::new(&config).unwrap(), src, Analyzer::new(&config))
    }

    #[test]
    fn test_resolve_templates() {
        let (mut loader, src, _) = setup(&[("/p/a/b.lua", "return 1\n"), ("/p/pkg/init.lua", "return 2\n")]);
        assert_eq!(loader.resolve("a.b", &src).as_deref(), Some("/p/a/b.lua"));
        assert_eq!(loader.resolve("pkg", &src).as_deref(), Some("/p/pkg/init.lua"));
        assert_eq!(loader.resolve("missing", &src), None);
    }

    #[test]
    fn test_core_modules_excluded() {
        let (mut loader, src, mut analyzer) = setup(&[("/p/covlua/tracker.lua", "return {}\n")]);
        assert!(loader.is_excluded("covlua"));
        assert!(loader.is_excluded("covlua.tracker"));
        match loader.load("covlua.tracker", &src, &mut analyzer) {
            Interception::Original { reason, .. } => assert_eq!(reason, Passthrough::Excluded),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(loader.cache_len(), 0);
    }

    #[test]
    fn test_path_filter_applies() {
        let config = Config::default().with_root("/p").with_exclude("vendor/**");
        let src = MemorySource::new().with_file("/p/vendor/json.lua", "return {}\n");
        let mut loader = ModuleLoader::new(&config).unwrap();
        let mut analyzer = Analyzer::new(&config);
        match loader.load("vendor.json", &src, &mut analyzer) {
            Interception::Original { reason, .. } => assert_eq!(reason, Passthrough::Excluded),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_repeat_load_hits_cache() {
        let (mut loader, src, mut analyzer) = setup(&[("/p/m.lua", "local x = 1\nreturn x\n")]);
        assert!(matches!(loader.load("m", &src, &mut analyzer), Interception::Instrumented(_)));
        assert!(matches!(loader.load("m", &src, &mut analyzer), Interception::Instrumented(_)));
        assert_eq!(loader.stats().transforms, 1);
        assert_eq!(loader.stats().cache_hits, 1);
        assert_eq!(loader.cache_len(), 1);
    }

    #[test]
    fn test_changed_content_replaces_entry() {
        let (mut loader, mut src, mut analyzer) = setup(&[("/p/m.lua", "return 1\n")]);
        loader.load("m", &src, &mut analyzer);
        src.insert("/p/m.lua", "local y = 2\nreturn y\n");
        loader.load("m", &src, &mut analyzer);
        assert_eq!(loader.cache_len(), 1);
        assert_eq!(loader.stats().transforms, 2);
    }

    #[test]
    fn test_not_found_lists_candidates() {
        let (mut loader, src, mut analyzer) = setup(&[]);
        match loader.load("x.y", &src, &mut analyzer) {
            Interception::NotFound { searched, .. } => {
                assert_eq!(searched, vec!["/p/x/y.lua".to_string(), "/p/x/y/init.lua".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_module_passes_through() {
        let (mut loader, src, mut analyzer) = setup(&[("/p/bad.lua", "local = = 1\n")]);
        match loader.load("bad", &src, &mut analyzer) {
            Interception::Original { reason, source, .. } => {
                assert_eq!(reason, Passthrough::Failed);
                assert_eq!(source, "local = = 1\n");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(loader.stats().failures, 1);
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("").len(), 64);
    }
}
