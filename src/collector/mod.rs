//! The two collection strategies behind one interface.
//!
//! A [`Collector`] receives [`HostEvent`]s and writes hits into the
//! [`CoverageStore`] through a [`Context`]. The session never looks at which
//! strategy is active; it only forwards events and calls `start`/`stop`.

mod instrumented;
mod trace;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analyzer::{Analysis, Analyzer};
use crate::config::Config;
use crate::error::Result;
use crate::instrument::loader::Interception;
use crate::model::{BlockId, CoverageQuality};
use crate::paths::{normalize_path, resolve_source, PathFilter, SourceProvider};
use crate::store::CoverageStore;

pub use instrumented::InstrumentingCollector;
pub use trace::TraceCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Observe the interpreter's line and call hooks.
    #[default]
    Trace,
    /// Rewrite sources so they report their own execution.
    Instrument,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Strategy::Trace),
            "instrument" | "instrumentation" => Ok(Strategy::Instrument),
            _ => Err(format!("Unknown strategy: {s}")),
        }
    }
}

/// Interpreter hooks the host must install for a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HookMask {
    pub line: bool,
    pub call: bool,
}

impl HookMask {
    pub const NONE: HookMask = HookMask { line: false, call: false };
    pub const LINE_AND_CALL: HookMask = HookMask { line: true, call: true };

    pub fn is_empty(&self) -> bool {
        !self.line && !self.call
    }
}

/// Something the host reports while the program runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent<'a> {
    /// Line hook. `source` is the raw chunk identifier (`@path`, `=name`,
    /// or the chunk text itself).
    Line { source: &'a str, line: u32 },
    /// Call hook. `line_defined` is where the called function starts; 0 for
    /// a main chunk.
    Call { source: &'a str, line_defined: u32 },
    /// `tracker.hit(file, line, block)` from instrumented code. `block` is
    /// the block the statement runs in, [`BlockId::ROOT`] at top level.
    Hit { file: &'a str, line: u32, block: BlockId },
    /// `tracker.enter(file, line)` from instrumented code.
    Enter { file: &'a str, line: u32 },
}

/// What happened to the events a collector has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounters {
    pub recorded: u64,
    /// Events for untracked files or non-executable lines.
    pub ignored: u64,
    /// Events that could not be attributed to a file.
    pub skipped: u64,
}

/// Everything a collector may touch while handling an event.
pub struct Context<'a> {
    pub store: &'a mut CoverageStore,
    pub files: &'a mut FileTable,
    pub source: &'a dyn SourceProvider,
}

pub trait Collector {
    fn strategy(&self) -> Strategy;

    /// Reset per-run state. Returns the hooks the host must install.
    fn start(&mut self, ctx: &mut Context<'_>) -> HookMask;

    /// Handle one event. Errors are contained to the event by the caller.
    fn on_event(&mut self, ctx: &mut Context<'_>, event: HostEvent<'_>) -> Result<()>;

    fn stop(&mut self, ctx: &mut Context<'_>);

    /// Map a line reported by the running program back to the original
    /// source. `None` means the location cannot be trusted.
    fn translate(&self, file: &str, line: u32) -> Option<u32>;

    /// Answer a module load. `None` leaves loading to the host.
    fn intercept_module(&mut self, _ctx: &mut Context<'_>, _module: &str) -> Option<Interception> {
        None
    }

    /// Answer the host running a file directly.
    fn intercept_file(&mut self, _ctx: &mut Context<'_>, _path: &str) -> Option<Interception> {
        None
    }

    fn counters(&self) -> EventCounters;
}

/// Build the collector for a strategy.
pub fn for_strategy(strategy: Strategy, config: &Config) -> Result<Box<dyn Collector>> {
    Ok(match strategy {
        Strategy::Trace => Box::new(TraceCollector::new()),
        Strategy::Instrument => Box::new(InstrumentingCollector::new(config)?),
    })
}

// ---------------------------------------------------------------------------
// File table
// ---------------------------------------------------------------------------

/// Per-run knowledge about files: raw identifier resolution, filter
/// decisions and analyses. Each is computed once per file.
pub struct FileTable {
    root: PathBuf,
    analyzer: Analyzer,
    filter: PathFilter,
    resolved: HashMap<String, Option<String>>,
    tracked: HashMap<String, bool>,
    analyses: HashMap<String, Analysis>,
}

impl FileTable {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            root: config.root.clone(),
            analyzer: Analyzer::new(config),
            filter: PathFilter::new(config)?,
            resolved: HashMap::new(),
            tracked: HashMap::new(),
            analyses: HashMap::new(),
        })
    }

    pub fn reset(&mut self) {
        self.resolved.clear();
        self.tracked.clear();
        self.analyses.clear();
    }

    pub fn analyzer_mut(&mut self) -> &mut Analyzer {
        &mut self.analyzer
    }

    pub fn analysis(&self, path: &str) -> Option<&Analysis> {
        self.analyses.get(path)
    }

    /// Resolve a raw chunk identifier. Failures are cached as well, so a
    /// bad identifier costs one log line per run.
    pub fn resolve(&mut self, raw: &str) -> Option<String> {
        if let Some(hit) = self.resolved.get(raw) {
            return hit.clone();
        }
        let resolved = match resolve_source(raw, &self.root) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(phase = e.phase(), "{e}; events from this chunk are skipped");
                None
            }
        };
        self.resolved.insert(raw.to_string(), resolved.clone());
        resolved
    }

    /// Accept either a raw identifier or a plain path, as found in
    /// assertion stack frames.
    pub fn resolve_frame(&mut self, file: &str) -> Option<String> {
        if file.starts_with('@') || file.starts_with('=') {
            self.resolve(file)
        } else {
            Some(normalize_path(file, &self.root))
        }
    }

    /// Decide (once) whether `path` is tracked, registering it with the
    /// store on first sight.
    pub fn track(&mut self, store: &mut CoverageStore, source: &dyn SourceProvider, path: &str) -> bool {
        if let Some(decision) = self.tracked.get(path) {
            return *decision;
        }
        let decision = self.first_sight(store, source, path);
        self.tracked.insert(path.to_string(), decision);
        decision
    }

    fn first_sight(&mut self, store: &mut CoverageStore, source: &dyn SourceProvider, path: &str) -> bool {
        if !self.filter.is_tracked(path) {
            store.discover(path);
            return false;
        }
        match source.read_source(path) {
            Ok(text) => {
                let analysis = self.analyzer.analyze(&text, path);
                self.adopt(store, path, &text, analysis);
            }
            Err(e) => {
                warn!(file = path, error = %e, "source unavailable; recording hits without analysis");
                store.register_unanalyzed(path);
            }
        }
        true
    }

    /// Register a file whose analysis was computed elsewhere.
    pub fn adopt(&mut self, store: &mut CoverageStore, path: &str, text: &str, analysis: Analysis) {
        store.register_file(path, text, &analysis);
        self.tracked.insert(path.to_string(), true);
        self.analyses.insert(path.to_string(), analysis);
    }

    /// Record a file that is known but not tracked, e.g. because its
    /// instrumentation failed.
    pub fn untrack(&mut self, store: &mut CoverageStore, path: &str) {
        store.discover(path);
        store.set_quality(path, CoverageQuality::Untracked);
        self.tracked.insert(path.to_string(), false);
    }

    /// Analyze a file that has no analysis yet (its source was unavailable
    /// on first sight). Returns whether an analysis now exists.
    pub fn retry_analysis(&mut self, store: &mut CoverageStore, source: &dyn SourceProvider, path: &str) -> bool {
        if self.analyses.contains_key(path) {
            return true;
        }
        match source.read_source(path) {
            Ok(text) => {
                let analysis = self.analyzer.analyze(&text, path);
                self.adopt(store, path, &text, analysis);
                true
            }
            Err(_) => false,
        }
    }
}
