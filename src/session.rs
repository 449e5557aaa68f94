//! A coverage session: the explicitly owned store plus the active collector,
//! with the start/stop lifecycle the test runner drives.
//!
//! ```no_run
//! use covlua::{Config, HostEvent, Session, Strategy};
//!
//! let mut session = Session::new(Config::default(), Strategy::Trace)?;
//! let hooks = session.start();
//! assert!(hooks.line);
//! session.on_event(HostEvent::Line { source: "@src/main.lua", line: 1 });
//! let report = session.stop();
//! println!("{} files, {} lines reclassified", report.files, report.reclassified);
//! # Ok::<(), covlua::CoverageError>(())
//! ```

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collector::{self, Collector, Context, EventCounters, FileTable, HookMask, HostEvent, Strategy};
use crate::config::Config;
use crate::error::{CoverageError, Result};
use crate::instrument::loader::Interception;
use crate::linkage::{link_assertion, Frame, LinkReport};
use crate::patchup::reclassify;
use crate::paths::{FsSource, SourceProvider};
use crate::store::CoverageStore;

/// What `stop` did to finalize the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub files: usize,
    pub relationships_fixed: usize,
    pub pending_resolved: usize,
    pub orphans_reattached: usize,
    /// Lines changed by the classification pass.
    pub reclassified: usize,
    /// Lines still breaking the invariant after the classification pass.
    pub invariant_repairs: usize,
    pub events: EventCounters,
}

pub struct Session {
    config: Config,
    store: CoverageStore,
    files: FileTable,
    collector: Box<dyn Collector>,
    source: Box<dyn SourceProvider>,
    running: bool,
}

impl Session {
    /// Session reading sources from the filesystem.
    pub fn new(config: Config, strategy: Strategy) -> Result<Self> {
        Self::with_source(config, strategy, Box::new(FsSource))
    }

    pub fn with_source(config: Config, strategy: Strategy, source: Box<dyn SourceProvider>) -> Result<Self> {
        let collector = collector::for_strategy(strategy, &config)?;
        Self::with_collector(config, collector, source)
    }

    pub fn with_collector(
        config: Config,
        collector: Box<dyn Collector>,
        source: Box<dyn SourceProvider>,
    ) -> Result<Self> {
        if !config.root.is_absolute() {
            return Err(CoverageError::StoreInit(format!(
                "root '{}' must be an absolute path",
                config.root.display()
            )));
        }
        let files = FileTable::new(&config)?;
        Ok(Self {
            config,
            store: CoverageStore::new(),
            files,
            collector,
            source,
            running: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn strategy(&self) -> Strategy {
        self.collector.strategy()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Read-only view of the collected data.
    pub fn store(&self) -> &CoverageStore {
        &self.store
    }

    pub fn into_store(self) -> CoverageStore {
        self.store
    }

    /// Begin a run: clears any previous data. Returns the hooks the host
    /// must install.
    pub fn start(&mut self) -> HookMask {
        self.store.reset();
        self.files.reset();
        self.running = true;
        let hooks = self.collector.start(&mut Context {
            store: &mut self.store,
            files: &mut self.files,
            source: self.source.as_ref(),
        });
        info!(strategy = ?self.collector.strategy(), "coverage started");
        hooks
    }

    /// Feed one host event. Ignored while stopped; failures are logged and
    /// contained to the event.
    pub fn on_event(&mut self, event: HostEvent<'_>) {
        if !self.running {
            return;
        }
        let result = self.collector.on_event(
            &mut Context {
                store: &mut self.store,
                files: &mut self.files,
                source: self.source.as_ref(),
            },
            event,
        );
        if let Err(e) = result {
            debug!(phase = e.phase(), "event skipped: {e}");
        }
    }

    /// Answer `require(module)`. `None` means the active strategy does not
    /// intercept loading.
    pub fn intercept_module(&mut self, module: &str) -> Option<Interception> {
        self.collector.intercept_module(
            &mut Context {
                store: &mut self.store,
                files: &mut self.files,
                source: self.source.as_ref(),
            },
            module,
        )
    }

    /// Answer the host running a file directly.
    pub fn intercept_file(&mut self, path: &str) -> Option<Interception> {
        self.collector.intercept_file(
            &mut Context {
                store: &mut self.store,
                files: &mut self.files,
                source: self.source.as_ref(),
            },
            path,
        )
    }

    /// Promote the executed lines of an assertion's stack to covered.
    pub fn on_assertion(&mut self, frames: &[Frame]) -> LinkReport {
        let files = &mut self.files;
        let collector = &self.collector;
        link_assertion(&mut self.store, frames, |frame| {
            let path = files.resolve_frame(&frame.file)?;
            let line = collector.translate(&path, frame.line)?;
            Some((path, line))
        })
    }

    /// End the run and finalize the store: resolve block relationships,
    /// settle provisional lines and strip marks from non-executable lines.
    pub fn stop(&mut self) -> StopReport {
        let mut ctx = Context {
            store: &mut self.store,
            files: &mut self.files,
            source: self.source.as_ref(),
        };
        self.collector.stop(&mut ctx);
        self.running = false;

        let mut report = StopReport {
            events: self.collector.counters(),
            ..StopReport::default()
        };

        let paths = self.store.paths();
        for path in &paths {
            let needs_analysis = self
                .store
                .file(path)
                .is_some_and(|f| f.is_active() && f.has_provisional_lines());
            if needs_analysis
                && !self
                    .files
                    .retry_analysis(&mut self.store, self.source.as_ref(), path)
            {
                warn!(file = %path, "no analysis available; hits kept as observed");
            }
        }

        let fixes = self.store.fix_relationships();
        report.relationships_fixed = fixes.relationships_fixed;
        report.pending_resolved = fixes.pending_resolved;
        report.orphans_reattached = fixes.orphans_reattached;

        for path in &paths {
            let (Some(analysis), Some(file)) = (self.files.analysis(path), self.store.file_mut(path)) else {
                continue;
            };
            report.reclassified += reclassify(file, analysis);
        }

        for violation in self.store.check_invariants() {
            warn!(
                file = %violation.path,
                line = violation.line,
                problem = ?violation.problem,
                "coverage invariant broken after classification; repairing"
            );
        }
        report.invariant_repairs = self.store.enforce_invariants();
        report.files = self.store.len();

        info!(
            files = report.files,
            reclassified = report.reclassified,
            relationships_fixed = report.relationships_fixed,
            "coverage stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockId;
    use crate::paths::MemorySource;

    fn session(strategy: Strategy) -> Session {
        let src = MemorySource::new().with_file("/p/a.lua", "local x = 1\nprint(x)\n");
        Session::with_source(Config::default().with_root("/p"), strategy, Box::new(src)).unwrap()
    }

    #[test]
    fn test_relative_root_is_fatal() {
        let err = Session::new(Config::default().with_root("rel"), Strategy::Trace).err().unwrap();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_events_ignored_when_stopped() {
        let mut s = session(Strategy::Trace);
        s.on_event(HostEvent::Line { source: "@a.lua", line: 1 });
        assert!(s.store().is_empty());
    }

    #[test]
    fn test_start_resets_previous_run() {
        let mut s = session(Strategy::Trace);
        s.start();
        s.on_event(HostEvent::Line { source: "@a.lua", line: 1 });
        s.stop();
        assert_eq!(s.store().summary().executed_lines, 1);
        s.start();
        assert!(s.store().is_empty());
    }

    #[test]
    fn test_trace_does_not_intercept() {
        let mut s = session(Strategy::Trace);
        assert!(s.intercept_module("a").is_none());
        assert!(!s.start().is_empty());
    }

    #[test]
    fn test_instrument_strategy_roundtrip() {
        let mut s = session(Strategy::Instrument);
        assert!(s.start().is_empty());
        let loaded = s.intercept_module("a").unwrap();
        assert!(loaded.text().unwrap().contains("__covlua.hit(\"/p/a.lua\", 2, 0);"));
        for line in [1, 2] {
            s.on_event(HostEvent::Hit {
                file: "/p/a.lua",
                line,
                block: BlockId::ROOT,
            });
        }
        let report = s.stop();
        assert_eq!(report.events.recorded, 2);
        let file = s.store().file("/p/a.lua").unwrap();
        assert!(file.is_instrumented());
        assert_eq!(s.store().summary().executed_lines, 2);
    }
}
