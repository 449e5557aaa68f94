use tracing::debug;

use super::{Collector, Context, EventCounters, HookMask, HostEvent, Strategy};
use crate::error::{CoverageError, Result};
use crate::model::BlockId;

/// Passive collector fed by the interpreter's line and call hooks.
#[derive(Debug, Default)]
pub struct TraceCollector {
    counters: EventCounters,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `block` is known only when the chunk was instrumented.
    fn record_line(
        &mut self,
        ctx: &mut Context<'_>,
        path: &str,
        line: u32,
        block: Option<BlockId>,
    ) {
        if !ctx.files.track(ctx.store, ctx.source, path) {
            self.counters.ignored += 1;
            return;
        }
        // Without an analysis the hit is kept provisionally and settled at stop.
        if let Some(analysis) = ctx.files.analysis(path) {
            if !analysis.is_executable(line) {
                self.counters.ignored += 1;
                return;
            }
        }
        let marked = match block {
            Some(block) => ctx.store.mark_block_executed(path, line, block),
            None => ctx.store.mark_executed(path, line),
        };
        if marked {
            self.counters.recorded += 1;
        } else {
            self.counters.ignored += 1;
        }
    }

    fn record_call(&mut self, ctx: &mut Context<'_>, path: &str, line_defined: u32) -> bool {
        if line_defined == 0 || !ctx.files.track(ctx.store, ctx.source, path) {
            self.counters.ignored += 1;
            return false;
        }
        let marked = ctx.store.mark_function_executed(path, line_defined);
        if marked {
            self.counters.recorded += 1;
        } else {
            self.counters.ignored += 1;
        }
        marked
    }

    fn resolve(&mut self, ctx: &mut Context<'_>, raw: &str) -> Result<String> {
        ctx.files.resolve(raw).ok_or_else(|| {
            self.counters.skipped += 1;
            CoverageError::PathResolution {
                source_id: raw.chars().take(40).collect(),
                message: "no file for chunk".to_string(),
            }
        })
    }
}

impl Collector for TraceCollector {
    fn strategy(&self) -> Strategy {
        Strategy::Trace
    }

    fn start(&mut self, _ctx: &mut Context<'_>) -> HookMask {
        self.counters = EventCounters::default();
        HookMask::LINE_AND_CALL
    }

    fn on_event(&mut self, ctx: &mut Context<'_>, event: HostEvent<'_>) -> Result<()> {
        match event {
            HostEvent::Line { source, line } => {
                let path = self.resolve(ctx, source)?;
                self.record_line(ctx, &path, line, None);
            }
            HostEvent::Call { source, line_defined } => {
                let path = self.resolve(ctx, source)?;
                if self.record_call(ctx, &path, line_defined) {
                    ctx.store.mark_inline_function_block(&path, line_defined);
                }
            }
            // A host may still run instrumented chunks under a trace session.
            HostEvent::Hit { file, line, block } => self.record_line(ctx, file, line, Some(block)),
            HostEvent::Enter { file, line } => {
                self.record_call(ctx, file, line);
            }
        }
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut Context<'_>) {
        debug!(
            recorded = self.counters.recorded,
            ignored = self.counters.ignored,
            skipped = self.counters.skipped,
            "trace collector stopped"
        );
    }

    fn translate(&self, _file: &str, line: u32) -> Option<u32> {
        Some(line)
    }

    fn counters(&self) -> EventCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::FileTable;
    use crate::config::Config;
    use crate::paths::MemorySource;
    use crate::store::CoverageStore;

    const SRC: &str = "local function add(a, b)\n  return a + b\nend\n-- note\nprint(add(1, 2))\n";

    fn run(events: &[HostEvent<'_>]) -> (CoverageStore, EventCounters) {
        let config = Config::default().with_root("/p");
        let mut store = CoverageStore::new();
        let mut files = FileTable::new(&config).unwrap();
        let src = MemorySource::new().with_file("/p/main.lua", SRC);
        let mut collector = TraceCollector::new();
        let mut ctx = Context {
            store: &mut store,
            files: &mut files,
            source: &src,
        };
        assert_eq!(collector.start(&mut ctx), HookMask::LINE_AND_CALL);
        for event in events {
            let _ = collector.on_event(&mut ctx, *event);
        }
        collector.stop(&mut ctx);
        let counters = collector.counters();
        (store, counters)
    }

    #[test]
    fn test_line_and_call_events() {
        let (store, counters) = run(&[
            HostEvent::Line { source: "@main.lua", line: 1 },
            HostEvent::Line { source: "@main.lua", line: 5 },
            HostEvent::Call { source: "@main.lua", line_defined: 1 },
            HostEvent::Line { source: "@main.lua", line: 2 },
        ]);
        let file = store.file("/p/main.lua").unwrap();
        assert!(file.line(2).unwrap().executed);
        assert!(!file.line(2).unwrap().covered);
        let add = file.functions().next().unwrap();
        assert!(add.executed);
        assert_eq!(add.execution_count, 1);
        assert_eq!(counters.recorded, 4);
    }

    #[test]
    fn test_non_executable_line_ignored() {
        let (store, counters) = run(&[HostEvent::Line { source: "@main.lua", line: 4 }]);
        assert!(!store.file("/p/main.lua").unwrap().line(4).unwrap().executed);
        assert_eq!(counters.ignored, 1);
    }

    #[test]
    fn test_unresolvable_chunk_skipped() {
        let (store, counters) = run(&[
            HostEvent::Line { source: "=stdin", line: 1 },
            HostEvent::Line { source: "print('inline')", line: 1 },
        ]);
        assert!(store.is_empty());
        assert_eq!(counters.skipped, 2);
    }

    #[test]
    fn test_vanished_file_recorded_provisionally() {
        let (store, _) = run(&[HostEvent::Line { source: "@gone.lua", line: 3 }]);
        let line = store.file("/p/gone.lua").unwrap().line(3).unwrap().clone();
        assert!(line.provisional);
        assert!(line.executed);
    }

    #[test]
    fn test_call_marks_one_line_function_block() {
        let config = Config::default().with_root("/p");
        let mut store = CoverageStore::new();
        let mut files = FileTable::new(&config).unwrap();
        let src = "local f = function() return 1 end\nf()\n";
        let src = MemorySource::new().with_file("/p/f.lua", src);
        let mut collector = TraceCollector::new();
        let mut ctx = Context {
            store: &mut store,
            files: &mut files,
            source: &src,
        };
        collector.start(&mut ctx);
        for event in [
            HostEvent::Line { source: "@f.lua", line: 1 },
            HostEvent::Line { source: "@f.lua", line: 2 },
            HostEvent::Call { source: "@f.lua", line_defined: 1 },
        ] {
            collector.on_event(&mut ctx, event).unwrap();
        }

        let file = store.file("/p/f.lua").unwrap();
        let function = file.blocks().iter().next().unwrap();
        assert!(function.executed);
        assert_eq!(function.execution_count, 1);
    }
}
