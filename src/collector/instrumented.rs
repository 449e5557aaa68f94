use std::collections::HashMap;

use tracing::{debug, info};

use super::{Collector, Context, EventCounters, HookMask, HostEvent, Strategy};
use crate::config::Config;
use crate::error::Result;
use crate::instrument::loader::{Interception, ModuleLoader, Passthrough};
use crate::instrument::SourceMap;
use crate::model::BlockId;

/// (hit line, block) -> continuation lines that call accounts for.
type Continuations = HashMap<(u32, BlockId), Vec<u32>>;

/// Active collector: sources are rewritten on load and report their own
/// execution through `hit` and `enter` calls with literal locations.
pub struct InstrumentingCollector {
    loader: ModuleLoader,
    sourcemaps: HashMap<String, SourceMap>,
    continuations: HashMap<String, Continuations>,
    counters: EventCounters,
}

impl InstrumentingCollector {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            loader: ModuleLoader::new(config)?,
            sourcemaps: HashMap::new(),
            continuations: HashMap::new(),
            counters: EventCounters::default(),
        })
    }

    pub fn with_loader(loader: ModuleLoader) -> Self {
        Self {
            loader,
            sourcemaps: HashMap::new(),
            continuations: HashMap::new(),
            counters: EventCounters::default(),
        }
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn sourcemap(&self, path: &str) -> Option<&SourceMap> {
        self.sourcemaps.get(path)
    }

    /// Register every module the loader has instrumented that the store does
    /// not know yet, eager loads included.
    fn sync(&mut self, ctx: &mut Context<'_>) {
        for module in self.loader.modules() {
            if self.sourcemaps.contains_key(&module.path) {
                continue;
            }
            ctx.files
                .adopt(ctx.store, &module.path, &module.source, module.analysis.clone());
            ctx.store.set_instrumented(&module.path, true);
            self.sourcemaps
                .insert(module.path.clone(), module.instrumented.sourcemap.clone());
            let rest: Continuations = module
                .instrumented
                .sites
                .iter()
                .filter(|s| !s.continuation.is_empty())
                .map(|s| ((s.line, s.block), s.continuation.clone()))
                .collect();
            self.continuations.insert(module.path.clone(), rest);
        }
        let aborted: Vec<String> = self.loader.aborted().map(str::to_string).collect();
        for path in aborted {
            if !ctx.store.contains(&path) {
                ctx.files.untrack(ctx.store, &path);
            }
        }
    }

    fn settle(&mut self, ctx: &mut Context<'_>, outcome: Interception) -> Interception {
        self.sync(ctx);
        if let Interception::Original { path, reason, .. } = &outcome {
            match reason {
                Passthrough::Failed | Passthrough::DepthLimit => ctx.files.untrack(ctx.store, path),
                Passthrough::Excluded => ctx.store.discover(path),
                Passthrough::Reentrant => {}
            }
        }
        outcome
    }

    fn record_hit(&mut self, ctx: &mut Context<'_>, file: &str, line: u32, block: BlockId) {
        if !ctx.files.track(ctx.store, ctx.source, file) {
            self.counters.ignored += 1;
            return;
        }
        if let Some(analysis) = ctx.files.analysis(file) {
            if !analysis.is_executable(line) {
                self.counters.ignored += 1;
                return;
            }
        }
        if !ctx.store.mark_block_executed(file, line, block) {
            self.counters.ignored += 1;
            return;
        }
        self.counters.recorded += 1;
        let rest = self
            .continuations
            .get(file)
            .and_then(|c| c.get(&(line, block)));
        for &next in rest.into_iter().flatten() {
            ctx.store.mark_line_executed(file, next);
        }
    }
}

impl Collector for InstrumentingCollector {
    fn strategy(&self) -> Strategy {
        Strategy::Instrument
    }

    fn start(&mut self, _ctx: &mut Context<'_>) -> HookMask {
        self.sourcemaps.clear();
        self.continuations.clear();
        self.counters = EventCounters::default();
        HookMask::NONE
    }

    fn on_event(&mut self, ctx: &mut Context<'_>, event: HostEvent<'_>) -> Result<()> {
        match event {
            HostEvent::Hit { file, line, block } => self.record_hit(ctx, file, line, block),
            HostEvent::Enter { file, line } => {
                if ctx.store.mark_function_executed(file, line) {
                    self.counters.recorded += 1;
                } else {
                    self.counters.ignored += 1;
                }
            }
            // Hooks are not installed for this strategy; stray events are dropped.
            HostEvent::Line { .. } | HostEvent::Call { .. } => self.counters.ignored += 1,
        }
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut Context<'_>) {
        let stats = self.loader.stats();
        info!(
            files = self.sourcemaps.len(),
            transforms = stats.transforms,
            cache_hits = stats.cache_hits,
            disk_hits = stats.disk_hits,
            depth_aborts = stats.depth_aborts,
            "instrumentation stopped"
        );
        debug!(
            recorded = self.counters.recorded,
            ignored = self.counters.ignored,
            "instrumented events"
        );
    }

    fn translate(&self, file: &str, line: u32) -> Option<u32> {
        match self.sourcemaps.get(file) {
            Some(map) => map.original(line),
            None => Some(line),
        }
    }

    fn intercept_module(&mut self, ctx: &mut Context<'_>, module: &str) -> Option<Interception> {
        let outcome = self.loader.load(module, ctx.source, ctx.files.analyzer_mut());
        Some(self.settle(ctx, outcome))
    }

    fn intercept_file(&mut self, ctx: &mut Context<'_>, path: &str) -> Option<Interception> {
        let outcome = self.loader.load_file(path, ctx.source, ctx.files.analyzer_mut());
        Some(self.settle(ctx, outcome))
    }

    fn counters(&self) -> EventCounters {
        self.counters
    }
}
