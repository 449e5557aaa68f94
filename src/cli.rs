//! Command handler functions for the covlua diagnostic CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::fmt::Write;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::analyzer::Analyzer;
use crate::collector::{HostEvent, Strategy};
use crate::config::Config;
use crate::instrument::cache::DiskCache;
use crate::instrument::{instrument_analyzed, InstrumentOptions};
use crate::linkage::Frame;
use crate::model::BlockId;
use crate::paths::normalize_path;
use crate::report;
use crate::session::Session;
use crate::store::CoverageStore;

/// One recorded host callback, as stored in a replay script.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayEvent {
    Line { source: String, line: u32 },
    Call { source: String, line_defined: u32 },
    Hit {
        file: String,
        line: u32,
        /// Block id from the hit call; scripts recorded without one run at top level.
        #[serde(default)]
        block: u32,
    },
    Enter { file: String, line: u32 },
    Require { module: String },
    Dofile { path: String },
    Assert { frames: Vec<Frame> },
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => Ok(Config::from_json(&read(p)?).with_context(|| format!("Invalid config {}", p.display()))?),
        None => Ok(Config::default()),
    }
}

pub fn load_store(path: &Path) -> Result<CoverageStore> {
    CoverageStore::from_json(&read(path)?).with_context(|| format!("Invalid coverage snapshot {}", path.display()))
}

pub fn cmd_analyze(config: &Config, file: &Path) -> Result<String> {
    let source = read(file)?;
    let id = normalize_path(&file.to_string_lossy(), &config.root);
    let analysis = Analyzer::new(config).analyze(&source, &id);

    let mut out = String::new();
    writeln!(out, "{id}").unwrap();
    match analysis.degraded {
        Some(reason) => writeln!(out, "  lexical classification only ({})", reason.as_str()).unwrap(),
        None => writeln!(out, "  parsed").unwrap(),
    }
    writeln!(out, "{:>6}  {:<11} {:<4} {:<18} SOURCE", "LINE", "TYPE", "EXEC", "REASON").unwrap();
    writeln!(out, "{}", "-".repeat(60)).unwrap();
    for ((i, class), text) in analysis.lines.iter().enumerate().zip(source.lines()) {
        let reason = serde_json::to_value(class.reason)?;
        writeln!(
            out,
            "{:>6}  {:<11} {:<4} {:<18} {}",
            i + 1,
            class.line_type.as_str(),
            if class.executable { "yes" } else { "no" },
            reason.as_str().unwrap_or_default(),
            text
        )
        .unwrap();
    }

    if !analysis.blocks.is_empty() {
        writeln!(out, "\nBlocks:").unwrap();
        for block in analysis.blocks.iter() {
            let parent = block
                .parent_id
                .map_or_else(|| "-".to_string(), |p| p.to_string());
            writeln!(
                out,
                "  {:<8} {:<9} {:>5}-{:<5} parent {}",
                block.id.to_string(),
                block.kind.as_str(),
                block.start_line,
                block.end_line,
                parent
            )
            .unwrap();
        }
    }
    if !analysis.functions.is_empty() {
        writeln!(out, "\nFunctions:").unwrap();
        for f in &analysis.functions {
            writeln!(
                out,
                "  {:<24} {:<9} {:>5}-{}",
                f.name.as_deref().unwrap_or("<anonymous>"),
                f.kind.as_str(),
                f.start_line,
                f.end_line
            )
            .unwrap();
        }
    }
    if !analysis.requires.is_empty() {
        writeln!(out, "\nRequires: {}", analysis.requires.join(", ")).unwrap();
    }
    Ok(out)
}

pub fn cmd_instrument(config: &Config, file: &Path, show_sourcemap: bool) -> Result<String> {
    let source = read(file)?;
    let id = normalize_path(&file.to_string_lossy(), &config.root);
    let analysis = Analyzer::new(config).analyze(&source, &id);
    let instrumented = instrument_analyzed(&source, &id, &analysis, &InstrumentOptions::from_config(config))?;

    if !show_sourcemap {
        return Ok(instrumented.text);
    }
    let mut out = String::new();
    writeln!(out, "{:>6}  {:>8}", "OUTPUT", "ORIGINAL").unwrap();
    writeln!(out, "{}", "-".repeat(16)).unwrap();
    for (transformed, original) in instrumented.sourcemap.iter() {
        writeln!(out, "{transformed:>6}  {original:>8}").unwrap();
    }
    Ok(out)
}

/// Drive a session with a recorded event script and return the resulting
/// snapshot as JSON.
pub fn cmd_replay(config: Config, strategy: Strategy, script: &Path) -> Result<String> {
    let events: Vec<ReplayEvent> =
        serde_json::from_str(&read(script)?).with_context(|| format!("Invalid replay script {}", script.display()))?;

    let mut session = Session::new(config, strategy)?;
    session.start();
    for event in &events {
        match event {
            ReplayEvent::Line { source, line } => session.on_event(HostEvent::Line { source, line: *line }),
            ReplayEvent::Call { source, line_defined } => session.on_event(HostEvent::Call {
                source,
                line_defined: *line_defined,
            }),
            ReplayEvent::Hit { file, line, block } => session.on_event(HostEvent::Hit {
                file,
                line: *line,
                block: BlockId::new(*block),
            }),
            ReplayEvent::Enter { file, line } => session.on_event(HostEvent::Enter { file, line: *line }),
            ReplayEvent::Require { module } => {
                session.intercept_module(module);
            }
            ReplayEvent::Dofile { path } => {
                session.intercept_file(path);
            }
            ReplayEvent::Assert { frames } => {
                session.on_assertion(frames);
            }
        }
    }
    session.stop();
    Ok(session.store().to_json()?)
}

pub fn cmd_summary(store: &CoverageStore) -> String {
    report::format_summary(&store.summary())
}

pub fn cmd_files(store: &CoverageStore, sort_by_rate: bool) -> String {
    report::format_files(store, sort_by_rate)
}

pub fn cmd_lines(store: &CoverageStore, source_file: &str, unexecuted: bool) -> Result<String> {
    let Some(file) = store.file(source_file) else {
        return Ok(format!("No coverage data for '{}'\n", source_file));
    };

    let mut out = String::new();
    if unexecuted {
        let missing = report::unexecuted_lines(file);
        if missing.is_empty() {
            return Ok(format!("All executable lines ran in '{}'\n", source_file));
        }
        writeln!(out, "Unexecuted lines in '{}':", source_file).unwrap();
        writeln!(out, "  {}", report::format_line_ranges(&report::unexecuted_ranges(file))).unwrap();
        writeln!(out, "  ({} lines)", missing.len()).unwrap();
        return Ok(out);
    }

    writeln!(out, "{:>6}  {:>10}  {:<7}", "LINE", "COUNT", "STATE").unwrap();
    writeln!(out, "{}", "-".repeat(27)).unwrap();
    for (n, line) in file.lines().filter(|(_, l)| l.executable) {
        let state = match (line.executed, line.covered) {
            (_, true) => "covered",
            (true, false) => "hit",
            (false, _) => "missed",
        };
        writeln!(out, "{:>6}  {:>10}  {:<7}", n, line.execution_count, state).unwrap();
    }
    Ok(out)
}

/// Merge snapshots from parallel workers; returns the combined snapshot.
pub fn cmd_merge(inputs: &[&Path]) -> Result<String> {
    let mut merged = CoverageStore::new();
    for input in inputs {
        merged.merge(load_store(input)?);
    }
    Ok(merged.to_json()?)
}

pub fn cmd_cache_stats(cache: &DiskCache) -> Result<String> {
    let stats = cache.stats()?;
    let mut out = String::new();
    writeln!(out, "Entries:    {}", stats.entries).unwrap();
    writeln!(out, "Files:      {}", stats.files).unwrap();
    writeln!(out, "Bytes:      {}", stats.bytes).unwrap();
    Ok(out)
}

pub fn cmd_cache_clear(cache: &DiskCache) -> Result<String> {
    let removed = cache.clear()?;
    Ok(format!("Removed {removed} cached sources\n"))
}
