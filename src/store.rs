//! The coverage data store: one [`FileRecord`] per normalized path.
//!
//! Both collectors, the classification pass and assertion linkage write
//! through the accessors here; records are never handed out mutably. The
//! store is single-threaded. A multi-worker host keeps one store per worker
//! and combines them with [`CoverageStore::merge`].

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::analyzer::Analysis;
use crate::blocks::{fix_relationships, BlockTable, FixReport};
use crate::error::Result;
use crate::model::{
    BlockId, BlockKind, BlockRecord, CoverageQuality, FunctionId, FunctionRecord, LineRecord,
    Summary,
};

/// Precomputed lookups that keep hit handling to a few hash lookups.
#[derive(Debug, Clone, Default)]
struct LineIndex {
    /// Line -> innermost block a hit there proves ran.
    owner: HashMap<u32, BlockId>,
    /// Block -> first executable line it owns; a hit there is a block entry.
    entry: HashMap<BlockId, u32>,
    /// Line -> blocks a line hit enters.
    entered_at: HashMap<u32, Vec<BlockId>>,
    /// (running block, line) -> child blocks a statement there opens.
    opens: HashMap<(BlockId, u32), Vec<BlockId>>,
    /// Opened blocks whose header shares the entry line; the opening
    /// statement counts them, not their body.
    headed: HashSet<BlockId>,
    /// Definition line -> function.
    function_at: HashMap<u32, FunctionId>,
    /// Definition line -> block of a function written on that one line.
    inline_function: HashMap<u32, BlockId>,
}

/// How a hit is credited to blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attribution {
    /// Only the line is known (line hooks).
    Line,
    /// The code reported the block it runs in.
    Block(BlockId),
    /// Continuation of a statement already credited.
    LineOnly,
}

/// Coverage state of one source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    path: String,
    source: Vec<String>,
    lines: BTreeMap<u32, LineRecord>,
    blocks: BlockTable,
    functions: BTreeMap<FunctionId, FunctionRecord>,
    /// Seen by a collector or a report, whether or not it is tracked.
    discovered: bool,
    /// Tracked: hits for this file are recorded.
    active: bool,
    quality: CoverageQuality,
    instrumented: bool,
    #[serde(skip)]
    index: LineIndex,
}

impl FileRecord {
    fn empty(path: &str) -> Self {
        Self {
            path: path.to_string(),
            source: Vec::new(),
            lines: BTreeMap::new(),
            blocks: BlockTable::new(),
            functions: BTreeMap::new(),
            discovered: true,
            active: false,
            quality: CoverageQuality::Untracked,
            instrumented: false,
            index: LineIndex::default(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Source text, one entry per line.
    pub fn source(&self) -> &[String] {
        &self.source
    }

    pub fn line(&self, line: u32) -> Option<&LineRecord> {
        self.lines.get(&line)
    }

    pub fn lines(&self) -> impl Iterator<Item = (u32, &LineRecord)> {
        self.lines.iter().map(|(n, l)| (*n, l))
    }

    pub fn blocks(&self) -> &BlockTable {
        &self.blocks
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.functions.values()
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn quality(&self) -> CoverageQuality {
        self.quality
    }

    pub fn is_instrumented(&self) -> bool {
        self.instrumented
    }

    /// Whether any line still waits for an analysis to settle it.
    pub fn has_provisional_lines(&self) -> bool {
        self.lines.values().any(|l| l.provisional)
    }

    /// Block that a hit on `line` is attributed to.
    pub fn block_for_line(&self, line: u32) -> Option<BlockId> {
        self.index.owner.get(&line).copied()
    }

    /// Aggregate counts for this file, computed from the records.
    pub fn summary(&self) -> Summary {
        let mut s = Summary {
            files: u64::from(self.active),
            ..Summary::default()
        };
        for line in self.lines.values().filter(|l| l.executable) {
            s.executable_lines += 1;
            if line.executed {
                s.executed_lines += 1;
                if line.covered {
                    s.covered_lines += 1;
                }
            }
        }
        s.total_blocks = self.blocks.len() as u64;
        s.executed_blocks = self.blocks.iter().filter(|b| b.executed).count() as u64;
        s.total_functions = self.functions.len() as u64;
        s.executed_functions = self.functions.values().filter(|f| f.executed).count() as u64;
        s
    }

    pub(crate) fn line_mut(&mut self, line: u32) -> Option<&mut LineRecord> {
        self.lines.get_mut(&line)
    }

    pub(crate) fn set_source(&mut self, source: &str) {
        self.source = source.lines().map(str::to_string).collect();
    }

    /// Replace structure (blocks, functions) with a fresh analysis while
    /// keeping hit state for blocks and functions that still exist.
    pub(crate) fn adopt_structure(&mut self, analysis: &Analysis) {
        for block in analysis.blocks.iter() {
            self.blocks.insert(block.clone());
        }
        for function in &analysis.functions {
            self.functions
                .entry(function.id)
                .or_insert_with(|| function.clone());
        }
        self.quality = if analysis.parsed() {
            CoverageQuality::Full
        } else {
            CoverageQuality::Heuristic
        };
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        let mut index = LineIndex::default();
        let lines = &self.lines;
        let executable = |n: u32| lines.get(&n).is_some_and(|l| l.executable);

        let mut arms_at: HashMap<u32, Vec<BlockId>> = HashMap::new();
        for block in self.blocks.iter() {
            let first = (block.start_line..=block.end_line)
                .find(|n| block.owns_line(*n) && executable(*n));
            if let Some(line) = first {
                index.entry.insert(block.id, line);
            }
            if block.branch.is_some() {
                for line in block.start_line..=block.end_line {
                    arms_at.entry(line).or_default().push(block.id);
                }
            }
        }

        for block in self.blocks.iter() {
            let Some(&entry) = index.entry.get(&block.id) else {
                continue;
            };
            if !self.undecidable(&index.entry, &arms_at, block.id, entry) {
                index.entered_at.entry(entry).or_default().push(block.id);
            }
            if block.kind == BlockKind::Function && block.start_line == block.end_line {
                index.inline_function.insert(block.start_line, block.id);
            } else if block.kind != BlockKind::Function && block.branch.is_none() {
                let parent = block.parent_id.unwrap_or(BlockId::ROOT);
                index.opens.entry((parent, entry)).or_default().push(block.id);
                if block.start_line == entry {
                    index.headed.insert(block.id);
                }
            }
        }

        // Paint widest blocks first so the innermost decidable owner wins.
        let mut order: Vec<&BlockRecord> = self.blocks.iter().collect();
        order.sort_by(|a, b| b.span().cmp(&a.span()).then(a.id.cmp(&b.id)));
        for block in order {
            for line in block.start_line..=block.end_line {
                if block.owns_line(line)
                    && executable(line)
                    && !self.undecidable(&index.entry, &arms_at, block.id, line)
                {
                    index.owner.insert(line, block.id);
                }
            }
        }

        for f in self.functions.values() {
            index.function_at.entry(f.start_line).or_insert(f.id);
        }
        self.index = index;
    }

    /// Whether running `line` says nothing about `id` having run: somewhere
    /// up its parent chain an `if` arm shares the line with an unrelated arm
    /// or with the condition that picks it, or a one-line function's header
    /// sits on the line.
    fn undecidable(
        &self,
        entry: &HashMap<BlockId, u32>,
        arms_at: &HashMap<u32, Vec<BlockId>>,
        id: BlockId,
        line: u32,
    ) -> bool {
        let mut cur = Some(id);
        // Bounded so an unresolved parent cycle cannot spin.
        let mut budget = self.blocks.len();
        while let Some(block) = cur.and_then(|c| self.blocks.get(c)) {
            if budget == 0 || !block.contains_line(line) {
                break;
            }
            budget -= 1;
            if block.kind == BlockKind::Function && block.start_line == line {
                return true;
            }
            if block.branch.is_some() {
                let picked_here = block
                    .parent_id
                    .and_then(|p| entry.get(&p))
                    .is_some_and(|e| *e == line);
                if picked_here {
                    return true;
                }
                let lineage = self.blocks.ancestors(block.id);
                let shared = arms_at.get(&line).is_some_and(|arms| {
                    arms.iter().any(|other| {
                        *other != block.id
                            && !lineage.contains(other)
                            && !self.blocks.ancestors(*other).contains(&block.id)
                    })
                });
                if shared {
                    return true;
                }
            }
            cur = block.parent_id.filter(|p| !p.is_root());
        }
        false
    }

    fn record_hit(&mut self, line: u32, attribution: Attribution) {
        let analyzed = self.quality != CoverageQuality::Untracked;
        let record = self.lines.entry(line).or_insert_with(|| {
            let mut l = LineRecord::provisional();
            // A hit past the end of an analyzed file cannot be real code.
            l.executable = !analyzed;
            l
        });
        record.executed = true;
        record.execution_count += 1;

        let Self { index, blocks, .. } = self;
        match attribution {
            Attribution::Line => {
                let entered = index.entered_at.get(&line).map(Vec::as_slice).unwrap_or(&[]);
                for id in entered {
                    if let Some(block) = blocks.get_mut(*id) {
                        block.executed = true;
                        block.execution_count += 1;
                    }
                }
                if let Some(owner) = index.owner.get(&line).filter(|o| !entered.contains(*o)) {
                    if let Some(block) = blocks.get_mut(*owner) {
                        block.executed = true;
                        block.execution_count = block.execution_count.max(1);
                    }
                }
            }
            Attribution::Block(id) => {
                let counts = index.entry.get(&id) == Some(&line) && !index.headed.contains(&id);
                if let Some(block) = blocks.get_mut(id) {
                    block.executed = true;
                    if counts || block.execution_count == 0 {
                        block.execution_count += 1;
                    }
                }
                for opened in index.opens.get(&(id, line)).into_iter().flatten() {
                    if let Some(block) = blocks.get_mut(*opened) {
                        block.executed = true;
                        block.execution_count += 1;
                    }
                }
            }
            Attribution::LineOnly => {}
        }
    }

    fn merge_from(&mut self, other: FileRecord) {
        // Keep the less trustworthy quality among shards that tracked the file.
        let rank = |q: CoverageQuality| match q {
            CoverageQuality::Full => 0,
            CoverageQuality::Heuristic => 1,
            CoverageQuality::Untracked => 2,
        };
        if other.active && (!self.active || rank(other.quality) > rank(self.quality)) {
            self.quality = other.quality;
        }
        self.discovered |= other.discovered;
        self.active |= other.active;
        self.instrumented |= other.instrumented;
        if self.source.is_empty() {
            self.source = other.source;
        }

        for (n, theirs) in other.lines {
            match self.lines.get_mut(&n) {
                Some(ours) => {
                    if ours.provisional && !theirs.provisional {
                        ours.executable = theirs.executable;
                        ours.line_type = theirs.line_type;
                        ours.reason = theirs.reason;
                        ours.provisional = false;
                    }
                    ours.executed |= theirs.executed;
                    ours.covered |= theirs.covered;
                    ours.execution_count += theirs.execution_count;
                }
                None => {
                    self.lines.insert(n, theirs);
                }
            }
        }

        for block in other.blocks.iter() {
            match self.blocks.get_mut(block.id) {
                Some(ours) => {
                    ours.executed |= block.executed;
                    ours.execution_count += block.execution_count;
                }
                None => {
                    self.blocks.insert(block.clone());
                }
            }
        }

        for (id, theirs) in other.functions {
            match self.functions.get_mut(&id) {
                Some(ours) => {
                    ours.executed |= theirs.executed;
                    ours.execution_count += theirs.execution_count;
                }
                None => {
                    self.functions.insert(id, theirs);
                }
            }
        }
        self.rebuild_index();
    }
}

/// A line whose flags break `covered => executed => executable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvariantViolation {
    pub path: String,
    pub line: u32,
    pub problem: ViolationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    CoveredNotExecuted,
    ExecutedNotExecutable,
}

/// Read-only view handed to reporters.
#[derive(Debug, Serialize)]
pub struct Snapshot<'a> {
    pub generated_at: String,
    pub summary: Summary,
    pub files: &'a BTreeMap<String, FileRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageStore {
    files: BTreeMap<String, FileRecord>,
}

impl CoverageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every record. Called when a session starts.
    pub fn reset(&mut self) {
        self.files.clear();
    }

    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn files(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub(crate) fn file_mut(&mut self, path: &str) -> Option<&mut FileRecord> {
        self.files.get_mut(path)
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Start tracking `path` with the lines, blocks and functions of
    /// `analysis`. Re-registering an already analyzed file is a no-op, so
    /// hit state is never lost.
    pub fn register_file(&mut self, path: &str, source: &str, analysis: &Analysis) {
        let record = self
            .files
            .entry(path.to_string())
            .or_insert_with(|| FileRecord::empty(path));
        if record.active && record.quality != CoverageQuality::Untracked {
            return;
        }

        record.set_source(source);
        // Hits recorded before the analysis arrived keep their records; the
        // classification pass decides whether they stand.
        for (idx, class) in analysis.lines.iter().enumerate() {
            record
                .lines
                .entry(idx as u32 + 1)
                .or_insert_with(|| LineRecord::from_classification(*class));
        }
        record.active = true;
        record.discovered = true;
        record.adopt_structure(analysis);
    }

    /// Track `path` without any analysis (source unavailable). Hits become
    /// provisional lines until the classification pass can settle them.
    pub fn register_unanalyzed(&mut self, path: &str) {
        let record = self
            .files
            .entry(path.to_string())
            .or_insert_with(|| FileRecord::empty(path));
        record.active = true;
        record.discovered = true;
    }

    /// Note that `path` exists without tracking it.
    pub fn discover(&mut self, path: &str) {
        self.files
            .entry(path.to_string())
            .or_insert_with(|| FileRecord::empty(path));
    }

    pub(crate) fn set_instrumented(&mut self, path: &str, instrumented: bool) {
        if let Some(record) = self.files.get_mut(path) {
            record.instrumented = instrumented;
        }
    }

    pub(crate) fn set_quality(&mut self, path: &str, quality: CoverageQuality) {
        if let Some(record) = self.files.get_mut(path) {
            record.quality = quality;
        }
    }

    /// Fetch a line record, creating a provisional one if the file is
    /// tracked but the line is unknown.
    pub fn get_or_create_line(&mut self, path: &str, line: u32) -> Option<&LineRecord> {
        let record = self.files.get_mut(path).filter(|f| f.active)?;
        let analyzed = record.quality != CoverageQuality::Untracked;
        Some(record.lines.entry(line).or_insert_with(|| {
            let mut l = LineRecord::provisional();
            l.executable = !analyzed;
            l
        }))
    }

    /// Record one execution of `line`, crediting the blocks a line hit can
    /// vouch for. Returns `false` if the file is not tracked.
    pub fn mark_executed(&mut self, path: &str, line: u32) -> bool {
        self.hit(path, line, Attribution::Line)
    }

    /// Record one execution of `line` by code running in `block`
    /// ([`BlockId::ROOT`] for the main chunk). The block and any block the
    /// statement opens are credited; sibling blocks on the same line are not.
    pub fn mark_block_executed(&mut self, path: &str, line: u32, block: BlockId) -> bool {
        self.hit(path, line, Attribution::Block(block))
    }

    /// Record one execution of a continuation line of a statement whose
    /// blocks were already credited.
    pub fn mark_line_executed(&mut self, path: &str, line: u32) -> bool {
        self.hit(path, line, Attribution::LineOnly)
    }

    fn hit(&mut self, path: &str, line: u32, attribution: Attribution) -> bool {
        match self.files.get_mut(path) {
            Some(record) if record.active => {
                record.record_hit(line, attribution);
                true
            }
            _ => false,
        }
    }

    /// Promote an executed, executable line to covered. Counts are left
    /// alone. Returns whether the line is covered afterwards.
    pub fn mark_covered(&mut self, path: &str, line: u32) -> bool {
        let Some(record) = self.files.get_mut(path) else {
            return false;
        };
        match record.lines.get_mut(&line) {
            Some(l) if l.executed && l.executable => {
                l.covered = true;
                true
            }
            _ => false,
        }
    }

    /// Credit the block of a function written on one line. Line hits on
    /// that line happen when the function is defined, so only a call event
    /// can say its body ran.
    pub fn mark_inline_function_block(&mut self, path: &str, start_line: u32) -> bool {
        let Some(record) = self.files.get_mut(path).filter(|f| f.active) else {
            return false;
        };
        let Some(id) = record.index.inline_function.get(&start_line).copied() else {
            return false;
        };
        match record.blocks.get_mut(id) {
            Some(block) => {
                block.executed = true;
                block.execution_count += 1;
                true
            }
            None => false,
        }
    }

    /// Record a call of the function defined on `start_line`.
    pub fn mark_function_executed(&mut self, path: &str, start_line: u32) -> bool {
        let Some(record) = self.files.get_mut(path).filter(|f| f.active) else {
            return false;
        };
        let Some(id) = record.index.function_at.get(&start_line).copied() else {
            return false;
        };
        match record.functions.get_mut(&id) {
            Some(f) => {
                f.executed = true;
                f.execution_count += 1;
                true
            }
            None => false,
        }
    }

    /// Add a block to a file; waiting children are attached immediately.
    /// Returns the number of pending children resolved.
    pub fn add_block(&mut self, path: &str, block: BlockRecord) -> usize {
        let Some(record) = self.files.get_mut(path) else {
            return 0;
        };
        let resolved = record.blocks.insert(block);
        record.rebuild_index();
        resolved
    }

    pub fn set_parent(&mut self, path: &str, child: BlockId, parent: BlockId) -> bool {
        let Some(record) = self.files.get_mut(path) else {
            return false;
        };
        record.blocks.set_parent(child, Some(parent))
    }

    /// Run the block resolver over one file.
    pub fn fix_file_relationships(&mut self, path: &str) -> FixReport {
        match self.files.get_mut(path) {
            Some(record) => {
                let report = fix_relationships(&mut record.blocks);
                record.rebuild_index();
                report
            }
            None => FixReport::default(),
        }
    }

    /// Run the block resolver over every file.
    pub fn fix_relationships(&mut self) -> FixReport {
        let mut total = FixReport::default();
        for record in self.files.values_mut() {
            total.absorb(fix_relationships(&mut record.blocks));
            record.rebuild_index();
        }
        total
    }

    /// Aggregate over every file. Always recomputed.
    pub fn summary(&self) -> Summary {
        let mut total = Summary::default();
        for record in self.files.values() {
            total.absorb(&record.summary());
        }
        total
    }

    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut out = Vec::new();
        for record in self.files.values() {
            for (n, line) in &record.lines {
                if line.covered && !line.executed {
                    out.push(InvariantViolation {
                        path: record.path.clone(),
                        line: *n,
                        problem: ViolationKind::CoveredNotExecuted,
                    });
                }
                if line.executed && !line.executable {
                    out.push(InvariantViolation {
                        path: record.path.clone(),
                        line: *n,
                        problem: ViolationKind::ExecutedNotExecutable,
                    });
                }
            }
        }
        out
    }

    /// Clear flags that break the invariant. Returns how many lines changed.
    pub fn enforce_invariants(&mut self) -> usize {
        let mut changed = 0;
        for record in self.files.values_mut() {
            for line in record.lines.values_mut() {
                let before = (line.executed, line.covered);
                if !line.executable {
                    line.executed = false;
                }
                if !line.executed {
                    line.covered = false;
                }
                if before != (line.executed, line.covered) {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Fold a shard collected elsewhere into this store: counts are summed
    /// and flags unioned.
    pub fn merge(&mut self, other: CoverageStore) {
        for (path, theirs) in other.files {
            match self.files.get_mut(&path) {
                Some(ours) => ours.merge_from(theirs),
                None => {
                    let mut record = theirs;
                    record.rebuild_index();
                    self.files.insert(path, record);
                }
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            generated_at: Utc::now().to_rfc3339(),
            summary: self.summary(),
            files: &self.files,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Load a store back from [`CoverageStore::to_json`] output.
    pub fn from_json(input: &str) -> Result<Self> {
        let mut store: CoverageStore = serde_json::from_str(input)?;
        for file in store.files.values_mut() {
            file.rebuild_index();
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::config::Config;
    use crate::model::Branch;

    const PATH: &str = "/proj/a.lua";
    const SRC: &str = "local x = 1\n-- note\nif x then\n  print(x)\nend\n";

    fn store_with_file() -> CoverageStore {
        let analysis = Analyzer::new(&Config::default()).analyze(SRC, PATH);
        let mut store = CoverageStore::new();
        store.register_file(PATH, SRC, &analysis);
        store
    }

    #[test]
    fn test_mark_executed_counts_and_blocks() {
        let mut store = store_with_file();
        assert!(store.mark_executed(PATH, 1));
        assert!(store.mark_executed(PATH, 4));
        assert!(store.mark_executed(PATH, 4));

        let file = store.file(PATH).unwrap();
        assert_eq!(file.line(4).unwrap().execution_count, 2);
        let owner = file.block_for_line(4).unwrap();
        let block = file.blocks().get(owner).unwrap();
        assert!(block.executed);
        assert_eq!(block.execution_count, 2);
    }

    #[test]
    fn test_mark_covered_requires_execution() {
        let mut store = store_with_file();
        assert!(!store.mark_covered(PATH, 1));
        store.mark_executed(PATH, 1);
        assert!(store.mark_covered(PATH, 1));
        assert_eq!(store.file(PATH).unwrap().line(1).unwrap().execution_count, 1);
        assert!(!store.mark_covered(PATH, 2));
    }

    #[test]
    fn test_untracked_file_ignores_hits() {
        let mut store = CoverageStore::new();
        store.discover("/proj/vendor.lua");
        assert!(!store.mark_executed("/proj/vendor.lua", 1));
        assert!(store.file("/proj/vendor.lua").unwrap().is_discovered());
        assert_eq!(store.summary().files, 0);
    }

    #[test]
    fn test_summary_is_derived() {
        let mut store = store_with_file();
        store.mark_executed(PATH, 1);
        store.mark_covered(PATH, 1);
        let s = store.summary();
        assert_eq!(s.files, 1);
        assert_eq!(s.executable_lines, 3);
        assert_eq!(s.executed_lines, 1);
        assert_eq!(s.covered_lines, 1);
    }

    #[test]
    fn test_merge_sums_counts() {
        let mut a = store_with_file();
        let mut b = store_with_file();
        a.mark_executed(PATH, 1);
        b.mark_executed(PATH, 1);
        b.mark_executed(PATH, 3);
        b.mark_covered(PATH, 3);

        a.merge(b);
        let file = a.file(PATH).unwrap();
        assert_eq!(file.line(1).unwrap().execution_count, 2);
        assert!(file.line(3).unwrap().covered);
        assert!(a.check_invariants().is_empty());
    }

    #[test]
    fn test_enforce_invariants() {
        let mut store = store_with_file();
        store.mark_executed(PATH, 2);
        assert_eq!(store.check_invariants().len(), 1);
        assert_eq!(store.enforce_invariants(), 1);
        assert!(store.check_invariants().is_empty());
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut store = store_with_file();
        store.mark_executed(PATH, 1);
        let json = store.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["executed_lines"], 1);
        assert!(value["files"][PATH]["lines"]["1"]["executed"].as_bool().unwrap());
    }

    #[test]
    fn test_from_json_keeps_recording() {
        let mut store = store_with_file();
        store.mark_executed(PATH, 4);
        let mut reloaded = CoverageStore::from_json(&store.to_json().unwrap()).unwrap();
        assert_eq!(reloaded.summary(), store.summary());

        assert!(reloaded.mark_executed(PATH, 4));
        let file = reloaded.file(PATH).unwrap();
        assert_eq!(file.line(4).unwrap().execution_count, 2);
        let owner = file.block_for_line(4).unwrap();
        assert!(file.blocks().get(owner).unwrap().executed);
    }

    const ONE_LINE_IF: &str = "local x = 5\nif x > 3 then print('a') else print('b') end\n";

    fn one_line_if() -> (CoverageStore, BlockId, BlockId, BlockId) {
        let analysis = Analyzer::new(&Config::default()).analyze(ONE_LINE_IF, PATH);
        let mut store = CoverageStore::new();
        store.register_file(PATH, ONE_LINE_IF, &analysis);
        let blocks = store.file(PATH).unwrap().blocks();
        let find = |branch: Option<Branch>| {
            blocks
                .iter()
                .find(|b| b.kind == BlockKind::If && b.branch == branch)
                .map(|b| b.id)
                .unwrap()
        };
        let stmt = find(None);
        let (then, other) = (find(Some(Branch::Then)), find(Some(Branch::Else)));
        (store, stmt, then, other)
    }

    #[test]
    fn test_line_hit_never_picks_an_arm_on_a_shared_line() {
        let (mut store, stmt, then, other) = one_line_if();
        store.mark_executed(PATH, 1);
        store.mark_executed(PATH, 2);

        let blocks = store.file(PATH).unwrap().blocks();
        assert!(blocks.get(stmt).unwrap().executed);
        assert_eq!(blocks.get(stmt).unwrap().execution_count, 1);
        assert!(!blocks.get(then).unwrap().executed);
        assert!(!blocks.get(other).unwrap().executed);
        assert_eq!(blocks.get(other).unwrap().execution_count, 0);
        assert_eq!(store.file(PATH).unwrap().block_for_line(2), Some(stmt));
    }

    #[test]
    fn test_block_hit_credits_only_its_arm() {
        let (mut store, stmt, then, other) = one_line_if();
        assert!(store.mark_block_executed(PATH, 2, BlockId::ROOT));
        assert!(store.mark_block_executed(PATH, 2, then));

        let file = store.file(PATH).unwrap();
        assert_eq!(file.line(2).unwrap().execution_count, 2);
        assert_eq!(file.blocks().get(stmt).unwrap().execution_count, 1);
        assert_eq!(file.blocks().get(then).unwrap().execution_count, 1);
        assert!(!file.blocks().get(other).unwrap().executed);
        assert!(store.check_invariants().is_empty());
    }

    #[test]
    fn test_line_hit_inside_an_arm_marks_it() {
        let src = "if x then\n  a()\nelse\n  b()\nend\n";
        let analysis = Analyzer::new(&Config::default()).analyze(src, PATH);
        let mut store = CoverageStore::new();
        store.register_file(PATH, src, &analysis);
        store.mark_executed(PATH, 1);
        store.mark_executed(PATH, 4);

        let file = store.file(PATH).unwrap();
        let arm = |branch: Branch| {
            file.blocks()
                .iter()
                .find(|b| b.branch == Some(branch))
                .unwrap()
        };
        assert!(!arm(Branch::Then).executed);
        assert!(arm(Branch::Else).executed);
        assert_eq!(arm(Branch::Else).execution_count, 1);
    }

    #[test]
    fn test_continuation_hit_touches_only_the_line() {
        let mut store = store_with_file();
        assert!(store.mark_line_executed(PATH, 4));
        let file = store.file(PATH).unwrap();
        assert!(file.line(4).unwrap().executed);
        assert!(file.blocks().iter().all(|b| !b.executed));
    }

    #[test]
    fn test_inline_function_block_needs_a_call() {
        let src = "local f = function() return 1 end\nf()\n";
        let analysis = Analyzer::new(&Config::default()).analyze(src, PATH);
        let mut store = CoverageStore::new();
        store.register_file(PATH, src, &analysis);
        store.mark_executed(PATH, 1);
        let function = |store: &CoverageStore| {
            let file = store.file(PATH).unwrap();
            file.blocks().iter().find(|b| b.kind == BlockKind::Function).unwrap().clone()
        };
        assert!(!function(&store).executed);

        assert!(store.mark_inline_function_block(PATH, 1));
        assert!(function(&store).executed);
        assert_eq!(function(&store).execution_count, 1);
    }

    #[test]
    fn test_one_line_loop_counts_once_per_entry() {
        let src = "for i = 1, 3 do print(i) end\n";
        let analysis = Analyzer::new(&Config::default()).analyze(src, PATH);
        let mut store = CoverageStore::new();
        store.register_file(PATH, src, &analysis);
        let lp = store.file(PATH).unwrap().blocks().iter().next().unwrap().id;

        store.mark_block_executed(PATH, 1, BlockId::ROOT);
        for _ in 0..3 {
            store.mark_block_executed(PATH, 1, lp);
        }
        let block = store.file(PATH).unwrap().blocks().get(lp).unwrap().clone();
        assert!(block.executed);
        assert_eq!(block.execution_count, 1);
    }
}
