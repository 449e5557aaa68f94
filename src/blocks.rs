//! Arena table of control-flow blocks and the relationship resolver.
//!
//! Blocks reference their parent by id. A child may be added before its
//! parent exists; it then waits in a pending multimap keyed by the missing
//! parent id and is attached the moment that parent is inserted. The
//! resolver ([`fix_relationships`]) repairs whatever is left: missing
//! `children` entries, stale entries, parent cycles, and parents that never
//! showed up (those blocks are reattached to the root and flagged).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{BlockId, BlockRecord};

/// Counts reported by one resolver run. All zero on a consistent table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FixReport {
    /// `children` entries inserted or removed to match `parent_id`.
    pub relationships_fixed: usize,
    /// Waiting children attached to a parent that now exists.
    pub pending_resolved: usize,
    /// Blocks moved under the root because their parent is missing or
    /// their parent chain loops.
    pub orphans_reattached: usize,
}

impl FixReport {
    pub(crate) fn absorb(&mut self, other: FixReport) {
        self.relationships_fixed += other.relationships_fixed;
        self.pending_resolved += other.pending_resolved;
        self.orphans_reattached += other.orphans_reattached;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockTable {
    blocks: BTreeMap<BlockId, BlockRecord>,
    root_children: BTreeSet<BlockId>,
    /// Missing parent id -> children waiting for it.
    pending: BTreeMap<BlockId, BTreeSet<BlockId>>,
    /// Blocks reattached to the root -> the parent they originally named.
    orphans: BTreeMap<BlockId, BlockId>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, id: BlockId) -> Option<&BlockRecord> {
        self.blocks.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: BlockId) -> Option<&mut BlockRecord> {
        self.blocks.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.values()
    }

    /// Children of the synthetic root.
    pub fn root_children(&self) -> &BTreeSet<BlockId> {
        &self.root_children
    }

    /// Children waiting for `parent` to be inserted.
    pub fn pending_for(&self, parent: BlockId) -> Option<&BTreeSet<BlockId>> {
        self.pending.get(&parent)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(BTreeSet::len).sum()
    }

    /// Blocks that were reattached to the root as inconsistent.
    pub fn flagged(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.orphans.keys().copied()
    }

    /// The `children` set of `id`, treating [`BlockId::ROOT`] as a parent.
    pub fn children_of(&self, id: BlockId) -> Option<&BTreeSet<BlockId>> {
        if id.is_root() {
            Some(&self.root_children)
        } else {
            self.blocks.get(&id).map(|b| &b.children)
        }
    }

    /// Add (or refresh) a block. Its relationship to its parent is recorded
    /// immediately, or deferred if the parent does not exist yet; children
    /// already waiting for this block are attached. Returns how many waiting
    /// children were resolved.
    pub fn insert(&mut self, mut record: BlockRecord) -> usize {
        let id = record.id;
        if id.is_root() {
            warn!(block = %id, "refusing to store a block under the root id");
            return 0;
        }

        if let Some(existing) = self.blocks.get_mut(&id) {
            // Refresh structural fields only; hit state and children survive.
            existing.kind = record.kind;
            existing.branch = record.branch;
            existing.start_line = record.start_line;
            existing.end_line = record.end_line;
            if record.parent_id.is_some() && record.parent_id != existing.parent_id {
                let parent = record.parent_id;
                self.set_parent(id, parent);
            }
            return 0;
        }

        // Children are derived from the other blocks' parent ids.
        let claimed = std::mem::take(&mut record.children);
        let parent = record.parent_id;
        self.blocks.insert(id, record);
        self.link(id, parent);
        for child in claimed {
            if self.blocks.get(&child).and_then(|c| c.parent_id) == Some(id) {
                if let Some(b) = self.blocks.get_mut(&id) {
                    b.children.insert(child);
                }
            }
        }
        self.resolve_waiting(id)
    }

    /// Point `child` at a new parent, detaching it from wherever it was.
    /// Returns `false` if `child` does not exist.
    pub fn set_parent(&mut self, child: BlockId, parent: Option<BlockId>) -> bool {
        let Some(old) = self.blocks.get(&child).map(|b| b.parent_id) else {
            return false;
        };
        self.unlink(child, old);
        if let Some(b) = self.blocks.get_mut(&child) {
            b.parent_id = parent;
        }
        self.orphans.remove(&child);
        self.link(child, parent);
        true
    }

    /// Parent chain of `id`, nearest first, stopping at the root. Stops early
    /// on a cycle.
    pub fn ancestors(&self, id: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::from([id]);
        let mut cur = self.blocks.get(&id).and_then(|b| b.parent_id);
        while let Some(p) = cur {
            if p.is_root() || !seen.insert(p) {
                break;
            }
            out.push(p);
            cur = self.blocks.get(&p).and_then(|b| b.parent_id);
        }
        out
    }

    fn link(&mut self, child: BlockId, parent: Option<BlockId>) {
        match parent {
            None => {}
            Some(p) if p.is_root() => {
                self.root_children.insert(child);
            }
            Some(p) => match self.blocks.get_mut(&p) {
                Some(parent_block) => {
                    parent_block.children.insert(child);
                }
                None => {
                    self.pending.entry(p).or_default().insert(child);
                }
            },
        }
    }

    fn unlink(&mut self, child: BlockId, parent: Option<BlockId>) {
        match parent {
            None => {}
            Some(p) if p.is_root() => {
                self.root_children.remove(&child);
            }
            Some(p) => {
                if let Some(parent_block) = self.blocks.get_mut(&p) {
                    parent_block.children.remove(&child);
                }
                if let Some(waiting) = self.pending.get_mut(&p) {
                    waiting.remove(&child);
                    if waiting.is_empty() {
                        self.pending.remove(&p);
                    }
                }
            }
        }
    }

    /// Attach everything that was waiting for `id`, including orphans that
    /// were parked under the root because `id` was missing at the time.
    fn resolve_waiting(&mut self, id: BlockId) -> usize {
        let mut resolved = 0;
        if let Some(waiting) = self.pending.remove(&id) {
            for child in waiting {
                if self.blocks.get(&child).and_then(|c| c.parent_id) == Some(id) {
                    if let Some(b) = self.blocks.get_mut(&id) {
                        b.children.insert(child);
                    }
                    resolved += 1;
                }
            }
        }
        let adopted: Vec<BlockId> = self
            .orphans
            .iter()
            .filter(|(_, wanted)| **wanted == id)
            .map(|(orphan, _)| *orphan)
            .collect();
        for orphan in adopted {
            self.set_parent(orphan, Some(id));
            resolved += 1;
        }
        resolved
    }

    fn park_under_root(&mut self, id: BlockId, wanted: Option<BlockId>) {
        self.set_parent(id, Some(BlockId::ROOT));
        if let Some(w) = wanted.filter(|w| !w.is_root() && *w != id) {
            self.orphans.insert(id, w);
        } else {
            self.orphans.insert(id, BlockId::ROOT);
        }
    }

    /// Every child set entry must name a block whose `parent_id` agrees.
    /// Returns the number of entries inserted or removed.
    fn sync_children(&mut self) -> usize {
        let mut fixed = 0;
        let ids: Vec<BlockId> = self.blocks.keys().copied().collect();
        for id in &ids {
            let parent = self.blocks.get(id).and_then(|b| b.parent_id);
            match parent {
                Some(p) if p.is_root() => {
                    if self.root_children.insert(*id) {
                        fixed += 1;
                    }
                }
                Some(p) => {
                    if let Some(parent_block) = self.blocks.get_mut(&p) {
                        if parent_block.children.insert(*id) {
                            fixed += 1;
                        }
                    } else {
                        self.pending.entry(p).or_default().insert(*id);
                    }
                }
                None => {}
            }
        }

        for id in &ids {
            let Some(children) = self.blocks.get(id).map(|b| b.children.clone()) else {
                continue;
            };
            let stale: Vec<BlockId> = children
                .into_iter()
                .filter(|c| self.blocks.get(c).and_then(|b| b.parent_id) != Some(*id))
                .collect();
            if let Some(block) = self.blocks.get_mut(id) {
                for c in &stale {
                    block.children.remove(c);
                }
            }
            fixed += stale.len();
        }

        let before = self.root_children.len();
        let blocks = &self.blocks;
        self.root_children
            .retain(|c| blocks.get(c).and_then(|b| b.parent_id) == Some(BlockId::ROOT));
        fixed + (before - self.root_children.len())
    }

    fn attach_pending(&mut self) -> usize {
        let ready: Vec<BlockId> = self
            .pending
            .keys()
            .filter(|p| self.blocks.contains_key(p))
            .copied()
            .collect();
        ready.into_iter().map(|p| self.resolve_waiting(p)).sum()
    }

    /// Cut every parent chain that loops back on itself.
    fn break_cycles(&mut self) -> usize {
        let mut broken = 0;
        let ids: Vec<BlockId> = self.blocks.keys().copied().collect();
        let limit = ids.len() + 1;
        for id in ids {
            let mut cur = self.blocks.get(&id).and_then(|b| b.parent_id);
            let mut steps = 0;
            while let Some(p) = cur {
                if p.is_root() || steps > limit {
                    break;
                }
                if p == id {
                    let wanted = self.blocks.get(&id).and_then(|b| b.parent_id);
                    warn!(block = %id, "parent chain loops back to itself; reattaching to root");
                    self.park_under_root(id, wanted);
                    broken += 1;
                    break;
                }
                cur = self.blocks.get(&p).and_then(|b| b.parent_id);
                steps += 1;
            }
        }
        broken
    }

    fn reattach_orphans(&mut self) -> usize {
        let unresolved: Vec<(BlockId, Option<BlockId>)> = self
            .blocks
            .values()
            .filter(|b| match b.parent_id {
                None => true,
                Some(p) => !p.is_root() && !self.blocks.contains_key(&p),
            })
            .map(|b| (b.id, b.parent_id))
            .collect();
        for (id, wanted) in &unresolved {
            match wanted {
                Some(p) => warn!(block = %id, missing_parent = %p, "parent never appeared; reattaching to root"),
                None => warn!(block = %id, "block has no parent; reattaching to root"),
            }
            self.park_under_root(*id, *wanted);
        }
        self.pending.clear();
        unresolved.len()
    }
}

/// Repair parent/child references so that every block sits in exactly one
/// parent's `children` set (the root counts as a parent) and no parent
/// chain loops. Safe to call repeatedly: a second run on an unchanged table
/// reports nothing fixed.
pub fn fix_relationships(table: &mut BlockTable) -> FixReport {
    let pending_resolved = table.attach_pending();
    let mut relationships_fixed = table.sync_children();
    let mut orphans_reattached = table.break_cycles();
    orphans_reattached += table.reattach_orphans();
    if orphans_reattached > 0 {
        // Reattachment rewires parents; bring the child sets back in line.
        relationships_fixed += table.sync_children();
    }
    FixReport {
        relationships_fixed,
        pending_resolved,
        orphans_reattached,
    }
}

/// Problems that [`fix_relationships`] would repair, without repairing them.
pub fn find_inconsistencies(table: &BlockTable) -> Vec<BlockId> {
    let mut parents_of: BTreeMap<BlockId, usize> = BTreeMap::new();
    for c in table.root_children() {
        *parents_of.entry(*c).or_default() += 1;
    }
    for block in table.iter() {
        for c in &block.children {
            *parents_of.entry(*c).or_default() += 1;
        }
    }

    let mut bad = Vec::new();
    for block in table.iter() {
        let listed_once = parents_of.get(&block.id) == Some(&1);
        let parent_agrees = match block.parent_id {
            Some(p) => table.children_of(p).is_some_and(|c| c.contains(&block.id)),
            None => false,
        };
        let loops = block.parent_id == Some(block.id)
            || table
                .ancestors(block.id)
                .last()
                .and_then(|top| table.get(*top))
                .is_some_and(|top| top.parent_id.is_some_and(|p| !p.is_root()));
        if !listed_once || !parent_agrees || loops {
            bad.push(block.id);
        }
    }
    bad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockKind;

    fn block(id: u32, parent: u32, start: u32, end: u32) -> BlockRecord {
        BlockRecord::new(BlockId::new(id), BlockKind::If, start, end).with_parent(BlockId::new(parent))
    }

    #[test]
    fn test_child_before_parent_is_deferred_then_resolved() {
        let mut table = BlockTable::new();
        assert_eq!(table.insert(block(2, 1, 2, 3)), 0);
        assert_eq!(table.pending_len(), 1);
        assert!(table.pending_for(BlockId::new(1)).is_some());

        assert_eq!(table.insert(block(1, 0, 1, 4)), 1);
        assert_eq!(table.pending_len(), 0);
        assert!(table.get(BlockId::new(1)).unwrap().children.contains(&BlockId::new(2)));
        assert!(table.root_children().contains(&BlockId::new(1)));
    }

    #[test]
    fn test_fix_is_idempotent() {
        let mut table = BlockTable::new();
        table.insert(block(3, 2, 3, 3));
        table.insert(block(2, 1, 2, 4));
        table.insert(block(1, 0, 1, 5));
        // Corrupt a children set behind the table's back.
        table.get_mut(BlockId::new(1)).unwrap().children.clear();

        let first = fix_relationships(&mut table);
        assert_eq!(first.relationships_fixed, 1);
        let second = fix_relationships(&mut table);
        assert_eq!(second, FixReport::default());
        assert!(find_inconsistencies(&table).is_empty());
    }

    #[test]
    fn test_missing_parent_reattached_to_root_and_flagged() {
        let mut table = BlockTable::new();
        table.insert(block(5, 9, 1, 2));
        let report = fix_relationships(&mut table);
        assert_eq!(report.orphans_reattached, 1);
        assert_eq!(table.get(BlockId::new(5)).unwrap().parent_id, Some(BlockId::ROOT));
        assert!(table.root_children().contains(&BlockId::new(5)));
        assert_eq!(table.flagged().collect::<Vec<_>>(), vec![BlockId::new(5)]);

        // The parent finally shows up: the orphan is adopted.
        assert_eq!(table.insert(block(9, 0, 1, 3)), 1);
        assert_eq!(table.get(BlockId::new(5)).unwrap().parent_id, Some(BlockId::new(9)));
        assert!(!table.root_children().contains(&BlockId::new(5)));
        assert_eq!(table.flagged().count(), 0);
    }

    #[test]
    fn test_cycle_is_broken() {
        let mut table = BlockTable::new();
        table.insert(block(1, 2, 1, 4));
        table.insert(block(2, 1, 2, 3));
        let report = fix_relationships(&mut table);
        assert!(report.orphans_reattached >= 1);
        assert!(find_inconsistencies(&table).is_empty());
        for b in table.iter() {
            assert!(!table.ancestors(b.id).contains(&b.id));
        }
    }

    #[test]
    fn test_stale_child_entry_removed() {
        let mut table = BlockTable::new();
        table.insert(block(1, 0, 1, 10));
        table.insert(block(2, 0, 11, 20));
        table.insert(block(3, 1, 2, 3));
        table.get_mut(BlockId::new(2)).unwrap().children.insert(BlockId::new(3));

        let report = fix_relationships(&mut table);
        assert_eq!(report.relationships_fixed, 1);
        assert!(table.get(BlockId::new(2)).unwrap().children.is_empty());
    }
}
