//! Assertion linkage: promote executed lines on an assertion's call stack
//! to covered.

use serde::{Deserialize, Serialize};

use crate::store::CoverageStore;

/// One stack frame captured when an assertion evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Chunk identifier or path, as the host reports it.
    pub file: String,
    /// Line as the running program sees it (transformed, if instrumented).
    pub line: u32,
}

impl Frame {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub covered: usize,
    /// Frames that could not be translated, or whose line was not both
    /// executed and executable.
    pub skipped: usize,
}

/// Mark every frame's original line as covered. `translate` maps a frame to
/// `(normalized path, original line)`; frames it rejects are skipped.
pub fn link_assertion<F>(store: &mut CoverageStore, frames: &[Frame], mut translate: F) -> LinkReport
where
    F: FnMut(&Frame) -> Option<(String, u32)>,
{
    let mut report = LinkReport::default();
    for frame in frames {
        match translate(frame) {
            Some((path, line)) if store.mark_covered(&path, line) => report.covered += 1,
            _ => report.skipped += 1,
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::config::Config;

    const PATH: &str = "/p/t.lua";

    fn store() -> CoverageStore {
        let src = "local n = 0\nfor i = 1, 3 do\n  n = n + i\nend\nassert(n == 6)\n";
        let analysis = Analyzer::new(&Config::default()).analyze(src, PATH);
        let mut store = CoverageStore::new();
        store.register_file(PATH, src, &analysis);
        store
    }

    #[test]
    fn test_covered_without_touching_counts() {
        let mut store = store();
        for _ in 0..3 {
            store.mark_executed(PATH, 3);
        }
        let frames = [Frame::new(PATH, 3)];
        let report = link_assertion(&mut store, &frames, |f| Some((f.file.clone(), f.line)));
        assert_eq!(report, LinkReport { covered: 1, skipped: 0 });

        let line = store.file(PATH).unwrap().line(3).unwrap();
        assert!(line.covered);
        assert_eq!(line.execution_count, 3);
    }

    #[test]
    fn test_unexecuted_and_untranslatable_frames_skipped() {
        let mut store = store();
        let frames = [Frame::new(PATH, 5), Frame::new("=stdin", 1), Frame::new("/p/other.lua", 1)];
        let report = link_assertion(&mut store, &frames, |f| {
            f.file.starts_with('/').then(|| (f.file.clone(), f.line))
        });
        assert_eq!(report, LinkReport { covered: 0, skipped: 3 });
        assert!(!store.file(PATH).unwrap().line(5).unwrap().covered);
    }
}
