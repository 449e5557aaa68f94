//! Post-run correction of line records against the static analysis.
//!
//! Heuristic sources (provisional hits, lexical fallback, hosts that report
//! `end` lines) can leave `executed` on lines that cannot run. This pass
//! clears those marks. It only ever lowers flags.

use crate::analyzer::Analysis;
use crate::model::{ClassificationReason, LineType};
use crate::store::FileRecord;

/// Settle `file` against `analysis`. Returns the number of lines changed.
pub fn reclassify(file: &mut FileRecord, analysis: &Analysis) -> usize {
    let numbers: Vec<u32> = file.lines().map(|(n, _)| n).collect();
    let mut changed = 0;

    for n in numbers {
        let class = analysis.classification(n).copied();
        let Some(record) = file.line_mut(n) else {
            continue;
        };
        let before = record.clone();

        match class {
            Some(class) => {
                if record.provisional {
                    record.executable = class.executable;
                    record.line_type = class.line_type;
                    record.reason = class.reason;
                    record.provisional = false;
                }
                if !class.executable && (record.executed || record.covered) {
                    record.executed = false;
                    record.covered = false;
                    record.execution_count = 0;
                    record.line_type = class.line_type;
                    record.reason = class.reason;
                }
            }
            // Past the end of the file: nothing there can run.
            None => {
                record.executable = false;
                record.executed = false;
                record.covered = false;
                record.execution_count = 0;
                record.line_type = LineType::Blank;
                record.reason = ClassificationReason::Blank;
                record.provisional = false;
            }
        }

        if record.covered && !record.executed {
            record.covered = false;
        }
        if *record != before {
            changed += 1;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::config::Config;
    use crate::store::CoverageStore;

    const PATH: &str = "/p/a.lua";
    const SRC: &str = "local x = 1\nif x then\n  print(x)\nend\n";

    fn setup() -> (CoverageStore, Analysis) {
        let analysis = Analyzer::new(&Config::default()).analyze(SRC, PATH);
        let mut store = CoverageStore::new();
        store.register_file(PATH, SRC, &analysis);
        (store, analysis)
    }

    #[test]
    fn test_clears_marks_on_non_executable_lines() {
        let (mut store, analysis) = setup();
        store.mark_executed(PATH, 3);
        store.mark_executed(PATH, 4);
        let file = store.file_mut(PATH).unwrap();
        assert_eq!(reclassify(file, &analysis), 1);

        let file = store.file(PATH).unwrap();
        assert!(file.line(3).unwrap().executed);
        let end = file.line(4).unwrap();
        assert!(!end.executed);
        assert_eq!(end.execution_count, 0);
        assert_eq!(end.line_type, LineType::Structural);
        assert!(store.check_invariants().is_empty());
    }

    #[test]
    fn test_never_raises_executed() {
        let (mut store, analysis) = setup();
        reclassify(store.file_mut(PATH).unwrap(), &analysis);
        assert!(store.file(PATH).unwrap().lines().all(|(_, l)| !l.executed));
    }

    #[test]
    fn test_settles_provisional_lines() {
        let mut store = CoverageStore::new();
        store.register_unanalyzed(PATH);
        store.mark_executed(PATH, 1);
        store.mark_executed(PATH, 4);
        store.mark_executed(PATH, 9);

        let analysis = Analyzer::new(&Config::default()).analyze(SRC, PATH);
        store.register_file(PATH, SRC, &analysis);
        reclassify(store.file_mut(PATH).unwrap(), &analysis);

        let file = store.file(PATH).unwrap();
        assert!(!file.has_provisional_lines());
        assert!(file.line(1).unwrap().executed);
        assert!(!file.line(4).unwrap().executed);
        assert!(!file.line(9).unwrap().executable);
        assert!(store.check_invariants().is_empty());
    }

    #[test]
    fn test_idempotent() {
        let (mut store, analysis) = setup();
        store.mark_executed(PATH, 4);
        assert_eq!(reclassify(store.file_mut(PATH).unwrap(), &analysis), 1);
        assert_eq!(reclassify(store.file_mut(PATH).unwrap(), &analysis), 0);
    }
}
