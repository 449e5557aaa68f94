//! Plain-text views of a store for the diagnostic binary.

use std::fmt::Write;

use crate::model::{LineRecord, LineType, Summary};
use crate::store::{CoverageStore, FileRecord};

/// Whether a line can sit inside an unexecuted range without splitting it:
/// it is not real code and could never have run.
fn bridges(line: &LineRecord) -> bool {
    !line.executable && line.line_type != LineType::Code
}

/// Runs of executable lines that never ran, as inclusive `(start, end)`
/// pairs. Blank, comment, structural and string-content lines between two
/// such lines keep the run open; a line that ran closes it.
pub fn unexecuted_ranges(file: &FileRecord) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    let mut open: Option<(u32, u32)> = None;
    for (n, line) in file.lines() {
        if line.executable && !line.executed {
            open = Some(open.map_or((n, n), |(start, _)| (start, n)));
        } else if !bridges(line) {
            ranges.extend(open.take());
        }
    }
    ranges.extend(open);
    ranges
}

/// Format ranges in compact notation, e.g. "1, 3-5, 8".
#[must_use]
pub fn format_line_ranges(ranges: &[(u32, u32)]) -> String {
    ranges
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Executable lines that never ran.
pub fn unexecuted_lines(file: &FileRecord) -> Vec<u32> {
    file.lines()
        .filter(|(_, l)| l.executable && !l.executed)
        .map(|(n, _)| n)
        .collect()
}

pub fn format_summary(summary: &Summary) -> String {
    let mut out = String::new();
    writeln!(out, "Files:      {}", summary.files).unwrap();
    writeln!(
        out,
        "Executed:   {}/{} ({:.1}%)",
        summary.executed_lines,
        summary.executable_lines,
        summary.execution_rate() * 100.0
    )
    .unwrap();
    writeln!(
        out,
        "Covered:    {}/{} ({:.1}%)",
        summary.covered_lines,
        summary.executable_lines,
        summary.coverage_rate() * 100.0
    )
    .unwrap();
    if summary.total_blocks > 0 {
        writeln!(
            out,
            "Blocks:     {}/{} ({:.1}%)",
            summary.executed_blocks,
            summary.total_blocks,
            summary.block_rate() * 100.0
        )
        .unwrap();
    }
    if summary.total_functions > 0 {
        writeln!(
            out,
            "Functions:  {}/{} ({:.1}%)",
            summary.executed_functions,
            summary.total_functions,
            summary.function_rate() * 100.0
        )
        .unwrap();
    }
    out
}

/// One row per file, worst execution rate first when `sort_by_rate`.
pub fn format_files(store: &CoverageStore, sort_by_rate: bool) -> String {
    let mut rows: Vec<(&FileRecord, Summary)> = store.files().map(|f| (f, f.summary())).collect();
    if sort_by_rate {
        rows.sort_by(|a, b| a.1.execution_rate().total_cmp(&b.1.execution_rate()));
    }

    let mut out = String::new();
    writeln!(
        out,
        "{:<56} {:>9} {:>8} {:>8} {:>8}",
        "FILE", "QUALITY", "LINES", "EXEC", "RATE"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(93)).unwrap();
    for (file, s) in rows {
        let quality = if file.is_active() {
            format!("{:?}", file.quality()).to_lowercase()
        } else {
            "untracked".to_string()
        };
        writeln!(
            out,
            "{:<56} {:>9} {:>8} {:>8} {:>7.1}%",
            file.path(),
            quality,
            s.executable_lines,
            s.executed_lines,
            s.execution_rate() * 100.0
        )
        .unwrap();
    }
    out
}
