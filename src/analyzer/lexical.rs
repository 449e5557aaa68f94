//! Line-by-line classifier used when no syntax tree is available.
//!
//! Each line is scanned with the context left by the previous line (are we
//! inside a `--[[ ]]` comment or a `[[ ]]` string, and at which `=` depth).
//! The scan returns a new context value rather than updating shared state,
//! so re-scanning any line from a saved context is always safe.

use crate::config::StructuralPolicy;
use crate::model::{ClassificationReason, LineClassification, LineType};

/// State carried from one line to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LexContext {
    pub in_multiline_comment: bool,
    pub in_multiline_string: bool,
    /// Number of `=` between the brackets of the open long bracket.
    pub level: usize,
}

impl LexContext {
    fn comment(level: usize) -> Self {
        Self {
            in_multiline_comment: true,
            in_multiline_string: false,
            level,
        }
    }

    fn string(level: usize) -> Self {
        Self {
            in_multiline_comment: false,
            in_multiline_string: true,
            level,
        }
    }

    pub fn is_inside(&self) -> bool {
        self.in_multiline_comment || self.in_multiline_string
    }
}

/// Words that carry no effect of their own when they stand alone on a line.
const STRUCTURAL_WORDS: &[&str] = &["end", "else", "then", "do", "repeat"];

/// Classify a single line with no carried context.
pub fn classify_line_simple(line: &str) -> LineType {
    classify_line(line, LexContext::default()).0
}

/// Classify `line` given the context left by the previous line, returning
/// the line type and the context for the next line.
pub fn classify_line(line: &str, ctx: LexContext) -> (LineType, LexContext) {
    let (line_type, _, next) = scan_line(line, ctx);
    (line_type, next)
}

/// Classify every line of a file. The first line is treated as a comment
/// when it is a `#!` shebang, which Lua skips.
pub fn classify_lines<S: AsRef<str>>(lines: &[S], policy: StructuralPolicy) -> Vec<LineClassification> {
    lines
        .iter()
        .enumerate()
        .scan(LexContext::default(), |ctx, (idx, line)| {
            let line = line.as_ref();
            if idx == 0 && line.starts_with('#') {
                return Some(LineClassification {
                    line_type: LineType::Comment,
                    executable: false,
                    reason: ClassificationReason::LineComment,
                });
            }
            let (line_type, reason, next) = scan_line(line, *ctx);
            *ctx = next;
            Some(LineClassification {
                line_type,
                executable: is_executable(line_type, policy),
                reason,
            })
        })
        .collect()
}

pub(crate) fn is_executable(line_type: LineType, policy: StructuralPolicy) -> bool {
    match line_type {
        LineType::Code => true,
        LineType::Structural => policy.is_executable(),
        LineType::Comment | LineType::Blank | LineType::StringContent => false,
    }
}

fn scan_line(line: &str, ctx: LexContext) -> (LineType, ClassificationReason, LexContext) {
    let bytes = line.as_bytes();
    let mut next = LexContext::default();
    let mut i = 0;
    let mut code = false;
    let mut structural = false;
    let mut comment = false;
    let mut block_comment = false;
    let mut string_content = false;

    if ctx.in_multiline_comment {
        comment = true;
        block_comment = true;
        match find_close(bytes, 0, ctx.level) {
            Some(end) => i = end,
            None => return (LineType::Comment, ClassificationReason::BlockComment, ctx),
        }
    } else if ctx.in_multiline_string {
        string_content = true;
        match find_close(bytes, 0, ctx.level) {
            Some(end) => i = end,
            None => return (LineType::StringContent, ClassificationReason::StringContent, ctx),
        }
    }

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if c == b'-' && bytes.get(i + 1) == Some(&b'-') {
            comment = true;
            if let Some((level, after)) = open_long_bracket(bytes, i + 2) {
                block_comment = true;
                match find_close(bytes, after, level) {
                    Some(end) => {
                        i = end;
                        continue;
                    }
                    None => {
                        next = LexContext::comment(level);
                        break;
                    }
                }
            }
            // Line comment: the rest of the line is ignored.
            break;
        }

        if c == b'"' || c == b'\'' {
            code = true;
            i = skip_quoted(bytes, i);
            continue;
        }

        if c == b'[' {
            if let Some((level, after)) = open_long_bracket(bytes, i) {
                code = true;
                match find_close(bytes, after, level) {
                    Some(end) => {
                        i = end;
                        continue;
                    }
                    None => {
                        next = LexContext::string(level);
                        break;
                    }
                }
            }
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            if STRUCTURAL_WORDS.contains(&&line[start..i]) {
                structural = true;
            } else {
                code = true;
            }
            continue;
        }

        if matches!(c, b')' | b']' | b'}' | b',' | b';') {
            structural = true;
        } else {
            code = true;
        }
        i += 1;
    }

    let (line_type, reason) = if code {
        (LineType::Code, ClassificationReason::Statement)
    } else if structural {
        (LineType::Structural, ClassificationReason::Structural)
    } else if string_content {
        (LineType::StringContent, ClassificationReason::StringContent)
    } else if comment {
        let reason = if block_comment {
            ClassificationReason::BlockComment
        } else {
            ClassificationReason::LineComment
        };
        (LineType::Comment, reason)
    } else {
        (LineType::Blank, ClassificationReason::Blank)
    };
    (line_type, reason, next)
}

/// If a long bracket (`[[`, `[=[`, ...) opens at `at`, return its level and
/// the index just past it.
fn open_long_bracket(bytes: &[u8], at: usize) -> Option<(usize, usize)> {
    if bytes.get(at) != Some(&b'[') {
        return None;
    }
    let mut j = at + 1;
    while bytes.get(j) == Some(&b'=') {
        j += 1;
    }
    if bytes.get(j) == Some(&b'[') {
        Some((j - at - 1, j + 1))
    } else {
        None
    }
}

/// Find the closing bracket of the given level at or after `from`, returning
/// the index just past it.
fn find_close(bytes: &[u8], from: usize, level: usize) -> Option<usize> {
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b']' {
            let mut j = i + 1;
            while bytes.get(j) == Some(&b'=') {
                j += 1;
            }
            if j - i - 1 == level && bytes.get(j) == Some(&b']') {
                return Some(j + 1);
            }
        }
        i += 1;
    }
    None
}

fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut j = start + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            c if c == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executable(lines: &[&str]) -> Vec<bool> {
        classify_lines(lines, StructuralPolicy::NonExecutable)
            .iter()
            .map(|c| c.executable)
            .collect()
    }

    #[test]
    fn test_multiline_comment_context() {
        let lines = ["local x=1", "--[[", "inside", "]]", "local y=2"];
        assert_eq!(executable(&lines), vec![true, false, false, false, true]);
    }

    #[test]
    fn test_equals_level_must_match() {
        let lines = ["--[==[", "]]", "still comment", "]==]", "x = 1"];
        let classes = classify_lines(&lines, StructuralPolicy::NonExecutable);
        let types: Vec<LineType> = classes.iter().map(|c| c.line_type).collect();
        assert_eq!(
            types,
            vec![
                LineType::Comment,
                LineType::Comment,
                LineType::Comment,
                LineType::Comment,
                LineType::Code
            ]
        );
    }

    #[test]
    fn test_trailing_comment_is_code() {
        assert_eq!(classify_line_simple("x = 1 -- set x"), LineType::Code);
        assert_eq!(classify_line_simple("  -- only a comment"), LineType::Comment);
        assert_eq!(classify_line_simple("   "), LineType::Blank);
    }

    #[test]
    fn test_comment_closed_on_same_line() {
        let (ty, next) = classify_line("--[[ short ]] print(1)", LexContext::default());
        assert_eq!(ty, LineType::Code);
        assert!(!next.is_inside());
    }

    #[test]
    fn test_closing_line_with_code_after() {
        let (ty, next) = classify_line("]] x = 2", LexContext::comment(0));
        assert_eq!(ty, LineType::Code);
        assert_eq!(next, LexContext::default());
    }

    #[test]
    fn test_multiline_string_assignment() {
        let lines = ["local s = [[", "text", "more", "]]", "print(s)"];
        let classes = classify_lines(&lines, StructuralPolicy::NonExecutable);
        let exec: Vec<bool> = classes.iter().map(|c| c.executable).collect();
        assert_eq!(exec, vec![true, false, false, false, true]);
        assert_eq!(classes[1].line_type, LineType::StringContent);
        assert_eq!(classes[3].line_type, LineType::StringContent);
    }

    #[test]
    fn test_comment_marker_inside_string_is_not_a_comment() {
        assert_eq!(classify_line_simple("print(\"--[[\")"), LineType::Code);
        let (_, next) = classify_line("s = '--[['", LexContext::default());
        assert!(!next.is_inside());
    }

    #[test]
    fn test_structural_policy() {
        let lines = ["if x then", "  y()", "else", "  z()", "end"];
        assert_eq!(executable(&lines), vec![true, true, false, true, false]);
        let exec: Vec<bool> = classify_lines(&lines, StructuralPolicy::Executable)
            .iter()
            .map(|c| c.executable)
            .collect();
        assert_eq!(exec, vec![true, true, true, true, true]);
    }

    #[test]
    fn test_closing_punctuation_is_structural() {
        assert_eq!(classify_line_simple("end)"), LineType::Structural);
        assert_eq!(classify_line_simple("}, "), LineType::Structural);
        assert_eq!(classify_line_simple("end -- loop"), LineType::Structural);
    }

    #[test]
    fn test_shebang_skipped() {
        let lines = ["#!/usr/bin/env lua", "print(1)"];
        assert_eq!(executable(&lines), vec![false, true]);
    }

    #[test]
    fn test_context_is_a_fresh_value() {
        let start = LexContext::default();
        let (_, inside) = classify_line("--[[", start);
        assert!(inside.in_multiline_comment);
        // Re-scanning from the saved start context yields the same result.
        let (_, again) = classify_line("--[[", start);
        assert_eq!(inside, again);
        assert!(!start.is_inside());
    }
}
