//! Source rewriting: inject tracking calls ahead of every executable
//! statement, into every `elseif`/`until` condition and at the top of every
//! function body.
//!
//! The injected calls carry the file identity, the original line number and
//! the id of the block the code runs in as literals, so the tracker never
//! has to resolve anything at run time:
//!
//! ```lua
//! __covlua.hit("/proj/a.lua", 3, 0);
//! local x = compute()
//! if x then __covlua.hit("/proj/a.lua", 4, 2); a() else __covlua.hit("/proj/a.lua", 4, 3); b() end
//! ```
//!
//! A call goes on its own line when the statement starts its line and
//! inline otherwise. Own-line calls shift everything below them; the
//! [`SourceMap`] records where each transformed line came from. Executable
//! lines that start nothing (continuations of a multi-line statement) are
//! credited to the innermost call whose statement spans them; see
//! [`HitSite::continuation`].

pub mod cache;
pub mod loader;
mod sourcemap;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::analyzer::{Analysis, Analyzer};
use crate::config::{Config, StructuralPolicy};
use crate::error::{CoverageError, Result};
use crate::model::BlockId;

pub use sourcemap::SourceMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentOptions {
    /// Global table holding the `hit` and `enter` functions.
    pub tracker_name: String,
    /// Emit `enter` calls at function bodies.
    pub track_functions: bool,
    pub structural_keywords: StructuralPolicy,
    pub parse_timeout_micros: u64,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl InstrumentOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tracker_name: config.tracker_name.clone(),
            track_functions: true,
            structural_keywords: config.structural_keywords,
            parse_timeout_micros: config.parse_timeout_micros,
        }
    }
}

/// One injected `hit` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitSite {
    pub line: u32,
    pub block: BlockId,
    /// Other executable lines the call accounts for: the continuation lines
    /// of a statement or condition spanning several lines.
    pub continuation: Vec<u32>,
}

/// Output of a transform.
#[derive(Debug, Clone, Serialize)]
pub struct Instrumented {
    pub text: String,
    pub sourcemap: SourceMap,
    pub sites: Vec<HitSite>,
    /// Original lines a `hit` call records, continuations included.
    pub hit_lines: BTreeSet<u32>,
    /// Definition lines of functions that received an `enter` call.
    pub function_lines: BTreeSet<u32>,
}

/// Analyze and transform `source` in one go.
pub fn instrument(source: &str, file_id: &str, options: &InstrumentOptions) -> Result<Instrumented> {
    let config = Config {
        structural_keywords: options.structural_keywords,
        parse_timeout_micros: options.parse_timeout_micros,
        ..Config::default()
    };
    let analysis = Analyzer::new(&config).analyze(source, file_id);
    instrument_analyzed(source, file_id, &analysis, options)
}

struct Insertion {
    byte: usize,
    text: String,
    /// Original line the inserted line precedes, when it adds a line.
    own_line: Option<u32>,
}

/// Transform `source` using an analysis computed earlier.
pub fn instrument_analyzed(
    source: &str,
    file_id: &str,
    analysis: &Analysis,
    options: &InstrumentOptions,
) -> Result<Instrumented> {
    if let Some(reason) = analysis.degraded {
        return Err(CoverageError::Instrumentation {
            file: file_id.to_string(),
            message: format!("no syntax tree ({})", reason.as_str()),
        });
    }
    if !is_lua_name(&options.tracker_name) {
        return Err(CoverageError::Instrumentation {
            file: file_id.to_string(),
            message: format!("'{}' is not a valid tracker name", options.tracker_name),
        });
    }

    let line_starts = line_starts(source);
    let file_literal = lua_quote(file_id);
    let hit_call = |line: u32, block: BlockId| {
        format!("{}.hit({}, {}, {})", options.tracker_name, file_literal, line, block.as_u32())
    };
    let mut insertions = Vec::new();
    let mut sites: Vec<HitSite> = Vec::new();
    let mut spans: Vec<(u32, u32)> = Vec::new();
    let mut seen: BTreeSet<(u32, BlockId)> = BTreeSet::new();
    let mut function_lines = BTreeSet::new();

    // Closing parens of condition sites go in before any statement call
    // at the same byte.
    for cond in &analysis.conditions {
        if !analysis.is_executable(cond.line) || !seen.insert((cond.line, cond.block)) {
            continue;
        }
        insertions.push(Insertion {
            byte: cond.start_byte,
            text: format!("({} or true) and (", hit_call(cond.line, cond.block)),
            own_line: None,
        });
        insertions.push(Insertion {
            byte: cond.end_byte,
            text: ")".to_string(),
            own_line: None,
        });
        sites.push(HitSite {
            line: cond.line,
            block: cond.block,
            continuation: Vec::new(),
        });
        spans.push((cond.line, cond.end_line));
    }

    for stmt in &analysis.statements {
        if !analysis.is_executable(stmt.line) || !seen.insert((stmt.line, stmt.block)) {
            continue;
        }
        let Some(&start) = line_starts.get(stmt.line as usize - 1) else {
            continue;
        };
        let call = format!("{};", hit_call(stmt.line, stmt.block));
        let indent = &source[start..stmt.byte];
        if indent.trim().is_empty() {
            insertions.push(Insertion {
                byte: start,
                text: format!("{indent}{call}\n"),
                own_line: Some(stmt.line),
            });
        } else {
            insertions.push(Insertion {
                byte: stmt.byte,
                text: format!("{call} "),
                own_line: None,
            });
        }
        sites.push(HitSite {
            line: stmt.line,
            block: stmt.block,
            continuation: Vec::new(),
        });
        spans.push((stmt.line, stmt.end_line));
    }

    let with_site: BTreeSet<u32> = sites.iter().map(|p| p.line).collect();
    for &line in analysis.executable.difference(&with_site) {
        // Innermost span wins; on a tie the later (nested) site does.
        let owner = spans
            .iter()
            .enumerate()
            .filter(|(_, (start, end))| (*start..=*end).contains(&line))
            .min_by(|(ia, a), (ib, b)| (a.1 - a.0).cmp(&(b.1 - b.0)).then(ib.cmp(ia)))
            .map(|(i, _)| i);
        if let Some(i) = owner {
            sites[i].continuation.push(line);
        }
    }
    let hit_lines = sites
        .iter()
        .flat_map(|p| std::iter::once(p.line).chain(p.continuation.iter().copied()))
        .collect();

    if options.track_functions {
        for body in &analysis.function_bodies {
            insertions.push(Insertion {
                byte: body.byte,
                text: format!(" {}.enter({}, {});", options.tracker_name, file_literal, body.line),
                own_line: None,
            });
            function_lines.insert(body.line);
        }
    }

    insertions.sort_by_key(|i| i.byte);

    let extra: usize = insertions.iter().map(|i| i.text.len()).sum();
    let mut text = String::with_capacity(source.len() + extra);
    let mut cursor = 0;
    let mut added: BTreeMap<u32, u32> = BTreeMap::new();
    for ins in &insertions {
        text.push_str(&source[cursor..ins.byte]);
        text.push_str(&ins.text);
        cursor = ins.byte;
        if let Some(line) = ins.own_line {
            *added.entry(line).or_default() += 1;
        }
    }
    text.push_str(&source[cursor..]);

    let mut map = Vec::with_capacity(line_starts.len() + insertions.len());
    for line in 1..=line_count(source) {
        for _ in 0..added.get(&line).copied().unwrap_or(0) {
            map.push(line);
        }
        map.push(line);
    }

    Ok(Instrumented {
        text,
        sourcemap: SourceMap::from_vec(map),
        sites,
        hit_lines,
        function_lines,
    })
}

fn line_starts(source: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(source.match_indices('\n').map(|(i, _)| i + 1))
        .filter(|i| *i < source.len() || *i == 0)
        .collect()
}

fn line_count(source: &str) -> u32 {
    source.lines().count() as u32
}

fn is_lua_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quoted Lua string literal for `s`.
fn lua_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_control() => out.push_str(&format!("\\{:03}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Instrumented {
        instrument(source, "/p/a.lua", &InstrumentOptions::default()).unwrap()
    }

    #[test]
    fn test_own_line_injection() {
        let out = run("local x = 1\n-- note\nprint(x)\n");
        assert_eq!(
            out.text,
            "__covlua.hit(\"/p/a.lua\", 1, 0);\nlocal x = 1\n-- note\n__covlua.hit(\"/p/a.lua\", 3, 0);\nprint(x)\n"
        );
        assert_eq!(out.hit_lines, BTreeSet::from([1, 3]));
        assert_eq!(out.sourcemap.original(2), Some(1));
        assert_eq!(out.sourcemap.original(5), Some(3));
        assert_eq!(out.sourcemap.transformed(3), Some(5));
    }

    #[test]
    fn test_indentation_preserved() {
        let out = run("if x then\n    y()\nend\n");
        assert!(out.text.contains("\n    __covlua.hit(\"/p/a.lua\", 2, 2);\n    y()\n"));
        assert!(!out.hit_lines.contains(&3));
    }

    #[test]
    fn test_second_statement_on_line_not_doubled() {
        let out = run("local a = 1; local b = 2\n");
        assert_eq!(out.text.matches(".hit(").count(), 1);
    }

    #[test]
    fn test_inline_after_closed_comment() {
        let out = run("--[[ c ]] x = 1\n");
        assert_eq!(out.text, "--[[ c ]] __covlua.hit(\"/p/a.lua\", 1, 0); x = 1\n");
        assert_eq!(out.sourcemap, SourceMap::identity(1));
    }

    #[test]
    fn test_function_enter() {
        let out = run("local function f(a, b)\n  return a + b\nend\n");
        assert!(out
            .text
            .contains("local function f(a, b) __covlua.enter(\"/p/a.lua\", 1);\n"));
        assert_eq!(out.function_lines, BTreeSet::from([1]));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = instrument("local = = 1\n", "/p/bad.lua", &InstrumentOptions::default()).unwrap_err();
        assert!(matches!(err, CoverageError::Instrumentation { .. }));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(lua_quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(lua_quote("x\ty"), "\"x\\009y\"");
        assert!(!is_lua_name("a.b"));
        assert!(is_lua_name("_cov1"));
    }

    #[test]
    fn test_one_line_branches_get_their_own_calls() {
        let out = run("if c then a() else b() end\n");
        let sites: Vec<(u32, u32)> = out.sites.iter().map(|p| (p.line, p.block.as_u32())).collect();
        // The `if` runs at top level; each arm reports its own block.
        assert_eq!(sites, vec![(1, 0), (1, 2), (1, 3)]);
        assert_eq!(
            out.text,
            "__covlua.hit(\"/p/a.lua\", 1, 0);\nif c then __covlua.hit(\"/p/a.lua\", 1, 2); a() \
             else __covlua.hit(\"/p/a.lua\", 1, 3); b() end\n"
        );
    }

    #[test]
    fn test_conditions_report_hits() {
        let source = "if a then\n  x()\nelseif b then\n  y()\nend\nrepeat\n  z()\nuntil done\n";
        let out = run(source);
        assert!(out
            .text
            .contains("elseif (__covlua.hit(\"/p/a.lua\", 3, 3) or true) and (b) then"));
        assert!(out.text.contains("until (__covlua.hit(\"/p/a.lua\", 8, 5) or true) and (done)\n"));
        assert!(out.hit_lines.contains(&3));
        assert!(out.hit_lines.contains(&8));
    }

    #[test]
    fn test_every_executable_line_is_reachable() {
        let source = "\
if a then
  x()
elseif b then
  y()
end
f(
  1,
  2)
repeat
  t = t + 1
until t >
  3
local g = function(v)
  return v
    + 1
end
";
        let analysis = Analyzer::new(&Config::default()).analyze(source, "/p/a.lua");
        let out = instrument_analyzed(source, "/p/a.lua", &analysis, &InstrumentOptions::default()).unwrap();
        let unreachable: Vec<u32> = analysis.executable.difference(&out.hit_lines).copied().collect();
        assert!(unreachable.is_empty(), "no hit reaches lines {unreachable:?}");

        let call = out.sites.iter().find(|p| p.line == 6).unwrap();
        assert_eq!(call.continuation, vec![7, 8]);
        let until = out.sites.iter().find(|p| p.line == 11).unwrap();
        assert_eq!(until.continuation, vec![12]);
        // The continuation of `return` belongs to the function body, not the
        // statement that defines the function.
        let ret = out.sites.iter().find(|p| p.line == 14).unwrap();
        assert_eq!(ret.continuation, vec![15]);
        assert!(out.sites.iter().find(|p| p.line == 13).unwrap().continuation.is_empty());
    }

    #[test]
    fn test_sourcemap_round_trip() {
        let source = "local t = {\n  a = 1,\n}\nfor i = 1, 2 do\n  print(i)\nend\nreturn t\n";
        let out = run(source);
        for (transformed, original) in out.sourcemap.iter() {
            let back = out.sourcemap.transformed(original).unwrap();
            assert_eq!(out.sourcemap.original(back), Some(original));
            assert!(back >= transformed);
        }
    }
}
