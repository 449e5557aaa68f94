//! Static analysis of Lua source: which lines can run, which blocks and
//! functions exist, and where statements start.
//!
//! Strategy:
//!   1. Parse with tree-sitter (bounded by a timeout and a size limit)
//!   2. Derive a per-line code map from the syntax tree's tokens
//!   3. Fill every line the tree says nothing about with the lexical
//!      classifier, which is also the whole answer when parsing fails
//!
//! `analyze` never fails. A file the parser cannot handle still gets line
//! classifications; it just carries a [`Degraded`] marker and no blocks.

pub mod lexical;
mod syntax;

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};
use tree_sitter::Parser;

use crate::blocks::{fix_relationships, BlockTable, FixReport};
use crate::config::{Config, StructuralPolicy};
use crate::error::CoverageError;
use crate::model::{FunctionRecord, LineClassification};

pub use lexical::{classify_line, classify_line_simple, classify_lines, LexContext};
pub use syntax::{BodyStart, ConditionSpan, StatementStart};

/// Why a file was classified without a syntax tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degraded {
    ParseError,
    Timeout,
    TooLarge,
    NoGrammar,
}

impl Degraded {
    pub fn as_str(&self) -> &'static str {
        match self {
            Degraded::ParseError => "parse error",
            Degraded::Timeout => "parse timeout",
            Degraded::TooLarge => "file too large",
            Degraded::NoGrammar => "grammar unavailable",
        }
    }
}

/// Everything the analyzer knows about one file.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub file_id: String,
    /// Indexed by line number - 1.
    pub lines: Vec<LineClassification>,
    pub blocks: BlockTable,
    pub functions: Vec<FunctionRecord>,
    pub executable: BTreeSet<u32>,
    pub statements: Vec<StatementStart>,
    pub conditions: Vec<ConditionSpan>,
    pub function_bodies: Vec<BodyStart>,
    /// Module names passed as literals to `require`.
    pub requires: Vec<String>,
    pub degraded: Option<Degraded>,
    /// What the block resolver had to repair while building `blocks`.
    pub block_fixes: FixReport,
}

impl Analysis {
    pub fn parsed(&self) -> bool {
        self.degraded.is_none()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn classification(&self, line: u32) -> Option<&LineClassification> {
        line.checked_sub(1).and_then(|i| self.lines.get(i as usize))
    }

    pub fn is_executable(&self, line: u32) -> bool {
        self.executable.contains(&line)
    }
}

pub struct Analyzer {
    parser: Option<Parser>,
    policy: StructuralPolicy,
    timeout_micros: u64,
    max_file_bytes: usize,
}

impl Analyzer {
    pub fn new(config: &Config) -> Self {
        let mut parser = Parser::new();
        let parser = match parser.set_language(&tree_sitter_lua::LANGUAGE.into()) {
            Ok(()) => {
                parser.set_timeout_micros(config.parse_timeout_micros);
                Some(parser)
            }
            Err(e) => {
                warn!(error = %e, "Lua grammar rejected by tree-sitter; using lexical classification only");
                None
            }
        };
        Self {
            parser,
            policy: config.structural_keywords,
            timeout_micros: config.parse_timeout_micros,
            max_file_bytes: config.max_file_bytes,
        }
    }

    pub fn policy(&self) -> StructuralPolicy {
        self.policy
    }

    pub fn timeout_micros(&self) -> u64 {
        self.timeout_micros
    }

    /// Classify `source`. Never fails; see the module docs.
    pub fn analyze(&mut self, source: &str, file_id: &str) -> Analysis {
        let lines: Vec<&str> = source.lines().collect();
        let mut classes = classify_lines(&lines, self.policy);

        let (facts, degraded) = match self.parse(source, file_id) {
            Ok(facts) => (Some(facts), None),
            Err(reason) => (None, Some(reason)),
        };

        let mut blocks = BlockTable::new();
        let mut block_fixes = FixReport::default();
        let mut functions = Vec::new();
        let mut statements = Vec::new();
        let mut conditions = Vec::new();
        let mut function_bodies = Vec::new();
        let mut requires = Vec::new();

        if let Some(facts) = facts {
            for (line, (line_type, reason)) in &facts.code_map {
                if let Some(class) = classes.get_mut(*line as usize - 1) {
                    *class = LineClassification {
                        line_type: *line_type,
                        executable: lexical::is_executable(*line_type, self.policy),
                        reason: *reason,
                    };
                }
            }

            // Blocks arrive children-first; the table defers them until
            // their parents show up.
            for block in facts.blocks {
                block_fixes.pending_resolved += blocks.insert(block);
            }
            block_fixes.absorb(fix_relationships(&mut blocks));
            if block_fixes.orphans_reattached > 0 {
                let err = CoverageError::RelationshipInconsistency {
                    file: file_id.to_string(),
                    block: 0,
                    message: format!("{} block(s) reattached to root", block_fixes.orphans_reattached),
                };
                warn!(file = file_id, phase = err.phase(), "{err}");
            }

            functions = facts.functions;
            statements = facts.statements;
            conditions = facts.conditions;
            function_bodies = facts.bodies;
            requires = facts.requires;
        }

        let executable = classes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.executable)
            .map(|(i, _)| i as u32 + 1)
            .collect();

        Analysis {
            file_id: file_id.to_string(),
            lines: classes,
            blocks,
            functions,
            executable,
            statements,
            conditions,
            function_bodies,
            requires,
            degraded,
            block_fixes,
        }
    }

    fn parse(&mut self, source: &str, file_id: &str) -> Result<syntax::SyntaxFacts, Degraded> {
        if source.len() > self.max_file_bytes {
            debug!(file = file_id, bytes = source.len(), "skipping parser for large file");
            return Err(Degraded::TooLarge);
        }
        let Some(parser) = self.parser.as_mut() else {
            return Err(Degraded::NoGrammar);
        };

        let Some(tree) = parser.parse(source, None) else {
            // A cancelled parse leaves state behind that must be cleared.
            parser.reset();
            let err = CoverageError::Analysis {
                file: file_id.to_string(),
                message: format!("parse exceeded {}us", self.timeout_micros),
            };
            warn!(file = file_id, phase = err.phase(), "{err}; falling back to lexical classification");
            return Err(Degraded::Timeout);
        };

        if tree.root_node().has_error() {
            let err = CoverageError::Analysis {
                file: file_id.to_string(),
                message: "syntax error".to_string(),
            };
            debug!(file = file_id, phase = err.phase(), "{err}; falling back to lexical classification");
            return Err(Degraded::ParseError);
        }

        Ok(syntax::collect(&tree, source))
    }
}
