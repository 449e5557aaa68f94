//! Record types shared by the analyzer, both collectors and the store.
//!
//! Nothing here enforces the coverage invariants on its own; the store's
//! accessors do. These are plain data.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Compute a coverage rate, returning 0.0 when the total is zero.
#[must_use]
pub fn rate(hit: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        hit as f64 / total as f64
    }
}

/// What a source line holds, as far as coverage is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    Code,
    Comment,
    Blank,
    /// Nothing but block keywords or closing punctuation (`end`, `else`, `})`).
    Structural,
    /// Interior or closing line of a multi-line string literal.
    StringContent,
}

impl LineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineType::Code => "code",
            LineType::Comment => "comment",
            LineType::Blank => "blank",
            LineType::Structural => "structural",
            LineType::StringContent => "string",
        }
    }
}

impl fmt::Display for LineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a line was classified the way it was. Kept for diagnostic tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationReason {
    /// A syntax tree token starts a statement or expression on this line.
    SyntaxCode,
    /// The syntax tree only has comment tokens on this line.
    SyntaxComment,
    /// The line lies inside a multi-line string token.
    SyntaxString,
    /// The syntax tree only has block keywords on this line.
    SyntaxStructural,
    Blank,
    LineComment,
    /// Inside, opening or closing a `--[[ ]]` comment.
    BlockComment,
    StringContent,
    Structural,
    /// Lexical scan found a statement.
    Statement,
    /// Recorded from an execution hit before any analysis was available.
    ObservedHit,
}

/// Output of the analyzer for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineClassification {
    pub line_type: LineType,
    pub executable: bool,
    pub reason: ClassificationReason,
}

/// Coverage state of a single line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
    pub executable: bool,
    pub executed: bool,
    pub covered: bool,
    pub execution_count: u64,
    pub line_type: LineType,
    pub reason: ClassificationReason,
    /// Created from a hit without analysis; the classification pass settles it.
    pub provisional: bool,
}

impl LineRecord {
    pub(crate) fn from_classification(class: LineClassification) -> Self {
        Self {
            executable: class.executable,
            executed: false,
            covered: false,
            execution_count: 0,
            line_type: class.line_type,
            reason: class.reason,
            provisional: false,
        }
    }

    pub(crate) fn provisional() -> Self {
        Self {
            executable: true,
            executed: false,
            covered: false,
            execution_count: 0,
            line_type: LineType::Code,
            reason: ClassificationReason::ObservedHit,
            provisional: true,
        }
    }
}

/// Arena index of a block within one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(u32);

impl BlockId {
    /// Synthetic parent of every top-level block. Never stored as a record.
    pub const ROOT: BlockId = BlockId(0);

    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("root")
        } else {
            write!(f, "b{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Function,
    If,
    For,
    While,
    Do,
    Repeat,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Function => "function",
            BlockKind::If => "if",
            BlockKind::For => "for",
            BlockKind::While => "while",
            BlockKind::Do => "do",
            BlockKind::Repeat => "repeat",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which arm of an `if` chain an `If` block stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Then,
    ElseIf,
    Else,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: BlockId,
    pub kind: BlockKind,
    pub branch: Option<Branch>,
    pub start_line: u32,
    pub end_line: u32,
    /// `None` until a parent is known; `Some(BlockId::ROOT)` at top level.
    pub parent_id: Option<BlockId>,
    pub children: std::collections::BTreeSet<BlockId>,
    pub executed: bool,
    pub execution_count: u64,
}

impl BlockRecord {
    #[must_use]
    pub fn new(id: BlockId, kind: BlockKind, start_line: u32, end_line: u32) -> Self {
        Self {
            id,
            kind,
            branch: None,
            start_line,
            end_line,
            parent_id: None,
            children: Default::default(),
            executed: false,
            execution_count: 0,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent: BlockId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    #[must_use]
    pub fn with_branch(mut self, branch: Branch) -> Self {
        self.branch = Some(branch);
        self
    }

    #[must_use]
    pub fn contains_line(&self, line: u32) -> bool {
        (self.start_line..=self.end_line).contains(&line)
    }

    /// Lines whose execution counts as executing this block. A function's
    /// header runs when the closure is created, not when it is called, so it
    /// belongs to the enclosing block.
    #[must_use]
    pub fn owns_line(&self, line: u32) -> bool {
        if self.kind == BlockKind::Function && self.end_line > self.start_line {
            line > self.start_line && line <= self.end_line
        } else {
            self.contains_line(line)
        }
    }

    #[must_use]
    pub fn span(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line)
    }
}

/// Index of a function within one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(u32);

impl FunctionId {
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Global,
    Local,
    Method,
    Anonymous,
}

impl FunctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionKind::Global => "global",
            FunctionKind::Local => "local",
            FunctionKind::Method => "method",
            FunctionKind::Anonymous => "anonymous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub id: FunctionId,
    pub name: Option<String>,
    pub kind: FunctionKind,
    pub start_line: u32,
    pub end_line: u32,
    pub executed: bool,
    pub execution_count: u64,
}

/// How much the tracked data of a file can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageQuality {
    /// Classified from a syntax tree.
    #[default]
    Full,
    /// Classified by the lexical fallback (parse error, timeout, size).
    Heuristic,
    /// Instrumentation failed or source was unavailable; nothing reliable.
    Untracked,
}

/// Aggregate counts for a file or for the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub files: u64,
    pub executable_lines: u64,
    pub executed_lines: u64,
    pub covered_lines: u64,
    pub total_blocks: u64,
    pub executed_blocks: u64,
    pub total_functions: u64,
    pub executed_functions: u64,
}

impl Summary {
    #[must_use]
    pub fn execution_rate(&self) -> f64 {
        rate(self.executed_lines, self.executable_lines)
    }

    #[must_use]
    pub fn coverage_rate(&self) -> f64 {
        rate(self.covered_lines, self.executable_lines)
    }

    #[must_use]
    pub fn block_rate(&self) -> f64 {
        rate(self.executed_blocks, self.total_blocks)
    }

    #[must_use]
    pub fn function_rate(&self) -> f64 {
        rate(self.executed_functions, self.total_functions)
    }

    pub(crate) fn absorb(&mut self, other: &Summary) {
        self.files += other.files;
        self.executable_lines += other.executable_lines;
        self.executed_lines += other.executed_lines;
        self.covered_lines += other.covered_lines;
        self.total_blocks += other.total_blocks;
        self.executed_blocks += other.executed_blocks;
        self.total_functions += other.total_functions;
        self.executed_functions += other.executed_functions;
    }
}
