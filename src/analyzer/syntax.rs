//! Facts extracted from a tree-sitter Lua syntax tree: per-line token
//! classes, the block hierarchy, the function table, statement start
//! positions (for the instrumenter) and static `require` calls.

use std::collections::BTreeMap;

use serde::Serialize;
use tree_sitter::{Node, Tree};

use crate::model::{
    BlockId, BlockKind, BlockRecord, Branch, ClassificationReason, FunctionId, FunctionKind,
    FunctionRecord, LineType,
};

/// Leaf tokens that only delimit structure.
const STRUCTURAL_TOKENS: &[&str] = &["end", "else", "then", "do", "repeat", ")", "]", "}", ",", ";"];

/// Statement kinds that never produce a line event.
const INERT_STATEMENTS: &[&str] = &["comment", "empty_statement", "hash_bang_line", "label_statement"];

/// Where a statement begins, in original coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatementStart {
    pub line: u32,
    /// Last line the statement occupies.
    pub end_line: u32,
    pub byte: usize,
    /// Innermost block the statement runs in ([`BlockId::ROOT`] at top level).
    pub block: BlockId,
}

/// A condition evaluated apart from any statement start: `elseif` and
/// `until` expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConditionSpan {
    pub line: u32,
    pub end_line: u32,
    pub start_byte: usize,
    pub end_byte: usize,
    /// Block entered by evaluating the condition.
    pub block: BlockId,
}

/// Insertion point just after a function's parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BodyStart {
    /// Line the function is defined on.
    pub line: u32,
    pub byte: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SyntaxFacts {
    pub code_map: BTreeMap<u32, (LineType, ClassificationReason)>,
    /// In completion order: children come before their parents.
    pub blocks: Vec<BlockRecord>,
    pub functions: Vec<FunctionRecord>,
    pub statements: Vec<StatementStart>,
    pub conditions: Vec<ConditionSpan>,
    pub bodies: Vec<BodyStart>,
    pub requires: Vec<String>,
}

pub(crate) fn collect(tree: &Tree, source: &str) -> SyntaxFacts {
    let root = tree.root_node();
    let mut facts = SyntaxFacts::default();
    token_lines(root, &mut facts.code_map);

    let mut walker = Walker {
        source: source.as_bytes(),
        next_block: 1,
        next_function: 1,
        facts,
    };
    walker.visit(root, BlockId::ROOT);
    walker.facts
}

fn line_of(row: usize) -> u32 {
    row as u32 + 1
}

/// Last line a node occupies, ignoring a trailing newline it may swallow.
fn last_line(node: Node) -> u32 {
    let end = node.end_position();
    let start = node.start_position();
    if end.column == 0 && end.row > start.row {
        line_of(end.row - 1)
    } else {
        line_of(end.row)
    }
}

fn rank(line_type: LineType) -> u8 {
    match line_type {
        LineType::Code => 4,
        LineType::Structural => 3,
        LineType::StringContent => 2,
        LineType::Comment => 1,
        LineType::Blank => 0,
    }
}

fn mark(
    map: &mut BTreeMap<u32, (LineType, ClassificationReason)>,
    line: u32,
    line_type: LineType,
    reason: ClassificationReason,
) {
    match map.get(&line) {
        Some((existing, _)) if rank(*existing) >= rank(line_type) => {}
        _ => {
            map.insert(line, (line_type, reason));
        }
    }
}

fn token_lines(root: Node, map: &mut BTreeMap<u32, (LineType, ClassificationReason)>) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let start = line_of(node.start_position().row);
        let end = last_line(node);
        match node.kind() {
            "comment" | "hash_bang_line" => {
                for line in start..=end {
                    mark(map, line, LineType::Comment, ClassificationReason::SyntaxComment);
                }
            }
            "string" => {
                mark(map, start, LineType::Code, ClassificationReason::SyntaxCode);
                for line in start + 1..=end {
                    mark(map, line, LineType::StringContent, ClassificationReason::SyntaxString);
                }
            }
            kind if node.child_count() == 0 => {
                // Zero-width nodes are tokens the parser invented to recover.
                if node.start_byte() == node.end_byte() {
                    continue;
                }
                if STRUCTURAL_TOKENS.contains(&kind) {
                    mark(map, start, LineType::Structural, ClassificationReason::SyntaxStructural);
                } else {
                    mark(map, start, LineType::Code, ClassificationReason::SyntaxCode);
                }
            }
            _ => {
                let mut cursor = node.walk();
                stack.extend(node.children(&mut cursor));
            }
        }
    }
}

struct Walker<'s> {
    source: &'s [u8],
    next_block: u32,
    next_function: u32,
    facts: SyntaxFacts,
}

impl<'s> Walker<'s> {
    fn text(&self, node: Node) -> Option<&'s str> {
        node.utf8_text(self.source).ok()
    }

    fn alloc_block(&mut self) -> BlockId {
        let id = BlockId::new(self.next_block);
        self.next_block += 1;
        id
    }

    fn visit(&mut self, node: Node, parent: BlockId) {
        match node.kind() {
            "if_statement" => self.visit_if(node, parent),
            "for_statement" => self.visit_block(node, parent, BlockKind::For),
            "while_statement" => self.visit_block(node, parent, BlockKind::While),
            "repeat_statement" => self.visit_block(node, parent, BlockKind::Repeat),
            "do_statement" => self.visit_block(node, parent, BlockKind::Do),
            "function_declaration" | "function_definition" => self.visit_function(node, parent),
            "function_call" => {
                self.note_require(node);
                self.visit_children(node, parent);
            }
            _ => self.visit_children(node, parent),
        }
    }

    fn visit_children(&mut self, node: Node, parent: BlockId) {
        let is_body = matches!(node.kind(), "chunk" | "block");
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if is_body && child.is_named() && !INERT_STATEMENTS.contains(&child.kind()) {
                self.facts.statements.push(StatementStart {
                    line: line_of(child.start_position().row),
                    end_line: last_line(child),
                    byte: child.start_byte(),
                    block: parent,
                });
            }
            self.visit(child, parent);
        }
    }

    fn note_condition(&mut self, node: Node, block: BlockId) {
        if let Some(condition) = node.child_by_field_name("condition") {
            self.facts.conditions.push(ConditionSpan {
                line: line_of(condition.start_position().row),
                end_line: last_line(condition),
                start_byte: condition.start_byte(),
                end_byte: condition.end_byte(),
                block,
            });
        }
    }

    fn visit_block(&mut self, node: Node, parent: BlockId, kind: BlockKind) {
        let id = self.alloc_block();
        if kind == BlockKind::Repeat {
            self.note_condition(node, id);
        }
        self.visit_children(node, id);
        self.facts.blocks.push(
            BlockRecord::new(id, kind, line_of(node.start_position().row), last_line(node))
                .with_parent(parent),
        );
    }

    fn visit_branch(&mut self, body: Node, parent: BlockId, branch: Branch) {
        let id = self.alloc_block();
        self.visit(body, id);
        self.facts.blocks.push(
            BlockRecord::new(id, BlockKind::If, line_of(body.start_position().row), last_line(body))
                .with_parent(parent)
                .with_branch(branch),
        );
    }

    /// `if` owns its `then` arm; each `elseif` hangs off the conditional
    /// before it and owns its own `then` arm; `else` hangs off the last
    /// conditional.
    fn visit_if(&mut self, node: Node, parent: BlockId) {
        let if_id = self.alloc_block();
        let mut cursor = node.walk();
        let chain_end = node
            .children(&mut cursor)
            .filter(|c| matches!(c.kind(), "elseif_statement" | "else_statement"))
            .map(last_line)
            .max()
            .unwrap_or_else(|| last_line(node));

        let mut owner = if_id;
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            match child.kind() {
                "block" => self.visit_branch(child, if_id, Branch::Then),
                "elseif_statement" => {
                    let id = self.alloc_block();
                    self.note_condition(child, id);
                    let mut inner = child.walk();
                    for part in child.children(&mut inner) {
                        if part.kind() == "block" {
                            self.visit_branch(part, id, Branch::Then);
                        } else {
                            self.visit(part, id);
                        }
                    }
                    self.facts.blocks.push(
                        BlockRecord::new(id, BlockKind::If, line_of(child.start_position().row), chain_end)
                            .with_parent(owner)
                            .with_branch(Branch::ElseIf),
                    );
                    owner = id;
                }
                "else_statement" => {
                    let id = self.alloc_block();
                    self.visit_children(child, id);
                    self.facts.blocks.push(
                        BlockRecord::new(id, BlockKind::If, line_of(child.start_position().row), last_line(child))
                            .with_parent(owner)
                            .with_branch(Branch::Else),
                    );
                }
                _ => self.visit(child, if_id),
            }
        }

        self.facts.blocks.push(
            BlockRecord::new(if_id, BlockKind::If, line_of(node.start_position().row), last_line(node))
                .with_parent(parent),
        );
    }

    fn visit_function(&mut self, node: Node, parent: BlockId) {
        let block_id = self.alloc_block();
        let start_line = line_of(node.start_position().row);
        let end_line = last_line(node);
        let (name, kind) = self.function_identity(node);

        let id = FunctionId::new(self.next_function);
        self.next_function += 1;
        self.facts.functions.push(FunctionRecord {
            id,
            name,
            kind,
            start_line,
            end_line,
            executed: false,
            execution_count: 0,
        });
        if let Some(params) = node.child_by_field_name("parameters") {
            self.facts.bodies.push(BodyStart {
                line: start_line,
                byte: params.end_byte(),
            });
        }

        self.visit_children(node, block_id);
        self.facts.blocks.push(
            BlockRecord::new(block_id, BlockKind::Function, start_line, end_line).with_parent(parent),
        );
    }

    fn function_identity(&self, node: Node) -> (Option<String>, FunctionKind) {
        if node.kind() == "function_declaration" {
            let name_node = node.child_by_field_name("name");
            let name = name_node.and_then(|n| self.text(n)).map(str::to_string);
            let is_local = node.child(0).is_some_and(|c| c.kind() == "local");
            let kind = if is_local {
                FunctionKind::Local
            } else if name_node.is_some_and(|n| n.kind() == "method_index_expression") {
                FunctionKind::Method
            } else {
                FunctionKind::Global
            };
            return (name, kind);
        }
        (self.assigned_name(node), FunctionKind::Anonymous)
    }

    /// Best-effort name for `x = function() end` and `{ x = function() end }`.
    fn assigned_name(&self, node: Node) -> Option<String> {
        let parent = node.parent()?;
        match parent.kind() {
            "field" => parent
                .child_by_field_name("name")
                .and_then(|n| self.text(n))
                .map(str::to_string),
            "expression_list" => {
                let statement = parent.parent()?;
                if statement.kind() != "assignment_statement" {
                    return None;
                }
                let targets = statement.named_child(0)?;
                if targets.named_child_count() != 1 {
                    return None;
                }
                targets
                    .named_child(0)
                    .and_then(|n| self.text(n))
                    .map(str::to_string)
            }
            _ => None,
        }
    }

    fn note_require(&mut self, call: Node) {
        let Some(callee) = call.child_by_field_name("name") else {
            return;
        };
        if self.text(callee) != Some("require") {
            return;
        }
        let Some(args) = call.child_by_field_name("arguments") else {
            return;
        };
        let literal = if args.kind() == "string" {
            Some(args)
        } else {
            let mut cursor = args.walk();
            let mut named = args.named_children(&mut cursor);
            match (named.next(), named.next()) {
                (Some(only), None) if only.kind() == "string" => Some(only),
                _ => None,
            }
        };
        if let Some(name) = literal.and_then(|s| self.string_value(s)) {
            if !self.facts.requires.contains(&name) {
                self.facts.requires.push(name);
            }
        }
    }

    fn string_value(&self, node: Node) -> Option<String> {
        if let Some(content) = node.child_by_field_name("content") {
            return self.text(content).map(str::to_string);
        }
        let raw = self.text(node)?;
        let trimmed = raw.trim_matches(|c| c == '"' || c == '\'');
        (!trimmed.is_empty() && trimmed.len() < raw.len()).then(|| trimmed.to_string())
    }
}
