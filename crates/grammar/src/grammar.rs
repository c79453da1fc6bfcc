//! Grammar tables: which line prefixes exist, which are terminal, and which
//! may follow which.
//!
//! A dialect is just a different table fed to the same parser.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Node keys the orchestrator relies on.
pub mod keys {
    pub const THOUGHT: &str = "thought";
    pub const TOOL_NAME: &str = "tool_name";
    pub const TOOL_INPUT: &str = "tool_input";
    pub const TOOL_OUTPUT: &str = "tool_output";
    pub const FINAL_ANSWER: &str = "final_answer";
}

/// One kind of instruction line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrammarNode {
    pub key: String,

    /// Text a line starts with, e.g. `Thought:`
    pub prefix: String,

    /// Completing this node ends the document.
    #[serde(default)]
    pub terminal: bool,

    /// Keys of the nodes allowed to follow this one.
    #[serde(default)]
    pub next: Vec<String>,
}

impl GrammarNode {
    pub fn new(key: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prefix: prefix.into(),
            terminal: false,
            next: Vec::new(),
        }
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn next(mut self, keys: &[&str]) -> Self {
        self.next = keys.iter().map(|k| k.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrammarError {
    #[error("grammar has no nodes")]
    Empty,

    #[error("duplicate node key '{0}'")]
    DuplicateKey(String),

    #[error("duplicate prefix '{0}'")]
    DuplicatePrefix(String),

    #[error("node '{0}' has a blank prefix or one starting with whitespace")]
    InvalidPrefix(String),

    #[error("entry node '{0}' is not defined")]
    UnknownEntry(String),

    #[error("node '{from}' lists unknown successor '{to}'")]
    UnknownSuccessor { from: String, to: String },

    #[error("grammar has no terminal node")]
    NoTerminal,

    #[error("terminal node '{0}' must not have successors")]
    TerminalWithSuccessors(String),

    #[error("node '{0}' cannot reach a terminal node")]
    Unterminated(String),
}

/// An ordered, validated set of grammar nodes with one entry node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Grammar {
    entry: usize,
    nodes: Vec<GrammarNode>,
}

impl Grammar {
    /// Build and validate a grammar.
    pub fn new(entry: &str, nodes: Vec<GrammarNode>) -> Result<Self, GrammarError> {
        if nodes.is_empty() {
            return Err(GrammarError::Empty);
        }

        let mut seen_keys = HashSet::new();
        let mut seen_prefixes = HashSet::new();
        for node in &nodes {
            if !seen_keys.insert(node.key.as_str()) {
                return Err(GrammarError::DuplicateKey(node.key.clone()));
            }
            if node.prefix.trim().is_empty() || node.prefix.trim_start() != node.prefix {
                return Err(GrammarError::InvalidPrefix(node.key.clone()));
            }
            if !seen_prefixes.insert(node.prefix.as_str()) {
                return Err(GrammarError::DuplicatePrefix(node.prefix.clone()));
            }
        }

        let entry = nodes
            .iter()
            .position(|n| n.key == entry)
            .ok_or_else(|| GrammarError::UnknownEntry(entry.to_string()))?;

        for node in &nodes {
            if let Some(to) = node.next.iter().find(|k| !seen_keys.contains(k.as_str())) {
                return Err(GrammarError::UnknownSuccessor {
                    from: node.key.clone(),
                    to: to.clone(),
                });
            }
            if node.terminal && !node.next.is_empty() {
                return Err(GrammarError::TerminalWithSuccessors(node.key.clone()));
            }
        }

        if !nodes.iter().any(|n| n.terminal) {
            return Err(GrammarError::NoTerminal);
        }

        // Fixed point: a node terminates if it is terminal or has a terminating successor.
        let mut terminates: HashSet<&str> = nodes
            .iter()
            .filter(|n| n.terminal)
            .map(|n| n.key.as_str())
            .collect();
        loop {
            let before = terminates.len();
            for node in &nodes {
                if node.next.iter().any(|k| terminates.contains(k.as_str())) {
                    terminates.insert(node.key.as_str());
                }
            }
            if terminates.len() == before {
                break;
            }
        }
        if let Some(stuck) = nodes.iter().find(|n| !terminates.contains(n.key.as_str())) {
            return Err(GrammarError::Unterminated(stuck.key.clone()));
        }

        Ok(Self { entry, nodes })
    }

    /// The default dialect.
    pub fn react() -> Self {
        use keys::*;
        Self {
            entry: 0,
            nodes: vec![
                GrammarNode::new(THOUGHT, "Thought:").next(&[THOUGHT, TOOL_NAME, FINAL_ANSWER]),
                GrammarNode::new(TOOL_NAME, "Function Name:").next(&[TOOL_INPUT]),
                GrammarNode::new(TOOL_INPUT, "Function Input:").terminal(),
                GrammarNode::new(TOOL_OUTPUT, "Function Output:").terminal(),
                GrammarNode::new(FINAL_ANSWER, "Final Answer:").terminal(),
            ],
        }
    }

    /// The dialect used with Granite models.
    pub fn granite() -> Self {
        use keys::*;
        Self {
            entry: 0,
            nodes: vec![
                GrammarNode::new(THOUGHT, "Thought:").next(&[TOOL_NAME, FINAL_ANSWER]),
                GrammarNode::new(TOOL_NAME, "Tool Name:").next(&[TOOL_INPUT]),
                GrammarNode::new(TOOL_INPUT, "Tool Input:").terminal(),
                GrammarNode::new(TOOL_OUTPUT, "Tool Output:").terminal(),
                GrammarNode::new(FINAL_ANSWER, "Final Answer:").terminal(),
            ],
        }
    }

    /// Look up a built-in dialect by name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "react" => Some(Self::react()),
            "granite" => Some(Self::granite()),
            _ => None,
        }
    }

    pub fn entry(&self) -> &GrammarNode {
        &self.nodes[self.entry]
    }

    pub(crate) fn entry_index(&self) -> usize {
        self.entry
    }

    pub fn nodes(&self) -> &[GrammarNode] {
        &self.nodes
    }

    pub fn node(&self, key: &str) -> Option<&GrammarNode> {
        self.nodes.iter().find(|n| n.key == key)
    }

    pub fn prefix_of(&self, key: &str) -> Option<&str> {
        self.node(key).map(|n| n.prefix.as_str())
    }

    pub fn is_terminal(&self, key: &str) -> bool {
        self.node(key).is_some_and(|n| n.terminal)
    }

    /// Nodes a document can reach from the entry node, in table order.
    /// Nodes only the runtime writes, like a tool's output, are left out.
    pub fn reachable(&self) -> Vec<&GrammarNode> {
        let mut seen = vec![false; self.nodes.len()];
        seen[self.entry] = true;
        let mut pending = vec![self.entry];
        while let Some(index) = pending.pop() {
            for key in &self.nodes[index].next {
                let Some(next) = self.nodes.iter().position(|n| &n.key == key) else {
                    continue;
                };
                if !seen[next] {
                    seen[next] = true;
                    pending.push(next);
                }
            }
        }
        self.nodes
            .iter()
            .zip(seen)
            .filter_map(|(node, seen)| seen.then_some(node))
            .collect()
    }
}
