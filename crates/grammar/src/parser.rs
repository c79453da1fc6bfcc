//! Streaming line-grammar parser.
//!
//! Text is fed in arbitrary chunks. A line that starts with a node prefix
//! opens that node; any other line continues the node being accumulated.
//! The parser reports growth of the open node as [`ParseEvent::Partial`] and
//! each finished node as [`ParseEvent::Completed`].
//!
//! A partial line is not classified while it could still turn into a
//! (longer) prefix, so splitting the same text at different chunk
//! boundaries always yields the same completed nodes.

use serde::{Deserialize, Serialize};
use stepwise_core::SchemaError;
use tracing::debug;

use crate::grammar::Grammar;

/// A completed `(key, value)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedNode {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// The open node grew by `delta`; `value` is its trimmed content so far.
    Partial {
        key: String,
        delta: String,
        value: String,
    },
    /// A node's value is final.
    Completed(ParsedNode),
}

/// Snapshot of the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseState {
    /// Key of the node being accumulated, if any.
    pub current: Option<String>,
    /// Raw content of that node so far.
    pub buffer: String,
    pub completed: Vec<ParsedNode>,
}

impl ParseState {
    /// Value of the last completed node with this key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.completed
            .iter()
            .rev()
            .find(|n| n.key == key)
            .map(|n| n.value.as_str())
    }

    pub fn last(&self) -> Option<&ParsedNode> {
        self.completed.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineMode {
    /// Not classified yet.
    Pending,
    /// The line opened a node; further text is node content.
    Node,
    /// The line continues the open node.
    Continuation,
}

enum LineClass {
    Hold,
    Starts(usize),
    Continuation,
}

pub struct LineParser<'g> {
    grammar: &'g Grammar,
    raw: String,
    line: String,
    mode: LineMode,
    current: Option<usize>,
    buffer: String,
    completed: Vec<ParsedNode>,
    done: bool,
    failed: bool,
}

impl<'g> LineParser<'g> {
    pub fn new(grammar: &'g Grammar) -> Self {
        Self {
            grammar,
            raw: String::new(),
            line: String::new(),
            mode: LineMode::Pending,
            current: None,
            buffer: String::new(),
            completed: Vec::new(),
            done: false,
            failed: false,
        }
    }

    /// Parse a complete text in one go.
    pub fn parse(grammar: &'g Grammar, text: &str) -> Result<ParseState, SchemaError> {
        let mut parser = Self::new(grammar);
        parser.feed(text)?;
        parser.finish()
    }

    /// True once a terminal node has completed. Further input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Everything fed so far.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn feed(&mut self, chunk: &str) -> Result<Vec<ParseEvent>, SchemaError> {
        let mut events = Vec::new();
        if self.failed {
            return Err(SchemaError::new("parser already failed", self.raw.clone()));
        }
        if self.done || chunk.is_empty() {
            return Ok(events);
        }
        self.raw.push_str(chunk);

        let text = chunk.replace('\r', "");
        for piece in text.split_inclusive('\n') {
            let (content, newline) = match piece.strip_suffix('\n') {
                Some(content) => (content, true),
                None => (piece, false),
            };
            self.push_text(content, &mut events)?;
            if newline && !self.done {
                self.end_line(&mut events)?;
            }
            if self.done {
                debug!(nodes = self.completed.len(), "Terminal node completed");
                break;
            }
        }
        Ok(events)
    }

    /// Flush the last line and require the document to end in a terminal node.
    pub fn finalize(&mut self) -> Result<Vec<ParseEvent>, SchemaError> {
        let mut events = Vec::new();
        if self.failed {
            return Err(SchemaError::new("parser already failed", self.raw.clone()));
        }
        if self.done {
            return Ok(events);
        }
        if self.mode != LineMode::Pending || !self.line.is_empty() {
            self.end_line(&mut events)?;
            if self.done {
                return Ok(events);
            }
        }

        let Some(current) = self.current else {
            return Err(self.fail("the output contained no instruction lines".into()));
        };
        self.complete(&mut events);
        self.done = true;

        let grammar = self.grammar;
        let node = &grammar.nodes()[current];
        if !node.terminal {
            let expected = self.terminal_prefixes();
            return Err(self.fail(format!(
                "output ended after '{}' without a terminal line (expected one of: {})",
                node.prefix, expected
            )));
        }
        Ok(events)
    }

    /// [`finalize`](Self::finalize) and return the final state.
    pub fn finish(mut self) -> Result<ParseState, SchemaError> {
        self.finalize()?;
        Ok(self.into_state())
    }

    pub fn state(&self) -> ParseState {
        ParseState {
            current: self.current_key(),
            buffer: self.buffer.clone(),
            completed: self.completed.clone(),
        }
    }

    pub fn into_state(self) -> ParseState {
        ParseState {
            current: self.current_key(),
            buffer: self.buffer,
            completed: self.completed,
        }
    }

    fn current_key(&self) -> Option<String> {
        self.current.map(|i| self.grammar.nodes()[i].key.clone())
    }

    fn push_text(&mut self, text: &str, events: &mut Vec<ParseEvent>) -> Result<(), SchemaError> {
        match self.mode {
            LineMode::Node | LineMode::Continuation => {
                self.append(text, events);
                Ok(())
            }
            LineMode::Pending => {
                self.line.push_str(text);
                match self.classify(false) {
                    LineClass::Hold => Ok(()),
                    LineClass::Starts(index) => self.start_node(index, events),
                    LineClass::Continuation => self.continue_node(events),
                }
            }
        }
    }

    fn end_line(&mut self, events: &mut Vec<ParseEvent>) -> Result<(), SchemaError> {
        if self.mode == LineMode::Pending {
            match self.classify(true) {
                LineClass::Starts(index) => self.start_node(index, events)?,
                LineClass::Hold | LineClass::Continuation => self.continue_node(events)?,
            }
        }
        self.line.clear();
        self.mode = LineMode::Pending;
        Ok(())
    }

    /// Classify the pending line. Unless `line_complete`, hold while a
    /// longer prefix could still match.
    fn classify(&self, line_complete: bool) -> LineClass {
        let fragment = self.line.trim_start();
        let nodes = self.grammar.nodes();
        let mut best: Option<usize> = None;
        let mut extendable = false;

        for (index, node) in nodes.iter().enumerate() {
            if fragment.starts_with(&node.prefix) {
                if best.is_none_or(|b| node.prefix.len() > nodes[b].prefix.len()) {
                    best = Some(index);
                }
            } else if node.prefix.starts_with(fragment) {
                extendable = true;
            }
        }

        if extendable && !line_complete {
            return LineClass::Hold;
        }
        match best {
            Some(index) => LineClass::Starts(index),
            None => LineClass::Continuation,
        }
    }

    fn start_node(&mut self, index: usize, events: &mut Vec<ParseEvent>) -> Result<(), SchemaError> {
        let grammar = self.grammar;
        let node = &grammar.nodes()[index];

        match self.current {
            None if index != grammar.entry_index() => {
                return Err(self.fail(format!(
                    "expected the first line to start with '{}', found '{}'",
                    grammar.entry().prefix,
                    node.prefix
                )));
            }
            None => {}
            Some(current) => {
                let open = &grammar.nodes()[current];
                if open.terminal {
                    self.complete(events);
                    self.done = true;
                    return Ok(());
                }
                if !open.next.contains(&node.key) {
                    let allowed = open
                        .next
                        .iter()
                        .filter_map(|k| grammar.prefix_of(k))
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Err(self.fail(format!(
                        "'{}' cannot follow '{}' (expected one of: {})",
                        node.prefix, open.prefix, allowed
                    )));
                }
                self.complete(events);
            }
        }

        let line = std::mem::take(&mut self.line);
        let rest = &line.trim_start()[node.prefix.len()..];
        self.current = Some(index);
        self.buffer.clear();
        self.mode = LineMode::Node;
        self.append(rest, events);
        Ok(())
    }

    fn continue_node(&mut self, events: &mut Vec<ParseEvent>) -> Result<(), SchemaError> {
        let line = std::mem::take(&mut self.line);
        if self.current.is_none() {
            if line.trim().is_empty() {
                return Ok(());
            }
            let expected = self.grammar.entry().prefix.clone();
            return Err(self.fail(format!(
                "expected the first line to start with '{expected}'"
            )));
        }
        self.buffer.push('\n');
        self.mode = LineMode::Continuation;
        self.append(&line, events);
        Ok(())
    }

    fn append(&mut self, text: &str, events: &mut Vec<ParseEvent>) {
        let Some(current) = self.current else {
            return;
        };
        if text.is_empty() {
            return;
        }
        self.buffer.push_str(text);
        events.push(ParseEvent::Partial {
            key: self.grammar.nodes()[current].key.clone(),
            delta: text.to_string(),
            value: self.buffer.trim().to_string(),
        });
    }

    fn complete(&mut self, events: &mut Vec<ParseEvent>) {
        let Some(current) = self.current else {
            return;
        };
        let node = ParsedNode {
            key: self.grammar.nodes()[current].key.clone(),
            value: self.buffer.trim().to_string(),
        };
        self.buffer.clear();
        self.completed.push(node.clone());
        events.push(ParseEvent::Completed(node));
    }

    fn terminal_prefixes(&self) -> String {
        self.grammar
            .reachable()
            .into_iter()
            .filter(|n| n.terminal)
            .map(|n| n.prefix.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn fail(&mut self, message: String) -> SchemaError {
        self.failed = true;
        debug!(%message, "Output violates grammar");
        SchemaError::new(message, self.raw.clone())
    }
}
