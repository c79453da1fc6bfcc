//! # stepwise grammar
//!
//! Data-driven line grammars and the incremental parser that turns streamed
//! model output into typed instruction nodes.
//!
//! ```
//! use stepwise_grammar::{Grammar, LineParser, keys};
//!
//! let grammar = Grammar::react();
//! let state = LineParser::parse(&grammar, "Thought: easy\nFinal Answer: 4").unwrap();
//! assert_eq!(state.get(keys::FINAL_ANSWER), Some("4"));
//! ```

pub mod grammar;
pub mod parser;

pub use grammar::{Grammar, GrammarError, GrammarNode, keys};
pub use parser::{LineParser, ParseEvent, ParseState, ParsedNode};
