//! # stepwise core
//!
//! Domain types, traits, and error definitions for the stepwise
//! agent-execution engine. This crate has **no HTTP or storage dependencies**;
//! it defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the orchestrator (LLM backend, tool, memory) is a
//! trait here. Implementations live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted mock implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod cancel;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use cancel::AbortSignal;
pub use error::{
    BudgetKind, Error, MemoryError, Result, SchemaError, ToolError, TransportError,
};
pub use event::{Delivery, Emitter, Event, EventKind, EventPayload, Scope, SubscriptionId};
pub use memory::Memory;
pub use message::{Message, Role};
pub use provider::{
    ChunkStream, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage,
};
pub use tool::{Tool, ToolCallRequest, ToolCallResult, ToolOutput, ToolRegistry};
