//! Event pipeline — typed publish/subscribe between a run and its observers.
//!
//! Events carry an [`EventKind`] plus the [`Scope`] of the emitter that
//! produced them. A subscription made on a scope sees events from that scope
//! and every descendant, never from siblings, so concurrent runs (and
//! concurrent fetches inside a run) sharing one pipeline do not cross-talk.
//!
//! Blocking handlers are awaited before [`Emitter::emit`] returns; this is
//! how a tool result is recorded in memory before the next prompt renders.
//! Background handlers are spawned and their failures only logged.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::error::Result;

/// All event kinds a run (or a transport call) can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Update,
    PartialUpdate,
    Message,
    Retry,
    Error,
    Success,
    Done,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Update => "update",
            EventKind::PartialUpdate => "partial_update",
            EventKind::Message => "message",
            EventKind::Retry => "retry",
            EventKind::Error => "error",
            EventKind::Success => "success",
            EventKind::Done => "done",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hierarchical emitter scope, e.g. `run-1f2e.fetch-9a0b`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope(Vec<String>);

impl Scope {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn contains(&self, other: &Scope) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Empty,

    /// A model call is about to be issued.
    Iteration { iteration: u32 },

    /// A grammar node completed (`update`) or grew (`partial_update`).
    Node {
        key: String,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
    },

    Retry {
        iteration: u32,
        step_retries: u32,
        total_retries: u32,
        reason: String,
    },

    Failure { kind: String, message: String },

    Answer { text: String },

    Request { method: String, url: String },

    Response { status: u16 },

    /// One message received over a stream.
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        data: String,
    },
}

/// An immutable event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub scope: Scope,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Dotted path: scope segments followed by the kind, e.g. `run-1.update`.
    pub fn path(&self) -> String {
        if self.scope.0.is_empty() {
            self.kind.as_str().to_string()
        } else {
            format!("{}.{}", self.scope, self.kind)
        }
    }
}

/// How the emitter treats a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Awaited in registration order; errors propagate to the emitter.
    Blocking,
    /// Spawned; errors and panics are logged and swallowed.
    Background,
}

/// Handle returned by [`Emitter::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    scope: Scope,
    kind: Option<EventKind>,
    delivery: Delivery,
    handler: Handler,
}

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    list: RwLock<Vec<Subscription>>,
}

/// A scoped view of a shared subscriber table.
///
/// Cloning is cheap; [`Emitter::child`] creates a narrower scope over the
/// same table.
#[derive(Clone)]
pub struct Emitter {
    shared: Arc<Subscribers>,
    scope: Scope,
}

impl Emitter {
    /// A fresh pipeline with an empty root scope.
    pub fn root() -> Self {
        Self {
            shared: Arc::new(Subscribers::default()),
            scope: Scope::root(),
        }
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        Self {
            shared: self.shared.clone(),
            scope: self.scope.child(segment),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Subscribe to one kind of event in this scope and its descendants.
    pub fn on<F, Fut>(&self, kind: EventKind, delivery: Delivery, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(Some(kind), delivery, handler)
    }

    /// Subscribe to every event in this scope and its descendants.
    pub fn on_all<F, Fut>(&self, delivery: Delivery, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(None, delivery, handler)
    }

    fn subscribe<F, Fut>(
        &self,
        kind: Option<EventKind>,
        delivery: Delivery,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(move |event: Arc<Event>| handler(event).boxed());
        let mut list = self.shared.list.write().unwrap_or_else(|e| e.into_inner());
        list.push(Subscription {
            id,
            scope: self.scope.clone(),
            kind,
            delivery,
            handler,
        });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut list = self.shared.list.write().unwrap_or_else(|e| e.into_inner());
        let before = list.len();
        list.retain(|s| s.id != id);
        list.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .list
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Publish an event from this scope.
    ///
    /// Returns after every matching blocking handler has completed; the
    /// first blocking handler error is returned and stops delivery.
    pub async fn emit(&self, kind: EventKind, payload: EventPayload, success: bool) -> Result<()> {
        let event = Arc::new(Event {
            scope: self.scope.clone(),
            kind,
            payload,
            success,
            timestamp: Utc::now(),
        });

        // Snapshot under the lock; handlers run without it.
        let matched: Vec<(Delivery, Handler)> = {
            let list = self.shared.list.read().unwrap_or_else(|e| e.into_inner());
            list.iter()
                .filter(|s| s.kind.is_none_or(|k| k == kind) && s.scope.contains(&event.scope))
                .map(|s| (s.delivery, s.handler.clone()))
                .collect()
        };

        for (delivery, handler) in matched {
            match delivery {
                Delivery::Blocking => handler(event.clone()).await?,
                Delivery::Background => {
                    let path = event.path();
                    let task = tokio::spawn(handler(event.clone()));
                    tokio::spawn(async move {
                        match task.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(path = %path, error = %e, "Event handler failed"),
                            Err(e) => warn!(path = %path, error = %e, "Event handler panicked"),
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::root()
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("scope", &self.scope.to_string())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
