//! Console observer: prints run events as they happen.

use std::io::Write;
use std::sync::{Arc, Mutex};

use stepwise_core::{Delivery, Emitter, Error, Event, EventKind, EventPayload, SubscriptionId};
use stepwise_grammar::keys;

/// Subscribe a printer to every event under `emitter`.
///
/// With `stream`, node text is printed as it arrives, final answer
/// included; otherwise each node is printed once it completes and the
/// caller prints the answer.
pub fn attach(emitter: &Emitter, stream: bool) -> SubscriptionId {
    let last_key: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    emitter.on_all(Delivery::Blocking, move |event: Arc<Event>| {
        let rendered = {
            let mut last_key = last_key.lock().unwrap_or_else(|e| e.into_inner());
            render(&event, &mut last_key, stream)
        };
        if let Some(line) = rendered {
            match event.kind {
                EventKind::Retry | EventKind::Error => eprint!("{line}"),
                _ => {
                    print!("{line}");
                    let _ = std::io::stdout().flush();
                }
            }
        }
        futures::future::ready(Ok::<(), Error>(()))
    })
}

fn label(key: &str) -> &str {
    match key {
        keys::THOUGHT => "Thought",
        keys::TOOL_NAME => "Tool",
        keys::TOOL_INPUT => "Input",
        keys::TOOL_OUTPUT => "Observation",
        keys::FINAL_ANSWER => "Answer",
        other => other,
    }
}

/// Text to print for `event`, if any. `last_key` tracks the node being
/// streamed so a new node starts on a new line.
fn render(event: &Event, last_key: &mut Option<String>, stream: bool) -> Option<String> {
    match (&event.kind, &event.payload) {
        (EventKind::PartialUpdate, EventPayload::Node { key, delta, .. }) if stream => {
            let delta = delta.as_deref().unwrap_or_default();
            if last_key.as_deref() == Some(key.as_str()) {
                return Some(delta.to_string());
            }
            let opening = last_key.is_some();
            *last_key = Some(key.clone());
            let delta = delta.trim_start();
            Some(if opening {
                format!("\n  {} > {delta}", label(key))
            } else {
                format!("  {} > {delta}", label(key))
            })
        }
        (EventKind::Update, EventPayload::Node { key, value, .. }) => {
            if key == keys::TOOL_OUTPUT {
                let opening = last_key.take().is_some();
                let newline = if opening { "\n" } else { "" };
                return Some(format!("{newline}  {} > {value}\n", label(key)));
            }
            if stream || key == keys::FINAL_ANSWER {
                return None;
            }
            Some(format!("  {} > {value}\n", label(key)))
        }
        (EventKind::Retry, EventPayload::Retry {
            step_retries,
            total_retries,
            reason,
            ..
        }) => {
            let newline = if last_key.take().is_some() { "\n" } else { "" };
            Some(format!(
                "{newline}  [retry {step_retries}, {total_retries} total] {reason}\n"
            ))
        }
        (EventKind::Error, EventPayload::Failure { kind, message }) => {
            let newline = if last_key.take().is_some() { "\n" } else { "" };
            Some(format!("{newline}  [{kind}] {message}\n"))
        }
        (EventKind::Done, _) => {
            // Close a streamed line.
            last_key.take().map(|_| "\n".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stepwise_core::Scope;

    fn event(kind: EventKind, payload: EventPayload) -> Event {
        Event {
            scope: Scope::root().child("run-1"),
            kind,
            payload,
            success: true,
            timestamp: Utc::now(),
        }
    }

    fn node(key: &str, value: &str, delta: Option<&str>) -> EventPayload {
        EventPayload::Node {
            key: key.into(),
            value: value.into(),
            delta: delta.map(String::from),
            tool_name: None,
        }
    }

    #[test]
    fn completed_nodes_print_one_line_each() {
        let mut last = None;
        let thought = event(EventKind::Update, node("thought", "check weather", None));
        assert_eq!(
            render(&thought, &mut last, false).as_deref(),
            Some("  Thought > check weather\n")
        );
        let answer = event(EventKind::Update, node("final_answer", "Sunny", None));
        assert_eq!(render(&answer, &mut last, false), None);
        let partial = event(EventKind::PartialUpdate, node("thought", "ch", Some("ch")));
        assert_eq!(render(&partial, &mut last, false), None);
    }

    #[test]
    fn streamed_nodes_continue_then_break_lines() {
        let mut last = None;
        let out: Vec<String> = [
            event(EventKind::PartialUpdate, node("thought", "che", Some(" che"))),
            event(EventKind::PartialUpdate, node("thought", "check", Some("ck"))),
            event(EventKind::Update, node("thought", "check", None)),
            event(EventKind::PartialUpdate, node("final_answer", "Sun", Some(" Sun"))),
            event(EventKind::Done, EventPayload::Empty),
        ]
        .iter()
        .filter_map(|e| render(e, &mut last, true))
        .collect();
        assert_eq!(out.concat(), "  Thought > check\n  Answer > Sun\n");
        assert!(last.is_none());
    }

    #[test]
    fn retries_and_errors_are_reported() {
        let mut last = None;
        let retry = event(
            EventKind::Retry,
            EventPayload::Retry {
                iteration: 1,
                step_retries: 1,
                total_retries: 2,
                reason: "Tool not found: x".into(),
            },
        );
        assert_eq!(
            render(&retry, &mut last, false).as_deref(),
            Some("  [retry 1, 2 total] Tool not found: x\n")
        );
        let error = event(
            EventKind::Error,
            EventPayload::Failure {
                kind: "cancelled".into(),
                message: "Cancelled: bye".into(),
            },
        );
        assert_eq!(
            render(&error, &mut last, true).as_deref(),
            Some("  [cancelled] Cancelled: bye\n")
        );
    }
}
