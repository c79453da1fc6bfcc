//! Memory implementations for stepwise.
//!
//! Both keep messages in process; a run appends one message at a time and
//! reads the whole record back to render each prompt.

pub mod sliding_window;
pub mod unconstrained;

pub use sliding_window::SlidingWindowMemory;
pub use unconstrained::UnconstrainedMemory;

use std::sync::Arc;
use stepwise_core::Memory;

/// Build a memory by its configured kind (`"unconstrained"` or `"sliding"`).
pub fn from_kind(kind: &str, window: usize) -> Option<Arc<dyn Memory>> {
    match kind {
        "unconstrained" => Some(Arc::new(UnconstrainedMemory::new())),
        "sliding" => Some(Arc::new(SlidingWindowMemory::new(window))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_known_kinds() {
        assert_eq!(from_kind("unconstrained", 10).unwrap().name(), "unconstrained");
        assert_eq!(from_kind("sliding", 10).unwrap().name(), "sliding");
        assert!(from_kind("vector", 10).is_none());
    }
}
