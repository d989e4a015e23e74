//! Monotonic time-ordered ID generation.
//!
//! ULIDs issued within the same millisecond are strictly increasing (the
//! random component increments), so ids sort by creation order everywhere
//! they are used: Pulse runs, Mesh manifests, Relay envelopes, trace spans.

use std::sync::Mutex;
use ulid::{Generator, Ulid};

pub struct IdGenerator {
    inner: Mutex<Generator>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Issue the next id. Falls back to a fresh ULID in the (practically
    /// unreachable) case the per-millisecond random space overflows.
    pub fn next(&self) -> String {
        let mut generator = self.inner.lock().unwrap();
        generator
            .generate()
            .unwrap_or_else(|_| Ulid::new())
            .to_string()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let ids = IdGenerator::new();
        let mut previous = ids.next();
        // Enough iterations to guarantee same-millisecond collisions.
        for _ in 0..10_000 {
            let next = ids.next();
            assert!(next > previous, "{next} should sort after {previous}");
            previous = next;
        }
    }

    #[test]
    fn ids_are_valid_ulids() {
        let ids = IdGenerator::new();
        let id = ids.next();
        assert_eq!(id.len(), 26);
        assert!(Ulid::from_string(&id).is_ok());
    }
}
