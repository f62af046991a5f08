//! Generation counter shared between the host, the serializer and the
//! delivery path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The owning host context's generation and liveness.
///
/// A result stamped with generation `g` may only reach the host while the
/// context is alive and still on generation `g`.
#[derive(Debug, Default)]
pub(crate) struct Epoch {
    generation: AtomicU64,
    alive: AtomicBool,
}

impl Epoch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start a new generation and mark the context alive.
    pub(crate) fn begin(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.alive.store(true, Ordering::SeqCst);
        generation
    }

    /// Mark the context dead. The generation is left as is.
    pub(crate) fn end(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.is_alive() && self.generation() == generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generations_are_monotonic() {
        let epoch = Epoch::new();
        assert!(!epoch.is_alive());
        assert_eq!(epoch.begin(), 1);
        assert_eq!(epoch.begin(), 2);
        assert_eq!(epoch.generation(), 2);
    }

    #[test]
    fn test_current_requires_alive_and_matching_generation() {
        let epoch = Epoch::new();
        let g1 = epoch.begin();
        assert!(epoch.is_current(g1));

        epoch.end();
        assert!(!epoch.is_current(g1));

        let g2 = epoch.begin();
        assert!(!epoch.is_current(g1));
        assert!(epoch.is_current(g2));
    }
}
