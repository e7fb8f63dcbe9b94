//! Live request table: request id → start time and cancellation signal.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capability::Capability;

struct Tracked {
    generation: u64,
    capability: Capability,
    started: Instant,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct RequestTracker {
    active: DashMap<String, Tracked>,
    generations: AtomicU64,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `request_id`. Returns `None`, and logs, when the id is
    /// already live. The returned generation ties `finish` to this
    /// registration so a reused id is never deregistered by a stale owner.
    pub fn register(
        &self,
        request_id: &str,
        capability: Capability,
        cancel: CancellationToken,
    ) -> Option<u64> {
        match self.active.entry(request_id.to_string()) {
            Entry::Occupied(existing) => {
                warn!(
                    "Duplicate start for live request {} ({}, running for {:?})",
                    request_id,
                    existing.get().capability,
                    existing.get().started.elapsed()
                );
                None
            }
            Entry::Vacant(slot) => {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                slot.insert(Tracked {
                    generation,
                    capability,
                    started: Instant::now(),
                    cancel,
                });
                debug!("Tracking request {} ({})", request_id, capability);
                Some(generation)
            }
        }
    }

    /// Deregister after a terminal result. Returns how long the request ran.
    pub fn finish(&self, request_id: &str, generation: u64) -> Option<Duration> {
        match self.active.remove_if(request_id, |_, t| t.generation == generation) {
            Some((_, tracked)) => Some(tracked.started.elapsed()),
            None => {
                warn!("Deregistering unknown request {}", request_id);
                None
            }
        }
    }

    /// Signal cancellation and deregister. Only the first call for a live
    /// request returns true.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.active.remove(request_id) {
            Some((_, tracked)) => {
                tracked.cancel.cancel();
                true
            }
            None => {
                debug!("Cancel for untracked request {}", request_id);
                false
            }
        }
    }

    pub fn is_tracked(&self, request_id: &str) -> bool {
        self.active.contains_key(request_id)
    }

    pub fn active_requests(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_finish() {
        let tracker = RequestTracker::new();
        let generation = tracker
            .register("r1", Capability::TextGeneration, CancellationToken::new())
            .unwrap();
        assert!(tracker.is_tracked("r1"));
        assert!(tracker.finish("r1", generation).is_some());
        assert!(tracker.is_empty());
        assert!(tracker.finish("r1", generation).is_none());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let tracker = RequestTracker::new();
        assert!(tracker
            .register("r1", Capability::TextGeneration, CancellationToken::new())
            .is_some());
        assert!(tracker
            .register("r1", Capability::SpeechToText, CancellationToken::new())
            .is_none());
        assert_eq!(tracker.active_requests(), vec!["r1".to_string()]);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let tracker = RequestTracker::new();
        let token = CancellationToken::new();
        tracker.register("r1", Capability::TextGeneration, token.clone());

        assert!(tracker.cancel("r1"));
        assert!(token.is_cancelled());
        assert!(!tracker.is_tracked("r1"));
        assert!(!tracker.cancel("r1"));
        assert!(!tracker.cancel("never-seen"));
    }

    #[test]
    fn test_stale_generation_does_not_remove_new_owner() {
        let tracker = RequestTracker::new();
        let first = tracker
            .register("r1", Capability::TextGeneration, CancellationToken::new())
            .unwrap();
        assert!(tracker.cancel("r1"));
        let second = tracker
            .register("r1", Capability::TextGeneration, CancellationToken::new())
            .unwrap();

        assert!(tracker.finish("r1", first).is_none());
        assert!(tracker.is_tracked("r1"));
        assert!(tracker.finish("r1", second).is_some());
    }
}
