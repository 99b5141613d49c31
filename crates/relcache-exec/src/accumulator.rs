//! Size accounting for cached relations.
//!
//! Each cached relation owns one [`SizeAccumulator`] handle; the tasks
//! materializing its partitions add block sizes concurrently. Handles are
//! registered in an [`AccumulatorRegistry`] and must be unregistered when
//! the relation is released, so a non-empty registry after `clear_cache`
//! is a leak.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SizeAccumulator {
    id: u64,
    bytes: Arc<AtomicU64>,
}

impl SizeAccumulator {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct AccumulatorRegistry {
    accumulators: Mutex<HashMap<u64, Arc<AtomicU64>>>,
    next_id: AtomicU64,
}

impl AccumulatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> SizeAccumulator {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = Arc::new(AtomicU64::new(0));
        self.accumulators.lock().insert(id, bytes.clone());
        SizeAccumulator { id, bytes }
    }

    /// Idempotent; unregistering twice is harmless.
    pub fn unregister(&self, accumulator: &SizeAccumulator) {
        self.accumulators.lock().remove(&accumulator.id);
    }

    /// Number of registered accumulators still alive.
    pub fn live_count(&self) -> usize {
        self.accumulators.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_register_and_unregister() {
        let registry = AccumulatorRegistry::new();
        let acc = registry.register();
        assert_eq!(registry.live_count(), 1);

        registry.unregister(&acc);
        assert_eq!(registry.live_count(), 0);
        registry.unregister(&acc);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_concurrent_adds() {
        let registry = AccumulatorRegistry::new();
        let acc = registry.register();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let acc = acc.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        acc.add(3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(acc.value(), 8 * 1000 * 3);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = AccumulatorRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.live_count(), 2);
    }
}
