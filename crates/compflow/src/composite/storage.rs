//! Tracks result buffers handed to callers so they can be erased before reuse.

use tracing::debug;

use crate::profiling;
use crate::tensor::{Value, WeakValue};

#[derive(Debug, Default)]
pub(crate) struct StorageTracker {
    existing: Vec<WeakValue>,
}

impl StorageTracker {
    pub(crate) fn track(&mut self, value: &Value) {
        self.existing.push(value.downgrade());
    }

    /// Erases every handle from the previous round that a caller still holds.
    pub(crate) fn clear_existing(&mut self) -> usize {
        let erased = self
            .existing
            .drain(..)
            .filter(|weak| weak.erase())
            .count();
        if erased > 0 {
            profiling::cache_event("storage_erased");
            debug!(erased, "erased stale result buffers");
        }
        erased
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.existing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn clears_only_live_handles() {
        let mut tracker = StorageTracker::default();
        let kept = Value::new(Tensor::scalar(1.0));
        tracker.track(&kept);
        tracker.track(&Value::new(Tensor::scalar(2.0)));
        assert_eq!(tracker.tracked(), 2);

        assert_eq!(tracker.clear_existing(), 1);
        assert!(kept.is_erased());
        assert_eq!(tracker.tracked(), 0);
    }
}
