//! Rolling per-operation sampling-status snapshots.
//!
//! The calculation loop records, for every operation it considers, the
//! probability in effect and whether the operation looked adaptively sampled
//! at the start of the round. Older snapshots let the engine keep an
//! operation's adaptive classification alive across rounds where its
//! throughput temporarily disappears.

use std::collections::HashMap;

/// What the engine observed for one operation at the start of a round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingCacheEntry {
    pub probability: f64,
    pub using_adaptive: bool,
}

/// One calculation round's snapshot, keyed by service and operation.
#[derive(Debug, Clone, Default)]
pub struct SamplingCache {
    entries: HashMap<String, HashMap<String, SamplingCacheEntry>>,
}

impl SamplingCache {
    pub fn set(&mut self, service: &str, operation: &str, entry: SamplingCacheEntry) {
        self.entries
            .entry(service.to_string())
            .or_default()
            .insert(operation.to_string(), entry);
    }

    pub fn get(&self, service: &str, operation: &str) -> Option<&SamplingCacheEntry> {
        self.entries.get(service)?.get(operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let mut cache = SamplingCache::default();
        let entry = SamplingCacheEntry {
            probability: 0.2,
            using_adaptive: true,
        };
        cache.set("svc", "op", entry);
        assert_eq!(cache.get("svc", "op"), Some(&entry));
    }

    #[test]
    fn test_get_unknown_operation() {
        let mut cache = SamplingCache::default();
        cache.set("svc", "op", SamplingCacheEntry {
            probability: 0.2,
            using_adaptive: false,
        });
        assert_eq!(cache.get("svc", "other"), None);
        assert_eq!(cache.get("other", "op"), None);
    }

    #[test]
    fn test_set_overwrites() {
        let mut cache = SamplingCache::default();
        cache.set("svc", "op", SamplingCacheEntry {
            probability: 0.2,
            using_adaptive: false,
        });
        cache.set("svc", "op", SamplingCacheEntry {
            probability: 0.4,
            using_adaptive: true,
        });
        let entry = cache.get("svc", "op").unwrap();
        assert_eq!(entry.probability, 0.4);
        assert!(entry.using_adaptive);
    }
}
