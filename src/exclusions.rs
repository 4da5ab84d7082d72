//! In-memory view of the exclusion rows, periodically refreshed from the
//! store — spec.md §4.6.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::model::Exclusions;

/// Holds the current `Exclusions` behind a pointer swap: writers replace
/// the whole `Arc` atomically, readers load a stable snapshot for the
/// duration of one probe and never observe a partially-updated set
/// (spec.md §4.6, §5 "Shared state").
pub struct ExclusionCache {
    current: ArcSwap<Exclusions>,
}

impl Default for ExclusionCache {
    fn default() -> Self {
        ExclusionCache {
            current: ArcSwap::from_pointee(Exclusions::default()),
        }
    }
}

impl ExclusionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a stable snapshot of the current exclusion set.
    pub fn snapshot(&self) -> Arc<Exclusions> {
        self.current.load_full()
    }

    /// Atomically replaces the exclusion set as a whole.
    pub fn replace(&self, exclusions: Exclusions) {
        self.current.store(Arc::new(exclusions));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_see_a_stable_snapshot_across_a_replace() {
        let cache = ExclusionCache::new();
        let mut before = Exclusions::default();
        before.gametype.insert("coop".to_string());
        cache.replace(before);

        let held = cache.snapshot();
        assert!(held.is_gametype_excluded("coop"));

        let mut after = Exclusions::default();
        after.gametype.insert("ctf".to_string());
        cache.replace(after);

        // The previously-loaded snapshot is unaffected by the later replace.
        assert!(held.is_gametype_excluded("coop"));
        assert!(!held.is_gametype_excluded("ctf"));

        let fresh = cache.snapshot();
        assert!(fresh.is_gametype_excluded("ctf"));
        assert!(!fresh.is_gametype_excluded("coop"));
    }
}
