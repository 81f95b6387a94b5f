//! Apply rules for one watch cache, independent of any task or I/O.

use std::sync::Arc;

use fleet_core::{CachedObject, LabelSelector, Listing, ObjectKey, VersionToken, WatchEvent};
use rustc_hash::FxHashMap;

/// Immutable view handed to readers; swapped as a whole after each batch.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    pub baseline: VersionToken,
    /// False until the first listing has been applied, and again after stop.
    pub seeded: bool,
    entries: FxHashMap<ObjectKey, Arc<CachedObject>>,
}

impl CacheSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&Arc<CachedObject>> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CachedObject>> {
        self.entries.values()
    }

    /// Objects in `namespace` (all when `None`) matching `selector`, ordered by namespace/name.
    pub fn list(&self, namespace: Option<&str>, selector: Option<&LabelSelector>) -> Vec<Arc<CachedObject>> {
        let mut out: Vec<Arc<CachedObject>> = self
            .entries
            .values()
            .filter(|o| namespace.map(|ns| o.namespace.as_deref() == Some(ns)).unwrap_or(true))
            .filter(|o| selector.map(|s| s.matches(o)).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace).then_with(|| a.name.cmp(&b.name)));
        out
    }
}

/// Tombstones kept when the stream never confirms progress with bookmarks.
/// Past this, the older half is dropped.
pub const MAX_TOMBSTONES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Token not newer than what the cache already holds for the key.
    Stale,
    Bookmark,
}

/// Single-writer working state of a watch cache.
///
/// An entry is only replaced by an event carrying a strictly greater token.
/// Deletes leave a tombstone with their token so that an older add arriving
/// late cannot resurrect the object. Once a listing or a bookmark confirms
/// that every change up to some token has been seen, tombstones at or below
/// it are dropped and that token alone rejects older events for unknown keys.
#[derive(Debug, Default)]
pub struct CacheState {
    entries: FxHashMap<ObjectKey, Arc<CachedObject>>,
    tombstones: FxHashMap<ObjectKey, VersionToken>,
    baseline: VersionToken,
    /// Every change up to here has been delivered.
    confirmed: VersionToken,
    epoch: u64,
    seeded: bool,
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline(&self) -> VersionToken {
        self.baseline
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones.len()
    }

    /// Whether an event at `token` for `key` carries nothing new.
    fn is_stale(&self, key: &ObjectKey, token: VersionToken) -> bool {
        match self.newest_known(key) {
            Some(t) => t >= token,
            None => token <= self.confirmed,
        }
    }

    fn confirm(&mut self, upto: VersionToken) {
        if upto > self.confirmed {
            self.confirmed = upto;
            self.tombstones.retain(|_, t| *t > upto);
        }
    }

    fn cap_tombstones(&mut self) {
        if self.tombstones.len() <= MAX_TOMBSTONES {
            return;
        }
        let mut tokens: Vec<VersionToken> = self.tombstones.values().copied().collect();
        let mid = tokens.len() / 2;
        let cutoff = *tokens.select_nth_unstable(mid).1;
        self.tombstones.retain(|_, t| *t > cutoff);
    }

    fn newest_known(&self, key: &ObjectKey) -> Option<VersionToken> {
        match (self.entries.get(key), self.tombstones.get(key)) {
            (Some(o), Some(t)) => Some(o.token.max(*t)),
            (Some(o), None) => Some(o.token),
            (None, Some(t)) => Some(*t),
            (None, None) => None,
        }
    }

    /// Rebuild from a full listing taken at `listing.token`.
    ///
    /// Objects missing from the listing are dropped unless the cache saw them
    /// at a token newer than the listing.
    pub fn reseed(&mut self, listing: Listing) {
        let baseline = listing.token;
        let mut next: FxHashMap<ObjectKey, Arc<CachedObject>> = FxHashMap::default();
        next.reserve(listing.items.len());
        for obj in listing.items {
            let key = obj.key();
            match self.newest_known(&key) {
                Some(t) if t > obj.token => {
                    if let Some(cur) = self.entries.get(&key) {
                        if cur.token == t {
                            next.insert(key, cur.clone());
                        }
                    }
                }
                _ => {
                    next.insert(key, Arc::new(obj));
                }
            }
        }
        for (key, cur) in self.entries.drain() {
            if cur.token > baseline && !next.contains_key(&key) {
                next.insert(key, cur);
            }
        }
        self.entries = next;
        self.baseline = baseline;
        self.confirm(baseline);
        self.seeded = true;
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn apply(&mut self, ev: WatchEvent) -> ApplyOutcome {
        match ev {
            WatchEvent::Bookmark(t) => {
                self.baseline = self.baseline.max(t);
                self.confirm(t);
                ApplyOutcome::Bookmark
            }
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let key = obj.key();
                if self.is_stale(&key, obj.token) {
                    return ApplyOutcome::Stale;
                }
                self.baseline = self.baseline.max(obj.token);
                self.tombstones.remove(&key);
                self.entries.insert(key, Arc::new(obj));
                self.epoch = self.epoch.saturating_add(1);
                ApplyOutcome::Applied
            }
            WatchEvent::Deleted(obj) => {
                let key = obj.key();
                if self.is_stale(&key, obj.token) {
                    return ApplyOutcome::Stale;
                }
                self.baseline = self.baseline.max(obj.token);
                self.entries.remove(&key);
                self.tombstones.insert(key, obj.token);
                self.cap_tombstones();
                self.epoch = self.epoch.saturating_add(1);
                ApplyOutcome::Applied
            }
        }
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot {
            epoch: self.epoch,
            baseline: self.baseline,
            seeded: self.seeded,
            entries: self.entries.clone(),
        })
    }
}
