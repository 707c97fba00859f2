#![forbid(unsafe_code)]

//! Short-lived link between a bare image and a claim that arrives after it.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use receipts_kernel_contracts::message::{ChatKey, GroupId, MediaRef};
use receipts_kernel_contracts::MonotonicTimeNs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingImageConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl PendingImageConfig {
    pub fn mvp_v1() -> Self {
        Self {
            ttl_ms: 120_000,
            max_entries: 10_000,
        }
    }

    pub fn with_ttl_secs(secs: u64) -> Self {
        Self {
            ttl_ms: secs.saturating_mul(1_000),
            ..Self::mvp_v1()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingImage {
    pub media_ref: MediaRef,
    pub cached_at: MonotonicTimeNs,
}

impl PendingImage {
    fn is_expired(&self, now: MonotonicTimeNs, ttl_ms: u64) -> bool {
        now.elapsed_ms_since(self.cached_at) > ttl_ms
    }
}

/// One unclaimed image per `(group, sender)`. Expiry is enforced on read, sweeps only bound
/// memory.
#[derive(Debug)]
pub struct PendingImageCache {
    config: PendingImageConfig,
    entries: Mutex<BTreeMap<ChatKey, PendingImage>>,
}

impl PendingImageCache {
    pub fn new(config: PendingImageConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> PendingImageConfig {
        self.config
    }

    /// Last writer wins. Returns the media reference that was replaced, if it was still live.
    pub fn put(&self, key: ChatKey, media_ref: MediaRef, now: MonotonicTimeNs) -> Option<MediaRef> {
        let mut entries = self.lock();
        sweep_locked(&mut entries, now, self.config.ttl_ms);
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries.max(1) {
            evict_oldest(&mut entries);
        }
        entries
            .insert(
                key,
                PendingImage {
                    media_ref,
                    cached_at: now,
                },
            )
            .map(|prev| prev.media_ref)
    }

    /// Removes the entry for `key`. A stale entry is dropped and reported as absent.
    pub fn take(&self, key: &ChatKey, now: MonotonicTimeNs) -> Option<MediaRef> {
        let entry = self.lock().remove(key)?;
        if entry.is_expired(now, self.config.ttl_ms) {
            return None;
        }
        Some(entry.media_ref)
    }

    pub fn contains_live(&self, key: &ChatKey, now: MonotonicTimeNs) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|e| !e.is_expired(now, self.config.ttl_ms))
    }

    pub fn sweep(&self, now: MonotonicTimeNs) -> usize {
        sweep_locked(&mut self.lock(), now, self.config.ttl_ms)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ChatKey, PendingImage>> {
        // The map holds no cross-entry invariant a panicking holder could break.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sweep_locked(entries: &mut BTreeMap<ChatKey, PendingImage>, now: MonotonicTimeNs, ttl_ms: u64) -> usize {
    let before = entries.len();
    entries.retain(|_, e| !e.is_expired(now, ttl_ms));
    before - entries.len()
}

fn evict_oldest(entries: &mut BTreeMap<ChatKey, PendingImage>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, e)| e.cached_at)
        .map(|(k, _)| k.clone());
    if let Some(key) = oldest {
        entries.remove(&key);
    }
}

/// First-committer-wins guard for claims that carry the same attached media.
#[derive(Debug)]
pub struct ClaimedMediaGuard {
    window_ms: u64,
    claimed: Mutex<BTreeMap<(GroupId, MediaRef), MonotonicTimeNs>>,
}

impl ClaimedMediaGuard {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            claimed: Mutex::new(BTreeMap::new()),
        }
    }

    /// True for the first claim of `(group, media)` inside the window.
    pub fn try_claim(&self, group_id: &GroupId, media_ref: &MediaRef, now: MonotonicTimeNs) -> bool {
        let mut claimed = self
            .claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let window_ms = self.window_ms;
        claimed.retain(|_, at| now.elapsed_ms_since(*at) <= window_ms);
        let key = (group_id.clone(), media_ref.clone());
        if claimed.contains_key(&key) {
            return false;
        }
        claimed.insert(key, now);
        true
    }

    /// Lets a claim that failed downstream be retried.
    pub fn release(&self, group_id: &GroupId, media_ref: &MediaRef) {
        self.claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(group_id.clone(), media_ref.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use receipts_kernel_contracts::message::SenderId;
    use std::sync::{Arc, Barrier};

    const T0: MonotonicTimeNs = MonotonicTimeNs(1_700_000_000_000_000_000);

    fn key(group: &str, sender: &str) -> ChatKey {
        ChatKey::new(GroupId::new(group).unwrap(), SenderId::new(sender).unwrap())
    }

    fn media(url: &str) -> MediaRef {
        MediaRef::new(url).unwrap()
    }

    #[test]
    fn at_pending_01_take_within_ttl_consumes_once() {
        let cache = PendingImageCache::new(PendingImageConfig::mvp_v1());
        let k = key("g@g.us", "s@c.us");
        assert!(cache.put(k.clone(), media("https://m/1"), T0).is_none());
        let later = T0.saturating_add_ms(60_000);
        assert_eq!(cache.take(&k, later), Some(media("https://m/1")));
        assert_eq!(cache.take(&k, later), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn at_pending_02_expiry_is_enforced_at_read_time() {
        let cache = PendingImageCache::new(PendingImageConfig::mvp_v1());
        let k = key("g@g.us", "s@c.us");
        cache.put(k.clone(), media("https://m/1"), T0);
        // No sweep ran in between.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.take(&k, T0.saturating_add_ms(130_000)), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn at_pending_03_put_overwrites_last_writer_wins() {
        let cache = PendingImageCache::new(PendingImageConfig::mvp_v1());
        let k = key("g@g.us", "s@c.us");
        cache.put(k.clone(), media("https://m/1"), T0);
        let replaced = cache.put(k.clone(), media("https://m/2"), T0.saturating_add_ms(1_000));
        assert_eq!(replaced, Some(media("https://m/1")));
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.take(&k, T0.saturating_add_ms(2_000)),
            Some(media("https://m/2"))
        );
    }

    #[test]
    fn at_pending_04_keys_are_scoped_by_group_and_sender() {
        let cache = PendingImageCache::new(PendingImageConfig::mvp_v1());
        cache.put(key("g1@g.us", "s@c.us"), media("https://m/1"), T0);
        assert_eq!(cache.take(&key("g2@g.us", "s@c.us"), T0), None);
        assert_eq!(cache.take(&key("g1@g.us", "other@c.us"), T0), None);
        assert!(cache.contains_live(&key("g1@g.us", "s@c.us"), T0));
    }

    #[test]
    fn at_pending_05_sweep_and_put_remove_stale_entries() {
        let cache = PendingImageCache::new(PendingImageConfig::with_ttl_secs(10));
        cache.put(key("g@g.us", "a@c.us"), media("https://m/a"), T0);
        cache.put(key("g@g.us", "b@c.us"), media("https://m/b"), T0.saturating_add_ms(8_000));
        assert_eq!(cache.sweep(T0.saturating_add_ms(12_000)), 1);
        assert_eq!(cache.len(), 1);
        cache.put(key("g@g.us", "c@c.us"), media("https://m/c"), T0.saturating_add_ms(30_000));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn at_pending_06_capacity_evicts_oldest() {
        let cache = PendingImageCache::new(PendingImageConfig {
            ttl_ms: 120_000,
            max_entries: 2,
        });
        cache.put(key("g@g.us", "a@c.us"), media("https://m/a"), T0);
        cache.put(key("g@g.us", "b@c.us"), media("https://m/b"), T0.saturating_add_ms(1));
        cache.put(key("g@g.us", "c@c.us"), media("https://m/c"), T0.saturating_add_ms(2));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_live(&key("g@g.us", "a@c.us"), T0.saturating_add_ms(3)));
    }

    #[test]
    fn at_pending_07_concurrent_take_has_single_consumer() {
        for _ in 0..50 {
            let cache = Arc::new(PendingImageCache::new(PendingImageConfig::mvp_v1()));
            let k = key("g@g.us", "s@c.us");
            cache.put(k.clone(), media("https://m/1"), T0);
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    let barrier = Arc::clone(&barrier);
                    let k = k.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        cache.take(&k, T0.saturating_add_ms(5))
                    })
                })
                .collect();
            let results: Vec<Option<MediaRef>> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        }
    }

    #[test]
    fn at_pending_08_claimed_media_guard_first_committer_wins() {
        let guard = ClaimedMediaGuard::new(120_000);
        let g = GroupId::new("g@g.us").unwrap();
        let m = media("https://m/1");
        assert!(guard.try_claim(&g, &m, T0));
        assert!(!guard.try_claim(&g, &m, T0.saturating_add_ms(10)));
        assert!(guard.try_claim(&g, &m, T0.saturating_add_ms(130_000)));
        guard.release(&g, &m);
        assert!(guard.try_claim(&g, &m, T0.saturating_add_ms(130_001)));
    }
}
