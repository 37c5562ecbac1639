/// Cache Layer: in-memory TTL cache keyed by hierarchical strings.
///
/// Keys look like `sheet:{title}:rows`, so one `invalidate("sheet:Orders:")`
/// drops every view derived from that sheet. Nothing is persisted and misses
/// are never cached.
///
/// Read-through callers take a `generation()` snapshot before fetching and
/// populate with `set_if_unchanged`; if any invalidation ran in between, the
/// populate is dropped instead of re-caching data the write just replaced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted) > self.ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed by `invalidate`.
    pub invalidations: u64,
}

pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for {}", key);
                return Some(entry.value.clone());
            }
        }
        // Drop it only if it is still the expired entry we saw.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss for {}", key);
        None
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                inserted: Instant::now(),
                ttl,
            },
        );
    }

    /// Snapshot to pass to `set_if_unchanged`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Store `value` only if no invalidation happened since `observed`.
    /// Returns whether the value was stored.
    pub fn set_if_unchanged(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
        observed: u64,
    ) -> bool {
        let key = key.into();
        // The shard lock is held across the check so an invalidation cannot
        // slip between it and the insert.
        let slot = self.entries.entry(key);
        if self.generation.load(Ordering::SeqCst) != observed {
            debug!("Dropping stale populate for {}", slot.key());
            return false;
        }
        slot.insert(CacheEntry {
            value,
            inserted: Instant::now(),
            ttl,
        });
        true
    }

    /// Remove every key starting with `prefix`. The prefix is literal, so a
    /// sheet title containing `*` still addresses only its own family.
    /// Returns how many were removed.
    pub fn invalidate(&self, prefix: &str) -> usize {
        self.remove_matching(prefix, |key| key.starts_with(prefix))
    }

    /// Remove every key matching `pattern` as a whole, where `*` stands for
    /// any run of characters.
    pub fn invalidate_glob(&self, pattern: &str) -> usize {
        self.remove_matching(pattern, |key| glob_match(pattern.as_bytes(), key.as_bytes()))
    }

    fn remove_matching(&self, pattern: &str, matches: impl Fn(&str) -> bool) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut removed = 0usize;
        self.entries.retain(|key, _| {
            let keep = !matches(key);
            removed += usize::from(!keep);
            keep
        });
        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!("Invalidated {} cache entries matching {}", removed, pattern);
        removed
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            removed += usize::from(!keep);
            keep
        });
        removed
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Whole-string match where `*` matches any (possibly empty) run.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
