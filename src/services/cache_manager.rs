//! Hierarchical cache with pattern-learned placement.
//!
//! Each access is turned into a feature vector and fed to the
//! [`PatternLearner`]. An item's level is chosen from the distance between
//! its access features and the nearest learned center: close to a learned
//! pattern means hot (level 0), far means cold (last level).
//!
//! Locking: every operation holds the stripe lock for its key, so operations
//! on the same key are serialized. Levels have their own locks and no
//! operation holds two of them at once. The learner lock is only ever taken
//! on its own.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::domain::models::{
    CacheConfig, CacheContext, CacheItem, CacheLookup, CacheStats, EvictionWeights, LevelStats,
    PutOutcome,
};
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::pattern_learner::{
    extract_features, level_for_distance, pattern_score, FeatureVector, PatternLearner,
};

#[derive(Debug)]
struct CacheLevel {
    capacity: usize,
    items: HashMap<String, CacheItem>,
}

/// Serializable cache contents for snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub items: Vec<CacheItem>,
    pub centers: Vec<FeatureVector>,
    pub clock: u64,
    pub version: u64,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// Version stamps handed out for writes that have not landed yet, and the
/// invalidations those writes must lose to.
///
/// A tombstone is only needed while some write stamped before it is still
/// pending. Once the oldest pending stamp passes a tombstone, it is pruned.
#[derive(Default)]
struct WriteLog {
    version: AtomicU64,
    pending: Mutex<BTreeSet<u64>>,
    tombstones: DashMap<String, u64>,
}

impl WriteLog {
    fn next(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn open(&self) -> u64 {
        let mut pending = self.pending.lock();
        let version = self.next();
        pending.insert(version);
        version
    }

    fn close(&self, version: u64) {
        let mut pending = self.pending.lock();
        pending.remove(&version);
        match pending.first() {
            None => self.tombstones.clear(),
            Some(&oldest) if oldest > version => self.tombstones.retain(|_, stamp| *stamp > oldest),
            Some(_) => {}
        }
    }

    fn invalidate(&self, key: &str) {
        let pending = self.pending.lock();
        let stamp = self.next();
        if !pending.is_empty() {
            self.tombstones.insert(key.to_string(), stamp);
        }
    }

    fn invalidated_after(&self, key: &str, version: u64) -> Option<u64> {
        self.tombstones
            .get(key)
            .map(|stamp| *stamp)
            .filter(|&stamp| stamp > version)
    }
}

/// A version reserved for a write whose value is still being computed.
/// Dropping it, written or not, releases the reservation.
#[must_use]
pub struct WriteStamp {
    version: u64,
    log: Arc<WriteLog>,
}

impl WriteStamp {
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Drop for WriteStamp {
    fn drop(&mut self) {
        self.log.close(self.version);
    }
}

/// Placement decision for one access.
struct Placement {
    level: usize,
    pattern_score: f64,
}

pub struct CacheManager {
    config: CacheConfig,
    levels: Vec<Mutex<CacheLevel>>,
    stripes: Vec<Mutex<()>>,
    learner: Arc<RwLock<PatternLearner>>,
    writes: Arc<WriteLog>,
    clock: AtomicU64,
    counters: CacheCounters,
    event_bus: Option<Arc<EventBus>>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        let levels = config
            .level_capacities
            .iter()
            .map(|&capacity| {
                Mutex::new(CacheLevel {
                    capacity,
                    items: HashMap::with_capacity(capacity.min(1024)),
                })
            })
            .collect();
        let stripes = (0..config.key_shards.max(1)).map(|_| Mutex::new(())).collect();
        let learner = PatternLearner::new(config.clusters, config.center_rate, config.feature_window);

        Self {
            levels,
            stripes,
            learner: Arc::new(RwLock::new(learner)),
            writes: Arc::new(WriteLog::default()),
            clock: AtomicU64::new(0),
            counters: CacheCounters::default(),
            event_bus: None,
            config,
        }
    }

    /// Set the event bus for publishing cache events.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// The shared learner, for the refinement daemon.
    pub fn learner(&self) -> Arc<RwLock<PatternLearner>> {
        Arc::clone(&self.learner)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Reserve a version for a write. Writers that compute a value before
    /// storing it should stamp first and store with [`Self::put_versioned`],
    /// so that a slower, older computation cannot overwrite a newer one.
    pub fn stamp(&self) -> WriteStamp {
        WriteStamp {
            version: self.writes.open(),
            log: Arc::clone(&self.writes),
        }
    }

    pub fn get(&self, key: &str, context: &CacheContext) -> CacheLookup {
        let _guard = self.stripe(key).lock();
        let tick = self.tick();
        let placement = self.learn(key, context);

        for (idx, level) in self.levels.iter().enumerate() {
            let mut level = level.lock();
            let Some(item) = level.items.get_mut(key) else {
                continue;
            };

            item.access_count += 1;
            item.last_access = Utc::now();
            item.last_tick = tick;
            item.pattern_score = placement.pattern_score;
            let value = item.value.clone();

            let target = placement.level;
            if target == idx {
                drop(level);
                self.record_hit(key, idx);
                return CacheLookup::Hit(value);
            }

            // Re-home the item to the level its access pattern now selects.
            let Some(mut moved) = level.items.remove(key) else {
                continue;
            };
            drop(level);
            moved.level = target;
            let evicted = self.insert_into_level(target, moved, tick);
            trace!(key, from = idx, to = target, "cache item moved");
            self.record_hit(key, target);
            self.publish_evictions(&evicted);
            return CacheLookup::Hit(value);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.publish(EventPayload::CacheMiss {
            key: key.to_string(),
        });
        CacheLookup::Miss
    }

    pub fn put(&self, key: &str, value: serde_json::Value, context: &CacheContext) -> PutOutcome {
        if self.config.total_capacity() == 0 {
            return PutOutcome::Bypassed;
        }

        let _guard = self.stripe(key).lock();
        let version = self.writes.next();
        self.store(key, value, context, version)
    }

    /// Store `value` unless a write with a newer stamp already holds the key
    /// or the key was invalidated after `stamp` was drawn.
    pub fn put_versioned(
        &self,
        key: &str,
        value: serde_json::Value,
        context: &CacheContext,
        stamp: WriteStamp,
    ) -> PutOutcome {
        if self.config.total_capacity() == 0 {
            return PutOutcome::Bypassed;
        }

        let _guard = self.stripe(key).lock();
        if let Some(invalidated) = self.writes.invalidated_after(key, stamp.version) {
            return PutOutcome::Superseded {
                current_version: invalidated,
            };
        }
        self.store(key, value, context, stamp.version)
    }

    /// Caller holds the stripe lock for `key`.
    fn store(
        &self,
        key: &str,
        value: serde_json::Value,
        context: &CacheContext,
        version: u64,
    ) -> PutOutcome {
        let mut access_count = 0;
        for level in &self.levels {
            let mut level = level.lock();
            let current = level.items.get(key).map(|item| item.version);
            match current {
                Some(current) if current > version => {
                    return PutOutcome::Superseded {
                        current_version: current,
                    };
                }
                Some(_) => {
                    access_count = level.items.remove(key).map_or(0, |item| item.access_count);
                    break;
                }
                None => {}
            }
        }

        let tick = self.tick();
        let placement = self.learn(key, context);

        let item = CacheItem {
            key: key.to_string(),
            value,
            access_count: access_count + 1,
            last_access: Utc::now(),
            last_tick: tick,
            pattern_score: placement.pattern_score,
            level: placement.level,
            version,
            importance: context.importance(),
        };

        let evicted = self.insert_into_level(placement.level, item, tick);
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        trace!(key, level = placement.level, version, "cache put");
        self.publish_evictions(&evicted);

        PutOutcome::Stored {
            level: placement.level,
            evicted: evicted.into_iter().map(|(key, _)| key).collect(),
        }
    }

    /// Remove `key` from every level. Any later `get` misses, and writes
    /// stamped before this call are rejected.
    pub fn invalidate(&self, key: &str) -> bool {
        let _guard = self.stripe(key).lock();
        self.writes.invalidate(key);

        let mut removed = false;
        for level in &self.levels {
            removed |= level.lock().items.remove(key).is_some();
        }
        if removed {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache item invalidated");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        let levels = self
            .levels
            .iter()
            .enumerate()
            .map(|(idx, level)| {
                let level = level.lock();
                LevelStats {
                    level: idx,
                    capacity: level.capacity,
                    size: level.items.len(),
                }
            })
            .collect();

        CacheStats {
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            hits,
            misses,
            puts: self.counters.puts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            levels,
        }
    }

    /// Level currently holding `key`, if cached. Does not count as an access.
    pub fn level_of(&self, key: &str) -> Option<usize> {
        let _guard = self.stripe(key).lock();
        self.levels
            .iter()
            .position(|level| level.lock().items.contains_key(key))
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(|level| level.lock().items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidations still held against pending writes.
    pub fn tombstone_count(&self) -> usize {
        self.writes.tombstones.len()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let mut items: Vec<CacheItem> = self
            .levels
            .iter()
            .flat_map(|level| level.lock().items.values().cloned().collect::<Vec<_>>())
            .collect();
        items.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.key.cmp(&b.key)));

        CacheSnapshot {
            items,
            centers: self.learner.read().centers().to_vec(),
            clock: self.clock.load(Ordering::SeqCst),
            version: self.writes.version.load(Ordering::SeqCst),
        }
    }

    /// Replace the cache contents. Items keep their recorded level when it
    /// still exists and has room; capacity limits apply as for `put`.
    pub fn restore(&self, snapshot: CacheSnapshot) {
        for level in &self.levels {
            level.lock().items.clear();
        }
        self.writes.tombstones.clear();
        self.learner.write().restore_centers(snapshot.centers);
        self.clock.store(snapshot.clock, Ordering::SeqCst);
        self.writes.version.fetch_max(snapshot.version, Ordering::SeqCst);

        if self.config.total_capacity() == 0 {
            return;
        }

        let mut items = snapshot.items;
        items.sort_by_key(|item| item.last_tick);
        for mut item in items {
            let Some(level) = self.resolve_level(item.level) else {
                continue;
            };
            item.level = level;
            let tick = self.clock.load(Ordering::SeqCst).max(item.last_tick);
            self.insert_into_level(level, item, tick);
        }
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.stripes.len() as u64) as usize;
        &self.stripes[idx]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn learn(&self, key: &str, context: &CacheContext) -> Placement {
        let features = extract_features(key, context);
        let distance = {
            let mut learner = self.learner.write();
            learner.observe(features);
            learner.nearest_distance(&features)
        };
        let preferred = level_for_distance(distance, self.levels.len(), self.config.level_span);
        Placement {
            level: self.resolve_level(preferred).unwrap_or(preferred),
            pattern_score: pattern_score(distance),
        }
    }

    /// Nearest level to `preferred` with non-zero capacity, preferring the
    /// hotter one on ties.
    fn resolve_level(&self, preferred: usize) -> Option<usize> {
        let capacities = &self.config.level_capacities;
        let preferred = preferred.min(capacities.len().saturating_sub(1));
        (0..capacities.len())
            .filter(|&idx| capacities[idx] > 0)
            .min_by_key(|&idx| (idx.abs_diff(preferred), idx))
    }

    /// Insert `item` into `level`, evicting until it fits. Returns the evicted
    /// keys with their level.
    fn insert_into_level(&self, level_idx: usize, item: CacheItem, tick: u64) -> Vec<(String, usize)> {
        let mut level = self.levels[level_idx].lock();
        let mut evicted = Vec::new();

        if level.capacity == 0 {
            return evicted;
        }

        level.items.remove(&item.key);
        while level.items.len() >= level.capacity {
            let Some(victim) = select_victim(&level.items, &self.config.eviction, tick) else {
                break;
            };
            level.items.remove(&victim);
            evicted.push((victim, level_idx));
        }
        level.items.insert(item.key.clone(), item);

        if !evicted.is_empty() {
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        }
        evicted
    }

    fn record_hit(&self, key: &str, level: usize) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.publish(EventPayload::CacheHit {
            key: key.to_string(),
            level,
        });
    }

    fn publish_evictions(&self, evicted: &[(String, usize)]) {
        for (key, level) in evicted {
            debug!(key = %key, level, "cache item evicted");
            self.publish(EventPayload::CacheEvicted {
                key: key.clone(),
                level: *level,
            });
        }
    }

    fn publish(&self, payload: EventPayload) {
        if let Some(bus) = &self.event_bus {
            bus.publish(payload);
        }
    }
}

/// Eviction score: `w1·recency + w2·frequency + w3·pattern + w4·importance`.
pub fn eviction_score(item: &CacheItem, max_access: u64, tick: u64, weights: &EvictionWeights) -> f64 {
    let recency = if tick == 0 {
        1.0
    } else {
        item.last_tick as f64 / tick as f64
    };
    let frequency = if max_access == 0 {
        0.0
    } else {
        item.access_count as f64 / max_access as f64
    };
    weights.recency * recency
        + weights.frequency * frequency
        + weights.pattern * item.pattern_score
        + weights.importance * item.importance
}

/// Lowest-scoring item; ties go to the oldest tick, then the smallest key.
fn select_victim(
    items: &HashMap<String, CacheItem>,
    weights: &EvictionWeights,
    tick: u64,
) -> Option<String> {
    let max_access = items.values().map(|item| item.access_count).max().unwrap_or(0);
    items
        .values()
        .map(|item| (eviction_score(item, max_access, tick, weights), item))
        .min_by(|(sa, a), (sb, b)| {
            sa.total_cmp(sb)
                .then_with(|| a.last_tick.cmp(&b.last_tick))
                .then_with(|| a.key.cmp(&b.key))
        })
        .map(|(_, item)| item.key.clone())
}
