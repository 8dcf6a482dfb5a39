//! Cache manager: object placement, leases, recency and eviction
//!
//! The key map, the recency index and the lease table live together in one
//! [`CacheState`] behind a single `RwLock`, so eviction scans and concurrent
//! gets/puts on the same key always see them updated as a pair. The arena
//! has its own locks and is only ever reached through this module.
//!
//! ## Entry lifecycle
//!
//! ```text
//! put ──> Active ──delete while leased──> PendingDelete ──last release──> Evicted
//!           │  └──put while leased──> Superseded ──────last release──> Evicted
//!           └──delete / evict when unreferenced─────────────────────> Evicted
//! ```
//!
//! PendingDelete and Superseded entries are no longer reachable by key; they
//! only wait for their leases to drain before their region is freed.

use crate::error::{CacheError, CacheResult};
use crate::memory::{Arena, ArenaConfig, ArenaStats, Region};
use crate::protocol::{Key, MAX_KEY_LEN, MAX_VALUE_LEN};
use crate::recency::RecencyIndex;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Eviction hysteresis thresholds, as fractions of arena capacity
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Watermarks {
    /// Start background eviction once usage rises above this
    pub high: f64,
    /// ...and keep evicting until usage is at or below this
    pub low: f64,
}

/// Cache manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Arena capacity and alignment
    pub arena: ArenaConfig,
    /// Largest single object accepted by `put`
    pub max_object_size: usize,
    /// Optional watermark hysteresis (disabled by default)
    pub watermarks: Option<Watermarks>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            arena: ArenaConfig::default(),
            max_object_size: 64 * 1024 * 1024, // 64MB
            watermarks: None,
        }
    }
}

impl CacheConfig {
    /// Small unaligned configuration, handy for tests and demos
    pub fn with_capacity(capacity: usize, max_object_size: usize) -> Self {
        Self {
            arena: ArenaConfig {
                capacity,
                alignment: 1,
            },
            max_object_size,
            watermarks: None,
        }
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.arena.capacity == 0 {
            return Err(CacheError::InvalidSize(
                "cache capacity must be at least one byte".into(),
            ));
        }
        let alignment = self.arena.alignment;
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(CacheError::InvalidSize(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }
        if self.max_object_size == 0 || self.max_object_size > MAX_VALUE_LEN {
            return Err(CacheError::InvalidSize(format!(
                "max object size {} must be in 1..={}",
                self.max_object_size, MAX_VALUE_LEN
            )));
        }
        // The largest object must fit once rounded up to the alignment
        let reserved = self.max_object_size.checked_next_multiple_of(alignment);
        if reserved.map_or(true, |r| r > self.arena.capacity) {
            return Err(CacheError::InvalidSize(format!(
                "max object size {} (aligned to {}) does not fit capacity {}",
                self.max_object_size, alignment, self.arena.capacity
            )));
        }
        if let Some(w) = self.watermarks {
            if !(0.0..=1.0).contains(&w.low) || !(0.0..=1.0).contains(&w.high) || w.low > w.high
            {
                return Err(CacheError::InvalidSize(format!(
                    "watermarks must satisfy 0 <= low <= high <= 1, got low={} high={}",
                    w.low, w.high
                )));
            }
        }
        Ok(())
    }
}

/// Identifier of one stored version of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

/// Identifier of a lease issued by `get`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    /// Reachable by key
    Active,
    /// Deleted while leased; freed on the last release
    PendingDelete,
    /// Replaced by a newer put while leased; freed on the last release
    Superseded,
}

/// One stored object version
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    pub id: EntryId,
    pub key: Key,
    pub region: Region,
    pub ref_count: u32,
    /// Recency stamp of the last touch
    pub last_access: u64,
    /// Recency stamp at insertion
    pub inserted_at: u64,
    pub state: EntryState,
}

impl ObjectEntry {
    pub fn size(&self) -> usize {
        self.region.len
    }
}

/// Read-only view of a leased object, valid until the lease is released
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHandle {
    pub key: Key,
    pub lease: LeaseId,
    pub region: Region,
    pub size: usize,
}

#[derive(Clone, Debug)]
struct LeaseRecord {
    key: Key,
    entry: EntryId,
}

#[derive(Default)]
struct CacheState {
    live: HashMap<Key, ObjectEntry>,
    /// Unreachable versions still pinned by leases
    draining: HashMap<EntryId, ObjectEntry>,
    pending_deletes: HashMap<Key, EntryId>,
    recency: RecencyIndex,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_entry_id: u64,
    next_lease_id: u64,
}

impl CacheState {
    fn next_entry_id(&mut self) -> EntryId {
        self.next_entry_id += 1;
        EntryId(self.next_entry_id)
    }

    fn next_lease_id(&mut self) -> LeaseId {
        self.next_lease_id += 1;
        LeaseId(self.next_lease_id)
    }

    fn stored_bytes(&self) -> usize {
        self.live.values().map(ObjectEntry::size).sum::<usize>()
            + self.draining.values().map(ObjectEntry::size).sum::<usize>()
    }
}

/// Cache statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub stored_bytes: usize,
    pub capacity: usize,
    pub pending_deletes: usize,
    pub draining_entries: usize,
    pub outstanding_leases: usize,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub arena: Option<ArenaStats>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
}

/// Single-node cache manager
pub struct CacheManager {
    config: CacheConfig,
    arena: Arc<Arena>,
    state: RwLock<CacheState>,
    counters: Counters,
}

impl CacheManager {
    /// Create a cache manager with its own arena
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let arena = Arc::new(Arena::new(config.arena.clone())?);

        tracing::info!(
            "Cache manager created: capacity={} max_object_size={} watermarks={:?}",
            config.arena.capacity,
            config.max_object_size,
            config.watermarks
        );

        Ok(Self {
            config,
            arena,
            state: RwLock::new(CacheState::default()),
            counters: Counters::default(),
        })
    }

    /// The arena backing this cache, for fabric registration
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store `payload` under `key`, replacing any previous version
    pub fn put(&self, key: Key, payload: &[u8]) -> CacheResult<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(CacheError::InvalidSize(format!(
                "key of {} bytes exceeds {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        if payload.is_empty() {
            return Err(CacheError::InvalidSize("empty payload".into()));
        }
        if payload.len() > self.config.max_object_size {
            return Err(CacheError::InvalidSize(format!(
                "payload of {} bytes exceeds max object size {}",
                payload.len(),
                self.config.max_object_size
            )));
        }

        let mut guard = self.state.write();
        let state = &mut *guard;

        if state.pending_deletes.contains_key(&key) {
            tracing::debug!("PUT conflict: key={} has a pending delete", key);
            return Err(CacheError::Conflict);
        }

        let region = self.allocate_locked(state, &key, payload.len())?;
        if let Err(e) = self.arena.write(region, payload) {
            tracing::error!("PUT write failed for key={}: {}", key, e);
            self.free_region(region);
            return Err(e);
        }

        let id = state.next_entry_id();
        let stamp = state.recency.insert(key.clone());
        let entry = ObjectEntry {
            id,
            key: key.clone(),
            region,
            ref_count: 0,
            last_access: stamp,
            inserted_at: stamp,
            state: EntryState::Active,
        };

        if let Some(old) = state.live.insert(key.clone(), entry) {
            state.recency.remove(old.last_access);
            self.retire_locked(state, old, EntryState::Superseded);
        }
        self.counters.puts.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            "PUT stored key={} offset={} size={}",
            key,
            region.offset,
            region.len
        );

        self.enforce_watermarks_locked(state, &key);
        Ok(())
    }

    /// Lease the current version of `key`
    pub fn get(&self, key: &Key) -> CacheResult<ObjectHandle> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(entry) = state.live.get_mut(key) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::NotFound);
        };

        let stamp = match state.recency.touch(entry.last_access) {
            Some(stamp) => stamp,
            None => {
                tracing::error!("recency index lost key={}, reinserting", key);
                state.recency.insert(key.clone())
            }
        };
        entry.last_access = stamp;
        entry.ref_count += 1;
        let handle_region = entry.region;
        let entry_id = entry.id;

        let lease = state.next_lease_id();
        state.leases.insert(
            lease,
            LeaseRecord {
                key: key.clone(),
                entry: entry_id,
            },
        );
        self.counters.hits.fetch_add(1, Ordering::Relaxed);

        Ok(ObjectHandle {
            key: key.clone(),
            lease,
            region: handle_region,
            size: handle_region.len,
        })
    }

    /// Copy the bytes behind a leased handle
    pub fn read(&self, handle: &ObjectHandle) -> CacheResult<Bytes> {
        self.with_object(handle, Bytes::copy_from_slice)
    }

    /// Borrow the bytes behind a leased handle without copying
    pub fn with_object<R>(
        &self,
        handle: &ObjectHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> CacheResult<R> {
        // The lease keeps the region reserved; holding the read lock keeps
        // a concurrent release from racing the check.
        let state = self.state.read();
        if !state.leases.contains_key(&handle.lease) {
            return Err(CacheError::internal(format!(
                "{} for key={} is not outstanding",
                handle.lease, handle.key
            )));
        }
        self.arena.with_region(handle.region, f)
    }

    /// Remove `key`. Storage is reclaimed once the last lease releases.
    pub fn delete(&self, key: &Key) -> CacheResult<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let entry = state.live.remove(key).ok_or(CacheError::NotFound)?;
        state.recency.remove(entry.last_access);

        if entry.ref_count > 0 {
            tracing::debug!(
                "DELETE deferred: key={} ref_count={}",
                key,
                entry.ref_count
            );
        }
        self.retire_locked(state, entry, EntryState::PendingDelete);
        Ok(())
    }

    /// Give back a lease obtained from `get`
    pub fn release_lease(&self, key: &Key, lease: LeaseId) -> CacheResult<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let record = state.leases.get(&lease).ok_or(CacheError::NotFound)?;
        if record.key != *key {
            return Err(CacheError::internal(format!(
                "{} belongs to key={}, not key={}",
                lease, record.key, key
            )));
        }
        let entry_id = record.entry;

        if let Some(entry) = state.live.get_mut(key).filter(|e| e.id == entry_id) {
            if entry.ref_count == 0 {
                return Err(CacheError::internal(format!(
                    "ref count underflow on key={}",
                    key
                )));
            }
            entry.ref_count -= 1;
            state.leases.remove(&lease);
            return Ok(());
        }

        let Some(entry) = state.draining.get_mut(&entry_id) else {
            return Err(CacheError::internal(format!(
                "{} pins unknown entry {:?}",
                lease, entry_id
            )));
        };
        if entry.ref_count == 0 {
            return Err(CacheError::internal(format!(
                "ref count underflow on draining key={}",
                key
            )));
        }
        entry.ref_count -= 1;
        state.leases.remove(&lease);

        if entry.ref_count == 0 {
            if let Some(entry) = state.draining.remove(&entry_id) {
                if entry.state == EntryState::PendingDelete
                    && state.pending_deletes.get(key) == Some(&entry_id)
                {
                    state.pending_deletes.remove(key);
                }
                tracing::debug!(
                    "Reclaimed {:?} key={} size={}",
                    entry.state,
                    key,
                    entry.size()
                );
                self.free_region(entry.region);
            }
        }
        Ok(())
    }

    /// Evict unreferenced entries, least recently used first, until an
    /// allocation of `bytes_needed` would succeed. Returns the number of
    /// entries evicted.
    pub fn evict_until(&self, bytes_needed: usize) -> CacheResult<usize> {
        let mut guard = self.state.write();
        self.evict_locked(&mut guard, bytes_needed, None)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.state.read().live.contains_key(key)
    }

    /// Stored size of the current version of `key`
    pub fn object_size(&self, key: &Key) -> CacheResult<usize> {
        self.state
            .read()
            .live
            .get(key)
            .map(ObjectEntry::size)
            .ok_or(CacheError::NotFound)
    }

    /// State of `key`: active, pending delete, or absent
    pub fn entry_state(&self, key: &Key) -> Option<EntryState> {
        let state = self.state.read();
        if state.live.contains_key(key) {
            Some(EntryState::Active)
        } else if state.pending_deletes.contains_key(key) {
            Some(EntryState::PendingDelete)
        } else {
            None
        }
    }

    /// Reference count of the current version of `key`
    pub fn ref_count(&self, key: &Key) -> Option<u32> {
        self.state.read().live.get(key).map(|e| e.ref_count)
    }

    pub fn len(&self) -> usize {
        self.state.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        CacheStats {
            entries: state.live.len(),
            stored_bytes: state.stored_bytes(),
            capacity: self.arena.capacity(),
            pending_deletes: state.pending_deletes.len(),
            draining_entries: state.draining.len(),
            outstanding_leases: state.leases.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            arena: Some(self.arena.stats()),
        }
    }

    /// Allocate room for a new version of `key`. An unreferenced previous
    /// version counts as free space but is only dropped once the rest of
    /// the eviction pass has succeeded.
    fn allocate_locked(
        &self,
        state: &mut CacheState,
        key: &Key,
        size: usize,
    ) -> CacheResult<Region> {
        match self.arena.allocate(size) {
            Err(CacheError::OutOfSpace { .. }) => {}
            other => return other,
        }

        let reclaim = state
            .live
            .get(key)
            .filter(|e| e.ref_count == 0)
            .map(|e| (key, e.region));
        self.evict_locked(state, size, reclaim)?;

        if !self.arena.can_allocate(size) {
            if let Some(old) = state.live.remove(key) {
                state.recency.remove(old.last_access);
                tracing::debug!(
                    "Reclaiming previous version of key={} size={}",
                    key,
                    old.size()
                );
                self.free_region(old.region);
            }
        }
        self.arena.allocate(size)
    }

    fn fits(&self, bytes_needed: usize, reclaim: Option<(&Key, Region)>) -> bool {
        match reclaim {
            Some((_, region)) => self.arena.can_allocate_after_free(bytes_needed, region),
            None => self.arena.can_allocate(bytes_needed),
        }
    }

    /// Evict unreferenced LRU entries until `bytes_needed` fits. The key in
    /// `reclaim` is never evicted here; its region is counted as free.
    fn evict_locked(
        &self,
        state: &mut CacheState,
        bytes_needed: usize,
        reclaim: Option<(&Key, Region)>,
    ) -> CacheResult<usize> {
        if self.fits(bytes_needed, reclaim) {
            return Ok(0);
        }

        let skip = reclaim.map(|(key, _)| key);
        let candidates: Vec<Key> = state
            .recency
            .iter_lru()
            .filter(|(_, key)| Some(*key) != skip)
            .filter(|(_, key)| state.live.get(*key).is_some_and(|e| e.ref_count == 0))
            .map(|(_, key)| key.clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            self.evict_entry_locked(state, &key);
            evicted += 1;
            if self.fits(bytes_needed, reclaim) {
                tracing::debug!(
                    "Evicted {} entries to fit {} bytes",
                    evicted,
                    bytes_needed
                );
                return Ok(evicted);
            }
        }

        tracing::warn!(
            "Eviction could not reclaim {} contiguous bytes (evicted {}, {} entries pinned)",
            bytes_needed,
            evicted,
            state.live.len()
        );
        Err(CacheError::OutOfSpace {
            needed: bytes_needed,
        })
    }

    fn evict_entry_locked(&self, state: &mut CacheState, key: &Key) {
        if let Some(entry) = state.live.remove(key) {
            state.recency.remove(entry.last_access);
            tracing::debug!("Evicting key={} size={}", key, entry.size());
            self.free_region(entry.region);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop a version that is no longer reachable by key
    fn retire_locked(&self, state: &mut CacheState, mut entry: ObjectEntry, as_state: EntryState) {
        if entry.ref_count == 0 {
            self.free_region(entry.region);
            return;
        }
        entry.state = as_state;
        if as_state == EntryState::PendingDelete {
            state.pending_deletes.insert(entry.key.clone(), entry.id);
        }
        state.draining.insert(entry.id, entry);
    }

    fn enforce_watermarks_locked(&self, state: &mut CacheState, just_written: &Key) {
        let Some(w) = self.config.watermarks else {
            return;
        };
        let capacity = self.arena.capacity() as f64;
        let high = (w.high * capacity) as usize;
        let low = (w.low * capacity) as usize;

        if self.arena.stats().used <= high {
            return;
        }

        let candidates: Vec<Key> = state
            .recency
            .iter_lru()
            .filter(|(_, key)| *key != just_written)
            .filter(|(_, key)| state.live.get(*key).is_some_and(|e| e.ref_count == 0))
            .map(|(_, key)| key.clone())
            .collect();

        for key in candidates {
            if self.arena.stats().used <= low {
                break;
            }
            self.evict_entry_locked(state, &key);
        }
        tracing::debug!(
            "Watermark eviction done: used={} low={} high={}",
            self.arena.stats().used,
            low,
            high
        );
    }

    fn free_region(&self, region: Region) {
        if let Err(e) = self.arena.free(region) {
            tracing::error!("Failed to free region {:?}: {}", region, e);
        }
    }
}
