//! In-memory revision caches with demand loading
//!
//! A cache keeps immutable revisions keyed by object id and falls back to an
//! injected [`RevisionLoader`] on a miss. Three variants implement the
//! [`RevisionCache`] contract:
//!
//! - [`BranchAwareCache`] keeps several revisions per id, each valid on one
//!   branch for a time interval, and answers "which revision is visible at
//!   this branch point" by picking the nearest preceding slot.
//! - [`CurrentRevisionCache`] keeps the current revision of each id per
//!   branch and only answers head reads. Historical points and revisions
//!   inherited from a parent branch always go to the loader.
//! - [`NoOpCache`] keeps nothing. With a loader it passes every request
//!   through, which makes it behave exactly like a capacity-0 cache.
//!
//! ## Loading
//!
//! A miss with `load_on_demand` set calls the loader with two bounds:
//! `reference_chunk` (how many entries of each reference list the loader
//! follows eagerly) and `prefetch_depth` (how many levels of referenced
//! objects it loads along with the requested one). Prefetched revisions are
//! cached too.
//!
//! ## Thread Safety
//!
//! - Hits read a `DashMap` shard and never wait on a load.
//! - Concurrent misses for one id share a per-id gate, so the id is loaded
//!   once; misses for different ids load in parallel.
//! - Recency is tracked with an LRU list; hits promote entries only when the
//!   list is uncontended.

use crate::branch::{BranchId, BranchPoint};
use crate::collections::{concurrent_table, GxBuildHasher, ObjectTable};
use crate::error::{Result, RevStoreError};
use crate::types::{ObjectId, RevisionRef, TypeId};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// A revision together with the interval it is visible in
#[derive(Debug, Clone)]
pub struct LoadedRevision {
    /// The revision
    pub revision: RevisionRef,
    /// First timestamp on the requested branch at which it is visible
    pub valid_from: i64,
    /// First timestamp at which it is no longer visible, 0 if still current
    pub valid_to: i64,
}

impl LoadedRevision {
    /// A revision visible from its own commit time onwards
    pub fn current(revision: RevisionRef) -> Self {
        let valid_from = revision.timestamp;
        Self {
            revision,
            valid_from,
            valid_to: 0,
        }
    }
}

/// Result of one load: the requested revision plus prefetched ones
#[derive(Debug, Clone)]
pub struct Loaded {
    /// Requested revision
    pub target: LoadedRevision,
    /// Revisions of referenced objects loaded eagerly
    pub prefetched: Vec<LoadedRevision>,
}

/// Source of revisions for caches
///
/// Calls may block. "No such object at this point" is `Ok(None)`, never an
/// error.
pub trait RevisionLoader: Send + Sync {
    /// Load the revision of `id` visible at `point`
    fn load(
        &self,
        id: ObjectId,
        point: &BranchPoint,
        reference_chunk: usize,
        prefetch_depth: usize,
    ) -> Result<Option<Loaded>>;

    /// Load several ids; the result is aligned with `ids`
    fn load_batch(
        &self,
        ids: &[ObjectId],
        point: &BranchPoint,
        reference_chunk: usize,
        prefetch_depth: usize,
    ) -> Result<Vec<Option<Loaded>>> {
        ids.par_iter()
            .map(|id| self.load(*id, point, reference_chunk, prefetch_depth))
            .collect()
    }
}

/// Which lookup semantics a cache implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Several revisions per id, resolved by branch point
    #[default]
    BranchAware,
    /// Current revision per id and branch, head reads only
    Current,
    /// Nothing is cached
    Disabled,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from memory
    pub hits: u64,
    /// Lookups not answered from memory
    pub misses: u64,
    /// Loader calls issued
    pub loads: u64,
    /// Ids dropped to respect the capacity
    pub evictions: u64,
}

impl CacheStats {
    /// Hits over all lookups (0.0-1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Keyed store of in-memory revisions
pub trait RevisionCache: Send + Sync {
    /// Lookup semantics of this cache
    fn mode(&self) -> CacheMode;

    /// Whether lookups honour the branch point
    fn is_branch_aware(&self) -> bool {
        self.mode() == CacheMode::BranchAware
    }

    /// Revision of `id` visible at `point`, loading it on a miss if asked to
    fn get_revision(
        &self,
        id: ObjectId,
        point: &BranchPoint,
        reference_chunk: usize,
        prefetch_depth: usize,
        load_on_demand: bool,
    ) -> Result<Option<RevisionRef>>;

    /// Batch form of [`get_revision`](Self::get_revision); the result is aligned with `ids`
    fn get_revisions(
        &self,
        ids: &[ObjectId],
        point: &BranchPoint,
        reference_chunk: usize,
        prefetch_depth: usize,
        load_on_demand: bool,
    ) -> Result<Vec<Option<RevisionRef>>>;

    /// Whether any revision of `id` is cached; never loads
    fn contains_revision(&self, id: ObjectId) -> bool;

    /// Type of a cached object; never loads
    fn get_object_type(&self, id: ObjectId) -> Option<TypeId>;

    /// Cache a freshly committed revision, superseding the previous one on its branch
    fn add_revision(&self, revision: RevisionRef);

    /// End the visibility of the current revision of `id` on `branch` at `timestamp`
    fn revise(&self, id: ObjectId, branch: BranchId, timestamp: i64);

    /// Drop every revision of `id`, returning the newest one
    fn remove_revision(&self, id: ObjectId) -> Option<RevisionRef>;

    /// Drop everything
    fn clear(&self);

    /// Number of cached ids
    fn len(&self) -> usize;

    /// Whether nothing is cached
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot
    fn stats(&self) -> CacheStats;
}

/// One cached revision and where it is visible
#[derive(Debug, Clone)]
pub struct Slot {
    /// Branch the slot answers for
    pub branch: BranchId,
    /// Start of visibility
    pub valid_from: i64,
    /// End of visibility, 0 if open
    pub valid_to: i64,
    /// The revision
    pub revision: RevisionRef,
}

impl Slot {
    fn covers(&self, point: &BranchPoint) -> bool {
        self.branch == point.branch_id()
            && self.valid_from <= point.timestamp
            && (self.valid_to == 0 || point.timestamp < self.valid_to)
    }

    fn is_open(&self) -> bool {
        self.valid_to == 0
    }
}

/// How a cache arranges the slots of one id
pub trait SlotPolicy: Send + Sync + 'static {
    /// Mode reported by caches using this policy
    const MODE: CacheMode;

    /// Revision visible at `point`
    fn lookup(slots: &[Slot], point: &BranchPoint) -> Option<RevisionRef>;

    /// Whether a slot may be cached at all
    fn admits(_slot: &Slot) -> bool {
        true
    }

    /// Record a new slot
    fn insert(slots: &mut Vec<Slot>, slot: Slot);

    /// Close the open slot on `branch` at `timestamp`
    fn revise(slots: &mut Vec<Slot>, branch: BranchId, timestamp: i64);
}

/// Slots per branch with visibility intervals
///
/// At most [`BranchAware::MAX_SLOTS_PER_ID`] slots are kept per id. Past
/// that, closed slots are dropped oldest first; open slots always stay.
#[derive(Debug)]
pub struct BranchAware;

impl BranchAware {
    /// Slot limit for one id
    pub const MAX_SLOTS_PER_ID: usize = 32;
}

impl SlotPolicy for BranchAware {
    const MODE: CacheMode = CacheMode::BranchAware;

    fn lookup(slots: &[Slot], point: &BranchPoint) -> Option<RevisionRef> {
        slots
            .iter()
            .filter(|slot| slot.covers(point))
            .max_by_key(|slot| slot.valid_from)
            .map(|slot| slot.revision.clone())
    }

    fn insert(slots: &mut Vec<Slot>, slot: Slot) {
        slots.retain(|existing| {
            !(existing.branch == slot.branch
                && existing.valid_from == slot.valid_from
                && existing.revision.key == slot.revision.key)
        });
        for existing in slots.iter_mut() {
            if existing.branch == slot.branch && existing.is_open() && existing.valid_from < slot.valid_from {
                existing.valid_to = slot.valid_from;
            }
        }
        slots.push(slot);

        while slots.len() > Self::MAX_SLOTS_PER_ID {
            let oldest = slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| !slot.is_open())
                .min_by_key(|(_, slot)| slot.valid_from)
                .map(|(index, _)| index);
            let Some(oldest) = oldest else {
                break;
            };
            slots.swap_remove(oldest);
        }
    }

    fn revise(slots: &mut Vec<Slot>, branch: BranchId, timestamp: i64) {
        for slot in slots.iter_mut() {
            if slot.branch == branch && slot.is_open() && slot.valid_from <= timestamp {
                slot.valid_to = timestamp;
            }
        }
    }
}

/// Current revision per branch, answering head reads only
#[derive(Debug)]
pub struct CurrentOnly;

impl SlotPolicy for CurrentOnly {
    const MODE: CacheMode = CacheMode::Current;

    fn lookup(slots: &[Slot], point: &BranchPoint) -> Option<RevisionRef> {
        if !point.is_head() {
            return None;
        }
        slots
            .iter()
            .find(|slot| slot.branch == point.branch_id())
            .map(|slot| slot.revision.clone())
    }

    /// Only open revisions written on the slot's own branch
    fn admits(slot: &Slot) -> bool {
        slot.is_open() && slot.revision.branch == slot.branch
    }

    fn insert(slots: &mut Vec<Slot>, slot: Slot) {
        match slots.iter_mut().find(|existing| existing.branch == slot.branch) {
            Some(current) if current.revision.key.version > slot.revision.key.version => {}
            Some(current) => *current = slot,
            None => slots.push(slot),
        }
    }

    fn revise(slots: &mut Vec<Slot>, branch: BranchId, _timestamp: i64) {
        slots.retain(|slot| slot.branch != branch);
    }
}

/// Cache keeping several revisions per id, resolved by branch point
pub type BranchAwareCache = LoadingCache<BranchAware>;

/// Cache keeping the current revision per id and branch
pub type CurrentRevisionCache = LoadingCache<CurrentOnly>;

/// Bounded, demand-loading revision cache parameterised by slot policy
pub struct LoadingCache<P: SlotPolicy> {
    loader: Arc<dyn RevisionLoader>,
    entries: ObjectTable<Vec<Slot>>,
    /// `None` when the capacity is 0
    recency: Mutex<Option<LruCache<ObjectId, ()>>>,
    gates: DashMap<ObjectId, Arc<Mutex<()>>, GxBuildHasher>,
    pool: Option<rayon::ThreadPool>,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    _policy: PhantomData<P>,
}

impl<P: SlotPolicy> fmt::Debug for LoadingCache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingCache")
            .field("mode", &P::MODE)
            .field("entries", &self.entries.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<P: SlotPolicy> LoadingCache<P> {
    /// Create a cache holding at most `capacity` ids
    pub fn new(loader: Arc<dyn RevisionLoader>, capacity: usize) -> Self {
        Self {
            loader,
            entries: concurrent_table(capacity.min(4096)),
            recency: Mutex::new(NonZeroUsize::new(capacity).map(LruCache::new)),
            gates: concurrent_table(64),
            pool: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            _policy: PhantomData,
        }
    }

    /// Run batch loads on a dedicated pool of `workers` threads
    pub fn with_load_workers(mut self, workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("revstore-load-{}", i))
            .build()
            .map_err(|e| RevStoreError::InvalidConfiguration(format!("load pool: {}", e)))?;
        self.pool = Some(pool);
        Ok(self)
    }

    fn lookup(&self, id: ObjectId, point: &BranchPoint) -> Option<RevisionRef> {
        let found = self
            .entries
            .get(&id)
            .and_then(|slots| P::lookup(slots.value(), point));
        if found.is_some() {
            if let Some(mut recency) = self.recency.try_lock() {
                if let Some(lru) = recency.as_mut() {
                    lru.promote(&id);
                }
            }
        }
        found
    }

    fn store(&self, branch: BranchId, loaded: &LoadedRevision) {
        self.insert_slot(Slot {
            branch,
            valid_from: loaded.valid_from,
            valid_to: loaded.valid_to,
            revision: loaded.revision.clone(),
        });
    }

    fn insert_slot(&self, slot: Slot) {
        if !P::admits(&slot) {
            return;
        }
        let id = slot.revision.key.id;
        let mut recency = self.recency.lock();
        let Some(lru) = recency.as_mut() else {
            return;
        };

        if let Some((evicted, _)) = lru.push(id, ()) {
            if evicted != id {
                self.entries.remove(&evicted);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!("Evicted {} from revision cache", evicted);
            }
        }
        P::insert(&mut self.entries.entry(id).or_default(), slot);
    }

    fn store_loaded(&self, point: &BranchPoint, loaded: &Loaded) {
        self.store(point.branch_id(), &loaded.target);
        for prefetched in &loaded.prefetched {
            self.store(point.branch_id(), prefetched);
        }
    }

    fn load_one(
        &self,
        id: ObjectId,
        point: &BranchPoint,
        reference_chunk: usize,
        prefetch_depth: usize,
    ) -> Result<Option<RevisionRef>> {
        let gate = self.gates.entry(id).or_default().clone();
        let result = {
            let _guard = gate.lock();
            match self.lookup(id, point) {
                Some(revision) => Ok(Some(revision)),
                None => {
                    self.loads.fetch_add(1, Ordering::Relaxed);
                    debug!("Loading {} at {}", id, point);
                    match self.loader.load(id, point, reference_chunk, prefetch_depth) {
                        Ok(Some(loaded)) => {
                            self.store_loaded(point, &loaded);
                            Ok(Some(loaded.target.revision))
                        }
                        Ok(None) => Ok(None),
                        Err(err) => Err(wrap_load_error(id, err)),
                    }
                }
            }
        };
        drop(gate);
        self.gates.remove_if(&id, |_, gate| Arc::strong_count(gate) == 1);
        result
    }
}

fn wrap_load_error(id: ObjectId, err: RevStoreError) -> RevStoreError {
    if err.is_load_failure() {
        err
    } else {
        RevStoreError::load_failure(format!("revision {}", id), err.to_string())
    }
}

fn wrap_batch_error(err: RevStoreError) -> RevStoreError {
    if err.is_load_failure() {
        err
    } else {
        RevStoreError::load_failure("revision batch", err.to_string())
    }
}

impl<P: SlotPolicy> RevisionCache for LoadingCache<P> {
    fn mode(&self) -> CacheMode {
        P::MODE
    }

    fn get_revision(
        &self,
        id: ObjectId,
        point: &BranchPoint,
        reference_chunk: usize,
        prefetch_depth: usize,
        load_on_demand: bool,
    ) -> Result<Option<RevisionRef>> {
        if let Some(revision) = self.lookup(id, point) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(revision));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        if !load_on_demand {
            return Ok(None);
        }
        self.load_one(id, point, reference_chunk, prefetch_depth)
    }

    fn get_revisions(
        &self,
        ids: &[ObjectId],
        point: &BranchPoint,
        reference_chunk: usize,
        prefetch_depth: usize,
        load_on_demand: bool,
    ) -> Result<Vec<Option<RevisionRef>>> {
        let mut result: Vec<Option<RevisionRef>> = ids.iter().map(|id| self.lookup(*id, point)).collect();

        let missing: Vec<usize> = (0..ids.len()).filter(|i| result[*i].is_none()).collect();
        self.hits.fetch_add((ids.len() - missing.len()) as u64, Ordering::Relaxed);
        self.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);
        if missing.is_empty() || !load_on_demand {
            return Ok(result);
        }

        let missing_ids: Vec<ObjectId> = missing.iter().map(|i| ids[*i]).collect();
        self.loads.fetch_add(missing_ids.len() as u64, Ordering::Relaxed);
        debug!("Batch loading {} revisions at {}", missing_ids.len(), point);

        let load = || self.loader.load_batch(&missing_ids, point, reference_chunk, prefetch_depth);
        let loaded = match &self.pool {
            Some(pool) => pool.install(load),
            None => load(),
        }
        .map_err(wrap_batch_error)?;

        if loaded.len() != missing_ids.len() {
            return Err(RevStoreError::internal(format!(
                "loader returned {} results for {} ids",
                loaded.len(),
                missing_ids.len()
            )));
        }

        for (index, entry) in missing.into_iter().zip(loaded) {
            if let Some(loaded) = entry {
                self.store_loaded(point, &loaded);
                result[index] = Some(loaded.target.revision);
            }
        }
        Ok(result)
    }

    fn contains_revision(&self, id: ObjectId) -> bool {
        self.entries.get(&id).is_some_and(|slots| !slots.is_empty())
    }

    fn get_object_type(&self, id: ObjectId) -> Option<TypeId> {
        self.entries
            .get(&id)
            .and_then(|slots| slots.first().map(|slot| slot.revision.type_id))
    }

    fn add_revision(&self, revision: RevisionRef) {
        self.insert_slot(Slot {
            branch: revision.branch,
            valid_from: revision.timestamp,
            valid_to: 0,
            revision,
        });
    }

    fn revise(&self, id: ObjectId, branch: BranchId, timestamp: i64) {
        let _recency = self.recency.lock();
        if let Some(mut slots) = self.entries.get_mut(&id) {
            P::revise(&mut slots, branch, timestamp);
        }
        self.entries.remove_if(&id, |_, slots| slots.is_empty());
    }

    fn remove_revision(&self, id: ObjectId) -> Option<RevisionRef> {
        let mut recency = self.recency.lock();
        if let Some(lru) = recency.as_mut() {
            lru.pop(&id);
        }
        self.entries.remove(&id).and_then(|(_, slots)| {
            slots
                .into_iter()
                .map(|slot| slot.revision)
                .max_by_key(|revision| revision.key.version)
        })
    }

    fn clear(&self) {
        let mut recency = self.recency.lock();
        if let Some(lru) = recency.as_mut() {
            lru.clear();
        }
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Cache that stores nothing
///
/// With a loader every request is a miss that is passed through; without one
/// every request is a plain miss.
#[derive(Default)]
pub struct NoOpCache {
    loader: Option<Arc<dyn RevisionLoader>>,
    misses: AtomicU64,
    loads: AtomicU64,
}

impl fmt::Debug for NoOpCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoOpCache")
            .field("has_loader", &self.loader.is_some())
            .finish()
    }
}

impl NoOpCache {
    /// A cache with nothing to load from
    pub fn new() -> Self {
        Self::default()
    }

    /// A pass-through cache over a loader
    pub fn with_loader(loader: Arc<dyn RevisionLoader>) -> Self {
        Self {
            loader: Some(loader),
            ..Self::default()
        }
    }
}

impl RevisionCache for NoOpCache {
    fn mode(&self) -> CacheMode {
        CacheMode::Disabled
    }

    fn get_revision(
        &self,
        id: ObjectId,
        point: &BranchPoint,
        reference_chunk: usize,
        prefetch_depth: usize,
        load_on_demand: bool,
    ) -> Result<Option<RevisionRef>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        match &self.loader {
            Some(loader) if load_on_demand => {
                self.loads.fetch_add(1, Ordering::Relaxed);
                loader
                    .load(id, point, reference_chunk, prefetch_depth)
                    .map(|loaded| loaded.map(|loaded| loaded.target.revision))
                    .map_err(|err| wrap_load_error(id, err))
            }
            _ => Ok(None),
        }
    }

    fn get_revisions(
        &self,
        ids: &[ObjectId],
        point: &BranchPoint,
        reference_chunk: usize,
        prefetch_depth: usize,
        load_on_demand: bool,
    ) -> Result<Vec<Option<RevisionRef>>> {
        self.misses.fetch_add(ids.len() as u64, Ordering::Relaxed);
        match &self.loader {
            Some(loader) if load_on_demand && !ids.is_empty() => {
                self.loads.fetch_add(ids.len() as u64, Ordering::Relaxed);
                let loaded = loader
                    .load_batch(ids, point, reference_chunk, prefetch_depth)
                    .map_err(wrap_batch_error)?;
                Ok(loaded
                    .into_iter()
                    .map(|entry| entry.map(|loaded| loaded.target.revision))
                    .collect())
            }
            _ => Ok(vec![None; ids.len()]),
        }
    }

    fn contains_revision(&self, _id: ObjectId) -> bool {
        false
    }

    fn get_object_type(&self, _id: ObjectId) -> Option<TypeId> {
        None
    }

    fn add_revision(&self, _revision: RevisionRef) {}

    fn revise(&self, _id: ObjectId, _branch: BranchId, _timestamp: i64) {}

    fn remove_revision(&self, _id: ObjectId) -> Option<RevisionRef> {
        None
    }

    fn clear(&self) {}

    fn len(&self) -> usize {
        0
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: 0,
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: 0,
        }
    }
}

/// Build the cache variant selected by `mode`
pub fn create_cache(
    mode: CacheMode,
    loader: Arc<dyn RevisionLoader>,
    capacity: usize,
    load_workers: usize,
) -> Result<Arc<dyn RevisionCache>> {
    Ok(match mode {
        CacheMode::BranchAware => Arc::new(BranchAwareCache::new(loader, capacity).with_load_workers(load_workers)?),
        CacheMode::Current => Arc::new(CurrentRevisionCache::new(loader, capacity).with_load_workers(load_workers)?),
        CacheMode::Disabled => Arc::new(NoOpCache::with_loader(loader)),
    })
}
