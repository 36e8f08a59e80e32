//! In-memory reference backend
//!
//! [`MemoryStore`] implements every port the core talks to: it is the
//! [`StoragePort`] commits are written to, the [`RevisionLoader`] and
//! [`BranchLoader`] caches and branch trees load from, and the
//! [`ChangeSetSource`] the classifier asks for segment data.
//!
//! ## Data model
//!
//! Every object keeps a history of versions. A version is valid on its
//! branch from its commit timestamp until it is revised (superseded or
//! detached) on the same branch. Detachment is recorded as a tombstone
//! version. A lookup on a branch that has no version of its own falls back
//! to the base branch at the branch's base timestamp, recursively up to main.
//!
//! ## Persistence
//!
//! A store can be saved to and reopened from a directory:
//!
//! ```text
//! snapshot_dir/
//! ├── metadata.json   # Store id, format version, timestamps, counts
//! └── revisions.bin   # Branches, histories, commits, units and large objects
//!                     # (bincode, lz4 compressed)
//! ```

use crate::branch::{
    BranchId, BranchInfo, BranchLoader, BranchPoint, SubBranchInfo, MAIN_BRANCH_ID, MAIN_BRANCH_NAME,
};
use crate::cache::{Loaded, LoadedRevision, RevisionLoader};
use crate::classifier::{ChangeSetSource, Segment};
use crate::collections::{concurrent_table, GxBuildHasher, HashSet, HashSetExt, ObjectTable};
use crate::commit::StoragePort;
use crate::error::{Result, RevStoreError};
use crate::lob::{ClobReader, LobId};
use crate::repository::Backend;
use crate::types::{
    ChangeSetData, CommitMetadata, CommitSummary, ObjectId, PackageUnit, Revision, RevisionDelta, RevisionKey,
    RevisionRef,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Format version written to `metadata.json`
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const METADATA_FILE: &str = "metadata.json";
const DATA_FILE: &str = "revisions.bin";

/// Description of a saved store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Snapshot format version
    pub format_version: u32,
    /// Unique store id
    pub store_id: Uuid,
    /// Version of the crate that wrote the snapshot
    pub crate_version: String,
    /// When the store was created
    pub created_at: DateTime<Utc>,
    /// When the snapshot was written
    pub saved_at: DateTime<Utc>,
    /// Whether the store accepts deltas
    pub supports_deltas: bool,
    /// Number of non-main branches
    pub branch_count: usize,
    /// Number of objects with a history
    pub object_count: usize,
    /// Number of completed commits
    pub commit_count: usize,
}

/// Large object content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LargeObject {
    /// Binary content
    Blob(Vec<u8>),
    /// Character content
    Clob(String),
}

/// What one completed commit wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Commit metadata
    pub metadata: CommitMetadata,
    /// Ids of structural units introduced
    pub package_units: Vec<String>,
    /// Keys of created objects
    pub new_objects: Vec<RevisionKey>,
    /// Keys of the new versions of changed objects
    pub changed_objects: Vec<RevisionKey>,
    /// Detached objects
    pub detached_objects: Vec<ObjectId>,
    /// Large objects written
    pub large_objects: Vec<LobId>,
}

impl CommitRecord {
    fn new(metadata: CommitMetadata) -> Self {
        Self {
            metadata,
            package_units: Vec::new(),
            new_objects: Vec::new(),
            changed_objects: Vec::new(),
            detached_objects: Vec::new(),
            large_objects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredBranch {
    id: BranchId,
    name: String,
    base_branch: BranchId,
    base_timestamp: i64,
}

/// One entry of an object history
#[derive(Debug, Clone)]
struct StoredVersion {
    branch: BranchId,
    timestamp: i64,
    /// 0 while current on its branch
    revised: i64,
    /// `None` for a detachment
    revision: Option<RevisionRef>,
}

/// Writes of the commit in progress, applied when it finishes
struct PendingCommit {
    record: CommitRecord,
    versions: Vec<(ObjectId, StoredVersion)>,
    package_units: Vec<PackageUnit>,
    large_objects: Vec<(LobId, LargeObject)>,
}

impl PendingCommit {
    fn new(metadata: CommitMetadata) -> Self {
        Self {
            record: CommitRecord::new(metadata),
            versions: Vec::new(),
            package_units: Vec::new(),
            large_objects: Vec::new(),
        }
    }

    fn stage(&mut self, id: ObjectId, branch: BranchId, timestamp: i64, revision: Option<RevisionRef>) {
        self.versions.push((
            id,
            StoredVersion {
                branch,
                timestamp,
                revised: 0,
                revision,
            },
        ));
    }

    fn stage_lob(&mut self, id: &LobId, lob: LargeObject) {
        self.record.large_objects.push(id.clone());
        self.large_objects.push((id.clone(), lob));
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedVersion {
    branch: BranchId,
    timestamp: i64,
    revised: i64,
    revision: Option<Revision>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    branches: Vec<StoredBranch>,
    next_branch: BranchId,
    next_local_branch: BranchId,
    histories: Vec<(ObjectId, Vec<PersistedVersion>)>,
    commits: Vec<CommitRecord>,
    package_units: Vec<PackageUnit>,
    large_objects: Vec<(LobId, LargeObject)>,
}

/// In-memory storage backend with optional on-disk snapshots
pub struct MemoryStore {
    store_id: Uuid,
    created_at: DateTime<Utc>,
    supports_deltas: bool,
    branches: DashMap<BranchId, StoredBranch, GxBuildHasher>,
    next_branch: AtomicI32,
    next_local_branch: AtomicI32,
    histories: ObjectTable<Vec<StoredVersion>>,
    commits: RwLock<Vec<CommitRecord>>,
    pending: Mutex<Option<PendingCommit>>,
    package_units: DashMap<String, PackageUnit, GxBuildHasher>,
    large_objects: DashMap<LobId, LargeObject, GxBuildHasher>,
    revision_loads: AtomicU64,
    branch_loads: AtomicU64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("store_id", &self.store_id)
            .field("supports_deltas", &self.supports_deltas)
            .field("branches", &self.branches.len())
            .field("objects", &self.histories.len())
            .field("commits", &self.commits.read().len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store writing changed objects as full revisions
    pub fn new() -> Self {
        Self {
            store_id: Uuid::new_v4(),
            created_at: Utc::now(),
            supports_deltas: false,
            branches: concurrent_table(16),
            next_branch: AtomicI32::new(1),
            next_local_branch: AtomicI32::new(-1),
            histories: concurrent_table(1024),
            commits: RwLock::new(Vec::new()),
            pending: Mutex::new(None),
            package_units: concurrent_table(16),
            large_objects: concurrent_table(16),
            revision_loads: AtomicU64::new(0),
            branch_loads: AtomicU64::new(0),
        }
    }

    /// Choose whether changed objects are accepted as deltas
    pub fn with_delta_support(mut self, supports_deltas: bool) -> Self {
        self.supports_deltas = supports_deltas;
        self
    }

    /// Unique id of this store
    pub fn store_id(&self) -> Uuid {
        self.store_id
    }

    /// Number of revision loads served
    pub fn revision_loads(&self) -> u64 {
        self.revision_loads.load(Ordering::SeqCst)
    }

    /// Number of branch loads served
    pub fn branch_loads(&self) -> u64 {
        self.branch_loads.load(Ordering::SeqCst)
    }

    /// Completed commits in commit order
    pub fn commits(&self) -> Vec<CommitRecord> {
        self.commits.read().clone()
    }

    /// Number of objects with a history
    pub fn object_count(&self) -> usize {
        self.histories.len()
    }

    /// Stored structural unit
    pub fn package_unit(&self, id: &str) -> Option<PackageUnit> {
        self.package_units.get(id).map(|unit| unit.clone())
    }

    /// Stored large object
    pub fn large_object(&self, id: &LobId) -> Option<LargeObject> {
        self.large_objects.get(id).map(|lob| lob.clone())
    }

    /// Revision with exactly this key, on any branch
    pub fn revision_by_key(&self, key: RevisionKey) -> Option<RevisionRef> {
        self.histories.get(&key.id).and_then(|history| {
            history
                .iter()
                .filter_map(|version| version.revision.as_ref())
                .find(|revision| revision.key == key)
                .cloned()
        })
    }

    fn branch_record(&self, id: BranchId) -> Result<StoredBranch> {
        self.branches
            .get(&id)
            .map(|branch| branch.clone())
            .ok_or(RevStoreError::BranchNotFound(id))
    }

    /// Allocate the id of a new branch
    ///
    /// Local-only branches count down from -1 and persisted ones count up
    /// from 1. A branch is local when requested through [`BranchInfo::local`]
    /// or when it descends from a local branch.
    fn allocate_branch_id(&self, info: &BranchInfo) -> BranchId {
        if info.local || info.base_branch < 0 {
            self.next_local_branch.fetch_sub(1, Ordering::SeqCst)
        } else {
            self.next_branch.fetch_add(1, Ordering::SeqCst)
        }
    }

    fn ensure_branch(&self, id: BranchId) -> Result<()> {
        if id == MAIN_BRANCH_ID || self.branches.contains_key(&id) {
            Ok(())
        } else {
            Err(RevStoreError::BranchNotFound(id))
        }
    }

    /// Version of `id` visible on `branch` at `timestamp`, with its validity on that branch
    fn resolve(&self, id: ObjectId, branch: BranchId, timestamp: i64) -> Result<Option<LoadedRevision>> {
        if branch != MAIN_BRANCH_ID {
            let record = self.branch_record(branch)?;
            if timestamp < record.base_timestamp {
                // Before its base point a branch shows its parent, up to the base
                return Ok(self.resolve(id, record.base_branch, timestamp)?.map(|mut loaded| {
                    if loaded.valid_to == 0 || loaded.valid_to > record.base_timestamp {
                        loaded.valid_to = record.base_timestamp;
                    }
                    loaded
                }));
            }
        }

        let Some(history) = self.histories.get(&id) else {
            return Ok(None);
        };

        let mut current = branch;
        let mut at = timestamp;
        let mut valid_from = None;
        let mut valid_to = 0;
        loop {
            let visible = history
                .iter()
                .filter(|version| version.branch == current && version.timestamp <= at)
                .max_by_key(|version| version.timestamp);

            if current == branch {
                if let Some(version) = visible {
                    return Ok(version.revision.clone().map(|revision| LoadedRevision {
                        revision,
                        valid_from: version.timestamp,
                        valid_to: version.revised,
                    }));
                }
                valid_to = history
                    .iter()
                    .filter(|version| version.branch == current && version.timestamp > at)
                    .map(|version| version.timestamp)
                    .min()
                    .unwrap_or(0);
            } else if let Some(version) = visible {
                return Ok(version.revision.clone().map(|revision| LoadedRevision {
                    revision,
                    valid_from: valid_from.unwrap_or(0),
                    valid_to,
                }));
            }

            if current == MAIN_BRANCH_ID {
                return Ok(None);
            }
            let record = self.branch_record(current)?;
            valid_from.get_or_insert(record.base_timestamp);
            current = record.base_branch;
            at = at.min(record.base_timestamp);
        }
    }

    fn with_pending<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut PendingCommit),
    {
        let mut guard = self.pending.lock();
        let pending = guard
            .as_mut()
            .ok_or_else(|| RevStoreError::invariant("no commit in progress"))?;
        update(pending);
        Ok(())
    }

    fn append_version(&self, id: ObjectId, branch: BranchId, timestamp: i64, revision: Option<RevisionRef>) {
        let mut history = self.histories.entry(id).or_default();
        for version in history.iter_mut() {
            if version.branch == branch && version.revised == 0 && version.timestamp <= timestamp {
                version.revised = timestamp;
            }
        }
        history.push(StoredVersion {
            branch,
            timestamp,
            revised: 0,
            revision,
        });
    }

    fn latest_version_of(&self, id: ObjectId) -> Option<i32> {
        self.histories.get(&id).and_then(|history| {
            history
                .iter()
                .filter_map(|version| version.revision.as_ref().map(|r| r.key.version))
                .max()
        })
    }

    /// Write the store to `dir`, replacing an earlier snapshot there
    pub fn save(&self, dir: &Path) -> Result<StoreMetadata> {
        fs::create_dir_all(dir)?;

        let snapshot = Snapshot {
            branches: self.branches.iter().map(|branch| branch.clone()).collect(),
            next_branch: self.next_branch.load(Ordering::SeqCst),
            next_local_branch: self.next_local_branch.load(Ordering::SeqCst),
            histories: self
                .histories
                .iter()
                .map(|entry| {
                    let versions = entry
                        .value()
                        .iter()
                        .map(|version| PersistedVersion {
                            branch: version.branch,
                            timestamp: version.timestamp,
                            revised: version.revised,
                            revision: version.revision.as_deref().cloned(),
                        })
                        .collect();
                    (*entry.key(), versions)
                })
                .collect(),
            commits: self.commits(),
            package_units: self.package_units.iter().map(|unit| unit.clone()).collect(),
            large_objects: self
                .large_objects
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        };

        let bytes = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())?;
        let compressed = compress_prepend_size(&bytes);
        fs::write(dir.join(DATA_FILE), &compressed)?;

        let metadata = StoreMetadata {
            format_version: SNAPSHOT_FORMAT_VERSION,
            store_id: self.store_id,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: self.created_at,
            saved_at: Utc::now(),
            supports_deltas: self.supports_deltas,
            branch_count: snapshot.branches.len(),
            object_count: snapshot.histories.len(),
            commit_count: snapshot.commits.len(),
        };
        fs::write(dir.join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?)?;

        info!(
            "Saved store {} to {:?} ({} objects, {} bytes)",
            self.store_id,
            dir,
            metadata.object_count,
            compressed.len()
        );
        Ok(metadata)
    }

    /// Reopen a store saved with [`save`](Self::save)
    pub fn open(dir: &Path) -> Result<Self> {
        let metadata: StoreMetadata = serde_json::from_str(&fs::read_to_string(dir.join(METADATA_FILE))?)?;
        if metadata.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(RevStoreError::load_failure(
                format!("snapshot {:?}", dir),
                format!("unsupported format version {}", metadata.format_version),
            ));
        }

        let compressed = fs::read(dir.join(DATA_FILE))?;
        let bytes = decompress_size_prepended(&compressed)
            .map_err(|e| RevStoreError::load_failure(format!("snapshot {:?}", dir), e.to_string()))?;
        let (snapshot, _): (Snapshot, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;

        let store = Self {
            store_id: metadata.store_id,
            created_at: metadata.created_at,
            supports_deltas: metadata.supports_deltas,
            next_branch: AtomicI32::new(snapshot.next_branch),
            next_local_branch: AtomicI32::new(snapshot.next_local_branch),
            commits: RwLock::new(snapshot.commits),
            ..Self::new()
        };
        for branch in snapshot.branches {
            store.branches.insert(branch.id, branch);
        }
        for (id, versions) in snapshot.histories {
            let versions = versions
                .into_iter()
                .map(|version| StoredVersion {
                    branch: version.branch,
                    timestamp: version.timestamp,
                    revised: version.revised,
                    revision: version.revision.map(Arc::new),
                })
                .collect();
            store.histories.insert(id, versions);
        }
        for unit in snapshot.package_units {
            store.package_units.insert(unit.id.clone(), unit);
        }
        for (id, lob) in snapshot.large_objects {
            store.large_objects.insert(id, lob);
        }

        info!(
            "Opened store {} from {:?} ({} objects, {} commits)",
            store.store_id,
            dir,
            store.histories.len(),
            store.commits.read().len()
        );
        Ok(store)
    }
}

impl BranchLoader for MemoryStore {
    fn load_branch(&self, id: BranchId) -> Result<BranchInfo> {
        self.branch_loads.fetch_add(1, Ordering::SeqCst);
        if id == MAIN_BRANCH_ID {
            return Ok(BranchInfo {
                name: MAIN_BRANCH_NAME.to_string(),
                base_branch: MAIN_BRANCH_ID,
                base_timestamp: 0,
                local: false,
            });
        }
        let record = self.branch_record(id)?;
        Ok(BranchInfo {
            name: record.name,
            base_branch: record.base_branch,
            base_timestamp: record.base_timestamp,
            local: record.id < 0,
        })
    }

    fn load_sub_branches(&self, id: BranchId) -> Result<Vec<SubBranchInfo>> {
        self.branch_loads.fetch_add(1, Ordering::SeqCst);
        self.ensure_branch(id)?;
        let mut subs: Vec<StoredBranch> = self
            .branches
            .iter()
            .filter(|branch| branch.base_branch == id)
            .map(|branch| branch.clone())
            .collect();
        subs.sort_by_key(|branch| branch.id.unsigned_abs());
        Ok(subs
            .into_iter()
            .map(|branch| SubBranchInfo {
                id: branch.id,
                name: branch.name,
                base_timestamp: branch.base_timestamp,
            })
            .collect())
    }

    fn create_branch(&self, info: &BranchInfo) -> Result<BranchId> {
        self.ensure_branch(info.base_branch)?;
        let id = self.allocate_branch_id(info);
        self.branches.insert(
            id,
            StoredBranch {
                id,
                name: info.name.clone(),
                base_branch: info.base_branch,
                base_timestamp: info.base_timestamp,
            },
        );
        debug!("Stored branch {} '{}'", id, info.name);
        Ok(id)
    }
}

impl RevisionLoader for MemoryStore {
    fn load(
        &self,
        id: ObjectId,
        point: &BranchPoint,
        reference_chunk: usize,
        prefetch_depth: usize,
    ) -> Result<Option<Loaded>> {
        self.revision_loads.fetch_add(1, Ordering::SeqCst);
        let branch = point.branch_id();
        let Some(target) = self.resolve(id, branch, point.timestamp)? else {
            return Ok(None);
        };

        let mut prefetched = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(id);
        let mut frontier = vec![target.revision.clone()];
        for _ in 0..prefetch_depth {
            let mut next = Vec::new();
            for revision in &frontier {
                for list in revision.data.reference_lists() {
                    let take = if reference_chunk == 0 { list.len() } else { reference_chunk };
                    for referenced in list.iter().take(take) {
                        if !visited.insert(*referenced) {
                            continue;
                        }
                        if let Some(loaded) = self.resolve(*referenced, branch, point.timestamp)? {
                            next.push(loaded.revision.clone());
                            prefetched.push(loaded);
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        trace!("Loaded {} with {} prefetched at {}", id, prefetched.len(), point);
        Ok(Some(Loaded { target, prefetched }))
    }
}

impl StoragePort for MemoryStore {
    fn supports_deltas(&self) -> bool {
        self.supports_deltas
    }

    fn write_commit_info(&self, commit: &CommitMetadata) -> Result<()> {
        self.ensure_branch(commit.branch)?;
        let mut pending = self.pending.lock();
        if let Some(stale) = pending.take() {
            warn!(
                "Discarding unfinished commit on branch {} at {}",
                stale.record.metadata.branch, stale.record.metadata.timestamp
            );
        }
        *pending = Some(PendingCommit::new(commit.clone()));
        Ok(())
    }

    fn write_package_units(&self, _commit: &CommitMetadata, units: &[PackageUnit]) -> Result<()> {
        self.with_pending(|pending| {
            pending.record.package_units.extend(units.iter().map(|unit| unit.id.clone()));
            pending.package_units.extend_from_slice(units);
        })
    }

    fn detach_objects(&self, commit: &CommitMetadata, ids: &[ObjectId]) -> Result<()> {
        for id in ids {
            if self.resolve(*id, commit.branch, commit.timestamp)?.is_none() {
                return Err(RevStoreError::InvalidCommit(format!(
                    "{} is not visible on branch {} and cannot be detached",
                    id, commit.branch
                )));
            }
        }
        self.with_pending(|pending| {
            for id in ids {
                pending.stage(*id, commit.branch, commit.timestamp, None);
            }
            pending.record.detached_objects.extend_from_slice(ids);
        })
    }

    fn write_revisions(&self, commit: &CommitMetadata, revisions: &[Revision]) -> Result<()> {
        let mut existed = Vec::with_capacity(revisions.len());
        for revision in revisions {
            existed.push(self.resolve(revision.key.id, commit.branch, commit.timestamp)?.is_some());
        }
        self.with_pending(|pending| {
            for (revision, existed) in revisions.iter().zip(existed) {
                if existed {
                    pending.record.changed_objects.push(revision.key);
                } else {
                    pending.record.new_objects.push(revision.key);
                }
                pending.stage(
                    revision.key.id,
                    revision.branch,
                    revision.timestamp,
                    Some(Arc::new(revision.clone())),
                );
            }
        })
    }

    fn write_revision_deltas(&self, commit: &CommitMetadata, deltas: &[RevisionDelta]) -> Result<()> {
        let mut revisions = Vec::with_capacity(deltas.len());
        for delta in deltas {
            let base = self
                .resolve(delta.id, commit.branch, commit.timestamp)?
                .ok_or_else(|| RevStoreError::InvalidCommit(format!("{} has no visible base revision", delta.id)))?;
            let mut revision = delta.apply(&base.revision, commit.branch, commit.timestamp)?;
            revision.key.version = self.latest_version_of(delta.id).unwrap_or(0) + 1;
            revisions.push(revision);
        }
        self.with_pending(|pending| {
            for revision in revisions {
                pending.record.changed_objects.push(revision.key);
                pending.stage(revision.key.id, commit.branch, commit.timestamp, Some(Arc::new(revision)));
            }
        })
    }

    fn write_blob(&self, id: &LobId, size: u64, data: &mut dyn Read) -> Result<()> {
        let mut content = Vec::with_capacity(usize::try_from(size).unwrap_or(0).min(1 << 20));
        data.read_to_end(&mut content)?;
        self.with_pending(|pending| pending.stage_lob(id, LargeObject::Blob(content)))
    }

    fn write_clob(&self, id: &LobId, _chars: u64, data: &mut ClobReader<'_>) -> Result<()> {
        let text = data.read_to_string()?;
        self.with_pending(|pending| pending.stage_lob(id, LargeObject::Clob(text)))
    }

    fn commit_finished(&self, commit: &CommitMetadata) -> Result<()> {
        let mut guard = self.pending.lock();
        let pending = guard
            .take()
            .ok_or_else(|| RevStoreError::invariant("no commit in progress"))?;
        let metadata = &pending.record.metadata;
        if metadata.timestamp != commit.timestamp || metadata.branch != commit.branch {
            let err = RevStoreError::invariant(format!(
                "finishing commit {}@{} while {}@{} is in progress",
                commit.branch, commit.timestamp, metadata.branch, metadata.timestamp
            ));
            *guard = Some(pending);
            return Err(err);
        }
        drop(guard);

        for (id, version) in pending.versions {
            self.append_version(id, version.branch, version.timestamp, version.revision);
        }
        for unit in pending.package_units {
            self.package_units.insert(unit.id.clone(), unit);
        }
        for (id, lob) in pending.large_objects {
            self.large_objects.insert(id, lob);
        }

        let record = pending.record;
        debug!(
            "Commit {}@{} stored: {} new, {} changed, {} detached",
            commit.branch,
            commit.timestamp,
            record.new_objects.len(),
            record.changed_objects.len(),
            record.detached_objects.len()
        );
        self.commits.write().push(record);
        Ok(())
    }
}

impl ChangeSetSource for MemoryStore {
    fn change_set_data(&self, segment: &Segment) -> Result<ChangeSetData> {
        let mut records: Vec<CommitRecord> = self
            .commits
            .read()
            .iter()
            .filter(|record| record.metadata.branch == segment.branch_id() && segment.covers(record.metadata.timestamp))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.metadata.timestamp);

        let mut created: BTreeMap<ObjectId, RevisionKey> = BTreeMap::new();
        let mut changed: BTreeMap<ObjectId, RevisionKey> = BTreeMap::new();
        let mut detached: BTreeMap<ObjectId, ()> = BTreeMap::new();
        for record in &records {
            for key in &record.new_objects {
                created.insert(key.id, *key);
            }
            for key in &record.changed_objects {
                if created.contains_key(&key.id) {
                    created.insert(key.id, *key);
                } else {
                    changed.insert(key.id, *key);
                }
            }
            for id in &record.detached_objects {
                if created.remove(id).is_none() {
                    changed.remove(id);
                    detached.insert(*id, ());
                }
            }
        }

        let mut data = ChangeSetData::default();
        for key in created.values() {
            if let Some(revision) = self.revision_by_key(*key) {
                data.new_objects.push((*revision).clone());
            }
        }
        for key in changed.values() {
            let Some(target) = self.revision_by_key(*key) else {
                continue;
            };
            match self.resolve(key.id, segment.branch_id(), segment.start.timestamp)? {
                Some(base) => data.changed_objects.push(RevisionDelta::between(&base.revision, &target)),
                None => data.new_objects.push((*target).clone()),
            }
        }
        data.detached_objects.extend(detached.into_keys());

        trace!("Segment {} holds {} changes", segment, data.len());
        Ok(data)
    }
}

impl Backend for MemoryStore {
    fn latest_version(&self, id: ObjectId) -> Result<Option<i32>> {
        Ok(self.latest_version_of(id))
    }

    fn last_commit_time(&self, branch: BranchId) -> Result<i64> {
        Ok(self
            .commits
            .read()
            .iter()
            .filter(|record| record.metadata.branch == branch)
            .map(|record| record.metadata.timestamp)
            .max()
            .unwrap_or(0))
    }

    fn commit_history(&self) -> Result<Vec<CommitSummary>> {
        Ok(self
            .commits
            .read()
            .iter()
            .map(|record| CommitSummary {
                branch: record.metadata.branch,
                timestamp: record.metadata.timestamp,
                written: record
                    .new_objects
                    .iter()
                    .chain(&record.changed_objects)
                    .copied()
                    .collect(),
                detached: record.detached_objects.clone(),
            })
            .collect())
    }
}
