//! Repository facade
//!
//! [`Repository`] wires the branch tree, the revision cache, the change
//! classifier, the availability history and the commit writer over one
//! [`Backend`]. It is the entry point applications use: read revisions at a
//! branch point, commit changes, create branches and ask what changed
//! between two points.
//!
//! Commits are serialized per repository. Reads run concurrently with each
//! other and with a commit in progress.
//!
//! ## Examples
//!
//! ```rust
//! use revstore::{CommitRequest, FeatureId, FeatureValue, ObjectId, RepositoryBuilder, RevisionData, TypeId};
//! use revstore::progress::NullMonitor;
//! use revstore::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # fn main() -> revstore::Result<()> {
//! let repo = RepositoryBuilder::new().prefetch_depth(1).build(Arc::new(MemoryStore::new()))?;
//!
//! let request = CommitRequest::new(0, "alice")
//!     .at(1000)
//!     .create(ObjectId(100), TypeId(1), RevisionData::new().with(FeatureId(1), FeatureValue::Int(7)));
//! let outcome = repo.commit(request, None, &NullMonitor)?;
//!
//! let revision = repo.get_revision(ObjectId(100), &outcome.point)?.unwrap();
//! assert_eq!(revision.version(), 1);
//! # Ok(())
//! # }
//! ```

use crate::availability::AvailabilityHistory;
use crate::branch::{Branch, BranchId, BranchLoader, BranchPoint, BranchTree};
use crate::cache::{create_cache, CacheStats, RevisionCache, RevisionLoader};
use crate::classifier::{ChangeClassifier, ChangeSetSource};
use crate::collections::{HashMap, HashMapExt};
use crate::commit::{CommitHook, CommitWriter, StoragePort};
use crate::config::{CacheMode, RepositoryConfig};
use crate::error::{Result, RevStoreError};
use crate::progress::ProgressMonitor;
use crate::types::{
    ChangeKind, ChangeSetData, CommitInfo, CommitSummary, DirtyObject, FeatureChange, FeatureId, FeatureValue,
    ObjectId, PackageUnit, Revision, RevisionData, RevisionDelta, RevisionKey, RevisionRef, TypeId,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Everything a repository needs from its storage
///
/// A backend persists commits, serves point-in-time loads and branch
/// metadata, and reports the change-set data of branch segments.
pub trait Backend: StoragePort + RevisionLoader + BranchLoader + ChangeSetSource {
    /// Highest version of `id` stored on any branch
    fn latest_version(&self, id: ObjectId) -> Result<Option<i32>>;

    /// Timestamp of the latest commit on `branch`, 0 if none
    fn last_commit_time(&self, branch: BranchId) -> Result<i64>;

    /// Availability effect of every stored commit, in any order
    fn commit_history(&self) -> Result<Vec<CommitSummary>>;
}

/// An object created by a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObject {
    /// Id of the new object
    pub id: ObjectId,
    /// Model type
    pub type_id: TypeId,
    /// Containing object and feature, if any
    pub container: Option<(ObjectId, FeatureId)>,
    /// Initial feature values
    pub data: RevisionData,
}

/// Changes a caller wants to commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    /// Target branch
    pub branch: BranchId,
    /// Explicit timestamp, assigned by the repository when `None`
    pub timestamp: Option<i64>,
    /// Committing user
    pub user_id: String,
    /// Commit comment
    pub comment: Option<String>,
    /// Structural units introduced
    pub package_units: Vec<PackageUnit>,
    /// Objects to create
    pub new_objects: Vec<NewObject>,
    /// Feature changes per modified object, applied to its visible revision
    pub changes: Vec<(ObjectId, Vec<FeatureChange>)>,
    /// Objects to detach
    pub detached: Vec<ObjectId>,
}

impl CommitRequest {
    /// Start an empty request on `branch`
    pub fn new(branch: BranchId, user_id: impl Into<String>) -> Self {
        Self {
            branch,
            timestamp: None,
            user_id: user_id.into(),
            comment: None,
            package_units: Vec::new(),
            new_objects: Vec::new(),
            changes: Vec::new(),
            detached: Vec::new(),
        }
    }

    /// Commit at an explicit timestamp
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach a comment
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Introduce a structural unit
    pub fn unit(mut self, unit: PackageUnit) -> Self {
        self.package_units.push(unit);
        self
    }

    /// Create a top-level object
    pub fn create(mut self, id: ObjectId, type_id: TypeId, data: RevisionData) -> Self {
        self.new_objects.push(NewObject {
            id,
            type_id,
            container: None,
            data,
        });
        self
    }

    /// Create an object held by `container` through `feature`
    pub fn create_contained(
        mut self,
        id: ObjectId,
        type_id: TypeId,
        container: ObjectId,
        feature: FeatureId,
        data: RevisionData,
    ) -> Self {
        self.new_objects.push(NewObject {
            id,
            type_id,
            container: Some((container, feature)),
            data,
        });
        self
    }

    /// Set one feature of an existing object
    pub fn set(self, id: ObjectId, feature: FeatureId, value: FeatureValue) -> Self {
        self.change(id, FeatureChange::Set(feature, value))
    }

    /// Remove one feature value of an existing object
    pub fn unset(self, id: ObjectId, feature: FeatureId) -> Self {
        self.change(id, FeatureChange::Unset(feature))
    }

    fn change(mut self, id: ObjectId, change: FeatureChange) -> Self {
        match self.changes.iter_mut().find(|(changed, _)| *changed == id) {
            Some((_, changes)) => changes.push(change),
            None => self.changes.push((id, vec![change])),
        }
        self
    }

    /// Detach an existing object
    pub fn detach(mut self, id: ObjectId) -> Self {
        self.detached.push(id);
        self
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Point right after the commit
    pub point: BranchPoint,
    /// Timestamp of the previous commit on the branch
    pub previous_timestamp: i64,
    /// Keys of created objects
    pub new_objects: Vec<RevisionKey>,
    /// Keys of the new versions of changed objects
    pub changed_objects: Vec<RevisionKey>,
    /// Detached objects
    pub detached_objects: Vec<ObjectId>,
}

/// Builder for a [`Repository`]
#[derive(Clone)]
pub struct RepositoryBuilder {
    config: RepositoryConfig,
    hook: Option<Arc<dyn CommitHook>>,
    local: bool,
}

impl std::fmt::Debug for RepositoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryBuilder")
            .field("config", &self.config)
            .field("hook", &self.hook.is_some())
            .field("local", &self.local)
            .finish()
    }
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            config: RepositoryConfig::default(),
            hook: None,
            local: false,
        }
    }

    /// Start from a complete configuration
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Name used in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Cache variant
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.config.cache_mode = mode;
        self
    }

    /// Maximum number of cached ids (0 = cache nothing)
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// Entries followed per reference list when prefetching (0 = all)
    pub fn reference_chunk(mut self, chunk: usize) -> Self {
        self.config.reference_chunk = chunk;
        self
    }

    /// Reference levels loaded together with a requested revision
    pub fn prefetch_depth(mut self, depth: usize) -> Self {
        self.config.prefetch_depth = depth;
        self
    }

    /// Threads used for batch loads
    pub fn load_workers(mut self, workers: usize) -> Self {
        self.config.load_workers = workers;
        self
    }

    /// Revisions per storage call when writing commits
    pub fn commit_chunk_size(mut self, size: usize) -> Self {
        self.config.commit_chunk_size = size;
        self
    }

    /// Observe every commit
    pub fn hook(mut self, hook: Arc<dyn CommitHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Treat the main branch as local-only
    pub fn local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Build a repository over `backend`
    pub fn build<B: Backend + 'static>(self, backend: Arc<B>) -> Result<Repository> {
        self.config.validate()?;

        let tree = Arc::new(if self.local {
            BranchTree::new_local(backend.clone())
        } else {
            BranchTree::new(backend.clone())
        });
        let cache = create_cache(
            self.config.cache_mode,
            backend.clone(),
            self.config.cache_capacity,
            self.config.load_workers,
        )?;
        let mut writer = CommitWriter::new(backend.clone()).with_chunk_size(self.config.commit_chunk_size);
        if let Some(hook) = self.hook {
            writer = writer.with_hook(hook);
        }

        let history = AvailabilityHistory::new(tree.clone());
        let replayed = history.rebuild(backend.commit_history()?)?;

        info!(
            "Opened repository '{}' ({:?} cache, capacity {}, {} commits replayed)",
            self.config.name, self.config.cache_mode, self.config.cache_capacity, replayed
        );
        Ok(Repository {
            classifier: ChangeClassifier::new(tree.clone()),
            history,
            config: self.config,
            changes: backend.clone(),
            backend,
            tree,
            cache,
            writer,
            last_commits: Mutex::new(HashMap::new()),
        })
    }
}

/// Versioned object repository over one backend
pub struct Repository {
    config: RepositoryConfig,
    backend: Arc<dyn Backend>,
    changes: Arc<dyn ChangeSetSource>,
    tree: Arc<BranchTree>,
    cache: Arc<dyn RevisionCache>,
    classifier: ChangeClassifier,
    history: AvailabilityHistory,
    writer: CommitWriter,
    /// Last commit time per branch; held for the whole commit
    last_commits: Mutex<HashMap<BranchId, i64>>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.config.name)
            .field("cache_mode", &self.cache.mode())
            .field("cached", &self.cache.len())
            .field("branches", &self.tree.known_branches())
            .field("history", &self.history)
            .field("writer", &self.writer)
            .finish()
    }
}

impl Repository {
    /// Open a repository over `backend` with `config`
    pub fn open<B: Backend + 'static>(backend: Arc<B>, config: RepositoryConfig) -> Result<Self> {
        RepositoryBuilder::new().config(config).build(backend)
    }

    /// Active configuration
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Branch tree
    pub fn tree(&self) -> &Arc<BranchTree> {
        &self.tree
    }

    /// Revision cache
    pub fn cache(&self) -> &Arc<dyn RevisionCache> {
        &self.cache
    }

    /// Availability history of committed snapshots
    pub fn history(&self) -> &AvailabilityHistory {
        &self.history
    }

    /// Cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Branch handle for `id`
    pub fn branch(&self, id: BranchId) -> Arc<Branch> {
        self.tree.get_branch(id)
    }

    /// Point at the latest state of `branch`
    pub fn head(&self, branch: BranchId) -> BranchPoint {
        BranchPoint::head(self.tree.get_branch(branch))
    }

    /// Point at `timestamp` on `branch`
    pub fn point(&self, branch: BranchId, timestamp: i64) -> BranchPoint {
        BranchPoint::new(self.tree.get_branch(branch), timestamp)
    }

    /// Create a branch starting at `base`
    pub fn create_branch(&self, base: &BranchPoint, name: &str) -> Result<Arc<Branch>> {
        let branch = self.tree.create_branch(base, name)?;
        info!("Created branch {} '{}' at {}", branch.id(), name, base);
        Ok(branch)
    }

    /// Revision of `id` visible at `point`
    pub fn get_revision(&self, id: ObjectId, point: &BranchPoint) -> Result<Option<RevisionRef>> {
        self.cache.get_revision(
            id,
            point,
            self.config.reference_chunk,
            self.config.prefetch_depth,
            true,
        )
    }

    /// Revisions of `ids` visible at `point`, aligned with `ids`
    pub fn get_revisions(&self, ids: &[ObjectId], point: &BranchPoint) -> Result<Vec<Option<RevisionRef>>> {
        self.cache.get_revisions(
            ids,
            point,
            self.config.reference_chunk,
            self.config.prefetch_depth,
            true,
        )
    }

    /// Key of `id` recorded as available at `point` by commits of this repository
    pub fn available_revision(&self, id: ObjectId, point: &BranchPoint) -> Result<Option<RevisionKey>> {
        self.history.revision_at(id, point)
    }

    /// Change-set data and change kinds between two points
    pub fn change_set(
        &self,
        start: &BranchPoint,
        end: &BranchPoint,
    ) -> Result<(ChangeSetData, HashMap<ObjectId, ChangeKind>)> {
        self.classifier.change_set(&*self.changes, start, end)
    }

    /// Change kind of every object touched between two points
    pub fn change_kinds(
        &self,
        start: &BranchPoint,
        end: &BranchPoint,
    ) -> Result<HashMap<ObjectId, ChangeKind>> {
        Ok(self.change_set(start, end)?.1)
    }

    /// Commit `request`
    ///
    /// Assigns the commit timestamp, builds new and dirty revisions against
    /// the state visible on the branch, writes everything through the
    /// commit writer and then updates the cache and availability history.
    #[instrument(skip(self, request, lobs, monitor), fields(branch = request.branch))]
    pub fn commit(
        &self,
        request: CommitRequest,
        lobs: Option<&mut dyn Read>,
        monitor: &dyn ProgressMonitor,
    ) -> Result<CommitOutcome> {
        let mut last_commits = self.last_commits.lock();

        let branch = self.tree.get_branch(request.branch);
        let base_timestamp = self
            .tree
            .base_point(&branch)?
            .map(|base| base.timestamp)
            .unwrap_or(0);
        let previous = match last_commits.get(&request.branch) {
            Some(previous) => *previous,
            None => self.backend.last_commit_time(request.branch)?,
        };
        let floor = previous.max(base_timestamp);
        let timestamp = match request.timestamp {
            Some(timestamp) if timestamp <= floor => {
                return Err(RevStoreError::InvalidCommit(format!(
                    "timestamp {} on branch {} is not after {}",
                    timestamp, request.branch, floor
                )));
            }
            Some(timestamp) => timestamp,
            None => Utc::now().timestamp_millis().max(floor + 1),
        };
        let point = BranchPoint::new(branch, timestamp);

        let mut commit = CommitInfo::new(request.branch, timestamp, request.user_id);
        commit.previous_timestamp = previous;
        commit.comment = request.comment;
        commit.package_units = request.package_units;
        commit.detached_objects = request.detached;
        commit.new_objects = request
            .new_objects
            .into_iter()
            .map(|object| self.new_revision(object, request.branch, timestamp))
            .collect::<Result<_>>()?;
        commit.dirty_objects = request
            .changes
            .into_iter()
            .map(|(id, changes)| self.dirty_object(id, changes, &point))
            .collect::<Result<_>>()?;

        self.writer.write(&commit, lobs, monitor)?;
        last_commits.insert(request.branch, timestamp);

        for revision in commit
            .new_objects
            .iter()
            .chain(commit.dirty_objects.iter().map(|dirty| &dirty.revision))
        {
            self.cache.add_revision(Arc::new(revision.clone()));
        }
        for id in &commit.detached_objects {
            self.cache.revise(*id, request.branch, timestamp);
        }
        self.history.record_commit(&commit)?;

        let outcome = CommitOutcome {
            point,
            previous_timestamp: previous,
            new_objects: commit.new_objects.iter().map(|revision| revision.key).collect(),
            changed_objects: commit.dirty_objects.iter().map(|dirty| dirty.revision.key).collect(),
            detached_objects: commit.detached_objects,
        };
        info!(
            "Committed to branch {} at {}: {} new, {} changed, {} detached",
            request.branch,
            timestamp,
            outcome.new_objects.len(),
            outcome.changed_objects.len(),
            outcome.detached_objects.len()
        );
        Ok(outcome)
    }

    fn new_revision(&self, object: NewObject, branch: BranchId, timestamp: i64) -> Result<Revision> {
        if let Some(version) = self.backend.latest_version(object.id)? {
            return Err(RevStoreError::InvalidCommit(format!(
                "{} already exists (version {})",
                object.id, version
            )));
        }
        Ok(Revision {
            key: RevisionKey::new(object.id, 1),
            branch,
            timestamp,
            type_id: object.type_id,
            container_id: object.container.map(|(container, _)| container),
            containing_feature: object.container.map(|(_, feature)| feature),
            data: object.data,
        })
    }

    fn dirty_object(&self, id: ObjectId, changes: Vec<FeatureChange>, point: &BranchPoint) -> Result<DirtyObject> {
        let base = self
            .cache
            .get_revision(id, point, 0, 0, true)?
            .ok_or_else(|| RevStoreError::InvalidCommit(format!("{} is not visible at {}", id, point)))?;
        let delta = RevisionDelta {
            id,
            base_version: base.version(),
            changes,
        };
        let mut dirty = DirtyObject::from_base(&base, delta, point.branch_id(), point.timestamp)?;
        let latest = self.backend.latest_version(id)?.unwrap_or(base.version());
        dirty.revision.key.version = latest.max(base.version()) + 1;
        debug!("Changing {} from {} to {}", id, base.key, dirty.revision.key);
        Ok(dirty)
    }
}
