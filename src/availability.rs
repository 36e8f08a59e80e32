//! Point-in-time revision availability
//!
//! A [`RevisionAvailabilityInfo`] maps object ids to the revision key visible
//! in one snapshot. Snapshots are layered: a successor layer records only
//! what changed and falls through to its predecessor on a miss, so many
//! snapshots share unmodified entries instead of copying the full set.
//!
//! [`AvailabilityHistory`] keeps a chain of such snapshots per branch and
//! answers "which keys were visible at this branch point".

use crate::branch::{BranchId, BranchPoint, BranchTree};
use crate::collections::{HashMap, HashMapExt};
use crate::error::Result;
use crate::types::{CommitInfo, CommitSummary, ObjectId, RevisionKey};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};

/// Revision keys visible in one snapshot
#[derive(Debug, Clone, Default)]
pub struct RevisionAvailabilityInfo {
    branch: BranchId,
    timestamp: i64,
    /// `None` marks an id hidden in this layer
    available: HashMap<ObjectId, Option<RevisionKey>>,
    previous: Option<Arc<RevisionAvailabilityInfo>>,
}

impl RevisionAvailabilityInfo {
    /// Create a root layer
    pub fn new(branch: BranchId, timestamp: i64) -> Self {
        Self {
            branch,
            timestamp,
            available: HashMap::new(),
            previous: None,
        }
    }

    /// Create a layer that falls through to `previous` on a miss
    pub fn successor(previous: Arc<RevisionAvailabilityInfo>, branch: BranchId, timestamp: i64) -> Self {
        Self {
            previous: Some(previous),
            ..Self::new(branch, timestamp)
        }
    }

    /// Branch the snapshot belongs to
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// Time of the snapshot
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Earlier layer, if any
    pub fn previous(&self) -> Option<&Arc<RevisionAvailabilityInfo>> {
        self.previous.as_ref()
    }

    /// Record a key in this layer, returning what this layer held before
    pub fn add_revision(&mut self, key: RevisionKey) -> Option<RevisionKey> {
        self.available.insert(key.id, Some(key)).flatten()
    }

    /// Drop the entry for `id` from this layer
    ///
    /// Older layers are untouched, so a later lookup may fall through to them.
    pub fn remove_revision(&mut self, id: ObjectId) -> Option<RevisionKey> {
        self.available.remove(&id).flatten()
    }

    /// Hide `id` in this layer so lookups stop here
    pub fn hide(&mut self, id: ObjectId) {
        self.available.insert(id, None);
    }

    /// Whether this layer holds a key for `id`
    pub fn contains_revision(&self, id: ObjectId) -> bool {
        matches!(self.available.get(&id), Some(Some(_)))
    }

    /// Key visible for `id`, consulting older layers on a miss
    pub fn get_revision(&self, id: ObjectId) -> Option<RevisionKey> {
        let mut layer = self;
        loop {
            if let Some(entry) = layer.available.get(&id) {
                return *entry;
            }
            layer = layer.previous.as_deref()?;
        }
    }

    /// Entries recorded in this layer, hidden ids included
    pub fn len(&self) -> usize {
        self.available.len()
    }

    /// Whether this layer records nothing
    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    /// Number of layers in the chain
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut layer = self;
        while let Some(previous) = layer.previous.as_deref() {
            depth += 1;
            layer = previous;
        }
        depth
    }

    /// Every key visible in this snapshot
    pub fn revisions(&self) -> Vec<RevisionKey> {
        let mut keys: Vec<_> = self.flatten().available.into_values().flatten().collect();
        keys.sort();
        keys
    }

    /// Collapse the chain into a single root layer with the same visible keys
    pub fn flatten(&self) -> RevisionAvailabilityInfo {
        let mut layers = Vec::with_capacity(self.depth());
        let mut layer = self;
        loop {
            layers.push(layer);
            match layer.previous.as_deref() {
                Some(previous) => layer = previous,
                None => break,
            }
        }

        let mut flat = RevisionAvailabilityInfo::new(self.branch, self.timestamp);
        for layer in layers.into_iter().rev() {
            for (id, entry) in &layer.available {
                match entry {
                    Some(key) => {
                        flat.available.insert(*id, Some(*key));
                    }
                    None => {
                        flat.available.remove(id);
                    }
                }
            }
        }
        flat
    }
}

/// Per-branch chains of availability snapshots
pub struct AvailabilityHistory {
    tree: Arc<BranchTree>,
    /// Snapshots per branch in ascending timestamp order
    snapshots: RwLock<HashMap<BranchId, Vec<Arc<RevisionAvailabilityInfo>>>>,
    max_depth: usize,
}

impl std::fmt::Debug for AvailabilityHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityHistory")
            .field("branches", &self.snapshots.read().len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl AvailabilityHistory {
    /// Default chain depth after which a snapshot is flattened
    pub const DEFAULT_MAX_DEPTH: usize = 64;

    /// Create an empty history
    pub fn new(tree: Arc<BranchTree>) -> Self {
        Self::with_max_depth(tree, Self::DEFAULT_MAX_DEPTH)
    }

    /// Create an empty history flattening chains deeper than `max_depth`
    pub fn with_max_depth(tree: Arc<BranchTree>, max_depth: usize) -> Self {
        Self {
            tree,
            snapshots: RwLock::new(HashMap::new()),
            max_depth: max_depth.max(1),
        }
    }

    /// Append the snapshot produced by `commit`
    pub fn record_commit(&self, commit: &CommitInfo) -> Result<Arc<RevisionAvailabilityInfo>> {
        self.record(&CommitSummary::from(commit))
    }

    /// Append the snapshot of one stored commit
    ///
    /// Commits on a branch must be recorded after the parent commits its
    /// base point sees.
    pub fn record(&self, commit: &CommitSummary) -> Result<Arc<RevisionAvailabilityInfo>> {
        let branch = self.tree.get_branch(commit.branch);
        let previous = match self.latest(commit.branch) {
            Some(latest) => Some(latest),
            None => match self.tree.base_point(&branch)? {
                Some(base) => self.snapshot_at(&base)?,
                None => None,
            },
        };

        let mut info = match previous {
            Some(previous) => RevisionAvailabilityInfo::successor(previous, commit.branch, commit.timestamp),
            None => RevisionAvailabilityInfo::new(commit.branch, commit.timestamp),
        };
        for id in &commit.detached {
            info.hide(*id);
        }
        for key in &commit.written {
            info.add_revision(*key);
        }

        if info.depth() > self.max_depth {
            trace!("Flattening availability chain of branch {}", commit.branch);
            info = info.flatten();
        }

        let info = Arc::new(info);
        let mut snapshots = self.snapshots.write();
        let chain = snapshots.entry(commit.branch).or_default();
        let at = chain.partition_point(|existing| existing.timestamp <= commit.timestamp);
        chain.insert(at, info.clone());

        debug!(
            "Recorded availability snapshot {}@{} ({} layers)",
            commit.branch,
            commit.timestamp,
            info.depth()
        );
        Ok(info)
    }

    /// Replace the history with a replay of stored commits
    ///
    /// Commits are replayed in timestamp order. Returns how many were replayed.
    pub fn rebuild(&self, mut commits: Vec<CommitSummary>) -> Result<usize> {
        commits.sort_by_key(|commit| (commit.timestamp, commit.branch));
        self.snapshots.write().clear();
        for commit in &commits {
            self.record(commit)?;
        }
        Ok(commits.len())
    }

    fn latest(&self, branch: BranchId) -> Option<Arc<RevisionAvailabilityInfo>> {
        self.snapshots
            .read()
            .get(&branch)
            .and_then(|chain| chain.last().cloned())
    }

    /// Snapshot visible at `point`
    ///
    /// Uses the latest snapshot on the branch not later than the point, and
    /// otherwise the snapshot visible at the branch's base point.
    pub fn snapshot_at(&self, point: &BranchPoint) -> Result<Option<Arc<RevisionAvailabilityInfo>>> {
        let mut current = Some(point.clone());
        while let Some(point) = current {
            let found = self.snapshots.read().get(&point.branch_id()).and_then(|chain| {
                let at = chain.partition_point(|info| info.timestamp <= point.timestamp);
                at.checked_sub(1).map(|i| chain[i].clone())
            });
            if found.is_some() {
                return Ok(found);
            }
            current = self.tree.base_point(&point.branch)?;
        }
        Ok(None)
    }

    /// Key of `id` visible at `point`
    pub fn revision_at(&self, id: ObjectId, point: &BranchPoint) -> Result<Option<RevisionKey>> {
        Ok(self.snapshot_at(point)?.and_then(|info| info.get_revision(id)))
    }

    /// Drop every snapshot
    pub fn clear(&self) {
        self.snapshots.write().clear();
    }
}
