//! Core data types used throughout the revstore library
//!
//! This module contains the fundamental data structures that flow between the
//! cache, the classifier, the availability index and the commit pipeline.
//!
//! ## Overview
//!
//! - **Identity**: [`ObjectId`], [`TypeId`], [`FeatureId`], [`RevisionKey`]
//! - **Payload**: [`FeatureValue`], [`RevisionData`] - the opaque, feature-indexed
//!   state of one object. The core never interprets feature values beyond
//!   enumerating references.
//! - **Revisions**: [`Revision`], [`RevisionDelta`], [`DirtyObject`]
//! - **Change sets**: [`ChangeSetData`], [`ChangeKind`]
//! - **Commits**: [`PackageUnit`], [`CommitInfo`]
//!
//! ## Examples
//!
//! ```rust
//! use revstore::types::{FeatureId, FeatureValue, ObjectId, RevisionData};
//!
//! let mut data = RevisionData::new();
//! data.write(FeatureId(1), FeatureValue::Text("invoice".to_string()));
//! data.write(FeatureId(2), FeatureValue::Reference(ObjectId(42)));
//!
//! assert_eq!(data.references(), vec![ObjectId(42)]);
//! ```

use crate::branch::BranchId;
use crate::error::{Result, RevStoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of one object, stable across all branches and versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub i64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Opaque type identifier supplied by the model layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Opaque structural feature identifier supplied by the model layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureId(pub u32);

/// Identifies one immutable revision of one object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RevisionKey {
    /// Object the revision belongs to
    pub id: ObjectId,
    /// Version number, starting at 1
    pub version: i32,
}

impl RevisionKey {
    /// Create a key
    pub fn new(id: ObjectId, version: i32) -> Self {
        Self { id, version }
    }
}

impl fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.id, self.version)
    }
}

/// Value of one structural feature
///
/// A closed set of value kinds is enough for the core: it only needs to copy,
/// compare and serialize values, and to find references for prefetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureValue {
    /// Unset or explicitly null
    Null,
    /// Boolean attribute
    Bool(bool),
    /// Integer attribute
    Int(i64),
    /// Text attribute
    Text(String),
    /// Raw bytes attribute
    Bytes(Vec<u8>),
    /// Single-valued reference
    Reference(ObjectId),
    /// Many-valued, ordered reference list
    References(Vec<ObjectId>),
}

/// Feature-id-indexed payload of one revision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionData {
    values: BTreeMap<FeatureId, FeatureValue>,
}

impl RevisionData {
    /// Create an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one feature value
    pub fn read(&self, feature: FeatureId) -> Option<&FeatureValue> {
        self.values.get(&feature)
    }

    /// Write one feature value, returning the previous one
    pub fn write(&mut self, feature: FeatureId, value: FeatureValue) -> Option<FeatureValue> {
        self.values.insert(feature, value)
    }

    /// Remove one feature value
    pub fn remove(&mut self, feature: FeatureId) -> Option<FeatureValue> {
        self.values.remove(&feature)
    }

    /// Builder-style write
    pub fn with(mut self, feature: FeatureId, value: FeatureValue) -> Self {
        self.values.insert(feature, value);
        self
    }

    /// Number of features that carry a value
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no feature carries a value
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate features in id order
    pub fn iter(&self) -> impl Iterator<Item = (&FeatureId, &FeatureValue)> {
        self.values.iter()
    }

    /// All referenced object ids, in feature order then list order
    pub fn references(&self) -> Vec<ObjectId> {
        self.reference_lists()
            .into_iter()
            .flat_map(|list| list.iter().copied())
            .collect()
    }

    /// Referenced ids grouped per feature, in feature order
    pub fn reference_lists(&self) -> Vec<&[ObjectId]> {
        self.values
            .values()
            .filter_map(|value| match value {
                FeatureValue::Reference(id) => Some(std::slice::from_ref(id)),
                FeatureValue::References(ids) => Some(ids.as_slice()),
                _ => None,
            })
            .collect()
    }

    /// SHA-256 digest of the whole payload as hex
    ///
    /// Two payloads with equal digests compare equal; used to compare
    /// revisions without holding both in memory.
    pub fn digest(&self) -> Result<String> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// One immutable revision of one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Identity and version
    pub key: RevisionKey,
    /// Branch the revision was committed on
    pub branch: BranchId,
    /// Commit timestamp on that branch (milliseconds)
    pub timestamp: i64,
    /// Model type of the object
    pub type_id: TypeId,
    /// Containing object, if any
    pub container_id: Option<ObjectId>,
    /// Feature of the container holding this object
    pub containing_feature: Option<FeatureId>,
    /// Feature values
    pub data: RevisionData,
}

impl Revision {
    /// Object id shortcut
    pub fn id(&self) -> ObjectId {
        self.key.id
    }

    /// Version shortcut
    pub fn version(&self) -> i32 {
        self.key.version
    }
}

/// Shared handle to an immutable revision
pub type RevisionRef = Arc<Revision>;

/// One change to one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureChange {
    /// Replace the feature value
    Set(FeatureId, FeatureValue),
    /// Remove the feature value
    Unset(FeatureId),
}

/// Changes that turn one revision into the next version of the same object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionDelta {
    /// Changed object
    pub id: ObjectId,
    /// Version the changes apply to
    pub base_version: i32,
    /// Feature changes in application order
    pub changes: Vec<FeatureChange>,
}

impl RevisionDelta {
    /// Create an empty delta against `base_version`
    pub fn new(id: ObjectId, base_version: i32) -> Self {
        Self {
            id,
            base_version,
            changes: Vec::new(),
        }
    }

    /// Builder-style set
    pub fn set(mut self, feature: FeatureId, value: FeatureValue) -> Self {
        self.changes.push(FeatureChange::Set(feature, value));
        self
    }

    /// Builder-style unset
    pub fn unset(mut self, feature: FeatureId) -> Self {
        self.changes.push(FeatureChange::Unset(feature));
        self
    }

    /// Delta turning `base` into `target`, both revisions of the same object
    pub fn between(base: &Revision, target: &Revision) -> Self {
        let mut delta = Self::new(base.key.id, base.key.version);
        for (feature, value) in target.data.iter() {
            if base.data.read(*feature) != Some(value) {
                delta.changes.push(FeatureChange::Set(*feature, value.clone()));
            }
        }
        for (feature, _) in base.data.iter() {
            if target.data.read(*feature).is_none() {
                delta.changes.push(FeatureChange::Unset(*feature));
            }
        }
        delta
    }

    /// Whether the delta changes nothing
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Apply the delta, producing version `base_version + 1` at the given point
    pub fn apply(&self, base: &Revision, branch: BranchId, timestamp: i64) -> Result<Revision> {
        if base.key.id != self.id {
            return Err(RevStoreError::InvalidCommit(format!(
                "delta for {} applied to {}",
                self.id, base.key.id
            )));
        }
        if base.key.version != self.base_version {
            return Err(RevStoreError::InvalidCommit(format!(
                "delta for {} expects version {}, found {}",
                self.id, self.base_version, base.key.version
            )));
        }

        let mut data = base.data.clone();
        for change in &self.changes {
            match change {
                FeatureChange::Set(feature, value) => {
                    data.write(*feature, value.clone());
                }
                FeatureChange::Unset(feature) => {
                    data.remove(*feature);
                }
            }
        }

        Ok(Revision {
            key: RevisionKey::new(self.id, self.base_version + 1),
            branch,
            timestamp,
            type_id: base.type_id,
            container_id: base.container_id,
            containing_feature: base.containing_feature,
            data,
        })
    }
}

/// A changed object: the delta and the full revision it produces
///
/// The commit writer sends one or the other depending on whether the storage
/// port accepts deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyObject {
    /// Changes relative to the previous version
    pub delta: RevisionDelta,
    /// Resulting full revision
    pub revision: Revision,
}

impl DirtyObject {
    /// Build from the base revision and a delta
    pub fn from_base(base: &Revision, delta: RevisionDelta, branch: BranchId, timestamp: i64) -> Result<Self> {
        let revision = delta.apply(base, branch, timestamp)?;
        Ok(Self { delta, revision })
    }
}

/// How an object was affected by a commit or change set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Object was created
    New,
    /// Object was modified
    Changed,
    /// Object was removed
    Detached,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::New => write!(f, "NEW"),
            ChangeKind::Changed => write!(f, "CHANGED"),
            ChangeKind::Detached => write!(f, "DETACHED"),
        }
    }
}

/// Effect of one commit or change set, partitioned by kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetData {
    /// Newly created revisions
    pub new_objects: Vec<Revision>,
    /// Deltas of changed objects
    pub changed_objects: Vec<RevisionDelta>,
    /// Removed objects
    pub detached_objects: Vec<ObjectId>,
}

impl ChangeSetData {
    /// Whether the change set affects nothing
    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty() && self.changed_objects.is_empty() && self.detached_objects.is_empty()
    }

    /// Total number of entries across the three partitions
    pub fn len(&self) -> usize {
        self.new_objects.len() + self.changed_objects.len() + self.detached_objects.len()
    }

    /// Append another change set after this one
    pub fn merge(&mut self, other: ChangeSetData) {
        self.new_objects.extend(other.new_objects);
        self.changed_objects.extend(other.changed_objects);
        self.detached_objects.extend(other.detached_objects);
    }
}

/// Opaque structural (model package) unit introduced by a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUnit {
    /// Unit identifier, usually a namespace URI
    pub id: String,
    /// Serialized unit content
    pub data: Vec<u8>,
}

/// The unit of a single durable transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Branch the commit applies to
    pub branch: BranchId,
    /// Commit timestamp (milliseconds)
    pub timestamp: i64,
    /// Timestamp of the previous commit on the branch, 0 if none
    pub previous_timestamp: i64,
    /// Committing user
    pub user_id: String,
    /// Commit comment
    pub comment: Option<String>,
    /// Structural units introduced by the commit
    pub package_units: Vec<PackageUnit>,
    /// Brand-new objects
    pub new_objects: Vec<Revision>,
    /// Changed objects
    pub dirty_objects: Vec<DirtyObject>,
    /// Removed objects
    pub detached_objects: Vec<ObjectId>,
}

impl CommitInfo {
    /// Create an empty commit on a branch
    pub fn new(branch: BranchId, timestamp: i64, user_id: impl Into<String>) -> Self {
        Self {
            branch,
            timestamp,
            previous_timestamp: 0,
            user_id: user_id.into(),
            comment: None,
            package_units: Vec::new(),
            new_objects: Vec::new(),
            dirty_objects: Vec::new(),
            detached_objects: Vec::new(),
        }
    }

    /// Metadata-only view written in the first commit step
    pub fn metadata(&self) -> CommitMetadata {
        CommitMetadata {
            branch: self.branch,
            timestamp: self.timestamp,
            previous_timestamp: self.previous_timestamp,
            user_id: self.user_id.clone(),
            comment: self.comment.clone(),
        }
    }

    /// Total units of work for progress reporting
    ///
    /// `1 (metadata) + units + 2 (large objects, finish) + new + detached + dirty`
    pub fn total_work(&self) -> u64 {
        (1 + self.package_units.len()
            + 2
            + self.new_objects.len()
            + self.detached_objects.len()
            + self.dirty_objects.len()) as u64
    }

    /// The commit's effect as change-set data
    pub fn change_set_data(&self) -> ChangeSetData {
        ChangeSetData {
            new_objects: self.new_objects.clone(),
            changed_objects: self.dirty_objects.iter().map(|dirty| dirty.delta.clone()).collect(),
            detached_objects: self.detached_objects.clone(),
        }
    }
}

/// Availability effect of one stored commit
///
/// Enough to replay the availability history of a reopened store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    /// Branch the commit applies to
    pub branch: BranchId,
    /// Commit timestamp
    pub timestamp: i64,
    /// Keys of created objects and of new versions of changed ones
    pub written: Vec<RevisionKey>,
    /// Detached objects
    pub detached: Vec<ObjectId>,
}

impl From<&CommitInfo> for CommitSummary {
    fn from(commit: &CommitInfo) -> Self {
        Self {
            branch: commit.branch,
            timestamp: commit.timestamp,
            written: commit
                .new_objects
                .iter()
                .map(|revision| revision.key)
                .chain(commit.dirty_objects.iter().map(|dirty| dirty.revision.key))
                .collect(),
            detached: commit.detached_objects.clone(),
        }
    }
}

/// Commit metadata as persisted by the storage port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    /// Branch the commit applies to
    pub branch: BranchId,
    /// Commit timestamp (milliseconds)
    pub timestamp: i64,
    /// Timestamp of the previous commit on the branch
    pub previous_timestamp: i64,
    /// Committing user
    pub user_id: String,
    /// Commit comment
    pub comment: Option<String>,
}
