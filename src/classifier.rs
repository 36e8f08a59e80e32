//! Change-set classification and branch segment decomposition
//!
//! A change set between two branch points may cross from a child branch up
//! to an ancestor and down into another branch. [`ChangeClassifier`] splits
//! such an interval into one [`Segment`] per branch traversed, asks a
//! [`ChangeSetSource`] for the data of each segment and classifies the
//! merged result.
//!
//! Classification applies the new, changed and detached lists in that order,
//! so an id listed more than once ends up with the kind of the last list it
//! appears in (DETACHED over CHANGED over NEW).

use crate::branch::{BranchPoint, BranchTree};
use crate::collections::{HashMap, HashMapExt};
use crate::error::{Result, RevStoreError};
use crate::types::{ChangeKind, ChangeSetData, ObjectId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Portion of history on a single branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Earlier point
    pub start: BranchPoint,
    /// Later point, on the same branch
    pub end: BranchPoint,
}

impl Segment {
    /// Create a segment; the points are ordered by timestamp
    pub fn new(a: BranchPoint, b: BranchPoint) -> Self {
        if a.timestamp <= b.timestamp {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    /// Id of the branch the segment lies on
    pub fn branch_id(&self) -> i32 {
        self.start.branch_id()
    }

    /// Whether `timestamp` falls into `(start, end]`
    pub fn covers(&self, timestamp: i64) -> bool {
        self.start.timestamp < timestamp && timestamp <= self.end.timestamp
    }

    /// Whether the segment spans no time
    pub fn is_empty(&self) -> bool {
        self.start.timestamp == self.end.timestamp
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end.timestamp)
    }
}

/// Backend able to report the changes inside one segment
pub trait ChangeSetSource: Send + Sync {
    /// Changes committed on `segment`'s branch within the segment
    fn change_set_data(&self, segment: &Segment) -> Result<ChangeSetData>;
}

/// Computes change kinds and branch segments
#[derive(Debug, Clone)]
pub struct ChangeClassifier {
    tree: Arc<BranchTree>,
}

impl ChangeClassifier {
    /// Create a classifier over a branch tree
    pub fn new(tree: Arc<BranchTree>) -> Self {
        Self { tree }
    }

    /// Map every id in `data` to its change kind
    pub fn classify(data: &ChangeSetData) -> HashMap<ObjectId, ChangeKind> {
        let mut kinds = HashMap::with_capacity(data.len());
        for revision in &data.new_objects {
            kinds.insert(revision.key.id, ChangeKind::New);
        }
        for delta in &data.changed_objects {
            kinds.insert(delta.id, ChangeKind::Changed);
        }
        for id in &data.detached_objects {
            kinds.insert(*id, ChangeKind::Detached);
        }
        kinds
    }

    /// Split `[start, end]` into one segment per branch traversed
    ///
    /// Segments on the start side come first (from `start` up towards the
    /// common ancestor), then the segment on the common branch, then the
    /// segments on the end side from the ancestor down to `end`.
    pub fn compute_segments(&self, start: &BranchPoint, end: &BranchPoint) -> Result<Vec<Segment>> {
        let start_path = self.tree.base_path(start)?;
        let end_path = self.tree.base_path(end)?;

        let (si, ei) = start_path
            .iter()
            .enumerate()
            .find_map(|(i, point)| {
                end_path
                    .iter()
                    .position(|other| other.branch_id() == point.branch_id())
                    .map(|j| (i, j))
            })
            .ok_or_else(|| RevStoreError::internal(format!("{} and {} share no ancestor", start, end)))?;

        let mut segments = Vec::with_capacity(si + ei + 1);
        for point in &start_path[..si] {
            segments.push(self.branch_segment(point)?);
        }
        segments.push(Segment::new(start_path[si].clone(), end_path[ei].clone()));
        for point in end_path[..ei].iter().rev() {
            segments.push(self.branch_segment(point)?);
        }

        trace!("Segments {} -> {}: {:?}", start, end, segments);
        Ok(segments)
    }

    /// Segment from the branch base up to `point`
    fn branch_segment(&self, point: &BranchPoint) -> Result<Segment> {
        let base = self
            .tree
            .base_point(&point.branch)?
            .map(|base| base.timestamp)
            .unwrap_or(0);
        Ok(Segment::new(BranchPoint::new(point.branch.clone(), base), point.clone()))
    }

    /// Collect and classify the changes between two points
    pub fn change_set(
        &self,
        source: &dyn ChangeSetSource,
        start: &BranchPoint,
        end: &BranchPoint,
    ) -> Result<(ChangeSetData, HashMap<ObjectId, ChangeKind>)> {
        let mut data = ChangeSetData::default();
        for segment in self.compute_segments(start, end)? {
            if segment.is_empty() {
                continue;
            }
            data.merge(source.change_set_data(&segment)?);
        }
        let kinds = Self::classify(&data);
        debug!("Change set {} -> {}: {} objects", start, end, kinds.len());
        Ok((data, kinds))
    }
}
