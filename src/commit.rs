//! Ordered commit write path
//!
//! [`CommitWriter`] turns one [`CommitInfo`] into storage operations on a
//! [`StoragePort`]. Steps run strictly in order, each completing before the
//! next starts, since later steps may reference ids or structural units
//! introduced by earlier ones:
//!
//! 1. [`CommitStep::Metadata`] - user, comment, timestamp
//! 2. [`CommitStep::PackageUnits`] - new structural units
//! 3. [`CommitStep::Detach`] - removed objects
//! 4. [`CommitStep::NewObjects`] - brand-new revisions
//! 5. [`CommitStep::DirtyObjects`] - deltas or full revisions, depending on
//!    the port's delta capability
//! 6. [`CommitStep::LargeObjects`] - the large-object stream
//! 7. [`CommitStep::Finish`] - the port is told the commit is complete
//!
//! Progress totals `1 + units + 2 + new + detached + dirty` units. A failing
//! step surfaces as [`RevStoreError::StepFailed`]; completed steps are not
//! rolled back here, that is the port's responsibility.

use crate::collections::{HashSet, HashSetExt};
use crate::error::{Result, RevStoreError};
use crate::lob::{ClobReader, LobId, LobPayload, LobStreamReader};
use crate::progress::{ProgressMonitor, SubMonitor};
use crate::types::{CommitInfo, CommitMetadata, ObjectId, PackageUnit, Revision, RevisionDelta};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// One step of the commit state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommitStep {
    /// Commit metadata
    Metadata,
    /// Structural units
    PackageUnits,
    /// Detachments
    Detach,
    /// New revisions
    NewObjects,
    /// Changed objects
    DirtyObjects,
    /// Large-object stream
    LargeObjects,
    /// Completion notice
    Finish,
}

impl CommitStep {
    /// Every step in execution order
    pub const ALL: [CommitStep; 7] = [
        CommitStep::Metadata,
        CommitStep::PackageUnits,
        CommitStep::Detach,
        CommitStep::NewObjects,
        CommitStep::DirtyObjects,
        CommitStep::LargeObjects,
        CommitStep::Finish,
    ];

    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            CommitStep::Metadata => "metadata",
            CommitStep::PackageUnits => "package units",
            CommitStep::Detach => "detach",
            CommitStep::NewObjects => "new objects",
            CommitStep::DirtyObjects => "dirty objects",
            CommitStep::LargeObjects => "large objects",
            CommitStep::Finish => "finish",
        }
    }
}

impl fmt::Display for CommitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Durable storage receiving commits
///
/// Calls arrive in step order and may block.
pub trait StoragePort: Send + Sync {
    /// Whether changed objects may be written as deltas
    fn supports_deltas(&self) -> bool;

    /// Step 1
    fn write_commit_info(&self, commit: &CommitMetadata) -> Result<()>;

    /// Step 2
    fn write_package_units(&self, commit: &CommitMetadata, units: &[PackageUnit]) -> Result<()>;

    /// Step 3: mark ids as removed effective at this commit
    fn detach_objects(&self, commit: &CommitMetadata, ids: &[ObjectId]) -> Result<()>;

    /// Steps 4 and 5 (full revisions)
    fn write_revisions(&self, commit: &CommitMetadata, revisions: &[Revision]) -> Result<()>;

    /// Step 5 when deltas are supported
    fn write_revision_deltas(&self, commit: &CommitMetadata, deltas: &[RevisionDelta]) -> Result<()>;

    /// Step 6: binary entry of `size` bytes
    fn write_blob(&self, id: &LobId, size: u64, data: &mut dyn Read) -> Result<()>;

    /// Step 6: character entry of `chars` characters
    fn write_clob(&self, id: &LobId, chars: u64, data: &mut ClobReader<'_>) -> Result<()>;

    /// Step 7
    fn commit_finished(&self, commit: &CommitMetadata) -> Result<()>;
}

/// Hook into the commit lifecycle
///
/// `pre_commit` may veto a commit by returning an error; `post_commit` runs
/// after the port acknowledged the last step.
pub trait CommitHook: Send + Sync {
    /// Called after validation, before the first step
    fn pre_commit(&self, commit: &CommitInfo) -> Result<()>;

    /// Called after the finishing step succeeded
    fn post_commit(&self, commit: &CommitMetadata) -> Result<()>;
}

/// Hook that does nothing
#[derive(Debug, Default)]
pub struct NoOpHook;

impl CommitHook for NoOpHook {
    fn pre_commit(&self, _commit: &CommitInfo) -> Result<()> {
        Ok(())
    }

    fn post_commit(&self, _commit: &CommitMetadata) -> Result<()> {
        Ok(())
    }
}

/// Writes commits to a storage port
pub struct CommitWriter {
    port: Arc<dyn StoragePort>,
    supports_deltas: bool,
    chunk_size: usize,
    hook: Arc<dyn CommitHook>,
}

impl fmt::Debug for CommitWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitWriter")
            .field("supports_deltas", &self.supports_deltas)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl CommitWriter {
    /// Default number of revisions handed to the port per call
    pub const DEFAULT_CHUNK_SIZE: usize = 256;

    /// Create a writer; the port's delta capability is queried once here
    pub fn new(port: Arc<dyn StoragePort>) -> Self {
        let supports_deltas = port.supports_deltas();
        debug!("Storage port supports deltas: {}", supports_deltas);
        Self {
            port,
            supports_deltas,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            hook: Arc::new(NoOpHook),
        }
    }

    /// Hand revisions to the port in chunks of `chunk_size`
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Install a lifecycle hook
    pub fn with_hook(mut self, hook: Arc<dyn CommitHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Delta capability negotiated at construction
    pub fn supports_deltas(&self) -> bool {
        self.supports_deltas
    }

    /// Check a commit for conflicts the storage port cannot see
    ///
    /// New and dirty ids must be unique, must not overlap and must not be
    /// detached by the same commit. No new or dirty revision may reference
    /// an id the commit detaches.
    pub fn validate(&self, commit: &CommitInfo) -> Result<()> {
        let detached: HashSet<ObjectId> = commit.detached_objects.iter().copied().collect();

        let mut seen = HashSet::with_capacity(commit.new_objects.len() + commit.dirty_objects.len());
        let written = commit
            .new_objects
            .iter()
            .chain(commit.dirty_objects.iter().map(|dirty| &dirty.revision));
        for revision in written {
            if !seen.insert(revision.key.id) {
                return Err(RevStoreError::invariant(format!(
                    "{} is written more than once in one commit",
                    revision.key.id
                )));
            }
        }

        if let Some(id) = seen.iter().find(|id| detached.contains(*id)) {
            return Err(RevStoreError::invariant(format!("{} is written and detached in one commit", id)));
        }

        if let Some(dirty) = commit.dirty_objects.iter().find(|dirty| dirty.delta.id != dirty.revision.key.id) {
            return Err(RevStoreError::invariant(format!(
                "delta for {} paired with revision of {}",
                dirty.delta.id, dirty.revision.key.id
            )));
        }

        if detached.is_empty() {
            return Ok(());
        }
        let dangling = commit
            .new_objects
            .par_iter()
            .chain(commit.dirty_objects.par_iter().map(|dirty| &dirty.revision))
            .find_map_any(|revision| {
                revision
                    .data
                    .references()
                    .into_iter()
                    .find(|target| detached.contains(target))
                    .map(|target| (revision.key.id, target))
            });
        match dangling {
            Some((source, target)) => Err(RevStoreError::invariant(format!(
                "{} references {} which is detached in the same commit",
                source, target
            ))),
            None => Ok(()),
        }
    }

    /// Write one commit
    ///
    /// `lobs` is the large-object stream, if the commit carries one.
    #[instrument(skip_all, fields(branch = commit.branch, timestamp = commit.timestamp))]
    pub fn write(&self, commit: &CommitInfo, lobs: Option<&mut dyn Read>, monitor: &dyn ProgressMonitor) -> Result<()> {
        self.validate(commit)?;
        self.hook.pre_commit(commit)?;

        let metadata = commit.metadata();
        monitor.begin(&format!("Committing to branch {}", commit.branch), commit.total_work());

        self.step(CommitStep::Metadata, monitor, || {
            self.port.write_commit_info(&metadata)?;
            monitor.worked(1);
            Ok(())
        })?;

        self.step(CommitStep::PackageUnits, monitor, || {
            if !commit.package_units.is_empty() {
                self.port.write_package_units(&metadata, &commit.package_units)?;
                monitor.worked(commit.package_units.len() as u64);
            }
            Ok(())
        })?;

        self.step(CommitStep::Detach, monitor, || {
            if !commit.detached_objects.is_empty() {
                self.port.detach_objects(&metadata, &commit.detached_objects)?;
                monitor.worked(commit.detached_objects.len() as u64);
            }
            Ok(())
        })?;

        self.step(CommitStep::NewObjects, monitor, || {
            for chunk in commit.new_objects.chunks(self.chunk_size) {
                self.port.write_revisions(&metadata, chunk)?;
                monitor.worked(chunk.len() as u64);
            }
            Ok(())
        })?;

        self.step(CommitStep::DirtyObjects, monitor, || self.write_dirty(commit, &metadata, monitor))?;

        self.step(CommitStep::LargeObjects, monitor, || match lobs {
            Some(lobs) => self.write_large_objects(lobs, monitor),
            None => {
                monitor.worked(1);
                Ok(())
            }
        })?;

        self.step(CommitStep::Finish, monitor, || {
            self.port.commit_finished(&metadata)?;
            monitor.worked(1);
            Ok(())
        })?;

        monitor.done();
        info!(
            "Committed {} new, {} dirty, {} detached objects to branch {} at {}",
            commit.new_objects.len(),
            commit.dirty_objects.len(),
            commit.detached_objects.len(),
            commit.branch,
            commit.timestamp
        );
        self.hook.post_commit(&metadata)
    }

    fn step<F>(&self, step: CommitStep, monitor: &dyn ProgressMonitor, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if monitor.is_canceled() {
            warn!("Commit canceled before step '{}'", step);
            return Err(RevStoreError::Canceled(step));
        }
        trace!("Commit step '{}'", step);
        body().map_err(|err| err.in_step(step))
    }

    fn write_dirty(&self, commit: &CommitInfo, metadata: &CommitMetadata, monitor: &dyn ProgressMonitor) -> Result<()> {
        for chunk in commit.dirty_objects.chunks(self.chunk_size) {
            if self.supports_deltas {
                let deltas: Vec<RevisionDelta> = chunk.iter().map(|dirty| dirty.delta.clone()).collect();
                self.port.write_revision_deltas(metadata, &deltas)?;
            } else {
                let revisions: Vec<Revision> = chunk.iter().map(|dirty| dirty.revision.clone()).collect();
                self.port.write_revisions(metadata, &revisions)?;
            }
            monitor.worked(chunk.len() as u64);
        }
        Ok(())
    }

    fn write_large_objects(&self, lobs: &mut dyn Read, monitor: &dyn ProgressMonitor) -> Result<()> {
        let mut reader = LobStreamReader::new(lobs)?;
        let sub = SubMonitor::new(monitor, 1);
        sub.begin("large objects", u64::from(reader.count()));
        debug!("Streaming {} large objects", reader.count());

        loop {
            if sub.is_canceled() {
                warn!("Commit canceled with {} large objects pending", reader.remaining());
                return Err(RevStoreError::Canceled(CommitStep::LargeObjects));
            }
            let Some(mut entry) = reader.next_entry()? else {
                break;
            };

            let length = entry.length();
            let result = match &mut entry.payload {
                LobPayload::Blob(blob) => self.port.write_blob(&entry.id, length, blob),
                LobPayload::Clob(clob) => self.port.write_clob(&entry.id, length, clob),
            };
            if entry.is_truncated() {
                return Err(RevStoreError::protocol(format!("large object {} truncated", entry.id)));
            }
            result?;
            entry.finish()?;
            sub.worked(1);
        }

        sub.done();
        Ok(())
    }
}
