//! # revstore - Branch-aware versioned object storage core
//!
//! The versioning and persistence core of a branch-based object repository.
//! Objects are stored as immutable, numbered revisions; every revision is
//! committed on a branch at a timestamp, and any state of the repository can
//! be read back at a branch point.
//!
//! ## Overview
//!
//! revstore provides the pieces a model repository server is built from:
//! - A lazily populated tree of branches with name paths and base points
//! - A revision cache that answers "which revision of this object is visible
//!   at this branch point", loading and prefetching on a miss
//! - Classification of the objects changed between two branch points into
//!   new, changed and detached
//! - Layered, point-in-time indexes of available revision keys
//! - A step-by-step commit pipeline with progress reporting, cancellation
//!   and a streamed large-object section
//!
//! ## Architecture
//!
//! - **Branches**: [`BranchTree`] resolves branches on first use through a
//!   [`BranchLoader`]; unresolved branches are cheap proxies
//! - **Caching**: [`RevisionCache`] implementations keep validity intervals
//!   per branch so historical and current reads share one cache
//! - **Commits**: [`CommitWriter`] drives a [`StoragePort`] through a fixed
//!   sequence of steps and names the step that failed
//! - **Backends**: [`store::MemoryStore`] implements every port in memory and
//!   can save and reopen snapshots on disk
//! - **Facade**: [`Repository`] wires everything over one [`Backend`]
//!
//! ## Quick Start
//!
//! ```rust
//! use revstore::{ChangeKind, CommitRequest, FeatureId, FeatureValue, ObjectId, RepositoryBuilder, RevisionData, TypeId};
//! use revstore::progress::NullMonitor;
//! use revstore::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # fn main() -> revstore::Result<()> {
//! let repo = RepositoryBuilder::new().build(Arc::new(MemoryStore::new()))?;
//!
//! // Create an object on the main branch
//! let data = RevisionData::new().with(FeatureId(1), FeatureValue::Text("invoice".to_string()));
//! let first = repo.commit(
//!     CommitRequest::new(0, "alice").at(1000).create(ObjectId(100), TypeId(1), data),
//!     None,
//!     &NullMonitor,
//! )?;
//!
//! // Branch off and change it there
//! let dev = repo.create_branch(&first.point, "dev")?;
//! let second = repo.commit(
//!     CommitRequest::new(dev.id(), "bob").at(2000).set(ObjectId(100), FeatureId(1), FeatureValue::Int(2)),
//!     None,
//!     &NullMonitor,
//! )?;
//!
//! // Main still sees the original, dev sees the change
//! let on_main = repo.get_revision(ObjectId(100), &repo.head(0))?.unwrap();
//! let on_dev = repo.get_revision(ObjectId(100), &second.point)?.unwrap();
//! assert_eq!(on_main.version(), 1);
//! assert_eq!(on_dev.version(), 2);
//!
//! // And the change is classified
//! let kinds = repo.change_kinds(&first.point, &second.point)?;
//! assert_eq!(kinds[&ObjectId(100)], ChangeKind::Changed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Branch points
//!
//! A [`BranchPoint`] is a branch plus a timestamp. A branch sees its own
//! commits up to the timestamp, and everything its base branch saw at the
//! branch's base point. The head of a branch is the point at the maximum
//! timestamp.
//!
//! ### Versions
//!
//! Version numbers are allocated per object across all branches: a change
//! on any branch gets the highest stored version plus one.
//!
//! ### Change kinds
//!
//! When an object appears in more than one list of a change set, the later
//! list wins: detached beats changed, changed beats new.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, RevStoreError>`. Load failures, protocol
//! violations of the large-object stream, invariant violations of a commit
//! and cancellation are separate variants; commit step failures carry the
//! step that failed. Missing objects are `None`, never an error.
//!
//! ## Module Organization
//!
//! - [`branch`]: Branches, branch points and the branch tree
//! - [`cache`]: Revision loaders and caches
//! - [`classifier`]: Change sets between branch points
//! - [`availability`]: Layered availability snapshots
//! - [`commit`]: Storage port and commit pipeline
//! - [`lob`]: Large-object stream codec
//! - [`progress`]: Progress monitors and cancellation
//! - [`store`]: In-memory backend with on-disk snapshots
//! - [`repository`]: The repository facade
//! - [`config`]: Repository configuration
//! - [`logging`]: Tracing subscriber setup
//! - [`types`]: Ids, revisions, deltas and commit data
//! - [`error`]: Error types and handling

// Public API modules
pub mod availability;
pub mod branch;
pub mod cache;
pub mod classifier;
pub mod commit;
pub mod config;
pub mod error;
pub mod lob;
pub mod logging;
pub mod progress;
pub mod repository;
pub mod store;
pub mod types;

// Internal modules (not part of public API)
mod collections;

// Re-export main types for convenience
pub use availability::{AvailabilityHistory, RevisionAvailabilityInfo};
pub use branch::{
    Branch, BranchEvent, BranchId, BranchInfo, BranchListener, BranchLoader, BranchPoint, BranchTree, SubBranchInfo,
    MAIN_BRANCH_ID, MAIN_BRANCH_NAME,
};
pub use cache::{
    BranchAwareCache, CacheMode, CacheStats, CurrentRevisionCache, Loaded, LoadedRevision, NoOpCache, RevisionCache,
    RevisionLoader,
};
pub use classifier::{ChangeClassifier, ChangeSetSource, Segment};
pub use commit::{CommitHook, CommitStep, CommitWriter, NoOpHook, StoragePort};
pub use config::RepositoryConfig;
pub use error::{Result, RevStoreError};
pub use progress::{NullMonitor, ProgressInfo, ProgressMonitor};
pub use repository::{Backend, CommitOutcome, CommitRequest, NewObject, Repository, RepositoryBuilder};
pub use types::*;
