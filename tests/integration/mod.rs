//! End-to-end tests for revstore
//!
//! Drives a repository over the in-memory backend through commits, branches,
//! large-object streams, cancellation and snapshot reopening.

use ::revstore::lob::{LobId, LobStreamWriter};
use ::revstore::progress::{CallbackMonitor, ProgressInfo};
use ::revstore::store::{LargeObject, MemoryStore};
use ::revstore::*;
use std::io::Cursor;
use std::sync::Arc;
use tracing::info;

/// Repository over a fresh in-memory store
pub struct RepoHarness {
    pub store: Arc<MemoryStore>,
    pub repo: Repository,
}

impl RepoHarness {
    /// Harness with default settings
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Harness over a prepared store
    pub fn with_store(store: MemoryStore) -> Self {
        Self::with_builder(store, RepositoryBuilder::new().load_workers(2))
    }

    /// Harness built by `builder`
    pub fn with_builder(store: MemoryStore, builder: RepositoryBuilder) -> Self {
        let store = Arc::new(store);
        let repo = builder.build(store.clone()).unwrap();
        Self { store, repo }
    }

    /// Commit and panic on failure
    pub fn commit(&self, request: CommitRequest) -> CommitOutcome {
        self.repo.commit(request, None, &NullMonitor).unwrap()
    }

    /// Create `count` named objects starting at `first` on `branch`
    pub fn populate(&self, branch: BranchId, timestamp: i64, first: i64, count: i64) -> CommitOutcome {
        let request = (first..first + count).fold(CommitRequest::new(branch, "harness").at(timestamp), |req, id| {
            req.create(ObjectId(id), TypeId(1), named(&format!("object {}", id)))
        });
        self.commit(request)
    }

    /// Feature 1 of the revision of `id` visible at `point`
    pub fn name_at(&self, id: i64, point: &BranchPoint) -> Option<FeatureValue> {
        self.repo
            .get_revision(ObjectId(id), point)
            .unwrap()
            .and_then(|revision| revision.data.read(FeatureId(1)).cloned())
    }
}

impl Default for RepoHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload with a text name in feature 1
pub fn named(name: &str) -> RevisionData {
    RevisionData::new().with(FeatureId(1), text(name))
}

/// Text feature value
pub fn text(value: &str) -> FeatureValue {
    FeatureValue::Text(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_new_object_end_to_end() {
        let harness = RepoHarness::new();
        let outcome = harness.commit(
            CommitRequest::new(MAIN_BRANCH_ID, "alice")
                .at(1000)
                .create(ObjectId(100), TypeId(1), named("first")),
        );

        let point = harness.repo.point(MAIN_BRANCH_ID, 1000);
        let revision = harness.repo.get_revision(ObjectId(100), &point).unwrap().unwrap();
        assert_eq!(revision.version(), 1);
        assert_eq!(outcome.point, point);

        let kinds = harness
            .repo
            .change_kinds(&harness.repo.point(MAIN_BRANCH_ID, 0), &point)
            .unwrap();
        assert_eq!(kinds.len(), 1);
        assert_eq!(kinds[&ObjectId(100)], ChangeKind::New);
        info!("Classified {} objects", kinds.len());
    }

    #[test]
    fn test_history_is_readable_at_every_point() {
        let harness = RepoHarness::new();
        harness.populate(MAIN_BRANCH_ID, 100, 1, 3);
        harness.commit(CommitRequest::new(0, "alice").at(200).set(ObjectId(1), FeatureId(1), text("renamed")));
        harness.commit(CommitRequest::new(0, "alice").at(300).detach(ObjectId(2)));

        let repo = &harness.repo;
        assert_eq!(harness.name_at(1, &repo.point(0, 150)), Some(text("object 1")));
        assert_eq!(harness.name_at(1, &repo.point(0, 250)), Some(text("renamed")));
        assert_eq!(harness.name_at(2, &repo.point(0, 299)), Some(text("object 2")));
        assert_eq!(harness.name_at(2, &repo.head(0)), None);
        assert_eq!(harness.name_at(3, &repo.point(0, 50)), None);

        assert_eq!(
            repo.available_revision(ObjectId(1), &repo.point(0, 250)).unwrap(),
            Some(RevisionKey::new(ObjectId(1), 2))
        );
        assert_eq!(repo.available_revision(ObjectId(2), &repo.head(0)).unwrap(), None);
        assert_eq!(
            repo.available_revision(ObjectId(2), &repo.point(0, 250)).unwrap(),
            Some(RevisionKey::new(ObjectId(2), 1))
        );
    }

    #[test]
    fn test_branches_isolate_changes() {
        let harness = RepoHarness::new();
        let base = harness.populate(MAIN_BRANCH_ID, 100, 1, 2);
        let dev = harness.repo.create_branch(&base.point, "dev").unwrap();
        let feature = harness
            .repo
            .create_branch(&harness.repo.point(dev.id(), 150), "feature")
            .unwrap();

        harness.commit(CommitRequest::new(0, "alice").at(200).set(ObjectId(1), FeatureId(1), text("main")));
        harness.commit(CommitRequest::new(dev.id(), "bob").at(200).set(ObjectId(1), FeatureId(1), text("dev")));
        harness.commit(
            CommitRequest::new(feature.id(), "carol")
                .at(250)
                .detach(ObjectId(2))
                .create(ObjectId(3), TypeId(1), named("feature only")),
        );

        let repo = &harness.repo;
        assert_eq!(harness.name_at(1, &repo.head(0)), Some(text("main")));
        assert_eq!(harness.name_at(1, &repo.head(dev.id())), Some(text("dev")));
        // feature branched from dev before dev's change
        assert_eq!(harness.name_at(1, &repo.head(feature.id())), Some(text("object 1")));
        assert_eq!(harness.name_at(2, &repo.head(feature.id())), None);
        assert_eq!(harness.name_at(2, &repo.head(dev.id())), Some(text("object 2")));
        assert_eq!(harness.name_at(3, &repo.head(0)), None);

        // Versions are numbered across branches
        let versions: Vec<i32> = [repo.head(0), repo.head(dev.id())]
            .iter()
            .map(|point| repo.get_revision(ObjectId(1), point).unwrap().unwrap().version())
            .collect();
        assert_eq!(versions, vec![2, 3]);

        let tree = repo.tree();
        assert_eq!(tree.path_name(&feature).unwrap(), "MAIN/dev/feature");
        assert_eq!(tree.branch_by_path("MAIN/dev/feature").unwrap().map(|b| b.id()), Some(feature.id()));
        assert!(tree.is_ancestor(&tree.main(), &feature).unwrap());
        assert!(!tree.is_ancestor(&feature, &dev).unwrap());
    }

    #[test]
    fn test_change_kinds_across_branches() {
        let harness = RepoHarness::new();
        let base = harness.populate(MAIN_BRANCH_ID, 100, 1, 2);
        let dev = harness.repo.create_branch(&base.point, "dev").unwrap();

        let main_change =
            harness.commit(CommitRequest::new(0, "alice").at(200).set(ObjectId(1), FeatureId(1), text("main")));
        let dev_change = harness.commit(
            CommitRequest::new(dev.id(), "bob")
                .at(300)
                .detach(ObjectId(2))
                .create(ObjectId(3), TypeId(1), named("three")),
        );

        let (data, kinds) = harness.repo.change_set(&main_change.point, &dev_change.point).unwrap();
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[&ObjectId(1)], ChangeKind::Changed);
        assert_eq!(kinds[&ObjectId(2)], ChangeKind::Detached);
        assert_eq!(kinds[&ObjectId(3)], ChangeKind::New);
        assert_eq!(data.new_objects[0].data, named("three"));

        // Nothing changes between a point and itself
        assert!(harness
            .repo
            .change_kinds(&dev_change.point, &dev_change.point)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_large_objects_are_stored() {
        let harness = RepoHarness::new();
        let mut writer = LobStreamWriter::new(Vec::new(), 2).unwrap();
        writer.write_blob(&LobId(vec![1, 2]), b"binary payload").unwrap();
        writer.write_clob(&LobId(vec![3]), "h\u{e9}llo \u{1F600}").unwrap();
        let mut stream = Cursor::new(writer.finish().unwrap());

        harness
            .repo
            .commit(
                CommitRequest::new(0, "alice").at(100).create(ObjectId(1), TypeId(1), named("doc")),
                Some(&mut stream),
                &NullMonitor,
            )
            .unwrap();

        assert_eq!(
            harness.store.large_object(&LobId(vec![1, 2])),
            Some(LargeObject::Blob(b"binary payload".to_vec()))
        );
        assert_eq!(
            harness.store.large_object(&LobId(vec![3])),
            Some(LargeObject::Clob("h\u{e9}llo \u{1F600}".to_string()))
        );
        assert_eq!(harness.store.commits()[0].large_objects.len(), 2);
    }

    #[test]
    fn test_truncated_stream_fails_without_trace() {
        let harness = RepoHarness::new();
        let mut writer = LobStreamWriter::new(Vec::new(), 1).unwrap();
        writer.write_blob(&LobId(vec![9]), &[7u8; 10]).unwrap();
        let mut bytes = writer.finish().unwrap();
        bytes.truncate(bytes.len() - 7);

        let request = CommitRequest::new(0, "alice").at(100).create(ObjectId(1), TypeId(1), named("a"));
        let err = harness
            .repo
            .commit(request.clone(), Some(&mut Cursor::new(bytes)), &NullMonitor)
            .unwrap_err();
        assert_eq!(err.failed_step(), Some(CommitStep::LargeObjects));
        assert!(err.is_protocol_violation());

        assert!(harness.store.commits().is_empty());
        assert!(harness.store.large_object(&LobId(vec![9])).is_none());
        assert_eq!(harness.name_at(1, &harness.repo.head(0)), None);

        // The same commit goes through once the stream is complete
        harness.repo.commit(request, None, &NullMonitor).unwrap();
        assert_eq!(harness.name_at(1, &harness.repo.head(0)), Some(text("a")));
    }

    #[test]
    fn test_canceled_commit() {
        let harness = RepoHarness::new();
        let monitor = CallbackMonitor::new(|_: ProgressInfo| {});
        monitor.cancel_handle().cancel();

        let err = harness
            .repo
            .commit(
                CommitRequest::new(0, "alice").at(100).create(ObjectId(1), TypeId(1), named("a")),
                None,
                &monitor,
            )
            .unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(err.failed_step(), Some(CommitStep::Metadata));
        assert!(harness.store.commits().is_empty());
    }

    #[test]
    fn test_progress_reaches_total() {
        let harness = RepoHarness::new();
        let monitor = CallbackMonitor::new(|_: ProgressInfo| {});
        harness
            .repo
            .commit(
                CommitRequest::new(0, "alice")
                    .at(100)
                    .unit(PackageUnit {
                        id: "urn:orders".to_string(),
                        data: vec![1],
                    })
                    .unit(PackageUnit {
                        id: "urn:billing".to_string(),
                        data: vec![2],
                    })
                    .create(ObjectId(1), TypeId(1), named("a"))
                    .create(ObjectId(2), TypeId(1), named("b"))
                    .create(ObjectId(3), TypeId(1), named("c")),
                None,
                &monitor,
            )
            .unwrap();
        assert_eq!(monitor.total(), 8);
        assert_eq!(monitor.processed(), 8);
        assert!(harness.store.package_unit("urn:billing").is_some());

        harness
            .repo
            .commit(
                CommitRequest::new(0, "alice")
                    .at(200)
                    .detach(ObjectId(3))
                    .set(ObjectId(1), FeatureId(2), FeatureValue::Int(1))
                    .set(ObjectId(2), FeatureId(2), FeatureValue::Int(2)),
                None,
                &monitor,
            )
            .unwrap();
        assert_eq!(monitor.total(), 6);
        assert_eq!(monitor.processed(), 6);
    }

    #[test]
    fn test_delta_backend() {
        let harness = RepoHarness::with_store(MemoryStore::new().with_delta_support(true));
        harness.populate(MAIN_BRANCH_ID, 100, 1, 1);
        let outcome = harness.commit(
            CommitRequest::new(0, "alice")
                .at(200)
                .set(ObjectId(1), FeatureId(2), FeatureValue::Bool(true))
                .unset(ObjectId(1), FeatureId(1)),
        );
        assert_eq!(outcome.changed_objects, vec![RevisionKey::new(ObjectId(1), 2)]);

        // Read back through a cold repository so the backend answers
        let cold = RepositoryBuilder::new().build(harness.store.clone()).unwrap();
        let revision = cold.get_revision(ObjectId(1), &cold.head(0)).unwrap().unwrap();
        assert_eq!(revision.version(), 2);
        assert_eq!(
            revision.data,
            RevisionData::new().with(FeatureId(2), FeatureValue::Bool(true))
        );
    }

    #[test]
    fn test_snapshot_reopen_continues_history() {
        let dir = TempDir::new().unwrap();
        let harness = RepoHarness::new();
        harness.populate(MAIN_BRANCH_ID, 100, 1, 2);
        harness.commit(CommitRequest::new(0, "alice").at(200).set(ObjectId(1), FeatureId(1), text("v2")));
        harness.store.save(dir.path()).unwrap();

        let reopened = RepoHarness::with_store(MemoryStore::open(dir.path()).unwrap());
        let repo = &reopened.repo;
        assert_eq!(reopened.name_at(1, &repo.point(0, 150)), Some(text("object 1")));
        assert_eq!(reopened.name_at(1, &repo.head(0)), Some(text("v2")));

        let stale = repo.commit(CommitRequest::new(0, "alice").at(150), None, &NullMonitor);
        assert!(matches!(stale, Err(RevStoreError::InvalidCommit(_))));

        let next = reopened.commit(CommitRequest::new(0, "alice").at(300).set(ObjectId(2), FeatureId(1), text("x")));
        assert_eq!(next.previous_timestamp, 200);
        assert_eq!(next.changed_objects, vec![RevisionKey::new(ObjectId(2), 2)]);
    }

    #[test]
    fn test_prefetch_fills_cache() {
        let harness = RepoHarness::with_builder(
            MemoryStore::new(),
            RepositoryBuilder::new().prefetch_depth(1).load_workers(1),
        );
        let children: Vec<ObjectId> = (2..6).map(ObjectId).collect();
        harness.populate(MAIN_BRANCH_ID, 100, 2, 4);
        harness.commit(CommitRequest::new(0, "alice").at(200).create(
            ObjectId(1),
            TypeId(2),
            RevisionData::new().with(FeatureId(5), FeatureValue::References(children.clone())),
        ));

        // A cold repository sees the store, not the committing cache
        let cold = RepositoryBuilder::new()
            .prefetch_depth(1)
            .load_workers(1)
            .build(harness.store.clone())
            .unwrap();
        let loads = harness.store.revision_loads();
        cold.get_revision(ObjectId(1), &cold.head(0)).unwrap().unwrap();
        for child in &children {
            assert!(cold.cache().contains_revision(*child));
        }
        let resolved = cold.get_revisions(&children, &cold.head(0)).unwrap();
        assert!(resolved.iter().all(Option::is_some));
        assert_eq!(harness.store.revision_loads(), loads + 1);
        assert_eq!(cold.cache_stats().hits, children.len() as u64);
    }

    #[test]
    fn test_reopen_restores_availability() {
        let dir = TempDir::new().unwrap();
        let harness = RepoHarness::new();
        harness.populate(MAIN_BRANCH_ID, 100, 1, 2);
        let dev = harness.repo.create_branch(&harness.repo.point(0, 150), "dev").unwrap();
        harness.commit(CommitRequest::new(0, "alice").at(200).set(ObjectId(1), FeatureId(1), text("v2")));
        harness.commit(CommitRequest::new(0, "alice").at(250).detach(ObjectId(2)));
        harness.commit(CommitRequest::new(dev.id(), "bob").at(300).create(ObjectId(5), TypeId(1), named("dev")));
        harness.store.save(dir.path()).unwrap();

        let reopened = RepoHarness::with_store(MemoryStore::open(dir.path()).unwrap());
        let repo = &reopened.repo;
        let available = |id: i64, point: &BranchPoint| repo.available_revision(ObjectId(id), point).unwrap();

        assert_eq!(available(1, &repo.head(0)), Some(RevisionKey::new(ObjectId(1), 2)));
        assert_eq!(available(1, &repo.point(0, 150)), Some(RevisionKey::new(ObjectId(1), 1)));
        assert_eq!(available(2, &repo.point(0, 220)), Some(RevisionKey::new(ObjectId(2), 1)));
        assert_eq!(available(2, &repo.head(0)), None);
        assert_eq!(available(1, &repo.head(dev.id())), Some(RevisionKey::new(ObjectId(1), 1)));
        assert_eq!(available(2, &repo.head(dev.id())), Some(RevisionKey::new(ObjectId(2), 1)));
        assert_eq!(available(5, &repo.head(dev.id())), Some(RevisionKey::new(ObjectId(5), 1)));
        assert_eq!(available(5, &repo.head(0)), None);

        // New commits layer on top of the replayed history
        reopened.commit(CommitRequest::new(0, "alice").at(400).create(ObjectId(6), TypeId(1), named("late")));
        assert_eq!(available(6, &repo.head(0)), Some(RevisionKey::new(ObjectId(6), 1)));
        assert_eq!(available(1, &repo.head(0)), Some(RevisionKey::new(ObjectId(1), 2)));
    }

    /// Main holds objects 1 and 2 from 100, dev forks at 150 and renames 1 at 300
    fn current_mode_fixture() -> (RepoHarness, Arc<Branch>) {
        let harness = RepoHarness::with_builder(
            MemoryStore::new(),
            RepositoryBuilder::new().cache_mode(CacheMode::Current).load_workers(1),
        );
        assert!(!harness.repo.cache().is_branch_aware());
        harness.populate(MAIN_BRANCH_ID, 100, 1, 2);
        let dev = harness.repo.create_branch(&harness.repo.point(0, 150), "dev").unwrap();
        harness.commit(CommitRequest::new(dev.id(), "bob").at(300).set(ObjectId(1), FeatureId(1), text("dev")));
        (harness, dev)
    }

    #[test]
    fn test_current_cache_reads_respect_point_and_branch() {
        let (harness, dev) = current_mode_fixture();
        let repo = &harness.repo;

        assert_eq!(harness.name_at(1, &repo.point(0, 50)), None);
        assert_eq!(harness.name_at(1, &repo.head(0)), Some(text("object 1")));
        assert_eq!(harness.name_at(1, &repo.head(dev.id())), Some(text("dev")));
        assert_eq!(harness.name_at(1, &repo.point(dev.id(), 200)), Some(text("object 1")));
        assert_eq!(harness.name_at(2, &repo.head(dev.id())), Some(text("object 2")));

        // Repeated reads keep answering per branch
        assert_eq!(harness.name_at(1, &repo.head(0)), Some(text("object 1")));
        assert_eq!(harness.name_at(1, &repo.head(dev.id())), Some(text("dev")));

        // A branch-aware repository over the same store agrees everywhere
        let reference = RepositoryBuilder::new().build(harness.store.clone()).unwrap();
        let points = [
            (0, 50),
            (0, 150),
            (0, i64::MAX),
            (dev.id(), 160),
            (dev.id(), 300),
            (dev.id(), i64::MAX),
        ];
        for (branch, timestamp) in points {
            for id in 1..=2 {
                let expected = reference
                    .get_revision(ObjectId(id), &reference.point(branch, timestamp))
                    .unwrap()
                    .map(|revision| revision.key);
                let actual = repo
                    .get_revision(ObjectId(id), &repo.point(branch, timestamp))
                    .unwrap()
                    .map(|revision| revision.key);
                assert_eq!(actual, expected, "{} at {}@{}", id, branch, timestamp);
            }
        }
    }

    #[test]
    fn test_current_cache_commit_builds_on_own_branch() {
        let (harness, dev) = current_mode_fixture();
        let repo = &harness.repo;

        let outcome =
            harness.commit(CommitRequest::new(0, "alice").at(400).set(ObjectId(1), FeatureId(2), text("extra")));
        assert_eq!(outcome.changed_objects, vec![RevisionKey::new(ObjectId(1), 3)]);

        let head = repo.get_revision(ObjectId(1), &repo.head(0)).unwrap().unwrap();
        assert_eq!(head.version(), 3);
        assert_eq!(head.branch, MAIN_BRANCH_ID);
        assert_eq!(head.data.read(FeatureId(1)), Some(&text("object 1")));
        assert_eq!(head.data.read(FeatureId(2)), Some(&text("extra")));

        assert_eq!(harness.name_at(1, &repo.head(dev.id())), Some(text("dev")));
        assert_eq!(harness.name_at(1, &repo.point(0, 350)), Some(text("object 1")));
        let dev_head = repo.get_revision(ObjectId(1), &repo.head(dev.id())).unwrap().unwrap();
        assert_eq!(dev_head.version(), 2);
        assert!(dev_head.data.read(FeatureId(2)).is_none());

        // Detaching on dev leaves main's current revision in place
        harness.commit(CommitRequest::new(dev.id(), "bob").at(500).detach(ObjectId(1)));
        assert_eq!(harness.name_at(1, &repo.head(dev.id())), None);
        assert_eq!(
            repo.get_revision(ObjectId(1), &repo.head(0)).unwrap().map(|revision| revision.version()),
            Some(3)
        );
    }
}
