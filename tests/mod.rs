//! Main test module for revstore
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end repository scenarios
//! - Concurrency tests for shared caches and serialized commits
//! - Property-based tests for invariants

pub mod concurrency;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::revstore::store::MemoryStore;
    use ::revstore::*;
    use std::sync::Arc;

    fn repository() -> (Arc<MemoryStore>, Repository) {
        let store = Arc::new(MemoryStore::new());
        let repo = RepositoryBuilder::new().load_workers(1).build(store.clone()).unwrap();
        (store, repo)
    }

    fn named(name: &str) -> RevisionData {
        RevisionData::new().with(FeatureId(1), FeatureValue::Text(name.to_string()))
    }

    #[test]
    fn test_empty_repository() {
        let (store, repo) = repository();
        assert!(repo.get_revision(ObjectId(1), &repo.head(0)).unwrap().is_none());
        assert!(repo.available_revision(ObjectId(1), &repo.head(0)).unwrap().is_none());
        assert!(repo.change_kinds(&repo.point(0, 0), &repo.head(0)).unwrap().is_empty());
        assert_eq!(repo.tree().path_name(&repo.branch(0)).unwrap(), MAIN_BRANCH_NAME);
        assert_eq!(store.object_count(), 0);
    }

    #[test]
    fn test_empty_commit_advances_time() {
        let (store, repo) = repository();
        let outcome = repo
            .commit(CommitRequest::new(0, "alice").at(10).comment("nothing"), None, &NullMonitor)
            .unwrap();
        assert!(outcome.new_objects.is_empty());
        assert_eq!(store.commits().len(), 1);

        // The next commit must still be later
        let err = repo
            .commit(CommitRequest::new(0, "alice").at(10), None, &NullMonitor)
            .unwrap_err();
        assert!(matches!(err, RevStoreError::InvalidCommit(_)));
    }

    #[test]
    fn test_unknown_branch() {
        let (_, repo) = repository();
        let err = repo
            .commit(
                CommitRequest::new(42, "alice").at(10).create(ObjectId(1), TypeId(1), named("a")),
                None,
                &NullMonitor,
            )
            .unwrap_err();
        assert!(matches!(err, RevStoreError::BranchNotFound(42)));
        assert!(repo.tree().branch_by_path("MAIN/missing").unwrap().is_none());
        assert!(repo.tree().branch_by_path("OTHER").unwrap().is_none());
    }

    #[test]
    fn test_branch_before_first_commit() {
        let (_, repo) = repository();
        let early = repo.create_branch(&repo.point(0, 5), "early").unwrap();
        repo.commit(
            CommitRequest::new(0, "alice").at(10).create(ObjectId(1), TypeId(1), named("late")),
            None,
            &NullMonitor,
        )
        .unwrap();

        assert!(repo.get_revision(ObjectId(1), &repo.head(early.id())).unwrap().is_none());

        // Commits on the new branch start after its base point
        let err = repo
            .commit(CommitRequest::new(early.id(), "bob").at(5), None, &NullMonitor)
            .unwrap_err();
        assert!(matches!(err, RevStoreError::InvalidCommit(_)));
    }

    #[test]
    fn test_unicode_payloads() {
        let (_, repo) = repository();
        let name = "Überweisung 請求書 🧾";
        let outcome = repo
            .commit(
                CommitRequest::new(0, "zoë").at(10).create(ObjectId(1), TypeId(1), named(name)),
                None,
                &NullMonitor,
            )
            .unwrap();
        let revision = repo.get_revision(ObjectId(1), &outcome.point).unwrap().unwrap();
        assert_eq!(revision.data.read(FeatureId(1)), Some(&FeatureValue::Text(name.to_string())));
    }

    #[test]
    fn test_boundary_ids() {
        let (_, repo) = repository();
        let outcome = repo
            .commit(
                CommitRequest::new(0, "alice")
                    .at(10)
                    .create(ObjectId(i64::MAX), TypeId(1), named("max"))
                    .create(ObjectId(i64::MIN), TypeId(1), named("min")),
                None,
                &NullMonitor,
            )
            .unwrap();
        let found = repo
            .get_revisions(&[ObjectId(i64::MAX), ObjectId(0), ObjectId(i64::MIN)], &outcome.point)
            .unwrap();
        assert!(found[0].is_some());
        assert!(found[1].is_none());
        assert!(found[2].is_some());
    }

    #[test]
    fn test_detach_then_recreate_is_rejected() {
        let (_, repo) = repository();
        repo.commit(
            CommitRequest::new(0, "alice").at(10).create(ObjectId(1), TypeId(1), named("a")),
            None,
            &NullMonitor,
        )
        .unwrap();
        repo.commit(CommitRequest::new(0, "alice").at(20).detach(ObjectId(1)), None, &NullMonitor)
            .unwrap();

        // Ids are never reused, even after detachment
        let err = repo
            .commit(
                CommitRequest::new(0, "alice").at(30).create(ObjectId(1), TypeId(1), named("again")),
                None,
                &NullMonitor,
            )
            .unwrap_err();
        assert!(matches!(err, RevStoreError::InvalidCommit(_)));
    }
}
