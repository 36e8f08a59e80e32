//! Concurrency tests
//!
//! Readers share one cache while commits are serialized per repository.

use ::revstore::store::MemoryStore;
use ::revstore::*;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn text(value: &str) -> FeatureValue {
    FeatureValue::Text(value.to_string())
}

fn named(value: &str) -> RevisionData {
    RevisionData::new().with(FeatureId(1), text(value))
}

/// Store holding object 1 created at 100 and renamed to `v{i}` at `1000 + 10 * i`
fn renamed_history(renames: i64) -> (Arc<MemoryStore>, Repository) {
    let store = Arc::new(MemoryStore::new());
    let repo = RepositoryBuilder::new().load_workers(2).build(store.clone()).unwrap();
    repo.commit(
        CommitRequest::new(0, "setup").at(100).create(ObjectId(1), TypeId(1), named("original")),
        None,
        &NullMonitor,
    )
    .unwrap();
    for i in 0..renames {
        repo.commit(
            CommitRequest::new(0, "setup")
                .at(1000 + 10 * i)
                .set(ObjectId(1), FeatureId(1), text(&format!("v{}", i))),
            None,
            &NullMonitor,
        )
        .unwrap();
    }
    (store, repo)
}

fn expected_name(timestamp: i64, renames: i64) -> FeatureValue {
    if timestamp < 1000 {
        text("original")
    } else {
        let index = ((timestamp - 1000) / 10).min(renames - 1);
        text(&format!("v{}", index))
    }
}

/// Counts from one mixed read/write run
#[derive(Debug, Default)]
pub struct WorkloadReport {
    pub commits: usize,
    pub reads: usize,
    pub misses: usize,
}

/// Run `writers` committing threads against `readers` reading threads
///
/// Each writer owns a disjoint id range and renames its own objects, so every
/// read of an owned object must return one of that writer's names.
pub fn run_mixed_workload(writers: i64, readers: usize, rounds: i64) -> anyhow::Result<WorkloadReport> {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(RepositoryBuilder::new().load_workers(2).build(store)?);
    let seed = (0..writers * 10).fold(CommitRequest::new(0, "seed").at(100), |req, id| {
        req.create(ObjectId(id), TypeId(1), named("seed"))
    });
    repo.commit(seed, None, &NullMonitor)?;

    let done = Arc::new(AtomicBool::new(false));
    let writer_handles: Vec<_> = (0..writers)
        .map(|writer| {
            let repo = Arc::clone(&repo);
            thread::spawn(move || -> anyhow::Result<usize> {
                for round in 0..rounds {
                    let id = ObjectId(writer * 10 + round % 10);
                    let name = format!("writer {} round {}", writer, round);
                    repo.commit(
                        CommitRequest::new(0, format!("writer {}", writer)).set(id, FeatureId(1), text(&name)),
                        None,
                        &NullMonitor,
                    )?;
                }
                Ok(rounds as usize)
            })
        })
        .collect();

    let reader_handles: Vec<_> = (0..readers)
        .map(|_| {
            let repo = Arc::clone(&repo);
            let done = Arc::clone(&done);
            thread::spawn(move || -> anyhow::Result<(usize, usize)> {
                let mut rng = rand::rng();
                let (mut reads, mut misses) = (0, 0);
                while !done.load(Ordering::SeqCst) {
                    let id = rng.random_range(0..writers * 10);
                    match repo.get_revision(ObjectId(id), &repo.head(0))? {
                        Some(revision) => {
                            if let Some(FeatureValue::Text(name)) = revision.data.read(FeatureId(1)) {
                                let owner = format!("writer {} ", id / 10);
                                anyhow::ensure!(name == "seed" || name.starts_with(&owner), "{} read {}", id, name);
                            }
                        }
                        None => misses += 1,
                    }
                    reads += 1;
                }
                Ok((reads, misses))
            })
        })
        .collect();

    let mut report = WorkloadReport::default();
    for handle in writer_handles {
        report.commits += handle.join().map_err(|_| anyhow::anyhow!("writer panicked"))??;
    }
    done.store(true, Ordering::SeqCst);
    for handle in reader_handles {
        let (reads, misses) = handle.join().map_err(|_| anyhow::anyhow!("reader panicked"))??;
        report.reads += reads;
        report.misses += misses;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_misses_load_once() {
        let (store, _) = renamed_history(3);

        // A second repository over the same store starts with a cold cache
        let cold = Arc::new(RepositoryBuilder::new().load_workers(2).build(store.clone()).unwrap());
        let loads_before = store.revision_loads();
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cold = Arc::clone(&cold);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cold.get_revision(ObjectId(1), &cold.head(0)).unwrap().unwrap().version()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 4);
        }
        assert_eq!(store.revision_loads(), loads_before + 1);
        assert_eq!(cold.cache_stats().loads, 1);
    }

    #[test]
    fn test_readers_see_history_while_writer_commits() {
        let renames = 10;
        let (_, repo) = renamed_history(renames);
        let repo = Arc::new(repo);
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let repo = Arc::clone(&repo);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 0..20 {
                    repo.commit(
                        CommitRequest::new(0, "writer")
                            .at(5000 + i)
                            .create(ObjectId(1000 + i), TypeId(2), named("fresh")),
                        None,
                        &NullMonitor,
                    )
                    .unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut rng = rand::rng();
                    let mut reads = 0;
                    while !done.load(Ordering::SeqCst) || reads < 200 {
                        let timestamp = rng.random_range(100..1200);
                        let revision = repo
                            .get_revision(ObjectId(1), &repo.point(0, timestamp))
                            .unwrap()
                            .unwrap();
                        assert_eq!(
                            revision.data.read(FeatureId(1)),
                            Some(&expected_name(timestamp, renames)),
                            "wrong revision at {}",
                            timestamp
                        );
                        reads += 1;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        let head = repo.head(0);
        let fresh = repo
            .get_revisions(&(1000..1020).map(ObjectId).collect::<Vec<_>>(), &head)
            .unwrap();
        assert!(fresh.iter().all(Option::is_some));
    }

    #[test]
    fn test_parallel_commits_are_serialized() {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(RepositoryBuilder::new().build(store.clone()).unwrap());
        let threads = 4;
        let per_thread = 5;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads as i64)
            .map(|thread_id| {
                let repo = Arc::clone(&repo);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..per_thread)
                        .map(|op| {
                            let id = ObjectId(thread_id * 100 + op);
                            repo.commit(
                                CommitRequest::new(0, format!("user {}", thread_id)).create(id, TypeId(1), named("x")),
                                None,
                                &NullMonitor,
                            )
                            .unwrap()
                            .point
                            .timestamp
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut timestamps: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        timestamps.sort_unstable();
        timestamps.dedup();
        assert_eq!(timestamps.len(), threads * per_thread as usize);

        // Commits landed in timestamp order, each chained to its predecessor
        let commits = store.commits();
        assert_eq!(commits.len(), threads * per_thread as usize);
        for pair in commits.windows(2) {
            assert!(pair[0].metadata.timestamp < pair[1].metadata.timestamp);
            assert_eq!(pair[1].metadata.previous_timestamp, pair[0].metadata.timestamp);
        }
        assert_eq!(store.object_count(), threads * per_thread as usize);
    }

    #[test]
    fn test_mixed_workload() -> anyhow::Result<()> {
        let report = run_mixed_workload(3, 3, 15)?;
        assert_eq!(report.commits, 45);
        assert_eq!(report.misses, 0);
        Ok(())
    }

    #[test]
    fn test_branches_created_concurrently() {
        let (_, repo) = renamed_history(1);
        let repo = Arc::new(repo);

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let repo = Arc::clone(&repo);
                thread::spawn(move || {
                    let base = repo.point(0, 500);
                    repo.create_branch(&base, &format!("feature-{}", i)).unwrap().id()
                })
            })
            .collect();
        let mut ids: Vec<BranchId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 6);

        let children = repo.tree().branches(&repo.branch(0), true).unwrap();
        assert_eq!(children.len(), 6);
        for i in 0..6 {
            let path = format!("MAIN/feature-{}", i);
            assert!(repo.tree().branch_by_path(&path).unwrap().is_some(), "missing {}", path);
        }
    }
}
