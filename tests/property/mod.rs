//! Property-based tests using proptest
//!
//! These tests verify invariants that should hold for any sequence of
//! layers, change sets, branch trees or commits.

use ::revstore::progress::{CallbackMonitor, ProgressInfo};
use ::revstore::store::MemoryStore;
use ::revstore::*;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One mutation of an availability layer
#[derive(Debug, Clone)]
enum LayerOp {
    Add(i64, i32),
    Hide(i64),
    Remove(i64),
}

fn layer_op_strategy() -> impl Strategy<Value = LayerOp> {
    prop_oneof![
        3 => (0i64..20, 1i32..10).prop_map(|(id, version)| LayerOp::Add(id, version)),
        1 => (0i64..20).prop_map(LayerOp::Hide),
        1 => (0i64..20).prop_map(LayerOp::Remove),
    ]
}

fn build_chain(layers: &[Vec<LayerOp>]) -> RevisionAvailabilityInfo {
    let mut current: Option<Arc<RevisionAvailabilityInfo>> = None;
    for (index, ops) in layers.iter().enumerate() {
        let timestamp = index as i64 * 10;
        let mut layer = match current.take() {
            Some(previous) => RevisionAvailabilityInfo::successor(previous, 0, timestamp),
            None => RevisionAvailabilityInfo::new(0, timestamp),
        };
        for op in ops {
            match op {
                LayerOp::Add(id, version) => {
                    layer.add_revision(RevisionKey::new(ObjectId(*id), *version));
                }
                LayerOp::Hide(id) => layer.hide(ObjectId(*id)),
                LayerOp::Remove(id) => {
                    layer.remove_revision(ObjectId(*id));
                }
            }
        }
        current = Some(Arc::new(layer));
    }
    current
        .map(|layer| (*layer).clone())
        .unwrap_or_else(|| RevisionAvailabilityInfo::new(0, 0))
}

fn new_revision(id: i64) -> Revision {
    Revision {
        key: RevisionKey::new(ObjectId(id), 1),
        branch: 0,
        timestamp: 10,
        type_id: TypeId(1),
        container_id: None,
        containing_feature: None,
        data: RevisionData::new(),
    }
}

fn named(name: &str) -> RevisionData {
    RevisionData::new().with(FeatureId(1), FeatureValue::Text(name.to_string()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_flatten_preserves_visibility(
        layers in prop::collection::vec(prop::collection::vec(layer_op_strategy(), 0..12), 1..6)
    ) {
        let chain = build_chain(&layers);
        let flat = chain.flatten();
        prop_assert_eq!(flat.depth(), 1);
        for id in 0..20 {
            prop_assert_eq!(chain.get_revision(ObjectId(id)), flat.get_revision(ObjectId(id)));
        }

        let visible: Vec<RevisionKey> = (0..20).filter_map(|id| chain.get_revision(ObjectId(id))).collect();
        let mut listed = chain.revisions();
        listed.sort();
        prop_assert_eq!(listed, visible);
    }

    #[test]
    fn prop_topmost_layer_wins(
        layers in prop::collection::vec(prop::collection::vec(layer_op_strategy(), 0..12), 1..6)
    ) {
        // Model: walk layers newest first, the first layer recording the id decides
        let mut model: BTreeMap<i64, Option<RevisionKey>> = BTreeMap::new();
        for ops in layers.iter().rev() {
            let mut recorded: BTreeMap<i64, Option<RevisionKey>> = BTreeMap::new();
            for op in ops {
                match op {
                    LayerOp::Add(id, version) => {
                        recorded.insert(*id, Some(RevisionKey::new(ObjectId(*id), *version)));
                    }
                    LayerOp::Hide(id) => {
                        recorded.insert(*id, None);
                    }
                    LayerOp::Remove(id) => {
                        recorded.remove(id);
                    }
                }
            }
            for (id, entry) in recorded {
                model.entry(id).or_insert(entry);
            }
        }

        let chain = build_chain(&layers);
        for id in 0..20 {
            let expected = model.get(&id).copied().flatten();
            prop_assert_eq!(chain.get_revision(ObjectId(id)), expected);
        }
    }

    #[test]
    fn prop_classification_precedence(
        new_ids in prop::collection::btree_set(0i64..30, 0..10),
        changed_ids in prop::collection::btree_set(0i64..30, 0..10),
        detached_ids in prop::collection::btree_set(0i64..30, 0..10),
    ) {
        let data = ChangeSetData {
            new_objects: new_ids.iter().map(|id| new_revision(*id)).collect(),
            changed_objects: changed_ids.iter().map(|id| RevisionDelta::new(ObjectId(*id), 1)).collect(),
            detached_objects: detached_ids.iter().map(|id| ObjectId(*id)).collect(),
        };
        let kinds = ChangeClassifier::classify(&data);

        let all: BTreeSet<i64> = new_ids.iter().chain(&changed_ids).chain(&detached_ids).copied().collect();
        prop_assert_eq!(kinds.len(), all.len());
        for id in all {
            let expected = if detached_ids.contains(&id) {
                ChangeKind::Detached
            } else if changed_ids.contains(&id) {
                ChangeKind::Changed
            } else {
                ChangeKind::New
            };
            prop_assert_eq!(kinds[&ObjectId(id)], expected);
        }

        // Classifying the same data twice gives the same answer
        prop_assert_eq!(ChangeClassifier::classify(&data), kinds);
    }

    #[test]
    fn prop_paths_resolve_to_their_branch(parents in prop::collection::vec(any::<prop::sample::Index>(), 1..10)) {
        let store = Arc::new(MemoryStore::new());
        let repo = RepositoryBuilder::new().load_workers(1).build(store).unwrap();
        let tree = repo.tree();

        let mut created = vec![tree.main()];
        for (i, parent) in parents.iter().enumerate() {
            let parent = created[parent.index(created.len())].clone();
            let branch = repo
                .create_branch(&BranchPoint::new(parent, 10 + i as i64), &format!("b{}", i))
                .unwrap();
            created.push(branch);
        }

        for branch in &created {
            let path = tree.path_name(branch).unwrap();
            let resolved = tree.branch_by_path(&path).unwrap().unwrap();
            prop_assert_eq!(resolved.id(), branch.id());

            // Resolving a path in two halves lands on the same branch
            let segments: Vec<&str> = path.split('/').skip(1).collect();
            for split in 0..=segments.len() {
                let head = segments[..split].join("/");
                let tail = segments[split..].join("/");
                let middle = tree.resolve_path(&tree.main(), &head).unwrap().unwrap();
                let end = tree.resolve_path(&middle, &tail).unwrap().unwrap();
                prop_assert_eq!(end.id(), branch.id());
            }
        }
    }

    #[test]
    fn prop_progress_matches_total_work(
        units in 0usize..4,
        created in 0i64..6,
        detached in 0i64..4,
        changed in 0i64..4,
    ) {
        let store = Arc::new(MemoryStore::new());
        let repo = RepositoryBuilder::new().load_workers(1).build(store).unwrap();

        // Objects 0..8 exist before the measured commit
        let setup = (0..8).fold(CommitRequest::new(0, "setup").at(10), |req, id| {
            req.create(ObjectId(id), TypeId(1), named("existing"))
        });
        repo.commit(setup, None, &NullMonitor).unwrap();

        let mut request = CommitRequest::new(0, "alice").at(20);
        for unit in 0..units {
            request = request.unit(PackageUnit { id: format!("urn:unit:{}", unit), data: vec![unit as u8] });
        }
        for id in 0..created {
            request = request.create(ObjectId(100 + id), TypeId(1), named("new"));
        }
        for id in 0..detached {
            request = request.detach(ObjectId(id));
        }
        for id in 0..changed {
            request = request.set(ObjectId(4 + id), FeatureId(2), FeatureValue::Int(id));
        }

        let monitor = CallbackMonitor::new(|_: ProgressInfo| {});
        repo.commit(request, None, &monitor).unwrap();

        let expected = 1 + units as u64 + 2 + created as u64 + detached as u64 + changed as u64;
        prop_assert_eq!(monitor.total(), expected);
        prop_assert_eq!(monitor.processed(), expected);
    }
}
