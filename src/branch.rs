//! Branch hierarchy and branch-point addressing
//!
//! This module provides the [`BranchTree`], a lazily loaded namespace of
//! branches, and [`BranchPoint`], the `(branch, timestamp)` coordinate that
//! addresses one moment in a branch's history.
//!
//! ## Overview
//!
//! Branches form a tree rooted at the single main branch. Every other branch
//! descends from a base point on its parent:
//!
//! ```text
//! MAIN
//! ├── release        (base: MAIN@1000)
//! │   └── hotfix     (base: release@1500)
//! └── feature        (base: MAIN@1200)
//! ```
//!
//! Nodes are created on demand. A node first known only by id is a *proxy*:
//! its name and base point are fetched from the injected [`BranchLoader`] the
//! first time somebody asks for them, and its children are fetched the first
//! time somebody lists them.
//!
//! ## Thread Safety
//!
//! - Resolving a proxy uses double-checked locking scoped to the node, so
//!   concurrent callers trigger at most one loader call per node.
//! - Child lists are copy-on-write: readers clone an `Arc` snapshot and iterate
//!   it without holding any lock; appends install a new list under the node's
//!   child lock. Lists are only ever appended to.
//! - A failed load leaves the node exactly as it was (still a proxy, or still
//!   without children), so a later call can retry.
//!
//! ## Examples
//!
//! ```rust
//! use revstore::branch::{BranchPoint, BranchTree};
//! use revstore::store::MemoryStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let tree = BranchTree::new(store);
//!
//! let main = tree.main();
//! let feature = tree.create_branch(&BranchPoint::new(main.clone(), 1000), "feature")?;
//!
//! let resolved = tree.resolve_path(&main, "feature")?.unwrap();
//! assert_eq!(resolved, feature);
//! assert_eq!(tree.path_name(&feature)?, "MAIN/feature");
//! # Ok::<(), revstore::RevStoreError>(())
//! ```

use crate::collections::{concurrent_table, GxBuildHasher};
use crate::error::{Result, RevStoreError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, trace};

/// Branch identifier: 0 is main, negative ids are local-only, positive ids are persisted
pub type BranchId = i32;

/// Id of the main branch
pub const MAIN_BRANCH_ID: BranchId = 0;

/// Name of the main branch
pub const MAIN_BRANCH_NAME: &str = "MAIN";

/// Separator between branch names in a path
pub const PATH_SEPARATOR: char = '/';

/// Branch details as returned by a [`BranchLoader`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Branch name, unique among its siblings
    pub name: String,
    /// Parent branch
    pub base_branch: BranchId,
    /// Moment on the parent the branch descends from
    pub base_timestamp: i64,
    /// Local-only branch that is never persisted
    #[serde(default)]
    pub local: bool,
}

/// One child entry as returned by [`BranchLoader::load_sub_branches`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubBranchInfo {
    /// Child id
    pub id: BranchId,
    /// Child name
    pub name: String,
    /// Moment on the parent the child descends from
    pub base_timestamp: i64,
}

/// Source of branch data
///
/// Calls may block. A loader reports an unknown id as
/// [`RevStoreError::BranchNotFound`]; any other error is a load failure.
pub trait BranchLoader: Send + Sync {
    /// Load the name and base point of one branch
    fn load_branch(&self, id: BranchId) -> Result<BranchInfo>;

    /// Load the direct children of one branch, in creation order
    fn load_sub_branches(&self, id: BranchId) -> Result<Vec<SubBranchInfo>>;

    /// Persist a new branch and allocate its id
    fn create_branch(&self, info: &BranchInfo) -> Result<BranchId>;
}

/// Structural change notification
#[derive(Debug, Clone)]
pub enum BranchEvent {
    /// A proxy node got its name and base point
    Resolved(Arc<Branch>),
    /// A child was appended to a parent's child list
    ChildAdded {
        /// Parent branch
        parent: Arc<Branch>,
        /// New child
        child: Arc<Branch>,
    },
}

/// Receives structural change notifications from a [`BranchTree`]
pub trait BranchListener: Send + Sync {
    /// Called after the change is visible to readers
    fn on_branch_event(&self, event: &BranchEvent);
}

#[derive(Debug)]
struct Resolved {
    name: String,
    base: Option<(BranchId, i64)>,
}

type ChildList = Arc<Vec<Arc<Branch>>>;

/// One node of the branch tree
///
/// Equality, hashing and ordering use the id only, since the name may not be
/// loaded yet.
pub struct Branch {
    id: BranchId,
    main: bool,
    local: bool,
    resolved: RwLock<Option<Arc<Resolved>>>,
    load_lock: Mutex<()>,
    children: RwLock<Option<ChildList>>,
    children_lock: Mutex<()>,
}

impl Branch {
    fn proxy(id: BranchId) -> Self {
        Self {
            id,
            main: false,
            local: false,
            resolved: RwLock::new(None),
            load_lock: Mutex::new(()),
            children: RwLock::new(None),
            children_lock: Mutex::new(()),
        }
    }

    fn resolved(id: BranchId, info: BranchInfo) -> Self {
        let branch = Self::proxy(id);
        *branch.resolved.write() = Some(Arc::new(Resolved {
            name: info.name,
            base: Some((info.base_branch, info.base_timestamp)),
        }));
        branch
    }

    fn new_main(local: bool) -> Self {
        let mut branch = Self::proxy(MAIN_BRANCH_ID);
        branch.main = true;
        branch.local = local;
        *branch.resolved.write() = Some(Arc::new(Resolved {
            name: MAIN_BRANCH_NAME.to_string(),
            base: None,
        }));
        branch
    }

    /// Branch id
    pub fn id(&self) -> BranchId {
        self.id
    }

    /// Whether this is the main branch
    pub fn is_main(&self) -> bool {
        self.main
    }

    /// Whether the branch exists only locally
    pub fn is_local(&self) -> bool {
        self.local || self.id < 0
    }

    /// Whether name and base point are still unresolved
    pub fn is_proxy(&self) -> bool {
        self.resolved.read().is_none()
    }

    /// Name if already resolved; never loads
    pub fn cached_name(&self) -> Option<String> {
        self.resolved.read().as_ref().map(|r| r.name.clone())
    }

    /// Whether the child list has been loaded
    pub fn children_loaded(&self) -> bool {
        self.children.read().is_some()
    }

    fn children_snapshot(&self) -> Option<ChildList> {
        self.children.read().clone()
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("main", &self.main)
            .field("name", &self.cached_name())
            .field("children_loaded", &self.children_loaded())
            .finish()
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cached_name() {
            Some(name) => write!(f, "{}[{}]", name, self.id),
            None => write!(f, "[{}]", self.id),
        }
    }
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Branch {}

impl Hash for Branch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Branch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// A moment in a branch's history
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchPoint {
    /// Branch
    pub branch: Arc<Branch>,
    /// Milliseconds; `i64::MAX` addresses the branch head
    pub timestamp: i64,
}

impl BranchPoint {
    /// Create a point
    pub fn new(branch: Arc<Branch>, timestamp: i64) -> Self {
        Self { branch, timestamp }
    }

    /// The latest state of a branch
    pub fn head(branch: Arc<Branch>) -> Self {
        Self::new(branch, i64::MAX)
    }

    /// Branch id shortcut
    pub fn branch_id(&self) -> BranchId {
        self.branch.id()
    }

    /// Whether this point addresses the branch head
    pub fn is_head(&self) -> bool {
        self.timestamp == i64::MAX
    }
}

impl fmt::Display for BranchPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_head() {
            write!(f, "{}@HEAD", self.branch)
        } else {
            write!(f, "{}@{}", self.branch, self.timestamp)
        }
    }
}

/// Lazily loaded branch hierarchy
///
/// Owns every [`Branch`] node; readers share nodes through `Arc`.
pub struct BranchTree {
    loader: Arc<dyn BranchLoader>,
    branches: DashMap<BranchId, Arc<Branch>, GxBuildHasher>,
    main: Arc<Branch>,
    listeners: RwLock<Vec<Arc<dyn BranchListener>>>,
}

impl fmt::Debug for BranchTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchTree")
            .field("main", &self.main)
            .field("known_branches", &self.branches.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl BranchTree {
    /// Create a tree whose main branch is persisted
    pub fn new(loader: Arc<dyn BranchLoader>) -> Self {
        Self::with_main(loader, Branch::new_main(false))
    }

    /// Create a tree whose main branch exists only locally
    pub fn new_local(loader: Arc<dyn BranchLoader>) -> Self {
        Self::with_main(loader, Branch::new_main(true))
    }

    fn with_main(loader: Arc<dyn BranchLoader>, main: Branch) -> Self {
        let main = Arc::new(main);
        let branches = concurrent_table(64);
        branches.insert(MAIN_BRANCH_ID, main.clone());
        Self {
            loader,
            branches,
            main,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// The main branch
    pub fn main(&self) -> Arc<Branch> {
        self.main.clone()
    }

    /// Register a structural change listener
    pub fn add_listener(&self, listener: Arc<dyn BranchListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of nodes registered so far
    pub fn known_branches(&self) -> usize {
        self.branches.len()
    }

    /// Get a node by id, registering a proxy if it is not known yet
    pub fn get_branch(&self, id: BranchId) -> Arc<Branch> {
        if id == MAIN_BRANCH_ID {
            return self.main.clone();
        }
        self.branches
            .entry(id)
            .or_insert_with(|| {
                trace!("Registered proxy branch {}", id);
                Arc::new(Branch::proxy(id))
            })
            .clone()
    }

    /// Get a node by id using already known details
    ///
    /// A missing node is registered fully resolved; a proxy node is resolved
    /// in place. Details of an already resolved node are left unchanged.
    pub fn get_branch_with(&self, id: BranchId, info: BranchInfo) -> Arc<Branch> {
        if id == MAIN_BRANCH_ID {
            return self.main.clone();
        }
        let branch = self
            .branches
            .entry(id)
            .or_insert_with(|| Arc::new(Branch::resolved(id, info.clone())))
            .clone();

        if branch.is_proxy() {
            let _guard = branch.load_lock.lock();
            let mut resolved = branch.resolved.write();
            if resolved.is_none() {
                *resolved = Some(Arc::new(Resolved {
                    name: info.name,
                    base: Some((info.base_branch, info.base_timestamp)),
                }));
            }
        }
        branch
    }

    fn ensure_resolved(&self, branch: &Arc<Branch>) -> Result<Arc<Resolved>> {
        if let Some(resolved) = branch.resolved.read().clone() {
            return Ok(resolved);
        }

        let resolved = {
            let _guard = branch.load_lock.lock();
            if let Some(resolved) = branch.resolved.read().clone() {
                return Ok(resolved);
            }

            debug!("Loading branch {}", branch.id);
            let info = self.loader.load_branch(branch.id).map_err(|err| match err {
                err @ RevStoreError::BranchNotFound(_) => err,
                err => RevStoreError::load_failure(format!("branch {}", branch.id), err.to_string()),
            })?;

            let resolved = Arc::new(Resolved {
                name: info.name,
                base: Some((info.base_branch, info.base_timestamp)),
            });
            *branch.resolved.write() = Some(resolved.clone());
            resolved
        };

        // Listeners may call back into the tree
        self.notify(&BranchEvent::Resolved(branch.clone()));
        Ok(resolved)
    }

    /// Name of a branch, loading it if the node is a proxy
    pub fn name(&self, branch: &Arc<Branch>) -> Result<String> {
        Ok(self.ensure_resolved(branch)?.name.clone())
    }

    /// Point on the parent a branch descends from; `None` for main
    pub fn base_point(&self, branch: &Arc<Branch>) -> Result<Option<BranchPoint>> {
        let resolved = self.ensure_resolved(branch)?;
        Ok(resolved
            .base
            .map(|(id, timestamp)| BranchPoint::new(self.get_branch(id), timestamp)))
    }

    /// Direct children of a branch in creation order
    ///
    /// Without `load_on_demand`, an unloaded child list reads as empty.
    pub fn branches(&self, branch: &Arc<Branch>, load_on_demand: bool) -> Result<Arc<Vec<Arc<Branch>>>> {
        if let Some(children) = branch.children_snapshot() {
            return Ok(children);
        }
        if !load_on_demand {
            return Ok(Arc::new(Vec::new()));
        }

        let _guard = branch.children_lock.lock();
        if let Some(children) = branch.children_snapshot() {
            return Ok(children);
        }

        debug!("Loading sub-branches of {}", branch.id);
        let subs = self.loader.load_sub_branches(branch.id).map_err(|err| {
            RevStoreError::load_failure(format!("sub-branches of {}", branch.id), err.to_string())
        })?;

        let children: Vec<Arc<Branch>> = subs
            .into_iter()
            .map(|sub| {
                self.get_branch_with(
                    sub.id,
                    BranchInfo {
                        name: sub.name,
                        base_branch: branch.id,
                        base_timestamp: sub.base_timestamp,
                        local: sub.id < 0,
                    },
                )
            })
            .collect();

        let children = Arc::new(children);
        *branch.children.write() = Some(children.clone());
        Ok(children)
    }

    /// Append a child to a loaded child list and notify listeners
    ///
    /// An unloaded list stays unloaded; the child shows up when the list is
    /// fetched from the loader.
    pub fn add_child(&self, parent: &Arc<Branch>, child: Arc<Branch>) {
        {
            let _guard = parent.children_lock.lock();
            if let Some(current) = parent.children_snapshot() {
                if !current.iter().any(|existing| existing.id == child.id) {
                    let mut next = Vec::with_capacity(current.len() + 1);
                    next.extend(current.iter().cloned());
                    next.push(child.clone());
                    *parent.children.write() = Some(Arc::new(next));
                }
            }
        }
        trace!("Added branch {} under {}", child.id, parent.id);
        self.notify(&BranchEvent::ChildAdded {
            parent: parent.clone(),
            child,
        });
    }

    /// Create a new branch descending from `base`
    pub fn create_branch(&self, base: &BranchPoint, name: &str) -> Result<Arc<Branch>> {
        if name.is_empty() || name.contains(PATH_SEPARATOR) {
            return Err(RevStoreError::InvalidConfiguration(format!("invalid branch name '{}'", name)));
        }
        if base.is_head() {
            return Err(RevStoreError::InvalidConfiguration(
                "a branch must descend from a fixed point, not a head".to_string(),
            ));
        }
        for sibling in self.branches(&base.branch, true)?.iter() {
            if self.name(sibling)? == name {
                return Err(RevStoreError::InvalidConfiguration(format!(
                    "branch '{}' already exists under {}",
                    name, base.branch
                )));
            }
        }

        let info = BranchInfo {
            name: name.to_string(),
            base_branch: base.branch_id(),
            base_timestamp: base.timestamp,
            local: base.branch.is_local(),
        };
        let id = self.loader.create_branch(&info)?;
        let branch = self.get_branch_with(id, info);
        self.add_child(&base.branch, branch.clone());

        debug!("Created branch {} at {}", branch, base);
        Ok(branch)
    }

    /// Resolve a `/`-delimited path of names relative to `root`
    ///
    /// Leading and trailing separators are ignored; an empty path resolves to
    /// `root` itself. Returns `None` when any segment has no matching child.
    pub fn resolve_path(&self, root: &Arc<Branch>, path: &str) -> Result<Option<Arc<Branch>>> {
        let path = path.trim_matches(PATH_SEPARATOR);
        if path.is_empty() {
            return Ok(Some(root.clone()));
        }

        let (first, rest) = path.split_once(PATH_SEPARATOR).unwrap_or((path, ""));
        for child in self.branches(root, true)?.iter() {
            if self.name(child)? == first {
                return self.resolve_path(child, rest);
            }
        }
        Ok(None)
    }

    /// Resolve an absolute path such as `MAIN/release/hotfix`
    pub fn branch_by_path(&self, path: &str) -> Result<Option<Arc<Branch>>> {
        let path = path.trim_matches(PATH_SEPARATOR);
        let (first, rest) = path.split_once(PATH_SEPARATOR).unwrap_or((path, ""));
        if first != MAIN_BRANCH_NAME {
            return Ok(None);
        }
        self.resolve_path(&self.main, rest)
    }

    /// Absolute path of a branch, e.g. `MAIN/release/hotfix`
    pub fn path_name(&self, branch: &Arc<Branch>) -> Result<String> {
        let mut names = vec![self.name(branch)?];
        let mut current = self.base_point(branch)?;
        while let Some(point) = current {
            names.push(self.name(&point.branch)?);
            current = self.base_point(&point.branch)?;
        }
        names.reverse();
        Ok(names.join(&PATH_SEPARATOR.to_string()))
    }

    /// The point itself followed by every base point up to main
    pub fn base_path(&self, point: &BranchPoint) -> Result<Vec<BranchPoint>> {
        let mut path = vec![point.clone()];
        let mut current = self.base_point(&point.branch)?;
        while let Some(base) = current {
            current = self.base_point(&base.branch)?;
            path.push(base);
        }
        Ok(path)
    }

    /// Whether `ancestor` is `branch` or one of its ancestors
    pub fn is_ancestor(&self, ancestor: &Arc<Branch>, branch: &Arc<Branch>) -> Result<bool> {
        let mut current = Some(branch.clone());
        while let Some(candidate) = current {
            if candidate.id == ancestor.id {
                return Ok(true);
            }
            current = self.base_point(&candidate)?.map(|point| point.branch);
        }
        Ok(false)
    }

    /// Order two points by branch ancestry and time
    ///
    /// Points on the same branch compare by timestamp. A point on an ancestor
    /// branch precedes a point on a descendant if it is not later than the
    /// descendant's base on that ancestor. Otherwise the points lie on
    /// diverged lines and are unordered.
    pub fn compare_points(&self, a: &BranchPoint, b: &BranchPoint) -> Result<Option<Ordering>> {
        if a.branch_id() == b.branch_id() {
            return Ok(Some(a.timestamp.cmp(&b.timestamp)));
        }
        if let Some(on_a) = self.base_path(b)?.into_iter().find(|p| p.branch_id() == a.branch_id()) {
            return Ok((a.timestamp <= on_a.timestamp).then_some(Ordering::Less));
        }
        if let Some(on_b) = self.base_path(a)?.into_iter().find(|p| p.branch_id() == b.branch_id()) {
            return Ok((b.timestamp <= on_b.timestamp).then_some(Ordering::Greater));
        }
        Ok(None)
    }

    /// Render the loaded part of the hierarchy below `root`
    pub fn format_tree(&self, root: &Arc<Branch>) -> String {
        let mut out = format!("{}\n", root);
        self.format_children(root, "", &mut out);
        out
    }

    fn format_children(&self, branch: &Arc<Branch>, prefix: &str, out: &mut String) {
        let Some(children) = branch.children_snapshot() else {
            return;
        };
        for (i, child) in children.iter().enumerate() {
            let is_last = i == children.len() - 1;
            let connector = if is_last { "└── " } else { "├── " };
            out.push_str(&format!("{}{}{}\n", prefix, connector, child));

            let extension = if is_last { "    " } else { "│   " };
            self.format_children(child, &format!("{}{}", prefix, extension), out);
        }
    }

    fn notify(&self, event: &BranchEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_branch_event(event);
        }
    }
}
