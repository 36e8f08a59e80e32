//! Hash collections used across revstore.
//!
//! Switches between gxhash and std hashing based on the `gxhash` feature so the
//! crate still builds on CPUs without AES-NI/SSE2. Object and branch tables are
//! keyed by small integers, where gxhash is noticeably faster than SipHash.

use crate::types::ObjectId;
use dashmap::DashMap;

#[cfg(feature = "gxhash")]
pub use gxhash::{HashMap, HashMapExt, HashSet, HashSetExt, GxBuildHasher};

#[cfg(not(feature = "gxhash"))]
pub use std::collections::{HashMap, HashSet};

/// Hasher used by every concurrent table in the crate
#[cfg(not(feature = "gxhash"))]
pub type GxBuildHasher = std::hash::RandomState;

/// Constructors that gxhash maps expose and std maps get through this trait
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Creates an empty map
    fn new() -> Self;
    /// Creates an empty map with room for `capacity` entries
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for HashMap<K, V> {
    fn new() -> Self {
        HashMap::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity_and_hasher(capacity, Default::default())
    }
}

/// Constructors that gxhash sets expose and std sets get through this trait
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    /// Creates an empty set
    fn new() -> Self;
    /// Creates an empty set with room for `capacity` entries
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for HashSet<T> {
    fn new() -> Self {
        HashSet::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashSet::with_capacity_and_hasher(capacity, Default::default())
    }
}

/// Concurrent table keyed by object id
pub type ObjectTable<V> = DashMap<ObjectId, V, GxBuildHasher>;

/// Create an empty concurrent table sized for `capacity` entries
pub fn concurrent_table<K, V>(capacity: usize) -> DashMap<K, V, GxBuildHasher>
where
    K: Eq + std::hash::Hash,
{
    DashMap::with_capacity_and_hasher(capacity, GxBuildHasher::default())
}
