use crate::config::Config;
use derive_more::{Display, From};
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

/// Stable handle of a node inside the [`Graph`](crate::graph::Graph) arena
/// that created it.
///
/// The compact `u16` index bounds the number of nodes per graph and keeps
/// per-run dependency counters small.
#[derive(Debug, Display, From, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("#{_0}")]
#[repr(transparent)]
pub struct NodeId(pub(crate) u16);

impl NodeId {
    /// Position of the node in its graph's arena.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Correlation tag threaded through payloads to tell concurrently in-flight
/// runs apart.
pub type ObjectId = u64;

/// Payload type bound by a specific `Config`.
pub type PayloadOf<C> = <C as Config>::Payload;

/// Boxed error returned by node callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of a single callback invocation.
pub type WorkResult<P> = Result<P, BoxError>;

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
