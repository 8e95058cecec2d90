//! Per-view change accumulation.
use rustc_hash::FxHashMap;
use std::collections::HashMap;

use crate::key::Key;
use crate::node::{Digest, Node};

/// A before/after pair for a single key.
///
/// `before` is captured once, from the parent trie, the first time the key is
/// touched; `after` is overwritten on every later touch so repeated writes to
/// one key coalesce.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Change<T> {
    pub before: T,
    pub after: T,
}

/// Everything a view has changed relative to its parent.
///
/// `after: None` in `nodes` marks a deletion; a node created inside the view
/// has `before: None`. Enumeration order of either map is not guaranteed.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub values: FxHashMap<Key, Change<Option<Vec<u8>>>>,
    pub nodes: FxHashMap<Key, Change<Option<Node>>>,
    /// Root ID of the materialised view; set only by a full recomputation.
    pub root_id: Option<Digest>,
}

impl ChangeSet {
    pub fn with_capacity(estimated: usize) -> Self {
        Self {
            values: FxHashMap::with_capacity_and_hasher(estimated, Default::default()),
            nodes: FxHashMap::with_capacity_and_hasher(estimated, Default::default()),
            root_id: None,
        }
    }

    /// Folds a committed child's changes into this set. Existing entries keep
    /// their `before` so the combined set still describes one transition from
    /// this view's parent state.
    pub(crate) fn merge_from(&mut self, child: &ChangeSet) {
        for (key, change) in &child.nodes {
            match self.nodes.get_mut(key) {
                Some(existing) => existing.after = change.after.clone(),
                None => {
                    self.nodes.insert(key.clone(), change.clone());
                }
            }
        }
        for (key, change) in &child.values {
            match self.values.get_mut(key) {
                Some(existing) => existing.after = change.after.clone(),
                None => {
                    self.values.insert(key.clone(), change.clone());
                }
            }
        }
        self.root_id = child.root_id;
    }
}

/// One write in a batch: `value: None` deletes the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchOp {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// The input to view construction: an ordered batch and/or an unordered map
/// of writes. Later batch entries win over earlier ones for the same key, and
/// map entries win over the batch.
#[derive(Clone, Debug, Default)]
pub struct ViewChanges {
    pub batch_ops: Vec<BatchOp>,
    pub map_ops: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

impl ViewChanges {
    pub fn from_batch<I>(ops: I) -> Self
    where
        I: IntoIterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
    {
        Self {
            batch_ops: ops
                .into_iter()
                .map(|(key, value)| BatchOp { key, value })
                .collect(),
            map_ops: HashMap::new(),
        }
    }

    pub fn from_map(ops: HashMap<Vec<u8>, Option<Vec<u8>>>) -> Self {
        Self {
            batch_ops: Vec::new(),
            map_ops: ops,
        }
    }

    pub fn len(&self) -> usize {
        self.batch_ops.len() + self.map_ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
