//! Stateless views: overlays whose parent-side state is injected.
//!
//! A stateless view runs the same structural and hashing algorithms as a
//! stateful view, but resolves missing nodes and values from caller-supplied
//! maps instead of a database: per-attempt *temporary* state, then
//! *permanent* state accumulated across attempts, then an optional parent
//! stateless view. A miss in all of them is an error — exactly what a
//! verifier wants when proof material is incomplete. Unlike a stateful view,
//! a stateless view may be mutated and recalculated repeatedly.
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::apply::{self, NodeSource};
use crate::changes::ChangeSet;
use crate::codec;
use crate::errors::TrieError;
use crate::key::{BranchFactor, Key};
use crate::node::{Digest, Node};
use crate::proof::ProofNode;

struct Inner {
    parent: Option<Arc<StatelessView>>,
    /// The current root node; refreshed after every recalculation.
    root: Node,
    changes: ChangeSet,
    /// Writes not yet reflected in the trie structure.
    unapplied: FxHashMap<Key, Option<Vec<u8>>>,
    needs_recalculation: bool,
    temp_values: FxHashMap<Key, Option<Vec<u8>>>,
    temp_nodes: FxHashMap<Key, Option<Node>>,
    perm_values: FxHashMap<Key, Option<Vec<u8>>>,
    perm_nodes: FxHashMap<Key, Option<Node>>,
}

/// A trie overlay backed by injected state instead of storage.
pub struct StatelessView {
    token_size: usize,
    branch_factor: BranchFactor,
    self_ref: Weak<StatelessView>,
    inner: RwLock<Inner>,
}

impl StatelessView {
    fn with_root(root: Node, branch_factor: BranchFactor) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            token_size: branch_factor.token_size(),
            branch_factor,
            self_ref: self_ref.clone(),
            inner: RwLock::new(Inner {
                parent: None,
                root,
                changes: ChangeSet::default(),
                unapplied: FxHashMap::default(),
                needs_recalculation: false,
                temp_values: FxHashMap::default(),
                temp_nodes: FxHashMap::default(),
                perm_values: FxHashMap::default(),
                perm_nodes: FxHashMap::default(),
            }),
        })
    }

    /// A base view over an empty trie.
    pub fn new_base(branch_factor: BranchFactor) -> Arc<Self> {
        Self::with_root(Node::new(), branch_factor)
    }

    /// A base view whose root node is parsed from its storage encoding.
    pub fn from_root_bytes(
        bytes: &[u8],
        branch_factor: BranchFactor,
    ) -> Result<Arc<Self>, TrieError> {
        let root = codec::decode_node(bytes, branch_factor.token_size())?;
        Ok(Self::with_root(root, branch_factor))
    }

    /// A child view over this one, seeded with this view's current root.
    pub fn new_view(&self) -> Arc<StatelessView> {
        let root = self.inner.read().root.clone();
        let view = StatelessView::with_root(root, self.branch_factor);
        view.inner.write().parent = self.self_ref.upgrade();
        view
    }

    /// Detaches the parent, freezing this view as a verification root.
    pub fn set_base(&self) {
        self.inner.write().parent = None;
    }

    /// Replaces the per-attempt temporary state.
    pub fn set_temporary_state(
        &self,
        values: impl IntoIterator<Item = (Key, Option<Vec<u8>>)>,
        nodes: impl IntoIterator<Item = (Key, Option<Node>)>,
    ) {
        let mut inner = self.inner.write();
        inner.temp_values = values.into_iter().collect();
        inner.temp_nodes = nodes.into_iter().collect();
    }

    /// Merges state into the permanent maps kept across attempts.
    pub fn add_permanent_state(
        &self,
        values: impl IntoIterator<Item = (Key, Option<Vec<u8>>)>,
        nodes: impl IntoIterator<Item = (Key, Option<Node>)>,
    ) {
        let mut inner = self.inner.write();
        inner.perm_values.extend(values);
        inner.perm_nodes.extend(nodes);
    }

    /// Upserts `value` at `key`. Structural work is deferred to the next
    /// recalculation.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        self.record(Key::from_bytes(key), Some(value.to_vec()))
    }

    /// Deletes `key`. Structural work is deferred to the next recalculation.
    pub fn remove(&self, key: &[u8]) -> Result<(), TrieError> {
        self.record(Key::from_bytes(key), None)
    }

    fn record(&self, key: Key, value: Option<Vec<u8>>) -> Result<(), TrieError> {
        let mut inner = self.inner.write();
        inner.needs_recalculation = true;
        inner.unapplied.insert(key.clone(), value.clone());
        let Inner {
            changes,
            parent,
            root,
            temp_values,
            temp_nodes,
            perm_values,
            perm_nodes,
            ..
        } = &mut *inner;
        let source = StatelessSource {
            token_size: self.token_size,
            root,
            parent: parent.as_ref(),
            temp_values,
            temp_nodes,
            perm_values,
            perm_nodes,
        };
        apply::record_value_change(changes, &source, key, value)
    }

    /// The value for `key`: pending changes, the root, then injected and
    /// parent state. `Err(NotFound)` when nothing can answer.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        self.get_value_by_key(&Key::from_bytes(key))
    }

    /// Positional fan-out of [`get_value`](Self::get_value).
    pub fn get_values<K: AsRef<[u8]>>(
        &self,
        keys: &[K],
    ) -> Vec<Result<Option<Vec<u8>>, TrieError>> {
        keys.iter().map(|key| self.get_value(key.as_ref())).collect()
    }

    pub(crate) fn get_value_by_key(&self, key: &Key) -> Result<Option<Vec<u8>>, TrieError> {
        let inner = self.inner.read();
        if let Some(change) = inner.changes.values.get(key) {
            return Ok(change.after.clone());
        }
        if key.is_empty() {
            return Ok(inner.root.value().map(<[u8]>::to_vec));
        }
        inner.source(self.token_size).fetch_value(key)
    }

    pub(crate) fn get_editable_node(&self, key: &Key, has_value: bool) -> Result<Node, TrieError> {
        let inner = self.inner.read();
        if let Some(change) = inner.changes.nodes.get(key) {
            return change.after.clone().ok_or(TrieError::NotFound);
        }
        inner.source(self.token_size).fetch_node(key, has_value)
    }

    /// The Merkle root, recalculating the trie if it is stale.
    pub fn get_merkle_root(&self) -> Result<Digest, TrieError> {
        let mut inner = self.inner.write();
        if !inner.needs_recalculation {
            if let Some(root_id) = inner.changes.root_id {
                return Ok(root_id);
            }
        }
        self.calculate_node_ids(&mut inner)?;
        inner.changes.root_id.ok_or(TrieError::NoValidRoot)
    }

    /// The storage encoding of the current root node.
    pub fn root_bytes(&self) -> Vec<u8> {
        codec::encode_node(&self.inner.read().root, self.token_size)
    }

    fn calculate_node_ids(&self, inner: &mut Inner) -> Result<(), TrieError> {
        // The layer below must be up to date before nodes are pulled from it.
        if let Some(parent) = inner.parent.clone() {
            parent.get_merkle_root()?;
        }
        let unapplied: Vec<(Key, Option<Vec<u8>>)> =
            std::mem::take(&mut inner.unapplied).into_iter().collect();
        let fallback_root = inner.root.clone();
        {
            let Inner {
                changes,
                parent,
                root,
                temp_values,
                temp_nodes,
                perm_values,
                perm_nodes,
                ..
            } = &mut *inner;
            let source = StatelessSource {
                token_size: self.token_size,
                root,
                parent: parent.as_ref(),
                temp_values,
                temp_nodes,
                perm_values,
                perm_nodes,
            };
            for (key, value) in unapplied {
                match value {
                    Some(value) => apply::insert(changes, &source, &key, Some(value))?,
                    None => apply::remove(changes, &source, &key)?,
                }
            }
            apply::compute_root_id(changes, &source, &fallback_root)?;
        }
        if let Some(new_root) = inner
            .changes
            .nodes
            .get(&Key::empty())
            .and_then(|change| change.after.clone())
        {
            inner.root = new_root;
        }
        inner.needs_recalculation = false;
        Ok(())
    }

    /// Rebuilds the trie nodes described by a proof path, deepest first, and
    /// grafts each node's children lying outside `(insert_lt, insert_gt)`
    /// with their claimed IDs. Used by proof verification to reproduce the
    /// boundary structure of the proven trie.
    pub(crate) fn add_path_info(
        &self,
        path: &[ProofNode],
        insert_lt: Option<&Key>,
        insert_gt: Option<&Key>,
    ) -> Result<(), TrieError> {
        let ts = self.token_size;
        let mut inner = self.inner.write();
        inner.needs_recalculation = true;
        let Inner {
            changes,
            parent,
            root,
            temp_values,
            temp_nodes,
            perm_values,
            perm_nodes,
            ..
        } = &mut *inner;
        let source = StatelessSource {
            token_size: ts,
            root,
            parent: parent.as_ref(),
            temp_values,
            temp_nodes,
            perm_values,
            perm_nodes,
        };

        for proof_node in path.iter().rev() {
            let key = &proof_node.key;
            if key.has_partial_byte() && proof_node.value_or_hash.is_some() {
                return Err(TrieError::PartialByteLengthWithValue);
            }
            apply::insert(changes, &source, key, None)?;
            let node = changes
                .nodes
                .get_mut(key)
                .and_then(|change| change.after.as_mut())
                .ok_or(TrieError::GetPathToFailure)?;
            // The pre-image of the digest may be unknown; hash with the
            // claimed digest directly.
            node.set_value_digest(proof_node.value_or_hash.clone());

            if insert_lt.is_none() && insert_gt.is_none() {
                continue;
            }
            let grafts: Vec<(u8, crate::node::Child)> = proof_node
                .children
                .iter()
                .filter_map(|(token, id)| {
                    let compressed_key = node
                        .children()
                        .get(token)
                        .map(|child| child.compressed_key.clone())
                        .unwrap_or_default();
                    let child_key = key.extend_token(*token, ts, &compressed_key);
                    let outside = insert_lt.is_some_and(|lt| child_key < *lt)
                        || insert_gt.is_some_and(|gt| child_key > *gt);
                    outside.then_some((
                        *token,
                        crate::node::Child {
                            compressed_key,
                            id: *id,
                            has_value: false,
                        },
                    ))
                })
                .collect();
            for (token, child) in grafts {
                node.set_child(token, Some(child));
            }
        }
        Ok(())
    }
}

impl Inner {
    fn source(&self, token_size: usize) -> StatelessSource<'_> {
        StatelessSource {
            token_size,
            root: &self.root,
            parent: self.parent.as_ref(),
            temp_values: &self.temp_values,
            temp_nodes: &self.temp_nodes,
            perm_values: &self.perm_values,
            perm_nodes: &self.perm_nodes,
        }
    }
}

/// [`NodeSource`] over injected maps and the optional parent view.
struct StatelessSource<'a> {
    token_size: usize,
    root: &'a Node,
    parent: Option<&'a Arc<StatelessView>>,
    temp_values: &'a FxHashMap<Key, Option<Vec<u8>>>,
    temp_nodes: &'a FxHashMap<Key, Option<Node>>,
    perm_values: &'a FxHashMap<Key, Option<Vec<u8>>>,
    perm_nodes: &'a FxHashMap<Key, Option<Node>>,
}

impl NodeSource for StatelessSource<'_> {
    fn token_size(&self) -> usize {
        self.token_size
    }

    fn fetch_node(&self, key: &Key, has_value: bool) -> Result<Node, TrieError> {
        if key.is_empty() {
            return Ok(self.root.clone());
        }
        for supplied in [self.temp_nodes.get(key), self.perm_nodes.get(key)] {
            match supplied {
                Some(Some(node)) => return Ok(node.clone()),
                Some(None) => return Err(TrieError::NotFound),
                None => {}
            }
        }
        match self.parent {
            Some(parent) => parent.get_editable_node(key, has_value),
            None => Err(TrieError::NotFound),
        }
    }

    fn fetch_value(&self, key: &Key) -> Result<Option<Vec<u8>>, TrieError> {
        for supplied in [self.temp_values.get(key), self.perm_values.get(key)] {
            if let Some(value) = supplied {
                return Ok(value.clone());
            }
        }
        match self.parent {
            Some(parent) => parent.get_value_by_key(key),
            None => Err(TrieError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Config, LayerDb};
    use crate::store::MemStore;

    fn stateful_root(kvs: &[(&[u8], &[u8])]) -> Digest {
        let db = LayerDb::new(MemStore::new(BranchFactor::Sixteen), Config::default()).unwrap();
        let view = db
            .new_view(crate::changes::ViewChanges::from_batch(
                kvs.iter().map(|(k, v)| (k.to_vec(), Some(v.to_vec()))),
            ))
            .unwrap();
        view.merkle_root().unwrap()
    }

    #[test]
    fn matches_the_stateful_root() {
        let kvs: &[(&[u8], &[u8])] = &[
            (b"abc", b"1"),
            (b"abd", b"2"),
            (b"x", b"3"),
            (b"", b"root"),
        ];
        let view = StatelessView::new_base(BranchFactor::Sixteen);
        for (k, v) in kvs {
            view.insert(k, v).unwrap();
        }
        assert_eq!(view.get_merkle_root().unwrap(), stateful_root(kvs));
    }

    #[test]
    fn repeated_mutation_cycles_recalculate() {
        let view = StatelessView::new_base(BranchFactor::Sixteen);
        view.insert(b"a", b"1").unwrap();
        view.insert(b"b", b"2").unwrap();
        let first = view.get_merkle_root().unwrap();

        view.remove(b"b").unwrap();
        let second = view.get_merkle_root().unwrap();
        assert_ne!(first, second);
        assert_eq!(second, stateful_root(&[(b"a", b"1")]));

        view.insert(b"b", b"2").unwrap();
        assert_eq!(view.get_merkle_root().unwrap(), first);
    }

    #[test]
    fn reads_resolve_through_injected_state() {
        let view = StatelessView::new_base(BranchFactor::Sixteen);
        let key = Key::from_bytes(b"k");
        assert_eq!(view.get_value(b"k"), Err(TrieError::NotFound));

        view.set_temporary_state([(key.clone(), Some(b"tmp".to_vec()))], []);
        assert_eq!(view.get_value(b"k").unwrap(), Some(b"tmp".to_vec()));

        // Temporary state wins over permanent state.
        view.add_permanent_state([(key.clone(), Some(b"perm".to_vec()))], []);
        assert_eq!(view.get_value(b"k").unwrap(), Some(b"tmp".to_vec()));

        view.set_temporary_state([], []);
        assert_eq!(view.get_value(b"k").unwrap(), Some(b"perm".to_vec()));

        // Pending changes win over everything.
        view.insert(b"k", b"own").unwrap();
        assert_eq!(view.get_value(b"k").unwrap(), Some(b"own".to_vec()));
    }

    #[test]
    fn child_views_read_through_and_set_base_detaches() {
        let base = StatelessView::new_base(BranchFactor::Sixteen);
        base.insert(b"a", b"1").unwrap();
        base.get_merkle_root().unwrap();

        let child = base.new_view();
        assert_eq!(child.get_value(b"a").unwrap(), Some(b"1".to_vec()));

        child.set_base();
        assert_eq!(child.get_value(b"a"), Err(TrieError::NotFound));
    }

    #[test]
    fn root_bytes_roundtrip() {
        let view = StatelessView::new_base(BranchFactor::Sixteen);
        view.insert(b"a", b"1").unwrap();
        let root_id = view.get_merkle_root().unwrap();

        let reopened =
            StatelessView::from_root_bytes(&view.root_bytes(), BranchFactor::Sixteen).unwrap();
        assert_eq!(reopened.get_merkle_root().unwrap(), root_id);
    }
}
