//! Storage contract and the in-memory reference backend.
//!
//! [`MemStore`] is **not** the trie itself — it is only the key-value backend
//! the trie persists into, and doubles as the reference implementation of the
//! [`Storage`] trait for tests and development. Production deployments plug
//! in a database-backed implementation instead.
use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::changes::ChangeSet;
use crate::codec;
use crate::errors::TrieError;
use crate::key::{BranchFactor, Key};
use crate::node::Node;

/// The contract between the committed database and its backend.
///
/// A backend stores encoded trie nodes addressed by key and applies a view's
/// change set as one atomic batch. Commits are already serialised by the
/// database's commit lock; implementations only need interior mutability.
pub trait Storage: Send + Sync + 'static {
    /// The node at `key`; `Err(NotFound)` when absent. `has_value` hints
    /// whether the node carries a value, which selects the sub-store in
    /// backends that split the two.
    fn get_node(&self, key: &Key, has_value: bool) -> Result<Node, TrieError>;

    /// The root node; `Err(NotFound)` on a virgin store.
    fn root_node(&self) -> Result<Node, TrieError>;

    /// Applies both the node batch and the value batch of `changes`
    /// atomically.
    fn commit(&self, changes: &ChangeSet) -> Result<(), TrieError>;
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Nodes that carry a value, keyed by trie key, in storage encoding.
    value_nodes: BTreeMap<Key, Vec<u8>>,
    /// Value-less intermediate nodes.
    intermediate_nodes: BTreeMap<Key, Vec<u8>>,
    /// The flat key-value image of the committed state.
    values: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// In-memory [`Storage`] backend over `RwLock`ed B-tree maps.
///
/// Nodes are held in their wire encoding so every read exercises the codec
/// path a persistent backend would use.
#[derive(Debug)]
pub struct MemStore {
    branch_factor: BranchFactor,
    inner: RwLock<StoreInner>,
}

impl MemStore {
    pub fn new(branch_factor: BranchFactor) -> Self {
        Self {
            branch_factor,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// The committed flat value for `key`, straight from the value batch.
    pub fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().values.get(key).cloned()
    }

    /// Number of stored nodes across both sub-stores.
    pub fn node_count(&self) -> usize {
        let inner = self.inner.read();
        inner.value_nodes.len() + inner.intermediate_nodes.len()
    }
}

impl Storage for MemStore {
    fn get_node(&self, key: &Key, has_value: bool) -> Result<Node, TrieError> {
        let inner = self.inner.read();
        let store = if has_value {
            &inner.value_nodes
        } else {
            &inner.intermediate_nodes
        };
        let bytes = store.get(key).ok_or(TrieError::NotFound)?;
        codec::decode_node(bytes, self.branch_factor.token_size())
    }

    fn root_node(&self) -> Result<Node, TrieError> {
        let inner = self.inner.read();
        let root = Key::empty();
        let bytes = inner
            .intermediate_nodes
            .get(&root)
            .or_else(|| inner.value_nodes.get(&root))
            .ok_or(TrieError::NotFound)?;
        codec::decode_node(bytes, self.branch_factor.token_size())
    }

    fn commit(&self, changes: &ChangeSet) -> Result<(), TrieError> {
        let ts = self.branch_factor.token_size();
        let mut inner = self.inner.write();
        for (key, change) in &changes.nodes {
            // A node can migrate between sub-stores when its has-value flag
            // flips, so clear both before re-inserting.
            inner.value_nodes.remove(key);
            inner.intermediate_nodes.remove(key);
            if let Some(node) = &change.after {
                let encoded = codec::encode_node(node, ts);
                if node.has_value() {
                    inner.value_nodes.insert(key.clone(), encoded);
                } else {
                    inner.intermediate_nodes.insert(key.clone(), encoded);
                }
            }
        }
        for (key, change) in &changes.values {
            debug_assert!(!key.has_partial_byte());
            match &change.after {
                Some(value) => {
                    inner.values.insert(key.as_bytes().to_vec(), value.clone());
                }
                None => {
                    inner.values.remove(key.as_bytes());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::Change;
    use crate::node::{sha256, Child, Digest};

    fn node_change(node: Node) -> Change<Option<Node>> {
        Change {
            before: None,
            after: Some(node),
        }
    }

    #[test]
    fn virgin_store_has_no_root() {
        let store = MemStore::new(BranchFactor::Sixteen);
        assert_eq!(store.root_node(), Err(TrieError::NotFound));
        assert_eq!(
            store.get_node(&Key::from_bytes(b"a"), true),
            Err(TrieError::NotFound)
        );
    }

    #[test]
    fn commit_roundtrips_nodes_through_the_codec() {
        let store = MemStore::new(BranchFactor::Sixteen);
        let mut root = Node::new();
        root.set_child(
            0x6,
            Some(Child {
                compressed_key: Key::from_bytes(b"b").skip(4),
                id: sha256(b"child"),
                has_value: true,
            }),
        );
        let mut leaf = Node::new();
        leaf.set_value(Some(b"v".to_vec()));

        let mut changes = ChangeSet::default();
        changes.nodes.insert(Key::empty(), node_change(root.clone()));
        changes
            .nodes
            .insert(Key::from_bytes(b"ab"), node_change(leaf.clone()));
        store.commit(&changes).unwrap();

        assert_eq!(store.root_node().unwrap(), root);
        assert_eq!(store.get_node(&Key::from_bytes(b"ab"), true).unwrap(), leaf);
        // The has-value hint is authoritative: the leaf lives in the value
        // sub-store only.
        assert_eq!(
            store.get_node(&Key::from_bytes(b"ab"), false),
            Err(TrieError::NotFound)
        );
    }

    #[test]
    fn commit_moves_nodes_between_sub_stores() {
        let store = MemStore::new(BranchFactor::Sixteen);
        let key = Key::from_bytes(b"ab");
        let mut node = Node::new();
        node.set_value(Some(b"v".to_vec()));

        let mut changes = ChangeSet::default();
        changes.nodes.insert(key.clone(), node_change(node.clone()));
        store.commit(&changes).unwrap();

        node.set_value(None);
        node.set_child(
            0x1,
            Some(Child {
                compressed_key: Key::empty(),
                id: Digest::ZERO,
                has_value: false,
            }),
        );
        let mut changes = ChangeSet::default();
        changes.nodes.insert(key.clone(), node_change(node.clone()));
        store.commit(&changes).unwrap();

        assert_eq!(store.get_node(&key, false).unwrap(), node);
        assert_eq!(store.get_node(&key, true), Err(TrieError::NotFound));
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn commit_applies_value_batch() {
        let store = MemStore::new(BranchFactor::Sixteen);
        let mut changes = ChangeSet::default();
        changes.values.insert(
            Key::from_bytes(b"k"),
            Change {
                before: None,
                after: Some(b"v".to_vec()),
            },
        );
        store.commit(&changes).unwrap();
        assert_eq!(store.value(b"k"), Some(b"v".to_vec()));

        let mut changes = ChangeSet::default();
        changes.values.insert(
            Key::from_bytes(b"k"),
            Change {
                before: Some(b"v".to_vec()),
                after: None,
            },
        );
        store.commit(&changes).unwrap();
        assert_eq!(store.value(b"k"), None);
    }

    #[test]
    fn deletion_removes_node() {
        let store = MemStore::new(BranchFactor::Sixteen);
        let key = Key::from_bytes(b"ab");
        let mut changes = ChangeSet::default();
        changes.nodes.insert(key.clone(), node_change(Node::new()));
        store.commit(&changes).unwrap();
        assert_eq!(store.node_count(), 1);

        let mut changes = ChangeSet::default();
        changes.nodes.insert(
            key.clone(),
            Change {
                before: Some(Node::new()),
                after: None,
            },
        );
        store.commit(&changes).unwrap();
        assert_eq!(store.node_count(), 0);
    }
}
