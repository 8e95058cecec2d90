//! The committed database: storage-backed trie state and view management.
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::apply::{self, NodeSource};
use crate::changes::{Change, ChangeSet, ViewChanges};
use crate::errors::TrieError;
use crate::key::{BranchFactor, Key};
use crate::node::{Digest, Node};
use crate::store::Storage;
use crate::view::{Parent, TrieView};

/// Database configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    /// Branching factor of the trie; fixes the token size of every key.
    pub branch_factor: BranchFactor,
}

/// A Merkle radix trie over a [`Storage`] backend.
///
/// The database itself is read-only; all writes go through views created
/// with [`LayerDb::new_view`] and reach storage when a view commits. A
/// process-wide lock serialises commits against each other.
pub struct LayerDb<S: Storage> {
    storage: S,
    token_size: usize,
    /// Back-reference to the `Arc` this database lives in; views hold it.
    self_ref: Weak<LayerDb<S>>,
    /// Serialises commits to `storage`.
    commit_lock: Mutex<()>,
    /// First-level views, tracked to invalidate them when a sibling commits.
    child_views: Mutex<Vec<Weak<TrieView<S>>>>,
}

impl<S: Storage> LayerDb<S> {
    /// Opens the database, writing an empty root node into a virgin store so
    /// the empty trie has a well-defined root hash.
    pub fn new(storage: S, config: Config) -> Result<Arc<Self>, TrieError> {
        match storage.root_node() {
            Ok(_) => {}
            Err(TrieError::NotFound) => {
                let mut changes = ChangeSet::default();
                changes.nodes.insert(
                    Key::empty(),
                    Change {
                        before: None,
                        after: Some(Node::new()),
                    },
                );
                storage.commit(&changes)?;
            }
            Err(err) => return Err(err),
        }
        Ok(Arc::new_cyclic(|self_ref| Self {
            storage,
            token_size: config.branch_factor.token_size(),
            self_ref: self_ref.clone(),
            commit_lock: Mutex::new(()),
            child_views: Mutex::new(Vec::new()),
        }))
    }

    /// Direct access to the storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub(crate) fn token_size(&self) -> usize {
        self.token_size
    }

    /// The committed value for `key`, read by walking the trie.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        self.get_value_by_key(&Key::from_bytes(key))
    }

    pub(crate) fn get_value_by_key(&self, key: &Key) -> Result<Option<Vec<u8>>, TrieError> {
        let changes = ChangeSet::default();
        let path = apply::visit_path(&changes, &DbSource(self), key)?;
        let (found_key, node) = path.last().expect("path starts at the root");
        if found_key == key {
            Ok(node.value().map(<[u8]>::to_vec))
        } else {
            Ok(None)
        }
    }

    /// A clone of the committed node at `key`, for a view to edit.
    pub(crate) fn get_editable_node(&self, key: &Key, has_value: bool) -> Result<Node, TrieError> {
        if key.is_empty() {
            self.storage.root_node()
        } else {
            self.storage.get_node(key, has_value)
        }
    }

    /// Merkle ID of the committed root.
    pub fn root_id(&self) -> Result<Digest, TrieError> {
        let root = self.storage.root_node()?;
        Ok(root.calculate_id(&Key::empty(), self.token_size))
    }

    /// Creates a view of the committed state with `changes` staged on top.
    pub fn new_view(&self, changes: ViewChanges) -> Result<Arc<TrieView<S>>, TrieError> {
        let db = self.self_ref.upgrade().expect("database is referenced");
        let view = TrieView::new(db, Parent::Db, changes)?;
        self.child_views.lock().push(Arc::downgrade(&view));
        Ok(view)
    }

    pub(crate) fn hold_commit_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.commit_lock.lock();
        f()
    }

    /// Applies a fully calculated first-level view to storage. Every other
    /// first-level view (and its descendants) becomes invalid; the committed
    /// view's children are re-parented onto the database.
    pub(crate) fn commit_view(&self, view: &Arc<TrieView<S>>) -> Result<(), TrieError> {
        if view.is_invalid() {
            return Err(TrieError::Invalid);
        }
        if !view.parent_is_db() {
            return Err(TrieError::ParentNotDatabase);
        }

        self.invalidate_children_except(view);
        let moved = view.take_children();
        for child in &moved {
            if let Some(child) = child.upgrade() {
                child.set_parent_db();
            }
        }
        self.child_views.lock().extend(moved);

        view.with_changes(|changes| {
            debug!(
                nodes = changes.nodes.len(),
                values = changes.values.len(),
                root = ?changes.root_id,
                "committing view to storage"
            );
            self.storage.commit(changes)
        })
    }

    fn invalidate_children_except(&self, except: &Arc<TrieView<S>>) {
        let mut children = self.child_views.lock();
        children.retain(|weak| match weak.upgrade() {
            Some(child) => {
                if Arc::ptr_eq(&child, except) {
                    true
                } else {
                    child.invalidate();
                    false
                }
            }
            None => false,
        });
    }
}

/// [`NodeSource`] of first-level views: committed storage.
pub(crate) struct DbSource<'a, S: Storage>(pub &'a LayerDb<S>);

impl<S: Storage> NodeSource for DbSource<'_, S> {
    fn token_size(&self) -> usize {
        self.0.token_size
    }

    fn fetch_node(&self, key: &Key, has_value: bool) -> Result<Node, TrieError> {
        self.0.get_editable_node(key, has_value)
    }

    fn fetch_value(&self, key: &Key) -> Result<Option<Vec<u8>>, TrieError> {
        self.0.get_value_by_key(key)
    }
}
