//! Copy-on-write views over a parent trie.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::apply::{self, NodeSource};
use crate::changes::{ChangeSet, ViewChanges};
use crate::db::LayerDb;
use crate::errors::TrieError;
use crate::key::Key;
use crate::node::{Digest, Node};
use crate::proof::{self, Proof, RangeProof};
use crate::store::Storage;

/// What a view reads through when its own changes miss.
pub(crate) enum Parent<S: Storage> {
    /// The committed database.
    Db,
    /// An uncommitted ancestor view.
    View(Arc<TrieView<S>>),
}

impl<S: Storage> Clone for Parent<S> {
    fn clone(&self) -> Self {
        match self {
            Parent::Db => Parent::Db,
            Parent::View(view) => Parent::View(view.clone()),
        }
    }
}

/// Validity tracking: `invalidated`, the parent link, and the child list.
///
/// The lock around this struct may be taken for a descendant while holding
/// it for an ancestor, never the other way around.
struct Validity<S: Storage> {
    invalidated: bool,
    parent: Parent<S>,
    children: Vec<Weak<TrieView<S>>>,
}

/// An in-memory overlay staging mutations on top of a parent trie.
///
/// A view is built from a batch of writes and records them as value changes
/// only. The first operation that needs node-level data — the Merkle root, a
/// proof, or a commit — materialises the structural changes exactly once;
/// concurrent callers wait on the same computation. Views stack: child views
/// read through their parent, and any mutation of an ancestor (including its
/// commit) invalidates every descendant first.
pub struct TrieView<S: Storage> {
    db: Arc<LayerDb<S>>,
    /// Back-reference to the `Arc` this view lives in, for parent links and
    /// child tracking.
    self_ref: Weak<TrieView<S>>,
    /// Guards the committed flag and serialises commit against view
    /// creation.
    committed: RwLock<bool>,
    /// Set once the node changes have been calculated; the view is frozen
    /// from then on.
    nodes_calculated: AtomicBool,
    /// One-shot guard around materialisation; stores its outcome.
    materialise_once: OnceCell<Result<(), TrieError>>,
    validity: RwLock<Validity<S>>,
    changes: RwLock<ChangeSet>,
    /// Clone of the parent's root node, taken at construction.
    root: Node,
}

impl<S: Storage> TrieView<S> {
    /// Builds a view over `parent` and records `ops` as value changes.
    pub(crate) fn new(
        db: Arc<LayerDb<S>>,
        parent: Parent<S>,
        ops: ViewChanges,
    ) -> Result<Arc<Self>, TrieError> {
        let source = ParentSource {
            db: db.clone(),
            parent: parent.clone(),
        };
        let root = match source.fetch_node(&Key::empty(), false) {
            Ok(root) => root,
            Err(TrieError::NotFound) => return Err(TrieError::NoValidRoot),
            Err(err) => return Err(err),
        };

        let mut changes = ChangeSet::with_capacity(ops.len());
        for op in ops.batch_ops {
            apply::record_value_change(&mut changes, &source, Key::from_bytes(&op.key), op.value)?;
        }
        for (key, value) in ops.map_ops {
            apply::record_value_change(&mut changes, &source, Key::from_bytes(&key), value)?;
        }

        Ok(Arc::new_cyclic(|self_ref| Self {
            db,
            self_ref: self_ref.clone(),
            committed: RwLock::new(false),
            nodes_calculated: AtomicBool::new(false),
            materialise_once: OnceCell::new(),
            validity: RwLock::new(Validity {
                invalidated: false,
                parent,
                children: Vec::new(),
            }),
            changes: RwLock::new(changes),
            root,
        }))
    }

    /// The `Arc` this view lives in. Callable only from a live reference, so
    /// the upgrade cannot fail.
    fn strong(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("view is referenced")
    }

    /// The value for `key` as seen by this view, or `None` when absent.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        self.get_value_by_key(&Key::from_bytes(key))
    }

    /// Positional fan-out of [`get_value`](Self::get_value); one failed key
    /// does not fail the batch.
    pub fn get_values<K: AsRef<[u8]>>(
        &self,
        keys: &[K],
    ) -> Vec<Result<Option<Vec<u8>>, TrieError>> {
        keys.iter().map(|key| self.get_value(key.as_ref())).collect()
    }

    pub(crate) fn get_value_by_key(&self, key: &Key) -> Result<Option<Vec<u8>>, TrieError> {
        if self.is_invalid() {
            return Err(TrieError::Invalid);
        }
        if let Some(change) = self.changes.read().values.get(key) {
            return Ok(change.after.clone());
        }
        let value = self.parent_source().fetch_value(key)?;
        // An ancestor mutation may have raced the read above; the value is
        // only trustworthy if the view is still valid now.
        if self.is_invalid() {
            return Err(TrieError::Invalid);
        }
        Ok(value)
    }

    /// A clone of this view's node at `key`, for a child view to edit.
    pub(crate) fn get_editable_node(&self, key: &Key, has_value: bool) -> Result<Node, TrieError> {
        if self.is_invalid() {
            return Err(TrieError::Invalid);
        }
        let cached = self.changes.read().nodes.get(key).map(|c| c.after.clone());
        let node = match cached {
            Some(Some(node)) => node,
            Some(None) => return Err(TrieError::NotFound),
            None => self.parent_source().fetch_node(key, has_value)?,
        };
        if self.is_invalid() {
            return Err(TrieError::Invalid);
        }
        Ok(node)
    }

    /// The Merkle root of this view, materialising it if necessary.
    pub fn merkle_root(&self) -> Result<Digest, TrieError> {
        self.calculate_node_ids()?;
        self.changes.read().root_id.ok_or(TrieError::NoValidRoot)
    }

    /// Runs structural materialisation exactly once and caches the outcome.
    fn calculate_node_ids(&self) -> Result<(), TrieError> {
        self.materialise_once
            .get_or_init(|| {
                if self.is_invalid() {
                    return Err(TrieError::Invalid);
                }
                let result = self.materialise();
                self.nodes_calculated.store(true, Ordering::Release);
                result?;
                // Ancestor changes during materialisation invalidate the
                // result.
                if self.is_invalid() {
                    return Err(TrieError::Invalid);
                }
                Ok(())
            })
            .clone()
    }

    fn materialise(&self) -> Result<(), TrieError> {
        if self.nodes_calculated.load(Ordering::Acquire) {
            return Err(TrieError::NodesAlreadyCalculated);
        }
        let source = self.parent_source();
        let mut changes = self.changes.write();
        apply::apply_value_changes(&mut changes, &source)?;
        let root_id = apply::compute_root_id(&mut changes, &source, &self.root)?;
        debug!(
            root = %root_id,
            values = changes.values.len(),
            nodes = changes.nodes.len(),
            "materialised view"
        );
        Ok(())
    }

    /// An inclusion or exclusion proof for `key` against this view's root.
    pub fn get_proof(&self, key: &[u8]) -> Result<Proof, TrieError> {
        self.calculate_node_ids()?;
        let changes = self.changes.read();
        let proof = proof::build_proof(&changes, &self.parent_source(), key)?;
        if self.is_invalid() {
            return Err(TrieError::Invalid);
        }
        Ok(proof)
    }

    /// A proof for (a bounded slice of) the key range `[start, end]`, with at
    /// most `max_length` key-value pairs.
    pub fn get_range_proof(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_length: usize,
    ) -> Result<RangeProof, TrieError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(TrieError::StartAfterEnd);
            }
        }
        if max_length == 0 {
            return Err(TrieError::InvalidMaxLength);
        }
        self.calculate_node_ids()?;
        let changes = self.changes.read();
        let source = self.parent_source();

        let key_values = apply::collect_range(&changes, &source, start, end, max_length)?;

        // The proof may not cover all of [start, end]; the end proof is for
        // the last pair actually included.
        let mut end_proof = match (key_values.last(), end) {
            (Some(last), _) => proof::build_proof(&changes, &source, &last.key)?.path,
            (None, Some(end)) => proof::build_proof(&changes, &source, end)?.path,
            (None, None) => Vec::new(),
        };

        let mut start_proof = Vec::new();
        if let Some(start) = start {
            start_proof = proof::build_proof(&changes, &source, start)?.path;
            // Nodes shared with the end proof carry no extra information.
            let shared = start_proof
                .iter()
                .zip(&end_proof)
                .take_while(|(a, b)| a.key == b.key)
                .count();
            start_proof.drain(..shared);
        }

        if key_values.is_empty() && start_proof.is_empty() && end_proof.is_empty() {
            end_proof = proof::build_proof(&changes, &source, &[])?.path;
        }

        if self.is_invalid() {
            return Err(TrieError::Invalid);
        }
        Ok(RangeProof {
            key_values,
            start_proof,
            end_proof,
        })
    }

    /// Creates a view stacked on top of this one. When this view is already
    /// committed the request is forwarded to its parent's successor.
    pub fn new_view(&self, ops: ViewChanges) -> Result<Arc<TrieView<S>>, TrieError> {
        if self.is_invalid() {
            return Err(TrieError::Invalid);
        }
        {
            let committed = self.committed.read();
            if *committed {
                drop(committed);
                return match self.parent() {
                    Parent::Db => self.db.new_view(ops),
                    Parent::View(parent) => parent.new_view(ops),
                };
            }
            // The child clones this view's materialised root, so the IDs
            // must be final before construction.
            self.calculate_node_ids()?;
        }

        let child = TrieView::new(self.db.clone(), Parent::View(self.strong()), ops)?;
        let mut validity = self.validity.write();
        if validity.invalidated {
            return Err(TrieError::Invalid);
        }
        validity.children.push(Arc::downgrade(&child));
        Ok(child)
    }

    /// Commits this view, flushing its changes into its parent layer by
    /// layer until the database applies them as one atomic batch.
    pub fn commit_to_db(&self) -> Result<(), TrieError> {
        let db = self.db.clone();
        db.hold_commit_lock(|| self.commit_to_db_locked())
    }

    fn commit_to_db_locked(&self) -> Result<(), TrieError> {
        match self.parent() {
            Parent::Db => {
                let mut committed = self.committed.write();
                if *committed {
                    return Err(TrieError::Committed);
                }
                if self.is_invalid() {
                    return Err(TrieError::Invalid);
                }
                self.calculate_node_ids()?;
                self.db.commit_view(&self.strong())?;
                *committed = true;
                Ok(())
            }
            Parent::View(parent) => {
                self.commit_to_parent_locked(&parent)?;
                parent.commit_to_db_locked()
            }
        }
    }

    /// Flushes this view's change set into `parent`, invalidating the
    /// parent's other descendants first.
    fn commit_to_parent_locked(&self, parent: &Arc<TrieView<S>>) -> Result<(), TrieError> {
        let mut committed = self.committed.write();
        if *committed {
            return Err(TrieError::Committed);
        }
        if self.is_invalid() {
            return Err(TrieError::Invalid);
        }
        self.calculate_node_ids()?;
        parent.absorb_changes(&self.strong())?;
        *committed = true;
        Ok(())
    }

    /// Merges a committing child's changes into this view's change set.
    fn absorb_changes(&self, child: &Arc<TrieView<S>>) -> Result<(), TrieError> {
        if self.is_invalid() {
            return Err(TrieError::Invalid);
        }
        if *self.committed.read() {
            return Err(TrieError::Committed);
        }
        // The child was built on this view's current state; every other
        // descendant is about to observe a state it was not built on.
        self.invalidate_children_except(child);
        self.calculate_node_ids()?;

        let child_changes = child.changes.read();
        let mut changes = self.changes.write();
        changes.merge_from(&child_changes);
        debug!(
            nodes = changes.nodes.len(),
            values = changes.values.len(),
            "absorbed committed child view"
        );
        Ok(())
    }

    /// Marks this view and every descendant invalid.
    pub(crate) fn invalidate(&self) {
        let mut validity = self.validity.write();
        validity.invalidated = true;
        trace!("view invalidated");
        // Invalidated children no longer need tracking.
        for child in validity.children.drain(..) {
            if let Some(child) = child.upgrade() {
                child.invalidate();
            }
        }
    }

    fn invalidate_children_except(&self, except: &Arc<TrieView<S>>) {
        let mut validity = self.validity.write();
        validity.children.retain(|weak| match weak.upgrade() {
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

    /// True once an ancestor change has made this view unusable.
    pub fn is_invalid(&self) -> bool {
        self.validity.read().invalidated
    }

    fn parent(&self) -> Parent<S> {
        self.validity.read().parent.clone()
    }

    fn parent_source(&self) -> ParentSource<S> {
        ParentSource {
            db: self.db.clone(),
            parent: self.parent(),
        }
    }

    pub(crate) fn parent_is_db(&self) -> bool {
        matches!(self.validity.read().parent, Parent::Db)
    }

    pub(crate) fn set_parent_db(&self) {
        self.validity.write().parent = Parent::Db;
    }

    pub(crate) fn take_children(&self) -> Vec<Weak<TrieView<S>>> {
        std::mem::take(&mut self.validity.write().children)
    }

    pub(crate) fn with_changes<R>(&self, f: impl FnOnce(&ChangeSet) -> R) -> R {
        f(&self.changes.read())
    }
}

/// [`NodeSource`] of a view: its parent trie, database or view.
struct ParentSource<S: Storage> {
    db: Arc<LayerDb<S>>,
    parent: Parent<S>,
}

impl<S: Storage> NodeSource for ParentSource<S> {
    fn token_size(&self) -> usize {
        self.db.token_size()
    }

    fn fetch_node(&self, key: &Key, has_value: bool) -> Result<Node, TrieError> {
        match &self.parent {
            Parent::Db => self.db.get_editable_node(key, has_value),
            Parent::View(view) => view.get_editable_node(key, has_value),
        }
    }

    fn fetch_value(&self, key: &Key) -> Result<Option<Vec<u8>>, TrieError> {
        match &self.parent {
            Parent::Db => self.db.get_value_by_key(key),
            Parent::View(view) => view.get_value_by_key(key),
        }
    }
}
