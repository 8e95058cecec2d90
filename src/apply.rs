//! Structural trie algorithms shared by the stateful and stateless views.
//!
//! A view defers all structural work: mutations are recorded as value
//! changes, and only when node-level data is needed are the final values
//! replayed through [`insert`]/[`remove`] and the affected Merkle IDs
//! recomputed. Both view kinds drive these functions with their own
//! [`NodeSource`], the seam through which parent-side state is fetched.
use parking_lot::Mutex;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::changes::{Change, ChangeSet};
use crate::errors::TrieError;
use crate::key::Key;
use crate::node::{Child, Digest, Node};
use crate::proof::KeyValue;

/// Parent-side state access for the structural algorithms.
///
/// Implementations answer from the parent trie chain (stateful views), from
/// injected temporary/permanent maps (stateless views), or from committed
/// storage (the database itself). The view's own pending changes are always
/// consulted before the source.
pub(crate) trait NodeSource: Sync {
    fn token_size(&self) -> usize;

    /// Fetches a clone of the node at `key`; `Err(NotFound)` when absent.
    /// `has_value` hints which backing store holds the node.
    fn fetch_node(&self, key: &Key, has_value: bool) -> Result<Node, TrieError>;

    /// Fetches the value at `key`; `Err(NotFound)` when the source cannot
    /// answer at all.
    fn fetch_value(&self, key: &Key) -> Result<Option<Vec<u8>>, TrieError>;
}

/// The node at `key`: pending changes first, then the source.
pub(crate) fn get_node(
    changes: &ChangeSet,
    source: &dyn NodeSource,
    key: &Key,
    has_value: bool,
) -> Result<Node, TrieError> {
    if let Some(change) = changes.nodes.get(key) {
        return change.after.clone().ok_or(TrieError::NotFound);
    }
    source.fetch_node(key, has_value)
}

/// Records a value write, capturing the parent-side value on first touch.
pub(crate) fn record_value_change(
    changes: &mut ChangeSet,
    source: &dyn NodeSource,
    key: Key,
    after: Option<Vec<u8>>,
) -> Result<(), TrieError> {
    if key.has_partial_byte() && after.is_some() {
        return Err(TrieError::PartialByteLengthWithValue);
    }
    if let Some(existing) = changes.values.get_mut(&key) {
        existing.after = after;
        return Ok(());
    }
    let before = match source.fetch_value(&key) {
        Ok(value) => value,
        Err(TrieError::NotFound) => None,
        Err(err) => return Err(err),
    };
    changes.values.insert(key, Change { before, after });
    Ok(())
}

/// Records the current state of an existing node, capturing the parent-side
/// node on first touch.
fn record_node_change(
    changes: &mut ChangeSet,
    source: &dyn NodeSource,
    key: Key,
    after: Node,
) -> Result<(), TrieError> {
    record_key_change(changes, source, key, Some(after))
}

/// Records a node created inside this view; no parent lookup is attempted.
fn record_new_node(changes: &mut ChangeSet, key: Key, after: Node) {
    match changes.nodes.get_mut(&key) {
        Some(existing) => existing.after = Some(after),
        None => {
            changes.nodes.insert(
                key,
                Change {
                    before: None,
                    after: Some(after),
                },
            );
        }
    }
}

/// Records a node deletion. The root is never deleted; it is recorded as
/// changed instead.
fn record_node_deleted(
    changes: &mut ChangeSet,
    source: &dyn NodeSource,
    key: Key,
    node: Node,
) -> Result<(), TrieError> {
    if key.is_empty() {
        return record_key_change(changes, source, key, Some(node));
    }
    record_key_change(changes, source, key, None)
}

fn record_key_change(
    changes: &mut ChangeSet,
    source: &dyn NodeSource,
    key: Key,
    after: Option<Node>,
) -> Result<(), TrieError> {
    if let Some(existing) = changes.nodes.get_mut(&key) {
        existing.after = after;
        return Ok(());
    }
    let before_value = match source.fetch_value(&key) {
        Ok(value) => value,
        Err(TrieError::NotFound) => None,
        Err(err) => return Err(err),
    };
    let before = match source.fetch_node(&key, before_value.is_some()) {
        Ok(node) => Some(node),
        Err(TrieError::NotFound) => None,
        Err(err) => return Err(err),
    };
    changes.nodes.insert(key, Change { before, after });
    Ok(())
}

/// Walks from the root toward `key`, returning every node on the path.
///
/// The last entry is the node at `key` when it exists, otherwise the node
/// with the longest matching prefix. A child edge whose compressed key is
/// longer than the remaining key is treated as no match.
pub(crate) fn visit_path(
    changes: &ChangeSet,
    source: &dyn NodeSource,
    key: &Key,
) -> Result<Vec<(Key, Node)>, TrieError> {
    let ts = source.token_size();
    let root = get_node(changes, source, &Key::empty(), false)?;
    let mut path = vec![(Key::empty(), root)];
    loop {
        let (current_key, current_node) = path.last().expect("path starts at the root");
        if current_key.bit_len() >= key.bit_len() {
            return Ok(path);
        }
        let token = key.token(current_key.bit_len(), ts);
        let Some(entry) = current_node.children().get(&token) else {
            return Ok(path);
        };
        if !key.iterated_has_prefix(&entry.compressed_key, current_key.bit_len() + ts, ts) {
            return Ok(path);
        }
        let next_key = key.take(current_key.bit_len() + ts + entry.compressed_key.bit_len());
        let has_value = entry.has_value;
        let node = get_node(changes, source, &next_key, has_value)?;
        path.push((next_key, node));
    }
}

/// Token-wise common prefix length (in bits) of `first` and
/// `second[second_offset..]`.
fn common_prefix_len(first: &Key, second: &Key, second_offset: usize, ts: usize) -> usize {
    let mut common = 0;
    while common < first.bit_len()
        && common + second_offset < second.bit_len()
        && first.token(common, ts) == second.token(common + second_offset, ts)
    {
        common += ts;
    }
    common
}

/// Inserts `value` at `key`, creating a leaf or splitting an edge into a
/// branch as needed. A `None` value still materialises the node; proof
/// reconstruction uses this to build value-less path nodes.
pub(crate) fn insert(
    changes: &mut ChangeSet,
    source: &dyn NodeSource,
    key: &Key,
    value: Option<Vec<u8>>,
) -> Result<(), TrieError> {
    let ts = source.token_size();
    record_value_change(changes, source, key.clone(), value.clone())?;

    let path = visit_path(changes, source, key)?;
    for (k, n) in &path[..path.len() - 1] {
        record_node_change(changes, source, k.clone(), n.clone())?;
    }
    let (closest_key, closest) = path.last().expect("path starts at the root");
    let closest_key = closest_key.clone();
    let mut closest = closest.clone();

    // A node with exactly this key already exists; update its value.
    if closest_key == *key {
        closest.set_value(value);
        return record_node_change(changes, source, closest_key, closest);
    }

    let token = key.token(closest_key.bit_len(), ts);
    let Some(existing) = closest.children().get(&token).cloned() else {
        // No edge shares the next token: hang a fresh leaf off the closest
        // node.
        let mut leaf = Node::new();
        leaf.set_value(value);
        closest.set_child(
            token,
            Some(Child {
                compressed_key: key.skip(closest_key.bit_len() + ts),
                id: Digest::ZERO,
                has_value: false,
            }),
        );
        record_new_node(changes, key.clone(), leaf);
        return record_node_change(changes, source, closest_key, closest);
    };

    // The edge at `token` shares a prefix with the remaining key: split it
    // with a branch node at the end of the common prefix.
    let prefix_len = common_prefix_len(&existing.compressed_key, key, closest_key.bit_len() + ts, ts);
    if existing.compressed_key.bit_len() <= prefix_len {
        // The whole edge matched, so the walk should have descended into it.
        return Err(TrieError::GetPathToFailure);
    }

    let branch_key = key.take(closest_key.bit_len() + ts + prefix_len);
    let mut branch = Node::new();
    closest.set_child(
        token,
        Some(Child {
            compressed_key: branch_key.skip(closest_key.bit_len() + ts),
            id: Digest::ZERO,
            has_value: false,
        }),
    );

    if key.bit_len() == branch_key.bit_len() {
        branch.set_value(value);
    } else {
        let mut leaf = Node::new();
        leaf.set_value(value);
        branch.set_child(
            key.token(branch_key.bit_len(), ts),
            Some(Child {
                compressed_key: key.skip(branch_key.bit_len() + ts),
                id: Digest::ZERO,
                has_value: false,
            }),
        );
        record_new_node(changes, key.clone(), leaf);
    }

    // Re-attach the displaced edge below the branch, keeping its ID.
    branch.set_child(
        existing.compressed_key.token(prefix_len, ts),
        Some(Child {
            compressed_key: existing.compressed_key.skip(prefix_len + ts),
            id: existing.id,
            has_value: existing.has_value,
        }),
    );
    record_new_node(changes, branch_key, branch);
    record_node_change(changes, source, closest_key, closest)
}

/// Removes the value at `key`, deleting the node when it has no children and
/// compressing the path locally afterwards.
pub(crate) fn remove(
    changes: &mut ChangeSet,
    source: &dyn NodeSource,
    key: &Key,
) -> Result<(), TrieError> {
    let ts = source.token_size();
    record_value_change(changes, source, key.clone(), None)?;

    let mut path = visit_path(changes, source, key)?;
    for (k, n) in &path {
        record_node_change(changes, source, k.clone(), n.clone())?;
    }
    let (target_key, mut target) = path.pop().expect("path starts at the root");
    if target_key != *key || !target.has_value() {
        return Ok(());
    }

    target.set_value(None);
    if !target.children().is_empty() {
        record_node_change(changes, source, target_key.clone(), target.clone())?;
        let parent = path.pop();
        return compress_node_path(changes, source, parent, target_key, target);
    }

    record_node_deleted(changes, source, target_key.clone(), target)?;
    if let Some((parent_key, mut parent)) = path.pop() {
        parent.set_child(key.token(parent_key.bit_len(), ts), None);
        record_node_change(changes, source, parent_key.clone(), parent.clone())?;
        let grand_parent = path.pop();
        return compress_node_path(changes, source, grand_parent, parent_key, parent);
    }
    Ok(())
}

/// Collapses `node` into its parent's child entry when it has exactly one
/// child and no value. Local only: earlier compressions already maintain the
/// invariant above `node`, so no recursion is needed.
fn compress_node_path(
    changes: &mut ChangeSet,
    source: &dyn NodeSource,
    parent: Option<(Key, Node)>,
    node_key: Key,
    node: Node,
) -> Result<(), TrieError> {
    let ts = source.token_size();
    let Some((parent_key, mut parent)) = parent else {
        return Ok(());
    };
    if node.children().len() != 1 || node.has_value() {
        return Ok(());
    }

    let (token, entry) = node.children().iter().next().expect("exactly one child");
    let (token, entry) = (*token, entry.clone());
    record_node_deleted(changes, source, node_key.clone(), node)?;

    let child_key = node_key.extend_token(token, ts, &entry.compressed_key);
    parent.set_child(
        child_key.token(parent_key.bit_len(), ts),
        Some(Child {
            compressed_key: child_key.skip(parent_key.bit_len() + ts),
            id: entry.id,
            has_value: entry.has_value,
        }),
    );
    record_node_change(changes, source, parent_key, parent)
}

/// Replays the accumulated value changes onto the trie structure. Distinct
/// keys do not interact, so the map's iteration order is irrelevant.
pub(crate) fn apply_value_changes(
    changes: &mut ChangeSet,
    source: &dyn NodeSource,
) -> Result<(), TrieError> {
    let pending: Vec<(Key, Option<Vec<u8>>)> = changes
        .values
        .iter()
        .map(|(key, change)| (key.clone(), change.after.clone()))
        .collect();
    for (key, after) in pending {
        match after {
            Some(value) => insert(changes, source, &key, Some(value))?,
            None => remove(changes, source, &key)?,
        }
    }
    Ok(())
}

type NodeChanges = FxHashMap<Key, Change<Option<Node>>>;

/// Recomputes the Merkle IDs of every changed node, bottom-up, and returns
/// the new root ID. Parent child entries are refreshed with each changed
/// child's new ID and has-value flag.
pub(crate) fn compute_root_id(
    changes: &mut ChangeSet,
    source: &dyn NodeSource,
    fallback_root: &Node,
) -> Result<Digest, TrieError> {
    let ts = source.token_size();
    let root_changed = changes.nodes.contains_key(&Key::empty());
    let mut root = if root_changed {
        changes
            .nodes
            .get_mut(&Key::empty())
            .and_then(|change| change.after.take())
            .ok_or(TrieError::NoValidRoot)?
    } else {
        fallback_root.clone()
    };

    let nodes = Mutex::new(std::mem::take(&mut changes.nodes));
    let root_id = compute_ids(&Key::empty(), &mut root, &nodes, ts);
    changes.nodes = nodes.into_inner();
    if root_changed {
        changes
            .nodes
            .get_mut(&Key::empty())
            .expect("root change entry was taken from the map")
            .after = Some(root);
    }
    changes.root_id = Some(root_id);
    Ok(root_id)
}

/// Post-order ID recomputation of `node`'s changed descendants, fanned out
/// on the rayon pool. A recursion that cannot get a worker runs inline on
/// the caller.
fn compute_ids(key: &Key, node: &mut Node, nodes: &Mutex<NodeChanges>, ts: usize) -> Digest {
    let changed: Vec<(u8, Key)> = node
        .children()
        .iter()
        .filter_map(|(token, entry)| {
            let child_key = key.extend_token(*token, ts, &entry.compressed_key);
            nodes
                .lock()
                .get(&child_key)
                .is_some_and(|change| change.after.is_some())
                .then_some((*token, child_key))
        })
        .collect();

    let compute_child = |(token, child_key): &(u8, Key)| -> Option<(u8, Digest, bool)> {
        let mut child = nodes
            .lock()
            .get_mut(child_key)
            .and_then(|change| change.after.take())?;
        let id = compute_ids(child_key, &mut child, nodes, ts);
        let has_value = child.has_value();
        nodes
            .lock()
            .get_mut(child_key)
            .expect("child change entry was taken from the map")
            .after = Some(child);
        Some((*token, id, has_value))
    };

    // A single changed child is not worth a task handoff.
    let updated: Vec<Option<(u8, Digest, bool)>> = if changed.len() <= 1 {
        changed.iter().map(compute_child).collect()
    } else {
        changed.par_iter().map(compute_child).collect()
    };

    for (token, id, has_value) in updated.into_iter().flatten() {
        let entry = node.child_mut(token).expect("changed child has an entry");
        entry.id = id;
        entry.has_value = has_value;
    }
    node.calculate_id(key, ts)
}

/// True when the subtree under `prefix` can contain a byte key `>= start`.
fn subtree_reaches(prefix: &Key, start: &[u8]) -> bool {
    let full = prefix.bit_len() / 8;
    let rem = prefix.bit_len() % 8;
    for (i, &s) in start.iter().enumerate() {
        // Largest byte at position i over all keys extending `prefix`.
        let max = if i < full {
            prefix.as_bytes()[i]
        } else if i == full && rem != 0 {
            prefix.as_bytes()[i] | (0xFF >> rem)
        } else {
            0xFF
        };
        match max.cmp(&s) {
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Equal => {}
        }
    }
    true
}

/// True when every byte key in the subtree under `prefix` is `> end`.
fn subtree_beyond(prefix: &Key, end: &[u8]) -> bool {
    prefix.as_bytes() > end
}

/// In-order collection of up to `max` key-value pairs with byte keys in
/// `[start, end]`, walking the materialised trie.
pub(crate) fn collect_range(
    changes: &ChangeSet,
    source: &dyn NodeSource,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
    max: usize,
) -> Result<Vec<KeyValue>, TrieError> {
    let ts = source.token_size();
    let mut out = Vec::new();
    // Popping a descending-pushed stack yields keys in ascending order.
    let mut stack: Vec<(Key, bool)> = vec![(Key::empty(), false)];
    while let Some((key, has_value)) = stack.pop() {
        if out.len() >= max {
            break;
        }
        if end.is_some_and(|end| subtree_beyond(&key, end)) {
            break;
        }
        let node = get_node(changes, source, &key, has_value)?;
        if let Some(value) = node.value() {
            if !key.has_partial_byte() && start.is_none_or(|s| key.as_bytes() >= s) {
                out.push(KeyValue {
                    key: key.as_bytes().to_vec(),
                    value: value.to_vec(),
                });
            }
        }
        for (token, entry) in node.children().iter().rev() {
            let child_key = key.extend_token(*token, ts, &entry.compressed_key);
            if start.is_none_or(|s| subtree_reaches(&child_key, s)) {
                stack.push((child_key, entry.has_value));
            }
        }
    }
    Ok(out)
}
