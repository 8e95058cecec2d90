//! Inclusion, exclusion, and range proofs.
//!
//! Proofs are generated from a view's materialised trie and verified against
//! a root hash alone: the verifier rebuilds the proven boundary of the trie
//! in a [`StatelessView`], grafts the claimed IDs of everything outside it,
//! and compares the recomputed root.
use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::apply::{self, NodeSource};
use crate::changes::ChangeSet;
use crate::errors::TrieError;
use crate::key::{BranchFactor, Key};
use crate::node::{sha256, Digest, HASH_LEN};
use crate::stateless::StatelessView;

/// Why a proof failed to verify.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error("proof is empty")]
    Empty,
    #[error("proof node is not on the path to the proven key")]
    NodeOutsideKey,
    #[error("proof node keys are not strictly nested")]
    NonIncreasingPath,
    #[error("proof value does not match the claimed value or hash")]
    ValueMismatch,
    #[error("proof node carries a value missing from the key-value pairs")]
    UnincludedValue,
    #[error("key-value pairs are not in strictly increasing key order")]
    KeyValuesUnsorted,
    #[error("key-value pair lies outside the proven range")]
    KeyValueOutOfRange,
    #[error("range proof is missing its end proof")]
    MissingEndProof,
    #[error("reconstructed root {got} does not match expected root {want}")]
    RootMismatch { got: Digest, want: Digest },
    #[error(transparent)]
    Trie(#[from] TrieError),
}

/// One node of a proof path: the node's key, its children's IDs by token,
/// and its value (or the value's hash when the value is long).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    pub key: Key,
    pub children: BTreeMap<u8, Digest>,
    pub value_or_hash: Option<Vec<u8>>,
}

/// Proof that `key` maps to `value` — or, when `value` is `None`, that `key`
/// is absent — in the trie with a given root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    /// Nodes from the root toward `key`. When the walk stops short of `key`
    /// but a child exists at the diverging token, that child is appended so
    /// absence is provable.
    pub path: Vec<ProofNode>,
}

/// A proven key-value pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Proof for a contiguous slice of the key space.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProof {
    pub key_values: Vec<KeyValue>,
    pub start_proof: Vec<ProofNode>,
    pub end_proof: Vec<ProofNode>,
}

/// Builds the proof for `key_bytes` over a materialised change set.
pub(crate) fn build_proof(
    changes: &ChangeSet,
    source: &dyn NodeSource,
    key_bytes: &[u8],
) -> Result<Proof, TrieError> {
    let ts = source.token_size();
    let key = Key::from_bytes(key_bytes);

    let value = match changes.values.get(&key) {
        Some(change) => change.after.clone(),
        None => match source.fetch_value(&key) {
            Ok(value) => value,
            Err(TrieError::NotFound) => None,
            Err(err) => return Err(err),
        },
    };

    let path = apply::visit_path(changes, source, &key)?;
    let mut proof_path: Vec<ProofNode> = path
        .iter()
        .map(|(node_key, node)| node.as_proof_node(node_key))
        .collect();

    let (closest_key, closest) = path.last().expect("path starts at the root");
    if closest_key != &key {
        // No node with this exact key; include the diverging child, if any,
        // so the verifier can rule the key out.
        let token = key.token(closest_key.bit_len(), ts);
        if let Some(entry) = closest.children().get(&token) {
            let child_key = closest_key.extend_token(token, ts, &entry.compressed_key);
            let child = apply::get_node(changes, source, &child_key, entry.has_value)?;
            proof_path.push(child.as_proof_node(&child_key));
        }
    }

    Ok(Proof {
        key: key_bytes.to_vec(),
        value,
        path: proof_path,
    })
}

/// True when `value` is consistent with a proof node's `value_or_hash`.
fn value_or_hash_matches(value: Option<&[u8]>, value_or_hash: Option<&[u8]>) -> bool {
    match value {
        None => value_or_hash.is_none(),
        Some(value) if value.len() < HASH_LEN => value_or_hash == Some(value),
        Some(value) => value_or_hash.is_some_and(|digest| digest == &sha256(value)[..]),
    }
}

/// Structural checks on a proof path: no value at a partial-byte key, every
/// key a strict prefix of the next, and every key but the last a prefix of
/// the proven key.
fn verify_proof_path(path: &[ProofNode], proven_key: Option<&Key>) -> Result<(), ProofError> {
    for (i, node) in path.iter().enumerate() {
        if node.key.has_partial_byte() && node.value_or_hash.is_some() {
            return Err(TrieError::PartialByteLengthWithValue.into());
        }
        if i < path.len() - 1 {
            if let Some(proven) = proven_key {
                if !proven.has_prefix(&node.key) {
                    return Err(ProofError::NodeOutsideKey);
                }
            }
            if !path[i + 1].key.has_strict_prefix(&node.key) {
                return Err(ProofError::NonIncreasingPath);
            }
        }
    }
    Ok(())
}

impl Proof {
    /// Verifies this proof against `expected_root`: accepts iff the trie
    /// with that root maps `key` to `value` (or lacks `key` when `value` is
    /// `None`).
    pub fn verify(
        &self,
        expected_root: Digest,
        branch_factor: BranchFactor,
    ) -> Result<(), ProofError> {
        if self.path.is_empty() {
            return Err(ProofError::Empty);
        }
        let key = Key::from_bytes(&self.key);
        verify_proof_path(&self.path, Some(&key))?;

        let last = self.path.last().expect("path is not empty");
        if last.key == key
            && !value_or_hash_matches(self.value.as_deref(), last.value_or_hash.as_deref())
        {
            return Err(ProofError::ValueMismatch);
        }
        // A last node short of (or diverging from) the key is an exclusion
        // proof; it cannot claim a value.
        if last.key != key && self.value.is_some() {
            return Err(ProofError::ValueMismatch);
        }

        let view = StatelessView::new_base(branch_factor);
        let proven = &last.key;
        view.add_path_info(&self.path, Some(proven), Some(proven))?;
        let got = view.get_merkle_root()?;
        if got != expected_root {
            return Err(ProofError::RootMismatch {
                got,
                want: expected_root,
            });
        }
        Ok(())
    }
}

/// Key-value pairs must be strictly sorted and inside `[start, end]`.
fn verify_key_values(
    key_values: &[KeyValue],
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Result<(), ProofError> {
    for (i, kv) in key_values.iter().enumerate() {
        if i > 0 && key_values[i - 1].key >= kv.key {
            return Err(ProofError::KeyValuesUnsorted);
        }
        if start.is_some_and(|s| kv.key.as_slice() < s) || end.is_some_and(|e| kv.key.as_slice() > e)
        {
            return Err(ProofError::KeyValueOutOfRange);
        }
    }
    Ok(())
}

/// Every proof node with a whole-byte key inside `[smallest, largest]` must
/// agree with the supplied key-value pairs.
fn verify_range_values_present(
    path: &[ProofNode],
    smallest: Option<&Key>,
    largest: Option<&Key>,
    key_values: &FxHashMap<Key, Vec<u8>>,
) -> Result<(), ProofError> {
    for node in path {
        if node.key.has_partial_byte()
            || smallest.is_some_and(|s| node.key < *s)
            || largest.is_some_and(|l| node.key > *l)
        {
            continue;
        }
        match key_values.get(&node.key) {
            None => {
                if node.value_or_hash.is_some() {
                    return Err(ProofError::UnincludedValue);
                }
            }
            Some(value) => {
                if !value_or_hash_matches(Some(value), node.value_or_hash.as_deref()) {
                    return Err(ProofError::ValueMismatch);
                }
            }
        }
    }
    Ok(())
}

impl RangeProof {
    /// Verifies this proof against `expected_root`: accepts iff the trie
    /// with that root contains exactly the supplied pairs between `start`
    /// and the greatest proven key.
    pub fn verify(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        expected_root: Digest,
        branch_factor: BranchFactor,
    ) -> Result<(), ProofError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(TrieError::StartAfterEnd.into());
            }
        }
        if self.key_values.is_empty() && self.start_proof.is_empty() && self.end_proof.is_empty() {
            return Err(ProofError::Empty);
        }
        if self.end_proof.is_empty() && (end.is_some() || !self.key_values.is_empty()) {
            return Err(ProofError::MissingEndProof);
        }
        verify_key_values(&self.key_values, start, end)?;

        // The proof covers [smallest, largest]: the requested start up to the
        // greatest pair actually included (the proof may be truncated).
        let smallest = start.map(Key::from_bytes);
        let largest = self
            .key_values
            .last()
            .map(|kv| Key::from_bytes(&kv.key))
            .or_else(|| end.map(Key::from_bytes));

        verify_proof_path(&self.start_proof, smallest.as_ref())?;
        verify_proof_path(&self.end_proof, largest.as_ref())?;

        let kv_map: FxHashMap<Key, Vec<u8>> = self
            .key_values
            .iter()
            .map(|kv| (Key::from_bytes(&kv.key), kv.value.clone()))
            .collect();
        verify_range_values_present(&self.start_proof, smallest.as_ref(), largest.as_ref(), &kv_map)?;
        verify_range_values_present(&self.end_proof, smallest.as_ref(), largest.as_ref(), &kv_map)?;

        // Rebuild the proven slice, then graft the children of every
        // boundary node that lie outside [smallest, largest] with their
        // claimed IDs. Children inside the range are deliberately not
        // grafted: they must re-derive from the pairs themselves, so a
        // prover omitting interior pairs cannot reproduce the root.
        let view = StatelessView::new_base(branch_factor);
        for kv in &self.key_values {
            view.insert(&kv.key, &kv.value)?;
        }
        view.add_path_info(&self.start_proof, smallest.as_ref(), largest.as_ref())?;
        view.add_path_info(&self.end_proof, smallest.as_ref(), largest.as_ref())?;

        let got = view.get_merkle_root()?;
        if got != expected_root {
            return Err(ProofError::RootMismatch {
                got,
                want: expected_root,
            });
        }
        Ok(())
    }
}
