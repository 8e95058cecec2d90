//! In-memory trie nodes and their Merkle IDs.
use std::collections::BTreeMap;
use std::fmt;

use derive_more::Deref;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::codec;
use crate::key::Key;

/// Length in bytes of a [`Digest`].
pub const HASH_LEN: usize = 32;

/// A 32-byte SHA-256 digest identifying a subtree's contents and shape.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deref, Serialize, Deserialize,
)]
pub struct Digest(pub [u8; HASH_LEN]);

impl Digest {
    /// The zero digest, used as a placeholder until a child's ID has been
    /// recomputed.
    pub const ZERO: Digest = Digest([0; HASH_LEN]);
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest(hasher.finalize().into())
}

/// The digest form of a value as it appears in hash inputs and proofs: the
/// value itself when shorter than [`HASH_LEN`], otherwise its SHA-256 hash.
pub fn value_digest(value: &[u8]) -> Vec<u8> {
    if value.len() < HASH_LEN {
        value.to_vec()
    } else {
        sha256(value).to_vec()
    }
}

/// A child edge: the compressed key suffix between the parent and the child,
/// the child's Merkle ID, and whether the child carries a value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Child {
    pub compressed_key: Key,
    pub id: Digest,
    pub has_value: bool,
}

/// A trie node: an optional value plus up to one child edge per token.
///
/// A node does not store its own key; the key is implied by the path from the
/// root through the compressed child edges. `value_digest` is normally
/// derived from `value`, but proof verification reconstructs nodes for which
/// only the digest is known.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    value: Option<Vec<u8>>,
    value_digest: Option<Vec<u8>>,
    children: BTreeMap<u8, Child>,
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff this node carries a stored value.
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// The digest form of the value used in hash inputs and proofs.
    pub fn value_or_hash(&self) -> Option<&[u8]> {
        self.value_digest.as_deref()
    }

    /// Sets or clears the value, keeping the digest in sync.
    pub fn set_value(&mut self, value: Option<Vec<u8>>) {
        self.value_digest = value.as_deref().map(value_digest);
        self.value = value;
    }

    /// Overrides the value digest directly. Only proof reconstruction needs
    /// this; the pre-image may be unknown.
    pub(crate) fn set_value_digest(&mut self, digest: Option<Vec<u8>>) {
        self.value_digest = digest;
    }

    /// Children in ascending token order.
    pub fn children(&self) -> &BTreeMap<u8, Child> {
        &self.children
    }

    /// Installs, replaces, or (with `None`) removes the child entry at
    /// `token`.
    pub fn set_child(&mut self, token: u8, child: Option<Child>) {
        match child {
            Some(child) => {
                self.children.insert(token, child);
            }
            None => {
                self.children.remove(&token);
            }
        }
    }

    pub(crate) fn child_mut(&mut self, token: u8) -> Option<&mut Child> {
        self.children.get_mut(&token)
    }

    /// Merkle ID of this node at `key`. Deterministic and pure; assumes the
    /// children's `id` fields are up to date.
    pub fn calculate_id(&self, key: &Key, token_size: usize) -> Digest {
        sha256(&codec::hash_input(key, self, token_size))
    }

    /// The proof representation of this node at `key`.
    pub fn as_proof_node(&self, key: &Key) -> crate::proof::ProofNode {
        crate::proof::ProofNode {
            key: key.clone(),
            children: self.children.iter().map(|(tok, c)| (*tok, c.id)).collect(),
            value_or_hash: self.value_digest.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_digest_small_values_are_raw() {
        let short = vec![1u8; HASH_LEN - 1];
        assert_eq!(value_digest(&short), short);
        let long = vec![2u8; HASH_LEN];
        assert_eq!(value_digest(&long), sha256(&long).to_vec());
    }

    #[test]
    fn set_value_tracks_digest() {
        let mut node = Node::new();
        assert!(!node.has_value());
        node.set_value(Some(b"v".to_vec()));
        assert!(node.has_value());
        assert_eq!(node.value_or_hash(), Some(b"v".as_slice()));
        node.set_value(None);
        assert!(!node.has_value());
        assert_eq!(node.value_or_hash(), None);
    }

    #[test]
    fn clone_is_deep() {
        let mut node = Node::new();
        node.set_value(Some(b"v".to_vec()));
        node.set_child(
            3,
            Some(Child {
                compressed_key: Key::from_bytes(b"x"),
                id: Digest::ZERO,
                has_value: true,
            }),
        );
        let mut copy = node.clone();
        copy.set_value(Some(b"w".to_vec()));
        copy.set_child(3, None);
        assert_eq!(node.value(), Some(b"v".as_slice()));
        assert_eq!(node.children().len(), 1);
    }

    #[test]
    fn id_changes_with_any_field() {
        let ts = 4;
        let key = Key::from_bytes(b"ab");
        let mut node = Node::new();
        let base = node.calculate_id(&key, ts);

        node.set_value(Some(b"v".to_vec()));
        let with_value = node.calculate_id(&key, ts);
        assert_ne!(base, with_value);

        node.set_child(
            1,
            Some(Child {
                compressed_key: Key::from_bytes(b"c").skip(4),
                id: sha256(b"child"),
                has_value: false,
            }),
        );
        assert_ne!(with_value, node.calculate_id(&key, ts));
        assert_ne!(node.calculate_id(&key, ts), node.calculate_id(&Key::from_bytes(b"ac"), ts));
    }
}
