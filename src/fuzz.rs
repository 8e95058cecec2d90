//! Randomized end-to-end consistency harness.
//!
//! Simulates the full lifecycle against a `BTreeMap` oracle: blocks of
//! batched mutations are staged in views, committed to the database, and
//! checked from three angles:
//!
//! - **State consistency**: every lookup matches the oracle, before and
//!   after commit.
//! - **Root consistency**: the committed root equals the root of a trie
//!   rebuilt from scratch from the oracle, so incremental materialisation
//!   and path compression cannot drift.
//! - **Proof consistency**: inclusion/exclusion and range proofs generated
//!   at each block boundary verify against the committed root.
use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::changes::ViewChanges;
use crate::db::{Config, LayerDb};
use crate::key::BranchFactor;
use crate::node::Digest;
use crate::store::MemStore;

/// One state modification, referencing a key from a fixed pool so updates
/// and deletes collide with earlier writes often.
#[derive(Debug, Clone)]
enum Operation {
    Insert(usize, u8),
    Delete(usize),
}

fn key_pool() -> Vec<Vec<u8>> {
    // Short overlapping keys force branch creation and path compression far
    // more often than random 32-byte keys would.
    let mut pool = Vec::new();
    for a in [b"ab".as_slice(), b"abc", b"abd", b"abcdef", b"x", b""] {
        pool.push(a.to_vec());
    }
    for i in 0..120u8 {
        pool.push(format!("key_{:02x}", i % 60).into_bytes());
    }
    pool
}

fn random_block(rng: &mut StdRng, pool_len: usize, max_ops: usize) -> Vec<Operation> {
    (0..rng.gen_range(1..=max_ops))
        .map(|_| {
            if rng.gen_bool(0.7) {
                Operation::Insert(rng.gen_range(0..pool_len), rng.gen())
            } else {
                Operation::Delete(rng.gen_range(0..pool_len))
            }
        })
        .collect()
}

fn rebuild_root(oracle: &BTreeMap<Vec<u8>, Vec<u8>>, branch_factor: BranchFactor) -> Digest {
    let db = LayerDb::new(
        MemStore::new(branch_factor),
        Config { branch_factor },
    )
    .expect("fresh database");
    let view = db
        .new_view(ViewChanges::from_batch(
            oracle.iter().map(|(k, v)| (k.clone(), Some(v.clone()))),
        ))
        .expect("rebuild view");
    view.merkle_root().expect("rebuild root")
}

fn run(seed: u64, blocks: usize, branch_factor: BranchFactor) {
    let mut rng = StdRng::seed_from_u64(seed);
    let pool = key_pool();
    let db = LayerDb::new(
        MemStore::new(branch_factor),
        Config { branch_factor },
    )
    .expect("database");
    let mut oracle: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for block in 0..blocks {
        let ops = random_block(&mut rng, pool.len(), 24);
        let mut staged = Vec::new();
        for op in &ops {
            match op {
                Operation::Insert(idx, byte) => {
                    let key = pool[*idx].clone();
                    let value = vec![*byte, *idx as u8];
                    oracle.insert(key.clone(), value.clone());
                    staged.push((key, Some(value)));
                }
                Operation::Delete(idx) => {
                    let key = pool[*idx].clone();
                    oracle.remove(&key);
                    staged.push((key, None));
                }
            }
        }

        let view = db
            .new_view(ViewChanges::from_batch(staged))
            .expect("stage block");

        // Uncommitted reads already reflect the block.
        for key in &pool {
            assert_eq!(
                view.get_value(key).expect("view read"),
                oracle.get(key).cloned(),
                "block {block}: view disagrees with oracle on {key:?}"
            );
        }

        let root = view.merkle_root().expect("root");
        assert_eq!(
            root,
            rebuild_root(&oracle, branch_factor),
            "block {block}: incremental root differs from rebuilt root"
        );

        // Proofs for a few present and absent keys.
        for _ in 0..4 {
            let key = &pool[rng.gen_range(0..pool.len())];
            let proof = view.get_proof(key).expect("proof");
            assert_eq!(proof.value, oracle.get(key).cloned());
            proof.verify(root, branch_factor).expect("proof verifies");
        }

        // A random bounded range proof.
        let mut bounds = [rng.gen::<[u8; 2]>(), rng.gen::<[u8; 2]>()];
        bounds.sort();
        let (lo, hi) = (bounds[0].as_slice(), bounds[1].as_slice());
        let range = view
            .get_range_proof(Some(lo), Some(hi), 8)
            .expect("range proof");
        range
            .verify(Some(lo), Some(hi), root, branch_factor)
            .expect("range proof verifies");

        view.commit_to_db().expect("commit");
        assert_eq!(db.root_id().expect("db root"), root);
        for key in &pool {
            assert_eq!(db.get_value(key).expect("db read"), oracle.get(key).cloned());
        }
    }
}

#[test]
fn end_to_end_consistency_nibble_trie() {
    run(0xA11CE, 12, BranchFactor::Sixteen);
}

#[test]
fn end_to_end_consistency_binary_trie() {
    run(0xB0B, 6, BranchFactor::Two);
}

#[test]
fn end_to_end_consistency_byte_trie() {
    run(0xC0FFEE, 6, BranchFactor::TwoFiftySix);
}

#[test]
fn compression_invariant_holds_everywhere() {
    // Walk the full trie via range collection plus proofs: every non-root
    // node reachable in a proof path must have a value or at least two
    // children.
    let mut rng = StdRng::seed_from_u64(42);
    let pool = key_pool();
    let branch_factor = BranchFactor::Sixteen;
    let db = LayerDb::new(
        MemStore::new(branch_factor),
        Config { branch_factor },
    )
    .expect("database");

    let mut staged = Vec::new();
    for _ in 0..80 {
        let key = pool[rng.gen_range(0..pool.len())].clone();
        staged.push((key, Some(vec![rng.gen()])));
    }
    let view = db.new_view(ViewChanges::from_batch(staged)).expect("view");
    view.merkle_root().expect("root");

    for key in &pool {
        let proof = view.get_proof(key).expect("proof");
        for node in &proof.path {
            if node.key.is_empty() {
                continue;
            }
            assert!(
                node.value_or_hash.is_some() || node.children.len() != 1,
                "value-less single-child node at {:?}",
                node.key
            );
        }
    }
}
