#![doc = include_str!("../README.md")]

mod apply;
pub mod changes;
pub use changes::{BatchOp, Change, ChangeSet, ViewChanges};
pub mod codec;
pub mod db;
pub use db::{Config, LayerDb};
pub mod errors;
pub use errors::TrieError;
pub mod key;
pub use key::{BranchFactor, Key};
pub mod node;
pub use node::{Child, Digest, Node};
pub mod proof;
pub use proof::{KeyValue, Proof, ProofError, ProofNode, RangeProof};
pub mod stateless;
pub use stateless::StatelessView;
pub mod store;
pub use store::{MemStore, Storage};
pub mod view;
pub use view::TrieView;

#[cfg(test)]
mod fuzz;

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple end-to-end test demonstrating the complete workflow: stage
    /// writes in stacked views, prove against the root, commit, and verify
    /// statelessly.
    #[test]
    fn basic_integration_test() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemStore::new(BranchFactor::Sixteen);
        let db = LayerDb::new(store, Config::default())?;

        // Stage a batch of account writes; storage is untouched until
        // commit.
        let v1 = db.new_view(ViewChanges::from_batch([
            (b"account1".to_vec(), Some(b"balance100".to_vec())),
            (b"storage_key".to_vec(), Some(b"storage_value".to_vec())),
        ]))?;

        // Stack a second view and read through both layers.
        let v2 = v1.new_view(ViewChanges::from_batch([(
            b"account2".to_vec(),
            Some(b"balance200".to_vec()),
        )]))?;
        assert_eq!(v2.get_value(b"account1")?, Some(b"balance100".to_vec()));

        // Prove a present and an absent key against the root.
        let root = v2.merkle_root()?;
        let inclusion = v2.get_proof(b"account1")?;
        inclusion.verify(root, BranchFactor::Sixteen)?;
        let exclusion = v2.get_proof(b"no_such_key")?;
        assert_eq!(exclusion.value, None);
        exclusion.verify(root, BranchFactor::Sixteen)?;

        // A bounded range proof over everything.
        let range = v2.get_range_proof(None, None, 10)?;
        assert_eq!(range.key_values.len(), 3);
        range.verify(None, None, root, BranchFactor::Sixteen)?;

        // Commit the whole stack; the committed root matches the view's.
        v2.commit_to_db()?;
        assert_eq!(db.root_id()?, root);
        assert_eq!(db.get_value(b"account2")?, Some(b"balance200".to_vec()));

        // A stateless view over the same data reproduces the root without
        // any database.
        let stateless = StatelessView::new_base(BranchFactor::Sixteen);
        stateless.insert(b"account1", b"balance100")?;
        stateless.insert(b"account2", b"balance200")?;
        stateless.insert(b"storage_key", b"storage_value")?;
        assert_eq!(stateless.get_merkle_root()?, root);

        Ok(())
    }
}
