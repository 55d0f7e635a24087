use serde::{Deserialize, Serialize};
use starknet::core::types::Felt;
use starknet_crypto::poseidon_hash;
use zylith_prover::{InputValue, ProofInputs};

use crate::codec::felt_to_hex;
use crate::error::ClientError;

pub const DEFAULT_TREE_DEPTH: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf: Felt,
    pub path: Vec<Felt>,
    /// `true` when the running hash is the right child at that level.
    pub path_indices: Vec<bool>,
    pub root: Felt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_index: Option<u64>,
}

impl MerkleProof {
    /// Checks shape against the tree depth and that the path hashes up to the attached root.
    pub fn verify(&self, depth: usize) -> Result<(), ClientError> {
        if self.path.len() != depth {
            return Err(ClientError::Validation(format!(
                "merkle path has {} levels, tree depth is {depth}",
                self.path.len()
            )));
        }
        let computed = compute_root(self.leaf, &self.path, &self.path_indices)?;
        if computed != self.root {
            return Err(ClientError::Validation(format!(
                "merkle path root mismatch: computed {}, proof carries {}",
                felt_to_hex(&computed),
                felt_to_hex(&self.root)
            )));
        }
        Ok(())
    }

    pub fn apply_to(&self, inputs: &mut ProofInputs) {
        inputs
            .insert("root", InputValue::Felt(self.root))
            .insert("pathElements", InputValue::VecFelt(self.path.clone()))
            .insert("pathIndices", InputValue::VecBool(self.path_indices.clone()));
    }
}

pub fn compute_root(leaf: Felt, path: &[Felt], indices: &[bool]) -> Result<Felt, ClientError> {
    if path.len() != indices.len() {
        return Err(ClientError::Validation(format!(
            "merkle path has {} siblings but {} indices",
            path.len(),
            indices.len()
        )));
    }
    let mut hash = leaf;
    for (sibling, is_right) in path.iter().zip(indices.iter()) {
        let (left, right) = if *is_right {
            (*sibling, hash)
        } else {
            (hash, *sibling)
        };
        hash = poseidon_hash(left, right);
    }
    Ok(hash)
}

/// Bits of a leaf index, least significant first, one per tree level.
pub fn index_bits(index: u64, depth: usize) -> Vec<bool> {
    (0..depth).map(|level| (index >> level) & 1 == 1).collect()
}
