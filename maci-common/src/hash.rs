//! Poseidon hashing over the BN256 scalar field.
//!
//! Every commitment in the pipeline (state leaves, ballots, message leaves,
//! tree nodes, tally commitments, circuit input hashes) goes through the
//! width-6 sponge defined here.

use halo2curves_axiom::ff::Field;
use poseidon_primitives::poseidon::primitives::{ConstantLength, Hash as PoseidonHash, Spec};

use crate::Fr;

pub const POSEIDON_T: usize = 6;
pub const POSEIDON_RATE: usize = 5;
pub const POSEIDON_FULL_ROUNDS: usize = 8;
pub const POSEIDON_PARTIAL_ROUNDS: usize = 57;

pub fn poseidon_hash<const L: usize>(values: [Fr; L]) -> Fr {
    PoseidonHash::<Fr, MaciPoseidonSpec, ConstantLength<L>, POSEIDON_T, POSEIDON_RATE>::init()
        .hash(values)
}

pub fn hash2(a: Fr, b: Fr) -> Fr {
    poseidon_hash([a, b])
}

pub fn hash3(a: Fr, b: Fr, c: Fr) -> Fr {
    poseidon_hash([a, b, c])
}

pub fn hash4(values: [Fr; 4]) -> Fr {
    poseidon_hash(values)
}

pub fn hash5(values: [Fr; 5]) -> Fr {
    poseidon_hash(values)
}

/// Hash a variable-length slice.
///
/// The length is absorbed first so that `[a]` and `[a, 0]` never collide,
/// then the values are folded in groups of four.
pub fn hash_slice(values: &[Fr]) -> Fr {
    let mut acc = Fr::from(values.len() as u64);
    if values.is_empty() {
        return hash5([acc, Fr::ZERO, Fr::ZERO, Fr::ZERO, Fr::ZERO]);
    }
    for chunk in values.chunks(POSEIDON_RATE - 1) {
        let mut block = [Fr::ZERO; POSEIDON_RATE];
        block[0] = acc;
        block[1..=chunk.len()].copy_from_slice(chunk);
        acc = hash5(block);
    }
    acc
}

#[derive(Debug)]
pub struct MaciPoseidonSpec;

impl Spec<Fr, POSEIDON_T, POSEIDON_RATE> for MaciPoseidonSpec {
    fn full_rounds() -> usize {
        POSEIDON_FULL_ROUNDS
    }

    fn partial_rounds() -> usize {
        POSEIDON_PARTIAL_ROUNDS
    }

    fn sbox(val: Fr) -> Fr {
        val.pow_vartime([5])
    }

    fn secure_mds() -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        let a = hash3(Fr::from(1u64), Fr::from(2u64), Fr::from(3u64));
        let b = hash3(Fr::from(1u64), Fr::from(2u64), Fr::from(3u64));
        assert_eq!(a, b);
        assert_ne!(a, hash3(Fr::from(3u64), Fr::from(2u64), Fr::from(1u64)));
    }

    #[test]
    fn slice_hash_binds_length() {
        let one = hash_slice(&[Fr::from(5u64)]);
        let padded = hash_slice(&[Fr::from(5u64), Fr::ZERO]);
        assert_ne!(one, padded);
        assert_ne!(hash_slice(&[]), Fr::ZERO);
    }
}
