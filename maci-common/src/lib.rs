//! Shared MACI domain primitives.
//!
//! Everything the coordinator needs to reason about poll state without a
//! live chain: BN256 scalar helpers, the Poseidon sponge used for every
//! commitment, Grumpkin keys (whose base field is the BN256 scalar field, so
//! coordinates fit in a single message field), encrypted messages, quinary
//! Merkle accumulators and the JSON documents exchanged with operators.

pub mod hash;
pub mod keys;
pub mod message;
pub mod poll;
pub mod proof;
pub mod replay;
pub mod state;
pub mod tree;

use anyhow::{anyhow, ensure, Context, Result};
use halo2curves_axiom::ff::PrimeField;
use num_bigint::BigUint;

pub use halo2curves_axiom::bn256::Fr;

pub use hash::{hash2, hash3, hash4, hash5, hash_slice};
pub use keys::{Keypair, PrivKey, PubKey, SharedKey, Signature};
pub use message::{Command, Message, MESSAGE_DATA_LENGTH};
pub use poll::{MaxValues, PollInfo, TreeDepths, MAX_TREE_DEPTH, MAX_VOTE_OPTION_TREE_DEPTH};
pub use proof::{
    CommittedSpent, CommittedTally, ProcessProof, ProverOutput, TallyDocument, TallyProof,
};
pub use replay::{ReplayDocument, ReplayMessage, ReplayUser};
pub use state::{Ballot, StateLeaf};
pub use tree::{MerklePath, QuinaryTree, TREE_ARITY};

pub fn hash_bytes_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub fn fr_from_bytes(bytes: &[u8; 32]) -> Result<Fr> {
    Fr::from_bytes(bytes)
        .into_option()
        .ok_or_else(|| anyhow!("invalid bn256 scalar encoding"))
}

pub fn fr_to_bytes(fr: &Fr) -> [u8; 32] {
    let repr = fr.to_repr();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(repr.as_ref());
    bytes
}

/// Interpret big-endian bytes as an integer and reduce it into `F`.
pub fn reduce_be_bytes<F: PrimeField>(bytes: &[u8]) -> F {
    let mut acc = F::ZERO;
    let base = F::from(256);
    for byte in bytes.iter() {
        acc = acc * base + F::from(*byte as u64);
    }
    acc
}

pub fn reduce_be_bytes_to_fr(bytes: &[u8; 32]) -> Fr {
    reduce_be_bytes(bytes)
}

/// Big-endian 32-byte encoding, the layout used for EVM `uint256` words.
pub fn fr_to_be_bytes(fr: &Fr) -> [u8; 32] {
    let mut bytes = fr_to_bytes(fr);
    bytes.reverse();
    bytes
}

/// Parse a big-endian `uint256` word, rejecting values outside the field.
pub fn fr_from_be_bytes(bytes: &[u8; 32]) -> Result<Fr> {
    let mut le = *bytes;
    le.reverse();
    fr_from_bytes(&le)
}

pub fn fr_to_decimal(fr: &Fr) -> String {
    BigUint::from_bytes_le(&fr_to_bytes(fr)).to_string()
}

pub fn fr_from_decimal(value: &str) -> Result<Fr> {
    let trimmed = value.trim();
    let parsed = if let Some(hex_digits) = trimmed.strip_prefix("0x") {
        BigUint::parse_bytes(hex_digits.as_bytes(), 16)
    } else {
        BigUint::parse_bytes(trimmed.as_bytes(), 10)
    }
    .with_context(|| format!("'{}' is not a valid integer", value))?;

    let le = parsed.to_bytes_le();
    ensure!(le.len() <= 32, "'{}' does not fit in 256 bits", value);
    let mut bytes = [0u8; 32];
    bytes[..le.len()].copy_from_slice(&le);
    fr_from_bytes(&bytes).with_context(|| format!("'{}' exceeds the field modulus", value))
}

pub fn fr_to_u128(fr: &Fr) -> Result<u128> {
    let bytes = fr_to_bytes(fr);
    ensure!(
        bytes[16..].iter().all(|&b| b == 0),
        "field element does not fit in u128"
    );
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes[..16]);
    Ok(u128::from_le_bytes(buf))
}

pub fn fr_to_u64(fr: &Fr) -> Result<u64> {
    let value = fr_to_u128(fr)?;
    u64::try_from(value).map_err(|_| anyhow!("field element does not fit in u64"))
}

/// Serde adapter encoding field elements as decimal strings (the circom
/// convention used by witness inputs and tally files).
pub mod serde_fr {
    use super::{fr_from_decimal, fr_to_decimal, Fr};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Fr, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&fr_to_decimal(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Fr, D::Error> {
        let raw = String::deserialize(deserializer)?;
        fr_from_decimal(&raw).map_err(D::Error::custom)
    }
}

pub mod serde_fr_vec {
    use super::{fr_from_decimal, fr_to_decimal, Fr};
    use serde::{de::Error, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[Fr], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&fr_to_decimal(value))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Fr>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| fr_from_decimal(s).map_err(D::Error::custom))
            .collect()
    }
}
