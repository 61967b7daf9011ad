//! Vote commands and their encrypted on-chain form.
//!
//! A command is packed, signed with the voter's current key and encrypted
//! under an ECDH key shared between a one-off ephemeral key and the
//! coordinator. Only the coordinator can open it again.

use anyhow::{anyhow, ensure, Context, Result};
use halo2curves_axiom::ff::Field;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::keys::{Keypair, PrivKey, PubKey, SharedKey, Signature};
use crate::hash::poseidon_hash;
use crate::{fr_from_bytes, fr_to_bytes, hash4, serde_fr, Fr};

pub const MESSAGE_DATA_LENGTH: usize = 10;

/// Width of every packed command field.
pub const PACKED_FIELD_BITS: usize = 50;
const PACKED_FIELDS: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub state_index: u64,
    pub new_pub_key: PubKey,
    pub vote_option_index: u64,
    pub new_vote_weight: u64,
    pub nonce: u64,
    pub poll_id: u64,
    pub salt: Fr,
}

/// Encrypted command as published to the message queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "serde_fr")]
    pub iv: Fr,
    #[serde(with = "serde_fr_array")]
    pub data: [Fr; MESSAGE_DATA_LENGTH],
    /// Ephemeral public key as raw coordinates. Kept unchecked so that
    /// malformed chain data still hashes into the message tree.
    #[serde(with = "serde_point")]
    pub enc_pub_key: (Fr, Fr),
}

impl Command {
    pub fn pack(&self) -> Result<Fr> {
        let fields = [
            self.nonce,
            self.state_index,
            self.vote_option_index,
            self.new_vote_weight,
            self.poll_id,
        ];
        let limit = 1u64 << PACKED_FIELD_BITS;
        let mut packed = BigUint::from(0u8);
        for (slot, value) in fields.iter().enumerate() {
            ensure!(
                *value < limit,
                "command field {} value {} exceeds {} bits",
                slot,
                value,
                PACKED_FIELD_BITS
            );
            packed |= BigUint::from(*value) << (slot * PACKED_FIELD_BITS);
        }
        biguint_to_fr(&packed)
    }

    pub fn unpack(packed: Fr, new_pub_key: PubKey, salt: Fr) -> Result<Self> {
        let value = BigUint::from_bytes_le(&fr_to_bytes(&packed));
        ensure!(
            value.bits() as usize <= PACKED_FIELDS * PACKED_FIELD_BITS,
            "packed command has stray high bits"
        );
        let mask = (BigUint::from(1u8) << PACKED_FIELD_BITS) - 1u8;
        let field = |slot: usize| -> u64 {
            let limb = (&value >> (slot * PACKED_FIELD_BITS)) & &mask;
            limb.iter_u64_digits().next().unwrap_or(0)
        };
        Ok(Self {
            nonce: field(0),
            state_index: field(1),
            vote_option_index: field(2),
            new_vote_weight: field(3),
            poll_id: field(4),
            new_pub_key,
            salt,
        })
    }

    /// The value a voter signs.
    pub fn hash(&self) -> Result<Fr> {
        let (x, y) = self.new_pub_key.xy();
        Ok(hash4([self.pack()?, x, y, self.salt]))
    }

    pub fn sign(&self, key: &PrivKey) -> Result<Signature> {
        Ok(key.sign(self.hash()?))
    }

    pub fn verify(&self, signer: &PubKey, signature: &Signature) -> bool {
        match self.hash() {
            Ok(digest) => signer.verify(digest, signature),
            Err(_) => false,
        }
    }

    pub fn encrypt(&self, signature: &Signature, shared: &SharedKey, iv: Fr) -> Result<Message> {
        let (x, y) = self.new_pub_key.xy();
        let plaintext = [
            self.pack()?,
            x,
            y,
            self.salt,
            signature.r.0,
            signature.r.1,
            signature.s_lo,
            signature.s_hi,
            Fr::ZERO,
            Fr::ZERO,
        ];
        let mut data = [Fr::ZERO; MESSAGE_DATA_LENGTH];
        for (i, (slot, value)) in data.iter_mut().zip(plaintext.iter()).enumerate() {
            *slot = *value + keystream(shared, iv, i);
        }
        Ok(Message {
            iv,
            data,
            enc_pub_key: (Fr::ZERO, Fr::ZERO),
        })
    }

    /// Sign with the voter's key and encrypt towards the coordinator.
    pub fn sign_and_encrypt(
        &self,
        voter_key: &PrivKey,
        ephemeral: &Keypair,
        coordinator_pub_key: &PubKey,
        iv: Fr,
    ) -> Result<Message> {
        let signature = self.sign(voter_key)?;
        let shared = ephemeral.priv_key.shared_key(coordinator_pub_key);
        let mut message = self.encrypt(&signature, &shared, iv)?;
        message.enc_pub_key = ephemeral.pub_key.xy();
        Ok(message)
    }
}

impl Message {
    /// Padding entry used to fill the last processing batch.
    pub fn empty() -> Self {
        Self {
            iv: Fr::ZERO,
            data: [Fr::ZERO; MESSAGE_DATA_LENGTH],
            enc_pub_key: (Fr::ZERO, Fr::ZERO),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }

    /// Leaf value in the message accumulator.
    pub fn hash(&self) -> Fr {
        let mut inputs = [Fr::ZERO; MESSAGE_DATA_LENGTH + 3];
        inputs[0] = self.iv;
        inputs[1..=MESSAGE_DATA_LENGTH].copy_from_slice(&self.data);
        inputs[MESSAGE_DATA_LENGTH + 1] = self.enc_pub_key.0;
        inputs[MESSAGE_DATA_LENGTH + 2] = self.enc_pub_key.1;
        poseidon_hash(inputs)
    }

    pub fn encryption_key(&self) -> Result<PubKey> {
        PubKey::from_xy(self.enc_pub_key.0, self.enc_pub_key.1)
            .context("message carries an invalid encryption key")
    }

    /// Decrypt with the coordinator's key, returning the command and the
    /// voter's signature over it.
    pub fn decrypt(&self, coordinator_key: &PrivKey) -> Result<(Command, Signature)> {
        let shared = coordinator_key.shared_key(&self.encryption_key()?);
        let mut plaintext = [Fr::ZERO; MESSAGE_DATA_LENGTH];
        for (i, (slot, value)) in plaintext.iter_mut().zip(self.data.iter()).enumerate() {
            *slot = *value - keystream(&shared, self.iv, i);
        }
        ensure!(
            plaintext[8] == Fr::ZERO && plaintext[9] == Fr::ZERO,
            "message padding is not zero; wrong key or corrupted ciphertext"
        );
        let new_pub_key = PubKey::from_xy(plaintext[1], plaintext[2])
            .map_err(|_| anyhow!("decrypted command carries an invalid public key"))?;
        let command = Command::unpack(plaintext[0], new_pub_key, plaintext[3])?;
        let signature = Signature {
            r: (plaintext[4], plaintext[5]),
            s_lo: plaintext[6],
            s_hi: plaintext[7],
        };
        Ok((command, signature))
    }
}

fn keystream(shared: &SharedKey, iv: Fr, index: usize) -> Fr {
    hash4([shared.x, shared.y, iv, Fr::from(index as u64)])
}

fn biguint_to_fr(value: &BigUint) -> Result<Fr> {
    let le = value.to_bytes_le();
    ensure!(le.len() <= 32, "value does not fit in 256 bits");
    let mut bytes = [0u8; 32];
    bytes[..le.len()].copy_from_slice(&le);
    fr_from_bytes(&bytes)
}

mod serde_fr_array {
    use super::MESSAGE_DATA_LENGTH;
    use crate::{serde_fr_vec, Fr};
    use serde::{de::Error, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        values: &[Fr; MESSAGE_DATA_LENGTH],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serde_fr_vec::serialize(values, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[Fr; MESSAGE_DATA_LENGTH], D::Error> {
        let values = serde_fr_vec::deserialize(deserializer)?;
        let len = values.len();
        values.try_into().map_err(|_| {
            D::Error::custom(format!(
                "message data must have {} elements, got {}",
                MESSAGE_DATA_LENGTH, len
            ))
        })
    }
}

mod serde_point {
    use crate::{serde_fr_vec, Fr};
    use serde::{de::Error, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(point: &(Fr, Fr), serializer: S) -> Result<S::Ok, S::Error> {
        serde_fr_vec::serialize(&[point.0, point.1], serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<(Fr, Fr), D::Error> {
        match serde_fr_vec::deserialize(deserializer)?.as_slice() {
            [x, y] => Ok((*x, *y)),
            other => Err(D::Error::custom(format!(
                "expected 2 coordinates, got {}",
                other.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_command(rng: &mut StdRng) -> (Keypair, Command) {
        let voter = Keypair::random(rng);
        let command = Command {
            state_index: 3,
            new_pub_key: voter.pub_key,
            vote_option_index: 2,
            new_vote_weight: 9,
            nonce: 1,
            poll_id: 0,
            salt: Fr::from(77u64),
        };
        (voter, command)
    }

    #[test]
    fn packing_is_reversible_and_bounded() {
        let mut rng = StdRng::seed_from_u64(1);
        let (_, command) = sample_command(&mut rng);
        let packed = command.pack().unwrap();
        let unpacked = Command::unpack(packed, command.new_pub_key, command.salt).unwrap();
        assert_eq!(unpacked, command);

        let mut oversized = command.clone();
        oversized.new_vote_weight = 1u64 << PACKED_FIELD_BITS;
        assert!(oversized.pack().is_err());
    }

    #[test]
    fn coordinator_opens_what_voter_sealed() {
        let mut rng = StdRng::seed_from_u64(2);
        let coordinator = Keypair::random(&mut rng);
        let ephemeral = Keypair::random(&mut rng);
        let (voter, command) = sample_command(&mut rng);

        let message = command
            .sign_and_encrypt(&voter.priv_key, &ephemeral, &coordinator.pub_key, Fr::from(5u64))
            .unwrap();
        let (opened, signature) = message.decrypt(&coordinator.priv_key).unwrap();
        assert_eq!(opened, command);
        assert!(opened.verify(&voter.pub_key, &signature));
    }

    #[test]
    fn wrong_key_cannot_open_message() {
        let mut rng = StdRng::seed_from_u64(3);
        let coordinator = Keypair::random(&mut rng);
        let stranger = Keypair::random(&mut rng);
        let ephemeral = Keypair::random(&mut rng);
        let (voter, command) = sample_command(&mut rng);

        let message = command
            .sign_and_encrypt(&voter.priv_key, &ephemeral, &coordinator.pub_key, Fr::ONE)
            .unwrap();
        assert!(message.decrypt(&stranger.priv_key).is_err());
        assert!(Message::empty().decrypt(&coordinator.priv_key).is_err());
    }

    #[test]
    fn message_json_uses_decimal_strings() {
        let mut message = Message::empty();
        message.iv = Fr::from(12u64);
        let json = serde_json::to_value(message).unwrap();
        assert_eq!(json["iv"], "12");
        assert_eq!(json["data"].as_array().unwrap().len(), MESSAGE_DATA_LENGTH);
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
        assert_ne!(message.hash(), Message::empty().hash());
    }
}
