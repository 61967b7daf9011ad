//! Recovery documents: the signups and messages of a poll, replayable onto
//! a fresh deployment in file order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::keys::PubKey;
use crate::message::{Message, MESSAGE_DATA_LENGTH};
use crate::{serde_fr, Fr};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayDocument {
    #[serde(default)]
    pub users: Vec<ReplayUser>,
    #[serde(default)]
    pub messages: Vec<ReplayMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayUser {
    #[serde(alias = "pubKey")]
    pub public_key: PubKey,
    #[serde(with = "flexible_u64")]
    pub voice_credit_balance: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayMessage {
    #[serde(alias = "encPubKey")]
    pub encryption_public_key: PubKey,
    #[serde(with = "serde_fr")]
    pub iv: Fr,
    #[serde(with = "crate::serde_fr_vec")]
    pub data: Vec<Fr>,
}

impl ReplayDocument {
    pub fn from_json(raw: &str) -> Result<Self> {
        let doc: Self = serde_json::from_str(raw).context("failed to parse replay document")?;
        for (i, message) in doc.messages.iter().enumerate() {
            message
                .to_message()
                .with_context(|| format!("replay message {} is malformed", i + 1))?;
        }
        Ok(doc)
    }
}

impl ReplayMessage {
    pub fn to_message(&self) -> Result<Message> {
        let data: [Fr; MESSAGE_DATA_LENGTH] =
            self.data.clone().try_into().map_err(|values: Vec<Fr>| {
                anyhow::anyhow!(
                    "message data must have {} elements, got {}",
                    MESSAGE_DATA_LENGTH,
                    values.len()
                )
            })?;
        Ok(Message {
            iv: self.iv,
            data,
            enc_pub_key: self.encryption_public_key.xy(),
        })
    }
}

/// Balances show up both as JSON numbers and as decimal strings.
mod flexible_u64 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(value),
            Raw::Text(text) => {
                let trimmed = text.trim();
                match trimmed.strip_prefix("0x") {
                    Some(hex_digits) => u64::from_str_radix(hex_digits, 16),
                    None => trimmed.parse::<u64>(),
                }
                .map_err(|err| D::Error::custom(format!("invalid balance '{}': {}", text, err)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn parses_both_key_spellings_and_balance_formats() {
        let mut rng = StdRng::seed_from_u64(42);
        let user = Keypair::random(&mut rng);
        let data: Vec<String> = (0..MESSAGE_DATA_LENGTH).map(|i| i.to_string()).collect();
        let raw = serde_json::json!({
            "users": [
                { "publicKey": user.pub_key.serialize(), "voiceCreditBalance": 100 },
                { "pubKey": user.pub_key.serialize(), "voiceCreditBalance": "0x20" }
            ],
            "messages": [
                { "encPubKey": user.pub_key.serialize(), "iv": "7", "data": data }
            ]
        });
        let doc = ReplayDocument::from_json(&raw.to_string()).unwrap();
        assert_eq!(doc.users[0].voice_credit_balance, 100);
        assert_eq!(doc.users[1].voice_credit_balance, 32);
        let message = doc.messages[0].to_message().unwrap();
        assert_eq!(message.iv, Fr::from(7u64));
        assert_eq!(message.enc_pub_key, user.pub_key.xy());
    }

    #[test]
    fn rejects_short_message_payloads() {
        let mut rng = StdRng::seed_from_u64(43);
        let user = Keypair::random(&mut rng);
        let raw = serde_json::json!({
            "users": [],
            "messages": [
                { "encryptionPublicKey": user.pub_key.serialize(), "iv": "1", "data": ["1", "2"] }
            ]
        });
        assert!(ReplayDocument::from_json(&raw.to_string()).is_err());
    }
}
