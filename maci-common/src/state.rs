//! State leaves and ballots.

use anyhow::{ensure, Result};
use halo2curves_axiom::ff::Field;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::keys::{PrivKey, PubKey};
use crate::tree::{QuinaryTree, TREE_ARITY};
use crate::{hash2, hash4, Fr};

/// Key of the placeholder leaf at index 0 of every state tree. Nobody
/// knows a usable discrete log for it, so index 0 can never cast votes.
static BLANK_STATE_KEY: Lazy<PubKey> = Lazy::new(|| {
    let seed = blake3::hash(b"maci.blank-state-leaf");
    PrivKey::from_bytes(*seed.as_bytes()).public_key()
});

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateLeaf {
    pub pub_key: PubKey,
    pub voice_credit_balance: u64,
    pub timestamp: u64,
}

impl StateLeaf {
    pub fn new(pub_key: PubKey, voice_credit_balance: u64, timestamp: u64) -> Self {
        Self {
            pub_key,
            voice_credit_balance,
            timestamp,
        }
    }

    pub fn blank() -> Self {
        Self::new(*BLANK_STATE_KEY, 0, 0)
    }

    pub fn hash(&self) -> Fr {
        let (x, y) = self.pub_key.xy();
        hash4([
            x,
            y,
            Fr::from(self.voice_credit_balance),
            Fr::from(self.timestamp),
        ])
    }
}

/// Per-voter record of the last accepted nonce and the current vote weight
/// on each option.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ballot {
    pub nonce: u64,
    pub votes: Vec<u64>,
    pub vote_option_depth: usize,
}

impl Ballot {
    pub fn blank(vote_option_depth: usize) -> Self {
        let options = TREE_ARITY.pow(vote_option_depth as u32);
        Self {
            nonce: 0,
            votes: vec![0; options],
            vote_option_depth,
        }
    }

    pub fn set_vote(&mut self, option: usize, weight: u64) -> Result<()> {
        ensure!(
            option < self.votes.len(),
            "vote option {} out of range ({} options)",
            option,
            self.votes.len()
        );
        self.votes[option] = weight;
        Ok(())
    }

    pub fn votes_root(&self) -> Fr {
        let mut tree = QuinaryTree::new(self.vote_option_depth, Fr::ZERO);
        // Trailing zero weights leave the zero ladder untouched.
        let used = self
            .votes
            .iter()
            .rposition(|weight| *weight != 0)
            .map_or(0, |last| last + 1);
        for weight in &self.votes[..used] {
            // Capacity equals votes.len(), so insertion cannot overflow.
            let inserted = tree.insert(Fr::from(*weight));
            debug_assert!(inserted.is_ok(), "vote option tree overflow: {:?}", inserted);
        }
        tree.root()
    }

    pub fn hash(&self) -> Fr {
        hash2(Fr::from(self.nonce), self.votes_root())
    }
}
