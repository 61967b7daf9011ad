//! Proof artifacts and the published tally document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{serde_fr, serde_fr_vec, Fr};

/// What the external prover hands back: an opaque proof object and the
/// public signals it commits to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProverOutput {
    pub proof: Value,
    #[serde(with = "serde_fr_vec")]
    pub public_signals: Vec<Fr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessProof {
    pub batch_index: usize,
    /// Number of real (non-padding) messages in the batch.
    pub message_count: usize,
    #[serde(with = "serde_fr")]
    pub state_root_before: Fr,
    #[serde(with = "serde_fr")]
    pub state_root_after: Fr,
    #[serde(with = "serde_fr")]
    pub public_input_hash: Fr,
    pub circuit_inputs: Value,
    pub proof: Value,
    #[serde(with = "serde_fr_vec")]
    pub public_signals: Vec<Fr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyProof {
    pub batch_index: usize,
    #[serde(with = "serde_fr")]
    pub tally_commitment_before: Fr,
    #[serde(with = "serde_fr")]
    pub tally_commitment_after: Fr,
    #[serde(with = "serde_fr")]
    pub public_input_hash: Fr,
    pub circuit_inputs: Value,
    pub proof: Value,
    #[serde(with = "serde_fr_vec")]
    pub public_signals: Vec<Fr>,
}

/// A tallied vector with the salt and commitment that open it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedTally {
    pub tally: Vec<String>,
    #[serde(with = "serde_fr")]
    pub salt: Fr,
    #[serde(with = "serde_fr")]
    pub commitment: Fr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedSpent {
    pub spent: String,
    #[serde(with = "serde_fr")]
    pub salt: Fr,
    #[serde(with = "serde_fr")]
    pub commitment: Fr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyDocument {
    pub maci: String,
    pub poll_id: String,
    pub is_quadratic: bool,
    #[serde(with = "serde_fr")]
    pub new_tally_commitment: Fr,
    pub results: CommittedTally,
    pub total_spent_voice_credits: CommittedSpent,
    #[serde(
        rename = "perVOSpentVoiceCredits",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub per_vo_spent_voice_credits: Option<CommittedTally>,
}
