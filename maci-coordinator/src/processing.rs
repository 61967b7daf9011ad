//! Local replay of message processing and tallying.
//!
//! The coordinator recomputes everything the circuits attest to: which
//! messages are valid, the resulting state and ballot trees, and the tally.
//! The outputs of this module become the circuit inputs and the roots that
//! chain batches together.

use halo2curves_axiom::ff::{Field, PrimeField};
use maci_common::{
    fr_to_decimal, hash2, hash3, hash_slice, reduce_be_bytes_to_fr, Ballot, Command, Fr, Keypair,
    MerklePath, Message, PollInfo, QuinaryTree, Signature, StateLeaf,
};
use serde_json::{json, Value};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::replicator::ProtocolState;

/// Width of each slot in a packed public value.
const PACKED_SLOT_BITS: u64 = 50;

/// Why a message was ignored. Ignored messages still occupy their slot in
/// the batch; they just leave state untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    Undecryptable,
    InvalidStateIndex,
    InvalidSignature,
    InvalidNonce,
    InvalidVoteOption,
    WrongPoll,
    InsufficientCredits,
}

/// Deterministic salts derived from the coordinator key, so that reruns
/// over the same poll reproduce the same commitments.
#[derive(Clone)]
pub struct SaltSource {
    seed: Zeroizing<[u8; 32]>,
}

impl SaltSource {
    pub fn new(coordinator: &Keypair) -> Self {
        Self {
            seed: Zeroizing::new(blake3::derive_key(
                "maci coordinator commitment salts v1",
                coordinator.priv_key.as_bytes(),
            )),
        }
    }

    pub fn salt(&self, domain: &str, index: usize) -> Fr {
        let mut hasher = blake3::Hasher::new_keyed(&self.seed);
        hasher.update(domain.as_bytes());
        hasher.update(&(index as u64).to_le_bytes());
        reduce_be_bytes_to_fr(hasher.finalize().as_bytes())
    }
}

fn dec(value: &Fr) -> Value {
    Value::String(fr_to_decimal(value))
}

fn dec_all(values: &[Fr]) -> Value {
    Value::Array(values.iter().map(dec).collect())
}

fn path_json(path: &MerklePath) -> Value {
    Value::Array(path.siblings.iter().map(|level| dec_all(level)).collect())
}

/// `values[0] + values[1] * 2^50 + values[2] * 2^100 + ...`
pub fn pack_values(values: &[u64]) -> Fr {
    let shift = Fr::from(2u64).pow_vartime([PACKED_SLOT_BITS]);
    let mut acc = Fr::ZERO;
    let mut factor = Fr::ONE;
    for value in values {
        acc += Fr::from(*value) * factor;
        factor *= shift;
    }
    acc
}

fn vote_tree(ballot: &Ballot) -> CoordinatorResult<QuinaryTree> {
    let mut tree = QuinaryTree::new(ballot.vote_option_depth, Fr::ZERO);
    for weight in &ballot.votes {
        tree.insert(Fr::from(*weight))
            .map_err(tree_error)?;
    }
    Ok(tree)
}

fn tree_error(err: anyhow::Error) -> CoordinatorError {
    CoordinatorError::Precondition(format!("local tree update failed: {}", err))
}

/// Circuit inputs and roots for one message-processing batch.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedBatch {
    pub batch_index: usize,
    pub message_count: usize,
    pub state_root_before: Fr,
    pub state_root_after: Fr,
    pub public_input_hash: Fr,
    pub circuit_inputs: Value,
    pub rejected: Vec<(usize, Rejection)>,
}

/// State after every message has been applied.
#[derive(Clone, Debug)]
pub struct ProcessedState {
    pub poll: PollInfo,
    pub state_leaves: Vec<StateLeaf>,
    pub ballots: Vec<Ballot>,
    pub state_root: Fr,
    pub ballot_root: Fr,
    pub sb_salt: Fr,
    pub sb_commitment: Fr,
}

pub struct MessageProcessor<'a> {
    poll: &'a PollInfo,
    messages: &'a [Message],
    coordinator: &'a Keypair,
    quadratic_voting: bool,
    salts: SaltSource,
    state_leaves: Vec<StateLeaf>,
    ballots: Vec<Ballot>,
    state_tree: QuinaryTree,
    ballot_tree: QuinaryTree,
    message_root: Fr,
    batch_size: usize,
    sb_salt: Fr,
    sb_commitment: Fr,
    next_batch: usize,
}

impl<'a> MessageProcessor<'a> {
    pub fn new(
        state: &'a ProtocolState,
        coordinator: &'a Keypair,
        quadratic_voting: bool,
    ) -> CoordinatorResult<Self> {
        state.poll.validate().map_err(|e| {
            CoordinatorError::Precondition(format!("unsupported poll parameters: {:#}", e))
        })?;
        let depths = state.poll.tree_depths;
        let state_tree = state.state_tree()?;
        let blank_ballot = Ballot::blank(depths.vote_option_tree_depth);

        let mut ballot_tree = QuinaryTree::new(depths.state_tree_depth, blank_ballot.hash());
        let mut ballots = Vec::with_capacity(state.state_leaves.len());
        for _ in &state.state_leaves {
            ballot_tree.insert(blank_ballot.hash()).map_err(tree_error)?;
            ballots.push(blank_ballot.clone());
        }

        let salts = SaltSource::new(coordinator);
        let sb_salt = salts.salt("sb", 0);
        let sb_commitment = hash3(state_tree.root(), ballot_tree.root(), sb_salt);

        Ok(Self {
            poll: &state.poll,
            messages: &state.messages,
            coordinator,
            quadratic_voting,
            salts,
            state_leaves: state.state_leaves.clone(),
            ballots,
            state_tree,
            ballot_tree,
            message_root: state.message_tree()?.root(),
            batch_size: depths.message_batch_size(),
            sb_salt,
            sb_commitment,
            next_batch: 0,
        })
    }

    /// Commitment to state and ballots before any message is applied.
    pub fn current_sb_commitment(&self) -> Fr {
        self.sb_commitment
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.messages.len().div_ceil(self.batch_size)
    }

    pub fn has_unprocessed_batches(&self) -> bool {
        self.next_batch < self.num_batches()
    }

    pub fn process_next_batch(&mut self) -> CoordinatorResult<ProcessedBatch> {
        let batch_index = self.next_batch;
        if batch_index >= self.num_batches() {
            return Err(CoordinatorError::InvalidTransition {
                from: format!("batch {}", batch_index),
                to: "past the last message batch".into(),
            });
        }

        let start = batch_index * self.batch_size;
        let end = (start + self.batch_size).min(self.messages.len());
        let mut batch: Vec<Message> = self.messages[start..end].to_vec();
        let message_count = batch.len();
        batch.resize(self.batch_size, Message::empty());

        let mut batch_tree =
            QuinaryTree::new(self.poll.tree_depths.message_tree_sub_depth, Fr::ZERO);
        for message in &self.messages[start..end] {
            batch_tree.insert(message.hash()).map_err(tree_error)?;
        }

        let state_root_before = self.sb_commitment;
        let mut per_message = Vec::with_capacity(batch.len());
        let mut rejected = Vec::new();
        for (offset, message) in batch.iter().enumerate() {
            let (witness, rejection) = self.apply_message(message)?;
            if let Some(reason) = rejection {
                if !message.is_empty() {
                    warn!(
                        "Ignoring message {} in batch {}: {:?}",
                        start + offset,
                        batch_index,
                        reason
                    );
                }
                rejected.push((start + offset, reason));
            }
            per_message.push(witness);
        }

        let new_sb_salt = self.salts.salt("sb", batch_index + 1);
        let new_sb_commitment = hash3(self.state_tree.root(), self.ballot_tree.root(), new_sb_salt);

        let num_signups = (self.state_leaves.len() - 1) as u64;
        let packed_vals = pack_values(&[
            self.poll.max_values.max_vote_options,
            num_signups,
            start as u64,
            end as u64,
        ]);
        let coord_pub_key_hash = self.coordinator.pub_key.hash();
        let poll_end = Fr::from(self.poll.end_time());
        let public_input_hash = hash_slice(&[
            packed_vals,
            coord_pub_key_hash,
            self.message_root,
            batch_tree.root(),
            state_root_before,
            new_sb_commitment,
            poll_end,
        ]);

        let msgs: Vec<Value> = batch
            .iter()
            .map(|m| {
                let mut fields = vec![m.iv];
                fields.extend_from_slice(&m.data);
                fields.push(m.enc_pub_key.0);
                fields.push(m.enc_pub_key.1);
                dec_all(&fields)
            })
            .collect();

        let circuit_inputs = json!({
            "inputHash": dec(&public_input_hash),
            "packedVals": dec(&packed_vals),
            "pollEndTimestamp": dec(&poll_end),
            "msgRoot": dec(&self.message_root),
            "batchMsgRoot": dec(&batch_tree.root()),
            "coordPubKey": dec_all(&[self.coordinator.pub_key.x(), self.coordinator.pub_key.y()]),
            "currentSbCommitment": dec(&state_root_before),
            "currentSbSalt": dec(&self.sb_salt),
            "newSbCommitment": dec(&new_sb_commitment),
            "newSbSalt": dec(&new_sb_salt),
            "msgs": msgs,
            "messages": per_message,
        });

        debug!(
            "Processed batch {} ({} messages, {} ignored)",
            batch_index,
            message_count,
            rejected.iter().filter(|(i, _)| *i < end).count()
        );

        self.sb_salt = new_sb_salt;
        self.sb_commitment = new_sb_commitment;
        self.next_batch += 1;

        Ok(ProcessedBatch {
            batch_index,
            message_count,
            state_root_before,
            state_root_after: new_sb_commitment,
            public_input_hash,
            circuit_inputs,
            rejected,
        })
    }

    /// Validate one message against current state and apply it if valid.
    /// Returns the per-message witness either way.
    fn apply_message(&mut self, message: &Message) -> CoordinatorResult<(Value, Option<Rejection>)> {
        let opened = if message.is_empty() {
            Err(Rejection::Undecryptable)
        } else {
            message
                .decrypt(&self.coordinator.priv_key)
                .map_err(|_| Rejection::Undecryptable)
        };

        let checked = opened.and_then(|(command, signature)| {
            self.check_command(&command, &signature)
                .map(|new_balance| (command, signature, new_balance))
        });

        // Rejected messages are witnessed against the blank leaf at index 0.
        let index = match &checked {
            Ok((command, _, _)) => command.state_index as usize,
            Err(_) => 0,
        };
        let leaf = self.state_leaves[index].clone();
        let ballot = self.ballots[index].clone();
        let leaf_path = self.state_tree.path(index as u64).map_err(tree_error)?;
        let ballot_path = self.ballot_tree.path(index as u64).map_err(tree_error)?;
        let option = match &checked {
            Ok((command, _, _)) => command.vote_option_index as usize,
            Err(_) => 0,
        };
        let weights = vote_tree(&ballot)?;
        let weight_path = weights.path(option as u64).map_err(tree_error)?;

        let command_json = match &checked {
            Ok((command, signature, _)) => command_witness(command, signature),
            Err(_) => dec_all(&[Fr::ZERO; 12]),
        };

        let witness = json!({
            "command": command_json,
            "stateIndex": index.to_string(),
            "currentStateLeaf": dec_all(&[
                leaf.pub_key.x(),
                leaf.pub_key.y(),
                Fr::from(leaf.voice_credit_balance),
                Fr::from(leaf.timestamp),
            ]),
            "currentStateLeafPathElements": path_json(&leaf_path),
            "currentBallot": dec_all(&[Fr::from(ballot.nonce), ballot.votes_root()]),
            "currentBallotPathElements": path_json(&ballot_path),
            "currentVoteWeight": ballot.votes.get(option).copied().unwrap_or(0).to_string(),
            "currentVoteWeightsPathElements": path_json(&weight_path),
        });

        let (command, _, new_balance) = match checked {
            Ok(valid) => valid,
            Err(reason) => return Ok((witness, Some(reason))),
        };

        let mut new_leaf = leaf;
        new_leaf.pub_key = command.new_pub_key;
        new_leaf.voice_credit_balance = new_balance;
        self.state_tree
            .update(index as u64, new_leaf.hash())
            .map_err(tree_error)?;
        self.state_leaves[index] = new_leaf;

        let mut new_ballot = ballot;
        new_ballot.nonce += 1;
        new_ballot
            .set_vote(option, command.new_vote_weight)
            .map_err(tree_error)?;
        self.ballot_tree
            .update(index as u64, new_ballot.hash())
            .map_err(tree_error)?;
        self.ballots[index] = new_ballot;

        Ok((witness, None))
    }

    fn check_command(&self, command: &Command, signature: &Signature) -> Result<u64, Rejection> {
        let index = command.state_index as usize;
        if index == 0 || index >= self.state_leaves.len() {
            return Err(Rejection::InvalidStateIndex);
        }
        let leaf = &self.state_leaves[index];
        if !command.verify(&leaf.pub_key, signature) {
            return Err(Rejection::InvalidSignature);
        }
        let ballot = &self.ballots[index];
        if command.nonce != ballot.nonce + 1 {
            return Err(Rejection::InvalidNonce);
        }
        let option = command.vote_option_index;
        if option >= self.poll.max_values.max_vote_options || option as usize >= ballot.votes.len()
        {
            return Err(Rejection::InvalidVoteOption);
        }
        if command.poll_id != self.poll.poll_id {
            return Err(Rejection::WrongPoll);
        }

        let balance = leaf.voice_credit_balance as i128;
        let previous = ballot.votes[option as usize] as i128;
        let next = command.new_vote_weight as i128;
        let remaining = if self.quadratic_voting {
            balance + previous * previous - next * next
        } else {
            balance + previous - next
        };
        u64::try_from(remaining).map_err(|_| Rejection::InsufficientCredits)
    }

    pub fn finish(self) -> CoordinatorResult<ProcessedState> {
        if self.has_unprocessed_batches() {
            return Err(CoordinatorError::InvalidTransition {
                from: format!("batch {} of {}", self.next_batch, self.num_batches()),
                to: "tallying".into(),
            });
        }
        Ok(ProcessedState {
            poll: self.poll.clone(),
            state_root: self.state_tree.root(),
            ballot_root: self.ballot_tree.root(),
            state_leaves: self.state_leaves,
            ballots: self.ballots,
            sb_salt: self.sb_salt,
            sb_commitment: self.sb_commitment,
        })
    }
}

fn command_witness(command: &Command, signature: &Signature) -> Value {
    let (x, y) = command.new_pub_key.xy();
    dec_all(&[
        Fr::from(command.state_index),
        Fr::from(command.vote_option_index),
        Fr::from(command.new_vote_weight),
        Fr::from(command.nonce),
        Fr::from(command.poll_id),
        command.salt,
        x,
        y,
        signature.r.0,
        signature.r.1,
        signature.s_lo,
        signature.s_hi,
    ])
}

/// Circuit inputs and commitments for one tally batch.
#[derive(Clone, Debug, PartialEq)]
pub struct TallyBatch {
    pub batch_index: usize,
    pub tally_commitment_before: Fr,
    pub tally_commitment_after: Fr,
    pub public_input_hash: Fr,
    pub circuit_inputs: Value,
}

/// Running totals with the salts and commitments of the latest batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TallyResult {
    pub results: Vec<u128>,
    pub total_spent: u128,
    /// Only tracked under quadratic voting.
    pub per_vo_spent: Option<Vec<u128>>,
    pub results_salt: Fr,
    pub spent_salt: Fr,
    pub per_vo_spent_salt: Fr,
    pub results_commitment: Fr,
    pub spent_commitment: Fr,
    pub per_vo_spent_commitment: Fr,
    pub tally_commitment: Fr,
}

impl TallyResult {
    fn empty(options: usize, quadratic_voting: bool) -> Self {
        Self {
            results: vec![0; options],
            total_spent: 0,
            per_vo_spent: quadratic_voting.then(|| vec![0; options]),
            results_salt: Fr::ZERO,
            spent_salt: Fr::ZERO,
            per_vo_spent_salt: Fr::ZERO,
            results_commitment: Fr::ZERO,
            spent_commitment: Fr::ZERO,
            per_vo_spent_commitment: Fr::ZERO,
            tally_commitment: Fr::ZERO,
        }
    }
}

fn vector_root(values: &[u128], depth: usize) -> CoordinatorResult<Fr> {
    let mut tree = QuinaryTree::new(depth, Fr::ZERO);
    for value in values {
        tree.insert(Fr::from_u128(*value)).map_err(tree_error)?;
    }
    Ok(tree.root())
}

pub struct Tallier<'a> {
    processed: &'a ProcessedState,
    quadratic_voting: bool,
    salts: SaltSource,
    batch_size: usize,
    tally: TallyResult,
    next_batch: usize,
}

impl<'a> Tallier<'a> {
    pub fn new(processed: &'a ProcessedState, coordinator: &Keypair, quadratic_voting: bool) -> Self {
        let depths = processed.poll.tree_depths;
        let options = depths.vote_option_capacity();
        Self {
            processed,
            quadratic_voting,
            salts: SaltSource::new(coordinator),
            batch_size: depths.tally_batch_size(),
            tally: TallyResult::empty(options, quadratic_voting),
            next_batch: 0,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.processed.ballots.len().div_ceil(self.batch_size)
    }

    pub fn has_untallied_batches(&self) -> bool {
        self.next_batch < self.num_batches()
    }

    pub fn current_commitment(&self) -> Fr {
        self.tally.tally_commitment
    }

    pub fn tally_next_batch(&mut self) -> CoordinatorResult<TallyBatch> {
        let batch_index = self.next_batch;
        if batch_index >= self.num_batches() {
            return Err(CoordinatorError::InvalidTransition {
                from: format!("tally batch {}", batch_index),
                to: "past the last ballot batch".into(),
            });
        }
        let depths = self.processed.poll.tree_depths;
        let start = batch_index * self.batch_size;
        let end = (start + self.batch_size).min(self.processed.ballots.len());
        let ballots = &self.processed.ballots[start..end];

        let before = self.tally.clone();
        let mut next = before.clone();
        for ballot in ballots {
            for (option, weight) in ballot.votes.iter().enumerate() {
                let weight = *weight as u128;
                next.results[option] += weight;
                if let Some(per_vo) = next.per_vo_spent.as_mut() {
                    per_vo[option] += weight * weight;
                    next.total_spent += weight * weight;
                } else {
                    next.total_spent += weight;
                }
            }
        }

        next.results_salt = self.salts.salt("results", batch_index);
        next.spent_salt = self.salts.salt("spent", batch_index);
        next.results_commitment = hash2(
            vector_root(&next.results, depths.vote_option_tree_depth)?,
            next.results_salt,
        );
        next.spent_commitment = hash2(Fr::from_u128(next.total_spent), next.spent_salt);
        next.tally_commitment = match next.per_vo_spent.as_ref() {
            Some(per_vo) => {
                next.per_vo_spent_salt = self.salts.salt("per-vo-spent", batch_index);
                next.per_vo_spent_commitment = hash2(
                    vector_root(per_vo, depths.vote_option_tree_depth)?,
                    next.per_vo_spent_salt,
                );
                hash3(
                    next.results_commitment,
                    next.spent_commitment,
                    next.per_vo_spent_commitment,
                )
            }
            None => hash2(next.results_commitment, next.spent_commitment),
        };

        let num_signups = (self.processed.ballots.len() - 1) as u64;
        let packed_vals = pack_values(&[(start / self.batch_size) as u64, num_signups]);
        let public_input_hash = hash_slice(&[
            self.processed.sb_commitment,
            before.tally_commitment,
            next.tally_commitment,
            packed_vals,
        ]);

        let ballot_json: Vec<Value> = ballots
            .iter()
            .map(|b| dec_all(&[Fr::from(b.nonce), b.votes_root()]))
            .collect();
        let votes_json: Vec<Value> = ballots
            .iter()
            .map(|b| Value::Array(b.votes.iter().map(|v| Value::String(v.to_string())).collect()))
            .collect();
        let u128s = |values: &[u128]| -> Value {
            Value::Array(values.iter().map(|v| Value::String(v.to_string())).collect())
        };

        let circuit_inputs = json!({
            "inputHash": dec(&public_input_hash),
            "packedVals": dec(&packed_vals),
            "sbCommitment": dec(&self.processed.sb_commitment),
            "sbSalt": dec(&self.processed.sb_salt),
            "stateRoot": dec(&self.processed.state_root),
            "ballotRoot": dec(&self.processed.ballot_root),
            "currentTallyCommitment": dec(&before.tally_commitment),
            "newTallyCommitment": dec(&next.tally_commitment),
            "ballots": ballot_json,
            "votes": votes_json,
            "currentResults": u128s(&before.results),
            "currentResultsRootSalt": dec(&before.results_salt),
            "newResultsRootSalt": dec(&next.results_salt),
            "currentSpentVoiceCreditSubtotal": before.total_spent.to_string(),
            "currentSpentVoiceCreditSubtotalSalt": dec(&before.spent_salt),
            "newSpentVoiceCreditSubtotalSalt": dec(&next.spent_salt),
            "currentPerVOSpentVoiceCredits": before.per_vo_spent.as_deref().map(u128s).unwrap_or(Value::Null),
            "currentPerVOSpentVoiceCreditsRootSalt": dec(&before.per_vo_spent_salt),
            "newPerVOSpentVoiceCreditsRootSalt": dec(&next.per_vo_spent_salt),
        });

        debug!("Tallied ballots {}..{} in batch {}", start, end, batch_index);

        self.tally = next;
        self.next_batch += 1;

        Ok(TallyBatch {
            batch_index,
            tally_commitment_before: before.tally_commitment,
            tally_commitment_after: self.tally.tally_commitment,
            public_input_hash,
            circuit_inputs,
        })
    }

    pub fn finish(self) -> CoordinatorResult<TallyResult> {
        if self.has_untallied_batches() {
            return Err(CoordinatorError::InvalidTransition {
                from: format!("tally batch {} of {}", self.next_batch, self.num_batches()),
                to: "done".into(),
            });
        }
        Ok(self.tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maci_common::{MaxValues, TreeDepths};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        coordinator: Keypair,
        voters: Vec<Keypair>,
        state: ProtocolState,
        rng: StdRng,
    }

    fn fixture(balances: &[u64]) -> Fixture {
        let mut rng = StdRng::seed_from_u64(99);
        let coordinator = Keypair::random(&mut rng);
        let voters: Vec<Keypair> = balances.iter().map(|_| Keypair::random(&mut rng)).collect();
        let mut state_leaves = vec![StateLeaf::blank()];
        for (voter, balance) in voters.iter().zip(balances) {
            state_leaves.push(StateLeaf::new(voter.pub_key, *balance, 1));
        }
        let state = ProtocolState {
            poll: PollInfo {
                poll_id: 0,
                deploy_time: 100,
                duration: 50,
                tree_depths: TreeDepths {
                    state_tree_depth: 2,
                    int_state_tree_depth: 1,
                    message_tree_sub_depth: 1,
                    message_tree_depth: 2,
                    vote_option_tree_depth: 1,
                },
                max_values: MaxValues {
                    max_messages: 25,
                    max_vote_options: 5,
                },
                coordinator_pub_key: coordinator.pub_key,
            },
            state_leaves,
            messages: Vec::new(),
            from_block: 0,
            to_block: 0,
        };
        Fixture {
            coordinator,
            voters,
            state,
            rng,
        }
    }

    fn vote(f: &mut Fixture, voter: usize, option: u64, weight: u64, nonce: u64) {
        let ephemeral = Keypair::random(&mut f.rng);
        let command = Command {
            state_index: voter as u64 + 1,
            new_pub_key: f.voters[voter].pub_key,
            vote_option_index: option,
            new_vote_weight: weight,
            nonce,
            poll_id: 0,
            salt: Fr::from(nonce + 1000),
        };
        let message = command
            .sign_and_encrypt(
                &f.voters[voter].priv_key,
                &ephemeral,
                &f.coordinator.pub_key,
                Fr::from(f.state.messages.len() as u64 + 1),
            )
            .unwrap();
        f.state.messages.push(message);
    }

    fn run_all(f: &Fixture, qv: bool) -> (Vec<ProcessedBatch>, ProcessedState) {
        let mut processor = MessageProcessor::new(&f.state, &f.coordinator, qv).unwrap();
        let mut batches = Vec::new();
        while processor.has_unprocessed_batches() {
            batches.push(processor.process_next_batch().unwrap());
        }
        (batches, processor.finish().unwrap())
    }

    #[test]
    fn valid_votes_update_ballots_and_balances() {
        let mut f = fixture(&[100, 100]);
        vote(&mut f, 0, 2, 5, 1);
        vote(&mut f, 1, 4, 3, 1);
        let (batches, processed) = run_all(&f, true);

        assert_eq!(batches.len(), 1);
        assert_eq!(processed.ballots[1].votes[2], 5);
        assert_eq!(processed.ballots[1].nonce, 1);
        assert_eq!(processed.state_leaves[1].voice_credit_balance, 75);
        assert_eq!(processed.state_leaves[2].voice_credit_balance, 91);
        // Three padding slots are ignored, nothing else.
        assert_eq!(batches[0].rejected.len(), 3);
    }

    #[test]
    fn invalid_messages_leave_state_untouched() {
        let mut f = fixture(&[10]);
        vote(&mut f, 0, 1, 4, 2); // nonce should be 1
        vote(&mut f, 0, 1, 4, 1); // 16 credits > 10
        vote(&mut f, 0, 9, 1, 1); // option out of range
        let (batches, processed) = run_all(&f, true);

        let reasons: Vec<Rejection> = batches[0].rejected.iter().take(3).map(|(_, r)| *r).collect();
        assert_eq!(
            reasons,
            vec![
                Rejection::InvalidNonce,
                Rejection::InsufficientCredits,
                Rejection::InvalidVoteOption
            ]
        );
        assert_eq!(processed.ballots[1], Ballot::blank(1));
        assert_eq!(processed.state_leaves[1].voice_credit_balance, 10);
    }

    #[test]
    fn linear_voting_charges_weight_not_square() {
        let mut f = fixture(&[10]);
        vote(&mut f, 0, 1, 4, 1);
        let (_, processed) = run_all(&f, false);
        assert_eq!(processed.state_leaves[1].voice_credit_balance, 6);
    }

    #[test]
    fn batches_chain_and_are_deterministic() {
        let mut f = fixture(&[100, 100, 100]);
        for i in 0..7u64 {
            vote(&mut f, (i % 3) as usize, i % 5, 1, i / 3 + 1);
        }
        let (first, _) = run_all(&f, true);
        let (second, _) = run_all(&f, true);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].state_root_before, first[0].state_root_after);
        let roots = |batches: &[ProcessedBatch]| -> Vec<Fr> {
            batches.iter().map(|b| b.state_root_after).collect()
        };
        assert_eq!(roots(&first), roots(&second));
    }

    #[test]
    fn tally_sums_votes_and_spent_credits() {
        let mut f = fixture(&[100, 100]);
        vote(&mut f, 0, 2, 5, 1);
        vote(&mut f, 1, 2, 3, 1);
        let (_, processed) = run_all(&f, true);

        let mut tallier = Tallier::new(&processed, &f.coordinator, true);
        let mut batches = Vec::new();
        while tallier.has_untallied_batches() {
            batches.push(tallier.tally_next_batch().unwrap());
        }
        assert_eq!(batches[0].tally_commitment_before, Fr::ZERO);
        for pair in batches.windows(2) {
            assert_eq!(pair[1].tally_commitment_before, pair[0].tally_commitment_after);
        }
        let result = tallier.finish().unwrap();
        assert_eq!(result.results[2], 8);
        assert_eq!(result.total_spent, 34);
        assert_eq!(result.per_vo_spent.unwrap()[2], 34);
    }

    #[test]
    fn pack_values_places_slots_50_bits_apart() {
        let packed = pack_values(&[1, 1]);
        assert_eq!(packed, Fr::ONE + Fr::from(1u64 << 50));
    }
}
