//! Shared fakes for coordinator tests: an in-memory poll contract, a mock
//! prover and deterministic keys.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use halo2curves_axiom::ff::Field;
use maci_common::{
    fr_from_decimal, Command, Fr, Keypair, MaxValues, Message, PollInfo, ProverOutput, PubKey,
    QuinaryTree, StateLeaf, TreeDepths,
};
use maci_coordinator::chain::{
    encode_publish_message, encode_sign_up, publish_message_topic, sign_up_topic,
};
use maci_coordinator::{
    encrypt_private_key, ArtifactResolver, ArtifactSet, CoordinatorError, CoordinatorResult,
    PollEndpoint, PollWriter, ProofRequest, ProofStage, Prover, RawLog,
};
use once_cell::sync::Lazy;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tokio_util::sync::CancellationToken;

pub const DEPLOY_TIME: u64 = 1_700_000_000;
pub const POLL_DURATION: u64 = 3_600;
pub const DEFAULT_BALANCE: u64 = 100;

static COORDINATOR: Lazy<Keypair> = Lazy::new(|| keypair_from_seed(0));

fn keypair_from_seed(seed: u64) -> Keypair {
    let mut rng = ChaCha20Rng::seed_from_u64(0x6d61_6369_0000_0000 ^ seed);
    Keypair::random(&mut rng)
}

/// The coordinator key every fixture poll is deployed with.
pub fn coordinator_keypair() -> Keypair {
    COORDINATOR.clone()
}

/// Deterministic voter key; `index` starts at 1 like state indices.
pub fn voter_keypair(index: u64) -> Keypair {
    keypair_from_seed(1_000 + index)
}

/// Small trees: batches of 5 messages and 5 ballots, 5 vote options.
pub fn small_depths() -> TreeDepths {
    TreeDepths {
        state_tree_depth: 2,
        int_state_tree_depth: 1,
        message_tree_sub_depth: 1,
        message_tree_depth: 2,
        vote_option_tree_depth: 1,
    }
}

pub fn poll_info(coordinator: &PubKey) -> PollInfo {
    PollInfo {
        poll_id: 0,
        deploy_time: DEPLOY_TIME,
        duration: POLL_DURATION,
        tree_depths: small_depths(),
        max_values: MaxValues {
            max_messages: 25,
            max_vote_options: 5,
        },
        coordinator_pub_key: *coordinator,
    }
}

/// Artifact sets for the mock prover; nothing is read from disk.
pub fn mock_artifacts(quadratic_voting: bool) -> (ArtifactSet, ArtifactSet) {
    let resolver = ArtifactResolver::new("/nonexistent/zkeys");
    let process = resolver
        .resolve("ProcessMessages_2-1-1-2", quadratic_voting)
        .expect("fixture circuit name");
    let tally = resolver
        .resolve("TallyVotes_2-1-1", quadratic_voting)
        .expect("fixture circuit name");
    (process, tally)
}

/// Write a hex key-encryption key under `dir` and return its path with the
/// ciphertext of `keypair`'s private key.
pub fn encrypted_key_file(dir: &Path, keypair: &Keypair) -> Result<(PathBuf, String)> {
    let kek: [u8; 32] = *blake3::hash(b"fixture key-encryption key").as_bytes();
    let path = dir.join("coordinator.key");
    std::fs::write(&path, hex::encode(kek)).context("write key file")?;
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let ciphertext = encrypt_private_key(&kek, &keypair.priv_key, &mut rng)?;
    Ok((path, ciphertext))
}

/// Signed and encrypted vote. `seed` picks the ephemeral key and iv.
#[allow(clippy::too_many_arguments)]
pub fn vote_message(
    voter: &Keypair,
    state_index: u64,
    vote_option_index: u64,
    new_vote_weight: u64,
    nonce: u64,
    poll_id: u64,
    coordinator: &PubKey,
    seed: u64,
) -> Message {
    let mut rng = ChaCha20Rng::seed_from_u64(0x766f_7465 ^ seed);
    let ephemeral = Keypair::random(&mut rng);
    let command = Command {
        state_index,
        new_pub_key: voter.pub_key,
        vote_option_index,
        new_vote_weight,
        nonce,
        poll_id,
        salt: Fr::from(seed + 1),
    };
    command
        .sign_and_encrypt(&voter.priv_key, &ephemeral, coordinator, Fr::from(seed))
        .expect("fixture command fits packed fields")
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY POLL
// ═══════════════════════════════════════════════════════════════════════════════

struct PollContract {
    poll: PollInfo,
    logs: Vec<RawLog>,
    state_tree: QuinaryTree,
    message_tree: QuinaryTree,
    num_signups: u64,
    num_messages: u64,
    state_merged: bool,
    messages_merged: bool,
    events_per_block: u64,
    logs_per_transaction: u64,
    reverse_log_order: bool,
    fail_fetches: bool,
}

impl PollContract {
    /// Next chain position: put up to `logs_per_transaction` logs in the
    /// current transaction and up to `events_per_block` transactions in the
    /// current block before moving on. Log indices run across the block.
    fn next_log(&self, topic0: [u8; 32], data: Vec<u8>) -> RawLog {
        let (block_number, transaction_index, log_index) = match self.logs.last() {
            Some(last) => {
                let key = (last.block_number, last.transaction_index);
                let in_transaction = self
                    .logs
                    .iter()
                    .rev()
                    .take_while(|log| (log.block_number, log.transaction_index) == key)
                    .count() as u64;
                if in_transaction < self.logs_per_transaction {
                    (last.block_number, last.transaction_index, last.log_index + 1)
                } else if last.transaction_index + 1 < self.events_per_block {
                    (last.block_number, last.transaction_index + 1, last.log_index + 1)
                } else {
                    (last.block_number + 1, 0, 0)
                }
            }
            None => (1, 0, 0),
        };
        RawLog {
            block_number,
            transaction_index,
            log_index,
            topic0,
            data,
        }
    }
}

/// A poll contract kept in memory. It emits the same ABI-encoded logs and
/// keeps the same trees as the real contract, so replicated state can be
/// checked against it.
pub struct InMemoryPoll {
    contract: Mutex<PollContract>,
    fetch_calls: AtomicUsize,
    fetched_windows: Mutex<Vec<(u64, u64)>>,
}

impl InMemoryPoll {
    pub fn new(poll: PollInfo) -> Self {
        let depths = poll.tree_depths;
        let mut state_tree = QuinaryTree::new(depths.state_tree_depth, StateLeaf::blank().hash());
        state_tree
            .insert(StateLeaf::blank().hash())
            .expect("empty state tree has room for the blank leaf");
        Self {
            contract: Mutex::new(PollContract {
                logs: Vec::new(),
                state_tree,
                message_tree: QuinaryTree::new(depths.message_tree_depth, Fr::ZERO),
                num_signups: 0,
                num_messages: 0,
                state_merged: false,
                messages_merged: false,
                events_per_block: 1,
                logs_per_transaction: 1,
                reverse_log_order: false,
                fail_fetches: false,
                poll,
            }),
            fetch_calls: AtomicUsize::new(0),
            fetched_windows: Mutex::new(Vec::new()),
        }
    }

    /// Fixture poll owned by [`coordinator_keypair`].
    pub fn with_fixture_coordinator() -> Self {
        Self::new(poll_info(&coordinator_keypair().pub_key))
    }

    fn contract(&self) -> MutexGuard<'_, PollContract> {
        self.contract.lock().expect("poll contract lock")
    }

    pub fn set_events_per_block(&self, events_per_block: u64) {
        self.contract().events_per_block = events_per_block.max(1);
    }

    /// Batch several events into one transaction, as a multicall would.
    pub fn set_logs_per_transaction(&self, logs_per_transaction: u64) {
        self.contract().logs_per_transaction = logs_per_transaction.max(1);
    }

    /// Return each window's logs newest first.
    pub fn set_reverse_log_order(&self, reverse: bool) {
        self.contract().reverse_log_order = reverse;
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.contract().fail_fetches = fail;
    }

    pub fn merge_state(&self) {
        self.contract().state_merged = true;
    }

    pub fn merge_messages(&self) {
        self.contract().messages_merged = true;
    }

    pub fn merge(&self) {
        self.merge_state();
        self.merge_messages();
    }

    pub fn sign_up_with_timestamp(&self, pub_key: &PubKey, balance: u64, timestamp: u64) -> u64 {
        let mut contract = self.contract();
        contract.num_signups += 1;
        let state_index = contract.num_signups;
        contract
            .state_tree
            .insert(StateLeaf::new(*pub_key, balance, timestamp).hash())
            .expect("state tree full");
        let log = contract.next_log(
            sign_up_topic(),
            encode_sign_up(state_index, pub_key, balance, timestamp),
        );
        contract.logs.push(log);
        state_index
    }

    pub fn publish(&self, message: &Message) {
        let mut contract = self.contract();
        contract.num_messages += 1;
        contract
            .message_tree
            .insert(message.hash())
            .expect("message tree full");
        let log = contract.next_log(publish_message_topic(), encode_publish_message(message));
        contract.logs.push(log);
    }

    /// Append a log the poll never emits.
    pub fn push_raw_log(&self, topic0: [u8; 32], data: Vec<u8>) {
        let mut contract = self.contract();
        let log = contract.next_log(topic0, data);
        contract.logs.push(log);
    }

    pub fn head_block(&self) -> u64 {
        let contract = self.contract();
        contract.logs.last().map_or(1, |log| log.block_number)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn fetched_windows(&self) -> Vec<(u64, u64)> {
        self.fetched_windows.lock().expect("windows lock").clone()
    }
}

#[async_trait]
impl PollEndpoint for InMemoryPoll {
    async fn poll_id(&self) -> CoordinatorResult<u64> {
        Ok(self.contract().poll.poll_id)
    }

    async fn num_signups(&self) -> CoordinatorResult<u64> {
        Ok(self.contract().num_signups)
    }

    async fn num_messages(&self) -> CoordinatorResult<u64> {
        Ok(self.contract().num_messages)
    }

    async fn state_aq_merged(&self) -> CoordinatorResult<bool> {
        Ok(self.contract().state_merged)
    }

    async fn merged_state_root(&self) -> CoordinatorResult<Fr> {
        let contract = self.contract();
        Ok(if contract.state_merged {
            contract.state_tree.root()
        } else {
            Fr::ZERO
        })
    }

    async fn tree_depths(&self) -> CoordinatorResult<TreeDepths> {
        Ok(self.contract().poll.tree_depths)
    }

    async fn message_aq_main_root(&self, depth: usize) -> CoordinatorResult<Fr> {
        let contract = self.contract();
        let merged_here =
            contract.messages_merged && depth == contract.poll.tree_depths.message_tree_depth;
        Ok(if merged_here {
            contract.message_tree.root()
        } else {
            Fr::ZERO
        })
    }

    async fn max_values(&self) -> CoordinatorResult<MaxValues> {
        Ok(self.contract().poll.max_values)
    }

    async fn coordinator_pub_key(&self) -> CoordinatorResult<PubKey> {
        Ok(self.contract().poll.coordinator_pub_key)
    }

    async fn deploy_time_and_duration(&self) -> CoordinatorResult<(u64, u64)> {
        let contract = self.contract();
        Ok((contract.poll.deploy_time, contract.poll.duration))
    }

    async fn block_number(&self) -> CoordinatorResult<u64> {
        Ok(self.head_block())
    }

    async fn fetch_logs(&self, from_block: u64, to_block: u64) -> CoordinatorResult<Vec<RawLog>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetched_windows
            .lock()
            .expect("windows lock")
            .push((from_block, to_block));

        let contract = self.contract();
        if contract.fail_fetches {
            return Err(CoordinatorError::ChainIo("connection reset by peer".into()));
        }
        let mut logs: Vec<RawLog> = contract
            .logs
            .iter()
            .filter(|log| (from_block..=to_block).contains(&log.block_number))
            .cloned()
            .collect();
        if contract.reverse_log_order {
            logs.reverse();
        }
        Ok(logs)
    }
}

#[async_trait]
impl PollWriter for InMemoryPoll {
    async fn num_signups(&self) -> CoordinatorResult<u64> {
        Ok(self.contract().num_signups)
    }

    async fn num_messages(&self) -> CoordinatorResult<u64> {
        Ok(self.contract().num_messages)
    }

    async fn sign_up(&self, pub_key: &PubKey, voice_credit_balance: u64) -> CoordinatorResult<()> {
        let timestamp = {
            let contract = self.contract();
            contract.poll.deploy_time + contract.num_signups
        };
        self.sign_up_with_timestamp(pub_key, voice_credit_balance, timestamp);
        Ok(())
    }

    async fn publish_message(&self, message: &Message) -> CoordinatorResult<()> {
        self.publish(message);
        Ok(())
    }

    async fn state_root(&self) -> CoordinatorResult<Fr> {
        Ok(self.contract().state_tree.root())
    }

    async fn message_root(&self) -> CoordinatorResult<Fr> {
        Ok(self.contract().message_tree.root())
    }
}

/// A fixture poll with signed-up voters, ready for votes.
pub struct Scenario {
    pub coordinator: Keypair,
    pub voters: Vec<Keypair>,
    pub poll: InMemoryPoll,
    next_seed: u64,
}

impl Scenario {
    pub fn new(num_voters: u64, balance: u64) -> Self {
        let coordinator = coordinator_keypair();
        let poll = InMemoryPoll::new(poll_info(&coordinator.pub_key));
        let voters: Vec<Keypair> = (1..=num_voters).map(voter_keypair).collect();
        for (i, voter) in voters.iter().enumerate() {
            poll.sign_up_with_timestamp(&voter.pub_key, balance, DEPLOY_TIME + i as u64);
        }
        Self {
            coordinator,
            voters,
            poll,
            next_seed: 1,
        }
    }

    /// Publish a vote from voter `voter` (1-based state index).
    pub fn vote(&mut self, voter: u64, option: u64, weight: u64, nonce: u64) -> Message {
        let seed = self.next_seed;
        self.next_seed += 1;
        let message = vote_message(
            &self.voters[(voter - 1) as usize],
            voter,
            option,
            weight,
            nonce,
            0,
            &self.coordinator.pub_key,
            seed,
        );
        self.poll.publish(&message);
        message
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MOCK PROVER
// ═══════════════════════════════════════════════════════════════════════════════

/// Answers every request with a placeholder proof whose only public signal
/// is the request's `inputHash`.
#[derive(Default)]
pub struct MockProver {
    calls: Mutex<Vec<(ProofStage, usize)>>,
    fail_at: Option<(ProofStage, usize)>,
    cancel_after: Option<(ProofStage, usize, CancellationToken)>,
    tamper_signals: bool,
}

impl MockProver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_at(stage: ProofStage, batch: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_at: Some((stage, batch)),
            ..Self::default()
        })
    }

    /// Cancel `token` once `batch` of `stage` has been proved.
    pub fn cancelling_after(stage: ProofStage, batch: usize, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cancel_after: Some((stage, batch, token)),
            ..Self::default()
        })
    }

    /// Return public signals that commit to something else.
    pub fn with_wrong_signals() -> Arc<Self> {
        Arc::new(Self {
            tamper_signals: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<(ProofStage, usize)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl Prover for MockProver {
    async fn prove(&self, request: ProofRequest<'_>) -> CoordinatorResult<ProverOutput> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((request.stage, request.batch));

        if self.fail_at == Some((request.stage, request.batch)) {
            return Err(CoordinatorError::Proving {
                stage: request.stage,
                batch: request.batch,
                reason: "mock prover failure".into(),
            });
        }

        let input_hash = request
            .inputs
            .get("inputHash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoordinatorError::Proving {
                stage: request.stage,
                batch: request.batch,
                reason: "inputs carry no inputHash".into(),
            })
            .and_then(|raw| {
                fr_from_decimal(raw).map_err(|e| CoordinatorError::Proving {
                    stage: request.stage,
                    batch: request.batch,
                    reason: e.to_string(),
                })
            })?;
        let signal = if self.tamper_signals {
            input_hash + Fr::ONE
        } else {
            input_hash
        };

        if let Some((stage, batch, token)) = &self.cancel_after {
            if *stage == request.stage && *batch == request.batch {
                token.cancel();
            }
        }

        Ok(ProverOutput {
            proof: serde_json::json!({
                "protocol": "mock",
                "stage": request.stage.to_string(),
                "batch": request.batch,
            }),
            public_signals: vec![signal],
        })
    }
}
