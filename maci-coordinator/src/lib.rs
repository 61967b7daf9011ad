//! maci-coordinator
//!
//! Coordinator pipeline for a MACI poll:
//! 1. Gate on both accumulator queues being merged
//! 2. Replicate signups and messages from the poll's event log
//! 3. Replay message processing locally and prove it batch by batch
//! 4. Tally the ballots and prove the tally batch by batch
//! 5. Publish proofs and the tally once the whole chain is proved

pub mod artifacts;
pub mod chain;
pub mod config;
pub mod error;
pub mod keys;
pub mod orchestrator;
pub mod processing;
pub mod prover;
pub mod replay;
pub mod replicator;
pub mod validator;

pub use artifacts::{family_name, ArtifactResolver, ArtifactSet, WitnessGenerator};
pub use chain::{EthersPoll, EthersPollWriter, PollEndpoint, PollEvent, PollWriter, RawLog};
pub use config::{CoordinatorConfig, ReplayConfig};
pub use error::{CoordinatorError, CoordinatorResult, ProofStage};
pub use keys::{encrypt_private_key, load_private_key};
pub use orchestrator::{tally_document, write_outputs, BatchProofOrchestrator, Phase, RunOutput};
pub use processing::{MessageProcessor, ProcessedState, Rejection, Tallier, TallyResult};
pub use prover::{ExternalProver, ProofRequest, Prover};
pub use replay::{load_replay_document, replay, ReplaySummary};
pub use replicator::{block_windows, replicate, ChainStateReplicator, ProtocolState};
pub use validator::assert_preconditions;
