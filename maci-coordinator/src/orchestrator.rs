//! Drives one poll from the finalization gate to the published tally.
//!
//! The run is a strict phase machine:
//!
//! ```text
//! Init -> PreconditionsOk -> StateReplicated -> ProcessingBatches -> Tallying -> Done
//! ```
//!
//! Any non-terminal phase may move to `Failed`. Batches are proved one at a
//! time and each batch's output root is the next batch's input root. Nothing
//! is written to disk until the whole chain has been proved.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use maci_common::{
    CommittedSpent, CommittedTally, Fr, Keypair, ProcessProof, ProverOutput, TallyDocument,
    TallyProof,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::artifacts::ArtifactSet;
use crate::chain::PollEndpoint;
use crate::error::{CoordinatorError, CoordinatorResult, ProofStage};
use crate::processing::{MessageProcessor, ProcessedState, Tallier, TallyResult};
use crate::prover::{ProofRequest, Prover};
use crate::replicator::{ChainStateReplicator, ProtocolState};
use crate::validator::assert_preconditions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    PreconditionsOk,
    StateReplicated,
    ProcessingBatches,
    Tallying,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Init, PreconditionsOk)
            | (PreconditionsOk, StateReplicated)
            | (StateReplicated, ProcessingBatches)
            | (ProcessingBatches, Tallying)
            | (Tallying, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::PreconditionsOk => "preconditions-ok",
            Phase::StateReplicated => "state-replicated",
            Phase::ProcessingBatches => "processing-batches",
            Phase::Tallying => "tallying",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything a successful run produces.
#[derive(Clone, Debug)]
pub struct RunOutput {
    pub poll_id: u64,
    pub process_proofs: Vec<ProcessProof>,
    pub tally_proofs: Vec<TallyProof>,
    pub tally: TallyResult,
}

pub struct BatchProofOrchestrator {
    prover: Arc<dyn Prover>,
    process_artifacts: ArtifactSet,
    tally_artifacts: ArtifactSet,
    quadratic_voting: bool,
    cancel: CancellationToken,
    phase: Phase,
}

impl BatchProofOrchestrator {
    pub fn new(
        prover: Arc<dyn Prover>,
        process_artifacts: ArtifactSet,
        tally_artifacts: ArtifactSet,
        quadratic_voting: bool,
    ) -> Self {
        Self {
            prover,
            process_artifacts,
            tally_artifacts,
            quadratic_voting,
            cancel: CancellationToken::new(),
            phase: Phase::Init,
        }
    }

    /// Use an external token; cancellation is honoured between batches.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn transition(&mut self, next: Phase) -> CoordinatorResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(CoordinatorError::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        info!("Phase {} -> {}", self.phase, next);
        self.phase = next;
        Ok(())
    }

    fn fail(&mut self, err: &CoordinatorError) {
        if !self.phase.is_terminal() {
            error!(
                code = err.error_code(),
                batch = ?err.batch(),
                "Run failed during {}: {}",
                self.phase,
                err
            );
            self.phase = Phase::Failed;
        }
    }

    fn check_cancelled(&self, batch: usize) -> CoordinatorResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled { batch });
        }
        Ok(())
    }

    /// Full pipeline for one poll. On error the orchestrator ends in
    /// `Failed` and nothing has been written.
    pub async fn run(
        &mut self,
        endpoint: &dyn PollEndpoint,
        replicator: &ChainStateReplicator,
        coordinator: &Keypair,
        start_block: u64,
        end_block: Option<u64>,
    ) -> CoordinatorResult<RunOutput> {
        let result = self
            .run_inner(endpoint, replicator, coordinator, start_block, end_block)
            .await;
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    async fn run_inner(
        &mut self,
        endpoint: &dyn PollEndpoint,
        replicator: &ChainStateReplicator,
        coordinator: &Keypair,
        start_block: u64,
        end_block: Option<u64>,
    ) -> CoordinatorResult<RunOutput> {
        self.check_preconditions(endpoint).await?;
        let state = self
            .replicate_state(endpoint, replicator, start_block, end_block)
            .await?;
        let (process_proofs, processed) = self
            .generate_message_processing_proofs(&state, coordinator)
            .await?;
        let (tally_proofs, tally) = self.generate_tally_proofs(&processed, coordinator).await?;
        self.transition(Phase::Done)?;

        info!(
            "Poll {} proved: {} process proofs, {} tally proofs",
            state.poll.poll_id,
            process_proofs.len(),
            tally_proofs.len()
        );
        Ok(RunOutput {
            poll_id: state.poll.poll_id,
            process_proofs,
            tally_proofs,
            tally,
        })
    }

    pub async fn check_preconditions(&mut self, endpoint: &dyn PollEndpoint) -> CoordinatorResult<()> {
        assert_preconditions(endpoint).await?;
        self.transition(Phase::PreconditionsOk)
    }

    /// Replicate `[start_block, end_block]` (chain head when `None`) and
    /// cross-check the result against the contract.
    pub async fn replicate_state(
        &mut self,
        endpoint: &dyn PollEndpoint,
        replicator: &ChainStateReplicator,
        start_block: u64,
        end_block: Option<u64>,
    ) -> CoordinatorResult<ProtocolState> {
        if self.phase != Phase::PreconditionsOk {
            return Err(CoordinatorError::InvalidTransition {
                from: self.phase.to_string(),
                to: "replication".into(),
            });
        }
        let end_block = match end_block {
            Some(block) => block,
            None => endpoint.block_number().await?,
        };
        let state = replicator.replicate(endpoint, start_block, end_block).await?;
        state.verify_against(endpoint).await?;
        self.transition(Phase::StateReplicated)?;
        Ok(state)
    }

    pub async fn generate_message_processing_proofs(
        &mut self,
        state: &ProtocolState,
        coordinator: &Keypair,
    ) -> CoordinatorResult<(Vec<ProcessProof>, ProcessedState)> {
        if coordinator.pub_key != state.poll.coordinator_pub_key {
            return Err(CoordinatorError::Precondition(
                "coordinator key does not match the poll's coordinator public key".into(),
            ));
        }
        self.transition(Phase::ProcessingBatches)?;

        let mut processor = MessageProcessor::new(state, coordinator, self.quadratic_voting)?;
        let total = processor.num_batches();
        info!(
            "Processing {} messages in {} batches of {}",
            state.messages.len(),
            total,
            processor.batch_size()
        );

        let mut proofs = Vec::with_capacity(total);
        while processor.has_unprocessed_batches() {
            let batch_index = proofs.len();
            self.check_cancelled(batch_index)?;

            let batch = processor.process_next_batch()?;
            let output = self
                .prove(
                    ProofStage::Process,
                    batch.batch_index,
                    &batch.circuit_inputs,
                    batch.public_input_hash,
                )
                .await?;

            info!(
                "Process batch {}/{} proved, state root {}",
                batch.batch_index + 1,
                total,
                maci_common::fr_to_decimal(&batch.state_root_after)
            );
            proofs.push(ProcessProof {
                batch_index: batch.batch_index,
                message_count: batch.message_count,
                state_root_before: batch.state_root_before,
                state_root_after: batch.state_root_after,
                public_input_hash: batch.public_input_hash,
                circuit_inputs: batch.circuit_inputs,
                proof: output.proof,
                public_signals: output.public_signals,
            });
        }

        Ok((proofs, processor.finish()?))
    }

    pub async fn generate_tally_proofs(
        &mut self,
        processed: &ProcessedState,
        coordinator: &Keypair,
    ) -> CoordinatorResult<(Vec<TallyProof>, TallyResult)> {
        self.transition(Phase::Tallying)?;

        let mut tallier = Tallier::new(processed, coordinator, self.quadratic_voting);
        let total = tallier.num_batches();
        info!("Tallying {} ballots in {} batches", processed.ballots.len(), total);

        let mut proofs = Vec::with_capacity(total);
        while tallier.has_untallied_batches() {
            let batch_index = proofs.len();
            self.check_cancelled(batch_index)?;

            let batch = tallier.tally_next_batch()?;
            let output = self
                .prove(
                    ProofStage::Tally,
                    batch.batch_index,
                    &batch.circuit_inputs,
                    batch.public_input_hash,
                )
                .await?;

            info!("Tally batch {}/{} proved", batch.batch_index + 1, total);
            proofs.push(TallyProof {
                batch_index: batch.batch_index,
                tally_commitment_before: batch.tally_commitment_before,
                tally_commitment_after: batch.tally_commitment_after,
                public_input_hash: batch.public_input_hash,
                circuit_inputs: batch.circuit_inputs,
                proof: output.proof,
                public_signals: output.public_signals,
            });
        }

        Ok((proofs, tallier.finish()?))
    }

    async fn prove(
        &self,
        stage: ProofStage,
        batch: usize,
        inputs: &serde_json::Value,
        public_input_hash: Fr,
    ) -> CoordinatorResult<ProverOutput> {
        let artifacts = match stage {
            ProofStage::Process => &self.process_artifacts,
            ProofStage::Tally => &self.tally_artifacts,
        };
        debug!("Proving {} batch {} with {}", stage, batch, artifacts.family);
        let output = self
            .prover
            .prove(ProofRequest {
                stage,
                batch,
                artifacts,
                inputs,
            })
            .await?;

        if !output.public_signals.contains(&public_input_hash) {
            return Err(CoordinatorError::Proving {
                stage,
                batch,
                reason: "public signals do not include the batch input hash".into(),
            });
        }
        Ok(output)
    }
}

/// Published tally for `contract_address`.
pub fn tally_document(
    contract_address: &str,
    poll_id: u64,
    quadratic_voting: bool,
    tally: &TallyResult,
) -> TallyDocument {
    let strings = |values: &[u128]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
    TallyDocument {
        maci: contract_address.to_string(),
        poll_id: poll_id.to_string(),
        is_quadratic: quadratic_voting,
        new_tally_commitment: tally.tally_commitment,
        results: CommittedTally {
            tally: strings(&tally.results),
            salt: tally.results_salt,
            commitment: tally.results_commitment,
        },
        total_spent_voice_credits: CommittedSpent {
            spent: tally.total_spent.to_string(),
            salt: tally.spent_salt,
            commitment: tally.spent_commitment,
        },
        per_vo_spent_voice_credits: tally.per_vo_spent.as_ref().map(|per_vo| CommittedTally {
            tally: strings(per_vo),
            salt: tally.per_vo_spent_salt,
            commitment: tally.per_vo_spent_commitment,
        }),
    }
}

/// Write `process_{i}.json`, `tally_{i}.json` and the tally document.
///
/// Proofs are staged in a sibling directory that replaces `output_dir` only
/// once every file is written, so the directory never mixes proofs from
/// different runs.
pub async fn write_outputs(
    output_dir: &Path,
    tally_file: &Path,
    output: &RunOutput,
    document: &TallyDocument,
) -> CoordinatorResult<()> {
    let parent = parent_or_cwd(output_dir);
    tokio::fs::create_dir_all(parent).await?;
    let staging = tempfile::Builder::new()
        .prefix(".maci-proofs-")
        .tempdir_in(parent)?;

    for proof in &output.process_proofs {
        let path = staging.path().join(format!("process_{}.json", proof.batch_index));
        tokio::fs::write(&path, serde_json::to_vec_pretty(proof)?).await?;
    }
    for proof in &output.tally_proofs {
        let path = staging.path().join(format!("tally_{}.json", proof.batch_index));
        tokio::fs::write(&path, serde_json::to_vec_pretty(proof)?).await?;
    }

    tokio::fs::create_dir_all(parent_or_cwd(tally_file)).await?;
    let staged_tally = tally_file.with_extension("json.partial");
    tokio::fs::write(&staged_tally, serde_json::to_vec_pretty(document)?).await?;

    if tokio::fs::try_exists(output_dir).await? {
        debug!("Replacing previous proofs in {}", output_dir.display());
        tokio::fs::remove_dir_all(output_dir).await?;
    }
    tokio::fs::rename(staging.path(), output_dir).await?;
    tokio::fs::rename(&staged_tally, tally_file).await?;

    info!(
        "Wrote {} proofs to {} and the tally to {}",
        output.process_proofs.len() + output.tally_proofs.len(),
        output_dir.display(),
        tally_file.display()
    );
    Ok(())
}

fn parent_or_cwd(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Every result and spent-credit entry is zero.
pub fn is_empty_tally(tally: &TallyResult) -> bool {
    tally.results.iter().all(|v| *v == 0)
        && tally.total_spent == 0
        && tally
            .per_vo_spent
            .as_ref()
            .map_or(true, |per_vo| per_vo.iter().all(|v| *v == 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_machine_only_moves_forward() {
        use Phase::*;
        let order = [Init, PreconditionsOk, StateReplicated, ProcessingBatches, Tallying, Done];
        for pair in order.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_transition_to(pair[0]));
        }
        assert!(!Init.can_transition_to(ProcessingBatches));
        assert!(!StateReplicated.can_transition_to(Done));
    }

    #[test]
    fn failed_is_reachable_from_every_live_phase() {
        use Phase::*;
        for phase in [Init, PreconditionsOk, StateReplicated, ProcessingBatches, Tallying] {
            assert!(phase.can_transition_to(Failed));
        }
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Init));
    }
}
