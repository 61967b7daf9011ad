//! End-to-end runs of the proving pipeline against the in-memory poll.

use std::sync::Arc;

use halo2curves_axiom::ff::Field;
use maci_common::{hash3, Ballot, Fr, QuinaryTree, TallyDocument};
use maci_coordinator::orchestrator::is_empty_tally;
use maci_coordinator::processing::SaltSource;
use maci_coordinator::{
    tally_document, write_outputs, BatchProofOrchestrator, ChainStateReplicator, CoordinatorError,
    Phase, PollEndpoint, ProofStage, RunOutput,
};
use maci_test_fixtures::{mock_artifacts, voter_keypair, MockProver, Scenario};
use tokio_util::sync::CancellationToken;

fn orchestrator(prover: Arc<MockProver>, quadratic_voting: bool) -> BatchProofOrchestrator {
    let (process, tally) = mock_artifacts(quadratic_voting);
    BatchProofOrchestrator::new(prover, process, tally, quadratic_voting)
}

fn replicator() -> ChainStateReplicator {
    ChainStateReplicator::new(2, 2).expect("valid replicator settings")
}

/// Three voters, six messages (one of them stale), both queues merged.
fn voted_scenario() -> Scenario {
    let mut scenario = Scenario::new(3, 100);
    scenario.vote(1, 0, 5, 1);
    scenario.vote(2, 1, 3, 1);
    scenario.vote(3, 0, 2, 1);
    scenario.vote(1, 2, 1, 2);
    scenario.vote(2, 4, 1, 5);
    scenario.vote(3, 3, 0, 2);
    scenario.poll.merge();
    scenario
}

async fn run(scenario: &Scenario, prover: Arc<MockProver>, quadratic_voting: bool) -> RunOutput {
    let mut orchestrator = orchestrator(prover, quadratic_voting);
    let output = orchestrator
        .run(&scenario.poll, &replicator(), &scenario.coordinator, 0, None)
        .await
        .expect("pipeline should succeed");
    assert_eq!(orchestrator.phase(), Phase::Done);
    output
}

#[tokio::test]
async fn test_full_run_proves_and_tallies() {
    let scenario = voted_scenario();
    let prover = MockProver::new();
    let output = run(&scenario, prover.clone(), true).await;

    assert_eq!(output.process_proofs.len(), 2);
    assert_eq!(output.process_proofs[0].message_count, 5);
    assert_eq!(output.process_proofs[1].message_count, 1);
    assert_eq!(output.tally_proofs.len(), 1);

    assert_eq!(output.tally.results, vec![7, 3, 1, 0, 0]);
    assert_eq!(output.tally.total_spent, 39);
    assert_eq!(output.tally.per_vo_spent, Some(vec![29, 9, 1, 0, 0]));

    assert_eq!(
        prover.calls(),
        vec![
            (ProofStage::Process, 0),
            (ProofStage::Process, 1),
            (ProofStage::Tally, 0)
        ]
    );
}

#[tokio::test]
async fn test_linear_voting_tally() {
    let scenario = voted_scenario();
    let output = run(&scenario, MockProver::new(), false).await;

    assert_eq!(output.tally.results, vec![7, 3, 1, 0, 0]);
    assert_eq!(output.tally.total_spent, 11);
    assert_eq!(output.tally.per_vo_spent, None);
}

#[tokio::test]
async fn test_proofs_chain_batch_to_batch() {
    let scenario = voted_scenario();
    let output = run(&scenario, MockProver::new(), true).await;

    // Batch 0 starts from the merged on-chain state and all-blank ballots.
    let depths = scenario.poll.tree_depths().await.unwrap();
    let merged_state_root = scenario.poll.merged_state_root().await.unwrap();
    let blank_ballot = Ballot::blank(depths.vote_option_tree_depth);
    let ballot_root = QuinaryTree::new(depths.state_tree_depth, blank_ballot.hash()).root();
    let sb_salt = SaltSource::new(&scenario.coordinator).salt("sb", 0);
    assert_eq!(
        output.process_proofs[0].state_root_before,
        hash3(merged_state_root, ballot_root, sb_salt)
    );

    for pair in output.process_proofs.windows(2) {
        assert_eq!(pair[1].state_root_before, pair[0].state_root_after);
    }
    for (i, proof) in output.process_proofs.iter().enumerate() {
        assert_eq!(proof.batch_index, i);
        assert_eq!(proof.public_signals, vec![proof.public_input_hash]);
    }

    assert_eq!(output.tally_proofs[0].tally_commitment_before, Fr::ZERO);
    for pair in output.tally_proofs.windows(2) {
        assert_eq!(pair[1].tally_commitment_before, pair[0].tally_commitment_after);
    }
    let last = output.tally_proofs.last().expect("at least one tally batch");
    assert_eq!(last.tally_commitment_after, output.tally.tally_commitment);
}

#[tokio::test]
async fn test_state_roots_are_deterministic() {
    let scenario = voted_scenario();
    let first = run(&scenario, MockProver::new(), true).await;
    let second = run(&scenario, MockProver::new(), true).await;

    let roots = |output: &RunOutput| -> Vec<Fr> {
        output
            .process_proofs
            .iter()
            .map(|proof| proof.state_root_after)
            .collect()
    };
    assert_eq!(roots(&first), roots(&second));
    assert_eq!(first.tally.tally_commitment, second.tally.tally_commitment);
}

#[tokio::test]
async fn test_trivial_poll_has_no_process_proofs() {
    let scenario = Scenario::new(0, 100);
    scenario.poll.merge();
    let output = run(&scenario, MockProver::new(), true).await;

    assert!(output.process_proofs.is_empty());
    assert_eq!(output.tally_proofs.len(), 1);
    assert!(is_empty_tally(&output.tally));
}

#[tokio::test]
async fn test_prover_failure_stops_the_run() {
    let scenario = voted_scenario();
    let prover = MockProver::failing_at(ProofStage::Process, 1);
    let mut orchestrator = orchestrator(prover.clone(), true);

    let err = orchestrator
        .run(&scenario.poll, &replicator(), &scenario.coordinator, 0, None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::Proving {
            stage: ProofStage::Process,
            batch: 1,
            ..
        }
    ));
    assert_eq!(orchestrator.phase(), Phase::Failed);
    // Tallying never starts.
    assert_eq!(prover.calls().len(), 2);
}

#[tokio::test]
async fn test_failed_run_writes_nothing() {
    let scenario = voted_scenario();
    let dir = tempfile::tempdir().unwrap();
    let output_dir = dir.path().join("proofs");
    let tally_file = dir.path().join("tally.json");

    let mut orchestrator = orchestrator(MockProver::failing_at(ProofStage::Tally, 0), true);
    let result = orchestrator
        .run(&scenario.poll, &replicator(), &scenario.coordinator, 0, None)
        .await;
    if let Ok(output) = &result {
        let document = tally_document("0xpoll", output.poll_id, true, &output.tally);
        write_outputs(&output_dir, &tally_file, output, &document)
            .await
            .unwrap();
    }

    assert!(result.is_err());
    assert!(!output_dir.exists());
    assert!(!tally_file.exists());
}

#[tokio::test]
async fn test_successful_run_writes_outputs() {
    let scenario = voted_scenario();
    let dir = tempfile::tempdir().unwrap();
    let output_dir = dir.path().join("proofs");
    let tally_file = dir.path().join("out").join("tally.json");

    let output = run(&scenario, MockProver::new(), true).await;
    let document = tally_document("0xpoll", output.poll_id, true, &output.tally);
    write_outputs(&output_dir, &tally_file, &output, &document)
        .await
        .unwrap();

    for name in ["process_0.json", "process_1.json", "tally_0.json"] {
        assert!(output_dir.join(name).exists(), "{} missing", name);
    }
    let raw = std::fs::read_to_string(&tally_file).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["results"]["tally"][0], "7");
    assert!(value.get("perVOSpentVoiceCredits").is_some());

    let parsed: TallyDocument = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed, document);
    assert_eq!(parsed.total_spent_voice_credits.spent, "39");
}

fn listing(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_rerun_replaces_earlier_proofs() {
    let dir = tempfile::tempdir().unwrap();
    let output_dir = dir.path().join("proofs");
    let tally_file = dir.path().join("tally.json");

    let voted = run(&voted_scenario(), MockProver::new(), true).await;
    let document = tally_document("0xpoll", voted.poll_id, true, &voted.tally);
    write_outputs(&output_dir, &tally_file, &voted, &document)
        .await
        .unwrap();
    assert_eq!(
        listing(&output_dir),
        vec!["process_0.json", "process_1.json", "tally_0.json"]
    );

    let trivial_scenario = Scenario::new(0, 100);
    trivial_scenario.poll.merge();
    let trivial = run(&trivial_scenario, MockProver::new(), true).await;
    let document = tally_document("0xpoll", trivial.poll_id, true, &trivial.tally);
    write_outputs(&output_dir, &tally_file, &trivial, &document)
        .await
        .unwrap();

    assert_eq!(listing(&output_dir), vec!["tally_0.json"]);
    assert_eq!(listing(dir.path()), vec!["proofs", "tally.json"]);
    let parsed: TallyDocument =
        serde_json::from_str(&std::fs::read_to_string(&tally_file).unwrap()).unwrap();
    assert_eq!(parsed, document);
}

#[tokio::test]
async fn test_cancellation_is_honoured_at_batch_boundary() {
    let scenario = voted_scenario();
    let token = CancellationToken::new();
    let prover = MockProver::cancelling_after(ProofStage::Process, 0, token.clone());
    let mut orchestrator = orchestrator(prover.clone(), true).with_cancellation(token);

    let err = orchestrator
        .run(&scenario.poll, &replicator(), &scenario.coordinator, 0, None)
        .await
        .unwrap_err();

    assert!(matches!(err, CoordinatorError::Cancelled { batch: 1 }));
    assert_eq!(prover.calls(), vec![(ProofStage::Process, 0)]);
    assert_eq!(orchestrator.phase(), Phase::Failed);
}

#[tokio::test]
async fn test_public_signals_must_commit_to_inputs() {
    let scenario = voted_scenario();
    let mut orchestrator = orchestrator(MockProver::with_wrong_signals(), true);

    let err = orchestrator
        .run(&scenario.poll, &replicator(), &scenario.coordinator, 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "PROVING_FAILED");
    assert_eq!(err.batch(), Some(0));
}

#[tokio::test]
async fn test_foreign_coordinator_key_is_rejected() {
    let scenario = voted_scenario();
    let mut orchestrator = orchestrator(MockProver::new(), true);

    let err = orchestrator
        .run(&scenario.poll, &replicator(), &voter_keypair(42), 0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Precondition(_)));
}

#[tokio::test]
async fn test_phases_cannot_be_skipped() {
    let scenario = voted_scenario();
    let mut orchestrator = orchestrator(MockProver::new(), true);

    let err = orchestrator
        .replicate_state(&scenario.poll, &replicator(), 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_TRANSITION");
    assert_eq!(orchestrator.phase(), Phase::Init);
}
