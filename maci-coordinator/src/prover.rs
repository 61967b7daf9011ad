//! Proof generation through external executables.
//!
//! Each batch runs in its own scratch directory: the circuit inputs are
//! written as JSON, the witness generator turns them into a witness and the
//! prover turns that into `proof.json` and `public.json`. Families without
//! a native witness generator fall back to their wasm build. The
//! directory is removed when the call returns, whatever the outcome.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use maci_common::{fr_from_decimal, ProverOutput};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use crate::artifacts::{ArtifactSet, WitnessGenerator};
use crate::error::{CoordinatorError, CoordinatorResult, ProofStage};

/// One proving job.
#[derive(Clone, Copy, Debug)]
pub struct ProofRequest<'a> {
    pub stage: ProofStage,
    pub batch: usize,
    pub artifacts: &'a ArtifactSet,
    pub inputs: &'a Value,
}

impl ProofRequest<'_> {
    fn failed(&self, reason: impl Into<String>) -> CoordinatorError {
        CoordinatorError::Proving {
            stage: self.stage,
            batch: self.batch,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait Prover: Send + Sync {
    async fn prove(&self, request: ProofRequest<'_>) -> CoordinatorResult<ProverOutput>;
}

pub struct ExternalProver {
    prover_executable: Option<PathBuf>,
    wasm_runtime: PathBuf,
    timeout: Duration,
}

impl ExternalProver {
    pub fn new(prover_executable: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            prover_executable,
            wasm_runtime: PathBuf::from("node"),
            timeout,
        }
    }

    /// Runtime for wasm witness generation (`node` on the `PATH` by default).
    pub fn with_wasm_runtime(mut self, runtime: impl Into<PathBuf>) -> Self {
        self.wasm_runtime = runtime.into();
        self
    }

    async fn run_step(
        request: &ProofRequest<'_>,
        program: &Path,
        args: &[&Path],
        step: &str,
    ) -> CoordinatorResult<()> {
        debug!(
            "Running {} for {} batch {}: {}",
            step,
            request.stage,
            request.batch,
            program.display()
        );
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| request.failed(format!("failed to start {}: {}", step, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(512).collect();
            return Err(request.failed(format!(
                "{} exited with {}: {}",
                step, output.status, excerpt
            )));
        }
        Ok(())
    }

    async fn run(
        &self,
        request: &ProofRequest<'_>,
        generator: &WitnessGenerator,
        prover: &Path,
        scratch: &Path,
    ) -> CoordinatorResult<ProverOutput> {
        let input_path = scratch.join("input.json");
        let witness_path = scratch.join("witness.wtns");
        let proof_path = scratch.join("proof.json");
        let public_path = scratch.join("public.json");

        let inputs = serde_json::to_vec(request.inputs)?;
        tokio::fs::write(&input_path, inputs).await?;

        match generator {
            WitnessGenerator::Native(program) => {
                Self::run_step(
                    request,
                    program,
                    &[input_path.as_path(), witness_path.as_path()],
                    "witness generator",
                )
                .await?
            }
            WitnessGenerator::Wasm { wasm, script } => {
                Self::run_step(
                    request,
                    &self.wasm_runtime,
                    &[
                        script.as_path(),
                        wasm.as_path(),
                        input_path.as_path(),
                        witness_path.as_path(),
                    ],
                    "wasm witness generator",
                )
                .await?
            }
        }

        Self::run_step(
            request,
            prover,
            &[
                request.artifacts.zkey.as_path(),
                witness_path.as_path(),
                proof_path.as_path(),
                public_path.as_path(),
            ],
            "prover",
        )
        .await?;

        let proof: Value = serde_json::from_slice(
            &tokio::fs::read(&proof_path)
                .await
                .map_err(|e| request.failed(format!("prover wrote no proof: {}", e)))?,
        )
        .map_err(|e| request.failed(format!("proof.json is not json: {}", e)))?;

        let raw_signals: Vec<String> = serde_json::from_slice(
            &tokio::fs::read(&public_path)
                .await
                .map_err(|e| request.failed(format!("prover wrote no public signals: {}", e)))?,
        )
        .map_err(|e| request.failed(format!("public.json is not a string array: {}", e)))?;

        let public_signals = raw_signals
            .iter()
            .map(|s| fr_from_decimal(s))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| request.failed(format!("invalid public signal: {}", e)))?;

        Ok(ProverOutput {
            proof,
            public_signals,
        })
    }
}

#[async_trait]
impl Prover for ExternalProver {
    async fn prove(&self, request: ProofRequest<'_>) -> CoordinatorResult<ProverOutput> {
        let prover = self
            .prover_executable
            .as_deref()
            .ok_or_else(|| request.failed("no prover executable configured"))?;
        let generator = request.artifacts.ensure_present().await?;

        let scratch = tempfile::Builder::new().prefix("maci-proof-").tempdir()?;

        let run = self.run(&request, &generator, prover, scratch.path());
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CoordinatorError::ProvingTimeout {
                    stage: request.stage,
                    batch: request.batch,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        info!(
            "Generated {} proof for batch {} ({} public signals)",
            request.stage,
            request.batch,
            output.public_signals.len()
        );
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactResolver;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn artifacts(root: &Path, witness_body: &str) -> ArtifactSet {
        let set = ArtifactResolver::new(root).resolve("TallyVotes_1-1", true).unwrap();
        std::fs::create_dir_all(set.zkey.parent().unwrap()).unwrap();
        std::fs::write(&set.zkey, b"zkey").unwrap();
        write_script(&set.witness_generator, witness_body);
        set
    }

    #[tokio::test]
    async fn test_runs_both_steps_and_reads_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let set = artifacts(dir.path(), "cp \"$1\" \"$2\"");
        let prover = dir.path().join("prover");
        write_script(
            &prover,
            "echo '{\"pi_a\":[\"1\"]}' > \"$3\"\necho '[\"7\",\"8\"]' > \"$4\"",
        );

        let inputs = serde_json::json!({ "a": "1" });
        let output = ExternalProver::new(Some(prover), Duration::from_secs(30))
            .prove(ProofRequest {
                stage: ProofStage::Tally,
                batch: 0,
                artifacts: &set,
                inputs: &inputs,
            })
            .await
            .unwrap();
        assert_eq!(output.public_signals.len(), 2);
        assert_eq!(output.proof["pi_a"][0], "1");
    }

    #[tokio::test]
    async fn test_wasm_build_is_used_without_native_generator() {
        let dir = tempfile::tempdir().unwrap();
        let set = ArtifactResolver::new(dir.path()).resolve("TallyVotes_1-1", true).unwrap();
        std::fs::create_dir_all(set.wasm.parent().unwrap()).unwrap();
        std::fs::write(&set.zkey, b"zkey").unwrap();
        std::fs::write(&set.wasm, b"wasm").unwrap();
        std::fs::write(set.wasm.with_file_name("generate_witness.js"), b"// runner").unwrap();

        // Stands in for node: <script> <wasm> <input> <witness>.
        let runtime = dir.path().join("node");
        write_script(&runtime, "case \"$2\" in *.wasm) cp \"$3\" \"$4\" ;; *) exit 9 ;; esac");
        let prover = dir.path().join("prover");
        write_script(
            &prover,
            "test -f \"$2\" || exit 4\necho '{}' > \"$3\"\necho '[\"5\"]' > \"$4\"",
        );

        let inputs = serde_json::json!({ "b": "2" });
        let output = ExternalProver::new(Some(prover), Duration::from_secs(30))
            .with_wasm_runtime(runtime)
            .prove(ProofRequest {
                stage: ProofStage::Tally,
                batch: 2,
                artifacts: &set,
                inputs: &inputs,
            })
            .await
            .unwrap();
        assert_eq!(output.public_signals, vec![fr_from_decimal("5").unwrap()]);
    }

    #[tokio::test]
    async fn test_failed_witness_generation_reports_batch() {
        let dir = tempfile::tempdir().unwrap();
        let set = artifacts(dir.path(), "echo boom >&2\nexit 3");
        let prover = dir.path().join("prover");
        write_script(&prover, "exit 0");

        let inputs = serde_json::json!({});
        let err = ExternalProver::new(Some(prover), Duration::from_secs(30))
            .prove(ProofRequest {
                stage: ProofStage::Process,
                batch: 4,
                artifacts: &set,
                inputs: &inputs,
            })
            .await
            .unwrap_err();
        match err {
            CoordinatorError::Proving { stage, batch, reason } => {
                assert_eq!(stage, ProofStage::Process);
                assert_eq!(batch, 4);
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_slow_prover_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let set = artifacts(dir.path(), "sleep 5");
        let prover = dir.path().join("prover");
        write_script(&prover, "exit 0");

        let inputs = serde_json::json!({});
        let err = ExternalProver::new(Some(prover), Duration::from_millis(200))
            .prove(ProofRequest {
                stage: ProofStage::Process,
                batch: 1,
                artifacts: &set,
                inputs: &inputs,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ProvingTimeout { batch: 1, .. }));
    }

    #[tokio::test]
    async fn test_missing_prover_is_a_proving_error() {
        let dir = tempfile::tempdir().unwrap();
        let set = artifacts(dir.path(), "exit 0");
        let inputs = serde_json::json!({});
        let err = ExternalProver::new(None, Duration::from_secs(1))
            .prove(ProofRequest {
                stage: ProofStage::Process,
                batch: 0,
                artifacts: &set,
                inputs: &inputs,
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PROVING_FAILED");
    }
}
