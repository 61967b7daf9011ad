//! Coordinator configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Coordinator configuration.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// JSON-RPC endpoint of the chain hosting the poll.
    pub rpc_url: String,
    /// Poll contract address.
    pub poll_address: String,
    /// File holding the key that encrypts the coordinator private key.
    pub private_key_path: PathBuf,
    /// Hex ciphertext of the coordinator private key.
    pub encrypted_private_key: String,
    /// Root directory of the circuit artifacts.
    pub zkey_root: PathBuf,
    pub process_zkey_name: String,
    pub tally_zkey_name: String,
    /// Native prover; proving fails at the first batch when unset.
    pub prover_executable: Option<PathBuf>,
    /// Runs `generate_witness.js` for families without a native witness
    /// generator.
    pub wasm_runtime: PathBuf,
    pub output_dir: PathBuf,
    pub tally_file: PathBuf,
    pub use_quadratic_voting: bool,
    pub start_block: u64,
    /// Last block to replicate; the chain head when unset.
    pub end_block: Option<u64>,
    pub blocks_per_batch: u64,
    pub fetch_concurrency: usize,
    pub proof_timeout: Duration,
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let rpc_url =
            env::var("COORDINATOR_RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string());

        let poll_address = env::var("COORDINATOR_POLL_ADDRESS")
            .context("COORDINATOR_POLL_ADDRESS must be set")?;

        let private_key_path = env::var("COORDINATOR_PRIVATE_KEY_PATH")
            .map(PathBuf::from)
            .context("COORDINATOR_PRIVATE_KEY_PATH must be set")?;

        let encrypted_private_key = env::var("COORDINATOR_ENCRYPTED_PRIVATE_KEY")
            .context("COORDINATOR_ENCRYPTED_PRIVATE_KEY must be set")?;

        let zkey_root = env::var("COORDINATOR_ZKEY_PATH")
            .map(PathBuf::from)
            .context("COORDINATOR_ZKEY_PATH must be set")?;

        let process_zkey_name = env::var("COORDINATOR_MESSAGE_PROCESS_ZKEY_NAME")
            .context("COORDINATOR_MESSAGE_PROCESS_ZKEY_NAME must be set")?;

        let tally_zkey_name = env::var("COORDINATOR_TALLY_ZKEY_NAME")
            .context("COORDINATOR_TALLY_ZKEY_NAME must be set")?;

        let prover_executable = env::var("COORDINATOR_RAPIDSNARK_EXE").ok().map(PathBuf::from);
        let wasm_runtime =
            PathBuf::from(env::var("COORDINATOR_NODE_EXE").unwrap_or_else(|_| "node".to_string()));

        let output_dir = PathBuf::from(
            env::var("COORDINATOR_OUTPUT_DIR").unwrap_or_else(|_| "./proofs".to_string()),
        );
        let tally_file = PathBuf::from(
            env::var("COORDINATOR_TALLY_FILE").unwrap_or_else(|_| "./tally.json".to_string()),
        );

        let use_quadratic_voting = env::var("COORDINATOR_USE_QUADRATIC_VOTING")
            .ok()
            .map(|s| parse_bool(&s))
            .transpose()?
            .unwrap_or(true);

        let start_block: u64 = env::var("COORDINATOR_START_BLOCK")
            .ok()
            .map(|s| s.parse())
            .transpose()
            .context("COORDINATOR_START_BLOCK must be a block number")?
            .unwrap_or(0);

        let end_block: Option<u64> = env::var("COORDINATOR_END_BLOCK")
            .ok()
            .map(|s| s.parse())
            .transpose()
            .context("COORDINATOR_END_BLOCK must be a block number")?;

        let blocks_per_batch: u64 = env::var("COORDINATOR_BLOCKS_PER_BATCH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);

        let fetch_concurrency: usize = env::var("COORDINATOR_FETCH_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let proof_timeout_secs: u64 = env::var("COORDINATOR_PROOF_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3600);

        Ok(Self {
            rpc_url,
            poll_address,
            private_key_path,
            encrypted_private_key,
            zkey_root,
            process_zkey_name,
            tally_zkey_name,
            prover_executable,
            wasm_runtime,
            output_dir,
            tally_file,
            use_quadratic_voting,
            start_block,
            end_block,
            blocks_per_batch,
            fetch_concurrency,
            proof_timeout: Duration::from_secs(proof_timeout_secs),
        })
    }
}

/// Settings for the `maci-replay` recovery tool.
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    pub rpc_url: String,
    pub poll_address: String,
    pub data_file: PathBuf,
    /// Ethereum key that sends the signup and publish transactions.
    pub signer_key: String,
}

impl ReplayConfig {
    pub fn from_env() -> Result<Self> {
        let rpc_url =
            env::var("COORDINATOR_RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string());
        let poll_address = env::var("COORDINATOR_POLL_ADDRESS")
            .context("COORDINATOR_POLL_ADDRESS must be set")?;
        let data_file = env::var("REPLAY_DATA_FILE")
            .map(PathBuf::from)
            .context("REPLAY_DATA_FILE must be set")?;
        let signer_key = env::var("REPLAY_SIGNER_KEY").context("REPLAY_SIGNER_KEY must be set")?;

        Ok(Self {
            rpc_url,
            poll_address,
            data_file,
            signer_key,
        })
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool(" 0 ").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
