//! Error types for the coordinator pipeline.
//!
//! Every fatal error aborts the run; only chain I/O is worth retrying, and
//! the retry policy belongs to whoever restarts the run.

use thiserror::Error;

/// Stage of the pipeline a proving failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProofStage {
    Process,
    Tally,
}

impl std::fmt::Display for ProofStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProofStage::Process => f.write_str("process"),
            ProofStage::Tally => f.write_str("tally"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    // ═══════════════════════════════════════════════════════════════════════════════
    // CHAIN ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    /// Transport failure talking to the poll endpoint.
    #[error("chain i/o error: {0}")]
    ChainIo(String),

    /// Log or view data that does not decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// Replicated events disagree with the counts or roots the chain reports.
    #[error("replication mismatch: {0}")]
    ReplicationMismatch(String),

    // ═══════════════════════════════════════════════════════════════════════════════
    // PRECONDITION ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("The state tree has not been merged yet. Please use the mergeSignups subcommmand to do so.")]
    StateTreeUnmerged,

    #[error("The message tree has not been merged yet. Please use the mergeMessages subcommmand to do so.")]
    MessageTreeUnmerged,

    #[error("precondition failed: {0}")]
    Precondition(String),

    // ═══════════════════════════════════════════════════════════════════════════════
    // KEY ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("failed to load coordinator key material: {0}")]
    KeyLoad(String),

    #[error("failed to decrypt coordinator private key")]
    Decryption,

    #[error("coordinator private key is malformed: {0}")]
    KeyDeserialization(String),

    // ═══════════════════════════════════════════════════════════════════════════════
    // PROVING ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("{stage} proof for batch {batch} failed: {reason}")]
    Proving {
        stage: ProofStage,
        batch: usize,
        reason: String,
    },

    #[error("{stage} proof for batch {batch} timed out after {secs}s")]
    ProvingTimeout {
        stage: ProofStage,
        batch: usize,
        secs: u64,
    },

    // ═══════════════════════════════════════════════════════════════════════════════
    // RUN CONTROL
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run cancelled before batch {batch}")]
    Cancelled { batch: usize },

    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // ═══════════════════════════════════════════════════════════════════════════════
    // INTERNAL ERRORS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoordinatorError {
    /// Get a machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoordinatorError::ChainIo(_) => "CHAIN_IO",
            CoordinatorError::Decode(_) => "DECODE_ERROR",
            CoordinatorError::ReplicationMismatch(_) => "REPLICATION_MISMATCH",
            CoordinatorError::StateTreeUnmerged => "STATE_TREE_UNMERGED",
            CoordinatorError::MessageTreeUnmerged => "MESSAGE_TREE_UNMERGED",
            CoordinatorError::Precondition(_) => "PRECONDITION_FAILED",
            CoordinatorError::KeyLoad(_) => "KEY_LOAD_FAILED",
            CoordinatorError::Decryption => "KEY_DECRYPTION_FAILED",
            CoordinatorError::KeyDeserialization(_) => "KEY_DESERIALIZATION_FAILED",
            CoordinatorError::ArtifactNotFound(_) => "ARTIFACT_NOT_FOUND",
            CoordinatorError::Proving { .. } => "PROVING_FAILED",
            CoordinatorError::ProvingTimeout { .. } => "PROVING_TIMEOUT",
            CoordinatorError::Config(_) => "CONFIG_ERROR",
            CoordinatorError::Cancelled { .. } => "CANCELLED",
            CoordinatorError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoordinatorError::Serialization(_) => "SERIALIZATION_ERROR",
            CoordinatorError::Io(_) => "IO_ERROR",
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::ChainIo(_))
    }

    /// Batch index the failure is attributed to, if any.
    pub fn batch(&self) -> Option<usize> {
        match self {
            CoordinatorError::Proving { batch, .. }
            | CoordinatorError::ProvingTimeout { batch, .. }
            | CoordinatorError::Cancelled { batch } => Some(*batch),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Serialization(err.to_string())
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
