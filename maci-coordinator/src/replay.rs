//! Replays a recorded poll onto a freshly deployed one.
//!
//! Users are signed up and messages published in file order. The target
//! must be pristine, otherwise indices and roots would diverge.

use std::path::Path;

use maci_common::{fr_to_decimal, Fr, ReplayDocument};
use tracing::info;

use crate::chain::PollWriter;
use crate::error::{CoordinatorError, CoordinatorResult};

/// Roots reported by the target after the replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplaySummary {
    pub signups: usize,
    pub messages: usize,
    pub state_root: Fr,
    pub message_root: Fr,
}

pub async fn load_replay_document(path: &Path) -> CoordinatorResult<ReplayDocument> {
    let raw = tokio::fs::read_to_string(path).await?;
    ReplayDocument::from_json(&raw)
        .map_err(|e| CoordinatorError::Decode(format!("{}: {}", path.display(), e)))
}

pub async fn replay(target: &dyn PollWriter, document: &ReplayDocument) -> CoordinatorResult<ReplaySummary> {
    let signups = target.num_signups().await?;
    let messages = target.num_messages().await?;
    if signups != 0 || messages != 0 {
        return Err(CoordinatorError::Precondition(format!(
            "replay target must be empty, found {} signups and {} messages",
            signups, messages
        )));
    }

    // Decode everything up front so a bad entry aborts before any transaction.
    let decoded = document
        .messages
        .iter()
        .map(|m| m.to_message())
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(|e| CoordinatorError::Decode(e.to_string()))?;

    let total_users = document.users.len();
    for (i, user) in document.users.iter().enumerate() {
        info!("Signing up {} / {}", i + 1, total_users);
        target
            .sign_up(&user.public_key, user.voice_credit_balance)
            .await?;
    }

    let total_messages = decoded.len();
    for (i, message) in decoded.iter().enumerate() {
        info!("Publishing message {} / {}", i + 1, total_messages);
        target.publish_message(message).await?;
    }

    let state_root = target.state_root().await?;
    let message_root = target.message_root().await?;
    info!("State root: {}", fr_to_decimal(&state_root));
    info!("Message root: {}", fr_to_decimal(&message_root));

    Ok(ReplaySummary {
        signups: total_users,
        messages: total_messages,
        state_root,
        message_root,
    })
}
