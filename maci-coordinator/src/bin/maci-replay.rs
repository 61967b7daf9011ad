//! maci-replay
//!
//! Recreates a poll's signups and messages on a fresh deployment from a
//! recovery document.

use maci_coordinator::{load_replay_document, replay, EthersPollWriter, ReplayConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maci_coordinator=info,maci_replay=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();
    let config = ReplayConfig::from_env()?;

    info!("Replaying {} onto {}", config.data_file.display(), config.poll_address);
    let document = load_replay_document(&config.data_file).await?;
    let target =
        EthersPollWriter::connect(&config.rpc_url, &config.poll_address, &config.signer_key)
            .await?;

    let summary = replay(&target, &document).await?;
    info!(
        "Replayed {} signups and {} messages",
        summary.signups, summary.messages
    );
    Ok(())
}
