//! maci-coordinator
//!
//! Proves message processing and tallying for one poll and writes the
//! proofs and the tally document.

use std::sync::Arc;

use maci_coordinator::{
    load_private_key, tally_document, write_outputs, ArtifactResolver, BatchProofOrchestrator,
    ChainStateReplicator, CoordinatorConfig, EthersPoll, ExternalProver,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maci_coordinator=info".into()),
        )
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = CoordinatorConfig::from_env()?;

    info!("Starting maci-coordinator");
    info!("RPC: {}", config.rpc_url);
    info!("Poll: {}", config.poll_address);
    info!("Quadratic voting: {}", config.use_quadratic_voting);

    let resolver = ArtifactResolver::new(&config.zkey_root);
    let process_artifacts =
        resolver.resolve(&config.process_zkey_name, config.use_quadratic_voting)?;
    let tally_artifacts = resolver.resolve(&config.tally_zkey_name, config.use_quadratic_voting)?;
    if config.prover_executable.is_none() {
        warn!("COORDINATOR_RAPIDSNARK_EXE is not set; proving will fail");
    }

    let endpoint = EthersPoll::connect(&config.rpc_url, &config.poll_address).await?;
    let coordinator =
        load_private_key(&config.private_key_path, &config.encrypted_private_key).await?;
    let replicator = ChainStateReplicator::new(config.blocks_per_batch, config.fetch_concurrency)?;
    let prover = Arc::new(
        ExternalProver::new(config.prover_executable.clone(), config.proof_timeout)
            .with_wasm_runtime(config.wasm_runtime.clone()),
    );

    let cancel = CancellationToken::new();
    let mut orchestrator = BatchProofOrchestrator::new(
        prover,
        process_artifacts,
        tally_artifacts,
        config.use_quadratic_voting,
    )
    .with_cancellation(cancel.clone());

    // Stop at the next batch boundary on ctrl-c
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested, stopping after the current batch");
            cancel.cancel();
        }
    });

    let output = match orchestrator
        .run(
            &endpoint,
            &replicator,
            &coordinator,
            config.start_block,
            config.end_block,
        )
        .await
    {
        Ok(output) => output,
        Err(e) => {
            error!("[{}] {}", e.error_code(), e);
            return Err(e.into());
        }
    };

    let document = tally_document(
        &config.poll_address,
        output.poll_id,
        config.use_quadratic_voting,
        &output.tally,
    );
    write_outputs(&config.output_dir, &config.tally_file, &output, &document).await?;

    info!("Done");
    Ok(())
}
