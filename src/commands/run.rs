use anyhow::Result;

use crate::config::PipelineConfig;
use crate::pipeline::Pipeline;

/// Run the continuous pipeline until SIGINT or SIGTERM.
pub async fn run(config: PipelineConfig) -> Result<i32> {
    tracing::info!("Starting tosh-sync with {} source(s)", config.sources.len());
    for source in &config.sources {
        tracing::info!(
            "  {} -> {}.{}",
            source.name,
            config.destination.schema,
            source.target_table(&config.destination)
        );
    }

    let pipeline = Pipeline::from_config(config).await?;
    pipeline.run_until_signal().await?;
    Ok(0)
}
