use anyhow::Result;

use super::{EXIT_DESTINATION_UNREACHABLE, EXIT_PROBLEMS};
use crate::config::PipelineConfig;
use crate::pipeline::{check_destination, check_sources};
use crate::utils::sanitize_url;

/// Validate sources and destination connectivity.
pub async fn check(config: PipelineConfig) -> Result<i32> {
    println!("Configuration OK ({} source(s))", config.sources.len());

    let mut sources_ok = true;
    for source in check_sources(&config)? {
        match &source.result {
            Ok(()) => println!("✓ source {} ({})", source.name, source.path),
            Err(e) => {
                sources_ok = false;
                println!("✗ source {} ({}): {}", source.name, source.path, e);
            }
        }
    }

    let target = sanitize_url(&config.destination.url);
    match check_destination(&config).await {
        Ok(elapsed) => println!("✓ destination {} ({} ms)", target, elapsed.as_millis()),
        Err(e) => {
            println!("✗ destination {}: {:#}", target, e);
            println!("  Is the database (or the tunnel to it) running?");
            return Ok(EXIT_DESTINATION_UNREACHABLE);
        }
    }

    if sources_ok {
        Ok(0)
    } else {
        Ok(EXIT_PROBLEMS)
    }
}
