//! src/main.rs
//!
//! Minimal demo binary: brings up a single instance with a no-op delegate,
//! optionally joins a seed list from the environment, and runs until
//! Ctrl+C.

use anyhow::Context;
use std::sync::Arc;
use swim_membership::app::Core;
use swim_membership::delegate::{ConflictDelegate, Delegate, MergeDelegate, NoopDelegate, NoopEventDelegate};
use swim_membership::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;
    let seeds: Vec<String> = std::env::var("SWIM_SEEDS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let noop = Arc::new(NoopDelegate);
    let core = Core::create(
        config,
        noop.clone() as Arc<dyn Delegate>,
        noop.clone() as Arc<dyn MergeDelegate>,
        noop.clone() as Arc<dyn ConflictDelegate>,
        Arc::new(NoopEventDelegate),
    )
    .await
    .context("failed to create instance")?;

    if !seeds.is_empty() {
        match core.join(&seeds).await {
            Ok(n) => tracing::info!(joined = n, "joined cluster"),
            Err(e) => tracing::warn!(error = %e, "join failed, running standalone"),
        }
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    core.shutdown().await?;
    Ok(())
}
