//! Subcommand handlers.

use polyllama_core::{AppState, ModelRouter, RouterConfig, run_gateway};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

fn ensure_valid(config: &RouterConfig) -> anyhow::Result<()> {
    let problems = config.validate();
    if problems.is_empty() {
        return Ok(());
    }
    anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
}

/// Run the router until Ctrl-C.
pub async fn serve(config: RouterConfig) -> anyhow::Result<()> {
    ensure_valid(&config)?;

    let router = Arc::new(ModelRouter::from_config(config));
    info!(
        instances = router.topology().count(),
        prefix = %router.config().backends.instance_prefix,
        "Starting polyllama router"
    );

    // Pick up models the backends already have loaded.
    match router.reconcile().await {
        Ok(report) => info!(
            fixed = report.fixed,
            duplicates = report.duplicates.len(),
            "Initial reconcile done"
        ),
        Err(e) => warn!(error = %e, "Initial reconcile failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = router.spawn_maintenance(shutdown_rx);

    run_gateway(AppState::new(router), shutdown_signal()).await?;

    let _ = shutdown_tx.send(true);
    for handle in maintenance {
        let _ = handle.await;
    }
    info!("Router stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

pub fn show_config(config: &RouterConfig) -> anyhow::Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

pub fn check_config(config: &RouterConfig) -> anyhow::Result<()> {
    ensure_valid(config)?;
    println!("Configuration OK ({} instances)", config.backends.instance_count);
    Ok(())
}
