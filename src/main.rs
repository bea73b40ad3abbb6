use std::env;

use anyhow::Context;
use flavor_map::{init_tracing, AppConfig, AppState, RefreshOutcome};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::from_env();
    let state = AppState::initialize(config).context("failed to initialize refresh state")?;
    let gate = state.gate();

    let force = env::var("FORCE_REFRESH")
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);

    let outcome = if force {
        RefreshOutcome::Rebuilt(gate.rebuild_now().await.context("forced refresh failed")?)
    } else {
        gate.check_and_maybe_rebuild()
            .await
            .context("daily refresh failed")?
    };

    match &outcome {
        RefreshOutcome::Rebuilt(summary) => info!(
            date = %summary.date,
            count = summary.count,
            failed = summary.failures.len(),
            dropped = summary.dropped.len(),
            dataset = %summary.dataset_path.display(),
            "dataset rebuilt"
        ),
        other => info!(outcome = ?other, "dataset already current"),
    }
    state.events().flush().context("failed to flush refresh events")?;
    Ok(())
}
