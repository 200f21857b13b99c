//! Recurring scheduler for the batch runner.
//!
//! Runs one tick every `agent.tick_interval_secs` on the current task, so
//! ticks never overlap; a tick that overruns delays the next one instead of
//! bursting. Assumes it is the only scheduler running against the database.

use anyhow::Result;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::bootstrap::App;
use crate::config::Config;

pub async fn run_daemon(config: Config) -> Result<()> {
    let interval_secs = config.agent.tick_interval_secs;
    let mut app = App::bootstrap(config).await?;

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    println!(
        "listing-agent daemon started (tick every {}s). Press Ctrl-C to stop.",
        interval_secs
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                // Pick up option changes made since the last tick.
                if let Err(e) = app.reload_settings().await {
                    tracing::warn!(error = %format!("{:#}", e), "failed to reload settings");
                }
                match app.runner() {
                    Ok(runner) => {
                        runner.tick().await;
                    }
                    Err(e) => tracing::error!(error = %format!("{:#}", e), "failed to build runner"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down.");
                break;
            }
        }
    }

    app.pool.close().await;
    Ok(())
}
