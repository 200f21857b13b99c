//! `agent` commands: batch runs, status, one-off ticks and connectivity.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::bootstrap::App;
use crate::config::Config;
use crate::models::{Stage, TargetType};
use crate::progress::ProgressMode;
use crate::runner::{run_batch, BatchOptions, StageSelector};
use crate::store::RecordStore;

/// Parse a `--progress` value.
pub fn parse_progress(value: Option<&str>) -> Result<ProgressMode> {
    match value {
        None => Ok(ProgressMode::default_for_tty()),
        Some("off") => Ok(ProgressMode::Off),
        Some("human") => Ok(ProgressMode::Human),
        Some("json") => Ok(ProgressMode::Json),
        Some(other) => bail!("Unknown progress mode '{}'. Use off, human, or json.", other),
    }
}

fn parse_target(target: Option<&str>) -> Result<Option<TargetType>> {
    Ok(target.map(TargetType::parse_content_target).transpose()?)
}

/// `agent run`
pub async fn run_agent_batch(
    config: Config,
    batch_size: Option<usize>,
    stage: &str,
    target: Option<&str>,
    force: bool,
    progress: ProgressMode,
) -> Result<()> {
    let selector = StageSelector::parse(stage)?;
    let target = parse_target(target)?;
    let batch_size = batch_size.unwrap_or(config.agent.batch_size);
    if batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }

    let app = App::bootstrap(config).await?;
    let llm = &app.settings.llm;

    if !app.settings.agent_enabled {
        eprintln!("Warning: the pipeline is disabled (agent_enabled=false); running anyway.");
    }
    if selector.requires_model() {
        if llm.provider == "none" {
            eprintln!(
                "Warning: no LLM provider configured; classification and rewriting will use heuristic fallbacks."
            );
        } else if !llm.has_credential() {
            eprintln!(
                "Warning: LLM provider '{}' is missing {}; items needing the model will fail.",
                llm.provider,
                llm.credential_key().unwrap_or("its credential")
            );
        }
    }

    let options = BatchOptions {
        batch_size,
        stage: selector,
        target,
        force,
        throttle: Duration::from_millis(app.config.agent.throttle_ms),
    };
    let reporter = progress.reporter();
    let summary = run_batch(&app.pipeline, &options, reporter.as_ref()).await;

    println!("processed: {}", summary.processed);
    println!("errors: {}", summary.errors);
    if summary.skipped > 0 {
        println!("skipped: {}", summary.skipped);
    }
    if summary.errors > 0 {
        eprintln!(
            "Warning: {} item(s) failed; see `listing-agent ingest show <id>` for last_error.",
            summary.errors
        );
    }

    app.pool.close().await;
    Ok(())
}

/// `agent status`
pub async fn run_agent_status(config: Config, target: Option<&str>, test: bool) -> Result<()> {
    let target = parse_target(target)?;
    let app = App::bootstrap(config).await?;
    let settings = &app.settings;
    let llm = &settings.llm;

    println!("Pipeline");
    println!(
        "  enabled:           {}",
        if settings.agent_enabled { "yes" } else { "no" }
    );
    println!(
        "  provider:          {} ({})",
        llm.provider,
        llm.effective_model()
    );
    match llm.credential_key() {
        Some(key) if llm.has_credential() => {
            println!("  credential:        {} set ({})", key, settings.source_of(key))
        }
        Some(key) => println!("  credential:        {} MISSING", key),
        None => println!("  credential:        not required"),
    }
    println!(
        "  publish threshold: {} ({})",
        settings.publish_threshold,
        settings.source_of("publish_threshold")
    );

    let counts = app.store.count_by_stage(target).await;
    println!();
    println!(
        "Items by stage (target: {})",
        target.map(|t| t.as_str()).unwrap_or("all")
    );
    for stage in Stage::ALL {
        println!(
            "  {:<18} {:>6}",
            stage.as_str(),
            counts.get(&stage).copied().unwrap_or(0)
        );
    }
    println!("  {:<18} {:>6}", "total", counts.values().sum::<i64>());

    if test {
        let report = app.gateway.test_connection().await;
        println!();
        if report.success {
            println!("Connection: ok - {}", report.message);
        } else {
            println!("Connection: FAILED - {}", report.message);
        }
    }

    app.pool.close().await;
    Ok(())
}

/// `agent tick`
pub async fn run_agent_tick(config: Config) -> Result<()> {
    let app = App::bootstrap(config).await?;
    let report = app.runner()?.tick().await;

    if report.disabled {
        println!("Pipeline disabled; tick skipped.");
    } else {
        println!("enqueued: {}", report.enqueued);
        println!("processed: {}", report.processed);
        println!("errors: {}", report.errors);
        if report.early_exit {
            println!("(stopped early)");
        }
        if report.model_unavailable {
            eprintln!(
                "Warning: LLM provider '{}' is not configured; new and enriched items were skipped.",
                app.settings.llm.provider
            );
        }
    }

    app.pool.close().await;
    Ok(())
}

/// `agent test-connection`
pub async fn run_test_connection(config: Config) -> Result<()> {
    let app = App::bootstrap(config).await?;
    let provider = app.gateway.provider();
    println!("Testing {} ({})...", provider.name(), provider.model());

    let report = app.gateway.test_connection().await;
    app.pool.close().await;

    if !report.success {
        bail!("Connection failed: {}", report.message);
    }
    println!("{}", report.message);
    if let Some(response) = report.response {
        println!("Response: {}", response);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_modes() {
        assert_eq!(parse_progress(Some("json")).unwrap(), ProgressMode::Json);
        assert_eq!(parse_progress(Some("off")).unwrap(), ProgressMode::Off);
        assert!(parse_progress(Some("loud")).is_err());
    }

    #[test]
    fn city_is_not_a_batch_target() {
        assert!(parse_target(Some("city")).is_err());
        assert_eq!(
            parse_target(Some("local_event")).unwrap(),
            Some(TargetType::LocalEvent)
        );
        assert_eq!(parse_target(None).unwrap(), None);
    }
}
