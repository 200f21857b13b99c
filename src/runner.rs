//! Batch execution of the pipeline.
//!
//! Two entry points drive [`Pipeline::process`] over many items:
//!
//! - [`Runner::tick`]: the scheduled job. Polls ingestors, then processes
//!   up to `tick_cap` active items oldest first, with a small random chance
//!   of stopping after each item to bound tick duration. When the model
//!   provider is not configured, stages that need it are left alone.
//! - [`run_batch`]: the operator batch behind `agent run`, with stage and
//!   target filters, `force` reprocessing and a throttle between items.
//!
//! Both loops are sequential and isolate failures per item: a failing item
//! is counted and recorded, and the loop moves on.

use std::sync::Arc;
use std::time::Duration;

use crate::ingestors::Ingestor;
use crate::models::{ItemFilter, ItemId, Stage, TargetType};
use crate::progress::{BatchProgressEvent, BatchProgressReporter};
use crate::stages::Pipeline;

/// Counts reported at the end of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// Summary of one scheduled tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Pipeline disabled; nothing was done.
    pub disabled: bool,
    pub enqueued: usize,
    pub processed: usize,
    pub errors: usize,
    pub early_exit: bool,
    /// The model provider was unconfigured; `new` and `enriched` items
    /// were not selected.
    pub model_unavailable: bool,
}

/// Scheduled batch runner.
pub struct Runner {
    pipeline: Arc<Pipeline>,
    ingestors: Vec<Box<dyn Ingestor>>,
    enabled: bool,
    tick_cap: usize,
    early_exit_probability: f64,
}

impl Runner {
    pub fn new(
        pipeline: Arc<Pipeline>,
        ingestors: Vec<Box<dyn Ingestor>>,
        enabled: bool,
        tick_cap: usize,
        early_exit_probability: f64,
    ) -> Self {
        Self {
            pipeline,
            ingestors,
            enabled,
            tick_cap,
            early_exit_probability: early_exit_probability.clamp(0.0, 1.0),
        }
    }

    /// One scheduled invocation.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if !self.enabled {
            tracing::warn!("pipeline disabled (agent_enabled=false); skipping tick");
            report.disabled = true;
            return report;
        }

        let store = self.pipeline.store();
        for ingestor in &self.ingestors {
            match ingestor.enqueue(store.as_ref()).await {
                Ok(n) => report.enqueued += n,
                Err(e) => {
                    tracing::warn!(ingestor = ingestor.name(), error = %format!("{:#}", e), "ingestor failed")
                }
            }
        }

        let mut stages = Stage::ACTIVE.to_vec();
        let gateway = &self.pipeline.context().gateway;
        if !gateway.model_available() {
            tracing::warn!(
                provider = gateway.provider().name(),
                "model provider not configured; skipping stages that need it"
            );
            stages.retain(|s| !s.requires_model());
            report.model_unavailable = true;
        }

        let ids = store
            .select(&ItemFilter::stages(&stages).with_limit(self.tick_cap))
            .await;
        for id in ids {
            match self.pipeline.process(id).await {
                Ok(_) => report.processed += 1,
                Err(_) => report.errors += 1,
            }
            if rand::random::<f64>() < self.early_exit_probability {
                tracing::debug!(item_id = id, "early exit");
                report.early_exit = true;
                break;
            }
        }

        tracing::info!(
            enqueued = report.enqueued,
            processed = report.processed,
            errors = report.errors,
            early_exit = report.early_exit,
            "tick complete"
        );
        report
    }
}

/// Which stages an operator batch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSelector {
    All,
    Only(Stage),
}

impl StageSelector {
    /// Parse `all` or one of the five active stages.
    pub fn parse(s: &str) -> Result<Self, crate::models::ParseError> {
        if s == "all" {
            return Ok(StageSelector::All);
        }
        match s.parse::<Stage>() {
            Ok(stage) if !stage.is_terminal() => Ok(StageSelector::Only(stage)),
            _ => Err(crate::models::ParseError {
                kind: "stage",
                value: s.to_string(),
                expected: "new, classified, enriched, rewritten, scored, all",
            }),
        }
    }

    /// Stages to select. Forced runs also pick up rest states that rewind
    /// into a selected stage.
    fn selection(&self, force: bool) -> Vec<Stage> {
        let mut stages = match self {
            StageSelector::All => Stage::ACTIVE.to_vec(),
            StageSelector::Only(stage) => vec![*stage],
        };
        if force {
            for rest in [Stage::ReadyForReview, Stage::ErrorPublish] {
                if rest.rewind_target().is_some_and(|t| stages.contains(&t)) {
                    stages.push(rest);
                }
            }
        }
        stages
    }

    /// Whether any selected stage runs a handler that needs a model.
    pub fn requires_model(&self) -> bool {
        match self {
            StageSelector::All => Stage::ACTIVE.iter().any(|s| s.requires_model()),
            StageSelector::Only(stage) => stage.requires_model(),
        }
    }
}

/// Options for [`run_batch`].
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub stage: StageSelector,
    pub target: Option<TargetType>,
    pub force: bool,
    pub throttle: Duration,
}

/// Operator batch run.
pub async fn run_batch(
    pipeline: &Pipeline,
    options: &BatchOptions,
    reporter: &dyn BatchProgressReporter,
) -> BatchSummary {
    let store = pipeline.store();
    let filter = ItemFilter::stages(&options.stage.selection(options.force))
        .with_target(options.target)
        .with_limit(options.batch_size);
    let ids = store.select(&filter).await;
    let total = ids.len() as u64;
    reporter.report(BatchProgressEvent::Selected { total });

    let mut summary = BatchSummary::default();
    for (i, id) in ids.iter().copied().enumerate() {
        if i > 0 && !options.throttle.is_zero() {
            tokio::time::sleep(options.throttle).await;
        }

        let Some(current) = prepare(pipeline, id, options).await else {
            summary.skipped += 1;
            if let Some(stage) = store.stage(id).await {
                reporter.report(BatchProgressEvent::Skipped { id, stage });
            }
            continue;
        };

        let n = i as u64 + 1;
        match pipeline.process(id).await {
            Ok(outcome) => {
                summary.processed += 1;
                reporter.report(BatchProgressEvent::Advanced {
                    id,
                    from: outcome.from,
                    to: outcome.to,
                    n,
                    total,
                });
            }
            Err(e) => {
                summary.errors += 1;
                reporter.report(BatchProgressEvent::Failed {
                    id,
                    stage: current,
                    error: format!("{:#}", e),
                    n,
                    total,
                });
            }
        }
    }
    summary
}

/// Re-check the item's stage just before dispatch.
///
/// Returns the stage to process at, or `None` to skip. Under `force`, rest
/// states and items that moved away from the requested stage are rewound.
async fn prepare(pipeline: &Pipeline, id: ItemId, options: &BatchOptions) -> Option<Stage> {
    let store = pipeline.store();
    let current = store.stage(id).await?;

    let wanted = match options.stage {
        StageSelector::Only(stage) => stage,
        StageSelector::All if !current.is_terminal() => return Some(current),
        StageSelector::All => match current.rewind_target() {
            Some(target) if options.force => target,
            _ => {
                skip(id, current);
                return None;
            }
        },
    };

    if current == wanted {
        return Some(current);
    }
    if !options.force || current == Stage::Published {
        skip(id, current);
        return None;
    }

    tracing::info!(item_id = id, from = %current, to = %wanted, "rewinding for forced reprocess");
    if !store.advance(id, wanted, &[]).await {
        return None;
    }
    Some(wanted)
}

fn skip(id: ItemId, stage: Stage) {
    tracing::warn!(item_id = id, stage = %stage, "stage changed since selection; skipping");
}
