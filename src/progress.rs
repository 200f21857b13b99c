//! Batch progress reporting.
//!
//! Reports per-item progress during `listing-agent agent run` so operators
//! see which item is being processed, what it became, and how much of the
//! batch is left. Progress is emitted on **stderr** so the stdout summary
//! remains parseable for scripts.

use std::io::Write;

use crate::models::{ItemId, Stage};

/// A single progress event for a batch run.
#[derive(Clone, Debug)]
pub enum BatchProgressEvent {
    /// Items selected for the batch.
    Selected { total: u64 },
    /// Item `n` of `total` advanced from one stage to another.
    Advanced {
        id: ItemId,
        from: Stage,
        to: Stage,
        n: u64,
        total: u64,
    },
    /// Item `n` of `total` failed; the message was recorded on the item.
    Failed {
        id: ItemId,
        stage: Stage,
        error: String,
        n: u64,
        total: u64,
    },
    /// Item skipped because its stage no longer matches the request.
    Skipped { id: ItemId, stage: Stage },
}

/// Reports batch progress. Implementations write to stderr (human or JSON).
pub trait BatchProgressReporter: Send + Sync {
    fn report(&self, event: BatchProgressEvent);
}

/// Human-friendly progress on stderr: "[3 / 10] item 42  enriched -> rewritten".
pub struct StderrProgress;

impl BatchProgressReporter for StderrProgress {
    fn report(&self, event: BatchProgressEvent) {
        let line = match &event {
            BatchProgressEvent::Selected { total } => {
                format!("batch  {} items selected\n", format_number(*total))
            }
            BatchProgressEvent::Advanced {
                id,
                from,
                to,
                n,
                total,
            } => format!(
                "[{} / {}] item {}  {} -> {}\n",
                format_number(*n),
                format_number(*total),
                id,
                from,
                to
            ),
            BatchProgressEvent::Failed {
                id,
                stage,
                error,
                n,
                total,
            } => format!(
                "[{} / {}] item {}  {}  FAILED: {}\n",
                format_number(*n),
                format_number(*total),
                id,
                stage,
                error
            ),
            BatchProgressEvent::Skipped { id, stage } => {
                format!("skip item {}  now at {}\n", id, stage)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BatchProgressReporter for JsonProgress {
    fn report(&self, event: BatchProgressEvent) {
        let obj = match &event {
            BatchProgressEvent::Selected { total } => serde_json::json!({
                "event": "selected",
                "total": total
            }),
            BatchProgressEvent::Advanced {
                id,
                from,
                to,
                n,
                total,
            } => serde_json::json!({
                "event": "advanced",
                "id": id,
                "from": from,
                "to": to,
                "n": n,
                "total": total
            }),
            BatchProgressEvent::Failed {
                id,
                stage,
                error,
                n,
                total,
            } => serde_json::json!({
                "event": "failed",
                "id": id,
                "stage": stage,
                "error": error,
                "n": n,
                "total": total
            }),
            BatchProgressEvent::Skipped { id, stage } => serde_json::json!({
                "event": "skipped",
                "id": id,
                "stage": stage
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl BatchProgressReporter for NoProgress {
    fn report(&self, _event: BatchProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BatchProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
