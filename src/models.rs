//! Core data models used throughout the listing agent.
//!
//! These types describe the ingest items that flow through the pipeline and
//! the closed sets (stage, source kind, target type) that classify them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of an ingest item. Stable for the item's lifetime.
pub type ItemId = i64;

/// A value that failed to parse into one of the closed sets below.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}' (expected one of: {expected})")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Position of an item in the pipeline.
///
/// ```text
/// new ─▶ classified ─▶ enriched ─▶ rewritten ─▶ scored ─┬▶ published
///                                                        ├▶ ready_for_review
///                                                        └▶ error_publish
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    New,
    Classified,
    Enriched,
    Rewritten,
    Scored,
    Published,
    ReadyForReview,
    ErrorPublish,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 8] = [
        Stage::New,
        Stage::Classified,
        Stage::Enriched,
        Stage::Rewritten,
        Stage::Scored,
        Stage::Published,
        Stage::ReadyForReview,
        Stage::ErrorPublish,
    ];

    /// Stages that still have a handler to run.
    pub const ACTIVE: [Stage; 5] = [
        Stage::New,
        Stage::Classified,
        Stage::Enriched,
        Stage::Rewritten,
        Stage::Scored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Classified => "classified",
            Stage::Enriched => "enriched",
            Stage::Rewritten => "rewritten",
            Stage::Scored => "scored",
            Stage::Published => "published",
            Stage::ReadyForReview => "ready_for_review",
            Stage::ErrorPublish => "error_publish",
        }
    }

    /// True for `published`, `ready_for_review` and `error_publish`.
    pub fn is_terminal(&self) -> bool {
        !Self::ACTIVE.contains(self)
    }

    /// Stages a successful handler run may move an item to.
    pub fn next_stages(&self) -> &'static [Stage] {
        match self {
            Stage::New => &[Stage::Classified],
            Stage::Classified => &[Stage::Enriched],
            Stage::Enriched => &[Stage::Rewritten],
            Stage::Rewritten => &[Stage::Scored],
            Stage::Scored => &[
                Stage::Published,
                Stage::ReadyForReview,
                Stage::ErrorPublish,
            ],
            Stage::Published | Stage::ReadyForReview | Stage::ErrorPublish => &[],
        }
    }

    /// Whether the handler that runs for items at this stage needs a
    /// language model (Classify for `new`, Rewrite for `enriched`).
    pub fn requires_model(&self) -> bool {
        matches!(self, Stage::New | Stage::Enriched)
    }

    /// Stage a forced reprocess rewinds a rest state to.
    pub fn rewind_target(&self) -> Option<Stage> {
        match self {
            Stage::ReadyForReview | Stage::ErrorPublish => Some(Stage::Scored),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ParseError {
                kind: "stage",
                value: s.to_string(),
                expected: "new, classified, enriched, rewritten, scored, published, ready_for_review, error_publish",
            })
    }
}

/// Kind of the source record an item was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Event,
    Place,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Event => "event",
            ItemKind::Place => "place",
        }
    }

    /// Content type an item of this kind becomes unless corrected later.
    pub fn default_target(&self) -> TargetType {
        match self {
            ItemKind::Event => TargetType::LocalEvent,
            ItemKind::Place => TargetType::LocalPlace,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(ItemKind::Event),
            "place" => Ok(ItemKind::Place),
            other => Err(ParseError {
                kind: "item type",
                value: other.to_string(),
                expected: "event, place",
            }),
        }
    }
}

/// What an item should become once published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    LocalPlace,
    LocalEvent,
    City,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::LocalPlace => "local_place",
            TargetType::LocalEvent => "local_event",
            TargetType::City => "city",
        }
    }

    /// Parse an operator-supplied content target. Only places and events
    /// are valid filters for batch runs.
    pub fn parse_content_target(s: &str) -> Result<Self, ParseError> {
        match s {
            "local_place" => Ok(TargetType::LocalPlace),
            "local_event" => Ok(TargetType::LocalEvent),
            other => Err(ParseError {
                kind: "target",
                value: other.to_string(),
                expected: "local_place, local_event",
            }),
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_place" => Ok(TargetType::LocalPlace),
            "local_event" => Ok(TargetType::LocalEvent),
            "city" => Ok(TargetType::City),
            other => Err(ParseError {
                kind: "target",
                value: other.to_string(),
                expected: "local_place, local_event, city",
            }),
        }
    }
}

/// Well-known metadata keys written by the stage handlers and operator tools.
pub mod keys {
    pub const RAW_PAYLOAD: &str = "raw_payload";
    pub const RAW_PAYLOAD_LEGACY: &str = "_raw_data";
    pub const CLASSIFICATION: &str = "classification";
    pub const ENRICHMENT: &str = "enrichment";
    pub const REWRITTEN_CONTENT: &str = "rewritten_content";
    pub const REWRITE_SOURCE: &str = "rewrite_source";
    pub const SCORE: &str = "score";
    pub const SCORE_BREAKDOWN: &str = "score_breakdown";
    pub const PUBLISHED_POST_ID: &str = "published_post_id";
    pub const LAST_ERROR: &str = "last_error";
    pub const SOURCE_POST_ID: &str = "source_post_id";
    pub const IS_REIMPORT: &str = "is_reimport";
}

/// Snapshot of an ingest item's row. Metadata is read separately through
/// the record store.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestItem {
    pub id: ItemId,
    pub kind: ItemKind,
    pub target: TargetType,
    pub stage: Stage,
    pub payload_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Selection criteria for [`RecordStore::select`](crate::store::RecordStore::select).
///
/// Results are always ordered oldest first.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Empty means every stage.
    pub stages: Vec<Stage>,
    pub target: Option<TargetType>,
    pub limit: Option<usize>,
}

impl ItemFilter {
    pub fn stages(stages: &[Stage]) -> Self {
        Self {
            stages: stages.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: Option<TargetType>) -> Self {
        self.target = target;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, item: &IngestItem) -> bool {
        (self.stages.is_empty() || self.stages.contains(&item.stage))
            && self.target.map_or(true, |t| t == item.target)
    }
}

/// A JSON mapping, the shape every structured metadata read returns.
pub type Mapping = Map<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_roundtrips_through_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("draft".parse::<Stage>().is_err());
    }

    #[test]
    fn terminal_stages_have_no_successors() {
        for stage in Stage::ALL {
            assert_eq!(stage.is_terminal(), stage.next_stages().is_empty());
        }
    }

    #[test]
    fn only_model_stages_require_provider() {
        assert!(Stage::New.requires_model());
        assert!(Stage::Enriched.requires_model());
        assert!(!Stage::Classified.requires_model());
        assert!(!Stage::Rewritten.requires_model());
        assert!(!Stage::Scored.requires_model());
    }

    #[test]
    fn content_target_rejects_city() {
        assert!(TargetType::parse_content_target("city").is_err());
        assert_eq!(
            TargetType::parse_content_target("local_event").unwrap(),
            TargetType::LocalEvent
        );
        assert_eq!("city".parse::<TargetType>().unwrap(), TargetType::City);
    }
}
