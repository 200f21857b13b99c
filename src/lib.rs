//! # Listing Agent
//!
//! A resumable, multi-stage enrichment pipeline that turns raw scraped
//! place and event records into published listings.
//!
//! Every ingested record becomes an *item* that moves through a persistent
//! state machine, one stage per step, driven either by a scheduled tick or
//! by an operator batch run:
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌────────┐   ┌──────────┐
//! │ Ingestors │──▶│ Classify │──▶│  Enrich  │──▶│  Rewrite  │──▶│ Score  │──▶│ Publish  │
//! │  (inbox)  │   │  (LLM)   │   │ (context)│   │   (LLM)   │   │        │   │(listings)│
//! └───────────┘   └──────────┘   └──────────┘   └───────────┘   └────────┘   └──────────┘
//!                       │                             │
//!                       └──────── Model Gateway ──────┘
//!                          OpenAI / Anthropic / custom
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! listing-agent init                          # create database
//! listing-agent ingest add place.json         # enqueue a record
//! listing-agent option set llm_provider openai
//! listing-agent agent run --stage all         # advance items one stage
//! listing-agent agent status --test
//! listing-agent daemon                        # tick every 10 minutes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`settings`] | Constant > options bag > file resolution |
//! | [`models`] | Stages, item kinds, targets, metadata keys |
//! | [`store`] | Record store trait, SQLite and in-memory backends |
//! | [`gateway`] | Model provider abstraction and adapters |
//! | [`stages`] | The five stage handlers and the pipeline dispatcher |
//! | [`runner`] | Scheduled ticks and operator batch runs |
//! | [`listings`] | Publication target |
//! | [`ingestors`] | Sources of new items |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod agent_cmd;
pub mod bootstrap;
pub mod config;
pub mod context_sources;
pub mod daemon;
pub mod db;
pub mod gateway;
pub mod ingest_cmd;
pub mod ingestors;
pub mod listings;
pub mod migrate;
pub mod models;
pub mod option_cmd;
pub mod options;
pub mod places;
pub mod progress;
pub mod runner;
pub mod settings;
pub mod stages;
pub mod store;
