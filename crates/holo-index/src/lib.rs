//! # HoloIndex
//!
//! **Semantic search over a codebase and its documentation, with
//! intent-driven orchestration that learns from feedback.**
//!
//! A query is classified into an intent, routed to the components that
//! serve that intent best, executed under per-component time budgets, and
//! composed into one deduplicated answer. Ratings of past answers adjust the
//! learned affinity between components and intents.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │ Classify │──▶│  Route   │──▶│   Execute    │──▶│ Compose  │
//! │ (intent) │   │ (weights)│   │ search+reason│   │ (dedup)  │
//! └──────────┘   └────▲─────┘   └──────┬───────┘   └──────────┘
//!                     │                │
//!               ┌─────┴────────────────▼─────┐
//!               │  SQLite coordination store │◀── feedback learner
//!               │  weights, health, trail    │
//!               └────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! holo init
//! holo ingest entities.jsonl
//! holo query "where is the rate limiter"
//! holo feedback <query-id> --relevance 0.9 --noise 0.1 --completeness 0.8 --efficiency 0.9
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite pool (WAL, busy timeout) |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite implementation of the entity and coordination stores |
//! | [`embedding`] | Embedding providers and bounded retry |
//! | [`engines`] | Reasoning engine providers |
//! | [`router`] | Store-backed routing with a last-known-weights cache |
//! | [`orchestrator`] | Query state machine and component execution |
//! | [`learner`] | Feedback learner |
//! | [`health`] | Health scorer service |
//! | [`breadcrumbs`] | Audit trail with an outage backlog |
//! | [`ingest`] | JSONL indexing feed and re-embedding |
//! | [`service`] | [`HoloIndex`]: wiring for one process |
//! | [`logging`] | `tracing-subscriber` setup for the binary |
//!
//! Pure logic (classification, routing rules, composition, scoring) lives in
//! the `holo-index-core` crate.

pub mod breadcrumbs;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engines;
pub mod health;
pub mod ingest;
pub mod learner;
pub mod logging;
pub mod migrate;
pub mod orchestrator;
pub mod router;
pub mod service;
pub mod sqlite_store;

pub use service::HoloIndex;
