//! # HoloIndex Core
//!
//! Runtime-free logic for HoloIndex: data model, error taxonomy, store
//! abstraction, vector index, intent classification, component routing,
//! complexity estimation, output composition, feedback math and health
//! scoring.
//!
//! This crate contains no tokio, sqlx, HTTP clients or filesystem I/O.
//! Everything that talks to the outside world is behind a trait
//! ([`store::EntityStore`], [`store::CoordinationStore`],
//! [`embedding::Embedder`], [`engine::ReasoningEngine`]) and implemented
//! in the `holo-index` application crate.

pub mod complexity;
pub mod compose;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod health;
pub mod index;
pub mod intent;
pub mod models;
pub mod router;
pub mod store;

pub use error::{HoloError, HoloResult};
