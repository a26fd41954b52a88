//! SMS mass-dispatch engine.
//!
//! Resolves a recipient selection against the contact store, sends through an
//! injected transport provider in rate-limit-safe batches, records a
//! lifecycle row per message, and reconciles asynchronous delivery callbacks
//! into those rows. Every mutating operation lands in an append-only
//! activity log.
//!
//! Layering, leaves first: [`phone`] (pure normalization/segmenting),
//! [`store`] (persistence trait with in-memory and Postgres backends),
//! [`provider`] (transport client), [`resolver`], [`dispatch`],
//! [`reconcile`], [`import`], [`audit`], and the [`api`] HTTP surface on top.

pub mod api;
pub mod audit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod import;
pub mod phone;
pub mod provider;
pub mod reconcile;
pub mod resolver;
pub mod store;
pub mod types;

pub use dispatch::{DispatchConfig, Dispatcher};
pub use error::{EngineError, Result};
pub use import::Importer;
pub use phone::{normalize, segment_count, E164};
pub use reconcile::Reconciler;
