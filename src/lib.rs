//! # Elevation Bridge
//!
//! Keeps a local SQLite cache of an upstream project hierarchy in sync and
//! extracts structured data from each elevation's embedded database.
//!
//! The hierarchy is four levels deep:
//! directories → projects → phases → elevations. Directories can be excluded
//! from sync (upstream flag or local override), and exclusion propagates to
//! every descendant. Each elevation carries a binary blob that is itself a
//! small SQLite database; the bridge validates it, extracts its fields and
//! glass specifications, scores the result and stores it, skipping blobs it
//! has already parsed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Upstream   │──▶│ Orchestrator │──▶│  Job queue   │
//! │ REST / test │   │ diff + stale │   │ keyed, 2 lane│
//! └─────────────┘   └──────┬───────┘   └──────┬───────┘
//!                          │                  ▼
//!                          │           ┌──────────────┐
//!                          │           │    Parser    │
//!                          │           │ hash→validate│
//!                          │           │ →extract     │
//!                          ▼           └──────┬───────┘
//!                    ┌─────────────────────────────────┐
//!                    │     SQLite cache (sqlx, WAL)     │
//!                    └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`bridge`] | Public facade: triggers, queries, lifecycle |
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Cache records and status enums |
//! | [`upstream`] | Upstream trait and retry policy |
//! | [`upstream_http`] | REST implementation of the upstream |
//! | [`exclusion`] | Directory exclusion propagation |
//! | [`staleness`] | Staleness policy |
//! | [`store`] | Hierarchy rows in the cache |
//! | [`orchestrator`] | Sync sessions across levels |
//! | [`queue`] | Keyed job queue and worker pool |
//! | [`blob`] | Scoped access to an embedded blob |
//! | [`validate`] | Structural validation of blobs |
//! | [`parser`] | Content-addressed parse pipeline |
//! | [`quality`] | Data-quality scoring |
//! | [`idempotency`] | Per-elevation parse state and atomic commit |
//! | [`session`] | Sync summaries and session audit rows |
//! | [`get`] | Read-side lookups and filtered listings |
//! | [`stats`] | Cache statistics |

pub mod blob;
pub mod bridge;
pub mod config;
pub mod db;
pub mod error;
pub mod exclusion;
pub mod get;
pub mod hash;
pub mod idempotency;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod quality;
pub mod queue;
pub mod session;
pub mod staleness;
pub mod stats;
pub mod store;
pub mod upstream;
pub mod upstream_http;
pub mod validate;

#[cfg(test)]
mod test_blobs;

pub use bridge::{Bridge, SyncScope};
pub use config::{load_config, Config};
pub use error::{JobError, ParseError, UpstreamError, ValidationError};
pub use get::CachedEntity;
pub use models::{ElevationRecord, GlassSpecification, Level, ParseStatus, ProjectRecord, SyncStatus};
pub use parser::ParseResult;
pub use session::SyncSummary;
pub use upstream::{Upstream, UpstreamDirectory, UpstreamEntity};
