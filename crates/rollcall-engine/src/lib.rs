//! rollcall-engine — the recognition and attendance engine.
//!
//! Ingests a roster into a persisted face database, matches query photos
//! against it, and records deduplicated per-day attendance. All state lives
//! in explicit objects owned by a dedicated engine thread; callers interact
//! through a clone-able async [`engine::EngineHandle`].

pub mod attendance;
pub mod config;
pub mod engine;
pub mod facedb;
pub mod ingest;
pub mod resolver;
pub mod roster;

pub use attendance::{AttendanceRecord, AttendanceStats, AttendanceStatus, MarkOutcome, SessionKey};
pub use config::Config;
pub use engine::{spawn_engine, DatabaseInfo, EngineError, EngineHandle};
pub use ingest::{BatchOutcome, IngestionReport, Progress, RowFailure};
pub use resolver::{ImageReference, ImageResolver, ResolveError};
pub use roster::RosterRow;
