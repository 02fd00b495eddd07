//! Dataset ingestion — roster rows to a populated, persisted face database.
//!
//! Rows are processed independently: one row's failure is recorded in the
//! batch report and never aborts the batch. The face database is persisted
//! exactly once, after the loop, so a half-written database is never
//! visible mid-batch.

use crate::facedb::{DbError, FaceDatabase};
use crate::resolver::{ImageReference, ImageResolver, ResolveError};
use crate::roster::RosterRow;
use rollcall_core::{ExtractError, FeatureExtractor};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why one roster row failed to ingest.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// Incremental progress for a long-running batch: monotonically increasing
/// `done` plus the item currently being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
    pub current_id: String,
}

/// Progress observer invoked after each row. The lifetime lets observers
/// borrow caller-owned state for the duration of one batch.
pub type ProgressFn<'a> = dyn Fn(Progress) + Send + 'a;

/// Whether a batch ran to completion or stopped on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug)]
pub struct RowFailure {
    pub id: String,
    pub reason: IngestError,
}

/// Outcome of one ingestion batch.
#[derive(Debug)]
pub struct IngestionReport {
    pub outcome: BatchOutcome,
    pub succeeded: usize,
    /// Ids whose earlier roster occurrence was superseded by a later row.
    pub superseded: Vec<String>,
    pub failed: Vec<RowFailure>,
}

/// Ingest roster rows into the face database and persist it.
///
/// Cancellation is checked between rows: the database ends up in the
/// last-fully-applied-row state, which is still persisted, and the report
/// says `Cancelled` rather than pretending the batch completed.
///
/// A persistence failure is fatal to the operation; row-level errors are
/// not.
#[allow(clippy::too_many_arguments)]
pub fn ingest(
    rows: &[RosterRow],
    db: &mut FaceDatabase,
    db_path: &Path,
    resolver: &ImageResolver,
    extractor: &FeatureExtractor,
    force: bool,
    progress: Option<&ProgressFn>,
    cancel: &CancellationToken,
) -> Result<IngestionReport, DbError> {
    // Last occurrence of each id wins; earlier occurrences are superseded
    // and skipped without fetching their images.
    let mut last_occurrence: HashMap<&str, usize> = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        last_occurrence.insert(row.id.as_str(), idx);
    }

    let total = rows.len();
    let mut report = IngestionReport {
        outcome: BatchOutcome::Completed,
        succeeded: 0,
        superseded: Vec::new(),
        failed: Vec::new(),
    };

    for (idx, row) in rows.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::info!(done = idx, total, "ingestion cancelled");
            report.outcome = BatchOutcome::Cancelled;
            break;
        }

        if last_occurrence[row.id.as_str()] != idx {
            tracing::debug!(id = %row.id, row = idx + 1, "superseded by a later roster row");
            report.superseded.push(row.id.clone());
        } else {
            match ingest_row(row, resolver, extractor, force) {
                Ok((name, descriptor)) => {
                    db.put(row.id.clone(), name, descriptor);
                    report.succeeded += 1;
                }
                Err(reason) => {
                    tracing::warn!(id = %row.id, error = %reason, "roster row failed");
                    report.failed.push(RowFailure {
                        id: row.id.clone(),
                        reason,
                    });
                }
            }
        }

        if let Some(observer) = progress {
            observer(Progress {
                done: idx + 1,
                total,
                current_id: row.id.clone(),
            });
        }
    }

    // Batched write: exactly one persist per batch, also after cancellation
    // so the applied rows are durable.
    db.persist(db_path)?;

    tracing::info!(
        outcome = ?report.outcome,
        succeeded = report.succeeded,
        failed = report.failed.len(),
        superseded = report.superseded.len(),
        "ingestion finished"
    );
    Ok(report)
}

fn ingest_row(
    row: &RosterRow,
    resolver: &ImageResolver,
    extractor: &FeatureExtractor,
    force: bool,
) -> Result<(String, rollcall_core::FaceDescriptor), IngestError> {
    let reference = ImageReference::classify(&row.image);
    let bytes = resolver.resolve(&row.id, &reference, force)?;
    let descriptor = extractor.extract(&bytes)?;
    Ok((row.name.clone(), descriptor))
}
