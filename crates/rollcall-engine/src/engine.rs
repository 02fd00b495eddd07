//! Engine thread and handle — the API surface consumed by UI/CLI callers.
//!
//! All engine state (face database, attendance store, resolver) is owned by
//! one dedicated OS thread running a request loop. Callers hold a clone-able
//! [`EngineHandle`] and await replies, so concurrent mutations are
//! linearized without the caller ever blocking on the full batch: progress
//! flows over a channel and batches honor a cancellation token.

use crate::attendance::{
    AttendanceRecord, AttendanceStats, AttendanceStore, MarkOutcome, SessionKey, StoreError,
};
use crate::config::Config;
use crate::facedb::{DbError, FaceDatabase};
use crate::ingest::{self, IngestionReport, Progress, ProgressFn};
use crate::resolver::{ImageResolver, ResolveError};
use crate::roster::{self, RosterError};
use chrono::NaiveDate;
use rollcall_core::{DescriptorMatcher, ExtractError, FeatureExtractor, MatchOutcome, Matcher};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face database error: {0}")]
    Db(#[from] DbError),
    #[error("attendance store error: {0}")]
    Store(#[from] StoreError),
    #[error("image resolution error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("roster error: {0}")]
    Roster(#[from] RosterError),
    #[error("query image error: {0}")]
    Extract(#[from] ExtractError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Summary of the enrolled face database for display.
#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    /// (student id, display name) pairs in ascending id order.
    pub students: Vec<(String, String)>,
    pub db_path: PathBuf,
}

/// Messages sent from handles to the engine thread.
enum EngineRequest {
    IngestRoster {
        roster_path: PathBuf,
        force: bool,
        progress: Option<mpsc::UnboundedSender<Progress>>,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<IngestionReport, EngineError>>,
    },
    MatchPhoto {
        bytes: Vec<u8>,
        threshold: f32,
        reply: oneshot::Sender<Result<MatchOutcome, EngineError>>,
    },
    MatchRegions {
        regions: Vec<Vec<u8>>,
        threshold: f32,
        reply: oneshot::Sender<Vec<Result<MatchOutcome, ExtractError>>>,
    },
    MarkAttendance {
        key: SessionKey,
        confidence: f32,
        reply: oneshot::Sender<Result<MarkOutcome, EngineError>>,
    },
    RecordMatch {
        outcome: MatchOutcome,
        date: NaiveDate,
        class_id: String,
        section_id: String,
        reply: oneshot::Sender<Result<Option<(String, MarkOutcome)>, EngineError>>,
    },
    SweepAbsent {
        roster_ids: Vec<String>,
        date: NaiveDate,
        class_id: String,
        section_id: String,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Stats {
        student_id: String,
        reply: oneshot::Sender<Result<AttendanceStats, EngineError>>,
    },
    History {
        student_id: String,
        reply: oneshot::Sender<Result<Vec<AttendanceRecord>, EngineError>>,
    },
    Daily {
        date: NaiveDate,
        reply: oneshot::Sender<Result<Vec<AttendanceRecord>, EngineError>>,
    },
    DatabaseInfo {
        reply: oneshot::Sender<DatabaseInfo>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Ingest a roster file into the face database.
    ///
    /// `progress` receives one event per processed row; `cancel` stops the
    /// batch after the current row.
    pub async fn ingest_roster(
        &self,
        roster_path: impl Into<PathBuf>,
        force: bool,
        progress: Option<mpsc::UnboundedSender<Progress>>,
        cancel: CancellationToken,
    ) -> Result<IngestionReport, EngineError> {
        let roster_path = roster_path.into();
        self.request(|reply| EngineRequest::IngestRoster {
            roster_path,
            force,
            progress,
            cancel,
            reply,
        })
        .await?
    }

    /// Match a single-face query photo against the enrolled database.
    pub async fn match_photo(
        &self,
        bytes: Vec<u8>,
        threshold: f32,
    ) -> Result<MatchOutcome, EngineError> {
        self.request(|reply| EngineRequest::MatchPhoto {
            bytes,
            threshold,
            reply,
        })
        .await?
    }

    /// Match pre-cropped face regions from a group photo, one outcome per
    /// region.
    pub async fn match_regions(
        &self,
        regions: Vec<Vec<u8>>,
        threshold: f32,
    ) -> Result<Vec<Result<MatchOutcome, ExtractError>>, EngineError> {
        self.request(|reply| EngineRequest::MatchRegions {
            regions,
            threshold,
            reply,
        })
        .await
    }

    /// Mark a student present for a session key.
    pub async fn mark_attendance(
        &self,
        key: SessionKey,
        confidence: f32,
    ) -> Result<MarkOutcome, EngineError> {
        self.request(|reply| EngineRequest::MarkAttendance {
            key,
            confidence,
            reply,
        })
        .await?
    }

    /// Record the top candidate of a match outcome as present.
    ///
    /// Returns the (student id, mark outcome) pair, or `None` when the
    /// outcome carried no confident candidate.
    pub async fn record_match(
        &self,
        outcome: MatchOutcome,
        date: NaiveDate,
        class_id: impl Into<String>,
        section_id: impl Into<String>,
    ) -> Result<Option<(String, MarkOutcome)>, EngineError> {
        let (class_id, section_id) = (class_id.into(), section_id.into());
        self.request(|reply| EngineRequest::RecordMatch {
            outcome,
            date,
            class_id,
            section_id,
            reply,
        })
        .await?
    }

    /// Materialize Absent rows for enrolled students with no record for the
    /// session.
    pub async fn sweep_absent(
        &self,
        roster_ids: Vec<String>,
        date: NaiveDate,
        class_id: impl Into<String>,
        section_id: impl Into<String>,
    ) -> Result<usize, EngineError> {
        let (class_id, section_id) = (class_id.into(), section_id.into());
        self.request(|reply| EngineRequest::SweepAbsent {
            roster_ids,
            date,
            class_id,
            section_id,
            reply,
        })
        .await?
    }

    pub async fn stats(&self, student_id: impl Into<String>) -> Result<AttendanceStats, EngineError> {
        let student_id = student_id.into();
        self.request(|reply| EngineRequest::Stats { student_id, reply })
            .await?
    }

    pub async fn history(
        &self,
        student_id: impl Into<String>,
    ) -> Result<Vec<AttendanceRecord>, EngineError> {
        let student_id = student_id.into();
        self.request(|reply| EngineRequest::History { student_id, reply })
            .await?
    }

    pub async fn daily(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.request(|reply| EngineRequest::Daily { date, reply })
            .await?
    }

    pub async fn database_info(&self) -> Result<DatabaseInfo, EngineError> {
        self.request(|reply| EngineRequest::DatabaseInfo { reply })
            .await
    }
}

/// Everything the engine thread owns.
struct EngineState {
    config: Config,
    db: FaceDatabase,
    store: AttendanceStore,
    resolver: ImageResolver,
    extractor: FeatureExtractor,
    matcher: DescriptorMatcher,
}

/// Spawn the engine on a dedicated OS thread.
///
/// All state is constructed on the engine thread itself: the resolver's
/// blocking HTTP client must not be built inside an async runtime, and the
/// sqlite connection never leaves the thread that uses it. Construction is
/// still fail-fast; the first error is reported back before this returns.
/// Dropping every handle shuts the thread down.
pub fn spawn_engine(config: Config) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), EngineError>>();

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            let mut state = match EngineState::initialize(config) {
                Ok(state) => {
                    let _ = ready_tx.send(Ok(()));
                    state
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                state.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(|_| EngineError::ChannelClosed)?;

    ready_rx.recv().map_err(|_| EngineError::ChannelClosed)??;
    Ok(EngineHandle { tx })
}

impl EngineState {
    fn initialize(config: Config) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.data_dir).map_err(DbError::Io)?;

        let db = FaceDatabase::load(&config.face_db_path)?;
        tracing::info!(
            path = %config.face_db_path.display(),
            students = db.len(),
            "face database ready"
        );

        let store = AttendanceStore::open(&config.attendance_db_path)?;
        tracing::info!(path = %config.attendance_db_path.display(), "attendance store ready");

        let resolver = ImageResolver::new(
            config.image_cache_dir.clone(),
            Duration::from_secs(config.fetch_timeout_secs),
        )?;
        let extractor = FeatureExtractor::new(config.normalize_size);

        Ok(Self {
            config,
            db,
            store,
            resolver,
            extractor,
            matcher: DescriptorMatcher,
        })
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::IngestRoster {
                roster_path,
                force,
                progress,
                cancel,
                reply,
            } => {
                let result = self.run_ingest(&roster_path, force, progress, &cancel);
                let _ = reply.send(result);
            }
            EngineRequest::MatchPhoto {
                bytes,
                threshold,
                reply,
            } => {
                let result = self
                    .extractor
                    .extract(&bytes)
                    .map_err(EngineError::from)
                    .map(|probe| self.matcher.rank(&probe, &self.db.gallery(), threshold));
                let _ = reply.send(result);
            }
            EngineRequest::MatchRegions {
                regions,
                threshold,
                reply,
            } => {
                let outcomes = self.matcher.rank_regions(
                    &regions,
                    &self.extractor,
                    &self.db.gallery(),
                    threshold,
                );
                let _ = reply.send(outcomes);
            }
            EngineRequest::MarkAttendance {
                key,
                confidence,
                reply,
            } => {
                let result = self
                    .store
                    .mark_attendance(&key, confidence)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::RecordMatch {
                outcome,
                date,
                class_id,
                section_id,
                reply,
            } => {
                let result = match outcome.top() {
                    Some(candidate) => {
                        let key = SessionKey {
                            student_id: candidate.student_id.clone(),
                            date,
                            class_id,
                            section_id,
                        };
                        self.store
                            .mark_attendance(&key, candidate.score)
                            .map(|mark| Some((candidate.student_id.clone(), mark)))
                            .map_err(EngineError::from)
                    }
                    None => Ok(None),
                };
                let _ = reply.send(result);
            }
            EngineRequest::SweepAbsent {
                roster_ids,
                date,
                class_id,
                section_id,
                reply,
            } => {
                let result = self
                    .store
                    .sweep_absent(&roster_ids, date, &class_id, &section_id)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Stats { student_id, reply } => {
                let _ = reply.send(self.store.stats(&student_id).map_err(EngineError::from));
            }
            EngineRequest::History { student_id, reply } => {
                let _ = reply.send(self.store.history(&student_id).map_err(EngineError::from));
            }
            EngineRequest::Daily { date, reply } => {
                let _ = reply.send(self.store.daily(date).map_err(EngineError::from));
            }
            EngineRequest::DatabaseInfo { reply } => {
                let info = DatabaseInfo {
                    students: self
                        .db
                        .all()
                        .map(|(id, entry)| (id.clone(), entry.name.clone()))
                        .collect(),
                    db_path: self.config.face_db_path.clone(),
                };
                let _ = reply.send(info);
            }
        }
    }

    fn run_ingest(
        &mut self,
        roster_path: &std::path::Path,
        force: bool,
        progress: Option<mpsc::UnboundedSender<Progress>>,
        cancel: &CancellationToken,
    ) -> Result<IngestionReport, EngineError> {
        let roster = roster::load_roster(roster_path)?;
        for malformed in &roster.malformed {
            tracing::warn!(line = malformed.line, reason = %malformed.reason, "roster row skipped");
        }

        let observer = progress.map(|tx| {
            move |p: Progress| {
                let _ = tx.send(p);
            }
        });

        let report = ingest::ingest(
            &roster.rows,
            &mut self.db,
            &self.config.face_db_path,
            &self.resolver,
            &self.extractor,
            force,
            observer.as_ref().map(|f| f as &ProgressFn),
            cancel,
        )?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::AttendanceStatus;
    use crate::ingest::BatchOutcome;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png(rgb: [u8; 3]) -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(16, 16, Rgb(rgb))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn write_roster(dir: &TempDir, rows: &[(&str, &str, &[u8; 3])]) -> PathBuf {
        let mut contents = String::from("id,name,image\n");
        for (id, name, rgb) in rows {
            let photo = dir.path().join(format!("{id}.png"));
            std::fs::write(&photo, png(**rgb)).unwrap();
            contents.push_str(&format!("{id},{name},{}\n", photo.display()));
        }
        let path = dir.path().join("roster.csv");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn test_engine(dir: &TempDir) -> EngineHandle {
        spawn_engine(Config::with_data_dir(dir.path().join("data"))).unwrap()
    }

    // The resolver's blocking HTTP client may not be constructed inside an
    // async runtime, so spawning from a runtime thread must still succeed
    // and leave the handle usable.
    #[tokio::test]
    async fn test_spawn_engine_inside_async_runtime() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp);
        let info = engine.database_info().await.unwrap();
        assert!(info.students.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_engine_fails_fast_on_corrupt_face_database() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_data_dir(tmp.path().join("data"));
        std::fs::create_dir_all(&config.data_dir).unwrap();
        std::fs::write(&config.face_db_path, "{not json").unwrap();

        let err = spawn_engine(config).unwrap_err();
        assert!(matches!(err, EngineError::Db(DbError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_ingest_then_match_identical_photo() {
        let tmp = TempDir::new().unwrap();
        let roster = write_roster(
            &tmp,
            &[
                ("STU001", "John Doe", &[200, 40, 40]),
                ("STU002", "Jane Roe", &[40, 200, 40]),
                ("STU003", "Jim Poe", &[40, 40, 200]),
            ],
        );
        let engine = test_engine(&tmp);

        let report = engine
            .ingest_roster(&roster, false, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, BatchOutcome::Completed);
        assert_eq!(report.succeeded, 3);

        // A query identical to John's reference photo scores 1.0.
        let outcome = engine.match_photo(png([200, 40, 40]), 0.5).await.unwrap();
        let MatchOutcome::Matched(candidates) = outcome else {
            panic!("expected a confident match");
        };
        assert_eq!(candidates[0].student_id, "STU001");
        assert!((candidates[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_match_and_record_creates_present_record() {
        let tmp = TempDir::new().unwrap();
        let roster = write_roster(&tmp, &[("STU001", "John Doe", &[180, 90, 20])]);
        let engine = test_engine(&tmp);
        engine
            .ingest_roster(&roster, false, None, CancellationToken::new())
            .await
            .unwrap();

        let outcome = engine.match_photo(png([180, 90, 20]), 0.5).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        let marked = engine
            .record_match(outcome, date, "CS101", "A")
            .await
            .unwrap();
        let (student, mark) = marked.unwrap();
        assert_eq!(student, "STU001");
        assert_eq!(mark, MarkOutcome::Created);

        let history = engine.history("STU001").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AttendanceStatus::Present);
        assert_eq!(history[0].date, date);
    }

    #[tokio::test]
    async fn test_unenrolled_face_yields_no_confident_match_and_no_record() {
        let tmp = TempDir::new().unwrap();
        let roster = write_roster(
            &tmp,
            &[
                ("STU001", "A", &[250, 250, 250]),
                ("STU002", "B", &[240, 240, 240]),
                ("STU003", "C", &[230, 230, 230]),
            ],
        );
        let engine = test_engine(&tmp);
        engine
            .ingest_roster(&roster, false, None, CancellationToken::new())
            .await
            .unwrap();

        // A near-black query is far from every enrolled bright reference.
        let outcome = engine.match_photo(png([5, 5, 5]), 0.5).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::NoConfidentMatch { .. }));

        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        let marked = engine
            .record_match(outcome, date, "CS101", "A")
            .await
            .unwrap();
        assert!(marked.is_none());
        assert!(engine.daily(date).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_row_reported_and_absent_from_database() {
        let tmp = TempDir::new().unwrap();
        let photo = tmp.path().join("ok.png");
        std::fs::write(&photo, png([10, 120, 240])).unwrap();
        let roster_path = tmp.path().join("roster.csv");
        std::fs::write(
            &roster_path,
            format!(
                "id,name,image\nSTU001,John Doe,{}\nSTU002,Jane Roe,/nonexistent/missing.jpg\n",
                photo.display()
            ),
        )
        .unwrap();

        let engine = test_engine(&tmp);
        let report = engine
            .ingest_roster(&roster_path, false, None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "STU002");

        let info = engine.database_info().await.unwrap();
        let ids: Vec<&str> = info.students.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["STU001"]);
    }

    #[tokio::test]
    async fn test_progress_events_are_delivered() {
        let tmp = TempDir::new().unwrap();
        let roster = write_roster(
            &tmp,
            &[("STU001", "A", &[10, 0, 0]), ("STU002", "B", &[0, 10, 0])],
        );
        let engine = test_engine(&tmp);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        engine
            .ingest_roster(&roster, false, Some(progress_tx), CancellationToken::new())
            .await
            .unwrap();

        let mut done = Vec::new();
        while let Ok(p) = progress_rx.try_recv() {
            done.push(p.done);
        }
        assert_eq!(done, [1, 2]);
    }

    #[tokio::test]
    async fn test_match_regions_returns_one_outcome_per_region() {
        let tmp = TempDir::new().unwrap();
        let roster = write_roster(
            &tmp,
            &[
                ("STU001", "A", &[220, 20, 20]),
                ("STU002", "B", &[20, 220, 20]),
            ],
        );
        let engine = test_engine(&tmp);
        engine
            .ingest_roster(&roster, false, None, CancellationToken::new())
            .await
            .unwrap();

        let regions = vec![png([220, 20, 20]), png([20, 220, 20]), b"junk".to_vec()];
        let outcomes = engine.match_regions(regions, 0.5).await.unwrap();
        assert_eq!(outcomes.len(), 3);

        let top = |o: &MatchOutcome| o.top().unwrap().student_id.clone();
        assert_eq!(top(outcomes[0].as_ref().unwrap()), "STU001");
        assert_eq!(top(outcomes[1].as_ref().unwrap()), "STU002");
        assert!(outcomes[2].is_err());
    }

    #[tokio::test]
    async fn test_sweep_absent_after_session() {
        let tmp = TempDir::new().unwrap();
        let roster = write_roster(&tmp, &[("STU001", "A", &[200, 0, 0])]);
        let engine = test_engine(&tmp);
        engine
            .ingest_roster(&roster, false, None, CancellationToken::new())
            .await
            .unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        let key = SessionKey {
            student_id: "STU001".into(),
            date,
            class_id: "CS101".into(),
            section_id: "A".into(),
        };
        engine.mark_attendance(key, 0.9).await.unwrap();

        let created = engine
            .sweep_absent(
                vec!["STU001".into(), "STU002".into()],
                date,
                "CS101",
                "A",
            )
            .await
            .unwrap();
        assert_eq!(created, 1);

        let stats = engine.stats("STU001").await.unwrap();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.present_count, 1);
        let stats = engine.stats("STU002").await.unwrap();
        assert_eq!(stats.present_count, 0);
    }

    #[tokio::test]
    async fn test_database_survives_engine_restart() {
        let tmp = TempDir::new().unwrap();
        let roster = write_roster(&tmp, &[("STU001", "John Doe", &[120, 130, 140])]);
        let config = Config::with_data_dir(tmp.path().join("data"));

        {
            let engine = spawn_engine(config.clone()).unwrap();
            engine
                .ingest_roster(&roster, false, None, CancellationToken::new())
                .await
                .unwrap();
        }

        // A fresh engine loads the persisted database wholesale.
        let engine = spawn_engine(config).unwrap();
        let outcome = engine.match_photo(png([120, 130, 140]), 0.5).await.unwrap();
        assert_eq!(outcome.top().unwrap().student_id, "STU001");
    }
}
