use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::MatchOutcome;
use rollcall_engine::{
    roster, spawn_engine, AttendanceStatus, BatchOutcome, Config, EngineHandle, Progress,
    SessionKey,
};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "rollcall", about = "Roster-driven face matching and attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a roster file into the face database
    Ingest {
        /// Path to the roster CSV (id, name, image columns)
        roster: PathBuf,
        /// Re-fetch images even when a cached copy exists
        #[arg(short, long)]
        force: bool,
    },
    /// Match a query photo against the enrolled database
    Match {
        /// Path to the query image
        photo: PathBuf,
        /// Minimum similarity for a confident match
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Match a query photo and record the best match as present
    Record {
        /// Path to the query image
        photo: PathBuf,
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Session date (YYYY-MM-DD, defaults to today)
        #[arg(short, long)]
        date: Option<NaiveDate>,
        #[arg(short, long, default_value = "default")]
        class: String,
        #[arg(short, long, default_value = "default")]
        section: String,
    },
    /// Mark a student present by hand
    Mark {
        /// Student id
        student: String,
        #[arg(short, long)]
        date: Option<NaiveDate>,
        #[arg(short, long, default_value = "default")]
        class: String,
        #[arg(short, long, default_value = "default")]
        section: String,
        /// Confidence to record
        #[arg(long, default_value_t = 1.0)]
        confidence: f32,
    },
    /// Mark enrolled students with no record for a session as absent
    Sweep {
        /// Roster file naming the students the session covers
        roster: PathBuf,
        #[arg(short, long)]
        date: Option<NaiveDate>,
        #[arg(short, long, default_value = "default")]
        class: String,
        #[arg(short, long, default_value = "default")]
        section: String,
    },
    /// Show attendance statistics for a student
    Stats { student: String },
    /// Show a student's attendance history, newest first
    History { student: String },
    /// Show all records for one date
    Daily {
        /// Date to list (YYYY-MM-DD, defaults to today)
        date: Option<NaiveDate>,
    },
    /// Show enrolled students and database location
    Info,
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

async fn run_ingest(engine: &EngineHandle, roster: PathBuf, force: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("stopping after the current row...");
            ctrl_c_cancel.cancel();
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<Progress>();
    let printer = tokio::spawn(async move {
        while let Some(p) = progress_rx.recv().await {
            println!("[{}/{}] {}", p.done, p.total, p.current_id);
        }
    });

    let report = engine
        .ingest_roster(roster, force, Some(progress_tx), cancel)
        .await?;
    printer.await?;

    if report.outcome == BatchOutcome::Cancelled {
        println!("ingestion cancelled; applied rows were saved");
    }
    println!("enrolled: {}", report.succeeded);
    for id in &report.superseded {
        println!("superseded by a later row: {id}");
    }
    for failure in &report.failed {
        println!("failed: {} ({})", failure.id, failure.reason);
    }
    Ok(())
}

fn print_outcome(outcome: &MatchOutcome) {
    match outcome {
        MatchOutcome::Matched(candidates) => {
            for c in candidates {
                println!("{}  {:.3}", c.student_id, c.score);
            }
        }
        MatchOutcome::NoConfidentMatch { best } => match best {
            Some(c) => println!(
                "no confident match (best: {} at {:.3})",
                c.student_id, c.score
            ),
            None => println!("no confident match"),
        },
        MatchOutcome::EmptyGallery => println!("face database is empty; ingest a roster first"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let threshold_default = config.similarity_threshold;
    let engine = spawn_engine(config)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { roster, force } => {
            run_ingest(&engine, roster, force).await?;
        }
        Commands::Match { photo, threshold } => {
            let bytes = std::fs::read(&photo)?;
            let outcome = engine
                .match_photo(bytes, threshold.unwrap_or(threshold_default))
                .await?;
            print_outcome(&outcome);
        }
        Commands::Record {
            photo,
            threshold,
            date,
            class,
            section,
        } => {
            let bytes = std::fs::read(&photo)?;
            let outcome = engine
                .match_photo(bytes, threshold.unwrap_or(threshold_default))
                .await?;
            print_outcome(&outcome);
            match engine
                .record_match(outcome, date.unwrap_or_else(today), class, section)
                .await?
            {
                Some((student, mark)) => println!("{student}: {mark:?}"),
                None => println!("nothing recorded"),
            }
        }
        Commands::Mark {
            student,
            date,
            class,
            section,
            confidence,
        } => {
            let key = SessionKey {
                student_id: student.clone(),
                date: date.unwrap_or_else(today),
                class_id: class,
                section_id: section,
            };
            let mark = engine.mark_attendance(key, confidence).await?;
            println!("{student}: {mark:?}");
        }
        Commands::Sweep {
            roster: roster_path,
            date,
            class,
            section,
        } => {
            let roster = roster::load_roster(&roster_path)?;
            let ids: Vec<String> = roster.rows.iter().map(|r| r.id.clone()).collect();
            let created = engine
                .sweep_absent(ids, date.unwrap_or_else(today), class, section)
                .await?;
            println!("marked absent: {created}");
        }
        Commands::Stats { student } => {
            let stats = engine.stats(&student).await?;
            println!(
                "{student}: {}/{} sessions present ({:.1}%)",
                stats.present_count, stats.total_sessions, stats.percentage
            );
        }
        Commands::History { student } => {
            let records = engine.history(&student).await?;
            if records.is_empty() {
                println!("no records for {student}");
            }
            for r in records {
                println!(
                    "{}  {}/{}  {}  {:.3}",
                    r.date,
                    r.class_id,
                    r.section_id,
                    r.status.as_str(),
                    r.confidence
                );
            }
        }
        Commands::Daily { date } => {
            let date = date.unwrap_or_else(today);
            let records = engine.daily(date).await?;
            if records.is_empty() {
                println!("no records for {date}");
            }
            let present = records
                .iter()
                .filter(|r| r.status == AttendanceStatus::Present)
                .count();
            for r in &records {
                println!(
                    "{}  {}/{}  {}  {:.3}",
                    r.student_id,
                    r.class_id,
                    r.section_id,
                    r.status.as_str(),
                    r.confidence
                );
            }
            if !records.is_empty() {
                println!("present: {present}/{}", records.len());
            }
        }
        Commands::Info => {
            let info = engine.database_info().await?;
            println!("database: {}", info.db_path.display());
            println!("students: {}", info.students.len());
            for (id, name) in &info.students {
                println!("  {id}  {name}");
            }
        }
    }

    Ok(())
}
