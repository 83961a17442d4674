use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use rollcall_core::extractor::{ARCFACE_MODEL_FILE, SCRFD_MODEL_FILE};
use rollcall_core::{
    AttendanceFilter, AttendanceId, AttendanceRecord, AttendanceRecorder, AttendanceStatus,
    CipherKey, EmbeddingCipher, EnrollMode, EnrollRequest, EuclideanMatcher, Frame,
    IdentityStore, LivenessValidator, OnnxEmbedder, Pipeline, PipelineError, RecognitionOutcome,
    RecognizeRequest, User, UserId,
};
use rollcall_store::SqliteStore;

mod config;
mod engine;

use config::Config;
use engine::{spawn_engine, EngineError, EngineHandle};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/rollcall/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a user from 2-10 face images
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        /// Replace the embedding of an already enrolled user
        #[arg(long)]
        replace: bool,
        /// Image files, in capture order
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Recognize a face and record attendance
    Recognize {
        image: PathBuf,
        /// Capture time as RFC 3339 (default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// List users
    Users,
    /// List attendance records, newest first
    Attendance {
        /// Only records for this user
        #[arg(long)]
        email: Option<String>,
        /// List oldest records first
        #[arg(long)]
        oldest_first: bool,
    },
    /// Run the liveness check on two images
    Liveness { first: PathBuf, second: PathBuf },
    /// Show configuration, key, model and database status
    Status,
}

const EXIT_INVALID_REQUEST: u8 = 2;
const EXIT_DECODE_FAILURE: u8 = 3;
const EXIT_LIVENESS_FAILED: u8 = 4;
const EXIT_NO_FACE: u8 = 5;
const EXIT_ALREADY_ENROLLED: u8 = 6;
const EXIT_NOT_RECOGNIZED: u8 = 7;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(source = ?config.source, db = %config.db_path.display(), "configuration loaded");

    match cli.command {
        Commands::Enroll {
            name,
            email,
            replace,
            images,
        } => {
            let images = images
                .iter()
                .map(|path| read_image(path))
                .collect::<Result<Vec<_>>>()?;
            let engine = start_engine(&config)?;
            let enrollment = engine
                .enroll(EnrollRequest {
                    name,
                    email: email.clone(),
                    images,
                    mode: if replace {
                        EnrollMode::Reenroll
                    } else {
                        EnrollMode::FirstTime
                    },
                })
                .await?;

            if cli.json {
                print_json(&enrollment)?;
            } else {
                let verb = if enrollment.updated { "Updated" } else { "Enrolled" };
                println!("{verb} {email} ({})", enrollment.user_id);
                println!(
                    "  frames used: {}, dropped: {}",
                    enrollment.frames_used, enrollment.frames_dropped
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Recognize { image, at } => {
            let captured_at = match at {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("invalid --at timestamp {raw:?}"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let image = read_image(&image)?;
            let engine = start_engine(&config)?;
            let recognition = engine
                .recognize(RecognizeRequest { image, captured_at })
                .await?;

            if cli.json {
                print_json(&recognition)?;
            } else {
                for skipped in &recognition.skipped {
                    println!("  skipped {}: {:?}", skipped.user_id, skipped.reason);
                }
                match &recognition.outcome {
                    RecognitionOutcome::Recognized {
                        user_id,
                        distance,
                        attendance,
                    } => println!("Recognized {user_id} (distance {distance:.4}): {attendance:?}"),
                    RecognitionOutcome::NotRecognized { closest: Some(d) } => {
                        println!("Not recognized (closest distance {d:.4})")
                    }
                    RecognitionOutcome::NotRecognized { closest: None } => {
                        println!("Not recognized (no enrolled users)")
                    }
                }
            }
            Ok(match recognition.outcome {
                RecognitionOutcome::Recognized { .. } => ExitCode::SUCCESS,
                RecognitionOutcome::NotRecognized { .. } => ExitCode::from(EXIT_NOT_RECOGNIZED),
            })
        }
        Commands::Users => {
            let store = SqliteStore::open(&config.db_path)?;
            let users: Vec<UserView> = store.list_users()?.iter().map(UserView::from).collect();
            if cli.json {
                print_json(&users)?;
            } else if users.is_empty() {
                println!("No users");
            } else {
                for user in &users {
                    let enrolled = if user.enrolled { "enrolled" } else { "not enrolled" };
                    println!(
                        "{}  {:<24} {:<32} {:<8} {enrolled}",
                        user.id, user.name, user.email, user.role
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Attendance {
            email,
            oldest_first,
        } => {
            let store = SqliteStore::open(&config.db_path)?;
            let filter = match email.as_deref().map(str::trim) {
                Some(email) => match store.find_user_by_email(email)? {
                    Some(user) => AttendanceFilter::ByUser(user.id),
                    None => bail!("no user with email {email}"),
                },
                None => AttendanceFilter::All,
            };
            let log = attendance_log(
                store.list_attendance(filter)?,
                &store.list_users()?,
                oldest_first,
            );
            if cli.json {
                print_json(&log)?;
            } else if log.is_empty() {
                println!("No attendance records");
            } else {
                for entry in &log {
                    println!(
                        "{}  {:<24} {:<32} {}",
                        entry.timestamp.to_rfc3339(),
                        entry.name,
                        entry.email,
                        entry.status
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Liveness { first, second } => {
            let first = decode_file(&first)?;
            let second = decode_file(&second)?;
            let report = LivenessValidator::new(config.liveness_threshold).check(&first, &second);
            if cli.json {
                print_json(&report)?;
            } else {
                match report.mean_difference {
                    Some(d) => println!(
                        "mean luminance difference {d:.2} (threshold {:.2}): {}",
                        report.threshold,
                        if report.is_live { "live" } else { "static" }
                    ),
                    None => println!("frames differ in size; not comparable"),
                }
            }
            Ok(if report.is_live {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_LIVENESS_FAILED)
            })
        }
        Commands::Status => {
            let status = status(&config)?;
            if cli.json {
                print_json(&status)?;
            } else {
                println!("config:    {}", display_opt(config.source.as_deref()));
                println!(
                    "key:       {} ({})",
                    config.key_path.display(),
                    status.key_fingerprint.as_deref().unwrap_or("not created")
                );
                for (file, present) in &status.models {
                    println!(
                        "model:     {file} {}",
                        if *present { "present" } else { "MISSING" }
                    );
                }
                println!(
                    "database:  {} (schema v{})",
                    config.db_path.display(),
                    status.schema_version
                );
                println!(
                    "users:     {} ({} enrolled)",
                    status.users, status.enrolled
                );
                println!("records:   {}", status.attendance_records);
                println!(
                    "matching:  {} below {}",
                    config.match_policy, config.match_threshold
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Builds the pipeline from config and moves it onto the engine thread.
fn start_engine(config: &Config) -> Result<EngineHandle> {
    let key = CipherKey::load_or_generate(&config.key_path)?;
    let cipher = EmbeddingCipher::new(&key);
    tracing::info!(fingerprint = cipher.key_fingerprint(), "embedding key loaded");

    let store = SqliteStore::open(&config.db_path)?;
    let recorder = match config.attendance_cooldown_secs {
        0 => AttendanceRecorder::new(),
        secs => AttendanceRecorder::with_cooldown(TimeDelta::seconds(
            i64::try_from(secs).context("attendance_cooldown_secs out of range")?,
        )),
    };
    let pipeline = Pipeline::new(cipher, store)
        .with_matcher(EuclideanMatcher::new(
            config.match_threshold,
            config.match_policy,
        ))
        .with_liveness(LivenessValidator::new(config.liveness_threshold))
        .with_recorder(recorder);

    let embedder = OnnxEmbedder::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    Ok(spawn_engine(pipeline, embedder)?)
}

#[derive(Serialize)]
struct UserView {
    id: String,
    name: String,
    email: String,
    role: String,
    enrolled: bool,
    created_at: DateTime<Utc>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.to_string(),
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role.to_string(),
            enrolled: user.is_enrolled(),
            created_at: user.created_at,
        }
    }
}

/// One attendance row joined with its user.
#[derive(Debug, Serialize)]
struct AttendanceLogEntry {
    id: AttendanceId,
    user_id: UserId,
    name: String,
    email: String,
    timestamp: DateTime<Utc>,
    status: AttendanceStatus,
}

/// Joins records with user names. Newest first unless `oldest_first`.
fn attendance_log(
    mut records: Vec<AttendanceRecord>,
    users: &[User],
    oldest_first: bool,
) -> Vec<AttendanceLogEntry> {
    let by_id: HashMap<UserId, &User> = users.iter().map(|u| (u.id, u)).collect();
    records.sort_by_key(|r| r.timestamp);
    if !oldest_first {
        records.reverse();
    }
    records
        .into_iter()
        .map(|record| {
            let user = by_id.get(&record.user_id);
            AttendanceLogEntry {
                id: record.id,
                user_id: record.user_id,
                name: user.map(|u| u.name.clone()).unwrap_or_else(|| "?".to_string()),
                email: user.map(|u| u.email.clone()).unwrap_or_default(),
                timestamp: record.timestamp,
                status: record.status,
            }
        })
        .collect()
}

#[derive(Serialize)]
struct Status<'a> {
    config: &'a Config,
    key_fingerprint: Option<String>,
    models: Vec<(&'static str, bool)>,
    schema_version: u32,
    users: usize,
    enrolled: usize,
    attendance_records: usize,
}

fn status(config: &Config) -> Result<Status<'_>> {
    // Never create a key just to report on it.
    let key_fingerprint = if config.key_path.exists() {
        Some(CipherKey::load_or_generate(&config.key_path)?.fingerprint())
    } else {
        None
    };
    let models = [SCRFD_MODEL_FILE, ARCFACE_MODEL_FILE]
        .into_iter()
        .map(|file| (file, config.model_dir.join(file).is_file()))
        .collect();

    let store = SqliteStore::open(&config.db_path)?;
    let users = store.list_users()?;
    Ok(Status {
        config,
        key_fingerprint,
        models,
        schema_version: store.schema_version()?,
        users: users.len(),
        enrolled: users.iter().filter(|u| u.is_enrolled()).count(),
        attendance_records: store.list_attendance(AttendanceFilter::All)?.len(),
    })
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn decode_file(path: &Path) -> Result<Frame> {
    let bytes = read_image(path)?;
    Frame::decode(&bytes).with_context(|| format!("decoding {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn display_opt(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".to_string())
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let pipeline = err.downcast_ref::<PipelineError>().or_else(|| {
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::Pipeline(e)) => Some(e),
            _ => None,
        }
    });
    match pipeline {
        Some(PipelineError::InvalidRequest(_)) => EXIT_INVALID_REQUEST,
        Some(PipelineError::DecodeFailure { .. }) => EXIT_DECODE_FAILURE,
        Some(PipelineError::LivenessCheckFailed { .. }) => EXIT_LIVENESS_FAILED,
        Some(PipelineError::NoFaceDetected) => EXIT_NO_FACE,
        Some(PipelineError::AlreadyEnrolled { .. }) => EXIT_ALREADY_ENROLLED,
        _ => 1,
    }
}
