mod config;
mod store;

use anyhow::{bail, Context, Result};
use attend_core::{
    CascadeDetector, FaceEngine, FeatureExtractor, GalleryStore, Identity, JsonGalleryFile, MatchResult, RunLock,
    RunOutcome, RunReport, Trigger,
};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use config::Config;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::{AttendanceScope, MarkOutcome, ProfileDetails, ProfileStore};

const DEFAULT_IMAGE_EXTENSION: &str = "jpg";
const RECENT_ATTENDANCE: usize = 10;

#[derive(Parser)]
#[command(name = "attend", about = "Face recognition attendance CLI")]
struct Cli {
    /// Print JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a face photo
    Enroll {
        /// Name of the person (normalized to lower_snake_case)
        name: String,
        /// Photo containing the person's face
        image: PathBuf,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        role: Option<String>,
    },
    /// Identify the face in a photo and mark attendance
    Identify {
        image: PathBuf,
    },
    /// Remove an enrolled person, their photo and attendance history
    Remove {
        name: String,
    },
    /// Rebuild the gallery from every enrollment photo
    Retrain,
    /// List enrolled people
    Users,
    /// Show one person's profile and recent attendance
    User {
        name: String,
    },
    /// Show attendance records
    Attendance {
        /// Only today's records
        #[arg(long)]
        today: bool,
    },
    /// Remove attendance records for a person (today unless told otherwise)
    Unmark {
        name: String,
        /// Day to clear (YYYY-MM-DD)
        #[arg(long, conflicts_with = "all")]
        date: Option<NaiveDate>,
        /// Clear every record for this person
        #[arg(long)]
        all: bool,
    },
    /// Show gallery and re-embedding status
    Status,
}

struct App {
    config: Config,
    store: Arc<ProfileStore>,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    let store = ProfileStore::open(config.db_path(), config.uploads_dir())
        .with_context(|| format!("failed to open record store at {}", config.db_path().display()))?;
    let app = App {
        config,
        store: Arc::new(store),
        json: cli.json,
    };

    match cli.command {
        Commands::Enroll {
            name,
            image,
            email,
            department,
            role,
        } => {
            let details = ProfileDetails {
                email,
                department,
                role,
            };
            app.enroll(&name, &image, details).await
        }
        Commands::Identify { image } => app.identify(&image),
        Commands::Remove { name } => app.remove(&name).await,
        Commands::Retrain => app.retrain().await,
        Commands::Users => app.users(),
        Commands::User { name } => app.user(&name),
        Commands::Attendance { today } => app.attendance(today),
        Commands::Unmark { name, date, all } => app.unmark(&name, date, all),
        Commands::Status => app.status(),
    }
}

impl App {
    fn engine(&self) -> Result<FaceEngine> {
        let cascade_path = &self.config.cascade_path;
        let detector = CascadeDetector::load(cascade_path, self.config.cascade_params())
            .with_context(|| format!("failed to load face cascade {}", cascade_path.display()))?;
        let extractor = FeatureExtractor::new(detector, self.config.descriptor_params());
        let gallery = GalleryStore::open(JsonGalleryFile::new(self.config.gallery_path()));
        let source = Arc::clone(&self.store);

        Ok(FaceEngine::new(extractor, gallery, source, self.config.match_policy())
            .with_run_lock(RunLock::new(self.config.run_lock_path())))
    }

    fn emit(&self, value: serde_json::Value, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }

    async fn enroll(&self, name: &str, image: &Path, details: ProfileDetails) -> Result<()> {
        let identity = Identity::parse(name)?;
        if self.store.contains(&identity)? {
            bail!("user {identity} already exists");
        }

        let bytes = std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
        let engine = self.engine()?;
        engine
            .extract_features(&bytes)
            .with_context(|| format!("no usable face in {}", image.display()))?;

        self.store
            .add_user(&identity, &details, &bytes, &image_extension(image), Local::now())?;
        let rebuild = await_run(engine.enroll_trigger(&identity)?).await;

        self.emit(
            json!({
                "identity": identity,
                "display_name": identity.display_name(),
                "total_users": self.store.identities()?.len(),
                "gallery_size": engine.gallery_size(),
                "reembedding": rebuild.to_json(),
            }),
            || {
                format!(
                    "Registered {} ({identity}). {}",
                    identity.display_name(),
                    rebuild.describe()
                )
            },
        )
    }

    fn identify(&self, image: &Path) -> Result<()> {
        let bytes = std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
        let engine = self.engine()?;
        let result = engine
            .identify_image(&bytes)
            .with_context(|| format!("failed to decode {}", image.display()))?;

        let Some(identity) = result.identity.clone().filter(|_| result.is_match()) else {
            return self.emit(json!({ "status": "unknown", "result": result }), || describe_rejection(&result));
        };

        let name = identity.display_name();
        match self.store.mark_attendance(&identity, result.confidence, Local::now())? {
            MarkOutcome::Marked(record) => self.emit(
                json!({ "status": "success", "result": result, "record": record }),
                || format!("Welcome {name}! Attendance marked ({:.1}% confidence).", result.confidence * 100.0),
            ),
            MarkOutcome::AlreadyMarked => self.emit(
                json!({ "status": "already_marked", "result": result }),
                || format!("Attendance already marked for {name} today."),
            ),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let identity = Identity::parse(name)?;
        let Some(removed) = self.store.remove_user(&identity)? else {
            bail!("user {identity} not found");
        };

        let engine = self.engine()?;
        let rebuild = match engine.remove_identity(&identity)? {
            Some(trigger) => await_run(trigger).await,
            None => Rebuild::NotNeeded,
        };

        self.emit(
            json!({
                "identity": identity,
                "removed_attendance_records": removed.attendance_removed,
                "remaining_users": self.store.identities()?.len(),
                "reembedding": rebuild.to_json(),
            }),
            || {
                format!(
                    "Deleted {} and {} attendance record(s). {}",
                    identity.display_name(),
                    removed.attendance_removed,
                    rebuild.describe()
                )
            },
        )
    }

    async fn retrain(&self) -> Result<()> {
        if self.store.identities()?.is_empty() {
            bail!("no users enrolled; nothing to train");
        }
        let engine = self.engine()?;
        let rebuild = await_run(engine.retrain()?).await;
        self.emit(json!({ "reembedding": rebuild.to_json() }), || {
            rebuild.describe()
        })
    }

    fn users(&self) -> Result<()> {
        let users = self.store.users()?;
        self.emit(json!({ "users": users, "total": users.len() }), || {
            if users.is_empty() {
                return "No users enrolled.".to_string();
            }
            users
                .iter()
                .map(|u| {
                    format!(
                        "{:<24} {:<20} days present: {:<4} last seen: {}",
                        u.user.identity.display_name(),
                        u.user.identity,
                        u.days_present,
                        u.last_seen.as_deref().unwrap_or("never"),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    fn user(&self, name: &str) -> Result<()> {
        let identity = Identity::parse(name)?;
        let Some(user) = self.store.user(&identity)? else {
            bail!("user {identity} not found");
        };
        let recent = self.store.user_attendance(&identity, RECENT_ATTENDANCE)?;
        let days_present = self.store.attendance_days(&identity)?;

        self.emit(
            json!({
                "user": user,
                "display_name": identity.display_name(),
                "days_present": days_present,
                "recent_attendance": recent,
            }),
            || {
                let mut lines = vec![
                    format!("{} ({identity})", identity.display_name()),
                    format!("registered: {}", user.registered_at),
                ];
                for (label, value) in [("email", &user.email), ("department", &user.department), ("role", &user.role)] {
                    if let Some(v) = value {
                        lines.push(format!("{label}: {v}"));
                    }
                }
                lines.push(format!("days present: {days_present}"));
                lines.push(format!(
                    "last seen: {}",
                    recent.first().map_or("never", |r| r.timestamp.as_str())
                ));
                lines.extend(
                    recent
                        .iter()
                        .map(|r| format!("  {}  {:>5.1}%  {}", r.date, r.confidence * 100.0, r.timestamp)),
                );
                lines.join("\n")
            },
        )
    }

    fn attendance(&self, today: bool) -> Result<()> {
        let day = today.then(|| Local::now().date_naive());
        let records = self.store.attendance(day)?;
        self.emit(json!({ "attendance": records, "date": day, "total": records.len() }), || {
            if records.is_empty() {
                return "No attendance records.".to_string();
            }
            records
                .iter()
                .map(|r| {
                    format!(
                        "{}  {:<24} {:>5.1}%  {}",
                        r.date,
                        r.identity.display_name(),
                        r.confidence * 100.0,
                        r.timestamp
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    fn unmark(&self, name: &str, date: Option<NaiveDate>, all: bool) -> Result<()> {
        let identity = Identity::parse(name)?;
        let scope = if all {
            AttendanceScope::All
        } else {
            AttendanceScope::Day(date.unwrap_or_else(|| Local::now().date_naive()))
        };
        let removed = self.store.remove_attendance(&identity, scope)?;

        let when = match scope {
            AttendanceScope::All => "in total".to_string(),
            AttendanceScope::Day(day) => format!("on {day}"),
        };
        self.emit(json!({ "identity": identity, "removed_count": removed }), || {
            if removed == 0 {
                format!("No attendance record found for {} {when}.", identity.display_name())
            } else {
                format!("Removed {removed} attendance record(s) for {} {when}.", identity.display_name())
            }
        })
    }

    fn status(&self) -> Result<()> {
        let engine = self.engine()?;
        let enrolled = self.store.identities()?.len();
        let gallery_size = engine.gallery_size();
        let state = engine.training_state();

        self.emit(
            json!({
                "enrolled_users": enrolled,
                "gallery_size": gallery_size,
                "training_state": state,
                "model_trained": gallery_size > 0,
                "cascade": self.config.cascade_path,
            }),
            || {
                format!(
                    "enrolled users: {enrolled}\ngallery entries: {gallery_size}\nre-embedding: {state}\ncascade: {}",
                    self.config.cascade_path.display()
                )
            },
        )
    }
}

/// What became of the rebuild a command asked for.
#[derive(Debug)]
enum Rebuild {
    Finished(RunReport),
    /// Another run, possibly in another process, absorbed the request.
    AlreadyRunning,
    /// The worker died without reporting.
    Lost,
    NotNeeded,
}

impl Rebuild {
    fn to_json(&self) -> serde_json::Value {
        match self {
            Rebuild::Finished(r) => json!({
                "status": "finished",
                "embedded": r.embedded,
                "skipped": r.skipped,
                "installed": r.outcome == RunOutcome::Installed,
            }),
            Rebuild::AlreadyRunning => json!({ "status": "already_running" }),
            Rebuild::Lost => json!({ "status": "lost" }),
            Rebuild::NotNeeded => serde_json::Value::Null,
        }
    }

    fn describe(&self) -> String {
        match self {
            Rebuild::Finished(r) if r.outcome == RunOutcome::Installed => {
                format!("Gallery rebuilt: {} embedded, {} skipped.", r.embedded, r.skipped)
            }
            Rebuild::Finished(r) => {
                format!("No enrollment photo yielded a face ({} skipped); gallery unchanged.", r.skipped)
            }
            Rebuild::AlreadyRunning => {
                "A rebuild is already running; run `attend retrain` after it finishes to include this change."
                    .to_string()
            }
            Rebuild::Lost => "Rebuild ended without reporting; gallery may be stale.".to_string(),
            Rebuild::NotNeeded => "Gallery not rebuilt.".to_string(),
        }
    }
}

async fn await_run(trigger: Trigger) -> Rebuild {
    match trigger {
        Trigger::Started(handle) => handle.finished().await.map_or(Rebuild::Lost, Rebuild::Finished),
        Trigger::AlreadyRunning => Rebuild::AlreadyRunning,
    }
}

fn describe_rejection(result: &MatchResult) -> String {
    match result.rejected {
        Some(reason) => format!(
            "Face not recognized: {reason} (confidence {:.1}%).",
            result.confidence * 100.0
        ),
        None => format!("Face not recognized (confidence {:.1}%).", result.confidence * 100.0),
    }
}

/// Extension to store the enrollment photo under; falls back to `jpg`.
fn image_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| DEFAULT_IMAGE_EXTENSION.to_string())
}
