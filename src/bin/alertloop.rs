//! Alertloop CLI - Command-line interface for the Alertloop control loop
//!
//! Commands:
//! - calibrate: Build a reference profile from a recorded landmark frame
//! - replay: Drive the full control loop over a recorded landmark stream
//! - config: Print the effective configuration
//! - doctor: Diagnose configuration and state file health

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use alertloop::ports::{Presenter, StateStore};
use alertloop::types::{BreakNotice, BreakOutcome, IndexSnapshot, IndexWarning, Seconds, StateKey};
use alertloop::{
    enroll_subject, JsonStateStore, LandmarkCalibrator, LandmarkFrame, LoopConfig, LoopError,
    MonitorSession, RawLandmarkFrame, ReferenceProfile, TriggerEvent, ALERTLOOP_VERSION,
};

/// Alertloop - Fatigue indices and adaptive break enforcement
#[derive(Parser)]
#[command(name = "alertloop")]
#[command(version = ALERTLOOP_VERSION)]
#[command(about = "Landmark-driven fatigue monitoring with adaptive breaks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a reference profile from one recorded landmark frame
    Calibrate {
        /// Landmark frame JSON (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Profile output path (use - for stdout)
        #[arg(short, long)]
        output: PathBuf,

        /// Subject id to enroll under (recognised by descriptor if omitted)
        #[arg(long)]
        subject: Option<String>,

        /// State file to enroll the subject in
        #[arg(long)]
        store: Option<PathBuf>,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Replay a recorded landmark stream through the control loop
    Replay {
        /// Landmark frames as NDJSON (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Reference profile produced by `calibrate` (defaults to the
        /// subject's enrollment in the state file)
        #[arg(short, long)]
        profile: Option<PathBuf>,

        /// Task the subject is working on
        #[arg(long)]
        task: String,

        /// Subject identifier
        #[arg(long)]
        subject: String,

        /// State file for learned weights and scaler (in-memory if omitted)
        #[arg(long)]
        store: Option<PathBuf>,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Also emit one event per analyzed frame
        #[arg(long)]
        snapshots: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Diagnose configuration and state file health
    Doctor {
        /// State file to check
        #[arg(long)]
        store: Option<PathBuf>,

        /// Configuration file to check
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("alertloop=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Commands::Calibrate {
            input,
            output,
            subject,
            store,
            config,
        } => cmd_calibrate(
            &input,
            &output,
            subject.as_deref(),
            store.as_deref(),
            config.as_deref(),
        ),

        Commands::Replay {
            input,
            profile,
            task,
            subject,
            store,
            config,
            snapshots,
        } => cmd_replay(
            &input,
            profile.as_deref(),
            StateKey::new(task, subject),
            store.as_deref(),
            config.as_deref(),
            snapshots,
        ),

        Commands::Config { config } => {
            print!("{}", load_config(config.as_deref())?.to_toml_string()?);
            Ok(())
        }

        Commands::Doctor {
            store,
            config,
            json,
        } => cmd_doctor(store.as_deref(), config.as_deref(), json),
    }
}

fn load_config(path: Option<&Path>) -> Result<LoopConfig, AppError> {
    match path {
        Some(path) => Ok(LoopConfig::load(path)?),
        None => Ok(LoopConfig::default()),
    }
}

fn read_input(input: &Path) -> Result<String, AppError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

/// Pretty JSON for a terminal, compact JSON for pipes
fn to_json<T: Serialize>(value: &T) -> Result<String, AppError> {
    if atty::is(atty::Stream::Stdout) {
        Ok(serde_json::to_string_pretty(value)?)
    } else {
        Ok(serde_json::to_string(value)?)
    }
}

fn parse_frames(ndjson: &str) -> Result<Vec<RawLandmarkFrame>, AppError> {
    let mut frames = Vec::new();
    for (line_num, line) in ndjson.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let frame: RawLandmarkFrame = serde_json::from_str(trimmed).map_err(|e| {
            AppError::ParseError(format!("Failed to parse line {}: {}", line_num + 1, e))
        })?;
        frames.push(frame);
    }
    Ok(frames)
}

fn cmd_calibrate(
    input: &Path,
    output: &Path,
    subject: Option<&str>,
    store: Option<&Path>,
    config: Option<&Path>,
) -> Result<(), AppError> {
    let config = load_config(config)?;
    let raw: RawLandmarkFrame = serde_json::from_str(&read_input(input)?)?;
    let calibrator = LandmarkCalibrator::new(config.calibration.clone());
    let profile = calibrator.capture_reference(&LandmarkFrame::from(&raw));
    profile.ensure_valid()?;

    tracing::info!(fingerprint = %profile.fingerprint(), "reference profile captured");
    if let Some(path) = store {
        let mut store = JsonStateStore::open(path, &config.learning)?;
        enroll_subject(&mut store, subject, profile.clone(), &config.calibration)?;
    }
    if output.to_string_lossy() == "-" {
        println!("{}", to_json(&profile)?);
    } else {
        fs::write(output, serde_json::to_string_pretty(&profile)?)?;
    }
    Ok(())
}

/// One NDJSON line of replay output
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ReplayEvent<'a> {
    Snapshot {
        snapshot: &'a IndexSnapshot,
        weighted_tiredness: f64,
    },
    Warning(&'a IndexWarning),
    BreakBegin {
        trigger: &'a TriggerEvent,
        duration: Seconds,
    },
    BreakProgress(&'a BreakNotice),
    BreakCompleted(&'a BreakOutcome),
    Summary(&'a alertloop::types::SessionSummary),
}

/// Buffers replay events as JSON lines between frames
struct NdjsonPresenter {
    snapshots: bool,
    lines: Vec<String>,
    error: Option<serde_json::Error>,
}

impl NdjsonPresenter {
    fn push(&mut self, event: ReplayEvent<'_>) {
        match serde_json::to_string(&event) {
            Ok(line) => self.lines.push(line),
            Err(e) => self.error = Some(e),
        }
    }

    fn flush(&mut self, out: &mut impl Write) -> Result<(), AppError> {
        if let Some(e) = self.error.take() {
            return Err(e.into());
        }
        for line in self.lines.drain(..) {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }
}

impl Presenter for NdjsonPresenter {
    fn snapshot(&mut self, snapshot: &IndexSnapshot, weighted_tiredness: f64) {
        if self.snapshots {
            self.push(ReplayEvent::Snapshot {
                snapshot,
                weighted_tiredness,
            });
        }
    }

    fn warning(&mut self, warning: &IndexWarning) {
        self.push(ReplayEvent::Warning(warning));
    }

    fn break_begin(&mut self, event: &TriggerEvent, duration: Seconds) -> bool {
        self.push(ReplayEvent::BreakBegin {
            trigger: event,
            duration,
        });
        true
    }

    fn break_progress(&mut self, notice: &BreakNotice) {
        self.push(ReplayEvent::BreakProgress(notice));
    }

    fn break_completed(&mut self, outcome: &BreakOutcome) {
        self.push(ReplayEvent::BreakCompleted(outcome));
    }
}

fn cmd_replay(
    input: &Path,
    profile: Option<&Path>,
    key: StateKey,
    store: Option<&Path>,
    config: Option<&Path>,
    snapshots: bool,
) -> Result<(), AppError> {
    let config = load_config(config)?;
    let frames = parse_frames(&read_input(input)?)?;
    if frames.is_empty() {
        return Err(AppError::NoFrames);
    }

    let store = match store {
        Some(path) => JsonStateStore::open(path, &config.learning)?,
        None => JsonStateStore::in_memory(&config.learning),
    };
    let profile: ReferenceProfile = match profile {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => store
            .load_subject(&key.subject)?
            .map(|record| record.profile)
            .ok_or_else(|| AppError::UnknownSubject(key.subject.clone()))?,
    };
    let mut session = MonitorSession::start(config, key, profile, store)?;
    let mut presenter = NdjsonPresenter {
        snapshots,
        lines: Vec::new(),
        error: None,
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut last_timestamp = 0.0;
    for raw in &frames {
        let frame = LandmarkFrame::from(raw);
        last_timestamp = frame.timestamp;
        session.step(&frame, &mut presenter, None)?;
        presenter.flush(&mut out)?;
    }

    let summary = session.end(last_timestamp)?;
    presenter.push(ReplayEvent::Summary(&summary));
    presenter.flush(&mut out)?;
    out.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct DoctorReport {
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

fn check(name: &str, status: CheckStatus, message: impl Into<String>) -> DoctorCheck {
    DoctorCheck {
        name: name.to_string(),
        status,
        message: message.into(),
    }
}

fn cmd_doctor(store: Option<&Path>, config: Option<&Path>, json: bool) -> Result<(), AppError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(check(
        "version",
        CheckStatus::Ok,
        format!("Alertloop version {ALERTLOOP_VERSION}"),
    ));

    let loaded = match config {
        Some(path) => match LoopConfig::load(path) {
            Ok(loaded) => {
                checks.push(check("config", CheckStatus::Ok, "Configuration valid"));
                loaded
            }
            Err(e) => {
                checks.push(check("config", CheckStatus::Error, e.to_string()));
                LoopConfig::default()
            }
        },
        None => {
            checks.push(check("config", CheckStatus::Ok, "Using built-in defaults"));
            LoopConfig::default()
        }
    };

    if let Some(path) = store {
        if path.exists() {
            match JsonStateStore::open(path, &loaded.learning) {
                Ok(state) => {
                    let issues = state.check();
                    let document = state.document();
                    if issues.is_empty() {
                        checks.push(check(
                            "store",
                            CheckStatus::Ok,
                            format!(
                                "State file valid ({} subjects, {} profiles, {} sessions, {} breaks)",
                                document.subjects.len(),
                                document.profiles.len(),
                                document.sessions.len(),
                                document.break_events.len()
                            ),
                        ));
                    } else {
                        checks.push(check("store", CheckStatus::Error, issues.join("; ")));
                    }
                }
                Err(e) => checks.push(check("store", CheckStatus::Error, e.to_string())),
            }
        } else {
            checks.push(check(
                "store",
                CheckStatus::Warning,
                "State file does not exist yet",
            ));
        }
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        check("stdin", CheckStatus::Ok, "stdin is a TTY (interactive mode)")
    } else {
        check("stdin", CheckStatus::Ok, "stdin is a pipe (replay from stdin ready)")
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        version: ALERTLOOP_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Alertloop Doctor Report");
        println!("=======================");
        println!("Version: {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(AppError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum AppError {
    Io(io::Error),
    Loop(LoopError),
    Json(serde_json::Error),
    NoFrames,
    UnknownSubject(String),
    DoctorFailed,
    ParseError(String),
}

impl From<io::Error> for AppError {
    fn from(e: io::Error) -> Self {
        AppError::Io(e)
    }
}

impl From<LoopError> for AppError {
    fn from(e: LoopError) -> Self {
        AppError::Loop(e)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<AppError> for CliError {
    fn from(e: AppError) -> Self {
        match e {
            AppError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            AppError::Loop(e) => {
                let (code, hint) = match &e {
                    LoopError::CalibrationInvalid(_) => (
                        "CALIBRATION_INVALID",
                        Some("Re-run 'alertloop calibrate' with a frontal, well-lit frame"),
                    ),
                    LoopError::ResourceUnavailable(_) => ("RESOURCE_UNAVAILABLE", None),
                    LoopError::Config(_) => (
                        "CONFIG_ERROR",
                        Some("Run 'alertloop config' to see the expected keys"),
                    ),
                    LoopError::Persistence(_) => (
                        "STORE_ERROR",
                        Some("Run 'alertloop doctor --store <path>' for details"),
                    ),
                    _ => ("LOOP_ERROR", None),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
            AppError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            AppError::NoFrames => CliError {
                code: "NO_FRAMES".to_string(),
                message: "No landmark frames found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            AppError::UnknownSubject(subject) => CliError {
                code: "UNKNOWN_SUBJECT".to_string(),
                message: format!("No enrolled reference profile for subject '{subject}'"),
                hint: Some(
                    "Pass --profile, or run 'alertloop calibrate --store <path> --subject <id>'"
                        .to_string(),
                ),
            },
            AppError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: None,
            },
            AppError::ParseError(message) => CliError {
                code: "PARSE_ERROR".to_string(),
                message,
                hint: Some("Each line must be one landmark frame object".to_string()),
            },
        }
    }
}
