use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::{EnrollmentId, WholeFrameDetector};
use rollcall_engine::{CancelToken, CaptureSession, Config, SessionError, Services};
use rollcall_hw::{Camera, CameraSource, FrameSource, ReplaySource};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance capture")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face samples for a new identity and register it
    Enroll {
        /// Enrollment id (unique integer)
        #[arg(long)]
        id: EnrollmentId,
        /// Display name
        #[arg(long)]
        name: String,
        /// Read pre-cropped face images from a directory instead of the camera
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Retrain the recognition model from every enrolled sample
    Train,
    /// Run one attendance capture session for a subject
    Capture {
        #[arg(short, long)]
        subject: String,
        /// Read pre-cropped face images from a directory instead of the camera
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Print the attendance recorded for a subject on one date
    Show {
        #[arg(short, long)]
        subject: String,
        /// YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// Per-identity presence across every session of a subject
    Report {
        #[arg(short, long)]
        subject: String,
        /// Also write the report next to the session files
        #[arg(long)]
        write: bool,
    },
    /// List registered identities
    List,
    /// Show enrollment and model status as JSON
    Status,
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Enroll { id, name, replay } => {
            let outcome = run_cancellable(config, replay, move |services, source, cancel| {
                services.enroller().enroll(id, &name, source, WholeFrameDetector, &cancel)
            })
            .await?
            .context("enrollment failed")?;
            println!(
                "Enrolled {} (id {}) with {} samples",
                outcome.identity.display_name, outcome.identity.enrollment_id, outcome.samples
            );
            println!("Run `rollcall train` to update the recognition model.");
        }
        Commands::Train => {
            let mut services = Services::open(config)?;
            let stats = services.train().context("training failed")?;
            println!("Model trained: {} identities, {} samples", stats.identities, stats.samples);
        }
        Commands::Capture { subject, replay } => {
            let result = run_cancellable(config, replay, move |services, source, cancel| {
                let context = services.session_context();
                let mut session =
                    CaptureSession::begin(context, &subject, source, WholeFrameDetector)?;
                println!(
                    "Capturing attendance for {}; press Ctrl-C to stop early",
                    session.subject()
                );
                session.run(&cancel)
            })
            .await?;

            let batch = match result {
                Ok(batch) => batch,
                Err(SessionError::FrameSource { source, batch }) => {
                    eprintln!("Camera failed mid-session: {source}");
                    eprintln!("{} records were saved before the failure.", batch.records.len());
                    std::process::exit(1);
                }
                Err(e) => return Err(e).context("capture failed"),
            };

            for record in &batch.records {
                println!("  {}  {:>6}  {}", record.time, record.enrollment_id, record.display_name);
            }
            println!("{} present ({:?})", batch.records.len(), batch.end);
            match &batch.location {
                Some(path) => println!("Saved {}", path.display()),
                None => println!("Nothing recognized; no file written"),
            }
        }
        Commands::Show { subject, date } => {
            let services = Services::open(config)?;
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let records = services.attendance().read_batch(&subject, date)?;
            if records.is_empty() {
                println!("No attendance for {subject} on {date}");
            }
            for record in records {
                println!("{}  {:>6}  {}", record.time, record.enrollment_id, record.display_name);
            }
        }
        Commands::Report { subject, write } => {
            let services = Services::open(config)?;
            let report = services.attendance().merge_subject(&subject)?;
            println!("{}: {} sessions", report.subject, report.sessions);
            for row in &report.rows {
                println!(
                    "  {:>6}  {:<24} {:>3}/{}  {}%",
                    row.enrollment_id,
                    row.display_name,
                    row.sessions_present,
                    report.sessions,
                    row.percent()
                );
            }
            if write {
                let path = services.attendance().write_report(&subject)?;
                println!("Wrote {}", path.display());
            }
        }
        Commands::List => {
            let services = Services::open(config)?;
            let identities = services.registry().all()?;
            if identities.is_empty() {
                println!("No identities registered");
            }
            for identity in identities {
                let samples = services.samples().sample_count(identity.enrollment_id)?;
                println!(
                    "{:>6}  {:<24} {samples} samples",
                    identity.enrollment_id, identity.display_name
                );
            }
        }
        Commands::Status => {
            let services = Services::open(config)?;
            println!("{}", serde_json::to_string_pretty(&services.status()?)?);
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for device in devices {
                println!("{}  {} ({})", device.path, device.name, device.driver);
            }
        }
    }

    Ok(())
}

/// Run a blocking capture loop on a worker thread; Ctrl-C cancels it.
///
/// The services and the frame source are built on the worker, so camera
/// handles never cross threads.
async fn run_cancellable<T, F>(config: Config, replay: Option<PathBuf>, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Services, Box<dyn FrameSource>, CancelToken) -> T + Send + 'static,
{
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let mut worker = tokio::task::spawn_blocking(move || -> Result<T> {
        let source: Box<dyn FrameSource> = match replay {
            Some(dir) => Box::new(ReplaySource::new(dir).with_interval(config.replay_interval())),
            None => Box::new(CameraSource::new(config.camera_device.clone())),
        };
        let mut services = Services::open(config)?;
        Ok(work(&mut services, source, worker_cancel))
    });

    tokio::select! {
        joined = &mut worker => return joined.context("capture worker panicked")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; stopping capture");
            cancel.cancel();
        }
    }
    worker.await.context("capture worker panicked")?
}
