use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use faceguard::camera::Camera;
use faceguard::common::{Config, DevMode, FaceAuthError};
use faceguard::core::{FaceModel, ModelHost, OnnxFaceModel};
use faceguard::liveness::{FailureKind, LivenessVerdict};
use faceguard::pipeline::CaptureFeed;
use faceguard::service::protocol::FrameDescriptor;
use faceguard::service::{select_backend, AuthBackend, IpcClient, LocalBackend};
use faceguard::{FaceDescriptor, Frame};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

/// Frames sent to the backend per request during `check`.
const CHECK_BATCH: usize = 5;

#[derive(Parser)]
#[command(name = "faceguard")]
#[command(about = "Face liveness and encoding client")]
struct Cli {
    /// Enable development mode (local config, socket and data directory)
    #[arg(long, global = true)]
    dev: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether the daemon is running
    Status,
    /// Print daemon counters
    Stats,
    /// Ask the daemon to shut down
    Stop,
    /// Run a liveness attempt from the camera
    Check {
        /// Maximum number of frames to capture
        #[arg(short, long, default_value = "90")]
        frames: usize,
        /// Also match the live descriptors against this user's enrolled templates
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Drop the daemon's cached templates for a user after re-enrollment
    Invalidate {
        #[arg(short, long)]
        user: String,
    },
    /// Detect and encode the faces in an image file
    Encode {
        #[arg(short, long)]
        image: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.dev);

    let dev_mode = DevMode::new(cli.dev)?;
    let config = dev_mode.load_config()?;

    match cli.command {
        Commands::Status => match connect(&config) {
            Ok(mut client) => {
                let status = client.status()?;
                println!("Daemon: running");
                println!("  Socket: {}", client.socket_path().display());
                println!("  Uptime: {}s", status.uptime_secs);
                println!("  Model loaded: {}", status.model_loaded);
            }
            Err(e) if e.is_daemon_failure() => {
                println!("Daemon: not running ({})", e);
            }
            Err(e) => return Err(e.into()),
        },
        Commands::Stats => {
            let mut client = connect(&config)?;
            for (name, value) in client.get_stats()? {
                println!("{:<22} {}", name, value);
            }
        }
        Commands::Stop => {
            let mut client = connect(&config)?;
            client.shutdown()?;
            println!("Daemon stopping");
        }
        Commands::Check { frames, user } => check(&config, frames, user.as_deref())?,
        Commands::Invalidate { user } => {
            let mut client = connect(&config)?;
            client.invalidate_templates(&user)?;
            println!("Templates for {} will be reloaded", user);
        }
        Commands::Encode { image } => encode(&config, &image)?,
    }

    Ok(())
}

fn connect(config: &Config) -> faceguard::Result<IpcClient> {
    IpcClient::from_config(config, &config.daemon.socket_path)
}

fn backend(config: &Config) -> anyhow::Result<Box<dyn AuthBackend>> {
    let local_config = config.clone();
    let backend = select_backend(
        config,
        &config.daemon.socket_path,
        Box::new(move || {
            let host = Arc::new(ModelHost::new());
            host.load(|| {
                let model: Arc<dyn FaceModel> = Arc::new(OnnxFaceModel::load(&local_config)?);
                Ok(model)
            })?;
            Ok(LocalBackend::new(&local_config, host))
        }),
    )?;
    tracing::debug!("Using {} backend", backend.name());
    Ok(Box::new(backend))
}

fn encode(config: &Config, path: &PathBuf) -> anyhow::Result<()> {
    let image = image::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let frame = Frame::from_image(&image, 0, SystemTime::now());
    let mut backend = backend(config)?;

    let faces = backend.detect_faces(&frame)?;
    if faces.is_empty() {
        println!("No face detected");
        return Ok(());
    }

    println!("{} face(s) via {}", faces.len(), backend.name());
    for (i, landmarks) in faces.iter().enumerate() {
        let descriptor = backend.get_encoding(&frame, landmarks)?;
        let (x1, y1, x2, y2) = landmarks.bbox();
        let preview: Vec<String> = descriptor.as_slice().iter().take(4).map(|v| format!("{:.4}", v)).collect();
        println!(
            "  face {}: box ({:.0}, {:.0})-({:.0}, {:.0}), confidence {:.2}, {}-d descriptor [{}, ...]",
            i, x1, y1, x2, y2, landmarks.confidence, descriptor.len(), preview.join(", ")
        );
    }
    Ok(())
}

fn check(config: &Config, max_frames: usize, user: Option<&str>) -> anyhow::Result<()> {
    let mut backend = backend(config)?;
    let templates = match user {
        Some(user) => Some(backend.get_templates(user)?),
        None => None,
    };
    let attempt = match backend.begin_attempt(user) {
        Ok(attempt) => attempt,
        Err(FaceAuthError::LockedOut { remaining_secs, .. }) => {
            bail!("Too many failed attempts, try again in {}s", remaining_secs)
        }
        Err(e) => return Err(e.into()),
    };

    let camera_config = config.clone();
    let mut feed = CaptureFeed::start(CHECK_BATCH * 2, max_frames, move |feed| {
        let camera = Camera::new(&camera_config)?;
        let mut session = camera.start_session()?;
        feed.pump(&mut session)
    })?;
    println!("Look at the camera...");

    let mut captured = 0usize;
    let mut verdict = LivenessVerdict::Indeterminate { frames_needed: 0 };
    let mut prompted = None;
    let mut descriptors: Vec<FrameDescriptor> = Vec::new();

    while !verdict.is_terminal() {
        let batch = match feed.next_batch(CHECK_BATCH) {
            Ok(batch) => batch,
            Err(e) => {
                let _ = backend.cancel_attempt(attempt);
                return Err(e.into());
            }
        };
        if batch.is_empty() {
            break;
        }
        captured += batch.len();

        let update = match backend.submit_frames(attempt, batch) {
            Ok(update) => update,
            Err(FaceAuthError::AttemptCancelled) => bail!("Attempt cancelled"),
            Err(e) => return Err(e.into()),
        };
        verdict = update.verdict;
        descriptors.extend(update.descriptors);

        if let LivenessVerdict::Challenge { kind, round } = verdict {
            if prompted != Some(round) {
                println!("{}", kind.prompt());
                prompted = Some(round);
            }
        }
        if let Some(failure) = update.failure {
            println!("{}", failure.message());
        }
    }
    feed.stop()?;

    match verdict {
        LivenessVerdict::Accept { .. } => println!("Liveness: passed"),
        LivenessVerdict::Reject { .. } => println!("Liveness: failed"),
        LivenessVerdict::Cancelled => println!("Liveness: cancelled"),
        ref other => {
            println!("Liveness: {} after {} frames", other.label(), captured);
            backend.cancel_attempt(attempt)?;
        }
    }

    if let (Some(user), Some(templates), LivenessVerdict::Accept { .. }) = (user, &templates, &verdict) {
        let live: Vec<&FaceDescriptor> = descriptors.iter().map(|d| &d.descriptor).collect();
        match best_distance(&live, templates) {
            Some(distance) if distance * 10.0 <= config.video.certainty => {
                println!("Recognized {} (certainty {:.2})", user, distance * 10.0);
            }
            best => {
                tracing::debug!(user, best = ?best, "No template within certainty");
                println!("{}", FailureKind::NotRecognized.message());
                backend.record_mismatch(user)?;
            }
        }
    }
    Ok(())
}

/// Smallest distance between any live descriptor and any template.
fn best_distance(live: &[&FaceDescriptor], templates: &[FaceDescriptor]) -> Option<f32> {
    live.iter()
        .flat_map(|descriptor| templates.iter().map(move |template| descriptor.distance(template)))
        .min_by(|a, b| a.total_cmp(b))
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_distance_picks_the_closest_pair() {
        let a = FaceDescriptor(vec![0.0, 0.0]);
        let b = FaceDescriptor(vec![1.0, 1.0]);
        let templates = vec![FaceDescriptor(vec![0.9, 1.0]), FaceDescriptor(vec![5.0, 5.0])];
        let distance = best_distance(&[&a, &b], &templates).unwrap();
        assert!((distance - 0.1).abs() < 1e-5);
        assert!(best_distance(&[], &templates).is_none());
    }
}
