use anyhow::{bail, Context as _};
use clap::Parser;
use faceguard::common::{Config, DevMode};
use faceguard::core::{BlobFaceModel, FaceModel, ModelHost, OnnxFaceModel};
use faceguard::service::{AttemptRegistry, AttemptSettings, IpcServer, ServerOptions, StatsRegistry};
use faceguard::storage::{AttemptLog, TemplateCache};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "faceguard-daemon")]
#[command(about = "Resident face model daemon")]
struct Args {
    /// Run in development mode (local config, socket and data directory)
    #[arg(long)]
    dev: bool,

    /// Config file to use instead of the mode's default
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve the synthetic test model instead of ONNX models (dev only)
    #[arg(long)]
    synthetic: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.dev);

    tracing::info!("Starting faceguard daemon (dev_mode: {})", args.dev);

    let dev_mode = DevMode::new(args.dev)?;
    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => dev_mode.load_config()?,
    };

    if args.synthetic && !dev_mode.is_enabled() {
        bail!("--synthetic is only available with --dev");
    }

    // Model load failures are fatal before the socket exists.
    let host = Arc::new(ModelHost::new());
    let synthetic = args.synthetic;
    host.load(|| {
        let model: Arc<dyn FaceModel> = if synthetic {
            tracing::warn!("Serving the synthetic face model");
            Arc::new(BlobFaceModel::new())
        } else {
            Arc::new(OnnxFaceModel::load(&config)?)
        };
        Ok(model)
    })
    .context("Failed to load face models")?;
    if let Some(load_time) = host.load_time() {
        tracing::info!(load_ms = load_time.as_millis() as u64, "Models resident");
    }

    let stats = Arc::new(StatsRegistry::new());
    let attempt_log = if config.video.save_failed {
        Some(AttemptLog::start(&config.attempt_log.dir, config.attempt_log.queue_depth, Arc::clone(&stats))?)
    } else {
        None
    };
    let attempts = Arc::new(AttemptRegistry::new(
        AttemptSettings::from_config(&config),
        Arc::clone(&host),
        Arc::clone(&stats),
        attempt_log,
    ));

    let templates = Arc::new(TemplateCache::new(config.templates.dir.clone(), Arc::clone(&stats)));
    tracing::info!("Templates read from {}", templates.dir().display());

    let options = ServerOptions::from_config(&config, config.daemon.socket_path.clone(), dev_mode.is_enabled());
    let server = IpcServer::bind(options, host, stats, attempts, templates)?;

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || shutdown.trigger()).context("Failed to install signal handler")?;

    server.serve()?;
    Ok(())
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    }
}
