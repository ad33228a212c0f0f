use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facetrack::{
    config, server, FaceDetector, MetricKind, MetricPolicy, ModelKind, OnnxFaceDetector,
    ThresholdTable, Verifier,
};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "facetrack")]
#[command(version, about = "Face detection and tracking over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Listen address (defaults to the config value)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Detect faces in an image file and print the response payload
    Detect {
        /// Image file to run detection on
        #[arg(short, long)]
        image: PathBuf,
        /// Embedding model (defaults to the config value)
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Verify faces in an image file against a reference embedding
    Track {
        /// Image file to run detection on
        #[arg(short, long)]
        image: PathBuf,
        /// Reference embedding as comma-separated floats
        #[arg(short, long)]
        embedding: String,
        /// Embedding model (defaults to the config value)
        #[arg(short, long)]
        model: Option<String>,
        /// Distance metric (defaults to the config value)
        #[arg(long)]
        metric: Option<String>,
    },
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(None)?;

    match cli.command {
        Commands::Serve { listen } => serve(&cfg, listen),
        Commands::Detect { image, model } => detect(&cfg, &image, model),
        Commands::Track {
            image,
            embedding,
            model,
            metric,
        } => track(&cfg, &image, &embedding, model, metric),
        Commands::Config => open_config(),
    }
}

fn build_verifier(cfg: &config::Config) -> Verifier {
    let mut table = ThresholdTable::new();
    for (model, metrics) in &cfg.thresholds {
        for (name, value) in metrics {
            match MetricKind::from_name(name) {
                Some(metric) => table.set(ModelKind::new(model.clone()), metric, *value),
                None => warn!("ignoring threshold override for unknown metric {name:?}"),
            }
        }
    }
    let policy = if cfg.strict_metric {
        MetricPolicy::Strict
    } else {
        MetricPolicy::FallbackToCosine
    };
    Verifier::new(table, policy)
}

fn build_detector(cfg: &config::Config) -> OnnxFaceDetector {
    OnnxFaceDetector::new(
        cfg.models_dir.clone(),
        cfg.score_threshold,
        cfg.nms_threshold,
    )
}

fn serve(cfg: &config::Config, listen: Option<String>) -> Result<()> {
    let listen = listen.unwrap_or_else(|| cfg.listen.clone());
    let state = server::AppState {
        detector: Arc::new(Mutex::new(build_detector(cfg))),
        verifier: Arc::new(build_verifier(cfg)),
        default_model: ModelKind::new(cfg.default_model.clone()),
        default_metric: cfg.default_metric.clone(),
    };
    let app = server::router(state, &cfg.static_dir);

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(server::serve(&listen, app))
}

fn detect(cfg: &config::Config, path: &PathBuf, model: Option<String>) -> Result<()> {
    let img = image::open(path).with_context(|| format!("reading {}", path.display()))?;
    let model = ModelKind::new(model.unwrap_or_else(|| cfg.default_model.clone()));

    let mut detector = build_detector(cfg);
    let faces = detector.represent(&img, &model)?;
    info!("{} face(s) detected with model {model}", faces.len());

    println!("{}", serde_json::to_string_pretty(&server::detect_payload(&faces))?);
    Ok(())
}

fn track(
    cfg: &config::Config,
    path: &PathBuf,
    embedding: &str,
    model: Option<String>,
    metric: Option<String>,
) -> Result<()> {
    let img = image::open(path).with_context(|| format!("reading {}", path.display()))?;
    let model = ModelKind::new(model.unwrap_or_else(|| cfg.default_model.clone()));

    let verifier = build_verifier(cfg);
    let reference = facetrack::verify::parse_embedding(embedding)?;
    let metric = verifier.resolve_metric(metric.as_deref().unwrap_or(&cfg.default_metric))?;
    let threshold = verifier.threshold_for(&model, metric)?;

    let mut detector = build_detector(cfg);
    let faces = detector.represent(&img, &model)?;

    let mut results = Vec::with_capacity(faces.len());
    for face in &faces {
        results.push(verifier.decide(&reference, &face.embedding, &model, metric)?);
    }
    info!(
        "{}/{} face(s) verified with model {model}, metric {metric}",
        results.iter().filter(|r| r.verified).count(),
        faces.len()
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&server::track_payload(
            &faces, &results, threshold, &model, metric
        ))?
    );
    Ok(())
}

fn open_config() -> Result<()> {
    let config_path = *config::CONFIG_PATH;
    if !config_path.exists() {
        config::save_config(&config::Config::default(), None)?;
        info!("wrote default config to {}", config_path.display());
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    info!("Opening config file: {}", config_path.display());

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
