use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACETRACK_CONFIG_PATH").unwrap_or("/usr/local/etc/facetrack/config.toml"))
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP service binds to.
    pub listen: String,
    /// Directory holding the detector and per-model encoder ONNX files.
    pub models_dir: PathBuf,
    /// Directory served under /ui.
    pub static_dir: PathBuf,
    /// Model assumed when a request omits the `model` field.
    pub default_model: String,
    /// Metric assumed when a request omits the `metric` field.
    pub default_metric: String,
    /// Reject unknown metric names instead of falling back to cosine.
    pub strict_metric: bool,
    /// Minimum detector confidence for a face to count.
    pub score_threshold: f32,
    /// IoU above which overlapping detections are suppressed.
    pub nms_threshold: f32,
    /// Per-model decision-threshold overrides, keyed by metric name:
    ///
    /// ```toml
    /// [thresholds.Facenet512]
    /// euclidean_l2 = 1.1
    /// ```
    pub thresholds: HashMap<String, HashMap<String, f32>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            models_dir: PathBuf::from("/usr/local/share/facetrack/models"),
            static_dir: PathBuf::from("static/ui"),
            default_model: "Facenet512".to_string(),
            default_metric: "euclidean_l2".to_string(),
            strict_metric: false,
            score_threshold: 0.6,
            nms_threshold: 0.3,
            thresholds: HashMap::new(),
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
