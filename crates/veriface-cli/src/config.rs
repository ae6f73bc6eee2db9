use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use veriface_core::enroll::DEFAULT_MAX_UPLOAD_BYTES;
use veriface_core::live::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_TIME_BUDGET, DEFAULT_WARMUP_FRAMES,
};
use veriface_core::{LiveMatchSettings, Metric};

/// CLI configuration: TOML file, then `VERIFACE_*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Similarity at or above which a live frame verifies.
    pub similarity_threshold: f32,
    pub metric: Metric,
    /// Frames read per verification run (N).
    pub max_attempts: u32,
    /// Wall-clock budget per run; 0 disables it.
    pub time_budget_secs: f64,
    /// Frames discarded while the sensor's exposure settles.
    pub warmup_frames: usize,
    /// Reference photo size cap.
    pub max_upload_bytes: u64,
    /// Shown on the failure banner.
    pub support_contact: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: veriface_core::default_model_dir(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            metric: Metric::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            time_budget_secs: DEFAULT_TIME_BUDGET.as_secs_f64(),
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            support_contact: "your administrator".to_string(),
        }
    }
}

/// `$XDG_CONFIG_HOME/veriface/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("veriface")
        .join("config.toml")
}

impl Config {
    /// Load from `path` (or the default path), apply env overrides, validate.
    ///
    /// A missing file at the default path is not an error; an explicit
    /// `--config` that does not exist is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let p = default_config_path();
                if p.exists() {
                    Self::from_file(&p)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `VERIFACE_*` overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VERIFACE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("VERIFACE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("VERIFACE_SUPPORT_CONTACT") {
            self.support_contact = v;
        }
        if let Some(v) = lookup("VERIFACE_METRIC") {
            self.metric = match v.as_str() {
                "cosine" => Metric::Cosine,
                "euclidean_l2" => Metric::EuclideanL2,
                other => bail!("VERIFACE_METRIC: unknown metric {other:?} (cosine, euclidean_l2)"),
            };
        }
        parse_override(&lookup, "VERIFACE_SIMILARITY_THRESHOLD", &mut self.similarity_threshold)?;
        parse_override(&lookup, "VERIFACE_MAX_ATTEMPTS", &mut self.max_attempts)?;
        parse_override(&lookup, "VERIFACE_TIME_BUDGET_SECS", &mut self.time_budget_secs)?;
        parse_override(&lookup, "VERIFACE_WARMUP_FRAMES", &mut self.warmup_frames)?;
        parse_override(&lookup, "VERIFACE_MAX_UPLOAD_BYTES", &mut self.max_upload_bytes)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold must be within [-1, 1], got {}",
                self.similarity_threshold
            );
        }
        if !self.time_budget_secs.is_finite() || self.time_budget_secs < 0.0 {
            bail!("time_budget_secs must be a non-negative number");
        }
        if self.max_upload_bytes == 0 {
            bail!("max_upload_bytes must be positive");
        }
        Ok(())
    }

    pub fn live_settings(&self) -> LiveMatchSettings {
        LiveMatchSettings {
            max_attempts: self.max_attempts,
            time_budget: (self.time_budget_secs > 0.0)
                .then(|| Duration::from_secs_f64(self.time_budget_secs)),
            threshold: self.similarity_threshold,
            warmup_frames: self.warmup_frames,
        }
    }
}

fn parse_override<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}"))?;
    }
    Ok(())
}
