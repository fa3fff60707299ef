use anyhow::Context;
use rollcall_core::{parse_confidence_floor, KeyScheme, ModelPaths, RecognitionConfig, VerifyScope};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusType {
    System,
    Session,
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Root directory of the per-group embedding stores.
    pub store_dir: PathBuf,
    /// Seconds a request may wait for and run on the engine thread.
    pub inference_timeout_secs: u64,
    /// Requests admitted to the engine queue before callers wait.
    pub queue_depth: usize,
    pub bus: BusType,
    pub recognition: RecognitionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: rollcall_core::default_model_dir(),
            store_dir: rollcall_core::default_store_dir(),
            inference_timeout_secs: 30,
            queue_depth: 4,
            bus: BusType::System,
            recognition: RecognitionConfig::default(),
        }
    }
}

impl Config {
    /// Read `ROLLCALL_CONFIG` (if set) and apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `ROLLCALL_*` overrides. Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = env("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env("ROLLCALL_STORE_DIR") {
            self.store_dir = PathBuf::from(dir);
        }

        let rec = &mut self.recognition;
        override_parsed(&env, "ROLLCALL_SIMILARITY_THRESHOLD", &mut rec.similarity_threshold);
        override_parsed(&env, "ROLLCALL_DETECTION_THRESHOLD", &mut rec.detection_threshold);
        override_parsed(&env, "ROLLCALL_ENROLL_CONFIDENCE_FLOOR", &mut rec.enroll_confidence_floor);
        if let Some(v) = env("ROLLCALL_PROBE_CONFIDENCE_FLOOR") {
            match parse_confidence_floor(&v) {
                Ok(floor) => rec.probe_confidence_floor = floor,
                Err(_) => ignored("ROLLCALL_PROBE_CONFIDENCE_FLOOR", &v),
            }
        }
        if let Some(v) = env("ROLLCALL_VERIFY_SCOPE") {
            match v.as_str() {
                "claimed_group" => rec.verify_scope = VerifyScope::ClaimedGroup,
                "all_groups" => rec.verify_scope = VerifyScope::AllGroups,
                _ => ignored("ROLLCALL_VERIFY_SCOPE", &v),
            }
        }
        if let Some(v) = env("ROLLCALL_KEY_SCHEME") {
            match v.as_str() {
                "name" => rec.key_scheme = KeyScheme::Name,
                "numeric_id" => rec.key_scheme = KeyScheme::NumericId,
                _ => ignored("ROLLCALL_KEY_SCHEME", &v),
            }
        }

        override_parsed(&env, "ROLLCALL_INFERENCE_TIMEOUT_SECS", &mut self.inference_timeout_secs);
        override_parsed(&env, "ROLLCALL_QUEUE_DEPTH", &mut self.queue_depth);
        if let Some(v) = env("ROLLCALL_BUS") {
            match v.as_str() {
                "system" => self.bus = BusType::System,
                "session" => self.bus = BusType::Session,
                _ => ignored("ROLLCALL_BUS", &v),
            }
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }
}

fn override_parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => ignored(key, &v),
        }
    }
}

fn ignored(key: &str, value: &str) {
    tracing::warn!(key, value, "ignoring unparseable environment override");
}
