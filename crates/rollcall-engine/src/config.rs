use crate::session::SessionSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Runtime configuration.
///
/// Loaded from an optional TOML file named by `ROLLCALL_CONFIG`, then
/// overridden by `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for the registry, face samples, model and attendance artifacts.
    pub data_dir: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Length of one capture session, in seconds.
    pub session_window_secs: u64,
    /// Recognizer distance below which a face counts as a match.
    pub match_threshold: f64,
    /// Face samples captured per identity at enrollment.
    pub max_samples: usize,
    /// Upper bound on one enrollment capture, in seconds.
    pub enroll_timeout_secs: u64,
    /// Persist an artifact even when a session recognized nobody.
    pub write_empty_batches: bool,
    /// Delay between replayed frames, in milliseconds.
    pub replay_interval_ms: u64,
    /// Wait after a pull that produced no frame, in milliseconds.
    pub idle_poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            camera_device: "/dev/video0".to_string(),
            session_window_secs: 20,
            match_threshold: 70.0,
            max_samples: 50,
            enroll_timeout_secs: 60,
            write_empty_batches: true,
            replay_interval_ms: 0,
            idle_poll_ms: 15,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok()).validated()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `ROLLCALL_*` overrides looked up through `lookup`.
    /// Unparseable values are ignored, keeping the current setting.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(device) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        override_parsed(&lookup, "ROLLCALL_SESSION_WINDOW_SECS", &mut self.session_window_secs);
        override_parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "ROLLCALL_MAX_SAMPLES", &mut self.max_samples);
        override_parsed(&lookup, "ROLLCALL_ENROLL_TIMEOUT_SECS", &mut self.enroll_timeout_secs);
        override_parsed(&lookup, "ROLLCALL_REPLAY_INTERVAL_MS", &mut self.replay_interval_ms);
        override_parsed(&lookup, "ROLLCALL_IDLE_POLL_MS", &mut self.idle_poll_ms);
        if let Some(v) = lookup("ROLLCALL_WRITE_EMPTY_BATCHES") {
            self.write_empty_batches = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        self
    }

    pub fn validated(self) -> Result<Self, ConfigError> {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("must be a positive number, got {}", self.match_threshold),
            });
        }
        if self.session_window_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "session_window_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_samples == 0 {
            return Err(ConfigError::Invalid {
                key: "max_samples",
                reason: "must be at least 1".into(),
            });
        }
        Ok(self)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.data_dir.join("samples")
    }

    pub fn attendance_dir(&self) -> PathBuf {
        self.data_dir.join("attendance")
    }

    /// Path of the trained model artifact.
    pub fn model_path(&self) -> PathBuf {
        self.data_dir.join("model").join("lbph.json")
    }

    pub fn enroll_timeout(&self) -> Duration {
        Duration::from_secs(self.enroll_timeout_secs)
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            window: Duration::from_secs(self.session_window_secs),
            match_threshold: self.match_threshold,
            write_empty_batches: self.write_empty_batches,
            idle_poll: self.idle_poll(),
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(value) = lookup(key).and_then(|v| v.parse().ok()) {
        *target = value;
    }
}
