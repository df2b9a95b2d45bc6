use crate::retry::{Backoff, RetryPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Install location of the MagicMirror module this daemon feeds.
pub const DEFAULT_MODULE_DIR: &str = "/home/pi/MagicMirror/modules/MMM-Face-Recognition-SMAI";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            _ => Err(()),
        }
    }
}

/// Optional overrides, as read from the TOML file and `MIRRORFACE_*` variables.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Overrides {
    module_dir: Option<PathBuf>,
    reference_image: Option<PathBuf>,
    identity_dir: Option<PathBuf>,
    status_file: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    onboard_device: Option<String>,
    network_timeout_secs: Option<u64>,
    capture_retry_secs: Option<u64>,
    capture_max_attempts: Option<u32>,
    capture_backoff: Option<BackoffKind>,
    capture_backoff_max_secs: Option<u64>,
    cooldown_secs: Option<u64>,
    label_refresh: Option<bool>,
}

/// Daemon configuration: defaults, then the TOML file, then environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root of the MagicMirror module; other paths default beneath it.
    pub module_dir: PathBuf,
    /// Image of the face to recognize.
    pub reference_image: PathBuf,
    /// Directory scanned for `*-id.png` identity files.
    pub identity_dir: PathBuf,
    /// File the current label is written to.
    pub status_file: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// V4L2 node of the onboard camera.
    pub onboard_device: String,
    pub network_timeout_secs: u64,
    pub capture_retry_secs: u64,
    /// Consecutive failed captures before giving up; 0 retries forever.
    pub capture_max_attempts: u32,
    pub capture_backoff: BackoffKind,
    pub capture_backoff_max_secs: u64,
    /// How long a recognized label stays up before the display label returns.
    pub cooldown_secs: u64,
    /// Re-scan the identity directory every cycle that sees a face.
    pub label_refresh: bool,
}

impl Config {
    /// Load configuration from an optional TOML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => read_file(path)?,
            None => Overrides::default(),
        };
        let env = env_overrides(|key| std::env::var(key).ok())?;
        Ok(Self::resolve(file.merge(env)))
    }

    fn resolve(o: Overrides) -> Self {
        let module_dir = o.module_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_MODULE_DIR));
        let public = module_dir.join("public");
        Self {
            reference_image: o.reference_image.unwrap_or_else(|| public.join("face.png")),
            identity_dir: o.identity_dir.unwrap_or(public),
            status_file: o.status_file.unwrap_or_else(|| module_dir.join("sample.txt")),
            model_dir: o.model_dir.unwrap_or_else(mirrorface_core::default_model_dir),
            onboard_device: o
                .onboard_device
                .unwrap_or_else(|| mirrorface_hw::source::DEFAULT_ONBOARD_DEVICE.to_string()),
            network_timeout_secs: o.network_timeout_secs.unwrap_or(5),
            capture_retry_secs: o.capture_retry_secs.unwrap_or(1),
            capture_max_attempts: o.capture_max_attempts.unwrap_or(0),
            capture_backoff: o.capture_backoff.unwrap_or_default(),
            capture_backoff_max_secs: o.capture_backoff_max_secs.unwrap_or(30),
            cooldown_secs: o.cooldown_secs.unwrap_or(15),
            label_refresh: o.label_refresh.unwrap_or(true),
            module_dir,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let initial = Duration::from_secs(self.capture_retry_secs);
        let backoff = match self.capture_backoff {
            BackoffKind::Fixed => Backoff::Fixed(initial),
            BackoffKind::Exponential => Backoff::Exponential {
                initial,
                max: Duration::from_secs(self.capture_backoff_max_secs).max(initial),
            },
        };
        RetryPolicy::new(Some(self.capture_max_attempts), backoff)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }
}

impl Overrides {
    /// Field-wise merge; values in `other` win.
    fn merge(self, other: Overrides) -> Overrides {
        Overrides {
            module_dir: other.module_dir.or(self.module_dir),
            reference_image: other.reference_image.or(self.reference_image),
            identity_dir: other.identity_dir.or(self.identity_dir),
            status_file: other.status_file.or(self.status_file),
            model_dir: other.model_dir.or(self.model_dir),
            onboard_device: other.onboard_device.or(self.onboard_device),
            network_timeout_secs: other.network_timeout_secs.or(self.network_timeout_secs),
            capture_retry_secs: other.capture_retry_secs.or(self.capture_retry_secs),
            capture_max_attempts: other.capture_max_attempts.or(self.capture_max_attempts),
            capture_backoff: other.capture_backoff.or(self.capture_backoff),
            capture_backoff_max_secs: other
                .capture_backoff_max_secs
                .or(self.capture_backoff_max_secs),
            cooldown_secs: other.cooldown_secs.or(self.cooldown_secs),
            label_refresh: other.label_refresh.or(self.label_refresh),
        }
    }
}

fn read_file(path: &Path) -> Result<Overrides, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read `MIRRORFACE_*` overrides through `lookup`. Empty values are ignored.
fn env_overrides(lookup: impl Fn(&str) -> Option<String>) -> Result<Overrides, ConfigError> {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let path = |key: &str| var(key).map(PathBuf::from);

    Ok(Overrides {
        module_dir: path("MIRRORFACE_MODULE_DIR"),
        reference_image: path("MIRRORFACE_REFERENCE_IMAGE"),
        identity_dir: path("MIRRORFACE_IDENTITY_DIR"),
        status_file: path("MIRRORFACE_STATUS_FILE"),
        model_dir: path("MIRRORFACE_MODEL_DIR"),
        onboard_device: var("MIRRORFACE_ONBOARD_DEVICE"),
        network_timeout_secs: env_parse(&var, "MIRRORFACE_NETWORK_TIMEOUT_SECS")?,
        capture_retry_secs: env_parse(&var, "MIRRORFACE_CAPTURE_RETRY_SECS")?,
        capture_max_attempts: env_parse(&var, "MIRRORFACE_CAPTURE_MAX_ATTEMPTS")?,
        capture_backoff: env_parse(&var, "MIRRORFACE_CAPTURE_BACKOFF")?,
        capture_backoff_max_secs: env_parse(&var, "MIRRORFACE_CAPTURE_BACKOFF_MAX_SECS")?,
        cooldown_secs: env_parse(&var, "MIRRORFACE_COOLDOWN_SECS")?,
        label_refresh: var("MIRRORFACE_LABEL_REFRESH").map(|v| v.trim() != "0"),
    })
}

fn env_parse<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    var(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key, value })
        })
        .transpose()
}
