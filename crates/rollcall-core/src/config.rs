//! Runtime configuration: defaults, then an optional TOML file, then
//! `ROLLCALL_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "face_detection_yunet_2023mar.onnx";
pub const EMBEDDER_MODEL_FILE: &str = "facenet.onnx";

/// Upper bound for every configured wait, in seconds.
pub const MAX_WAIT_SECONDS: f32 = 86_400.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Camera index, `/dev/videoN` path, or stream URL.
    pub source_descriptor: String,
    /// Run recognition on every Nth frame.
    pub sample_stride: u32,
    /// Resize factor applied before recognition, in (0, 1].
    pub downscale_factor: f32,
    /// Euclidean distance below which a face matches.
    pub match_threshold: f32,
    pub records_directory: PathBuf,
    /// Wait between reconnect attempts. Unset picks a per-source default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_backoff_seconds: Option<f32>,
    pub gallery_path: PathBuf,
    pub model_dir: PathBuf,
    pub detection_confidence: f32,
    pub heartbeat_seconds: u64,
    pub ledger_retry_attempts: u32,
    pub ledger_retry_backoff_ms: u64,
    /// Where to write the latest annotated frame; no display when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval_seconds: f32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            source_descriptor: "0".to_string(),
            sample_stride: 5,
            downscale_factor: 0.5,
            match_threshold: 0.8,
            records_directory: data_dir.join("attendance"),
            reconnect_backoff_seconds: None,
            gallery_path: data_dir.join("gallery.db"),
            model_dir: data_dir.join("models"),
            detection_confidence: 0.85,
            heartbeat_seconds: 30,
            ledger_retry_attempts: 3,
            ledger_retry_backoff_ms: 200,
            snapshot_path: None,
            snapshot_interval_seconds: 1.0,
        }
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

impl Config {
    /// Load all layers. `path` wins over `ROLLCALL_CONFIG`; with neither, only
    /// defaults and environment variables apply.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("ROLLCALL_CONFIG").map(PathBuf::from));

        let mut config = match file {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `ROLLCALL_<OPTION>` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ROLLCALL_SOURCE_DESCRIPTOR") {
            self.source_descriptor = v;
        }
        env_parse(&lookup, "ROLLCALL_SAMPLE_STRIDE", "sample_stride", &mut self.sample_stride)?;
        env_parse(&lookup, "ROLLCALL_DOWNSCALE_FACTOR", "downscale_factor", &mut self.downscale_factor)?;
        env_parse(&lookup, "ROLLCALL_MATCH_THRESHOLD", "match_threshold", &mut self.match_threshold)?;
        if let Some(v) = lookup("ROLLCALL_RECORDS_DIRECTORY") {
            self.records_directory = PathBuf::from(v);
        }
        if lookup("ROLLCALL_RECONNECT_BACKOFF_SECONDS").is_some() {
            let mut backoff = 0.0f32;
            env_parse(
                &lookup,
                "ROLLCALL_RECONNECT_BACKOFF_SECONDS",
                "reconnect_backoff_seconds",
                &mut backoff,
            )?;
            self.reconnect_backoff_seconds = Some(backoff);
        }
        if let Some(v) = lookup("ROLLCALL_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        env_parse(
            &lookup,
            "ROLLCALL_DETECTION_CONFIDENCE",
            "detection_confidence",
            &mut self.detection_confidence,
        )?;
        env_parse(&lookup, "ROLLCALL_HEARTBEAT_SECONDS", "heartbeat_seconds", &mut self.heartbeat_seconds)?;
        env_parse(
            &lookup,
            "ROLLCALL_LEDGER_RETRY_ATTEMPTS",
            "ledger_retry_attempts",
            &mut self.ledger_retry_attempts,
        )?;
        env_parse(
            &lookup,
            "ROLLCALL_LEDGER_RETRY_BACKOFF_MS",
            "ledger_retry_backoff_ms",
            &mut self.ledger_retry_backoff_ms,
        )?;
        if let Some(v) = lookup("ROLLCALL_SNAPSHOT_PATH") {
            self.snapshot_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        env_parse(
            &lookup,
            "ROLLCALL_SNAPSHOT_INTERVAL_SECONDS",
            "snapshot_interval_seconds",
            &mut self.snapshot_interval_seconds,
        )?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_descriptor.trim().is_empty() {
            return Err(invalid("source_descriptor", "must not be empty"));
        }
        if self.sample_stride < 1 {
            return Err(invalid("sample_stride", "must be at least 1"));
        }
        if !(self.downscale_factor > 0.0 && self.downscale_factor <= 1.0) {
            return Err(invalid(
                "downscale_factor",
                format!("{} is outside (0, 1]", self.downscale_factor),
            ));
        }
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(invalid(
                "match_threshold",
                format!("{} must be a positive number", self.match_threshold),
            ));
        }
        if let Some(backoff) = self.reconnect_backoff_seconds {
            check_wait("reconnect_backoff_seconds", backoff)?;
        }
        if !(0.0..=1.0).contains(&self.detection_confidence) {
            return Err(invalid(
                "detection_confidence",
                format!("{} is outside [0, 1]", self.detection_confidence),
            ));
        }
        if self.heartbeat_seconds == 0 || self.heartbeat_seconds as f32 > MAX_WAIT_SECONDS {
            return Err(invalid(
                "heartbeat_seconds",
                format!("{} is outside [1, {MAX_WAIT_SECONDS}]", self.heartbeat_seconds),
            ));
        }
        if self.ledger_retry_attempts == 0 {
            return Err(invalid("ledger_retry_attempts", "must be at least 1"));
        }
        check_wait("snapshot_interval_seconds", self.snapshot_interval_seconds)?;
        Ok(())
    }

    /// Configured reconnect backoff, if any. Out-of-range values saturate;
    /// [`Config::validate`] rejects them first.
    pub fn reconnect_backoff(&self) -> Option<Duration> {
        self.reconnect_backoff_seconds.map(wait_duration)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }

    pub fn ledger_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.ledger_retry_backoff_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        wait_duration(self.snapshot_interval_seconds)
    }

    /// Path to the YuNet detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the FaceNet embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join(EMBEDDER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn check_wait(key: &'static str, seconds: f32) -> Result<(), ConfigError> {
    if (0.0..=MAX_WAIT_SECONDS).contains(&seconds) {
        Ok(())
    } else {
        Err(invalid(key, format!("{seconds} is outside [0, {MAX_WAIT_SECONDS}]")))
    }
}

fn wait_duration(seconds: f32) -> Duration {
    if seconds.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f32(seconds.clamp(0.0, MAX_WAIT_SECONDS))
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn env_parse<F, T>(lookup: &F, var: &str, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(var) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse()
        .map_err(|_| invalid(key, format!("{var}={raw:?} is not a valid value")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.sample_stride, 5);
        assert!((config.downscale_factor - 0.5).abs() < 1e-6);
        assert!((config.match_threshold - 0.8).abs() < 1e-6);
        assert_eq!(config.reconnect_backoff(), None);
        assert!(config.records_directory.ends_with("rollcall/attendance"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            source_descriptor = "rtsp://cam.local/stream"
            sample_stride = 1
            downscale_factor = 1.0
            reconnect_backoff_seconds = 7.5
            "#,
        )
        .unwrap();
        assert_eq!(config.source_descriptor, "rtsp://cam.local/stream");
        assert_eq!(config.sample_stride, 1);
        assert_eq!(config.reconnect_backoff(), Some(Duration::from_secs_f32(7.5)));
        assert!((config.match_threshold - 0.8).abs() < 1e-6);
        assert_eq!(config.heartbeat_seconds, 30);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::from_toml("frame_skip = 3").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("sample_stride = 2").unwrap();
        config
            .apply_overrides(lookup_from(&[
                ("ROLLCALL_SAMPLE_STRIDE", "10"),
                ("ROLLCALL_MATCH_THRESHOLD", "0.6"),
                ("ROLLCALL_RECORDS_DIRECTORY", "/srv/attendance"),
                ("ROLLCALL_RECONNECT_BACKOFF_SECONDS", "0"),
                ("ROLLCALL_SNAPSHOT_PATH", "/run/rollcall/latest.png"),
            ]))
            .unwrap();
        assert_eq!(config.sample_stride, 10);
        assert!((config.match_threshold - 0.6).abs() < 1e-6);
        assert_eq!(config.records_directory, PathBuf::from("/srv/attendance"));
        assert_eq!(config.reconnect_backoff(), Some(Duration::ZERO));
        assert_eq!(config.snapshot_path, Some(PathBuf::from("/run/rollcall/latest.png")));
    }

    #[test]
    fn test_env_parse_error_names_key() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup_from(&[("ROLLCALL_SAMPLE_STRIDE", "five")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "sample_stride", .. }));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("sample_stride", Box::new(|c: &mut Config| c.sample_stride = 0)),
            ("downscale_factor", Box::new(|c: &mut Config| c.downscale_factor = 0.0)),
            ("downscale_factor", Box::new(|c: &mut Config| c.downscale_factor = 1.5)),
            ("downscale_factor", Box::new(|c: &mut Config| c.downscale_factor = f32::NAN)),
            ("match_threshold", Box::new(|c: &mut Config| c.match_threshold = 0.0)),
            ("match_threshold", Box::new(|c: &mut Config| c.match_threshold = -1.0)),
            ("reconnect_backoff_seconds", Box::new(|c: &mut Config| c.reconnect_backoff_seconds = Some(-1.0))),
            ("source_descriptor", Box::new(|c: &mut Config| c.source_descriptor = "  ".into())),
            ("ledger_retry_attempts", Box::new(|c: &mut Config| c.ledger_retry_attempts = 0)),
            ("heartbeat_seconds", Box::new(|c: &mut Config| c.heartbeat_seconds = u64::MAX)),
            ("snapshot_interval_seconds", Box::new(|c: &mut Config| c.snapshot_interval_seconds = f32::NAN)),
        ];
        for (expected_key, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            match config.validate() {
                Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, expected_key),
                other => panic!("expected invalid {expected_key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_huge_waits_rejected_not_panicking() {
        let config = Config::from_toml("reconnect_backoff_seconds = 1e30").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "reconnect_backoff_seconds", .. })
        ));
        assert_eq!(config.reconnect_backoff(), Some(Duration::from_secs(86_400)));

        let config = Config::from_toml("snapshot_interval_seconds = 1e30").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "snapshot_interval_seconds", .. })
        ));
        assert_eq!(config.snapshot_interval(), Duration::from_secs(86_400));

        let config = Config::from_toml("reconnect_backoff_seconds = 86400.0").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/rollcall.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "match_threshold = 0.55\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!((config.match_threshold - 0.55).abs() < 1e-6);
    }

    #[test]
    fn test_model_paths() {
        let config = Config {
            model_dir: PathBuf::from("/opt/models"),
            ..Config::default()
        };
        assert_eq!(
            config.detector_model_path(),
            "/opt/models/face_detection_yunet_2023mar.onnx"
        );
        assert_eq!(config.embedder_model_path(), "/opt/models/facenet.onnx");
    }
}
