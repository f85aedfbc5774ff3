use chrono::NaiveTime;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which embedding backend produces probe and reference vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// ONNX ArcFace (w600k_r50), 512-d.
    Arcface,
    /// Model-free 16×16 grayscale thumbnail, 256-d.
    Thumbnail,
}

impl ExtractorKind {
    /// Distance below which a probe is accepted, calibrated per backend.
    pub fn default_threshold(self) -> f32 {
        match self {
            ExtractorKind::Arcface => 1.10,
            ExtractorKind::Thumbnail => 0.60,
        }
    }
}

impl FromStr for ExtractorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arcface" => Ok(ExtractorKind::Arcface),
            "thumbnail" => Ok(ExtractorKind::Thumbnail),
            other => Err(format!("unknown extractor {other:?} (expected arcface or thumbnail)")),
        }
    }
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtractorKind::Arcface => "arcface",
            ExtractorKind::Thumbnail => "thumbnail",
        })
    }
}

/// How faces are located in submitted images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorKind {
    /// ONNX SCRFD (det_10g).
    Scrfd,
    /// Images are pre-cropped faces; the whole frame is the face.
    WholeFrame,
}

impl FromStr for DetectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scrfd" => Ok(DetectorKind::Scrfd),
            "whole-frame" | "whole_frame" => Ok(DetectorKind::WholeFrame),
            other => Err(format!("unknown detector {other:?} (expected scrfd or whole-frame)")),
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorKind::Scrfd => "scrfd",
            DetectorKind::WholeFrame => "whole-frame",
        })
    }
}

/// Session or system D-Bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus {other:?} (expected session or system)")),
        }
    }
}

/// Optional TOML file; every key may be overridden from the environment.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    extractor: Option<ExtractorKind>,
    detector: Option<DetectorKind>,
    match_threshold: Option<f32>,
    detection_confidence: Option<f32>,
    late_after: Option<String>,
    bus: Option<BusKind>,
}

/// Daemon configuration: TOML file, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub extractor: ExtractorKind,
    pub detector: DetectorKind,
    /// Euclidean distance threshold for accepting a match (strictly below).
    pub match_threshold: f32,
    /// Minimum SCRFD score for a detection.
    pub detection_confidence: f32,
    /// Live sightings after this time of day are recorded as Late.
    pub late_after: Option<NaiveTime>,
    pub bus: BusKind,
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve against an arbitrary variable lookup.
    pub fn resolve(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = match env("ROLLCALL_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));
        let db_path = env("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("rollcall.db"));

        let extractor = env_parse(&env, "ROLLCALL_EXTRACTOR")?
            .or(file.extractor)
            .unwrap_or(ExtractorKind::Arcface);
        let detector = env_parse(&env, "ROLLCALL_DETECTOR")?
            .or(file.detector)
            .unwrap_or(DetectorKind::Scrfd);
        let match_threshold = env_parse(&env, "ROLLCALL_MATCH_THRESHOLD")?
            .or(file.match_threshold)
            .unwrap_or_else(|| extractor.default_threshold());
        let detection_confidence = env_parse(&env, "ROLLCALL_DETECTION_CONFIDENCE")?
            .or(file.detection_confidence)
            .unwrap_or(0.5);
        let bus = env_parse(&env, "ROLLCALL_BUS")?
            .or(file.bus)
            .unwrap_or(BusKind::Session);

        let late_after = match env("ROLLCALL_LATE_AFTER").or(file.late_after) {
            Some(raw) if !raw.trim().is_empty() => Some(
                rollcall_core::ledger::parse_time(&raw).map_err(|e| ConfigError::Invalid {
                    key: "ROLLCALL_LATE_AFTER",
                    value: raw.clone(),
                    reason: e.to_string(),
                })?,
            ),
            _ => None,
        };

        if !(match_threshold.is_finite() && match_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "ROLLCALL_MATCH_THRESHOLD",
                value: match_threshold.to_string(),
                reason: "must be a positive distance".into(),
            });
        }
        if !(0.0..=1.0).contains(&detection_confidence) {
            return Err(ConfigError::Invalid {
                key: "ROLLCALL_DETECTION_CONFIDENCE",
                value: detection_confidence.to_string(),
                reason: "must be between 0 and 1".into(),
            });
        }

        Ok(Self {
            model_dir,
            db_path,
            extractor,
            detector,
            match_threshold,
            detection_confidence,
            late_after,
            bus,
        })
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_parse<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value,
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn resolve(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::resolve(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = resolve(&[("HOME", "/home/ada")]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/home/ada/.local/share/rollcall/rollcall.db"));
        assert_eq!(config.model_dir, PathBuf::from("/home/ada/.local/share/rollcall/models"));
        assert_eq!(config.extractor, ExtractorKind::Arcface);
        assert_eq!(config.detector, DetectorKind::Scrfd);
        assert_eq!(config.match_threshold, 1.10);
        assert_eq!(config.detection_confidence, 0.5);
        assert_eq!(config.late_after, None);
        assert_eq!(config.bus, BusKind::Session);
    }

    #[test]
    fn test_xdg_data_home() {
        let config = resolve(&[("XDG_DATA_HOME", "/data")]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/data/rollcall/rollcall.db"));
        assert_eq!(config.scrfd_model_path(), PathBuf::from("/data/rollcall/models/det_10g.onnx"));
    }

    #[test]
    fn test_threshold_default_follows_extractor() {
        let config = resolve(&[("ROLLCALL_EXTRACTOR", "Thumbnail")]).unwrap();
        assert_eq!(config.extractor, ExtractorKind::Thumbnail);
        assert_eq!(config.match_threshold, 0.60);

        let config = resolve(&[
            ("ROLLCALL_EXTRACTOR", "thumbnail"),
            ("ROLLCALL_MATCH_THRESHOLD", "0.45"),
        ])
        .unwrap();
        assert_eq!(config.match_threshold, 0.45);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            resolve(&[("ROLLCALL_MATCH_THRESHOLD", "close")]),
            Err(ConfigError::Invalid { key: "ROLLCALL_MATCH_THRESHOLD", .. })
        ));
        assert!(matches!(
            resolve(&[("ROLLCALL_MATCH_THRESHOLD", "-1")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            resolve(&[("ROLLCALL_EXTRACTOR", "dlib")]),
            Err(ConfigError::Invalid { key: "ROLLCALL_EXTRACTOR", .. })
        ));
        assert!(matches!(
            resolve(&[("ROLLCALL_LATE_AFTER", "9am")]),
            Err(ConfigError::Invalid { key: "ROLLCALL_LATE_AFTER", .. })
        ));
        assert!(matches!(
            resolve(&[("ROLLCALL_DETECTION_CONFIDENCE", "1.5")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_file_then_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
db_path = "/srv/rollcall/attendance.db"
extractor = "thumbnail"
detector = "whole-frame"
match_threshold = 0.5
late_after = "09:00"
"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let config = resolve(&[("ROLLCALL_CONFIG", path.as_str())]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/srv/rollcall/attendance.db"));
        assert_eq!(config.extractor, ExtractorKind::Thumbnail);
        assert_eq!(config.detector, DetectorKind::WholeFrame);
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.late_after, NaiveTime::from_hms_opt(9, 0, 0));

        let config = resolve(&[
            ("ROLLCALL_CONFIG", path.as_str()),
            ("ROLLCALL_MATCH_THRESHOLD", "0.3"),
            ("ROLLCALL_LATE_AFTER", ""),
        ])
        .unwrap();
        assert_eq!(config.match_threshold, 0.3);
        assert_eq!(config.late_after, None);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "camera_device = \"/dev/video0\"").unwrap();
        let path = file.path().to_string_lossy().into_owned();
        assert!(matches!(
            resolve(&[("ROLLCALL_CONFIG", path.as_str())]),
            Err(ConfigError::Parse { .. })
        ));
    }
}
