use faceswap_core::detector::SCRFD_DEFAULT_CONFIDENCE;
use faceswap_core::ModelPaths;
use std::path::PathBuf;

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0).
    pub host: String,
    /// Listen port (default: 5000).
    pub port: u16,
    /// Where uploaded inputs are written.
    pub upload_dir: PathBuf,
    /// Where swapped results are written and served from.
    pub output_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum request body size in bytes.
    pub max_upload_bytes: usize,
    /// Minimum SCRFD score for a face to count.
    pub detection_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
            model_dir: faceswap_core::default_model_dir(),
            max_upload_bytes: 16 * 1024 * 1024,
            detection_threshold: SCRFD_DEFAULT_CONFIDENCE,
        }
    }
}

impl Config {
    /// Load configuration from `FACESWAP_*` environment variables with defaults.
    /// `PORT` is honoured when `FACESWAP_PORT` is unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = env_parse("FACESWAP_PORT")
            .or_else(|| env_parse("PORT"))
            .unwrap_or(defaults.port);

        Self {
            host: std::env::var("FACESWAP_HOST").unwrap_or(defaults.host),
            port,
            upload_dir: env_path("FACESWAP_UPLOAD_DIR").unwrap_or(defaults.upload_dir),
            output_dir: env_path("FACESWAP_OUTPUT_DIR").unwrap_or(defaults.output_dir),
            model_dir: defaults.model_dir,
            max_upload_bytes: env_parse::<usize>("FACESWAP_MAX_UPLOAD_MB")
                .and_then(megabytes)
                .unwrap_or(defaults.max_upload_bytes),
            detection_threshold: env_parse("FACESWAP_DET_THRESHOLD")
                .unwrap_or(defaults.detection_threshold),
        }
    }

    /// Paths of the detector, recognizer and swapper models.
    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    /// Create the upload and output directories if they do not exist.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.upload_dir)?;
        std::fs::create_dir_all(&self.output_dir)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `mb` megabytes in bytes, or `None` if that does not fit in `usize`.
fn megabytes(mb: usize) -> Option<usize> {
    mb.checked_mul(1024 * 1024)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_upload_limits() {
        let config = Config::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.max_upload_bytes, 16 * 1024 * 1024);
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.output_dir, PathBuf::from("outputs"));
        assert_eq!(config.bind_addr(), "0.0.0.0:5000");
    }

    #[test]
    fn test_megabytes_overflow_is_rejected() {
        assert_eq!(megabytes(16), Some(16 * 1024 * 1024));
        assert_eq!(megabytes(usize::MAX), None);
        assert_eq!(megabytes(usize::MAX / (1024 * 1024) + 1), None);
    }

    #[test]
    fn test_model_paths_follow_model_dir() {
        let config = Config {
            model_dir: PathBuf::from("/srv/models"),
            ..Config::default()
        };
        assert_eq!(
            config.model_paths().swapper,
            PathBuf::from("/srv/models/inswapper_128.onnx")
        );
    }
}
