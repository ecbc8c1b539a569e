//! faceswap-core — Face detection, recognition and swapping engine.
//!
//! Uses SCRFD for face detection, ArcFace for identity embeddings and
//! inswapper for the swap itself, all running via ONNX Runtime.

pub mod alignment;
pub mod detector;
pub mod pipeline;
pub mod recognizer;
pub mod swapper;
pub mod types;

pub use detector::FaceDetector;
pub use pipeline::{FaceSwap, ModelPaths, OnnxPipeline, SwapError, SwapOutput};
pub use recognizer::FaceRecognizer;
pub use swapper::FaceSwapper;
pub use types::{BoundingBox, Embedding};

use std::path::PathBuf;

/// Default model directory: `$FACESWAP_MODEL_DIR`, else
/// `$XDG_DATA_HOME/faceswap/models`, else `~/.local/share/faceswap/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACESWAP_MODEL_DIR") {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceswap/models")
}
