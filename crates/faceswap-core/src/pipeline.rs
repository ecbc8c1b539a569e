//! Detect → embed → swap pipeline.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::swapper::{FaceSwapper, SwapperError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("no face detected in the source image")]
    NoSourceFace,
    #[error("no face detected in the target image")]
    NoTargetFace,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("swapper error: {0}")]
    Swapper(#[from] SwapperError),
}

/// Result of a successful swap.
pub struct SwapOutput {
    pub image: RgbImage,
    /// Face whose identity was taken.
    pub source_face: BoundingBox,
    /// Face that was replaced.
    pub target_face: BoundingBox,
}

/// Strategy for swapping the face in `source` onto the face in `target`.
pub trait FaceSwap {
    fn swap_faces(&mut self, source: &RgbImage, target: &RgbImage) -> Result<SwapOutput, SwapError>;
}

/// Locations of the ONNX model files.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    pub swapper: PathBuf,
    pub swapper_emap: PathBuf,
}

impl ModelPaths {
    /// Standard file names inside a model directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join("det_10g.onnx"),
            recognizer: dir.join("w600k_r50.onnx"),
            swapper: dir.join("inswapper_128.onnx"),
            swapper_emap: dir.join("inswapper_128.emap"),
        }
    }

    /// Every expected file, paired with a short label.
    pub fn entries(&self) -> [(&'static str, &Path); 4] {
        [
            ("detector", self.detector.as_path()),
            ("recognizer", self.recognizer.as_path()),
            ("swapper", self.swapper.as_path()),
            ("swapper emap", self.swapper_emap.as_path()),
        ]
    }
}

/// SCRFD + ArcFace + inswapper, all on ONNX Runtime.
pub struct OnnxPipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    swapper: FaceSwapper,
}

impl OnnxPipeline {
    /// Load all three models. Fails on the first missing or invalid file.
    pub fn load(paths: &ModelPaths, detection_threshold: f32) -> Result<Self, SwapError> {
        let detector = FaceDetector::load(&paths.detector.to_string_lossy())?
            .with_confidence_threshold(detection_threshold);
        let recognizer = FaceRecognizer::load(&paths.recognizer.to_string_lossy())?;
        let swapper = FaceSwapper::load(
            &paths.swapper.to_string_lossy(),
            &paths.swapper_emap.to_string_lossy(),
        )?;

        Ok(Self {
            detector,
            recognizer,
            swapper,
        })
    }

    /// All faces in `image`, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, SwapError> {
        Ok(self.detector.detect(image)?)
    }

    /// Embedding of the most confident face in `image`, if there is one.
    pub fn embed(&mut self, image: &RgbImage) -> Result<Option<(BoundingBox, Embedding)>, SwapError> {
        let Some(face) = self.detector.detect(image)?.into_iter().next() else {
            return Ok(None);
        };
        let embedding = self.recognizer.extract(image, &face)?;
        Ok(Some((face, embedding)))
    }
}

impl FaceSwap for OnnxPipeline {
    fn swap_faces(&mut self, source: &RgbImage, target: &RgbImage) -> Result<SwapOutput, SwapError> {
        let source_face = self
            .detector
            .detect(source)?
            .into_iter()
            .next()
            .ok_or(SwapError::NoSourceFace)?;
        let target_face = self
            .detector
            .detect(target)?
            .into_iter()
            .next()
            .ok_or(SwapError::NoTargetFace)?;

        tracing::debug!(
            source_confidence = source_face.confidence,
            source_area = source_face.area(),
            target_confidence = target_face.confidence,
            target_area = target_face.area(),
            "faces selected"
        );

        let identity = self.recognizer.extract(source, &source_face)?;
        let image = self.swapper.swap(target, &target_face, &identity)?;

        Ok(SwapOutput {
            image,
            source_face,
            target_face,
        })
    }
}
