//! inswapper face swapper via ONNX Runtime.
//!
//! Transplants a source identity (ArcFace embedding) onto a target face. The
//! target face is aligned to a 128×128 crop, run through the network together
//! with the projected identity latent, and blended back into the target image.
//!
//! The network's embedding map (`emap`) is a graph initializer that ONNX
//! Runtime does not expose, so it is loaded from a sidecar file: 512×512
//! little-endian `f32`, row-major.

use crate::alignment;
use crate::recognizer::ARCFACE_EMBEDDING_DIM;
use crate::types::{l2_norm, BoundingBox, Embedding};
use image::RgbImage;
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INSWAPPER_INPUT_SIZE: usize = 128;
const INSWAPPER_LATENT_DIM: usize = 512;
const EMAP_LEN: usize = ARCFACE_EMBEDDING_DIM * INSWAPPER_LATENT_DIM;

#[derive(Error, Debug)]
pub enum SwapperError {
    #[error("model file not found: {0} — place inswapper_128.onnx in the model directory")]
    ModelNotFound(String),
    #[error("embedding map not found: {0} — export the inswapper emap initializer as raw f32 next to the model")]
    EmapNotFound(String),
    #[error("embedding map has {actual} values, expected {expected}")]
    InvalidEmap { expected: usize, actual: usize },
    #[error("reading embedding map: {0}")]
    Io(#[from] std::io::Error),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("target face has no landmarks — detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("source embedding has {0} dimensions, expected {ARCFACE_EMBEDDING_DIM}")]
    EmbeddingDim(usize),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// inswapper_128-based face swapper.
pub struct FaceSwapper {
    session: Session,
    emap: Vec<f32>,
    /// Whether the model declares its "source" (latent) input before "target".
    source_first: bool,
}

impl FaceSwapper {
    /// Load the inswapper ONNX model and its embedding map.
    pub fn load(model_path: &str, emap_path: &str) -> Result<Self, SwapperError> {
        if !Path::new(model_path).exists() {
            return Err(SwapperError::ModelNotFound(model_path.to_string()));
        }
        if !Path::new(emap_path).exists() {
            return Err(SwapperError::EmapNotFound(emap_path.to_string()));
        }

        let emap = parse_emap(&std::fs::read(emap_path)?)?;

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let input_names: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        let source_first = input_names.first().is_some_and(|n| n == "source");

        tracing::info!(
            path = model_path,
            emap = emap_path,
            inputs = ?input_names,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded inswapper model"
        );

        Ok(Self {
            session,
            emap,
            source_first,
        })
    }

    /// Replace `target_face` in `target` with the identity in `source`.
    pub fn swap(
        &mut self,
        target: &RgbImage,
        target_face: &BoundingBox,
        source: &Embedding,
    ) -> Result<RgbImage, SwapperError> {
        let landmarks = target_face.landmarks.as_ref().ok_or(SwapperError::NoLandmarks)?;
        if source.values.len() != ARCFACE_EMBEDDING_DIM {
            return Err(SwapperError::EmbeddingDim(source.values.len()));
        }

        let (aligned, matrix) = alignment::align_face(target, landmarks, INSWAPPER_INPUT_SIZE);
        let blob = preprocess(&aligned);
        let latent = project_latent(&source.values, &self.emap);

        let blob_view = TensorRef::from_array_view(blob.view())?;
        let latent_view = TensorRef::from_array_view(latent.view())?;
        let outputs = if self.source_first {
            self.session.run(ort::inputs![latent_view, blob_view])?
        } else {
            self.session.run(ort::inputs![blob_view, latent_view])?
        };

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| SwapperError::InferenceFailed(format!("swapped face: {e}")))?;

        let expected = 3 * INSWAPPER_INPUT_SIZE * INSWAPPER_INPUT_SIZE;
        if raw.len() != expected {
            return Err(SwapperError::InferenceFailed(format!(
                "expected {expected} output values, got {}",
                raw.len()
            )));
        }

        let swapped = postprocess(raw);
        let mut result = target.clone();
        alignment::paste_back(&mut result, &swapped, INSWAPPER_INPUT_SIZE, &matrix);
        Ok(result)
    }
}

/// Decode a raw little-endian f32 embedding map.
fn parse_emap(bytes: &[u8]) -> Result<Vec<f32>, SwapperError> {
    let actual = bytes.len() / 4;
    if bytes.len() % 4 != 0 || actual != EMAP_LEN {
        return Err(SwapperError::InvalidEmap {
            expected: EMAP_LEN,
            actual,
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Project an identity embedding into the swapper latent space: `normalize(e · emap)`.
fn project_latent(embedding: &[f32], emap: &[f32]) -> Array2<f32> {
    let dim = embedding.len();
    let out_dim = emap.len() / dim.max(1);

    let mut latent = vec![0.0f32; out_dim];
    for (i, e) in embedding.iter().enumerate() {
        let row = &emap[i * out_dim..(i + 1) * out_dim];
        for (l, m) in latent.iter_mut().zip(row) {
            *l += e * m;
        }
    }

    let norm = l2_norm(&latent);
    if norm > 0.0 {
        latent.iter_mut().for_each(|l| *l /= norm);
    }

    Array2::from_shape_vec((1, out_dim), latent).unwrap_or_else(|_| Array2::zeros((1, out_dim)))
}

/// Convert a 128x128 interleaved RGB crop into a NCHW tensor scaled to [0, 1].
fn preprocess(aligned: &[u8]) -> Array4<f32> {
    let size = INSWAPPER_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            for c in 0..3 {
                let pixel = aligned.get((y * size + x) * 3 + c).copied().unwrap_or(0);
                tensor[[0, c, y, x]] = pixel as f32 / 255.0;
            }
        }
    }
    tensor
}

/// Convert the planar [0, 1] network output back to interleaved RGB bytes.
fn postprocess(planar: &[f32]) -> Vec<u8> {
    let plane = INSWAPPER_INPUT_SIZE * INSWAPPER_INPUT_SIZE;
    let mut out = vec![0u8; plane * 3];
    for i in 0..plane {
        for c in 0..3 {
            let v = planar.get(c * plane + i).copied().unwrap_or(0.0);
            out[i * 3 + c] = (v * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}
