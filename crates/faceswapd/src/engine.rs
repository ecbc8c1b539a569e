use faceswap_core::{FaceSwap, SwapError};
use image::{ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Could not read one or both images")]
    UnreadableImage(#[source] image::ImageError),
    #[error("{0}")]
    Swap(#[from] SwapError),
    #[error("could not save result: {0}")]
    SaveFailed(#[source] image::ImageError),
    #[error("failed to start engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Whether the failure was caused by the uploaded images rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::UnreadableImage(_)
                | EngineError::Swap(SwapError::NoSourceFace | SwapError::NoTargetFace)
        )
    }
}

/// One swap request: read two images from disk, write the result.
#[derive(Debug, Clone)]
pub struct SwapJob {
    /// Image providing the face identity (the player headshot).
    pub source_path: PathBuf,
    /// Image whose face gets replaced (the jersey template).
    pub target_path: PathBuf,
    pub output_path: PathBuf,
}

/// Result of a completed swap.
#[derive(Debug, Clone)]
pub struct SwapOutcome {
    pub source_confidence: f32,
    pub target_confidence: f32,
    pub width: u32,
    pub height: u32,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Swap {
        job: SwapJob,
        reply: oneshot::Sender<Result<SwapOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Whether the engine thread is still accepting requests.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Run a swap on the engine thread and wait for it.
    pub async fn swap(&self, job: SwapJob) -> Result<SwapOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Swap {
                job,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The pipeline is owned by that thread for its whole life; requests are
/// handled one at a time in arrival order.
pub fn spawn_engine<P>(mut pipeline: P) -> Result<EngineHandle, EngineError>
where
    P: FaceSwap + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("faceswap-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Swap { job, reply } => {
                        let result = run_swap(&mut pipeline, &job);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Read both images, swap, and save the result next to the other outputs.
fn run_swap<P: FaceSwap>(pipeline: &mut P, job: &SwapJob) -> Result<SwapOutcome, EngineError> {
    let started = Instant::now();

    let source = read_rgb(&job.source_path)?;
    let target = read_rgb(&job.target_path)?;

    let output = pipeline.swap_faces(&source, &target)?;

    output
        .image
        .save(&job.output_path)
        .map_err(EngineError::SaveFailed)?;

    tracing::info!(
        output = %job.output_path.display(),
        source_confidence = output.source_face.confidence,
        target_confidence = output.target_face.confidence,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "swap complete"
    );

    Ok(SwapOutcome {
        source_confidence: output.source_face.confidence,
        target_confidence: output.target_face.confidence,
        width: output.image.width(),
        height: output.image.height(),
    })
}

/// Decode an image by content, not by extension.
fn read_rgb(path: &Path) -> Result<RgbImage, EngineError> {
    let image = ImageReader::open(path)
        .map_err(|e| EngineError::UnreadableImage(image::ImageError::IoError(e)))?
        .with_guessed_format()
        .map_err(|e| EngineError::UnreadableImage(image::ImageError::IoError(e)))?
        .decode()
        .map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "could not decode upload");
            EngineError::UnreadableImage(e)
        })?;
    Ok(image.to_rgb8())
}
