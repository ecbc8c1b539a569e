use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceswap_core::detector::SCRFD_DEFAULT_CONFIDENCE;
use faceswap_core::{FaceSwap, ModelPaths, OnnxPipeline};
use image::RgbImage;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "faceswap", about = "Offline face swap and model diagnostics")]
struct Cli {
    /// Directory holding det_10g.onnx, w600k_r50.onnx and inswapper_128.{onnx,emap}
    #[arg(long, global = true, default_value_os_t = faceswap_core::default_model_dir())]
    model_dir: PathBuf,

    /// Minimum detection score for a face to count
    #[arg(long, global = true, default_value_t = SCRFD_DEFAULT_CONFIDENCE)]
    threshold: f32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Put the face from SOURCE onto the face in TARGET
    Swap {
        /// Image providing the identity (e.g. a player headshot)
        #[arg(short, long)]
        source: PathBuf,
        /// Image whose face is replaced (e.g. a jersey template)
        #[arg(short, long)]
        target: PathBuf,
        /// Where to write the result; format follows the extension
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List detected faces as JSON
    Detect {
        image: PathBuf,
    },
    /// Cosine similarity between the most confident faces of two images
    Compare {
        first: PathBuf,
        second: PathBuf,
    },
    /// Check that every model file is present
    Models,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = ModelPaths::in_dir(&cli.model_dir);

    match cli.command {
        Commands::Swap {
            source,
            target,
            output,
        } => {
            let mut pipeline = load_pipeline(&paths, cli.threshold)?;
            let source_image = read_rgb(&source)?;
            let target_image = read_rgb(&target)?;

            let result = pipeline
                .swap_faces(&source_image, &target_image)
                .context("face swap failed")?;
            result
                .image
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;

            println!(
                "Wrote {} (source face {:.2}, target face {:.2})",
                output.display(),
                result.source_face.confidence,
                result.target_face.confidence
            );
        }
        Commands::Detect { image } => {
            let mut pipeline = load_pipeline(&paths, cli.threshold)?;
            let faces = pipeline.detect(&read_rgb(&image)?)?;
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Compare { first, second } => {
            let mut pipeline = load_pipeline(&paths, cli.threshold)?;
            let Some((_, a)) = pipeline.embed(&read_rgb(&first)?)? else {
                bail!("no face detected in {}", first.display());
            };
            let Some((_, b)) = pipeline.embed(&read_rgb(&second)?)? else {
                bail!("no face detected in {}", second.display());
            };
            println!("{:.4}", a.similarity(&b));
        }
        Commands::Models => {
            let mut missing = 0;
            for (label, path) in paths.entries() {
                let state = if path.is_file() {
                    "ok"
                } else {
                    missing += 1;
                    "MISSING"
                };
                println!("{label:<14} {state:<8} {}", path.display());
            }
            if missing > 0 {
                bail!("{missing} model file(s) missing from {}", cli.model_dir.display());
            }
        }
    }

    Ok(())
}

fn load_pipeline(paths: &ModelPaths, threshold: f32) -> Result<OnnxPipeline> {
    tracing::info!(detector = %paths.detector.display(), threshold, "loading models");
    OnnxPipeline::load(paths, threshold).context("loading models (run `faceswap models` to check)")
}

fn read_rgb(path: &Path) -> Result<RgbImage> {
    let image = image::ImageReader::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("decoding {}", path.display()))?;
    Ok(image.to_rgb8())
}
