use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use faceswap_core::SwapError;
use std::sync::Arc;

use super::types::*;
use crate::config::Config;
use crate::engine::{EngineError, EngineHandle, SwapJob};
use crate::upload::{allowed_file, content_type_for, secure_filename};

const INDEX_HTML: &str = include_str!("../../static/index.html");
const INVALID_FILE_TYPE: &str = "Invalid file type. Use PNG, JPG, or TIF";

/// Shared server state.
pub struct AppState {
    pub engine: EngineHandle,
    pub config: Config,
}

pub type SharedState = Arc<AppState>;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError::new(message)))
}

fn server_error(err: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    tracing::error!(error = %err, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
}

fn multipart_error(err: MultipartError) -> (StatusCode, Json<ApiError>) {
    tracing::warn!(error = %err, "rejected multipart body");
    api_error(err.status(), err.body_text())
}

// ============================================================================
// Pages
// ============================================================================

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        models_loaded: state.engine.is_running(),
    })
}

// ============================================================================
// Swap
// ============================================================================

/// An uploaded file part.
struct Upload {
    file_name: String,
    data: Bytes,
}

/// Pull the two image parts out of the form. Other fields are ignored;
/// parts without a filename are not files and count as missing.
async fn read_uploads(mut multipart: Multipart) -> ApiResult<(Option<Upload>, Option<Upload>)> {
    let mut source = None;
    let mut target = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let slot = match field.name() {
            Some(SOURCE_FIELD) => &mut source,
            Some(TARGET_FIELD) => &mut target,
            _ => continue,
        };
        let Some(file_name) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let data = field.bytes().await.map_err(multipart_error)?;
        *slot = Some(Upload { file_name, data });
    }

    Ok((source, target))
}

/// Client-facing wording for a failed swap.
fn describe(err: &EngineError) -> String {
    match err {
        EngineError::Swap(SwapError::NoSourceFace) => {
            "No face detected in the source image (player headshot)".to_string()
        }
        EngineError::Swap(SwapError::NoTargetFace) => {
            "No face detected in the target image (jersey template)".to_string()
        }
        other => other.to_string(),
    }
}

pub async fn swap(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> ApiResult<Json<SwapResponse>> {
    let (source, target) = read_uploads(multipart).await?;

    let (Some(source), Some(target)) = (source, target) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Both images are required"));
    };

    if source.file_name.is_empty() || target.file_name.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "No files selected"));
    }

    if !(allowed_file(&source.file_name) && allowed_file(&target.file_name)) {
        return Err(api_error(StatusCode::BAD_REQUEST, INVALID_FILE_TYPE));
    }

    // Sanitizing can strip the extension ("файл.png" → "png"), so check again.
    let source_name = secure_filename(&source.file_name);
    let target_name = secure_filename(&target.file_name);
    if !(allowed_file(&source_name) && allowed_file(&target_name)) {
        return Err(api_error(StatusCode::BAD_REQUEST, INVALID_FILE_TYPE));
    }

    let config = &state.config;
    let result_name = format!("result_{source_name}");
    let job = SwapJob {
        source_path: config.upload_dir.join(format!("player_{source_name}")),
        target_path: config.upload_dir.join(format!("jersey_{target_name}")),
        output_path: config.output_dir.join(&result_name),
    };

    tokio::fs::write(&job.source_path, &source.data)
        .await
        .map_err(server_error)?;
    tokio::fs::write(&job.target_path, &target.data)
        .await
        .map_err(server_error)?;

    tracing::info!(
        source = %source_name,
        source_bytes = source.data.len(),
        target = %target_name,
        target_bytes = target.data.len(),
        "swap requested"
    );

    match state.engine.swap(job).await {
        Ok(outcome) => {
            tracing::debug!(
                result = %result_name,
                width = outcome.width,
                height = outcome.height,
                source_confidence = outcome.source_confidence,
                target_confidence = outcome.target_confidence,
                "swap response ready"
            );
            Ok(Json(SwapResponse {
                success: true,
                message: "Face swap completed successfully!".to_string(),
                result_url: format!("/result/{result_name}"),
            }))
        }
        Err(err @ (EngineError::ChannelClosed | EngineError::Spawn(_))) => Err(server_error(err)),
        Err(err) => {
            let status = if err.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let message = format!("Face swap failed: {}", describe(&err));
            tracing::warn!(%status, error = %err, "swap failed");
            Err(api_error(status, message))
        }
    }
}

// ============================================================================
// Results
// ============================================================================

pub async fn result(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let not_found = || api_error(StatusCode::NOT_FOUND, "Result not found");

    // Only names this service could have produced; rejects traversal.
    if filename.is_empty() || secure_filename(&filename) != filename {
        return Err(not_found());
    }

    let path = state.config.output_dir.join(&filename);
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            not_found()
        } else {
            server_error(e)
        }
    })?;

    Ok(([(header::CONTENT_TYPE, content_type_for(&filename))], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::engine::spawn_engine;
    use faceswap_core::swapper::SwapperError;
    use faceswap_core::{BoundingBox, FaceSwap, SwapOutput};
    use image::{ImageFormat, Rgb, RgbImage};
    use reqwest::multipart::{Form, Part};
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Treats any image with a non-black pixel as containing one face and
    /// returns the target with its top-left pixel painted white.
    struct StubPipeline;

    fn stub_face(image: &RgbImage) -> Option<BoundingBox> {
        image.pixels().any(|p| p.0 != [0, 0, 0]).then(|| BoundingBox {
            x: 1.0,
            y: 1.0,
            width: 4.0,
            height: 4.0,
            confidence: 0.9,
            landmarks: None,
        })
    }

    impl FaceSwap for StubPipeline {
        fn swap_faces(&mut self, source: &RgbImage, target: &RgbImage) -> Result<SwapOutput, SwapError> {
            let source_face = stub_face(source).ok_or(SwapError::NoSourceFace)?;
            let target_face = stub_face(target).ok_or(SwapError::NoTargetFace)?;
            let mut image = target.clone();
            image.put_pixel(0, 0, Rgb([255, 255, 255]));
            Ok(SwapOutput { image, source_face, target_face })
        }
    }

    /// Finds faces but the swap network fails.
    struct FailingPipeline;

    impl FaceSwap for FailingPipeline {
        fn swap_faces(&mut self, _source: &RgbImage, _target: &RgbImage) -> Result<SwapOutput, SwapError> {
            Err(SwapError::Swapper(SwapperError::InferenceFailed(
                "swapped face: shape mismatch".to_string(),
            )))
        }
    }

    /// Brings the engine thread down on the first job.
    struct PanickingPipeline;

    impl FaceSwap for PanickingPipeline {
        fn swap_faces(&mut self, _source: &RgbImage, _target: &RgbImage) -> Result<SwapOutput, SwapError> {
            panic!("onnx runtime aborted");
        }
    }

    struct TestApp {
        base: String,
        dir: TempDir,
        client: reqwest::Client,
    }

    impl TestApp {
        async fn post_swap(&self, form: Form) -> reqwest::Response {
            self.client
                .post(format!("{}/swap", self.base))
                .multipart(form)
                .send()
                .await
                .unwrap()
        }

        async fn get(&self, path: &str) -> reqwest::Response {
            self.client
                .get(format!("{}{}", self.base, path))
                .send()
                .await
                .unwrap()
        }
    }

    async fn spawn_app_on<P>(pipeline: P, configure: impl FnOnce(&mut Config)) -> TestApp
    where
        P: FaceSwap + Send + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            upload_dir: dir.path().join("uploads"),
            output_dir: dir.path().join("outputs"),
            ..Config::default()
        };
        config.create_dirs().unwrap();
        configure(&mut config);

        let engine = spawn_engine(pipeline).unwrap();
        let app = router(Arc::new(AppState { engine, config }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestApp {
            base: format!("http://{addr}"),
            dir,
            client: reqwest::Client::new(),
        }
    }

    async fn spawn_app_with(max_upload_bytes: usize) -> TestApp {
        spawn_app_on(StubPipeline, |config| config.max_upload_bytes = max_upload_bytes).await
    }

    async fn spawn_app() -> TestApp {
        spawn_app_on(StubPipeline, |_| {}).await
    }

    fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    fn face_png() -> Vec<u8> {
        encode(&RgbImage::from_pixel(8, 8, Rgb([200, 150, 120])), ImageFormat::Png)
    }

    fn blank_png() -> Vec<u8> {
        encode(&RgbImage::new(8, 8), ImageFormat::Png)
    }

    fn part(name: &str, data: Vec<u8>) -> Part {
        Part::bytes(data).file_name(name.to_string())
    }

    fn swap_form(source: (&str, Vec<u8>), target: (&str, Vec<u8>)) -> Form {
        Form::new()
            .part(SOURCE_FIELD, part(source.0, source.1))
            .part(TARGET_FIELD, part(target.0, target.1))
    }

    #[tokio::test]
    async fn test_index_serves_form() {
        let app = spawn_app().await;
        let resp = app.get("/").await;
        assert_eq!(resp.status().as_u16(), 200);
        let body = resp.text().await.unwrap();
        assert!(body.contains("player_head"));
        assert!(body.contains("jersey_template"));
    }

    #[tokio::test]
    async fn test_health_reports_engine() {
        let app = spawn_app().await;
        let health: HealthResponse = app.get("/health").await.json().await.unwrap();
        assert_eq!(health.status, "ok");
        assert!(health.models_loaded);
    }

    #[tokio::test]
    async fn test_swap_success_returns_retrievable_result() {
        let app = spawn_app().await;
        let resp = app
            .post_swap(swap_form(("my head.png", face_png()), ("jersey.jpg", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 200);

        let body: SwapResponse = resp.json().await.unwrap();
        assert!(body.success);
        assert_eq!(body.message, "Face swap completed successfully!");
        assert_eq!(body.result_url, "/result/result_my_head.png");

        assert!(app.dir.path().join("uploads/player_my_head.png").exists());
        assert!(app.dir.path().join("uploads/jersey_jersey.jpg").exists());

        let result = app.get(&body.result_url).await;
        assert_eq!(result.status().as_u16(), 200);
        assert_eq!(
            result.headers()[reqwest::header::CONTENT_TYPE].to_str().unwrap(),
            "image/png"
        );
        let bytes = result.bytes().await.unwrap();
        let image = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(image.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[tokio::test]
    async fn test_swap_missing_field() {
        let app = spawn_app().await;
        let form = Form::new().part(SOURCE_FIELD, part("head.png", face_png()));
        let resp = app.post_swap(form).await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: ApiError = resp.json().await.unwrap();
        assert_eq!(body.error, "Both images are required");
    }

    #[tokio::test]
    async fn test_swap_text_field_is_not_a_file() {
        let app = spawn_app().await;
        let form = Form::new()
            .text(SOURCE_FIELD, "head.png")
            .part(TARGET_FIELD, part("jersey.png", face_png()));
        let resp = app.post_swap(form).await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: ApiError = resp.json().await.unwrap();
        assert_eq!(body.error, "Both images are required");
    }

    #[tokio::test]
    async fn test_swap_empty_filename() {
        let app = spawn_app().await;
        let resp = app
            .post_swap(swap_form(("", face_png()), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: ApiError = resp.json().await.unwrap();
        assert_eq!(body.error, "No files selected");
    }

    #[tokio::test]
    async fn test_swap_wrong_extension() {
        let app = spawn_app().await;
        let resp = app
            .post_swap(swap_form(("head.gif", face_png()), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: ApiError = resp.json().await.unwrap();
        assert_eq!(body.error, INVALID_FILE_TYPE);
    }

    #[tokio::test]
    async fn test_swap_extension_lost_after_sanitizing() {
        let app = spawn_app().await;
        let resp = app
            .post_swap(swap_form(("голова 1.png", face_png()), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 200);

        let resp = app
            .post_swap(swap_form(("日本.png", face_png()), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: ApiError = resp.json().await.unwrap();
        assert_eq!(body.error, INVALID_FILE_TYPE);
    }

    #[tokio::test]
    async fn test_swap_non_image_content() {
        let app = spawn_app().await;
        let resp = app
            .post_swap(swap_form(
                ("head.png", b"this is a text file".to_vec()),
                ("jersey.png", face_png()),
            ))
            .await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: ApiError = resp.json().await.unwrap();
        assert_eq!(body.error, "Face swap failed: Could not read one or both images");
    }

    #[tokio::test]
    async fn test_swap_no_face_in_source() {
        let app = spawn_app().await;
        let resp = app
            .post_swap(swap_form(("head.png", blank_png()), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: ApiError = resp.json().await.unwrap();
        assert_eq!(
            body.error,
            "Face swap failed: No face detected in the source image (player headshot)"
        );
        assert!(!app.dir.path().join("outputs/result_head.png").exists());
    }

    #[tokio::test]
    async fn test_swap_no_face_in_target() {
        let app = spawn_app().await;
        let resp = app
            .post_swap(swap_form(("head.png", face_png()), ("jersey.tiff", blank_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: ApiError = resp.json().await.unwrap();
        assert_eq!(
            body.error,
            "Face swap failed: No face detected in the target image (jersey template)"
        );
    }

    #[tokio::test]
    async fn test_swap_body_too_large() {
        let app = spawn_app_with(1024).await;
        let resp = app
            .post_swap(swap_form(("head.png", vec![7u8; 4096]), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 413);
    }

    #[tokio::test]
    async fn test_result_unknown_file() {
        let app = spawn_app().await;
        let resp = app.get("/result/result_nobody.png").await;
        assert_eq!(resp.status().as_u16(), 404);
        let body: ApiError = resp.json().await.unwrap();
        assert_eq!(body.error, "Result not found");
    }

    #[tokio::test]
    async fn test_result_rejects_traversal() {
        let app = spawn_app().await;
        std::fs::write(app.dir.path().join("secret.png"), face_png()).unwrap();
        let resp = app.get("/result/..%2Fsecret.png").await;
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_swap_keeps_accented_letters() {
        let app = spawn_app().await;
        let resp = app
            .post_swap(swap_form(("Stéphane.png", face_png()), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 200);
        let body: SwapResponse = resp.json().await.unwrap();
        assert_eq!(body.result_url, "/result/result_Stephane.png");
        assert_eq!(app.get(&body.result_url).await.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_swap_inference_failure() {
        let app = spawn_app_on(FailingPipeline, |_| {}).await;
        let resp = app
            .post_swap(swap_form(("head.png", face_png()), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 500);
        let body: ApiError = resp.json().await.unwrap();
        assert!(body.error.starts_with("Face swap failed: "), "{}", body.error);
        assert!(body.error.contains("shape mismatch"), "{}", body.error);
    }

    #[tokio::test]
    async fn test_swap_save_failure() {
        let app = spawn_app_on(StubPipeline, |config| {
            config.output_dir = config.output_dir.join("missing");
        })
        .await;
        let resp = app
            .post_swap(swap_form(("head.png", face_png()), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 500);
        let body: ApiError = resp.json().await.unwrap();
        assert!(body.error.starts_with("Face swap failed: could not save result"), "{}", body.error);
    }

    #[tokio::test]
    async fn test_swap_upload_dir_unwritable() {
        let app = spawn_app_on(StubPipeline, |config| {
            config.upload_dir = config.upload_dir.join("missing");
        })
        .await;
        let resp = app
            .post_swap(swap_form(("head.png", face_png()), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 500);
        let body: ApiError = resp.json().await.unwrap();
        assert!(body.error.starts_with("Server error: "), "{}", body.error);
    }

    #[tokio::test]
    async fn test_swap_engine_gone() {
        let app = spawn_app_on(PanickingPipeline, |_| {}).await;
        let resp = app
            .post_swap(swap_form(("head.png", face_png()), ("jersey.png", face_png())))
            .await;
        assert_eq!(resp.status().as_u16(), 500);
        let body: ApiError = resp.json().await.unwrap();
        assert_eq!(body.error, "Server error: engine thread exited");

        // The receiver is dropped while the engine thread finishes unwinding.
        let mut models_loaded = true;
        for _ in 0..50 {
            let health: HealthResponse = app.get("/health").await.json().await.unwrap();
            models_loaded = health.models_loaded;
            if !models_loaded {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!models_loaded);
    }
}
