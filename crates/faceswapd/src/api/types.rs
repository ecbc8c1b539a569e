use serde::{Deserialize, Serialize};

/// Multipart field carrying the face to transplant.
pub const SOURCE_FIELD: &str = "player_head";
/// Multipart field carrying the image whose face is replaced.
pub const TARGET_FIELD: &str = "jersey_template";

#[derive(Debug, Serialize, Deserialize)]
pub struct SwapResponse {
    pub success: bool,
    pub message: String,
    pub result_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub models_loaded: bool,
}

/// Every error body is `{"error": "..."}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            error: message.into(),
        }
    }
}
