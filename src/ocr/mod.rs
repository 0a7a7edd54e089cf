//! OCR processing behind the RPC worker.
//!
//! - `OcrEngine`: turns document bytes into text
//! - `OcrHandler`: the worker's `RequestHandler`; decodes the upload, runs
//!   the engine, and optionally emails the result to the requester

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod engine;
mod handler;

pub use engine::{engine_from_settings, CommandEngine, OcrEngine, PlainTextEngine};
pub use handler::OcrHandler;

/// OCR request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrRequest {
    pub user_name: String,
    pub user_email: String,
    pub user_id: String,
    /// Base64-encoded document.
    pub file: String,
}

/// OCR reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrResponse {
    pub user_name: String,
    pub user_email: String,
    pub user_id: String,
    pub ocr_text: String,
}

/// Errors from an OCR engine.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("Invalid document: {0}")]
    InvalidInput(String),

    #[error("OCR engine failed: {0}")]
    Engine(String),

    #[error("OCR engine timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let json = r#"{"user_name":"ann","user_email":"ann@x.io","user_id":"7","file":"QUJD"}"#;

        let request: OcrRequest = serde_json::from_str(json).unwrap();

        assert_eq!(request.user_id, "7");
        assert_eq!(request.file, "QUJD");
    }
}
