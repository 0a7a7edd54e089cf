//! OCR worker configuration types.

use std::time::Duration;

use serde::Deserialize;

/// OCR engine discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    /// Treat the uploaded document as UTF-8 text.
    #[default]
    PlainText,
    /// Pipe the document through an external OCR program.
    Command,
}

/// OCR processing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    pub engine: EngineType,
    /// Program for the command engine.
    pub command: String,
    /// Arguments for the command engine. The document is written to stdin.
    pub args: Vec<String>,
    /// Upper bound on a single recognition.
    pub timeout_secs: u64,
    /// Email the OCR text to the requesting user.
    pub notify: bool,
    /// Subject line for result notifications.
    pub notify_subject: String,
}

impl OcrSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            engine: EngineType::PlainText,
            command: "tesseract".to_string(),
            args: vec!["stdin".to_string(), "stdout".to_string()],
            timeout_secs: 60,
            notify: true,
            notify_subject: "Your OCR result".to_string(),
        }
    }
}
