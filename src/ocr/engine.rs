//! OCR engines.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::OcrError;
use crate::config::{EngineType, OcrSettings};

/// Recognizes text in a document.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    async fn recognize(&self, document: &[u8]) -> Result<String, OcrError>;
}

/// Treats the document as UTF-8 text.
#[derive(Debug, Default, Clone)]
pub struct PlainTextEngine;

#[async_trait]
impl OcrEngine for PlainTextEngine {
    async fn recognize(&self, document: &[u8]) -> Result<String, OcrError> {
        std::str::from_utf8(document)
            .map(str::to_string)
            .map_err(|e| OcrError::InvalidInput(format!("document is not UTF-8 text: {e}")))
    }
}

/// Pipes the document through an external program and reads text from its
/// stdout, e.g. `tesseract stdin stdout`.
///
/// The child is killed if it outlives the timeout.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl OcrEngine for CommandEngine {
    async fn recognize(&self, document: &[u8]) -> Result<String, OcrError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OcrError::Engine(format!("failed to start '{}': {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::Engine("child stdin unavailable".to_string()))?;
        let input = document.to_vec();
        let writer = tokio::spawn(async move {
            // The program may exit without reading everything.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "OCR program closed stdin early");
            }
        });

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                writer.abort();
                warn!(program = %self.program, timeout = ?self.timeout, "OCR program timed out");
                return Err(OcrError::Timeout(self.timeout));
            }
        };
        let _ = writer.await;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Engine(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim().chars().take(200).collect::<String>()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

/// Build the engine named by the settings.
pub fn engine_from_settings(settings: &OcrSettings) -> Arc<dyn OcrEngine> {
    match settings.engine {
        EngineType::PlainText => Arc::new(PlainTextEngine),
        EngineType::Command => Arc::new(CommandEngine::new(
            settings.command.clone(),
            settings.args.clone(),
            settings.timeout(),
        )),
    }
}
