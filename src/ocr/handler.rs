//! RPC handler for OCR requests.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{info, warn};

use super::{OcrEngine, OcrError, OcrRequest, OcrResponse};
use crate::notify::{Notification, NotificationPublisher};
use crate::rpc::{HandlerError, RequestHandler};

/// Runs OCR on the uploaded document and replies with the text.
pub struct OcrHandler {
    engine: Arc<dyn OcrEngine>,
    notifier: Option<(NotificationPublisher, String)>,
}

impl OcrHandler {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self {
            engine,
            notifier: None,
        }
    }

    /// Also email each result to the requesting user.
    pub fn with_notifications(
        mut self,
        publisher: NotificationPublisher,
        subject: impl Into<String>,
    ) -> Self {
        self.notifier = Some((publisher, subject.into()));
        self
    }

    async fn notify(&self, response: &OcrResponse) {
        let Some((publisher, subject)) = &self.notifier else {
            return;
        };
        if response.user_email.is_empty() {
            return;
        }

        let notification = Notification::new(
            response.user_email.as_str(),
            subject.as_str(),
            response.ocr_text.as_str(),
        );
        // The RPC reply does not depend on the email going out.
        if let Err(e) = publisher.publish(&notification).await {
            warn!(
                error = %e,
                user_id = %response.user_id,
                "Failed to publish OCR result notification"
            );
        }
    }
}

#[async_trait]
impl RequestHandler for OcrHandler {
    type Request = OcrRequest;
    type Response = OcrResponse;

    async fn handle(&self, request: OcrRequest) -> Result<OcrResponse, HandlerError> {
        let document = STANDARD
            .decode(request.file.as_bytes())
            .map_err(|e| HandlerError::InvalidRequest(format!("file is not valid base64: {e}")))?;

        let ocr_text = self.engine.recognize(&document).await.map_err(|e| match e {
            OcrError::InvalidInput(msg) => HandlerError::InvalidRequest(msg),
            other => HandlerError::Processing(other.to_string()),
        })?;

        info!(
            user_id = %request.user_id,
            bytes = document.len(),
            chars = ocr_text.len(),
            "OCR completed"
        );

        let response = OcrResponse {
            user_name: request.user_name,
            user_email: request.user_email,
            user_id: request.user_id,
            ocr_text,
        };
        self.notify(&response).await;
        Ok(response)
    }
}
