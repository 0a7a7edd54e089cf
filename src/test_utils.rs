//! Test utilities and mock implementations.
//!
//! Doubles for the processing and delivery collaborators, so tests can run
//! against the in-memory broker without an OCR program or a mail relay.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::notify::{MailTransport, TransportError};
use crate::ocr::{OcrEngine, OcrError};

/// A delivered notification as seen by a mock transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Mail transport that fails its first `failures` deliveries, then records
/// every delivery.
#[derive(Default)]
pub struct MockTransport {
    failures: AtomicUsize,
    attempts: AtomicUsize,
    sent: Mutex<Vec<SentMail>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `failures` deliveries with `Unavailable`.
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    /// Total delivery attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn deliver(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::Unavailable("simulated relay timeout".to_string()));
        }

        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(SentMail {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// OCR engine that always fails.
#[derive(Debug, Default)]
pub struct FailingEngine {
    calls: AtomicUsize,
}

impl FailingEngine {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for FailingEngine {
    async fn recognize(&self, _document: &[u8]) -> Result<String, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(OcrError::Engine("simulated engine crash".to_string()))
    }
}

/// OCR engine that waits before echoing the document as text.
#[derive(Debug)]
pub struct DelayedEngine {
    delay: Duration,
}

impl DelayedEngine {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl OcrEngine for DelayedEngine {
    async fn recognize(&self, document: &[u8]) -> Result<String, OcrError> {
        tokio::time::sleep(self.delay).await;
        Ok(String::from_utf8_lossy(document).into_owned())
    }
}
