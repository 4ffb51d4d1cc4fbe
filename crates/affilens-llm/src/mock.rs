//! Mock backend for testing.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::{LlmBackend, LlmError, LlmRequest, LlmResponse};

/// A configurable mock reply for [`MockBackend`].
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub enum MockReply {
    /// Return this content verbatim.
    Content(String),
    /// Simulate a 429.
    RateLimited { retry_after: Option<Duration> },
    /// Simulate an API error.
    Error { status: u16, message: String },
}

/// A hand-rolled mock implementing [`LlmBackend`] for tests.
///
/// Supports a fixed reply or a sequence of replies (one per call, repeating
/// the last when exhausted), optional per-call latency, and call counting.
pub struct MockBackend {
    /// If non-empty, each call pops the next reply.
    replies: Mutex<Vec<MockReply>>,
    fallback: MockReply,
    delay: Option<Duration>,
    call_count: AtomicUsize,
}

impl MockBackend {
    /// Create a mock that always returns `reply`.
    pub fn new(reply: MockReply) -> Self {
        Self {
            replies: Mutex::new(Vec::new()),
            fallback: reply,
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Create a mock that returns replies in order, repeating the last one.
    pub fn with_sequence(mut replies: Vec<MockReply>) -> Self {
        assert!(!replies.is_empty(), "sequence must have at least one reply");
        // Reverse so we can pop() from the front cheaply.
        replies.reverse();
        let fallback = replies.first().cloned().unwrap();
        Self {
            replies: Mutex::new(replies),
            fallback,
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Set simulated latency per call.
    #[allow(dead_code)]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times `complete()` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> MockReply {
        let mut seq = self.replies.lock().unwrap();
        seq.pop().unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn complete(&self, _req: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }

        match self.next_reply() {
            MockReply::Content(content) => Ok(LlmResponse {
                content,
                model: "mock".into(),
                prompt_tokens: 0,
                completion_tokens: 0,
            }),
            MockReply::RateLimited { retry_after } => Err(LlmError::RateLimited { retry_after }),
            MockReply::Error { status, message } => Err(LlmError::Api { status, message }),
        }
    }

    fn model_id(&self) -> &str {
        "mock"
    }
}
