//! Mock search source for testing.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{PaperSource, SearchQuery, SourceError};
use crate::PaperStub;

/// A configurable mock reply for [`MockSource`].
#[derive(Clone, Debug)]
pub enum SourceReply {
    Found(Vec<PaperStub>),
    RateLimited { retry_after: Option<Duration> },
    Error(String),
}

/// Mock implementing [`PaperSource`] with a fixed reply or a sequence of
/// replies (one per call, repeating the last when exhausted), plus call
/// counting.
pub struct MockSource {
    name: &'static str,
    replies: Mutex<Vec<SourceReply>>,
    fallback: SourceReply,
    call_count: AtomicUsize,
}

impl MockSource {
    pub fn new(name: &'static str, reply: SourceReply) -> Self {
        Self {
            name,
            replies: Mutex::new(Vec::new()),
            fallback: reply,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn with_sequence(name: &'static str, mut replies: Vec<SourceReply>) -> Self {
        assert!(!replies.is_empty(), "sequence must have at least one reply");
        // Reverse so we can pop() from the front cheaply.
        replies.reverse();
        let fallback = replies.first().cloned().unwrap();
        Self {
            name,
            replies: Mutex::new(replies),
            fallback,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> SourceReply {
        let mut seq = self.replies.lock().unwrap();
        seq.pop().unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl PaperSource for MockSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn search(
        &self,
        _query: &SearchQuery,
        _client: &reqwest::Client,
        _timeout: Duration,
    ) -> Result<Vec<PaperStub>, SourceError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        match self.next_reply() {
            SourceReply::Found(stubs) => Ok(stubs),
            SourceReply::RateLimited { retry_after } => {
                Err(SourceError::RateLimited { retry_after })
            }
            SourceReply::Error(msg) => Err(SourceError::Malformed(msg)),
        }
    }
}
