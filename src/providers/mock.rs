//! Scripted completion provider for tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::conversation::Message;

use super::{CompletionProvider, ProviderError};

/// Replays scripted replies and titles in order. When a queue runs out it
/// falls back to a canned reply, so tests only script what they assert on.
pub struct MockProvider {
    replies: Mutex<VecDeque<Result<String, String>>>,
    titles: Mutex<VecDeque<Result<String, String>>>,
    delay: Option<Duration>,
    complete_calls: AtomicUsize,
    title_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            titles: Mutex::new(VecDeque::new()),
            delay: None,
            complete_calls: AtomicUsize::new(0),
            title_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_reply(self, reply: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(Ok(reply.to_string()));
        self
    }

    pub fn with_failing_reply(self, message: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn with_title(self, title: &str) -> Self {
        self.titles.lock().unwrap().push_back(Ok(title.to_string()));
        self
    }

    pub fn with_failing_title(self, message: &str) -> Self {
        self.titles
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }

    /// Delay every completion, for tests that race a send against a
    /// conversation switch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn title_calls(&self) -> usize {
        self.title_calls.load(Ordering::SeqCst)
    }

    fn next(queue: &Mutex<VecDeque<Result<String, String>>>, fallback: &str) -> Result<String, ProviderError> {
        match queue.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(ProviderError::InvalidResponse(message)),
            None => Ok(fallback.to_string()),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    async fn complete(&self, _messages: &[Message]) -> Result<String, ProviderError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Self::next(&self.replies, "Mock reply")
    }

    async fn synthesize_title(&self, _first_message: &str) -> Result<String, ProviderError> {
        self.title_calls.fetch_add(1, Ordering::SeqCst);
        Self::next(&self.titles, "Mock title")
    }
}
