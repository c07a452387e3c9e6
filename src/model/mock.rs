//! Scripted mock model client for tests.
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ModelClient, ModelError, ModelRequest, ModelResponse};

/// A mock client that replays a scripted queue of responses.
///
/// When the queue is empty it echoes the prompt, so unscripted calls stay
/// deterministic instead of failing.
pub struct MockModel {
    script: Mutex<VecDeque<Result<String, ModelError>>>,
    calls: Mutex<Vec<ModelRequest>>,
}

impl MockModel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful response.
    pub fn push_ok(&self, text: &str) {
        self.script.lock().unwrap().push_back(Ok(text.to_string()));
    }

    /// Queue a failure.
    pub fn push_err(&self, err: ModelError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Number of completions attempted so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.calls.lock().unwrap().push(request.clone());

        let scripted = self.script.lock().unwrap().pop_front();
        let text = match scripted {
            Some(Ok(text)) => text,
            Some(Err(err)) => return Err(err),
            None => format!("echo: {}", request.prompt),
        };

        Ok(ModelResponse {
            prompt_tokens: (request.system.len() + request.prompt.len()) / 4,
            completion_tokens: text.len() / 4,
            model: request.model,
            text,
        })
    }
}
