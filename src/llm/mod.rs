pub mod openai;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub use openai::{LlmClient, LlmConfig};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing inference credentials")]
    MissingCredentials,
    #[error("rate limited by inference service")]
    RateLimited { retry_after: Option<Duration> },
    #[error("inference service busy: HTTP {0}")]
    Busy(u16),
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Rate-limit and overload signals; everything else is a plain failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::Busy(_))
    }

    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => LlmError::RateLimited { retry_after },
            500 | 502 | 503 | 504 | 529 => LlmError::Busy(status),
            other => LlmError::Http(format!("HTTP {other}")),
        }
    }
}

/// One text instruction followed by base64 image data URLs.
#[derive(Debug, Clone, Serialize)]
pub struct MultimodalRequest {
    pub instruction: String,
    pub image_data_urls: Vec<String>,
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Returns the model's raw reply text.
    async fn complete(&self, request: &MultimodalRequest) -> Result<String, LlmError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    /// Replays scripted replies in order; the last one repeats.
    pub struct ScriptedService {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        pub calls: AtomicUsize,
        pub last_request: Mutex<Option<MultimodalRequest>>,
    }

    impl ScriptedService {
        pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        pub fn always(reply: &str) -> Self {
            Self::new(vec![Ok(reply.to_string())])
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn replay(reply: &Result<String, LlmError>) -> Result<String, LlmError> {
        match reply {
            Ok(text) => Ok(text.clone()),
            Err(LlmError::RateLimited { retry_after }) => Err(LlmError::RateLimited {
                retry_after: *retry_after,
            }),
            Err(LlmError::Busy(code)) => Err(LlmError::Busy(*code)),
            Err(LlmError::Http(msg)) => Err(LlmError::Http(msg.clone())),
            Err(LlmError::InvalidResponse(msg)) => Err(LlmError::InvalidResponse(msg.clone())),
            Err(LlmError::MissingCredentials) => Err(LlmError::MissingCredentials),
        }
    }

    #[async_trait]
    impl InferenceService for ScriptedService {
        async fn complete(&self, request: &MultimodalRequest) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                let next = replies.remove(0);
                replay(&next)
            } else {
                replies
                    .first()
                    .map(replay)
                    .unwrap_or_else(|| Err(LlmError::Http("no scripted reply".into())))
            }
        }
    }
}
