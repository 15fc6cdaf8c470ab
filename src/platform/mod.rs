//! Messaging-platform boundary.
//!
//! The worker reaches the platform only through [`PlatformAdapter`], a narrow
//! request/response interface.  Adapters are built per credential by an
//! [`AdapterFactory`], which lets the connection manager create a throwaway
//! client for cleanup/validation and a separate persistent one, and lets
//! tests substitute fakes.

pub mod telegram;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{BotCredential, RetryConfig};
use crate::error::PlatformError;

// ---------------------------------------------------------------------------
// Normalised platform types
// ---------------------------------------------------------------------------

/// Identity of the bot account behind a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotIdentity {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: String,
}

/// Webhook registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookRegistration {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    pub allowed_updates: Vec<String>,
}

/// Registration state as reported by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookInfo {
    /// Empty when no webhook is registered.
    pub url: String,
    pub pending_update_count: u64,
    pub last_error_message: Option<String>,
}

/// Author of an inbound event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    pub id: i64,
    pub is_bot: bool,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub update_id: i64,
    pub chat_id: i64,
    pub message_id: i64,
    pub sender: Sender,
    /// Message text, or the caption of a media message.
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineQuery {
    pub update_id: i64,
    pub id: String,
    pub sender: Sender,
    pub query: String,
}

/// One inbound platform event after normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundUpdate {
    Message(InboundMessage),
    InlineQuery(InlineQuery),
    /// Update kinds the worker does not handle.
    Ignored { update_id: i64, kind: String },
}

/// Item produced by a running poll loop.
#[derive(Debug, Clone)]
pub enum PollEvent {
    Update(InboundUpdate),
    /// A loop iteration failed; the loop keeps going.
    Error(String),
}

/// A single inline-query answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineArticle {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    /// HTML-formatted message text sent when the user picks the article.
    pub message_html: String,
}

/// Handle to a running poll loop.
pub struct PollHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Adapter traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PlatformAdapter: Send + Sync + 'static {
    /// Fetch the bot identity; fails with [`PlatformError::Auth`] for a bad credential.
    async fn validate(&self) -> Result<BotIdentity, PlatformError>;

    async fn register_webhook(&self, registration: &WebhookRegistration)
        -> Result<(), PlatformError>;

    /// Remove any registered webhook. Succeeds when none is registered.
    async fn clear_webhook(&self) -> Result<(), PlatformError>;

    async fn webhook_info(&self) -> Result<WebhookInfo, PlatformError>;

    /// Start the receive loop. Returns only once the platform accepted a
    /// probe request, so a conflicting subscription fails here.
    async fn start_polling(
        &self,
        events: mpsc::Sender<PollEvent>,
    ) -> Result<PollHandle, PlatformError>;

    /// Request loop cancellation and wait for the loop to exit.
    async fn stop_polling(&self, handle: PollHandle) -> Result<(), PlatformError>;

    /// Send HTML-formatted text to a chat. Long text may be split.
    async fn send_message(&self, chat_id: i64, html: &str) -> Result<(), PlatformError>;

    async fn send_typing(&self, chat_id: i64) -> Result<(), PlatformError>;

    async fn answer_inline_query(
        &self,
        query_id: &str,
        results: &[InlineArticle],
    ) -> Result<(), PlatformError>;

    /// Release client-side resources. Best-effort.
    async fn close(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Builds adapters bound to a credential.
pub trait AdapterFactory: Send + Sync + 'static {
    fn connect(&self, credential: &BotCredential) -> Result<Arc<dyn PlatformAdapter>, PlatformError>;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Exponential backoff for transient platform failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
        }
    }

    /// Delay before the retry following failed attempt `attempt` (0-based).
    /// A platform-supplied `retry_after` takes precedence.
    pub fn delay_for(&self, attempt: usize, err: &PlatformError) -> Duration {
        if let PlatformError::Transient {
            retry_after: Some(secs),
            ..
        } = err
        {
            return Duration::from_secs(*secs);
        }
        self.base_delay * 2u32.saturating_pow(attempt as u32)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Only [`PlatformError::Transient`] failures are retried.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    op: F,
) -> Result<T, PlatformError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    with_retry_when(policy, operation, PlatformError::is_transient, op).await
}

/// Like [`with_retry`], but only failures matching `retryable` are repeated.
pub async fn with_retry_when<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    retryable: fn(&PlatformError) -> bool,
    mut op: F,
) -> Result<T, PlatformError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if retryable(&e) && attempt + 1 < attempts => {
                let delay = policy.delay_for(attempt, &e);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "platform call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
