//! Telegram Bot API adapter over `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    with_retry, with_retry_when, AdapterFactory, BotIdentity, InboundMessage, InboundUpdate,
    InlineArticle, InlineQuery, PlatformAdapter, PollEvent, PollHandle, RetryPolicy, Sender,
    WebhookInfo, WebhookRegistration,
};
use crate::config::{default_allowed_updates, BotCredential, Config, Platform};
use crate::error::PlatformError;

/// Upper bound for the poll loop's backoff after consecutive failures.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<TgResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct TgResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl From<TgUser> for Sender {
    fn from(u: TgUser) -> Self {
        Sender {
            id: u.id,
            is_bot: u.is_bot,
            username: u.username,
            first_name: u.first_name,
            last_name: u.last_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    chat: TgChat,
    #[serde(default)]
    from: Option<TgUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgInlineQuery {
    id: String,
    from: TgUser,
    #[serde(default)]
    query: String,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    inline_query: Option<TgInlineQuery>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TgWebhookInfo {
    #[serde(default)]
    url: String,
    #[serde(default)]
    pending_update_count: u64,
    #[serde(default)]
    last_error_message: Option<String>,
}

/// Normalise a raw Telegram `Update` object.
pub fn parse_update(raw: serde_json::Value) -> Result<InboundUpdate, PlatformError> {
    let update: TgUpdate =
        serde_json::from_value(raw).map_err(|e| PlatformError::Decode(e.to_string()))?;

    if let Some(msg) = update.message {
        let sender = msg.from.map(Sender::from).unwrap_or_else(|| Sender {
            // Channel posts forwarded as messages carry no author.
            id: msg.chat.id,
            ..Sender::default()
        });
        return Ok(InboundUpdate::Message(InboundMessage {
            update_id: update.update_id,
            chat_id: msg.chat.id,
            message_id: msg.message_id,
            sender,
            text: msg.text.or(msg.caption),
        }));
    }

    if let Some(q) = update.inline_query {
        return Ok(InboundUpdate::InlineQuery(InlineQuery {
            update_id: update.update_id,
            id: q.id,
            sender: q.from.into(),
            query: q.query,
        }));
    }

    let kind = update
        .rest
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());
    Ok(InboundUpdate::Ignored {
        update_id: update.update_id,
        kind,
    })
}

/// Map an unsuccessful API response onto the error taxonomy.
fn classify(status: u16, description: String, retry_after: Option<u64>) -> PlatformError {
    match status {
        401 | 404 => PlatformError::Auth(description),
        409 => PlatformError::Conflict(description),
        429 => PlatformError::Transient {
            message: description,
            retry_after,
        },
        s if s >= 500 => PlatformError::Transient {
            message: format!("{s}: {description}"),
            retry_after,
        },
        code => PlatformError::Api { code, description },
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Telegram client bound to a single bot token.
#[derive(Clone)]
pub struct TelegramAdapter {
    client: Client,
    /// `<api_base>/bot<token>`; never logged.
    base_url: String,
    retry: RetryPolicy,
    poll_timeout: Duration,
    allowed_updates: Vec<String>,
}

impl TelegramAdapter {
    pub fn new(
        api_base: &str,
        token: &str,
        retry: RetryPolicy,
        poll_timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PlatformError::transient(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
            retry,
            poll_timeout,
            allowed_updates: default_allowed_updates(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, PlatformError> {
        self.call_with_timeout(method, body, None).await
    }

    async fn call_with_timeout<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<T, PlatformError> {
        let mut req = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        // `without_url` keeps the token out of error messages.
        let resp = req
            .send()
            .await
            .map_err(|e| PlatformError::from(e.without_url()))?;
        let status = resp.status();

        let envelope: TgResponse<T> = match resp.json().await {
            Ok(env) => env,
            Err(_) if status.is_server_error() => {
                return Err(PlatformError::transient(format!("{method}: HTTP {status}")));
            }
            Err(e) => return Err(PlatformError::Decode(format!("{method}: {}", e.without_url()))),
        };

        if envelope.ok {
            return envelope
                .result
                .ok_or_else(|| PlatformError::Decode(format!("{method}: missing result")));
        }

        let code = envelope.error_code.unwrap_or(status.as_u16());
        let description = envelope
            .description
            .unwrap_or_else(|| format!("{method} failed"));
        let retry_after = envelope.parameters.and_then(|p| p.retry_after);
        Err(classify(code, description, retry_after))
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
        limit: u32,
    ) -> Result<Vec<serde_json::Value>, PlatformError> {
        let mut body = json!({
            "timeout": timeout_secs,
            "limit": limit,
            "allowed_updates": self.allowed_updates,
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call_with_timeout(
            "getUpdates",
            &body,
            Some(Duration::from_secs(timeout_secs + 10)),
        )
        .await
    }

    async fn poll_loop(self, events: mpsc::Sender<PollEvent>, cancel: CancellationToken) {
        let mut offset: Option<i64> = None;
        let mut failures: u32 = 0;
        let timeout_secs = self.poll_timeout.as_secs();

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.get_updates(offset, timeout_secs, 100) => r,
            };

            match result {
                Ok(batch) => {
                    failures = 0;
                    for raw in batch {
                        let update_id = raw.get("update_id").and_then(|v| v.as_i64());
                        if let Some(id) = update_id {
                            offset = Some(id + 1);
                        }
                        let event = match parse_update(raw) {
                            Ok(update) => PollEvent::Update(update),
                            Err(e) => PollEvent::Error(format!("undecodable update: {e}")),
                        };
                        if events.send(event).await.is_err() {
                            debug!("poll consumer gone, stopping loop");
                            return;
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = match &e {
                        PlatformError::Transient {
                            retry_after: Some(secs),
                            ..
                        } => Duration::from_secs(*secs),
                        _ => (self.retry.base_delay * 2u32.saturating_pow(failures))
                            .min(MAX_POLL_BACKOFF),
                    };
                    if events.send(PollEvent::Error(e.to_string())).await.is_err() {
                        return;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!("telegram poll loop stopped");
    }
}

#[async_trait]
impl PlatformAdapter for TelegramAdapter {
    async fn validate(&self) -> Result<BotIdentity, PlatformError> {
        let body = json!({});
        let body = &body;
        let me: TgUser =
            with_retry(self.retry, "getMe", move || self.call("getMe", body)).await?;
        Ok(BotIdentity {
            id: me.id,
            username: me.username,
            first_name: me.first_name.unwrap_or_default(),
        })
    }

    async fn register_webhook(
        &self,
        registration: &WebhookRegistration,
    ) -> Result<(), PlatformError> {
        let body = serde_json::to_value(registration)
            .map_err(|e| PlatformError::Decode(e.to_string()))?;
        let body = &body;
        let _: bool =
            with_retry(self.retry, "setWebhook", move || self.call("setWebhook", body)).await?;
        info!("telegram webhook registered");
        Ok(())
    }

    async fn clear_webhook(&self) -> Result<(), PlatformError> {
        let body = json!({ "drop_pending_updates": false });
        let body = &body;
        let _: bool =
            with_retry(self.retry, "deleteWebhook", move || self.call("deleteWebhook", body))
                .await?;
        Ok(())
    }

    async fn webhook_info(&self) -> Result<WebhookInfo, PlatformError> {
        let body = json!({});
        let body = &body;
        let info: TgWebhookInfo = with_retry(self.retry, "getWebhookInfo", move || {
            self.call("getWebhookInfo", body)
        })
        .await?;
        Ok(WebhookInfo {
            url: info.url,
            pending_update_count: info.pending_update_count,
            last_error_message: info.last_error_message,
        })
    }

    async fn start_polling(
        &self,
        events: mpsc::Sender<PollEvent>,
    ) -> Result<PollHandle, PlatformError> {
        // Zero-timeout probe without an offset, so nothing is acknowledged.
        // A competing consumer or a lingering webhook answers 409 here.
        self.get_updates(None, 0, 1).await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().poll_loop(events, cancel.clone()));
        info!("telegram poll loop running");
        Ok(PollHandle { cancel, task })
    }

    async fn stop_polling(&self, handle: PollHandle) -> Result<(), PlatformError> {
        handle.cancel.cancel();
        handle
            .task
            .await
            .map_err(|e| PlatformError::transient(format!("poll task ended abnormally: {e}")))
    }

    async fn send_message(&self, chat_id: i64, html: &str) -> Result<(), PlatformError> {
        let body = json!({
            "chat_id": chat_id,
            "text": html,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let body = &body;
        // A failed or timed-out send may still have been delivered; only an
        // explicit rate-limit refusal is safe to repeat.
        let _: serde_json::Value = with_retry_when(
            self.retry,
            "sendMessage",
            PlatformError::is_rate_limited,
            move || self.call("sendMessage", body),
        )
        .await?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), PlatformError> {
        let body = json!({ "chat_id": chat_id, "action": "typing" });
        let _: bool = self.call("sendChatAction", &body).await?;
        Ok(())
    }

    async fn answer_inline_query(
        &self,
        query_id: &str,
        results: &[InlineArticle],
    ) -> Result<(), PlatformError> {
        let results: Vec<serde_json::Value> = results
            .iter()
            .map(|a| {
                json!({
                    "type": "article",
                    "id": a.id,
                    "title": a.title,
                    "description": a.description,
                    "input_message_content": {
                        "message_text": a.message_html,
                        "parse_mode": "HTML",
                    },
                })
            })
            .collect();
        let body = json!({
            "inline_query_id": query_id,
            "results": results,
            "cache_time": 0,
            "is_personal": true,
        });
        let body = &body;
        let _: bool = with_retry(self.retry, "answerInlineQuery", move || {
            self.call("answerInlineQuery", body)
        })
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds a fresh [`TelegramAdapter`] (with its own connection pool) per call.
pub struct TelegramFactory {
    api_base: String,
    retry: RetryPolicy,
    poll_timeout: Duration,
}

impl TelegramFactory {
    pub fn new(cfg: &Config) -> Self {
        Self {
            api_base: cfg.telegram.api_base.clone(),
            retry: RetryPolicy::from_config(&cfg.retry),
            poll_timeout: Duration::from_secs(cfg.telegram.poll_timeout_secs),
        }
    }
}

impl AdapterFactory for TelegramFactory {
    fn connect(
        &self,
        credential: &BotCredential,
    ) -> Result<Arc<dyn PlatformAdapter>, PlatformError> {
        match credential.platform {
            Platform::Telegram => {
                let adapter = TelegramAdapter::new(
                    &self.api_base,
                    &credential.token,
                    self.retry,
                    self.poll_timeout,
                )?;
                Ok(Arc::new(adapter))
            }
        }
    }
}
