//! Dialog bridge between the messaging platform and the backend dialog API.
//!
//! For each user message the bridge finds (or creates) the backend dialog
//! for the chat, records the message, asks the backend for the assistant's
//! answer and sends the rendered answer back through the platform adapter.
//! Backend failures are reported to the user with the configured apology.

pub mod render;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, SecretRef};
use crate::error::WorkerError;
use crate::platform::{InboundMessage, InlineArticle, InlineQuery, PlatformAdapter, Sender};
use crate::reload::ContentProfile;
use crate::utils::{bot_command, truncate_str};

use render::{render_chunks, MAX_MESSAGE_CHARS};

// ---------------------------------------------------------------------------
// Backend HTTP client
// ---------------------------------------------------------------------------

/// Profile fields the backend stores on a dialog.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl From<&Sender> for UserInfo {
    fn from(s: &Sender) -> Self {
        Self {
            telegram_username: s.username.clone(),
            first_name: s.first_name.clone(),
            last_name: s.last_name.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NewDialog<'a> {
    pub user_id: &'a str,
    pub assistant_id: &'a str,
    pub telegram_chat_id: String,
    #[serde(flatten)]
    pub user: UserInfo,
}

#[derive(Debug, Serialize)]
pub struct AiRequest<'a> {
    pub user_id: &'a str,
    pub message: &'a str,
    pub assistant_id: &'a str,
    pub dialog_id: &'a str,
}

/// Thin client for the backend dialog/AI HTTP API.
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl BackendClient {
    pub fn new(cfg: &BackendConfig) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WorkerError::Setup(format!("backend HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.as_ref().and_then(SecretRef::resolve),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self.client.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    /// Send and decode the JSON body. A 404 yields `Ok(None)`.
    async fn send(&self, req: RequestBuilder, what: &str) -> Result<Option<Value>, WorkerError> {
        let resp = req
            .send()
            .await
            .map_err(|e| WorkerError::DialogBridge(format!("{what}: {}", e.without_url())))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(WorkerError::DialogBridge(format!(
                "{what} returned {status}: {}",
                truncate_str(&text, 200)
            )));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| WorkerError::DialogBridge(format!("{what}: {}", e.without_url())))?;
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| WorkerError::DialogBridge(format!("{what}: invalid JSON: {e}")))
    }

    /// Look up the dialog for a chat. Returns its id when one exists.
    pub async fn find_dialog(
        &self,
        user_id: &str,
        assistant_id: &str,
        chat_id: i64,
    ) -> Result<Option<String>, WorkerError> {
        let chat = chat_id.to_string();
        let req = self.request(Method::GET, "/dialogs").query(&[
            ("user_id", user_id),
            ("assistant_id", assistant_id),
            ("telegram_chat_id", chat.as_str()),
        ]);
        Ok(self
            .send(req, "dialog lookup")
            .await?
            .and_then(|body| first_dialog_id(&body)))
    }

    pub async fn create_dialog(&self, dialog: &NewDialog<'_>) -> Result<String, WorkerError> {
        let body = self
            .send(self.request(Method::POST, "/dialogs").json(dialog), "dialog create")
            .await?
            .unwrap_or(Value::Null);
        dialog_id(&body)
            .or_else(|| dialog_id(&body["dialog"]))
            .ok_or_else(|| WorkerError::DialogBridge("dialog create: response has no id".into()))
    }

    pub async fn update_user_info(&self, dialog_id: &str, info: &UserInfo) -> Result<(), WorkerError> {
        let path = format!("/dialogs/{dialog_id}/user-info");
        self.send(self.request(Method::PATCH, &path).json(info), "user info update")
            .await
            .map(|_| ())
    }

    /// Store a user message. `Ok(false)` means the dialog no longer exists.
    pub async fn post_message(&self, dialog_id: &str, text: &str) -> Result<bool, WorkerError> {
        let path = format!("/dialogs/{dialog_id}/messages");
        let body = serde_json::json!({ "sender": "user", "text": text });
        Ok(self
            .send(self.request(Method::POST, &path).json(&body), "message store")
            .await?
            .is_some())
    }

    pub async fn ai_response(&self, req: &AiRequest<'_>) -> Result<String, WorkerError> {
        let body = self
            .send(self.request(Method::POST, "/ai-response").json(req), "ai response")
            .await?
            .ok_or_else(|| WorkerError::DialogBridge("ai response: endpoint not found".into()))?;
        match body["response"].as_str() {
            Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
            _ => Err(WorkerError::DialogBridge("ai response: empty response".into())),
        }
    }
}

/// The lookup endpoint answers with a list, a `{dialogs: [...]}` wrapper,
/// or a single dialog object.
fn first_dialog_id(body: &Value) -> Option<String> {
    match body {
        Value::Array(items) => items.iter().find_map(dialog_id),
        Value::Object(map) => match map.get("dialogs") {
            Some(Value::Array(items)) => items.iter().find_map(dialog_id),
            Some(_) => None,
            None => dialog_id(body),
        },
        _ => None,
    }
}

fn dialog_id(v: &Value) -> Option<String> {
    match v.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Identity of the bot a reply is produced for, captured when the reply
/// task is spawned.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub tenant_id: String,
    pub content: ContentProfile,
}

/// Text the bridge should act on: user-authored text or caption.
pub fn message_text(msg: &InboundMessage) -> Option<&str> {
    if msg.sender.is_bot {
        return None;
    }
    msg.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
}

/// Upper bound on remembered chat → dialog mappings.
pub const MAX_CACHED_DIALOGS: usize = 5_000;

/// chat id → dialog id for the current assistant, least recently used
/// entries evicted first.
///
/// Every clear bumps `generation`; a lookup that started before a clear
/// must not repopulate the cache with a dialog of the old assistant.
#[derive(Debug)]
struct DialogCache {
    entries: HashMap<i64, (String, u64)>,
    capacity: usize,
    tick: u64,
    generation: u64,
}

impl DialogCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
            generation: 0,
        }
    }

    fn get(&mut self, chat_id: i64) -> Option<String> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&chat_id).map(|(id, used)| {
            *used = tick;
            id.clone()
        })
    }

    fn insert(&mut self, generation: u64, chat_id: i64, dialog_id: String) {
        if generation != self.generation {
            return;
        }
        if !self.entries.contains_key(&chat_id) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(chat, _)| *chat);
            if let Some(chat) = oldest {
                self.entries.remove(&chat);
            }
        }
        self.tick += 1;
        self.entries.insert(chat_id, (dialog_id, self.tick));
    }

    fn remove(&mut self, chat_id: i64, dialog_id: &str) {
        if self.entries.get(&chat_id).is_some_and(|(id, _)| id == dialog_id) {
            self.entries.remove(&chat_id);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.generation += 1;
    }
}

/// Cheap to clone; clones share the dialog cache.
#[derive(Clone)]
pub struct DialogBridge {
    backend: BackendClient,
    dialogs: Arc<Mutex<DialogCache>>,
}

impl DialogBridge {
    pub fn new(backend: BackendClient) -> Self {
        Self::with_capacity(backend, MAX_CACHED_DIALOGS)
    }

    pub fn with_capacity(backend: BackendClient, capacity: usize) -> Self {
        Self {
            backend,
            dialogs: Arc::new(Mutex::new(DialogCache::new(capacity))),
        }
    }

    /// Forget cached dialogs; they belong to the previous assistant.
    pub async fn clear_dialogs(&self) {
        self.dialogs.lock().await.clear();
    }

    pub async fn cached_dialogs(&self) -> usize {
        self.dialogs.lock().await.entries.len()
    }

    /// Answer one user message.
    pub async fn handle_message(
        &self,
        adapter: &dyn PlatformAdapter,
        ctx: &ReplyContext,
        msg: &InboundMessage,
    ) -> Result<(), WorkerError> {
        let Some(text) = message_text(msg) else {
            return Ok(());
        };

        if bot_command(text) == Some("start") {
            let welcome = welcome_text(&ctx.content);
            adapter
                .send_message(msg.chat_id, &render::markdown_to_html(&welcome))
                .await?;
            info!(chat_id = msg.chat_id, "welcome sent");
            return Ok(());
        }

        if ctx.content.replies.typing_indicator {
            if let Err(e) = adapter.send_typing(msg.chat_id).await {
                debug!(chat_id = msg.chat_id, error = %e, "typing indicator failed");
            }
        }

        let reply = match self.converse(ctx, msg.chat_id, &msg.sender, text).await {
            Ok(reply) => reply,
            Err(e) => {
                let apology = render::escape_html(&ctx.content.replies.error_message);
                if let Err(send_err) = adapter.send_message(msg.chat_id, &apology).await {
                    warn!(chat_id = msg.chat_id, error = %send_err, "apology send failed");
                }
                return Err(e);
            }
        };

        let chunks = render_chunks(&reply, MAX_MESSAGE_CHARS);
        for chunk in &chunks {
            adapter.send_message(msg.chat_id, chunk).await?;
        }
        info!(
            chat_id = msg.chat_id,
            chunks = chunks.len(),
            reply_len = reply.len(),
            "reply sent"
        );
        Ok(())
    }

    /// Answer an inline query with a single article built from the AI reply.
    pub async fn handle_inline_query(
        &self,
        adapter: &dyn PlatformAdapter,
        ctx: &ReplyContext,
        query: &InlineQuery,
    ) -> Result<(), WorkerError> {
        let text = query.query.trim();
        if text.is_empty() || query.sender.is_bot {
            adapter.answer_inline_query(&query.id, &[]).await?;
            return Ok(());
        }

        // Inline queries have no chat; the user's private chat id is their user id.
        let reply = self.converse(ctx, query.sender.id, &query.sender, text).await?;
        let message_html = render_chunks(&reply, MAX_MESSAGE_CHARS)
            .into_iter()
            .next()
            .unwrap_or_default();
        let title = if ctx.content.assistant.name.is_empty() {
            "Answer".to_string()
        } else {
            ctx.content.assistant.name.clone()
        };
        let article = InlineArticle {
            id: format!("{}-0", query.id),
            title,
            description: Some(truncate_str(reply.trim(), 100)),
            message_html,
        };
        adapter.answer_inline_query(&query.id, &[article]).await?;
        debug!(query_id = %query.id, "inline query answered");
        Ok(())
    }

    async fn converse(
        &self,
        ctx: &ReplyContext,
        chat_id: i64,
        sender: &Sender,
        text: &str,
    ) -> Result<String, WorkerError> {
        let assistant_id = ctx.content.assistant.id.as_str();
        let mut dialog_id = self.resolve_dialog(ctx, chat_id, sender).await?;
        if !self.backend.post_message(&dialog_id, text).await? {
            // Deleted on the backend since it was cached; look it up afresh once.
            warn!(dialog_id = %dialog_id, chat_id, "cached dialog is gone");
            self.dialogs.lock().await.remove(chat_id, &dialog_id);
            dialog_id = self.resolve_dialog(ctx, chat_id, sender).await?;
            if !self.backend.post_message(&dialog_id, text).await? {
                return Err(WorkerError::DialogBridge(format!(
                    "message store: dialog {dialog_id} not found"
                )));
            }
        }
        self.backend
            .ai_response(&AiRequest {
                user_id: &ctx.tenant_id,
                message: text,
                assistant_id,
                dialog_id: &dialog_id,
            })
            .await
    }

    async fn resolve_dialog(
        &self,
        ctx: &ReplyContext,
        chat_id: i64,
        sender: &Sender,
    ) -> Result<String, WorkerError> {
        let generation = {
            let mut cache = self.dialogs.lock().await;
            if let Some(id) = cache.get(chat_id) {
                return Ok(id);
            }
            cache.generation
        };

        let assistant_id = ctx.content.assistant.id.as_str();
        let info = UserInfo::from(sender);
        let id = match self
            .backend
            .find_dialog(&ctx.tenant_id, assistant_id, chat_id)
            .await?
        {
            Some(id) => {
                if let Err(e) = self.backend.update_user_info(&id, &info).await {
                    warn!(dialog_id = %id, error = %e, "user info update failed");
                }
                id
            }
            None => {
                let id = self
                    .backend
                    .create_dialog(&NewDialog {
                        user_id: &ctx.tenant_id,
                        assistant_id,
                        telegram_chat_id: chat_id.to_string(),
                        user: info,
                    })
                    .await?;
                info!(dialog_id = %id, chat_id, "dialog created");
                id
            }
        };

        self.dialogs
            .lock()
            .await
            .insert(generation, chat_id, id.clone());
        Ok(id)
    }
}

fn welcome_text(content: &ContentProfile) -> String {
    let name = if content.assistant.name.is_empty() {
        "your assistant"
    } else {
        content.assistant.name.as_str()
    };
    match &content.replies.welcome_message {
        Some(custom) if !custom.trim().is_empty() => custom.replace("{name}", name),
        _ => format!("Hello! I'm {name}. How can I help you today?"),
    }
}
