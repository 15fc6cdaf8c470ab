//! Shared fixtures: a scripted in-memory platform adapter and a harness
//! that runs a `Worker` on in-process channels.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_worker::config::{BotCredential, Config, Timings};
use relay_worker::control::{EventSink, OutboundEvent, RawCommand};
use relay_worker::error::PlatformError;
use relay_worker::platform::{
    AdapterFactory, BotIdentity, InboundMessage, InboundUpdate, InlineArticle, PlatformAdapter,
    PollEvent, PollHandle, Sender, WebhookInfo, WebhookRegistration,
};
use relay_worker::worker::Worker;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fake platform
// ---------------------------------------------------------------------------

/// Everything the fake adapters did, plus knobs to make them misbehave.
#[derive(Default)]
pub struct Recorder {
    pub calls: Mutex<Vec<&'static str>>,
    pub sent: Mutex<Vec<(i64, String)>>,
    pub inline_answers: Mutex<Vec<(String, Vec<InlineArticle>)>>,
    pub registered: Mutex<Option<WebhookRegistration>>,
    pub poll_tx: Mutex<Option<mpsc::Sender<PollEvent>>>,

    pub fail_validate: AtomicBool,
    pub fail_clear: AtomicBool,
    pub fail_close: AtomicBool,
    pub hang_stop_polling: AtomicBool,
    pub poll_start_failures: AtomicUsize,
    pub webhook_info_url: Mutex<Option<String>>,
}

impl Recorder {
    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Push an update into the running poll loop.
    pub async fn inject(&self, update: InboundUpdate) {
        let tx = self
            .poll_tx
            .lock()
            .unwrap()
            .clone()
            .expect("polling is not running");
        tx.send(PollEvent::Update(update)).await.unwrap();
    }
}

pub struct FakeAdapter {
    rec: Arc<Recorder>,
}

#[async_trait]
impl PlatformAdapter for FakeAdapter {
    async fn validate(&self) -> Result<BotIdentity, PlatformError> {
        self.rec.record("validate");
        if self.rec.fail_validate.load(Ordering::SeqCst) {
            return Err(PlatformError::Auth("Unauthorized".into()));
        }
        Ok(BotIdentity {
            id: 4242,
            username: Some("ava_bot".into()),
            first_name: "Ava".into(),
        })
    }

    async fn register_webhook(
        &self,
        registration: &WebhookRegistration,
    ) -> Result<(), PlatformError> {
        self.rec.record("register_webhook");
        *self.rec.registered.lock().unwrap() = Some(registration.clone());
        Ok(())
    }

    async fn clear_webhook(&self) -> Result<(), PlatformError> {
        self.rec.record("clear_webhook");
        if self.rec.fail_clear.load(Ordering::SeqCst) {
            return Err(PlatformError::transient("connection reset"));
        }
        Ok(())
    }

    async fn webhook_info(&self) -> Result<WebhookInfo, PlatformError> {
        self.rec.record("webhook_info");
        let url = match self.rec.webhook_info_url.lock().unwrap().clone() {
            Some(url) => url,
            None => self
                .rec
                .registered
                .lock()
                .unwrap()
                .as_ref()
                .map(|r| r.url.clone())
                .unwrap_or_default(),
        };
        Ok(WebhookInfo {
            url,
            ..WebhookInfo::default()
        })
    }

    async fn start_polling(
        &self,
        events: mpsc::Sender<PollEvent>,
    ) -> Result<PollHandle, PlatformError> {
        self.rec.record("start_polling");
        let left = self.rec.poll_start_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.rec.poll_start_failures.store(left - 1, Ordering::SeqCst);
            return Err(PlatformError::transient("Bad Gateway"));
        }
        *self.rec.poll_tx.lock().unwrap() = Some(events);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { token.cancelled().await });
        Ok(PollHandle { cancel, task })
    }

    async fn stop_polling(&self, handle: PollHandle) -> Result<(), PlatformError> {
        self.rec.record("stop_polling");
        self.rec.poll_tx.lock().unwrap().take();
        if self.rec.hang_stop_polling.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        handle.cancel.cancel();
        handle
            .task
            .await
            .map_err(|e| PlatformError::transient(e.to_string()))
    }

    async fn send_message(&self, chat_id: i64, html: &str) -> Result<(), PlatformError> {
        self.rec.record("send_message");
        self.rec.sent.lock().unwrap().push((chat_id, html.to_string()));
        Ok(())
    }

    async fn send_typing(&self, _chat_id: i64) -> Result<(), PlatformError> {
        self.rec.record("send_typing");
        Ok(())
    }

    async fn answer_inline_query(
        &self,
        query_id: &str,
        results: &[InlineArticle],
    ) -> Result<(), PlatformError> {
        self.rec.record("answer_inline_query");
        self.rec
            .inline_answers
            .lock()
            .unwrap()
            .push((query_id.to_string(), results.to_vec()));
        Ok(())
    }

    async fn close(&self) -> Result<(), PlatformError> {
        self.rec.record("close");
        if self.rec.fail_close.load(Ordering::SeqCst) {
            return Err(PlatformError::transient("close failed"));
        }
        Ok(())
    }
}

pub struct FakeFactory {
    pub rec: Arc<Recorder>,
}

impl AdapterFactory for FakeFactory {
    fn connect(
        &self,
        _credential: &BotCredential,
    ) -> Result<Arc<dyn PlatformAdapter>, PlatformError> {
        self.rec.record("connect");
        Ok(Arc::new(FakeAdapter {
            rec: self.rec.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Worker harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub commands: mpsc::Sender<RawCommand>,
    pub events: mpsc::UnboundedReceiver<OutboundEvent>,
    pub task: JoinHandle<()>,
    pub rec: Arc<Recorder>,
    pub shutdown: CancellationToken,
}

/// Config with every delay zeroed and the heartbeat pushed out of the way.
pub fn fast_config(backend_url: Option<&str>) -> Config {
    let mut config = Config::default();
    config.timings = Timings {
        clear_settle_ms: 0,
        session_grace_ms: 0,
        stop_settle_ms: 0,
        stop_poll_timeout_ms: 1_000,
        poll_retry_base_ms: 0,
        poll_start_attempts: 3,
        heartbeat_secs: 3_600,
    };
    if let Some(url) = backend_url {
        config.backend.base_url = url.to_string();
    }
    config.backend.timeout_secs = 5;
    config
}

pub fn spawn_worker(config: Config) -> Harness {
    spawn_worker_with(config, Recorder::default())
}

pub fn spawn_worker_with(config: Config, recorder: Recorder) -> Harness {
    let rec = Arc::new(recorder);
    let (commands, commands_rx) = mpsc::channel(16);
    let (sink, events) = EventSink::channel();
    let shutdown = CancellationToken::new();
    let factory = Arc::new(FakeFactory { rec: rec.clone() });
    let worker = Worker::new(config, factory, commands_rx, sink, shutdown.clone()).unwrap();
    let task = tokio::spawn(worker.run());
    Harness {
        commands,
        events,
        task,
        rec,
        shutdown,
    }
}

impl Harness {
    pub async fn send(&self, command: &str, data: Value) {
        self.commands
            .send(RawCommand::new(command, data))
            .await
            .unwrap();
    }

    /// Next event, skipping heartbeats and forwarded log records.
    pub async fn next_event(&mut self) -> Option<OutboundEvent> {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(60), self.events.recv())
                .await
                .expect("timed out waiting for a worker event")?;
            match ev {
                OutboundEvent::HeartbeatTick { .. } | OutboundEvent::LogEmitted { .. } => continue,
                other => return Some(other),
            }
        }
    }

    /// Next event as its wire envelope, asserting its `type`.
    pub async fn expect(&mut self, type_name: &str) -> Value {
        let ev = self.next_event().await.expect("event channel closed");
        let envelope = ev.to_envelope(1, 0);
        assert_eq!(envelope["type"], type_name, "unexpected event: {envelope}");
        envelope
    }

    pub async fn status(&mut self) -> Value {
        self.send("get_status", Value::Null).await;
        self.expect("status").await["data"].clone()
    }

    pub async fn metrics(&mut self) -> Value {
        self.send("get_metrics", Value::Null).await;
        self.expect("metrics").await["data"].clone()
    }

    /// Poll `get_metrics` until `pred` holds.
    pub async fn wait_metrics(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..200 {
            let m = self.metrics().await;
            if pred(&m) {
                return m;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("metrics condition never held");
    }

    /// Stop the worker and collect every remaining event.
    pub async fn stop(mut self) -> Vec<Value> {
        self.send("stop", Value::Null).await;
        self.task.await.unwrap();
        let mut rest = Vec::new();
        while let Some(ev) = self.events.recv().await {
            rest.push(ev.to_envelope(1, 0));
        }
        rest
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

pub fn polling_bot() -> Value {
    json!({
        "tenant_id": "t-1",
        "bot_id": "b-1",
        "token": "123:ABC",
        "platform": "telegram",
        "mode": "polling",
        "assistant": { "id": "a-1", "name": "Ava", "system_prompt": "Be helpful." }
    })
}

pub fn webhook_bot() -> Value {
    let mut bot = polling_bot();
    bot["mode"] = json!("webhook");
    bot["webhook"] = json!({
        "base_url": "https://hooks.example.com/",
        "secret_token": "s3cret",
        "max_connections": 40
    });
    bot
}

pub fn text_message(sender_id: i64, message_id: i64, text: &str) -> InboundUpdate {
    InboundUpdate::Message(InboundMessage {
        update_id: message_id,
        chat_id: sender_id,
        message_id,
        sender: Sender {
            id: sender_id,
            is_bot: false,
            username: Some(format!("user{sender_id}")),
            first_name: Some("Test".into()),
            last_name: None,
        },
        text: Some(text.to_string()),
    })
}
