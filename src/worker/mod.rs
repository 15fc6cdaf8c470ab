//! The worker run loop.
//!
//! One [`Worker`] value owns every piece of mutable state for the process.
//! Its loop `select!`s over control commands, the inbound platform stream,
//! the running reply task, the dedup sweep timer, the heartbeat timer and
//! the shutdown token. Commands are applied strictly in arrival order.
//!
//! Replies run on a spawned task, one at a time, so a slow backend never
//! holds up commands or heartbeats. Updates that arrive while a reply is
//! running wait in `pending` and are answered in order.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{self, BackendClient, DialogBridge, ReplyContext};
use crate::config::{BotConfig, BotCredential, Config};
use crate::connection::{Activation, ConnectionManager, WorkerState};
use crate::control::{ControlMessage, EventSink, OutboundEvent, RawCommand};
use crate::dedup::DedupCache;
use crate::error::WorkerError;
use crate::metrics::Metrics;
use crate::platform::{
    telegram, AdapterFactory, InboundMessage, InboundUpdate, InlineQuery, PollEvent,
};
use crate::reload::{self, ContentProfile, HotReloadRequest};

/// Updates accepted while a reply is running; beyond this they are dropped.
const MAX_PENDING_UPDATES: usize = 256;

type ReplyTask = JoinHandle<Result<(), WorkerError>>;

/// What woke the run loop.
enum LoopEvent {
    Shutdown,
    Command(Option<RawCommand>),
    ReplyDone(Result<Result<(), WorkerError>, JoinError>),
    Inbound(Option<PollEvent>),
    Sweep,
    Heartbeat,
}

/// An update that passed dedup and waits for the bridge.
enum BridgeJob {
    Message(InboundMessage),
    InlineQuery(InlineQuery),
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub struct Worker {
    config: Config,
    connection: ConnectionManager,
    bridge: DialogBridge,
    dedup: DedupCache,
    metrics: Metrics,
    events: EventSink,
    commands: mpsc::Receiver<RawCommand>,
    shutdown: CancellationToken,

    /// Last accepted bot configuration; reused by a payload-less restart.
    bot: Option<BotConfig>,
    credential: Option<BotCredential>,
    /// Live content, possibly hot-reloaded since `bot` was received.
    content: Option<ContentProfile>,

    in_flight: Option<ReplyTask>,
    pending: VecDeque<BridgeJob>,

    sweeping: bool,
    next_sweep: Instant,
    next_heartbeat: Instant,
    connected_at: Option<Instant>,
}

impl Worker {
    pub fn new(
        config: Config,
        factory: Arc<dyn AdapterFactory>,
        commands: mpsc::Receiver<RawCommand>,
        events: EventSink,
        shutdown: CancellationToken,
    ) -> Result<Self, WorkerError> {
        let bridge = DialogBridge::new(BackendClient::new(&config.backend)?);
        let now = Instant::now();
        Ok(Self {
            connection: ConnectionManager::new(factory, config.timings.clone()),
            bridge,
            dedup: DedupCache::new(&config.dedup),
            metrics: Metrics::new(),
            events,
            commands,
            shutdown,
            bot: None,
            credential: None,
            content: None,
            in_flight: None,
            pending: VecDeque::new(),
            sweeping: false,
            next_sweep: now + sweep_period(&config),
            next_heartbeat: now + config.timings.heartbeat(),
            connected_at: None,
            config,
        })
    }

    /// Process events until `stop`, a shutdown signal, or the control
    /// channel closing. The stop sequence always runs before returning.
    pub async fn run(mut self) {
        info!(pid = std::process::id(), "worker ready");

        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => LoopEvent::Shutdown,
                cmd = self.commands.recv() => LoopEvent::Command(cmd),
                done = join_reply(&mut self.in_flight) => LoopEvent::ReplyDone(done),
                ev = self.connection.next_inbound(), if self.in_flight.is_none() => {
                    LoopEvent::Inbound(ev)
                }
                _ = sleep_until(self.next_sweep), if self.sweeping => LoopEvent::Sweep,
                _ = sleep_until(self.next_heartbeat) => LoopEvent::Heartbeat,
            };

            match event {
                LoopEvent::Shutdown => {
                    info!("shutdown signal received");
                    self.stop("signal").await;
                    break;
                }
                LoopEvent::Command(None) => {
                    info!("control channel closed");
                    self.stop("channel_closed").await;
                    break;
                }
                LoopEvent::Command(Some(raw)) => {
                    if self.dispatch(raw).await == Flow::Exit {
                        break;
                    }
                }
                LoopEvent::ReplyDone(done) => {
                    self.in_flight = None;
                    self.record_reply(done);
                    self.pump();
                }
                LoopEvent::Inbound(Some(ev)) => self.on_poll_event(ev),
                LoopEvent::Inbound(None) => {
                    warn!("poll loop ended unexpectedly");
                    self.connection.detach_inbound();
                }
                LoopEvent::Sweep => {
                    self.dedup.sweep();
                    self.next_sweep = Instant::now() + sweep_period(&self.config);
                }
                LoopEvent::Heartbeat => {
                    self.next_heartbeat = Instant::now() + self.config.timings.heartbeat();
                    if !self.events.is_closed() {
                        self.events.emit(OutboundEvent::HeartbeatTick {
                            state: self.connection.state(),
                        });
                    }
                }
            }
        }

        info!("worker exited");
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch(&mut self, raw: RawCommand) -> Flow {
        debug!(command = %raw.command, "control command");
        let msg = match ControlMessage::parse(raw) {
            Ok(Some(msg)) => msg,
            Ok(None) => return Flow::Continue,
            Err(e) => {
                self.report(&e);
                return Flow::Continue;
            }
        };

        match msg {
            ControlMessage::Start(bot) => {
                if let Err(e) = self.start(*bot).await {
                    self.report(&e);
                }
            }
            ControlMessage::Stop => {
                self.stop("stop").await;
                return Flow::Exit;
            }
            ControlMessage::Restart(bot) => self.restart(bot.map(|b| *b)).await,
            ControlMessage::HotReload(req) => self.hot_reload(req).await,
            ControlMessage::WebhookUpdate(update) => self.webhook_update(update),
            ControlMessage::GetStatus => {
                let status = self.status().await;
                self.events.emit(OutboundEvent::Status(status));
            }
            ControlMessage::GetMetrics => {
                let snapshot = serde_json::to_value(self.metrics.snapshot()).unwrap_or_default();
                self.events.emit(OutboundEvent::MetricsSnapshot(snapshot));
            }
        }
        Flow::Continue
    }

    fn report(&mut self, e: &WorkerError) {
        self.metrics.errors += 1;
        if e.is_fatal() {
            error!(kind = e.kind(), error = %e, "worker error");
        } else {
            warn!(kind = e.kind(), error = %e, "worker error");
        }
        self.events.emit(OutboundEvent::error(e));
    }

    // -----------------------------------------------------------------------
    // Start / restart
    // -----------------------------------------------------------------------

    async fn start(&mut self, bot: BotConfig) -> Result<(), WorkerError> {
        let state = self.connection.state();
        if !matches!(state, WorkerState::Idle | WorkerState::Stopped) {
            return Err(WorkerError::InvalidState {
                state: state.to_string(),
                command: "start".to_string(),
            });
        }
        self.launch(bot, None).await
    }

    /// Adopt `bot` and bring the connection up. `content` overrides the
    /// content carried by `bot` (restart keeps hot-reloaded content).
    async fn launch(
        &mut self,
        bot: BotConfig,
        content: Option<ContentProfile>,
    ) -> Result<(), WorkerError> {
        let content = content.unwrap_or_else(|| ContentProfile::from_bot(&bot));
        let previous_assistant = self.content.as_ref().map(|c| c.assistant.id.clone());
        if previous_assistant.is_some_and(|id| id != content.assistant.id) {
            self.dedup.clear();
            self.bridge.clear_dialogs().await;
        }

        info!(
            tenant_id = %bot.tenant_id,
            mode = %bot.mode,
            assistant_id = %content.assistant.id,
            "starting bot connection"
        );
        let result = self.connection.start(&bot).await;

        self.credential = bot.credential().ok();
        self.content = Some(content);
        let tenant_id = bot.tenant_id.clone();
        let bot_id = bot.bot_id().to_string();
        self.bot = Some(bot);

        let Activation {
            mode,
            identity,
            registration,
        } = result?;

        let now = Instant::now();
        self.sweeping = true;
        self.next_sweep = now + sweep_period(&self.config);
        self.connected_at = Some(now);

        if let Some(registration) = registration {
            self.events.emit(OutboundEvent::WebhookRegistrationRequested {
                bot_id,
                url: registration.url,
                secret_token: registration.secret_token,
            });
        }
        info!(
            tenant_id = %tenant_id,
            mode = %mode,
            username = identity.username.as_deref().unwrap_or(""),
            "bot connection started"
        );
        self.events.emit(OutboundEvent::Started {
            mode,
            bot: identity,
            tenant_id,
        });
        Ok(())
    }

    async fn restart(&mut self, bot: Option<BotConfig>) {
        self.metrics.restarts += 1;
        info!(restarts = self.metrics.restarts, with_config = bot.is_some(), "restart requested");

        let (bot, content) = match bot {
            Some(bot) => (bot, None),
            None => match self.bot.clone() {
                Some(bot) => (bot, self.content.clone()),
                None => {
                    self.report(&WorkerError::InvalidCommand(
                        "restart needs a configuration before the first start".to_string(),
                    ));
                    return;
                }
            },
        };

        self.stop("restart").await;
        if let Err(e) = self.launch(bot, content).await {
            self.report(&e);
        }
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Bounded, idempotent stop. Emits exactly one `stopped` per call.
    async fn stop(&mut self, reason: &str) {
        self.sweeping = false;
        self.drain_replies().await;

        let state = self.connection.state();
        let idle = matches!(state, WorkerState::Idle | WorkerState::Stopped);
        if idle && !self.connection.has_resources() {
            debug!(state = %state, "nothing to tear down");
        } else {
            self.connection.set_state(WorkerState::Stopping);
            let problems = self.connection.teardown().await;
            if !problems.is_empty() {
                warn!(failed_steps = problems.len(), "stop completed with errors");
            }
            tokio::time::sleep(self.config.timings.stop_settle()).await;
        }

        self.connection.set_state(WorkerState::Stopped);
        self.connected_at = None;
        info!(reason, "bot connection stopped");
        self.events.emit(OutboundEvent::Stopped {
            reason: reason.to_string(),
        });
    }

    /// Drop queued updates and give the running reply `stop_poll_timeout`
    /// to finish before aborting it.
    async fn drain_replies(&mut self) {
        if !self.pending.is_empty() {
            warn!(dropped = self.pending.len(), "queued updates dropped on stop");
            self.pending.clear();
        }
        let Some(mut task) = self.in_flight.take() else {
            return;
        };
        let limit = self.config.timings.stop_poll_timeout();
        match tokio::time::timeout(limit, &mut task).await {
            Ok(done) => self.record_reply(done),
            Err(_) => {
                task.abort();
                warn!(timeout_ms = limit.as_millis() as u64, "reply still running; aborted");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Hot reload
    // -----------------------------------------------------------------------

    async fn hot_reload(&mut self, req: Result<HotReloadRequest, WorkerError>) {
        let result = match (req, self.content.as_mut()) {
            (Err(e), _) => Err(e),
            (Ok(req), Some(content)) => reload::apply(
                content,
                req,
                self.credential.as_ref().map(|c| c.token.as_str()),
            ),
            (Ok(_), None) => Err(WorkerError::Reload(
                "no configuration to reload before start".to_string(),
            )),
        };

        match result {
            Ok(outcome) => {
                if outcome.assistant_changed {
                    self.dedup.clear();
                    self.bridge.clear_dialogs().await;
                }
                self.events.emit(OutboundEvent::HotReloadResult {
                    success: true,
                    assistant: Some(outcome.assistant),
                    error: None,
                });
            }
            Err(e) => {
                self.metrics.errors += 1;
                warn!(error = %e, "hot reload rejected");
                self.events.emit(OutboundEvent::HotReloadResult {
                    success: false,
                    assistant: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn webhook_update(&mut self, update: Value) {
        let state = self.connection.state();
        if state != WorkerState::RunningWebhook {
            self.report(&WorkerError::InvalidState {
                state: state.to_string(),
                command: "webhook_update".to_string(),
            });
            return;
        }
        match telegram::parse_update(update) {
            Ok(update) => self.on_update(update),
            Err(e) => self.report(&WorkerError::InvalidCommand(format!("webhook_update: {e}"))),
        }
    }

    fn on_poll_event(&mut self, event: PollEvent) {
        match event {
            PollEvent::Update(update) => self.on_update(update),
            PollEvent::Error(message) => {
                self.metrics.errors += 1;
                warn!(error = %message, "poll loop error");
            }
        }
    }

    fn on_update(&mut self, update: InboundUpdate) {
        let job = match update {
            InboundUpdate::Message(msg) => {
                let Some(text) = bridge::message_text(&msg) else {
                    debug!(update_id = msg.update_id, "message without user text ignored");
                    return;
                };
                let sender_id = msg.sender.id.to_string();
                if self
                    .dedup
                    .is_duplicate(&sender_id, &msg.message_id.to_string(), text)
                {
                    self.metrics.duplicates_suppressed += 1;
                    warn!(
                        sender_id = %sender_id,
                        message_id = msg.message_id,
                        "duplicate message suppressed"
                    );
                    return;
                }
                BridgeJob::Message(msg)
            }
            InboundUpdate::InlineQuery(query) => {
                let sender_id = query.sender.id.to_string();
                if self
                    .dedup
                    .is_duplicate(&sender_id, &format!("inline:{}", query.id), &query.query)
                {
                    self.metrics.duplicates_suppressed += 1;
                    warn!(
                        sender_id = %sender_id,
                        query_id = %query.id,
                        "duplicate inline query suppressed"
                    );
                    return;
                }
                BridgeJob::InlineQuery(query)
            }
            InboundUpdate::Ignored { update_id, kind } => {
                debug!(update_id, kind = %kind, "update ignored");
                return;
            }
        };

        if self.pending.len() >= MAX_PENDING_UPDATES {
            self.metrics.errors += 1;
            warn!(queued = self.pending.len(), "reply queue full; update dropped");
            return;
        }
        self.pending.push_back(job);
        self.pump();
    }

    /// Spawn the next queued reply unless one is already running.
    fn pump(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(job) = self.pending.pop_front() else {
            return;
        };
        let (Some(adapter), Some(bot), Some(content)) =
            (self.connection.adapter(), self.bot.as_ref(), self.content.as_ref())
        else {
            self.pending.clear();
            return;
        };

        let bridge = self.bridge.clone();
        let ctx = ReplyContext {
            tenant_id: bot.tenant_id.clone(),
            content: content.clone(),
        };
        self.in_flight = Some(tokio::spawn(async move {
            match job {
                BridgeJob::Message(msg) => {
                    bridge.handle_message(adapter.as_ref(), &ctx, &msg).await
                }
                BridgeJob::InlineQuery(query) => {
                    bridge
                        .handle_inline_query(adapter.as_ref(), &ctx, &query)
                        .await
                }
            }
        }));
    }

    fn record_reply(&mut self, done: Result<Result<(), WorkerError>, JoinError>) {
        match done {
            Ok(Ok(())) => self.metrics.messages_processed += 1,
            Ok(Err(e)) => self.report(&e),
            Err(e) if e.is_cancelled() => debug!("reply task cancelled"),
            Err(e) => self.report(&WorkerError::DialogBridge(format!("reply task failed: {e}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    async fn status(&self) -> Value {
        let cached_dialogs = self.bridge.cached_dialogs().await;
        let identity = self.connection.identity();
        json!({
            "state": self.connection.state(),
            "mode": self.connection.mode(),
            "tenant_id": self.bot.as_ref().map(|b| b.tenant_id.as_str()),
            "bot_id": self.bot.as_ref().map(|b| b.bot_id()),
            "bot_username": identity.and_then(|i| i.username.as_deref()),
            "assistant": self.content.as_ref().map(|c| c.assistant.summary()),
            "uptime_secs": self.metrics.uptime_secs(),
            "connected_secs": self.connected_at.map(|t| t.elapsed().as_secs()),
            "dedup_entries": self.dedup.len(),
            "cached_dialogs": cached_dialogs,
            "reply_in_flight": self.in_flight.is_some(),
            "queued_updates": self.pending.len(),
        })
    }
}

/// Resolves when the running reply finishes; never while none is running.
async fn join_reply(task: &mut Option<ReplyTask>) -> Result<Result<(), WorkerError>, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn sweep_period(config: &Config) -> Duration {
    Duration::from_secs(config.dedup.sweep_secs.max(1))
}
