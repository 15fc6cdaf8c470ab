//! Connection mode manager.
//!
//! Owns the platform connection for one bot and guarantees that at most one
//! receive mode is armed at a time.  Every activation begins by clearing any
//! webhook left registered for the credential, so switching between polling
//! and webhook delivery never leaves the other subscription alive.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{BotConfig, ConnectionMode, Timings};
use crate::error::{PlatformError, WorkerError};
use crate::platform::{
    AdapterFactory, BotIdentity, PlatformAdapter, PollEvent, PollHandle, WebhookRegistration,
};

/// Buffer between the poll task and the run loop.
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Starting,
    RunningPolling,
    RunningWebhook,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerState {
    pub fn is_running(self) -> bool {
        matches!(self, WorkerState::RunningPolling | WorkerState::RunningWebhook)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Starting => "starting",
            WorkerState::RunningPolling => "running_polling",
            WorkerState::RunningWebhook => "running_webhook",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful [`ConnectionManager::start`].
#[derive(Debug, Clone)]
pub struct Activation {
    pub mode: ConnectionMode,
    pub identity: BotIdentity,
    /// Set in webhook mode; the parent must route this callback to us.
    pub registration: Option<WebhookRegistration>,
}

/// Callback URL the orchestrator's shared listener serves for `bot_id`.
pub fn callback_url(base_url: &str, bot_id: &str) -> String {
    format!("{}/webhook/{}", base_url.trim_end_matches('/'), bot_id)
}

pub struct ConnectionManager {
    factory: Arc<dyn AdapterFactory>,
    timings: Timings,
    state: WorkerState,
    adapter: Option<Arc<dyn PlatformAdapter>>,
    poller: Option<PollHandle>,
    inbound: Option<mpsc::Receiver<PollEvent>>,
    identity: Option<BotIdentity>,
    mode: Option<ConnectionMode>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn AdapterFactory>, timings: Timings) -> Self {
        Self {
            factory,
            timings,
            state: WorkerState::Idle,
            adapter: None,
            poller: None,
            inbound: None,
            identity: None,
            mode: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "worker state change");
            self.state = state;
        }
    }

    pub fn identity(&self) -> Option<&BotIdentity> {
        self.identity.as_ref()
    }

    /// Mode of the active connection, if any.
    pub fn mode(&self) -> Option<ConnectionMode> {
        self.mode
    }

    /// The persistent adapter while a connection is up.
    pub fn adapter(&self) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapter.clone()
    }

    /// Whether there is anything for the stop sequence to tear down.
    pub fn has_resources(&self) -> bool {
        self.adapter.is_some() || self.poller.is_some() || self.inbound.is_some()
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Bring the connection up: clear webhook, validate identity, settle,
    /// then arm the configured mode. On failure the state is `Failed`.
    pub async fn start(&mut self, bot: &BotConfig) -> Result<Activation, WorkerError> {
        self.set_state(WorkerState::Starting);
        match self.activate(bot).await {
            Ok(activation) => {
                self.set_state(match activation.mode {
                    ConnectionMode::Polling => WorkerState::RunningPolling,
                    ConnectionMode::Webhook => WorkerState::RunningWebhook,
                });
                self.identity = Some(activation.identity.clone());
                self.mode = Some(activation.mode);
                Ok(activation)
            }
            Err(e) => {
                if let Some(adapter) = self.adapter.take() {
                    if let Err(close_err) = adapter.close().await {
                        debug!(error = %close_err, "adapter close after failed start");
                    }
                }
                self.set_state(WorkerState::Failed);
                Err(e)
            }
        }
    }

    async fn activate(&mut self, bot: &BotConfig) -> Result<Activation, WorkerError> {
        let credential = bot.credential()?;
        if bot.mode == ConnectionMode::Webhook && bot.webhook.is_none() {
            return Err(WorkerError::Setup(
                "webhook mode requires webhook settings".to_string(),
            ));
        }

        // 1. Throwaway client: clear whatever subscription a previous run left.
        let probe = self.factory.connect(&credential).map_err(setup_error)?;
        match probe.clear_webhook().await {
            Ok(()) => debug!(tenant_id = %bot.tenant_id, "previous webhook cleared"),
            Err(e) => warn!(tenant_id = %bot.tenant_id, error = %e, "webhook clear failed, continuing"),
        }
        tokio::time::sleep(self.timings.clear_settle()).await;

        // 2. Identity. Any failure here means the credential is unusable.
        let identity = match probe.validate().await {
            Ok(identity) => identity,
            Err(e) => {
                let _ = probe.close().await;
                return Err(WorkerError::Auth(format!("identity validation failed: {e}")));
            }
        };
        info!(
            tenant_id = %bot.tenant_id,
            bot_id = identity.id,
            username = identity.username.as_deref().unwrap_or(""),
            "bot identity validated"
        );
        if let Err(e) = probe.close().await {
            debug!(error = %e, "probe client close failed");
        }

        // 3. Let the platform release the probe session.
        tokio::time::sleep(self.timings.session_grace()).await;

        // 4. Persistent client and mode activation.
        let adapter = self.factory.connect(&credential).map_err(setup_error)?;
        self.adapter = Some(adapter.clone());

        let registration = match (bot.mode, &bot.webhook) {
            (ConnectionMode::Webhook, Some(settings)) => {
                let registration = WebhookRegistration {
                    url: callback_url(&settings.base_url, bot.bot_id()),
                    secret_token: settings.secret_token.clone(),
                    max_connections: settings.max_connections,
                    allowed_updates: settings.allowed_updates.clone(),
                };
                self.arm_webhook(adapter.as_ref(), &registration).await?;
                Some(registration)
            }
            _ => {
                self.arm_polling(adapter.as_ref()).await?;
                None
            }
        };

        Ok(Activation {
            mode: bot.mode,
            identity,
            registration,
        })
    }

    async fn arm_webhook(
        &self,
        adapter: &dyn PlatformAdapter,
        registration: &WebhookRegistration,
    ) -> Result<(), WorkerError> {
        adapter
            .register_webhook(registration)
            .await
            .map_err(|e| activation_error("webhook registration", e))?;

        let info = adapter
            .webhook_info()
            .await
            .map_err(|e| activation_error("webhook confirmation", e))?;
        if info.url != registration.url {
            return Err(WorkerError::Setup(format!(
                "webhook not confirmed: platform reports '{}'",
                info.url
            )));
        }
        info!(url = %registration.url, "webhook registered");
        Ok(())
    }

    async fn arm_polling(&mut self, adapter: &dyn PlatformAdapter) -> Result<(), WorkerError> {
        let attempts = self.timings.poll_start_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            match adapter.start_polling(tx).await {
                Ok(handle) => {
                    // Attach only once the loop is confirmed running.
                    self.poller = Some(handle);
                    self.inbound = Some(rx);
                    info!(attempt = attempt + 1, "polling started");
                    return Ok(());
                }
                Err(e @ PlatformError::Auth(_)) => {
                    return Err(WorkerError::Auth(e.to_string()));
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "polling start failed"
                    );
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.timings.poll_retry_delay(attempt)).await;
                    }
                }
            }
        }

        Err(WorkerError::Setup(format!(
            "polling did not start after {attempts} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    // -----------------------------------------------------------------------
    // Inbound stream
    // -----------------------------------------------------------------------

    /// Next event from the poll loop. Never resolves while nothing is attached.
    pub async fn next_inbound(&mut self) -> Option<PollEvent> {
        match self.inbound.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    pub fn detach_inbound(&mut self) {
        if self.inbound.take().is_some() {
            debug!("inbound stream detached");
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Stop polling, detach the inbound stream and release the adapter.
    ///
    /// Each step is bounded by the stop-poll timeout and runs even if an
    /// earlier one failed. Returns a description of every failed step.
    pub async fn teardown(&mut self) -> Vec<String> {
        let mut problems = Vec::new();
        let limit = self.timings.stop_poll_timeout();

        if let Some(handle) = self.poller.take() {
            let abort = handle.task.abort_handle();
            match self.adapter.clone() {
                Some(adapter) => {
                    match tokio::time::timeout(limit, adapter.stop_polling(handle)).await {
                        Ok(Ok(())) => debug!("poll loop stopped"),
                        Ok(Err(e)) => {
                            abort.abort();
                            problems.push(format!("stop polling: {e}"));
                        }
                        Err(_) => {
                            // Best effort: the platform may still hold the long poll.
                            abort.abort();
                            warn!(timeout_ms = limit.as_millis() as u64, "poll loop did not stop in time, aborted");
                            problems.push("stop polling: timed out".to_string());
                        }
                    }
                }
                None => {
                    handle.cancel.cancel();
                    abort.abort();
                }
            }
        }

        self.detach_inbound();

        if let Some(adapter) = self.adapter.take() {
            match tokio::time::timeout(limit, adapter.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => problems.push(format!("close adapter: {e}")),
                Err(_) => problems.push("close adapter: timed out".to_string()),
            }
        }

        self.mode = None;
        for problem in &problems {
            warn!(problem = %problem, "teardown step failed");
        }
        problems
    }
}

fn setup_error(e: PlatformError) -> WorkerError {
    WorkerError::Setup(format!("platform client: {e}"))
}

/// Activation failures are `Setup`, except a rejected credential.
fn activation_error(step: &str, e: PlatformError) -> WorkerError {
    match e {
        PlatformError::Auth(msg) => WorkerError::Auth(msg),
        other => WorkerError::Setup(format!("{step}: {other}")),
    }
}
