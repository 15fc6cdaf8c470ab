//! Control channel between the worker and its supervising parent.
//!
//! Inbound commands and outbound events are newline-delimited JSON.  The
//! binary wires them to stdin/stdout via [`spawn_reader`] / [`spawn_writer`];
//! tests drive the worker through the in-process channels directly.
//!
//! Inbound:  `{"command": "start", "data": {...}}`
//! Outbound: `{"type": "started", "data": {...}, "timestamp": 1700000000000, "pid": 4242}`

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::config::{BotConfig, ConnectionMode};
use crate::connection::WorkerState;
use crate::error::WorkerError;
use crate::platform::BotIdentity;
use crate::reload::HotReloadRequest;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A command as received, before its payload is interpreted.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCommand {
    pub command: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RawCommand {
    pub fn new(command: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }
}

/// A recognised command with its typed payload.
#[derive(Debug)]
pub enum ControlMessage {
    Start(Box<BotConfig>),
    Stop,
    /// `None` reuses the current bot configuration.
    Restart(Option<Box<BotConfig>>),
    /// A payload that failed to decode is carried as the error, so the
    /// parent still gets a `hot_reload_failed` reply.
    HotReload(Result<HotReloadRequest, WorkerError>),
    /// Raw platform update forwarded by the orchestrator's webhook listener.
    WebhookUpdate(serde_json::Value),
    GetStatus,
    GetMetrics,
}

impl ControlMessage {
    /// Interpret a raw command. Unknown tags yield `Ok(None)`.
    pub fn parse(raw: RawCommand) -> Result<Option<ControlMessage>, WorkerError> {
        let RawCommand { command, data } = raw;
        let msg = match command.as_str() {
            "start" => ControlMessage::Start(Box::new(bot_config(&command, data)?)),
            "stop" => ControlMessage::Stop,
            "restart" => {
                if data.is_null() {
                    ControlMessage::Restart(None)
                } else {
                    ControlMessage::Restart(Some(Box::new(bot_config(&command, data)?)))
                }
            }
            "hot_reload" => {
                let req = if data.is_null() {
                    Ok(HotReloadRequest::default())
                } else {
                    serde_json::from_value(data)
                        .map_err(|e| WorkerError::Reload(format!("invalid payload: {e}")))
                };
                ControlMessage::HotReload(req)
            }
            "webhook_update" => {
                if !data.is_object() {
                    return Err(WorkerError::InvalidCommand(
                        "webhook_update payload must be an update object".to_string(),
                    ));
                }
                ControlMessage::WebhookUpdate(data)
            }
            "get_status" => ControlMessage::GetStatus,
            "get_metrics" => ControlMessage::GetMetrics,
            other => {
                warn!(command = %other, "unknown control command ignored");
                return Ok(None);
            }
        };
        Ok(Some(msg))
    }
}

fn bot_config(command: &str, data: serde_json::Value) -> Result<BotConfig, WorkerError> {
    if data.is_null() {
        return Err(WorkerError::InvalidCommand(format!(
            "{command} requires a bot configuration"
        )));
    }
    serde_json::from_value(data)
        .map_err(|e| WorkerError::InvalidCommand(format!("{command} payload: {e}")))
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Event emitted to the parent.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Started {
        mode: ConnectionMode,
        bot: BotIdentity,
        tenant_id: String,
    },
    Stopped {
        reason: String,
    },
    ErrorReported {
        kind: String,
        message: String,
        fatal: bool,
    },
    LogEmitted {
        level: String,
        target: String,
        message: String,
        fields: serde_json::Map<String, serde_json::Value>,
    },
    MetricsSnapshot(serde_json::Value),
    Status(serde_json::Value),
    HeartbeatTick {
        state: WorkerState,
    },
    WebhookRegistrationRequested {
        bot_id: String,
        url: String,
        secret_token: Option<String>,
    },
    HotReloadResult {
        success: bool,
        assistant: Option<serde_json::Value>,
        error: Option<String>,
    },
}

impl OutboundEvent {
    pub fn error(err: &WorkerError) -> Self {
        OutboundEvent::ErrorReported {
            kind: err.kind().to_string(),
            message: err.to_string(),
            fatal: err.is_fatal(),
        }
    }

    /// Value of the envelope's `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundEvent::Started { .. } => "started",
            OutboundEvent::Stopped { .. } => "stopped",
            OutboundEvent::ErrorReported { .. } => "error",
            OutboundEvent::LogEmitted { .. } => "log",
            OutboundEvent::MetricsSnapshot(_) => "metrics",
            OutboundEvent::Status(_) => "status",
            OutboundEvent::HeartbeatTick { .. } => "heartbeat",
            OutboundEvent::WebhookRegistrationRequested { .. } => "request",
            OutboundEvent::HotReloadResult { success: true, .. } => "hot_reloaded",
            OutboundEvent::HotReloadResult { success: false, .. } => "hot_reload_failed",
        }
    }

    /// Wire representation.
    pub fn to_envelope(&self, pid: u32, timestamp_ms: i64) -> serde_json::Value {
        let data = match self {
            OutboundEvent::Started {
                mode,
                bot,
                tenant_id,
            } => serde_json::json!({
                "mode": mode,
                "tenant_id": tenant_id,
                "bot": bot,
            }),
            OutboundEvent::Stopped { reason } => serde_json::json!({ "reason": reason }),
            OutboundEvent::ErrorReported {
                kind,
                message,
                fatal,
            } => serde_json::json!({
                "kind": kind,
                "message": message,
                "fatal": fatal,
            }),
            OutboundEvent::LogEmitted {
                level,
                target,
                message,
                fields,
            } => serde_json::json!({
                "level": level,
                "target": target,
                "message": message,
                "fields": fields,
            }),
            OutboundEvent::MetricsSnapshot(v) | OutboundEvent::Status(v) => v.clone(),
            OutboundEvent::HeartbeatTick { state } => serde_json::json!({ "state": state }),
            OutboundEvent::WebhookRegistrationRequested {
                bot_id,
                url,
                secret_token,
            } => serde_json::json!({
                "bot_id": bot_id,
                "url": url,
                "secret_token": secret_token,
            }),
            OutboundEvent::HotReloadResult {
                success,
                assistant,
                error,
            } => {
                let mut v = serde_json::json!({ "success": success });
                if let Some(a) = assistant {
                    v["assistant"] = a.clone();
                }
                if let Some(e) = error {
                    v["error"] = serde_json::json!(e);
                }
                v
            }
        };

        let mut envelope = serde_json::json!({
            "type": self.type_name(),
            "data": data,
            "timestamp": timestamp_ms,
            "pid": pid,
        });
        if let OutboundEvent::WebhookRegistrationRequested { .. } = self {
            envelope["requestType"] = serde_json::json!("register_webhook");
        }
        envelope
    }
}

/// Cloneable handle for emitting events to the parent.
///
/// Sending never blocks and never fails loudly: once the parent is gone
/// there is nobody left to notify, so events are dropped.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl EventSink {
    pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx }, rx)
    }

    pub fn try_emit(&self, event: OutboundEvent) -> Result<(), WorkerError> {
        self.tx.send(event).map_err(|_| WorkerError::ChannelClosed)
    }

    pub fn emit(&self, event: OutboundEvent) {
        // No receiver left to notify.
        let _ = self.try_emit(event);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Stream transport
// ---------------------------------------------------------------------------

/// Read newline-delimited commands from `reader` into `commands`.
///
/// Lines that are not valid command objects are reported as `error`
/// events and skipped.  The task ends on EOF, which closes `commands`.
pub fn spawn_reader<R>(
    reader: R,
    commands: mpsc::Sender<RawCommand>,
    events: EventSink,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LinesStream::new(BufReader::new(reader).lines());
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "control channel read failed");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawCommand>(trimmed) {
                Ok(cmd) => {
                    if commands.send(cmd).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    events.emit(OutboundEvent::error(&WorkerError::InvalidCommand(format!(
                        "unparseable control message: {e}"
                    ))));
                }
            }
        }
        debug!("control channel reader finished");
    })
}

/// Write events from `events` to `writer` as JSON lines.
///
/// A failed write means the parent went away; the task stops and later
/// events are dropped.
pub fn spawn_writer<W>(
    mut writer: W,
    mut events: mpsc::UnboundedReceiver<OutboundEvent>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let pid = std::process::id();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let envelope = event.to_envelope(pid, chrono::Utc::now().timestamp_millis());
            let mut line = match serde_json::to_string(&envelope) {
                Ok(s) => s,
                Err(_) => continue,
            };
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() || writer.flush().await.is_err()
            {
                break;
            }
        }
        // Closing the receiver makes further `emit` calls no-ops.
        events.close();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_command_is_ignored() {
        let parsed = ControlMessage::parse(RawCommand::new("reboot", json!(null))).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn start_without_payload_is_invalid() {
        let err = ControlMessage::parse(RawCommand::new("start", json!(null))).unwrap_err();
        assert_eq!(err.kind(), "invalid_command");
    }

    #[test]
    fn restart_payload_is_optional() {
        let parsed = ControlMessage::parse(RawCommand::new("restart", json!(null))).unwrap();
        assert!(matches!(parsed, Some(ControlMessage::Restart(None))));
    }

    #[test]
    fn undecodable_hot_reload_is_kept_for_the_reply() {
        let parsed = ControlMessage::parse(RawCommand::new(
            "hot_reload",
            json!({"assistant": {"name": 5}}),
        ))
        .unwrap();
        match parsed {
            Some(ControlMessage::HotReload(Err(e))) => assert_eq!(e.kind(), "reload_error"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn webhook_update_requires_object() {
        assert!(ControlMessage::parse(RawCommand::new("webhook_update", json!("x"))).is_err());
        let ok = ControlMessage::parse(RawCommand::new("webhook_update", json!({"update_id": 1})))
            .unwrap();
        assert!(matches!(ok, Some(ControlMessage::WebhookUpdate(_))));
    }

    #[test]
    fn register_webhook_request_envelope() {
        let ev = OutboundEvent::WebhookRegistrationRequested {
            bot_id: "b1".into(),
            url: "https://hooks.example.com/webhook/b1".into(),
            secret_token: None,
        };
        let env = ev.to_envelope(99, 1_000);
        assert_eq!(env["type"], "request");
        assert_eq!(env["requestType"], "register_webhook");
        assert_eq!(env["data"]["bot_id"], "b1");
        assert_eq!(env["pid"], 99);
        assert_eq!(env["timestamp"], 1_000);
    }

    #[test]
    fn hot_reload_result_type_follows_outcome() {
        let ok = OutboundEvent::HotReloadResult {
            success: true,
            assistant: Some(json!({"id": "a"})),
            error: None,
        };
        let failed = OutboundEvent::HotReloadResult {
            success: false,
            assistant: None,
            error: Some("bad".into()),
        };
        assert_eq!(ok.type_name(), "hot_reloaded");
        assert_eq!(failed.type_name(), "hot_reload_failed");
        assert_eq!(failed.to_envelope(1, 1)["data"]["error"], "bad");
    }

    #[tokio::test]
    async fn emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        assert!(sink.is_closed());
        assert!(matches!(
            sink.try_emit(OutboundEvent::Stopped { reason: "x".into() }),
            Err(WorkerError::ChannelClosed)
        ));
        sink.emit(OutboundEvent::Stopped { reason: "x".into() });
    }

    #[tokio::test]
    async fn reader_forwards_commands_and_reports_garbage() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(8);
        let (sink, mut events) = EventSink::channel();
        let task = spawn_reader(server, tx, sink);

        client
            .write_all(b"{\"command\":\"get_status\"}\nnot json\n\n{\"command\":\"stop\",\"data\":null}\n")
            .await
            .unwrap();
        drop(client);

        assert_eq!(rx.recv().await.unwrap().command, "get_status");
        assert_eq!(rx.recv().await.unwrap().command, "stop");
        assert!(rx.recv().await.is_none());
        task.await.unwrap();

        match events.recv().await.unwrap() {
            OutboundEvent::ErrorReported { kind, .. } => assert_eq!(kind, "invalid_command"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn writer_emits_json_lines() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (sink, rx) = EventSink::channel();
        let task = spawn_writer(client, rx);

        sink.emit(OutboundEvent::Stopped {
            reason: "stop".into(),
        });
        drop(sink);
        task.await.unwrap();

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut out)
            .await
            .unwrap();
        let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(line["type"], "stopped");
        assert_eq!(line["data"]["reason"], "stop");
        assert!(line["pid"].as_u64().is_some());
    }
}
