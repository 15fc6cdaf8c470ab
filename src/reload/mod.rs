//! In-place content updates.
//!
//! A hot reload replaces the assistant persona and reply settings without
//! touching the platform connection.  The patch is merged into a copy of the
//! current content and validated there; the live value is only replaced once
//! the copy is known good, so a rejected reload leaves nothing half-applied.

use serde::{Deserialize, Deserializer};
use tracing::info;

use crate::config::{AssistantProfile, BotConfig, ReplySettings, SecretRef, WireId};
use crate::error::WorkerError;

/// Content the dialog bridge answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentProfile {
    pub assistant: AssistantProfile,
    pub replies: ReplySettings,
}

impl ContentProfile {
    pub fn from_bot(bot: &BotConfig) -> Self {
        Self {
            assistant: bot.assistant.clone(),
            replies: bot.replies.clone(),
        }
    }
}

/// Payload of the `hot_reload` command. Absent fields keep their values.
#[derive(Debug, Default, Deserialize)]
pub struct HotReloadRequest {
    #[serde(default)]
    pub assistant: Option<AssistantPatch>,
    #[serde(default)]
    pub config: Option<SettingsPatch>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssistantPatch {
    /// `None`: absent. `Some(None)`: explicit `null`, which is rejected.
    #[serde(default, deserialize_with = "present_id")]
    pub id: Option<Option<String>>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub welcome_message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub typing_indicator: Option<bool>,
    /// Accepted only when it resolves to the token already in use.
    #[serde(default)]
    pub token: Option<SecretRef>,
}

fn present_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Option<String>>, D::Error> {
    Option::<WireId>::deserialize(d).map(|v| Some(v.map(WireId::into_string)))
}

#[derive(Debug, Clone)]
pub struct ReloadOutcome {
    /// The assistant id changed; per-assistant caches must be dropped.
    pub assistant_changed: bool,
    pub assistant: serde_json::Value,
}

/// Merge `request` into `content`. On error `content` is unchanged.
pub fn apply(
    content: &mut ContentProfile,
    request: HotReloadRequest,
    current_token: Option<&str>,
) -> Result<ReloadOutcome, WorkerError> {
    let mut candidate = content.clone();

    if let Some(patch) = request.assistant {
        match patch.id {
            Some(None) => {
                return Err(WorkerError::Reload("assistant.id must not be null".to_string()))
            }
            Some(Some(id)) => candidate.assistant.id = id,
            None => {}
        }
        if let Some(name) = patch.name {
            candidate.assistant.name = name;
        }
        if let Some(prompt) = patch.system_prompt {
            candidate.assistant.system_prompt = prompt;
        }
        if let Some(model) = patch.model {
            candidate.assistant.model = Some(model);
        }
    }

    if let Some(settings) = request.config {
        if let Some(token) = settings.token {
            if token.resolve().as_deref() != current_token {
                return Err(WorkerError::Reload(
                    "token changes require a restart".to_string(),
                ));
            }
        }
        if let Some(welcome) = settings.welcome_message {
            candidate.replies.welcome_message = Some(welcome);
        }
        if let Some(error_message) = settings.error_message {
            candidate.replies.error_message = error_message;
        }
        if let Some(typing) = settings.typing_indicator {
            candidate.replies.typing_indicator = typing;
        }
    }

    if candidate.assistant.id.trim().is_empty() {
        return Err(WorkerError::Reload("assistant.id must not be empty".to_string()));
    }
    if candidate.replies.error_message.trim().is_empty() {
        return Err(WorkerError::Reload("error_message must not be empty".to_string()));
    }

    let assistant_changed = candidate.assistant.id != content.assistant.id;
    *content = candidate;
    info!(
        assistant_id = %content.assistant.id,
        assistant_changed,
        "content reloaded"
    );
    Ok(ReloadOutcome {
        assistant_changed,
        assistant: content.assistant.summary(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content() -> ContentProfile {
        ContentProfile {
            assistant: AssistantProfile {
                id: "a-1".into(),
                name: "Ava".into(),
                system_prompt: "be kind".into(),
                model: None,
            },
            replies: ReplySettings::default(),
        }
    }

    fn request(v: serde_json::Value) -> HotReloadRequest {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn absent_fields_keep_previous_values() {
        let mut c = content();
        let out = apply(&mut c, request(json!({"assistant": {"name": "Bea"}})), None).unwrap();
        assert!(!out.assistant_changed);
        assert_eq!(c.assistant.name, "Bea");
        assert_eq!(c.assistant.id, "a-1");
        assert_eq!(c.assistant.system_prompt, "be kind");
    }

    #[test]
    fn null_id_is_rejected_and_nothing_changes() {
        let mut c = content();
        let before = c.clone();
        let err = apply(
            &mut c,
            request(json!({"assistant": {"id": null, "name": "Bea"}})),
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "reload_error");
        assert_eq!(c, before);
    }

    #[test]
    fn numeric_id_change_is_reported() {
        let mut c = content();
        let out = apply(&mut c, request(json!({"assistant": {"id": 9}})), None).unwrap();
        assert!(out.assistant_changed);
        assert_eq!(c.assistant.id, "9");
        assert_eq!(out.assistant["id"], "9");
    }

    #[test]
    fn token_change_is_rejected() {
        let mut c = content();
        let before = c.clone();
        let req = request(json!({"config": {"token": "999:OTHER", "typing_indicator": false}}));
        assert!(apply(&mut c, req, Some("123:ABC")).is_err());
        assert_eq!(c, before);

        let same = request(json!({"config": {"token": "123:ABC", "typing_indicator": false}}));
        apply(&mut c, same, Some("123:ABC")).unwrap();
        assert!(!c.replies.typing_indicator);
    }

    #[test]
    fn empty_request_is_a_no_op() {
        let mut c = content();
        let out = apply(&mut c, HotReloadRequest::default(), None).unwrap();
        assert!(!out.assistant_changed);
        assert_eq!(c, content());
    }
}
