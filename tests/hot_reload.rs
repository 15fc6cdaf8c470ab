//! Hot reload through the control channel.

mod common;

use common::{fast_config, polling_bot, spawn_worker, text_message};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn null_assistant_id_fails_and_keeps_previous_profile() {
    let mut h = spawn_worker(fast_config(None));
    h.send("start", polling_bot()).await;
    h.expect("started").await;

    h.send(
        "hot_reload",
        json!({ "assistant": { "id": null, "name": "Mallory" } }),
    )
    .await;
    let failed = h.expect("hot_reload_failed").await;
    assert_eq!(failed["data"]["success"], false);
    assert!(failed["data"]["error"].as_str().unwrap().contains("null"));

    let status = h.status().await;
    assert_eq!(status["assistant"]["name"], "Ava");
    assert_eq!(status["assistant"]["id"], "a-1");
    // The connection was never touched.
    assert_eq!(status["state"], "running_polling");
    assert_eq!(h.rec.count("stop_polling"), 0);
    h.stop().await;
}

#[tokio::test]
async fn undecodable_payload_is_answered_with_failure() {
    let mut h = spawn_worker(fast_config(None));
    h.send("start", polling_bot()).await;
    h.expect("started").await;

    h.send("hot_reload", json!({ "assistant": { "name": 5 } }))
        .await;
    let failed = h.expect("hot_reload_failed").await;
    assert_eq!(failed["data"]["success"], false);
    assert!(failed["data"]["error"]
        .as_str()
        .unwrap()
        .contains("invalid payload"));

    assert_eq!(h.status().await["assistant"]["name"], "Ava");
    assert_eq!(h.metrics().await["errors"], 1);
    h.stop().await;
}

#[tokio::test]
async fn partial_update_merges_over_current_profile() {
    let mut h = spawn_worker(fast_config(None));
    h.send("start", polling_bot()).await;
    h.expect("started").await;

    h.send(
        "hot_reload",
        json!({
            "assistant": { "name": "Bea", "model": "gpt-4o-mini" },
            "config": { "typing_indicator": false }
        }),
    )
    .await;
    let ok = h.expect("hot_reloaded").await;
    assert_eq!(ok["data"]["success"], true);
    assert_eq!(ok["data"]["assistant"]["name"], "Bea");
    assert_eq!(ok["data"]["assistant"]["id"], "a-1");
    assert_eq!(ok["data"]["assistant"]["model"], "gpt-4o-mini");
    h.stop().await;
}

#[tokio::test]
async fn token_change_is_refused() {
    let mut h = spawn_worker(fast_config(None));
    h.send("start", polling_bot()).await;
    h.expect("started").await;

    h.send("hot_reload", json!({ "config": { "token": "999:OTHER" } }))
        .await;
    h.expect("hot_reload_failed").await;

    h.send("hot_reload", json!({ "config": { "token": "123:ABC" } }))
        .await;
    h.expect("hot_reloaded").await;
    h.stop().await;
}

#[tokio::test]
async fn reload_before_start_fails() {
    let mut h = spawn_worker(fast_config(None));
    h.send("hot_reload", json!({ "assistant": { "name": "Bea" } }))
        .await;
    h.expect("hot_reload_failed").await;
    h.stop().await;
}

#[tokio::test]
async fn restart_without_payload_keeps_reloaded_content() {
    let mut h = spawn_worker(fast_config(None));
    h.send("start", polling_bot()).await;
    h.expect("started").await;

    h.send("hot_reload", json!({ "assistant": { "name": "Bea" } }))
        .await;
    h.expect("hot_reloaded").await;

    h.send("restart", Value::Null).await;
    h.expect("stopped").await;
    h.expect("started").await;
    assert_eq!(h.status().await["assistant"]["name"], "Bea");
    h.stop().await;
}

#[tokio::test]
async fn assistant_change_clears_dedup_cache() {
    // Backend rejects everything; each message just ends in an error event.
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dialogs"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&backend)
        .await;

    let mut h = spawn_worker(fast_config(Some(&backend.uri())));
    h.send("start", polling_bot()).await;
    h.expect("started").await;

    h.rec.inject(text_message(7, 42, "hi")).await;
    assert_eq!(h.expect("error").await["data"]["kind"], "dialog_bridge_error");
    assert_eq!(h.status().await["dedup_entries"], 1);

    // Same assistant: entries survive.
    h.send("hot_reload", json!({ "assistant": { "name": "Bea" } }))
        .await;
    h.expect("hot_reloaded").await;
    assert_eq!(h.status().await["dedup_entries"], 1);

    // New assistant: cache cleared, so the same message is new again.
    h.send("hot_reload", json!({ "assistant": { "id": "a-2" } }))
        .await;
    h.expect("hot_reloaded").await;
    assert_eq!(h.status().await["dedup_entries"], 0);

    h.rec.inject(text_message(7, 42, "hi")).await;
    h.expect("error").await;
    let metrics = h.metrics().await;
    assert_eq!(metrics["duplicates_suppressed"], 0);
    h.stop().await;
}
