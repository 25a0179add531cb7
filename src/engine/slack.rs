// Lucy Engine — Slack Bridge
//
// Two halves:
//   • SlackClient — Web API calls (chat.postMessage, reactions.add,
//     conversations.replies, auth.test).
//   • Socket Mode listener — outbound WebSocket, no public URL. Envelopes
//     are acknowledged within Slack's 3-second window, message events are
//     mapped to explicit ChatEvent records at the boundary, and the
//     connection reconnects with escalating backoff capped at 120s.
//
// The transport itself is a collaborator: everything downstream consumes
// ChatEvent/ChatPost records, never raw Slack JSON.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChatEvent, ChatPost};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// Anything that can deliver a post to the chat platform. The cron
/// scheduler and the pipeline both talk to this; tests swap in a
/// collecting stub.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn deliver(&self, post: ChatPost) -> EngineResult<()>;
}

// ── Web API client ─────────────────────────────────────────────────────────

pub struct SlackClient {
    http: reqwest::Client,
    bot_token: String,
}

impl SlackClient {
    pub fn new(bot_token: &str) -> Self {
        SlackClient {
            http: reqwest::Client::new(),
            bot_token: bot_token.to_string(),
        }
    }

    async fn call(&self, method: &str, body: Value) -> EngineResult<Value> {
        let response = self
            .http
            .post(format!("https://slack.com/api/{}", method))
            .header("Authorization", format!("Bearer {}", self.bot_token))
            .json(&body)
            .send()
            .await?;
        let data: Value = response.json().await?;
        if !data["ok"].as_bool().unwrap_or(false) {
            return Err(EngineError::Channel(format!(
                "{} error: {}",
                method,
                data["error"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(data)
    }

    /// Identify the bot user (and implicitly validate the token).
    pub async fn auth_test(&self) -> EngineResult<(String, String)> {
        let data = self.call("auth.test", json!({})).await?;
        Ok((
            data["user_id"].as_str().unwrap_or_default().to_string(),
            data["team_id"].as_str().unwrap_or_default().to_string(),
        ))
    }

    pub async fn post_message(&self, post: &ChatPost) -> EngineResult<String> {
        let mut body = json!({ "channel": post.channel });
        if let Some(text) = &post.text {
            body["text"] = json!(text);
        }
        if let Some(blocks) = &post.blocks {
            body["blocks"] = blocks.clone();
        }
        if let Some(thread_ts) = &post.thread_ts {
            body["thread_ts"] = json!(thread_ts);
        }
        let data = self.call("chat.postMessage", body).await?;
        Ok(data["ts"].as_str().unwrap_or_default().to_string())
    }

    pub async fn add_reaction(&self, channel: &str, ts: &str, emoji: &str) -> EngineResult<()> {
        self.call(
            "reactions.add",
            json!({ "channel": channel, "timestamp": ts, "name": emoji }),
        )
        .await
        .map(|_| ())
    }

    /// Load a thread's history as (user_id, text) pairs, oldest first.
    pub async fn fetch_thread(
        &self,
        channel: &str,
        thread_ts: &str,
        limit: u32,
    ) -> EngineResult<Vec<(String, String)>> {
        let response = self
            .http
            .get("https://slack.com/api/conversations.replies")
            .header("Authorization", format!("Bearer {}", self.bot_token))
            .query(&[
                ("channel", channel),
                ("ts", thread_ts),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await?;
        let data: Value = response.json().await?;
        if !data["ok"].as_bool().unwrap_or(false) {
            return Err(EngineError::Channel(format!(
                "conversations.replies error: {}",
                data["error"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(data["messages"]
            .as_array()
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| {
                        (
                            m["user"].as_str().unwrap_or_default().to_string(),
                            m["text"].as_str().unwrap_or_default().to_string(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChatSink for SlackClient {
    async fn deliver(&self, post: ChatPost) -> EngineResult<()> {
        self.post_message(&post).await.map(|_| ())
    }
}

// ── Event extraction ───────────────────────────────────────────────────────

/// Map a Socket Mode events_api payload to a ChatEvent. Returns None for
/// anything that shouldn't reach the pipeline: bot echoes, edits/joins
/// (subtypes), empty text, non-message events.
pub fn extract_event(payload: &Value, bot_user_id: &str) -> Option<ChatEvent> {
    let event = &payload["event"];
    let event_type = event["type"].as_str().unwrap_or_default();
    if event_type != "message" && event_type != "app_mention" {
        return None;
    }
    if event["bot_id"].is_string() || event["subtype"].is_string() {
        return None;
    }

    let user_id = event["user"].as_str().unwrap_or_default();
    let mut text = event["text"].as_str().unwrap_or_default().to_string();
    if user_id.is_empty() || user_id == bot_user_id {
        return None;
    }

    // Strip the bot mention so the classifier sees clean text.
    let mention = format!("<@{}>", bot_user_id);
    text = text.replace(&mention, "").trim().to_string();

    let channel_type = event["channel_type"].as_str().unwrap_or_default();
    let is_dm = channel_type == "im";
    if !is_dm && event_type != "app_mention" {
        return None;
    }

    Some(ChatEvent {
        team_id: payload["team_id"].as_str().unwrap_or_default().to_string(),
        channel_id: event["channel"].as_str().unwrap_or_default().to_string(),
        user_id: user_id.to_string(),
        ts: event["ts"].as_str().unwrap_or_default().to_string(),
        thread_ts: event["thread_ts"].as_str().map(String::from),
        text,
    })
}

// ── Socket Mode listener ───────────────────────────────────────────────────

/// What the listener hands each extracted event to.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: ChatEvent);
}

pub struct SocketModeListener {
    bot_token: String,
    app_token: String,
    handler: Arc<dyn EventHandler>,
    stop: Arc<AtomicBool>,
    message_count: AtomicU64,
}

impl SocketModeListener {
    pub fn new(bot_token: &str, app_token: &str, handler: Arc<dyn EventHandler>) -> Self {
        SocketModeListener {
            bot_token: bot_token.to_string(),
            app_token: app_token.to_string(),
            handler,
            stop: Arc::new(AtomicBool::new(false)),
            message_count: AtomicU64::new(0),
        }
    }

    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Events forwarded to the pipeline since startup.
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Run the bridge until stopped: connect, read, reconnect on error
    /// with escalating backoff.
    pub async fn run(&self) -> EngineResult<()> {
        if self.bot_token.is_empty() || self.app_token.is_empty() {
            return Err(EngineError::Config(
                "Bot token and app token are both required for Socket Mode".into(),
            ));
        }

        let mut reconnect_attempt: u32 = 0;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            match self.run_connection().await {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    error!("[slack] Bridge error: {} — reconnecting", e);
                    let delay = crate::engine::http::reconnect_delay(reconnect_attempt).await;
                    warn!(
                        "[slack] Reconnecting in {}ms (attempt {})",
                        delay.as_millis(),
                        reconnect_attempt + 1
                    );
                    reconnect_attempt += 1;
                }
            }
        }
        info!("[slack] Bridge stopped");
        Ok(())
    }

    async fn run_connection(&self) -> EngineResult<()> {
        let client = SlackClient::new(&self.bot_token);
        let (bot_user_id, team_id) = client.auth_test().await?;
        info!("[slack] Authenticated as {} (team {})", bot_user_id, team_id);

        let ws_url = self.open_socket_url().await?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| EngineError::Channel(format!("WS connect failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();
        info!("[slack] Socket Mode connected");

        while let Some(message) = read.next().await {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            let text = match message {
                Ok(WsMessage::Text(t)) => t,
                Ok(WsMessage::Close(_)) => {
                    info!("[slack] WS closed");
                    break;
                }
                Ok(WsMessage::Ping(data)) => {
                    let _ = write.send(WsMessage::Pong(data)).await;
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("[slack] WS read error: {}", e);
                    break;
                }
            };

            let envelope: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            };

            // Slack requires an ack within 3 seconds of every envelope.
            if let Some(envelope_id) = envelope["envelope_id"].as_str() {
                let ack = json!({ "envelope_id": envelope_id });
                let _ = write.send(WsMessage::Text(ack.to_string())).await;
            }

            match envelope["type"].as_str().unwrap_or_default() {
                "events_api" => {
                    if let Some(event) = extract_event(&envelope["payload"], &bot_user_id) {
                        self.message_count.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "[slack] Event from {} in {}: {}",
                            event.user_id,
                            event.channel_id,
                            crate::atoms::types::truncate_utf8(&event.text, 50)
                        );
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            handler.handle(event).await;
                        });
                    }
                }
                "disconnect" => {
                    info!(
                        "[slack] Disconnect event, reason: {}",
                        envelope["reason"].as_str().unwrap_or("?")
                    );
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn open_socket_url(&self) -> EngineResult<String> {
        let response = reqwest::Client::new()
            .post("https://slack.com/api/apps.connections.open")
            .header("Authorization", format!("Bearer {}", self.app_token))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .send()
            .await?;
        let body: Value = response.json().await?;
        if !body["ok"].as_bool().unwrap_or(false) {
            return Err(EngineError::Channel(format!(
                "connections.open error: {}",
                body["error"].as_str().unwrap_or("unknown")
            )));
        }
        body["url"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| EngineError::Channel("No URL returned from connections.open".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(event: Value) -> Value {
        json!({ "team_id": "T1", "event": event })
    }

    #[test]
    fn test_extract_dm_event() {
        let event = extract_event(
            &payload(json!({
                "type": "message",
                "channel_type": "im",
                "channel": "D1",
                "user": "U1",
                "ts": "1726000000.000100",
                "text": "hello there",
            })),
            "UBOT",
        )
        .unwrap();
        assert_eq!(event.team_id, "T1");
        assert_eq!(event.channel_id, "D1");
        assert_eq!(event.text, "hello there");
        assert!(event.thread_ts.is_none());
    }

    #[test]
    fn test_mention_stripped() {
        let event = extract_event(
            &payload(json!({
                "type": "app_mention",
                "channel": "C1",
                "user": "U1",
                "ts": "1.0",
                "text": "<@UBOT> check my calendar",
            })),
            "UBOT",
        )
        .unwrap();
        assert_eq!(event.text, "check my calendar");
    }

    #[test]
    fn test_bot_and_subtype_events_dropped() {
        assert!(extract_event(
            &payload(json!({"type": "message", "channel_type": "im", "bot_id": "B1", "user": "U1", "ts": "1.0", "text": "x"})),
            "UBOT"
        )
        .is_none());
        assert!(extract_event(
            &payload(json!({"type": "message", "channel_type": "im", "subtype": "message_changed", "user": "U1", "ts": "1.0", "text": "x"})),
            "UBOT"
        )
        .is_none());
        assert!(extract_event(
            &payload(json!({"type": "message", "channel_type": "im", "user": "UBOT", "ts": "1.0", "text": "self"})),
            "UBOT"
        )
        .is_none());
    }

    #[test]
    fn test_channel_message_without_mention_dropped() {
        assert!(extract_event(
            &payload(json!({"type": "message", "channel_type": "channel", "user": "U1", "ts": "1.0", "text": "chatter"})),
            "UBOT"
        )
        .is_none());
    }

    #[test]
    fn test_thread_ts_carried() {
        let event = extract_event(
            &payload(json!({
                "type": "message",
                "channel_type": "im",
                "channel": "D1",
                "user": "U1",
                "ts": "2.0",
                "thread_ts": "1.0",
                "text": "follow up",
            })),
            "UBOT",
        )
        .unwrap();
        assert_eq!(event.thread_ts.as_deref(), Some("1.0"));
        assert_eq!(event.thread_ref(), "1.0");
    }
}
