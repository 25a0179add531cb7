// Lucy Engine — Channel Registry
//
// Tracks name, purpose, topic, and sensitivity per channel so Lucy knows
// what each channel is for without asking, respects channel boundaries,
// and never leaks DM content into public channels. Stored per-workspace
// at data/channels.json.

use super::WorkspaceStore;
use crate::atoms::error::EngineResult;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const CHANNELS_FILE: &str = "data/channels.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_dm: bool,
    #[serde(default)]
    pub last_seen: String,
}

pub fn load_channel_registry(ws: &WorkspaceStore) -> EngineResult<BTreeMap<String, ChannelInfo>> {
    match ws.read(CHANNELS_FILE)? {
        Some(text) => Ok(serde_json::from_str(&text).unwrap_or_default()),
        None => Ok(BTreeMap::new()),
    }
}

pub fn save_channel_registry(
    ws: &WorkspaceStore,
    registry: &BTreeMap<String, ChannelInfo>,
) -> EngineResult<()> {
    ws.write(CHANNELS_FILE, &serde_json::to_string_pretty(registry)?)?;
    Ok(())
}

/// Store or update channel metadata. Blank incoming fields keep any
/// previously stored value.
pub fn register_channel(ws: &WorkspaceStore, info: ChannelInfo) -> EngineResult<()> {
    let mut registry = load_channel_registry(ws)?;
    let existing = registry.remove(&info.channel_id).unwrap_or_default();

    let merged = ChannelInfo {
        channel_id: info.channel_id.clone(),
        name: pick(info.name, existing.name),
        purpose: pick(info.purpose, existing.purpose),
        topic: pick(info.topic, existing.topic),
        is_private: info.is_private,
        is_dm: info.is_dm,
        last_seen: Utc::now().to_rfc3339(),
    };
    debug!("[workspace] Channel {} registered", merged.channel_id);
    registry.insert(info.channel_id, merged);
    save_channel_registry(ws, &registry)
}

fn pick(incoming: String, existing: String) -> String {
    if incoming.is_empty() {
        existing
    } else {
        incoming
    }
}

pub fn get_channel_context(ws: &WorkspaceStore, channel_id: &str) -> EngineResult<Option<ChannelInfo>> {
    Ok(load_channel_registry(ws)?.remove(channel_id))
}

/// Format channel context as a prompt snippet. DMs get the hard
/// confidentiality framing.
pub fn format_channel_context_for_prompt(
    ws: &WorkspaceStore,
    channel_id: &str,
) -> EngineResult<String> {
    let Some(ctx) = get_channel_context(ws, channel_id)? else {
        return Ok(String::new());
    };

    if ctx.is_dm {
        return Ok("<channel_context>\n\
                   You are in a private DM. This is a personal 1:1 conversation. \
                   Information shared here MUST NOT be referenced, quoted, or surfaced \
                   in public channels. Treat DM content as confidential.\n\
                   </channel_context>"
            .to_string());
    }

    let mut parts = Vec::new();
    if !ctx.name.is_empty() {
        parts.push(format!("Channel: #{}", ctx.name));
    }
    if !ctx.purpose.is_empty() {
        parts.push(format!("Purpose: {}", ctx.purpose));
    }
    if !ctx.topic.is_empty() {
        parts.push(format!("Topic: {}", ctx.topic));
    }
    if ctx.is_private {
        parts.push("This is a private channel — be mindful of what you surface here.".to_string());
    }
    if parts.is_empty() {
        return Ok(String::new());
    }

    Ok(format!(
        "<channel_context>\n{}\n\
         Respect the channel's purpose. Only post content relevant to this channel.\n\
         </channel_context>",
        parts.join("\n")
    ))
}
