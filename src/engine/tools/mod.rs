// Lucy Engine — Tool Suite
//
// One dispatch surface over three tool families:
//   (a) meta-broker tools (COMPOSIO_*) and direct integration slugs,
//   (b) built-in lucy_* tools,
//   (c) the remote exec gateway (exec / process / read / write / edit /
//       web_fetch / session_status).
//
// Classification by name prefix also drives the per-class timeout budget
// and picks the circuit-breaker service for a call.

pub mod broker;
pub mod builtin;
pub mod gateway;

use crate::atoms::constants::{
    TIMEOUT_DEFAULT_SECS, TIMEOUT_INTEGRATION_SECS, TIMEOUT_LLM_CALL_SECS, TIMEOUT_META_BROKER_SECS,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ToolClass, ToolDefinition};
use crate::engine::workspace::WorkspaceStore;
use broker::BrokerClient;
use builtin::BuiltinTools;
use gateway::GatewayClient;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Integration vendor prefixes (broker tool slugs are upper snake case).
const INTEGRATION_PREFIXES: [&str; 13] = [
    "GOOGLECALENDAR_",
    "GMAIL_",
    "GOOGLEDRIVE_",
    "GOOGLEDOCS_",
    "GOOGLESHEETS_",
    "GITHUB_",
    "LINEAR_",
    "NOTION_",
    "SLACK_",
    "JIRA_",
    "TRELLO_",
    "FIGMA_",
    "ASANA_",
];

const GATEWAY_TOOLS: [&str; 7] = [
    "exec",
    "process",
    "read",
    "write",
    "edit",
    "web_fetch",
    "session_status",
];

/// Classify a tool name into its latency-budget class.
pub fn classify_tool(name: &str) -> ToolClass {
    let upper = name.to_uppercase();
    if upper.starts_with(broker::META_TOOL_PREFIX) {
        return ToolClass::MetaBroker;
    }
    if INTEGRATION_PREFIXES.iter().any(|p| upper.starts_with(p)) {
        return ToolClass::Integration;
    }
    if name == "lucy_web_search" {
        return ToolClass::LlmCall;
    }
    ToolClass::Default
}

/// Timeout budget for a tool class.
pub fn budget_for(class: ToolClass) -> Duration {
    Duration::from_secs(match class {
        ToolClass::MetaBroker => TIMEOUT_META_BROKER_SECS,
        ToolClass::Integration => TIMEOUT_INTEGRATION_SECS,
        ToolClass::LlmCall => TIMEOUT_LLM_CALL_SECS,
        ToolClass::Default => TIMEOUT_DEFAULT_SECS,
    })
}

/// The circuit-breaker service a tool call counts against: the vendor
/// prefix for integrations, "composio" for meta tools, "gateway" for the
/// exec gateway, "lucy" for built-ins.
pub fn service_for(name: &str) -> String {
    let upper = name.to_uppercase();
    if upper.starts_with(broker::META_TOOL_PREFIX) {
        return "composio".into();
    }
    if let Some(prefix) = INTEGRATION_PREFIXES.iter().find(|p| upper.starts_with(*p)) {
        return prefix.trim_end_matches('_').to_lowercase();
    }
    if GATEWAY_TOOLS.contains(&name) {
        return "gateway".into();
    }
    if BuiltinTools::is_builtin(name) {
        return "lucy".into();
    }
    "default".into()
}

pub struct ToolSuite {
    broker: Arc<BrokerClient>,
    gateway: Option<Arc<GatewayClient>>,
    builtin: BuiltinTools,
}

impl ToolSuite {
    pub fn new(
        broker: Arc<BrokerClient>,
        gateway: Option<Arc<GatewayClient>>,
        builtin: BuiltinTools,
    ) -> Self {
        ToolSuite {
            broker,
            gateway,
            builtin,
        }
    }

    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    /// Tool definitions always bound to a run: built-ins plus (when the
    /// broker is configured) the five meta-tools.
    pub fn base_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.builtin.definitions();
        if self.broker.is_configured() {
            defs.extend(self.broker.meta_tool_definitions());
        }
        defs
    }

    /// Execute a tool with no safety rails. The executor wraps this with
    /// dedup, HITL gating, timeouts, the semaphore, and breakers.
    pub async fn execute_raw(
        &self,
        ws: &WorkspaceStore,
        name: &str,
        params: &Value,
    ) -> EngineResult<Value> {
        if BuiltinTools::is_builtin(name) {
            return self.builtin.execute(ws, name, params).await;
        }

        if GATEWAY_TOOLS.contains(&name) {
            let gateway = self.gateway.as_ref().ok_or_else(|| {
                EngineError::Config("Gateway not configured for exec/file tools".into())
            })?;
            return gateway.invoke(name, params.clone()).await;
        }

        // Meta tools and direct integration slugs both execute through
        // the broker, keyed by the workspace as the broker user.
        self.broker.execute(ws.workspace_id(), name, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_by_prefix() {
        assert_eq!(classify_tool("COMPOSIO_SEARCH_TOOLS"), ToolClass::MetaBroker);
        assert_eq!(classify_tool("GOOGLECALENDAR_EVENTS_LIST"), ToolClass::Integration);
        assert_eq!(classify_tool("GMAIL_SEND_EMAIL"), ToolClass::Integration);
        assert_eq!(classify_tool("lucy_web_search"), ToolClass::LlmCall);
        assert_eq!(classify_tool("exec"), ToolClass::Default);
        assert_eq!(classify_tool("lucy_create_cron"), ToolClass::Default);
    }

    #[test]
    fn test_budgets() {
        assert_eq!(budget_for(ToolClass::MetaBroker), Duration::from_secs(45));
        assert_eq!(budget_for(ToolClass::Integration), Duration::from_secs(20));
        assert_eq!(budget_for(ToolClass::LlmCall), Duration::from_secs(90));
        assert_eq!(budget_for(ToolClass::Default), Duration::from_secs(30));
    }

    #[test]
    fn test_service_names() {
        assert_eq!(service_for("COMPOSIO_MULTI_EXECUTE_TOOL"), "composio");
        assert_eq!(service_for("GOOGLECALENDAR_EVENTS_LIST"), "googlecalendar");
        assert_eq!(service_for("exec"), "gateway");
        assert_eq!(service_for("lucy_create_cron"), "lucy");
        assert_eq!(service_for("SOMETHING_ELSE"), "default");
    }
}
