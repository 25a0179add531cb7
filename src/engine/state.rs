// Lucy Engine — Composition Root
//
// Every client and registry is constructed exactly once here and injected
// into the components that need it. Nothing downstream lazily initializes
// module-level instances; "singleton" is a construction choice made in
// this file, not a contract anything else relies on.

use crate::engine::capability_index::{IndexRegistry, TopKRetriever};
use crate::engine::config::Settings;
use crate::engine::cron::CronScheduler;
use crate::engine::hitl::HitlRegistry;
use crate::engine::http::BreakerRegistry;
use crate::engine::humanize::MessagePools;
use crate::engine::pipeline::MessagePipeline;
use crate::engine::providers::openai::OpenAiProvider;
use crate::engine::providers::ChatProvider;
use crate::engine::router::ModelRouter;
use crate::engine::slack::SlackClient;
use crate::engine::tasks::TaskRegistry;
use crate::engine::tool_executor::ToolExecutor;
use crate::engine::tools::broker::BrokerClient;
use crate::engine::tools::builtin::{BuiltinTools, CronTrigger};
use crate::engine::tools::gateway::GatewayClient;
use crate::engine::tools::ToolSuite;
use crate::atoms::error::EngineResult;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct EngineState {
    pub settings: Settings,
    pub provider: Arc<dyn ChatProvider>,
    pub gateway: Option<Arc<GatewayClient>>,
    pub slack: Arc<SlackClient>,
    pub pools: Arc<MessagePools>,
    pub pipeline: Arc<MessagePipeline>,
    pub scheduler: Arc<CronScheduler>,
    cron_triggers: Mutex<Option<UnboundedReceiver<CronTrigger>>>,
}

impl EngineState {
    pub fn new(settings: Settings) -> EngineResult<Self> {
        let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiProvider::new(
            &settings.openrouter_base_url,
            &settings.openrouter_api_key,
        ));

        let router = Arc::new(ModelRouter::new(
            provider.clone(),
            settings.assets_dir.clone(),
            settings.workspace_root.clone(),
        ));

        let broker = Arc::new(BrokerClient::new(
            &settings.broker_base_url,
            &settings.broker_api_key,
        ));
        if !broker.is_configured() {
            warn!("[state] Broker API key missing — integration tools disabled");
        }

        let gateway = match GatewayClient::new(&settings.gateway_base_url, &settings.gateway_token)
        {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("[state] {}", e);
                None
            }
        };

        let (cron_tx, cron_rx) = tokio::sync::mpsc::unbounded_channel();
        let builtin = BuiltinTools::new(provider.clone(), gateway.clone(), cron_tx);
        let suite = Arc::new(ToolSuite::new(broker.clone(), gateway.clone(), builtin));

        let hitl = Arc::new(HitlRegistry::new());
        let breakers = Arc::new(BreakerRegistry::new());
        let executor = Arc::new(ToolExecutor::new(suite.clone(), hitl.clone(), breakers));
        let retriever = Arc::new(TopKRetriever::new(
            Arc::new(IndexRegistry::new()),
            broker.clone(),
        ));

        let tasks = Arc::new(TaskRegistry::new());
        let pools = Arc::new(MessagePools::new());
        let slack = Arc::new(SlackClient::new(&settings.slack_bot_token));

        let pipeline = Arc::new(MessagePipeline::new(
            settings.workspace_root.clone(),
            Some(settings.assets_dir.join("seeds")),
            settings.assets_dir.clone(),
            router,
            retriever,
            suite,
            executor,
            tasks,
            hitl,
            pools.clone(),
            slack.clone(),
            Some(slack.clone()),
        ));

        let scheduler = Arc::new(CronScheduler::new(
            &settings.workspace_root,
            pipeline.clone(),
            slack.clone(),
        ));

        info!("[state] Engine assembled");
        Ok(EngineState {
            settings,
            provider,
            gateway,
            slack,
            pools,
            pipeline,
            scheduler,
            cron_triggers: Mutex::new(Some(cron_rx)),
        })
    }

    /// Kick off the background machinery: pool warming and the cron
    /// scheduler. Called once after construction.
    pub fn start_background(&self) {
        let pools = self.pools.clone();
        let provider = self.provider.clone();
        tokio::spawn(async move {
            pools.warm(provider).await;
        });

        if let Some(triggers) = self.cron_triggers.lock().take() {
            self.scheduler.clone().start(triggers);
        }
    }

    /// A loop-free sanity check used at startup: can we see the gateway?
    pub async fn probe_gateway(&self) {
        if let Some(gateway) = &self.gateway {
            if gateway.health_check().await {
                info!("[state] Gateway reachable");
            } else {
                warn!("[state] Gateway configured but unreachable");
            }
        }
    }
}
