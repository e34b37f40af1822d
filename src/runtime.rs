use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::info;

use crate::catalog::{catalog, verify_catalog};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::llm::ChatClient;
use crate::operations::OperationContext;
use crate::pipeline::TaskPipeline;
use crate::resolver::{ChatCompletionsResolver, PlanResolver};
use crate::sandbox::SandboxGuard;
use crate::server::TaskServer;

pub struct TaskRuntime {
    config: Config,
    pipeline: Arc<TaskPipeline>,
}

impl TaskRuntime {
    pub fn new(config: Config) -> Result<Self> {
        let pipeline = Arc::new(build_pipeline(&config)?);
        Ok(Self { config, pipeline })
    }

    pub fn pipeline(&self) -> Arc<TaskPipeline> {
        Arc::clone(&self.pipeline)
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "starting task runtime (bind={}, sandbox={}, classifier={}, handler_timeout_ms={}, serialize_writes={})",
            self.config.server.bind,
            self.pipeline.guard().root().display(),
            self.config.classifier.endpoint,
            self.config.runtime.handler_timeout_ms,
            self.config.runtime.serialize_writes
        );
        if self.config.classifier.api_key.is_none() {
            info!("no classifier api key configured; requests go out unauthenticated");
        }

        let server = TaskServer::new(self.config.server.clone(), self.pipeline());
        tokio::select! {
            res = server.run() => res,
            _ = signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                Ok(())
            }
        }
    }
}

/// Wires sandbox, chat client, handler context, dispatcher and resolver.
pub fn build_pipeline(config: &Config) -> Result<TaskPipeline> {
    verify_catalog()?;
    let guard = SandboxGuard::new(&config.sandbox.root, &config.sandbox.logical_prefix)?;
    let chat = ChatClient::new(&config.classifier)?;
    let context = OperationContext::new(guard, chat.clone(), config.operations.clone())?;
    let dispatcher = Dispatcher::new(context, &config.runtime);
    let resolver: Arc<dyn PlanResolver> = Arc::new(ChatCompletionsResolver::new(chat));
    info!(operations = catalog().len(), "task pipeline ready");
    Ok(TaskPipeline::new(resolver, dispatcher))
}
