use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::catalog::catalog;
use crate::dispatcher::Dispatcher;
use crate::envelope::ResultEnvelope;
use crate::error::PipelineError;
use crate::resolver::PlanResolver;
use crate::sandbox::SandboxGuard;

/// Task text in, one result envelope out.
pub struct TaskPipeline {
    resolver: Arc<dyn PlanResolver>,
    dispatcher: Dispatcher,
}

impl TaskPipeline {
    pub fn new(resolver: Arc<dyn PlanResolver>, dispatcher: Dispatcher) -> Self {
        Self {
            resolver,
            dispatcher,
        }
    }

    pub fn guard(&self) -> &SandboxGuard {
        self.dispatcher.guard()
    }

    pub async fn run(&self, task: &str) -> ResultEnvelope {
        let task = task.trim();
        if task.is_empty() {
            return PipelineError::invalid_argument("task is required").into();
        }
        let started = Instant::now();

        let plan = match self.resolver.resolve(task, catalog()).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(code = err.code.as_str(), "task classification failed: {}", err.message);
                return err.into();
            }
        };
        info!(operation = %plan.operation_name, "task classified");

        let envelope = self.dispatcher.dispatch_plan(plan).await;
        info!(
            success = envelope.is_success(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task finished"
        );
        envelope
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::catalog::OperationSpec;
    use crate::error::PipelineResult;
    use crate::resolver::{Plan, PlanResolver};

    /// Answers every task with a fixed plan or error and records the tasks.
    pub struct StubResolver {
        answer: PipelineResult<Plan>,
        pub seen: Mutex<Vec<String>>,
    }

    impl StubResolver {
        pub fn new(answer: PipelineResult<Plan>) -> Self {
            Self {
                answer,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PlanResolver for StubResolver {
        async fn resolve(&self, task: &str, catalog: &[OperationSpec]) -> PipelineResult<Plan> {
            assert!(!catalog.is_empty());
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(task.to_owned());
            }
            self.answer.clone()
        }
    }
}
