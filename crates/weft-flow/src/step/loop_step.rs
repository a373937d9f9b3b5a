use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_core::error::{Result, WeftError};

use super::{run_step, Step, StepConfig, StepInput, StepKind, StepMeta, StepOutput};

type StopCondition = dyn Fn(&StepOutput) -> bool + Send + Sync;

/// Re-runs a body step, feeding each iteration's content into the next.
pub struct LoopStep {
    meta: StepMeta,
    body: Arc<dyn Step>,
    max_iterations: usize,
    stop: Option<Arc<StopCondition>>,
}

impl LoopStep {
    pub fn new(name: impl Into<String>, body: impl Step, max_iterations: usize) -> Self {
        Self {
            meta: StepMeta::new(name),
            body: Arc::new(body),
            max_iterations,
            stop: None,
        }
    }

    /// Stop once an iteration's output satisfies `stop`.
    pub fn with_stop_condition(
        mut self,
        stop: impl Fn(&StepOutput) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.stop = Some(Arc::new(stop));
        self
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.meta.config = config;
        self
    }
}

impl Step for LoopStep {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        &self.meta.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Loop
    }

    fn config(&self) -> &StepConfig {
        &self.meta.config
    }

    fn execute(&self, cancel: CancellationToken, input: StepInput) -> BoxStream<'_, Result<StepOutput>> {
        stream::once(async move {
            let started = StepOutput::begin(self);
            let mut iterations: Vec<StepOutput> = Vec::new();

            for i in 0..self.max_iterations {
                if cancel.is_cancelled() {
                    return Err(WeftError::Cancelled);
                }
                let iteration_input = match iterations.last() {
                    Some(last) => input.chained(last),
                    None => input.clone(),
                };
                let out = run_step(self.body.as_ref(), &cancel, iteration_input).await?;
                let stop = self.stop.as_ref().is_some_and(|stop| stop(&out));
                iterations.push(out);
                if stop {
                    debug!(step = %self.meta.name, iteration = i + 1, "Loop stop condition met");
                    break;
                }
                // Let timers and cancellation run between synchronous bodies.
                tokio::task::yield_now().await;
            }

            let content = iterations
                .last()
                .map(|o| o.content.clone())
                .unwrap_or(Value::Null);
            Ok(started
                .with_content(content)
                .with_metadata("iterations", json!(iterations.len()))
                .with_metadata("max_iterations", json!(self.max_iterations))
                .with_nested(iterations)
                .finish())
        })
        .boxed()
    }
}
