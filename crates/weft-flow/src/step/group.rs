use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use weft_core::error::{Result, WeftError};

use super::{run_step, Step, StepConfig, StepInput, StepKind, StepMeta, StepOutput};

/// A named sequence of steps run as one, each fed the previous content.
pub struct StepsGroup {
    meta: StepMeta,
    steps: Vec<Arc<dyn Step>>,
}

impl StepsGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: StepMeta::new(name),
            steps: Vec::new(),
        }
    }

    pub fn add_step(mut self, step: impl Step) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.meta.config = config;
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Step for StepsGroup {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        &self.meta.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Steps
    }

    fn config(&self) -> &StepConfig {
        &self.meta.config
    }

    fn execute(&self, cancel: CancellationToken, input: StepInput) -> BoxStream<'_, Result<StepOutput>> {
        stream::once(async move {
            let started = StepOutput::begin(self);
            let mut outputs = Vec::with_capacity(self.steps.len());
            let mut current = input;

            for step in &self.steps {
                let out = run_step(step.as_ref(), &cancel, current.clone())
                    .await
                    .map_err(|e| match e {
                        WeftError::Cancelled => e,
                        other => WeftError::Step {
                            step: self.meta.name.clone(),
                            message: format!("step {} failed: {other}", step.name()),
                        },
                    })?;
                current = current.chained(&out);
                outputs.push(out);
            }

            let content = outputs.last().map(|o| o.content.clone()).unwrap_or(Value::Null);
            Ok(started
                .with_content(content)
                .with_metadata("completed", json!(outputs.len()))
                .with_metadata("total", json!(self.steps.len()))
                .with_nested(outputs)
                .finish())
        })
        .boxed()
    }
}
