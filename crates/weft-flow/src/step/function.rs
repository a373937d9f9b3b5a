use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use weft_core::error::Result;

use super::{Step, StepConfig, StepInput, StepKind, StepMeta, StepOutput};

type StepFn = dyn Fn(&StepInput) -> Result<Value> + Send + Sync;

/// Wraps a synchronous transformation of the step input.
pub struct FunctionStep {
    meta: StepMeta,
    func: Arc<StepFn>,
}

impl FunctionStep {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&StepInput) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            meta: StepMeta::new(name),
            func: Arc::new(func),
        }
    }

    /// Map the current value (previous content, else the input).
    pub fn transform(
        name: impl Into<String>,
        f: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, move |input| Ok(f(input.current())))
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.meta.config = config;
        self
    }
}

impl Step for FunctionStep {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        &self.meta.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Function
    }

    fn config(&self) -> &StepConfig {
        &self.meta.config
    }

    fn execute(&self, _cancel: CancellationToken, input: StepInput) -> BoxStream<'_, Result<StepOutput>> {
        let started = StepOutput::begin(self);
        let result = (self.func)(&input).map(|content| started.with_content(content).finish());
        stream::once(async move { result }).boxed()
    }
}
