use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use weft_core::error::Result;

use super::{run_step, Step, StepConfig, StepInput, StepKind, StepMeta, StepOutput};

/// Runs sub-steps concurrently and merges their contents by step name.
pub struct ParallelStep {
    meta: StepMeta,
    steps: Vec<Arc<dyn Step>>,
}

impl ParallelStep {
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
}

impl Step for ParallelStep {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        &self.meta.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Parallel
    }

    fn config(&self) -> &StepConfig {
        &self.meta.config
    }

    fn execute(&self, cancel: CancellationToken, input: StepInput) -> BoxStream<'_, Result<StepOutput>> {
        stream::once(async move {
            let started = StepOutput::begin(self);
            let runs = self
                .steps
                .iter()
                .map(|step| run_step(step.as_ref(), &cancel, input.clone()));
            let results = join_all(runs).await;

            let mut merged = Map::new();
            let mut nested = Vec::with_capacity(results.len());
            for result in results {
                // Skipped sub-steps come back as Ok; anything else aborts.
                let out = result?;
                if !out.skipped {
                    merged.insert(out.step_name.clone(), out.content.clone());
                }
                nested.push(out);
            }

            Ok(started
                .with_content(Value::Object(merged))
                .with_metadata("parallel_steps", json!(self.steps.len()))
                .with_nested(nested)
                .finish())
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{AgentStep, FunctionStep};
    use std::time::{Duration, Instant};
    use weft_core::error::WeftError;
    use weft_test_utils::ScriptedAgent;

    #[tokio::test]
    async fn test_merges_by_step_name() {
        let step = ParallelStep::new("fan")
            .add_step(FunctionStep::new("a", |_| Ok(json!(1))))
            .add_step(FunctionStep::new("b", |_| Ok(json!("two"))))
            .add_step(
                FunctionStep::new("c", |_| Err(WeftError::Agent("flaky".into())))
                    .with_config(StepConfig::default().skip_on_error()),
            );
        let out = run_step(&step, &CancellationToken::new(), StepInput::new("x"))
            .await
            .unwrap();
        assert_eq!(out.content, json!({"a": 1, "b": "two"}));
        assert_eq!(out.nested.len(), 3);
    }

    #[tokio::test]
    async fn test_fails_on_non_skippable_error() {
        let step = ParallelStep::new("fan")
            .add_step(FunctionStep::new("ok", |_| Ok(json!(1))))
            .add_step(FunctionStep::new("bad", |_| Err(WeftError::Agent("broken".into()))));
        let err = run_step(&step, &CancellationToken::new(), StepInput::new("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_sub_steps_run_concurrently() {
        let slow = |name: &str| {
            AgentStep::new(
                name,
                Arc::new(ScriptedAgent::new(vec!["done"]).with_delay(Duration::from_millis(100))),
            )
        };
        let step = ParallelStep::new("fan").add_step(slow("a")).add_step(slow("b")).add_step(slow("c"));
        let start = Instant::now();
        run_step(&step, &CancellationToken::new(), StepInput::new("x"))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(250));
    }
}
