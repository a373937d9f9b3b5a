use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_core::error::Result;

use super::{run_step, Step, StepConfig, StepInput, StepKind, StepMeta, StepOutput};
use crate::graph::expression::Expression;
use crate::graph::variables::Variables;

type Predicate = dyn Fn(&StepInput) -> bool + Send + Sync;

/// Runs exactly one of two steps depending on a predicate.
pub struct ConditionStep {
    meta: StepMeta,
    predicate: Arc<Predicate>,
    if_true: Arc<dyn Step>,
    if_false: Arc<dyn Step>,
}

impl ConditionStep {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&StepInput) -> bool + Send + Sync + 'static,
        if_true: impl Step,
        if_false: impl Step,
    ) -> Self {
        Self {
            meta: StepMeta::new(name),
            predicate: Arc::new(predicate),
            if_true: Arc::new(if_true),
            if_false: Arc::new(if_false),
        }
    }

    /// Branch on an expression over the input's additional data and session
    /// state, plus `input` and `previous`. An evaluation error takes the
    /// false branch.
    pub fn expression(
        name: impl Into<String>,
        source: &str,
        if_true: impl Step,
        if_false: impl Step,
    ) -> Result<Self> {
        let expr = Expression::parse(source)?;
        Ok(Self::new(
            name,
            move |input| {
                let mut vars: Variables = input
                    .session_state
                    .iter()
                    .chain(&input.additional_data)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                vars.set("input", input.input.clone());
                vars.set("previous", input.current().clone());
                expr.evaluate(&vars).unwrap_or_else(|e| {
                    warn!(expression = %expr.source(), error = %e, "Step condition failed to evaluate");
                    false
                })
            },
            if_true,
            if_false,
        ))
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.meta.config = config;
        self
    }
}

impl Step for ConditionStep {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        &self.meta.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Condition
    }

    fn config(&self) -> &StepConfig {
        &self.meta.config
    }

    fn execute(&self, cancel: CancellationToken, input: StepInput) -> BoxStream<'_, Result<StepOutput>> {
        stream::once(async move {
            let started = StepOutput::begin(self);
            let taken = (self.predicate)(&input);
            let branch = if taken { &self.if_true } else { &self.if_false };
            debug!(step = %self.meta.name, branch = taken, target = %branch.name(), "Condition branch selected");

            let inner = run_step(branch.as_ref(), &cancel, input).await?;
            Ok(started
                .with_content(inner.content.clone())
                .with_metadata("branch", json!(taken.to_string()))
                .with_metadata("selected_step", json!(branch.name()))
                .with_nested(vec![inner])
                .finish())
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::FunctionStep;

    fn branches() -> (FunctionStep, FunctionStep) {
        (
            FunctionStep::new("yes", |_| Ok(json!("took yes"))),
            FunctionStep::new("no", |_| Ok(json!("took no"))),
        )
    }

    #[tokio::test]
    async fn test_predicate_selects_branch() {
        let (yes, no) = branches();
        let step = ConditionStep::new("check", |i| i.input == json!("go"), yes, no);

        let out = run_step(&step, &CancellationToken::new(), StepInput::new("go")).await.unwrap();
        assert_eq!(out.content, json!("took yes"));
        assert_eq!(out.metadata["branch"], json!("true"));
        assert_eq!(out.nested.len(), 1);

        let out = run_step(&step, &CancellationToken::new(), StepInput::new("stop")).await.unwrap();
        assert_eq!(out.metadata["branch"], json!("false"));
        assert_eq!(out.nested[0].step_name, "no");
    }

    #[tokio::test]
    async fn test_expression_over_additional_data() {
        let (yes, no) = branches();
        let step = ConditionStep::expression("score", "score >= 80", yes, no).unwrap();

        let input = StepInput::new("x").with_data("score", json!(91));
        let out = run_step(&step, &CancellationToken::new(), input).await.unwrap();
        assert_eq!(out.content, json!("took yes"));

        // Missing variable evaluates as an error and takes the false branch.
        let out = run_step(&step, &CancellationToken::new(), StepInput::new("x")).await.unwrap();
        assert_eq!(out.content, json!("took no"));
    }

    #[test]
    fn test_malformed_expression_rejected() {
        let (yes, no) = branches();
        assert!(ConditionStep::expression("bad", "score >", yes, no).is_err());
    }
}
