use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};

use super::{run_step, Step, StepConfig, StepInput, StepKind, StepMeta, StepOutput};

type RouteSelector = dyn Fn(&StepInput) -> String + Send + Sync;
type ChainSelector = dyn Fn(&StepInput, &[Arc<dyn Step>]) -> Vec<String> + Send + Sync;

/// Dispatches to one named route chosen from the input.
pub struct RouterStep {
    meta: StepMeta,
    selector: Arc<RouteSelector>,
    routes: HashMap<String, Arc<dyn Step>>,
    default: Option<Arc<dyn Step>>,
}

impl RouterStep {
    pub fn new(
        name: impl Into<String>,
        selector: impl Fn(&StepInput) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            meta: StepMeta::new(name),
            selector: Arc::new(selector),
            routes: HashMap::new(),
            default: None,
        }
    }

    pub fn with_route(mut self, key: impl Into<String>, step: impl Step) -> Self {
        self.routes.insert(key.into(), Arc::new(step));
        self
    }

    /// Used when the selected key has no route.
    pub fn with_default(mut self, step: impl Step) -> Self {
        self.default = Some(Arc::new(step));
        self
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.meta.config = config;
        self
    }
}

impl Step for RouterStep {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        &self.meta.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Router
    }

    fn config(&self) -> &StepConfig {
        &self.meta.config
    }

    fn execute(&self, cancel: CancellationToken, input: StepInput) -> BoxStream<'_, Result<StepOutput>> {
        stream::once(async move {
            let started = StepOutput::begin(self);
            let key = (self.selector)(&input);
            let (route, used_default) = match self.routes.get(&key) {
                Some(step) => (step, false),
                None => match &self.default {
                    Some(step) => (step, true),
                    None => return Err(WeftError::RouteNotFound(key)),
                },
            };
            debug!(step = %self.meta.name, route = %key, default = used_default, "Route selected");

            let inner = run_step(route.as_ref(), &cancel, input).await?;
            Ok(started
                .with_content(inner.content.clone())
                .with_metadata("route", json!(key))
                .with_metadata("used_default", json!(used_default))
                .with_metadata("selected_step", json!(route.name()))
                .with_nested(vec![inner])
                .finish())
        })
        .boxed()
    }
}

/// Picks an ordered subset of its choices by name and runs them as a chain,
/// each step seeing the previous one's content.
pub struct Router {
    meta: StepMeta,
    selector: Arc<ChainSelector>,
    choices: Vec<Arc<dyn Step>>,
}

impl Router {
    /// `selector` receives the input and the available choices and returns
    /// the names to run, in order. Unknown names are skipped.
    pub fn new(
        name: impl Into<String>,
        selector: impl Fn(&StepInput, &[Arc<dyn Step>]) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            meta: StepMeta::new(name),
            selector: Arc::new(selector),
            choices: Vec::new(),
        }
    }

    pub fn add_choice(mut self, step: impl Step) -> Self {
        self.choices.push(Arc::new(step));
        self
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.meta.config = config;
        self
    }

    fn choice(&self, name: &str) -> Option<&Arc<dyn Step>> {
        self.choices.iter().find(|s| s.name() == name)
    }
}

impl Step for Router {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        &self.meta.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Router
    }

    fn config(&self) -> &StepConfig {
        &self.meta.config
    }

    fn execute(&self, cancel: CancellationToken, input: StepInput) -> BoxStream<'_, Result<StepOutput>> {
        stream::once(async move {
            let started = StepOutput::begin(self);
            let selected = (self.selector)(&input, &self.choices);
            let names: Vec<&str> = self.choices.iter().map(|s| s.name()).collect();

            let mut chain: Vec<&Arc<dyn Step>> = Vec::with_capacity(selected.len());
            for name in &selected {
                match self.choice(name) {
                    Some(step) => chain.push(step),
                    None => warn!(step = %self.meta.name, selected = %name, "Router selected unknown step"),
                }
            }

            if chain.is_empty() {
                return Ok(started
                    .with_content("no steps selected")
                    .with_metadata("selected_steps", json!(selected))
                    .with_metadata("step_names", json!(names))
                    .finish());
            }

            let mut outputs: Vec<StepOutput> = Vec::with_capacity(chain.len());
            let mut current = input;
            for step in chain {
                match run_step(step.as_ref(), &cancel, current.clone()).await {
                    Ok(out) => {
                        current = current.chained(&out);
                        outputs.push(out);
                    }
                    Err(e) => {
                        warn!(step = %self.meta.name, failed_step = %step.name(), error = %e, "Router chain failed");
                        return Err(WeftError::Step {
                            step: self.meta.name.clone(),
                            message: format!("step {} failed: {e}", step.name()),
                        });
                    }
                }
            }

            let executed: Vec<&str> = outputs.iter().map(|o| o.step_name.as_str()).collect();
            let content = outputs.last().map(|o| o.content.clone()).unwrap_or(Value::Null);
            let out = started
                .with_content(content)
                .with_metadata("selected_steps", json!(selected))
                .with_metadata("executed_steps", json!(executed))
                .with_metadata("step_names", json!(names));
            Ok(out.with_nested(outputs).finish())
        })
        .boxed()
    }
}
