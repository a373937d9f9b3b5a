//! Agents that pick another agent to run.
//!
//! Each branching agent is itself an [`AgentExecutor`], so it can sit behind a
//! task node. Targets are [`AgentRef`]s resolved through the shared
//! [`AgentFactory`] only once selected. The event sequence starts with one
//! system event per selected target, followed by that target's own events.
//!
//! Expressions see the caller's variables plus `input` and `message` (both
//! the raw message) and, when the message is a JSON object, its top-level
//! fields.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::traits::{AgentExecutor, AgentFactory};
use weft_core::types::{AgentEvent, AgentRef};

use crate::graph::expression::Expression;
use crate::graph::variables::{value_to_text, Variables};

/// One candidate branch: a guard expression and the agent it selects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchCondition {
    pub name: String,
    pub condition: String,
    pub agent: AgentRef,
    /// Higher runs first; ties keep declaration order.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl BranchCondition {
    pub fn new(name: impl Into<String>, condition: impl Into<String>, agent: AgentRef) -> Self {
        Self {
            name: name.into(),
            condition: condition.into(),
            agent,
            priority: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    branch: BranchCondition,
    expr: Expression,
}

impl Candidate {
    fn matches(&self, owner: &str, vars: &Variables) -> bool {
        self.expr.evaluate(vars).unwrap_or_else(|e| {
            warn!(agent = %owner, branch = %self.branch.name, error = %e, "Branch condition failed to evaluate, skipping");
            false
        })
    }
}

/// Parse every guard up front and order by descending priority.
fn compile(conditions: Vec<BranchCondition>) -> Result<Vec<Candidate>> {
    let mut candidates = conditions
        .into_iter()
        .map(|branch| {
            let expr = Expression::parse(&branch.condition).map_err(|e| {
                WeftError::Validation(format!("branch {}: {e}", branch.name))
            })?;
            Ok(Candidate { branch, expr })
        })
        .collect::<Result<Vec<_>>>()?;
    // sort_by is stable
    candidates.sort_by(|a, b| b.branch.priority.cmp(&a.branch.priority));
    Ok(candidates)
}

fn require_name(name: &str, what: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(WeftError::Validation(format!("{what} name is required")));
    }
    Ok(())
}

/// Variables an expression sees for `message`.
fn message_variables(base: &HashMap<String, Value>, message: &str) -> Variables {
    let mut vars = Variables::from_map(base.clone());
    if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(message) {
        for (k, v) in fields {
            vars.set(k, v);
        }
    }
    vars.set_str("input", message);
    vars.set_str("message", message);
    vars
}

fn failed(err: WeftError) -> BoxStream<'static, Result<AgentEvent>> {
    stream::once(async move { Err(err) }).boxed()
}

/// Emit `notice`, then resolve `target` and forward its events.
fn run_target(
    factory: Arc<dyn AgentFactory>,
    target: AgentRef,
    notice: AgentEvent,
    cancel: CancellationToken,
    message: String,
) -> BoxStream<'static, Result<AgentEvent>> {
    let body = stream::once(async move {
        let agent = factory.create_agent(&target, &target.config).await?;
        Ok::<_, WeftError>(agent.execute(cancel, message))
    })
    .try_flatten();
    stream::iter([Ok(notice)]).chain(body).boxed()
}

fn target_label(agent: &AgentRef) -> &str {
    if agent.id.is_empty() {
        &agent.template
    } else {
        &agent.id
    }
}

// ---------------------------------------------------------------------------
// Conditional

/// Runs the first matching branch in priority order, else the default.
pub struct ConditionalAgent {
    name: String,
    candidates: Vec<Candidate>,
    default: Option<AgentRef>,
    variables: HashMap<String, Value>,
    factory: Arc<dyn AgentFactory>,
}

impl ConditionalAgent {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn AgentFactory>,
        conditions: Vec<BranchCondition>,
    ) -> Result<Self> {
        let name = name.into();
        require_name(&name, "conditional agent")?;
        if conditions.is_empty() {
            return Err(WeftError::Validation("at least one condition is required".into()));
        }
        Ok(Self {
            name,
            candidates: compile(conditions)?,
            default: None,
            variables: HashMap::new(),
            factory,
        })
    }

    pub fn with_default(mut self, agent: AgentRef) -> Self {
        self.default = Some(agent);
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    fn select(&self, message: &str) -> Result<(AgentRef, AgentEvent)> {
        let vars = message_variables(&self.variables, message);
        if let Some(c) = self.candidates.iter().find(|c| c.matches(&self.name, &vars)) {
            let notice = AgentEvent::system(format!(
                "Condition matched: {} -> {}",
                c.branch.condition, c.branch.name
            ))
            .with_metadata("branch_type", json!("conditional"))
            .with_metadata("branch_name", json!(c.branch.name))
            .with_metadata("agent_id", json!(target_label(&c.branch.agent)));
            return Ok((c.branch.agent.clone(), notice));
        }
        let default = self.default.as_ref().ok_or_else(|| {
            WeftError::ConditionEvaluation(format!(
                "{}: no condition matched and no default branch",
                self.name
            ))
        })?;
        let notice = AgentEvent::system(format!(
            "No condition matched, using default branch: {}",
            target_label(default)
        ))
        .with_metadata("branch_type", json!("default"))
        .with_metadata("agent_id", json!(target_label(default)));
        Ok((default.clone(), notice))
    }
}

impl AgentExecutor for ConditionalAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        match self.select(&input) {
            Ok((target, notice)) => {
                debug!(agent = %self.name, target = %target_label(&target), "Conditional branch selected");
                run_target(self.factory.clone(), target, notice, cancel, input)
            }
            Err(e) => failed(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel conditional

/// How a [`ParallelConditionalAgent`] acts on its matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelStrategy {
    /// Run the highest-priority match.
    #[default]
    First,
    /// Run every match in priority order.
    All,
    /// Run the target chosen by the most matches.
    Majority,
}

/// Evaluates every guard against the same variables, then runs per
/// [`ParallelStrategy`].
pub struct ParallelConditionalAgent {
    name: String,
    candidates: Arc<Vec<Candidate>>,
    default: Option<AgentRef>,
    variables: HashMap<String, Value>,
    strategy: ParallelStrategy,
    factory: Arc<dyn AgentFactory>,
}

impl ParallelConditionalAgent {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn AgentFactory>,
        conditions: Vec<BranchCondition>,
    ) -> Result<Self> {
        let name = name.into();
        require_name(&name, "parallel conditional agent")?;
        if conditions.is_empty() {
            return Err(WeftError::Validation("at least one condition is required".into()));
        }
        let candidates = compile(conditions)?;
        Ok(Self {
            name,
            candidates: Arc::new(candidates),
            default: None,
            variables: HashMap::new(),
            strategy: ParallelStrategy::default(),
            factory,
        })
    }

    pub fn with_strategy(mut self, strategy: ParallelStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_default(mut self, agent: AgentRef) -> Self {
        self.default = Some(agent);
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }
}

/// Indices of matching candidates, in priority order.
fn evaluate_all(owner: &str, candidates: &[Candidate], vars: &Variables) -> Vec<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.matches(owner, vars))
        .map(|(idx, _)| idx)
        .collect()
}

/// The candidate whose target most matches agree on; ties go to the
/// higher-priority target.
fn majority_pick(candidates: &[Candidate], matched: &[usize]) -> usize {
    let mut tally: Vec<(&str, usize, usize)> = Vec::new();
    for &idx in matched {
        let label = target_label(&candidates[idx].branch.agent);
        match tally.iter_mut().find(|(l, _, _)| *l == label) {
            Some(entry) => entry.1 += 1,
            None => tally.push((label, 1, idx)),
        }
    }
    // max_by_key keeps the last maximum; iterate reversed to keep the first.
    tally
        .iter()
        .rev()
        .max_by_key(|(_, votes, _)| *votes)
        .map(|(_, _, first)| *first)
        .unwrap_or(matched[0])
}

impl AgentExecutor for ParallelConditionalAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        let name = self.name.clone();
        let candidates = self.candidates.clone();
        let default = self.default.clone();
        let vars = message_variables(&self.variables, &input);
        let strategy = self.strategy;
        let factory = self.factory.clone();

        stream::once(async move {
            if cancel.is_cancelled() {
                return Err(WeftError::Cancelled);
            }
            let matched = evaluate_all(&name, &candidates, &vars);

            if matched.is_empty() {
                let default = default.ok_or_else(|| {
                    WeftError::ConditionEvaluation(format!(
                        "{name}: no condition matched and no default branch"
                    ))
                })?;
                let notice = AgentEvent::system(format!(
                    "No conditions matched, using default branch: {}",
                    target_label(&default)
                ))
                .with_metadata("branch_type", json!("default"));
                return Ok(run_target(factory, default, notice, cancel, input));
            }

            let chosen: Vec<usize> = match strategy {
                ParallelStrategy::First => vec![matched[0]],
                ParallelStrategy::All => matched.clone(),
                ParallelStrategy::Majority => vec![majority_pick(&candidates, &matched)],
            };
            debug!(agent = %name, matched = matched.len(), selected = chosen.len(), ?strategy, "Parallel conditions evaluated");

            let runs: Vec<_> = chosen
                .into_iter()
                .map(|idx| {
                    let branch = &candidates[idx].branch;
                    let notice = AgentEvent::system(format!(
                        "Condition matched: {} -> {}",
                        branch.condition, branch.name
                    ))
                    .with_metadata("branch_type", json!("conditional"))
                    .with_metadata("branch_name", json!(branch.name))
                    .with_metadata("matched", json!(matched.len()));
                    run_target(factory.clone(), branch.agent.clone(), notice, cancel.clone(), input.clone())
                })
                .collect();
            // Sequential: each target's events end before the next starts.
            Ok(stream::iter(runs).flatten().boxed())
        })
        .try_flatten()
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Switch

/// One switch arm. `value` matches case-insensitively and may be a
/// comma-separated list, `*`, or a `/regex/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub name: String,
    pub value: String,
    pub agent: AgentRef,
    /// Continue to the next arm's target instead of stopping here.
    #[serde(default)]
    pub fallthrough: bool,
}

impl SwitchCase {
    pub fn new(name: impl Into<String>, value: impl Into<String>, agent: AgentRef) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            agent,
            fallthrough: false,
        }
    }

    pub fn fallthrough(mut self) -> Self {
        self.fallthrough = true;
        self
    }
}

#[derive(Debug)]
enum CaseMatcher {
    Any,
    Values(Vec<String>),
    Pattern(Regex),
}

impl CaseMatcher {
    fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value == "*" {
            return Ok(Self::Any);
        }
        if value.len() >= 2 && value.starts_with('/') && value.ends_with('/') {
            let re = Regex::new(&value[1..value.len() - 1])
                .map_err(|e| WeftError::Validation(format!("invalid case pattern {value}: {e}")))?;
            return Ok(Self::Pattern(re));
        }
        Ok(Self::Values(
            value.split(',').map(|v| v.trim().to_lowercase()).collect(),
        ))
    }

    fn matches(&self, actual: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Values(values) => {
                let actual = actual.to_lowercase();
                values.iter().any(|v| *v == actual)
            }
            Self::Pattern(re) => re.is_match(actual),
        }
    }
}

/// Selects a target by matching one value against ordered cases.
pub struct SwitchAgent {
    name: String,
    variable: String,
    cases: Vec<(SwitchCase, CaseMatcher)>,
    default: Option<AgentRef>,
    factory: Arc<dyn AgentFactory>,
}

impl SwitchAgent {
    /// `variable` names the JSON field of the message to switch on; a message
    /// that is not an object carrying it is switched on as a whole.
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn AgentFactory>,
        variable: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let variable = variable.into();
        require_name(&name, "switch agent")?;
        if variable.trim().is_empty() {
            return Err(WeftError::Validation("switch variable is required".into()));
        }
        Ok(Self {
            name,
            variable,
            cases: Vec::new(),
            default: None,
            factory,
        })
    }

    pub fn with_case(mut self, case: SwitchCase) -> Result<Self> {
        let matcher = CaseMatcher::parse(&case.value)?;
        self.cases.push((case, matcher));
        Ok(self)
    }

    pub fn with_default(mut self, agent: AgentRef) -> Self {
        self.default = Some(agent);
        self
    }

    fn switch_value(&self, message: &str) -> String {
        match serde_json::from_str::<Value>(message) {
            Ok(Value::Object(fields)) => match fields.get(&self.variable) {
                Some(v) => value_to_text(v),
                None => message.trim().to_string(),
            },
            _ => message.trim().to_string(),
        }
    }

    fn select(&self, message: &str) -> Result<(AgentRef, AgentEvent)> {
        let value = self.switch_value(message);
        let Some(mut idx) = self.cases.iter().position(|(_, m)| m.matches(&value)) else {
            let default = self.default.as_ref().ok_or_else(|| {
                WeftError::RouteNotFound(format!("{} = {value}", self.variable))
            })?;
            let notice = AgentEvent::system(format!(
                "No case matched for {} = {value}, using default: {}",
                self.variable,
                target_label(default)
            ))
            .with_metadata("switch_type", json!("default"))
            .with_metadata("value", json!(value));
            return Ok((default.clone(), notice));
        };

        let mut path = vec![self.cases[idx].0.name.clone()];
        while self.cases[idx].0.fallthrough && idx + 1 < self.cases.len() {
            idx += 1;
            path.push(self.cases[idx].0.name.clone());
        }
        let case = &self.cases[idx].0;
        let notice = AgentEvent::system(format!(
            "Switch matched: {} == {value} -> {}",
            self.variable, case.name
        ))
        .with_metadata("switch_type", json!("switch"))
        .with_metadata("case_name", json!(case.name))
        .with_metadata("cases", json!(path));
        Ok((case.agent.clone(), notice))
    }
}

impl AgentExecutor for SwitchAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        match self.select(&input) {
            Ok((target, notice)) => run_target(self.factory.clone(), target, notice, cancel, input),
            Err(e) => failed(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Multi-level

/// What a level falls back to when none of its conditions match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElseBranch {
    Target(AgentRef),
    Levels(Vec<ConditionLevel>),
}

/// A group of conditions with an optional else-branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionLevel {
    pub name: String,
    pub conditions: Vec<BranchCondition>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<ElseBranch>,
}

impl ConditionLevel {
    pub fn new(name: impl Into<String>, conditions: Vec<BranchCondition>) -> Self {
        Self {
            name: name.into(),
            conditions,
            otherwise: None,
        }
    }

    pub fn with_else(mut self, otherwise: ElseBranch) -> Self {
        self.otherwise = Some(otherwise);
        self
    }
}

struct CompiledLevel {
    name: String,
    candidates: Vec<Candidate>,
    otherwise: Option<CompiledElse>,
}

enum CompiledElse {
    Target(AgentRef),
    Levels(Vec<CompiledLevel>),
}

fn compile_levels(levels: Vec<ConditionLevel>) -> Result<Vec<CompiledLevel>> {
    levels
        .into_iter()
        .map(|level| {
            let otherwise = match level.otherwise {
                None => None,
                Some(ElseBranch::Target(agent)) => Some(CompiledElse::Target(agent)),
                Some(ElseBranch::Levels(nested)) => Some(CompiledElse::Levels(compile_levels(nested)?)),
            };
            Ok(CompiledLevel {
                name: level.name,
                candidates: compile(level.conditions)?,
                otherwise,
            })
        })
        .collect()
}

/// Walks levels of conditions; see [`ConditionLevel`].
pub struct MultiLevelConditionalAgent {
    name: String,
    levels: Vec<CompiledLevel>,
    variables: HashMap<String, Value>,
    factory: Arc<dyn AgentFactory>,
}

impl MultiLevelConditionalAgent {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn AgentFactory>,
        levels: Vec<ConditionLevel>,
    ) -> Result<Self> {
        let name = name.into();
        require_name(&name, "multi-level conditional agent")?;
        if levels.is_empty() {
            return Err(WeftError::Validation("at least one level is required".into()));
        }
        Ok(Self {
            name,
            levels: compile_levels(levels)?,
            variables: HashMap::new(),
            factory,
        })
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// First target reached; `path` collects the levels walked into.
    fn walk<'a>(&'a self, levels: &'a [CompiledLevel], vars: &Variables, path: &mut Vec<String>) -> Option<(&'a AgentRef, String)> {
        for level in levels {
            path.push(level.name.clone());
            if let Some(c) = level.candidates.iter().find(|c| c.matches(&self.name, vars)) {
                return Some((&c.branch.agent, c.branch.name.clone()));
            }
            match &level.otherwise {
                Some(CompiledElse::Target(agent)) => return Some((agent, format!("{} else", level.name))),
                Some(CompiledElse::Levels(nested)) => {
                    if let Some(found) = self.walk(nested, vars, path) {
                        return Some(found);
                    }
                }
                None => {}
            }
        }
        None
    }
}

impl AgentExecutor for MultiLevelConditionalAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, cancel: CancellationToken, input: String) -> BoxStream<'static, Result<AgentEvent>> {
        let vars = message_variables(&self.variables, &input);
        let mut path = Vec::new();
        match self.walk(&self.levels, &vars, &mut path) {
            Some((target, branch)) => {
                let notice = AgentEvent::system(format!("Level {} matched: {branch}", path.join(" > ")))
                    .with_metadata("conditional_type", json!("multi_level"))
                    .with_metadata("levels", json!(path))
                    .with_metadata("branch_name", json!(branch));
                run_target(self.factory.clone(), target.clone(), notice, cancel, input)
            }
            None => failed(WeftError::ConditionEvaluation(format!(
                "{}: no level matched",
                self.name
            ))),
        }
    }
}
