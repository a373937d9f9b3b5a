use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_core::error::{Result, WeftError};
pub use weft_core::types::AgentRef;

use super::expression::{compare, CmpOp};
use super::variables::{value_to_text, Variables};

/// An authored workflow graph. Immutable once built or parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<VariableDef>,
    #[serde(default)]
    pub outputs: Vec<VariableDef>,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<WorkflowConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Declared type of a workflow input or output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl VarType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// A typed input or output declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VarType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl VariableDef {
    pub fn new(name: impl Into<String>, var_type: VarType) -> Self {
        Self {
            name: name.into(),
            var_type,
            description: String::new(),
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryDef>,
    /// Record a failure as a skip and keep traversing.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_on_error: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl NodeDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            timeout_ms: None,
            retry: None,
            skip_on_error: false,
            config: HashMap::new(),
            position: None,
        }
    }

    /// Display name, falling back to the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Canvas position for editors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Node type with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Task {
        agent: AgentRef,
    },
    Condition {
        condition: ConditionDef,
    },
    Loop {
        #[serde(rename = "loop")]
        spec: LoopDef,
    },
    Parallel {
        parallel: ParallelDef,
    },
    Merge,
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Task { .. } => "task",
            Self::Condition { .. } => "condition",
            Self::Loop { .. } => "loop",
            Self::Parallel { .. } => "parallel",
            Self::Merge => "merge",
        }
    }
}

/// How a condition node combines its rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionType {
    #[default]
    And,
    Or,
    Not,
    Custom,
}

/// One `variable operator value` check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub variable: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

impl ConditionRule {
    pub fn new(variable: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Self {
            variable: variable.into(),
            operator: operator.into(),
            value,
        }
    }

    pub fn evaluate(&self, vars: &Variables) -> Result<bool> {
        let actual = vars.lookup(&self.variable).ok_or_else(|| {
            WeftError::ConditionEvaluation(format!("undefined variable: {}", self.variable))
        })?;

        match self.operator.trim().to_ascii_lowercase().as_str() {
            "in" => Ok(member_of(actual, &self.value)),
            "nin" | "not_in" => Ok(!member_of(actual, &self.value)),
            "regex" | "matches" => {
                let pattern = value_to_text(&self.value);
                let re = regex::Regex::new(&pattern).map_err(|e| {
                    WeftError::ConditionEvaluation(format!("invalid regex '{}': {}", pattern, e))
                })?;
                Ok(re.is_match(&value_to_text(actual)))
            }
            op => {
                let op = CmpOp::parse(op).ok_or_else(|| {
                    WeftError::ConditionEvaluation(format!("unknown operator: {}", self.operator))
                })?;
                compare(actual, op, &self.value)
            }
        }
    }
}

fn member_of(needle: &Value, set: &Value) -> bool {
    match set {
        Value::Array(items) => items
            .iter()
            .any(|item| compare(needle, CmpOp::Eq, item).unwrap_or(false)),
        Value::String(list) => {
            let needle = value_to_text(needle);
            list.split(',').any(|part| part.trim() == needle)
        }
        other => compare(needle, CmpOp::Eq, other).unwrap_or(false),
    }
}

/// Payload of a condition node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionDef {
    #[serde(rename = "type", default)]
    pub kind: ConditionType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ConditionRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl ConditionDef {
    /// A condition driven by a single expression.
    pub fn expression(expr: impl Into<String>) -> Self {
        Self {
            kind: ConditionType::Custom,
            rules: Vec::new(),
            expression: Some(expr.into()),
        }
    }

    pub fn all(rules: Vec<ConditionRule>) -> Self {
        Self {
            kind: ConditionType::And,
            rules,
            expression: None,
        }
    }

    pub fn any(rules: Vec<ConditionRule>) -> Self {
        Self {
            kind: ConditionType::Or,
            rules,
            expression: None,
        }
    }

    /// Evaluate against the variable bag.
    ///
    /// `Not` negates the custom expression when present, otherwise the
    /// conjunction of the rules. Rules short-circuit like the operators.
    pub fn evaluate(&self, vars: &Variables) -> Result<bool> {
        match self.kind {
            ConditionType::Custom => match &self.expression {
                Some(expr) => super::expression::evaluate(expr, vars),
                None => Err(WeftError::ConditionEvaluation(
                    "custom condition without expression".into(),
                )),
            },
            ConditionType::And => self.all_rules(vars),
            ConditionType::Or => {
                for rule in &self.rules {
                    if rule.evaluate(vars)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ConditionType::Not => match &self.expression {
                Some(expr) => Ok(!super::expression::evaluate(expr, vars)?),
                None => Ok(!self.all_rules(vars)?),
            },
        }
    }

    fn all_rules(&self, vars: &Variables) -> Result<bool> {
        for rule in &self.rules {
            if !rule.evaluate(vars)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Loop flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopType {
    #[default]
    For,
    While,
    Until,
    #[serde(rename = "foreach")]
    ForEach,
}

/// Payload of a loop node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDef {
    #[serde(rename = "type", default)]
    pub kind: LoopType,
    /// Variable bound to the current item (foreach) or index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    /// Variable holding the array a foreach loop walks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterator: Option<String>,
    /// Expression checked before (while) or after (until) each iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    pub body: AgentRef,
}

fn default_max_loops() -> u32 {
    100
}

impl LoopDef {
    pub fn new(kind: LoopType, body: AgentRef) -> Self {
        Self {
            kind,
            variable: None,
            iterator: None,
            condition: None,
            max_loops: default_max_loops(),
            body,
        }
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn with_max_loops(mut self, max: u32) -> Self {
        self.max_loops = max;
        self
    }

    pub fn over(mut self, iterator: impl Into<String>, variable: impl Into<String>) -> Self {
        self.iterator = Some(iterator.into());
        self.variable = Some(variable.into());
        self
    }
}

/// How a parallel node reconciles its branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    /// Every branch must succeed.
    #[default]
    Wait,
    /// The first reply decides, success or failure.
    First,
    /// The first successful reply wins.
    Success,
    /// More than half of the branches must succeed.
    Majority,
}

/// One branch of a parallel node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub agent: AgentRef,
}

impl BranchDef {
    pub fn new(id: impl Into<String>, agent: AgentRef) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent,
        }
    }
}

/// Payload of a parallel node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelDef {
    #[serde(default)]
    pub join: JoinType,
    pub branches: Vec<BranchDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl ParallelDef {
    pub fn new(join: JoinType, branches: Vec<BranchDef>) -> Self {
        Self {
            join,
            branches,
            max_concurrency: None,
        }
    }
}

/// Backoff growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// Retry policy of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDef {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    1
}

impl RetryDef {
    pub fn new(max_attempts: u32, delay_ms: u64, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            delay_ms,
            backoff,
            max_delay_ms: None,
        }
    }

    /// Delay before retry number `attempt` (1-based). Exponential backoff gets
    /// 0.8x to 1.2x jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = match self.backoff {
            Backoff::Fixed => self.delay_ms,
            Backoff::Linear => self.delay_ms.saturating_mul(attempt as u64),
            Backoff::Exponential => self
                .delay_ms
                .saturating_mul(2u64.saturating_pow(attempt - 1)),
        };
        let capped = self.max_delay_ms.map_or(base, |max| base.min(max));
        if self.backoff == Backoff::Exponential && capped > 0 {
            let jitter = 0.8 + rand::random::<f64>() * 0.4;
            return Duration::from_millis((capped as f64 * jitter) as u64);
        }
        Duration::from_millis(capped)
    }
}

/// Workflow-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetryDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
    #[serde(default)]
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Expression that must hold for the edge to be taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl EdgeDef {
    pub fn new(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            label: None,
            condition: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl WorkflowDefinition {
    /// Check structural rules. Every problem found is reported in one error.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.id.trim().is_empty() {
            problems.push("workflow id is required".to_string());
        }
        if self.name.trim().is_empty() {
            problems.push("workflow name is required".to_string());
        }
        if self.nodes.is_empty() {
            problems.push("workflow must have at least one node".to_string());
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                problems.push("node id is required".to_string());
            } else if !seen.insert(node.id.as_str()) {
                problems.push(format!("duplicate node id: {}", node.id));
            }
            match &node.kind {
                NodeKind::Loop { spec } => {
                    let needs_condition = matches!(spec.kind, LoopType::While | LoopType::Until);
                    if needs_condition && spec.condition.as_deref().map_or(true, |c| c.trim().is_empty()) {
                        problems.push(format!("loop node {}: {:?} loop needs a condition", node.id, spec.kind));
                    }
                    if spec.kind == LoopType::ForEach && spec.iterator.is_none() {
                        problems.push(format!("loop node {}: foreach loop needs an iterator", node.id));
                    }
                }
                NodeKind::Parallel { parallel } if parallel.branches.is_empty() => {
                    problems.push(format!("parallel node {} has no branches", node.id));
                }
                _ => {}
            }
        }

        if !self.nodes.is_empty() {
            if !self.nodes.iter().any(|n| matches!(n.kind, NodeKind::Start)) {
                problems.push("workflow must have a start node".to_string());
            }
            if !self.nodes.iter().any(|n| matches!(n.kind, NodeKind::End)) {
                problems.push("workflow must have an end node".to_string());
            }
        }

        for (i, edge) in self.edges.iter().enumerate() {
            let label = if edge.id.is_empty() {
                format!("edge #{}", i)
            } else {
                format!("edge {}", edge.id)
            };
            if edge.from.is_empty() || edge.to.is_empty() {
                problems.push(format!("{}: from and to are required", label));
                continue;
            }
            if !seen.contains(edge.from.as_str()) {
                problems.push(format!("{}: unknown source node {}", label, edge.from));
            }
            if !seen.contains(edge.to.as_str()) {
                problems.push(format!("{}: unknown target node {}", label, edge.to));
            }
        }

        let mut input_names = HashSet::new();
        for input in &self.inputs {
            if !input_names.insert(input.name.as_str()) {
                problems.push(format!("duplicate input: {}", input.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(WeftError::Validation(problems.join("; ")))
        }
    }

    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let def: Self = serde_json::from_str(json)
            .map_err(|e| WeftError::Validation(format!("invalid workflow document: {}", e)))?;
        def.validate()?;
        Ok(def)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// YAML is a declared document format without a parser.
    pub fn from_yaml(_yaml: &str) -> Result<Self> {
        Err(WeftError::Validation(
            "YAML workflow documents are not supported; use JSON".into(),
        ))
    }

    /// Load a workflow document, choosing the format by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            _ => Self::from_json(&content),
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_nodes(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a EdgeDef> {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    /// Check supplied inputs against declarations, applying defaults.
    pub fn resolve_inputs(&self, supplied: HashMap<String, Value>) -> Result<Variables> {
        let mut vars = Variables::from_map(supplied);
        let mut problems = Vec::new();
        for decl in &self.inputs {
            match vars.get(&decl.name) {
                Some(value) => {
                    if !decl.var_type.accepts(value) {
                        problems.push(format!(
                            "input {} expects {:?}, got {}",
                            decl.name, decl.var_type, value
                        ));
                    }
                }
                None => match &decl.default {
                    Some(default) => vars.set(decl.name.clone(), default.clone()),
                    None if decl.required => {
                        problems.push(format!("required input missing: {}", decl.name))
                    }
                    None => {}
                },
            }
        }
        if problems.is_empty() {
            Ok(vars)
        } else {
            Err(WeftError::Validation(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".into(),
            name: "Minimal".into(),
            description: String::new(),
            version: default_version(),
            tags: vec![],
            inputs: vec![],
            outputs: vec![],
            nodes: vec![
                NodeDef::new("start", "Start", NodeKind::Start),
                NodeDef::new("end", "End", NodeKind::End),
            ],
            edges: vec![EdgeDef::new("e1", "start", "end")],
            config: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_valid_minimal() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn test_missing_end_node() {
        let mut def = minimal();
        def.nodes.retain(|n| n.id != "end");
        def.edges.clear();
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("end node"));
    }

    #[test]
    fn test_duplicate_ids_and_dangling_edges() {
        let mut def = minimal();
        def.nodes.push(NodeDef::new("start", "Again", NodeKind::Merge));
        def.edges.push(EdgeDef::new("e2", "start", "ghost"));
        let msg = def.validate().unwrap_err().to_string();
        assert!(msg.contains("duplicate node id: start"));
        assert!(msg.contains("unknown target node ghost"));
    }

    #[test]
    fn test_loop_without_condition_is_rejected() {
        for kind in [LoopType::While, LoopType::Until] {
            let mut def = minimal();
            def.nodes.push(NodeDef::new(
                "again",
                "Again",
                NodeKind::Loop {
                    spec: LoopDef::new(kind, AgentRef::new("echo")),
                },
            ));
            let msg = def.validate().unwrap_err().to_string();
            assert!(msg.contains("loop node again"), "{msg}");
            assert!(msg.contains("needs a condition"));
        }

        let mut def = minimal();
        def.nodes.push(NodeDef::new(
            "again",
            "Again",
            NodeKind::Loop {
                spec: LoopDef::new(LoopType::While, AgentRef::new("echo")).with_condition("n < 3"),
            },
        ));
        def.validate().unwrap();
    }

    #[test]
    fn test_foreach_without_iterator_is_rejected() {
        let mut def = minimal();
        def.nodes.push(NodeDef::new(
            "each",
            "Each",
            NodeKind::Loop {
                spec: LoopDef::new(LoopType::ForEach, AgentRef::new("echo")),
            },
        ));
        assert!(def.validate().unwrap_err().to_string().contains("needs an iterator"));
    }

    #[test]
    fn test_parallel_without_branches_is_rejected() {
        let mut def = minimal();
        def.nodes.push(NodeDef::new(
            "fan",
            "Fan",
            NodeKind::Parallel {
                parallel: ParallelDef::new(JoinType::Wait, vec![]),
            },
        ));
        let err = def.validate().unwrap_err();
        assert!(matches!(err, WeftError::Validation(_)));
        assert!(err.to_string().contains("parallel node fan has no branches"));
    }

    #[test]
    fn test_empty_name_and_nodes() {
        let mut def = minimal();
        def.name = String::new();
        def.nodes.clear();
        def.edges.clear();
        let msg = def.validate().unwrap_err().to_string();
        assert!(msg.contains("name is required"));
        assert!(msg.contains("at least one node"));
    }

    #[test]
    fn test_json_shape_of_nodes() {
        let json = r#"{
            "id": "wf", "name": "Doc",
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "t", "name": "Task", "type": "task", "timeout_ms": 500,
                 "agent": {"template": "echo", "inputs": {"message": "topic"}}},
                {"id": "c", "type": "condition", "condition": {"type": "or",
                 "rules": [{"variable": "n", "operator": "gt", "value": 3}]}},
                {"id": "l", "type": "loop", "loop": {"type": "foreach", "iterator": "items",
                 "variable": "item", "body": {"template": "echo"}}},
                {"id": "p", "type": "parallel", "parallel": {"join": "majority",
                 "branches": [{"id": "a", "agent": {"template": "echo"}}]}},
                {"id": "e", "type": "end"}
            ],
            "edges": [{"id": "e1", "from": "s", "to": "t", "condition": "n > 1"}]
        }"#;
        let def = WorkflowDefinition::from_json(json).unwrap();
        assert_eq!(def.version, "1.0.0");
        assert!(matches!(def.nodes[1].kind, NodeKind::Task { ref agent } if agent.template == "echo"));
        assert_eq!(def.nodes[1].timeout_ms, Some(500));
        match &def.nodes[3].kind {
            NodeKind::Loop { spec } => {
                assert_eq!(spec.kind, LoopType::ForEach);
                assert_eq!(spec.max_loops, 100);
            }
            other => panic!("expected loop, got {:?}", other),
        }
        match &def.nodes[4].kind {
            NodeKind::Parallel { parallel } => assert_eq!(parallel.join, JoinType::Majority),
            other => panic!("expected parallel, got {:?}", other),
        }
        assert_eq!(def.edges[0].condition.as_deref(), Some("n > 1"));
    }

    #[test]
    fn test_round_trip_revalidates() {
        let mut def = minimal();
        def.nodes.insert(
            1,
            NodeDef::new(
                "work",
                "Work",
                NodeKind::Task {
                    agent: AgentRef::new("echo").with_output("result", "content"),
                },
            ),
        );
        def.edges = vec![
            EdgeDef::new("e1", "start", "work"),
            EdgeDef::new("e2", "work", "end").with_condition("result != ''"),
        ];
        def.validate().unwrap();

        let json = def.to_json().unwrap();
        let parsed = WorkflowDefinition::from_json(&json).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_invalid_document_is_validation_error() {
        let err = WorkflowDefinition::from_json("{ not json").unwrap_err();
        assert!(matches!(err, WeftError::Validation(_)));
        let err = WorkflowDefinition::from_json(r#"{"id":"x","name":"x","nodes":[]}"#).unwrap_err();
        assert!(matches!(err, WeftError::Validation(_)));
    }

    #[test]
    fn test_yaml_unsupported() {
        assert!(matches!(
            WorkflowDefinition::from_yaml("id: x").unwrap_err(),
            WeftError::Validation(_)
        ));
    }

    #[test]
    fn test_resolve_inputs() {
        let mut def = minimal();
        def.inputs = vec![
            VariableDef::new("topic", VarType::String).required(),
            VariableDef::new("limit", VarType::Number).with_default(json!(5)),
        ];

        let vars = def
            .resolve_inputs([("topic".to_string(), json!("rust"))].into_iter().collect())
            .unwrap();
        assert_eq!(vars.get("limit"), Some(&json!(5)));

        let err = def.resolve_inputs(HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("required input missing: topic"));

        let err = def
            .resolve_inputs([("topic".to_string(), json!(3))].into_iter().collect())
            .unwrap_err();
        assert!(err.to_string().contains("expects String"));
    }

    #[test]
    fn test_condition_def_modes() {
        let vars: Variables = [
            ("priority".to_string(), json!(7)),
            ("region".to_string(), json!("eu")),
        ]
        .into_iter()
        .collect();

        let and = ConditionDef::all(vec![
            ConditionRule::new("priority", ">=", json!(5)),
            ConditionRule::new("region", "in", json!(["eu", "us"])),
        ]);
        assert!(and.evaluate(&vars).unwrap());

        let or = ConditionDef::any(vec![
            ConditionRule::new("priority", "lt", json!(2)),
            ConditionRule::new("region", "regex", json!("^e")),
        ]);
        assert!(or.evaluate(&vars).unwrap());

        let not = ConditionDef {
            kind: ConditionType::Not,
            rules: vec![ConditionRule::new("region", "nin", json!("eu,us"))],
            expression: None,
        };
        assert!(not.evaluate(&vars).unwrap());

        assert!(ConditionDef::expression("priority >= 5").evaluate(&vars).unwrap());
        assert!(ConditionDef::all(vec![ConditionRule::new("ghost", "eq", json!(1))])
            .evaluate(&vars)
            .is_err());
    }

    #[test]
    fn test_retry_delays() {
        let fixed = RetryDef::new(3, 100, Backoff::Fixed);
        assert_eq!(fixed.delay_for(3), Duration::from_millis(100));

        let linear = RetryDef::new(3, 100, Backoff::Linear);
        assert_eq!(linear.delay_for(3), Duration::from_millis(300));

        let mut exp = RetryDef::new(5, 100, Backoff::Exponential);
        exp.max_delay_ms = Some(250);
        let d = exp.delay_for(4).as_millis();
        assert!((200..=300).contains(&d), "got {}", d);
    }
}
