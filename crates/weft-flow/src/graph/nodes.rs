//! Per-type node behaviour. One `match` over [`NodeKind`] decides what a node
//! does; the engine around it handles retries, timeouts and bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::types::{AgentOutput, AgentRef, RunStatus};

use super::definition::{ConditionDef, LoopDef, LoopType, NodeDef, NodeKind, ParallelDef};
use super::execution::{NodeResult, WorkflowExecution};
use super::expression::Expression;
use super::join::{fan_out, Branch};
use super::variables::{value_to_text, Variables};
use crate::coordinator::{NodeDispatcher, TaskRequest};

/// What a node needs from the engine while it runs.
pub(crate) struct NodeContext<'a> {
    pub execution: &'a Arc<WorkflowExecution>,
    pub dispatcher: &'a Arc<dyn NodeDispatcher>,
    /// Per agent call.
    pub timeout: Duration,
    /// Branch limit when the node does not set one.
    pub max_concurrency: Option<usize>,
}

impl NodeContext<'_> {
    fn request(&self, node: &NodeDef, worker_key: String, agent: &AgentRef, input: String) -> TaskRequest {
        TaskRequest {
            execution_id: self.execution.id().to_string(),
            worker_key,
            node_id: node.id.clone(),
            node_name: node.label().to_string(),
            agent: agent.clone(),
            input,
            timeout: self.timeout,
            cancel: self.execution.cancel_token().clone(),
        }
    }
}

/// Build the input message for an agent from the variable bag.
///
/// One input mapping sends the mapped value as is; several send sorted
/// `key: value` lines, leaving out unset variables. Without mappings the
/// `message` or `input` variable is used, else the whole bag as JSON.
pub fn build_message(agent: &AgentRef, vars: &Variables) -> String {
    if agent.inputs.len() == 1 {
        if let Some(value) = agent.inputs.values().next().and_then(|path| vars.lookup(path)) {
            return value_to_text(value);
        }
    } else if !agent.inputs.is_empty() {
        let mut keys: Vec<&String> = agent.inputs.keys().collect();
        keys.sort();
        return keys
            .into_iter()
            .filter_map(|key| {
                let value = vars.lookup(&agent.inputs[key])?;
                Some(format!("{}: {}", key, value_to_text(value)))
            })
            .collect::<Vec<_>>()
            .join("\n");
    }

    for key in ["message", "input"] {
        if let Some(value) = vars.get(key) {
            return value_to_text(value);
        }
    }
    serde_json::to_string(vars.data()).unwrap_or_default()
}

fn output_map(out: &AgentOutput) -> HashMap<String, Value> {
    let mut outputs: HashMap<String, Value> = out.metadata.clone();
    outputs.insert("content".into(), json!(out.content));
    outputs
}

/// Run one attempt of `node`, filling `record` with its inputs, outputs and
/// child traces.
pub(crate) async fn execute_node(
    ctx: &NodeContext<'_>,
    node: &NodeDef,
    record: &mut NodeResult,
) -> Result<()> {
    record.outputs.clear();
    record.children.clear();

    match &node.kind {
        NodeKind::Start => {
            record
                .outputs
                .insert("started_at".into(), json!(Utc::now().to_rfc3339()));
            Ok(())
        }
        NodeKind::End => {
            let outputs = collect_outputs(ctx.execution);
            ctx.execution.set_outputs(outputs.clone());
            record.outputs = outputs;
            Ok(())
        }
        NodeKind::Task { agent } => run_task(ctx, node, agent, record).await,
        NodeKind::Condition { condition } => run_condition(ctx, node, condition, record),
        NodeKind::Loop { spec } => run_loop(ctx, node, spec, record).await,
        NodeKind::Parallel { parallel } => run_parallel(ctx, node, parallel, record).await,
        NodeKind::Merge => Ok(()),
    }
}

/// Declared outputs read from the bag (defaults fill gaps), or the whole bag
/// when the workflow declares none.
fn collect_outputs(execution: &WorkflowExecution) -> HashMap<String, Value> {
    let vars = execution.variables();
    let declared = &execution.definition().outputs;
    if declared.is_empty() {
        return vars.into_inner();
    }
    declared
        .iter()
        .filter_map(|decl| {
            let value = vars.lookup(&decl.name).cloned().or_else(|| decl.default.clone())?;
            Some((decl.name.clone(), value))
        })
        .collect()
}

async fn run_task(
    ctx: &NodeContext<'_>,
    node: &NodeDef,
    agent: &AgentRef,
    record: &mut NodeResult,
) -> Result<()> {
    let message = build_message(agent, &ctx.execution.variables());
    record.inputs.insert("message".into(), json!(message));

    let request = ctx.request(node, node.id.clone(), agent, message);
    let out = ctx.dispatcher.dispatch(request).await?;
    let outputs = output_map(&out);

    ctx.execution.update_variables(|vars| {
        vars.apply_outputs(&agent.outputs, &outputs);
        vars.set(format!("{}_output", node.id), json!(out.content));
    });
    record.outputs = outputs;
    Ok(())
}

fn run_condition(
    ctx: &NodeContext<'_>,
    node: &NodeDef,
    condition: &ConditionDef,
    record: &mut NodeResult,
) -> Result<()> {
    let result = condition.evaluate(&ctx.execution.variables())?;
    debug!(node_id = %node.id, result, "Condition evaluated");
    ctx.execution
        .update_variables(|vars| vars.set(format!("{}_result", node.id), json!(result)));
    record.outputs.insert("result".into(), json!(result));
    Ok(())
}

async fn run_loop(
    ctx: &NodeContext<'_>,
    node: &NodeDef,
    spec: &LoopDef,
    record: &mut NodeResult,
) -> Result<()> {
    let invalid = |msg: String| WeftError::node(&node.id, node.label(), msg, false);

    let condition = match (&spec.condition, spec.kind) {
        (Some(src), _) => Some(Expression::parse(src)?),
        (None, LoopType::While | LoopType::Until) => {
            return Err(invalid(format!("{:?} loop needs a condition", spec.kind).to_lowercase()))
        }
        (None, _) => None,
    };

    let items = if spec.kind == LoopType::ForEach {
        let path = spec
            .iterator
            .as_deref()
            .ok_or_else(|| invalid("foreach loop needs an iterator".into()))?;
        match ctx.execution.variables().lookup(path) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => return Err(invalid(format!("iterator {} is not an array: {}", path, other))),
            None => return Err(invalid(format!("iterator {} is not set", path))),
        }
    } else {
        Vec::new()
    };

    let mut input = build_message(&spec.body, &ctx.execution.variables());
    record.inputs.insert("message".into(), json!(input));
    let mut results = Vec::new();

    for i in 0..spec.max_loops as usize {
        match spec.kind {
            LoopType::ForEach => {
                let Some(item) = items.get(i) else { break };
                input = value_to_text(item);
                if let Some(var) = &spec.variable {
                    ctx.execution.update_variables(|v| v.set(var.clone(), item.clone()));
                }
            }
            LoopType::While => {
                if let Some(cond) = &condition {
                    if !cond.evaluate(&ctx.execution.variables())? {
                        break;
                    }
                }
            }
            LoopType::For | LoopType::Until => {}
        }
        if spec.kind != LoopType::ForEach {
            if let Some(var) = &spec.variable {
                ctx.execution.update_variables(|v| v.set(var.clone(), json!(i)));
            }
        }

        let mut iteration = NodeResult::named(&format!("{}#{}", node.id, i), node.label(), "iteration");
        iteration.inputs.insert("message".into(), json!(input));
        let request = ctx.request(node, node.id.clone(), &spec.body, input.clone());
        let out = match ctx.dispatcher.dispatch(request).await {
            Ok(out) => out,
            Err(e) => {
                iteration.error = Some(e.to_string());
                iteration.finish(RunStatus::Failed);
                record.children.push(iteration);
                return Err(e);
            }
        };
        let outputs = output_map(&out);
        ctx.execution.update_variables(|vars| {
            vars.apply_outputs(&spec.body.outputs, &outputs);
            vars.set(format!("{}_output", node.id), json!(out.content));
        });
        iteration.outputs = outputs;
        iteration.finish(RunStatus::Completed);
        record.children.push(iteration);

        results.push(json!(out.content));
        input = out.content;

        if spec.kind == LoopType::Until {
            if let Some(cond) = &condition {
                if cond.evaluate(&ctx.execution.variables())? {
                    break;
                }
            }
        }
    }

    debug!(node_id = %node.id, iterations = results.len(), "Loop finished");
    record.outputs.insert("iterations".into(), json!(results.len()));
    record.outputs.insert(
        "content".into(),
        results.last().cloned().unwrap_or_else(|| json!("")),
    );
    record.outputs.insert("results".into(), Value::Array(results));
    Ok(())
}

async fn run_parallel(
    ctx: &NodeContext<'_>,
    node: &NodeDef,
    parallel: &ParallelDef,
    record: &mut NodeResult,
) -> Result<()> {
    let vars = ctx.execution.variables();
    let branches: Vec<Branch> = parallel
        .branches
        .iter()
        .map(|b| Branch {
            id: b.id.clone(),
            name: if b.name.is_empty() { b.id.clone() } else { b.name.clone() },
            request: ctx.request(
                node,
                format!("{}-{}", node.id, b.id),
                &b.agent,
                build_message(&b.agent, &vars),
            ),
        })
        .collect();
    let limit = parallel
        .max_concurrency
        .or(ctx.max_concurrency)
        .unwrap_or(branches.len());

    let (outcome, children) = fan_out(
        ctx.dispatcher.clone(),
        node,
        branches,
        parallel.join,
        limit,
        ctx.execution.cancel_token(),
    )
    .await;
    record.children = children;
    let outputs = outcome?;

    ctx.execution.update_variables(|vars| {
        for branch in &parallel.branches {
            let content = outputs.get("results").and_then(|r| r.get(&branch.id));
            if let Some(content) = content {
                let branch_out = HashMap::from([("content".to_string(), content.clone())]);
                vars.apply_outputs(&branch.agent.outputs, &branch_out);
            }
        }
        if let Some(content) = outputs.get("content") {
            vars.set(format!("{}_output", node.id), content.clone());
        }
    });
    record.outputs = outputs;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InlineDispatcher;
    use crate::graph::builder::WorkflowBuilder;
    use crate::graph::definition::{BranchDef, JoinType, VarType, VariableDef};
    use tokio_util::sync::CancellationToken;
    use weft_test_utils::{EchoAgent, MockAgentFactory, ScriptedAgent, UpperAgent};

    fn execution(vars: Variables, outputs: Vec<VariableDef>) -> Arc<WorkflowExecution> {
        let mut builder = WorkflowBuilder::new("wf", "wf")
            .add_start_node("s")
            .add_end_node("e")
            .add_edge("s", "e");
        for out in outputs {
            builder = builder.add_output(out);
        }
        Arc::new(WorkflowExecution::new(
            "exec-1",
            Arc::new(builder.build()),
            vars,
            CancellationToken::new(),
        ))
    }

    fn dispatcher() -> Arc<dyn NodeDispatcher> {
        let factory = MockAgentFactory::new()
            .with_agent("echo", Arc::new(EchoAgent::new()))
            .with_agent("upper", Arc::new(UpperAgent))
            .with_agent("counter", Arc::new(ScriptedAgent::new(vec!["1", "2", "3", "4"])));
        Arc::new(InlineDispatcher::new(Arc::new(factory)))
    }

    async fn run(exec: &Arc<WorkflowExecution>, node: &NodeDef) -> Result<NodeResult> {
        let dispatcher = dispatcher();
        let ctx = NodeContext {
            execution: exec,
            dispatcher: &dispatcher,
            timeout: Duration::from_secs(5),
            max_concurrency: None,
        };
        let mut record = NodeResult::started(node);
        execute_node(&ctx, node, &mut record).await?;
        Ok(record)
    }

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_build_message() {
        let v = vars(&[
            ("topic", json!("rust")),
            ("count", json!(3)),
            ("message", json!("fallback")),
        ]);
        let one = AgentRef::new("echo").with_input("q", "topic");
        assert_eq!(build_message(&one, &v), "rust");

        let many = AgentRef::new("echo")
            .with_input("topic", "topic")
            .with_input("count", "count")
            .with_input("missing", "ghost");
        assert_eq!(build_message(&many, &v), "count: 3\ntopic: rust");

        assert_eq!(build_message(&AgentRef::new("echo"), &v), "fallback");

        let bag = vars(&[("a", json!(1))]);
        assert_eq!(build_message(&AgentRef::new("echo"), &bag), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_task_applies_output_mappings() {
        let exec = execution(vars(&[("message", json!("hello"))]), vec![]);
        let node = NodeDef::new(
            "shout",
            "Shout",
            NodeKind::Task {
                agent: AgentRef::new("upper").with_output("loud", "content"),
            },
        );
        let record = run(&exec, &node).await.unwrap();
        assert_eq!(record.content(), Some(&json!("HELLO")));
        let v = exec.variables();
        assert_eq!(v.get("loud"), Some(&json!("HELLO")));
        assert_eq!(v.get("shout_output"), Some(&json!("HELLO")));
    }

    #[tokio::test]
    async fn test_condition_sets_result_variable() {
        let exec = execution(vars(&[("priority", json!(7))]), vec![]);
        let node = NodeDef::new(
            "check",
            "Check",
            NodeKind::Condition {
                condition: ConditionDef::expression("priority >= 5"),
            },
        );
        let record = run(&exec, &node).await.unwrap();
        assert_eq!(record.outputs["result"], json!(true));
        assert_eq!(exec.variables().get("check_result"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_end_collects_declared_outputs() {
        let exec = execution(
            vars(&[("result", json!("done")), ("noise", json!(1))]),
            vec![
                VariableDef::new("result", VarType::String),
                VariableDef::new("status", VarType::String).with_default(json!("ok")),
                VariableDef::new("absent", VarType::String),
            ],
        );
        let node = NodeDef::new("e", "End", NodeKind::End);
        let record = run(&exec, &node).await.unwrap();
        assert_eq!(record.outputs.len(), 2);
        assert_eq!(exec.result().outputs["status"], json!("ok"));
    }

    #[tokio::test]
    async fn test_for_loop_feeds_output_forward() {
        let exec = execution(vars(&[("message", json!("go"))]), vec![]);
        let node = NodeDef::new(
            "repeat",
            "Repeat",
            NodeKind::Loop {
                spec: LoopDef::new(LoopType::For, AgentRef::new("upper")).with_max_loops(3),
            },
        );
        let record = run(&exec, &node).await.unwrap();
        assert_eq!(record.outputs["iterations"], json!(3));
        assert_eq!(record.children.len(), 3);
        assert_eq!(record.children[1].inputs["message"], json!("GO"));
    }

    #[tokio::test]
    async fn test_until_loop_stops_on_condition() {
        let exec = execution(Variables::new(), vec![]);
        let node = NodeDef::new(
            "count",
            "Count",
            NodeKind::Loop {
                spec: LoopDef::new(LoopType::Until, AgentRef::new("counter"))
                    .with_condition("count_output >= 3"),
            },
        );
        let record = run(&exec, &node).await.unwrap();
        assert_eq!(record.outputs["iterations"], json!(3));
        assert_eq!(record.outputs["content"], json!("3"));
    }

    #[tokio::test]
    async fn test_while_loop_checks_before_each_iteration() {
        let exec = execution(vars(&[("go", json!(false))]), vec![]);
        let node = NodeDef::new(
            "idle",
            "Idle",
            NodeKind::Loop {
                spec: LoopDef::new(LoopType::While, AgentRef::new("echo")).with_condition("go == true"),
            },
        );
        let record = run(&exec, &node).await.unwrap();
        assert_eq!(record.outputs["iterations"], json!(0));
    }

    #[tokio::test]
    async fn test_foreach_binds_items() {
        let exec = execution(vars(&[("names", json!(["ann", "bob"]))]), vec![]);
        let node = NodeDef::new(
            "each",
            "Each",
            NodeKind::Loop {
                spec: LoopDef::new(LoopType::ForEach, AgentRef::new("upper")).over("names", "name"),
            },
        );
        let record = run(&exec, &node).await.unwrap();
        assert_eq!(record.outputs["results"], json!(["ANN", "BOB"]));
        assert_eq!(exec.variables().get("name"), Some(&json!("bob")));

        let exec = execution(vars(&[("names", json!("nope"))]), vec![]);
        assert!(run(&exec, &node).await.is_err());
    }

    #[tokio::test]
    async fn test_parallel_maps_branch_outputs() {
        let exec = execution(vars(&[("message", json!("hi"))]), vec![]);
        let node = NodeDef::new(
            "fan",
            "Fan",
            NodeKind::Parallel {
                parallel: ParallelDef::new(
                    JoinType::Wait,
                    vec![
                        BranchDef::new("a", AgentRef::new("echo").with_output("from_a", "content")),
                        BranchDef::new("b", AgentRef::new("upper").with_output("from_b", "content")),
                    ],
                ),
            },
        );
        let record = run(&exec, &node).await.unwrap();
        assert_eq!(record.children.len(), 2);
        let v = exec.variables();
        assert_eq!(v.get("from_a"), Some(&json!("hi")));
        assert_eq!(v.get("from_b"), Some(&json!("HI")));
    }
}
