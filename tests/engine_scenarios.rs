use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use weft_core::config::WeftConfig;
use weft_core::error::{ErrorKind, WeftError};
use weft_core::event::WorkflowEventKind;
use weft_core::types::RunStatus;
use weft_flow::graph::{
    AgentRef, BranchDef, ConditionDef, ConditionRule, Engine, Expression, JoinType, ParallelDef,
    Variables, WorkflowBuilder, WorkflowDefinition,
};
use weft_test_utils::fixtures::linear_workflow_json;
use weft_test_utils::{EchoAgent, FailingAgent, MockAgentFactory, SlowAgent, UpperAgent};

fn engine() -> Engine {
    let factory = MockAgentFactory::new()
        .with_agent("echo", Arc::new(EchoAgent::new()))
        .with_agent("upper", Arc::new(UpperAgent))
        .with_agent("failing", Arc::new(FailingAgent::new("boom")))
        .with_agent("slow", Arc::new(SlowAgent::new(Duration::from_millis(400))));
    Engine::new(Arc::new(factory), &WeftConfig::default())
}

fn inputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[tokio::test]
async fn test_linear_echo_workflow() {
    let engine = engine();
    let def = WorkflowDefinition::from_json(&linear_workflow_json("echo").to_string()).unwrap();
    engine.register(def).unwrap();

    let result = engine
        .execute("linear", inputs(&[("message", json!("hello"))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output("result"), Some(&json!("hello")));
    let order: Vec<&str> = result.trace.iter().map(|r| r.node_id.as_str()).collect();
    assert_eq!(order, vec!["start", "task", "end"]);
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn test_missing_required_input_is_rejected() {
    let engine = engine();
    let def = WorkflowDefinition::from_json(&linear_workflow_json("echo").to_string()).unwrap();
    let err = engine.start_definition(def, HashMap::new()).unwrap_err();
    assert!(matches!(err, WeftError::Validation(_)));
}

#[tokio::test]
async fn test_condition_routes_to_true_branch() {
    let def = WorkflowBuilder::new("triage", "Triage")
        .add_start_node("start")
        .add_condition_node(
            "check",
            "Check priority",
            ConditionDef::all(vec![ConditionRule::new("priority", ">=", json!(5))]),
        )
        .add_task_node(
            "urgent",
            "Urgent",
            AgentRef::new("upper").with_output("handled", "content"),
        )
        .add_task_node(
            "normal",
            "Normal",
            AgentRef::new("echo").with_output("handled", "content"),
        )
        .add_end_node("end")
        .add_edge("start", "check")
        .add_conditional_edge("check", "urgent", "check_result == true")
        .add_conditional_edge("check", "normal", "check_result == false")
        .add_edge("urgent", "end")
        .add_edge("normal", "end")
        .build();

    let result = engine()
        .execute_definition(
            def,
            inputs(&[("priority", json!(7)), ("message", json!("server down"))]),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.node("urgent").is_some());
    assert!(result.node("normal").is_none());
    assert_eq!(result.output("handled"), Some(&json!("SERVER DOWN")));
    assert_eq!(result.output("check_result"), Some(&json!(true)));
}

#[tokio::test]
async fn test_definition_without_end_fails_validation() {
    let def = WorkflowBuilder::new("open", "Open")
        .add_start_node("start")
        .add_task_node("work", "Work", AgentRef::new("echo"))
        .add_edge("start", "work")
        .build();

    let err = def.validate().unwrap_err();
    assert!(matches!(err, WeftError::Validation(_)));
    assert!(engine().register(def).is_err());
}

#[test]
fn test_compound_expression() {
    let expr = Expression::parse(r#"score > 80 && status == "ready""#).unwrap();

    let vars: Variables = [("score", json!(91)), ("status", json!("ready"))]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    assert!(expr.evaluate(&vars).unwrap());

    let vars: Variables = [("score", json!(91)), ("status", json!("draft"))]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    assert!(!expr.evaluate(&vars).unwrap());
}

#[tokio::test]
async fn test_parallel_wait_fails_when_a_branch_fails() {
    let def = WorkflowBuilder::new("fan", "Fan out")
        .add_start_node("start")
        .add_parallel_node(
            "fan",
            "Fan",
            ParallelDef::new(
                JoinType::Wait,
                vec![
                    BranchDef::new("ok", AgentRef::new("echo")),
                    BranchDef::new("bad", AgentRef::new("failing")),
                ],
            ),
        )
        .add_end_node("end")
        .chain(&["start", "fan", "end"])
        .build();

    let result = engine()
        .execute_definition(def, inputs(&[("message", json!("x"))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(!result.errors.is_empty());
    assert_eq!(result.errors[0].node_id.as_deref(), Some("fan"));
    assert!(result.node("end").is_none());
}

#[tokio::test]
async fn test_parallel_success_join_tolerates_failure() {
    let def = WorkflowBuilder::new("fan", "Fan out")
        .add_start_node("start")
        .add_parallel_node(
            "fan",
            "Fan",
            ParallelDef::new(
                JoinType::Success,
                vec![
                    BranchDef::new("bad", AgentRef::new("failing")),
                    BranchDef::new("ok", AgentRef::new("upper")),
                ],
            ),
        )
        .add_end_node("end")
        .chain(&["start", "fan", "end"])
        .build();

    let result = engine()
        .execute_definition(def, inputs(&[("message", json!("x"))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output("fan_output"), Some(&json!("X")));
}

#[tokio::test]
async fn test_cancel_returns_promptly() {
    let engine = engine();
    let def = WorkflowDefinition::from_json(&linear_workflow_json("slow").to_string()).unwrap();
    let id = engine
        .start_definition(def, inputs(&[("message", json!("x"))]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let began = Instant::now();
    engine.cancel(&id).unwrap();
    let result = engine.wait(&id).await.unwrap();

    assert!(began.elapsed() < Duration::from_millis(200));
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(engine.status(&id).unwrap(), RunStatus::Cancelled);
}

#[tokio::test]
async fn test_pause_holds_next_node_until_resume() {
    let engine = engine();
    let mut events = engine.events().subscribe();
    let def = WorkflowBuilder::new("two", "Two steps")
        .add_start_node("start")
        .add_task_node("first", "First", AgentRef::new("slow"))
        .add_task_node("second", "Second", AgentRef::new("echo"))
        .add_end_node("end")
        .chain(&["start", "first", "second", "end"])
        .build();
    let id = engine
        .start_definition(def, inputs(&[("message", json!("x"))]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.pause(&id).unwrap();
    assert_eq!(engine.status(&id).unwrap(), RunStatus::Paused);

    // The slow node finishes; the next one must not start while paused.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let execution = engine.execution(&id).unwrap();
    assert!(execution.is_completed("first"));
    assert!(!execution.is_completed("second"));

    engine.resume(&id).unwrap();
    let result = engine.wait(&id).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.node("second").is_some());

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&WorkflowEventKind::WorkflowPaused));
    assert!(kinds.contains(&WorkflowEventKind::WorkflowResumed));
}

#[test]
fn test_json_round_trip_preserves_structure() {
    let def = WorkflowDefinition::from_json(&linear_workflow_json("echo").to_string()).unwrap();
    let json = def.to_json().unwrap();
    let back = WorkflowDefinition::from_json(&json).unwrap();

    assert_eq!(back.id, def.id);
    assert_eq!(back.nodes.len(), def.nodes.len());
    assert_eq!(back.edges.len(), def.edges.len());
    assert_eq!(back.inputs[0].name, "message");
    assert!(back.inputs[0].required);
}

#[tokio::test]
async fn test_runs_are_recorded_in_session_history() {
    let engine = engine();
    let def = WorkflowDefinition::from_json(&linear_workflow_json("echo").to_string()).unwrap();
    engine.register(def).unwrap();

    let first = engine
        .execute("linear", inputs(&[("message", json!("one"))]))
        .await
        .unwrap();
    let second = engine
        .execute("linear", inputs(&[("message", json!("two"))]))
        .await
        .unwrap();
    assert_eq!(first.session_id, second.session_id);

    // The history write happens after the terminal status is published.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let session_id = second.session_id.unwrap();
    let session = engine
        .sessions()
        .get_session(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.history.len(), 2);
    assert_eq!(session.history[1].output["result"], json!("two"));
}

fn slow_fan(join: JoinType, templates: &[&str]) -> WorkflowDefinition {
    let branches = templates
        .iter()
        .enumerate()
        .map(|(i, t)| BranchDef::new(format!("b{}", i + 1), AgentRef::new(*t)))
        .collect();
    WorkflowBuilder::new("fan", "Fan out")
        .add_start_node("start")
        .add_parallel_node("fan", "Fan", ParallelDef::new(join, branches))
        .timeout_ms(50)
        .add_end_node("end")
        .chain(&["start", "fan", "end"])
        .build()
}

#[tokio::test]
async fn test_success_join_reports_timeout_when_every_branch_times_out() {
    let result = engine()
        .execute_definition(
            slow_fan(JoinType::Success, &["slow", "slow"]),
            inputs(&[("message", json!("x"))]),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Timeout);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::Timeout);
    assert_eq!(result.errors[0].node_id.as_deref(), Some("fan"));
    let fan = result.node("fan").unwrap();
    assert_eq!(fan.status, RunStatus::Timeout);
    assert!(fan.children.iter().all(|c| c.status == RunStatus::Timeout));
}

#[tokio::test]
async fn test_majority_join_reports_timeout_when_majority_times_out() {
    let result = engine()
        .execute_definition(
            slow_fan(JoinType::Majority, &["echo", "slow", "slow"]),
            inputs(&[("message", json!("x"))]),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Timeout);
    assert_eq!(result.errors[0].kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_cancel_during_success_join_reports_only_cancellation() {
    let engine = engine();
    let mut events = engine.events().subscribe();
    let mut def = slow_fan(JoinType::Success, &["slow", "slow"]);
    // Long enough that only the cancel can end the branches.
    def.nodes[1].timeout_ms = Some(10_000);
    let id = engine
        .start_definition(def, inputs(&[("message", json!("x"))]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    engine.cancel(&id).unwrap();
    engine.wait(&id).await.unwrap();
    // Let the run task record the interrupted node.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let result = engine.execution(&id).unwrap().result();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::Cancellation);
    assert!(result.errors[0].node_id.is_none());
    assert_eq!(result.node("fan").unwrap().status, RunStatus::Cancelled);
    assert!(result.warnings.is_empty());

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(!kinds.contains(&WorkflowEventKind::NodeFailed));
    assert!(kinds.contains(&WorkflowEventKind::WorkflowCancelled));
}

#[tokio::test]
async fn test_skip_on_error_node_lets_run_complete() {
    let def = WorkflowBuilder::new("lenient", "Lenient")
        .add_start_node("start")
        .add_task_node("enrich", "Enrich", AgentRef::new("failing"))
        .skip_on_error()
        .add_task_node(
            "reply",
            "Reply",
            AgentRef::new("upper").with_output("reply", "content"),
        )
        .add_end_node("end")
        .chain(&["start", "enrich", "reply", "end"])
        .build();

    let result = engine()
        .execute_definition(def, inputs(&[("message", json!("still here"))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.errors.is_empty());
    assert_eq!(result.node("enrich").unwrap().status, RunStatus::Skipped);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("enrich"));
    assert!(result.warnings[0].contains("boom"));
    assert_eq!(result.output("reply"), Some(&json!("STILL HERE")));
}

#[tokio::test]
async fn test_node_timeout_surfaces_as_timeout_status() {
    let def = WorkflowBuilder::new("patience", "Patience")
        .add_start_node("start")
        .add_task_node("work", "Work", AgentRef::new("slow"))
        .timeout_ms(50)
        .add_end_node("end")
        .chain(&["start", "work", "end"])
        .build();
    let engine = engine();
    engine.register(def).unwrap();

    let began = Instant::now();
    let result = engine
        .execute("patience", inputs(&[("message", json!("x"))]))
        .await
        .unwrap();

    assert!(began.elapsed() < Duration::from_millis(400));
    assert_eq!(result.status, RunStatus::Timeout);
    assert_eq!(result.errors[0].kind, ErrorKind::Timeout);
    assert_eq!(result.errors[0].node_id.as_deref(), Some("work"));
    assert_eq!(result.node("work").unwrap().status, RunStatus::Timeout);
    assert!(result.node("end").is_none());
}

#[tokio::test]
async fn test_edge_on_undefined_variable_is_pruned() {
    let def = WorkflowBuilder::new("guarded", "Guarded")
        .add_start_node("start")
        .add_task_node(
            "risky",
            "Risky",
            AgentRef::new("upper").with_output("handled", "content"),
        )
        .add_task_node(
            "safe",
            "Safe",
            AgentRef::new("echo").with_output("handled", "content"),
        )
        .add_end_node("end")
        .add_conditional_edge("start", "risky", "ghost > 1")
        .add_edge("start", "safe")
        .add_edge("risky", "end")
        .add_edge("safe", "end")
        .build();

    let result = engine()
        .execute_definition(def, inputs(&[("message", json!("calm"))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.node("risky").is_none());
    assert!(result.node("end").is_some());
    assert_eq!(result.output("handled"), Some(&json!("calm")));
    assert!(result.errors.is_empty());
}
