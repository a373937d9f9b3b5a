use std::collections::HashMap;

use serde_json::Value;

use super::definition::*;

/// Incrementally assembles a [`WorkflowDefinition`].
///
/// The builder does not validate; call [`WorkflowDefinition::validate`] or
/// hand the result to the engine, which validates on registration.
pub struct WorkflowBuilder {
    def: WorkflowDefinition,
    edge_seq: usize,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            def: WorkflowDefinition {
                id: id.into(),
                name: name.into(),
                description: String::new(),
                version: "1.0.0".to_string(),
                tags: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                nodes: Vec::new(),
                edges: Vec::new(),
                config: None,
                metadata: HashMap::new(),
            },
            edge_seq: 0,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.def.description = description.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.def.version = version.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.def.tags.push(tag.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.def.metadata.insert(key.into(), value);
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.def.config = Some(config);
        self
    }

    pub fn add_input(mut self, input: VariableDef) -> Self {
        self.def.inputs.push(input);
        self
    }

    pub fn add_output(mut self, output: VariableDef) -> Self {
        self.def.outputs.push(output);
        self
    }

    /// Add a fully specified node.
    pub fn add_node(mut self, node: NodeDef) -> Self {
        self.def.nodes.push(node);
        self
    }

    pub fn add_start_node(self, id: impl Into<String>) -> Self {
        self.add_node(NodeDef::new(id, "Start", NodeKind::Start))
    }

    pub fn add_end_node(self, id: impl Into<String>) -> Self {
        self.add_node(NodeDef::new(id, "End", NodeKind::End))
    }

    pub fn add_task_node(
        self,
        id: impl Into<String>,
        name: impl Into<String>,
        agent: AgentRef,
    ) -> Self {
        self.add_node(NodeDef::new(id, name, NodeKind::Task { agent }))
    }

    pub fn add_condition_node(
        self,
        id: impl Into<String>,
        name: impl Into<String>,
        condition: ConditionDef,
    ) -> Self {
        self.add_node(NodeDef::new(id, name, NodeKind::Condition { condition }))
    }

    pub fn add_loop_node(self, id: impl Into<String>, name: impl Into<String>, spec: LoopDef) -> Self {
        self.add_node(NodeDef::new(id, name, NodeKind::Loop { spec }))
    }

    pub fn add_parallel_node(
        self,
        id: impl Into<String>,
        name: impl Into<String>,
        parallel: ParallelDef,
    ) -> Self {
        self.add_node(NodeDef::new(id, name, NodeKind::Parallel { parallel }))
    }

    pub fn add_merge_node(self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.add_node(NodeDef::new(id, name, NodeKind::Merge))
    }

    /// Set a timeout on the most recently added node.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        if let Some(node) = self.def.nodes.last_mut() {
            node.timeout_ms = Some(timeout_ms);
        }
        self
    }

    /// Set a retry policy on the most recently added node.
    pub fn retry(mut self, retry: RetryDef) -> Self {
        if let Some(node) = self.def.nodes.last_mut() {
            node.retry = Some(retry);
        }
        self
    }

    /// Mark the most recently added node as skippable on failure.
    pub fn skip_on_error(mut self) -> Self {
        if let Some(node) = self.def.nodes.last_mut() {
            node.skip_on_error = true;
        }
        self
    }

    /// Add an unconditional edge with a generated id.
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let id = self.next_edge_id();
        self.def.edges.push(EdgeDef::new(id, from, to));
        self
    }

    /// Add an edge guarded by an expression.
    pub fn add_conditional_edge(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        let id = self.next_edge_id();
        self.def
            .edges
            .push(EdgeDef::new(id, from, to).with_condition(condition));
        self
    }

    /// Add a fully specified edge.
    pub fn edge(mut self, edge: EdgeDef) -> Self {
        self.edge_seq += 1;
        self.def.edges.push(edge);
        self
    }

    /// Chain nodes with unconditional edges in the given order.
    pub fn chain(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self = self.add_edge(pair[0], pair[1]);
        }
        self
    }

    fn next_edge_id(&mut self) -> String {
        self.edge_seq += 1;
        format!("e{}", self.edge_seq)
    }

    pub fn build(self) -> WorkflowDefinition {
        self.def
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builds_linear_workflow() {
        let def = WorkflowBuilder::new("greet", "Greeting")
            .description("Say hello")
            .add_input(VariableDef::new("message", VarType::String).required())
            .add_output(VariableDef::new("result", VarType::String))
            .add_start_node("start")
            .add_task_node(
                "echo",
                "Echo",
                AgentRef::new("echo")
                    .with_input("message", "message")
                    .with_output("result", "content"),
            )
            .timeout_ms(1_000)
            .add_end_node("end")
            .chain(&["start", "echo", "end"])
            .build();

        def.validate().unwrap();
        assert_eq!(def.nodes.len(), 3);
        assert_eq!(def.edges.len(), 2);
        assert_eq!(def.edges[1].id, "e2");
        assert_eq!(def.node("echo").unwrap().timeout_ms, Some(1_000));
    }

    #[test]
    fn test_conditional_edges_and_flags() {
        let def = WorkflowBuilder::new("triage", "Triage")
            .add_start_node("start")
            .add_condition_node(
                "check",
                "Check priority",
                ConditionDef::all(vec![ConditionRule::new("priority", ">=", json!(5))]),
            )
            .add_task_node("urgent", "Urgent", AgentRef::new("echo"))
            .skip_on_error()
            .add_task_node("normal", "Normal", AgentRef::new("echo"))
            .add_end_node("end")
            .add_edge("start", "check")
            .add_conditional_edge("check", "urgent", "check_result == true")
            .add_conditional_edge("check", "normal", "check_result == false")
            .add_edge("urgent", "end")
            .add_edge("normal", "end")
            .build();

        def.validate().unwrap();
        assert!(def.node("urgent").unwrap().skip_on_error);
        assert!(!def.node("normal").unwrap().skip_on_error);
        let guarded: Vec<_> = def.outgoing("check").collect();
        assert_eq!(guarded.len(), 2);
        assert!(guarded.iter().all(|e| e.condition.is_some()));
    }

    #[test]
    fn test_builder_output_without_end_fails_validation() {
        let def = WorkflowBuilder::new("broken", "Broken")
            .add_start_node("start")
            .add_task_node("work", "Work", AgentRef::new("echo"))
            .add_edge("start", "work")
            .build();
        assert!(def.validate().is_err());
    }
}
