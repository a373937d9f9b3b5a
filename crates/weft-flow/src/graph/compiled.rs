use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use super::definition::{NodeDef, NodeKind, WorkflowDefinition};
use super::expression::Expression;
use super::variables::Variables;

/// A definition with node ids interned to indices and edge conditions parsed
/// once. Built per execution; the public ids stay untouched.
pub(crate) struct CompiledGraph {
    def: Arc<WorkflowDefinition>,
    index: HashMap<String, usize>,
    edge_from: Vec<usize>,
    edge_to: Vec<usize>,
    conditions: Vec<Option<Result<Expression, String>>>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    starts: Vec<usize>,
}

impl CompiledGraph {
    /// Compile a validated definition. Edges naming unknown nodes are dropped.
    pub fn new(def: Arc<WorkflowDefinition>) -> Self {
        let index: HashMap<String, usize> = def
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let n = def.nodes.len();
        let mut outgoing = vec![Vec::new(); n];
        let mut incoming = vec![Vec::new(); n];
        let mut edge_from = Vec::new();
        let mut edge_to = Vec::new();
        let mut conditions = Vec::new();

        for edge in &def.edges {
            let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) else {
                continue;
            };
            let e = edge_from.len();
            edge_from.push(from);
            edge_to.push(to);
            conditions.push(
                edge.condition
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .map(|c| Expression::parse(c).map_err(|e| e.to_string())),
            );
            outgoing[from].push(e);
            incoming[to].push(e);
        }

        let starts = def
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Start))
            .map(|(i, _)| i)
            .collect();

        Self {
            def,
            index,
            edge_from,
            edge_to,
            conditions,
            outgoing,
            incoming,
            starts,
        }
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.def
    }

    pub fn node(&self, idx: usize) -> &NodeDef {
        &self.def.nodes[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.def.nodes.len()
    }

    /// Evaluate an edge's guard. Evaluation errors prune the edge.
    fn edge_taken(&self, edge: usize, vars: &Variables) -> bool {
        match &self.conditions[edge] {
            None => true,
            Some(Ok(expr)) => match expr.evaluate(vars) {
                Ok(taken) => taken,
                Err(e) => {
                    debug!(
                        from = %self.def.nodes[self.edge_from[edge]].id,
                        to = %self.def.nodes[self.edge_to[edge]].id,
                        error = %e,
                        "Edge condition failed to evaluate, pruning edge"
                    );
                    false
                }
            },
            Some(Err(e)) => {
                warn!(
                    from = %self.def.nodes[self.edge_from[edge]].id,
                    to = %self.def.nodes[self.edge_to[edge]].id,
                    error = %e,
                    "Malformed edge condition, pruning edge"
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Pending,
    Satisfied,
    Pruned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Waiting,
    Ready,
    Done,
    Pruned,
}

/// Frontier bookkeeping for one walk over a [`CompiledGraph`].
///
/// A node becomes ready once every incoming edge is resolved and at least one
/// was satisfied. A node whose incoming edges are all pruned is pruned too,
/// and its outgoing edges with it.
pub(crate) struct Traversal {
    edges: Vec<EdgeState>,
    nodes: Vec<Visit>,
}

impl Traversal {
    pub fn new(graph: &CompiledGraph) -> Self {
        let mut t = Self {
            edges: vec![EdgeState::Pending; graph.edge_from.len()],
            nodes: vec![Visit::Waiting; graph.len()],
        };

        // Nodes no start can reach never run; resolve their edges up front.
        let mut reachable = vec![false; graph.len()];
        let mut queue: VecDeque<usize> = graph.starts.iter().copied().collect();
        while let Some(n) = queue.pop_front() {
            if reachable[n] {
                continue;
            }
            reachable[n] = true;
            for &e in &graph.outgoing[n] {
                queue.push_back(graph.edge_to[e]);
            }
        }
        for (n, reached) in reachable.iter().enumerate() {
            if !reached {
                t.nodes[n] = Visit::Pruned;
                for &e in &graph.outgoing[n] {
                    t.edges[e] = EdgeState::Pruned;
                }
            }
        }
        t
    }

    /// Start nodes form the first frontier.
    pub fn initial_frontier(&mut self, graph: &CompiledGraph) -> Vec<usize> {
        let mut frontier = Vec::new();
        for &s in &graph.starts {
            if self.nodes[s] == Visit::Waiting {
                self.nodes[s] = Visit::Ready;
                frontier.push(s);
            }
        }
        frontier
    }

    /// Mark `node` finished, resolve its outgoing edges, and return the nodes
    /// that became ready.
    pub fn complete(&mut self, graph: &CompiledGraph, node: usize, vars: &Variables) -> Vec<usize> {
        self.nodes[node] = Visit::Done;
        for &e in &graph.outgoing[node] {
            self.edges[e] = if graph.edge_taken(e, vars) {
                EdgeState::Satisfied
            } else {
                EdgeState::Pruned
            };
        }
        let mut ready = Vec::new();
        let targets: Vec<usize> = graph.outgoing[node].iter().map(|&e| graph.edge_to[e]).collect();
        self.settle(graph, targets, &mut ready);
        ready
    }

    fn settle(&mut self, graph: &CompiledGraph, mut pending: Vec<usize>, ready: &mut Vec<usize>) {
        while let Some(n) = pending.pop() {
            if self.nodes[n] != Visit::Waiting {
                continue;
            }
            let incoming = &graph.incoming[n];
            if incoming.iter().any(|&e| self.edges[e] == EdgeState::Pending) {
                continue;
            }
            if incoming.iter().any(|&e| self.edges[e] == EdgeState::Satisfied) {
                self.nodes[n] = Visit::Ready;
                ready.push(n);
            } else {
                debug!(node_id = %graph.node(n).id, "All incoming edges pruned, skipping node");
                self.nodes[n] = Visit::Pruned;
                for &e in &graph.outgoing[n] {
                    self.edges[e] = EdgeState::Pruned;
                    pending.push(graph.edge_to[e]);
                }
            }
        }
        // Keep definition order among siblings for a stable trace.
        ready.sort_unstable();
    }

    /// Ids of reachable nodes that never resolved (only possible with cycles).
    pub fn stranded<'g>(&self, graph: &'g CompiledGraph) -> Vec<&'g str> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, v)| matches!(v, Visit::Waiting | Visit::Ready))
            .map(|(i, _)| graph.node(i).id.as_str())
            .collect()
    }
}
