pub mod branching;
pub mod coordinator;
pub mod graph;
pub mod pipeline;
pub mod session;
pub mod step;

pub use branching::{
    BranchCondition, ConditionLevel, ConditionalAgent, ElseBranch, MultiLevelConditionalAgent,
    ParallelConditionalAgent, ParallelStrategy, SwitchAgent, SwitchCase,
};
pub use coordinator::{Coordinator, CoordinatorStats, InlineDispatcher, NodeDispatcher, TaskRequest};
pub use graph::{Engine, WorkflowBuilder, WorkflowDefinition, WorkflowExecution, WorkflowResult};
pub use pipeline::{Pipeline, PipelineRun, RunEvent, RunEventKind, RunMetrics};
pub use session::InMemorySessionStore;
pub use step::{run_step, Step, StepConfig, StepInput, StepKind, StepOutput};
