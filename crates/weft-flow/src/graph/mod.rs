pub mod builder;
mod compiled;
pub mod definition;
pub mod engine;
pub mod execution;
pub mod expression;
mod join;
pub mod nodes;
pub mod variables;

pub use builder::WorkflowBuilder;
pub use definition::{
    AgentRef, Backoff, BranchDef, ConditionDef, ConditionRule, ConditionType, EdgeDef, JoinType,
    LoopDef, LoopType, NodeDef, NodeKind, ParallelDef, RetryDef, VarType, VariableDef,
    WorkflowConfig, WorkflowDefinition,
};
pub use engine::{Engine, EngineMetrics, ExecutionFilter};
pub use execution::{ExecutionSummary, NodeResult, WorkflowError, WorkflowExecution, WorkflowResult};
pub use expression::Expression;
pub use variables::Variables;
