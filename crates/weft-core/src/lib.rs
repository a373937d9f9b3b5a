pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::WeftConfig;
pub use error::{ErrorKind, Result, WeftError};
pub use event::{EventBus, WorkflowEvent, WorkflowEventKind};
pub use types::*;
