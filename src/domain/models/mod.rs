//! Domain data models.

pub mod execution;
pub mod rule;
pub mod schedule;
pub mod validation;
pub mod workflow;

pub use execution::{ExecutionStatus, TaskResult, TaskStatus, WorkflowExecution};
pub use rule::{MatchResult, Rule, RuleKind, Severity};
pub use schedule::ScheduleConfig;
pub use validation::{PropertyFormat, PropertyRule, PropertyType, Schema, ValidationError};
pub use workflow::{Task, TaskKind, TaskRetry, Trigger, Workflow};
