mod context;
mod diagnostics;
mod node;
mod runner;

pub use crate::engine::context::ExecutionContext;
pub use crate::engine::diagnostics::{Diagnostics, Execution};
pub use crate::engine::node::{Node, SkipReason, State};
pub use crate::engine::runner::Scheduler;
