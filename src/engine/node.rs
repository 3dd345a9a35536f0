use std::sync::Arc;

use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::core::{CapabilityId, Value};
use crate::error::NodeError;
use crate::registry::Capability;

/// Why a node was never dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A prerequisite ended in `Failed` or `Skipped`.
    Dependency { upstream: CapabilityId },
    /// The request was cancelled before the node could run.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Dependency { upstream } => write!(f, "prerequisite '{upstream}' failed"),
            SkipReason::Cancelled => write!(f, "request cancelled"),
        }
    }
}

/// Lifecycle of a node.
///
/// ```text
/// Pending -> Ready -> Running -> Succeeded | Failed
///    \         \
///     `---------`--> Skipped
/// ```
///
/// `Succeeded`, `Failed` and `Skipped` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Pending,
    Ready,
    Running,
    Succeeded(Value),
    Failed(NodeError),
    Skipped(SkipReason),
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Succeeded(_) | State::Failed(_) | State::Skipped(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Ready => "ready",
            State::Running => "running",
            State::Succeeded(_) => "succeeded",
            State::Failed(_) => "failed",
            State::Skipped(_) => "skipped",
        }
    }

    fn allows(&self, next: &State) -> bool {
        match (self, next) {
            (State::Pending, State::Ready | State::Skipped(_)) => true,
            (State::Ready, State::Running | State::Skipped(_)) => true,
            (State::Running, State::Succeeded(_) | State::Failed(_)) => true,
            _ => false,
        }
    }
}

/// One capability's execution slot within a plan.
#[derive(Debug)]
pub struct Node {
    pub(crate) capability: Arc<Capability>,
    pub(crate) dependencies: Vec<NodeIndex>,
    pub(crate) state: State,
}

impl Node {
    pub(crate) fn new(capability: Arc<Capability>) -> Self {
        Self {
            capability,
            dependencies: Vec::new(),
            state: State::Pending,
        }
    }

    pub fn id(&self) -> &CapabilityId {
        &self.capability.id
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    /// Indices of the nodes this node depends on, in declaration order.
    pub fn dependencies(&self) -> &[NodeIndex] {
        &self.dependencies
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Moves the node to `next`, refusing transitions the state machine does
    /// not allow. Returns whether the transition happened.
    pub(crate) fn transition(&mut self, next: State) -> bool {
        if !self.state.allows(&next) {
            tracing::warn!(
                "refusing transition of '{}' from {} to {}",
                self.capability.id,
                self.state.name(),
                next.name()
            );
            return false;
        }

        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::provider_fn;
    use serde_json::json;

    fn node() -> Node {
        let capability = Capability::new("weather", provider_fn(|_, _| async { Ok(json!(1)) }));
        Node::new(Arc::new(capability))
    }

    #[test]
    fn test_happy_path() {
        let mut node = node();
        assert!(node.transition(State::Ready));
        assert!(node.transition(State::Running));
        assert!(node.transition(State::Succeeded(json!("sunny"))));
        assert!(node.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut node = node();
        assert!(node.transition(State::Skipped(SkipReason::Cancelled)));
        assert!(!node.transition(State::Ready));
        assert!(!node.transition(State::Failed(NodeError::Cancelled)));
        assert_eq!(node.state(), &State::Skipped(SkipReason::Cancelled));
    }

    #[test]
    fn test_running_cannot_be_skipped() {
        let mut node = node();
        node.transition(State::Ready);
        node.transition(State::Running);
        assert!(!node.transition(State::Skipped(SkipReason::Cancelled)));
        assert_eq!(node.state(), &State::Running);
    }

    #[test]
    fn test_pending_cannot_run() {
        let mut node = node();
        assert!(!node.transition(State::Running));
        assert_eq!(node.state(), &State::Pending);
    }
}
