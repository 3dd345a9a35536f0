use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::core::CapabilityId;

/// Errors raised while registering capabilities or building a plan.
///
/// Every variant is fatal to the request: no partial plan is ever executed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Capability '{0}' is not registered")]
    UnknownCapability(CapabilityId),

    #[error("Capability '{0}' is already registered")]
    DuplicateCapability(CapabilityId),

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<CapabilityId> },
}

fn format_cycle(cycle: &[CapabilityId]) -> String {
    cycle
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<&str>>()
        .join(" -> ")
}

/// Failure recorded on a single node of a plan.
///
/// Node errors never abort sibling work, they only cascade forward to the
/// dependents of the failed node.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum NodeError {
    /// Business-logic failure reported by the provider, never retried.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A single attempt exceeded its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Retryable failure, e.g. a network error.
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Cancelled")]
    Cancelled,

    /// The assembled input did not match the capability's input shape.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Bookkeeping invariant violated by the orchestrator itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Whether another attempt may be made within the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Timeout(_) | NodeError::Transient(_))
    }
}

impl From<ContextError> for NodeError {
    fn from(err: ContextError) -> Self {
        NodeError::Internal(err.to_string())
    }
}

/// Errors of the write-once execution context.
///
/// In correct operation neither of these is ever observed, they exist to
/// catch orchestration bugs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Output of '{0}' was already written")]
    DuplicateWrite(CapabilityId),

    #[error("Output of '{0}' is not ready")]
    KeyNotReady(CapabilityId),
}

/// Error returned by a provider call.
///
/// Userland code is expected to work with [`anyhow`], plain `?` on an
/// [`anyhow::Error`] produces a non-retryable [`ProviderError::Fatal`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Fatal(anyhow::Error),

    #[error("{0}")]
    Transient(anyhow::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }
}

impl From<anyhow::Error> for ProviderError {
    fn from(err: anyhow::Error) -> Self {
        ProviderError::Fatal(err)
    }
}

impl From<ProviderError> for NodeError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Fatal(e) => NodeError::Provider(format!("{e:#}")),
            ProviderError::Transient(e) => NodeError::Transient(format!("{e:#}")),
            ProviderError::Cancelled => NodeError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message() {
        let err = PlanError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_retryable_classes() {
        assert!(NodeError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(NodeError::Transient("reset".into()).is_retryable());
        assert!(!NodeError::Provider("bad city".into()).is_retryable());
        assert!(!NodeError::Cancelled.is_retryable());
    }

    #[test]
    fn test_provider_error_conversion() {
        let err: ProviderError = anyhow::anyhow!("no results").into();
        assert_eq!(
            NodeError::from(err),
            NodeError::Provider("no results".into())
        );

        let err = ProviderError::transient(anyhow::anyhow!("connection reset"));
        assert_eq!(
            NodeError::from(err),
            NodeError::Transient("connection reset".into())
        );
    }
}
