use serde::Serialize;

use crate::core::{CapabilityId, Value};
use crate::engine::{SkipReason, State};
use crate::error::NodeError;
use crate::plan::Plan;

/// Final outcome of a single capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded(Value),
    Failed(NodeError),
    Skipped(SkipReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub capability: CapabilityId,
    pub outcome: Outcome,
}

/// What happened to every capability of a request, in plan order.
///
/// A report is produced for every executed plan, no matter how many nodes
/// failed. Callers decide how to present partial results.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub entries: Vec<Entry>,
}

impl Report {
    /// Projects the node states of a finished plan.
    ///
    /// Nodes left non-terminal are folded into `Skipped(Cancelled)` when they
    /// never ran and into `Failed(Cancelled)` when they were running.
    pub fn aggregate(plan: &Plan) -> Self {
        let entries = plan
            .nodes()
            .map(|node| {
                let outcome = match node.state() {
                    State::Succeeded(value) => Outcome::Succeeded(value.clone()),
                    State::Failed(err) => Outcome::Failed(err.clone()),
                    State::Skipped(reason) => Outcome::Skipped(reason.clone()),
                    State::Pending | State::Ready => {
                        tracing::error!("'{}' left {} after execution", node.id(), node.state().name());
                        Outcome::Skipped(SkipReason::Cancelled)
                    }
                    State::Running => {
                        tracing::error!("'{}' left running after execution", node.id());
                        Outcome::Failed(NodeError::Cancelled)
                    }
                };

                Entry {
                    capability: node.id().clone(),
                    outcome,
                }
            })
            .collect();

        Self { entries }
    }

    pub fn get(&self, capability: &str) -> Option<&Outcome> {
        self.entries
            .iter()
            .find(|entry| &*entry.capability == capability)
            .map(|entry| &entry.outcome)
    }

    /// Output of a succeeded capability.
    pub fn value(&self, capability: &str) -> Option<&Value> {
        match self.get(capability)? {
            Outcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = (&CapabilityId, &Value)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            Outcome::Succeeded(value) => Some((&entry.capability, value)),
            _ => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (&CapabilityId, &NodeError)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            Outcome::Failed(err) => Some((&entry.capability, err)),
            _ => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&CapabilityId, &SkipReason)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            Outcome::Skipped(reason) => Some((&entry.capability, reason)),
            _ => None,
        })
    }

    /// Whether every capability succeeded.
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|entry| entry.outcome.is_success())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Request;
    use crate::registry::{Registry, provider_fn};
    use serde_json::json;

    fn plan() -> Plan {
        let mut registry = Registry::new();
        let noop = provider_fn(|_, _| async { Ok(json!(null)) });
        registry.capability("weather").provider(noop.clone()).register().unwrap();
        registry
            .capability("wardrobe")
            .depends_on(["weather"])
            .provider(noop.clone())
            .register()
            .unwrap();
        registry.capability("language").provider(noop).register().unwrap();

        Plan::build(&registry, &Request::new(["wardrobe", "language"])).unwrap()
    }

    fn set(plan: &mut Plan, id: &str, states: Vec<State>) {
        let index = plan.graph.node_indices().find(|&i| &**plan.graph[i].id() == id).unwrap();
        for state in states {
            assert!(plan.graph[index].transition(state));
        }
    }

    #[test]
    fn test_aggregate_in_plan_order() {
        let mut plan = plan();
        let timeout = NodeError::Timeout(std::time::Duration::from_secs(1));
        set(&mut plan, "weather", vec![State::Ready, State::Running, State::Failed(timeout)]);
        set(
            &mut plan,
            "wardrobe",
            vec![State::Skipped(SkipReason::Dependency { upstream: "weather".into() })],
        );
        set(&mut plan, "language", vec![State::Ready, State::Running, State::Succeeded(json!("habari"))]);

        let report = Report::aggregate(&plan);
        let order: Vec<&str> = report.entries.iter().map(|e| &*e.capability).collect();
        assert_eq!(order, ["weather", "wardrobe", "language"]);

        assert_eq!(report.value("language"), Some(&json!("habari")));
        assert_eq!(report.value("weather"), None);
        assert_eq!(report.failed().count(), 1);
        assert_eq!(report.skipped().count(), 1);
        assert_eq!(report.succeeded().count(), 1);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_non_terminal_nodes_are_folded() {
        let mut plan = plan();
        set(&mut plan, "weather", vec![State::Ready, State::Running]);
        set(&mut plan, "language", vec![State::Ready]);

        let report = Report::aggregate(&plan);
        assert_eq!(report.get("weather"), Some(&Outcome::Failed(NodeError::Cancelled)));
        assert_eq!(report.get("wardrobe"), Some(&Outcome::Skipped(SkipReason::Cancelled)));
        assert_eq!(report.get("language"), Some(&Outcome::Skipped(SkipReason::Cancelled)));
    }

    #[test]
    fn test_serialize() {
        let mut plan = plan();
        set(&mut plan, "weather", vec![State::Ready, State::Running, State::Succeeded(json!({"temp": 20}))]);
        let closet = NodeError::Provider("closet empty".into());
        set(&mut plan, "wardrobe", vec![State::Ready, State::Running, State::Failed(closet)]);
        set(&mut plan, "language", vec![State::Skipped(SkipReason::Cancelled)]);

        let value = serde_json::to_value(Report::aggregate(&plan)).unwrap();
        assert_eq!(
            value,
            json!({
                "entries": [
                    {"capability": "weather", "outcome": {"status": "succeeded", "detail": {"temp": 20}}},
                    {"capability": "wardrobe", "outcome": {"status": "failed", "detail": {"kind": "provider", "detail": "closet empty"}}},
                    {"capability": "language", "outcome": {"status": "skipped", "detail": {"kind": "cancelled"}}}
                ]
            })
        );
    }
}
