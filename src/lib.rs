#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod catalog;
mod config;
mod core;
mod engine;
mod error;
mod plan;
mod registry;
mod report;
mod synth;
mod utils;

use std::sync::Arc;

pub use tokio_util::sync::CancellationToken;

pub use crate::config::{Backoff, Config, Override, Policy};
pub use crate::core::{CapabilityId, Field, FieldKind, Input, InputShape, Params, Request, Value};
pub use crate::engine::{Diagnostics, Execution, ExecutionContext, Node, Scheduler, SkipReason, State};
pub use crate::error::{ContextError, NodeError, PlanError, ProviderError};
pub use crate::plan::Plan;
pub use crate::registry::{
    Capability, CapabilityBinder, CapabilityDef, Fallback, Provider, Registry, provider_fn,
};
pub use crate::report::{Entry, Outcome, Report};
pub use crate::synth::{PlainText, Synthesizer};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

/// A finished request: the executed plan, what came out of it and how long
/// every call took.
#[derive(Debug)]
pub struct Run {
    pub plan: Plan,
    pub report: Report,
    pub diagnostics: Diagnostics,
}

/// Entry point of the engine.
///
/// Owns the capability registry and the scheduler configuration, both shared
/// read-only between requests. Every request gets its own plan and its own
/// execution context, nothing is carried over from one request to the next.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    registry: Arc<Registry>,
    config: Config,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, config: Config) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds the plan of a request without running it.
    pub fn plan(&self, request: &Request) -> Result<Plan, PlanError> {
        Plan::build(&self.registry, request)
    }

    /// Plans and executes a request.
    ///
    /// Planning errors are returned before any provider is called. Once a plan
    /// exists the run always completes with a report, failures of single
    /// capabilities only show up inside it.
    pub async fn run(&self, request: &Request, cancel: CancellationToken) -> Result<Run, PlanError> {
        let mut plan = self.plan(request)?;

        tracing::info!(
            "running {} capabilities for request {:?}",
            plan.len(),
            request.capabilities()
        );

        let diagnostics = Scheduler::new(&self.config).run(&mut plan, &cancel).await;
        let report = Report::aggregate(&plan);

        Ok(Run {
            plan,
            report,
            diagnostics,
        })
    }

    /// Runs a request to completion and returns its report.
    pub async fn handle(&self, request: &Request) -> Result<Report, PlanError> {
        let run = self.run(request, CancellationToken::new()).await?;
        Ok(run.report)
    }

    /// Runs a request and phrases the report with `synthesizer`.
    pub async fn answer<S>(&self, request: &Request, synthesizer: &S) -> anyhow::Result<String>
    where
        S: Synthesizer + ?Sized,
    {
        let report = self.handle(request).await?;
        synthesizer.synthesize(request, &report).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn counted(calls: &Arc<AtomicUsize>, value: Value) -> Arc<dyn Provider> {
        let calls = calls.clone();
        provider_fn(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    #[tokio::test]
    async fn test_runs_are_independent() {
        let calls = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        registry
            .capability("weather")
            .provider(counted(&calls, json!({"sky": "clear"})))
            .register()
            .unwrap();
        registry
            .capability("wardrobe")
            .depends_on(["weather"])
            .provider(counted(&calls, json!(["sunglasses"])))
            .register()
            .unwrap();

        let orchestrator = Orchestrator::new(Arc::new(registry), Config::default());
        let request = Request::new(["wardrobe"]).param("location", "Lamu");

        let first = orchestrator.handle(&request).await.unwrap();
        let second = orchestrator.handle(&request).await.unwrap();

        assert_eq!(first, second);
        assert!(first.is_complete());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cycle_calls_no_provider() {
        let calls = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        for (id, dep) in [("weather", "explorer"), ("explorer", "wardrobe"), ("wardrobe", "weather")] {
            registry
                .capability(id)
                .depends_on([dep])
                .provider(counted(&calls, json!(null)))
                .register()
                .unwrap();
        }
        registry
            .capability("language")
            .provider(counted(&calls, json!("hello")))
            .register()
            .unwrap();

        let orchestrator = Orchestrator::new(Arc::new(registry), Config::default());
        let err = orchestrator
            .handle(&Request::new(["language", "wardrobe"]))
            .await
            .unwrap_err();

        assert!(matches!(err, PlanError::CyclicDependency { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let orchestrator = Orchestrator::new(Arc::new(Registry::new()), Config::default());
        let err = orchestrator
            .run(&Request::new(["teleport"]), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, PlanError::UnknownCapability("teleport".into()));
    }

    #[tokio::test]
    async fn test_answer_with_partial_failure() {
        let mut registry = Registry::new();
        registry
            .capability("weather")
            .provider(provider_fn(|_, _| async {
                Err(ProviderError::fatal(anyhow::anyhow!("station offline")))
            }))
            .register()
            .unwrap();
        registry
            .capability("wardrobe")
            .depends_on(["weather"])
            .provider(provider_fn(|_, _| async { Ok(json!(["scarf"])) }))
            .register()
            .unwrap();
        registry
            .capability("culture_food")
            .provider(provider_fn(|_, _| async { Ok(json!("Try nyama choma")) }))
            .register()
            .unwrap();

        let orchestrator = Orchestrator::new(Arc::new(registry), Config::default());
        let request = Request::new(["wardrobe", "culture_food"]);
        let answer = orchestrator.answer(&request, &PlainText).await.unwrap();

        assert!(answer.contains("## weather\nCould not be obtained: Provider error: station offline"));
        assert!(answer.contains("## wardrobe\nNot attempted: prerequisite 'weather' failed"));
        assert!(answer.contains("## culture_food\nTry nyama choma"));
    }

    #[tokio::test]
    async fn test_run_exposes_diagnostics() {
        let mut registry = Registry::new();
        registry
            .capability("safety")
            .provider(provider_fn(|_, _| async { Ok(json!("no advisories")) }))
            .register()
            .unwrap();

        let orchestrator = Orchestrator::new(Arc::new(registry), Config::default());
        let run = orchestrator
            .run(&Request::new(["safety"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.diagnostics.executions["safety"].attempts, 1);
        assert!(run.plan.is_finished());
        assert!(run.diagnostics.render_mermaid(&run.plan).starts_with("graph LR"));
    }
}
