use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::{Config, Policy};
use crate::core::{Input, Value};
use crate::engine::context::ExecutionContext;
use crate::engine::diagnostics::{Diagnostics, Execution};
use crate::engine::node::{SkipReason, State};
use crate::error::NodeError;
use crate::plan::Plan;
use crate::registry::Provider;

/// Message sent by a worker back to the scheduler loop.
struct Completion {
    index: NodeIndex,
    result: Result<Value, NodeError>,
    execution: Execution,
}

/// Executes plans.
///
/// The scheduler loop is the only owner of the plan and of the execution
/// context while a plan runs, workers talk to it exclusively through a
/// channel. Only provider calls ever suspend.
pub struct Scheduler<'a> {
    config: &'a Config,
}

impl<'a> Scheduler<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Runs every node of the plan at most once, in dependency order.
    ///
    /// The algorithm works as follows:
    /// 1. Every node without dependencies is marked `Ready`, all others stay
    ///    `Pending` with a count of unmet dependencies.
    /// 2. Ready nodes are dispatched as Tokio tasks right away, up to the
    ///    configured concurrency limit.
    /// 3. The loop waits for any worker to report back.
    /// 4. On success the output goes into the execution context and the
    ///    dependency counts of all direct dependents are decremented; a node
    ///    whose count reaches zero becomes `Ready` and is dispatched.
    /// 5. On failure every transitive dependent is marked `Skipped`.
    /// 6. The loop ends when nothing is in flight, or on cancellation, in
    ///    which case waiting nodes are skipped and running ones get a short
    ///    grace period to report before they are marked `Failed(Cancelled)`.
    ///
    /// This function never fails, every problem is recorded on the nodes.
    pub async fn run(&self, plan: &mut Plan, cancel: &CancellationToken) -> Diagnostics {
        if plan.is_empty() {
            return Diagnostics::default();
        }

        let root_span = tracing::span!(Level::INFO, "running_plan");
        root_span.pb_set_length(plan.len() as u64);
        if let Ok(style) = crate::utils::get_style_plan() {
            root_span.pb_set_style(&style);
        }
        root_span.pb_set_message("Running capabilities...");

        self.drive(plan, cancel, root_span.clone())
            .instrument(root_span)
            .await
    }

    async fn drive(&self, plan: &mut Plan, cancel: &CancellationToken, span: Span) -> Diagnostics {
        let token = cancel.child_token();
        let deadline = self.config.request_deadline.map(|d| Instant::now() + d);
        let (sender, mut receiver) = unbounded_channel::<Completion>();

        let mut pass = Pass::new(plan, self.config, token.clone(), sender, span);
        pass.seed();

        let cancelled = loop {
            if token.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!("request stopped with {} calls in flight", pass.in_flight);
                break true;
            }

            pass.dispatch();

            if pass.in_flight == 0 {
                break false;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::warn!("request cancelled with {} calls in flight", pass.in_flight);
                    break true;
                }
                _ = wait_for(deadline) => {
                    tracing::warn!("request deadline elapsed with {} calls in flight", pass.in_flight);
                    break true;
                }
                Some(done) = receiver.recv() => pass.complete(done, true),
            }
        };

        if cancelled {
            token.cancel();
            let skipped = pass.skip_waiting();
            tracing::info!("skipped {skipped} capabilities after cancellation");

            let grace = sleep(self.config.grace_period);
            tokio::pin!(grace);

            while pass.in_flight > 0 {
                tokio::select! {
                    _ = &mut grace => break,
                    Some(done) = receiver.recv() => pass.complete(done, false),
                }
            }

            pass.abandon_running();
        }

        tracing::info!("plan finished");
        pass.diagnostics
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Bookkeeping of a single plan execution.
struct Pass<'p> {
    plan: &'p mut Plan,
    config: &'p Config,
    context: ExecutionContext,
    counts: HashMap<NodeIndex, usize>,
    /// Ready nodes waiting for a free slot, in plan order.
    ready: BTreeSet<NodeIndex>,
    in_flight: usize,
    token: CancellationToken,
    sender: UnboundedSender<Completion>,
    span: Span,
    style: Option<ProgressStyle>,
    diagnostics: Diagnostics,
}

impl<'p> Pass<'p> {
    fn new(
        plan: &'p mut Plan,
        config: &'p Config,
        token: CancellationToken,
        sender: UnboundedSender<Completion>,
        span: Span,
    ) -> Self {
        Self {
            plan,
            config,
            context: ExecutionContext::new(),
            counts: HashMap::new(),
            ready: BTreeSet::new(),
            in_flight: 0,
            token,
            sender,
            span,
            style: crate::utils::get_style_task().ok(),
            diagnostics: Diagnostics::default(),
        }
    }

    fn seed(&mut self) {
        let indices: Vec<NodeIndex> = self.plan.graph.node_indices().collect();

        for index in indices {
            let count = self.plan.graph[index].dependencies.len();
            self.counts.insert(index, count);

            if count == 0 && self.plan.graph[index].transition(State::Ready) {
                self.ready.insert(index);
            }
        }
    }

    fn has_capacity(&self) -> bool {
        self.config
            .max_concurrency
            .is_none_or(|limit| self.in_flight < limit.max(1))
    }

    fn dispatch(&mut self) {
        while self.has_capacity() && !self.token.is_cancelled() {
            let Some(index) = self.ready.pop_first() else {
                break;
            };

            if self.plan.graph[index].state == State::Ready {
                self.start(index);
            }
        }
    }

    fn start(&mut self, index: NodeIndex) {
        let input = self.assemble(index);
        let node = &mut self.plan.graph[index];
        let id = node.id().clone();
        let capability = node.capability.clone();

        if !node.transition(State::Running) {
            return;
        }

        let input = match input {
            Ok(input) => input,
            Err(err) => {
                tracing::warn!("'{id}' not dispatched: {err}");
                self.span.pb_inc(1);
                self.fail(index, err);
                return;
            }
        };

        tracing::debug!("dispatching '{id}'");
        self.in_flight += 1;

        let policy = self.config.policy(&id);
        let token = self.token.clone();
        let sender = self.sender.clone();

        let span = tracing::span!(parent: &self.span, Level::INFO, "capability", name = %id);
        if let Some(style) = &self.style {
            span.pb_set_style(style);
        }
        span.pb_set_message(&format!("Running {id}"));

        tokio::spawn(
            async move {
                let start = Instant::now();
                let (result, attempts) =
                    call_with_retries(capability.provider.as_ref(), input, &policy, &token).await;

                let execution = Execution {
                    start,
                    duration: start.elapsed(),
                    attempts,
                };

                // The scheduler may have stopped listening after cancellation.
                let _ = sender.send(Completion {
                    index,
                    result,
                    execution,
                });
            }
            .instrument(span),
        );
    }

    /// Request parameters plus the outputs of direct dependencies only.
    fn assemble(&self, index: NodeIndex) -> Result<Input, NodeError> {
        let node = &self.plan.graph[index];
        let mut upstream = BTreeMap::new();

        for &dependency in &node.dependencies {
            let id = self.plan.graph[dependency].id();
            let value = self.context.get(id)?;
            upstream.insert(id.clone(), value.clone());
        }

        let input = Input::new(self.plan.params.clone(), upstream);
        node.capability
            .input
            .check(&input)
            .map_err(NodeError::InvalidInput)?;

        Ok(input)
    }

    fn complete(&mut self, done: Completion, unlock: bool) {
        let Completion {
            index,
            result,
            execution,
        } = done;

        self.in_flight -= 1;
        self.span.pb_inc(1);

        let id = self.plan.graph[index].id().clone();
        let attempts = execution.attempts;
        self.diagnostics.executions.insert(id.clone(), execution);

        match result {
            Ok(value) => {
                if let Err(err) = self.context.put(id.clone(), value.clone()) {
                    self.fail(index, err.into());
                    return;
                }

                self.plan.graph[index].transition(State::Succeeded(value));
                tracing::info!("'{id}' succeeded after {attempts} attempt(s)");

                if unlock {
                    self.unlock_dependents(index);
                }
            }
            Err(err) => {
                tracing::warn!("'{id}' failed after {attempts} attempt(s): {err}");
                self.fail(index, err);
            }
        }
    }

    fn dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut dependents: Vec<NodeIndex> = self
            .plan
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        dependents.sort();
        dependents
    }

    fn unlock_dependents(&mut self, index: NodeIndex) {
        for dependent in self.dependents(index) {
            let Some(count) = self.counts.get_mut(&dependent) else {
                continue;
            };

            *count = count.saturating_sub(1);
            if *count == 0 && self.plan.graph[dependent].transition(State::Ready) {
                self.ready.insert(dependent);
            }
        }
    }

    fn fail(&mut self, index: NodeIndex, err: NodeError) {
        self.plan.graph[index].transition(State::Failed(err));
        self.skip_dependents(index);
    }

    /// Marks every direct and transitive dependent of `index` as skipped.
    fn skip_dependents(&mut self, index: NodeIndex) {
        let mut stack = vec![index];

        while let Some(current) = stack.pop() {
            let upstream = self.plan.graph[current].id().clone();

            for dependent in self.dependents(current) {
                let node = &mut self.plan.graph[dependent];
                if !matches!(node.state, State::Pending | State::Ready) {
                    continue;
                }

                let reason = SkipReason::Dependency {
                    upstream: upstream.clone(),
                };

                if node.transition(State::Skipped(reason)) {
                    tracing::info!("'{}' skipped, '{upstream}' did not succeed", node.id());
                    self.span.pb_inc(1);
                    stack.push(dependent);
                }
            }
        }
    }

    /// Skips every node that has not been dispatched yet. Returns how many
    /// nodes were skipped.
    fn skip_waiting(&mut self) -> usize {
        self.ready.clear();
        let mut skipped = 0;

        for node in self.plan.graph.node_weights_mut() {
            if matches!(node.state, State::Pending | State::Ready)
                && node.transition(State::Skipped(SkipReason::Cancelled))
            {
                skipped += 1;
            }
        }

        self.span.pb_inc(skipped as u64);
        skipped
    }

    /// Stops waiting on calls that did not report within the grace period.
    fn abandon_running(&mut self) {
        for node in self.plan.graph.node_weights_mut() {
            if node.state == State::Running {
                tracing::warn!("'{}' abandoned after cancellation", node.id());
                node.transition(State::Failed(NodeError::Cancelled));
            }
        }
    }
}

/// Calls the provider until it succeeds, fails permanently, exhausts the
/// retry budget or the request is cancelled. Returns the number of attempts.
async fn call_with_retries(
    provider: &dyn Provider,
    input: Input,
    policy: &Policy,
    token: &CancellationToken,
) -> (Result<Value, NodeError>, u32) {
    let mut attempts = 0;

    loop {
        attempts += 1;

        // building the future may panic as well as polling it
        let call = AssertUnwindSafe(async { provider.call(input.clone(), token.clone()).await })
            .catch_unwind();
        let err = match timeout(policy.timeout, call).await {
            Ok(Ok(Ok(value))) => return (Ok(value), attempts),
            Ok(Ok(Err(err))) => NodeError::from(err),
            Ok(Err(panic)) => NodeError::Provider(panic_message(panic)),
            Err(_) => NodeError::Timeout(policy.timeout),
        };

        if !err.is_retryable() || attempts > policy.retry_budget {
            return (Err(err), attempts);
        }

        if token.is_cancelled() {
            return (Err(NodeError::Cancelled), attempts);
        }

        let delay = policy.backoff.delay(attempts);
        tracing::warn!("attempt {attempts} failed: {err}, retrying in {delay:?}");

        tokio::select! {
            _ = token.cancelled() => return (Err(NodeError::Cancelled), attempts),
            _ = sleep(delay) => {}
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Provider panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Provider panicked: {s}")
    } else {
        String::from("Provider panicked with unknown payload")
    }
}
