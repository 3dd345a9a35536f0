use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::{CapabilityId, Input, InputShape, Value};
use crate::error::{PlanError, ProviderError};

/// The external operation backing a capability.
///
/// Providers must be safe to call concurrently with unrelated providers and
/// safe to retry. The cancellation token is cooperative: a provider is expected
/// to return [`ProviderError::Cancelled`] promptly once it fires, but the
/// orchestrator never kills a call forcibly.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn call(&self, input: Input, cancel: CancellationToken) -> Result<Value, ProviderError>;
}

/// Adapts an async closure into a [`Provider`].
///
/// # Example
///
/// ```rust
/// use locus::{Provider, provider_fn};
/// use serde_json::json;
///
/// let weather = provider_fn(|input, _cancel| async move {
///     let location = input.param_str("location").unwrap_or("here").to_string();
///     Ok(json!({ "location": location, "sky": "clear" }))
/// });
/// ```
pub fn provider_fn<F, Fut>(func: F) -> Arc<dyn Provider>
where
    F: Fn(Input, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProviderError>> + Send + 'static,
{
    Arc::new(FnProvider(func))
}

struct FnProvider<F>(F);

#[async_trait]
impl<F, Fut> Provider for FnProvider<F>
where
    F: Fn(Input, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProviderError>> + Send + 'static,
{
    async fn call(&self, input: Input, cancel: CancellationToken) -> Result<Value, ProviderError> {
        (self.0)(input, cancel).await
    }
}

/// A provider made of an ordered chain of alternatives.
///
/// The first member to succeed wins. If every member fails, the chain reports
/// a transient error when any member failed transiently, so that the scheduler
/// may retry the whole chain; otherwise the last error is returned.
pub struct Fallback {
    chain: Vec<Arc<dyn Provider>>,
}

impl Fallback {
    pub fn new(primary: Arc<dyn Provider>) -> Self {
        Self {
            chain: vec![primary],
        }
    }

    pub fn or(mut self, secondary: Arc<dyn Provider>) -> Self {
        self.chain.push(secondary);
        self
    }

    pub fn finish(self) -> Arc<dyn Provider> {
        Arc::new(self)
    }
}

#[async_trait]
impl Provider for Fallback {
    async fn call(&self, input: Input, cancel: CancellationToken) -> Result<Value, ProviderError> {
        let mut transient = None;
        let mut last = None;

        for (i, provider) in self.chain.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            match provider.call(input.clone(), cancel.clone()).await {
                Ok(value) => return Ok(value),
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(ProviderError::Transient(err)) => {
                    tracing::debug!("fallback member {i} failed transiently: {err:#}");
                    transient = Some(err);
                }
                Err(ProviderError::Fatal(err)) => {
                    tracing::debug!("fallback member {i} failed: {err:#}");
                    last = Some(err);
                }
            }
        }

        match (transient, last) {
            (Some(err), _) => Err(ProviderError::Transient(err)),
            (None, Some(err)) => Err(ProviderError::Fatal(err)),
            (None, None) => Err(ProviderError::fatal(anyhow::anyhow!(
                "fallback chain is empty"
            ))),
        }
    }
}

/// A named unit of work with declared dependencies and a backing provider.
pub struct Capability {
    pub(crate) id: CapabilityId,
    pub(crate) dependencies: Vec<CapabilityId>,
    pub(crate) input: InputShape,
    pub(crate) provider: Arc<dyn Provider>,
}

impl Capability {
    pub fn new(id: impl AsRef<str>, provider: Arc<dyn Provider>) -> Self {
        Self {
            id: id.as_ref().into(),
            dependencies: Vec::new(),
            input: InputShape::default(),
            provider,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for dep in dependencies {
            let dep = dep.as_ref();
            if !self.dependencies.iter().any(|known| known.as_ref() == dep) {
                self.dependencies.push(dep.into());
            }
        }
        self
    }

    pub fn input(mut self, shape: InputShape) -> Self {
        self.input = shape;
        self
    }

    pub fn id(&self) -> &CapabilityId {
        &self.id
    }

    pub fn dependencies(&self) -> &[CapabilityId] {
        &self.dependencies
    }

    pub fn input_shape(&self) -> &InputShape {
        &self.input
    }
}

impl Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

/// Static catalogue of known capabilities.
///
/// The registry is filled once at start-up and is read-only afterwards,
/// typically shared behind an [`Arc`]. Registration order is remembered and
/// used to break ties wherever the orchestrator needs a deterministic order.
#[derive(Debug, Default)]
pub struct Registry {
    capabilities: Vec<Arc<Capability>>,
    index: HashMap<CapabilityId, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Capability) -> Result<(), PlanError> {
        if self.index.contains_key(&capability.id) {
            return Err(PlanError::DuplicateCapability(capability.id));
        }

        self.index
            .insert(capability.id.clone(), self.capabilities.len());
        self.capabilities.push(Arc::new(capability));
        Ok(())
    }

    /// The entry point of the fluent definition API.
    ///
    /// ```rust
    /// use locus::{Registry, provider_fn};
    /// use serde_json::json;
    ///
    /// let mut registry = Registry::new();
    /// registry
    ///     .capability("weather")
    ///     .provider(provider_fn(|_, _| async { Ok(json!("sunny")) }))
    ///     .register()?;
    /// # Ok::<(), locus::PlanError>(())
    /// ```
    pub fn capability(&mut self, id: impl AsRef<str>) -> CapabilityDef<'_> {
        CapabilityDef {
            registry: self,
            id: id.as_ref().into(),
            dependencies: Vec::new(),
            input: InputShape::default(),
        }
    }

    pub fn lookup(&self, id: &str) -> Result<&Arc<Capability>, PlanError> {
        self.index
            .get(id)
            .map(|&i| &self.capabilities[i])
            .ok_or_else(|| PlanError::UnknownCapability(id.into()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Position of the capability in registration order.
    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Capabilities in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Capability>> {
        self.capabilities.iter()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Checks that every declared dependency refers to a registered capability.
    pub fn validate(&self) -> Result<(), PlanError> {
        for capability in &self.capabilities {
            for dep in &capability.dependencies {
                if !self.contains(dep) {
                    return Err(PlanError::UnknownCapability(dep.clone()));
                }
            }
        }

        Ok(())
    }
}

pub struct CapabilityDef<'a> {
    registry: &'a mut Registry,
    id: CapabilityId,
    dependencies: Vec<CapabilityId>,
    input: InputShape,
}

impl<'a> CapabilityDef<'a> {
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(|dep| dep.as_ref().into()));
        self
    }

    pub fn input(mut self, shape: InputShape) -> Self {
        self.input = shape;
        self
    }

    pub fn provider(self, provider: Arc<dyn Provider>) -> CapabilityBinder<'a> {
        CapabilityBinder {
            registry: self.registry,
            capability: Capability::new(&self.id, provider)
                .depends_on(&self.dependencies)
                .input(self.input),
        }
    }
}

pub struct CapabilityBinder<'a> {
    registry: &'a mut Registry,
    capability: Capability,
}

impl CapabilityBinder<'_> {
    pub fn register(self) -> Result<(), PlanError> {
        self.registry.register(self.capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(value: Value) -> Arc<dyn Provider> {
        provider_fn(move |_, _| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    fn failing(transient: bool) -> Arc<dyn Provider> {
        provider_fn(move |_, _| async move {
            if transient {
                Err(ProviderError::transient(anyhow::anyhow!("connection reset")))
            } else {
                Err(ProviderError::fatal(anyhow::anyhow!("no such city")))
            }
        })
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        registry
            .capability("weather")
            .provider(constant(json!("sunny")))
            .register()
            .unwrap();
        registry
            .capability("wardrobe")
            .depends_on(["weather"])
            .provider(constant(json!([])))
            .register()
            .unwrap();

        let wardrobe = registry.lookup("wardrobe").unwrap();
        let deps: Vec<&str> = wardrobe.dependencies().iter().map(AsRef::as_ref).collect();
        assert_eq!(deps, ["weather"]);
        assert_eq!(registry.position("wardrobe"), Some(1));
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_duplicate_capability() {
        let mut registry = Registry::new();
        registry
            .register(Capability::new("weather", constant(json!(1))))
            .unwrap();

        let err = registry
            .register(Capability::new("weather", constant(json!(2))))
            .unwrap_err();
        assert_eq!(err, PlanError::DuplicateCapability("weather".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_capability() {
        let registry = Registry::new();
        let err = registry.lookup("culture_food").unwrap_err();
        assert_eq!(err, PlanError::UnknownCapability("culture_food".into()));
    }

    #[test]
    fn test_validate_reports_missing_dependency() {
        let mut registry = Registry::new();
        registry
            .register(Capability::new("explorer", constant(json!(1))).depends_on(["weather"]))
            .unwrap();

        assert_eq!(
            registry.validate().unwrap_err(),
            PlanError::UnknownCapability("weather".into())
        );
    }

    #[tokio::test]
    async fn test_fallback_uses_secondary() {
        let provider = Fallback::new(failing(false))
            .or(constant(json!("from secondary")))
            .finish();

        let value = provider
            .call(Input::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, json!("from secondary"));
    }

    #[tokio::test]
    async fn test_fallback_prefers_transient_error() {
        let provider = Fallback::new(failing(true)).or(failing(false)).finish();

        let err = provider
            .call(Input::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transient(_)));
    }

    #[tokio::test]
    async fn test_fallback_stops_on_cancel() {
        let provider = Fallback::new(constant(json!(1))).finish();
        let token = CancellationToken::new();
        token.cancel();

        let err = provider.call(Input::default(), token).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }
}
