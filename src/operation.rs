//! Operations and the catalog that registers them.
//!
//! An operation is registered as a [`Capability`]: its name, the upstream
//! scopes it needs and its handler. Registering a capability records its
//! scope requirement in the catalog's [`ScopeRegistry`]; the catalog is
//! frozen together with the registry before the server starts.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::credential::token_tail;
use crate::scope::{ScopeRegistry, ScopeSet};
use crate::{Error, Result};

/// Upstream access token handed to an operation.
///
/// Only the raw value is reachable, through [`secret`](Self::secret); it
/// neither serializes nor displays.
#[derive(Clone)]
pub struct UpstreamToken(String);

impl UpstreamToken {
    pub(crate) fn new(token: String) -> Self {
        Self(token)
    }

    /// Raw access token, for the `Authorization` header
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UpstreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpstreamToken(…{})", token_tail(&self.0))
    }
}

/// A business operation invoked through the enforcement gate.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    /// Run with a valid upstream token and the caller's JSON arguments.
    async fn call(&self, token: UpstreamToken, args: Value) -> Result<Value>;
}

/// Adapter turning an async closure into an [`Operation`].
pub struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(UpstreamToken, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, token: UpstreamToken, args: Value) -> Result<Value> {
        (self.0)(token, args).await
    }
}

/// Wrap an async closure as an operation handler.
pub fn operation_fn<F, Fut>(f: F) -> Arc<dyn Operation>
where
    F: Fn(UpstreamToken, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnOperation(f))
}

/// How an operation is presented to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Callable with arguments
    Tool,
    /// Read-only document
    Resource,
}

/// Capability descriptor: name, scopes and handler.
#[derive(Clone)]
pub struct Capability {
    /// Stable operation name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Tool or resource
    pub kind: OperationKind,
    /// Required upstream scopes
    pub scopes: ScopeSet,
    /// Handler
    pub handler: Arc<dyn Operation>,
}

impl Capability {
    /// Tool capability
    pub fn tool(
        name: impl Into<String>,
        description: impl Into<String>,
        scopes: ScopeSet,
        handler: Arc<dyn Operation>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: OperationKind::Tool,
            scopes,
            handler,
        }
    }

    /// Resource capability
    pub fn resource(
        name: impl Into<String>,
        description: impl Into<String>,
        scopes: ScopeSet,
        handler: Arc<dyn Operation>,
    ) -> Self {
        Self {
            kind: OperationKind::Resource,
            ..Self::tool(name, description, scopes, handler)
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// Registered capabilities plus their scope registry.
#[derive(Default)]
pub struct OperationCatalog {
    registry: ScopeRegistry,
    capabilities: HashMap<String, Capability>,
}

impl OperationCatalog {
    /// Empty, open catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. Fails if the name is taken or the catalog is frozen.
    pub fn register(&mut self, capability: Capability) -> Result<()> {
        self.registry
            .register(&capability.name, capability.scopes.clone())?;
        self.capabilities
            .insert(capability.name.clone(), capability);
        Ok(())
    }

    /// Freeze the catalog and its registry.
    pub fn freeze(&mut self) {
        self.registry.freeze();
    }

    /// Scope registry backing the catalog
    #[must_use]
    pub fn registry(&self) -> &ScopeRegistry {
        &self.registry
    }

    /// Look up a capability.
    pub fn get(&self, name: &str) -> Result<&Capability> {
        self.capabilities
            .get(name)
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))
    }

    /// Capabilities sorted by name
    #[must_use]
    pub fn capabilities(&self) -> Vec<&Capability> {
        let mut all: Vec<_> = self.capabilities.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Number of registered capabilities
    #[must_use]
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// `true` when nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}
