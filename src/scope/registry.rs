//! Scope registry: declared scope requirements, one entry per operation.
//!
//! The registry has two phases. While open, operations register their
//! requirements and the declared-scope union grows. After [`freeze`] it is
//! read-only: further registrations fail with [`Error::RegistryFrozen`], so
//! the scope set the authorization bridge computed can never go stale.
//!
//! [`freeze`]: ScopeRegistry::freeze

use std::collections::HashMap;

use tracing::debug;

use super::ScopeSet;
use crate::{Error, Result};

/// Scopes one operation needs from the upstream grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRequirement {
    /// Stable operation name
    pub operation: String,
    /// Required scope identifiers (order irrelevant)
    pub scopes: ScopeSet,
}

/// Registry of per-operation scope requirements.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    requirements: HashMap<String, ScopeRequirement>,
    declared: ScopeSet,
    frozen: bool,
}

impl ScopeRegistry {
    /// Create an empty, open registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the scopes `operation` requires.
    pub fn register(&mut self, operation: &str, scopes: ScopeSet) -> Result<()> {
        if self.frozen {
            return Err(Error::RegistryFrozen(operation.to_string()));
        }
        if self.requirements.contains_key(operation) {
            return Err(Error::DuplicateRegistration(operation.to_string()));
        }

        debug!(operation = %operation, scopes = ?scopes, "Registered scope requirement");
        self.declared.extend(scopes.iter().cloned());
        self.requirements.insert(
            operation.to_string(),
            ScopeRequirement {
                operation: operation.to_string(),
                scopes,
            },
        );
        Ok(())
    }

    /// Make the registry read-only. Idempotent.
    pub fn freeze(&mut self) {
        if !self.frozen {
            debug!(
                operations = self.requirements.len(),
                declared = self.declared.len(),
                "Scope registry frozen"
            );
        }
        self.frozen = true;
    }

    /// Whether [`freeze`](Self::freeze) has been called.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Union of the scopes required by every registered operation.
    #[must_use]
    pub fn declared_scopes(&self) -> ScopeSet {
        self.declared.clone()
    }

    /// Scopes required by `operation`.
    pub fn requirements_for(&self, operation: &str) -> Result<&ScopeSet> {
        self.requirements
            .get(operation)
            .map(|r| &r.scopes)
            .ok_or_else(|| Error::UnknownOperation(operation.to_string()))
    }

    /// All requirements, sorted by operation name.
    #[must_use]
    pub fn requirements(&self) -> Vec<&ScopeRequirement> {
        let mut all: Vec<_> = self.requirements.values().collect();
        all.sort_by(|a, b| a.operation.cmp(&b.operation));
        all
    }

    /// Number of registered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    /// `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}
