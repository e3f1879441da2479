use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{Attack, CpuSpike, MemoryAllocation, MemoryLeak, Opts};
use crate::error::{InjectorError, InjectorResult};

/// Constructor for one attack kind; validates `Opts` before building
pub type AttackFactory = Arc<dyn Fn(Option<&Opts>) -> InjectorResult<Box<dyn Attack>> + Send + Sync>;

/// Maps attack-kind names to their factories.
///
/// Populated explicitly at startup, then shared read-only behind an `Arc`.
#[derive(Clone, Default)]
pub struct AttackRegistry {
    factories: HashMap<String, AttackFactory>,
}

impl AttackRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in attack kind
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(MemoryAllocation::KIND, |opts| {
            Ok(Box::new(MemoryAllocation::from_opts(opts)?) as Box<dyn Attack>)
        });
        registry.register(MemoryLeak::KIND, |opts| {
            Ok(Box::new(MemoryLeak::from_opts(opts)?) as Box<dyn Attack>)
        });
        registry.register(CpuSpike::KIND, |opts| {
            Ok(Box::new(CpuSpike::from_opts(opts)?) as Box<dyn Attack>)
        });
        registry
    }

    /// Register (or replace) the factory for `kind`
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(Option<&Opts>) -> InjectorResult<Box<dyn Attack>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        debug!("Registered attack kind: {}", kind);
        self.factories.insert(kind, Arc::new(factory));
    }

    /// Build a validated attack of the given kind
    pub fn create(&self, kind: &str, opts: Option<&Opts>) -> InjectorResult<Box<dyn Attack>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| InjectorError::UnknownAttack(kind.to_string()))?;
        factory(opts)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Sorted list of registered kinds
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
