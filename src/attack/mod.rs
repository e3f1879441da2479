//! Attack System Module
//!
//! An attack is a single unit of injected harm with a two-phase contract:
//! `apply` starts (or intensifies) it, `revert` undoes it. Attacks are built
//! by factories in the [`AttackRegistry`], which validate the options bag
//! eagerly so that a bad option never survives past construction.

mod cpu;
mod memory;
pub mod options;
mod registry;

pub use cpu::{CpuSpike, CpuSpikeConfig};
pub use memory::{MemoryAllocation, MemoryAllocationConfig, MemoryLeak, MemoryLeakConfig};
pub use options::{AttackOptions, OptionKind, OptionSchema, OptionSpec};
pub use registry::{AttackFactory, AttackRegistry};

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::error::InjectorResult;

/// Untyped options bag as written in a definition document
pub type Opts = BTreeMap<String, serde_yaml::Value>;

/// Runtime phase of a single attack instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackPhase {
    Idle,
    Applied,
}

/// Trait for attacks that can be applied to the local node
#[async_trait]
pub trait Attack: Send + Sync {
    /// Registry name of this attack kind
    fn kind(&self) -> &str;

    /// Current phase
    fn phase(&self) -> AttackPhase;

    /// Start the attack.
    ///
    /// Fails with `AlreadyApplied` when called twice without a revert in
    /// between. Returns `Cancelled` without touching state if `cancel` has
    /// fired before any work started.
    async fn apply(&mut self, cancel: &CancellationToken) -> InjectorResult<()>;

    /// Release everything the attack holds and go back to `Idle`
    async fn revert(&mut self) -> InjectorResult<()>;

    fn is_applied(&self) -> bool {
        self.phase() == AttackPhase::Applied
    }
}
