//! Memory Attacks
//!
//! `memory_allocation` grabs a fixed block at apply time; `memory_leak` grows
//! a leak periodically until stopped or until its limit is reached.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::options::{OptionKind, OptionSchema, OptionSpec};
use super::{Attack, AttackPhase, Opts};
use crate::error::{InjectorError, InjectorResult};

/// Allocate `size` bytes and write to every byte so the pages are resident
fn allocate(size: usize) -> InjectorResult<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|e| InjectorError::Attack(format!("cannot allocate {} bytes: {}", size, e)))?;
    buffer.resize(size, 0xA5);
    Ok(buffer)
}

fn to_usize(kind: &str, option: &str, value: u64) -> InjectorResult<usize> {
    usize::try_from(value).map_err(|_| InjectorError::option(kind, option, "value does not fit this platform"))
}

// ──────────────────────────────────────────────────────────────────────────────
// MEMORY ALLOCATION
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAllocationConfig {
    /// Bytes to hold while applied
    pub size: usize,
}

pub struct MemoryAllocation {
    config: MemoryAllocationConfig,
    buffer: Option<Vec<u8>>,
}

impl MemoryAllocation {
    pub const KIND: &'static str = "memory_allocation";

    pub const SCHEMA: OptionSchema = OptionSchema::new(
        Self::KIND,
        &[OptionSpec::required("size", OptionKind::PositiveInteger)],
    );

    pub fn new(config: MemoryAllocationConfig) -> Self {
        Self { config, buffer: None }
    }

    pub fn from_opts(opts: Option<&Opts>) -> InjectorResult<Self> {
        let options = Self::SCHEMA.validate(opts)?;
        let size = options
            .integer("size")
            .ok_or_else(|| InjectorError::option(Self::KIND, "size", "missing required option"))?;
        Ok(Self::new(MemoryAllocationConfig {
            size: to_usize(Self::KIND, "size", size)?,
        }))
    }

    pub fn config(&self) -> MemoryAllocationConfig {
        self.config
    }

    /// Bytes currently held
    pub fn allocated(&self) -> usize {
        self.buffer.as_ref().map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl Attack for MemoryAllocation {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn phase(&self) -> AttackPhase {
        if self.buffer.is_some() {
            AttackPhase::Applied
        } else {
            AttackPhase::Idle
        }
    }

    async fn apply(&mut self, cancel: &CancellationToken) -> InjectorResult<()> {
        if cancel.is_cancelled() {
            return Err(InjectorError::Cancelled { applied: 0 });
        }
        if self.buffer.is_some() {
            return Err(InjectorError::AlreadyApplied);
        }

        let size = self.config.size;
        let buffer = tokio::task::spawn_blocking(move || allocate(size))
            .await
            .map_err(|e| InjectorError::Attack(format!("allocation task failed: {}", e)))??;
        self.buffer = Some(buffer);
        info!("memory_allocation: holding {} bytes", size);
        Ok(())
    }

    async fn revert(&mut self) -> InjectorResult<()> {
        // Dropping the buffer hands it back to the allocator; whether the
        // allocator returns it to the OS is up to the allocator.
        if let Some(buffer) = self.buffer.take() {
            debug!("memory_allocation: releasing {} bytes", buffer.len());
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// MEMORY LEAK
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLeakConfig {
    /// Bytes leaked per step
    pub size: usize,
    /// Time between steps
    pub interval: Duration,
    /// Stop growing once this many bytes are held
    pub limit: Option<usize>,
}

pub struct MemoryLeak {
    config: MemoryLeakConfig,
    leaked: Arc<AtomicUsize>,
    stop: Option<CancellationToken>,
    task: Option<JoinHandle<Vec<Vec<u8>>>>,
}

impl MemoryLeak {
    pub const KIND: &'static str = "memory_leak";

    pub const SCHEMA: OptionSchema = OptionSchema::new(
        Self::KIND,
        &[
            OptionSpec::required("size", OptionKind::PositiveInteger),
            OptionSpec::optional("interval", OptionKind::Duration),
            OptionSpec::optional("limit", OptionKind::PositiveInteger),
        ],
    );

    const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(config: MemoryLeakConfig) -> Self {
        Self {
            config,
            leaked: Arc::new(AtomicUsize::new(0)),
            stop: None,
            task: None,
        }
    }

    pub fn from_opts(opts: Option<&Opts>) -> InjectorResult<Self> {
        let options = Self::SCHEMA.validate(opts)?;
        let size = options
            .integer("size")
            .ok_or_else(|| InjectorError::option(Self::KIND, "size", "missing required option"))?;
        let interval = options.duration("interval").unwrap_or(Self::DEFAULT_INTERVAL);
        if interval.is_zero() {
            return Err(InjectorError::option(Self::KIND, "interval", "must be greater than zero"));
        }
        let limit = options
            .integer("limit")
            .map(|limit| to_usize(Self::KIND, "limit", limit))
            .transpose()?;

        Ok(Self::new(MemoryLeakConfig {
            size: to_usize(Self::KIND, "size", size)?,
            interval,
            limit,
        }))
    }

    pub fn config(&self) -> MemoryLeakConfig {
        self.config
    }

    /// Bytes leaked so far
    pub fn leaked(&self) -> usize {
        self.leaked.load(Ordering::SeqCst)
    }

    async fn leak_loop(config: MemoryLeakConfig, leaked: Arc<AtomicUsize>, stop: CancellationToken) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let held = leaked.load(Ordering::SeqCst);
                    let step = match config.limit {
                        Some(limit) => config.size.min(limit.saturating_sub(held)),
                        None => config.size,
                    };
                    if step == 0 {
                        continue;
                    }
                    // Filling a large chunk must not stall the executor
                    match tokio::task::spawn_blocking(move || allocate(step)).await {
                        Ok(Ok(chunk)) => {
                            chunks.push(chunk);
                            leaked.fetch_add(step, Ordering::SeqCst);
                        }
                        Ok(Err(e)) => warn!("memory_leak: {}", e),
                        Err(e) => warn!("memory_leak: allocation task failed: {}", e),
                    }
                }
            }
        }
        chunks
    }
}

#[async_trait]
impl Attack for MemoryLeak {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn phase(&self) -> AttackPhase {
        if self.task.is_some() {
            AttackPhase::Applied
        } else {
            AttackPhase::Idle
        }
    }

    async fn apply(&mut self, cancel: &CancellationToken) -> InjectorResult<()> {
        if cancel.is_cancelled() {
            return Err(InjectorError::Cancelled { applied: 0 });
        }
        if self.task.is_some() {
            return Err(InjectorError::AlreadyApplied);
        }

        let stop = CancellationToken::new();
        let task = tokio::spawn(Self::leak_loop(self.config, self.leaked.clone(), stop.clone()));
        self.stop = Some(stop);
        self.task = Some(task);
        info!(
            "memory_leak: leaking {} bytes every {:?} (limit: {:?})",
            self.config.size, self.config.interval, self.config.limit
        );
        Ok(())
    }

    async fn revert(&mut self) -> InjectorResult<()> {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        let result = match self.task.take() {
            Some(task) => match task.await {
                Ok(chunks) => {
                    debug!("memory_leak: releasing {} chunks", chunks.len());
                    Ok(())
                }
                Err(e) => Err(InjectorError::Attack(format!("leak task failed: {}", e))),
            },
            None => Ok(()),
        };
        self.leaked.store(0, Ordering::SeqCst);
        result
    }
}

impl Drop for MemoryLeak {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}
