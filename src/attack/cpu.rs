//! CPU Spike Attack
//!
//! Runs `cores` busy OS threads, each burning `load` percent of every
//! 100ms slice, until reverted.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::options::{OptionKind, OptionSchema, OptionSpec};
use super::{Attack, AttackPhase, Opts};
use crate::error::{InjectorError, InjectorResult};

const SLICE: Duration = Duration::from_millis(100);
/// Upper bound on `cores`, as a multiple of the host's parallelism
const OVERSUBSCRIBE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSpikeConfig {
    /// Number of busy worker threads
    pub cores: usize,
    /// Duty cycle per worker, 1..=100
    pub load: u8,
}

pub struct CpuSpike {
    config: CpuSpikeConfig,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl CpuSpike {
    pub const KIND: &'static str = "cpu_spike";

    pub const SCHEMA: OptionSchema = OptionSchema::new(
        Self::KIND,
        &[
            OptionSpec::optional("cores", OptionKind::PositiveInteger),
            OptionSpec::optional("load", OptionKind::Range { min: 1, max: 100 }),
        ],
    );

    pub fn new(config: CpuSpikeConfig) -> Self {
        Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    pub fn from_opts(opts: Option<&Opts>) -> InjectorResult<Self> {
        let options = Self::SCHEMA.validate(opts)?;
        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let cores = match options.integer("cores") {
            Some(cores) => usize::try_from(cores)
                .map_err(|_| InjectorError::option(Self::KIND, "cores", "value does not fit this platform"))?,
            None => parallelism,
        };
        let max_cores = parallelism * OVERSUBSCRIBE;
        if cores > max_cores {
            return Err(InjectorError::option(
                Self::KIND,
                "cores",
                format!("must be at most {} on this host, got {}", max_cores, cores),
            ));
        }
        // Range-checked to 1..=100 by the schema
        let load = options.integer("load").unwrap_or(100) as u8;
        Ok(Self::new(CpuSpikeConfig { cores, load }))
    }

    pub fn config(&self) -> CpuSpikeConfig {
        self.config
    }

    pub fn running_workers(&self) -> usize {
        self.workers.len()
    }

    fn burn(stop: Arc<AtomicBool>, load: u8) {
        let busy = SLICE * u32::from(load) / 100;
        let idle = SLICE - busy;
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            while started.elapsed() < busy {
                std::hint::spin_loop();
            }
            if !idle.is_zero() {
                std::thread::sleep(idle);
            }
        }
    }

    fn stop_workers(&mut self) -> Vec<JoinHandle<()>> {
        self.stop.store(true, Ordering::SeqCst);
        std::mem::take(&mut self.workers)
    }
}

#[async_trait]
impl Attack for CpuSpike {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn phase(&self) -> AttackPhase {
        if self.workers.is_empty() {
            AttackPhase::Idle
        } else {
            AttackPhase::Applied
        }
    }

    async fn apply(&mut self, cancel: &CancellationToken) -> InjectorResult<()> {
        if cancel.is_cancelled() {
            return Err(InjectorError::Cancelled { applied: 0 });
        }
        if !self.workers.is_empty() {
            return Err(InjectorError::AlreadyApplied);
        }

        self.stop = Arc::new(AtomicBool::new(false));
        for index in 0..self.config.cores {
            let stop = self.stop.clone();
            let load = self.config.load;
            let spawned = std::thread::Builder::new()
                .name(format!("cpu-spike-{}", index))
                .spawn(move || Self::burn(stop, load));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    let started = self.stop_workers();
                    for worker in started {
                        let _ = worker.join();
                    }
                    return Err(InjectorError::Attack(format!("cannot start cpu worker: {}", e)));
                }
            }
        }
        info!("cpu_spike: {} workers at {}% load", self.config.cores, self.config.load);
        Ok(())
    }

    async fn revert(&mut self) -> InjectorResult<()> {
        let workers = self.stop_workers();
        if workers.is_empty() {
            return Ok(());
        }
        let panicked = tokio::task::spawn_blocking(move || {
            workers.into_iter().map(JoinHandle::join).filter(Result::is_err).count()
        })
        .await
        .map_err(|e| InjectorError::Attack(format!("cpu worker join failed: {}", e)))?;

        if panicked > 0 {
            warn!("cpu_spike: {} workers panicked", panicked);
            return Err(InjectorError::Attack(format!("{} cpu workers panicked", panicked)));
        }
        Ok(())
    }
}

impl Drop for CpuSpike {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(yaml: &str) -> Opts {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_spike_apply_revert() {
        let mut attack = CpuSpike::from_opts(Some(&opts("cores: 2\nload: 10"))).unwrap();
        let cancel = CancellationToken::new();

        attack.apply(&cancel).await.unwrap();
        assert!(attack.is_applied());
        assert_eq!(attack.running_workers(), 2);
        assert!(matches!(attack.apply(&cancel).await, Err(InjectorError::AlreadyApplied)));

        attack.revert().await.unwrap();
        assert!(!attack.is_applied());
        assert_eq!(attack.running_workers(), 0);
    }

    #[test]
    fn test_spike_defaults() {
        let attack = CpuSpike::from_opts(None).unwrap();
        assert!(attack.config().cores >= 1);
        assert_eq!(attack.config().load, 100);
    }

    #[test]
    fn test_spike_rejects_bad_load() {
        assert!(CpuSpike::from_opts(Some(&opts("load: 0"))).is_err());
        assert!(CpuSpike::from_opts(Some(&opts("load: 150"))).is_err());
        assert!(CpuSpike::from_opts(Some(&opts("cores: 0"))).is_err());
    }

    #[test]
    fn test_spike_caps_cores() {
        let err = CpuSpike::from_opts(Some(&opts("cores: 100000"))).err().unwrap();
        assert!(matches!(err, InjectorError::InvalidOption { .. }));
        assert!(err.to_string().contains("cores"));

        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let at_cap = format!("cores: {}\nload: 1", parallelism * OVERSUBSCRIBE);
        assert!(CpuSpike::from_opts(Some(&opts(&at_cap))).is_ok());
    }
}
