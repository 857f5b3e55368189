//! Background resource supervision
//!
//! A [`ResourceMonitor`] polls one [`MonitorTarget`] at a fixed interval and
//! compares each sample against the configured ceilings. The first breach
//! terminates the target, is published on a watch channel and ends sampling.
//!
//! ```text
//! Idle --start_monitoring--> Watching --breach--> Exceeded --stop--> Stopped
//!                               \------------stop_monitoring--------> Stopped
//! ```

mod target;

pub use target::{InterpreterTarget, ProcessTarget};

use crate::config::SandboxConfiguration;
use crate::types::{duration_ms, ResourceBreach, ResourceKind, ResourceUsage, UsageStats};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One observation of a running target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSample {
    pub cpu_time: Duration,
    pub memory_bytes: u64,
    pub open_files: u64,
}

/// Something the monitor can observe and stop
pub trait MonitorTarget: Send + Sync + 'static {
    /// Current usage, or `None` once the target has gone away
    fn sample(&self) -> Option<ResourceSample>;

    /// Stop the target as soon as possible
    fn terminate(&self);

    fn describe(&self) -> String;
}

/// Ceilings checked on every sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorLimits {
    pub max_cpu_time: Duration,
    pub max_memory: u64,
    pub max_open_files: u64,
    pub interval: Duration,
}

impl MonitorLimits {
    pub fn from_config(config: &SandboxConfiguration) -> Self {
        Self {
            max_cpu_time: config.limits.max_cpu_time,
            max_memory: config.limits.max_memory,
            max_open_files: config.limits.max_open_files,
            interval: config.monitor_interval,
        }
    }

    /// First ceiling `sample` crosses, if any
    pub fn check(&self, sample: &ResourceSample) -> Option<ResourceBreach> {
        if sample.cpu_time > self.max_cpu_time {
            return Some(ResourceBreach::new(
                ResourceKind::CpuTime,
                duration_ms(self.max_cpu_time),
                duration_ms(sample.cpu_time),
            ));
        }
        if sample.memory_bytes > self.max_memory {
            return Some(ResourceBreach::new(
                ResourceKind::Memory,
                self.max_memory,
                sample.memory_bytes,
            ));
        }
        if sample.open_files > self.max_open_files {
            return Some(ResourceBreach::new(
                ResourceKind::FileDescriptors,
                self.max_open_files,
                sample.open_files,
            ));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Watching,
    Exceeded,
    Stopped,
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("resource monitor cannot be started from state {0:?}")]
    AlreadyStarted(MonitorState),
}

#[derive(Debug, Default)]
struct Accumulator {
    samples: u64,
    cpu_time: Duration,
    memory_peak: u64,
    memory_total: u128,
    files_peak: u64,
    files_total: u128,
}

impl Accumulator {
    fn record(&mut self, sample: &ResourceSample) {
        self.samples += 1;
        self.cpu_time = self.cpu_time.max(sample.cpu_time);
        self.memory_peak = self.memory_peak.max(sample.memory_bytes);
        self.memory_total += u128::from(sample.memory_bytes);
        self.files_peak = self.files_peak.max(sample.open_files);
        self.files_total += u128::from(sample.open_files);
    }

    fn summary(&self) -> ResourceUsage {
        let average = |total: u128| {
            if self.samples == 0 {
                0
            } else {
                u64::try_from(total / u128::from(self.samples)).unwrap_or(u64::MAX)
            }
        };
        ResourceUsage {
            cpu_time_ms: duration_ms(self.cpu_time),
            memory: UsageStats {
                peak: self.memory_peak,
                average: average(self.memory_total),
            },
            open_files: UsageStats {
                peak: self.files_peak,
                average: average(self.files_total),
            },
            sample_count: self.samples,
        }
    }
}

/// Receives the breach, if one happens
#[derive(Debug, Clone)]
pub struct BreachSignal(watch::Receiver<Option<ResourceBreach>>);

impl BreachSignal {
    /// Resolves with the breach; pends forever if the monitor stops without one
    pub async fn wait(&mut self) -> ResourceBreach {
        loop {
            if let Some(breach) = *self.0.borrow_and_update() {
                return breach;
            }
            if self.0.changed().await.is_err() {
                if let Some(breach) = *self.0.borrow() {
                    return breach;
                }
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn current(&self) -> Option<ResourceBreach> {
        *self.0.borrow()
    }
}

/// Waits on an optional signal; pends forever when there is none
pub async fn breach_of(signal: &mut Option<BreachSignal>) -> ResourceBreach {
    match signal {
        Some(signal) => signal.wait().await,
        None => std::future::pending().await,
    }
}

/// Per-execution watcher of CPU time, memory and descriptors
pub struct ResourceMonitor {
    limits: MonitorLimits,
    state: Arc<Mutex<MonitorState>>,
    usage: Arc<Mutex<Accumulator>>,
    breach_tx: Option<watch::Sender<Option<ResourceBreach>>>,
    breach_rx: watch::Receiver<Option<ResourceBreach>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    pub fn new(limits: MonitorLimits) -> Self {
        let (breach_tx, breach_rx) = watch::channel(None);
        Self {
            limits,
            state: Arc::new(Mutex::new(MonitorState::Idle)),
            usage: Arc::new(Mutex::new(Accumulator::default())),
            breach_tx: Some(breach_tx),
            breach_rx,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn state(&self) -> MonitorState {
        *lock(&self.state)
    }

    pub fn breach_signal(&self) -> BreachSignal {
        BreachSignal(self.breach_rx.clone())
    }

    /// Breach observed so far
    pub fn breach(&self) -> Option<ResourceBreach> {
        *self.breach_rx.borrow()
    }

    /// Begin polling `target` on a background task
    pub fn start_monitoring(&mut self, target: Arc<dyn MonitorTarget>) -> Result<(), MonitorError> {
        let breach_tx = {
            let mut state = lock(&self.state);
            if *state != MonitorState::Idle {
                return Err(MonitorError::AlreadyStarted(*state));
            }
            let Some(breach_tx) = self.breach_tx.take() else {
                return Err(MonitorError::AlreadyStarted(*state));
            };
            *state = MonitorState::Watching;
            breach_tx
        };

        debug!(
            monitored = %target.describe(),
            interval = ?self.limits.interval,
            "Resource monitor watching"
        );

        let limits = self.limits;
        let state = self.state.clone();
        let usage = self.usage.clone();
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limits.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(sample) = target.sample() else {
                    debug!(monitored = %target.describe(), "Monitored target is gone");
                    break;
                };
                lock(&usage).record(&sample);

                if let Some(breach) = limits.check(&sample) {
                    warn!(
                        monitored = %target.describe(),
                        resource = %breach.resource,
                        limit = breach.limit,
                        observed = breach.observed,
                        "Resource ceiling exceeded, terminating target"
                    );
                    *lock(&state) = MonitorState::Exceeded;
                    target.terminate();
                    breach_tx.send_replace(Some(breach));
                    break;
                }
            }
        }));
        Ok(())
    }

    /// Halt sampling and summarize what was observed
    pub async fn stop_monitoring(&mut self) -> ResourceUsage {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("Resource monitor task failed: {}", err);
            }
        }
        *lock(&self.state) = MonitorState::Stopped;
        let usage = lock(&self.usage).summary();
        debug!(
            samples = usage.sample_count,
            peak_memory = usage.memory.peak,
            cpu_time_ms = usage.cpu_time_ms,
            "Resource monitor stopped"
        );
        usage
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct FakeTarget {
        memory: AtomicU64,
        gone: AtomicBool,
        terminated: AtomicBool,
    }

    impl FakeTarget {
        fn new(memory: u64) -> Arc<Self> {
            Arc::new(Self {
                memory: AtomicU64::new(memory),
                gone: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
            })
        }
    }

    impl MonitorTarget for FakeTarget {
        fn sample(&self) -> Option<ResourceSample> {
            if self.gone.load(Ordering::SeqCst) {
                return None;
            }
            Some(ResourceSample {
                cpu_time: Duration::from_millis(5),
                memory_bytes: self.memory.load(Ordering::SeqCst),
                open_files: 3,
            })
        }

        fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "fake".to_string()
        }
    }

    fn limits() -> MonitorLimits {
        MonitorLimits {
            max_cpu_time: Duration::from_secs(1),
            max_memory: 1000,
            max_open_files: 10,
            interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_limits_check_order() {
        let limits = limits();
        let quiet = ResourceSample {
            cpu_time: Duration::from_millis(10),
            memory_bytes: 10,
            open_files: 1,
        };
        assert_eq!(limits.check(&quiet), None);

        let heavy = ResourceSample {
            memory_bytes: 5000,
            open_files: 50,
            ..quiet
        };
        let breach = limits.check(&heavy).unwrap();
        assert_eq!(breach.resource, ResourceKind::Memory);
        assert_eq!(breach.observed, 5000);

        let spinning = ResourceSample {
            cpu_time: Duration::from_secs(2),
            ..heavy
        };
        assert_eq!(limits.check(&spinning).unwrap().resource, ResourceKind::CpuTime);
    }

    #[tokio::test]
    async fn test_breach_terminates_target() {
        let target = FakeTarget::new(100);
        let mut monitor = ResourceMonitor::new(limits());
        let mut signal = monitor.breach_signal();
        monitor.start_monitoring(target.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        target.memory.store(4096, Ordering::SeqCst);

        let breach = tokio::time::timeout(Duration::from_secs(2), signal.wait())
            .await
            .unwrap();
        assert_eq!(breach.resource, ResourceKind::Memory);
        assert_eq!(breach.limit, 1000);
        assert!(target.terminated.load(Ordering::SeqCst));
        assert_eq!(monitor.state(), MonitorState::Exceeded);

        let usage = monitor.stop_monitoring().await;
        assert_eq!(usage.memory.peak, 4096);
        assert_eq!(usage.open_files.peak, 3);
        assert!(usage.sample_count >= 2);
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn test_vanished_target_is_not_an_error() {
        let target = FakeTarget::new(100);
        target.gone.store(true, Ordering::SeqCst);
        let mut monitor = ResourceMonitor::new(limits());
        monitor.start_monitoring(target.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let usage = monitor.stop_monitoring().await;
        assert_eq!(usage.sample_count, 0);
        assert!(monitor.breach().is_none());
        assert!(!target.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut monitor = ResourceMonitor::new(limits());
        monitor.start_monitoring(FakeTarget::new(1)).unwrap();
        let err = monitor.start_monitoring(FakeTarget::new(1)).unwrap_err();
        assert!(matches!(err, MonitorError::AlreadyStarted(MonitorState::Watching)));
        monitor.stop_monitoring().await;
        assert!(monitor.start_monitoring(FakeTarget::new(1)).is_err());
    }

    #[tokio::test]
    async fn test_average_usage() {
        let target = FakeTarget::new(200);
        let mut monitor = ResourceMonitor::new(limits());
        monitor.start_monitoring(target).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let usage = monitor.stop_monitoring().await;
        assert_eq!(usage.memory.average, 200);
        assert_eq!(usage.cpu_time_ms, 5);
    }
}
