//! Host load sampling.
//!
//! A [`LoadProbe`] takes one CPU/memory reading; [`LoadMonitor`] compares it
//! with the configured thresholds. A probe that cannot read the host returns
//! `None`, which always counts as "not overloaded": throttling must keep
//! working in sandboxes and containers without the usual sensors.

use crate::clock::SharedClock;
use crate::decision::ThrottleReason;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Duration;

/// One host utilisation reading, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSample {
    /// CPU utilisation across all cores, 0–100.
    pub cpu_percent: f64,
    /// Used memory as a share of total memory, 0–100.
    pub memory_percent: f64,
}

impl LoadSample {
    fn is_usable(&self) -> bool {
        self.cpu_percent.is_finite() && self.memory_percent.is_finite()
    }
}

/// Source of host load readings.
pub trait LoadProbe: Send + Sync + fmt::Debug {
    /// Take a reading, or `None` if the host cannot be read.
    fn sample(&self) -> Option<LoadSample>;
}

/// Probe returning a fixed reading; `None` simulates missing sensors.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    reading: Arc<Mutex<Option<LoadSample>>>,
}

impl StaticProbe {
    /// Probe reporting the given percentages.
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        let probe = Self::default();
        probe.set(Some(LoadSample { cpu_percent, memory_percent }));
        probe
    }

    /// Probe that never has data.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Change the reading. Clones share it.
    pub fn set(&self, reading: Option<LoadSample>) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) = reading;
    }
}

impl LoadProbe for StaticProbe {
    fn sample(&self) -> Option<LoadSample> {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Probe reading the real host through `sysinfo`.
///
/// The first CPU reading after construction is typically zero because CPU
/// usage is a delta between two refreshes.
#[cfg(feature = "system-load")]
#[derive(Debug)]
pub struct SystemProbe {
    system: Mutex<sysinfo::System>,
}

#[cfg(feature = "system-load")]
impl SystemProbe {
    /// Create a probe with an empty `sysinfo::System`.
    pub fn new() -> Self {
        Self { system: Mutex::new(sysinfo::System::new()) }
    }
}

#[cfg(feature = "system-load")]
impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "system-load")]
impl LoadProbe for SystemProbe {
    fn sample(&self) -> Option<LoadSample> {
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return None;
        }
        Some(LoadSample {
            cpu_percent: f64::from(sys.global_cpu_usage()),
            memory_percent: sys.used_memory() as f64 / total as f64 * 100.0,
        })
    }
}

/// Probe used when the `system-load` feature is disabled: never any data.
#[cfg(not(feature = "system-load"))]
#[derive(Debug, Default)]
pub struct SystemProbe;

#[cfg(not(feature = "system-load"))]
impl SystemProbe {
    /// Create the no-data probe.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(feature = "system-load"))]
impl LoadProbe for SystemProbe {
    fn sample(&self) -> Option<LoadSample> {
        None
    }
}

#[derive(Debug, Default)]
struct Cached {
    sample: Option<LoadSample>,
    taken_at: Option<f64>,
}

/// Threshold check over a probe, caching readings for `sample_interval`.
///
/// One caller at a time refreshes a stale reading, outside the cache lock;
/// everyone else keeps using the previous reading meanwhile.
#[derive(Debug)]
pub struct LoadMonitor {
    probe: Arc<dyn LoadProbe>,
    cpu_threshold: f64,
    memory_threshold: f64,
    sample_interval: Duration,
    cached: Mutex<Cached>,
    refreshing: Mutex<()>,
    clock: SharedClock,
}

impl LoadMonitor {
    /// Build a monitor. A zero `sample_interval` probes on every check.
    pub fn new(
        probe: Arc<dyn LoadProbe>,
        cpu_threshold: f64,
        memory_threshold: f64,
        sample_interval: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            probe,
            cpu_threshold,
            memory_threshold,
            sample_interval,
            cached: Mutex::new(Cached::default()),
            refreshing: Mutex::new(()),
            clock,
        }
    }

    /// `Some(SystemLoad)` if CPU or memory is above its threshold.
    pub fn system_overloaded(&self) -> Option<ThrottleReason> {
        let sample = self.current_sample()?;
        if !sample.is_usable() {
            return None;
        }
        if sample.cpu_percent > self.cpu_threshold || sample.memory_percent > self.memory_threshold
        {
            tracing::debug!(
                target: "turnstile::load",
                cpu = sample.cpu_percent,
                memory = sample.memory_percent,
                cpu_threshold = self.cpu_threshold,
                memory_threshold = self.memory_threshold,
                "host overloaded"
            );
            return Some(ThrottleReason::SystemLoad);
        }
        None
    }

    /// Most recent cached reading, without probing.
    pub fn last_sample(&self) -> Option<LoadSample> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner).sample
    }

    fn current_sample(&self) -> Option<LoadSample> {
        let now = self.clock.now_secs();
        if let Some(sample) = self.fresh_sample(now) {
            return sample;
        }

        let _refresh = match self.refreshing.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return self.last_sample(),
        };
        // Someone may have refreshed while we were checking.
        if let Some(sample) = self.fresh_sample(now) {
            return sample;
        }

        let sample = self.probe.sample();
        if sample.is_none() {
            tracing::trace!(target: "turnstile::load", "load probe returned no data; treating host as not overloaded");
        }
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        cached.sample = sample;
        cached.taken_at = Some(now);
        sample
    }

    /// The cached reading if it is younger than the interval.
    fn fresh_sample(&self, now: f64) -> Option<Option<LoadSample>> {
        let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = cached
            .taken_at
            .is_some_and(|at| now - at < self.sample_interval.as_secs_f64());
        fresh.then_some(cached.sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;

    fn monitor(probe: &StaticProbe, interval: Duration) -> (LoadMonitor, ManualClock) {
        let clock = ManualClock::new();
        let monitor =
            LoadMonitor::new(Arc::new(probe.clone()), 80.0, 90.0, interval, Arc::new(clock.clone()));
        (monitor, clock)
    }

    #[test]
    fn cpu_over_threshold_is_overloaded() {
        let probe = StaticProbe::new(95.0, 10.0);
        let (monitor, _) = monitor(&probe, Duration::ZERO);
        assert_eq!(monitor.system_overloaded(), Some(ThrottleReason::SystemLoad));
    }

    #[test]
    fn memory_over_threshold_is_overloaded() {
        let probe = StaticProbe::new(10.0, 90.5);
        let (monitor, _) = monitor(&probe, Duration::ZERO);
        assert_eq!(monitor.system_overloaded(), Some(ThrottleReason::SystemLoad));
    }

    #[test]
    fn at_threshold_is_not_overloaded() {
        let probe = StaticProbe::new(80.0, 90.0);
        let (monitor, _) = monitor(&probe, Duration::ZERO);
        assert_eq!(monitor.system_overloaded(), None);
    }

    #[test]
    fn missing_or_garbage_readings_are_not_overloaded() {
        let probe = StaticProbe::unavailable();
        let (monitor, _) = monitor(&probe, Duration::ZERO);
        assert_eq!(monitor.system_overloaded(), None);

        probe.set(Some(LoadSample { cpu_percent: f64::NAN, memory_percent: 99.0 }));
        assert_eq!(monitor.system_overloaded(), None);
    }

    #[test]
    fn readings_are_cached_for_the_interval() {
        let probe = StaticProbe::new(10.0, 10.0);
        let (monitor, clock) = monitor(&probe, Duration::from_secs(1));
        assert_eq!(monitor.system_overloaded(), None);

        probe.set(Some(LoadSample { cpu_percent: 99.0, memory_percent: 10.0 }));
        assert_eq!(monitor.system_overloaded(), None, "still within cache interval");

        clock.advance(Duration::from_secs(1));
        assert_eq!(monitor.system_overloaded(), Some(ThrottleReason::SystemLoad));
        assert_eq!(monitor.last_sample().map(|s| s.cpu_percent), Some(99.0));
    }

    #[derive(Debug)]
    struct GatedProbe {
        gated: AtomicBool,
        entered: Barrier,
        release: Barrier,
    }

    impl LoadProbe for GatedProbe {
        fn sample(&self) -> Option<LoadSample> {
            if self.gated.load(Ordering::SeqCst) {
                self.entered.wait();
                self.release.wait();
            }
            Some(LoadSample { cpu_percent: 95.0, memory_percent: 10.0 })
        }
    }

    #[test]
    fn slow_refresh_does_not_block_other_checks() {
        let probe = Arc::new(GatedProbe {
            gated: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let monitor = Arc::new(LoadMonitor::new(
            probe.clone(),
            80.0,
            90.0,
            Duration::ZERO,
            Arc::new(ManualClock::new()),
        ));
        assert_eq!(monitor.system_overloaded(), Some(ThrottleReason::SystemLoad));

        probe.gated.store(true, Ordering::SeqCst);
        let refresher = {
            let monitor = monitor.clone();
            std::thread::spawn(move || monitor.system_overloaded())
        };
        probe.entered.wait();
        // The refresh is parked inside the probe; this check reuses the last reading.
        assert_eq!(monitor.system_overloaded(), Some(ThrottleReason::SystemLoad));
        probe.release.wait();
        assert_eq!(refresher.join().unwrap(), Some(ThrottleReason::SystemLoad));
    }

    #[cfg(feature = "system-load")]
    #[test]
    fn system_probe_reports_percentages_or_nothing() {
        let probe = SystemProbe::new();
        if let Some(sample) = probe.sample() {
            assert!((0.0..=100.0).contains(&sample.memory_percent));
            assert!(sample.cpu_percent >= 0.0);
        }
    }
}
