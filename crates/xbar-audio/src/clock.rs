//! The shared period clock.
//!
//! One thread drives every virtual device, the switch matrix and every
//! processing zone, once per period, in a fixed order:
//!
//! 1. source devices capture a period
//! 2. the switch matrix triggers (sources → zones, zones → sinks)
//! 3. zones process a period
//! 4. sink devices play a period
//!
//! Everything the thread drives is handed over at start and handed back when
//! the thread is joined, so a stopped engine can be restarted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use xbar_core::{Error, Result};

use crate::device::VirtualDevice;
use crate::switch_matrix::{MatrixClock, SwitchMatrix};
use crate::zone::ProcessingZone;

/// How a period reaches the switch matrix worker
#[derive(Clone)]
pub enum MatrixDrive {
    /// Wait for each trigger to finish; for the calling thread, never the clock thread
    Synchronous,
    /// Post a tick and move on
    Tick(MatrixClock),
    /// The worker runs free and triggers itself
    FreeRunning,
}

/// What the clock thread owns while it runs
pub struct ClockLoad {
    pub matrix: Arc<SwitchMatrix>,
    pub drive: MatrixDrive,
    pub devices: Vec<VirtualDevice>,
    pub zones: Vec<ProcessingZone>,
}

impl ClockLoad {
    /// Run one full period
    ///
    /// REAL-TIME SAFE unless the drive is [`MatrixDrive::Synchronous`]:
    /// transient buffer conditions are skipped, hard failures are only
    /// counted.
    pub fn run_period(&mut self, counters: &ClockCounters) {
        for device in self.devices.iter_mut().filter(|d| d.is_source()) {
            device.run_period();
        }

        let driven = match &self.drive {
            MatrixDrive::Synchronous => self.matrix.trigger().is_ok(),
            MatrixDrive::Tick(clock) => clock.tick(),
            MatrixDrive::FreeRunning => true,
        };
        if !driven {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }

        for zone in &mut self.zones {
            match zone.process_period() {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for device in self.devices.iter_mut().filter(|d| !d.is_source()) {
            device.run_period();
        }
        counters.periods.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters shared between the clock thread and its owner
#[derive(Debug, Default)]
pub struct ClockCounters {
    periods: AtomicU64,
    /// Zone periods skipped for lack of data or space
    skipped: AtomicU64,
    errors: AtomicU64,
}

impl ClockCounters {
    #[must_use]
    pub fn periods(&self) -> u64 {
        self.periods.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// A running clock thread
pub struct PeriodClock {
    running: Arc<AtomicBool>,
    counters: Arc<ClockCounters>,
    thread: Option<JoinHandle<ClockLoad>>,
}

impl PeriodClock {
    /// Spawn the clock thread; it ticks every `period`
    ///
    /// A synchronous drive is swapped for the matrix tick handle while the
    /// thread runs and restored when it hands the load back.
    pub fn start(name: &str, period: Duration, mut load: ClockLoad) -> Result<Self> {
        if period.is_zero() {
            return Err(Error::InvalidParam("clock period must be > 0".to_string()));
        }
        let synchronous = matches!(load.drive, MatrixDrive::Synchronous);
        if synchronous {
            load.drive = MatrixDrive::Tick(load.matrix.clock()?);
        }
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(ClockCounters::default());

        let thread_running = Arc::clone(&running);
        let thread_counters = Arc::clone(&counters);
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut next = Instant::now();
                while thread_running.load(Ordering::Acquire) {
                    load.run_period(&thread_counters);
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    } else {
                        // Fell behind; do not try to catch up in a burst
                        next = now;
                    }
                }
                if synchronous {
                    load.drive = MatrixDrive::Synchronous;
                }
                load
            })
            .map_err(|e| Error::InitializationFailed(format!("cannot spawn clock thread: {e}")))?;

        tracing::info!("Period clock '{}' started ({:?} per period)", name, period);
        Ok(Self {
            running,
            counters,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<ClockCounters> {
        &self.counters
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stop the thread, wait for it, and take back what it was driving
    pub fn stop(&mut self) -> Result<ClockLoad> {
        self.running.store(false, Ordering::Release);
        let thread = self
            .thread
            .take()
            .ok_or_else(|| Error::Failed("period clock is not running".to_string()))?;
        let load = thread
            .join()
            .map_err(|_| Error::Failed("period clock thread panicked".to_string()))?;
        tracing::info!(
            "Period clock stopped after {} periods ({} skipped, {} errors)",
            self.counters.periods(),
            self.counters.skipped(),
            self.counters.errors()
        );
        Ok(load)
    }
}

impl Drop for PeriodClock {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
    }
}
