//! Concurrency bounds for resolution work
//!
//! Two semaphores gate the resolver:
//!
//! - **live**: one permit per resolution in progress. At the hard ceiling new
//!   admissions wait for a permit (back-pressure, never rejection).
//! - **background**: one permit per spawned provisioning task, sized from the
//!   host's parallelism:
//!
//! ```text
//! min(available_parallelism * 4, 8)
//! ```
//!
//! Roughly one admission in `sample_rate` samples the counters; crossing 90% of
//! the hard ceiling marks the guard throttled until the load drops again.

use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Multiplier applied to the CPU count for the background ceiling
pub const BACKGROUND_SCALING_FACTOR: usize = 4;

/// Upper bound for the derived background ceiling
pub const BACKGROUND_CEILING: usize = 8;

/// Default hard ceiling on live resolutions
pub const DEFAULT_MAX_LIVE: usize = 100;

/// Largest ceiling either semaphore accepts; drain acquires a whole ceiling
/// in one `u32` request
pub const MAX_CEILING: usize = 1 << 20;

/// Default sampling rate (one admission in N)
pub const DEFAULT_SAMPLE_RATE: u32 = 10;

/// Percentage of the hard ceiling at which the guard reports throttling
const THROTTLE_PERCENT: usize = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("not accepting work: draining")]
    Closed,
}

/// Holds one unit of capacity; released on drop
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct GuardStats {
    pub max_live: usize,
    pub max_background: usize,
    pub live: usize,
    pub background: usize,
    pub peak_live: usize,
    pub throttled: bool,
    pub draining: bool,
}

#[derive(Debug)]
pub struct ConcurrencyGuard {
    live: Arc<Semaphore>,
    background: Arc<Semaphore>,
    max_live: usize,
    max_background: usize,
    sample_rate: u32,
    live_in_flight: Arc<AtomicUsize>,
    background_in_flight: Arc<AtomicUsize>,
    peak_live: AtomicUsize,
    throttled: AtomicBool,
    closed: AtomicBool,
}

impl ConcurrencyGuard {
    /// # Panics
    ///
    /// Panics if either ceiling or the sample rate is 0, or a ceiling exceeds
    /// [`MAX_CEILING`].
    pub fn new(max_background: usize, max_live: usize, sample_rate: u32) -> Self {
        assert!(
            (1..=MAX_CEILING).contains(&max_background),
            "max_background must be in 1..={MAX_CEILING}"
        );
        assert!(
            (1..=MAX_CEILING).contains(&max_live),
            "max_live must be in 1..={MAX_CEILING}"
        );
        assert!(sample_rate > 0, "sample_rate must be > 0");

        Self {
            live: Arc::new(Semaphore::new(max_live)),
            background: Arc::new(Semaphore::new(max_background)),
            max_live,
            max_background,
            sample_rate,
            live_in_flight: Arc::new(AtomicUsize::new(0)),
            background_in_flight: Arc::new(AtomicUsize::new(0)),
            peak_live: AtomicUsize::new(0),
            throttled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Guard with the derived background ceiling and default live ceiling
    pub fn with_defaults() -> Self {
        Self::new(scaled_background(), DEFAULT_MAX_LIVE, DEFAULT_SAMPLE_RATE)
    }

    /// Wait for a live slot
    pub async fn admit(&self) -> Result<Permit, GuardError> {
        if self.is_draining() {
            return Err(GuardError::Closed);
        }

        let permit = self
            .live
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GuardError::Closed)?;

        let current = self.live_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_live.fetch_max(current, Ordering::Relaxed);

        if self.sample_rate == 1 || rand::thread_rng().gen_range(0..self.sample_rate) == 0 {
            self.sample(current);
        }

        Ok(Permit {
            _permit: permit,
            in_flight: self.live_in_flight.clone(),
        })
    }

    /// Wait for a background slot; the permit may be moved into a spawned task
    pub async fn acquire_background(&self) -> Result<Permit, GuardError> {
        let permit = self
            .background
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GuardError::Closed)?;

        self.background_in_flight.fetch_add(1, Ordering::Relaxed);

        Ok(Permit {
            _permit: permit,
            in_flight: self.background_in_flight.clone(),
        })
    }

    fn sample(&self, live: usize) {
        let background = self.background_in_flight.load(Ordering::Relaxed);
        let threshold = (self.max_live * THROTTLE_PERCENT / 100).max(1);

        debug!(
            live,
            background,
            peak = self.peak_live.load(Ordering::Relaxed),
            "Concurrency sample"
        );

        if live >= threshold {
            if !self.throttled.swap(true, Ordering::Relaxed) {
                warn!(live, max_live = self.max_live, "Live resolutions near ceiling, throttling");
            }
        } else if self.throttled.swap(false, Ordering::Relaxed) {
            info!(live, max_live = self.max_live, "Live resolutions recovered");
        }
    }

    /// Stop admitting work and wait for every outstanding permit.
    ///
    /// Live permits are collected first: a resolution holding one may still
    /// need a background permit before it finishes.
    pub async fn drain(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Drain already in progress");
        }

        info!(
            live = self.live_in_flight.load(Ordering::Relaxed),
            background = self.background_in_flight.load(Ordering::Relaxed),
            "Draining resolution work"
        );

        let live = self.live.clone().acquire_many_owned(self.max_live as u32).await;
        let background = self
            .background
            .clone()
            .acquire_many_owned(self.max_background as u32)
            .await;

        self.live.close();
        self.background.close();
        drop(live);
        drop(background);

        info!("Resolution work drained");
    }

    pub fn is_draining(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Relaxed)
    }

    pub fn live(&self) -> usize {
        self.live_in_flight.load(Ordering::Relaxed)
    }

    pub fn background(&self) -> usize {
        self.background_in_flight.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            max_live: self.max_live,
            max_background: self.max_background,
            live: self.live(),
            background: self.background(),
            peak_live: self.peak_live.load(Ordering::Relaxed),
            throttled: self.is_throttled(),
            draining: self.is_draining(),
        }
    }
}

/// `min(available_parallelism * 4, 8)`, at least 1
pub fn scaled_background() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    (cpus * BACKGROUND_SCALING_FACTOR).clamp(1, BACKGROUND_CEILING)
}
