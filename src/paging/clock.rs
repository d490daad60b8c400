//! Coarse Minute Clock
//!
//! Page access times only need minute resolution. Every hit reads the
//! clock, so it is a single atomic load, refreshed by a background ticker.
//!
//! ```text
//!   ticker task ──(every tick)──▶ CoarseClock.minutes ◀── mark_hit (load)
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Shared "current time in minutes" value
#[derive(Debug)]
pub struct CoarseClock {
    minutes: AtomicU32,
}

impl CoarseClock {
    /// Clock seeded from the system time
    pub fn system() -> Self {
        Self {
            minutes: AtomicU32::new(Self::system_minutes()),
        }
    }

    /// Clock fixed at `minutes`; only moves through `set_minutes`/`advance`
    pub fn fixed(minutes: u32) -> Self {
        Self {
            minutes: AtomicU32::new(minutes),
        }
    }

    /// Minutes since the Unix epoch, according to the system clock
    pub fn system_minutes() -> u32 {
        let minutes = Utc::now().timestamp().max(0) / 60;
        u32::try_from(minutes).unwrap_or(u32::MAX)
    }

    /// Current coarse time
    #[inline]
    pub fn now_minutes(&self) -> u32 {
        self.minutes.load(Ordering::Relaxed)
    }

    pub fn set_minutes(&self, minutes: u32) {
        self.minutes.store(minutes, Ordering::Relaxed);
    }

    pub fn advance(&self, minutes: u32) {
        self.minutes.fetch_add(minutes, Ordering::Relaxed);
    }

    /// Re-read the system clock
    pub fn refresh(&self) {
        let now = Self::system_minutes();
        trace!(minutes = now, "Coarse clock tick");
        self.minutes.store(now, Ordering::Relaxed);
    }

    /// Refresh the clock every `period` until `shutdown` is cancelled
    pub fn spawn_ticker(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let clock = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => clock.refresh(),
                    _ = shutdown.cancelled() => {
                        debug!("Coarse clock ticker stopped");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for CoarseClock {
    fn default() -> Self {
        Self::system()
    }
}

// =============================================================================
// Tests
// =============================================================================
