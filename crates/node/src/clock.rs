//! Time source for the control loop and the session retry waits.
//!
//! Everything that waits or compares timestamps goes through [`Clock`], so
//! tests can drive elapsed time by hand instead of sleeping.

use std::future::Future;
use std::time::{Duration, Instant};

pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, dur: Duration) -> impl Future<Output = ()>;
}

/// Wall-clock implementation backed by tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

// ---------------------------------------------------------------------------
// Manual clock (tests)
// ---------------------------------------------------------------------------
