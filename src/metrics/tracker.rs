use prometheus::Histogram;

use std::time::{Duration, Instant};

/// Records elapsed microseconds into a histogram when dropped, unless
/// discarded first.
pub struct Tracker {
    pub start: Instant,
    hist: Option<Histogram>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "Tracker<start={:?}>", self.start)
    }
}

impl Tracker {
    pub fn new(hist: Histogram) -> Tracker {
        Self {
            start: Instant::now(),
            hist: Some(hist),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Drop without observing; used for timed-out calls whose latency is
    /// not a completion.
    pub fn discard(mut self) {
        self.hist = None;
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Some(hist) = self.hist.take() {
            let dur = self.start.elapsed();
            hist.observe(dur.as_secs_f64() * 1_000_000.0);
        }
    }
}
