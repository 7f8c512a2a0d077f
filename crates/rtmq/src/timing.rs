use std::time::{Duration, Instant};

/// Fires at most once per interval; drives keepalive sweeps and work ticks.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Repeater {
    interval: Duration,
    last_acted: Instant,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: Instant::now() }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        if self.last_acted.elapsed() >= self.interval {
            self.last_acted = Instant::now();
            true
        } else {
            false
        }
    }
}
