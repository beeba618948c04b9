use std::{
    sync::LazyLock,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::Histogram;

/// Observes the elapsed wall time into a histogram when dropped, or when
/// `finish` is called explicitly. Durations are reported in seconds.
pub struct Timer {
    histogram: &'static Histogram,
    start: Instant,
    finished: bool,
}

impl Timer {
    pub fn new(histogram: &'static LazyLock<Histogram>) -> Self {
        Self {
            histogram: LazyLock::force(histogram),
            start: Instant::now(),
            finished: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        self.histogram.observe(elapsed.as_secs_f64());
        self.finished = true;
        elapsed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.finished {
            self.histogram.observe(self.start.elapsed().as_secs_f64());
        }
    }
}
