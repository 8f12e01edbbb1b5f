use std::time::{Duration, Instant};

/// Page throughput of a single run, used for ETA estimates
#[derive(Debug, Clone)]
pub struct RunMetrics {
    /// Start time of the run
    started: Instant,

    /// Pages the run visits in total
    total_pages: u32,

    /// Pages that failed and were skipped
    failed_pages: u32,
}

impl RunMetrics {
    /// Start measuring a run of `total_pages` pages
    pub fn start(total_pages: u32) -> Self {
        Self {
            started: Instant::now(),
            total_pages,
            failed_pages: 0,
        }
    }

    pub fn record_failure(&mut self) {
        self.failed_pages += 1;
    }

    pub fn failed_pages(&self) -> u32 {
        self.failed_pages
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Estimated seconds left once `done` pages are finished
    pub fn eta_seconds(&self, done: u32) -> Option<u64> {
        Self::estimate(self.elapsed(), done, self.total_pages)
    }

    fn estimate(elapsed: Duration, done: u32, total: u32) -> Option<u64> {
        if done == 0 || done >= total {
            return None;
        }
        let per_page = elapsed.as_secs_f64() / f64::from(done);
        Some((per_page * f64::from(total - done)).ceil() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eta_scales_with_remaining_pages() {
        assert_eq!(RunMetrics::estimate(Duration::from_secs(10), 2, 6), Some(20));
        assert_eq!(RunMetrics::estimate(Duration::from_secs(10), 0, 6), None);
        assert_eq!(RunMetrics::estimate(Duration::from_secs(10), 6, 6), None);
    }
}
