use std::collections::VecDeque;

use log::trace;

/// Number of throughput samples kept for the moving average.
pub const SAMPLE_CAPACITY: usize = 10;

/// Minimum time between two estimates.
pub const UPDATE_INTERVAL_MILLIS: u64 = 1000;

/// A zero-throughput reading is only trusted after this much time without
/// any progress. Shorter gaps are just noise between network reads.
pub const STALL_THRESHOLD_SECS: f64 = 5.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSample {
    pub timestamp_millis: u64,
    pub bytes_per_second: f64,
}

/// Throttled progress report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Estimate {
    pub percent: u8,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub eta_seconds: Option<u64>,
    pub bytes_per_second: u64,
}

/// Turns raw byte counts into a smoothed throughput and ETA.
///
/// Throughput samples are kept in a small ring buffer. When a stall is
/// detected, the buffer is emptied so that an ETA computed from stale samples
/// is not shown once the transfer picks up again. While no average is
/// available, the previous ETA is reported instead of flickering to nothing.
#[derive(Debug, Default)]
pub struct ProgressEstimator {
    samples: VecDeque<ProgressSample>,
    /// (time, bytes) of the last sample that was accepted
    baseline: Option<(u64, u64)>,
    last_update_millis: Option<u64>,
    eta_seconds: Option<u64>,
}

impl ProgressEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything, eg. when a new transfer starts.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record the current byte count. Returns [`None`] if less than
    /// [`UPDATE_INTERVAL_MILLIS`] have passed since the last estimate.
    pub fn record(&mut self, bytes_done: u64, total_bytes: u64, now_millis: u64) -> Option<Estimate> {
        if let Some(last) = self.last_update_millis {
            if now_millis.saturating_sub(last) < UPDATE_INTERVAL_MILLIS {
                return None;
            }
        }
        self.last_update_millis = Some(now_millis);

        match self.baseline {
            None => self.baseline = Some((now_millis, bytes_done)),
            Some((prev_millis, prev_bytes)) => {
                let elapsed_secs = now_millis.saturating_sub(prev_millis) as f64 / 1000.0;
                let bps = if elapsed_secs > 0.0 {
                    bytes_done.saturating_sub(prev_bytes) as f64 / elapsed_secs
                } else {
                    0.0
                };

                if bps > 0.0 || elapsed_secs > STALL_THRESHOLD_SECS {
                    self.observe(ProgressSample {
                        timestamp_millis: now_millis,
                        bytes_per_second: bps,
                    });
                    self.baseline = Some((now_millis, bytes_done));
                } else {
                    trace!("Ignoring zero throughput reading after {elapsed_secs}s");
                }
            }
        }

        let eta_seconds = self.update_eta(total_bytes.saturating_sub(bytes_done));

        let percent = if total_bytes == 0 {
            0
        } else {
            (bytes_done.min(total_bytes) as u128 * 100 / total_bytes as u128) as u8
        };

        Some(Estimate {
            percent,
            bytes_done,
            total_bytes,
            eta_seconds,
            bytes_per_second: self.average_bps() as u64,
        })
    }

    /// Add a throughput sample. A zero sample means the connection is gone,
    /// so all previous samples are discarded.
    pub fn observe(&mut self, sample: ProgressSample) {
        if sample.bytes_per_second <= 0.0 {
            trace!("No throughput at {}ms; clearing samples", sample.timestamp_millis);
            self.samples.clear();
            return;
        }

        self.samples.push_back(sample);
        while self.samples.len() > SAMPLE_CAPACITY {
            self.samples.pop_front();
        }
    }

    /// Mean throughput over the buffered samples or 0 if there are none.
    pub fn average_bps(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }

        self.samples.iter().map(|s| s.bytes_per_second).sum::<f64>() / self.samples.len() as f64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Compute the ETA for the remaining bytes from the current samples,
    /// keeping the previous value if there is no usable average.
    pub fn update_eta(&mut self, remaining_bytes: u64) -> Option<u64> {
        let average = self.average_bps();
        if average > 0.0 {
            self.eta_seconds = Some((remaining_bytes as f64 / average).round() as u64);
        }
        self.eta_seconds
    }
}
