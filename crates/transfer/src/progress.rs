use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 100;

/// Throughput of one transfer over a sliding window of chunk completions.
///
/// Each sample is the byte count of a finished chunk. The oldest retained
/// sample only anchors the start of the window.
pub struct SpeedCalculator {
    window: Duration,
    max_samples: usize,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// `window_size` defaults to 5 s and `max_samples` to 100.
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            window: window_size.unwrap_or(DEFAULT_WINDOW),
            max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Records `bytes` completed now.
    pub fn add_sample(&self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&self, bytes: u64, now: Instant) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push_back((now, bytes));
        if let Some(cutoff) = now.checked_sub(self.window) {
            while samples.front().is_some_and(|(at, _)| *at < cutoff) {
                samples.pop_front();
            }
        }
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    /// Bytes per second inside the window, 0.0 until two samples exist.
    pub fn bytes_per_second(&self) -> f64 {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some((start, _)), Some((end, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let elapsed = end.duration_since(*start);
        if elapsed.is_zero() {
            return 0.0;
        }
        let bytes: u64 = samples.iter().skip(1).map(|(_, b)| b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Time left for `remaining_bytes` at the current speed.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        (speed > 0.0).then(|| Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    pub fn reset(&self) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumed_transfer_starts_fresh() {
        let calc = SpeedCalculator::default();
        let t0 = Instant::now();
        calc.add_sample_at(0, t0);
        calc.add_sample_at(4096, t0 + Duration::from_millis(500));
        assert!(calc.bytes_per_second() > 0.0);
        calc.reset();
        assert!(calc.eta(4096).is_none());
    }

    #[test]
    fn no_samples() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn single_sample_has_no_speed() {
        let calc = SpeedCalculator::default();
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn steady_rate() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        let t0 = Instant::now();
        calc.add_sample_at(0, t0);
        calc.add_sample_at(1000, t0 + Duration::from_secs(1));
        calc.add_sample_at(1000, t0 + Duration::from_secs(2));

        assert_eq!(calc.bytes_per_second(), 1000.0);
        assert_eq!(calc.eta(5000), Some(Duration::from_secs(5)));
    }

    #[test]
    fn old_samples_leave_window() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(2)), None);
        let t0 = Instant::now();
        calc.add_sample_at(1_000_000, t0);
        calc.add_sample_at(10, t0 + Duration::from_secs(5));
        calc.add_sample_at(10, t0 + Duration::from_secs(6));

        assert_eq!(calc.bytes_per_second(), 10.0);
    }

    #[test]
    fn max_samples_bound() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        assert!(calc.samples.lock().unwrap().len() <= 5);
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }
}
