//! Smoothed frame timings, in microseconds.

use tandem_shared::ClientTuning;

/// Blend factor for a frame that took `frame_us`. Slow frames move the
/// averages faster.
#[must_use]
pub fn filter_for(frame_us: f64) -> f64 {
    if frame_us > 100_000.0 {
        0.5
    } else if frame_us > 50_000.0 {
        0.08
    } else if frame_us > 25_000.0 {
        0.04
    } else {
        0.02
    }
}

/// Exponentially smoothed value that jumps on discontinuities.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmoothedValue(f64);

impl SmoothedValue {
    /// Starts at `value`.
    #[must_use]
    pub const fn new(value: f64) -> Self {
        Self(value)
    }

    /// Blends in `sample` with weight `filter`.
    ///
    /// A zero sample zeroes the value. A sample more than ten times
    /// larger or smaller than the current value replaces it.
    pub fn update(&mut self, sample: f64, filter: f64) {
        if sample == 0.0 {
            self.0 = 0.0;
            return;
        }
        let ratio = (self.0 / sample).abs();
        if !(0.1..=10.0).contains(&ratio) {
            self.0 = sample;
            return;
        }
        self.0 = filter * sample + (1.0 - filter) * self.0;
    }

    /// Current value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> f64 {
        self.0
    }

    /// Current value truncated to an `i32`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i32(self) -> i32 {
        self.0.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
    }
}

/// Measurements from one `consume` call. `None` keeps the previous value.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameSample {
    /// Whole call.
    pub frame_us: f64,
    /// Action callback.
    pub action_us: Option<f64>,
    /// Consumption callbacks.
    pub process_us: Option<f64>,
    /// Most recent network read.
    pub recv_us: Option<f64>,
    /// Size of the most recent buffer.
    pub recv_size: f64,
    /// Send size from the most recent release.
    pub server_send_size: f64,
}

/// Smoothed timings of a sync data client.
#[derive(Clone, Copy, Debug)]
pub struct FrameCounters {
    frame_time: SmoothedValue,
    action_time: SmoothedValue,
    proc_time: SmoothedValue,
    recv_time: SmoothedValue,
    recv_size: SmoothedValue,
    server_send_size: SmoothedValue,
}

impl Default for FrameCounters {
    fn default() -> Self {
        Self {
            frame_time: SmoothedValue::new(100_000.0),
            action_time: SmoothedValue::new(50_000.0),
            proc_time: SmoothedValue::new(50_000.0),
            recv_time: SmoothedValue::new(100_000.0),
            recv_size: SmoothedValue::new(10_000.0),
            server_send_size: SmoothedValue::new(10_000.0),
        }
    }
}

impl FrameCounters {
    /// Folds in one frame.
    pub fn record(&mut self, sample: FrameSample) {
        let frame_us = if sample.frame_us > 0.0 {
            sample.frame_us
        } else {
            self.frame_time.get()
        };
        let filter = filter_for(frame_us);
        let keep = |value: Option<f64>, current: SmoothedValue| value.filter(|v| *v > 0.0).unwrap_or(current.get());

        self.frame_time.update(frame_us, filter);
        self.server_send_size.update(sample.server_send_size, filter);
        self.recv_time.update(keep(sample.recv_us, self.recv_time), filter);
        self.recv_size.update(sample.recv_size, filter);
        self.action_time.update(keep(sample.action_us, self.action_time), filter);
        self.proc_time.update(keep(sample.process_us, self.proc_time), filter);
    }

    /// Tuning to report at the next barrier.
    #[must_use]
    pub fn tuning(&self) -> ClientTuning {
        ClientTuning {
            draw_time: self.action_time.as_i32(),
            recv_time: self.recv_time.as_i32(),
            proc_time: self.proc_time.as_i32(),
            frame_number: 0,
        }
    }

    /// Smoothed frame time.
    #[must_use]
    pub fn frame_time(&self) -> i32 {
        self.frame_time.as_i32()
    }

    /// Smoothed action callback time.
    #[must_use]
    pub fn action_time(&self) -> i32 {
        self.action_time.as_i32()
    }

    /// Smoothed consumption time.
    #[must_use]
    pub fn proc_time(&self) -> i32 {
        self.proc_time.as_i32()
    }

    /// Smoothed network read time.
    #[must_use]
    pub fn recv_time(&self) -> i32 {
        self.recv_time.as_i32()
    }

    /// Smoothed buffer size.
    #[must_use]
    pub fn recv_size(&self) -> i32 {
        self.recv_size.as_i32()
    }

    /// Smoothed server send size.
    #[must_use]
    pub fn server_send_size(&self) -> i32 {
        self.server_send_size.as_i32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_tiers() {
        assert!((filter_for(150_000.0) - 0.5).abs() < f64::EPSILON);
        assert!((filter_for(60_000.0) - 0.08).abs() < f64::EPSILON);
        assert!((filter_for(30_000.0) - 0.04).abs() < f64::EPSILON);
        assert!((filter_for(16_000.0) - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn test_smoothing_blends_and_snaps() {
        let mut value = SmoothedValue::new(100.0);
        value.update(200.0, 0.5);
        assert!((value.get() - 150.0).abs() < 1e-9);

        value.update(5_000.0, 0.5);
        assert!((value.get() - 5_000.0).abs() < 1e-9);

        value.update(1.0, 0.5);
        assert!((value.get() - 1.0).abs() < 1e-9);

        value.update(0.0, 0.5);
        assert!(value.get().abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_samples_keep_values() {
        let mut counters = FrameCounters::default();
        counters.record(FrameSample {
            frame_us: 16_000.0,
            action_us: None,
            process_us: None,
            recv_us: None,
            recv_size: 10_000.0,
            server_send_size: 10_000.0,
        });
        assert_eq!(counters.action_time(), 50_000);
        assert_eq!(counters.proc_time(), 50_000);
        assert_eq!(counters.recv_time(), 100_000);
        // 16ms is within 10x of 100ms: blended with the slow filter.
        assert!((98_319..=98_320).contains(&counters.frame_time()));
        assert_eq!(counters.tuning().frame_number, 0);
        assert_eq!(counters.tuning().draw_time, 50_000);
    }
}
