// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Monotonic timing utilities: stopwatch, frame-rate window, latency tracker.
//!
//! All timestamps produced here come from the same process-wide monotonic
//! epoch, so values from different threads are directly comparable.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Microseconds since the process-wide monotonic epoch.
///
/// This is the clock sources stamp into `FrameInfo::timestamp_us`.
pub fn monotonic_now_us() -> u64 {
    epoch().elapsed().as_micros() as u64
}

/// Milliseconds since the process-wide monotonic epoch.
pub fn monotonic_now_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}

/// Simple monotonic stopwatch.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1_000.0
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

/// Format a duration in seconds as a short human-readable string.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 0.001 {
        format!("{:.1}us", seconds * 1_000_000.0)
    } else if seconds < 1.0 {
        format!("{:.1}ms", seconds * 1_000.0)
    } else if seconds < 60.0 {
        format!("{:.2}s", seconds)
    } else {
        let minutes = (seconds / 60.0) as u64;
        format!("{}m{:.1}s", minutes, seconds - (minutes as f64) * 60.0)
    }
}

/// Sliding-window frame-rate estimator.
///
/// Keeps the last `window` frame timestamps in a ring buffer. The
/// instantaneous rate is derived from the span of the window, the average
/// rate from the full first-to-last span.
#[derive(Debug, Clone)]
pub struct FrameRateCalculator {
    times: Vec<u64>,
    window: usize,
    index: usize,
    count: u64,
    first_us: u64,
    last_us: u64,
}

pub const DEFAULT_FPS_WINDOW: usize = 30;

impl FrameRateCalculator {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            times: vec![0; window],
            window,
            index: 0,
            count: 0,
            first_us: 0,
            last_us: 0,
        }
    }

    /// Record a frame at `timestamp_us`; pass 0 to use the current time.
    pub fn add_frame(&mut self, timestamp_us: u64) {
        let ts = if timestamp_us == 0 {
            monotonic_now_us()
        } else {
            timestamp_us
        };

        if self.count == 0 {
            self.first_us = ts;
        }
        self.last_us = ts;
        self.times[self.index] = ts;
        self.index = (self.index + 1) % self.window;
        self.count += 1;
    }

    /// Instantaneous rate over the current window, in frames per second.
    pub fn fps(&self) -> f64 {
        let samples = (self.count as usize).min(self.window);
        if samples < 2 {
            return 0.0;
        }

        let slice = &self.times[..samples];
        let oldest = *slice.iter().min().unwrap_or(&0);
        let newest = *slice.iter().max().unwrap_or(&0);
        if newest <= oldest {
            return 0.0;
        }

        (samples as f64 - 1.0) * 1_000_000.0 / (newest - oldest) as f64
    }

    /// Average rate over every frame ever recorded.
    pub fn average_fps(&self) -> f64 {
        if self.count < 2 || self.last_us <= self.first_us {
            return 0.0;
        }
        (self.count as f64 - 1.0) * 1_000_000.0 / (self.last_us - self.first_us) as f64
    }

    pub fn frame_count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.times.fill(0);
        self.index = 0;
        self.count = 0;
        self.first_us = 0;
        self.last_us = 0;
    }
}

impl Default for FrameRateCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_FPS_WINDOW)
    }
}

pub const DEFAULT_LATENCY_HISTORY: usize = 100;

/// Ring buffer of latency samples with lazily sorted percentiles.
///
/// The sorted copy is cached and invalidated on each new sample.
pub struct LatencyTracker {
    samples: Vec<f64>,
    capacity: usize,
    index: usize,
    count: usize,
    sorted: Mutex<Option<Vec<f64>>>,
}

impl LatencyTracker {
    pub fn new(history: usize) -> Self {
        let capacity = history.max(1);
        Self {
            samples: vec![0.0; capacity],
            capacity,
            index: 0,
            count: 0,
            sorted: Mutex::new(None),
        }
    }

    pub fn record(&mut self, latency_ms: f64) {
        self.samples[self.index] = latency_ms;
        self.index = (self.index + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
        *self.sorted.lock() = None;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.samples[..self.count].iter().sum::<f64>() / self.count as f64
    }

    pub fn min(&self) -> f64 {
        self.with_sorted(|s| s.first().copied().unwrap_or(0.0))
    }

    pub fn max(&self) -> f64 {
        self.with_sorted(|s| s.last().copied().unwrap_or(0.0))
    }

    pub fn last(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let last_index = (self.index + self.capacity - 1) % self.capacity;
        self.samples[last_index]
    }

    /// Linearly interpolated percentile in `[0, 100]`.
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let p = percentile.clamp(0.0, 100.0);
        self.with_sorted(|s| {
            let rank = (p / 100.0) * (s.len() as f64 - 1.0);
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            if lower == upper {
                return s[lower];
            }
            let weight = rank - lower as f64;
            s[lower] * (1.0 - weight) + s[upper] * weight
        })
    }

    pub fn reset(&mut self) {
        self.index = 0;
        self.count = 0;
        *self.sorted.lock() = None;
    }

    pub fn summary(&self) -> String {
        if self.count == 0 {
            return "no latency data".to_string();
        }
        format!(
            "latency avg={:.2}ms min={:.2}ms max={:.2}ms p95={:.2}ms ({} samples)",
            self.mean(),
            self.min(),
            self.max(),
            self.percentile(95.0),
            self.count
        )
    }

    fn with_sorted<T>(&self, f: impl FnOnce(&[f64]) -> T) -> T {
        let mut cache = self.sorted.lock();
        if cache.is_none() {
            let mut copy = self.samples[..self.count].to_vec();
            copy.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            *cache = Some(copy);
        }
        f(cache.as_deref().unwrap_or(&[]))
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_HISTORY)
    }
}
