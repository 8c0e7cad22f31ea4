//! Profiler
//!
//! A keyed collector of time-point pairs. Every operation is a no-op when
//! the profiler is disabled, keeping it off the inference hot path under the
//! default configuration. Capacity per key is bounded; older samples are
//! overwritten ring-style.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;

const SAMPLES_PER_KEY: usize = 128;

#[derive(Default)]
struct KeySamples {
    /// (start, end) pairs, ring-ordered
    points: Vec<(Instant, Instant)>,
    next: usize,
    open: Option<Instant>,
}

/// Keyed time-point collector
pub struct Profiler {
    enabled: bool,
    keys: Mutex<BTreeMap<String, KeySamples>>,
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            keys: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record the start point of an event
    pub fn start(&self, key: &str) {
        if !self.enabled {
            return;
        }
        let mut keys = self.keys.lock();
        keys.entry(key.to_string()).or_default().open = Some(Instant::now());
    }

    /// Record the end point of an event
    pub fn end(&self, key: &str) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let mut keys = self.keys.lock();
        if let Some(samples) = keys.get_mut(key) {
            if let Some(start) = samples.open.take() {
                push_ring(samples, (start, now));
            }
        }
    }

    /// Record a complete time-point pair
    pub fn add_time_point(&self, key: &str, start: Instant, end: Instant) {
        if !self.enabled {
            return;
        }
        let mut keys = self.keys.lock();
        push_ring(keys.entry(key.to_string()).or_default(), (start, end));
    }

    /// Most recent elapsed time of an event in microseconds
    pub fn get(&self, key: &str) -> u64 {
        let keys = self.keys.lock();
        keys.get(key)
            .and_then(|s| {
                if s.points.is_empty() {
                    return None;
                }
                let idx = (s.next + s.points.len() - 1) % s.points.len();
                s.points.get(idx)
            })
            .map(|(start, end)| end.duration_since(*start).as_micros() as u64)
            .unwrap_or(0)
    }

    /// Average elapsed time of an event in microseconds
    pub fn get_average(&self, key: &str) -> f64 {
        let keys = self.keys.lock();
        match keys.get(key) {
            Some(s) if !s.points.is_empty() => {
                let total: u128 = s
                    .points
                    .iter()
                    .map(|(start, end)| end.duration_since(*start).as_micros())
                    .sum();
                total as f64 / s.points.len() as f64
            }
            _ => 0.0,
        }
    }

    /// Log a summary of all events
    pub fn show(&self) {
        if !self.enabled {
            return;
        }
        let keys = self.keys.lock();
        for (key, samples) in keys.iter() {
            if samples.points.is_empty() {
                continue;
            }
            let total: u128 = samples
                .points
                .iter()
                .map(|(s, e)| e.duration_since(*s).as_micros())
                .sum();
            info!(
                event = %key,
                samples = samples.points.len(),
                avg_us = total as f64 / samples.points.len() as f64,
                "profile"
            );
        }
    }

    /// Save per-event averages to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut file = std::fs::File::create(path)?;
        let keys = self.keys.lock();
        for (key, samples) in keys.iter() {
            if samples.points.is_empty() {
                continue;
            }
            let total: u128 = samples
                .points
                .iter()
                .map(|(s, e)| e.duration_since(*s).as_micros())
                .sum();
            writeln!(
                file,
                "{key},{},{:.1}",
                samples.points.len(),
                total as f64 / samples.points.len() as f64
            )?;
        }
        Ok(())
    }
}

fn push_ring(samples: &mut KeySamples, point: (Instant, Instant)) {
    if samples.points.len() < SAMPLES_PER_KEY {
        samples.points.push(point);
        samples.next = samples.points.len() % SAMPLES_PER_KEY;
    } else {
        samples.points[samples.next] = point;
        samples.next = (samples.next + 1) % SAMPLES_PER_KEY;
    }
}

/// Histogram-backed aggregate statistics (engine latency / inference time)
pub struct LatencyStats {
    hist: Mutex<Histogram<u64>>,
}

impl LatencyStats {
    pub fn new() -> Self {
        // 1 us to 60 s, 3 significant figures
        let hist = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)
            .expect("static histogram bounds are valid");
        Self {
            hist: Mutex::new(hist),
        }
    }

    pub fn record(&self, micros: u64) {
        let mut hist = self.hist.lock();
        let clamped = micros.clamp(1, 60_000_000);
        let _ = hist.record(clamped);
    }

    pub fn mean(&self) -> f64 {
        self.hist.lock().mean()
    }

    pub fn percentile(&self, q: f64) -> u64 {
        self.hist.lock().value_at_quantile(q)
    }

    pub fn count(&self) -> u64 {
        self.hist.lock().len()
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_disabled_profiler_is_noop() {
        let p = Profiler::new(false);
        p.start("x");
        p.end("x");
        assert_eq!(p.get("x"), 0);
        assert_eq!(p.get_average("x"), 0.0);
    }

    #[test]
    fn test_start_end_records() {
        let p = Profiler::new(true);
        p.start("ev");
        std::thread::sleep(Duration::from_millis(2));
        p.end("ev");
        assert!(p.get("ev") >= 1000);
        assert!(p.get_average("ev") >= 1000.0);
    }

    #[test]
    fn test_ring_is_bounded() {
        let p = Profiler::new(true);
        let now = Instant::now();
        for _ in 0..(SAMPLES_PER_KEY * 2) {
            p.add_time_point("k", now, now);
        }
        let keys = p.keys.lock();
        assert_eq!(keys.get("k").unwrap().points.len(), SAMPLES_PER_KEY);
    }

    #[test]
    fn test_latency_stats() {
        let stats = LatencyStats::new();
        for v in [100, 200, 300] {
            stats.record(v);
        }
        assert_eq!(stats.count(), 3);
        assert!(stats.mean() > 150.0 && stats.mean() < 250.0);
        assert!(stats.percentile(1.0) >= 300);
    }
}
