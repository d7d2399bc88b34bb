//! Progress estimation from transcoder output.
//!
//! The transcoder reports progress in a handful of textual formats. When it
//! stays silent the estimator falls back to a guess derived from elapsed time
//! and input size, capped below 100 so only a real completion signal (or a
//! zero exit code) can finish a job.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::time::{Duration, Instant};

/// Value a fresh task starts at so clients can tell "started" from "idle".
pub const INITIAL_PROGRESS: f64 = 1.0;

/// Ceiling for time-based estimates.
pub const TIME_ESTIMATE_CAP: f64 = 95.0;

/// Grace period before time-based estimates kick in.
const TIME_ESTIMATE_WARMUP: Duration = Duration::from_secs(5);

/// How long output must be silent before time-based estimates are used.
const OUTPUT_SILENCE: Duration = Duration::from_secs(1);

const COMPLETION_PATTERNS: &[&str] = &[r"encode completed", r"encoding finished", r"finished.*100%"];

// The percentage is always the last capture group.
const PROGRESS_PATTERNS: &[&str] = &[
    r"frames:\s*(\d+)/(\d+)\s*\((\d+(?:\.\d+)?)%\)",
    r"\[(\d+(?:\.\d+)?)%\]",
    r"Progress:\s*(\d+(?:\.\d+)?)%",
    r"(\d+(?:\.\d+)?)%\s*complete",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect()
}

static COMPLETION: Lazy<Vec<Regex>> = Lazy::new(|| compile(COMPLETION_PATTERNS));
static PROGRESS: Lazy<Vec<Regex>> = Lazy::new(|| compile(PROGRESS_PATTERNS));

/// True if the line announces that encoding has finished.
pub fn is_completion_line(line: &str) -> bool {
    COMPLETION.iter().any(|re| re.is_match(line))
}

/// Extracts a percentage from a progress line, clamped to `[0, 100]`.
pub fn parse_progress(line: &str) -> Option<f64> {
    PROGRESS.iter().find_map(|re| {
        let caps = re.captures(line)?;
        let value = caps.get(caps.len() - 1)?.as_str().parse::<f64>().ok()?;
        Some(value.clamp(0.0, 100.0))
    })
}

/// Expected transcode duration in seconds for an input of `size_bytes`.
pub fn estimated_total_secs(size_bytes: u64) -> f64 {
    let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
    (size_mb * 0.8).max(5.0)
}

/// Per-attempt progress state fed one output line at a time.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    started: Instant,
    last_output_update: Instant,
    estimated_total_secs: f64,
    progress: f64,
    completion_detected: bool,
}

impl ProgressEstimator {
    pub fn new(input_size_bytes: u64, initial_progress: f64, started: Instant) -> Self {
        Self {
            started,
            last_output_update: started,
            estimated_total_secs: estimated_total_secs(input_size_bytes),
            progress: initial_progress.clamp(0.0, 100.0),
            completion_detected: false,
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn completion_detected(&self) -> bool {
        self.completion_detected
    }

    /// Feeds one output line; returns the new value if progress changed.
    pub fn observe_line(&mut self, line: &str, now: Instant) -> Option<f64> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if !self.completion_detected && is_completion_line(line) {
            self.completion_detected = true;
            return self.set(100.0);
        }

        if let Some(value) = parse_progress(line) {
            self.last_output_update = now;
            return self.set(value);
        }

        self.tick(now)
    }

    /// Applies the time-based estimate when output has gone quiet.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.started);
        let silent_for = now.saturating_duration_since(self.last_output_update);
        if elapsed <= TIME_ESTIMATE_WARMUP || silent_for < OUTPUT_SILENCE {
            return None;
        }

        let estimate = (elapsed.as_secs_f64() / self.estimated_total_secs * 100.0)
            .min(TIME_ESTIMATE_CAP);
        if estimate > self.progress {
            self.set(estimate)
        } else {
            None
        }
    }

    fn set(&mut self, value: f64) -> Option<f64> {
        if (value - self.progress).abs() < f64::EPSILON {
            return None;
        }
        self.progress = value;
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    proptest! {
        #[test]
        fn prop_parsed_progress_is_clamped(p in 0.0f64..1000.0) {
            let line = format!("Progress: {:.1}%", p);
            let parsed = parse_progress(&line).unwrap();
            prop_assert!((0.0..=100.0).contains(&parsed));
        }

        #[test]
        fn prop_time_estimate_below_cap(size_mb in 0u64..50_000, secs in 0u64..1_000_000) {
            let t0 = Instant::now();
            let mut est = ProgressEstimator::new(size_mb * MB, INITIAL_PROGRESS, t0);
            est.tick(t0 + Duration::from_secs(secs));
            prop_assert!(est.progress() <= TIME_ESTIMATE_CAP);
            prop_assert!(!est.completion_detected());
        }

        #[test]
        fn prop_time_estimate_never_decreases(
            secs in proptest::collection::vec(0u64..10_000, 1..20),
        ) {
            let t0 = Instant::now();
            let mut est = ProgressEstimator::new(100 * MB, INITIAL_PROGRESS, t0);
            let mut sorted = secs.clone();
            sorted.sort_unstable();
            let mut last = est.progress();
            for s in sorted {
                est.tick(t0 + Duration::from_secs(s));
                prop_assert!(est.progress() >= last);
                last = est.progress();
            }
        }
    }

    #[test]
    fn test_parse_progress_formats() {
        assert_eq!(parse_progress("frames: 50/100 (50%)"), Some(50.0));
        assert_eq!(parse_progress("[37.5%] encoding"), Some(37.5));
        assert_eq!(parse_progress("Progress: 12%"), Some(12.0));
        assert_eq!(parse_progress("80.2% complete"), Some(80.2));
        assert_eq!(parse_progress("PROGRESS: 5%"), Some(5.0));
        assert_eq!(parse_progress("no numbers here"), None);
        assert_eq!(parse_progress("frame= 120 fps= 30"), None);
    }

    #[test]
    fn test_frames_pattern_uses_percentage_group() {
        // Not the frame counters.
        assert_eq!(parse_progress("frames: 300/1200 (25%)"), Some(25.0));
    }

    #[test]
    fn test_completion_detection_is_idempotent() {
        let t0 = Instant::now();
        let mut est = ProgressEstimator::new(MB, INITIAL_PROGRESS, t0);

        assert_eq!(est.observe_line("encode completed", t0), Some(100.0));
        assert!(est.completion_detected());
        // A second completion line has no additional effect.
        assert_eq!(est.observe_line("Encoding finished", t0), None);
        assert_eq!(est.progress(), 100.0);
    }

    #[test]
    fn test_later_smaller_value_overwrites() {
        let t0 = Instant::now();
        let mut est = ProgressEstimator::new(MB, INITIAL_PROGRESS, t0);
        est.observe_line("Progress: 60%", t0);
        est.observe_line("Progress: 40%", t0);
        assert_eq!(est.progress(), 40.0);
    }

    #[test]
    fn test_time_estimate_requires_warmup() {
        let t0 = Instant::now();
        let mut est = ProgressEstimator::new(MB, INITIAL_PROGRESS, t0);
        assert_eq!(est.tick(t0 + Duration::from_secs(4)), None);
        assert_eq!(est.progress(), INITIAL_PROGRESS);
    }

    #[test]
    fn test_time_estimate_formula() {
        // 100 MB -> 80 s estimated total; 40 s elapsed -> 50%
        let t0 = Instant::now();
        let mut est = ProgressEstimator::new(100 * MB, INITIAL_PROGRESS, t0);
        let value = est.tick(t0 + Duration::from_secs(40)).unwrap();
        assert!((value - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_estimate_small_file_uses_floor() {
        // Tiny input -> 5 s floor; 6 s elapsed would be 120% but is capped.
        let t0 = Instant::now();
        let mut est = ProgressEstimator::new(1024, INITIAL_PROGRESS, t0);
        assert_eq!(est.tick(t0 + Duration::from_secs(6)), Some(TIME_ESTIMATE_CAP));
    }

    #[test]
    fn test_time_estimate_suppressed_by_recent_output() {
        let t0 = Instant::now();
        let mut est = ProgressEstimator::new(100 * MB, INITIAL_PROGRESS, t0);
        let t = t0 + Duration::from_secs(40);
        est.observe_line("Progress: 10%", t);
        assert_eq!(est.tick(t + Duration::from_millis(500)), None);
        assert!(est.tick(t + Duration::from_secs(2)).is_some());
    }

    #[test]
    fn test_time_estimate_does_not_lower_progress() {
        let t0 = Instant::now();
        let mut est = ProgressEstimator::new(100 * MB, INITIAL_PROGRESS, t0);
        est.observe_line("Progress: 70%", t0 + Duration::from_secs(1));
        assert_eq!(est.tick(t0 + Duration::from_secs(10)), None);
        assert_eq!(est.progress(), 70.0);
    }

    #[test]
    fn test_blank_lines_ignored() {
        let t0 = Instant::now();
        let mut est = ProgressEstimator::new(MB, INITIAL_PROGRESS, t0);
        assert_eq!(est.observe_line("   ", t0 + Duration::from_secs(60)), None);
    }
}
