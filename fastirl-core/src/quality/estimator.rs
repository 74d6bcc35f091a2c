//! Network Quality Estimation
//!
//! Turns cumulative transport counters into per-interval samples.
//!
//! ## Throughput
//! `8 * Δbytes / Δt_seconds / 1000` kbps between two consecutive readings.
//! The first reading after a (re)connect has no baseline and yields a zero
//! delta with `interval == 0`, which the controller treats as "throughput
//! unknown" rather than as a collapsed link.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Cumulative counters of the outbound video stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Total payload bytes sent, monotonic while the stream lives
    pub bytes_sent: u64,

    /// Fraction of packets lost (0.0 - 1.0)
    pub fraction_lost: f64,

    /// Round-trip time in seconds
    pub round_trip_time: f64,
}

/// Source of transport counters, usually a publishing session.
#[async_trait]
pub trait StatsProvider: Send + Sync {
    /// `Ok(None)` when no outbound video stream exists right now.
    async fn outbound_video_stats(&self) -> Result<Option<TransportStats>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSample {
    pub timestamp: Instant,
    /// Time since the previous reading; zero for the first one
    pub interval: Duration,
    pub bytes_sent_delta: u64,
    pub fraction_lost: f64,
    pub rtt_ms: f64,
    pub throughput_kbps: f64,
}

impl NetworkSample {
    #[must_use]
    pub fn throughput_known(&self) -> bool {
        !self.interval.is_zero()
    }
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    bytes_sent: u64,
    at: Instant,
}

/// Keeps the previous reading needed for delta computation.
#[derive(Debug, Default)]
pub struct NetworkQualityEstimator {
    previous: Option<Reading>,
}

impl NetworkQualityEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the baseline, e.g. after the transport reconnected.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Derive a sample from the latest counters.
    ///
    /// Returns `None` while there is no outbound stream; the baseline is
    /// dropped so the next reading starts fresh.
    pub fn sample(&mut self, stats: Option<TransportStats>, now: Instant) -> Option<NetworkSample> {
        let Some(stats) = stats else {
            self.previous = None;
            return None;
        };

        let current = Reading {
            bytes_sent: stats.bytes_sent,
            at: now,
        };

        // A counter that went backwards belongs to a new transport.
        let (delta, interval) = match self.previous {
            Some(prev) if stats.bytes_sent >= prev.bytes_sent => (
                stats.bytes_sent - prev.bytes_sent,
                now.saturating_duration_since(prev.at),
            ),
            _ => (0, Duration::ZERO),
        };
        self.previous = Some(current);

        let secs = interval.as_secs_f64();
        let throughput_kbps = if secs > 0.0 {
            8.0 * delta as f64 / secs / 1000.0
        } else {
            0.0
        };

        Some(NetworkSample {
            timestamp: now,
            interval,
            bytes_sent_delta: delta,
            fraction_lost: stats.fraction_lost.clamp(0.0, 1.0),
            rtt_ms: stats.round_trip_time * 1000.0,
            throughput_kbps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(bytes_sent: u64) -> Option<TransportStats> {
        Some(TransportStats {
            bytes_sent,
            fraction_lost: 0.01,
            round_trip_time: 0.08,
        })
    }

    #[test]
    fn test_first_sample_has_zero_delta() {
        let mut estimator = NetworkQualityEstimator::new();
        let sample = estimator.sample(stats(1_000_000), Instant::now()).unwrap();

        assert_eq!(sample.bytes_sent_delta, 0);
        assert_eq!(sample.throughput_kbps, 0.0);
        assert!(!sample.throughput_known());
        assert!((sample.rtt_ms - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_throughput_from_delta() {
        let mut estimator = NetworkQualityEstimator::new();
        let t0 = Instant::now();
        estimator.sample(stats(0), t0);

        // 1.5 MB over 3 s is 4000 kbps.
        let sample = estimator
            .sample(stats(1_500_000), t0 + Duration::from_secs(3))
            .unwrap();
        assert_eq!(sample.bytes_sent_delta, 1_500_000);
        assert!((sample.throughput_kbps - 4000.0).abs() < 1e-6);
        assert!(sample.throughput_known());
    }

    #[test]
    fn test_missing_stream_yields_no_sample_and_resets() {
        let mut estimator = NetworkQualityEstimator::new();
        let t0 = Instant::now();
        estimator.sample(stats(500), t0);

        assert!(estimator.sample(None, t0 + Duration::from_secs(3)).is_none());

        let sample = estimator
            .sample(stats(900), t0 + Duration::from_secs(6))
            .unwrap();
        assert_eq!(sample.bytes_sent_delta, 0);
        assert!(!sample.throughput_known());
    }

    #[test]
    fn test_counter_reset_is_treated_as_new_baseline() {
        let mut estimator = NetworkQualityEstimator::new();
        let t0 = Instant::now();
        estimator.sample(stats(10_000), t0);

        let sample = estimator.sample(stats(100), t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(sample.bytes_sent_delta, 0);
        assert!(!sample.throughput_known());

        let sample = estimator.sample(stats(400), t0 + Duration::from_secs(6)).unwrap();
        assert_eq!(sample.bytes_sent_delta, 300);
        assert!((sample.throughput_kbps - 0.8).abs() < 1e-9);
    }
}
