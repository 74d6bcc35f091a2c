//! Network quality estimation and adaptive bitrate control
//!
//! ## Components
//!
//! - [`NetworkQualityEstimator`]: turns cumulative transport counters into samples
//! - [`BitrateController`]: hysteresis state machine over those samples, plus the
//!   thermal override
//! - [`AbrMonitor`]: wires a [`StatsProvider`] to a controller on two cadences,
//!   one driving adaptation and one feeding the live stats display

mod abr;
mod estimator;

pub use abr::{AbrDecision, BitrateController, QualityPreset, QualityState, ThermalOverride};
pub use estimator::{NetworkQualityEstimator, NetworkSample, StatsProvider, TransportStats};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::{EventBus, Subscription, SystemEvent};
use crate::task::RepeatingTask;

/// Background sampling for one transport.
///
/// Both timers stop when the monitor is dropped.
#[derive(Debug)]
pub struct AbrMonitor {
    adapt: RepeatingTask,
    live: RepeatingTask,
    live_rx: watch::Receiver<Option<NetworkSample>>,
}

impl AbrMonitor {
    pub fn spawn(provider: Arc<dyn StatsProvider>, controller: Arc<BitrateController>) -> Self {
        let sample_interval = controller.config().sample_interval();
        let display_interval = controller.config().display_interval();

        let adapt = {
            let provider = provider.clone();
            let estimator = Arc::new(Mutex::new(NetworkQualityEstimator::new()));
            RepeatingTask::spawn("abr", sample_interval, move || {
                let provider = provider.clone();
                let estimator = estimator.clone();
                let controller = controller.clone();
                async move {
                    let stats = match provider.outbound_video_stats().await {
                        Ok(stats) => stats,
                        Err(e) if e.is_transient() => {
                            debug!(error = %e, "Skipping ABR tick, stats unavailable");
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping ABR tick, stats read failed");
                            return;
                        }
                    };
                    let sample = estimator.lock().sample(stats, Instant::now().into_std());
                    match sample {
                        Some(sample) => {
                            controller.on_sample(&sample);
                        }
                        None => debug!("Skipping ABR tick, no outbound video"),
                    }
                }
            })
        };

        let (live_tx, live_rx) = watch::channel(None);
        let live = {
            let estimator = Arc::new(Mutex::new(NetworkQualityEstimator::new()));
            RepeatingTask::spawn("live-stats", display_interval, move || {
                let provider = provider.clone();
                let estimator = estimator.clone();
                let live_tx = live_tx.clone();
                async move {
                    match provider.outbound_video_stats().await {
                        Ok(stats) => {
                            let sample = estimator.lock().sample(stats, Instant::now().into_std());
                            live_tx.send_replace(sample);
                        }
                        Err(e) => debug!(error = %e, "Live stats read failed"),
                    }
                }
            })
        };

        Self {
            adapt,
            live,
            live_rx,
        }
    }

    /// Most recent display-cadence sample; `None` while nothing is flowing
    #[must_use]
    pub fn live_stats(&self) -> watch::Receiver<Option<NetworkSample>> {
        self.live_rx.clone()
    }

    pub fn stop(&self) {
        self.adapt.cancel();
        self.live.cancel();
    }
}

/// Route thermal events from the bus into the controller.
pub fn follow_thermal(controller: Arc<BitrateController>, bus: &EventBus) -> Subscription {
    bus.on(move |event| {
        if let SystemEvent::Thermal(state) = event {
            controller.on_thermal(state);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AbrConfig;
    use crate::error::{Error, Result};
    use crate::events::ThermalState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sends `kbps` worth of bytes per 3 s tick, or nothing when `kbps` is 0.
    struct SteadyLink {
        kbps: u64,
        bytes: AtomicU64,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl StatsProvider for SteadyLink {
        async fn outbound_video_stats(&self) -> Result<Option<TransportStats>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.kbps == 0 {
                return Ok(None);
            }
            let bytes = self.bytes.fetch_add(self.kbps * 1000 / 8 * 3, Ordering::SeqCst);
            Ok(Some(TransportStats {
                bytes_sent: bytes,
                fraction_lost: 0.0,
                round_trip_time: 0.05,
            }))
        }
    }

    struct Broken;

    #[async_trait]
    impl StatsProvider for Broken {
        async fn outbound_video_stats(&self) -> Result<Option<TransportStats>> {
            Err(Error::Transport("peer connection closed".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_steps_down_on_weak_link() {
        let link = Arc::new(SteadyLink {
            kbps: 2000,
            bytes: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
        });
        let controller = Arc::new(BitrateController::new(AbrConfig {
            display_interval_ms: 60_000,
            ..AbrConfig::default()
        }));
        let _monitor = AbrMonitor::spawn(link, controller.clone());

        // First tick only sets the baseline; three more are bad.
        tokio::time::sleep(Duration::from_millis(12_100)).await;
        assert_eq!(controller.target_kbps(), 3200);
        assert_eq!(controller.snapshot().consecutive_bad, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_ignores_absent_stream_and_errors() {
        let idle = Arc::new(SteadyLink {
            kbps: 0,
            bytes: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
        });
        let controller = Arc::new(BitrateController::new(AbrConfig::default()));
        let monitor = AbrMonitor::spawn(idle.clone(), controller.clone());
        let _broken = AbrMonitor::spawn(Arc::new(Broken), controller.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(idle.reads.load(Ordering::SeqCst) > 10);
        let state = controller.snapshot();
        assert_eq!(state.target_bitrate_kbps, 4000);
        assert_eq!((state.consecutive_bad, state.consecutive_good), (0, 0));
        assert!(monitor.live_stats().borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_stats_publish_samples() {
        let link = Arc::new(SteadyLink {
            kbps: 6000,
            bytes: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
        });
        let controller = Arc::new(BitrateController::new(AbrConfig::default()));
        let monitor = AbrMonitor::spawn(link, controller);
        let live = monitor.live_stats();

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let sample = (*live.borrow()).expect("live sample");
        assert!(sample.throughput_known());

        monitor.stop();
    }

    #[tokio::test]
    async fn test_follow_thermal() {
        let bus = EventBus::new();
        let controller = Arc::new(BitrateController::new(AbrConfig::default()));
        let _sub = follow_thermal(controller.clone(), &bus);

        bus.publish(SystemEvent::Thermal(ThermalState::Critical));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.target_kbps(), 800);
    }
}
