use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::NetworkSample;
use crate::config::AbrConfig;
use crate::events::ThermalState;

const OBSERVER_CAPACITY: usize = 16;

/// One rung of the output quality ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPreset {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl QualityPreset {
    #[must_use]
    pub fn new(name: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            fps,
        }
    }

    /// 1080p30 down to 360p24, highest first
    #[must_use]
    pub fn default_ladder() -> Vec<Self> {
        vec![
            Self::new("1080p30", 1920, 1080, 30),
            Self::new("720p30", 1280, 720, 30),
            Self::new("540p24", 960, 540, 24),
            Self::new("360p24", 640, 360, 24),
        ]
    }
}

/// How hard thermal pressure pushes quality down
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalOverride {
    /// `serious` multiplies the target bitrate by this
    pub serious_bitrate_factor: f64,
    /// Presets below the configured initial preset
    pub serious_preset_steps: usize,
    /// `critical` always drops to `min_kbps`
    pub critical_preset_steps: usize,
}

impl Default for ThermalOverride {
    fn default() -> Self {
        Self {
            serious_bitrate_factor: 0.5,
            serious_preset_steps: 1,
            critical_preset_steps: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityState {
    pub target_bitrate_kbps: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub output_fps: u32,
    pub preset_index: usize,
    pub consecutive_bad: u32,
    pub consecutive_good: u32,
    pub thermal: ThermalState,
}

/// Outcome of feeding one sample to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbrDecision {
    Hold,
    StepDown,
    StepUp,
}

/// Hysteresis-based bitrate and resolution controller.
///
/// All mutation goes through one lock. Observers get separate bitrate and
/// quality notifications so a bitrate-only change never restarts capture.
pub struct BitrateController {
    config: AbrConfig,
    state: Mutex<QualityState>,
    bitrate_tx: broadcast::Sender<u32>,
    quality_tx: broadcast::Sender<QualityState>,
}

impl std::fmt::Debug for BitrateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitrateController")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl BitrateController {
    #[must_use]
    pub fn new(config: AbrConfig) -> Self {
        let preset_index = config
            .initial_preset
            .min(config.presets.len().saturating_sub(1));
        let initial_kbps = config.initial_kbps.min(config.ceiling_kbps).max(config.min_kbps);
        let mut state = QualityState {
            target_bitrate_kbps: initial_kbps,
            output_width: 0,
            output_height: 0,
            output_fps: 0,
            preset_index,
            consecutive_bad: 0,
            consecutive_good: 0,
            thermal: ThermalState::Nominal,
        };
        apply_preset(&config, &mut state, preset_index);

        let (bitrate_tx, _) = broadcast::channel(OBSERVER_CAPACITY);
        let (quality_tx, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            config,
            state: Mutex::new(state),
            bitrate_tx,
            quality_tx,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AbrConfig {
        &self.config
    }

    #[must_use]
    pub fn snapshot(&self) -> QualityState {
        self.state.lock().clone()
    }

    #[must_use]
    pub fn target_kbps(&self) -> u32 {
        self.state.lock().target_bitrate_kbps
    }

    /// Fires with the new target whenever the bitrate changes
    #[must_use]
    pub fn subscribe_bitrate(&self) -> broadcast::Receiver<u32> {
        self.bitrate_tx.subscribe()
    }

    /// Fires whenever the output resolution or frame rate changes
    #[must_use]
    pub fn subscribe_quality(&self) -> broadcast::Receiver<QualityState> {
        self.quality_tx.subscribe()
    }

    fn is_bad(&self, sample: &NetworkSample, target_kbps: u32) -> bool {
        let cfg = &self.config;
        sample.fraction_lost > cfg.loss_threshold
            || sample.rtt_ms > cfg.rtt_threshold_ms
            || (sample.throughput_known()
                && sample.throughput_kbps < cfg.throughput_ratio * f64::from(target_kbps))
    }

    pub fn on_sample(&self, sample: &NetworkSample) -> AbrDecision {
        if !self.config.enabled {
            return AbrDecision::Hold;
        }

        let mut state = self.state.lock();
        let before = state.clone();
        let bad = self.is_bad(sample, state.target_bitrate_kbps);

        let decision = if bad {
            state.consecutive_bad += 1;
            state.consecutive_good = 0;
            if state.consecutive_bad >= self.config.bad_ticks {
                state.consecutive_bad = 0;
                let stepped = scale_kbps(state.target_bitrate_kbps, self.config.step_down_factor);
                state.target_bitrate_kbps = stepped.min(state.target_bitrate_kbps).max(self.config.min_kbps);
                let lower = (state.preset_index + 1).min(self.last_preset());
                apply_preset(&self.config, &mut state, lower);
                AbrDecision::StepDown
            } else {
                AbrDecision::Hold
            }
        } else {
            state.consecutive_good += 1;
            state.consecutive_bad = 0;
            if state.consecutive_good >= self.config.good_ticks {
                state.consecutive_good = 0;
                if self.under_thermal_pressure(&state) {
                    AbrDecision::Hold
                } else {
                    let stepped = scale_kbps(state.target_bitrate_kbps, self.config.step_up_factor);
                    state.target_bitrate_kbps = stepped.max(state.target_bitrate_kbps).min(self.config.ceiling_kbps);
                    AbrDecision::StepUp
                }
            } else {
                AbrDecision::Hold
            }
        };

        debug!(
            bad,
            throughput_kbps = sample.throughput_kbps,
            rtt_ms = sample.rtt_ms,
            fraction_lost = sample.fraction_lost,
            consecutive_bad = state.consecutive_bad,
            consecutive_good = state.consecutive_good,
            target_kbps = state.target_bitrate_kbps,
            "ABR tick"
        );

        let after = state.clone();
        drop(state);
        self.notify(&before, &after, "network");
        decision
    }

    /// Thermal pressure bypasses the hysteresis counters.
    pub fn on_thermal(&self, thermal: ThermalState) {
        let mut state = self.state.lock();
        if state.thermal == thermal {
            return;
        }
        let before = state.clone();
        state.thermal = thermal;

        if self.config.thermal_protect {
            let override_cfg = &self.config.thermal;
            let steps = match thermal {
                ThermalState::Nominal | ThermalState::Fair => None,
                ThermalState::Serious => {
                    let reduced = scale_kbps(state.target_bitrate_kbps, override_cfg.serious_bitrate_factor);
                    state.target_bitrate_kbps = reduced.min(state.target_bitrate_kbps).max(self.config.min_kbps);
                    Some(override_cfg.serious_preset_steps)
                }
                ThermalState::Critical => {
                    state.target_bitrate_kbps = self.config.min_kbps;
                    Some(override_cfg.critical_preset_steps)
                }
            };
            if let Some(steps) = steps {
                let floor = (self.config.initial_preset + steps).min(self.last_preset());
                let index = state.preset_index.max(floor);
                apply_preset(&self.config, &mut state, index);
                info!(%thermal, target_kbps = state.target_bitrate_kbps, width = state.output_width, height = state.output_height, "Thermal override applied");
            }
        }

        let after = state.clone();
        drop(state);
        self.notify(&before, &after, "thermal");
    }

    /// Apply a user-chosen target, clamped to the configured range.
    pub fn set_target_kbps(&self, kbps: u32) -> u32 {
        let mut state = self.state.lock();
        let before = state.clone();
        state.target_bitrate_kbps = kbps.min(self.config.ceiling_kbps).max(self.config.min_kbps);
        state.consecutive_bad = 0;
        state.consecutive_good = 0;
        let after = state.clone();
        drop(state);
        self.notify(&before, &after, "manual");
        after.target_bitrate_kbps
    }

    /// Deliberate resolution change, e.g. from the UI. ABR never steps up on its own.
    pub fn set_preset(&self, index: usize) {
        let mut state = self.state.lock();
        let before = state.clone();
        apply_preset(&self.config, &mut state, index.min(self.last_preset()));
        let after = state.clone();
        drop(state);
        self.notify(&before, &after, "manual");
    }

    fn under_thermal_pressure(&self, state: &QualityState) -> bool {
        self.config.thermal_protect && state.thermal >= ThermalState::Serious
    }

    fn last_preset(&self) -> usize {
        self.config.presets.len().saturating_sub(1)
    }

    fn notify(&self, before: &QualityState, after: &QualityState, cause: &'static str) {
        if before.target_bitrate_kbps != after.target_bitrate_kbps {
            info!(
                cause,
                from_kbps = before.target_bitrate_kbps,
                to_kbps = after.target_bitrate_kbps,
                "Target bitrate changed"
            );
            let _ = self.bitrate_tx.send(after.target_bitrate_kbps);
        }
        if (before.output_width, before.output_height, before.output_fps)
            != (after.output_width, after.output_height, after.output_fps)
        {
            info!(
                cause,
                width = after.output_width,
                height = after.output_height,
                fps = after.output_fps,
                "Output quality changed"
            );
            let _ = self.quality_tx.send(after.clone());
        }
    }
}

fn scale_kbps(kbps: u32, factor: f64) -> u32 {
    (f64::from(kbps) * factor).round().clamp(0.0, f64::from(u32::MAX)) as u32
}

fn apply_preset(config: &AbrConfig, state: &mut QualityState, index: usize) {
    if let Some(preset) = config.presets.get(index) {
        state.preset_index = index;
        state.output_width = preset.width;
        state.output_height = preset.height;
        state.output_fps = preset.fps;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sample(throughput_kbps: f64, fraction_lost: f64, rtt_ms: f64) -> NetworkSample {
        NetworkSample {
            timestamp: Instant::now(),
            interval: Duration::from_secs(3),
            bytes_sent_delta: (throughput_kbps * 3000.0 / 8.0) as u64,
            fraction_lost,
            rtt_ms,
            throughput_kbps,
        }
    }

    fn good() -> NetworkSample {
        sample(10_000.0, 0.0, 40.0)
    }

    fn bad() -> NetworkSample {
        sample(10_000.0, 0.1, 40.0)
    }

    #[test]
    fn test_initial_state_from_config() {
        let controller = BitrateController::new(AbrConfig::default());
        let state = controller.snapshot();
        assert_eq!(state.target_bitrate_kbps, 4000);
        assert_eq!((state.output_width, state.output_height, state.output_fps), (1920, 1080, 30));
    }

    #[test]
    fn test_classification_thresholds() {
        let controller = BitrateController::new(AbrConfig::default());
        assert!(!controller.is_bad(&sample(2900.0, 0.02, 250.0), 4000));
        assert!(controller.is_bad(&sample(2799.0, 0.0, 0.0), 4000));
        assert!(controller.is_bad(&sample(5000.0, 0.021, 0.0), 4000));
        assert!(controller.is_bad(&sample(5000.0, 0.0, 251.0), 4000));

        let mut first = sample(0.0, 0.0, 10.0);
        first.interval = Duration::ZERO;
        assert!(!controller.is_bad(&first, 4000));
    }

    #[test]
    fn test_step_down_lowers_preset_and_notifies_both() {
        let controller = BitrateController::new(AbrConfig::default());
        let mut bitrate_rx = controller.subscribe_bitrate();
        let mut quality_rx = controller.subscribe_quality();

        assert_eq!(controller.on_sample(&bad()), AbrDecision::Hold);
        assert_eq!(controller.on_sample(&bad()), AbrDecision::Hold);
        assert_eq!(controller.on_sample(&bad()), AbrDecision::StepDown);

        assert_eq!(bitrate_rx.try_recv().unwrap(), 3200);
        let quality = quality_rx.try_recv().unwrap();
        assert_eq!((quality.output_width, quality.output_height), (1280, 720));
    }

    #[test]
    fn test_step_up_is_bitrate_only() {
        let controller = BitrateController::new(AbrConfig::default());
        let mut quality_rx = controller.subscribe_quality();
        let mut bitrate_rx = controller.subscribe_bitrate();

        for _ in 0..3 {
            controller.on_sample(&good());
        }
        assert_eq!(controller.on_sample(&good()), AbrDecision::StepUp);
        assert_eq!(bitrate_rx.try_recv().unwrap(), 4600);
        assert!(quality_rx.try_recv().is_err());
    }

    #[test]
    fn test_step_up_clamped_to_ceiling_without_notification() {
        let config = AbrConfig {
            initial_kbps: 8000,
            ..AbrConfig::default()
        };
        let controller = BitrateController::new(config);
        let mut bitrate_rx = controller.subscribe_bitrate();

        for _ in 0..4 {
            controller.on_sample(&good());
        }
        assert_eq!(controller.target_kbps(), 8000);
        assert!(bitrate_rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_controller_holds() {
        let config = AbrConfig {
            enabled: false,
            ..AbrConfig::default()
        };
        let controller = BitrateController::new(config);
        for _ in 0..5 {
            assert_eq!(controller.on_sample(&bad()), AbrDecision::Hold);
        }
        assert_eq!(controller.target_kbps(), 4000);
    }

    #[test]
    fn test_serious_thermal_halves_and_drops_one_preset() {
        let controller = BitrateController::new(AbrConfig::default());
        controller.on_thermal(ThermalState::Serious);

        let state = controller.snapshot();
        assert_eq!(state.target_bitrate_kbps, 2000);
        assert_eq!((state.output_width, state.output_height), (1280, 720));

        // Repeated notifications for the same level change nothing.
        controller.on_thermal(ThermalState::Serious);
        assert_eq!(controller.target_kbps(), 2000);
    }

    #[test]
    fn test_no_step_up_under_thermal_pressure() {
        let controller = BitrateController::new(AbrConfig::default());
        controller.on_thermal(ThermalState::Critical);
        assert_eq!(controller.target_kbps(), 800);

        for _ in 0..4 {
            assert_eq!(controller.on_sample(&good()), AbrDecision::Hold);
        }
        assert_eq!(controller.target_kbps(), 800);

        controller.on_thermal(ThermalState::Nominal);
        for _ in 0..4 {
            controller.on_sample(&good());
        }
        assert_eq!(controller.target_kbps(), 920);
    }

    #[test]
    fn test_thermal_protect_off() {
        let config = AbrConfig {
            thermal_protect: false,
            ..AbrConfig::default()
        };
        let controller = BitrateController::new(config);
        controller.on_thermal(ThermalState::Critical);
        assert_eq!(controller.target_kbps(), 4000);
        assert_eq!(controller.snapshot().thermal, ThermalState::Critical);
    }

    #[test]
    fn test_set_target_clamps() {
        let controller = BitrateController::new(AbrConfig::default());
        assert_eq!(controller.set_target_kbps(100), 800);
        assert_eq!(controller.set_target_kbps(20_000), 8000);
        assert_eq!(controller.set_target_kbps(5000), 5000);
    }

    #[test]
    fn test_set_preset_restores_resolution() {
        let controller = BitrateController::new(AbrConfig::default());
        controller.set_preset(3);
        assert_eq!(controller.snapshot().output_height, 360);
        controller.set_preset(99);
        assert_eq!(controller.snapshot().preset_index, 3);
        controller.set_preset(0);
        assert_eq!(controller.snapshot().output_height, 1080);
    }
}
