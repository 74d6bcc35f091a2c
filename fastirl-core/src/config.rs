use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::compositor::ScaleFilter;
use crate::quality::{QualityPreset, ThermalOverride};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub compositor: CompositorConfig,
    pub abr: AbrConfig,
    pub signaling: SignalingConfig,
    pub publishing: PublishingConfig,
    pub remote_control: RemoteControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    pub output_width: u32,
    pub output_height: u32,
    /// Minimum time between two overlay cache rebuilds
    pub overlay_refresh_ms: u64,
    /// Upper bound on waiting for the UI-owned render context
    pub render_budget_ms: u64,
    pub scale_filter: ScaleFilter,
    pub overlays_enabled: bool,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            output_width: 1920,
            output_height: 1080,
            overlay_refresh_ms: 1000,
            render_budget_ms: 4,
            scale_filter: ScaleFilter::Triangle,
            overlays_enabled: true,
        }
    }
}

impl CompositorConfig {
    #[must_use]
    pub const fn overlay_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.overlay_refresh_ms)
    }

    #[must_use]
    pub const fn render_budget(&self) -> Duration {
        Duration::from_millis(self.render_budget_ms)
    }
}

/// Adaptive bitrate policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    pub enabled: bool,
    pub initial_kbps: u32,
    pub min_kbps: u32,
    pub ceiling_kbps: u32,
    pub step_down_factor: f64,
    pub step_up_factor: f64,
    /// Fraction lost above which a sample is bad
    pub loss_threshold: f64,
    /// Round-trip time above which a sample is bad
    pub rtt_threshold_ms: f64,
    /// Throughput below `ratio * target` is bad
    pub throughput_ratio: f64,
    pub bad_ticks: u32,
    pub good_ticks: u32,
    pub sample_interval_ms: u64,
    pub display_interval_ms: u64,
    /// Quality ladder, highest first
    pub presets: Vec<QualityPreset>,
    pub initial_preset: usize,
    pub thermal_protect: bool,
    pub thermal: ThermalOverride,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_kbps: 4000,
            min_kbps: 800,
            ceiling_kbps: 8000,
            step_down_factor: 0.8,
            step_up_factor: 1.15,
            loss_threshold: 0.02,
            rtt_threshold_ms: 250.0,
            throughput_ratio: 0.7,
            bad_ticks: 3,
            good_ticks: 4,
            sample_interval_ms: 3000,
            display_interval_ms: 1000,
            presets: QualityPreset::default_ladder(),
            initial_preset: 0,
            thermal_protect: true,
            thermal: ThermalOverride::default(),
        }
    }
}

impl AbrConfig {
    #[must_use]
    pub const fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    #[must_use]
    pub const fn display_interval(&self) -> Duration {
        Duration::from_millis(self.display_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_countdown_secs: u64,
    pub connect_timeout_ms: u64,
    pub negotiation_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080".to_string(),
            max_reconnect_attempts: 10,
            reconnect_countdown_secs: 3,
            connect_timeout_ms: 10_000,
            negotiation_timeout_ms: 15_000,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishingConfig {
    /// Signaling endpoint used by the realtime session
    pub realtime_url: String,
    /// `scheme://host:port` of the buffered-transport destination
    pub buffered_url: String,
    pub buffered_latency_ms: u32,
    pub buffered_buffer_bytes: u32,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            realtime_url: "ws://localhost:8080".to_string(),
            buffered_url: "srt://localhost:9001".to_string(),
            buffered_latency_ms: 120,
            buffered_buffer_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteControlConfig {
    pub url: String,
    pub password: String,
    pub request_timeout_ms: u64,
}

impl Default for RemoteControlConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4455".to_string(),
            password: String::new(),
            request_timeout_ms: 5_000,
        }
    }
}

impl RemoteControlConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // FASTIRL_ABR__MIN_KBPS=1000, FASTIRL_SIGNALING__URL=..., etc.
        builder = builder.add_source(
            Environment::with_prefix("FASTIRL")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.compositor.output_width == 0 || self.compositor.output_height == 0 {
            errors.push("compositor output size must be non-zero".to_string());
        }

        let abr = &self.abr;
        if abr.min_kbps == 0 {
            errors.push("abr.min_kbps must be greater than zero".to_string());
        }
        if abr.min_kbps > abr.ceiling_kbps {
            errors.push(format!(
                "abr.min_kbps ({}) exceeds abr.ceiling_kbps ({})",
                abr.min_kbps, abr.ceiling_kbps
            ));
        }
        if abr.initial_kbps < abr.min_kbps || abr.initial_kbps > abr.ceiling_kbps {
            errors.push(format!(
                "abr.initial_kbps ({}) must lie within [{}, {}]",
                abr.initial_kbps, abr.min_kbps, abr.ceiling_kbps
            ));
        }
        if !(abr.step_down_factor > 0.0 && abr.step_down_factor < 1.0) {
            errors.push("abr.step_down_factor must be in (0, 1)".to_string());
        }
        if abr.step_up_factor <= 1.0 {
            errors.push("abr.step_up_factor must be greater than 1".to_string());
        }
        if abr.bad_ticks == 0 || abr.good_ticks == 0 {
            errors.push("abr.bad_ticks and abr.good_ticks must be non-zero".to_string());
        }
        if abr.sample_interval_ms == 0 || abr.display_interval_ms == 0 {
            errors.push("abr sampling intervals must be non-zero".to_string());
        }
        if abr.presets.is_empty() {
            errors.push("abr.presets must contain at least one preset".to_string());
        } else if abr.initial_preset >= abr.presets.len() {
            errors.push(format!(
                "abr.initial_preset ({}) is out of range for {} presets",
                abr.initial_preset,
                abr.presets.len()
            ));
        }
        if !(abr.thermal.serious_bitrate_factor > 0.0 && abr.thermal.serious_bitrate_factor <= 1.0) {
            errors.push("abr.thermal.serious_bitrate_factor must be in (0, 1]".to_string());
        }

        if self.signaling.max_reconnect_attempts == 0 {
            errors.push("signaling.max_reconnect_attempts must be non-zero".to_string());
        }

        for (name, value) in [
            ("signaling.url", &self.signaling.url),
            ("publishing.realtime_url", &self.publishing.realtime_url),
            ("publishing.buffered_url", &self.publishing.buffered_url),
            ("remote_control.url", &self.remote_control.url),
        ] {
            if !value.is_empty() && url::Url::parse(value).is_err() {
                errors.push(format!("{name} is not a valid URL: {value}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
