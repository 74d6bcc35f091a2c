//! Frame compositor
//!
//! Scales every camera frame to the output size with aspect-fill and draws
//! the overlay layers over it. Overlay layers are expensive to render, so
//! their composite is cached and rebuilt at most once per refresh interval.

mod frame;
mod overlay;
mod pipeline;

pub use frame::{CompositedFrame, Frame, PixelFormat, Rotation};
pub use overlay::{
    shared_renderer, title_from_url, LayerId, LayerRenderer, OverlayLayer, OverlayStore, Rect,
    SharedRenderer,
};
pub use pipeline::{CaptureControl, CompositorWorker, MediaPipeline, PipelineState, Reconfiguration};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use image::imageops::{self, FilterType};
use image::RgbaImage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CompositorConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleFilter {
    Nearest,
    #[default]
    Triangle,
    CatmullRom,
}

impl From<ScaleFilter> for FilterType {
    fn from(filter: ScaleFilter) -> Self {
        match filter {
            ScaleFilter::Nearest => Self::Nearest,
            ScaleFilter::Triangle => Self::Triangle,
            ScaleFilter::CatmullRom => Self::CatmullRom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorState {
    Idle,
    Started,
    Stopped,
}

/// Source region that survives aspect-fill, in source pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillGeometry {
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_width: u32,
    pub crop_height: u32,
}

/// Centered source crop whose aspect ratio matches the target.
///
/// Equivalent to scaling by `max(tw/sw, th/sh)` and cropping the overflow,
/// but computed on the source side. `None` if any dimension is zero.
#[must_use]
pub fn fill_geometry(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Option<FillGeometry> {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return None;
    }
    let (sw, sh, dw, dh) = (
        u64::from(src_w),
        u64::from(src_h),
        u64::from(dst_w),
        u64::from(dst_h),
    );
    // Width binds when the target is relatively wider than the source.
    let (crop_w, crop_h) = if dw * sh >= dh * sw {
        (sw, ((dh * sw + dw / 2) / dw).clamp(1, sh))
    } else {
        (((dw * sh + dh / 2) / dh).clamp(1, sw), sh)
    };
    // Both values are bounded by the u32 source dimensions.
    let (crop_width, crop_height) = (crop_w as u32, crop_h as u32);
    Some(FillGeometry {
        crop_x: (src_w - crop_width) / 2,
        crop_y: (src_h - crop_height) / 2,
        crop_width,
        crop_height,
    })
}

/// Aspect-fill `src` into exactly `dst_w` x `dst_h`.
///
/// Only the visible region of the source is resized.
pub fn aspect_fill(src: RgbaImage, dst_w: u32, dst_h: u32, filter: FilterType) -> Result<RgbaImage> {
    let (src_w, src_h) = src.dimensions();
    if (src_w, src_h) == (dst_w, dst_h) {
        return Ok(src);
    }
    let geo = fill_geometry(src_w, src_h, dst_w, dst_h).ok_or_else(|| {
        Error::Render(format!("cannot fill {dst_w}x{dst_h} from {src_w}x{src_h}"))
    })?;
    let region = imageops::crop_imm(&src, geo.crop_x, geo.crop_y, geo.crop_width, geo.crop_height);
    if (geo.crop_width, geo.crop_height) == (dst_w, dst_h) {
        return Ok(region.to_image());
    }
    Ok(imageops::resize(&*region, dst_w, dst_h, filter))
}

#[derive(Debug, Clone)]
struct Settings {
    width: u32,
    height: u32,
    overlays_enabled: bool,
    store: OverlayStore,
}

#[derive(Default)]
struct OverlayCache {
    image: Option<RgbaImage>,
    built_at: Option<Instant>,
}

pub struct OverlayCompositor {
    state: RwLock<CompositorState>,
    settings: RwLock<Settings>,
    cache: Mutex<OverlayCache>,
    renderer: SharedRenderer,
    filter: FilterType,
    refresh_interval: Duration,
    render_budget: Duration,
    rebuilds: AtomicU64,
    frames: AtomicU64,
}

impl std::fmt::Debug for OverlayCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settings = self.settings.read();
        f.debug_struct("OverlayCompositor")
            .field("state", &*self.state.read())
            .field("width", &settings.width)
            .field("height", &settings.height)
            .field("layers", &settings.store.len())
            .finish_non_exhaustive()
    }
}

impl OverlayCompositor {
    #[must_use]
    pub fn new(config: &CompositorConfig, store: OverlayStore, renderer: SharedRenderer) -> Self {
        Self {
            state: RwLock::new(CompositorState::Idle),
            settings: RwLock::new(Settings {
                width: config.output_width,
                height: config.output_height,
                overlays_enabled: config.overlays_enabled,
                store,
            }),
            cache: Mutex::new(OverlayCache::default()),
            renderer,
            filter: config.scale_filter.into(),
            refresh_interval: config.overlay_refresh_interval(),
            render_budget: config.render_budget(),
            rebuilds: AtomicU64::new(0),
            frames: AtomicU64::new(0),
        }
    }

    pub fn start(&self) {
        *self.state.write() = CompositorState::Started;
        info!("Compositor started");
    }

    pub fn stop(&self) {
        *self.state.write() = CompositorState::Stopped;
        *self.cache.lock() = OverlayCache::default();
        info!("Compositor stopped");
    }

    #[must_use]
    pub fn state(&self) -> CompositorState {
        *self.state.read()
    }

    #[must_use]
    pub fn output_size(&self) -> (u32, u32) {
        let settings = self.settings.read();
        (settings.width, settings.height)
    }

    /// Takes effect on the next submitted frame.
    pub fn update_output_size(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::Configuration(format!(
                "invalid output size {width}x{height}"
            )));
        }
        let mut settings = self.settings.write();
        if (settings.width, settings.height) != (width, height) {
            info!(from_width = settings.width, from_height = settings.height, width, height, "Compositor output size updated");
            settings.width = width;
            settings.height = height;
        }
        Ok(())
    }

    /// Swap the overlay source without interrupting composition.
    pub fn set_overlay_source(&self, store: OverlayStore) {
        self.settings.write().store = store;
        self.cache.lock().built_at = None;
        debug!("Overlay source re-pointed");
    }

    pub fn set_overlays_enabled(&self, enabled: bool) {
        self.settings.write().overlays_enabled = enabled;
    }

    #[must_use]
    pub fn overlays_enabled(&self) -> bool {
        self.settings.read().overlays_enabled
    }

    #[must_use]
    pub fn overlay_store(&self) -> OverlayStore {
        self.settings.read().store.clone()
    }

    /// Number of overlay cache rebuilds so far
    #[must_use]
    pub fn overlay_rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frames_composited(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn submit(&self, frame: Frame) -> Result<CompositedFrame> {
        self.submit_at(frame, Instant::now())
    }

    pub fn submit_at(&self, frame: Frame, now: Instant) -> Result<CompositedFrame> {
        let state = self.state();
        if state != CompositorState::Started {
            return Err(Error::InvalidState(format!(
                "compositor is {state:?}, not started"
            )));
        }

        let settings = self.settings.read().clone();
        let (width, height) = (settings.width, settings.height);
        let mut output = aspect_fill(frame.to_rgba()?, width, height, self.filter)?;

        if settings.overlays_enabled && settings.store.has_visible() {
            let mut cache = self.cache.lock();
            if self.needs_rebuild(&cache, width, height, now) {
                self.rebuild(&mut cache, &settings.store, width, height, now);
            }
            if let Some(overlay) = cache
                .image
                .as_ref()
                .filter(|img| img.dimensions() == (width, height))
            {
                imageops::overlay(&mut output, overlay, 0, 0);
            }
        }

        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(CompositedFrame::from_image(output, &frame))
    }

    fn needs_rebuild(&self, cache: &OverlayCache, width: u32, height: u32, now: Instant) -> bool {
        let size_changed = cache
            .image
            .as_ref()
            .map_or(true, |img| img.dimensions() != (width, height));
        let stale = cache
            .built_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.refresh_interval);
        size_changed || stale
    }

    fn rebuild(
        &self,
        cache: &mut OverlayCache,
        store: &OverlayStore,
        width: u32,
        height: u32,
        now: Instant,
    ) {
        // The UI owns the render context; never wait on it past the budget.
        let Some(mut renderer) = self.renderer.try_lock_for(self.render_budget) else {
            debug!(budget_ms = self.render_budget.as_millis() as u64, "Render context busy, keeping previous overlay");
            return;
        };

        let mut canvas = RgbaImage::new(width, height);
        let mut drawn = 0usize;
        for layer in store.snapshot() {
            if layer.placement.is_empty() {
                continue;
            }
            let snapshot = match renderer.render(&layer) {
                Ok(img) => img,
                Err(e) => {
                    warn!(layer = %layer.id, title = %layer.title, error = %e, "Skipping overlay layer");
                    continue;
                }
            };
            let Rect { x, y, width: w, height: h } = layer.placement;
            let sized = if snapshot.dimensions() == (w, h) {
                snapshot
            } else {
                imageops::resize(&snapshot, w, h, self.filter)
            };
            imageops::overlay(&mut canvas, &sized, x, y);
            drawn += 1;
        }
        drop(renderer);

        cache.image = Some(canvas);
        cache.built_at = Some(now);
        let rebuilds = self.rebuilds.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(layers = drawn, rebuilds, "Overlay cache rebuilt");
    }
}
