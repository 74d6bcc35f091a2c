//! Overlay layers and the store the UI mutates.

use std::sync::Arc;

use image::RgbaImage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;

const DEFAULT_TITLE: &str = "Widget";

/// Placement in output-frame coordinates. The origin may lie off-canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: i64, y: i64, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(Uuid);

impl LayerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayer {
    pub id: LayerId,
    pub title: String,
    pub source_url: String,
    pub placement: Rect,
    pub visible: bool,
}

impl OverlayLayer {
    #[must_use]
    pub fn new(source_url: impl Into<String>, placement: Rect) -> Self {
        let source_url = source_url.into();
        Self {
            id: LayerId::new(),
            title: title_from_url(&source_url),
            source_url,
            placement,
            visible: true,
        }
    }
}

/// Display title for a widget: the URL host without a leading `www.`.
#[must_use]
pub fn title_from_url(source_url: &str) -> String {
    url::Url::parse(source_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .map(|host| host.strip_prefix("www.").map_or_else(|| host.clone(), str::to_string))
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

/// Ordered list of overlay layers. Later layers draw over earlier ones.
///
/// Cloning yields another handle to the same list.
#[derive(Debug, Clone, Default)]
pub struct OverlayStore {
    layers: Arc<RwLock<Vec<Arc<OverlayLayer>>>>,
}

impl OverlayStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, layer: OverlayLayer) -> LayerId {
        let id = layer.id;
        info!(layer = %id, title = %layer.title, "Overlay layer added");
        self.layers.write().push(Arc::new(layer));
        id
    }

    pub fn remove(&self, id: LayerId) -> bool {
        let mut layers = self.layers.write();
        let before = layers.len();
        layers.retain(|l| l.id != id);
        let removed = layers.len() != before;
        if removed {
            info!(layer = %id, "Overlay layer removed");
        }
        removed
    }

    pub fn update_placement(&self, id: LayerId, placement: Rect) -> bool {
        self.modify(id, |layer| layer.placement = placement)
    }

    pub fn set_visible(&self, id: LayerId, visible: bool) -> bool {
        self.modify(id, |layer| layer.visible = visible)
    }

    fn modify(&self, id: LayerId, f: impl FnOnce(&mut OverlayLayer)) -> bool {
        let mut layers = self.layers.write();
        let Some(slot) = layers.iter_mut().find(|l| l.id == id) else {
            debug!(layer = %id, "Ignoring update for unknown overlay layer");
            return false;
        };
        let mut updated = (**slot).clone();
        f(&mut updated);
        *slot = Arc::new(updated);
        true
    }

    /// Visible layers in draw order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<OverlayLayer>> {
        self.layers
            .read()
            .iter()
            .filter(|l| l.visible)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn has_visible(&self) -> bool {
        self.layers.read().iter().any(|l| l.visible)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }
}

/// Produces the current snapshot of a layer's content.
///
/// Implementations live on the UI side (web views, widget renderers). The
/// returned image is scaled to the layer's placement by the compositor.
pub trait LayerRenderer: Send {
    fn render(&mut self, layer: &OverlayLayer) -> Result<RgbaImage>;
}

/// Render context shared with the UI. The compositor only ever acquires it
/// with a deadline.
pub type SharedRenderer = Arc<Mutex<dyn LayerRenderer>>;

pub fn shared_renderer<R: LayerRenderer + 'static>(renderer: R) -> SharedRenderer {
    Arc::new(Mutex::new(renderer))
}
