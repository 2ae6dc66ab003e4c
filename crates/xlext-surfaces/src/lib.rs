//! Widget and overlay surfaces contributed by extensions.
//!
//! Tracks the multi-tenant widget registry (legacy single-widget model and the
//! v2 multi-widget model) and the single global overlay slot, together with the
//! action ids each rendered tree currently exposes. Actions are only dispatched
//! to their owner while the id is present in the surface's latest render.

mod node;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use node::{
    collect_action_ids, ButtonVariant, StackDirection, TextTone, UiNode, UI_ACTION_ID_MAX_CHARS,
    UI_NODE_MAX_COUNT, UI_NODE_MAX_DEPTH,
};

/// Widget id used by the legacy one-widget-per-owner API.
pub const LEGACY_WIDGET_ID: &str = "legacy";
pub const WIDGET_ID_MAX_CHARS: usize = 64;
pub const WIDGET_HEIGHT_MAX_PX: u32 = 2_000;

/// Callback receiving an action id reported by the rendered UI.
pub type ActionHandler = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Enumerates supported `SurfaceError` values.
pub enum SurfaceError {
    #[error("invalid render tree: {0}")]
    InvalidNode(String),
    #[error("invalid widget: {0}")]
    InvalidWidget(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "kebab-case")]
/// Enumerates supported `WidgetPlacement` values.
pub enum WidgetPlacement {
    #[default]
    AboveInput,
    BelowInput,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Presentation options for one widget.
pub struct WidgetLayout {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub placement: WidgetPlacement,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub collapsible: bool,
    #[serde(default)]
    pub collapsed: bool,
    #[serde(default)]
    pub min_height_px: Option<u32>,
    #[serde(default)]
    pub max_height_px: Option<u32>,
}

/// Request to create or replace one v2 widget.
#[derive(Clone)]
pub struct WidgetUpsert {
    pub owner_id: String,
    pub widget_id: String,
    pub node: UiNode,
    pub on_action: Option<ActionHandler>,
    pub layout: WidgetLayout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of a show/upsert: the render generation and its live action ids.
pub struct SurfaceRender {
    pub generation: u64,
    pub action_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
/// Read-only view of a widget for the host UI.
pub struct WidgetSnapshot {
    pub owner_id: String,
    pub widget_id: String,
    pub node: UiNode,
    pub layout: WidgetLayout,
    pub action_ids: BTreeSet<String>,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Read-only view of the overlay slot for the host UI.
pub struct OverlaySnapshot {
    pub owner_id: String,
    pub node: UiNode,
    pub action_ids: BTreeSet<String>,
    pub generation: u64,
}

struct WidgetEntry {
    node: UiNode,
    layout: WidgetLayout,
    action_ids: BTreeSet<String>,
    on_action: Option<ActionHandler>,
    generation: u64,
}

struct OverlayEntry {
    owner_id: String,
    node: UiNode,
    action_ids: BTreeSet<String>,
    on_action: Option<ActionHandler>,
    generation: u64,
}

#[derive(Default)]
struct SurfaceState {
    widgets: BTreeMap<(String, String), WidgetEntry>,
    overlay: Option<OverlayEntry>,
    next_generation: u64,
    revision: u64,
}

impl SurfaceState {
    fn next_generation(&mut self) -> u64 {
        self.next_generation = self.next_generation.saturating_add(1);
        self.next_generation
    }

    fn touch(&mut self) {
        self.revision = self.revision.saturating_add(1);
    }
}

#[derive(Default)]
/// Shared registry of extension widgets plus the global overlay slot.
pub struct SurfaceManager {
    state: Mutex<SurfaceState>,
}

impl fmt::Debug for SurfaceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SurfaceManager")
            .field("widgets", &state.widgets.len())
            .field("overlay_owner", &state.overlay.as_ref().map(|o| &o.owner_id))
            .field("revision", &state.revision)
            .finish()
    }
}

impl SurfaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SurfaceState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Monotonic counter bumped on every visible change.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    pub fn show_widget(
        &self,
        owner_id: &str,
        node: UiNode,
        on_action: Option<ActionHandler>,
    ) -> Result<SurfaceRender, SurfaceError> {
        self.replace_widget(owner_id, LEGACY_WIDGET_ID, node, on_action, WidgetLayout::default())
    }

    pub fn show_widget_text(
        &self,
        owner_id: &str,
        text: &str,
    ) -> Result<SurfaceRender, SurfaceError> {
        self.show_widget(owner_id, UiNode::text(text), None)
    }

    pub fn dismiss_widget(&self, owner_id: &str) -> bool {
        self.remove_widget(owner_id, LEGACY_WIDGET_ID)
    }

    /// Creates or atomically replaces the widget keyed by `(owner_id, widget_id)`.
    pub fn upsert_widget(&self, upsert: WidgetUpsert) -> Result<SurfaceRender, SurfaceError> {
        validate_widget_id(&upsert.widget_id)?;
        let layout = normalize_widget_layout(upsert.layout)?;
        self.replace_widget(
            &upsert.owner_id,
            upsert.widget_id.trim(),
            upsert.node,
            upsert.on_action,
            layout,
        )
    }

    fn replace_widget(
        &self,
        owner_id: &str,
        widget_id: &str,
        node: UiNode,
        on_action: Option<ActionHandler>,
        layout: WidgetLayout,
    ) -> Result<SurfaceRender, SurfaceError> {
        if owner_id.trim().is_empty() {
            return Err(SurfaceError::InvalidWidget(
                "owner id must not be empty".to_string(),
            ));
        }
        let action_ids = collect_action_ids(&node)?;
        let mut state = self.lock();
        let generation = state.next_generation();
        state.widgets.insert(
            (owner_id.to_string(), widget_id.to_string()),
            WidgetEntry {
                node,
                layout,
                action_ids: action_ids.clone(),
                on_action,
                generation,
            },
        );
        state.touch();
        debug!(owner_id, widget_id, generation, "widget rendered");
        Ok(SurfaceRender {
            generation,
            action_ids,
        })
    }

    pub fn remove_widget(&self, owner_id: &str, widget_id: &str) -> bool {
        let mut state = self.lock();
        let removed = state
            .widgets
            .remove(&(owner_id.to_string(), widget_id.trim().to_string()))
            .is_some();
        if removed {
            state.touch();
        }
        removed
    }

    /// Removes every widget owned by `owner_id` and returns how many were removed.
    pub fn clear_widgets(&self, owner_id: &str) -> usize {
        let mut state = self.lock();
        let before = state.widgets.len();
        state.widgets.retain(|(owner, _), _| owner != owner_id);
        let removed = before - state.widgets.len();
        if removed > 0 {
            state.touch();
        }
        removed
    }

    /// Widgets for `placement`, in render order.
    pub fn widgets(&self, placement: WidgetPlacement) -> Vec<WidgetSnapshot> {
        let state = self.lock();
        let mut widgets = state
            .widgets
            .iter()
            .filter(|(_, entry)| entry.layout.placement == placement)
            .map(|((owner_id, widget_id), entry)| WidgetSnapshot {
                owner_id: owner_id.clone(),
                widget_id: widget_id.clone(),
                node: entry.node.clone(),
                layout: entry.layout.clone(),
                action_ids: entry.action_ids.clone(),
                generation: entry.generation,
            })
            .collect::<Vec<_>>();
        widgets.sort_by(|left, right| {
            left.layout
                .order
                .cmp(&right.layout.order)
                .then_with(|| left.owner_id.cmp(&right.owner_id))
                .then_with(|| left.widget_id.cmp(&right.widget_id))
        });
        widgets
    }

    pub fn widget_count(&self, owner_id: &str) -> usize {
        self.lock()
            .widgets
            .keys()
            .filter(|(owner, _)| owner == owner_id)
            .count()
    }

    /// Forwards `action_id` to the widget's handler if it is still live.
    pub fn dispatch_widget_action(&self, owner_id: &str, widget_id: &str, action_id: &str) -> bool {
        let handler = {
            let state = self.lock();
            state
                .widgets
                .get(&(owner_id.to_string(), widget_id.to_string()))
                .filter(|entry| entry.action_ids.contains(action_id))
                .and_then(|entry| entry.on_action.clone())
        };
        match handler {
            Some(handler) => {
                handler(action_id.to_string());
                true
            }
            None => {
                debug!(owner_id, widget_id, action_id, "ignored stale widget action");
                false
            }
        }
    }

    /// Shows `node` in the global overlay slot, replacing any previous overlay.
    pub fn show_overlay(
        &self,
        owner_id: &str,
        node: UiNode,
        on_action: Option<ActionHandler>,
    ) -> Result<SurfaceRender, SurfaceError> {
        let action_ids = collect_action_ids(&node)?;
        let mut state = self.lock();
        let generation = state.next_generation();
        if let Some(previous) = state.overlay.as_ref() {
            if previous.owner_id != owner_id {
                debug!(
                    previous_owner = %previous.owner_id,
                    owner_id, "overlay taken over by another extension"
                );
            }
        }
        state.overlay = Some(OverlayEntry {
            owner_id: owner_id.to_string(),
            node,
            action_ids: action_ids.clone(),
            on_action,
            generation,
        });
        state.touch();
        Ok(SurfaceRender {
            generation,
            action_ids,
        })
    }

    pub fn show_overlay_text(
        &self,
        owner_id: &str,
        text: &str,
    ) -> Result<SurfaceRender, SurfaceError> {
        self.show_overlay(owner_id, UiNode::text(text), None)
    }

    /// Clears the overlay slot regardless of which extension filled it.
    pub fn dismiss_overlay(&self) -> bool {
        let mut state = self.lock();
        let dismissed = state.overlay.take().is_some();
        if dismissed {
            state.touch();
        }
        dismissed
    }

    /// Clears the overlay slot only when `owner_id` currently holds it.
    pub fn release_overlay(&self, owner_id: &str) -> bool {
        let mut state = self.lock();
        let owned = state
            .overlay
            .as_ref()
            .is_some_and(|overlay| overlay.owner_id == owner_id);
        if owned {
            state.overlay = None;
            state.touch();
        }
        owned
    }

    pub fn overlay(&self) -> Option<OverlaySnapshot> {
        self.lock().overlay.as_ref().map(|overlay| OverlaySnapshot {
            owner_id: overlay.owner_id.clone(),
            node: overlay.node.clone(),
            action_ids: overlay.action_ids.clone(),
            generation: overlay.generation,
        })
    }

    /// Forwards `action_id` to the overlay's handler if it is still live.
    pub fn dispatch_overlay_action(&self, action_id: &str) -> bool {
        let handler = {
            let state = self.lock();
            state
                .overlay
                .as_ref()
                .filter(|overlay| overlay.action_ids.contains(action_id))
                .and_then(|overlay| overlay.on_action.clone())
        };
        match handler {
            Some(handler) => {
                handler(action_id.to_string());
                true
            }
            None => {
                debug!(action_id, "ignored stale overlay action");
                false
            }
        }
    }
}

fn validate_widget_id(widget_id: &str) -> Result<(), SurfaceError> {
    let widget_id = widget_id.trim();
    if widget_id.is_empty() {
        return Err(SurfaceError::InvalidWidget(
            "widgetId must not be empty".to_string(),
        ));
    }
    if widget_id.chars().count() > WIDGET_ID_MAX_CHARS {
        return Err(SurfaceError::InvalidWidget(format!(
            "widgetId exceeds {} characters",
            WIDGET_ID_MAX_CHARS
        )));
    }
    if widget_id == LEGACY_WIDGET_ID {
        return Err(SurfaceError::InvalidWidget(format!(
            "widgetId '{}' is reserved",
            LEGACY_WIDGET_ID
        )));
    }
    Ok(())
}

fn normalize_widget_layout(layout: WidgetLayout) -> Result<WidgetLayout, SurfaceError> {
    let min_height_px = layout
        .min_height_px
        .map(|value| value.min(WIDGET_HEIGHT_MAX_PX));
    let max_height_px = layout
        .max_height_px
        .map(|value| value.min(WIDGET_HEIGHT_MAX_PX));
    if let (Some(min), Some(max)) = (min_height_px, max_height_px) {
        if min > max {
            return Err(SurfaceError::InvalidWidget(format!(
                "minHeightPx ({min}) must not exceed maxHeightPx ({max})"
            )));
        }
    }
    let title = layout
        .title
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty());
    Ok(WidgetLayout {
        title,
        collapsed: layout.collapsible && layout.collapsed,
        min_height_px,
        max_height_px,
        ..layout
    })
}
