//! Incremental tab-model mirror for the main side of the bridge.
//!
//! The main process owns the authoritative tab/group model. This crate turns
//! local UI observations into minimal deltas pushed to the extension host,
//! falls back to a single full-model push whenever its bookkeeping no longer
//! matches the UI, and services the mutation requests (`move_tab`,
//! `close_tabs`, `close_groups`) the extension side is allowed to make.
//!
//! The widget toolkit itself stays behind two narrow seams: [`TabBarSource`]
//! (enumerate bars and their ordered widgets) and [`TabHost`] (apply
//! extension-requested mutations).

use std::fmt;

use atrium_proto::tabs::TabInput;

pub mod handler;
pub mod mirror;
pub mod remote;

pub use handler::TabsMainHandler;
pub use mirror::{Incorporation, MirrorConfig, TabsMirror};
pub use remote::{RemoteTabsProxy, TabsRemote};

/// Identity of one tab bar on the main side. Opaque to the extension host;
/// the mirror maps it to a stable numeric group id before anything crosses
/// the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarId(pub u64);

impl fmt::Display for BarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bar{}", self.0)
    }
}

/// Stable identity of the content shown in a tab (typically a URI). Closing
/// and reopening the same content in the same group reproduces the same
/// mirrored tab id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WidgetId(pub String);

impl WidgetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WidgetId {
    fn from(value: &str) -> Self {
        WidgetId(value.to_string())
    }
}

/// The closed set of UI surface kinds the mirror knows how to describe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SurfaceKind {
    Editor { uri: String },
    DiffEditor { original: String, modified: String },
    Terminal { terminal_id: String },
    Webview { view_type: String },
    Notebook { uri: String },
}

/// Classifies a surface once into its wire representation. Consumers match on
/// the resulting tag instead of probing concrete widget types.
pub fn classify_surface(surface: &SurfaceKind) -> TabInput {
    match surface {
        SurfaceKind::Editor { uri } => TabInput::TextEditor { uri: uri.clone() },
        SurfaceKind::DiffEditor { original, modified } => TabInput::Diff {
            original: original.clone(),
            modified: modified.clone(),
        },
        SurfaceKind::Terminal { terminal_id } => TabInput::Terminal {
            terminal_id: terminal_id.clone(),
        },
        SurfaceKind::Webview { view_type } => TabInput::Webview {
            view_type: view_type.clone(),
        },
        SurfaceKind::Notebook { uri } => TabInput::Notebook { uri: uri.clone() },
    }
}

/// Point-in-time description of one widget in a bar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WidgetSnapshot {
    pub widget: WidgetId,
    pub label: String,
    pub surface: SurfaceKind,
    pub is_dirty: bool,
    pub is_pinned: bool,
    pub is_preview: bool,
}

/// Point-in-time description of one bar and its ordered widgets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarSnapshot {
    pub bar: BarId,
    pub is_current: bool,
    pub view_column: u32,
    pub widgets: Vec<WidgetSnapshot>,
    pub active_widget: Option<WidgetId>,
}

/// Enumeration seam onto the widget toolkit, used for full rebuilds.
pub trait TabBarSource: Send + Sync {
    fn bars(&self) -> Vec<BarSnapshot>;
}

/// Mutation seam onto the widget toolkit. Each operation reports success as a
/// boolean; the UI validates and applies the change, the mirror merely
/// forwards it.
#[async_trait::async_trait]
pub trait TabHost: Send + Sync {
    async fn close_widgets(&self, widgets: Vec<(BarId, WidgetId)>) -> bool;
    async fn close_bar(&self, bar: BarId) -> bool;
    async fn move_widget(&self, bar: BarId, widget: WidgetId, to_index: u32) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_a_pure_tagging_step() {
        let input = classify_surface(&SurfaceKind::DiffEditor {
            original: "file:///a".into(),
            modified: "file:///b".into(),
        });
        assert_eq!(
            input,
            TabInput::Diff {
                original: "file:///a".into(),
                modified: "file:///b".into(),
            }
        );
    }
}
