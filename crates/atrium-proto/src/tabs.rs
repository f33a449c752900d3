//! Tab model DTOs mirrored across the process boundary.
//!
//! The main side owns the authoritative model; the extension side holds only
//! these DTOs and requests mutations via RPC.

use serde::{Deserialize, Serialize};

/// Classification of the UI surface behind a tab.
///
/// The mirror classifies each surface exactly once into a variant tag plus
/// payload; consumers match on the tag instead of probing concrete widget
/// types.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TabInput {
    TextEditor { uri: String },
    Diff { original: String, modified: String },
    Terminal { terminal_id: String },
    Webview { view_type: String },
    Notebook { uri: String },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabDto {
    /// Stable per (group, underlying widget identity): reopening the same
    /// widget in the same group yields the same id.
    pub id: String,
    pub label: String,
    pub input: TabInput,
    pub is_active: bool,
    pub is_pinned: bool,
    pub is_preview: bool,
    pub is_dirty: bool,
}

impl TabDto {
    /// Whether anything the remote side can observe differs between the two.
    ///
    /// Every observable field participates; a DTO differing in any of these is
    /// not equal.
    pub fn observably_eq(&self, other: &TabDto) -> bool {
        self.id == other.id
            && self.is_active == other.is_active
            && self.is_dirty == other.is_dirty
            && self.is_pinned == other.is_pinned
            && self.is_preview == other.is_preview
            && self.label == other.label
            && self.input == other.input
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabGroupDto {
    pub group_id: u32,
    pub is_active: bool,
    pub view_column: u32,
    pub tabs: Vec<TabDto>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TabOperationKind {
    Open,
    Close,
    Update,
    Move,
    #[serde(other)]
    Unknown,
}

/// A minimal description of one change to the mirrored model, in contrast to
/// re-sending the full model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabOperation {
    pub kind: TabOperationKind,
    pub group_id: u32,
    pub index: u32,
    pub tab: TabDto,
    /// Only present for `Move`.
    pub old_index: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: &str) -> TabDto {
        TabDto {
            id: id.into(),
            label: "main.rs".into(),
            input: TabInput::TextEditor {
                uri: "file:///w/src/main.rs".into(),
            },
            is_active: false,
            is_pinned: false,
            is_preview: false,
            is_dirty: false,
        }
    }

    #[test]
    fn observable_equality_covers_every_flag() {
        let base = tab("1~file:///w/src/main.rs");
        assert!(base.observably_eq(&base.clone()));

        let mut active = base.clone();
        active.is_active = true;
        let mut dirty = base.clone();
        dirty.is_dirty = true;
        let mut pinned = base.clone();
        pinned.is_pinned = true;
        let mut preview = base.clone();
        preview.is_preview = true;
        let mut relabeled = base.clone();
        relabeled.label = "main.rs (deleted)".into();
        let renamed = tab("2~file:///w/src/main.rs");

        for changed in [&active, &dirty, &pinned, &preview, &relabeled, &renamed] {
            assert!(!base.observably_eq(changed));
        }
    }

    #[test]
    fn tab_operation_round_trips() {
        let op = TabOperation {
            kind: TabOperationKind::Move,
            group_id: 2,
            index: 0,
            tab: tab("2~file:///w/src/main.rs"),
            old_index: Some(3),
        };
        let value = crate::to_value(&op).unwrap();
        assert_eq!(crate::from_value::<TabOperation>(value).unwrap(), op);
    }
}
