use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::SurfaceError;

pub const UI_NODE_MAX_DEPTH: usize = 16;
pub const UI_NODE_MAX_COUNT: usize = 500;
pub const UI_ACTION_ID_MAX_CHARS: usize = 128;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `TextTone` values.
pub enum TextTone {
    #[default]
    Normal,
    Muted,
    Success,
    Warning,
    Danger,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ButtonVariant` values.
pub enum ButtonVariant {
    #[default]
    Secondary,
    Primary,
    Danger,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `StackDirection` values.
pub enum StackDirection {
    #[default]
    Vertical,
    Horizontal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Declarative render tree an extension contributes to a widget or overlay.
pub enum UiNode {
    Text {
        text: String,
        #[serde(default)]
        tone: TextTone,
    },
    Heading {
        text: String,
    },
    Markdown {
        markdown: String,
    },
    #[serde(rename_all = "camelCase")]
    Button {
        label: String,
        action_id: String,
        #[serde(default)]
        variant: ButtonVariant,
    },
    Stack {
        #[serde(default)]
        direction: StackDirection,
        #[serde(default)]
        children: Vec<UiNode>,
    },
    Divider,
}

impl UiNode {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            tone: TextTone::Normal,
        }
    }

    pub fn button(label: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self::Button {
            label: label.into(),
            action_id: action_id.into(),
            variant: ButtonVariant::Secondary,
        }
    }

    pub fn stack(children: Vec<UiNode>) -> Self {
        Self::Stack {
            direction: StackDirection::Vertical,
            children,
        }
    }
}

/// Validates `node` and returns every action id embedded in it.
///
/// Trees deeper than [`UI_NODE_MAX_DEPTH`] or larger than
/// [`UI_NODE_MAX_COUNT`] nodes are rejected, as are empty, oversized, or
/// duplicated action ids.
pub fn collect_action_ids(node: &UiNode) -> Result<BTreeSet<String>, SurfaceError> {
    let mut action_ids = BTreeSet::new();
    let mut visited = 0_usize;
    let mut stack = vec![(node, 1_usize)];
    while let Some((current, depth)) = stack.pop() {
        visited += 1;
        if visited > UI_NODE_MAX_COUNT {
            return Err(SurfaceError::InvalidNode(format!(
                "render tree exceeds {} nodes",
                UI_NODE_MAX_COUNT
            )));
        }
        if depth > UI_NODE_MAX_DEPTH {
            return Err(SurfaceError::InvalidNode(format!(
                "render tree exceeds depth {}",
                UI_NODE_MAX_DEPTH
            )));
        }
        match current {
            UiNode::Button { action_id, .. } => {
                if action_id.trim().is_empty() {
                    return Err(SurfaceError::InvalidNode(
                        "button actionId must not be empty".to_string(),
                    ));
                }
                if action_id.chars().count() > UI_ACTION_ID_MAX_CHARS {
                    return Err(SurfaceError::InvalidNode(format!(
                        "button actionId exceeds {} characters",
                        UI_ACTION_ID_MAX_CHARS
                    )));
                }
                if !action_ids.insert(action_id.clone()) {
                    return Err(SurfaceError::InvalidNode(format!(
                        "duplicate actionId '{}'",
                        action_id
                    )));
                }
            }
            UiNode::Stack { children, .. } => {
                stack.extend(children.iter().map(|child| (child, depth + 1)));
            }
            UiNode::Text { .. }
            | UiNode::Heading { .. }
            | UiNode::Markdown { .. }
            | UiNode::Divider => {}
        }
    }
    Ok(action_ids)
}
