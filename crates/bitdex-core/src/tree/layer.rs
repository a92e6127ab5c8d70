//! Layers: the named nodes of the context tree.
//!
//! A layer's kind is a tagged variant rather than a subtype. Workspace-bound
//! layers hold only a reference; their display attributes always come from
//! the workspace directory at query time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IndexError, IndexResult};
use crate::tree::path::{normalize_path, segments};

/// Name of the built-in root layer.
pub const ROOT_LAYER_NAME: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LayerKind {
    Context,
    Canvas,
    Label,
    Workspace { workspace_id: String },
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Canvas => "canvas",
            Self::Label => "label",
            Self::Workspace { .. } => "workspace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerState {
    /// Known to the layer index but not yet placed in the tree.
    Created,
    Active,
    Locked,
    Deleted,
}

/// Display attributes owned by a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// Stored layer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub id: Uuid,
    pub name: String,
    pub label: String,
    pub description: String,
    pub color: Option<String>,
    pub kind: LayerKind,
    pub state: LayerState,
    /// Principal -> permission.
    pub acl: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Layer {
    pub fn new(name: &str, kind: LayerKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            label: name.to_string(),
            description: String::new(),
            color: None,
            kind,
            state: LayerState::Created,
            acl: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn root() -> Self {
        let mut root = Self::new(ROOT_LAYER_NAME, LayerKind::Context);
        root.id = Uuid::nil();
        root.label = "Universe".to_string();
        root.state = LayerState::Active;
        root
    }

    pub fn is_root(&self) -> bool {
        self.id.is_nil()
    }

    pub fn is_locked(&self) -> bool {
        self.state == LayerState::Locked
    }

    pub fn workspace_id(&self) -> Option<&str> {
        match &self.kind {
            LayerKind::Workspace { workspace_id } => Some(workspace_id),
            _ => None,
        }
    }

    /// Fail with `LayerLocked` unless the layer accepts mutation.
    pub fn ensure_mutable(&self, operation: &'static str) -> IndexResult<()> {
        match self.state {
            LayerState::Locked => Err(IndexError::LayerLocked {
                operation,
                layer: self.name.clone(),
            }),
            LayerState::Deleted => Err(IndexError::not_found(operation, "layer", self.name.clone())),
            LayerState::Created | LayerState::Active => Ok(()),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.created_at);
    }
}

/// Layer as presented to callers, with workspace attributes resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerView {
    pub id: Uuid,
    pub name: String,
    pub label: String,
    pub description: String,
    pub color: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub state: LayerState,
    pub locked: bool,
    pub acl: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

impl LayerView {
    pub(crate) fn resolve(layer: &Layer, workspace: Option<&WorkspaceInfo>) -> Self {
        let mut view = Self {
            id: layer.id,
            name: layer.name.clone(),
            label: layer.label.clone(),
            description: layer.description.clone(),
            color: layer.color.clone(),
            kind: layer.kind.as_str().to_string(),
            state: layer.state,
            locked: layer.is_locked(),
            acl: layer.acl.clone(),
            workspace_id: layer.workspace_id().map(str::to_string),
        };
        if let Some(ws) = workspace {
            view.name = ws.name.clone();
            view.label = if ws.label.is_empty() {
                ws.name.clone()
            } else {
                ws.label.clone()
            };
            view.description = ws.description.clone();
            view.color = ws.color.clone();
        }
        view
    }
}

/// Partial update for `update_layer`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerUpdate {
    pub label: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
}

/// Normalize a layer name: a single path segment.
pub fn normalize_layer_name(name: &str) -> IndexResult<String> {
    const OP: &str = "layer_name";
    let normalized = normalize_path(name)?;
    match segments(&normalized).as_slice() {
        [single] => Ok(single.to_string()),
        [] => Err(IndexError::validation(OP, "layer name must not be empty")),
        _ => Err(IndexError::validation(
            OP,
            format!("layer name '{}' must not contain '/'", name),
        )),
    }
}
