//! The context tree: a versioned hierarchy of layers whose paths map to
//! context bitmap labels.
//!
//! A node's label is `context/<layer-id>/<layer-id>/...`, built from the ids
//! of the layers on its path. Labels are therefore stable when a layer is
//! renamed and change only when the node itself moves. The root maps to the
//! bare `context` label.
//!
//! Layers are shared: the same layer may appear under several parents, and
//! a layer name resolves to the same layer everywhere.

pub mod layer;
pub mod path;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IndexError, IndexResult};
pub use layer::{
    normalize_layer_name, Layer, LayerKind, LayerState, LayerUpdate, LayerView, WorkspaceInfo,
    ROOT_LAYER_NAME,
};
pub use path::{join_path, normalize_path, parent_path, segments, ContextUrl, ROOT_PATH};

/// Label of the root node.
pub const CONTEXT_LABEL_ROOT: &str = "context";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub layer: Uuid,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn new(layer: Uuid) -> Self {
        Self {
            layer,
            children: Vec::new(),
        }
    }

    fn child(&self, layer: Uuid) -> Option<&TreeNode> {
        self.children.iter().find(|c| c.layer == layer)
    }

    fn child_mut(&mut self, layer: Uuid) -> Option<&mut TreeNode> {
        self.children.iter_mut().find(|c| c.layer == layer)
    }

    fn take_child(&mut self, layer: Uuid) -> Option<TreeNode> {
        let pos = self.children.iter().position(|c| c.layer == layer)?;
        Some(self.children.remove(pos))
    }

    fn references(&self, layer: Uuid) -> bool {
        self.layer == layer || self.children.iter().any(|c| c.references(layer))
    }

    /// Relative id paths of this node's descendants (excluding itself),
    /// parents before children.
    fn descendants(&self, prefix: &mut Vec<Uuid>, out: &mut Vec<Vec<Uuid>>) {
        for child in &self.children {
            prefix.push(child.layer);
            out.push(prefix.clone());
            child.descendants(prefix, out);
            prefix.pop();
        }
    }
}

/// Build the context label for a path given as layer ids.
pub fn context_label(ids: &[Uuid]) -> String {
    let mut label = CONTEXT_LABEL_ROOT.to_string();
    for id in ids {
        label.push('/');
        label.push_str(&id.to_string());
    }
    label
}

/// Outcome of `insert_path`.
#[derive(Debug, Clone, Serialize)]
pub struct InsertedPath {
    pub path: String,
    pub label: String,
    pub layer_ids: Vec<Uuid>,
    /// Names of layers created by this call.
    pub created_layers: Vec<String>,
    /// Whether any node was added.
    pub changed: bool,
}

/// Outcome of `remove_path`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemovedPath {
    /// Labels of nodes that no longer exist.
    pub removed_labels: Vec<String>,
    /// Labels of lifted children, old to new.
    pub renames: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub path: String,
    pub label: String,
    pub layer: LayerView,
    pub children: Vec<String>,
}

/// Serializable image of the tree and its layer index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub version: u64,
    pub root: TreeNode,
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceInfo>,
}

#[derive(Debug, Clone)]
pub struct ContextTree {
    root: TreeNode,
    layers: HashMap<Uuid, Layer>,
    /// Name index of non-workspace layers.
    names: HashMap<String, Uuid>,
    workspaces: HashMap<String, WorkspaceInfo>,
    version: u64,
}

impl Default for ContextTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextTree {
    pub fn new() -> Self {
        let root = Layer::root();
        let root_id = root.id;
        let mut layers = HashMap::new();
        layers.insert(root_id, root);
        let mut names = HashMap::new();
        names.insert(ROOT_LAYER_NAME.to_string(), root_id);
        Self {
            root: TreeNode::new(root_id),
            layers,
            names,
            workspaces: HashMap::new(),
            version: 0,
        }
    }

    /// Structural version; bumped by every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    // ============ Name resolution ============

    fn effective_name(&self, layer: &Layer) -> String {
        layer
            .workspace_id()
            .and_then(|w| self.workspaces.get(w))
            .map(|ws| ws.name.clone())
            .unwrap_or_else(|| layer.name.clone())
    }

    fn view(&self, layer: &Layer) -> LayerView {
        let ws = layer.workspace_id().and_then(|w| self.workspaces.get(w));
        LayerView::resolve(layer, ws)
    }

    fn layer_id_by_name(&self, name: &str) -> Option<Uuid> {
        if let Some(id) = self.names.get(name) {
            return Some(*id);
        }
        self.layers
            .values()
            .find(|l| {
                l.state != LayerState::Deleted
                    && l.workspace_id().is_some()
                    && self.effective_name(l) == name
            })
            .map(|l| l.id)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.layer_id_by_name(name).is_some()
            || self.workspaces.values().any(|w| w.name == name)
    }

    fn layer(&self, operation: &'static str, name: &str) -> IndexResult<&Layer> {
        self.layer_id_by_name(name)
            .and_then(|id| self.layers.get(&id))
            .ok_or_else(|| IndexError::not_found(operation, "layer", name))
    }

    fn layer_mut(&mut self, operation: &'static str, name: &str) -> IndexResult<&mut Layer> {
        let id = self
            .layer_id_by_name(name)
            .ok_or_else(|| IndexError::not_found(operation, "layer", name))?;
        self.layers
            .get_mut(&id)
            .ok_or_else(|| IndexError::not_found(operation, "layer", name))
    }

    fn layer_by_id(&self, operation: &'static str, id: Uuid) -> IndexResult<&Layer> {
        self.layers
            .get(&id)
            .ok_or_else(|| IndexError::not_found(operation, "layer", id.to_string()))
    }

    /// Layer ids along an existing path, root excluded.
    fn resolve(&self, operation: &'static str, path: &str) -> IndexResult<Vec<Uuid>> {
        let normalized = normalize_path(path)?;
        let mut ids = Vec::new();
        let mut node = &self.root;
        for seg in segments(&normalized) {
            let next = self
                .layer_id_by_name(seg)
                .and_then(|id| node.child(id))
                .ok_or_else(|| IndexError::not_found(operation, "path", normalized.clone()))?;
            ids.push(next.layer);
            node = next;
        }
        Ok(ids)
    }

    fn node(&self, ids: &[Uuid]) -> Option<&TreeNode> {
        let mut node = &self.root;
        for id in ids {
            node = node.child(*id)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, ids: &[Uuid]) -> Option<&mut TreeNode> {
        let mut node = &mut self.root;
        for id in ids {
            node = node.child_mut(*id)?;
        }
        Some(node)
    }

    fn path_of(&self, ids: &[Uuid]) -> String {
        let names: Vec<String> = ids
            .iter()
            .filter_map(|id| self.layers.get(id))
            .map(|l| self.effective_name(l))
            .collect();
        format!("/{}", names.join("/"))
    }

    fn ensure_layer_mutable(&self, operation: &'static str, id: Uuid) -> IndexResult<()> {
        let layer = self.layer_by_id(operation, id)?;
        match layer.ensure_mutable(operation) {
            Err(IndexError::LayerLocked { operation, .. }) => Err(IndexError::LayerLocked {
                operation,
                layer: self.effective_name(layer),
            }),
            other => other,
        }
    }

    // ============ Paths ============

    pub fn path_exists(&self, path: &str) -> bool {
        self.resolve("path_exists", path).is_ok()
    }

    /// Context label of an existing path.
    pub fn label_for(&self, path: &str) -> IndexResult<String> {
        Ok(context_label(&self.resolve("label_for", path)?))
    }

    /// Labels of the node at `path` and every descendant.
    pub fn subtree_labels(&self, path: &str) -> IndexResult<Vec<String>> {
        let ids = self.resolve("subtree_labels", path)?;
        let node = self
            .node(&ids)
            .ok_or_else(|| IndexError::not_found("subtree_labels", "path", path))?;
        let mut rel = Vec::new();
        node.descendants(&mut Vec::new(), &mut rel);
        let mut out = vec![context_label(&ids)];
        out.extend(rel.into_iter().map(|r| {
            let mut full = ids.clone();
            full.extend(r);
            context_label(&full)
        }));
        Ok(out)
    }

    /// Fail with `LayerLocked` if any layer on `path` is locked.
    pub fn ensure_writable(&self, path: &str) -> IndexResult<()> {
        for id in self.resolve("ensure_writable", path)? {
            self.ensure_layer_mutable("ensure_writable", id)?;
        }
        Ok(())
    }

    /// Insert `path`, creating missing nodes.
    ///
    /// Unknown layer names are created as Context layers when `auto_create`
    /// is set and rejected with `NotFound` otherwise. Adding a child under a
    /// locked layer fails with `LayerLocked`. Nothing is mutated on failure.
    pub fn insert_path(&mut self, path: &str, auto_create: bool) -> IndexResult<InsertedPath> {
        const OP: &str = "insert_path";
        let normalized = normalize_path(path)?;
        let segs = segments(&normalized);

        // Plan first, mutate second.
        let mut plan: Vec<(String, Option<Uuid>)> = Vec::with_capacity(segs.len());
        let mut node = Some(&self.root);
        let mut parent_id = self.root.layer;
        for seg in &segs {
            let existing = self.layer_id_by_name(seg);
            if existing.is_none() && !auto_create {
                return Err(IndexError::not_found(OP, "layer", *seg));
            }
            if let Some(id) = existing {
                let state = self.layer_by_id(OP, id)?.state;
                if state == LayerState::Deleted {
                    return Err(IndexError::not_found(OP, "layer", *seg));
                }
            }
            let child = match (node, existing) {
                (Some(n), Some(id)) => n.child(id),
                _ => None,
            };
            if child.is_none() {
                self.ensure_layer_mutable(OP, parent_id)?;
            }
            node = child;
            parent_id = existing.unwrap_or_else(Uuid::nil);
            plan.push((seg.to_string(), existing));
        }

        let mut created_layers = Vec::new();
        let mut layer_ids = Vec::with_capacity(plan.len());
        for (name, existing) in plan {
            let id = match existing {
                Some(id) => id,
                None => {
                    let mut layer = Layer::new(&name, LayerKind::Context);
                    layer.state = LayerState::Active;
                    let id = layer.id;
                    self.names.insert(name.clone(), id);
                    self.layers.insert(id, layer);
                    created_layers.push(name);
                    id
                }
            };
            layer_ids.push(id);
        }

        let mut changed = false;
        let mut node = &mut self.root;
        for id in &layer_ids {
            if node.child(*id).is_none() {
                node.children.push(TreeNode::new(*id));
                changed = true;
            }
            node = match node.child_mut(*id) {
                Some(n) => n,
                None => return Err(IndexError::not_found(OP, "path", normalized)),
            };
        }
        for id in &layer_ids {
            if let Some(layer) = self.layers.get_mut(id) {
                if layer.state == LayerState::Created {
                    layer.state = LayerState::Active;
                }
            }
        }
        if changed {
            self.bump();
            tracing::debug!(path = %normalized, created = created_layers.len(), "inserted tree path");
        }
        Ok(InsertedPath {
            path: normalized,
            label: context_label(&layer_ids),
            layer_ids,
            created_layers,
            changed,
        })
    }

    /// Move the node at `from` under `to_parent`.
    ///
    /// With `recursive` the whole subtree moves; otherwise only the node
    /// moves and its children are lifted to its old parent. Returns the
    /// label renames the move implies.
    pub fn move_path(
        &mut self,
        from: &str,
        to_parent: &str,
        recursive: bool,
    ) -> IndexResult<Vec<(String, String)>> {
        const OP: &str = "move_path";
        let from_ids = self.resolve(OP, from)?;
        let to_ids = self.resolve(OP, to_parent)?;
        let Some((&moved, src_parent_ids)) = from_ids.split_last() else {
            return Err(IndexError::validation(OP, "the root cannot be moved"));
        };
        if to_ids.starts_with(&from_ids) {
            return Err(IndexError::validation(
                OP,
                format!("cannot move '{}' into its own subtree", from),
            ));
        }
        let src_parent_ids = src_parent_ids.to_vec();
        if src_parent_ids == to_ids {
            return Ok(Vec::new());
        }
        self.ensure_layer_mutable(OP, moved)?;
        self.ensure_layer_mutable(OP, src_parent_ids.last().copied().unwrap_or_else(Uuid::nil))?;
        self.ensure_layer_mutable(OP, to_ids.last().copied().unwrap_or_else(Uuid::nil))?;

        let dest = self
            .node(&to_ids)
            .ok_or_else(|| IndexError::not_found(OP, "path", to_parent))?;
        if dest.child(moved).is_some() {
            return Err(IndexError::validation(
                OP,
                format!("'{}' already has a child '{}'", to_parent, self.path_of(&[moved])),
            ));
        }
        let node = self
            .node(&from_ids)
            .ok_or_else(|| IndexError::not_found(OP, "path", from))?
            .clone();

        let mut new_base = to_ids.clone();
        new_base.push(moved);
        let mut renames = vec![(context_label(&from_ids), context_label(&new_base))];
        let mut rel = Vec::new();
        node.descendants(&mut Vec::new(), &mut rel);

        if recursive {
            for r in &rel {
                renames.push((
                    context_label(&[from_ids.as_slice(), r.as_slice()].concat()),
                    context_label(&[new_base.as_slice(), r.as_slice()].concat()),
                ));
            }
        } else {
            let src_parent = self
                .node(&src_parent_ids)
                .ok_or_else(|| IndexError::not_found(OP, "path", from))?;
            for child in &node.children {
                if child.layer != moved && src_parent.child(child.layer).is_some() {
                    return Err(IndexError::validation(
                        OP,
                        format!("lifting '{}' would collide with an existing node", self.path_of(&[child.layer])),
                    ));
                }
            }
            for r in &rel {
                renames.push((
                    context_label(&[from_ids.as_slice(), r.as_slice()].concat()),
                    context_label(&[src_parent_ids.as_slice(), r.as_slice()].concat()),
                ));
            }
        }

        let mut taken = self
            .node_mut(&src_parent_ids)
            .and_then(|p| p.take_child(moved))
            .ok_or_else(|| IndexError::not_found(OP, "path", from))?;
        if !recursive {
            let lifted = std::mem::take(&mut taken.children);
            if let Some(parent) = self.node_mut(&src_parent_ids) {
                parent.children.extend(lifted);
            }
        }
        self.node_mut(&to_ids)
            .ok_or_else(|| IndexError::not_found(OP, "path", to_parent))?
            .children
            .push(taken);
        self.bump();
        tracing::debug!(from, to_parent, recursive, "moved tree path");
        Ok(renames)
    }

    /// Copy the subtree at `from` under `to_parent`. Returns
    /// `(source label, copy label)` pairs.
    pub fn copy_path(&mut self, from: &str, to_parent: &str) -> IndexResult<Vec<(String, String)>> {
        const OP: &str = "copy_path";
        let from_ids = self.resolve(OP, from)?;
        let to_ids = self.resolve(OP, to_parent)?;
        let Some(&copied) = from_ids.last() else {
            return Err(IndexError::validation(OP, "the root cannot be copied"));
        };
        if to_ids.starts_with(&from_ids) {
            return Err(IndexError::validation(
                OP,
                format!("cannot copy '{}' into its own subtree", from),
            ));
        }
        self.ensure_layer_mutable(OP, to_ids.last().copied().unwrap_or_else(Uuid::nil))?;
        if self
            .node(&to_ids)
            .map(|n| n.child(copied).is_some())
            .unwrap_or(false)
        {
            return Err(IndexError::validation(
                OP,
                format!("'{}' already has a child '{}'", to_parent, self.path_of(&[copied])),
            ));
        }
        let node = self
            .node(&from_ids)
            .ok_or_else(|| IndexError::not_found(OP, "path", from))?
            .clone();
        let mut new_base = to_ids.clone();
        new_base.push(copied);
        let mut pairs = vec![(context_label(&from_ids), context_label(&new_base))];
        let mut rel = Vec::new();
        node.descendants(&mut Vec::new(), &mut rel);
        for r in &rel {
            pairs.push((
                context_label(&[from_ids.as_slice(), r.as_slice()].concat()),
                context_label(&[new_base.as_slice(), r.as_slice()].concat()),
            ));
        }
        self.node_mut(&to_ids)
            .ok_or_else(|| IndexError::not_found(OP, "path", to_parent))?
            .children
            .push(node);
        self.bump();
        Ok(pairs)
    }

    /// Remove the node at `path`.
    ///
    /// With `recursive` the whole subtree goes, which requires `force` when
    /// the node has children. Without it the node's children are lifted to
    /// its parent.
    pub fn remove_path(&mut self, path: &str, recursive: bool, force: bool) -> IndexResult<RemovedPath> {
        const OP: &str = "remove_path";
        let ids = self.resolve(OP, path)?;
        let Some((&removed, parent_ids)) = ids.split_last() else {
            return Err(IndexError::validation(OP, "the root cannot be removed"));
        };
        let parent_ids = parent_ids.to_vec();
        self.ensure_layer_mutable(OP, removed)?;
        self.ensure_layer_mutable(OP, parent_ids.last().copied().unwrap_or_else(Uuid::nil))?;

        let node = self
            .node(&ids)
            .ok_or_else(|| IndexError::not_found(OP, "path", path))?
            .clone();
        let mut rel = Vec::new();
        node.descendants(&mut Vec::new(), &mut rel);

        let mut out = RemovedPath {
            removed_labels: vec![context_label(&ids)],
            renames: Vec::new(),
        };
        if recursive {
            if !node.children.is_empty() && !force {
                return Err(IndexError::NotEmpty {
                    operation: OP,
                    path: normalize_path(path)?,
                });
            }
            out.removed_labels.extend(
                rel.iter()
                    .map(|r| context_label(&[ids.as_slice(), r.as_slice()].concat())),
            );
        } else {
            let parent = self
                .node(&parent_ids)
                .ok_or_else(|| IndexError::not_found(OP, "path", path))?;
            for child in &node.children {
                if parent.child(child.layer).is_some() && child.layer != removed {
                    return Err(IndexError::validation(
                        OP,
                        format!("lifting '{}' would collide with an existing node", self.path_of(&[child.layer])),
                    ));
                }
            }
            out.renames = rel
                .iter()
                .map(|r| {
                    (
                        context_label(&[ids.as_slice(), r.as_slice()].concat()),
                        context_label(&[parent_ids.as_slice(), r.as_slice()].concat()),
                    )
                })
                .collect();
        }

        let parent = self
            .node_mut(&parent_ids)
            .ok_or_else(|| IndexError::not_found(OP, "path", path))?;
        let taken = parent
            .take_child(removed)
            .ok_or_else(|| IndexError::not_found(OP, "path", path))?;
        if !recursive {
            parent.children.extend(taken.children);
        }
        self.bump();
        tracing::debug!(path, recursive, "removed tree path");
        Ok(out)
    }

    pub fn get_node(&self, path: &str) -> IndexResult<NodeView> {
        const OP: &str = "get_node";
        let ids = self.resolve(OP, path)?;
        let node = self
            .node(&ids)
            .ok_or_else(|| IndexError::not_found(OP, "path", path))?;
        let layer = self.layer_by_id(OP, node.layer)?;
        let mut children: Vec<String> = node
            .children
            .iter()
            .filter_map(|c| self.layers.get(&c.layer))
            .map(|l| self.effective_name(l))
            .collect();
        children.sort();
        Ok(NodeView {
            path: self.path_of(&ids),
            label: context_label(&ids),
            layer: self.view(layer),
            children,
        })
    }

    /// Every path in the tree, root first, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut rel = Vec::new();
        self.root.descendants(&mut Vec::new(), &mut rel);
        let mut out: Vec<String> = rel.iter().map(|ids| self.path_of(ids)).collect();
        out.sort();
        out.insert(0, ROOT_PATH.to_string());
        out
    }

    /// Nested structural view for display and transport.
    pub fn to_json(&self) -> serde_json::Value {
        self.node_json(&self.root)
    }

    fn node_json(&self, node: &TreeNode) -> serde_json::Value {
        let children: Vec<serde_json::Value> =
            node.children.iter().map(|c| self.node_json(c)).collect();
        match self.layers.get(&node.layer) {
            Some(layer) => {
                let view = self.view(layer);
                serde_json::json!({
                    "id": view.id,
                    "type": view.kind,
                    "name": view.name,
                    "label": view.label,
                    "description": view.description,
                    "color": view.color,
                    "locked": view.locked,
                    "children": children,
                })
            }
            None => serde_json::json!({ "id": node.layer, "children": children }),
        }
    }

    // ============ Layers ============

    pub fn create_layer(&mut self, name: &str, kind: LayerKind) -> IndexResult<LayerView> {
        const OP: &str = "create_layer";
        let name = normalize_layer_name(name)?;
        if self.name_taken(&name) {
            return Err(IndexError::validation(
                OP,
                format!("layer '{}' already exists", name),
            ));
        }
        if let LayerKind::Workspace { workspace_id } = &kind {
            if !self.workspaces.contains_key(workspace_id) {
                return Err(IndexError::not_found(OP, "workspace", workspace_id.clone()));
            }
            if self
                .layers
                .values()
                .any(|l| l.workspace_id() == Some(workspace_id.as_str()))
            {
                return Err(IndexError::validation(
                    OP,
                    format!("workspace '{}' already has a layer", workspace_id),
                ));
            }
        }
        let layer = Layer::new(&name, kind);
        let view = self.view(&layer);
        if layer.workspace_id().is_none() {
            self.names.insert(name, layer.id);
        }
        self.layers.insert(layer.id, layer);
        self.bump();
        Ok(view)
    }

    pub fn get_layer(&self, name: &str) -> IndexResult<LayerView> {
        Ok(self.view(self.layer("get_layer", name)?))
    }

    /// All layers except the root, sorted by name.
    pub fn list_layers(&self) -> Vec<LayerView> {
        let mut out: Vec<LayerView> = self
            .layers
            .values()
            .filter(|l| !l.is_root() && l.state != LayerState::Deleted)
            .map(|l| self.view(l))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn rename_layer(&mut self, name: &str, new_name: &str) -> IndexResult<LayerView> {
        const OP: &str = "rename_layer";
        let new_name = normalize_layer_name(new_name)?;
        let layer = self.layer(OP, name)?;
        if layer.is_root() {
            return Err(IndexError::validation(OP, "the root layer cannot be renamed"));
        }
        if layer.workspace_id().is_some() {
            return Err(IndexError::validation(
                OP,
                format!("layer '{}' takes its name from its workspace", name),
            ));
        }
        self.ensure_layer_mutable(OP, layer.id)?;
        if new_name != name && self.name_taken(&new_name) {
            return Err(IndexError::validation(
                OP,
                format!("layer '{}' already exists", new_name),
            ));
        }
        let id = layer.id;
        self.names.remove(name);
        self.names.insert(new_name.clone(), id);
        let layer = self.layer_mut(OP, &new_name)?;
        layer.name = new_name;
        layer.touch();
        let view = LayerView::resolve(layer, None);
        self.bump();
        Ok(view)
    }

    pub fn update_layer(&mut self, name: &str, update: &LayerUpdate) -> IndexResult<LayerView> {
        const OP: &str = "update_layer";
        let id = self.layer(OP, name)?.id;
        self.ensure_layer_mutable(OP, id)?;
        let layer = self.layer_mut(OP, name)?;
        if let Some(label) = &update.label {
            layer.label = label.clone();
        }
        if let Some(description) = &update.description {
            layer.description = description.clone();
        }
        if let Some(color) = &update.color {
            layer.color = Some(color.clone());
        }
        layer.touch();
        self.bump();
        self.get_layer(name)
    }

    pub fn lock_layer(&mut self, name: &str) -> IndexResult<LayerView> {
        self.set_lock("lock_layer", name, true)
    }

    pub fn unlock_layer(&mut self, name: &str) -> IndexResult<LayerView> {
        self.set_lock("unlock_layer", name, false)
    }

    fn set_lock(&mut self, operation: &'static str, name: &str, locked: bool) -> IndexResult<LayerView> {
        let layer = self.layer_mut(operation, name)?;
        if layer.is_root() {
            return Err(IndexError::validation(operation, "the root layer cannot be locked"));
        }
        layer.state = match (layer.state, locked) {
            (LayerState::Deleted, _) => {
                return Err(IndexError::not_found(operation, "layer", name));
            }
            (_, true) => LayerState::Locked,
            (LayerState::Locked, false) => LayerState::Active,
            (state, false) => state,
        };
        layer.touch();
        self.bump();
        self.get_layer(name)
    }

    pub fn set_acl(&mut self, name: &str, principal: &str, permission: &str) -> IndexResult<LayerView> {
        const OP: &str = "set_acl";
        let id = self.layer(OP, name)?.id;
        self.ensure_layer_mutable(OP, id)?;
        let layer = self.layer_mut(OP, name)?;
        layer.acl.insert(principal.to_string(), permission.to_string());
        layer.touch();
        self.bump();
        self.get_layer(name)
    }

    pub fn remove_acl(&mut self, name: &str, principal: &str) -> IndexResult<LayerView> {
        const OP: &str = "remove_acl";
        let id = self.layer(OP, name)?.id;
        self.ensure_layer_mutable(OP, id)?;
        let layer = self.layer_mut(OP, name)?;
        if layer.acl.remove(principal).is_none() {
            return Err(IndexError::not_found(OP, "acl entry", principal));
        }
        layer.touch();
        self.bump();
        self.get_layer(name)
    }

    /// Delete a layer that no tree node references any more.
    pub fn delete_layer(&mut self, name: &str) -> IndexResult<()> {
        const OP: &str = "delete_layer";
        let layer = self.layer(OP, name)?;
        if layer.is_root() {
            return Err(IndexError::validation(OP, "the root layer cannot be deleted"));
        }
        let id = layer.id;
        self.ensure_layer_mutable(OP, id)?;
        if self.root.references(id) {
            return Err(IndexError::validation(
                OP,
                format!("layer '{}' is still used in the tree", name),
            ));
        }
        // Tombstoned so labels built from its id stay interpretable.
        if let Some(layer) = self.layers.get_mut(&id) {
            layer.state = LayerState::Deleted;
            layer.touch();
        }
        self.names.remove(name);
        self.bump();
        Ok(())
    }

    // ============ Workspaces ============

    /// Add or replace a workspace. Layers bound to it pick up the new
    /// attributes on their next query.
    pub fn upsert_workspace(&mut self, info: WorkspaceInfo) -> IndexResult<()> {
        const OP: &str = "upsert_workspace";
        let name = normalize_layer_name(&info.name)?;
        let clash = self.names.contains_key(&name)
            || self
                .workspaces
                .values()
                .any(|w| w.id != info.id && w.name == name);
        if clash {
            return Err(IndexError::validation(
                OP,
                format!("name '{}' is already used by another layer", name),
            ));
        }
        self.workspaces.insert(info.id.clone(), WorkspaceInfo { name, ..info });
        self.bump();
        Ok(())
    }

    pub fn remove_workspace(&mut self, id: &str) -> IndexResult<WorkspaceInfo> {
        let removed = self
            .workspaces
            .remove(id)
            .ok_or_else(|| IndexError::not_found("remove_workspace", "workspace", id))?;
        self.bump();
        Ok(removed)
    }

    pub fn workspace(&self, id: &str) -> Option<&WorkspaceInfo> {
        self.workspaces.get(id)
    }

    // ============ Persistence ============

    pub fn snapshot(&self) -> TreeSnapshot {
        let mut layers: Vec<Layer> = self
            .layers
            .values()
            .filter(|l| !l.is_root())
            .cloned()
            .collect();
        layers.sort_by_key(|l| l.created_at);
        let mut workspaces: Vec<WorkspaceInfo> = self.workspaces.values().cloned().collect();
        workspaces.sort_by(|a, b| a.id.cmp(&b.id));
        TreeSnapshot {
            version: self.version,
            root: self.root.clone(),
            layers,
            workspaces,
        }
    }

    pub fn restore(snapshot: TreeSnapshot) -> IndexResult<Self> {
        const OP: &str = "restore_tree";
        let mut tree = Self::new();
        for ws in snapshot.workspaces {
            tree.workspaces.insert(ws.id.clone(), ws);
        }
        for layer in snapshot.layers {
            if layer.is_root() {
                continue;
            }
            if layer.workspace_id().is_none() && layer.state != LayerState::Deleted {
                tree.names.insert(layer.name.clone(), layer.id);
            }
            tree.layers.insert(layer.id, layer);
        }
        if !snapshot.root.layer.is_nil() {
            return Err(IndexError::validation(OP, "tree root must be the root layer"));
        }
        fn check(tree: &ContextTree, node: &TreeNode) -> IndexResult<()> {
            for child in &node.children {
                if !tree.layers.contains_key(&child.layer) {
                    return Err(IndexError::not_found(OP, "layer", child.layer.to_string()));
                }
                check(tree, child)?;
            }
            Ok(())
        }
        check(&tree, &snapshot.root)?;
        tree.root = snapshot.root;
        tree.version = snapshot.version;
        Ok(tree)
    }
}
