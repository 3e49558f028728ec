//! Arena-based hierarchy storage.
//!
//! The Tree stores every UI node using a sparse-set architecture with
//! generational indices. Components never own nodes; they hold `NodeId`s and
//! check liveness through the tree, so a removed node is detected instead of
//! dereferenced.
//!
//! ## Key Features
//!
//! - **Generational Indices**: NodeId contains index + generation to prevent
//!   ABA problems (detecting stale references to reallocated slots).
//!
//! - **Dense Storage**: Nodes stored contiguously for cache-friendly iteration.
//!
//! - **Capability Table**: Each node carries typed slots for the layout,
//!   clipping, masking and material capabilities attached to it, so passes
//!   never scan for implementors at runtime.
//!
//! - **Resize Tracking**: Rect changes are recorded so the scheduler can
//!   dirty the geometry of resized graphics after the layout stage.

use std::cell::RefCell;
use std::rc::Rc;

use crate::clip::{RectMask, SharedClippable};
use crate::geometry::Rect;
use crate::graphic::MaskableGraphic;
use crate::layout::{SharedLayoutController, SharedLayoutElement};
use crate::stencil::{SharedMaskable, SharedMaterialModifier, StencilMask};

/// Shared, interior-mutable handle used for every component stored in the
/// capability table.
pub type Shared<T> = Rc<RefCell<T>>;

/// Unique identifier for a node in the tree.
///
/// Uses a generational index design:
/// - `index`: Position in the sparse array (reusable after removal)
/// - `generation`: Version counter that increments when a slot is reused
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// An ID that never refers to a live node.
    pub fn placeholder() -> Self {
        Self {
            index: u32::MAX,
            generation: u32::MAX,
        }
    }

    /// Combines generation (high bits) with index (low bits).
    pub fn as_u64(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }
}

/// How the root canvas presents its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    ScreenSpaceOverlay,
    ScreenSpaceCamera,
    WorldSpace,
}

impl RenderMode {
    pub fn is_screen_space(self) -> bool {
        matches!(
            self,
            RenderMode::ScreenSpaceOverlay | RenderMode::ScreenSpaceCamera
        )
    }
}

/// Canvas context attached to a node.
///
/// A nested canvas with `override_sorting` set is an independent draw-order
/// boundary: mask chains and stencil depth do not propagate across it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanvasSettings {
    pub render_mode: RenderMode,
    pub override_sorting: bool,
}

/// Typed capability slots of a node, populated when components are attached.
#[derive(Default)]
pub struct Capabilities {
    pub layout_elements: Vec<SharedLayoutElement>,
    pub layout_controllers: Vec<SharedLayoutController>,
    pub rect_mask: Option<Shared<RectMask>>,
    pub stencil_mask: Option<Shared<StencilMask>>,
    pub graphic: Option<Shared<MaskableGraphic>>,
    /// Clip targets other than the node's graphic.
    pub clippables: Vec<SharedClippable>,
    /// Stencil-aware components other than the node's graphic.
    pub maskables: Vec<SharedMaskable>,
    pub material_modifiers: Vec<SharedMaterialModifier>,
}

struct SparseEntry {
    dense_index: usize,
    generation: u32,
}

struct Node {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    active_self: bool,
    /// Rect in root canvas space
    rect: Rect,
    canvas: Option<CanvasSettings>,
    capabilities: Capabilities,
    /// Whether the node is already queued in `resized`
    resize_pending: bool,
    sparse_index: u32,
}

/// Central hierarchy storage using an arena-based sparse-set architecture.
pub struct Tree {
    dense: Vec<Node>,
    sparse: Vec<Option<SparseEntry>>,
    free_indices: Vec<u32>,
    /// Nodes whose rect changed since the last `take_resized`
    resized: Vec<NodeId>,
}

impl Tree {
    pub fn new() -> Self {
        Self {
            dense: Vec::new(),
            sparse: Vec::new(),
            free_indices: Vec::new(),
            resized: Vec::new(),
        }
    }

    /// Create a detached, active node and return its ID.
    pub fn create(&mut self, name: impl Into<String>) -> NodeId {
        let (sparse_index, generation) = if let Some(idx) = self.free_indices.pop() {
            let old_gen = self.sparse[idx as usize]
                .as_ref()
                .map(|e| e.generation)
                .unwrap_or(0);
            (idx, old_gen.wrapping_add(1))
        } else {
            let idx = self.sparse.len() as u32;
            self.sparse.push(None);
            (idx, 0)
        };

        let dense_index = self.dense.len();
        self.dense.push(Node {
            name: name.into(),
            parent: None,
            children: Vec::new(),
            active_self: true,
            rect: Rect::ZERO,
            canvas: None,
            capabilities: Capabilities::default(),
            resize_pending: false,
            sparse_index,
        });
        self.sparse[sparse_index as usize] = Some(SparseEntry {
            dense_index,
            generation,
        });

        NodeId::new(sparse_index, generation)
    }

    /// Create a node as the last child of `parent`.
    pub fn create_child(&mut self, parent: NodeId, name: impl Into<String>) -> NodeId {
        let id = self.create(name);
        self.set_parent(id, Some(parent));
        id
    }

    /// Remove a node and its whole subtree.
    ///
    /// Returns the removed IDs in pre-order. Uses swap-remove so dense
    /// storage never has holes.
    pub fn remove(&mut self, id: NodeId) -> Vec<NodeId> {
        if !self.contains(id) {
            return Vec::new();
        }
        self.set_parent(id, None);

        let removed = self.subtree(id);
        for &node in &removed {
            self.remove_slot(node);
        }
        removed
    }

    fn remove_slot(&mut self, id: NodeId) {
        let Some(dense_index) = self.dense_index(id) else {
            return;
        };
        let last_dense_index = self.dense.len() - 1;

        // Dropped after the indices are fixed up; capability drops must not
        // observe a half-updated arena.
        let removed_node = self.dense.swap_remove(dense_index);

        if dense_index != last_dense_index {
            let moved_sparse_idx = self.dense[dense_index].sparse_index;
            if let Some(ref mut entry) = self.sparse[moved_sparse_idx as usize] {
                entry.dense_index = dense_index;
            }
        }

        // Keep the generation so the next allocation of this slot bumps it
        self.sparse[id.index as usize] = Some(SparseEntry {
            dense_index: usize::MAX,
            generation: id.generation,
        });
        self.free_indices.push(id.index);
        self.resized.retain(|&n| n != id);

        drop(removed_node);
    }

    fn dense_index(&self, id: NodeId) -> Option<usize> {
        self.sparse
            .get(id.index as usize)
            .and_then(|e| e.as_ref())
            .filter(|e| e.generation == id.generation && e.dense_index != usize::MAX)
            .map(|e| e.dense_index)
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.dense_index(id).map(|idx| &self.dense[idx])
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.dense_index(id).map(move |idx| &mut self.dense[idx])
    }

    /// Liveness check: false once the node (or a slot reuse) removed it.
    pub fn contains(&self, id: NodeId) -> bool {
        self.dense_index(id).is_some()
    }

    pub fn name(&self, id: NodeId) -> &str {
        self.node(id).map(|n| n.name.as_str()).unwrap_or("<removed>")
    }

    /// Re-parent a node. `None` detaches it.
    ///
    /// Refuses (and returns false) when the new parent is the node itself or
    /// one of its descendants.
    pub fn set_parent(&mut self, child: NodeId, parent: Option<NodeId>) -> bool {
        if !self.contains(child) {
            return false;
        }
        if let Some(parent) = parent {
            if !self.contains(parent) || self.is_ancestor_or_self(child, parent) {
                log::error!(
                    "Refusing to parent '{}' under '{}': would create a cycle",
                    self.name(child),
                    self.name(parent)
                );
                return false;
            }
        }

        if let Some(old_parent) = self.parent(child) {
            if let Some(node) = self.node_mut(old_parent) {
                node.children.retain(|&c| c != child);
            }
        }
        if let Some(node) = self.node_mut(child) {
            node.parent = parent;
        }
        if let Some(parent) = parent {
            if let Some(node) = self.node_mut(parent) {
                node.children.push(child);
            }
        }
        true
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Ancestors of `id`, nearest first, excluding `id` itself.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: self.parent(id),
        }
    }

    /// Number of ancestors between the node and the root.
    pub fn depth(&self, id: NodeId) -> usize {
        self.ancestors(id).count()
    }

    /// Whether `ancestor` is `node` or lies on its parent chain.
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        node == ancestor || self.ancestors(node).any(|a| a == ancestor)
    }

    /// The node and all its descendants in pre-order.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !self.contains(current) {
                continue;
            }
            out.push(current);
            stack.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    pub fn set_active(&mut self, id: NodeId, active: bool) {
        if let Some(node) = self.node_mut(id) {
            node.active_self = active;
        }
    }

    pub fn is_active_self(&self, id: NodeId) -> bool {
        self.node(id).is_some_and(|n| n.active_self)
    }

    /// Active only if the node and every ancestor are active.
    pub fn is_active_in_hierarchy(&self, id: NodeId) -> bool {
        self.is_active_self(id) && self.ancestors(id).all(|a| self.is_active_self(a))
    }

    pub fn rect(&self, id: NodeId) -> Rect {
        self.node(id).map(|n| n.rect).unwrap_or_default()
    }

    /// Set the node's rect in root canvas space, recording it as resized
    /// when the value changed.
    pub fn set_rect(&mut self, id: NodeId, rect: Rect) {
        let Some(node) = self.node_mut(id) else {
            return;
        };
        if node.rect == rect {
            return;
        }
        node.rect = rect;
        let already_pending = std::mem::replace(&mut node.resize_pending, true);
        if !already_pending {
            self.resized.push(id);
        }
    }

    /// Drain the nodes resized since the last call.
    pub fn take_resized(&mut self) -> Vec<NodeId> {
        let resized = std::mem::take(&mut self.resized);
        for &id in &resized {
            if let Some(node) = self.node_mut(id) {
                node.resize_pending = false;
            }
        }
        resized
    }

    pub fn canvas(&self, id: NodeId) -> Option<CanvasSettings> {
        self.node(id).and_then(|n| n.canvas)
    }

    pub fn set_canvas(&mut self, id: NodeId, canvas: Option<CanvasSettings>) {
        if let Some(node) = self.node_mut(id) {
            node.canvas = canvas;
        }
    }

    /// Nearest active canvas on the node or its ancestors.
    pub fn nearest_canvas(&self, id: NodeId) -> Option<NodeId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|&n| self.canvas(n).is_some() && self.is_active_in_hierarchy(n))
    }

    /// Root-most active canvas containing the node.
    pub fn root_canvas(&self, id: NodeId) -> Option<NodeId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .filter(|&n| self.canvas(n).is_some() && self.is_active_in_hierarchy(n))
            .last()
    }

    /// Whether the node is an independent draw-order boundary.
    pub fn is_sorting_boundary(&self, id: NodeId) -> bool {
        self.canvas(id).is_some_and(|c| c.override_sorting) && self.is_active_in_hierarchy(id)
    }

    pub fn capabilities(&self, id: NodeId) -> Option<&Capabilities> {
        self.node(id).map(|n| &n.capabilities)
    }

    pub fn capabilities_mut(&mut self, id: NodeId) -> Option<&mut Capabilities> {
        self.node_mut(id).map(|n| &mut n.capabilities)
    }

    pub fn node_count(&self) -> usize {
        self.dense.len()
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a node's ancestors, nearest first.
pub struct Ancestors<'a> {
    tree: &'a Tree,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.next?;
        self.next = self.tree.parent(current);
        Some(current)
    }
}
