//! Layout rebuild requests and the layout passes they run.
//!
//! Marking a node as needing layout walks up to its layout root, the
//! outermost ancestor still governed by an enabled layout group, and queues
//! a pooled [`LayoutRebuilder`] for that root. Queued rebuilders are keyed by
//! their root, so any number of requests under one root collapse into a
//! single layout pass per frame.

use std::cell::RefCell;
use std::rc::Weak;

use crate::element::{CanvasElement, CanvasUpdate, ElementKey, UpdateContext};
use crate::error::RebuildError;
use crate::geometry::Axis;
use crate::layout::{
    enabled_layout_controllers, enabled_layout_elements, has_enabled_layout_group,
    has_layout_group, ControllerRole,
};
use crate::pool::{Pool, PoolHandle};
use crate::tree::{NodeId, Shared, Tree};

/// Queued request to run a layout pass over one layout root.
pub struct LayoutRebuilder {
    target: Option<NodeId>,
    this: Weak<RefCell<LayoutRebuilder>>,
    pool: PoolHandle<LayoutRebuilder>,
}

impl LayoutRebuilder {
    fn new(this: Weak<RefCell<LayoutRebuilder>>, pool: PoolHandle<LayoutRebuilder>) -> Self {
        Self {
            target: None,
            this,
            pool,
        }
    }

    fn initialize(&mut self, target: NodeId) {
        self.target = Some(target);
    }

    pub fn target(&self) -> Option<NodeId> {
        self.target
    }

    fn clear(&mut self) {
        self.target = None;
    }

    fn recycle(&mut self) {
        self.clear();
        if let Some(this) = self.this.upgrade() {
            self.pool.release(this);
        }
    }
}

impl CanvasElement for LayoutRebuilder {
    fn key(&self) -> ElementKey {
        ElementKey::LayoutRoot(self.target.unwrap_or_else(NodeId::placeholder))
    }

    fn node(&self) -> Option<NodeId> {
        self.target
    }

    fn rebuild(
        &mut self,
        stage: CanvasUpdate,
        ctx: &mut UpdateContext<'_>,
    ) -> Result<(), RebuildError> {
        if stage != CanvasUpdate::Layout {
            return Ok(());
        }
        let target = self
            .target
            .ok_or_else(|| RebuildError::Failed("layout rebuilder has no target".into()))?;
        if !ctx.tree.contains(target) {
            return Err(RebuildError::MissingNode(target));
        }
        rebuild_layout(ctx.tree, target)
    }

    fn layout_complete(&mut self) {
        self.recycle();
    }

    fn is_destroyed(&self, tree: &Tree) -> bool {
        self.target.map_or(true, |target| !tree.contains(target))
    }
}

/// Pool of layout rebuilders owned by the scheduler.
#[derive(Default)]
pub struct LayoutRebuilderPool {
    pool: Pool<LayoutRebuilder>,
}

impl LayoutRebuilderPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a rebuilder targeting `root`.
    pub(crate) fn acquire(&self, root: NodeId) -> Shared<LayoutRebuilder> {
        let rebuilder: Shared<LayoutRebuilder> = self.pool.get(LayoutRebuilder::new);
        rebuilder.borrow_mut().initialize(root);
        rebuilder
    }

    /// Take back a rebuilder the scheduler did not queue.
    pub(crate) fn discard(&self, rebuilder: Shared<LayoutRebuilder>) {
        rebuilder.borrow_mut().clear();
        self.pool.release(rebuilder);
    }

    /// Rebuilders currently handed out to the scheduler.
    pub fn active_count(&self) -> usize {
        self.pool.count_active()
    }

    pub fn free_count(&self) -> usize {
        self.pool.count_free()
    }
}

/// Find the node a layout request for `node` has to be scheduled on.
///
/// Walks up while each ancestor carries an enabled layout group; the last
/// one found is the root. Without such an ancestor the node itself is the
/// root, but only when it has an enabled layout controller of its own.
pub fn find_layout_root(tree: &Tree, node: NodeId) -> Option<NodeId> {
    if !tree.contains(node) {
        return None;
    }

    let mut root = node;
    for ancestor in tree.ancestors(node) {
        if !has_enabled_layout_group(tree, ancestor) {
            break;
        }
        root = ancestor;
    }

    if root == node && enabled_layout_controllers(tree, node).is_empty() {
        return None;
    }
    Some(root)
}

/// Run the four layout sub-passes over the subtree at `root`.
pub fn rebuild_layout(tree: &mut Tree, root: NodeId) -> Result<(), RebuildError> {
    for axis in Axis::ALL {
        perform_layout_calculation(tree, root, axis)?;
        perform_layout_control(tree, root, axis)?;
    }
    Ok(())
}

/// Lay out a subtree right away instead of waiting for the next update.
pub fn force_rebuild_layout_immediate(tree: &mut Tree, node: NodeId) {
    if let Err(err) = rebuild_layout(tree, node) {
        log::error!(
            "Immediate layout of '{}' failed: {}",
            tree.name(node),
            err
        );
    }
}

/// Measure pass: children before parents.
///
/// Subtrees rooted at a node with neither layout elements nor a layout group
/// are skipped; nested layout roots under them are scheduled on their own.
fn perform_layout_calculation(
    tree: &Tree,
    node: NodeId,
    axis: Axis,
) -> Result<(), RebuildError> {
    if !tree.contains(node) {
        return Ok(());
    }
    let elements = enabled_layout_elements(tree, node);
    if elements.is_empty() && !has_layout_group(tree, node) {
        return Ok(());
    }

    for &child in tree.children(node) {
        perform_layout_calculation(tree, child, axis)?;
    }
    for element in elements {
        element.borrow_mut().calculate_layout_input(axis, node, tree)?;
    }
    Ok(())
}

/// Arrange pass: parents before children, self-sizing controllers before
/// group controllers on the same node.
fn perform_layout_control(tree: &mut Tree, node: NodeId, axis: Axis) -> Result<(), RebuildError> {
    if !tree.contains(node) {
        return Ok(());
    }
    let controllers = enabled_layout_controllers(tree, node);
    if controllers.is_empty() && !has_layout_group(tree, node) {
        return Ok(());
    }

    for role in [ControllerRole::SelfSizing, ControllerRole::Group] {
        for controller in &controllers {
            let mut controller = controller.borrow_mut();
            if controller.role() == role {
                controller.set_layout(axis, node, tree)?;
            }
        }
    }

    let children = tree.children(node).to_vec();
    for child in children {
        perform_layout_control(tree, child, axis)?;
    }
    Ok(())
}
