//! Two-axis layout protocol.
//!
//! Layout runs per axis as a bottom-up measure pass followed by a top-down
//! arrange pass: measure horizontal, arrange horizontal, measure vertical,
//! arrange vertical. Concrete layout groups plug in through the two traits
//! below and are attached to nodes through the tree's capability table.

pub mod fitter;
pub mod rebuilder;
pub mod utility;

use std::cell::RefCell;
use std::rc::Rc;

pub use fitter::{FitMode, LayoutOverrides, SizeFitter};
pub use rebuilder::{
    find_layout_root, force_rebuild_layout_immediate, rebuild_layout, LayoutRebuilder,
    LayoutRebuilderPool,
};

use crate::error::RebuildError;
use crate::geometry::Axis;
use crate::tree::{NodeId, Tree};

/// Something that reports size preferences for its node.
///
/// Negative values mean "no opinion" for that property.
pub trait LayoutElement {
    fn is_enabled(&self) -> bool {
        true
    }

    /// Measure along `axis`. Children have already been measured.
    fn calculate_layout_input(
        &mut self,
        axis: Axis,
        node: NodeId,
        tree: &Tree,
    ) -> Result<(), RebuildError>;

    fn min_size(&self, axis: Axis) -> f32;
    fn preferred_size(&self, axis: Axis) -> f32;
    fn flexible_size(&self, axis: Axis) -> f32;

    /// Higher priorities override lower ones when resolving sizes.
    fn layout_priority(&self) -> i32 {
        0
    }

    /// Layout groups skip nodes carrying an element that ignores layout.
    fn ignore_layout(&self) -> bool {
        false
    }
}

/// Which rects a controller writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerRole {
    /// Sizes or positions its own node.
    SelfSizing,
    /// Sizes or positions the node's children (a layout group).
    Group,
}

/// Something that writes rects during the arrange pass.
pub trait LayoutController {
    fn is_enabled(&self) -> bool {
        true
    }

    fn role(&self) -> ControllerRole;

    /// Arrange along `axis`. The node's ancestors have already been arranged.
    fn set_layout(&mut self, axis: Axis, node: NodeId, tree: &mut Tree)
        -> Result<(), RebuildError>;
}

pub type SharedLayoutElement = Rc<RefCell<dyn LayoutElement>>;
pub type SharedLayoutController = Rc<RefCell<dyn LayoutController>>;

/// Layout elements of a node that currently take part in layout.
pub(crate) fn enabled_layout_elements(tree: &Tree, node: NodeId) -> Vec<SharedLayoutElement> {
    if !tree.is_active_in_hierarchy(node) {
        return Vec::new();
    }
    tree.capabilities(node)
        .map(|caps| {
            caps.layout_elements
                .iter()
                .filter(|e| e.try_borrow().map_or(true, |e| e.is_enabled()))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Layout controllers of a node that currently take part in layout.
pub(crate) fn enabled_layout_controllers(
    tree: &Tree,
    node: NodeId,
) -> Vec<SharedLayoutController> {
    if !tree.is_active_in_hierarchy(node) {
        return Vec::new();
    }
    tree.capabilities(node)
        .map(|caps| {
            caps.layout_controllers
                .iter()
                .filter(|c| c.try_borrow().map_or(true, |c| c.is_enabled()))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// A controller borrowed elsewhere is the one asking and is left out.
fn is_group(controller: &SharedLayoutController) -> bool {
    controller
        .try_borrow()
        .map_or(false, |c| c.role() == ControllerRole::Group)
}

/// Whether a layout group is attached, enabled or not.
pub(crate) fn has_layout_group(tree: &Tree, node: NodeId) -> bool {
    tree.capabilities(node).is_some_and(|caps| {
        caps.layout_controllers
            .iter()
            .any(|c| is_group(c))
    })
}

/// Whether an enabled layout group is attached to an active node.
pub(crate) fn has_enabled_layout_group(tree: &Tree, node: NodeId) -> bool {
    enabled_layout_controllers(tree, node)
        .iter()
        .any(|c| is_group(c))
}
