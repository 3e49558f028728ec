//! Resolution of size preferences declared by several layout elements.
//!
//! When several elements on one node declare a property, the element with
//! the highest `layout_priority` wins; ties resolve to the largest value;
//! negative values are ignored.

use crate::geometry::Axis;
use crate::layout::{enabled_layout_elements, LayoutElement};
use crate::tree::{NodeId, Tree};

/// Resolve one property from `(priority, value)` candidates.
pub fn resolve_property(
    candidates: impl IntoIterator<Item = (i32, f32)>,
    default_value: f32,
) -> f32 {
    let mut resolved = default_value;
    let mut max_priority = i32::MIN;
    let mut found = false;

    for (priority, value) in candidates {
        if found && priority < max_priority {
            continue;
        }
        if value < 0.0 {
            continue;
        }
        if !found || priority > max_priority {
            resolved = value;
            max_priority = priority;
            found = true;
        } else if value > resolved {
            resolved = value;
        }
    }
    resolved
}

/// Resolve a property across the enabled layout elements of a node.
pub fn layout_property(
    tree: &Tree,
    node: NodeId,
    property: impl Fn(&dyn LayoutElement) -> f32,
    default_value: f32,
) -> f32 {
    let elements = enabled_layout_elements(tree, node);
    // An element borrowed elsewhere is the one asking about its own node
    resolve_property(
        elements.iter().filter_map(|e| {
            let e = e.try_borrow().ok()?;
            Some((e.layout_priority(), property(&*e)))
        }),
        default_value,
    )
}

pub fn min_size(tree: &Tree, node: NodeId, axis: Axis) -> f32 {
    layout_property(tree, node, |e| e.min_size(axis), 0.0)
}

/// Preferred size, never smaller than the min size.
pub fn preferred_size(tree: &Tree, node: NodeId, axis: Axis) -> f32 {
    min_size(tree, node, axis).max(layout_property(tree, node, |e| e.preferred_size(axis), 0.0))
}

pub fn flexible_size(tree: &Tree, node: NodeId, axis: Axis) -> f32 {
    layout_property(tree, node, |e| e.flexible_size(axis), 0.0)
}

/// Children a layout group arranges: active ones without an enabled element
/// asking to be ignored.
pub fn layout_children(tree: &Tree, node: NodeId) -> Vec<NodeId> {
    tree.children(node)
        .iter()
        .copied()
        .filter(|&child| tree.is_active_in_hierarchy(child))
        .filter(|&child| {
            !enabled_layout_elements(tree, child)
                .iter()
                .any(|e| e.try_borrow().map_or(false, |e| e.ignore_layout()))
        })
        .collect()
}
