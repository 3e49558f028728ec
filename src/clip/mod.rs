//! Rectangular clipping.
//!
//! Every [`RectMask`] clips the targets it owns to the intersection of its
//! own rect and the rects of its active ancestor masks. Mask chains and
//! ownership both stop at independent draw-order boundaries: a nested
//! canvas with `override_sorting` set never inherits clipping from masks
//! above it.

pub mod rect_mask;
pub mod registry;

use std::cell::RefCell;
use std::rc::Rc;

pub use rect_mask::RectMask;
pub use registry::ClipperRegistry;

use crate::element::{ElementId, RebuildRequests};
use crate::geometry::Rect;
use crate::tree::{NodeId, Shared, Tree};

/// Something that can be clipped by a rect mask.
pub trait Clippable {
    /// Identity used by the owning mask's target set.
    fn target_id(&self) -> ElementId;

    fn node(&self) -> NodeId;

    /// Targets that are not maskable never get an owner.
    fn is_maskable(&self) -> bool {
        true
    }

    /// Apply a clip rect in root canvas space. `valid == false` turns rect
    /// clipping off.
    fn set_clip_rect(&mut self, rect: Rect, valid: bool);

    fn set_clip_softness(&mut self, _softness: [f32; 2]) {}

    /// Node of the rect mask currently clipping this target.
    fn clip_owner(&self) -> Option<NodeId>;

    fn set_clip_owner(&mut self, owner: Option<NodeId>);
}

/// A clip target that can also be culled when it lies outside its clip rect.
pub trait Cullable: Clippable {
    /// Whether the bounds changed since the last cull.
    fn has_moved(&self, tree: &Tree) -> bool;

    /// Cull against a compound clip rect.
    fn cull(&mut self, clip_rect: Rect, valid: bool, tree: &Tree, requests: &mut RebuildRequests);

    fn update_cull(&mut self, cull: bool, requests: &mut RebuildRequests);
}

pub type SharedClippable = Rc<RefCell<dyn Clippable>>;
pub type SharedCullable = Rc<RefCell<dyn Cullable>>;

/// A clip target as tracked by a mask: plain targets only receive clip
/// rects, cullable ones are culled as well.
#[derive(Clone)]
pub enum ClipTarget {
    Plain(SharedClippable),
    Cullable(SharedCullable),
}

impl ClipTarget {
    pub fn id(&self) -> ElementId {
        match self {
            ClipTarget::Plain(t) => t.borrow().target_id(),
            ClipTarget::Cullable(t) => t.borrow().target_id(),
        }
    }

    pub fn node(&self) -> NodeId {
        match self {
            ClipTarget::Plain(t) => t.borrow().node(),
            ClipTarget::Cullable(t) => t.borrow().node(),
        }
    }

    pub fn is_maskable(&self) -> bool {
        match self {
            ClipTarget::Plain(t) => t.borrow().is_maskable(),
            ClipTarget::Cullable(t) => t.borrow().is_maskable(),
        }
    }

    pub fn owner(&self) -> Option<NodeId> {
        match self {
            ClipTarget::Plain(t) => t.borrow().clip_owner(),
            ClipTarget::Cullable(t) => t.borrow().clip_owner(),
        }
    }

    pub fn set_owner(&self, owner: Option<NodeId>) {
        match self {
            ClipTarget::Plain(t) => t.borrow_mut().set_clip_owner(owner),
            ClipTarget::Cullable(t) => t.borrow_mut().set_clip_owner(owner),
        }
    }

    pub fn set_clip_rect(&self, rect: Rect, valid: bool) {
        match self {
            ClipTarget::Plain(t) => t.borrow_mut().set_clip_rect(rect, valid),
            ClipTarget::Cullable(t) => t.borrow_mut().set_clip_rect(rect, valid),
        }
    }

    /// Turn clipping off and make the target visible again.
    pub fn reset(&self, requests: &mut RebuildRequests) {
        self.set_clip_rect(Rect::ZERO, false);
        if let ClipTarget::Cullable(t) = self {
            t.borrow_mut().update_cull(false, requests);
        }
    }
}

/// The rect mask on `node`, if it is enabled and the node is active.
pub fn active_rect_mask(tree: &Tree, node: NodeId) -> Option<Shared<RectMask>> {
    if !tree.is_active_in_hierarchy(node) {
        return None;
    }
    let mask = tree.capabilities(node)?.rect_mask.clone()?;
    // A mask that is borrowed is the one running its own clipping pass
    let enabled = mask.try_borrow().map_or(true, |m| m.is_enabled());
    enabled.then_some(mask)
}

/// Nodes of the masks clipping content of the mask on `node`: the node
/// itself, then every active ancestor mask not cut off by a draw-order
/// boundary. Nearest first.
pub fn rect_masks_for_clip(tree: &Tree, node: NodeId) -> Vec<NodeId> {
    let mut chain = Vec::new();
    if active_rect_mask(tree, node).is_some() {
        chain.push(node);
    }
    let mut crossed_boundary = tree.is_sorting_boundary(node);
    for ancestor in tree.ancestors(node) {
        if crossed_boundary {
            break;
        }
        if active_rect_mask(tree, ancestor).is_some() {
            chain.push(ancestor);
        }
        // A mask on the boundary node itself still counts
        crossed_boundary = tree.is_sorting_boundary(ancestor);
    }
    chain
}

/// Node of the rect mask that should clip a target on `node`.
///
/// The nearest active mask strictly above the node, or none when a
/// draw-order boundary lies between the two.
pub fn rect_mask_for_clippable(tree: &Tree, node: NodeId) -> Option<NodeId> {
    let mut crossed_boundary = tree.is_sorting_boundary(node);
    for ancestor in tree.ancestors(node) {
        if active_rect_mask(tree, ancestor).is_some() {
            return (!crossed_boundary).then_some(ancestor);
        }
        crossed_boundary |= tree.is_sorting_boundary(ancestor);
    }
    None
}

/// Intersect mask rects into one compound clip rect.
///
/// Returns `None` (invalid) when there are no rects or when the
/// intersection has no area.
pub fn find_cull_and_clip_rect(rects: impl IntoIterator<Item = Rect>) -> Option<Rect> {
    let mut rects = rects.into_iter();
    let first = rects.next()?;
    let (mut x_min, mut y_min) = (first.x_min(), first.y_min());
    let (mut x_max, mut y_max) = (first.x_max(), first.y_max());
    for rect in rects {
        x_min = x_min.max(rect.x_min());
        y_min = y_min.max(rect.y_min());
        x_max = x_max.min(rect.x_max());
        y_max = y_max.min(rect.y_max());
    }
    let compound = Rect::from_edges(x_min, y_min, x_max, y_max);
    (!compound.is_empty()).then_some(compound)
}

/// Every clip target attached to `node`: its graphic first, then any other
/// clippables.
pub fn clip_targets(tree: &Tree, node: NodeId) -> Vec<ClipTarget> {
    let Some(caps) = tree.capabilities(node) else {
        return Vec::new();
    };
    let mut targets = Vec::with_capacity(caps.clippables.len() + 1);
    if let Some(graphic) = &caps.graphic {
        let graphic: SharedCullable = graphic.clone();
        targets.push(ClipTarget::Cullable(graphic));
    }
    targets.extend(caps.clippables.iter().cloned().map(ClipTarget::Plain));
    targets
}

/// Re-resolve which mask owns `target`, moving it between masks as needed.
pub fn update_clip_parent(tree: &Tree, target: &ClipTarget, requests: &mut RebuildRequests) {
    let node = target.node();
    let new_owner = if target.is_maskable() && tree.is_active_in_hierarchy(node) {
        rect_mask_for_clippable(tree, node)
    } else {
        None
    };

    if let Some(old_owner) = target.owner() {
        if Some(old_owner) != new_owner {
            release_from_owner(tree, old_owner, target, requests);
        }
    }
    if let Some(owner) = new_owner {
        if let Some(mask) = active_rect_mask(tree, owner) {
            mask.borrow_mut().add_clippable(target.clone());
        }
    }
    target.set_owner(new_owner);
}

/// Remove `target` from its mask and leave it unclipped.
pub fn detach_clip_target(tree: &Tree, target: &ClipTarget, requests: &mut RebuildRequests) {
    if let Some(owner) = target.owner() {
        release_from_owner(tree, owner, target, requests);
    }
    target.set_owner(None);
}

fn release_from_owner(
    tree: &Tree,
    owner: NodeId,
    target: &ClipTarget,
    requests: &mut RebuildRequests,
) {
    let mask = tree
        .capabilities(owner)
        .and_then(|caps| caps.rect_mask.clone());
    match mask {
        Some(mask) => mask.borrow_mut().remove_clippable(target),
        None => target.set_clip_rect(Rect::ZERO, false),
    }
    target.reset(requests);
}
