//! Rectangular mask clipping the targets below it.

use indexmap::IndexMap;

use crate::clip::{active_rect_mask, find_cull_and_clip_rect, rect_masks_for_clip, ClipTarget};
use crate::element::{ElementId, RebuildRequests};
use crate::geometry::{Insets, Rect};
use crate::tree::{NodeId, Tree};

/// Clips descendant targets to the node's rect, intersected with every
/// ancestor mask in its chain.
///
/// Lifecycle: disabled until registered with the clipper registry; the mask
/// chain is rebuilt lazily after hierarchy changes; deactivating clears all
/// targets back to "no clip".
pub struct RectMask {
    node: NodeId,
    enabled: bool,
    registered: bool,
    /// Shrinks this mask's contribution to the compound rect
    padding: Insets,
    softness: [f32; 2],
    chain: Vec<NodeId>,
    chain_stale: bool,
    /// Rect applied by the last pass; `None` before the first one
    last_clip_rect: Option<Rect>,
    /// Set when targets were added or removed since the last pass
    force_clip: bool,
    targets: IndexMap<ElementId, ClipTarget>,
}

impl RectMask {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            enabled: true,
            registered: false,
            padding: Insets::default(),
            softness: [0.0; 2],
            chain: Vec::new(),
            chain_stale: true,
            last_clip_rect: None,
            force_clip: false,
            targets: IndexMap::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Flip the enabled flag only. `UiSystem::set_rect_mask_enabled` also
    /// moves the targets.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether the mask is registered and clipping.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn padding(&self) -> Insets {
        self.padding
    }

    pub fn set_padding(&mut self, padding: Insets) {
        self.padding = padding;
    }

    pub fn softness(&self) -> [f32; 2] {
        self.softness
    }

    pub fn set_softness(&mut self, softness: [f32; 2]) {
        self.softness = [softness[0].max(0.0), softness[1].max(0.0)];
    }

    /// This mask's own contribution to a compound rect.
    pub fn clip_rect(&self, tree: &Tree) -> Rect {
        tree.rect(self.node).inset_by(self.padding)
    }

    pub fn last_clip_rect(&self) -> Option<Rect> {
        self.last_clip_rect
    }

    pub fn mark_chain_stale(&mut self) {
        self.chain_stale = true;
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn contains_target(&self, id: ElementId) -> bool {
        self.targets.contains_key(&id)
    }

    /// Start tracking a target. Idempotent.
    pub fn add_clippable(&mut self, target: ClipTarget) {
        self.force_clip = true;
        self.targets.insert(target.id(), target);
    }

    /// Stop tracking a target, leaving it unclipped.
    pub fn remove_clippable(&mut self, target: &ClipTarget) {
        target.set_clip_rect(Rect::ZERO, false);
        self.targets.shift_remove(&target.id());
        self.force_clip = true;
    }

    pub(crate) fn activate(&mut self) {
        self.registered = true;
        self.chain_stale = true;
        self.force_clip = true;
        self.last_clip_rect = None;
    }

    /// Drop every target, resetting each one to "no clip".
    pub(crate) fn deactivate(&mut self, requests: &mut RebuildRequests) {
        for (_, target) in self.targets.drain(..) {
            target.reset(requests);
            target.set_owner(None);
        }
        self.chain.clear();
        self.chain_stale = true;
        self.registered = false;
        self.last_clip_rect = None;
    }

    /// Compute the compound clip rect and push it to the tracked targets.
    ///
    /// Returns false when the mask is outside any canvas and did nothing.
    pub fn perform_clipping(&mut self, tree: &Tree, requests: &mut RebuildRequests) -> bool {
        let Some(root_canvas) = tree.root_canvas(self.node) else {
            return false;
        };

        if self.chain_stale {
            self.chain = rect_masks_for_clip(tree, self.node);
            self.chain_stale = false;
        }

        let rects = self.chain.iter().filter_map(|&node| {
            if node == self.node {
                return Some(self.clip_rect(tree));
            }
            let mask = active_rect_mask(tree, node)?;
            let padding = mask.try_borrow().ok()?.padding();
            Some(tree.rect(node).inset_by(padding))
        });
        let mut clip = find_cull_and_clip_rect(rects);

        let render_mode = tree
            .canvas(root_canvas)
            .map(|c| c.render_mode)
            .unwrap_or_default();
        if render_mode.is_screen_space() {
            let canvas_rect = tree.rect(root_canvas);
            if !clip.is_some_and(|rect| rect.intersects(&canvas_rect)) {
                clip = None;
            }
        }

        let valid = clip.is_some();
        let clip_rect = clip.unwrap_or(Rect::ZERO);

        if self.last_clip_rect != Some(clip_rect) {
            for target in self.targets.values() {
                target.set_clip_rect(clip_rect, valid);
                if let ClipTarget::Cullable(t) = target {
                    t.borrow_mut().cull(clip_rect, valid, tree, requests);
                }
            }
        } else if self.force_clip {
            for target in self.targets.values() {
                target.set_clip_rect(clip_rect, valid);
                if let ClipTarget::Cullable(t) = target {
                    let mut t = t.borrow_mut();
                    if t.has_moved(tree) {
                        t.cull(clip_rect, valid, tree, requests);
                    }
                }
            }
        } else {
            for target in self.targets.values() {
                if let ClipTarget::Cullable(t) = target {
                    let mut t = t.borrow_mut();
                    if t.has_moved(tree) {
                        t.cull(clip_rect, valid, tree, requests);
                    }
                }
            }
        }

        self.last_clip_rect = Some(clip_rect);
        self.force_clip = false;
        self.update_clip_softness();
        true
    }

    fn update_clip_softness(&self) {
        for target in self.targets.values() {
            match target {
                ClipTarget::Plain(t) => t.borrow_mut().set_clip_softness(self.softness),
                ClipTarget::Cullable(t) => t.borrow_mut().set_clip_softness(self.softness),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::clip::{update_clip_parent, Clippable, Cullable};
    use crate::tree::{CanvasSettings, RenderMode, Shared};

    /// Cullable target recording what it was told.
    struct TestTarget {
        id: ElementId,
        node: NodeId,
        owner: Option<NodeId>,
        clip: Option<Rect>,
        softness: [f32; 2],
        culled: bool,
        cull_calls: usize,
        clip_calls: usize,
        last_bounds: Option<Rect>,
    }

    fn test_target(node: NodeId) -> Shared<TestTarget> {
        Rc::new(RefCell::new(TestTarget {
            id: ElementId::next(),
            node,
            owner: None,
            clip: None,
            softness: [0.0; 2],
            culled: false,
            cull_calls: 0,
            clip_calls: 0,
            last_bounds: None,
        }))
    }

    impl Clippable for TestTarget {
        fn target_id(&self) -> ElementId {
            self.id
        }

        fn node(&self) -> NodeId {
            self.node
        }

        fn set_clip_rect(&mut self, rect: Rect, valid: bool) {
            self.clip_calls += 1;
            self.clip = valid.then_some(rect);
        }

        fn set_clip_softness(&mut self, softness: [f32; 2]) {
            self.softness = softness;
        }

        fn clip_owner(&self) -> Option<NodeId> {
            self.owner
        }

        fn set_clip_owner(&mut self, owner: Option<NodeId>) {
            self.owner = owner;
        }
    }

    impl Cullable for TestTarget {
        fn has_moved(&self, tree: &Tree) -> bool {
            self.last_bounds != Some(tree.rect(self.node))
        }

        fn cull(&mut self, clip_rect: Rect, valid: bool, tree: &Tree, requests: &mut RebuildRequests) {
            self.cull_calls += 1;
            let bounds = tree.rect(self.node);
            self.last_bounds = Some(bounds);
            self.update_cull(!valid || !clip_rect.intersects(&bounds), requests);
        }

        fn update_cull(&mut self, cull: bool, _requests: &mut RebuildRequests) {
            self.culled = cull;
        }
    }

    struct Scene {
        tree: Tree,
        canvas: NodeId,
        mask_node: NodeId,
        mask: Shared<RectMask>,
        leaf: NodeId,
        target: Shared<TestTarget>,
        requests: RebuildRequests,
    }

    /// canvas(0,0,200,200) -> mask(10,10,50,50) -> leaf(20,20,10,10)
    fn scene() -> Scene {
        let mut tree = Tree::new();
        let canvas = tree.create("canvas");
        tree.set_canvas(canvas, Some(CanvasSettings::default()));
        tree.set_rect(canvas, Rect::new(0.0, 0.0, 200.0, 200.0));
        let mask_node = tree.create_child(canvas, "mask");
        tree.set_rect(mask_node, Rect::new(10.0, 10.0, 50.0, 50.0));
        let mask = Rc::new(RefCell::new(RectMask::new(mask_node)));
        mask.borrow_mut().activate();
        if let Some(caps) = tree.capabilities_mut(mask_node) {
            caps.rect_mask = Some(mask.clone());
        }
        let leaf = tree.create_child(mask_node, "leaf");
        tree.set_rect(leaf, Rect::new(20.0, 20.0, 10.0, 10.0));

        let target = test_target(leaf);
        let mut requests = RebuildRequests::new();
        update_clip_parent(&tree, &ClipTarget::Cullable(target.clone()), &mut requests);

        Scene {
            tree,
            canvas,
            mask_node,
            mask,
            leaf,
            target,
            requests,
        }
    }

    #[test]
    fn test_first_pass_clips_and_culls() {
        let mut s = scene();
        assert_eq!(s.target.borrow().owner, Some(s.mask_node));

        assert!(s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests));

        let target = s.target.borrow();
        assert_eq!(target.clip, Some(Rect::new(10.0, 10.0, 50.0, 50.0)));
        assert!(!target.culled);
        assert_eq!(target.cull_calls, 1);
    }

    #[test]
    fn test_steady_state_only_culls_moved_targets() {
        let mut s = scene();
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);
        assert_eq!(s.target.borrow().cull_calls, 1);
        assert_eq!(s.target.borrow().clip_calls, 1);

        // Move the target outside the mask
        s.tree.set_rect(s.leaf, Rect::new(100.0, 100.0, 10.0, 10.0));
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);
        assert_eq!(s.target.borrow().cull_calls, 2);
        assert_eq!(s.target.borrow().clip_calls, 1);
        assert!(s.target.borrow().culled);
    }

    #[test]
    fn test_added_target_is_clipped_without_rect_change() {
        let mut s = scene();
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);

        let other = test_target(s.leaf);
        update_clip_parent(&s.tree, &ClipTarget::Cullable(other.clone()), &mut s.requests);
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);

        assert_eq!(other.borrow().clip, Some(Rect::new(10.0, 10.0, 50.0, 50.0)));
        // Re-pushed to the old target as well, but not re-culled
        assert_eq!(s.target.borrow().clip_calls, 2);
        assert_eq!(s.target.borrow().cull_calls, 1);
    }

    #[test]
    fn test_removed_target_re_pushes_clip_to_survivors() {
        let mut s = scene();
        let sibling = s.tree.create_child(s.mask_node, "sibling");
        s.tree.set_rect(sibling, Rect::new(30.0, 30.0, 10.0, 10.0));
        let other = test_target(sibling);
        let other_target = ClipTarget::Cullable(other.clone());
        update_clip_parent(&s.tree, &other_target, &mut s.requests);
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);
        assert_eq!(s.target.borrow().clip_calls, 1);
        assert_eq!(other.borrow().clip_calls, 1);

        s.mask.borrow_mut().remove_clippable(&other_target);
        assert_eq!(other.borrow().clip, None);
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);

        // Same compound rect: the survivor gets it again but is not re-culled
        let survivor = s.target.borrow();
        assert_eq!(survivor.clip, Some(Rect::new(10.0, 10.0, 50.0, 50.0)));
        assert_eq!(survivor.clip_calls, 2);
        assert_eq!(survivor.cull_calls, 1);
        assert_eq!(other.borrow().clip_calls, 2);
        assert_eq!(other.borrow().cull_calls, 1);
        assert_eq!(s.mask.borrow().target_count(), 1);
    }

    #[test]
    fn test_removal_pass_still_culls_moved_survivor() {
        let mut s = scene();
        let other = test_target(s.leaf);
        let other_target = ClipTarget::Cullable(other.clone());
        update_clip_parent(&s.tree, &other_target, &mut s.requests);
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);

        s.mask.borrow_mut().remove_clippable(&other_target);
        s.tree.set_rect(s.leaf, Rect::new(100.0, 100.0, 10.0, 10.0));
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);

        let survivor = s.target.borrow();
        assert_eq!(survivor.clip_calls, 2);
        assert_eq!(survivor.cull_calls, 2);
        assert!(survivor.culled);
    }

    #[test]
    fn test_padding_and_softness() {
        let mut s = scene();
        s.mask.borrow_mut().set_padding(Insets::uniform(5.0));
        s.mask.borrow_mut().set_softness([4.0, -2.0]);
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);

        let target = s.target.borrow();
        assert_eq!(target.clip, Some(Rect::new(15.0, 15.0, 40.0, 40.0)));
        assert_eq!(target.softness, [4.0, 0.0]);
    }

    #[test]
    fn test_mask_outside_screen_space_canvas_is_invalid() {
        let mut s = scene();
        s.tree
            .set_rect(s.mask_node, Rect::new(300.0, 300.0, 50.0, 50.0));
        s.tree.set_rect(s.leaf, Rect::new(310.0, 310.0, 10.0, 10.0));
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);

        assert_eq!(s.target.borrow().clip, None);
        assert!(s.target.borrow().culled);

        // World space canvases are never culled against their own bounds
        s.tree.set_canvas(
            s.canvas,
            Some(CanvasSettings {
                render_mode: RenderMode::WorldSpace,
                ..Default::default()
            }),
        );
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);
        assert_eq!(s.target.borrow().clip, Some(Rect::new(300.0, 300.0, 50.0, 50.0)));
        assert!(!s.target.borrow().culled);
    }

    #[test]
    fn test_no_canvas_is_a_no_op() {
        let mut tree = Tree::new();
        let node = tree.create("loose");
        let mut mask = RectMask::new(node);
        let mut requests = RebuildRequests::new();
        assert!(!mask.perform_clipping(&tree, &mut requests));
        assert_eq!(mask.last_clip_rect(), None);
    }

    #[test]
    fn test_deactivate_resets_targets_to_no_clip() {
        let mut s = scene();
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);
        s.tree.set_rect(s.leaf, Rect::new(100.0, 100.0, 10.0, 10.0));
        s.mask.borrow_mut().perform_clipping(&s.tree, &mut s.requests);
        assert!(s.target.borrow().culled);

        s.mask.borrow_mut().deactivate(&mut s.requests);

        let target = s.target.borrow();
        assert_eq!(target.clip, None);
        assert!(!target.culled);
        assert_eq!(target.owner, None);
        assert_eq!(s.mask.borrow().target_count(), 0);
    }
}
