//! The update services of one UI scene, bundled.
//!
//! [`UiSystem`] owns the hierarchy together with the scheduler, the clipper
//! registry and the stencil material cache. All hierarchy changes go through
//! it so the affected masks, clip targets and layout roots are notified.

use crate::clip::{
    clip_targets, detach_clip_target, update_clip_parent, ClipTarget, ClipperRegistry, RectMask,
    SharedClippable,
};
use crate::config::UiConfig;
use crate::element::{DirtyFlags, ElementHandle, ElementKey, RebuildRequests};
use crate::error::RegistryError;
use crate::geometry::Rect;
use crate::graphic::MaskableGraphic;
use crate::layout::{self, LayoutRebuilderPool, SharedLayoutController, SharedLayoutElement};
use crate::registry::{CanvasUpdateRegistry, UpdateStats};
use crate::stencil::{
    Maskable, Material, SharedMaskable, SharedMaterialModifier, StencilMask,
    StencilMaterialCache,
};
use crate::tree::{CanvasSettings, NodeId, Shared, Tree};

use std::cell::RefCell;
use std::rc::Rc;

/// Explicitly constructed update services for one scene.
pub struct UiSystem {
    tree: Tree,
    registry: CanvasUpdateRegistry,
    clipper: ClipperRegistry,
    materials: StencilMaterialCache,
    config: UiConfig,
    shut_down: bool,
}

impl UiSystem {
    pub fn new(config: UiConfig) -> Self {
        log::debug!("Creating UI system with {:?}", config);
        Self {
            tree: Tree::new(),
            registry: CanvasUpdateRegistry::new(config.reentrancy),
            clipper: ClipperRegistry::new(),
            materials: StencilMaterialCache::new(),
            config,
            shut_down: false,
        }
    }

    pub fn config(&self) -> &UiConfig {
        &self.config
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn registry(&self) -> &CanvasUpdateRegistry {
        &self.registry
    }

    pub fn clipper(&self) -> &ClipperRegistry {
        &self.clipper
    }

    pub fn materials(&self) -> &StencilMaterialCache {
        &self.materials
    }

    pub fn layout_pool(&self) -> &LayoutRebuilderPool {
        self.registry.layout_pool()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // Hierarchy

    pub fn create_node(&mut self, name: impl Into<String>, parent: Option<NodeId>) -> NodeId {
        let node = self.tree.create(name);
        if let Some(parent) = parent {
            self.tree.set_parent(node, Some(parent));
            self.set_layout_dirty(parent);
        }
        node
    }

    /// Re-parent a node, notifying masks, clip targets and layout.
    pub fn set_parent(&mut self, node: NodeId, parent: Option<NodeId>) -> bool {
        let old_parent = self.tree.parent(node);
        if !self.tree.set_parent(node, parent) {
            return false;
        }
        if let Some(old_parent) = old_parent {
            self.set_layout_dirty(old_parent);
        }
        self.refresh_subtree(node);
        self.set_layout_dirty(node);
        true
    }

    pub fn set_active(&mut self, node: NodeId, active: bool) {
        if self.tree.is_active_self(node) == active {
            return;
        }
        self.tree.set_active(node, active);
        self.refresh_subtree(node);
        if let Some(parent) = self.tree.parent(node) {
            self.set_layout_dirty(parent);
        }
        if active {
            self.set_layout_dirty(node);
            self.mark_graphic_dirty(node, DirtyFlags::VERTICES);
        }
    }

    pub fn set_canvas(&mut self, node: NodeId, canvas: Option<CanvasSettings>) {
        self.tree.set_canvas(node, canvas);
        self.refresh_subtree(node);
    }

    /// Set a rect in root canvas space. Resized graphics are rebuilt and
    /// masks re-clip on the next update.
    pub fn set_rect(&mut self, node: NodeId, rect: Rect) {
        self.tree.set_rect(node, rect);
    }

    /// Remove a node and its subtree, releasing everything attached to it.
    ///
    /// Elements of the subtree still queued are swept by the next update.
    pub fn destroy_node(&mut self, node: NodeId) -> Vec<NodeId> {
        if !self.tree.contains(node) {
            return Vec::new();
        }
        let parent = self.tree.parent(node);
        let mut requests = RebuildRequests::new();

        for current in self.tree.subtree(node) {
            self.clipper.unregister(current, &mut requests);
            for target in clip_targets(&self.tree, current) {
                detach_clip_target(&self.tree, &target, &mut requests);
            }
            let Some(caps) = self.tree.capabilities(current) else {
                continue;
            };
            if let Some(graphic) = &caps.graphic {
                graphic.borrow_mut().release_materials();
            }
            if let Some(mask) = &caps.stencil_mask {
                mask.borrow_mut().release_materials();
            }
        }
        self.flush(&mut requests);

        let removed = self.tree.remove(node);
        if let Some(parent) = parent {
            self.set_layout_dirty(parent);
        }
        log::debug!("Destroyed {} nodes", removed.len());
        removed
    }

    // Capabilities

    /// Attach a graphic to `node`. A node holds at most one graphic; the
    /// existing one is returned if present.
    pub fn attach_graphic(
        &mut self,
        node: NodeId,
        material: Rc<Material>,
    ) -> Option<Shared<MaskableGraphic>> {
        let caps = self.tree.capabilities_mut(node)?;
        if let Some(existing) = &caps.graphic {
            log::warn!("Node already has a graphic");
            return Some(existing.clone());
        }
        let graphic = MaskableGraphic::new(node, material);
        caps.graphic = Some(graphic.clone());

        self.refresh_subtree(node);
        self.set_layout_dirty(node);
        Some(graphic)
    }

    pub fn set_graphic_enabled(&mut self, node: NodeId, enabled: bool) {
        let Some(graphic) = self.graphic(node) else {
            return;
        };
        graphic.borrow_mut().set_enabled(enabled);
        if enabled {
            graphic.borrow_mut().set_dirty(DirtyFlags::all());
        }
        self.refresh_subtree(node);
        self.set_layout_dirty(node);
    }

    /// Opt the node's graphic in or out of rect clipping and stencil masking.
    pub fn set_graphic_maskable(&mut self, node: NodeId, maskable: bool) {
        let Some(graphic) = self.graphic(node) else {
            return;
        };
        graphic.borrow_mut().set_maskable(maskable);
        self.refresh_subtree(node);
    }

    pub fn graphic(&self, node: NodeId) -> Option<Shared<MaskableGraphic>> {
        self.tree.capabilities(node)?.graphic.clone()
    }

    /// Attach a rect mask clipping the descendants of `node`.
    pub fn attach_rect_mask(&mut self, node: NodeId) -> Option<Shared<RectMask>> {
        let caps = self.tree.capabilities_mut(node)?;
        if let Some(existing) = &caps.rect_mask {
            log::warn!("Node already has a rect mask");
            return Some(existing.clone());
        }
        let mask = Rc::new(RefCell::new(RectMask::new(node)));
        caps.rect_mask = Some(mask.clone());

        self.refresh_subtree(node);
        Some(mask)
    }

    pub fn set_rect_mask_enabled(&mut self, node: NodeId, enabled: bool) {
        let Some(mask) = self.tree.capabilities(node).and_then(|c| c.rect_mask.clone()) else {
            return;
        };
        mask.borrow_mut().set_enabled(enabled);
        self.refresh_subtree(node);
    }

    /// Attach a stencil mask drawing the graphic of `node` into the stencil.
    pub fn attach_stencil_mask(
        &mut self,
        node: NodeId,
        show_mask_graphic: bool,
    ) -> Option<Shared<StencilMask>> {
        let caps = self.tree.capabilities_mut(node)?;
        if let Some(existing) = &caps.stencil_mask {
            log::warn!("Node already has a stencil mask");
            return Some(existing.clone());
        }
        let mask = Rc::new(RefCell::new(StencilMask::new(node, show_mask_graphic)));
        caps.stencil_mask = Some(mask.clone());
        caps.material_modifiers.push(mask.clone());

        self.refresh_subtree(node);
        Some(mask)
    }

    pub fn set_stencil_mask_enabled(&mut self, node: NodeId, enabled: bool) {
        let Some(mask) = self
            .tree
            .capabilities(node)
            .and_then(|c| c.stencil_mask.clone())
        else {
            return;
        };
        mask.borrow_mut().set_enabled(enabled);
        self.refresh_subtree(node);
    }

    pub fn add_layout_element(&mut self, node: NodeId, element: SharedLayoutElement) {
        if let Some(caps) = self.tree.capabilities_mut(node) {
            caps.layout_elements.push(element);
            self.set_layout_dirty(node);
        }
    }

    pub fn add_layout_controller(&mut self, node: NodeId, controller: SharedLayoutController) {
        if let Some(caps) = self.tree.capabilities_mut(node) {
            caps.layout_controllers.push(controller);
            self.set_layout_dirty(node);
        }
    }

    /// Attach a clip target other than the node's graphic.
    pub fn add_clippable(&mut self, node: NodeId, clippable: SharedClippable) {
        let Some(caps) = self.tree.capabilities_mut(node) else {
            return;
        };
        caps.clippables.push(clippable.clone());
        let mut requests = RebuildRequests::new();
        update_clip_parent(&self.tree, &ClipTarget::Plain(clippable), &mut requests);
        self.flush(&mut requests);
    }

    pub fn add_maskable(&mut self, node: NodeId, maskable: SharedMaskable) {
        let Some(caps) = self.tree.capabilities_mut(node) else {
            return;
        };
        caps.maskables.push(maskable.clone());
        let mut requests = RebuildRequests::new();
        maskable.borrow_mut().recalculate_masking(&mut requests);
        self.flush(&mut requests);
    }

    pub fn add_material_modifier(&mut self, node: NodeId, modifier: SharedMaterialModifier) {
        if let Some(caps) = self.tree.capabilities_mut(node) {
            caps.material_modifiers.push(modifier);
            self.mark_graphic_dirty(node, DirtyFlags::MATERIAL);
        }
    }

    // Rebuilds

    /// Schedule the layout root governing `node`. Returns false if nothing
    /// was queued.
    pub fn set_layout_dirty(&mut self, node: NodeId) -> bool {
        if self.shut_down {
            return false;
        }
        self.registry.set_layout_dirty(&self.tree, node)
    }

    /// Mark parts of the node's graphic dirty and queue it.
    pub fn mark_graphic_dirty(&mut self, node: NodeId, flags: DirtyFlags) -> bool {
        if flags.contains(DirtyFlags::LAYOUT) {
            self.set_layout_dirty(node);
        }
        let Some(graphic) = self.graphic(node) else {
            return false;
        };
        graphic.borrow_mut().set_dirty(flags);
        if self.shut_down || !flags.intersects(DirtyFlags::VERTICES | DirtyFlags::MATERIAL) {
            return false;
        }
        self.registry.register_for_graphic_rebuild(graphic)
    }

    pub fn register_for_layout_rebuild(&mut self, element: ElementHandle) -> bool {
        self.registry.register_for_layout_rebuild(element)
    }

    pub fn register_for_graphic_rebuild(&mut self, element: ElementHandle) -> bool {
        self.registry.register_for_graphic_rebuild(element)
    }

    pub fn unregister(&mut self, element: &ElementHandle) -> Result<(), RegistryError> {
        self.registry.unregister_all(element)
    }

    /// Lay out the subtree governed by `node` now, outside the update.
    pub fn force_rebuild_layout_immediate(&mut self, node: NodeId) {
        let root = layout::find_layout_root(&self.tree, node).unwrap_or(node);
        layout::force_rebuild_layout_immediate(&mut self.tree, root);
    }

    /// Run one frame: sweep, layout, cull, paint.
    pub fn perform_update(&mut self) -> UpdateStats {
        if self.shut_down {
            log::warn!("perform_update called after shutdown");
            return UpdateStats::default();
        }
        self.registry.perform_update(
            &mut self.tree,
            &mut self.clipper,
            &self.materials,
            &self.config,
        )
    }

    /// Tear the services down: queued elements are completed, every mask is
    /// deactivated and every cached material destroyed.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.registry.shutdown();
        let mut requests = RebuildRequests::new();
        self.clipper.clear(&mut requests);
        self.materials.clear_all();
        self.shut_down = true;
        log::debug!("UI system shut down");
    }

    fn flush(&mut self, requests: &mut RebuildRequests) {
        if self.shut_down {
            *requests = RebuildRequests::new();
            return;
        }
        self.registry.submit(&self.tree, requests);
    }

    /// Bring masks, clip owners and stencil state of a subtree in line with
    /// the hierarchy after a change at its root.
    fn refresh_subtree(&mut self, root: NodeId) {
        let nodes = self.tree.subtree(root);
        let mut requests = RebuildRequests::new();

        // Masks first, so clip owners resolve against their final state
        for &node in &nodes {
            self.sync_rect_mask(node, &mut requests);
            self.sync_stencil_mask(node);
        }
        for &node in &nodes {
            self.sync_graphic(node, &mut requests);
            for target in clip_targets(&self.tree, node) {
                update_clip_parent(&self.tree, &target, &mut requests);
            }
            let maskables = self
                .tree
                .capabilities(node)
                .map(|caps| caps.maskables.clone())
                .unwrap_or_default();
            for maskable in maskables {
                maskable.borrow_mut().recalculate_masking(&mut requests);
            }
        }
        self.flush(&mut requests);
    }

    fn sync_rect_mask(&mut self, node: NodeId, requests: &mut RebuildRequests) {
        let Some(mask) = self.tree.capabilities(node).and_then(|c| c.rect_mask.clone()) else {
            return;
        };
        let should_clip = mask.borrow().is_enabled() && self.tree.is_active_in_hierarchy(node);
        match (should_clip, self.clipper.is_registered(node)) {
            (true, false) if !self.shut_down => {
                self.clipper.register(mask);
            }
            (false, true) => {
                self.clipper.unregister(node, requests);
            }
            (true, true) => mask.borrow_mut().mark_chain_stale(),
            _ => {}
        }
    }

    fn sync_stencil_mask(&mut self, node: NodeId) {
        let Some(mask) = self
            .tree
            .capabilities(node)
            .and_then(|c| c.stencil_mask.clone())
        else {
            return;
        };
        if !self.tree.is_active_in_hierarchy(node) {
            mask.borrow_mut().release_materials();
        }
    }

    fn sync_graphic(&mut self, node: NodeId, requests: &mut RebuildRequests) {
        let Some(graphic) = self.graphic(node) else {
            return;
        };
        let active = graphic.borrow().is_enabled() && self.tree.is_active_in_hierarchy(node);
        if active {
            graphic.borrow_mut().recalculate_masking(requests);
        } else {
            let key = graphic.borrow().id();
            graphic.borrow_mut().release_materials();
            self.registry.disable_for_rebuild(ElementKey::Element(key));
        }
    }
}

impl Default for UiSystem {
    fn default() -> Self {
        Self::new(UiConfig::default())
    }
}
