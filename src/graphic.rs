//! The canonical paint element.
//!
//! A [`MaskableGraphic`] sits in a node's `graphic` slot. It rebuilds its
//! geometry and material during `PreRender`, takes clip rects from the
//! nearest rect mask, is culled when it falls outside them, and picks the
//! stencil material variant matching the stencil masks above it.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::clip::{Clippable, Cullable};
use crate::element::{
    CanvasElement, CanvasUpdate, DirtyFlags, ElementId, ElementKey, RebuildRequests,
    UpdateContext,
};
use crate::error::RebuildError;
use crate::geometry::Rect;
use crate::stencil::{
    find_root_sort_override_canvas, get_stencil_depth, ColorWriteMask, CompareFunction, Material,
    MaterialContext, MaterialLease, MaterialModifier, Maskable, StencilOp, StencilParams,
};
use crate::tree::{NodeId, Shared, Tree};

/// What the renderer receives from a graphic.
#[derive(Debug, Clone, Default)]
pub struct RendererState {
    pub cull: bool,
    /// `None` when rect clipping is off
    pub clip_rect: Option<Rect>,
    pub softness: [f32; 2],
    pub material: Option<Rc<Material>>,
    /// Rect the current geometry was built for
    pub mesh_rect: Option<Rect>,
    pub geometry_builds: u32,
    pub material_builds: u32,
}

pub struct MaskableGraphic {
    id: ElementId,
    node: NodeId,
    this: Weak<RefCell<MaskableGraphic>>,
    enabled: bool,
    maskable: bool,
    base_material: Rc<Material>,
    dirty: DirtyFlags,
    renderer: RendererState,
    stencil_value: u32,
    stencil_dirty: bool,
    mask_material: Option<MaterialLease>,
    clip_owner: Option<NodeId>,
    /// Bounds at the last cull; compared to detect movement
    cull_bounds: Option<Rect>,
}

impl MaskableGraphic {
    /// Create a fully dirty graphic for `node`.
    pub fn new(node: NodeId, base_material: Rc<Material>) -> Shared<MaskableGraphic> {
        Rc::new_cyclic(|this| {
            RefCell::new(MaskableGraphic {
                id: ElementId::next(),
                node,
                this: this.clone(),
                enabled: true,
                maskable: true,
                base_material,
                dirty: DirtyFlags::all(),
                renderer: RendererState::default(),
                stencil_value: 0,
                stencil_dirty: true,
                mask_material: None,
                clip_owner: None,
                cull_bounds: None,
            })
        })
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Flip the enabled flag. Disabling drops the held stencil material;
    /// `UiSystem::set_graphic_enabled` handles queues and clip owners.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.release_materials();
        }
    }

    pub fn is_maskable(&self) -> bool {
        self.maskable
    }

    pub fn set_maskable(&mut self, maskable: bool) {
        self.maskable = maskable;
        self.stencil_dirty = true;
    }

    pub fn base_material(&self) -> &Rc<Material> {
        &self.base_material
    }

    pub fn set_base_material(&mut self, material: Rc<Material>, requests: &mut RebuildRequests) {
        self.base_material = material;
        self.set_material_dirty(requests);
    }

    pub fn renderer(&self) -> &RendererState {
        &self.renderer
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    /// Mark parts dirty without queueing a rebuild.
    pub fn set_dirty(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    pub fn set_material_dirty(&mut self, requests: &mut RebuildRequests) {
        self.dirty |= DirtyFlags::MATERIAL;
        self.request_rebuild(requests);
    }

    pub fn set_vertices_dirty(&mut self, requests: &mut RebuildRequests) {
        self.dirty |= DirtyFlags::VERTICES;
        self.request_rebuild(requests);
    }

    fn request_rebuild(&self, requests: &mut RebuildRequests) {
        if let Some(this) = self.this.upgrade() {
            requests.request_graphic(this);
        }
    }

    /// Cached stencil depth; refreshed on the next material rebuild.
    pub fn stencil_value(&self) -> u32 {
        self.stencil_value
    }

    pub fn release_materials(&mut self) {
        self.mask_material = None;
    }

    fn is_active(&self, tree: &Tree) -> bool {
        self.enabled && tree.is_active_in_hierarchy(self.node)
    }

    /// The graphic drawing a stencil mask never reads the stencil itself.
    fn is_masking_graphic(&self, tree: &Tree) -> bool {
        tree.capabilities(self.node)
            .and_then(|caps| caps.stencil_mask.as_ref())
            .is_some_and(|mask| mask.try_borrow().map_or(true, |m| m.is_enabled()))
    }

    fn update_geometry(&mut self, tree: &Tree) {
        self.renderer.mesh_rect = Some(tree.rect(self.node));
        self.renderer.geometry_builds += 1;
    }

    fn update_material(&mut self, ctx: &MaterialContext<'_>) {
        let base = self.base_material.clone();
        let mut material = self.get_modified_material(base, ctx);

        let modifiers = ctx
            .tree
            .capabilities(self.node)
            .map(|caps| caps.material_modifiers.clone())
            .unwrap_or_default();
        for modifier in modifiers {
            match modifier.try_borrow_mut() {
                Ok(mut modifier) => material = modifier.get_modified_material(material, ctx),
                Err(_) => log::warn!(
                    "Skipping a borrowed material modifier on '{}'",
                    ctx.tree.name(self.node)
                ),
            }
        }

        self.renderer.material = Some(material);
        self.renderer.material_builds += 1;
    }
}

impl CanvasElement for MaskableGraphic {
    fn key(&self) -> ElementKey {
        ElementKey::Element(self.id)
    }

    fn node(&self) -> Option<NodeId> {
        Some(self.node)
    }

    fn rebuild(
        &mut self,
        stage: CanvasUpdate,
        ctx: &mut UpdateContext<'_>,
    ) -> Result<(), RebuildError> {
        if stage != CanvasUpdate::PreRender || self.renderer.cull || !self.is_active(ctx.tree) {
            return Ok(());
        }

        self.dirty.remove(DirtyFlags::LAYOUT);
        if self.dirty.contains(DirtyFlags::VERTICES) {
            self.update_geometry(ctx.tree);
            self.dirty.remove(DirtyFlags::VERTICES);
        }
        if self.dirty.contains(DirtyFlags::MATERIAL) {
            let material_ctx = MaterialContext {
                tree: ctx.tree,
                materials: ctx.materials,
                config: ctx.config,
            };
            self.update_material(&material_ctx);
            self.dirty.remove(DirtyFlags::MATERIAL);
        }
        Ok(())
    }
}

impl MaterialModifier for MaskableGraphic {
    fn get_modified_material(
        &mut self,
        base: Rc<Material>,
        ctx: &MaterialContext<'_>,
    ) -> Rc<Material> {
        if self.stencil_dirty {
            self.stencil_value = if self.maskable {
                let boundary = find_root_sort_override_canvas(ctx.tree, self.node);
                get_stencil_depth(ctx.tree, self.node, boundary)
            } else {
                0
            };
            self.stencil_dirty = false;
        }

        if self.stencil_value == 0 || self.is_masking_graphic(ctx.tree) {
            self.release_materials();
            return base;
        }
        if self.stencil_value >= ctx.depth_cap() {
            log::warn!(
                "Stencil depth {} of '{}' exceeds the limit of {}, rendering unmasked",
                self.stencil_value,
                ctx.tree.name(self.node),
                ctx.depth_cap()
            );
            self.release_materials();
            return base;
        }

        self.release_materials();
        let bits = (1i32 << self.stencil_value) - 1;
        let params = StencilParams::new(
            bits,
            StencilOp::Keep,
            CompareFunction::Equal,
            ColorWriteMask::ALL,
        )
        .masks(bits as u8, 0);
        let lease = ctx.materials.acquire(&base, params);
        let material = lease.material().clone();
        self.mask_material = Some(lease);
        material
    }
}

impl Maskable for MaskableGraphic {
    fn recalculate_masking(&mut self, requests: &mut RebuildRequests) {
        self.release_materials();
        self.stencil_dirty = true;
        self.set_material_dirty(requests);
    }
}

impl Clippable for MaskableGraphic {
    fn target_id(&self) -> ElementId {
        self.id
    }

    fn node(&self) -> NodeId {
        self.node
    }

    fn is_maskable(&self) -> bool {
        self.maskable && self.enabled
    }

    fn set_clip_rect(&mut self, rect: Rect, valid: bool) {
        self.renderer.clip_rect = valid.then_some(rect);
    }

    fn set_clip_softness(&mut self, softness: [f32; 2]) {
        self.renderer.softness = softness;
    }

    fn clip_owner(&self) -> Option<NodeId> {
        self.clip_owner
    }

    fn set_clip_owner(&mut self, owner: Option<NodeId>) {
        self.clip_owner = owner;
    }
}

impl Cullable for MaskableGraphic {
    fn has_moved(&self, tree: &Tree) -> bool {
        self.cull_bounds != Some(tree.rect(self.node))
    }

    fn cull(&mut self, clip_rect: Rect, valid: bool, tree: &Tree, requests: &mut RebuildRequests) {
        let bounds = tree.rect(self.node);
        self.cull_bounds = Some(bounds);
        let cull = !valid || !clip_rect.intersects(&bounds);
        self.update_cull(cull, requests);
    }

    fn update_cull(&mut self, cull: bool, requests: &mut RebuildRequests) {
        if self.renderer.cull == cull {
            return;
        }
        self.renderer.cull = cull;
        log::trace!("Graphic {:?} cull state is now {}", self.id, cull);
        // Rebuilds are skipped while culled, so pending work resumes here
        if !cull && self.dirty.intersects(DirtyFlags::VERTICES | DirtyFlags::MATERIAL) {
            self.request_rebuild(requests);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UiConfig;
    use crate::stencil::{StencilMask, StencilMaterialCache};

    struct Fixture {
        tree: Tree,
        materials: StencilMaterialCache,
        config: UiConfig,
        requests: RebuildRequests,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tree: Tree::new(),
                materials: StencilMaterialCache::new(),
                config: UiConfig::default(),
                requests: RebuildRequests::new(),
            }
        }

        fn paint(&mut self, graphic: &Shared<MaskableGraphic>) {
            let mut ctx = UpdateContext::new(
                &mut self.tree,
                &self.materials,
                &self.config,
                &mut self.requests,
            );
            graphic
                .borrow_mut()
                .rebuild(CanvasUpdate::PreRender, &mut ctx)
                .unwrap();
        }

        /// Chain of `levels` stencil masks; returns the innermost node.
        fn stencil_chain(&mut self, levels: usize) -> NodeId {
            let mut parent = self.tree.create("root");
            for level in 0..levels {
                let node = self.tree.create_child(parent, format!("mask {}", level));
                if let Some(caps) = self.tree.capabilities_mut(node) {
                    caps.stencil_mask = Some(Rc::new(RefCell::new(StencilMask::new(node, true))));
                    caps.graphic = Some(MaskableGraphic::new(node, Material::new("mask")));
                }
                parent = node;
            }
            parent
        }
    }

    #[test]
    fn test_rebuild_clears_dirty_flags() {
        let mut f = Fixture::new();
        let node = f.tree.create("image");
        f.tree.set_rect(node, Rect::new(0.0, 0.0, 10.0, 10.0));
        let graphic = MaskableGraphic::new(node, Material::new("ui"));

        f.paint(&graphic);

        let g = graphic.borrow();
        assert!(g.dirty().is_empty());
        assert_eq!(g.renderer().mesh_rect, Some(Rect::new(0.0, 0.0, 10.0, 10.0)));
        assert!(Rc::ptr_eq(g.renderer().material.as_ref().unwrap(), g.base_material()));
    }

    #[test]
    fn test_culled_graphic_skips_rebuild_and_requeues_when_visible() {
        let mut f = Fixture::new();
        let node = f.tree.create("image");
        f.tree.set_rect(node, Rect::new(0.0, 0.0, 10.0, 10.0));
        let graphic = MaskableGraphic::new(node, Material::new("ui"));

        graphic.borrow_mut().cull(
            Rect::new(50.0, 50.0, 10.0, 10.0),
            true,
            &f.tree,
            &mut f.requests,
        );
        f.paint(&graphic);
        assert!(graphic.borrow().renderer().cull);
        assert_eq!(graphic.borrow().renderer().geometry_builds, 0);
        assert!(f.requests.is_empty());

        graphic.borrow_mut().cull(
            Rect::new(0.0, 0.0, 100.0, 100.0),
            true,
            &f.tree,
            &mut f.requests,
        );
        assert!(!graphic.borrow().renderer().cull);
        assert_eq!(f.requests.graphic.len(), 1);
    }

    #[test]
    fn test_masked_graphic_reads_stencil() {
        let mut f = Fixture::new();
        let inner = f.stencil_chain(2);
        let leaf = f.tree.create_child(inner, "leaf");
        let graphic = MaskableGraphic::new(leaf, Material::new("ui"));

        f.paint(&graphic);

        let g = graphic.borrow();
        assert_eq!(g.stencil_value(), 2);
        let params = g.renderer().material.as_ref().unwrap().stencil().unwrap();
        assert_eq!(params.stencil_id, 0b11);
        assert_eq!(params.operation, StencilOp::Keep);
        assert_eq!(params.read_mask, 0b11);
        assert_eq!(params.write_mask, 0);
        assert_eq!(f.materials.entry_count(), 1);
    }

    #[test]
    fn test_depth_cap_falls_back_to_base_material() {
        let mut f = Fixture::new();
        let inner = f.stencil_chain(9);
        let leaf = f.tree.create_child(inner, "leaf");
        let base = Material::new("ui");
        let graphic = MaskableGraphic::new(leaf, base.clone());

        f.paint(&graphic);

        let g = graphic.borrow();
        assert_eq!(g.stencil_value(), 9);
        assert!(Rc::ptr_eq(g.renderer().material.as_ref().unwrap(), &base));
        assert_eq!(f.materials.entry_count(), 0);
    }

    #[test]
    fn test_recalculate_masking_releases_and_requeues() {
        let mut f = Fixture::new();
        let inner = f.stencil_chain(1);
        let leaf = f.tree.create_child(inner, "leaf");
        let graphic = MaskableGraphic::new(leaf, Material::new("ui"));
        f.paint(&graphic);
        assert_eq!(f.materials.entry_count(), 1);

        graphic.borrow_mut().recalculate_masking(&mut f.requests);

        assert_eq!(f.materials.entry_count(), 0);
        assert!(graphic.borrow().dirty().contains(DirtyFlags::MATERIAL));
        assert_eq!(f.requests.graphic.len(), 1);
    }

    #[test]
    fn test_material_rebuild_releases_previous_variant_first() {
        let mut f = Fixture::new();
        let inner = f.stencil_chain(1);
        let leaf = f.tree.create_child(inner, "leaf");
        let graphic = MaskableGraphic::new(leaf, Material::new("ui"));
        f.paint(&graphic);
        let first = graphic.borrow().renderer().material.clone().unwrap();

        graphic.borrow_mut().set_dirty(DirtyFlags::MATERIAL);
        f.paint(&graphic);

        // Sole holder: the old variant is destroyed before the new one is built
        let second = graphic.borrow().renderer().material.clone().unwrap();
        assert!(!Rc::ptr_eq(&first, &second));
        assert_eq!(f.materials.ref_count(&first), 0);
        assert_eq!(f.materials.ref_count(&second), 1);
        assert_eq!(f.materials.entry_count(), 1);
    }

    #[test]
    fn test_unmaskable_graphic_ignores_stencil() {
        let mut f = Fixture::new();
        let inner = f.stencil_chain(1);
        let leaf = f.tree.create_child(inner, "leaf");
        let graphic = MaskableGraphic::new(leaf, Material::new("ui"));
        graphic.borrow_mut().set_maskable(false);

        f.paint(&graphic);

        assert_eq!(graphic.borrow().stencil_value(), 0);
        assert_eq!(f.materials.entry_count(), 0);
    }
}
