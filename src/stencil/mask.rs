//! Stencil mask: draws its node's graphic into the stencil buffer so that
//! descendants only render inside it.

use std::rc::Rc;

use crate::stencil::{
    find_root_sort_override_canvas, get_stencil_depth, is_stencil_mask_active, ColorWriteMask,
    CompareFunction, Material, MaterialContext, MaterialLease, MaterialModifier, StencilOp,
    StencilParams,
};
use crate::tree::NodeId;

/// Stencil-writing mask attached next to a node's graphic.
///
/// Its graphic renders with the mask material (writing this level's bit)
/// and is followed by the unmask material, which clears the bit again once
/// the children are drawn.
pub struct StencilMask {
    node: NodeId,
    enabled: bool,
    show_mask_graphic: bool,
    mask_material: Option<MaterialLease>,
    unmask_material: Option<MaterialLease>,
}

impl StencilMask {
    pub fn new(node: NodeId, show_mask_graphic: bool) -> Self {
        Self {
            node,
            enabled: true,
            show_mask_graphic,
            mask_material: None,
            unmask_material: None,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Flip the enabled flag only. `UiSystem::set_stencil_mask_enabled` also
    /// notifies the masked descendants.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.release_materials();
        }
    }

    pub fn show_mask_graphic(&self) -> bool {
        self.show_mask_graphic
    }

    pub fn set_show_mask_graphic(&mut self, show: bool) {
        self.show_mask_graphic = show;
    }

    pub fn mask_material(&self) -> Option<&Rc<Material>> {
        self.mask_material.as_ref().map(MaterialLease::material)
    }

    /// Material drawn after the children to clear this level's bit.
    pub fn unmask_material(&self) -> Option<&Rc<Material>> {
        self.unmask_material.as_ref().map(MaterialLease::material)
    }

    pub fn release_materials(&mut self) {
        self.mask_material = None;
        self.unmask_material = None;
    }
}

impl MaterialModifier for StencilMask {
    fn get_modified_material(
        &mut self,
        base: Rc<Material>,
        ctx: &MaterialContext<'_>,
    ) -> Rc<Material> {
        if !self.enabled || !is_stencil_mask_active(ctx.tree, self.node) {
            return base;
        }

        let boundary = find_root_sort_override_canvas(ctx.tree, self.node);
        let depth = get_stencil_depth(ctx.tree, self.node, boundary);
        if depth >= ctx.depth_cap() {
            log::warn!(
                "Attempting to use a stencil mask with depth > {} on '{}'",
                ctx.depth_cap(),
                ctx.tree.name(self.node)
            );
            self.release_materials();
            return base;
        }

        let color_mask = if self.show_mask_graphic {
            ColorWriteMask::ALL
        } else {
            ColorWriteMask::empty()
        };
        let bit = 1i32 << depth;
        let (mask, unmask) = if bit == 1 {
            (
                StencilParams::new(1, StencilOp::Replace, CompareFunction::Always, color_mask),
                StencilParams::new(
                    1,
                    StencilOp::Zero,
                    CompareFunction::Always,
                    ColorWriteMask::empty(),
                ),
            )
        } else {
            // Write this level's bit where every level above is set
            let below = bit - 1;
            let with_bit = bit | below;
            (
                StencilParams::new(with_bit, StencilOp::Replace, CompareFunction::Equal, color_mask)
                    .masks(below as u8, with_bit as u8),
                StencilParams::new(
                    below,
                    StencilOp::Replace,
                    CompareFunction::Equal,
                    ColorWriteMask::empty(),
                )
                .masks(below as u8, with_bit as u8),
            )
        };

        self.release_materials();
        let mask = ctx.materials.acquire(&base, mask);
        let unmask = ctx.materials.acquire(&base, unmask);
        let material = mask.material().clone();
        self.mask_material = Some(mask);
        self.unmask_material = Some(unmask);
        material
    }
}
