//! Stencil masking: nesting depth, material variants and the masks that
//! write the stencil buffer.
//!
//! Each active stencil mask above an element adds one bit to the stencil
//! value the element has to match. Depth is counted up to the nearest
//! draw-order boundary, since a sorting override canvas starts a fresh
//! stencil context.

pub mod mask;
pub mod material;

use std::cell::RefCell;
use std::rc::Rc;

pub use mask::StencilMask;
pub use material::{
    ColorWriteMask, CompareFunction, Material, MaterialId, MaterialLease, StencilMaterialCache,
    StencilOp, StencilParams,
};

use crate::config::UiConfig;
use crate::element::RebuildRequests;
use crate::tree::{NodeId, Tree};

/// Hardware stencil buffers hold 8 bits.
pub const STENCIL_BITS: u32 = 8;

/// What a material modifier may read while deriving a material.
pub struct MaterialContext<'a> {
    pub tree: &'a Tree,
    pub materials: &'a StencilMaterialCache,
    pub config: &'a UiConfig,
}

impl MaterialContext<'_> {
    /// Depth at which stencil masking is skipped.
    pub fn depth_cap(&self) -> u32 {
        u32::from(self.config.max_stencil_depth).min(STENCIL_BITS)
    }
}

/// Rewrites the material a node's graphic renders with.
pub trait MaterialModifier {
    fn get_modified_material(&mut self, base: Rc<Material>, ctx: &MaterialContext<'_>)
        -> Rc<Material>;
}

/// Something whose material depends on the stencil masks above it.
pub trait Maskable {
    /// Drop cached stencil state and request a material rebuild.
    fn recalculate_masking(&mut self, requests: &mut RebuildRequests);
}

pub type SharedMaterialModifier = Rc<RefCell<dyn MaterialModifier>>;
pub type SharedMaskable = Rc<RefCell<dyn Maskable>>;

/// Whether the stencil mask on `node` is currently writing the stencil:
/// enabled, on an active node, with an enabled graphic to draw it.
pub fn is_stencil_mask_active(tree: &Tree, node: NodeId) -> bool {
    if !tree.is_active_in_hierarchy(node) {
        return false;
    }
    let Some(caps) = tree.capabilities(node) else {
        return false;
    };
    let Some(mask) = &caps.stencil_mask else {
        return false;
    };
    let Some(graphic) = &caps.graphic else {
        return false;
    };
    // Borrowed components are the ones asking, and only enabled ones ask
    mask.try_borrow().map_or(true, |m| m.is_enabled())
        && graphic.try_borrow().map_or(true, |g| g.is_enabled())
}

/// Count the active stencil masks above `node`, stopping after
/// `stop_after` (inclusive) or at the root.
pub fn get_stencil_depth(tree: &Tree, node: NodeId, stop_after: Option<NodeId>) -> u32 {
    if stop_after == Some(node) {
        return 0;
    }
    let mut depth = 0;
    for ancestor in tree.ancestors(node) {
        if is_stencil_mask_active(tree, ancestor) {
            depth += 1;
        }
        if stop_after == Some(ancestor) {
            break;
        }
    }
    depth
}

/// Nearest active canvas overriding sorting, else the root-most active
/// canvas, else none.
pub fn find_root_sort_override_canvas(tree: &Tree, node: NodeId) -> Option<NodeId> {
    let mut found = None;
    for candidate in std::iter::once(node).chain(tree.ancestors(node)) {
        let Some(canvas) = tree.canvas(candidate) else {
            continue;
        };
        if !tree.is_active_in_hierarchy(candidate) {
            continue;
        }
        found = Some(candidate);
        if canvas.override_sorting {
            break;
        }
    }
    found
}
