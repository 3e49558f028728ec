pub mod clip;
pub mod config;
pub mod element;
pub mod error;
pub mod geometry;
pub mod graphic;
pub mod layout;
pub mod registry;
pub mod stencil;
pub mod system;
pub mod tree;

// Internal object pooling, public for custom pooled elements
pub mod pool;

pub use config::{ReentrancyPolicy, UiConfig};
pub use error::{RebuildError, RegistryError};
pub use registry::{CanvasUpdateRegistry, UpdateStats};
pub use system::UiSystem;

pub mod prelude {
    pub use crate::clip::{Clippable, ClipperRegistry, Cullable, RectMask};
    pub use crate::element::{
        CanvasElement, CanvasUpdate, DirtyFlags, ElementHandle, ElementId, ElementKey,
        RebuildRequests, UpdateContext,
    };
    pub use crate::geometry::{Axis, Insets, Rect, Size};
    pub use crate::graphic::MaskableGraphic;
    pub use crate::layout::{
        ControllerRole, FitMode, LayoutController, LayoutElement, LayoutOverrides, SizeFitter,
    };
    pub use crate::stencil::{
        ColorWriteMask, CompareFunction, Maskable, Material, MaterialContext, MaterialModifier,
        StencilMask, StencilMaterialCache, StencilOp, StencilParams,
    };
    pub use crate::tree::{CanvasSettings, NodeId, RenderMode, Tree};
    pub use crate::{
        CanvasUpdateRegistry, RebuildError, ReentrancyPolicy, RegistryError, UiConfig, UiSystem,
        UpdateStats,
    };
}
