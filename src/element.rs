//! Elements taking part in the per-frame update cycle.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::config::UiConfig;
use crate::error::RebuildError;
use crate::stencil::StencilMaterialCache;
use crate::tree::{NodeId, Tree};

bitflags! {
    /// What part of an element is out of date.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DirtyFlags: u8 {
        /// Size or position may change
        const LAYOUT   = 0b001;
        /// Material (stencil, clipping state) must be re-derived
        const MATERIAL = 0b010;
        /// Geometry must be regenerated
        const VERTICES = 0b100;
    }
}

/// Stages of one update, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanvasUpdate {
    Prelayout,
    Layout,
    PostLayout,
    PreRender,
    LatePreRender,
}

impl CanvasUpdate {
    pub const LAYOUT_STAGES: [CanvasUpdate; 3] = [
        CanvasUpdate::Prelayout,
        CanvasUpdate::Layout,
        CanvasUpdate::PostLayout,
    ];

    pub const PAINT_STAGES: [CanvasUpdate; 2] =
        [CanvasUpdate::PreRender, CanvasUpdate::LatePreRender];

    pub fn queue(self) -> QueueKind {
        match self {
            CanvasUpdate::Prelayout | CanvasUpdate::Layout | CanvasUpdate::PostLayout => {
                QueueKind::Layout
            }
            CanvasUpdate::PreRender | CanvasUpdate::LatePreRender => QueueKind::Graphic,
        }
    }
}

/// The two dirty sets held by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Layout,
    Graphic,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Layout => f.write_str("layout"),
            QueueKind::Graphic => f.write_str("graphic"),
        }
    }
}

/// Unique identifier for an element instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ElementId(u64);

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

impl ElementId {
    pub fn next() -> Self {
        ElementId(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Set-membership key of a queued element.
///
/// Computed once when the element is created, so membership stays stable
/// even after the node it refers to has been removed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ElementKey {
    Element(ElementId),
    /// Layout rebuild requests are keyed by the layout root they target.
    LayoutRoot(NodeId),
}

/// A participant in the update cycle.
pub trait CanvasElement {
    fn key(&self) -> ElementKey;

    /// Back-reference into the hierarchy, used for depth ordering.
    fn node(&self) -> Option<NodeId>;

    /// Run this element's work for one stage.
    fn rebuild(
        &mut self,
        stage: CanvasUpdate,
        ctx: &mut UpdateContext<'_>,
    ) -> Result<(), RebuildError>;

    /// Called once the layout queue holding this element has been processed
    /// or the element has been dropped from it.
    fn layout_complete(&mut self) {}

    /// Called once the graphic queue holding this element has been processed
    /// or the element has been dropped from it.
    fn graphic_update_complete(&mut self) {}

    /// Liveness check run at the start of every update.
    fn is_destroyed(&self, tree: &Tree) -> bool {
        self.node().is_some_and(|node| !tree.contains(node))
    }
}

pub type ElementHandle = Rc<RefCell<dyn CanvasElement>>;

/// Requests raised while the scheduler is running a pass.
///
/// Elements cannot reach the scheduler while it iterates, so they record
/// their requests here and the scheduler applies them between callbacks.
#[derive(Default)]
pub struct RebuildRequests {
    pub(crate) layout: Vec<ElementHandle>,
    pub(crate) graphic: Vec<ElementHandle>,
    pub(crate) disabled: Vec<ElementKey>,
    /// Nodes whose layout root has to be scheduled
    pub(crate) layout_dirty: Vec<NodeId>,
}

impl RebuildRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_layout(&mut self, element: ElementHandle) {
        self.layout.push(element);
    }

    pub fn request_graphic(&mut self, element: ElementHandle) {
        self.graphic.push(element);
    }

    /// Drop an element from both queues for the rest of the pass.
    pub fn disable(&mut self, key: ElementKey) {
        self.disabled.push(key);
    }

    /// Schedule the layout root governing `node`.
    pub fn set_layout_dirty(&mut self, node: NodeId) {
        self.layout_dirty.push(node);
    }

    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
            && self.graphic.is_empty()
            && self.disabled.is_empty()
            && self.layout_dirty.is_empty()
    }

    pub(crate) fn elements_mut(&mut self, kind: QueueKind) -> &mut Vec<ElementHandle> {
        match kind {
            QueueKind::Layout => &mut self.layout,
            QueueKind::Graphic => &mut self.graphic,
        }
    }

    pub(crate) fn take(&mut self) -> RebuildRequests {
        std::mem::take(self)
    }
}

/// Everything a rebuild callback may touch.
pub struct UpdateContext<'a> {
    pub tree: &'a mut Tree,
    pub materials: &'a StencilMaterialCache,
    pub config: &'a UiConfig,
    pub requests: &'a mut RebuildRequests,
    pub(crate) stage: Option<CanvasUpdate>,
}

impl<'a> UpdateContext<'a> {
    pub fn new(
        tree: &'a mut Tree,
        materials: &'a StencilMaterialCache,
        config: &'a UiConfig,
        requests: &'a mut RebuildRequests,
    ) -> Self {
        Self {
            tree,
            materials,
            config,
            requests,
            stage: None,
        }
    }

    pub fn stage(&self) -> Option<CanvasUpdate> {
        self.stage
    }

    pub fn is_layout_phase_active(&self) -> bool {
        self.stage.is_some_and(|s| s.queue() == QueueKind::Layout)
    }

    pub fn is_paint_phase_active(&self) -> bool {
        self.stage.is_some_and(|s| s.queue() == QueueKind::Graphic)
    }

    pub fn request_layout_rebuild(&mut self, element: ElementHandle) {
        self.requests.request_layout(element);
    }

    pub fn request_graphic_rebuild(&mut self, element: ElementHandle) {
        self.requests.request_graphic(element);
    }

    /// Mark the layout of `node` dirty. Requested during a layout stage,
    /// the layout runs next update.
    pub fn set_layout_dirty(&mut self, node: NodeId) {
        self.requests.set_layout_dirty(node);
    }
}
