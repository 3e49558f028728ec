//! Per-frame dirty-set scheduler.
//!
//! Elements queue themselves for a layout or graphic rebuild at any point
//! during frame logic. Once per tick [`CanvasUpdateRegistry::perform_update`]
//! runs the fixed stage sequence:
//!
//! 1. sweep queued elements whose node has left the hierarchy
//! 2. layout stages, shallowest elements first, stage-major
//! 3. culling of every registered rect mask
//! 4. paint stages
//!
//! Both queues are ordered and reject duplicates, so requesting the same
//! element many times in one tick rebuilds it once per stage.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::clip::ClipperRegistry;
use crate::config::{ReentrancyPolicy, UiConfig};
use crate::element::{
    CanvasUpdate, DirtyFlags, ElementHandle, ElementKey, QueueKind, RebuildRequests,
    UpdateContext,
};
use crate::error::{RebuildError, RegistryError};
use crate::layout::{find_layout_root, LayoutRebuilderPool};
use crate::stencil::StencilMaterialCache;
use crate::tree::{NodeId, Tree};

/// Counters describing one `perform_update` call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateStats {
    /// Elements dropped because their node was no longer live
    pub swept: usize,
    pub layout_rebuilds: usize,
    pub graphic_rebuilds: usize,
    /// Callbacks that returned an error
    pub failures: usize,
    /// Requests refused under `ReentrancyPolicy::Reject`
    pub rejected: usize,
    /// Requests parked for the next update
    pub deferred: usize,
    pub masks_clipped: usize,
}

struct QueueEntry {
    element: ElementHandle,
    /// Completed early; skipped for the rest of the pass
    disabled: bool,
}

/// The scheduler owning the layout and graphic dirty sets.
pub struct CanvasUpdateRegistry {
    layout_queue: IndexMap<ElementKey, QueueEntry>,
    graphic_queue: IndexMap<ElementKey, QueueEntry>,
    /// Requests made while their queue's stage was running
    parked: RebuildRequests,
    layout_pool: LayoutRebuilderPool,
    active: Option<QueueKind>,
    policy: ReentrancyPolicy,
    shut_down: bool,
}

impl CanvasUpdateRegistry {
    pub fn new(policy: ReentrancyPolicy) -> Self {
        Self {
            layout_queue: IndexMap::new(),
            graphic_queue: IndexMap::new(),
            parked: RebuildRequests::new(),
            layout_pool: LayoutRebuilderPool::new(),
            active: None,
            policy,
            shut_down: false,
        }
    }

    /// Queue an element for the layout stages. Returns false if it was
    /// already queued or the request was refused.
    pub fn register_for_layout_rebuild(&mut self, element: ElementHandle) -> bool {
        self.try_register_for_layout_rebuild(element)
            .unwrap_or(false)
    }

    /// Queue an element for the paint stages. Returns false if it was
    /// already queued or the request was refused.
    pub fn register_for_graphic_rebuild(&mut self, element: ElementHandle) -> bool {
        self.try_register_for_graphic_rebuild(element)
            .unwrap_or(false)
    }

    pub fn try_register_for_layout_rebuild(
        &mut self,
        element: ElementHandle,
    ) -> Result<bool, RegistryError> {
        self.insert(QueueKind::Layout, element)
    }

    pub fn try_register_for_graphic_rebuild(
        &mut self,
        element: ElementHandle,
    ) -> Result<bool, RegistryError> {
        self.insert(QueueKind::Graphic, element)
    }

    /// Mark `node` as needing layout and queue a rebuilder for its layout
    /// root. Returns false when nothing was queued: the node controls
    /// nothing, its root is already queued, or the request was refused.
    pub fn set_layout_dirty(&mut self, tree: &Tree, node: NodeId) -> bool {
        self.try_set_layout_dirty(tree, node).unwrap_or(false)
    }

    /// Like [`set_layout_dirty`](Self::set_layout_dirty). While the layout
    /// stage runs the node is parked under `Defer`; its root is resolved at
    /// the start of the next update.
    pub fn try_set_layout_dirty(
        &mut self,
        tree: &Tree,
        node: NodeId,
    ) -> Result<bool, RegistryError> {
        if self.shut_down {
            log::error!("Layout marked dirty after the update system was shut down");
            return Err(RegistryError::ShutDown);
        }

        if self.active == Some(QueueKind::Layout) {
            return match self.policy {
                ReentrancyPolicy::Defer => {
                    log::debug!("Deferring layout of '{}' to the next update", tree.name(node));
                    self.parked.set_layout_dirty(node);
                    Ok(true)
                }
                ReentrancyPolicy::Reject => {
                    log::error!(
                        "Trying to mark layout of '{}' dirty while the layout stage is running. This is not supported.",
                        tree.name(node)
                    );
                    Err(RegistryError::StageActive {
                        queue: QueueKind::Layout,
                    })
                }
            };
        }

        let Some(root) = find_layout_root(tree, node) else {
            return Ok(false);
        };
        let rebuilder = self.layout_pool.acquire(root);
        let result = self.insert(QueueKind::Layout, rebuilder.clone());
        if !matches!(result, Ok(true)) {
            self.layout_pool.discard(rebuilder);
        }
        result
    }

    pub fn layout_pool(&self) -> &LayoutRebuilderPool {
        &self.layout_pool
    }

    fn insert(&mut self, kind: QueueKind, element: ElementHandle) -> Result<bool, RegistryError> {
        if self.shut_down {
            log::error!("Rebuild requested after the update system was shut down");
            return Err(RegistryError::ShutDown);
        }

        if self.active == Some(kind) {
            return match self.policy {
                ReentrancyPolicy::Defer => {
                    log::debug!("Deferring {} rebuild request to the next update", kind);
                    match kind {
                        QueueKind::Layout => self.parked.request_layout(element),
                        QueueKind::Graphic => self.parked.request_graphic(element),
                    }
                    Ok(true)
                }
                ReentrancyPolicy::Reject => {
                    log::error!(
                        "Trying to add {:?} for {} rebuild while the {} stage is running. This is not supported.",
                        element.borrow().key(),
                        kind,
                        kind
                    );
                    Err(RegistryError::StageActive { queue: kind })
                }
            };
        }

        let key = element.borrow().key();
        let queue = self.queue_mut(kind);
        if queue.contains_key(&key) {
            return Ok(false);
        }
        queue.insert(
            key,
            QueueEntry {
                element,
                disabled: false,
            },
        );
        Ok(true)
    }

    /// Remove an element from both queues, completing it first.
    ///
    /// Refused while either stage is running; use
    /// [`disable_for_rebuild`](Self::disable_for_rebuild) from inside a pass.
    pub fn unregister_all(&mut self, element: &ElementHandle) -> Result<(), RegistryError> {
        if let Some(kind) = self.active {
            log::error!(
                "Trying to remove {:?} from the rebuild queues while the {} stage is running. This is not supported.",
                element.borrow().key(),
                kind
            );
            return Err(RegistryError::StageActive { queue: kind });
        }

        let key = element.borrow().key();
        for kind in [QueueKind::Layout, QueueKind::Graphic] {
            let mut completed = Vec::new();
            if let Some(entry) = self.queue_mut(kind).shift_remove(&key) {
                complete_once(kind, &entry.element, &mut completed);
            }
            let parked = std::mem::take(self.parked.elements_mut(kind));
            let (dropped, kept): (Vec<_>, Vec<_>) =
                parked.into_iter().partition(|e| e.borrow().key() == key);
            *self.parked.elements_mut(kind) = kept;
            for element in &dropped {
                complete_once(kind, element, &mut completed);
            }
        }
        Ok(())
    }

    /// Complete an element now and stop rebuilding it this tick.
    ///
    /// Safe during an active stage: the entry is skipped for the rest of the
    /// pass and dropped when the queue is cleared.
    pub fn disable_for_rebuild(&mut self, key: ElementKey) {
        for kind in [QueueKind::Layout, QueueKind::Graphic] {
            let active = self.active == Some(kind);
            let queue = self.queue_mut(kind);
            if active {
                if let Some(entry) = queue.get_mut(&key) {
                    if !entry.disabled {
                        entry.disabled = true;
                        notify_complete(kind, &entry.element);
                    }
                }
            } else if let Some(entry) = queue.shift_remove(&key) {
                notify_complete(kind, &entry.element);
            }
        }
    }

    pub fn is_layout_phase_active(&self) -> bool {
        self.active == Some(QueueKind::Layout)
    }

    pub fn is_paint_phase_active(&self) -> bool {
        self.active == Some(QueueKind::Graphic)
    }

    pub fn is_queued_for_layout(&self, key: ElementKey) -> bool {
        self.layout_queue.contains_key(&key)
    }

    pub fn is_queued_for_graphic(&self, key: ElementKey) -> bool {
        self.graphic_queue.contains_key(&key)
    }

    pub fn layout_queue_len(&self) -> usize {
        self.layout_queue.len()
    }

    pub fn graphic_queue_len(&self) -> usize {
        self.graphic_queue.len()
    }

    /// Requests parked for the next update.
    pub fn parked_len(&self) -> usize {
        self.parked.layout.len() + self.parked.graphic.len() + self.parked.layout_dirty.len()
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut IndexMap<ElementKey, QueueEntry> {
        match kind {
            QueueKind::Layout => &mut self.layout_queue,
            QueueKind::Graphic => &mut self.graphic_queue,
        }
    }

    fn queue(&self, kind: QueueKind) -> &IndexMap<ElementKey, QueueEntry> {
        match kind {
            QueueKind::Layout => &self.layout_queue,
            QueueKind::Graphic => &self.graphic_queue,
        }
    }

    /// Run one full update: sweep, layout, cull, paint.
    pub fn perform_update(
        &mut self,
        tree: &mut Tree,
        clipper: &mut ClipperRegistry,
        materials: &StencilMaterialCache,
        config: &UiConfig,
    ) -> UpdateStats {
        let mut stats = UpdateStats::default();
        if self.shut_down {
            return stats;
        }

        let mut requests = self.parked.take();
        self.apply_requests(tree, &mut requests, &mut stats);
        stats.swept = self.clean_invalid_items(tree);

        self.active = Some(QueueKind::Layout);
        self.sort_layout_queue(tree);
        for stage in CanvasUpdate::LAYOUT_STAGES {
            self.run_stage(stage, tree, materials, config, &mut requests, &mut stats);
        }
        self.complete_queue(QueueKind::Layout);
        self.active = None;

        // Layout is final: dirty resized geometry, then cull with final rects
        self.dirty_resized_graphics(tree);
        stats.masks_clipped = clipper.cull(tree, &mut requests);
        self.apply_requests(tree, &mut requests, &mut stats);

        self.active = Some(QueueKind::Graphic);
        for stage in CanvasUpdate::PAINT_STAGES {
            self.run_stage(stage, tree, materials, config, &mut requests, &mut stats);
        }
        self.complete_queue(QueueKind::Graphic);
        self.active = None;

        stats.deferred = self.parked_len();
        log::trace!("Update finished: {:?}", stats);
        stats
    }

    /// Drop entries whose backing node is gone, completing each of them.
    fn clean_invalid_items(&mut self, tree: &Tree) -> usize {
        let mut swept = 0;
        for kind in [QueueKind::Layout, QueueKind::Graphic] {
            let queue = self.queue_mut(kind);
            let dead: Vec<ElementKey> = queue
                .iter()
                .filter(|(_, entry)| entry.element.borrow().is_destroyed(tree))
                .map(|(key, _)| *key)
                .collect();
            for key in dead {
                if let Some(entry) = queue.shift_remove(&key) {
                    log::debug!("Dropping {:?} from the {} queue: node removed", key, kind);
                    notify_complete(kind, &entry.element);
                    swept += 1;
                }
            }
        }
        swept
    }

    /// Order the layout queue root-most first, keeping request order on ties.
    fn sort_layout_queue(&mut self, tree: &Tree) {
        let depths: HashMap<ElementKey, usize> = self
            .layout_queue
            .iter()
            .map(|(key, entry)| {
                let depth = entry
                    .element
                    .borrow()
                    .node()
                    .map_or(0, |node| tree.depth(node));
                (*key, depth)
            })
            .collect();
        self.layout_queue
            .sort_by(|a, _, b, _| depths[a].cmp(&depths[b]));
    }

    fn run_stage(
        &mut self,
        stage: CanvasUpdate,
        tree: &mut Tree,
        materials: &StencilMaterialCache,
        config: &UiConfig,
        requests: &mut RebuildRequests,
        stats: &mut UpdateStats,
    ) {
        let kind = stage.queue();
        let len = self.queue(kind).len();
        for index in 0..len {
            let Some((key, entry)) = self.queue(kind).get_index(index) else {
                break;
            };
            if entry.disabled {
                continue;
            }
            let key = *key;
            let element = entry.element.clone();
            if element.borrow().is_destroyed(tree) {
                continue;
            }

            let result = match element.try_borrow_mut() {
                Ok(mut element) => {
                    let mut ctx = UpdateContext {
                        tree: &mut *tree,
                        materials,
                        config,
                        requests: &mut *requests,
                        stage: Some(stage),
                    };
                    element.rebuild(stage, &mut ctx)
                }
                Err(_) => Err(RebuildError::Borrowed),
            };

            match result {
                Ok(()) => match kind {
                    QueueKind::Layout => stats.layout_rebuilds += 1,
                    QueueKind::Graphic => stats.graphic_rebuilds += 1,
                },
                Err(err) => {
                    stats.failures += 1;
                    if config.log_rebuild_failures {
                        log::error!("Rebuild of {:?} failed during {:?}: {}", key, stage, err);
                    }
                }
            }

            self.apply_requests(tree, requests, stats);
        }
    }

    /// Apply requests collected outside an update.
    pub fn submit(&mut self, tree: &Tree, requests: &mut RebuildRequests) {
        let mut stats = UpdateStats::default();
        self.apply_requests(tree, requests, &mut stats);
    }

    fn apply_requests(
        &mut self,
        tree: &Tree,
        requests: &mut RebuildRequests,
        stats: &mut UpdateStats,
    ) {
        if requests.is_empty() {
            return;
        }
        let RebuildRequests {
            layout,
            graphic,
            disabled,
            layout_dirty,
        } = requests.take();

        for key in disabled {
            self.disable_for_rebuild(key);
        }
        for node in layout_dirty {
            if self.try_set_layout_dirty(tree, node).is_err() {
                stats.rejected += 1;
            }
        }
        for element in layout {
            self.apply_insert(QueueKind::Layout, element, stats);
        }
        for element in graphic {
            self.apply_insert(QueueKind::Graphic, element, stats);
        }
    }

    /// Queue a request nobody can observe the answer to. An element turned
    /// away because another one holds its key is completed right away.
    fn apply_insert(&mut self, kind: QueueKind, element: ElementHandle, stats: &mut UpdateStats) {
        match self.insert(kind, element.clone()) {
            Ok(true) => {}
            Ok(false) => {
                let key = element.borrow().key();
                let holder = self.queue(kind).get(&key).map(|entry| entry.element.clone());
                if holder.map_or(true, |holder| !same_element(&holder, &element)) {
                    notify_complete(kind, &element);
                }
            }
            Err(_) => stats.rejected += 1,
        }
    }

    /// Queue the graphics of nodes resized since the last update.
    fn dirty_resized_graphics(&mut self, tree: &mut Tree) {
        for node in tree.take_resized() {
            if !tree.is_active_in_hierarchy(node) {
                continue;
            }
            let Some(graphic) = tree.capabilities(node).and_then(|caps| caps.graphic.clone()) else {
                continue;
            };
            graphic.borrow_mut().set_dirty(DirtyFlags::VERTICES);
            // Cannot fail: no stage is active here
            let _ = self.insert(QueueKind::Graphic, graphic);
        }
    }

    fn complete_queue(&mut self, kind: QueueKind) {
        let queue = std::mem::take(self.queue_mut(kind));
        for (_, entry) in queue {
            if !entry.disabled {
                notify_complete(kind, &entry.element);
            }
        }
    }

    /// Complete every queued element and refuse further requests.
    pub fn shutdown(&mut self) {
        for kind in [QueueKind::Layout, QueueKind::Graphic] {
            let mut completed: Vec<ElementHandle> = self
                .queue(kind)
                .values()
                .map(|entry| entry.element.clone())
                .collect();
            self.complete_queue(kind);
            for element in std::mem::take(self.parked.elements_mut(kind)) {
                complete_once(kind, &element, &mut completed);
            }
        }
        self.parked = RebuildRequests::new();
        self.shut_down = true;
    }
}

impl Default for CanvasUpdateRegistry {
    fn default() -> Self {
        Self::new(ReentrancyPolicy::default())
    }
}

fn same_element(a: &ElementHandle, b: &ElementHandle) -> bool {
    std::ptr::eq(Rc::as_ptr(a) as *const (), Rc::as_ptr(b) as *const ())
}

/// Complete `element` unless it is already in `completed`.
fn complete_once(kind: QueueKind, element: &ElementHandle, completed: &mut Vec<ElementHandle>) {
    if completed.iter().any(|done| same_element(done, element)) {
        return;
    }
    notify_complete(kind, element);
    completed.push(element.clone());
}

fn notify_complete(kind: QueueKind, element: &ElementHandle) {
    let mut element = element.borrow_mut();
    match kind {
        QueueKind::Layout => element.layout_complete(),
        QueueKind::Graphic => element.graphic_update_complete(),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::{Rc, Weak};

    use super::*;
    use crate::element::{CanvasElement, ElementId};
    use crate::layout::{FitMode, SizeFitter};

    type CallLog = Rc<RefCell<Vec<String>>>;

    /// Element recording every callback it receives.
    struct Recorder {
        id: ElementId,
        name: &'static str,
        node: Option<NodeId>,
        log: CallLog,
        fail_during: Option<CanvasUpdate>,
        request_graphic_during: Option<CanvasUpdate>,
        disable_self_during: Option<CanvasUpdate>,
        dirty_layout_during: Option<(CanvasUpdate, NodeId)>,
        this: Weak<RefCell<Recorder>>,
    }

    fn recorder(name: &'static str, node: Option<NodeId>, log: &CallLog) -> Rc<RefCell<Recorder>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Recorder {
                id: ElementId::next(),
                name,
                node,
                log: log.clone(),
                fail_during: None,
                request_graphic_during: None,
                disable_self_during: None,
                dirty_layout_during: None,
                this: this.clone(),
            })
        })
    }

    impl CanvasElement for Recorder {
        fn key(&self) -> ElementKey {
            ElementKey::Element(self.id)
        }

        fn node(&self) -> Option<NodeId> {
            self.node
        }

        fn rebuild(
            &mut self,
            stage: CanvasUpdate,
            ctx: &mut UpdateContext<'_>,
        ) -> Result<(), RebuildError> {
            self.log
                .borrow_mut()
                .push(format!("{:?} {}", stage, self.name));
            if self.request_graphic_during == Some(stage) {
                if let Some(this) = self.this.upgrade() {
                    ctx.request_graphic_rebuild(this);
                }
            }
            if let Some((during, node)) = self.dirty_layout_during {
                if during == stage {
                    // Twice: both collapse onto one layout root
                    ctx.set_layout_dirty(node);
                    ctx.set_layout_dirty(node);
                }
            }
            if self.disable_self_during == Some(stage) {
                ctx.requests.disable(self.key());
            }
            if self.fail_during == Some(stage) {
                return Err(RebuildError::Failed("boom".into()));
            }
            Ok(())
        }

        fn layout_complete(&mut self) {
            self.log
                .borrow_mut()
                .push(format!("layout complete {}", self.name));
        }

        fn graphic_update_complete(&mut self) {
            self.log
                .borrow_mut()
                .push(format!("graphic complete {}", self.name));
        }
    }

    struct Harness {
        tree: Tree,
        registry: CanvasUpdateRegistry,
        clipper: ClipperRegistry,
        materials: StencilMaterialCache,
        config: UiConfig,
    }

    impl Harness {
        fn new(policy: ReentrancyPolicy) -> Self {
            let config = UiConfig::default().reentrancy(policy);
            Self {
                tree: Tree::new(),
                registry: CanvasUpdateRegistry::new(policy),
                clipper: ClipperRegistry::new(),
                materials: StencilMaterialCache::new(),
                config,
            }
        }

        fn update(&mut self) -> UpdateStats {
            self.registry.perform_update(
                &mut self.tree,
                &mut self.clipper,
                &self.materials,
                &self.config,
            )
        }
    }

    fn entries(log: &CallLog, needle: &str) -> usize {
        log.borrow().iter().filter(|e| e.as_str() == needle).count()
    }

    #[test]
    fn test_duplicate_requests_rebuild_once_per_stage() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let element = recorder("a", None, &log);

        assert!(h.registry.register_for_layout_rebuild(element.clone()));
        assert!(!h.registry.register_for_layout_rebuild(element.clone()));
        assert!(!h.registry.register_for_layout_rebuild(element.clone()));
        h.update();

        assert_eq!(entries(&log, "Prelayout a"), 1);
        assert_eq!(entries(&log, "Layout a"), 1);
        assert_eq!(entries(&log, "PostLayout a"), 1);
        assert_eq!(entries(&log, "layout complete a"), 1);
        assert_eq!(h.registry.layout_queue_len(), 0);
    }

    #[test]
    fn test_layout_runs_stage_major_root_first() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let root = h.tree.create("root");
        let child = h.tree.create_child(root, "child");
        let deep = recorder("deep", Some(child), &log);
        let shallow = recorder("shallow", Some(root), &log);

        h.registry.register_for_layout_rebuild(deep);
        h.registry.register_for_layout_rebuild(shallow);
        h.update();

        assert_eq!(
            *log.borrow(),
            vec![
                "Prelayout shallow",
                "Prelayout deep",
                "Layout shallow",
                "Layout deep",
                "PostLayout shallow",
                "PostLayout deep",
                "layout complete shallow",
                "layout complete deep",
            ]
        );
    }

    #[test]
    fn test_failure_is_isolated_to_one_element() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let bad = recorder("bad", None, &log);
        bad.borrow_mut().fail_during = Some(CanvasUpdate::PreRender);
        let good = recorder("good", None, &log);

        h.registry.register_for_graphic_rebuild(bad);
        h.registry.register_for_graphic_rebuild(good);
        let stats = h.update();

        assert_eq!(stats.failures, 1);
        assert_eq!(entries(&log, "PreRender good"), 1);
        assert_eq!(entries(&log, "LatePreRender bad"), 1);
        assert_eq!(entries(&log, "graphic complete bad"), 1);
        assert_eq!(entries(&log, "graphic complete good"), 1);
    }

    #[test]
    fn test_removed_node_is_swept_with_one_completion() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let node = h.tree.create("node");
        let element = recorder("gone", Some(node), &log);

        h.registry.register_for_layout_rebuild(element.clone());
        h.registry.register_for_graphic_rebuild(element);
        h.tree.remove(node);
        let stats = h.update();

        assert_eq!(stats.swept, 2);
        assert_eq!(
            *log.borrow(),
            vec!["layout complete gone", "graphic complete gone"]
        );
    }

    #[test]
    fn test_paint_reentrancy_is_deferred_to_next_update() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let element = recorder("again", None, &log);
        element.borrow_mut().request_graphic_during = Some(CanvasUpdate::PreRender);

        h.registry.register_for_graphic_rebuild(element.clone());
        let stats = h.update();
        assert_eq!(entries(&log, "PreRender again"), 1);
        assert_eq!(stats.deferred, 1);

        element.borrow_mut().request_graphic_during = None;
        h.update();
        assert_eq!(entries(&log, "PreRender again"), 2);
        assert_eq!(h.registry.parked_len(), 0);
    }

    #[test]
    fn test_paint_reentrancy_rejected_under_reject_policy() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Reject);
        let element = recorder("again", None, &log);
        element.borrow_mut().request_graphic_during = Some(CanvasUpdate::PreRender);

        h.registry.register_for_graphic_rebuild(element);
        let stats = h.update();
        assert_eq!(stats.rejected, 1);

        h.update();
        assert_eq!(entries(&log, "PreRender again"), 1);
    }

    #[test]
    fn test_graphic_request_during_layout_joins_same_update() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Reject);
        let element = recorder("both", None, &log);
        element.borrow_mut().request_graphic_during = Some(CanvasUpdate::Layout);

        h.registry.register_for_layout_rebuild(element);
        let stats = h.update();

        assert_eq!(stats.rejected, 0);
        assert_eq!(entries(&log, "PreRender both"), 1);
    }

    #[test]
    fn test_unregister_all_completes_and_removes() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let element = recorder("x", None, &log);
        let handle: ElementHandle = element.clone();

        h.registry.register_for_graphic_rebuild(element);
        assert_eq!(h.registry.unregister_all(&handle), Ok(()));
        h.update();

        assert_eq!(*log.borrow(), vec!["graphic complete x"]);
    }

    #[test]
    fn test_disable_mid_pass_skips_remaining_stages() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let element = recorder("quit", None, &log);
        element.borrow_mut().disable_self_during = Some(CanvasUpdate::Prelayout);

        h.registry.register_for_layout_rebuild(element);
        h.update();

        assert_eq!(
            *log.borrow(),
            vec!["Prelayout quit", "layout complete quit"]
        );
    }

    #[test]
    fn test_shutdown_completes_and_refuses() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let element = recorder("late", None, &log);
        h.registry.register_for_layout_rebuild(element.clone());

        h.registry.shutdown();
        assert_eq!(*log.borrow(), vec!["layout complete late"]);
        assert_eq!(
            h.registry.try_register_for_graphic_rebuild(element),
            Err(RegistryError::ShutDown)
        );
    }

    /// Node carrying a self-sizing controller, so it is its own layout root.
    fn fitted_node(tree: &mut Tree) -> NodeId {
        let node = tree.create("panel");
        if let Some(caps) = tree.capabilities_mut(node) {
            caps.layout_controllers.push(Rc::new(RefCell::new(SizeFitter::new(
                FitMode::Unconstrained,
                FitMode::Unconstrained,
            ))));
        }
        node
    }

    #[test]
    fn test_layout_dirty_during_layout_runs_next_update() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let panel = fitted_node(&mut h.tree);
        let trigger = recorder("trigger", None, &log);
        trigger.borrow_mut().dirty_layout_during = Some((CanvasUpdate::Layout, panel));

        h.registry.register_for_layout_rebuild(trigger.clone());
        let stats = h.update();
        assert_eq!(stats.deferred, 2);
        assert_eq!(h.registry.layout_pool().active_count(), 0);

        trigger.borrow_mut().dirty_layout_during = None;
        let stats = h.update();
        // One rebuilder for the root, called in all three layout stages
        assert_eq!(stats.layout_rebuilds, 3);
        assert_eq!(h.registry.parked_len(), 0);
        assert_eq!(h.registry.layout_pool().active_count(), 0);
    }

    #[test]
    fn test_layout_dirty_during_layout_rejected_under_reject_policy() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Reject);
        let panel = fitted_node(&mut h.tree);
        let trigger = recorder("trigger", None, &log);
        trigger.borrow_mut().dirty_layout_during = Some((CanvasUpdate::Layout, panel));

        h.registry.register_for_layout_rebuild(trigger);
        let stats = h.update();
        assert_eq!(stats.rejected, 2);

        let stats = h.update();
        assert_eq!(stats.layout_rebuilds, 0);
        assert_eq!(h.registry.layout_pool().active_count(), 0);
    }

    #[test]
    fn test_layout_dirty_during_paint_is_queued_for_next_update() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Reject);
        let panel = fitted_node(&mut h.tree);
        let painter = recorder("painter", None, &log);
        painter.borrow_mut().dirty_layout_during = Some((CanvasUpdate::PreRender, panel));

        h.registry.register_for_graphic_rebuild(painter);
        let stats = h.update();
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.layout_rebuilds, 0);
        assert!(h.registry.is_queued_for_layout(ElementKey::LayoutRoot(panel)));
        assert_eq!(h.registry.layout_pool().active_count(), 1);

        let stats = h.update();
        assert_eq!(stats.layout_rebuilds, 3);
        assert_eq!(h.registry.layout_pool().active_count(), 0);
    }

    #[test]
    fn test_unregister_all_completes_parked_request() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let element = recorder("again", None, &log);
        element.borrow_mut().request_graphic_during = Some(CanvasUpdate::PreRender);
        let handle: ElementHandle = element.clone();

        h.registry.register_for_graphic_rebuild(element.clone());
        h.update();
        assert_eq!(h.registry.parked_len(), 1);

        assert_eq!(h.registry.unregister_all(&handle), Ok(()));
        assert_eq!(h.registry.parked_len(), 0);
        assert_eq!(entries(&log, "graphic complete again"), 2);

        element.borrow_mut().request_graphic_during = None;
        h.update();
        assert_eq!(entries(&log, "PreRender again"), 1);
    }

    #[test]
    fn test_turned_away_stand_in_is_completed() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let original = recorder("original", None, &log);
        let twin = recorder("twin", None, &log);
        twin.borrow_mut().id = original.borrow().id;

        h.registry.register_for_graphic_rebuild(original.clone());
        let mut requests = RebuildRequests::new();
        requests.request_graphic(original);
        requests.request_graphic(twin);
        h.registry.submit(&h.tree, &mut requests);

        assert_eq!(*log.borrow(), vec!["graphic complete twin"]);
        assert_eq!(h.registry.graphic_queue_len(), 1);
    }

    #[test]
    fn test_shutdown_completes_parked_requests() {
        let log = CallLog::default();
        let mut h = Harness::new(ReentrancyPolicy::Defer);
        let element = recorder("again", None, &log);
        element.borrow_mut().request_graphic_during = Some(CanvasUpdate::PreRender);

        h.registry.register_for_graphic_rebuild(element);
        h.update();
        h.registry.shutdown();

        assert_eq!(entries(&log, "graphic complete again"), 2);
        assert_eq!(h.registry.parked_len(), 0);
    }
}
