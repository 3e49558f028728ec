//! Registry of the rect masks that run every cull stage.

use indexmap::IndexMap;

use crate::clip::RectMask;
use crate::element::RebuildRequests;
use crate::tree::{NodeId, Shared, Tree};

/// Active rect masks, keyed by their node.
#[derive(Default)]
pub struct ClipperRegistry {
    clippers: IndexMap<NodeId, Shared<RectMask>>,
}

impl ClipperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start culling with `mask`. Returns false if its node already has a
    /// registered mask.
    pub fn register(&mut self, mask: Shared<RectMask>) -> bool {
        let node = mask.borrow().node();
        if self.clippers.contains_key(&node) {
            return false;
        }
        mask.borrow_mut().activate();
        self.clippers.insert(node, mask);
        true
    }

    /// Stop culling with the mask on `node`, resetting its targets.
    pub fn unregister(
        &mut self,
        node: NodeId,
        requests: &mut RebuildRequests,
    ) -> Option<Shared<RectMask>> {
        let mask = self.clippers.shift_remove(&node)?;
        mask.borrow_mut().deactivate(requests);
        Some(mask)
    }

    pub fn is_registered(&self, node: NodeId) -> bool {
        self.clippers.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.clippers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clippers.is_empty()
    }

    /// Run one clipping pass on every registered mask.
    ///
    /// Masks whose node left the hierarchy are dropped. Returns how many
    /// masks performed clipping.
    pub fn cull(&mut self, tree: &Tree, requests: &mut RebuildRequests) -> usize {
        let dead: Vec<NodeId> = self
            .clippers
            .keys()
            .copied()
            .filter(|&node| !tree.contains(node))
            .collect();
        for node in dead {
            log::debug!("Dropping rect mask of removed node {:?}", node);
            self.unregister(node, requests);
        }

        let mut clipped = 0;
        for mask in self.clippers.values() {
            match mask.try_borrow_mut() {
                Ok(mut mask) => {
                    if mask.perform_clipping(tree, requests) {
                        clipped += 1;
                    }
                }
                Err(_) => log::warn!("Skipping a rect mask that is borrowed during culling"),
            }
        }
        clipped
    }

    /// Deactivate every mask.
    pub fn clear(&mut self, requests: &mut RebuildRequests) {
        for (_, mask) in self.clippers.drain(..) {
            mask.borrow_mut().deactivate(requests);
        }
    }
}
