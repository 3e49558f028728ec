//! Generic layout capabilities that only rely on the layout protocol.

use crate::error::RebuildError;
use crate::geometry::Axis;
use crate::layout::{utility, ControllerRole, LayoutController, LayoutElement};
use crate::tree::{NodeId, Tree};

/// How a [`SizeFitter`] sizes its node along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMode {
    /// Leave the size alone.
    #[default]
    Unconstrained,
    MinSize,
    PreferredSize,
}

/// Self-sizing controller resizing its node to the resolved layout sizes.
#[derive(Debug, Clone)]
pub struct SizeFitter {
    pub horizontal: FitMode,
    pub vertical: FitMode,
    pub enabled: bool,
}

impl SizeFitter {
    pub fn new(horizontal: FitMode, vertical: FitMode) -> Self {
        Self {
            horizontal,
            vertical,
            enabled: true,
        }
    }

    fn fit_mode(&self, axis: Axis) -> FitMode {
        match axis {
            Axis::Horizontal => self.horizontal,
            Axis::Vertical => self.vertical,
        }
    }
}

impl LayoutController for SizeFitter {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn role(&self) -> ControllerRole {
        ControllerRole::SelfSizing
    }

    fn set_layout(
        &mut self,
        axis: Axis,
        node: NodeId,
        tree: &mut Tree,
    ) -> Result<(), RebuildError> {
        let size = match self.fit_mode(axis) {
            FitMode::Unconstrained => return Ok(()),
            FitMode::MinSize => utility::min_size(tree, node, axis),
            FitMode::PreferredSize => utility::preferred_size(tree, node, axis),
        };
        let rect = tree.rect(node).with_size_along(axis, size);
        tree.set_rect(node, rect);
        Ok(())
    }
}

/// Layout element with explicitly set sizes.
///
/// Unset properties are negative, so other elements on the node keep
/// deciding them. The default priority of 1 overrides content-driven
/// elements, which report at priority 0.
#[derive(Debug, Clone)]
pub struct LayoutOverrides {
    pub min: [f32; 2],
    pub preferred: [f32; 2],
    pub flexible: [f32; 2],
    pub priority: i32,
    pub ignore_layout: bool,
    pub enabled: bool,
}

impl Default for LayoutOverrides {
    fn default() -> Self {
        Self {
            min: [-1.0; 2],
            preferred: [-1.0; 2],
            flexible: [-1.0; 2],
            priority: 1,
            ignore_layout: false,
            enabled: true,
        }
    }
}

impl LayoutOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(mut self, axis: Axis, value: f32) -> Self {
        self.min[axis.index()] = value;
        self
    }

    pub fn preferred(mut self, axis: Axis, value: f32) -> Self {
        self.preferred[axis.index()] = value;
        self
    }

    pub fn flexible(mut self, axis: Axis, value: f32) -> Self {
        self.flexible[axis.index()] = value;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn ignore_layout(mut self, ignore: bool) -> Self {
        self.ignore_layout = ignore;
        self
    }
}

impl LayoutElement for LayoutOverrides {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn calculate_layout_input(
        &mut self,
        _axis: Axis,
        _node: NodeId,
        _tree: &Tree,
    ) -> Result<(), RebuildError> {
        Ok(())
    }

    fn min_size(&self, axis: Axis) -> f32 {
        self.min[axis.index()]
    }

    fn preferred_size(&self, axis: Axis) -> f32 {
        self.preferred[axis.index()]
    }

    fn flexible_size(&self, axis: Axis) -> f32 {
        self.flexible[axis.index()]
    }

    fn layout_priority(&self) -> i32 {
        self.priority
    }

    fn ignore_layout(&self) -> bool {
        self.ignore_layout
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::geometry::Rect;
    use crate::layout::rebuild_layout;

    #[test]
    fn test_fitter_uses_resolved_sizes() {
        let mut tree = Tree::new();
        let node = tree.create("label");
        tree.set_rect(node, Rect::new(5.0, 5.0, 1.0, 1.0));
        if let Some(caps) = tree.capabilities_mut(node) {
            caps.layout_elements.push(Rc::new(RefCell::new(
                LayoutOverrides::new()
                    .min(Axis::Horizontal, 40.0)
                    .preferred(Axis::Horizontal, 120.0)
                    .min(Axis::Vertical, 30.0),
            )));
            caps.layout_elements.push(Rc::new(RefCell::new(
                LayoutOverrides::new()
                    .preferred(Axis::Horizontal, 90.0)
                    .priority(0),
            )));
            caps.layout_controllers.push(Rc::new(RefCell::new(SizeFitter::new(
                FitMode::PreferredSize,
                FitMode::MinSize,
            ))));
        }

        rebuild_layout(&mut tree, node).unwrap();

        assert_eq!(tree.rect(node), Rect::new(5.0, 5.0, 120.0, 30.0));
    }

    #[test]
    fn test_preferred_is_at_least_min() {
        let mut tree = Tree::new();
        let node = tree.create("node");
        if let Some(caps) = tree.capabilities_mut(node) {
            caps.layout_elements.push(Rc::new(RefCell::new(
                LayoutOverrides::new()
                    .min(Axis::Vertical, 50.0)
                    .preferred(Axis::Vertical, 20.0),
            )));
        }
        assert_eq!(utility::preferred_size(&tree, node, Axis::Vertical), 50.0);
        assert_eq!(utility::flexible_size(&tree, node, Axis::Vertical), 0.0);
    }
}
