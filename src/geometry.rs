//! Value types shared by the layout and clipping passes.
//!
//! All rectangles handed between components live in one shared space, the
//! root canvas space. Conversions from local transforms into that space are
//! the responsibility of the hierarchy owner.

/// Layout axis. Layout always resolves `Horizontal` before `Vertical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Horizontal,
    Vertical,
}

impl Axis {
    /// Both axes in the order the layout pass visits them.
    pub const ALL: [Axis; 2] = [Axis::Horizontal, Axis::Vertical];

    pub fn index(self) -> usize {
        match self {
            Axis::Horizontal => 0,
            Axis::Vertical => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn along(&self, axis: Axis) -> f32 {
        match axis {
            Axis::Horizontal => self.width,
            Axis::Vertical => self.height,
        }
    }
}

/// Edge insets, used as rect mask padding.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Insets {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Insets {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn uniform(amount: f32) -> Self {
        Self::new(amount, amount, amount, amount)
    }
}

/// Axis-aligned rectangle: origin plus extent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub const ZERO: Rect = Rect::new(0.0, 0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a rect from its edges. The result may have a non-positive extent.
    pub fn from_edges(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self::new(x_min, y_min, x_max - x_min, y_max - y_min)
    }

    pub fn x_min(&self) -> f32 {
        self.x
    }

    pub fn y_min(&self) -> f32 {
        self.y
    }

    pub fn x_max(&self) -> f32 {
        self.x + self.width
    }

    pub fn y_max(&self) -> f32 {
        self.y + self.height
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Strict overlap test: rects that only share an edge do not overlap.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.x_max()
            && self.x_max() > other.x
            && self.y < other.y_max()
            && self.y_max() > other.y
    }

    /// Intersection of two rects, or `None` when the overlap has no area.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let rect = Rect::from_edges(
            self.x.max(other.x),
            self.y.max(other.y),
            self.x_max().min(other.x_max()),
            self.y_max().min(other.y_max()),
        );
        (!rect.is_empty()).then_some(rect)
    }

    /// Shrink each edge inwards by the given insets.
    pub fn inset_by(&self, insets: Insets) -> Rect {
        Rect::from_edges(
            self.x + insets.left,
            self.y + insets.top,
            self.x_max() - insets.right,
            self.y_max() - insets.bottom,
        )
    }

    pub fn size_along(&self, axis: Axis) -> f32 {
        self.size().along(axis)
    }

    /// Copy of this rect with its extent along `axis` replaced.
    pub fn with_size_along(&self, axis: Axis, size: f32) -> Rect {
        match axis {
            Axis::Horizontal => Rect { width: size, ..*self },
            Axis::Vertical => Rect {
                height: size,
                ..*self
            },
        }
    }
}
