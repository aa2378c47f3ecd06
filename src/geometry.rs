//! Axis-aligned box geometry.

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box: top-left corner plus width and height.
///
/// All boxes handed to the engine must share one coordinate space (pixels or
/// normalized 0..1); the overlap ratio is scale-free so either works.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Build a box from two corners, in either order.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            w: (x2 - x1).abs(),
            h: (y2 - y1).abs(),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    /// Finite coordinates and non-negative extent.
    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.w, self.h].iter().all(|v| v.is_finite())
            && self.w >= 0.0
            && self.h >= 0.0
    }

    pub fn area(&self) -> f32 {
        if !self.is_valid() {
            return 0.0;
        }
        self.w * self.h
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }
}

/// Intersection area divided by the area of the smaller box.
///
/// Returns 0.0 for disjoint boxes and whenever either box is degenerate
/// (zero area or non-finite). The result is clamped to [0, 1].
pub fn overlap_ratio(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let smaller = a.area().min(b.area());
    if !smaller.is_finite() || smaller <= 0.0 {
        return 0.0;
    }
    let inter = a.intersection_area(b);
    if inter <= 0.0 {
        return 0.0;
    }
    (inter / smaller).clamp(0.0, 1.0)
}
