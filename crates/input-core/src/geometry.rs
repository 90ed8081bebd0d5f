//! Rectangles and the linear frame transform used for diverted pointer
//! remapping.
//!
//! All absolute pointer coordinates in the daemon live in one canonical
//! range, `0..=32767`, regardless of what the physical device reports.
//! Tablets are rescaled into it at the device layer; diversion source and
//! destination frames are expressed in it; the auto-switch edge detector
//! compares against its extremes.

use thiserror::Error;

/// Lowest canonical absolute coordinate.
pub const ABS_RANGE_MIN: i32 = 0;
/// Highest canonical absolute coordinate (2^15 - 1).
pub const ABS_RANGE_MAX: i32 = 0x7FFF;

/// Clamps a tracked floating-point pointer coordinate into canonical range.
pub fn clamp_abs(v: f64) -> f64 {
    v.clamp(ABS_RANGE_MIN as f64, ABS_RANGE_MAX as f64)
}

/// Error type for frame geometry validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    /// A frame rectangle has zero width or zero height.
    #[error("degenerate frame: zero width or height")]
    DegenerateFrame,
}

/// An axis-aligned rectangle in canonical absolute coordinates.
///
/// Callers may supply corners in any order; [`Rect::normalized`] reorders
/// them so that `x1 < x2` and `y1 < y2`, which every stored frame relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// True when either axis spans zero units.
    pub fn is_degenerate(&self) -> bool {
        self.x1 == self.x2 || self.y1 == self.y2
    }

    /// Returns the same rectangle with corners reordered per axis so that
    /// `x1 < x2` and `y1 < y2`.
    pub fn normalized(&self) -> Self {
        Self {
            x1: self.x1.min(self.x2),
            x2: self.x1.max(self.x2),
            y1: self.y1.min(self.y2),
            y2: self.y1.max(self.y2),
        }
    }

    /// Inclusive containment test.  Assumes a normalized rectangle.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
}

/// Linear map from a source frame into a destination frame.
///
/// Diverted pointer events inside the owner's source frame are rescaled
/// into the target domain's destination frame with this transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTransform {
    pub src: Rect,
    pub dst: Rect,
}

impl FrameTransform {
    /// Builds a transform from two frames, normalizing both.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::DegenerateFrame`] when either frame has zero
    /// width or height.
    pub fn new(src: Rect, dst: Rect) -> Result<Self, GeometryError> {
        if src.is_degenerate() || dst.is_degenerate() {
            return Err(GeometryError::DegenerateFrame);
        }
        Ok(Self {
            src: src.normalized(),
            dst: dst.normalized(),
        })
    }

    /// True when the point lies inside the source frame.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.src.contains(x, y)
    }

    /// Maps one X coordinate from the source frame into the destination.
    pub fn apply_x(&self, x: i32) -> i32 {
        scale_axis(x, self.src.x1, self.src.x2, self.dst.x1, self.dst.x2)
    }

    /// Maps one Y coordinate from the source frame into the destination.
    pub fn apply_y(&self, y: i32) -> i32 {
        scale_axis(y, self.src.y1, self.src.y2, self.dst.y1, self.dst.y2)
    }

    /// Maps a point from the source frame into the destination frame.
    pub fn apply(&self, x: i32, y: i32) -> (i32, i32) {
        (self.apply_x(x), self.apply_y(y))
    }

    /// The inverse transform (destination frame back into source frame).
    pub fn inverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

fn scale_axis(v: i32, s1: i32, s2: i32, d1: i32, d2: i32) -> i32 {
    let num = (v - s1) as f64 * (d2 - d1) as f64;
    d1 + (num / (s2 - s1) as f64).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_transform() -> FrameTransform {
        FrameTransform::new(Rect::new(0, 0, 16384, 16384), Rect::new(0, 0, 32767, 32767))
            .expect("valid frames")
    }

    // ── Rect ──────────────────────────────────────────────────────────────────

    #[test]
    fn test_normalized_reorders_each_axis_independently() {
        let r = Rect::new(100, 5, 10, 50).normalized();
        assert_eq!(r, Rect::new(10, 5, 100, 50));
    }

    #[test]
    fn test_normalized_is_identity_for_ordered_rect() {
        let r = Rect::new(1, 2, 3, 4);
        assert_eq!(r.normalized(), r);
    }

    #[test]
    fn test_degenerate_detection() {
        assert!(Rect::new(5, 0, 5, 10).is_degenerate());
        assert!(Rect::new(0, 7, 10, 7).is_degenerate());
        assert!(!Rect::new(0, 0, 1, 1).is_degenerate());
    }

    #[test]
    fn test_contains_is_inclusive_on_edges() {
        let r = Rect::new(10, 10, 20, 20);
        assert!(r.contains(10, 10));
        assert!(r.contains(20, 20));
        assert!(!r.contains(9, 15));
        assert!(!r.contains(15, 21));
    }

    // ── FrameTransform ────────────────────────────────────────────────────────

    #[test]
    fn test_new_rejects_degenerate_source() {
        let result = FrameTransform::new(Rect::new(0, 0, 0, 100), Rect::new(0, 0, 10, 10));
        assert_eq!(result, Err(GeometryError::DegenerateFrame));
    }

    #[test]
    fn test_new_rejects_degenerate_destination() {
        let result = FrameTransform::new(Rect::new(0, 0, 10, 10), Rect::new(5, 5, 5, 9));
        assert_eq!(result, Err(GeometryError::DegenerateFrame));
    }

    #[test]
    fn test_new_normalizes_unordered_frames() {
        let t = FrameTransform::new(Rect::new(100, 100, 0, 0), Rect::new(50, 80, 10, 20))
            .expect("valid frames");
        assert_eq!(t.src, Rect::new(0, 0, 100, 100));
        assert_eq!(t.dst, Rect::new(10, 20, 50, 80));
    }

    #[test]
    fn test_apply_maps_corners_to_corners() {
        let t = make_transform();
        assert_eq!(t.apply(0, 0), (0, 0));
        assert_eq!(t.apply(16384, 16384), (32767, 32767));
    }

    #[test]
    fn test_apply_maps_midpoint() {
        let t = FrameTransform::new(Rect::new(0, 0, 100, 100), Rect::new(0, 0, 1000, 1000))
            .expect("valid frames");
        assert_eq!(t.apply(50, 50), (500, 500));
    }

    #[test]
    fn test_apply_with_offset_frames() {
        let t = FrameTransform::new(Rect::new(100, 100, 200, 200), Rect::new(0, 0, 50, 50))
            .expect("valid frames");
        assert_eq!(t.apply(100, 200), (0, 50));
        assert_eq!(t.apply(150, 150), (25, 25));
    }

    #[test]
    fn test_round_trip_within_one_unit() {
        // Scaling into the destination and back must land within rounding
        // error of the original coordinate.
        let t = FrameTransform::new(Rect::new(0, 0, 32767, 32767), Rect::new(100, 200, 7000, 9000))
            .expect("valid frames");
        let inv = t.inverse();
        for &(x, y) in &[(0, 0), (1, 1), (12345, 23456), (32767, 32767), (777, 31000)] {
            let (fx, fy) = t.apply(x, y);
            let (bx, by) = inv.apply(fx, fy);
            assert!((bx - x).abs() <= 1, "x round trip: {x} -> {fx} -> {bx}");
            assert!((by - y).abs() <= 1, "y round trip: {y} -> {fy} -> {by}");
        }
    }

    #[test]
    fn test_clamp_abs_limits_to_canonical_range() {
        assert_eq!(clamp_abs(-15.0), 0.0);
        assert_eq!(clamp_abs(40000.0), ABS_RANGE_MAX as f64);
        assert_eq!(clamp_abs(123.5), 123.5);
    }
}
