//! Points, axis-aligned bounds and affine transforms in layer space.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Component-wise minimum.
    pub fn min(self, other: Point) -> Point {
        Point::new(self.x.min(other.x), self.y.min(other.y))
    }

    /// Component-wise maximum.
    pub fn max(self, other: Point) -> Point {
        Point::new(self.x.max(other.x), self.y.max(other.y))
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min: Point,
    pub max: Point,
}

impl Rect {
    pub fn new(min: Point, max: Point) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// Smallest rect containing every point, or `None` for no points.
    pub fn from_points(points: impl IntoIterator<Item = Point>) -> Option<Rect> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        Some(iter.fold(Rect::new(first, first), |r, p| r.include(p)))
    }

    pub fn include(self, p: Point) -> Rect {
        Rect {
            min: self.min.min(p),
            max: self.max.max(p),
        }
    }

    pub fn union(self, other: Rect) -> Rect {
        Rect {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grow by `margin` on every side.
    pub fn inflate(self, margin: f64) -> Rect {
        Rect {
            min: Point::new(self.min.x - margin, self.min.y - margin),
            max: Point::new(self.max.x + margin, self.max.y + margin),
        }
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }
}

/// 2D affine transform `[m11 m12; m21 m22] * p + (dx, dy)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub m11: f64,
    pub m12: f64,
    pub m21: f64,
    pub m22: f64,
    pub dx: f64,
    pub dy: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        m11: 1.0,
        m12: 0.0,
        m21: 0.0,
        m22: 1.0,
        dx: 0.0,
        dy: 0.0,
    };

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            dx,
            dy,
            ..Self::IDENTITY
        }
    }

    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.m11 * p.x + self.m12 * p.y + self.dx,
            self.m21 * p.x + self.m22 * p.y + self.dy,
        )
    }

    /// `self` followed by `next`.
    pub fn then(&self, next: &Transform) -> Transform {
        Transform {
            m11: next.m11 * self.m11 + next.m12 * self.m21,
            m12: next.m11 * self.m12 + next.m12 * self.m22,
            m21: next.m21 * self.m11 + next.m22 * self.m21,
            m22: next.m21 * self.m12 + next.m22 * self.m22,
            dx: next.m11 * self.dx + next.m12 * self.dy + next.dx,
            dy: next.m21 * self.dx + next.m22 * self.dy + next.dy,
        }
    }

    /// `self` followed by a translation.
    pub fn then_translate(&self, dx: f64, dy: f64) -> Transform {
        self.then(&Transform::translation(dx, dy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rect_union() {
        let a = Rect::new(Point::new(0.0, 0.0), Point::new(1.0, 1.0));
        let b = Rect::new(Point::new(-1.0, 0.5), Point::new(0.5, 3.0));
        let u = a.union(b);
        assert_eq!(u.min, Point::new(-1.0, 0.0));
        assert_eq!(u.max, Point::new(1.0, 3.0));
        assert_eq!(u.width(), 2.0);
    }

    #[test]
    fn test_rect_normalizes_corners() {
        let r = Rect::new(Point::new(3.0, 4.0), Point::new(1.0, 2.0));
        assert_eq!(r.min, Point::new(1.0, 2.0));
        assert_eq!(r.max, Point::new(3.0, 4.0));
    }

    #[test]
    fn test_transform_compose() {
        let t = Transform::translation(1.0, 2.0).then_translate(-3.0, 0.5);
        assert_eq!(t.apply(Point::ORIGIN), Point::new(-2.0, 2.5));
    }

    proptest! {
        #[test]
        fn prop_translations_compose_additively(
            ax in -1e3f64..1e3, ay in -1e3f64..1e3,
            bx in -1e3f64..1e3, by in -1e3f64..1e3,
            px in -1e3f64..1e3, py in -1e3f64..1e3,
        ) {
            let composed = Transform::translation(ax, ay).then_translate(bx, by);
            let p = composed.apply(Point::new(px, py));
            prop_assert!((p.x - (px + ax + bx)).abs() < 1e-6);
            prop_assert!((p.y - (py + ay + by)).abs() < 1e-6);
        }

        #[test]
        fn prop_union_contains_both(
            x1 in -1e3f64..1e3, y1 in -1e3f64..1e3, x2 in -1e3f64..1e3, y2 in -1e3f64..1e3,
            x3 in -1e3f64..1e3, y3 in -1e3f64..1e3, x4 in -1e3f64..1e3, y4 in -1e3f64..1e3,
        ) {
            let a = Rect::new(Point::new(x1, y1), Point::new(x2, y2));
            let b = Rect::new(Point::new(x3, y3), Point::new(x4, y4));
            let u = a.union(b);
            prop_assert!(u.min.x <= a.min.x && u.min.x <= b.min.x);
            prop_assert!(u.max.y >= a.max.y && u.max.y >= b.max.y);
        }
    }
}
