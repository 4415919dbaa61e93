//! Geometry helpers for node placement and motion.
//!
//! Contains helper functions for:
//! - Distance calculations
//! - Axis-aligned bounds with inclusive containment
//! - Reflecting a moving point back into its bounds

use serde::{Deserialize, Serialize};

use super::types::Point;

/// Squared Euclidean distance in square metres.
pub fn distance2(a: &Point, b: &Point) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    dx * dx + dy * dy
}

/// Euclidean distance in metres.
///
/// The link budget works on the real distance, since path loss grows with
/// its logarithm.
pub fn distance(a: &Point, b: &Point) -> f64 {
    distance2(a, b).sqrt()
}

/// Axis-aligned rectangle `[min_x, max_x] × [min_y, max_y]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Bounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Self {
        Self { min_x, max_x, min_y, max_y }
    }

    /// A square centred on the origin with the given half side.
    pub fn square(half_side: f64) -> Self {
        Self::new(-half_side, half_side, -half_side, half_side)
    }

    pub fn is_valid(&self) -> bool {
        [self.min_x, self.max_x, self.min_y, self.max_y].iter().all(|v| v.is_finite()) && self.min_x < self.max_x && self.min_y < self.max_y
    }

    /// Inclusive point-in-rectangle test.
    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    /// Same as [`Bounds::contains`] but allows overshooting by `epsilon`.
    pub fn contains_with_margin(&self, p: &Point, epsilon: f64) -> bool {
        p.x >= self.min_x - epsilon && p.x <= self.max_x + epsilon && p.y >= self.min_y - epsilon && p.y <= self.max_y + epsilon
    }
}

/// Reflect `position` back into `bounds`, flipping the matching velocity
/// component for every wall that was crossed.
///
/// Returns the reflected position and velocity. A point already inside is
/// returned unchanged.
pub fn reflect(bounds: &Bounds, position: Point, velocity: (f64, f64)) -> (Point, (f64, f64)) {
    let (x, vx) = reflect_axis(position.x, velocity.0, bounds.min_x, bounds.max_x);
    let (y, vy) = reflect_axis(position.y, velocity.1, bounds.min_y, bounds.max_y);
    (Point::new(x, y), (vx, vy))
}

fn reflect_axis(value: f64, speed: f64, min: f64, max: f64) -> (f64, f64) {
    if value < min {
        ((2.0 * min - value).min(max), speed.abs())
    } else if value > max {
        ((2.0 * max - value).max(min), -speed.abs())
    } else {
        (value, speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert_eq!(distance2(&a, &b), 25.0);
        assert_eq!(distance(&a, &b), 5.0);
    }

    #[test]
    fn containment_is_inclusive() {
        let bounds = Bounds::square(90.0);
        assert!(bounds.contains(&Point::new(90.0, -90.0)));
        assert!(!bounds.contains(&Point::new(90.1, 0.0)));
        assert!(bounds.contains_with_margin(&Point::new(90.4, 0.0), 0.5));
        assert!(bounds.is_valid());
        assert!(!Bounds::new(1.0, 0.0, 0.0, 1.0).is_valid());
    }

    #[test]
    fn reflection_mirrors_position_and_reverses_velocity() {
        let bounds = Bounds::square(10.0);
        let (p, v) = reflect(&bounds, Point::new(10.3, 2.0), (3.0, 1.0));
        assert!((p.x - 9.7).abs() < 1e-9);
        assert_eq!(p.y, 2.0);
        assert_eq!(v, (-3.0, 1.0));

        let (p, v) = reflect(&bounds, Point::new(0.0, -10.2), (0.5, -2.0));
        assert!((p.y + 9.8).abs() < 1e-9);
        assert_eq!(v, (0.5, 2.0));

        let inside = Point::new(1.0, 1.0);
        assert_eq!(reflect(&bounds, inside, (1.0, 1.0)), (inside, (1.0, 1.0)));
    }
}
