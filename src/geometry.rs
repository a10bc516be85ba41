//! Box versus survey geometry and the line of sight each one implies.

use crate::Vector3;

/// Cartesian axis used as the fixed line of sight in box mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Axis {
    X,
    Y,
    #[default]
    Z,
}

impl Axis {
    pub fn index(&self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn unit(&self) -> Vector3 {
        let mut v = Vector3::zeros();
        v[self.index()] = 1.0;
        v
    }
}

/// Periodic simulation box or observed survey.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Geometry {
    /// Periodic cube; redshift-space distortions act along a fixed axis.
    Box { line_of_sight: Axis },
    /// Survey seen from `observer` (box coordinates); the line of sight is radial.
    Survey { observer: Vector3 },
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry::Box {
            line_of_sight: Axis::Z,
        }
    }
}

impl Geometry {
    pub fn is_periodic(&self) -> bool {
        matches!(self, Geometry::Box { .. })
    }

    pub fn observer(&self) -> Option<Vector3> {
        match self {
            Geometry::Survey { observer } => Some(*observer),
            Geometry::Box { .. } => None,
        }
    }

    /// Unit line-of-sight vector at `p` (radial in survey mode, zero at the observer).
    pub fn line_of_sight(&self, p: &Vector3) -> Vector3 {
        match self {
            Geometry::Box { line_of_sight } => line_of_sight.unit(),
            Geometry::Survey { observer } => {
                let d = p - observer;
                let r = d.norm();
                if r > 0.0 {
                    d / r
                } else {
                    Vector3::zeros()
                }
            }
        }
    }
}
