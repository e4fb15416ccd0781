//! Three-dimensional shapes for grids and threadgroups.

use serde::{Deserialize, Serialize};

use crate::error::ValidationFailure;

/// Width, height and depth of a thread grid or a threadgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size3D {
    /// Extent along x.
    pub width: u32,
    /// Extent along y.
    pub height: u32,
    /// Extent along z.
    pub depth: u32,
}

impl Size3D {
    /// A 1x1x1 shape.
    pub const ONE: Self = Self::new(1, 1, 1);

    /// Creates a shape.
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// A one-dimensional shape `width x 1 x 1`.
    pub const fn linear(width: u32) -> Self {
        Self::new(width, 1, 1)
    }

    /// Returns the dimensions as an array.
    pub const fn to_array(self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    /// Total number of threads, widened to avoid overflow.
    pub fn volume(self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    pub(crate) fn ensure_non_empty(self, what: &'static str) -> Result<(), ValidationFailure> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(ValidationFailure::EmptyDimension {
                what,
                width: self.width,
                height: self.height,
                depth: self.depth,
            });
        }
        Ok(())
    }

    /// Number of groups of shape `group` needed to cover `self`, per axis.
    ///
    /// Trailing groups may be partial; kernels guard against out-of-range
    /// invocations themselves.
    pub(crate) fn groups_to_cover(self, group: Size3D) -> [u32; 3] {
        let grid = self.to_array();
        let group = group.to_array();
        std::array::from_fn(|axis| grid[axis].div_ceil(group[axis]))
    }
}

impl From<[u32; 3]> for Size3D {
    fn from([width, height, depth]: [u32; 3]) -> Self {
        Self::new(width, height, depth)
    }
}

impl From<(u32, u32, u32)> for Size3D {
    fn from((width, height, depth): (u32, u32, u32)) -> Self {
        Self::new(width, height, depth)
    }
}

impl From<u32> for Size3D {
    fn from(width: u32) -> Self {
        Self::linear(width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dimension_is_rejected() {
        let err = Size3D::new(4, 0, 1)
            .ensure_non_empty("threads per grid")
            .unwrap_err();
        assert_eq!(
            err,
            ValidationFailure::EmptyDimension {
                what: "threads per grid",
                width: 4,
                height: 0,
                depth: 1,
            }
        );
        assert!(Size3D::ONE.ensure_non_empty("group").is_ok());
    }

    #[test]
    fn groups_round_up() {
        let grid = Size3D::new(10, 3, 1);
        assert_eq!(grid.groups_to_cover(Size3D::new(4, 2, 1)), [3, 2, 1]);
        assert_eq!(
            Size3D::linear(4).groups_to_cover(Size3D::linear(4)),
            [1, 1, 1]
        );
    }

    #[test]
    fn conversions() {
        assert_eq!(Size3D::from(7), Size3D::new(7, 1, 1));
        assert_eq!(Size3D::from((1, 2, 3)).to_array(), [1, 2, 3]);
        assert_eq!(Size3D::new(u32::MAX, 2, 1).volume(), u32::MAX as u64 * 2);
    }
}
