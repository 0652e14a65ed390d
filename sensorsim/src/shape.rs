// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shape algebra.
//!
//! All sizes, indices, throughputs, kernels and strides are stored as an
//! (x, y, z) triple: x is the fast (width) axis, y the row (height) axis and
//! z the channel axis. Users describe shapes as (height, width, channels);
//! [`Shape::from_hwc`] is the only place where that order is rewritten.

use std::fmt::{Display, Formatter};

use ndarray::IxDyn;

use crate::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shape {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Shape {
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// The origin, used as the initial value of every 3-D index.
    pub const fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    /// Normalizes an externally declared (height, width, channels) shape.
    ///
    /// Rejects anything that is not exactly three non-zero extents.
    pub fn from_hwc(hwc: &[usize]) -> Result<Self, Error> {
        if hwc.len() != 3 {
            log::error!("Shapes are declared as [height, width, channels], got {:?}", hwc);
            return Err(Error::InvalidShape(format!(
                "expected rank 3, got rank {} ({:?})",
                hwc.len(),
                hwc
            )));
        }
        if hwc.contains(&0) {
            return Err(Error::InvalidShape(format!("zero extent in {:?}", hwc)));
        }
        Ok(Self::new(hwc[1], hwc[0], hwc[2]))
    }

    /// Returns the shape in the user facing (height, width, channels) order.
    pub fn to_hwc(&self) -> [usize; 3] {
        [self.y, self.x, self.z]
    }

    pub fn volume(&self) -> usize {
        self.x * self.y * self.z
    }

    pub fn is_empty(&self) -> bool {
        self.volume() == 0
    }

    /// ndarray dimensions of a tensor carrying this shape; axes are (x, y, z).
    pub fn dim(&self) -> IxDyn {
        IxDyn(&[self.x, self.y, self.z])
    }

    /// Offset of `index` in an x-major linearization of this shape.
    pub fn linear_index(&self, index: Shape) -> usize {
        debug_assert!(self.contains(index), "{} out of {}", index, self);
        index.x + self.x * (index.y + self.y * index.z)
    }

    pub fn contains(&self, index: Shape) -> bool {
        index.x < self.x && index.y < self.y && index.z < self.z
    }

    pub fn min(&self, other: Shape) -> Shape {
        Shape::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.z.min(other.z),
        )
    }

    /// Halo added on each side of an input when a stencil is padded.
    pub fn pad_offset(kernel: Shape) -> Shape {
        Shape::new(kernel.x / 2, kernel.y / 2, kernel.z / 2)
    }

    /// The input shape seen by a stencil: padded inputs grow by
    /// `2 * (kernel / 2)` on every axis.
    pub fn extrapolate(input: Shape, kernel: Shape, padding: bool) -> Shape {
        if padding {
            let pad = Shape::pad_offset(kernel);
            Shape::new(input.x + 2 * pad.x, input.y + 2 * pad.y, input.z + 2 * pad.z)
        } else {
            input
        }
    }

    /// Derives the output of a stencil edge:
    /// `floor((extrapolated - (kernel - stride)) / stride)` per axis, with the
    /// channel axis scaled by the number of kernels.
    pub fn derive_output(
        input: Shape,
        kernel: Shape,
        stride: Shape,
        padding: bool,
        num_kernels: usize,
    ) -> Result<Shape, Error> {
        fn axis(name: &str, ext: usize, k: usize, s: usize) -> Result<usize, Error> {
            if s == 0 || k == 0 {
                return Err(Error::InvalidShape(format!(
                    "zero kernel or stride on axis {}",
                    name
                )));
            }
            match (ext + s).checked_sub(k) {
                Some(span) if span / s > 0 => Ok(span / s),
                _ => Err(Error::InvalidShape(format!(
                    "kernel {} does not fit input {} on axis {}",
                    k, ext, name
                ))),
            }
        }
        if num_kernels == 0 {
            return Err(Error::InvalidShape("zero kernels".to_string()));
        }
        let ext = Shape::extrapolate(input, kernel, padding);
        Ok(Shape::new(
            axis("x", ext.x, kernel.x, stride.x)?,
            axis("y", ext.y, kernel.y, stride.y)?,
            axis("z", ext.z, kernel.z, stride.z)? * num_kernels,
        ))
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

impl From<[usize; 3]> for Shape {
    /// Builds an internal (x, y, z) triple, no reordering.
    fn from(xyz: [usize; 3]) -> Self {
        Shape::new(xyz[0], xyz[1], xyz[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwc_is_rewritten_to_xyz() {
        let shape = Shape::from_hwc(&[4, 8, 3]).unwrap();
        assert_eq!(shape, Shape::new(8, 4, 3));
        assert_eq!(shape.to_hwc(), [4, 8, 3]);
        assert_eq!(shape.volume(), 96);
    }

    #[test]
    fn rank_other_than_three_is_rejected() {
        assert!(matches!(
            Shape::from_hwc(&[4, 8]),
            Err(Error::InvalidShape(_))
        ));
        assert!(matches!(
            Shape::from_hwc(&[1, 4, 8, 3]),
            Err(Error::InvalidShape(_))
        ));
        assert!(matches!(
            Shape::from_hwc(&[4, 0, 3]),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn padded_stride_one_keeps_size() {
        for k in [1, 3, 5, 7] {
            let out = Shape::derive_output(
                Shape::new(36, 36, 1),
                Shape::new(k, k, 1),
                Shape::new(1, 1, 1),
                true,
                1,
            )
            .unwrap();
            assert_eq!(out, Shape::new(36, 36, 1));
        }
    }

    #[test]
    fn unpadded_output() {
        let out = Shape::derive_output(
            Shape::new(36, 36, 1),
            Shape::new(3, 3, 1),
            Shape::new(3, 3, 1),
            false,
            1,
        )
        .unwrap();
        assert_eq!(out, Shape::new(12, 12, 1));

        // floor((n - (k - s)) / s) with n = 10, k = 3, s = 2
        let out = Shape::derive_output(
            Shape::new(10, 10, 1),
            Shape::new(3, 3, 1),
            Shape::new(2, 2, 1),
            false,
            1,
        )
        .unwrap();
        assert_eq!(out, Shape::new(4, 4, 1));
    }

    #[test]
    fn channels_scale_with_kernels() {
        let out = Shape::derive_output(
            Shape::new(16, 16, 3),
            Shape::new(3, 3, 3),
            Shape::new(1, 1, 1),
            false,
            8,
        )
        .unwrap();
        assert_eq!(out, Shape::new(14, 14, 8));
    }

    #[test]
    fn kernel_larger_than_input() {
        assert!(Shape::derive_output(
            Shape::new(2, 2, 1),
            Shape::new(5, 5, 1),
            Shape::new(1, 1, 1),
            false,
            1,
        )
        .is_err());
    }

    #[test]
    fn linearization_is_x_major() {
        let shape = Shape::new(4, 3, 2);
        assert_eq!(shape.linear_index(Shape::new(1, 0, 0)), 1);
        assert_eq!(shape.linear_index(Shape::new(0, 1, 0)), 4);
        assert_eq!(shape.linear_index(Shape::new(0, 0, 1)), 12);
        assert_eq!(shape.linear_index(Shape::new(3, 2, 1)), 23);
    }
}
