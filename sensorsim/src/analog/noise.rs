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

//! Noise primitives shared by the analog operators.
//!
//! Draws never fail: a non-finite or non-positive standard deviation (or
//! Poisson rate) is treated as zero and consumes no randomness.

use ndarray::{Axis, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Normal, Poisson};
use rand_xoshiro::Xoshiro256StarStar;

use crate::Tensor;

/// The single generator threaded through a functional run.
pub type NoiseRng = Xoshiro256StarStar;

pub(crate) fn sanitize(std: f64) -> f64 {
    if std.is_finite() && std > 0.0 {
        std
    } else {
        0.0
    }
}

pub(crate) fn gaussian<R: Rng>(rng: &mut R, mean: f64, std: f64) -> f64 {
    let std = sanitize(std);
    if std == 0.0 {
        return mean;
    }
    match Normal::new(mean, std) {
        Ok(normal) => normal.sample(rng),
        Err(_) => mean,
    }
}

pub(crate) fn poisson<R: Rng>(rng: &mut R, lambda: f64) -> f64 {
    let lambda = sanitize(lambda);
    if lambda == 0.0 {
        return 0.0;
    }
    match Poisson::new(lambda) {
        Ok(poisson) => poisson.sample(rng),
        Err(_) => lambda,
    }
}

/// A tensor of independent N(mean, std) draws.
pub(crate) fn gaussian_tensor<R: Rng>(rng: &mut R, dim: &[usize], mean: f64, std: f64) -> Tensor {
    Tensor::from_shape_simple_fn(IxDyn(dim), || gaussian(rng, mean, std))
}

/// Adds zero-mean Gaussian noise in place; `std` may depend on the value.
pub(crate) fn add_gaussian<R, F>(rng: &mut R, tensor: &mut Tensor, std: F)
where
    R: Rng,
    F: Fn(f64) -> f64,
{
    tensor.mapv_inplace(|v| gaussian(rng, v, std(v)));
}

pub(crate) fn clip(tensor: &mut Tensor, low: f64, high: f64) {
    tensor.mapv_inplace(|v| v.max(low).min(high));
}

pub(crate) fn max_value(tensor: &Tensor) -> f64 {
    tensor.iter().copied().fold(0.0_f64, f64::max)
}

/// A per-instance pattern (PRNU, DCNU, offsets) drawn once and reused by
/// every invocation with the same shape.
#[derive(Clone, Debug, Default)]
pub struct FixedPattern {
    pattern: Option<Tensor>,
}

impl FixedPattern {
    pub fn get_or_draw<R, F>(&mut self, rng: &mut R, dim: &[usize], draw: F) -> &Tensor
    where
        R: Rng,
        F: FnOnce(&mut R, &[usize]) -> Tensor,
    {
        let stale = match &self.pattern {
            Some(pattern) => pattern.shape() != dim,
            None => true,
        };
        if stale {
            if self.pattern.is_some() {
                log::debug!("fixed pattern redrawn for shape {:?}", dim);
            }
            self.pattern = Some(draw(rng, dim));
        }
        self.pattern.get_or_insert_with(|| Tensor::zeros(IxDyn(dim)))
    }

    pub fn reset(&mut self) {
        self.pattern = None;
    }
}

/// Per-pixel multiplicative factors `1 + N(0, std)`.
pub(crate) fn pixel_factors<R: Rng>(rng: &mut R, dim: &[usize], std: f64) -> Tensor {
    gaussian_tensor(rng, dim, 1.0, std)
}

/// Per-column (x axis) multiplicative factors, broadcast over rows and
/// channels.
pub(crate) fn column_factors<R: Rng>(rng: &mut R, dim: &[usize], std: f64) -> Tensor {
    let columns = dim.first().copied().unwrap_or(1);
    let factors = gaussian_tensor(rng, &[columns], 1.0, std);
    let mut tensor = Tensor::ones(IxDyn(dim));
    if dim.is_empty() {
        return tensor;
    }
    for (column, mut lane) in tensor.axis_iter_mut(Axis(0)).enumerate() {
        lane.fill(factors[[column]]);
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn degenerate_std_is_zero() {
        let mut rng = NoiseRng::seed_from_u64(7);
        assert_eq!(gaussian(&mut rng, 1.5, -2.0), 1.5);
        assert_eq!(gaussian(&mut rng, 1.5, f64::NAN), 1.5);
        assert_eq!(gaussian(&mut rng, 1.5, f64::INFINITY), 1.5);
        assert_eq!(poisson(&mut rng, 0.0), 0.0);
        assert_eq!(poisson(&mut rng, f64::NAN), 0.0);
    }

    #[test]
    fn fixed_pattern_is_reused() {
        let mut rng = NoiseRng::seed_from_u64(7);
        let mut pattern = FixedPattern::default();
        let first = pattern
            .get_or_draw(&mut rng, &[4, 4, 1], |rng, dim| pixel_factors(rng, dim, 0.1))
            .clone();
        let second = pattern
            .get_or_draw(&mut rng, &[4, 4, 1], |rng, dim| pixel_factors(rng, dim, 0.1))
            .clone();
        assert_eq!(first, second);

        pattern.reset();
        let third = pattern
            .get_or_draw(&mut rng, &[4, 4, 1], |rng, dim| pixel_factors(rng, dim, 0.1))
            .clone();
        assert_ne!(first, third);
    }

    #[test]
    fn columns_share_a_factor() {
        let mut rng = NoiseRng::seed_from_u64(3);
        let factors = column_factors(&mut rng, &[3, 5, 2], 0.2);
        for x in 0..3 {
            let expected = factors[[x, 0, 0]];
            for y in 0..5 {
                for z in 0..2 {
                    assert_eq!(factors[[x, y, z]], expected);
                }
            }
        }
    }
}
