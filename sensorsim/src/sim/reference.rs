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

//! Noise-free evaluation of digitally mapped stages.
//!
//! Tensors are indexed (x, y, z). Windows are taken in padded coordinates;
//! padding reads as zero.

use itertools::iproduct;

use crate::specs::{DnnLayer, EdgeSpec, Stage, StageKind, StencilOp};
use crate::{Error, Shape, Tensor};

fn shape_of(stage: &str, tensor: &Tensor) -> Result<Shape, Error> {
    match tensor.shape() {
        [x, y, z] => Ok(Shape::new(*x, *y, *z)),
        other => {
            log::error!("{} received a rank {} tensor", stage, other.len());
            Err(Error::InvalidInput(format!(
                "{}: expected a rank 3 tensor, got {:?}",
                stage, other
            )))
        }
    }
}

/// Zero-padded view of one input.
struct Padded<'a> {
    tensor: &'a Tensor,
    shape: Shape,
    pad: Shape,
}

impl<'a> Padded<'a> {
    fn new(stage: &str, tensor: &'a Tensor, pad: Shape) -> Result<Self, Error> {
        Ok(Self {
            tensor,
            shape: shape_of(stage, tensor)?,
            pad,
        })
    }

    fn get(&self, x: usize, y: usize, z: usize) -> f64 {
        let real = |v: usize, pad: usize, extent: usize| v.checked_sub(pad).filter(|r| *r < extent);
        match (
            real(x, self.pad.x, self.shape.x),
            real(y, self.pad.y, self.shape.y),
            real(z, self.pad.z, self.shape.z),
        ) {
            (Some(x), Some(y), Some(z)) => self.tensor[[x, y, z]],
            _ => 0.0,
        }
    }

    /// Values of the window anchored at output position `out`.
    fn window(&self, edge: &EdgeSpec, out: Shape) -> impl Iterator<Item = f64> + '_ {
        let start = Shape::new(
            out.x * edge.stride.x,
            out.y * edge.stride.y,
            out.z * edge.stride.z,
        );
        let kernel = edge.kernel;
        iproduct!(0..kernel.z, 0..kernel.y, 0..kernel.x)
            .map(move |(k, j, i)| self.get(start.x + i, start.y + j, start.z + k))
    }

    /// The element under the centre of the window.
    fn centre(&self, edge: &EdgeSpec, out: Shape) -> f64 {
        self.get(
            out.x * edge.stride.x + edge.kernel.x / 2,
            out.y * edge.stride.y + edge.kernel.y / 2,
            out.z * edge.stride.z + edge.kernel.z / 2,
        )
    }
}

fn pad_of(edge: &EdgeSpec, spatial_only: bool) -> Shape {
    if !edge.padding {
        return Shape::zero();
    }
    let pad = Shape::pad_offset(edge.kernel);
    if spatial_only {
        Shape::new(pad.x, pad.y, 0)
    } else {
        pad
    }
}

fn streamed<'a>(stage: &Stage, inputs: &'a [Tensor]) -> Result<Vec<Padded<'a>>, Error> {
    let edges = stage.edges();
    if inputs.len() < edges.len() {
        log::error!(
            "{} needs {} inputs, got {}",
            stage.name(),
            edges.len(),
            inputs.len()
        );
        return Err(Error::InvalidInput(format!(
            "{}: {} inputs for {} edges",
            stage.name(),
            inputs.len(),
            edges.len()
        )));
    }
    let spatial_only = matches!(stage.kind(), StageKind::Dnn { .. });
    edges
        .iter()
        .zip(inputs)
        .map(|(edge, tensor)| Padded::new(stage.name(), tensor, pad_of(edge, spatial_only)))
        .collect()
}

fn operand<'a>(stage: &Stage, inputs: &'a [Tensor], expected: Shape) -> Result<&'a Tensor, Error> {
    let weights = inputs.get(stage.edges().len()).ok_or_else(|| {
        log::error!("{} has no weight operand", stage.name());
        Error::InvalidInput(format!("{}: missing weight operand", stage.name()))
    })?;
    let found = shape_of(stage.name(), weights)?;
    if found != expected {
        log::error!(
            "{} weights are {} but {} is required",
            stage.name(),
            found,
            expected
        );
        return Err(Error::InvalidInput(format!(
            "{}: weights {} instead of {}",
            stage.name(),
            found,
            expected
        )));
    }
    Ok(weights)
}

/// Whether `evaluate` knows how to compute `stage`.
pub(crate) fn has_reference(stage: &Stage) -> bool {
    !matches!(stage.kind(), StageKind::Stencil(StencilOp::Custom(_)))
}

/// Evaluates `stage` on `inputs` (streamed inputs in declared order, then
/// operands). Only the operations with a known reference are supported.
pub(crate) fn evaluate(stage: &Stage, inputs: &[Tensor]) -> Result<Tensor, Error> {
    if stage.kind().is_input() {
        return Err(Error::InvalidInput(format!(
            "{} is an input and is not evaluated",
            stage.name()
        )));
    }
    let out = stage.output_shape();
    let padded = streamed(stage, inputs)?;
    let edges = stage.edges();
    let first = match edges.first().zip(padded.first()) {
        Some(first) => first,
        None => {
            return Err(Error::IncompleteDescription(format!(
                "{} has no input",
                stage.name()
            )))
        }
    };
    let output = match stage.kind() {
        StageKind::Stencil(op) => match op {
            StencilOp::Identity => Tensor::from_shape_fn(out.dim(), |i| {
                first.1.centre(first.0, Shape::new(i[0], i[1], i[2]))
            }),
            StencilOp::Abs => Tensor::from_shape_fn(out.dim(), |i| {
                first.1.centre(first.0, Shape::new(i[0], i[1], i[2])).abs()
            }),
            StencilOp::Add | StencilOp::Subtract => {
                let negate = *op == StencilOp::Subtract;
                Tensor::from_shape_fn(out.dim(), |i| {
                    let at = Shape::new(i[0], i[1], i[2]);
                    edges
                        .iter()
                        .zip(&padded)
                        .enumerate()
                        .map(|(n, (edge, input))| {
                            let v = input.centre(edge, at);
                            if negate && n > 0 {
                                -v
                            } else {
                                v
                            }
                        })
                        .sum()
                })
            }
            StencilOp::MaxPool => Tensor::from_shape_fn(out.dim(), |i| {
                first
                    .1
                    .window(first.0, Shape::new(i[0], i[1], i[2]))
                    .fold(f64::NEG_INFINITY, f64::max)
            }),
            StencilOp::AvgPool => {
                let taps = first.0.kernel.volume() as f64;
                Tensor::from_shape_fn(out.dim(), |i| {
                    first
                        .1
                        .window(first.0, Shape::new(i[0], i[1], i[2]))
                        .sum::<f64>()
                        / taps
                })
            }
            StencilOp::Custom(name) => {
                log::error!("{}: no reference for {}", stage.name(), name);
                return Err(Error::UnsupportedOption(format!(
                    "{}: no digital reference for {}",
                    stage.name(),
                    name
                )));
            }
        },
        StageKind::Dnn { layer, .. } => {
            let (edge, input) = first;
            match layer {
                // weights are (kx, ky, channels * kernels), kernel n owning
                // the channel slice [n * channels, (n + 1) * channels)
                DnnLayer::Conv => {
                    let channels = edge.input.z;
                    let weights = operand(
                        stage,
                        inputs,
                        Shape::new(edge.kernel.x, edge.kernel.y, channels * edge.num_kernels),
                    )?;
                    Tensor::from_shape_fn(out.dim(), |i| {
                        let (x, y, n) = (i[0] * edge.stride.x, i[1] * edge.stride.y, i[2]);
                        iproduct!(0..channels, 0..edge.kernel.y, 0..edge.kernel.x)
                            .map(|(c, j, k)| {
                                input.get(x + k, y + j, c) * weights[[k, j, n * channels + c]]
                            })
                            .sum()
                    })
                }
                DnnLayer::DepthwiseConv => {
                    let weights = operand(
                        stage,
                        inputs,
                        Shape::new(edge.kernel.x, edge.kernel.y, edge.input.z),
                    )?;
                    Tensor::from_shape_fn(out.dim(), |i| {
                        let (x, y, c) = (i[0] * edge.stride.x, i[1] * edge.stride.y, i[2]);
                        iproduct!(0..edge.kernel.y, 0..edge.kernel.x)
                            .map(|(j, k)| input.get(x + k, y + j, c) * weights[[k, j, c]])
                            .sum()
                    })
                }
                // inputs are flattened in logical order, weights are
                // (inputs, outputs, 1)
                DnnLayer::FullyConnected => {
                    let flat = inputs[0].iter().copied().collect::<Vec<_>>();
                    let weights = operand(stage, inputs, Shape::new(flat.len(), out.z, 1))?;
                    Tensor::from_shape_fn(out.dim(), |i| {
                        flat.iter()
                            .enumerate()
                            .map(|(l, v)| v * weights[[l, i[2], 0]])
                            .sum()
                    })
                }
            }
        }
        StageKind::PixelInput | StageKind::WeightInput => first.1.tensor.clone(),
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn ramp(x: usize, y: usize) -> Tensor {
        Tensor::from_shape_fn(IxDyn(&[x, y, 1]), |i| (i[0] + x * i[1]) as f64)
    }

    #[test]
    fn abs_and_subtract() {
        let mut abs = Stage::stencil("abs", StencilOp::Abs)
            .input("in", &[2, 2, 1], &[1, 1, 1], &[1, 1, 1], false)
            .unwrap();
        abs.set_output_shape(abs.derive_output().unwrap());
        let input = Tensor::from_elem(IxDyn(&[2, 2, 1]), -7.0);
        let out = evaluate(&abs, &[input]).unwrap();
        assert!(out.iter().all(|v| *v == 7.0));

        let mut diff = Stage::stencil("diff", StencilOp::Subtract)
            .input("a", &[2, 2, 1], &[1, 1, 1], &[1, 1, 1], false)
            .unwrap()
            .input("b", &[2, 2, 1], &[1, 1, 1], &[1, 1, 1], false)
            .unwrap();
        diff.set_output_shape(diff.derive_output().unwrap());
        let out = evaluate(&diff, &[ramp(2, 2), Tensor::ones(IxDyn(&[2, 2, 1]))]).unwrap();
        assert_eq!(out[[1, 1, 0]], 2.0);
    }

    #[test]
    fn pooling() {
        let mut pool = Stage::stencil("pool", StencilOp::MaxPool)
            .input("in", &[4, 4, 1], &[2, 2, 1], &[2, 2, 1], false)
            .unwrap();
        pool.set_output_shape(pool.derive_output().unwrap());
        let out = evaluate(&pool, &[ramp(4, 4)]).unwrap();
        assert_eq!(out.shape(), &[2, 2, 1]);
        assert_eq!(out[[0, 0, 0]], 5.0);
        assert_eq!(out[[1, 1, 0]], 15.0);

        // padded border windows average in zeros
        let mut blur = Stage::stencil("blur", StencilOp::AvgPool)
            .input("in", &[4, 4, 1], &[3, 3, 1], &[1, 1, 1], true)
            .unwrap();
        blur.set_output_shape(blur.derive_output().unwrap());
        let out = evaluate(&blur, &[Tensor::ones(IxDyn(&[4, 4, 1]))]).unwrap();
        assert_eq!(out[[1, 1, 0]], 1.0);
        assert_eq!(out[[0, 0, 0]], 4.0 / 9.0);
    }

    #[test]
    fn conv_and_fully_connected() {
        let mut conv = Stage::conv2d("conv", "in", &[3, 3, 1], [3, 3], 2, [1, 1], false)
            .unwrap()
            .operand("w");
        conv.set_output_shape(conv.derive_output().unwrap());
        let weights = Tensor::from_shape_fn(IxDyn(&[3, 3, 2]), |i| if i[2] == 0 { 1.0 } else { -1.0 });
        let out = evaluate(&conv, &[Tensor::ones(IxDyn(&[3, 3, 1])), weights]).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2]);
        assert_eq!(out[[0, 0, 0]], 9.0);
        assert_eq!(out[[0, 0, 1]], -9.0);

        let mut fc = Stage::fully_connected("fc", "in", &[2, 2, 1], 3, true)
            .unwrap()
            .operand("w");
        fc.set_output_shape(fc.derive_output().unwrap());
        let weights = Tensor::from_elem(IxDyn(&[4, 3, 1]), 0.5);
        let out = evaluate(&fc, &[ramp(2, 2), weights]).unwrap();
        assert_eq!(out.shape(), &[1, 1, 3]);
        assert_eq!(out[[0, 0, 2]], 3.0);

        let missing = evaluate(&fc, &[ramp(2, 2)]);
        assert!(matches!(missing, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn custom_ops_have_no_reference() {
        let mut mac = Stage::stencil("mac", StencilOp::Custom("mac".to_string()))
            .input("in", &[2, 2, 1], &[1, 1, 1], &[1, 1, 1], false)
            .unwrap();
        mac.set_output_shape(mac.derive_output().unwrap());
        assert!(!has_reference(&mac));
        assert!(matches!(
            evaluate(&mac, &[ramp(2, 2)]),
            Err(Error::UnsupportedOption(_))
        ));
    }
}
