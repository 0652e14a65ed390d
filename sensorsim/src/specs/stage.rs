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

//! software stages: the nodes of the dataflow graph

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Shape};

/// Stencil operations known to the digital reference evaluation.
///
/// `Custom` stages can be scheduled and mapped to analog arrays, but the
/// reference evaluation refuses to run them on digital hardware.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StencilOp {
    Identity,
    Abs,
    Add,
    Subtract,
    MaxPool,
    AvgPool,
    Custom(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DnnLayer {
    Conv,
    DepthwiseConv,
    FullyConnected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageKind {
    PixelInput,
    WeightInput,
    Stencil(StencilOp),
    Dnn {
        layer: DnnLayer,
        /// adapt a rank-3 feature map to the rank-1 input of a FC layer
        needs_flatten: bool,
    },
}

impl StageKind {
    pub fn is_input(&self) -> bool {
        matches!(self, Self::PixelInput | Self::WeightInput)
    }
}

/// One incoming (streamed) edge of a stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeSpec {
    pub source: String,
    pub input: Shape,
    pub kernel: Shape,
    pub stride: Shape,
    pub padding: bool,
    pub num_kernels: usize,
}

/// Per-stage table of upstream completion flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadyBoard {
    board: BTreeMap<String, bool>,
}

impl ReadyBoard {
    pub(crate) fn expect(&mut self, upstream: &str) {
        self.board.insert(upstream.to_string(), false);
    }

    pub fn mark(&mut self, upstream: &str) {
        if let Some(flag) = self.board.get_mut(upstream) {
            *flag = true;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.board.values().all(|ready| *ready)
    }

    pub fn get(&self, upstream: &str) -> Option<bool> {
        self.board.get(upstream).copied()
    }

    pub fn len(&self) -> usize {
        self.board.len()
    }

    pub fn is_empty(&self) -> bool {
        self.board.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stage {
    name: String,
    kind: StageKind,
    edges: Vec<EdgeSpec>,
    /// static operands (weight inputs), after the streamed edges in the
    /// declared input order
    operands: Vec<String>,
    declared_output: Option<Shape>,
    output_shape: Shape,
    pub(crate) output_stages: Vec<String>,
    pub(crate) ready_board: ReadyBoard,
}

impl Stage {
    fn new(name: &str, kind: StageKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            edges: vec![],
            operands: vec![],
            declared_output: None,
            output_shape: Shape::zero(),
            output_stages: vec![],
            ready_board: ReadyBoard::default(),
        }
    }

    fn input_stage(name: &str, kind: StageKind, hwc: &[usize]) -> Result<Self, Error> {
        let shape = Shape::from_hwc(hwc)?;
        let mut stage = Self::new(name, kind);
        stage.declared_output = Some(shape);
        stage.output_shape = shape;
        Ok(stage)
    }

    /// A source of pixel data, e.g. the photodiode array.
    pub fn pixel_input(name: &str, hwc: &[usize]) -> Result<Self, Error> {
        Self::input_stage(name, StageKind::PixelInput, hwc)
    }

    /// A static kernel consumed by an analog array or a DNN layer.
    pub fn weight_input(name: &str, hwc: &[usize]) -> Result<Self, Error> {
        Self::input_stage(name, StageKind::WeightInput, hwc)
    }

    pub fn stencil(name: &str, op: StencilOp) -> Self {
        Self::new(name, StageKind::Stencil(op))
    }

    /// Adds a streamed input edge from `source`. Shapes are (height, width,
    /// channels).
    pub fn input(
        mut self,
        source: &str,
        input_hwc: &[usize],
        kernel_hwc: &[usize],
        stride_hwc: &[usize],
        padding: bool,
    ) -> Result<Self, Error> {
        self.edges.push(EdgeSpec {
            source: source.to_string(),
            input: Shape::from_hwc(input_hwc)?,
            kernel: Shape::from_hwc(kernel_hwc)?,
            stride: Shape::from_hwc(stride_hwc)?,
            padding,
            num_kernels: 1,
        });
        Ok(self)
    }

    /// Sets the number of kernels applied on every streamed edge.
    pub fn num_kernels(mut self, num_kernels: usize) -> Self {
        self.edges
            .iter_mut()
            .for_each(|edge| edge.num_kernels = num_kernels);
        self
    }

    /// Adds a static operand (a weight input).
    pub fn operand(mut self, source: &str) -> Self {
        self.operands.push(source.to_string());
        self
    }

    /// Declares the expected output shape; it is checked against the
    /// derived one when the graph is built.
    pub fn declare_output(mut self, hwc: &[usize]) -> Result<Self, Error> {
        self.declared_output = Some(Shape::from_hwc(hwc)?);
        Ok(self)
    }

    /// 2-D convolution over all input channels producing `num_kernels`
    /// output channels.
    pub fn conv2d(
        name: &str,
        source: &str,
        input_hwc: &[usize],
        kernel_hw: [usize; 2],
        num_kernels: usize,
        stride_hw: [usize; 2],
        padding: bool,
    ) -> Result<Self, Error> {
        let input = Shape::from_hwc(input_hwc)?;
        let mut stage = Self::new(
            name,
            StageKind::Dnn {
                layer: DnnLayer::Conv,
                needs_flatten: false,
            },
        );
        stage.edges.push(EdgeSpec {
            source: source.to_string(),
            input,
            kernel: Shape::from_hwc(&[kernel_hw[0], kernel_hw[1], input.z])?,
            stride: Shape::from_hwc(&[stride_hw[0], stride_hw[1], 1])?,
            padding,
            num_kernels,
        });
        Ok(stage)
    }

    pub fn depthwise_conv2d(
        name: &str,
        source: &str,
        input_hwc: &[usize],
        kernel_hw: [usize; 2],
        stride_hw: [usize; 2],
        padding: bool,
    ) -> Result<Self, Error> {
        let mut stage = Self::new(
            name,
            StageKind::Dnn {
                layer: DnnLayer::DepthwiseConv,
                needs_flatten: false,
            },
        );
        stage.edges.push(EdgeSpec {
            source: source.to_string(),
            input: Shape::from_hwc(input_hwc)?,
            kernel: Shape::from_hwc(&[kernel_hw[0], kernel_hw[1], 1])?,
            stride: Shape::from_hwc(&[stride_hw[0], stride_hw[1], 1])?,
            padding,
            num_kernels: 1,
        });
        Ok(stage)
    }

    /// Fully-connected layer. A rank-3 input must set `needs_flatten`.
    pub fn fully_connected(
        name: &str,
        source: &str,
        input_hwc: &[usize],
        outputs: usize,
        needs_flatten: bool,
    ) -> Result<Self, Error> {
        let input = Shape::from_hwc(input_hwc)?;
        let mut stage = Self::new(
            name,
            StageKind::Dnn {
                layer: DnnLayer::FullyConnected,
                needs_flatten,
            },
        );
        stage.edges.push(EdgeSpec {
            source: source.to_string(),
            input,
            kernel: input,
            stride: input,
            padding: false,
            num_kernels: outputs,
        });
        Ok(stage)
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn kind(&self) -> &StageKind {
        &self.kind
    }

    pub fn edges(&self) -> &[EdgeSpec] {
        &self.edges
    }

    pub fn operands(&self) -> &[String] {
        &self.operands
    }

    /// Upstream stages in declared order: streamed edges, then operands.
    pub fn input_stages(&self) -> impl Iterator<Item = &str> {
        self.edges
            .iter()
            .map(|edge| edge.source.as_str())
            .chain(self.operands.iter().map(|name| name.as_str()))
    }

    pub fn output_stages(&self) -> &[String] {
        &self.output_stages
    }

    pub fn input_shapes(&self) -> Vec<Shape> {
        self.edges.iter().map(|edge| edge.input).collect()
    }

    pub fn kernel_shapes(&self) -> Vec<Shape> {
        self.edges.iter().map(|edge| edge.kernel).collect()
    }

    pub fn strides(&self) -> Vec<Shape> {
        self.edges.iter().map(|edge| edge.stride).collect()
    }

    pub fn padding(&self) -> Vec<bool> {
        self.edges.iter().map(|edge| edge.padding).collect()
    }

    pub fn num_kernels_per_edge(&self) -> Vec<usize> {
        self.edges.iter().map(|edge| edge.num_kernels).collect()
    }

    /// The derived output shape; valid once the graph is built.
    pub fn output_shape(&self) -> Shape {
        self.output_shape
    }

    pub fn ready_board(&self) -> &ReadyBoard {
        &self.ready_board
    }

    /// The output shape implied by a single edge.
    pub fn derive_edge_output(&self, edge: &EdgeSpec) -> Result<Shape, Error> {
        match self.kind {
            StageKind::Dnn {
                layer,
                needs_flatten,
            } => derive_dnn_output(layer, needs_flatten, edge),
            _ => Shape::derive_output(
                edge.input,
                edge.kernel,
                edge.stride,
                edge.padding,
                edge.num_kernels,
            ),
        }
    }

    /// Derives the output shape from every edge and checks that all edges
    /// (and the declared output, if any) agree.
    pub fn derive_output(&self) -> Result<Shape, Error> {
        if self.kind.is_input() {
            return self
                .declared_output
                .ok_or_else(|| Error::IncompleteDescription(format!("input {}", self.name)));
        }
        if self.edges.is_empty() {
            log::error!("Stage {} has no streamed input", self.name);
            return Err(Error::IncompleteDescription(format!(
                "stage {} has no input",
                self.name
            )));
        }
        let mut derived: Option<Shape> = self.declared_output;
        for (position, edge) in self.edges.iter().enumerate() {
            let found = self.derive_edge_output(edge)?;
            match derived {
                Some(expected) if expected != found => {
                    log::error!(
                        "Stage {} edge {} ({}) derives {} instead of {}",
                        self.name,
                        position,
                        edge.source,
                        found,
                        expected
                    );
                    return Err(Error::ShapeInconsistency {
                        stage: self.name.clone(),
                        edge: position,
                        expected,
                        found,
                    });
                }
                Some(_) => {}
                None => derived = Some(found),
            }
        }
        Ok(derived.unwrap_or_default())
    }

    pub(crate) fn set_output_shape(&mut self, shape: Shape) {
        self.output_shape = shape;
    }
}

/// Standard DNN shape rules: padding only applies to the spatial axes, the
/// channel axis is fixed by the layer type.
fn derive_dnn_output(
    layer: DnnLayer,
    needs_flatten: bool,
    edge: &EdgeSpec,
) -> Result<Shape, Error> {
    let spatial = |input: Shape| {
        Shape::derive_output(
            Shape::new(input.x, input.y, 1),
            Shape::new(edge.kernel.x, edge.kernel.y, 1),
            Shape::new(edge.stride.x, edge.stride.y, 1),
            edge.padding,
            1,
        )
    };
    match layer {
        DnnLayer::Conv => {
            if edge.kernel.z != edge.input.z {
                return Err(Error::InvalidShape(format!(
                    "conv kernel depth {} does not match {} input channels",
                    edge.kernel.z, edge.input.z
                )));
            }
            let out = spatial(edge.input)?;
            Ok(Shape::new(out.x, out.y, edge.num_kernels))
        }
        DnnLayer::DepthwiseConv => {
            let out = spatial(edge.input)?;
            Ok(Shape::new(out.x, out.y, edge.input.z * edge.num_kernels))
        }
        DnnLayer::FullyConnected => {
            if !needs_flatten && (edge.input.x != 1 || edge.input.y != 1) {
                return Err(Error::InvalidShape(format!(
                    "fully-connected input {} is not rank-1 and is not flattened",
                    edge.input
                )));
            }
            Ok(Shape::new(1, 1, edge.num_kernels))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stencil_edges_must_agree() {
        let stage = Stage::stencil("sum", StencilOp::Add)
            .input("a", &[8, 8, 1], &[1, 1, 1], &[1, 1, 1], false)
            .unwrap()
            .input("b", &[8, 8, 1], &[3, 3, 1], &[1, 1, 1], false)
            .unwrap();
        assert_eq!(
            stage.derive_output(),
            Err(Error::ShapeInconsistency {
                stage: "sum".to_string(),
                edge: 1,
                expected: Shape::new(8, 8, 1),
                found: Shape::new(6, 6, 1),
            })
        );

        let padded = Stage::stencil("sum", StencilOp::Add)
            .input("a", &[8, 8, 1], &[1, 1, 1], &[1, 1, 1], false)
            .unwrap()
            .input("b", &[8, 8, 1], &[3, 3, 1], &[1, 1, 1], true)
            .unwrap();
        assert_eq!(padded.derive_output(), Ok(Shape::new(8, 8, 1)));
    }

    #[test]
    fn declared_output_is_checked() {
        let stage = Stage::stencil("pool", StencilOp::MaxPool)
            .input("in", &[16, 16, 1], &[2, 2, 1], &[2, 2, 1], false)
            .unwrap()
            .declare_output(&[8, 8, 1])
            .unwrap();
        assert_eq!(stage.derive_output(), Ok(Shape::new(8, 8, 1)));

        let wrong = stage.declare_output(&[4, 4, 1]).unwrap();
        assert!(matches!(
            wrong.derive_output(),
            Err(Error::ShapeInconsistency { edge: 0, .. })
        ));
    }

    #[test]
    fn dnn_shapes() {
        let conv = Stage::conv2d("conv", "in", &[32, 32, 3], [3, 3], 16, [1, 1], true).unwrap();
        assert_eq!(conv.derive_output(), Ok(Shape::new(32, 32, 16)));

        let strided = Stage::conv2d("conv", "in", &[32, 32, 3], [3, 3], 16, [2, 2], false).unwrap();
        assert_eq!(strided.derive_output(), Ok(Shape::new(15, 15, 16)));

        let dw = Stage::depthwise_conv2d("dw", "in", &[32, 32, 8], [3, 3], [1, 1], true).unwrap();
        assert_eq!(dw.derive_output(), Ok(Shape::new(32, 32, 8)));

        let fc = Stage::fully_connected("fc", "in", &[4, 4, 8], 10, true).unwrap();
        assert_eq!(fc.derive_output(), Ok(Shape::new(1, 1, 10)));

        let unflattened = Stage::fully_connected("fc", "in", &[4, 4, 8], 10, false).unwrap();
        assert!(matches!(
            unflattened.derive_output(),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn ready_board() {
        let mut board = ReadyBoard::default();
        assert!(board.is_ready());
        board.expect("a");
        board.expect("b");
        assert!(!board.is_ready());
        board.mark("a");
        assert_eq!(board.get("a"), Some(true));
        assert!(!board.is_ready());
        board.mark("b");
        assert!(board.is_ready());
    }
}
