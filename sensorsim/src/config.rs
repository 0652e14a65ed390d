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

//! Pipeline descriptions: software stages, hardware and the mapping
//! between them, read from YAML or built programmatically.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::energy::{self, EnergyBreakdown, EnergyReport};
use crate::hw::config::HardwareConfiguration;
use crate::hw::HardwareDescription;
use crate::mapping::Mapping;
use crate::sim::{functional_simulate, StageOutputs};
use crate::specs::{SoftwareGraph, SoftwareGraphBuilder, Stage, StencilOp};
use crate::{Cycle, Error, Tensor};

pub const DEFAULT_MAX_CYCLES: Cycle = 1_000_000;

fn default_max_cycles() -> Cycle {
    DEFAULT_MAX_CYCLES
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// the scheduler gives up after this many cycles
    #[serde(default = "default_max_cycles")]
    pub max_cycles: Cycle,
    /// seeds the functional simulation; drawn from entropy when absent
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_cycles: DEFAULT_MAX_CYCLES,
            seed: None,
        }
    }
}

/// One streamed input of a stencil stage; shapes are (height, width,
/// channels).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeConfig {
    pub source: String,
    pub input: Vec<usize>,
    pub kernel: Vec<usize>,
    pub stride: Vec<usize>,
    #[serde(default)]
    pub padding: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    PixelInput {
        name: String,
        shape: Vec<usize>,
    },
    WeightInput {
        name: String,
        shape: Vec<usize>,
    },
    Stencil {
        name: String,
        op: StencilOp,
        inputs: Vec<EdgeConfig>,
        num_kernels: Option<usize>,
        #[serde(default)]
        operands: Vec<String>,
        output: Option<Vec<usize>>,
    },
    Conv {
        name: String,
        source: String,
        input: Vec<usize>,
        kernel: [usize; 2],
        num_kernels: usize,
        stride: [usize; 2],
        #[serde(default)]
        padding: bool,
        #[serde(default)]
        operands: Vec<String>,
    },
    DepthwiseConv {
        name: String,
        source: String,
        input: Vec<usize>,
        kernel: [usize; 2],
        stride: [usize; 2],
        #[serde(default)]
        padding: bool,
        #[serde(default)]
        operands: Vec<String>,
    },
    FullyConnected {
        name: String,
        source: String,
        input: Vec<usize>,
        outputs: usize,
        #[serde(default)]
        needs_flatten: bool,
        #[serde(default)]
        operands: Vec<String>,
    },
}

fn with_operands(stage: Stage, operands: &[String]) -> Stage {
    operands
        .iter()
        .fold(stage, |stage, operand| stage.operand(operand))
}

impl StageConfig {
    pub fn build(&self) -> Result<Stage, Error> {
        match self {
            Self::PixelInput { name, shape } => Stage::pixel_input(name, shape),
            Self::WeightInput { name, shape } => Stage::weight_input(name, shape),
            Self::Stencil {
                name,
                op,
                inputs,
                num_kernels,
                operands,
                output,
            } => {
                let mut stage = Stage::stencil(name, op.clone());
                for edge in inputs {
                    stage = stage.input(
                        &edge.source,
                        &edge.input,
                        &edge.kernel,
                        &edge.stride,
                        edge.padding,
                    )?;
                }
                if let Some(num_kernels) = num_kernels {
                    stage = stage.num_kernels(*num_kernels);
                }
                if let Some(output) = output {
                    stage = stage.declare_output(output)?;
                }
                Ok(with_operands(stage, operands))
            }
            Self::Conv {
                name,
                source,
                input,
                kernel,
                num_kernels,
                stride,
                padding,
                operands,
            } => Ok(with_operands(
                Stage::conv2d(name, source, input, *kernel, *num_kernels, *stride, *padding)?,
                operands,
            )),
            Self::DepthwiseConv {
                name,
                source,
                input,
                kernel,
                stride,
                padding,
                operands,
            } => Ok(with_operands(
                Stage::depthwise_conv2d(name, source, input, *kernel, *stride, *padding)?,
                operands,
            )),
            Self::FullyConnected {
                name,
                source,
                input,
                outputs,
                needs_flatten,
                operands,
            } => Ok(with_operands(
                Stage::fully_connected(name, source, input, *outputs, *needs_flatten)?,
                operands,
            )),
        }
    }
}

/// A complete pipeline description.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub software: Vec<StageConfig>,
    pub hardware: HardwareConfiguration,
    pub mapping: Mapping,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Keys present without a value are an error rather than a default.
fn reject_empty(value: &serde_yaml::Value, path: &str) -> Result<(), Error> {
    match value {
        serde_yaml::Value::Null => {
            log::error!("{} has no value", path);
            Err(Error::IncompleteDescription(format!("{} has no value", path)))
        }
        serde_yaml::Value::Mapping(mapping) => {
            for (key, value) in mapping.iter() {
                let key = match key {
                    serde_yaml::Value::String(key) => key.clone(),
                    other => format!("{:?}", other),
                };
                reject_empty(value, &format!("{}.{}", path, key))?;
            }
            Ok(())
        }
        serde_yaml::Value::Sequence(items) => {
            for (position, item) in items.iter().enumerate() {
                reject_empty(item, &format!("{}[{}]", path, position))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

impl PipelineConfig {
    pub fn from_file<P: AsRef<Path>>(file_name: P) -> anyhow::Result<Self> {
        let path = file_name.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let value: serde_yaml::Value = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
        Self::from_value(value).with_context(|| format!("reading {}", path.display()))
    }

    pub fn from_str(config: &str) -> anyhow::Result<Self> {
        Self::from_value(serde_yaml::from_str(config)?)
    }

    fn from_value(value: serde_yaml::Value) -> anyhow::Result<Self> {
        reject_empty(&value, "pipeline")?;
        Ok(serde_yaml::from_value(value)?)
    }

    pub fn build(&self) -> Result<Pipeline, Error> {
        let stages = self
            .software
            .iter()
            .map(|stage| stage.build())
            .collect::<Result<Vec<_>, _>>()?;
        let graph = SoftwareGraphBuilder::new().add_stages(stages)?.build()?;
        let hardware = self.hardware.build()?;
        Pipeline::new(graph, hardware, self.mapping.clone(), self.simulation.clone())
    }
}

/// A software graph mapped onto a hardware description.
#[derive(Clone, Debug)]
pub struct Pipeline {
    pub graph: SoftwareGraph,
    pub hardware: HardwareDescription,
    pub mapping: Mapping,
    pub simulation: SimulationConfig,
}

impl Pipeline {
    /// Checks the hardware and the mapping.
    pub fn new(
        graph: SoftwareGraph,
        hardware: HardwareDescription,
        mapping: Mapping,
        simulation: SimulationConfig,
    ) -> Result<Self, Error> {
        hardware.check()?;
        mapping.check(&graph, &hardware)?;
        Ok(Self {
            graph,
            hardware,
            mapping,
            simulation,
        })
    }

    pub fn simulate(&self) -> Result<(f64, EnergyBreakdown), Error> {
        energy::simulate(
            &self.graph,
            &self.hardware,
            &self.mapping,
            self.simulation.max_cycles,
        )
    }

    pub fn simulate_with_report(&self) -> Result<EnergyReport, Error> {
        energy::simulate_with_report(
            &self.graph,
            &self.hardware,
            &self.mapping,
            self.simulation.max_cycles,
        )
    }

    pub fn functional_simulate(
        &mut self,
        inputs: &BTreeMap<String, Vec<Tensor>>,
    ) -> Result<StageOutputs, Error> {
        functional_simulate(
            &self.graph,
            &mut self.hardware,
            &self.mapping,
            inputs,
            self.simulation.seed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shape;

    const ABS_PIPELINE: &str = "---
software:
  - kind: pixel_input
    name: image
    shape: [32, 32, 1]
  - kind: stencil
    name: abs
    op: Abs
    inputs:
      - source: image
        input: [32, 32, 1]
        kernel: [1, 1, 1]
        stride: [1, 1, 1]
hardware:
  memory:
    - name: frame
      kind: Fifo
      read_energy: 1.0e-15
      write_energy: 1.0e-15
    - name: result
      kind: Fifo
      read_energy: 0.0
      write_energy: 0.0
  compute:
    - name: alu
      input_per_cycle: [[1, 4, 1]]
      output_per_cycle: [1, 4, 1]
      energy_per_cycle: 1.0e-12
      input_buffers: [frame]
      output_buffer: result
mapping:
  image: frame
  abs: alu
simulation:
  seed: 3
";

    #[test]
    fn read_yaml_pipeline() {
        let config = PipelineConfig::from_str(ABS_PIPELINE).unwrap();
        assert_eq!(config.simulation.max_cycles, DEFAULT_MAX_CYCLES);
        assert_eq!(config.simulation.seed, Some(3));
        let pipeline = config.build().unwrap();
        assert_eq!(
            pipeline.graph.stage_by_name("abs").unwrap().output_shape(),
            Shape::new(32, 32, 1)
        );
        let report = pipeline.simulate_with_report().unwrap();
        assert_eq!(report.schedule.total_cycles, 256);
    }

    #[test]
    fn empty_values_are_rejected() {
        let config = ABS_PIPELINE.replace("seed: 3", "seed:");
        let err = PipelineConfig::from_str(&config).unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::IncompleteDescription(
                "pipeline.simulation.seed has no value".to_string()
            ))
        );
    }

    #[test]
    fn stage_configs() {
        let conv: StageConfig = serde_yaml::from_str(
            "kind: conv
name: conv
source: image
input: [8, 8, 3]
kernel: [3, 3]
num_kernels: 4
stride: [1, 1]
padding: true
operands: [weights]
",
        )
        .unwrap();
        let stage = conv.build().unwrap();
        assert_eq!(stage.derive_output(), Ok(Shape::new(8, 8, 4)));
        assert_eq!(stage.operands(), &["weights".to_string()]);

        let custom: StageConfig = serde_yaml::from_str(
            "kind: stencil
name: mac
op:
  Custom: mac
inputs:
  - source: image
    input: [8, 8, 1]
    kernel: [2, 2, 1]
    stride: [2, 2, 1]
",
        )
        .unwrap();
        assert_eq!(
            custom.build().unwrap().derive_output(),
            Ok(Shape::new(4, 4, 1))
        );
    }
}
