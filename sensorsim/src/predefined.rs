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

//! Ready-made pipelines, used by the `pipeline` binary, the benchmarks and
//! the tests.

use crate::analog::{
    ActivePixelSensor, Adc, AnalogNode, AnalogOp, AnalogSystem, FloatingDiffusion, Photodiode,
    SourceFollower,
};
use crate::config::{Pipeline, SimulationConfig};
use crate::hw::{ComputeUnit, HardwareDescription, MemoryUnit};
use crate::mapping::Mapping;
use crate::specs::{SoftwareGraphBuilder, Stage, StencilOp};
use crate::Error;

pub const PIPELINES: &[&str] = &["abs", "blur", "strided", "sensor"];

pub fn by_name(name: &str) -> Result<Pipeline, Error> {
    match name {
        "abs" => abs_pipeline(4),
        "blur" => stencil_pipeline(1, true),
        "strided" => stencil_pipeline(3, false),
        "sensor" => sensor_pipeline(),
        _ => Err(Error::InvalidInput(format!(
            "unknown pipeline {}, expected one of {:?}",
            name, PIPELINES
        ))),
    }
}

/// A 32x32 frame in memory, |x| on a unit consuming `throughput` pixels
/// of a row per cycle.
pub fn abs_pipeline(throughput: usize) -> Result<Pipeline, Error> {
    let graph = SoftwareGraphBuilder::new()
        .add_stages(vec![
            Stage::pixel_input("image", &[32, 32, 1])?,
            Stage::stencil("abs", StencilOp::Abs).input(
                "image",
                &[32, 32, 1],
                &[1, 1, 1],
                &[1, 1, 1],
                false,
            )?,
        ])?
        .build()?;
    let hw = HardwareDescription::new()
        .with_memory(MemoryUnit::fifo("frame").with_access_energy(1e-15, 1e-15))
        .with_memory(MemoryUnit::fifo("result"))
        .with_compute(
            ComputeUnit::new(
                "alu",
                &[&[1, throughput, 1]],
                &[1, throughput, 1],
                0.5e-12 * throughput as f64,
            )?
            .reads(&["frame"])
            .writes("result"),
        );
    let mapping = Mapping::new().bind("image", "frame").bind("abs", "alu");
    Pipeline::new(graph, hw, mapping, SimulationConfig::default())
}

/// A 3x3 box filter over a 36x36 frame held in a line buffer.
pub fn stencil_pipeline(stride: usize, padding: bool) -> Result<Pipeline, Error> {
    let graph = SoftwareGraphBuilder::new()
        .add_stages(vec![
            Stage::pixel_input("image", &[36, 36, 1])?,
            Stage::stencil("filter", StencilOp::AvgPool).input(
                "image",
                &[36, 36, 1],
                &[3, 3, 1],
                &[stride, stride, 1],
                padding,
            )?,
        ])?
        .build()?;
    let hw = HardwareDescription::new()
        .with_memory(MemoryUnit::line_buffer("line").with_access_energy(0.5e-15, 1e-15))
        .with_memory(MemoryUnit::fifo("out").with_access_energy(0.0, 1e-15))
        .with_compute(
            ComputeUnit::new("pe", &[&[3, 3, 1]], &[1, 1, 1], 2e-12)?
                .reads(&["line"])
                .writes("out"),
        );
    let mapping = Mapping::new().bind("image", "line").bind("filter", "pe");
    Pipeline::new(graph, hw, mapping, SimulationConfig::default())
}

/// 4T pixel array with 100 fF photodiodes at 3.3 V.
pub fn pixel_array(rows: usize, cols: usize) -> Result<AnalogNode, Error> {
    let aps = ActivePixelSensor {
        num_transistor: 4,
        photodiode: Photodiode::new(100e-15, 3.3, 20_000.0).dark_current(5.0),
        floating_diffusion: FloatingDiffusion::new(5e-15, 3.3, 5e-5)
            .read_noise(2e-4)
            .prnu(0.01),
        source_follower: SourceFollower::new(0.9).load(1e-12, 3.3, 1.0).noise(1e-4),
    };
    let mut pixel = AnalogNode::unit("pixel").with_count(rows, cols);
    pixel.add(AnalogNode::component("aps", AnalogOp::ActivePixelSensor(aps)))?;
    let mut array = AnalogNode::array("pixel_array");
    array.add(pixel)?;
    Ok(array)
}

/// Column-parallel single-slope ADCs, FOM 100 fJ at 8 bit. Each of the
/// `cols` converters runs once per row, so the unit is counted per pixel.
pub fn adc_array(rows: usize, cols: usize) -> Result<AnalogNode, Error> {
    let mut column = AnalogNode::unit("column").with_count(rows, cols);
    column.add(AnalogNode::component(
        "adc",
        AnalogOp::Adc(Adc::new(100e-15, 8).adc_type("SS").full_scale(1.0)),
    ))?;
    let mut array = AnalogNode::array("adc_array").with_count(1, cols);
    array.add(column)?;
    Ok(array)
}

/// Light captured by a 32x32 pixel array, digitized by column ADCs and
/// max-pooled 2x2 by a digital unit behind a line buffer.
pub fn sensor_pipeline() -> Result<Pipeline, Error> {
    let graph = SoftwareGraphBuilder::new()
        .add_stages(vec![
            Stage::pixel_input("light", &[32, 32, 1])?,
            Stage::stencil("readout", StencilOp::Identity).input(
                "light",
                &[32, 32, 1],
                &[1, 1, 1],
                &[1, 1, 1],
                false,
            )?,
            Stage::stencil("pool", StencilOp::MaxPool).input(
                "readout",
                &[32, 32, 1],
                &[2, 2, 1],
                &[2, 2, 1],
                false,
            )?,
        ])?
        .build()?;

    let mut analog = AnalogSystem::new();
    analog.add_array(pixel_array(32, 32)?)?;
    analog.add_array(adc_array(32, 32)?)?;
    analog.connect("pixel_array", "adc_array")?;

    let hw = HardwareDescription::new()
        .with_memory(MemoryUnit::line_buffer("line").with_access_energy(0.5e-15, 1e-15))
        .with_memory(MemoryUnit::fifo("out").with_access_energy(0.0, 1e-15))
        .with_compute(
            ComputeUnit::new("pool", &[&[2, 2, 1]], &[1, 1, 1], 0.2e-12)?
                .reads(&["line"])
                .writes("out"),
        )
        .with_analog(analog);
    let mapping = Mapping::new()
        .bind("light", "pixel_array")
        .bind("readout", "adc_array")
        .bind("pool", "pool");
    Pipeline::new(graph, hw, mapping, SimulationConfig::default())
}

/// Two stages waiting on each other.
pub fn mutual_pipeline() -> Result<Pipeline, Error> {
    let graph = SoftwareGraphBuilder::new()
        .add_stages(vec![
            Stage::pixel_input("image", &[4, 4, 1])?,
            Stage::stencil("b", StencilOp::Add)
                .input("image", &[4, 4, 1], &[1, 1, 1], &[1, 1, 1], false)?
                .input("c", &[4, 4, 1], &[1, 1, 1], &[1, 1, 1], false)?,
            Stage::stencil("c", StencilOp::Identity).input(
                "b",
                &[4, 4, 1],
                &[1, 1, 1],
                &[1, 1, 1],
                false,
            )?,
        ])?
        .build()?;
    let hw = HardwareDescription::new()
        .with_memory(MemoryUnit::fifo("fifo"))
        .with_compute(
            ComputeUnit::new("alu", &[&[1, 1, 1]], &[1, 1, 1], 1e-12)?
                .reads(&["fifo"])
                .writes("fifo"),
        );
    let mapping = Mapping::new()
        .bind("image", "fifo")
        .bind("b", "alu")
        .bind("c", "alu");
    Pipeline::new(graph, hw, mapping, SimulationConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_named_pipeline_builds() {
        for name in PIPELINES {
            assert!(by_name(name).is_ok(), "{}", name);
        }
        assert!(matches!(by_name("nope"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn sensor_schedule() {
        let report = sensor_pipeline().unwrap().simulate_with_report().unwrap();
        assert_eq!(report.schedule.stage_finish_cycle["readout"], 0);
        assert_eq!(report.schedule.total_cycles, 256);
        assert_eq!(report.schedule.memory_writes["line"], 1024);
    }
}
