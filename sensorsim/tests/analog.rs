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

use std::collections::BTreeMap;

use float_cmp::approx_eq;
use ndarray::IxDyn;
use rand::SeedableRng;

use sensorsim::{
    Adc, AnalogNode, AnalogOp, AnalogOperator, AnalogSystem, ComputeUnit,
    CorrelatedDoubleSampling, FloatingDiffusion, HardwareDescription, Mapping, MemoryUnit,
    NoiseRng, Photodiode, Pipeline, SimulationConfig, SoftwareGraphBuilder, SourceFollower,
    Stage, StencilOp, Tensor,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ramp(dim: &[usize], step: f64) -> Tensor {
    Tensor::from_shape_fn(IxDyn(dim), |i| step * (1 + i[0] + dim[0] * i[1]) as f64)
}

fn mean_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
    (a - b).mapv(f64::abs).mean().unwrap_or(f64::INFINITY)
}

#[test]
fn photodiode_and_adc_energy() {
    let pd = Photodiode::new(100e-15, 3.3, 1e4);
    assert!(approx_eq!(f64, pd.energy().unwrap(), 1.089e-12, epsilon = 1e-20));
    let adc = Adc::new(100e-15, 8).adc_type("SS");
    assert!(approx_eq!(f64, adc.energy().unwrap(), 25.6e-12, epsilon = 1e-20));

    let mut pixel = AnalogNode::unit("pixel");
    pixel
        .add(AnalogNode::component("pd", AnalogOp::Photodiode(pd)))
        .unwrap()
        .add(AnalogNode::component("adc", AnalogOp::Adc(adc)))
        .unwrap()
        .connect("pd", "adc")
        .unwrap();
    assert!(approx_eq!(f64, pixel.energy().unwrap(), 26.689e-12, epsilon = 1e-20));
}

fn floating_diffusion_unit(cds: bool) -> AnalogNode {
    let mut fd = FloatingDiffusion::new(5e-15, 3.3, 1e-4).prnu(0.02);
    if cds {
        fd = fd.cds(1.0, 0.05, 0.0);
    }
    let mut unit = AnalogNode::unit("pixel");
    unit.add(AnalogNode::component(
        "pd",
        AnalogOp::Photodiode(Photodiode::new(100e-15, 3.3, 1e4).without_shot_noise()),
    ))
    .unwrap()
    .add(AnalogNode::component("fd", AnalogOp::FloatingDiffusion(fd)))
    .unwrap()
    .connect("pd", "fd")
    .unwrap();
    unit
}

#[test]
fn cds_cancels_reset_offset() {
    init();
    let light = ramp(&[8, 8, 1], 100.0);

    let mut plain = floating_diffusion_unit(false);
    let reference = plain
        .forward(&[light.clone()], &mut NoiseRng::seed_from_u64(5))
        .unwrap();

    // without the subtraction the reset level and its offsets remain
    let mut sampled = floating_diffusion_unit(true);
    let raw = sampled
        .forward(&[light.clone()], &mut NoiseRng::seed_from_u64(5))
        .unwrap();
    assert_eq!(raw.len(), 2);
    assert!(mean_abs_diff(&raw[0], &reference[0]) > 0.5);

    let mut corrected = floating_diffusion_unit(true);
    corrected
        .add(AnalogNode::component(
            "cds",
            AnalogOp::CorrelatedDoubleSampling(CorrelatedDoubleSampling {
                capacitance: 1e-15,
                voltage: 3.3,
                gain: 1.0,
                noise: None,
            }),
        ))
        .unwrap()
        .connect("fd", "cds")
        .unwrap();
    let output = corrected
        .forward(&[light], &mut NoiseRng::seed_from_u64(5))
        .unwrap();
    assert_eq!(output.len(), 1);
    assert!(mean_abs_diff(&output[0], &reference[0]) < 1e-6);
}

fn noiseless_sensor() -> AnalogSystem {
    let mut pixel = AnalogNode::unit("pixel");
    pixel
        .add(AnalogNode::component(
            "pd",
            AnalogOp::Photodiode(Photodiode::new(100e-15, 3.3, 1e4).without_shot_noise()),
        ))
        .unwrap()
        .add(AnalogNode::component(
            "fd",
            AnalogOp::FloatingDiffusion(FloatingDiffusion::new(5e-15, 3.3, 1.0)),
        ))
        .unwrap()
        .add(AnalogNode::component(
            "sf",
            AnalogOp::SourceFollower(SourceFollower::new(1.0).load(1e-12, 3.3, 1.0)),
        ))
        .unwrap()
        .add(AnalogNode::component(
            "adc",
            AnalogOp::Adc(Adc::new(1e-15, 24).full_scale(1e4)),
        ))
        .unwrap()
        .connect("pd", "fd")
        .unwrap()
        .connect("fd", "sf")
        .unwrap()
        .connect("sf", "adc")
        .unwrap();
    let mut array = AnalogNode::array("sensor").with_count(8, 8);
    array.add(pixel).unwrap();
    let mut analog = AnalogSystem::new();
    analog.add_array(array).unwrap();
    analog
}

#[test]
fn noiseless_chain_is_identity() {
    init();
    let graph = SoftwareGraphBuilder::new()
        .add_stages(vec![
            Stage::pixel_input("light", &[8, 8, 1]).unwrap(),
            Stage::stencil("copy", StencilOp::Identity)
                .input("light", &[8, 8, 1], &[1, 1, 1], &[1, 1, 1], false)
                .unwrap(),
        ])
        .unwrap()
        .build()
        .unwrap();
    let hw = HardwareDescription::new()
        .with_memory(MemoryUnit::fifo("fifo"))
        .with_compute(
            ComputeUnit::new("alu", &[&[1, 1, 1]], &[1, 1, 1], 1e-12)
                .unwrap()
                .reads(&["fifo"])
                .writes("fifo"),
        )
        .with_analog(noiseless_sensor());
    let mapping = Mapping::new().bind("light", "sensor").bind("copy", "alu");
    let mut pipeline = Pipeline::new(graph, hw, mapping, SimulationConfig::default()).unwrap();

    let light = ramp(&[8, 8, 1], 100.0);
    let mut inputs = BTreeMap::new();
    inputs.insert("light".to_string(), vec![light.clone()]);
    let outputs = pipeline.functional_simulate(&inputs).unwrap();
    let quantum = 1e4 / (2f64.powi(24) - 1.0);
    let copy = &outputs["copy"][0];
    assert_eq!(copy.shape(), light.shape());
    for (out, expected) in copy.iter().zip(light.iter()) {
        assert!((out - expected).abs() <= quantum, "{} vs {}", out, expected);
    }
}
