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

mod analog;
mod buffer;
mod config;
mod energy;
mod error;
mod hw;
mod mapping;
mod scheduler;
mod shape;
mod sim;
pub mod specs;

// ready-made pipelines (e.g., abs, blur, sensor)
pub mod predefined;

// Public types
// type to use for cycles
pub type Cycle = usize;
// dense tensors, indexed [x, y, z]
pub type Tensor = ndarray::ArrayD<f64>;

pub use crate::analog::{
    check_boundary, ActiveAnalogMemory, ActivePixelSensor, Adc, AnalogNode, AnalogOp,
    AnalogOperator, AnalogSystem, Capacitor, ColumnAmplifier, Comparator,
    CorrelatedDoubleSampling, Count, CurrentDac, CurrentMirror, DigitalPixelSensor,
    FloatingDiffusion, GeneralCircuit, Level, MaxVoltage, NodeKind, NoiseRng,
    PassiveAnalogMemory, PassiveSwitchedCapacitorArray, Photodiode, PwmPixel, SignalDomain,
    SourceFollower, SwitchedCapacitorFunction,
};
pub use crate::buffer::{Buffer, BufferKind, ReservationKey};
pub use crate::config::{
    EdgeConfig, Pipeline, PipelineConfig, SimulationConfig, StageConfig, DEFAULT_MAX_CYCLES,
};
pub use crate::energy::{simulate, simulate_with_report, EnergyBreakdown, EnergyReport};
pub use crate::error::Error;
pub use crate::hw::config::{
    AnalogConfiguration, ArrayConfiguration, ComponentConfiguration, ComputeConfiguration,
    HardwareConfiguration, UnitConfiguration,
};
pub use crate::hw::{ComputeUnit, HardwareDescription, MemoryUnit, Target};
pub use crate::mapping::Mapping;
pub use crate::scheduler::{schedule, ScheduleReport, Scheduler};
pub use crate::shape::Shape;
pub use crate::sim::{functional_simulate, StageOutputs};
pub use crate::specs::{
    DnnLayer, EdgeSpec, InputPosition, SoftwareGraph, SoftwareGraphBuilder, Stage, StageKind,
    StencilOp,
};
pub use petgraph::graph::NodeIndex;
