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

//! Analog sensor model: components grouped into units, units into arrays,
//! each carrying an energy formula and a noise model.

mod circuits;
mod domain;
pub(crate) mod noise;
mod node;
mod ops;
mod pixel;
mod readout;
mod system;

pub use circuits::{
    ActiveAnalogMemory, Capacitor, CurrentDac, CurrentMirror, GeneralCircuit, MaxVoltage,
    PassiveAnalogMemory, PassiveSwitchedCapacitorArray, SwitchedCapacitorFunction,
};
pub use domain::SignalDomain;
pub use noise::NoiseRng;
pub use node::{AnalogNode, Count, Level, NodeKind};
pub use ops::{AnalogOp, AnalogOperator};
pub use pixel::{ActivePixelSensor, DigitalPixelSensor, FloatingDiffusion, Photodiode, PwmPixel};
pub use readout::{Adc, ColumnAmplifier, Comparator, CorrelatedDoubleSampling, SourceFollower};
pub use system::{check_boundary, AnalogSystem};
