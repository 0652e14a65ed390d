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

//! The catalogue of analog operators.
//!
//! Every operator is a variant of [`AnalogOp`] carrying only its device
//! parameters; the energy and forward rules are total over the variants.

use serde::{Deserialize, Serialize};

use super::circuits::{
    ActiveAnalogMemory, CurrentDac, CurrentMirror, GeneralCircuit, MaxVoltage,
    PassiveAnalogMemory, PassiveSwitchedCapacitorArray,
};
use super::noise::NoiseRng;
use super::pixel::{ActivePixelSensor, DigitalPixelSensor, FloatingDiffusion, Photodiode, PwmPixel};
use super::readout::{Adc, ColumnAmplifier, Comparator, CorrelatedDoubleSampling, SourceFollower};
use super::SignalDomain;
use crate::{Error, Tensor};

pub trait AnalogOperator {
    /// Energy of one invocation, in joules.
    fn energy(&self) -> Result<f64, Error>;

    /// Applies the gain and noise model. `inputs` are in declared order.
    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error>;

    fn input_domains(&self) -> Vec<SignalDomain>;

    fn output_domain(&self) -> SignalDomain;

    /// Forgets the fixed-pattern noise drawn so far.
    fn reset_fixed_pattern(&mut self) {}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnalogOp {
    Photodiode(Photodiode),
    FloatingDiffusion(FloatingDiffusion),
    ActivePixelSensor(ActivePixelSensor),
    DigitalPixelSensor(DigitalPixelSensor),
    PwmPixel(PwmPixel),
    SourceFollower(SourceFollower),
    ColumnAmplifier(ColumnAmplifier),
    CorrelatedDoubleSampling(CorrelatedDoubleSampling),
    Adc(Adc),
    Comparator(Comparator),
    PassiveSwitchedCapacitorArray(PassiveSwitchedCapacitorArray),
    MaxVoltage(MaxVoltage),
    CurrentMirror(CurrentMirror),
    CurrentDac(CurrentDac),
    ActiveAnalogMemory(ActiveAnalogMemory),
    PassiveAnalogMemory(PassiveAnalogMemory),
    GeneralCircuit(GeneralCircuit),
}

impl AnalogOp {
    fn inner(&self) -> &dyn AnalogOperator {
        match self {
            Self::Photodiode(op) => op as &dyn AnalogOperator,
            Self::FloatingDiffusion(op) => op as &dyn AnalogOperator,
            Self::ActivePixelSensor(op) => op as &dyn AnalogOperator,
            Self::DigitalPixelSensor(op) => op as &dyn AnalogOperator,
            Self::PwmPixel(op) => op as &dyn AnalogOperator,
            Self::SourceFollower(op) => op as &dyn AnalogOperator,
            Self::ColumnAmplifier(op) => op as &dyn AnalogOperator,
            Self::CorrelatedDoubleSampling(op) => op as &dyn AnalogOperator,
            Self::Adc(op) => op as &dyn AnalogOperator,
            Self::Comparator(op) => op as &dyn AnalogOperator,
            Self::PassiveSwitchedCapacitorArray(op) => op as &dyn AnalogOperator,
            Self::MaxVoltage(op) => op as &dyn AnalogOperator,
            Self::CurrentMirror(op) => op as &dyn AnalogOperator,
            Self::CurrentDac(op) => op as &dyn AnalogOperator,
            Self::ActiveAnalogMemory(op) => op as &dyn AnalogOperator,
            Self::PassiveAnalogMemory(op) => op as &dyn AnalogOperator,
            Self::GeneralCircuit(op) => op as &dyn AnalogOperator,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn AnalogOperator {
        match self {
            Self::Photodiode(op) => op as &mut dyn AnalogOperator,
            Self::FloatingDiffusion(op) => op as &mut dyn AnalogOperator,
            Self::ActivePixelSensor(op) => op as &mut dyn AnalogOperator,
            Self::DigitalPixelSensor(op) => op as &mut dyn AnalogOperator,
            Self::PwmPixel(op) => op as &mut dyn AnalogOperator,
            Self::SourceFollower(op) => op as &mut dyn AnalogOperator,
            Self::ColumnAmplifier(op) => op as &mut dyn AnalogOperator,
            Self::CorrelatedDoubleSampling(op) => op as &mut dyn AnalogOperator,
            Self::Adc(op) => op as &mut dyn AnalogOperator,
            Self::Comparator(op) => op as &mut dyn AnalogOperator,
            Self::PassiveSwitchedCapacitorArray(op) => op as &mut dyn AnalogOperator,
            Self::MaxVoltage(op) => op as &mut dyn AnalogOperator,
            Self::CurrentMirror(op) => op as &mut dyn AnalogOperator,
            Self::CurrentDac(op) => op as &mut dyn AnalogOperator,
            Self::ActiveAnalogMemory(op) => op as &mut dyn AnalogOperator,
            Self::PassiveAnalogMemory(op) => op as &mut dyn AnalogOperator,
            Self::GeneralCircuit(op) => op as &mut dyn AnalogOperator,
        }
    }
}

impl AnalogOperator for AnalogOp {
    fn energy(&self) -> Result<f64, Error> {
        let energy = self.inner().energy()?;
        if !energy.is_finite() || energy < 0.0 {
            log::error!("{:?} reports energy {}", self, energy);
            return Err(Error::InvalidInput(format!(
                "energy must be a non-negative number of joules, got {}",
                energy
            )));
        }
        Ok(energy)
    }

    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        self.inner_mut().apply(inputs, rng)
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        self.inner().input_domains()
    }

    fn output_domain(&self) -> SignalDomain {
        self.inner().output_domain()
    }

    fn reset_fixed_pattern(&mut self) {
        self.inner_mut().reset_fixed_pattern()
    }
}

/// A parameter that may be omitted from a description but is needed by the
/// requested behavior.
pub(crate) fn required(value: Option<f64>, op: &str, key: &str) -> Result<f64, Error> {
    value.ok_or_else(|| {
        log::error!("{} needs {} for the selected options", op, key);
        Error::IncompleteDescription(format!("{}: missing {}", op, key))
    })
}

/// Operators that transform exactly one tensor.
pub(crate) fn single_input<'a>(op: &str, inputs: &'a [Tensor]) -> Result<&'a Tensor, Error> {
    match inputs {
        [input] => Ok(input),
        _ => {
            log::error!("{} takes one input tensor, got {}", op, inputs.len());
            Err(Error::InvalidInput(format!(
                "{} takes one input tensor, got {}",
                op,
                inputs.len()
            )))
        }
    }
}

/// Supply-powered blocks: `supply * bias * time`.
pub(crate) fn static_energy(supply: f64, bias_current: f64, time: f64) -> f64 {
    supply * bias_current * time
}

/// Switched capacitance: `C * V^2`.
pub(crate) fn cv2(capacitance: f64, voltage: f64) -> f64 {
    capacitance * voltage * voltage
}

/// Bias current of a gm/Id-sized amplifier settling `load_capacitance` to
/// `gain` within `time`.
pub(crate) fn amplifier_current(load_capacitance: f64, gain: f64, time: f64, gm_id: f64) -> f64 {
    let gm = 2.0 * std::f64::consts::PI * load_capacitance * gain / time;
    gm / gm_id
}
