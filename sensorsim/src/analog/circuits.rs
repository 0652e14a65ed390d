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

use ndarray::{Axis, Zip};
use serde::{Deserialize, Serialize};

use super::noise::NoiseRng;
use super::ops::{amplifier_current, cv2, static_energy, AnalogOperator};
use super::SignalDomain;
use crate::{Error, Tensor};

fn same_shape<'a>(op: &str, inputs: &'a [Tensor]) -> Result<&'a Tensor, Error> {
    let first = inputs.first().ok_or_else(|| {
        log::error!("{} got no input tensor", op);
        Error::InvalidInput(format!("{} needs at least one input", op))
    })?;
    if inputs.iter().any(|t| t.shape() != first.shape()) {
        log::error!("{} inputs differ in shape", op);
        return Err(Error::InvalidInput(format!(
            "{} inputs must share one shape",
            op
        )));
    }
    Ok(first)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capacitor {
    pub capacitance: f64,
    pub voltage: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchedCapacitorFunction {
    Identity,
    /// charge sharing between the inputs
    Binning,
    /// charge-domain inner product over the channel axis
    Mac,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PassiveSwitchedCapacitorArray {
    pub capacitors: Vec<Capacitor>,
    pub function: SwitchedCapacitorFunction,
}

impl AnalogOperator for PassiveSwitchedCapacitorArray {
    fn energy(&self) -> Result<f64, Error> {
        Ok(self
            .capacitors
            .iter()
            .map(|c| cv2(c.capacitance, c.voltage))
            .sum())
    }

    fn apply(&mut self, inputs: &[Tensor], _rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        match self.function {
            SwitchedCapacitorFunction::Identity => Ok(inputs.to_vec()),
            SwitchedCapacitorFunction::Binning => {
                let first = same_shape("Binning", inputs)?;
                let mut shared = Tensor::zeros(first.raw_dim());
                for input in inputs {
                    shared += input;
                }
                shared /= inputs.len() as f64;
                Ok(vec![shared])
            }
            SwitchedCapacitorFunction::Mac => {
                let (signal, weights) = match inputs {
                    [signal] => (signal, None),
                    [signal, weights] => (signal, Some(weights)),
                    _ => {
                        return Err(Error::InvalidInput(format!(
                            "Mac takes a signal and optional weights, got {} tensors",
                            inputs.len()
                        )))
                    }
                };
                let channel = Axis(signal.ndim().saturating_sub(1));
                let product = match weights {
                    Some(weights) => {
                        let weights = weights.broadcast(signal.raw_dim()).ok_or_else(|| {
                            log::error!(
                                "Mac weights {:?} do not broadcast to {:?}",
                                weights.shape(),
                                signal.shape()
                            );
                            Error::InvalidInput("Mac weights do not broadcast".to_string())
                        })?;
                        signal * &weights
                    }
                    None => signal.clone(),
                };
                Ok(vec![product.sum_axis(channel).insert_axis(channel)])
            }
        }
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Voltage, SignalDomain::Charge]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Voltage
    }
}

/// Winner-take-all over its inputs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaxVoltage {
    pub supply: f64,
    pub load_capacitance: f64,
    pub gain: f64,
    pub gm_id: f64,
    pub t_frame: f64,
    pub num_inputs: usize,
}

impl AnalogOperator for MaxVoltage {
    fn energy(&self) -> Result<f64, Error> {
        if self.t_frame <= 0.0 || self.gm_id <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "MaxVoltage: t_frame {} and gm_id {} must be positive",
                self.t_frame, self.gm_id
            )));
        }
        let current = amplifier_current(self.load_capacitance, self.gain, self.t_frame, self.gm_id);
        Ok(self.num_inputs as f64 * static_energy(self.supply, current, self.t_frame))
    }

    fn apply(&mut self, inputs: &[Tensor], _rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let mut winner = same_shape("MaxVoltage", inputs)?.clone();
        for input in &inputs[1..] {
            Zip::from(&mut winner)
                .and(input)
                .for_each(|w, v| *w = f64::max(*w, *v));
        }
        Ok(vec![winner])
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Voltage]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Voltage
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurrentMirror {
    pub supply: f64,
    pub bias_current: f64,
    pub t_active: f64,
}

impl AnalogOperator for CurrentMirror {
    fn energy(&self) -> Result<f64, Error> {
        Ok(static_energy(self.supply, self.bias_current, self.t_active))
    }

    fn apply(&mut self, inputs: &[Tensor], _rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        Ok(inputs.to_vec())
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Current]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Current
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurrentDac {
    pub supply: f64,
    pub bias_current: f64,
    pub t_active: f64,
}

impl AnalogOperator for CurrentDac {
    fn energy(&self) -> Result<f64, Error> {
        Ok(static_energy(self.supply, self.bias_current, self.t_active))
    }

    fn apply(&mut self, inputs: &[Tensor], _rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        Ok(inputs.to_vec())
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Digital]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Current
    }
}

/// Sample-and-hold with an active buffer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActiveAnalogMemory {
    pub capacitance: f64,
    pub voltage: f64,
    pub supply: f64,
    pub bias_current: f64,
    pub t_hold: f64,
}

impl AnalogOperator for ActiveAnalogMemory {
    fn energy(&self) -> Result<f64, Error> {
        Ok(cv2(self.capacitance, self.voltage)
            + static_energy(self.supply, self.bias_current, self.t_hold))
    }

    fn apply(&mut self, inputs: &[Tensor], _rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        Ok(inputs.to_vec())
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Voltage]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Voltage
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PassiveAnalogMemory {
    pub capacitance: f64,
    pub voltage: f64,
}

impl AnalogOperator for PassiveAnalogMemory {
    fn energy(&self) -> Result<f64, Error> {
        Ok(cv2(self.capacitance, self.voltage))
    }

    fn apply(&mut self, inputs: &[Tensor], _rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        Ok(inputs.to_vec())
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Voltage]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Voltage
    }
}

/// A block characterized only by its energy per invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneralCircuit {
    pub energy: f64,
    pub input_domains: Vec<SignalDomain>,
    pub output_domain: SignalDomain,
}

impl AnalogOperator for GeneralCircuit {
    fn energy(&self) -> Result<f64, Error> {
        Ok(self.energy)
    }

    fn apply(&mut self, inputs: &[Tensor], _rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        Ok(inputs.to_vec())
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        self.input_domains.clone()
    }

    fn output_domain(&self) -> SignalDomain {
        self.output_domain
    }
}
