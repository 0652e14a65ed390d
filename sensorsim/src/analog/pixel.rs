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

//! In-pixel operators: light to charge, charge to voltage.

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use super::noise::{self, FixedPattern, NoiseRng};
use super::ops::{cv2, required, single_input, AnalogOperator};
use super::readout::{Adc, Comparator, SourceFollower};
use super::SignalDomain;
use crate::{Error, Tensor};

/// Pinned photodiode. Inputs are expected electron counts per pixel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Photodiode {
    pub capacitance: f64,
    pub voltage: f64,
    /// full well, in electrons
    pub max_input: f64,
    #[serde(default)]
    pub disable_shot_noise: bool,
    /// mean dark electrons per exposure
    pub dark_current: Option<f64>,
    #[serde(default)]
    pub enable_dcnu: bool,
    pub dcnu_std: Option<f64>,
    #[serde(skip)]
    dcnu: FixedPattern,
}

impl Photodiode {
    pub fn new(capacitance: f64, voltage: f64, max_input: f64) -> Self {
        Self {
            capacitance,
            voltage,
            max_input,
            disable_shot_noise: false,
            dark_current: None,
            enable_dcnu: false,
            dcnu_std: None,
            dcnu: FixedPattern::default(),
        }
    }

    pub fn without_shot_noise(mut self) -> Self {
        self.disable_shot_noise = true;
        self
    }

    pub fn dark_current(mut self, electrons: f64) -> Self {
        self.dark_current = Some(electrons);
        self
    }

    pub fn dcnu(mut self, std: f64) -> Self {
        self.enable_dcnu = true;
        self.dcnu_std = Some(std);
        self
    }
}

impl AnalogOperator for Photodiode {
    fn energy(&self) -> Result<f64, Error> {
        Ok(cv2(self.capacitance, self.voltage))
    }

    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let input = single_input("Photodiode", inputs)?;
        let mut output = if self.disable_shot_noise {
            input.clone()
        } else {
            input.mapv(|electrons| noise::poisson(rng, electrons))
        };
        if let Some(dark) = self.dark_current {
            if self.enable_dcnu {
                let std = required(self.dcnu_std, "Photodiode", "dcnu_std")?;
                let factors = self
                    .dcnu
                    .get_or_draw(rng, input.shape(), |rng, dim| {
                        noise::pixel_factors(rng, dim, std)
                    });
                Zip::from(&mut output)
                    .and(factors)
                    .for_each(|v, factor| *v += noise::poisson(rng, dark * f64::max(*factor, 0.0)));
            } else {
                output.mapv_inplace(|v| v + noise::poisson(rng, dark));
            }
        }
        noise::clip(&mut output, 0.0, self.max_input);
        Ok(vec![output])
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Optical]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Charge
    }

    fn reset_fixed_pattern(&mut self) {
        self.dcnu.reset();
    }
}

/// Charge to voltage conversion node, optionally emitting a reset
/// reference for correlated double sampling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FloatingDiffusion {
    pub capacitance: f64,
    pub voltage: f64,
    /// volts per electron
    pub conversion_gain: f64,
    pub read_noise: Option<f64>,
    #[serde(default)]
    pub enable_prnu: bool,
    pub prnu_std: Option<f64>,
    #[serde(default)]
    pub enable_cds: bool,
    pub reset_level: Option<f64>,
    /// fixed-pattern offset of the reset level
    pub reset_offset_std: Option<f64>,
    /// kTC noise, drawn per invocation
    pub reset_noise: Option<f64>,
    #[serde(skip)]
    prnu: FixedPattern,
    #[serde(skip)]
    reset_offset: FixedPattern,
}

impl FloatingDiffusion {
    pub fn new(capacitance: f64, voltage: f64, conversion_gain: f64) -> Self {
        Self {
            capacitance,
            voltage,
            conversion_gain,
            read_noise: None,
            enable_prnu: false,
            prnu_std: None,
            enable_cds: false,
            reset_level: None,
            reset_offset_std: None,
            reset_noise: None,
            prnu: FixedPattern::default(),
            reset_offset: FixedPattern::default(),
        }
    }

    pub fn read_noise(mut self, std: f64) -> Self {
        self.read_noise = Some(std);
        self
    }

    pub fn prnu(mut self, std: f64) -> Self {
        self.enable_prnu = true;
        self.prnu_std = Some(std);
        self
    }

    pub fn cds(mut self, reset_level: f64, reset_offset_std: f64, reset_noise: f64) -> Self {
        self.enable_cds = true;
        self.reset_level = Some(reset_level);
        self.reset_offset_std = Some(reset_offset_std);
        self.reset_noise = Some(reset_noise);
        self
    }
}

impl AnalogOperator for FloatingDiffusion {
    fn energy(&self) -> Result<f64, Error> {
        Ok(cv2(self.capacitance, self.voltage))
    }

    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let input = single_input("FloatingDiffusion", inputs)?;
        let upper = noise::max_value(input) * self.conversion_gain;
        let mut signal = input * self.conversion_gain;
        if self.enable_prnu {
            let std = required(self.prnu_std, "FloatingDiffusion", "prnu_std")?;
            signal *= self.prnu.get_or_draw(rng, input.shape(), |rng, dim| {
                noise::pixel_factors(rng, dim, std)
            });
        }
        if let Some(std) = self.read_noise {
            noise::add_gaussian(rng, &mut signal, |_| std);
        }
        noise::clip(&mut signal, 0.0, upper);
        if !self.enable_cds {
            return Ok(vec![signal]);
        }

        let level = required(self.reset_level, "FloatingDiffusion", "reset_level")?;
        let offset_std = self.reset_offset_std.unwrap_or(0.0);
        let mut reset = self
            .reset_offset
            .get_or_draw(rng, input.shape(), |rng, dim| {
                noise::gaussian_tensor(rng, dim, 0.0, offset_std)
            })
            + level;
        if let Some(std) = self.reset_noise {
            noise::add_gaussian(rng, &mut reset, |_| std);
        }
        Ok(vec![&reset + &signal, reset])
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Charge]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Voltage
    }

    fn reset_fixed_pattern(&mut self) {
        self.prnu.reset();
        self.reset_offset.reset();
    }
}

/// 3T or 4T active pixel: photodiode, an optional transfer to a floating
/// diffusion, and the in-pixel source follower.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivePixelSensor {
    pub num_transistor: u8,
    pub photodiode: Photodiode,
    pub floating_diffusion: FloatingDiffusion,
    pub source_follower: SourceFollower,
}

impl ActivePixelSensor {
    fn check_transistors(&self) -> Result<(), Error> {
        match self.num_transistor {
            3 | 4 => Ok(()),
            n => {
                log::error!("Active pixel with {} transistors", n);
                Err(Error::UnsupportedOption(format!(
                    "num_transistor = {} (expected 3 or 4)",
                    n
                )))
            }
        }
    }
}

impl AnalogOperator for ActivePixelSensor {
    fn energy(&self) -> Result<f64, Error> {
        self.check_transistors()?;
        let transfer = if self.num_transistor == 4 {
            self.floating_diffusion.energy()?
        } else {
            0.0
        };
        Ok(self.photodiode.energy()? + transfer + self.source_follower.energy()?)
    }

    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        self.check_transistors()?;
        let charge = self.photodiode.apply(inputs, rng)?;
        let voltages = self.floating_diffusion.apply(&charge, rng)?;
        voltages
            .into_iter()
            .map(|v| {
                self.source_follower
                    .apply(&[v], rng)
                    .map(|mut out| out.remove(0))
            })
            .collect()
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Optical]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Voltage
    }

    fn reset_fixed_pattern(&mut self) {
        self.photodiode.reset_fixed_pattern();
        self.floating_diffusion.reset_fixed_pattern();
        self.source_follower.reset_fixed_pattern();
    }
}

/// Digital pixel: photodiode with an in-pixel ADC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DigitalPixelSensor {
    pub photodiode: Photodiode,
    pub adc: Adc,
}

impl AnalogOperator for DigitalPixelSensor {
    fn energy(&self) -> Result<f64, Error> {
        Ok(self.photodiode.energy()? + self.adc.energy()?)
    }

    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let charge = self.photodiode.apply(inputs, rng)?;
        self.adc.apply(&charge, rng)
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Optical]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Digital
    }

    fn reset_fixed_pattern(&mut self) {
        self.photodiode.reset_fixed_pattern();
        self.adc.reset_fixed_pattern();
    }
}

/// Pulse-width modulation pixel: the photodiode discharge is compared
/// against a ramp, the pulse width encodes the intensity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PwmPixel {
    pub photodiode: Photodiode,
    pub comparator: Comparator,
}

impl AnalogOperator for PwmPixel {
    fn energy(&self) -> Result<f64, Error> {
        Ok(self.photodiode.energy()? + self.comparator.energy()?)
    }

    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let charge = self.photodiode.apply(inputs, rng)?;
        self.comparator.apply(&charge, rng)
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Optical]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Time
    }

    fn reset_fixed_pattern(&mut self) {
        self.photodiode.reset_fixed_pattern();
    }
}
