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

//! Readout chain: amplification, double sampling and conversion.

use serde::{Deserialize, Serialize};

use super::noise::{self, FixedPattern, NoiseRng};
use super::ops::{amplifier_current, cv2, required, single_input, static_energy, AnalogOperator};
use super::SignalDomain;
use crate::{Error, Tensor};

fn unity_gain() -> f64 {
    1.0
}

/// Additive noise whose std is either `level` volts or `level` percent of
/// the value.
fn add_noise(
    rng: &mut NoiseRng,
    tensor: &mut Tensor,
    level: Option<f64>,
    percentage: bool,
) {
    if let Some(std) = level {
        if percentage {
            noise::add_gaussian(rng, tensor, |v| v.abs() * std / 100.0);
        } else {
            noise::add_gaussian(rng, tensor, |_| std);
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceFollower {
    pub gain: f64,
    #[serde(default)]
    pub enable_prnu: bool,
    pub prnu_std: Option<f64>,
    pub noise: Option<f64>,
    #[serde(default)]
    pub noise_percentage: bool,
    pub supply: Option<f64>,
    pub load_capacitance: Option<f64>,
    pub swing: Option<f64>,
    pub bias_current: Option<f64>,
    pub t_readout: Option<f64>,
    #[serde(skip)]
    prnu: FixedPattern,
}

impl SourceFollower {
    pub fn new(gain: f64) -> Self {
        Self {
            gain,
            enable_prnu: false,
            prnu_std: None,
            noise: None,
            noise_percentage: false,
            supply: None,
            load_capacitance: None,
            swing: None,
            bias_current: None,
            t_readout: None,
            prnu: FixedPattern::default(),
        }
    }

    /// Energy from charging the column load: `C_load * supply * swing`.
    pub fn load(mut self, load_capacitance: f64, supply: f64, swing: f64) -> Self {
        self.load_capacitance = Some(load_capacitance);
        self.supply = Some(supply);
        self.swing = Some(swing);
        self
    }

    /// Energy from a static bias: `supply * bias * t_readout`.
    pub fn biased(mut self, supply: f64, bias_current: f64, t_readout: f64) -> Self {
        self.supply = Some(supply);
        self.bias_current = Some(bias_current);
        self.t_readout = Some(t_readout);
        self
    }

    pub fn prnu(mut self, std: f64) -> Self {
        self.enable_prnu = true;
        self.prnu_std = Some(std);
        self
    }

    pub fn noise(mut self, std: f64) -> Self {
        self.noise = Some(std);
        self.noise_percentage = false;
        self
    }

    pub fn noise_percent(mut self, percent: f64) -> Self {
        self.noise = Some(percent);
        self.noise_percentage = true;
        self
    }
}

impl AnalogOperator for SourceFollower {
    fn energy(&self) -> Result<f64, Error> {
        let supply = required(self.supply, "SourceFollower", "supply")?;
        match self.bias_current {
            Some(bias) => Ok(static_energy(
                supply,
                bias,
                required(self.t_readout, "SourceFollower", "t_readout")?,
            )),
            None => Ok(required(self.load_capacitance, "SourceFollower", "load_capacitance")?
                * supply
                * required(self.swing, "SourceFollower", "swing")?),
        }
    }

    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let input = single_input("SourceFollower", inputs)?;
        let upper = noise::max_value(input) * self.gain;
        let mut output = input * self.gain;
        if self.enable_prnu {
            let std = required(self.prnu_std, "SourceFollower", "prnu_std")?;
            output *= self.prnu.get_or_draw(rng, input.shape(), |rng, dim| {
                noise::pixel_factors(rng, dim, std)
            });
        }
        add_noise(rng, &mut output, self.noise, self.noise_percentage);
        noise::clip(&mut output, 0.0, upper);
        Ok(vec![output])
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Voltage]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Voltage
    }

    fn reset_fixed_pattern(&mut self) {
        self.prnu.reset();
    }
}

/// Column-parallel amplifier. Gain variation is per column (the x axis).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnAmplifier {
    pub gain: f64,
    #[serde(default)]
    pub enable_prnu: bool,
    pub prnu_std: Option<f64>,
    pub noise: Option<f64>,
    #[serde(default)]
    pub noise_percentage: bool,
    /// added before the gain
    pub pixel_offset: Option<f64>,
    /// added after the gain
    pub column_offset: Option<f64>,
    pub supply: f64,
    pub load_capacitance: f64,
    pub input_capacitance: f64,
    pub t_sample: f64,
    pub t_hold: f64,
    pub gm_id: f64,
    #[serde(skip)]
    prnu: FixedPattern,
}

impl ColumnAmplifier {
    pub fn new(
        gain: f64,
        supply: f64,
        load_capacitance: f64,
        input_capacitance: f64,
        t_sample: f64,
        t_hold: f64,
        gm_id: f64,
    ) -> Self {
        Self {
            gain,
            enable_prnu: false,
            prnu_std: None,
            noise: None,
            noise_percentage: false,
            pixel_offset: None,
            column_offset: None,
            supply,
            load_capacitance,
            input_capacitance,
            t_sample,
            t_hold,
            gm_id,
            prnu: FixedPattern::default(),
        }
    }

    pub fn prnu(mut self, std: f64) -> Self {
        self.enable_prnu = true;
        self.prnu_std = Some(std);
        self
    }

    pub fn noise(mut self, std: f64) -> Self {
        self.noise = Some(std);
        self
    }

    pub fn offsets(mut self, pixel: f64, column: f64) -> Self {
        self.pixel_offset = Some(pixel);
        self.column_offset = Some(column);
        self
    }
}

impl AnalogOperator for ColumnAmplifier {
    fn energy(&self) -> Result<f64, Error> {
        if self.t_sample <= 0.0 || self.gm_id <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "ColumnAmplifier: t_sample {} and gm_id {} must be positive",
                self.t_sample, self.gm_id
            )));
        }
        let current =
            amplifier_current(self.load_capacitance, self.gain, self.t_sample, self.gm_id);
        Ok(static_energy(self.supply, current, self.t_sample + self.t_hold)
            + cv2(self.input_capacitance, self.supply))
    }

    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let input = single_input("ColumnAmplifier", inputs)?;
        let pixel_offset = self.pixel_offset.unwrap_or(0.0);
        let column_offset = self.column_offset.unwrap_or(0.0);
        let upper = (noise::max_value(input) + pixel_offset) * self.gain + column_offset;
        let mut output = (input + pixel_offset) * self.gain;
        if self.enable_prnu {
            let std = required(self.prnu_std, "ColumnAmplifier", "prnu_std")?;
            output *= self.prnu.get_or_draw(rng, input.shape(), |rng, dim| {
                noise::column_factors(rng, dim, std)
            });
        }
        output += column_offset;
        add_noise(rng, &mut output, self.noise, self.noise_percentage);
        noise::clip(&mut output, 0.0, upper.max(0.0));
        Ok(vec![output])
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Voltage]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Voltage
    }

    fn reset_fixed_pattern(&mut self) {
        self.prnu.reset();
    }
}

/// Subtracts the reset reference (second input) from the signal (first
/// input).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrelatedDoubleSampling {
    /// sampling capacitor, charged twice per conversion
    pub capacitance: f64,
    pub voltage: f64,
    #[serde(default = "unity_gain")]
    pub gain: f64,
    pub noise: Option<f64>,
}

impl AnalogOperator for CorrelatedDoubleSampling {
    fn energy(&self) -> Result<f64, Error> {
        Ok(2.0 * cv2(self.capacitance, self.voltage))
    }

    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let (signal, reset) = match inputs {
            [signal, reset] if signal.shape() == reset.shape() => (signal, reset),
            _ => {
                log::error!(
                    "CDS expects a signal and a reset reference of equal shape, got {:?}",
                    inputs.iter().map(|t| t.shape().to_vec()).collect::<Vec<_>>()
                );
                return Err(Error::InvalidInput(
                    "CorrelatedDoubleSampling takes [signal, reset]".to_string(),
                ));
            }
        };
        // output stays within the signal range scaled by the gain
        let upper = noise::max_value(signal) * self.gain;
        let mut output = (signal - reset) * self.gain;
        add_noise(rng, &mut output, self.noise, false);
        noise::clip(&mut output, 0.0, upper.max(0.0));
        Ok(vec![output])
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Voltage]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Voltage
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adc {
    /// joules per conversion step
    pub fom: f64,
    pub resolution: u32,
    /// reporting only, e.g. "SS" or "SAR"
    pub adc_type: Option<String>,
    pub noise: Option<f64>,
    /// defaults to the largest input value of each conversion
    pub full_scale: Option<f64>,
}

impl Adc {
    pub fn new(fom: f64, resolution: u32) -> Self {
        Self {
            fom,
            resolution,
            adc_type: None,
            noise: None,
            full_scale: None,
        }
    }

    pub fn adc_type(mut self, adc_type: &str) -> Self {
        self.adc_type = Some(adc_type.to_string());
        self
    }

    pub fn full_scale(mut self, full_scale: f64) -> Self {
        self.full_scale = Some(full_scale);
        self
    }

    pub fn noise(mut self, std: f64) -> Self {
        self.noise = Some(std);
        self
    }

    fn levels(&self) -> Result<f64, Error> {
        if self.resolution == 0 || self.resolution > 52 {
            log::error!("ADC resolution {} out of range", self.resolution);
            return Err(Error::UnsupportedOption(format!(
                "ADC resolution {} (expected 1..=52 bits)",
                self.resolution
            )));
        }
        Ok(2f64.powi(self.resolution as i32))
    }
}

impl AnalogOperator for Adc {
    fn energy(&self) -> Result<f64, Error> {
        Ok(self.fom * self.levels()?)
    }

    fn apply(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let input = single_input("Adc", inputs)?;
        let steps = self.levels()? - 1.0;
        let full_scale = self.full_scale.unwrap_or_else(|| noise::max_value(input));
        let mut output = input.clone();
        add_noise(rng, &mut output, self.noise, false);
        if full_scale <= 0.0 {
            output.fill(0.0);
            return Ok(vec![output]);
        }
        output.mapv_inplace(|v| {
            let code = (v.max(0.0).min(full_scale) / full_scale * steps).round();
            code / steps * full_scale
        });
        Ok(vec![output])
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Voltage, SignalDomain::Charge]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Digital
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Comparator {
    pub supply: f64,
    pub bias_current: f64,
    pub t_compare: f64,
    /// without a threshold the comparison result is the input itself
    pub threshold: Option<f64>,
}

impl AnalogOperator for Comparator {
    fn energy(&self) -> Result<f64, Error> {
        Ok(static_energy(self.supply, self.bias_current, self.t_compare))
    }

    fn apply(&mut self, inputs: &[Tensor], _rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let input = single_input("Comparator", inputs)?;
        Ok(vec![match self.threshold {
            Some(threshold) => input.mapv(|v| if v >= threshold { 1.0 } else { 0.0 }),
            None => input.clone(),
        }])
    }

    fn input_domains(&self) -> Vec<SignalDomain> {
        vec![SignalDomain::Voltage, SignalDomain::Time]
    }

    fn output_domain(&self) -> SignalDomain {
        SignalDomain::Digital
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use ndarray::IxDyn;
    use rand::SeedableRng;

    fn ramp() -> Tensor {
        Tensor::from_shape_fn(IxDyn(&[8, 4, 1]), |i| (i[0] + 8 * i[1]) as f64 / 31.0)
    }

    #[test]
    fn adc_energy_and_levels() {
        let adc = Adc::new(100e-15, 8).adc_type("SS");
        assert!(approx_eq!(f64, adc.energy().unwrap(), 25.6e-12, epsilon = 1e-18));
        assert!(matches!(
            Adc::new(1e-15, 0).energy(),
            Err(Error::UnsupportedOption(_))
        ));
    }

    #[test]
    fn adc_quantizes() {
        let mut rng = NoiseRng::seed_from_u64(0);
        let mut adc = Adc::new(1e-15, 2).full_scale(1.0);
        let out = adc.apply(&[ramp()], &mut rng).unwrap().remove(0);
        for v in out.iter() {
            let code = v * 3.0;
            assert!(approx_eq!(f64, code, code.round(), epsilon = 1e-9));
        }

        let mut fine = Adc::new(1e-15, 16).full_scale(1.0);
        let out = fine.apply(&[ramp()], &mut rng).unwrap().remove(0);
        for (a, b) in out.iter().zip(ramp().iter()) {
            assert!((a - b).abs() <= 1.0 / 65535.0);
        }
    }

    #[test]
    fn column_gain_is_shared_by_a_column() {
        let mut rng = NoiseRng::seed_from_u64(9);
        let mut amp =
            ColumnAmplifier::new(2.0, 1.0, 1e-12, 1e-13, 1e-6, 1e-6, 10.0).prnu(0.05);
        let input = Tensor::from_elem(IxDyn(&[6, 5, 1]), 0.25);
        let out = amp.apply(&[input], &mut rng).unwrap().remove(0);
        for x in 0..6 {
            for y in 1..5 {
                assert_eq!(out[[x, y, 0]], out[[x, 0, 0]]);
            }
        }
    }

    #[test]
    fn column_offsets() {
        let mut rng = NoiseRng::seed_from_u64(9);
        let mut amp =
            ColumnAmplifier::new(2.0, 1.0, 1e-12, 1e-13, 1e-6, 1e-6, 10.0).offsets(0.1, 0.05);
        let input = Tensor::from_elem(IxDyn(&[2, 2, 1]), 0.25);
        let out = amp.apply(&[input], &mut rng).unwrap().remove(0);
        assert!(out.iter().all(|v| approx_eq!(f64, *v, 0.75, epsilon = 1e-12)));
    }

    #[test]
    fn column_amplifier_energy() {
        let amp = ColumnAmplifier::new(1.0, 1.0, 1e-12, 1e-13, 1e-6, 1e-6, 10.0);
        // I = 2*pi*1e-12/1e-6/10, E = I * 2e-6 + 1e-13
        let current = 2.0 * std::f64::consts::PI * 1e-12 / 1e-6 / 10.0;
        let expected = current * 2e-6 + 1e-13;
        assert!(approx_eq!(f64, amp.energy().unwrap(), expected, epsilon = 1e-20));
    }

    #[test]
    fn source_follower_energy_modes() {
        let load = SourceFollower::new(1.0).load(1e-12, 2.0, 0.5);
        assert!(approx_eq!(f64, load.energy().unwrap(), 1e-12, epsilon = 1e-20));
        let biased = SourceFollower::new(1.0).biased(2.0, 1e-6, 1e-6);
        assert!(approx_eq!(f64, biased.energy().unwrap(), 2e-12, epsilon = 1e-20));
        assert!(matches!(
            SourceFollower::new(1.0).energy(),
            Err(Error::IncompleteDescription(_))
        ));
    }

    #[test]
    fn cds_needs_two_inputs() {
        let mut rng = NoiseRng::seed_from_u64(0);
        let mut cds = CorrelatedDoubleSampling {
            capacitance: 1e-15,
            voltage: 1.0,
            gain: 1.0,
            noise: None,
        };
        assert!(cds.apply(&[ramp()], &mut rng).is_err());
        let reset = Tensor::from_elem(IxDyn(&[8, 4, 1]), 0.5);
        let signal = &ramp() + &reset;
        let out = cds.apply(&[signal, reset], &mut rng).unwrap().remove(0);
        for (a, b) in out.iter().zip(ramp().iter()) {
            assert!(approx_eq!(f64, *a, *b, epsilon = 1e-12));
        }
    }

    #[test]
    fn cds_stays_within_scaled_signal_range() {
        let mut rng = NoiseRng::seed_from_u64(0);
        let mut cds = CorrelatedDoubleSampling {
            capacitance: 1e-15,
            voltage: 1.0,
            gain: 2.0,
            noise: None,
        };
        // a large negative reset offset would push every value past 2 V
        let reset = Tensor::from_elem(IxDyn(&[8, 4, 1]), -10.0);
        let out = cds.apply(&[ramp(), reset], &mut rng).unwrap().remove(0);
        assert!(out.iter().all(|v| approx_eq!(f64, *v, 2.0, epsilon = 1e-12)));

        let reset = Tensor::from_elem(IxDyn(&[8, 4, 1]), 0.25);
        let signal = &ramp() + &reset;
        let out = cds.apply(&[signal, reset], &mut rng).unwrap().remove(0);
        for (a, b) in out.iter().zip(ramp().iter()) {
            assert!(approx_eq!(f64, *a, 2.0 * b, epsilon = 1e-12));
        }
    }

    #[test]
    fn comparator_thresholds() {
        let mut rng = NoiseRng::seed_from_u64(0);
        let mut cmp = Comparator {
            supply: 1.0,
            bias_current: 1e-6,
            t_compare: 1e-6,
            threshold: Some(0.5),
        };
        let out = cmp.apply(&[ramp()], &mut rng).unwrap().remove(0);
        assert!(out.iter().all(|v| *v == 0.0 || *v == 1.0));
        assert_eq!(out.sum(), ramp().iter().filter(|v| **v >= 0.5).count() as f64);
    }
}
