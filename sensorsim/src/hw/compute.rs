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

//! Digital compute units.
//!
//! A unit consumes one tile per input edge and produces one output tile per
//! active cycle. Tiles are (x, y, z) throughputs; several stages may be
//! bound to the same unit, which then serves one of them per cycle.

use crate::{Error, Shape};

#[derive(Clone, Debug, PartialEq)]
pub struct ComputeUnit {
    pub name: String,
    /// per-cycle input tile, one per input edge; a single entry applies to
    /// every edge
    pub input_per_cycle: Vec<Shape>,
    pub output_per_cycle: Shape,
    /// joules per active cycle
    pub energy_per_cycle: f64,
    /// memories read by the unit, one per input edge; a single entry
    /// applies to every edge
    pub input_buffers: Vec<String>,
    pub output_buffer: String,
}

impl ComputeUnit {
    /// Throughputs are (height, width, channels) per cycle.
    pub fn new(
        name: &str,
        input_per_cycle: &[&[usize]],
        output_per_cycle: &[usize],
        energy_per_cycle: f64,
    ) -> Result<Self, Error> {
        Ok(Self {
            name: name.to_string(),
            input_per_cycle: input_per_cycle
                .iter()
                .map(|hwc| Shape::from_hwc(hwc))
                .collect::<Result<_, _>>()?,
            output_per_cycle: Shape::from_hwc(output_per_cycle)?,
            energy_per_cycle,
            input_buffers: vec![],
            output_buffer: String::new(),
        })
    }

    pub fn reads(mut self, buffers: &[&str]) -> Self {
        self.input_buffers = buffers.iter().map(|b| b.to_string()).collect();
        self
    }

    pub fn writes(mut self, buffer: &str) -> Self {
        self.output_buffer = buffer.to_string();
        self
    }

    fn per_edge<'a, T>(&self, what: &str, items: &'a [T], edge: usize) -> Result<&'a T, Error> {
        match items {
            [single] => Ok(single),
            _ => items.get(edge).ok_or_else(|| {
                log::error!("Unit {} declares no {} for input {}", self.name, what, edge);
                Error::IncompleteDescription(format!(
                    "unit {}: no {} for input {}",
                    self.name, what, edge
                ))
            }),
        }
    }

    pub fn input_tile(&self, edge: usize) -> Result<Shape, Error> {
        self.per_edge("input_per_cycle", &self.input_per_cycle, edge)
            .map(|tile| *tile)
    }

    pub fn input_buffer(&self, edge: usize) -> Result<&str, Error> {
        self.per_edge("input_buffers", &self.input_buffers, edge)
            .map(|name| name.as_str())
    }

    pub fn output_buffer(&self) -> Result<&str, Error> {
        if self.output_buffer.is_empty() {
            log::error!("Unit {} declares no output buffer", self.name);
            return Err(Error::IncompleteDescription(format!(
                "unit {}: no output_buffer",
                self.name
            )));
        }
        Ok(&self.output_buffer)
    }

    /// Energy for `cycles` active cycles.
    pub fn energy(&self, cycles: usize) -> f64 {
        self.energy_per_cycle * cycles as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn single_entries_apply_to_every_edge() {
        let unit = ComputeUnit::new("adder", &[&[1, 4, 1]], &[1, 4, 1], 1e-12)
            .unwrap()
            .reads(&["lb"])
            .writes("out");
        assert_eq!(unit.input_tile(0), Ok(Shape::new(4, 1, 1)));
        assert_eq!(unit.input_tile(1), Ok(Shape::new(4, 1, 1)));
        assert_eq!(unit.input_buffer(3), Ok("lb"));
        assert_eq!(unit.output_buffer(), Ok("out"));
        assert!(approx_eq!(f64, unit.energy(10), 1e-11, epsilon = 1e-24));
    }

    #[test]
    fn missing_entries() {
        let unit = ComputeUnit::new("mac", &[&[3, 3, 1], &[1, 1, 1]], &[1, 1, 1], 0.0).unwrap();
        assert_eq!(unit.input_tile(1), Ok(Shape::new(1, 1, 1)));
        assert!(matches!(
            unit.input_tile(2),
            Err(Error::IncompleteDescription(_))
        ));
        assert!(matches!(
            unit.input_buffer(0),
            Err(Error::IncompleteDescription(_))
        ));
        assert!(matches!(
            unit.output_buffer(),
            Err(Error::IncompleteDescription(_))
        ));
    }
}
