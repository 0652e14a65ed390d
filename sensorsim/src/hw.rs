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

pub(super) mod compute;
pub(super) mod config;
pub(super) mod memory;

pub use crate::hw::compute::ComputeUnit;
pub use crate::hw::memory::MemoryUnit;

use std::collections::HashSet;

use crate::analog::{AnalogNode, AnalogSystem};
use crate::Error;

/// The hardware a stage can be bound to.
#[derive(Clone, Copy, Debug)]
pub enum Target<'a> {
    Memory(&'a MemoryUnit),
    Compute(&'a ComputeUnit),
    Analog(&'a AnalogNode),
}

impl<'a> Target<'a> {
    pub fn name(&self) -> &'a str {
        match *self {
            Self::Memory(memory) => &memory.name,
            Self::Compute(compute) => &compute.name,
            Self::Analog(array) => array.name(),
        }
    }

    pub fn is_analog(&self) -> bool {
        matches!(self, Self::Analog(_))
    }
}

/// Digital memories, digital compute units and analog arrays.
#[derive(Clone, Debug, Default)]
pub struct HardwareDescription {
    pub memory: Vec<MemoryUnit>,
    pub compute: Vec<ComputeUnit>,
    pub analog: AnalogSystem,
}

impl HardwareDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory(mut self, memory: MemoryUnit) -> Self {
        self.memory.push(memory);
        self
    }

    pub fn with_compute(mut self, compute: ComputeUnit) -> Self {
        self.compute.push(compute);
        self
    }

    pub fn with_analog(mut self, analog: AnalogSystem) -> Self {
        self.analog = analog;
        self
    }

    pub fn memory(&self, name: &str) -> Option<&MemoryUnit> {
        self.memory.iter().find(|m| m.name == name)
    }

    pub fn compute(&self, name: &str) -> Option<&ComputeUnit> {
        self.compute.iter().find(|c| c.name == name)
    }

    /// Resolves a hardware name. A name that is both an analog array and a
    /// digital unit would be charged twice.
    pub fn resolve(&self, name: &str) -> Result<Target<'_>, Error> {
        let digital = match (self.memory(name), self.compute(name)) {
            (Some(_), Some(_)) => {
                log::error!("{} is both a memory and a compute unit", name);
                return Err(Error::DuplicateName(name.to_string()));
            }
            (Some(memory), None) => Some(Target::Memory(memory)),
            (None, Some(compute)) => Some(Target::Compute(compute)),
            (None, None) => None,
        };
        match (digital, self.analog.array(name)) {
            (Some(_), Some(_)) => {
                log::error!("{} names both analog and digital hardware", name);
                Err(Error::DoubleCounting(format!(
                    "{} is both an analog array and a digital unit",
                    name
                )))
            }
            (Some(target), None) => Ok(target),
            (None, Some(array)) => Ok(Target::Analog(array)),
            (None, None) => {
                log::error!("no hardware named {}", name);
                Err(Error::InvalidInput(format!("no hardware named {}", name)))
            }
        }
    }

    /// Unique names, analog domains, and buffers that exist.
    pub fn check(&self) -> Result<(), Error> {
        let mut names = HashSet::new();
        for name in self.memory.iter().map(|m| m.name.as_str()).chain(
            self.compute.iter().map(|c| c.name.as_str()),
        ) {
            if name.is_empty() {
                return Err(Error::IncompleteDescription(
                    "hardware unit with an empty name".to_string(),
                ));
            }
            if !names.insert(name) {
                log::error!("hardware name {} used twice", name);
                return Err(Error::DuplicateName(name.to_string()));
            }
        }
        for array in self.analog.arrays() {
            if names.contains(array.name()) {
                return Err(Error::DoubleCounting(format!(
                    "{} is both an analog array and a digital unit",
                    array.name()
                )));
            }
        }
        for unit in &self.compute {
            for buffer in unit
                .input_buffers
                .iter()
                .chain(std::iter::once(&unit.output_buffer))
                .filter(|b| !b.is_empty())
            {
                if self.memory(buffer).is_none() {
                    log::error!("unit {} uses unknown memory {}", unit.name, buffer);
                    return Err(Error::InvalidInput(format!(
                        "unit {} uses unknown memory {}",
                        unit.name, buffer
                    )));
                }
            }
        }
        self.analog.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::{AnalogOp, GeneralCircuit, SignalDomain};

    fn array(name: &str) -> AnalogNode {
        let mut unit = AnalogNode::unit("u");
        unit.add(AnalogNode::component(
            "c",
            AnalogOp::GeneralCircuit(GeneralCircuit {
                energy: 1e-12,
                input_domains: vec![SignalDomain::Optical],
                output_domain: SignalDomain::Digital,
            }),
        ))
        .unwrap();
        let mut array = AnalogNode::array(name);
        array.add(unit).unwrap();
        array
    }

    #[test]
    fn resolve_targets() {
        let mut analog = AnalogSystem::new();
        analog.add_array(array("sensor")).unwrap();
        let hw = HardwareDescription::new()
            .with_memory(MemoryUnit::fifo("fifo"))
            .with_compute(
                ComputeUnit::new("alu", &[&[1, 1, 1]], &[1, 1, 1], 1e-12)
                    .unwrap()
                    .reads(&["fifo"])
                    .writes("fifo"),
            )
            .with_analog(analog);
        assert!(hw.check().is_ok());
        assert!(matches!(hw.resolve("fifo"), Ok(Target::Memory(_))));
        assert!(matches!(hw.resolve("alu"), Ok(Target::Compute(_))));
        assert!(hw.resolve("sensor").unwrap().is_analog());
        assert!(matches!(hw.resolve("nothing"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn shared_names_are_double_counted() {
        let mut analog = AnalogSystem::new();
        analog.add_array(array("alu")).unwrap();
        let hw = HardwareDescription::new()
            .with_compute(ComputeUnit::new("alu", &[&[1, 1, 1]], &[1, 1, 1], 1e-12).unwrap())
            .with_analog(analog);
        assert!(matches!(hw.resolve("alu"), Err(Error::DoubleCounting(_))));
        assert!(matches!(hw.check(), Err(Error::DoubleCounting(_))));
    }

    #[test]
    fn unknown_buffers() {
        let hw = HardwareDescription::new().with_compute(
            ComputeUnit::new("alu", &[&[1, 1, 1]], &[1, 1, 1], 1e-12)
                .unwrap()
                .reads(&["missing"]),
        );
        assert!(matches!(hw.check(), Err(Error::InvalidInput(_))));
    }
}
