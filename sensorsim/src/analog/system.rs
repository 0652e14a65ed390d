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

use petgraph::prelude::*;

use super::domain::accepts;
use super::node::{AnalogNode, Level};
use crate::Error;

/// The analog arrays of a sensor and the wiring between them.
#[derive(Clone, Debug, Default)]
pub struct AnalogSystem {
    arrays: Graph<AnalogNode, ()>,
}

impl AnalogSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_array(&mut self, array: AnalogNode) -> Result<NodeIndex, Error> {
        if array.level() != Level::Array {
            log::error!("{} is a {:?}, not an array", array.name(), array.level());
            return Err(Error::InvalidHierarchy(format!(
                "{} is not an array",
                array.name()
            )));
        }
        if self.index_of(array.name()).is_some() {
            return Err(Error::DuplicateName(array.name().to_string()));
        }
        Ok(self.arrays.add_node(array))
    }

    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), Error> {
        let producer = self.lookup(from)?;
        let consumer = self.lookup(to)?;
        self.arrays.add_edge(producer, consumer, ());
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<NodeIndex, Error> {
        self.index_of(name).ok_or_else(|| {
            log::error!("no analog array named {}", name);
            Error::UnknownStage(name.to_string())
        })
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.arrays
            .node_indices()
            .find(|n| self.arrays[*n].name() == name)
    }

    pub fn array(&self, name: &str) -> Option<&AnalogNode> {
        self.index_of(name).map(|n| &self.arrays[n])
    }

    pub fn array_mut(&mut self, name: &str) -> Option<&mut AnalogNode> {
        self.index_of(name).map(move |n| &mut self.arrays[n])
    }

    pub fn arrays(&self) -> impl Iterator<Item = &AnalogNode> {
        self.arrays.node_weights()
    }

    pub fn len(&self) -> usize {
        self.arrays.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.node_count() == 0
    }

    /// Checks every array internally, then every array-to-array edge.
    pub fn check(&self) -> Result<(), Error> {
        for array in self.arrays.node_weights() {
            array.check_domains()?;
            array.energy()?;
        }
        for edge in self.arrays.edge_references() {
            check_boundary(&self.arrays[edge.source()], &self.arrays[edge.target()])?;
        }
        Ok(())
    }

    /// Energy of one invocation of each array.
    pub fn energy_per_array(&self) -> Result<BTreeMap<String, f64>, Error> {
        self.arrays
            .node_weights()
            .map(|array| Ok((array.name().to_string(), array.energy()?)))
            .collect()
    }

    pub fn reset_fixed_pattern(&mut self) {
        for array in self.arrays.node_weights_mut() {
            array.reset_fixed_pattern();
        }
    }
}

/// The upstream array's output domain must be accepted by the downstream
/// one.
pub fn check_boundary(producer: &AnalogNode, consumer: &AnalogNode) -> Result<(), Error> {
    let accepted = producer
        .output_domain()
        .map(|domain| accepts(&consumer.input_domains(), domain))
        .unwrap_or(false);
    if !accepted {
        log::error!(
            "array {} ({:?}) can not drive array {} ({:?})",
            producer.name(),
            producer.output_domain(),
            consumer.name(),
            consumer.input_domains()
        );
        return Err(Error::DomainMismatch {
            producer: producer.name().to_string(),
            consumer: consumer.name().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::circuits::MaxVoltage;
    use crate::analog::pixel::{ActivePixelSensor, FloatingDiffusion, Photodiode};
    use crate::analog::readout::{Adc, SourceFollower};
    use crate::analog::AnalogOp;

    fn single(array: &str, unit: &str, component: &str, op: AnalogOp) -> AnalogNode {
        let mut u = AnalogNode::unit(unit);
        u.add(AnalogNode::component(component, op)).unwrap();
        let mut a = AnalogNode::array(array);
        a.add(u).unwrap();
        a
    }

    fn aps() -> AnalogOp {
        AnalogOp::ActivePixelSensor(ActivePixelSensor {
            num_transistor: 4,
            photodiode: Photodiode::new(1e-15, 1.0, 100.0),
            floating_diffusion: FloatingDiffusion::new(1e-15, 1.0, 1e-3),
            source_follower: SourceFollower::new(1.0).load(1e-15, 1.0, 1.0),
        })
    }

    #[test]
    fn array_boundaries() {
        let mut system = AnalogSystem::new();
        system.add_array(single("pixels", "aps", "aps", aps())).unwrap();
        system
            .add_array(single("adc", "col", "adc", AnalogOp::Adc(Adc::new(1e-15, 10))))
            .unwrap();
        system.connect("pixels", "adc").unwrap();
        assert!(system.check().is_ok());

        system
            .add_array(single(
                "wta",
                "wta",
                "max",
                AnalogOp::MaxVoltage(MaxVoltage {
                    supply: 1.0,
                    load_capacitance: 1e-15,
                    gain: 1.0,
                    gm_id: 10.0,
                    t_frame: 1e-3,
                    num_inputs: 2,
                }),
            ))
            .unwrap();
        system.connect("adc", "wta").unwrap();
        assert_eq!(
            system.check(),
            Err(Error::DomainMismatch {
                producer: "adc".to_string(),
                consumer: "wta".to_string()
            })
        );
    }

    #[test]
    fn only_arrays_and_unique_names() {
        let mut system = AnalogSystem::new();
        assert!(matches!(
            system.add_array(AnalogNode::unit("u")),
            Err(Error::InvalidHierarchy(_))
        ));
        system.add_array(single("a", "u", "c", aps())).unwrap();
        assert!(matches!(
            system.add_array(single("a", "u", "c", aps())),
            Err(Error::DuplicateName(_))
        ));
        assert!(matches!(
            system.connect("a", "missing"),
            Err(Error::UnknownStage(_))
        ));
    }
}
