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

use serde::{Deserialize, Serialize};

use crate::analog::{check_boundary, SignalDomain};
use crate::hw::{HardwareDescription, Target};
use crate::specs::SoftwareGraph;
use crate::Error;

/// Binds every software stage to exactly one hardware unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mapping {
    bindings: BTreeMap<String, String>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, stage: &str, hardware: &str) -> Self {
        self.insert(stage, hardware);
        self
    }

    /// Rebinding a stage replaces the previous binding.
    pub fn insert(&mut self, stage: &str, hardware: &str) {
        self.bindings
            .insert(stage.to_string(), hardware.to_string());
    }

    pub fn get(&self, stage: &str) -> Option<&str> {
        self.bindings.get(stage).map(|hw| hw.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings
            .iter()
            .map(|(stage, hw)| (stage.as_str(), hw.as_str()))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Number of stages bound to `hardware`.
    pub fn stages_on(&self, hardware: &str) -> usize {
        self.bindings.values().filter(|hw| *hw == hardware).count()
    }

    /// The hardware bound to `stage`.
    pub fn target<'a>(
        &self,
        hw: &'a HardwareDescription,
        stage: &str,
    ) -> Result<Target<'a>, Error> {
        let name = self.get(stage).ok_or_else(|| {
            log::error!("Stage {} is not mapped to any hardware", stage);
            Error::MissingMapping(stage.to_string())
        })?;
        hw.resolve(name)
    }

    /// Every stage is bound, every binding names a stage, memories only
    /// hold input stages, and analog outputs are readable downstream.
    pub fn check(&self, graph: &SoftwareGraph, hw: &HardwareDescription) -> Result<(), Error> {
        for stage in self.bindings.keys() {
            if graph.index_of(stage).is_none() {
                log::error!("Mapping names unknown stage {}", stage);
                return Err(Error::UnknownStage(stage.clone()));
            }
        }
        for stage_id in graph.iter_stages() {
            let stage = graph.stage(stage_id);
            let target = self.target(hw, stage.name())?;
            if let Target::Memory(memory) = target {
                if !stage.kind().is_input() {
                    log::error!(
                        "Stage {} is mapped to memory {} but is not an input",
                        stage.name(),
                        memory.name
                    );
                    return Err(Error::UnsupportedOption(format!(
                        "stage {} on memory {}",
                        stage.name(),
                        memory.name
                    )));
                }
            }
        }
        for consumer_id in graph.iter_stages() {
            let consumer = graph.stage(consumer_id);
            let consumer_target = self.target(hw, consumer.name())?;
            for producer_id in graph.inputs_of(consumer_id) {
                let producer = graph.stage(producer_id);
                let array = match self.target(hw, producer.name())? {
                    Target::Analog(array) => array,
                    _ => continue,
                };
                match consumer_target {
                    Target::Analog(next) if next.name() == array.name() => {}
                    Target::Analog(next) => check_boundary(array, next)?,
                    _ => {
                        if array.output_domain() != Some(SignalDomain::Digital) {
                            log::error!(
                                "Stage {} reads {} from analog array {} without conversion",
                                consumer.name(),
                                producer.name(),
                                array.name()
                            );
                            return Err(Error::DomainMismatch {
                                producer: array.name().to_string(),
                                consumer: consumer.name().to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl<S: ToString, H: ToString> FromIterator<(S, H)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (S, H)>>(iter: I) -> Self {
        Self {
            bindings: iter
                .into_iter()
                .map(|(stage, hw)| (stage.to_string(), hw.to_string()))
                .collect(),
        }
    }
}
