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

//! Declarative hardware descriptions, read from YAML.

use serde::{Deserialize, Serialize};

use crate::analog::{AnalogNode, AnalogOp, AnalogSystem, SignalDomain};
use crate::hw::{ComputeUnit, HardwareDescription, MemoryUnit};
use crate::Error;

/// Compute unit; throughputs are (height, width, channels).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ComputeConfiguration {
    pub name: String,
    pub input_per_cycle: Vec<Vec<usize>>,
    pub output_per_cycle: Vec<usize>,
    pub energy_per_cycle: f64,
    pub input_buffers: Vec<String>,
    pub output_buffer: String,
}

impl ComputeConfiguration {
    fn build(&self) -> Result<ComputeUnit, Error> {
        let inputs = self
            .input_per_cycle
            .iter()
            .map(|hwc| hwc.as_slice())
            .collect::<Vec<_>>();
        let buffers = self
            .input_buffers
            .iter()
            .map(|b| b.as_str())
            .collect::<Vec<_>>();
        Ok(ComputeUnit::new(
            &self.name,
            &inputs,
            &self.output_per_cycle,
            self.energy_per_cycle,
        )?
        .reads(&buffers)
        .writes(&self.output_buffer))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfiguration {
    pub name: String,
    /// [rows, columns]
    pub count: Option<[usize; 2]>,
    pub op: AnalogOp,
    pub input_domains: Option<Vec<SignalDomain>>,
    pub output_domain: Option<SignalDomain>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UnitConfiguration {
    pub name: String,
    pub count: Option<[usize; 2]>,
    /// replaces the summed energy of the components
    pub energy: Option<f64>,
    pub components: Vec<ComponentConfiguration>,
    #[serde(default)]
    pub connections: Vec<(String, String)>,
    pub sources: Option<Vec<String>>,
    pub sinks: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ArrayConfiguration {
    pub name: String,
    pub count: Option<[usize; 2]>,
    pub units: Vec<UnitConfiguration>,
    #[serde(default)]
    pub connections: Vec<(String, String)>,
    pub sources: Option<Vec<String>>,
    pub sinks: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AnalogConfiguration {
    pub arrays: Vec<ArrayConfiguration>,
    #[serde(default)]
    pub connections: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareConfiguration {
    #[serde(default)]
    pub memory: Vec<MemoryUnit>,
    #[serde(default)]
    pub compute: Vec<ComputeConfiguration>,
    #[serde(default)]
    pub analog: AnalogConfiguration,
}

fn counted(node: AnalogNode, count: Option<[usize; 2]>) -> AnalogNode {
    match count {
        Some([rows, cols]) => node.with_count(rows, cols),
        None => node,
    }
}

fn wire(
    node: &mut AnalogNode,
    connections: &[(String, String)],
    sources: &Option<Vec<String>>,
    sinks: &Option<Vec<String>>,
) -> Result<(), Error> {
    for (from, to) in connections {
        node.connect(from, to)?;
    }
    match (sources, sinks) {
        (Some(sources), Some(sinks)) => {
            let sources = sources.iter().map(|s| s.as_str()).collect::<Vec<_>>();
            let sinks = sinks.iter().map(|s| s.as_str()).collect::<Vec<_>>();
            node.ports(&sources, &sinks)?;
        }
        (None, None) => {}
        _ => {
            log::error!("{} declares only one of sources and sinks", node.name());
            return Err(Error::IncompleteDescription(format!(
                "{}: sources and sinks are declared together",
                node.name()
            )));
        }
    }
    Ok(())
}

impl ComponentConfiguration {
    fn build(&self) -> Result<AnalogNode, Error> {
        let component = counted(AnalogNode::component(&self.name, self.op.clone()), self.count);
        match (&self.input_domains, self.output_domain) {
            (Some(inputs), Some(output)) => component.with_domains(inputs, output),
            (None, None) => Ok(component),
            _ => Err(Error::IncompleteDescription(format!(
                "component {}: input_domains and output_domain are declared together",
                self.name
            ))),
        }
    }
}

impl UnitConfiguration {
    fn build(&self) -> Result<AnalogNode, Error> {
        let mut unit = counted(AnalogNode::unit(&self.name), self.count);
        if let Some(energy) = self.energy {
            unit = unit.with_energy(energy)?;
        }
        for component in &self.components {
            unit.add(component.build()?)?;
        }
        wire(&mut unit, &self.connections, &self.sources, &self.sinks)?;
        Ok(unit)
    }
}

impl ArrayConfiguration {
    fn build(&self) -> Result<AnalogNode, Error> {
        let mut array = counted(AnalogNode::array(&self.name), self.count);
        for unit in &self.units {
            array.add(unit.build()?)?;
        }
        wire(&mut array, &self.connections, &self.sources, &self.sinks)?;
        Ok(array)
    }
}

impl HardwareConfiguration {
    /// Builds and checks the hardware description.
    pub fn build(&self) -> Result<HardwareDescription, Error> {
        let mut analog = AnalogSystem::new();
        for array in &self.analog.arrays {
            analog.add_array(array.build()?)?;
        }
        for (from, to) in &self.analog.connections {
            analog.connect(from, to)?;
        }
        let hw = HardwareDescription {
            memory: self.memory.clone(),
            compute: self
                .compute
                .iter()
                .map(|c| c.build())
                .collect::<Result<_, _>>()?,
            analog,
        };
        hw.check()?;
        Ok(hw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferKind;
    use float_cmp::approx_eq;

    #[test]
    fn read_yaml_hardware() {
        let conf_str = "---
memory:
  - name: line
    kind: LineBuffer
    read_energy: 1.0e-13
    write_energy: 2.0e-13
compute:
  - name: pe
    input_per_cycle: [[3, 3, 1]]
    output_per_cycle: [1, 1, 1]
    energy_per_cycle: 1.0e-12
    input_buffers: [line]
    output_buffer: line
analog:
  arrays:
    - name: sensor
      units:
        - name: pixel
          count: [32, 32]
          components:
            - name: pd
              op:
                type: Photodiode
                capacitance: 1.0e-13
                voltage: 3.3
                max_input: 1000.0
            - name: adc
              op:
                type: Adc
                fom: 1.0e-13
                resolution: 8
          connections:
            - [pd, adc]
";
        let config: HardwareConfiguration = serde_yaml::from_str(conf_str).unwrap();
        assert_eq!(config.memory[0].kind, BufferKind::LineBuffer);
        let hw = config.build().unwrap();
        assert_eq!(hw.compute("pe").unwrap().output_buffer(), Ok("line"));
        let sensor = hw.analog.array("sensor").unwrap();
        assert_eq!(sensor.output_domain(), Some(SignalDomain::Digital));
        // (1.089 pJ + 25.6 pJ) per pixel
        assert!(approx_eq!(
            f64,
            sensor.energy().unwrap(),
            1024.0 * 26.689e-12,
            epsilon = 1e-18
        ));
    }

    #[test]
    fn half_declared_ports() {
        let conf_str = "---
arrays:
  - name: sensor
    units:
      - name: pixel
        components:
          - name: pd
            op:
              type: Photodiode
              capacitance: 1.0e-13
              voltage: 3.3
              max_input: 1000.0
        sources: [pd]
";
        let analog: AnalogConfiguration = serde_yaml::from_str(conf_str).unwrap();
        let config = HardwareConfiguration {
            analog,
            ..Default::default()
        };
        assert!(matches!(
            config.build(),
            Err(Error::IncompleteDescription(_))
        ));
    }
}
