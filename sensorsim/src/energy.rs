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

use crate::hw::HardwareDescription;
use crate::mapping::Mapping;
use crate::scheduler::{schedule, ScheduleReport};
use crate::specs::SoftwareGraph;
use crate::{Cycle, Error};

/// Energy per hardware unit, in joules.
pub type EnergyBreakdown = BTreeMap<String, f64>;

#[derive(Clone, Debug, PartialEq)]
pub struct EnergyReport {
    pub total: f64,
    pub breakdown: EnergyBreakdown,
    pub schedule: ScheduleReport,
}

fn joules(unit: &str, energy: f64) -> Result<f64, Error> {
    if !energy.is_finite() || energy < 0.0 {
        log::error!("{} reports {} J", unit, energy);
        return Err(Error::InvalidInput(format!(
            "{}: energy {} is not a non-negative number of joules",
            unit, energy
        )));
    }
    Ok(energy)
}

/// Total energy and per-unit breakdown of one pass of the pipeline.
pub fn simulate(
    graph: &SoftwareGraph,
    hw: &HardwareDescription,
    mapping: &Mapping,
    max_cycles: Cycle,
) -> Result<(f64, EnergyBreakdown), Error> {
    let report = simulate_with_report(graph, hw, mapping, max_cycles)?;
    Ok((report.total, report.breakdown))
}

/// Schedules the digital part, then charges every unit once:
///  - an analog array its array energy per stage bound to it,
///  - a compute unit its per-cycle energy per active cycle,
///  - a memory its per-element read and write energy.
pub fn simulate_with_report(
    graph: &SoftwareGraph,
    hw: &HardwareDescription,
    mapping: &Mapping,
    max_cycles: Cycle,
) -> Result<EnergyReport, Error> {
    hw.check()?;
    let schedule = schedule(graph, hw, mapping, max_cycles)?;

    let mut breakdown = EnergyBreakdown::new();
    for array in hw.analog.arrays() {
        let stages = mapping.stages_on(array.name());
        if stages > 0 {
            let energy = joules(array.name(), array.energy()?)?;
            breakdown.insert(array.name().to_string(), energy * stages as f64);
        }
    }
    for (unit, active) in &schedule.unit_active_cycles {
        if let Some(compute) = hw.compute(unit) {
            breakdown.insert(unit.clone(), joules(unit, compute.energy(*active))?);
        }
    }
    for memory in &hw.memory {
        let reads = schedule.memory_reads.get(&memory.name).copied().unwrap_or(0);
        let writes = schedule.memory_writes.get(&memory.name).copied().unwrap_or(0);
        breakdown.insert(
            memory.name.clone(),
            joules(&memory.name, memory.access_energy(reads, writes))?,
        );
    }

    let total = breakdown.values().sum();
    log::info!("total energy {:e} J over {} units", total, breakdown.len());
    for (unit, energy) in &breakdown {
        log::debug!("  {}: {:e} J", unit, energy);
    }
    Ok(EnergyReport {
        total,
        breakdown,
        schedule,
    })
}
