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

use std::collections::{BTreeMap, HashMap};

use petgraph::prelude::*;

use super::binding::{bind, Bindings, Placement};
use crate::buffer::Buffer;
use crate::hw::HardwareDescription;
use crate::mapping::Mapping;
use crate::specs::{ReadyBoard, SoftwareGraph};
use crate::{Cycle, Error, Shape};

/// Outcome of a scheduling run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub total_cycles: Cycle,
    /// cycles in which the unit serviced a stage
    pub unit_active_cycles: BTreeMap<String, usize>,
    /// cycle at which the last output element of the stage was committed;
    /// prefilled stages finish at cycle 0 unless they wait on upstream work
    pub stage_finish_cycle: BTreeMap<String, Cycle>,
    /// elements read from each memory
    pub memory_reads: BTreeMap<String, usize>,
    /// elements written to each memory
    pub memory_writes: BTreeMap<String, usize>,
    /// marker sum of each finished stage's output reservation
    pub output_markers: BTreeMap<String, usize>,
}

/// A compute unit and the stages bound to it, in topological order.
#[derive(Debug)]
struct UnitQueue {
    name: String,
    stages: Vec<NodeIndex>,
}

/// Cycle-level simulation of the digital part of a mapped pipeline.
#[derive(Debug)]
pub struct Scheduler<'a> {
    graph: &'a SoftwareGraph,
    bindings: Bindings<'a>,
    order: Vec<NodeIndex>,
    units: Vec<UnitQueue>,
    boards: HashMap<NodeIndex, ReadyBoard>,
    finished: HashMap<NodeIndex, Cycle>,
    cycle: Cycle,
    max_cycles: Cycle,
    report: ScheduleReport,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: &'a SoftwareGraph,
        hw: &'a HardwareDescription,
        mapping: &Mapping,
        max_cycles: Cycle,
    ) -> Result<Self, Error> {
        let order = graph.topological_order()?;
        let bindings = bind(graph, hw, mapping)?;

        // units are visited producers first: by the earliest topological
        // position of a bound stage, then in construction order
        let mut units = hw
            .compute
            .iter()
            .enumerate()
            .filter_map(|(construction, unit)| {
                let stages = order
                    .iter()
                    .copied()
                    .filter(|stage_id| match bindings.stage(*stage_id).placement {
                        Placement::Compute(bound) => bound.name == unit.name,
                        Placement::Prefilled => false,
                    })
                    .collect::<Vec<_>>();
                let first = order.iter().position(|n| Some(n) == stages.first())?;
                Some(((first, construction), UnitQueue {
                    name: unit.name.clone(),
                    stages,
                }))
            })
            .collect::<Vec<_>>();
        units.sort_by_key(|(rank, _)| *rank);
        let units = units.into_iter().map(|(_, unit)| unit).collect::<Vec<_>>();

        let mut report = ScheduleReport::default();
        for unit in &units {
            report.unit_active_cycles.insert(unit.name.clone(), 0);
        }
        for memory in bindings.buffers.keys() {
            report.memory_reads.insert(memory.clone(), 0);
            report.memory_writes.insert(memory.clone(), 0);
        }
        log::debug!(
            "scheduling {} stages on {} compute units",
            order.len(),
            units.len()
        );

        Ok(Self {
            graph,
            bindings,
            order,
            units,
            boards: graph.ready_boards(),
            finished: HashMap::new(),
            cycle: 0,
            max_cycles,
            report,
        })
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn is_finished(&self, stage_id: NodeIndex) -> bool {
        self.finished.contains_key(&stage_id)
    }

    fn sinks_finished(&self) -> bool {
        self.graph.sinks().iter().all(|s| self.is_finished(*s))
    }

    fn unfinished(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|s| !self.is_finished(**s))
            .map(|s| self.graph.stage(*s).name().to_string())
            .collect()
    }

    fn deadlock(&self) -> Error {
        let stuck = self.unfinished();
        log::error!(
            "No progress at cycle {}, unfinished stages {:?}",
            self.cycle,
            stuck
        );
        Error::ProgressDeadlock(stuck)
    }

    /// Runs until every sink has emitted its output volume.
    pub fn run(mut self) -> Result<ScheduleReport, Error> {
        self.settle_prefilled()?;
        while !self.sinks_finished() {
            if self.cycle >= self.max_cycles {
                log::error!("Cycle budget of {} exhausted", self.max_cycles);
                return Err(self.deadlock());
            }
            self.cycle += 1;
            if !self.step()? {
                return Err(self.deadlock());
            }
        }
        self.report.total_cycles = self.cycle;
        log::info!(
            "schedule finished after {} cycles, active cycles {:?}",
            self.cycle,
            self.report.unit_active_cycles
        );
        Ok(self.report)
    }

    fn finish(&mut self, stage_id: NodeIndex) {
        let name = self.graph.stage(stage_id).name().to_string();
        log::debug!("stage {} finished at cycle {}", name, self.cycle);
        self.finished.insert(stage_id, self.cycle);
        self.report.stage_finish_cycle.insert(name.clone(), self.cycle);
        let binding = self.bindings.stage(stage_id);
        if let Some(markers) = binding
            .outputs
            .iter()
            .filter_map(|buffer| buffer.borrow().marker_sum(&binding.hardware, &binding.name))
            .max()
        {
            self.report.output_markers.insert(name.clone(), markers);
        }
        for consumer in self.graph.outputs_of(stage_id) {
            if let Some(board) = self.boards.get_mut(&consumer) {
                board.mark(&name);
            }
        }
    }

    /// Completes every prefilled stage whose upstream stages have finished.
    /// Returns whether any stage completed.
    fn settle_prefilled(&mut self) -> Result<bool, Error> {
        let mut settled = false;
        for stage_id in self.order.clone() {
            let binding = self.bindings.stage(stage_id);
            if self.is_finished(stage_id)
                || !matches!(binding.placement, Placement::Prefilled)
                || !self.boards[&stage_id].is_ready()
            {
                continue;
            }
            for buffer in &binding.outputs {
                let mut buffer = buffer.borrow_mut();
                let written = buffer.fill(&binding.hardware, &binding.name);
                if let Some(writes) = self.report.memory_writes.get_mut(buffer.name()) {
                    *writes += written;
                }
            }
            self.finish(stage_id);
            settled = true;
        }
        Ok(settled)
    }

    fn is_ready(&self, stage_id: NodeIndex) -> Result<bool, Error> {
        let binding = self.bindings.stage(stage_id);
        let board = &self.boards[&stage_id];
        if binding
            .operands
            .iter()
            .any(|operand| board.get(operand) != Some(true))
        {
            return Ok(false);
        }
        for port in &binding.inputs {
            if !port.buffer.borrow().read_ready(&port.key)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// One cycle: every unit services the first unfinished stage that can
    /// read its inputs; writes are committed after all units moved, so a
    /// consumer never sees data written in the same cycle.
    ///
    /// Units are visited by the topological position of their earliest
    /// bound stage; construction order only breaks ties. A unit declared
    /// before its producer is therefore still serviced after it.
    fn step(&mut self) -> Result<bool, Error> {
        let mut writes: Vec<(NodeIndex, Shape)> = vec![];
        for unit in &self.units {
            let mut serviced = None;
            for stage_id in &unit.stages {
                if self.is_finished(*stage_id) || !self.is_ready(*stage_id)? {
                    continue;
                }
                serviced = Some(*stage_id);
                break;
            }
            let stage_id = match serviced {
                Some(stage_id) => stage_id,
                None => {
                    log::trace!("cycle {}: {} stalls", self.cycle, unit.name);
                    continue;
                }
            };
            let binding = self.bindings.stage(stage_id);
            for port in &binding.inputs {
                let mut buffer = port.buffer.borrow_mut();
                let fetched = buffer.advance_read(&port.key)?;
                if let Some(reads) = self.report.memory_reads.get_mut(buffer.name()) {
                    *reads += fetched;
                }
                log::trace!(
                    "cycle {}: {} reads {} elements of {} for {}",
                    self.cycle,
                    unit.name,
                    fetched,
                    self.graph.stage(port.producer).name(),
                    binding.name
                );
            }
            if let Placement::Compute(compute) = binding.placement {
                writes.push((stage_id, compute.output_per_cycle));
            }
            if let Some(active) = self.report.unit_active_cycles.get_mut(&unit.name) {
                *active += 1;
            }
        }

        let progress = !writes.is_empty();
        for (stage_id, tile) in writes {
            self.commit(stage_id, tile)?;
        }
        Ok(self.settle_prefilled()? || progress)
    }

    fn commit(&mut self, stage_id: NodeIndex, tile: Shape) -> Result<(), Error> {
        let binding = self.bindings.stage(stage_id);
        let mut complete = false;
        for buffer in &binding.outputs {
            let mut buffer = buffer.borrow_mut();
            let written = buffer.write(&binding.hardware, &binding.name, tile)?;
            if let Some(writes) = self.report.memory_writes.get_mut(buffer.name()) {
                *writes += written;
            }
            complete |=
                output_complete(&buffer, &binding.hardware, &binding.name, binding.volume)?;
        }
        if complete {
            self.finish(stage_id);
        }
        Ok(())
    }
}

/// Whether the output of `stage` in `buffer` holds all `volume` elements.
///
/// A saturated output whose marker sum falls short is a consistency error.
/// The write walk covers the whole reservation, so this only trips when a
/// reservation disagrees with the volume of the stage it holds.
fn output_complete(
    buffer: &Buffer,
    producer: &str,
    stage: &str,
    volume: usize,
) -> Result<bool, Error> {
    let sum = buffer.marker_sum(producer, stage).unwrap_or(0);
    if sum == volume {
        return Ok(true);
    }
    if buffer.is_saturated(producer, stage) {
        log::error!(
            "{}: output of {} saturated with {} of {} elements written",
            buffer.name(),
            stage,
            sum,
            volume
        );
        return Err(Error::BufferInconsistency(format!(
            "{} saturated {} with {} of {} elements",
            stage,
            buffer.name(),
            sum,
            volume
        )));
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferKind, ReservationKey};
    use crate::hw::{ComputeUnit, MemoryUnit};
    use crate::specs::{SoftwareGraphBuilder, Stage, StencilOp};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn streaming_chain() {
        init();
        let graph = SoftwareGraphBuilder::new()
            .add_stages(vec![
                Stage::pixel_input("in", &[4, 8, 1]).unwrap(),
                Stage::stencil("abs", StencilOp::Abs)
                    .input("in", &[4, 8, 1], &[1, 1, 1], &[1, 1, 1], false)
                    .unwrap(),
                Stage::stencil("copy", StencilOp::Identity)
                    .input("abs", &[4, 8, 1], &[1, 1, 1], &[1, 1, 1], false)
                    .unwrap(),
            ])
            .unwrap()
            .build()
            .unwrap();
        let hw = HardwareDescription::new()
            .with_memory(MemoryUnit::fifo("in").with_access_energy(1.0, 1.0))
            .with_memory(MemoryUnit::fifo("mid"))
            .with_memory(MemoryUnit::fifo("out"))
            // constructed consumer first, visited producer first
            .with_compute(
                ComputeUnit::new("second", &[&[1, 4, 1]], &[1, 4, 1], 0.0)
                    .unwrap()
                    .reads(&["mid"])
                    .writes("out"),
            )
            .with_compute(
                ComputeUnit::new("first", &[&[1, 4, 1]], &[1, 4, 1], 0.0)
                    .unwrap()
                    .reads(&["in"])
                    .writes("mid"),
            );
        let mapping = Mapping::new()
            .bind("in", "in")
            .bind("abs", "first")
            .bind("copy", "second");
        let report = Scheduler::new(&graph, &hw, &mapping, 1000)
            .unwrap()
            .run()
            .unwrap();
        // 8 tiles each, the consumer trails by one cycle
        assert_eq!(report.total_cycles, 9);
        assert_eq!(report.unit_active_cycles["first"], 8);
        assert_eq!(report.unit_active_cycles["second"], 8);
        assert_eq!(report.stage_finish_cycle["in"], 0);
        assert_eq!(report.stage_finish_cycle["abs"], 8);
        assert_eq!(report.memory_reads["in"], 32);
        assert_eq!(report.memory_writes["in"], 32);
        assert_eq!(report.memory_writes["out"], 32);
    }

    #[test]
    fn cycle_budget() {
        init();
        let graph = SoftwareGraphBuilder::new()
            .add_stages(vec![
                Stage::pixel_input("in", &[8, 8, 1]).unwrap(),
                Stage::stencil("abs", StencilOp::Abs)
                    .input("in", &[8, 8, 1], &[1, 1, 1], &[1, 1, 1], false)
                    .unwrap(),
            ])
            .unwrap()
            .build()
            .unwrap();
        let hw = HardwareDescription::new()
            .with_memory(MemoryUnit::fifo("in"))
            .with_compute(
                ComputeUnit::new("alu", &[&[1, 1, 1]], &[1, 1, 1], 0.0)
                    .unwrap()
                    .reads(&["in"])
                    .writes("in"),
            );
        let mapping = Mapping::new().bind("in", "in").bind("abs", "alu");
        assert_eq!(
            Scheduler::new(&graph, &hw, &mapping, 10).unwrap().run(),
            Err(Error::ProgressDeadlock(vec!["abs".to_string()]))
        );
    }

    #[test]
    fn saturated_output_must_hold_the_volume() {
        init();
        let mut buffer = Buffer::new("out", BufferKind::Fifo);
        buffer
            .reserve(ReservationKey::new("alu", None, "abs"), Shape::new(2, 2, 1), None, None)
            .unwrap();
        assert_eq!(output_complete(&buffer, "alu", "abs", 4), Ok(false));
        buffer.write("alu", "abs", Shape::new(2, 1, 1)).unwrap();
        assert_eq!(output_complete(&buffer, "alu", "abs", 4), Ok(false));
        buffer.write("alu", "abs", Shape::new(2, 1, 1)).unwrap();
        assert!(buffer.is_saturated("alu", "abs"));
        assert_eq!(output_complete(&buffer, "alu", "abs", 4), Ok(true));

        // the stage claims more elements than its reservation can hold
        assert!(matches!(
            output_complete(&buffer, "alu", "abs", 8),
            Err(Error::BufferInconsistency(_))
        ));
    }
}
