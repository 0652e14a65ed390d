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

//! Binds stages to hardware and reserves the buffers between them.
//!
//! Every streamed edge is backed by at most one buffer: the producer's
//! output memory, which must be the very same object as the consumer's
//! input memory. Edges between two analog stages carry no buffer.

use std::collections::BTreeMap;
use std::rc::Rc;

use petgraph::prelude::*;

use crate::buffer::{BufferRef, ReadPattern, ReservationKey};
use crate::hw::{ComputeUnit, HardwareDescription, Target};
use crate::mapping::Mapping;
use crate::specs::{SoftwareGraph, Stage, StageKind};
use crate::{Error, Shape};

#[derive(Clone, Copy, Debug)]
pub(crate) enum Placement<'a> {
    /// input stages and analog stages: the whole output is available as
    /// soon as every upstream stage finished
    Prefilled,
    Compute(&'a ComputeUnit),
}

#[derive(Debug)]
pub(crate) struct InputPort {
    pub producer: NodeIndex,
    pub buffer: BufferRef,
    pub key: ReservationKey,
}

#[derive(Debug)]
pub(crate) struct StageBinding<'a> {
    pub name: String,
    pub hardware: String,
    pub placement: Placement<'a>,
    /// streamed inputs in declared order
    pub inputs: Vec<InputPort>,
    /// operand producers, gated by the ready-board only
    pub operands: Vec<String>,
    /// distinct buffers holding the output of the stage
    pub outputs: Vec<BufferRef>,
    pub volume: usize,
}

#[derive(Debug)]
pub(crate) struct Bindings<'a> {
    /// indexed by stage
    pub stages: Vec<StageBinding<'a>>,
    /// one buffer per memory
    pub buffers: BTreeMap<String, BufferRef>,
}

impl<'a> Bindings<'a> {
    pub fn stage(&self, stage_id: NodeIndex) -> &StageBinding<'a> {
        &self.stages[stage_id.index()]
    }
}

fn memory_buffer(buffers: &BTreeMap<String, BufferRef>, name: &str) -> Result<BufferRef, Error> {
    buffers.get(name).cloned().ok_or_else(|| {
        log::error!("no memory named {}", name);
        Error::InvalidInput(format!("no memory named {}", name))
    })
}

/// The buffer a producer writes for the consumer reading input `position`.
fn producer_side(
    buffers: &BTreeMap<String, BufferRef>,
    producer: Target,
    consumer: Target,
    position: usize,
) -> Result<Option<BufferRef>, Error> {
    match (producer, consumer) {
        (Target::Compute(unit), _) => memory_buffer(buffers, unit.output_buffer()?).map(Some),
        (Target::Memory(memory), _) => memory_buffer(buffers, &memory.name).map(Some),
        (Target::Analog(_), Target::Compute(unit)) => {
            memory_buffer(buffers, unit.input_buffer(position)?).map(Some)
        }
        (Target::Analog(_), _) => Ok(None),
    }
}

/// The buffer a consumer reads input `position` from.
fn consumer_side(
    buffers: &BTreeMap<String, BufferRef>,
    consumer: Target,
    position: usize,
) -> Result<Option<BufferRef>, Error> {
    match consumer {
        Target::Compute(unit) => memory_buffer(buffers, unit.input_buffer(position)?).map(Some),
        _ => Ok(None),
    }
}

/// The read walk of a consumer: its per-cycle tile over the padded input.
/// DNN layers pad spatially only; a flattening layer walks the producer's
/// output as a whole.
fn read_pattern(
    consumer: &Stage,
    unit: &ComputeUnit,
    position: usize,
    produced: Shape,
) -> Result<(Shape, ReadPattern), Error> {
    let edge = &consumer.edges()[position];
    let tile = unit.input_tile(position)?;
    let (virtual_shape, kernel, stride) = match consumer.kind() {
        StageKind::Dnn {
            needs_flatten: true,
            ..
        } => (produced, produced, produced),
        StageKind::Dnn { .. } => (
            Shape::extrapolate(
                produced,
                Shape::new(edge.kernel.x, edge.kernel.y, 1),
                edge.padding,
            ),
            edge.kernel,
            edge.stride,
        ),
        _ => (
            Shape::extrapolate(produced, edge.kernel, edge.padding),
            edge.kernel,
            edge.stride,
        ),
    };
    Ok((
        virtual_shape,
        ReadPattern {
            tile,
            kernel,
            stride,
        },
    ))
}

fn push_output(outputs: &mut Vec<BufferRef>, buffer: &BufferRef) {
    if !outputs.iter().any(|b| Rc::ptr_eq(b, buffer)) {
        outputs.push(buffer.clone());
    }
}

/// Resolves the mapping, checks buffer identity on every edge and reserves
/// one region per edge plus one per sink output.
pub(crate) fn bind<'a>(
    graph: &SoftwareGraph,
    hw: &'a HardwareDescription,
    mapping: &Mapping,
) -> Result<Bindings<'a>, Error> {
    mapping.check(graph, hw)?;

    let buffers = hw
        .memory
        .iter()
        .map(|memory| (memory.name.clone(), memory.instantiate().into_ref()))
        .collect::<BTreeMap<_, _>>();

    let mut targets = Vec::with_capacity(graph.len());
    let mut stages = Vec::with_capacity(graph.len());
    for stage_id in graph.iter_stages() {
        let stage = graph.stage(stage_id);
        let target = mapping.target(hw, stage.name())?;
        let placement = match target {
            Target::Compute(unit) if !stage.kind().is_input() => Placement::Compute(unit),
            _ => Placement::Prefilled,
        };
        targets.push(target);
        stages.push(StageBinding {
            name: stage.name().to_string(),
            hardware: target.name().to_string(),
            placement,
            inputs: vec![],
            operands: stage.operands().to_vec(),
            outputs: vec![],
            volume: stage.output_shape().volume(),
        });
    }

    for consumer_id in graph.iter_stages() {
        let consumer = graph.stage(consumer_id);
        let consumer_target = targets[consumer_id.index()];
        let streamed = graph
            .inputs_of(consumer_id)
            .into_iter()
            .take(consumer.edges().len())
            .enumerate();
        for (position, producer_id) in streamed {
            let producer_target = targets[producer_id.index()];
            let written = producer_side(&buffers, producer_target, consumer_target, position)?;
            let read = consumer_side(&buffers, consumer_target, position)?;
            let buffer = match (written, read) {
                (Some(written), Some(read)) if !Rc::ptr_eq(&written, &read) => {
                    let (written, read) = (written.borrow(), read.borrow());
                    log::error!(
                        "{} writes {} but {} reads input {} from {}",
                        graph.stage(producer_id).name(),
                        written.name(),
                        consumer.name(),
                        position,
                        read.name()
                    );
                    return Err(Error::BufferInconsistency(format!(
                        "edge {} -> {} is written to {} and read from {}",
                        graph.stage(producer_id).name(),
                        consumer.name(),
                        written.name(),
                        read.name()
                    )));
                }
                (Some(buffer), _) | (None, Some(buffer)) => buffer,
                (None, None) => continue,
            };

            let producer = &stages[producer_id.index()];
            let key = ReservationKey::new(
                &producer.hardware,
                Some(consumer_target.name()),
                &producer.name,
            )
            .at_port(consumer.name(), position);
            let produced = graph.output_shape(producer_id);
            match stages[consumer_id.index()].placement {
                Placement::Compute(unit) => {
                    let (virtual_shape, pattern) =
                        read_pattern(consumer, unit, position, produced)?;
                    buffer.borrow_mut().reserve(
                        key.clone(),
                        produced,
                        Some(virtual_shape),
                        Some(pattern),
                    )?;
                    stages[consumer_id.index()].inputs.push(InputPort {
                        producer: producer_id,
                        buffer: buffer.clone(),
                        key,
                    });
                }
                Placement::Prefilled => {
                    buffer.borrow_mut().reserve(key, produced, None, None)?;
                }
            }
            push_output(&mut stages[producer_id.index()].outputs, &buffer);
        }
    }

    for sink_id in graph.sinks() {
        let sink = &stages[sink_id.index()];
        let buffer = match targets[sink_id.index()] {
            Target::Compute(unit) => memory_buffer(&buffers, unit.output_buffer()?)?,
            Target::Memory(memory) => memory_buffer(&buffers, &memory.name)?,
            Target::Analog(_) => continue,
        };
        let key = ReservationKey::new(&sink.hardware, None, &sink.name);
        buffer
            .borrow_mut()
            .reserve(key, graph.output_shape(*sink_id), None, None)?;
        push_output(&mut stages[sink_id.index()].outputs, &buffer);
    }

    Ok(Bindings { stages, buffers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::MemoryUnit;
    use crate::specs::{SoftwareGraphBuilder, StencilOp};

    fn chain() -> SoftwareGraph {
        SoftwareGraphBuilder::new()
            .add_stages(vec![
                Stage::pixel_input("in", &[8, 8, 1]).unwrap(),
                Stage::stencil("blur", StencilOp::AvgPool)
                    .input("in", &[8, 8, 1], &[3, 3, 1], &[1, 1, 1], true)
                    .unwrap(),
            ])
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn reserves_edges_and_sinks() {
        let graph = chain();
        let hw = HardwareDescription::new()
            .with_memory(MemoryUnit::line_buffer("lb"))
            .with_memory(MemoryUnit::fifo("out"))
            .with_compute(
                ComputeUnit::new("pe", &[&[3, 3, 1]], &[1, 1, 1], 1e-12)
                    .unwrap()
                    .reads(&["lb"])
                    .writes("out"),
            );
        let mapping = Mapping::new().bind("in", "lb").bind("blur", "pe");
        let bindings = bind(&graph, &hw, &mapping).unwrap();

        let blur = bindings.stage(graph.index_of("blur").unwrap());
        assert!(matches!(blur.placement, Placement::Compute(_)));
        assert_eq!(blur.inputs.len(), 1);
        let port = &blur.inputs[0];
        assert_eq!(port.key.producer, "lb");
        assert_eq!(port.key.consumer.as_deref(), Some("pe"));
        let lb = port.buffer.borrow();
        let reservation = lb.reservation(&port.key).unwrap();
        assert_eq!(reservation.virtual_shape(), Shape::new(10, 10, 1));

        let out = bindings.buffers["out"].borrow();
        let sink = ReservationKey::new("pe", None, "blur");
        assert_eq!(out.reservation(&sink).unwrap().shape(), Shape::new(8, 8, 1));
    }

    #[test]
    fn edge_buffers_must_be_shared() {
        let graph = chain();
        let hw = HardwareDescription::new()
            .with_memory(MemoryUnit::line_buffer("lb"))
            .with_memory(MemoryUnit::fifo("other"))
            .with_compute(
                ComputeUnit::new("pe", &[&[3, 3, 1]], &[1, 1, 1], 1e-12)
                    .unwrap()
                    .reads(&["other"])
                    .writes("other"),
            );
        let mapping = Mapping::new().bind("in", "lb").bind("blur", "pe");
        assert!(matches!(
            bind(&graph, &hw, &mapping),
            Err(Error::BufferInconsistency(_))
        ));
    }
}
