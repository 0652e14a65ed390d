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

//! software dataflow graph
//!
//! Stages are declared with their `input_stages` only; the builder inverts
//! them into output stages, ready-boards, sources and sinks. Once `build()`
//! returns the graph is frozen: the builder refuses further stages and
//! rebuilding returns the same graph.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::prelude::*;

use super::stage::{ReadyBoard, Stage, StageKind};
use crate::{Error, Shape};

/// Position of the edge in the consumer's declared input order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputPosition(pub usize);

#[derive(Clone, Debug)]
pub struct SoftwareGraph {
    /// stages in declaration order; edges go producer -> consumer
    topo: Graph<Stage, InputPosition>,
    sources: Vec<NodeIndex>,
    sinks: Vec<NodeIndex>,
}

#[derive(Debug, Default)]
pub struct SoftwareGraphBuilder {
    stages: Vec<Stage>,
    built: Option<SoftwareGraph>,
}

impl SoftwareGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage(&mut self, stage: Stage) -> Result<&mut Self, Error> {
        if self.built.is_some() {
            log::error!("Stage {} added after the graph was built", stage.name());
            return Err(Error::GraphFrozen);
        }
        self.stages.push(stage);
        Ok(self)
    }

    pub fn add_stages<I: IntoIterator<Item = Stage>>(
        &mut self,
        stages: I,
    ) -> Result<&mut Self, Error> {
        for stage in stages {
            self.add_stage(stage)?;
        }
        Ok(self)
    }

    /// Validates the declared stages and freezes the graph.
    pub fn build(&mut self) -> Result<SoftwareGraph, Error> {
        if let Some(graph) = &self.built {
            return Ok(graph.clone());
        }
        let graph = SoftwareGraph::from_stages(&self.stages)?;
        self.built = Some(graph.clone());
        Ok(graph)
    }
}

impl SoftwareGraph {
    fn from_stages(stages: &[Stage]) -> Result<Self, Error> {
        let mut topo = Graph::<Stage, InputPosition>::new();
        let mut by_name = HashMap::<String, NodeIndex>::new();
        for stage in stages {
            if stage.name().is_empty() {
                return Err(Error::IncompleteDescription(
                    "stage with an empty name".to_string(),
                ));
            }
            if by_name.contains_key(stage.name()) {
                log::error!("Stage {} declared twice", stage.name());
                return Err(Error::DuplicateName(stage.name().to_string()));
            }
            let mut stage = stage.clone();
            stage.output_stages.clear();
            stage.ready_board = ReadyBoard::default();
            let name = stage.name().to_string();
            by_name.insert(name, topo.add_node(stage));
        }

        // shapes first, so that edges can be checked against producers
        for node_id in topo.node_indices() {
            let shape = topo[node_id].derive_output()?;
            topo[node_id].set_output_shape(shape);
        }

        // invert input_stages into edges, output_stages and ready-boards
        for consumer_id in topo.node_indices().collect::<Vec<_>>() {
            let inputs = topo[consumer_id]
                .input_stages()
                .map(String::from)
                .collect::<Vec<_>>();
            for (position, producer) in inputs.iter().enumerate() {
                let producer_id = *by_name.get(producer).ok_or_else(|| {
                    log::error!(
                        "Stage {} names unknown input {}",
                        topo[consumer_id].name(),
                        producer
                    );
                    Error::UnknownStage(producer.clone())
                })?;
                let consumer_name = topo[consumer_id].name().to_string();
                Self::check_edge(&topo[producer_id], &topo[consumer_id], position)?;
                topo[producer_id].output_stages.push(consumer_name);
                topo[consumer_id].ready_board.expect(producer);
                topo.add_edge(producer_id, consumer_id, InputPosition(position));
            }
        }

        // sources propagate: a stage is a source when nothing feeds it
        let sources = topo
            .node_indices()
            .filter(|n| {
                topo.neighbors_directed(*n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect::<Vec<_>>();
        let sinks = topo
            .node_indices()
            .filter(|n| {
                topo.neighbors_directed(*n, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .collect::<Vec<_>>();
        let graph = Self {
            topo,
            sources,
            sinks,
        };
        let reachable = graph.reachable_from_sources();
        for node_id in graph.topo.node_indices() {
            if !reachable.contains(&node_id) {
                log::warn!(
                    "Stage {} is not reachable from any source",
                    graph.topo[node_id].name()
                );
            }
        }
        log::debug!(
            "software graph: {} stages, sources {:?}, sinks {:?}",
            graph.topo.node_count(),
            graph.source_names(),
            graph.sink_names()
        );
        Ok(graph)
    }

    /// The streamed input shape of `consumer`'s edge must be what the
    /// producer emits; weight operands must come from weight inputs.
    fn check_edge(producer: &Stage, consumer: &Stage, position: usize) -> Result<(), Error> {
        let streamed = consumer.edges().len();
        if position >= streamed {
            if *producer.kind() != StageKind::WeightInput {
                log::error!(
                    "Operand {} of {} is not a weight input",
                    producer.name(),
                    consumer.name()
                );
                return Err(Error::InvalidInput(format!(
                    "operand {} of {} must be a weight input",
                    producer.name(),
                    consumer.name()
                )));
            }
            return Ok(());
        }
        let edge = &consumer.edges()[position];
        let flatten = matches!(
            consumer.kind(),
            StageKind::Dnn {
                needs_flatten: true,
                ..
            }
        );
        let matches = if flatten {
            edge.input.volume() == producer.output_shape().volume()
        } else {
            edge.input == producer.output_shape()
        };
        if !matches {
            log::error!(
                "Stage {} expects {} from {}, which produces {}",
                consumer.name(),
                edge.input,
                producer.name(),
                producer.output_shape()
            );
            return Err(Error::ShapeInconsistency {
                stage: consumer.name().to_string(),
                edge: position,
                expected: producer.output_shape(),
                found: edge.input,
            });
        }
        Ok(())
    }

    fn reachable_from_sources(&self) -> HashSet<NodeIndex> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            let mut bfs = Bfs::new(&self.topo, *source);
            while let Some(node_id) = bfs.next(&self.topo) {
                seen.insert(node_id);
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.topo.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.topo.node_count() == 0
    }

    /// Stage indices in declaration order.
    pub fn iter_stages(&self) -> petgraph::graph::NodeIndices {
        self.topo.node_indices()
    }

    pub fn stage(&self, stage_id: NodeIndex) -> &Stage {
        &self.topo[stage_id]
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.topo
            .node_indices()
            .find(|n| self.topo[*n].name() == name)
    }

    pub fn stage_by_name(&self, name: &str) -> Option<&Stage> {
        self.index_of(name).map(|n| &self.topo[n])
    }

    /// Producers of `stage_id`, in the consumer's declared input order.
    pub fn inputs_of(&self, stage_id: NodeIndex) -> Vec<NodeIndex> {
        let mut inputs = self
            .topo
            .edges_directed(stage_id, Direction::Incoming)
            .map(|edge| (edge.weight().0, edge.source()))
            .collect::<Vec<_>>();
        inputs.sort_by_key(|(position, _)| *position);
        inputs.into_iter().map(|(_, source)| source).collect()
    }

    /// Consumers of `stage_id`, in declaration order.
    pub fn outputs_of(&self, stage_id: NodeIndex) -> Vec<NodeIndex> {
        let mut outputs = self
            .topo
            .neighbors_directed(stage_id, Direction::Outgoing)
            .collect::<Vec<_>>();
        outputs.sort();
        outputs.dedup();
        outputs
    }

    pub fn sources(&self) -> &[NodeIndex] {
        &self.sources
    }

    pub fn sinks(&self) -> &[NodeIndex] {
        &self.sinks
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|n| self.topo[*n].name()).collect()
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|n| self.topo[*n].name()).collect()
    }

    pub fn output_shape(&self, stage_id: NodeIndex) -> Shape {
        self.topo[stage_id].output_shape()
    }

    /// Fresh copies of the per-stage ready-boards.
    pub fn ready_boards(&self) -> HashMap<NodeIndex, ReadyBoard> {
        self.topo
            .node_indices()
            .map(|n| (n, self.topo[n].ready_board().clone()))
            .collect()
    }

    /// Kahn's algorithm, breaking ties by declaration order so that the
    /// order is deterministic. Stages caught in a cycle can never become
    /// ready, which is reported as a progress deadlock.
    pub fn topological_order(&self) -> Result<Vec<NodeIndex>, Error> {
        let mut pending = self
            .topo
            .node_indices()
            .map(|n| (n, self.inputs_of(n).len()))
            .collect::<HashMap<_, _>>();
        let mut ready = self
            .topo
            .node_indices()
            .filter(|n| pending[n] == 0)
            .collect::<VecDeque<_>>();
        let mut order = Vec::with_capacity(self.topo.node_count());
        while let Some(node_id) = ready.pop_front() {
            order.push(node_id);
            let mut released = vec![];
            for edge in self.topo.edges_directed(node_id, Direction::Outgoing) {
                if let Some(count) = pending.get_mut(&edge.target()) {
                    *count -= 1;
                    if *count == 0 {
                        released.push(edge.target());
                    }
                }
            }
            released.sort();
            ready.extend(released);
        }
        if order.len() != self.topo.node_count() {
            let stuck = self
                .topo
                .node_indices()
                .filter(|n| !order.contains(n))
                .map(|n| self.topo[n].name().to_string())
                .collect::<Vec<_>>();
            log::error!("Cyclic dependency between stages {:?}", stuck);
            return Err(Error::ProgressDeadlock(stuck));
        }
        Ok(order)
    }

    pub fn to_graphviz(&self) -> String {
        use petgraph::dot::{Config, Dot};

        let generator = Dot::with_attr_getters(
            &self.topo,
            &[Config::NodeNoLabel, Config::EdgeNoLabel],
            &|_, edge| format!("label=\"input {}\"", edge.weight().0),
            &|_, node| {
                let [h, w, c] = node.1.output_shape().to_hwc();
                format!("label=\"{}\n{}x{}x{}\"", node.1.name(), h, w, c)
            },
        );
        format!("{:?}", generator)
    }
}

impl std::fmt::Display for SoftwareGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_graphviz())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::StencilOp;

    fn pipeline() -> Vec<Stage> {
        vec![
            Stage::stencil("edge", StencilOp::Custom("sobel".into()))
                .input("blur", &[16, 16, 1], &[3, 3, 1], &[1, 1, 1], true)
                .unwrap(),
            Stage::pixel_input("pixels", &[16, 16, 1]).unwrap(),
            Stage::stencil("blur", StencilOp::AvgPool)
                .input("pixels", &[16, 16, 1], &[3, 3, 1], &[1, 1, 1], true)
                .unwrap(),
        ]
    }

    #[test]
    fn builder_inverts_edges() {
        let mut builder = SoftwareGraphBuilder::new();
        builder.add_stages(pipeline()).unwrap();
        let graph = builder.build().unwrap();

        assert_eq!(graph.source_names(), vec!["pixels"]);
        assert_eq!(graph.sink_names(), vec!["edge"]);
        let blur = graph.stage_by_name("blur").unwrap();
        assert_eq!(blur.output_stages(), &["edge".to_string()]);
        assert_eq!(blur.ready_board().get("pixels"), Some(false));
        assert_eq!(blur.output_shape(), Shape::new(16, 16, 1));

        let order = graph
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|n| graph.stage(n).name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["pixels", "blur", "edge"]);
    }

    #[test]
    fn builder_is_idempotent_and_frozen() {
        let mut builder = SoftwareGraphBuilder::new();
        builder.add_stages(pipeline()).unwrap();
        let first = builder.build().unwrap();
        let second = builder.build().unwrap();
        assert_eq!(first.to_graphviz(), second.to_graphviz());

        let extra = Stage::pixel_input("late", &[1, 1, 1]).unwrap();
        assert_eq!(builder.add_stage(extra).err(), Some(Error::GraphFrozen));
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let mut forward = SoftwareGraphBuilder::new();
        forward.add_stages(pipeline()).unwrap();
        let mut backward = SoftwareGraphBuilder::new();
        backward.add_stages(pipeline().into_iter().rev()).unwrap();
        let a = forward.build().unwrap();
        let b = backward.build().unwrap();
        for stage in ["pixels", "blur", "edge"] {
            assert_eq!(
                a.stage_by_name(stage).unwrap().output_stages(),
                b.stage_by_name(stage).unwrap().output_stages()
            );
        }
        assert_eq!(a.sink_names(), b.sink_names());
    }

    #[test]
    fn dangling_and_duplicate_names() {
        let mut builder = SoftwareGraphBuilder::new();
        builder
            .add_stage(
                Stage::stencil("abs", StencilOp::Abs)
                    .input("nowhere", &[4, 4, 1], &[1, 1, 1], &[1, 1, 1], false)
                    .unwrap(),
            )
            .unwrap();
        assert_eq!(
            builder.build().err(),
            Some(Error::UnknownStage("nowhere".to_string()))
        );

        let mut builder = SoftwareGraphBuilder::new();
        builder
            .add_stage(Stage::pixel_input("in", &[4, 4, 1]).unwrap())
            .unwrap()
            .add_stage(Stage::pixel_input("in", &[4, 4, 1]).unwrap())
            .unwrap();
        assert_eq!(
            builder.build().err(),
            Some(Error::DuplicateName("in".to_string()))
        );
    }

    #[test]
    fn producer_shape_must_match_edge() {
        let mut builder = SoftwareGraphBuilder::new();
        builder
            .add_stage(Stage::pixel_input("in", &[8, 8, 1]).unwrap())
            .unwrap()
            .add_stage(
                Stage::stencil("abs", StencilOp::Abs)
                    .input("in", &[4, 4, 1], &[1, 1, 1], &[1, 1, 1], false)
                    .unwrap(),
            )
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(Error::ShapeInconsistency { edge: 0, .. })
        ));
    }

    #[test]
    fn cycles_deadlock() {
        let mut builder = SoftwareGraphBuilder::new();
        builder
            .add_stage(Stage::pixel_input("in", &[4, 4, 1]).unwrap())
            .unwrap()
            .add_stage(
                Stage::stencil("b", StencilOp::Identity)
                    .input("c", &[4, 4, 1], &[1, 1, 1], &[1, 1, 1], false)
                    .unwrap(),
            )
            .unwrap()
            .add_stage(
                Stage::stencil("c", StencilOp::Identity)
                    .input("b", &[4, 4, 1], &[1, 1, 1], &[1, 1, 1], false)
                    .unwrap(),
            )
            .unwrap();
        let graph = builder.build().unwrap();
        assert_eq!(
            graph.topological_order(),
            Err(Error::ProgressDeadlock(vec![
                "b".to_string(),
                "c".to_string()
            ]))
        );
    }
}
