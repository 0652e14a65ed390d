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

//! Recursive analog hierarchy: an array contains units, a unit contains
//! components. Containment is checked whenever a child is added.

use std::collections::BTreeSet;

use petgraph::prelude::*;

use super::domain::accepts;
use super::noise::NoiseRng;
use super::ops::{AnalogOp, AnalogOperator};
use super::SignalDomain;
use crate::{Error, Tensor};

/// Replication of a node inside its container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Count {
    pub rows: usize,
    pub cols: usize,
}

impl Count {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub const fn one() -> Self {
        Self::new(1, 1)
    }

    pub fn total(&self) -> usize {
        self.rows * self.cols
    }
}

impl Default for Count {
    fn default() -> Self {
        Self::one()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Component,
    Unit,
    Array,
}

impl Level {
    fn child(&self) -> Option<Level> {
        match self {
            Self::Array => Some(Self::Unit),
            Self::Unit => Some(Self::Component),
            Self::Component => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Component {
    op: AnalogOp,
    input_domains: Vec<SignalDomain>,
    output_domain: SignalDomain,
}

#[derive(Clone, Debug, Default)]
pub struct Container {
    children: Graph<AnalogNode, ()>,
    sources: Vec<NodeIndex>,
    sinks: Vec<NodeIndex>,
    energy_override: Option<f64>,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Component(Component),
    Unit(Container),
    Array(Container),
}

#[derive(Clone, Debug)]
pub struct AnalogNode {
    name: String,
    count: Count,
    kind: NodeKind,
}

impl AnalogNode {
    /// A leaf with the operator's natural signal domains.
    pub fn component(name: &str, op: AnalogOp) -> Self {
        let input_domains = op.input_domains();
        let output_domain = op.output_domain();
        Self {
            name: name.to_string(),
            count: Count::one(),
            kind: NodeKind::Component(Component {
                op,
                input_domains,
                output_domain,
            }),
        }
    }

    pub fn unit(name: &str) -> Self {
        Self {
            name: name.to_string(),
            count: Count::one(),
            kind: NodeKind::Unit(Container::default()),
        }
    }

    pub fn array(name: &str) -> Self {
        Self {
            name: name.to_string(),
            count: Count::one(),
            kind: NodeKind::Array(Container::default()),
        }
    }

    pub fn with_count(mut self, rows: usize, cols: usize) -> Self {
        self.count = Count::new(rows, cols);
        self
    }

    /// Overrides the domains of a component.
    pub fn with_domains(
        mut self,
        inputs: &[SignalDomain],
        output: SignalDomain,
    ) -> Result<Self, Error> {
        match &mut self.kind {
            NodeKind::Component(component) => {
                component.input_domains = inputs.to_vec();
                component.output_domain = output;
                Ok(self)
            }
            _ => Err(Error::InvalidHierarchy(format!(
                "{}: only components declare domains",
                self.name
            ))),
        }
    }

    /// Replaces the summed energy of a unit by a fixed value.
    pub fn with_energy(mut self, energy: f64) -> Result<Self, Error> {
        match &mut self.kind {
            NodeKind::Unit(unit) => {
                unit.energy_override = Some(energy);
                Ok(self)
            }
            _ => Err(Error::InvalidHierarchy(format!(
                "{}: only units override their energy",
                self.name
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> Count {
        self.count
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn level(&self) -> Level {
        match self.kind {
            NodeKind::Component(_) => Level::Component,
            NodeKind::Unit(_) => Level::Unit,
            NodeKind::Array(_) => Level::Array,
        }
    }

    fn container(&self) -> Option<&Container> {
        match &self.kind {
            NodeKind::Unit(container) | NodeKind::Array(container) => Some(container),
            NodeKind::Component(_) => None,
        }
    }

    fn container_mut(&mut self) -> Result<&mut Container, Error> {
        match &mut self.kind {
            NodeKind::Unit(container) | NodeKind::Array(container) => Ok(container),
            NodeKind::Component(_) => Err(Error::InvalidHierarchy(format!(
                "component {} has no children",
                self.name
            ))),
        }
    }

    /// Adds a child one level down: units into arrays, components into
    /// units.
    pub fn add(&mut self, child: AnalogNode) -> Result<&mut Self, Error> {
        if self.level().child() != Some(child.level()) {
            log::error!(
                "{:?} {} can not contain {:?} {}",
                self.level(),
                self.name,
                child.level(),
                child.name
            );
            return Err(Error::InvalidHierarchy(format!(
                "{:?} {} can not contain {:?} {}",
                self.level(),
                self.name,
                child.level(),
                child.name
            )));
        }
        let name = self.name.clone();
        let container = self.container_mut()?;
        if container.find(&child.name).is_some() {
            return Err(Error::DuplicateName(format!("{}/{}", name, child.name)));
        }
        container.children.add_node(child);
        Ok(self)
    }

    /// Wires two children of this container.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<&mut Self, Error> {
        let name = self.name.clone();
        let container = self.container_mut()?;
        let producer = container.lookup(&name, from)?;
        let consumer = container.lookup(&name, to)?;
        container.children.add_edge(producer, consumer, ());
        Ok(self)
    }

    /// Designates the external ports. Without a designation, children with
    /// no producer are sources and children with no consumer are sinks.
    pub fn ports(&mut self, sources: &[&str], sinks: &[&str]) -> Result<&mut Self, Error> {
        let name = self.name.clone();
        let container = self.container_mut()?;
        container.sources = sources
            .iter()
            .map(|child| container.lookup(&name, child))
            .collect::<Result<_, _>>()?;
        container.sinks = sinks
            .iter()
            .map(|child| container.lookup(&name, child))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    pub fn child(&self, name: &str) -> Option<&AnalogNode> {
        let container = self.container()?;
        container.find(name).map(|n| &container.children[n])
    }

    pub fn children(&self) -> impl Iterator<Item = &AnalogNode> {
        self.container()
            .into_iter()
            .flat_map(|c| c.children.node_indices().map(move |n| &c.children[n]))
    }

    /// Accepted input domains: a component's own, or the union over the
    /// source children.
    pub fn input_domains(&self) -> Vec<SignalDomain> {
        match &self.kind {
            NodeKind::Component(component) => component.input_domains.clone(),
            NodeKind::Unit(container) | NodeKind::Array(container) => container
                .source_ids()
                .iter()
                .flat_map(|n| container.children[*n].input_domains())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        }
    }

    /// The domain of the (last) sink child.
    pub fn output_domain(&self) -> Option<SignalDomain> {
        match &self.kind {
            NodeKind::Component(component) => Some(component.output_domain),
            NodeKind::Unit(container) | NodeKind::Array(container) => container
                .sink_ids()
                .last()
                .and_then(|n| container.children[*n].output_domain()),
        }
    }

    /// Energy of one invocation: a component's formula, a unit's override
    /// or the count-weighted sum over its children. An array's own count
    /// describes its layout and does not scale its energy.
    pub fn energy(&self) -> Result<f64, Error> {
        match &self.kind {
            NodeKind::Component(component) => component.op.energy(),
            NodeKind::Unit(Container {
                energy_override: Some(energy),
                ..
            }) => Ok(*energy),
            NodeKind::Unit(container) | NodeKind::Array(container) => {
                container.children_energy()
            }
        }
    }

    /// Breadth-first check that every producer's output domain is accepted
    /// by its consumers, at this level and below.
    pub fn check_domains(&self) -> Result<(), Error> {
        let container = match self.container() {
            Some(container) => container,
            None => return Ok(()),
        };
        if container.children.node_count() == 0 {
            log::error!("{:?} {} is empty", self.level(), self.name);
            return Err(Error::IncompleteDescription(format!(
                "{:?} {} has no children",
                self.level(),
                self.name
            )));
        }
        let sinks = container.sink_ids();
        let domains = sinks
            .iter()
            .filter_map(|n| container.children[*n].output_domain())
            .collect::<BTreeSet<_>>();
        if domains.len() > 1 {
            log::error!("{} has sinks in domains {:?}", self.name, domains);
            return Err(Error::DomainMismatch {
                producer: container.children[sinks[0]].name.clone(),
                consumer: self.name.clone(),
            });
        }

        let mut seen = vec![false; container.children.node_count()];
        for source in container.source_ids() {
            let mut bfs = Bfs::new(&container.children, source);
            while let Some(node_id) = bfs.next(&container.children) {
                if seen[node_id.index()] {
                    continue;
                }
                seen[node_id.index()] = true;
                let producer = &container.children[node_id];
                producer.check_domains()?;
                for consumer_id in container.children.neighbors(node_id) {
                    let consumer = &container.children[consumer_id];
                    let output = producer.output_domain();
                    let accepted = output
                        .map(|domain| accepts(&consumer.input_domains(), domain))
                        .unwrap_or(false);
                    if !accepted {
                        log::error!(
                            "{}: {} ({:?}) can not drive {} ({:?})",
                            self.name,
                            producer.name,
                            output,
                            consumer.name,
                            consumer.input_domains()
                        );
                        return Err(Error::DomainMismatch {
                            producer: producer.name.clone(),
                            consumer: consumer.name.clone(),
                        });
                    }
                }
            }
        }
        if let Some(unreached) = seen.iter().position(|s| !s) {
            let orphan = &container.children[NodeIndex::new(unreached)];
            log::warn!("{}: {} is not reachable from a source", self.name, orphan.name);
            orphan.check_domains()?;
        }
        Ok(())
    }

    /// Runs the noise model. Source children receive the container's
    /// inputs, every other child the outputs of its producers in wiring
    /// order; the sinks' outputs are concatenated.
    pub fn forward(&mut self, inputs: &[Tensor], rng: &mut NoiseRng) -> Result<Vec<Tensor>, Error> {
        let name = self.name.clone();
        match &mut self.kind {
            NodeKind::Component(component) => component.op.apply(inputs, rng),
            NodeKind::Unit(container) | NodeKind::Array(container) => {
                let order = petgraph::algo::toposort(&container.children, None).map_err(|cycle| {
                    let child = container.children[cycle.node_id()].name.clone();
                    log::error!("{}: cycle through {}", name, child);
                    Error::InvalidHierarchy(format!("{}: cycle through {}", name, child))
                })?;
                let sources = container.source_ids();
                let sinks = container.sink_ids();
                let mut outputs: Vec<Option<Vec<Tensor>>> =
                    vec![None; container.children.node_count()];
                for node_id in order {
                    let mut feed = vec![];
                    if sources.contains(&node_id) {
                        feed.extend(inputs.iter().cloned());
                    }
                    let mut producers = container
                        .children
                        .edges_directed(node_id, Direction::Incoming)
                        .map(|edge| (edge.id(), edge.source()))
                        .collect::<Vec<_>>();
                    producers.sort();
                    for (_, producer) in producers {
                        if let Some(tensors) = &outputs[producer.index()] {
                            feed.extend(tensors.iter().cloned());
                        }
                    }
                    let result = container.children[node_id].forward(&feed, rng)?;
                    outputs[node_id.index()] = Some(result);
                }
                let mut result = vec![];
                for sink in sinks {
                    if let Some(tensors) = outputs[sink.index()].take() {
                        result.extend(tensors);
                    }
                }
                Ok(result)
            }
        }
    }

    /// Redraws fixed-pattern noise on the next invocation.
    pub fn reset_fixed_pattern(&mut self) {
        match &mut self.kind {
            NodeKind::Component(component) => component.op.reset_fixed_pattern(),
            NodeKind::Unit(container) | NodeKind::Array(container) => {
                for child in container.children.node_weights_mut() {
                    child.reset_fixed_pattern();
                }
            }
        }
    }
}

impl Container {
    fn children_energy(&self) -> Result<f64, Error> {
        let mut total = 0.0;
        for child in self.children.node_weights() {
            total += child.count.total() as f64 * child.energy()?;
        }
        Ok(total)
    }

    fn find(&self, name: &str) -> Option<NodeIndex> {
        self.children
            .node_indices()
            .find(|n| self.children[*n].name == name)
    }

    fn lookup(&self, container: &str, name: &str) -> Result<NodeIndex, Error> {
        self.find(name).ok_or_else(|| {
            log::error!("{} has no child {}", container, name);
            Error::UnknownStage(format!("{}/{}", container, name))
        })
    }

    fn source_ids(&self) -> Vec<NodeIndex> {
        if !self.sources.is_empty() {
            return self.sources.clone();
        }
        self.children
            .externals(Direction::Incoming)
            .collect()
    }

    fn sink_ids(&self) -> Vec<NodeIndex> {
        if !self.sinks.is_empty() {
            return self.sinks.clone();
        }
        self.children
            .externals(Direction::Outgoing)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::pixel::{FloatingDiffusion, Photodiode};
    use crate::analog::readout::{Adc, SourceFollower};
    use float_cmp::approx_eq;
    use ndarray::IxDyn;
    use rand::SeedableRng;

    fn pixel_unit() -> AnalogNode {
        let mut unit = AnalogNode::unit("pixel").with_count(4, 4);
        unit.add(AnalogNode::component(
            "pd",
            AnalogOp::Photodiode(Photodiode::new(100e-15, 3.3, 1000.0).without_shot_noise()),
        ))
        .unwrap()
        .add(AnalogNode::component(
            "fd",
            AnalogOp::FloatingDiffusion(FloatingDiffusion::new(1e-15, 1.0, 1.0)),
        ))
        .unwrap()
        .add(AnalogNode::component(
            "sf",
            AnalogOp::SourceFollower(SourceFollower::new(1.0).load(1e-15, 1.0, 1.0)),
        ))
        .unwrap()
        .connect("pd", "fd")
        .unwrap()
        .connect("fd", "sf")
        .unwrap();
        unit
    }

    fn adc_unit() -> AnalogNode {
        let mut unit = AnalogNode::unit("adc").with_count(1, 4);
        unit.add(AnalogNode::component(
            "ss_adc",
            AnalogOp::Adc(Adc::new(100e-15, 16).full_scale(1000.0)),
        ))
        .unwrap();
        unit
    }

    fn sensor() -> AnalogNode {
        let mut array = AnalogNode::array("sensor");
        array
            .add(pixel_unit())
            .unwrap()
            .add(adc_unit())
            .unwrap()
            .connect("pixel", "adc")
            .unwrap();
        array
    }

    #[test]
    fn hierarchy_is_enforced() {
        let mut array = AnalogNode::array("a");
        let component = AnalogNode::component(
            "pd",
            AnalogOp::Photodiode(Photodiode::new(1e-15, 1.0, 1.0)),
        );
        assert!(matches!(
            array.add(component.clone()),
            Err(Error::InvalidHierarchy(_))
        ));
        let mut unit = AnalogNode::unit("u");
        assert!(matches!(
            unit.add(AnalogNode::array("inner")),
            Err(Error::InvalidHierarchy(_))
        ));
        let mut leaf = component;
        assert!(matches!(
            leaf.add(AnalogNode::unit("u")),
            Err(Error::InvalidHierarchy(_))
        ));
    }

    #[test]
    fn domains_are_derived() {
        let array = sensor();
        assert_eq!(array.input_domains(), vec![SignalDomain::Optical]);
        assert_eq!(array.output_domain(), Some(SignalDomain::Digital));
        assert!(array.check_domains().is_ok());
    }

    #[test]
    fn domain_mismatch_names_both_ends() {
        let mut unit = AnalogNode::unit("broken");
        unit.add(AnalogNode::component(
            "adc",
            AnalogOp::Adc(Adc::new(1e-15, 8)),
        ))
        .unwrap()
        .add(AnalogNode::component(
            "fd",
            AnalogOp::FloatingDiffusion(FloatingDiffusion::new(1e-15, 1.0, 1.0)),
        ))
        .unwrap()
        .connect("adc", "fd")
        .unwrap();
        assert_eq!(
            unit.check_domains(),
            Err(Error::DomainMismatch {
                producer: "adc".to_string(),
                consumer: "fd".to_string()
            })
        );
    }

    #[test]
    fn energy_is_count_weighted() {
        let array = sensor();
        let pixel = 100e-15 * 3.3 * 3.3 + 1e-15 + 1e-15;
        let adc = 100e-15 * 65536.0;
        let expected = 16.0 * pixel + 4.0 * adc;
        assert!(approx_eq!(f64, array.energy().unwrap(), expected, epsilon = 1e-18));
        let laid_out = sensor().with_count(2, 1);
        assert!(approx_eq!(f64, laid_out.energy().unwrap(), expected, epsilon = 1e-18));

        let fixed = pixel_unit().with_energy(1e-12).unwrap();
        assert_eq!(fixed.energy(), Ok(1e-12));
    }

    #[test]
    fn forward_through_the_hierarchy() {
        let mut rng = NoiseRng::seed_from_u64(11);
        let mut array = sensor();
        let input = Tensor::from_shape_fn(IxDyn(&[4, 4, 1]), |i| (10 * i[0] + i[1]) as f64);
        let out = array.forward(&[input.clone()], &mut rng).unwrap();
        assert_eq!(out.len(), 1);
        for (a, b) in out[0].iter().zip(input.iter()) {
            assert!((a - b).abs() <= 1000.0 / 65535.0);
        }
    }
}
