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

//! Functional simulation: pushes test tensors through the mapped pipeline.
//!
//! Analog stages run the noise model of their array, digital stages the
//! noise-free reference. A single generator, seeded once per run, feeds
//! every stochastic draw so that a fixed seed reproduces the run exactly.

mod reference;

use std::collections::{BTreeMap, BTreeSet};

use rand::SeedableRng;

use crate::analog::NoiseRng;
use crate::hw::HardwareDescription;
use crate::mapping::Mapping;
use crate::specs::SoftwareGraph;
use crate::{Error, Tensor};

/// Output tensors of every stage, by stage name.
pub type StageOutputs = BTreeMap<String, Vec<Tensor>>;

/// Runs every stage once, in data-dependency order.
///
/// `inputs` supplies the tensors of the input stages. Input stages bound to
/// an analog array are passed through it, e.g. light through the pixel
/// array; other input stages emit their tensors unchanged. Digital stages
/// without a noise-free reference, and the digital stages downstream of
/// them, are left out of the outputs.
pub fn functional_simulate(
    graph: &SoftwareGraph,
    hw: &mut HardwareDescription,
    mapping: &Mapping,
    inputs: &BTreeMap<String, Vec<Tensor>>,
    seed: Option<u64>,
) -> Result<StageOutputs, Error> {
    hw.check()?;
    mapping.check(graph, hw)?;
    let mut rng = match seed {
        Some(seed) => NoiseRng::seed_from_u64(seed),
        None => NoiseRng::from_entropy(),
    };
    hw.analog.reset_fixed_pattern();

    let mut outputs = StageOutputs::new();
    let mut skipped = BTreeSet::new();
    let mut invoked = BTreeSet::new();
    let mut pending = graph.iter_stages().collect::<Vec<_>>();
    while !pending.is_empty() {
        let position = pending.iter().position(|stage_id| {
            graph
                .stage(*stage_id)
                .input_stages()
                .all(|input| outputs.contains_key(input) || skipped.contains(input))
        });
        let stage_id = match position {
            Some(position) => pending.remove(position),
            None => {
                let stuck = pending
                    .iter()
                    .map(|s| graph.stage(*s).name().to_string())
                    .collect::<Vec<_>>();
                log::error!("No stage is ready, waiting: {:?}", stuck);
                return Err(Error::ProgressDeadlock(stuck));
            }
        };
        let stage = graph.stage(stage_id);
        let hardware = mapping.target(hw, stage.name())?;

        if let Some(missing) = stage.input_stages().find(|input| skipped.contains(*input)) {
            if hardware.is_analog() {
                log::error!(
                    "Analog stage {} depends on {}, which has no reference",
                    stage.name(),
                    missing
                );
                return Err(Error::UnsupportedOption(format!(
                    "{}: input {} was not evaluated",
                    stage.name(),
                    missing
                )));
            }
            log::debug!("stage {}: skipped, {} was not evaluated", stage.name(), missing);
            skipped.insert(stage.name());
            continue;
        }
        if !hardware.is_analog() && !stage.kind().is_input() && !reference::has_reference(stage) {
            log::warn!("stage {}: no digital reference, skipped", stage.name());
            skipped.insert(stage.name());
            continue;
        }

        let feed = if stage.kind().is_input() {
            inputs.get(stage.name()).cloned().ok_or_else(|| {
                log::error!("No tensor supplied for input {}", stage.name());
                Error::InvalidInput(format!("no tensor for input {}", stage.name()))
            })?
        } else {
            let mut feed = vec![];
            for input in stage.input_stages() {
                // every producer is present, checked above
                if let Some(tensors) = outputs.get(input) {
                    feed.extend(tensors.iter().cloned());
                }
            }
            feed
        };

        let produced = if hardware.is_analog() {
            let name = hardware.name().to_string();
            if !invoked.insert(name.clone()) {
                log::debug!("analog array {} invoked again for {}", name, stage.name());
            }
            let array = hw.analog.array_mut(&name).ok_or_else(|| {
                Error::InvalidInput(format!("no analog array named {}", name))
            })?;
            log::debug!("stage {}: analog array {}", stage.name(), name);
            array.forward(&feed, &mut rng)?
        } else if stage.kind().is_input() {
            feed
        } else {
            log::debug!("stage {}: digital reference on {}", stage.name(), hardware.name());
            let per_edge = stage
                .input_stages()
                .filter_map(|input| outputs.get(input).and_then(|t| t.first()).cloned())
                .collect::<Vec<_>>();
            vec![reference::evaluate(stage, &per_edge)?]
        };
        log::trace!(
            "stage {} produced {:?}",
            stage.name(),
            produced.iter().map(|t| t.shape().to_vec()).collect::<Vec<_>>()
        );
        outputs.insert(stage.name().to_string(), produced);
    }
    log::info!(
        "functional simulation done: {} stages evaluated, {} skipped",
        outputs.len(),
        skipped.len()
    );
    Ok(outputs)
}
