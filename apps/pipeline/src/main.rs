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
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use env_logger::Target;
use structopt::StructOpt;

use sensorsim::{predefined, Pipeline, PipelineConfig, Tensor};

// Energy runs the scheduler and the energy model, Functional pushes a
// constant frame through the noise models, Graph prints graphviz.
#[derive(Debug)]
enum Mode {
    Energy,
    Functional,
    Graph,
}

impl FromStr for Mode {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Energy" => Ok(Mode::Energy),
            "Functional" => Ok(Mode::Functional),
            "Graph" => Ok(Mode::Graph),
            _ => Err(Self::Err::new(
                std::io::ErrorKind::Other,
                format!("Invalid mode: {}", s),
            )),
        }
    }
}

#[derive(StructOpt)]
#[structopt(name = "pipeline", about = "Image sensor pipeline simulator")]
struct Arguments {
    /// pipeline description in YAML
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// ready-made pipeline: abs, blur, strided, sensor
    #[structopt(short, long, default_value = "sensor")]
    predefined: String,
    /// supported modes: Energy, Functional, Graph
    #[structopt(short, long, default_value = "Energy")]
    mode: Mode,
    /// overrides the cycle budget of the description
    #[structopt(long)]
    max_cycles: Option<usize>,
    /// overrides the noise seed of the description
    #[structopt(long)]
    seed: Option<u64>,
    /// value of every input element in functional runs
    #[structopt(long, default_value = "1000.0")]
    fill: f64,
}

fn load(args: &Arguments) -> anyhow::Result<Pipeline> {
    let mut pipeline = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?
            .build()
            .with_context(|| format!("building {}", path.display()))?,
        None => predefined::by_name(&args.predefined)?,
    };
    if let Some(max_cycles) = args.max_cycles {
        pipeline.simulation.max_cycles = max_cycles;
    }
    if args.seed.is_some() {
        pipeline.simulation.seed = args.seed;
    }
    Ok(pipeline)
}

fn energy(pipeline: &Pipeline) -> anyhow::Result<()> {
    let report = pipeline.simulate_with_report()?;
    println!("cycles: {}", report.schedule.total_cycles);
    println!("total energy: {:e} J", report.total);
    for (unit, energy) in &report.breakdown {
        println!("  {}: {:e} J", unit, energy);
    }
    Ok(())
}

fn functional(pipeline: &mut Pipeline, fill: f64) -> anyhow::Result<()> {
    let mut inputs = BTreeMap::new();
    for stage_id in pipeline.graph.iter_stages() {
        let stage = pipeline.graph.stage(stage_id);
        if stage.kind().is_input() {
            let frame = Tensor::from_elem(stage.output_shape().dim(), fill);
            inputs.insert(stage.name().to_string(), vec![frame]);
        }
    }
    let outputs = pipeline.functional_simulate(&inputs)?;
    for name in pipeline.graph.sink_names() {
        if !outputs.contains_key(name) {
            println!("{}: no digital reference, not evaluated", name);
        }
        for tensor in outputs.get(name).into_iter().flatten() {
            let (min, max) = tensor
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(*v), hi.max(*v))
                });
            println!(
                "{}: shape {:?} min {:e} mean {:e} max {:e}",
                name,
                tensor.shape(),
                min,
                tensor.mean().unwrap_or(0.0),
                max
            );
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("sensorsim"), log::LevelFilter::Info)
        .target(Target::Stderr)
        .parse_default_env()
        .init();

    let mut pipeline = load(&args)?;
    log::info!(
        "{} stages, sources {:?}, sinks {:?}",
        pipeline.graph.len(),
        pipeline.graph.source_names(),
        pipeline.graph.sink_names()
    );
    match args.mode {
        Mode::Energy => energy(&pipeline),
        Mode::Functional => functional(&mut pipeline, args.fill),
        Mode::Graph => {
            println!("{}", pipeline.graph.to_graphviz());
            Ok(())
        }
    }
}
