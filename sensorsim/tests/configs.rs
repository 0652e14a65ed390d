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

use float_cmp::approx_eq;

use sensorsim::{predefined, PipelineConfig};

const SENSOR: &str = include_str!("../../apps/pipeline/configs/sensor.yaml");

#[test]
fn yaml_matches_predefined_sensor() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = PipelineConfig::from_str(SENSOR).unwrap();
    assert_eq!(config.simulation.seed, Some(42));
    let from_yaml = config.build().unwrap().simulate_with_report().unwrap();
    let built = predefined::sensor_pipeline()
        .unwrap()
        .simulate_with_report()
        .unwrap();
    assert_eq!(from_yaml.schedule, built.schedule);
    for (unit, energy) in &built.breakdown {
        assert!(
            approx_eq!(f64, from_yaml.breakdown[unit], *energy, epsilon = 1e-18),
            "{}",
            unit
        );
    }
}
