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

use bencher::Bencher;
use bencher::{benchmark_group, benchmark_main};

use sensorsim::predefined;

fn abs_streaming(bench: &mut Bencher) {
    let pipeline = predefined::abs_pipeline(1).unwrap();
    bench.iter(|| pipeline.simulate().unwrap());
}

fn padded_line_buffer(bench: &mut Bencher) {
    let pipeline = predefined::stencil_pipeline(1, true).unwrap();
    bench.iter(|| pipeline.simulate().unwrap());
}

fn sensor_readout(bench: &mut Bencher) {
    let pipeline = predefined::sensor_pipeline().unwrap();
    bench.iter(|| pipeline.simulate().unwrap());
}

benchmark_group!(benches, abs_streaming, padded_line_buffer, sensor_readout);
benchmark_main!(benches);
