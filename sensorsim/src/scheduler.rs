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

//! Stencil dataflow scheduler.
//!
//! Stages bound to compute units are driven cycle by cycle: a unit reads
//! one tile per input edge when every marker under the read window is set,
//! and writes one output tile that becomes visible at the end of the cycle.
//! Input stages and analog stages are prefilled: their whole output is
//! written at once when their upstream stages are done.

use crate::hw::HardwareDescription;
use crate::mapping::Mapping;
use crate::specs::SoftwareGraph;
use crate::{Cycle, Error};

mod binding;
mod sched;

pub use crate::scheduler::sched::{ScheduleReport, Scheduler};

/// Binds `graph` onto `hw` and runs it to completion.
pub fn schedule(
    graph: &SoftwareGraph,
    hw: &HardwareDescription,
    mapping: &Mapping,
    max_cycles: Cycle,
) -> Result<ScheduleReport, Error> {
    Scheduler::new(graph, hw, mapping, max_cycles)?.run()
}
