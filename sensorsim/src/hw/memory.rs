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

use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, BufferKind};

/// A digital memory instance. Every memory backs exactly one buffer shared
/// by all producers writing to it and all consumers reading from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryUnit {
    pub name: String,
    pub kind: BufferKind,
    /// joules per element read
    pub read_energy: f64,
    /// joules per element written
    pub write_energy: f64,
}

impl MemoryUnit {
    pub fn new(name: &str, kind: BufferKind, read_energy: f64, write_energy: f64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            read_energy,
            write_energy,
        }
    }

    pub fn fifo(name: &str) -> Self {
        Self::new(name, BufferKind::Fifo, 0.0, 0.0)
    }

    pub fn line_buffer(name: &str) -> Self {
        Self::new(name, BufferKind::LineBuffer, 0.0, 0.0)
    }

    pub fn with_access_energy(mut self, read_energy: f64, write_energy: f64) -> Self {
        self.read_energy = read_energy;
        self.write_energy = write_energy;
        self
    }

    pub(crate) fn instantiate(&self) -> Buffer {
        Buffer::new(&self.name, self.kind)
    }

    pub fn access_energy(&self, reads: usize, writes: usize) -> f64 {
        reads as f64 * self.read_energy + writes as f64 * self.write_energy
    }
}
