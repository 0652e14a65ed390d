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

use std::fmt;

use serde::{Deserialize, Serialize};

/// The physical quantity carried between analog nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalDomain {
    Optical,
    Voltage,
    Current,
    Charge,
    Time,
    Digital,
}

impl fmt::Display for SignalDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Optical => "optical",
            Self::Voltage => "voltage",
            Self::Current => "current",
            Self::Charge => "charge",
            Self::Time => "time",
            Self::Digital => "digital",
        };
        write!(f, "{}", name)
    }
}

/// Returns true if `output` can drive a node accepting `inputs`.
pub fn accepts(inputs: &[SignalDomain], output: SignalDomain) -> bool {
    inputs.contains(&output)
}
