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

use crate::shape::Shape;

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A shape that is not a rank-3 triple of non-zero extents.
    InvalidShape(String),
    /// The output shape derived from edge `edge` of `stage` disagrees with
    /// the one derived from the other edges (or with the declared one).
    ShapeInconsistency {
        stage: String,
        edge: usize,
        expected: Shape,
        found: Shape,
    },
    /// The producer's output domain is not accepted by the consumer.
    DomainMismatch { producer: String, consumer: String },
    UnsupportedOption(String),
    BufferInconsistency(String),
    MissingMapping(String),
    /// The scheduler (or the functional driver) can not make progress; the
    /// payload lists the stages that never finished.
    ProgressDeadlock(Vec<String>),
    UnknownStage(String),
    DuplicateName(String),
    GraphFrozen,
    InvalidHierarchy(String),
    IncompleteDescription(String),
    DoubleCounting(String),
    InvalidInput(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidShape(msg) => write!(f, "ERROR: invalid shape: {}", msg),
            Self::ShapeInconsistency {
                stage,
                edge,
                expected,
                found,
            } => write!(
                f,
                "ERROR: stage {} edge {} derives output shape {} but {} was expected",
                stage, edge, found, expected
            ),
            Self::DomainMismatch { producer, consumer } => write!(
                f,
                "ERROR: output domain of {} is not accepted by {}",
                producer, consumer
            ),
            Self::UnsupportedOption(msg) => write!(f, "ERROR: unsupported option: {}", msg),
            Self::BufferInconsistency(msg) => write!(f, "ERROR: buffer inconsistency: {}", msg),
            Self::MissingMapping(stage) => {
                write!(f, "ERROR: stage {} is not mapped to any hardware", stage)
            }
            Self::ProgressDeadlock(stages) => write!(
                f,
                "ERROR: no progress possible, unfinished stages: {}",
                stages.join(", ")
            ),
            Self::UnknownStage(name) => write!(f, "ERROR: unknown stage {}", name),
            Self::DuplicateName(name) => write!(f, "ERROR: duplicate name {}", name),
            Self::GraphFrozen => write!(f, "ERROR: the graph was already built"),
            Self::InvalidHierarchy(msg) => write!(f, "ERROR: invalid analog hierarchy: {}", msg),
            Self::IncompleteDescription(msg) => {
                write!(f, "ERROR: incomplete description: {}", msg)
            }
            Self::DoubleCounting(msg) => write!(f, "ERROR: energy counted twice: {}", msg),
            Self::InvalidInput(msg) => write!(f, "ERROR: invalid input: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
