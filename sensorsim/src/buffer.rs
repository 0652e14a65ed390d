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

//! Producer/consumer buffers.
//!
//! A buffer holds one reservation per (producer unit, consumer unit,
//! software stage). Each reservation tracks a marker bit per element of the
//! producer's output: writes set markers at the 3-D write index, reads
//! check that every marker under the read window is set. Read windows live
//! in the *virtual* (padded) coordinates of the consumer; positions that
//! fall in the padding are always ready.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{Error, Shape};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferKind {
    /// reads advance one tile at a time
    Fifo,
    /// reads slide over the input, the window advancing by
    /// `tile / kernel * stride` on x and y and by the tile on z
    LineBuffer,
}

/// Buffers are shared between the units that write and read them.
pub type BufferRef = Rc<RefCell<Buffer>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationKey {
    pub producer: String,
    /// `None` for the output of a sink stage
    pub consumer: Option<String>,
    pub stage: String,
    /// consuming stage and its input position; one unit may read the same
    /// output on behalf of several stages
    pub port: Option<(String, usize)>,
}

impl ReservationKey {
    pub fn new(producer: &str, consumer: Option<&str>, stage: &str) -> Self {
        Self {
            producer: producer.to_string(),
            consumer: consumer.map(String::from),
            stage: stage.to_string(),
            port: None,
        }
    }

    pub fn at_port(mut self, stage: &str, position: usize) -> Self {
        self.port = Some((stage.to_string(), position));
        self
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} -> {} [{}]",
            self.producer,
            self.consumer.as_deref().unwrap_or("<sink>"),
            self.stage
        )?;
        match &self.port {
            Some((stage, position)) => write!(f, " for {}#{}", stage, position),
            None => Ok(()),
        }
    }
}

/// How a consumer walks over a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadPattern {
    pub tile: Shape,
    pub kernel: Shape,
    pub stride: Shape,
}

#[derive(Clone, Debug)]
pub struct Reservation {
    shape: Shape,
    virtual_shape: Shape,
    /// real index = virtual index - offset
    offset: Shape,
    markers: BitVec,
    write_index: Shape,
    write_saturated: bool,
    read_index: Shape,
    read_exhausted: bool,
    pattern: Option<ReadPattern>,
}

impl Reservation {
    fn new(shape: Shape, virtual_shape: Shape, pattern: Option<ReadPattern>) -> Self {
        Self {
            shape,
            virtual_shape,
            offset: Shape::new(
                (virtual_shape.x - shape.x) / 2,
                (virtual_shape.y - shape.y) / 2,
                (virtual_shape.z - shape.z) / 2,
            ),
            markers: bitvec![0; shape.volume()],
            write_index: Shape::zero(),
            write_saturated: false,
            read_index: Shape::zero(),
            read_exhausted: pattern.is_none(),
            pattern,
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn virtual_shape(&self) -> Shape {
        self.virtual_shape
    }

    pub fn write_index(&self) -> Shape {
        self.write_index
    }

    pub fn read_index(&self) -> Shape {
        self.read_index
    }

    pub fn is_saturated(&self) -> bool {
        self.write_saturated
    }

    pub fn is_exhausted(&self) -> bool {
        self.read_exhausted
    }

    pub fn marker_sum(&self) -> usize {
        self.markers.count_ones()
    }

    /// Marks the tile at the write index and carries the index
    /// x -> y -> z. Returns the number of newly marked elements.
    fn write(&mut self, tile: Shape) -> usize {
        let start = self.write_index;
        let end = Shape::new(start.x + tile.x, start.y + tile.y, start.z + tile.z).min(self.shape);
        let mut marked = 0;
        for z in start.z..end.z {
            for y in start.y..end.y {
                for x in start.x..end.x {
                    let bit = self.shape.linear_index(Shape::new(x, y, z));
                    if !self.markers[bit] {
                        self.markers.set(bit, true);
                        marked += 1;
                    }
                }
            }
        }

        let index = &mut self.write_index;
        index.x += tile.x;
        if index.x >= self.shape.x {
            index.x = 0;
            index.y += tile.y;
            if index.y >= self.shape.y {
                index.y = 0;
                index.z += tile.z;
                if index.z >= self.shape.z {
                    index.z = self.shape.z;
                    self.write_saturated = true;
                }
            }
        }
        marked
    }

    fn fill(&mut self) {
        self.markers.fill(true);
        self.write_index = Shape::new(0, 0, self.shape.z);
        self.write_saturated = true;
    }

    fn window_end(&self, tile: Shape) -> Shape {
        let r = self.read_index;
        Shape::new(r.x + tile.x, r.y + tile.y, r.z + tile.z).min(self.virtual_shape)
    }

    /// Maps a virtual coordinate on one axis to the real one, `None` in the
    /// padding.
    fn real(virtual_index: usize, offset: usize, extent: usize) -> Option<usize> {
        virtual_index
            .checked_sub(offset)
            .filter(|real| *real < extent)
    }

    fn read_ready(&self) -> bool {
        let pattern = match (self.read_exhausted, self.pattern) {
            (false, Some(pattern)) => pattern,
            _ => return true,
        };
        let start = self.read_index;
        let end = self.window_end(pattern.tile);
        for vz in start.z..end.z {
            let z = match Self::real(vz, self.offset.z, self.shape.z) {
                Some(z) => z,
                None => continue,
            };
            for vy in start.y..end.y {
                let y = match Self::real(vy, self.offset.y, self.shape.y) {
                    Some(y) => y,
                    None => continue,
                };
                for vx in start.x..end.x {
                    if let Some(x) = Self::real(vx, self.offset.x, self.shape.x) {
                        if !self.markers[self.shape.linear_index(Shape::new(x, y, z))] {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Per-axis step of a line buffer: x and y advance by
    /// `tile / kernel * stride` (at least one stride), z by the tile.
    fn line_step(pattern: &ReadPattern) -> Shape {
        let axis = |t: usize, k: usize, s: usize| (t / k.max(1)).max(1) * s;
        Shape::new(
            axis(pattern.tile.x, pattern.kernel.x, pattern.stride.x),
            axis(pattern.tile.y, pattern.kernel.y, pattern.stride.y),
            pattern.tile.z,
        )
    }

    /// Elements fetched by the next read. A line buffer fetches the whole
    /// window at the start of a row and only the new columns afterwards.
    fn read_footprint(&self, kind: BufferKind) -> Shape {
        let pattern = match (self.read_exhausted, self.pattern) {
            (false, Some(pattern)) => pattern,
            _ => return Shape::zero(),
        };
        let end = self.window_end(pattern.tile);
        let window = Shape::new(
            end.x - self.read_index.x,
            end.y - self.read_index.y,
            end.z - self.read_index.z,
        );
        match kind {
            BufferKind::LineBuffer if self.read_index.x > 0 => {
                let step = Self::line_step(&pattern);
                Shape::new(step.x.min(window.x), window.y, window.z)
            }
            _ => window,
        }
    }

    fn advance_read(&mut self, kind: BufferKind) {
        let pattern = match (self.read_exhausted, self.pattern) {
            (false, Some(pattern)) => pattern,
            _ => return,
        };
        let v = self.virtual_shape;
        let t = pattern.tile;
        let index = &mut self.read_index;
        match kind {
            BufferKind::Fifo => {
                index.x += t.x;
                if index.x >= v.x {
                    index.x = 0;
                    index.y += t.y;
                    if index.y >= v.y {
                        index.y = 0;
                        index.z += t.z;
                        if index.z >= v.z {
                            self.read_exhausted = true;
                        }
                    }
                }
            }
            BufferKind::LineBuffer => {
                let step = Self::line_step(&pattern);
                index.x += step.x;
                if index.x + t.x > v.x {
                    index.x = 0;
                    index.y += step.y;
                    if index.y + t.y > v.y {
                        index.y = 0;
                        index.z += step.z;
                        if index.z + t.z > v.z {
                            self.read_exhausted = true;
                        }
                    }
                }
            }
        }
        if self.read_exhausted {
            self.read_index = Shape::new(0, 0, v.z);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Buffer {
    name: String,
    kind: BufferKind,
    reservations: BTreeMap<ReservationKey, Reservation>,
}

impl Buffer {
    pub fn new(name: &str, kind: BufferKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            reservations: BTreeMap::new(),
        }
    }

    pub fn into_ref(self) -> BufferRef {
        Rc::new(RefCell::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn reservation(&self, key: &ReservationKey) -> Option<&Reservation> {
        self.reservations.get(key)
    }

    fn lookup(&self, key: &ReservationKey) -> Result<&Reservation, Error> {
        self.reservations.get(key).ok_or_else(|| {
            log::error!("{}: no reservation {}", self.name, key);
            Error::BufferInconsistency(format!("{}: no reservation {}", self.name, key))
        })
    }

    /// Reserves a region for the output of `key.stage` produced by
    /// `key.producer`. `virtual_shape` is the padded shape seen by the
    /// consumer; sink outputs have no consumer and no read pattern.
    pub fn reserve(
        &mut self,
        key: ReservationKey,
        shape: Shape,
        virtual_shape: Option<Shape>,
        pattern: Option<ReadPattern>,
    ) -> Result<(), Error> {
        if self.reservations.contains_key(&key) {
            log::error!("{}: {} reserved twice", self.name, key);
            return Err(Error::BufferInconsistency(format!(
                "{}: {} reserved twice",
                self.name, key
            )));
        }
        let virtual_shape = virtual_shape.unwrap_or(shape);
        if shape.is_empty()
            || virtual_shape.x < shape.x
            || virtual_shape.y < shape.y
            || virtual_shape.z < shape.z
        {
            return Err(Error::InvalidShape(format!(
                "{}: reservation {} of {} with virtual shape {}",
                self.name, key, shape, virtual_shape
            )));
        }
        if let Some(pattern) = pattern {
            if pattern.tile.is_empty() {
                return Err(Error::InvalidShape(format!(
                    "{}: empty read tile for {}",
                    self.name, key
                )));
            }
        }
        log::debug!(
            "{}: reserve {} shape {} virtual {}",
            self.name,
            key,
            shape,
            virtual_shape
        );
        self.reservations
            .insert(key, Reservation::new(shape, virtual_shape, pattern));
        Ok(())
    }

    fn produced_by<'a>(
        &'a mut self,
        producer: &'a str,
        stage: &'a str,
    ) -> impl Iterator<Item = (&'a ReservationKey, &'a mut Reservation)> + 'a {
        self.reservations
            .iter_mut()
            .filter(move |(key, _)| key.producer == producer && key.stage == stage)
    }

    /// Writes one output tile of `stage` into every reservation it feeds.
    /// Returns the number of newly marked elements per reservation.
    pub fn write(&mut self, producer: &str, stage: &str, tile: Shape) -> Result<usize, Error> {
        let name = self.name.clone();
        let mut written = None;
        for (key, reservation) in self.produced_by(producer, stage) {
            if reservation.is_saturated() {
                log::error!("{}: write to saturated reservation {}", name, key);
                return Err(Error::BufferInconsistency(format!(
                    "{}: {} written past its shape",
                    name, key
                )));
            }
            let marked = reservation.write(tile);
            log::trace!(
                "{}: {} wrote {}, write index now {}",
                name,
                key,
                marked,
                reservation.write_index()
            );
            #[cfg(feature = "trace-buffer-markers")]
            log::trace!("{}: {} markers {:b}", name, key, reservation.markers);
            written = Some(marked);
        }
        written.ok_or_else(|| {
            log::error!("{}: {} has no reservation for {}", name, producer, stage);
            Error::BufferInconsistency(format!(
                "{}: {} has no reservation for {}",
                name, producer, stage
            ))
        })
    }

    /// Marks the whole output of `stage` as written.
    pub fn fill(&mut self, producer: &str, stage: &str) -> usize {
        let mut filled = 0;
        for (_, reservation) in self.produced_by(producer, stage) {
            reservation.fill();
            filled = reservation.shape().volume();
        }
        filled
    }

    /// The marker sum of the output of `stage`; every reservation fed by
    /// the same producer carries the same markers.
    pub fn marker_sum(&self, producer: &str, stage: &str) -> Option<usize> {
        self.reservations
            .iter()
            .filter(|(key, _)| key.producer == producer && key.stage == stage)
            .map(|(_, reservation)| reservation.marker_sum())
            .min()
    }

    pub fn is_saturated(&self, producer: &str, stage: &str) -> bool {
        self.reservations
            .iter()
            .filter(|(key, _)| key.producer == producer && key.stage == stage)
            .any(|(_, reservation)| reservation.is_saturated())
    }

    pub fn read_ready(&self, key: &ReservationKey) -> Result<bool, Error> {
        Ok(self.lookup(key)?.read_ready())
    }

    pub fn read_footprint(&self, key: &ReservationKey) -> Result<Shape, Error> {
        Ok(self.lookup(key)?.read_footprint(self.kind))
    }

    /// Moves the read window of `key` forward; returns the number of
    /// elements the read fetched.
    pub fn advance_read(&mut self, key: &ReservationKey) -> Result<usize, Error> {
        let kind = self.kind;
        let footprint = self.read_footprint(key)?;
        let name = self.name.clone();
        if let Some(reservation) = self.reservations.get_mut(key) {
            reservation.advance_read(kind);
            log::trace!(
                "{}: {} read {}, read index now {}",
                name,
                key,
                footprint,
                reservation.read_index()
            );
        }
        Ok(footprint.volume())
    }
}
