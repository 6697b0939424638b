//! Objects stored on a rank and addressed by id from other ranks.

use std::any::type_name;
use std::collections::BTreeMap;

use crate::construct::{Frame, Slot};
use crate::error::{Error, Result};

/// One stored object together with the frame holding its constructor arguments.
pub struct ObjectCell {
    frame: Frame,
    index: usize,
    type_name: &'static str,
}

impl ObjectCell {
    pub fn new<T: 'static>(frame: Frame, slot: Slot<T>) -> Self {
        Self {
            frame,
            index: slot.index(),
            type_name: type_name::<T>(),
        }
    }

    /// Store `value` in a frame of its own.
    pub fn from_value<T: 'static>(value: T) -> Result<Self> {
        let mut frame = Frame::new();
        let slot = frame.emplace(value)?;
        Ok(Self::new(frame, slot))
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn get<T: 'static>(&self) -> Result<&T> {
        let slot = self.frame.typed_slot::<T>(self.index)?;
        self.frame.get(slot)
    }

    pub fn get_mut<T: 'static>(&mut self) -> Result<&mut T> {
        let slot = self.frame.typed_slot::<T>(self.index)?;
        self.frame.get_mut(slot)
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

impl std::fmt::Debug for ObjectCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCell")
            .field("type_name", &self.type_name)
            .field("frame", &self.frame)
            .finish()
    }
}

/// Per-rank object table. Ids are never reused.
#[derive(Debug, Default)]
pub struct ObjectTable {
    next_id: u64,
    cells: BTreeMap<u64, ObjectCell>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn insert(&mut self, cell: ObjectCell) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.cells.insert(id, cell);
        id
    }

    fn missing(id: u64) -> Error {
        Error::UnregisteredObject {
            type_name: "unknown".to_string(),
            object_id: id,
        }
    }

    pub fn get(&self, id: u64) -> Result<&ObjectCell> {
        self.cells.get(&id).ok_or_else(|| Self::missing(id))
    }

    pub fn get_mut(&mut self, id: u64) -> Result<&mut ObjectCell> {
        self.cells.get_mut(&id).ok_or_else(|| Self::missing(id))
    }

    /// Remove and destroy an object, along with its constructor arguments.
    pub fn remove(&mut self, id: u64) -> Result<()> {
        self.cells
            .remove(&id)
            .map(drop)
            .ok_or_else(|| Self::missing(id))
    }
}
