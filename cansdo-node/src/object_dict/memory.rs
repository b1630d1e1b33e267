//! A heap backed object dictionary
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::common::objects::{AccessType, ObjectId};

use super::{ObjectDictionary, ReadError, WriteError};

/// Constraint on the length of values written to an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SizeRule {
    /// Any length is accepted
    #[default]
    Any,
    /// Values must have exactly this length, like a fixed size numeric object
    Exact(usize),
    /// Values may be up to this length, like a string object
    Max(usize),
}

impl SizeRule {
    fn check(&self, size: usize) -> Result<(), WriteError> {
        match *self {
            SizeRule::Any => Ok(()),
            SizeRule::Exact(n) if size < n => Err(WriteError::LengthLow),
            SizeRule::Exact(n) | SizeRule::Max(n) if size > n => Err(WriteError::LengthHigh),
            _ => Ok(()),
        }
    }
}

/// Application hook to accept or reject a value before it is stored
pub type Validator = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Definition of one sub object, used with [`MemoryObjectDictBuilder`]
#[allow(missing_debug_implementations)]
pub struct ObjectEntry {
    id: ObjectId,
    access: AccessType,
    size: SizeRule,
    value: Vec<u8>,
    validator: Option<Validator>,
}

impl ObjectEntry {
    /// Create an empty entry
    pub fn new(index: u16, sub: u8, access: AccessType) -> Self {
        Self {
            id: ObjectId::new(index, sub),
            access,
            size: SizeRule::Any,
            value: Vec::new(),
            validator: None,
        }
    }

    /// Set the initial value
    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    /// Set the length constraint for writes
    pub fn size(mut self, size: SizeRule) -> Self {
        self.size = size;
        self
    }

    /// Set a validator, run on every write after the length check
    pub fn validator(mut self, validator: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }
}

struct Slot {
    access: AccessType,
    size: SizeRule,
    validator: Option<Validator>,
    value: Mutex<Vec<u8>>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // Values are only ever replaced whole
        match self.value.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check(&self, size: Option<usize>) -> Result<(), WriteError> {
        if !self.access.is_writable() {
            return Err(WriteError::ReadOnly);
        }
        match size {
            Some(size) => self.size.check(size),
            None => Ok(()),
        }
    }
}

enum Missing {
    Index,
    Sub,
}

/// Builds a [`MemoryObjectDict`]
#[allow(missing_debug_implementations)]
#[derive(Default)]
pub struct MemoryObjectDictBuilder {
    entries: Vec<ObjectEntry>,
}

impl MemoryObjectDictBuilder {
    /// Add an entry. A later entry with the same address replaces an earlier one.
    pub fn entry(mut self, entry: ObjectEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Create the dictionary
    pub fn build(self) -> MemoryObjectDict {
        let entries = self
            .entries
            .into_iter()
            .map(|e| {
                (
                    e.id,
                    Slot {
                        access: e.access,
                        size: e.size,
                        validator: e.validator,
                        value: Mutex::new(e.value),
                    },
                )
            })
            .collect();
        MemoryObjectDict { entries }
    }
}

/// An [`ObjectDictionary`] which keeps every value on the heap
///
/// Each entry has its own lock, so a write to one object never waits on a read of another, and
/// a read never observes half of a write.
#[allow(missing_debug_implementations)]
pub struct MemoryObjectDict {
    entries: BTreeMap<ObjectId, Slot>,
}

impl MemoryObjectDict {
    /// Start building a dictionary
    pub fn builder() -> MemoryObjectDictBuilder {
        MemoryObjectDictBuilder::default()
    }

    fn slot(&self, index: u16, sub: u8) -> Result<&Slot, Missing> {
        let id = ObjectId::new(index, sub);
        match self.entries.get(&id) {
            Some(slot) => Ok(slot),
            None => {
                let index_exists = self
                    .entries
                    .range(ObjectId::new(index, 0)..=ObjectId::new(index, u8::MAX))
                    .next()
                    .is_some();
                if index_exists {
                    Err(Missing::Sub)
                } else {
                    Err(Missing::Index)
                }
            }
        }
    }

    /// Read a value regardless of its access type, as the application owning it would
    pub fn get(&self, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.slot(index, sub).ok().map(|slot| slot.lock().clone())
    }

    /// Replace a value regardless of its access type, as the application owning it would
    ///
    /// Returns false if the entry does not exist
    pub fn set(&self, index: u16, sub: u8, value: &[u8]) -> bool {
        match self.slot(index, sub) {
            Ok(slot) => {
                *slot.lock() = value.to_vec();
                true
            }
            Err(_) => false,
        }
    }

    /// The addresses of all entries, in ascending order
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.entries.keys().copied()
    }
}

impl ObjectDictionary for MemoryObjectDict {
    fn read(&self, index: u16, sub: u8) -> Result<Vec<u8>, ReadError> {
        let slot = self.slot(index, sub).map_err(|missing| match missing {
            Missing::Index => ReadError::NotFound,
            Missing::Sub => ReadError::SubNotFound,
        })?;
        if !slot.access.is_readable() {
            return Err(ReadError::WriteOnly);
        }
        let value = slot.lock().clone();
        Ok(value)
    }

    fn write(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), WriteError> {
        let slot = self.slot(index, sub).map_err(missing_for_write)?;
        slot.check(Some(data.len()))?;
        if let Some(validator) = &slot.validator {
            if !validator(data) {
                return Err(WriteError::ValidationFailed);
            }
        }
        *slot.lock() = data.to_vec();
        Ok(())
    }

    fn check_write(&self, index: u16, sub: u8, size: Option<usize>) -> Result<(), WriteError> {
        self.slot(index, sub).map_err(missing_for_write)?.check(size)
    }
}

fn missing_for_write(missing: Missing) -> WriteError {
    match missing {
        Missing::Index => WriteError::NotFound,
        Missing::Sub => WriteError::SubNotFound,
    }
}
