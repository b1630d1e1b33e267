//! Object Dictionary
//!
//! The object dictionary is the store an SDO server reads from and writes to. Objects are
//! addressed by a 16-bit index and an 8-bit sub index, and hold opaque byte values; interpreting
//! them is left to the application.
//!
//! The server only ever touches the dictionary through the [`ObjectDictionary`] trait:
//!
//! - An upload reads the value once, when the transfer is initiated. Later segments are served from
//!   that snapshot, so a value which changes mid-transfer can never be torn.
//! - A download buffers every byte and calls [`ObjectDictionary::write`] once, after the last
//!   segment has arrived. A transfer which aborts never touches the dictionary.
//!
//! Implementations must tolerate concurrent calls: a node which is also an SDO client may share
//! its dictionary between the two roles. [`MemoryObjectDict`] does this with one lock per entry.
//!
//! ## Example
//!
//! ```rust
//! use cansdo_node::object_dict::{MemoryObjectDict, ObjectDictionary, ObjectEntry, SizeRule};
//! use cansdo_node::common::objects::AccessType;
//!
//! let od = MemoryObjectDict::builder()
//!     .entry(ObjectEntry::new(0x1018, 1, AccessType::Const).value(0x1234u32.to_le_bytes()))
//!     .entry(
//!         ObjectEntry::new(0x2000, 0, AccessType::Rw)
//!             .value([0u8; 2])
//!             .size(SizeRule::Exact(2)),
//!     )
//!     .build();
//!
//! assert_eq!(vec![0x34, 0x12, 0, 0], od.read(0x1018, 1).unwrap());
//! od.write(0x2000, 0, &[1, 2]).unwrap();
//! assert!(od.write(0x2000, 0, &[1, 2, 3]).is_err());
//! ```
use snafu::Snafu;

use crate::common::sdo::AbortCode;

mod memory;
pub use memory::{MemoryObjectDict, MemoryObjectDictBuilder, ObjectEntry, SizeRule, Validator};

/// Errors returned when reading an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(module)]
pub enum ReadError {
    /// There is no object at this index
    #[snafu(display("Object does not exist"))]
    NotFound,
    /// The object exists, but not the sub index
    #[snafu(display("Sub index does not exist"))]
    SubNotFound,
    /// The object cannot be read
    #[snafu(display("Object is write only"))]
    WriteOnly,
}

/// Errors returned when writing an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(module)]
pub enum WriteError {
    /// There is no object at this index
    #[snafu(display("Object does not exist"))]
    NotFound,
    /// The object exists, but not the sub index
    #[snafu(display("Sub index does not exist"))]
    SubNotFound,
    /// The object cannot be written
    #[snafu(display("Object is read only"))]
    ReadOnly,
    /// The value was rejected by the object
    #[snafu(display("Value rejected"))]
    ValidationFailed,
    /// The value is longer than the object allows
    #[snafu(display("Value too long"))]
    LengthHigh,
    /// The value is shorter than the object requires
    #[snafu(display("Value too short"))]
    LengthLow,
}

impl From<ReadError> for AbortCode {
    fn from(value: ReadError) -> Self {
        match value {
            ReadError::NotFound => AbortCode::NoSuchObject,
            ReadError::SubNotFound => AbortCode::NoSuchSubIndex,
            ReadError::WriteOnly => AbortCode::WriteOnly,
        }
    }
}

impl From<WriteError> for AbortCode {
    fn from(value: WriteError) -> Self {
        match value {
            WriteError::NotFound => AbortCode::NoSuchObject,
            WriteError::SubNotFound => AbortCode::NoSuchSubIndex,
            WriteError::ReadOnly => AbortCode::ReadOnly,
            WriteError::ValidationFailed => AbortCode::InvalidValue,
            WriteError::LengthHigh => AbortCode::DataTypeMismatchLengthHigh,
            WriteError::LengthLow => AbortCode::DataTypeMismatchLengthLow,
        }
    }
}

/// Access to the objects served by an SDO server
pub trait ObjectDictionary: Sync + Send {
    /// Read the whole value of a sub object
    fn read(&self, index: u16, sub: u8) -> Result<Vec<u8>, ReadError>;

    /// Replace the value of a sub object
    ///
    /// Either the whole value is stored or, on error, the previous value is left untouched.
    fn write(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), WriteError>;

    /// Check whether a write of `size` bytes could succeed, before any data is transferred
    ///
    /// `size` is None when the client did not announce it.
    fn check_write(&self, index: u16, sub: u8, size: Option<usize>) -> Result<(), WriteError>;
}

impl<T: ObjectDictionary + ?Sized> ObjectDictionary for &T {
    fn read(&self, index: u16, sub: u8) -> Result<Vec<u8>, ReadError> {
        (**self).read(index, sub)
    }

    fn write(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), WriteError> {
        (**self).write(index, sub, data)
    }

    fn check_write(&self, index: u16, sub: u8, size: Option<usize>) -> Result<(), WriteError> {
        (**self).check_write(index, sub, size)
    }
}

impl<T: ObjectDictionary + ?Sized> ObjectDictionary for std::sync::Arc<T> {
    fn read(&self, index: u16, sub: u8) -> Result<Vec<u8>, ReadError> {
        (**self).read(index, sub)
    }

    fn write(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), WriteError> {
        (**self).write(index, sub, data)
    }

    fn check_write(&self, index: u16, sub: u8, size: Option<usize>) -> Result<(), WriteError> {
        (**self).check_write(index, sub, size)
    }
}
