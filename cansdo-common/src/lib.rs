//! Common functionality shared among other cansdo crates.
//!
//! This crate holds everything about the SDO protocol that does not depend on which side of the
//! transfer is being run: the frame codec, the segmented and block transfer algorithms, and the
//! transfer context both state machines are built on. It also defines the transport traits and
//! the NMT command table.
//!
//! Most users will have no reason to depend on this crate directly, as it is re-exported by both
//! `cansdo-node` and `cansdo-client`.
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod block;
pub mod messages;
pub mod nmt;
pub mod node_id;
pub mod objects;
pub mod observer;
pub mod sdo;
pub mod segmented;
pub mod traits;
pub mod transfer;

pub use node_id::NodeId;

pub use messages::{CanId, CanMessage};
