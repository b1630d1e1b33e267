//! A library to serve a CANopen object dictionary over SDO
//!
//! cansdo-node implements the server side of the CANopen SDO protocol, along with the small amount
//! of NMT handling needed for a node to announce itself and be started or stopped. It provides the
//! following features:
//!
//! * An *SDO server* supporting expedited, segmented and block transfers in both directions,
//!   with retransmission handling and a transfer timeout.
//! * An [`ObjectDictionary`](object_dict::ObjectDictionary) trait, and a reference in-memory
//!   implementation, [`MemoryObjectDict`](object_dict::MemoryObjectDict).
//! * A [`Node`] which routes NMT commands and SDO requests, and sends the boot-up message.
//!
//! # Getting Started
//!
//! ## Object dictionary
//!
//! The application decides which objects exist, and with what access. See the
//! [object_dict] module docs for an example.
//!
//! ## Instantiating the [`Node`] object
//!
//! The node is created from a node ID, a [`NodeMbox`], and the object dictionary. The mailbox is
//! shared with whatever receives CAN frames, and so is usually created once for the life of the
//! program.
//!
//! ```rust
//! use cansdo_node::{Node, NodeMbox};
//! use cansdo_node::common::{objects::AccessType, NodeId};
//! use cansdo_node::object_dict::{MemoryObjectDict, ObjectEntry};
//!
//! let mbox = NodeMbox::default();
//! let od = MemoryObjectDict::builder()
//!     .entry(ObjectEntry::new(0x2000, 0, AccessType::Rw).value([0u8; 4]))
//!     .build();
//! let mut node = Node::new(NodeId::new(5).unwrap(), &mbox, &od);
//!
//! // The first call to process sends the boot-up message
//! let mut sent = Vec::new();
//! node.process(0, &mut |msg| sent.push(msg));
//! assert_eq!(1, sent.len());
//! ```
//!
//! ## Handling CAN messages
//!
//! The application has to handle sending and receiving CAN messages.
//!
//! Received messages should be passed to the [`NodeMbox`]. This can be done in any thread.
//!
//! ```ignore
//! let msg = cansdo_node::common::messages::CanMessage::try_new(id, &buffer[..len]).unwrap();
//! // Ignore error -- as an Err is returned for messages that are not consumed by the node
//! mbox.store_message(msg).ok();
//! ```
//!
//! To execute the Node logic, the [`Node::process`] function must be called periodically. It is
//! provided the current time and a callback for transmitting messages. The NodeMbox provides a
//! callback which can be used to notify another task that process should be called when a
//! message is received and requires processing.
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod node;
mod node_mbox;
pub mod object_dict;
pub mod sdo_server;

pub use cansdo_common as common;

pub use node::{Node, ObjectWrittenCallback};
pub use node_mbox::{NodeMbox, DEFAULT_SDO_QUEUE_DEPTH};
pub use sdo_server::{SdoServer, SdoServerConfig};
