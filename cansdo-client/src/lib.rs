//! A client for accessing the object dictionary of CANopen nodes over SDO
//!
//! The crate provides:
//!
//! - An [SDO client](SdoClient) for reading/writing a node's object dictionary via its SDO server,
//!   using expedited, segmented or block transfers
//! - The [ClientMachine] behind it, which holds no I/O and can be driven by hand
//! - A [Supervisor] bounding every exchange with a response timeout and retries
//! - An [SdoClientConfig] which can be loaded from a TOML file
//! - An [NMT master](NmtMaster) for starting, stopping and resetting nodes
//!
//! The client is based on tokio/async.
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client_machine;
mod config;
pub mod nmt_master;
mod sdo_client;
pub mod supervisor;
pub use cansdo_common as common;

pub use client_machine::{ClientAbort, ClientMachine, TransferHandle, TransferStatus};
pub use common::sdo::{AbortCode, RawAbortCode};
pub use config::{ConfigError, SdoClientConfig};
pub use nmt_master::NmtMaster;
pub use sdo_client::{SdoClient, SdoClientError};
pub use supervisor::{RetryPolicy, Supervisor};
