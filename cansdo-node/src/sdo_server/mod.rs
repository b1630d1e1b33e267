//! SDO server
mod sdo_server;

pub use sdo_server::{SdoServer, SdoServerConfig};
