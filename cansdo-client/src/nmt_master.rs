//! Sending NMT commands to nodes on the bus
use snafu::Snafu;

use crate::common::{
    nmt::{NmtCommand, NmtFrame},
    traits::AsyncCanSender,
};

/// Error returned by [`NmtMaster`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum NmtError {
    /// The command could not be sent
    #[snafu(display("Failed to send NMT command {cmd:?} to node {node}"))]
    Transport {
        /// The command being sent
        cmd: NmtCommand,
        /// The addressed node
        node: u8,
    },
}

type Result<T> = std::result::Result<T, NmtError>;

/// Sends NMT commands
///
/// Every command takes a node ID, or 0 to address all nodes.
#[derive(Debug)]
pub struct NmtMaster<S> {
    sender: S,
}

impl<S: AsyncCanSender> NmtMaster<S> {
    /// Create a new NMT master using the given sender
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    /// Send start operation command
    pub async fn nmt_start(&mut self, node: u8) -> Result<()> {
        self.send_nmt_cmd(NmtCommand::StartRemoteNode, node).await
    }

    /// Send stop operation command
    pub async fn nmt_stop(&mut self, node: u8) -> Result<()> {
        self.send_nmt_cmd(NmtCommand::StopRemoteNode, node).await
    }

    /// Send enter pre-operational command
    pub async fn nmt_enter_preop(&mut self, node: u8) -> Result<()> {
        self.send_nmt_cmd(NmtCommand::EnterPreOperational, node).await
    }

    /// Send application reset command
    pub async fn nmt_reset_node(&mut self, node: u8) -> Result<()> {
        self.send_nmt_cmd(NmtCommand::ResetNode, node).await
    }

    /// Send communications reset command
    pub async fn nmt_reset_comms(&mut self, node: u8) -> Result<()> {
        self.send_nmt_cmd(NmtCommand::ResetCommunication, node).await
    }

    async fn send_nmt_cmd(&mut self, cmd: NmtCommand, node: u8) -> Result<()> {
        log::info!("Sending NMT {cmd:?} to node {node}");
        let frame = NmtFrame { cmd, node };
        self.sender
            .send(frame.into())
            .await
            .map_err(|_| NmtError::Transport { cmd, node })
    }
}
