//! Network management commands and node states
//!
//! The NMT service is a flat lookup: every command moves a node to one fixed state, no matter
//! which state it was in. See [`NmtState::transition`].
use snafu::Snafu;

use crate::messages::{CanId, CanMessage, MessageError, HEARTBEAT_BASE, NMT_CMD_ID};

/// An NMT command
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    /// Move to Operational
    StartRemoteNode = 0x01,
    /// Move to Stopped
    StopRemoteNode = 0x02,
    /// Move to PreOperational
    EnterPreOperational = 0x80,
    /// Reset the application
    ResetNode = 0x81,
    /// Reset the communication parameters
    ResetCommunication = 0x82,
}

/// Returned when a raw command byte is not one of the known [`NmtCommand`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("Unknown NMT command {value:#04x}"))]
pub struct UnknownCommand {
    /// The rejected command byte
    pub value: u8,
}

impl TryFrom<u8> for NmtCommand {
    type Error = UnknownCommand;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(NmtCommand::StartRemoteNode),
            0x02 => Ok(NmtCommand::StopRemoteNode),
            0x80 => Ok(NmtCommand::EnterPreOperational),
            0x81 => Ok(NmtCommand::ResetNode),
            0x82 => Ok(NmtCommand::ResetCommunication),
            _ => UnknownCommandSnafu { value }.fail(),
        }
    }
}

/// The lifecycle state of a node
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NmtState {
    /// The node is booting or resetting
    #[default]
    Initializing = 0x00,
    /// SDO and NMT only
    Stopped = 0x04,
    /// All services active
    Operational = 0x05,
    /// SDO, NMT and heartbeat active
    PreOperational = 0x7F,
}

impl NmtState {
    /// The state a node moves to after receiving `cmd`
    pub fn transition(self, cmd: NmtCommand) -> NmtState {
        match cmd {
            NmtCommand::StartRemoteNode => NmtState::Operational,
            NmtCommand::StopRemoteNode => NmtState::Stopped,
            NmtCommand::EnterPreOperational => NmtState::PreOperational,
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => NmtState::Initializing,
        }
    }

    /// Apply a raw command byte to the state
    ///
    /// An unknown command leaves the state unchanged
    pub fn apply_raw(&mut self, cmd: u8) -> Result<NmtState, UnknownCommand> {
        let cmd = NmtCommand::try_from(cmd)?;
        *self = self.transition(cmd);
        Ok(*self)
    }

    /// Returns true if the node answers SDO requests in this state
    pub fn serves_sdo(&self) -> bool {
        matches!(self, NmtState::PreOperational | NmtState::Operational)
    }
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Initializing => write!(f, "Initializing"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

/// An NMT command frame, addressed to one node or to all nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtFrame {
    /// The command
    pub cmd: NmtCommand,
    /// Target node, or 0 to address all nodes
    pub node: u8,
}

impl NmtFrame {
    /// Returns true if the frame applies to `node_id`
    pub fn addresses(&self, node_id: u8) -> bool {
        self.node == 0 || self.node == node_id
    }
}

impl TryFrom<CanMessage> for NmtFrame {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cmd = NmtCommand::try_from(payload[0])
                .map_err(|e| MessageError::UnknownNmtCommand { value: e.value })?;
            Ok(NmtFrame {
                cmd,
                node: payload[1],
            })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtFrame> for CanMessage {
    fn from(frame: NmtFrame) -> Self {
        let mut msg = CanMessage {
            id: NMT_CMD_ID,
            dlc: 2,
            ..Default::default()
        };
        msg.data[0] = frame.cmd as u8;
        msg.data[1] = frame.node;
        msg
    }
}

/// Build the boot-up message a node sends when it enters PreOperational
pub fn boot_up(node_id: u8) -> CanMessage {
    CanMessage {
        id: CanId::Std(HEARTBEAT_BASE | node_id as u16),
        dlc: 1,
        ..Default::default()
    }
}
