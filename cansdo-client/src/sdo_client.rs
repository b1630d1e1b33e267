use snafu::Snafu;
use tokio::time::Instant;

use crate::client_machine::{ClientAbort, ClientMachine, MachineError, TransferStatus};
use crate::common::{
    messages::{sdo_request_id, sdo_response_id},
    sdo::{AbortCode, RawAbortCode},
    traits::{AsyncCanReceiver, AsyncCanSender},
};
use crate::config::{ConfigError, SdoClientConfig};
use crate::supervisor::{ExchangeError, RetryPolicy, Supervisor};

/// Error returned by [`SdoClient`] methods
#[derive(Clone, Copy, Debug, PartialEq, Snafu)]
pub enum SdoClientError {
    /// A transfer is already in progress
    #[snafu(display("A transfer is already in progress"))]
    Busy,
    /// Timeout while awaiting an expected response
    #[snafu(display("No response from the server"))]
    NoResponse,
    /// Received an abort response from the node
    #[snafu(display("Received abort accessing object 0x{index:X}sub{sub}: {abort_code:?}"))]
    ServerAbort {
        /// Index of the SDO access
        index: u16,
        /// Sub index of the SDO access
        sub: u8,
        /// Reason for the abort
        abort_code: RawAbortCode,
    },
    /// The amount of data received disagrees with the announced or requested size
    #[snafu(display("Transferred size does not match"))]
    SizeMismatch,
    /// The server sent a response which does not fit the transfer
    #[snafu(display("Unexpected response from the server"))]
    ProtocolViolation,
    /// The CRC of a block upload did not match the data
    #[snafu(display("Block transfer CRC mismatch"))]
    CrcMismatch,
    /// The caller's deadline expired before the transfer finished
    #[snafu(display("Transfer cancelled"))]
    Cancelled,
    /// A message could not be sent
    #[snafu(display("Failed to send CAN message"))]
    TransportError,
    /// The client configuration is not valid
    #[snafu(display("Invalid configuration for {field}: {reason}"))]
    InvalidConfig {
        /// The offending field
        field: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

impl From<MachineError> for SdoClientError {
    fn from(value: MachineError) -> Self {
        match value {
            MachineError::Busy => SdoClientError::Busy,
            MachineError::TooLarge { .. } => SdoClientError::SizeMismatch,
        }
    }
}

impl From<ClientAbort> for SdoClientError {
    fn from(value: ClientAbort) -> Self {
        match value {
            ClientAbort::Server { index, sub, code } => SdoClientError::ServerAbort {
                index,
                sub,
                abort_code: code,
            },
            ClientAbort::Local {
                code: AbortCode::CrcError,
            } => SdoClientError::CrcMismatch,
            ClientAbort::Local {
                code: AbortCode::DataTypeMismatch,
            } => SdoClientError::SizeMismatch,
            ClientAbort::Local { .. } => SdoClientError::ProtocolViolation,
        }
    }
}

impl From<ConfigError> for SdoClientError {
    fn from(value: ConfigError) -> Self {
        match value {
            ConfigError::InvalidValue { field, reason } => {
                SdoClientError::InvalidConfig { field, reason }
            }
            _ => SdoClientError::InvalidConfig {
                field: "config",
                reason: "could not be loaded",
            },
        }
    }
}

type Result<T> = std::result::Result<T, SdoClientError>;

/// A client for accessing a node's SDO server
///
/// A single server is accessed via a single SDO client, and only one transfer runs at a time.
/// Every exchange is bounded by the [`RetryPolicy`] built from the [`SdoClientConfig`].
#[derive(Debug)]
pub struct SdoClient<S, R> {
    sender: S,
    receiver: R,
    machine: ClientMachine,
    supervisor: Supervisor,
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> SdoClient<S, R> {
    /// Create a new SdoClient using a node ID
    ///
    /// Nodes have a default SDO server, which uses a COB ID based on the node ID. This is a
    /// shortcut to create a client that that default SDO server.
    ///
    /// It is possible for nodes to have other SDO servers on other COB IDs, but this is not
    /// supported.
    pub fn new_std(server_node_id: u8, sender: S, receiver: R) -> Self {
        Self::build(server_node_id, sender, receiver, SdoClientConfig::default())
    }

    /// Create a new SdoClient with the given configuration
    pub fn with_config(
        server_node_id: u8,
        sender: S,
        receiver: R,
        config: SdoClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(server_node_id, sender, receiver, config))
    }

    fn build(server_node_id: u8, sender: S, receiver: R, config: SdoClientConfig) -> Self {
        let supervisor = Supervisor::new(
            RetryPolicy::from(&config),
            sdo_request_id(server_node_id),
            sdo_response_id(server_node_id),
        );
        Self {
            sender,
            receiver,
            machine: ClientMachine::new(config),
            supervisor,
        }
    }

    /// The configuration in use
    pub fn config(&self) -> &SdoClientConfig {
        self.machine.config()
    }

    /// Write data to a sub-object on the SDO server
    ///
    /// Values of up to 4 bytes are written with an expedited transfer. Larger values use a block
    /// transfer if the config prefers them, or a segmented transfer otherwise.
    pub async fn download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        self.run_download(index, sub, data, false, None).await
    }

    /// Write data to a sub-object, giving up at `deadline`
    ///
    /// If the deadline passes the transfer is aborted, and [`SdoClientError::Cancelled`] is
    /// returned.
    pub async fn download_until(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        deadline: Instant,
    ) -> Result<()> {
        self.run_download(index, sub, data, false, Some(deadline))
            .await
    }

    /// Write data to a sub-object using a block transfer
    pub async fn block_download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        self.run_download(index, sub, data, true, None).await
    }

    /// Read a sub-object on the SDO server
    pub async fn upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.run_upload(index, sub, false, None).await
    }

    /// Read a sub-object, giving up at `deadline`
    pub async fn upload_until(&mut self, index: u16, sub: u8, deadline: Instant) -> Result<Vec<u8>> {
        self.run_upload(index, sub, false, Some(deadline)).await
    }

    /// Read a sub-object using a block transfer
    ///
    /// The server may still answer with an expedited or segmented upload when the value is below
    /// the configured protocol switch threshold.
    pub async fn block_upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.run_upload(index, sub, true, None).await
    }

    /// Write a u8 value to a sub-object
    pub async fn download_u8(&mut self, index: u16, sub: u8, value: u8) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Write a u16 value to a sub-object
    pub async fn download_u16(&mut self, index: u16, sub: u8, value: u16) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Write a u32 value to a sub-object
    pub async fn download_u32(&mut self, index: u16, sub: u8, value: u32) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Read a sub-object which holds a u8
    pub async fn upload_u8(&mut self, index: u16, sub: u8) -> Result<u8> {
        let data = self.upload(index, sub).await?;
        let bytes: [u8; 1] = data.try_into().map_err(|_| SdoClientError::SizeMismatch)?;
        Ok(u8::from_le_bytes(bytes))
    }

    /// Read a sub-object which holds a u16
    pub async fn upload_u16(&mut self, index: u16, sub: u8) -> Result<u16> {
        let data = self.upload(index, sub).await?;
        let bytes: [u8; 2] = data.try_into().map_err(|_| SdoClientError::SizeMismatch)?;
        Ok(u16::from_le_bytes(bytes))
    }

    /// Read a sub-object which holds a u32
    pub async fn upload_u32(&mut self, index: u16, sub: u8) -> Result<u32> {
        let data = self.upload(index, sub).await?;
        let bytes: [u8; 4] = data.try_into().map_err(|_| SdoClientError::SizeMismatch)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Abort any transfer left active and discard pending received messages
    pub async fn reset(&mut self) -> Result<()> {
        let mut frames = Vec::new();
        self.machine
            .abort(AbortCode::GeneralError, &mut |f| frames.push(f));
        self.supervisor
            .send_frames(&mut self.sender, &mut frames)
            .await
            .map_err(|_| SdoClientError::TransportError)?;
        self.receiver.flush().map_err(|e| {
            log::error!("Error flushing CAN receiver: {e:?}");
            SdoClientError::TransportError
        })
    }

    async fn run_download(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        block: bool,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let mut frames = Vec::new();
        if block {
            self.machine
                .request_block_download(index, sub, data, &mut |f| frames.push(f))?;
        } else {
            self.machine
                .request_download(index, sub, data, &mut |f| frames.push(f))?;
        }
        self.run(frames, deadline).await.map(|_| ())
    }

    async fn run_upload(
        &mut self,
        index: u16,
        sub: u8,
        block: bool,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>> {
        let mut frames = Vec::new();
        if block {
            self.machine
                .request_block_upload(index, sub, &mut |f| frames.push(f))?;
        } else {
            self.machine
                .request_upload(index, sub, &mut |f| frames.push(f))?;
        }
        self.run(frames, deadline).await
    }

    async fn run(&mut self, frames: Vec<[u8; 8]>, deadline: Option<Instant>) -> Result<Vec<u8>> {
        let result = self
            .supervisor
            .exchange(
                &mut self.machine,
                frames,
                &mut self.sender,
                &mut self.receiver,
                deadline,
            )
            .await;

        let (code, error) = match result {
            Ok(TransferStatus::Complete(data)) => return Ok(data),
            Ok(TransferStatus::Aborted(abort)) => return Err(abort.into()),
            Ok(TransferStatus::Idle) | Ok(TransferStatus::InProgress) => {
                (AbortCode::GeneralError, SdoClientError::ProtocolViolation)
            }
            Err(ExchangeError::Timeout { attempts }) => {
                log::warn!("SDO server did not respond after {attempts} attempts");
                (AbortCode::SdoTimeout, SdoClientError::NoResponse)
            }
            Err(ExchangeError::Deadline) => (AbortCode::GeneralError, SdoClientError::Cancelled),
            Err(ExchangeError::Transport) => {
                (AbortCode::GeneralError, SdoClientError::TransportError)
            }
        };

        // Tell the server the transfer is over, so it does not wait for its own timeout
        let mut frames = Vec::new();
        self.machine.abort(code, &mut |f| frames.push(f));
        if let Err(e) = self
            .supervisor
            .send_frames(&mut self.sender, &mut frames)
            .await
        {
            log::warn!("Failed to send SDO abort: {e}");
        }
        Err(error)
    }
}
