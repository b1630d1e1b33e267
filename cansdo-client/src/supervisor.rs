//! Bounded retries around SDO exchanges
//!
//! The [`Supervisor`] moves frames between a [`ClientMachine`] and the bus. It waits a limited
//! time for each response, and when none arrives it asks the machine to re-send its last frame.
use std::time::Duration;

use snafu::Snafu;
use tokio::time::{timeout_at, Instant};

use crate::client_machine::{ClientMachine, TransferStatus};
use crate::common::{
    messages::{CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender},
};
use crate::config::SdoClientConfig;

/// How many times a frame is sent, and how long to wait after each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of attempts per exchange, including the first
    pub attempts: u32,
    /// Time to wait for a response after each attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&SdoClientConfig::default())
    }
}

impl From<&SdoClientConfig> for RetryPolicy {
    fn from(config: &SdoClientConfig) -> Self {
        Self {
            attempts: config.retries.max(1),
            timeout: config.timeout(),
        }
    }
}

/// Why an exchange ended without the machine finishing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum ExchangeError {
    /// Every attempt timed out
    #[snafu(display("No response after {attempts} attempts"))]
    Timeout {
        /// The number of attempts made
        attempts: u32,
    },
    /// The caller's deadline passed
    #[snafu(display("Deadline expired"))]
    Deadline,
    /// A frame could not be sent
    #[snafu(display("Failed to send a CAN message"))]
    Transport,
}

/// Drives a [`ClientMachine`] over a bus
#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    policy: RetryPolicy,
    request_id: CanId,
    response_id: CanId,
}

impl Supervisor {
    /// Create a supervisor exchanging frames on the given COB-IDs
    pub fn new(policy: RetryPolicy, request_id: CanId, response_id: CanId) -> Self {
        Self {
            policy,
            request_id,
            response_id,
        }
    }

    /// The policy in use
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send frames to the server on the request COB-ID
    pub async fn send_frames<S: AsyncCanSender>(
        &self,
        sender: &mut S,
        frames: &mut Vec<[u8; 8]>,
    ) -> Result<(), ExchangeError> {
        for frame in frames.drain(..) {
            sender
                .send(CanMessage::new(self.request_id, frame))
                .await
                .map_err(|_| ExchangeError::Transport)?;
        }
        Ok(())
    }

    /// Run a transfer to its end
    ///
    /// `pending` holds the frames the machine produced when the transfer was requested. Returns
    /// the final status of the machine, which is never `InProgress`. On error the machine is left
    /// as it was, and it is up to the caller to abort it.
    ///
    /// The attempt budget covers the whole transfer. A frame which fails to send counts as a
    /// missed response, and each response timeout is restarted only by a frame which advances
    /// the transfer.
    pub async fn exchange<S: AsyncCanSender, R: AsyncCanReceiver>(
        &self,
        machine: &mut ClientMachine,
        mut pending: Vec<[u8; 8]>,
        sender: &mut S,
        receiver: &mut R,
        deadline: Option<Instant>,
    ) -> Result<TransferStatus, ExchangeError> {
        let mut attempt = 1;
        let mut send_failed = !self.try_send(sender, &mut pending).await;
        let mut wait_until = self.wait_until(deadline);

        loop {
            match timeout_at(wait_until, receiver.recv()).await {
                Ok(Ok(msg)) => {
                    if msg.id() != self.response_id {
                        continue;
                    }
                    let progress = machine.progress();
                    let status = machine.handle_frame(msg.data(), &mut |f| pending.push(f));
                    let advanced = machine.progress() != progress;
                    if advanced || !pending.is_empty() {
                        send_failed = !self.try_send(sender, &mut pending).await;
                    }
                    match status {
                        TransferStatus::InProgress => {
                            if advanced {
                                wait_until = self.wait_until(deadline);
                            }
                            continue;
                        }
                        status => return Ok(status),
                    }
                }
                // A broken receiver counts as a missed response
                Ok(Err(e)) => log::error!("Error reading CAN receiver: {e:?}"),
                Err(_) => (),
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return DeadlineSnafu.fail();
            }
            if attempt >= self.policy.attempts {
                if send_failed {
                    return TransportSnafu.fail();
                }
                return TimeoutSnafu { attempts: attempt }.fail();
            }
            attempt += 1;
            log::debug!("SDO response timeout, attempt {attempt}");
            machine.retransmit(&mut |f| pending.push(f));
            send_failed = !self.try_send(sender, &mut pending).await;
            wait_until = self.wait_until(deadline);
        }
    }

    /// Send frames, reporting a failure as a missed attempt
    async fn try_send<S: AsyncCanSender>(&self, sender: &mut S, frames: &mut Vec<[u8; 8]>) -> bool {
        match self.send_frames(sender, frames).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{e}, will retry");
                false
            }
        }
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Instant {
        let wait_until = Instant::now() + self.policy.timeout;
        match deadline {
            Some(deadline) => wait_until.min(deadline),
            None => wait_until,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures::{
        channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        StreamExt,
    };

    use super::*;
    use crate::common::{
        messages::{sdo_request_id, sdo_response_id},
        sdo::{SdoRequest, SdoResponse},
        traits::CanSendError,
    };

    const NODE: u8 = 5;

    /// Fails the first `failures` sends, and answers the rest through `respond`
    struct TestSender {
        failures: usize,
        sent: Vec<SdoRequest>,
        respond: fn(SdoRequest) -> Option<SdoResponse>,
        tx: UnboundedSender<CanMessage>,
    }

    impl AsyncCanSender for TestSender {
        async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(CanSendError(msg));
            }
            let req = SdoRequest::try_from(msg.data()).unwrap();
            self.sent.push(req);
            if let Some(resp) = (self.respond)(req) {
                self.tx
                    .unbounded_send(CanMessage::new(sdo_response_id(NODE), resp.to_bytes()))
                    .unwrap();
            }
            Ok(())
        }
    }

    struct TestReceiver(UnboundedReceiver<CanMessage>);

    impl AsyncCanReceiver for TestReceiver {
        type Error = Infallible;

        fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error> {
            Ok(self.0.try_next().ok().flatten())
        }

        async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
            match self.0.next().await {
                Some(msg) => Ok(msg),
                None => std::future::pending().await,
            }
        }
    }

    fn link(
        failures: usize,
        respond: fn(SdoRequest) -> Option<SdoResponse>,
    ) -> (TestSender, TestReceiver, UnboundedSender<CanMessage>) {
        let (tx, rx) = unbounded();
        let sender = TestSender {
            failures,
            sent: Vec::new(),
            respond,
            tx: tx.clone(),
        };
        (sender, TestReceiver(rx), tx)
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(
            RetryPolicy::default(),
            sdo_request_id(NODE),
            sdo_response_id(NODE),
        )
    }

    fn acknowledge_download(req: SdoRequest) -> Option<SdoResponse> {
        match req {
            SdoRequest::InitiateDownload { index, sub, .. } => {
                Some(SdoResponse::download_acknowledge(index, sub))
            }
            _ => None,
        }
    }

    fn start_download(machine: &mut ClientMachine) -> Vec<[u8; 8]> {
        let mut pending = Vec::new();
        machine
            .request_download(0x2000, 0, &[1, 2, 3], &mut |f| pending.push(f))
            .unwrap();
        pending
    }

    #[test]
    fn test_policy_from_config() {
        let config = SdoClientConfig {
            retries: 5,
            timeout_ms: 200,
            ..Default::default()
        };
        assert_eq!(
            RetryPolicy {
                attempts: 5,
                timeout: Duration::from_millis(200)
            },
            RetryPolicy::from(&config)
        );
        assert_eq!(3, RetryPolicy::default().attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_is_retried() {
        let (mut sender, mut receiver, _tx) = link(1, acknowledge_download);
        let mut machine = ClientMachine::new(SdoClientConfig::default());
        let pending = start_download(&mut machine);

        let status = supervisor()
            .exchange(&mut machine, pending, &mut sender, &mut receiver, None)
            .await;
        assert_eq!(Ok(TransferStatus::Complete(vec![])), status);
        assert_eq!(
            vec![SdoRequest::expedited_download(0x2000, 0, &[1, 2, 3]).unwrap()],
            sender.sent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_exhausts_attempts() {
        let (mut sender, mut receiver, _tx) = link(usize::MAX, acknowledge_download);
        let mut machine = ClientMachine::new(SdoClientConfig::default());
        let pending = start_download(&mut machine);

        let status = supervisor()
            .exchange(&mut machine, pending, &mut sender, &mut receiver, None)
            .await;
        assert_eq!(Err(ExchangeError::Transport), status);
        assert!(sender.sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_responses_do_not_extend_transfer() {
        let (mut sender, mut receiver, tx) = link(0, |_| None);
        let mut machine = ClientMachine::new(SdoClientConfig::default());
        let mut pending = Vec::new();
        machine
            .request_upload(0x2000, 0, &mut |f| pending.push(f))
            .unwrap();

        // The server keeps repeating its initiate response and never sends a segment
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let resp = SdoResponse::upload_acknowledge(0x2000, 0, 20);
                let msg = CanMessage::new(sdo_response_id(NODE), resp.to_bytes());
                if tx.unbounded_send(msg).is_err() {
                    break;
                }
            }
        });

        let start = Instant::now();
        let status = supervisor()
            .exchange(&mut machine, pending, &mut sender, &mut receiver, None)
            .await;
        assert_eq!(Err(ExchangeError::Timeout { attempts: 3 }), status);
        assert!(Instant::now() - start < Duration::from_millis(200));
        // Initiate, first segment request, and two retransmissions of it
        assert_eq!(
            vec![
                SdoRequest::initiate_upload(0x2000, 0),
                SdoRequest::upload_segment_request(false),
                SdoRequest::upload_segment_request(false),
                SdoRequest::upload_segment_request(false),
            ],
            sender.sent
        );
    }
}
