//! Transfer event reporting
//!
//! The state machines report what they do through a [`TransferObserver`] handed to them at
//! construction. [`LogObserver`] forwards events to the logger.
use std::sync::{Arc, Mutex};

use defmt_or_log::{debug, info, warn};

use crate::objects::ObjectId;
use crate::sdo::{FrameError, Opcode, RawAbortCode};
use crate::transfer::{Direction, Role, TransferMode};

/// Something that happened in an SDO state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// A transfer was initiated
    Started {
        /// Role of the reporting machine
        role: Role,
        /// Data direction
        direction: Direction,
        /// Object being transferred
        id: ObjectId,
    },
    /// The transfer mode was settled
    ModeSelected {
        /// Role of the reporting machine
        role: Role,
        /// Selected mode
        mode: TransferMode,
    },
    /// A transfer completed successfully
    Completed {
        /// Role of the reporting machine
        role: Role,
        /// Object transferred
        id: ObjectId,
        /// Number of data bytes
        size: usize,
    },
    /// A transfer was aborted
    Aborted {
        /// Role of the reporting machine
        role: Role,
        /// Object being transferred
        id: ObjectId,
        /// Abort reason
        code: RawAbortCode,
        /// True if the peer sent the abort
        remote: bool,
    },
    /// An initiate was rejected because a transfer is already active
    Busy {
        /// Object addressed by the rejected request
        id: ObjectId,
    },
    /// A frame was sent again
    Retransmit {
        /// Role of the reporting machine
        role: Role,
        /// What was re-sent
        opcode: Opcode,
    },
    /// A frame could not be decoded and was dropped
    Malformed {
        /// Role of the reporting machine
        role: Role,
        /// Decode failure
        error: FrameError,
    },
    /// A valid frame did not belong to the active transfer and was dropped
    Ignored {
        /// Role of the reporting machine
        role: Role,
        /// The ignored operation
        opcode: Opcode,
    },
}

/// Receives [`TransferEvent`]s from a state machine
pub trait TransferObserver: Send {
    /// Called for every event
    fn on_event(&self, event: &TransferEvent);
}

/// Forwards events to the `log`/`defmt` logger
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl TransferObserver for LogObserver {
    fn on_event(&self, event: &TransferEvent) {
        match event {
            TransferEvent::Started {
                role,
                direction,
                id,
            } => debug!("{:?}: {:?} of {} started", role, direction, id),
            TransferEvent::ModeSelected { role, mode } => debug!("{:?}: {:?} mode", role, mode),
            TransferEvent::Completed { role, id, size } => {
                info!("{:?}: transfer of {} complete, {} bytes", role, id, size)
            }
            TransferEvent::Aborted {
                role,
                id,
                code,
                remote,
            } => {
                if *remote {
                    warn!("{:?}: peer aborted transfer of {}: {:?}", role, id, code)
                } else {
                    warn!("{:?}: aborting transfer of {}: {:?}", role, id, code)
                }
            }
            TransferEvent::Busy { id } => warn!("Rejecting transfer of {} while busy", id),
            TransferEvent::Retransmit { role, opcode } => {
                debug!("{:?}: retransmitting {}", role, opcode)
            }
            TransferEvent::Malformed { role, error } => {
                warn!("{:?}: dropping malformed frame: {}", role, error)
            }
            TransferEvent::Ignored { role, opcode } => {
                debug!("{:?}: ignoring unexpected {}", role, opcode)
            }
        }
    }
}

/// An observer which discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TransferObserver for NullObserver {
    fn on_event(&self, _event: &TransferEvent) {}
}

/// Keeps every event in memory
///
/// Clones share the same event list, so a test can hand one clone to a state machine and inspect
/// the other.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<TransferEvent>>>,
}

impl RecordingObserver {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the events recorded so far
    pub fn events(&self) -> Vec<TransferEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TransferObserver for RecordingObserver {
    fn on_event(&self, event: &TransferEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(*event),
            Err(poisoned) => poisoned.into_inner().push(*event),
        }
    }
}
