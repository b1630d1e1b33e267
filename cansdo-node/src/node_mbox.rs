//! Implements mailbox for receiving CAN messages
use crossbeam::{atomic::AtomicCell, queue::ArrayQueue};
use defmt_or_log::warn;

use crate::common::messages::{CanId, CanMessage, NMT_CMD_ID};

/// Number of SDO requests which can be held between calls to [`Node::process`](crate::Node::process)
///
/// During a block download the client sends a whole sub-block without waiting, so this is sized
/// for the largest sub-block plus the end frame.
pub const DEFAULT_SDO_QUEUE_DEPTH: usize = 128;

/// A data structure to be shared between a receiving thread (e.g. a CAN controller IRQ) and the
/// [`Node`](crate::Node) object.
///
/// Incoming messages should be passed to [NodeMbox::store_message].
#[allow(missing_debug_implementations)]
pub struct NodeMbox {
    sdo_cob_id: AtomicCell<Option<CanId>>,
    sdo_queue: ArrayQueue<CanMessage>,
    nmt_mbox: AtomicCell<Option<CanMessage>>,
    notify_cb: AtomicCell<Option<&'static (dyn Fn() + Sync)>>,
}

impl Default for NodeMbox {
    fn default() -> Self {
        Self::new(DEFAULT_SDO_QUEUE_DEPTH)
    }
}

impl NodeMbox {
    /// Create a new NodeMbox
    ///
    /// # Args
    ///
    /// - `sdo_queue_depth`: The number of SDO requests which can be buffered. Zero is treated as
    ///   one.
    pub fn new(sdo_queue_depth: usize) -> Self {
        let sdo_cob_id = AtomicCell::new(None);
        let sdo_queue = ArrayQueue::new(sdo_queue_depth.max(1));
        let nmt_mbox = AtomicCell::new(None);
        let notify_cb = AtomicCell::new(None);
        Self {
            sdo_cob_id,
            sdo_queue,
            nmt_mbox,
            notify_cb,
        }
    }

    /// Set a callback for notification when a message is received and requires processing.
    ///
    /// It must be static. Usually this will be a static fn, but in some circumstances, it may be
    /// desirable to use Box::leak to pass a heap allocated closure instead.
    pub fn set_process_notify_callback(&self, callback: &'static (dyn Fn() + Sync)) {
        self.notify_cb.store(Some(callback));
    }

    fn notify(&self) {
        if let Some(notify_cb) = self.notify_cb.load() {
            notify_cb();
        }
    }

    pub(crate) fn set_sdo_cob_id(&self, cob_id: Option<CanId>) {
        self.sdo_cob_id.store(cob_id);
    }

    pub(crate) fn read_sdo_mbox(&self) -> Option<CanMessage> {
        self.sdo_queue.pop()
    }

    pub(crate) fn read_nmt_mbox(&self) -> Option<CanMessage> {
        self.nmt_mbox.take()
    }

    /// Store a received CAN message
    ///
    /// Returns the message in an Err if it is not one the node handles.
    pub fn store_message(&self, msg: CanMessage) -> Result<(), CanMessage> {
        let id = msg.id();
        if id == NMT_CMD_ID {
            self.nmt_mbox.store(Some(msg));
            self.notify();
            return Ok(());
        }

        if let Some(cob_id) = self.sdo_cob_id.load() {
            if id == cob_id {
                if self.sdo_queue.push(msg).is_err() {
                    warn!("SDO queue full, dropping request");
                }
                self.notify();
                return Ok(());
            }
        }

        Err(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_message() {
        let mbox = NodeMbox::new(2);
        let sdo = CanMessage::new(CanId::std(0x605), [0x40, 0, 0x10, 0, 0, 0, 0, 0]);

        // No SDO address assigned yet
        assert_eq!(Err(sdo), mbox.store_message(sdo));
        mbox.set_sdo_cob_id(Some(CanId::std(0x605)));
        assert_eq!(Ok(()), mbox.store_message(sdo));
        assert_eq!(Ok(()), mbox.store_message(sdo));
        // Full queue drops the request but still consumes it
        assert_eq!(Ok(()), mbox.store_message(sdo));
        assert_eq!(Some(sdo), mbox.read_sdo_mbox());
        assert_eq!(Some(sdo), mbox.read_sdo_mbox());
        assert_eq!(None, mbox.read_sdo_mbox());

        let other = CanMessage::new(CanId::std(0x181), [0; 8]);
        assert_eq!(Err(other), mbox.store_message(other));

        let nmt = CanMessage::try_new(NMT_CMD_ID, &[1, 0]).unwrap();
        assert_eq!(Ok(()), mbox.store_message(nmt));
        assert_eq!(Some(nmt), mbox.read_nmt_mbox());
        assert_eq!(None, mbox.read_nmt_mbox());
    }
}
