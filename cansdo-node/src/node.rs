//! Implements the core Node object
use defmt_or_log::{debug, info, warn};

use crate::common::{
    messages::{sdo_request_id, sdo_response_id, CanMessage},
    nmt::{boot_up, NmtFrame, NmtState},
    objects::ObjectId,
    NodeId,
};
use crate::node_mbox::NodeMbox;
use crate::object_dict::ObjectDictionary;
use crate::sdo_server::{SdoServer, SdoServerConfig};

/// Callback invoked after a download has been committed to the object dictionary
pub type ObjectWrittenCallback<'a> = dyn FnMut(ObjectId) + Send + 'a;

/// The main object representing a node
///
/// The node ties an [`SdoServer`] to the NMT state machine. Messages are received through the
/// [`NodeMbox`], and are acted on when [`Node::process`] is called.
#[allow(missing_debug_implementations)]
pub struct Node<'a> {
    node_id: NodeId,
    nmt_state: NmtState,
    sdo_server: SdoServer,
    message_count: u32,
    od: &'a dyn ObjectDictionary,
    mbox: &'a NodeMbox,
    last_process_time_us: Option<u64>,
    write_callback: Option<Box<ObjectWrittenCallback<'a>>>,
}

impl<'a> Node<'a> {
    /// Create a new [`Node`]
    ///
    /// # Arguments
    ///
    /// * `node_id` - Initial node ID assignment
    /// * `mbox` - The mailbox receive threads store messages in
    /// * `od` - The object dictionary served over SDO
    pub fn new(node_id: NodeId, mbox: &'a NodeMbox, od: &'a dyn ObjectDictionary) -> Self {
        Self::with_sdo_server(node_id, mbox, od, SdoServer::new(SdoServerConfig::default()))
    }

    /// Create a new [`Node`] with a preconfigured SDO server
    pub fn with_sdo_server(
        node_id: NodeId,
        mbox: &'a NodeMbox,
        od: &'a dyn ObjectDictionary,
        sdo_server: SdoServer,
    ) -> Self {
        mbox.set_sdo_cob_id(Some(sdo_request_id(node_id.raw())));
        Self {
            node_id,
            nmt_state: NmtState::Initializing,
            sdo_server,
            message_count: 0,
            od,
            mbox,
            last_process_time_us: None,
            write_callback: None,
        }
    }

    /// Register a callback to be called each time an SDO download updates an object
    pub fn register_write_callback(&mut self, callback: impl FnMut(ObjectId) + Send + 'a) {
        self.write_callback = Some(Box::new(callback));
    }

    /// Run periodic processing
    ///
    /// This should be called periodically by the application so that the node can update its
    /// state, handle received messages, and send responses.
    ///
    /// # Arguments
    /// * `now_us` - A monotonic time in microseconds. Used for the SDO server timeout.
    /// * `send_cb` - A callback function for transmitting CAN messages
    pub fn process(&mut self, now_us: u64, send_cb: &mut dyn FnMut(CanMessage)) {
        let elapsed_us = match self.last_process_time_us {
            Some(last) => now_us.saturating_sub(last),
            None => 0,
        };
        self.last_process_time_us = Some(now_us);

        if self.nmt_state == NmtState::Initializing {
            self.boot_up(send_cb);
        }

        if let Some(msg) = self.mbox.read_nmt_mbox() {
            self.message_count += 1;
            match NmtFrame::try_from(msg) {
                Ok(frame) if frame.addresses(self.node_id.raw()) => {
                    self.handle_nmt_command(frame, send_cb)
                }
                Ok(_) => (),
                Err(e) => warn!("Ignoring NMT frame: {:?}", e),
            }
        }

        let response_id = sdo_response_id(self.node_id.raw());
        let mut sdo_send = |data: [u8; 8]| send_cb(CanMessage::new(response_id, data));
        while let Some(msg) = self.mbox.read_sdo_mbox() {
            self.message_count += 1;
            if !self.nmt_state.serves_sdo() {
                debug!("Ignoring SDO request in {} state", self.nmt_state);
                continue;
            }
            if let Some(id) = self.sdo_server.handle_frame(msg.data(), self.od, &mut sdo_send) {
                if let Some(cb) = self.write_callback.as_mut() {
                    cb(id);
                }
            }
        }

        let elapsed_us = elapsed_us.min(u32::MAX as u64) as u32;
        self.sdo_server.process(elapsed_us, &mut sdo_send);
    }

    fn handle_nmt_command(&mut self, frame: NmtFrame, send_cb: &mut dyn FnMut(CanMessage)) {
        let prev_state = self.nmt_state;
        self.nmt_state = prev_state.transition(frame.cmd);
        if self.nmt_state != prev_state {
            info!("NMT state changed from {} to {}", prev_state, self.nmt_state);
        }
        // A reset takes effect immediately, and the node announces itself again
        if self.nmt_state == NmtState::Initializing {
            self.boot_up(send_cb);
        }
    }

    fn boot_up(&mut self, send_cb: &mut dyn FnMut(CanMessage)) {
        info!("Booting node with ID {}", self.node_id);
        self.nmt_state = NmtState::PreOperational;
        send_cb(boot_up(self.node_id.raw()));
    }

    /// Get the current Node ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Get the current NMT state of the node
    pub fn nmt_state(&self) -> NmtState {
        self.nmt_state
    }

    /// Get the number of received messages
    pub fn rx_message_count(&self) -> u32 {
        self.message_count
    }

    /// The node's SDO server
    pub fn sdo_server(&self) -> &SdoServer {
        &self.sdo_server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{
        messages::CanId,
        nmt::NmtCommand,
        objects::AccessType,
        sdo::{SdoRequest, SdoResponse},
    };
    use crate::object_dict::{MemoryObjectDict, ObjectEntry};

    fn setup() -> (&'static NodeMbox, &'static MemoryObjectDict, NodeId) {
        let mbox = Box::leak(Box::new(NodeMbox::default()));
        let od = Box::leak(Box::new(
            MemoryObjectDict::builder()
                .entry(ObjectEntry::new(0x2000, 0, AccessType::Rw).value([1, 2]))
                .build(),
        ));
        (mbox, od, NodeId::new(5).unwrap())
    }

    fn nmt(cmd: NmtCommand, node: u8) -> CanMessage {
        NmtFrame { cmd, node }.into()
    }

    fn sdo(req: SdoRequest) -> CanMessage {
        CanMessage::new(sdo_request_id(5), req.to_bytes())
    }

    #[test]
    fn test_boot_and_nmt() {
        let (mbox, od, node_id) = setup();
        let mut node = Node::new(node_id, mbox, od);
        let mut sent = Vec::new();

        node.process(0, &mut |msg| sent.push(msg));
        assert_eq!(NmtState::PreOperational, node.nmt_state());
        assert_eq!(vec![boot_up(5)], sent);
        assert_eq!(CanId::std(0x705), sent[0].id());
        assert_eq!(&[0], sent[0].data());

        mbox.store_message(nmt(NmtCommand::StartRemoteNode, 0)).unwrap();
        node.process(10, &mut |msg| sent.push(msg));
        assert_eq!(NmtState::Operational, node.nmt_state());

        // Addressed to another node
        mbox.store_message(nmt(NmtCommand::StopRemoteNode, 6)).unwrap();
        node.process(20, &mut |msg| sent.push(msg));
        assert_eq!(NmtState::Operational, node.nmt_state());

        mbox.store_message(nmt(NmtCommand::StopRemoteNode, 5)).unwrap();
        node.process(30, &mut |msg| sent.push(msg));
        assert_eq!(NmtState::Stopped, node.nmt_state());

        sent.clear();
        mbox.store_message(nmt(NmtCommand::ResetCommunication, 0)).unwrap();
        node.process(40, &mut |msg| sent.push(msg));
        assert_eq!(NmtState::PreOperational, node.nmt_state());
        assert_eq!(vec![boot_up(5)], sent);
        assert_eq!(4, node.rx_message_count());
    }

    #[test]
    fn test_sdo_served_by_state() {
        let (mbox, od, node_id) = setup();
        let mut node = Node::new(node_id, mbox, od);
        let written: &'static std::sync::Mutex<Vec<ObjectId>> =
            Box::leak(Box::new(std::sync::Mutex::new(Vec::new())));
        node.register_write_callback(move |id| written.lock().unwrap().push(id));
        let mut sent = Vec::new();
        node.process(0, &mut |msg| sent.push(msg));
        sent.clear();

        mbox.store_message(sdo(SdoRequest::initiate_upload(0x2000, 0))).unwrap();
        node.process(10, &mut |msg| sent.push(msg));
        assert_eq!(1, sent.len());
        assert_eq!(CanId::std(0x585), sent[0].id());
        assert_eq!(
            SdoResponse::expedited_upload(0x2000, 0, &[1, 2]).unwrap(),
            SdoResponse::try_from(sent[0].data()).unwrap()
        );

        mbox.store_message(sdo(SdoRequest::expedited_download(0x2000, 0, &[7]).unwrap()))
            .unwrap();
        node.process(20, &mut |msg| sent.push(msg));
        assert_eq!(vec![ObjectId::new(0x2000, 0)], *written.lock().unwrap());
        assert_eq!(Some(vec![7]), od.get(0x2000, 0));

        // Stopped nodes do not answer SDO requests
        sent.clear();
        mbox.store_message(nmt(NmtCommand::StopRemoteNode, 0)).unwrap();
        mbox.store_message(sdo(SdoRequest::initiate_upload(0x2000, 0))).unwrap();
        node.process(30, &mut |msg| sent.push(msg));
        assert!(sent.is_empty());
    }

    #[test]
    fn test_sdo_timeout_uses_process_time() {
        let (mbox, od, node_id) = setup();
        let mut node = Node::new(node_id, mbox, od);
        let mut sent = Vec::new();
        node.process(1_000_000, &mut |msg| sent.push(msg));
        sent.clear();

        mbox.store_message(sdo(SdoRequest::initiate_download(0x2000, 0, Some(10))))
            .unwrap();
        node.process(1_000_000, &mut |msg| sent.push(msg));
        assert_eq!(1, sent.len());
        assert!(!node.sdo_server().is_idle());

        node.process(1_150_000, &mut |msg| sent.push(msg));
        assert_eq!(1, sent.len());
        node.process(1_210_000, &mut |msg| sent.push(msg));
        assert_eq!(2, sent.len());
        assert_eq!(0x80, sent[1].data()[0]);
        assert!(node.sdo_server().is_idle());
    }
}
