//! A simulated CAN bus
//!
//! Every message sent on the bus is delivered to each registered [`NodeMbox`] and to every
//! [`SimBusReceiver`], including ones belonging to the sender. A filter can be installed to drop
//! or modify messages in flight.
use std::sync::{Arc, Mutex};

use cansdo_common::{
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
    CanMessage,
};
use cansdo_node::NodeMbox;
use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    StreamExt,
};
use snafu::Snafu;

/// Decides the fate of each message on the bus
///
/// Returning None drops the message.
pub type BusFilter = dyn FnMut(CanMessage) -> Option<CanMessage> + Send;

#[derive(Default)]
struct Shared {
    channels: Vec<UnboundedSender<CanMessage>>,
    filter: Option<Box<BusFilter>>,
}

/// A simulated bus connecting node mailboxes and test receivers
pub struct SimBus<'a> {
    mboxes: Vec<&'a NodeMbox>,
    shared: Arc<Mutex<Shared>>,
}

impl<'a> SimBus<'a> {
    /// Create a bus delivering to the given node mailboxes
    pub fn new(mboxes: Vec<&'a NodeMbox>) -> Self {
        Self {
            mboxes,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Create a sender for putting messages on the bus
    pub fn new_sender(&self) -> SimBusSender<'a> {
        SimBusSender {
            mboxes: self.mboxes.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Create a receiver which gets a copy of every message sent from now on
    pub fn new_receiver(&self) -> SimBusReceiver {
        let (tx, rx) = unbounded();
        self.shared.lock().unwrap().channels.push(tx);
        SimBusReceiver { rx }
    }

    /// Install a filter applied to every message before delivery
    pub fn set_filter(&self, filter: impl FnMut(CanMessage) -> Option<CanMessage> + Send + 'static) {
        self.shared.lock().unwrap().filter = Some(Box::new(filter));
    }

    /// Remove the filter
    pub fn clear_filter(&self) {
        self.shared.lock().unwrap().filter = None;
    }
}

/// Sends messages onto a [`SimBus`]
#[derive(Clone)]
pub struct SimBusSender<'a> {
    mboxes: Vec<&'a NodeMbox>,
    shared: Arc<Mutex<Shared>>,
}

impl SimBusSender<'_> {
    fn deliver(&self, msg: CanMessage) {
        let mut shared = self.shared.lock().unwrap();
        let msg = match shared.filter.as_mut() {
            Some(filter) => match filter(msg) {
                Some(msg) => msg,
                None => return,
            },
            None => msg,
        };
        for mbox in &self.mboxes {
            // Messages not meant for the node are returned, which is fine
            mbox.store_message(msg).ok();
        }
        // Drop receivers which have gone away
        shared
            .channels
            .retain(|tx| tx.unbounded_send(msg).is_ok());
    }
}

impl AsyncCanSender for SimBusSender<'_> {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self.deliver(msg);
        Ok(())
    }
}

/// Error returned by [`SimBusReceiver`] once the bus is gone
#[derive(Debug, Snafu)]
#[snafu(display("Simulated bus closed"))]
pub struct BusClosed;

/// Receives messages from a [`SimBus`]
pub struct SimBusReceiver {
    rx: UnboundedReceiver<CanMessage>,
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = BusClosed;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error> {
        match self.rx.try_next() {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(BusClosed),
            // Nothing waiting
            Err(_) => Ok(None),
        }
    }

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        self.rx.next().await.ok_or(BusClosed)
    }
}
