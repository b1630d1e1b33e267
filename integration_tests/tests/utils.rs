#![allow(dead_code)]
use std::{future::Future, time::Instant};

use cansdo_client::{SdoClient, SdoClientConfig};
use cansdo_common::{
    nmt::NmtFrame,
    objects::AccessType,
    sdo::{SdoRequest, SdoResponse},
    traits::{AsyncCanReceiver, AsyncCanSender},
    CanMessage, NodeId,
};
use cansdo_node::{
    object_dict::{MemoryObjectDict, ObjectEntry, SizeRule},
    Node, NodeMbox,
};
use futures::executor::block_on;
use integration_tests::sim_bus::{SimBus, SimBusReceiver, SimBusSender};

pub const SLAVE_NODE_ID: u8 = 1;

/// A recognizable test value
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// The object dictionary served by test nodes
pub fn test_od() -> &'static MemoryObjectDict {
    Box::leak(Box::new(
        MemoryObjectDict::builder()
            .entry(ObjectEntry::new(0x1000, 0, AccessType::Const).value(0x191u32.to_le_bytes()))
            .entry(ObjectEntry::new(0x1234, 1, AccessType::Rw).size(SizeRule::Exact(4)))
            .entry(ObjectEntry::new(0x2000, 0, AccessType::Ro).value(Vec::from_iter(0..20u8)))
            .entry(ObjectEntry::new(0x2001, 0, AccessType::Rw).size(SizeRule::Max(4096)))
            .entry(ObjectEntry::new(0x2002, 0, AccessType::Rw).value(*b"Test"))
            .entry(ObjectEntry::new(0x2003, 0, AccessType::Ro).value(pattern(1000)))
            .build(),
    ))
}

pub fn setup_single_node(
    config: SdoClientConfig,
) -> (
    Node<'static>,
    &'static MemoryObjectDict,
    SdoClient<SimBusSender<'static>, SimBusReceiver>,
    SimBus<'static>,
) {
    let mbox: &'static NodeMbox = Box::leak(Box::new(NodeMbox::default()));
    let od = test_od();
    let node = Node::new(NodeId::new(SLAVE_NODE_ID).unwrap(), mbox, od);

    let bus = SimBus::new(vec![mbox]);

    let sender = bus.new_sender();
    let receiver = bus.new_receiver();
    let client = SdoClient::with_config(SLAVE_NODE_ID, sender, receiver, config).unwrap();

    (node, od, client, bus)
}

pub async fn test_with_background_process<'b, T>(
    nodes: &mut [&mut Node<'_>],
    sender: &mut SimBusSender<'b>,
    test_task: impl Future<Output = T>,
) -> T {
    // Call process once, to make sure the node is initialized before SDO requests come in
    for node in nodes.iter_mut() {
        node.process(0, &mut |tx_msg| block_on(sender.send(tx_msg)).unwrap());
    }

    let epoch = Instant::now();
    let node_process_task = async move {
        loop {
            let now_us = Instant::now().duration_since(epoch).as_micros() as u64;
            tokio::time::sleep(tokio::time::Duration::from_micros(100)).await;
            for node in nodes.iter_mut() {
                node.process(now_us, &mut |tx_msg| block_on(sender.send(tx_msg)).unwrap());
            }
        }
    };

    tokio::select! {
        _ = node_process_task => panic!("Node process task exited"),
        test_result = test_task => test_result
    }
}

/// Prints every message seen on the bus when dropped
pub struct BusLogger {
    rx: SimBusReceiver,
}

impl BusLogger {
    pub fn new(rx: SimBusReceiver) -> Self {
        Self { rx }
    }

    pub fn print(&mut self) {
        println!("Bus message history");
        println!("-------------------");
        while let Ok(Some(msg)) = self.rx.try_recv() {
            let raw = msg.id().raw();
            if raw == 0 {
                println!("{:?}", NmtFrame::try_from(msg));
            } else if (0x600..0x680).contains(&raw) {
                println!("{:x} {:?}", raw, SdoRequest::try_from(msg.data()));
            } else if (0x580..0x600).contains(&raw) {
                println!("{:x} {:?}", raw, SdoResponse::try_from(msg.data()));
            } else {
                println!("{:?}", msg);
            }
        }
    }
}

impl Drop for BusLogger {
    fn drop(&mut self) {
        self.print();
    }
}

/// Drain everything a receiver currently holds
pub fn drain(rx: &mut SimBusReceiver) -> Vec<CanMessage> {
    let mut messages = Vec::new();
    while let Ok(Some(msg)) = rx.try_recv() {
        messages.push(msg);
    }
    messages
}
