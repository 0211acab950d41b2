//! Loopback device backend.
//!
//! Queues capture transmitted packets into a shared log instead of
//! touching hardware, so tests can assert on exactly what would have
//! gone out on the wire.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use smoltcp::wire::EthernetAddress;
use tokio::sync::watch;

use crate::config::NetOptions;
use crate::device::{DeviceBackend, HwFeatures};
use crate::error::Result;
use crate::packet::Packet;
use crate::queue::{QueueBackend, QueuePair};

/// Locally-administered unicast address used by the loopback device.
pub const LOOPBACK_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Shared log of packets a loopback queue has transmitted.
pub type TxLog = Arc<Mutex<Vec<Packet>>>;

/// Queue backend that records sent packets.
pub struct LoopbackQueue {
    tx_log: TxLog,
}

impl LoopbackQueue {
    pub fn new(tx_log: TxLog) -> Self {
        LoopbackQueue { tx_log }
    }
}

impl QueueBackend for LoopbackQueue {
    fn send(&mut self, p: Packet) -> io::Result<()> {
        self.tx_log.lock().unwrap().push(p);
        Ok(())
    }
}

/// Device backend handing out capture queues, one log per queue id.
pub struct LoopbackBackend {
    hw_address: EthernetAddress,
    features: HwFeatures,
    queues: u16,
    tx_logs: Mutex<HashMap<u16, TxLog>>,
    link_tx: watch::Sender<bool>,
}

impl LoopbackBackend {
    pub fn new(queues: u16) -> Self {
        let (link_tx, _link_rx) = watch::channel(true);
        LoopbackBackend {
            hw_address: EthernetAddress(LOOPBACK_MAC),
            features: HwFeatures::default(),
            queues,
            tx_logs: Mutex::new(HashMap::new()),
            link_tx,
        }
    }

    /// Flip the reported link state.
    pub fn set_link(&self, up: bool) {
        self.link_tx.send_replace(up);
    }

    /// The transmit log for queue `qid`, shared with any queue pair
    /// initialized for that id.
    pub fn tx_log(&self, qid: u16) -> TxLog {
        Arc::clone(self.tx_logs.lock().unwrap().entry(qid).or_default())
    }
}

impl DeviceBackend for LoopbackBackend {
    fn hw_address(&self) -> EthernetAddress {
        self.hw_address
    }

    fn hw_features(&self) -> HwFeatures {
        self.features
    }

    fn hw_queues_count(&self) -> u16 {
        self.queues
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.link_tx.subscribe()
    }

    fn init_local_queue(&self, opts: &NetOptions, qid: u16) -> Result<QueuePair> {
        Ok(QueuePair::with_rx_capacity(
            Box::new(LoopbackQueue::new(self.tx_log(qid))),
            opts.rx_stream_capacity,
        ))
    }
}
