//! Network device: per-core queue ownership and RSS-style core selection.
//!
//! A `Device` owns one queue slot per core, fixed at construction to the
//! total core count. Concrete NIC backends plug in through the
//! `DeviceBackend` trait; the device itself only delegates the abstract
//! operations and implements the hashing policy that decides which core's
//! queue pair processes a given flow.

use std::sync::{Arc, OnceLock};

use smoltcp::wire::EthernetAddress;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::NetOptions;
use crate::error::{NetError, Result};
use crate::packet::{ETHERNET_HDR_LEN, IP_PACKET_LEN_MAX, Packet};
use crate::queue::{QueueHandle, QueuePair};
use crate::shard::{self, CoreId};

/// Hardware capability record, immutable after device initialization.
///
/// Upper layers read this to decide whether to compute checksums or
/// segment in software.
#[derive(Debug, Clone, Copy)]
pub struct HwFeatures {
    /// Enable tx ip header checksum offload
    pub tx_csum_ip_offload: bool,
    /// Enable tx l4 (TCP or UDP) checksum offload
    pub tx_csum_l4_offload: bool,
    /// Enable rx checksum offload
    pub rx_csum_offload: bool,
    /// Enable tx TCP segment offload
    pub tx_tso: bool,
    /// Enable tx UDP fragmentation offload
    pub tx_ufo: bool,
    /// Maximum Transmission Unit
    pub mtu: u16,
    /// Maximum packet len when TCP/UDP offload is enabled
    pub max_packet_len: u16,
}

impl Default for HwFeatures {
    fn default() -> Self {
        HwFeatures {
            tx_csum_ip_offload: false,
            tx_csum_l4_offload: false,
            rx_csum_offload: false,
            tx_tso: false,
            tx_ufo: false,
            mtu: 1500,
            max_packet_len: (IP_PACKET_LEN_MAX - ETHERNET_HDR_LEN) as u16,
        }
    }
}

/// Abstract contract a concrete NIC backend supplies.
pub trait DeviceBackend: Send + Sync {
    /// Link-layer address of the device.
    fn hw_address(&self) -> EthernetAddress;

    /// Capability record.
    fn hw_features(&self) -> HwFeatures;

    /// Number of hardware queues.
    fn hw_queues_count(&self) -> u16 {
        1
    }

    /// Link state channel; `true` once the link is usable.
    fn link_state(&self) -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(true);
        rx
    }

    /// Build the queue pair for hardware queue `qid` on the calling core.
    fn init_local_queue(&self, opts: &NetOptions, qid: u16) -> Result<QueuePair>;

    /// Map a flow hash to a hardware queue id. Backends whose queue count
    /// differs from the core count must override this.
    fn hash2qid(&self, hash: u32) -> u16 {
        (hash % u32::from(self.hw_queues_count().max(1))) as u16
    }
}

/// The shard-per-core network device.
pub struct Device {
    backend: Box<dyn DeviceBackend>,
    slots: Box<[OnceLock<Arc<QueueHandle>>]>,
    rss_table_bits: u32,
}

impl Device {
    pub fn new(backend: Box<dyn DeviceBackend>, num_cores: usize, opts: &NetOptions) -> Self {
        let slots = (0..num_cores).map(|_| OnceLock::new()).collect();
        Device {
            backend,
            slots,
            rss_table_bits: opts.rss_table_bits,
        }
    }

    pub fn hw_address(&self) -> EthernetAddress {
        self.backend.hw_address()
    }

    pub fn hw_features(&self) -> HwFeatures {
        self.backend.hw_features()
    }

    pub fn hw_queues_count(&self) -> u16 {
        self.backend.hw_queues_count()
    }

    pub fn num_cores(&self) -> usize {
        self.slots.len()
    }

    /// Resolves once the backend reports the link usable.
    pub async fn link_ready(&self) {
        let mut link = self.backend.link_state();
        if link.wait_for(|up| *up).await.is_err() {
            warn!("link state channel closed before link came up");
        }
    }

    /// Build the queue pair for hardware queue `qid` on the calling core.
    pub fn init_local_queue(&self, opts: &NetOptions, qid: u16) -> Result<QueuePair> {
        self.backend.init_local_queue(opts, qid)
    }

    /// Install the queue pair handle for the calling core.
    ///
    /// Each core installs exactly one queue pair; a second install is a
    /// configuration defect and is rejected.
    pub fn set_local_queue(&self, handle: Arc<QueueHandle>) -> Result<()> {
        let core = shard::current();
        let slot = self.slots.get(core.0).ok_or(NetError::InvalidCore {
            core,
            cores: self.slots.len(),
        })?;
        slot.set(handle)
            .map_err(|_| NetError::QueueAlreadyInstalled(core))?;
        debug!(core = %core, "queue pair installed");
        Ok(())
    }

    /// Queue handle for `core`. A core without an installed queue pair is
    /// an invariant violation.
    pub fn queue_for_cpu(&self, core: CoreId) -> &Arc<QueueHandle> {
        self.slots
            .get(core.0)
            .and_then(|slot| slot.get())
            .unwrap_or_else(|| panic!("no queue pair installed for {core}"))
    }

    pub fn local_queue(&self) -> &Arc<QueueHandle> {
        self.queue_for_cpu(shard::current())
    }

    /// Frame-injection entry point for the backend driver.
    ///
    /// The driver's poll routine already runs on the core that owns the
    /// receiving hardware queue, so the frame goes straight into the
    /// calling core's receive stream; cross-core hops happen only through
    /// the explicit proxy path.
    pub fn l2receive(&self, p: Packet) {
        self.local_queue().produce_rx(p);
    }

    /// Pick the core that should process a flow hashing to `hash`.
    ///
    /// Composes the backend's queue selection with proxy forwarding.
    /// Assumes qid == core id; backends where that does not hold override
    /// `hash2qid`.
    pub fn hash2cpu(&self, hash: u32) -> CoreId {
        let qid = self.backend.hash2qid(hash);
        self.forward_dst(CoreId(qid as usize), hash)
    }

    /// Forwarding target for a flow observed on `src`.
    ///
    /// Index 0 of the proxy selection space keeps the packet local, index
    /// k selects `proxies[k-1]`: the originating core is a first-class
    /// candidate in the hash space, not a spillover destination.
    pub fn forward_dst(&self, src: CoreId, hash: u32) -> CoreId {
        let proxies = self.queue_for_cpu(src).proxies();
        if proxies.is_empty() {
            return src;
        }
        let idx = ((hash >> self.rss_table_bits) as usize) % (proxies.len() + 1);
        if idx == 0 { src } else { proxies[idx - 1] }
    }
}
