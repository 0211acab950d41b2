//! Shard-per-core network device abstraction.
//!
//! Takes raw link-layer frames from a NIC backend, demultiplexes them by
//! protocol, routes each frame to the core that owns its flow, and
//! batches outgoing packets back to the NIC.
//!
//! Architecture:
//! - One shard (thread) per core, shared-nothing; per-core state is only
//!   ever touched by its home shard
//! - Cross-core hand-off exclusively via explicit channels (the proxy
//!   queue), never shared mutable structures under a lock
//! - RSS-style flow hashing decides which core processes a flow
//! - Pull-based egress: the transmit poller drains registered providers
//!   into batches of up to 128 packets

pub mod config;
pub mod device;
pub mod error;
pub mod hash;
pub mod interface;
pub mod packet;
pub mod protocol;
pub mod queue;
pub mod shard;
pub mod test_util;

pub use config::{NetOptions, NetOptionsBuilder};
pub use device::{Device, DeviceBackend, HwFeatures};
pub use error::{NetError, Result};
pub use hash::{HashAccumulator, KEY_CAPACITY, flow_hash};
pub use interface::{Interface, InterfaceStats, Subscription};
pub use packet::{ETHERNET_HDR_LEN, Packet};
pub use protocol::{ForwardFn, L3Packet, L3PacketProvider, L3Protocol, RxHandler};
pub use queue::{
    PacketProvider, QueueBackend, QueueHandle, QueuePair, QueueStatsSnapshot, TX_BATCH_MAX,
    TX_REFILL_THRESHOLD,
};
pub use shard::{CoreId, Shard, ShardHandle};
