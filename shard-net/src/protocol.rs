//! L3 protocol registration.
//!
//! A protocol implementation (IPv4, ARP, ...) subscribes to an interface
//! for the frames carrying its EtherType and contributes outgoing packets
//! through a pull-based provider: the owning queue pair's batcher asks
//! "do you have an outgoing packet?" each refill pass.

use smoltcp::wire::{EthernetAddress, EthernetProtocol};

use crate::hash::HashAccumulator;
use crate::interface::{Interface, Subscription};
use crate::packet::Packet;

/// The unit a protocol hands to the interface for egress.
#[derive(Debug)]
pub struct L3Packet {
    pub proto_num: EthernetProtocol,
    /// Destination link-layer address.
    pub to: EthernetAddress,
    pub p: Packet,
}

/// Pull callback producing the protocol's next outgoing packet, if any.
pub type L3PacketProvider = Box<dyn FnMut() -> Option<L3Packet> + Send>;

/// Receive continuation for inbound frames, invoked with the frame and
/// its claimed source address.
pub type RxHandler = Box<dyn FnMut(Packet, EthernetAddress) + Send>;

/// Per-packet routing predicate.
///
/// Builds the flow key from the frame's header fields (the L3 header
/// starts at `offset`) and returns whether the frame is eligible for
/// cross-core forwarding. Runs before any per-core affinity is
/// established, so it must be deterministic and side-effect-free.
pub type ForwardFn = Box<dyn Fn(&mut HashAccumulator, &Packet, usize) -> bool + Send>;

/// Registration handle binding a protocol number to an interface.
pub struct L3Protocol {
    proto_num: EthernetProtocol,
}

impl L3Protocol {
    /// Bind to `netif`, registering the egress provider with its queue
    /// pair. The interface adds Ethernet encapsulation around packets the
    /// provider yields.
    pub fn new(
        netif: &mut Interface,
        proto_num: EthernetProtocol,
        provider: L3PacketProvider,
    ) -> Self {
        netif.register_packet_provider(provider);
        L3Protocol { proto_num }
    }

    pub fn proto_num(&self) -> EthernetProtocol {
        self.proto_num
    }

    /// Subscribe to all inbound frames matching this protocol number.
    pub fn receive(
        &self,
        netif: &mut Interface,
        rx_fn: RxHandler,
        forward: ForwardFn,
    ) -> Subscription {
        netif.register_l3(self.proto_num, rx_fn, forward)
    }
}
