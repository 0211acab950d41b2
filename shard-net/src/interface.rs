//! Protocol demultiplexing above the device.
//!
//! The interface owns the local core's queue pair, parses inbound frames
//! just far enough to find the EtherType, and routes each frame either
//! into the matching per-protocol stream or, when the flow hashes to a
//! different core, into that core's proxy queue. On the egress side it
//! wraps the protocols' pull providers with Ethernet encapsulation.
//!
//! Frames whose protocol number has no registered handler are dropped
//! silently and counted; there is no per-packet error path for expected
//! "none of our protocols" traffic.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};
use tracing::{debug, trace};

use crate::device::{Device, HwFeatures};
use crate::hash::{HashAccumulator, flow_hash};
use crate::packet::{ETHERNET_HDR_LEN, Packet};
use crate::protocol::{ForwardFn, L3Packet, L3PacketProvider, RxHandler};
use crate::queue::QueuePair;
use crate::shard::{self, CoreId};

/// Cancellable handle for a protocol registration.
///
/// Cancelling (or dropping) stops future dispatch to the handler; frames
/// already queued on the protocol stream are still delivered.
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Per-protocol receive stream: the inbound FIFO, its consumer, and the
/// routing predicate applied before the frame is accepted locally.
struct RxStream {
    queue: VecDeque<(Packet, EthernetAddress)>,
    handler: RxHandler,
    forward: ForwardFn,
    active: Arc<AtomicBool>,
}

/// Dispatch and delivery counters for one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    /// Frames dropped because no protocol claimed their EtherType.
    pub dropped_unknown_proto: u64,
    /// Frames too short or malformed to carry an Ethernet header.
    pub dropped_malformed: u64,
    /// Frames handed to another core's proxy queue.
    pub forwarded: u64,
    /// Packets delivered to protocol handlers.
    pub delivered: u64,
}

/// L3 demultiplexer bound to one core's queue pair.
pub struct Interface {
    dev: Arc<Device>,
    qp: QueuePair,
    core: CoreId,
    proto_map: HashMap<u16, RxStream>,
    hw_address: EthernetAddress,
    hw_features: HwFeatures,
    stats: InterfaceStats,
}

impl Interface {
    /// Attach to the calling core's queue pair and start receive
    /// processing on the backend.
    pub fn new(dev: Arc<Device>, mut qp: QueuePair) -> Self {
        qp.rx_start();
        Interface {
            hw_address: dev.hw_address(),
            hw_features: dev.hw_features(),
            core: shard::current(),
            dev,
            qp,
            proto_map: HashMap::new(),
            stats: InterfaceStats::default(),
        }
    }

    pub fn hw_address(&self) -> EthernetAddress {
        self.hw_address
    }

    pub fn hw_features(&self) -> HwFeatures {
        self.hw_features
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    pub fn queue_pair(&self) -> &QueuePair {
        &self.qp
    }

    pub fn queue_pair_mut(&mut self) -> &mut QueuePair {
        &mut self.qp
    }

    pub fn stats(&self) -> InterfaceStats {
        self.stats
    }

    /// Register a receive handler and forward predicate for `proto_num`.
    ///
    /// A protocol number already registered reuses its stream: the
    /// handler and predicate are replaced, queued frames are kept.
    pub fn register_l3(
        &mut self,
        proto_num: EthernetProtocol,
        rx_fn: RxHandler,
        forward: ForwardFn,
    ) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        match self.proto_map.entry(u16::from(proto_num)) {
            Entry::Occupied(mut e) => {
                let stream = e.get_mut();
                stream.handler = rx_fn;
                stream.forward = forward;
                stream.active = Arc::clone(&active);
            }
            Entry::Vacant(e) => {
                e.insert(RxStream {
                    queue: VecDeque::new(),
                    handler: rx_fn,
                    forward,
                    active: Arc::clone(&active),
                });
            }
        }
        debug!(core = %self.core, proto = ?proto_num, "registered L3 protocol");
        Subscription { active }
    }

    /// Append an egress provider, consulted by the transmit poller in
    /// registration order. Packets it yields are encapsulated with an
    /// Ethernet header sourced from the device address.
    pub fn register_packet_provider(&mut self, mut provider: L3PacketProvider) {
        let src_addr = self.hw_address;
        self.qp.register_packet_provider(Box::new(move || {
            provider().map(|l3| encapsulate(l3, src_addr))
        }));
    }

    /// Route one inbound frame.
    pub fn dispatch_packet(&mut self, p: Packet) {
        let (proto, src) = {
            let Ok(frame) = EthernetFrame::new_checked(p.data()) else {
                self.stats.dropped_malformed += 1;
                return;
            };
            (u16::from(frame.ethertype()), frame.src_addr())
        };

        let Some(stream) = self.proto_map.get_mut(&proto) else {
            self.stats.dropped_unknown_proto += 1;
            return;
        };
        if !stream.active.load(Ordering::Acquire) {
            self.stats.dropped_unknown_proto += 1;
            return;
        }

        let mut key = HashAccumulator::new();
        if (stream.forward)(&mut key, &p, ETHERNET_HDR_LEN) {
            let target = self.dev.hash2cpu(flow_hash(&key));
            if target != self.core {
                trace!(core = %self.core, target = %target, "forwarding frame");
                self.dev.queue_for_cpu(target).proxy_send(p);
                self.stats.forwarded += 1;
                return;
            }
        }

        stream.queue.push_back((p, src));
    }

    /// Drain the device receive stream into the dispatcher. Returns
    /// whether any frame was processed.
    pub fn poll_rx(&mut self, budget: usize) -> bool {
        let mut count = 0u64;
        while (count as usize) < budget {
            let Some(p) = self.qp.rx_next() else { break };
            count += 1;
            self.dispatch_packet(p);
        }
        if count > 0 {
            self.qp.note_rx_batch(count);
        }
        count > 0
    }

    /// Deliver queued frames to their protocol handlers, in arrival
    /// order per protocol. Returns whether anything was delivered.
    pub fn deliver_pending(&mut self, budget: usize) -> bool {
        let mut delivered = 0usize;
        for stream in self.proto_map.values_mut() {
            while delivered < budget {
                let Some((p, src)) = stream.queue.pop_front() else {
                    break;
                };
                delivered += 1;
                (stream.handler)(p, src);
            }
            if delivered >= budget {
                break;
            }
        }
        self.stats.delivered += delivered as u64;
        delivered > 0
    }

    /// Transmit poller pass on the owned queue pair.
    pub fn poll_tx(&mut self) -> bool {
        self.qp.poll_tx()
    }
}

/// Prepend the Ethernet header for an outgoing L3 packet.
fn encapsulate(l3: L3Packet, src_addr: EthernetAddress) -> Packet {
    let repr = EthernetRepr {
        src_addr,
        dst_addr: l3.to,
        ethertype: l3.proto_num,
    };
    let mut hdr = [0u8; ETHERNET_HDR_LEN];
    let mut frame = EthernetFrame::new_unchecked(&mut hdr[..]);
    repr.emit(&mut frame);

    let mut p = l3.p;
    p.prepend(&hdr);
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::NetOptions;
    use crate::protocol::L3Protocol;
    use crate::test_util::{LoopbackBackend, eth_frame};

    type RxLog = Arc<Mutex<Vec<(Vec<u8>, EthernetAddress)>>>;

    const PEER_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0, 0x12, 0x34, 0x56]);

    fn logging_handler() -> (RxHandler, RxLog) {
        let log: RxLog = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let handler = Box::new(move |p: Packet, src: EthernetAddress| {
            sink.lock().unwrap().push((p.data().to_vec(), src));
        });
        (handler, log)
    }

    fn never_forward() -> ForwardFn {
        Box::new(|_, _, _| false)
    }

    fn local_interface(cores: usize) -> (Arc<Device>, Interface) {
        shard::pin(CoreId(0));
        let opts = NetOptions::default();
        let dev = Arc::new(Device::new(
            Box::new(LoopbackBackend::new(1)),
            cores,
            &opts,
        ));
        let qp = dev.init_local_queue(&opts, 0).unwrap();
        dev.set_local_queue(qp.handle()).unwrap();
        let iface = Interface::new(Arc::clone(&dev), qp);
        (dev, iface)
    }

    #[test]
    fn test_dispatch_delivers_with_source_address() {
        let (_dev, mut iface) = local_interface(1);
        let (handler, log) = logging_handler();
        let _sub = iface.register_l3(EthernetProtocol::Ipv4, handler, never_forward());

        iface.dispatch_packet(eth_frame(
            iface.hw_address(),
            PEER_MAC,
            EthernetProtocol::Ipv4,
            &[1, 2, 3],
        ));
        assert!(iface.deliver_pending(16));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1, PEER_MAC);
        assert_eq!(&log[0].0[ETHERNET_HDR_LEN..], &[1, 2, 3]);
    }

    #[test]
    fn test_unknown_proto_dropped_silently() {
        let (_dev, mut iface) = local_interface(1);
        let (handler, log) = logging_handler();
        let _sub = iface.register_l3(EthernetProtocol::Ipv4, handler, never_forward());

        iface.dispatch_packet(eth_frame(
            iface.hw_address(),
            PEER_MAC,
            EthernetProtocol::Arp,
            &[9],
        ));
        assert!(!iface.deliver_pending(16));

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(iface.stats().dropped_unknown_proto, 1);
        assert_eq!(iface.stats().delivered, 0);
    }

    #[test]
    fn test_malformed_frame_counted() {
        let (_dev, mut iface) = local_interface(1);
        iface.dispatch_packet(Packet::from_slice(&[0xde, 0xad]));
        assert_eq!(iface.stats().dropped_malformed, 1);
    }

    #[test]
    fn test_arrival_order_preserved() {
        let (_dev, mut iface) = local_interface(1);
        let (handler, log) = logging_handler();
        let _sub = iface.register_l3(EthernetProtocol::Ipv4, handler, never_forward());

        for tag in [10u8, 20, 30] {
            iface.dispatch_packet(eth_frame(
                iface.hw_address(),
                PEER_MAC,
                EthernetProtocol::Ipv4,
                &[tag],
            ));
        }
        iface.deliver_pending(16);

        let log = log.lock().unwrap();
        let tags: Vec<u8> = log.iter().map(|(d, _)| d[ETHERNET_HDR_LEN]).collect();
        assert_eq!(tags, vec![10, 20, 30]);
    }

    #[test]
    fn test_cancelled_subscription_stops_dispatch() {
        let (_dev, mut iface) = local_interface(1);
        let (handler, log) = logging_handler();
        let sub = iface.register_l3(EthernetProtocol::Ipv4, handler, never_forward());

        iface.dispatch_packet(eth_frame(
            iface.hw_address(),
            PEER_MAC,
            EthernetProtocol::Ipv4,
            &[1],
        ));
        sub.cancel();
        // queued before the cancel: still delivered
        iface.dispatch_packet(eth_frame(
            iface.hw_address(),
            PEER_MAC,
            EthernetProtocol::Ipv4,
            &[2],
        ));
        iface.deliver_pending(16);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0[ETHERNET_HDR_LEN], 1);
    }

    #[test]
    fn test_reregistration_reuses_stream() {
        let (_dev, mut iface) = local_interface(1);
        let (first, first_log) = logging_handler();
        let _sub1 = iface.register_l3(EthernetProtocol::Ipv4, first, never_forward());

        iface.dispatch_packet(eth_frame(
            iface.hw_address(),
            PEER_MAC,
            EthernetProtocol::Ipv4,
            &[7],
        ));

        // replacing the handler keeps the queued frame
        let (second, second_log) = logging_handler();
        let _sub2 = iface.register_l3(EthernetProtocol::Ipv4, second, never_forward());
        iface.deliver_pending(16);

        assert!(first_log.lock().unwrap().is_empty());
        assert_eq!(second_log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_forward_to_peer_core_proxy_queue() {
        shard::pin(CoreId(0));
        let opts = NetOptions::default();
        let backend = LoopbackBackend::new(1);
        let peer_tx_log = backend.tx_log(1);
        let dev = Arc::new(Device::new(Box::new(backend), 2, &opts));

        let mut qp0 = dev.init_local_queue(&opts, 0).unwrap();
        qp0.add_proxy(CoreId(1));
        dev.set_local_queue(qp0.handle()).unwrap();
        let mut iface = Interface::new(Arc::clone(&dev), qp0);

        // install the peer queue; its own proxy provider drains what we
        // forward to it
        shard::pin(CoreId(1));
        let mut qp1 = dev.init_local_queue(&opts, 1).unwrap();
        qp1.add_proxy(CoreId(0));
        dev.set_local_queue(qp1.handle()).unwrap();
        shard::pin(CoreId(0));

        let (handler, local_log) = logging_handler();
        // key chosen at runtime so the proxy index selects the peer
        let key_byte = (0u8..=255)
            .find(|&b| {
                let mut key = HashAccumulator::new();
                key.push_u8(b);
                (flow_hash(&key) as usize) % 2 == 1
            })
            .unwrap();
        let forward: ForwardFn = Box::new(move |key, _p, _off| {
            key.push_u8(key_byte);
            true
        });
        let _sub = iface.register_l3(EthernetProtocol::Ipv4, handler, forward);

        iface.dispatch_packet(eth_frame(
            iface.hw_address(),
            PEER_MAC,
            EthernetProtocol::Ipv4,
            &[42],
        ));
        assert_eq!(iface.stats().forwarded, 1);
        assert!(local_log.lock().unwrap().is_empty());

        // the peer's transmit poller picks the frame off its proxy queue
        shard::pin(CoreId(1));
        assert!(qp1.poll_tx());
        let sent = peer_tx_log.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data()[ETHERNET_HDR_LEN], 42);
    }

    #[test]
    fn test_egress_provider_encapsulates() {
        shard::pin(CoreId(0));
        let opts = NetOptions::default();
        let backend = LoopbackBackend::new(1);
        let tx_log = backend.tx_log(0);
        let dev = Arc::new(Device::new(Box::new(backend), 1, &opts));
        let qp = dev.init_local_queue(&opts, 0).unwrap();
        dev.set_local_queue(qp.handle()).unwrap();
        let mut iface = Interface::new(Arc::clone(&dev), qp);

        let queue: Arc<Mutex<VecDeque<L3Packet>>> = Arc::new(Mutex::new(VecDeque::new()));
        queue.lock().unwrap().push_back(L3Packet {
            proto_num: EthernetProtocol::Arp,
            to: PEER_MAC,
            p: Packet::from_slice(&[0xaa, 0xbb]),
        });

        let source = Arc::clone(&queue);
        let proto = L3Protocol::new(
            &mut iface,
            EthernetProtocol::Arp,
            Box::new(move || source.lock().unwrap().pop_front()),
        );
        assert_eq!(proto.proto_num(), EthernetProtocol::Arp);

        assert!(iface.poll_tx());

        let sent = tx_log.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let frame = EthernetFrame::new_checked(sent[0].data()).unwrap();
        assert_eq!(frame.dst_addr(), PEER_MAC);
        assert_eq!(frame.src_addr(), iface.hw_address());
        assert_eq!(frame.ethertype(), EthernetProtocol::Arp);
        assert_eq!(frame.payload(), &[0xaa, 0xbb]);
    }

    #[test]
    fn test_providers_drained_in_registration_order() {
        shard::pin(CoreId(0));
        let opts = NetOptions::default();
        let backend = LoopbackBackend::new(1);
        let tx_log = backend.tx_log(0);
        let dev = Arc::new(Device::new(Box::new(backend), 1, &opts));
        let qp = dev.init_local_queue(&opts, 0).unwrap();
        dev.set_local_queue(qp.handle()).unwrap();
        let mut iface = Interface::new(Arc::clone(&dev), qp);

        let make_provider = |tags: Vec<u8>| -> L3PacketProvider {
            let mut tags = VecDeque::from(tags);
            Box::new(move || {
                tags.pop_front().map(|tag| L3Packet {
                    proto_num: EthernetProtocol::Ipv4,
                    to: PEER_MAC,
                    p: Packet::from_slice(&[tag]),
                })
            })
        };
        L3Protocol::new(&mut iface, EthernetProtocol::Ipv4, make_provider(vec![1, 2]));
        L3Protocol::new(&mut iface, EthernetProtocol::Ipv4, make_provider(vec![3]));

        assert!(iface.poll_tx());

        // refill passes visit providers in registration order:
        // pass one yields 1 and 3, pass two yields 2
        let sent = tx_log.lock().unwrap();
        let tags: Vec<u8> = sent.iter().map(|p| p.data()[ETHERNET_HDR_LEN]).collect();
        assert_eq!(tags, vec![1, 3, 2]);
    }
}
