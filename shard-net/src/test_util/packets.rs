//! Frame builders for tests.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv4Repr,
};

use crate::packet::Packet;

/// Build an Ethernet frame with the given payload.
pub fn eth_frame(
    dst: EthernetAddress,
    src: EthernetAddress,
    ethertype: EthernetProtocol,
    payload: &[u8],
) -> Packet {
    let repr = EthernetRepr {
        src_addr: src,
        dst_addr: dst,
        ethertype,
    };

    let mut buf = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    Packet::from_vec(buf)
}

/// Build an Ethernet frame carrying a minimal IPv4/UDP-marked packet.
pub fn ipv4_frame(
    dst: EthernetAddress,
    src: EthernetAddress,
    src_ip: Ipv4Address,
    dst_ip: Ipv4Address,
    payload: &[u8],
) -> Packet {
    let repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Udp,
        payload_len: payload.len(),
        hop_limit: 64,
    };

    let mut buf = vec![0u8; repr.buffer_len() + payload.len()];
    let mut packet = Ipv4Packet::new_unchecked(&mut buf);
    repr.emit(&mut packet, &ChecksumCapabilities::default());
    packet.payload_mut().copy_from_slice(payload);

    eth_frame(dst, src, EthernetProtocol::Ipv4, &buf)
}
