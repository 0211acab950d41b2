//! Owned frame buffers.
//!
//! A `Packet` is move-only: it crosses every queue boundary by ownership
//! transfer and is never cloned. The buffer keeps headroom in front of the
//! frame data so lower layers can prepend headers without reallocating.

use std::fmt;

/// Ethernet header size
pub const ETHERNET_HDR_LEN: usize = 14;

/// Maximum IP packet length (u16 total-length field)
pub const IP_PACKET_LEN_MAX: usize = 65535;

/// Default headroom reserved in front of a payload, sized for an
/// Ethernet header prepended on the egress path.
pub const DEFAULT_HEADROOM: usize = ETHERNET_HDR_LEN;

/// An owned link-layer frame or L3 payload.
pub struct Packet {
    buf: Vec<u8>,
    head: usize,
}

impl Packet {
    /// Wrap an existing buffer without reserving headroom.
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Packet { buf, head: 0 }
    }

    /// Copy `payload` into a fresh buffer with `headroom` bytes in front.
    pub fn with_headroom(headroom: usize, payload: &[u8]) -> Self {
        let mut buf = vec![0u8; headroom + payload.len()];
        buf[headroom..].copy_from_slice(payload);
        Packet { buf, head: headroom }
    }

    /// Copy `payload` into a fresh buffer with the default headroom.
    pub fn from_slice(payload: &[u8]) -> Self {
        Self::with_headroom(DEFAULT_HEADROOM, payload)
    }

    /// The frame data, headroom excluded.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining headroom in front of the data.
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Prepend `hdr` in front of the current data.
    ///
    /// Uses the headroom when available; otherwise the buffer is rebuilt
    /// with the header in place.
    pub fn prepend(&mut self, hdr: &[u8]) {
        if self.head >= hdr.len() {
            self.head -= hdr.len();
            self.buf[self.head..self.head + hdr.len()].copy_from_slice(hdr);
        } else {
            let mut buf = Vec::with_capacity(hdr.len() + self.len());
            buf.extend_from_slice(hdr);
            buf.extend_from_slice(self.data());
            self.buf = buf;
            self.head = 0;
        }
    }

    /// Consume the packet, returning the frame data.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buf.split_off(self.head)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("headroom", &self.head)
            .finish()
    }
}
