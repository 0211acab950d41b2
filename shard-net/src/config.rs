//! Device and queue configuration.
//!
//! `NetOptions` is the opaque option bundle handed to backends when a
//! local queue is initialized. Options are parsed and validated by the
//! embedding application; this layer only carries them.

/// Options for device and queue initialization.
#[derive(Debug, Clone)]
pub struct NetOptions {
    /// Maximum transmission unit advertised to upper layers.
    pub mtu: u16,
    /// How many low hash bits are consumed by the hardware RSS table
    /// before the proxy selection index is computed.
    pub rss_table_bits: u32,
    /// Capacity of the per-core receive stream. Frames arriving while the
    /// stream is full are dropped and counted.
    pub rx_stream_capacity: usize,
    /// Enable tx IP header checksum offload.
    pub tx_csum_offload: bool,
    /// Enable rx checksum offload.
    pub rx_csum_offload: bool,
    /// Enable TCP segmentation offload.
    pub tso: bool,
    /// Enable UDP fragmentation offload.
    pub ufo: bool,
}

impl Default for NetOptions {
    fn default() -> Self {
        NetOptions {
            mtu: 1500,
            rss_table_bits: 0,
            rx_stream_capacity: 1024,
            tx_csum_offload: false,
            rx_csum_offload: false,
            tso: false,
            ufo: false,
        }
    }
}

/// Builder for `NetOptions`.
pub struct NetOptionsBuilder {
    opts: NetOptions,
}

impl NetOptionsBuilder {
    pub fn new() -> Self {
        NetOptionsBuilder {
            opts: NetOptions::default(),
        }
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.opts.mtu = mtu;
        self
    }

    pub fn rss_table_bits(mut self, bits: u32) -> Self {
        self.opts.rss_table_bits = bits;
        self
    }

    pub fn rx_stream_capacity(mut self, capacity: usize) -> Self {
        self.opts.rx_stream_capacity = capacity;
        self
    }

    pub fn tx_csum_offload(mut self, enable: bool) -> Self {
        self.opts.tx_csum_offload = enable;
        self
    }

    pub fn rx_csum_offload(mut self, enable: bool) -> Self {
        self.opts.rx_csum_offload = enable;
        self
    }

    pub fn tso(mut self, enable: bool) -> Self {
        self.opts.tso = enable;
        self
    }

    pub fn ufo(mut self, enable: bool) -> Self {
        self.opts.ufo = enable;
        self
    }

    pub fn build(self) -> NetOptions {
        self.opts
    }
}

impl Default for NetOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
