//! Per-core transmit/receive queue state.
//!
//! Each core owns exactly one `QueuePair`. All of its state (batch queue,
//! provider list, counters) is mutated only by the home core's shard loop.
//! The cross-core-visible half lives in `QueueHandle`: the receive stream
//! producer, the proxy queue producer, and the published proxy table.
//! Forwarding a packet to another core goes exclusively through
//! `QueueHandle::proxy_send`, the single cross-core mutation point.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use tracing::{trace, warn};

use crate::packet::Packet;
use crate::shard::CoreId;

/// Refill the tx batch only when it has drained below this mark.
pub const TX_REFILL_THRESHOLD: usize = 16;

/// Maximum packets accumulated into one tx batch.
pub const TX_BATCH_MAX: usize = 128;

/// Default capacity of the per-core receive stream.
pub const RX_STREAM_CAPACITY: usize = 1024;

/// Pull-based egress packet source, polled by `poll_tx` in registration
/// order.
pub type PacketProvider = Box<dyn FnMut() -> Option<Packet> + Send>;

/// Backend-specific transmit primitive.
///
/// `send` submits a single packet. The batch variant drains as many
/// packets as the backend can take and returns the count actually sent;
/// the default is a trivial loop over `send`, meant to be overridden by
/// backends capable of true batched submission.
pub trait QueueBackend: Send {
    fn send(&mut self, p: Packet) -> io::Result<()>;

    fn send_batch(&mut self, queue: &mut VecDeque<Packet>) -> usize {
        let mut sent = 0;
        while let Some(p) = queue.pop_front() {
            if let Err(e) = self.send(p) {
                warn!(error = %e, "backend send failed, dropping packet");
                continue;
            }
            sent += 1;
        }
        sent
    }

    /// Called once when the owning interface attaches and receive
    /// processing begins.
    fn rx_start(&mut self) {}
}

/// Shared transmit/receive counters for one queue pair.
#[derive(Debug, Default)]
pub struct QueueStats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    last_tx_batch: AtomicU64,
    last_rx_batch: AtomicU64,
    rx_overflow: AtomicU64,
}

/// Point-in-time copy of `QueueStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub last_tx_batch: u64,
    pub last_rx_batch: u64,
    pub rx_overflow: u64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            last_tx_batch: self.last_tx_batch.load(Ordering::Relaxed),
            last_rx_batch: self.last_rx_batch.load(Ordering::Relaxed),
            rx_overflow: self.rx_overflow.load(Ordering::Relaxed),
        }
    }
}

/// The cross-core-safe half of a `QueuePair`.
///
/// Installed into the device's per-core slot table; any core may hold a
/// reference and push packets through it, the owning shard remains the
/// only consumer.
pub struct QueueHandle {
    rx_tx: Sender<Packet>,
    proxy_tx: Sender<Packet>,
    proxies: ArcSwap<Vec<CoreId>>,
    stats: Arc<QueueStats>,
}

impl QueueHandle {
    /// Push a frame into the owning core's receive stream.
    ///
    /// Never blocks: the producer side of the stream does not suspend.
    /// Frames arriving while the stream is full are dropped and counted.
    pub fn produce_rx(&self, p: Packet) {
        match self.rx_tx.try_send(p) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.rx_overflow.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!("rx stream consumer gone, frame dropped");
            }
        }
    }

    /// Hand a packet to the owning core for transmission.
    ///
    /// FIFO, unbounded; backpressure policy is left to the caller. This is
    /// the only place a foreign core mutates queue state.
    pub fn proxy_send(&self, p: Packet) {
        if self.proxy_tx.send(p).is_err() {
            trace!("proxy consumer gone, packet dropped");
        }
    }

    /// Peer cores this queue may forward to, as last published by the
    /// owning shard.
    pub fn proxies(&self) -> Arc<Vec<CoreId>> {
        self.proxies.load_full()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    fn publish_proxies(&self, proxies: &[CoreId]) {
        self.proxies.store(Arc::new(proxies.to_vec()));
    }
}

/// Per-core transmit/receive queue state.
pub struct QueuePair {
    backend: Box<dyn QueueBackend>,
    providers: Vec<PacketProvider>,
    proxies: Vec<CoreId>,
    proxy_rx: Receiver<Packet>,
    rx_rx: Receiver<Packet>,
    tx_queue: VecDeque<Packet>,
    handle: Arc<QueueHandle>,
    stats: Arc<QueueStats>,
}

impl QueuePair {
    pub fn new(backend: Box<dyn QueueBackend>) -> Self {
        Self::with_rx_capacity(backend, RX_STREAM_CAPACITY)
    }

    pub fn with_rx_capacity(backend: Box<dyn QueueBackend>, rx_capacity: usize) -> Self {
        let (rx_tx, rx_rx) = bounded(rx_capacity);
        let (proxy_tx, proxy_rx) = unbounded();
        let stats = Arc::new(QueueStats::default());
        let handle = Arc::new(QueueHandle {
            rx_tx,
            proxy_tx,
            proxies: ArcSwap::from_pointee(Vec::new()),
            stats: Arc::clone(&stats),
        });

        QueuePair {
            backend,
            providers: Vec::new(),
            proxies: Vec::new(),
            proxy_rx,
            rx_rx,
            tx_queue: VecDeque::new(),
            handle,
            stats,
        }
    }

    /// The cross-core-safe half, installed into the device slot table.
    pub fn handle(&self) -> Arc<QueueHandle> {
        Arc::clone(&self.handle)
    }

    /// Append an egress provider. Providers are polled in registration
    /// order and that order is part of the contract.
    pub fn register_packet_provider(&mut self, provider: PacketProvider) {
        self.providers.push(provider);
    }

    /// Allow forwarding to `core`.
    ///
    /// The first call installs the provider that drains the proxy inbound
    /// queue, one packet per poll; later calls only extend the peer list.
    pub fn add_proxy(&mut self, core: CoreId) {
        if self.proxies.is_empty() {
            let proxy_rx = self.proxy_rx.clone();
            self.register_packet_provider(Box::new(move || proxy_rx.try_recv().ok()));
        }
        self.proxies.push(core);
        self.handle.publish_proxies(&self.proxies);
    }

    pub fn may_forward(&self) -> bool {
        !self.proxies.is_empty()
    }

    pub fn proxies(&self) -> &[CoreId] {
        &self.proxies
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Transmit poller, invoked once per shard loop pass.
    ///
    /// Refills the batch from the providers when it has drained below
    /// `TX_REFILL_THRESHOLD`, capping at `TX_BATCH_MAX` and stopping once
    /// a full pass over all providers yields nothing, then hands the
    /// whole batch to the backend. Returns whether a non-empty batch was
    /// processed, the scheduler's progress signal.
    pub fn poll_tx(&mut self) -> bool {
        if self.tx_queue.len() < TX_REFILL_THRESHOLD {
            loop {
                let mut work = 0;
                for provider in &mut self.providers {
                    if let Some(p) = provider() {
                        work += 1;
                        self.tx_queue.push_back(p);
                        if self.tx_queue.len() == TX_BATCH_MAX {
                            break;
                        }
                    }
                }
                if work == 0 || self.tx_queue.len() >= TX_BATCH_MAX {
                    break;
                }
            }
        }

        if self.tx_queue.is_empty() {
            return false;
        }

        let sent = self.backend.send_batch(&mut self.tx_queue) as u64;
        self.stats.last_tx_batch.store(sent, Ordering::Relaxed);
        self.stats.packets_sent.fetch_add(sent, Ordering::Relaxed);
        true
    }

    /// Next frame from the receive stream, if any.
    pub(crate) fn rx_next(&mut self) -> Option<Packet> {
        self.rx_rx.try_recv().ok()
    }

    pub(crate) fn note_rx_batch(&self, count: u64) {
        self.stats.last_rx_batch.store(count, Ordering::Relaxed);
        self.stats.packets_received.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn rx_start(&mut self) {
        self.backend.rx_start();
    }
}
