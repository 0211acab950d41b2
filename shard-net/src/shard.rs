//! Per-core shard driver.
//!
//! Each core runs one cooperative, non-preemptive poll loop. The loop is
//! the stand-in for the runtime's task scheduler: every pass drains the
//! receive stream, delivers queued protocol packets, and invokes the
//! transmit poller. No locks anywhere; all state the loop touches is
//! owned by its thread.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{error, info};

use crate::error::Result;
use crate::interface::Interface;

/// Frames drained from the receive stream per loop pass.
pub const RX_POLL_BUDGET: usize = 64;

/// Protocol packets delivered to handlers per loop pass.
pub const DELIVER_BUDGET: usize = 64;

/// Idle sleep when a pass did no work.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Identifier of one shard of the share-nothing runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreId(pub usize);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

thread_local! {
    static CURRENT_CORE: Cell<Option<CoreId>> = const { Cell::new(None) };
}

/// Pin the calling thread to a core id. The shard driver does this once
/// per worker thread before any queue state is touched.
pub fn pin(core: CoreId) {
    CURRENT_CORE.with(|c| c.set(Some(core)));
}

pub fn try_current() -> Option<CoreId> {
    CURRENT_CORE.with(|c| c.get())
}

/// Core id of the calling thread. Touching per-core state from an
/// unpinned thread is an invariant violation.
pub fn current() -> CoreId {
    try_current().expect("thread is not pinned to a core")
}

/// The per-core poll loop.
pub struct Shard {
    core: CoreId,
    interface: Interface,
    shutdown: Receiver<()>,
}

impl Shard {
    /// Wrap an interface into a driver loop for the calling core.
    pub fn new(interface: Interface, shutdown: Receiver<()>) -> Self {
        Shard {
            core: current(),
            interface,
            shutdown,
        }
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn interface_mut(&mut self) -> &mut Interface {
        &mut self.interface
    }

    /// Run until the shutdown signal fires.
    pub fn run(&mut self) {
        info!(core = %self.core, "shard started");

        loop {
            if self.shutdown.try_recv().is_ok() {
                info!(core = %self.core, "shard shutting down");
                break;
            }

            let mut did_work = false;
            did_work |= self.interface.poll_rx(RX_POLL_BUDGET);
            did_work |= self.interface.deliver_pending(DELIVER_BUDGET);
            did_work |= self.interface.poll_tx();

            if !did_work {
                thread::sleep(IDLE_SLEEP);
            }
        }

        info!(core = %self.core, "shard stopped");
    }
}

/// Handle to a running shard thread.
pub struct ShardHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
    pub core: CoreId,
}

impl ShardHandle {
    /// Signal the shard to stop.
    pub fn stop(&self) {
        let _ = self.shutdown.try_send(());
    }

    /// Wait for the shard to finish.
    pub fn join(mut self) -> std::result::Result<(), String> {
        if let Some(handle) = self.thread.take() {
            handle.join().map_err(|_| "shard thread panicked".to_string())
        } else {
            Ok(())
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ShardHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a shard thread for `core`.
///
/// `setup` runs on the new thread after it is pinned and must build the
/// core's interface (initializing and installing its queue pair); the
/// loop then runs until the handle signals shutdown.
pub fn spawn<F>(core: CoreId, setup: F) -> io::Result<ShardHandle>
where
    F: FnOnce() -> Result<Interface> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = bounded(1);

    let thread = thread::Builder::new()
        .name(format!("shard-{}", core.0))
        .spawn(move || {
            pin(core);
            match setup() {
                Ok(interface) => Shard::new(interface, shutdown_rx).run(),
                Err(e) => error!(core = %core, error = %e, "shard setup failed"),
            }
        })?;

    Ok(ShardHandle {
        thread: Some(thread),
        shutdown: shutdown_tx,
        core,
    })
}
