//! The shared state of the node, wired together in `main`.
//!
//! One `System` value owns every queue, the mode cell and all counters;
//! workers borrow exactly the pieces they need. Nothing in this crate is a
//! process-wide singleton. `System::new` is `const`, so the binary can
//! place the value in a `StaticCell` (or a plain `static`) and hand out
//! `'static` references at boot.

use crate::config::CONTROLLER_COUNT;
use crate::guest::HostEnv;
use crate::mode::ModeCell;
use crate::queue::{RxQueue, TxQueue};
use crate::stats::SystemStats;

pub struct System {
    /// All rx workers feed here; the guest host drains it.
    pub rx_queue: RxQueue,
    /// The guest host feeds these; one tx worker drains each.
    pub tx_queues: [TxQueue; CONTROLLER_COUNT],
    /// Current operating mode, published by the mode supervisor.
    pub mode: ModeCell,
    /// Every counter and heartbeat in the node.
    pub stats: SystemStats,
}

impl System {
    pub const fn new() -> Self {
        System {
            rx_queue: RxQueue::new(),
            tx_queues: [TxQueue::new(), TxQueue::new(), TxQueue::new()],
            mode: ModeCell::new(),
            stats: SystemStats::new(),
        }
    }

    /// The import surface handed to the guest runtime.
    pub fn host_env(&'static self) -> HostEnv {
        HostEnv::new(&self.tx_queues, &self.stats.guest)
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}
