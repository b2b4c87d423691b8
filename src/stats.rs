//! Counters and the periodic observability report.
//!
//! Everything on the hot path is a relaxed atomic increment; the reporter
//! reads whatever is there, so a snapshot may be a few events stale. None of
//! this is needed for correctness, all of it is needed at the dock with a
//! single serial cable.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use embassy_time::Timer;

use crate::config::{CONTROLLER_COUNT, REPORT_INTERVAL};
use crate::controller::{Alerts, Health};
use crate::mode::ModeCell;
use crate::queue::{RxQueue, TxQueue};

pub(crate) fn inc(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn get(counter: &AtomicU32) -> u32 {
    counter.load(Ordering::Relaxed)
}

/// Loop-iteration counter proving a worker is alive.
pub struct Heartbeat(AtomicU32);

impl Heartbeat {
    pub const fn new() -> Self {
        Heartbeat(AtomicU32::new(0))
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-controller accounting shared by its rx worker, tx worker and the
/// reporter.
pub struct ControllerCounters {
    /// Messages handed to the hardware successfully.
    pub sent: AtomicU32,
    /// Messages that could not be lowered or sent.
    pub failed: AtomicU32,
    /// Messages assembled from the bus (after self-echo filtering).
    pub received: AtomicU32,
    /// Received messages discarded because the rx queue stayed full.
    pub rx_dropped: AtomicU32,
    /// Outgoing messages discarded after an arbiter miss with a full queue.
    pub tx_dropped: AtomicU32,
    /// Bus acquisition timeouts on the receive path.
    pub rx_arbiter_missed: AtomicU32,
    /// Bus acquisition timeouts on the transmit path.
    pub tx_arbiter_missed: AtomicU32,
    /// Hardware receive overruns, from the controller's health snapshot.
    pub rx_overruns: AtomicU32,
    /// Frames lost to transfer errors, from the health snapshot.
    pub rx_missed: AtomicU32,
    /// Latest alert flags, as [`Alerts`] bits.
    pub alerts: AtomicU8,
    /// Set once when the controller failed to open; the rx/tx pair then
    /// idles while the other controllers keep running.
    pub dead: AtomicBool,
}

impl ControllerCounters {
    pub const fn new() -> Self {
        ControllerCounters {
            sent: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            received: AtomicU32::new(0),
            rx_dropped: AtomicU32::new(0),
            tx_dropped: AtomicU32::new(0),
            rx_arbiter_missed: AtomicU32::new(0),
            tx_arbiter_missed: AtomicU32::new(0),
            rx_overruns: AtomicU32::new(0),
            rx_missed: AtomicU32::new(0),
            alerts: AtomicU8::new(0),
            dead: AtomicBool::new(false),
        }
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Relaxed);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    /// Folds a controller health snapshot into the counters.
    pub fn record_health(&self, health: Health) {
        self.alerts.store(health.alerts.bits(), Ordering::Relaxed);
        self.rx_overruns
            .store(health.status.rx_overruns, Ordering::Relaxed);
        self.rx_missed
            .store(health.status.rx_missed, Ordering::Relaxed);
    }

    pub fn current_alerts(&self) -> Alerts {
        Alerts::from_bits_truncate(self.alerts.load(Ordering::Relaxed))
    }
}

impl Default for ControllerCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Accounting for the guest host.
pub struct GuestStats {
    /// Completed activations, traps included.
    pub activations: AtomicU32,
    /// Activations that ended in a trap.
    pub traps: AtomicU32,
    /// `SendMsg` calls accepted into a tx queue.
    pub accepted_sends: AtomicU32,
    /// `SendMsg` calls rejected (validation or backpressure).
    pub rejected_sends: AtomicU32,
    /// Wall-clock duration of the most recent activation, microseconds.
    pub last_activation_us: AtomicU32,
    /// Longest activation seen, microseconds.
    pub max_activation_us: AtomicU32,
}

impl GuestStats {
    pub const fn new() -> Self {
        GuestStats {
            activations: AtomicU32::new(0),
            traps: AtomicU32::new(0),
            accepted_sends: AtomicU32::new(0),
            rejected_sends: AtomicU32::new(0),
            last_activation_us: AtomicU32::new(0),
            max_activation_us: AtomicU32::new(0),
        }
    }

    pub fn record_activation(&self, duration_us: u32, trapped: bool) {
        inc(&self.activations);
        if trapped {
            inc(&self.traps);
        }
        self.last_activation_us.store(duration_us, Ordering::Relaxed);
        self.max_activation_us
            .fetch_max(duration_us, Ordering::Relaxed);
    }
}

impl Default for GuestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// One heartbeat per worker.
pub struct Heartbeats {
    pub rx: [Heartbeat; CONTROLLER_COUNT],
    pub tx: [Heartbeat; CONTROLLER_COUNT],
    pub guest: Heartbeat,
    pub mode: Heartbeat,
}

impl Heartbeats {
    pub const fn new() -> Self {
        Heartbeats {
            rx: [Heartbeat::new(), Heartbeat::new(), Heartbeat::new()],
            tx: [Heartbeat::new(), Heartbeat::new(), Heartbeat::new()],
            guest: Heartbeat::new(),
            mode: Heartbeat::new(),
        }
    }
}

/// Every counter in the system, owned by [`crate::system::System`].
pub struct SystemStats {
    pub controllers: [ControllerCounters; CONTROLLER_COUNT],
    pub guest: GuestStats,
    pub heartbeats: Heartbeats,
}

impl SystemStats {
    pub const fn new() -> Self {
        SystemStats {
            controllers: [
                ControllerCounters::new(),
                ControllerCounters::new(),
                ControllerCounters::new(),
            ],
            guest: GuestStats::new(),
            heartbeats: Heartbeats::new(),
        }
    }
}

/// Low-priority worker printing a snapshot once a second.
pub struct Reporter<'a> {
    stats: &'a SystemStats,
    rx_queue: &'a RxQueue,
    tx_queues: &'a [TxQueue; CONTROLLER_COUNT],
    mode: &'a ModeCell,
}

impl<'a> Reporter<'a> {
    pub fn new(
        stats: &'a SystemStats,
        rx_queue: &'a RxQueue,
        tx_queues: &'a [TxQueue; CONTROLLER_COUNT],
        mode: &'a ModeCell,
    ) -> Self {
        Reporter {
            stats,
            rx_queue,
            tx_queues,
            mode,
        }
    }

    /// Emits one report through the `log` facade.
    pub fn report(&self) {
        let guest = &self.stats.guest;
        log::info!(
            "report: mode={:?} rx_queue={}/{}",
            self.mode.get(),
            self.rx_queue.depth(),
            self.rx_queue.capacity(),
        );
        for (index, counters) in self.stats.controllers.iter().enumerate() {
            log::info!(
                "c{}: sent={} failed={} received={} rx_dropped={} tx_dropped={} \
                 arb_missed={}/{} overruns={} missed={} alerts={:?} dead={} \
                 tx_queue={}/{} hb_rx={} hb_tx={}",
                index,
                get(&counters.sent),
                get(&counters.failed),
                get(&counters.received),
                get(&counters.rx_dropped),
                get(&counters.tx_dropped),
                get(&counters.rx_arbiter_missed),
                get(&counters.tx_arbiter_missed),
                get(&counters.rx_overruns),
                get(&counters.rx_missed),
                counters.current_alerts(),
                counters.is_dead(),
                self.tx_queues[index].depth(),
                self.tx_queues[index].capacity(),
                self.stats.heartbeats.rx[index].count(),
                self.stats.heartbeats.tx[index].count(),
            );
        }
        log::info!(
            "guest: activations={} traps={} sends={}+/{}- last={}us max={}us hb={} hb_mode={}",
            get(&guest.activations),
            get(&guest.traps),
            get(&guest.accepted_sends),
            get(&guest.rejected_sends),
            guest.last_activation_us.load(Ordering::Relaxed),
            guest.max_activation_us.load(Ordering::Relaxed),
            self.stats.heartbeats.guest.count(),
            self.stats.heartbeats.mode.count(),
        );
    }

    pub async fn run(self) -> ! {
        loop {
            Timer::after(REPORT_INTERVAL).await;
            self.report();
        }
    }
}
