//! Per-controller transmit worker.
//!
//! Pops what the guest emitted, lowers it to frames with the broadcast
//! destination and a fresh timestamp, and hands the frames to the
//! controller. Transmission is best effort at this layer: a failed send is
//! counted and dropped, never retried. An arbiter miss re-enqueues the
//! message once at the back of the queue if there is room.

use embassy_time::Timer;

use crate::arbiter::ArbiterTimedOut;
use crate::codec::{now_ms, FrameCodec, LoweredFrames};
use crate::config::{BROADCAST_ADDRESS, POP_TIMEOUT, YIELD_INTERVAL};
use crate::controller::{CanTx, SendOutcome};
use crate::queue::TxQueue;
use crate::stats::{inc, ControllerCounters, Heartbeat};

pub struct TxWorker<'a, T, C> {
    link: T,
    codec: C,
    controller_id: u8,
    queue: &'a TxQueue,
    counters: &'a ControllerCounters,
    heartbeat: &'a Heartbeat,
}

impl<'a, T: CanTx, C: FrameCodec> TxWorker<'a, T, C> {
    pub fn new(
        link: T,
        codec: C,
        controller_id: u8,
        queue: &'a TxQueue,
        counters: &'a ControllerCounters,
        heartbeat: &'a Heartbeat,
    ) -> Self {
        TxWorker {
            link,
            codec,
            controller_id,
            queue,
            counters,
            heartbeat,
        }
    }

    /// One scheduler quantum: at most one message leaves the queue.
    pub async fn step(&mut self) {
        if self.counters.is_dead() {
            Timer::after(POP_TIMEOUT).await;
            self.heartbeat.bump();
            return;
        }

        let Some(msg) = self.queue.pop_front(POP_TIMEOUT).await else {
            // heartbeat tick
            self.heartbeat.bump();
            return;
        };

        let mut frames = LoweredFrames::new();
        if let Err(err) = self
            .codec
            .lower(&msg, BROADCAST_ADDRESS, now_ms(), &mut frames)
        {
            log::warn!(
                "tx{}: cannot lower pgn={} len={}: {:?}",
                self.controller_id,
                msg.pgn,
                msg.length,
                err
            );
            inc(&self.counters.failed);
            self.heartbeat.bump();
            return;
        }

        let mut outcome = SendOutcome::Sent;
        for frame in &frames {
            match self.link.send_frame(frame).await {
                Ok(SendOutcome::Sent) => continue,
                Ok(other) => {
                    outcome = other;
                    break;
                }
                Err(ArbiterTimedOut) => {
                    inc(&self.counters.tx_arbiter_missed);
                    if self.queue.try_push_back(msg).is_err() {
                        inc(&self.counters.tx_dropped);
                    }
                    self.heartbeat.bump();
                    Timer::after(YIELD_INTERVAL).await;
                    return;
                }
            }
        }

        match outcome {
            SendOutcome::Sent => inc(&self.counters.sent),
            SendOutcome::Busy | SendOutcome::BusError => inc(&self.counters.failed),
        }

        self.heartbeat.bump();
        Timer::after(YIELD_INTERVAL).await;
    }

    pub async fn run(mut self) -> ! {
        loop {
            self.step().await;
        }
    }
}
