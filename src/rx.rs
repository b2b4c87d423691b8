//! Per-controller receive worker.
//!
//! Each quantum: drain the controller (under the SPI arbiter for MCP
//! backends), assemble frames into messages, filter our own echoes, stamp
//! the controller id and push into the shared rx queue. A full queue costs
//! the message, never the loop: the NMEA bus has no flow control, so
//! dropping is the only honest option.

use embassy_time::Timer;

use crate::codec::FrameCodec;
use crate::config::{ALERT_POLL_INTERVAL, POP_TIMEOUT, PUSH_TIMEOUT, SELF_SOURCE_ADDRESS, YIELD_INTERVAL};
use crate::controller::{CanRx, ControllerConfig, DrainError, FrameBuf};
use crate::queue::RxQueue;
use crate::stats::{inc, ControllerCounters, Heartbeat};

pub struct RxWorker<'a, R, C> {
    link: R,
    codec: C,
    controller_id: u8,
    config: ControllerConfig,
    queue: &'a RxQueue,
    counters: &'a ControllerCounters,
    heartbeat: &'a Heartbeat,
    steps: u32,
}

impl<'a, R: CanRx, C: FrameCodec> RxWorker<'a, R, C> {
    pub fn new(
        link: R,
        codec: C,
        controller_id: u8,
        config: ControllerConfig,
        queue: &'a RxQueue,
        counters: &'a ControllerCounters,
        heartbeat: &'a Heartbeat,
    ) -> Self {
        RxWorker {
            link,
            codec,
            controller_id,
            config,
            queue,
            counters,
            heartbeat,
            steps: 0,
        }
    }

    /// Brings the controller up. Failure is fatal for this controller only:
    /// the pair goes dead and everything else keeps running.
    pub async fn open(&mut self) {
        if self.link.open(&self.config).await.is_err() {
            log::error!("rx{}: controller open failed, worker dead", self.controller_id);
            self.counters.mark_dead();
        }
    }

    /// One scheduler quantum of the steady-state loop.
    pub async fn step(&mut self) {
        if self.counters.is_dead() {
            Timer::after(POP_TIMEOUT).await;
            self.heartbeat.bump();
            return;
        }

        let mut frames = FrameBuf::new();
        match self.link.drain_into(&mut frames).await {
            Ok(_) => {}
            Err(DrainError::ArbiterTimedOut) => inc(&self.counters.rx_arbiter_missed),
            // transfer errors are already counted in the backend's health
            Err(DrainError::Bus) => {}
        }

        for frame in &frames {
            let Some(mut msg) = self.codec.assemble(frame) else {
                continue;
            };
            if msg.source == SELF_SOURCE_ADDRESS {
                continue;
            }
            msg.controller_id = self.controller_id;
            if self.config.forward_enabled {
                log::debug!(
                    "rx{}: pgn={} src={} len={}",
                    self.controller_id,
                    msg.pgn,
                    msg.source,
                    msg.length
                );
            }
            inc(&self.counters.received);
            if self.queue.push_back(msg, PUSH_TIMEOUT).await.is_err() {
                inc(&self.counters.rx_dropped);
            }
        }

        self.steps = self.steps.wrapping_add(1);
        if self.steps % ALERT_POLL_INTERVAL == 0 {
            if let Some(health) = self.link.poll_health().await {
                self.counters.record_health(health);
            }
        }

        self.heartbeat.bump();
        Timer::after(YIELD_INTERVAL).await;
    }

    pub async fn run(mut self) -> ! {
        self.open().await;
        loop {
            self.step().await;
        }
    }
}
