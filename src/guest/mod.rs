//! The guest host: embeds the WebAssembly module and pumps one message per
//! activation.
//!
//! The guest runs on a dedicated worker. Host imports execute synchronously
//! on that worker and never suspend past their stated bounds; the rx and tx
//! queues provide all cross-worker synchronization, so the guest's linear
//! memory needs no lock.

use embassy_futures::block_on;
use embassy_time::{Instant, Timer};

use crate::config::{
    CONTROLLER_COUNT, GUEST_HEAP_SIZE, GUEST_MODE_BUF_SIZE, GUEST_MSG_BUF_SIZE, GUEST_STACK_SIZE,
    MAX_DATA_LEN, POP_TIMEOUT, PUSH_TIMEOUT, YIELD_INTERVAL,
};
use crate::message::NmeaMessage;
use crate::mode::ModeCell;
use crate::queue::{RxQueue, TxQueue};
use crate::stats::{inc, GuestStats, Heartbeat};

pub mod runtime;
#[cfg(feature = "guest-wasmi")]
pub mod wasmi;

use runtime::{CallError, Instance, Runtime};

/// Host-side state reachable from the guest's imports.
///
/// `Copy`, so runtime bindings can move it into import closures freely.
#[derive(Copy, Clone)]
pub struct HostEnv {
    tx_queues: &'static [TxQueue; CONTROLLER_COUNT],
    stats: &'static GuestStats,
}

impl HostEnv {
    pub fn new(tx_queues: &'static [TxQueue; CONTROLLER_COUNT], stats: &'static GuestStats) -> Self {
        HostEnv { tx_queues, stats }
    }

    /// `PrintStr(ptr, len)`: debug trace of a byte span in guest memory.
    pub fn print_str(&self, bytes: &[u8]) {
        match core::str::from_utf8(bytes) {
            Ok(text) => log::info!("guest: {}", text),
            Err(_) => log::info!("guest: {:?}", bytes),
        }
    }

    /// `PrintInt32(n, hex)`: debug trace of an integer.
    pub fn print_int32(&self, number: i32, hex: bool) {
        if hex {
            log::info!("guest: {:x}", number);
        } else {
            log::info!("guest: {}", number);
        }
    }

    /// `SendMsg(...)`: the guest's sole egress.
    ///
    /// Validates the controller id and payload length, then pushes to that
    /// controller's tx queue, blocking at most 10 ms when it is full.
    /// Returns 1 on success, 0 otherwise; a rejection changes no state.
    pub fn send_msg(
        &self,
        controller_id: i32,
        priority: i32,
        pgn: i32,
        source: i32,
        data: &[u8],
    ) -> i32 {
        if controller_id < 0
            || controller_id >= CONTROLLER_COUNT as i32
            || data.len() > MAX_DATA_LEN
            || pgn < 0
        {
            inc(&self.stats.rejected_sends);
            return 0;
        }
        let Some(msg) = NmeaMessage::new(
            controller_id as u8,
            priority as u8,
            pgn as u32,
            source as u8,
            data,
        ) else {
            inc(&self.stats.rejected_sends);
            return 0;
        };
        let queue = &self.tx_queues[controller_id as usize];
        // Imports are synchronous on the guest worker; the bounded wait
        // keeps this under 10 ms even against a full queue.
        match block_on(queue.push_back(msg, PUSH_TIMEOUT)) {
            Ok(()) => {
                inc(&self.stats.accepted_sends);
                1
            }
            Err(_) => {
                inc(&self.stats.rejected_sends);
                0
            }
        }
    }
}

/// Setup failure stage; details are logged where they occur. Fatal for the
/// guest worker only.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GuestError {
    Load,
    Instantiate,
    Alloc,
    Link,
}

/// The embedder: owns the instance and the linked buffer addresses.
///
/// The buffer pointers are obtained once and never revalidated; the
/// instance never rebuilds its memory. Hot reload would require re-linking.
pub struct GuestHost<'a, I> {
    instance: I,
    msg_buf_ptr: u32,
    mode_buf_ptr: u32,
    rx_queue: &'a RxQueue,
    mode: &'a ModeCell,
    stats: &'a GuestStats,
    heartbeat: &'a Heartbeat,
    scratch: [u8; GUEST_MSG_BUF_SIZE],
}

impl<'a, I: Instance> GuestHost<'a, I> {
    /// Loads and instantiates the guest, allocates the shared buffers in its
    /// linear memory and links them through the guest's exports.
    pub fn start<R: Runtime<Instance = I>>(
        runtime: &mut R,
        wasm: &[u8],
        env: HostEnv,
        rx_queue: &'a RxQueue,
        mode: &'a ModeCell,
        stats: &'a GuestStats,
        heartbeat: &'a Heartbeat,
    ) -> Result<Self, GuestError> {
        let module = runtime.load(wasm).map_err(|err| {
            log::error!("guest: load failed: {:?}", err);
            GuestError::Load
        })?;
        let mut instance = runtime
            .instantiate(&module, env, GUEST_STACK_SIZE, GUEST_HEAP_SIZE)
            .map_err(|err| {
                log::error!("guest: instantiate failed: {:?}", err);
                GuestError::Instantiate
            })?;

        let msg_buf_ptr = instance.alloc(GUEST_MSG_BUF_SIZE as u32).map_err(|err| {
            log::error!("guest: msg buffer alloc failed: {:?}", err);
            GuestError::Alloc
        })?;
        instance
            .call_link_export("link_msg_buffer", msg_buf_ptr, GUEST_MSG_BUF_SIZE as u32)
            .map_err(|err| {
                log::error!("guest: link_msg_buffer failed: {:?}", err);
                GuestError::Link
            })?;

        let mode_buf_ptr = instance.alloc(GUEST_MODE_BUF_SIZE as u32).map_err(|err| {
            log::error!("guest: mode buffer alloc failed: {:?}", err);
            GuestError::Alloc
        })?;
        instance
            .call_link_export("link_mode_buffer", mode_buf_ptr, GUEST_MODE_BUF_SIZE as u32)
            .map_err(|err| {
                log::error!("guest: link_mode_buffer failed: {:?}", err);
                GuestError::Link
            })?;

        Ok(GuestHost {
            instance,
            msg_buf_ptr,
            mode_buf_ptr,
            rx_queue,
            mode,
            stats,
            heartbeat,
            scratch: [0u8; GUEST_MSG_BUF_SIZE],
        })
    }

    /// One pump iteration: wait for a message, then run one activation.
    pub async fn step(&mut self) {
        let Some(msg) = self.rx_queue.pop_front(POP_TIMEOUT).await else {
            self.heartbeat.bump();
            Timer::after(YIELD_INTERVAL).await;
            return;
        };
        self.activate(&msg);
        self.heartbeat.bump();
    }

    /// Serializes `msg` and the current mode into the guest's buffers and
    /// invokes `main`. A trap is logged and counted; the instance stays
    /// live for the next activation.
    fn activate(&mut self, msg: &NmeaMessage) {
        let used = msg.serialize_guest(&mut self.scratch);
        if let Err(err) = self.instance.write_memory(self.msg_buf_ptr, &self.scratch[..used]) {
            log::error!("guest: msg buffer write failed: {:?}", err);
            return;
        }
        let digit = [self.mode.get().as_ascii_digit()];
        if let Err(err) = self.instance.write_memory(self.mode_buf_ptr, &digit) {
            log::error!("guest: mode buffer write failed: {:?}", err);
            return;
        }

        let started = Instant::now();
        let result = self.instance.call_main();
        let elapsed_us = started.elapsed().as_micros() as u32;

        let trapped = matches!(result, Err(CallError::Trap));
        self.stats.record_activation(elapsed_us, trapped);
        if let Err(CallError::MissingExport) = result {
            log::error!("guest: main export missing");
        }
    }

    pub async fn run(mut self) -> ! {
        loop {
            self.step().await;
        }
    }
}
