//! Scripted ports and a scripted guest for driving the message plane on the
//! host.

#![allow(dead_code)]

use std::boxed::Box;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use tconnector::arbiter::ArbiterTimedOut;
use tconnector::controller::{
    CanRx, CanTx, ControllerConfig, DrainError, FrameBuf, Health, OpenFailed, SendOutcome,
};
use tconnector::frame::CanFrame;
use tconnector::guest::runtime::{CallError, Instance, Runtime};
use tconnector::guest::HostEnv;
use tconnector::message::NmeaMessage;
use tconnector::system::System;

pub fn leak_system() -> &'static System {
    Box::leak(Box::new(System::new()))
}

/// Receive port fed from a canned frame list.
pub struct ScriptRx {
    pub frames: VecDeque<CanFrame>,
    pub fail_open: bool,
}

impl ScriptRx {
    pub fn new(frames: impl IntoIterator<Item = CanFrame>) -> Self {
        ScriptRx {
            frames: frames.into_iter().collect(),
            fail_open: false,
        }
    }

    pub fn broken() -> Self {
        ScriptRx {
            frames: VecDeque::new(),
            fail_open: true,
        }
    }
}

impl CanRx for ScriptRx {
    async fn open(&mut self, _config: &ControllerConfig) -> Result<(), OpenFailed> {
        if self.fail_open {
            Err(OpenFailed)
        } else {
            Ok(())
        }
    }

    async fn drain_into(&mut self, buf: &mut FrameBuf) -> Result<usize, DrainError> {
        let mut appended = 0;
        while !buf.is_full() {
            let Some(frame) = self.frames.pop_front() else {
                break;
            };
            let _ = buf.push(frame);
            appended += 1;
        }
        Ok(appended)
    }

    async fn poll_health(&mut self) -> Option<Health> {
        None
    }
}

pub type TxResult = Result<SendOutcome, ArbiterTimedOut>;

/// Transmit port recording what reaches the wire, with optional scripted
/// outcomes (defaulting to `Sent`).
pub struct ScriptTx {
    pub wire: Rc<RefCell<Vec<CanFrame>>>,
    pub outcomes: VecDeque<TxResult>,
}

impl ScriptTx {
    pub fn new() -> (Self, Rc<RefCell<Vec<CanFrame>>>) {
        let wire = Rc::new(RefCell::new(Vec::new()));
        (
            ScriptTx {
                wire: wire.clone(),
                outcomes: VecDeque::new(),
            },
            wire,
        )
    }

    pub fn with_outcomes(outcomes: impl IntoIterator<Item = TxResult>) -> (Self, Rc<RefCell<Vec<CanFrame>>>) {
        let (mut tx, wire) = Self::new();
        tx.outcomes = outcomes.into_iter().collect();
        (tx, wire)
    }
}

impl CanTx for ScriptTx {
    async fn send_frame(&mut self, frame: &CanFrame) -> TxResult {
        let outcome = self.outcomes.pop_front().unwrap_or(Ok(SendOutcome::Sent));
        if matches!(outcome, Ok(SendOutcome::Sent)) {
            self.wire.borrow_mut().push(*frame);
        }
        outcome
    }
}

/// What the scripted guest does on one activation.
#[derive(Copy, Clone, Debug)]
pub enum GuestBehavior {
    /// Return without calling any import.
    Nop,
    /// Trap.
    Trap,
    /// Re-emit the inbound message unchanged on the given controller.
    ForwardTo(u8),
}

/// Everything the scripted guest observed.
#[derive(Default)]
pub struct ActivationLog {
    pub activations: usize,
    pub modes: Vec<u8>,
    pub messages: Vec<NmeaMessage>,
    pub send_results: Vec<i32>,
}

/// A stand-in for the WebAssembly runtime: one linear memory, a bump
/// allocator, and a behavior script consumed one activation at a time.
pub struct ScriptRuntime {
    behaviors: VecDeque<GuestBehavior>,
    log: Rc<RefCell<ActivationLog>>,
}

impl ScriptRuntime {
    pub fn new(behaviors: impl IntoIterator<Item = GuestBehavior>) -> Self {
        ScriptRuntime {
            behaviors: behaviors.into_iter().collect(),
            log: Rc::new(RefCell::new(ActivationLog::default())),
        }
    }

    pub fn log(&self) -> Rc<RefCell<ActivationLog>> {
        self.log.clone()
    }
}

impl Runtime for ScriptRuntime {
    type Module = ();
    type Instance = ScriptInstance;
    type Error = core::convert::Infallible;

    fn load(&mut self, _wasm: &[u8]) -> Result<(), Self::Error> {
        Ok(())
    }

    fn instantiate(
        &mut self,
        _module: &(),
        env: HostEnv,
        _stack_size: usize,
        _heap_size: usize,
    ) -> Result<ScriptInstance, Self::Error> {
        Ok(ScriptInstance {
            env,
            memory: vec![0u8; 64 * 1024],
            next_alloc: 1024,
            msg_ptr: 0,
            mode_ptr: 0,
            behaviors: core::mem::take(&mut self.behaviors),
            log: self.log.clone(),
        })
    }
}

pub struct ScriptInstance {
    env: HostEnv,
    memory: Vec<u8>,
    next_alloc: u32,
    msg_ptr: u32,
    mode_ptr: u32,
    behaviors: VecDeque<GuestBehavior>,
    log: Rc<RefCell<ActivationLog>>,
}

impl Instance for ScriptInstance {
    type Error = &'static str;

    fn alloc(&mut self, size: u32) -> Result<u32, Self::Error> {
        let ptr = self.next_alloc;
        self.next_alloc += size.max(8);
        if (self.next_alloc as usize) > self.memory.len() {
            return Err("out of guest memory");
        }
        Ok(ptr)
    }

    fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = ptr as usize;
        let end = start + bytes.len();
        if end > self.memory.len() {
            return Err("write out of bounds");
        }
        self.memory[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn call_link_export(&mut self, name: &str, ptr: u32, _size: u32) -> Result<(), CallError> {
        match name {
            "link_msg_buffer" => {
                self.msg_ptr = ptr;
                Ok(())
            }
            "link_mode_buffer" => {
                self.mode_ptr = ptr;
                Ok(())
            }
            _ => Err(CallError::MissingExport),
        }
    }

    fn call_main(&mut self) -> Result<(), CallError> {
        let msg = NmeaMessage::parse_guest(&self.memory[self.msg_ptr as usize..]);
        let mode = self.memory[self.mode_ptr as usize];
        {
            let mut log = self.log.borrow_mut();
            log.activations += 1;
            log.modes.push(mode);
            if let Some(msg) = msg {
                log.messages.push(msg);
            }
        }
        match self.behaviors.pop_front().unwrap_or(GuestBehavior::Nop) {
            GuestBehavior::Nop => Ok(()),
            GuestBehavior::Trap => Err(CallError::Trap),
            GuestBehavior::ForwardTo(controller) => {
                let msg = msg.ok_or(CallError::Trap)?;
                let result = self.env.send_msg(
                    i32::from(controller),
                    i32::from(msg.priority),
                    msg.pgn as i32,
                    i32::from(msg.source),
                    msg.data(),
                );
                self.log.borrow_mut().send_results.push(result);
                Ok(())
            }
        }
    }
}

/// A mode line whose level and edges are driven by the test.
#[derive(Clone)]
pub struct SignalPin {
    level: Rc<Cell<bool>>,
    edge: Rc<Signal<CriticalSectionRawMutex, ()>>,
}

impl SignalPin {
    pub fn new(level: bool) -> Self {
        SignalPin {
            level: Rc::new(Cell::new(level)),
            edge: Rc::new(Signal::new()),
        }
    }

    /// Drives the line to `level`, firing an edge event.
    pub fn drive(&self, level: bool) {
        self.level.set(level);
        self.edge.signal(());
    }
}

impl embedded_hal::digital::ErrorType for SignalPin {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::InputPin for SignalPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level.get())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.level.get())
    }
}

impl embedded_hal_async::digital::Wait for SignalPin {
    async fn wait_for_high(&mut self) -> Result<(), Self::Error> {
        while !self.level.get() {
            self.edge.wait().await;
        }
        Ok(())
    }

    async fn wait_for_low(&mut self) -> Result<(), Self::Error> {
        while self.level.get() {
            self.edge.wait().await;
        }
        Ok(())
    }

    async fn wait_for_rising_edge(&mut self) -> Result<(), Self::Error> {
        self.edge.wait().await;
        Ok(())
    }

    async fn wait_for_falling_edge(&mut self) -> Result<(), Self::Error> {
        self.edge.wait().await;
        Ok(())
    }

    async fn wait_for_any_edge(&mut self) -> Result<(), Self::Error> {
        self.edge.wait().await;
        Ok(())
    }
}
