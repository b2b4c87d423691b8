//! Uniform capability set over the node's CAN controller backends.
//!
//! Two backends exist: the on-chip TWAI peripheral (interrupt-driven rx
//! FIFO) and the SPI-attached MCP2515 (polled over the shared, arbited bus).
//! They diverge only at the leaf; from a worker's perspective rx is always
//! "drain pending frames until none remain" and tx is "send one frame".

use bitflags::bitflags;
use heapless::Vec;

use crate::arbiter::ArbiterTimedOut;
use crate::config::{CAN_BITRATE, MSG_ASSEMBLY_SLOTS, RX_DRAIN_BATCH, RX_FRAME_BUF_SIZE};
use crate::frame::CanFrame;

pub mod mcp2515;
#[cfg(feature = "esp32")]
pub mod twai;

/// Frames drained from a controller in one worker quantum.
pub type FrameBuf = Vec<CanFrame, RX_DRAIN_BATCH>;

/// Options applied when a controller is opened.
#[derive(Copy, Clone, Debug)]
pub struct ControllerConfig {
    /// Reassembly slots the codec may use for interleaved multi-frame
    /// messages.
    pub msg_assembly_slots: usize,
    /// Receive frame buffering requested from the backend.
    pub rx_frame_buf_size: usize,
    /// Mirror every assembled message to the debug log.
    pub forward_enabled: bool,
    /// Bus bit rate.
    pub bitrate: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            msg_assembly_slots: MSG_ASSEMBLY_SLOTS,
            rx_frame_buf_size: RX_FRAME_BUF_SIZE,
            forward_enabled: false,
            bitrate: CAN_BITRATE,
        }
    }
}

bitflags! {
    /// Sticky error conditions reported by a controller.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Alerts: u8 {
        const ERROR_WARNING = 1 << 0;
        const RX_WARNING = 1 << 1;
        const TX_WARNING = 1 << 2;
        const RX_ERROR_PASSIVE = 1 << 3;
        const TX_ERROR_PASSIVE = 1 << 4;
        const BUS_OFF = 1 << 5;
        const RX_OVERRUN = 1 << 6;
    }
}

/// Point-in-time view of a controller's buffers and loss counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Frames loaded and pending transmission.
    pub msgs_to_tx: u8,
    /// Frames received and waiting to be drained.
    pub msgs_to_rx: u8,
    /// Hardware receive buffer overruns seen so far.
    pub rx_overruns: u32,
    /// Frames lost to transfer errors seen so far.
    pub rx_missed: u32,
}

/// Alerts and status sampled together.
#[derive(Copy, Clone, Debug)]
pub struct Health {
    pub alerts: Alerts,
    pub status: ControllerStatus,
}

/// Result of handing one frame to a controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the hardware.
    Sent,
    /// All transmit buffers occupied; the frame was not loaded.
    Busy,
    /// The controller or its bus refused the transfer.
    BusError,
}

/// The controller could not be brought up. Details are logged at the point
/// of failure; the owning worker goes dead and its peers keep running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpenFailed;

/// A drain attempt that yielded no usable result.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrainError {
    /// The shared bus could not be acquired in time.
    ArbiterTimedOut,
    /// A transfer failed mid-drain; partial results were kept.
    Bus,
}

impl From<ArbiterTimedOut> for DrainError {
    fn from(_: ArbiterTimedOut) -> Self {
        DrainError::ArbiterTimedOut
    }
}

/// Receive half of a controller.
#[allow(async_fn_in_trait)]
pub trait CanRx {
    /// Applies `config` and starts reception in listen-and-send mode.
    async fn open(&mut self, config: &ControllerConfig) -> Result<(), OpenFailed>;

    /// Moves pending frames into `buf`, oldest first, until the hardware is
    /// empty or `buf` is full. Returns how many frames were appended.
    async fn drain_into(&mut self, buf: &mut FrameBuf) -> Result<usize, DrainError>;

    /// Samples alerts and status; `None` when the bus was not available.
    async fn poll_health(&mut self) -> Option<Health>;
}

/// Transmit half of a controller.
#[allow(async_fn_in_trait)]
pub trait CanTx {
    /// Hands one frame to the hardware.
    async fn send_frame(&mut self, frame: &CanFrame) -> Result<SendOutcome, ArbiterTimedOut>;
}
