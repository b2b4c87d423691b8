//! Compile-time sizing and timing of the message-plane.
//!
//! Everything here is a constant so that all queue and buffer memory is
//! statically allocated; nothing on the data path allocates.

use embassy_time::Duration;

/// Number of CAN controllers on the node: the on-chip TWAI plus two MCP2515s.
pub const CONTROLLER_COUNT: usize = 3;

/// Largest NMEA-2000 payload carried by a single message (Fast-Packet limit).
pub const MAX_DATA_LEN: usize = 223;

/// Capacity of the shared received-message queue feeding the guest.
pub const RX_QUEUE_DEPTH: usize = 100;

/// Capacity of each per-controller transmit queue.
pub const TX_QUEUE_DEPTH: usize = 100;

/// Receive frame buffer size handed to controller backends at open time.
// 250 inherited from the deployed units; 32 may be enough, untested on a
// saturated bus.
pub const RX_FRAME_BUF_SIZE: usize = 250;

/// Message assembly slots for multi-frame reassembly in the codec.
pub const MSG_ASSEMBLY_SLOTS: usize = 8;

/// Frames pulled from a controller per worker quantum.
pub const RX_DRAIN_BATCH: usize = 16;

/// Source address this node transmits with; frames carrying it are our own
/// echoes and never reach the guest.
pub const SELF_SOURCE_ADDRESS: u8 = 14;

/// NMEA-2000 broadcast destination address, used for all outgoing traffic.
pub const BROADCAST_ADDRESS: u8 = 0xff;

/// CAN bit rate of the NMEA-2000 bus.
pub const CAN_BITRATE: u32 = 250_000;

/// Upper bound on a queue push before the message is counted as dropped.
pub const PUSH_TIMEOUT: Duration = Duration::from_millis(10);

/// Upper bound on a queue pop; expiry is the worker's heartbeat tick.
pub const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on acquiring the shared SPI bus.
pub const ARBITER_TIMEOUT: Duration = Duration::from_millis(100);

/// Fairness yield between hardware acquisitions in every worker loop.
pub const YIELD_INTERVAL: Duration = Duration::from_millis(10);

/// Cadence of the observability report.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Worker iterations between controller alert/status refreshes.
pub const ALERT_POLL_INTERVAL: u32 = 64;

/// Size of the serialized-message buffer linked into the guest:
/// ten header nibbles plus two nibbles per payload byte.
pub const GUEST_MSG_BUF_SIZE: usize = 10 + 2 * MAX_DATA_LEN;

/// Size of the mode buffer linked into the guest (one ASCII digit).
pub const GUEST_MODE_BUF_SIZE: usize = 1;

/// Stack handed to the guest runtime at instantiation.
pub const GUEST_STACK_SIZE: usize = 32 * 1024;

/// Heap handed to the guest runtime at instantiation.
pub const GUEST_HEAP_SIZE: usize = 32 * 1024;
