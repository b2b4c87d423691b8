//! Firmware message-plane for a three-controller NMEA-2000 "T-connector"
//! node.
//!
//! Three CAN controllers (the on-chip TWAI peripheral plus two MCP2515s on
//! one shared SPI bus) sit between a marine NMEA-2000 bus and a sandboxed
//! WebAssembly guest. Every frame seen on any controller is assembled into
//! an [`NmeaMessage`], queued to the guest, and whatever the guest re-emits
//! is lowered back onto the controller it names. Two GPIO lines driven by a
//! supervising host select the guest's operating mode.
//!
//! The data path is `bus → controller → codec → rx worker → rx queue →
//! guest host → tx queue → tx worker → codec → controller → bus`, six
//! bounded loops that never block past a stated timeout and never allocate.
//! The hardware leaves bind through the traits in [`controller`] and
//! [`guest::runtime`], so the whole plane runs unchanged on the host for
//! tests.
//!
//! # Example
//!
//! ```
//! use tconnector::message::NmeaMessage;
//! use tconnector::config::GUEST_MSG_BUF_SIZE;
//!
//! // The serialized form a guest reads out of its linked buffer:
//! let msg = NmeaMessage::new(0, 6, 129025, 2, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
//! let mut buf = [0u8; GUEST_MSG_BUF_SIZE];
//! let used = msg.serialize_guest(&mut buf);
//! assert_eq!(&buf[..10], b"061f801208");
//! assert_eq!(NmeaMessage::parse_guest(&buf[..used]).unwrap(), msg);
//! ```

#![no_std]
#![allow(async_fn_in_trait)]

#[cfg(test)]
extern crate std;

pub mod arbiter;
pub mod codec;
pub mod config;
pub mod controller;
pub mod frame;
pub mod guest;
pub mod message;
pub mod mode;
pub mod queue;
pub mod rx;
pub mod stats;
pub mod system;
pub mod tx;

pub use frame::CanFrame;
pub use message::NmeaMessage;
pub use mode::Mode;
pub use system::System;
