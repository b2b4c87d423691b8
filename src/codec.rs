//! Lowering between NMEA-2000 messages and raw CAN frames.
//!
//! The 29-bit identifier packing follows the NMEA-2000 addressing rules: for
//! PDU1 parameter groups (PF below 240) the low byte of the id carries the
//! destination address, for PDU2 groups it is part of the PGN itself.
//!
//! Multi-frame transports (Fast-Packet, ISO-TP) are deliberately not
//! implemented here; a full codec library plugs in through [`FrameCodec`].
//! The shipped [`SingleFrameCodec`] covers classic single-frame parameter
//! groups, which is every frame this node forwards unmodified.

use embedded_can::Frame;
use embassy_time::Instant;
use heapless::Vec;

use crate::config::BROADCAST_ADDRESS;
use crate::frame::CanFrame;
use crate::message::{NmeaMessage, PGN_MAX};

/// Most frames a single lowered message may occupy. Sized for a full
/// Fast-Packet train so external codecs fit behind the same seam.
pub const MAX_LOWERED_FRAMES: usize = 32;

/// Frames produced by lowering one message.
pub type LoweredFrames = Vec<CanFrame, MAX_LOWERED_FRAMES>;

/// Milliseconds since boot, the timestamp attached to outgoing messages.
pub fn now_ms() -> u64 {
    Instant::now().as_millis()
}

/// The addressing fields packed into a 29-bit identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CanIdParts {
    pub priority: u8,
    pub pgn: u32,
    pub source: u8,
    pub destination: u8,
}

/// Packs addressing fields into a 29-bit id.
///
/// Returns `None` for PGNs out of 18-bit range or PDU1 PGNs with a non-zero
/// low byte (those cannot appear on the wire).
pub fn pack_id(priority: u8, pgn: u32, source: u8, destination: u8) -> Option<u32> {
    if pgn > PGN_MAX {
        return None;
    }
    let dp = (pgn >> 16) & 0x1;
    let pf = (pgn >> 8) & 0xFF;
    let ps = pgn & 0xFF;
    let head = (u32::from(priority & 0x7) << 26) | (dp << 24) | (pf << 16);
    if pf < 240 {
        // PDU1: destination-addressable; the PGN's own low byte must be zero.
        if ps != 0 {
            return None;
        }
        Some(head | (u32::from(destination) << 8) | u32::from(source))
    } else {
        Some(head | (ps << 8) | u32::from(source))
    }
}

/// Splits a 29-bit id back into addressing fields. PDU2 groups report the
/// broadcast destination.
pub fn unpack_id(id: u32) -> CanIdParts {
    let priority = ((id >> 26) & 0x7) as u8;
    let dp = (id >> 24) & 0x1;
    let pf = (id >> 16) & 0xFF;
    let ps = ((id >> 8) & 0xFF) as u8;
    let source = (id & 0xFF) as u8;
    if pf < 240 {
        CanIdParts {
            priority,
            pgn: (dp << 16) | (pf << 8),
            source,
            destination: ps,
        }
    } else {
        CanIdParts {
            priority,
            pgn: (dp << 16) | (pf << 8) | u32::from(ps),
            source,
            destination: BROADCAST_ADDRESS,
        }
    }
}

/// Why a message could not be lowered to frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LowerError {
    /// Payload needs a multi-frame transport this codec does not provide.
    Oversize { length: u8 },
    /// The PGN cannot be represented on the wire.
    InvalidPgn,
}

/// Assembly and lowering seam between controllers and the message plane.
///
/// `assemble` is fed every received frame in bus order and yields a message
/// once one is complete; `lower` turns an outgoing message into the frame
/// train to hand to the controller. Implementations keep whatever reassembly
/// state they need; the caller owns message-level queueing only.
pub trait FrameCodec {
    /// Feed one received frame; returns a completed message, with
    /// `controller_id` left at 0 for the caller to stamp.
    fn assemble(&mut self, frame: &CanFrame) -> Option<NmeaMessage>;

    /// Lower `msg` for transmission with the given destination and
    /// millisecond timestamp.
    fn lower(
        &mut self,
        msg: &NmeaMessage,
        destination: u8,
        msg_time_ms: u64,
        out: &mut LoweredFrames,
    ) -> Result<(), LowerError>;
}

/// Codec for classic single-frame parameter groups (payloads up to 8 bytes).
#[derive(Default)]
pub struct SingleFrameCodec;

impl SingleFrameCodec {
    pub fn new() -> Self {
        SingleFrameCodec
    }
}

impl FrameCodec for SingleFrameCodec {
    fn assemble(&mut self, frame: &CanFrame) -> Option<NmeaMessage> {
        if !frame.is_extended() {
            // 11-bit traffic is not NMEA-2000; ignore it.
            return None;
        }
        let parts = unpack_id(frame.raw_id());
        NmeaMessage::new(0, parts.priority, parts.pgn, parts.source, frame.data())
    }

    fn lower(
        &mut self,
        msg: &NmeaMessage,
        destination: u8,
        _msg_time_ms: u64,
        out: &mut LoweredFrames,
    ) -> Result<(), LowerError> {
        if msg.length > 8 {
            return Err(LowerError::Oversize { length: msg.length });
        }
        let id = pack_id(msg.priority, msg.pgn, msg.source, destination).ok_or(LowerError::InvalidPgn)?;
        let frame = CanFrame::extended(id, msg.data()).ok_or(LowerError::InvalidPgn)?;
        // A single-frame message always fits in an empty train.
        let _ = out.push(frame);
        Ok(())
    }
}
