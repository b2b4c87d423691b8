//! Operating-mode supervision.
//!
//! The supervising host drives two GPIO lines that together encode the
//! guest's operating mode. Any edge on either line wakes the supervisor,
//! which then re-reads *both* lines before publishing: the edge only says
//! that something changed, and re-sampling avoids publishing a transient
//! when the two edges arrive separately.

use core::sync::atomic::{AtomicU8, Ordering};

use embassy_futures::select::{select, Either};
use embedded_hal::digital::InputPin;
use embedded_hal_async::digital::Wait;

use crate::stats::Heartbeat;

/// The guest's two-bit operating mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Off = 0,
    Passive = 1,
    AttackA = 2,
    AttackB = 3,
}

impl Mode {
    /// Decodes the two mode lines: `(msb << 1) | lsb`.
    pub fn from_lines(msb: bool, lsb: bool) -> Self {
        Mode::from_bits((u8::from(msb) << 1) | u8::from(lsb))
    }

    /// Decodes the low two bits of `value`.
    pub fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => Mode::Off,
            1 => Mode::Passive,
            2 => Mode::AttackA,
            _ => Mode::AttackB,
        }
    }

    /// The single ASCII digit written into the guest's mode buffer.
    pub fn as_ascii_digit(self) -> u8 {
        b'0' + self as u8
    }
}

/// Process-wide mode cell; a word-size atomic, so readers never lock.
pub struct ModeCell(AtomicU8);

impl ModeCell {
    pub const fn new() -> Self {
        ModeCell(AtomicU8::new(Mode::Off as u8))
    }

    pub fn set(&self, mode: Mode) {
        self.0.store(mode as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> Mode {
        Mode::from_bits(self.0.load(Ordering::Relaxed))
    }
}

impl Default for ModeCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker watching the two mode lines and publishing into a [`ModeCell`].
pub struct ModeSupervisor<'a, M, L> {
    msb: M,
    lsb: L,
    cell: &'a ModeCell,
    heartbeat: &'a Heartbeat,
}

impl<'a, M, L> ModeSupervisor<'a, M, L>
where
    M: InputPin + Wait,
    L: InputPin + Wait,
{
    pub fn new(msb: M, lsb: L, cell: &'a ModeCell, heartbeat: &'a Heartbeat) -> Self {
        ModeSupervisor {
            msb,
            lsb,
            cell,
            heartbeat,
        }
    }

    /// Publishes the current line state without waiting for an edge; run
    /// once at startup so the cell reflects the pins before the first edge.
    pub fn sample_now(&mut self) {
        match (self.msb.is_high(), self.lsb.is_high()) {
            (Ok(msb), Ok(lsb)) => self.publish(msb, lsb),
            (Err(err), _) => log::warn!("mode: msb read failed: {:?}", err),
            (_, Err(err)) => log::warn!("mode: lsb read failed: {:?}", err),
        }
    }

    /// Waits for one edge on either line, then re-samples both and
    /// publishes.
    pub async fn step(&mut self) {
        match select(self.msb.wait_for_any_edge(), self.lsb.wait_for_any_edge()).await {
            Either::First(Err(err)) => {
                log::warn!("mode: msb edge wait failed: {:?}", err);
                self.heartbeat.bump();
                return;
            }
            Either::Second(Err(err)) => {
                log::warn!("mode: lsb edge wait failed: {:?}", err);
                self.heartbeat.bump();
                return;
            }
            _ => {}
        }
        self.sample_now();
        self.heartbeat.bump();
    }

    pub async fn run(mut self) -> ! {
        self.sample_now();
        loop {
            self.step().await;
        }
    }

    fn publish(&self, msb: bool, lsb: bool) {
        let mode = Mode::from_lines(msb, lsb);
        let previous = self.cell.get();
        if mode != previous {
            log::info!("mode: {:?} -> {:?}", previous, mode);
        }
        self.cell.set(mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_both_lines() {
        assert_eq!(Mode::from_lines(false, false), Mode::Off);
        assert_eq!(Mode::from_lines(false, true), Mode::Passive);
        assert_eq!(Mode::from_lines(true, false), Mode::AttackA);
        assert_eq!(Mode::from_lines(true, true), Mode::AttackB);
    }

    #[test]
    fn ascii_digits() {
        assert_eq!(Mode::Off.as_ascii_digit(), b'0');
        assert_eq!(Mode::AttackB.as_ascii_digit(), b'3');
    }

    #[test]
    fn cell_round_trip() {
        let cell = ModeCell::new();
        assert_eq!(cell.get(), Mode::Off);
        cell.set(Mode::AttackA);
        assert_eq!(cell.get(), Mode::AttackA);
    }
}
