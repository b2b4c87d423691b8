//! On-chip TWAI backend.
//!
//! The peripheral is brought up by the board init (bit timing, pins, mode)
//! and split into its receive and transmit halves before the workers start;
//! rx frames accumulate in the driver's interrupt-fed FIFO until drained
//! here. No bus arbitration is involved, the peripheral is exclusively
//! owned.

use embedded_can::Frame;
use esp_hal::twai::{EspTwaiFrame, TwaiRx, TwaiTx};
use esp_hal::Blocking;

use crate::arbiter::ArbiterTimedOut;
use crate::frame::CanFrame;

use super::{
    Alerts, CanRx, CanTx, ControllerConfig, ControllerStatus, DrainError, FrameBuf, Health,
    OpenFailed, SendOutcome,
};

/// Receive half of the TWAI peripheral.
pub struct TwaiRxLink {
    rx: TwaiRx<'static, Blocking>,
    rx_overruns: u32,
    rx_missed: u32,
}

impl TwaiRxLink {
    pub fn new(rx: TwaiRx<'static, Blocking>) -> Self {
        TwaiRxLink {
            rx,
            rx_overruns: 0,
            rx_missed: 0,
        }
    }
}

impl CanRx for TwaiRxLink {
    async fn open(&mut self, config: &ControllerConfig) -> Result<(), OpenFailed> {
        // Bit timing and mode were fixed when the peripheral was started;
        // the driver's FIFO stands in for `rx_frame_buf_size`.
        log::debug!(
            "twai: open, bitrate={} rx_frame_buf={}",
            config.bitrate,
            config.rx_frame_buf_size
        );
        Ok(())
    }

    async fn drain_into(&mut self, buf: &mut FrameBuf) -> Result<usize, DrainError> {
        let mut appended = 0usize;
        while !buf.is_full() {
            match self.rx.receive() {
                Ok(received) => {
                    if let Some(frame) = CanFrame::new(received.id(), received.data()) {
                        let _ = buf.push(frame);
                        appended += 1;
                    }
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(err)) => {
                    log::warn!("twai: rx error: {:?}", err);
                    self.rx_missed = self.rx_missed.wrapping_add(1);
                    return Err(DrainError::Bus);
                }
            }
        }
        Ok(appended)
    }

    async fn poll_health(&mut self) -> Option<Health> {
        Some(Health {
            alerts: Alerts::empty(),
            status: ControllerStatus {
                msgs_to_tx: 0,
                msgs_to_rx: 0,
                rx_overruns: self.rx_overruns,
                rx_missed: self.rx_missed,
            },
        })
    }
}

/// Transmit half of the TWAI peripheral.
pub struct TwaiTxLink {
    tx: TwaiTx<'static, Blocking>,
}

impl TwaiTxLink {
    pub fn new(tx: TwaiTx<'static, Blocking>) -> Self {
        TwaiTxLink { tx }
    }
}

impl CanTx for TwaiTxLink {
    async fn send_frame(&mut self, frame: &CanFrame) -> Result<SendOutcome, ArbiterTimedOut> {
        let Some(out) = EspTwaiFrame::new(frame.id(), frame.data()) else {
            return Ok(SendOutcome::BusError);
        };
        match self.tx.transmit(&out) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(nb::Error::WouldBlock) => Ok(SendOutcome::Busy),
            Err(nb::Error::Other(err)) => {
                log::warn!("twai: tx error: {:?}", err);
                Ok(SendOutcome::BusError)
            }
        }
    }
}
