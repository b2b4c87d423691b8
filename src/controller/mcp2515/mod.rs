//! SPI-attached MCP2515 backend.
//!
//! Two of these share one SPI host, so the driver never owns the bus: every
//! operation borrows it from the [`SpiArbiter`] for the duration of a single
//! chip transaction. The chip select pin stays with the driver and is only
//! toggled while the bus is held.

use embedded_can::{ExtendedId, Frame, Id, StandardId};
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Duration;

use crate::arbiter::{ArbiterTimedOut, SpiArbiter};
use crate::config::ARBITER_TIMEOUT;
use crate::frame::CanFrame;

use super::{
    Alerts, CanRx, CanTx, ControllerConfig, ControllerStatus, DrainError, FrameBuf, Health,
    OpenFailed, SendOutcome,
};

pub mod bitrates;
pub mod registers;

use registers::*;

/// SPI instruction set of the MCP2515.
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum Instruction {
    /// Resets internal registers to the default state, sets Configuration
    /// mode.
    Reset = 0b1100_0000,
    /// Reads data from the register beginning at the selected address.
    Read = 0b0000_0011,
    /// Writes data to the register beginning at the selected address.
    Write = 0b0000_0010,
    /// Begins the transmission sequence for the buffers named in
    /// `0b1000_0nnn`.
    Rts = 0b1000_0000,
    /// Quick polling command for transmit and receive status bits.
    ReadStatus = 0b1010_0000,
    /// Sets or clears individual bits of a [`Modify`] register.
    BitModify = 0b0000_0101,
    /// Reads a receive buffer from one of the locations in `0b1001_0nm0`;
    /// the buffer's interrupt flag clears when CS rises.
    ReadRxBuffer = 0b1001_0000,
    /// Loads a transmit buffer at one of the locations in `0b0100_0abc`.
    LoadTxBuffer = 0b0100_0000,
}

/// Transmit buffer index.
#[derive(Copy, Clone, Debug)]
pub enum TxBuffer {
    TXB0 = 0,
    TXB1 = 1,
    TXB2 = 2,
}

/// Receive buffer index.
#[derive(Copy, Clone, Debug)]
pub enum RxBuffer {
    RXB0 = 0,
    RXB1 = 1,
}

/// Driver-level failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum McpError<S, C> {
    /// The SPI transfer failed.
    Spi(S),
    /// The chip select pin could not be driven.
    Cs(C),
    /// No bit-timing constants for the requested rate.
    UnsupportedBitrate(u32),
    /// The chip did not enter the requested mode.
    VerifyFailed,
}

/// State of one MCP2515: its chip select line and loss accounting. The SPI
/// bus is passed into each operation by the caller holding the arbiter.
pub struct Mcp2515<CS> {
    cs: CS,
    rx_overruns: u32,
    rx_missed: u32,
}

impl<CS: OutputPin> Mcp2515<CS> {
    pub fn new(cs: CS) -> Self {
        Mcp2515 {
            cs,
            rx_overruns: 0,
            rx_missed: 0,
        }
    }

    /// Runs one chip transaction with CS asserted, deasserting it on every
    /// exit path before the error (if any) is reported.
    fn with_cs<B: SpiBus, R>(
        &mut self,
        bus: &mut B,
        f: impl FnOnce(&mut B) -> Result<R, B::Error>,
    ) -> Result<R, McpError<B::Error, CS::Error>> {
        self.cs.set_low().map_err(McpError::Cs)?;
        let result = f(&mut *bus).and_then(|value| bus.flush().map(|()| value));
        let cs_result = self.cs.set_high().map_err(McpError::Cs);
        let value = result.map_err(McpError::Spi)?;
        cs_result?;
        Ok(value)
    }

    /// Resets internal registers to the default state; the chip comes back
    /// in Configuration mode.
    pub fn reset<B: SpiBus>(&mut self, bus: &mut B) -> Result<(), McpError<B::Error, CS::Error>> {
        self.with_cs(bus, |bus| bus.write(&[Instruction::Reset as u8]))
    }

    /// Read a single register.
    pub fn read_register<B: SpiBus, R: Register + From<u8>>(
        &mut self,
        bus: &mut B,
    ) -> Result<R, McpError<B::Error, CS::Error>> {
        let byte = self.with_cs(bus, |bus| {
            bus.write(&[Instruction::Read as u8, R::ADDRESS])?;
            let mut reg = [0u8];
            bus.read(&mut reg)?;
            Ok(reg[0])
        })?;
        Ok(byte.into())
    }

    /// Write a single register.
    pub fn write_register<B: SpiBus, R: Register + Into<u8>>(
        &mut self,
        bus: &mut B,
        reg: R,
    ) -> Result<(), McpError<B::Error, CS::Error>> {
        let value = reg.into();
        self.with_cs(bus, |bus| {
            bus.write(&[Instruction::Write as u8, R::ADDRESS, value])
        })
    }

    /// Set or clear bits of a [`Modify`] register under `mask`.
    pub fn modify_register<B: SpiBus, R: Register + Modify + Into<u8>>(
        &mut self,
        bus: &mut B,
        reg: R,
        mask: u8,
    ) -> Result<(), McpError<B::Error, CS::Error>> {
        let value = reg.into();
        self.with_cs(bus, |bus| {
            bus.write(&[Instruction::BitModify as u8, R::ADDRESS, mask, value])
        })
    }

    /// Write multiple consecutive registers.
    pub fn write_registers<B: SpiBus>(
        &mut self,
        bus: &mut B,
        start_address: u8,
        data: &[u8],
    ) -> Result<(), McpError<B::Error, CS::Error>> {
        self.with_cs(bus, |bus| {
            bus.write(&[Instruction::Write as u8, start_address])?;
            bus.write(data)
        })
    }

    /// Read the transmit/receive status flags.
    pub fn read_status<B: SpiBus>(
        &mut self,
        bus: &mut B,
    ) -> Result<ReadStatusResponse, McpError<B::Error, CS::Error>> {
        let byte = self.with_cs(bus, |bus| {
            bus.write(&[Instruction::ReadStatus as u8])?;
            let mut buf = [0u8];
            bus.read(&mut buf)?;
            Ok(buf[0])
        })?;
        Ok(ReadStatusResponse::from_bytes([byte]))
    }

    /// Request transmission of the selected buffer.
    pub fn request_to_send<B: SpiBus>(
        &mut self,
        bus: &mut B,
        buf_idx: TxBuffer,
    ) -> Result<(), McpError<B::Error, CS::Error>> {
        self.with_cs(bus, |bus| {
            bus.write(&[Instruction::Rts as u8 | (1 << buf_idx as u8)])
        })
    }

    /// Load the selected transmit buffer with the frame's id header, length
    /// and payload.
    pub fn load_tx_buffer<B: SpiBus>(
        &mut self,
        bus: &mut B,
        buf_idx: TxBuffer,
        frame: &CanFrame,
    ) -> Result<(), McpError<B::Error, CS::Error>> {
        let mut buf = [0u8; 13];
        buf[..4].copy_from_slice(&encode_id(frame.id()));
        buf[4] = frame.dlc() as u8;
        buf[5..5 + frame.dlc()].copy_from_slice(frame.data());
        let used = 5 + frame.dlc();
        self.with_cs(bus, |bus| {
            bus.write(&[Instruction::LoadTxBuffer as u8 | (buf_idx as u8 * 2)])?;
            bus.write(&buf[..used])
        })
    }

    /// Read a frame out of the selected receive buffer. The buffer's
    /// interrupt flag clears when CS rises at the end of the instruction.
    pub fn read_rx_buffer<B: SpiBus>(
        &mut self,
        bus: &mut B,
        buf_idx: RxBuffer,
    ) -> Result<CanFrame, McpError<B::Error, CS::Error>> {
        let (header, data) = self.with_cs(bus, |bus| {
            bus.write(&[Instruction::ReadRxBuffer as u8 | (buf_idx as u8 * 2)])?;
            let mut header = [0u8; 5];
            bus.read(&mut header)?;
            let dlc = usize::from(header[4] & 0x0F).min(8);
            let mut data = [0u8; 8];
            bus.read(&mut data[..dlc])?;
            Ok((header, data))
        })?;
        let dlc = usize::from(header[4] & 0x0F).min(8);
        let id = decode_id([header[0], header[1], header[2], header[3]]);
        // Both constraints were just enforced, so this cannot fail.
        CanFrame::new(id, &data[..dlc]).ok_or(McpError::VerifyFailed)
    }

    /// Next pending received frame, if any.
    pub fn poll_frame<B: SpiBus>(
        &mut self,
        bus: &mut B,
    ) -> Result<Option<CanFrame>, McpError<B::Error, CS::Error>> {
        let status = self.read_status(bus)?;
        if status.rx0if() {
            self.read_rx_buffer(bus, RxBuffer::RXB0).map(Some)
        } else if status.rx1if() {
            self.read_rx_buffer(bus, RxBuffer::RXB1).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Hand one frame to the chip, cascading across the three transmit
    /// buffers. `Busy` when all of them hold a pending frame.
    pub fn send_frame<B: SpiBus>(
        &mut self,
        bus: &mut B,
        frame: &CanFrame,
    ) -> Result<SendOutcome, McpError<B::Error, CS::Error>> {
        let status = self.read_status(bus)?;
        let buf_idx = if !status.txreq0() {
            TxBuffer::TXB0
        } else if !status.txreq1() {
            TxBuffer::TXB1
        } else if !status.txreq2() {
            TxBuffer::TXB2
        } else {
            return Ok(SendOutcome::Busy);
        };
        self.load_tx_buffer(bus, buf_idx, frame)?;
        self.request_to_send(bus, buf_idx)?;
        Ok(SendOutcome::Sent)
    }

    /// Read the error flags, folding receive overruns into the running
    /// counter and clearing them on the chip.
    pub fn error_flags<B: SpiBus>(
        &mut self,
        bus: &mut B,
    ) -> Result<EFLG, McpError<B::Error, CS::Error>> {
        let eflg: EFLG = self.read_register(bus)?;
        let overruns = u32::from(eflg.rx0ovr()) + u32::from(eflg.rx1ovr());
        if overruns > 0 {
            self.rx_overruns = self.rx_overruns.wrapping_add(overruns);
            self.modify_register(bus, EFLG::new(), 0b1100_0000)?;
        }
        Ok(eflg)
    }

    /// Bring the chip up in listen-and-send: receive everything into both
    /// buffers with rollover, transmission allowed.
    pub fn open<B: SpiBus>(
        &mut self,
        bus: &mut B,
        config: &ControllerConfig,
    ) -> Result<(), McpError<B::Error, CS::Error>> {
        let cnf = match config.bitrate {
            250_000 => bitrates::clock_8mhz::CNF_250K_BPS,
            other => return Err(McpError::UnsupportedBitrate(other)),
        };
        self.reset(bus)?;
        self.write_registers(bus, CNF::ADDRESS, &cnf.into_bytes())?;
        self.write_register(
            bus,
            RXB0CTRL::new().with_rxm(RXM::ReceiveAny).with_bukt(true),
        )?;
        self.write_register(bus, RXB1CTRL::new().with_rxm(RXM::ReceiveAny))?;
        self.write_register(bus, CANINTE::new().with_rx0ie(true).with_rx1ie(true))?;
        self.modify_register(
            bus,
            CANCTRL::new().with_reqop(OperationMode::NormalOperation),
            0b1110_0000,
        )?;
        let canstat: CANSTAT = self.read_register(bus)?;
        if canstat.opmod() != OperationMode::NormalOperation {
            return Err(McpError::VerifyFailed);
        }
        Ok(())
    }
}

/// One MCP2515 shared between its rx and tx workers.
///
/// The device lock is only ever taken while the arbiter holds the bus, so it
/// never blocks; it exists to hand each worker a `&mut` view soundly.
pub struct SharedMcp2515<'a, B, CS> {
    arbiter: &'a SpiArbiter<B>,
    dev: &'a Mutex<CriticalSectionRawMutex, Mcp2515<CS>>,
}

impl<'a, B, CS> Clone for SharedMcp2515<'a, B, CS> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, B, CS> Copy for SharedMcp2515<'a, B, CS> {}

impl<'a, B: SpiBus, CS: OutputPin> SharedMcp2515<'a, B, CS> {
    pub fn new(
        arbiter: &'a SpiArbiter<B>,
        dev: &'a Mutex<CriticalSectionRawMutex, Mcp2515<CS>>,
    ) -> Self {
        SharedMcp2515 { arbiter, dev }
    }

    /// The rx-worker view.
    pub fn rx(self) -> McpRx<'a, B, CS> {
        McpRx { shared: self }
    }

    /// The tx-worker view.
    pub fn tx(self) -> McpTx<'a, B, CS> {
        McpTx { shared: self }
    }

    async fn with_device<R>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&mut B, &mut Mcp2515<CS>) -> R,
    ) -> Result<R, ArbiterTimedOut> {
        let result = self
            .arbiter
            .with_bus(timeout, |bus| match self.dev.try_lock() {
                Ok(mut dev) => Some(f(bus, &mut dev)),
                Err(_) => None,
            })
            .await?;
        result.ok_or(ArbiterTimedOut)
    }
}

/// Receive half of a shared MCP2515.
pub struct McpRx<'a, B, CS> {
    shared: SharedMcp2515<'a, B, CS>,
}

/// Transmit half of a shared MCP2515.
pub struct McpTx<'a, B, CS> {
    shared: SharedMcp2515<'a, B, CS>,
}

impl<'a, B: SpiBus, CS: OutputPin> CanRx for McpRx<'a, B, CS> {
    async fn open(&mut self, config: &ControllerConfig) -> Result<(), OpenFailed> {
        match self
            .shared
            .with_device(ARBITER_TIMEOUT, |bus, dev| dev.open(bus, config))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                log::error!("mcp2515: open failed: {:?}", err);
                Err(OpenFailed)
            }
            Err(ArbiterTimedOut) => {
                log::error!("mcp2515: open failed: arbiter timed out");
                Err(OpenFailed)
            }
        }
    }

    async fn drain_into(&mut self, buf: &mut FrameBuf) -> Result<usize, DrainError> {
        let drained = self
            .shared
            .with_device(ARBITER_TIMEOUT, |bus, dev| {
                let mut appended = 0usize;
                while !buf.is_full() {
                    match dev.poll_frame(bus) {
                        Ok(Some(frame)) => {
                            let _ = buf.push(frame);
                            appended += 1;
                        }
                        Ok(None) => return Ok(appended),
                        Err(err) => {
                            log::warn!("mcp2515: rx transfer failed: {:?}", err);
                            dev.rx_missed = dev.rx_missed.wrapping_add(1);
                            return Err(appended);
                        }
                    }
                }
                Ok(appended)
            })
            .await?;
        drained.map_err(|_partial| DrainError::Bus)
    }

    async fn poll_health(&mut self) -> Option<Health> {
        self.shared
            .with_device(ARBITER_TIMEOUT, |bus, dev| {
                let eflg = dev.error_flags(bus).ok()?;
                let status = dev.read_status(bus).ok()?;
                Some(Health {
                    alerts: alerts_from_eflg(eflg),
                    status: ControllerStatus {
                        msgs_to_tx: status.pending_tx(),
                        msgs_to_rx: status.pending_rx(),
                        rx_overruns: dev.rx_overruns,
                        rx_missed: dev.rx_missed,
                    },
                })
            })
            .await
            .ok()
            .flatten()
    }
}

impl<'a, B: SpiBus, CS: OutputPin> CanTx for McpTx<'a, B, CS> {
    async fn send_frame(&mut self, frame: &CanFrame) -> Result<SendOutcome, ArbiterTimedOut> {
        let outcome = self
            .shared
            .with_device(ARBITER_TIMEOUT, |bus, dev| dev.send_frame(bus, frame))
            .await?;
        Ok(outcome.unwrap_or_else(|err| {
            log::warn!("mcp2515: tx transfer failed: {:?}", err);
            SendOutcome::BusError
        }))
    }
}

fn alerts_from_eflg(eflg: EFLG) -> Alerts {
    let mut alerts = Alerts::empty();
    alerts.set(Alerts::ERROR_WARNING, eflg.ewarn());
    alerts.set(Alerts::RX_WARNING, eflg.rxwar());
    alerts.set(Alerts::TX_WARNING, eflg.txwar());
    alerts.set(Alerts::RX_ERROR_PASSIVE, eflg.rxep());
    alerts.set(Alerts::TX_ERROR_PASSIVE, eflg.txep());
    alerts.set(Alerts::BUS_OFF, eflg.txbo());
    alerts.set(Alerts::RX_OVERRUN, eflg.rx0ovr() || eflg.rx1ovr());
    alerts
}

/// Pack a CAN id into the `[SIDH, SIDL, EID8, EID0]` header layout.
fn encode_id(id: Id) -> [u8; 4] {
    match id {
        Id::Standard(sid) => {
            let raw = sid.as_raw();
            [(raw >> 3) as u8, ((raw & 0x7) as u8) << 5, 0, 0]
        }
        Id::Extended(eid) => {
            let raw = eid.as_raw();
            let sid = (raw >> 18) as u16;
            let eid18 = raw & 0x3FFFF;
            [
                (sid >> 3) as u8,
                (((sid & 0x7) as u8) << 5) | 0x08 | ((eid18 >> 16) as u8),
                (eid18 >> 8) as u8,
                eid18 as u8,
            ]
        }
    }
}

/// Inverse of [`encode_id`].
fn decode_id(header: [u8; 4]) -> Id {
    let sid = (u16::from(header[0]) << 3) | u16::from(header[1] >> 5);
    if header[1] & 0x08 != 0 {
        let eid18 = (u32::from(header[1] & 0x03) << 16)
            | (u32::from(header[2]) << 8)
            | u32::from(header[3]);
        let raw = (u32::from(sid) << 18) | eid18;
        // 11 + 18 bits always fit the extended range.
        match ExtendedId::new(raw) {
            Some(id) => Id::Extended(id),
            None => Id::Extended(ExtendedId::ZERO),
        }
    } else {
        match StandardId::new(sid) {
            Some(id) => Id::Standard(id),
            None => Id::Standard(StandardId::ZERO),
        }
    }
}
