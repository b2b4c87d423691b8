//! Register bitfields for the MCP2515, modeled with [`modular_bitfield`].
//!
//! Only the registers this node touches are modeled. Field order follows the
//! datasheet bit numbering, least significant bit first.

use modular_bitfield::prelude::*;

/// A single-byte MCP2515 register with a fixed SPI address.
pub trait Register {
    const ADDRESS: u8;
}

/// Marker for registers the BIT MODIFY instruction may target.
///
/// Executing BIT MODIFY on any other register forces the mask to `0xFF`.
pub trait Modify {}

macro_rules! register {
    ($Reg:ty, $address:literal) => {
        impl Register for $Reg {
            const ADDRESS: u8 = $address;
        }

        impl From<u8> for $Reg {
            fn from(byte: u8) -> Self {
                <$Reg>::from_bytes([byte])
            }
        }

        impl From<$Reg> for u8 {
            fn from(reg: $Reg) -> Self {
                reg.into_bytes()[0]
            }
        }
    };
}

/// Request operation mode, `CANCTRL.REQOP` / `CANSTAT.OPMOD`.
#[derive(BitfieldSpecifier, Copy, Clone, Debug, PartialEq, Eq)]
#[bits = 3]
pub enum OperationMode {
    NormalOperation = 0b000,
    Sleep = 0b001,
    Loopback = 0b010,
    ListenOnly = 0b011,
    Configuration = 0b100,
}

/// Receive buffer operating mode, `RXBnCTRL.RXM`.
#[derive(BitfieldSpecifier, Copy, Clone, Debug, PartialEq, Eq)]
#[bits = 2]
pub enum RXM {
    Filters = 0b00,
    StandardOnly = 0b01,
    ExtendedOnly = 0b10,
    ReceiveAny = 0b11,
}

/// CAN control register.
#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CANCTRL {
    pub clkpre: B2,
    pub clken: bool,
    pub osm: bool,
    pub abat: bool,
    pub reqop: OperationMode,
}
register!(CANCTRL, 0x0F);
impl Modify for CANCTRL {}

/// CAN status register.
#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CANSTAT {
    #[skip]
    __: B1,
    pub icod: B3,
    #[skip]
    __: B1,
    pub opmod: OperationMode,
}
register!(CANSTAT, 0x0E);

/// Interrupt enable register.
#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CANINTE {
    pub rx0ie: bool,
    pub rx1ie: bool,
    pub tx0ie: bool,
    pub tx1ie: bool,
    pub tx2ie: bool,
    pub errie: bool,
    pub wakie: bool,
    pub merre: bool,
}
register!(CANINTE, 0x2B);
impl Modify for CANINTE {}

/// Interrupt flag register.
#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CANINTF {
    pub rx0if: bool,
    pub rx1if: bool,
    pub tx0if: bool,
    pub tx1if: bool,
    pub tx2if: bool,
    pub errif: bool,
    pub wakif: bool,
    pub merrf: bool,
}
register!(CANINTF, 0x2C);
impl Modify for CANINTF {}

/// Error flag register.
#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EFLG {
    pub ewarn: bool,
    pub rxwar: bool,
    pub txwar: bool,
    pub rxep: bool,
    pub txep: bool,
    pub txbo: bool,
    pub rx0ovr: bool,
    pub rx1ovr: bool,
}
register!(EFLG, 0x2D);
impl Modify for EFLG {}

/// Receive buffer 0 control.
#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RXB0CTRL {
    pub filhit0: bool,
    pub bukt1: bool,
    pub bukt: bool,
    pub rxrtr: bool,
    #[skip]
    __: B1,
    pub rxm: RXM,
    #[skip]
    __: B1,
}
register!(RXB0CTRL, 0x60);
impl Modify for RXB0CTRL {}

/// Receive buffer 1 control.
#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RXB1CTRL {
    pub filhit: B3,
    pub rxrtr: bool,
    #[skip]
    __: B1,
    pub rxm: RXM,
    #[skip]
    __: B1,
}
register!(RXB1CTRL, 0x70);
impl Modify for RXB1CTRL {}

/// The three bit-timing configuration registers, written as one block
/// starting at `CNF3`.
#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CNF {
    // CNF3
    pub phseg2: B3,
    #[skip]
    __: B3,
    pub wakfil: bool,
    pub sof: bool,
    // CNF2
    pub prseg: B3,
    pub phseg1: B3,
    pub sam: bool,
    pub btlmode: bool,
    // CNF1
    pub brp: B6,
    pub sjw: B2,
}

impl CNF {
    /// SPI address of `CNF3`, the first register of the block.
    pub const ADDRESS: u8 = 0x28;
}

/// Response byte of the READ STATUS instruction.
#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadStatusResponse {
    pub rx0if: bool,
    pub rx1if: bool,
    pub txreq0: bool,
    pub tx0if: bool,
    pub txreq1: bool,
    pub tx1if: bool,
    pub txreq2: bool,
    pub tx2if: bool,
}

impl ReadStatusResponse {
    /// Frames loaded and awaiting transmission.
    pub fn pending_tx(&self) -> u8 {
        u8::from(self.txreq0()) + u8::from(self.txreq1()) + u8::from(self.txreq2())
    }

    /// Receive buffers holding an undrained frame.
    pub fn pending_rx(&self) -> u8 {
        u8::from(self.rx0if()) + u8::from(self.rx1if())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canctrl_reqop_occupies_high_bits() {
        let reg = CANCTRL::new().with_reqop(OperationMode::Configuration);
        assert_eq!(u8::from(reg), 0b1000_0000);
    }

    #[test]
    fn eflg_overrun_bits() {
        let reg = EFLG::from(0b1100_0000);
        assert!(reg.rx0ovr());
        assert!(reg.rx1ovr());
        assert!(!reg.txbo());
    }

    #[test]
    fn read_status_counts() {
        let status = ReadStatusResponse::from_bytes([0b0001_0101]);
        assert_eq!(status.pending_tx(), 2);
        assert_eq!(status.pending_rx(), 1);
        assert!(status.txreq0() && status.txreq1() && !status.txreq2());
    }
}
