//! Preconfigured `CNF` blocks for the oscillators found on MCP2515 breakout
//! boards. Byte order is `[CNF3, CNF2, CNF1]`, the order the block is
//! written over SPI.

use super::registers::CNF;

/// 8 MHz crystal.
pub mod clock_8mhz {
    use super::CNF;

    /// 250 kbit/s, 16 TQ per bit, sampled once.
    pub const CNF_250K_BPS: CNF = CNF::from_bytes([0x05, 0xB1, 0x00]);
}

/// 16 MHz crystal.
pub mod clock_16mhz {
    use super::CNF;

    /// 250 kbit/s, 16 TQ per bit, sampled once.
    pub const CNF_250K_BPS: CNF = CNF::from_bytes([0x85, 0xF1, 0x41]);
}
