//! Snapshot digest
//!
//! Nibble-wise, table-driven reflected CRC-32. Peers only ever compare digests
//! with each other, so the table, the nibble order and the final byte swap all
//! have to match the reference node bit for bit.

const CRC_TABLE: [u32; 16] = [
    0x4DBD_F21C, 0x500A_E278, 0x76D3_D2D4, 0x6B64_C2B0,
    0x3B61_B38C, 0x26D6_A3E8, 0x000F_9344, 0x1DB8_8320,
    0xA005_713C, 0xBDB2_6158, 0x9B6B_51F4, 0x86DC_4190,
    0xD6D9_30AC, 0xCB6E_20C8, 0xEDB7_1064, 0xF000_0000,
];

/// Incremental digest state, for callers that feed a snapshot piecewise
/// instead of materializing the whole serialized buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Self { state: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.state;
        for &byte in data {
            // lower nibble, then upper nibble
            crc = (crc >> 4) ^ CRC_TABLE[((crc ^ u32::from(byte)) & 0x0F) as usize];
            crc = (crc >> 4) ^ CRC_TABLE[((crc ^ u32::from(byte >> 4)) & 0x0F) as usize];
        }
        self.state = crc;
    }

    /// Final value, byte-swapped the way the reference node reports it.
    pub fn value(&self) -> u32 {
        self.state.swap_bytes()
    }
}

/// Digest of a contiguous byte range
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.value()
}
