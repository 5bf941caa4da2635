//! Shared protocol constants for the treesync framed transport

// Protocol header constants
pub const MAGIC: u32 = 0xace0_ace0;
pub const VERSION: u16 = 0;

/// Fixed frame header size on the wire
pub const HEADER_LEN: usize = 16;

// Maximum frame payload size (1MB). Longer messages are split across frames.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// Hard ceiling of the 22-bit frame length field
pub const FRAME_LEN_FIELD_MAX: usize = (1 << 22) - 1;

// Default cap on a reassembled message (one whole file travels as one message)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

/// Well-known listen port
pub const DEFAULT_PORT: u16 = 55443;

/// Longest relative path, counting the terminating NUL it carries on the wire
pub const MAX_PATH_LEN: usize = 256;

/// Snapshot capacity used when nothing else is configured
pub const MAX_FILES: usize = 1024 * 256;

/// Server-side connection slots
pub const MAX_CONNECTIONS: usize = 16;

/// Every Nth server tick does a full rescan instead of a refresh
pub const RESCAN_CYCLE: u64 = 5;

/// Message type codes (keep numeric stable for compat with the reference node)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// srv -> cli, snapshot digest push
    MetaDigest = 0,
    /// cli -> srv
    MetaRequest = 1,
    /// srv -> cli, full snapshot
    MetaResponse = 2,
    /// cli -> srv, one relative name
    FileRequest = 3,
    /// srv -> cli, status + file bytes
    FileResponse = 4,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::MetaDigest),
            1 => Some(Self::MetaRequest),
            2 => Some(Self::MetaResponse),
            3 => Some(Self::FileRequest),
            4 => Some(Self::FileResponse),
            _ => None,
        }
    }
}

// Centralized timing constants for the async transport
pub mod timeouts {
    // Delay before the first timer tick (ms)
    pub const FIRST_TICK_MS: u64 = 1000;

    // Default tick period (ms)
    pub const TICK_MS: u64 = 1000;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5000;

    // Reconnect backoff bounds (ms)
    pub const RECONNECT_MIN_MS: u64 = 250;
    pub const RECONNECT_MAX_MS: u64 = 10_000;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 5000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 50;

    // Calculate write deadline based on payload size (ms)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64).div_ceil(1_048_576);
        WRITE_BASE_MS + mb * PER_MB_MS
    }

    // Exponential reconnect backoff, capped
    pub fn reconnect_delay_ms(attempt: u32) -> u64 {
        RECONNECT_MIN_MS
            .saturating_mul(1u64 << attempt.min(16))
            .min(RECONNECT_MAX_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes() {
        for code in 0u8..5 {
            let t = MessageType::from_u8(code).unwrap();
            assert_eq!(t as u8, code);
        }
        assert_eq!(MessageType::from_u8(5), None);
        assert_eq!(MessageType::from_u8(0xff), None);
    }

    #[test]
    fn test_frame_cap_fits_length_field() {
        assert!(MAX_FRAME_SIZE <= FRAME_LEN_FIELD_MAX);
    }

    #[test]
    fn test_deadlines() {
        use timeouts::*;
        assert_eq!(write_deadline_ms(0), WRITE_BASE_MS);
        assert_eq!(write_deadline_ms(1), WRITE_BASE_MS + PER_MB_MS);
        assert_eq!(write_deadline_ms(3 * 1_048_576), WRITE_BASE_MS + 3 * PER_MB_MS);
        assert_eq!(reconnect_delay_ms(0), RECONNECT_MIN_MS);
        assert_eq!(reconnect_delay_ms(1), 2 * RECONNECT_MIN_MS);
        assert_eq!(reconnect_delay_ms(30), RECONNECT_MAX_MS);
    }
}
