//! Shared protocol constants for the gridmon framed transport

// Size of the fixed frame header:
// [u16 code][u16 flags][u32 size][u32 request id][u32 field count]
pub const HEADER_SIZE: usize = 16;

// Current protocol version. Version 2 pads every field to an 8-byte
// boundary; version 1 frames are unpadded per-field with the whole frame
// padded to 8 bytes. Both must stay decodable for older peers.
pub const VERSION: u16 = 2;

// Maximum frame size (8MB) - prevents DoS via memory exhaustion.
// Large enough for bulk object synchronization responses.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

// Default chunk size for raw file-transfer frames
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

// Frame flags (16 bits, network byte order on the wire)
pub mod flags {
    /// Payload is an opaque byte blob (file chunk), not coded fields
    pub const BINARY: u16 = 0x0001;
    /// Last chunk of a file transfer
    pub const END_OF_FILE: u16 = 0x0002;
    /// Terminates a streamed multi-part response
    pub const END_OF_SEQUENCE: u16 = 0x0008;
}

// Field type tags (keep numeric stable for wire compat)
pub mod field_type {
    pub const INT32: u8 = 0;
    pub const STRING: u8 = 1;
    pub const INT64: u8 = 2;
    pub const INT16: u8 = 3;
    pub const BINARY: u8 = 4;
    pub const FLOAT: u8 = 5;
}

// Command codes. Grouped by function; numeric values are part of the wire
// contract and must not be renumbered.
pub mod command {
    // Session management
    pub const LOGIN: u16 = 0x0001;
    pub const KEEPALIVE: u16 = 0x0002;
    pub const GET_SERVER_INFO: u16 = 0x0003;
    pub const REQUEST_COMPLETED: u16 = 0x0004;

    // Encryption handshake. SESSION_KEY frames travel in clear even on an
    // established session; ENCRYPTED_FRAME is the envelope carrying an
    // AEAD-sealed inner frame.
    pub const REQUEST_SESSION_KEY: u16 = 0x0080;
    pub const SESSION_KEY: u16 = 0x0081;
    pub const ENCRYPTED_FRAME: u16 = 0x0087;

    // File transfer
    pub const FILE_UPLOAD: u16 = 0x0020;
    pub const FILE_DATA: u16 = 0x0021;
    pub const ABORT_FILE_TRANSFER: u16 = 0x0022;

    // Server-originated push notifications
    pub const OBJECT_UPDATE: u16 = 0x0040;
    pub const ALARM_UPDATE: u16 = 0x0041;
    pub const EVENT_LOG_RECORD: u16 = 0x0042;
    pub const SYSLOG_RECORD: u16 = 0x0043;
    pub const AUDIT_RECORD: u16 = 0x0044;

    // Subscription management
    pub const SUBSCRIBE: u16 = 0x0050;
    pub const UNSUBSCRIBE: u16 = 0x0051;
}

// Well-known field ids
pub mod field {
    pub const RCC: u32 = 1;
    pub const LOGIN_NAME: u32 = 2;
    pub const PASSWORD: u32 = 3;
    pub const SERVER_VERSION: u32 = 4;
    pub const SERVER_ID: u32 = 5;
    pub const PROTOCOL_VERSION: u32 = 6;
    pub const PUBLIC_KEY: u32 = 7;
    pub const FILE_NAME: u32 = 8;
    pub const FILE_SIZE: u32 = 9;
    pub const NOTIFY_CATEGORY: u32 = 10;
    pub const NOTIFY_CODE: u32 = 11;
    pub const USER_ID: u32 = 12;
    pub const MESSAGE_TEXT: u32 = 13;
}

// Request completion codes carried in the RCC field
pub mod rcc {
    pub const SUCCESS: u32 = 0;
    pub const ACCESS_DENIED: u32 = 1;
    pub const NOT_IMPLEMENTED: u32 = 2;
    pub const TIMEOUT: u32 = 3;
    pub const IO_ERROR: u32 = 4;
    pub const INTERNAL_ERROR: u32 = 5;
    pub const RESOURCE_BUSY: u32 = 6;
    pub const ENCRYPTION_ERROR: u32 = 7;
    pub const OUT_OF_STATE: u32 = 8;
    pub const AUTH_FAILED: u32 = 9;
    pub const INVALID_REQUEST: u32 = 10;
}

// Centralized timeout constants for consistent behavior across the
// server and client session paths
pub mod timeouts {
    use std::time::Duration;

    // Receiver socket-read slice; bounds how long shutdown can go unobserved
    pub const READ_SLICE_MS: u64 = 250;

    // Default timeout for a synchronous request/response exchange
    pub const REQUEST_MS: u64 = 30_000;

    // Default timeout for the session-key handshake
    pub const HANDSHAKE_MS: u64 = 10_000;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 500;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 2;

    // Calculate write deadline based on frame size:
    // 500ms base + 2ms per 1MB (ceil)
    pub fn write_deadline(frame_len: usize) -> Duration {
        let mb = (frame_len as u64 + 1_048_575) / 1_048_576;
        Duration::from_millis(WRITE_BASE_MS + mb * PER_MB_MS)
    }
}

/// Pad a size up to the next 8-byte boundary
#[inline]
pub fn pad8(size: usize) -> usize {
    size + ((8 - (size % 8)) & 7)
}
