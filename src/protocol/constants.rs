//! Participant RPC protocol constants

/// Bumped whenever a message layout changes
pub const PROTOCOL_VERSION: u16 = 1;

/// Length of the frame header (payload length, u32 little-endian)
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload accepted in either direction
pub const MAX_FRAME_LEN: usize = 1024 * 1024; // 1 MB

/// Length of the server's handshake challenge
pub const NONCE_LEN: usize = 32;

/// Default port for participant servers
pub const DEFAULT_PORT: u16 = 7400;
