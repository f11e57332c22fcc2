//! DNP3 protocol constants based on IEEE 1815
//!
//! These constants fix the wire layout of the three lower layers:
//! - Link frames: 10-byte header, user data split into CRC-protected 16-byte blocks
//! - Transport function: 1 header byte per link frame (FIN/FIR/6-bit sequence)
//! - Application fragments: 2-byte request header, 4-byte response header

// ============================================================================
// Link Layer
// ============================================================================

/// First start byte of every link frame
pub const START1: u8 = 0x05;

/// Second start byte of every link frame
pub const START2: u8 = 0x64;

/// Link header length including its CRC
/// Format: Start(2) + Length(1) + Control(1) + Dest(2) + Src(2) + CRC(2) = 10 bytes
pub const LINK_HEADER_LEN: usize = 10;

/// Size of a CRC-protected user data block
pub const LINK_BLOCK_SIZE: usize = 16;

/// CRC length appended to the header and to every block
pub const CRC_LEN: usize = 2;

/// Maximum link user data (LENGTH field max 255 minus control/dest/src)
pub const MAX_LINK_PAYLOAD: usize = 250;

/// Minimum LENGTH field value (control + dest + src)
pub const MIN_LINK_LENGTH: u8 = 5;

/// Largest possible frame on the wire
///
/// Calculation:
/// - Header with CRC: 10 bytes
/// - 250 bytes of data in 16 blocks (15 full + 1 of 10 bytes): 250 + 16 × 2 = 282
/// - Total: 292 bytes
pub const MAX_LINK_FRAME_LEN: usize = LINK_HEADER_LEN + MAX_LINK_PAYLOAD + 16 * CRC_LEN;

/// Link addresses 0xFFF0..=0xFFFF are reserved (broadcast / self address)
pub const RESERVED_ADDRESS_START: u16 = 0xFFF0;

// ============================================================================
// Transport Function
// ============================================================================

/// FIN bit of the transport header
pub const TRANSPORT_FIN: u8 = 0x80;

/// FIR bit of the transport header
pub const TRANSPORT_FIR: u8 = 0x40;

/// Mask for the 6-bit transport sequence
pub const TRANSPORT_SEQ_MASK: u8 = 0x3F;

/// Application bytes carried by one link frame (250 - transport header)
pub const MAX_SEGMENT_PAYLOAD: usize = MAX_LINK_PAYLOAD - 1;

// ============================================================================
// Application Layer
// ============================================================================

/// Request header: Control(1) + Function(1)
pub const REQUEST_HEADER_LEN: usize = 2;

/// Response header: Control(1) + Function(1) + IIN(2)
pub const RESPONSE_HEADER_LEN: usize = 4;

/// Default maximum application fragment size
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 2048;

/// Application sequence numbers are 4 bits
pub const APP_SEQ_MODULUS: u8 = 16;

/// Object header: Group(1) + Variation(1) + Qualifier(1)
pub const OBJECT_HEADER_LEN: usize = 3;

/// Size of a group 12 variation 1 control relay output block
pub const CROB_SIZE: usize = 11;

/// Size of a 48-bit DNP3 timestamp
pub const DNP_TIME_SIZE: usize = 6;

// ============================================================================
// Default link addresses
// ============================================================================

/// Default master link address
pub const DEFAULT_MASTER_ADDRESS: u16 = 1;

/// Default outstation link address
pub const DEFAULT_OUTSTATION_ADDRESS: u16 = 1024;

/// DNP3 registered TCP port
pub const DEFAULT_DNP3_PORT: u16 = 20000;
