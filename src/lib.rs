//! # Voltage DNP3 - Async DNP3 Master and Outstation Library
//!
//! A DNP3 (IEEE 1815) implementation over TCP in pure Rust, built on Tokio.
//! Both ends of the protocol are provided: a master that polls and controls
//! outstations, and an outstation that serves a point database.
//!
//! ## Features
//!
//! - **Full stack**: link frames with CRC blocks, transport segmentation,
//!   application fragments with object headers
//! - **Master**: integrity/class/range polls, select-before-operate, direct
//!   operate, unsolicited handling, time synchronization
//! - **Outstation**: event buffer with confirmation, unsolicited reporting,
//!   select/operate validation, IIN handling
//! - **Runtime-adjustable diagnostics** routed through `tracing`
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Master | Outstation |
//! |------|----------|--------|------------|
//! | 0x00 | Confirm | ✅ | ✅ |
//! | 0x01 | Read | ✅ | ✅ |
//! | 0x02 | Write | ✅ | ✅ |
//! | 0x03 | Select | ✅ | ✅ |
//! | 0x04 | Operate | ✅ | ✅ |
//! | 0x05 | Direct Operate | ✅ | ✅ |
//! | 0x06 | Direct Operate No Ack | ✅ | ✅ |
//! | 0x14 | Enable Unsolicited | ✅ | ✅ |
//! | 0x15 | Disable Unsolicited | ✅ | ✅ |
//! | 0x17 | Delay Measure | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_dnp3::{
//!     ControlRelayOutputBlock, Dnp3Result, MasterConfig, MasterHandle, PointType,
//!     TransportSettings,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Dnp3Result<()> {
//!     voltage_dnp3::initialize()?;
//!
//!     let config = MasterConfig::new(TransportSettings::new("127.0.0.1", 20000));
//!     let master = MasterHandle::open(config).await?;
//!
//!     master.integrity_poll().await?;
//!     for point in master.points().points_of(PointType::AnalogInput) {
//!         println!("AI[{}] = {}", point.index, point.value);
//!     }
//!
//!     master
//!         .select_and_operate(3, ControlRelayOutputBlock::latch_on())
//!         .await?;
//!
//!     master.close().await?;
//!     voltage_dnp3::shutdown();
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Protocol constants
pub mod constants;

/// Filter-level diagnostics on top of `tracing`
pub mod logging;

/// Process-wide initialization and teardown
pub mod runtime;

/// Byte transports (TCP, in-memory streams)
pub mod transport;

// ============================================================================
// Protocol layers
// ============================================================================

/// Link layer frames and CRC
pub mod link;

/// Transport function and per-connection link channel
pub mod segment;

/// Application fragments, function codes and IIN
pub mod app;

/// Object headers and point encodings
pub mod object;

/// Output commands and select tracking
pub mod control;

// ============================================================================
// Data model and sessions
// ============================================================================

/// Point values and metadata
pub mod point;

/// Shared point database
pub mod database;

/// Session state machine and configuration
pub mod session;

/// Master session
pub mod master;

/// Outstation session
pub mod outstation;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_dnp3::tokio) ===
pub use tokio;

// === Sessions ===
pub use master::{MasterConfig, MasterHandle, Response};
pub use outstation::{
    ControlHandler, DatabaseControlHandler, Event, EventBuffer, OutstationConfig,
    OutstationHandle, OutstationServer,
};
pub use session::{SessionConfig, SessionState};

// === Error handling ===
pub use error::{Dnp3Error, Dnp3Result, SelectOperateError};

// === Core types ===
pub use app::{FunctionCode, Iin};
pub use control::{
    AnalogOutputCommand, CommandStatus, ControlRelayOutputBlock, OpType, OutputCommand,
    TripCloseCode,
};
pub use database::{PointDatabase, PointReader};
pub use object::Variation;
pub use point::{DnpTime, EventClass, Flags, Point, PointType, PointValue};

// === Transport ===
pub use transport::{Dnp3Transport, StreamTransport, TcpTransport, TransportSettings, TransportStats};

// === Logging ===
pub use logging::{Diagnostics, FilterLevel, LogCallback};

// === Lifecycle ===
pub use runtime::{initialize, is_initialized, shutdown};

/// Default response and connect timeout (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default number of retries after a response timeout
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage DNP3 v{} - Async DNP3 master and outstation library", VERSION)
}
