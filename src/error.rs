//! Error types for DNP3 communication
//!
//! The taxonomy follows how failures propagate through the stack:
//!
//! | Class | Variants | Effect |
//! |-------|----------|--------|
//! | Connection | `Connection`, `ConnectionLost`, `Io` | Fatal to the session, surfaced to caller |
//! | Protocol | `Protocol`, `UnknownFunction`, `UnknownObject`, `UnknownQualifier` | Logged and discarded by the layers |
//! | Timeout | `Timeout` | Terminal for one request, session stays usable |
//! | Select/Operate | `SelectOperate`, `CommandFailed` | Reported to the command issuer only |
//! | Rejected | `Rejected` | Outstation set IIN2 error bits; reported to the issuer |

use thiserror::Error;

use crate::app::{FunctionCode, Iin};
use crate::control::CommandStatus;
use crate::point::PointType;

/// Result alias used throughout the crate
pub type Dnp3Result<T> = Result<T, Dnp3Error>;

/// Failures of the two-phase SELECT/OPERATE protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectOperateError {
    /// OPERATE issued without a preceding SELECT
    #[error("point not selected")]
    NotSelected,

    /// The select window closed before OPERATE arrived
    #[error("select expired")]
    Expired,

    /// OPERATE does not reference the selected point and command
    #[error("command mismatch: selected index {selected_index}, operate index {operate_index}")]
    Mismatch {
        selected_index: u16,
        operate_index: u16,
    },

    /// Another request went out between SELECT and OPERATE
    #[error("select seq {select_seq} not followed by operate seq {operate_seq}")]
    OutOfSequence { select_seq: u8, operate_seq: u8 },

    /// The outstation answered the SELECT or OPERATE with a failure status
    #[error("outstation rejected command: {status:?}")]
    Rejected { status: CommandStatus },
}

/// Main error type for DNP3 operations
#[derive(Error, Debug)]
pub enum Dnp3Error {
    /// Transport could not be opened or failed while in use
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The transport closed underneath a pending request
    #[error("Connection lost")]
    ConnectionLost,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame or fragment
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Unknown function code: 0x{code:02X}")]
    UnknownFunction { code: u8 },

    #[error("Unknown object: group {group} variation {variation}")]
    UnknownObject { group: u8, variation: u8 },

    #[error("Unknown qualifier code: 0x{code:02X}")]
    UnknownQualifier { code: u8 },

    /// Request exhausted its retries without a matching response
    #[error("Request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("Select/operate error: {0}")]
    SelectOperate(#[from] SelectOperateError),

    /// The outstation answered with IIN2 request-error bits set
    #[error("Request {function} rejected by outstation: IIN {iin}")]
    Rejected { function: FunctionCode, iin: Iin },

    /// DIRECT_OPERATE answered with a non-success status
    #[error("Command failed with status {status:?}")]
    CommandFailed { status: CommandStatus },

    #[error("Point not found: {point_type:?}[{index}]")]
    NotFound { point_type: PointType, index: u16 },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Process-wide initialization misuse
    #[error("Lifecycle error: {message}")]
    Lifecycle { message: String },
}

impl Dnp3Error {
    pub fn connection(message: impl Into<String>) -> Self {
        Dnp3Error::Connection {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Dnp3Error::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Dnp3Error::InvalidState {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Dnp3Error::Configuration {
            message: message.into(),
        }
    }

    pub fn lifecycle(message: impl Into<String>) -> Self {
        Dnp3Error::Lifecycle {
            message: message.into(),
        }
    }

    pub fn timeout(attempts: u32) -> Self {
        Dnp3Error::Timeout { attempts }
    }

    /// True for errors that end the session (connection class).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Dnp3Error::Connection { .. } | Dnp3Error::ConnectionLost | Dnp3Error::Io(_)
        )
    }

    /// True for errors that leave the session usable.
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal() && !matches!(self, Dnp3Error::Lifecycle { .. })
    }

    /// True for malformed-data errors raised by the link or application layer.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Dnp3Error::Protocol { .. }
                | Dnp3Error::UnknownFunction { .. }
                | Dnp3Error::UnknownObject { .. }
                | Dnp3Error::UnknownQualifier { .. }
        )
    }
}
