//! Output commands and select tracking
//!
//! Binary outputs are driven by a control relay output block (group 12
//! variation 1), analog outputs by an analog output block (group 41). Both go
//! through the same SELECT / OPERATE / DIRECT_OPERATE functions.
//!
//! ```text
//! CROB (11 bytes)
//! +------+-------+----------+-----------+--------+
//! | code | count | on-time  | off-time  | status |
//! +------+-------+----------+-----------+--------+
//!    1       1    4 (u32 LE)  4 (u32 LE)     1
//!
//! code: bits 0-3 op type, bit 4 queue, bit 5 clear, bits 6-7 trip/close
//! ```

use std::time::Duration;

use tokio::time::Instant;

use crate::constants::{APP_SEQ_MODULUS, CROB_SIZE};
use crate::error::{Dnp3Error, Dnp3Result, SelectOperateError};
use crate::point::{PointType, PointValue};

// ============================================================================
// Command status
// ============================================================================

/// Status returned by the outstation for each command object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandStatus {
    Success,
    Timeout,
    NoSelect,
    FormatError,
    NotSupported,
    AlreadyActive,
    HardwareError,
    Local,
    TooManyOps,
    NotAuthorized,
    AutomationInhibit,
    ProcessingLimited,
    OutOfRange,
    DownstreamLocal,
    AlreadyComplete,
    Blocked,
    Cancelled,
    BlockedOtherMaster,
    DownstreamFail,
    NonParticipating,
    Undefined,
}

impl CommandStatus {
    pub fn to_u8(self) -> u8 {
        match self {
            CommandStatus::Success => 0,
            CommandStatus::Timeout => 1,
            CommandStatus::NoSelect => 2,
            CommandStatus::FormatError => 3,
            CommandStatus::NotSupported => 4,
            CommandStatus::AlreadyActive => 5,
            CommandStatus::HardwareError => 6,
            CommandStatus::Local => 7,
            CommandStatus::TooManyOps => 8,
            CommandStatus::NotAuthorized => 9,
            CommandStatus::AutomationInhibit => 10,
            CommandStatus::ProcessingLimited => 11,
            CommandStatus::OutOfRange => 12,
            CommandStatus::DownstreamLocal => 13,
            CommandStatus::AlreadyComplete => 14,
            CommandStatus::Blocked => 15,
            CommandStatus::Cancelled => 16,
            CommandStatus::BlockedOtherMaster => 17,
            CommandStatus::DownstreamFail => 18,
            CommandStatus::NonParticipating => 126,
            CommandStatus::Undefined => 127,
        }
    }

    /// Decode the low 7 bits of a status byte
    pub fn from_u8(value: u8) -> Dnp3Result<Self> {
        let status = match value & 0x7F {
            0 => CommandStatus::Success,
            1 => CommandStatus::Timeout,
            2 => CommandStatus::NoSelect,
            3 => CommandStatus::FormatError,
            4 => CommandStatus::NotSupported,
            5 => CommandStatus::AlreadyActive,
            6 => CommandStatus::HardwareError,
            7 => CommandStatus::Local,
            8 => CommandStatus::TooManyOps,
            9 => CommandStatus::NotAuthorized,
            10 => CommandStatus::AutomationInhibit,
            11 => CommandStatus::ProcessingLimited,
            12 => CommandStatus::OutOfRange,
            13 => CommandStatus::DownstreamLocal,
            14 => CommandStatus::AlreadyComplete,
            15 => CommandStatus::Blocked,
            16 => CommandStatus::Cancelled,
            17 => CommandStatus::BlockedOtherMaster,
            18 => CommandStatus::DownstreamFail,
            126 => CommandStatus::NonParticipating,
            127 => CommandStatus::Undefined,
            other => {
                return Err(Dnp3Error::protocol(format!(
                    "Unknown command status {}",
                    other
                )))
            }
        };
        Ok(status)
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        *self == CommandStatus::Success
    }
}

// ============================================================================
// CROB
// ============================================================================

/// CROB operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Nul,
    PulseOn,
    PulseOff,
    LatchOn,
    LatchOff,
}

impl OpType {
    pub fn to_bits(self) -> u8 {
        match self {
            OpType::Nul => 0,
            OpType::PulseOn => 1,
            OpType::PulseOff => 2,
            OpType::LatchOn => 3,
            OpType::LatchOff => 4,
        }
    }

    pub fn from_bits(bits: u8) -> Dnp3Result<Self> {
        match bits {
            0 => Ok(OpType::Nul),
            1 => Ok(OpType::PulseOn),
            2 => Ok(OpType::PulseOff),
            3 => Ok(OpType::LatchOn),
            4 => Ok(OpType::LatchOff),
            _ => Err(Dnp3Error::protocol(format!("Unknown CROB op type {}", bits))),
        }
    }
}

/// CROB trip/close code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TripCloseCode {
    Nul,
    Close,
    Trip,
}

impl TripCloseCode {
    pub fn to_bits(self) -> u8 {
        match self {
            TripCloseCode::Nul => 0,
            TripCloseCode::Close => 1,
            TripCloseCode::Trip => 2,
        }
    }

    pub fn from_bits(bits: u8) -> Dnp3Result<Self> {
        match bits {
            0 => Ok(TripCloseCode::Nul),
            1 => Ok(TripCloseCode::Close),
            2 => Ok(TripCloseCode::Trip),
            _ => Err(Dnp3Error::protocol("Reserved trip/close code")),
        }
    }
}

/// Control relay output block (g12v1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlRelayOutputBlock {
    pub op_type: OpType,
    pub tcc: TripCloseCode,
    pub clear: bool,
    pub queue: bool,
    pub count: u8,
    pub on_time_ms: u32,
    pub off_time_ms: u32,
    pub status: CommandStatus,
}

impl ControlRelayOutputBlock {
    pub fn new(op_type: OpType) -> Self {
        Self {
            op_type,
            tcc: TripCloseCode::Nul,
            clear: false,
            queue: false,
            count: 1,
            on_time_ms: 0,
            off_time_ms: 0,
            status: CommandStatus::Success,
        }
    }

    pub fn latch_on() -> Self {
        Self::new(OpType::LatchOn)
    }

    pub fn latch_off() -> Self {
        Self::new(OpType::LatchOff)
    }

    pub fn pulse_on(on_time_ms: u32, off_time_ms: u32) -> Self {
        Self {
            on_time_ms,
            off_time_ms,
            ..Self::new(OpType::PulseOn)
        }
    }

    pub fn with_tcc(mut self, tcc: TripCloseCode) -> Self {
        self.tcc = tcc;
        self
    }

    pub fn with_status(mut self, status: CommandStatus) -> Self {
        self.status = status;
        self
    }

    pub fn control_code(&self) -> u8 {
        let mut code = self.op_type.to_bits() | (self.tcc.to_bits() << 6);
        if self.queue {
            code |= 0x10;
        }
        if self.clear {
            code |= 0x20;
        }
        code
    }

    /// Output state this command drives the point to, if it names one
    pub fn commanded_state(&self) -> Option<bool> {
        match self.tcc {
            TripCloseCode::Close => return Some(true),
            TripCloseCode::Trip => return Some(false),
            TripCloseCode::Nul => {}
        }
        match self.op_type {
            OpType::LatchOn | OpType::PulseOn => Some(true),
            OpType::LatchOff | OpType::PulseOff => Some(false),
            OpType::Nul => None,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.control_code());
        out.push(self.count);
        out.extend_from_slice(&self.on_time_ms.to_le_bytes());
        out.extend_from_slice(&self.off_time_ms.to_le_bytes());
        out.push(self.status.to_u8());
    }

    pub fn decode(bytes: &[u8]) -> Dnp3Result<Self> {
        if bytes.len() < CROB_SIZE {
            return Err(Dnp3Error::protocol("Truncated CROB"));
        }
        let code = bytes[0];
        Ok(Self {
            op_type: OpType::from_bits(code & 0x0F)?,
            tcc: TripCloseCode::from_bits(code >> 6)?,
            queue: code & 0x10 != 0,
            clear: code & 0x20 != 0,
            count: bytes[1],
            on_time_ms: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            off_time_ms: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            status: CommandStatus::from_u8(bytes[10])?,
        })
    }
}

// ============================================================================
// Analog output
// ============================================================================

/// Analog output block (g41); the wire width comes from the variation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogOutputCommand {
    pub value: f64,
    pub status: CommandStatus,
}

impl AnalogOutputCommand {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            status: CommandStatus::Success,
        }
    }

    pub fn with_status(mut self, status: CommandStatus) -> Self {
        self.status = status;
        self
    }
}

/// Either kind of output command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputCommand {
    Crob(ControlRelayOutputBlock),
    Analog(AnalogOutputCommand),
}

impl OutputCommand {
    /// Output point type this command targets
    pub fn point_type(&self) -> PointType {
        match self {
            OutputCommand::Crob(_) => PointType::BinaryOutput,
            OutputCommand::Analog(_) => PointType::AnalogOutput,
        }
    }

    pub fn status(&self) -> CommandStatus {
        match self {
            OutputCommand::Crob(c) => c.status,
            OutputCommand::Analog(a) => a.status,
        }
    }

    pub fn with_status(self, status: CommandStatus) -> Self {
        match self {
            OutputCommand::Crob(c) => OutputCommand::Crob(c.with_status(status)),
            OutputCommand::Analog(a) => OutputCommand::Analog(a.with_status(status)),
        }
    }

    /// Same command, disregarding the status byte
    pub fn same_command(&self, other: &OutputCommand) -> bool {
        self.with_status(CommandStatus::Success) == other.with_status(CommandStatus::Success)
    }

    /// Value the output point takes when the command executes
    pub fn commanded_value(&self) -> Option<PointValue> {
        match self {
            OutputCommand::Crob(c) => c.commanded_state().map(PointValue::Binary),
            OutputCommand::Analog(a) => Some(PointValue::Analog(a.value)),
        }
    }
}

impl From<ControlRelayOutputBlock> for OutputCommand {
    fn from(crob: ControlRelayOutputBlock) -> Self {
        OutputCommand::Crob(crob)
    }
}

impl From<AnalogOutputCommand> for OutputCommand {
    fn from(command: AnalogOutputCommand) -> Self {
        OutputCommand::Analog(command)
    }
}

// ============================================================================
// Select tracking
// ============================================================================

/// An armed SELECT
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub index: u16,
    pub command: OutputCommand,
    /// Application sequence number the SELECT went out with
    pub seq: u8,
    pub deadline: Instant,
}

impl Selection {
    /// Sequence number the matching OPERATE must carry
    pub fn operate_seq(&self) -> u8 {
        (self.seq + 1) % APP_SEQ_MODULUS
    }
}

/// Per-session select state.
///
/// Cleared on OPERATE completion, on expiry and on session close. A mismatched
/// OPERATE leaves the selection armed. Once any other request has used the
/// sequence number after the SELECT, the outstation can no longer accept the
/// OPERATE and the selection is dropped.
#[derive(Debug, Default)]
pub struct SelectState {
    current: Option<Selection>,
}

impl SelectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(
        &mut self,
        index: u16,
        command: OutputCommand,
        seq: u8,
        window: Duration,
        now: Instant,
    ) {
        self.current = Some(Selection {
            index,
            command,
            seq,
            deadline: now + window,
        });
    }

    /// Validate an OPERATE that would be sent with sequence number `seq`
    pub fn check(
        &mut self,
        index: u16,
        command: &OutputCommand,
        seq: u8,
        now: Instant,
    ) -> Result<Selection, SelectOperateError> {
        let selection = self.current.ok_or(SelectOperateError::NotSelected)?;
        if now >= selection.deadline {
            self.current = None;
            return Err(SelectOperateError::Expired);
        }
        if seq != selection.operate_seq() {
            self.current = None;
            return Err(SelectOperateError::OutOfSequence {
                select_seq: selection.seq,
                operate_seq: seq,
            });
        }
        if selection.index != index || !selection.command.same_command(command) {
            return Err(SelectOperateError::Mismatch {
                selected_index: selection.index,
                operate_index: index,
            });
        }
        Ok(selection)
    }

    pub fn current(&self) -> Option<&Selection> {
        self.current.as_ref()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}
