//! Point data model
//!
//! A [`Point`] is the current value of one indexed input or output together
//! with its quality flags and timestamp.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};

/// Kind of point; together with the index it identifies a database entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PointType {
    BinaryInput,
    BinaryOutput,
    AnalogInput,
    AnalogOutput,
    Counter,
}

impl PointType {
    pub const ALL: [PointType; 5] = [
        PointType::BinaryInput,
        PointType::BinaryOutput,
        PointType::Counter,
        PointType::AnalogInput,
        PointType::AnalogOutput,
    ];

    /// True for types whose value is a single bit
    pub fn is_binary(&self) -> bool {
        matches!(self, PointType::BinaryInput | PointType::BinaryOutput)
    }
}

impl fmt::Display for PointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PointType::BinaryInput => "BinaryInput",
            PointType::BinaryOutput => "BinaryOutput",
            PointType::AnalogInput => "AnalogInput",
            PointType::AnalogOutput => "AnalogOutput",
            PointType::Counter => "Counter",
        };
        f.write_str(name)
    }
}

/// Point value. The variant must agree with the point type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    Binary(bool),
    Analog(f64),
    Counter(u32),
}

impl PointValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PointValue::Binary(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            PointValue::Binary(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            PointValue::Analog(v) => *v,
            PointValue::Counter(v) => f64::from(*v),
        }
    }

    /// True if this value variant belongs to `point_type`
    pub fn matches(&self, point_type: PointType) -> bool {
        match self {
            PointValue::Binary(_) => point_type.is_binary(),
            PointValue::Analog(_) => matches!(
                point_type,
                PointType::AnalogInput | PointType::AnalogOutput
            ),
            PointValue::Counter(_) => point_type == PointType::Counter,
        }
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Binary(b) => write!(f, "{}", b),
            PointValue::Analog(v) => write!(f, "{}", v),
            PointValue::Counter(v) => write!(f, "{}", v),
        }
    }
}

/// Quality flags byte as carried on the wire.
///
/// For binary objects bit 7 holds the state and is masked out here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const ONLINE: u8 = 0x01;
    pub const RESTART: u8 = 0x02;
    pub const COMM_LOST: u8 = 0x04;
    pub const REMOTE_FORCED: u8 = 0x08;
    pub const LOCAL_FORCED: u8 = 0x10;
    /// Chatter filter (binary) / rollover (counter) / over-range (analog)
    pub const BIT5: u8 = 0x20;
    /// Discontinuity (counter) / reference error (analog)
    pub const BIT6: u8 = 0x40;
    /// State bit of binary objects
    pub const STATE: u8 = 0x80;

    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn online() -> Self {
        Self(Self::ONLINE)
    }

    #[inline]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(&self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    pub const fn is_online(&self) -> bool {
        self.contains(Self::ONLINE)
    }

    /// Split a binary flags byte into (quality, state)
    pub const fn split_binary(raw: u8) -> (Flags, bool) {
        (Flags(raw & !Self::STATE), raw & Self::STATE != 0)
    }

    /// Combine quality and state into a binary flags byte
    pub const fn with_state(&self, state: bool) -> u8 {
        if state {
            (self.0 & !Self::STATE) | Self::STATE
        } else {
            self.0 & !Self::STATE
        }
    }
}

/// DNP3 absolute time: milliseconds since 1970-01-01 UTC in 48 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DnpTime(u64);

impl DnpTime {
    pub const MAX: u64 = 0xFFFF_FFFF_FFFF;

    /// Returns None for values that do not fit in 48 bits
    pub fn new(millis: u64) -> Option<Self> {
        if millis > Self::MAX {
            None
        } else {
            Some(Self(millis))
        }
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let millis = dt.timestamp_millis().max(0) as u64;
        Self(millis.min(Self::MAX))
    }

    #[inline]
    pub fn millis(&self) -> u64 {
        self.0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0 as i64).single()
    }

    /// Shift forward by `millis`, saturating at the 48-bit limit
    pub fn add_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis).min(Self::MAX))
    }

    /// Little-endian 6-byte wire encoding
    pub fn to_bytes(&self) -> [u8; 6] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2], b[3], b[4], b[5]]
    }

    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let mut b = [0u8; 8];
        b[..6].copy_from_slice(&bytes);
        Self(u64::from_le_bytes(b))
    }
}

impl fmt::Display for DnpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.3f")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Event class assignment of an outstation point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventClass {
    Class1,
    Class2,
    Class3,
}

impl EventClass {
    pub const ALL: [EventClass; 3] = [EventClass::Class1, EventClass::Class2, EventClass::Class3];
}

/// Current state of one point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub index: u16,
    pub point_type: PointType,
    pub value: PointValue,
    pub flags: Flags,
    pub timestamp: Option<DnpTime>,
}

impl Point {
    pub fn binary_input(index: u16, state: bool) -> Self {
        Self::new(index, PointType::BinaryInput, PointValue::Binary(state))
    }

    pub fn binary_output(index: u16, state: bool) -> Self {
        Self::new(index, PointType::BinaryOutput, PointValue::Binary(state))
    }

    pub fn analog_input(index: u16, value: f64) -> Self {
        Self::new(index, PointType::AnalogInput, PointValue::Analog(value))
    }

    pub fn analog_output(index: u16, value: f64) -> Self {
        Self::new(index, PointType::AnalogOutput, PointValue::Analog(value))
    }

    pub fn counter(index: u16, value: u32) -> Self {
        Self::new(index, PointType::Counter, PointValue::Counter(value))
    }

    /// Online point without a timestamp
    pub fn new(index: u16, point_type: PointType, value: PointValue) -> Self {
        Self {
            index,
            point_type,
            value,
            flags: Flags::online(),
            timestamp: None,
        }
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DnpTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Database key
    #[inline]
    pub fn key(&self) -> (PointType, u16) {
        (self.point_type, self.index)
    }
}
