//! Object headers and point encodings
//!
//! Every object header is `group, variation, qualifier` followed by range
//! fields whose layout the qualifier selects:
//!
//! | Qualifier | Range fields | Object indices |
//! |-----------|--------------|----------------|
//! | 0x00 / 0x01 | start, stop (u8 / u16) | start..=stop |
//! | 0x06 | none | all objects, no data |
//! | 0x07 / 0x08 | count (u8 / u16) | 0..count |
//! | 0x17 / 0x28 | count (u8 / u16) | explicit prefix per object (u8 / u16) |
//!
//! Packed variations (g1v1, g10v1, g80v1) carry one bit per index over a
//! range. Any other qualifier value is rejected: skipping bytes under an
//! unknown qualifier would desynchronize the rest of the fragment.

use bytes::{Buf, BufMut};

use crate::control::{AnalogOutputCommand, CommandStatus, ControlRelayOutputBlock};
use crate::error::{Dnp3Error, Dnp3Result};
use crate::point::{DnpTime, Flags, Point, PointType, PointValue};

// ============================================================================
// Variations
// ============================================================================

macro_rules! variations {
    ($($name:ident => ($group:literal, $var:literal),)*) => {
        /// Supported object group/variation pairs
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Variation {
            $($name,)*
        }

        impl Variation {
            pub fn group(&self) -> u8 {
                match self {
                    $(Variation::$name => $group,)*
                }
            }

            pub fn variation(&self) -> u8 {
                match self {
                    $(Variation::$name => $var,)*
                }
            }

            pub fn from_codes(group: u8, variation: u8) -> Dnp3Result<Self> {
                match (group, variation) {
                    $(($group, $var) => Ok(Variation::$name),)*
                    _ => Err(Dnp3Error::UnknownObject { group, variation }),
                }
            }
        }
    };
}

variations! {
    Group1Var0 => (1, 0),
    Group1Var1 => (1, 1),
    Group1Var2 => (1, 2),
    Group2Var0 => (2, 0),
    Group2Var1 => (2, 1),
    Group2Var2 => (2, 2),
    Group10Var0 => (10, 0),
    Group10Var1 => (10, 1),
    Group10Var2 => (10, 2),
    Group12Var1 => (12, 1),
    Group20Var0 => (20, 0),
    Group20Var1 => (20, 1),
    Group20Var5 => (20, 5),
    Group22Var0 => (22, 0),
    Group22Var1 => (22, 1),
    Group30Var0 => (30, 0),
    Group30Var1 => (30, 1),
    Group30Var2 => (30, 2),
    Group30Var3 => (30, 3),
    Group30Var4 => (30, 4),
    Group30Var5 => (30, 5),
    Group32Var0 => (32, 0),
    Group32Var1 => (32, 1),
    Group32Var3 => (32, 3),
    Group32Var5 => (32, 5),
    Group32Var7 => (32, 7),
    Group40Var0 => (40, 0),
    Group40Var1 => (40, 1),
    Group40Var2 => (40, 2),
    Group40Var3 => (40, 3),
    Group41Var1 => (41, 1),
    Group41Var2 => (41, 2),
    Group41Var3 => (41, 3),
    Group50Var1 => (50, 1),
    Group52Var2 => (52, 2),
    Group60Var1 => (60, 1),
    Group60Var2 => (60, 2),
    Group60Var3 => (60, 3),
    Group60Var4 => (60, 4),
    Group80Var1 => (80, 1),
}

/// How objects of a variation are laid out after the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Header only (variation 0, class objects)
    NoData,
    /// One bit per index
    Packed,
    /// Fixed number of bytes per object
    Fixed(usize),
}

impl Variation {
    pub fn encoding(&self) -> Encoding {
        use Variation::*;
        match self {
            Group1Var0 | Group2Var0 | Group10Var0 | Group20Var0 | Group22Var0 | Group30Var0
            | Group32Var0 | Group40Var0 | Group60Var1 | Group60Var2 | Group60Var3
            | Group60Var4 => Encoding::NoData,
            Group1Var1 | Group10Var1 | Group80Var1 => Encoding::Packed,
            Group1Var2 | Group2Var1 | Group10Var2 => Encoding::Fixed(1),
            Group30Var4 | Group52Var2 => Encoding::Fixed(2),
            Group30Var2 | Group40Var2 | Group41Var2 => Encoding::Fixed(3),
            Group20Var5 | Group30Var3 => Encoding::Fixed(4),
            Group20Var1 | Group22Var1 | Group30Var1 | Group30Var5 | Group32Var1 | Group32Var5
            | Group40Var1 | Group40Var3 | Group41Var1 | Group41Var3 => Encoding::Fixed(5),
            Group50Var1 => Encoding::Fixed(6),
            Group2Var2 => Encoding::Fixed(7),
            Group12Var1 | Group32Var3 | Group32Var7 => Encoding::Fixed(11),
        }
    }

    /// Point type reported by this variation, if it carries point data
    pub fn point_type(&self) -> Option<PointType> {
        match self.group() {
            1 | 2 => Some(PointType::BinaryInput),
            10 => Some(PointType::BinaryOutput),
            20 | 22 => Some(PointType::Counter),
            30 | 32 => Some(PointType::AnalogInput),
            40 => Some(PointType::AnalogOutput),
            _ => None,
        }
    }

    /// True for event groups
    pub fn is_event(&self) -> bool {
        matches!(self.group(), 2 | 22 | 32)
    }

    /// Class object number for g60v1..v4 (0 = static data)
    pub fn class_number(&self) -> Option<u8> {
        match self {
            Variation::Group60Var1 => Some(0),
            Variation::Group60Var2 => Some(1),
            Variation::Group60Var3 => Some(2),
            Variation::Group60Var4 => Some(3),
            _ => None,
        }
    }

    /// "Any variation" request object for a point type
    pub fn any_static(point_type: PointType) -> Self {
        match point_type {
            PointType::BinaryInput => Variation::Group1Var0,
            PointType::BinaryOutput => Variation::Group10Var0,
            PointType::Counter => Variation::Group20Var0,
            PointType::AnalogInput => Variation::Group30Var0,
            PointType::AnalogOutput => Variation::Group40Var0,
        }
    }

    /// Variation used when reporting static values
    pub fn default_static(point_type: PointType) -> Self {
        match point_type {
            PointType::BinaryInput => Variation::Group1Var2,
            PointType::BinaryOutput => Variation::Group10Var2,
            PointType::Counter => Variation::Group20Var1,
            PointType::AnalogInput => Variation::Group30Var5,
            PointType::AnalogOutput => Variation::Group40Var3,
        }
    }

    /// Variation used when reporting events; outputs produce no events
    pub fn default_event(point_type: PointType) -> Option<Self> {
        match point_type {
            PointType::BinaryInput => Some(Variation::Group2Var2),
            PointType::Counter => Some(Variation::Group22Var1),
            PointType::AnalogInput => Some(Variation::Group32Var7),
            PointType::BinaryOutput | PointType::AnalogOutput => None,
        }
    }
}

// ============================================================================
// Qualifiers and ranges
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qualifier {
    Range8,
    Range16,
    AllObjects,
    Count8,
    Count16,
    CountAndPrefix8,
    CountAndPrefix16,
}

impl Qualifier {
    pub fn to_u8(self) -> u8 {
        match self {
            Qualifier::Range8 => 0x00,
            Qualifier::Range16 => 0x01,
            Qualifier::AllObjects => 0x06,
            Qualifier::Count8 => 0x07,
            Qualifier::Count16 => 0x08,
            Qualifier::CountAndPrefix8 => 0x17,
            Qualifier::CountAndPrefix16 => 0x28,
        }
    }

    pub fn from_u8(code: u8) -> Dnp3Result<Self> {
        match code {
            0x00 => Ok(Qualifier::Range8),
            0x01 => Ok(Qualifier::Range16),
            0x06 => Ok(Qualifier::AllObjects),
            0x07 => Ok(Qualifier::Count8),
            0x08 => Ok(Qualifier::Count16),
            0x17 => Ok(Qualifier::CountAndPrefix8),
            0x28 => Ok(Qualifier::CountAndPrefix16),
            _ => Err(Dnp3Error::UnknownQualifier { code }),
        }
    }

    fn prefix_size(&self) -> usize {
        match self {
            Qualifier::CountAndPrefix8 => 1,
            Qualifier::CountAndPrefix16 => 2,
            _ => 0,
        }
    }
}

/// Decoded range fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRange {
    StartStop { start: u16, stop: u16 },
    All,
    Count(u16),
    /// Count of index-prefixed objects
    Prefixed(u16),
}

impl HeaderRange {
    /// Number of objects the range announces (0 for `All`)
    pub fn count(&self) -> usize {
        match self {
            HeaderRange::StartStop { start, stop } => (*stop as usize) - (*start as usize) + 1,
            HeaderRange::All => 0,
            HeaderRange::Count(n) | HeaderRange::Prefixed(n) => *n as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub variation: Variation,
    pub qualifier: Qualifier,
    pub range: HeaderRange,
}

// ============================================================================
// Object values
// ============================================================================

/// One decoded object
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObjectValue {
    Binary {
        state: bool,
        flags: Flags,
        time: Option<DnpTime>,
    },
    Counter {
        value: u32,
        flags: Flags,
        time: Option<DnpTime>,
    },
    Analog {
        value: f64,
        flags: Flags,
        time: Option<DnpTime>,
    },
    Crob(ControlRelayOutputBlock),
    AnalogCommand(AnalogOutputCommand),
    Time(DnpTime),
    /// Outstation processing delay in milliseconds (g52v2)
    Delay(u16),
}

impl ObjectValue {
    /// Object value reporting the state of `point`
    pub fn from_point(point: &Point) -> Self {
        match point.value {
            PointValue::Binary(state) => ObjectValue::Binary {
                state,
                flags: point.flags,
                time: point.timestamp,
            },
            PointValue::Counter(value) => ObjectValue::Counter {
                value,
                flags: point.flags,
                time: point.timestamp,
            },
            PointValue::Analog(value) => ObjectValue::Analog {
                value,
                flags: point.flags,
                time: point.timestamp,
            },
        }
    }

    fn binary(state: bool) -> Self {
        ObjectValue::Binary {
            state,
            flags: Flags::online(),
            time: None,
        }
    }
}

fn read_time(buf: &mut &[u8]) -> DnpTime {
    let mut bytes = [0u8; 6];
    buf.copy_to_slice(&mut bytes);
    DnpTime::from_bytes(bytes)
}

fn decode_fixed(variation: Variation, mut buf: &[u8]) -> Dnp3Result<ObjectValue> {
    use Variation::*;
    let value = match variation {
        Group1Var2 | Group2Var1 | Group10Var2 | Group2Var2 => {
            let (flags, state) = Flags::split_binary(buf.get_u8());
            let time = (variation == Group2Var2).then(|| read_time(&mut buf));
            ObjectValue::Binary { state, flags, time }
        }
        Group20Var1 | Group22Var1 => {
            let flags = Flags::new(buf.get_u8());
            ObjectValue::Counter {
                value: buf.get_u32_le(),
                flags,
                time: None,
            }
        }
        Group20Var5 => ObjectValue::Counter {
            value: buf.get_u32_le(),
            flags: Flags::online(),
            time: None,
        },
        Group30Var1 | Group32Var1 | Group40Var1 | Group32Var3 => {
            let flags = Flags::new(buf.get_u8());
            let value = f64::from(buf.get_i32_le());
            let time = (variation == Group32Var3).then(|| read_time(&mut buf));
            ObjectValue::Analog { value, flags, time }
        }
        Group30Var2 | Group40Var2 => {
            let flags = Flags::new(buf.get_u8());
            ObjectValue::Analog {
                value: f64::from(buf.get_i16_le()),
                flags,
                time: None,
            }
        }
        Group30Var3 => ObjectValue::Analog {
            value: f64::from(buf.get_i32_le()),
            flags: Flags::online(),
            time: None,
        },
        Group30Var4 => ObjectValue::Analog {
            value: f64::from(buf.get_i16_le()),
            flags: Flags::online(),
            time: None,
        },
        Group30Var5 | Group32Var5 | Group40Var3 | Group32Var7 => {
            let flags = Flags::new(buf.get_u8());
            let value = f64::from(buf.get_f32_le());
            let time = (variation == Group32Var7).then(|| read_time(&mut buf));
            ObjectValue::Analog { value, flags, time }
        }
        Group41Var1 => {
            let value = f64::from(buf.get_i32_le());
            analog_command(value, buf.get_u8())?
        }
        Group41Var2 => {
            let value = f64::from(buf.get_i16_le());
            analog_command(value, buf.get_u8())?
        }
        Group41Var3 => {
            let value = f64::from(buf.get_f32_le());
            analog_command(value, buf.get_u8())?
        }
        Group12Var1 => ObjectValue::Crob(ControlRelayOutputBlock::decode(buf)?),
        Group50Var1 => ObjectValue::Time(read_time(&mut buf)),
        Group52Var2 => ObjectValue::Delay(buf.get_u16_le()),
        other => {
            return Err(Dnp3Error::protocol(format!(
                "{:?} has no fixed-size encoding",
                other
            )))
        }
    };
    Ok(value)
}

fn analog_command(value: f64, status: u8) -> Dnp3Result<ObjectValue> {
    Ok(ObjectValue::AnalogCommand(
        AnalogOutputCommand::new(value).with_status(CommandStatus::from_u8(status)?),
    ))
}

fn encode_fixed(variation: Variation, value: &ObjectValue, out: &mut Vec<u8>) -> Dnp3Result<()> {
    use Variation::*;
    match (variation, value) {
        (Group1Var2 | Group2Var1 | Group10Var2 | Group2Var2, ObjectValue::Binary { state, flags, time }) => {
            out.put_u8(flags.with_state(*state));
            if variation == Group2Var2 {
                out.put_slice(&time.unwrap_or_default().to_bytes());
            }
        }
        (Group20Var1 | Group22Var1, ObjectValue::Counter { value, flags, .. }) => {
            out.put_u8(flags.bits());
            out.put_u32_le(*value);
        }
        (Group20Var5, ObjectValue::Counter { value, .. }) => out.put_u32_le(*value),
        (Group30Var1 | Group32Var1 | Group40Var1 | Group32Var3, ObjectValue::Analog { value, flags, time }) => {
            out.put_u8(flags.bits());
            out.put_i32_le(value.round() as i32);
            if variation == Group32Var3 {
                out.put_slice(&time.unwrap_or_default().to_bytes());
            }
        }
        (Group30Var2 | Group40Var2, ObjectValue::Analog { value, flags, .. }) => {
            out.put_u8(flags.bits());
            out.put_i16_le(value.round() as i16);
        }
        (Group30Var3, ObjectValue::Analog { value, .. }) => out.put_i32_le(value.round() as i32),
        (Group30Var4, ObjectValue::Analog { value, .. }) => out.put_i16_le(value.round() as i16),
        (Group30Var5 | Group32Var5 | Group40Var3 | Group32Var7, ObjectValue::Analog { value, flags, time }) => {
            out.put_u8(flags.bits());
            out.put_f32_le(*value as f32);
            if variation == Group32Var7 {
                out.put_slice(&time.unwrap_or_default().to_bytes());
            }
        }
        (Group41Var1, ObjectValue::AnalogCommand(cmd)) => {
            out.put_i32_le(cmd.value.round() as i32);
            out.put_u8(cmd.status.to_u8());
        }
        (Group41Var2, ObjectValue::AnalogCommand(cmd)) => {
            out.put_i16_le(cmd.value.round() as i16);
            out.put_u8(cmd.status.to_u8());
        }
        (Group41Var3, ObjectValue::AnalogCommand(cmd)) => {
            out.put_f32_le(cmd.value as f32);
            out.put_u8(cmd.status.to_u8());
        }
        (Group12Var1, ObjectValue::Crob(crob)) => crob.encode(out),
        (Group50Var1, ObjectValue::Time(time)) => out.put_slice(&time.to_bytes()),
        (Group52Var2, ObjectValue::Delay(delay)) => out.put_u16_le(*delay),
        (variation, value) => {
            return Err(Dnp3Error::protocol(format!(
                "Cannot encode {:?} as {:?}",
                value, variation
            )))
        }
    }
    Ok(())
}

// ============================================================================
// Object blocks
// ============================================================================

/// An object header together with its decoded objects
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectBlock {
    pub header: ObjectHeader,
    pub items: Vec<(u16, ObjectValue)>,
}

impl ObjectBlock {
    /// Header-only block with the all-objects qualifier
    pub fn all(variation: Variation) -> Self {
        Self {
            header: ObjectHeader {
                variation,
                qualifier: Qualifier::AllObjects,
                range: HeaderRange::All,
            },
            items: Vec::new(),
        }
    }

    /// Header-only start/stop block (read requests)
    pub fn range_request(variation: Variation, start: u16, stop: u16) -> Dnp3Result<Self> {
        if stop < start {
            return Err(Dnp3Error::configuration(format!(
                "Invalid range {}..={}",
                start, stop
            )));
        }
        Ok(Self {
            header: ObjectHeader {
                variation,
                qualifier: range_qualifier(stop),
                range: HeaderRange::StartStop { start, stop },
            },
            items: Vec::new(),
        })
    }

    /// Contiguous objects starting at `start`
    pub fn range(variation: Variation, start: u16, values: Vec<ObjectValue>) -> Dnp3Result<Self> {
        let count = values.len();
        if count == 0 || start as usize + count - 1 > u16::MAX as usize {
            return Err(Dnp3Error::protocol("Range block must hold 1..=65536 objects"));
        }
        let stop = (start as usize + count - 1) as u16;
        Ok(Self {
            header: ObjectHeader {
                variation,
                qualifier: range_qualifier(stop),
                range: HeaderRange::StartStop { start, stop },
            },
            items: (start..=stop).zip(values).collect(),
        })
    }

    /// Objects with explicit index prefixes
    pub fn prefixed(variation: Variation, items: Vec<(u16, ObjectValue)>) -> Dnp3Result<Self> {
        let count = u16::try_from(items.len())
            .map_err(|_| Dnp3Error::protocol("Too many prefixed objects"))?;
        let narrow = count <= u8::MAX as u16 && items.iter().all(|(i, _)| *i <= u8::MAX as u16);
        Ok(Self {
            header: ObjectHeader {
                variation,
                qualifier: if narrow {
                    Qualifier::CountAndPrefix8
                } else {
                    Qualifier::CountAndPrefix16
                },
                range: HeaderRange::Prefixed(count),
            },
            items,
        })
    }

    /// Objects with a count qualifier (time, delay)
    pub fn count(variation: Variation, values: Vec<ObjectValue>) -> Dnp3Result<Self> {
        let count = u16::try_from(values.len())
            .map_err(|_| Dnp3Error::protocol("Too many counted objects"))?;
        Ok(Self {
            header: ObjectHeader {
                variation,
                qualifier: if count <= u8::MAX as u16 {
                    Qualifier::Count8
                } else {
                    Qualifier::Count16
                },
                range: HeaderRange::Count(count),
            },
            items: (0..count).zip(values).collect(),
        })
    }

    pub fn variation(&self) -> Variation {
        self.header.variation
    }

    /// Point updates carried by this block
    pub fn points(&self) -> Vec<Point> {
        let Some(point_type) = self.header.variation.point_type() else {
            return Vec::new();
        };
        self.items
            .iter()
            .filter_map(|(index, value)| {
                let (value, flags, time) = match *value {
                    ObjectValue::Binary { state, flags, time } => (PointValue::Binary(state), flags, time),
                    ObjectValue::Counter { value, flags, time } => (PointValue::Counter(value), flags, time),
                    ObjectValue::Analog { value, flags, time } => (PointValue::Analog(value), flags, time),
                    _ => return None,
                };
                Some(Point {
                    index: *index,
                    point_type,
                    value,
                    flags,
                    timestamp: time,
                })
            })
            .collect()
    }

    /// Append the header and objects to `out`
    pub fn encode(&self, out: &mut Vec<u8>) -> Dnp3Result<()> {
        let ObjectHeader {
            variation,
            qualifier,
            range,
        } = self.header;
        out.put_u8(variation.group());
        out.put_u8(variation.variation());
        out.put_u8(qualifier.to_u8());

        match (qualifier, range) {
            (Qualifier::Range8, HeaderRange::StartStop { start, stop }) => {
                out.put_u8(narrow(start)?);
                out.put_u8(narrow(stop)?);
            }
            (Qualifier::Range16, HeaderRange::StartStop { start, stop }) => {
                out.put_u16_le(start);
                out.put_u16_le(stop);
            }
            (Qualifier::AllObjects, HeaderRange::All) => {}
            (Qualifier::Count8 | Qualifier::CountAndPrefix8, HeaderRange::Count(n) | HeaderRange::Prefixed(n)) => {
                out.put_u8(narrow(n)?)
            }
            (Qualifier::Count16 | Qualifier::CountAndPrefix16, HeaderRange::Count(n) | HeaderRange::Prefixed(n)) => {
                out.put_u16_le(n)
            }
            (qualifier, range) => {
                return Err(Dnp3Error::protocol(format!(
                    "Qualifier {:?} does not match range {:?}",
                    qualifier, range
                )))
            }
        }

        match variation.encoding() {
            Encoding::NoData => {}
            Encoding::Packed => {
                let mut byte = 0u8;
                for (i, (_, value)) in self.items.iter().enumerate() {
                    let state = matches!(value, ObjectValue::Binary { state: true, .. });
                    if state {
                        byte |= 1 << (i % 8);
                    }
                    if i % 8 == 7 {
                        out.put_u8(byte);
                        byte = 0;
                    }
                }
                if self.items.len() % 8 != 0 {
                    out.put_u8(byte);
                }
            }
            Encoding::Fixed(_) => {
                for (index, value) in &self.items {
                    match qualifier.prefix_size() {
                        1 => out.put_u8(narrow(*index)?),
                        2 => out.put_u16_le(*index),
                        _ => {}
                    }
                    encode_fixed(variation, value, out)?;
                }
            }
        }
        Ok(())
    }
}

fn range_qualifier(stop: u16) -> Qualifier {
    if stop <= u8::MAX as u16 {
        Qualifier::Range8
    } else {
        Qualifier::Range16
    }
}

fn narrow(value: u16) -> Dnp3Result<u8> {
    u8::try_from(value).map_err(|_| Dnp3Error::protocol(format!("{} does not fit in one byte", value)))
}

/// Encode blocks back to back
pub fn encode_objects(blocks: &[ObjectBlock]) -> Dnp3Result<Vec<u8>> {
    let mut out = Vec::new();
    for block in blocks {
        block.encode(&mut out)?;
    }
    Ok(out)
}

// ============================================================================
// Parsing
// ============================================================================

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Dnp3Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(Dnp3Error::protocol(format!(
                "Object data truncated: need {} byte(s), have {}",
                n,
                self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Dnp3Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Dnp3Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parse a sequence of object headers.
///
/// `with_data` is false for functions whose requests carry headers only
/// (READ, ENABLE/DISABLE_UNSOLICITED, CONFIRM).
pub fn parse_objects(data: &[u8], with_data: bool) -> Dnp3Result<Vec<ObjectBlock>> {
    let mut cursor = Cursor { data };
    let mut blocks = Vec::new();
    while !cursor.is_empty() {
        blocks.push(parse_block(&mut cursor, with_data)?);
    }
    Ok(blocks)
}

fn parse_block(cursor: &mut Cursor<'_>, with_data: bool) -> Dnp3Result<ObjectBlock> {
    let group = cursor.u8()?;
    let var = cursor.u8()?;
    let qualifier = Qualifier::from_u8(cursor.u8()?)?;
    let variation = Variation::from_codes(group, var)?;

    let range = match qualifier {
        Qualifier::Range8 => {
            let start = u16::from(cursor.u8()?);
            let stop = u16::from(cursor.u8()?);
            HeaderRange::StartStop { start, stop }
        }
        Qualifier::Range16 => {
            let start = cursor.u16()?;
            let stop = cursor.u16()?;
            HeaderRange::StartStop { start, stop }
        }
        Qualifier::AllObjects => HeaderRange::All,
        Qualifier::Count8 => HeaderRange::Count(u16::from(cursor.u8()?)),
        Qualifier::Count16 => HeaderRange::Count(cursor.u16()?),
        Qualifier::CountAndPrefix8 => HeaderRange::Prefixed(u16::from(cursor.u8()?)),
        Qualifier::CountAndPrefix16 => HeaderRange::Prefixed(cursor.u16()?),
    };
    if let HeaderRange::StartStop { start, stop } = range {
        if stop < start {
            return Err(Dnp3Error::protocol(format!(
                "Range start {} exceeds stop {}",
                start, stop
            )));
        }
    }

    let header = ObjectHeader {
        variation,
        qualifier,
        range,
    };
    let encoding = if with_data {
        variation.encoding()
    } else {
        Encoding::NoData
    };

    let items = match (encoding, range) {
        (Encoding::NoData, HeaderRange::Prefixed(_)) => {
            return Err(Dnp3Error::protocol("Index prefixes without object data"))
        }
        (Encoding::NoData, _) => Vec::new(),
        (_, HeaderRange::All) => {
            return Err(Dnp3Error::protocol(format!(
                "{:?} requires a range or count qualifier",
                variation
            )))
        }
        (Encoding::Packed, HeaderRange::Prefixed(_)) => {
            return Err(Dnp3Error::protocol("Packed objects cannot be index-prefixed"))
        }
        (Encoding::Packed, range) => {
            let count = range.count();
            let start = match range {
                HeaderRange::StartStop { start, .. } => start,
                _ => 0,
            };
            let bits = cursor.take(count.div_ceil(8))?;
            (0..count)
                .map(|i| {
                    let state = bits[i / 8] & (1 << (i % 8)) != 0;
                    ((start as usize + i) as u16, ObjectValue::binary(state))
                })
                .collect()
        }
        (Encoding::Fixed(size), range) => {
            let count = range.count();
            let prefix = qualifier.prefix_size();
            let body = cursor.take(count * (size + prefix))?;
            let start = match range {
                HeaderRange::StartStop { start, .. } => start as usize,
                _ => 0,
            };
            let mut items = Vec::with_capacity(count);
            for (i, chunk) in body.chunks_exact(size + prefix).enumerate() {
                let index = match prefix {
                    1 => u16::from(chunk[0]),
                    2 => u16::from_le_bytes([chunk[0], chunk[1]]),
                    _ => (start + i) as u16,
                };
                items.push((index, decode_fixed(variation, &chunk[prefix..])?));
            }
            items
        }
    };

    Ok(ObjectBlock { header, items })
}
