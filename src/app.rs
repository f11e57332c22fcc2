//! Application layer fragments
//!
//! ```text
//! Request:  [control][function][objects...]
//! Response: [control][function][IIN1][IIN2][objects...]
//!
//! control: FIR 0x80 | FIN 0x40 | CON 0x20 | UNS 0x10 | SEQ 0x0F
//! ```

use std::fmt;

use bytes::Bytes;

use crate::constants::{REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN};
use crate::error::{Dnp3Error, Dnp3Result};
use crate::object::{encode_objects, parse_objects, ObjectBlock};

/// Application control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppControl {
    pub fir: bool,
    pub fin: bool,
    pub con: bool,
    pub uns: bool,
    pub seq: u8,
}

impl AppControl {
    const FIR: u8 = 0x80;
    const FIN: u8 = 0x40;
    const CON: u8 = 0x20;
    const UNS: u8 = 0x10;
    const SEQ_MASK: u8 = 0x0F;

    /// Single-fragment message without confirmation
    pub fn single(seq: u8) -> Self {
        Self {
            fir: true,
            fin: true,
            con: false,
            uns: false,
            seq: seq & Self::SEQ_MASK,
        }
    }

    /// Single-fragment unsolicited response; always confirmed
    pub fn unsolicited(seq: u8) -> Self {
        Self {
            con: true,
            uns: true,
            ..Self::single(seq)
        }
    }

    pub fn with_con(mut self, con: bool) -> Self {
        self.con = con;
        self
    }

    pub fn to_u8(&self) -> u8 {
        let mut byte = self.seq & Self::SEQ_MASK;
        if self.fir {
            byte |= Self::FIR;
        }
        if self.fin {
            byte |= Self::FIN;
        }
        if self.con {
            byte |= Self::CON;
        }
        if self.uns {
            byte |= Self::UNS;
        }
        byte
    }

    pub fn from_u8(byte: u8) -> Self {
        Self {
            fir: byte & Self::FIR != 0,
            fin: byte & Self::FIN != 0,
            con: byte & Self::CON != 0,
            uns: byte & Self::UNS != 0,
            seq: byte & Self::SEQ_MASK,
        }
    }
}

/// Application function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    Confirm,
    Read,
    Write,
    Select,
    Operate,
    DirectOperate,
    DirectOperateNoAck,
    ColdRestart,
    WarmRestart,
    EnableUnsolicited,
    DisableUnsolicited,
    DelayMeasure,
    Response,
    UnsolicitedResponse,
}

impl FunctionCode {
    pub fn to_u8(self) -> u8 {
        match self {
            FunctionCode::Confirm => 0x00,
            FunctionCode::Read => 0x01,
            FunctionCode::Write => 0x02,
            FunctionCode::Select => 0x03,
            FunctionCode::Operate => 0x04,
            FunctionCode::DirectOperate => 0x05,
            FunctionCode::DirectOperateNoAck => 0x06,
            FunctionCode::ColdRestart => 0x0D,
            FunctionCode::WarmRestart => 0x0E,
            FunctionCode::EnableUnsolicited => 0x14,
            FunctionCode::DisableUnsolicited => 0x15,
            FunctionCode::DelayMeasure => 0x17,
            FunctionCode::Response => 0x81,
            FunctionCode::UnsolicitedResponse => 0x82,
        }
    }

    pub fn from_u8(code: u8) -> Dnp3Result<Self> {
        match code {
            0x00 => Ok(FunctionCode::Confirm),
            0x01 => Ok(FunctionCode::Read),
            0x02 => Ok(FunctionCode::Write),
            0x03 => Ok(FunctionCode::Select),
            0x04 => Ok(FunctionCode::Operate),
            0x05 => Ok(FunctionCode::DirectOperate),
            0x06 => Ok(FunctionCode::DirectOperateNoAck),
            0x0D => Ok(FunctionCode::ColdRestart),
            0x0E => Ok(FunctionCode::WarmRestart),
            0x14 => Ok(FunctionCode::EnableUnsolicited),
            0x15 => Ok(FunctionCode::DisableUnsolicited),
            0x17 => Ok(FunctionCode::DelayMeasure),
            0x81 => Ok(FunctionCode::Response),
            0x82 => Ok(FunctionCode::UnsolicitedResponse),
            _ => Err(Dnp3Error::UnknownFunction { code }),
        }
    }

    /// Responses carry IIN after the function code
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            FunctionCode::Response | FunctionCode::UnsolicitedResponse
        )
    }

    /// True if object headers of this function are followed by object data
    pub fn carries_data(&self) -> bool {
        matches!(
            self,
            FunctionCode::Write
                | FunctionCode::Select
                | FunctionCode::Operate
                | FunctionCode::DirectOperate
                | FunctionCode::DirectOperateNoAck
                | FunctionCode::Response
                | FunctionCode::UnsolicitedResponse
        )
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.to_u8())
    }
}

/// Internal indications, IIN1 in the low byte and IIN2 in the high byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Iin(u16);

impl Iin {
    pub const ALL_STATIONS: u16 = 0x0001;
    pub const CLASS1_EVENTS: u16 = 0x0002;
    pub const CLASS2_EVENTS: u16 = 0x0004;
    pub const CLASS3_EVENTS: u16 = 0x0008;
    pub const NEED_TIME: u16 = 0x0010;
    pub const LOCAL_CONTROL: u16 = 0x0020;
    pub const DEVICE_TROUBLE: u16 = 0x0040;
    pub const DEVICE_RESTART: u16 = 0x0080;
    pub const NO_FUNC_CODE_SUPPORT: u16 = 0x0100;
    pub const OBJECT_UNKNOWN: u16 = 0x0200;
    pub const PARAMETER_ERROR: u16 = 0x0400;
    pub const EVENT_BUFFER_OVERFLOW: u16 = 0x0800;
    pub const ALREADY_EXECUTING: u16 = 0x1000;
    pub const CONFIG_CORRUPT: u16 = 0x2000;

    /// Bits reporting a rejected request
    pub const REQUEST_ERRORS: u16 =
        Self::NO_FUNC_CODE_SUPPORT | Self::OBJECT_UNKNOWN | Self::PARAMETER_ERROR;

    /// g80v1 index of DEVICE_RESTART
    pub const RESTART_INDEX: u16 = 7;

    pub const fn new(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn from_bytes(iin1: u8, iin2: u8) -> Self {
        Self(iin1 as u16 | (iin2 as u16) << 8)
    }

    pub const fn to_bytes(&self) -> [u8; 2] {
        [(self.0 & 0xFF) as u8, (self.0 >> 8) as u8]
    }

    #[inline]
    pub const fn bits(&self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn contains(&self, bit: u16) -> bool {
        self.0 & bit == bit
    }

    pub fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u16) {
        self.0 &= !bit;
    }

    pub const fn union(self, other: Iin) -> Iin {
        Iin(self.0 | other.0)
    }

    /// True if the outstation rejected the request
    pub const fn has_request_error(&self) -> bool {
        self.0 & Self::REQUEST_ERRORS != 0
    }

    /// True if any class 1-3 event bit is set
    pub const fn has_events(&self) -> bool {
        self.0 & (Self::CLASS1_EVENTS | Self::CLASS2_EVENTS | Self::CLASS3_EVENTS) != 0
    }
}

impl fmt::Display for Iin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 14] = [
            "ALL_STATIONS",
            "CLASS1_EVENTS",
            "CLASS2_EVENTS",
            "CLASS3_EVENTS",
            "NEED_TIME",
            "LOCAL_CONTROL",
            "DEVICE_TROUBLE",
            "DEVICE_RESTART",
            "NO_FUNC_CODE_SUPPORT",
            "OBJECT_UNKNOWN",
            "PARAMETER_ERROR",
            "EVENT_BUFFER_OVERFLOW",
            "ALREADY_EXECUTING",
            "CONFIG_CORRUPT",
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect();
        let [iin1, iin2] = self.to_bytes();
        write!(f, "[{:02X} {:02X}]", iin1, iin2)?;
        if !set.is_empty() {
            write!(f, " {}", set.join("|"))?;
        }
        Ok(())
    }
}

/// A decoded application fragment
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFragment {
    pub control: AppControl,
    pub function: FunctionCode,
    /// Present on responses only
    pub iin: Option<Iin>,
    pub objects: Vec<ObjectBlock>,
}

/// Decode a fragment.
///
/// Fails with a protocol-class error on an unknown function code, a truncated
/// header, or any malformed object header.
pub fn parse(bytes: &[u8]) -> Dnp3Result<ParsedFragment> {
    if bytes.len() < REQUEST_HEADER_LEN {
        return Err(Dnp3Error::protocol(format!(
            "Fragment of {} byte(s) is shorter than a header",
            bytes.len()
        )));
    }
    let control = AppControl::from_u8(bytes[0]);
    let function = FunctionCode::from_u8(bytes[1])?;

    let (iin, body) = if function.is_response() {
        if bytes.len() < RESPONSE_HEADER_LEN {
            return Err(Dnp3Error::protocol("Response fragment missing IIN"));
        }
        (
            Some(Iin::from_bytes(bytes[2], bytes[3])),
            &bytes[RESPONSE_HEADER_LEN..],
        )
    } else {
        (None, &bytes[REQUEST_HEADER_LEN..])
    };

    Ok(ParsedFragment {
        control,
        function,
        iin,
        objects: parse_objects(body, function.carries_data())?,
    })
}

/// Incremental fragment writer
#[derive(Debug, Clone)]
pub struct FragmentBuilder {
    buffer: Vec<u8>,
}

impl FragmentBuilder {
    pub fn request(function: FunctionCode, control: AppControl) -> Self {
        Self {
            buffer: vec![control.to_u8(), function.to_u8()],
        }
    }

    pub fn response(function: FunctionCode, control: AppControl, iin: Iin) -> Self {
        let [iin1, iin2] = iin.to_bytes();
        Self {
            buffer: vec![control.to_u8(), function.to_u8(), iin1, iin2],
        }
    }

    pub fn object(mut self, block: &ObjectBlock) -> Dnp3Result<Self> {
        block.encode(&mut self.buffer)?;
        Ok(self)
    }

    /// Append pre-encoded object bytes
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn build(self) -> Bytes {
        Bytes::from(self.buffer)
    }
}

/// Encode a request fragment
pub fn build(function: FunctionCode, control: AppControl, objects: &[ObjectBlock]) -> Dnp3Result<Bytes> {
    let body = encode_objects(objects)?;
    Ok(FragmentBuilder::request(function, control).raw(&body).build())
}

/// Encode a response fragment
pub fn build_response(
    function: FunctionCode,
    control: AppControl,
    iin: Iin,
    objects: &[ObjectBlock],
) -> Dnp3Result<Bytes> {
    let body = encode_objects(objects)?;
    Ok(FragmentBuilder::response(function, control, iin).raw(&body).build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlRelayOutputBlock;
    use crate::object::{ObjectValue, Variation};
    use proptest::prelude::*;

    #[test]
    fn test_control_byte() {
        let control = AppControl::from_u8(0xF0);
        assert!(control.fir && control.fin && control.con && control.uns);
        assert_eq!(control.seq, 0);
        assert_eq!(AppControl::unsolicited(0).to_u8(), 0xF0);
        assert_eq!(AppControl::single(17).seq, 1);
    }

    #[test]
    fn test_parse_select_request() {
        let bytes = [
            0xC0, 0x03, 0x0C, 0x01, 0x17, 0x01, 0x03, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x01,
            0x00, 0x00, 0x00, 0x00,
        ];
        let fragment = parse(&bytes).unwrap();
        assert_eq!(fragment.function, FunctionCode::Select);
        assert_eq!(fragment.control, AppControl::single(0));
        assert!(fragment.iin.is_none());
        assert_eq!(fragment.objects[0].items[0].0, 3);
    }

    #[test]
    fn test_parse_null_unsolicited() {
        let fragment = parse(&[0xF0, 0x82, 0x80, 0x00]).unwrap();
        assert_eq!(fragment.function, FunctionCode::UnsolicitedResponse);
        let iin = fragment.iin.unwrap();
        assert!(iin.contains(Iin::DEVICE_RESTART));
        assert!(fragment.objects.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse(&[0xC0, 0x70]),
            Err(Dnp3Error::UnknownFunction { code: 0x70 })
        ));
        assert!(parse(&[0xC0]).is_err());
        assert!(parse(&[0xC0, 0x81, 0x00]).is_err());
        assert!(matches!(
            parse(&[0xC0, 0x01, 0x01, 0x00, 0x5B]),
            Err(Dnp3Error::UnknownQualifier { code: 0x5B })
        ));
    }

    #[test]
    fn test_build_integrity_poll() {
        let objects = [
            ObjectBlock::all(Variation::Group60Var2),
            ObjectBlock::all(Variation::Group60Var3),
            ObjectBlock::all(Variation::Group60Var4),
            ObjectBlock::all(Variation::Group60Var1),
        ];
        let bytes = build(FunctionCode::Read, AppControl::single(2), &objects).unwrap();
        assert_eq!(
            &bytes[..],
            &[0xC2, 0x01, 0x3C, 0x02, 0x06, 0x3C, 0x03, 0x06, 0x3C, 0x04, 0x06, 0x3C, 0x01, 0x06]
        );
    }

    #[test]
    fn test_build_select_response() {
        let crob = ControlRelayOutputBlock::pulse_on(1, 1);
        let block =
            ObjectBlock::prefixed(Variation::Group12Var1, vec![(3, ObjectValue::Crob(crob))]).unwrap();
        let bytes = build_response(
            FunctionCode::Response,
            AppControl::single(0),
            Iin::new(Iin::DEVICE_RESTART),
            &[block],
        )
        .unwrap();
        assert_eq!(
            &bytes[..],
            &[
                0xC0, 0x81, 0x80, 0x00, 0x0C, 0x01, 0x17, 0x01, 0x03, 0x01, 0x01, 0x01, 0x00, 0x00,
                0x00, 0x01, 0x00, 0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_iin_display() {
        let iin = Iin::new(Iin::DEVICE_RESTART | Iin::OBJECT_UNKNOWN);
        assert_eq!(iin.to_string(), "[80 02] DEVICE_RESTART|OBJECT_UNKNOWN");
        assert!(iin.has_request_error());
        assert_eq!(Iin::from_bytes(0x80, 0x02), iin);
    }

    proptest! {
        #[test]
        fn prop_fragment_round_trip(seq in 0u8..16, values in proptest::collection::vec(any::<bool>(), 1..40)) {
            let objects: Vec<_> = values
                .iter()
                .map(|s| ObjectValue::Binary { state: *s, flags: crate::point::Flags::online(), time: None })
                .collect();
            let block = ObjectBlock::range(Variation::Group1Var2, 0, objects).unwrap();
            let bytes = build_response(FunctionCode::Response, AppControl::single(seq), Iin::default(), &[block.clone()]).unwrap();
            let fragment = parse(&bytes).unwrap();
            prop_assert_eq!(fragment.control.seq, seq);
            prop_assert_eq!(fragment.objects, vec![block]);
        }
    }
}
