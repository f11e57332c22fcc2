//! DNP3 link layer frames
//!
//! ```text
//! +------+------+-----+------+------+-----+-----+ +------------+-----+ +-----
//! | 0x05 | 0x64 | LEN | CTRL | DEST | SRC | CRC | | data <= 16 | CRC | | ...
//! +------+------+-----+------+------+-----+-----+ +------------+-----+ +-----
//!    1      1      1     1      2      2     2          n          2
//! ```
//!
//! Addresses and CRCs are little-endian. `LEN` counts CTRL, DEST, SRC and the
//! user data but not the CRCs. Every CRC must validate before a frame is
//! accepted. Corrupt input is dropped with a WARN and the decoder resumes at
//! the next start sequence; it is never reported as an error to the caller.

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use crc::{Crc, CRC_16_DNP};

use crate::constants::{
    CRC_LEN, LINK_BLOCK_SIZE, LINK_HEADER_LEN, MAX_LINK_PAYLOAD, MIN_LINK_LENGTH, START1, START2,
};
use crate::error::{Dnp3Error, Dnp3Result};
use crate::logging::{format_hex, Diagnostics, FilterLevel};

const DNP_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_DNP);

/// CRC-16/DNP of `data`
#[inline]
pub fn crc(data: &[u8]) -> u16 {
    DNP_CRC.checksum(data)
}

fn crc_matches(data: &[u8], stored: &[u8]) -> bool {
    crc(data).to_le_bytes() == [stored[0], stored[1]]
}

// ============================================================================
// Control field
// ============================================================================

/// Link function code; the meaning of the low nibble depends on PRM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkFunction {
    PriResetLinkStates,
    PriTestLinkStates,
    PriConfirmedUserData,
    PriUnconfirmedUserData,
    PriRequestLinkStatus,
    SecAck,
    SecNack,
    SecLinkStatus,
    SecNotSupported,
}

impl LinkFunction {
    /// True for functions sent by the primary (initiating) station
    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            LinkFunction::PriResetLinkStates
                | LinkFunction::PriTestLinkStates
                | LinkFunction::PriConfirmedUserData
                | LinkFunction::PriUnconfirmedUserData
                | LinkFunction::PriRequestLinkStatus
        )
    }

    pub fn code(&self) -> u8 {
        match self {
            LinkFunction::PriResetLinkStates => 0,
            LinkFunction::PriTestLinkStates => 2,
            LinkFunction::PriConfirmedUserData => 3,
            LinkFunction::PriUnconfirmedUserData => 4,
            LinkFunction::PriRequestLinkStatus => 9,
            LinkFunction::SecAck => 0,
            LinkFunction::SecNack => 1,
            LinkFunction::SecLinkStatus => 11,
            LinkFunction::SecNotSupported => 15,
        }
    }

    pub fn from_code(primary: bool, code: u8) -> Dnp3Result<Self> {
        let function = match (primary, code) {
            (true, 0) => LinkFunction::PriResetLinkStates,
            (true, 2) => LinkFunction::PriTestLinkStates,
            (true, 3) => LinkFunction::PriConfirmedUserData,
            (true, 4) => LinkFunction::PriUnconfirmedUserData,
            (true, 9) => LinkFunction::PriRequestLinkStatus,
            (false, 0) => LinkFunction::SecAck,
            (false, 1) => LinkFunction::SecNack,
            (false, 11) => LinkFunction::SecLinkStatus,
            (false, 15) => LinkFunction::SecNotSupported,
            _ => {
                return Err(Dnp3Error::protocol(format!(
                    "Unknown {} link function {}",
                    if primary { "primary" } else { "secondary" },
                    code
                )))
            }
        };
        Ok(function)
    }

    /// True if this frame carries user data
    pub fn has_user_data(&self) -> bool {
        matches!(
            self,
            LinkFunction::PriConfirmedUserData | LinkFunction::PriUnconfirmedUserData
        )
    }
}

/// Link control byte: DIR, PRM, FCB, FCV/DFC and function code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlField {
    /// Set on frames sent by the master
    pub dir: bool,
    /// FCB on primary frames
    pub fcb: bool,
    /// FCV on primary frames, DFC on secondary frames
    pub fcv: bool,
    pub function: LinkFunction,
}

impl ControlField {
    const DIR: u8 = 0x80;
    const PRM: u8 = 0x40;
    const FCB: u8 = 0x20;
    const FCV: u8 = 0x10;

    pub fn new(dir: bool, function: LinkFunction) -> Self {
        Self {
            dir,
            fcb: false,
            fcv: false,
            function,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut byte = self.function.code();
        if self.dir {
            byte |= Self::DIR;
        }
        if self.function.is_primary() {
            byte |= Self::PRM;
        }
        if self.fcb {
            byte |= Self::FCB;
        }
        if self.fcv {
            byte |= Self::FCV;
        }
        byte
    }

    pub fn from_u8(byte: u8) -> Dnp3Result<Self> {
        let primary = byte & Self::PRM != 0;
        Ok(Self {
            dir: byte & Self::DIR != 0,
            fcb: byte & Self::FCB != 0,
            fcv: byte & Self::FCV != 0,
            function: LinkFunction::from_code(primary, byte & 0x0F)?,
        })
    }
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHeader {
    pub control: ControlField,
    pub destination: u16,
    pub source: u16,
}

impl LinkHeader {
    pub fn new(control: ControlField, destination: u16, source: u16) -> Self {
        Self {
            control,
            destination,
            source,
        }
    }
}

/// A validated link frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFrame {
    pub header: LinkHeader,
    pub payload: Bytes,
}

impl fmt::Display for LinkFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} dest={} src={} len={}",
            self.header.control.function,
            self.header.destination,
            self.header.source,
            self.payload.len()
        )
    }
}

/// Number of wire bytes for a frame carrying `payload_len` bytes of user data
pub fn frame_len(payload_len: usize) -> usize {
    LINK_HEADER_LEN + payload_len + payload_len.div_ceil(LINK_BLOCK_SIZE) * CRC_LEN
}

/// Serialize one frame. The payload must fit in a single frame.
pub fn encode_frame(header: &LinkHeader, payload: &[u8]) -> Dnp3Result<Vec<u8>> {
    if payload.len() > MAX_LINK_PAYLOAD {
        return Err(Dnp3Error::protocol(format!(
            "Link payload of {} bytes exceeds maximum {}",
            payload.len(),
            MAX_LINK_PAYLOAD
        )));
    }

    let mut frame = Vec::with_capacity(frame_len(payload.len()));
    frame.push(START1);
    frame.push(START2);
    frame.push(MIN_LINK_LENGTH + payload.len() as u8);
    frame.push(header.control.to_u8());
    frame.extend_from_slice(&header.destination.to_le_bytes());
    frame.extend_from_slice(&header.source.to_le_bytes());
    let header_crc = crc(&frame);
    frame.extend_from_slice(&header_crc.to_le_bytes());

    for block in payload.chunks(LINK_BLOCK_SIZE) {
        frame.extend_from_slice(block);
        frame.extend_from_slice(&crc(block).to_le_bytes());
    }
    Ok(frame)
}

// ============================================================================
// Decoder
// ============================================================================

/// Counters kept by [`LinkDecoder`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames: u64,
    pub header_crc_errors: u64,
    pub body_crc_errors: u64,
    pub bad_control: u64,
    pub discarded_bytes: u64,
}

/// Incremental frame decoder over an unframed byte stream
#[derive(Debug)]
pub struct LinkDecoder {
    buffer: BytesMut,
    diagnostics: Diagnostics,
    stats: LinkStats,
}

impl LinkDecoder {
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self {
            buffer: BytesMut::with_capacity(2 * crate::constants::MAX_LINK_FRAME_LEN),
            diagnostics,
            stats: LinkStats::default(),
        }
    }

    /// Append bytes and return every frame that is now complete
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<LinkFrame> {
        self.push(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Extract the next valid frame, discarding garbage and corrupt frames.
    pub fn next_frame(&mut self) -> Option<LinkFrame> {
        loop {
            if !self.sync() {
                return None;
            }
            if self.buffer.len() < LINK_HEADER_LEN {
                return None;
            }

            if !crc_matches(&self.buffer[..8], &self.buffer[8..10]) {
                self.stats.header_crc_errors += 1;
                self.diagnostics.emit_with(FilterLevel::Warn, || {
                    format!(
                        "Link header CRC failure: {}",
                        format_hex(&self.buffer[..LINK_HEADER_LEN])
                    )
                });
                self.discard(1);
                continue;
            }

            let length = self.buffer[2];
            if length < MIN_LINK_LENGTH {
                self.diagnostics
                    .emit(FilterLevel::Warn, &format!("Link length {} below minimum", length));
                self.discard(LINK_HEADER_LEN);
                continue;
            }

            let data_len = (length - MIN_LINK_LENGTH) as usize;
            let total = frame_len(data_len);
            if self.buffer.len() < total {
                return None;
            }

            let control = match ControlField::from_u8(self.buffer[3]) {
                Ok(control) => control,
                Err(e) => {
                    self.stats.bad_control += 1;
                    self.diagnostics.emit(FilterLevel::Warn, &e.to_string());
                    self.discard(total);
                    continue;
                }
            };
            let destination = u16::from_le_bytes([self.buffer[4], self.buffer[5]]);
            let source = u16::from_le_bytes([self.buffer[6], self.buffer[7]]);

            let mut frame = self.buffer.split_to(total);
            frame.advance(LINK_HEADER_LEN);
            let payload = match Self::strip_block_crcs(&frame, data_len) {
                Some(payload) => payload,
                None => {
                    self.stats.body_crc_errors += 1;
                    self.stats.discarded_bytes += total as u64;
                    self.diagnostics.emit(
                        FilterLevel::Warn,
                        &format!(
                            "Link data CRC failure, dropping frame from {} to {}",
                            source, destination
                        ),
                    );
                    continue;
                }
            };

            self.stats.frames += 1;
            return Some(LinkFrame {
                header: LinkHeader::new(control, destination, source),
                payload,
            });
        }
    }

    /// Drop bytes until the buffer starts with the start sequence.
    ///
    /// Returns false when no start sequence is buffered yet.
    fn sync(&mut self) -> bool {
        let position = self
            .buffer
            .windows(2)
            .position(|w| w[0] == START1 && w[1] == START2);

        match position {
            Some(0) => true,
            Some(n) => {
                self.warn_garbage(n);
                self.discard(n);
                true
            }
            None => {
                // A trailing START1 may be the first half of the next frame
                let keep = usize::from(self.buffer.last() == Some(&START1));
                let n = self.buffer.len() - keep;
                if n > 0 {
                    self.warn_garbage(n);
                    self.discard(n);
                }
                false
            }
        }
    }

    fn warn_garbage(&self, n: usize) {
        self.diagnostics.emit_with(FilterLevel::Warn, || {
            format!("Discarding {} byte(s) while searching for link start", n)
        });
    }

    fn discard(&mut self, n: usize) {
        self.stats.discarded_bytes += n as u64;
        self.buffer.advance(n);
    }

    fn strip_block_crcs(body: &[u8], data_len: usize) -> Option<Bytes> {
        let mut payload = BytesMut::with_capacity(data_len);
        let mut remaining = data_len;
        let mut offset = 0;
        while remaining > 0 {
            let n = remaining.min(LINK_BLOCK_SIZE);
            let block = &body[offset..offset + n];
            if !crc_matches(block, &body[offset + n..offset + n + CRC_LEN]) {
                return None;
            }
            payload.extend_from_slice(block);
            offset += n + CRC_LEN;
            remaining -= n;
        }
        Some(payload.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogCallback;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn capturing() -> (Diagnostics, Arc<Mutex<Vec<FilterLevel>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: LogCallback = Arc::new(move |level, _msg: &str| {
            sink.lock().unwrap().push(level);
        });
        (Diagnostics::with_callback(FilterLevel::Debug, callback), seen)
    }

    fn user_data_header() -> LinkHeader {
        LinkHeader::new(
            ControlField::new(true, LinkFunction::PriUnconfirmedUserData),
            1024,
            1,
        )
    }

    #[test]
    fn test_crc_check_value() {
        assert_eq!(crc(b"123456789"), 0xEA82);
    }

    #[test]
    fn test_reset_link_states_vector() {
        let header = LinkHeader::new(
            ControlField::new(true, LinkFunction::PriResetLinkStates),
            1,
            1024,
        );
        let frame = encode_frame(&header, &[]).unwrap();
        assert_eq!(
            frame,
            vec![0x05, 0x64, 0x05, 0xC0, 0x01, 0x00, 0x00, 0x04, 0xE9, 0x21]
        );

        let mut decoder = LinkDecoder::new(Diagnostics::default());
        let frames = decoder.decode(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header, header);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_control_byte() {
        let control = ControlField::from_u8(0xC4).unwrap();
        assert!(control.dir);
        assert_eq!(control.function, LinkFunction::PriUnconfirmedUserData);
        assert_eq!(control.to_u8(), 0xC4);

        let control = ControlField::from_u8(0x0B).unwrap();
        assert_eq!(control.function, LinkFunction::SecLinkStatus);
        assert!(!control.dir);

        assert!(ControlField::from_u8(0x45).is_err());
    }

    #[test]
    fn test_frame_length_accounts_for_blocks() {
        assert_eq!(frame_len(0), 10);
        assert_eq!(frame_len(16), 28);
        assert_eq!(frame_len(17), 31);
        assert_eq!(frame_len(MAX_LINK_PAYLOAD), crate::constants::MAX_LINK_FRAME_LEN);
        assert!(encode_frame(&user_data_header(), &[0u8; 251]).is_err());
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let payload: Vec<u8> = (0..40).collect();
        let frame = encode_frame(&user_data_header(), &payload).unwrap();
        let mut decoder = LinkDecoder::new(Diagnostics::default());

        let mut frames = Vec::new();
        for b in &frame {
            frames.extend(decoder.decode(&[*b]));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &payload[..]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_resync_after_garbage() {
        let (diag, seen) = capturing();
        let frame = encode_frame(&user_data_header(), &[0xC0, 0x01]).unwrap();
        let mut input = vec![0x00, 0x05, 0xFF, 0x64];
        input.extend_from_slice(&frame);
        input.extend_from_slice(&frame);

        let mut decoder = LinkDecoder::new(diag);
        let frames = decoder.decode(&input);
        assert_eq!(frames.len(), 2);
        assert!(seen.lock().unwrap().contains(&FilterLevel::Warn));
        assert_eq!(decoder.stats().discarded_bytes, 4);
    }

    #[test]
    fn test_body_crc_failure_drops_only_that_frame() {
        let (diag, seen) = capturing();
        let good = encode_frame(&user_data_header(), &[1, 2, 3]).unwrap();
        let mut bad = good.clone();
        bad[LINK_HEADER_LEN] ^= 0x01;

        let mut input = bad;
        input.extend_from_slice(&good);
        let mut decoder = LinkDecoder::new(diag);
        let frames = decoder.decode(&input);

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &[1, 2, 3]);
        assert_eq!(decoder.stats().body_crc_errors, 1);
        assert_eq!(seen.lock().unwrap().as_slice(), &[FilterLevel::Warn]);
    }

    proptest! {
        #[test]
        fn prop_frame_round_trip(
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_LINK_PAYLOAD),
            dest in 0u16..0xFFF0,
            src in 0u16..0xFFF0,
        ) {
            let header = LinkHeader::new(
                ControlField::new(false, LinkFunction::PriUnconfirmedUserData),
                dest,
                src,
            );
            let frame = encode_frame(&header, &payload).unwrap();
            let mut decoder = LinkDecoder::new(Diagnostics::default());
            let frames = decoder.decode(&frame);
            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(frames[0].header, header);
            prop_assert_eq!(&frames[0].payload[..], &payload[..]);
        }

        #[test]
        fn prop_single_bit_flip_rejected(
            payload in proptest::collection::vec(any::<u8>(), 1..=64),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let frame = encode_frame(&user_data_header(), &payload).unwrap();
            let mut corrupted = frame.clone();
            let i = position.index(corrupted.len());
            corrupted[i] ^= 1 << bit;

            let (diag, seen) = capturing();
            let mut decoder = LinkDecoder::new(diag);
            let frames = decoder.decode(&corrupted);
            prop_assert!(frames.is_empty());
            prop_assert!(seen.lock().unwrap().contains(&FilterLevel::Warn));
        }
    }
}
