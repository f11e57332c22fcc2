//! Transport function and link channel
//!
//! Application fragments larger than one link frame are split into segments,
//! each prefixed with a one-byte header:
//!
//! ```text
//!   bit 7  FIN   last segment of the fragment
//!   bit 6  FIR   first segment of the fragment
//!   bits 0-5     sequence, incremented per segment modulo 64
//! ```
//!
//! [`LinkChannel`] bundles the frame decoder, reassembler and segmenter for one
//! connection and answers link-layer service requests.

use bytes::{Bytes, BytesMut};

use crate::constants::{MAX_SEGMENT_PAYLOAD, TRANSPORT_FIN, TRANSPORT_FIR, TRANSPORT_SEQ_MASK};
use crate::error::Dnp3Result;
use crate::link::{encode_frame, ControlField, LinkDecoder, LinkFrame, LinkFunction, LinkHeader};
use crate::logging::{Diagnostics, FilterLevel};
use crate::transport::Dnp3Transport;

/// One-byte transport header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub fin: bool,
    pub fir: bool,
    pub seq: u8,
}

impl TransportHeader {
    pub fn new(fir: bool, fin: bool, seq: u8) -> Self {
        Self {
            fin,
            fir,
            seq: seq & TRANSPORT_SEQ_MASK,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut byte = self.seq & TRANSPORT_SEQ_MASK;
        if self.fin {
            byte |= TRANSPORT_FIN;
        }
        if self.fir {
            byte |= TRANSPORT_FIR;
        }
        byte
    }

    pub fn from_u8(byte: u8) -> Self {
        Self {
            fin: byte & TRANSPORT_FIN != 0,
            fir: byte & TRANSPORT_FIR != 0,
            seq: byte & TRANSPORT_SEQ_MASK,
        }
    }
}

/// Splits fragments into link payloads
#[derive(Debug, Default)]
pub struct Segmenter {
    seq: u8,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `fragment` into segments of at most 250 bytes including the header.
    ///
    /// An empty fragment still produces one FIR|FIN segment.
    pub fn segment(&mut self, fragment: &[u8]) -> Vec<Vec<u8>> {
        let chunks: Vec<&[u8]> = if fragment.is_empty() {
            vec![fragment]
        } else {
            fragment.chunks(MAX_SEGMENT_PAYLOAD).collect()
        };

        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let header = TransportHeader::new(i == 0, i == last, self.seq);
                self.seq = (self.seq + 1) & TRANSPORT_SEQ_MASK;
                let mut segment = Vec::with_capacity(chunk.len() + 1);
                segment.push(header.to_u8());
                segment.extend_from_slice(chunk);
                segment
            })
            .collect()
    }
}

/// Rebuilds fragments from segments
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    expected_seq: Option<u8>,
    max_fragment_size: usize,
    diagnostics: Diagnostics,
}

impl Reassembler {
    pub fn new(max_fragment_size: usize, diagnostics: Diagnostics) -> Self {
        Self {
            buffer: BytesMut::new(),
            expected_seq: None,
            max_fragment_size,
            diagnostics,
        }
    }

    /// Feed one link payload; returns a fragment once FIN is seen.
    pub fn push(&mut self, payload: &[u8]) -> Option<Bytes> {
        let Some((&first, data)) = payload.split_first() else {
            self.diagnostics
                .emit(FilterLevel::Warn, "Ignoring link frame without transport header");
            return None;
        };
        let header = TransportHeader::from_u8(first);

        if header.fir {
            if !self.buffer.is_empty() {
                self.diagnostics.emit_with(FilterLevel::Warn, || {
                    format!(
                        "FIR received, discarding {} byte(s) of partial fragment",
                        self.buffer.len()
                    )
                });
            }
            self.buffer.clear();
        } else {
            match self.expected_seq {
                None => {
                    self.diagnostics
                        .emit(FilterLevel::Warn, "Segment without FIR discarded");
                    return None;
                }
                Some(expected) if expected != header.seq => {
                    self.diagnostics.emit_with(FilterLevel::Warn, || {
                        format!(
                            "Bad transport sequence: expected {}, got {}",
                            expected, header.seq
                        )
                    });
                    self.reset();
                    return None;
                }
                Some(_) => {}
            }
        }

        if self.buffer.len() + data.len() > self.max_fragment_size {
            self.diagnostics.emit_with(FilterLevel::Warn, || {
                format!(
                    "Fragment exceeds maximum size of {} bytes, discarded",
                    self.max_fragment_size
                )
            });
            self.reset();
            return None;
        }

        self.buffer.extend_from_slice(data);
        self.expected_seq = Some((header.seq + 1) & TRANSPORT_SEQ_MASK);

        if header.fin {
            self.expected_seq = None;
            Some(self.buffer.split().freeze())
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_seq = None;
    }
}

/// Output of [`LinkChannel::receive`]
#[derive(Debug, Default)]
pub struct Received {
    /// Completed application fragments
    pub fragments: Vec<Bytes>,
    /// Link-layer replies that must be written back
    pub replies: Vec<Vec<u8>>,
}

/// Link and transport layers of one connection
#[derive(Debug)]
pub struct LinkChannel {
    local: u16,
    remote: u16,
    is_master: bool,
    decoder: LinkDecoder,
    reassembler: Reassembler,
    segmenter: Segmenter,
    diagnostics: Diagnostics,
}

impl LinkChannel {
    pub fn new(
        local: u16,
        remote: u16,
        is_master: bool,
        max_fragment_size: usize,
        diagnostics: &Diagnostics,
    ) -> Self {
        let link_diag = diagnostics.for_component("link");
        Self {
            local,
            remote,
            is_master,
            decoder: LinkDecoder::new(link_diag.clone()),
            reassembler: Reassembler::new(max_fragment_size, diagnostics.for_component("transport")),
            segmenter: Segmenter::new(),
            diagnostics: link_diag,
        }
    }

    /// Process received bytes into fragments and link-service replies
    pub fn receive(&mut self, bytes: &[u8]) -> Received {
        self.diagnostics.log_packet("RX", bytes);
        let mut received = Received::default();
        for frame in self.decoder.decode(bytes) {
            self.on_frame(frame, &mut received);
        }
        received
    }

    /// Encode a fragment into wire frames addressed to the remote station
    pub fn encode(&mut self, fragment: &[u8]) -> Dnp3Result<Vec<Vec<u8>>> {
        let header = LinkHeader::new(
            ControlField::new(self.is_master, LinkFunction::PriUnconfirmedUserData),
            self.remote,
            self.local,
        );
        self.segmenter
            .segment(fragment)
            .iter()
            .map(|segment| encode_frame(&header, segment))
            .collect()
    }

    /// Encode and write a fragment in one transport write
    pub async fn send<T: Dnp3Transport>(
        &mut self,
        transport: &mut T,
        fragment: &[u8],
    ) -> Dnp3Result<()> {
        let wire: Vec<u8> = self.encode(fragment)?.concat();
        self.diagnostics.log_packet("TX", &wire);
        transport.send(&wire).await
    }

    /// Log and write link-layer replies
    pub async fn send_replies<T: Dnp3Transport>(
        &self,
        transport: &mut T,
        replies: &[Vec<u8>],
    ) -> Dnp3Result<()> {
        for reply in replies {
            self.diagnostics.log_packet("TX", reply);
            transport.send(reply).await?;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.decoder.reset();
        self.reassembler.reset();
    }

    fn on_frame(&mut self, frame: LinkFrame, received: &mut Received) {
        let header = frame.header;
        if header.destination != self.local {
            self.diagnostics.emit_with(FilterLevel::Debug, || {
                format!("Ignoring frame for address {}", header.destination)
            });
            return;
        }
        if header.source != self.remote {
            self.diagnostics.emit_with(FilterLevel::Warn, || {
                format!("Frame from unknown source {}", header.source)
            });
            return;
        }
        self.diagnostics
            .emit_with(FilterLevel::Debug, || format!("RX frame {}", frame));

        match header.control.function {
            LinkFunction::PriUnconfirmedUserData => {
                received.fragments.extend(self.reassembler.push(&frame.payload));
            }
            LinkFunction::PriConfirmedUserData => {
                received.replies.extend(self.secondary(LinkFunction::SecAck));
                received.fragments.extend(self.reassembler.push(&frame.payload));
            }
            LinkFunction::PriResetLinkStates | LinkFunction::PriTestLinkStates => {
                received.replies.extend(self.secondary(LinkFunction::SecAck));
            }
            LinkFunction::PriRequestLinkStatus => {
                received.replies.extend(self.secondary(LinkFunction::SecLinkStatus));
            }
            LinkFunction::SecAck
            | LinkFunction::SecNack
            | LinkFunction::SecLinkStatus
            | LinkFunction::SecNotSupported => {
                self.diagnostics.emit_with(FilterLevel::Debug, || {
                    format!("Secondary frame {:?} ignored", header.control.function)
                });
            }
        }
    }

    fn secondary(&self, function: LinkFunction) -> Option<Vec<u8>> {
        let header = LinkHeader::new(
            ControlField::new(self.is_master, function),
            self.remote,
            self.local,
        );
        encode_frame(&header, &[]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag() -> Diagnostics {
        Diagnostics::new(FilterLevel::Debug)
    }

    fn reassemble(segments: &[Vec<u8>]) -> Option<Bytes> {
        let mut reassembler = Reassembler::new(4096, diag());
        let mut out = None;
        for segment in segments {
            out = reassembler.push(segment);
        }
        out
    }

    #[test]
    fn test_single_segment() {
        let mut segmenter = Segmenter::new();
        let segments = segmenter.segment(&[0xC0, 0x01]);
        assert_eq!(segments, vec![vec![0xC0, 0xC0, 0x01]]);
    }

    #[test]
    fn test_multi_segment_headers() {
        let fragment: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let mut segmenter = Segmenter::new();
        let segments = segmenter.segment(&fragment);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0][0], 0x40);
        assert_eq!(segments[1][0], 0x01);
        assert_eq!(segments[2][0], 0x82);
        assert!(segments.iter().all(|s| s.len() <= 250));
        assert_eq!(&reassemble(&segments).unwrap()[..], &fragment[..]);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut segmenter = Segmenter { seq: 63 };
        let segments = segmenter.segment(&[0u8; 300]);
        assert_eq!(TransportHeader::from_u8(segments[0][0]).seq, 63);
        assert_eq!(TransportHeader::from_u8(segments[1][0]).seq, 0);
        assert_eq!(&reassemble(&segments).unwrap()[..], &[0u8; 300][..]);
    }

    #[test]
    fn test_out_of_order_segment_discards_fragment() {
        let mut segmenter = Segmenter::new();
        let mut segments = segmenter.segment(&[7u8; 600]);
        segments.swap(1, 2);
        let mut reassembler = Reassembler::new(4096, diag());
        assert!(segments.iter().all(|s| reassembler.push(s).is_none()));
    }

    #[test]
    fn test_new_fir_restarts_fragment() {
        let mut reassembler = Reassembler::new(4096, diag());
        assert!(reassembler.push(&[0x40, 1, 2]).is_none());
        let fragment = reassembler.push(&[0xC5, 9]).unwrap();
        assert_eq!(&fragment[..], &[9]);
    }

    #[test]
    fn test_oversized_fragment_dropped() {
        let mut reassembler = Reassembler::new(4, diag());
        assert!(reassembler.push(&[0x40, 1, 2, 3]).is_none());
        assert!(reassembler.push(&[0x81, 4, 5]).is_none());
    }

    #[test]
    fn test_channel_round_trip() {
        let d = diag();
        let mut master = LinkChannel::new(1, 1024, true, 2048, &d);
        let mut outstation = LinkChannel::new(1024, 1, false, 2048, &d);

        let fragment: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        let wire = master.encode(&fragment).unwrap().concat();
        assert_eq!(&wire[..4], &[0x05, 0x64, 0xFF, 0xC4]);

        let received = outstation.receive(&wire);
        assert_eq!(received.fragments.len(), 1);
        assert_eq!(&received.fragments[0][..], &fragment[..]);
        assert!(received.replies.is_empty());
    }

    #[test]
    fn test_channel_link_services() {
        let d = diag();
        let mut outstation = LinkChannel::new(1024, 1, false, 2048, &d);

        let status = LinkHeader::new(
            ControlField::new(true, LinkFunction::PriRequestLinkStatus),
            1024,
            1,
        );
        let received = outstation.receive(&encode_frame(&status, &[]).unwrap());
        assert_eq!(received.replies.len(), 1);
        assert_eq!(received.replies[0][3], 0x0B);

        let reset = LinkHeader::new(ControlField::new(true, LinkFunction::PriResetLinkStates), 1024, 1);
        let received = outstation.receive(&encode_frame(&reset, &[]).unwrap());
        assert_eq!(received.replies[0][3], 0x00);
    }

    #[test]
    fn test_channel_filters_addresses() {
        let d = diag();
        let mut master = LinkChannel::new(1, 1024, true, 2048, &d);
        let mut outstation = LinkChannel::new(1024, 1, false, 2048, &d);
        let mut other = LinkChannel::new(1, 7, true, 2048, &d);

        let wire = other.encode(&[0xC0, 0x01]).unwrap().concat();
        assert!(outstation.receive(&wire).fragments.is_empty());

        // Outstation frames addressed to us from the configured remote pass
        let wire = outstation.encode(&[0xC0, 0x81, 0x00, 0x00]).unwrap().concat();
        assert_eq!(master.receive(&wire).fragments.len(), 1);
    }
}
