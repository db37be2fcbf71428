//! Implements the VLP 1.0 framing.
//!
//! A VLP frame is laid out as
//! `report_id | device_index | feature_index | function << 3 | flags | sequence | payload`.
//! Messages whose payload exceeds a single frame are split into a transfer:
//! the first frame carries [`BEGIN`], the last one [`END`], and the sequence
//! number increments (modulo 256) from frame to frame.

use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use super::{ErrorReport, MessageClass, MessageKind, Protocol, ReportType, VLP_REPORT_ID};
use crate::{
    bitfield::{BitField, Check, Schema},
    error::{Error, Result, VlpError},
    hexlist::HexList,
};

/// Marks the first frame of a transfer.
pub const BEGIN: u8 = 0x04;

/// Marks the last frame of a transfer.
pub const END: u8 = 0x02;

/// Marks an acknowledgement frame.
pub const ACK: u8 = 0x01;

/// The length of the VLP header in octets, including the report ID.
pub const HEADER_LENGTH: usize = 5;

/// The maximum payload carried by a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 60;

/// The most payload octets a transfer may carry before its 8-bit sequence
/// number wraps.
pub const MAX_MESSAGE_PAYLOAD: usize = 256 * MAX_FRAME_PAYLOAD;

/// The feature index VLP error reports are sent with.
pub const ERROR_FEATURE_INDEX: u8 = 0xff;

/// The highest field ID a payload field may use.
pub const FIRST_PAYLOAD_FID: u8 = 0xf7;

/// Represents the header of a single VLP frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FrameHeader {
    /// The index of the device involved in the communication.
    pub device_index: u8,

    /// The VLP feature index.
    pub feature_index: u8,

    /// The VLP function index (5 bits).
    pub function_index: u8,

    /// The combination of [`BEGIN`], [`END`] and [`ACK`].
    pub flags: u8,

    /// The sequence number of the frame within its transfer.
    pub sequence: u8,
}

impl FrameHeader {
    /// Extracts the header of a raw VLP frame.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.first() != Some(&VLP_REPORT_ID) || frame.len() < HEADER_LENGTH {
            return None;
        }

        Some(Self {
            device_index: frame[1],
            feature_index: frame[2],
            function_index: frame[3] >> 3,
            flags: frame[3] & 0x07,
            sequence: frame[4],
        })
    }

    /// Serializes the header, including the report ID.
    pub fn to_bytes(self) -> [u8; HEADER_LENGTH] {
        [
            VLP_REPORT_ID,
            self.device_index,
            self.feature_index,
            self.function_index << 3 | (self.flags & 0x07),
            self.sequence,
        ]
    }

    /// Whether the frame starts a transfer.
    pub fn is_begin(&self) -> bool {
        self.flags & BEGIN != 0
    }

    /// Whether the frame ends a transfer.
    pub fn is_end(&self) -> bool {
        self.flags & END != 0
    }

    /// Whether the frame is an acknowledgement.
    pub fn is_ack(&self) -> bool {
        self.flags & ACK != 0
    }
}

fn header(function_index: u8) -> Vec<BitField> {
    vec![
        BitField::new(0xff, "report_id", 8)
            .with_default(VLP_REPORT_ID)
            .with_check(Check::list([u128::from(VLP_REPORT_ID)])),
        BitField::new(0xfe, "device_index", 8).with_default(0xffu8),
        BitField::new(0xfd, "feature_index", 8).with_alias("vlp_feature_index"),
        BitField::new(0xfc, "function_index", 5)
            .with_alias("vlp_function_id")
            .with_alias("event_index")
            .with_default(function_index),
        BitField::new(0xfb, "begin", 1).with_default(true),
        BitField::new(0xfa, "end", 1).with_default(true),
        BitField::new(0xf9, "ack", 1),
        BitField::new(0xf8, "sequence", 8),
    ]
}

fn class(
    name: &'static str,
    kind: MessageKind,
    feature_id: u16,
    index: u8,
    version: u8,
    payload: Vec<BitField>,
) -> Result<Arc<MessageClass>> {
    if index > 0x1f {
        return Err(Error::Configuration(format!(
            "{name}: index {index} does not fit into 5 bits"
        )));
    }
    if let Some(field) = payload
        .iter()
        .find(|field| field.fid() > FIRST_PAYLOAD_FID || field.fid() == 0)
    {
        return Err(Error::Configuration(format!(
            "{name}: payload field {} uses reserved fid {:#04x}",
            field.name(),
            field.fid()
        )));
    }

    let has_variable_tail = payload.iter().any(BitField::is_variable);
    let mut fields = header(index);
    fields.extend(payload);
    if kind != MessageKind::Request && !has_variable_tail {
        fields.push(BitField::variable(0x00, "padding"));
    }

    let schema = Schema::new(name, fields)?;
    Ok(Arc::new(MessageClass::from_parts(
        name,
        kind,
        Protocol::Vlp,
        feature_id,
        index,
        version,
        ReportType::Vlp,
        schema,
    )))
}

/// Creates a request class. Payloads longer than a frame are fragmented on
/// send.
pub fn request(
    name: &'static str,
    feature_id: u16,
    function_index: u8,
    version: u8,
    payload: Vec<BitField>,
) -> Result<Arc<MessageClass>> {
    class(
        name,
        MessageKind::Request,
        feature_id,
        function_index,
        version,
        payload,
    )
}

/// Creates a response class, parsed from the reassembled transfer.
pub fn response(
    name: &'static str,
    feature_id: u16,
    function_index: u8,
    version: u8,
    payload: Vec<BitField>,
) -> Result<Arc<MessageClass>> {
    class(
        name,
        MessageKind::Response,
        feature_id,
        function_index,
        version,
        payload,
    )
}

/// Creates an event class.
pub fn event(
    name: &'static str,
    feature_id: u16,
    event_index: u8,
    version: u8,
    payload: Vec<BitField>,
) -> Result<Arc<MessageClass>> {
    class(
        name,
        MessageKind::Event,
        feature_id,
        event_index,
        version,
        payload,
    )
}

/// Splits a serialized VLP message into frames of at most
/// [`MAX_FRAME_PAYLOAD`] payload octets.
///
/// Sequence numbers start at `first_sequence`. A message fitting into a single
/// frame is sent with both [`BEGIN`] and [`END`] set.
pub fn fragment(message: &[u8], first_sequence: u8) -> Result<Vec<HexList>> {
    let header = FrameHeader::parse(message)
        .ok_or_else(|| Error::InvalidArgument("not a VLP message".to_string()))?;
    let payload = &message[HEADER_LENGTH..];
    if payload.len() > MAX_MESSAGE_PAYLOAD {
        return Err(Error::OutOfRange(format!(
            "a VLP message carries at most {MAX_MESSAGE_PAYLOAD} payload octets, got {}",
            payload.len()
        )));
    }

    let chunks = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(MAX_FRAME_PAYLOAD).collect::<Vec<_>>()
    };
    let last = chunks.len() - 1;

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut flags = header.flags & ACK;
            if i == 0 {
                flags |= BEGIN;
            }
            if i == last {
                flags |= END;
            }

            let frame_header = FrameHeader {
                flags,
                sequence: first_sequence.wrapping_add(i as u8),
                ..header
            };
            HexList::from(frame_header.to_bytes()) + HexList::from(chunk)
        })
        .collect())
}

/// Parses a VLP error report.
///
/// VLP errors are sent on feature index [`ERROR_FEATURE_INDEX`] with the
/// payload `feature_index | function_index | error_code`.
pub fn parse_error(frame: &[u8]) -> Option<ErrorReport> {
    let header = FrameHeader::parse(frame)?;
    if header.feature_index != ERROR_FEATURE_INDEX || frame.len() < HEADER_LENGTH + 3 {
        return None;
    }

    Some(ErrorReport {
        device_index: header.device_index,
        error: Error::Vlp(VlpError {
            feature_index: frame[HEADER_LENGTH],
            function_index: frame[HEADER_LENGTH + 1],
            error_code: frame[HEADER_LENGTH + 2],
        }),
        report: HexList::from(frame),
    })
}

#[derive(Debug)]
struct Transfer {
    first: FrameHeader,
    next_sequence: u8,
    payload: HexList,
}

/// Reassembles multi-frame transfers, keyed by feature and function index.
#[derive(Debug, Default)]
pub struct Reassembler {
    transfers: HashMap<(u8, u8), Transfer>,
}

impl Reassembler {
    /// Creates a reassembler without partial transfers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a received frame.
    ///
    /// Returns the complete message once the frame closing a transfer
    /// arrived, with both [`BEGIN`] and [`END`] set and the sequence number of
    /// the first frame. Acknowledgements and single-frame messages are
    /// returned unchanged.
    ///
    /// A frame that does not continue its transfer returns
    /// [`Error::VlpSequence`] and discards the partial transfer. `expected` is
    /// the received sequence number if no transfer was in progress. A
    /// transfer growing past [`MAX_MESSAGE_PAYLOAD`] is discarded with
    /// [`Error::OutOfRange`].
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<HexList>> {
        let header = FrameHeader::parse(frame)
            .ok_or_else(|| Error::InvalidArgument("not a VLP frame".to_string()))?;
        let key = (header.feature_index, header.function_index);
        let payload = &frame[HEADER_LENGTH..];

        if header.is_ack() && !header.is_begin() && !header.is_end() {
            return Ok(Some(HexList::from(frame)));
        }

        if header.is_begin() {
            if self.transfers.remove(&key).is_some() {
                debug!(
                    feature_index = header.feature_index,
                    function_index = header.function_index,
                    "VLP transfer restarted before its end"
                );
            }
            if header.is_end() {
                return Ok(Some(HexList::from(frame)));
            }

            self.transfers.insert(key, Transfer {
                first: header,
                next_sequence: header.sequence.wrapping_add(1),
                payload: HexList::from(payload),
            });
            return Ok(None);
        }

        let Some(transfer) = self.transfers.get_mut(&key) else {
            return Err(Error::VlpSequence {
                expected: header.sequence,
                received: header.sequence,
            });
        };

        if header.sequence != transfer.next_sequence {
            let expected = transfer.next_sequence;
            self.transfers.remove(&key);
            return Err(Error::VlpSequence {
                expected,
                received: header.sequence,
            });
        }

        if transfer.payload.len() + payload.len() > MAX_MESSAGE_PAYLOAD {
            self.transfers.remove(&key);
            return Err(Error::OutOfRange(format!(
                "VLP transfer exceeds {MAX_MESSAGE_PAYLOAD} payload octets"
            )));
        }

        transfer.payload.extend(payload.iter().copied());
        transfer.next_sequence = transfer.next_sequence.wrapping_add(1);
        if !header.is_end() {
            return Ok(None);
        }

        let Some(transfer) = self.transfers.remove(&key) else {
            return Ok(None);
        };
        let first = FrameHeader {
            flags: (transfer.first.flags & ACK) | BEGIN | END,
            ..transfer.first
        };

        Ok(Some(HexList::from(first.to_bytes()) + transfer.payload))
    }

    /// The number of transfers in progress.
    pub fn pending(&self) -> usize {
        self.transfers.len()
    }

    /// Discards every partial transfer.
    pub fn discard_all(&mut self) {
        self.transfers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(flags: u8, sequence: u8, payload: &[u8]) -> HexList {
        HexList::from([VLP_REPORT_ID, 0x01, 0x02, 0x03 << 3 | flags, sequence])
            + HexList::from(payload)
    }

    #[test]
    fn reassembles_multi_frame_transfers() -> Result<()> {
        let mut reassembler = Reassembler::new();

        assert_eq!(reassembler.push(&frame(BEGIN, 0, &[0xaa; 60]))?, None);
        assert_eq!(reassembler.push(&frame(0, 1, &[0xbb; 60]))?, None);
        let message = reassembler.push(&frame(END, 2, &[0xcc; 20]))?.unwrap();

        assert_eq!(message.len(), HEADER_LENGTH + 140);
        let header = FrameHeader::parse(&message).unwrap();
        assert!(header.is_begin() && header.is_end());
        assert_eq!(header.function_index, 3);
        assert_eq!(&message[HEADER_LENGTH + 60..HEADER_LENGTH + 61], &[0xbb]);
        assert_eq!(reassembler.pending(), 0);
        Ok(())
    }

    #[test]
    fn endless_transfers_are_discarded() -> Result<()> {
        let mut reassembler = Reassembler::new();
        reassembler.push(&frame(BEGIN, 0, &[0; 60]))?;
        for sequence in 1..=255u8 {
            assert_eq!(reassembler.push(&frame(0, sequence, &[0; 60]))?, None);
        }

        assert!(matches!(
            reassembler.push(&frame(0, 0, &[0; 60])),
            Err(Error::OutOfRange(_))
        ));
        assert_eq!(reassembler.pending(), 0);
        Ok(())
    }

    #[test]
    fn oversized_messages_are_not_fragmented() {
        let message = frame(BEGIN | END, 0, &[0; MAX_MESSAGE_PAYLOAD + 1]);
        assert!(matches!(fragment(&message, 0), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn gaps_discard_the_transfer() -> Result<()> {
        let mut reassembler = Reassembler::new();
        reassembler.push(&frame(BEGIN, 7, &[1; 60]))?;

        assert_eq!(
            reassembler.push(&frame(END, 9, &[2; 4])),
            Err(Error::VlpSequence {
                expected: 8,
                received: 9
            })
        );
        assert_eq!(reassembler.pending(), 0);

        assert!(matches!(
            reassembler.push(&frame(END, 8, &[2; 4])),
            Err(Error::VlpSequence { .. })
        ));
        Ok(())
    }

    #[test]
    fn duplicates_discard_the_transfer() -> Result<()> {
        let mut reassembler = Reassembler::new();
        reassembler.push(&frame(BEGIN, 0xff, &[1; 60]))?;
        reassembler.push(&frame(0, 0x00, &[2; 60]))?;

        assert!(reassembler.push(&frame(0, 0x00, &[2; 60])).is_err());
        assert_eq!(reassembler.pending(), 0);
        Ok(())
    }

    #[test]
    fn single_frames_and_acks_pass_through() -> Result<()> {
        let mut reassembler = Reassembler::new();
        let single = frame(BEGIN | END, 0, &[1, 2, 3]);
        assert_eq!(reassembler.push(&single)?, Some(single));

        let ack = frame(ACK, 4, &[]);
        assert_eq!(reassembler.push(&ack)?, Some(ack));
        Ok(())
    }

    #[test]
    fn fragments_long_payloads() -> Result<()> {
        let message = frame(BEGIN | END, 0, &[0x5a; 130]);
        let frames = fragment(&message, 0x10)?;

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), HEADER_LENGTH + 60);
        assert_eq!(frames[2].len(), HEADER_LENGTH + 10);

        let headers = frames
            .iter()
            .filter_map(|frame| FrameHeader::parse(frame))
            .map(|header| (header.flags, header.sequence))
            .collect::<Vec<_>>();
        assert_eq!(headers, vec![(BEGIN, 0x10), (0, 0x11), (END, 0x12)]);

        let mut reassembler = Reassembler::new();
        let mut assembled = None;
        for frame in &frames {
            assembled = reassembler.push(frame)?;
        }
        assert_eq!(assembled.map(|m| m.len()), Some(message.len()));
        Ok(())
    }

    #[test]
    fn parses_errors() {
        let report = parse_error(&[VLP_REPORT_ID, 0x01, 0xff, 0x00, 0x00, 0x02, 0x01, 0x07]);
        assert_eq!(
            report.map(|report| report.error),
            Some(Error::Vlp(VlpError {
                feature_index: 2,
                function_index: 1,
                error_code: 7
            }))
        );
    }
}
