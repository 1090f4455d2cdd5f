use nom::bytes::complete::take;
use nom::number::complete::be_u16;
use nom::IResult;

use super::{ContentType, ProtocolVersion};
use crate::util::be_u48;
use crate::Error;

/// Per-direction record counter state: epoch plus the 48 bit sequence
/// number, which restarts at zero on every cipher state change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sequence {
    pub epoch: u16,
    pub sequence_number: u64,
}

impl Sequence {
    /// Take the current value and advance the sequence number.
    pub(crate) fn advance(&mut self) -> Sequence {
        let current = *self;
        self.sequence_number = (self.sequence_number + 1) & 0xFFFF_FFFF_FFFF;
        current
    }

    /// A cipher state change bumps the epoch and restarts the sequence.
    pub(crate) fn cipher_state_change(&mut self) {
        self.epoch += 1;
        self.sequence_number = 0;
    }
}

/// A DTLS record parsed out of a datagram, borrowing its payload.
#[derive(Debug, PartialEq, Eq)]
pub struct DTLSRecord<'a> {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub epoch: u16,
    pub sequence_number: u64,
    pub length: u16,
    pub fragment: &'a [u8],
}

impl<'a> DTLSRecord<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], DTLSRecord<'a>> {
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;
        let (input, epoch) = be_u16(input)?;
        let (input, sequence_number) = be_u48(input)?;
        let (input, length) = be_u16(input)?;
        let (input, fragment) = take(length as usize)(input)?;

        Ok((
            input,
            DTLSRecord {
                content_type,
                version,
                epoch,
                sequence_number,
                length,
                fragment,
            },
        ))
    }

    pub fn to_owned(&self) -> Record {
        Record {
            content_type: self.content_type,
            version: self.version,
            epoch: self.epoch,
            sequence_number: self.sequence_number,
            length: self.length,
            payload: self.fragment.to_vec(),
        }
    }
}

/// An owned DTLS record, either received from the peer or produced by
/// [`wrap_data`]. The `length` field is normally `payload.len()`, but an
/// override can make it lie for violation testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub epoch: u16,
    pub sequence_number: u64,
    pub length: u16,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.content_type.as_u8());
        self.version.serialize(output);
        output.extend_from_slice(&self.epoch.to_be_bytes());
        output.extend_from_slice(&self.sequence_number.to_be_bytes()[2..]);
        output.extend_from_slice(&self.length.to_be_bytes());
        output.extend_from_slice(&self.payload);
    }
}

/// Field overrides applied to one outgoing record.
///
/// Every `None` field takes the engine's current value. Setting a field
/// forces that value onto the wire regardless of protocol state, which is
/// the mechanism for deliberately producing non-compliant records.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordOverride {
    pub content_type: Option<ContentType>,
    pub version: Option<ProtocolVersion>,
    pub epoch: Option<u16>,
    pub sequence_number: Option<u64>,
    pub length: Option<u16>,
}

/// Parse every record out of one datagram.
///
/// Parsing stops at the first malformed record. Records parsed before the
/// error are kept, the error is reported alongside them.
pub fn parse_datagram(datagram: &[u8]) -> (Vec<Record>, Option<Error>) {
    let mut records = Vec::new();
    let mut input = datagram;

    while !input.is_empty() {
        match DTLSRecord::parse(input) {
            Ok((rest, record)) => {
                records.push(record.to_owned());
                input = rest;
            }
            Err(_) => {
                let offset = datagram.len() - input.len();
                return (records, Some(Error::MalformedRecord(offset)));
            }
        }
    }

    (records, None)
}

/// Frame a payload into one or more records.
///
/// Payloads larger than `max_record_payload` are split across multiple
/// records. This is distinct from handshake fragmentation, which splits at
/// the message level before framing. Each produced record consumes one
/// transmit sequence number unless an override pins it.
pub fn wrap_data(
    payload: &[u8],
    content_type: ContentType,
    version: ProtocolVersion,
    sequence: &mut Sequence,
    max_record_payload: usize,
    overrides: &[RecordOverride],
) -> Vec<Record> {
    let mut records = Vec::new();

    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(max_record_payload).collect()
    };

    for (i, chunk) in chunks.into_iter().enumerate() {
        let seq = sequence.advance();
        let over = overrides.get(i).copied().unwrap_or_default();

        records.push(Record {
            content_type: over.content_type.unwrap_or(content_type),
            version: over.version.unwrap_or(version),
            epoch: over.epoch.unwrap_or(seq.epoch),
            sequence_number: over.sequence_number.unwrap_or(seq.sequence_number),
            length: over.length.unwrap_or(chunk.len() as u16),
            payload: chunk.to_vec(),
        });
    }

    records
}

#[cfg(test)]
mod test {
    use super::*;

    const RECORD: &[u8] = &[
        0x16, // ContentType::Handshake
        0xFE, 0xFD, // ProtocolVersion::Dtls1_2
        0x00, 0x01, // epoch
        0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // sequence_number
        0x00, 0x10, // length
        // fragment
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        0x10,
    ];

    #[test]
    fn roundtrip() {
        let record = Record {
            content_type: ContentType::Handshake,
            version: ProtocolVersion::Dtls1_2,
            epoch: 1,
            sequence_number: 1,
            length: 16,
            payload: RECORD[13..].to_vec(),
        };

        let mut serialized = Vec::new();
        record.serialize(&mut serialized);
        assert_eq!(serialized, RECORD);

        let (rest, parsed) = DTLSRecord::parse(&serialized).unwrap();
        assert_eq!(parsed.to_owned(), record);
        assert!(rest.is_empty());
    }

    #[test]
    fn datagram_with_two_records() {
        let mut datagram = Vec::new();
        for seq in 0..2u64 {
            Record {
                content_type: ContentType::Handshake,
                version: ProtocolVersion::Dtls1_2,
                epoch: 0,
                sequence_number: seq,
                length: 3,
                payload: vec![1, 2, 3],
            }
            .serialize(&mut datagram);
        }

        let (records, err) = parse_datagram(&datagram);
        assert!(err.is_none());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].sequence_number, 1);
    }

    #[test]
    fn truncated_record_keeps_earlier_records() {
        let mut datagram = Vec::new();
        Record {
            content_type: ContentType::Alert,
            version: ProtocolVersion::Dtls1_2,
            epoch: 0,
            sequence_number: 0,
            length: 2,
            payload: vec![1, 0],
        }
        .serialize(&mut datagram);

        // Second record declares 16 bytes but carries 2.
        datagram.extend_from_slice(&[
            0x16, 0xFE, 0xFD, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x10, 0xAA,
            0xBB,
        ]);

        let (records, err) = parse_datagram(&datagram);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_type, ContentType::Alert);
        assert!(matches!(err, Some(Error::MalformedRecord(15))));
    }

    #[test]
    fn wrap_splits_large_payload() {
        let payload = vec![0xAB; 100];
        let mut seq = Sequence::default();
        let records = wrap_data(
            &payload,
            ContentType::ApplicationData,
            ProtocolVersion::Dtls1_2,
            &mut seq,
            40,
            &[],
        );

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].payload.len(), 40);
        assert_eq!(records[2].payload.len(), 20);
        assert_eq!(records[2].sequence_number, 2);
        assert_eq!(seq.sequence_number, 3);
    }

    #[test]
    fn wrap_applies_overrides() {
        let mut seq = Sequence::default();
        let over = RecordOverride {
            epoch: Some(7),
            length: Some(999),
            ..Default::default()
        };
        let records = wrap_data(
            b"x",
            ContentType::Handshake,
            ProtocolVersion::Dtls1_2,
            &mut seq,
            1024,
            &[over],
        );

        assert_eq!(records[0].epoch, 7);
        assert_eq!(records[0].length, 999);
        assert_eq!(records[0].payload, b"x");
    }
}
