use nom::number::complete::{be_u16, be_u24};
use nom::IResult;

use super::MessageType;

/// The 12 byte DTLS handshake header prefixed to every fragment.
///
/// `length` is the total message length; `fragment_offset`/`fragment_length`
/// describe which slice of the message this fragment carries. An
/// unfragmented message has offset 0 and `fragment_length == length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub msg_type: MessageType,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

/// Serialized size of the fragment header.
pub const FRAGMENT_HEADER_LEN: usize = 12;

impl FragmentHeader {
    /// Header for a message small enough to go out in one piece.
    pub fn full_coverage(msg_type: MessageType, length: u32, message_seq: u16) -> Self {
        FragmentHeader {
            msg_type,
            length,
            message_seq,
            fragment_offset: 0,
            fragment_length: length,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], FragmentHeader> {
        let (input, msg_type) = MessageType::parse(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;

        Ok((
            input,
            FragmentHeader {
                msg_type,
                length,
                message_seq,
                fragment_offset,
                fragment_length,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.msg_type.as_u8());
        output.extend_from_slice(&self.length.to_be_bytes()[1..]);
        output.extend_from_slice(&self.message_seq.to_be_bytes());
        output.extend_from_slice(&self.fragment_offset.to_be_bytes()[1..]);
        output.extend_from_slice(&self.fragment_length.to_be_bytes()[1..]);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let header = FragmentHeader {
            msg_type: MessageType::Certificate,
            length: 5000,
            message_seq: 3,
            fragment_offset: 1375,
            fragment_length: 1375,
        };

        let mut out = Vec::new();
        header.serialize(&mut out);
        assert_eq!(out.len(), FRAGMENT_HEADER_LEN);

        let (rest, parsed) = FragmentHeader::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, header);
    }

    #[test]
    fn full_coverage_header() {
        let header = FragmentHeader::full_coverage(MessageType::ClientHello, 120, 0);
        assert_eq!(header.fragment_offset, 0);
        assert_eq!(header.fragment_length, 120);
    }
}
