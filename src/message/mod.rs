//! Protocol message model and wire level framing.

mod handshake;
mod record;

use std::fmt;

pub use handshake::{FragmentHeader, FRAGMENT_HEADER_LEN};
pub use record::{parse_datagram, wrap_data, DTLSRecord, Record, RecordOverride, Sequence};

use nom::number::complete::be_u8;
use nom::IResult;

/// Which side of the connection a message originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    Client,
    Server,
}

impl ConnectionEnd {
    pub fn peer(&self) -> ConnectionEnd {
        match self {
            ConnectionEnd::Client => ConnectionEnd::Server,
            ConnectionEnd::Server => ConnectionEnd::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let t = match value {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            _ => return None,
        };
        Some(t)
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ContentType> {
        let (input, byte) = be_u8(input)?;
        match Self::from_u8(byte) {
            Some(t) => Ok((input, t)),
            None => Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            ))),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentType::ChangeCipherSpec => "change_cipher_spec",
            ContentType::Alert => "alert",
            ContentType::Handshake => "handshake",
            ContentType::ApplicationData => "application_data",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Dtls1_0,
    Dtls1_2,
    Unknown(u16),
}

impl ProtocolVersion {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0xFEFF => ProtocolVersion::Dtls1_0,
            0xFEFD => ProtocolVersion::Dtls1_2,
            _ => ProtocolVersion::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ProtocolVersion::Dtls1_0 => 0xFEFF,
            ProtocolVersion::Dtls1_2 => 0xFEFD,
            ProtocolVersion::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ProtocolVersion> {
        let (input, value) = nom::number::complete::be_u16(input)?;
        Ok((input, Self::from_u16(value)))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.as_u16().to_be_bytes());
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::Dtls1_2
    }
}

/// DTLS handshake message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HelloRequest,
    ClientHello,
    ServerHello,
    HelloVerifyRequest,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
    Unknown(u8),
}

impl MessageType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => MessageType::HelloRequest,
            1 => MessageType::ClientHello,
            2 => MessageType::ServerHello,
            3 => MessageType::HelloVerifyRequest,
            11 => MessageType::Certificate,
            12 => MessageType::ServerKeyExchange,
            13 => MessageType::CertificateRequest,
            14 => MessageType::ServerHelloDone,
            15 => MessageType::CertificateVerify,
            16 => MessageType::ClientKeyExchange,
            20 => MessageType::Finished,
            _ => MessageType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            MessageType::HelloRequest => 0,
            MessageType::ClientHello => 1,
            MessageType::ServerHello => 2,
            MessageType::HelloVerifyRequest => 3,
            MessageType::Certificate => 11,
            MessageType::ServerKeyExchange => 12,
            MessageType::CertificateRequest => 13,
            MessageType::ServerHelloDone => 14,
            MessageType::CertificateVerify => 15,
            MessageType::ClientKeyExchange => 16,
            MessageType::Finished => 20,
            MessageType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], MessageType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }
}

/// Alert severity, the first byte of an alert message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Fatal,
}

impl AlertLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AlertLevel::Warning),
            2 => Some(AlertLevel::Fatal),
            _ => None,
        }
    }
}

/// One entry in a [`WorkflowTrace`][crate::WorkflowTrace].
///
/// Before execution this describes an expectation: who sends what. During
/// execution the engine fills in the raw bytes that actually went over the
/// wire (or arrived from the peer) and the records that carried them, so a
/// finished trace can be inspected for what really happened.
#[derive(Debug, Clone)]
pub struct ProtocolMessage {
    /// Which end sends this message.
    pub issuer: ConnectionEnd,

    /// Wire content type of the message.
    pub content_type: ContentType,

    /// For handshake messages, the expected handshake message type.
    pub handshake_type: Option<MessageType>,

    /// Complete message bytes. For handshake messages this includes the
    /// 12 byte fragment header in unfragmented (full coverage) form.
    pub bytes: Vec<u8>,

    /// The records this message was carried in, filled during execution.
    pub records: Vec<Record>,

    /// Per-record field overrides applied when the message is framed.
    /// Leave empty for specification compliant records.
    pub record_overrides: Vec<RecordOverride>,
}

impl ProtocolMessage {
    pub fn handshake(issuer: ConnectionEnd, handshake_type: MessageType) -> Self {
        ProtocolMessage {
            issuer,
            content_type: ContentType::Handshake,
            handshake_type: Some(handshake_type),
            bytes: Vec::new(),
            records: Vec::new(),
            record_overrides: Vec::new(),
        }
    }

    pub fn change_cipher_spec(issuer: ConnectionEnd) -> Self {
        Self::non_handshake(issuer, ContentType::ChangeCipherSpec)
    }

    pub fn alert(issuer: ConnectionEnd) -> Self {
        Self::non_handshake(issuer, ContentType::Alert)
    }

    pub fn application_data(issuer: ConnectionEnd) -> Self {
        Self::non_handshake(issuer, ContentType::ApplicationData)
    }

    fn non_handshake(issuer: ConnectionEnd, content_type: ContentType) -> Self {
        ProtocolMessage {
            issuer,
            content_type,
            handshake_type: None,
            bytes: Vec::new(),
            records: Vec::new(),
            record_overrides: Vec::new(),
        }
    }

    /// Attach an override for the n:th record this message is framed into.
    pub fn with_record_override(mut self, over: RecordOverride) -> Self {
        self.record_overrides.push(over);
        self
    }
}
