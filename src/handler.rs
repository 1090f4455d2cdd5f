//! The message handler capability boundary.
//!
//! Wire encoding of message bodies lives outside the engine. Each handler
//! owns one message type: it produces the bytes for locally issued trace
//! entries and parses received ones. Handlers are selected from a dispatch
//! table keyed on the wire type tag, never hardwired into the engine.

use log::debug;

use crate::engine::RunContext;
use crate::message::{ContentType, MessageType, ProtocolMessage};
use crate::Error;

/// Capability interface implemented once per protocol message type.
pub trait MessageHandler {
    /// Wire tag dispatch. `first_byte` is the first byte of the message
    /// being parsed (the handshake message type for handshake content);
    /// `None` when dispatching for a message we are about to produce.
    fn accepts(&self, content_type: ContentType, first_byte: Option<u8>) -> bool;

    /// Does a message this handler accepts satisfy the trace expectation?
    fn matches_expected(&self, expected: &ProtocolMessage) -> bool;

    /// Produce the message bytes for a locally issued trace entry. For
    /// handshake messages this is the body only; the engine prepends the
    /// fragment header and assigns the message sequence number.
    fn prepare(&mut self, message: &ProtocolMessage, ctx: &mut RunContext)
        -> Result<Vec<u8>, Error>;

    /// Parse one message from `bytes` starting at `offset`. Returns the
    /// parsed message and the offset of the byte after it.
    fn parse(
        &mut self,
        bytes: &[u8],
        offset: usize,
        ctx: &mut RunContext,
    ) -> Result<(ProtocolMessage, usize), Error>;
}

/// Dispatch table over registered handlers, first match wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Box<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn select(
        &mut self,
        content_type: ContentType,
        first_byte: Option<u8>,
    ) -> Option<&mut dyn MessageHandler> {
        let h = self
            .handlers
            .iter_mut()
            .find(|h| h.accepts(content_type, first_byte))?;
        Some(h.as_mut())
    }
}

/// Handler for the single byte ChangeCipherSpec message.
#[derive(Debug, Default)]
pub struct ChangeCipherSpecHandler;

impl MessageHandler for ChangeCipherSpecHandler {
    fn accepts(&self, content_type: ContentType, _first_byte: Option<u8>) -> bool {
        content_type == ContentType::ChangeCipherSpec
    }

    fn matches_expected(&self, expected: &ProtocolMessage) -> bool {
        expected.content_type == ContentType::ChangeCipherSpec
    }

    fn prepare(
        &mut self,
        _message: &ProtocolMessage,
        _ctx: &mut RunContext,
    ) -> Result<Vec<u8>, Error> {
        Ok(vec![1])
    }

    fn parse(
        &mut self,
        bytes: &[u8],
        offset: usize,
        ctx: &mut RunContext,
    ) -> Result<(ProtocolMessage, usize), Error> {
        if offset >= bytes.len() {
            return Err(Error::Handler(None, "empty change_cipher_spec".into()));
        }
        if bytes[offset] != 1 {
            debug!("ChangeCipherSpec with unexpected value {}", bytes[offset]);
        }

        let mut message = ProtocolMessage::change_cipher_spec(ctx.peer_end());
        message.bytes = bytes[offset..offset + 1].to_vec();
        Ok((message, offset + 1))
    }
}

/// Handler for two byte alert messages (level, description).
#[derive(Debug)]
pub struct AlertHandler {
    /// Level to send for locally issued alerts.
    pub level: u8,
    /// Description to send for locally issued alerts.
    pub description: u8,
}

impl AlertHandler {
    pub fn new(level: u8, description: u8) -> Self {
        AlertHandler { level, description }
    }
}

impl MessageHandler for AlertHandler {
    fn accepts(&self, content_type: ContentType, _first_byte: Option<u8>) -> bool {
        content_type == ContentType::Alert
    }

    fn matches_expected(&self, expected: &ProtocolMessage) -> bool {
        expected.content_type == ContentType::Alert
    }

    fn prepare(
        &mut self,
        _message: &ProtocolMessage,
        _ctx: &mut RunContext,
    ) -> Result<Vec<u8>, Error> {
        Ok(vec![self.level, self.description])
    }

    fn parse(
        &mut self,
        bytes: &[u8],
        offset: usize,
        ctx: &mut RunContext,
    ) -> Result<(ProtocolMessage, usize), Error> {
        if offset + 2 > bytes.len() {
            return Err(Error::Handler(None, "truncated alert".into()));
        }

        let mut message = ProtocolMessage::alert(ctx.peer_end());
        message.bytes = bytes[offset..offset + 2].to_vec();
        Ok((message, offset + 2))
    }
}

/// Pass-through handshake handler carrying opaque body bytes.
///
/// Useful when the test only cares about message flow, not body contents:
/// it sends the configured body verbatim and accepts any body on parse.
pub struct RawHandshakeHandler {
    msg_type: MessageType,
    body: Vec<u8>,
}

impl RawHandshakeHandler {
    pub fn new(msg_type: MessageType, body: Vec<u8>) -> Self {
        RawHandshakeHandler { msg_type, body }
    }
}

impl MessageHandler for RawHandshakeHandler {
    fn accepts(&self, content_type: ContentType, first_byte: Option<u8>) -> bool {
        content_type == ContentType::Handshake
            && first_byte.map_or(true, |b| b == self.msg_type.as_u8())
    }

    fn matches_expected(&self, expected: &ProtocolMessage) -> bool {
        expected.content_type == ContentType::Handshake
            && expected.handshake_type == Some(self.msg_type)
    }

    fn prepare(
        &mut self,
        _message: &ProtocolMessage,
        _ctx: &mut RunContext,
    ) -> Result<Vec<u8>, Error> {
        Ok(self.body.clone())
    }

    fn parse(
        &mut self,
        bytes: &[u8],
        offset: usize,
        ctx: &mut RunContext,
    ) -> Result<(ProtocolMessage, usize), Error> {
        use crate::message::{FragmentHeader, FRAGMENT_HEADER_LEN};

        let (_, header) = FragmentHeader::parse(&bytes[offset..])
            .map_err(|_| Error::Handler(Some(self.msg_type), "truncated handshake header".into()))?;

        let end = offset + FRAGMENT_HEADER_LEN + header.length as usize;
        if end > bytes.len() {
            return Err(Error::Handler(
                Some(self.msg_type),
                "handshake body shorter than declared length".into(),
            ));
        }

        let mut message = ProtocolMessage::handshake(ctx.peer_end(), header.msg_type);
        message.bytes = bytes[offset..end].to_vec();
        Ok((message, end))
    }
}
