#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use dprobe::message::{wrap_data, Sequence};
use dprobe::{
    fragment, AlertHandler, ChangeCipherSpecHandler, ContentType, Error, HandlerRegistry,
    MessageType, ProtocolVersion, RawHandshakeHandler, Transport,
};

/// Transport over a pre-scripted sequence of datagrams. Each receive pops
/// the next entry; `None` (or an exhausted script) behaves like nothing
/// arriving within the timeout. Everything sent is recorded.
pub struct ScriptedTransport {
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
    script: VecDeque<Option<Vec<u8>>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Option<Vec<u8>>>) -> (Self, Rc<RefCell<Vec<Vec<u8>>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let transport = ScriptedTransport {
            sent: sent.clone(),
            script: script.into(),
        };
        (transport, sent)
    }
}

impl Transport for ScriptedTransport {
    fn send_datagram(&mut self, datagram: &[u8]) -> Result<(), Error> {
        self.sent.borrow_mut().push(datagram.to_vec());
        Ok(())
    }

    fn receive_datagram(&mut self, _timeout: Duration) -> Result<Vec<u8>, Error> {
        match self.script.pop_front() {
            Some(Some(datagram)) => Ok(datagram),
            _ => Err(Error::Timeout),
        }
    }
}

pub const CLIENT_HELLO_BODY: &[u8] = &[0xC0; 46];
pub const HELLO_VERIFY_BODY: &[u8] = &[0x17; 20];
pub const SERVER_HELLO_BODY: &[u8] = &[0x50; 40];
pub const CERTIFICATE_BODY: &[u8] = &[0xCE; 300];
pub const SERVER_HELLO_DONE_BODY: &[u8] = &[];
pub const CLIENT_KEY_EXCHANGE_BODY: &[u8] = &[0x4B; 64];
pub const FINISHED_BODY: &[u8] = &[0xF1; 12];

/// A registry covering the plain DTLS 1.2 handshake plus alerts.
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let handshake: [(MessageType, &[u8]); 7] = [
        (MessageType::ClientHello, CLIENT_HELLO_BODY),
        (MessageType::HelloVerifyRequest, HELLO_VERIFY_BODY),
        (MessageType::ServerHello, SERVER_HELLO_BODY),
        (MessageType::Certificate, CERTIFICATE_BODY),
        (MessageType::ServerHelloDone, SERVER_HELLO_DONE_BODY),
        (MessageType::ClientKeyExchange, CLIENT_KEY_EXCHANGE_BODY),
        (MessageType::Finished, FINISHED_BODY),
    ];

    for (msg_type, body) in handshake {
        registry.register(Box::new(RawHandshakeHandler::new(msg_type, body.to_vec())));
    }
    registry.register(Box::new(ChangeCipherSpecHandler));
    registry.register(Box::new(AlertHandler::new(1, 0)));
    registry
}

fn wrap_into(
    out: &mut Vec<u8>,
    payload: &[u8],
    content_type: ContentType,
    sequence: &mut Sequence,
) {
    for record in wrap_data(
        payload,
        content_type,
        ProtocolVersion::Dtls1_2,
        sequence,
        16384,
        &[],
    ) {
        record.serialize(out);
    }
}

/// One handshake message, unfragmented, in one record.
pub fn handshake_record(
    out: &mut Vec<u8>,
    msg_type: MessageType,
    body: &[u8],
    message_seq: u16,
    sequence: &mut Sequence,
) {
    let blocks = fragment(body, msg_type, message_seq, 16384);
    for block in blocks {
        wrap_into(out, &block, ContentType::Handshake, sequence);
    }
}

/// One handshake message split into fragments of `budget` body bytes,
/// each fragment in its own datagram.
pub fn fragmented_handshake_datagrams(
    msg_type: MessageType,
    body: &[u8],
    message_seq: u16,
    epoch: u16,
    budget: usize,
) -> Vec<Vec<u8>> {
    let mut sequence = Sequence {
        epoch,
        sequence_number: 0,
    };

    fragment(body, msg_type, message_seq, budget)
        .into_iter()
        .map(|block| {
            let mut out = Vec::new();
            wrap_into(&mut out, &block, ContentType::Handshake, &mut sequence);
            out
        })
        .collect()
}

pub fn ccs_record(out: &mut Vec<u8>, sequence: &mut Sequence) {
    wrap_into(out, &[1], ContentType::ChangeCipherSpec, sequence);
}

pub fn alert_datagram(level: u8, description: u8) -> Vec<u8> {
    let mut sequence = Sequence::default();
    let mut out = Vec::new();
    wrap_into(&mut out, &[level, description], ContentType::Alert, &mut sequence);
    out
}
