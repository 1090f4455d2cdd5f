mod common;

use std::sync::Arc;

use dprobe::message::parse_datagram;
use dprobe::{
    Config, ConnectionEnd, ContentType, MessageType, ProtocolMessage, RawHandshakeHandler,
    WorkflowExecutor, WorkflowState, WorkflowTrace,
};

use common::{fragmented_handshake_datagrams, registry, ScriptedTransport};

#[test]
fn outgoing_message_respects_packet_budget() {
    let _ = env_logger::try_init();

    // A certificate chain far larger than one packet.
    let body = vec![0xCE; 5000];
    let mut registry = registry();
    registry.register(Box::new(RawHandshakeHandler::new(
        MessageType::CertificateVerify,
        body.clone(),
    )));

    let trace: WorkflowTrace = [ProtocolMessage::handshake(
        ConnectionEnd::Client,
        MessageType::CertificateVerify,
    )]
    .into_iter()
    .collect();

    let (transport, sent) = ScriptedTransport::new(vec![]);
    let mut exec = WorkflowExecutor::new(
        Arc::new(Config::default()),
        transport,
        registry,
        trace,
        ConnectionEnd::Client,
    )
    .unwrap();

    exec.execute().unwrap();

    // 5000 bytes over a 1375 byte fragment budget: four fragments.
    let sent = sent.borrow();
    assert_eq!(sent.len(), 4);
    for datagram in sent.iter() {
        assert!(datagram.len() <= 1400);

        let (records, err) = parse_datagram(datagram);
        assert!(err.is_none());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_type, ContentType::Handshake);
    }

    // The fragments tile the message exactly once.
    let payload_total: usize = sent.iter().map(|d| d.len() - 13 - 12).sum();
    assert_eq!(payload_total, 5000);
}

#[test]
fn reversed_fragments_reassemble() {
    let _ = env_logger::try_init();

    let body = vec![0xAB; 3000];
    let trace: WorkflowTrace = [
        ProtocolMessage::handshake(ConnectionEnd::Server, MessageType::Certificate),
    ]
    .into_iter()
    .collect();

    let mut datagrams = fragmented_handshake_datagrams(MessageType::Certificate, &body, 0, 0, 500);
    datagrams.reverse();
    let script = datagrams.into_iter().map(Some).collect();

    let (transport, _) = ScriptedTransport::new(script);
    let mut exec = WorkflowExecutor::new(
        Arc::new(Config::default()),
        transport,
        registry(),
        trace,
        ConnectionEnd::Client,
    )
    .unwrap();

    exec.execute().unwrap();
    assert_eq!(*exec.state(), WorkflowState::Completed);

    let message = &exec.trace()[0];
    assert_eq!(message.bytes.len(), 12 + 3000);
    assert_eq!(&message.bytes[12..], &body[..]);
    // One record per fragment was consumed.
    assert_eq!(message.records.len(), 6);
}

#[test]
fn duplicated_fragments_complete_exactly_once() {
    let _ = env_logger::try_init();

    let body = vec![0x33; 1000];
    let trace: WorkflowTrace = [
        ProtocolMessage::handshake(ConnectionEnd::Server, MessageType::Certificate),
        ProtocolMessage::handshake(ConnectionEnd::Server, MessageType::ServerHelloDone),
    ]
    .into_iter()
    .collect();

    // Every fragment delivered twice, then the next message.
    let fragments = fragmented_handshake_datagrams(MessageType::Certificate, &body, 0, 0, 400);
    let mut script: Vec<Option<Vec<u8>>> = Vec::new();
    for datagram in &fragments {
        script.push(Some(datagram.clone()));
        script.push(Some(datagram.clone()));
    }
    script.extend(
        fragmented_handshake_datagrams(MessageType::ServerHelloDone, &[], 1, 0, 400)
            .into_iter()
            .map(Some),
    );

    let (transport, _) = ScriptedTransport::new(script);
    let mut exec = WorkflowExecutor::new(
        Arc::new(Config::default()),
        transport,
        registry(),
        trace,
        ConnectionEnd::Client,
    )
    .unwrap();

    exec.execute().unwrap();
    assert_eq!(*exec.state(), WorkflowState::Completed);

    let trace = exec.trace();
    assert_eq!(trace[0].bytes.len(), 12 + 1000);
    assert_eq!(trace[1].handshake_type, Some(MessageType::ServerHelloDone));
}
