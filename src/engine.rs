//! The workflow execution engine.
//!
//! Walks a [`WorkflowTrace`] entry by entry: locally issued entries are
//! prepared, fragmented, framed into records and batched into datagrams;
//! peer issued entries block on the transport until satisfying traffic
//! arrives or the flight timeout path fires. The trace is patched when the
//! peer deviates from the expectation, so a finished run always describes
//! what actually happened on the wire.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::digest::TranscriptDigest;
use crate::flight::{FlightAction, FlightController};
use crate::fragment::{fragment, Reassembler};
use crate::handler::HandlerRegistry;
use crate::message::{
    parse_datagram, wrap_data, AlertLevel, ConnectionEnd, ContentType, FragmentHeader, Record,
    Sequence, FRAGMENT_HEADER_LEN,
};
use crate::trace::WorkflowTrace;
use crate::transport::Transport;
use crate::{Config, Error};

/// Mutable per-run protocol state, passed into handlers.
///
/// All counters that a naive implementation would make global live here,
/// owned by exactly one run.
#[derive(Debug)]
pub struct RunContext {
    /// Which end this engine plays.
    pub local_end: ConnectionEnd,

    /// Running transcript over all handshake messages.
    pub digest: TranscriptDigest,

    /// Cooperative stop. Checked at the top of every iteration; a handler
    /// can set it to end the run early without an error.
    pub stop: bool,

    /// Epoch + sequence counters for outgoing records.
    pub(crate) sequence_tx: Sequence,

    /// Epoch expected on incoming records. Records from any other epoch
    /// are discarded.
    pub(crate) epoch_rx: u16,

    /// Message sequence number for the next outgoing handshake message.
    pub(crate) send_message_seq: u16,
}

impl RunContext {
    pub(crate) fn new(local_end: ConnectionEnd) -> Self {
        RunContext {
            local_end,
            digest: TranscriptDigest::new(),
            stop: false,
            sequence_tx: Sequence::default(),
            epoch_rx: 0,
            send_message_seq: 0,
        }
    }

    /// The endpoint we are talking to.
    pub fn peer_end(&self) -> ConnectionEnd {
        self.local_end.peer()
    }
}

/// Lifecycle of one workflow run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowState {
    Idle,
    Running,
    Completed,
    Aborted(Error),
}

/// Position within one run. Never shared across runs; a trace is
/// single-use.
#[derive(Debug)]
struct WorkflowCursor {
    /// Index of the next trace entry to execute.
    pointer: usize,
    /// All messages of the current receive buffer have been parsed.
    all_parsed: bool,
    /// Raw bytes the current inbound messages are parsed from.
    parse_buffer: Vec<u8>,
    parse_offset: usize,
    /// Content type the parse buffer arrived under.
    buffer_content_type: Option<ContentType>,
    /// Records the parse buffer was carried in.
    buffer_records: Vec<Record>,
}

impl WorkflowCursor {
    fn new() -> Self {
        WorkflowCursor {
            pointer: 0,
            all_parsed: true,
            parse_buffer: Vec::new(),
            parse_offset: 0,
            buffer_content_type: None,
            buffer_records: Vec::new(),
        }
    }
}

/// Drives one workflow trace over one logical connection.
pub struct WorkflowExecutor<T: Transport> {
    config: Arc<Config>,
    transport: T,
    registry: HandlerRegistry,
    trace: WorkflowTrace,

    ctx: RunContext,
    cursor: WorkflowCursor,
    flight: FlightController,
    reassembler: Reassembler,

    /// Parsed records waiting to be consumed, in arrival order.
    record_rx_buffer: VecDeque<Record>,

    /// At most one ChangeCipherSpec is held back until a CCS trace entry
    /// asks for it.
    pending_ccs: Option<Record>,

    /// Serialized records awaiting datagram batching.
    record_send_buffer: Vec<Vec<u8>>,

    state: WorkflowState,
}

impl<T: Transport> WorkflowExecutor<T> {
    pub fn new(
        config: Arc<Config>,
        transport: T,
        registry: HandlerRegistry,
        trace: WorkflowTrace,
        local_end: ConnectionEnd,
    ) -> Result<Self, Error> {
        if registry.is_empty() {
            return Err(Error::Configuration(
                "no message handlers registered".into(),
            ));
        }
        if trace.is_empty() {
            return Err(Error::Configuration("empty workflow trace".into()));
        }

        let flight = FlightController::new(config.flight_retries());
        let reassembler = Reassembler::new(config.max_reorder_buffer());

        Ok(WorkflowExecutor {
            config,
            transport,
            registry,
            trace,
            ctx: RunContext::new(local_end),
            cursor: WorkflowCursor::new(),
            flight,
            reassembler,
            record_rx_buffer: VecDeque::new(),
            pending_ccs: None,
            record_send_buffer: Vec::new(),
            state: WorkflowState::Idle,
        })
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// The trace as mutated during execution. Available for inspection
    /// regardless of outcome.
    pub fn trace(&self) -> &WorkflowTrace {
        &self.trace
    }

    pub fn into_trace(self) -> WorkflowTrace {
        self.trace
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Execute the whole trace. Consumes the run: calling this a second
    /// time is an error.
    pub fn execute(&mut self) -> Result<(), Error> {
        if self.state != WorkflowState::Idle {
            return Err(Error::AlreadyExecuted);
        }
        self.state = WorkflowState::Running;

        let result = self.run_loop();

        match &result {
            Ok(()) => {
                self.state = WorkflowState::Completed;
            }
            Err(e) => {
                if e.rolls_back_cursor() {
                    // One step back so the failing entry stays visible.
                    self.cursor.pointer = self.cursor.pointer.saturating_sub(1);
                }
                self.state = WorkflowState::Aborted(e.clone());
            }
        }

        // Entries that never executed say nothing about what happened.
        self.trace.truncate(self.cursor.pointer);

        result
    }

    fn run_loop(&mut self) -> Result<(), Error> {
        while self.cursor.pointer < self.trace.len() && !self.ctx.stop {
            let index = self.cursor.pointer;
            self.cursor.pointer += 1;

            self.flight
                .begin_or_continue(&self.trace[index], index, &self.ctx);

            if self.trace[index].issuer == self.ctx.local_end {
                self.send_local_message(index)?;
            } else {
                self.receive_peer_message(index)?;
            }
        }
        Ok(())
    }

    // --- send side -------------------------------------------------------

    fn send_local_message(&mut self, index: usize) -> Result<(), Error> {
        let content_type = self.trace[index].content_type;
        debug!("Preparing {} message to send", content_type);

        match content_type {
            ContentType::Handshake => self.send_handshake_message(index),
            ContentType::ChangeCipherSpec => self.send_change_cipher_spec(index),
            _ => self.send_other_message(index),
        }
    }

    fn prepare_via_handler(&mut self, index: usize) -> Result<Vec<u8>, Error> {
        let entry = self.trace[index].clone();
        let tag = entry.handshake_type.map(|t| t.as_u8());

        let handler = self
            .registry
            .select(entry.content_type, tag)
            .ok_or(Error::NoHandler(entry.content_type, tag.unwrap_or(0)))?;

        handler.prepare(&entry, &mut self.ctx)
    }

    fn send_handshake_message(&mut self, index: usize) -> Result<(), Error> {
        let msg_type = self.trace[index].handshake_type.ok_or_else(|| {
            Error::Configuration("handshake trace entry without a message type".into())
        })?;

        let body = self.prepare_via_handler(index)?;

        let message_seq = self.ctx.send_message_seq;
        self.ctx.send_message_seq += 1;

        // The transcript always hashes the unfragmented form.
        let mut full = Vec::with_capacity(FRAGMENT_HEADER_LEN + body.len());
        FragmentHeader::full_coverage(msg_type, body.len() as u32, message_seq)
            .serialize(&mut full);
        full.extend_from_slice(&body);
        self.ctx.digest.update(&full);

        // Each fragment gets its own record. A fragment spanning record
        // boundaries could not be reassembled by the other side.
        let blocks = fragment(&body, msg_type, message_seq, self.config.max_fragment_size());

        let mut records = Vec::new();
        for (i, block) in blocks.iter().enumerate() {
            let overrides: Vec<_> = self.trace[index]
                .record_overrides
                .get(i)
                .copied()
                .into_iter()
                .collect();

            records.extend(wrap_data(
                block,
                ContentType::Handshake,
                self.config.protocol_version(),
                &mut self.ctx.sequence_tx,
                self.config.max_record_payload(),
                &overrides,
            ));
        }

        self.trace[index].bytes = full;
        self.queue_records(index, records);

        self.flush_datagrams_if_done(index)
    }

    fn send_change_cipher_spec(&mut self, index: usize) -> Result<(), Error> {
        let bytes = self.prepare_via_handler(index)?;

        let records = wrap_data(
            &bytes,
            ContentType::ChangeCipherSpec,
            self.config.protocol_version(),
            &mut self.ctx.sequence_tx,
            self.config.max_record_payload(),
            &self.trace[index].record_overrides,
        );
        self.trace[index].bytes = bytes;
        self.queue_records(index, records);

        // Cipher state change: new epoch, sequence restarts.
        self.ctx.sequence_tx.cipher_state_change();

        self.flush_datagrams_if_done(index)
    }

    /// Alerts and application data bypass the datagram batch; they go out
    /// immediately in their own datagram.
    fn send_other_message(&mut self, index: usize) -> Result<(), Error> {
        let bytes = self.prepare_via_handler(index)?;
        let content_type = self.trace[index].content_type;

        let records = wrap_data(
            &bytes,
            content_type,
            self.config.protocol_version(),
            &mut self.ctx.sequence_tx,
            self.config.max_record_payload(),
            &self.trace[index].record_overrides,
        );
        self.trace[index].bytes = bytes;

        let mut datagram = Vec::new();
        for record in &records {
            record.serialize(&mut datagram);
        }
        self.trace[index].records = records;

        debug!(
            "Sending {} message of {} bytes",
            content_type,
            datagram.len()
        );
        self.transport.send_datagram(&datagram)
    }

    fn queue_records(&mut self, index: usize, records: Vec<Record>) {
        for record in &records {
            let mut buf = Vec::new();
            record.serialize(&mut buf);
            self.record_send_buffer.push(buf);
        }
        self.trace[index].records = records;
    }

    fn flush_datagrams_if_done(&mut self, index: usize) -> Result<(), Error> {
        if !self
            .trace
            .is_last_consecutive_from(index, self.ctx.local_end)
        {
            return Ok(());
        }
        self.flush_datagrams()
    }

    /// Batch queued records greedily into datagrams no larger than the
    /// packet budget. A record that would overflow the current datagram
    /// starts a new one.
    fn flush_datagrams(&mut self) -> Result<(), Error> {
        let max = self.config.max_packet_size();
        let mut datagram: Vec<u8> = Vec::new();

        for record in self.record_send_buffer.drain(..) {
            if !datagram.is_empty() && datagram.len() + record.len() > max {
                trace!("Flushing datagram of {} bytes", datagram.len());
                self.transport.send_datagram(&datagram)?;
                datagram.clear();
            }
            datagram.extend_from_slice(&record);
        }

        if !datagram.is_empty() {
            trace!("Flushing datagram of {} bytes", datagram.len());
            self.transport.send_datagram(&datagram)?;
        }

        Ok(())
    }

    // --- receive side ----------------------------------------------------

    fn receive_peer_message(&mut self, index: usize) -> Result<(), Error> {
        if self.cursor.all_parsed {
            let expected = self.trace[index].content_type;

            match self.wait_for_message_bytes(expected) {
                Ok((content_type, bytes, records)) => {
                    self.cursor.parse_buffer = bytes;
                    self.cursor.parse_offset = 0;
                    self.cursor.buffer_content_type = Some(content_type);
                    self.cursor.buffer_records = records;
                }
                Err(Error::Timeout) => {
                    return self.handle_receive_timeout();
                }
                Err(e) => return Err(e),
            }
        }

        self.dispatch_received(index)
    }

    fn handle_receive_timeout(&mut self) -> Result<(), Error> {
        match self.flight.on_timeout(&mut self.ctx) {
            FlightAction::Resend { restart_at } => {
                self.cursor.pointer = restart_at;
                self.cursor.all_parsed = true;
                self.cursor.parse_buffer.clear();
                self.cursor.parse_offset = 0;
                Ok(())
            }
            FlightAction::Abort { retries } => Err(Error::MaxRetriesExceeded(retries)),
        }
    }

    fn dispatch_received(&mut self, index: usize) -> Result<(), Error> {
        let buffer_ct = self
            .cursor
            .buffer_content_type
            .ok_or_else(|| Error::Handler(None, "no receive buffer to parse".into()))?;

        let offset = self.cursor.parse_offset;
        let first = *self
            .cursor
            .parse_buffer
            .get(offset)
            .ok_or_else(|| Error::Handler(None, "empty parse buffer".into()))?;

        let expected = self.trace[index].clone();

        let handler = self
            .registry
            .select(buffer_ct, Some(first))
            .ok_or(Error::NoHandler(buffer_ct, first))?;

        let matches = handler.matches_expected(&expected);
        let (mut parsed, next_offset) =
            handler.parse(&self.cursor.parse_buffer, offset, &mut self.ctx)?;

        parsed.issuer = self.ctx.local_end.peer();
        debug!("Parsed {} message from peer", parsed.content_type);

        self.cursor.parse_offset = next_offset;
        self.cursor.all_parsed = next_offset >= self.cursor.parse_buffer.len();

        if matches {
            let entry = &mut self.trace[index];
            entry.bytes = parsed.bytes.clone();
            entry.records = self.cursor.buffer_records.clone();
            if entry.handshake_type.is_none() {
                entry.handshake_type = parsed.handshake_type;
            }
        } else {
            // The peer went off script. Keep asserting about what actually
            // happened: drop the rest of the expectation, record reality.
            let err = Error::UnexpectedMessage {
                expected: expected.content_type,
                actual: parsed.content_type,
            };
            warn!("{}, patching trace", err);

            parsed.records = self.cursor.buffer_records.clone();
            self.trace.truncate(index);
            self.trace.push(parsed.clone());
        }

        match parsed.content_type {
            ContentType::Alert => {
                let level = parsed.bytes.first().copied().unwrap_or(0);
                if AlertLevel::from_u8(level) == Some(AlertLevel::Fatal) {
                    let description = parsed.bytes.get(1).copied().unwrap_or(0);
                    debug!("Workflow stopped by fatal alert {}", description);
                    return Err(Error::FatalAlertReceived(description));
                }
            }
            ContentType::Handshake => {
                self.ctx.digest.update(&parsed.bytes);
            }
            ContentType::ChangeCipherSpec => {
                self.ctx.epoch_rx += 1;
            }
            ContentType::ApplicationData => {}
        }

        Ok(())
    }

    fn wait_for_message_bytes(
        &mut self,
        expected: ContentType,
    ) -> Result<(ContentType, Vec<u8>, Vec<Record>), Error> {
        match expected {
            ContentType::Handshake => self.wait_for_handshake(),
            ContentType::ChangeCipherSpec => self.wait_for_change_cipher_spec(),
            _ => self.wait_for_other(),
        }
    }

    fn wait_for_handshake(&mut self) -> Result<(ContentType, Vec<u8>, Vec<Record>), Error> {
        let deadline = Instant::now() + self.config.max_wait();

        loop {
            if let Some(completed) = self.reassembler.take_completed() {
                if completed.out_of_order {
                    debug!(
                        "Handing out-of-order message_seq {} to the workflow",
                        completed.message_seq
                    );
                }
                return Ok((ContentType::Handshake, completed.bytes, completed.records));
            }

            let record = self.receive_next_valid_record(deadline)?;
            match record.content_type {
                ContentType::Alert => {
                    let payload = record.payload.clone();
                    return Ok((ContentType::Alert, payload, vec![record]));
                }
                ContentType::Handshake => self.feed_reassembler(record),
                ContentType::ChangeCipherSpec => self.buffer_change_cipher_spec(record),
                ContentType::ApplicationData => {
                    trace!("Ignoring application_data while expecting handshake");
                }
            }
        }
    }

    fn wait_for_change_cipher_spec(
        &mut self,
    ) -> Result<(ContentType, Vec<u8>, Vec<Record>), Error> {
        let deadline = Instant::now() + self.config.max_wait();

        loop {
            if let Some(record) = self.pending_ccs.take() {
                let payload = record.payload.clone();
                return Ok((ContentType::ChangeCipherSpec, payload, vec![record]));
            }

            let record = self.receive_next_valid_record(deadline)?;
            match record.content_type {
                ContentType::ChangeCipherSpec => self.buffer_change_cipher_spec(record),
                ContentType::Handshake => self.feed_reassembler(record),
                ContentType::Alert => {
                    let payload = record.payload.clone();
                    return Ok((ContentType::Alert, payload, vec![record]));
                }
                ContentType::ApplicationData => {
                    trace!("Ignoring application_data while expecting change_cipher_spec");
                }
            }
        }
    }

    fn wait_for_other(&mut self) -> Result<(ContentType, Vec<u8>, Vec<Record>), Error> {
        let deadline = Instant::now() + self.config.max_wait();

        loop {
            let record = self.receive_next_valid_record(deadline)?;
            match record.content_type {
                ContentType::Handshake => self.feed_reassembler(record),
                ContentType::ChangeCipherSpec => self.buffer_change_cipher_spec(record),
                content_type => {
                    let payload = record.payload.clone();
                    return Ok((content_type, payload, vec![record]));
                }
            }
        }
    }

    fn feed_reassembler(&mut self, record: Record) {
        // Malformed or conflicting fragments are absorbed here; the peer
        // retransmits anything that mattered.
        if let Err(e) = self.reassembler.process_record(record) {
            debug!("Dropping bad handshake record: {}", e);
        }
    }

    fn buffer_change_cipher_spec(&mut self, record: Record) {
        if self.pending_ccs.is_none() {
            self.pending_ccs = Some(record);
        } else {
            debug!("Dropping extra change_cipher_spec record");
        }
    }

    fn receive_next_valid_record(&mut self, deadline: Instant) -> Result<Record, Error> {
        loop {
            if let Some(record) = self.record_rx_buffer.pop_front() {
                if record.epoch == self.ctx.epoch_rx {
                    return Ok(record);
                }
                debug!(
                    "Discarding record from epoch {} (current epoch {})",
                    record.epoch, self.ctx.epoch_rx
                );
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }

            let datagram = self.transport.receive_datagram(deadline - now)?;
            let (records, err) = parse_datagram(&datagram);
            if let Some(e) = err {
                // Records parsed before the malformed one are kept.
                debug!("{}", e);
            }
            self.record_rx_buffer.extend(records);
        }
    }
}
