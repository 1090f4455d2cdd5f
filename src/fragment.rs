//! Handshake message fragmentation and reassembly.
//!
//! DTLS handshake messages larger than the packet budget are split into
//! fragments, each carrying the 12 byte fragment header. Fragments arrive
//! out of order, duplicated or interleaved across messages, so the receive
//! side tracks per-message coverage until the full range is present.

use std::collections::VecDeque;

use log::{debug, warn};
use tinyvec::TinyVec;

use crate::message::{FragmentHeader, MessageType, Record, FRAGMENT_HEADER_LEN};
use crate::Error;

/// Split a handshake message body into fragment byte blocks.
///
/// Each block is a fragment header followed by its slice of the body. A
/// body that fits `max_fragment_size` goes out as a single block with a
/// full coverage header.
pub fn fragment(
    body: &[u8],
    msg_type: MessageType,
    message_seq: u16,
    max_fragment_size: usize,
) -> Vec<Vec<u8>> {
    let total = body.len() as u32;

    if body.len() <= max_fragment_size {
        let mut block = Vec::with_capacity(FRAGMENT_HEADER_LEN + body.len());
        FragmentHeader::full_coverage(msg_type, total, message_seq).serialize(&mut block);
        block.extend_from_slice(body);
        return vec![block];
    }

    let mut blocks = Vec::new();
    let mut offset = 0usize;

    while offset < body.len() {
        let end = (offset + max_fragment_size).min(body.len());
        let chunk = &body[offset..end];

        let header = FragmentHeader {
            msg_type,
            length: total,
            message_seq,
            fragment_offset: offset as u32,
            fragment_length: chunk.len() as u32,
        };

        let mut block = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
        header.serialize(&mut block);
        block.extend_from_slice(chunk);
        blocks.push(block);

        offset = end;
    }

    blocks
}

/// A fully reassembled inbound handshake message.
#[derive(Debug)]
pub(crate) struct Completed {
    pub message_seq: u16,
    /// True when the message completed ahead of the expected sequence.
    pub out_of_order: bool,
    /// Complete message: synthesized full coverage header plus body.
    pub bytes: Vec<u8>,
    /// The records the fragments arrived in.
    pub records: Vec<Record>,
}

#[derive(Debug)]
struct Partial {
    message_seq: u16,
    msg_type: MessageType,
    total_length: u32,
    buffer: Vec<u8>,
    /// Sorted, merged [start, end) coverage intervals.
    coverage: TinyVec<[(u32, u32); 8]>,
    records: Vec<Record>,
}

impl Partial {
    fn is_complete(&self) -> bool {
        self.coverage.len() == 1 && self.coverage[0] == (0, self.total_length)
            || self.total_length == 0
    }

    fn covers(&self, start: u32, end: u32) -> bool {
        self.coverage.iter().any(|&(s, e)| s <= start && end <= e)
    }

    fn insert_interval(&mut self, start: u32, end: u32) {
        self.coverage.push((start, end));
        self.coverage.sort_unstable();

        let mut merged: TinyVec<[(u32, u32); 8]> = TinyVec::new();
        for &(s, e) in self.coverage.iter() {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.coverage = merged;
    }
}

/// Reassembles inbound handshake messages from record payloads.
///
/// Partial messages are keyed by message sequence number, bounded by a
/// maximum buffer size. Completion is idempotent: a fragment delivered
/// twice never re-triggers a completed message.
#[derive(Debug)]
pub(crate) struct Reassembler {
    pending: VecDeque<Partial>,
    completed: VecDeque<Completed>,
    next_receive_seq: u16,
    max_pending: usize,
}

impl Reassembler {
    pub fn new(max_pending: usize) -> Self {
        Reassembler {
            pending: VecDeque::new(),
            completed: VecDeque::new(),
            next_receive_seq: 0,
            max_pending,
        }
    }

    #[cfg(test)]
    pub fn next_receive_seq(&self) -> u16 {
        self.next_receive_seq
    }

    /// Feed one handshake record. The payload may pack several fragments
    /// back to back.
    pub fn process_record(&mut self, record: Record) -> Result<(), Error> {
        let payload = record.payload.clone();
        let mut input = &payload[..];

        while !input.is_empty() {
            let (rest, header) = FragmentHeader::parse(input)
                .map_err(|_| Error::MalformedRecord(payload.len() - input.len()))?;

            if rest.len() < header.fragment_length as usize {
                return Err(Error::MalformedRecord(payload.len() - input.len()));
            }

            let (fragment, rest) = rest.split_at(header.fragment_length as usize);
            self.ingest(header, fragment, &record)?;
            input = rest;
        }

        Ok(())
    }

    fn ingest(
        &mut self,
        header: FragmentHeader,
        payload: &[u8],
        record: &Record,
    ) -> Result<(), Error> {
        let seq = header.message_seq;

        // Already delivered. Retransmitted fragments are expected and
        // must not complete the message a second time.
        if seq < self.next_receive_seq || self.completed.iter().any(|c| c.message_seq == seq) {
            debug!("Dupe fragment for delivered message_seq {}", seq);
            return Ok(());
        }

        let end = header.fragment_offset + header.fragment_length;
        if end > header.length {
            return Err(Error::ReassemblyConflict(seq));
        }

        if !self.pending.iter().any(|p| p.message_seq == seq) {
            if self.pending.len() >= self.max_pending {
                // The peer retransmits, losing the oldest incomplete
                // message is acceptable.
                if let Some(evicted) = self.pending.pop_front() {
                    warn!(
                        "Reorder buffer full, evicting incomplete message_seq {}",
                        evicted.message_seq
                    );
                }
            }

            self.pending.push_back(Partial {
                message_seq: seq,
                msg_type: header.msg_type,
                total_length: header.length,
                buffer: vec![0; header.length as usize],
                coverage: TinyVec::new(),
                records: Vec::new(),
            });
        }

        // Index instead of iter_mut to keep the borrow local.
        let idx = self
            .pending
            .iter()
            .position(|p| p.message_seq == seq)
            .unwrap();
        let partial = &mut self.pending[idx];

        // All fragments of one message must agree on its shape.
        if partial.total_length != header.length || partial.msg_type != header.msg_type {
            return Err(Error::ReassemblyConflict(seq));
        }

        if partial.covers(header.fragment_offset, end) {
            debug!(
                "Dupe fragment message_seq {} offset {}",
                seq, header.fragment_offset
            );
            return Ok(());
        }

        let start = header.fragment_offset as usize;
        partial.buffer[start..start + payload.len()].copy_from_slice(payload);
        partial.insert_interval(header.fragment_offset, end);
        partial.records.push(record.clone());

        if partial.is_complete() {
            let partial = self.pending.remove(idx).unwrap();

            let mut bytes = Vec::with_capacity(FRAGMENT_HEADER_LEN + partial.buffer.len());
            FragmentHeader::full_coverage(
                partial.msg_type,
                partial.total_length,
                partial.message_seq,
            )
            .serialize(&mut bytes);
            bytes.extend_from_slice(&partial.buffer);

            self.completed.push_back(Completed {
                message_seq: partial.message_seq,
                out_of_order: false,
                bytes,
                records: partial.records,
            });
        }

        Ok(())
    }

    /// Take the next completed message, preferring the expected sequence
    /// number. A message completing ahead of the expected sequence is
    /// still handed out, flagged as out of order.
    pub fn take_completed(&mut self) -> Option<Completed> {
        if self.completed.is_empty() {
            return None;
        }

        // Prefer the expected sequence, fall back to the smallest one.
        let idx = self
            .completed
            .iter()
            .position(|c| c.message_seq == self.next_receive_seq)
            .unwrap_or_else(|| {
                self.completed
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| c.message_seq)
                    .map(|(i, _)| i)
                    .unwrap()
            });

        let mut completed = self.completed.remove(idx).unwrap();
        completed.out_of_order = completed.message_seq != self.next_receive_seq;
        if completed.out_of_order {
            warn!(
                "Delivering out-of-order message_seq {} (expected {})",
                completed.message_seq, self.next_receive_seq
            );
        }
        // message_seq is a peer-controlled 16 bit field; the successor of
        // 0xFFFF wraps.
        self.next_receive_seq = completed.message_seq.wrapping_add(1);

        Some(completed)
    }
}
