//! Flight grouping and bounded retransmission.
//!
//! A flight is a consecutive run of handshake/ChangeCipherSpec trace
//! entries issued by one endpoint. The transport gives no delivery
//! guarantee, so when the peer's answering flight does not arrive within
//! the wait window the engine rolls back to the start of its own previous
//! flight and resends it. The transcript digest and the send side counters
//! roll back together with the cursor; a retransmitted message must reuse
//! its sequence number and be hashed exactly once.

use log::debug;

use crate::engine::RunContext;
use crate::message::{ConnectionEnd, ContentType, ProtocolMessage, Sequence};

/// What the engine should do after a receive timeout.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FlightAction {
    /// Roll the cursor back to `restart_at` and replay from there.
    Resend { restart_at: usize },
    /// The flight was retransmitted `retries` times with no response.
    Abort { retries: usize },
}

#[derive(Debug, Default, Clone)]
struct FlightMark {
    start: usize,
    digest_snapshot: Vec<u8>,
    send_message_seq: u16,
    sequence_tx: Sequence,
}

/// Tracks the current and previous flight. Rollback is single level: one
/// unanswered flight back, no deeper history.
#[derive(Debug)]
pub(crate) struct FlightController {
    max_retries: usize,
    last_issuer: Option<ConnectionEnd>,
    current: FlightMark,
    previous: FlightMark,
    retransmit_counter: usize,
    /// Highest flight start seen. Replaying a flight after rollback must
    /// not reset the retransmit counter, only genuine forward progress
    /// into a new flight does.
    furthest_start: Option<usize>,
}

impl FlightController {
    pub fn new(max_retries: usize) -> Self {
        FlightController {
            max_retries,
            last_issuer: None,
            current: FlightMark::default(),
            previous: FlightMark::default(),
            retransmit_counter: 0,
            furthest_start: None,
        }
    }

    /// Observe the trace entry at `index` before the engine handles it.
    ///
    /// Only handshake and ChangeCipherSpec entries belong to flights. An
    /// issuer change starts a new flight: the previous flight's start is
    /// remembered and the rollback state is snapshotted.
    pub fn begin_or_continue(&mut self, message: &ProtocolMessage, index: usize, ctx: &RunContext) {
        if !matches!(
            message.content_type,
            ContentType::Handshake | ContentType::ChangeCipherSpec
        ) {
            return;
        }

        if self.last_issuer != Some(message.issuer) {
            self.previous = self.current.clone();
            self.current = FlightMark {
                start: index,
                digest_snapshot: ctx.digest.snapshot(),
                send_message_seq: ctx.send_message_seq,
                sequence_tx: ctx.sequence_tx,
            };

            if self.furthest_start.map_or(true, |f| index > f) {
                debug!("New flight starting at trace index {}", index);
                self.furthest_start = Some(index);
                self.retransmit_counter = 0;
            }
        }

        self.last_issuer = Some(message.issuer);
    }

    /// The wait for the current (peer issued) flight timed out.
    ///
    /// Restores the transcript and send counters to the pre-flight
    /// snapshot and directs the engine to the start of the flight to
    /// resend, or aborts once the retry budget is spent.
    pub fn on_timeout(&mut self, ctx: &mut RunContext) -> FlightAction {
        if self.retransmit_counter >= self.max_retries {
            return FlightAction::Abort {
                retries: self.retransmit_counter,
            };
        }

        self.retransmit_counter += 1;
        ctx.digest.restore(self.previous.digest_snapshot.clone());
        ctx.send_message_seq = self.previous.send_message_seq;
        // A replayed flight reproduces its original records, including
        // epoch and sequence numbers. Without this a flight containing a
        // ChangeCipherSpec would bump the epoch once per retransmission.
        ctx.sequence_tx = self.previous.sequence_tx;

        debug!(
            "Flight timeout, retransmission {} of {}, rolling back to index {}",
            self.retransmit_counter, self.max_retries, self.previous.start
        );

        FlightAction::Resend {
            restart_at: self.previous.start,
        }
    }

    #[cfg(test)]
    pub fn retransmit_counter(&self) -> usize {
        self.retransmit_counter
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::MessageType;

    fn handshake(issuer: ConnectionEnd) -> ProtocolMessage {
        ProtocolMessage::handshake(issuer, MessageType::ClientHello)
    }

    fn ctx() -> RunContext {
        RunContext::new(ConnectionEnd::Client)
    }

    #[test]
    fn issuer_change_starts_new_flight() {
        let mut flight = FlightController::new(4);
        let mut ctx = ctx();

        flight.begin_or_continue(&handshake(ConnectionEnd::Client), 0, &ctx);
        ctx.digest.update(b"client_hello");
        ctx.send_message_seq = 1;

        flight.begin_or_continue(&handshake(ConnectionEnd::Server), 1, &ctx);
        assert_eq!(flight.current.start, 1);
        assert_eq!(flight.previous.start, 0);
        assert!(flight.previous.digest_snapshot.is_empty());
        assert_eq!(flight.previous.send_message_seq, 0);
    }

    #[test]
    fn alerts_do_not_belong_to_flights() {
        let mut flight = FlightController::new(4);
        let ctx = ctx();

        flight.begin_or_continue(&handshake(ConnectionEnd::Client), 0, &ctx);
        flight.begin_or_continue(&ProtocolMessage::alert(ConnectionEnd::Server), 1, &ctx);

        // The alert did not start a server flight.
        assert_eq!(flight.last_issuer, Some(ConnectionEnd::Client));
        assert_eq!(flight.current.start, 0);
    }

    #[test]
    fn timeout_rolls_back_transcript_and_counters() {
        let mut flight = FlightController::new(4);
        let mut ctx = ctx();

        flight.begin_or_continue(&handshake(ConnectionEnd::Client), 0, &ctx);
        ctx.digest.update(b"client_hello");
        ctx.send_message_seq = 1;
        ctx.sequence_tx.advance();
        flight.begin_or_continue(&handshake(ConnectionEnd::Server), 1, &ctx);

        let action = flight.on_timeout(&mut ctx);
        assert_eq!(action, FlightAction::Resend { restart_at: 0 });
        assert!(ctx.digest.raw_bytes().is_empty());
        assert_eq!(ctx.send_message_seq, 0);
        assert_eq!(ctx.sequence_tx.sequence_number, 0);
    }

    #[test]
    fn replay_does_not_reset_retry_counter() {
        let mut flight = FlightController::new(4);
        let mut ctx = ctx();

        for round in 0..3 {
            flight.begin_or_continue(&handshake(ConnectionEnd::Client), 0, &ctx);
            ctx.digest.update(b"client_hello");
            ctx.send_message_seq = 1;
            flight.begin_or_continue(&handshake(ConnectionEnd::Server), 1, &ctx);

            let action = flight.on_timeout(&mut ctx);
            assert_eq!(action, FlightAction::Resend { restart_at: 0 });
            assert_eq!(flight.retransmit_counter(), round + 1);
        }
    }

    #[test]
    fn aborts_after_max_retries() {
        let mut flight = FlightController::new(2);
        let mut ctx = ctx();

        flight.begin_or_continue(&handshake(ConnectionEnd::Client), 0, &ctx);
        ctx.digest.update(b"client_hello");
        flight.begin_or_continue(&handshake(ConnectionEnd::Server), 1, &ctx);

        assert!(matches!(
            flight.on_timeout(&mut ctx),
            FlightAction::Resend { .. }
        ));
        assert!(matches!(
            flight.on_timeout(&mut ctx),
            FlightAction::Resend { .. }
        ));
        assert_eq!(
            flight.on_timeout(&mut ctx),
            FlightAction::Abort { retries: 2 }
        );
    }

    #[test]
    fn progress_into_next_flight_resets_counter() {
        let mut flight = FlightController::new(4);
        let mut ctx = ctx();

        flight.begin_or_continue(&handshake(ConnectionEnd::Client), 0, &ctx);
        flight.begin_or_continue(&handshake(ConnectionEnd::Server), 1, &ctx);
        flight.on_timeout(&mut ctx);
        assert_eq!(flight.retransmit_counter(), 1);

        // Server flight received, client continues at index 2.
        flight.begin_or_continue(&handshake(ConnectionEnd::Client), 2, &ctx);
        assert_eq!(flight.retransmit_counter(), 0);
    }
}
