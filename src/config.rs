use std::time::Duration;

use crate::message::ProtocolVersion;

/// Largest packet size we will ever produce, regardless of configuration.
const MAX_PACKET_SIZE_CAP: usize = 16397;

/// Smallest usable packet size: record header (13) + fragment header (12)
/// + one payload byte.
const MIN_PACKET_SIZE: usize = 26;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    max_packet_size: usize,
    max_record_payload: usize,
    max_wait: Duration,
    flight_retries: usize,
    max_reorder_buffer: usize,
    protocol_version: ProtocolVersion,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            max_packet_size: 1400,
            max_record_payload: 16384,
            max_wait: Duration::from_millis(3000),
            flight_retries: 4,
            max_reorder_buffer: 100,
            protocol_version: ProtocolVersion::Dtls1_2,
        }
    }

    /// The largest datagram we will send.
    ///
    /// Records are batched greedily into datagrams up to this size.
    #[inline(always)]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Max payload carried by a single record.
    ///
    /// Larger payloads are split across multiple records.
    #[inline(always)]
    pub fn max_record_payload(&self) -> usize {
        self.max_record_payload
    }

    /// How long to wait for traffic satisfying the current trace entry
    /// before the flight timeout path fires.
    #[inline(always)]
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Max number of retransmissions per flight before the run aborts.
    #[inline(always)]
    pub fn flight_retries(&self) -> usize {
        self.flight_retries
    }

    /// Max number of partially reassembled handshake messages to keep.
    ///
    /// When exceeded, the oldest incomplete message is evicted. The peer
    /// retransmits, so the loss is recoverable.
    #[inline(always)]
    pub fn max_reorder_buffer(&self) -> usize {
        self.max_reorder_buffer
    }

    /// Protocol version written into outgoing record headers.
    #[inline(always)]
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Largest handshake message payload that fits one packet: the packet
    /// budget minus the record header (13) and fragment header (12).
    pub(crate) fn max_fragment_size(&self) -> usize {
        self.max_packet_size - 25
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    max_packet_size: usize,
    max_record_payload: usize,
    max_wait: Duration,
    flight_retries: usize,
    max_reorder_buffer: usize,
    protocol_version: ProtocolVersion,
}

impl ConfigBuilder {
    /// Set the largest datagram size to produce.
    ///
    /// Values above 16397 are silently clamped to 16397. That clamping is
    /// the defined contract, not an error. Values below 26 are clamped up
    /// to 26, the smallest packet that can carry one handshake fragment
    /// byte.
    /// Defaults to 1400.
    pub fn max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE_CAP);
        self
    }

    /// Set the max payload per record.
    ///
    /// Defaults to 16384.
    pub fn max_record_payload(mut self, max_record_payload: usize) -> Self {
        self.max_record_payload = max_record_payload;
        self
    }

    /// Set the wait window per expected message.
    ///
    /// Defaults to 3000 ms.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Set the max number of retransmissions per flight.
    ///
    /// Defaults to 4.
    pub fn flight_retries(mut self, flight_retries: usize) -> Self {
        self.flight_retries = flight_retries;
        self
    }

    /// Set the max number of pending partially reassembled messages.
    ///
    /// Defaults to 100.
    pub fn max_reorder_buffer(mut self, max_reorder_buffer: usize) -> Self {
        self.max_reorder_buffer = max_reorder_buffer;
        self
    }

    /// Set the protocol version for outgoing record headers.
    ///
    /// Defaults to DTLS 1.2.
    pub fn protocol_version(mut self, protocol_version: ProtocolVersion) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Config {
        Config {
            max_packet_size: self.max_packet_size,
            max_record_payload: self.max_record_payload,
            max_wait: self.max_wait,
            flight_retries: self.flight_retries,
            max_reorder_buffer: self.max_reorder_buffer,
            protocol_version: self.protocol_version,
        }
    }
}
