use sha2::{Digest, Sha256};

/// Running transcript over all handshake messages exchanged so far.
///
/// The raw message bytes are kept rather than incremental hasher state, so
/// the flight controller can snapshot the transcript at flight start and
/// restore it on retransmission. A retransmitted flight must hash exactly
/// once even though its messages hit the wire several times.
#[derive(Debug, Default, Clone)]
pub struct TranscriptDigest {
    raw: Vec<u8>,
}

impl TranscriptDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a complete handshake message (header + body).
    pub fn update(&mut self, message: &[u8]) {
        self.raw.extend_from_slice(message);
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.raw.clone()
    }

    pub fn restore(&mut self, snapshot: Vec<u8>) {
        self.raw = snapshot;
    }

    /// SHA-256 over the transcript so far.
    pub fn finalize(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.raw);
        hasher.finalize().into()
    }
}
