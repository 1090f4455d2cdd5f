use std::ops::{Index, IndexMut};

use crate::message::{ConnectionEnd, ProtocolMessage};

/// The declarative message sequence a run executes.
///
/// Insertion order is the intended wire order. The trace is owned by
/// exactly one run and mutated during execution: entries past the cursor
/// are removed when the peer deviates from the expectation, and observed
/// unexpected messages are appended so the finished trace describes what
/// actually happened.
#[derive(Debug, Default, Clone)]
pub struct WorkflowTrace {
    messages: Vec<ProtocolMessage>,
}

impl WorkflowTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ProtocolMessage) {
        self.messages.push(message);
    }

    /// Remove every entry from `index` on.
    pub fn truncate(&mut self, index: usize) {
        self.messages.truncate(index);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ProtocolMessage> {
        self.messages.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtocolMessage> {
        self.messages.iter()
    }

    /// True when the entry at `index` is the last of an unbroken run of
    /// entries issued by `issuer`. The engine flushes its datagram batch
    /// at these points.
    pub(crate) fn is_last_consecutive_from(&self, index: usize, issuer: ConnectionEnd) -> bool {
        match self.messages.get(index + 1) {
            Some(next) => next.issuer != issuer,
            None => true,
        }
    }
}

impl Index<usize> for WorkflowTrace {
    type Output = ProtocolMessage;

    fn index(&self, index: usize) -> &ProtocolMessage {
        &self.messages[index]
    }
}

impl IndexMut<usize> for WorkflowTrace {
    fn index_mut(&mut self, index: usize) -> &mut ProtocolMessage {
        &mut self.messages[index]
    }
}

impl FromIterator<ProtocolMessage> for WorkflowTrace {
    fn from_iter<T: IntoIterator<Item = ProtocolMessage>>(iter: T) -> Self {
        WorkflowTrace {
            messages: iter.into_iter().collect(),
        }
    }
}
